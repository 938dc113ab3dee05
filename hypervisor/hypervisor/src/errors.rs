use allocators::AllocError;
use arm::mem::PagingError;
use thiserror_no_std::Error;

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    #[error("the page pool is exhausted")]
    OutOfMemory,
    #[error("cell id {id} does not fit into a VMID")]
    CellIdOverflow { id: u32 },
    #[error("cannot identity map {size:#x} bytes at {addr:#x} with a single page")]
    RegionTooLarge { addr: u64, size: u64 },
    #[error("stage-2 translation of {addr:#x} failed")]
    TranslationFault { addr: u64 },
    #[error("{addr:#x} is not mapped")]
    NotMapped { addr: u64 },
    #[error("{addr:#x} is outside of the translatable address range")]
    AddressOutOfRange { addr: u64 },
    #[error("{addr:#x} is not page aligned")]
    Misaligned { addr: u64 },
    #[error("cell {id} has no stage-2 translation tables")]
    CellUninitialized { id: u32 },
    #[error("VA->PA check failed, expected {expected:#x}, got {actual:?}")]
    SanityCheckFailed { expected: u64, actual: Option<u64> },
}

impl From<PagingError> for Error {
    fn from(value: PagingError) -> Self {
        match value {
            PagingError::OutOfMemory => Error::OutOfMemory,
            PagingError::NotMapped { addr } => Error::NotMapped { addr },
            PagingError::AddressOutOfRange { addr, .. } => Error::AddressOutOfRange { addr },
            PagingError::Misaligned { addr } => Error::Misaligned { addr },
        }
    }
}

impl From<AllocError> for Error {
    fn from(_: AllocError) -> Self {
        Error::OutOfMemory
    }
}
