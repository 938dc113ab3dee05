//! Memory management primitives of the VMSAv8-64 translation system
//!
//! Only the 4 KiB translation granule is supported.
//! With it, every table level resolves 9 bits of the input address and tables are exactly one page large:
//!
//! ```text
//!  47      39 38      30 29      21 20      12 11           0
//! ┌──────────┬──────────┬──────────┬──────────┬──────────────┐
//! │ level 0  │ level 1  │ level 2  │ level 3  │ page offset  │
//! └──────────┴──────────┴──────────┴──────────┴──────────────┘
//! ```
//!
//! Leaves at level 1 map 1 GiB blocks, leaves at level 2 map 2 MiB blocks and leaves at level 3 map 4 KiB pages.

mod addr;
mod descriptor;
mod mapping;
mod page_table;
mod paging;

pub use addr::*;
pub use descriptor::*;
pub use mapping::*;
pub use page_table::*;
pub use paging::*;

pub const PAGESIZE: usize = 4096;
