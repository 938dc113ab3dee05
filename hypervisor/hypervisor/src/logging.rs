use crate::config::{MemoryRegion, SystemConfig};
use crate::cpu::Cpu;
use crate::errors::Error;
use crate::mmu_hyp::HypMmu;
use allocators::PageAllocator;
use arm::mem::{page_offset, VAddr};
use klog::{HypLogger, Uart8250};
use log::Level;

/// The logger of the hypervisor.
///
/// [`init_logging()`] installs it. Output only appears once the debug console is attached.
pub static LOGGER: HypLogger<Uart8250> = HypLogger::new(Level::Debug);

/// Install [`LOGGER`] and route its output to the debug console of `config`, mapped at `virt`.
///
/// The logger stays installed even if the console cannot be mapped.
pub fn init_logging<C: Cpu, A: PageAllocator>(
    hyp: &HypMmu<'_, C, A>,
    config: &SystemConfig<'_>,
    virt: VAddr,
) -> Result<(), Error> {
    if LOGGER.install().is_err() {
        log::debug!("a logger was installed before, keeping it");
    }
    init_debug_console(hyp, &LOGGER, &config.debug_console, virt)
}

/// Map the debug console at `virt` and route log output to it
pub fn init_debug_console<C: Cpu, A: PageAllocator>(
    hyp: &HypMmu<'_, C, A>,
    logger: &HypLogger<Uart8250>,
    console: &MemoryRegion,
    virt: VAddr,
) -> Result<(), Error> {
    if page_offset(virt) != page_offset(console.phys_start) {
        return Err(Error::Misaligned { addr: virt });
    }
    hyp.map_device(
        console.phys_start - page_offset(console.phys_start),
        virt - page_offset(virt),
        console.size + page_offset(virt),
    )?;

    // Safety: the register block was just mapped as device memory and stays mapped
    let uart = unsafe { Uart8250::new(virt as usize) };
    if logger.attach_console(uart).is_some() {
        log::debug!("replaced the previous debug console");
    }
    log::info!(
        "debug console at {:#x} mapped to {virt:#x}",
        console.phys_start
    );
    Ok(())
}
