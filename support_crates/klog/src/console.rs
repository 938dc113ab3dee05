use core::fmt;
use core::ptr;

/// A character sink that log output is written to
pub trait Console: Send {
    fn write_byte(&mut self, byte: u8);
}

/// Adapter that makes any [`Console`] usable with [`fmt::Write`].
///
/// Line feeds are expanded to carriage return + line feed since serial terminals expect that.
pub struct ConsoleWriter<'a, C: Console + ?Sized>(pub &'a mut C);

impl<C: Console + ?Sized> fmt::Write for ConsoleWriter<'_, C> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.0.write_byte(b'\r');
            }
            self.0.write_byte(byte);
        }
        Ok(())
    }
}

/// Index of the transmit holding register
const UART_TX: usize = 0x0;
/// Index of the line status register
const UART_LSR: usize = 0x5;
/// Transmit holding register empty
const UART_LSR_THRE: u32 = 1 << 5;

/// Polling driver for an 8250 compatible UART whose registers are 32-bit wide and 4-byte strided.
///
/// This is the debug console found on Allwinner SoCs (e.g. the Banana Pi).
pub struct Uart8250 {
    base: *mut u32,
}

// Safety: The register block is only accessed through the SpinLock of the logger that owns the console
unsafe impl Send for Uart8250 {}

impl Uart8250 {
    /// Create a driver for the UART whose register block is mapped at `base`.
    ///
    /// # Safety
    /// `base` must be the virtual address of a device mapping of the UART registers that stays valid for as long as
    /// the driver is used.
    pub const unsafe fn new(base: usize) -> Self {
        Self {
            base: base as *mut u32,
        }
    }

    fn read_reg(&self, index: usize) -> u32 {
        unsafe { ptr::read_volatile(self.base.add(index)) }
    }

    fn write_reg(&mut self, index: usize, value: u32) {
        unsafe { ptr::write_volatile(self.base.add(index), value) }
    }
}

impl Console for Uart8250 {
    fn write_byte(&mut self, byte: u8) {
        while self.read_reg(UART_LSR) & UART_LSR_THRE == 0 {
            core::hint::spin_loop();
        }
        self.write_reg(UART_TX, byte as u32);
    }
}
