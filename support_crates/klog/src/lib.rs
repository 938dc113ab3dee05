//! Logging backend of the hypervisor
//!
//! The hypervisor uses the [`log`] facade everywhere.
//! [`HypLogger`] is the implementation that routes records to a [`Console`], usually the
//! [`Uart8250`] debug console that the system configuration designates.
#![no_std]

mod console;
mod hyp_logger;

pub use console::{Console, ConsoleWriter, Uart8250};
pub use hyp_logger::HypLogger;
