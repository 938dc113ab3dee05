//! Synchronisation primitives for state that is shared between physical cores
//!
//! The hypervisor never sleeps and never schedules, so every lock in it is a spin lock.
#![no_std]

mod spin_lock;

pub use spin_lock::{Guard, SpinLock, WouldBlock};
