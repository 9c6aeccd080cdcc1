//! x86 implementations of the hardware seams.

use x86_64::instructions::port::Port;

use super::{Clock, PortIo};

/// Direct `in`/`out` access to the I/O port space.
///
/// Construction is unsafe: the caller asserts that this object is the only
/// path to the ports it will be used on (port-mapped devices are not
/// re-entrant) and that the CPL permits port access.
pub struct RawPortIo(());

impl RawPortIo {
    /// # Safety
    ///
    /// See the type-level contract.
    pub const unsafe fn new() -> Self {
        RawPortIo(())
    }
}

impl PortIo for RawPortIo {
    fn read_u8(&mut self, port: u16) -> u8 {
        unsafe { Port::new(port).read() }
    }

    fn write_u8(&mut self, port: u16, value: u8) {
        unsafe { Port::new(port).write(value) }
    }

    fn read_u16(&mut self, port: u16) -> u16 {
        unsafe { Port::<u16>::new(port).read() }
    }

    fn write_u16(&mut self, port: u16, value: u16) {
        unsafe { Port::<u16>::new(port).write(value) }
    }
}

/// Read the time-stamp counter.
///
/// Returns a 64-bit cycle count. On CPUs with an invariant TSC this
/// increments at a constant rate regardless of frequency scaling.
#[inline(always)]
pub fn read_tsc() -> u64 {
    let low: u32;
    let high: u32;

    // RDTSC returns the 64-bit TSC in EDX:EAX.
    unsafe {
        core::arch::asm!(
            "rdtsc",
            out("eax") low,
            out("edx") high,
            options(nostack, nomem, preserves_flags)
        );
    }

    ((high as u64) << 32) | (low as u64)
}

/// TSC-backed millisecond clock.
///
/// The cycles-per-millisecond ratio comes from whatever calibration the
/// embedding kernel performed at boot (typically against the PIT).
pub struct TscClock {
    cycles_per_ms: u64,
}

impl TscClock {
    pub fn new(cycles_per_ms: u64) -> Self {
        assert!(cycles_per_ms > 0);
        TscClock { cycles_per_ms }
    }
}

impl Clock for TscClock {
    fn now_ms(&self) -> u64 {
        read_tsc() / self.cycles_per_ms
    }
}
