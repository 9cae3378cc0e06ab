#![deny(unsafe_op_in_unsafe_fn)]

pub mod affinity;
pub mod cache_info;
pub mod error;
pub mod mmap;
pub mod pagemap;
pub mod perf;
pub mod sysfs;

pub use error::{Error, IoKind, Result};

use core::fmt::Debug;
use core::ptr;

/// Timing building blocks of the prime+probe loops.
///
/// The engine only talks to the hardware through this trait, so it can run
/// against a recording implementation in tests.
pub trait TimingPrimitives: Debug {
    /// Load one word at `addr` between two full memory fences.
    ///
    /// # Safety
    /// `addr` must be valid for reads of a `u32`.
    unsafe fn fenced_read(&self, addr: *const u8) -> u64;

    /// Wait for every preceding instruction to retire.
    fn serialize(&self);

    fn read_cycle_counter_low32(&self) -> u32;

    /// Store that bypasses the cache hierarchy.
    ///
    /// # Safety
    /// `addr` must be valid and aligned for writes of a `u32`.
    unsafe fn nontemporal_store32(&self, addr: *mut u32, value: u32);
}

pub unsafe fn maccess<T>(p: *const T) -> T {
    unsafe { ptr::read_volatile(p) }
}

#[cfg(target_arch = "x86_64")]
mod x86 {
    use super::TimingPrimitives;
    use core::arch::asm;
    use core::arch::x86_64 as arch_x86;
    use core::sync::atomic::{compiler_fence, Ordering};

    /// Fixed function counter 1 (unhalted core cycles).
    const RDPMC_FIXED_CORE_CYCLES: u32 = 0x4000_0001;

    /// x86_64 primitives reading the fixed cycle counter with `rdpmc`.
    ///
    /// `rdpmc` faults unless a cycle event is active on the core, see
    /// [`crate::perf::PerformanceCounter`].
    #[derive(Debug, Default, Clone, Copy)]
    pub struct RdpmcPrimitives;

    impl TimingPrimitives for RdpmcPrimitives {
        #[inline(always)]
        unsafe fn fenced_read(&self, addr: *const u8) -> u64 {
            unsafe {
                arch_x86::_mm_mfence();
                let value = super::maccess(addr as *const u32);
                arch_x86::_mm_mfence();
                value as u64
            }
        }

        #[inline(always)]
        fn serialize(&self) {
            // mfence orders the preceding non-temporal stores.
            unsafe {
                arch_x86::_mm_mfence();
                arch_x86::__cpuid(0);
            }
        }

        #[inline(always)]
        fn read_cycle_counter_low32(&self) -> u32 {
            let low: u32;
            compiler_fence(Ordering::SeqCst);
            unsafe {
                asm!(
                    "rdpmc",
                    in("ecx") RDPMC_FIXED_CORE_CYCLES,
                    out("eax") low,
                    out("edx") _,
                    options(nostack, nomem, preserves_flags),
                );
            }
            compiler_fence(Ordering::SeqCst);
            low
        }

        #[inline(always)]
        unsafe fn nontemporal_store32(&self, addr: *mut u32, value: u32) {
            unsafe { arch_x86::_mm_stream_si32(addr as *mut i32, value as i32) }
        }
    }
}

#[cfg(target_arch = "x86_64")]
pub use x86::RdpmcPrimitives;
