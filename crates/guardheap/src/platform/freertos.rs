//! Bare-metal FreeRTOS platform: scheduler-suspension lock, IPSR check and
//! the ARMv7-M MPU backend.

use crate::config::{MPU_FIRST_REGION, MPU_REGION_COUNT};
use crate::mpu::MpuGuard;
use core::sync::atomic::{AtomicU32, Ordering};

extern "C" {
    fn vTaskSuspendAll();
    fn xTaskResumeAll() -> i32;
}

#[cfg(feature = "mpu-protection")]
pub type PlatformMpu = ArmV7Mpu;
#[cfg(not(feature = "mpu-protection"))]
pub type PlatformMpu = crate::mpu::NoMpu;

/// The heap must never run in interrupt context.
#[inline]
pub fn assert_not_isr() {
    let ipsr: u32;
    unsafe {
        core::arch::asm!("mrs {}, IPSR", out(reg) ipsr, options(nomem, nostack));
    }
    if ipsr != 0 {
        fatal("guardheap: heap operation in interrupt context\n");
    }
}

/// Halt the core. There is no stderr on target; the diagnostic string is
/// kept in the binary for a debugger to find.
#[cold]
#[inline(never)]
pub fn fatal(_msg: &str) -> ! {
    unsafe {
        core::arch::asm!("cpsid i", options(nomem, nostack));
    }
    loop {
        core::hint::spin_loop();
    }
}

/// Serialises heap operations by suspending the task scheduler, the same
/// primitive the stock FreeRTOS heaps use.
pub struct PortLock;

impl PortLock {
    pub const fn new() -> Self {
        PortLock
    }

    pub fn acquire(&self) -> PortLockGuard<'_> {
        unsafe { vTaskSuspendAll() };
        PortLockGuard { _lock: self }
    }
}

pub struct PortLockGuard<'a> {
    _lock: &'a PortLock,
}

impl Drop for PortLockGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            xTaskResumeAll();
        }
    }
}

// ARMv7-M MPU registers.
const MPU_RNR: *mut u32 = 0xE000_ED98 as *mut u32;
const MPU_RBAR: *mut u32 = 0xE000_ED9C as *mut u32;
const MPU_RASR: *mut u32 = 0xE000_EDA0 as *mut u32;

const RASR_ENABLE: u32 = 1;
/// AP = 0b110: read-only for privileged and unprivileged code.
const RASR_AP_RO: u32 = 0b110 << 24;
/// Normal memory, write-through cacheable, shareable.
const RASR_ATTR: u32 = (1 << 17) | (1 << 18);

/// Regions currently claimed by the heap, shared across zones because the
/// MPU is one hardware block. Bit i covers region MPU_FIRST_REGION + i.
static REGIONS_IN_USE: AtomicU32 = AtomicU32::new(0);

/// Read-only window provider backed by the ARMv7-M MPU. Regions
/// `MPU_FIRST_REGION .. MPU_FIRST_REGION + MPU_REGION_COUNT` are reserved
/// for the heap; the rest belong to the application.
pub struct ArmV7Mpu;

impl ArmV7Mpu {
    pub const fn new() -> Self {
        ArmV7Mpu
    }
}

impl MpuGuard for ArmV7Mpu {
    fn protect(&mut self, addr: usize, size: usize) -> i32 {
        debug_assert!(size.is_power_of_two() && size >= 32);
        debug_assert!(addr % size == 0);

        let mut claimed = None;
        for slot in 0..MPU_REGION_COUNT {
            let bit = 1u32 << slot;
            let mask = REGIONS_IN_USE.load(Ordering::Relaxed);
            if mask & bit == 0
                && REGIONS_IN_USE
                    .compare_exchange(mask, mask | bit, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                claimed = Some(slot);
                break;
            }
        }
        let Some(slot) = claimed else {
            return -1;
        };

        let region = MPU_FIRST_REGION + slot;
        let size_field = (size.trailing_zeros() - 1) << 1;
        unsafe {
            MPU_RNR.write_volatile(region);
            MPU_RBAR.write_volatile(addr as u32);
            MPU_RASR.write_volatile(RASR_ENABLE | size_field | RASR_ATTR | RASR_AP_RO);
            core::arch::asm!("dsb", "isb", options(nostack));
        }
        region as i32
    }

    fn unprotect(&mut self, region: i32) {
        let Some(slot) = (region as u32).checked_sub(MPU_FIRST_REGION) else {
            return;
        };
        if slot >= MPU_REGION_COUNT {
            return;
        }
        unsafe {
            MPU_RNR.write_volatile(region as u32);
            MPU_RASR.write_volatile(0);
            core::arch::asm!("dsb", "isb", options(nostack));
        }
        REGIONS_IN_USE.fetch_and(!(1u32 << slot), Ordering::Release);
    }

    fn available(&self) -> bool {
        true
    }
}
