//! Hosted (test harness) platform: plain mutex, process abort, no MPU.
//!
//! Unlike the target build, a host has an operating system underneath, and
//! this heap is an ordinary library there rather than the process allocator,
//! so the lock and the abort path can lean on std instead of raw syscalls.

use std::io::Write;
use std::sync::{Mutex, MutexGuard};

/// Hosts have no MPU; quarantined runs stay unprotected.
pub type PlatformMpu = crate::mpu::NoMpu;

/// Interrupt context cannot exist on a hosted build.
#[inline(always)]
pub fn assert_not_isr() {}

/// Report unrecoverable corruption and kill the process. The message goes
/// to stderr unbuffered so a test harness or crash reporter sees it even
/// though the process dies immediately after.
#[cold]
#[inline(never)]
pub fn fatal(msg: &str) -> ! {
    let mut stderr = std::io::stderr().lock();
    let _ = stderr.write_all(msg.as_bytes());
    let _ = stderr.flush();
    drop(stderr);
    std::process::abort()
}

/// The bridge-level lock standing in for the scheduler suspension a real
/// executive provides. There is exactly one of these per process, guarding
/// the router singleton, so it simply wraps the OS mutex.
pub struct PortLock {
    inner: Mutex<()>,
}

impl PortLock {
    pub const fn new() -> Self {
        PortLock {
            inner: Mutex::new(()),
        }
    }

    pub fn acquire(&self) -> PortLockGuard<'_> {
        // A panicking holder poisons the mutex; the heap state itself is
        // guarded by its own integrity checks, so keep serving.
        let guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        PortLockGuard { _inner: guard }
    }
}

pub struct PortLockGuard<'a> {
    _inner: MutexGuard<'a, ()>,
}
