//! Platform split: bare-metal FreeRTOS targets vs. hosted builds.
//!
//! The heap core never locks on its own; the C bridge serialises every
//! public operation through [`PortLock`]: scheduler suspension on target,
//! the OS mutex on hosts. The same split selects the MPU backend and the
//! fatal-error sink.

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod freertos;
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use freertos as sys;

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub mod hosted;
#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub use hosted as sys;

pub use sys::{assert_not_isr, fatal, PlatformMpu, PortLock};
