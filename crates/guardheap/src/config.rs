//! Compile-time configuration for the page heap.
//!
//! Everything here is a build-time constant: the geometry sizes the static
//! bitmaps and quarantine tables, so there is deliberately no runtime knob.

/// Size of one allocation page in bytes. Every allocation occupies an
/// integer number of pages.
pub const PAGE_SIZE: usize = 1024;

/// Size of the block header record in bytes.
pub const HEADER_SIZE: usize = 32;

/// Size of the block footer record in bytes.
pub const FOOTER_SIZE: usize = 32;

/// Maximum number of memory zones the router manages.
pub const MAX_ZONES: usize = 2;

/// Maximum number of pages a single zone may contain (10 MiB / 1 KiB).
pub const MAX_PAGES_PER_ZONE: u16 = 10240;

/// Number of recently-freed runs the quarantine table retains per zone.
pub const QUARANTINE_CAPACITY: usize = 32;

/// Header magic: "HEAD".
pub const HEADER_MAGIC: u32 = 0x4845_4144;

/// Footer magic: "FOOT".
pub const FOOTER_MAGIC: u32 = 0x464F_4F54;

/// Fill byte for the padding tail of a block's last page.
pub const PADDING_BYTE: u8 = 0xFE;

/// Fill byte painted over a payload when the block enters quarantine.
pub const QUARANTINE_FILL_BYTE: u8 = 0xCD;

/// Fill byte for pages recycled out of quarantine.
pub const CLEARED_PAGE_BYTE: u8 = 0x00;

/// Paint freed payloads with [`QUARANTINE_FILL_BYTE`].
pub const FILL_ON_FREE: bool = cfg!(feature = "fill-on-free");

/// Zero pages when they are evicted from quarantine.
pub const CLEAR_ON_EVICT: bool = cfg!(feature = "clear-on-evict");

/// Validate every live block's guards on each alloc/free.
pub const CHECK_ALL_ALLOCATED: bool = cfg!(feature = "check-allocated");

/// Quarantine scan depth performed before every alloc/free:
///   0 -- disabled
///   1 -- header + footer of each quarantined run
///   2 -- additionally the quarantine fill of the payload
///   3 -- additionally the padding pattern
pub const QUARANTINE_CHECK_LEVEL: u8 = if cfg!(feature = "check-level-0") {
    0
} else if cfg!(feature = "check-level-1") {
    1
} else if cfg!(feature = "check-level-2") {
    2
} else {
    3
};

/// First hardware MPU region the heap may claim.
pub const MPU_FIRST_REGION: u32 = 4;

/// Number of consecutive MPU regions available to the heap.
pub const MPU_REGION_COUNT: u32 = 2;

// One page must fit a header, a footer and at least one payload byte.
const _: () = assert!(PAGE_SIZE >= HEADER_SIZE + FOOTER_SIZE + 1);
const _: () = assert!(MAX_ZONES >= 1);
const _: () = assert!(QUARANTINE_CAPACITY >= 1);
