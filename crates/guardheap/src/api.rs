//! C bridge: the FreeRTOS heap-port entry points.
//!
//! A process-wide router instance is reachable from the flat C names the
//! executive's port layer expects. Every operation is serialised through the
//! platform lock (scheduler suspension on target, the OS mutex on hosts)
//! and asserts that it is not running in interrupt context.
#![allow(non_snake_case)]

use crate::platform::{self, PortLock};
use crate::router::{HeapRegion, ZoneRouter, ZoneSelector};
use core::cell::UnsafeCell;
use core::ffi::c_void;
use core::ptr;

/// Heap statistics record, layout-compatible with the FreeRTOS
/// `HeapStats_t`. Only the fields a page allocator can report are
/// populated; the block-granularity fields stay zero.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct HeapStats {
    pub available_heap_space_in_bytes: usize,
    pub size_of_largest_free_block_in_bytes: usize,
    pub size_of_smallest_free_block_in_bytes: usize,
    pub number_of_free_blocks: usize,
    pub minimum_ever_free_bytes_remaining: usize,
    pub number_of_successful_allocations: usize,
    pub number_of_successful_frees: usize,
}

struct RouterHolder(UnsafeCell<ZoneRouter>);

// The holder is only touched under HEAP_LOCK.
unsafe impl Sync for RouterHolder {}

static ROUTER: RouterHolder = RouterHolder(UnsafeCell::new(ZoneRouter::new()));
static HEAP_LOCK: PortLock = PortLock::new();

/// # Safety
/// Caller must hold `HEAP_LOCK`.
#[inline(always)]
unsafe fn router() -> &'static mut ZoneRouter {
    &mut *ROUTER.0.get()
}

#[cfg(feature = "malloc-failed-hook")]
extern "C" {
    fn vApplicationMallocFailedHook();
}

/// Allocate `size` bytes from the routed zones.
///
/// # Safety
/// Heap regions must have been defined via [`vPortDefineHeapRegions`].
#[no_mangle]
pub unsafe extern "C" fn pvPortMalloc(size: usize) -> *mut c_void {
    platform::assert_not_isr();
    let p = {
        let _lock = HEAP_LOCK.acquire();
        router().allocate(size)
    };
    if p.is_null() {
        log::warn!("pvPortMalloc({}) failed", size);
        #[cfg(feature = "malloc-failed-hook")]
        vApplicationMallocFailedHook();
    }
    p as *mut c_void
}

/// Return a block to its owning zone. Freeing null is a no-op; freeing a
/// pointer no zone owns is fatal.
///
/// # Safety
/// `pv` must be null or a live pointer returned by this heap.
#[no_mangle]
pub unsafe extern "C" fn vPortFree(pv: *mut c_void) {
    if pv.is_null() {
        return;
    }
    platform::assert_not_isr();
    let _lock = HEAP_LOCK.acquire();
    router().deallocate(pv as *mut u8);
}

/// Overflow-checked zero-filled allocation.
///
/// # Safety
/// Same as [`pvPortMalloc`].
#[no_mangle]
pub unsafe extern "C" fn pvPortCalloc(count: usize, size: usize) -> *mut c_void {
    platform::assert_not_isr();
    let p = {
        let _lock = HEAP_LOCK.acquire();
        router().calloc(count, size)
    };
    p as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn xPortGetFreeHeapSize() -> usize {
    let _lock = HEAP_LOCK.acquire();
    router().free_heap_size()
}

#[no_mangle]
pub unsafe extern "C" fn xPortGetMinimumEverFreeHeapSize() -> usize {
    let _lock = HEAP_LOCK.acquire();
    router().minimum_ever_free_heap_size()
}

/// Populate the caller's stats record.
///
/// # Safety
/// `stats` must be null or point to a writable [`HeapStats`].
#[no_mangle]
pub unsafe extern "C" fn vPortGetHeapStats(stats: *mut HeapStats) {
    if stats.is_null() {
        return;
    }
    let _lock = HEAP_LOCK.acquire();
    let r = router();
    ptr::write(
        stats,
        HeapStats {
            available_heap_space_in_bytes: r.free_heap_size(),
            minimum_ever_free_bytes_remaining: r.minimum_ever_free_heap_size(),
            number_of_successful_allocations: r.successful_allocs(),
            number_of_successful_frees: r.successful_frees(),
            ..HeapStats::default()
        },
    );
}

/// Kept for heap_4.c drop-in compatibility; this allocator needs no block
/// list seeding.
#[no_mangle]
pub extern "C" fn vPortInitialiseBlocks() {}

/// Zeroise every zone.
///
/// # Safety
/// No live pointers may be used after the reset.
#[no_mangle]
pub unsafe extern "C" fn vPortHeapResetState() {
    let _lock = HEAP_LOCK.acquire();
    router().reset_state();
}

/// Initialise zones from a null-terminated `HeapRegion` array. Runs in the
/// startup phase before the scheduler, so it takes no lock, matching the
/// stock heap_5 contract.
///
/// # Safety
/// See [`ZoneRouter::define_regions`].
#[no_mangle]
pub unsafe extern "C" fn vPortDefineHeapRegions(regions: *const HeapRegion) {
    router().define_regions(regions);
}

/// Select the zone routing policy for subsequent allocations.
#[no_mangle]
pub unsafe extern "C" fn heapZoneSet(zone: u32) {
    let _lock = HEAP_LOCK.acquire();
    router().set_selector(ZoneSelector::from_raw(zone));
}

#[no_mangle]
pub unsafe extern "C" fn heapZoneGet() -> u32 {
    let _lock = HEAP_LOCK.acquire();
    router().selector().as_raw()
}

#[no_mangle]
pub unsafe extern "C" fn heapZoneGetCount() -> usize {
    let _lock = HEAP_LOCK.acquire();
    router().zone_count()
}

#[no_mangle]
pub unsafe extern "C" fn heapZoneGetFreeBytes(index: usize) -> usize {
    let _lock = HEAP_LOCK.acquire();
    router().zone_free_bytes(index)
}

#[no_mangle]
pub unsafe extern "C" fn heapZoneGetTotalBytes(index: usize) -> usize {
    let _lock = HEAP_LOCK.acquire();
    router().zone_total_bytes(index)
}

#[no_mangle]
pub unsafe extern "C" fn heapZoneGetMinimumFreeBytes(index: usize) -> usize {
    let _lock = HEAP_LOCK.acquire();
    router().zone_min_free_bytes(index)
}

#[no_mangle]
pub unsafe extern "C" fn heapZoneGetUsedBytes(index: usize) -> usize {
    let _lock = HEAP_LOCK.acquire();
    router().zone_used_bytes(index)
}

/// Verify quarantine and live blocks of every zone, for host test harnesses
/// and debug consoles.
///
/// # Safety
/// Heap regions must still be valid.
#[no_mangle]
pub unsafe extern "C" fn xHeapValidate() -> i32 {
    let _lock = HEAP_LOCK.acquire();
    router().validate_heap() as i32
}

/// True iff the zone at `index` owns `ptr`; used by tests and diagnostics.
///
/// # Safety
/// `ptr` is only inspected, never dereferenced.
#[no_mangle]
pub unsafe extern "C" fn xHeapZoneOwnsPointer(index: usize, ptr: *const c_void) -> i32 {
    let _lock = HEAP_LOCK.acquire();
    router().zone_owns_pointer(index, ptr as *const u8) as i32
}
