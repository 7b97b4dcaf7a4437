//! Multi-zone router.
//!
//! Orders up to [`MAX_ZONES`] page zones (fast on-chip memory first, slower
//! external memory after) and routes each allocation through the currently
//! selected policy: a primary zone, an optional secondary, then every other
//! initialised zone in index order. Deallocation dispatches by pointer
//! ownership.
//!
//! The router performs no locking of its own; the bridge serialises calls.

use crate::config::MAX_ZONES;
use crate::platform::{self, PlatformMpu};
use crate::zone::PageZone;
use core::ptr;

/// Zone selection policy for subsequent allocations.
#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ZoneSelector {
    /// Fast zone with fallback to slow.
    Any = 0,
    /// Fast zone first.
    Fast = 1,
    /// Slow zone first.
    Slow = 2,
    /// Fast zone with fallback.
    FastPrefer = 3,
    /// Slow zone with fallback.
    SlowPrefer = 4,
}

impl ZoneSelector {
    /// Decode a raw C enum value; unknown values fall back to `Any`.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => ZoneSelector::Fast,
            2 => ZoneSelector::Slow,
            3 => ZoneSelector::FastPrefer,
            4 => ZoneSelector::SlowPrefer,
            _ => ZoneSelector::Any,
        }
    }

    pub fn as_raw(self) -> u32 {
        self as u32
    }
}

/// One heap region handed to [`ZoneRouter::define_regions`]. Matches the
/// layout of the FreeRTOS `HeapRegion_t`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct HeapRegion {
    pub start: *mut u8,
    pub size_bytes: usize,
}

struct ZoneRoute {
    primary: usize,
    secondary: usize,
    try_secondary: bool,
}

/// Router over the configured zones.
pub struct ZoneRouter {
    zones: [PageZone; MAX_ZONES],
    active_zones: usize,
    selector: ZoneSelector,
    initialized: bool,
}

impl ZoneRouter {
    pub const fn new() -> Self {
        const ZONE: PageZone = PageZone::new(PlatformMpu::new());
        ZoneRouter {
            zones: [ZONE; MAX_ZONES],
            active_zones: 0,
            selector: ZoneSelector::Any,
            initialized: false,
        }
    }

    /// Initialise zones from a null-terminated region array: iteration stops
    /// at the first entry with a null start or zero size, or at
    /// [`MAX_ZONES`]. Called once at startup, before the scheduler runs.
    ///
    /// # Safety
    /// `regions` must be null or point to a region array terminated as
    /// described, and every region must be exclusively owned by the heap.
    pub unsafe fn define_regions(&mut self, regions: *const HeapRegion) {
        if regions.is_null() {
            return;
        }

        self.active_zones = 0;
        self.selector = ZoneSelector::Any;
        self.initialized = false;

        let mut cursor = regions;
        while self.active_zones < MAX_ZONES
            && !(*cursor).start.is_null()
            && (*cursor).size_bytes != 0
        {
            let index = self.active_zones;
            self.zones[index].init((*cursor).start, (*cursor).size_bytes, index as u8);
            log::info!(
                "heap zone {}: {} bytes ({} pages) at {:p}",
                index,
                self.zones[index].total_bytes(),
                self.zones[index].total_bytes() / crate::config::PAGE_SIZE,
                (*cursor).start
            );
            self.active_zones += 1;
            cursor = cursor.add(1);
        }

        if self.active_zones == 0 {
            platform::fatal("guardheap: no usable heap zones defined\n");
        }
        self.initialized = true;
    }

    /// Zeroise every zone and forget the region layout.
    pub fn reset_state(&mut self) {
        for zone in &mut self.zones {
            zone.reset();
        }
        self.active_zones = 0;
        self.selector = ZoneSelector::Any;
        self.initialized = false;
        log::info!("heap state reset");
    }

    fn resolve_route(&self) -> ZoneRoute {
        match self.selector {
            ZoneSelector::Fast => ZoneRoute {
                primary: 0,
                secondary: 0,
                try_secondary: false,
            },
            ZoneSelector::Slow => ZoneRoute {
                primary: 1,
                secondary: 1,
                try_secondary: false,
            },
            ZoneSelector::SlowPrefer => ZoneRoute {
                primary: 1,
                secondary: 0,
                try_secondary: true,
            },
            ZoneSelector::Any | ZoneSelector::FastPrefer => ZoneRoute {
                primary: 0,
                secondary: 1,
                try_secondary: true,
            },
        }
    }

    /// Allocate through the selector's route: primary, optional secondary,
    /// then any other initialised zone in index order.
    ///
    /// # Safety
    /// All configured regions must still be valid.
    pub unsafe fn allocate(&mut self, size: usize) -> *mut u8 {
        let route = self.resolve_route();

        if route.primary < self.active_zones && self.zones[route.primary].is_initialized() {
            let p = self.zones[route.primary].allocate(size);
            if !p.is_null() {
                return p;
            }
        }

        if route.try_secondary
            && route.secondary < self.active_zones
            && route.secondary != route.primary
            && self.zones[route.secondary].is_initialized()
        {
            let p = self.zones[route.secondary].allocate(size);
            if !p.is_null() {
                return p;
            }
        }

        for index in 0..self.active_zones {
            if index == route.primary {
                continue;
            }
            if route.try_secondary && index == route.secondary {
                continue;
            }
            if !self.zones[index].is_initialized() {
                continue;
            }
            let p = self.zones[index].allocate(size);
            if !p.is_null() {
                return p;
            }
        }

        ptr::null_mut()
    }

    /// Dispatch a free to the owning zone. A pointer owned by no zone is a
    /// caller bug and fatal; after a full reset there are no zones and the
    /// call is a no-op.
    ///
    /// # Safety
    /// `ptr` must be null or a pointer returned by [`ZoneRouter::allocate`].
    pub unsafe fn deallocate(&mut self, ptr: *mut u8) {
        if ptr.is_null() || !self.initialized {
            return;
        }

        for index in 0..self.active_zones {
            if self.zones[index].is_initialized() && self.zones[index].owns_pointer(ptr) {
                self.zones[index].deallocate(ptr);
                return;
            }
        }

        platform::fatal("guardheap: pointer does not belong to any heap zone\n");
    }

    /// Zero-filled allocation through primary and secondary only.
    ///
    /// # Safety
    /// Same as [`ZoneRouter::allocate`].
    pub unsafe fn calloc(&mut self, count: usize, elem_size: usize) -> *mut u8 {
        let route = self.resolve_route();

        let mut result = ptr::null_mut();
        if route.primary < self.active_zones && self.zones[route.primary].is_initialized() {
            result = self.zones[route.primary].calloc(count, elem_size);
        }
        if result.is_null()
            && route.try_secondary
            && route.secondary < self.active_zones
            && route.secondary != route.primary
            && self.zones[route.secondary].is_initialized()
        {
            result = self.zones[route.secondary].calloc(count, elem_size);
        }
        result
    }

    pub fn set_selector(&mut self, selector: ZoneSelector) {
        self.selector = selector;
    }

    pub fn selector(&self) -> ZoneSelector {
        self.selector
    }

    pub fn zone_count(&self) -> usize {
        self.active_zones
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn free_heap_size(&self) -> usize {
        self.zones[..self.active_zones]
            .iter()
            .map(|z| z.free_bytes())
            .sum()
    }

    pub fn minimum_ever_free_heap_size(&self) -> usize {
        self.zones[..self.active_zones]
            .iter()
            .map(|z| z.min_ever_free_bytes())
            .sum()
    }

    pub fn total_heap_size(&self) -> usize {
        self.zones[..self.active_zones]
            .iter()
            .map(|z| z.total_bytes())
            .sum()
    }

    pub fn used_heap_size(&self) -> usize {
        self.total_heap_size() - self.free_heap_size()
    }

    pub fn successful_allocs(&self) -> usize {
        self.zones[..self.active_zones]
            .iter()
            .map(|z| z.successful_allocs())
            .sum()
    }

    pub fn successful_frees(&self) -> usize {
        self.zones[..self.active_zones]
            .iter()
            .map(|z| z.successful_frees())
            .sum()
    }

    pub fn zone_free_bytes(&self, index: usize) -> usize {
        if index < self.active_zones {
            self.zones[index].free_bytes()
        } else {
            0
        }
    }

    pub fn zone_total_bytes(&self, index: usize) -> usize {
        if index < self.active_zones {
            self.zones[index].total_bytes()
        } else {
            0
        }
    }

    pub fn zone_min_free_bytes(&self, index: usize) -> usize {
        if index < self.active_zones {
            self.zones[index].min_ever_free_bytes()
        } else {
            0
        }
    }

    pub fn zone_used_bytes(&self, index: usize) -> usize {
        if index < self.active_zones {
            self.zones[index].used_bytes()
        } else {
            0
        }
    }

    /// True iff `ptr` is owned by the zone at `index`.
    pub fn zone_owns_pointer(&self, index: usize, ptr: *const u8) -> bool {
        index < self.active_zones && self.zones[index].owns_pointer(ptr)
    }

    /// Verify quarantine and live blocks of every initialised zone.
    pub fn validate_heap(&self) -> bool {
        let mut ok = true;
        for zone in &self.zones[..self.active_zones] {
            if !zone.is_initialized() {
                continue;
            }
            ok = ok && zone.verify_quarantine();
            ok = ok && zone.verify_allocated();
        }
        ok
    }
}
