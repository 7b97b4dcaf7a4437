//! Single-zone page allocator.
//!
//! A zone owns one contiguous region carved into fixed-size pages and tracks
//! it with two parallel bitmaps: `in_use` marks pages owned by a live *or*
//! quarantined block (nothing new may land there), `allocated` marks pages
//! owned by a live block only. The split is what lets the allocator keep
//! freed pages reserved while still answering "is this a live block?" in
//! constant time.
//!
//! The zone performs no locking; the caller serialises all operations.

use crate::bitmap::PageBitmap;
use crate::config::{
    CHECK_ALL_ALLOCATED, CLEAR_ON_EVICT, FILL_ON_FREE, FOOTER_SIZE, HEADER_SIZE,
    MAX_PAGES_PER_ZONE, PAGE_SIZE, QUARANTINE_CHECK_LEVEL,
};
use crate::guard;
use crate::mpu::MpuGuard;
use crate::platform::{self, PlatformMpu};
use crate::quarantine::{QuarantineEntry, QuarantineTable};
use crate::util::{align_down, floor_pow2};
use core::ptr;

/// Page allocator for one contiguous memory zone.
pub struct PageZone<M: MpuGuard = PlatformMpu> {
    base: *mut u8,
    region_size: usize,
    total_pages: u16,
    zone_index: u8,
    initialized: bool,

    /// 1 = live or quarantined, 0 = free to allocate.
    in_use: PageBitmap,
    /// 1 = live block only.
    allocated: PageBitmap,

    quarantine: QuarantineTable,

    sequence_counter: u32,
    free_pages: usize,
    min_ever_free_pages: usize,
    successful_allocs: usize,
    successful_frees: usize,

    mpu: M,
}

impl<M: MpuGuard> PageZone<M> {
    pub const fn new(mpu: M) -> Self {
        PageZone {
            base: ptr::null_mut(),
            region_size: 0,
            total_pages: 0,
            zone_index: 0,
            initialized: false,
            in_use: PageBitmap::new(),
            allocated: PageBitmap::new(),
            quarantine: QuarantineTable::new(),
            sequence_counter: 0,
            free_pages: 0,
            min_ever_free_pages: 0,
            successful_allocs: 0,
            successful_frees: 0,
            mpu,
        }
    }

    /// One-shot initialisation from a raw region. Re-initialising an already
    /// live zone is a caller bug and fatal; reset first.
    ///
    /// # Safety
    /// `base` must point to `size` bytes owned exclusively by this zone for
    /// as long as the zone is in use.
    pub unsafe fn init(&mut self, base: *mut u8, size: usize, zone_index: u8) {
        if base.is_null() {
            platform::fatal("guardheap: zone init with null base\n");
        }
        if size < PAGE_SIZE {
            platform::fatal("guardheap: zone smaller than one page\n");
        }
        if self.initialized {
            platform::fatal("guardheap: zone double init\n");
        }

        let pages = size / PAGE_SIZE;
        if pages > MAX_PAGES_PER_ZONE as usize {
            platform::fatal("guardheap: zone exceeds page limit\n");
        }

        self.base = base;
        self.region_size = size;
        self.total_pages = pages as u16;
        self.zone_index = zone_index;

        self.in_use.init(self.total_pages);
        self.allocated.init(self.total_pages);
        self.quarantine.init();

        self.sequence_counter = 0;
        self.free_pages = pages;
        self.min_ever_free_pages = pages;
        self.successful_allocs = 0;
        self.successful_frees = 0;

        self.initialized = true;
    }

    /// Wholesale zeroisation back to the never-initialised state.
    pub fn reset(&mut self) {
        self.base = ptr::null_mut();
        self.region_size = 0;
        self.total_pages = 0;
        self.zone_index = 0;
        self.in_use.init(0);
        self.allocated.init(0);
        self.quarantine.init();
        self.sequence_counter = 0;
        self.free_pages = 0;
        self.min_ever_free_pages = 0;
        self.successful_allocs = 0;
        self.successful_frees = 0;
        self.initialized = false;
    }

    /// Pages required to hold header + payload + footer.
    fn pages_needed(requested_size: usize) -> Option<u16> {
        if requested_size > u32::MAX as usize {
            return None;
        }
        let total = HEADER_SIZE
            .checked_add(requested_size)?
            .checked_add(FOOTER_SIZE)?;
        let pages = total.div_ceil(PAGE_SIZE);
        if pages > MAX_PAGES_PER_ZONE as usize {
            return None;
        }
        Some(pages as u16)
    }

    fn page_address(&self, page: u16) -> *mut u8 {
        unsafe { self.base.add(page as usize * PAGE_SIZE) }
    }

    /// First-fit allocation of `requested_size` bytes. Returns null on an
    /// empty request, an uninitialised zone, or when no free run exists.
    ///
    /// # Safety
    /// The zone's backing region must still be valid.
    pub unsafe fn allocate(&mut self, requested_size: usize) -> *mut u8 {
        if !self.initialized || requested_size == 0 {
            return ptr::null_mut();
        }
        let Some(pages) = Self::pages_needed(requested_size) else {
            return ptr::null_mut();
        };
        if pages as usize > self.free_pages {
            return ptr::null_mut();
        }

        self.run_pre_op_checks();

        let Some(start_page) = self.in_use.find_free_run(pages) else {
            return ptr::null_mut();
        };

        let sequence = self.sequence_counter;
        self.sequence_counter = self.sequence_counter.wrapping_add(1);

        self.in_use.set_range(start_page, pages);
        self.allocated.set_range(start_page, pages);

        let header = self.page_address(start_page);
        guard::write_header(
            header,
            requested_size as u32,
            start_page,
            pages,
            self.zone_index,
            sequence,
        );
        guard::write_footer(
            header.add(guard::footer_offset(requested_size)),
            requested_size as u32,
            start_page,
            pages,
            self.zone_index,
            sequence,
        );

        let padding = guard::padding_len(pages, requested_size);
        if padding > 0 {
            guard::fill_padding(header.add(guard::padding_offset(requested_size)), padding);
        }

        self.free_pages -= pages as usize;
        if self.free_pages < self.min_ever_free_pages {
            self.min_ever_free_pages = self.free_pages;
        }
        self.successful_allocs += 1;

        header.add(HEADER_SIZE)
    }

    /// Guarded deallocation: validate both guard records, park the run in
    /// quarantine (recycling whatever the table evicts) and clear the
    /// live-block bitmap. Quarantined pages stay reserved in `in_use`.
    ///
    /// Corruption of either record, a foreign zone index or a second free of
    /// the same block is fatal.
    ///
    /// # Safety
    /// `user_ptr` must be null or a pointer returned by [`PageZone::allocate`]
    /// on this zone.
    pub unsafe fn deallocate(&mut self, user_ptr: *mut u8) {
        if !self.initialized || user_ptr.is_null() {
            return;
        }

        let header = user_ptr.sub(HEADER_SIZE);
        if !guard::validate_header(header) {
            platform::fatal("guardheap: block header corrupted\n");
        }
        let record = guard::read_header(header);
        let footer = header.add(guard::footer_offset(record.requested_size as usize));
        if !guard::validate_footer(footer) {
            platform::fatal("guardheap: block footer corrupted\n");
        }
        if !guard::validate_pair(header, footer) {
            platform::fatal("guardheap: header/footer mismatch\n");
        }
        if record.zone_index != self.zone_index {
            platform::fatal("guardheap: block belongs to another zone\n");
        }

        let start_page = record.start_page;
        let page_count = record.page_count;
        if start_page as u32 + page_count as u32 > self.total_pages as u32 {
            platform::fatal("guardheap: block range exceeds zone\n");
        }
        if !self.allocated.test(start_page) {
            platform::fatal("guardheap: double free detected\n");
        }

        self.run_pre_op_checks();

        if let Some(evicted) =
            self.quarantine
                .add(start_page, page_count, record.requested_size, self.zone_index)
        {
            self.recycle(evicted);
        }

        if FILL_ON_FREE {
            guard::fill_quarantine_payload(user_ptr, record.requested_size as usize);
        }

        self.allocated.clear_range(start_page, page_count);

        self.update_mpu_protection(start_page, page_count);

        self.successful_frees += 1;
    }

    /// Overflow-checked zero-filled allocation.
    ///
    /// # Safety
    /// Same as [`PageZone::allocate`].
    pub unsafe fn calloc(&mut self, count: usize, elem_size: usize) -> *mut u8 {
        if count > 0 && elem_size > usize::MAX / count {
            return ptr::null_mut();
        }
        let total = count * elem_size;
        let user_ptr = self.allocate(total);
        if !user_ptr.is_null() {
            ptr::write_bytes(user_ptr, 0, total);
        }
        user_ptr
    }

    /// Return an evicted quarantine run to the free pool.
    unsafe fn recycle(&mut self, entry: QuarantineEntry) {
        if entry.mpu_region >= 0 {
            self.mpu.unprotect(entry.mpu_region);
        }
        if CLEAR_ON_EVICT {
            guard::clear_pages(
                self.page_address(entry.start_page),
                entry.page_count as usize * PAGE_SIZE,
            );
        }
        self.in_use.clear_range(entry.start_page, entry.page_count);
        self.free_pages += entry.page_count as usize;
        log::debug!(
            "zone {}: recycled {} page(s) at page {}",
            self.zone_index,
            entry.page_count,
            entry.start_page
        );
    }

    /// Cover the just-quarantined run (coalesced with neighbouring
    /// non-allocated pages) with one read-only MPU window. Best effort:
    /// a failed or impossible protect leaves the run unprotected.
    fn update_mpu_protection(&mut self, start_page: u16, page_count: u16) {
        if !self.mpu.available() {
            return;
        }

        // Grow the window over neighbours that are free or quarantined.
        let mut region_start = start_page;
        let mut region_end = start_page + page_count;
        while region_start > 0 && !self.allocated.test(region_start - 1) {
            region_start -= 1;
        }
        while region_end < self.total_pages && !self.allocated.test(region_end) {
            region_end += 1;
        }

        let base = self.base as usize;
        let page_addr = |page: u16| base + page as usize * PAGE_SIZE;

        let region_bytes = (region_end - region_start) as usize * PAGE_SIZE;
        let mut protect_size = floor_pow2(region_bytes);
        let mut protect_addr = align_down(page_addr(region_start), protect_size);

        // MPU windows are power-of-two sized and naturally aligned. Probe
        // from the largest candidate down, re-anchoring at the freed block;
        // below one page the window is not worth a region.
        loop {
            let fits = protect_addr >= page_addr(region_start)
                && protect_addr + protect_size <= page_addr(region_end);
            if fits {
                break;
            }
            if protect_size <= PAGE_SIZE {
                return;
            }
            protect_size /= 2;
            protect_addr = align_down(page_addr(start_page), protect_size);
        }

        let quarantine = &mut self.quarantine;
        let mpu = &mut self.mpu;
        let window_end = protect_addr + protect_size;

        // Release regions fully subsumed by the new window.
        for index in 0..QuarantineTable::capacity() {
            let entry = quarantine.entry_at_mut(index);
            if !entry.active || entry.mpu_region < 0 {
                continue;
            }
            let entry_start = base + entry.start_page as usize * PAGE_SIZE;
            let entry_end = entry_start + entry.page_count as usize * PAGE_SIZE;
            if entry_start >= protect_addr && entry_end <= window_end {
                mpu.unprotect(entry.mpu_region);
                entry.mpu_region = -1;
            }
        }

        let region = mpu.protect(protect_addr, protect_size);
        if region >= 0 {
            for index in 0..QuarantineTable::capacity() {
                let entry = quarantine.entry_at_mut(index);
                if !entry.active {
                    continue;
                }
                let entry_start = base + entry.start_page as usize * PAGE_SIZE;
                let entry_end = entry_start + entry.page_count as usize * PAGE_SIZE;
                if entry_start >= protect_addr && entry_end <= window_end {
                    entry.mpu_region = region;
                }
            }
            log::debug!(
                "zone {}: MPU window {:#x}..{:#x} in region {}",
                self.zone_index,
                protect_addr,
                window_end,
                region
            );
        }
    }

    fn run_pre_op_checks(&self) {
        if QUARANTINE_CHECK_LEVEL > 0 && !self.verify_quarantine() {
            platform::fatal("guardheap: quarantine integrity check failed\n");
        }
        if CHECK_ALL_ALLOCATED && !self.verify_allocated() {
            platform::fatal("guardheap: live block integrity check failed\n");
        }
    }

    /// Validate every active quarantine entry: guard records always, the
    /// payload fill at check level 2, the padding pattern at level 3.
    pub fn verify_quarantine(&self) -> bool {
        for index in 0..QuarantineTable::capacity() {
            let entry = self.quarantine.entry_at(index);
            if !entry.active {
                continue;
            }
            unsafe {
                let header = self.page_address(entry.start_page);
                if !guard::validate_header(header) {
                    return false;
                }
                let record = guard::read_header(header);
                let footer = header.add(guard::footer_offset(record.requested_size as usize));
                if !guard::validate_footer(footer) {
                    return false;
                }
                if !guard::validate_pair(header, footer) {
                    return false;
                }
                // The payload pattern only exists when fill-on-free is active.
                if QUARANTINE_CHECK_LEVEL >= 2 && FILL_ON_FREE {
                    let payload = header.add(HEADER_SIZE);
                    if !guard::validate_quarantine_payload(
                        payload,
                        record.requested_size as usize,
                    ) {
                        return false;
                    }
                }
                if QUARANTINE_CHECK_LEVEL >= 3 {
                    let len = guard::padding_len(record.page_count, record.requested_size as usize);
                    if len > 0 {
                        let padding =
                            header.add(guard::padding_offset(record.requested_size as usize));
                        if !guard::validate_padding(padding, len) {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    /// Walk the zone and validate every live block's guards. A page that is
    /// marked allocated but does not carry a self-identifying header is
    /// skipped: mid-block pages legitimately fail header validation.
    pub fn verify_allocated(&self) -> bool {
        let mut page = 0u16;
        while page < self.total_pages {
            if !self.allocated.test(page) {
                page += 1;
                continue;
            }
            unsafe {
                let header = self.page_address(page);
                if !guard::validate_header(header) || guard::read_header(header).start_page != page
                {
                    page += 1;
                    continue;
                }
                let record = guard::read_header(header);
                let footer = header.add(guard::footer_offset(record.requested_size as usize));
                if !guard::validate_footer(footer) {
                    return false;
                }
                if !guard::validate_pair(header, footer) {
                    return false;
                }
                page += record.page_count;
            }
        }
        true
    }

    /// Execute the checks configured for every alloc/free, as a query.
    pub fn run_checks(&self) -> bool {
        let mut ok = true;
        if QUARANTINE_CHECK_LEVEL > 0 {
            ok = ok && self.verify_quarantine();
        }
        if CHECK_ALL_ALLOCATED {
            ok = ok && self.verify_allocated();
        }
        ok
    }

    /// Whether `ptr` could have been returned by this zone. The lowest
    /// possible user pointer is one header past the base; the first byte
    /// past the region is out of range.
    pub fn owns_pointer(&self, ptr: *const u8) -> bool {
        if !self.initialized || ptr.is_null() {
            return false;
        }
        let addr = ptr as usize;
        let low = self.base as usize + HEADER_SIZE;
        let high = self.base as usize + self.total_pages as usize * PAGE_SIZE;
        addr >= low && addr < high
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Raw size of the backing region, including any partial-page tail that
    /// is not usable for allocation.
    pub fn region_size(&self) -> usize {
        self.region_size
    }

    pub fn free_pages(&self) -> usize {
        self.free_pages
    }

    pub fn free_bytes(&self) -> usize {
        if self.initialized {
            self.free_pages * PAGE_SIZE
        } else {
            0
        }
    }

    pub fn min_ever_free_bytes(&self) -> usize {
        if self.initialized {
            self.min_ever_free_pages * PAGE_SIZE
        } else {
            0
        }
    }

    pub fn total_bytes(&self) -> usize {
        if self.initialized {
            self.total_pages as usize * PAGE_SIZE
        } else {
            0
        }
    }

    pub fn used_bytes(&self) -> usize {
        self.total_bytes() - self.free_bytes()
    }

    pub fn successful_allocs(&self) -> usize {
        self.successful_allocs
    }

    pub fn successful_frees(&self) -> usize {
        self.successful_frees
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QUARANTINE_CAPACITY;
    use crate::mpu::{FakeMpu, NoMpu};
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    struct Storage {
        ptr: *mut u8,
        layout: Layout,
    }

    impl Storage {
        fn pages(pages: usize) -> Self {
            let layout = Layout::from_size_align(pages * PAGE_SIZE, 4096).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            Storage { ptr, layout }
        }
    }

    impl Drop for Storage {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }

    fn zone_of(storage: &Storage, pages: usize) -> PageZone<NoMpu> {
        let mut zone = PageZone::new(NoMpu);
        unsafe { zone.init(storage.ptr, pages * PAGE_SIZE, 0) };
        zone
    }

    fn assert_core_invariants<M: MpuGuard>(zone: &PageZone<M>) {
        // allocated implies in_use
        for page in 0..zone.total_pages {
            if zone.allocated.test(page) {
                assert!(zone.in_use.test(page), "I1 violated at page {}", page);
            }
        }
        // popcount(in_use) accounts for every non-free page
        assert_eq!(
            zone.in_use.count_set() as usize,
            zone.total_pages as usize - zone.free_pages,
            "I2 violated"
        );
        assert!(zone.verify_allocated());
        assert!(zone.verify_quarantine());
    }

    #[test]
    fn init_carves_pages() {
        let storage = Storage::pages(8);
        let zone = zone_of(&storage, 8);
        assert!(zone.is_initialized());
        assert_eq!(zone.free_pages(), 8);
        assert_eq!(zone.region_size(), 8 * PAGE_SIZE);
        assert_eq!(zone.total_bytes(), 8 * PAGE_SIZE);
        assert_eq!(zone.min_ever_free_bytes(), 8 * PAGE_SIZE);
        assert_eq!(zone.used_bytes(), 0);
    }

    #[test]
    fn allocate_rejects_empty_and_uninitialised() {
        let storage = Storage::pages(4);
        let mut zone = zone_of(&storage, 4);
        assert!(unsafe { zone.allocate(0) }.is_null());

        let mut dead: PageZone<NoMpu> = PageZone::new(NoMpu);
        assert!(unsafe { dead.allocate(16) }.is_null());
        assert!(!dead.owns_pointer(storage.ptr));
    }

    #[test]
    fn first_allocation_lands_after_header() {
        let storage = Storage::pages(4);
        let mut zone = zone_of(&storage, 4);
        let p = unsafe { zone.allocate(100) };
        assert_eq!(p as usize, storage.ptr as usize + HEADER_SIZE);
        assert_eq!(zone.free_pages(), 3);
        assert_eq!(zone.successful_allocs(), 1);
        assert_core_invariants(&zone);
    }

    #[test]
    fn exact_single_page_fit_has_no_padding() {
        let storage = Storage::pages(4);
        let mut zone = zone_of(&storage, 4);
        let fit = PAGE_SIZE - HEADER_SIZE - FOOTER_SIZE;
        let p = unsafe { zone.allocate(fit) };
        assert!(!p.is_null());
        assert_eq!(zone.free_pages(), 3);
        assert_eq!(guard::padding_len(1, fit), 0);
        assert_core_invariants(&zone);
    }

    #[test]
    fn one_byte_over_spills_to_two_pages() {
        let storage = Storage::pages(4);
        let mut zone = zone_of(&storage, 4);
        let size = PAGE_SIZE - HEADER_SIZE - FOOTER_SIZE + 1;
        let p = unsafe { zone.allocate(size) };
        assert!(!p.is_null());
        assert_eq!(zone.free_pages(), 2);

        // Padding of PAGE_SIZE - 1 bytes, painted with the pattern byte.
        let pad_len = guard::padding_len(2, size);
        assert_eq!(pad_len, PAGE_SIZE - 1);
        unsafe {
            let pad = p.add(size + FOOTER_SIZE);
            assert_eq!(pad.read(), crate::config::PADDING_BYTE);
            assert_eq!(pad.add(pad_len - 1).read(), crate::config::PADDING_BYTE);
        }
        assert_core_invariants(&zone);
    }

    #[test]
    fn oversize_request_fails_without_mutation() {
        let storage = Storage::pages(8);
        let mut zone = zone_of(&storage, 8);
        let too_big = 8 * PAGE_SIZE - HEADER_SIZE - FOOTER_SIZE + 1;
        assert!(unsafe { zone.allocate(too_big) }.is_null());
        assert_eq!(zone.free_pages(), 8);
        assert_eq!(zone.successful_allocs(), 0);
        assert_eq!(zone.min_ever_free_bytes(), 8 * PAGE_SIZE);
        assert_core_invariants(&zone);

        // The largest request that still fits succeeds.
        let exact = 8 * PAGE_SIZE - HEADER_SIZE - FOOTER_SIZE;
        assert!(!unsafe { zone.allocate(exact) }.is_null());
        assert_eq!(zone.free_pages(), 0);
    }

    #[test]
    fn sequence_numbers_increase_per_allocation() {
        let storage = Storage::pages(8);
        let mut zone = zone_of(&storage, 8);
        unsafe {
            let a = zone.allocate(10);
            let b = zone.allocate(10);
            let seq_a = guard::read_header(a.sub(HEADER_SIZE)).sequence_num;
            let seq_b = guard::read_header(b.sub(HEADER_SIZE)).sequence_num;
            assert_eq!(seq_a, 0);
            assert_eq!(seq_b, 1);
        }
    }

    #[test]
    fn free_null_is_noop() {
        let storage = Storage::pages(4);
        let mut zone = zone_of(&storage, 4);
        unsafe { zone.deallocate(ptr::null_mut()) };
        assert_eq!(zone.successful_frees(), 0);
    }

    #[test]
    fn quarantine_blocks_immediate_reuse() {
        let storage = Storage::pages(8);
        let mut zone = zone_of(&storage, 8);
        unsafe {
            let a = zone.allocate(100);
            assert_eq!(a as usize, storage.ptr as usize + HEADER_SIZE);
            zone.deallocate(a);

            // Page 0 is quarantined, so the next block starts at page 1.
            let b = zone.allocate(100);
            assert_eq!(b as usize, storage.ptr as usize + PAGE_SIZE + HEADER_SIZE);
        }
        assert_eq!(zone.quarantine.count(), 1);
        assert_core_invariants(&zone);
    }

    #[test]
    #[cfg(feature = "fill-on-free")]
    fn freed_payload_is_painted() {
        let storage = Storage::pages(4);
        let mut zone = zone_of(&storage, 4);
        unsafe {
            let p = zone.allocate(64);
            ptr::write_bytes(p, 0xAA, 64);
            zone.deallocate(p);
            for offset in 0..64 {
                assert_eq!(p.add(offset).read(), crate::config::QUARANTINE_FILL_BYTE);
            }
        }
    }

    #[test]
    #[cfg(feature = "clear-on-evict")]
    fn capacity_plus_one_cycles_force_one_eviction() {
        let pages = QUARANTINE_CAPACITY + 4;
        let storage = Storage::pages(pages);
        let mut zone = zone_of(&storage, pages);

        unsafe {
            for _ in 0..QUARANTINE_CAPACITY + 1 {
                let p = zone.allocate(100);
                assert!(!p.is_null());
                zone.deallocate(p);
            }
        }

        // Table full again, exactly one run recycled.
        assert_eq!(zone.quarantine.count() as usize, QUARANTINE_CAPACITY);
        assert_eq!(zone.free_pages(), pages - QUARANTINE_CAPACITY);

        // The evicted run (page 0, freed first) is fully zeroed.
        unsafe {
            for offset in 0..PAGE_SIZE {
                assert_eq!(storage.ptr.add(offset).read(), 0, "byte {} not cleared", offset);
            }
        }
        assert_core_invariants(&zone);
    }

    #[test]
    #[cfg(feature = "clear-on-evict")]
    fn fill_and_free_accounting() {
        let total = QUARANTINE_CAPACITY + 4;
        let blocks = QUARANTINE_CAPACITY + 2;
        let storage = Storage::pages(total);
        let mut zone = zone_of(&storage, total);

        unsafe {
            let mut ptrs = Vec::new();
            for _ in 0..blocks {
                let p = zone.allocate(900);
                assert!(!p.is_null());
                ptrs.push(p);
            }
            assert_eq!(zone.free_pages(), total - blocks);
            for p in ptrs {
                zone.deallocate(p);
            }
        }

        // The last QUARANTINE_CAPACITY frees stay parked; the first two runs
        // were evicted and recycled.
        assert_eq!(zone.quarantine.count() as usize, QUARANTINE_CAPACITY);
        assert_eq!(zone.free_pages(), total - QUARANTINE_CAPACITY);
        unsafe {
            for page in 0..2 {
                let start = storage.ptr.add(page * PAGE_SIZE);
                for offset in 0..PAGE_SIZE {
                    assert_eq!(start.add(offset).read(), 0);
                }
            }
        }
        assert_core_invariants(&zone);
    }

    #[test]
    #[cfg(all(feature = "clear-on-evict", feature = "fill-on-free"))]
    fn eviction_order_is_fifo_by_free_sequence() {
        let pages = QUARANTINE_CAPACITY + 8;
        let storage = Storage::pages(pages);
        let mut zone = zone_of(&storage, pages);

        unsafe {
            let a = zone.allocate(100); // page 0
            let b = zone.allocate(100); // page 1
            let c = zone.allocate(100); // page 2
            zone.deallocate(b);
            zone.deallocate(a);
            zone.deallocate(c);

            // Fill the remaining quarantine slots.
            for _ in 0..QUARANTINE_CAPACITY - 3 {
                let p = zone.allocate(100);
                zone.deallocate(p);
            }
            assert!(zone.quarantine.is_full());

            // The next free evicts the earliest free, which is b (page 1):
            // its page is recycled to zero while a's payload keeps the fill.
            let p = zone.allocate(100);
            zone.deallocate(p);

            let page1 = storage.ptr.add(PAGE_SIZE);
            for offset in 0..PAGE_SIZE {
                assert_eq!(page1.add(offset).read(), 0);
            }
            let a_payload = storage.ptr.add(HEADER_SIZE);
            assert_eq!(a_payload.read(), crate::config::QUARANTINE_FILL_BYTE);
        }
        assert_core_invariants(&zone);
    }

    #[test]
    fn calloc_zeroes_and_rejects_overflow() {
        let storage = Storage::pages(4);
        let mut zone = zone_of(&storage, 4);
        unsafe {
            assert!(zone.calloc(usize::MAX, 2).is_null());

            // Dirty a page first so the zeroing is observable.
            let dirty = zone.allocate(256);
            ptr::write_bytes(dirty, 0xAB, 256);
            zone.deallocate(dirty);

            let p = zone.calloc(16, 16);
            assert!(!p.is_null());
            for offset in 0..256 {
                assert_eq!(p.add(offset).read(), 0);
            }
        }
    }

    #[test]
    fn verify_allocated_spots_footer_damage() {
        let storage = Storage::pages(4);
        let mut zone = zone_of(&storage, 4);
        unsafe {
            let p = zone.allocate(1900); // two pages
            assert!(zone.verify_allocated());

            // A corrupt footer on a self-identifying start page fails the walk.
            let footer = p.add(1900);
            footer.write(footer.read() ^ 0xFF);
            assert!(!zone.verify_allocated());
            footer.write(footer.read() ^ 0xFF);
            assert!(zone.verify_allocated());
        }
    }

    #[test]
    #[cfg(feature = "fill-on-free")]
    fn verify_quarantine_spots_use_after_free_write() {
        let storage = Storage::pages(4);
        let mut zone = zone_of(&storage, 4);
        unsafe {
            let p = zone.allocate(300);
            zone.deallocate(p);
            assert!(zone.verify_quarantine());

            p.add(5).write(0x00);
            assert!(!zone.verify_quarantine());
        }
    }

    #[test]
    fn verify_quarantine_spots_padding_damage() {
        let storage = Storage::pages(4);
        let mut zone = zone_of(&storage, 4);
        unsafe {
            let p = zone.allocate(300);
            zone.deallocate(p);

            // Last byte of the block's page is padding.
            let padding_tail = storage.ptr.add(PAGE_SIZE - 1);
            padding_tail.write(0x00);
            assert!(!zone.verify_quarantine());
        }
    }

    #[test]
    fn owns_pointer_bounds() {
        let storage = Storage::pages(4);
        let mut zone = zone_of(&storage, 4);
        let base = storage.ptr;
        unsafe {
            let p = zone.allocate(10);
            assert!(zone.owns_pointer(p));
            assert!(!zone.owns_pointer(base.add(HEADER_SIZE - 1)));
            assert!(zone.owns_pointer(base.add(HEADER_SIZE)));
            assert!(zone.owns_pointer(base.add(4 * PAGE_SIZE - 1)));
            assert!(!zone.owns_pointer(base.add(4 * PAGE_SIZE)));
            assert!(!zone.owns_pointer(ptr::null()));
        }
    }

    #[test]
    fn reset_returns_zone_to_uninitialised() {
        let storage = Storage::pages(4);
        let mut zone = zone_of(&storage, 4);
        unsafe {
            let p = zone.allocate(100);
            zone.deallocate(p);
        }
        zone.reset();
        assert!(!zone.is_initialized());
        assert_eq!(zone.free_bytes(), 0);
        assert!(unsafe { zone.allocate(10) }.is_null());

        // A reset zone may be initialised again.
        unsafe { zone.init(storage.ptr, 4 * PAGE_SIZE, 0) };
        assert!(!unsafe { zone.allocate(10) }.is_null());
    }

    #[test]
    fn min_ever_free_tracks_low_watermark() {
        let storage = Storage::pages(8);
        let mut zone = zone_of(&storage, 8);
        unsafe {
            let a = zone.allocate(100);
            let b = zone.allocate(100);
            assert_eq!(zone.min_ever_free_bytes(), 6 * PAGE_SIZE);
            zone.deallocate(a);
            zone.deallocate(b);
        }
        // Frees never raise the watermark.
        assert_eq!(zone.min_ever_free_bytes(), 6 * PAGE_SIZE);
    }

    // ---- MPU coalescing, exercised through a bounded fake ----

    fn mpu_zone(storage: &Storage, pages: usize) -> PageZone<FakeMpu> {
        let mut zone = PageZone::new(FakeMpu::new());
        unsafe { zone.init(storage.ptr, pages * PAGE_SIZE, 0) };
        zone
    }

    #[test]
    fn mpu_window_grows_and_subsumes_neighbours() {
        let storage = Storage::pages(8);
        let mut zone = mpu_zone(&storage, 8);
        let base = storage.ptr as usize;

        unsafe {
            let a = zone.allocate(100); // page 0
            let b = zone.allocate(100); // page 1
            let _c = zone.allocate(100); // page 2 stays live to bound the window
            let _d = zone.allocate(100); // page 3

            zone.deallocate(a);
            assert_eq!(zone.mpu.active_regions(), 1);
            let first = zone.quarantine.entry_at(0);
            assert!(first.active);
            assert!(first.mpu_region >= 0);
            assert_eq!(
                zone.mpu.region_window(first.mpu_region),
                Some((base, PAGE_SIZE))
            );

            // Freeing the neighbour widens the window to both pages; the
            // old single-page region is released first.
            zone.deallocate(b);
            assert_eq!(zone.mpu.active_regions(), 1);
            for index in 0..QuarantineTable::capacity() {
                let entry = zone.quarantine.entry_at(index);
                if entry.active {
                    assert!(entry.mpu_region >= 0);
                    assert_eq!(
                        zone.mpu.region_window(entry.mpu_region),
                        Some((base, 2 * PAGE_SIZE))
                    );
                }
            }
        }
        assert_core_invariants(&zone);
    }

    #[test]
    fn mpu_gives_up_on_unalignable_window() {
        // Offset the zone so no page boundary is MPU-alignable.
        let storage = Storage::pages(3);
        let base = unsafe { storage.ptr.add(512) };
        let mut zone = PageZone::new(FakeMpu::new());
        unsafe {
            zone.init(base, 2 * PAGE_SIZE, 0);
            let a = zone.allocate(100);
            zone.deallocate(a);
        }
        assert_eq!(zone.mpu.protect_calls, 0);
        let entry = zone.quarantine.entry_at(0);
        assert!(entry.active);
        assert_eq!(entry.mpu_region, -1);
    }

    #[test]
    fn mpu_degrades_when_regions_run_out() {
        let storage = Storage::pages(8);
        let mut zone = mpu_zone(&storage, 8);

        unsafe {
            // Alternate live blocks keep the freed runs from coalescing.
            let mut ptrs = Vec::new();
            for _ in 0..8 {
                ptrs.push(zone.allocate(100));
            }
            zone.deallocate(ptrs[0]); // page 0 -> region
            zone.deallocate(ptrs[2]); // page 2 -> region
            zone.deallocate(ptrs[4]); // page 4 -> no region left
        }

        assert_eq!(zone.mpu.active_regions(), 2);
        let mut unprotected = 0;
        for index in 0..QuarantineTable::capacity() {
            let entry = zone.quarantine.entry_at(index);
            if entry.active && entry.mpu_region < 0 {
                unprotected += 1;
            }
        }
        assert_eq!(unprotected, 1);
        assert_core_invariants(&zone);
    }
}
