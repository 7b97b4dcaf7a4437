#![no_main]

use guardheap::config::PAGE_SIZE;
use guardheap::mpu::NoMpu;
use guardheap::zone::PageZone;
use libfuzzer_sys::fuzz_target;

/// Interpret the input as a sequence of zone operations.
///
/// Each operation is encoded as:
///   byte 0: opcode (0=allocate, 1=deallocate, 2=calloc, 3=verify)
///   byte 1-2: size (little-endian u16)
///   byte 3: slot index (which tracked pointer to operate on)
///
/// Only pointers the zone actually returned are ever freed, so every abort
/// the fuzzer finds is a real allocator defect, not an induced double free.
const MAX_SLOTS: usize = 32;
const ZONE_PAGES: usize = 64;

fuzz_target!(|data: &[u8]| {
    let layout = std::alloc::Layout::from_size_align(ZONE_PAGES * PAGE_SIZE, PAGE_SIZE).unwrap();
    let storage = unsafe { std::alloc::alloc_zeroed(layout) };
    if storage.is_null() {
        return;
    }

    let mut zone = PageZone::new(NoMpu);
    unsafe { zone.init(storage, ZONE_PAGES * PAGE_SIZE, 0) };

    let mut slots: [*mut u8; MAX_SLOTS] = [std::ptr::null_mut(); MAX_SLOTS];

    let mut i = 0;
    while i + 4 <= data.len() {
        let opcode = data[i] & 0x03;
        let size = u16::from_le_bytes([data[i + 1], data[i + 2]]) as usize;
        let slot = (data[i + 3] as usize) % MAX_SLOTS;
        i += 4;

        match opcode {
            0 => {
                if !slots[slot].is_null() {
                    unsafe { zone.deallocate(slots[slot]) };
                    slots[slot] = std::ptr::null_mut();
                }
                let ptr = unsafe { zone.allocate(size) };
                if !ptr.is_null() {
                    unsafe {
                        std::ptr::write_bytes(ptr, 0xA5, size.min(256));
                    }
                }
                slots[slot] = ptr;
            }
            1 => {
                if !slots[slot].is_null() {
                    unsafe { zone.deallocate(slots[slot]) };
                    slots[slot] = std::ptr::null_mut();
                }
            }
            2 => {
                if !slots[slot].is_null() {
                    unsafe { zone.deallocate(slots[slot]) };
                    slots[slot] = std::ptr::null_mut();
                }
                let count = (size >> 8).max(1);
                let elem = (size & 0xFF).max(1);
                let ptr = unsafe { zone.calloc(count, elem) };
                if !ptr.is_null() {
                    let total = count * elem;
                    for offset in 0..total.min(256) {
                        assert_eq!(
                            unsafe { ptr.add(offset).read() },
                            0,
                            "calloc memory not zeroed at offset {}",
                            offset
                        );
                    }
                }
                slots[slot] = ptr;
            }
            3 => {
                assert!(zone.verify_allocated());
                assert!(zone.verify_quarantine());
                assert!(zone.free_bytes() <= zone.total_bytes());
            }
            _ => unreachable!(),
        }
    }

    for slot in &mut slots {
        if !slot.is_null() {
            unsafe { zone.deallocate(*slot) };
            *slot = std::ptr::null_mut();
        }
    }

    assert!(zone.verify_allocated());
    assert!(zone.verify_quarantine());

    unsafe { std::alloc::dealloc(storage, layout) };
});
