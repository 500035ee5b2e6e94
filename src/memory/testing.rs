//! Host-side stand-in for physical RAM.
//!
//! A page-aligned buffer plays the part of physical memory starting at
//! address zero, and its host address is the direct-map offset. Page tables
//! built on top of it are real `x86_64` tables that are walked, never loaded.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::Deref;

use x86_64::{PhysAddr, VirtAddr};

use super::frame_allocator::{BitmapFrameAllocator, MemoryRegion};
use super::heap::HeapBacking;
use super::PhysicalMemory;
use crate::config::{BLOCK_SIZE, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};

pub struct TestMemory {
    base: *mut u8,
    layout: Layout,
    mem: PhysicalMemory,
}

impl TestMemory {
    pub fn new(blocks: usize) -> Self {
        let layout = Layout::from_size_align(blocks * BLOCK_SIZE, BLOCK_SIZE).unwrap();
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null());

        let bitmap = Box::leak(vec![0u64; (blocks + 63) / 64].into_boxed_slice());
        let mut frames = BitmapFrameAllocator::new(bitmap);
        frames
            .add_region(MemoryRegion::new(0, (blocks * BLOCK_SIZE) as u64))
            .unwrap();

        TestMemory {
            base,
            layout,
            mem: PhysicalMemory::new(frames, VirtAddr::from_ptr(base)),
        }
    }
}

// The buffer is only reached through `PhysicalMemory`, whose allocator is locked.
unsafe impl Send for TestMemory {}
unsafe impl Sync for TestMemory {}

impl Deref for TestMemory {
    type Target = PhysicalMemory;

    fn deref(&self) -> &PhysicalMemory {
        &self.mem
    }
}

impl Drop for TestMemory {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) }
    }
}

/// Heap window carved out of one block run, so window addresses are also
/// direct-map addresses.
pub struct DirectMapBacking<'a> {
    mem: &'a TestMemory,
    base: usize,
    pages: usize,
    grown: usize,
}

impl<'a> DirectMapBacking<'a> {
    pub fn new(mem: &'a TestMemory, pages: usize) -> Self {
        let frame = mem.alloc_blocks(pages, true).unwrap();
        let base = mem.phys_to_virt(frame.start_address()).as_u64() as usize;
        DirectMapBacking {
            mem,
            base,
            pages,
            grown: 0,
        }
    }

    pub fn start(&self) -> VirtAddr {
        VirtAddr::new(self.base as u64)
    }

    pub fn limit(&self) -> VirtAddr {
        self.start() + (self.pages * PAGE_SIZE) as u64
    }
}

impl HeapBacking for DirectMapBacking<'_> {
    fn memory(&self) -> &PhysicalMemory {
        self.mem
    }

    fn grow(&mut self, at: VirtAddr, pages: usize) -> KernelResult<()> {
        assert_eq!(at.as_u64() as usize, self.base + self.grown * PAGE_SIZE);
        if self.grown + pages > self.pages {
            return Err(KernelError::OutOfMemory);
        }
        self.grown += pages;
        Ok(())
    }

    fn translate(&self, addr: VirtAddr) -> Option<PhysAddr> {
        Some(self.mem.virt_to_phys(addr))
    }
}
