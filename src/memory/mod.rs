pub mod frame_allocator;
pub mod heap;
pub mod paging;
#[cfg(test)]
pub mod testing;

use spin::Mutex;
use x86_64::{
    structures::paging::{FrameAllocator, PhysFrame, Size4KiB},
    PhysAddr, VirtAddr,
};

use crate::config::BLOCK_SIZE;
use crate::error::KernelResult;
use crate::sync::without_interrupts;
use frame_allocator::{BitmapFrameAllocator, BlockStats};

/// Physical blocks plus the direct map used to touch them.
///
/// Nothing here allocates from the kernel heap, so the heap may grow while
/// holding its own lock. Lock order is kernel, then heap, then frames.
pub struct PhysicalMemory {
    frames: Mutex<BitmapFrameAllocator>,
    offset: VirtAddr,
}

impl PhysicalMemory {
    pub fn new(frames: BitmapFrameAllocator, offset: VirtAddr) -> Self {
        PhysicalMemory {
            frames: Mutex::new(frames),
            offset,
        }
    }

    pub fn offset(&self) -> VirtAddr {
        self.offset
    }

    pub fn phys_to_virt(&self, addr: PhysAddr) -> VirtAddr {
        self.offset + addr.as_u64()
    }

    /// Inverse of [`phys_to_virt`](Self::phys_to_virt) for direct-map addresses.
    pub fn virt_to_phys(&self, addr: VirtAddr) -> PhysAddr {
        PhysAddr::new(addr - self.offset)
    }

    pub fn block_ptr(&self, frame: PhysFrame) -> *mut u8 {
        self.phys_to_virt(frame.start_address()).as_mut_ptr()
    }

    fn with_frames<R>(&self, f: impl FnOnce(&mut BitmapFrameAllocator) -> R) -> R {
        without_interrupts(|| f(&mut self.frames.lock()))
    }

    pub fn alloc_block(&self, zeroed: bool) -> KernelResult<PhysFrame> {
        self.alloc_blocks(1, zeroed)
    }

    /// Contiguous run of `count` blocks; the first block is returned.
    pub fn alloc_blocks(&self, count: usize, zeroed: bool) -> KernelResult<PhysFrame> {
        let frame = self.with_frames(|frames| frames.alloc_blocks(count))?;
        if zeroed {
            self.zero_blocks(frame, count);
        }
        Ok(frame)
    }

    /// Contiguous run that stays inside one aligned window of `boundary` blocks.
    pub fn alloc_blocks_within(
        &self,
        count: usize,
        boundary: usize,
        zeroed: bool,
    ) -> KernelResult<PhysFrame> {
        let frame = self.with_frames(|frames| frames.alloc_blocks_within(count, boundary))?;
        if zeroed {
            self.zero_blocks(frame, count);
        }
        Ok(frame)
    }

    pub fn free_block(&self, frame: PhysFrame) -> KernelResult<()> {
        self.with_frames(|frames| frames.free_block(frame))
    }

    pub fn free_blocks(&self, frame: PhysFrame, count: usize) -> KernelResult<()> {
        self.with_frames(|frames| frames.free_blocks(frame, count))
    }

    pub fn stats(&self) -> BlockStats {
        self.with_frames(|frames| frames.stats())
    }

    pub fn zero_blocks(&self, frame: PhysFrame, count: usize) {
        // SAFETY: the run is owned by the caller and reachable through the direct map.
        unsafe { core::ptr::write_bytes(self.block_ptr(frame), 0, count * BLOCK_SIZE) }
    }

    pub fn copy_block(&self, from: PhysFrame, to: PhysFrame) {
        // SAFETY: distinct whole blocks, both reachable through the direct map.
        unsafe {
            core::ptr::copy_nonoverlapping(self.block_ptr(from), self.block_ptr(to), BLOCK_SIZE)
        }
    }

    /// Frame source for the `x86_64` mapper when it needs new tables.
    pub fn frame_source(&self) -> FrameSource<'_> {
        FrameSource(self)
    }
}

pub struct FrameSource<'a>(&'a PhysicalMemory);

unsafe impl FrameAllocator<Size4KiB> for FrameSource<'_> {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        // The mapper zeroes the tables it creates.
        self.0.alloc_block(false).ok()
    }
}

#[cfg(not(test))]
mod boot {
    use super::*;
    use crate::config::{IDENTITY_MAP_LIMIT, KERNEL_RESERVED_END, PHYS_MEM_OFFSET};
    use crate::error::KernelError;
    use frame_allocator::MemoryRegion;
    use multiboot2::{BootInformation, BootInformationHeader, MemoryAreaType};

    const BITMAP_WORDS: usize = (IDENTITY_MAP_LIMIT as usize / BLOCK_SIZE) / 64;

    static mut BLOCK_BITMAP: [u64; BITMAP_WORDS] = [0; BITMAP_WORDS];
    static PHYSICAL_MEMORY: spin::Once<PhysicalMemory> = spin::Once::new();

    /// Builds the block allocator from the Multiboot2 memory map.
    pub fn init(multiboot_info_addr: usize) -> KernelResult<&'static PhysicalMemory> {
        // SAFETY: the boot stub passes the address it received from the loader.
        let boot_info = unsafe {
            BootInformation::load(multiboot_info_addr as *const BootInformationHeader)
        }
        .map_err(|_| KernelError::InvalidAddress)?;
        let memory_map = boot_info.memory_map_tag().ok_or(KernelError::InvalidArgument)?;

        // SAFETY: init runs once, before anything else can see the bitmap.
        let bitmap: &'static mut [u64] =
            unsafe { &mut *core::ptr::addr_of_mut!(BLOCK_BITMAP) };
        let mut frames = BitmapFrameAllocator::new(bitmap);

        for area in memory_map.memory_areas() {
            if MemoryAreaType::from(area.typ()) != MemoryAreaType::Available {
                continue;
            }
            let start = area.start_address();
            let end = area.end_address().min(IDENTITY_MAP_LIMIT);
            if start >= end {
                continue;
            }
            if let Err(err) = frames.add_region(MemoryRegion::new(start, end - start)) {
                log::warn!("memory area {:#x}..{:#x} ignored: {}", start, end, err);
            }
        }

        frames.mark_used(PhysAddr::new(0), PhysAddr::new(KERNEL_RESERVED_END))?;
        frames.mark_used(
            PhysAddr::new(boot_info.start_address() as u64),
            PhysAddr::new(boot_info.end_address() as u64),
        )?;

        let stats = frames.stats();
        log::info!(
            "physical memory: {} blocks, {} free ({} KiB)",
            stats.total,
            stats.free,
            stats.free * BLOCK_SIZE / 1024
        );

        Ok(PHYSICAL_MEMORY
            .call_once(|| PhysicalMemory::new(frames, VirtAddr::new(PHYS_MEM_OFFSET))))
    }

    pub fn physical() -> Option<&'static PhysicalMemory> {
        PHYSICAL_MEMORY.get()
    }
}

#[cfg(not(test))]
pub use boot::{init, physical};
