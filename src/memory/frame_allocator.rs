use bit_field::BitField;
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

use crate::config::BLOCK_SIZE;
use crate::error::{KernelError, KernelResult};

/// Maximum number of usable regions the allocator tracks.
pub const MAX_REGIONS: usize = 32;
/// Maximum number of permanently reserved ranges.
pub const MAX_RESERVED: usize = 16;

/// A usable physical range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: PhysAddr,
    pub end: PhysAddr,
}

impl MemoryRegion {
    pub fn new(start: u64, len: u64) -> Self {
        MemoryRegion {
            start: PhysAddr::new(start),
            end: PhysAddr::new(start + len),
        }
    }

    /// First and one-past-last whole block inside the region.
    fn block_span(&self) -> (usize, usize) {
        let first = self.start.align_up(BLOCK_SIZE as u64).as_u64() as usize / BLOCK_SIZE;
        let last = self.end.align_down(BLOCK_SIZE as u64).as_u64() as usize / BLOCK_SIZE;
        (first, last.max(first))
    }

    fn contains_block(&self, block: usize) -> bool {
        let (first, last) = self.block_span();
        block >= first && block < last
    }
}

/// Aggregate block counts for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStats {
    pub total: usize,
    pub used: usize,
    pub free: usize,
    pub block_size: usize,
}

/// One bit per 4 KiB block, set while the block is in use.
///
/// Blocks outside every registered region stay set forever, so a scan never
/// hands them out. Allocation is first fit from the lowest address.
pub struct BitmapFrameAllocator {
    bitmap: &'static mut [u64],
    regions: [Option<MemoryRegion>; MAX_REGIONS],
    /// Block spans `[first, last)` that `mark_used` took out for good.
    reserved: [Option<(usize, usize)>; MAX_RESERVED],
    total: usize,
    used: usize,
}

impl BitmapFrameAllocator {
    /// Creates an allocator whose bitmap covers `bitmap.len() * 64` blocks.
    /// Nothing is usable until regions are added.
    pub fn new(bitmap: &'static mut [u64]) -> Self {
        bitmap.fill(u64::MAX);
        BitmapFrameAllocator {
            bitmap,
            regions: [None; MAX_REGIONS],
            reserved: [None; MAX_RESERVED],
            total: 0,
            used: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.bitmap.len() * 64
    }

    fn is_used(&self, block: usize) -> bool {
        self.bitmap[block / 64].get_bit(block % 64)
    }

    fn set_used(&mut self, block: usize, used: bool) {
        self.bitmap[block / 64].set_bit(block % 64, used);
    }

    fn is_registered(&self, block: usize) -> bool {
        self.regions
            .iter()
            .flatten()
            .any(|region| region.contains_block(block))
    }

    /// Registers a usable range. Returns the number of blocks it added.
    pub fn add_region(&mut self, region: MemoryRegion) -> KernelResult<usize> {
        let slot = self
            .regions
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::OutOfMemory)?;

        let (first, last) = region.block_span();
        let last = if last > self.capacity() {
            log::warn!(
                "region {:#x}..{:#x} exceeds bitmap coverage, clipped",
                region.start.as_u64(),
                region.end.as_u64()
            );
            self.capacity()
        } else {
            last
        };

        let mut added = 0;
        for block in first..last {
            if !self.is_registered(block) {
                self.set_used(block, false);
                added += 1;
            }
        }
        self.regions[slot] = Some(region);
        self.total += added;
        Ok(added)
    }

    fn is_reserved(&self, block: usize) -> bool {
        self.reserved
            .iter()
            .flatten()
            .any(|&(first, last)| block >= first && block < last)
    }

    /// Marks `[start, end)` as permanently used, e.g. the kernel image.
    /// Reserved blocks can never be freed.
    pub fn mark_used(&mut self, start: PhysAddr, end: PhysAddr) -> KernelResult<()> {
        let first = start.align_down(BLOCK_SIZE as u64).as_u64() as usize / BLOCK_SIZE;
        let last = (end.align_up(BLOCK_SIZE as u64).as_u64() as usize / BLOCK_SIZE).min(self.capacity());
        if first >= last {
            return Ok(());
        }
        let slot = self
            .reserved
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::OutOfMemory)?;
        self.reserved[slot] = Some((first, last));

        for block in first..last {
            if self.is_registered(block) && !self.is_used(block) {
                self.set_used(block, true);
                self.used += 1;
            }
        }
        Ok(())
    }

    /// First run of `count` free blocks that does not cross a multiple of
    /// `boundary` blocks, when one is given.
    fn find_run(&self, count: usize, boundary: Option<usize>) -> Option<usize> {
        let mut run_start = 0;
        let mut run_len = 0;
        let mut block = 0;

        while block < self.capacity() {
            if block % 64 == 0 && self.bitmap[block / 64] == u64::MAX {
                run_len = 0;
                block += 64;
                continue;
            }

            if self.is_used(block) {
                run_len = 0;
            } else {
                if run_len == 0 || boundary.map_or(false, |b| block % b == 0) {
                    run_start = block;
                    run_len = 0;
                }
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            }
            block += 1;
        }
        None
    }

    fn claim(&mut self, first: usize, count: usize) -> PhysFrame {
        for block in first..first + count {
            self.set_used(block, true);
        }
        self.used += count;
        PhysFrame::containing_address(PhysAddr::new((first * BLOCK_SIZE) as u64))
    }

    pub fn alloc_block(&mut self) -> KernelResult<PhysFrame> {
        self.alloc_blocks(1)
    }

    /// Claims `count` contiguous blocks and returns the first one.
    pub fn alloc_blocks(&mut self, count: usize) -> KernelResult<PhysFrame> {
        if count == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let first = self.find_run(count, None).ok_or(KernelError::OutOfMemory)?;
        Ok(self.claim(first, count))
    }

    /// Like [`alloc_blocks`](Self::alloc_blocks), but the run stays inside one
    /// aligned window of `boundary` blocks.
    pub fn alloc_blocks_within(&mut self, count: usize, boundary: usize) -> KernelResult<PhysFrame> {
        if count == 0 || boundary == 0 || count > boundary {
            return Err(KernelError::InvalidArgument);
        }
        let first = self
            .find_run(count, Some(boundary))
            .ok_or(KernelError::OutOfMemory)?;
        Ok(self.claim(first, count))
    }

    pub fn free_block(&mut self, frame: PhysFrame) -> KernelResult<()> {
        self.free_blocks(frame, 1)
    }

    /// Releases `count` blocks starting at `frame`. Every block is checked
    /// before any bit changes.
    pub fn free_blocks(&mut self, frame: PhysFrame, count: usize) -> KernelResult<()> {
        let first = frame.start_address().as_u64() as usize / BLOCK_SIZE;
        let last = first.checked_add(count).ok_or(KernelError::InvalidAddress)?;
        if count == 0 || last > self.capacity() {
            return Err(KernelError::InvalidAddress);
        }
        for block in first..last {
            if !self.is_registered(block) {
                return Err(KernelError::InvalidAddress);
            }
            if self.is_reserved(block) {
                return Err(KernelError::PermissionDenied);
            }
            if !self.is_used(block) {
                return Err(KernelError::DoubleFree);
            }
        }
        for block in first..last {
            self.set_used(block, false);
        }
        self.used -= count;
        Ok(())
    }

    pub fn stats(&self) -> BlockStats {
        BlockStats {
            total: self.total,
            used: self.used,
            free: self.total - self.used,
            block_size: BLOCK_SIZE,
        }
    }
}

unsafe impl FrameAllocator<Size4KiB> for BitmapFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.alloc_block().ok()
    }
}

impl FrameDeallocator<Size4KiB> for BitmapFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame) {
        if let Err(err) = self.free_block(frame) {
            log::warn!("frame {:?} not released: {}", frame, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec;
    use alloc::vec::Vec;
    use proptest::prelude::*;

    fn allocator(blocks: usize) -> BitmapFrameAllocator {
        let words = (blocks + 63) / 64;
        let bitmap = Box::leak(vec![0u64; words].into_boxed_slice());
        let mut frames = BitmapFrameAllocator::new(bitmap);
        frames
            .add_region(MemoryRegion::new(0, (blocks * BLOCK_SIZE) as u64))
            .unwrap();
        frames
    }

    fn index(frame: PhysFrame) -> usize {
        frame.start_address().as_u64() as usize / BLOCK_SIZE
    }

    #[test]
    fn sixteen_block_region_reuses_first_fit() {
        let mut frames = allocator(16);
        let a = frames.alloc_blocks(4).unwrap();
        let b = frames.alloc_blocks(4).unwrap();
        let c = frames.alloc_blocks(4).unwrap();
        assert_eq!((index(a), index(b), index(c)), (0, 4, 8));
        assert_eq!(frames.stats().free, 4);

        frames.free_blocks(a, 4).unwrap();
        let again = frames.alloc_blocks(4).unwrap();
        assert_eq!(again, a);
        assert_eq!(frames.stats().used, 12);
    }

    #[test]
    fn exhausted_region_reports_out_of_memory() {
        let mut frames = allocator(8);
        frames.alloc_blocks(6).unwrap();
        assert_eq!(frames.alloc_blocks(3), Err(KernelError::OutOfMemory));
        assert!(frames.alloc_blocks(2).is_ok());
        assert_eq!(frames.alloc_block(), Err(KernelError::OutOfMemory));
    }

    #[test]
    fn double_free_and_foreign_frames_are_rejected() {
        let mut frames = allocator(4);
        let frame = frames.alloc_block().unwrap();
        frames.free_block(frame).unwrap();
        assert_eq!(frames.free_block(frame), Err(KernelError::DoubleFree));

        let outside = PhysFrame::containing_address(PhysAddr::new(64 * BLOCK_SIZE as u64));
        assert_eq!(frames.free_block(outside), Err(KernelError::InvalidAddress));
        assert_eq!(frames.stats().used, 0);
    }

    #[test]
    fn regions_with_holes_never_yield_gap_blocks() {
        let bitmap = Box::leak(vec![0u64; 1].into_boxed_slice());
        let mut frames = BitmapFrameAllocator::new(bitmap);
        frames.add_region(MemoryRegion::new(0, 2 * BLOCK_SIZE as u64)).unwrap();
        frames
            .add_region(MemoryRegion::new(4 * BLOCK_SIZE as u64, 2 * BLOCK_SIZE as u64))
            .unwrap();
        assert_eq!(frames.stats().total, 4);

        // Blocks 2 and 3 are a hole, so a run of three cannot exist.
        assert_eq!(frames.alloc_blocks(3), Err(KernelError::OutOfMemory));
        let run = frames.alloc_blocks(2).unwrap();
        assert_eq!(index(run), 0);
        assert_eq!(index(frames.alloc_blocks(2).unwrap()), 4);
    }

    #[test]
    fn reserved_ranges_count_as_used() {
        let mut frames = allocator(8);
        frames
            .mark_used(PhysAddr::new(0), PhysAddr::new(2 * BLOCK_SIZE as u64 + 1))
            .unwrap();
        assert_eq!(frames.stats().used, 3);
        assert_eq!(index(frames.alloc_block().unwrap()), 3);
    }

    #[test]
    fn reserved_blocks_cannot_be_freed() {
        let mut frames = allocator(8);
        frames
            .mark_used(PhysAddr::new(BLOCK_SIZE as u64), PhysAddr::new(3 * BLOCK_SIZE as u64))
            .unwrap();
        let reserved = PhysFrame::containing_address(PhysAddr::new(2 * BLOCK_SIZE as u64));
        assert_eq!(frames.free_block(reserved), Err(KernelError::PermissionDenied));

        // A run that only touches a reserved block is refused as a whole.
        let first = frames.alloc_block().unwrap();
        assert_eq!(index(first), 0);
        assert_eq!(frames.free_blocks(first, 2), Err(KernelError::PermissionDenied));
        assert_eq!(frames.stats().used, 3);
        frames.free_block(first).unwrap();
        assert_eq!(frames.stats().used, 2);
    }

    #[test]
    fn reserved_table_overflow_is_reported() {
        let mut frames = allocator(64);
        for block in 0..MAX_RESERVED as u64 {
            let start = PhysAddr::new(block * BLOCK_SIZE as u64);
            frames.mark_used(start, start + BLOCK_SIZE as u64).unwrap();
        }
        let next = PhysAddr::new(MAX_RESERVED as u64 * BLOCK_SIZE as u64);
        assert_eq!(
            frames.mark_used(next, next + BLOCK_SIZE as u64),
            Err(KernelError::OutOfMemory)
        );
        assert_eq!(frames.stats().used, MAX_RESERVED);
    }

    #[test]
    fn bounded_runs_stay_inside_their_window() {
        let mut frames = allocator(64);
        frames.alloc_blocks(14).unwrap();
        // Blocks 14 and 15 are free but a run of four would straddle block 16.
        let run = frames.alloc_blocks_within(4, 16).unwrap();
        assert_eq!(index(run), 16);
        assert_eq!(frames.alloc_blocks_within(17, 16), Err(KernelError::InvalidArgument));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Alloc(usize),
        Free(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![(1usize..6).prop_map(Op::Alloc), (0usize..16).prop_map(Op::Free)]
    }

    proptest! {
        #[test]
        fn live_runs_never_overlap(ops in proptest::collection::vec(op(), 1..60)) {
            let mut frames = allocator(64);
            let baseline = frames.stats().free;
            let mut live: Vec<(usize, usize)> = Vec::new();

            for op in ops {
                match op {
                    Op::Alloc(count) => {
                        if let Ok(frame) = frames.alloc_blocks(count) {
                            let start = index(frame);
                            for &(other, len) in &live {
                                prop_assert!(start + count <= other || other + len <= start);
                            }
                            live.push((start, count));
                        }
                    }
                    Op::Free(slot) => {
                        if !live.is_empty() {
                            let (start, count) = live.remove(slot % live.len());
                            let frame = PhysFrame::containing_address(
                                PhysAddr::new((start * BLOCK_SIZE) as u64),
                            );
                            frames.free_blocks(frame, count).unwrap();
                        }
                    }
                }
                let held: usize = live.iter().map(|&(_, len)| len).sum();
                prop_assert_eq!(frames.stats().used, held);
            }

            for (start, count) in live.drain(..) {
                let frame = PhysFrame::containing_address(PhysAddr::new((start * BLOCK_SIZE) as u64));
                frames.free_blocks(frame, count).unwrap();
            }
            prop_assert_eq!(frames.stats().free, baseline);
        }
    }
}
