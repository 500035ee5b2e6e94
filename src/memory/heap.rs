//! Kernel heap.
//!
//! Chunks tile the heap window `[start, end)` back to back, each starting
//! with a 16-byte header that records its size and whether it is in use.
//! Free neighbours are merged when a chunk is released and while searching.
//! When no chunk fits, the window grows by mapping fresh pages at its end.
//!
//! Requests that must be physically contiguous beyond one page are served
//! as separate block runs through the direct map rather than from the window.
//!
//! Interrupt handlers must never allocate: the lock is not reentrant.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use bitflags::bitflags;
use spin::Mutex;
use x86_64::{
    structures::paging::{Page, PageTableFlags, PhysFrame},
    PhysAddr, VirtAddr,
};

use super::paging::AddressSpace;
use super::PhysicalMemory;
use crate::config::PAGE_SIZE;
use crate::error::{KernelError, KernelResult};
use crate::sync::without_interrupts;

bitflags! {
    /// Placement constraints for [`kmalloc_aligned`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Placement: u32 {
        /// The allocation must not straddle a page boundary.
        const WITHIN_PAGE = 1 << 0;
        /// The allocation must not straddle a physical 64 KiB boundary.
        const WITHIN_64K = 1 << 1;
        /// The allocation must be physically contiguous.
        const CONTIGUOUS = 1 << 2;
    }
}

const HEADER: usize = 16;
const MIN_CHUNK: usize = 32;
const CHUNK_FREE: usize = 0x4652_4545;
const CHUNK_USED: usize = 0x5553_4544;
const BLOCKS_PER_64K: usize = 0x1_0000 / PAGE_SIZE;
/// Contiguous block runs that may be live at once.
pub const MAX_RUNS: usize = 64;

#[repr(C)]
#[derive(Clone, Copy)]
struct ChunkHeader {
    size: usize,
    state: usize,
}

/// A physically contiguous allocation served outside the window. The
/// payload starts at `base`.
#[derive(Debug, Clone, Copy)]
struct Run {
    base: usize,
    blocks: usize,
}

const _: () = assert!(core::mem::size_of::<ChunkHeader>() == HEADER);

fn align_up(value: usize, align: usize) -> Option<usize> {
    Some(value.checked_add(align - 1)? & !(align - 1))
}

unsafe fn read_chunk(at: usize) -> ChunkHeader {
    ptr::read(at as *const ChunkHeader)
}

unsafe fn write_chunk(at: usize, header: ChunkHeader) {
    ptr::write(at as *mut ChunkHeader, header)
}

/// Where the heap gets its memory from.
pub trait HeapBacking {
    fn memory(&self) -> &PhysicalMemory;

    /// Backs `pages` pages starting at `at` with fresh memory.
    fn grow(&mut self, at: VirtAddr, pages: usize) -> KernelResult<()>;

    /// Physical address behind a window address.
    fn translate(&self, addr: VirtAddr) -> Option<PhysAddr>;

    /// A run of `blocks` physically contiguous blocks, optionally kept
    /// inside one aligned window of `boundary` blocks.
    fn alloc_contiguous(&mut self, blocks: usize, boundary: Option<usize>) -> KernelResult<VirtAddr> {
        let mem = self.memory();
        let frame = match boundary {
            Some(boundary) => mem.alloc_blocks_within(blocks, boundary, false)?,
            None => mem.alloc_blocks(blocks, false)?,
        };
        Ok(mem.phys_to_virt(frame.start_address()))
    }

    fn free_contiguous(&mut self, addr: VirtAddr, blocks: usize) -> KernelResult<()> {
        let mem = self.memory();
        mem.free_blocks(PhysFrame::containing_address(mem.virt_to_phys(addr)), blocks)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub window_bytes: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub allocations: usize,
    pub contiguous_runs: usize,
    pub current_end: VirtAddr,
}

pub struct KernelHeap<B: HeapBacking> {
    backing: B,
    start: usize,
    end: usize,
    limit: usize,
    growth_pages: usize,
    allocations: usize,
    runs: [Option<Run>; MAX_RUNS],
}

/// How one request is going to be served.
enum Route {
    Window { boundary: Option<usize> },
    Run { bounded: bool },
}

impl<B: HeapBacking> KernelHeap<B> {
    /// An empty heap whose window may grow from `start` up to `limit`.
    pub fn new(backing: B, start: VirtAddr, limit: VirtAddr, growth_pages: usize) -> Self {
        let start = start.align_up(PAGE_SIZE as u64).as_u64() as usize;
        KernelHeap {
            backing,
            start,
            end: start,
            limit: limit.as_u64() as usize,
            growth_pages: growth_pages.max(1),
            allocations: 0,
            runs: [None; MAX_RUNS],
        }
    }

    pub fn current_end(&self) -> VirtAddr {
        VirtAddr::new(self.end as u64)
    }

    pub fn backing(&self) -> &B {
        &self.backing
    }

    fn route(size: usize, align: usize, placement: Placement) -> KernelResult<Route> {
        if placement.contains(Placement::WITHIN_PAGE) {
            if size > PAGE_SIZE {
                return Err(KernelError::InvalidArgument);
            }
            return Ok(Route::Window {
                boundary: Some(PAGE_SIZE),
            });
        }
        if placement.intersects(Placement::WITHIN_64K | Placement::CONTIGUOUS) {
            // A chunk inside one page is backed by a single block, which is
            // contiguous and inside one 64 KiB window.
            if size <= PAGE_SIZE {
                return Ok(Route::Window {
                    boundary: Some(PAGE_SIZE),
                });
            }
            if align > PAGE_SIZE {
                return Err(KernelError::InvalidArgument);
            }
            return Ok(Route::Run {
                bounded: placement.contains(Placement::WITHIN_64K),
            });
        }
        Ok(Route::Window { boundary: None })
    }

    /// Allocates `size` bytes aligned to `align` (a power of two).
    pub fn allocate(&mut self, size: usize, align: usize, placement: Placement) -> KernelResult<NonNull<u8>> {
        if !align.is_power_of_two() {
            return Err(KernelError::InvalidArgument);
        }
        let size = size.max(1);
        let align = align.max(HEADER);

        match Self::route(size, align, placement)? {
            Route::Run { bounded } => self.allocate_run(size, bounded),
            Route::Window { boundary } => {
                let body = align_up(size, HEADER).ok_or(KernelError::OutOfMemory)?;
                if let Some((chunk, payload)) = self.find_fit(body, align, boundary) {
                    return Ok(self.carve(chunk, payload, body));
                }
                let wanted = body
                    .checked_add(align)
                    .and_then(|bytes| bytes.checked_add(boundary.unwrap_or(0)))
                    .ok_or(KernelError::OutOfMemory)?;
                self.grow(wanted)?;
                let (chunk, payload) = self
                    .find_fit(body, align, boundary)
                    .ok_or(KernelError::OutOfMemory)?;
                Ok(self.carve(chunk, payload, body))
            }
        }
    }

    /// Merges the free chunks that follow `at` into it.
    fn absorb_following(&mut self, at: usize, header: &mut ChunkHeader) {
        loop {
            let next = at + header.size;
            if next >= self.end {
                break;
            }
            // SAFETY: `next` is a chunk boundary inside the window.
            let following = unsafe { read_chunk(next) };
            if following.state != CHUNK_FREE {
                break;
            }
            header.size += following.size;
        }
    }

    /// First free chunk that can hold `body` bytes, merging free runs on the way.
    fn find_fit(&mut self, body: usize, align: usize, boundary: Option<usize>) -> Option<(usize, usize)> {
        let mut at = self.start;
        while at < self.end {
            // SAFETY: chunks tile the window, so `at` is always a header.
            let mut header = unsafe { read_chunk(at) };
            if header.state == CHUNK_FREE {
                self.absorb_following(at, &mut header);
                unsafe { write_chunk(at, header) };
                if let Some(payload) = fit(at, header.size, body, align, boundary) {
                    return Some((at, payload));
                }
            }
            at += header.size;
        }
        None
    }

    /// Splits the free chunk at `chunk` so that a used chunk holds `payload`.
    fn carve(&mut self, chunk: usize, payload: usize, body: usize) -> NonNull<u8> {
        // SAFETY: `chunk` was just returned by `find_fit`.
        let free = unsafe { read_chunk(chunk) };
        let chunk_end = chunk + free.size;
        let header_at = payload - HEADER;

        if header_at > chunk {
            unsafe {
                write_chunk(
                    chunk,
                    ChunkHeader {
                        size: header_at - chunk,
                        state: CHUNK_FREE,
                    },
                )
            };
        }

        let mut used = HEADER + body;
        let rest = chunk_end - (header_at + used);
        if rest >= MIN_CHUNK {
            unsafe {
                write_chunk(
                    header_at + used,
                    ChunkHeader {
                        size: rest,
                        state: CHUNK_FREE,
                    },
                )
            };
        } else {
            used += rest;
        }
        unsafe {
            write_chunk(
                header_at,
                ChunkHeader {
                    size: used,
                    state: CHUNK_USED,
                },
            )
        };

        self.allocations += 1;
        // SAFETY: payloads are never null.
        unsafe { NonNull::new_unchecked(payload as *mut u8) }
    }

    /// Extends the window by at least `bytes` plus room for headers.
    fn grow(&mut self, bytes: usize) -> KernelResult<()> {
        let wanted = bytes
            .checked_add(2 * MIN_CHUNK)
            .and_then(|bytes| align_up(bytes, PAGE_SIZE))
            .ok_or(KernelError::OutOfMemory)?
            / PAGE_SIZE;
        let pages = wanted.max(self.growth_pages);
        let new_end = pages
            .checked_mul(PAGE_SIZE)
            .and_then(|bytes| self.end.checked_add(bytes))
            .filter(|&end| end <= self.limit)
            .ok_or(KernelError::OutOfMemory)?;

        self.backing.grow(VirtAddr::new(self.end as u64), pages)?;
        // SAFETY: the pages were just mapped for the heap.
        unsafe {
            write_chunk(
                self.end,
                ChunkHeader {
                    size: new_end - self.end,
                    state: CHUNK_FREE,
                },
            )
        };
        log::debug!("kernel heap grown by {} pages to {:#x}", pages, new_end);
        self.end = new_end;
        Ok(())
    }

    /// Serves a request from its own block run. The payload is the first
    /// byte of the run, so it is page aligned.
    fn allocate_run(&mut self, size: usize, bounded: bool) -> KernelResult<NonNull<u8>> {
        let blocks = align_up(size, PAGE_SIZE).ok_or(KernelError::OutOfMemory)? / PAGE_SIZE;
        if bounded && blocks > BLOCKS_PER_64K {
            return Err(KernelError::InvalidArgument);
        }
        let slot = self
            .runs
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::OutOfMemory)?;
        let base = self
            .backing
            .alloc_contiguous(blocks, bounded.then_some(BLOCKS_PER_64K))?
            .as_u64() as usize;
        self.runs[slot] = Some(Run { base, blocks });
        // SAFETY: a direct-map address is never null.
        Ok(unsafe { NonNull::new_unchecked(base as *mut u8) })
    }

    /// Releases an allocation made by [`allocate`](Self::allocate).
    ///
    /// Nothing behind `ptr` is read unless the heap handed it out.
    pub fn free(&mut self, ptr: NonNull<u8>) -> KernelResult<()> {
        let addr = ptr.as_ptr() as usize;
        if addr % HEADER != 0 {
            return Err(KernelError::InvalidAddress);
        }
        if addr >= self.start + HEADER && addr < self.end {
            return self.free_chunk(addr - HEADER);
        }

        let (slot, run) = self
            .runs
            .iter()
            .enumerate()
            .find_map(|(slot, run)| run.filter(|run| run.base == addr).map(|run| (slot, run)))
            .ok_or(KernelError::InvalidAddress)?;
        self.backing
            .free_contiguous(VirtAddr::new(run.base as u64), run.blocks)?;
        self.runs[slot] = None;
        Ok(())
    }

    /// Releases the chunk whose header sits at `at`, which must be a chunk
    /// boundary reached by walking from the window start.
    fn free_chunk(&mut self, at: usize) -> KernelResult<()> {
        let mut cursor = self.start;
        while cursor < at {
            // SAFETY: chunks tile the window.
            cursor += unsafe { read_chunk(cursor) }.size;
        }
        if cursor != at {
            return Err(KernelError::InvalidAddress);
        }

        // SAFETY: `at` is a chunk boundary inside the window.
        let mut header = unsafe { read_chunk(at) };
        match header.state {
            CHUNK_USED => {
                header.state = CHUNK_FREE;
                self.absorb_following(at, &mut header);
                unsafe { write_chunk(at, header) };
                self.allocations -= 1;
                Ok(())
            }
            CHUNK_FREE => Err(KernelError::DoubleFree),
            _ => Err(KernelError::InvalidAddress),
        }
    }

    /// Physical address of a byte handed out by this heap.
    pub fn physical_address(&self, ptr: NonNull<u8>) -> Option<PhysAddr> {
        let addr = VirtAddr::from_ptr(ptr.as_ptr());
        if (addr.as_u64() as usize) >= self.start && (addr.as_u64() as usize) < self.end {
            self.backing.translate(addr)
        } else {
            Some(self.backing.memory().virt_to_phys(addr))
        }
    }

    pub fn stats(&self) -> HeapStats {
        let mut used_bytes = 0;
        let mut free_bytes = 0;
        let mut at = self.start;
        while at < self.end {
            // SAFETY: chunks tile the window.
            let header = unsafe { read_chunk(at) };
            if header.state == CHUNK_USED {
                used_bytes += header.size;
            } else {
                free_bytes += header.size;
            }
            at += header.size;
        }
        HeapStats {
            window_bytes: self.end - self.start,
            used_bytes,
            free_bytes,
            allocations: self.allocations,
            contiguous_runs: self.runs.iter().flatten().count(),
            current_end: self.current_end(),
        }
    }
}

/// Payload address for `body` bytes inside the free chunk `[chunk, chunk + len)`.
///
/// The header goes right before the payload, and any gap left in front of
/// it must be big enough to stay a free chunk of its own.
fn fit(chunk: usize, len: usize, body: usize, align: usize, boundary: Option<usize>) -> Option<usize> {
    let end = chunk + len;
    let mut payload = align_up(chunk + HEADER, align)?;
    loop {
        if payload.checked_add(body)? > end {
            return None;
        }
        let gap = payload - HEADER - chunk;
        if gap != 0 && gap < MIN_CHUNK {
            payload = align_up(chunk + MIN_CHUNK + HEADER, align)?;
            continue;
        }
        if let Some(boundary) = boundary {
            if payload / boundary != (payload + body - 1) / boundary {
                payload = align_up(align_up(payload + 1, boundary)?, align)?;
                continue;
            }
        }
        return Some(payload);
    }
}

/// Heap backing for the running kernel: fresh blocks mapped into the
/// kernel address space.
pub struct KernelBacking {
    mem: &'static PhysicalMemory,
    space: AddressSpace,
}

impl KernelBacking {
    pub fn new(mem: &'static PhysicalMemory, space: AddressSpace) -> Self {
        KernelBacking { mem, space }
    }
}

impl HeapBacking for KernelBacking {
    fn memory(&self) -> &PhysicalMemory {
        self.mem
    }

    fn grow(&mut self, at: VirtAddr, pages: usize) -> KernelResult<()> {
        let first = Page::containing_address(at);
        self.space.map_fresh(
            self.mem,
            Page::range(first, first + pages as u64),
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
        )
    }

    fn translate(&self, addr: VirtAddr) -> Option<PhysAddr> {
        self.space.translate(self.mem, addr)
    }
}

#[cfg(not(test))]
pub type GlobalBacking = KernelBacking;
#[cfg(test)]
pub type GlobalBacking = super::testing::DirectMapBacking<'static>;

/// The kernel heap behind a lock, usable as the global allocator.
pub struct LockedHeap(Mutex<Option<KernelHeap<GlobalBacking>>>);

impl LockedHeap {
    pub const fn empty() -> Self {
        LockedHeap(Mutex::new(None))
    }

    fn with<R>(&self, f: impl FnOnce(&mut KernelHeap<GlobalBacking>) -> KernelResult<R>) -> KernelResult<R> {
        without_interrupts(|| match self.0.lock().as_mut() {
            Some(heap) => f(heap),
            None => Err(KernelError::OutOfMemory),
        })
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.with(|heap| heap.allocate(layout.size(), layout.align(), Placement::empty()))
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else { return };
        if let Err(err) = self.with(|heap| heap.free(ptr)) {
            log::error!("kernel heap: release of {:p} failed: {}", ptr, err);
        }
    }
}

#[cfg_attr(not(test), global_allocator)]
pub static KERNEL_HEAP: LockedHeap = LockedHeap::empty();

/// Sets up the kernel heap window and maps its first pages, which also
/// creates the window's PML4 entry before any user space copies the kernel half.
pub fn init(backing: GlobalBacking, start: VirtAddr, limit: VirtAddr, growth_pages: usize) -> KernelResult<()> {
    let mut heap = KernelHeap::new(backing, start, limit, growth_pages);
    heap.grow(0)?;
    let end = heap.current_end();
    without_interrupts(|| *KERNEL_HEAP.0.lock() = Some(heap));
    log::info!("kernel heap at {:#x}..{:#x}", start.as_u64(), end.as_u64());
    Ok(())
}

pub fn kmalloc(size: usize) -> KernelResult<NonNull<u8>> {
    KERNEL_HEAP.with(|heap| heap.allocate(size, HEADER, Placement::empty()))
}

/// Allocation with alignment and placement constraints; also returns the
/// physical address of the first byte.
pub fn kmalloc_aligned(
    size: usize,
    align: usize,
    placement: Placement,
) -> KernelResult<(NonNull<u8>, PhysAddr)> {
    KERNEL_HEAP.with(|heap| {
        let ptr = heap.allocate(size, align, placement)?;
        let phys = heap.physical_address(ptr).ok_or(KernelError::InvalidAddress)?;
        Ok((ptr, phys))
    })
}

/// # Safety
/// `ptr` must come from [`kmalloc`] or [`kmalloc_aligned`] and must not be
/// used afterwards.
pub unsafe fn kfree(ptr: NonNull<u8>) -> KernelResult<()> {
    KERNEL_HEAP.with(|heap| heap.free(ptr))
}

pub fn heap_current_end() -> Option<VirtAddr> {
    KERNEL_HEAP.with(|heap| Ok(heap.current_end())).ok()
}

pub fn heap_stats() -> Option<HeapStats> {
    KERNEL_HEAP.with(|heap| Ok(heap.stats())).ok()
}
