use x86_64::{
    structures::paging::{
        mapper::{MapToError, MapperFlush, UnmapError},
        page_table::PageTableEntry,
        Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PageTableIndex, PhysFrame,
        Size4KiB,
    },
    PhysAddr, VirtAddr,
};

use super::PhysicalMemory;
use crate::config::{PAGE_SIZE, USER_PML4_SLOTS, USER_SPACE_END};
use crate::error::{KernelError, KernelResult};

pub type PageRange = x86_64::structures::paging::page::PageRange<Size4KiB>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    /// Borrows the kernel's tables. Never owns user mappings.
    Kernel,
    /// Owns its root and every frame mapped in the user slots.
    User,
}

/// A 4-level page table hierarchy.
///
/// The kernel slots of a user space point at the kernel's own lower-level
/// tables, so kernel mappings are visible everywhere and are never freed
/// here. Everything under the user slots belongs to the space.
#[derive(Debug)]
pub struct AddressSpace {
    root: PhysFrame,
    kind: SpaceKind,
}

fn table_ptr(mem: &PhysicalMemory, frame: PhysFrame) -> *mut PageTable {
    mem.phys_to_virt(frame.start_address()).as_mut_ptr()
}

/// Frame of the next-level table, if the entry points at one.
fn next_table(entry: &PageTableEntry) -> Option<PhysFrame> {
    let flags = entry.flags();
    if !flags.contains(PageTableFlags::PRESENT) || flags.contains(PageTableFlags::HUGE_PAGE) {
        return None;
    }
    entry.frame().ok()
}

fn is_active(root: PhysFrame) -> bool {
    #[cfg(not(test))]
    {
        x86_64::registers::control::Cr3::read().0 == root
    }
    #[cfg(test)]
    {
        let _ = root;
        false
    }
}

fn commit(flush: MapperFlush<Size4KiB>, root: PhysFrame) {
    if is_active(root) {
        flush.flush();
    } else {
        flush.ignore();
    }
}

fn index(i: usize) -> PageTableIndex {
    PageTableIndex::new(i as u16)
}

impl AddressSpace {
    /// Wraps the kernel's root table without taking ownership of it.
    pub fn kernel(root: PhysFrame) -> Self {
        AddressSpace {
            root,
            kind: SpaceKind::Kernel,
        }
    }

    /// New user space sharing every kernel slot of `kernel_root`.
    pub fn create(mem: &PhysicalMemory, kernel_root: PhysFrame) -> KernelResult<Self> {
        let root = mem.alloc_block(true)?;
        // SAFETY: both roots are live tables reachable through the direct map,
        // and the new one is not yet visible to anyone else.
        let (kernel, table) = unsafe { (&*table_ptr(mem, kernel_root), &mut *table_ptr(mem, root)) };
        for slot in (0..512).filter(|slot| !USER_PML4_SLOTS.contains(slot)) {
            table[slot] = kernel[slot].clone();
        }
        Ok(AddressSpace {
            root,
            kind: SpaceKind::User,
        })
    }

    pub fn root(&self) -> PhysFrame {
        self.root
    }

    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    pub fn is_kernel(&self) -> bool {
        self.kind == SpaceKind::Kernel
    }

    fn mapper(&mut self, mem: &PhysicalMemory) -> OffsetPageTable<'_> {
        // SAFETY: the root is a valid table and `&mut self` keeps this the
        // only mapper over it.
        unsafe { OffsetPageTable::new(&mut *table_ptr(mem, self.root), mem.offset()) }
    }

    pub fn map(
        &mut self,
        mem: &PhysicalMemory,
        page: Page,
        frame: PhysFrame,
        flags: PageTableFlags,
    ) -> KernelResult<()> {
        let root = self.root;
        let mut frames = mem.frame_source();
        // SAFETY: the frame is handed over by the caller and aliased nowhere else.
        let result = unsafe {
            self.mapper(mem)
                .map_to(page, frame, flags | PageTableFlags::PRESENT, &mut frames)
        };
        match result {
            Ok(flush) => {
                commit(flush, root);
                Ok(())
            }
            Err(MapToError::PageAlreadyMapped(_)) => Err(KernelError::AlreadyMapped),
            Err(MapToError::FrameAllocationFailed) => Err(KernelError::OutOfMemory),
            Err(MapToError::ParentEntryHugePage) => Err(KernelError::InvalidAddress),
        }
    }

    /// Removes the mapping and hands the frame back to the caller.
    pub fn unmap(&mut self, mem: &PhysicalMemory, page: Page) -> KernelResult<PhysFrame> {
        let root = self.root;
        match self.mapper(mem).unmap(page) {
            Ok((frame, flush)) => {
                commit(flush, root);
                Ok(frame)
            }
            Err(UnmapError::PageNotMapped) => Err(KernelError::NotMapped),
            Err(UnmapError::ParentEntryHugePage) | Err(UnmapError::InvalidFrameAddress(_)) => {
                Err(KernelError::InvalidAddress)
            }
        }
    }

    pub fn unmap_and_free(&mut self, mem: &PhysicalMemory, page: Page) -> KernelResult<()> {
        let frame = self.unmap(mem, page)?;
        mem.free_block(frame)
    }

    /// Backs every page of `pages` with a fresh zeroed block. On failure the
    /// pages mapped so far are released again.
    pub fn map_fresh(
        &mut self,
        mem: &PhysicalMemory,
        pages: PageRange,
        flags: PageTableFlags,
    ) -> KernelResult<()> {
        for page in pages {
            let result = mem.alloc_block(true).and_then(|frame| {
                self.map(mem, page, frame, flags).map_err(|err| {
                    let _ = mem.free_block(frame);
                    err
                })
            });
            if let Err(err) = result {
                for undo in Page::range(pages.start, page) {
                    let _ = self.unmap_and_free(mem, undo);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Leaf frame and flags for a 4 KiB page.
    fn leaf(&self, mem: &PhysicalMemory, page: Page) -> Option<(PhysFrame, PageTableFlags)> {
        let mut frame = self.root;
        for i in [page.p4_index(), page.p3_index(), page.p2_index()] {
            // SAFETY: every frame on the walk is a live table of this space.
            let table = unsafe { &*table_ptr(mem, frame) };
            frame = next_table(&table[i])?;
        }
        // SAFETY: as above.
        let table = unsafe { &*table_ptr(mem, frame) };
        let entry = &table[page.p1_index()];
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        Some((entry.frame().ok()?, entry.flags()))
    }

    pub fn translate(&self, mem: &PhysicalMemory, addr: VirtAddr) -> Option<PhysAddr> {
        let page = Page::<Size4KiB>::containing_address(addr);
        let (frame, _) = self.leaf(mem, page)?;
        Some(frame.start_address() + (addr - page.start_address()))
    }

    /// Fails unless every page of `[addr, addr + len)` is user accessible
    /// and writable.
    pub fn check_user_writable(&self, mem: &PhysicalMemory, addr: VirtAddr, len: usize) -> KernelResult<()> {
        let end = addr
            .as_u64()
            .checked_add(len as u64)
            .ok_or(KernelError::InvalidAddress)?;
        if end > USER_SPACE_END {
            return Err(KernelError::InvalidAddress);
        }
        if len == 0 {
            return Ok(());
        }

        let writable = PageTableFlags::USER_ACCESSIBLE | PageTableFlags::WRITABLE;
        let pages = Page::range_inclusive(
            Page::<Size4KiB>::containing_address(addr),
            Page::containing_address(VirtAddr::new(end - 1)),
        );
        for page in pages {
            match self.leaf(mem, page) {
                Some((_, flags)) if flags.contains(writable) => {}
                _ => return Err(KernelError::InvalidAddress),
            }
        }
        Ok(())
    }

    /// Copies `bytes` into user memory. Every page touched must be user
    /// accessible and writable, otherwise nothing is written.
    pub fn write_user(&self, mem: &PhysicalMemory, addr: VirtAddr, bytes: &[u8]) -> KernelResult<()> {
        self.check_user_writable(mem, addr, bytes.len())?;

        let mut done = 0;
        while done < bytes.len() {
            let at = addr + done as u64;
            let phys = self.translate(mem, at).ok_or(KernelError::InvalidAddress)?;
            let chunk = (bytes.len() - done).min(PAGE_SIZE - (at.as_u64() as usize % PAGE_SIZE));
            // SAFETY: the target lies inside one mapped user page.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    bytes[done..].as_ptr(),
                    mem.phys_to_virt(phys).as_mut_ptr::<u8>(),
                    chunk,
                );
            }
            done += chunk;
        }
        Ok(())
    }

    /// Calls `f` for every present 4 KiB page in the user slots.
    fn for_each_user_page<F>(&self, mem: &PhysicalMemory, mut f: F) -> KernelResult<()>
    where
        F: FnMut(Page, PhysFrame, PageTableFlags) -> KernelResult<()>,
    {
        if self.is_kernel() {
            return Ok(());
        }
        // SAFETY: every table reached is owned by this space and only read.
        let p4 = unsafe { &*table_ptr(mem, self.root) };
        for i4 in USER_PML4_SLOTS {
            let Some(p3) = next_table(&p4[i4]) else { continue };
            let p3 = unsafe { &*table_ptr(mem, p3) };
            for i3 in 0..512 {
                let Some(p2) = next_table(&p3[i3]) else { continue };
                let p2 = unsafe { &*table_ptr(mem, p2) };
                for i2 in 0..512 {
                    let Some(p1) = next_table(&p2[i2]) else { continue };
                    let p1 = unsafe { &*table_ptr(mem, p1) };
                    for i1 in 0..512 {
                        let entry = &p1[i1];
                        if !entry.flags().contains(PageTableFlags::PRESENT) {
                            continue;
                        }
                        let Ok(frame) = entry.frame() else { continue };
                        let page = Page::from_page_table_indices(
                            index(i4),
                            index(i3),
                            index(i2),
                            index(i1),
                        );
                        f(page, frame, entry.flags())?;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn user_pages(&self, mem: &PhysicalMemory) -> usize {
        let mut count = 0;
        let _ = self.for_each_user_page(mem, |_, _, _| {
            count += 1;
            Ok(())
        });
        count
    }

    /// New space with the same kernel slots and a private copy of every
    /// user page. The copy is eager; on failure everything built so far is
    /// released and the source is untouched.
    pub fn duplicate(&self, mem: &PhysicalMemory, kernel_root: PhysFrame) -> KernelResult<AddressSpace> {
        let mut child = AddressSpace::create(mem, kernel_root)?;
        let copied = self.for_each_user_page(mem, |page, frame, flags| {
            let copy = mem.alloc_block(false)?;
            mem.copy_block(frame, copy);
            child.map(mem, page, copy, flags).map_err(|err| {
                let _ = mem.free_block(copy);
                err
            })
        });
        if let Err(err) = copied {
            child.destroy(mem);
            return Err(err);
        }
        Ok(child)
    }

    /// Frees every user page and the tables that held them. Returns the
    /// number of pages released.
    ///
    /// Stale TLB entries of an active space are harmless here: the owner
    /// never returns to user mode and the next CR3 load drops them.
    pub fn clear_user(&mut self, mem: &PhysicalMemory) -> usize {
        if self.is_kernel() {
            return 0;
        }
        let release = |frame: PhysFrame| {
            if let Err(err) = mem.free_block(frame) {
                log::warn!("page table release of {:?} failed: {}", frame, err);
            }
        };

        let mut released = 0;
        // SAFETY: the tables are owned by this space and `&mut self` is unique.
        let p4 = unsafe { &mut *table_ptr(mem, self.root) };
        for i4 in USER_PML4_SLOTS {
            let Some(p3_frame) = next_table(&p4[i4]) else { continue };
            let p3 = unsafe { &*table_ptr(mem, p3_frame) };
            for e3 in p3.iter() {
                let Some(p2_frame) = next_table(e3) else { continue };
                let p2 = unsafe { &*table_ptr(mem, p2_frame) };
                for e2 in p2.iter() {
                    let Some(p1_frame) = next_table(e2) else { continue };
                    let p1 = unsafe { &*table_ptr(mem, p1_frame) };
                    for e1 in p1.iter() {
                        if !e1.flags().contains(PageTableFlags::PRESENT) {
                            continue;
                        }
                        if let Ok(frame) = e1.frame() {
                            release(frame);
                            released += 1;
                        }
                    }
                    release(p1_frame);
                }
                release(p2_frame);
            }
            release(p3_frame);
            p4[i4].set_unused();
        }
        released
    }

    /// Releases the user half and the root itself.
    pub fn destroy(mut self, mem: &PhysicalMemory) {
        if self.is_kernel() {
            return;
        }
        self.clear_user(mem);
        if let Err(err) = mem.free_block(self.root) {
            log::warn!("address space root {:?} not released: {}", self.root, err);
        }
    }
}
