use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::{Mutex, MutexGuard};

use super::NodeHandle;
use crate::error::{KernelError, KernelResult};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const APPEND = 1 << 2;
    }
}

#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub node: NodeHandle,
    pub offset: u64,
    pub mode: OpenMode,
}

/// Per-process descriptor slots. Descriptors are indices into `entries`;
/// the vector grows by doubling up to `max`.
#[derive(Debug, Clone)]
pub struct FileDescriptorTable {
    entries: Vec<Option<FileDescriptor>>,
    max: usize,
}

impl FileDescriptorTable {
    pub fn new(max: usize) -> Self {
        FileDescriptorTable {
            entries: Vec::with_capacity(max.min(4)),
            max,
        }
    }

    /// Slots in use or previously used.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    pub fn open_count(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    fn free_slot(&mut self) -> KernelResult<usize> {
        if let Some(fd) = self.entries.iter().position(Option::is_none) {
            return Ok(fd);
        }
        if self.entries.len() >= self.max {
            return Err(KernelError::TooManyFiles);
        }
        if self.entries.len() == self.entries.capacity() {
            let grown = (self.entries.capacity() * 2).max(4).min(self.max);
            self.entries.reserve_exact(grown - self.entries.len());
        }
        self.entries.push(None);
        Ok(self.entries.len() - 1)
    }

    /// Installs `descriptor` in the lowest free slot.
    pub fn install(&mut self, descriptor: FileDescriptor) -> KernelResult<usize> {
        let fd = self.free_slot()?;
        self.entries[fd] = Some(descriptor);
        Ok(fd)
    }

    pub fn open(&mut self, node: NodeHandle, mode: OpenMode) -> KernelResult<usize> {
        self.install(FileDescriptor {
            node,
            offset: 0,
            mode,
        })
    }

    pub fn get(&self, fd: usize) -> KernelResult<&FileDescriptor> {
        self.entries
            .get(fd)
            .and_then(Option::as_ref)
            .ok_or(KernelError::BadDescriptor)
    }

    pub fn get_mut(&mut self, fd: usize) -> KernelResult<&mut FileDescriptor> {
        self.entries
            .get_mut(fd)
            .and_then(Option::as_mut)
            .ok_or(KernelError::BadDescriptor)
    }

    /// Empties the slot and returns what it held. The node closes once the
    /// returned descriptor and every other handle on it are gone.
    pub fn close(&mut self, fd: usize) -> KernelResult<FileDescriptor> {
        self.entries
            .get_mut(fd)
            .and_then(Option::take)
            .ok_or(KernelError::BadDescriptor)
    }

    /// Copies `fd` into the lowest free slot.
    pub fn dup(&mut self, fd: usize) -> KernelResult<usize> {
        let copy = self.get(fd)?.clone();
        self.install(copy)
    }

    /// Makes `new` refer to what `old` refers to, closing `new` first.
    pub fn dup2(&mut self, old: usize, new: usize) -> KernelResult<usize> {
        let copy = self.get(old)?.clone();
        if old == new {
            return Ok(new);
        }
        if new >= self.max {
            return Err(KernelError::BadDescriptor);
        }
        if new >= self.entries.len() {
            self.entries.resize_with(new + 1, || None);
        }
        self.entries[new] = Some(copy);
        Ok(new)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &FileDescriptor)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(fd, entry)| entry.as_ref().map(|entry| (fd, entry)))
    }
}

/// A descriptor table that several processes may hold at once.
///
/// Forking shares the table. The first process to change a shared table
/// gets a private copy beforehand, so one process closing a descriptor
/// never closes it for another.
pub struct SharedFdTable(Arc<Mutex<FileDescriptorTable>>);

impl SharedFdTable {
    pub fn new(max: usize) -> Self {
        SharedFdTable(Arc::new(Mutex::new(FileDescriptorTable::new(max))))
    }

    /// Another reference to the same table.
    pub fn share(&self) -> Self {
        SharedFdTable(Arc::clone(&self.0))
    }

    /// Number of processes holding the table.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn is_shared_with(&self, other: &SharedFdTable) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn lock(&self) -> MutexGuard<'_, FileDescriptorTable> {
        self.0.lock()
    }

    /// Write access, unsharing first if anyone else holds the table.
    pub fn modify(&mut self) -> MutexGuard<'_, FileDescriptorTable> {
        if Arc::strong_count(&self.0) > 1 {
            let private = self.0.lock().clone();
            self.0 = Arc::new(Mutex::new(private));
        }
        self.0.lock()
    }
}

impl core::fmt::Debug for SharedFdTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedFdTable")
            .field("refs", &self.ref_count())
            .finish()
    }
}
