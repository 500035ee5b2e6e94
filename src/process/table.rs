use alloc::boxed::Box;
use alloc::vec::Vec;

use super::{Pid, Process};
use crate::error::{KernelError, KernelResult};

/// Identifies one incarnation of a pid. A handle kept past the reap of its
/// process no longer resolves, even after the pid has been reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: Pid,
    pub generation: u32,
}

struct Slot {
    generation: u32,
    process: Option<Box<Process>>,
}

/// Fixed-size pid arena. Processes are boxed so their saved contexts keep
/// a stable address while the table is mutated.
pub struct ProcessTable {
    slots: Vec<Slot>,
    cursor: usize,
    live: usize,
}

impl ProcessTable {
    pub fn new(max_pids: usize) -> Self {
        let mut slots = Vec::with_capacity(max_pids);
        slots.resize_with(max_pids, || Slot {
            generation: 0,
            process: None,
        });
        ProcessTable {
            slots,
            cursor: 0,
            live: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    /// Next free pid after the last one handed out, wrapping around and
    /// never returning the root pid. The slot stays empty until `insert`.
    pub fn allocate(&mut self) -> KernelResult<ProcessHandle> {
        let count = self.slots.len();
        for step in 1..=count {
            let index = (self.cursor + step) % count;
            if index == Pid::ROOT.as_usize() || self.slots[index].process.is_some() {
                continue;
            }
            self.cursor = index;
            return Ok(ProcessHandle {
                pid: Pid(index as u32),
                generation: self.slots[index].generation,
            });
        }
        Err(KernelError::PidExhausted)
    }

    pub fn insert(&mut self, process: Box<Process>) -> KernelResult<()> {
        let slot = self
            .slots
            .get_mut(process.pid.as_usize())
            .ok_or(KernelError::InvalidArgument)?;
        if slot.process.is_some() {
            return Err(KernelError::InvalidArgument);
        }
        slot.process = Some(process);
        self.live += 1;
        Ok(())
    }

    /// Takes the process out of the table and retires its handle.
    pub fn remove(&mut self, pid: Pid) -> KernelResult<Box<Process>> {
        let slot = self
            .slots
            .get_mut(pid.as_usize())
            .ok_or(KernelError::NoSuchProcess)?;
        let process = slot.process.take().ok_or(KernelError::NoSuchProcess)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.live -= 1;
        Ok(process)
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.slots.get(pid.as_usize())?.process.as_deref()
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.slots.get_mut(pid.as_usize())?.process.as_deref_mut()
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.get(pid).is_some()
    }

    pub fn handle(&self, pid: Pid) -> Option<ProcessHandle> {
        self.get(pid).map(|process| ProcessHandle {
            pid,
            generation: process.generation,
        })
    }

    pub fn resolve(&self, handle: ProcessHandle) -> Option<&Process> {
        self.get(handle.pid)
            .filter(|process| process.generation == handle.generation)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.slots.iter().filter_map(|slot| slot.process.as_deref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Process> {
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.process.as_deref_mut())
    }

    /// Links `child` under `parent` in both directions.
    pub fn attach(&mut self, parent: Pid, child: Pid) -> KernelResult<()> {
        if !self.contains(parent) {
            return Err(KernelError::NoSuchProcess);
        }
        self.get_mut(child).ok_or(KernelError::NoSuchProcess)?.parent = Some(parent);
        if let Some(parent) = self.get_mut(parent) {
            parent.children.push(child);
        }
        Ok(())
    }

    /// Unlinks `child` from its parent's child list.
    pub fn detach(&mut self, child: Pid) {
        let Some(parent) = self.get_mut(child).and_then(|process| process.parent.take()) else {
            return;
        };
        if let Some(parent) = self.get_mut(parent) {
            parent.children.retain(|&pid| pid != child);
        }
    }

    /// Moves every child of `from` under `to`. Returns the moved pids.
    pub fn reparent_children(&mut self, from: Pid, to: Pid) -> Vec<Pid> {
        let moved = match self.get_mut(from) {
            Some(process) => core::mem::take(&mut process.children),
            None => return Vec::new(),
        };
        for &child in &moved {
            if let Some(process) = self.get_mut(child) {
                process.parent = Some(to);
            }
        }
        if let Some(adopter) = self.get_mut(to) {
            adopter.children.extend_from_slice(&moved);
        }
        moved
    }

    /// Whether every live process is reachable from the root through child
    /// links, and every child link agrees with the child's parent field.
    pub fn is_tree_consistent(&self) -> bool {
        let mut reached = 0;
        let mut stack = Vec::from([Pid::ROOT]);
        while let Some(pid) = stack.pop() {
            let Some(process) = self.get(pid) else {
                return false;
            };
            reached += 1;
            for &child in &process.children {
                match self.get(child) {
                    Some(c) if c.parent == Some(pid) => stack.push(child),
                    _ => return false,
                }
            }
        }
        reached == self.live
    }
}
