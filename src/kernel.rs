//! The single owned kernel state threaded through every operation.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use x86_64::structures::paging::PhysFrame;

use crate::config::KernelConfig;
use crate::error::KernelResult;
use crate::fs::fd::SharedFdTable;
use crate::memory::frame_allocator::BlockStats;
use crate::memory::heap::{self, HeapStats};
use crate::memory::paging::AddressSpace;
use crate::memory::PhysicalMemory;
use crate::process::{
    Image, Pid, Process, ProcessFlags, ProcessHandle, ProcessInfo, ProcessTable, Thread,
    WorkingDirectory,
};
use crate::scheduler::Scheduler;

pub struct Kernel<'m> {
    pub(crate) config: KernelConfig,
    pub(crate) mem: &'m PhysicalMemory,
    /// Root table whose kernel slots every address space shares.
    pub(crate) kernel_root: PhysFrame,
    pub(crate) processes: ProcessTable,
    pub(crate) scheduler: Scheduler,
    pub(crate) ticks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub blocks: BlockStats,
    /// `None` before the kernel heap is initialised.
    pub heap: Option<HeapStats>,
}

impl<'m> Kernel<'m> {
    /// Adopts the running boot flow as the root process (pid 0), which idles,
    /// roots the process tree and adopts orphans.
    pub fn new(mem: &'m PhysicalMemory, kernel_root: PhysFrame, config: KernelConfig) -> KernelResult<Self> {
        let mut processes = ProcessTable::new(config.max_pids);
        let mut root = Process::new(
            ProcessHandle {
                pid: Pid::ROOT,
                generation: 0,
            },
            "kernel",
            Thread::bootstrap(),
            Image::empty(),
            AddressSpace::kernel(kernel_root),
            SharedFdTable::new(config.max_fds),
            WorkingDirectory::root(),
        );
        root.description = String::from("idle loop and orphan reaper");
        root.flags = ProcessFlags::STARTED | ProcessFlags::RUNNING;
        processes.insert(Box::new(root))?;

        log::info!(
            "kernel state ready: {} pids, {} Hz timer, {}-tick slices",
            config.max_pids,
            config.timer_hz,
            config.time_slice_ticks
        );

        Ok(Kernel {
            config,
            mem,
            kernel_root,
            processes,
            scheduler: Scheduler::new(config.max_pids, config.time_slice_ticks),
            ticks: 0,
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn memory(&self) -> &'m PhysicalMemory {
        self.mem
    }

    pub fn current(&self) -> Pid {
        self.scheduler.current()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn process(&self, pid: Pid) -> Option<&Process> {
        self.processes.get(pid)
    }

    pub fn process_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.processes.get_mut(pid)
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    pub fn handle(&self, pid: Pid) -> Option<ProcessHandle> {
        self.processes.handle(pid)
    }

    /// The process a handle was taken from, unless it has since been reaped.
    pub fn resolve(&self, handle: ProcessHandle) -> Option<&Process> {
        self.processes.resolve(handle)
    }

    pub fn list_processes(&self) -> Vec<ProcessInfo> {
        self.processes.iter().map(Process::info).collect()
    }

    pub fn memory_info(&self) -> MemoryInfo {
        MemoryInfo {
            blocks: self.mem.stats(),
            heap: heap::heap_stats(),
        }
    }

    /// Releases every process but the root. Returns how many were torn down.
    pub fn shutdown(mut self) -> usize {
        let pids: Vec<Pid> = self
            .processes
            .iter()
            .map(|process| process.pid)
            .filter(|&pid| pid != Pid::ROOT)
            .collect();
        for &pid in &pids {
            if let Ok(process) = self.processes.remove(pid) {
                let Process { address_space, .. } = *process;
                address_space.destroy(self.mem);
            }
        }
        log::info!("kernel shutdown: {} processes released", pids.len());
        pids.len()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::memory::testing::TestMemory;

    /// A few NOPs standing in for a user program.
    pub const PROGRAM: &[u8] = &[0x90; 32];

    pub fn boot(mem: &TestMemory) -> Kernel<'_> {
        boot_with(mem, 16)
    }

    pub fn boot_with(mem: &TestMemory, max_pids: usize) -> Kernel<'_> {
        let kernel_root = mem.alloc_block(true).unwrap();
        let config = KernelConfig {
            max_pids,
            timer_hz: 1000,
            time_slice_ticks: 3,
            max_fds: 8,
            ..KernelConfig::default()
        };
        Kernel::new(mem, kernel_root, config).unwrap()
    }

    /// Yields until `pid` is on the CPU.
    pub fn schedule(kernel: &mut Kernel<'_>, pid: Pid) {
        for _ in 0..=kernel.processes().capacity() {
            if kernel.current() == pid {
                return;
            }
            kernel.process_yield(true);
        }
        panic!("pid {} never got the CPU", pid);
    }
}
