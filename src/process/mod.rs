pub mod lifecycle;
pub mod table;
pub mod thread;

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;
use x86_64::VirtAddr;

use crate::fs::fd::SharedFdTable;
use crate::fs::NodeHandle;
use crate::memory::paging::AddressSpace;
use crate::sync::Spinlock;
pub use lifecycle::{WaitOptions, WaitOutcome, WaitTarget};
pub use table::{ProcessHandle, ProcessTable};
pub use thread::{KernelStack, Thread};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

impl Pid {
    /// The boot flow: idle process, root of the tree and adopter of orphans.
    pub const ROOT: Pid = Pid(0);

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProcessFlags: u8 {
        /// Has been made runnable at least once.
        const STARTED = 1 << 0;
        /// Exited; only the status remains.
        const FINISHED = 1 << 1;
        /// Currently on the CPU.
        const RUNNING = 1 << 2;
        /// Held off the ready list until resumed.
        const SUSPENDED = 1 << 3;
        /// Waiting for its sleep countdown.
        const SLEEPING = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Created,
    Ready,
    Running,
    Sleeping,
    /// Waiting for a child to exit.
    Blocked,
    Suspended,
    Zombie,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ProcessState::Created => "created",
            ProcessState::Ready => "ready",
            ProcessState::Running => "running",
            ProcessState::Sleeping => "sleeping",
            ProcessState::Blocked => "blocked",
            ProcessState::Suspended => "suspended",
            ProcessState::Zombie => "zombie",
        };
        f.write_str(name)
    }
}

/// User heap bounds. `mapped` is the high-water mark of backed pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapBreak {
    pub base: u64,
    pub actual: u64,
    pub mapped: u64,
}

/// The loaded program of a process.
#[derive(Debug)]
pub struct Image {
    pub entry: VirtAddr,
    pub size: u64,
    pub user_stack: VirtAddr,
    pub heap: Spinlock<HeapBreak>,
}

impl Image {
    /// Kernel tasks have no user image.
    pub fn empty() -> Self {
        Image {
            entry: VirtAddr::zero(),
            size: 0,
            user_stack: VirtAddr::zero(),
            heap: Spinlock::new(HeapBreak::default()),
        }
    }

    pub fn snapshot(&self) -> Self {
        Image {
            entry: self.entry,
            size: self.size,
            user_stack: self.user_stack,
            heap: self.heap.snapshot(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkingDirectory {
    pub node: Option<NodeHandle>,
    pub path: String,
}

impl WorkingDirectory {
    pub fn root() -> Self {
        WorkingDirectory {
            node: None,
            path: String::from("/"),
        }
    }
}

pub struct Process {
    pub pid: Pid,
    /// Bumped each time the pid slot is reused.
    pub generation: u32,
    pub name: String,
    pub description: String,
    pub argv: Vec<String>,
    pub thread: Thread,
    pub image: Image,
    pub cwd: WorkingDirectory,
    /// `None` once the process has exited.
    pub fds: Option<SharedFdTable>,
    pub exit_status: i32,
    pub flags: ProcessFlags,
    pub sleep_ticks: u64,
    pub waiting: Option<WaitTarget>,
    pub parent: Option<Pid>,
    pub children: Vec<Pid>,
    pub address_space: AddressSpace,
}

impl Process {
    /// A process in the `Created` state, outside the tree and the ready list.
    pub fn new(
        handle: ProcessHandle,
        name: &str,
        thread: Thread,
        image: Image,
        address_space: AddressSpace,
        fds: SharedFdTable,
        cwd: WorkingDirectory,
    ) -> Self {
        Process {
            pid: handle.pid,
            generation: handle.generation,
            name: String::from(name),
            description: String::new(),
            argv: Vec::new(),
            thread,
            image,
            cwd,
            fds: Some(fds),
            exit_status: 0,
            flags: ProcessFlags::empty(),
            sleep_ticks: 0,
            waiting: None,
            parent: None,
            children: Vec::new(),
            address_space,
        }
    }

    pub fn state(&self) -> ProcessState {
        if self.flags.contains(ProcessFlags::FINISHED) {
            ProcessState::Zombie
        } else if !self.flags.contains(ProcessFlags::STARTED) {
            ProcessState::Created
        } else if self.flags.contains(ProcessFlags::SUSPENDED) {
            ProcessState::Suspended
        } else if self.flags.contains(ProcessFlags::SLEEPING) {
            ProcessState::Sleeping
        } else if self.waiting.is_some() {
            ProcessState::Blocked
        } else if self.flags.contains(ProcessFlags::RUNNING) {
            ProcessState::Running
        } else {
            ProcessState::Ready
        }
    }

    pub fn is_zombie(&self) -> bool {
        self.flags.contains(ProcessFlags::FINISHED)
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid,
            parent: self.parent,
            name: self.name.clone(),
            state: self.state(),
            children: self.children.len(),
            exit_status: self.is_zombie().then_some(self.exit_status),
        }
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("parent", &self.parent)
            .field("children", &self.children)
            .finish()
    }
}

/// Snapshot of one process for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub name: String,
    pub state: ProcessState,
    pub children: usize,
    pub exit_status: Option<i32>,
}
