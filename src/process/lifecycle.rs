use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use bitflags::bitflags;
use x86_64::{
    structures::paging::{Page, PageTableFlags},
    VirtAddr,
};

use super::{HeapBreak, Image, Pid, Process, ProcessFlags, ProcessHandle, Thread, WorkingDirectory};
use crate::config::{
    PAGE_SIZE, USER_HEAP_BASE, USER_IMAGE_BASE, USER_STACK_PAGES, USER_STACK_TOP,
};
use crate::error::{KernelError, KernelResult};
use crate::fs::fd::SharedFdTable;
use crate::kernel::Kernel;
use crate::memory::paging::AddressSpace;
use crate::scheduler::Switch;

/// Which children a `waitpid` call is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    Any,
    Child(Pid),
}

impl WaitTarget {
    /// Decodes the raw pid argument. There are no process groups, so 0
    /// waits for any child just like -1.
    pub fn from_raw(pid: i64) -> KernelResult<Self> {
        match pid {
            -1 | 0 => Ok(WaitTarget::Any),
            pid if pid > 0 && pid <= u32::MAX as i64 => Ok(WaitTarget::Child(Pid(pid as u32))),
            _ => Err(KernelError::InvalidArgument),
        }
    }

    pub fn matches(self, pid: Pid) -> bool {
        match self {
            WaitTarget::Any => true,
            WaitTarget::Child(target) => target == pid,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WaitOptions: u32 {
        /// Return instead of blocking when no child has exited yet.
        const NOHANG = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Reaped { pid: Pid, status: i32 },
    /// A matching child exists but none has exited, and the caller asked
    /// not to block.
    StillRunning,
    /// The caller left the ready list; retry after the switch completes.
    Blocked(Option<Switch>),
}

fn user_data() -> PageTableFlags {
    PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE
}

impl<'m> Kernel<'m> {
    /// Links a freshly built process under `parent` and makes it runnable.
    fn adopt(&mut self, process: Process, parent: Pid) -> KernelResult<Pid> {
        let pid = process.pid;
        self.processes.insert(Box::new(process))?;
        self.processes.attach(parent, pid)?;
        self.make_ready(pid);
        Ok(pid)
    }

    /// Starts a kernel task running `entry` in the kernel address space,
    /// as a child of the root process.
    pub fn spawn_kernel(&mut self, name: &str, entry: fn()) -> KernelResult<Pid> {
        let handle = self.processes.allocate()?;
        let process = Process::new(
            handle,
            name,
            Thread::kernel(entry),
            Image::empty(),
            AddressSpace::kernel(self.kernel_root),
            SharedFdTable::new(self.config.max_fds),
            WorkingDirectory::root(),
        );
        let pid = self.adopt(process, Pid::ROOT)?;
        log::info!("spawned kernel task '{}' as pid {}", name, pid);
        Ok(pid)
    }

    /// Starts a user process from a flat binary loaded at the image base,
    /// as a child of the current process.
    pub fn spawn_user(&mut self, name: &str, argv: &[&str], program: &[u8]) -> KernelResult<Pid> {
        let handle = self.processes.allocate()?;
        let mut space = AddressSpace::create(self.mem, self.kernel_root)?;
        if let Err(err) = load_program(self.mem, &mut space, program) {
            space.destroy(self.mem);
            return Err(err);
        }

        let entry = VirtAddr::new(USER_IMAGE_BASE);
        let stack_top = VirtAddr::new(USER_STACK_TOP);
        let image = Image {
            entry,
            size: program.len() as u64,
            user_stack: stack_top,
            heap: crate::sync::Spinlock::new(HeapBreak {
                base: USER_HEAP_BASE,
                actual: USER_HEAP_BASE,
                mapped: USER_HEAP_BASE,
            }),
        };
        let cwd = self
            .processes
            .get(self.current())
            .map_or_else(WorkingDirectory::root, |parent| parent.cwd.clone());

        let mut process = Process::new(
            handle,
            name,
            Thread::user(entry, stack_top),
            image,
            space,
            SharedFdTable::new(self.config.max_fds),
            cwd,
        );
        process.argv = argv.iter().map(|&arg| String::from(arg)).collect();
        let pid = self.adopt(process, self.current())?;
        log::info!("spawned '{}' as pid {} ({} bytes)", name, pid, program.len());
        Ok(pid)
    }

    /// Duplicates the current process. The child gets a private copy of
    /// the user address space, shares the descriptor table, and resumes
    /// from the same trap with a return value of 0.
    pub fn fork(&mut self) -> KernelResult<Pid> {
        let parent_pid = self.current();
        let handle = self.processes.allocate()?;
        let (mem, kernel_root) = (self.mem, self.kernel_root);

        let parent = self
            .processes
            .get_mut(parent_pid)
            .ok_or(KernelError::NoSuchProcess)?;
        if parent.address_space.is_kernel() {
            return Err(KernelError::NotSupported);
        }
        parent.thread.sync_fpu();
        let address_space = parent.address_space.duplicate(mem, kernel_root)?;

        let child = Process {
            pid: handle.pid,
            generation: handle.generation,
            name: parent.name.clone(),
            description: parent.description.clone(),
            argv: parent.argv.clone(),
            thread: Thread::fork_from(&parent.thread, 0),
            image: parent.image.snapshot(),
            cwd: parent.cwd.clone(),
            fds: parent.fds.as_ref().map(SharedFdTable::share),
            exit_status: 0,
            flags: ProcessFlags::empty(),
            sleep_ticks: 0,
            waiting: None,
            parent: None,
            children: Vec::new(),
            address_space,
        };

        let pid = self.adopt(child, parent_pid)?;
        log::debug!("fork: {} -> {}", parent_pid, pid);
        Ok(pid)
    }

    /// Ends the current process. It stays in the table as a zombie until
    /// reaped; its children move to the root. Returns the switch away.
    pub fn exit(&mut self, status: i32) -> Option<Switch> {
        let pid = self.current();
        assert!(pid != Pid::ROOT, "the root process cannot exit");
        // Zombies that exited before this one are off the CPU by now.
        self.reap_orphans();

        let mem = self.mem;
        if let Some(process) = self.processes.get_mut(pid) {
            process.exit_status = status;
            process.flags.remove(
                ProcessFlags::RUNNING | ProcessFlags::SLEEPING | ProcessFlags::SUSPENDED,
            );
            process.flags.insert(ProcessFlags::FINISHED);
            process.waiting = None;
            process.thread.release();
            process.fds = None;
            // `&mut` access proves no heap-break guard is outstanding.
            *process.image.heap.get_mut() = HeapBreak::default();
            let pages = process.address_space.clear_user(mem);
            log::debug!("pid {} exited with {} ({} pages released)", pid, status, pages);
        }

        self.scheduler.remove(pid);
        self.process_disown(pid);
        self.wake_waiting_parent(pid);
        self.process_yield(false)
    }

    /// Reparents every child of `parent` to the root. Children that already
    /// exited are reaped on the spot, since nobody can wait for them any
    /// more. Returns how many moved.
    pub fn process_disown(&mut self, parent: Pid) -> usize {
        if parent == Pid::ROOT {
            return 0;
        }
        let moved = self.processes.reparent_children(parent, Pid::ROOT);
        if !moved.is_empty() {
            log::debug!("pid {}: {} children handed to the root", parent, moved.len());
        }
        let current = self.current();
        for &child in &moved {
            let dead = self.processes.get(child).map_or(false, Process::is_zombie);
            if dead && child != current {
                if let Err(err) = self.reap(child) {
                    log::warn!("orphan {} not reaped: {}", child, err);
                }
            }
        }
        moved.len()
    }

    fn wake_waiting_parent(&mut self, child: Pid) {
        let Some(parent_pid) = self.processes.get(child).and_then(|process| process.parent) else {
            return;
        };
        let Some(parent) = self.processes.get_mut(parent_pid) else {
            return;
        };
        if parent.waiting.map_or(false, |target| target.matches(child)) {
            parent.waiting = None;
            self.make_ready(parent_pid);
        }
    }

    /// Collects an exited child of the current process.
    pub fn waitpid(&mut self, target: WaitTarget, options: WaitOptions) -> KernelResult<WaitOutcome> {
        let me = self.current();
        let process = self.processes.get(me).ok_or(KernelError::NoSuchProcess)?;

        let mut matched = false;
        let mut exited = None;
        for &child in process.children.iter().filter(|&&child| target.matches(child)) {
            matched = true;
            if self.processes.get(child).map_or(false, Process::is_zombie) {
                exited = Some(child);
                break;
            }
        }
        if !matched {
            return Err(KernelError::NoSuchProcess);
        }
        if let Some(child) = exited {
            let status = self.reap(child)?;
            return Ok(WaitOutcome::Reaped { pid: child, status });
        }
        // The idle process must stay runnable.
        if options.contains(WaitOptions::NOHANG) || me == Pid::ROOT {
            return Ok(WaitOutcome::StillRunning);
        }

        if let Some(process) = self.processes.get_mut(me) {
            process.waiting = Some(target);
            process.flags.remove(ProcessFlags::RUNNING);
        }
        self.scheduler.remove(me);
        Ok(WaitOutcome::Blocked(self.process_yield(false)))
    }

    /// Removes a zombie from the tree and the table and frees what it
    /// still holds. Returns its exit status.
    pub fn reap(&mut self, pid: Pid) -> KernelResult<i32> {
        let process = self.processes.get(pid).ok_or(KernelError::NoSuchProcess)?;
        if !process.is_zombie() {
            return Err(KernelError::InvalidArgument);
        }
        self.processes.detach(pid);
        let process = self.processes.remove(pid)?;
        let Process {
            exit_status,
            address_space,
            ..
        } = *process;
        address_space.destroy(self.mem);
        log::debug!("pid {} reaped, status {}", pid, exit_status);
        Ok(exit_status)
    }

    /// Reaps zombies that were handed to the root. Called from the idle
    /// loop and on every exit, never for the process that is still on the CPU.
    pub fn reap_orphans(&mut self) -> usize {
        let current = self.current();
        let orphans: Vec<Pid> = self
            .processes
            .iter()
            .filter(|process| {
                process.is_zombie() && process.parent == Some(Pid::ROOT) && process.pid != current
            })
            .map(|process| process.pid)
            .collect();
        for &pid in &orphans {
            if let Err(err) = self.reap(pid) {
                log::warn!("orphan {} not reaped: {}", pid, err);
            }
        }
        orphans.len()
    }

    pub fn getpid(&self) -> Pid {
        self.current()
    }

    pub fn getppid(&self) -> Option<Pid> {
        self.processes.get(self.current())?.parent
    }

    /// Moves the user heap break of the current process by `increment`
    /// bytes and returns the previous break. Growth maps zeroed pages;
    /// shrinking keeps them mapped for reuse.
    pub fn sbrk(&mut self, increment: i64) -> KernelResult<u64> {
        let mem = self.mem;
        let pid = self.current();
        let process = self
            .processes
            .get_mut(pid)
            .ok_or(KernelError::NoSuchProcess)?;
        if process.address_space.is_kernel() {
            return Err(KernelError::PermissionDenied);
        }

        let Process {
            image,
            address_space,
            ..
        } = process;
        let mut brk = image.heap.lock();
        let old = brk.actual;
        let new = old
            .checked_add_signed(increment)
            .filter(|&new| new >= brk.base)
            .ok_or(KernelError::InvalidArgument)?;
        let limit = USER_STACK_TOP - (USER_STACK_PAGES * PAGE_SIZE) as u64;
        if new > limit {
            return Err(KernelError::OutOfMemory);
        }

        let wanted = VirtAddr::new(new).align_up(PAGE_SIZE as u64).as_u64();
        if wanted > brk.mapped {
            let pages = Page::range(
                Page::containing_address(VirtAddr::new(brk.mapped)),
                Page::containing_address(VirtAddr::new(wanted)),
            );
            address_space.map_fresh(mem, pages, user_data())?;
            brk.mapped = wanted;
        }
        brk.actual = new;
        Ok(old)
    }

    /// Copies a value out to the current process's memory.
    pub fn write_user(&self, addr: VirtAddr, bytes: &[u8]) -> KernelResult<()> {
        let process = self
            .processes
            .get(self.current())
            .ok_or(KernelError::NoSuchProcess)?;
        process.address_space.write_user(self.mem, addr, bytes)
    }

    /// Fails unless the current process may write `len` bytes at `addr`.
    pub fn check_user_writable(&self, addr: VirtAddr, len: usize) -> KernelResult<()> {
        let process = self
            .processes
            .get(self.current())
            .ok_or(KernelError::NoSuchProcess)?;
        process.address_space.check_user_writable(self.mem, addr, len)
    }

    /// Handle on the current process, for callers that hold on to it
    /// across switches.
    pub fn current_handle(&self) -> Option<ProcessHandle> {
        self.processes.handle(self.current())
    }
}

/// Maps code and stack pages and copies the program in.
fn load_program(
    mem: &crate::memory::PhysicalMemory,
    space: &mut AddressSpace,
    program: &[u8],
) -> KernelResult<()> {
    let code_pages = program.len().max(1).div_ceil(PAGE_SIZE) as u64;
    let code = Page::containing_address(VirtAddr::new(USER_IMAGE_BASE));
    space.map_fresh(mem, Page::range(code, code + code_pages), user_data())?;
    space.write_user(mem, code.start_address(), program)?;

    let stack_end = Page::containing_address(VirtAddr::new(USER_STACK_TOP));
    space.map_fresh(
        mem,
        Page::range(stack_end - USER_STACK_PAGES as u64, stack_end),
        user_data(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::fd::OpenMode;
    use crate::fs::testing::CountingNode;
    use crate::fs::NodeHandle;
    use crate::kernel::testing::{boot, schedule, PROGRAM};
    use crate::memory::testing::TestMemory;
    use crate::process::ProcessState;
    use crate::scheduler::context::fork_trampoline;
    use alloc::sync::Arc;
    use proptest::prelude::*;

    #[test]
    fn fork_shares_descriptors_and_returns_zero_in_child() {
        let mem = TestMemory::new(256);
        let mut kernel = boot(&mem);
        let a = kernel.spawn_user("a", &["a"], PROGRAM).unwrap();
        assert_eq!(a, Pid(1));

        let node = Arc::new(CountingNode::new("console"));
        let fds = kernel.process_mut(a).unwrap().fds.as_mut().unwrap();
        let fd = fds.modify().open(NodeHandle::open(node.clone()), OpenMode::WRITE).unwrap();
        assert_eq!(fds.ref_count(), 1);

        schedule(&mut kernel, a);
        kernel.process_mut(a).unwrap().thread.stack.frame_mut().rax = 4;
        let b = kernel.fork().unwrap();
        assert_eq!(b, Pid(2));

        let parent_fds = kernel.process(a).unwrap().fds.as_ref().unwrap();
        let child_fds = kernel.process(b).unwrap().fds.as_ref().unwrap();
        assert!(parent_fds.is_shared_with(child_fds));
        assert_eq!(parent_fds.ref_count(), 2);

        let child = kernel.process(b).unwrap();
        assert_eq!(child.parent, Some(a));
        assert_eq!(child.thread.stack.frame().rax, 0);
        assert_eq!(child.thread.context.rip, fork_trampoline as usize as u64);
        assert_eq!(kernel.process(a).unwrap().thread.stack.frame().rax, 4);
        assert_eq!(kernel.process(a).unwrap().children, [b]);

        // Closing in the parent leaves the node open for the child.
        let parent_fds = kernel.process_mut(a).unwrap().fds.as_mut().unwrap();
        drop(parent_fds.modify().close(fd).unwrap());
        assert_eq!(node.closes(), 0);
        assert!(kernel.process(b).unwrap().fds.as_ref().unwrap().lock().get(fd).is_ok());

        schedule(&mut kernel, b);
        assert_eq!(kernel.current(), b);
        kernel.exit(0);
        assert_eq!(node.closes(), 1);
    }

    #[test]
    fn child_exit_is_reaped_exactly_once() {
        let mem = TestMemory::new(256);
        let mut kernel = boot(&mem);
        let a = kernel.spawn_user("a", &[], PROGRAM).unwrap();
        schedule(&mut kernel, a);
        let b = kernel.fork().unwrap();

        schedule(&mut kernel, b);
        let switch = kernel.exit(7).unwrap();
        assert_eq!(switch.from, b);
        assert_eq!(kernel.process(b).unwrap().state(), ProcessState::Zombie);

        schedule(&mut kernel, a);
        assert_eq!(
            kernel.waitpid(WaitTarget::Child(b), WaitOptions::empty()),
            Ok(WaitOutcome::Reaped { pid: b, status: 7 })
        );
        assert!(kernel.process(b).is_none());
        assert!(kernel.process(a).unwrap().children.is_empty());
        assert_eq!(
            kernel.waitpid(WaitTarget::Child(b), WaitOptions::empty()),
            Err(KernelError::NoSuchProcess)
        );
    }

    #[test]
    fn waiting_parent_blocks_until_child_exits() {
        let mem = TestMemory::new(256);
        let mut kernel = boot(&mem);
        let a = kernel.spawn_user("a", &[], PROGRAM).unwrap();
        schedule(&mut kernel, a);
        let b = kernel.fork().unwrap();

        assert_eq!(
            kernel.waitpid(WaitTarget::Any, WaitOptions::NOHANG),
            Ok(WaitOutcome::StillRunning)
        );
        let outcome = kernel.waitpid(WaitTarget::Any, WaitOptions::empty()).unwrap();
        let WaitOutcome::Blocked(Some(switch)) = outcome else {
            panic!("expected to block, got {:?}", outcome);
        };
        assert_eq!((switch.from, switch.to), (a, b));
        assert_eq!(kernel.process(a).unwrap().state(), ProcessState::Blocked);
        assert!(!kernel.scheduler().is_queued(a));

        kernel.exit(3);
        assert_eq!(kernel.process(a).unwrap().state(), ProcessState::Running);
        assert_eq!(kernel.current(), a);
        assert_eq!(
            kernel.waitpid(WaitTarget::Any, WaitOptions::empty()),
            Ok(WaitOutcome::Reaped { pid: b, status: 3 })
        );
    }

    #[test]
    fn waitpid_on_stranger_changes_nothing() {
        let mem = TestMemory::new(256);
        let mut kernel = boot(&mem);
        let a = kernel.spawn_user("a", &[], PROGRAM).unwrap();
        let other = kernel.spawn_user("other", &[], PROGRAM).unwrap();
        schedule(&mut kernel, a);

        assert_eq!(
            kernel.waitpid(WaitTarget::Child(other), WaitOptions::empty()),
            Err(KernelError::NoSuchProcess)
        );
        assert_eq!(
            kernel.waitpid(WaitTarget::Any, WaitOptions::empty()),
            Err(KernelError::NoSuchProcess)
        );
        assert_eq!(kernel.current(), a);
        assert_eq!(kernel.process(a).unwrap().state(), ProcessState::Running);
        assert_eq!(WaitTarget::from_raw(-7), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn orphans_move_to_root_and_are_reaped_there() {
        let mem = TestMemory::new(256);
        let mut kernel = boot(&mem);
        let baseline = mem.stats().free;

        let a = kernel.spawn_user("a", &[], PROGRAM).unwrap();
        schedule(&mut kernel, a);
        let b = kernel.fork().unwrap();
        let c = kernel.fork().unwrap();

        kernel.exit(1);
        assert_eq!(kernel.process(b).unwrap().parent, Some(Pid::ROOT));
        assert_eq!(kernel.process(c).unwrap().parent, Some(Pid::ROOT));
        assert!(kernel.processes().is_tree_consistent());

        schedule(&mut kernel, b);
        kernel.exit(0);
        // The next exit collected `a`, which was already off the CPU.
        assert!(kernel.process(a).is_none());
        schedule(&mut kernel, c);
        kernel.exit(0);
        assert!(kernel.process(b).is_none());
        assert_eq!(kernel.current(), Pid::ROOT);

        assert_eq!(kernel.reap_orphans(), 1);
        assert_eq!(kernel.processes().len(), 1);
        assert_eq!(mem.stats().free, baseline);
    }

    #[test]
    fn dead_children_are_reaped_when_their_parent_exits() {
        let mem = TestMemory::new(256);
        let mut kernel = boot(&mem);
        let a = kernel.spawn_user("a", &[], PROGRAM).unwrap();
        schedule(&mut kernel, a);
        let b = kernel.fork().unwrap();
        let c = kernel.fork().unwrap();
        schedule(&mut kernel, b);
        kernel.exit(3);
        assert!(kernel.process(b).unwrap().is_zombie());

        schedule(&mut kernel, a);
        assert_eq!(kernel.process_disown(a), 2);
        assert!(kernel.process(b).is_none());
        assert_eq!(kernel.process(c).unwrap().parent, Some(Pid::ROOT));
        assert!(kernel.processes().is_tree_consistent());
    }

    #[test]
    fn root_zombies_do_not_pile_up_under_load() {
        let mem = TestMemory::new(256);
        let mut kernel = crate::kernel::testing::boot_with(&mem, 4);
        let baseline = mem.stats().free;

        for round in 0..20 {
            let pid = kernel.spawn_user("worker", &[], PROGRAM).unwrap();
            schedule(&mut kernel, pid);
            kernel.exit(round);
            let zombies = kernel.processes().iter().filter(|p| p.is_zombie()).count();
            assert_eq!(zombies, 1);
        }
        assert_eq!(kernel.reap_orphans(), 1);
        assert_eq!(mem.stats().free, baseline);
    }

    #[test]
    fn fork_fails_cleanly_when_pids_run_out() {
        let mem = TestMemory::new(512);
        let mut kernel = crate::kernel::testing::boot_with(&mem, 3);
        let a = kernel.spawn_user("a", &[], PROGRAM).unwrap();
        schedule(&mut kernel, a);
        kernel.fork().unwrap();
        let free = mem.stats().free;

        assert_eq!(kernel.fork(), Err(KernelError::PidExhausted));
        assert_eq!(mem.stats().free, free);
        assert!(kernel.processes().is_tree_consistent());
    }

    #[test]
    fn fork_fails_cleanly_without_memory() {
        let mem = TestMemory::new(24);
        let mut kernel = boot(&mem);
        let a = kernel.spawn_user("a", &[], PROGRAM).unwrap();
        schedule(&mut kernel, a);
        let free = mem.stats().free;

        assert_eq!(kernel.fork(), Err(KernelError::OutOfMemory));
        assert_eq!(mem.stats().free, free);
        assert_eq!(kernel.processes().len(), 2);
    }

    #[test]
    fn stale_handles_do_not_resolve_after_pid_reuse() {
        let mem = TestMemory::new(256);
        let mut kernel = crate::kernel::testing::boot_with(&mem, 3);
        let a = kernel.spawn_user("a", &[], PROGRAM).unwrap();
        schedule(&mut kernel, a);
        let b = kernel.fork().unwrap();
        let handle = kernel.handle(b).unwrap();

        schedule(&mut kernel, b);
        kernel.exit(0);
        schedule(&mut kernel, a);
        kernel.waitpid(WaitTarget::Child(b), WaitOptions::empty()).unwrap();

        let again = kernel.fork().unwrap();
        assert_eq!(again, b);
        assert!(kernel.resolve(handle).is_none());
        assert!(kernel.resolve(kernel.handle(again).unwrap()).is_some());
    }

    #[test]
    fn kernel_tasks_cannot_fork_or_grow_a_user_heap() {
        let mem = TestMemory::new(64);
        let mut kernel = boot(&mem);
        let task = kernel.spawn_kernel("worker", || {}).unwrap();
        schedule(&mut kernel, task);
        assert_eq!(kernel.fork(), Err(KernelError::NotSupported));
        assert_eq!(kernel.sbrk(4096), Err(KernelError::PermissionDenied));
        assert_eq!(kernel.getppid(), Some(Pid::ROOT));
    }

    #[test]
    fn sbrk_maps_pages_on_growth() {
        let mem = TestMemory::new(256);
        let mut kernel = boot(&mem);
        let a = kernel.spawn_user("a", &[], PROGRAM).unwrap();
        schedule(&mut kernel, a);

        assert_eq!(kernel.sbrk(100), Ok(USER_HEAP_BASE));
        assert_eq!(kernel.sbrk(5000), Ok(USER_HEAP_BASE + 100));
        let pages = kernel.process(a).unwrap().address_space.user_pages(&mem);
        assert_eq!(kernel.sbrk(-5000), Ok(USER_HEAP_BASE + 5100));
        assert_eq!(kernel.process(a).unwrap().address_space.user_pages(&mem), pages);
        assert_eq!(kernel.sbrk(-200), Err(KernelError::InvalidArgument));

        kernel
            .write_user(VirtAddr::new(USER_HEAP_BASE + 4096), &[1, 2, 3])
            .unwrap();
    }

    #[derive(Debug, Clone)]
    enum Op {
        Fork(usize),
        Exit(usize, i32),
        Wait(usize, bool),
        ReapOrphans,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..8).prop_map(Op::Fork),
            (0usize..8, 0i32..100).prop_map(|(i, code)| Op::Exit(i, code)),
            (0usize..8, any::<bool>()).prop_map(|(i, block)| Op::Wait(i, block)),
            Just(Op::ReapOrphans),
        ]
    }

    fn runnable(kernel: &Kernel<'_>) -> Vec<Pid> {
        kernel
            .processes()
            .iter()
            .filter(|p| p.pid != Pid::ROOT)
            .filter(|p| matches!(p.state(), ProcessState::Ready | ProcessState::Running))
            .map(|p| p.pid)
            .collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn tree_stays_connected(ops in proptest::collection::vec(op(), 1..40)) {
            let mem = TestMemory::new(512);
            let mut kernel = crate::kernel::testing::boot_with(&mem, 12);
            kernel.spawn_user("init", &[], PROGRAM).unwrap();

            for op in ops {
                let choices = runnable(&kernel);
                let pick = |i: usize| choices.get(i % choices.len().max(1)).copied();
                match op {
                    Op::Fork(i) => if let Some(pid) = pick(i) {
                        schedule(&mut kernel, pid);
                        let _ = kernel.fork();
                    },
                    Op::Exit(i, code) => if let Some(pid) = pick(i) {
                        schedule(&mut kernel, pid);
                        kernel.exit(code);
                    },
                    Op::Wait(i, block) => if let Some(pid) = pick(i) {
                        schedule(&mut kernel, pid);
                        let options = if block { WaitOptions::empty() } else { WaitOptions::NOHANG };
                        let _ = kernel.waitpid(WaitTarget::Any, options);
                    },
                    Op::ReapOrphans => {
                        kernel.reap_orphans();
                    }
                }

                prop_assert!(kernel.processes().is_tree_consistent());
                let mut pids: Vec<u32> = kernel.processes().iter().map(|p| p.pid.0).collect();
                prop_assert!(pids.iter().all(|&pid| (pid as usize) < 12));
                pids.dedup();
                prop_assert_eq!(pids.len(), kernel.processes().len());
            }
        }
    }
}
