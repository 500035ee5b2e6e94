pub mod context;

use alloc::collections::VecDeque;

use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::process::{Pid, ProcessFlags, ProcessState};
use context::{FpuState, SwitchFrames};

#[cfg(not(test))]
use spin::Mutex;

/// Round-robin ready list plus the bookkeeping for the running process.
///
/// The root process is never queued: it runs only when nothing else is
/// ready, and the tick handler preempts it as soon as something is.
#[derive(Debug)]
pub struct Scheduler {
    ready: VecDeque<Pid>,
    current: Pid,
    slice_ticks: u64,
    slice_left: u64,
    switches: u64,
}

/// A decided switch between two processes, still to be carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    pub from: Pid,
    pub to: Pid,
    /// The outgoing thread has live FPU registers to save.
    pub save_fpu: bool,
}

impl Scheduler {
    /// `capacity` is reserved up front so that queueing from the tick
    /// handler never allocates.
    pub fn new(capacity: usize, slice_ticks: u32) -> Self {
        let slice_ticks = u64::from(slice_ticks.max(1));
        Scheduler {
            ready: VecDeque::with_capacity(capacity),
            current: Pid::ROOT,
            slice_ticks,
            slice_left: slice_ticks,
            switches: 0,
        }
    }

    pub fn current(&self) -> Pid {
        self.current
    }

    /// Appends `pid` unless it is the root or already queued.
    pub fn enqueue(&mut self, pid: Pid) {
        if pid != Pid::ROOT && !self.is_queued(pid) {
            self.ready.push_back(pid);
        }
    }

    pub fn remove(&mut self, pid: Pid) {
        self.ready.retain(|&queued| queued != pid);
    }

    pub fn is_queued(&self, pid: Pid) -> bool {
        self.ready.contains(&pid)
    }

    pub fn ready(&self) -> impl Iterator<Item = Pid> + '_ {
        self.ready.iter().copied()
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Number of switches carried out since boot.
    pub fn switches(&self) -> u64 {
        self.switches
    }

    /// Counts one tick against the running slice. True once it runs out.
    pub(crate) fn consume_tick(&mut self) -> bool {
        self.slice_left = self.slice_left.saturating_sub(1);
        self.slice_left == 0
    }

    fn refill(&mut self) {
        self.slice_left = self.slice_ticks;
    }
}

impl<'m> Kernel<'m> {
    /// Puts `pid` on the ready list if nothing holds it off: not running,
    /// sleeping, suspended, blocked or exited.
    pub(crate) fn make_ready(&mut self, pid: Pid) {
        let Some(process) = self.processes.get_mut(pid) else {
            return;
        };
        process.flags.insert(ProcessFlags::STARTED);
        if process.state() == ProcessState::Ready {
            self.scheduler.enqueue(pid);
        }
    }

    fn is_runnable(&self, pid: Pid) -> bool {
        self.processes.get(pid).map_or(false, |process| {
            matches!(process.state(), ProcessState::Running | ProcessState::Ready)
        })
    }

    /// Gives up the CPU. With `reschedule` the caller competes again right
    /// away and keeps running if nothing else is ready; without it another
    /// ready process is chosen first. Returns `None` when the current
    /// process stays on the CPU.
    pub fn process_yield(&mut self, reschedule: bool) -> Option<Switch> {
        let prev = self.current();
        let runnable = self.is_runnable(prev);
        if let Some(process) = self.processes.get_mut(prev) {
            process.flags.remove(ProcessFlags::RUNNING);
        }

        if reschedule && runnable {
            self.scheduler.enqueue(prev);
        }
        let next = self.pick_next(runnable.then_some(prev));
        if !reschedule && runnable && next != prev {
            self.scheduler.enqueue(prev);
        }

        if let Some(process) = self.processes.get_mut(next) {
            process.flags.insert(ProcessFlags::STARTED | ProcessFlags::RUNNING);
        }
        self.scheduler.refill();
        if next == prev {
            return None;
        }

        self.scheduler.current = next;
        self.scheduler.switches += 1;
        let save_fpu = self
            .processes
            .get(prev)
            .map_or(false, |process| process.thread.fpu_touched);
        log::trace!("switch {} -> {}", prev, next);
        Some(Switch {
            from: prev,
            to: next,
            save_fpu,
        })
    }

    /// Next ready process, else `fallback`, else the root.
    fn pick_next(&mut self, fallback: Option<Pid>) -> Pid {
        while let Some(pid) = self.scheduler.ready.pop_front() {
            if self.is_runnable(pid) {
                return pid;
            }
        }
        fallback.unwrap_or(Pid::ROOT)
    }

    /// Holds `pid` off the ready list until resumed.
    pub fn suspend(&mut self, pid: Pid) -> KernelResult<Option<Switch>> {
        if pid == Pid::ROOT {
            return Err(KernelError::PermissionDenied);
        }
        let process = self
            .processes
            .get_mut(pid)
            .ok_or(KernelError::NoSuchProcess)?;
        if process.is_zombie() {
            return Err(KernelError::NoSuchProcess);
        }
        process.flags.insert(ProcessFlags::SUSPENDED);
        self.scheduler.remove(pid);
        if pid == self.current() {
            return Ok(self.process_yield(false));
        }
        Ok(None)
    }

    pub fn resume(&mut self, pid: Pid) -> KernelResult<()> {
        let process = self
            .processes
            .get_mut(pid)
            .ok_or(KernelError::NoSuchProcess)?;
        process.flags.remove(ProcessFlags::SUSPENDED);
        self.make_ready(pid);
        Ok(())
    }

    /// Collects the raw state the low-level switch needs. The outgoing
    /// thread's FPU registers count as saved from here on.
    pub fn switch_frames(&mut self, switch: &Switch) -> Option<SwitchFrames> {
        let prev = self.processes.get_mut(switch.from)?;
        let save_fpu = match switch.save_fpu {
            true => prev.thread.fpu.as_deref_mut().map(|area| area as *mut FpuState),
            false => None,
        };
        prev.thread.fpu_touched = false;
        let prev_context = &mut prev.thread.context as *mut _;

        let next = self.processes.get(switch.to)?;
        Some(SwitchFrames {
            prev: prev_context,
            next: &next.thread.context,
            next_root: next.address_space.root(),
            next_stack_top: next.thread.stack_top(),
            save_fpu,
        })
    }

    /// First FPU use since the current thread was switched in. Returns the
    /// buffer to restore its registers from.
    pub fn fpu_trap(&mut self) -> Option<*const FpuState> {
        let process = self.processes.get_mut(self.current())?;
        process.thread.fpu_touched = true;
        Some(process.thread.fpu_area() as *const FpuState)
    }
}

/// Wait step of [`crate::sync::Spinlock`]: hands the CPU over if the
/// scheduler is free to do so.
pub fn relax() {
    #[cfg(not(test))]
    try_yield_now();
    #[cfg(test)]
    core::hint::spin_loop();
}

/// Reached when a kernel task's entry function returns.
pub extern "C" fn exit_kernel_task() -> ! {
    #[cfg(not(test))]
    exit_current(0);
    #[cfg(test)]
    unreachable!("kernel tasks never run on the host");
}

#[cfg(not(test))]
static KERNEL: Mutex<Option<Kernel<'static>>> = Mutex::new(None);

/// Hands the kernel state to the scheduler. Called once at boot.
#[cfg(not(test))]
pub fn install(kernel: Kernel<'static>) {
    *KERNEL.lock() = Some(kernel);
    log::info!("scheduler active");
}

#[cfg(not(test))]
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel<'static>) -> R) -> Option<R> {
    crate::sync::without_interrupts(|| KERNEL.lock().as_mut().map(f))
}

#[cfg(not(test))]
fn run(frames: Option<SwitchFrames>) {
    if let Some(frames) = frames {
        // SAFETY: the frames point into boxed processes that outlive the
        // switch, no lock is held and interrupts are off.
        unsafe { context::perform(frames) };
    }
}

/// Decides a switch under the kernel lock and carries it out after the
/// lock is released.
#[cfg(not(test))]
pub fn reschedule_with(decide: impl FnOnce(&mut Kernel<'static>) -> Option<Switch>) {
    crate::sync::without_interrupts(|| {
        let frames = {
            let mut guard = KERNEL.lock();
            guard.as_mut().and_then(|kernel| {
                let switch = decide(kernel)?;
                kernel.switch_frames(&switch)
            })
        };
        run(frames);
    });
}

/// Cooperatively yield the CPU to the next ready process.
#[cfg(not(test))]
pub fn yield_now() {
    reschedule_with(|kernel| kernel.process_yield(true));
}

/// Like [`yield_now`] but gives up instead of waiting for the kernel lock.
#[cfg(not(test))]
pub fn try_yield_now() {
    crate::sync::without_interrupts(|| {
        let frames = KERNEL.try_lock().and_then(|mut guard| {
            let kernel = guard.as_mut()?;
            let switch = kernel.process_yield(true)?;
            kernel.switch_frames(&switch)
        });
        run(frames);
    });
}

/// Tick callback. Runs in interrupt context, so it skips the tick rather
/// than wait when the kernel lock is taken.
#[cfg(not(test))]
pub fn timer_tick() {
    let frames = KERNEL.try_lock().and_then(|mut guard| {
        let kernel = guard.as_mut()?;
        let switch = kernel.on_tick()?;
        kernel.switch_frames(&switch)
    });
    run(frames);
}

/// #NM handler body: restores the FPU state of the current thread.
#[cfg(not(test))]
pub fn device_not_available() {
    context::clear_task_switched();
    let area = KERNEL
        .try_lock()
        .and_then(|mut guard| guard.as_mut().and_then(Kernel::fpu_trap));
    if let Some(area) = area {
        // SAFETY: the buffer belongs to the running thread and holds an
        // FXSAVE image.
        unsafe { context::restore_fpu(area) };
    }
}

/// Terminate the current process and switch to the next one.
#[cfg(not(test))]
pub fn exit_current(status: i32) -> ! {
    x86_64::instructions::interrupts::disable();
    let frames = KERNEL.lock().as_mut().and_then(|kernel| {
        let switch = kernel.exit(status)?;
        kernel.switch_frames(&switch)
    });
    run(frames);
    log::error!("exit_current: nothing left to run");
    loop {
        x86_64::instructions::hlt();
    }
}

#[cfg(not(test))]
pub fn spawn(name: &str, entry: fn()) -> KernelResult<Pid> {
    with_kernel(|kernel| kernel.spawn_kernel(name, entry)).unwrap_or(Err(KernelError::NotSupported))
}

/// Body of the root process once boot is done.
#[cfg(not(test))]
pub fn idle() -> ! {
    loop {
        with_kernel(|kernel| kernel.reap_orphans());
        yield_now();
        x86_64::instructions::hlt();
    }
}
