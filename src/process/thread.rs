use alloc::boxed::Box;
use core::mem::size_of;

use x86_64::VirtAddr;

use crate::config::KERNEL_STACK_SIZE;
use crate::scheduler::context::{fork_trampoline, Context, FpuState, TrapFrame};

/// Kernel stack with the user trap frame at its very top, where the CPU
/// and the syscall entry push it on every trap from user mode.
#[repr(C, align(16))]
pub struct KernelStack {
    body: [u8; KERNEL_STACK_SIZE - size_of::<TrapFrame>()],
    frame: TrapFrame,
}

impl KernelStack {
    pub fn new() -> Box<KernelStack> {
        // SAFETY: bytes and integers only, so all-zero is a valid value.
        unsafe { Box::<KernelStack>::new_zeroed().assume_init() }
    }

    /// Stack pointer loaded into TSS.RSP0 while this thread runs.
    pub fn top(&self) -> VirtAddr {
        VirtAddr::from_ptr(self as *const KernelStack) + size_of::<KernelStack>() as u64
    }

    pub fn frame(&self) -> &TrapFrame {
        &self.frame
    }

    pub fn frame_mut(&mut self) -> &mut TrapFrame {
        &mut self.frame
    }

    fn frame_addr(&self) -> u64 {
        &self.frame as *const TrapFrame as u64
    }
}

pub struct Thread {
    pub context: Context,
    /// Used the FPU since it was last switched in; its registers are live
    /// and must be saved on the next switch away.
    pub fpu_touched: bool,
    /// Saved FPU state. Dropped when the process exits.
    pub fpu: Option<Box<FpuState>>,
    pub stack: Box<KernelStack>,
}

impl Thread {
    fn with_stack(stack: Box<KernelStack>, context: Context) -> Thread {
        Thread {
            context,
            fpu_touched: false,
            fpu: Some(Box::new(FpuState::initial())),
            stack,
        }
    }

    /// The boot flow adopted as a thread. Its context is filled on the first
    /// switch away from it.
    pub fn bootstrap() -> Thread {
        Thread::with_stack(KernelStack::new(), Context::empty())
    }

    /// Kernel task running `entry` with interrupts enabled.
    pub fn kernel(entry: fn()) -> Thread {
        let stack = KernelStack::new();
        let context = Context::task(entry as usize as u64, stack.frame_addr());
        Thread::with_stack(stack, context)
    }

    /// Thread whose first switch-in drops to user mode at `entry`.
    pub fn user(entry: VirtAddr, user_stack_top: VirtAddr) -> Thread {
        let mut stack = KernelStack::new();
        *stack.frame_mut() = TrapFrame::user_entry(entry.as_u64(), user_stack_top.as_u64());
        let context = Context::resume_at(fork_trampoline as usize as u64, stack.frame_addr());
        Thread::with_stack(stack, context)
    }

    /// Copy of `parent` that resumes from the parent's trap frame with
    /// `rax` as the result of the trapping call.
    pub fn fork_from(parent: &Thread, rax: u64) -> Thread {
        let mut stack = KernelStack::new();
        *stack.frame_mut() = TrapFrame {
            rax,
            ..*parent.stack.frame()
        };
        let context = Context::resume_at(fork_trampoline as usize as u64, stack.frame_addr());
        Thread {
            context,
            fpu_touched: false,
            fpu: parent.fpu.clone(),
            stack,
        }
    }

    pub fn stack_top(&self) -> VirtAddr {
        self.stack.top()
    }

    /// Writes live FPU registers of the running thread back to its buffer.
    pub fn sync_fpu(&mut self) {
        #[cfg(not(test))]
        if self.fpu_touched {
            if let Some(area) = self.fpu.as_deref_mut() {
                // SAFETY: a touched thread has CR0.TS clear and a valid buffer.
                unsafe { crate::scheduler::context::save_fpu(area) };
            }
        }
    }

    /// Buffer used to restore FPU state on first use after a switch.
    pub fn fpu_area(&mut self) -> &mut FpuState {
        self.fpu.get_or_insert_with(|| Box::new(FpuState::initial()))
    }

    /// Drops per-thread state that is useless once the process has exited.
    pub fn release(&mut self) {
        self.fpu = None;
        self.fpu_touched = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_frame_sits_at_the_stack_top() {
        let stack = KernelStack::new();
        assert_eq!(size_of::<KernelStack>(), KERNEL_STACK_SIZE);
        assert_eq!(stack.top().as_u64() % 16, 0);
        assert_eq!(
            stack.frame_addr() + size_of::<TrapFrame>() as u64,
            stack.top().as_u64()
        );
    }

    #[test]
    fn forked_thread_returns_chosen_value() {
        let mut parent = Thread::user(VirtAddr::new(0x40_0000), VirtAddr::new(0x7000_0000));
        parent.stack.frame_mut().rax = 4;
        parent.stack.frame_mut().rbx = 99;

        let child = Thread::fork_from(&parent, 0);
        assert_eq!(child.stack.frame().rax, 0);
        assert_eq!(child.stack.frame().rbx, 99);
        assert_eq!(child.stack.frame().rip, 0x40_0000);
        assert_eq!(child.context.rsp, child.stack.frame_addr());
        assert_eq!(child.context.rip, fork_trampoline as usize as u64);
        assert!(!child.fpu_touched);
        assert_eq!(parent.stack.frame().rax, 4);
    }

    #[test]
    fn released_thread_lazily_recreates_fpu_buffer() {
        let mut thread = Thread::kernel(|| {});
        thread.fpu_touched = true;
        thread.release();
        assert!(thread.fpu.is_none());
        assert!(!thread.fpu_touched);
        assert_eq!(thread.fpu_area().area[0], 0x7F);
    }
}
