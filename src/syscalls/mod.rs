use spin::Once;
use x86_64::VirtAddr;

use crate::config::MAX_SYSCALLS;
use crate::error::{KernelError, KernelResult};
use crate::fs::fd::FileDescriptorTable;
use crate::kernel::Kernel;
use crate::process::{Pid, WaitOptions, WaitOutcome, WaitTarget};
use crate::scheduler::Switch;

/// Syscall numbers (passed in RAX from userland).
pub const SYS_EXIT: u64 = 0;
/// Reserved for the console driver.
pub const SYS_WRITE: u64 = 1;
pub const SYS_YIELD: u64 = 2;
pub const SYS_GETPID: u64 = 3;
pub const SYS_FORK: u64 = 4;
pub const SYS_WAITPID: u64 = 5;
pub const SYS_SLEEP: u64 = 6;
pub const SYS_SBRK: u64 = 7;
pub const SYS_GETPPID: u64 = 8;
pub const SYS_CLONE: u64 = 9;
pub const SYS_CLOSE: u64 = 10;
pub const SYS_DUP: u64 = 11;
pub const SYS_DUP2: u64 = 12;

/// What the trap path does once a handler has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Return the value to the caller.
    Complete(i64),
    /// Store the value as the caller's result, then switch away.
    Switch(i64, Option<Switch>),
    /// The caller blocked; run the call again once it is resumed.
    Block(Option<Switch>),
}

/// Handlers get the kernel state and the raw rdi, rsi, rdx arguments.
pub type Handler = fn(&mut Kernel<'_>, [u64; 3]) -> Outcome;

pub struct SyscallTable {
    handlers: [Option<Handler>; MAX_SYSCALLS],
}

impl SyscallTable {
    pub const fn empty() -> Self {
        SyscallTable {
            handlers: [None; MAX_SYSCALLS],
        }
    }

    pub fn install(&mut self, number: u64, handler: Handler) -> KernelResult<()> {
        let slot = usize::try_from(number)
            .ok()
            .and_then(|number| self.handlers.get_mut(number))
            .ok_or(KernelError::InvalidArgument)?;
        *slot = Some(handler);
        Ok(())
    }

    /// The process-core calls. `write` is left to the console driver and
    /// `clone` is reserved.
    pub fn with_core_handlers() -> Self {
        let mut table = SyscallTable::empty();
        let core: [(u64, Handler); 12] = [
            (SYS_EXIT, sys_exit),
            (SYS_YIELD, sys_yield),
            (SYS_GETPID, sys_getpid),
            (SYS_FORK, sys_fork),
            (SYS_WAITPID, sys_waitpid),
            (SYS_SLEEP, sys_sleep),
            (SYS_SBRK, sys_sbrk),
            (SYS_GETPPID, sys_getppid),
            (SYS_CLONE, sys_clone),
            (SYS_CLOSE, sys_close),
            (SYS_DUP, sys_dup),
            (SYS_DUP2, sys_dup2),
        ];
        for (number, handler) in core {
            table.handlers[number as usize] = Some(handler);
        }
        table
    }

    pub fn dispatch(&self, kernel: &mut Kernel<'_>, number: u64, args: [u64; 3]) -> Outcome {
        let handler = usize::try_from(number)
            .ok()
            .and_then(|number| self.handlers.get(number).copied().flatten());
        match handler {
            Some(handler) => handler(kernel, args),
            None => {
                log::warn!("syscall: unknown number {}", number);
                Outcome::Complete(KernelError::NotSupported.errno())
            }
        }
    }
}

fn complete(result: KernelResult<i64>) -> Outcome {
    Outcome::Complete(result.unwrap_or_else(KernelError::errno))
}

fn sys_exit(kernel: &mut Kernel<'_>, [status, ..]: [u64; 3]) -> Outcome {
    Outcome::Switch(0, kernel.exit(status as i32))
}

fn sys_yield(kernel: &mut Kernel<'_>, _: [u64; 3]) -> Outcome {
    Outcome::Switch(0, kernel.process_yield(true))
}

fn sys_getpid(kernel: &mut Kernel<'_>, _: [u64; 3]) -> Outcome {
    Outcome::Complete(i64::from(kernel.getpid().0))
}

fn sys_getppid(kernel: &mut Kernel<'_>, _: [u64; 3]) -> Outcome {
    Outcome::Complete(kernel.getppid().map_or(0, |pid| i64::from(pid.0)))
}

fn sys_fork(kernel: &mut Kernel<'_>, _: [u64; 3]) -> Outcome {
    complete(kernel.fork().map(|pid| i64::from(pid.0)))
}

/// `waitpid(pid, status, options)`. The status pointer may be null.
fn sys_waitpid(kernel: &mut Kernel<'_>, args: [u64; 3]) -> Outcome {
    wait(kernel, args).unwrap_or_else(|err| Outcome::Complete(err.errno()))
}

fn wait(kernel: &mut Kernel<'_>, [pid, status, options]: [u64; 3]) -> KernelResult<Outcome> {
    let target = WaitTarget::from_raw(pid as i64)?;
    let options = u32::try_from(options)
        .ok()
        .and_then(WaitOptions::from_bits)
        .ok_or(KernelError::InvalidArgument)?;
    let status = (status != 0)
        .then(|| VirtAddr::try_new(status))
        .transpose()
        .map_err(|_| KernelError::InvalidAddress)?;
    // Fault before reaping so a bad pointer loses no exit status.
    if let Some(addr) = status {
        kernel.check_user_writable(addr, core::mem::size_of::<i32>())?;
    }

    Ok(match kernel.waitpid(target, options)? {
        WaitOutcome::Reaped { pid, status: code } => {
            if let Some(addr) = status {
                kernel.write_user(addr, &code.to_le_bytes())?;
            }
            Outcome::Complete(i64::from(pid.0))
        }
        WaitOutcome::StillRunning => Outcome::Complete(0),
        WaitOutcome::Blocked(switch) => Outcome::Block(switch),
    })
}

fn sys_sleep(kernel: &mut Kernel<'_>, [ms, ..]: [u64; 3]) -> Outcome {
    Outcome::Switch(0, kernel.process_sleep(ms))
}

fn sys_sbrk(kernel: &mut Kernel<'_>, [increment, ..]: [u64; 3]) -> Outcome {
    complete(kernel.sbrk(increment as i64).map(|old| old as i64))
}

fn sys_clone(_: &mut Kernel<'_>, _: [u64; 3]) -> Outcome {
    Outcome::Complete(KernelError::NotSupported.errno())
}

/// Runs `f` on the caller's descriptor table, unsharing it first.
fn descriptors<T>(
    kernel: &mut Kernel<'_>,
    f: impl FnOnce(&mut FileDescriptorTable) -> KernelResult<T>,
) -> KernelResult<T> {
    let pid: Pid = kernel.current();
    let fds = kernel
        .process_mut(pid)
        .and_then(|process| process.fds.as_mut())
        .ok_or(KernelError::NoSuchProcess)?;
    let mut table = fds.modify();
    f(&mut table)
}

fn fd(raw: u64) -> KernelResult<usize> {
    usize::try_from(raw).map_err(|_| KernelError::BadDescriptor)
}

fn sys_close(kernel: &mut Kernel<'_>, [raw, ..]: [u64; 3]) -> Outcome {
    complete(descriptors(kernel, |table| table.close(fd(raw)?)).map(|_| 0))
}

fn sys_dup(kernel: &mut Kernel<'_>, [raw, ..]: [u64; 3]) -> Outcome {
    complete(descriptors(kernel, |table| table.dup(fd(raw)?)).map(|fd| fd as i64))
}

fn sys_dup2(kernel: &mut Kernel<'_>, [old, new, _]: [u64; 3]) -> Outcome {
    complete(descriptors(kernel, |table| table.dup2(fd(old)?, fd(new)?)).map(|fd| fd as i64))
}

static SYSCALLS: Once<SyscallTable> = Once::new();

pub fn init() {
    SYSCALLS.call_once(SyscallTable::with_core_handlers);
    log::info!("syscall table installed");
}

/// Rust half of the `int 0x80` entry. `frame` is the caller's saved
/// registers at the top of its kernel stack; the result goes back in rax.
#[cfg(not(test))]
pub extern "C" fn syscall_trap(frame: &mut crate::scheduler::context::TrapFrame) {
    let Some(table) = SYSCALLS.get() else {
        frame.rax = KernelError::NotSupported.errno() as u64;
        return;
    };
    loop {
        let number = frame.rax;
        let args = [frame.rdi, frame.rsi, frame.rdx];
        let mut blocked = false;
        crate::scheduler::reschedule_with(|kernel| match table.dispatch(kernel, number, args) {
            Outcome::Complete(value) => {
                frame.rax = value as u64;
                None
            }
            Outcome::Switch(value, switch) => {
                frame.rax = value as u64;
                switch
            }
            Outcome::Block(switch) => {
                blocked = true;
                switch
            }
        });
        if !blocked {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::USER_STACK_TOP;
    use crate::error::errno;
    use crate::fs::fd::OpenMode;
    use crate::fs::testing::CountingNode;
    use crate::fs::NodeHandle;
    use crate::kernel::testing::{boot, schedule, PROGRAM};
    use crate::memory::testing::TestMemory;
    use alloc::sync::Arc;

    const STATUS_ADDR: u64 = USER_STACK_TOP - 16;

    fn call(kernel: &mut Kernel<'_>, number: u64, args: [u64; 3]) -> Outcome {
        SyscallTable::with_core_handlers().dispatch(kernel, number, args)
    }

    fn read_i32(kernel: &Kernel<'_>, pid: Pid, addr: u64) -> i32 {
        let process = kernel.process(pid).unwrap();
        let phys = process
            .address_space
            .translate(kernel.memory(), VirtAddr::new(addr))
            .unwrap();
        unsafe { *kernel.memory().phys_to_virt(phys).as_ptr::<i32>() }
    }

    #[test]
    fn unknown_and_reserved_numbers_fail_with_enosys() {
        let mem = TestMemory::new(16);
        let mut kernel = boot(&mem);
        let enosys = Outcome::Complete(-errno::ENOSYS);
        assert_eq!(call(&mut kernel, SYS_CLONE, [0; 3]), enosys);
        assert_eq!(call(&mut kernel, SYS_WRITE, [0; 3]), enosys);
        assert_eq!(call(&mut kernel, 31, [0; 3]), enosys);
        assert_eq!(call(&mut kernel, u64::MAX, [0; 3]), enosys);

        let mut table = SyscallTable::empty();
        assert_eq!(table.install(MAX_SYSCALLS as u64, sys_getpid), Err(KernelError::InvalidArgument));
        table.install(SYS_WRITE, sys_getpid).unwrap();
        assert_eq!(table.dispatch(&mut kernel, SYS_WRITE, [0; 3]), Outcome::Complete(0));
    }

    #[test]
    fn fork_wait_round_trip_through_the_table() {
        let mem = TestMemory::new(128);
        let mut kernel = boot(&mem);
        let a = kernel.spawn_user("a", &[], PROGRAM).unwrap();
        schedule(&mut kernel, a);

        assert_eq!(call(&mut kernel, SYS_GETPID, [0; 3]), Outcome::Complete(1));
        assert_eq!(call(&mut kernel, SYS_GETPPID, [0; 3]), Outcome::Complete(0));
        assert_eq!(call(&mut kernel, SYS_FORK, [0; 3]), Outcome::Complete(2));
        let b = Pid(2);

        schedule(&mut kernel, b);
        assert_eq!(call(&mut kernel, SYS_GETPPID, [0; 3]), Outcome::Complete(1));
        let Outcome::Switch(0, Some(switch)) = call(&mut kernel, SYS_EXIT, [7, 0, 0]) else {
            panic!("exit must switch away");
        };
        assert_eq!(switch.from, b);

        schedule(&mut kernel, a);
        assert_eq!(
            call(&mut kernel, SYS_WAITPID, [u64::MAX, 0x10, 0]),
            Outcome::Complete(-errno::EFAULT)
        );
        assert!(kernel.process(b).is_some());
        assert_eq!(
            call(&mut kernel, SYS_WAITPID, [2, STATUS_ADDR, 0]),
            Outcome::Complete(2)
        );
        assert_eq!(read_i32(&kernel, a, STATUS_ADDR), 7);
        assert_eq!(
            call(&mut kernel, SYS_WAITPID, [2, STATUS_ADDR, 0]),
            Outcome::Complete(-errno::ESRCH)
        );
    }

    #[test]
    fn failed_or_pending_waits_leave_the_status_word_alone() {
        let mem = TestMemory::new(128);
        let mut kernel = boot(&mem);
        let a = kernel.spawn_user("a", &[], PROGRAM).unwrap();
        schedule(&mut kernel, a);
        let sentinel = 0x5A5A_5A5Ai32;
        kernel
            .write_user(VirtAddr::new(STATUS_ADDR), &sentinel.to_le_bytes())
            .unwrap();

        assert_eq!(
            call(&mut kernel, SYS_WAITPID, [u64::MAX, STATUS_ADDR, 0]),
            Outcome::Complete(-errno::ESRCH)
        );
        assert_eq!(
            call(&mut kernel, SYS_WAITPID, [9, STATUS_ADDR, 0]),
            Outcome::Complete(-errno::ESRCH)
        );
        assert_eq!(read_i32(&kernel, a, STATUS_ADDR), sentinel);

        call(&mut kernel, SYS_FORK, [0; 3]);
        let nohang = WaitOptions::NOHANG.bits() as u64;
        assert_eq!(
            call(&mut kernel, SYS_WAITPID, [u64::MAX, STATUS_ADDR, nohang]),
            Outcome::Complete(0)
        );
        assert!(matches!(
            call(&mut kernel, SYS_WAITPID, [u64::MAX, STATUS_ADDR, 0]),
            Outcome::Block(_)
        ));
        assert_eq!(read_i32(&kernel, a, STATUS_ADDR), sentinel);
    }

    #[test]
    fn waitpid_blocks_or_returns_zero_with_nohang() {
        let mem = TestMemory::new(128);
        let mut kernel = boot(&mem);
        let a = kernel.spawn_user("a", &[], PROGRAM).unwrap();
        schedule(&mut kernel, a);
        call(&mut kernel, SYS_FORK, [0; 3]);

        let nohang = WaitOptions::NOHANG.bits() as u64;
        assert_eq!(call(&mut kernel, SYS_WAITPID, [u64::MAX, 0, nohang]), Outcome::Complete(0));
        assert_eq!(
            call(&mut kernel, SYS_WAITPID, [u64::MAX, 0, 0x80]),
            Outcome::Complete(-errno::EINVAL)
        );
        let Outcome::Block(Some(switch)) = call(&mut kernel, SYS_WAITPID, [u64::MAX, 0, 0]) else {
            panic!("waitpid must block while the child runs");
        };
        assert_eq!(switch.to, Pid(2));
    }

    #[test]
    fn descriptor_calls_act_on_the_callers_table() {
        let mem = TestMemory::new(128);
        let mut kernel = boot(&mem);
        let a = kernel.spawn_user("a", &[], PROGRAM).unwrap();
        let node = Arc::new(CountingNode::new("tty"));
        kernel
            .process_mut(a)
            .unwrap()
            .fds
            .as_mut()
            .unwrap()
            .modify()
            .open(NodeHandle::open(node.clone()), OpenMode::READ | OpenMode::WRITE)
            .unwrap();
        schedule(&mut kernel, a);

        assert_eq!(call(&mut kernel, SYS_DUP, [0, 0, 0]), Outcome::Complete(1));
        assert_eq!(call(&mut kernel, SYS_DUP2, [0, 5, 0]), Outcome::Complete(5));
        assert_eq!(call(&mut kernel, SYS_CLOSE, [0, 0, 0]), Outcome::Complete(0));
        assert_eq!(call(&mut kernel, SYS_CLOSE, [0, 0, 0]), Outcome::Complete(-errno::EBADF));
        assert_eq!(call(&mut kernel, SYS_CLOSE, [1, 0, 0]), Outcome::Complete(0));
        assert_eq!(node.closes(), 0);
        assert_eq!(call(&mut kernel, SYS_CLOSE, [5, 0, 0]), Outcome::Complete(0));
        assert_eq!(node.closes(), 1);
    }

    #[test]
    fn sbrk_and_sleep_go_through_the_table() {
        let mem = TestMemory::new(128);
        let mut kernel = boot(&mem);
        let a = kernel.spawn_user("a", &[], PROGRAM).unwrap();
        schedule(&mut kernel, a);

        let base = crate::config::USER_HEAP_BASE as i64;
        assert_eq!(call(&mut kernel, SYS_SBRK, [64, 0, 0]), Outcome::Complete(base));
        assert_eq!(call(&mut kernel, SYS_SBRK, [0, 0, 0]), Outcome::Complete(base + 64));
        assert_eq!(
            call(&mut kernel, SYS_SBRK, [(-128i64) as u64, 0, 0]),
            Outcome::Complete(-errno::EINVAL)
        );

        let Outcome::Switch(0, Some(switch)) = call(&mut kernel, SYS_SLEEP, [5, 0, 0]) else {
            panic!("sleep must switch away");
        };
        assert_eq!((switch.from, switch.to), (a, Pid::ROOT));
        assert_eq!(kernel.process(a).unwrap().sleep_ticks, 5);
    }
}
