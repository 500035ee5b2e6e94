use core::arch::{asm, naked_asm};

use x86_64::{structures::paging::PhysFrame, VirtAddr};

/// User segment selectors with RPL 3, matching the GDT layout
/// (null, kernel code, kernel data, user data, user code, TSS).
pub const USER_CODE_SELECTOR: u64 = 0x23;
pub const USER_DATA_SELECTOR: u64 = 0x1B;
/// Interrupts enabled, reserved bit 1 set.
pub const USER_RFLAGS: u64 = 0x202;

/// CPU register context saved/restored during context switches.
/// All callee-saved registers on x86_64 System V ABI.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Context {
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
}

impl Context {
    /// Filled in by the first switch away from the boot flow.
    pub fn empty() -> Self {
        Context::default()
    }

    /// Resumes at `rip` with the stack pointer at `rsp`.
    pub fn resume_at(rip: u64, rsp: u64) -> Self {
        Context {
            rsp,
            rip,
            ..Context::default()
        }
    }

    /// Starts a kernel task: `kernel_task_start` calls the entry held in r12.
    pub fn task(entry: u64, rsp: u64) -> Self {
        Context {
            rsp,
            r12: entry,
            rip: kernel_task_start as usize as u64,
            ..Context::default()
        }
    }
}

/// Registers saved on the kernel stack when user mode traps in, lowest
/// address first. The tail is the frame the CPU pushes itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TrapFrame {
    pub rax: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// First entry into user mode at `entry` with the given stack.
    pub fn user_entry(entry: u64, stack_top: u64) -> Self {
        TrapFrame {
            rip: entry,
            cs: USER_CODE_SELECTOR,
            rflags: USER_RFLAGS,
            rsp: stack_top,
            ss: USER_DATA_SELECTOR,
            ..TrapFrame::default()
        }
    }
}

/// FXSAVE image: x87, MMX and SSE state.
#[derive(Clone)]
#[repr(C, align(16))]
pub struct FpuState {
    pub area: [u8; 512],
}

impl FpuState {
    /// The state `fninit` would produce, with SSE exceptions masked.
    pub fn initial() -> Self {
        let mut area = [0u8; 512];
        area[0..2].copy_from_slice(&0x037Fu16.to_le_bytes());
        area[24..28].copy_from_slice(&0x1F80u32.to_le_bytes());
        FpuState { area }
    }
}

/// Switch context from `old` to `new`.
/// Saves callee-saved registers into `old`, restores from `new`.
///
/// # Safety
/// Both pointers must be valid Context structs with valid stack pointers.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(old: *mut Context, new: *const Context) {
    naked_asm!(
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x38], rax",
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "jmp [rsi + 0x38]",
        // Resumed here when switched back to `old`.
        "2:",
        "ret",
    );
}

/// First code run by a forked child: rsp points at the copied trap frame,
/// so unwinding it returns to user mode with the chosen rax.
#[unsafe(naked)]
pub unsafe extern "C" fn fork_trampoline() -> ! {
    naked_asm!(
        "pop rax",
        "pop rcx",
        "pop rbx",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rbp",
        "pop r8",
        "pop r9",
        "pop r10",
        "pop r11",
        "pop r12",
        "pop r13",
        "pop r14",
        "pop r15",
        "iretq",
    );
}

/// First code run by a kernel task. The entry point arrives in r12; a task
/// that returns exits with status 0.
#[unsafe(naked)]
pub unsafe extern "C" fn kernel_task_start() -> ! {
    naked_asm!(
        "sti",
        "call r12",
        "call {exit}",
        "ud2",
        exit = sym crate::scheduler::exit_kernel_task,
    );
}

/// # Safety
/// `area` must be valid for writes and 16-byte aligned.
pub unsafe fn save_fpu(area: *mut FpuState) {
    asm!("fxsave64 [{}]", in(reg) area, options(nostack, preserves_flags));
}

/// # Safety
/// `area` must hold a valid FXSAVE image.
pub unsafe fn restore_fpu(area: *const FpuState) {
    asm!("fxrstor64 [{}]", in(reg) area, options(nostack, preserves_flags));
}

/// Makes the next FPU instruction raise #NM.
pub fn set_task_switched() {
    use x86_64::registers::control::{Cr0, Cr0Flags};
    // SAFETY: TS only defers FPU access to the #NM handler.
    unsafe { Cr0::update(|flags| flags.insert(Cr0Flags::TASK_SWITCHED)) };
}

pub fn clear_task_switched() {
    // SAFETY: clts only touches CR0.TS.
    unsafe { asm!("clts", options(nomem, nostack, preserves_flags)) };
}

/// Everything the low-level switch needs, gathered while the kernel lock
/// is held and used after it is released.
#[derive(Debug)]
pub struct SwitchFrames {
    pub prev: *mut Context,
    pub next: *const Context,
    pub next_root: PhysFrame,
    pub next_stack_top: VirtAddr,
    /// Set when the outgoing thread touched the FPU since it was switched in.
    pub save_fpu: Option<*mut FpuState>,
}

/// Saves FPU state if needed, arms lazy FPU restore, loads the next
/// address space and kernel stack, then switches.
///
/// # Safety
/// The pointers must stay valid until the outgoing thread resumes; the
/// caller must hold no lock and run with interrupts disabled.
#[cfg(not(test))]
pub unsafe fn perform(frames: SwitchFrames) {
    use x86_64::registers::control::Cr3;

    if let Some(area) = frames.save_fpu {
        clear_task_switched();
        save_fpu(area);
    }
    set_task_switched();

    crate::interrupts::gdt::set_tss_rsp0(frames.next_stack_top.as_u64());
    let (active, flags) = Cr3::read();
    if active != frames.next_root {
        Cr3::write(frames.next_root, flags);
    }

    switch_context(frames.prev, frames.next);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_frame_layout_matches_entry_pushes() {
        assert_eq!(core::mem::size_of::<TrapFrame>(), 20 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, rax), 0);
        assert_eq!(core::mem::offset_of!(TrapFrame, r15), 14 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, rip), 15 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, ss), 19 * 8);
    }

    #[test]
    fn context_offsets_match_switch_code() {
        assert_eq!(core::mem::offset_of!(Context, rsp), 0x00);
        assert_eq!(core::mem::offset_of!(Context, r12), 0x18);
        assert_eq!(core::mem::offset_of!(Context, rip), 0x38);
    }

    #[test]
    fn kernel_task_context_carries_entry_in_r12() {
        let ctx = Context::task(0x1234, 0x8000);
        assert_eq!(ctx.r12, 0x1234);
        assert_eq!(ctx.rsp, 0x8000);
        assert_eq!(ctx.rip, kernel_task_start as usize as u64);
    }

    #[test]
    fn initial_fpu_image_masks_exceptions() {
        let state = FpuState::initial();
        assert_eq!(core::mem::align_of::<FpuState>(), 16);
        assert_eq!(u16::from_le_bytes([state.area[0], state.area[1]]), 0x037F);
        assert_eq!(
            u32::from_le_bytes([state.area[24], state.area[25], state.area[26], state.area[27]]),
            0x1F80
        );
    }
}
