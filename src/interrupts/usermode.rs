//! The `int 0x80` entry from Ring 3.

use core::arch::naked_asm;

/// Saves the caller's registers as a `TrapFrame` on top of the CPU's
/// interrupt frame, hands it to the Rust dispatcher, and returns with
/// whatever the dispatcher left in the frame.
///
/// Convention: RAX=syscall number, RDI=arg0, RSI=arg1, RDX=arg2
/// Returns: RAX=result
#[unsafe(naked)]
pub extern "C" fn syscall_entry() {
    naked_asm!(
        "push r15",
        "push r14",
        "push r13",
        "push r12",
        "push r11",
        "push r10",
        "push r9",
        "push r8",
        "push rbp",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbx",
        "push rcx",
        "push rax",

        // 5 CPU-pushed + 15 saved qwords keep RSP0's 16-byte alignment.
        "mov rdi, rsp",
        "call {trap}",

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
        trap = sym crate::syscalls::syscall_trap,
    );
}
