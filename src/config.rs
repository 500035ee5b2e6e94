//! Kernel-wide constants and the runtime configuration record.

/// Size of a physical block and of a virtual page.
pub const BLOCK_SIZE: usize = 4096;
pub const PAGE_SIZE: usize = BLOCK_SIZE;

/// The boot stub identity maps the first 1 GiB, so physical memory is
/// reached at offset zero and only blocks below the limit are handed out.
pub const PHYS_MEM_OFFSET: u64 = 0;
pub const IDENTITY_MAP_LIMIT: u64 = 1 << 30;

/// Low memory holding the kernel image and boot structures; never allocated.
pub const KERNEL_RESERVED_END: u64 = 4 << 20;

/// Kernel heap window. It sits in its own PML4 slot, which is populated at
/// heap init so every address space created later shares it.
pub const KERNEL_HEAP_START: u64 = 0xFFFF_C000_0000_0000;
pub const KERNEL_HEAP_MAX: u64 = 0xFFFF_C000_4000_0000;

/// PML4 slots owned by user mappings. Slot 0 holds the boot identity map and
/// slots 256.. the kernel half; both are shared by every address space.
pub const USER_PML4_SLOTS: core::ops::Range<usize> = 1..256;

/// Per-task kernel stack (16 KiB).
pub const KERNEL_STACK_SIZE: usize = 4096 * 4;

/// User layout.
pub const USER_IMAGE_BASE: u64 = 0x0000_0080_0000_0000;
pub const USER_HEAP_BASE: u64 = 0x0000_1000_0000_0000;
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FFFF_F000;
pub const USER_STACK_PAGES: usize = 4;
/// First address above the canonical lower half.
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// Number of entries in the syscall dispatch table.
pub const MAX_SYSCALLS: usize = 32;

/// PIT input clock.
pub const PIT_BASE_FREQUENCY: u32 = 1_193_182;

/// Runtime configuration. Tests shrink these limits to reach edge cases.
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    /// Size of the pid table; pids live in `[0, max_pids)`.
    pub max_pids: usize,
    /// Timer interrupt frequency.
    pub timer_hz: u32,
    /// Ticks a process may run before the tick handler preempts it.
    pub time_slice_ticks: u32,
    /// Upper bound on descriptors per table.
    pub max_fds: usize,
    /// Minimum number of pages the kernel heap maps when it grows.
    pub heap_growth_pages: usize,
    pub log_level: log::LevelFilter,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            max_pids: 256,
            timer_hz: 1000,
            time_slice_ticks: 10,
            max_fds: 64,
            heap_growth_pages: 16,
            log_level: log::LevelFilter::Info,
        }
    }
}
