#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), feature(abi_x86_interrupt))]

extern crate alloc;

pub mod config;
pub mod error;
pub mod fs;
pub mod kernel;
pub mod memory;
pub mod process;
pub mod scheduler;
pub mod serial;
pub mod sync;
pub mod syscalls;
pub mod timer;
#[cfg(not(test))]
pub mod interrupts;

#[cfg(not(test))]
use core::panic::PanicInfo;

/// Entered from the Multiboot2 stub with the boot information address.
#[cfg(not(test))]
#[no_mangle]
pub extern "C" fn _start(multiboot_info_addr: usize) -> ! {
    use crate::config::{KernelConfig, KERNEL_HEAP_MAX, KERNEL_HEAP_START};
    use crate::memory::paging::AddressSpace;
    use x86_64::registers::control::Cr3;
    use x86_64::VirtAddr;

    let config = KernelConfig::default();
    serial::init();
    serial::init_logger(config.log_level);
    interrupts::init();
    log::info!("AtomicOS kernel started.");

    let mem = match memory::init(multiboot_info_addr) {
        Ok(mem) => mem,
        Err(err) => panic!("physical memory init failed: {}", err),
    };
    let (kernel_root, _) = Cr3::read();
    if let Err(err) = memory::heap::init(
        memory::heap::KernelBacking::new(mem, AddressSpace::kernel(kernel_root)),
        VirtAddr::new(KERNEL_HEAP_START),
        VirtAddr::new(KERNEL_HEAP_MAX),
        config.heap_growth_pages,
    ) {
        panic!("kernel heap init failed: {}", err);
    }

    match kernel::Kernel::new(mem, kernel_root, config) {
        Ok(kernel) => scheduler::install(kernel),
        Err(err) => panic!("kernel state init failed: {}", err),
    }
    syscalls::init();
    if let Err(err) = timer::register_tick_handler(scheduler::timer_tick) {
        log::warn!("timer tick handler not installed: {}", err);
    }
    timer::init_pit(config.timer_hz);

    x86_64::instructions::interrupts::enable();
    log::info!("AtomicOS is running; entering the idle loop.");
    scheduler::idle()
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    log::error!("{}", info);
    loop {
        x86_64::instructions::hlt();
    }
}
