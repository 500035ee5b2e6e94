use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;
use lazy_static::lazy_static;

use crate::scheduler::context::{USER_CODE_SELECTOR, USER_DATA_SELECTOR};

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Double-fault handler stack.
const DF_STACK_SIZE: usize = 4096 * 5;
static mut DF_STACK: [u8; DF_STACK_SIZE] = [0; DF_STACK_SIZE];

lazy_static! {
    /// RSP0 is left empty here; every context switch points it at the
    /// incoming thread's kernel stack.
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            let stack_start = VirtAddr::from_ptr(unsafe { &raw const DF_STACK });
            stack_start + DF_STACK_SIZE as u64
        };
        tss
    };
}

lazy_static! {
    pub static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.add_entry(Descriptor::kernel_code_segment());
        let kernel_data = gdt.add_entry(Descriptor::kernel_data_segment());
        let user_data   = gdt.add_entry(Descriptor::user_data_segment());
        let user_code   = gdt.add_entry(Descriptor::user_code_segment());
        let tss         = gdt.add_entry(Descriptor::tss_segment(&TSS));
        (gdt, Selectors {
            kernel_code,
            kernel_data,
            user_code,
            user_data,
            tss,
        })
    };
}

pub struct Selectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub user_code: SegmentSelector,
    pub user_data: SegmentSelector,
    pub tss: SegmentSelector,
}

pub fn init() {
    use x86_64::instructions::tables::load_tss;
    use x86_64::instructions::segmentation::{CS, DS, SS, Segment};

    GDT.0.load();
    unsafe {
        CS::set_reg(GDT.1.kernel_code);
        DS::set_reg(GDT.1.kernel_data);
        SS::set_reg(GDT.1.kernel_data);
        load_tss(GDT.1.tss);
    }

    // Trap frames for new user threads are built from these constants.
    debug_assert_eq!(u64::from(GDT.1.user_code.0) | 3, USER_CODE_SELECTOR);
    debug_assert_eq!(u64::from(GDT.1.user_data.0) | 3, USER_DATA_SELECTOR);
}

/// Points RSP0 at `kernel_stack_top`, the stack the CPU switches to when
/// user mode traps into the kernel.
pub fn set_tss_rsp0(kernel_stack_top: u64) {
    // SAFETY: only called with interrupts disabled during a switch; the CPU
    // reads the field on the next ring transition.
    unsafe {
        let tss_ptr = &*TSS as *const TaskStateSegment as *mut TaskStateSegment;
        (*tss_ptr).privilege_stack_table[0] = VirtAddr::new(kernel_stack_top);
    }
}
