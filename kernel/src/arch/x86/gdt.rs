// Global Descriptor Table

use core::mem::size_of;

use x86::bits32::task::TaskStateSegment;
use x86::dtables::{self, DescriptorTablePointer};
use x86::segmentation::{
    self, BuildDescriptor, CodeSegmentType, DataSegmentType, Descriptor, DescriptorBuilder,
    GateDescriptorBuilder, SegmentSelector,
};
use x86::task;
use x86::Ring;

use crate::arch::frame::{
    KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR, TSS_SELECTOR, USER_CODE_SELECTOR,
    USER_DATA_SELECTOR,
};

/// Null, kernel code, kernel data, user code, user data, TSS.
const GDT_ENTRIES: usize = 6;

static mut GDT: [Descriptor; GDT_ENTRIES] = [Descriptor::NULL; GDT_ENTRIES];

static mut TSS: TaskStateSegment = TaskStateSegment::new();

/// Build and load the GDT, reload all segment registers, and load the task
/// register. The selector values are fixed by `arch::frame`; the table
/// layout here must produce exactly those.
pub fn init() {
    // Flat 4 GiB segments, page granularity.
    let kernel_code = DescriptorBuilder::code_descriptor(0, 0xFFFFF, CodeSegmentType::ExecuteRead)
        .limit_granularity_4kb()
        .db()
        .present()
        .dpl(Ring::Ring0)
        .finish();
    let kernel_data = DescriptorBuilder::data_descriptor(0, 0xFFFFF, DataSegmentType::ReadWrite)
        .limit_granularity_4kb()
        .db()
        .present()
        .dpl(Ring::Ring0)
        .finish();
    let user_code = DescriptorBuilder::code_descriptor(0, 0xFFFFF, CodeSegmentType::ExecuteRead)
        .limit_granularity_4kb()
        .db()
        .present()
        .dpl(Ring::Ring3)
        .finish();
    let user_data = DescriptorBuilder::data_descriptor(0, 0xFFFFF, DataSegmentType::ReadWrite)
        .limit_granularity_4kb()
        .db()
        .present()
        .dpl(Ring::Ring3)
        .finish();

    unsafe {
        let tss_base = core::ptr::addr_of!(TSS) as u64;
        let tss = <DescriptorBuilder as GateDescriptorBuilder<u32>>::tss_descriptor(
            tss_base,
            size_of::<TaskStateSegment>() as u64 - 1,
            true,
        )
        .present()
        .dpl(Ring::Ring0)
        .finish();

        GDT[1] = kernel_code;
        GDT[2] = kernel_data;
        GDT[3] = user_code;
        GDT[4] = user_data;
        GDT[5] = tss;

        TSS.ss0 = KERNEL_DATA_SELECTOR;

        let gdtp = DescriptorTablePointer::new_from_slice(&*core::ptr::addr_of!(GDT));
        dtables::lgdt(&gdtp);

        // SAFETY: The selectors index the table loaded above; CS is
        // reloaded with a far jump inside load_cs.
        segmentation::load_cs(SegmentSelector::from_raw(KERNEL_CODE_SELECTOR));
        segmentation::load_ds(SegmentSelector::from_raw(KERNEL_DATA_SELECTOR));
        segmentation::load_es(SegmentSelector::from_raw(KERNEL_DATA_SELECTOR));
        segmentation::load_fs(SegmentSelector::from_raw(KERNEL_DATA_SELECTOR));
        segmentation::load_gs(SegmentSelector::from_raw(KERNEL_DATA_SELECTOR));
        segmentation::load_ss(SegmentSelector::from_raw(KERNEL_DATA_SELECTOR));

        task::load_tr(SegmentSelector::from_raw(TSS_SELECTOR));
    }

    debug_assert_eq!(USER_CODE_SELECTOR, 0x18 | 3);
    debug_assert_eq!(USER_DATA_SELECTOR, 0x20 | 3);
}

/// Point the TSS at a process's kernel stack.
///
/// The CPU reads `esp0` on every ring 3 -> ring 0 transition, so this must
/// be updated at each context switch, with interrupts disabled.
pub fn set_kernel_stack(stack_top: u32) {
    unsafe {
        let tss = core::ptr::addr_of_mut!(TSS);
        (*tss).esp0 = stack_top;
        (*tss).ss0 = KERNEL_DATA_SELECTOR;
    }
}
