//! Interrupt dispatch: the IDT, the vector → handler registry, and the
//! assembly stubs that funnel every gate into [`do_irq`],
//! [`exceptions::do_exception`], or the system-call dispatcher.
//!
//! Hardware interrupt stubs push the bit-inverse of their vector (so a
//! spurious zero push is distinguishable from vector 0) and call
//! [`do_irq`], which restores the vector, consults the registry, runs the
//! handler, and acknowledges the PIC.

pub mod exceptions;
pub mod idt;

use spin::Mutex;

use crate::{
    arch::{self, x86_64::KERNEL_CS},
    drivers::pic,
};
use idt::{GateDescriptor, IdtTable, NUM_VECTORS};

/// First IDT vector assigned to the PIC.
pub const IRQ_OFFSET: u8 = 0x20;
/// Number of PIC-routed vectors (master + slave, minus the cascade echo).
pub const NUM_PIC_VECTORS: usize = 15;
/// The system-call gate.
pub const SYSCALL_VECTOR: usize = 0x80;
/// Vector of the scheduler tick (PIT on IRQ 0).
pub const PIT_VECTOR: usize = IRQ_OFFSET as usize;
/// Vector of the PS/2 keyboard.
pub const KEYBOARD_VECTOR: usize = IRQ_OFFSET as usize + 1;
/// Vector of the real-time clock.
pub const RTC_VECTOR: usize = IRQ_OFFSET as usize + 8;

/// A registered interrupt handler. Handlers run with interrupts disabled
/// on the interrupted kernel stack and must not block.
pub type IrqHandler = fn();

static IDT: Mutex<IdtTable> = Mutex::new(IdtTable::new());
static HANDLERS: Mutex<[Option<IrqHandler>; NUM_VECTORS]> = Mutex::new([None; NUM_VECTORS]);

/// Build the full gate layout and load it.
///
/// Exceptions become present trap gates immediately; PIC gates are staged
/// non-present and flip present when their driver registers a handler.
pub fn init() {
    {
        let mut table = IDT.lock();
        for vector in 0..exceptions::NUM_EXCEPTIONS {
            table.entries[vector] = GateDescriptor::trap(stub_address(vector), KERNEL_CS, false);
        }
        for line in 0..NUM_PIC_VECTORS {
            let vector = IRQ_OFFSET as usize + line;
            table.entries[vector] = GateDescriptor::interrupt(stub_address(vector), KERNEL_CS);
        }
        table.entries[SYSCALL_VECTOR] =
            GateDescriptor::trap(stub_address(SYSCALL_VECTOR), KERNEL_CS, true);
        table.load();
    }
    pic::init();
}

/// Register `handler` for `vector` and make the gate present.
///
/// The registry slot and the gate's present bit change together inside one
/// interrupts-off section so the CPU never observes a half-installed
/// handler.
pub fn install_handler(vector: usize, handler: IrqHandler) {
    if vector >= NUM_VECTORS {
        return;
    }
    arch::without_interrupts(|| {
        HANDLERS.lock()[vector] = Some(handler);
        IDT.lock().entries[vector].set_present(true);
    });
}

/// Unregister the handler for `vector` and mark the gate non-present.
pub fn remove_handler(vector: usize) {
    if vector >= NUM_VECTORS {
        return;
    }
    arch::without_interrupts(|| {
        HANDLERS.lock()[vector] = None;
        IDT.lock().entries[vector].set_present(false);
    });
}

/// Whether `vector`'s gate is currently present.
pub fn gate_present(vector: usize) -> bool {
    vector < NUM_VECTORS && IDT.lock().entries[vector].is_present()
}

/// Common hardware-interrupt entry. `inverted_vector` is the bit-inverse
/// the stub pushed; restores the vector, runs the registered handler, then
/// EOIs the PIC for PIC-ranged vectors.
///
/// A present gate whose registry slot is empty is silently ignored.
#[no_mangle]
pub extern "C" fn do_irq(inverted_vector: i32) -> i32 {
    let vector = !inverted_vector;
    if vector < 0 || vector >= NUM_VECTORS as i32 {
        return -1;
    }
    let vector = vector as usize;

    let handler = arch::without_interrupts(|| HANDLERS.lock()[vector]);
    let Some(handler) = handler else {
        return -1;
    };
    handler();

    // The scheduler tick acknowledges the PIC itself: it may resume a
    // different task and never return here.
    let pic_range = PIT_VECTOR..IRQ_OFFSET as usize + NUM_PIC_VECTORS;
    if pic_range.contains(&vector) && vector != PIT_VECTOR {
        pic::send_eoi((vector - IRQ_OFFSET as usize) as u8);
    }
    0
}

// ---------------------------------------------------------------------------
// Interrupt service stubs
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod stubs {
    // Exception stubs push the inverted vector on top of whatever the CPU
    // pushed and fall into the common exception body; vectors without a
    // CPU error code are re-aligned in Rust. Hardware stubs save all
    // registers, push the inverted vector, and call do_irq. The syscall
    // stub forwards eax/ebx/ecx/edx and writes the return value back into
    // the saved eax image.
    core::arch::global_asm!(
        r#"
        .altmacro
        .macro EXC_STUB vec
        .global __cerulean_exc_\vec
        __cerulean_exc_\vec:
            push ~\vec
            jmp __cerulean_exception_common
        .endm

        .macro IRQ_STUB vec
        .global __cerulean_irq_\vec
        __cerulean_irq_\vec:
            pushad
            push ~\vec
            call do_irq
            add esp, 4
            popad
            iretd
        .endm

        .irp n, 0,1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,16,17,18,19,20,21,22,23,24,25,26,27,28,29,30,31
            EXC_STUB \n
        .endr

        .irp n, 32,33,34,35,36,37,38,39,40,41,42,43,44,45,46
            IRQ_STUB \n
        .endr

        __cerulean_exception_common:
            // The stack already holds the ExceptionFrame image:
            // [~vec][err?][eip][cs][eflags][esp][ss]
            call do_exception
            // do_exception never returns.
        1:  hlt
            jmp 1b

        .global __cerulean_syscall_gate
        __cerulean_syscall_gate:
            pushad
            push edx
            push ecx
            push ebx
            push eax
            call syscall_dispatch
            add esp, 16
            // Patch the saved eax image so popad hands the status back.
            mov [esp + 28], eax
            popad
            iretd
        "#
    );

    /// Resolve the stub symbol address for `vector`.
    pub fn stub_address(vector: usize) -> u32 {
        extern "C" {
            static __cerulean_stub_table: [u32; 0];
        }
        // The linker script collects the stub addresses into a table in
        // vector order (exceptions, PIC range, then the syscall gate).
        let table = core::ptr::addr_of!(__cerulean_stub_table) as *const u32;
        let index = if vector == super::SYSCALL_VECTOR { 47 } else { vector };
        unsafe { *table.add(index) }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod stubs {
    /// Host stand-in: deterministic fake addresses so IDT layout logic is
    /// testable without the assembly stubs.
    pub fn stub_address(vector: usize) -> u32 {
        0x0010_0000 + (vector as u32) * 0x10
    }
}

use stubs::stub_address;

#[cfg(test)]
mod tests {
    use super::*;

    fn nop_handler() {}

    #[test]
    fn init_builds_expected_gate_layout() {
        let _guard = crate::test_lock();
        init();
        // Exceptions present immediately.
        assert!(gate_present(0));
        assert!(gate_present(14));
        assert!(gate_present(31));
        // PIC gates staged non-present.
        assert!(!gate_present(PIT_VECTOR));
        assert!(!gate_present(RTC_VECTOR));
        // Syscall gate present and user-callable.
        assert!(gate_present(SYSCALL_VECTOR));
    }

    #[test]
    fn install_and_remove_track_present_bit() {
        let _guard = crate::test_lock();
        init();
        install_handler(KEYBOARD_VECTOR, nop_handler);
        assert!(gate_present(KEYBOARD_VECTOR));
        remove_handler(KEYBOARD_VECTOR);
        assert!(!gate_present(KEYBOARD_VECTOR));
    }

    #[test]
    fn do_irq_rejects_unregistered_vectors() {
        let _guard = crate::test_lock();
        init();
        // vector 40 has no registered handler anywhere in the kernel
        assert_eq!(do_irq(!40), -1);
        // inverted 0 decodes to vector -1
        assert_eq!(do_irq(0), -1);
        assert_eq!(do_irq(!(NUM_VECTORS as i32)), -1);
    }

    #[test]
    fn do_irq_runs_registered_handler() {
        use core::sync::atomic::{AtomicUsize, Ordering};
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        fn counting_handler() {
            FIRED.fetch_add(1, Ordering::Relaxed);
        }

        let _guard = crate::test_lock();
        init();
        install_handler(RTC_VECTOR, counting_handler);
        assert_eq!(do_irq(!(RTC_VECTOR as i32)), 0);
        assert_eq!(FIRED.load(Ordering::Relaxed), 1);
        remove_handler(RTC_VECTOR);
    }
}
