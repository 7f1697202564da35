//! CPU exception handling.
//!
//! Every exception vector carries a human-readable name, a classification,
//! and a flag for whether the CPU pushed an error code. Exceptions raised
//! by user code (other than aborts) paint the screen blue, dump the
//! machine state, wait for the user to acknowledge, and then halt the
//! process with a status the parent observes as 256. Kernel-mode
//! exceptions and aborts are fatal: the CPU parks in a low-power loop.

use crate::{
    arch::{self, x86_64::USER_CS},
    drivers::vga::{self, Color},
    process, tty,
};

/// Number of CPU exception vectors wired into the IDT.
pub const NUM_EXCEPTIONS: usize = 32;

/// Status passed to `halt` from the exception path. The crashed flag set
/// alongside it is what makes the parent observe 256 instead.
pub const EXCEPTION_HALT_STATUS: u32 = 255;

/// Classification of an exception vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionClass {
    Fault,
    Trap,
    Interrupt,
    Abort,
    /// Vector is reserved or not an exception.
    Reserved,
}

struct ExceptionInfo {
    name: &'static str,
    class: ExceptionClass,
    has_error_code: bool,
}

const fn info(name: &'static str, class: ExceptionClass, has_error_code: bool) -> ExceptionInfo {
    ExceptionInfo {
        name,
        class,
        has_error_code,
    }
}

use ExceptionClass::{Abort, Fault, Interrupt, Reserved, Trap};

#[rustfmt::skip]
static EXCEPTIONS: [ExceptionInfo; 34] = [
    info("Divide-by-zero Error", Fault, false),
    info("Debug", Trap, false),
    info("Non-maskable Interrupt", Interrupt, false),
    info("Breakpoint", Trap, false),
    info("Overflow", Trap, false),
    info("Bound Range Exceeded", Fault, false),
    info("Invalid Opcode", Fault, false),
    info("Device Not Available", Fault, false),
    info("Double Fault", Abort, true),
    info("Coprocessor Segment Overrun", Fault, false),
    info("Invalid TSS", Fault, true),
    info("Segment Not Present", Fault, true),
    info("Stack-Segment Fault", Fault, true),
    info("General Protection Fault", Fault, true),
    info("Page Fault", Fault, true),
    info("Assertion Failure", Reserved, false),
    info("x87 Floating-Point Exception", Fault, false),
    info("Alignment Check", Fault, true),
    info("Machine Check", Abort, false),
    info("SIMD Floating-Point Exception", Fault, false),
    info("Virtualization Exception", Fault, false),
    info("Reserved", Reserved, false),
    info("Reserved", Reserved, false),
    info("Reserved", Reserved, false),
    info("Reserved", Reserved, false),
    info("Reserved", Reserved, false),
    info("Reserved", Reserved, false),
    info("Reserved", Reserved, false),
    info("Reserved", Reserved, false),
    info("Reserved", Reserved, false),
    info("Security Exception", Reserved, true),
    info("Reserved", Reserved, false),
    info("Triple Fault", Reserved, false),
    info("FPU Error Interrupt", Interrupt, false),
];

/// Stack image built by the exception stubs: the inverted vector pushed by
/// the stub, then whatever the CPU pushed.
///
/// When the CPU did not push an error code every field from `error` on is
/// shifted by one slot; [`ExceptionFrame::realign`] undoes that.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ExceptionFrame {
    pub inverted_vector: u32,
    pub error: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

impl ExceptionFrame {
    /// Shift the frame for vectors without a CPU-pushed error code.
    fn realign(&mut self) {
        self.ss = self.esp;
        self.esp = self.eflags;
        self.eflags = self.cs;
        self.cs = self.eip;
        self.eip = self.error;
        self.error = 0;
    }
}

/// Common exception body, entered from the per-vector stubs.
#[no_mangle]
pub extern "C" fn do_exception(mut frame: ExceptionFrame) -> ! {
    arch::disable_interrupts();

    let vector = (!frame.inverted_vector) as usize;
    let info = EXCEPTIONS
        .get(vector)
        .unwrap_or(&EXCEPTIONS[EXCEPTIONS.len() - 2]);
    if !info.has_error_code {
        frame.realign();
    }

    let from_user = frame.cs == u32::from(USER_CS);
    let fatal = !from_user || info.class == Abort;

    // Diagnostics always go to the terminal the user is looking at.
    if fatal {
        tty::emergency_console();
    }
    vga::set_bg(Color::Blue);
    vga::clear();
    vga::set_cursor(0, 0);

    crate::println!("Exception Occurred: {}", info.name);
    if info.has_error_code {
        crate::println!("Error code: {:#x}", frame.error);
    }
    crate::println!("SS: {:#x}", frame.ss);
    crate::println!("ESP: {:#x}", frame.esp);
    crate::println!("EFLAGS: {:#x}", frame.eflags);
    crate::println!("CS: {:#x}", frame.cs);
    crate::println!("EIP: {:#x}", frame.eip);
    crate::println!("CR2: {:#x}", arch::read_cr2());

    if from_user {
        if let Some((pid, parent)) = process::current_identity() {
            crate::println!("PID: {}", pid);
            crate::println!("Parent ID: {}", parent);
        }
    }

    if !fatal {
        crate::println!("Press enter to return");
        arch::enable_interrupts();
        // Zero-length read: blocks until the user hits enter.
        let mut ack: [u8; 0] = [];
        let _ = tty::terminal_read(&mut ack);
        arch::disable_interrupts();

        vga::set_bg(Color::Black);
        vga::clear();
        vga::set_cursor(0, 0);

        process::mark_current_crashed();
        crate::syscall::exec::halt_current(EXCEPTION_HALT_STATUS);
    }

    crate::println!("This exception was fatal. Please restart the system.");
    arch::halt_loop();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_table_matches_the_cpu() {
        for (vector, expect) in [(0, false), (8, true), (13, true), (14, true), (3, false)] {
            assert_eq!(EXCEPTIONS[vector].has_error_code, expect, "vector {}", vector);
        }
    }

    #[test]
    fn key_vectors_are_classified_correctly() {
        assert_eq!(EXCEPTIONS[14].class, ExceptionClass::Fault);
        assert_eq!(EXCEPTIONS[3].class, ExceptionClass::Trap);
        assert_eq!(EXCEPTIONS[8].class, ExceptionClass::Abort);
        assert_eq!(EXCEPTIONS[18].class, ExceptionClass::Abort);
    }

    #[test]
    fn realign_shifts_one_slot() {
        // Divide error: CPU pushed no error code, so the stub's frame has
        // everything from `error` on holding its neighbour's value.
        let mut frame = ExceptionFrame {
            inverted_vector: !0,
            error: 0x1111,  // actually EIP
            eip: 0x2222,    // actually CS
            cs: 0x3333,     // actually EFLAGS
            eflags: 0x4444, // actually ESP
            esp: 0x5555,    // actually SS
            ss: 0xDEAD,     // garbage
        };
        frame.realign();
        assert_eq!(frame.eip, 0x1111);
        assert_eq!(frame.cs, 0x2222);
        assert_eq!(frame.eflags, 0x3333);
        assert_eq!(frame.esp, 0x4444);
        assert_eq!(frame.ss, 0x5555);
        assert_eq!(frame.error, 0);
    }
}
