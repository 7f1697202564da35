//! Architecture abstraction layer.
//!
//! The kernel targets single-processor x86 PC-class machines in protected
//! mode. Everything that touches privileged instructions lives under
//! [`x86_64`]; on non-bare-metal targets (host-side unit tests) those
//! functions compile to stubs so the rest of the kernel stays testable.

pub mod x86_64;

pub use x86_64::{
    context::{context_switch, KernelContext},
    disable_interrupts, enable_interrupts, halt_loop, init,
    port,
    port::{inb, outb},
    read_cr2, tss,
    usermode::{enter_user, resume_parent},
    without_interrupts,
};
