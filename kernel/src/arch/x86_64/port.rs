//! Byte-wide port I/O.
//!
//! Thin wrappers over the `x86_64` crate's port types. The PIC, PIT, RTC,
//! VGA CRTC, keyboard controller, Sound Blaster and DMA controller drivers
//! all speak through these two functions.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod imp {
    use x86_64::instructions::port::Port;

    /// Write one byte to an I/O port.
    ///
    /// # Safety
    /// Port writes have device-defined side effects; the caller must know
    /// the port's protocol.
    pub unsafe fn outb(port: u16, value: u8) {
        let mut p: Port<u8> = Port::new(port);
        unsafe { p.write(value) };
    }

    /// Read one byte from an I/O port.
    ///
    /// # Safety
    /// Port reads can acknowledge device state (e.g. RTC register C); the
    /// caller must know the port's protocol.
    pub unsafe fn inb(port: u16) -> u8 {
        let mut p: Port<u8> = Port::new(port);
        unsafe { p.read() }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod imp {
    /// Host stub: discards the write.
    ///
    /// # Safety
    /// Inert off bare metal.
    pub unsafe fn outb(_port: u16, _value: u8) {}

    /// Host stub: reads as zero.
    ///
    /// # Safety
    /// Inert off bare metal.
    pub unsafe fn inb(_port: u16) -> u8 {
        0
    }
}

pub use imp::{inb, outb};
