//! Sound Blaster 16 driver: DSP handshake, mixer autodetection, and
//! auto-initialise 16-bit DMA playback.
//!
//! The file layer exposes this as the `sb16` file: `write` hands over a
//! sample buffer and starts looping playback, `read` blocks until the
//! next half-buffer interrupt. Closing the file ends the auto-init cycle.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::{
    arch::{self, port},
    drivers::{pic, rtc},
    error::{KernelError, KernelResult},
    irq, mm,
};

const SB16_BASE: u16 = 0x220;
const DSP_RESET: u16 = SB16_BASE + 0x6;
const DSP_READ: u16 = SB16_BASE + 0xA;
const DSP_WRITE: u16 = SB16_BASE + 0xC;
const DSP_WRITE_STATUS: u16 = SB16_BASE + 0xC;
const DSP_READ_STATUS: u16 = SB16_BASE + 0xE;
const DSP_ACK_16BIT: u16 = SB16_BASE + 0xF;
const MIXER_ADDR: u16 = SB16_BASE + 0x4;
const MIXER_DATA: u16 = SB16_BASE + 0x5;

const DSP_CMD_SET_RATE: u8 = 0x41;
const DSP_CMD_VERSION: u8 = 0xE1;
/// 16-bit DAC transfer, auto-init, FIFO on.
const DSP_CMD_PLAY_AI_16: u8 = 0xB6;
/// Exit the 16-bit auto-init cycle at the next block boundary.
const DSP_CMD_END_AI_16: u8 = 0xD9;
/// Transfer mode: stereo, signed samples.
const DSP_MODE_STEREO_SIGNED: u8 = 0x30;
const DSP_ACK: u8 = 0xAA;
const STATUS_BIT: u8 = 0x80;

const MIXER_RESET: u8 = 0x00;
const MIXER_IRQ_SELECT: u8 = 0x80;
const MIXER_DMA_SELECT: u8 = 0x81;

// 16-bit DMA controller (channels 4-7).
const DMA16_MASK: u16 = 0xD4;
const DMA16_CLEAR_FF: u16 = 0xD8;
const DMA16_MODE: u16 = 0xD6;
const DMA5_ADDRESS: u16 = 0xC4;
const DMA5_COUNT: u16 = 0xC6;
const DMA5_PAGE: u16 = 0x8B;
const DMA_CHANNELS_PER_CONTROLLER: u8 = 4;
const DMA_MASK_ON: u8 = 0x04;
/// Single-channel auto-init playback (read-from-memory) mode.
const DMA_MODE_AI_PLAYBACK: u8 = 0x58;

/// Playback sample rate.
const SAMPLE_RATE: u32 = 44_100;

/// Handshake spins give up after this many polls; a missing card must not
/// wedge the kernel.
const DSP_POLL_LIMIT: u32 = 65_536;

/// Set by the IRQ handler when a half-buffer completes.
static HALF_BUFFER_DONE: AtomicBool = AtomicBool::new(false);
/// IRQ line the mixer reports (default 5 until detected).
static SB_IRQ_LINE: AtomicU8 = AtomicU8::new(5);
/// 16-bit DMA channel the mixer reports (default 5 until detected).
static DMA16_CHANNEL: AtomicU8 = AtomicU8::new(5);

fn dsp_read() -> KernelResult<u8> {
    for _ in 0..DSP_POLL_LIMIT {
        let status = unsafe { port::inb(DSP_READ_STATUS) };
        if status & STATUS_BIT != 0 {
            return Ok(unsafe { port::inb(DSP_READ) });
        }
    }
    Err(KernelError::NotSupported)
}

fn dsp_write(data: u8) -> KernelResult<()> {
    for _ in 0..DSP_POLL_LIMIT {
        let status = unsafe { port::inb(DSP_WRITE_STATUS) };
        if status & STATUS_BIT == 0 {
            unsafe { port::outb(DSP_WRITE, data) };
            return Ok(());
        }
    }
    Err(KernelError::NotSupported)
}

fn dsp_reset() -> KernelResult<()> {
    unsafe {
        port::outb(DSP_RESET, 1);
        port::outb(DSP_RESET, 0);
    }
    for _ in 0..8 {
        if dsp_read()? == DSP_ACK {
            return Ok(());
        }
    }
    Err(KernelError::NotSupported)
}

fn mixer_write(reg: u8, data: u8) {
    unsafe {
        port::outb(MIXER_ADDR, reg);
        port::outb(MIXER_DATA, data);
    }
}

fn mixer_read(reg: u8) -> u8 {
    unsafe {
        port::outb(MIXER_ADDR, reg);
        port::inb(MIXER_DATA)
    }
}

/// Decode the mixer's IRQ-select register into a PIC line.
fn irq_line_from(select: u8) -> u8 {
    if select & 0x08 != 0 {
        10
    } else if select & 0x04 != 0 {
        7
    } else if select & 0x02 != 0 {
        5
    } else {
        2
    }
}

/// Decode the mixer's DMA-select register into (8-bit, 16-bit) channels.
fn dma_channels_from(select: u8) -> (u8, u8) {
    let mut dma8 = 1;
    let mut dma16 = 5;
    for bit in 0..8 {
        if select & (1 << bit) != 0 {
            if bit < DMA_CHANNELS_PER_CONTROLLER {
                dma8 = bit;
            } else {
                dma16 = bit;
            }
        }
    }
    (dma8, dma16)
}

/// Reset the mixer and learn the card's IRQ and DMA wiring.
fn init_mixer() {
    mixer_write(MIXER_RESET, 0xCE);
    let _ = rtc::delay_ms(1);
    let irq_select = mixer_read(MIXER_IRQ_SELECT);
    let dma_select = mixer_read(MIXER_DMA_SELECT);
    SB_IRQ_LINE.store(irq_line_from(irq_select), Ordering::Relaxed);
    let (_dma8, dma16) = dma_channels_from(dma_select);
    DMA16_CHANNEL.store(dma16, Ordering::Relaxed);
}

/// Reset the DSP and read back its version (major in the high byte).
pub fn init_sound() -> KernelResult<u16> {
    HALF_BUFFER_DONE.store(false, Ordering::Relaxed);
    dsp_reset()?;
    dsp_write(DSP_CMD_VERSION)?;
    let major = dsp_read()?;
    let minor = dsp_read()?;
    log::info!("sb16: DSP version {}.{}", major, minor);
    Ok(u16::from(major) << 8 | u16::from(minor))
}

/// IRQ handler: flag the half-buffer and acknowledge the 16-bit transfer.
fn sb16_irq() {
    HALF_BUFFER_DONE.store(true, Ordering::Release);
    unsafe {
        let _ = port::inb(DSP_ACK_16BIT);
    }
}

/// Offset of `addr` within its 128 KiB DMA page, in words.
fn dma_word_offset(addr: u32) -> u32 {
    (addr / 2) % (128 * 1024)
}

/// The 128 KiB page number `addr` lives in.
fn dma_page(addr: u32) -> u32 {
    addr / (128 * 1024)
}

/// Program the 16-bit DMA controller for auto-init playback of `len`
/// bytes at physical `addr`.
fn program_dma(addr: u32, len: u32) {
    let channel = DMA16_CHANNEL.load(Ordering::Relaxed) % DMA_CHANNELS_PER_CONTROLLER;
    let offset = dma_word_offset(addr);
    let words = len / 2 - 1;
    unsafe {
        port::outb(DMA16_MASK, DMA_MASK_ON + channel);
        port::outb(DMA16_CLEAR_FF, 0xCE);
        port::outb(DMA16_MODE, DMA_MODE_AI_PLAYBACK + channel);
        port::outb(DMA5_ADDRESS, offset as u8);
        port::outb(DMA5_ADDRESS, (offset >> 8) as u8);
        port::outb(DMA5_COUNT, words as u8);
        port::outb(DMA5_COUNT, (words >> 8) as u8);
        port::outb(DMA5_PAGE, dma_page(addr) as u8);
        port::outb(DMA16_MASK, channel);
    }
}

/// Start auto-init playback of the caller's sample buffer.
///
/// The buffer stays owned by user space; the interrupt cadence is one
/// per half buffer, which `read` on the sb16 file waits for.
pub fn start_playback(buf: &[u8]) -> KernelResult<()> {
    if buf.len() < 4 {
        return Err(KernelError::InvalidArgument);
    }
    let addr = buf.as_ptr() as usize as u32;
    let len = buf.len() as u32;

    mm::paging::map_dma_region(addr);
    init_mixer();

    let line = SB_IRQ_LINE.load(Ordering::Relaxed);
    irq::install_handler(irq::IRQ_OFFSET as usize + line as usize, sb16_irq);
    pic::enable_irq(line);

    program_dma(addr, len);

    dsp_write(DSP_CMD_SET_RATE)?;
    dsp_write((SAMPLE_RATE >> 8) as u8)?;
    dsp_write(SAMPLE_RATE as u8)?;

    // Length is in samples per half buffer.
    let samples = len / 4 - 1;
    dsp_write(DSP_CMD_PLAY_AI_16)?;
    dsp_write(DSP_MODE_STEREO_SIGNED)?;
    dsp_write(samples as u8)?;
    dsp_write((samples >> 8) as u8)?;
    Ok(())
}

/// Block until the next half-buffer interrupt.
pub fn wait_half_buffer() {
    arch::enable_interrupts();
    while !HALF_BUFFER_DONE.load(Ordering::Acquire) {
        core::hint::spin_loop();
    }
    HALF_BUFFER_DONE.store(false, Ordering::Release);
}

/// Leave the auto-init cycle at the next block boundary.
pub fn stop_playback() {
    let _ = dsp_write(DSP_CMD_END_AI_16);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn irq_select_decodes_every_line() {
        assert_eq!(irq_line_from(0x08), 10);
        assert_eq!(irq_line_from(0x04), 7);
        assert_eq!(irq_line_from(0x02), 5);
        assert_eq!(irq_line_from(0x01), 2);
    }

    #[test]
    fn dma_select_splits_controllers() {
        let (dma8, dma16) = dma_channels_from(0b0010_0010);
        assert_eq!(dma8, 1);
        assert_eq!(dma16, 5);
        let (dma8, dma16) = dma_channels_from(0b0100_0001);
        assert_eq!(dma8, 0);
        assert_eq!(dma16, 6);
    }

    #[test]
    fn dma_addressing_math() {
        // A buffer at 1 MiB + 12: page 8, word offset 6.
        let addr = 0x0010_000C;
        assert_eq!(dma_page(addr), 8);
        assert_eq!(dma_word_offset(addr), 6);
    }

    #[test]
    fn half_buffer_flag_round_trip() {
        sb16_irq();
        assert!(HALF_BUFFER_DONE.swap(false, Ordering::AcqRel));
    }
}
