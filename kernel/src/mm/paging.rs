//! Page directory and page tables.
//!
//! The kernel keeps a flat, mostly identity-mapped address space with
//! three exceptions:
//!
//! * physical 0–4 MiB is mapped through a 4 KiB-granular table so the VGA
//!   text page and the per-terminal user video page can be remapped
//!   independently;
//! * the kernel image occupies a single 4 MiB supervisor page at virtual
//!   4 MiB;
//! * virtual 128–132 MiB is one 4 MiB user page whose physical frame is
//!   `8 MiB + pid × 4 MiB` for the current process.
//!
//! [`switch_to`] rewrites the 128 MiB directory entry on every context
//! switch; [`map_user_vidmem`] retargets the user video page at the
//! terminal's shadow framebuffer, or at physical VGA memory while that
//! terminal is on screen.

use bitflags::bitflags;
use spin::Mutex;

use crate::drivers::vga;

/// Size of a 4 KiB page.
pub const PAGE_SIZE: usize = 4096;
/// Size of a PSE large page.
pub const LARGE_PAGE_SIZE: usize = 4 * 1024 * 1024;
/// Virtual (and physical) base of the kernel's 4 MiB page.
pub const KERNEL_BASE: u32 = 0x0040_0000;
/// Virtual base of the per-process user window.
pub const USER_WINDOW_BASE: u32 = 0x0800_0000;
/// Size of the user window.
pub const USER_WINDOW_SIZE: u32 = LARGE_PAGE_SIZE as u32;
/// Offset within the window where program images are loaded.
pub const USER_ENTRY_OFFSET: u32 = 0x48000;
/// Initial user stack pointer: last dword of the window.
pub const USER_STACK_TOP: u32 = USER_WINDOW_BASE + USER_WINDOW_SIZE - 4;
/// Physical base of the VGA text buffer.
pub const VGA_TEXT_BASE: u32 = 0xB8000;

/// Directory slot covering the user window (128 MiB / 4 MiB).
const USER_WINDOW_PDE: usize = (USER_WINDOW_BASE as usize) / LARGE_PAGE_SIZE;
/// Physical base of the first user frame (pid 0).
const USER_FRAMES_BASE: u32 = 0x0080_0000;

bitflags! {
    /// Bits shared by directory and table entries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        /// 4 MiB page (directory entries only; PSE must be on).
        const LARGE         = 1 << 7;
        const GLOBAL        = 1 << 8;
    }
}

/// A 1024-entry paging structure, 4 KiB aligned as the MMU requires.
#[repr(C, align(4096))]
struct PageTable {
    entries: [u32; 1024],
}

impl PageTable {
    const fn zeroed() -> Self {
        Self { entries: [0; 1024] }
    }
}

static PAGE_DIRECTORY: Mutex<PageTable> = Mutex::new(PageTable::zeroed());
static LOW_PAGE_TABLE: Mutex<PageTable> = Mutex::new(PageTable::zeroed());

/// Build the boot address space and turn paging on.
pub fn init() {
    {
        let mut low = LOW_PAGE_TABLE.lock();
        for (i, entry) in low.entries.iter_mut().enumerate() {
            // Identity addresses staged non-present; individual pages are
            // opened below.
            *entry = (i as u32 * PAGE_SIZE as u32) | PageFlags::WRITABLE.bits();
        }
        let vga_index = VGA_TEXT_BASE as usize / PAGE_SIZE;
        low.entries[vga_index] |= (PageFlags::PRESENT | PageFlags::WRITABLE).bits();
    }
    {
        let mut dir = PAGE_DIRECTORY.lock();
        let low_addr = table_address(&LOW_PAGE_TABLE);
        // The low directory slot is user-visible so vidmap can expose one
        // video page; individual PTEs still gate user access.
        dir.entries[0] =
            low_addr | (PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER).bits();
        dir.entries[1] = KERNEL_BASE
            | (PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::LARGE).bits();
    }
    enable_paging();
}

/// Physical frame reserved for `pid`'s user window.
pub fn user_frame_for(pid: usize) -> u32 {
    USER_FRAMES_BASE + (pid as u32) * LARGE_PAGE_SIZE as u32
}

/// Point the 128 MiB window at `pid`'s frame. The caller guarantees the
/// pid is valid; there is no failure mode here.
pub fn switch_to(pid: usize) {
    {
        let mut dir = PAGE_DIRECTORY.lock();
        dir.entries[USER_WINDOW_PDE] = user_frame_for(pid)
            | (PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER | PageFlags::LARGE)
                .bits();
    }
    flush_tlb();
}

/// Physical frame currently backing the user window, if mapped.
pub fn current_user_frame() -> Option<u32> {
    let entry = PAGE_DIRECTORY.lock().entries[USER_WINDOW_PDE];
    if entry & PageFlags::PRESENT.bits() != 0 {
        Some(entry & !0x3F_FFFF)
    } else {
        None
    }
}

/// User-visible virtual address of terminal `tid`'s video page.
///
/// Visible terminals get the pages just above the VGA text page; the
/// headless terminal gets the page just below it.
pub fn user_video_addr(tid: i32) -> u32 {
    if tid < 0 {
        VGA_TEXT_BASE - PAGE_SIZE as u32
    } else {
        VGA_TEXT_BASE + PAGE_SIZE as u32 * (tid as u32 + 1)
    }
}

/// Retarget terminal `tid`'s user video page.
///
/// While the terminal is on screen the page aliases physical VGA memory;
/// otherwise it points at the terminal's shadow framebuffer.
pub fn map_user_vidmem(tid: i32, visible: bool) {
    let phys = if visible {
        VGA_TEXT_BASE
    } else {
        vga::shadow_frame_addr(vga::shadow_slot(tid))
    };
    let index = (user_video_addr(tid) as usize / PAGE_SIZE) % 1024;
    {
        let mut low = LOW_PAGE_TABLE.lock();
        low.entries[index] = (phys & !(PAGE_SIZE as u32 - 1))
            | (PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER).bits();
    }
    flush_tlb();
}

/// Identity-map the 4 MiB region containing `addr` for DMA transfers
/// (Sound Blaster buffers handed in from user space).
pub fn map_dma_region(addr: u32) {
    let slot = addr as usize / LARGE_PAGE_SIZE;
    {
        let mut dir = PAGE_DIRECTORY.lock();
        dir.entries[slot] = (addr & !(LARGE_PAGE_SIZE as u32 - 1))
            | (PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER | PageFlags::LARGE)
                .bits();
    }
    flush_tlb();
}

/// Address of a paging structure as the MMU will see it (kernel memory is
/// identity-mapped, so the virtual address is the physical one).
fn table_address(table: &Mutex<PageTable>) -> u32 {
    let guard = table.lock();
    (&guard.entries as *const _ as usize) as u32
}

// ---------------------------------------------------------------------------
// Privileged loads
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn enable_paging() {
    let dir = table_address(&PAGE_DIRECTORY);
    unsafe {
        core::arch::asm!(
            "mov cr3, {dir}",
            // PSE for 4 MiB pages, then the paging bit.
            "mov {tmp}, cr4",
            "or {tmp}, 0x10",
            "mov cr4, {tmp}",
            "mov {tmp}, cr0",
            "or {tmp}, 0x80000000",
            "mov cr0, {tmp}",
            dir = in(reg) dir,
            tmp = out(reg) _,
            options(nostack),
        );
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn flush_tlb() {
    unsafe {
        core::arch::asm!(
            "mov {tmp}, cr3",
            "mov cr3, {tmp}",
            tmp = out(reg) _,
            options(nostack),
        );
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn enable_paging() {}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn flush_tlb() {}

// ---------------------------------------------------------------------------
// The user window as seen from kernel code
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod window {
    use super::{USER_WINDOW_BASE, USER_WINDOW_SIZE};

    /// The 4 MiB window at 128 MiB, as a byte slice. Valid only while a
    /// process frame is mapped there.
    pub fn user_window() -> &'static mut [u8] {
        unsafe {
            core::slice::from_raw_parts_mut(
                USER_WINDOW_BASE as usize as *mut u8,
                USER_WINDOW_SIZE as usize,
            )
        }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod window {
    use super::USER_WINDOW_SIZE;

    lazy_static::lazy_static! {
        static ref FAKE_WINDOW: spin::Mutex<&'static mut [u8]> = {
            let buf = ::std::vec![0u8; USER_WINDOW_SIZE as usize];
            spin::Mutex::new(::std::boxed::Box::leak(buf.into_boxed_slice()))
        };
    }

    /// Host stand-in for the mapped window: one static 4 MiB buffer (there
    /// is only ever one window, whatever frame backs it).
    pub fn user_window() -> &'static mut [u8] {
        let mut guard = FAKE_WINDOW.lock();
        let ptr = guard.as_mut_ptr();
        let len = guard.len();
        unsafe { core::slice::from_raw_parts_mut(ptr, len) }
    }
}

pub use window::user_window;
