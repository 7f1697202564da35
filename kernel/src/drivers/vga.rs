//! VGA text-mode console with per-terminal shadow framebuffers.
//!
//! Output is routed through one global writer. Each terminal owns a 4 KiB
//! shadow page of glyph+attribute cells; the terminal currently on screen
//! writes straight into physical VGA memory and its shadow goes stale
//! until the next switch snapshots it. Off-screen terminals write into
//! their shadows only. The hardware cursor and cursor shape follow the
//! visible terminal.

use core::fmt;

use spin::Mutex;

use crate::arch::port;

/// Text-mode geometry.
pub const NUM_COLS: usize = 80;
/// Text-mode geometry.
pub const NUM_ROWS: usize = 25;
/// Cells per screen.
pub const SCREEN_CELLS: usize = NUM_COLS * NUM_ROWS;

/// Shadow pages: one per visible terminal plus one for the headless tty.
pub const NUM_SHADOWS: usize = 4;

const BLANK_CHAR: u8 = b' ';

// VGA CRTC register interface, used for the hardware cursor.
const CRTC_INDEX: u16 = 0x3D4;
const CRTC_DATA: u16 = 0x3D5;
const CRTC_CURSOR_START: u8 = 0x0A;
const CRTC_CURSOR_HIGH: u8 = 0x0E;
const CRTC_CURSOR_LOW: u8 = 0x0F;
// Cursor-start scanlines: a thin underline for insert mode, a full block
// for replace mode.
const CURSOR_SHAPE_INSERT: u8 = 0x0D;
const CURSOR_SHAPE_REPLACE: u8 = 0x00;

/// The 16-colour VGA text palette.
#[allow(dead_code)] // full palette per the VGA specification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    Black = 0,
    Blue = 1,
    Green = 2,
    Cyan = 3,
    Red = 4,
    Magenta = 5,
    Brown = 6,
    LightGray = 7,
    DarkGray = 8,
    LightBlue = 9,
    LightGreen = 10,
    LightCyan = 11,
    LightRed = 12,
    Pink = 13,
    Yellow = 14,
    White = 15,
}

/// Packed attribute byte: background high nibble, foreground low nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct ColorCode(u8);

impl ColorCode {
    const fn new(foreground: Color, background: Color) -> ColorCode {
        ColorCode(((background as u8) << 4) | (foreground as u8))
    }
}

/// One glyph+attribute cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ScreenChar {
    ascii_character: u8,
    color_code: ColorCode,
}

impl ScreenChar {
    const fn blank(color_code: ColorCode) -> Self {
        Self {
            ascii_character: BLANK_CHAR,
            color_code,
        }
    }

    /// The glyph byte, for tests and framebuffer comparisons.
    pub fn glyph(&self) -> u8 {
        self.ascii_character
    }
}

/// A page-aligned off-screen framebuffer; the user vidmap page points at
/// one of these while its terminal is off screen.
#[repr(C, align(4096))]
pub struct ShadowPage {
    chars: [ScreenChar; SCREEN_CELLS],
}

impl ShadowPage {
    const fn new() -> Self {
        Self {
            chars: [ScreenChar::blank(ColorCode::new(Color::LightGray, Color::Black));
                SCREEN_CELLS],
        }
    }
}

/// Direction for relative cursor movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    Up,
    Down,
    Left,
    Right,
}

struct Console {
    x: usize,
    y: usize,
    fg: Color,
    bg: Color,
    /// Writes also land in physical VGA memory.
    visible: bool,
    /// Which shadow page is the current target.
    target: usize,
    shadows: [ShadowPage; NUM_SHADOWS],
}

static CONSOLE: Mutex<Console> = Mutex::new(Console {
    x: 0,
    y: 0,
    fg: Color::LightGray,
    bg: Color::Black,
    visible: true,
    target: 0,
    shadows: [
        ShadowPage::new(),
        ShadowPage::new(),
        ShadowPage::new(),
        ShadowPage::new(),
    ],
});

impl Console {
    fn color_code(&self) -> ColorCode {
        ColorCode::new(self.fg, self.bg)
    }

    fn read_cell(&self, index: usize) -> ScreenChar {
        if self.visible {
            physical::read(index)
        } else {
            self.shadows[self.target].chars[index]
        }
    }

    fn write_cell(&mut self, index: usize, cell: ScreenChar) {
        if self.visible {
            physical::write(index, cell);
        } else {
            self.shadows[self.target].chars[index] = cell;
        }
    }

    fn put_byte(&mut self, byte: u8) {
        match byte {
            b'\n' | b'\r' => {
                self.x = 0;
                self.y += 1;
            }
            byte => {
                let cell = ScreenChar {
                    ascii_character: byte,
                    color_code: self.color_code(),
                };
                self.write_cell(self.y * NUM_COLS + self.x, cell);
                self.x += 1;
                if self.x >= NUM_COLS {
                    self.x = 0;
                    self.y += 1;
                }
            }
        }
        if self.y >= NUM_ROWS {
            self.scroll();
            self.y = NUM_ROWS - 1;
        }
        self.sync_hw_cursor();
    }

    fn scroll(&mut self) {
        for row in 1..NUM_ROWS {
            for col in 0..NUM_COLS {
                let cell = self.read_cell(row * NUM_COLS + col);
                self.write_cell((row - 1) * NUM_COLS + col, cell);
            }
        }
        let blank = ScreenChar::blank(self.color_code());
        for col in 0..NUM_COLS {
            self.write_cell((NUM_ROWS - 1) * NUM_COLS + col, blank);
        }
    }

    fn clear(&mut self) {
        let blank = ScreenChar::blank(self.color_code());
        for index in 0..SCREEN_CELLS {
            self.write_cell(index, blank);
        }
    }

    fn backspace(&mut self) {
        if self.x == 0 {
            if self.y == 0 {
                return;
            }
            self.x = NUM_COLS - 1;
            self.y -= 1;
        } else {
            self.x -= 1;
        }
        let blank = ScreenChar::blank(self.color_code());
        self.write_cell(self.y * NUM_COLS + self.x, blank);
        self.sync_hw_cursor();
    }

    fn move_cursor(&mut self, dir: Dir) {
        match dir {
            Dir::Left => {
                if self.x == 0 {
                    if self.y > 0 {
                        self.x = NUM_COLS - 1;
                        self.y -= 1;
                    }
                } else {
                    self.x -= 1;
                }
            }
            Dir::Right => {
                self.x += 1;
                if self.x >= NUM_COLS {
                    self.x = 0;
                    if self.y < NUM_ROWS - 1 {
                        self.y += 1;
                    }
                }
            }
            Dir::Up => {
                if self.y > 0 {
                    self.y -= 1;
                }
            }
            Dir::Down => {
                if self.y < NUM_ROWS - 1 {
                    self.y += 1;
                }
            }
        }
        self.sync_hw_cursor();
    }

    fn sync_hw_cursor(&self) {
        if self.visible {
            hw_cursor_move(self.y * NUM_COLS + self.x);
        }
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.put_byte(byte);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Public console API (each call takes the console lock once)
// ---------------------------------------------------------------------------

/// Write one byte at the cursor, honouring newline and scrolling.
pub fn putb(byte: u8) {
    CONSOLE.lock().put_byte(byte);
}

/// Clear the routed screen with the current attribute.
pub fn clear() {
    CONSOLE.lock().clear();
}

/// Erase the cell before the cursor and step back.
pub fn backspace() {
    CONSOLE.lock().backspace();
}

/// `n` backspaces.
pub fn rbackspace(n: usize) {
    let mut console = CONSOLE.lock();
    for _ in 0..n {
        console.backspace();
    }
}

/// Move the cursor one cell.
pub fn move_cursor(dir: Dir) {
    CONSOLE.lock().move_cursor(dir);
}

/// Move the cursor `n` cells.
pub fn rmove_cursor(dir: Dir, n: usize) {
    let mut console = CONSOLE.lock();
    for _ in 0..n {
        console.move_cursor(dir);
    }
}

/// Place the cursor at (x, y).
pub fn set_cursor(x: usize, y: usize) {
    let mut console = CONSOLE.lock();
    console.x = x.min(NUM_COLS - 1);
    console.y = y.min(NUM_ROWS - 1);
    console.sync_hw_cursor();
}

/// Current cursor position.
pub fn cursor() -> (usize, usize) {
    let console = CONSOLE.lock();
    (console.x, console.y)
}

/// Background colour for subsequent writes.
pub fn set_bg(color: Color) {
    CONSOLE.lock().bg = color;
}

/// Foreground colour for subsequent writes.
pub fn set_fg(color: Color) {
    CONSOLE.lock().fg = color;
}

/// Current (foreground, background) pair.
pub fn colors() -> (Color, Color) {
    let console = CONSOLE.lock();
    (console.fg, console.bg)
}

/// Set both colours at once (used when binding a terminal).
pub fn set_colors(fg: Color, bg: Color) {
    let mut console = CONSOLE.lock();
    console.fg = fg;
    console.bg = bg;
}

/// Route output: writes target `slot`'s shadow, or physical VGA when
/// `visible`.
pub fn set_routing(slot: usize, visible: bool) {
    let mut console = CONSOLE.lock();
    console.target = slot.min(NUM_SHADOWS - 1);
    console.visible = visible;
}

/// Current (slot, visible) routing.
pub fn routing() -> (usize, bool) {
    let console = CONSOLE.lock();
    (console.target, console.visible)
}

/// Copy physical VGA memory into `slot`'s shadow page (switch-away path).
pub fn snapshot_to_shadow(slot: usize) {
    let mut console = CONSOLE.lock();
    for index in 0..SCREEN_CELLS {
        console.shadows[slot].chars[index] = physical::read(index);
    }
}

/// Copy `slot`'s shadow page onto physical VGA memory (switch-in path).
pub fn restore_from_shadow(slot: usize) {
    let console = CONSOLE.lock();
    for index in 0..SCREEN_CELLS {
        physical::write(index, console.shadows[slot].chars[index]);
    }
}

/// Byte-for-byte copy of physical VGA memory, for switch verification.
pub fn physical_snapshot() -> [ScreenChar; SCREEN_CELLS] {
    let mut cells = [ScreenChar::blank(ColorCode::new(Color::LightGray, Color::Black));
        SCREEN_CELLS];
    for (index, cell) in cells.iter_mut().enumerate() {
        *cell = physical::read(index);
    }
    cells
}

/// Shadow slot for a terminal id (headless maps to the last slot).
pub fn shadow_slot(tid: i32) -> usize {
    if tid < 0 {
        NUM_SHADOWS - 1
    } else {
        (tid as usize).min(NUM_SHADOWS - 1)
    }
}

/// Physical address of `slot`'s shadow page (kernel memory is identity
/// mapped, so the static's address is the frame address).
pub fn shadow_frame_addr(slot: usize) -> u32 {
    let console = CONSOLE.lock();
    (&console.shadows[slot.min(NUM_SHADOWS - 1)] as *const ShadowPage as usize) as u32
}

/// Reflect insert/replace mode in the cursor shape.
pub fn set_cursor_shape(insert: bool) {
    let shape = if insert {
        CURSOR_SHAPE_INSERT
    } else {
        CURSOR_SHAPE_REPLACE
    };
    unsafe {
        port::outb(CRTC_INDEX, CRTC_CURSOR_START);
        port::outb(CRTC_DATA, shape);
    }
}

fn hw_cursor_move(index: usize) {
    unsafe {
        port::outb(CRTC_INDEX, CRTC_CURSOR_HIGH);
        port::outb(CRTC_DATA, (index >> 8) as u8);
        port::outb(CRTC_INDEX, CRTC_CURSOR_LOW);
        port::outb(CRTC_DATA, (index & 0xFF) as u8);
    }
}

/// `print!` plumbing.
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    CONSOLE.lock().write_fmt(args).ok();
}

// ---------------------------------------------------------------------------
// Physical VGA memory
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod physical {
    use super::{ScreenChar, SCREEN_CELLS};

    const VGA_TEXT: *mut ScreenChar = 0xB8000 as *mut ScreenChar;

    pub fn read(index: usize) -> ScreenChar {
        debug_assert!(index < SCREEN_CELLS);
        // SAFETY: index is bounded by the 80x25 cell count and the text
        // page is always mapped.
        unsafe { core::ptr::read_volatile(VGA_TEXT.add(index)) }
    }

    pub fn write(index: usize, cell: ScreenChar) {
        debug_assert!(index < SCREEN_CELLS);
        // SAFETY: as above; volatile so the MMIO write is not elided.
        unsafe { core::ptr::write_volatile(VGA_TEXT.add(index), cell) };
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod physical {
    use spin::Mutex;

    use super::{ScreenChar, ShadowPage, SCREEN_CELLS};

    // Host stand-in for the VGA text page, so terminal-switch round trips
    // are observable in tests.
    static FAKE_VGA: Mutex<ShadowPage> = Mutex::new(ShadowPage::new());

    pub fn read(index: usize) -> ScreenChar {
        debug_assert!(index < SCREEN_CELLS);
        FAKE_VGA.lock().chars[index]
    }

    pub fn write(index: usize, cell: ScreenChar) {
        debug_assert!(index < SCREEN_CELLS);
        FAKE_VGA.lock().chars[index] = cell;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset() {
        set_routing(0, true);
        set_colors(Color::LightGray, Color::Black);
        set_cursor(0, 0);
        clear();
    }

    #[test]
    fn putb_advances_and_wraps() {
        let _guard = crate::test_lock();
        reset();
        for _ in 0..NUM_COLS {
            putb(b'a');
        }
        let (x, y) = cursor();
        assert_eq!((x, y), (0, 1));
    }

    #[test]
    fn newline_resets_column() {
        let _guard = crate::test_lock();
        reset();
        putb(b'h');
        putb(b'\n');
        assert_eq!(cursor(), (0, 1));
    }

    #[test]
    fn scroll_keeps_cursor_on_last_row() {
        let _guard = crate::test_lock();
        reset();
        for _ in 0..NUM_ROWS + 3 {
            putb(b'x');
            putb(b'\n');
        }
        let (_, y) = cursor();
        assert_eq!(y, NUM_ROWS - 1);
    }

    #[test]
    fn shadow_and_physical_routing_are_distinct() {
        let _guard = crate::test_lock();
        reset();
        putb(b'V'); // physical write
        set_routing(1, false);
        set_cursor(0, 0);
        putb(b'S'); // shadow write
        let snapshot = physical_snapshot();
        assert_eq!(snapshot[0].glyph(), b'V');
        set_routing(0, true);
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let _guard = crate::test_lock();
        reset();
        putb(b'Q');
        snapshot_to_shadow(2);
        clear();
        restore_from_shadow(2);
        assert_eq!(physical_snapshot()[0].glyph(), b'Q');
    }

    #[test]
    fn shadow_frames_are_page_aligned() {
        for slot in 0..NUM_SHADOWS {
            assert_eq!(shadow_frame_addr(slot) & 0xFFF, 0);
        }
    }

    #[test]
    fn headless_uses_the_scratch_slot() {
        assert_eq!(shadow_slot(-1), NUM_SHADOWS - 1);
        assert_eq!(shadow_slot(1), 1);
    }
}
