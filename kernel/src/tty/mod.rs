//! Terminal multiplexer.
//!
//! Three visible virtual terminals plus one headless slot. Each terminal
//! carries a line-discipline buffer with insert/replace editing, a
//! 20-entry command-history ring, its own colours, and a saved cursor.
//! The keyboard driver decodes keys and drives the `edit_*` operations
//! here; `Alt+Fx` switches which terminal owns the screen and swaps the
//! shadow framebuffers.
//!
//! Console routing protocol: whoever is about to draw (the scheduler on
//! behalf of the current process, or the keyboard handler on behalf of
//! the focused terminal) binds the console to that terminal first with
//! [`load_console_state`] and saves it back with [`save_console_state`].

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

use crate::{
    arch,
    drivers::vga::{self, Color, Dir, NUM_COLS},
    error::{KernelError, KernelResult, TtyError},
    mm, process,
};

/// Number of user-visible terminals (`Alt+F1..F3`).
pub const NUM_TERMINALS: usize = 3;
/// Terminal slots including the headless scratch terminal.
pub const NUM_SLOTS: usize = NUM_TERMINALS + 1;
/// Line buffer size; one byte is reserved for the terminating newline.
pub const LINE_BUFFER_SIZE: usize = 128;
/// Command-history ring capacity.
pub const HISTORY_LENGTH: usize = 20;

/// One virtual terminal.
#[derive(Clone, Copy)]
pub struct Terminal {
    pub cursor_x: usize,
    pub cursor_y: usize,
    pub insert_mode: bool,
    pub visible: bool,
    pub fg: Color,
    pub bg: Color,

    // Line discipline
    line: [u8; LINE_BUFFER_SIZE],
    line_len: usize,
    line_cursor: usize,
    /// How many echoed bytes history browsing must erase.
    clear_num: usize,

    // Command history ring
    history: [[u8; LINE_BUFFER_SIZE]; HISTORY_LENGTH],
    history_sizes: [usize; HISTORY_LENGTH],
    history_len: usize,
    history_pos: usize,
    history_viewer: usize,
}

impl Terminal {
    const fn new(fg: Color, bg: Color) -> Self {
        Self {
            cursor_x: 0,
            cursor_y: 0,
            insert_mode: true,
            visible: false,
            fg,
            bg,
            line: [0; LINE_BUFFER_SIZE],
            line_len: 0,
            line_cursor: 0,
            clear_num: 0,
            history: [[0; LINE_BUFFER_SIZE]; HISTORY_LENGTH],
            history_sizes: [0; HISTORY_LENGTH],
            history_len: 0,
            history_pos: 0,
            history_viewer: 0,
        }
    }

    fn pending_line(&self) -> &[u8] {
        &self.line[..self.line_len]
    }
}

static TERMINALS: Mutex<[Terminal; NUM_SLOTS]> = Mutex::new([
    Terminal::new(Color::LightCyan, Color::Black),
    Terminal::new(Color::White, Color::Black),
    Terminal::new(Color::LightRed, Color::Black),
    Terminal::new(Color::LightGray, Color::Black),
]);

/// Terminal with keyboard focus (the visible one).
static FOCUSED: AtomicUsize = AtomicUsize::new(0);
/// Per-slot: a `terminal_read` is waiting for a line.
static READ_PENDING: [AtomicBool; NUM_SLOTS] = [
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
];
/// Per-slot: the line buffer holds a completed line.
static RETURNED: [AtomicBool; NUM_SLOTS] = [
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
];
/// The foreground program is a shell; only shell reads are recorded in
/// history.
static IN_SHELL: AtomicBool = AtomicBool::new(false);

/// Map a terminal id (`-1` headless) to its slot index.
pub fn slot(tid: i32) -> usize {
    vga::shadow_slot(tid)
}

/// Terminal id of the slot with keyboard focus.
pub fn focused_tid() -> usize {
    FOCUSED.load(Ordering::Relaxed)
}

/// Record whether the foreground program is a shell.
pub fn set_in_shell(in_shell: bool) {
    IN_SHELL.store(in_shell, Ordering::Relaxed);
}

/// Whether terminal `tid` is the one on screen.
pub fn tid_visible(tid: i32) -> bool {
    tid >= 0 && tid as usize == focused_tid()
}

/// Boot-time terminal setup: clear every shadow page, focus terminal 0.
pub fn init() {
    arch::without_interrupts(|| {
        let mut terms = TERMINALS.lock();
        for (index, term) in terms.iter_mut().enumerate() {
            *term = Terminal::new(term.fg, term.bg);
            vga::set_routing(index, false);
            vga::set_colors(term.fg, term.bg);
            vga::clear();
            let tid = if index == NUM_SLOTS - 1 { -1 } else { index as i32 };
            mm::map_user_vidmem(tid, false);
        }
        terms[0].visible = true;
        FOCUSED.store(0, Ordering::Relaxed);
        vga::set_routing(0, true);
        vga::set_colors(terms[0].fg, terms[0].bg);
        vga::set_cursor(0, 0);
        vga::clear();
        mm::map_user_vidmem(0, true);
    });
}

/// Bind the console to terminal `tid`: routing, cursor, and colours.
pub fn load_console_state(tid: i32) {
    let index = slot(tid);
    let terms = TERMINALS.lock();
    let term = &terms[index];
    vga::set_routing(index, term.visible);
    vga::set_colors(term.fg, term.bg);
    vga::set_cursor(term.cursor_x, term.cursor_y);
}

/// Save the console's cursor and colours back into terminal `tid`.
pub fn save_console_state(tid: i32) {
    let index = slot(tid);
    let mut terms = TERMINALS.lock();
    let (x, y) = vga::cursor();
    let (fg, bg) = vga::colors();
    let term = &mut terms[index];
    term.cursor_x = x;
    term.cursor_y = y;
    term.fg = fg;
    term.bg = bg;
}

/// Route the console at the visible terminal for exception output.
pub fn emergency_console() {
    let focused = focused_tid();
    load_console_state(focused as i32);
}

/// Switch the screen to `new_tid`.
///
/// Snapshots the outgoing terminal's framebuffer into its shadow page,
/// paints the incoming shadow onto VGA memory, retargets both user video
/// mappings, and restores the incoming cursor, colours, and cursor shape.
/// The console must currently be bound to the focused terminal.
pub fn terminal_switch(new_tid: usize) -> KernelResult<()> {
    let old = focused_tid();
    if new_tid == old {
        return Ok(());
    }
    if new_tid >= NUM_TERMINALS {
        return Err(KernelError::Tty(TtyError::BadTerminal));
    }
    arch::without_interrupts(|| {
        save_console_state(old as i32);
        {
            let mut terms = TERMINALS.lock();
            terms[old].visible = false;
            terms[new_tid].visible = true;
        }
        vga::snapshot_to_shadow(old);
        vga::restore_from_shadow(new_tid);
        mm::map_user_vidmem(old as i32, false);
        mm::map_user_vidmem(new_tid as i32, true);
        FOCUSED.store(new_tid, Ordering::Relaxed);
        load_console_state(new_tid as i32);
        let insert = TERMINALS.lock()[new_tid].insert_mode;
        vga::set_cursor_shape(insert);
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// stdin / stdout
// ---------------------------------------------------------------------------

/// Line-buffered read from the calling process' terminal.
///
/// Blocks until the keyboard commits a line with Enter, then copies up to
/// `buf.len()` bytes (newline included) and resets the line buffer. Shell
/// reads are recorded in the history ring.
pub fn terminal_read(buf: &mut [u8]) -> KernelResult<usize> {
    let index = slot(process::current_tid());

    READ_PENDING[index].store(true, Ordering::Release);
    arch::enable_interrupts();
    while !RETURNED[index].load(Ordering::Acquire) {
        core::hint::spin_loop();
    }
    arch::disable_interrupts();
    RETURNED[index].store(false, Ordering::Release);

    let copied = arch::without_interrupts(|| {
        let mut terms = TERMINALS.lock();
        let term = &mut terms[index];
        let n = buf.len().min(term.line_len);
        buf[..n].copy_from_slice(&term.line[..n]);
        if IN_SHELL.load(Ordering::Relaxed) {
            record_history(term);
        }
        term.line_len = 0;
        term.line_cursor = 0;
        n
    });
    READ_PENDING[index].store(false, Ordering::Release);
    Ok(copied)
}

/// Byte-by-byte write to the console, which the caller (scheduler or
/// keyboard wrapper) has bound to the right terminal.
pub fn terminal_write(buf: &[u8]) -> KernelResult<usize> {
    for &byte in buf {
        vga::putb(byte);
    }
    Ok(buf.len())
}

/// Record the just-committed line if it differs from the previous entry.
/// The trailing newline is not stored.
fn record_history(term: &mut Terminal) {
    if term.line_len == 0 {
        return;
    }
    let stored_len = term.line_len - 1;
    let previous = if term.history_pos == 0 {
        HISTORY_LENGTH - 1
    } else {
        term.history_pos - 1
    };
    let same = term.history_sizes[previous] == stored_len
        && term.history[previous][..stored_len] == term.line[..stored_len];
    if !same && stored_len > 0 {
        term.history_sizes[term.history_pos] = stored_len;
        let (history, line) = (&mut term.history, &term.line);
        history[term.history_pos][..stored_len].copy_from_slice(&line[..stored_len]);
        term.history_pos = (term.history_pos + 1) % HISTORY_LENGTH;
        if term.history_len < HISTORY_LENGTH - 1 {
            term.history_len += 1;
        }
    }
    term.history_viewer = term.history_pos;
}

// ---------------------------------------------------------------------------
// Line editing (driven by the keyboard on the focused terminal; console
// already bound to it)
// ---------------------------------------------------------------------------

fn with_focused<R>(f: impl FnOnce(&mut Terminal) -> R) -> R {
    let index = focused_tid();
    let mut terms = TERMINALS.lock();
    f(&mut terms[index])
}

/// Whether the focused terminal already holds a committed line (further
/// typing is dropped until it is consumed).
pub fn focused_line_committed() -> bool {
    RETURNED[focused_tid()].load(Ordering::Acquire)
}

/// Insert or overwrite one printable byte at the line cursor and echo it.
pub fn edit_insert_char(byte: u8) {
    with_focused(|term| {
        if term.insert_mode {
            if term.line_len >= LINE_BUFFER_SIZE - 1 {
                return;
            }
            if term.line_cursor == term.line_len {
                term.line[term.line_cursor] = byte;
                term.line_cursor += 1;
                term.line_len += 1;
                vga::putb(byte);
            } else {
                // Shift the tail right, redraw it, then drop the byte in.
                let (x, y) = vga::cursor();
                for i in (term.line_cursor..term.line_len).rev() {
                    term.line[i + 1] = term.line[i];
                }
                term.line_len += 1;
                term.line_cursor += 1;
                vga::move_cursor(Dir::Right);
                for i in term.line_cursor..term.line_len {
                    vga::putb(term.line[i]);
                }
                vga::set_cursor(x, y);
                term.line[term.line_cursor - 1] = byte;
                vga::putb(byte);
            }
        } else if term.line_cursor < term.line_len {
            term.line[term.line_cursor] = byte;
            term.line_cursor += 1;
            vga::putb(byte);
        } else if term.line_len < LINE_BUFFER_SIZE - 1 {
            term.line[term.line_cursor] = byte;
            term.line_cursor += 1;
            term.line_len += 1;
            vga::putb(byte);
        } else {
            return;
        }
        term.clear_num += 1;
    });
}

/// Backspace at the line cursor.
pub fn edit_backspace() {
    with_focused(|term| {
        if term.line_len == 0 {
            return;
        }
        if term.clear_num > 0 {
            term.clear_num -= 1;
        }
        if term.line_cursor == term.line_len {
            vga::backspace();
            term.line_len -= 1;
            term.line_cursor -= 1;
        } else if term.line_cursor > 0 {
            let (x, y) = vga::cursor();
            for i in term.line_cursor - 1..term.line_len - 1 {
                term.line[i] = term.line[i + 1];
            }
            term.line_len -= 1;
            term.line_cursor -= 1;
            vga::move_cursor(Dir::Left);
            for i in term.line_cursor..term.line_len {
                vga::putb(term.line[i]);
            }
            vga::putb(b' ');
            vga::set_cursor(x, y);
            vga::move_cursor(Dir::Left);
        }
    });
}

/// Commit the line: echo the newline and hand the buffer to a pending
/// read, or discard it when nobody is waiting.
pub fn edit_commit() {
    let index = focused_tid();
    with_focused(|term| {
        vga::rmove_cursor(Dir::Right, term.line_len - term.line_cursor);
        vga::putb(b'\n');
        term.line[term.line_len] = b'\n';
        term.line_len += 1;
        if READ_PENDING[index].load(Ordering::Acquire) {
            RETURNED[index].store(true, Ordering::Release);
        } else {
            term.line_len = 0;
            term.line_cursor = 0;
        }
        term.clear_num = 0;
    });
}

/// Cursor one cell left within the line.
pub fn edit_cursor_left() {
    with_focused(|term| {
        if term.line_cursor > 0 {
            vga::move_cursor(Dir::Left);
            term.line_cursor -= 1;
        }
    });
}

/// Cursor one cell right within the line.
pub fn edit_cursor_right() {
    with_focused(|term| {
        if term.line_cursor < term.line_len {
            vga::move_cursor(Dir::Right);
            term.line_cursor += 1;
        }
    });
}

/// Home: jump to the start of the line.
pub fn edit_home() {
    with_focused(|term| {
        vga::rmove_cursor(Dir::Left, term.line_cursor);
        term.line_cursor = 0;
    });
}

/// End: jump past the last byte of the line.
pub fn edit_end() {
    with_focused(|term| {
        vga::rmove_cursor(Dir::Right, term.line_len - term.line_cursor);
        term.line_cursor = term.line_len;
    });
}

/// Toggle insert/replace mode and the cursor shape.
pub fn edit_toggle_insert_mode() {
    with_focused(|term| {
        term.insert_mode = !term.insert_mode;
        vga::set_cursor_shape(term.insert_mode);
    });
}

/// Ctrl-L: clear the screen, re-echo the pending line, keep the column.
pub fn edit_clear_screen() {
    with_focused(|term| {
        vga::set_cursor(0, 0);
        vga::clear();
        for i in 0..term.line_len {
            vga::putb(term.line[i]);
        }
        vga::set_cursor(0, 0);
        vga::rmove_cursor(Dir::Right, term.line_cursor);
    });
}

fn erase_current_line(term: &mut Terminal) {
    if term.line_cursor != 0 {
        vga::rmove_cursor(Dir::Right, term.line_len - term.line_cursor);
        term.line_cursor = 0;
    }
    vga::rbackspace(term.clear_num);
    term.clear_num = 0;
}

fn echo_line(term: &Terminal) {
    for &byte in term.pending_line() {
        vga::putb(byte);
    }
}

/// Up arrow: move up a row inside a multi-row line, otherwise recall the
/// previous history entry.
pub fn edit_arrow_up() {
    with_focused(|term| {
        if term.line_cursor > NUM_COLS {
            vga::move_cursor(Dir::Up);
            term.line_cursor -= NUM_COLS;
            return;
        }
        if term.history_len == 0 {
            return;
        }
        erase_current_line(term);
        term.history_viewer = if term.history_viewer != 0 {
            term.history_viewer - 1
        } else {
            term.history_len - 1
        };
        let recalled = term.history_sizes[term.history_viewer];
        term.line_len = recalled;
        term.line_cursor = recalled;
        let (history, line) = (&term.history, &mut term.line);
        line[..recalled].copy_from_slice(&history[term.history_viewer][..recalled]);
        term.clear_num = recalled;
        echo_line(term);
    });
}

/// Down arrow: move down a row inside a multi-row line, otherwise walk
/// the history ring forward (back to the empty prompt at the newest end).
pub fn edit_arrow_down() {
    with_focused(|term| {
        if term.line_cursor + NUM_COLS <= term.line_len {
            vga::move_cursor(Dir::Down);
            term.line_cursor += NUM_COLS;
            return;
        }
        if term.history_len == 0 || term.history_pos == term.history_viewer {
            return;
        }
        erase_current_line(term);
        term.history_viewer += 1;
        if term.history_pos == term.history_viewer {
            term.line_len = 0;
            term.line_cursor = 0;
            return;
        }
        term.history_viewer %= term.history_len;
        let recalled = term.history_sizes[term.history_viewer];
        term.line_len = recalled;
        term.line_cursor = recalled;
        let (history, line) = (&term.history, &mut term.line);
        line[..recalled].copy_from_slice(&history[term.history_viewer][..recalled]);
        term.clear_num = recalled;
        echo_line(term);
    });
}

// ---------------------------------------------------------------------------
// Test hooks
// ---------------------------------------------------------------------------

/// Snapshot of the focused terminal's pending line (tests and debugging).
pub fn focused_line() -> ([u8; LINE_BUFFER_SIZE], usize, usize) {
    with_focused(|term| (term.line, term.line_len, term.line_cursor))
}

/// Simulate a committed line sitting in slot `index` (tests only).
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn test_inject_line(index: usize, line: &[u8]) {
    let mut terms = TERMINALS.lock();
    let term = &mut terms[index];
    term.line[..line.len()].copy_from_slice(line);
    term.line_len = line.len();
    drop(terms);
    RETURNED[index].store(true, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() {
        init();
        set_in_shell(true);
    }

    // A minimal live process bound to `tid`, so reads resolve a terminal.
    fn fake_process(tid: i32) {
        process::init();
        let pid = process::allocate_pid().unwrap();
        process::with_slot(pid, |pcb| {
            pcb.in_use = true;
            pcb.pid = pid;
            pcb.tid = tid;
        })
        .unwrap();
        process::set_current(Some(pid));
    }

    fn type_str(s: &str) {
        for byte in s.bytes() {
            edit_insert_char(byte);
        }
    }

    #[test]
    fn typed_bytes_land_in_the_line_buffer() {
        let _guard = crate::test_lock();
        fresh();
        type_str("hello");
        let (line, len, cursor) = focused_line();
        assert_eq!(&line[..len], b"hello");
        assert_eq!(cursor, 5);
    }

    #[test]
    fn backspace_removes_the_last_byte() {
        let _guard = crate::test_lock();
        fresh();
        type_str("abc");
        edit_backspace();
        let (line, len, _) = focused_line();
        assert_eq!(&line[..len], b"ab");
    }

    #[test]
    fn mid_line_insert_shifts_the_tail() {
        let _guard = crate::test_lock();
        fresh();
        type_str("held");
        edit_cursor_left();
        type_str("l");
        let (line, len, _) = focused_line();
        assert_eq!(&line[..len], b"helld");
    }

    #[test]
    fn replace_mode_overwrites() {
        let _guard = crate::test_lock();
        fresh();
        type_str("abc");
        edit_toggle_insert_mode();
        edit_home();
        type_str("x");
        let (line, len, _) = focused_line();
        assert_eq!(&line[..len], b"xbc");
        edit_toggle_insert_mode();
    }

    #[test]
    fn line_caps_at_127_bytes() {
        let _guard = crate::test_lock();
        fresh();
        for _ in 0..200 {
            edit_insert_char(b'z');
        }
        let (_, len, _) = focused_line();
        assert_eq!(len, LINE_BUFFER_SIZE - 1);
    }

    #[test]
    fn commit_without_reader_discards_the_line() {
        let _guard = crate::test_lock();
        fresh();
        type_str("ls");
        edit_commit();
        let (_, len, _) = focused_line();
        assert_eq!(len, 0);
    }

    #[test]
    fn history_recall_round_trip() {
        let _guard = crate::test_lock();
        fresh();
        // Commit through the read path so history records the line.
        fake_process(0);
        type_str("cat frame0.txt");
        READ_PENDING[0].store(true, Ordering::Release);
        edit_commit();
        let mut buf = [0u8; 64];
        // RETURNED is set, so the read completes immediately.
        let n = terminal_read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"cat frame0.txt\n");

        edit_arrow_up();
        let (line, len, _) = focused_line();
        assert_eq!(&line[..len], b"cat frame0.txt");

        edit_arrow_down();
        let (_, len, _) = focused_line();
        assert_eq!(len, 0);
    }

    #[test]
    fn duplicate_commands_are_recorded_once() {
        let _guard = crate::test_lock();
        fresh();
        fake_process(0);
        for _ in 0..2 {
            type_str("ls");
            READ_PENDING[0].store(true, Ordering::Release);
            edit_commit();
            let mut buf = [0u8; 16];
            terminal_read(&mut buf).unwrap();
        }
        let terms = TERMINALS.lock();
        assert_eq!(terms[0].history_len, 1);
    }

    #[test]
    fn switch_round_trip_preserves_the_framebuffer() {
        let _guard = crate::test_lock();
        fresh();
        terminal_write(b"abc").unwrap();
        let before = vga::physical_snapshot();
        terminal_switch(1).unwrap();
        terminal_write(b"other terminal content").unwrap();
        terminal_switch(0).unwrap();
        let after = vga::physical_snapshot();
        assert!(before
            .iter()
            .zip(after.iter())
            .all(|(a, b)| a.glyph() == b.glyph()));
    }

    #[test]
    fn switch_rejects_unknown_terminals() {
        let _guard = crate::test_lock();
        fresh();
        assert!(terminal_switch(NUM_TERMINALS).is_err());
        assert!(terminal_switch(0).is_ok());
    }
}
