//! PS/2 keyboard driver.
//!
//! Scancodes are decoded with the `pc_keyboard` crate (ScancodeSet1, US
//! 104-key layout); this driver layers the kernel's own latched modifier
//! state, the shortcut table (Ctrl-L, Ctrl-Insert, Home/End, Alt-Fx,
//! Ctrl-C), num-lock keypad remapping, and the line-editing dispatch into
//! the terminal multiplexer on top of the decoded events.
//!
//! On non-x86_64 targets every function is a no-op stub.

use core::sync::atomic::{AtomicU8, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Latched modifier and lock state, kept across interrupts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Modifiers: u8 {
        const SHIFT       = 1 << 0;
        const CTRL        = 1 << 1;
        const ALT         = 1 << 2;
        const CAPS_LOCK   = 1 << 3;
        const NUM_LOCK    = 1 << 4;
        const SCROLL_LOCK = 1 << 5;
    }
}

static MODIFIERS: AtomicU8 = AtomicU8::new(0);

/// Current modifier bitmask.
pub fn modifiers() -> Modifiers {
    Modifiers::from_bits_truncate(MODIFIERS.load(Ordering::Relaxed))
}

fn set_modifier(flag: Modifiers, on: bool) {
    if on {
        MODIFIERS.fetch_or(flag.bits(), Ordering::Relaxed);
    } else {
        MODIFIERS.fetch_and(!flag.bits(), Ordering::Relaxed);
    }
}

fn toggle_modifier(flag: Modifiers) {
    MODIFIERS.fetch_xor(flag.bits(), Ordering::Relaxed);
}

#[cfg(target_arch = "x86_64")]
mod x86_64_impl {
    use pc_keyboard::{layouts, DecodedKey, HandleControl, KeyCode, KeyState, Keyboard, ScancodeSet1};
    use spin::Mutex;

    use super::*;
    use crate::{
        arch::port,
        drivers::pic,
        irq, process, tty,
    };

    const SCANCODE_PORT: u16 = 0x60;

    static KEYBOARD: Mutex<Option<Keyboard<layouts::Us104Key, ScancodeSet1>>> = Mutex::new(None);

    /// Bring up the decoder, register the IRQ 1 handler, unmask the line.
    pub fn init() {
        let kb = Keyboard::new(ScancodeSet1::new(), layouts::Us104Key, HandleControl::Ignore);
        *KEYBOARD.lock() = Some(kb);
        irq::install_handler(irq::KEYBOARD_VECTOR, keyboard_irq);
        pic::enable_irq(pic::KEYBOARD_LINE);
    }

    /// IRQ 1 entry: fetch the scancode, echo against the focused terminal,
    /// then restore console routing to the running process' terminal.
    fn keyboard_irq() {
        // SAFETY: reading port 0x60 pops the scancode the controller just
        // latched; this handler is the only reader.
        let scancode = unsafe { port::inb(SCANCODE_PORT) };

        let process_tid = process::current_tid();
        tty::save_console_state(process_tid);
        tty::load_console_state(tty::focused_tid() as i32);

        handle_scancode(scancode);

        // The shortcut may have switched terminals; re-read the focus.
        tty::save_console_state(tty::focused_tid() as i32);
        tty::load_console_state(process_tid);
    }

    /// Decode and act on one scancode.
    pub fn handle_scancode(scancode: u8) {
        let mut guard = KEYBOARD.lock();
        let Some(keyboard) = guard.as_mut() else {
            return;
        };
        let Ok(Some(event)) = keyboard.add_byte(scancode) else {
            return;
        };

        let down = event.state == KeyState::Down;
        track_modifiers(event.code, down);

        if down {
            if run_shortcut(event.code) {
                return;
            }
            // A committed line parks input until the reader consumes it.
            if tty::focused_line_committed() {
                return;
            }
            if run_editing_key(event.code) {
                return;
            }
        }

        if let Some(DecodedKey::Unicode(ch)) = keyboard.process_keyevent(event) {
            let byte = ch as u32;
            if (0x20..0x7F).contains(&byte) {
                tty::edit_insert_char(byte as u8);
            }
        }
    }

    fn track_modifiers(code: KeyCode, down: bool) {
        match code {
            KeyCode::LShift | KeyCode::RShift => set_modifier(Modifiers::SHIFT, down),
            KeyCode::LControl | KeyCode::RControl => set_modifier(Modifiers::CTRL, down),
            KeyCode::LAlt | KeyCode::RAltGr => set_modifier(Modifiers::ALT, down),
            KeyCode::CapsLock if down => toggle_modifier(Modifiers::CAPS_LOCK),
            KeyCode::NumpadLock if down => {
                // Ctrl+NumLock is Pause-Break on the 84-key protocol and
                // must not toggle the lock.
                if !modifiers().contains(Modifiers::CTRL) {
                    toggle_modifier(Modifiers::NUM_LOCK);
                }
            }
            KeyCode::ScrollLock if down => toggle_modifier(Modifiers::SCROLL_LOCK),
            _ => {}
        }
    }

    /// System shortcuts; returns true when the key was consumed.
    fn run_shortcut(code: KeyCode) -> bool {
        let mods = modifiers();
        let ctrl = mods.contains(Modifiers::CTRL);
        let alt = mods.contains(Modifiers::ALT);

        match code {
            KeyCode::L if ctrl && !alt => {
                tty::edit_clear_screen();
                true
            }
            KeyCode::Insert if ctrl => {
                tty::edit_toggle_insert_mode();
                true
            }
            KeyCode::Home => {
                tty::edit_home();
                true
            }
            KeyCode::End => {
                tty::edit_end();
                true
            }
            KeyCode::C if ctrl => {
                crate::println!("Can't kill me!");
                true
            }
            _ if alt => {
                let target = match code {
                    KeyCode::F1 => Some(0),
                    KeyCode::F2 => Some(1),
                    KeyCode::F3 => Some(2),
                    _ => None,
                };
                match target {
                    Some(tid) => tty::terminal_switch(tid).is_ok(),
                    None => false,
                }
            }
            _ => false,
        }
    }

    /// Editing and navigation keys; returns true when consumed.
    fn run_editing_key(code: KeyCode) -> bool {
        let num_lock = modifiers().contains(Modifiers::NUM_LOCK);
        match code {
            KeyCode::Backspace => tty::edit_backspace(),
            KeyCode::Return | KeyCode::NumpadEnter => tty::edit_commit(),
            KeyCode::Tab => {}
            KeyCode::ArrowLeft => tty::edit_cursor_left(),
            KeyCode::ArrowRight => tty::edit_cursor_right(),
            KeyCode::ArrowUp => tty::edit_arrow_up(),
            KeyCode::ArrowDown => tty::edit_arrow_down(),
            KeyCode::Delete | KeyCode::Insert | KeyCode::PageUp | KeyCode::PageDown => {}
            // Numpad: digits under num-lock, navigation without.
            KeyCode::Numpad0 if num_lock => tty::edit_insert_char(b'0'),
            KeyCode::Numpad1 if num_lock => tty::edit_insert_char(b'1'),
            KeyCode::Numpad2 if num_lock => tty::edit_insert_char(b'2'),
            KeyCode::Numpad3 if num_lock => tty::edit_insert_char(b'3'),
            KeyCode::Numpad4 if num_lock => tty::edit_insert_char(b'4'),
            KeyCode::Numpad5 if num_lock => tty::edit_insert_char(b'5'),
            KeyCode::Numpad6 if num_lock => tty::edit_insert_char(b'6'),
            KeyCode::Numpad7 if num_lock => tty::edit_insert_char(b'7'),
            KeyCode::Numpad8 if num_lock => tty::edit_insert_char(b'8'),
            KeyCode::Numpad9 if num_lock => tty::edit_insert_char(b'9'),
            KeyCode::NumpadPeriod if num_lock => tty::edit_insert_char(b'.'),
            KeyCode::NumpadAdd => {
                if num_lock {
                    tty::edit_insert_char(b'+');
                }
            }
            KeyCode::NumpadSubtract => {
                if num_lock {
                    tty::edit_insert_char(b'-');
                }
            }
            KeyCode::Numpad4 => tty::edit_cursor_left(),
            KeyCode::Numpad6 => tty::edit_cursor_right(),
            KeyCode::Numpad8 => tty::edit_arrow_up(),
            KeyCode::Numpad2 => tty::edit_arrow_down(),
            KeyCode::Numpad7 => tty::edit_home(),
            KeyCode::Numpad1 => tty::edit_end(),
            KeyCode::Numpad0
            | KeyCode::Numpad3
            | KeyCode::Numpad5
            | KeyCode::Numpad9
            | KeyCode::NumpadPeriod => {}
            _ => return false,
        }
        true
    }
}

#[cfg(target_arch = "x86_64")]
pub use x86_64_impl::{handle_scancode, init};

// ---------------------------------------------------------------------------
// Stubs for non-x86_64 architectures
// ---------------------------------------------------------------------------

#[cfg(not(target_arch = "x86_64"))]
pub fn init() {}

#[cfg(not(target_arch = "x86_64"))]
pub fn handle_scancode(_scancode: u8) {}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use crate::tty;

    const KEY_A: u8 = 0x1E;
    const KEY_B: u8 = 0x30;
    const KEY_L: u8 = 0x26;
    const KEY_ENTER: u8 = 0x1C;
    const KEY_BACKSPACE: u8 = 0x0E;
    const KEY_LSHIFT: u8 = 0x2A;
    const KEY_LCTRL: u8 = 0x1D;
    const KEY_LALT: u8 = 0x38;
    const KEY_F2: u8 = 0x3C;
    const KEY_NUMLOCK: u8 = 0x45;
    const KEY_KEYPAD_8: u8 = 0x48;
    const RELEASE: u8 = 0x80;

    fn fresh() {
        tty::init();
        tty::set_in_shell(false);
        init();
        // Clear any latched state from other tests.
        MODIFIERS.store(0, core::sync::atomic::Ordering::Relaxed);
    }

    fn press(code: u8) {
        handle_scancode(code);
        handle_scancode(code | RELEASE);
    }

    #[test]
    fn plain_typing_reaches_the_line_buffer() {
        let _guard = crate::test_lock();
        fresh();
        press(KEY_A);
        press(KEY_B);
        let (line, len, _) = tty::focused_line();
        assert_eq!(&line[..len], b"ab");
    }

    #[test]
    fn shift_produces_uppercase() {
        let _guard = crate::test_lock();
        fresh();
        handle_scancode(KEY_LSHIFT);
        press(KEY_A);
        handle_scancode(KEY_LSHIFT | RELEASE);
        let (line, len, _) = tty::focused_line();
        assert_eq!(&line[..len], b"A");
    }

    #[test]
    fn backspace_edits_the_line() {
        let _guard = crate::test_lock();
        fresh();
        press(KEY_A);
        press(KEY_B);
        press(KEY_BACKSPACE);
        let (line, len, _) = tty::focused_line();
        assert_eq!(&line[..len], b"a");
    }

    #[test]
    fn ctrl_l_clears_instead_of_typing() {
        let _guard = crate::test_lock();
        fresh();
        press(KEY_A);
        handle_scancode(KEY_LCTRL);
        press(KEY_L);
        handle_scancode(KEY_LCTRL | RELEASE);
        // The pending line survives a clear; no 'l' was inserted.
        let (line, len, _) = tty::focused_line();
        assert_eq!(&line[..len], b"a");
    }

    #[test]
    fn alt_f2_switches_terminals() {
        let _guard = crate::test_lock();
        fresh();
        handle_scancode(KEY_LALT);
        press(KEY_F2);
        handle_scancode(KEY_LALT | RELEASE);
        assert_eq!(tty::focused_tid(), 1);
    }

    #[test]
    fn numlock_remaps_the_keypad() {
        let _guard = crate::test_lock();
        fresh();
        press(KEY_NUMLOCK); // engage num-lock
        assert!(modifiers().contains(Modifiers::NUM_LOCK));
        press(KEY_KEYPAD_8);
        let (line, len, _) = tty::focused_line();
        assert_eq!(&line[..len], b"8");
    }

    #[test]
    fn enter_without_reader_flushes() {
        let _guard = crate::test_lock();
        fresh();
        press(KEY_A);
        press(KEY_ENTER);
        let (_, len, _) = tty::focused_line();
        assert_eq!(len, 0);
    }

    #[test]
    fn modifiers_latch_across_events() {
        let _guard = crate::test_lock();
        fresh();
        handle_scancode(KEY_LCTRL);
        assert!(modifiers().contains(Modifiers::CTRL));
        handle_scancode(KEY_LCTRL | RELEASE);
        assert!(!modifiers().contains(Modifiers::CTRL));
    }
}
