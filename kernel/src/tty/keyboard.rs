//! Keyboard input, shortcuts and line editing.
//!
//! Scancode decoding is delegated to the `pc-keyboard` crate; this module
//! owns what happens next: modifier tracking, the shortcut table (Ctrl+L,
//! Ctrl+C, Alt+1..4) and the active TTY's line editor.

use bitflags::bitflags;

use crate::{
    process::{Pid, ProcessTable},
    signal::{self, Signal},
};

use super::{console, terminal, NUM_TEXT_TTYS, NUM_TTYS};

bitflags! {
    /// Modifier keys currently held.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Modifiers: u8 {
        const SHIFT = 1 << 0;
        const CTRL  = 1 << 1;
        const ALT   = 1 << 2;
    }
}

/// A decoded key press, after the scancode table has done its work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPress {
    /// A printable character (already shift/caps adjusted).
    Char(u8),
    Enter,
    Backspace,
    Tab,
    /// Function key F1..F12.
    Fn(u8),
}

/// Process one key press against the active TTY.
pub fn handle_key(press: KeyPress, mods: Modifiers) {
    let tty = super::active_tty();

    // Shortcuts fire before any line editing.
    if mods.contains(Modifiers::CTRL) {
        if let KeyPress::Char(c) = press {
            match c.to_ascii_lowercase() {
                b'l' => {
                    ctrl_l(tty);
                    return;
                }
                b'c' => {
                    ctrl_c(tty);
                    return;
                }
                _ => {}
            }
        }
    }

    if mods.contains(Modifiers::ALT) {
        if let KeyPress::Fn(n) = press {
            if (1..=NUM_TTYS).contains(&n) {
                let _ = super::tty_switch(n);
            }
            return;
        }
    }

    // Line editing only applies to text TTYs.
    if tty as usize > NUM_TEXT_TTYS {
        return;
    }

    match press {
        KeyPress::Enter => flush_line(tty),
        KeyPress::Backspace => backspace(tty),
        KeyPress::Tab => {
            let stored = terminal::with_line_buffers(|lb| lb.push(tty, b'\t'));
            if stored {
                for _ in 0..terminal::NUM_SPACES_PER_TAB {
                    console::putc_tty(b' ', tty);
                }
            } else {
                flush_line(tty);
            }
        }
        KeyPress::Char(c) => {
            let stored = terminal::with_line_buffers(|lb| lb.push(tty, c));
            if stored {
                console::putc_tty(c, tty);
            } else {
                // Buffer full: the line flushes and the character is
                // dropped.
                flush_line(tty);
            }
        }
        KeyPress::Fn(_) => {}
    }
}

/// Complete the current line and wake a blocked reader in this TTY.
fn flush_line(tty: u8) {
    console::putc_tty(b'\n', tty);
    terminal::with_line_buffers(|lb| lb.finish_line(tty));
    terminal::wake_reader(tty);
}

/// Rub out the last character (a tab erases its full width).
fn backspace(tty: u8) {
    let popped = terminal::with_line_buffers(|lb| lb.pop(tty));
    match popped {
        Some(b'\t') => {
            for _ in 0..terminal::NUM_SPACES_PER_TAB {
                console::clear_char(tty);
            }
        }
        Some(_) => console::clear_char(tty),
        None => {}
    }
}

/// Ctrl+L: clear the TTY and reprint the in-progress line.
fn ctrl_l(tty: u8) {
    if tty as usize > NUM_TEXT_TTYS {
        return;
    }
    console::clear_tty(tty);

    let mut pending = [0u8; terminal::TERMINAL_SIZE];
    let len = terminal::with_line_buffers(|lb| {
        let p = lb.pending(tty);
        pending[..p.len()].copy_from_slice(p);
        p.len()
    });

    for &b in &pending[..len] {
        if b == b'\t' {
            for _ in 0..terminal::NUM_SPACES_PER_TAB {
                console::putc_tty(b' ', tty);
            }
        } else {
            console::putc_tty(b, tty);
        }
    }
}

/// Ctrl+C: interrupt the foreground process of the active text TTY.
fn ctrl_c(tty: u8) {
    if tty as usize > NUM_TEXT_TTYS {
        return;
    }

    let target = crate::process::with_table(|t| deepest_descendant_in_tty(t, tty));
    if let Some(pid) = target {
        let _ = signal::send_signal(pid, Signal::Interrupt, 0);
    }
}

/// The foreground process of a TTY: the one with the longest parent
/// chain up to a root shell. A blocked foreground process may be
/// Sleeping, so state is not considered.
pub fn deepest_descendant_in_tty(table: &ProcessTable, tty: u8) -> Option<Pid> {
    let mut best: Option<Pid> = None;
    let mut longest: i32 = -1;

    for i in 0..table.len() {
        let pid = i as Pid;
        let Some(pcb) = table.pcb(pid).filter(|p| p.in_use() && p.tty == tty) else {
            continue;
        };

        let mut chain = 0;
        let mut cur = pcb;
        while cur.parent_pid >= 0 {
            chain += 1;
            match table.pcb(cur.parent_pid) {
                Some(parent) => cur = parent,
                None => break,
            }
        }

        if chain > longest {
            longest = chain;
            best = Some(pid);
        }
    }

    best
}

/// Scancode-driven entry point, wired to IRQ 1.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod isr {
    use lazy_static::lazy_static;
    use pc_keyboard::{
        layouts::Us104Key, DecodedKey, HandleControl, KeyCode, KeyState, Keyboard, ScancodeSet1,
    };
    use spin::Mutex;

    use super::{handle_key, KeyPress, Modifiers};

    lazy_static! {
        static ref DECODER: Mutex<Keyboard<Us104Key, ScancodeSet1>> = Mutex::new(Keyboard::new(
            ScancodeSet1::new(),
            Us104Key,
            HandleControl::Ignore,
        ));
    }

    static MODIFIERS: Mutex<Modifiers> = Mutex::new(Modifiers::empty());

    fn fn_key_number(code: KeyCode) -> Option<u8> {
        match code {
            KeyCode::F1 => Some(1),
            KeyCode::F2 => Some(2),
            KeyCode::F3 => Some(3),
            KeyCode::F4 => Some(4),
            KeyCode::F5 => Some(5),
            KeyCode::F6 => Some(6),
            KeyCode::F7 => Some(7),
            KeyCode::F8 => Some(8),
            KeyCode::F9 => Some(9),
            KeyCode::F10 => Some(10),
            KeyCode::F11 => Some(11),
            KeyCode::F12 => Some(12),
            _ => None,
        }
    }

    /// Handle one scancode byte from port 0x60.
    pub fn handle_scancode(scancode: u8) {
        let mut decoder = DECODER.lock();
        let Ok(Some(event)) = decoder.add_byte(scancode) else {
            return;
        };

        // Track Ctrl/Alt ourselves; the decoder folds Shift/CapsLock into
        // the character it produces.
        {
            let mut mods = MODIFIERS.lock();
            let down = event.state == KeyState::Down;
            match event.code {
                KeyCode::LControl | KeyCode::RControl => {
                    mods.set(Modifiers::CTRL, down);
                    return;
                }
                KeyCode::LAlt | KeyCode::RAltGr => {
                    mods.set(Modifiers::ALT, down);
                    return;
                }
                _ => {}
            }
        }

        if event.state != KeyState::Down {
            return;
        }

        let mods = *MODIFIERS.lock();

        if let Some(n) = fn_key_number(event.code) {
            drop(decoder);
            handle_key(KeyPress::Fn(n), mods);
            return;
        }

        let Some(decoded) = decoder.process_keyevent(event) else {
            return;
        };
        drop(decoder);

        let press = match decoded {
            DecodedKey::Unicode('\n') | DecodedKey::Unicode('\r') => KeyPress::Enter,
            DecodedKey::Unicode('\x08') => KeyPress::Backspace,
            DecodedKey::Unicode('\t') => KeyPress::Tab,
            DecodedKey::Unicode(c) if c.is_ascii() && !c.is_ascii_control() => {
                KeyPress::Char(c as u8)
            }
            _ => return,
        };

        handle_key(press, mods);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{with_table, PID_UNUSED};

    #[test]
    fn test_deepest_descendant_prefers_longest_chain() {
        let mut table = ProcessTable::new();
        let shell = table.get_open_pid();
        let child = table.get_open_pid();
        let grandchild = table.get_open_pid();

        table.pcb_mut(shell).unwrap().parent_pid = PID_UNUSED;
        table.pcb_mut(shell).unwrap().tty = 1;
        table.pcb_mut(child).unwrap().parent_pid = shell;
        table.pcb_mut(child).unwrap().tty = 1;
        table.pcb_mut(grandchild).unwrap().parent_pid = child;
        table.pcb_mut(grandchild).unwrap().tty = 1;

        assert_eq!(deepest_descendant_in_tty(&table, 1), Some(grandchild));
    }

    #[test]
    fn test_deepest_descendant_filters_by_tty() {
        let mut table = ProcessTable::new();
        let shell1 = table.get_open_pid();
        let shell2 = table.get_open_pid();
        let child2 = table.get_open_pid();

        table.pcb_mut(shell1).unwrap().parent_pid = PID_UNUSED;
        table.pcb_mut(shell1).unwrap().tty = 1;
        table.pcb_mut(shell2).unwrap().parent_pid = PID_UNUSED;
        table.pcb_mut(shell2).unwrap().tty = 2;
        table.pcb_mut(child2).unwrap().parent_pid = shell2;
        table.pcb_mut(child2).unwrap().tty = 2;

        assert_eq!(deepest_descendant_in_tty(&table, 1), Some(shell1));
        assert_eq!(deepest_descendant_in_tty(&table, 2), Some(child2));
        assert_eq!(deepest_descendant_in_tty(&table, 3), None);
    }

    #[test]
    fn test_sleeping_foreground_still_targeted() {
        use crate::process::ProcessState;

        let mut table = ProcessTable::new();
        let shell = table.get_open_pid();
        let child = table.get_open_pid();
        table.pcb_mut(shell).unwrap().parent_pid = PID_UNUSED;
        table.pcb_mut(child).unwrap().parent_pid = shell;
        // A foreground process blocked in a read is Sleeping but is still
        // the Ctrl+C target.
        table.pcb_mut(child).unwrap().state = ProcessState::Sleeping;

        assert_eq!(deepest_descendant_in_tty(&table, 1), Some(child));
    }

    #[test]
    fn test_line_editing_via_keys() {
        let _guard = super::super::display_test_lock();
        super::super::set_active_for_test(1);
        terminal::with_line_buffers(|lb| lb.clear(1));

        handle_key(KeyPress::Char(b'h'), Modifiers::empty());
        handle_key(KeyPress::Char(b'i'), Modifiers::empty());
        terminal::with_line_buffers(|lb| assert_eq!(lb.pending(1).to_vec(), b"hi"));

        handle_key(KeyPress::Backspace, Modifiers::empty());
        terminal::with_line_buffers(|lb| assert_eq!(lb.pending(1).to_vec(), b"h"));

        handle_key(KeyPress::Enter, Modifiers::empty());
        terminal::with_line_buffers(|lb| {
            let mut out = [0u8; 8];
            let n = lb.consume_line(1, &mut out, 8);
            assert_eq!(&out[..n], b"h\n");
        });
    }

    #[test]
    fn test_ctrl_c_signals_foreground() {
        let _guard = super::super::display_test_lock();
        super::super::set_active_for_test(1);

        let (shell, child) = with_table(|t| {
            let shell = t.get_open_pid();
            let child = t.get_open_pid();
            t.pcb_mut(shell).unwrap().parent_pid = PID_UNUSED;
            t.pcb_mut(shell).unwrap().tty = 1;
            t.pcb_mut(child).unwrap().parent_pid = shell;
            t.pcb_mut(child).unwrap().tty = 1;
            (shell, child)
        });

        handle_key(KeyPress::Char(b'c'), Modifiers::CTRL);

        with_table(|t| {
            use crate::signal::SignalStatus;
            assert_eq!(
                t.pcb(child).unwrap().signal_status[Signal::Interrupt as usize],
                SignalStatus::Pending
            );
            assert_eq!(
                t.pcb(shell).unwrap().signal_status[Signal::Interrupt as usize],
                SignalStatus::Open
            );
            t.release_slot(child);
            t.release_slot(shell);
        });
    }
}
