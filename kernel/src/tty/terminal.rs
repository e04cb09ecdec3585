//! Terminal line buffers and the stdin/stdout file operations.
//!
//! Each text TTY owns an independent 128-byte line buffer filled by the
//! keyboard handler. `terminal_read` sleeps until a full line is
//! available, then consumes it up to and including the newline; unread
//! bytes shift to the front for the next read.
//!
//! The line buffers have their own lock, separate from the PCB lock, so
//! a reader can sleep without holding it.

use crate::{
    process::{self, current_pid, BlockingCall, ProcessState},
    sync::SpinLock,
};

use super::{console, NUM_TEXT_TTYS};

/// Line buffer capacity; also the maximum single terminal read.
pub const TERMINAL_SIZE: usize = 128;

/// Spaces rendered (and rubbed out) per tab stop.
pub const NUM_SPACES_PER_TAB: usize = 4;

/// Per-text-TTY line buffers and fill positions.
pub struct LineBuffers {
    buf: [[u8; TERMINAL_SIZE]; NUM_TEXT_TTYS],
    pos: [usize; NUM_TEXT_TTYS],
}

impl LineBuffers {
    /// Bytes typed so far on the current (unfinished) line.
    pub fn pending(&self, tty: u8) -> &[u8] {
        let idx = tty as usize - 1;
        &self.buf[idx][..self.pos[idx]]
    }

    /// Store one character; returns false when the buffer is full and the
    /// line must be flushed instead.
    pub fn push(&mut self, tty: u8, ch: u8) -> bool {
        let idx = tty as usize - 1;
        if self.pos[idx] >= TERMINAL_SIZE - 1 {
            return false;
        }
        self.buf[idx][self.pos[idx]] = ch;
        self.pos[idx] += 1;
        true
    }

    /// Remove the last character, reporting what it was.
    pub fn pop(&mut self, tty: u8) -> Option<u8> {
        let idx = tty as usize - 1;
        if self.pos[idx] == 0 {
            return None;
        }
        self.pos[idx] -= 1;
        let ch = self.buf[idx][self.pos[idx]];
        self.buf[idx][self.pos[idx]] = 0;
        Some(ch)
    }

    /// Terminate the current line and reset the fill position; the line
    /// (NUL-terminated) stays in place for the reader.
    pub fn finish_line(&mut self, tty: u8) {
        let idx = tty as usize - 1;
        let pos = self.pos[idx];
        self.buf[idx][pos] = 0;
        self.pos[idx] = 0;
    }

    /// Consume up to `want` bytes of the completed line into `out`,
    /// converting the terminating NUL into a newline. The unread
    /// remainder shifts to the front of the buffer.
    pub fn consume_line(&mut self, tty: u8, out: &mut [u8], want: usize) -> usize {
        let idx = tty as usize - 1;
        let want = want.min(TERMINAL_SIZE).min(out.len());

        let mut copied = want;
        for i in 0..want {
            out[i] = self.buf[idx][i];
            if self.buf[idx][i] == 0 {
                out[i] = b'\n';
                copied = i + 1;
                break;
            }
        }

        // Shift what was not consumed to index 0 and clear the tail.
        for i in copied..TERMINAL_SIZE {
            self.buf[idx][i - copied] = self.buf[idx][i];
        }
        for slot in self.buf[idx][TERMINAL_SIZE - copied..].iter_mut() {
            *slot = 0;
        }

        copied
    }

    /// Clear a TTY's line buffer entirely.
    pub fn clear(&mut self, tty: u8) {
        let idx = tty as usize - 1;
        self.buf[idx] = [0; TERMINAL_SIZE];
        self.pos[idx] = 0;
    }
}

/// The terminal lock; separate from the PCB lock so readers can sleep
/// without holding it.
static LINE_BUFFERS: SpinLock<LineBuffers> = SpinLock::new(LineBuffers {
    buf: [[0; TERMINAL_SIZE]; NUM_TEXT_TTYS],
    pos: [0; NUM_TEXT_TTYS],
});

/// Run `f` with the line buffers locked.
pub(crate) fn with_line_buffers<R>(f: impl FnOnce(&mut LineBuffers) -> R) -> R {
    let mut guard = LINE_BUFFERS.lock_irqsave();
    f(&mut guard)
}

/// stdin open: clear the calling process's line buffer.
pub fn terminal_open() -> i32 {
    let tty = process::with_table(|t| t.pcb(current_pid()).map(|p| p.tty).unwrap_or(1));
    with_line_buffers(|lb| lb.clear(tty));
    console::update_cursor();
    0
}

/// stdin close: clear the calling process's line buffer.
pub fn terminal_close() -> i32 {
    terminal_open()
}

/// Blocking line read from the calling process's TTY.
///
/// Echoes any characters already typed, sleeps until the keyboard
/// handler completes a line, and returns the bytes up to and including
/// the newline.
pub fn terminal_read(buf: &mut [u8]) -> i32 {
    if buf.is_empty() {
        return 0;
    }

    let pid = current_pid();
    let Some(tty) = process::with_table(|t| {
        let pcb = t.pcb_mut(pid)?;
        pcb.blocking_call = BlockingCall::TerminalRead;
        Some(pcb.tty)
    }) else {
        return -1;
    };

    // Echo what has been typed on this line so far.
    let mut pending = [0u8; TERMINAL_SIZE];
    let pending_len = with_line_buffers(|lb| {
        let p = lb.pending(tty);
        pending[..p.len()].copy_from_slice(p);
        p.len()
    });
    console::puts_tty(&pending[..pending_len], tty);

    process::process_sleep(pid);

    let want = buf.len();
    let copied = with_line_buffers(|lb| lb.consume_line(tty, buf, want));

    process::with_table(|t| {
        if let Some(pcb) = t.pcb_mut(pid) {
            pcb.blocking_call = BlockingCall::None;
        }
    });

    copied as i32
}

/// Write bytes (up to the first NUL) to the calling process's TTY.
pub fn terminal_write(buf: &[u8]) -> i32 {
    let tty = process::with_table(|t| t.pcb(current_pid()).map(|p| p.tty).unwrap_or(1));

    let mut written = 0;
    for &b in buf {
        if b == 0 {
            break;
        }
        console::putc_tty(b, tty);
        written += 1;
    }
    written
}

/// A completed line arrived on `tty`: wake one process blocked on a
/// terminal read there.
pub(crate) fn wake_reader(tty: u8) {
    process::with_table(|t| {
        for i in 0..t.len() {
            let pid = i as process::Pid;
            let matches = t
                .pcb(pid)
                .map(|p| {
                    p.in_use()
                        && p.tty == tty
                        && p.state == ProcessState::Sleeping
                        && matches!(p.blocking_call, BlockingCall::TerminalRead)
                })
                .unwrap_or(false);
            if matches {
                if let Some(pcb) = t.pcb_mut(pid) {
                    pcb.state = ProcessState::Running;
                }
                break;
            }
        }
    });
}
