//! Signal delivery.
//!
//! Five signals with kernel-side injection: exception handlers raise
//! div-zero/segfault, Ctrl+C raises interrupt, a periodic timer callback
//! raises alarm. `handle_signals` runs after every context switch when the
//! scheduler's interrupt is the only thing on the kernel stack; it either
//! applies the default action or rewrites the user stack so the program
//! returns through the in-stack trampoline into `sigreturn`.

pub mod frame;

use core::sync::atomic::{AtomicBool, Ordering};

use crate::{
    error::{KernelError, KernelResult},
    process::{self, ProcessState},
    timer,
};

/// Number of signals.
pub const NUM_SIGNALS: usize = 5;

/// Seconds between alarm-signal deliveries.
pub const ALARM_INTERVAL_SECONDS: u32 = 10;

/// The signals, in priority order: the lowest-numbered pending signal is
/// delivered first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Signal {
    DivZero = 0,
    Segfault = 1,
    Interrupt = 2,
    Alarm = 3,
    Io = 4,
}

impl Signal {
    pub fn from_index(index: i32) -> Option<Self> {
        match index {
            0 => Some(Self::DivZero),
            1 => Some(Self::Segfault),
            2 => Some(Self::Interrupt),
            3 => Some(Self::Alarm),
            4 => Some(Self::Io),
            _ => None,
        }
    }
}

/// Delivery state of one signal slot.
///
/// A `Handling` signal blocks every other delivery for the process until
/// its trampoline returns through `sigreturn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalStatus {
    Open,
    Pending,
    Handling,
}

static SIGNALS_INITED: AtomicBool = AtomicBool::new(false);

/// Periodic alarm: offer the alarm signal to every live process that
/// installed a handler for it.
fn alarm_callback(_time: f64) {
    process::with_table(|t| {
        for i in 0..t.len() {
            let pid = i as process::Pid;
            let eligible = t
                .pcb(pid)
                .map(|p| {
                    p.in_use()
                        && p.state != ProcessState::Stopping
                        && p.signal_handlers[Signal::Alarm as usize].is_some()
                })
                .unwrap_or(false);
            if eligible {
                let _ = mark_pending(t, pid, Signal::Alarm, 0);
            }
        }
    });
}

/// Register the alarm callback with the timer. Called once at boot.
pub fn init() -> KernelResult<()> {
    let id = timer::register_periodic_callback(
        timer::PIT_FREQUENCY * ALARM_INTERVAL_SECONDS,
        alarm_callback,
    );
    if id == 0 {
        return Err(KernelError::ResourceExhausted {
            resource: "timer callbacks",
        });
    }
    SIGNALS_INITED.store(true, Ordering::Release);
    Ok(())
}

/// Table-level half of `send_signal`; the caller holds the PCB lock.
fn mark_pending(
    table: &mut process::ProcessTable,
    pid: process::Pid,
    signal: Signal,
    data: u32,
) -> KernelResult<()> {
    let pcb = table
        .pcb_mut(pid)
        .filter(|p| p.in_use())
        .ok_or(KernelError::ProcessNotFound { pid })?;

    if pcb.state == ProcessState::Stopping {
        return Err(KernelError::InvalidState {
            expected: "running",
            actual: "stopping",
        });
    }

    // A signal already pending or mid-handling is not re-raised.
    if pcb.signal_status[signal as usize] != SignalStatus::Open {
        return Err(KernelError::WouldBlock);
    }

    pcb.signal_status[signal as usize] = SignalStatus::Pending;
    pcb.signal_data[signal as usize] = data;
    Ok(())
}

/// Raise `signal` for `pid` with the given payload word.
pub fn send_signal(pid: process::Pid, signal: Signal, data: u32) -> KernelResult<()> {
    process::with_table(|t| mark_pending(t, pid, signal, data))
}

/// What `handle_signals` decided to do for the current process.
enum Action {
    Nothing,
    DefaultHalt(u16),
    Invoke {
        handler: u32,
        signum: u32,
        data: u32,
    },
}

/// Pick the signal to deliver for `pid` and transition its status.
///
/// Defaults: div-zero and segfault halt with status 256, interrupt halts
/// with 0, alarm and I/O are ignored (their slots reopen).
fn select_action(table: &mut process::ProcessTable, pid: process::Pid) -> Action {
    let Some(pcb) = table.pcb_mut(pid).filter(|p| p.in_use()) else {
        return Action::Nothing;
    };

    // Nothing is delivered while another signal is mid-handling.
    if pcb
        .signal_status
        .iter()
        .any(|&s| s == SignalStatus::Handling)
    {
        return Action::Nothing;
    }

    let Some(signum) = pcb
        .signal_status
        .iter()
        .position(|&s| s == SignalStatus::Pending)
    else {
        return Action::Nothing;
    };

    pcb.signal_status[signum] = SignalStatus::Handling;

    match pcb.signal_handlers[signum] {
        Some(handler) => Action::Invoke {
            handler,
            signum: signum as u32,
            data: pcb.signal_data[signum],
        },
        None => match Signal::from_index(signum as i32) {
            Some(Signal::DivZero) | Some(Signal::Segfault) => Action::DefaultHalt(256),
            Some(Signal::Interrupt) => Action::DefaultHalt(0),
            _ => {
                // Ignored by default; reopen the slot.
                pcb.signal_status[signum] = SignalStatus::Open;
                Action::Nothing
            }
        },
    }
}

/// Deliver the lowest-numbered pending signal for the current process, if
/// any. Runs after a context switch with only the scheduler's interrupt
/// frame on the stack.
pub fn handle_signals() {
    if !SIGNALS_INITED.load(Ordering::Acquire) {
        return;
    }

    let pid = process::current_pid();
    let action = process::with_table(|t| {
        if t.is_empty() {
            Action::Nothing
        } else {
            select_action(t, pid)
        }
    });

    match action {
        Action::Nothing => {}
        Action::DefaultHalt(status) => {
            process::process_halt(status);
        }
        Action::Invoke {
            handler,
            signum,
            data,
        } => {
            invoke_handler(pid, handler, signum, data);
        }
    }
}

/// Rewrite the user stack so the IRET enters the handler. Every write is
/// bounds-checked against the process's page mappings; an unusable stack
/// drops the delivery.
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn invoke_handler(pid: process::Pid, handler: u32, signum: u32, data: u32) {
    use crate::process::validate::is_userspace_region_valid;

    process::with_table(|t| {
        let Some(pcb) = t.pcb(pid) else { return };
        let context_ptr = crate::arch::user_context_ptr(pcb.kernel_stack_base);
        // SAFETY: the process entered the kernel from user mode, so its
        // saved hardware context sits at the fixed offset below the
        // kernel stack top.
        let context = unsafe { &mut *context_ptr };

        let user_esp = context.esp;
        let frame = frame::build_signal_frame(user_esp, signum, data, context);

        if !is_userspace_region_valid(pcb, frame.new_esp, frame.bytes.len() as u32) {
            return;
        }

        // SAFETY: the destination range was just validated to lie inside
        // the process's mapped pages, which are resident (no demand
        // paging).
        unsafe {
            core::ptr::copy_nonoverlapping(
                frame.bytes.as_ptr(),
                frame.new_esp as *mut u8,
                frame.bytes.len(),
            );
        }

        context.esp = frame.new_esp;
        context.eip = handler;
    });
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn invoke_handler(_pid: process::Pid, _handler: u32, _signum: u32, _data: u32) {}

/// `sigreturn`: restore the context saved on the user stack by
/// [`handle_signals`] and reopen the signal slot. Returns the restored
/// eax so the syscall path preserves it.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn sigreturn() -> i32 {
    process::with_table(|t| {
        let pid = process::current_pid();
        let Some(pcb) = t.pcb_mut(pid) else { return -1 };

        let context_ptr = crate::arch::user_context_ptr(pcb.kernel_stack_base);
        // SAFETY: as in invoke_handler; sigreturn is only reached from the
        // int 0x80 trampoline, so the saved context is live.
        let context = unsafe { &mut *context_ptr };

        // User ESP points at signum; the handler's ret consumed the
        // trampoline address.
        let esp = context.esp;
        // SAFETY: the frame these bytes belong to was bounds-checked when
        // it was pushed.
        let stack = unsafe {
            core::slice::from_raw_parts(esp as *const u8, 8 + frame::CONTEXT_SIZE)
        };

        let Some((signum, saved)) = frame::parse_sigreturn_frame(stack) else {
            return -1;
        };
        if (signum as usize) < NUM_SIGNALS {
            pcb.signal_status[signum as usize] = SignalStatus::Open;
        }

        *context = saved;
        context.eax as i32
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{with_table, BlockingCall};

    fn spawn_slot() -> process::Pid {
        with_table(|t| {
            let pid = t.get_open_pid();
            let pcb = t.pcb_mut(pid).unwrap();
            pcb.state = ProcessState::Running;
            pcb.blocking_call = BlockingCall::None;
            pid
        })
    }

    fn release(pid: process::Pid) {
        with_table(|t| t.release_slot(pid));
    }

    #[test]
    fn test_send_signal_marks_pending() {
        let pid = spawn_slot();

        send_signal(pid, Signal::Interrupt, 0).unwrap();
        with_table(|t| {
            let pcb = t.pcb(pid).unwrap();
            assert_eq!(
                pcb.signal_status[Signal::Interrupt as usize],
                SignalStatus::Pending
            );
        });

        // A second raise of the same signal is refused until delivery.
        assert_eq!(
            send_signal(pid, Signal::Interrupt, 0),
            Err(KernelError::WouldBlock)
        );

        release(pid);
    }

    #[test]
    fn test_send_signal_validates_pid() {
        assert!(send_signal(-1, Signal::Interrupt, 0).is_err());
        assert!(send_signal(9999, Signal::Interrupt, 0).is_err());
    }

    #[test]
    fn test_lowest_pending_signal_wins() {
        let pid = spawn_slot();

        with_table(|t| {
            let pcb = t.pcb_mut(pid).unwrap();
            pcb.signal_handlers[Signal::Segfault as usize] = Some(0x0804_9000);
            pcb.signal_handlers[Signal::Alarm as usize] = Some(0x0804_9004);
            pcb.signal_status[Signal::Alarm as usize] = SignalStatus::Pending;
            pcb.signal_status[Signal::Segfault as usize] = SignalStatus::Pending;
        });

        let action = with_table(|t| select_action(t, pid));
        match action {
            Action::Invoke {
                handler, signum, ..
            } => {
                assert_eq!(signum, Signal::Segfault as u32);
                assert_eq!(handler, 0x0804_9000);
            }
            _ => panic!("expected handler invocation"),
        }

        // The chosen signal is now mid-handling and blocks the other.
        with_table(|t| {
            let pcb = t.pcb(pid).unwrap();
            assert_eq!(
                pcb.signal_status[Signal::Segfault as usize],
                SignalStatus::Handling
            );
        });
        let action = with_table(|t| select_action(t, pid));
        assert!(matches!(action, Action::Nothing));

        release(pid);
    }

    #[test]
    fn test_default_actions() {
        let pid = spawn_slot();

        with_table(|t| {
            t.pcb_mut(pid).unwrap().signal_status[Signal::DivZero as usize] =
                SignalStatus::Pending;
        });
        assert!(matches!(
            with_table(|t| select_action(t, pid)),
            Action::DefaultHalt(256)
        ));

        with_table(|t| {
            let pcb = t.pcb_mut(pid).unwrap();
            pcb.signal_status[Signal::DivZero as usize] = SignalStatus::Open;
            pcb.signal_status[Signal::Interrupt as usize] = SignalStatus::Pending;
        });
        assert!(matches!(
            with_table(|t| select_action(t, pid)),
            Action::DefaultHalt(0)
        ));

        // Alarm with no handler is ignored and its slot reopens.
        with_table(|t| {
            let pcb = t.pcb_mut(pid).unwrap();
            pcb.signal_status[Signal::Interrupt as usize] = SignalStatus::Open;
            pcb.signal_status[Signal::Alarm as usize] = SignalStatus::Pending;
        });
        assert!(matches!(
            with_table(|t| select_action(t, pid)),
            Action::Nothing
        ));
        with_table(|t| {
            assert_eq!(
                t.pcb(pid).unwrap().signal_status[Signal::Alarm as usize],
                SignalStatus::Open
            );
        });

        release(pid);
    }

    #[test]
    fn test_alarm_only_offered_to_handlers() {
        let with_handler = spawn_slot();
        let without_handler = spawn_slot();

        with_table(|t| {
            t.pcb_mut(with_handler).unwrap().signal_handlers[Signal::Alarm as usize] =
                Some(0x0804_9000);
        });

        alarm_callback(0.0);

        with_table(|t| {
            assert_eq!(
                t.pcb(with_handler).unwrap().signal_status[Signal::Alarm as usize],
                SignalStatus::Pending
            );
            assert_eq!(
                t.pcb(without_handler).unwrap().signal_status[Signal::Alarm as usize],
                SignalStatus::Open
            );
        });

        release(with_handler);
        release(without_handler);
    }
}
