//! Process Control Block.

use alloc::{boxed::Box, vec::Vec};

use crate::{
    mm::PageMapping,
    signal::{SignalStatus, NUM_SIGNALS},
};

use super::MAX_ARGS_LEN;

/// Process identifier. Negative values mark an unused PCB slot.
pub type Pid = i32;

/// Sentinel stored in `pid` while a slot is free.
pub const PID_UNUSED: Pid = -1;

/// Scheduling state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Eligible for scheduling.
    Running,
    /// Blocked on the call recorded in `blocking_call`.
    Sleeping,
    /// Exited; resources reclaimed by the scheduler on its next pass.
    Stopping,
}

/// Bytes of a received datagram parked in the reader's PCB.
pub const UDP_RX_BUF_SIZE: usize = 3000;

/// Kernel-side buffer a blocked UDP reader waits on.
pub struct ReceivedUdpPacket {
    pub length: usize,
    pub data: [u8; UDP_RX_BUF_SIZE],
}

impl ReceivedUdpPacket {
    pub fn empty() -> Box<Self> {
        Box::new(Self {
            length: 0,
            data: [0; UDP_RX_BUF_SIZE],
        })
    }
}

/// What a sleeping process is waiting on.
///
/// A blocking call returns only after exactly one wake event of the
/// matching kind.
pub enum BlockingCall {
    None,
    /// Waiting for a newline in the owning TTY's line buffer.
    TerminalRead,
    /// Waiting for a datagram; the buffer is filled by the receive path.
    UdpRead(Option<Box<ReceivedUdpPacket>>),
    /// Waiting in `execute` for the child's halt status.
    ProcessExec { child_status: u16 },
}

/// Polymorphic file operations, selected at `open` time from the
/// filesystem's filetype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Terminal input; read-only.
    Stdin,
    /// Terminal output; write-only.
    Stdout,
    /// The RTC device file.
    Rtc,
    /// The directory; reads enumerate dentry names.
    Directory,
    /// A regular data file with its backing inode.
    Regular { inode: u32 },
    /// A UDP socket endpoint.
    UdpSocket,
}

/// One slot of a process's file descriptor table.
#[derive(Debug, Clone, Copy)]
pub struct FileEntry {
    pub in_use: bool,
    pub kind: FileKind,
    /// Read position for data files; enumeration index for directories.
    pub file_pos: u32,
}

impl FileEntry {
    pub fn new(kind: FileKind) -> Self {
        Self {
            in_use: true,
            kind,
            file_pos: 0,
        }
    }
}

/// Saved kernel-side execution context for the cooperative half of a
/// context switch. The field order is fixed: the switch assembly stores
/// ESP, EBP, and the resume EIP at offsets 0, 4 and 8.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelContext {
    pub esp: u32,
    pub ebp: u32,
    pub eip: u32,
}

/// Per-process record.
pub struct Pcb {
    /// PID, or [`PID_UNUSED`] while the slot is free.
    pub pid: Pid,
    /// Parent PID; negative for a root-of-tree shell.
    pub parent_pid: Pid,
    pub state: ProcessState,
    /// Owning TTY, 1-based.
    pub tty: u8,
    /// Null-terminated argument string.
    pub args: [u8; MAX_ARGS_LEN],
    /// File descriptor table; indices 0/1 are stdin/stdout and always
    /// in use.
    pub files: Vec<FileEntry>,
    /// Every 4 MiB region owned by this process. Always contains at least
    /// the executable image region; `virt_index` values are pairwise
    /// distinct.
    pub large_page_mappings: Vec<PageMapping>,
    /// Top (highest address) of the process's 8 KiB-aligned kernel stack.
    /// The PID is stored in the word just below. Zero while unallocated.
    pub kernel_stack_base: usize,
    /// User virtual address where video memory is mapped, if `vidmap` ran.
    pub vid_mem: Option<u32>,
    /// Saved ESP/EBP/EIP for resuming this process in kernel mode.
    pub context: KernelContext,
    /// Installed user handlers; `None` selects the default action.
    pub signal_handlers: [Option<u32>; NUM_SIGNALS],
    pub signal_status: [SignalStatus; NUM_SIGNALS],
    pub signal_data: [u32; NUM_SIGNALS],
    pub blocking_call: BlockingCall,
}

impl Pcb {
    /// An unused slot.
    pub fn unused() -> Self {
        Self {
            pid: PID_UNUSED,
            parent_pid: PID_UNUSED,
            state: ProcessState::Running,
            tty: 1,
            args: [0; MAX_ARGS_LEN],
            files: Vec::new(),
            large_page_mappings: Vec::new(),
            kernel_stack_base: 0,
            vid_mem: None,
            context: KernelContext::default(),
            signal_handlers: [None; NUM_SIGNALS],
            signal_status: [SignalStatus::Open; NUM_SIGNALS],
            signal_data: [0; NUM_SIGNALS],
            blocking_call: BlockingCall::None,
        }
    }

    /// Whether this slot holds a live process.
    pub fn in_use(&self) -> bool {
        self.pid >= 0
    }

    /// Copy the argument string (with its terminator) into `args`,
    /// clearing the remainder.
    pub fn set_args(&mut self, args: &[u8]) {
        self.args = [0; MAX_ARGS_LEN];
        let len = args.len().min(MAX_ARGS_LEN - 1);
        self.args[..len].copy_from_slice(&args[..len]);
    }

    /// Argument bytes up to the terminator.
    pub fn args_bytes(&self) -> &[u8] {
        let len = self
            .args
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_ARGS_LEN);
        &self.args[..len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unused_slot_is_not_in_use() {
        let pcb = Pcb::unused();
        assert!(!pcb.in_use());
        assert_eq!(pcb.pid, PID_UNUSED);
    }

    #[test]
    fn test_args_roundtrip() {
        let mut pcb = Pcb::unused();
        pcb.set_args(b"42");
        assert_eq!(pcb.args_bytes(), b"42");
        assert_eq!(pcb.args[2], 0);
    }

    #[test]
    fn test_args_truncated_to_buffer() {
        let mut pcb = Pcb::unused();
        let long = [b'x'; 300];
        pcb.set_args(&long);
        assert_eq!(pcb.args_bytes().len(), MAX_ARGS_LEN - 1);
        assert_eq!(pcb.args[MAX_ARGS_LEN - 1], 0);
    }
}
