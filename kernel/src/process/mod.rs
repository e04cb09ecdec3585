//! Process management.
//!
//! Every user process owns a PCB slot in the global table, one 4 MiB image
//! frame mapped at a fixed user virtual address, and an 8 KiB kernel stack
//! whose top word stores the owning PID so the current process is always
//! recoverable from ESP.

pub mod lifecycle;
pub mod pcb;
pub mod table;
pub mod validate;

pub use lifecycle::{process_execute, process_halt, process_sleep, process_wake};
pub use pcb::{
    BlockingCall, FileEntry, FileKind, KernelContext, Pcb, Pid, ProcessState, PID_UNUSED,
};
pub use table::{current_pid, with_table, ProcessTable};

/// Magic number in the first 4 bytes of every executable (0x7F 'E' 'L' 'F').
pub const ELF_MAGIC: u32 = 0x464C_457F;

/// User virtual address of the 4 MiB page holding a process image.
pub const EXECUTABLE_VIRT_ADDR: u32 = 0x0800_0000;

/// Offset within the page where the image's byte 0 lands.
pub const EXECUTABLE_PAGE_OFFSET: u32 = 0x48000;

/// Byte offset of the little-endian entrypoint address in the header.
pub const ENTRYPOINT_OFFSET: usize = 24;

/// Maximum length of a process argument string, including the NUL.
pub const MAX_ARGS_LEN: usize = 128;

/// Cap on open files per process; exists only to bound kernel memory
/// spent on userspace.
pub const MAX_NUM_FILES: usize = 8;

/// File descriptors reserved for the terminal.
pub const FD_STDIN: usize = 0;
pub const FD_STDOUT: usize = 1;
