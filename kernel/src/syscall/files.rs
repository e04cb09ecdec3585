//! File descriptor operations.
//!
//! The fd table is a dense, resizable sequence per process. `open`
//! consults the filesystem collaborator, branches on the filetype and
//! installs the matching operation set; `close` marks the slot unused and
//! trims trailing unused slots so surviving descriptors keep their
//! indices.

use crate::{
    fs::{self, FileType},
    net,
    process::{self, current_pid, FileEntry, FileKind, FD_STDIN, FD_STDOUT, MAX_NUM_FILES},
    tty::terminal,
};

/// Name of the UDP socket device file.
const UDP_DEVICE_NAME: &[u8] = b"udp";

/// The RTC device: a global frequency divider shared by its openers.
pub mod rtc {
    use core::sync::atomic::{AtomicU32, Ordering};

    /// Default frequency installed by `open`, in Hz.
    const DEFAULT_FREQ: u32 = 2;
    /// Highest programmable frequency, in Hz.
    const MAX_FREQ: u32 = 1024;

    static FREQ: AtomicU32 = AtomicU32::new(DEFAULT_FREQ);

    /// Reset the device to 2 Hz.
    pub fn open() {
        FREQ.store(DEFAULT_FREQ, Ordering::Relaxed);
    }

    /// Program a new frequency; must be a power of two up to 1024 Hz.
    pub fn write(freq: u32) -> i32 {
        if freq < 2 || freq > MAX_FREQ || !freq.is_power_of_two() {
            return -1;
        }
        FREQ.store(freq, Ordering::Relaxed);
        0
    }

    /// Block until the next tick at the programmed frequency.
    pub fn read() -> i32 {
        let period = 1.0 / FREQ.load(Ordering::Relaxed) as f64;
        let target = crate::timer::system_time() + period;
        while crate::timer::system_time() < target {
            core::hint::spin_loop();
        }
        0
    }

    pub fn current_freq() -> u32 {
        FREQ.load(Ordering::Relaxed)
    }
}

/// Open `name` for the current process. Returns the new fd (always >= 2)
/// or -1.
pub fn sys_open(name: &[u8]) -> i32 {
    // The UDP socket is a device, not a filesystem object.
    if name == UDP_DEVICE_NAME {
        return install_entry(FileKind::UdpSocket);
    }

    let Ok(filesystem) = fs::filesystem() else {
        return -1;
    };
    let Ok(dentry) = filesystem.read_dentry_by_name(name) else {
        return -1;
    };

    let kind = match dentry.filetype {
        FileType::Rtc => {
            rtc::open();
            FileKind::Rtc
        }
        FileType::Directory => FileKind::Directory,
        FileType::Regular => FileKind::Regular {
            inode: dentry.inode,
        },
    };

    install_entry(kind)
}

fn install_entry(kind: FileKind) -> i32 {
    process::with_table(|t| {
        let Some(pcb) = t.pcb_mut(current_pid()) else {
            return -1;
        };
        if pcb.files.len() >= MAX_NUM_FILES {
            return -1;
        }
        pcb.files.push(FileEntry::new(kind));
        (pcb.files.len() - 1) as i32
    })
}

/// Close `fd` for the current process. Refuses stdin/stdout.
pub fn sys_close(fd: i32) -> i32 {
    if fd == FD_STDIN as i32 || fd == FD_STDOUT as i32 || fd < 0 {
        return -1;
    }

    let closed = process::with_table(|t| {
        let Some(pcb) = t.pcb_mut(current_pid()) else {
            return None;
        };
        let entry = pcb.files.get_mut(fd as usize).filter(|e| e.in_use)?;
        entry.in_use = false;
        let kind = entry.kind;

        // Trim trailing unused slots; interior indices must not move.
        while let Some(last) = pcb.files.last() {
            if last.in_use {
                break;
            }
            pcb.files.pop();
        }

        Some((kind, pcb.tty))
    });

    match closed {
        Some((kind, tty)) => {
            close_hook(kind, tty);
            0
        }
        None => -1,
    }
}

/// Per-kind close side effects; also used when a process is torn down.
pub fn close_hook(kind: FileKind, tty: u8) {
    match kind {
        FileKind::Rtc => rtc::open(),
        FileKind::Stdin => {
            // Clearing the line buffer matches terminal_close.
            terminal::with_line_buffers(|lb| lb.clear(tty));
        }
        _ => {}
    }
}

/// Read from `fd` into `buf`. Returns bytes read, 0 at EOF, -1 on error.
pub fn sys_read(fd: i32, buf: &mut [u8]) -> i32 {
    if fd == FD_STDOUT as i32 {
        return -1;
    }

    let Some(entry) = lookup(fd) else {
        return -1;
    };

    match entry.kind {
        FileKind::Stdin => terminal::terminal_read(buf),
        FileKind::Stdout => -1,
        FileKind::Rtc => rtc::read(),
        FileKind::Regular { inode } => {
            let n = fs::fs_read(inode, entry.file_pos, buf);
            if n > 0 {
                advance_file_pos(fd, n as u32);
            }
            n
        }
        FileKind::Directory => read_dentry_name(fd, entry.file_pos, buf),
        FileKind::UdpSocket => net::udp::udp_read(buf),
    }
}

/// Write `buf` to `fd`. Returns bytes written or -1.
pub fn sys_write(fd: i32, buf: &[u8]) -> i32 {
    if fd == FD_STDIN as i32 {
        return -1;
    }

    let Some(entry) = lookup(fd) else {
        return -1;
    };

    match entry.kind {
        FileKind::Stdout => terminal::terminal_write(buf),
        FileKind::Stdin => -1,
        FileKind::Rtc => {
            if buf.len() < 4 {
                return -1;
            }
            rtc::write(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
        }
        // The filesystem is read-only.
        FileKind::Regular { .. } | FileKind::Directory => -1,
        FileKind::UdpSocket => net::udp::udp_write(buf),
    }
}

/// Copy one dentry name per call; returns its length, 0 when the
/// directory is exhausted.
fn read_dentry_name(fd: i32, index: u32, buf: &mut [u8]) -> i32 {
    let Ok(filesystem) = fs::filesystem() else {
        return -1;
    };
    let Ok(dentry) = filesystem.read_dentry_by_index(index) else {
        return 0;
    };

    let name = dentry.name_bytes();
    let n = name.len().min(buf.len());
    buf[..n].copy_from_slice(&name[..n]);
    advance_file_pos(fd, 1);
    n as i32
}

fn lookup(fd: i32) -> Option<FileEntry> {
    if fd < 0 {
        return None;
    }
    process::with_table(|t| {
        t.pcb(current_pid())?
            .files
            .get(fd as usize)
            .filter(|e| e.in_use)
            .copied()
    })
}

fn advance_file_pos(fd: i32, by: u32) {
    process::with_table(|t| {
        if let Some(pcb) = t.pcb_mut(current_pid()) {
            if let Some(entry) = pcb.files.get_mut(fd as usize) {
                entry.file_pos += by;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{table::with_current_pid, with_table, Pid};

    fn spawn_with_stdio() -> Pid {
        with_table(|t| {
            let pid = t.get_open_pid();
            let pcb = t.pcb_mut(pid).unwrap();
            pcb.files = alloc::vec![
                FileEntry::new(FileKind::Stdin),
                FileEntry::new(FileKind::Stdout),
            ];
            pid
        })
    }

    fn release(pid: Pid) {
        with_table(|t| t.release_slot(pid));
    }

    #[test]
    fn test_open_regular_file_and_read() {
        crate::fs::fixture::install_fixture();
        let pid = spawn_with_stdio();

        with_current_pid(pid, || {
            let fd = sys_open(b"frame0.txt");
            assert!(fd >= 2);

            let mut buf = [0u8; 9];
            assert_eq!(sys_read(fd, &mut buf), 9);
            assert_eq!(&buf, b"the quick");

            // The file position advanced.
            let mut rest = [0u8; 32];
            let n = sys_read(fd, &mut rest);
            assert_eq!(&rest[..n as usize], b" brown fox");

            // EOF is 0, not an error.
            assert_eq!(sys_read(fd, &mut rest), 0);

            assert_eq!(sys_close(fd), 0);
            // A closed fd no longer reads or writes.
            assert_eq!(sys_read(fd, &mut buf), -1);
            assert_eq!(sys_write(fd, &buf), -1);
        });

        release(pid);
    }

    #[test]
    fn test_open_missing_file_fails() {
        crate::fs::fixture::install_fixture();
        let pid = spawn_with_stdio();
        with_current_pid(pid, || {
            assert_eq!(sys_open(b"no_such_file"), -1);
        });
        release(pid);
    }

    #[test]
    fn test_stdin_stdout_protection() {
        let pid = spawn_with_stdio();
        with_current_pid(pid, || {
            // stdin is read-only, stdout write-only, neither closes.
            let mut buf = [0u8; 4];
            assert_eq!(sys_write(0, &buf), -1);
            assert_eq!(sys_read(1, &mut buf), -1);
            assert_eq!(sys_close(0), -1);
            assert_eq!(sys_close(1), -1);
        });
        release(pid);
    }

    #[test]
    fn test_close_preserves_interior_indices() {
        crate::fs::fixture::install_fixture();
        let pid = spawn_with_stdio();

        with_current_pid(pid, || {
            let a = sys_open(b"frame0.txt");
            let b = sys_open(b"frame0.txt");
            let c = sys_open(b"frame0.txt");
            assert_eq!((a, b, c), (2, 3, 4));

            // Closing an interior fd leaves later fds valid.
            assert_eq!(sys_close(b), 0);
            let mut buf = [0u8; 3];
            assert_eq!(sys_read(c, &mut buf), 3);

            // Closing the tail trims trailing unused slots, so the next
            // open reuses index 3.
            assert_eq!(sys_close(c), 0);
            let d = sys_open(b"frame0.txt");
            assert_eq!(d, 3);

            sys_close(d);
            sys_close(a);
        });

        release(pid);
    }

    #[test]
    fn test_fd_table_capacity() {
        crate::fs::fixture::install_fixture();
        let pid = spawn_with_stdio();

        with_current_pid(pid, || {
            let mut fds = alloc::vec::Vec::new();
            for _ in 0..MAX_NUM_FILES - 2 {
                let fd = sys_open(b"frame0.txt");
                assert!(fd >= 2);
                fds.push(fd);
            }
            assert_eq!(sys_open(b"frame0.txt"), -1);
            for fd in fds {
                sys_close(fd);
            }
        });

        release(pid);
    }

    #[test]
    fn test_directory_enumeration() {
        crate::fs::fixture::install_fixture();
        let pid = spawn_with_stdio();

        with_current_pid(pid, || {
            let fd = sys_open(b".");
            assert!(fd >= 2);

            let mut names = alloc::vec::Vec::new();
            loop {
                let mut buf = [0u8; 32];
                let n = sys_read(fd, &mut buf);
                if n == 0 {
                    break;
                }
                names.push(buf[..n as usize].to_vec());
            }
            assert!(names.iter().any(|n| n == b"shell"));
            sys_close(fd);
        });

        release(pid);
    }

    #[test]
    fn test_rtc_write_validation() {
        rtc::open();
        assert_eq!(rtc::write(64), 0);
        assert_eq!(rtc::current_freq(), 64);
        assert_eq!(rtc::write(3), -1);
        assert_eq!(rtc::write(2048), -1);
        assert_eq!(rtc::write(0), -1);
        rtc::open();
        assert_eq!(rtc::current_freq(), 2);
    }

    #[test]
    fn test_udp_device_opens() {
        let pid = spawn_with_stdio();
        with_current_pid(pid, || {
            let fd = sys_open(b"udp");
            assert!(fd >= 2);
            with_table(|t| {
                let pcb = t.pcb(pid).unwrap();
                assert_eq!(pcb.files[fd as usize].kind, FileKind::UdpSocket);
            });
            sys_close(fd);
        });
        release(pid);
    }
}
