//! Read-only filesystem collaborator.
//!
//! The on-disk image reader is an external component; the kernel consumes
//! it through the [`Filesystem`] trait and the dentry/inode types below.
//! A concrete reader is installed once at boot.
//!
//! Note the deliberate asymmetry: [`fs_read`] treats a 0 return as a valid
//! end-of-file, while [`load_image`] treats a read of `<= 0` bytes as a
//! failed load.

use spin::Once;

use crate::error::{KernelError, KernelResult};

/// Maximum filename length; names inside the image tables are not
/// necessarily null-terminated.
pub const MAX_FILENAME_LEN: usize = 32;

/// File types exported by the image reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// The RTC device file.
    Rtc,
    /// The (single, flat) directory.
    Directory,
    /// A regular data file.
    Regular,
}

/// Directory entry: `{name, filetype, inode}`.
#[derive(Debug, Clone, Copy)]
pub struct Dentry {
    pub name: [u8; MAX_FILENAME_LEN],
    pub filetype: FileType,
    pub inode: u32,
}

impl Dentry {
    /// The name as a byte slice, trimmed at the first NUL if any.
    pub fn name_bytes(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_FILENAME_LEN);
        &self.name[..len]
    }
}

/// Contract for the read-only filesystem image reader.
pub trait Filesystem: Send + Sync {
    /// Look up a dentry by name (up to 32 bytes, compared without
    /// requiring a terminator).
    fn read_dentry_by_name(&self, name: &[u8]) -> KernelResult<Dentry>;

    /// Look up the n-th dentry; used to enumerate the directory.
    fn read_dentry_by_index(&self, index: u32) -> KernelResult<Dentry>;

    /// Copy up to `buf.len()` bytes of the file starting at `offset`.
    /// Returns the number of bytes read (0 at or past EOF) or -1 on an
    /// I/O failure.
    fn read_data(&self, inode: u32, offset: u32, buf: &mut [u8]) -> i32;

    /// Total length of the file in bytes.
    fn file_size(&self, inode: u32) -> KernelResult<u32>;
}

static FILESYSTEM: Once<&'static dyn Filesystem> = Once::new();

/// Install the image reader. Called once at boot; later calls are ignored.
pub fn install(fs: &'static dyn Filesystem) {
    FILESYSTEM.call_once(|| fs);
}

/// The installed reader.
pub fn filesystem() -> KernelResult<&'static dyn Filesystem> {
    FILESYSTEM
        .get()
        .copied()
        .ok_or(KernelError::NotInitialized { subsystem: "fs" })
}

/// Read file data for the `read` syscall path. 0 means EOF and is valid.
pub fn fs_read(inode: u32, offset: u32, buf: &mut [u8]) -> i32 {
    match filesystem() {
        Ok(fs) => fs.read_data(inode, offset, buf),
        Err(_) => -1,
    }
}

/// Load an entire executable image into `dest`.
///
/// Fails when the file does not exist, does not fit, or when the read
/// returns `<= 0` bytes.
pub fn load_image(name: &[u8], dest: &mut [u8]) -> KernelResult<u32> {
    let fs = filesystem()?;
    let dentry = fs.read_dentry_by_name(name)?;

    let size = fs.file_size(dentry.inode)?;
    if size as usize > dest.len() {
        return Err(KernelError::InvalidArgument {
            name: "image",
            value: "too_large",
        });
    }

    let read = fs.read_data(dentry.inode, 0, &mut dest[..size as usize]);
    if read <= 0 {
        return Err(KernelError::NotFound {
            resource: "image data",
            id: dentry.inode,
        });
    }

    Ok(read as u32)
}

/// In-memory image used by unit tests across the crate.
#[cfg(test)]
pub mod fixture {
    use alloc::{collections::BTreeMap, vec::Vec};

    use super::*;
    use crate::process::{ELF_MAGIC, ENTRYPOINT_OFFSET, EXECUTABLE_VIRT_ADDR};

    pub struct FixtureFs {
        dentries: Vec<Dentry>,
        data: BTreeMap<u32, Vec<u8>>,
    }

    impl FixtureFs {
        fn dentry(name: &str, filetype: FileType, inode: u32) -> Dentry {
            let mut buf = [0u8; MAX_FILENAME_LEN];
            buf[..name.len()].copy_from_slice(name.as_bytes());
            Dentry {
                name: buf,
                filetype,
                inode,
            }
        }
    }

    impl Filesystem for FixtureFs {
        fn read_dentry_by_name(&self, name: &[u8]) -> KernelResult<Dentry> {
            let trimmed = &name[..name
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(name.len().min(MAX_FILENAME_LEN))];
            self.dentries
                .iter()
                .find(|d| d.name_bytes() == trimmed)
                .copied()
                .ok_or(KernelError::NotFound {
                    resource: "dentry",
                    id: 0,
                })
        }

        fn read_dentry_by_index(&self, index: u32) -> KernelResult<Dentry> {
            self.dentries
                .get(index as usize)
                .copied()
                .ok_or(KernelError::NotFound {
                    resource: "dentry",
                    id: index,
                })
        }

        fn read_data(&self, inode: u32, offset: u32, buf: &mut [u8]) -> i32 {
            match self.data.get(&inode) {
                Some(data) => {
                    if offset as usize >= data.len() {
                        return 0;
                    }
                    let avail = data.len() - offset as usize;
                    let n = avail.min(buf.len());
                    buf[..n].copy_from_slice(&data[offset as usize..offset as usize + n]);
                    n as i32
                }
                None => -1,
            }
        }

        fn file_size(&self, inode: u32) -> KernelResult<u32> {
            self.data
                .get(&inode)
                .map(|d| d.len() as u32)
                .ok_or(KernelError::NotFound {
                    resource: "inode",
                    id: inode,
                })
        }
    }

    /// A minimal valid executable image: ELF magic plus an entrypoint
    /// inside the user page at byte offset 24.
    pub fn executable_image() -> Vec<u8> {
        let mut image = alloc::vec![0u8; 64];
        image[..4].copy_from_slice(&ELF_MAGIC.to_le_bytes());
        let entry: u32 = EXECUTABLE_VIRT_ADDR + 0x100;
        image[ENTRYPOINT_OFFSET..ENTRYPOINT_OFFSET + 4].copy_from_slice(&entry.to_le_bytes());
        image
    }

    static FIXTURE: spin::Once<FixtureFs> = spin::Once::new();

    /// Install the shared test image; idempotent.
    pub fn install_fixture() -> &'static FixtureFs {
        let fs = FIXTURE.call_once(|| {
            let mut data = BTreeMap::new();
            data.insert(1, executable_image()); // shell
            data.insert(2, executable_image()); // child
            data.insert(3, b"the quick brown fox".to_vec()); // frame0.txt
            FixtureFs {
                dentries: alloc::vec![
                    FixtureFs::dentry(".", FileType::Directory, 0),
                    FixtureFs::dentry("shell", FileType::Regular, 1),
                    FixtureFs::dentry("child", FileType::Regular, 2),
                    FixtureFs::dentry("frame0.txt", FileType::Regular, 3),
                    FixtureFs::dentry("rtc", FileType::Rtc, 0),
                ],
                data,
            }
        });
        super::install(fs);
        fs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_and_read() {
        let fs = fixture::install_fixture();

        let dentry = fs.read_dentry_by_name(b"frame0.txt").unwrap();
        assert_eq!(dentry.filetype, FileType::Regular);

        let mut buf = [0u8; 9];
        assert_eq!(fs.read_data(dentry.inode, 0, &mut buf), 9);
        assert_eq!(&buf, b"the quick");

        // Reads advance with the offset; 0 at EOF is valid, not an error.
        assert_eq!(fs.read_data(dentry.inode, 1000, &mut buf), 0);
    }

    #[test]
    fn test_missing_file() {
        fixture::install_fixture();
        assert!(filesystem()
            .unwrap()
            .read_dentry_by_name(b"no_such_file")
            .is_err());
    }

    #[test]
    fn test_load_image_validates() {
        fixture::install_fixture();

        let mut dest = alloc::vec![0u8; 4096];
        let loaded = load_image(b"shell", &mut dest).unwrap();
        assert!(loaded > 0);
        assert_eq!(
            &dest[..4],
            &crate::process::ELF_MAGIC.to_le_bytes(),
            "magic bytes land at offset zero"
        );

        assert!(load_image(b"no_such_file", &mut dest).is_err());
    }

    #[test]
    fn test_dentry_enumeration() {
        let fs = fixture::install_fixture();
        let mut names = alloc::vec::Vec::new();
        let mut index = 0;
        while let Ok(dentry) = fs.read_dentry_by_index(index) {
            names.push(dentry.name_bytes().to_vec());
            index += 1;
        }
        assert!(names.iter().any(|n| n == b"shell"));
        assert!(names.iter().any(|n| n == b"rtc"));
    }
}
