//! The module sources: byte-level [`ElfObject`]s and the name-level
//! [`ModuleProvider`] capability that hands them out.

use crate::Result;
use alloc::boxed::Box;
use alloc::ffi::CString;
use core::ffi::CStr;

/// An ELF object the loader can read from.
pub trait ElfObject {
    /// Returns the name the object was opened under.
    fn file_name(&self) -> &CStr;
    /// Read `buf.len()` bytes starting at `offset`.
    fn read(&mut self, buf: &mut [u8], offset: usize) -> Result<()>;
    /// The raw file descriptor, when the object is file backed. Mapping
    /// goes through the descriptor when one exists and falls back to
    /// anonymous-map-and-copy otherwise.
    fn as_fd(&self) -> Option<i32>;
}

/// The capability that resolves module names to ELF objects.
///
/// `open` fails with [`crate::Error::NotFound`] when the name is unknown
/// and [`crate::Error::SystemError`] for anything else; `dlopen` maps the
/// former onto its root/dependency error surface.
pub trait ModuleProvider: Send + Sync {
    /// Open the module with the given name.
    fn open(&self, name: &str) -> Result<Box<dyn ElfObject>>;
}

/// An ELF object held entirely in memory.
pub struct ElfBinary {
    name: CString,
    bytes: Box<[u8]>,
}

impl ElfBinary {
    pub fn new(name: &str, bytes: impl Into<Box<[u8]>>) -> Self {
        ElfBinary {
            name: CString::new(name).unwrap(),
            bytes: bytes.into(),
        }
    }
}

impl ElfObject for ElfBinary {
    fn file_name(&self) -> &CStr {
        &self.name
    }

    fn read(&mut self, buf: &mut [u8], offset: usize) -> Result<()> {
        let end = offset + buf.len();
        if end > self.bytes.len() {
            return Err(crate::error::system_error(0, "read past end of object"));
        }
        buf.copy_from_slice(&self.bytes[offset..end]);
        Ok(())
    }

    fn as_fd(&self) -> Option<i32> {
        None
    }
}

#[cfg(all(feature = "std", unix))]
pub use fs::{DirProvider, ElfFile};

#[cfg(all(feature = "std", unix))]
mod fs {
    use super::{ElfObject, ModuleProvider};
    use crate::Result;
    use alloc::boxed::Box;
    use alloc::ffi::CString;
    use alloc::string::String;
    use alloc::vec::Vec;
    use core::ffi::CStr;
    use core::str::FromStr;
    use libc::{O_CLOEXEC, O_RDONLY, SEEK_SET};

    /// An ELF object backed by an open file descriptor.
    pub struct ElfFile {
        name: CString,
        fd: i32,
    }

    impl ElfFile {
        pub fn from_path(path: &str) -> Result<Self> {
            let name = CString::from_str(path).unwrap();
            let fd = unsafe { libc::open(name.as_ptr(), O_RDONLY | O_CLOEXEC) };
            if fd == -1 {
                return Err(crate::error::not_found(path));
            }
            Ok(ElfFile { name, fd })
        }
    }

    impl Drop for ElfFile {
        fn drop(&mut self) {
            unsafe { libc::close(self.fd) };
        }
    }

    fn lseek(fd: i32, offset: usize) -> Result<()> {
        let off = unsafe { libc::lseek(fd, offset as _, SEEK_SET) };
        if off == -1 || off as usize != offset {
            return Err(crate::error::system_error(0, "lseek failed"));
        }
        Ok(())
    }

    fn read_exact(fd: i32, mut bytes: &mut [u8]) -> Result<()> {
        while !bytes.is_empty() {
            let ptr = bytes.as_mut_ptr() as *mut libc::c_void;
            let result = unsafe { libc::read(fd, ptr, bytes.len()) };
            if result < 0 {
                return Err(crate::error::system_error(0, "read error"));
            } else if result == 0 {
                return Err(crate::error::system_error(0, "failed to fill buffer"));
            }
            bytes = &mut bytes[result as usize..];
        }
        Ok(())
    }

    impl ElfObject for ElfFile {
        fn file_name(&self) -> &CStr {
            &self.name
        }

        fn read(&mut self, buf: &mut [u8], offset: usize) -> Result<()> {
            lseek(self.fd, offset)?;
            read_exact(self.fd, buf)
        }

        fn as_fd(&self) -> Option<i32> {
            Some(self.fd)
        }
    }

    /// A provider that searches a fixed list of directories.
    ///
    /// Absolute names are opened directly; bare names are tried against
    /// each search directory in order.
    pub struct DirProvider {
        search: Vec<String>,
    }

    impl DirProvider {
        pub fn new(search: impl IntoIterator<Item = String>) -> Self {
            DirProvider {
                search: search.into_iter().collect(),
            }
        }
    }

    impl ModuleProvider for DirProvider {
        fn open(&self, name: &str) -> Result<Box<dyn ElfObject>> {
            if name.contains('/') {
                return Ok(Box::new(ElfFile::from_path(name)?));
            }
            for dir in &self.search {
                let mut path = dir.clone();
                if !path.ends_with('/') {
                    path.push('/');
                }
                path.push_str(name);
                log::trace!("trying shared object candidate: [{}]", path);
                if let Ok(file) = ElfFile::from_path(&path) {
                    return Ok(Box::new(file));
                }
            }
            Err(crate::error::not_found(name))
        }
    }
}
