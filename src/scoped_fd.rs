use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::unistd;
use nix::NixPath;
use std::os::unix::io::RawFd;

use crate::error::Result;

/// An owned file descriptor, closed on drop. Used for the sysfs/proc reads
/// scattered through device and topology discovery so a `?` out of any of
/// those functions can't leak an fd.
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    pub fn from_raw(fd: RawFd) -> Self {
        ScopedFd { fd }
    }

    pub fn open<P: ?Sized + NixPath>(path: &P, oflag: OFlag, mode: Mode) -> Result<Self> {
        let fd = fcntl::open(path, oflag, mode)?;
        Ok(ScopedFd { fd })
    }

    pub fn open_read<P: ?Sized + NixPath>(path: &P) -> Result<Self> {
        Self::open(path, OFlag::O_RDONLY, Mode::empty())
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }

    /// Reads the whole file into a `String`, trimming trailing whitespace.
    /// Sysfs attribute files are small (a few dozen bytes) so one read is
    /// enough in practice; loop defensively in case the kernel splits it.
    pub fn read_to_string(&self) -> Result<String> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            let n = unistd::read(self.fd, &mut chunk)?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let s = String::from_utf8_lossy(&buf).trim().to_string();
        Ok(s)
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        if self.fd >= 0 {
            let _ = unistd::close(self.fd);
        }
    }
}
