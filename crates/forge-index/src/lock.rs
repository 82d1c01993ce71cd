//! Byte-range file locks shared between processes.
//!
//! A lock covers `[start, EOF)` and is released when the guard drops.
//! Contention is retried until the lock is acquired.
//!
//! On Linux open-file-description locks are used, so two handles on the
//! same file exclude each other even inside one process. Other unix
//! targets fall back to classic per-process record locks.

use std::fs::File;
use std::io;

/// Held range lock. Unlocks on drop.
pub(crate) struct RangeLock<'a> {
    #[cfg_attr(not(unix), allow(dead_code))]
    file: &'a File,
    #[cfg_attr(not(unix), allow(dead_code))]
    start: u64,
}

#[cfg(unix)]
mod imp {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;
    use std::thread;
    use std::time::Duration;

    use nix::errno::Errno;
    use nix::fcntl::{fcntl, FcntlArg};
    use nix::libc;

    fn range(start: u64, kind: libc::c_int) -> libc::flock {
        // SAFETY: `flock` is a plain C struct for which all-zero is a valid value.
        let mut lock: libc::flock = unsafe { std::mem::zeroed() };
        lock.l_type = kind as _;
        lock.l_whence = libc::SEEK_SET as _;
        lock.l_start = start as libc::off_t;
        // Zero length extends the lock to EOF, including future appends.
        lock.l_len = 0;
        lock
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn set_lock(file: &File, request: &libc::flock) -> nix::Result<libc::c_int> {
        fcntl(file.as_raw_fd(), FcntlArg::F_OFD_SETLK(request))
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn set_lock(file: &File, request: &libc::flock) -> nix::Result<libc::c_int> {
        fcntl(file.as_raw_fd(), FcntlArg::F_SETLK(request))
    }

    pub(super) fn lock(file: &File, start: u64, exclusive: bool) -> io::Result<()> {
        let kind = if exclusive { libc::F_WRLCK } else { libc::F_RDLCK };
        let request = range(start, kind as libc::c_int);
        loop {
            match set_lock(file, &request) {
                Ok(_) => return Ok(()),
                Err(Errno::EAGAIN) | Err(Errno::EACCES) | Err(Errno::EINTR) => {
                    thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(io::Error::from(e)),
            }
        }
    }

    pub(super) fn unlock(file: &File, start: u64) -> io::Result<()> {
        let request = range(start, libc::F_UNLCK as libc::c_int);
        set_lock(file, &request)
            .map(|_| ())
            .map_err(io::Error::from)
    }
}

#[cfg(not(unix))]
mod imp {
    use std::fs::File;
    use std::io;

    pub(super) fn lock(_file: &File, _start: u64, _exclusive: bool) -> io::Result<()> {
        Ok(())
    }

    pub(super) fn unlock(_file: &File, _start: u64) -> io::Result<()> {
        Ok(())
    }
}

/// Lock `[start, EOF)`, blocking (by retrying) until it is available.
pub(crate) fn lock_range(file: &File, start: u64, exclusive: bool) -> io::Result<RangeLock<'_>> {
    imp::lock(file, start, exclusive)?;
    Ok(RangeLock { file, start })
}

impl Drop for RangeLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = imp::unlock(self.file, self.start) {
            tracing::warn!(start = self.start, error = %e, "failed to release index range lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_and_relock_same_range() {
        let dir = tempfile::tempdir().unwrap();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(dir.path().join("locked"))
            .unwrap();

        {
            let _guard = lock_range(&file, 0, true).unwrap();
        }
        let _shared = lock_range(&file, 0, false).unwrap();
    }
}
