//! select(2) backend.
//!
//! The three fd sets are rebuilt from the registry before every wait, so
//! there is no persistent backend state. The fd limit is FD_SETSIZE.

use crate::poll::FdFlags;
use nix::errno::Errno;
use std::mem;
use std::os::fd::RawFd;

/// One select(2) invocation: fd sets built from the live registry entries.
pub(crate) struct SelectJob {
    rfds: libc::fd_set,
    wfds: libc::fd_set,
    efds: libc::fd_set,
    nfds: libc::c_int,
}

impl SelectJob {
    /// Build the fd sets from `(fd, flags)` pairs of all live records.
    ///
    /// `nfds` is derived exactly from the entries, so descriptors detached
    /// earlier are never scanned.
    pub(crate) fn new<I>(entries: I) -> SelectJob
    where
        I: Iterator<Item = (RawFd, FdFlags)>,
    {
        let mut job = unsafe {
            SelectJob {
                rfds: mem::zeroed(),
                wfds: mem::zeroed(),
                efds: mem::zeroed(),
                nfds: 0,
            }
        };
        unsafe {
            libc::FD_ZERO(&mut job.rfds);
            libc::FD_ZERO(&mut job.wfds);
            libc::FD_ZERO(&mut job.efds);
        }

        for (fd, flags) in entries {
            if flags.is_empty() || fd < 0 || fd as usize >= libc::FD_SETSIZE {
                continue;
            }
            unsafe {
                if flags.contains(FdFlags::READ) {
                    libc::FD_SET(fd, &mut job.rfds);
                }
                if flags.contains(FdFlags::WRITE) {
                    libc::FD_SET(fd, &mut job.wfds);
                }
                if flags.contains(FdFlags::EXCEPT) {
                    libc::FD_SET(fd, &mut job.efds);
                }
            }
            job.nfds = job.nfds.max(fd + 1);
        }

        job
    }

    /// Block until readiness or timeout; `None` waits indefinitely.
    pub(crate) fn wait(&mut self, timeout_ms: Option<u64>) -> std::result::Result<usize, Errno> {
        let mut tv;
        let tvp = match timeout_ms {
            Some(to) => {
                tv = libc::timeval {
                    tv_sec: (to / 1000) as libc::time_t,
                    tv_usec: ((to % 1000) * 1000) as libc::suseconds_t,
                };
                &mut tv as *mut libc::timeval
            }
            None => std::ptr::null_mut(),
        };

        let n = unsafe {
            libc::select(self.nfds, &mut self.rfds, &mut self.wfds, &mut self.efds, tvp)
        };
        if n < 0 {
            return Err(Errno::last());
        }
        Ok(n as usize)
    }

    /// Flags the kernel reported ready for `fd`, if any.
    pub(crate) fn ready(&self, fd: RawFd) -> FdFlags {
        let mut flags = FdFlags::empty();
        if fd < 0 || fd as usize >= libc::FD_SETSIZE {
            return flags;
        }
        unsafe {
            if libc::FD_ISSET(fd, &self.rfds) {
                flags |= FdFlags::READ;
            }
            if libc::FD_ISSET(fd, &self.wfds) {
                flags |= FdFlags::WRITE;
            }
            if libc::FD_ISSET(fd, &self.efds) {
                flags |= FdFlags::EXCEPT;
            }
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nfds_tracks_highest_live_fd() {
        let entries = [(3, FdFlags::READ), (7, FdFlags::WRITE), (5, FdFlags::empty())];
        let job = SelectJob::new(entries.into_iter());
        assert_eq!(job.nfds, 8);
    }

    #[test]
    fn detached_entries_are_not_set() {
        let entries = [(4, FdFlags::empty())];
        let job = SelectJob::new(entries.into_iter());
        assert_eq!(job.nfds, 0);
        assert!(job.ready(4).is_empty());
    }
}
