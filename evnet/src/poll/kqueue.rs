//! kqueue backend (macOS/BSD).
//!
//! Read and write interest are separate kernel filters, so every change is a
//! delete-then-add pair. Ready events identify the descriptor via `ident`.

use crate::error::Result;
use crate::poll::FdFlags;
use nix::errno::Errno;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::ptr;

pub(crate) struct KqueueState {
    kqfd: OwnedFd,
    evlist: Vec<libc::kevent>,
}

fn empty_kevent() -> libc::kevent {
    // kevent has platform-dependent padding; zeroed is the portable init.
    unsafe { std::mem::zeroed() }
}

impl KqueueState {
    pub(crate) fn new(maxfds: usize) -> Result<KqueueState> {
        let kqfd = unsafe { libc::kqueue() };
        if kqfd < 0 {
            let err = Errno::last();
            tracing::warn!(errno = %err, "kqueue failed");
            return Err(err.into());
        }

        Ok(KqueueState {
            kqfd: unsafe { OwnedFd::from_raw_fd(kqfd) },
            evlist: vec![empty_kevent(); maxfds.max(1)],
        })
    }

    pub(crate) fn set_fd(&mut self, fd: RawFd, flags: FdFlags) -> Result<()> {
        use std::os::fd::AsRawFd;

        let kqfd = self.kqfd.as_raw_fd();

        // Always delete both filters first; a change is delete-then-add.
        let mut del = [empty_kevent(), empty_kevent()];
        del[0].ident = fd as libc::uintptr_t;
        del[0].filter = libc::EVFILT_READ;
        del[0].flags = libc::EV_DELETE;
        del[1].ident = fd as libc::uintptr_t;
        del[1].filter = libc::EVFILT_WRITE;
        del[1].flags = libc::EV_DELETE;
        unsafe {
            libc::kevent(kqfd, del.as_ptr(), 2, ptr::null_mut(), 0, ptr::null());
        }

        let mut changes = [empty_kevent(), empty_kevent()];
        let mut n = 0;
        if flags.contains(FdFlags::WRITE) {
            changes[n].ident = fd as libc::uintptr_t;
            changes[n].filter = libc::EVFILT_WRITE;
            changes[n].flags = libc::EV_ADD;
            n += 1;
        }
        if flags.contains(FdFlags::READ) {
            changes[n].ident = fd as libc::uintptr_t;
            changes[n].filter = libc::EVFILT_READ;
            changes[n].flags = libc::EV_ADD;
            n += 1;
        }

        if n > 0 {
            let rc = unsafe {
                libc::kevent(
                    kqfd,
                    changes.as_ptr(),
                    n as libc::c_int,
                    ptr::null_mut(),
                    0,
                    ptr::null(),
                )
            };
            if rc < 0 {
                let err = Errno::last();
                tracing::warn!(fd, ?flags, errno = %err, "kevent add failed");
                return Err(err.into());
            }
        }

        Ok(())
    }

    /// Raw kqueue fd plus the moved-out event buffer for an unlocked wait.
    pub(crate) fn wait_handle(&mut self) -> (RawFd, Vec<libc::kevent>) {
        use std::os::fd::AsRawFd;
        (self.kqfd.as_raw_fd(), std::mem::take(&mut self.evlist))
    }

    pub(crate) fn restore(&mut self, evlist: Vec<libc::kevent>) {
        self.evlist = evlist;
    }
}

pub(crate) fn wait(
    kqfd: RawFd,
    evlist: &mut [libc::kevent],
    timeout_ms: Option<u64>,
) -> std::result::Result<usize, Errno> {
    let mut ts;
    let tsp = match timeout_ms {
        Some(to) => {
            ts = libc::timespec {
                tv_sec: (to / 1000) as libc::time_t,
                tv_nsec: ((to % 1000) * 1_000_000) as libc::c_long,
            };
            &ts as *const libc::timespec
        }
        None => ptr::null(),
    };

    let n = unsafe {
        libc::kevent(
            kqfd,
            ptr::null(),
            0,
            evlist.as_mut_ptr(),
            evlist.len() as libc::c_int,
            tsp,
        )
    };
    if n < 0 {
        return Err(Errno::last());
    }
    Ok(n as usize)
}

/// Map one kevent to descriptor flags.
pub(crate) fn flags_from_kevent(kev: &libc::kevent) -> FdFlags {
    let mut flags = FdFlags::empty();
    match kev.filter {
        libc::EVFILT_READ => flags |= FdFlags::READ,
        libc::EVFILT_WRITE => flags |= FdFlags::WRITE,
        other => {
            tracing::warn!(filter = other, "kqueue: unhandled filter");
        }
    }
    if kev.flags & libc::EV_EOF != 0 {
        flags |= FdFlags::EXCEPT;
    }
    if kev.flags & libc::EV_ERROR != 0 {
        tracing::warn!(ident = kev.ident as i64, "kqueue: EV_ERROR on descriptor");
    }
    flags
}
