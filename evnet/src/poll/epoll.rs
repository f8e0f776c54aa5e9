//! epoll backend (Linux).
//!
//! Interest lives in the kernel set; each change is one epoll_ctl syscall.
//! Ready events carry the descriptor in the data word, never a pointer, so
//! the dispatch path always resolves them through the registry.

use crate::error::{Error, Result};
use crate::poll::FdFlags;
use nix::errno::Errno;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

pub(crate) struct EpollState {
    epfd: OwnedFd,
    events: Vec<libc::epoll_event>,
}

impl EpollState {
    pub(crate) fn new(maxfds: usize) -> Result<EpollState> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            let err = Errno::last();
            tracing::warn!(maxfds, errno = %err, "epoll_create1 failed");
            return Err(err.into());
        }

        Ok(EpollState {
            epfd: unsafe { OwnedFd::from_raw_fd(epfd) },
            events: vec![libc::epoll_event { events: 0, u64: 0 }; maxfds.max(1)],
        })
    }

    pub(crate) fn set_fd(&mut self, fd: RawFd, flags: FdFlags) -> Result<()> {
        use std::os::fd::AsRawFd;

        let mut event = libc::epoll_event {
            events: events_from_flags(flags),
            u64: fd as u64,
        };
        let epfd = self.epfd.as_raw_fd();

        if flags.is_empty() {
            let rc = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_DEL, fd, &mut event) };
            if rc < 0 {
                tracing::debug!(fd, errno = %Errno::last(), "epoll_ctl del");
            }
            return Ok(());
        }

        let rc = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd, &mut event) };
        if rc < 0 {
            // Already present: modify in place.
            if Errno::last() == Errno::EEXIST {
                let rc = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_MOD, fd, &mut event) };
                if rc < 0 {
                    let err = Errno::last();
                    tracing::warn!(fd, errno = %err, "epoll_ctl mod failed");
                    return Err(err.into());
                }
            } else {
                let err = Errno::last();
                tracing::warn!(fd, errno = %err, "epoll_ctl add failed");
                return Err(err.into());
            }
        }

        Ok(())
    }

    /// The wait runs on a raw copy of the epoll fd plus the moved-out event
    /// buffer, so the reactor lock can be released around the syscall while
    /// concurrent epoll_ctl calls stay valid.
    pub(crate) fn wait_handle(&mut self) -> (RawFd, Vec<libc::epoll_event>) {
        use std::os::fd::AsRawFd;
        (self.epfd.as_raw_fd(), std::mem::take(&mut self.events))
    }

    pub(crate) fn restore(&mut self, events: Vec<libc::epoll_event>) {
        self.events = events;
    }
}

pub(crate) fn wait(
    epfd: RawFd,
    events: &mut [libc::epoll_event],
    timeout_ms: Option<u64>,
) -> std::result::Result<usize, Errno> {
    let timeout = match timeout_ms {
        Some(to) => to.min(libc::c_int::MAX as u64) as libc::c_int,
        None => -1,
    };

    let n = unsafe {
        libc::epoll_wait(epfd, events.as_mut_ptr(), events.len() as libc::c_int, timeout)
    };
    if n < 0 {
        return Err(Errno::last());
    }
    Ok(n as usize)
}

pub(crate) fn events_from_flags(flags: FdFlags) -> u32 {
    let mut ev = 0u32;
    if flags.contains(FdFlags::READ) {
        ev |= libc::EPOLLIN as u32;
    }
    if flags.contains(FdFlags::WRITE) {
        ev |= libc::EPOLLOUT as u32;
    }
    if flags.contains(FdFlags::EXCEPT) {
        ev |= libc::EPOLLERR as u32;
    }
    ev
}

pub(crate) fn flags_from_events(events: u32) -> FdFlags {
    let mut flags = FdFlags::empty();
    if events & libc::EPOLLIN as u32 != 0 {
        flags |= FdFlags::READ;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        flags |= FdFlags::WRITE;
    }
    if events & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
        flags |= FdFlags::EXCEPT;
    }
    flags
}
