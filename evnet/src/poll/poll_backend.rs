//! poll(2) backend.
//!
//! Interest lives in a compact `pollfd` array indexed by each record's slot.
//! Unused slots carry fd −1, which poll(2) skips, so the array never needs
//! compaction when descriptors detach.

use crate::error::{Error, Result};
use crate::poll::FdFlags;
use nix::errno::Errno;
use std::os::fd::RawFd;

const EMPTY_SLOT: libc::pollfd = libc::pollfd {
    fd: -1,
    events: 0,
    revents: 0,
};

pub(crate) struct PollState {
    fds: Vec<libc::pollfd>,
}

impl PollState {
    pub(crate) fn new() -> PollState {
        PollState { fds: Vec::new() }
    }

    /// Write one record's interest into its slot.
    pub(crate) fn set_fd(&mut self, fd: RawFd, flags: FdFlags, index: i32, maxfds: usize) -> Result<()> {
        if index < 0 {
            return Err(Error::BadArgument);
        }
        let index = index as usize;
        if index >= maxfds {
            return Err(Error::TooManyDescriptors);
        }

        if index >= self.fds.len() {
            self.fds.resize(index + 1, EMPTY_SLOT);
        }

        let slot = &mut self.fds[index];
        if flags.is_empty() {
            *slot = EMPTY_SLOT;
        } else {
            slot.fd = fd;
            slot.events = events_from_flags(flags);
            slot.revents = 0;
        }

        Ok(())
    }

    /// Reset every slot; used before re-applying the registry so slots of
    /// descriptors detached in the meantime do not linger.
    pub(crate) fn clear(&mut self) {
        self.fds.fill(EMPTY_SLOT);
    }

    /// Move the array out for the duration of the wait syscall. The caller
    /// restores it with [`PollState::restore`] once the wait returns.
    pub(crate) fn take_fds(&mut self) -> Vec<libc::pollfd> {
        std::mem::take(&mut self.fds)
    }

    pub(crate) fn restore(&mut self, fds: Vec<libc::pollfd>) {
        self.fds = fds;
    }
}

/// Block in poll(2) on the moved-out array; `None` waits indefinitely.
pub(crate) fn wait(fds: &mut [libc::pollfd], timeout_ms: Option<u64>) -> std::result::Result<usize, Errno> {
    let timeout = match timeout_ms {
        Some(to) => to.min(libc::c_int::MAX as u64) as libc::c_int,
        None => -1,
    };

    let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
    if n < 0 {
        return Err(Errno::last());
    }
    Ok(n as usize)
}

pub(crate) fn events_from_flags(flags: FdFlags) -> libc::c_short {
    let mut ev = 0;
    if flags.contains(FdFlags::READ) {
        ev |= libc::POLLIN;
    }
    if flags.contains(FdFlags::WRITE) {
        ev |= libc::POLLOUT;
    }
    if flags.contains(FdFlags::EXCEPT) {
        ev |= libc::POLLERR;
    }
    ev
}

pub(crate) fn flags_from_revents(revents: libc::c_short) -> FdFlags {
    let mut flags = FdFlags::empty();
    if revents & libc::POLLIN != 0 {
        flags |= FdFlags::READ;
    }
    if revents & libc::POLLOUT != 0 {
        flags |= FdFlags::WRITE;
    }
    if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        flags |= FdFlags::EXCEPT;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_mapping_round_trip() {
        let ev = events_from_flags(FdFlags::READ | FdFlags::WRITE);
        assert_eq!(ev & libc::POLLIN, libc::POLLIN);
        assert_eq!(ev & libc::POLLOUT, libc::POLLOUT);

        assert_eq!(flags_from_revents(libc::POLLIN), FdFlags::READ);
        assert_eq!(flags_from_revents(libc::POLLHUP), FdFlags::EXCEPT);
        assert_eq!(
            flags_from_revents(libc::POLLIN | libc::POLLNVAL),
            FdFlags::READ | FdFlags::EXCEPT
        );
    }

    #[test]
    fn detach_clears_slot() {
        let mut state = PollState::new();
        state.set_fd(9, FdFlags::READ, 0, 16).unwrap();
        assert_eq!(state.fds[0].fd, 9);

        state.set_fd(9, FdFlags::empty(), 0, 16).unwrap();
        assert_eq!(state.fds[0].fd, -1);
        assert_eq!(state.fds[0].events, 0);
    }

    #[test]
    fn slot_beyond_maxfds_is_rejected() {
        let mut state = PollState::new();
        assert!(matches!(
            state.set_fd(3, FdFlags::READ, 16, 16),
            Err(Error::TooManyDescriptors)
        ));
    }
}
