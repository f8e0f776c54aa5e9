//! Poll backends.
//!
//! Every backend implements the same four operations — init, per-descriptor
//! set, wait, teardown — over a different OS readiness notifier. The reactor
//! holds a [`Backend`] tag and dispatches through it, so the polling method
//! can be switched at runtime without trait objects in the hot path.

mod poll_backend;
mod select;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) mod epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "openbsd"
))]
pub(crate) mod kqueue;

use crate::error::{Error, Result};
use std::os::fd::RawFd;

pub(crate) use poll_backend::{
    flags_from_revents as poll_flags_from_revents, wait as poll_wait, PollState,
};
pub(crate) use select::SelectJob;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use epoll::EpollState;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "openbsd"
))]
pub(crate) use kqueue::KqueueState;

bitflags::bitflags! {
    /// Event flags for a registered descriptor.
    ///
    /// An empty set on attach means "detach and forget".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FdFlags: u32 {
        const READ   = 1 << 0;
        const WRITE  = 1 << 1;
        const EXCEPT = 1 << 2;
    }
}

/// Async I/O polling method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMethod {
    Select,
    Poll,
    Epoll,
    Kqueue,
}

impl PollMethod {
    /// Best method available on this platform: EPOLL > KQUEUE > POLL > SELECT.
    pub fn best() -> PollMethod {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        return PollMethod::Epoll;

        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "dragonfly",
            target_os = "openbsd"
        ))]
        return PollMethod::Kqueue;

        #[allow(unreachable_code)]
        PollMethod::Poll
    }

    /// Whether this method can be used on the current platform.
    pub fn is_supported(self) -> bool {
        match self {
            PollMethod::Select | PollMethod::Poll => true,
            PollMethod::Epoll => cfg!(any(target_os = "linux", target_os = "android")),
            PollMethod::Kqueue => cfg!(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "dragonfly",
                target_os = "openbsd"
            )),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PollMethod::Select => "select",
            PollMethod::Poll => "poll",
            PollMethod::Epoll => "epoll",
            PollMethod::Kqueue => "kqueue",
        }
    }
}

/// Backend-owned polling resources, tagged by the active method.
pub(crate) enum Backend {
    None,
    /// select(2) rebuilds its fd sets on every wait; no persistent state.
    Select,
    Poll(PollState),
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll(EpollState),
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd"
    ))]
    Kqueue(KqueueState),
}

impl Backend {
    pub(crate) fn init(method: PollMethod, maxfds: usize) -> Result<Backend> {
        if !method.is_supported() {
            return Err(Error::NotSupported);
        }

        tracing::debug!(method = method.name(), maxfds, "poll init");

        match method {
            PollMethod::Select => Ok(Backend::Select),
            PollMethod::Poll => Ok(Backend::Poll(PollState::new())),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            PollMethod::Epoll => Ok(Backend::Epoll(EpollState::new(maxfds)?)),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "dragonfly",
                target_os = "openbsd"
            ))]
            PollMethod::Kqueue => Ok(Backend::Kqueue(KqueueState::new(maxfds)?)),
            #[allow(unreachable_patterns)]
            _ => Err(Error::NotSupported),
        }
    }

    pub(crate) fn method(&self) -> Option<PollMethod> {
        match self {
            Backend::None => None,
            Backend::Select => Some(PollMethod::Select),
            Backend::Poll(_) => Some(PollMethod::Poll),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll(_) => Some(PollMethod::Epoll),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "dragonfly",
                target_os = "openbsd"
            ))]
            Backend::Kqueue(_) => Some(PollMethod::Kqueue),
        }
    }

    /// Apply one descriptor's flags to the backend's interest set.
    ///
    /// Empty flags remove the descriptor. `index` is the record's slot in
    /// compact event arrays; kernel-set backends ignore it.
    pub(crate) fn set_fd(&mut self, fd: RawFd, flags: FdFlags, index: i32, maxfds: usize) -> Result<()> {
        match self {
            Backend::None | Backend::Select => Ok(()),
            Backend::Poll(state) => state.set_fd(fd, flags, index, maxfds),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll(state) => state.set_fd(fd, flags),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "dragonfly",
                target_os = "openbsd"
            ))]
            Backend::Kqueue(state) => {
                let _ = index;
                state.set_fd(fd, flags)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_method_is_supported() {
        assert!(PollMethod::best().is_supported());
    }

    #[test]
    fn portable_methods_always_supported() {
        assert!(PollMethod::Select.is_supported());
        assert!(PollMethod::Poll.is_supported());
    }

    #[test]
    fn empty_flags_mean_detach() {
        assert!(FdFlags::empty().is_empty());
        assert!(!FdFlags::READ.is_empty());
    }
}
