//! Per-thread reactor slot with a process-global fallback.
//!
//! Every thread that runs a reactor installs it here. The first reactor is
//! also published as the global fallback so library calls from incidental
//! threads still resolve a reactor. The thread-local slot holds an `Arc`,
//! so a thread exiting without [`close`] releases its reactor through the
//! slot's own drop.

use crate::error::{Error, Result};
use crate::reactor::Reactor;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::Arc;

static GLOBAL: Lazy<Mutex<Option<Arc<Reactor>>>> = Lazy::new(|| Mutex::new(None));

thread_local! {
    static CURRENT: RefCell<Option<Arc<Reactor>>> = const { RefCell::new(None) };
}

/// Allocate a reactor for the current thread and bind it to the slot.
///
/// The first caller also publishes its reactor as the global fallback.
pub fn init() -> Result<Arc<Reactor>> {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            tracing::warn!("thread already has a reactor");
            return Err(Error::AlreadyBound);
        }

        let reactor = Reactor::new();

        let mut global = GLOBAL.lock();
        if global.is_none() {
            *global = Some(reactor.clone());
        }
        drop(global);

        *slot = Some(reactor.clone());
        Ok(reactor)
    })
}

/// Release the current thread's reactor and clear the slot. Clears the
/// global fallback too when it was this reactor.
pub fn close() {
    CURRENT.with(|slot| {
        let Some(reactor) = slot.borrow_mut().take() else {
            return;
        };

        let mut global = GLOBAL.lock();
        if global.as_ref().is_some_and(|g| Arc::ptr_eq(g, &reactor)) {
            *global = None;
        }
    });
}

/// Point the current thread's slot at an existing reactor.
///
/// Binding a thread that already holds a different reactor fails; binding
/// the same reactor again is a no-op.
pub fn attach(reactor: &Arc<Reactor>) -> Result<()> {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        match slot.as_ref() {
            Some(bound) if Arc::ptr_eq(bound, reactor) => Ok(()),
            Some(_) => Err(Error::AlreadyBound),
            None => {
                *slot = Some(reactor.clone());
                Ok(())
            }
        }
    })
}

/// Clear the current thread's slot without destroying the reactor.
pub fn detach() {
    CURRENT.with(|slot| {
        slot.borrow_mut().take();
    });
}

/// The current thread's reactor, falling back to the process global.
pub fn current() -> Option<Arc<Reactor>> {
    let local = CURRENT.with(|slot| slot.borrow().clone());
    if local.is_some() {
        return local;
    }
    GLOBAL.lock().clone()
}
