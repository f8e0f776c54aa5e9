//! Reactor: descriptor registry and the main polling loop.
//!
//! A reactor is owned by the thread that created it. Handlers run on the
//! owner thread, serialized by the reactor lock; the lock is released only
//! around the backend wait syscall. Foreign threads must bracket reactor
//! calls with [`Reactor::enter`].

pub mod thread;
mod timer;

pub use timer::{jiffies, TimerKey};

use crate::error::{Error, Result};
use crate::poll::{Backend, FdFlags, PollMethod, SelectJob};
use nix::errno::Errno;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, ReentrantMutex, ReentrantMutexGuard};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use timer::TimerList;

#[cfg(any(target_os = "linux", target_os = "android"))]
use crate::poll::epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "openbsd"
))]
use crate::poll::kqueue;

/// Default descriptor capacity, matching the select(2) set size.
const DEFAULT_MAXFDS: usize = libc::FD_SETSIZE;

/// Advisory wall-clock ceiling per handler invocation, in milliseconds.
#[cfg(debug_assertions)]
const MAX_BLOCKING_MS: u128 = 500;

/// Event handler for a registered descriptor.
pub type FdHandler = Arc<dyn Fn(FdFlags) + Send + Sync>;

/// Last caught async signal, sticky until the loop delivers it. The signal
/// handler only writes this slot and re-arms itself.
static CAUGHT_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn signal_handler(sig: libc::c_int) {
    unsafe {
        libc::signal(sig, signal_handler as extern "C" fn(libc::c_int) as usize);
    }
    CAUGHT_SIGNAL.store(sig, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        let h = signal_handler as extern "C" fn(libc::c_int) as usize;
        libc::signal(libc::SIGINT, h);
        libc::signal(libc::SIGALRM, h);
        libc::signal(libc::SIGTERM, h);
    }
}

/// Bookkeeping for one attached descriptor.
///
/// Boxed so the record keeps a stable address across registry rehashes;
/// with `reuse_records` the same allocation serves successive attaches of
/// the same descriptor number.
struct FdRecord {
    fd: RawFd,
    flags: FdFlags,
    handler: Option<FdHandler>,
    /// Slot in compact backend arrays; −1 while detached.
    index: i32,
}

struct Inner {
    registry: HashMap<RawFd, Box<FdRecord>>,
    free_indices: Vec<i32>,
    next_index: i32,
    /// Number of attached descriptors.
    active: usize,
    maxfds: usize,
    method: Option<PollMethod>,
    backend: Backend,
    /// Method or topology changed mid-dispatch; the pass returns early.
    update: bool,
    /// Registry changed while the poll(2) array was out for a wait; the
    /// slots are rebuilt when the wait returns.
    slots_dirty: bool,
    in_wait: bool,
    /// Descriptors retired while a dispatch pass is in flight.
    pending_delete: Vec<RawFd>,
    /// Keep record storage after detach so the next attach of the same
    /// descriptor number reuses it (POSIX returns the lowest free fd).
    reuse_records: bool,
    timers: TimerList,
}

impl Inner {
    fn alloc_index(&mut self) -> i32 {
        self.free_indices.pop().unwrap_or_else(|| {
            let index = self.next_index;
            self.next_index += 1;
            index
        })
    }

    /// Ensure maxfds, method and backend are ready for polling.
    fn poll_setup(&mut self) -> Result<()> {
        if self.maxfds == 0 {
            self.maxfds = DEFAULT_MAXFDS;
        }
        if self.method.is_none() {
            let best = PollMethod::best();
            tracing::debug!(method = best.name(), "poll method not set, using best");
            self.method = Some(best);
        }
        if matches!(self.backend, Backend::None) {
            let method = self.method.unwrap_or_else(PollMethod::best);
            self.backend = Backend::init(method, self.maxfds)?;
            self.rebuild()?;
        }
        Ok(())
    }

    /// Re-apply every live record to the active backend.
    fn rebuild(&mut self) -> Result<()> {
        // Slots of records detached since the last sync must not linger.
        if let Backend::Poll(state) = &mut self.backend {
            state.clear();
        }

        let entries: Vec<(RawFd, FdFlags, i32)> = self
            .registry
            .values()
            .filter(|r| r.index >= 0 && !r.flags.is_empty() && r.handler.is_some())
            .map(|r| (r.fd, r.flags, r.index))
            .collect();
        let maxfds = self.maxfds;
        for (fd, flags, index) in entries {
            if let Err(e) = self.backend.set_fd(fd, flags, index, maxfds) {
                tracing::warn!(fd, error = %e, "rebuild: backend set failed");
                return Err(e);
            }
        }
        self.slots_dirty = false;
        Ok(())
    }

    fn max_live_fd(&self) -> RawFd {
        self.registry
            .values()
            .filter(|r| r.index >= 0 && !r.flags.is_empty())
            .map(|r| r.fd)
            .max()
            .unwrap_or(-1)
    }
}

/// A per-thread event reactor.
pub struct Reactor {
    inner: ReentrantMutex<RefCell<Inner>>,
    polling: AtomicBool,
    owner: ThreadId,
    foreign_entered: AtomicBool,
    /// Externally injected mutex; when present it is taken outermost on
    /// every lock of reactor state.
    external: Mutex<Option<Arc<Mutex<()>>>>,
}

/// Foreign-thread entry token. Holds the reactor lock; dropping it leaves.
pub struct ReactorGuard<'a> {
    reactor: &'a Reactor,
    foreign: bool,
    _inner: ReentrantMutexGuard<'a, RefCell<Inner>>,
    _ext: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl Drop for ReactorGuard<'_> {
    fn drop(&mut self) {
        if self.foreign {
            self.reactor.foreign_entered.store(false, Ordering::SeqCst);
        }
    }
}

/// One backend wait, detached from the reactor lock.
enum WaitJob {
    Select(SelectJob),
    Poll(Vec<libc::pollfd>),
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll(RawFd, Vec<libc::epoll_event>),
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd"
    ))]
    Kqueue(RawFd, Vec<libc::kevent>),
}

impl Reactor {
    pub fn new() -> Arc<Reactor> {
        Arc::new(Reactor {
            inner: ReentrantMutex::new(RefCell::new(Inner {
                registry: HashMap::new(),
                free_indices: Vec::new(),
                next_index: 0,
                active: 0,
                maxfds: 0,
                method: None,
                backend: Backend::None,
                update: false,
                slots_dirty: false,
                in_wait: false,
                pending_delete: Vec::new(),
                reuse_records: cfg!(unix),
                timers: TimerList::new(),
            })),
            polling: AtomicBool::new(false),
            owner: std::thread::current().id(),
            foreign_entered: AtomicBool::new(false),
            external: Mutex::new(None),
        })
    }

    /// Listen for events on a descriptor.
    ///
    /// Idempotent in `fd`: re-attaching updates flags and handler in place.
    pub fn attach<F>(&self, fd: RawFd, flags: FdFlags, handler: F) -> Result<()>
    where
        F: Fn(FdFlags) + Send + Sync + 'static,
    {
        self.listen(fd, flags, Some(Arc::new(handler)))
    }

    /// Stop listening on a descriptor.
    pub fn detach(&self, fd: RawFd) -> Result<()> {
        self.listen(fd, FdFlags::empty(), None)
    }

    fn listen(&self, fd: RawFd, flags: FdFlags, handler: Option<FdHandler>) -> Result<()> {
        if cfg!(debug_assertions) {
            self.check()?;
        }

        if fd < 0 {
            tracing::warn!(fd, "attach: corrupt descriptor");
            return Err(Error::BadDescriptor);
        }

        tracing::debug!(fd, ?flags, "fd listen");

        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();

        if !flags.is_empty() {
            inner.poll_setup()?;
        }

        if flags.is_empty() {
            let polling = self.polling.load(Ordering::SeqCst);
            detach_record(&mut inner, fd, polling);
            return Ok(());
        }

        if !inner.registry.contains_key(&fd) {
            inner.registry.insert(
                fd,
                Box::new(FdRecord {
                    fd,
                    flags: FdFlags::empty(),
                    handler: None,
                    index: -1,
                }),
            );
        }

        let prev_index = inner.registry.get(&fd).map(|r| r.index).unwrap_or(-1);
        let index = if prev_index < 0 {
            let index = inner.alloc_index();
            inner.active += 1;
            index
        } else {
            prev_index
        };

        if let Some(rec) = inner.registry.get_mut(&fd) {
            rec.flags = flags;
            rec.handler = handler;
            rec.index = index;
        }

        let limit_hit = match inner.method {
            Some(PollMethod::Select) => fd as usize + 1 > inner.maxfds.min(libc::FD_SETSIZE),
            _ => false,
        };

        let backend_res = if limit_hit {
            Err(Error::TooManyDescriptors)
        } else if inner.in_wait && matches!(inner.backend, Backend::Poll(_)) {
            // The pollfd array is out with the wait syscall; apply on return.
            inner.slots_dirty = true;
            Ok(())
        } else {
            let maxfds = inner.maxfds;
            inner.backend.set_fd(fd, flags, index, maxfds)
        };

        if let Err(e) = backend_res {
            tracing::warn!(fd, ?flags, error = %e, "attach failed, detaching descriptor");
            let polling = self.polling.load(Ordering::SeqCst);
            detach_record(&mut inner, fd, polling);
            return Err(e);
        }

        Ok(())
    }

    /// Number of attached descriptors.
    pub fn active_count(&self) -> usize {
        self.inner.lock().borrow().active
    }

    /// Current polling method, if one has been selected.
    pub fn method(&self) -> Option<PollMethod> {
        self.inner.lock().borrow().method
    }

    /// Switch the polling method. Valid at any time: the new backend is
    /// initialized, every live record re-attached, and an in-flight
    /// dispatch pass returns after its current handler.
    pub fn set_method(&self, method: PollMethod) -> Result<()> {
        if !method.is_supported() {
            tracing::warn!(method = method.name(), "poll method not supported");
            return Err(Error::NotSupported);
        }

        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();

        if inner.maxfds == 0 {
            inner.maxfds = DEFAULT_MAXFDS;
        }

        if method == PollMethod::Select
            && inner.max_live_fd() as usize + 1 > inner.maxfds.min(libc::FD_SETSIZE)
        {
            tracing::warn!("cannot switch to select: descriptor numbers too large");
            return Err(Error::TooManyDescriptors);
        }

        let new_backend = Backend::init(method, inner.maxfds)?;
        // Drop replaces the previous backend's kernel set wholesale.
        inner.backend = new_backend;
        inner.method = Some(method);
        inner.update = true;
        inner.rebuild().map_err(|_| Error::BadDescriptor)?;

        tracing::info!(method = method.name(), "polling method set");
        Ok(())
    }

    /// Set the maximum number of polled descriptors.
    ///
    /// Only the first nonzero call takes effect. `0` tears down backend
    /// resources; a negative value uses the process RLIMIT_NOFILE.
    pub fn set_max_fds(&self, maxfds: i32) -> Result<()> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();

        if maxfds == 0 {
            tracing::debug!("poll close");
            inner.backend = Backend::None;
            inner.maxfds = 0;
            return Ok(());
        }

        let maxfds = if maxfds < 0 {
            let mut limits = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limits) };
            if rc < 0 {
                let err = Errno::last();
                tracing::warn!(errno = %err, "getrlimit failed");
                return Err(err.into());
            }
            limits.rlim_cur as usize
        } else {
            maxfds as usize
        };

        if inner.maxfds == 0 {
            inner.maxfds = maxfds;
        }

        Ok(())
    }

    /// Keep or free record storage on detach; disabled automatically when a
    /// foreign thread enters, since cross-thread fd allocation is not
    /// deterministic.
    pub fn set_reuse(&self, reuse: bool) {
        self.inner.lock().borrow_mut().reuse_records = reuse;
    }

    /// Install an external mutex taken outermost around every dispatch pass
    /// and foreign entry; `None` reverts to the internal lock alone.
    pub fn set_external_lock(&self, lock: Option<Arc<Mutex<()>>>) {
        *self.external.lock() = lock;
    }

    fn external_guard(&self) -> Option<ArcMutexGuard<RawMutex, ()>> {
        let ext = self.external.lock().clone();
        ext.map(|m| m.lock_arc())
    }

    /// Run the polling loop until [`Reactor::cancel`] or an error.
    pub fn run(&self) -> Result<()> {
        self.run_impl(None)
    }

    /// Like [`Reactor::run`], additionally delivering caught signals to
    /// `signal_handler` between dispatch passes.
    pub fn run_with_signals<F: FnMut(i32)>(&self, mut signal_handler: F) -> Result<()> {
        self.run_impl(Some(&mut signal_handler))
    }

    fn run_impl(&self, mut signal_cb: Option<&mut dyn FnMut(i32)>) -> Result<()> {
        if self.polling.swap(true, Ordering::SeqCst) {
            tracing::warn!("main loop already polling");
            return Err(Error::AlreadyPolling);
        }

        let res = self.poll_loop(&mut signal_cb);
        self.polling.store(false, Ordering::SeqCst);
        res
    }

    fn poll_loop(&self, signal_cb: &mut Option<&mut dyn FnMut(i32)>) -> Result<()> {
        {
            let _ext = self.external_guard();
            let guard = self.inner.lock();
            guard.borrow_mut().poll_setup()?;

            if signal_cb.is_some() {
                install_signal_handlers();
            }

            let method = guard.borrow().method;
            tracing::debug!(method = method.map(PollMethod::name), "polling loop started");
        }

        loop {
            let sig = CAUGHT_SIGNAL.swap(0, Ordering::Relaxed);
            if sig != 0 {
                if let Some(cb) = signal_cb.as_mut() {
                    cb(sig);
                }
            }

            if !self.polling.load(Ordering::SeqCst) {
                return Ok(());
            }

            match self.fd_poll() {
                Ok(()) => {}
                Err(e) if wait_error_is_benign(&e) => {
                    self.fire_timers();
                    continue;
                }
                Err(e) => return Err(e),
            }

            self.fire_timers();
        }
    }

    /// One pass: wait for I/O or the next timer, then dispatch ready events.
    fn fd_poll(&self) -> Result<()> {
        let mut job;
        let timeout;

        {
            let _ext = self.external_guard();
            let guard = self.inner.lock();
            let mut inner = guard.borrow_mut();

            timeout = inner.timers.next_timeout(jiffies());

            let method = inner.backend.method().ok_or(Error::BadArgument)?;
            job = match method {
                PollMethod::Select => {
                    let entries: Vec<(RawFd, FdFlags)> = inner
                        .registry
                        .values()
                        .filter(|r| r.index >= 0)
                        .map(|r| (r.fd, r.flags))
                        .collect();
                    WaitJob::Select(SelectJob::new(entries.into_iter()))
                }
                PollMethod::Poll => {
                    let Backend::Poll(state) = &mut inner.backend else {
                        return Err(Error::BadArgument);
                    };
                    WaitJob::Poll(state.take_fds())
                }
                #[cfg(any(target_os = "linux", target_os = "android"))]
                PollMethod::Epoll => {
                    let Backend::Epoll(state) = &mut inner.backend else {
                        return Err(Error::BadArgument);
                    };
                    let (epfd, events) = state.wait_handle();
                    WaitJob::Epoll(epfd, events)
                }
                #[cfg(any(
                    target_os = "macos",
                    target_os = "ios",
                    target_os = "freebsd",
                    target_os = "dragonfly",
                    target_os = "openbsd"
                ))]
                PollMethod::Kqueue => {
                    let Backend::Kqueue(state) = &mut inner.backend else {
                        return Err(Error::BadArgument);
                    };
                    let (kqfd, evlist) = state.wait_handle();
                    WaitJob::Kqueue(kqfd, evlist)
                }
                #[allow(unreachable_patterns)]
                _ => return Err(Error::NotSupported),
            };

            inner.in_wait = true;
        }

        // The only place the reactor releases its lock.
        let wait_res = match &mut job {
            WaitJob::Select(j) => j.wait(timeout),
            WaitJob::Poll(fds) => crate::poll::poll_wait(fds, timeout),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            WaitJob::Epoll(epfd, events) => epoll::wait(*epfd, events, timeout),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "dragonfly",
                target_os = "openbsd"
            ))]
            WaitJob::Kqueue(kqfd, evlist) => kqueue::wait(*kqfd, evlist, timeout),
        };

        let _ext = self.external_guard();
        let guard = self.inner.lock();

        let ready = {
            let mut inner = guard.borrow_mut();
            inner.in_wait = false;

            let n = match wait_res {
                Ok(n) => n,
                Err(e) => {
                    restore_job(&mut inner, job);
                    return Err(e.into());
                }
            };

            let ready = collect_ready(&mut inner, &mut job, n);
            restore_job(&mut inner, job);

            if inner.slots_dirty {
                // Registry changed while the array was out; resync slots.
                inner.rebuild()?;
            }
            ready
        };

        self.dispatch(&guard, ready);
        Ok(())
    }

    fn dispatch(&self, guard: &ReentrantMutexGuard<'_, RefCell<Inner>>, ready: Vec<(RawFd, FdFlags)>) {
        for (fd, flags) in ready {
            if flags.is_empty() {
                continue;
            }

            let handler = {
                let inner = guard.borrow();
                match inner.registry.get(&fd) {
                    // Skip records detached or cleared earlier in this pass.
                    Some(rec) if rec.index >= 0 && !rec.flags.is_empty() => rec.handler.clone(),
                    Some(_) => None,
                    None => {
                        tracing::debug!(fd, "event for unknown descriptor");
                        None
                    }
                }
            };

            if let Some(handler) = handler {
                invoke_handler(fd, flags, &handler);
            }

            let mut inner = guard.borrow_mut();
            if inner.update {
                // Method or topology changed; restart the outer loop.
                inner.update = false;
                break;
            }
        }

        let mut inner = guard.borrow_mut();
        let pending: Vec<RawFd> = inner.pending_delete.drain(..).collect();
        for fd in pending {
            let still_detached = inner.registry.get(&fd).map(|r| r.index < 0).unwrap_or(false);
            if still_detached {
                inner.registry.remove(&fd);
            }
        }
    }

    fn fire_timers(&self) {
        let _ext = self.external_guard();
        let guard = self.inner.lock();
        loop {
            let handler = guard.borrow_mut().timers.pop_expired(jiffies());
            match handler {
                Some(handler) => handler(),
                None => break,
            }
        }
    }

    /// Cancel the polling loop; takes effect at the top of the next pass.
    pub fn cancel(&self) {
        self.polling.store(false, Ordering::SeqCst);
    }

    /// Start a one-shot timer. The handler runs on the owner thread, in
    /// deadline order relative to other timers.
    pub fn timer_start<F>(&self, delay_ms: u64, handler: F) -> TimerKey
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.inner.lock();
        let deadline = jiffies().saturating_add(delay_ms);
        let key = guard.borrow_mut().timers.insert(deadline, Box::new(handler));
        key
    }

    /// Cancel a pending timer; returns false when it already fired.
    pub fn timer_cancel(&self, key: TimerKey) -> bool {
        self.inner.lock().borrow_mut().timers.cancel(key)
    }

    /// Enter the reactor from any thread. The returned guard holds the
    /// reactor lock; while a foreign thread holds it, record reuse is
    /// disabled and [`Reactor::check`] admits that thread.
    pub fn enter(&self) -> ReactorGuard<'_> {
        let ext = self.external_guard();
        let inner = self.inner.lock();
        inner.borrow_mut().reuse_records = false;

        let foreign = std::thread::current().id() != self.owner;
        if foreign {
            self.foreign_entered.store(true, Ordering::SeqCst);
        }

        ReactorGuard {
            reactor: self,
            foreign,
            _inner: inner,
            _ext: ext,
        }
    }

    /// OK iff the caller is the owner thread or inside an enter() bracket.
    pub fn check(&self) -> Result<()> {
        if self.foreign_entered.load(Ordering::SeqCst) {
            return Ok(());
        }
        if std::thread::current().id() == self.owner {
            return Ok(());
        }

        tracing::warn!("reactor touched from a foreign thread without enter()");
        Err(Error::Permission)
    }

    /// Render loop state and in-use descriptors for debugging.
    pub fn debug_dump(&self) -> String {
        let guard = self.inner.lock();
        let inner = guard.borrow();

        let mut out = String::new();
        let _ = writeln!(out, "reactor:");
        let _ = writeln!(out, "  maxfds:  {}", inner.maxfds);
        let _ = writeln!(out, "  active:  {}", inner.active);
        let _ = writeln!(
            out,
            "  method:  {}",
            inner.method.map(PollMethod::name).unwrap_or("none")
        );
        let _ = writeln!(out, "  timers:  {}", inner.timers.len());
        for rec in inner.registry.values() {
            if rec.flags.is_empty() {
                continue;
            }
            let _ = writeln!(out, "  fd {} in use: flags={:?} index={}", rec.fd, rec.flags, rec.index);
        }
        out
    }
}

fn detach_record(inner: &mut Inner, fd: RawFd, polling: bool) {
    let index = match inner.registry.get(&fd) {
        Some(rec) => rec.index,
        None => return,
    };

    if index >= 0 {
        if inner.in_wait && matches!(inner.backend, Backend::Poll(_)) {
            inner.slots_dirty = true;
        } else {
            let maxfds = inner.maxfds;
            let _ = inner.backend.set_fd(fd, FdFlags::empty(), index, maxfds);
        }
        inner.free_indices.push(index);
        inner.active -= 1;
    }

    if let Some(rec) = inner.registry.get_mut(&fd) {
        rec.index = -1;
        rec.flags = FdFlags::empty();
        rec.handler = None;
    }

    if !inner.reuse_records {
        if polling {
            inner.pending_delete.push(fd);
        } else {
            inner.registry.remove(&fd);
        }
    }
}

fn invoke_handler(fd: RawFd, flags: FdFlags, handler: &FdHandler) {
    #[cfg(debug_assertions)]
    {
        let start = std::time::Instant::now();
        handler(flags);
        let elapsed = start.elapsed().as_millis();
        if elapsed > MAX_BLOCKING_MS {
            tracing::warn!(fd, elapsed_ms = elapsed as u64, "long blocking in handler");
        }
    }
    #[cfg(not(debug_assertions))]
    {
        let _ = fd;
        handler(flags);
    }
}

/// Translate the wait result into `(fd, flags)` pairs. The produced list is
/// immutable for the rest of the pass; dispatch re-validates each entry
/// against the registry before invoking its handler.
fn collect_ready(inner: &mut Inner, job: &mut WaitJob, n: usize) -> Vec<(RawFd, FdFlags)> {
    let mut ready = Vec::new();

    match job {
        WaitJob::Select(sel) => {
            if n == 0 {
                return ready;
            }
            for rec in inner.registry.values() {
                if rec.index < 0 || rec.flags.is_empty() {
                    continue;
                }
                let flags = sel.ready(rec.fd);
                if !flags.is_empty() {
                    ready.push((rec.fd, flags));
                }
            }
        }
        WaitJob::Poll(fds) => {
            for slot in fds.iter_mut() {
                if slot.fd < 0 || slot.revents == 0 {
                    continue;
                }
                let flags = crate::poll::poll_flags_from_revents(slot.revents);
                if slot.revents & libc::POLLNVAL != 0 {
                    tracing::warn!(fd = slot.fd, "poll: POLLNVAL");
                }
                slot.revents = 0;
                if !flags.is_empty() {
                    ready.push((slot.fd, flags));
                }
            }
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        WaitJob::Epoll(_, events) => {
            for ev in events.iter().take(n) {
                let event_bits = ev.events;
                let fd = ev.u64 as RawFd;
                let flags = epoll::flags_from_events(event_bits);
                if flags.is_empty() {
                    tracing::warn!(fd, "epoll: event with no mapped flags");
                    continue;
                }
                ready.push((fd, flags));
            }
        }
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "dragonfly",
            target_os = "openbsd"
        ))]
        WaitJob::Kqueue(_, evlist) => {
            for kev in evlist.iter().take(n) {
                let fd = kev.ident as RawFd;
                let flags = kqueue::flags_from_kevent(kev);
                if flags.is_empty() {
                    continue;
                }
                ready.push((fd, flags));
            }
        }
    }

    ready
}

/// Put moved-out wait buffers back into the backend. A method switch during
/// the wait leaves a different backend in place; stale buffers are dropped.
fn restore_job(inner: &mut Inner, job: WaitJob) {
    match (job, &mut inner.backend) {
        (WaitJob::Poll(fds), Backend::Poll(state)) => state.restore(fds),
        #[cfg(any(target_os = "linux", target_os = "android"))]
        (WaitJob::Epoll(_, events), Backend::Epoll(state)) => state.restore(events),
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "dragonfly",
            target_os = "openbsd"
        ))]
        (WaitJob::Kqueue(_, evlist), Backend::Kqueue(state)) => state.restore(evlist),
        _ => {}
    }
}

fn wait_error_is_benign(e: &Error) -> bool {
    if e.is_transient() {
        return true;
    }
    // Darwin kqueue occasionally reports a spurious bad descriptor.
    cfg!(target_os = "macos") && matches!(e, Error::BadDescriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::os::fd::AsRawFd;

    fn test_reactor(method: PollMethod) -> Arc<Reactor> {
        let re = Reactor::new();
        re.set_method(method).unwrap();
        re
    }

    #[test]
    fn attach_update_detach_net_count() {
        let re = test_reactor(PollMethod::Poll);
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let fd = sock.as_raw_fd();

        re.attach(fd, FdFlags::READ | FdFlags::WRITE, |_| {}).unwrap();
        assert_eq!(re.active_count(), 1);

        // Update in place: count unchanged.
        re.attach(fd, FdFlags::READ, |_| {}).unwrap();
        assert_eq!(re.active_count(), 1);

        re.detach(fd).unwrap();
        assert_eq!(re.active_count(), 0);
    }

    #[test]
    fn bad_descriptor_is_rejected() {
        let re = test_reactor(PollMethod::Poll);
        assert!(matches!(
            re.attach(-1, FdFlags::READ, |_| {}),
            Err(Error::BadDescriptor)
        ));
    }

    #[test]
    fn record_storage_is_reused_across_attaches() {
        let re = test_reactor(PollMethod::Poll);
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let fd = sock.as_raw_fd();

        re.attach(fd, FdFlags::READ, |_| {}).unwrap();
        let first = {
            let guard = re.inner.lock();
            let inner = guard.borrow();
            &*inner.registry[&fd] as *const FdRecord as usize
        };

        re.detach(fd).unwrap();
        re.attach(fd, FdFlags::WRITE, |_| {}).unwrap();

        let second = {
            let guard = re.inner.lock();
            let inner = guard.borrow();
            &*inner.registry[&fd] as *const FdRecord as usize
        };
        assert_eq!(first, second);
    }

    #[test]
    fn detach_frees_record_when_reuse_disabled() {
        let re = test_reactor(PollMethod::Poll);
        re.set_reuse(false);
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let fd = sock.as_raw_fd();

        re.attach(fd, FdFlags::READ, |_| {}).unwrap();
        re.detach(fd).unwrap();

        let guard = re.inner.lock();
        assert!(!guard.borrow().registry.contains_key(&fd));
    }

    #[test]
    fn method_switch_keeps_records_indexed() {
        let re = test_reactor(PollMethod::Select);
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let fd = sock.as_raw_fd();

        re.attach(fd, FdFlags::READ, |_| {}).unwrap();
        re.set_method(PollMethod::Poll).unwrap();

        assert_eq!(re.method(), Some(PollMethod::Poll));
        assert_eq!(re.active_count(), 1);
        let guard = re.inner.lock();
        assert!(guard.borrow().registry[&fd].index >= 0);
    }

    #[test]
    fn teardown_and_reattach() {
        let re = test_reactor(PollMethod::Poll);
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let fd = sock.as_raw_fd();

        re.attach(fd, FdFlags::READ, |_| {}).unwrap();
        re.set_max_fds(0).unwrap();
        // Backend resources are gone; the next attach sets them up again.
        re.attach(fd, FdFlags::READ, |_| {}).unwrap();
        assert_eq!(re.active_count(), 1);
    }

    #[test]
    fn timer_cancel_prevents_firing() {
        let re = test_reactor(PollMethod::Poll);
        let key = re.timer_start(10_000, || panic!("canceled timer fired"));
        assert!(re.timer_cancel(key));
        assert!(!re.timer_cancel(key));
    }

    #[test]
    fn check_rejects_foreign_thread_without_enter() {
        let re = test_reactor(PollMethod::Poll);
        assert!(re.check().is_ok());

        let re2 = re.clone();
        std::thread::spawn(move || {
            assert!(matches!(re2.check(), Err(Error::Permission)));
            let guard = re2.enter();
            assert!(re2.check().is_ok());
            drop(guard);
            assert!(matches!(re2.check(), Err(Error::Permission)));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn debug_dump_lists_descriptors() {
        let re = test_reactor(PollMethod::Poll);
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let fd = sock.as_raw_fd();
        re.attach(fd, FdFlags::READ, |_| {}).unwrap();

        let dump = re.debug_dump();
        assert!(dump.contains("method:  poll"));
        assert!(dump.contains(&format!("fd {} in use", fd)));
    }
}
