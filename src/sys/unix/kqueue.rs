use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::{fmt, io, ptr};

use log::error;

use crate::event::{Interest, Ready};
use crate::selector::Strategy;
use crate::sys::{close_fd, syscall, syscall_error, timespec_from_duration, EVENTS_CAP};

/// Identity of the `EVFILT_USER` event used as wake target.
const WAKER_IDENT: libc::uintptr_t = 0;

/// System selector backed by `kqueue`.
///
/// kqueue has no per descriptor interest mask, instead up to two filters
/// (`EVFILT_READ` and `EVFILT_WRITE`) are kept per descriptor and every
/// interest change is reconciled against the previously installed pair, see
/// [`interest_changes`].
///
/// The kqueue descriptor doubles as the wake target (a user filter with
/// identity [`WAKER_IDENT`]) and is therefore shared with [`Waker`] handles;
/// it is closed when the last of those drops, `close` never touches it.
pub struct Selector {
    kq: Arc<KqueueFd>,
    events: Vec<libc::kevent>,
}

// The `udata` pointers in the event buffer are always null and never
// dereferenced.
unsafe impl Send for Selector {}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let kq = syscall("kqueue", || unsafe { libc::kqueue() })?;
        let selector = Selector {
            kq: Arc::new(KqueueFd { fd: kq }),
            events: Vec::with_capacity(EVENTS_CAP),
        };

        // Install the wake target. `EV_CLEAR` resets the filter's state on
        // each delivery so a wake is latched until the next wait.
        let changes = [new_kevent(WAKER_IDENT, libc::EVFILT_USER, libc::EV_ADD | libc::EV_CLEAR, 0)];
        kevent_apply(selector.kq.fd, &changes)?;
        Ok(selector)
    }

    pub fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let (changes, n_changes) = interest_changes(fd, None, interest);
        kevent_apply(self.kq.fd, &changes[..n_changes])
    }

    pub fn reregister(&self, fd: RawFd, old: Interest, interest: Interest) -> io::Result<()> {
        let (changes, n_changes) = interest_changes(fd, Some(old), interest);
        kevent_apply(self.kq.fd, &changes[..n_changes])
    }

    pub fn deregister(&self, fd: RawFd, old: Interest) -> io::Result<()> {
        let (changes, n_changes) = interest_changes(fd, Some(old), Interest::NONE);
        kevent_apply(self.kq.fd, &changes[..n_changes])
    }

    /// Wait for events, filling the event buffer. Returns the number of
    /// events pulled, including wake events.
    pub fn select(&mut self, strategy: Strategy) -> io::Result<usize> {
        let timespec = match strategy {
            Strategy::Block => None,
            Strategy::Now => Some(libc::timespec { tv_sec: 0, tv_nsec: 0 }),
            Strategy::Timeout(timeout) => Some(timespec_from_duration(timeout)),
        };
        let timespec_ptr = timespec
            .as_ref()
            .map(|timespec| timespec as *const libc::timespec)
            .unwrap_or_else(ptr::null);

        self.events.clear();
        let events_cap = self.events.capacity() as libc::c_int;
        let events_ptr = self.events.as_mut_ptr();
        let n_events = syscall("kevent", || unsafe {
            libc::kevent(self.kq.fd, ptr::null(), 0, events_ptr, events_cap, timespec_ptr)
        })? as usize;
        // The kernel initialised the first `n_events` entries.
        unsafe { self.events.set_len(n_events) };
        Ok(n_events)
    }

    /// Interpret event `index` of the last `select` batch.
    ///
    /// Wake events yield `None`, everything else maps to the descriptor and
    /// the readiness of the filter that fired.
    pub fn ready_event(&self, index: usize) -> io::Result<Option<(RawFd, Ready)>> {
        let kevent = self.events[index];
        match kevent.filter {
            libc::EVFILT_USER => Ok(None),
            libc::EVFILT_READ => Ok(Some((kevent.ident as RawFd, Ready::new(true, false)))),
            libc::EVFILT_WRITE => Ok(Some((kevent.ident as RawFd, Ready::new(false, true)))),
            // No other filter is ever installed.
            filter => unreachable!("unexpected kqueue filter: {}", filter),
        }
    }

    /// Called after each dispatched batch of `n_events` events.
    ///
    /// A full buffer very likely means more events were ready than could be
    /// pulled, so the capacity is doubled for the next wait. The buffer never
    /// shrinks.
    pub fn after_batch(&mut self, n_events: usize) {
        if n_events == self.events.capacity() {
            let capacity = self.events.capacity();
            self.events = Vec::with_capacity(2 * capacity);
        }
    }

    pub fn wake(&self) -> io::Result<()> {
        trigger_wake(self.kq.fd)
    }

    pub fn waker(&self) -> Waker {
        Waker {
            kq: Arc::clone(&self.kq),
        }
    }

    /// The kqueue descriptor doubles as the wake target, closing it here
    /// would race with an in-flight `wake` from another thread. It is closed
    /// once the last reference (this selector or a [`Waker`]) drops.
    pub fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.kq.fd
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Selector")
            .field("kq", &self.kq)
            .finish()
    }
}

#[derive(Debug)]
pub(crate) struct KqueueFd {
    fd: RawFd,
}

impl Drop for KqueueFd {
    fn drop(&mut self) {
        if let Err(err) = close_fd("close", self.fd) {
            error!("error closing kqueue: {}", err);
        }
    }
}

/// Compute the minimal change list moving a descriptor from the `old`
/// interest (`None` for a fresh registration) to `interest`.
///
/// Filters only appear in the list when their installed state changes, and
/// fresh registrations never emit `EV_DELETE` (kqueue would fail the change
/// with `ENOENT`).
fn interest_changes(fd: RawFd, old: Option<Interest>, interest: Interest) -> ([libc::kevent; 2], usize) {
    let mut changes = [new_kevent(0, 0, 0, 0); 2];
    let mut n_changes = 0;

    let was_readable = old.map_or(false, Interest::is_readable);
    let was_writable = old.map_or(false, Interest::is_writable);
    let ident = fd as libc::uintptr_t;

    if interest.is_readable() && !was_readable {
        changes[n_changes] = new_kevent(ident, libc::EVFILT_READ, libc::EV_ADD, 0);
        n_changes += 1;
    } else if !interest.is_readable() && was_readable {
        changes[n_changes] = new_kevent(ident, libc::EVFILT_READ, libc::EV_DELETE, 0);
        n_changes += 1;
    }

    if interest.is_writable() && !was_writable {
        changes[n_changes] = new_kevent(ident, libc::EVFILT_WRITE, libc::EV_ADD, 0);
        n_changes += 1;
    } else if !interest.is_writable() && was_writable {
        changes[n_changes] = new_kevent(ident, libc::EVFILT_WRITE, libc::EV_DELETE, 0);
        n_changes += 1;
    }

    (changes, n_changes)
}

const fn new_kevent(ident: libc::uintptr_t, filter: i16, flags: u16, fflags: u32) -> libc::kevent {
    libc::kevent {
        ident,
        filter,
        flags,
        fflags,
        data: 0,
        udata: ptr::null_mut(),
    }
}

/// Apply a change list without pulling any events, so that a failing change
/// surfaces from this call instead of being mixed into event delivery.
fn kevent_apply(kq: RawFd, changes: &[libc::kevent]) -> io::Result<()> {
    if changes.is_empty() {
        // E.g. a registration with `Interest::NONE`, nothing to install.
        return Ok(());
    }

    let ok = unsafe {
        libc::kevent(kq, changes.as_ptr(), changes.len() as libc::c_int,
            ptr::null_mut(), 0, ptr::null())
    };
    if ok == -1 {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            // Per the kqueue contract: "When kevent() call fails with EINTR
            // error, all changes in the changelist have been applied".
            Some(libc::EINTR) => Ok(()),
            Some(errno) => Err(syscall_error("kevent", errno)),
            None => Err(err),
        }
    } else {
        Ok(())
    }
}

fn trigger_wake(kq: RawFd) -> io::Result<()> {
    let changes = [new_kevent(WAKER_IDENT, libc::EVFILT_USER, 0, libc::NOTE_TRIGGER)];
    kevent_apply(kq, &changes)
}

/// Waker backed by the kqueue's user filter.
///
/// Holds shared ownership of the kqueue descriptor so that waking remains
/// valid while the selector itself is torn down.
#[derive(Clone, Debug)]
pub struct Waker {
    kq: Arc<KqueueFd>,
}

impl Waker {
    pub fn wake(&self) -> io::Result<()> {
        trigger_wake(self.kq.fd)
    }
}
