//! The selector, its registration table and the contracts it consumes.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{fmt, io};

use log::trace;

use crate::event::{Interest, Ready};
use crate::sys;

/// A handle that can be registered with a [`Selector`].
///
/// Implementations are always backed by a system handle, e.g. a socket or a
/// pipe. The descriptor must stay stable for the lifetime of the
/// registration; [`is_open`] must return true when the handle is passed to
/// the selector.
///
/// [`is_open`]: Selectable::is_open
pub trait Selectable: AsRawFd {
    /// Whether or not the underlying descriptor is open.
    fn is_open(&self) -> bool;
}

/// Adapter for a `RawFd` providing a [`Selectable`] implementation.
///
/// `SelectableFd` borrows the descriptor, it does **not** take ownership and
/// will not close it. The caller is responsible for only constructing it
/// around open descriptors.
///
/// # Examples
///
/// ```
/// use std::net::TcpListener;
/// use std::os::unix::io::AsRawFd;
///
/// use readyq::{Interest, Selector, SelectableFd};
///
/// # fn main() -> std::io::Result<()> {
/// struct Token {
///     interest: Interest,
/// }
///
/// impl readyq::Registration for Token {
///     fn interest(&self) -> Interest { self.interest }
///     fn set_interest(&mut self, interest: Interest) { self.interest = interest; }
/// }
///
/// let listener = TcpListener::bind("127.0.0.1:0")?;
/// let mut selector: Selector<Token> = Selector::new()?;
///
/// let fd = listener.as_raw_fd();
/// selector.register(&SelectableFd(&fd), Interest::READABLE,
///     |interest| Token { interest })?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SelectableFd<'a>(pub &'a RawFd);

impl<'a> AsRawFd for SelectableFd<'a> {
    fn as_raw_fd(&self) -> RawFd {
        *self.0
    }
}

impl<'a> Selectable for SelectableFd<'a> {
    fn is_open(&self) -> bool {
        true
    }
}

/// Per registration context stored in the selector.
///
/// The selector is parameterised by a registration type so that an event
/// loop can attach whatever it needs to find its way back from an event to
/// the owning channel. The only requirement is access to the interest
/// currently installed in the kernel: the selector keeps that field in sync
/// and reads it back when reconciling interest changes.
pub trait Registration {
    /// The interest currently installed for this registration.
    fn interest(&self) -> Interest;

    /// Update the stored interest. Only called by the selector, right after
    /// the kernel accepted the matching change.
    fn set_interest(&mut self, interest: Interest);
}

/// How [`wait`] should block.
///
/// [`wait`]: Selector::wait
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Strategy {
    /// Block until an event or a [wake] arrives.
    ///
    /// [wake]: Selector::wake
    Block,
    /// Never block, only dispatch events that are already ready.
    Now,
    /// Block like [`Strategy::Block`], but return after the given duration
    /// even if nothing happened.
    Timeout(Duration),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    Open,
    Closing,
    Closed,
}

/// I/O readiness selector, multiplexing any number of registered
/// descriptors onto a single waiting thread.
///
/// The selector is the portable core of an event loop: descriptors are
/// [registered] with an [`Interest`], [`wait`] blocks until one or more of
/// them become ready (or a deadline or a [wake] occurs) and dispatches each
/// event to a callback together with the registration supplied at
/// registration time.
///
/// All operations except [`wake`] (and [`Waker::wake`]) must be called from
/// the single owning thread; the selector is deliberately not thread safe
/// for them.
///
/// [registered]: Selector::register
/// [`wait`]: Selector::wait
/// [wake]: Selector::wake
///
/// # Examples
///
/// ```
/// use readyq::{Interest, Registration, Selector, Strategy};
///
/// struct Token {
///     interest: Interest,
/// }
///
/// impl Registration for Token {
///     fn interest(&self) -> Interest { self.interest }
///     fn set_interest(&mut self, interest: Interest) { self.interest = interest; }
/// }
///
/// # fn main() -> std::io::Result<()> {
/// let mut selector: Selector<Token> = Selector::new()?;
///
/// // A waker can be moved to any thread and used to interrupt `wait`.
/// let waker = selector.waker();
/// waker.wake()?;
///
/// // The wake is consumed by the selector itself, no events are delivered
/// // for it.
/// selector.wait(Strategy::Block, |_ready, _token| Ok(()))?;
///
/// selector.close()
/// # }
/// ```
pub struct Selector<R> {
    sys: sys::Selector,
    registrations: HashMap<RawFd, R>,
    state: State,
}

impl<R> Selector<R>
    where R: Registration,
{
    /// Create a new selector.
    ///
    /// This acquires all OS resources the selector needs, e.g. the epoll
    /// descriptor plus the wake and timer descriptors on Linux, and returns
    /// the selector in the open state.
    pub fn new() -> io::Result<Selector<R>> {
        let sys = sys::Selector::new()?;
        Ok(Selector {
            sys,
            registrations: HashMap::new(),
            state: State::Open,
        })
    }

    /// Register `handle` with the selector.
    ///
    /// `factory` is called with the initial interest to build the
    /// registration that will be delivered with every event for this
    /// descriptor. At most one registration per descriptor may be live at a
    /// time; registering a descriptor that is already present is an error.
    ///
    /// The kernel is updated first and the registration table second, so a
    /// kernel failure leaves the table untouched.
    pub fn register<S, F>(&mut self, handle: &S, interest: Interest, factory: F) -> io::Result<()>
        where S: Selectable + ?Sized,
              F: FnOnce(Interest) -> R,
    {
        self.ensure_open()?;
        let fd = selectable_fd(handle)?;
        trace!("registering: fd={}, interest={:?}", fd, interest);

        if self.registrations.contains_key(&fd) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists,
                "descriptor is already registered"));
        }

        self.sys.register(fd, interest)?;
        let existing = self.registrations.insert(fd, factory(interest));
        debug_assert!(existing.is_none());
        Ok(())
    }

    /// Change the interest of an already registered `handle`.
    ///
    /// The new interest fully overrides the previous one. The previous
    /// interest is taken from the registration table, not from the caller,
    /// as it must match what is installed in the kernel.
    pub fn reregister<S>(&mut self, handle: &S, interest: Interest) -> io::Result<()>
        where S: Selectable + ?Sized,
    {
        self.ensure_open()?;
        let fd = selectable_fd(handle)?;
        trace!("reregistering: fd={}, interest={:?}", fd, interest);

        let registration = self.registrations.get_mut(&fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound,
                "descriptor is not registered"))?;
        self.sys.reregister(fd, registration.interest(), interest)?;
        registration.set_interest(interest);
        Ok(())
    }

    /// Remove the registration of `handle`.
    ///
    /// No further events will be dispatched for the descriptor, including
    /// events the kernel already queued. Deregistering a descriptor that is
    /// not registered is a no-op.
    pub fn deregister<S>(&mut self, handle: &S) -> io::Result<()>
        where S: Selectable + ?Sized,
    {
        self.ensure_open()?;
        let fd = selectable_fd(handle)?;
        trace!("deregistering: fd={}", fd);

        let old = match self.registrations.get(&fd) {
            Some(registration) => registration.interest(),
            None => return Ok(()),
        };
        self.sys.deregister(fd, old)?;
        let _ = self.registrations.remove(&fd);
        Ok(())
    }

    /// Wait for readiness events and dispatch them to `handler`.
    ///
    /// Depending on `strategy` this blocks indefinitely, not at all, or at
    /// most for a given duration, see [`Strategy`]. Each event carries the
    /// folded [`Ready`] state and the registration of the descriptor it
    /// belongs to. Events are dispatched in the order the kernel reports
    /// them.
    ///
    /// An error returned by `handler` propagates immediately and the rest of
    /// the batch is discarded; as all registrations are level-triggered the
    /// kernel reports the dropped readiness again on the next wait.
    pub fn wait<F>(&mut self, strategy: Strategy, mut handler: F) -> io::Result<()>
        where F: FnMut(Ready, &mut R) -> io::Result<()>,
    {
        self.ensure_open()?;
        trace!("waiting for events: strategy={:?}", strategy);

        let n_events = self.sys.select(strategy)?;
        let result = self.dispatch(n_events, &mut handler);
        self.sys.after_batch(n_events);
        result
    }

    fn dispatch<F>(&mut self, n_events: usize, handler: &mut F) -> io::Result<()>
        where F: FnMut(Ready, &mut R) -> io::Result<()>,
    {
        for index in 0..n_events {
            if let Some((fd, ready)) = self.sys.ready_event(index)? {
                // kqueue may still deliver events queued before a
                // deregistration, the lookup misses and the event is
                // dropped.
                if let Some(registration) = self.registrations.get_mut(&fd) {
                    handler(ready, registration)?;
                }
            }
        }
        Ok(())
    }

    /// Cause the current or next [`wait`] to return promptly.
    ///
    /// Callable from any thread and in any selector state, also concurrently
    /// with `wait`; it takes no locks. The signal is latched: waking a
    /// selector that is not waiting makes the next wait return immediately.
    /// For waking from other threads see [`waker`].
    ///
    /// [`wait`]: Selector::wait
    /// [`waker`]: Selector::waker
    pub fn wake(&self) -> io::Result<()> {
        self.sys.wake()
    }

    /// Create a [`Waker`] handle for this selector.
    ///
    /// The handle is cheap to clone, can be moved to and used from any
    /// thread and keeps the wake source alive on its own: waking through a
    /// handle is valid even after the selector is closed or dropped.
    pub fn waker(&self) -> Waker {
        Waker {
            inner: self.sys.waker(),
        }
    }

    /// Close the selector.
    ///
    /// Drops all registrations and closes the OS resources that no other
    /// thread can be touching; the wake source stays open until the last
    /// reference to it (the selector or a [`Waker`]) is dropped, so that a
    /// concurrent [`wake`] never races a close. After closing, every
    /// operation except `wake` fails.
    ///
    /// [`wake`]: Selector::wake
    pub fn close(&mut self) -> io::Result<()> {
        self.ensure_open()?;
        trace!("closing selector");

        self.state = State::Closing;
        self.registrations.clear();
        let result = self.sys.close();
        self.state = State::Closed;
        result
    }

    /// Gently close all registrations.
    ///
    /// Drains the registration table, removing each descriptor's interest
    /// from the kernel and handing the registration to `close_registration`,
    /// the caller's hook to close the owning channel. All registrations are
    /// attempted even when one fails; the first error is returned. The
    /// selector itself stays open, follow up with [`close`].
    ///
    /// [`close`]: Selector::close
    pub fn close_gently<F>(&mut self, mut close_registration: F) -> io::Result<()>
        where F: FnMut(&mut R) -> io::Result<()>,
    {
        self.ensure_open()?;
        trace!("closing {} registrations", self.registrations.len());

        let mut result = Ok(());
        for (fd, mut registration) in self.registrations.drain() {
            let closed = self.sys.deregister(fd, registration.interest())
                .and_then(|()| close_registration(&mut registration));
            if let Err(err) = closed {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    fn ensure_open(&self) -> io::Result<()> {
        match self.state {
            State::Open => Ok(()),
            State::Closing | State::Closed => Err(io::Error::new(io::ErrorKind::Other,
                "selector is not open")),
        }
    }
}

impl<R> AsRawFd for Selector<R> {
    /// The descriptor of the OS readiness handle. Invalid after [`close`].
    ///
    /// [`close`]: Selector::close
    fn as_raw_fd(&self) -> RawFd {
        self.sys.as_raw_fd()
    }
}

impl<R> fmt::Debug for Selector<R> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Selector")
            .field("sys", &self.sys)
            .field("registrations", &self.registrations.len())
            .field("state", &self.state)
            .finish()
    }
}

/// Cross thread wake handle for a [`Selector`].
///
/// Created via [`Selector::waker`]. The handle shares ownership of the
/// selector's wake source, so waking stays memory safe no matter how the
/// selector teardown interleaves with it: the wake descriptor is only closed
/// after the last handle is gone.
#[derive(Clone, Debug)]
pub struct Waker {
    inner: sys::Waker,
}

impl Waker {
    /// Cause the selector's current or next wait to return promptly, see
    /// [`Selector::wake`].
    pub fn wake(&self) -> io::Result<()> {
        self.inner.wake()
    }
}

fn selectable_fd<S>(handle: &S) -> io::Result<RawFd>
    where S: Selectable + ?Sized,
{
    if handle.is_open() {
        Ok(handle.as_raw_fd())
    } else {
        Err(io::Error::new(io::ErrorKind::Other, "handle is not open"))
    }
}
