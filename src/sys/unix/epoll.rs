use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;
use std::{fmt, io, ptr};

use log::error;

use crate::event::{Interest, Ready};
use crate::selector::Strategy;
use crate::sys::{close_fd, syscall, timespec_from_duration, EVENTS_CAP};

/// System selector backed by `epoll`.
///
/// Two auxiliary descriptors are registered at construction: an `eventfd`
/// acting as the cross thread wake source and a `timerfd` implementing timed
/// waits. The `eventfd` is shared with [`Waker`] handles and stays open until
/// the last of those is dropped, `close` never touches it.
pub struct Selector {
    epfd: RawFd,
    timer: RawFd,
    wake: Arc<EventFd>,
    events: Vec<libc::epoll_event>,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let wake = EventFd::new()?;
        let epfd = syscall("epoll_create1", || unsafe {
            libc::epoll_create1(libc::EPOLL_CLOEXEC)
        })?;

        // From here on dropping `selector` cleans up the descriptors
        // acquired so far.
        let mut selector = Selector {
            epfd,
            timer: -1,
            wake: Arc::new(wake),
            events: Vec::with_capacity(EVENTS_CAP),
        };
        selector.timer = syscall("timerfd_create", || unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_CLOEXEC | libc::TFD_NONBLOCK)
        })?;

        let wake_fd = selector.wake.fd;
        selector.register(wake_fd, Interest::READABLE)?;
        let timer_fd = selector.timer;
        selector.register(timer_fd, Interest::READABLE)?;
        Ok(selector)
    }

    pub fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = new_epoll_event(fd, interest);
        self.epoll_ctl(libc::EPOLL_CTL_ADD, fd, &mut event)
    }

    pub fn reregister(&self, fd: RawFd, _old: Interest, interest: Interest) -> io::Result<()> {
        let mut event = new_epoll_event(fd, interest);
        self.epoll_ctl(libc::EPOLL_CTL_MOD, fd, &mut event)
    }

    pub fn deregister(&self, fd: RawFd, _old: Interest) -> io::Result<()> {
        // The event argument is ignored for `EPOLL_CTL_DEL`.
        self.epoll_ctl(libc::EPOLL_CTL_DEL, fd, ptr::null_mut())
    }

    fn epoll_ctl(&self, op: libc::c_int, fd: RawFd, event: *mut libc::epoll_event) -> io::Result<()> {
        syscall("epoll_ctl", || unsafe {
            libc::epoll_ctl(self.epfd, op, fd, event)
        }).map(|_| ())
    }

    /// Wait for events, filling the event buffer. Returns the number of
    /// events pulled, including wake and timer events.
    pub fn select(&mut self, strategy: Strategy) -> io::Result<usize> {
        let timeout_ms = match strategy {
            Strategy::Now => 0,
            Strategy::Block => -1,
            // A zero `it_value` would disarm the timer rather than fire it
            // immediately.
            Strategy::Timeout(timeout) if timeout.as_nanos() == 0 => 0,
            Strategy::Timeout(timeout) => {
                self.arm_timer(timeout)?;
                -1
            },
        };

        self.events.clear();
        let events_cap = self.events.capacity() as libc::c_int;
        let events_ptr = self.events.as_mut_ptr();
        let n_events = syscall("epoll_wait", || unsafe {
            libc::epoll_wait(self.epfd, events_ptr, events_cap, timeout_ms)
        })? as usize;
        // The kernel initialised the first `n_events` entries.
        unsafe { self.events.set_len(n_events) };
        Ok(n_events)
    }

    /// Interpret event `index` of the last `select` batch.
    ///
    /// Wake and timer events are consumed here and yield `None`, everything
    /// else maps to the descriptor and its folded readiness.
    pub fn ready_event(&self, index: usize) -> io::Result<Option<(RawFd, Ready)>> {
        let ep_event = self.events[index];
        let fd = ep_event.u64 as RawFd;
        if fd == self.wake.fd {
            self.wake.drain()?;
            Ok(None)
        } else if fd == self.timer {
            self.drain_timer()?;
            Ok(None)
        } else {
            Ok(Some((fd, ready_from(ep_event.events))))
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
        self.wake.write1()
    }

    pub fn waker(&self) -> Waker {
        Waker {
            fd: Arc::clone(&self.wake),
        }
    }

    /// Close the epoll and timer descriptors. The wake `eventfd` is left for
    /// the last [`Waker`] (or this selector) to close on drop, a concurrent
    /// `wake` may still be writing to it.
    pub fn close(&mut self) -> io::Result<()> {
        if self.timer != -1 {
            let timer = self.timer;
            self.timer = -1;
            close_fd("close", timer)?;
        }
        if self.epfd != -1 {
            let epfd = self.epfd;
            self.epfd = -1;
            close_fd("close", epfd)?;
        }
        Ok(())
    }

    fn arm_timer(&self, timeout: Duration) -> io::Result<()> {
        let timerspec = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: timespec_from_duration(timeout),
        };
        syscall("timerfd_settime", || unsafe {
            libc::timerfd_settime(self.timer, 0, &timerspec, ptr::null_mut())
        }).map(|_| ())
    }

    fn drain_timer(&self) -> io::Result<()> {
        let mut buf = [0; 8];
        match syscall("timerfd read", || unsafe {
            libc::read(self.timer, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        }) {
            Ok(_) => Ok(()),
            // Already drained, e.g. by an expiration left over from an
            // earlier timed wait.
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Selector")
            .field("epfd", &self.epfd)
            .field("timer", &self.timer)
            .field("wake", &self.wake)
            .finish()
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        for &fd in &[self.timer, self.epfd] {
            if fd != -1 {
                if let Err(err) = close_fd("close", fd) {
                    error!("error closing selector: {}", err);
                }
            }
        }
    }
}

const READ_FLAGS: u32 = (libc::EPOLLIN | libc::EPOLLERR | libc::EPOLLRDHUP) as u32;
const WRITE_FLAGS: u32 = (libc::EPOLLOUT | libc::EPOLLERR | libc::EPOLLRDHUP) as u32;

/// Convert an epoll event mask into folded readiness.
fn ready_from(ep_events: u32) -> Ready {
    Ready::new((ep_events & READ_FLAGS) != 0, (ep_events & WRITE_FLAGS) != 0)
}

fn new_epoll_event(fd: RawFd, interest: Interest) -> libc::epoll_event {
    libc::epoll_event {
        events: to_epoll_mask(interest),
        u64: fd as u64,
    }
}

fn to_epoll_mask(interest: Interest) -> u32 {
    // Errors and hangups are always monitored, epoll has no way to mask
    // them out. Level-triggered is the default.
    let mut mask = libc::EPOLLERR | libc::EPOLLRDHUP;
    if interest.is_readable() {
        mask |= libc::EPOLLIN;
    }
    if interest.is_writable() {
        mask |= libc::EPOLLOUT;
    }
    mask as u32
}

/// The wake source: a 64 bit counter where writes add and reads reset.
///
/// Writes and reads must be 8 bytes. A write of 1 makes the descriptor
/// readable until the counter is read, which is all the latching `wake`
/// needs.
#[derive(Debug)]
pub(crate) struct EventFd {
    fd: RawFd,
}

impl EventFd {
    fn new() -> io::Result<EventFd> {
        syscall("eventfd", || unsafe {
            libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK)
        }).map(|fd| EventFd { fd })
    }

    fn write1(&self) -> io::Result<()> {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match syscall("eventfd write", || unsafe {
            libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len())
        }) {
            Ok(_) => Ok(()),
            // The counter is saturated, a wake is already pending.
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn drain(&self) -> io::Result<()> {
        let mut buf = [0; 8];
        match syscall("eventfd read", || unsafe {
            libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        }) {
            Ok(_) => Ok(()),
            // Not written to since the last drain.
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        if let Err(err) = close_fd("close", self.fd) {
            error!("error closing wake eventfd: {}", err);
        }
    }
}

/// Linux waker backed by the selector's `eventfd`.
///
/// Holds shared ownership of the descriptor so that waking remains valid
/// while the selector itself is torn down.
#[derive(Clone, Debug)]
pub struct Waker {
    fd: Arc<EventFd>,
}

impl Waker {
    pub fn wake(&self) -> io::Result<()> {
        self.fd.write1()
    }
}
