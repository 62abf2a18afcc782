//! Collection of testing utilities.

// Not all functions are used in all tests, causing warnings of unused
// functions while other tests are actually using them.
#![allow(dead_code)]

use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{fmt, io};

use readyq::{Interest, Ready, Registration, Selectable, Selector, Strategy};

/// Allowed margin for deadlines to be overrun.
pub const TIMEOUT_MARGIN: Duration = Duration::from_millis(100);

/// Initialise the test setup, things like logging etc.
pub fn init() {
    let env = env_logger::Env::new().filter("LOG_LEVEL");
    // Logger could already be set, so we ignore the result.
    drop(env_logger::try_init_from_env(env));
}

/// Initialise the test setup (same as `init`) and create a `Selector` at the
/// same time.
pub fn init_with_selector() -> Selector<TestRegistration> {
    init();
    Selector::new().expect("unable to create selector")
}

/// The registration type used throughout the tests: an id to recognise the
/// descriptor by, plus the interest field the selector keeps up to date.
#[derive(Debug, Eq, PartialEq)]
pub struct TestRegistration {
    pub id: usize,
    pub interest: Interest,
}

impl Registration for TestRegistration {
    fn interest(&self) -> Interest {
        self.interest
    }

    fn set_interest(&mut self, interest: Interest) {
        self.interest = interest;
    }
}

/// Registration factory for `Selector::register`.
pub fn registration(id: usize) -> impl FnOnce(Interest) -> TestRegistration {
    move |interest| TestRegistration { id, interest }
}

/// Wait with `strategy` and return all dispatched events as `(id, ready)`
/// pairs.
pub fn collect_events(selector: &mut Selector<TestRegistration>, strategy: Strategy) -> Vec<(usize, Ready)> {
    let mut events = Vec::new();
    selector.wait(strategy, |ready, registration| {
        events.push((registration.id, ready));
        Ok(())
    }).expect("unable to wait for events");
    events
}

/// Wait with `strategy` and assert that no events at all are dispatched.
pub fn expect_no_events(selector: &mut Selector<TestRegistration>, strategy: Strategy) {
    let events = collect_events(selector, strategy);
    assert!(events.is_empty(), "got unexpected events: {:?}", events);
}

/// Assert that `result` is an error and the formatted error (via
/// `fmt::Display`) contains `expected_msg`.
pub fn assert_error<T, E: fmt::Display>(result: Result<T, E>, expected_msg: &str) {
    match result {
        Ok(_) => panic!("unexpected OK result"),
        Err(err) => assert!(err.to_string().contains(expected_msg),
            "wanted: {}, got: {}", expected_msg, err),
    }
}

/// An owned, non-blocking descriptor for use in tests; one end of a pipe or
/// of a unix socket pair.
#[derive(Debug)]
pub struct TestFd {
    fd: RawFd,
}

impl TestFd {
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl AsRawFd for TestFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Selectable for TestFd {
    fn is_open(&self) -> bool {
        self.fd != -1
    }
}

impl Drop for TestFd {
    fn drop(&mut self) {
        unsafe { drop(libc::close(self.fd)) };
    }
}

/// A `Selectable` whose descriptor has already been closed.
pub fn closed_fd() -> TestFd {
    TestFd { fd: -1 }
}

/// Create a new non-blocking unix pipe, returning `(read end, write end)`.
pub fn new_pipe() -> (TestFd, TestFd) {
    let mut fds: [RawFd; 2] = [-1, -1];
    assert_ne!(unsafe { libc::pipe(fds.as_mut_ptr()) }, -1,
        "unable to create pipe: {}", io::Error::last_os_error());
    for &fd in &fds {
        set_nonblocking(fd);
    }
    (TestFd { fd: fds[0] }, TestFd { fd: fds[1] })
}

/// Create a connected pair of non-blocking unix stream sockets.
pub fn socket_pair() -> (TestFd, TestFd) {
    let mut fds: [RawFd; 2] = [-1, -1];
    assert_ne!(unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) }, -1,
        "unable to create socket pair: {}", io::Error::last_os_error());
    for &fd in &fds {
        set_nonblocking(fd);
    }
    (TestFd { fd: fds[0] }, TestFd { fd: fds[1] })
}

fn set_nonblocking(fd: RawFd) {
    assert_ne!(unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) }, -1,
        "unable to make descriptor non-blocking: {}", io::Error::last_os_error());
}
