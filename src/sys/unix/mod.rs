use std::cmp::min;
use std::os::unix::io::RawFd;
use std::time::Duration;
use std::{error, fmt, io};

#[cfg(target_os = "linux")]
mod epoll;

#[cfg(target_os = "linux")]
pub use self::epoll::{Selector, Waker};

#[cfg(any(target_os = "freebsd", target_os = "macos"))]
mod kqueue;

#[cfg(any(target_os = "freebsd", target_os = "macos"))]
pub use self::kqueue::{Selector, Waker};

/// Initial capacity of the event buffer, doubled whenever a single wait
/// saturates it.
pub(crate) const EVENTS_CAP: usize = 64;

/// Error returned when a system call fails for a non-transient reason.
///
/// The payload of the [`io::Error`]s returned by this crate, it carries the
/// raw OS error next to a label describing the call that failed. Retrieve it
/// via [`io::Error::get_ref`] and a downcast.
#[derive(Debug)]
pub struct SyscallError {
    label: &'static str,
    errno: i32,
}

impl SyscallError {
    /// A label describing the system call that failed, e.g. `"epoll_ctl"`.
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// The raw OS error the call failed with.
    pub fn errno(&self) -> i32 {
        self.errno
    }
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} failed: {}", self.label, io::Error::from_raw_os_error(self.errno))
    }
}

impl error::Error for SyscallError {}

/// Create an `io::Error` with a `SyscallError` payload, keeping the error
/// kind derived from `errno`.
pub(crate) fn syscall_error(label: &'static str, errno: i32) -> io::Error {
    let kind = io::Error::from_raw_os_error(errno).kind();
    io::Error::new(kind, SyscallError { label, errno })
}

/// Result types of system calls that signal failure with -1.
pub(crate) trait IsMinusOne: Copy {
    fn is_minus_one(self) -> bool;
}

impl IsMinusOne for i32 {
    fn is_minus_one(self) -> bool {
        self == -1
    }
}

impl IsMinusOne for isize {
    fn is_minus_one(self) -> bool {
        self == -1
    }
}

/// Invoke the system call in `f`, retrying when interrupted.
///
/// Any other failure is converted into a structured error carrying `label`
/// and the OS error code.
pub(crate) fn syscall<T, F>(label: &'static str, mut f: F) -> io::Result<T>
    where T: IsMinusOne,
          F: FnMut() -> T,
{
    loop {
        let result = f();
        if !result.is_minus_one() {
            return Ok(result);
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(errno) => return Err(syscall_error(label, errno)),
            None => return Err(err),
        }
    }
}

/// Close a file descriptor.
///
/// `EINTR` is treated as success rather than retried: the state of the
/// descriptor is undefined after an interrupted close and closing it again
/// could close a descriptor opened by other code in the meantime.
pub(crate) fn close_fd(label: &'static str, fd: RawFd) -> io::Result<()> {
    if unsafe { libc::close(fd) } == -1 {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => Ok(()),
            Some(errno) => Err(syscall_error(label, errno)),
            None => Err(err),
        }
    } else {
        Ok(())
    }
}

/// Convert a duration into a `timespec`, saturating instead of overflowing
/// the seconds field.
pub(crate) fn timespec_from_duration(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: min(duration.as_secs(), libc::time_t::MAX as u64) as libc::time_t,
        // `Duration::subsec_nanos` is always below one billion, making the
        // cast safe on platforms where C's long is 32 bits.
        tv_nsec: libc::c_long::from(duration.subsec_nanos() as i32),
    }
}
