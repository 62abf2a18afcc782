//! Readiness interests and delivered readiness state.

use std::fmt;
use std::ops::BitOr;

const READABLE: u8 = 1 << 0;
const WRITABLE: u8 = 1 << 1;

/// Interests used in registering.
///
/// Interests are used in [registering] handles with a [`Selector`], they
/// indicate what readiness should be monitored for. For example if a socket is
/// registered with [readable] interest and the socket becomes writable, no
/// event will be returned from [`wait`].
///
/// [`Interest::NONE`] is a valid registration: the descriptor stays in the
/// registration table but no readiness is asked for. On platforms that use
/// epoll the descriptor is still monitored for errors and hangups, as those
/// conditions cannot be masked out.
///
/// [registering]: crate::Selector::register
/// [`Selector`]: crate::Selector
/// [readable]: Interest::READABLE
/// [`wait`]: crate::Selector::wait
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct Interest(u8);

impl Interest {
    /// No interest, but keep the descriptor registered.
    pub const NONE: Interest = Interest(0);

    /// Readable interest.
    pub const READABLE: Interest = Interest(READABLE);

    /// Writable interest.
    pub const WRITABLE: Interest = Interest(WRITABLE);

    /// Both readable and writable interests.
    pub const BOTH: Interest = Interest(READABLE | WRITABLE);

    /// Returns true if the value includes readable interest.
    #[inline]
    pub fn is_readable(self) -> bool {
        (self.0 & READABLE) != 0
    }

    /// Returns true if the value includes writable interest.
    #[inline]
    pub fn is_writable(self) -> bool {
        (self.0 & WRITABLE) != 0
    }

    /// Returns true if the value is [`Interest::NONE`].
    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Interest {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Interest(self.0 | rhs.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Interest::NONE => f.write_str("NONE"),
            Interest::READABLE => f.write_str("READABLE"),
            Interest::WRITABLE => f.write_str("WRITABLE"),
            _ => f.write_str("READABLE | WRITABLE"),
        }
    }
}

/// The readiness state delivered with an event.
///
/// `Ready` is passed to the callback supplied to [`wait`], paired with the
/// [registration] the event belongs to. Errors and hangups are folded into
/// both readability and writability: the caller is waiting on at most one of
/// the two sides and must observe the condition on whichever side that is.
/// The subsequent read or write will surface the actual error.
///
/// [`wait`]: crate::Selector::wait
/// [registration]: crate::Registration
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct Ready(u8);

impl Ready {
    /// Readable readiness.
    pub const READABLE: Ready = Ready(READABLE);

    /// Writable readiness.
    pub const WRITABLE: Ready = Ready(WRITABLE);

    /// Both readable and writable readiness.
    pub const BOTH: Ready = Ready(READABLE | WRITABLE);

    pub(crate) fn new(readable: bool, writable: bool) -> Ready {
        let mut ready = 0;
        if readable {
            ready |= READABLE;
        }
        if writable {
            ready |= WRITABLE;
        }
        Ready(ready)
    }

    /// Returns true if the value includes readable readiness.
    #[inline]
    pub fn is_readable(self) -> bool {
        (self.0 & READABLE) != 0
    }

    /// Returns true if the value includes writable readiness.
    #[inline]
    pub fn is_writable(self) -> bool {
        (self.0 & WRITABLE) != 0
    }
}

impl BitOr for Ready {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Ready(self.0 | rhs.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => f.write_str("READABLE | WRITABLE"),
            (true, false) => f.write_str("READABLE"),
            (false, true) => f.write_str("WRITABLE"),
            (false, false) => f.write_str("(empty)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::event::{Interest, Ready};

    #[test]
    fn interest_flags() {
        assert!(Interest::READABLE.is_readable());
        assert!(!Interest::READABLE.is_writable());
        assert!(Interest::WRITABLE.is_writable());
        assert!(!Interest::WRITABLE.is_readable());
        assert!(Interest::BOTH.is_readable());
        assert!(Interest::BOTH.is_writable());
        assert!(Interest::NONE.is_none());
        assert!(!Interest::NONE.is_readable());
        assert!(!Interest::NONE.is_writable());
    }

    #[test]
    fn interest_bit_or() {
        assert_eq!(Interest::READABLE | Interest::WRITABLE, Interest::BOTH);
        assert_eq!(Interest::NONE | Interest::READABLE, Interest::READABLE);
        assert_eq!(Interest::BOTH | Interest::BOTH, Interest::BOTH);
    }

    #[test]
    fn interest_fmt_debug() {
        assert_eq!(format!("{:?}", Interest::NONE), "NONE");
        assert_eq!(format!("{:?}", Interest::READABLE), "READABLE");
        assert_eq!(format!("{:?}", Interest::WRITABLE), "WRITABLE");
        assert_eq!(format!("{:?}", Interest::BOTH), "READABLE | WRITABLE");
    }

    #[test]
    fn ready_flags() {
        assert!(Ready::READABLE.is_readable());
        assert!(!Ready::READABLE.is_writable());
        assert!(Ready::WRITABLE.is_writable());
        assert!(!Ready::WRITABLE.is_readable());

        let ready = Ready::new(true, true);
        assert!(ready.is_readable());
        assert!(ready.is_writable());
        assert_eq!(ready, Ready::READABLE | Ready::WRITABLE);
        assert_eq!(ready, Ready::BOTH);
    }

    #[test]
    fn ready_fmt_debug() {
        assert_eq!(format!("{:?}", Ready::READABLE), "READABLE");
        assert_eq!(format!("{:?}", Ready::WRITABLE), "WRITABLE");
        assert_eq!(format!("{:?}", Ready::new(true, true)), "READABLE | WRITABLE");
        assert_eq!(format!("{:?}", Ready::new(false, false)), "(empty)");
    }
}
