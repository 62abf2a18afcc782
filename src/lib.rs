//! A low-level I/O readiness selector, the portable core of an event loop.
//!
//! The [`Selector`] multiplexes readiness notifications for many file
//! descriptors onto a single waiting thread, directly on top of the
//! operating system's readiness primitives: epoll on Linux and kqueue on
//! FreeBSD and macOS.
//!
//! Using it follows a simple cycle. The owning thread [registers]
//! descriptors it is interested in, attaching a [registration] of its own
//! choosing to each, then repeatedly calls [`wait`] which blocks until one
//! or more descriptors become ready and dispatches an event per descriptor
//! to a callback. Other threads may interrupt a blocked wait at any time
//! through a [`Waker`]. Do this in a loop and you've got yourself an event
//! loop.
//!
//! [registers]: Selector::register
//! [registration]: Registration
//! [`wait`]: Selector::wait
//!
//! What this crate deliberately does **not** provide: buffered I/O, protocol
//! framing, timers beyond the per-wait deadline of
//! [`Strategy::Timeout`], descriptor creation and thread pools. Those belong
//! to the layers above and below.
//!
//! # Threading
//!
//! The selector is single threaded by design: `register`, `reregister`,
//! `deregister`, `wait`, `close` and `close_gently` must all be called from
//! the one thread that owns the selector. The only cross thread operation is
//! waking. [`Waker`] handles hold shared ownership of the wake source, so a
//! wake can never race the teardown of the selector, without any lock on
//! either side.
//!
//! # Examples
//!
//! An event loop over a listening socket.
//!
//! ```
//! use std::net::TcpListener;
//! use std::os::unix::io::AsRawFd;
//!
//! use readyq::{Interest, Registration, SelectableFd, Selector, Strategy};
//!
//! // The context this event loop attaches to every registered descriptor.
//! struct Connection {
//!     id: usize,
//!     interest: Interest,
//! }
//!
//! impl Registration for Connection {
//!     fn interest(&self) -> Interest { self.interest }
//!     fn set_interest(&mut self, interest: Interest) { self.interest = interest; }
//! }
//!
//! # fn main() -> std::io::Result<()> {
//! let listener = TcpListener::bind("127.0.0.1:0")?;
//!
//! let mut selector: Selector<Connection> = Selector::new()?;
//!
//! // Monitor the listener for incoming connections.
//! let listener_fd = listener.as_raw_fd();
//! selector.register(&SelectableFd(&listener_fd), Interest::READABLE,
//!     |interest| Connection { id: 0, interest })?;
//!
//! // The event loop. A real loop would use `Strategy::Block` and run until
//! // told to stop.
//! selector.wait(Strategy::Now, |ready, connection| {
//!     if ready.is_readable() && connection.id == 0 {
//!         // The listener is ready to accept.
//!     }
//!     Ok(())
//! })?;
//!
//! selector.close()
//! # }
//! ```

#![warn(anonymous_parameters,
        bare_trait_objects,
        missing_debug_implementations,
        missing_docs,
        trivial_casts,
        trivial_numeric_casts,
        unused_extern_crates,
        unused_import_braces,
        unused_qualifications,
        unused_results,
        variant_size_differences,
)]

// Disallow warnings when running tests.
#![cfg_attr(test, deny(warnings))]

// Disallow warnings in examples, we want to set a good example after all.
#![doc(test(attr(deny(warnings))))]

mod selector;
mod sys;

pub mod event;

pub use crate::event::{Interest, Ready};
pub use crate::selector::{Registration, Selectable, SelectableFd, Selector, Strategy, Waker};
pub use crate::sys::SyscallError;
