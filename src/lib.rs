//! demi-epoll - Berkeley sockets + epoll over a token-based bypass backend.
//!
//! This crate lets unmodified event-loop applications (echo servers, HTTP
//! servers, reverse proxies) run against a kernel-bypass I/O stack whose
//! native contract is asynchronous: operations are submitted, return an
//! opaque queue token, and complete later through a token-indexed wait. The
//! shim translates between the two worlds:
//!
//! - A per-socket state machine keeps at most one in-flight accept, receive,
//!   and send against the backend, surfacing `EWOULDBLOCK` whenever a
//!   submission has to ride a token.
//! - A readiness multiplexer composes outstanding backend tokens with a host
//!   kernel epoll descriptor and reports unified level-triggered events.
//! - The descriptor number space is partitioned so a single integer handle
//!   names either a bypass socket, a bypass epoll set, or an untouched host
//!   kernel fd, and every call routes itself.
//!
//! # Quick start
//!
//! ```ignore
//! use demi_epoll::{CtlOp, Event, Interest, Stack};
//! use demi_epoll::testkit::MemBackend;
//!
//! let mut stack = Stack::new(MemBackend::new());
//! let listener = stack.socket(libc::AF_INET, libc::SOCK_STREAM, 0)?;
//! stack.bind(listener, "127.0.0.1:2137".parse()?)?;
//! stack.listen(listener, 16)?;
//!
//! let ep = stack.epoll_create()?;
//! stack.epoll_ctl(ep, CtlOp::Add, listener, Some(Event {
//!     events: Interest::IN,
//!     data: listener as u64,
//! }))?;
//!
//! let mut events = [Event { events: Interest::empty(), data: 0 }; 64];
//! loop {
//!     let n = stack.epoll_wait(ep, &mut events, -1)?;
//!     for event in &events[..n] {
//!         // accept / read / write by the handle stashed in event.data
//!     }
//! }
//! ```
//!
//! The backend is consumed through the [`Backend`] trait; production
//! deployments wrap the real bypass library, while [`testkit::MemBackend`]
//! provides an in-memory loopback fabric for tests and demos.

pub mod backend;
pub mod config;
pub mod epoll;
pub mod error;
pub mod logging;
pub mod namespace;
pub mod sga;
mod socket;
pub mod stack;
mod table;
pub mod testkit;

pub use backend::{Backend, OpResult, QDesc, QResult, QToken, Sga, SgaSeg};
pub use config::Config;
pub use epoll::{CtlOp, Event, Interest};
pub use error::{Error, Result};
pub use namespace::{Descriptor, EPOLL_BASE, SOCKET_BASE};
pub use stack::Stack;
