//! Epoll sets.
//!
//! An epoll set watches bypass sockets through an ordered item container
//! keyed by backend queue descriptor, and composes a host kernel epoll
//! descriptor for any non-bypass fds added to it. Items currently exhibiting
//! at least one subscribed event sit on the ready-list, which the wait path
//! drains into the caller's event array.
//!
//! The ready-list is a queue of queue descriptors plus a membership flag on
//! each item; link and unlink stay O(1) and an entry whose item has been
//! removed (or re-added) is skipped on drain.

use std::collections::{BTreeMap, VecDeque};
use std::os::fd::RawFd;

use crate::backend::{QDesc, QToken};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::socket::Socket;

bitflags::bitflags! {
    /// Readiness event bits, wire-compatible with the host epoll mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u32 {
        const IN = libc::EPOLLIN as u32;
        const OUT = libc::EPOLLOUT as u32;
        const ERR = libc::EPOLLERR as u32;
        const HUP = libc::EPOLLHUP as u32;
        const RDHUP = libc::EPOLLRDHUP as u32;
    }
}

/// One delivered readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub events: Interest,
    /// Caller-opaque data registered with the watch.
    pub data: u64,
}

/// An `epoll_ctl` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtlOp {
    Add,
    Mod,
    Del,
}

impl CtlOp {
    pub(crate) fn host_op(self) -> i32 {
        match self {
            CtlOp::Add => libc::EPOLL_CTL_ADD,
            CtlOp::Mod => libc::EPOLL_CTL_MOD,
            CtlOp::Del => libc::EPOLL_CTL_DEL,
        }
    }
}

/// Watch state for one (epoll set, bypass socket) pair.
pub(crate) struct EpollItem {
    pub interest: Interest,
    pub data: u64,
    /// Socket table slot plus the serial stamped into it; a mismatch during
    /// a sweep means the socket died and the item gets evicted.
    pub sock_index: usize,
    pub serial: u64,
    pub in_ready: bool,
}

impl EpollItem {
    /// Events currently deliverable: subscribed and satisfied by the
    /// socket's slot predicates.
    pub fn available(&self, sock: &Socket) -> Interest {
        let mut avs = Interest::empty();
        let inbound_ready = if sock.is_accepting() { sock.acceptable() } else { sock.readable() };
        if self.interest.contains(Interest::IN) && inbound_ready {
            avs |= Interest::IN;
        }
        if self.interest.contains(Interest::OUT) && sock.writable() {
            avs |= Interest::OUT;
        }
        avs
    }
}

pub(crate) struct EpollSet {
    /// Host kernel epoll fd carrying the passthrough descriptors.
    pub host_fd: RawFd,
    /// Watched bypass sockets, ordered by backend queue descriptor.
    pub items: BTreeMap<QDesc, EpollItem>,
    /// Queue descriptors of items currently deliverable.
    pub ready: VecDeque<QDesc>,
    /// Reusable buffer of outstanding tokens collected by each sweep.
    pub tokens: Vec<QToken>,
    /// Reusable host event batch.
    pub host_events: Vec<libc::epoll_event>,
}

impl EpollSet {
    pub fn new(config: &Config) -> Result<Self> {
        let host_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if host_fd < 0 {
            return Err(Error::last_os_error());
        }
        Ok(Self {
            host_fd,
            items: BTreeMap::new(),
            ready: VecDeque::new(),
            tokens: Vec::with_capacity(config.token_capacity),
            host_events: Vec::with_capacity(config.host_event_capacity),
        })
    }

    /// Put the item for `qd` on the ready-list. Idempotent.
    pub fn link_ready(&mut self, qd: QDesc) {
        if let Some(item) = self.items.get_mut(&qd)
            && !item.in_ready
        {
            item.in_ready = true;
            self.ready.push_back(qd);
        }
    }

    /// Register a bypass socket watch.
    pub fn add(&mut self, qd: QDesc, item: EpollItem) -> Result<()> {
        if self.items.contains_key(&qd) {
            return Err(Error::Exists);
        }
        self.items.insert(qd, item);
        Ok(())
    }

    /// Replace interest mask and user data of an existing watch.
    pub fn modify(&mut self, qd: QDesc, interest: Interest, data: u64) -> Result<()> {
        let item = self.items.get_mut(&qd).ok_or(Error::NotFound)?;
        item.interest = interest;
        item.data = data;
        Ok(())
    }

    /// Drop a watch. A stale ready-list entry is left behind and skipped on
    /// the next drain; in-flight backend tokens are not cancelled.
    pub fn delete(&mut self, qd: QDesc) -> Result<()> {
        self.items.remove(&qd).map(|_| ()).ok_or(Error::NotFound)
    }
}

impl Drop for EpollSet {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.host_fd);
        }
    }
}

/// Reject interest bits the bypass engine cannot deliver. Anything beyond
/// level-triggered IN/OUT on a bypass watch is a caller bug.
pub(crate) fn check_bypass_interest(interest: Interest) {
    let supported = Interest::IN | Interest::OUT;
    assert!(
        supported.contains(interest),
        "unsupported epoll interest for a bypass socket: {interest:?}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::testkit::MemBackend;

    fn item_for(sock_index: usize, serial: u64, interest: Interest) -> EpollItem {
        EpollItem { interest, data: 0, sock_index, serial, in_ready: false }
    }

    #[test]
    fn link_ready_is_idempotent() {
        let mut ep = EpollSet::new(&Config::default()).unwrap();
        let qd = QDesc(0);
        ep.add(qd, item_for(0, 1, Interest::IN)).unwrap();
        ep.link_ready(qd);
        ep.link_ready(qd);
        assert_eq!(ep.ready.len(), 1);
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let mut ep = EpollSet::new(&Config::default()).unwrap();
        let qd = QDesc(3);
        ep.add(qd, item_for(0, 1, Interest::IN)).unwrap();
        assert!(matches!(ep.add(qd, item_for(0, 1, Interest::IN)), Err(Error::Exists)));
        assert!(matches!(ep.delete(QDesc(9)), Err(Error::NotFound)));
    }

    #[test]
    fn available_follows_socket_predicates() {
        let mut backend = MemBackend::new();
        let qd = backend.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        let sock = Socket::new(qd, 1);
        let item = item_for(0, 1, Interest::IN | Interest::OUT);
        // Fresh socket: send lane idle (writable), nothing popped.
        assert_eq!(item.available(&sock), Interest::OUT);
    }

    #[test]
    #[should_panic(expected = "unsupported epoll interest")]
    fn edge_triggered_interest_is_fatal() {
        check_bypass_interest(Interest::IN | Interest::from_bits_retain(libc::EPOLLET as u32));
    }
}
