//! In-memory loopback backend.
//!
//! A [`Backend`] implementation with no kernel-bypass hardware behind it:
//! queues live in a slab, connections are endpoint pairs wired through
//! in-process inboxes, and completions become observable the moment their
//! data is available. Time is virtual — a finite wait that cannot complete
//! right now times out immediately, and an infinite wait that can never
//! complete panics instead of deadlocking the test.
//!
//! The remote half of every connection is driven directly through
//! [`MemBackend::remote_send`] / [`MemBackend::remote_recv`], standing in
//! for the peer on the other side of the network.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddrV4;
use std::time::Duration;

use slab::Slab;
use tracing::trace;

use crate::backend::{Backend, OpResult, QDesc, QResult, QToken, Sga, SgaSeg};
use crate::error::{Error, Result};

/// Handle for the remote endpoint of a connection, as returned by
/// [`MemBackend::remote_connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Remote(usize);

struct MemQueue {
    local: Option<SocketAddrV4>,
    state: QueueState,
}

enum QueueState {
    Fresh,
    Listening {
        backlog: usize,
        /// Queue indices of server-side endpoints awaiting accept.
        pending: VecDeque<usize>,
    },
    Connected {
        peer: Option<usize>,
        remote_addr: SocketAddrV4,
        inbox: VecDeque<Vec<u8>>,
        peer_closed: bool,
    },
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Accept(usize),
    Pop(usize),
    Push(usize),
}

impl Op {
    fn queue(self) -> usize {
        match self {
            Op::Accept(qd) | Op::Pop(qd) | Op::Push(qd) => qd,
        }
    }
}

pub struct MemBackend {
    queues: Slab<MemQueue>,
    ops: HashMap<QToken, Op>,
    next_token: QToken,
    next_port: u16,
    /// Segment granularity for allocated arrays; payloads larger than this
    /// get a multi-segment array.
    seg_capacity: usize,
    live_sgas: usize,
    hold_pushes: bool,
}

impl Default for MemBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemBackend {
    pub fn new() -> Self {
        Self::with_seg_capacity(2048)
    }

    pub fn with_seg_capacity(seg_capacity: usize) -> Self {
        assert!(seg_capacity > 0);
        Self {
            queues: Slab::new(),
            ops: HashMap::new(),
            next_token: 0,
            next_port: 40000,
            seg_capacity,
            live_sgas: 0,
            hold_pushes: false,
        }
    }

    /// While held, submitted pushes do not complete. Lets tests observe the
    /// push-in-flight window that a real backend would expose.
    pub fn hold_pushes(&mut self, hold: bool) {
        self.hold_pushes = hold;
    }

    /// Scatter-gather arrays currently alive (allocated or popped, not yet
    /// freed). Zero after an orderly teardown.
    pub fn outstanding_sgas(&self) -> usize {
        self.live_sgas
    }

    /// Establish a connection to a listening queue, as the remote peer
    /// would. The server side observes it through an accept completion;
    /// bytes sent on the returned handle are poppable immediately, even
    /// before the accept is consumed.
    pub fn remote_connect(&mut self, addr: SocketAddrV4) -> Result<Remote> {
        let listener = self
            .queues
            .iter()
            .find(|(_, q)| q.local == Some(addr) && matches!(q.state, QueueState::Listening { .. }))
            .map(|(idx, _)| idx)
            .ok_or(Error::NotFound)?;
        let remote_addr = SocketAddrV4::new([127, 0, 0, 1].into(), self.next_port);
        self.next_port += 1;

        let server_idx = self.queues.insert(MemQueue {
            local: Some(addr),
            state: QueueState::Connected {
                peer: None,
                remote_addr,
                inbox: VecDeque::new(),
                peer_closed: false,
            },
        });
        let remote_idx = self.queues.insert(MemQueue {
            local: Some(remote_addr),
            state: QueueState::Connected {
                peer: Some(server_idx),
                remote_addr: addr,
                inbox: VecDeque::new(),
                peer_closed: false,
            },
        });
        if let QueueState::Connected { peer, .. } = &mut self.queues[server_idx].state {
            *peer = Some(remote_idx);
        }

        let full = match &self.queues[listener].state {
            QueueState::Listening { backlog, pending } => pending.len() >= *backlog,
            _ => unreachable!(),
        };
        if full {
            self.queues.remove(remote_idx);
            self.queues.remove(server_idx);
            return Err(Error::Backend(libc::ECONNREFUSED));
        }
        let QueueState::Listening { pending, .. } = &mut self.queues[listener].state else {
            unreachable!()
        };
        pending.push_back(server_idx);
        trace!(%addr, %remote_addr, "remote connection queued");
        Ok(Remote(remote_idx))
    }

    /// Deliver bytes from the remote peer; they become poppable on the
    /// server side. Silently dropped if the server side is gone.
    pub fn remote_send(&mut self, remote: Remote, data: &[u8]) {
        let peer = match &self.queues[remote.0].state {
            QueueState::Connected { peer, .. } => *peer,
            _ => panic!("remote endpoint is not connected"),
        };
        if let Some(peer) = peer
            && let Some(q) = self.queues.get_mut(peer)
            && let QueueState::Connected { inbox, .. } = &mut q.state
        {
            inbox.push_back(data.to_vec());
        }
    }

    /// Take the next chunk the server side pushed to this peer.
    pub fn remote_recv(&mut self, remote: Remote) -> Option<Vec<u8>> {
        match &mut self.queues[remote.0].state {
            QueueState::Connected { inbox, .. } => inbox.pop_front(),
            _ => panic!("remote endpoint is not connected"),
        }
    }

    /// Local address of the remote endpoint (what the server sees as the
    /// peer address).
    pub fn remote_addr(&self, remote: Remote) -> SocketAddrV4 {
        self.queues[remote.0].local.expect("remote endpoint has an address")
    }

    /// Close the connection from the remote side. Queued data stays
    /// poppable; once drained, pops complete with an empty array.
    pub fn remote_close(&mut self, remote: Remote) {
        let peer = match &mut self.queues[remote.0].state {
            QueueState::Connected { peer, .. } => peer.take(),
            _ => panic!("remote endpoint is not connected"),
        };
        if let Some(peer) = peer
            && let Some(q) = self.queues.get_mut(peer)
            && let QueueState::Connected { peer_closed, peer, .. } = &mut q.state
        {
            *peer_closed = true;
            *peer = None;
        }
    }

    fn alloc_token(&mut self, op: Op) -> QToken {
        self.next_token += 1;
        self.ops.insert(self.next_token, op);
        self.next_token
    }

    /// Complete `token` if its operation is satisfiable right now.
    fn try_complete(&mut self, token: QToken) -> Option<QResult> {
        let op = *self.ops.get(&token)?;
        let result = match op {
            Op::Accept(qd) => {
                let QueueState::Listening { pending, .. } = &mut self.queues[qd].state else {
                    return None;
                };
                let server_idx = pending.pop_front()?;
                let QueueState::Connected { remote_addr, .. } = &self.queues[server_idx].state
                else {
                    unreachable!()
                };
                OpResult::Accept { qd: QDesc(server_idx as u32), peer: *remote_addr }
            }
            Op::Pop(qd) => {
                let QueueState::Connected { inbox, peer_closed, .. } = &mut self.queues[qd].state
                else {
                    return None;
                };
                if inbox.is_empty() && !*peer_closed {
                    return None;
                }
                let mut segs = Vec::new();
                while let Some(chunk) = inbox.pop_front() {
                    segs.push(SgaSeg::from_slice(&chunk));
                }
                self.live_sgas += 1;
                OpResult::Pop(Sga::from_segs(segs))
            }
            Op::Push(_) => {
                if self.hold_pushes {
                    return None;
                }
                OpResult::Push
            }
        };
        self.ops.remove(&token);
        Some(QResult { qd: QDesc(op.queue() as u32), token, result })
    }
}

impl Backend for MemBackend {
    fn socket(&mut self, domain: i32, ty: i32, _protocol: i32) -> Result<QDesc> {
        assert_eq!(domain, libc::AF_INET, "only AF_INET queues are modeled");
        assert_eq!(ty, libc::SOCK_STREAM, "only stream queues are modeled");
        let idx = self.queues.insert(MemQueue { local: None, state: QueueState::Fresh });
        Ok(QDesc(idx as u32))
    }

    fn bind(&mut self, qd: QDesc, addr: SocketAddrV4) -> Result<()> {
        let q = self.queues.get_mut(qd.0 as usize).ok_or(Error::BadDescriptor)?;
        q.local = Some(addr);
        Ok(())
    }

    fn listen(&mut self, qd: QDesc, backlog: usize) -> Result<()> {
        let q = self.queues.get_mut(qd.0 as usize).ok_or(Error::BadDescriptor)?;
        if q.local.is_none() {
            return Err(Error::NotBound);
        }
        match q.state {
            QueueState::Fresh => {
                q.state = QueueState::Listening { backlog: backlog.max(1), pending: VecDeque::new() };
                Ok(())
            }
            _ => Err(Error::Unsupported),
        }
    }

    fn accept(&mut self, qd: QDesc) -> Result<QToken> {
        let q = self.queues.get(qd.0 as usize).ok_or(Error::BadDescriptor)?;
        if !matches!(q.state, QueueState::Listening { .. }) {
            return Err(Error::Unsupported);
        }
        Ok(self.alloc_token(Op::Accept(qd.0 as usize)))
    }

    fn push(&mut self, qd: QDesc, sga: &Sga) -> Result<QToken> {
        let data: Vec<u8> = sga.segs().iter().flat_map(|seg| seg.as_slice()).copied().collect();
        let q = self.queues.get(qd.0 as usize).ok_or(Error::BadDescriptor)?;
        let peer = match &q.state {
            QueueState::Connected { peer, .. } => *peer,
            _ => return Err(Error::Unsupported),
        };
        if let Some(peer) = peer
            && let Some(q) = self.queues.get_mut(peer)
            && let QueueState::Connected { inbox, .. } = &mut q.state
        {
            inbox.push_back(data);
        }
        Ok(self.alloc_token(Op::Push(qd.0 as usize)))
    }

    fn pop(&mut self, qd: QDesc) -> Result<QToken> {
        let q = self.queues.get(qd.0 as usize).ok_or(Error::BadDescriptor)?;
        if !matches!(q.state, QueueState::Connected { .. }) {
            return Err(Error::Unsupported);
        }
        Ok(self.alloc_token(Op::Pop(qd.0 as usize)))
    }

    fn wait(&mut self, token: QToken, timeout: Option<Duration>) -> Result<QResult> {
        if let Some(res) = self.try_complete(token) {
            return Ok(res);
        }
        match timeout {
            Some(_) => Err(Error::TimedOut),
            None => panic!("infinite wait on a token that cannot complete (token {token})"),
        }
    }

    fn wait_any(&mut self, tokens: &[QToken], timeout: Option<Duration>) -> Result<(usize, QResult)> {
        for (idx, &token) in tokens.iter().enumerate() {
            if let Some(res) = self.try_complete(token) {
                return Ok((idx, res));
            }
        }
        match timeout {
            Some(_) => Err(Error::TimedOut),
            None => panic!("infinite wait with no completable token"),
        }
    }

    fn sga_alloc(&mut self, size: usize) -> Result<Sga> {
        let mut segs = Vec::new();
        let mut remaining = size;
        while remaining > 0 {
            let n = remaining.min(self.seg_capacity);
            segs.push(SgaSeg::zeroed(n));
            remaining -= n;
        }
        self.live_sgas += 1;
        Ok(Sga::from_segs(segs))
    }

    fn sga_free(&mut self, sga: Sga) {
        assert!(self.live_sgas > 0, "sga_free without a live allocation");
        self.live_sgas -= 1;
        drop(sga);
    }

    fn close(&mut self, qd: QDesc) -> Result<()> {
        let q = self.queues.try_remove(qd.0 as usize).ok_or(Error::BadDescriptor)?;
        // Tokens die with the queue.
        self.ops.retain(|_, op| op.queue() != qd.0 as usize);
        if let QueueState::Connected { peer: Some(peer), .. } = q.state
            && let Some(pq) = self.queues.get_mut(peer)
            && let QueueState::Connected { peer, peer_closed, .. } = &mut pq.state
        {
            *peer = None;
            *peer_closed = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new([127, 0, 0, 1].into(), port)
    }

    fn listener(backend: &mut MemBackend, port: u16) -> QDesc {
        let qd = backend.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        backend.bind(qd, addr(port)).unwrap();
        backend.listen(qd, 4).unwrap();
        qd
    }

    #[test]
    fn accept_completes_after_remote_connect() {
        let mut backend = MemBackend::new();
        let qd = listener(&mut backend, 9000);
        let token = backend.accept(qd).unwrap();
        assert!(matches!(
            backend.wait(token, Some(Duration::ZERO)),
            Err(Error::TimedOut)
        ));

        let remote = backend.remote_connect(addr(9000)).unwrap();
        let res = backend.wait(token, Some(Duration::ZERO)).unwrap();
        assert_eq!(res.qd, qd);
        let OpResult::Accept { peer, .. } = res.result else { panic!("expected accept") };
        assert_eq!(peer, backend.remote_addr(remote));
    }

    #[test]
    fn pop_delivers_queued_chunks_as_segments() {
        let mut backend = MemBackend::new();
        let qd = listener(&mut backend, 9001);
        let remote = backend.remote_connect(addr(9001)).unwrap();
        let token = backend.accept(qd).unwrap();
        let res = backend.wait(token, Some(Duration::ZERO)).unwrap();
        let OpResult::Accept { qd: conn, .. } = res.result else { panic!() };

        backend.remote_send(remote, b"one");
        backend.remote_send(remote, b"two");
        let token = backend.pop(conn).unwrap();
        let res = backend.wait(token, Some(Duration::ZERO)).unwrap();
        let OpResult::Pop(sga) = res.result else { panic!("expected pop") };
        assert_eq!(sga.num_segs(), 2);
        assert_eq!(sga.len(), 6);
        backend.sga_free(sga);
        assert_eq!(backend.outstanding_sgas(), 0);
    }

    #[test]
    fn pop_after_remote_close_is_empty() {
        let mut backend = MemBackend::new();
        let qd = listener(&mut backend, 9002);
        let remote = backend.remote_connect(addr(9002)).unwrap();
        let token = backend.accept(qd).unwrap();
        let res = backend.wait(token, Some(Duration::ZERO)).unwrap();
        let OpResult::Accept { qd: conn, .. } = res.result else { panic!() };

        backend.remote_close(remote);
        let token = backend.pop(conn).unwrap();
        let res = backend.wait(token, Some(Duration::ZERO)).unwrap();
        let OpResult::Pop(sga) = res.result else { panic!("expected pop") };
        assert!(sga.is_empty());
        backend.sga_free(sga);
    }

    #[test]
    fn wait_any_reports_the_completed_index() {
        let mut backend = MemBackend::new();
        let qd = listener(&mut backend, 9003);
        let accept_token = backend.accept(qd).unwrap();
        let _remote = backend.remote_connect(addr(9003)).unwrap();
        let (idx, res) = backend
            .wait_any(&[accept_token], Some(Duration::ZERO))
            .unwrap();
        assert_eq!(idx, 0);
        assert_eq!(res.token, accept_token);
    }

    #[test]
    fn close_invalidates_outstanding_tokens() {
        let mut backend = MemBackend::new();
        let qd = listener(&mut backend, 9004);
        let token = backend.accept(qd).unwrap();
        backend.close(qd).unwrap();
        // The token died with the queue; a poll on it times out.
        assert!(matches!(
            backend.wait(token, Some(Duration::ZERO)),
            Err(Error::TimedOut)
        ));
    }

    #[test]
    fn backlog_overflow_refuses_connections() {
        let mut backend = MemBackend::new();
        let qd = backend.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        backend.bind(qd, addr(9005)).unwrap();
        backend.listen(qd, 1).unwrap();
        backend.remote_connect(addr(9005)).unwrap();
        assert!(matches!(
            backend.remote_connect(addr(9005)),
            Err(Error::Backend(errno)) if errno == libc::ECONNREFUSED
        ));
    }
}
