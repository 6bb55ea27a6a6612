//! The kernel-bypass backend contract.
//!
//! The shim never talks to the bypass stack directly; it consumes it through
//! the [`Backend`] trait. Operations are submitted asynchronously and return
//! an opaque [`QToken`]; completion is observed by waiting on the token. The
//! unit of data transfer is the scatter-gather array ([`Sga`]), allocated
//! and released by the backend.
//!
//! Process-wide backend initialisation is the construction of the value
//! passed to [`Stack::new`](crate::Stack::new); the backend is expected to
//! be built exactly once and torn down at process exit.

use std::fmt;
use std::net::SocketAddrV4;
use std::time::Duration;

use bytes::BytesMut;
use smallvec::SmallVec;

use crate::error::Result;

/// Per-submission identifier. Never reused across operations.
pub type QToken = u64;

/// The backend's identifier for one of its queues (sockets). Distinct from
/// the public handle the shim exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QDesc(pub u32);

impl fmt::Display for QDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "qd:{}", self.0)
    }
}

/// One contiguous segment of a scatter-gather array.
#[derive(Debug)]
pub struct SgaSeg {
    buf: BytesMut,
}

impl SgaSeg {
    /// A zero-filled segment of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self { buf: BytesMut::zeroed(len) }
    }

    /// A segment holding a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        Self { buf: BytesMut::from(data) }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

/// A backend-allocated scatter-gather array.
///
/// Nearly always a single segment; the inline capacity avoids a heap
/// allocation for that case.
#[derive(Debug, Default)]
pub struct Sga {
    segs: SmallVec<[SgaSeg; 1]>,
}

impl Sga {
    pub fn from_segs<I: IntoIterator<Item = SgaSeg>>(segs: I) -> Self {
        Self { segs: segs.into_iter().collect() }
    }

    /// Total payload length across all segments.
    pub fn len(&self) -> usize {
        self.segs.iter().map(SgaSeg::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_segs(&self) -> usize {
        self.segs.len()
    }

    pub fn segs(&self) -> &[SgaSeg] {
        &self.segs
    }

    pub fn segs_mut(&mut self) -> &mut [SgaSeg] {
        &mut self.segs
    }
}

/// Payload of a completed operation, keyed by opcode.
#[derive(Debug)]
pub enum OpResult {
    /// A connection was accepted on a listening queue.
    Accept { qd: QDesc, peer: SocketAddrV4 },
    /// A push was flushed; the pushed [`Sga`] stays owned by the submitter.
    Push,
    /// A pop delivered data. An empty array signals end of stream.
    Pop(Sga),
    /// The operation failed at the backend.
    Failed { errno: i32 },
}

/// A completion, as returned by [`Backend::wait`] / [`Backend::wait_any`].
#[derive(Debug)]
pub struct QResult {
    /// The queue the completed operation was submitted on.
    pub qd: QDesc,
    /// The token the completed operation was submitted under.
    pub token: QToken,
    pub result: OpResult,
}

/// The asynchronous token-based backend.
///
/// `wait` and `wait_any` block for at most the given timeout; `None` means
/// wait indefinitely and a `Some(Duration::ZERO)` is a pure poll. A timed
/// out wait is [`Error::TimedOut`](crate::Error::TimedOut), never a
/// fabricated completion.
pub trait Backend {
    /// Create a queue. Only `AF_INET` stream sockets are ever requested.
    fn socket(&mut self, domain: i32, ty: i32, protocol: i32) -> Result<QDesc>;

    /// Associate a local address with a queue.
    fn bind(&mut self, qd: QDesc, addr: SocketAddrV4) -> Result<()>;

    /// Put a bound queue into the listening state.
    fn listen(&mut self, qd: QDesc, backlog: usize) -> Result<()>;

    /// Submit an accept. Completes with [`OpResult::Accept`].
    fn accept(&mut self, qd: QDesc) -> Result<QToken>;

    /// Submit a send of `sga`. The caller keeps ownership of the array until
    /// the push completes.
    fn push(&mut self, qd: QDesc, sga: &Sga) -> Result<QToken>;

    /// Submit a receive. Completes with [`OpResult::Pop`].
    fn pop(&mut self, qd: QDesc) -> Result<QToken>;

    /// Wait for one specific token.
    fn wait(&mut self, token: QToken, timeout: Option<Duration>) -> Result<QResult>;

    /// Wait for any of `tokens`; returns the index of the completed token
    /// alongside the completion.
    fn wait_any(&mut self, tokens: &[QToken], timeout: Option<Duration>) -> Result<(usize, QResult)>;

    /// Allocate a scatter-gather array with capacity for `size` bytes.
    fn sga_alloc(&mut self, size: usize) -> Result<Sga>;

    /// Release a scatter-gather array back to the backend.
    fn sga_free(&mut self, sga: Sga);

    /// Release a queue. Outstanding tokens on the queue are invalidated.
    fn close(&mut self, qd: QDesc) -> Result<()>;
}
