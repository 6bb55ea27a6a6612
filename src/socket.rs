//! Per-socket state machine.
//!
//! A socket owns a backend queue descriptor and three operation lanes: one
//! send slot and an inbound slot that is either a receive lane (connected
//! mode) or an accept lane (after a successful listen). Each lane carries at
//! most one in-flight token. All operations are non-blocking: anything that
//! cannot finish immediately submits to the backend and reports
//! [`Error::WouldBlock`]; the readiness engine later harvests the completion
//! or the caller retries and probes it with a zero-timeout wait.
//!
//! Slot/opcode mismatches and the buffered-but-not-pending send state are
//! bugs, not I/O conditions; the slot sum types make the latter
//! unrepresentable and the former panics.

use std::io::{IoSlice, IoSliceMut};
use std::mem;
use std::net::SocketAddrV4;
use std::time::Duration;

use tracing::trace;

use crate::backend::{Backend, OpResult, QDesc, QResult, QToken, Sga};
use crate::error::{Error, Result};
use crate::sga::{copy_from_sga, copy_into_sga, copy_iovecs_into_sga};

/// Zero-timeout probe.
const POLL: Option<Duration> = Some(Duration::ZERO);

/// Send lane. `InFlight` owns the pushed array until the backend confirms
/// the flush.
pub(crate) enum SendSlot {
    Idle,
    InFlight { token: QToken, sga: Sga },
    Failed(i32),
}

/// Receive lane of a connected socket.
pub(crate) enum RecvState {
    Idle,
    InFlight { token: QToken },
    /// A popped array with the consumption offset; served to the caller
    /// across one or more reads.
    Ready { sga: Sga, offset: usize },
    Failed(i32),
}

/// Accept lane of a listening socket.
pub(crate) enum AcceptState {
    Idle,
    InFlight { token: QToken },
    Ready { qd: QDesc, peer: SocketAddrV4 },
    Failed(i32),
}

/// The recv/accept union: a socket is in exactly one of the two modes.
pub(crate) enum Inbound {
    Stream(RecvState),
    Accepting(AcceptState),
}

pub(crate) struct Socket {
    qd: QDesc,
    /// Stamp distinguishing this socket from any later occupant of the same
    /// table slot.
    serial: u64,
    addr: Option<SocketAddrV4>,
    send: SendSlot,
    inbound: Inbound,
}

impl Socket {
    pub fn new(qd: QDesc, serial: u64) -> Self {
        Self {
            qd,
            serial,
            addr: None,
            send: SendSlot::Idle,
            inbound: Inbound::Stream(RecvState::Idle),
        }
    }

    pub fn qd(&self) -> QDesc {
        self.qd
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn addr(&self) -> Option<SocketAddrV4> {
        self.addr
    }

    pub fn set_addr(&mut self, addr: SocketAddrV4) {
        self.addr = Some(addr);
    }

    /// Switch the inbound lane to accepting mode. Called after a successful
    /// listen; irreversible.
    pub fn mark_listening(&mut self) {
        self.inbound = Inbound::Accepting(AcceptState::Idle);
    }

    pub fn is_accepting(&self) -> bool {
        matches!(self.inbound, Inbound::Accepting(_))
    }

    /// The send lane can take a new payload. A parked failure counts as
    /// writable so the subscriber wakes up and collects the error.
    pub fn writable(&self) -> bool {
        matches!(self.send, SendSlot::Idle | SendSlot::Failed(_))
    }

    /// A popped array (or a parked failure) is waiting for the caller.
    pub fn readable(&self) -> bool {
        matches!(
            self.inbound,
            Inbound::Stream(RecvState::Ready { .. }) | Inbound::Stream(RecvState::Failed(_))
        )
    }

    /// A completed, unconsumed accept (or a parked failure) is waiting.
    pub fn acceptable(&self) -> bool {
        matches!(
            self.inbound,
            Inbound::Accepting(AcceptState::Ready { .. })
                | Inbound::Accepting(AcceptState::Failed(_))
        )
    }

    fn stream_slot_mut(&mut self) -> &mut RecvState {
        match &mut self.inbound {
            Inbound::Stream(state) => state,
            Inbound::Accepting(_) => panic!("read on a listening socket ({})", self.qd),
        }
    }

    /// Bring the receive lane to `Ready`, submitting or probing as needed.
    fn ready_recv<B: Backend>(&mut self, backend: &mut B) -> Result<()> {
        let qd = self.qd;
        let state = self.stream_slot_mut();
        if let RecvState::InFlight { token } = *state {
            match backend.wait(token, POLL) {
                Ok(res) => install_pop(state, token, res)?,
                Err(Error::TimedOut) => return Err(Error::WouldBlock),
                Err(e) => return Err(e),
            }
        }
        match state {
            RecvState::Idle => {
                let token = backend.pop(qd)?;
                trace!(%qd, token, "pop submitted");
                *state = RecvState::InFlight { token };
                Err(Error::WouldBlock)
            }
            RecvState::Ready { .. } => Ok(()),
            RecvState::Failed(errno) => {
                let errno = *errno;
                *state = RecvState::Idle;
                Err(Error::Backend(errno))
            }
            RecvState::InFlight { .. } => unreachable!("in-flight pop survived the probe"),
        }
    }

    /// Non-blocking read. Returns 0 at end of stream.
    pub fn read<B: Backend>(&mut self, backend: &mut B, buf: &mut [u8]) -> Result<usize> {
        self.ready_recv(backend)?;
        let state = self.stream_slot_mut();
        let RecvState::Ready { sga, offset } = state else { unreachable!() };
        let (copied, drained) = copy_from_sga(buf, sga, offset);
        if drained {
            let RecvState::Ready { sga, .. } = mem::replace(state, RecvState::Idle) else {
                unreachable!()
            };
            backend.sga_free(sga);
        }
        Ok(copied)
    }

    /// Non-blocking scatter read; stops at the first partially filled iovec.
    pub fn readv<B: Backend>(
        &mut self,
        backend: &mut B,
        iovs: &mut [IoSliceMut<'_>],
    ) -> Result<usize> {
        self.ready_recv(backend)?;
        let state = self.stream_slot_mut();
        let RecvState::Ready { sga, offset } = state else { unreachable!() };
        let mut copied = 0;
        let mut drained = *offset >= sga.len();
        for iov in iovs.iter_mut() {
            if drained {
                break;
            }
            let (n, d) = copy_from_sga(iov, sga, offset);
            copied += n;
            drained = d;
            if n < iov.len() {
                break;
            }
        }
        if drained {
            let RecvState::Ready { sga, .. } = mem::replace(state, RecvState::Idle) else {
                unreachable!()
            };
            backend.sga_free(sga);
        }
        Ok(copied)
    }

    /// Probe an in-flight push; frees the flushed array on completion.
    fn flush_send<B: Backend>(&mut self, backend: &mut B) -> Result<()> {
        if let SendSlot::InFlight { token, .. } = self.send {
            match backend.wait(token, POLL) {
                Ok(res) => {
                    let SendSlot::InFlight { sga, .. } =
                        mem::replace(&mut self.send, SendSlot::Idle)
                    else {
                        unreachable!()
                    };
                    backend.sga_free(sga);
                    assert_eq!(res.token, token, "completion token does not match the send slot");
                    match res.result {
                        OpResult::Push => Ok(()),
                        OpResult::Failed { errno } => Err(Error::Backend(errno)),
                        other => panic!("push slot completed with opcode {other:?}"),
                    }
                }
                Err(Error::TimedOut) => Err(Error::WouldBlock),
                Err(e) => Err(e),
            }
        } else {
            Ok(())
        }
    }

    fn submit_send<B: Backend>(
        &mut self,
        backend: &mut B,
        len: usize,
        fill: impl FnOnce(&mut Sga) -> usize,
    ) -> Result<usize> {
        if len == 0 {
            return Ok(0);
        }
        self.flush_send(backend)?;
        match mem::replace(&mut self.send, SendSlot::Idle) {
            SendSlot::Idle => {
                let mut sga = backend.sga_alloc(len)?;
                let copied = fill(&mut sga);
                let token = backend.push(self.qd, &sga)?;
                trace!(qd = %self.qd, token, len = copied, "push submitted");
                self.send = SendSlot::InFlight { token, sga };
                Ok(copied)
            }
            SendSlot::Failed(errno) => Err(Error::Backend(errno)),
            SendSlot::InFlight { .. } => unreachable!("in-flight push survived the probe"),
        }
    }

    /// Non-blocking write. Accepts the whole payload or none of it.
    pub fn write<B: Backend>(&mut self, backend: &mut B, buf: &[u8]) -> Result<usize> {
        self.submit_send(backend, buf.len(), |sga| copy_into_sga(buf, sga))
    }

    /// Non-blocking gather write of a full iovec sequence.
    pub fn writev<B: Backend>(&mut self, backend: &mut B, iovs: &[IoSlice<'_>]) -> Result<usize> {
        let total = iovs.iter().map(|iov| iov.len()).sum();
        self.submit_send(backend, total, |sga| copy_iovecs_into_sga(iovs, sga))
    }

    /// Non-blocking accept. On completion yields the new backend queue and
    /// the peer address; the caller wraps the queue in a fresh socket.
    pub fn accept<B: Backend>(&mut self, backend: &mut B) -> Result<(QDesc, SocketAddrV4)> {
        let qd = self.qd;
        let state = match &mut self.inbound {
            Inbound::Accepting(state) => state,
            Inbound::Stream(_) => panic!("accept on a non-listening socket ({qd})"),
        };
        if let AcceptState::InFlight { token } = *state {
            match backend.wait(token, POLL) {
                Ok(res) => install_accept(state, token, res)?,
                Err(Error::TimedOut) => return Err(Error::WouldBlock),
                Err(e) => return Err(e),
            }
        }
        match *state {
            AcceptState::Idle => {
                let token = backend.accept(qd)?;
                trace!(%qd, token, "accept submitted");
                *state = AcceptState::InFlight { token };
                Err(Error::WouldBlock)
            }
            AcceptState::Ready { qd: new_qd, peer } => {
                *state = AcceptState::Idle;
                Ok((new_qd, peer))
            }
            AcceptState::Failed(errno) => {
                *state = AcceptState::Idle;
                Err(Error::Backend(errno))
            }
            AcceptState::InFlight { .. } => unreachable!("in-flight accept survived the probe"),
        }
    }

    /// Make sure the inbound lane has an in-flight operation backing every
    /// not-yet-available subscribed EPOLLIN, returning its token. `None`
    /// when the lane already holds a deliverable payload.
    pub(crate) fn ensure_inbound_scheduled<B: Backend>(
        &mut self,
        backend: &mut B,
    ) -> Result<Option<QToken>> {
        let qd = self.qd;
        match &mut self.inbound {
            Inbound::Stream(state) => match state {
                RecvState::Idle => {
                    let token = backend.pop(qd)?;
                    trace!(%qd, token, "pop scheduled by sweep");
                    *state = RecvState::InFlight { token };
                    Ok(Some(token))
                }
                RecvState::InFlight { token } => Ok(Some(*token)),
                RecvState::Ready { .. } | RecvState::Failed(_) => Ok(None),
            },
            Inbound::Accepting(state) => match state {
                AcceptState::Idle => {
                    let token = backend.accept(qd)?;
                    trace!(%qd, token, "accept scheduled by sweep");
                    *state = AcceptState::InFlight { token };
                    Ok(Some(token))
                }
                AcceptState::InFlight { token } => Ok(Some(*token)),
                AcceptState::Ready { .. } | AcceptState::Failed(_) => Ok(None),
            },
        }
    }

    /// Token of the in-flight push, if any.
    pub(crate) fn send_token(&self) -> Option<QToken> {
        match self.send {
            SendSlot::InFlight { token, .. } => Some(token),
            _ => None,
        }
    }

    /// Route a harvested completion into the slot whose token matches and
    /// install its payload. Opcode/slot disagreement is fatal.
    pub(crate) fn apply_completion<B: Backend>(&mut self, backend: &mut B, res: QResult) {
        match res.result {
            OpResult::Push => {
                let SendSlot::InFlight { token, sga } =
                    mem::replace(&mut self.send, SendSlot::Idle)
                else {
                    panic!("push completion without an in-flight push on {}", self.qd);
                };
                assert_eq!(res.token, token, "completion token does not match the send slot");
                backend.sga_free(sga);
            }
            OpResult::Pop(sga) => {
                let state = self.stream_slot_mut();
                let RecvState::InFlight { token } = *state else {
                    panic!("pop completion without an in-flight pop");
                };
                assert_eq!(res.token, token, "completion token does not match the recv slot");
                *state = RecvState::Ready { sga, offset: 0 };
            }
            OpResult::Accept { qd, peer } => {
                let Inbound::Accepting(state) = &mut self.inbound else {
                    panic!("accept completion on a non-listening socket ({})", self.qd);
                };
                let AcceptState::InFlight { token } = *state else {
                    panic!("accept completion without an in-flight accept");
                };
                assert_eq!(res.token, token, "completion token does not match the accept slot");
                *state = AcceptState::Ready { qd, peer };
            }
            OpResult::Failed { errno } => {
                if let SendSlot::InFlight { token, .. } = self.send
                    && token == res.token
                {
                    let SendSlot::InFlight { sga, .. } =
                        mem::replace(&mut self.send, SendSlot::Failed(errno))
                    else {
                        unreachable!()
                    };
                    backend.sga_free(sga);
                    return;
                }
                match &mut self.inbound {
                    Inbound::Stream(state) => {
                        let RecvState::InFlight { token } = *state else {
                            panic!("failed completion matches no in-flight token on {}", self.qd);
                        };
                        assert_eq!(res.token, token, "failed completion matches no slot");
                        *state = RecvState::Failed(errno);
                    }
                    Inbound::Accepting(state) => {
                        let AcceptState::InFlight { token } = *state else {
                            panic!("failed completion matches no in-flight token on {}", self.qd);
                        };
                        assert_eq!(res.token, token, "failed completion matches no slot");
                        *state = AcceptState::Failed(errno);
                    }
                }
            }
        }
    }

    /// Teardown drain and backend release.
    ///
    /// An in-flight push is awaited to completion so the backend never
    /// completes into freed state. An in-flight pop or accept is probed once
    /// and otherwise abandoned: the backend's close invalidates the token,
    /// and a pop with no incoming data would never complete. Buffered arrays
    /// and a drained accept's new queue are released.
    pub(crate) fn close<B: Backend>(&mut self, backend: &mut B) -> Result<()> {
        if let SendSlot::InFlight { token, sga } = mem::replace(&mut self.send, SendSlot::Idle) {
            trace!(qd = %self.qd, token, "draining in-flight push before close");
            let res = backend.wait(token, None)?;
            assert_eq!(res.token, token, "completion token does not match the send slot");
            backend.sga_free(sga);
        }
        match mem::replace(&mut self.inbound, Inbound::Stream(RecvState::Idle)) {
            Inbound::Stream(RecvState::InFlight { token }) => {
                match backend.wait(token, POLL) {
                    Ok(QResult { result: OpResult::Pop(sga), .. }) => backend.sga_free(sga),
                    Ok(_) | Err(Error::TimedOut) => {}
                    Err(e) => return Err(e),
                }
            }
            Inbound::Stream(RecvState::Ready { sga, .. }) => backend.sga_free(sga),
            Inbound::Accepting(AcceptState::InFlight { token }) => {
                match backend.wait(token, POLL) {
                    Ok(QResult { result: OpResult::Accept { qd, .. }, .. }) => {
                        let _ = backend.close(qd);
                    }
                    Ok(_) | Err(Error::TimedOut) => {}
                    Err(e) => return Err(e),
                }
            }
            Inbound::Accepting(AcceptState::Ready { qd, .. }) => {
                let _ = backend.close(qd);
            }
            _ => {}
        }
        backend.close(self.qd)
    }
}

fn install_pop(state: &mut RecvState, token: QToken, res: QResult) -> Result<()> {
    assert_eq!(res.token, token, "completion token does not match the recv slot");
    match res.result {
        OpResult::Pop(sga) => {
            *state = RecvState::Ready { sga, offset: 0 };
            Ok(())
        }
        OpResult::Failed { errno } => {
            *state = RecvState::Idle;
            Err(Error::Backend(errno))
        }
        other => panic!("pop slot completed with opcode {other:?}"),
    }
}

fn install_accept(state: &mut AcceptState, token: QToken, res: QResult) -> Result<()> {
    assert_eq!(res.token, token, "completion token does not match the accept slot");
    match res.result {
        OpResult::Accept { qd, peer } => {
            *state = AcceptState::Ready { qd, peer };
            Ok(())
        }
        OpResult::Failed { errno } => {
            *state = AcceptState::Idle;
            Err(Error::Backend(errno))
        }
        other => panic!("accept slot completed with opcode {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::MemBackend;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new([127, 0, 0, 1].into(), port)
    }

    fn connected_pair(backend: &mut MemBackend) -> (Socket, crate::testkit::Remote) {
        let qd = backend.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        backend.bind(qd, addr(7000)).unwrap();
        backend.listen(qd, 4).unwrap();
        let mut listener = Socket::new(qd, 1);
        listener.set_addr(addr(7000));
        listener.mark_listening();
        let remote = backend.remote_connect(addr(7000)).unwrap();
        assert!(matches!(listener.accept(backend), Err(Error::WouldBlock)));
        let (new_qd, _peer) = listener.accept(backend).unwrap();
        (Socket::new(new_qd, 2), remote)
    }

    #[test]
    fn read_submits_then_delivers() {
        let mut backend = MemBackend::new();
        let (mut sock, remote) = connected_pair(&mut backend);
        let mut buf = [0u8; 8];

        // Nothing buffered, nothing in flight: a pop is submitted.
        assert!(matches!(sock.read(&mut backend, &mut buf), Err(Error::WouldBlock)));
        // Still in flight.
        assert!(matches!(sock.read(&mut backend, &mut buf), Err(Error::WouldBlock)));

        backend.remote_send(remote, b"hi");
        assert_eq!(sock.read(&mut backend, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"hi");
        assert!(!sock.readable());
    }

    #[test]
    fn partial_reads_drain_one_array() {
        let mut backend = MemBackend::new();
        let (mut sock, remote) = connected_pair(&mut backend);
        backend.remote_send(remote, b"0123456789");

        let mut buf = [0u8; 4];
        assert!(matches!(sock.read(&mut backend, &mut buf), Err(Error::WouldBlock)));
        assert_eq!(sock.read(&mut backend, &mut buf).unwrap(), 4);
        assert!(sock.readable());
        assert_eq!(sock.read(&mut backend, &mut buf).unwrap(), 4);
        assert_eq!(sock.read(&mut backend, &mut buf).unwrap(), 2);
        // Array drained; the next read submits a fresh pop.
        assert!(matches!(sock.read(&mut backend, &mut buf), Err(Error::WouldBlock)));
    }

    #[test]
    fn write_keeps_one_push_in_flight() {
        let mut backend = MemBackend::new();
        let (mut sock, remote) = connected_pair(&mut backend);
        backend.hold_pushes(true);

        assert_eq!(sock.write(&mut backend, b"abc").unwrap(), 3);
        assert!(!sock.writable());
        assert!(matches!(sock.write(&mut backend, b"def"), Err(Error::WouldBlock)));

        backend.hold_pushes(false);
        assert_eq!(sock.write(&mut backend, b"def").unwrap(), 3);
        assert_eq!(backend.remote_recv(remote).unwrap(), b"abc");
        assert_eq!(backend.remote_recv(remote).unwrap(), b"def");
    }

    #[test]
    fn writev_preserves_iovec_order() {
        let mut backend = MemBackend::new();
        let (mut sock, remote) = connected_pair(&mut backend);
        let head = *b"GET ";
        let tail = *b"/ HTTP/1.1";
        let iovs = [IoSlice::new(&head), IoSlice::new(&tail)];
        assert_eq!(sock.writev(&mut backend, &iovs).unwrap(), 14);
        sock.flush_send(&mut backend).unwrap();
        assert_eq!(backend.remote_recv(remote).unwrap(), b"GET / HTTP/1.1");
    }

    #[test]
    fn readv_stops_on_short_fill() {
        let mut backend = MemBackend::new();
        let (mut sock, remote) = connected_pair(&mut backend);
        backend.remote_send(remote, b"abc");

        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        let mut iovs = [IoSliceMut::new(&mut a), IoSliceMut::new(&mut b)];
        assert!(matches!(sock.readv(&mut backend, &mut iovs), Err(Error::WouldBlock)));
        // Three bytes short-fill the first iovec; the second is untouched.
        assert_eq!(sock.readv(&mut backend, &mut iovs).unwrap(), 3);
        assert_eq!(&a[..3], b"abc");
        assert_eq!(b, [0u8; 8]);
    }

    #[test]
    fn eof_reads_zero() {
        let mut backend = MemBackend::new();
        let (mut sock, remote) = connected_pair(&mut backend);
        backend.remote_close(remote);

        let mut buf = [0u8; 4];
        assert!(matches!(sock.read(&mut backend, &mut buf), Err(Error::WouldBlock)));
        assert_eq!(sock.read(&mut backend, &mut buf).unwrap(), 0);
    }

    #[test]
    fn close_drains_in_flight_push() {
        let mut backend = MemBackend::new();
        let (mut sock, remote) = connected_pair(&mut backend);
        assert_eq!(sock.write(&mut backend, b"bye").unwrap(), 3);
        sock.close(&mut backend).unwrap();
        assert_eq!(backend.remote_recv(remote).unwrap(), b"bye");
        assert_eq!(backend.outstanding_sgas(), 0);
    }

    #[test]
    #[should_panic(expected = "read on a listening socket")]
    fn read_on_listener_is_fatal() {
        let mut backend = MemBackend::new();
        let qd = backend.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        backend.bind(qd, addr(7001)).unwrap();
        backend.listen(qd, 4).unwrap();
        let mut sock = Socket::new(qd, 1);
        sock.mark_listening();
        let mut buf = [0u8; 4];
        let _ = sock.read(&mut backend, &mut buf);
    }
}
