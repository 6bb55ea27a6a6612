//! The shim context: descriptor router, POSIX-shaped API, readiness engine.
//!
//! A [`Stack`] owns the backend, the socket and epoll handle tables, and
//! routes every public entry point by descriptor range. Calls on host kernel
//! fds are forwarded to the host unchanged; calls on bypass descriptors
//! enter the state-machine layer. Everything runs on the calling thread; the
//! only suspension point is the backend wait inside [`Stack::epoll_wait`].

use std::io;
use std::io::{IoSlice, IoSliceMut};
use std::mem;
use std::net::SocketAddrV4;
use std::time::Duration;

use socket2::SockAddr;
use tracing::{trace, warn};

use crate::backend::{Backend, QDesc, QResult};
use crate::config::Config;
use crate::epoll::{CtlOp, EpollItem, EpollSet, Event, Interest, check_bypass_interest};
use crate::error::{Error, Result};
use crate::namespace::{Descriptor, epoll_handle, socket_handle};
use crate::socket::Socket;
use crate::table::HandleTable;

pub struct Stack<B: Backend> {
    backend: B,
    config: Config,
    sockets: HandleTable<Socket>,
    epolls: HandleTable<EpollSet>,
    /// Monotonic stamp handed to each new socket; never reused, unlike table
    /// indices and backend queue descriptors.
    next_serial: u64,
}

impl<B: Backend> Stack<B> {
    /// Wrap an initialised backend. Must be called once before any bypass
    /// operation; the backend is process-wide and lives until process exit.
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, Config::default())
    }

    pub fn with_config(backend: B, config: Config) -> Self {
        Self {
            backend,
            config,
            sockets: HandleTable::new(),
            epolls: HandleTable::new(),
            next_serial: 0,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Number of live bypass sockets.
    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    /// Number of live bypass epoll sets.
    pub fn epoll_count(&self) -> usize {
        self.epolls.len()
    }

    fn install_socket(&mut self, qd: QDesc, addr: Option<SocketAddrV4>) -> i32 {
        self.next_serial += 1;
        let mut sock = Socket::new(qd, self.next_serial);
        if let Some(addr) = addr {
            sock.set_addr(addr);
        }
        let index = self.sockets.insert(sock);
        trace!(%qd, handle = socket_handle(index), "bypass socket installed");
        socket_handle(index)
    }

    // === Socket surface ===

    /// `AF_INET` stream sockets are routed through the bypass path; every
    /// other combination falls through to the host kernel.
    pub fn socket(&mut self, domain: i32, ty: i32, protocol: i32) -> Result<i32> {
        if domain == libc::AF_INET && ty == libc::SOCK_STREAM {
            let qd = self.backend.socket(domain, ty, protocol)?;
            Ok(self.install_socket(qd, None))
        } else {
            check_host(unsafe { libc::socket(domain, ty, protocol) })
        }
    }

    pub fn bind(&mut self, fd: i32, addr: SocketAddrV4) -> Result<()> {
        match Descriptor::classify(fd) {
            Descriptor::Socket(index) => {
                let sock = self.sockets.get_mut(index).ok_or(Error::BadDescriptor)?;
                if addr.ip().is_unspecified() {
                    warn!(%addr, "backend does not support binding the wildcard address");
                }
                self.backend.bind(sock.qd(), addr)?;
                sock.set_addr(addr);
                Ok(())
            }
            Descriptor::Host(host_fd) => {
                let sa = SockAddr::from(addr);
                check_host(unsafe { libc::bind(host_fd, sa.as_ptr(), sa.len()) })?;
                Ok(())
            }
            Descriptor::Epoll(_) => Err(Error::BadDescriptor),
        }
    }

    pub fn listen(&mut self, fd: i32, backlog: i32) -> Result<()> {
        match Descriptor::classify(fd) {
            Descriptor::Socket(index) => {
                let sock = self.sockets.get_mut(index).ok_or(Error::BadDescriptor)?;
                self.backend.listen(sock.qd(), backlog.max(0) as usize)?;
                sock.mark_listening();
                Ok(())
            }
            Descriptor::Host(host_fd) => {
                check_host(unsafe { libc::listen(host_fd, backlog) })?;
                Ok(())
            }
            Descriptor::Epoll(_) => Err(Error::BadDescriptor),
        }
    }

    /// Bypass connect is not wired up in the backend contract; surfaced as
    /// unsupported rather than guessing a state transition.
    pub fn connect(&mut self, fd: i32, addr: SocketAddrV4) -> Result<()> {
        match Descriptor::classify(fd) {
            Descriptor::Socket(_) => Err(Error::Unsupported),
            Descriptor::Host(host_fd) => {
                let sa = SockAddr::from(addr);
                check_host(unsafe { libc::connect(host_fd, sa.as_ptr(), sa.len()) })?;
                Ok(())
            }
            Descriptor::Epoll(_) => Err(Error::BadDescriptor),
        }
    }

    /// Non-blocking accept. Returns the new handle and the peer address.
    pub fn accept(&mut self, fd: i32) -> Result<(i32, SocketAddrV4)> {
        match Descriptor::classify(fd) {
            Descriptor::Socket(index) => {
                let sock = self.sockets.get_mut(index).ok_or(Error::BadDescriptor)?;
                let listen_addr = sock.addr();
                let (new_qd, peer) = sock.accept(&mut self.backend)?;
                // The accepted socket inherits the listener's local address.
                let handle = self.install_socket(new_qd, listen_addr);
                Ok((handle, peer))
            }
            Descriptor::Host(host_fd) => {
                let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
                let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
                let new_fd = check_host(unsafe {
                    libc::accept(host_fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
                })?;
                let sa = unsafe { SockAddr::new(storage, len) };
                let peer = sa.as_socket_ipv4().ok_or(Error::Unsupported)?;
                Ok((new_fd, peer))
            }
            Descriptor::Epoll(_) => Err(Error::BadDescriptor),
        }
    }

    pub fn read(&mut self, fd: i32, buf: &mut [u8]) -> Result<usize> {
        match Descriptor::classify(fd) {
            Descriptor::Socket(index) => self
                .sockets
                .get_mut(index)
                .ok_or(Error::BadDescriptor)?
                .read(&mut self.backend, buf),
            Descriptor::Host(host_fd) => check_host_len(unsafe {
                libc::read(host_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            }),
            Descriptor::Epoll(_) => Err(Error::BadDescriptor),
        }
    }

    pub fn write(&mut self, fd: i32, buf: &[u8]) -> Result<usize> {
        match Descriptor::classify(fd) {
            Descriptor::Socket(index) => self
                .sockets
                .get_mut(index)
                .ok_or(Error::BadDescriptor)?
                .write(&mut self.backend, buf),
            Descriptor::Host(host_fd) => check_host_len(unsafe {
                libc::write(host_fd, buf.as_ptr() as *const libc::c_void, buf.len())
            }),
            Descriptor::Epoll(_) => Err(Error::BadDescriptor),
        }
    }

    pub fn readv(&mut self, fd: i32, iovs: &mut [IoSliceMut<'_>]) -> Result<usize> {
        match Descriptor::classify(fd) {
            Descriptor::Socket(index) => self
                .sockets
                .get_mut(index)
                .ok_or(Error::BadDescriptor)?
                .readv(&mut self.backend, iovs),
            // IoSliceMut is ABI-compatible with iovec.
            Descriptor::Host(host_fd) => check_host_len(unsafe {
                libc::readv(host_fd, iovs.as_mut_ptr() as *mut libc::iovec, iovs.len() as i32)
            }),
            Descriptor::Epoll(_) => Err(Error::BadDescriptor),
        }
    }

    pub fn writev(&mut self, fd: i32, iovs: &[IoSlice<'_>]) -> Result<usize> {
        match Descriptor::classify(fd) {
            Descriptor::Socket(index) => self
                .sockets
                .get_mut(index)
                .ok_or(Error::BadDescriptor)?
                .writev(&mut self.backend, iovs),
            Descriptor::Host(host_fd) => check_host_len(unsafe {
                libc::writev(host_fd, iovs.as_ptr() as *const libc::iovec, iovs.len() as i32)
            }),
            Descriptor::Epoll(_) => Err(Error::BadDescriptor),
        }
    }

    pub fn sendmsg(&mut self, fd: i32, msg: &libc::msghdr, flags: i32) -> Result<usize> {
        match Descriptor::classify(fd) {
            Descriptor::Socket(_) => unimplemented!("sendmsg on a bypass socket"),
            Descriptor::Host(host_fd) => {
                check_host_len(unsafe { libc::sendmsg(host_fd, msg, flags) })
            }
            Descriptor::Epoll(_) => Err(Error::BadDescriptor),
        }
    }

    pub fn recvmsg(&mut self, fd: i32, msg: &mut libc::msghdr, flags: i32) -> Result<usize> {
        match Descriptor::classify(fd) {
            Descriptor::Socket(_) => unimplemented!("recvmsg on a bypass socket"),
            Descriptor::Host(host_fd) => {
                check_host_len(unsafe { libc::recvmsg(host_fd, msg, flags) })
            }
            Descriptor::Epoll(_) => Err(Error::BadDescriptor),
        }
    }

    pub fn getsockname(&self, fd: i32) -> Result<SocketAddrV4> {
        match Descriptor::classify(fd) {
            Descriptor::Socket(index) => self
                .sockets
                .get(index)
                .ok_or(Error::BadDescriptor)?
                .addr()
                .ok_or(Error::NotBound),
            Descriptor::Host(host_fd) => {
                let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
                let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
                check_host(unsafe {
                    libc::getsockname(
                        host_fd,
                        &mut storage as *mut _ as *mut libc::sockaddr,
                        &mut len,
                    )
                })?;
                let sa = unsafe { SockAddr::new(storage, len) };
                sa.as_socket_ipv4().ok_or(Error::Unsupported)
            }
            Descriptor::Epoll(_) => Err(Error::BadDescriptor),
        }
    }

    /// Accepted and ignored on bypass sockets; forwarded on host fds.
    pub fn setsockopt(&mut self, fd: i32, level: i32, optname: i32, optval: &[u8]) -> Result<()> {
        match Descriptor::classify(fd) {
            Descriptor::Socket(index) => {
                self.sockets.get(index).ok_or(Error::BadDescriptor)?;
                trace!(fd, level, optname, "setsockopt ignored on bypass socket");
                Ok(())
            }
            Descriptor::Host(host_fd) => {
                check_host(unsafe {
                    libc::setsockopt(
                        host_fd,
                        level,
                        optname,
                        optval.as_ptr() as *const libc::c_void,
                        optval.len() as libc::socklen_t,
                    )
                })?;
                Ok(())
            }
            Descriptor::Epoll(_) => Err(Error::BadDescriptor),
        }
    }

    /// Close any descriptor. A bypass socket drains its in-flight push
    /// before the backend queue is released; any epoll sets still watching
    /// it evict the dead watch on their next sweep.
    pub fn close(&mut self, fd: i32) -> Result<()> {
        match Descriptor::classify(fd) {
            Descriptor::Socket(index) => {
                let mut sock = self.sockets.remove(index).ok_or(Error::BadDescriptor)?;
                trace!(qd = %sock.qd(), fd, "closing bypass socket");
                sock.close(&mut self.backend)
            }
            Descriptor::Epoll(index) => {
                self.epolls.remove(index).ok_or(Error::BadDescriptor)?;
                Ok(())
            }
            Descriptor::Host(host_fd) => {
                check_host(unsafe { libc::close(host_fd) })?;
                Ok(())
            }
        }
    }

    // === Epoll surface ===

    pub fn epoll_create(&mut self) -> Result<i32> {
        let set = EpollSet::new(&self.config)?;
        let index = self.epolls.insert(set);
        trace!(handle = epoll_handle(index), "epoll set created");
        Ok(epoll_handle(index))
    }

    /// Polymorphic in the watched fd: a bypass socket joins the internal
    /// item container; a host fd is registered on the set's own kernel
    /// epoll descriptor. `event` is required for `Add` and `Mod`.
    pub fn epoll_ctl(&mut self, epfd: i32, op: CtlOp, fd: i32, event: Option<Event>) -> Result<()> {
        let Descriptor::Epoll(ep_index) = Descriptor::classify(epfd) else {
            return Err(Error::BadDescriptor);
        };
        match Descriptor::classify(fd) {
            Descriptor::Host(host_fd) => {
                let ep = self.epolls.get(ep_index).ok_or(Error::BadDescriptor)?;
                let mut ev = libc::epoll_event { events: 0, u64: 0 };
                if let Some(event) = event {
                    ev.events = event.events.bits();
                    ev.u64 = event.data;
                }
                check_host(unsafe { libc::epoll_ctl(ep.host_fd, op.host_op(), host_fd, &mut ev) })?;
                Ok(())
            }
            Descriptor::Socket(index) => {
                let sock = self.sockets.get(index).ok_or(Error::BadDescriptor)?;
                let (qd, serial) = (sock.qd(), sock.serial());
                let ep = self.epolls.get_mut(ep_index).ok_or(Error::BadDescriptor)?;
                match op {
                    CtlOp::Add => {
                        let event = event.expect("epoll_ctl(ADD) without an event");
                        check_bypass_interest(event.events);
                        // A dead socket's watch may still occupy this qd if
                        // the backend recycled it; replace instead of EEXIST.
                        if let Some(existing) = ep.items.get(&qd) {
                            let stale = self
                                .sockets
                                .get(existing.sock_index)
                                .map(|s| s.serial() != existing.serial)
                                .unwrap_or(true);
                            if stale {
                                ep.items.remove(&qd);
                            }
                        }
                        ep.add(
                            qd,
                            EpollItem {
                                interest: event.events,
                                data: event.data,
                                sock_index: index,
                                serial,
                                in_ready: false,
                            },
                        )
                    }
                    CtlOp::Mod => {
                        let event = event.expect("epoll_ctl(MOD) without an event");
                        check_bypass_interest(event.events);
                        ep.modify(qd, event.events, event.data)
                    }
                    CtlOp::Del => ep.delete(qd),
                }
            }
            Descriptor::Epoll(_) => Err(Error::BadDescriptor),
        }
    }

    /// The sweep-and-wait. One pass over the watched items computes
    /// available events and schedules the missing operations, a single
    /// backend wait-any (bounded by the caller's timeout, coerced to a poll
    /// when deliverable events already exist) harvests at most one
    /// completion, then host kernel readiness and the ready-list are drained
    /// into `events` — host events first.
    pub fn epoll_wait(&mut self, epfd: i32, events: &mut [Event], timeout_ms: i32) -> Result<usize> {
        let Descriptor::Epoll(ep_index) = Descriptor::classify(epfd) else {
            return Err(Error::BadDescriptor);
        };
        let ep = self.epolls.get_mut(ep_index).ok_or(Error::BadDescriptor)?;
        if events.is_empty() {
            return Ok(0);
        }

        sweep(ep, &mut self.sockets, &mut self.backend)?;

        if !ep.tokens.is_empty() {
            let timeout = if ep.ready.is_empty() {
                timeout_duration(timeout_ms)
            } else {
                // Already-deliverable events must not wait on new arrivals.
                Some(Duration::ZERO)
            };
            trace!(tokens = ep.tokens.len(), "waiting on outstanding backend tokens");
            match self.backend.wait_any(&ep.tokens, timeout) {
                Ok((_, res)) => harvest(ep, &mut self.sockets, &mut self.backend, res),
                Err(Error::TimedOut) => {}
                Err(e) => return Err(e),
            }
        }

        // Host kernel readiness. The caller's timeout reaches the host wait
        // only when the backend side has nothing outstanding and nothing
        // deliverable.
        let host_timeout =
            if ep.tokens.is_empty() && ep.ready.is_empty() { timeout_ms } else { 0 };
        let mut count = host_wait(ep, events, host_timeout)?;

        count += drain_ready(ep, &self.sockets, &mut events[count..]);
        Ok(count)
    }
}

/// Pre-wait pass: for every watched item, link deliverable items onto the
/// ready-list, make sure each subscribed-but-unavailable event has an
/// in-flight operation backing it, and collect the outstanding tokens.
/// Items whose socket died are evicted.
fn sweep<B: Backend>(
    ep: &mut EpollSet,
    sockets: &mut HandleTable<Socket>,
    backend: &mut B,
) -> Result<()> {
    let EpollSet { items, ready, tokens, .. } = ep;
    tokens.clear();
    let mut evict: Vec<QDesc> = Vec::new();
    for (&qd, item) in items.iter_mut() {
        let sock = match sockets.get_mut(item.sock_index) {
            Some(sock) if sock.serial() == item.serial => sock,
            _ => {
                evict.push(qd);
                continue;
            }
        };
        let avs = item.available(sock);
        if !avs.is_empty() && !item.in_ready {
            item.in_ready = true;
            ready.push_back(qd);
        }
        let missing = (item.interest & (Interest::IN | Interest::OUT)) & !avs;
        if missing.contains(Interest::IN)
            && let Some(token) = sock.ensure_inbound_scheduled(backend)?
        {
            tokens.push(token);
        }
        if missing.contains(Interest::OUT) {
            // A push is only ever scheduled by write(); if EPOLLOUT is not
            // deliverable one must already be in flight.
            let token = sock.send_token().expect("EPOLLOUT unavailable without an in-flight push");
            tokens.push(token);
        }
    }
    for qd in evict {
        trace!(%qd, "evicting watch for a dead socket");
        items.remove(&qd);
    }
    Ok(())
}

/// Route one backend completion into its socket and re-link the item.
fn harvest<B: Backend>(
    ep: &mut EpollSet,
    sockets: &mut HandleTable<Socket>,
    backend: &mut B,
    res: QResult,
) {
    let qd = res.qd;
    let (sock_index, serial) = {
        let item = ep.items.get(&qd).expect("completion for an unwatched queue descriptor");
        (item.sock_index, item.serial)
    };
    let sock = sockets.get_mut(sock_index).expect("completion for a dead socket");
    assert_eq!(sock.serial(), serial, "completion for a recycled socket slot");
    trace!(%qd, token = res.token, "completion harvested");
    sock.apply_completion(backend, res);
    let deliverable = ep
        .items
        .get(&qd)
        .map(|item| !item.available(sock).is_empty())
        .unwrap_or(false);
    if deliverable {
        ep.link_ready(qd);
    }
}

/// Harvest host kernel readiness into the front of `events`.
fn host_wait(ep: &mut EpollSet, events: &mut [Event], timeout_ms: i32) -> Result<usize> {
    ep.host_events.clear();
    ep.host_events.resize(events.len(), libc::epoll_event { events: 0, u64: 0 });
    let rc = unsafe {
        libc::epoll_wait(ep.host_fd, ep.host_events.as_mut_ptr(), events.len() as i32, timeout_ms)
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            return Ok(0);
        }
        return Err(Error::Host(err));
    }
    for (slot, ev) in events.iter_mut().zip(&ep.host_events[..rc as usize]) {
        *slot = Event { events: Interest::from_bits_retain(ev.events), data: ev.u64 };
    }
    Ok(rc as usize)
}

/// Emit ready items into `events`, unlinking each on emission. Stale
/// entries (deleted watches, dead sockets, items that stopped being
/// deliverable) are skipped; items that do not fit in `events` stay linked.
fn drain_ready(ep: &mut EpollSet, sockets: &HandleTable<Socket>, events: &mut [Event]) -> usize {
    let mut n = 0;
    while n < events.len() {
        let Some(qd) = ep.ready.pop_front() else { break };
        let Some(item) = ep.items.get_mut(&qd) else { continue };
        if !item.in_ready {
            continue;
        }
        item.in_ready = false;
        let Some(sock) = sockets.get(item.sock_index) else { continue };
        if sock.serial() != item.serial {
            continue;
        }
        let avs = item.available(sock);
        if avs.is_empty() {
            continue;
        }
        events[n] = Event { events: avs, data: item.data };
        n += 1;
    }
    n
}

fn timeout_duration(ms: i32) -> Option<Duration> {
    if ms < 0 { None } else { Some(Duration::from_millis(ms as u64)) }
}

fn check_host(rc: i32) -> Result<i32> {
    if rc < 0 { Err(Error::last_os_error()) } else { Ok(rc) }
}

fn check_host_len(rc: isize) -> Result<usize> {
    if rc < 0 { Err(Error::last_os_error()) } else { Ok(rc as usize) }
}
