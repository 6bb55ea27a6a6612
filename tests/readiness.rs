//! Readiness engine behaviors: level triggering, timeout coercion, EPOLLOUT
//! deferral, watch lifecycle.

use std::net::SocketAddrV4;

use demi_epoll::testkit::MemBackend;
use demi_epoll::{CtlOp, Error, Event, Interest, Stack};

fn addr(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new([127, 0, 0, 1].into(), port)
}

fn no_events() -> [Event; 8] {
    [Event { events: Interest::empty(), data: 0 }; 8]
}

/// Stack with one listener and one accepted connection.
fn connected_stack(port: u16) -> (Stack<MemBackend>, i32, i32, demi_epoll::testkit::Remote) {
    let mut stack = Stack::new(MemBackend::new());
    let listener = stack.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
    stack.bind(listener, addr(port)).unwrap();
    stack.listen(listener, 4).unwrap();
    let remote = stack.backend_mut().remote_connect(addr(port)).unwrap();
    let conn = loop {
        match stack.accept(listener) {
            Ok((conn, _)) => break conn,
            Err(Error::WouldBlock) => continue,
            Err(e) => panic!("accept failed: {e}"),
        }
    };
    (stack, listener, conn, remote)
}

#[test]
fn zero_timeout_with_nothing_ready_returns_empty() {
    let (mut stack, _listener, conn, _remote) = connected_stack(3000);
    let ep = stack.epoll_create().unwrap();
    stack
        .epoll_ctl(ep, CtlOp::Add, conn, Some(Event { events: Interest::IN, data: 1 }))
        .unwrap();
    let mut events = no_events();
    assert_eq!(stack.epoll_wait(ep, &mut events, 0).unwrap(), 0);
    // No spurious readiness on repeat.
    assert_eq!(stack.epoll_wait(ep, &mut events, 0).unwrap(), 0);
}

#[test]
fn epollout_deferred_until_push_completes() {
    let (mut stack, _listener, conn, _remote) = connected_stack(3001);
    stack.backend_mut().hold_pushes(true);
    assert_eq!(stack.write(conn, b"abc").unwrap(), 3);

    let ep = stack.epoll_create().unwrap();
    stack
        .epoll_ctl(ep, CtlOp::Add, conn, Some(Event { events: Interest::OUT, data: 1 }))
        .unwrap();

    // Push in flight: the subscription is live but nothing is deliverable.
    let mut events = no_events();
    assert_eq!(stack.epoll_wait(ep, &mut events, 0).unwrap(), 0);

    stack.backend_mut().hold_pushes(false);
    let n = stack.epoll_wait(ep, &mut events, -1).unwrap();
    assert_eq!(n, 1);
    assert!(events[0].events.contains(Interest::OUT));
}

#[test]
fn level_triggered_residue_reports_again_without_backend_activity() {
    let (mut stack, _listener, conn, remote) = connected_stack(3002);
    stack.backend_mut().remote_send(remote, b"0123456789");

    let ep = stack.epoll_create().unwrap();
    stack
        .epoll_ctl(ep, CtlOp::Add, conn, Some(Event { events: Interest::IN, data: 1 }))
        .unwrap();

    let mut events = no_events();
    assert_eq!(stack.epoll_wait(ep, &mut events, -1).unwrap(), 1);

    let mut buf = [0u8; 3];
    assert_eq!(stack.read(conn, &mut buf).unwrap(), 3);

    // Seven bytes remain buffered: readable again with no new completions.
    assert_eq!(stack.epoll_wait(ep, &mut events, 0).unwrap(), 1);
    assert!(events[0].events.contains(Interest::IN));

    let mut rest = [0u8; 7];
    assert_eq!(stack.read(conn, &mut rest).unwrap(), 7);
    assert_eq!(stack.epoll_wait(ep, &mut events, 0).unwrap(), 0);
}

#[test]
fn nonempty_ready_list_coerces_infinite_timeout_to_poll() {
    let (mut stack, listener, conn, remote) = connected_stack(3003);
    stack.backend_mut().remote_send(remote, b"ready");

    let ep = stack.epoll_create().unwrap();
    stack
        .epoll_ctl(ep, CtlOp::Add, conn, Some(Event { events: Interest::IN, data: 1 }))
        .unwrap();
    // A second watch whose operations can never complete; an uncoerced
    // infinite backend wait would hang here (the test backend aborts on an
    // infinite wait with no completable token).
    stack
        .epoll_ctl(ep, CtlOp::Add, listener, Some(Event { events: Interest::IN, data: 2 }))
        .unwrap();

    let mut events = no_events();
    // First call pops the data and reports readable.
    assert_eq!(stack.epoll_wait(ep, &mut events, -1).unwrap(), 1);
    assert_eq!(events[0].data, 1);
    // Data still unread: the ready list is non-empty, so an infinite
    // timeout must degrade to a poll and return immediately.
    assert_eq!(stack.epoll_wait(ep, &mut events, -1).unwrap(), 1);
    assert_eq!(events[0].data, 1);
}

#[test]
fn modified_interest_takes_effect() {
    let (mut stack, _listener, conn, remote) = connected_stack(3004);
    stack.backend_mut().remote_send(remote, b"x");

    let ep = stack.epoll_create().unwrap();
    stack
        .epoll_ctl(ep, CtlOp::Add, conn, Some(Event { events: Interest::IN, data: 1 }))
        .unwrap();
    let mut events = no_events();
    assert_eq!(stack.epoll_wait(ep, &mut events, -1).unwrap(), 1);

    // Drop the IN subscription; buffered data no longer fires.
    stack
        .epoll_ctl(ep, CtlOp::Mod, conn, Some(Event { events: Interest::OUT, data: 9 }))
        .unwrap();
    let n = stack.epoll_wait(ep, &mut events, 0).unwrap();
    assert_eq!(n, 1);
    assert_eq!(events[0].data, 9);
    assert_eq!(events[0].events, Interest::OUT);
}

#[test]
fn deleted_watch_stops_reporting() {
    let (mut stack, _listener, conn, remote) = connected_stack(3005);
    stack.backend_mut().remote_send(remote, b"x");

    let ep = stack.epoll_create().unwrap();
    stack
        .epoll_ctl(ep, CtlOp::Add, conn, Some(Event { events: Interest::IN, data: 1 }))
        .unwrap();
    let mut events = no_events();
    assert_eq!(stack.epoll_wait(ep, &mut events, -1).unwrap(), 1);

    stack.epoll_ctl(ep, CtlOp::Del, conn, None).unwrap();
    assert_eq!(stack.epoll_wait(ep, &mut events, 0).unwrap(), 0);
}

#[test]
fn watch_lifecycle_errors() {
    let (mut stack, _listener, conn, _remote) = connected_stack(3006);
    let ep = stack.epoll_create().unwrap();
    let ev = Event { events: Interest::IN, data: 0 };

    assert!(matches!(stack.epoll_ctl(ep, CtlOp::Mod, conn, Some(ev)), Err(Error::NotFound)));
    assert!(matches!(stack.epoll_ctl(ep, CtlOp::Del, conn, None), Err(Error::NotFound)));
    stack.epoll_ctl(ep, CtlOp::Add, conn, Some(ev)).unwrap();
    assert!(matches!(stack.epoll_ctl(ep, CtlOp::Add, conn, Some(ev)), Err(Error::Exists)));
    // An epoll set cannot watch another bypass epoll set.
    let ep2 = stack.epoll_create().unwrap();
    assert!(matches!(stack.epoll_ctl(ep, CtlOp::Add, ep2, Some(ev)), Err(Error::BadDescriptor)));
}

#[test]
fn closed_socket_watch_is_evicted_on_sweep() {
    let (mut stack, _listener, conn, remote) = connected_stack(3007);
    stack.backend_mut().remote_send(remote, b"x");

    let ep = stack.epoll_create().unwrap();
    stack
        .epoll_ctl(ep, CtlOp::Add, conn, Some(Event { events: Interest::IN, data: 1 }))
        .unwrap();
    let mut events = no_events();
    assert_eq!(stack.epoll_wait(ep, &mut events, -1).unwrap(), 1);

    stack.close(conn).unwrap();
    // The dead watch is observed and evicted; nothing fires.
    assert_eq!(stack.epoll_wait(ep, &mut events, 0).unwrap(), 0);

    // The handle slot may be recycled; a fresh socket can be watched again.
    let fresh = stack.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
    assert_eq!(fresh, conn);
    stack
        .epoll_ctl(ep, CtlOp::Add, fresh, Some(Event { events: Interest::OUT, data: 5 }))
        .unwrap();
    assert_eq!(stack.epoll_wait(ep, &mut events, 0).unwrap(), 1);
    assert_eq!(events[0].data, 5);
}
