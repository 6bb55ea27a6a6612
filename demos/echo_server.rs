//! Echo server over the in-memory backend.
//!
//! Runs the full shim event loop against the testkit's loopback fabric: a
//! scripted remote peer connects, sends a few messages, and reads back the
//! echoes. Set `DEMI_EPOLL_LOG=trace` to watch the engine work.

use demi_epoll::testkit::MemBackend;
use demi_epoll::{CtlOp, Error, Event, Interest, Stack, logging};

fn main() -> demi_epoll::Result<()> {
    logging::init();

    let addr = "127.0.0.1:2137".parse().unwrap();
    let mut stack = Stack::new(MemBackend::new());
    let listener = stack.socket(libc::AF_INET, libc::SOCK_STREAM, 0)?;
    stack.bind(listener, addr)?;
    stack.listen(listener, 16)?;
    println!("listening on {addr}");

    let ep = stack.epoll_create()?;
    stack.epoll_ctl(
        ep,
        CtlOp::Add,
        listener,
        Some(Event { events: Interest::IN, data: listener as u64 }),
    )?;

    // The scripted remote peer standing in for the network.
    let remote = stack.backend_mut().remote_connect(addr)?;
    let messages: &[&[u8]] = &[b"hello", b"echo", b"bye"];
    let total: usize = messages.iter().map(|m| m.len()).sum();
    for msg in messages {
        stack.backend_mut().remote_send(remote, msg);
    }

    let mut events = [Event { events: Interest::empty(), data: 0 }; 16];
    let mut echoed = 0;
    while echoed < total {
        let n = stack.epoll_wait(ep, &mut events, 10)?;
        for event in events[..n].iter().copied() {
            let fd = event.data as i32;
            if fd == listener {
                let (conn, peer) = stack.accept(listener)?;
                println!("accepted {peer}");
                stack.epoll_ctl(
                    ep,
                    CtlOp::Add,
                    conn,
                    Some(Event { events: Interest::IN, data: conn as u64 }),
                )?;
            } else {
                let mut buf = [0u8; 4096];
                match stack.read(fd, &mut buf) {
                    Ok(0) => {
                        stack.close(fd)?;
                    }
                    Ok(n) => {
                        stack.write(fd, &buf[..n])?;
                        echoed += n;
                    }
                    Err(Error::WouldBlock) => {}
                    Err(e) => return Err(e),
                }
            }
        }
    }

    while let Some(reply) = stack.backend_mut().remote_recv(remote) {
        println!("echoed: {}", String::from_utf8_lossy(&reply));
    }
    Ok(())
}
