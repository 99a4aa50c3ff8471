// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Blocking-style primitives over real descriptors: sockets, socket
//! pairs, and files.

use std::os::unix::io::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use coio_rt::{co_write, Co, CoError, Handle, OpenMode, Runtime, RuntimeConfig};

fn runtime() -> Runtime {
    let _ = env_logger::builder().is_test(true).try_init();
    Runtime::new(RuntimeConfig {
        poll_timeout: Some(Duration::from_millis(20)),
        ..RuntimeConfig::default()
    })
    .unwrap()
}

/// Read until end of stream.
fn read_to_end(co: &Co, h: Handle) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match co.read(h, &mut buf).unwrap() {
            0 => return out,
            n => out.extend_from_slice(&buf[..n]),
        }
    }
}

#[test]
fn listener_reads_ping_from_client() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let r = received.clone();

    runtime()
        .run(move |co| {
            let listener = co.bind_tcp("127.0.0.1", 0, 16).unwrap();
            let port = co.local_addr(listener).unwrap().port();

            co.spawn(move |co| {
                let conn = co.connect_tcp("127.0.0.1", port).unwrap();
                co.write_all(conn, b"ping").unwrap();
                co.close(conn);
            })
            .unwrap();

            let (conn, peer) = co.accept(listener).unwrap();
            assert!(peer.ip().is_loopback());

            let mut buf = [0u8; 16];
            let n = co.read(conn, &mut buf).unwrap();
            r.lock().unwrap().extend_from_slice(&buf[..n]);

            co.close(conn);
            co.close(listener);
        })
        .unwrap();

    assert_eq!(&*received.lock().unwrap(), b"ping");
}

#[test]
fn bytes_arrive_in_order_across_suspensions() {
    let (a, b) = UnixStream::pair().unwrap();
    let payload: Vec<u8> = (0..512 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let received = Arc::new(Mutex::new(Vec::new()));
    let r = received.clone();

    runtime()
        .run(move |co| {
            let reader = co.adopt(OwnedFd::from(a)).unwrap();
            let writer = co.adopt(OwnedFd::from(b)).unwrap();

            co.spawn(move |co| {
                for chunk in payload.chunks(4096) {
                    co.write_all(writer, chunk).unwrap();
                }
                co.close(writer);
            })
            .unwrap();

            co.spawn(move |co| {
                let data = read_to_end(co, reader);
                *r.lock().unwrap() = data;
                co.close(reader);
            })
            .unwrap();
        })
        .unwrap();

    let received = received.lock().unwrap();
    assert_eq!(received.len(), expected.len());
    assert!(*received == expected);
}

#[test]
fn unreachable_connects_fail_independently() {
    // Grab a free port, then release it so nothing listens there.
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    let results = Arc::new(Mutex::new(Vec::new()));
    let res = results.clone();
    let rt = runtime();
    let co = rt.handle();

    rt.run(move |co| {
        for _ in 0..2 {
            let res = res.clone();
            co.spawn(move |co| {
                let r = co.connect_tcp("127.0.0.1", port);
                res.lock()
                    .unwrap()
                    .push(matches!(r, Err(CoError::Connect { .. })));
            })
            .unwrap();
        }
    })
    .unwrap();

    assert_eq!(*results.lock().unwrap(), vec![true, true]);
    assert_eq!(co.open_handles(), 0);
}

#[test]
fn unresolvable_host_produces_no_handle() {
    runtime()
        .run(|co| {
            let err = co.connect_tcp("::1", 80).unwrap_err();
            assert!(matches!(err, CoError::NoIpv4Address { .. }));
            assert_eq!(co.open_handles(), 0);
        })
        .unwrap();
}

#[test]
fn open_honors_requested_mode() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("greeting.txt");
    let p = path.clone();

    runtime()
        .run(move |co| {
            let h = co.open(&p, OpenMode::WriteOnly, 0o644).unwrap();
            co.write_all(h, b"hello").unwrap();
            co.close(h);

            let h = co.open(&p, OpenMode::Append, 0o644).unwrap();
            co.write_all(h, b" world").unwrap();
            co.close(h);

            let h = co.open(&p, OpenMode::ReadOnly, 0).unwrap();
            assert_eq!(read_to_end(co, h), b"hello world");

            // The OS error comes back untouched.
            match co.write(h, b"!") {
                Err(CoError::Io(e)) => assert_eq!(e.raw_os_error(), Some(libc::EBADF)),
                other => panic!("expected EBADF, got {:?}", other),
            }
            co.close(h);
        })
        .unwrap();

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello world");
}

#[test]
fn read_write_mode_keeps_existing_content() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.bin");
    std::fs::write(&path, b"abcdef").unwrap();
    let p = path.clone();

    runtime()
        .run(move |co| {
            let h = co.open(&p, OpenMode::ReadWrite, 0o600).unwrap();
            co.write_all(h, b"XY").unwrap();
            assert_eq!(read_to_end(co, h), b"cdef");
            co.close(h);
        })
        .unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), b"XYcdef");
}

#[test]
fn open_missing_file_fails_without_handle() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope");

    runtime()
        .run(move |co| {
            match co.open(&missing, OpenMode::ReadOnly, 0) {
                Err(CoError::Open { path, source }) => {
                    assert_eq!(path, missing);
                    assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
                }
                other => panic!("expected Open error, got {:?}", other),
            }
            assert_eq!(co.open_handles(), 0);
        })
        .unwrap();
}

#[test]
fn formatted_write_reaches_peer() {
    let (a, b) = UnixStream::pair().unwrap();
    let text = Arc::new(Mutex::new(String::new()));
    let t = text.clone();

    runtime()
        .run(move |co| {
            let out = co.adopt(OwnedFd::from(a)).unwrap();
            let input = co.adopt(OwnedFd::from(b)).unwrap();

            let n = co_write!(co, out, "{} + {} = {}\n", 2, 2, 2 + 2).unwrap();
            assert_eq!(n, 10);
            co.close(out);

            let data = read_to_end(co, input);
            *t.lock().unwrap() = String::from_utf8(data).unwrap();
            co.close(input);
        })
        .unwrap();

    assert_eq!(*text.lock().unwrap(), "2 + 2 = 4\n");
}

#[test]
fn echo_server_handles_clients_concurrently() {
    const CLIENTS: usize = 3;
    let replies = Arc::new(Mutex::new(Vec::new()));
    let rep = replies.clone();

    runtime()
        .run(move |co| {
            let listener = co.bind_tcp("127.0.0.1", 0, 16).unwrap();
            let port = co.local_addr(listener).unwrap().port();

            for i in 0..CLIENTS {
                let rep = rep.clone();
                co.spawn(move |co| {
                    let conn = co.connect_tcp("localhost", port).unwrap();
                    let msg = format!("client {}", i);
                    co.write_all(conn, msg.as_bytes()).unwrap();

                    let mut buf = [0u8; 64];
                    let n = co.read(conn, &mut buf).unwrap();
                    rep.lock()
                        .unwrap()
                        .push(String::from_utf8_lossy(&buf[..n]).into_owned());
                    co.close(conn);
                })
                .unwrap();
            }

            for _ in 0..CLIENTS {
                let (conn, _) = co.accept(listener).unwrap();
                co.spawn(move |co| {
                    let mut buf = [0u8; 64];
                    loop {
                        match co.read(conn, &mut buf).unwrap() {
                            0 => break,
                            n => co.write_all(conn, &buf[..n]).unwrap(),
                        }
                    }
                    co.close(conn);
                })
                .unwrap();
            }
            co.close(listener);
        })
        .unwrap();

    let mut replies = replies.lock().unwrap().clone();
    replies.sort();
    assert_eq!(replies, vec!["client 0", "client 1", "client 2"]);
}
