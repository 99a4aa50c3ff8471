// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Scheduling order and contract enforcement on a real runtime.

use std::io::Read;
use std::os::unix::io::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use coio_rt::{CoError, ContractViolation, Runtime, RuntimeConfig};

fn runtime() -> Runtime {
    let _ = env_logger::builder().is_test(true).try_init();
    Runtime::new(RuntimeConfig {
        poll_timeout: Some(Duration::from_millis(20)),
        ..RuntimeConfig::default()
    })
    .unwrap()
}

#[test]
fn newest_unstarted_fiber_runs_first() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let o = order.clone();

    runtime()
        .run(move |co| {
            for name in ["a", "b", "c"] {
                let o = o.clone();
                co.spawn(move |_| o.lock().unwrap().push(name)).unwrap();
            }
        })
        .unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["c", "b", "a"]);
}

#[test]
fn spawned_work_runs_before_ready_io() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let o = order.clone();
    let (a, b) = UnixStream::pair().unwrap();

    runtime()
        .run(move |co| {
            let reader = co.adopt(OwnedFd::from(a)).unwrap();
            let writer = co.adopt(OwnedFd::from(b)).unwrap();

            let o2 = o.clone();
            co.spawn(move |co| {
                let mut buf = [0u8; 8];
                let n = co.read(reader, &mut buf).unwrap();
                o2.lock().unwrap().push(format!("read {}", n));
                co.close(reader);
            })
            .unwrap();

            let o3 = o.clone();
            co.spawn(move |co| {
                co.write_all(writer, b"hi").unwrap();
                o3.lock().unwrap().push("wrote".to_string());
                // Spawned while the reader is parked on ready data: the
                // new fiber still goes first.
                let o4 = o3.clone();
                co.spawn(move |_| o4.lock().unwrap().push("late spawn".to_string()))
                    .unwrap();
                co.close(writer);
            })
            .unwrap();
        })
        .unwrap();

    assert_eq!(
        *order.lock().unwrap(),
        vec!["wrote", "late spawn", "read 2"]
    );
}

#[test]
fn second_waiter_on_a_handle_is_fatal() {
    let (a, _peer) = UnixStream::pair().unwrap();
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let out = outcomes.clone();

    let err = runtime()
        .run(move |co| {
            let h = co.adopt(OwnedFd::from(a)).unwrap();
            for _ in 0..2 {
                let out = out.clone();
                co.spawn(move |co| {
                    let mut buf = [0u8; 4];
                    let r = co.read(h, &mut buf);
                    out.lock()
                        .unwrap()
                        .push(r.map(|_| ()).map_err(|e| e.as_contract().cloned()));
                })
                .unwrap();
            }
        })
        .unwrap_err();

    match err.as_contract() {
        Some(ContractViolation::DoubleWait { .. }) => {}
        other => panic!("expected DoubleWait, got {:?}", other),
    }

    // Only the second reader returned; the first stayed parked until the
    // loop stopped.
    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(
        outcomes[0],
        Err(Some(ContractViolation::DoubleWait { .. }))
    ));
}

#[test]
fn blocking_io_outside_a_fiber_is_rejected() {
    let rt = runtime();
    let co = rt.handle();
    let (a, _peer) = UnixStream::pair().unwrap();
    let h = co.adopt(OwnedFd::from(a)).unwrap();

    let mut buf = [0u8; 4];
    let err = co.read(h, &mut buf).unwrap_err();
    assert_eq!(err.as_contract(), Some(&ContractViolation::NotInFiber));
    assert!(err.is_fatal());
}

#[test]
fn use_after_close_is_fatal() {
    let (a, _peer) = UnixStream::pair().unwrap();

    let err = runtime()
        .run(move |co| {
            let h = co.adopt(OwnedFd::from(a)).unwrap();
            co.close(h);
            // A second close is ignored.
            co.close(h);
            let _ = co.write(h, b"x");
        })
        .unwrap_err();

    assert!(matches!(
        err.as_contract(),
        Some(ContractViolation::StaleHandle(_))
    ));
}

#[test]
fn close_of_nothing_is_a_no_op() {
    runtime().run(|co| co.close(None)).unwrap();
}

#[test]
fn fiber_panic_stops_the_loop() {
    let err = runtime()
        .run(|co| {
            co.spawn(|_| panic!("handler exploded")).unwrap();
        })
        .unwrap_err();

    match err {
        CoError::FiberPanicked(msg) => assert!(msg.contains("handler exploded")),
        other => panic!("expected FiberPanicked, got {:?}", other),
    }
}

#[test]
fn handles_left_open_are_closed_when_run_returns() {
    let (a, mut peer) = UnixStream::pair().unwrap();
    let rt = runtime();
    let co = rt.handle();

    rt.run(move |co| {
        let listener = co.bind_tcp("127.0.0.1", 0, 4).unwrap();
        co.close(listener);
        // Never closed by the program.
        co.adopt(OwnedFd::from(a)).unwrap();
    })
    .unwrap();

    assert_eq!(co.open_handles(), 0);
    assert_eq!(co.live_fibers(), 0);

    // The adopted end is gone, so its peer sees end of stream.
    peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(peer.read(&mut buf).unwrap(), 0);
}

#[test]
fn stdout_flags_are_restored() {
    let flags = || unsafe { libc::fcntl(libc::STDOUT_FILENO, libc::F_GETFL) };
    let before = flags();
    assert!(before >= 0);

    runtime()
        .run(move |co| {
            let out = co.stdout().unwrap();
            assert_ne!(flags() & libc::O_NONBLOCK, 0);
            co.close(out);
            assert_eq!(flags(), before);

            // Left open: restored at shutdown instead.
            co.stdout().unwrap();
        })
        .unwrap();

    assert_eq!(flags(), before);
}
