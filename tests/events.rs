use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use latzero::api::{ErrorKind, PoolManager, PoolOptions, Value};

fn manager(dir: &tempfile::TempDir) -> PoolManager {
    PoolManager::with_dir(dir.path().join("base")).expect("manager")
}

fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn emitted_events_reach_listeners_on_other_handles() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = manager(&temp);
    manager.create("bus", PoolOptions::new()).expect("create");
    let sender = manager.connect("bus").expect("connect sender");
    // A second manager owns its own registry mapping, like another process.
    let other = PoolManager::with_dir(temp.path().join("base")).expect("second manager");
    let receiver = other.connect("bus").expect("connect receiver");

    let seen = Arc::new(AtomicUsize::new(0));
    let total = Arc::new(AtomicUsize::new(0));
    let (count, sum) = (Arc::clone(&seen), Arc::clone(&total));
    receiver.on_event("tick", move |value| {
        if let Value::Int(n) = value {
            sum.fetch_add(n as usize, Ordering::SeqCst);
        }
        count.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Null)
    });
    receiver.listen().expect("listen");
    assert!(receiver.is_listening());

    for n in 1..=3i64 {
        sender.emit_event("tick", n).expect("emit");
    }
    sender.emit_event("unrelated", "ignored").expect("emit");

    assert!(wait_for(|| seen.load(Ordering::SeqCst) == 3));
    assert_eq!(total.load(Ordering::SeqCst), 6);

    receiver.stop_events().expect("stop");
    assert!(!receiver.is_listening());
    sender.emit_event("tick", 10i64).expect("emit after stop");
    thread::sleep(Duration::from_millis(50));
    assert_eq!(seen.load(Ordering::SeqCst), 3);
}

#[test]
fn call_returns_the_handler_reply() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = manager(&temp);
    manager.create("rpc", PoolOptions::new()).expect("create");
    let server = manager.connect("rpc").expect("connect server");
    let client = manager.connect("rpc").expect("connect client");

    server.on_event("add", |value| match value {
        Value::List(items) => {
            let mut sum = 0;
            for item in items {
                match item {
                    Value::Int(n) => sum += n,
                    other => return Err(format!("not an int: {other:?}")),
                }
            }
            Ok(Value::Int(sum))
        }
        other => Err(format!("expected a list, got {other:?}")),
    });
    server.listen().expect("listen");

    let reply = client
        .call_event("add", vec![Value::Int(2), Value::Int(40)], Duration::from_secs(5))
        .expect("call");
    assert_eq!(reply, Value::Int(42));

    let err = client
        .call_event("add", "nope", Duration::from_secs(5))
        .expect_err("handler error");
    assert_eq!(err.kind(), ErrorKind::HandlerFailed);
    assert!(err.to_string().contains("expected a list"));
}

#[test]
fn call_without_a_listener_times_out() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = manager(&temp);
    manager.create("silent", PoolOptions::new()).expect("create");
    let handle = manager.connect("silent").expect("connect");

    let started = Instant::now();
    let err = handle
        .call_event("nobody", 1i64, Duration::from_millis(100))
        .expect_err("no reply");
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[test]
fn encrypted_pool_events_round_trip_sealed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = manager(&temp);
    let options = PoolOptions::new()
        .encrypted(true)
        .credential("event-secret")
        .kdf_rounds(latzero::api::MIN_KDF_ROUNDS);
    let info = manager.create("sealed-bus", options).expect("create");
    let connect = latzero::api::ConnectOptions::new().credential("event-secret");
    let server = manager
        .connect_with("sealed-bus", &connect)
        .expect("connect server");
    let client = manager
        .connect_with("sealed-bus", &connect)
        .expect("connect client");

    let marker = "event-plaintext-marker-5521";
    server.on_event("echo", Ok);
    server.listen().expect("listen");
    let reply = client
        .call_event("echo", marker, Duration::from_secs(5))
        .expect("call");
    assert_eq!(reply, Value::from(marker));

    let ring = std::fs::read(info.dir.join("events")).expect("read ring");
    assert!(!ring.windows(marker.len()).any(|window| window == marker.as_bytes()));
}

#[test]
fn listener_stops_when_the_pool_is_destroyed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = manager(&temp);
    manager.create("short-lived", PoolOptions::new()).expect("create");
    let handle = manager.connect("short-lived").expect("connect");
    handle.on_event("t", Ok);
    handle.listen().expect("listen");

    manager.destroy("short-lived").expect("destroy");
    assert!(wait_for(|| !handle.is_listening()));
    let err = handle.emit_event("t", 1i64).expect_err("pool gone");
    assert!(matches!(
        err.kind(),
        ErrorKind::PoolNotFound | ErrorKind::Disconnected
    ));
}
