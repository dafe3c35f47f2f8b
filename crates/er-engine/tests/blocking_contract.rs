//! Cross-thread contracts for the blocking list pops.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use er_engine::{Engine, ManualClock};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn engine() -> Engine {
    init_tracing();
    Engine::with_clock_and_seed(Arc::new(ManualClock::new(0)), 1)
}

fn bytes(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}

#[test]
fn push_after_delay_wakes_a_blocked_pop() {
    let engine = engine();
    let waiter = {
        let engine = engine.clone();
        thread::spawn(move || engine.blpop(0, &[b"queue"]).unwrap())
    };
    thread::sleep(Duration::from_millis(150));
    engine.rpush(b"queue", &[bytes("x")]).unwrap();
    let result = waiter.join().unwrap();
    assert_eq!(result, Some((bytes("queue"), bytes("x"))));
}

#[test]
fn positive_timeout_expires_with_none() {
    let engine = engine();
    let started = Instant::now();
    let result = engine.blpop(1, &[b"nothing"]).unwrap();
    assert_eq!(result, None);
    assert!(started.elapsed() >= Duration::from_millis(900));
}

#[test]
fn waiters_on_one_key_are_served_fifo() {
    let engine = engine();
    let first = {
        let engine = engine.clone();
        thread::spawn(move || engine.blpop(0, &[b"jobs"]).unwrap())
    };
    thread::sleep(Duration::from_millis(100));
    let second = {
        let engine = engine.clone();
        thread::spawn(move || engine.blpop(0, &[b"jobs"]).unwrap())
    };
    thread::sleep(Duration::from_millis(100));

    engine.rpush(b"jobs", &[bytes("one")]).unwrap();
    thread::sleep(Duration::from_millis(100));
    engine.rpush(b"jobs", &[bytes("two")]).unwrap();

    assert_eq!(first.join().unwrap(), Some((bytes("jobs"), bytes("one"))));
    assert_eq!(second.join().unwrap(), Some((bytes("jobs"), bytes("two"))));
}

#[test]
fn one_push_delivers_each_element_exactly_once() {
    let engine = engine();
    let spawn_waiter = |engine: &Engine| {
        let engine = engine.clone();
        thread::spawn(move || engine.blpop(0, &[b"work"]).unwrap())
    };
    let a = spawn_waiter(&engine);
    let b = spawn_waiter(&engine);
    thread::sleep(Duration::from_millis(100));

    engine.rpush(b"work", &[bytes("e1"), bytes("e2")]).unwrap();

    let mut got = vec![
        a.join().unwrap().unwrap().1,
        b.join().unwrap().unwrap().1,
    ];
    got.sort();
    assert_eq!(got, vec![bytes("e1"), bytes("e2")]);
}

#[test]
fn multi_key_waiter_takes_from_whichever_key_fills() {
    let engine = engine();
    let waiter = {
        let engine = engine.clone();
        thread::spawn(move || engine.blpop(0, &[b"first", b"second"]).unwrap())
    };
    thread::sleep(Duration::from_millis(100));
    engine.rpush(b"second", &[bytes("v")]).unwrap();
    assert_eq!(
        waiter.join().unwrap(),
        Some((bytes("second"), bytes("v")))
    );
}

#[test]
fn brpop_takes_from_the_tail() {
    let engine = engine();
    let waiter = {
        let engine = engine.clone();
        thread::spawn(move || engine.brpop(0, &[b"stack"]).unwrap())
    };
    thread::sleep(Duration::from_millis(100));
    engine.rpush(b"stack", &[bytes("a"), bytes("b")]).unwrap();
    assert_eq!(waiter.join().unwrap(), Some((bytes("stack"), bytes("b"))));
    // the head element is still there for a plain pop
    assert_eq!(engine.lpop(b"stack").unwrap(), Some(bytes("a")));
}

#[test]
fn immediate_scan_is_left_to_right() {
    let engine = engine();
    engine.rpush(b"beta", &[bytes("b")]).unwrap();
    engine.rpush(b"alpha", &[bytes("a")]).unwrap();
    // scan order follows the argument order, not key order
    assert_eq!(
        engine.blpop(0, &[b"beta", b"alpha"]).unwrap(),
        Some((bytes("beta"), bytes("b")))
    );
}
