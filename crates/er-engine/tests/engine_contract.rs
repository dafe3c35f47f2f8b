//! Whole-engine behavior: the observable command contracts, driven through
//! the public handle with a pinned clock and seed.

use std::sync::Arc;

use er_engine::{Aggregate, Engine, ManualClock, ScoreBound, StoreError, TtlValue};

fn engine() -> (Engine, Arc<ManualClock>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let clock = Arc::new(ManualClock::new(1_000));
    let engine = Engine::with_clock_and_seed(clock.clone(), 42);
    (engine, clock)
}

fn bytes(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}

#[test]
fn expired_keys_read_as_absent_in_every_store() {
    let (engine, clock) = engine();
    engine.set(bytes("s"), bytes("v"));
    engine.rpush(b"l", &[bytes("x")]).unwrap();
    engine.hset(b"h", bytes("f"), bytes("v")).unwrap();
    engine.sadd(b"e", &[bytes("m")]).unwrap();
    engine.zadd(b"z", &[(1.0, bytes("m"))]).unwrap();
    for key in [b"s".as_slice(), b"l", b"h", b"e", b"z"] {
        assert!(engine.expire(key, 5));
    }

    clock.advance_secs(6);

    assert_eq!(engine.get(b"s").unwrap(), None);
    assert_eq!(engine.llen(b"l").unwrap(), 0);
    assert_eq!(engine.lrange(b"l", 0, -1).unwrap(), Vec::<Vec<u8>>::new());
    assert_eq!(engine.hgetall(b"h").unwrap(), Vec::new());
    assert_eq!(engine.smembers(b"e").unwrap(), Vec::<Vec<u8>>::new());
    assert_eq!(engine.zcard(b"z").unwrap(), 0);
    for key in [b"s".as_slice(), b"l", b"h", b"e", b"z"] {
        assert!(!engine.exists(key));
        assert_eq!(engine.key_type(key), "none");
        assert_eq!(engine.ttl(key), TtlValue::KeyMissing);
    }
    assert_eq!(engine.dbsize(), 0);
    // repeated reads stay absent
    assert_eq!(engine.get(b"s").unwrap(), None);
}

#[test]
fn rename_moves_value_and_ttl_and_flips_exists() {
    let (engine, clock) = engine();
    engine.set(bytes("a"), bytes("payload"));
    assert!(engine.expire(b"a", 30));

    engine.rename(b"a", b"b").unwrap();
    assert!(!engine.exists(b"a"));
    assert!(engine.exists(b"b"));
    assert_eq!(engine.get(b"b").unwrap(), Some(bytes("payload")));
    assert_eq!(engine.ttl(b"b"), TtlValue::Remaining(30));

    clock.advance_secs(31);
    assert!(!engine.exists(b"b"));
}

#[test]
fn renamenx_respects_a_live_target() {
    let (engine, clock) = engine();
    engine.set(bytes("a"), bytes("1"));
    engine.set(bytes("b"), bytes("2"));
    assert!(!engine.renamenx(b"a", b"b").unwrap());
    assert!(engine.expire(b"b", 1));
    clock.advance_secs(2);
    assert!(engine.renamenx(b"a", b"b").unwrap());
    assert_eq!(engine.get(b"b").unwrap(), Some(bytes("1")));
    assert_eq!(engine.rename(b"b", b"b"), Err(StoreError::SameKey));
}

#[test]
fn zrange_is_ascending_and_zrevrange_is_its_mirror() {
    let (engine, _) = engine();
    engine
        .zadd(
            b"z",
            &[(3.0, bytes("c")), (1.0, bytes("a")), (2.0, bytes("b")), (1.0, bytes("aa"))],
        )
        .unwrap();
    let forward = engine.zrange(b"z", 0, -1).unwrap();
    assert_eq!(forward, vec![bytes("a"), bytes("aa"), bytes("b"), bytes("c")]);
    let mut mirrored = engine.zrevrange(b"z", 0, -1).unwrap();
    mirrored.reverse();
    assert_eq!(mirrored, forward);
}

#[test]
fn zunionstore_defaults_to_sum_over_present_sources() {
    let (engine, _) = engine();
    engine
        .zadd(b"A", &[(1.0, bytes("only_a")), (2.0, bytes("both"))])
        .unwrap();
    engine
        .zadd(b"B", &[(10.0, bytes("both")), (5.0, bytes("only_b"))])
        .unwrap();
    let count = engine
        .zunionstore(b"dest", &[b"A", b"B"], None, Aggregate::default())
        .unwrap();
    assert_eq!(count, 3);
    assert_eq!(engine.zscore(b"dest", b"only_a").unwrap(), Some(1.0));
    assert_eq!(engine.zscore(b"dest", b"only_b").unwrap(), Some(5.0));
    assert_eq!(engine.zscore(b"dest", b"both").unwrap(), Some(12.0));
}

#[test]
fn append_round_trips_concatenation() {
    let (engine, _) = engine();
    engine.append(b"k", b"X-part").unwrap();
    engine.append(b"k", b"Y-part").unwrap();
    assert_eq!(engine.get(b"k").unwrap(), Some(bytes("X-partY-part")));
}

#[test]
fn lpush_prepends() {
    let (engine, _) = engine();
    engine.lpush(b"K", &[bytes("b")]).unwrap();
    engine.lpush(b"K", &[bytes("a")]).unwrap();
    assert_eq!(engine.lrange(b"K", 0, -1).unwrap(), vec![bytes("a"), bytes("b")]);
}

#[test]
fn zcount_with_inclusive_bounds() {
    let (engine, _) = engine();
    engine.zadd(b"K", &[(1.0, bytes("v"))]).unwrap();
    engine.zadd(b"K", &[(2.0, bytes("r"))]).unwrap();
    assert_eq!(
        engine
            .zcount(b"K", ScoreBound::Inclusive(0.0), ScoreBound::Inclusive(1.0))
            .unwrap(),
        1
    );
}

#[test]
fn zcount_bounds_parse_like_the_command_surface() {
    let (engine, _) = engine();
    engine
        .zadd(b"z", &[(1.0, bytes("a")), (2.0, bytes("b")), (3.0, bytes("c"))])
        .unwrap();
    let count = engine
        .zcount(
            b"z",
            "(1".parse::<ScoreBound>().unwrap(),
            "+inf".parse::<ScoreBound>().unwrap(),
        )
        .unwrap();
    assert_eq!(count, 2);
}

#[test]
fn setbit_survives_until_expiry() {
    let (engine, clock) = engine();
    assert!(!engine.setbit(b"K", 8, true).unwrap());
    assert!(engine.getbit(b"K", 8).unwrap());
    assert!(engine.expire(b"K", 1));
    clock.advance_secs(2);
    assert!(!engine.getbit(b"K", 8).unwrap());
}

#[test]
fn getset_discards_a_preexisting_ttl() {
    let (engine, clock) = engine();
    engine.set(bytes("k"), bytes("v1"));
    assert!(engine.expire(b"k", 5));
    assert_eq!(engine.getset(bytes("k"), bytes("v2")).unwrap(), Some(bytes("v1")));
    clock.advance_secs(60);
    assert_eq!(engine.get(b"k").unwrap(), Some(bytes("v2")));
}

#[test]
fn msetnx_is_all_or_nothing() {
    let (engine, _) = engine();
    engine.set(bytes("taken"), bytes("x"));
    assert!(!engine.msetnx(&[(bytes("fresh"), bytes("1")), (bytes("taken"), bytes("2"))]));
    assert!(!engine.exists(b"fresh"));
    assert_eq!(engine.get(b"taken").unwrap(), Some(bytes("x")));
    assert!(engine.msetnx(&[(bytes("fresh"), bytes("1"))]));
    assert_eq!(engine.get(b"fresh").unwrap(), Some(bytes("1")));
}

#[test]
fn sunionstore_replaces_a_differently_typed_destination() {
    let (engine, clock) = engine();
    engine.sadd(b"a", &[bytes("1"), bytes("2")]).unwrap();
    engine.set(bytes("dest"), bytes("old"));
    assert!(engine.expire(b"dest", 60));
    assert_eq!(engine.sunionstore(b"dest", &[b"a"]).unwrap(), 2);
    assert_eq!(engine.key_type(b"dest"), "set");
    assert_eq!(engine.ttl(b"dest"), TtlValue::NoExpiry);
    clock.advance_secs(120);
    assert_eq!(engine.smembers(b"dest").unwrap(), vec![bytes("1"), bytes("2")]);
}

#[test]
fn keys_dbsize_and_sort_work_through_the_handle() {
    let (engine, _) = engine();
    engine.set(bytes("user:1"), bytes("a"));
    engine.set(bytes("user:2"), bytes("b"));
    engine.rpush(b"numbers", &[bytes("10"), bytes("2")]).unwrap();
    assert_eq!(engine.keys(b"user:*"), vec![bytes("user:1"), bytes("user:2")]);
    assert_eq!(engine.dbsize(), 3);
    assert_eq!(engine.sort(b"numbers").unwrap(), vec![bytes("2"), bytes("10")]);
    assert_eq!(engine.sort(b"user:1"), Err(StoreError::SortNotSupported));
    engine.flush_all();
    assert_eq!(engine.dbsize(), 0);
}

#[test]
fn zrangebyscore_limit_through_the_handle() {
    let (engine, _) = engine();
    engine
        .zadd(
            b"z",
            &[(1.0, bytes("a")), (2.0, bytes("b")), (3.0, bytes("c")), (4.0, bytes("d"))],
        )
        .unwrap();
    let all = ScoreBound::Inclusive(f64::NEG_INFINITY);
    let top = ScoreBound::Inclusive(f64::INFINITY);
    assert_eq!(
        engine.zrangebyscore(b"z", all, top, Some((1, 2))).unwrap(),
        vec![bytes("b"), bytes("c")]
    );
    assert_eq!(
        engine.zrangebyscore(b"z", all, top, Some((2, -1))).unwrap(),
        vec![bytes("c"), bytes("d")]
    );
    assert_eq!(
        engine.zrangebyscore(b"z", all, top, Some((9, -1))).unwrap(),
        Vec::<Vec<u8>>::new()
    );
    assert_eq!(
        engine
            .zrevrangebyscore_withscores(b"z", all, top, Some((0, 2)))
            .unwrap(),
        vec![(bytes("d"), 4.0), (bytes("c"), 3.0)]
    );
}

#[test]
fn type_conflicts_are_local_errors() {
    let (engine, _) = engine();
    engine.set(bytes("s"), bytes("v"));
    assert_eq!(engine.lpush(b"s", &[bytes("x")]), Err(StoreError::WrongType));
    assert_eq!(engine.hget(b"s", b"f"), Err(StoreError::WrongType));
    assert_eq!(engine.sadd(b"s", &[bytes("m")]), Err(StoreError::WrongType));
    assert_eq!(engine.zcard(b"s"), Err(StoreError::WrongType));
    // the failed commands corrupted nothing
    assert_eq!(engine.get(b"s").unwrap(), Some(bytes("v")));
}

#[test]
fn incr_parses_the_full_buffer() {
    let (engine, _) = engine();
    assert_eq!(engine.incr(b"n").unwrap(), 1);
    assert_eq!(engine.incrby(b"n", 41).unwrap(), 42);
    assert_eq!(engine.decr(b"n").unwrap(), 41);
    assert_eq!(engine.decrby(b"n", 40).unwrap(), 1);
    engine.set(bytes("bad"), bytes("12abc"));
    assert_eq!(engine.incr(b"bad"), Err(StoreError::ValueNotInteger));
}

#[test]
fn hincrby_missing_field_counts_from_zero() {
    let (engine, _) = engine();
    engine.hset(b"h", bytes("name"), bytes("x")).unwrap();
    assert_eq!(engine.hincrby(b"h", b"hits", 3).unwrap(), 3);
    assert_eq!(engine.hincrby(b"h", b"hits", 4).unwrap(), 7);
    assert_eq!(
        engine.hincrby(b"h", b"name", 1),
        Err(StoreError::ValueNotInteger)
    );
}

#[test]
fn zinterstore_with_weights_through_the_handle() {
    let (engine, _) = engine();
    engine.zadd(b"a", &[(1.0, bytes("m")), (9.0, bytes("a_only"))]).unwrap();
    engine.zadd(b"b", &[(2.0, bytes("m"))]).unwrap();
    let count = engine
        .zinterstore(b"dest", &[b"a", b"b"], Some(&[10.0, 1.0]), Aggregate::Sum)
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(engine.zscore(b"dest", b"m").unwrap(), Some(12.0));
    assert_eq!(
        engine.zinterstore(b"dest", &[b"a", b"b"], Some(&[1.0]), Aggregate::Sum),
        Err(StoreError::WeightCountMismatch)
    );
}
