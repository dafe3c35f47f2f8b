#![forbid(unsafe_code)]

//! The shared engine handle.
//!
//! [`Engine`] is what test code holds: a cloneable handle over one keyspace.
//! Every command takes the single state lock, reads the injected clock once,
//! and delegates to [`er_store::Store`], so each logical command is observed
//! atomically by every other thread. The blocking list pops (`blpop`/`brpop`)
//! are implemented here with per-key FIFO ticket queues over a condvar;
//! everything else is synchronous delegation.
//!
//! There is no port, socket or process behind this type. "Starting" the
//! engine is constructing it; "stopping" it is dropping the last handle.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use er_store::Store;
pub use er_store::{Aggregate, ScoreBound, StoreError, TtlValue, ValueType};

// ── Injected clock ───────────────────────────────────────────────────

/// Time source for TTL decisions. Injected so expiry is deterministic under
/// test.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall-clock milliseconds since the Unix epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn set_ms(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, secs: u64) {
        self.advance_ms(secs.saturating_mul(1000));
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

// ── Engine ───────────────────────────────────────────────────────────

struct EngineState {
    store: Store,
    rng: StdRng,
    /// Per-key FIFO queues of blocked-pop tickets. A waiter may claim from a
    /// key only while its ticket is at the front of that key's queue.
    waiters: HashMap<Vec<u8>, VecDeque<u64>>,
    next_ticket: u64,
}

struct Shared {
    state: Mutex<EngineState>,
    list_ready: Condvar,
    clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Wall clock, entropy-seeded randomness.
    #[must_use]
    pub fn new() -> Self {
        Self::build(Arc::new(SystemClock), StdRng::from_entropy())
    }

    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::build(clock, StdRng::from_entropy())
    }

    /// Pin both time and randomness, for fully reproducible runs.
    #[must_use]
    pub fn with_clock_and_seed(clock: Arc<dyn Clock>, seed: u64) -> Self {
        Self::build(clock, StdRng::seed_from_u64(seed))
    }

    fn build(clock: Arc<dyn Clock>, rng: StdRng) -> Self {
        debug!("engine created");
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(EngineState {
                    store: Store::new(),
                    rng,
                    waiters: HashMap::new(),
                    next_ticket: 0,
                }),
                list_ready: Condvar::new(),
                clock,
            }),
        }
    }

    /// Run one command against the store under the state lock, with the
    /// clock sampled once.
    fn with_store<R>(&self, op: impl FnOnce(&mut Store, u64) -> R) -> R {
        let now_ms = self.shared.clock.now_ms();
        let mut state = self.shared.state.lock();
        op(&mut state.store, now_ms)
    }

    /// A list gained elements: wake every blocked pop so the front ticket of
    /// each affected key can claim.
    fn signal_list_ready(&self) {
        self.shared.list_ready.notify_all();
    }

    // ── String commands ──────────────────────────────────────────────

    pub fn set(&self, key: Vec<u8>, value: Vec<u8>) {
        self.with_store(|store, now| store.set(key, value, None, now));
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_store(|store, now| store.get(key, now))
    }

    pub fn getset(&self, key: Vec<u8>, value: Vec<u8>) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_store(|store, now| store.getset(key, value, now))
    }

    pub fn getdel(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_store(|store, now| store.getdel(key, now))
    }

    pub fn setnx(&self, key: Vec<u8>, value: Vec<u8>) -> bool {
        self.with_store(|store, now| store.setnx(key, value, now))
    }

    pub fn setex(&self, key: Vec<u8>, seconds: i64, value: Vec<u8>) -> Result<(), StoreError> {
        self.with_store(|store, now| store.setex(key, seconds, value, now))
    }

    pub fn mset(&self, pairs: &[(Vec<u8>, Vec<u8>)]) {
        self.with_store(|store, now| store.mset(pairs, now));
    }

    pub fn msetnx(&self, pairs: &[(Vec<u8>, Vec<u8>)]) -> bool {
        self.with_store(|store, now| store.msetnx(pairs, now))
    }

    pub fn mget(&self, keys: &[&[u8]]) -> Vec<Option<Vec<u8>>> {
        self.with_store(|store, now| store.mget(keys, now))
    }

    pub fn strlen(&self, key: &[u8]) -> Result<usize, StoreError> {
        self.with_store(|store, now| store.strlen(key, now))
    }

    pub fn append(&self, key: &[u8], value: &[u8]) -> Result<usize, StoreError> {
        self.with_store(|store, now| store.append(key, value, now))
    }

    pub fn incr(&self, key: &[u8]) -> Result<i64, StoreError> {
        self.incrby(key, 1)
    }

    pub fn decr(&self, key: &[u8]) -> Result<i64, StoreError> {
        self.incrby(key, -1)
    }

    pub fn incrby(&self, key: &[u8], delta: i64) -> Result<i64, StoreError> {
        self.with_store(|store, now| store.incrby(key, delta, now))
    }

    pub fn decrby(&self, key: &[u8], delta: i64) -> Result<i64, StoreError> {
        let delta = delta.checked_neg().ok_or(StoreError::IntegerOverflow)?;
        self.incrby(key, delta)
    }

    pub fn incrbyfloat(&self, key: &[u8], delta: f64) -> Result<f64, StoreError> {
        self.with_store(|store, now| store.incrbyfloat(key, delta, now))
    }

    pub fn getrange(&self, key: &[u8], start: i64, end: i64) -> Result<Vec<u8>, StoreError> {
        self.with_store(|store, now| store.getrange(key, start, end, now))
    }

    pub fn setrange(&self, key: &[u8], offset: usize, value: &[u8]) -> Result<usize, StoreError> {
        self.with_store(|store, now| store.setrange(key, offset, value, now))
    }

    pub fn setbit(&self, key: &[u8], offset: usize, value: bool) -> Result<bool, StoreError> {
        self.with_store(|store, now| store.setbit(key, offset, value, now))
    }

    pub fn getbit(&self, key: &[u8], offset: usize) -> Result<bool, StoreError> {
        self.with_store(|store, now| store.getbit(key, offset, now))
    }

    pub fn bitcount(
        &self,
        key: &[u8],
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<usize, StoreError> {
        self.with_store(|store, now| store.bitcount(key, start, end, now))
    }

    // ── Keyspace commands ────────────────────────────────────────────

    pub fn exists(&self, key: &[u8]) -> bool {
        self.with_store(|store, now| store.exists(key, now))
    }

    pub fn del(&self, keys: &[Vec<u8>]) -> u64 {
        self.with_store(|store, now| store.del(keys, now))
    }

    /// `string|list|hash|set|zset`, or `none` for absent/expired keys.
    pub fn key_type(&self, key: &[u8]) -> &'static str {
        self.with_store(|store, now| store.key_type(key, now))
            .unwrap_or("none")
    }

    pub fn value_type(&self, key: &[u8]) -> Option<ValueType> {
        self.with_store(|store, now| store.value_type(key, now))
    }

    pub fn keys(&self, pattern: &[u8]) -> Vec<Vec<u8>> {
        self.with_store(|store, now| store.keys_matching(pattern, now))
    }

    pub fn rename(&self, key: &[u8], newkey: &[u8]) -> Result<(), StoreError> {
        let result = self.with_store(|store, now| store.rename(key, newkey, now));
        if result.is_ok() {
            // the target may have become a non-empty list
            self.signal_list_ready();
        }
        result
    }

    pub fn renamenx(&self, key: &[u8], newkey: &[u8]) -> Result<bool, StoreError> {
        let result = self.with_store(|store, now| store.renamenx(key, newkey, now));
        if matches!(result, Ok(true)) {
            self.signal_list_ready();
        }
        result
    }

    /// `true` when a TTL was installed, `false` for an absent/expired key.
    pub fn expire(&self, key: &[u8], seconds: i64) -> bool {
        let granted = self.with_store(|store, now| store.expire_seconds(key, seconds, now));
        if granted {
            debug!(key = %String::from_utf8_lossy(key), seconds, "expire set");
        }
        granted
    }

    pub fn expire_at(&self, key: &[u8], at_ms: u64) -> bool {
        self.with_store(|store, now| store.expire_at_ms(key, at_ms, now))
    }

    pub fn ttl(&self, key: &[u8]) -> TtlValue {
        self.with_store(|store, now| store.ttl(key, now))
    }

    pub fn persist(&self, key: &[u8]) -> bool {
        self.with_store(|store, now| store.persist(key, now))
    }

    pub fn dbsize(&self) -> usize {
        self.with_store(|store, now| store.dbsize(now))
    }

    pub fn flush_db(&self) {
        debug!("flushing keyspace");
        self.with_store(|store, _| store.flushdb());
    }

    /// Single keyspace, so flushing "all" and flushing "the db" coincide.
    pub fn flush_all(&self) {
        self.flush_db();
    }

    pub fn sort(&self, key: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        self.with_store(|store, now| store.sort_values(key, now))
    }

    // ── Hash commands ────────────────────────────────────────────────

    pub fn hset(&self, key: &[u8], field: Vec<u8>, value: Vec<u8>) -> Result<bool, StoreError> {
        self.with_store(|store, now| store.hset(key, field, value, now))
    }

    pub fn hsetnx(&self, key: &[u8], field: Vec<u8>, value: Vec<u8>) -> Result<bool, StoreError> {
        self.with_store(|store, now| store.hsetnx(key, field, value, now))
    }

    pub fn hget(&self, key: &[u8], field: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_store(|store, now| store.hget(key, field, now))
    }

    pub fn hdel(&self, key: &[u8], fields: &[&[u8]]) -> Result<u64, StoreError> {
        self.with_store(|store, now| store.hdel(key, fields, now))
    }

    pub fn hexists(&self, key: &[u8], field: &[u8]) -> Result<bool, StoreError> {
        self.with_store(|store, now| store.hexists(key, field, now))
    }

    #[allow(clippy::type_complexity)]
    pub fn hgetall(&self, key: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.with_store(|store, now| store.hgetall(key, now))
    }

    pub fn hkeys(&self, key: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        self.with_store(|store, now| store.hkeys(key, now))
    }

    pub fn hvals(&self, key: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        self.with_store(|store, now| store.hvals(key, now))
    }

    pub fn hlen(&self, key: &[u8]) -> Result<usize, StoreError> {
        self.with_store(|store, now| store.hlen(key, now))
    }

    pub fn hmset(&self, key: &[u8], pairs: &[(Vec<u8>, Vec<u8>)]) -> Result<(), StoreError> {
        self.with_store(|store, now| store.hmset(key, pairs, now))
    }

    pub fn hmget(&self, key: &[u8], fields: &[&[u8]]) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
        self.with_store(|store, now| store.hmget(key, fields, now))
    }

    pub fn hincrby(&self, key: &[u8], field: &[u8], delta: i64) -> Result<i64, StoreError> {
        self.with_store(|store, now| store.hincrby(key, field, delta, now))
    }

    pub fn hincrbyfloat(&self, key: &[u8], field: &[u8], delta: f64) -> Result<f64, StoreError> {
        self.with_store(|store, now| store.hincrbyfloat(key, field, delta, now))
    }

    pub fn hstrlen(&self, key: &[u8], field: &[u8]) -> Result<usize, StoreError> {
        self.with_store(|store, now| store.hstrlen(key, field, now))
    }

    // ── List commands ────────────────────────────────────────────────

    pub fn lpush(&self, key: &[u8], values: &[Vec<u8>]) -> Result<usize, StoreError> {
        let result = self.with_store(|store, now| store.lpush(key, values, now));
        if matches!(result, Ok(n) if n > 0) {
            self.signal_list_ready();
        }
        result
    }

    pub fn rpush(&self, key: &[u8], values: &[Vec<u8>]) -> Result<usize, StoreError> {
        let result = self.with_store(|store, now| store.rpush(key, values, now));
        if matches!(result, Ok(n) if n > 0) {
            self.signal_list_ready();
        }
        result
    }

    pub fn lpushx(&self, key: &[u8], values: &[Vec<u8>]) -> Result<usize, StoreError> {
        let result = self.with_store(|store, now| store.lpushx(key, values, now));
        if matches!(result, Ok(n) if n > 0) {
            self.signal_list_ready();
        }
        result
    }

    pub fn rpushx(&self, key: &[u8], values: &[Vec<u8>]) -> Result<usize, StoreError> {
        let result = self.with_store(|store, now| store.rpushx(key, values, now));
        if matches!(result, Ok(n) if n > 0) {
            self.signal_list_ready();
        }
        result
    }

    pub fn lpop(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_store(|store, now| store.lpop(key, now))
    }

    pub fn rpop(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_store(|store, now| store.rpop(key, now))
    }

    pub fn llen(&self, key: &[u8]) -> Result<usize, StoreError> {
        self.with_store(|store, now| store.llen(key, now))
    }

    pub fn lrange(&self, key: &[u8], start: i64, stop: i64) -> Result<Vec<Vec<u8>>, StoreError> {
        self.with_store(|store, now| store.lrange(key, start, stop, now))
    }

    pub fn lindex(&self, key: &[u8], index: i64) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_store(|store, now| store.lindex(key, index, now))
    }

    pub fn lset(&self, key: &[u8], index: i64, value: Vec<u8>) -> Result<(), StoreError> {
        self.with_store(|store, now| store.lset(key, index, value, now))
    }

    pub fn linsert_before(
        &self,
        key: &[u8],
        pivot: &[u8],
        value: Vec<u8>,
    ) -> Result<i64, StoreError> {
        let result = self.with_store(|store, now| store.linsert_before(key, pivot, value, now));
        if matches!(result, Ok(n) if n > 0) {
            self.signal_list_ready();
        }
        result
    }

    pub fn linsert_after(
        &self,
        key: &[u8],
        pivot: &[u8],
        value: Vec<u8>,
    ) -> Result<i64, StoreError> {
        let result = self.with_store(|store, now| store.linsert_after(key, pivot, value, now));
        if matches!(result, Ok(n) if n > 0) {
            self.signal_list_ready();
        }
        result
    }

    pub fn lrem(&self, key: &[u8], count: i64, value: &[u8]) -> Result<u64, StoreError> {
        self.with_store(|store, now| store.lrem(key, count, value, now))
    }

    pub fn ltrim(&self, key: &[u8], start: i64, stop: i64) -> Result<(), StoreError> {
        self.with_store(|store, now| store.ltrim(key, start, stop, now))
    }

    pub fn lpos(&self, key: &[u8], element: &[u8]) -> Result<Option<usize>, StoreError> {
        self.with_store(|store, now| store.lpos(key, element, now))
    }

    pub fn rpoplpush(
        &self,
        source: &[u8],
        destination: &[u8],
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let result = self.with_store(|store, now| store.rpoplpush(source, destination, now));
        if matches!(result, Ok(Some(_))) {
            self.signal_list_ready();
        }
        result
    }

    // ── Blocking list commands ───────────────────────────────────────

    /// Pop from the head of the first non-empty watched key, blocking until
    /// a push arrives or the timeout elapses. `timeout_secs == 0` waits
    /// indefinitely; a timeout is the normal `None` outcome, not an error.
    #[allow(clippy::type_complexity)]
    pub fn blpop(
        &self,
        timeout_secs: u64,
        keys: &[&[u8]],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.bpop(true, timeout_secs, keys)
    }

    /// Tail-end counterpart of [`Engine::blpop`].
    #[allow(clippy::type_complexity)]
    pub fn brpop(
        &self,
        timeout_secs: u64,
        keys: &[&[u8]],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.bpop(false, timeout_secs, keys)
    }

    #[allow(clippy::type_complexity)]
    fn bpop(
        &self,
        from_front: bool,
        timeout_secs: u64,
        keys: &[&[u8]],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
        let deadline =
            (timeout_secs > 0).then(|| Instant::now() + Duration::from_secs(timeout_secs));
        let mut state = self.shared.state.lock();

        // Serve immediately where possible. A key with queued waiters is
        // spoken for: its elements belong to the front ticket, not to us.
        for key in keys {
            let contested = state.waiters.get(*key).is_some_and(|q| !q.is_empty());
            if contested {
                continue;
            }
            let now_ms = self.shared.clock.now_ms();
            if let Some(val) = pop_end(&mut state.store, key, from_front, now_ms)? {
                return Ok(Some((key.to_vec(), val)));
            }
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        for key in keys {
            state.waiters.entry(key.to_vec()).or_default().push_back(ticket);
        }
        debug!(ticket, watched = keys.len(), "blocking pop waiting");

        let outcome = loop {
            let timed_out = match deadline {
                Some(deadline) => {
                    Instant::now() >= deadline
                        || self
                            .shared
                            .list_ready
                            .wait_until(&mut state, deadline)
                            .timed_out()
                }
                None => {
                    self.shared.list_ready.wait(&mut state);
                    false
                }
            };
            match self.try_claim(&mut state, ticket, from_front, keys) {
                Ok(Some(hit)) => break Ok(Some(hit)),
                Ok(None) if timed_out => break Ok(None),
                Ok(None) => {}
                Err(err) => break Err(err),
            }
        };

        deregister(&mut state, ticket, keys);
        drop(state);
        // Whoever was queued behind this ticket may be eligible now.
        self.signal_list_ready();
        match &outcome {
            Ok(Some((key, _))) => {
                debug!(ticket, key = %String::from_utf8_lossy(key), "blocking pop satisfied");
            }
            Ok(None) => debug!(ticket, "blocking pop timed out"),
            Err(_) => {}
        }
        outcome
    }

    /// Claim an element for `ticket`: left-to-right over the watched keys,
    /// taking only from keys where the ticket is first in line. Claims run
    /// under the state lock, which is what makes delivery exactly-once.
    fn try_claim(
        &self,
        state: &mut EngineState,
        ticket: u64,
        from_front: bool,
        keys: &[&[u8]],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
        let now_ms = self.shared.clock.now_ms();
        for key in keys {
            let first_in_line =
                state.waiters.get(*key).and_then(VecDeque::front) == Some(&ticket);
            if !first_in_line {
                continue;
            }
            if let Some(val) = pop_end(&mut state.store, key, from_front, now_ms)? {
                return Ok(Some((key.to_vec(), val)));
            }
        }
        Ok(None)
    }

    // ── Set commands ─────────────────────────────────────────────────

    pub fn sadd(&self, key: &[u8], members: &[Vec<u8>]) -> Result<u64, StoreError> {
        self.with_store(|store, now| store.sadd(key, members, now))
    }

    pub fn srem(&self, key: &[u8], members: &[&[u8]]) -> Result<u64, StoreError> {
        self.with_store(|store, now| store.srem(key, members, now))
    }

    pub fn smembers(&self, key: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        self.with_store(|store, now| store.smembers(key, now))
    }

    pub fn scard(&self, key: &[u8]) -> Result<usize, StoreError> {
        self.with_store(|store, now| store.scard(key, now))
    }

    pub fn sismember(&self, key: &[u8], member: &[u8]) -> Result<bool, StoreError> {
        self.with_store(|store, now| store.sismember(key, member, now))
    }

    /// Remove and return one member, chosen by the engine's injected RNG.
    pub fn spop(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let now_ms = self.shared.clock.now_ms();
        let mut state = self.shared.state.lock();
        let card = state.store.scard(key, now_ms)?;
        if card == 0 {
            return Ok(None);
        }
        let nth = state.rng.gen_range(0..card);
        state.store.spop_nth(key, nth, now_ms)
    }

    /// Peek at one member without removing it, chosen by the injected RNG.
    pub fn srandmember(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let now_ms = self.shared.clock.now_ms();
        let mut state = self.shared.state.lock();
        let card = state.store.scard(key, now_ms)?;
        if card == 0 {
            return Ok(None);
        }
        let nth = state.rng.gen_range(0..card);
        state.store.srandmember_nth(key, nth, now_ms)
    }

    pub fn smove(
        &self,
        source: &[u8],
        destination: &[u8],
        member: &[u8],
    ) -> Result<bool, StoreError> {
        self.with_store(|store, now| store.smove(source, destination, member, now))
    }

    pub fn sdiff(&self, keys: &[&[u8]]) -> Result<Vec<Vec<u8>>, StoreError> {
        self.with_store(|store, now| store.sdiff(keys, now))
    }

    pub fn sinter(&self, keys: &[&[u8]]) -> Result<Vec<Vec<u8>>, StoreError> {
        self.with_store(|store, now| store.sinter(keys, now))
    }

    pub fn sunion(&self, keys: &[&[u8]]) -> Result<Vec<Vec<u8>>, StoreError> {
        self.with_store(|store, now| store.sunion(keys, now))
    }

    pub fn sdiffstore(&self, destination: &[u8], keys: &[&[u8]]) -> Result<usize, StoreError> {
        self.with_store(|store, now| store.sdiffstore(destination, keys, now))
    }

    pub fn sinterstore(&self, destination: &[u8], keys: &[&[u8]]) -> Result<usize, StoreError> {
        self.with_store(|store, now| store.sinterstore(destination, keys, now))
    }

    pub fn sunionstore(&self, destination: &[u8], keys: &[&[u8]]) -> Result<usize, StoreError> {
        self.with_store(|store, now| store.sunionstore(destination, keys, now))
    }

    // ── Sorted set commands ──────────────────────────────────────────

    pub fn zadd(&self, key: &[u8], members: &[(f64, Vec<u8>)]) -> Result<usize, StoreError> {
        self.with_store(|store, now| store.zadd(key, members, now))
    }

    pub fn zincrby(&self, key: &[u8], member: Vec<u8>, delta: f64) -> Result<f64, StoreError> {
        self.with_store(|store, now| store.zincrby(key, member, delta, now))
    }

    pub fn zscore(&self, key: &[u8], member: &[u8]) -> Result<Option<f64>, StoreError> {
        self.with_store(|store, now| store.zscore(key, member, now))
    }

    pub fn zrank(&self, key: &[u8], member: &[u8]) -> Result<Option<usize>, StoreError> {
        self.with_store(|store, now| store.zrank(key, member, now))
    }

    pub fn zrevrank(&self, key: &[u8], member: &[u8]) -> Result<Option<usize>, StoreError> {
        self.with_store(|store, now| store.zrevrank(key, member, now))
    }

    pub fn zrem(&self, key: &[u8], members: &[&[u8]]) -> Result<u64, StoreError> {
        self.with_store(|store, now| store.zrem(key, members, now))
    }

    pub fn zcard(&self, key: &[u8]) -> Result<usize, StoreError> {
        self.with_store(|store, now| store.zcard(key, now))
    }

    pub fn zcount(
        &self,
        key: &[u8],
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<usize, StoreError> {
        self.with_store(|store, now| store.zcount(key, min, max, now))
    }

    pub fn zrange(&self, key: &[u8], start: i64, stop: i64) -> Result<Vec<Vec<u8>>, StoreError> {
        self.with_store(|store, now| store.zrange(key, start, stop, now))
    }

    pub fn zrevrange(
        &self,
        key: &[u8],
        start: i64,
        stop: i64,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        self.with_store(|store, now| store.zrevrange(key, start, stop, now))
    }

    #[allow(clippy::type_complexity)]
    pub fn zrange_withscores(
        &self,
        key: &[u8],
        start: i64,
        stop: i64,
    ) -> Result<Vec<(Vec<u8>, f64)>, StoreError> {
        self.with_store(|store, now| store.zrange_withscores(key, start, stop, now))
    }

    #[allow(clippy::type_complexity)]
    pub fn zrevrange_withscores(
        &self,
        key: &[u8],
        start: i64,
        stop: i64,
    ) -> Result<Vec<(Vec<u8>, f64)>, StoreError> {
        self.with_store(|store, now| store.zrevrange_withscores(key, start, stop, now))
    }

    /// `limit` is `(offset, count)`: a negative count means "through the
    /// end", an offset at or past the result size yields nothing.
    pub fn zrangebyscore(
        &self,
        key: &[u8],
        min: ScoreBound,
        max: ScoreBound,
        limit: Option<(i64, i64)>,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let pairs = self.with_store(|store, now| store.zrangebyscore_withscores(key, min, max, now))?;
        Ok(apply_limit(pairs, limit).into_iter().map(|(m, _)| m).collect())
    }

    pub fn zrevrangebyscore(
        &self,
        key: &[u8],
        min: ScoreBound,
        max: ScoreBound,
        limit: Option<(i64, i64)>,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let pairs =
            self.with_store(|store, now| store.zrevrangebyscore_withscores(key, min, max, now))?;
        Ok(apply_limit(pairs, limit).into_iter().map(|(m, _)| m).collect())
    }

    #[allow(clippy::type_complexity)]
    pub fn zrangebyscore_withscores(
        &self,
        key: &[u8],
        min: ScoreBound,
        max: ScoreBound,
        limit: Option<(i64, i64)>,
    ) -> Result<Vec<(Vec<u8>, f64)>, StoreError> {
        let pairs = self.with_store(|store, now| store.zrangebyscore_withscores(key, min, max, now))?;
        Ok(apply_limit(pairs, limit))
    }

    #[allow(clippy::type_complexity)]
    pub fn zrevrangebyscore_withscores(
        &self,
        key: &[u8],
        min: ScoreBound,
        max: ScoreBound,
        limit: Option<(i64, i64)>,
    ) -> Result<Vec<(Vec<u8>, f64)>, StoreError> {
        let pairs =
            self.with_store(|store, now| store.zrevrangebyscore_withscores(key, min, max, now))?;
        Ok(apply_limit(pairs, limit))
    }

    pub fn zremrangebyrank(&self, key: &[u8], start: i64, stop: i64) -> Result<u64, StoreError> {
        self.with_store(|store, now| store.zremrangebyrank(key, start, stop, now))
    }

    pub fn zremrangebyscore(
        &self,
        key: &[u8],
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<u64, StoreError> {
        self.with_store(|store, now| store.zremrangebyscore(key, min, max, now))
    }

    #[allow(clippy::type_complexity)]
    pub fn zpopmin(&self, key: &[u8]) -> Result<Option<(Vec<u8>, f64)>, StoreError> {
        self.with_store(|store, now| store.zpopmin(key, now))
    }

    #[allow(clippy::type_complexity)]
    pub fn zpopmax(&self, key: &[u8]) -> Result<Option<(Vec<u8>, f64)>, StoreError> {
        self.with_store(|store, now| store.zpopmax(key, now))
    }

    pub fn zunionstore(
        &self,
        destination: &[u8],
        keys: &[&[u8]],
        weights: Option<&[f64]>,
        aggregate: Aggregate,
    ) -> Result<usize, StoreError> {
        self.with_store(|store, now| store.zunionstore(destination, keys, weights, aggregate, now))
    }

    pub fn zinterstore(
        &self,
        destination: &[u8],
        keys: &[&[u8]],
        weights: Option<&[f64]>,
        aggregate: Aggregate,
    ) -> Result<usize, StoreError> {
        self.with_store(|store, now| store.zinterstore(destination, keys, weights, aggregate, now))
    }
}

fn pop_end(
    store: &mut Store,
    key: &[u8],
    from_front: bool,
    now_ms: u64,
) -> Result<Option<Vec<u8>>, StoreError> {
    if from_front {
        store.lpop(key, now_ms)
    } else {
        store.rpop(key, now_ms)
    }
}

fn deregister(state: &mut EngineState, ticket: u64, keys: &[&[u8]]) {
    for key in keys {
        if let Some(queue) = state.waiters.get_mut(*key) {
            queue.retain(|t| *t != ticket);
            if queue.is_empty() {
                state.waiters.remove(*key);
            }
        }
    }
}

fn apply_limit<T>(items: Vec<T>, limit: Option<(i64, i64)>) -> Vec<T> {
    let Some((offset, count)) = limit else {
        return items;
    };
    let skip = offset.max(0) as usize;
    if skip >= items.len() {
        return Vec::new();
    }
    let take = if count < 0 {
        items.len() - skip
    } else {
        count as usize
    };
    items.into_iter().skip(skip).take(take).collect()
}

#[cfg(test)]
mod tests {
    use super::{Clock, Engine, ManualClock, StoreError, SystemClock, TtlValue, apply_limit};
    use std::sync::Arc;

    fn b(text: &str) -> Vec<u8> {
        text.as_bytes().to_vec()
    }

    fn manual_engine(start_ms: u64) -> (Engine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start_ms));
        let engine = Engine::with_clock_and_seed(clock.clone(), 7);
        (engine, clock)
    }

    #[test]
    fn system_clock_advances() {
        let clock = SystemClock;
        assert!(clock.now_ms() > 0);
    }

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance_ms(500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.advance_secs(2);
        assert_eq!(clock.now_ms(), 3_500);
        clock.set_ms(42);
        assert_eq!(clock.now_ms(), 42);
    }

    #[test]
    fn cloned_handles_share_one_keyspace() {
        let (engine, _) = manual_engine(0);
        let other = engine.clone();
        engine.set(b("k"), b("v"));
        assert_eq!(other.get(b"k").unwrap(), Some(b("v")));
        other.flush_db();
        assert_eq!(engine.dbsize(), 0);
    }

    #[test]
    fn ttl_follows_the_injected_clock() {
        let (engine, clock) = manual_engine(0);
        engine.set(b("k"), b("v"));
        assert!(engine.expire(b"k", 10));
        assert_eq!(engine.ttl(b"k"), TtlValue::Remaining(10));
        clock.advance_secs(5);
        assert_eq!(engine.ttl(b"k"), TtlValue::Remaining(5));
        clock.advance_secs(5);
        assert_eq!(engine.ttl(b"k"), TtlValue::KeyMissing);
        assert_eq!(engine.get(b"k").unwrap(), None);
    }

    #[test]
    fn key_type_reports_none_for_missing_keys() {
        let (engine, _) = manual_engine(0);
        assert_eq!(engine.key_type(b"k"), "none");
        engine.set(b("k"), b("v"));
        assert_eq!(engine.key_type(b"k"), "string");
    }

    #[test]
    fn decrby_cannot_negate_i64_min() {
        let (engine, _) = manual_engine(0);
        assert_eq!(engine.decrby(b"n", i64::MIN), Err(StoreError::IntegerOverflow));
    }

    #[test]
    fn seeded_engines_pick_the_same_members() {
        let draws = |seed: u64| {
            let clock = Arc::new(ManualClock::new(0));
            let engine = Engine::with_clock_and_seed(clock, seed);
            engine
                .sadd(b"s", &[b("a"), b("b"), b("c"), b("d"), b("e")])
                .unwrap();
            let mut picked = Vec::new();
            while let Some(member) = engine.spop(b"s").unwrap() {
                picked.push(member);
            }
            picked
        };
        assert_eq!(draws(99), draws(99));
        assert_eq!(draws(99).len(), 5);
    }

    #[test]
    fn srandmember_peeks_without_removing() {
        let (engine, _) = manual_engine(0);
        engine.sadd(b"s", &[b("a"), b("b")]).unwrap();
        assert!(engine.srandmember(b"s").unwrap().is_some());
        assert_eq!(engine.scard(b"s").unwrap(), 2);
        assert_eq!(engine.srandmember(b"missing").unwrap(), None);
    }

    #[test]
    fn apply_limit_offset_and_count() {
        let items = vec![1, 2, 3, 4, 5];
        assert_eq!(apply_limit(items.clone(), None), vec![1, 2, 3, 4, 5]);
        assert_eq!(apply_limit(items.clone(), Some((1, 2))), vec![2, 3]);
        assert_eq!(apply_limit(items.clone(), Some((2, -1))), vec![3, 4, 5]);
        assert_eq!(apply_limit(items.clone(), Some((5, 10))), Vec::<i32>::new());
        assert_eq!(apply_limit(items.clone(), Some((9, -1))), Vec::<i32>::new());
        assert_eq!(apply_limit(items, Some((0, 0))), Vec::<i32>::new());
    }

    #[test]
    fn non_blocking_bpop_path_returns_immediately() {
        let (engine, _) = manual_engine(0);
        engine.rpush(b"l", &[b("a"), b("b")]).unwrap();
        assert_eq!(
            engine.blpop(0, &[b"nope", b"l"]).unwrap(),
            Some((b("l"), b("a")))
        );
        assert_eq!(engine.brpop(0, &[b"l"]).unwrap(), Some((b("l"), b("b"))));
        // drained: a positive timeout now expires with None
        assert_eq!(engine.blpop(1, &[b"l"]).unwrap(), None);
    }

    #[test]
    fn bpop_propagates_type_errors() {
        let (engine, _) = manual_engine(0);
        engine.set(b("s"), b("v"));
        assert_eq!(engine.blpop(1, &[b"s"]), Err(StoreError::WrongType));
    }
}
