#![forbid(unsafe_code)]

//! The single keyspace behind every command.
//!
//! One map owns every key; a key's current type is whichever [`Value`] variant
//! it holds, so exclusive type ownership is structural rather than a
//! convention between parallel maps. Expiration deadlines live in a side
//! [`ExpirationTracker`] and every operation resolves the key through
//! [`Store::drop_if_expired`] before touching it, which makes lazy expiry a
//! single code path instead of a per-command obligation.
//!
//! All operations take an explicit `now_ms` so callers own the clock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;

use er_expire::{ExpirationTracker, ExpiryState};
pub use er_expire::TtlValue;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("operation against a key holding the wrong kind of value")]
    WrongType,
    #[error("value is not an integer or out of range")]
    ValueNotInteger,
    #[error("value is not a valid float")]
    ValueNotFloat,
    #[error("increment or decrement would overflow")]
    IntegerOverflow,
    #[error("no such key")]
    KeyNotFound,
    #[error("index out of range")]
    IndexOutOfRange,
    #[error("source and destination keys are the same")]
    SameKey,
    #[error("invalid expire time")]
    InvalidExpireTime,
    #[error("weight count must match source key count")]
    WeightCountMismatch,
    #[error("key type does not support sorting")]
    SortNotSupported,
}

/// The inner value held by a key in the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(Vec<u8>),
    List(VecDeque<Vec<u8>>),
    Hash(HashMap<Vec<u8>, Vec<u8>>),
    Set(HashSet<Vec<u8>>),
    /// Sorted set: member -> score mapping. Ordered iteration is done on demand.
    SortedSet(HashMap<Vec<u8>, f64>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    String,
    List,
    Hash,
    Set,
    ZSet,
}

impl ValueType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::List => "list",
            Self::Hash => "hash",
            Self::Set => "set",
            Self::ZSet => "zset",
        }
    }
}

/// One endpoint of a score range. Exclusive bounds are written `(value` in
/// the textual form; `-inf`/`+inf` parse to infinite inclusive bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreBound {
    Inclusive(f64),
    Exclusive(f64),
}

impl ScoreBound {
    /// Does `score` satisfy this bound when used as a minimum?
    #[must_use]
    pub fn allows_from_below(self, score: f64) -> bool {
        match self {
            Self::Inclusive(bound) => score >= bound,
            Self::Exclusive(bound) => score > bound,
        }
    }

    /// Does `score` satisfy this bound when used as a maximum?
    #[must_use]
    pub fn allows_from_above(self, score: f64) -> bool {
        match self {
            Self::Inclusive(bound) => score <= bound,
            Self::Exclusive(bound) => score < bound,
        }
    }
}

impl FromStr for ScoreBound {
    type Err = StoreError;

    fn from_str(text: &str) -> Result<Self, StoreError> {
        if text.eq_ignore_ascii_case("-inf") {
            Ok(Self::Inclusive(f64::NEG_INFINITY))
        } else if text.eq_ignore_ascii_case("+inf") || text.eq_ignore_ascii_case("inf") {
            Ok(Self::Inclusive(f64::INFINITY))
        } else if let Some(rest) = text.strip_prefix('(') {
            let val = rest.parse::<f64>().map_err(|_| StoreError::ValueNotFloat)?;
            Ok(Self::Exclusive(val))
        } else {
            let val = text.parse::<f64>().map_err(|_| StoreError::ValueNotFloat)?;
            Ok(Self::Inclusive(val))
        }
    }
}

fn in_score_range(score: f64, min: ScoreBound, max: ScoreBound) -> bool {
    min.allows_from_below(score) && max.allows_from_above(score)
}

/// Combining function for sorted-set union/intersection stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Aggregate {
    #[default]
    Sum,
    Min,
    Max,
}

impl Aggregate {
    #[must_use]
    pub fn combine(self, a: f64, b: f64) -> f64 {
        match self {
            Self::Sum => a + b,
            Self::Min => a.min(b),
            Self::Max => a.max(b),
        }
    }
}

#[derive(Debug, Default)]
pub struct Store {
    entries: HashMap<Vec<u8>, Value>,
    expiry: ExpirationTracker,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The single resolve step: purge the key if its deadline has passed.
    /// Everything below calls this first, so an expired key is
    /// indistinguishable from one that was never written.
    fn drop_if_expired(&mut self, key: &[u8], now_ms: u64) {
        if self.expiry.state(key, now_ms) == ExpiryState::Expired {
            self.remove_entry(key);
        }
    }

    /// Remove a key's value together with its expiration record.
    fn remove_entry(&mut self, key: &[u8]) {
        self.entries.remove(key);
        self.expiry.remove(key);
    }

    /// Purge every expired key. Used by the whole-keyspace reads (`keys`,
    /// `dbsize`) that must not observe logically-absent keys.
    fn sweep_expired(&mut self, now_ms: u64) {
        let all_keys: Vec<Vec<u8>> = self.entries.keys().cloned().collect();
        for key in &all_keys {
            self.drop_if_expired(key, now_ms);
        }
    }

    // ── String operations ────────────────────────────────────────────

    /// Unconditional write. Discards any prior value of any type and any
    /// prior TTL; `ttl_ms` installs a fresh relative deadline.
    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>, ttl_ms: Option<u64>, now_ms: u64) {
        self.expiry.remove(&key);
        if let Some(ttl) = ttl_ms {
            self.expiry.set_expire_at(&key, now_ms.saturating_add(ttl));
        }
        self.entries.insert(key, Value::String(value));
    }

    pub fn get(&mut self, key: &[u8], now_ms: u64) -> Result<Option<Vec<u8>>, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::String(v)) => Ok(Some(v.clone())),
            Some(_) => Err(StoreError::WrongType),
            None => Ok(None),
        }
    }

    /// Swap in a new value, returning the old one. The replacement discards a
    /// pre-existing TTL like any other whole-value write.
    pub fn getset(
        &mut self,
        key: Vec<u8>,
        value: Vec<u8>,
        now_ms: u64,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        self.drop_if_expired(&key, now_ms);
        let old = match self.entries.get(&key) {
            Some(Value::String(v)) => Some(v.clone()),
            Some(_) => return Err(StoreError::WrongType),
            None => None,
        };
        self.set(key, value, None, now_ms);
        Ok(old)
    }

    pub fn getdel(&mut self, key: &[u8], now_ms: u64) -> Result<Option<Vec<u8>>, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::String(v)) => {
                let old = v.clone();
                self.remove_entry(key);
                Ok(Some(old))
            }
            Some(_) => Err(StoreError::WrongType),
            None => Ok(None),
        }
    }

    pub fn setnx(&mut self, key: Vec<u8>, value: Vec<u8>, now_ms: u64) -> bool {
        self.drop_if_expired(&key, now_ms);
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, Value::String(value));
        true
    }

    pub fn setex(
        &mut self,
        key: Vec<u8>,
        seconds: i64,
        value: Vec<u8>,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        if seconds <= 0 {
            return Err(StoreError::InvalidExpireTime);
        }
        let ttl_ms = u64::try_from(seconds).unwrap_or(u64::MAX).saturating_mul(1000);
        self.set(key, value, Some(ttl_ms), now_ms);
        Ok(())
    }

    pub fn mset(&mut self, pairs: &[(Vec<u8>, Vec<u8>)], now_ms: u64) {
        for (key, value) in pairs {
            self.set(key.clone(), value.clone(), None, now_ms);
        }
    }

    /// All-or-nothing multi-set: if any key already exists nothing is written.
    pub fn msetnx(&mut self, pairs: &[(Vec<u8>, Vec<u8>)], now_ms: u64) -> bool {
        for (key, _) in pairs {
            self.drop_if_expired(key, now_ms);
            if self.entries.contains_key(key) {
                return false;
            }
        }
        self.mset(pairs, now_ms);
        true
    }

    /// MGET returns values for each key; non-string keys return None.
    #[must_use]
    pub fn mget(&mut self, keys: &[&[u8]], now_ms: u64) -> Vec<Option<Vec<u8>>> {
        keys.iter()
            .map(|key| {
                self.drop_if_expired(key, now_ms);
                match self.entries.get(*key) {
                    Some(Value::String(v)) => Some(v.clone()),
                    _ => None,
                }
            })
            .collect()
    }

    pub fn strlen(&mut self, key: &[u8], now_ms: u64) -> Result<usize, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::String(v)) => Ok(v.len()),
            Some(_) => Err(StoreError::WrongType),
            None => Ok(0),
        }
    }

    /// Append to an existing string or create the key from an empty baseline.
    /// Returns the new length. An in-place mutation, so a TTL survives.
    pub fn append(&mut self, key: &[u8], value: &[u8], now_ms: u64) -> Result<usize, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get_mut(key) {
            Some(Value::String(v)) => {
                v.extend_from_slice(value);
                Ok(v.len())
            }
            Some(_) => Err(StoreError::WrongType),
            None => {
                let len = value.len();
                self.entries.insert(key.to_vec(), Value::String(value.to_vec()));
                Ok(len)
            }
        }
    }

    /// The full current content must parse as a base-10 integer; an absent
    /// key counts from zero.
    pub fn incrby(&mut self, key: &[u8], delta: i64, now_ms: u64) -> Result<i64, StoreError> {
        self.drop_if_expired(key, now_ms);
        let current = match self.entries.get(key) {
            Some(Value::String(v)) => parse_i64(v)?,
            Some(_) => return Err(StoreError::WrongType),
            None => 0,
        };
        let next = current.checked_add(delta).ok_or(StoreError::IntegerOverflow)?;
        self.entries
            .insert(key.to_vec(), Value::String(next.to_string().into_bytes()));
        Ok(next)
    }

    pub fn incrbyfloat(&mut self, key: &[u8], delta: f64, now_ms: u64) -> Result<f64, StoreError> {
        self.drop_if_expired(key, now_ms);
        let current = match self.entries.get(key) {
            Some(Value::String(v)) => parse_f64(v)?,
            Some(_) => return Err(StoreError::WrongType),
            None => 0.0,
        };
        let next = current + delta;
        if next.is_infinite() || next.is_nan() {
            return Err(StoreError::ValueNotFloat);
        }
        self.entries
            .insert(key.to_vec(), Value::String(next.to_string().into_bytes()));
        Ok(next)
    }

    /// Byte range with negative offsets from the end, clamped to the content.
    pub fn getrange(
        &mut self,
        key: &[u8],
        start: i64,
        end: i64,
        now_ms: u64,
    ) -> Result<Vec<u8>, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::String(v)) => {
                let len = v.len() as i64;
                let s = normalize_index(start, len);
                let e = normalize_index(end, len);
                if s > e || s >= v.len() {
                    Ok(Vec::new())
                } else {
                    let end_idx = (e + 1).min(v.len());
                    Ok(v[s..end_idx].to_vec())
                }
            }
            Some(_) => Err(StoreError::WrongType),
            None => Ok(Vec::new()),
        }
    }

    /// Overwrite bytes at `offset`, zero-filling any gap. Returns the new
    /// length.
    pub fn setrange(
        &mut self,
        key: &[u8],
        offset: usize,
        value: &[u8],
        now_ms: u64,
    ) -> Result<usize, StoreError> {
        self.drop_if_expired(key, now_ms);
        let buf = match self.entries.get_mut(key) {
            Some(Value::String(v)) => v,
            Some(_) => return Err(StoreError::WrongType),
            None => {
                self.entries.insert(key.to_vec(), Value::String(Vec::new()));
                match self.entries.get_mut(key) {
                    Some(Value::String(v)) => v,
                    _ => unreachable!(),
                }
            }
        };
        let needed = offset + value.len();
        if buf.len() < needed {
            buf.resize(needed, 0);
        }
        buf[offset..offset + value.len()].copy_from_slice(value);
        Ok(buf.len())
    }

    // ── Bitmap (string extension) operations ─────────────────────────

    /// Set one bit (MSB-first within each byte), growing the value with zero
    /// bytes as needed. Returns the previous bit.
    pub fn setbit(
        &mut self,
        key: &[u8],
        offset: usize,
        value: bool,
        now_ms: u64,
    ) -> Result<bool, StoreError> {
        self.drop_if_expired(key, now_ms);
        let byte_idx = offset / 8;
        let bit_idx = 7 - (offset % 8);
        let bytes = match self.entries.get_mut(key) {
            Some(Value::String(v)) => v,
            Some(_) => return Err(StoreError::WrongType),
            None => {
                self.entries.insert(key.to_vec(), Value::String(Vec::new()));
                match self.entries.get_mut(key) {
                    Some(Value::String(v)) => v,
                    _ => unreachable!(),
                }
            }
        };
        if bytes.len() <= byte_idx {
            bytes.resize(byte_idx + 1, 0);
        }
        let old_bit = (bytes[byte_idx] >> bit_idx) & 1 == 1;
        if value {
            bytes[byte_idx] |= 1 << bit_idx;
        } else {
            bytes[byte_idx] &= !(1 << bit_idx);
        }
        Ok(old_bit)
    }

    /// False for out-of-bounds offsets and absent keys.
    pub fn getbit(&mut self, key: &[u8], offset: usize, now_ms: u64) -> Result<bool, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::String(v)) => {
                let byte_idx = offset / 8;
                let bit_idx = 7 - (offset % 8);
                if byte_idx >= v.len() {
                    Ok(false)
                } else {
                    Ok((v[byte_idx] >> bit_idx) & 1 == 1)
                }
            }
            Some(_) => Err(StoreError::WrongType),
            None => Ok(false),
        }
    }

    pub fn bitcount(
        &mut self,
        key: &[u8],
        start: Option<i64>,
        end: Option<i64>,
        now_ms: u64,
    ) -> Result<usize, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::String(v)) => {
                let len = v.len() as i64;
                let s = match start {
                    Some(s) => normalize_index(s, len),
                    None => 0,
                };
                let e = match end {
                    Some(e) => normalize_index(e, len),
                    None => v.len().saturating_sub(1),
                };
                if s > e || s >= v.len() {
                    return Ok(0);
                }
                let end_idx = (e + 1).min(v.len());
                Ok(v[s..end_idx].iter().map(|b| b.count_ones() as usize).sum())
            }
            Some(_) => Err(StoreError::WrongType),
            None => Ok(0),
        }
    }

    // ── Keyspace operations ──────────────────────────────────────────

    pub fn exists(&mut self, key: &[u8], now_ms: u64) -> bool {
        self.drop_if_expired(key, now_ms);
        self.entries.contains_key(key)
    }

    pub fn del(&mut self, keys: &[Vec<u8>], now_ms: u64) -> u64 {
        let mut removed = 0_u64;
        for key in keys {
            self.drop_if_expired(key, now_ms);
            if self.entries.remove(key.as_slice()).is_some() {
                self.expiry.remove(key);
                removed += 1;
            }
        }
        removed
    }

    #[must_use]
    pub fn value_type(&mut self, key: &[u8], now_ms: u64) -> Option<ValueType> {
        self.drop_if_expired(key, now_ms);
        self.entries.get(key).map(|value| match value {
            Value::String(_) => ValueType::String,
            Value::List(_) => ValueType::List,
            Value::Hash(_) => ValueType::Hash,
            Value::Set(_) => ValueType::Set,
            Value::SortedSet(_) => ValueType::ZSet,
        })
    }

    #[must_use]
    pub fn key_type(&mut self, key: &[u8], now_ms: u64) -> Option<&'static str> {
        self.value_type(key, now_ms).map(ValueType::as_str)
    }

    /// Move value and expiration state onto `newkey`, overwriting whatever it
    /// held. Fails when the source is absent/expired or renames onto itself.
    pub fn rename(&mut self, key: &[u8], newkey: &[u8], now_ms: u64) -> Result<(), StoreError> {
        if key == newkey {
            return Err(StoreError::SameKey);
        }
        self.drop_if_expired(key, now_ms);
        let value = self.entries.remove(key).ok_or(StoreError::KeyNotFound)?;
        self.entries.insert(newkey.to_vec(), value);
        self.expiry.transfer(key, newkey);
        Ok(())
    }

    /// Like `rename` but only when the target is absent or itself expired.
    pub fn renamenx(
        &mut self,
        key: &[u8],
        newkey: &[u8],
        now_ms: u64,
    ) -> Result<bool, StoreError> {
        if key == newkey {
            return Err(StoreError::SameKey);
        }
        self.drop_if_expired(key, now_ms);
        self.drop_if_expired(newkey, now_ms);
        if !self.entries.contains_key(key) {
            return Err(StoreError::KeyNotFound);
        }
        if self.entries.contains_key(newkey) {
            return Ok(false);
        }
        self.rename(key, newkey, now_ms)?;
        Ok(true)
    }

    #[must_use]
    pub fn keys_matching(&mut self, pattern: &[u8], now_ms: u64) -> Vec<Vec<u8>> {
        self.sweep_expired(now_ms);
        let mut result: Vec<Vec<u8>> = self
            .entries
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        result.sort();
        result
    }

    #[must_use]
    pub fn dbsize(&mut self, now_ms: u64) -> usize {
        self.sweep_expired(now_ms);
        self.entries.len()
    }

    pub fn flushdb(&mut self) {
        self.entries.clear();
        self.expiry.clear_all();
    }

    /// Non-positive TTLs delete the key immediately and still report success.
    pub fn expire_seconds(&mut self, key: &[u8], seconds: i64, now_ms: u64) -> bool {
        self.drop_if_expired(key, now_ms);
        if !self.entries.contains_key(key) {
            return false;
        }
        if seconds <= 0 {
            self.remove_entry(key);
            return true;
        }
        let ttl_ms = u64::try_from(seconds).unwrap_or(u64::MAX).saturating_mul(1000);
        self.expiry.set_expire_at(key, now_ms.saturating_add(ttl_ms));
        true
    }

    pub fn expire_at_ms(&mut self, key: &[u8], at_ms: u64, now_ms: u64) -> bool {
        self.drop_if_expired(key, now_ms);
        if !self.entries.contains_key(key) {
            return false;
        }
        if at_ms <= now_ms {
            self.remove_entry(key);
            return true;
        }
        self.expiry.set_expire_at(key, at_ms);
        true
    }

    #[must_use]
    pub fn ttl(&mut self, key: &[u8], now_ms: u64) -> TtlValue {
        self.drop_if_expired(key, now_ms);
        if !self.entries.contains_key(key) {
            return TtlValue::KeyMissing;
        }
        match self.expiry.ttl_seconds(key, now_ms) {
            None => TtlValue::NoExpiry,
            Some(seconds) => TtlValue::Remaining(seconds),
        }
    }

    /// Drop a key's TTL, reporting whether one existed.
    pub fn persist(&mut self, key: &[u8], now_ms: u64) -> bool {
        self.drop_if_expired(key, now_ms);
        self.entries.contains_key(key) && self.expiry.clear(key)
    }

    /// Sort a list/set/zset's members: numerically when every member parses
    /// as a number, byte-lexicographically otherwise. Strings and hashes
    /// cannot be sorted.
    pub fn sort_values(&mut self, key: &[u8], now_ms: u64) -> Result<Vec<Vec<u8>>, StoreError> {
        self.drop_if_expired(key, now_ms);
        let mut items: Vec<Vec<u8>> = match self.entries.get(key) {
            Some(Value::List(l)) => l.iter().cloned().collect(),
            Some(Value::Set(s)) => s.iter().cloned().collect(),
            Some(Value::SortedSet(zs)) => zs.keys().cloned().collect(),
            Some(_) => return Err(StoreError::SortNotSupported),
            None => return Ok(Vec::new()),
        };
        let numeric: Option<Vec<f64>> = items
            .iter()
            .map(|item| std::str::from_utf8(item).ok().and_then(|t| t.parse::<f64>().ok()))
            .collect();
        match numeric {
            Some(scores) => {
                let mut pairs: Vec<(f64, Vec<u8>)> = scores.into_iter().zip(items).collect();
                pairs.sort_by(|(s1, m1), (s2, m2)| cmp_score_member(*s1, m1, *s2, m2));
                Ok(pairs.into_iter().map(|(_, m)| m).collect())
            }
            None => {
                items.sort();
                Ok(items)
            }
        }
    }

    // ── Hash operations ──────────────────────────────────────────────

    /// Returns true when the field was newly created (as opposed to
    /// overwriting an existing field's value).
    pub fn hset(
        &mut self,
        key: &[u8],
        field: Vec<u8>,
        value: Vec<u8>,
        now_ms: u64,
    ) -> Result<bool, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get_mut(key) {
            Some(Value::Hash(m)) => {
                let is_new = !m.contains_key(&field);
                m.insert(field, value);
                Ok(is_new)
            }
            Some(_) => Err(StoreError::WrongType),
            None => {
                let mut m = HashMap::new();
                m.insert(field, value);
                self.entries.insert(key.to_vec(), Value::Hash(m));
                Ok(true)
            }
        }
    }

    pub fn hsetnx(
        &mut self,
        key: &[u8],
        field: Vec<u8>,
        value: Vec<u8>,
        now_ms: u64,
    ) -> Result<bool, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get_mut(key) {
            Some(Value::Hash(m)) => {
                use std::collections::hash_map::Entry;
                if let Entry::Vacant(slot) = m.entry(field) {
                    slot.insert(value);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Some(_) => Err(StoreError::WrongType),
            None => {
                let mut m = HashMap::new();
                m.insert(field, value);
                self.entries.insert(key.to_vec(), Value::Hash(m));
                Ok(true)
            }
        }
    }

    pub fn hget(
        &mut self,
        key: &[u8],
        field: &[u8],
        now_ms: u64,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::Hash(m)) => Ok(m.get(field).cloned()),
            Some(_) => Err(StoreError::WrongType),
            None => Ok(None),
        }
    }

    pub fn hdel(&mut self, key: &[u8], fields: &[&[u8]], now_ms: u64) -> Result<u64, StoreError> {
        self.drop_if_expired(key, now_ms);
        let removed = match self.entries.get_mut(key) {
            Some(Value::Hash(m)) => {
                let mut removed = 0_u64;
                for field in fields {
                    if m.remove(*field).is_some() {
                        removed += 1;
                    }
                }
                if m.is_empty() {
                    self.remove_entry(key);
                }
                removed
            }
            Some(_) => return Err(StoreError::WrongType),
            None => 0,
        };
        Ok(removed)
    }

    pub fn hexists(&mut self, key: &[u8], field: &[u8], now_ms: u64) -> Result<bool, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::Hash(m)) => Ok(m.contains_key(field)),
            Some(_) => Err(StoreError::WrongType),
            None => Ok(false),
        }
    }

    pub fn hlen(&mut self, key: &[u8], now_ms: u64) -> Result<usize, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::Hash(m)) => Ok(m.len()),
            Some(_) => Err(StoreError::WrongType),
            None => Ok(0),
        }
    }

    /// Field-sorted pairs, so readers see a deterministic order.
    #[allow(clippy::type_complexity)]
    pub fn hgetall(
        &mut self,
        key: &[u8],
        now_ms: u64,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::Hash(m)) => {
                let mut pairs: Vec<(Vec<u8>, Vec<u8>)> =
                    m.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                pairs.sort_by(|a, b| a.0.cmp(&b.0));
                Ok(pairs)
            }
            Some(_) => Err(StoreError::WrongType),
            None => Ok(Vec::new()),
        }
    }

    pub fn hkeys(&mut self, key: &[u8], now_ms: u64) -> Result<Vec<Vec<u8>>, StoreError> {
        Ok(self.hgetall(key, now_ms)?.into_iter().map(|(f, _)| f).collect())
    }

    pub fn hvals(&mut self, key: &[u8], now_ms: u64) -> Result<Vec<Vec<u8>>, StoreError> {
        Ok(self.hgetall(key, now_ms)?.into_iter().map(|(_, v)| v).collect())
    }

    pub fn hmset(
        &mut self,
        key: &[u8],
        pairs: &[(Vec<u8>, Vec<u8>)],
        now_ms: u64,
    ) -> Result<(), StoreError> {
        for (field, value) in pairs {
            self.hset(key, field.clone(), value.clone(), now_ms)?;
        }
        Ok(())
    }

    pub fn hmget(
        &mut self,
        key: &[u8],
        fields: &[&[u8]],
        now_ms: u64,
    ) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::Hash(m)) => Ok(fields.iter().map(|f| m.get(*f).cloned()).collect()),
            Some(_) => Err(StoreError::WrongType),
            None => Ok(fields.iter().map(|_| None).collect()),
        }
    }

    /// A missing field counts from zero; a non-numeric existing value errors.
    pub fn hincrby(
        &mut self,
        key: &[u8],
        field: &[u8],
        delta: i64,
        now_ms: u64,
    ) -> Result<i64, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get_mut(key) {
            Some(Value::Hash(m)) => {
                let current = match m.get(field) {
                    Some(v) => parse_i64(v)?,
                    None => 0,
                };
                let next = current.checked_add(delta).ok_or(StoreError::IntegerOverflow)?;
                m.insert(field.to_vec(), next.to_string().into_bytes());
                Ok(next)
            }
            Some(_) => Err(StoreError::WrongType),
            None => {
                let mut m = HashMap::new();
                m.insert(field.to_vec(), delta.to_string().into_bytes());
                self.entries.insert(key.to_vec(), Value::Hash(m));
                Ok(delta)
            }
        }
    }

    pub fn hincrbyfloat(
        &mut self,
        key: &[u8],
        field: &[u8],
        delta: f64,
        now_ms: u64,
    ) -> Result<f64, StoreError> {
        if delta.is_infinite() || delta.is_nan() {
            return Err(StoreError::ValueNotFloat);
        }
        self.drop_if_expired(key, now_ms);
        match self.entries.get_mut(key) {
            Some(Value::Hash(m)) => {
                let current = match m.get(field) {
                    Some(v) => parse_f64(v)?,
                    None => 0.0,
                };
                let next = current + delta;
                if next.is_infinite() || next.is_nan() {
                    return Err(StoreError::ValueNotFloat);
                }
                m.insert(field.to_vec(), next.to_string().into_bytes());
                Ok(next)
            }
            Some(_) => Err(StoreError::WrongType),
            None => {
                let mut m = HashMap::new();
                m.insert(field.to_vec(), delta.to_string().into_bytes());
                self.entries.insert(key.to_vec(), Value::Hash(m));
                Ok(delta)
            }
        }
    }

    pub fn hstrlen(&mut self, key: &[u8], field: &[u8], now_ms: u64) -> Result<usize, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::Hash(m)) => Ok(m.get(field).map_or(0, Vec::len)),
            Some(_) => Err(StoreError::WrongType),
            None => Ok(0),
        }
    }

    // ── List operations ──────────────────────────────────────────────

    pub fn lpush(
        &mut self,
        key: &[u8],
        values: &[Vec<u8>],
        now_ms: u64,
    ) -> Result<usize, StoreError> {
        self.push_list(key, values, true, true, now_ms)
    }

    pub fn rpush(
        &mut self,
        key: &[u8],
        values: &[Vec<u8>],
        now_ms: u64,
    ) -> Result<usize, StoreError> {
        self.push_list(key, values, false, true, now_ms)
    }

    /// Push only when the key already holds a list; otherwise report length 0
    /// with no mutation.
    pub fn lpushx(
        &mut self,
        key: &[u8],
        values: &[Vec<u8>],
        now_ms: u64,
    ) -> Result<usize, StoreError> {
        self.push_list(key, values, true, false, now_ms)
    }

    pub fn rpushx(
        &mut self,
        key: &[u8],
        values: &[Vec<u8>],
        now_ms: u64,
    ) -> Result<usize, StoreError> {
        self.push_list(key, values, false, false, now_ms)
    }

    fn push_list(
        &mut self,
        key: &[u8],
        values: &[Vec<u8>],
        front: bool,
        create: bool,
        now_ms: u64,
    ) -> Result<usize, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get_mut(key) {
            Some(Value::List(l)) => {
                for v in values {
                    if front {
                        l.push_front(v.clone());
                    } else {
                        l.push_back(v.clone());
                    }
                }
                Ok(l.len())
            }
            Some(_) => Err(StoreError::WrongType),
            None if create && !values.is_empty() => {
                let mut l = VecDeque::new();
                for v in values {
                    if front {
                        l.push_front(v.clone());
                    } else {
                        l.push_back(v.clone());
                    }
                }
                let len = l.len();
                self.entries.insert(key.to_vec(), Value::List(l));
                Ok(len)
            }
            None => Ok(0),
        }
    }

    pub fn lpop(&mut self, key: &[u8], now_ms: u64) -> Result<Option<Vec<u8>>, StoreError> {
        self.pop_list(key, true, now_ms)
    }

    pub fn rpop(&mut self, key: &[u8], now_ms: u64) -> Result<Option<Vec<u8>>, StoreError> {
        self.pop_list(key, false, now_ms)
    }

    fn pop_list(
        &mut self,
        key: &[u8],
        front: bool,
        now_ms: u64,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        self.drop_if_expired(key, now_ms);
        let (val, emptied) = match self.entries.get_mut(key) {
            Some(Value::List(l)) => {
                let val = if front { l.pop_front() } else { l.pop_back() };
                (val, l.is_empty())
            }
            Some(_) => return Err(StoreError::WrongType),
            None => return Ok(None),
        };
        if emptied {
            self.remove_entry(key);
        }
        Ok(val)
    }

    pub fn llen(&mut self, key: &[u8], now_ms: u64) -> Result<usize, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::List(l)) => Ok(l.len()),
            Some(_) => Err(StoreError::WrongType),
            None => Ok(0),
        }
    }

    pub fn lrange(
        &mut self,
        key: &[u8],
        start: i64,
        stop: i64,
        now_ms: u64,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::List(l)) => {
                let len = l.len() as i64;
                let s = normalize_index(start, len);
                let e = normalize_index(stop, len);
                if s > e || s >= l.len() {
                    return Ok(Vec::new());
                }
                let e = e.min(l.len() - 1);
                Ok(l.iter().skip(s).take(e - s + 1).cloned().collect())
            }
            Some(_) => Err(StoreError::WrongType),
            None => Ok(Vec::new()),
        }
    }

    pub fn lindex(
        &mut self,
        key: &[u8],
        index: i64,
        now_ms: u64,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::List(l)) => {
                let len = l.len() as i64;
                if index < -len || index >= len {
                    return Ok(None);
                }
                let idx = normalize_index(index, len);
                Ok(l.get(idx).cloned())
            }
            Some(_) => Err(StoreError::WrongType),
            None => Ok(None),
        }
    }

    /// An out-of-range index is a reported error, not a panic; the list is
    /// left untouched.
    pub fn lset(
        &mut self,
        key: &[u8],
        index: i64,
        value: Vec<u8>,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get_mut(key) {
            Some(Value::List(l)) => {
                let len = l.len() as i64;
                if index < -len || index >= len {
                    return Err(StoreError::IndexOutOfRange);
                }
                let idx = normalize_index(index, len);
                l[idx] = value;
                Ok(())
            }
            Some(_) => Err(StoreError::WrongType),
            None => Err(StoreError::KeyNotFound),
        }
    }

    /// Returns the new length, `-1` when the pivot is missing, `0` when the
    /// key does not exist.
    pub fn linsert_before(
        &mut self,
        key: &[u8],
        pivot: &[u8],
        value: Vec<u8>,
        now_ms: u64,
    ) -> Result<i64, StoreError> {
        self.linsert(key, pivot, value, true, now_ms)
    }

    pub fn linsert_after(
        &mut self,
        key: &[u8],
        pivot: &[u8],
        value: Vec<u8>,
        now_ms: u64,
    ) -> Result<i64, StoreError> {
        self.linsert(key, pivot, value, false, now_ms)
    }

    fn linsert(
        &mut self,
        key: &[u8],
        pivot: &[u8],
        value: Vec<u8>,
        before: bool,
        now_ms: u64,
    ) -> Result<i64, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get_mut(key) {
            Some(Value::List(l)) => match l.iter().position(|v| v.as_slice() == pivot) {
                Some(pos) => {
                    l.insert(if before { pos } else { pos + 1 }, value);
                    Ok(l.len() as i64)
                }
                None => Ok(-1),
            },
            Some(_) => Err(StoreError::WrongType),
            None => Ok(0),
        }
    }

    /// `count > 0` removes from the head, `count < 0` from the tail,
    /// `count == 0` removes every match.
    pub fn lrem(
        &mut self,
        key: &[u8],
        count: i64,
        value: &[u8],
        now_ms: u64,
    ) -> Result<u64, StoreError> {
        self.drop_if_expired(key, now_ms);
        let (removed, emptied) = match self.entries.get_mut(key) {
            Some(Value::List(l)) => {
                let mut removed = 0_u64;
                if count > 0 {
                    let limit = count as u64;
                    let mut i = 0;
                    while i < l.len() && removed < limit {
                        if l[i].as_slice() == value {
                            l.remove(i);
                            removed += 1;
                        } else {
                            i += 1;
                        }
                    }
                } else if count < 0 {
                    let limit = count.unsigned_abs();
                    let mut i = l.len();
                    while i > 0 && removed < limit {
                        i -= 1;
                        if l[i].as_slice() == value {
                            l.remove(i);
                            removed += 1;
                        }
                    }
                } else {
                    let old_len = l.len();
                    l.retain(|v| v.as_slice() != value);
                    removed = (old_len - l.len()) as u64;
                }
                (removed, l.is_empty())
            }
            Some(_) => return Err(StoreError::WrongType),
            None => (0, false),
        };
        if emptied {
            self.remove_entry(key);
        }
        Ok(removed)
    }

    /// Keep only the clamped `[start, stop]` window; an empty window removes
    /// the key.
    pub fn ltrim(
        &mut self,
        key: &[u8],
        start: i64,
        stop: i64,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        self.drop_if_expired(key, now_ms);
        let emptied = match self.entries.get_mut(key) {
            Some(Value::List(l)) => {
                let len = l.len() as i64;
                let s = normalize_index(start, len);
                let e = normalize_index(stop, len);
                if s > e || s >= l.len() {
                    true
                } else {
                    let e = e.min(l.len() - 1);
                    l.truncate(e + 1);
                    l.drain(..s);
                    false
                }
            }
            Some(_) => return Err(StoreError::WrongType),
            None => false,
        };
        if emptied {
            self.remove_entry(key);
        }
        Ok(())
    }

    pub fn lpos(
        &mut self,
        key: &[u8],
        element: &[u8],
        now_ms: u64,
    ) -> Result<Option<usize>, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::List(l)) => Ok(l.iter().position(|v| v.as_slice() == element)),
            Some(_) => Err(StoreError::WrongType),
            None => Ok(None),
        }
    }

    /// Pop the tail of `source` and prepend it to `destination` atomically.
    pub fn rpoplpush(
        &mut self,
        source: &[u8],
        destination: &[u8],
        now_ms: u64,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        self.drop_if_expired(source, now_ms);
        self.drop_if_expired(destination, now_ms);
        match self.entries.get(destination) {
            Some(Value::List(_)) | None => {}
            Some(_) => return Err(StoreError::WrongType),
        }
        let Some(val) = self.pop_list(source, false, now_ms)? else {
            return Ok(None);
        };
        self.push_list(destination, std::slice::from_ref(&val), true, true, now_ms)?;
        Ok(Some(val))
    }

    // ── Set operations ───────────────────────────────────────────────

    /// Count of members newly added (duplicates don't count).
    pub fn sadd(
        &mut self,
        key: &[u8],
        members: &[Vec<u8>],
        now_ms: u64,
    ) -> Result<u64, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get_mut(key) {
            Some(Value::Set(s)) => {
                let mut added = 0_u64;
                for m in members {
                    if s.insert(m.clone()) {
                        added += 1;
                    }
                }
                Ok(added)
            }
            Some(_) => Err(StoreError::WrongType),
            None if members.is_empty() => Ok(0),
            None => {
                let s: HashSet<Vec<u8>> = members.iter().cloned().collect();
                let added = s.len() as u64;
                self.entries.insert(key.to_vec(), Value::Set(s));
                Ok(added)
            }
        }
    }

    pub fn srem(&mut self, key: &[u8], members: &[&[u8]], now_ms: u64) -> Result<u64, StoreError> {
        self.drop_if_expired(key, now_ms);
        let (removed, emptied) = match self.entries.get_mut(key) {
            Some(Value::Set(s)) => {
                let mut removed = 0_u64;
                for m in members {
                    if s.remove(*m) {
                        removed += 1;
                    }
                }
                (removed, s.is_empty())
            }
            Some(_) => return Err(StoreError::WrongType),
            None => (0, false),
        };
        if emptied {
            self.remove_entry(key);
        }
        Ok(removed)
    }

    /// Members in sorted byte order, so readers see a deterministic listing.
    pub fn smembers(&mut self, key: &[u8], now_ms: u64) -> Result<Vec<Vec<u8>>, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::Set(s)) => {
                let mut members: Vec<Vec<u8>> = s.iter().cloned().collect();
                members.sort();
                Ok(members)
            }
            Some(_) => Err(StoreError::WrongType),
            None => Ok(Vec::new()),
        }
    }

    pub fn scard(&mut self, key: &[u8], now_ms: u64) -> Result<usize, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::Set(s)) => Ok(s.len()),
            Some(_) => Err(StoreError::WrongType),
            None => Ok(0),
        }
    }

    pub fn sismember(
        &mut self,
        key: &[u8],
        member: &[u8],
        now_ms: u64,
    ) -> Result<bool, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::Set(s)) => Ok(s.contains(member)),
            Some(_) => Err(StoreError::WrongType),
            None => Ok(false),
        }
    }

    /// Remove and return the `nth` member in sorted order. The caller picks
    /// `nth` (the engine draws it from its injected RNG), which keeps member
    /// selection reproducible under a fixed seed.
    pub fn spop_nth(
        &mut self,
        key: &[u8],
        nth: usize,
        now_ms: u64,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        self.drop_if_expired(key, now_ms);
        let (member, emptied) = match self.entries.get_mut(key) {
            Some(Value::Set(s)) => {
                let mut members: Vec<&Vec<u8>> = s.iter().collect();
                members.sort();
                let target = members[nth % members.len()].clone();
                s.remove(&target);
                let emptied = s.is_empty();
                (Some(target), emptied)
            }
            Some(_) => return Err(StoreError::WrongType),
            None => return Ok(None),
        };
        if emptied {
            self.remove_entry(key);
        }
        Ok(member)
    }

    /// Peek at the `nth` member in sorted order without removing it.
    pub fn srandmember_nth(
        &mut self,
        key: &[u8],
        nth: usize,
        now_ms: u64,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::Set(s)) => {
                let mut members: Vec<&Vec<u8>> = s.iter().collect();
                members.sort();
                Ok(Some(members[nth % members.len()].clone()))
            }
            Some(_) => Err(StoreError::WrongType),
            None => Ok(None),
        }
    }

    /// True only when the member was present in `source`; it is then removed
    /// there and added to `destination` (created if needed).
    pub fn smove(
        &mut self,
        source: &[u8],
        destination: &[u8],
        member: &[u8],
        now_ms: u64,
    ) -> Result<bool, StoreError> {
        self.drop_if_expired(source, now_ms);
        self.drop_if_expired(destination, now_ms);
        match self.entries.get(source) {
            Some(Value::Set(_)) => {}
            Some(_) => return Err(StoreError::WrongType),
            None => return Ok(false),
        }
        match self.entries.get(destination) {
            Some(Value::Set(_)) | None => {}
            Some(_) => return Err(StoreError::WrongType),
        }
        if source == destination {
            let Some(Value::Set(s)) = self.entries.get(source) else {
                return Ok(false);
            };
            return Ok(s.contains(member));
        }
        let (removed, emptied) = {
            let Some(Value::Set(s)) = self.entries.get_mut(source) else {
                return Ok(false);
            };
            (s.remove(member), s.is_empty())
        };
        if !removed {
            return Ok(false);
        }
        if emptied {
            self.remove_entry(source);
        }
        self.sadd(destination, std::slice::from_ref(&member.to_vec()), now_ms)?;
        Ok(true)
    }

    /// Helper: get the set for a key, or an empty set if the key is absent.
    fn get_set_or_empty(
        &mut self,
        key: &[u8],
        now_ms: u64,
    ) -> Result<HashSet<Vec<u8>>, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::Set(s)) => Ok(s.clone()),
            Some(_) => Err(StoreError::WrongType),
            None => Ok(HashSet::new()),
        }
    }

    /// First set minus every following set.
    pub fn sdiff(&mut self, keys: &[&[u8]], now_ms: u64) -> Result<Vec<Vec<u8>>, StoreError> {
        let Some((first, rest)) = keys.split_first() else {
            return Ok(Vec::new());
        };
        let mut result = self.get_set_or_empty(first, now_ms)?;
        for key in rest {
            let other = self.get_set_or_empty(key, now_ms)?;
            result.retain(|m| !other.contains(m));
        }
        let mut v: Vec<Vec<u8>> = result.into_iter().collect();
        v.sort();
        Ok(v)
    }

    pub fn sinter(&mut self, keys: &[&[u8]], now_ms: u64) -> Result<Vec<Vec<u8>>, StoreError> {
        let Some((first, rest)) = keys.split_first() else {
            return Ok(Vec::new());
        };
        let mut result = self.get_set_or_empty(first, now_ms)?;
        for key in rest {
            let other = self.get_set_or_empty(key, now_ms)?;
            result.retain(|m| other.contains(m));
        }
        let mut v: Vec<Vec<u8>> = result.into_iter().collect();
        v.sort();
        Ok(v)
    }

    pub fn sunion(&mut self, keys: &[&[u8]], now_ms: u64) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut result = HashSet::new();
        for key in keys {
            result.extend(self.get_set_or_empty(key, now_ms)?);
        }
        let mut v: Vec<Vec<u8>> = result.into_iter().collect();
        v.sort();
        Ok(v)
    }

    pub fn sdiffstore(
        &mut self,
        destination: &[u8],
        keys: &[&[u8]],
        now_ms: u64,
    ) -> Result<usize, StoreError> {
        let members = self.sdiff(keys, now_ms)?;
        Ok(self.store_set_result(destination, members))
    }

    pub fn sinterstore(
        &mut self,
        destination: &[u8],
        keys: &[&[u8]],
        now_ms: u64,
    ) -> Result<usize, StoreError> {
        let members = self.sinter(keys, now_ms)?;
        Ok(self.store_set_result(destination, members))
    }

    pub fn sunionstore(
        &mut self,
        destination: &[u8],
        keys: &[&[u8]],
        now_ms: u64,
    ) -> Result<usize, StoreError> {
        let members = self.sunion(keys, now_ms)?;
        Ok(self.store_set_result(destination, members))
    }

    /// The destination is overwritten wholesale: value, type and TTL all go;
    /// an empty result leaves no key behind.
    fn store_set_result(&mut self, destination: &[u8], members: Vec<Vec<u8>>) -> usize {
        self.remove_entry(destination);
        let count = members.len();
        if count > 0 {
            self.entries
                .insert(destination.to_vec(), Value::Set(members.into_iter().collect()));
        }
        count
    }

    // ── Sorted set (zset) operations ─────────────────────────────────

    /// Add members or update scores of existing ones; only genuinely new
    /// members count toward the result.
    pub fn zadd(
        &mut self,
        key: &[u8],
        members: &[(f64, Vec<u8>)],
        now_ms: u64,
    ) -> Result<usize, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get_mut(key) {
            Some(Value::SortedSet(zs)) => {
                let mut added = 0;
                for (score, member) in members {
                    if zs.insert(member.clone(), *score).is_none() {
                        added += 1;
                    }
                }
                Ok(added)
            }
            Some(_) => Err(StoreError::WrongType),
            None if members.is_empty() => Ok(0),
            None => {
                let mut zs = HashMap::new();
                for (score, member) in members {
                    zs.insert(member.clone(), *score);
                }
                let added = zs.len();
                self.entries.insert(key.to_vec(), Value::SortedSet(zs));
                Ok(added)
            }
        }
    }

    /// Increment a member's score, creating it at `delta` when absent.
    pub fn zincrby(
        &mut self,
        key: &[u8],
        member: Vec<u8>,
        delta: f64,
        now_ms: u64,
    ) -> Result<f64, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get_mut(key) {
            Some(Value::SortedSet(zs)) => {
                let new_score = zs.get(&member).unwrap_or(&0.0) + delta;
                zs.insert(member, new_score);
                Ok(new_score)
            }
            Some(_) => Err(StoreError::WrongType),
            None => {
                let mut zs = HashMap::new();
                zs.insert(member, delta);
                self.entries.insert(key.to_vec(), Value::SortedSet(zs));
                Ok(delta)
            }
        }
    }

    pub fn zscore(
        &mut self,
        key: &[u8],
        member: &[u8],
        now_ms: u64,
    ) -> Result<Option<f64>, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::SortedSet(zs)) => Ok(zs.get(member).copied()),
            Some(_) => Err(StoreError::WrongType),
            None => Ok(None),
        }
    }

    pub fn zrem(&mut self, key: &[u8], members: &[&[u8]], now_ms: u64) -> Result<u64, StoreError> {
        self.drop_if_expired(key, now_ms);
        let (removed, emptied) = match self.entries.get_mut(key) {
            Some(Value::SortedSet(zs)) => {
                let mut removed = 0_u64;
                for member in members {
                    if zs.remove(*member).is_some() {
                        removed += 1;
                    }
                }
                (removed, zs.is_empty())
            }
            Some(_) => return Err(StoreError::WrongType),
            None => (0, false),
        };
        if emptied {
            self.remove_entry(key);
        }
        Ok(removed)
    }

    pub fn zcard(&mut self, key: &[u8], now_ms: u64) -> Result<usize, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::SortedSet(zs)) => Ok(zs.len()),
            Some(_) => Err(StoreError::WrongType),
            None => Ok(0),
        }
    }

    /// Zero-based position in ascending (score, member) order.
    pub fn zrank(
        &mut self,
        key: &[u8],
        member: &[u8],
        now_ms: u64,
    ) -> Result<Option<usize>, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::SortedSet(zs)) => {
                let Some(score) = zs.get(member).copied() else {
                    return Ok(None);
                };
                let rank = zs
                    .iter()
                    .filter(|(m, s)| score_member_lt(**s, m, score, member))
                    .count();
                Ok(Some(rank))
            }
            Some(_) => Err(StoreError::WrongType),
            None => Ok(None),
        }
    }

    pub fn zrevrank(
        &mut self,
        key: &[u8],
        member: &[u8],
        now_ms: u64,
    ) -> Result<Option<usize>, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::SortedSet(zs)) => {
                let Some(score) = zs.get(member).copied() else {
                    return Ok(None);
                };
                let rank = zs
                    .iter()
                    .filter(|(m, s)| score_member_lt(score, member, **s, m))
                    .count();
                Ok(Some(rank))
            }
            Some(_) => Err(StoreError::WrongType),
            None => Ok(None),
        }
    }

    pub fn zcount(
        &mut self,
        key: &[u8],
        min: ScoreBound,
        max: ScoreBound,
        now_ms: u64,
    ) -> Result<usize, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::SortedSet(zs)) => Ok(zs
                .values()
                .filter(|s| in_score_range(**s, min, max))
                .count()),
            Some(_) => Err(StoreError::WrongType),
            None => Ok(0),
        }
    }

    /// Rank range in ascending order, with scores. Negative indices count
    /// from the highest rank.
    #[allow(clippy::type_complexity)]
    pub fn zrange_withscores(
        &mut self,
        key: &[u8],
        start: i64,
        stop: i64,
        now_ms: u64,
    ) -> Result<Vec<(Vec<u8>, f64)>, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::SortedSet(zs)) => {
                let sorted = sorted_members_asc(zs);
                let len = sorted.len() as i64;
                let s = normalize_index(start, len);
                let e = normalize_index(stop, len);
                if s > e || s >= sorted.len() {
                    return Ok(Vec::new());
                }
                let end = (e + 1).min(sorted.len());
                Ok(sorted[s..end]
                    .iter()
                    .map(|(score, m)| (m.clone(), *score))
                    .collect())
            }
            Some(_) => Err(StoreError::WrongType),
            None => Ok(Vec::new()),
        }
    }

    #[allow(clippy::type_complexity)]
    pub fn zrevrange_withscores(
        &mut self,
        key: &[u8],
        start: i64,
        stop: i64,
        now_ms: u64,
    ) -> Result<Vec<(Vec<u8>, f64)>, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::SortedSet(zs)) => {
                let mut sorted = sorted_members_asc(zs);
                sorted.reverse();
                let len = sorted.len() as i64;
                let s = normalize_index(start, len);
                let e = normalize_index(stop, len);
                if s > e || s >= sorted.len() {
                    return Ok(Vec::new());
                }
                let end = (e + 1).min(sorted.len());
                Ok(sorted[s..end]
                    .iter()
                    .map(|(score, m)| (m.clone(), *score))
                    .collect())
            }
            Some(_) => Err(StoreError::WrongType),
            None => Ok(Vec::new()),
        }
    }

    pub fn zrange(
        &mut self,
        key: &[u8],
        start: i64,
        stop: i64,
        now_ms: u64,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        Ok(self
            .zrange_withscores(key, start, stop, now_ms)?
            .into_iter()
            .map(|(m, _)| m)
            .collect())
    }

    pub fn zrevrange(
        &mut self,
        key: &[u8],
        start: i64,
        stop: i64,
        now_ms: u64,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        Ok(self
            .zrevrange_withscores(key, start, stop, now_ms)?
            .into_iter()
            .map(|(m, _)| m)
            .collect())
    }

    /// Members whose scores satisfy `[min, max]`, ascending, with scores.
    /// Offset/count trimming is applied by the caller.
    #[allow(clippy::type_complexity)]
    pub fn zrangebyscore_withscores(
        &mut self,
        key: &[u8],
        min: ScoreBound,
        max: ScoreBound,
        now_ms: u64,
    ) -> Result<Vec<(Vec<u8>, f64)>, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::SortedSet(zs)) => {
                let sorted = sorted_members_asc(zs);
                Ok(sorted
                    .into_iter()
                    .filter(|(s, _)| in_score_range(*s, min, max))
                    .map(|(s, m)| (m, s))
                    .collect())
            }
            Some(_) => Err(StoreError::WrongType),
            None => Ok(Vec::new()),
        }
    }

    #[allow(clippy::type_complexity)]
    pub fn zrevrangebyscore_withscores(
        &mut self,
        key: &[u8],
        min: ScoreBound,
        max: ScoreBound,
        now_ms: u64,
    ) -> Result<Vec<(Vec<u8>, f64)>, StoreError> {
        let mut pairs = self.zrangebyscore_withscores(key, min, max, now_ms)?;
        pairs.reverse();
        Ok(pairs)
    }

    pub fn zremrangebyrank(
        &mut self,
        key: &[u8],
        start: i64,
        stop: i64,
        now_ms: u64,
    ) -> Result<u64, StoreError> {
        let doomed: Vec<Vec<u8>> = self
            .zrange_withscores(key, start, stop, now_ms)?
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        let members: Vec<&[u8]> = doomed.iter().map(|m| m.as_slice()).collect();
        self.zrem(key, &members, now_ms)
    }

    pub fn zremrangebyscore(
        &mut self,
        key: &[u8],
        min: ScoreBound,
        max: ScoreBound,
        now_ms: u64,
    ) -> Result<u64, StoreError> {
        let doomed: Vec<Vec<u8>> = self
            .zrangebyscore_withscores(key, min, max, now_ms)?
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        let members: Vec<&[u8]> = doomed.iter().map(|m| m.as_slice()).collect();
        self.zrem(key, &members, now_ms)
    }

    /// Remove and return the member with the lowest (score, member).
    pub fn zpopmin(
        &mut self,
        key: &[u8],
        now_ms: u64,
    ) -> Result<Option<(Vec<u8>, f64)>, StoreError> {
        self.zpop(key, true, now_ms)
    }

    pub fn zpopmax(
        &mut self,
        key: &[u8],
        now_ms: u64,
    ) -> Result<Option<(Vec<u8>, f64)>, StoreError> {
        self.zpop(key, false, now_ms)
    }

    fn zpop(
        &mut self,
        key: &[u8],
        lowest: bool,
        now_ms: u64,
    ) -> Result<Option<(Vec<u8>, f64)>, StoreError> {
        self.drop_if_expired(key, now_ms);
        let (popped, emptied) = match self.entries.get_mut(key) {
            Some(Value::SortedSet(zs)) => {
                let target = if lowest {
                    zs.iter()
                        .min_by(|(m1, s1), (m2, s2)| cmp_score_member(**s1, m1, **s2, m2))
                } else {
                    zs.iter()
                        .max_by(|(m1, s1), (m2, s2)| cmp_score_member(**s1, m1, **s2, m2))
                }
                .map(|(m, s)| (m.clone(), *s));
                if let Some((member, _)) = &target {
                    zs.remove(member);
                }
                (target, zs.is_empty())
            }
            Some(_) => return Err(StoreError::WrongType),
            None => return Ok(None),
        };
        if emptied {
            self.remove_entry(key);
        }
        Ok(popped)
    }

    /// Helper: a key's member->score map, or empty when absent.
    fn get_zset_or_empty(
        &mut self,
        key: &[u8],
        now_ms: u64,
    ) -> Result<HashMap<Vec<u8>, f64>, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(Value::SortedSet(zs)) => Ok(zs.clone()),
            Some(_) => Err(StoreError::WrongType),
            None => Ok(HashMap::new()),
        }
    }

    /// Union of weighted sources into `destination`. A member's combined
    /// score aggregates over only the sources that contain it.
    pub fn zunionstore(
        &mut self,
        destination: &[u8],
        keys: &[&[u8]],
        weights: Option<&[f64]>,
        aggregate: Aggregate,
        now_ms: u64,
    ) -> Result<usize, StoreError> {
        let weights = resolve_weights(weights, keys.len())?;
        let mut combined: HashMap<Vec<u8>, f64> = HashMap::new();
        for (key, weight) in keys.iter().zip(&weights) {
            let source = self.get_zset_or_empty(key, now_ms)?;
            for (member, score) in source {
                let weighted = score * weight;
                combined
                    .entry(member)
                    .and_modify(|acc| *acc = aggregate.combine(*acc, weighted))
                    .or_insert(weighted);
            }
        }
        Ok(self.store_zset_result(destination, combined))
    }

    /// Intersection of weighted sources into `destination`: only members
    /// present in every source survive.
    pub fn zinterstore(
        &mut self,
        destination: &[u8],
        keys: &[&[u8]],
        weights: Option<&[f64]>,
        aggregate: Aggregate,
        now_ms: u64,
    ) -> Result<usize, StoreError> {
        let weights = resolve_weights(weights, keys.len())?;
        let sources: Vec<HashMap<Vec<u8>, f64>> = keys
            .iter()
            .map(|key| self.get_zset_or_empty(key, now_ms))
            .collect::<Result<_, _>>()?;
        let mut combined: HashMap<Vec<u8>, f64> = HashMap::new();
        if let Some((first, rest)) = sources.split_first() {
            'member: for (member, score) in first {
                let mut acc = score * weights[0];
                for (other, weight) in rest.iter().zip(&weights[1..]) {
                    match other.get(member) {
                        Some(s) => acc = aggregate.combine(acc, s * weight),
                        None => continue 'member,
                    }
                }
                combined.insert(member.clone(), acc);
            }
        }
        Ok(self.store_zset_result(destination, combined))
    }

    fn store_zset_result(&mut self, destination: &[u8], combined: HashMap<Vec<u8>, f64>) -> usize {
        self.remove_entry(destination);
        let count = combined.len();
        if count > 0 {
            self.entries
                .insert(destination.to_vec(), Value::SortedSet(combined));
        }
        count
    }
}

fn resolve_weights(weights: Option<&[f64]>, key_count: usize) -> Result<Vec<f64>, StoreError> {
    match weights {
        None => Ok(vec![1.0; key_count]),
        Some(w) if w.len() == key_count => Ok(w.to_vec()),
        Some(_) => Err(StoreError::WeightCountMismatch),
    }
}

fn parse_i64(bytes: &[u8]) -> Result<i64, StoreError> {
    let text = std::str::from_utf8(bytes).map_err(|_| StoreError::ValueNotInteger)?;
    text.parse::<i64>().map_err(|_| StoreError::ValueNotInteger)
}

fn parse_f64(bytes: &[u8]) -> Result<f64, StoreError> {
    let text = std::str::from_utf8(bytes).map_err(|_| StoreError::ValueNotFloat)?;
    text.parse::<f64>().map_err(|_| StoreError::ValueNotFloat)
}

/// Convert a Redis-style index (negative = from end) to a `usize`.
fn normalize_index(index: i64, len: i64) -> usize {
    if index < 0 {
        let adjusted = len.saturating_add(index);
        if adjusted < 0 { 0 } else { adjusted as usize }
    } else {
        index as usize
    }
}

/// Sorted sets order by score first, then member bytes for ties.
fn cmp_score_member(s1: f64, m1: &[u8], s2: f64, m2: &[u8]) -> std::cmp::Ordering {
    s1.total_cmp(&s2).then_with(|| m1.cmp(m2))
}

fn score_member_lt(s1: f64, m1: &[u8], s2: f64, m2: &[u8]) -> bool {
    cmp_score_member(s1, m1, s2, m2) == std::cmp::Ordering::Less
}

/// Return members as (score, member) pairs in ascending canonical order.
fn sorted_members_asc(zs: &HashMap<Vec<u8>, f64>) -> Vec<(f64, Vec<u8>)> {
    let mut pairs: Vec<(f64, Vec<u8>)> = zs.iter().map(|(m, &s)| (s, m.clone())).collect();
    pairs.sort_by(|(s1, m1), (s2, m2)| cmp_score_member(*s1, m1, *s2, m2));
    pairs
}

/// Redis-compatible glob pattern matching.
///
/// Supports `*` (any sequence), `?` (one byte), `[abc]` / `[^abc]` classes
/// with `a-z` ranges, and `\x` escapes. Malformed classes keep the Redis
/// contract: an unterminated class treats its final byte as the terminator.
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((b'*', rest)) => (0..=text.len()).any(|skip| glob_match(rest, &text[skip..])),
        Some((b'?', rest)) => !text.is_empty() && glob_match(rest, &text[1..]),
        Some((b'\\', rest)) if !rest.is_empty() => {
            text.first() == rest.first() && glob_match(&rest[1..], &text[1..])
        }
        Some((b'[', _)) => match text.split_first() {
            Some((&ch, text_rest)) => {
                let (matched, consumed) = class_match(pattern, ch);
                matched && glob_match(&pattern[consumed..], text_rest)
            }
            None => false,
        },
        Some((&ch, rest)) => text.first() == Some(&ch) && glob_match(rest, &text[1..]),
    }
}

/// Match the `[...]` class opening `pattern` against one byte. Returns the
/// match result and how many pattern bytes the class spans.
fn class_match(pattern: &[u8], ch: u8) -> (bool, usize) {
    let mut i = 1;
    let negate = pattern.get(i) == Some(&b'^');
    if negate {
        i += 1;
    }

    let mut matched = false;
    loop {
        if i + 1 < pattern.len() && pattern[i] == b'\\' {
            i += 1;
            if pattern[i] == ch {
                matched = true;
            }
            i += 1;
            continue;
        }

        if i >= pattern.len() {
            // Unterminated class: the final class byte doubles as the terminator.
            if i > 1 {
                i -= 1;
            }
            break;
        }

        if pattern[i] == b']' {
            break;
        }

        if i + 2 < pattern.len() && pattern[i + 1] == b'-' {
            let (lo, hi) = if pattern[i] <= pattern[i + 2] {
                (pattern[i], pattern[i + 2])
            } else {
                (pattern[i + 2], pattern[i])
            };
            if (lo..=hi).contains(&ch) {
                matched = true;
            }
            i += 3;
            continue;
        }

        if pattern[i] == ch {
            matched = true;
        }
        i += 1;
    }

    (if negate { !matched } else { matched }, (i + 1).min(pattern.len()))
}
