//! Hash table object with metamethod-absence caching (§3 "Table", §4.7).

use super::header::{Header, ObjectKind};
use super::string::GalString;
use crate::value::Value;
use bitflags::bitflags;
use std::collections::HashMap;
use std::ptr::NonNull;

bitflags! {
    /// One bit per metamethod event; a set bit means "this table's
    /// metatable chain was already checked and has no handler for this
    /// event", letting future lookups short-circuit (§4.7
    /// `get_tagged_method`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AbsenceFlags: u32 {
        const INDEX     = 1 << 0;
        const NEWINDEX  = 1 << 1;
        const ADD       = 1 << 2;
        const SUB       = 1 << 3;
        const MUL       = 1 << 4;
        const DIV       = 1 << 5;
        const MOD       = 1 << 6;
        const POW       = 1 << 7;
        const UNM       = 1 << 8;
        const CONCAT    = 1 << 9;
        const LEN       = 1 << 10;
        const EQ        = 1 << 11;
        const LT        = 1 << 12;
        const LE        = 1 << 13;
        const CALL      = 1 << 14;
        const MODE      = 1 << 15;
        const GC        = 1 << 16;
    }
}

/// Fixed-string metamethod event names, in the same order as
/// [`AbsenceFlags`]'s bits (§6 "Metamethods").
pub const METAMETHOD_NAMES: &[(&str, AbsenceFlags)] = &[
    ("__index", AbsenceFlags::INDEX),
    ("__newindex", AbsenceFlags::NEWINDEX),
    ("__add", AbsenceFlags::ADD),
    ("__sub", AbsenceFlags::SUB),
    ("__mul", AbsenceFlags::MUL),
    ("__div", AbsenceFlags::DIV),
    ("__mod", AbsenceFlags::MOD),
    ("__pow", AbsenceFlags::POW),
    ("__unm", AbsenceFlags::UNM),
    ("__concat", AbsenceFlags::CONCAT),
    ("__len", AbsenceFlags::LEN),
    ("__eq", AbsenceFlags::EQ),
    ("__lt", AbsenceFlags::LT),
    ("__le", AbsenceFlags::LE),
    ("__call", AbsenceFlags::CALL),
    ("__mode", AbsenceFlags::MODE),
    ("__gc", AbsenceFlags::GC),
];

/// Dereference `v` as a string object, if it is one. Strings are the one
/// heap kind a table key compares and hashes by content rather than by
/// pointer identity, so two separately-allocated strings with the same
/// bytes (e.g. a host-registered name versus the same name baked into a
/// script's own constant pool) land in the same slot.
fn as_gal_string(v: Value) -> Option<&'static GalString> {
    if v.object_kind() != Some(ObjectKind::Str) {
        return None;
    }
    // SAFETY: a `Value` of kind `Str` still reachable as a table key is
    // backed by a live `GalString`; the GC never frees an object while a
    // table it is keyed/valued under is itself reachable (§4.6).
    v.as_ptr().map(|p| unsafe { p.cast::<GalString>().as_ref() })
}

/// Hashable/comparable key wrapper around [`Value`]: numbers compare by
/// IEEE value (with `-0.0` normalized to `0.0`, and `NaN` rejected by
/// `Table::set` rather than admitted as a key); strings compare by
/// content; every other object kind falls back to pointer identity.
#[derive(Clone, Copy)]
struct Key(Value);

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        match (as_gal_string(self.0), as_gal_string(other.0)) {
            (Some(a), Some(b)) => a.as_bytes() == b.as_bytes(),
            (None, None) => self.0 == other.0,
            _ => false,
        }
    }
}
impl Eq for Key {}

impl std::hash::Hash for Key {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        if let Some(n) = self.0.as_number() {
            let bits = if n == 0.0 { 0.0f64.to_bits() } else { n.to_bits() };
            bits.hash(state);
        } else if let Some(s) = as_gal_string(self.0) {
            s.as_bytes().hash(state);
        } else {
            self.0.raw_bits().hash(state);
        }
    }
}

/// Hybrid hash container mapping [`Value`] to [`Value`] (§3, §4.7). The
/// array-part optimization described in §3 is not required by §4.7 ("either
/// is acceptable"); this implementation keeps every pair in one hash.
#[derive(Debug)]
#[repr(C)]
pub struct Table {
    pub header: Header,
    entries: HashMap<Key, Value>,
    pub metatable: Option<NonNull<Header>>,
    flags: AbsenceFlags,
}

impl Table {
    pub fn new(current_white: u8) -> Self {
        Self {
            header: Header::new(ObjectKind::Table, current_white),
            entries: HashMap::new(),
            metatable: None,
            flags: AbsenceFlags::empty(),
        }
    }

    /// Raw lookup; never consults the metatable (§4.7 `find`).
    pub fn find(&self, key: Value) -> Value {
        self.entries.get(&Key(key)).copied().unwrap_or(Value::NULL)
    }

    /// Raw insert/update/remove (storing `null` removes the key).
    /// Mutating the table clears every cached-absence bit, since an
    /// assignment to `__index`/`__newindex`/etc. on the metatable cannot
    /// be observed without going through `set` on the metatable itself,
    /// but a direct mutation of *this* table's own entries (e.g.
    /// reassigning its own `__index` field when used as someone else's
    /// metatable) must invalidate the cache conservatively.
    pub fn set(&mut self, key: Value, value: Value) {
        if value.is_null() {
            self.entries.remove(&Key(key));
        } else {
            self.entries.insert(Key(key), value);
        }
        self.flags = AbsenceFlags::empty();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries.iter().map(|(k, v)| (k.0, *v))
    }

    /// The key/value pair that follows `key` in this table's iteration
    /// order, or the first pair when `key` is null; `None` once iteration is
    /// exhausted (§4.4 "for ... in", the `next`-style stepping the compiler's
    /// recognized `pairs`/`ipairs` fast path lowers to). Like Lua's own
    /// `next`, behavior is unspecified if the table is mutated between
    /// calls; unlike an array-backed table, the order is whatever this
    /// table's hash happens to iterate in, not insertion or numeric order.
    pub fn next(&self, key: Value) -> Option<(Value, Value)> {
        if key.is_null() {
            return self.entries.iter().next().map(|(k, v)| (k.0, *v));
        }
        let target = Key(key);
        let mut seen_target = false;
        for (k, v) in self.entries.iter() {
            if seen_target {
                return Some((k.0, *v));
            }
            if *k == target {
                seen_target = true;
            }
        }
        None
    }

    pub fn has_cached_absence(&self, event: AbsenceFlags) -> bool {
        self.flags.contains(event)
    }

    pub fn cache_absence(&mut self, event: AbsenceFlags) {
        self.flags.insert(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_null_removes_key() {
        let mut t = Table::new(1);
        t.set(Value::number(1.0), Value::number(10.0));
        assert_eq!(t.find(Value::number(1.0)), Value::number(10.0));
        t.set(Value::number(1.0), Value::NULL);
        assert_eq!(t.find(Value::number(1.0)), Value::NULL);
        assert!(t.is_empty());
    }

    #[test]
    fn negative_and_positive_zero_share_a_slot() {
        let mut t = Table::new(1);
        t.set(Value::number(0.0), Value::number(1.0));
        assert_eq!(t.find(Value::number(-0.0)), Value::number(1.0));
    }

    #[test]
    fn absence_cache_round_trips() {
        let mut t = Table::new(1);
        assert!(!t.has_cached_absence(AbsenceFlags::INDEX));
        t.cache_absence(AbsenceFlags::INDEX);
        assert!(t.has_cached_absence(AbsenceFlags::INDEX));
        t.set(Value::number(1.0), Value::number(2.0));
        assert!(!t.has_cached_absence(AbsenceFlags::INDEX));
    }

    fn leak_string(bytes: &[u8]) -> Value {
        let obj = Box::new(GalString::new(bytes.to_vec(), 1));
        let ptr = NonNull::from(Box::leak(obj));
        Value::from_ptr(ptr.cast())
    }

    #[test]
    fn two_separately_allocated_strings_with_equal_bytes_share_a_slot() {
        let mut t = Table::new(1);
        let key_a = leak_string(b"double");
        let key_b = leak_string(b"double");
        assert_ne!(key_a.raw_bits(), key_b.raw_bits(), "test setup must use distinct allocations");
        t.set(key_a, Value::number(1.0));
        assert_eq!(t.find(key_b), Value::number(1.0));
    }

    #[test]
    fn strings_with_different_bytes_never_collide() {
        let mut t = Table::new(1);
        t.set(leak_string(b"foo"), Value::number(1.0));
        assert_eq!(t.find(leak_string(b"bar")), Value::NULL);
    }

    #[test]
    fn next_with_a_null_key_returns_some_entry_and_then_eventually_exhausts() {
        let mut t = Table::new(1);
        t.set(Value::number(1.0), Value::number(10.0));
        t.set(Value::number(2.0), Value::number(20.0));
        t.set(Value::number(3.0), Value::number(30.0));

        let mut seen = std::collections::HashSet::new();
        let mut key = Value::NULL;
        loop {
            match t.next(key) {
                Some((k, v)) => {
                    assert!(seen.insert(k.raw_bits()), "next must not repeat a key");
                    assert_eq!(t.find(k), v);
                    key = k;
                }
                None => break,
            }
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn next_on_an_empty_table_is_immediately_exhausted() {
        let t = Table::new(1);
        assert_eq!(t.next(Value::NULL), None);
    }

    #[test]
    fn next_with_an_absent_key_is_exhausted() {
        let mut t = Table::new(1);
        t.set(Value::number(1.0), Value::number(10.0));
        assert_eq!(t.next(Value::number(99.0)), None);
    }
}
