//! Constant pool entries (§3 "Constant pool entry") and the de-duplicating
//! pool that owns them.

use crate::consts::MAX_CONSTANTS_PER_FUNCTION;
use std::collections::HashMap;
use std::rc::Rc;

/// A packed import path: a chain of string-table indices (§3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImportPath {
    pub segments: Vec<u32>,
}

/// A cached table shape: an ordered list of key indices used to
/// accelerate `new_table`/`copy_table` for literals with repeated
/// structure (§4.4, glossary "Shape").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    pub keys: Vec<u32>,
}

/// One constant-pool entry (§3).
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Null,
    Bool(bool),
    Number(u64), // bit pattern of an f64; see `Constant::number`/`as_number`.
    Str(u32),
    Import(ImportPath),
    Table(u32), // index into the shape table
    Closure(u32),
}

impl Constant {
    pub fn number(value: f64) -> Self {
        Self::Number(value.to_bits())
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(bits) => Some(f64::from_bits(*bits)),
            _ => None,
        }
    }
}

/// Tag byte written before each constant's payload during serialization
/// (§4.3.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConstantTag {
    Null = 0,
    Bool = 1,
    Number = 2,
    Str = 3,
    Import = 4,
    Table = 5,
    Closure = 6,
}

impl Constant {
    pub fn tag(&self) -> ConstantTag {
        match self {
            Self::Null => ConstantTag::Null,
            Self::Bool(_) => ConstantTag::Bool,
            Self::Number(_) => ConstantTag::Number,
            Self::Str(_) => ConstantTag::Str,
            Self::Import(_) => ConstantTag::Import,
            Self::Table(_) => ConstantTag::Table,
            Self::Closure(_) => ConstantTag::Closure,
        }
    }
}

/// A function's constant pool: de-duplicating inserts, returning a stable
/// index per distinct value (§4.3 "`add_constant_*`: de-duplicating
/// inserts ... returns a signed index, or a sentinel if the pool is
/// full").
#[derive(Debug, Default)]
pub struct ConstantPool {
    entries: Vec<Constant>,
    index: HashMap<ConstantKey, u32>,
}

/// Hashable key used for de-duplication; `f64` is keyed by bit pattern so
/// equal constants (including `-0.0`/`0.0` distinctly) share one slot
/// deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstantKey {
    Null,
    Bool(bool),
    Number(u64),
    Str(u32),
    Import(Vec<u32>),
    Table(u32),
    Closure(u32),
}

fn key_of(c: &Constant) -> ConstantKey {
    match c {
        Constant::Null => ConstantKey::Null,
        Constant::Bool(b) => ConstantKey::Bool(*b),
        Constant::Number(bits) => ConstantKey::Number(*bits),
        Constant::Str(i) => ConstantKey::Str(*i),
        Constant::Import(p) => ConstantKey::Import(p.segments.clone()),
        Constant::Table(i) => ConstantKey::Table(*i),
        Constant::Closure(i) => ConstantKey::Closure(*i),
    }
}

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value`, returning its index, or `None` if the pool is
    /// already at [`MAX_CONSTANTS_PER_FUNCTION`] and `value` is not
    /// already present (§3 invariant 5).
    pub fn insert(&mut self, value: Constant) -> Option<u32> {
        let key = key_of(&value);
        if let Some(&idx) = self.index.get(&key) {
            return Some(idx);
        }
        if self.entries.len() >= MAX_CONSTANTS_PER_FUNCTION {
            return None;
        }
        let idx = self.entries.len() as u32;
        self.entries.push(value);
        self.index.insert(key, idx);
        if self.entries.len() * 10 >= MAX_CONSTANTS_PER_FUNCTION * 9 {
            tracing::warn!(
                count = self.entries.len(),
                limit = MAX_CONSTANTS_PER_FUNCTION,
                "constant pool nearing its per-function limit"
            );
        }
        Some(idx)
    }

    pub fn get(&self, idx: u32) -> Option<&Constant> {
        self.entries.get(idx as usize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Constant> {
        self.entries.iter()
    }
}

/// De-duplicating string table shared by a whole module (§3, §4.3).
#[derive(Debug, Default)]
pub struct StringTable {
    entries: Vec<Rc<str>>,
    index: HashMap<Rc<str>, u32>,
}

impl StringTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(&idx) = self.index.get(s) {
            return idx;
        }
        let rc: Rc<str> = Rc::from(s);
        let idx = self.entries.len() as u32;
        self.entries.push(Rc::clone(&rc));
        self.index.insert(rc, idx);
        idx
    }

    pub fn get(&self, idx: u32) -> Option<&str> {
        self.entries.get(idx as usize).map(|s| &**s)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|s| &**s)
    }
}
