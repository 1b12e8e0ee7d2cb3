//! Metamethod resolution (§4.5 "Metatables and metamethods", §4.7
//! `get_tagged_method`), built on the absence-cache machinery already on
//! [`Table`].

use crate::error::{RuntimeError, RuntimeResult};
use crate::object::{AbsenceFlags, ObjectKind, Table, UserData, METAMETHOD_NAMES};
use crate::value::Value;
use std::ptr::NonNull;

use super::Vm;

/// The metatable behind a value, if it has one. Only tables and user-data
/// carry metatables (§3 "Table", "User-data").
pub(super) fn metatable_of(value: Value) -> Option<NonNull<Table>> {
    match value.object_kind()? {
        ObjectKind::Table => {
            let t = value.as_ptr().unwrap().cast::<Table>();
            unsafe { t.as_ref() }.metatable.map(|h| h.cast::<Table>())
        }
        ObjectKind::UserData => {
            let u = value.as_ptr().unwrap().cast::<UserData>();
            unsafe { u.as_ref() }.metatable.map(|h| h.cast::<Table>())
        }
        _ => None,
    }
}

/// Look up `event`'s handler on `value`'s metatable, caching a miss on the
/// metatable so repeated lookups short-circuit (§4.7).
pub(super) fn get_tagged_method(vm: &Vm, value: Value, event: AbsenceFlags) -> Option<Value> {
    let mt_ptr = metatable_of(value)?;
    // SAFETY: tables are never aliased mutably elsewhere while the
    // dispatcher runs single-threaded; this mirrors the same pattern used
    // by the collector's own weak-table sweep.
    let mt = unsafe { &mut *mt_ptr.as_ptr() };
    if mt.has_cached_absence(event) {
        return None;
    }
    let idx = METAMETHOD_NAMES.iter().position(|&(_, f)| f == event)?;
    let key = vm.metamethod_name(idx);
    let handler = mt.find(key);
    if handler.is_null() {
        mt.cache_absence(event);
        None
    } else {
        Some(handler)
    }
}

pub(super) fn type_error(lhs: Value, rhs: Value) -> RuntimeError {
    let type_name = if lhs.is_number() { rhs.type_name() } else { lhs.type_name() };
    RuntimeError::TypeMismatch { type_name }
}

/// First result of calling `handler` with `args`, or `null` if it returned
/// nothing (most metamethods only use the first result, §4.5).
pub(super) fn first_result(results: Vec<Value>) -> Value {
    results.into_iter().next().unwrap_or(Value::NULL)
}

pub(super) fn unary_event_name(event: AbsenceFlags) -> &'static str {
    METAMETHOD_NAMES
        .iter()
        .find(|&&(_, f)| f == event)
        .map(|&(name, _)| name)
        .unwrap_or("?")
}

/// The Rust-level type-mismatch error raised when neither operand has the
/// `event` metamethod.
pub(super) fn missing_metamethod(value: Value, _event: AbsenceFlags) -> RuntimeResult<Value> {
    Err(RuntimeError::TypeMismatch {
        type_name: value.type_name(),
    })
}
