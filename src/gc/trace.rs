//! Per-kind child enumeration and object destruction, dispatched on
//! [`Header::kind`] via pointer casts (every heap object is `#[repr(C)]`
//! with `header` as its first field).

use super::HasHeader;
use crate::object::{Closure, ClosureKind, GalString, Header, ObjectKind, Table, Thread, UserData};
use crate::object::Upvalue;
use std::ptr::NonNull;

pub(super) fn mark_gray(ptr: NonNull<Header>, gray: &mut Vec<NonNull<Header>>) {
    // SAFETY: every caller only ever passes pointers still linked into the
    // heap's object list.
    let header = unsafe { ptr.as_ref() };
    if header.is_white() {
        header.mark_gray();
        gray.push(ptr);
    }
}

fn mark_value(value: crate::value::Value, gray: &mut Vec<NonNull<Header>>) {
    if let Some(ptr) = value.as_ptr() {
        mark_gray(ptr, gray);
    }
}

fn mark_opt_header(ptr: Option<NonNull<Header>>, gray: &mut Vec<NonNull<Header>>) {
    if let Some(p) = ptr {
        mark_gray(p, gray);
    }
}

pub(super) fn trace_children(ptr: NonNull<Header>, gray: &mut Vec<NonNull<Header>>) {
    // SAFETY: `kind` was set at allocation and never changes; the cast
    // below reinterprets the same live allocation as its concrete type.
    let kind = unsafe { ptr.as_ref() }.kind;
    match kind {
        ObjectKind::Str => {}
        ObjectKind::Table => trace_table(ptr.cast(), gray),
        ObjectKind::Closure => {
            let closure = unsafe { ptr.cast::<Closure>().as_ref() };
            mark_opt_header(closure.environment, gray);
            if let ClosureKind::Gal { upvalues, .. } = &closure.kind {
                for up in upvalues {
                    mark_gray(up.cast(), gray);
                }
            }
        }
        ObjectKind::Prototype => {}
        ObjectKind::Upvalue => {
            let up = unsafe { ptr.cast::<Upvalue>().as_ref() };
            if !up.is_open() {
                mark_value(up.get(), gray);
            }
        }
        ObjectKind::UserData => {
            let ud = unsafe { ptr.cast::<UserData>().as_ref() };
            mark_opt_header(ud.metatable, gray);
        }
        ObjectKind::Thread => {
            let thread = unsafe { ptr.cast::<Thread>().as_ref() };
            for &v in &thread.stack {
                mark_value(v, gray);
            }
            for frame in &thread.frames {
                mark_gray(frame.closure.cast(), gray);
            }
            let mut cursor = thread.open_upvalues;
            while let Some(up) = cursor {
                mark_gray(up.cast(), gray);
                cursor = unsafe { up.as_ref() }.siblings().1;
            }
        }
    }
}

pub(super) fn trace_table(ptr: NonNull<Table>, gray: &mut Vec<NonNull<Header>>) {
    let table = unsafe { ptr.as_ref() };
    mark_opt_header(table.metatable, gray);
    for (k, v) in table.iter() {
        mark_value(k, gray);
        mark_value(v, gray);
    }
}

/// Reclaim a confirmed-dead object, running its destructor via `Box`'s own
/// drop glue for its concrete type.
///
/// # Safety
/// `ptr` must not be reachable from any root or live reference; the
/// collector only calls this once the sweep phase has confirmed the
/// object's mark is the cycle's "other white".
pub(super) unsafe fn free(ptr: NonNull<Header>) {
    let kind = ptr.as_ref().kind;
    match kind {
        ObjectKind::Str => drop(Box::from_raw(ptr.cast::<GalString>().as_ptr())),
        ObjectKind::Table => drop(Box::from_raw(ptr.cast::<Table>().as_ptr())),
        ObjectKind::Closure => drop(Box::from_raw(ptr.cast::<Closure>().as_ptr())),
        ObjectKind::Prototype => {}
        ObjectKind::Upvalue => drop(Box::from_raw(ptr.cast::<Upvalue>().as_ptr())),
        ObjectKind::UserData => {
            let mut boxed = Box::from_raw(ptr.cast::<UserData>().as_ptr());
            boxed.run_destructor();
            drop(boxed);
        }
        ObjectKind::Thread => drop(Box::from_raw(ptr.cast::<Thread>().as_ptr())),
    }
}

// Ensures every allocated kind actually implements `HasHeader`, keeping
// `Heap::finish_alloc`'s bound meaningful.
#[allow(dead_code)]
fn _assert_has_header<T: HasHeader>() {}
