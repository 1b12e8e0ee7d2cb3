//! Upvalues: open (aliasing a live frame's register) or closed (owning
//! their value) (§3 "Upvalue").

use super::header::{Header, ObjectKind};
use crate::value::Value;
use std::cell::Cell;
use std::ptr::NonNull;

/// Which state an upvalue is in. Open upvalues form a doubly-linked list
/// per thread (via `prev`/`next`) ordered by stack slot, so `close_upvalues`
/// can walk and close every upvalue at or above a given frame boundary in
/// one pass (§3, §7 "Propagation").
#[derive(Clone, Copy)]
pub enum UpvalueState {
    Open {
        stack_slot: NonNull<Value>,
        prev: Option<NonNull<Upvalue>>,
        next: Option<NonNull<Upvalue>>,
    },
    Closed(Value),
}

#[repr(C)]
pub struct Upvalue {
    pub header: Header,
    state: Cell<UpvalueState>,
}

impl Upvalue {
    pub fn new_open(stack_slot: NonNull<Value>, current_white: u8) -> Self {
        Self {
            header: Header::new(ObjectKind::Upvalue, current_white),
            state: Cell::new(UpvalueState::Open {
                stack_slot,
                prev: None,
                next: None,
            }),
        }
    }

    /// Build an upvalue that owns its value outright, never linked into a
    /// thread's open-upvalue list (§4.4 "by-value capture").
    pub fn new_closed(value: Value, current_white: u8) -> Self {
        Self {
            header: Header::new(ObjectKind::Upvalue, current_white),
            state: Cell::new(UpvalueState::Closed(value)),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state.get(), UpvalueState::Open { .. })
    }

    pub fn get(&self) -> Value {
        match self.state.get() {
            // SAFETY: while open, `stack_slot` points into a live thread
            // stack that outlives every open upvalue referencing it; the
            // owning frame is only popped after `close_upvalues` runs.
            UpvalueState::Open { stack_slot, .. } => unsafe { *stack_slot.as_ptr() },
            UpvalueState::Closed(v) => v,
        }
    }

    pub fn set(&self, value: Value) {
        match self.state.get() {
            UpvalueState::Open { stack_slot, .. } => unsafe { *stack_slot.as_ptr() = value },
            UpvalueState::Closed(_) => self.state.set(UpvalueState::Closed(value)),
        }
    }

    pub fn stack_slot(&self) -> Option<NonNull<Value>> {
        match self.state.get() {
            UpvalueState::Open { stack_slot, .. } => Some(stack_slot),
            UpvalueState::Closed(_) => None,
        }
    }

    pub fn siblings(&self) -> (Option<NonNull<Upvalue>>, Option<NonNull<Upvalue>>) {
        match self.state.get() {
            UpvalueState::Open { prev, next, .. } => (prev, next),
            UpvalueState::Closed(_) => (None, None),
        }
    }

    pub fn set_siblings(&self, prev: Option<NonNull<Upvalue>>, next: Option<NonNull<Upvalue>>) {
        if let UpvalueState::Open { stack_slot, .. } = self.state.get() {
            self.state.set(UpvalueState::Open {
                stack_slot,
                prev,
                next,
            });
        }
    }

    /// Copy the current stack value inline and transition to closed,
    /// returning the severed sibling links so the caller can splice them
    /// out of the thread's open-upvalue list (§3 "Transitioning from open
    /// to closed").
    pub fn close(&self) -> (Option<NonNull<Upvalue>>, Option<NonNull<Upvalue>>) {
        match self.state.get() {
            UpvalueState::Open {
                stack_slot,
                prev,
                next,
            } => {
                let value = unsafe { *stack_slot.as_ptr() };
                self.state.set(UpvalueState::Closed(value));
                (prev, next)
            }
            UpvalueState::Closed(_) => (None, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_copies_current_value_and_detaches() {
        let mut slot = Value::number(7.0);
        let ptr = NonNull::from(&mut slot);
        let up = Upvalue::new_open(ptr, 1);
        assert_eq!(up.get(), Value::number(7.0));
        up.close();
        assert!(!up.is_open());
        assert_eq!(up.get(), Value::number(7.0));
        slot = Value::number(99.0);
        let _ = slot;
        // Closed upvalues no longer alias the stack slot.
        assert_eq!(up.get(), Value::number(7.0));
    }
}
