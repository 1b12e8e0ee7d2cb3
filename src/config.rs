//! Tunable knobs collected into one value, the way the teacher groups
//! chargeable/consensus parameters into a single struct handed to the
//! `Interpreter` at construction time.

use crate::consts::*;

/// Construction-time configuration for a [`crate::vm::Vm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Initial capacity reserved in a new thread's value stack.
    pub initial_stack_capacity: usize,
    /// Maximum call-frame depth before a stack-overflow runtime error.
    pub max_call_depth: usize,
    /// GC pause percentage (see [`DEFAULT_GC_PAUSE_PERCENT`]).
    pub gc_pause_percent: u32,
    /// GC step multiplier percentage (see
    /// [`DEFAULT_GC_STEP_MULTIPLIER_PERCENT`]).
    pub gc_step_multiplier_percent: u32,
    /// How many back-edges (`for_*`, `jump_back`, `call`) elapse between
    /// polls of the host interrupt hook (§5 "Cancellation/timeouts").
    pub interrupt_poll_interval: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_stack_capacity: DEFAULT_STACK_CAPACITY,
            max_call_depth: MAX_CALL_DEPTH,
            gc_pause_percent: DEFAULT_GC_PAUSE_PERCENT,
            gc_step_multiplier_percent: DEFAULT_GC_STEP_MULTIPLIER_PERCENT,
            interrupt_poll_interval: 1,
        }
    }
}
