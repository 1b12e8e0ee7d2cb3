//! Crate-wide limits and tunables.
//!
//! Named the way the teacher's `consts.rs` names VM parameters, so limits
//! never appear as magic numbers at their use site.

/// Number of general-purpose registers addressable by a single frame.
pub const VM_REGISTER_COUNT: usize = 256;

/// Maximum number of distinct constants a single function's constant pool
/// may hold (invariant 5, §3).
pub const MAX_CONSTANTS_PER_FUNCTION: usize = 1 << 23;

/// Maximum number of child-function (closure) references a function may
/// carry (invariant 5, §3).
pub const MAX_CHILD_FUNCTIONS: usize = 1 << 15;

/// Maximum number of upvalues a single closure may capture.
pub const MAX_UPVALUES: usize = 255;

/// Maximum number of locals live at once within a single function.
pub const MAX_LOCALS: usize = VM_REGISTER_COUNT;

/// Largest signed offset representable in a `D`-field jump before
/// long-jump expansion is required (§4.3.3).
pub const MAX_JUMP_D_OFFSET: i32 = i16::MAX as i32;

/// Conservative threshold used while deciding whether a function requires
/// long-jump expansion: a jump distance below this is guaranteed to still
/// fit after every other jump in the function has been expanded once
/// (§4.3.3 "the conservative threshold (32767/3)").
pub const CONSERVATIVE_JUMP_LIMIT: i32 = i16::MAX as i32 / 3;

/// Largest signed offset representable in the 24-bit `E`-field / long-jump
/// trampoline (§3 Bytecode instruction, `E` encoding).
pub const MAX_JUMP_E_OFFSET: i32 = (1 << 23) - 1;

/// Maximum call-frame depth before the VM raises a stack-overflow runtime
/// error (§7).
pub const MAX_CALL_DEPTH: usize = 200;

/// Maximum pointer-chase depth for `__index`/`__newindex` metamethod chains
/// before the VM gives up (§4.5 "a loop-guard trips after a fixed depth").
pub const MAX_METATABLE_CHAIN_DEPTH: usize = 100;

/// Bit width of a register field in the `ABC` instruction encoding.
pub const REGISTER_FIELD_BITS: u32 = 8;

/// Default initial capacity of a thread's value stack.
pub const DEFAULT_STACK_CAPACITY: usize = 256;

/// Default GC pause: percentage of live-set growth the allocator is
/// allowed to accrue before a new collection cycle starts (Lua-style
/// collector knob, named per §4.6 / SPEC_FULL "Configuration").
pub const DEFAULT_GC_PAUSE_PERCENT: u32 = 200;

/// Default GC step multiplier: how much work the incremental collector
/// performs per allocation-triggered step, relative to bytes allocated.
pub const DEFAULT_GC_STEP_MULTIPLIER_PERCENT: u32 = 200;
