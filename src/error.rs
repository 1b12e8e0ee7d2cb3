//! Error types for every fallible subsystem.
//!
//! Mirrors the shape of the teacher's `error.rs`: one `thiserror` enum per
//! subsystem, each variant carrying the structured data needed to render a
//! useful diagnostic rather than a pre-formatted string.

use crate::source::SourceSpan;
use thiserror::Error;

/// Errors raised while a [`crate::bytecode::Builder`] finalizes a function
/// (§4.3.1, §7 "Compile errors"). Fatal to the current compile unit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// The function's constant pool is full (invariant 5, §3).
    #[error("too many constants in function (limit {limit})")]
    TooManyConstants {
        /// The configured limit that was exceeded.
        limit: usize,
    },
    /// The function declares more locals than fit in the register file.
    #[error("too many locals in function (limit {limit})")]
    TooManyLocals {
        /// The configured limit that was exceeded.
        limit: usize,
    },
    /// The function captures more upvalues than the format allows.
    #[error("too many upvalues in function (limit {limit})")]
    TooManyUpvalues {
        /// The configured limit that was exceeded.
        limit: usize,
    },
    /// A function declares more child closures than the format allows
    /// (invariant 5, §3).
    #[error("too many child functions (limit {limit})")]
    TooManyChildFunctions {
        /// The configured limit that was exceeded.
        limit: usize,
    },
    /// A jump's distance does not fit even after long-jump expansion.
    #[error("jump out of range: offset {offset} exceeds the long-jump limit")]
    JumpOutOfRange {
        /// The offset, in instruction words, that could not be encoded.
        offset: i64,
    },
    /// A declaration could not be lowered to bytecode (e.g. assignment to
    /// a non-assignable expression).
    #[error("malformed declaration: {message}")]
    MalformedDeclaration {
        /// Human-readable description of the malformed construct.
        message: String,
        /// Location of the offending construct.
        span: SourceSpan,
    },
    /// Validation (§4.3.1) found an instruction referencing a register,
    /// constant, or upvalue index out of bounds for the function.
    #[error("bytecode validation failed: {message}")]
    ValidationFailed {
        /// Human-readable description of the failed check.
        message: String,
    },
}

/// Errors raised by the VM dispatcher while executing bytecode (§7 "Runtime
/// errors").
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    /// An operator had no applicable metamethod for its operand types.
    #[error("attempt to perform arithmetic on a {type_name} value")]
    TypeMismatch {
        /// The Rust-level name of the offending value's type tag.
        type_name: &'static str,
    },
    /// A `call`/`named_call` target was not callable and had no `__call`
    /// metamethod.
    #[error("attempt to call a {type_name} value")]
    NotCallable {
        /// The Rust-level name of the offending value's type tag.
        type_name: &'static str,
    },
    /// Call-frame depth exceeded [`crate::consts::MAX_CALL_DEPTH`] (or the
    /// configured override).
    #[error("stack overflow: call depth exceeded {limit}")]
    StackOverflow {
        /// The configured call-depth limit that was exceeded.
        limit: usize,
    },
    /// Integer division or modulo by zero.
    #[error("attempt to perform 'n {op}' with zero divisor")]
    DivideByZero {
        /// The arithmetic opcode mnemonic (`div`, `mod`, `idiv`, ...).
        op: &'static str,
    },
    /// A table index operation was performed on a `null` table.
    #[error("attempt to index a null value")]
    IndexNullValue,
    /// Metamethod chain resolution exceeded
    /// [`crate::consts::MAX_METATABLE_CHAIN_DEPTH`].
    #[error("'__index' chain too long; possible loop")]
    MetatableChainTooDeep,
    /// The host-level `error()`/`throw` primitive was invoked explicitly
    /// by script code.
    #[error("script error: {0}")]
    UserThrown(crate::value::Value),
    /// Bytecode referenced a register, constant, or upvalue slot outside
    /// the bounds established at compile time; indicates a corrupt or
    /// hand-crafted module.
    #[error("malformed bytecode: {message}")]
    MalformedBytecode {
        /// Human-readable description of the malformed access.
        message: String,
    },
}

/// Errors raised while deserializing a bytecode module (§6 "Load module").
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    /// The module's version byte is not one this build understands.
    #[error("unsupported bytecode version {version} at offset {offset}")]
    UnsupportedVersion {
        /// The unrecognized version byte.
        version: u8,
        /// Byte offset of the version field.
        offset: usize,
    },
    /// The byte stream ended before a value of the expected shape could be
    /// read.
    #[error("unexpected end of bytecode stream at offset {offset}")]
    UnexpectedEof {
        /// Byte offset at which decoding ran out of input.
        offset: usize,
    },
    /// A tag byte (constant kind, capture type, ...) did not match any
    /// known variant.
    #[error("invalid tag {tag} at offset {offset}")]
    InvalidTag {
        /// The unrecognized tag byte.
        tag: u8,
        /// Byte offset of the tag field.
        offset: usize,
    },
    /// A var-int-encoded length or index exceeded an implementation limit.
    #[error("value out of range at offset {offset}")]
    OutOfRange {
        /// Byte offset of the offending field.
        offset: usize,
    },
}

/// Convenience alias matching the teacher's `SimpleResult<T>` pattern used
/// throughout `interpreter/*`.
pub type CompileResult<T> = Result<T, CompileError>;
/// Convenience alias for fallible VM operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
/// Convenience alias for fallible bytecode decoding.
pub type DecodeResult<T> = Result<T, DecodeError>;
