//! Bytecode representation and assembly (§3, §4.3).

pub mod builder;
pub mod constant;
mod jumpfold;
mod longjump;
pub mod instruction;
pub mod proto;
pub mod serialize;
mod validate;

pub use builder::{Builder, Module, ShapeTable};
pub use constant::{Constant, ConstantPool, ConstantTag, ImportPath, Shape, StringTable};
pub use instruction::{Instruction, Opcode};
pub use proto::{CaptureType, DebugLocal, DebugUpvalue, FunctionProto, LineInfo};
