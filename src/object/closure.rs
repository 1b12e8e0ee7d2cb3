//! Closures: host-backed ("internal") or script-backed ("gal") callables
//! (§3 "Closure").

use super::header::{Header, ObjectKind};
use super::upvalue::Upvalue;
use crate::bytecode::FunctionProto;
use crate::error::RuntimeResult;
use crate::value::Value;
use std::ptr::NonNull;
use std::rc::Rc;

/// A module's functions and pre-interned strings, kept alive for as long as
/// any closure built from it is reachable. Every `Gal` closure from the same
/// `load` call shares one of these, so a `new_closure` site can build a
/// sibling closure just by indexing `protos` (§4.3 "children: indices into
/// the module's function table").
pub struct LoadedModule {
    pub protos: Vec<Rc<FunctionProto>>,
    /// Heap string for every entry in the module's string table, in order,
    /// each pinned with `Header::set_fixed` at load time (§6 "Load
    /// module").
    pub strings: Vec<Value>,
}

/// A host function wrapped into a closure. Implemented by the embedder for
/// every registered host callable (§6 "Register host function").
pub trait HostFunction {
    fn call(&self, args: &[Value]) -> RuntimeResult<Vec<Value>>;
}

impl<F> HostFunction for F
where
    F: Fn(&[Value]) -> RuntimeResult<Vec<Value>>,
{
    fn call(&self, args: &[Value]) -> RuntimeResult<Vec<Value>> {
        self(args)
    }
}

/// The two closure shapes (§3).
pub enum ClosureKind {
    /// A host function pointer plus its captured upvalues. The optional
    /// continuation is re-entered with the pending call's original
    /// arguments once a host-side async operation it started completes
    /// (§6 "Register host function").
    Internal {
        func: Rc<dyn HostFunction>,
        continuation: Option<Rc<dyn HostFunction>>,
    },
    /// A script function: its owning module, its index into that module's
    /// function table, and its captured upvalue slots.
    Gal {
        module: Rc<LoadedModule>,
        proto_id: u32,
        upvalues: Vec<NonNull<Upvalue>>,
    },
}

/// A closure object (§3 "Closure"). `stack_size`/`preload` mirror the gal
/// variant's prototype; `environment` is the table new globals resolve
/// against when this closure is the active frame (defaults to the main
/// state's global table).
#[repr(C)]
pub struct Closure {
    pub header: Header,
    pub kind: ClosureKind,
    pub stack_size: u8,
    pub preload: bool,
    pub environment: Option<NonNull<Header>>,
}

impl Closure {
    pub fn new_gal(module: Rc<LoadedModule>, proto_id: u32, upvalues: Vec<NonNull<Upvalue>>, current_white: u8) -> Self {
        let stack_size = module.protos[proto_id as usize].max_stack_size;
        Self {
            header: Header::new(ObjectKind::Closure, current_white),
            kind: ClosureKind::Gal {
                module,
                proto_id,
                upvalues,
            },
            stack_size,
            preload: false,
            environment: None,
        }
    }

    pub fn new_internal(func: Rc<dyn HostFunction>, current_white: u8) -> Self {
        Self {
            header: Header::new(ObjectKind::Closure, current_white),
            kind: ClosureKind::Internal {
                func,
                continuation: None,
            },
            stack_size: 0,
            preload: false,
            environment: None,
        }
    }

    pub fn num_upvalues(&self) -> usize {
        match &self.kind {
            ClosureKind::Internal { .. } => 0,
            ClosureKind::Gal { upvalues, .. } => upvalues.len(),
        }
    }

    pub fn proto(&self) -> Option<&Rc<FunctionProto>> {
        match &self.kind {
            ClosureKind::Gal { module, proto_id, .. } => Some(&module.protos[*proto_id as usize]),
            ClosureKind::Internal { .. } => None,
        }
    }
}
