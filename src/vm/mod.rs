//! The register-based dispatcher and the embedding surface built on top of
//! it (§5, §6).

mod dispatch;
mod metamethod;

use crate::bytecode::serialize::read_module;
use crate::config::Config;
use crate::consts::VM_REGISTER_COUNT;
use crate::error::{DecodeResult, RuntimeError, RuntimeResult};
use crate::gc::Heap;
use crate::object::{Closure, GalString, HostFunction, LoadedModule, Table, Thread, ThreadStatus};
use crate::value::Value;
use std::cell::Cell;
use std::ptr::NonNull;
use std::rc::Rc;

/// Host-side cancellation/timeout hook, polled every
/// [`Config::interrupt_poll_interval`] back-edges (§5 "Cancellation").
pub trait InterruptHook {
    /// Return `true` to abort the running call with a runtime error.
    fn should_interrupt(&self) -> bool;
}

/// Owns the heap, the global table, and the main thread; the embedder's
/// single entry point into loaded scripts (§5, §6).
pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) globals: NonNull<Table>,
    pub(crate) config: Config,
    /// Pre-interned, fixed strings for every metamethod event name, in
    /// [`crate::object::METAMETHOD_NAMES`] order (§4.7).
    pub(crate) metamethod_strings: Vec<Value>,
    main_thread: NonNull<Thread>,
    interrupt: Option<Box<dyn InterruptHook>>,
    back_edges_since_poll: Cell<u32>,
}

impl Vm {
    pub fn new(config: Config) -> Self {
        let heap = Heap::new(&config);

        let globals = heap.alloc_table();
        unsafe { globals.as_ref() }.header.set_fixed();

        let metamethod_strings = crate::object::METAMETHOD_NAMES
            .iter()
            .map(|&(name, _)| {
                let ptr = heap.alloc_string(name.as_bytes().to_vec());
                unsafe { ptr.as_ref() }.header.set_fixed();
                Value::from_ptr(ptr.cast())
            })
            .collect();

        let stack_capacity = config.max_call_depth * VM_REGISTER_COUNT;
        let main_thread = heap.alloc_thread(Thread::new(stack_capacity, heap.current_white()));
        unsafe { main_thread.as_ref() }.header.set_fixed();

        Self {
            heap,
            globals,
            config,
            metamethod_strings,
            main_thread,
            interrupt: None,
            back_edges_since_poll: Cell::new(0),
        }
    }

    /// The global table every loaded chunk's environment resolves against
    /// by default (§3 "environment").
    pub fn globals(&self) -> NonNull<Table> {
        self.globals
    }

    pub fn set_interrupt_hook(&mut self, hook: impl InterruptHook + 'static) {
        self.interrupt = Some(Box::new(hook));
    }

    pub(crate) fn metamethod_name(&self, idx: usize) -> Value {
        self.metamethod_strings[idx]
    }

    /// Heap-allocate and intern a script string (§6 "Embedding surface").
    pub fn new_string(&self, s: impl AsRef<[u8]>) -> Value {
        let ptr = self.heap.alloc_string(s.as_ref().to_vec());
        Value::from_ptr(ptr.cast())
    }

    pub fn new_table(&self) -> Value {
        let ptr = self.heap.alloc_table();
        Value::from_ptr(ptr.cast())
    }

    /// Load a serialized module (§6 "Load module"), returning its main
    /// function as a callable closure. The closure and the module's string
    /// cache are pinned for the `Vm`'s lifetime; there is no unload API
    /// (§9, DESIGN.md "Loaded modules are permanent roots").
    pub fn load(&mut self, bytes: &[u8]) -> DecodeResult<NonNull<Closure>> {
        let module = read_module(bytes)?;

        let strings = module
            .strings
            .iter()
            .map(|s| {
                let ptr = self.heap.alloc_string(s.as_bytes().to_vec());
                unsafe { ptr.as_ref() }.header.set_fixed();
                Value::from_ptr(ptr.cast())
            })
            .collect();

        let protos = module.functions.into_iter().map(Rc::new).collect();
        let loaded = Rc::new(LoadedModule { protos, strings });

        let closure = Closure::new_gal(loaded, module.main_function_id, Vec::new(), self.heap.current_white());
        let ptr = self.heap.alloc_closure(closure);
        unsafe { ptr.as_ref() }.header.set_fixed();
        Ok(ptr)
    }

    /// Compile a source string straight to a loaded closure, skipping the
    /// serialized bytecode round trip (convenient for the embedder's
    /// `eval`-style entry point; §6).
    pub fn load_source(&mut self, source: &str) -> Result<NonNull<Closure>, RuntimeError> {
        let parsed = crate::parser::parse(source);
        let module = crate::compiler::compile(&parsed.block).map_err(|e| RuntimeError::MalformedBytecode {
            message: e.to_string(),
        })?;
        let bytes = crate::bytecode::serialize::write_module(&module);
        self.load(&bytes).map_err(|e| RuntimeError::MalformedBytecode {
            message: e.to_string(),
        })
    }

    /// Register a host-backed callable as a global (§6 "Register host
    /// function").
    pub fn register_host_function(&mut self, name: &str, func: impl HostFunction + 'static) {
        let closure = Closure::new_internal(Rc::new(func), self.heap.current_white());
        let ptr = self.heap.alloc_closure(closure);
        unsafe { ptr.as_ref() }.header.set_fixed();
        let key = self.new_string(name.as_bytes());
        let globals = unsafe { &mut *self.globals.as_ptr() };
        globals.set(key, Value::from_ptr(ptr.cast()));
    }

    /// Invoke `closure` with `args` on the main thread, returning every
    /// value it returned (§6 "Call").
    pub fn call(&mut self, closure: NonNull<Closure>, args: &[Value]) -> RuntimeResult<Vec<Value>> {
        dispatch::call_entry(self, closure, args)
    }

    pub(crate) fn main_thread(&self) -> NonNull<Thread> {
        self.main_thread
    }

    /// Run one GC back-edge tick: root the permanent tables, poll the
    /// interrupt hook, and advance the incremental collector by one step
    /// (§4.6 "Allocation accounting", §5 "Cancellation").
    pub(crate) fn gc_safepoint(&self, thread: NonNull<Thread>) -> RuntimeResult<()> {
        self.heap.mark_root(self.globals.cast());
        self.heap.mark_root(thread.cast());
        self.heap.step();

        if let Some(hook) = &self.interrupt {
            let count = self.back_edges_since_poll.get() + 1;
            if count >= self.config.interrupt_poll_interval.max(1) {
                self.back_edges_since_poll.set(0);
                if hook.should_interrupt() {
                    return Err(RuntimeError::MalformedBytecode {
                        message: "interrupted by host".to_string(),
                    });
                }
            } else {
                self.back_edges_since_poll.set(count);
            }
        }
        Ok(())
    }

    pub(crate) fn thread_status(&self, thread: NonNull<Thread>) -> ThreadStatus {
        unsafe { thread.as_ref() }.status
    }

    /// Re-run the collector's finalizer queue; the embedder calls this
    /// between script invocations so `__gc` handlers observe a consistent
    /// state (§4.6 "Finalizers").
    pub fn run_finalizers(&self) {
        self.heap.run_finalizers();
    }

    /// Force a full collection cycle (backs a host-registered
    /// `collectgarbage()`, and gives embedders/tests a deterministic way to
    /// observe weak-table clearing without waiting on allocation pressure;
    /// §4.6 "States").
    pub fn collect_garbage(&self) {
        self.heap.mark_root(self.globals.cast());
        self.heap.mark_root(self.main_thread.cast());
        loop {
            self.heap.step();
            if self.heap.phase() == crate::gc::Phase::Pause {
                break;
            }
        }
        self.heap.run_finalizers();
    }

    /// Attach `metatable` to `table` (the primitive a host `setmetatable`
    /// builtin is built on). Applies the forward write barrier and, when
    /// the new metatable carries a `__mode` entry containing `v`,
    /// registers `table` with the collector as a weak-values table (§4.6
    /// "Weak tables", §4.7).
    pub fn set_metatable(&self, table: NonNull<Table>, metatable: Option<NonNull<Table>>) {
        let from = unsafe { table.cast::<crate::object::Header>().as_ref() };
        self.heap.barrier_forward_root(from, metatable.map(|m| m.cast()));
        unsafe { &mut *table.as_ptr() }.metatable = metatable.map(|m| m.cast());

        if let Some(mt) = metatable {
            let idx = crate::object::METAMETHOD_NAMES
                .iter()
                .position(|&(_, f)| f == crate::object::AbsenceFlags::MODE)
                .expect("__mode is a fixed metamethod name");
            let mode_key = self.metamethod_name(idx);
            let mode_value = unsafe { mt.as_ref() }.find(mode_key);
            if self.as_str(mode_value).is_some_and(|m| m.contains('v')) {
                self.heap.register_weak_table(table);
            }
        }
    }

    /// Attach a raw GalString's bytes as a human-readable `&str`, used by
    /// host functions that want to read a script string argument (§6).
    pub fn as_str(&self, value: Value) -> Option<String> {
        let ptr = value.as_ptr()?;
        if unsafe { ptr.as_ref() }.kind != crate::object::ObjectKind::Str {
            return None;
        }
        let s = unsafe { ptr.cast::<GalString>().as_ref() };
        Some(s.as_str().to_string())
    }
}
