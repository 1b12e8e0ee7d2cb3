//! The opcode dispatch loop (§4 "Instruction semantics", §5 "Call
//! protocol"), grounded on exactly how [`crate::compiler`] emits each
//! opcode: register windows follow `call`'s `func_reg`/`B`/`C` fields,
//! "name" operands resolve through a function's own constant pool rather
//! than the module string table directly, and the handful of opcodes the
//! compiler never emits (`copy_table`, `jump_if_equal_key`) get the
//! conservative stub documented in DESIGN.md.

use super::metamethod::{first_result, get_tagged_method, metatable_of, type_error};
use super::Vm;
use crate::bytecode::{Constant, FunctionProto, Opcode};
use crate::error::{RuntimeError, RuntimeResult};
use crate::object::{
    AbsenceFlags, Closure, ClosureKind, GalString, HostFunction, LoadedModule, Table, Thread, ThreadStatus, Upvalue,
};
use crate::value::Value;
use std::ptr::NonNull;
use std::rc::Rc;

/// Outcome of invoking a closure: either a new frame went on the stack
/// (the dispatch loop keeps running, now on top of it) or a host function
/// ran to completion synchronously.
enum Invoke {
    Pushed,
    Finished(Vec<Value>),
}

/// Outcome of running a single bytecode instruction.
enum StepResult {
    Continue,
    Returned(Vec<Value>),
}

fn malformed(message: impl Into<String>) -> RuntimeError {
    RuntimeError::MalformedBytecode { message: message.into() }
}

// -- Register / pc access ---------------------------------------------------

fn reg_at(thread_ptr: NonNull<Thread>, idx: usize) -> Value {
    let thread = unsafe { thread_ptr.as_ref() };
    thread.stack.get(idx).copied().unwrap_or(Value::NULL)
}

fn set_reg_at(thread_ptr: NonNull<Thread>, idx: usize, value: Value) {
    let thread = unsafe { &mut *thread_ptr.as_ptr() };
    if thread.stack.len() <= idx {
        thread.stack.resize(idx + 1, Value::NULL);
    }
    thread.stack[idx] = value;
}

fn reg(thread_ptr: NonNull<Thread>, base: usize, idx: u8) -> Value {
    reg_at(thread_ptr, base + idx as usize)
}

fn set_reg(thread_ptr: NonNull<Thread>, base: usize, idx: u8, value: Value) {
    set_reg_at(thread_ptr, base + idx as usize, value)
}

fn advance_pc(thread_ptr: NonNull<Thread>, words: usize) {
    let thread = unsafe { &mut *thread_ptr.as_ptr() };
    if let Some(frame) = thread.frames.last_mut() {
        frame.pc += words;
    }
}

fn set_pc(thread_ptr: NonNull<Thread>, pc: usize) {
    let thread = unsafe { &mut *thread_ptr.as_ptr() };
    if let Some(frame) = thread.frames.last_mut() {
        frame.pc = pc;
    }
}

/// Target of a relative `D`-encoded jump: `patch_jump_d` computes `D` as
/// `target - (jump_pc + 1)`, so the target is always one past the jump
/// instruction itself, plus `D`.
fn jump_target(pc: usize, d: i16) -> usize {
    (pc as i64 + 1 + d as i64) as usize
}

fn frame_snapshot(thread_ptr: NonNull<Thread>) -> (NonNull<Closure>, usize, usize) {
    let thread = unsafe { thread_ptr.as_ref() };
    let frame = thread.frames.last().expect("step_once requires an active frame");
    (frame.closure, frame.base, frame.pc)
}

fn closure_module_proto(closure: NonNull<Closure>) -> (Rc<LoadedModule>, Rc<FunctionProto>) {
    let c = unsafe { closure.as_ref() };
    match &c.kind {
        ClosureKind::Gal { module, proto_id, .. } => (Rc::clone(module), Rc::clone(&module.protos[*proto_id as usize])),
        ClosureKind::Internal { .. } => unreachable!("an internal closure never becomes an active frame"),
    }
}

/// Resolve a constant-pool index the way every "name"/"constant" operand
/// in the bytecode is encoded: first into this function's own
/// [`crate::bytecode::ConstantPool`], then (for strings) into the
/// module's shared string table.
fn const_to_value(module: &LoadedModule, proto: &FunctionProto, idx: u32) -> RuntimeResult<Value> {
    let constant = proto
        .constants
        .get(idx)
        .ok_or_else(|| malformed(format!("constant index {idx} out of range")))?;
    Ok(match constant {
        Constant::Null => Value::NULL,
        Constant::Bool(b) => Value::boolean(*b),
        Constant::Number(bits) => Value::number(f64::from_bits(*bits)),
        Constant::Str(str_idx) => *module
            .strings
            .get(*str_idx as usize)
            .ok_or_else(|| malformed(format!("string index {str_idx} out of range")))?,
        // Never produced by the compiler: import paths, table shapes and
        // closure constants are builder-time-only bookkeeping that isn't
        // threaded into the loaded module (see `copy_table`'s handling
        // below and DESIGN.md).
        Constant::Import(_) | Constant::Table(_) | Constant::Closure(_) => Value::NULL,
    })
}

// -- Upvalues -----------------------------------------------------------

fn find_or_create_upvalue(vm: &Vm, thread_ptr: NonNull<Thread>, slot: usize) -> NonNull<Upvalue> {
    let slot_ptr = {
        let thread = unsafe { &mut *thread_ptr.as_ptr() };
        if thread.stack.len() <= slot {
            thread.stack.resize(slot + 1, Value::NULL);
        }
        NonNull::from(&mut thread.stack[slot])
    };

    let mut cursor = unsafe { thread_ptr.as_ref() }.open_upvalues;
    let mut prev: Option<NonNull<Upvalue>> = None;
    while let Some(up) = cursor {
        let up_ref = unsafe { up.as_ref() };
        match up_ref.stack_slot() {
            Some(s) if s == slot_ptr => return up,
            Some(s) if (s.as_ptr() as usize) < (slot_ptr.as_ptr() as usize) => break,
            _ => {}
        }
        prev = cursor;
        cursor = up_ref.siblings().1;
    }

    let new_up = vm.heap.alloc_upvalue(Upvalue::new_open(slot_ptr, vm.heap.current_white()));
    unsafe { new_up.as_ref() }.set_siblings(prev, cursor);
    if let Some(p) = prev {
        let p_ref = unsafe { p.as_ref() };
        let (pp, _) = p_ref.siblings();
        p_ref.set_siblings(pp, Some(new_up));
    } else {
        let thread = unsafe { &mut *thread_ptr.as_ptr() };
        thread.open_upvalues = Some(new_up);
    }
    if let Some(next) = cursor {
        let n_ref = unsafe { next.as_ref() };
        let (_, nn) = n_ref.siblings();
        n_ref.set_siblings(Some(new_up), nn);
    }
    new_up
}

fn close_upvalues_from(thread_ptr: NonNull<Thread>, floor: usize) {
    let stack_base = unsafe { thread_ptr.as_ref() }.stack.as_ptr() as usize;
    let mut cursor = unsafe { thread_ptr.as_ref() }.open_upvalues;
    while let Some(up) = cursor {
        let up_ref = unsafe { up.as_ref() };
        let Some(slot) = up_ref.stack_slot() else { break };
        let idx = (slot.as_ptr() as usize - stack_base) / std::mem::size_of::<Value>();
        if idx < floor {
            break;
        }
        let (_, next) = up_ref.close();
        cursor = next;
    }
    let thread = unsafe { &mut *thread_ptr.as_ptr() };
    thread.open_upvalues = cursor;
}

// -- Table indexing / metamethod chain ---------------------------------------

fn table_index(vm: &Vm, thread_ptr: NonNull<Thread>, obj: Value, key: Value, depth: usize) -> RuntimeResult<Value> {
    if depth >= crate::consts::MAX_METATABLE_CHAIN_DEPTH {
        return Err(RuntimeError::MetatableChainTooDeep);
    }
    if let Some(table_ptr) = obj.as_ptr().filter(|_| obj.object_kind() == Some(crate::object::ObjectKind::Table)) {
        let table = unsafe { table_ptr.cast::<Table>().as_ref() };
        let raw = table.find(key);
        if !raw.is_null() {
            return Ok(raw);
        }
        return match get_tagged_method(vm, obj, AbsenceFlags::INDEX) {
            None => Ok(Value::NULL),
            Some(handler) if handler.object_kind() == Some(crate::object::ObjectKind::Table) => {
                table_index(vm, thread_ptr, handler, key, depth + 1)
            }
            Some(handler) => Ok(first_result(call_blocking(vm, thread_ptr, handler, &[obj, key])?)),
        };
    }
    if obj.is_null() {
        return Err(RuntimeError::IndexNullValue);
    }
    if metatable_of(obj).is_some() {
        return match get_tagged_method(vm, obj, AbsenceFlags::INDEX) {
            None => Err(RuntimeError::TypeMismatch { type_name: obj.type_name() }),
            Some(handler) if handler.object_kind() == Some(crate::object::ObjectKind::Table) => {
                table_index(vm, thread_ptr, handler, key, depth + 1)
            }
            Some(handler) => Ok(first_result(call_blocking(vm, thread_ptr, handler, &[obj, key])?)),
        };
    }
    Err(RuntimeError::TypeMismatch { type_name: obj.type_name() })
}

fn table_newindex(vm: &Vm, thread_ptr: NonNull<Thread>, obj: Value, key: Value, value: Value, depth: usize) -> RuntimeResult<()> {
    if depth >= crate::consts::MAX_METATABLE_CHAIN_DEPTH {
        return Err(RuntimeError::MetatableChainTooDeep);
    }
    if obj.object_kind() == Some(crate::object::ObjectKind::Table) {
        let table_ptr = obj.as_ptr().unwrap().cast::<Table>();
        let exists = !unsafe { table_ptr.as_ref() }.find(key).is_null();
        if exists {
            unsafe { &mut *table_ptr.as_ptr() }.set(key, value);
            vm.heap.barrier_backward_table(table_ptr);
            return Ok(());
        }
        return match get_tagged_method(vm, obj, AbsenceFlags::NEWINDEX) {
            None => {
                unsafe { &mut *table_ptr.as_ptr() }.set(key, value);
                vm.heap.barrier_backward_table(table_ptr);
                Ok(())
            }
            Some(handler) if handler.object_kind() == Some(crate::object::ObjectKind::Table) => {
                table_newindex(vm, thread_ptr, handler, key, value, depth + 1)
            }
            Some(handler) => {
                call_blocking(vm, thread_ptr, handler, &[obj, key, value])?;
                Ok(())
            }
        };
    }
    if obj.is_null() {
        return Err(RuntimeError::IndexNullValue);
    }
    if metatable_of(obj).is_some() {
        return match get_tagged_method(vm, obj, AbsenceFlags::NEWINDEX) {
            None => Err(RuntimeError::TypeMismatch { type_name: obj.type_name() }),
            Some(handler) if handler.object_kind() == Some(crate::object::ObjectKind::Table) => {
                table_newindex(vm, thread_ptr, handler, key, value, depth + 1)
            }
            Some(handler) => {
                call_blocking(vm, thread_ptr, handler, &[obj, key, value])?;
                Ok(())
            }
        };
    }
    Err(RuntimeError::TypeMismatch { type_name: obj.type_name() })
}

// -- Arithmetic / comparison --------------------------------------------

fn stringify(value: Value) -> String {
    if value.object_kind() == Some(crate::object::ObjectKind::Str) {
        let ptr = value.as_ptr().unwrap().cast::<GalString>();
        unsafe { ptr.as_ref() }.as_str().to_string()
    } else {
        value.to_string()
    }
}

fn is_stringable(value: Value) -> bool {
    value.is_number() || value.object_kind() == Some(crate::object::ObjectKind::Str)
}

fn arith(
    vm: &Vm,
    thread_ptr: NonNull<Thread>,
    lhs: Value,
    rhs: Value,
    event: AbsenceFlags,
    op: fn(f64, f64) -> RuntimeResult<f64>,
) -> RuntimeResult<Value> {
    if let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) {
        return Ok(Value::number(op(a, b)?));
    }
    metamethod_fallback(vm, thread_ptr, lhs, rhs, event)
}

fn metamethod_fallback(vm: &Vm, thread_ptr: NonNull<Thread>, lhs: Value, rhs: Value, event: AbsenceFlags) -> RuntimeResult<Value> {
    if let Some(handler) = get_tagged_method(vm, lhs, event).or_else(|| get_tagged_method(vm, rhs, event)) {
        return Ok(first_result(call_blocking(vm, thread_ptr, handler, &[lhs, rhs])?));
    }
    Err(type_error(lhs, rhs))
}

fn add_or_concat(vm: &Vm, thread_ptr: NonNull<Thread>, lhs: Value, rhs: Value) -> RuntimeResult<Value> {
    if let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) {
        return Ok(Value::number(a + b));
    }
    if is_stringable(lhs) && is_stringable(rhs) {
        let mut s = stringify(lhs);
        s.push_str(&stringify(rhs));
        return Ok(Value::from_ptr(vm.heap.alloc_string(s.into_bytes()).cast()));
    }
    if let Some(handler) = get_tagged_method(vm, lhs, AbsenceFlags::ADD).or_else(|| get_tagged_method(vm, rhs, AbsenceFlags::ADD)) {
        return Ok(first_result(call_blocking(vm, thread_ptr, handler, &[lhs, rhs])?));
    }
    if let Some(handler) = get_tagged_method(vm, lhs, AbsenceFlags::CONCAT).or_else(|| get_tagged_method(vm, rhs, AbsenceFlags::CONCAT)) {
        return Ok(first_result(call_blocking(vm, thread_ptr, handler, &[lhs, rhs])?));
    }
    Err(type_error(lhs, rhs))
}

fn compare_lt(vm: &Vm, thread_ptr: NonNull<Thread>, lhs: Value, rhs: Value) -> RuntimeResult<bool> {
    if let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) {
        return Ok(a < b);
    }
    if lhs.object_kind() == Some(crate::object::ObjectKind::Str) && rhs.object_kind() == Some(crate::object::ObjectKind::Str) {
        return Ok(gal_str(lhs).as_bytes() < gal_str(rhs).as_bytes());
    }
    Ok(metamethod_fallback(vm, thread_ptr, lhs, rhs, AbsenceFlags::LT)?.is_truthy())
}

fn compare_le(vm: &Vm, thread_ptr: NonNull<Thread>, lhs: Value, rhs: Value) -> RuntimeResult<bool> {
    if let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) {
        return Ok(a <= b);
    }
    if lhs.object_kind() == Some(crate::object::ObjectKind::Str) && rhs.object_kind() == Some(crate::object::ObjectKind::Str) {
        return Ok(gal_str(lhs).as_bytes() <= gal_str(rhs).as_bytes());
    }
    Ok(metamethod_fallback(vm, thread_ptr, lhs, rhs, AbsenceFlags::LE)?.is_truthy())
}

fn gal_str(value: Value) -> &'static GalString {
    let ptr = value.as_ptr().unwrap().cast::<GalString>();
    unsafe { ptr.as_ref() }
}

/// Step a recognized `pairs`/`ipairs` generic-for loop at register window
/// `state_reg` (table), `state_reg + 1` (control/key), delegating to
/// [`Table::next`]. Shared by both prepare opcodes and the loop back-edge.
fn generator_step(thread_ptr: NonNull<Thread>, base: usize, state_reg: u8) -> RuntimeResult<Option<(Value, Value)>> {
    let table_value = reg(thread_ptr, base, state_reg);
    if table_value.object_kind() != Some(crate::object::ObjectKind::Table) {
        return Err(RuntimeError::TypeMismatch { type_name: "table" });
    }
    let table_ptr = table_value.as_ptr().unwrap().cast::<Table>();
    let key = reg(thread_ptr, base, state_reg + 1);
    Ok(unsafe { table_ptr.as_ref() }.next(key))
}

fn compare_eq(vm: &Vm, thread_ptr: NonNull<Thread>, lhs: Value, rhs: Value) -> RuntimeResult<bool> {
    if lhs == rhs {
        return Ok(true);
    }
    if lhs.object_kind() == Some(crate::object::ObjectKind::Table) && rhs.object_kind() == Some(crate::object::ObjectKind::Table) {
        if let Some(handler) = get_tagged_method(vm, lhs, AbsenceFlags::EQ).or_else(|| get_tagged_method(vm, rhs, AbsenceFlags::EQ)) {
            return Ok(first_result(call_blocking(vm, thread_ptr, handler, &[lhs, rhs])?).is_truthy());
        }
    }
    Ok(false)
}

fn to_i64(value: Value) -> RuntimeResult<i64> {
    value
        .as_number()
        .map(|n| n as i64)
        .ok_or(RuntimeError::TypeMismatch { type_name: value.type_name() })
}

fn neg(vm: &Vm, thread_ptr: NonNull<Thread>, v: Value) -> RuntimeResult<Value> {
    if let Some(n) = v.as_number() {
        return Ok(Value::number(-n));
    }
    if let Some(handler) = get_tagged_method(vm, v, AbsenceFlags::UNM) {
        return Ok(first_result(call_blocking(vm, thread_ptr, handler, &[v, v])?));
    }
    Err(RuntimeError::TypeMismatch { type_name: v.type_name() })
}

fn len_op(vm: &Vm, thread_ptr: NonNull<Thread>, v: Value) -> RuntimeResult<Value> {
    match v.object_kind() {
        Some(crate::object::ObjectKind::Str) => Ok(Value::number(gal_str(v).len() as f64)),
        Some(crate::object::ObjectKind::Table) => {
            if let Some(handler) = get_tagged_method(vm, v, AbsenceFlags::LEN) {
                return Ok(first_result(call_blocking(vm, thread_ptr, handler, &[v])?));
            }
            let table = unsafe { v.as_ptr().unwrap().cast::<Table>().as_ref() };
            Ok(Value::number(table.len() as f64))
        }
        _ => Err(RuntimeError::TypeMismatch { type_name: v.type_name() }),
    }
}

// -- Calling --------------------------------------------------------------

fn write_results(thread_ptr: NonNull<Thread>, result_base: usize, want_results: Option<u8>, values: Vec<Value>) -> Vec<Value> {
    let want = want_results.map(|c| c as usize);
    let n = want.unwrap_or(values.len());
    let thread = unsafe { &mut *thread_ptr.as_ptr() };
    if thread.stack.len() < result_base + n {
        thread.stack.resize(result_base + n, Value::NULL);
    }
    for i in 0..n {
        thread.stack[result_base + i] = values.get(i).copied().unwrap_or(Value::NULL);
    }
    match want {
        Some(w) => {
            let mut v = values;
            v.resize(w, Value::NULL);
            v
        }
        None => values,
    }
}

/// Push a new frame for `closure` (gal) or run it synchronously (internal).
fn invoke(
    vm: &Vm,
    thread_ptr: NonNull<Thread>,
    closure: NonNull<Closure>,
    args: &[Value],
    result_base: usize,
    want_results: Option<u8>,
) -> RuntimeResult<Invoke> {
    let thread = unsafe { thread_ptr.as_ref() };
    if thread.frames.len() >= vm.config.max_call_depth {
        return Err(RuntimeError::StackOverflow { limit: vm.config.max_call_depth });
    }

    let c = unsafe { closure.as_ref() };
    match &c.kind {
        ClosureKind::Internal { func, .. } => {
            let results = func.call(args)?;
            let written = write_results(thread_ptr, result_base, want_results, results);
            Ok(Invoke::Finished(written))
        }
        ClosureKind::Gal { .. } => {
            let (_module, proto) = closure_module_proto(closure);
            let base = result_base + 1;
            let frame_top = base + c.stack_size as usize;
            let num_params = proto.num_params as usize;

            {
                let thread = unsafe { &mut *thread_ptr.as_ptr() };
                if thread.stack.len() < frame_top {
                    thread.stack.resize(frame_top, Value::NULL);
                }
                for i in 0..num_params {
                    thread.stack[base + i] = args.get(i).copied().unwrap_or(Value::NULL);
                }
                for i in num_params..(c.stack_size as usize) {
                    thread.stack[base + i] = Value::NULL;
                }
            }

            let extra_args: Box<[Value]> = if proto.is_vararg && args.len() > num_params {
                args[num_params..].to_vec().into_boxed_slice()
            } else {
                Box::new([])
            };

            let thread = unsafe { &mut *thread_ptr.as_ptr() };
            thread.frames.push(crate::object::CallFrame {
                closure,
                base,
                pc: 0,
                is_protected: false,
                result_base,
                want_results,
                extra_args,
                frame_top,
            });
            Ok(Invoke::Pushed)
        }
    }
}

/// Resolve `func_value` to a callable closure, falling back one level
/// through `__call` (prepending `func_value` to the arguments, matching
/// `mt.__call(obj, ...)`; no further chaining beyond this single level).
fn resolve_callable(vm: &Vm, func_value: Value, args: &[Value]) -> RuntimeResult<(NonNull<Closure>, Vec<Value>)> {
    if func_value.object_kind() == Some(crate::object::ObjectKind::Closure) {
        return Ok((func_value.as_ptr().unwrap().cast(), args.to_vec()));
    }
    if let Some(handler) = get_tagged_method(vm, func_value, AbsenceFlags::CALL) {
        if handler.object_kind() == Some(crate::object::ObjectKind::Closure) {
            let mut full = Vec::with_capacity(args.len() + 1);
            full.push(func_value);
            full.extend_from_slice(args);
            return Ok((handler.as_ptr().unwrap().cast(), full));
        }
    }
    Err(RuntimeError::NotCallable { type_name: func_value.type_name() })
}

fn call_opcode(
    vm: &Vm,
    thread_ptr: NonNull<Thread>,
    func_value: Value,
    args_start: usize,
    nargs: usize,
    result_base: usize,
    want_results: Option<u8>,
) -> RuntimeResult<StepResult> {
    let args: Vec<Value> = (0..nargs).map(|i| reg_at(thread_ptr, args_start + i)).collect();
    let (closure, args) = resolve_callable(vm, func_value, &args)?;
    invoke(vm, thread_ptr, closure, &args, result_base, want_results)?;
    Ok(StepResult::Continue)
}

/// Invoke `func_value` and block until it produces results, re-entering
/// the dispatch loop if it is a script closure. Used by metamethod
/// dispatch, which needs an inline result within the same Rust call.
pub(super) fn call_blocking(vm: &Vm, thread_ptr: NonNull<Thread>, func_value: Value, args: &[Value]) -> RuntimeResult<Vec<Value>> {
    let (closure, args) = resolve_callable(vm, func_value, args)?;
    let result_base = unsafe { thread_ptr.as_ref() }.frames.last().map(|f| f.frame_top).unwrap_or(0);
    let target_depth = unsafe { thread_ptr.as_ref() }.frames.len();
    match invoke(vm, thread_ptr, closure, &args, result_base, None)? {
        Invoke::Finished(values) => Ok(values),
        Invoke::Pushed => run_until_depth(vm, thread_ptr, target_depth),
    }
}

fn unwind_to(thread_ptr: NonNull<Thread>, target_depth: usize) {
    loop {
        let base = {
            let thread = unsafe { thread_ptr.as_ref() };
            if thread.frames.len() <= target_depth {
                return;
            }
            thread.frames.last().unwrap().base
        };
        close_upvalues_from(thread_ptr, base);
        let thread = unsafe { &mut *thread_ptr.as_ptr() };
        thread.frames.pop();
    }
}

fn run_until_depth(vm: &Vm, thread_ptr: NonNull<Thread>, target_depth: usize) -> RuntimeResult<Vec<Value>> {
    loop {
        match step_once(vm, thread_ptr) {
            Ok(StepResult::Continue) => continue,
            Ok(StepResult::Returned(values)) => {
                if unsafe { thread_ptr.as_ref() }.frames.len() <= target_depth {
                    return Ok(values);
                }
            }
            Err(e) => {
                unwind_to(thread_ptr, target_depth);
                return Err(e);
            }
        }
    }
}

/// Top-level entry point: reset the main thread, run `closure` with
/// `args`, and return whatever it returns (§6 "Call").
pub(super) fn call_entry(vm: &mut Vm, closure: NonNull<Closure>, args: &[Value]) -> RuntimeResult<Vec<Value>> {
    let thread_ptr = vm.main_thread();
    {
        let thread = unsafe { &mut *thread_ptr.as_ptr() };
        thread.status = ThreadStatus::Running;
        thread.stack.clear();
        thread.frames.clear();
        thread.open_upvalues = None;
    }

    let result = match invoke(vm, thread_ptr, closure, args, 0, None) {
        Ok(Invoke::Finished(values)) => Ok(values),
        Ok(Invoke::Pushed) => run_until_depth(vm, thread_ptr, 0),
        Err(e) => Err(e),
    };

    let thread = unsafe { &mut *thread_ptr.as_ptr() };
    thread.status = ThreadStatus::Suspended;
    thread.frames.clear();
    thread.open_upvalues = None;
    result
}

// -- Single-step dispatch ----------------------------------------------

fn step_once(vm: &Vm, thread_ptr: NonNull<Thread>) -> RuntimeResult<StepResult> {
    let (closure, base, pc) = frame_snapshot(thread_ptr);
    let (module, proto) = closure_module_proto(closure);

    let instr = *proto
        .code
        .get(pc)
        .ok_or_else(|| malformed(format!("pc {pc} out of range")))?;
    let op = instr.op().ok_or_else(|| malformed("unrecognized opcode"))?;

    #[cfg(feature = "trace-log")]
    tracing::trace!(pc, ?op, "dispatch");

    let const_at = |idx: u32| const_to_value(&module, &proto, idx);
    let aux_word = |offset: usize| -> RuntimeResult<u32> {
        Ok(proto
            .code
            .get(pc + offset)
            .ok_or_else(|| malformed("missing aux word"))?
            .raw())
    };

    match op {
        Opcode::Nop => {
            advance_pc(thread_ptr, 1);
            Ok(StepResult::Continue)
        }
        Opcode::Move => {
            let v = reg(thread_ptr, base, instr.b());
            set_reg(thread_ptr, base, instr.a(), v);
            advance_pc(thread_ptr, 1);
            Ok(StepResult::Continue)
        }
        Opcode::LoadNull => {
            set_reg(thread_ptr, base, instr.a(), Value::NULL);
            advance_pc(thread_ptr, 1);
            Ok(StepResult::Continue)
        }
        Opcode::LoadBoolean => {
            set_reg(thread_ptr, base, instr.a(), Value::boolean(instr.b() != 0));
            advance_pc(thread_ptr, 1);
            Ok(StepResult::Continue)
        }
        Opcode::LoadNumber => {
            let v = const_at(instr.d() as u32)?;
            set_reg(thread_ptr, base, instr.a(), v);
            advance_pc(thread_ptr, 1);
            Ok(StepResult::Continue)
        }
        Opcode::LoadKey => {
            let v = const_at(instr.d() as u32)?;
            set_reg(thread_ptr, base, instr.a(), v);
            advance_pc(thread_ptr, 1);
            Ok(StepResult::Continue)
        }
        Opcode::LoadKeyExtra => {
            let idx = aux_word(1)?;
            let v = const_at(idx)?;
            set_reg(thread_ptr, base, instr.a(), v);
            advance_pc(thread_ptr, 2);
            Ok(StepResult::Continue)
        }
        Opcode::LoadGlobal => {
            let idx = aux_word(1)?;
            let key = const_at(idx)?;
            let globals = Value::from_ptr(vm.globals.cast());
            let v = table_index(vm, thread_ptr, globals, key, 0)?;
            set_reg(thread_ptr, base, instr.a(), v);
            advance_pc(thread_ptr, 2);
            Ok(StepResult::Continue)
        }
        Opcode::StoreGlobal => {
            let idx = aux_word(1)?;
            let key = const_at(idx)?;
            let value = reg(thread_ptr, base, instr.a());
            let globals = Value::from_ptr(vm.globals.cast());
            table_newindex(vm, thread_ptr, globals, key, value, 0)?;
            advance_pc(thread_ptr, 2);
            Ok(StepResult::Continue)
        }
        Opcode::LoadTable => {
            let obj = reg(thread_ptr, base, instr.b());
            let key = reg(thread_ptr, base, instr.c());
            let v = table_index(vm, thread_ptr, obj, key, 0)?;
            set_reg(thread_ptr, base, instr.a(), v);
            advance_pc(thread_ptr, 1);
            Ok(StepResult::Continue)
        }
        Opcode::StoreTable => {
            let obj = reg(thread_ptr, base, instr.a());
            let key = reg(thread_ptr, base, instr.b());
            let value = reg(thread_ptr, base, instr.c());
            table_newindex(vm, thread_ptr, obj, key, value, 0)?;
            advance_pc(thread_ptr, 1);
            Ok(StepResult::Continue)
        }
        Opcode::NewTable => {
            let ptr = vm.heap.alloc_table();
            set_reg(thread_ptr, base, instr.a(), Value::from_ptr(ptr.cast()));
            advance_pc(thread_ptr, 2);
            Ok(StepResult::Continue)
        }
        Opcode::SetList => {
            let table_reg = instr.a();
            let count = instr.b();
            let start_index = instr.c() as u32;
            let obj = reg(thread_ptr, base, table_reg);
            let table_ptr = obj.as_ptr().ok_or_else(|| malformed("set_list target is not a table"))?.cast::<Table>();
            for i in 0..count {
                let value = reg(thread_ptr, base, table_reg + 1 + i);
                let key = Value::number((start_index + i as u32 + 1) as f64);
                unsafe { &mut *table_ptr.as_ptr() }.set(key, value);
            }
            vm.heap.barrier_backward_table(table_ptr);
            advance_pc(thread_ptr, 1);
            Ok(StepResult::Continue)
        }
        Opcode::SetTableStringKey => {
            let idx = aux_word(1)?;
            let key = const_at(idx)?;
            let obj = reg(thread_ptr, base, instr.a());
            let value = reg(thread_ptr, base, instr.b());
            table_newindex(vm, thread_ptr, obj, key, value, 0)?;
            advance_pc(thread_ptr, 2);
            Ok(StepResult::Continue)
        }
        Opcode::CopyTable => {
            // Never emitted by the compiler: table shapes are builder-time
            // bookkeeping, not threaded into the loaded module. Stubbed as
            // a no-op (see DESIGN.md).
            advance_pc(thread_ptr, 2);
            Ok(StepResult::Continue)
        }
        Opcode::GetUpvalue => {
            let c = unsafe { closure.as_ref() };
            let up = match &c.kind {
                ClosureKind::Gal { upvalues, .. } => *upvalues
                    .get(instr.b() as usize)
                    .ok_or_else(|| malformed("upvalue index out of range"))?,
                ClosureKind::Internal { .. } => return Err(malformed("get_upvalue on an internal closure")),
            };
            let v = unsafe { up.as_ref() }.get();
            set_reg(thread_ptr, base, instr.a(), v);
            advance_pc(thread_ptr, 1);
            Ok(StepResult::Continue)
        }
        Opcode::SetUpvalue => {
            let c = unsafe { closure.as_ref() };
            let up = match &c.kind {
                ClosureKind::Gal { upvalues, .. } => *upvalues
                    .get(instr.a() as usize)
                    .ok_or_else(|| malformed("upvalue index out of range"))?,
                ClosureKind::Internal { .. } => return Err(malformed("set_upvalue on an internal closure")),
            };
            let v = reg(thread_ptr, base, instr.b());
            unsafe { up.as_ref() }.set(v);
            advance_pc(thread_ptr, 1);
            Ok(StepResult::Continue)
        }
        Opcode::CloseUpvalues => {
            close_upvalues_from(thread_ptr, base + instr.a() as usize);
            advance_pc(thread_ptr, 1);
            Ok(StepResult::Continue)
        }
        Opcode::NewClosure => {
            let child_idx = aux_word(1)? as usize;
            let child_proto_id = *proto
                .children
                .get(child_idx)
                .ok_or_else(|| malformed("child function index out of range"))?;
            let child_proto = Rc::clone(&module.protos[child_proto_id as usize]);
            let num_upvalues = child_proto.num_upvalues as usize;

            let mut upvalues = Vec::with_capacity(num_upvalues);
            for i in 0..num_upvalues {
                let capture_instr = *proto
                    .code
                    .get(pc + 2 + i)
                    .ok_or_else(|| malformed("missing capture instruction"))?;
                if capture_instr.op() != Some(Opcode::Capture) {
                    return Err(malformed("new_closure not followed by the expected capture instructions"));
                }
                let tag = capture_instr.a();
                let source = capture_instr.b();
                let up = match tag {
                    0 => {
                        let value = reg(thread_ptr, base, source);
                        vm.heap.alloc_upvalue(Upvalue::new_closed(value, vm.heap.current_white()))
                    }
                    1 => find_or_create_upvalue(vm, thread_ptr, base + source as usize),
                    2 => {
                        let c = unsafe { closure.as_ref() };
                        match &c.kind {
                            ClosureKind::Gal { upvalues, .. } => *upvalues
                                .get(source as usize)
                                .ok_or_else(|| malformed("upvalue index out of range"))?,
                            ClosureKind::Internal { .. } => return Err(malformed("capture on an internal closure")),
                        }
                    }
                    _ => return Err(malformed("unrecognized capture tag")),
                };
                upvalues.push(up);
            }

            let child = Closure::new_gal(Rc::clone(&module), child_proto_id, upvalues, vm.heap.current_white());
            let ptr = vm.heap.alloc_closure(child);
            set_reg(thread_ptr, base, instr.a(), Value::from_ptr(ptr.cast()));
            advance_pc(thread_ptr, 2 + num_upvalues);
            Ok(StepResult::Continue)
        }
        Opcode::Capture => Err(malformed("capture instruction reached outside new_closure")),
        Opcode::Call => {
            let func_reg = instr.a();
            let b = instr.b();
            let c = instr.c();
            let func_abs = base + func_reg as usize;
            let args_start = func_abs + 1;
            let nargs = if b == 0 {
                unsafe { thread_ptr.as_ref() }.stack.len().saturating_sub(args_start)
            } else {
                (b - 1) as usize
            };
            let want_results = if c == 0 { None } else { Some(c - 1) };
            let func_value = reg_at(thread_ptr, func_abs);
            // Advance this frame's pc before invoking: a gal callee pushes
            // a new frame that becomes `frames.last()`, so pc mutations
            // after this point would land on the wrong frame.
            advance_pc(thread_ptr, 1);
            call_opcode(vm, thread_ptr, func_value, args_start, nargs, func_abs, want_results)
        }
        Opcode::CallReturn => {
            let mark = instr.a();
            let b = instr.b();
            let start = base + mark as usize;
            let count = if b == 0 {
                unsafe { thread_ptr.as_ref() }.stack.len().saturating_sub(start)
            } else {
                (b - 1) as usize
            };
            let values: Vec<Value> = (0..count).map(|i| reg_at(thread_ptr, start + i)).collect();

            let (result_base, want_results, caller_top) = {
                let thread = unsafe { &mut *thread_ptr.as_ptr() };
                let frame = thread.frames.pop().expect("call_return requires an active frame");
                let caller_top = thread.frames.last().map(|f| f.frame_top);
                (frame.result_base, frame.want_results, caller_top)
            };

            close_upvalues_from(thread_ptr, base);

            let written = write_results(thread_ptr, result_base, want_results, values);
            let restore_top = caller_top.unwrap_or(result_base + written.len()).max(result_base + written.len());
            unsafe { &mut *thread_ptr.as_ptr() }.stack.truncate(restore_top);

            Ok(StepResult::Returned(written))
        }
        Opcode::NamedCall => {
            let func_reg = instr.a();
            let self_reg = instr.b();
            let idx = instr.c() as u32;
            let self_val = reg(thread_ptr, base, self_reg);
            let key = const_at(idx)?;
            let method = table_index(vm, thread_ptr, self_val, key, 0)?;
            set_reg(thread_ptr, base, func_reg, method);
            advance_pc(thread_ptr, 1);
            Ok(StepResult::Continue)
        }
        Opcode::PrepareVarargs => {
            let thread = unsafe { thread_ptr.as_ref() };
            let frame = thread.frames.last().expect("active frame");
            let v = frame.extra_args.first().copied().unwrap_or(Value::NULL);
            set_reg(thread_ptr, base, instr.a(), v);
            advance_pc(thread_ptr, 1);
            Ok(StepResult::Continue)
        }
        Opcode::Jump => {
            let target = jump_target(pc, instr.d());
            set_pc(thread_ptr, target);
            Ok(StepResult::Continue)
        }
        Opcode::JumpBack => {
            vm.gc_safepoint(thread_ptr)?;
            let target = jump_target(pc, instr.d());
            set_pc(thread_ptr, target);
            Ok(StepResult::Continue)
        }
        Opcode::JumpExtra => {
            let target = aux_word(1)? as usize;
            set_pc(thread_ptr, target);
            Ok(StepResult::Continue)
        }
        Opcode::JumpIf => {
            if reg(thread_ptr, base, instr.a()).is_truthy() {
                set_pc(thread_ptr, jump_target(pc, instr.d()));
            } else {
                advance_pc(thread_ptr, 1);
            }
            Ok(StepResult::Continue)
        }
        Opcode::JumpIfNot => {
            if !reg(thread_ptr, base, instr.a()).is_truthy() {
                set_pc(thread_ptr, jump_target(pc, instr.d()));
            } else {
                advance_pc(thread_ptr, 1);
            }
            Ok(StepResult::Continue)
        }
        Opcode::JumpIfEqualKey => {
            // Never emitted by the compiler; treated the same as
            // `jump_if` (see DESIGN.md).
            if reg(thread_ptr, base, instr.a()).is_truthy() {
                set_pc(thread_ptr, jump_target(pc, instr.d()));
            } else {
                advance_pc(thread_ptr, 1);
            }
            Ok(StepResult::Continue)
        }
        Opcode::Add => {
            let lhs = reg(thread_ptr, base, instr.b());
            let rhs = reg(thread_ptr, base, instr.c());
            let v = add_or_concat(vm, thread_ptr, lhs, rhs)?;
            set_reg(thread_ptr, base, instr.a(), v);
            advance_pc(thread_ptr, 1);
            Ok(StepResult::Continue)
        }
        Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod | Opcode::Pow => {
            let lhs = reg(thread_ptr, base, instr.b());
            let rhs = reg(thread_ptr, base, instr.c());
            let v = dispatch_arith(vm, thread_ptr, op, lhs, rhs)?;
            set_reg(thread_ptr, base, instr.a(), v);
            advance_pc(thread_ptr, 1);
            Ok(StepResult::Continue)
        }
        Opcode::AddKey | Opcode::SubKey | Opcode::MulKey | Opcode::DivKey | Opcode::ModKey => {
            let lhs = reg(thread_ptr, base, instr.a());
            let rhs = const_at(instr.d() as u32)?;
            let v = if op == Opcode::AddKey {
                add_or_concat(vm, thread_ptr, lhs, rhs)?
            } else {
                dispatch_arith(vm, thread_ptr, key_to_plain(op), lhs, rhs)?
            };
            set_reg(thread_ptr, base, instr.a(), v);
            advance_pc(thread_ptr, 1);
            Ok(StepResult::Continue)
        }
        Opcode::Neg => {
            let v = reg(thread_ptr, base, instr.b());
            let result = neg(vm, thread_ptr, v)?;
            set_reg(thread_ptr, base, instr.a(), result);
            advance_pc(thread_ptr, 1);
            Ok(StepResult::Continue)
        }
        Opcode::Not => {
            let v = reg(thread_ptr, base, instr.b());
            set_reg(thread_ptr, base, instr.a(), Value::boolean(!v.is_truthy()));
            advance_pc(thread_ptr, 1);
            Ok(StepResult::Continue)
        }
        Opcode::Len => {
            let v = reg(thread_ptr, base, instr.b());
            let result = len_op(vm, thread_ptr, v)?;
            set_reg(thread_ptr, base, instr.a(), result);
            advance_pc(thread_ptr, 1);
            Ok(StepResult::Continue)
        }
        Opcode::BNot => {
            let v = to_i64(reg(thread_ptr, base, instr.b()))?;
            set_reg(thread_ptr, base, instr.a(), Value::number(!v as f64));
            advance_pc(thread_ptr, 1);
            Ok(StepResult::Continue)
        }
        Opcode::BAnd | Opcode::BOr | Opcode::BXor | Opcode::Shl | Opcode::Shr => {
            let lhs = to_i64(reg(thread_ptr, base, instr.b()))?;
            let rhs = to_i64(reg(thread_ptr, base, instr.c()))?;
            let result = match op {
                Opcode::BAnd => lhs & rhs,
                Opcode::BOr => lhs | rhs,
                Opcode::BXor => lhs ^ rhs,
                Opcode::Shl => lhs << (rhs & 63),
                Opcode::Shr => ((lhs as u64) >> (rhs & 63)) as i64,
                _ => unreachable!(),
            };
            set_reg(thread_ptr, base, instr.a(), Value::number(result as f64));
            advance_pc(thread_ptr, 1);
            Ok(StepResult::Continue)
        }
        Opcode::Lt | Opcode::Le | Opcode::Eq => {
            let lhs = reg(thread_ptr, base, instr.b());
            let rhs = reg(thread_ptr, base, instr.c());
            let result = match op {
                Opcode::Lt => compare_lt(vm, thread_ptr, lhs, rhs)?,
                Opcode::Le => compare_le(vm, thread_ptr, lhs, rhs)?,
                Opcode::Eq => compare_eq(vm, thread_ptr, lhs, rhs)?,
                _ => unreachable!(),
            };
            set_reg(thread_ptr, base, instr.a(), Value::boolean(result));
            advance_pc(thread_ptr, 1);
            Ok(StepResult::Continue)
        }
        Opcode::LtKey | Opcode::LeKey | Opcode::EqKey => {
            let lhs = reg(thread_ptr, base, instr.a());
            let rhs = const_at(instr.d() as u32)?;
            let result = match op {
                Opcode::LtKey => compare_lt(vm, thread_ptr, lhs, rhs)?,
                Opcode::LeKey => compare_le(vm, thread_ptr, lhs, rhs)?,
                Opcode::EqKey => compare_eq(vm, thread_ptr, lhs, rhs)?,
                _ => unreachable!(),
            };
            set_reg(thread_ptr, base, instr.a(), Value::boolean(result));
            advance_pc(thread_ptr, 1);
            Ok(StepResult::Continue)
        }
        Opcode::ForNumericLoopPrepare => {
            let counter_reg = instr.a();
            let counter = reg(thread_ptr, base, counter_reg)
                .as_number()
                .ok_or(RuntimeError::TypeMismatch { type_name: "non-number" })?;
            let limit = reg(thread_ptr, base, counter_reg + 1)
                .as_number()
                .ok_or(RuntimeError::TypeMismatch { type_name: "non-number" })?;
            let step = reg(thread_ptr, base, counter_reg + 2)
                .as_number()
                .ok_or(RuntimeError::TypeMismatch { type_name: "non-number" })?;
            let skip = step == 0.0 || (step > 0.0 && counter > limit) || (step < 0.0 && counter < limit);
            if skip {
                set_pc(thread_ptr, jump_target(pc, instr.d()));
            } else {
                set_reg(thread_ptr, base, counter_reg + 3, Value::number(counter));
                advance_pc(thread_ptr, 1);
            }
            Ok(StepResult::Continue)
        }
        Opcode::ForNumericLoop => {
            vm.gc_safepoint(thread_ptr)?;
            let counter_reg = instr.a();
            let counter = reg(thread_ptr, base, counter_reg).as_number().unwrap_or(0.0);
            let limit = reg(thread_ptr, base, counter_reg + 1).as_number().unwrap_or(0.0);
            let step = reg(thread_ptr, base, counter_reg + 2).as_number().unwrap_or(0.0);
            let next = counter + step;
            let cont = (step > 0.0 && next <= limit) || (step < 0.0 && next >= limit);
            if cont {
                set_reg(thread_ptr, base, counter_reg, Value::number(next));
                set_reg(thread_ptr, base, counter_reg + 3, Value::number(next));
                set_pc(thread_ptr, jump_target(pc, instr.d()));
            } else {
                advance_pc(thread_ptr, 1);
            }
            Ok(StepResult::Continue)
        }
        Opcode::ForGeneratorLoopPrepareNext | Opcode::ForGeneratorLoopPrepareInext => {
            // Emitted for a recognized `pairs(t)`/`ipairs(t)` iterator
            // (§4.4 "for ... in"); both prepares drive the same table-order
            // `next` stepping (no distinct array part, see DESIGN.md), so
            // they share this handler. `A` holds the table (state), `A+1`
            // the current key (control, null on entry), `A+2` is reserved
            // and unused, `A+3`/`A+4` the loop variables.
            match generator_step(thread_ptr, base, instr.a())? {
                Some((k, v)) => {
                    set_reg(thread_ptr, base, instr.a() + 1, k);
                    set_reg(thread_ptr, base, instr.a() + 3, k);
                    set_reg(thread_ptr, base, instr.a() + 4, v);
                    advance_pc(thread_ptr, 1);
                }
                None => set_pc(thread_ptr, jump_target(pc, instr.d())),
            }
            Ok(StepResult::Continue)
        }
        Opcode::ForGeneratorLoop => {
            vm.gc_safepoint(thread_ptr)?;
            match generator_step(thread_ptr, base, instr.a())? {
                Some((k, v)) => {
                    set_reg(thread_ptr, base, instr.a() + 1, k);
                    set_reg(thread_ptr, base, instr.a() + 3, k);
                    set_reg(thread_ptr, base, instr.a() + 4, v);
                    set_pc(thread_ptr, jump_target(pc, instr.d()));
                }
                None => advance_pc(thread_ptr, 1),
            }
            Ok(StepResult::Continue)
        }
    }
}

fn key_to_plain(op: Opcode) -> Opcode {
    match op {
        Opcode::SubKey => Opcode::Sub,
        Opcode::MulKey => Opcode::Mul,
        Opcode::DivKey => Opcode::Div,
        Opcode::ModKey => Opcode::Mod,
        _ => unreachable!("key_to_plain only called for arithmetic *key opcodes"),
    }
}

fn dispatch_arith(vm: &Vm, thread_ptr: NonNull<Thread>, op: Opcode, lhs: Value, rhs: Value) -> RuntimeResult<Value> {
    match op {
        Opcode::Sub => arith(vm, thread_ptr, lhs, rhs, AbsenceFlags::SUB, |a, b| Ok(a - b)),
        Opcode::Mul => arith(vm, thread_ptr, lhs, rhs, AbsenceFlags::MUL, |a, b| Ok(a * b)),
        Opcode::Div => arith(vm, thread_ptr, lhs, rhs, AbsenceFlags::DIV, |a, b| Ok(a / b)),
        Opcode::Mod => arith(vm, thread_ptr, lhs, rhs, AbsenceFlags::MOD, |a, b| {
            if b == 0.0 {
                return Err(RuntimeError::DivideByZero { op: "mod" });
            }
            Ok(a - (a / b).floor() * b)
        }),
        Opcode::Pow => arith(vm, thread_ptr, lhs, rhs, AbsenceFlags::POW, |a, b| Ok(a.powf(b))),
        _ => unreachable!("dispatch_arith only called for Sub/Mul/Div/Mod/Pow"),
    }
}
