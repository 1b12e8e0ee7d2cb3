use script_vm::error::RuntimeResult;
use script_vm::object::Table;
use script_vm::value::Value;
use script_vm::{Config, Vm};

fn call_source(vm: &mut Vm, source: &str) -> Vec<Value> {
    let closure = vm.load_source(source).expect("load_source should succeed");
    vm.call(closure, &[]).expect("call should succeed")
}

#[test]
fn numeric_for_with_break_stops_at_the_requested_count() {
    let mut vm = Vm::new(Config::default());
    let results = call_source(
        &mut vm,
        "local sum = 0\n\
         for i = 1, 10 do\n\
         \u{20}\u{20}if i == 4 then\n\
         \u{20}\u{20}\u{20}\u{20}break\n\
         \u{20}\u{20}end\n\
         \u{20}\u{20}sum += i\n\
         end\n\
         return sum\n",
    );
    // 1 + 2 + 3, loop breaks before adding 4.
    assert_eq!(results, vec![Value::number(6.0)]);
}

#[test]
fn closure_captures_an_upvalue_by_reference_across_calls() {
    let mut vm = Vm::new(Config::default());
    let results = call_source(
        &mut vm,
        "local function make()\n\
         \u{20}\u{20}local count = 0\n\
         \u{20}\u{20}return function()\n\
         \u{20}\u{20}\u{20}\u{20}count += 1\n\
         \u{20}\u{20}\u{20}\u{20}return count\n\
         \u{20}\u{20}end\n\
         end\n\
         local f = make()\n\
         local a = f()\n\
         local b = f()\n\
         local c = f()\n\
         return a, b, c\n",
    );
    assert_eq!(results, vec![Value::number(1.0), Value::number(2.0), Value::number(3.0)]);
}

#[test]
fn two_independent_closures_over_the_same_maker_do_not_share_state() {
    let mut vm = Vm::new(Config::default());
    let results = call_source(
        &mut vm,
        "local function make()\n\
         \u{20}\u{20}local count = 0\n\
         \u{20}\u{20}return function()\n\
         \u{20}\u{20}\u{20}\u{20}count += 1\n\
         \u{20}\u{20}\u{20}\u{20}return count\n\
         \u{20}\u{20}end\n\
         end\n\
         local f = make()\n\
         local g = make()\n\
         f()\n\
         f()\n\
         return f(), g()\n",
    );
    assert_eq!(results, vec![Value::number(3.0), Value::number(1.0)]);
}

#[test]
fn metamethod_add_is_dispatched_through_the_left_operands_metatable() {
    let mut vm = Vm::new(Config::default());
    vm.register_host_function("add_impl", |args: &[Value]| -> RuntimeResult<Vec<Value>> {
        let lhs = args[0].as_number().unwrap_or(0.0);
        let rhs = args[1].as_number().unwrap_or(0.0);
        Ok(vec![Value::number(lhs + rhs)])
    });
    let add_fn = unsafe { vm.globals().as_ref() }.find(vm.new_string("add_impl"));
    assert!(!add_fn.is_null(), "add_impl should have registered into globals");

    let table_value = vm.new_table();
    let table = table_value.as_ptr().unwrap().cast::<Table>();
    let meta = vm.new_table().as_ptr().unwrap().cast::<Table>();
    let add_key = vm.new_string("__add");
    unsafe { &mut *meta.as_ptr() }.set(add_key, add_fn);
    vm.set_metatable(table, Some(meta));

    let t_key = vm.new_string("t");
    unsafe { &mut *vm.globals().as_ptr() }.set(t_key, table_value);

    let results = call_source(&mut vm, "return t + 41\n");
    assert_eq!(results, vec![Value::number(42.0)]);
}

#[test]
fn repeat_until_runs_the_body_at_least_once() {
    let mut vm = Vm::new(Config::default());
    let results = call_source(
        &mut vm,
        "local n = 0\n\
         repeat\n\
         \u{20}\u{20}n += 1\n\
         until n >= 3\n\
         return n\n",
    );
    assert_eq!(results, vec![Value::number(3.0)]);
}

#[test]
fn elif_chains_select_the_first_matching_branch() {
    let mut vm = Vm::new(Config::default());
    let results = call_source(
        &mut vm,
        "local function classify(n)\n\
         \u{20}\u{20}if n < 0 then\n\
         \u{20}\u{20}\u{20}\u{20}return \"negative\"\n\
         \u{20}\u{20}elif n == 0 then\n\
         \u{20}\u{20}\u{20}\u{20}return \"zero\"\n\
         \u{20}\u{20}else\n\
         \u{20}\u{20}\u{20}\u{20}return \"positive\"\n\
         \u{20}\u{20}end\n\
         end\n\
         return classify(-1), classify(0), classify(5)\n",
    );
    assert_eq!(results.len(), 3);
    assert_eq!(vm.as_str(results[0]).as_deref(), Some("negative"));
    assert_eq!(vm.as_str(results[1]).as_deref(), Some("zero"));
    assert_eq!(vm.as_str(results[2]).as_deref(), Some("positive"));
}

#[test]
fn generic_for_over_pairs_visits_every_entry_exactly_once() {
    let mut vm = Vm::new(Config::default());
    let results = call_source(
        &mut vm,
        "local t = {}\n\
         t[1] = 10\n\
         t[2] = 20\n\
         t[3] = 30\n\
         local sum = 0\n\
         local count = 0\n\
         for k, v in pairs(t) do\n\
         \u{20}\u{20}sum += v\n\
         \u{20}\u{20}count += 1\n\
         end\n\
         return sum, count\n",
    );
    assert_eq!(results, vec![Value::number(60.0), Value::number(3.0)]);
}

#[test]
fn generic_for_over_ipairs_with_a_single_loop_variable_still_reserves_the_value_slot() {
    let mut vm = Vm::new(Config::default());
    let results = call_source(
        &mut vm,
        "local t = {}\n\
         t[1] = \"a\"\n\
         t[2] = \"b\"\n\
         local count = 0\n\
         for k in ipairs(t) do\n\
         \u{20}\u{20}count += 1\n\
         end\n\
         return count\n",
    );
    assert_eq!(results, vec![Value::number(2.0)]);
}

#[test]
fn generic_for_breaks_out_early_through_the_fast_path_opcodes() {
    let mut vm = Vm::new(Config::default());
    let results = call_source(
        &mut vm,
        "local t = {}\n\
         t[1] = 1\n\
         t[2] = 1\n\
         t[3] = 1\n\
         local count = 0\n\
         for k, v in pairs(t) do\n\
         \u{20}\u{20}count += 1\n\
         \u{20}\u{20}if count == 2 then\n\
         \u{20}\u{20}\u{20}\u{20}break\n\
         \u{20}\u{20}end\n\
         end\n\
         return count\n",
    );
    assert_eq!(results, vec![Value::number(2.0)]);
}

#[test]
fn generic_for_over_an_empty_table_runs_the_body_zero_times() {
    let mut vm = Vm::new(Config::default());
    let results = call_source(
        &mut vm,
        "local t = {}\n\
         local count = 0\n\
         for k, v in pairs(t) do\n\
         \u{20}\u{20}count += 1\n\
         end\n\
         return count\n",
    );
    assert_eq!(results, vec![Value::number(0.0)]);
}

#[test]
fn generic_for_with_an_explicit_iterator_triple_still_uses_the_general_call_based_lowering() {
    let mut vm = Vm::new(Config::default());
    let results = call_source(
        &mut vm,
        "local function counter(limit, i)\n\
         \u{20}\u{20}i += 1\n\
         \u{20}\u{20}if i > limit then\n\
         \u{20}\u{20}\u{20}\u{20}return\n\
         \u{20}\u{20}end\n\
         \u{20}\u{20}return i, i * i\n\
         end\n\
         local sum = 0\n\
         for i, sq in counter, 3, 0 do\n\
         \u{20}\u{20}sum += sq\n\
         end\n\
         return sum\n",
    );
    // squares of 1, 2, 3
    assert_eq!(results, vec![Value::number(14.0)]);
}
