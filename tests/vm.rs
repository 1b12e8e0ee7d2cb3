use script_vm::error::RuntimeResult;
use script_vm::object::Table;
use script_vm::value::Value;
use script_vm::{Config, Vm};

fn call_source(vm: &mut Vm, source: &str) -> Vec<Value> {
    let closure = vm.load_source(source).expect("load_source should succeed");
    vm.call(closure, &[]).expect("call should succeed")
}

#[test]
fn a_loaded_chunk_returns_its_computed_value() {
    let mut vm = Vm::new(Config::default());
    let results = call_source(&mut vm, "return 1 + 2\n");
    assert_eq!(results, vec![Value::number(3.0)]);
}

#[test]
fn a_registered_host_function_is_callable_from_a_script() {
    let mut vm = Vm::new(Config::default());
    vm.register_host_function("double", |args: &[Value]| -> RuntimeResult<Vec<Value>> {
        let n = args[0].as_number().unwrap_or(0.0);
        Ok(vec![Value::number(n * 2.0)])
    });
    let results = call_source(&mut vm, "return double(21)\n");
    assert_eq!(results, vec![Value::number(42.0)]);
}

#[test]
fn new_string_round_trips_through_as_str() {
    let vm = Vm::new(Config::default());
    let v = vm.new_string("hello");
    assert_eq!(vm.as_str(v).as_deref(), Some("hello"));
}

#[test]
fn new_table_is_a_fresh_empty_table_value() {
    let vm = Vm::new(Config::default());
    let v = vm.new_table();
    let ptr = v.as_ptr().expect("table value has a pointer").cast::<Table>();
    assert!(unsafe { ptr.as_ref() }.is_empty());
}

#[test]
fn collect_garbage_runs_a_full_cycle_without_freeing_rooted_globals() {
    let vm = Vm::new(Config::default());
    let key = vm.new_string("unreachable_after_this_statement");
    let _ = key; // only reachable via this local, never stored into globals
    vm.collect_garbage();
    vm.collect_garbage();
    // the fixed, always-rooted globals table must still be a live table.
    assert!(unsafe { vm.globals().as_ref() }.is_empty());
}

#[test]
fn set_metatable_attaches_the_table_and_is_observable_through_find() {
    let vm = Vm::new(Config::default());
    let table = vm.new_table().as_ptr().unwrap().cast::<Table>();
    let meta = vm.new_table().as_ptr().unwrap().cast::<Table>();
    let key = vm.new_string("__index");
    unsafe { &mut *meta.as_ptr() }.set(key, Value::number(7.0));

    vm.set_metatable(table, Some(meta));

    let attached = unsafe { table.as_ref() }.metatable.expect("metatable should be set");
    assert_eq!(attached.cast::<Table>(), meta);
}
