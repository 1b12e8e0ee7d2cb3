use script_vm::gc::{Heap, Phase};
use script_vm::object::{Table, UserData};
use script_vm::value::Value;
use script_vm::{Config, Vm};
use std::cell::Cell;
use std::rc::Rc;

#[test]
fn a_weak_values_table_loses_entries_whose_value_is_otherwise_unreachable() {
    let mut vm = Vm::new(Config::default());

    let weak_table = vm.new_table().as_ptr().unwrap().cast::<Table>();
    let meta = vm.new_table().as_ptr().unwrap().cast::<Table>();
    let mode_key = vm.new_string("__mode");
    let mode_value = vm.new_string("v");
    unsafe { &mut *meta.as_ptr() }.set(mode_key, mode_value);
    vm.set_metatable(weak_table, Some(meta));

    {
        let inner = vm.new_table().as_ptr().unwrap().cast::<Table>();
        unsafe { &mut *weak_table.as_ptr() }.set(Value::number(1.0), Value::from_ptr(inner.cast()));
        assert!(!unsafe { weak_table.as_ref() }.find(Value::number(1.0)).is_null());
    }
    // `inner` is now reachable only through the weak table.

    vm.collect_garbage();

    let slot = unsafe { weak_table.as_ref() }.find(Value::number(1.0));
    assert!(slot.is_null(), "weakly-held value should be cleared after a full cycle");
}

#[test]
fn a_table_with_no_mode_entry_keeps_its_values_reachable_through_ordinary_marking() {
    let mut vm = Vm::new(Config::default());

    let table_value = vm.new_table();
    let table = table_value.as_ptr().unwrap().cast::<Table>();
    let meta = vm.new_table().as_ptr().unwrap().cast::<Table>();
    vm.set_metatable(table, Some(meta));
    let root_key = vm.new_string("rooted_non_weak_table");
    unsafe { &mut *vm.globals().as_ptr() }.set(root_key, table_value);

    {
        let inner = vm.new_table();
        unsafe { &mut *table.as_ptr() }.set(Value::number(1.0), inner);
    }

    vm.collect_garbage();

    // No `__mode` on `meta`, so `register_weak_table` was never called for
    // `table`: its value at key 1 is an ordinary strong reference and must
    // survive as long as `table` itself is reachable from the globals root.
    let slot = unsafe { table.as_ref() }.find(Value::number(1.0));
    assert!(!slot.is_null(), "a non-weak table must keep its values alive");
}

#[test]
fn root_then_collect_keeps_a_globals_reachable_table_alive() {
    let mut vm = Vm::new(Config::default());
    let key = vm.new_string("persisted");
    let table = vm.new_table();
    unsafe { &mut *vm.globals().as_ptr() }.set(key, table);

    vm.collect_garbage();
    vm.collect_garbage();

    let found = unsafe { vm.globals().as_ref() }.find(key);
    assert!(!found.is_null());
    assert_eq!(found, table);
}

fn run_full_cycle(heap: &Heap, root: Value) {
    heap.mark_root(root.as_ptr().expect("root value must be a heap pointer"));
    loop {
        heap.step();
        if heap.phase() == Phase::Pause {
            break;
        }
    }
}

#[test]
fn an_unreachable_finalizable_userdata_survives_one_cycle_then_runs_its_destructor() {
    let heap = Heap::new(&Config::default());
    let ran_count = Rc::new(Cell::new(0u32));
    let ran_count_in_destructor = ran_count.clone();

    let mut ud = UserData::new(0, Vec::new(), heap.current_white());
    ud.destructor = Some(Rc::new(move |_bytes: &mut [u8]| {
        ran_count_in_destructor.set(ran_count_in_destructor.get() + 1);
    }));
    heap.alloc_userdata(ud, true);
    // Never rooted: dead from the very first cycle.

    let root_table = Value::from_ptr(heap.alloc_table().cast::<script_vm::object::Header>());

    // First cycle: the collector finds the userdata dead but, since it was
    // registered as finalizable, queues it instead of freeing it outright.
    run_full_cycle(&heap, root_table);
    assert_eq!(ran_count.get(), 0, "destructor must not run until run_finalizers is called");

    heap.run_finalizers();
    assert_eq!(ran_count.get(), 1, "destructor should run exactly once after being queued");

    // Second cycle: the object is no longer in the finalizable list, so it
    // is freed for real this time; its destructor must not run again.
    run_full_cycle(&heap, root_table);
    heap.run_finalizers();
    assert_eq!(ran_count.get(), 1, "a freed userdata's destructor must not run a second time");
}
