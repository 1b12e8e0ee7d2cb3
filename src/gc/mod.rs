//! Tri-color incremental mark-sweep collector (§4.6), grounded on the
//! mark-bit scheme in the original C++ implementation's `object.hpp` and
//! wired the way the teacher threads GC bookkeeping through its
//! `Interpreter`'s owning struct.

mod barrier;
mod trace;

pub use barrier::{barrier_backward, barrier_forward};

use crate::config::Config;
use crate::object::{
    Closure, GalString, Header, ObjectKind, Table, Thread, Upvalue, UserData,
};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ptr::NonNull;
use tracing::debug;

/// Collector state machine (§4.6 "States").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pause,
    Propagate,
    Atomic,
    Sweep,
}

/// Owns every GC-managed object and drives the collector. One `Heap` backs
/// a whole [`crate::vm::Vm`] (all threads share it, per §5 "The global
/// object list and GC metadata belong to the main state").
pub struct Heap {
    current_white: Cell<u8>,
    phase: Cell<Phase>,
    all_objects: Cell<Option<NonNull<Header>>>,
    gray: RefCell<Vec<NonNull<Header>>>,
    /// Tables repainted via the backward write barrier, swept in the
    /// atomic phase instead of being re-marked immediately (§4.6 "A
    /// backward variant exists for tables").
    gray_again: RefCell<Vec<NonNull<Table>>>,
    weak_tables: RefCell<Vec<NonNull<Table>>>,
    /// Content -> pointer intern table (§3 invariant 2, "interned strings
    /// with equal bytes are pointer-equal"). Entries are removed as their
    /// string is swept so this never holds a dangling pointer.
    strings: RefCell<HashMap<Box<[u8]>, NonNull<GalString>>>,
    finalizable: RefCell<Vec<NonNull<UserData>>>,
    to_finalize: RefCell<Vec<NonNull<UserData>>>,
    sweep_cursor: Cell<Option<NonNull<Header>>>,
    bytes_allocated: Cell<usize>,
    threshold: Cell<usize>,
    pause_percent: u32,
    step_multiplier_percent: u32,
}

const WHITE0: u8 = 1;

impl Heap {
    pub fn new(config: &Config) -> Self {
        Self {
            current_white: Cell::new(WHITE0),
            phase: Cell::new(Phase::Pause),
            all_objects: Cell::new(None),
            gray: RefCell::new(Vec::new()),
            gray_again: RefCell::new(Vec::new()),
            weak_tables: RefCell::new(Vec::new()),
            strings: RefCell::new(HashMap::new()),
            finalizable: RefCell::new(Vec::new()),
            to_finalize: RefCell::new(Vec::new()),
            sweep_cursor: Cell::new(None),
            bytes_allocated: Cell::new(0),
            threshold: Cell::new(1024),
            pause_percent: config.gc_pause_percent,
            step_multiplier_percent: config.gc_step_multiplier_percent,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase.get()
    }

    pub fn current_white(&self) -> u8 {
        self.current_white.get()
    }

    fn link(&self, header: &Header) {
        header.next.set(self.all_objects.get());
    }

    fn track_allocation(&self, size: usize) {
        self.bytes_allocated.set(self.bytes_allocated.get() + size);
        if self.bytes_allocated.get() >= self.threshold.get() {
            self.step();
        }
    }

    /// Intern `bytes`: an existing live string with the same content is
    /// returned unchanged, otherwise a new one is allocated and recorded
    /// (§3 invariant 2).
    pub fn alloc_string(&self, bytes: impl Into<Box<[u8]>>) -> NonNull<GalString> {
        let bytes = bytes.into();
        if let Some(existing) = self.strings.borrow().get(bytes.as_ref()) {
            return *existing;
        }
        let obj = Box::new(GalString::new(bytes.clone(), self.current_white.get()));
        let size = std::mem::size_of::<GalString>();
        let ptr = self.finish_alloc(obj, size);
        self.strings.borrow_mut().insert(bytes, ptr);
        ptr
    }

    pub fn alloc_table(&self) -> NonNull<Table> {
        let obj = Box::new(Table::new(self.current_white.get()));
        let size = std::mem::size_of::<Table>();
        self.finish_alloc(obj, size)
    }

    pub fn alloc_closure(&self, closure: Closure) -> NonNull<Closure> {
        let size = std::mem::size_of::<Closure>();
        self.finish_alloc(Box::new(closure), size)
    }

    pub fn alloc_upvalue(&self, upvalue: Upvalue) -> NonNull<Upvalue> {
        let size = std::mem::size_of::<Upvalue>();
        self.finish_alloc(Box::new(upvalue), size)
    }

    pub fn alloc_userdata(&self, ud: UserData, finalizable: bool) -> NonNull<UserData> {
        let size = std::mem::size_of::<UserData>();
        let ptr = self.finish_alloc(Box::new(ud), size);
        if finalizable {
            self.finalizable.borrow_mut().push(ptr);
        }
        ptr
    }

    pub fn alloc_thread(&self, thread: Thread) -> NonNull<Thread> {
        let size = std::mem::size_of::<Thread>();
        self.finish_alloc(Box::new(thread), size)
    }

    fn finish_alloc<T>(&self, boxed: Box<T>, size: usize) -> NonNull<T>
    where
        T: HasHeader,
    {
        let ptr = NonNull::new(Box::into_raw(boxed)).expect("Box::into_raw is never null");
        // SAFETY: `ptr` was just leaked from a live `Box<T>`; `T` is
        // `#[repr(C)]` with `header` as its first field, so the address is
        // identical when viewed as `Header`.
        let header_ptr = ptr.cast::<Header>();
        self.link(unsafe { header_ptr.as_ref() });
        self.all_objects.set(Some(header_ptr));
        self.track_allocation(size);
        ptr
    }

    pub fn register_weak_table(&self, table: NonNull<Table>) {
        self.weak_tables.borrow_mut().push(table);
    }

    /// Root a gray object for the propagation phase, starting a new cycle
    /// if the collector is idle.
    pub fn mark_root(&self, ptr: NonNull<Header>) {
        if self.phase.get() == Phase::Pause {
            debug!("gc: pause -> propagate");
            self.phase.set(Phase::Propagate);
        }
        trace::mark_gray(ptr, &mut self.gray.borrow_mut());
    }

    pub fn barrier_forward_root(&self, from: &Header, to: Option<NonNull<Header>>) {
        barrier::barrier_forward(from, to, &mut self.gray.borrow_mut());
    }

    pub fn barrier_backward_table(&self, table: NonNull<Table>) {
        barrier::barrier_backward(table, &mut self.gray_again.borrow_mut());
    }

    /// Perform one bounded unit of incremental work, advancing the state
    /// machine when its current phase completes (§4.6 "Allocation
    /// accounting").
    pub fn step(&self) {
        let work_budget = (self.bytes_allocated.get() * self.step_multiplier_percent as usize / 100).max(1);
        match self.phase.get() {
            Phase::Pause => {}
            Phase::Propagate => self.propagate_step(work_budget),
            Phase::Atomic => self.run_atomic(),
            Phase::Sweep => self.sweep_step(work_budget),
        }
    }

    fn propagate_step(&self, budget: usize) {
        let mut gray = self.gray.borrow_mut();
        let mut done = 0;
        while done < budget {
            let Some(ptr) = gray.pop() else {
                drop(gray);
                debug!("gc: propagate -> atomic");
                self.phase.set(Phase::Atomic);
                self.run_atomic();
                return;
            };
            // SAFETY: every pointer pushed onto `gray` came from
            // `mark_root`/`barrier_forward`, both of which only accept
            // pointers into this heap's live object list.
            let header = unsafe { ptr.as_ref() };
            if header.is_black() || header.is_white() {
                continue;
            }
            header.mark_black();
            trace::trace_children(ptr, &mut gray);
            done += 1;
        }
    }

    fn run_atomic(&self) {
        // Re-mark anything recorded by the backward table barrier.
        for table in self.gray_again.borrow_mut().drain(..) {
            let header = unsafe { table.cast::<Header>().as_ref() };
            header.mark_black();
            let mut gray = self.gray.borrow_mut();
            trace::trace_table(table, &mut gray);
            while let Some(p) = gray.pop() {
                let h = unsafe { p.as_ref() };
                if h.is_black() {
                    continue;
                }
                h.mark_black();
                trace::trace_children(p, &mut gray);
            }
        }

        self.clear_dead_weak_entries();

        debug!("gc: atomic -> sweep");
        self.phase.set(Phase::Sweep);
        self.sweep_cursor.set(self.all_objects.get());
    }

    fn clear_dead_weak_entries(&self) {
        let current_white = self.current_white.get();
        for table_ptr in self.weak_tables.borrow().iter() {
            let table = unsafe { &mut *table_ptr.as_ptr() };
            let dead: Vec<_> = table
                .iter()
                .filter(|(_, v)| {
                    v.as_ptr()
                        .map(|p| unsafe { p.as_ref() }.is_dead(current_white))
                        .unwrap_or(false)
                })
                .map(|(k, _)| k)
                .collect();
            for k in dead {
                table.set(k, crate::value::Value::NULL);
            }
        }
    }

    fn sweep_step(&self, budget: usize) {
        let mut done = 0;
        let mut cursor = self.sweep_cursor.get();
        let current_white = self.current_white.get();

        while done < budget {
            let Some(ptr) = cursor else {
                self.finish_cycle();
                return;
            };
            let header = unsafe { ptr.as_ref() };
            let next = header.next.get();
            if header.is_dead(current_white) {
                if header.kind == ObjectKind::Str {
                    let s = unsafe { ptr.cast::<GalString>().as_ref() };
                    self.strings.borrow_mut().remove(s.as_bytes());
                }
                let mut queued_for_finalization = false;
                if header.kind == ObjectKind::UserData {
                    let ud_ptr = ptr.cast::<UserData>();
                    let mut finalizable = self.finalizable.borrow_mut();
                    if let Some(pos) = finalizable.iter().position(|&p| p == ud_ptr) {
                        finalizable.remove(pos);
                        drop(finalizable);
                        // Kept alive for one more cycle (§4.6 "Finalizers"):
                        // grant it the current white so this sweep and the
                        // next do not consider it dead again until
                        // `run_finalizers` has actually run its destructor.
                        header.mark_current_white(current_white);
                        self.to_finalize.borrow_mut().push(ud_ptr);
                        queued_for_finalization = true;
                    }
                }
                if !queued_for_finalization {
                    // SAFETY: dead means unreachable from every traced root
                    // this cycle; nothing else holds a pointer to it.
                    unsafe { trace::free(ptr) };
                }
            } else {
                header.mark_current_white(current_white);
            }
            cursor = next;
            done += 1;
        }
        self.sweep_cursor.set(cursor);
    }

    fn finish_cycle(&self) {
        self.current_white.set(crate::object::header::other_white(self.current_white.get()));
        self.phase.set(Phase::Pause);
        let live = self.bytes_allocated.get();
        self.threshold.set(live.saturating_add(live * self.pause_percent as usize / 100).max(1024));
        debug!(live_bytes = live, next_threshold = self.threshold.get(), "gc: sweep -> pause");
    }

    /// Run every finalizer queued from the previous cycle's sweep, in
    /// FIFO order (§4.6 "Finalizers").
    pub fn run_finalizers(&self) {
        let pending: Vec<_> = self.to_finalize.borrow_mut().drain(..).collect();
        for mut ptr in pending {
            unsafe { ptr.as_mut() }.run_destructor();
        }
    }
}

/// Implemented by every object kind so the heap can allocate it behind a
/// `Header`-prefixed pointer.
pub(crate) trait HasHeader {
    fn kind() -> ObjectKind;
}

impl HasHeader for GalString {
    fn kind() -> ObjectKind {
        ObjectKind::Str
    }
}
impl HasHeader for Table {
    fn kind() -> ObjectKind {
        ObjectKind::Table
    }
}
impl HasHeader for Closure {
    fn kind() -> ObjectKind {
        ObjectKind::Closure
    }
}
impl HasHeader for Upvalue {
    fn kind() -> ObjectKind {
        ObjectKind::Upvalue
    }
}
impl HasHeader for UserData {
    fn kind() -> ObjectKind {
        ObjectKind::UserData
    }
}
impl HasHeader for Thread {
    fn kind() -> ObjectKind {
        ObjectKind::Thread
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_heap_starts_paused() {
        let heap = Heap::new(&Config::default());
        assert_eq!(heap.phase(), Phase::Pause);
    }

    #[test]
    fn allocating_a_table_links_it_into_the_object_list() {
        let heap = Heap::new(&Config::default());
        let t = heap.alloc_table();
        assert!(heap.all_objects.get().is_some());
        let _ = t;
    }

    #[test]
    fn alloc_string_interns_equal_content_to_the_same_pointer() {
        let heap = Heap::new(&Config::default());
        let a = heap.alloc_string(b"hello".to_vec());
        let b = heap.alloc_string(b"hello".to_vec());
        assert_eq!(a, b);
    }

    #[quickcheck_macros::quickcheck]
    fn alloc_string_is_pointer_equal_for_any_equal_byte_sequence(bytes: Vec<u8>) -> bool {
        let heap = Heap::new(&Config::default());
        heap.alloc_string(bytes.clone()) == heap.alloc_string(bytes)
    }

    #[test]
    fn a_swept_strings_slot_is_reusable_by_a_later_alloc_with_the_same_bytes() {
        let heap = Heap::new(&Config::default());
        let first = heap.alloc_string(b"temp".to_vec());
        // `first` is allocated current-white, so it survives the cycle it
        // was born into regardless of rooting; a second cycle is needed
        // before its (never-marked) color reads as dead.
        for _ in 0..2 {
            heap.mark_root(heap.alloc_table().cast());
            while heap.phase() != Phase::Pause {
                heap.step();
            }
        }
        let second = heap.alloc_string(b"temp".to_vec());
        assert_ne!(first, second);
        assert!(heap.strings.borrow().contains_key(b"temp".as_slice()));
    }

    #[test]
    fn root_then_full_cycle_keeps_reachable_table_alive() {
        let heap = Heap::new(&Config::default());
        let t = heap.alloc_table();
        heap.mark_root(t.cast());
        while heap.phase() != Phase::Pause {
            heap.step();
        }
        // SAFETY: still linked, never swept (it was reachable every cycle).
        assert!(!unsafe { t.cast::<Header>().as_ref() }.is_dead(heap.current_white()));
    }
}
