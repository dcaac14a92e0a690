//! Precise tracing mark-sweep garbage collector.
//!
//! `Heap` owns every object allocation (an intrusive singly-linked "all
//! objects" list for sweeping) and the string-interning table. It knows
//! nothing about the VM's stack, call frames or compiler state: root
//! discovery is the caller's job (see `vm::VM::collect_garbage`), so that no
//! behavior here depends on VM singleton-ness.
//!
//! Mark-sweep, rather than an arena with bulk free, is required because the
//! object graph is cyclic: closures reference upvalues which may reference
//! the stack or a closed-over value that itself reaches back into a class's
//! method table, and classes reference superclasses that reference their own
//! method closures. An arena can only free everything at once; a tracing
//! collector is what lets individual dead objects be reclaimed while live
//! ones (possibly cyclically linked) survive.

use std::cell::Cell;
use std::ptr::NonNull;

use tracing::debug;

use crate::object::{
    Obj, ObjBoundMethod, ObjClosure, ObjFunction, ObjHeader, ObjInstance, ObjKind, ObjNative,
    ObjString, UpvalueState,
};
use crate::table::Table;
use crate::value::Value;

/// Initial GC threshold, matching the reference implementation's starting
/// `nextGC` (it then doubles on every cycle).
const INITIAL_NEXT_GC: usize = 1024 * 1024;

pub struct Heap {
    objects: Option<NonNull<ObjHeader>>,
    strings: Table,
    gray_stack: Vec<Obj>,
    pub bytes_allocated: usize,
    pub next_gc: usize,
    /// When set, every allocation collects first (the reference
    /// implementation's debug-stress-GC build flag, exposed here as a
    /// runtime option instead of a cfg so tests can toggle it).
    pub stress_gc: bool,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            objects: None,
            strings: Table::new(),
            gray_stack: Vec::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
            stress_gc: false,
        }
    }

    pub fn should_collect(&self) -> bool {
        self.stress_gc || self.bytes_allocated > self.next_gc
    }

    /// Allocates `kind` onto the all-objects list. Does not itself trigger
    /// collection — see the module docs and `vm::VM` call sites for the
    /// "root it on the stack before the next allocation" discipline this
    /// requires of callers.
    pub fn allocate(&mut self, kind: ObjKind) -> Obj {
        let size = object_size(&kind);
        let boxed = Box::new(ObjHeader {
            marked: Cell::new(false),
            next: Cell::new(self.objects),
            kind,
        });
        let ptr = NonNull::new(Box::into_raw(boxed)).expect("Box::into_raw is never null");
        self.objects = Some(ptr);
        self.bytes_allocated += size;
        unsafe { Obj::from_raw(ptr) }
    }

    /// Interns `text`: returns the existing canonical string if an
    /// equal-content one is already interned, otherwise allocates one and
    /// records it. Content-equal strings are therefore always the same
    /// object after this call.
    pub fn intern_string(&mut self, text: &str) -> Obj {
        let hash = crate::object::fnv1a(text.as_bytes());
        if let Some(existing) = self.strings.find_string(text, hash) {
            return existing;
        }
        let obj = self.allocate(ObjKind::String(ObjString::new(text)));
        self.strings.set(obj, Value::Nil);
        obj
    }

    pub fn globals_capacity_hint(&self) -> usize {
        self.strings.len()
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(obj) = value {
            self.mark_object(obj);
        }
    }

    pub fn mark_object(&mut self, obj: Obj) {
        if obj.header().marked.get() {
            return;
        }
        obj.header().marked.set(true);
        self.gray_stack.push(obj);
    }

    /// Drains the gray worklist, blackening each object (marking gray
    /// everything it references) until nothing is left.
    pub fn trace_references(&mut self) {
        while let Some(obj) = self.gray_stack.pop() {
            self.blacken(obj);
        }
    }

    fn blacken(&mut self, obj: Obj) {
        match obj.kind() {
            ObjKind::String(_) | ObjKind::Native(_) => {}
            ObjKind::Function(func) => {
                if let Some(name) = func.name {
                    self.mark_object(name);
                }
                for constant in &func.chunk.constants {
                    self.mark_value(*constant);
                }
            }
            ObjKind::Closure(closure) => {
                self.mark_object(closure.function);
                for upvalue in &closure.upvalues {
                    self.mark_object(*upvalue);
                }
            }
            ObjKind::Upvalue(cell) => {
                // Safe whether open or closed: the open case is also
                // covered by the stack roots; the closed case is the only
                // place the value is reachable from.
                if let UpvalueState::Closed(value) = &*cell.borrow() {
                    self.mark_value(*value);
                }
            }
            ObjKind::Class(class) => {
                let class = class.borrow();
                self.mark_object(class.name);
                if let Some(superclass) = class.superclass {
                    self.mark_object(superclass);
                }
                let methods: Vec<(Obj, Value)> = class.methods.iter().collect();
                drop(class);
                for (key, value) in methods {
                    self.mark_object(key);
                    self.mark_value(value);
                }
            }
            ObjKind::Instance(instance) => {
                let instance = instance.borrow();
                self.mark_object(instance.class);
                let fields: Vec<(Obj, Value)> = instance.fields.iter().collect();
                drop(instance);
                for (key, value) in fields {
                    self.mark_object(key);
                    self.mark_value(value);
                }
            }
            ObjKind::BoundMethod(bound) => {
                self.mark_value(bound.receiver);
                self.mark_object(bound.method);
            }
        }
    }

    /// Weak-set cleanup: the string table holds non-owning references, so
    /// any string that didn't get marked this cycle must be dropped from it
    /// before sweep actually frees the underlying object — otherwise the
    /// table would dangle.
    pub fn remove_white_strings(&mut self) {
        self.strings.remove_white();
    }

    /// Frees every unmarked object and clears the mark bit on survivors.
    pub fn sweep(&mut self) -> usize {
        let mut previous: Option<NonNull<ObjHeader>> = None;
        let mut current = self.objects;
        let mut freed = 0;

        while let Some(ptr) = current {
            let header = unsafe { ptr.as_ref() };
            if header.marked.get() {
                header.marked.set(false);
                previous = Some(ptr);
                current = header.next.get();
            } else {
                let next = header.next.get();
                match previous {
                    Some(prev) => unsafe { prev.as_ref().next.set(next) },
                    None => self.objects = next,
                }
                current = next;
                self.free_object(ptr);
                freed += 1;
            }
        }
        freed
    }

    fn free_object(&mut self, ptr: NonNull<ObjHeader>) {
        let size = object_size(&unsafe { ptr.as_ref() }.kind);
        self.bytes_allocated = self.bytes_allocated.saturating_sub(size);
        unsafe {
            drop(Box::from_raw(ptr.as_ptr()));
        }
    }

    /// Runs one full mark-sweep cycle. `mark_roots` is supplied by the
    /// caller (the VM, which alone knows its stack/frames/globals/open
    /// upvalues, and the compiler, which knows its in-progress function
    /// chain) and must mark every root via `mark_value`/`mark_object`.
    pub fn collect_garbage(&mut self, mark_roots: impl FnOnce(&mut Heap)) {
        let before = self.bytes_allocated;
        mark_roots(self);
        self.trace_references();
        self.remove_white_strings();
        let freed = self.sweep();
        self.next_gc = self.bytes_allocated * 2;
        debug!(
            target: "luma_core::gc",
            bytes_before = before,
            bytes_after = self.bytes_allocated,
            freed,
            next_gc = self.next_gc,
            "garbage collection cycle"
        );
    }

    /// Frees every object unconditionally, used on VM teardown.
    pub fn free_all(&mut self) {
        let mut current = self.objects.take();
        while let Some(ptr) = current {
            let next = unsafe { ptr.as_ref() }.next.get();
            unsafe {
                drop(Box::from_raw(ptr.as_ptr()));
            }
            current = next;
        }
        self.bytes_allocated = 0;
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.free_all();
    }
}

fn object_size(kind: &ObjKind) -> usize {
    use std::mem::size_of;
    match kind {
        ObjKind::String(s) => size_of::<ObjString>() + s.as_str().len(),
        ObjKind::Function(_) => size_of::<ObjFunction>(),
        ObjKind::Closure(c) => size_of::<ObjClosure>() + c.upvalues.len() * size_of::<Obj>(),
        ObjKind::Upvalue(_) => size_of::<UpvalueState>(),
        ObjKind::Native(_) => size_of::<ObjNative>(),
        ObjKind::Class(_) => size_of::<crate::object::ObjClass>(),
        ObjKind::Instance(_) => size_of::<ObjInstance>(),
        ObjKind::BoundMethod(_) => size_of::<ObjBoundMethod>(),
    }
}
