//! Heap objects.
//!
//! Every heap object carries a GC mark bit and an intrusive "next in the
//! all-objects list" link (`ObjHeader`), and is represented by one variant of
//! the tagged `ObjKind` sum rather than by a trait object — this keeps GC
//! tracing, printing and calling a single exhaustive match per concern
//! instead of a vtable per type (see the "Dynamic dispatch over object kind"
//! design note).

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

use crate::chunk::Chunk;
use crate::native::NativeFn;
use crate::table::Table;
use crate::value::Value;

/// Every heap allocation is one `ObjHeader`, owned by the `Heap` (see
/// `gc.rs`) and referenced everywhere else through the `Obj` handle below.
pub struct ObjHeader {
    pub marked: Cell<bool>,
    pub next: Cell<Option<NonNull<ObjHeader>>>,
    pub kind: ObjKind,
}

pub enum ObjKind {
    String(ObjString),
    Function(ObjFunction),
    Closure(ObjClosure),
    Upvalue(RefCell<UpvalueState>),
    Native(ObjNative),
    Class(RefCell<ObjClass>),
    Instance(RefCell<ObjInstance>),
    BoundMethod(ObjBoundMethod),
}

impl ObjKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjKind::String(_) => "string",
            ObjKind::Function(_) => "function",
            ObjKind::Closure(_) => "closure",
            ObjKind::Upvalue(_) => "upvalue",
            ObjKind::Native(_) => "native function",
            ObjKind::Class(_) => "class",
            ObjKind::Instance(_) => "instance",
            ObjKind::BoundMethod(_) => "bound method",
        }
    }
}

/// An immutable, interned byte sequence. Two strings with equal content are,
/// after interning, the same `ObjString` (and therefore the same `Obj`).
pub struct ObjString {
    data: Box<str>,
    pub hash: u32,
}

impl ObjString {
    pub fn new(data: impl Into<Box<str>>) -> Self {
        let data = data.into();
        let hash = fnv1a(data.as_bytes());
        ObjString { data, hash }
    }

    pub fn as_str(&self) -> &str {
        &self.data
    }
}

/// FNV-1a, 32-bit, matching the reference implementation's string hash.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// A compiled code unit: bytecode + constants + line map, arity, and upvalue
/// count. Functions are produced once by the compiler and then shared by
/// every closure built from them.
pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
    pub name: Option<Obj>,
}

impl ObjFunction {
    pub fn new(name: Option<Obj>) -> Self {
        ObjFunction {
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name,
        }
    }
}

/// A function paired with the upvalues it captured when it was built. Two
/// closures over the same `ObjFunction` are distinct objects with distinct
/// capture state.
pub struct ObjClosure {
    pub function: Obj,
    pub upvalues: Vec<Obj>,
}

/// A reference cell standing in for a captured local. *Open* while the
/// variable is still a live stack slot; *closed* once it has been hoisted
/// out, at which point it owns the value itself.
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

pub struct ObjNative {
    pub function: NativeFn,
    pub name: Obj,
}

pub struct ObjClass {
    pub name: Obj,
    pub methods: Table,
    pub superclass: Option<Obj>,
}

impl ObjClass {
    pub fn new(name: Obj) -> Self {
        ObjClass {
            name,
            methods: Table::new(),
            superclass: None,
        }
    }
}

pub struct ObjInstance {
    pub class: Obj,
    pub fields: Table,
}

impl ObjInstance {
    pub fn new(class: Obj) -> Self {
        ObjInstance {
            class,
            fields: Table::new(),
        }
    }
}

pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: Obj,
}

/// A handle to a heap object: a raw, non-owning pointer to its `ObjHeader`.
/// Ownership lives in the `Heap`'s all-objects list; `Obj` is `Copy` and
/// compares by pointer identity, matching the "object references compare by
/// identity" rule in the data model.
#[derive(Clone, Copy)]
pub struct Obj(pub NonNull<ObjHeader>);

impl Obj {
    /// # Safety
    /// `ptr` must point at a live `ObjHeader` owned by some `Heap`.
    pub unsafe fn from_raw(ptr: NonNull<ObjHeader>) -> Self {
        Obj(ptr)
    }

    /// Detaches the returned reference's lifetime from `&self` (which may
    /// be a short-lived `Copy` of the pointer, not the allocation itself):
    /// the allocation lives in the `Heap`'s all-objects list and is valid
    /// for as long as no GC cycle has swept it, which callers are
    /// responsible for (the usual rooting discipline).
    pub fn header<'a>(&self) -> &'a ObjHeader {
        unsafe { &*self.0.as_ptr() }
    }

    pub fn kind<'a>(&self) -> &'a ObjKind {
        &self.header().kind
    }

    pub fn type_name(&self) -> &'static str {
        self.kind().type_name()
    }

    pub fn is_string(&self) -> bool {
        matches!(self.kind(), ObjKind::String(_))
    }

    pub fn as_string<'a>(&self) -> Option<&'a ObjString> {
        match self.kind() {
            ObjKind::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_function<'a>(&self) -> Option<&'a ObjFunction> {
        match self.kind() {
            ObjKind::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_closure<'a>(&self) -> Option<&'a ObjClosure> {
        match self.kind() {
            ObjKind::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_native<'a>(&self) -> Option<&'a ObjNative> {
        match self.kind() {
            ObjKind::Native(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_class<'a>(&self) -> Option<&'a RefCell<ObjClass>> {
        match self.kind() {
            ObjKind::Class(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_instance<'a>(&self) -> Option<&'a RefCell<ObjInstance>> {
        match self.kind() {
            ObjKind::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_bound_method<'a>(&self) -> Option<&'a ObjBoundMethod> {
        match self.kind() {
            ObjKind::BoundMethod(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_upvalue<'a>(&self) -> Option<&'a RefCell<UpvalueState>> {
        match self.kind() {
            ObjKind::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    /// Name of a class object, for `NAME instance` / bare-class printing.
    pub fn kind_name(&self) -> String {
        match self.kind() {
            ObjKind::Class(c) => c.borrow().name.as_string().unwrap().as_str().to_string(),
            _ => self.type_name().to_string(),
        }
    }
}

impl PartialEq for Obj {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for Obj {}

impl std::hash::Hash for Obj {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}
