//! The bytecode dispatch loop: call frames, the value stack, globals, open
//! upvalues, and every `OpCode`'s runtime semantics.
//!
//! `VM` is the only thing that knows how to find its own roots, so garbage
//! collection is triggered from here (see `collect_garbage_if_needed`) and
//! nowhere inside `gc::Heap` itself.

use std::cell::RefCell;
use std::convert::TryFrom;

use tracing::debug;

use crate::chunk::OpCode;
use crate::compiler::compile;
use crate::error::{CompileError, RuntimeError, TraceFrame};
use crate::gc::Heap;
use crate::native::{clock_native, NativeFn};
use crate::object::{Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjInstance, ObjKind, ObjNative, UpvalueState};
use crate::table::Table;
use crate::value::Value;

const STACK_MAX: usize = 16384;
const FRAMES_MAX: usize = 64;

struct CallFrame {
    closure: Obj,
    ip: usize,
    slot_base: usize,
}

/// The outcome of one `VM::interpret` call. A `RuntimeError` leaves the VM's
/// stack and frames reset, so a REPL session can feed it another line.
pub enum InterpretResult {
    Ok,
    CompileError(Vec<CompileError>),
    RuntimeError(RuntimeError),
}

enum InterpretError {
    Compile(Vec<CompileError>),
    Runtime(RuntimeError),
}

pub struct VM {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Open upvalues, kept sorted by descending stack slot so a capture can
    /// find (or insert next to) its neighbor without scanning the whole list
    /// in the common case of capturing the most recently pushed local.
    open_upvalues: Vec<Obj>,
    init_string: Obj,
    /// Sink for `print`. Defaults to stdout; tests substitute an in-memory
    /// buffer so `print` output can be asserted on without capturing the
    /// process's real stdout.
    output: Box<dyn std::io::Write>,
}

impl VM {
    pub fn new() -> Self {
        Self::with_output(Box::new(std::io::stdout()))
    }

    /// Builds a VM that writes `print` output to `output` instead of
    /// stdout.
    pub fn with_output(output: Box<dyn std::io::Write>) -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern_string("init");
        let mut vm = VM {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            init_string,
            output,
        };
        vm.define_native("clock", clock_native);
        vm
    }

    /// Mirrors the reference implementation's debug-stress-GC build flag as
    /// a runtime toggle: every allocation triggers a collection.
    pub fn set_stress_gc(&mut self, enabled: bool) {
        self.heap.stress_gc = enabled;
    }

    fn define_native(&mut self, name: &str, function: NativeFn) {
        let name_obj = self.heap.intern_string(name);
        let native_obj = self.heap.allocate(ObjKind::Native(ObjNative {
            function,
            name: name_obj,
        }));
        self.globals.set(name_obj, Value::Obj(native_obj));
    }

    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        match self.interpret_inner(source) {
            Ok(()) => InterpretResult::Ok,
            Err(InterpretError::Compile(errors)) => InterpretResult::CompileError(errors),
            Err(InterpretError::Runtime(err)) => InterpretResult::RuntimeError(err),
        }
    }

    fn interpret_inner(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = compile(source, &mut self.heap).map_err(InterpretError::Compile)?;
        debug!(target: "luma_core::vm", "starting interpretation");

        // Root the bare function across the closure allocation below before
        // it has any other owner.
        self.push(Value::Obj(function)).map_err(InterpretError::Runtime)?;
        let closure_obj = self.heap.allocate(ObjKind::Closure(ObjClosure {
            function,
            upvalues: Vec::new(),
        }));
        self.pop();
        self.push(Value::Obj(closure_obj)).map_err(InterpretError::Runtime)?;

        self.call_closure(closure_obj, 0)
            .map_err(InterpretError::Runtime)?;
        self.run().map_err(InterpretError::Runtime)
    }

    // ---- stack plumbing -----------------------------------------------------

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= STACK_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("run never pops an empty stack")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn read_u8(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("run always has an active frame");
        let function = frame
            .closure
            .as_closure()
            .expect("frame closure is always a closure")
            .function
            .as_function()
            .expect("closure function is always a function");
        let byte = function.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_u8();
        let lo = self.read_u8();
        ((hi as u16) << 8) | lo as u16
    }

    fn read_op(&mut self) -> OpCode {
        let byte = self.read_u8();
        OpCode::try_from(byte).expect("chunk bytes were all written by write_op")
    }

    fn read_constant(&self, idx: u8) -> Value {
        let frame = self.frames.last().expect("run always has an active frame");
        let function = frame
            .closure
            .as_closure()
            .expect("frame closure is always a closure")
            .function
            .as_function()
            .expect("closure function is always a function");
        function.chunk.constants[idx as usize]
    }

    // ---- garbage collection --------------------------------------------------

    fn collect_garbage_if_needed(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let stack = &self.stack;
        let frames = &self.frames;
        let globals = &self.globals;
        let open_upvalues = &self.open_upvalues;
        let init_string = self.init_string;
        self.heap.collect_garbage(|heap| {
            for value in stack.iter() {
                heap.mark_value(*value);
            }
            for frame in frames.iter() {
                heap.mark_object(frame.closure);
            }
            for (key, value) in globals.iter() {
                heap.mark_object(key);
                heap.mark_value(value);
            }
            for upvalue in open_upvalues.iter() {
                heap.mark_object(*upvalue);
            }
            heap.mark_object(init_string);
        });
    }

    // ---- calls ---------------------------------------------------------------

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), RuntimeError> {
        let Some(obj) = callee.as_obj() else {
            return Err(self.runtime_error("Can only call functions and classes."));
        };
        match obj.kind() {
            ObjKind::Closure(_) => self.call_closure(obj, argc),
            ObjKind::Native(native) => {
                let argc_usize = argc as usize;
                let args_start = self.stack.len() - argc_usize;
                let result = (native.function)(argc_usize, &self.stack[args_start..]);
                self.stack.truncate(args_start - 1);
                self.push(result)
            }
            ObjKind::Class(_) => {
                let class_obj = obj;
                self.collect_garbage_if_needed();
                let instance_obj = self
                    .heap
                    .allocate(ObjKind::Instance(RefCell::new(ObjInstance::new(class_obj))));
                let receiver_slot = self.stack.len() - argc as usize - 1;
                self.stack[receiver_slot] = Value::Obj(instance_obj);

                let init = class_obj
                    .as_class()
                    .expect("call target is a class")
                    .borrow()
                    .methods
                    .get(self.init_string);
                match init {
                    Some(init_value) => {
                        let init_closure = init_value.as_obj().expect("init method is a closure");
                        self.call_closure(init_closure, argc)
                    }
                    None if argc == 0 => Ok(()),
                    None => Err(self.runtime_error(format!("Expected 0 arguments but got {}.", argc))),
                }
            }
            ObjKind::BoundMethod(bound) => {
                let method = bound.method;
                let receiver = bound.receiver;
                let receiver_slot = self.stack.len() - argc as usize - 1;
                self.stack[receiver_slot] = receiver;
                self.call_closure(method, argc)
            }
            _ => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    fn call_closure(&mut self, closure_obj: Obj, argc: u8) -> Result<(), RuntimeError> {
        let closure = closure_obj
            .as_closure()
            .expect("call_closure's argument is always a closure");
        let function = closure
            .function
            .as_function()
            .expect("closure function is always a function");
        if argc as usize != function.arity as usize {
            return Err(self.runtime_error(format!(
                "Expected {} arguments but got {}.",
                function.arity, argc
            )));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        let slot_base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame {
            closure: closure_obj,
            ip: 0,
            slot_base,
        });
        Ok(())
    }

    fn invoke(&mut self, name: Obj, argc: u8) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc as usize);
        let Some(instance_obj) = receiver.as_obj().filter(|o| o.as_instance().is_some()) else {
            return Err(self.runtime_error("Only instances have methods."));
        };
        let field = instance_obj.as_instance().unwrap().borrow().fields.get(name);
        if let Some(field_value) = field {
            let slot = self.stack.len() - argc as usize - 1;
            self.stack[slot] = field_value;
            return self.call_value(field_value, argc);
        }
        let class_obj = instance_obj.as_instance().unwrap().borrow().class;
        self.invoke_from_class(class_obj, name, argc)
    }

    fn invoke_from_class(&mut self, class_obj: Obj, name: Obj, argc: u8) -> Result<(), RuntimeError> {
        let method = class_obj
            .as_class()
            .expect("invoke target is always a class")
            .borrow()
            .methods
            .get(name);
        let Some(method_value) = method else {
            return Err(self.runtime_error(format!(
                "Undefined property '{}'.",
                name.as_string().expect("property name is a string").as_str()
            )));
        };
        let method_obj = method_value.as_obj().expect("method value is always a closure");
        self.call_closure(method_obj, argc)
    }

    fn bind_method(&mut self, class_obj: Obj, name: Obj) -> Result<(), RuntimeError> {
        let method = class_obj
            .as_class()
            .expect("bind_method's argument is always a class")
            .borrow()
            .methods
            .get(name);
        let Some(method_value) = method else {
            return Err(self.runtime_error(format!(
                "Undefined property '{}'.",
                name.as_string().expect("property name is a string").as_str()
            )));
        };
        self.collect_garbage_if_needed();
        let receiver = self.peek(0);
        let bound = self.heap.allocate(ObjKind::BoundMethod(ObjBoundMethod {
            receiver,
            method: method_value.as_obj().expect("method value is always a closure"),
        }));
        self.pop();
        self.push(Value::Obj(bound))
    }

    // ---- upvalues --------------------------------------------------------------

    fn capture_upvalue(&mut self, stack_idx: usize) -> Obj {
        if let Some(existing) = self.open_upvalues.iter().find(|uv| {
            matches!(&*uv.as_upvalue().unwrap().borrow(), UpvalueState::Open(idx) if *idx == stack_idx)
        }) {
            return *existing;
        }
        let insert_at = self
            .open_upvalues
            .iter()
            .position(|uv| {
                matches!(&*uv.as_upvalue().unwrap().borrow(), UpvalueState::Open(idx) if *idx < stack_idx)
            })
            .unwrap_or(self.open_upvalues.len());

        self.collect_garbage_if_needed();
        let upvalue = self
            .heap
            .allocate(ObjKind::Upvalue(RefCell::new(UpvalueState::Open(stack_idx))));
        self.open_upvalues.insert(insert_at, upvalue);
        upvalue
    }

    /// Hoists every open upvalue at or above stack slot `from` out onto the
    /// heap, giving each its own owned copy of the value before the slot it
    /// pointed at disappears (block exit or return).
    fn close_upvalues(&mut self, from: usize) {
        let stack = &self.stack;
        self.open_upvalues.retain(|uv| {
            let mut state = uv.as_upvalue().unwrap().borrow_mut();
            if let UpvalueState::Open(idx) = &*state {
                if *idx >= from {
                    let value = stack[*idx];
                    *state = UpvalueState::Closed(value);
                    return false;
                }
            }
            true
        });
    }

    // ---- errors --------------------------------------------------------------

    fn runtime_error(&mut self, message: impl Into<String>) -> RuntimeError {
        let mut trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let function = frame
                .closure
                .as_closure()
                .expect("frame closure is always a closure")
                .function
                .as_function()
                .expect("closure function is always a function");
            let line = function.chunk.line_at(frame.ip.saturating_sub(1));
            let name = match function.name {
                Some(name_obj) => format!("{}()", name_obj.as_string().unwrap().as_str()),
                None => "script".to_string(),
            };
            trace.push(TraceFrame { line, name });
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        RuntimeError {
            message: message.into(),
            trace,
        }
    }

    // ---- binary operator helper ------------------------------------------------

    fn binary_numeric(&mut self, op: impl Fn(f64, f64) -> Value) -> Result<(), RuntimeError> {
        let b = self.peek(0).as_number();
        let a = self.peek(1).as_number();
        match (a, b) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                self.push(op(a, b))
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    // ---- the dispatch loop -------------------------------------------------------

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            match self.read_op() {
                OpCode::Constant => {
                    let idx = self.read_u8();
                    let value = self.read_constant(idx);
                    self.push(value)?;
                }
                OpCode::Nil => self.push(Value::Nil)?,
                OpCode::True => self.push(Value::Bool(true))?,
                OpCode::False => self.push(Value::Bool(false))?,
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_u8();
                    let base = self.frames.last().unwrap().slot_base;
                    let value = self.stack[base + slot as usize];
                    self.push(value)?;
                }
                OpCode::SetLocal => {
                    let slot = self.read_u8();
                    let value = self.peek(0);
                    let base = self.frames.last().unwrap().slot_base;
                    self.stack[base + slot as usize] = value;
                }
                OpCode::GetGlobal => {
                    let idx = self.read_u8();
                    let name = self.read_constant(idx).as_obj().expect("global name is a string");
                    match self.globals.get(name) {
                        Some(value) => self.push(value)?,
                        None => {
                            return Err(self.runtime_error(format!(
                                "Undefined variable '{}'.",
                                name.as_string().unwrap().as_str()
                            )))
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let idx = self.read_u8();
                    let name = self.read_constant(idx).as_obj().expect("global name is a string");
                    let value = self.pop();
                    self.globals.set(name, value);
                }
                OpCode::SetGlobal => {
                    let idx = self.read_u8();
                    let name = self.read_constant(idx).as_obj().expect("global name is a string");
                    let value = self.peek(0);
                    if self.globals.set(name, value) {
                        self.globals.delete(name);
                        return Err(self.runtime_error(format!(
                            "Undefined variable '{}'.",
                            name.as_string().unwrap().as_str()
                        )));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_u8();
                    let closure = self.frames.last().unwrap().closure;
                    let upvalue_obj = closure.as_closure().unwrap().upvalues[slot as usize];
                    let value = match &*upvalue_obj.as_upvalue().unwrap().borrow() {
                        UpvalueState::Open(idx) => self.stack[*idx],
                        UpvalueState::Closed(value) => *value,
                    };
                    self.push(value)?;
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_u8();
                    let value = self.peek(0);
                    let closure = self.frames.last().unwrap().closure;
                    let upvalue_obj = closure.as_closure().unwrap().upvalues[slot as usize];
                    match &mut *upvalue_obj.as_upvalue().unwrap().borrow_mut() {
                        UpvalueState::Open(idx) => self.stack[*idx] = value,
                        UpvalueState::Closed(slot) => *slot = value,
                    }
                }
                OpCode::GetProperty => {
                    let idx = self.read_u8();
                    let name = self.read_constant(idx).as_obj().expect("property name is a string");
                    let receiver = self.peek(0);
                    let Some(instance_obj) = receiver.as_obj().filter(|o| o.as_instance().is_some()) else {
                        return Err(self.runtime_error("Only instances have properties."));
                    };
                    let field = instance_obj.as_instance().unwrap().borrow().fields.get(name);
                    if let Some(value) = field {
                        self.pop();
                        self.push(value)?;
                    } else {
                        let class_obj = instance_obj.as_instance().unwrap().borrow().class;
                        self.bind_method(class_obj, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let idx = self.read_u8();
                    let name = self.read_constant(idx).as_obj().expect("property name is a string");
                    let value = self.pop();
                    let receiver = self.pop();
                    let Some(instance_obj) = receiver.as_obj().filter(|o| o.as_instance().is_some()) else {
                        return Err(self.runtime_error("Only instances have fields."));
                    };
                    instance_obj.as_instance().unwrap().borrow_mut().fields.set(name, value);
                    self.push(value)?;
                }
                OpCode::GetSuper => {
                    let idx = self.read_u8();
                    let name = self.read_constant(idx).as_obj().expect("method name is a string");
                    let superclass_obj = self.pop().as_obj().expect("superclass operand is a class");
                    self.bind_method(superclass_obj, name)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b))?;
                }
                OpCode::Greater => self.binary_numeric(|a, b| Value::Bool(a > b))?,
                OpCode::Less => self.binary_numeric(|a, b| Value::Bool(a < b))?,
                OpCode::Add => {
                    let b = self.peek(0);
                    let a = self.peek(1);
                    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
                        self.pop();
                        self.pop();
                        self.push(Value::Number(x + y))?;
                    } else if a.is_string() && b.is_string() {
                        let a_str = a.as_obj().unwrap().as_string().unwrap().as_str().to_string();
                        let b_str = b.as_obj().unwrap().as_string().unwrap().as_str().to_string();
                        self.pop();
                        self.pop();
                        self.collect_garbage_if_needed();
                        let concatenated = self.heap.intern_string(&(a_str + &b_str));
                        self.push(Value::Obj(concatenated))?;
                    } else {
                        return Err(self.runtime_error("Operands must be two numbers or two strings."));
                    }
                }
                OpCode::Subtract => self.binary_numeric(|a, b| Value::Number(a - b))?,
                OpCode::Multiply => self.binary_numeric(|a, b| Value::Number(a * b))?,
                OpCode::Divide => self.binary_numeric(|a, b| Value::Number(a / b))?,
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()))?;
                }
                OpCode::Negate => match self.peek(0).as_number() {
                    Some(n) => {
                        self.pop();
                        self.push(Value::Number(-n))?;
                    }
                    None => return Err(self.runtime_error("Operand must be a number.")),
                },
                OpCode::Print => {
                    let value = self.pop();
                    let _ = writeln!(self.output, "{}", value);
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().unwrap().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_u8();
                    let callee = self.peek(argc as usize);
                    self.call_value(callee, argc)?;
                }
                OpCode::Invoke => {
                    let argc = self.read_u8();
                    let name_idx = self.read_u8();
                    let name = self.read_constant(name_idx).as_obj().expect("method name is a string");
                    self.invoke(name, argc)?;
                }
                OpCode::SuperInvoke => {
                    let argc = self.read_u8();
                    let name_idx = self.read_u8();
                    let name = self.read_constant(name_idx).as_obj().expect("method name is a string");
                    let superclass_obj = self.pop().as_obj().expect("superclass operand is a class");
                    self.invoke_from_class(superclass_obj, name, argc)?;
                }
                OpCode::Closure => {
                    let idx = self.read_u8();
                    let function_obj = self.read_constant(idx).as_obj().expect("closure operand is a function");
                    let upvalue_count = function_obj
                        .as_function()
                        .expect("closure operand is a function")
                        .upvalue_count;
                    let mut upvalues = Vec::with_capacity(upvalue_count as usize);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_u8();
                        let index = self.read_u8();
                        let upvalue = if is_local == 1 {
                            let base = self.frames.last().unwrap().slot_base;
                            self.capture_upvalue(base + index as usize)
                        } else {
                            let enclosing = self.frames.last().unwrap().closure;
                            enclosing.as_closure().unwrap().upvalues[index as usize]
                        };
                        upvalues.push(upvalue);
                    }
                    self.collect_garbage_if_needed();
                    let closure_obj = self.heap.allocate(ObjKind::Closure(ObjClosure {
                        function: function_obj,
                        upvalues,
                    }));
                    self.push(Value::Obj(closure_obj))?;
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("run never pops an empty frame stack");
                    self.close_upvalues(frame.slot_base);
                    self.stack.truncate(frame.slot_base);
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.push(result)?;
                }
                OpCode::Class => {
                    let idx = self.read_u8();
                    let name = self.read_constant(idx).as_obj().expect("class name is a string");
                    self.collect_garbage_if_needed();
                    let class_obj = self.heap.allocate(ObjKind::Class(RefCell::new(ObjClass::new(name))));
                    self.push(Value::Obj(class_obj))?;
                }
                OpCode::Inherit => {
                    let superclass_val = self.peek(1);
                    let subclass_val = self.peek(0);
                    let Some(superclass_obj) = superclass_val.as_obj().filter(|o| o.as_class().is_some())
                    else {
                        return Err(self.runtime_error("Superclass must be a class."));
                    };
                    let subclass_obj = subclass_val.as_obj().expect("subclass operand is a class");
                    let inherited: Vec<(Obj, Value)> =
                        superclass_obj.as_class().unwrap().borrow().methods.iter().collect();
                    {
                        let mut subclass = subclass_obj.as_class().unwrap().borrow_mut();
                        for (name, method) in inherited {
                            subclass.methods.set(name, method);
                        }
                        subclass.superclass = Some(superclass_obj);
                    }
                    self.pop();
                }
                OpCode::Method => {
                    let idx = self.read_u8();
                    let name = self.read_constant(idx).as_obj().expect("method name is a string");
                    let method_value = self.pop();
                    let class_obj = self.peek(0).as_obj().expect("method target is a class");
                    class_obj.as_class().unwrap().borrow_mut().methods.set(name, method_value);
                }
            }
        }
    }
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}
