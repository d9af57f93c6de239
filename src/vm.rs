use super::compiler;
use super::chunk::Instruction;
use super::debug;
use super::heap::Heap;
use super::natives;
use super::object::{BoundMethod, Class, Closure, Instance, Obj, ObjRef, Upvalue};
use super::reporter::Reporter;
use super::value::{self, Value, ValueKind};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::io::{self, Write};
use std::time::{Duration, SystemTime};

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

struct Frame {
    closure: ObjRef,
    ip: usize,
    slots: usize,
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<Frame>,
    globals: HashMap<ObjRef, Value>,
    /// Open upvalues sorted by stack location, deepest first.
    open_upvalues: Vec<ObjRef>,
    heap: Heap,
    init_string: ObjRef,
    created_at: SystemTime,
    out: Box<dyn Write>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_out(Box::new(io::stdout()))
    }

    pub fn with_out(out: Box<dyn Write>) -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");

        let mut vm = Self {
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: HashMap::new(),
            open_upvalues: Vec::new(),
            heap,
            init_string,
            created_at: SystemTime::now(),
            out,
        };

        for (name, native) in natives::NATIVES.iter() {
            let name = vm.heap.intern(name);
            let native = vm.heap.alloc(Obj::Native(*native));
            vm.globals.insert(name, Value::from(native));
        }

        vm
    }

    pub fn interpret(&mut self, source: &str, reporter: &mut dyn Reporter) -> InterpretResult {
        let function = match compiler::compile(source, &mut self.heap, reporter) {
            Some(function) => function,
            None => return InterpretResult::CompileError,
        };

        if cfg!(feature = "debug-bytecode") {
            print!(
                "{}",
                debug::disassemble(&self.heap.function(function).chunk, &self.heap, "script")
            );
        }

        self.push(Value::from(function));
        let closure = self.alloc(Obj::Closure(Closure::new(function, Vec::new())));
        self.pop();
        self.push(Value::from(closure));
        if let Err(msg) = self.call(closure, 0) {
            self.runtime_error(&msg);
            return InterpretResult::RuntimeError;
        }

        match self.run() {
            Ok(()) => InterpretResult::Ok,
            Err(()) => InterpretResult::RuntimeError,
        }
    }

    //>> Allocation. Collections only ever start here, so everything the
    //   mutator is holding must already be reachable from a root.
    fn alloc(&mut self, obj: Obj) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.alloc(obj)
    }

    pub fn intern(&mut self, content: &str) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.intern(content)
    }

    fn collect_garbage(&mut self) {
        if cfg!(feature = "log-gc") {
            eprintln!("-- gc begin ({} bytes)", self.heap.bytes_allocated());
        }

        for idx in 0..self.stack.len() {
            let value = self.stack[idx];
            self.heap.mark_value(value);
        }
        for idx in 0..self.frames.len() {
            let closure = self.frames[idx].closure;
            self.heap.mark_object(closure);
        }
        for idx in 0..self.open_upvalues.len() {
            let upvalue = self.open_upvalues[idx];
            self.heap.mark_object(upvalue);
        }
        let globals: Vec<(ObjRef, Value)> =
            self.globals.iter().map(|(name, value)| (*name, *value)).collect();
        for (name, value) in globals {
            self.heap.mark_object(name);
            self.heap.mark_value(value);
        }
        self.heap.mark_object(self.init_string);

        self.heap.trace_references();
        self.heap.sweep();

        if cfg!(feature = "log-gc") {
            eprintln!("-- gc end ({} bytes)", self.heap.bytes_allocated());
        }
    }
    //<<

    //>> Stack manipulation
    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap()
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }
    //<<

    //>> Native function utilities
    pub fn check_arity(arity: u8, argc: usize) -> Result<(), String> {
        if argc != arity as usize {
            Err(format!("Expected {} arguments but got {}.", arity, argc))
        } else {
            Ok(())
        }
    }

    pub fn get_any(&self, idx: usize, argc: usize) -> Value {
        self.stack[self.stack.len() - 1 - argc + idx]
    }

    pub fn get_number(&self, idx: usize, argc: usize) -> Result<f64, String> {
        match self.get_any(idx, argc).kind() {
            ValueKind::Number(n) => Ok(n),
            _ => Err(format!("Argument {} must be a number.", idx)),
        }
    }

    pub fn get_pos_int(&self, idx: usize, argc: usize) -> Result<u32, String> {
        match self.get_any(idx, argc).kind() {
            ValueKind::Number(n) if n.fract() == 0.0 && n > 0.0 => Ok(n as u32),
            _ => Err(format!("Argument {} must be a positive integer.", idx)),
        }
    }

    pub fn get_string(&self, idx: usize, argc: usize) -> Result<String, String> {
        match self.get_any(idx, argc).as_obj() {
            Some(obj_ref) => match self.heap.get(obj_ref) {
                Obj::String(string) => Ok(string.clone()),
                _ => Err(format!("Argument {} must be a string.", idx)),
            },
            None => Err(format!("Argument {} must be a string.", idx)),
        }
    }

    pub fn uptime(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.created_at)
            .unwrap_or(Duration::ZERO)
    }

    pub fn write_str(&mut self, text: &str) {
        self.out.write_all(text.as_bytes()).ok();
    }
    //<<

    //>> Frame and bytecode cursor
    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let ip = frame.ip;
        frame.ip += 1;
        let closure = frame.closure;
        self.heap.chunk_of(closure).byte(ip).unwrap()
    }

    fn read_short(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte() as usize;
        let frame = self.frames.last().unwrap();
        self.heap.chunk_of(frame.closure).constant(idx)
    }

    fn read_string(&mut self) -> ObjRef {
        self.read_constant().as_obj().unwrap()
    }
    //<<

    fn runtime_error(&mut self, msg: &str) {
        eprintln!("{}", msg);

        for frame in self.frames.iter().rev() {
            let function = self.heap.closure(frame.closure).function;
            let function = self.heap.function(function);
            // the cursor sits just past the failing instruction
            let line = function
                .chunk
                .token_at(frame.ip.saturating_sub(1))
                .map(|token| token.line())
                .unwrap_or(0);
            match function.name {
                Some(name) => eprintln!("[line {}] in {}()", line, self.heap.string(name)),
                None => eprintln!("[line {}] in script", line),
            }
        }

        self.reset_stack();
    }

    fn fail(&mut self, msg: &str) -> Result<(), ()> {
        self.runtime_error(msg);
        Err(())
    }

    //>> Call protocol
    fn call(&mut self, closure: ObjRef, argc: usize) -> Result<(), String> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity;
        if argc != arity as usize {
            return Err(format!("Expected {} arguments but got {}.", arity, argc));
        }

        if self.frames.len() == FRAMES_MAX {
            return Err("Stack overflow.".to_string());
        }

        self.frames.push(Frame {
            closure,
            ip: 0,
            slots: self.stack.len() - argc - 1,
        });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), String> {
        if let Some(obj_ref) = callee.as_obj() {
            match self.heap.get(obj_ref) {
                Obj::Closure(_) => return self.call(obj_ref, argc),
                Obj::Native(native) => {
                    let native = *native;
                    return match native(self, argc) {
                        Ok(result) => {
                            let idx = self.stack.len() - argc - 1;
                            self.stack.truncate(idx);
                            self.push(result);
                            Ok(())
                        }
                        Err(msg) => Err(msg),
                    };
                }
                Obj::Class(_) => {
                    let idx = self.stack.len() - argc - 1;
                    let instance = self.alloc(Obj::Instance(Instance::new(obj_ref)));
                    self.stack[idx] = Value::from(instance);

                    let initializer =
                        self.heap.class(obj_ref).methods.get(&self.init_string).copied();
                    return match initializer {
                        Some(initializer) => self.call(initializer.as_obj().unwrap(), argc),
                        None if argc != 0 => {
                            Err(format!("Expected 0 arguments but got {}.", argc))
                        }
                        None => Ok(()),
                    };
                }
                Obj::BoundMethod(_) => {
                    let bound = self.heap.bound_method(obj_ref);
                    let (receiver, method) = (bound.receiver, bound.method);
                    let idx = self.stack.len() - argc - 1;
                    self.stack[idx] = receiver;
                    return self.call(method, argc);
                }
                _ => {}
            }
        }

        Err("Can only call functions and classes.".to_string())
    }

    fn invoke_from_class(&mut self, class: ObjRef, name: ObjRef, argc: usize) -> Result<(), String> {
        match self.heap.class(class).methods.get(&name).copied() {
            Some(method) => self.call(method.as_obj().unwrap(), argc),
            None => Err(format!("Undefined property '{}'.", self.heap.string(name))),
        }
    }

    fn invoke(&mut self, name: ObjRef, argc: usize) -> Result<(), String> {
        let receiver = self.peek(argc);

        let instance = match receiver.as_obj() {
            Some(obj_ref) if matches!(self.heap.get(obj_ref), Obj::Instance(_)) => obj_ref,
            _ => return Err("Only instances have methods.".to_string()),
        };

        if let Some(field) = self.heap.instance(instance).fields.get(&name).copied() {
            let idx = self.stack.len() - argc - 1;
            self.stack[idx] = field;
            return self.call_value(field, argc);
        }

        let class = self.heap.instance(instance).class;
        self.invoke_from_class(class, name, argc)
    }

    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), String> {
        let method = match self.heap.class(class).methods.get(&name).copied() {
            Some(method) => method,
            None => {
                return Err(format!("Undefined property '{}'.", self.heap.string(name)));
            }
        };

        let bound = self.alloc(Obj::BoundMethod(BoundMethod::new(
            self.peek(0),
            method.as_obj().unwrap(),
        )));
        self.pop();
        self.push(Value::from(bound));
        Ok(())
    }
    //<<

    //>> Upvalue capture and closing
    fn capture_upvalue(&mut self, location: usize) -> ObjRef {
        let mut idx = 0;
        while idx < self.open_upvalues.len() {
            let open_location = self.heap.upvalue(self.open_upvalues[idx]).as_open();
            if open_location == location {
                return self.open_upvalues[idx];
            }
            if open_location < location {
                break;
            }
            idx += 1;
        }

        let upvalue = self.alloc(Obj::Upvalue(Upvalue::Open(location)));
        self.open_upvalues.insert(idx, upvalue);
        upvalue
    }

    /// Closes every open upvalue at or above `last` on the stack.
    fn close_upvalues(&mut self, last: usize) {
        let mut remaining = Vec::new();

        for upvalue in self.open_upvalues.clone() {
            let location = self.heap.upvalue(upvalue).as_open();
            if location >= last {
                let value = self.stack[location];
                self.heap.upvalue_mut(upvalue).close(value);
            } else {
                remaining.push(upvalue);
            }
        }
        self.open_upvalues = remaining;
    }
    //<<

    fn run(&mut self) -> Result<(), ()> {
        loop {
            if cfg!(feature = "debug-execution") {
                let mut trace = String::from("        ");
                for value in &self.stack {
                    trace += &format!("[ {} ] ", self.heap.show(*value));
                }
                println!("{}", trace);
                let frame = self.frames.last().unwrap();
                let (text, _) = debug::disassemble_instr_at(
                    self.heap.chunk_of(frame.closure),
                    &self.heap,
                    frame.ip,
                );
                print!("{}", text);
            }

            let instr = Instruction::try_from(self.read_byte()).unwrap();
            match instr {
                Instruction::Constant => {
                    let constant = self.read_constant();
                    self.push(constant);
                }
                Instruction::Nil => self.push(value::NIL),
                Instruction::True => self.push(Value::from(true)),
                Instruction::False => self.push(Value::from(false)),
                Instruction::Pop => {
                    self.pop();
                }
                Instruction::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let idx = self.frames.last().unwrap().slots + slot;
                    self.push(self.stack[idx]);
                }
                Instruction::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let idx = self.frames.last().unwrap().slots + slot;
                    if self.stack[idx].is_constant || self.peek(0).is_constant {
                        return self.fail("Can't change the value of constant.");
                    }
                    self.stack[idx] = self.peek(0);
                }
                Instruction::DefineGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0).variable();
                    self.globals.insert(name, value);
                    self.pop();
                }
                Instruction::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(&name) {
                        Some(value) => {
                            let value = *value;
                            self.push(value);
                        }
                        None => {
                            let msg =
                                format!("Undefined variable '{}'.", self.heap.string(name));
                            return self.fail(&msg);
                        }
                    }
                }
                Instruction::SetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(&name) {
                        Some(global) => {
                            if global.is_constant {
                                return self.fail("Can't change the value of a constant.");
                            }
                            let value = self.peek(0);
                            self.globals.insert(name, value);
                        }
                        None => {
                            let msg =
                                format!("Undefined variable '{}'.", self.heap.string(name));
                            return self.fail(&msg);
                        }
                    }
                }
                Instruction::DefineConstant => {
                    let name = self.read_string();
                    if let Some(existing) = self.globals.get(&name) {
                        let msg = format!(
                            "{} '{}' is already defined.",
                            if existing.is_constant {
                                "Constant"
                            } else {
                                "Variable"
                            },
                            self.heap.string(name)
                        );
                        return self.fail(&msg);
                    }
                    let value = self.peek(0).constant();
                    self.globals.insert(name, value);
                    self.pop();
                }
                Instruction::GetUpvalue => {
                    let idx = self.read_byte() as usize;
                    let frame = self.frames.last().unwrap();
                    let upvalue = self.heap.closure(frame.closure).upvalues[idx];
                    let value = match self.heap.upvalue(upvalue) {
                        Upvalue::Open(location) => self.stack[*location],
                        Upvalue::Closed(value) => *value,
                    };
                    self.push(value);
                }
                Instruction::SetUpvalue => {
                    let idx = self.read_byte() as usize;
                    let frame = self.frames.last().unwrap();
                    let upvalue = self.heap.closure(frame.closure).upvalues[idx];
                    let value = self.peek(0);
                    match self.heap.upvalue(upvalue) {
                        Upvalue::Open(location) => {
                            let location = *location;
                            self.stack[location] = value;
                        }
                        Upvalue::Closed(_) => self.heap.upvalue_mut(upvalue).close(value),
                    }
                }
                Instruction::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                Instruction::GetProperty => {
                    let name = self.read_string();
                    let value = self.peek(0);

                    let instance = value.as_obj().filter(|obj_ref| {
                        matches!(self.heap.get(*obj_ref), Obj::Instance(_))
                    });

                    match instance {
                        Some(instance) => {
                            // fields shadow methods
                            if let Some(field) =
                                self.heap.instance(instance).fields.get(&name).copied()
                            {
                                self.pop();
                                self.push(field);
                            } else {
                                let class = self.heap.instance(instance).class;
                                if let Err(msg) = self.bind_method(class, name) {
                                    return self.fail(&msg);
                                }
                            }
                        }
                        None => {
                            // every non-instance value answers the one
                            // synthetic property, its string form
                            if self.heap.string(name) == "to_str" {
                                let text = self.heap.show(value);
                                let string = self.intern(&text);
                                self.pop();
                                self.push(Value::from(string));
                            } else {
                                let msg = format!(
                                    "Unknown property '{}'.",
                                    self.heap.string(name)
                                );
                                return self.fail(&msg);
                            }
                        }
                    }
                }
                Instruction::SetProperty => {
                    let name = self.read_string();
                    let instance = self.peek(1).as_obj().filter(|obj_ref| {
                        matches!(self.heap.get(*obj_ref), Obj::Instance(_))
                    });
                    let instance = match instance {
                        Some(instance) => instance,
                        None => return self.fail("Only instances have fields."),
                    };

                    let value = self.peek(0);
                    self.heap.instance_mut(instance).fields.insert(name, value);
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                Instruction::GetSuper => {
                    let name = self.read_string();
                    let superclass = self.pop().as_obj().unwrap();
                    if let Err(msg) = self.bind_method(superclass, name) {
                        return self.fail(&msg);
                    }
                }
                Instruction::SuperInvoke => {
                    let name = self.read_string();
                    let argc = self.read_byte() as usize;
                    let superclass = self.pop().as_obj().unwrap();
                    if let Err(msg) = self.invoke_from_class(superclass, name, argc) {
                        return self.fail(&msg);
                    }
                }
                Instruction::Inherit => {
                    let superclass = match self.peek(1).as_obj() {
                        Some(obj_ref) if matches!(self.heap.get(obj_ref), Obj::Class(_)) => {
                            obj_ref
                        }
                        _ => return self.fail("Superclass must be a class."),
                    };

                    // flat copy-down: the subclass owns its full method set
                    // from here on, later superclass edits don't propagate
                    let subclass = self.peek(0).as_obj().unwrap();
                    let methods = self.heap.class(superclass).methods.clone();
                    self.heap.class_mut(subclass).methods.extend(methods);
                    self.pop();
                }
                Instruction::Class => {
                    let name = self.read_string();
                    let class = self.alloc(Obj::Class(Class::new(name)));
                    self.push(Value::from(class));
                }
                Instruction::Method => {
                    let name = self.read_string();
                    let method = self.peek(0);
                    let class = self.peek(1).as_obj().unwrap();
                    self.heap.class_mut(class).methods.insert(name, method);
                    self.pop();
                }
                Instruction::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::from(a == b));
                }
                Instruction::Greater => {
                    if !self.peek(0).is_number() || !self.peek(1).is_number() {
                        return self.fail("Operands must be numbers.");
                    }
                    let b = self.pop().as_number();
                    let a = self.pop().as_number();
                    self.push(Value::from(a > b));
                }
                Instruction::Less => {
                    if !self.peek(0).is_number() || !self.peek(1).is_number() {
                        return self.fail("Operands must be numbers.");
                    }
                    let b = self.pop().as_number();
                    let a = self.pop().as_number();
                    self.push(Value::from(a < b));
                }
                Instruction::Add => {
                    if self.is_string(self.peek(0)) && self.is_string(self.peek(1)) {
                        // operands stay on the stack until the result is
                        // allocated, so the collector can see them
                        let b = self.peek(0).as_obj().unwrap();
                        let a = self.peek(1).as_obj().unwrap();
                        let mut result = self.heap.string(a).to_string();
                        result += self.heap.string(b);
                        let string = self.intern(&result);
                        self.pop();
                        self.pop();
                        self.push(Value::from(string));
                    } else if self.peek(0).is_number() && self.peek(1).is_number() {
                        let b = self.pop().as_number();
                        let a = self.pop().as_number();
                        self.push(Value::from(a + b));
                    } else {
                        return self.fail("Operands must be two numbers or two strings.");
                    }
                }
                Instruction::Subtract => {
                    if !self.peek(0).is_number() || !self.peek(1).is_number() {
                        return self.fail("Operands must be numbers.");
                    }
                    let b = self.pop().as_number();
                    let a = self.pop().as_number();
                    self.push(Value::from(a - b));
                }
                Instruction::Multiply => {
                    if !self.peek(0).is_number() || !self.peek(1).is_number() {
                        return self.fail("Operands must be numbers.");
                    }
                    let b = self.pop().as_number();
                    let a = self.pop().as_number();
                    self.push(Value::from(a * b));
                }
                Instruction::Divide => {
                    if !self.peek(0).is_number() || !self.peek(1).is_number() {
                        return self.fail("Operands must be numbers.");
                    }
                    let b = self.pop().as_number();
                    let a = self.pop().as_number();
                    self.push(Value::from(a / b));
                }
                Instruction::Modulo => {
                    if !self.peek(0).is_number() || !self.peek(1).is_number() {
                        return self.fail("Operands must be numbers.");
                    }
                    let b = self.pop().as_number();
                    let a = self.pop().as_number();
                    self.push(Value::from(a % b));
                }
                Instruction::Power => {
                    if !self.peek(0).is_number() || !self.peek(1).is_number() {
                        return self.fail("Operands must be numbers.");
                    }
                    let b = self.pop().as_number();
                    let a = self.pop().as_number();
                    self.push(Value::from(a.powf(b)));
                }
                Instruction::ShiftLeft => {
                    if !self.peek(0).is_number() || !self.peek(1).is_number() {
                        return self.fail("Operands must be numbers.");
                    }
                    let b = self.pop().as_number() as i64;
                    let a = self.pop().as_number() as i64;
                    self.push(Value::from(a.wrapping_shl(b as u32) as f64));
                }
                Instruction::ShiftRight => {
                    if !self.peek(0).is_number() || !self.peek(1).is_number() {
                        return self.fail("Operands must be numbers.");
                    }
                    let b = self.pop().as_number() as i64;
                    let a = self.pop().as_number() as i64;
                    self.push(Value::from(a.wrapping_shr(b as u32) as f64));
                }
                Instruction::Not => {
                    let value = self.pop();
                    self.push(Value::from(!value.is_truthy()));
                }
                Instruction::Negate => {
                    if !self.peek(0).is_number() {
                        return self.fail("Operand must be a number.");
                    }
                    let value = self.pop().as_number();
                    self.push(Value::from(-value));
                }
                Instruction::Print => {
                    let value = self.pop();
                    let text = self.heap.show(value);
                    self.write_str(&text);
                    self.write_str("\n");
                }
                Instruction::Jump => {
                    let offset = self.read_short() as usize;
                    self.frames.last_mut().unwrap().ip += offset;
                }
                Instruction::JumpIfFalse => {
                    let offset = self.read_short() as usize;
                    if !self.peek(0).is_truthy() {
                        self.frames.last_mut().unwrap().ip += offset;
                    }
                }
                Instruction::Loop => {
                    let offset = self.read_short() as usize;
                    self.frames.last_mut().unwrap().ip -= offset;
                }
                Instruction::Call => {
                    let argc = self.read_byte() as usize;
                    if let Err(msg) = self.call_value(self.peek(argc), argc) {
                        return self.fail(&msg);
                    }
                }
                Instruction::Invoke => {
                    let name = self.read_string();
                    let argc = self.read_byte() as usize;
                    if let Err(msg) = self.invoke(name, argc) {
                        return self.fail(&msg);
                    }
                }
                Instruction::Closure => {
                    let function = self.read_constant().as_obj().unwrap();
                    let closure = self.alloc(Obj::Closure(Closure::new(function, Vec::new())));
                    self.push(Value::from(closure));

                    let upvalue_count = self.heap.function(function).upvalue_count;
                    let slots = self.frames.last().unwrap().slots;
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            self.capture_upvalue(slots + index)
                        } else {
                            let enclosing = self.frames.last().unwrap().closure;
                            self.heap.closure(enclosing).upvalues[index]
                        };
                        self.heap.closure_mut(closure).upvalues.push(upvalue);
                    }
                }
                Instruction::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues(frame.slots);

                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }

                    self.stack.truncate(frame.slots);
                    self.push(result);
                }
                Instruction::Exit => {
                    // leave the machine reusable for the next interpret
                    self.reset_stack();
                    return Ok(());
                }
            }
        }
    }

    fn is_string(&self, value: Value) -> bool {
        match value.as_obj() {
            Some(obj_ref) => matches!(self.heap.get(obj_ref), Obj::String(_)),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::reporter::{Report, Reporter};
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct SilentReporter;

    impl Reporter for SilentReporter {
        fn warning(&mut self, _report: Report) {}
        fn error(&mut self, _report: Report) {}
    }

    fn run(source: &str) -> (InterpretResult, String) {
        let buffer = SharedBuffer::default();
        let mut vm = Vm::with_out(Box::new(buffer.clone()));
        let result = vm.interpret(source, &mut SilentReporter);
        let output = String::from_utf8(buffer.0.borrow().clone()).unwrap();
        (result, output)
    }

    fn run_ok(source: &str) -> String {
        let (result, output) = run(source);
        assert_eq!(result, InterpretResult::Ok, "output so far: {output:?}");
        output
    }

    fn run_err(source: &str) -> String {
        let (result, output) = run(source);
        assert_eq!(result, InterpretResult::RuntimeError, "output: {output:?}");
        output
    }

    #[test]
    fn arithmetic() {
        assert_eq!(run_ok("print 1 + 2 * 3;"), "7\n");
        assert_eq!(run_ok("print (1 + 2) * 3;"), "9\n");
        assert_eq!(run_ok("print 7 % 3;"), "1\n");
        assert_eq!(run_ok("print 2 ** 10;"), "1024\n");
        assert_eq!(run_ok("print 1 << 4;"), "16\n");
        assert_eq!(run_ok("print 256 >> 4;"), "16\n");
        assert_eq!(run_ok("print -3 + 1;"), "-2\n");
        assert_eq!(run_ok("print 10 / 4;"), "2.5\n");
    }

    #[test]
    fn comparison_and_equality() {
        assert_eq!(run_ok("print 1 < 2;"), "true\n");
        assert_eq!(run_ok("print 2 <= 2;"), "true\n");
        assert_eq!(run_ok("print 3 > 4;"), "false\n");
        assert_eq!(run_ok("print 4 >= 5;"), "false\n");
        assert_eq!(run_ok("print 1 == 1;"), "true\n");
        assert_eq!(run_ok("print 1 != 1;"), "false\n");
        assert_eq!(run_ok("print \"a\" == \"a\";"), "true\n");
        assert_eq!(run_ok("print \"a\" == \"b\";"), "false\n");
        assert_eq!(run_ok("print nil == false;"), "false\n");
        assert_eq!(run_ok("print nil == nil;"), "true\n");
    }

    #[test]
    fn truthiness_and_logic() {
        assert_eq!(run_ok("print !nil;"), "true\n");
        assert_eq!(run_ok("print !0;"), "false\n");
        assert_eq!(run_ok("print !\"\";"), "false\n");
        assert_eq!(run_ok("print nil or \"default\";"), "default\n");
        assert_eq!(run_ok("print false and 1;"), "false\n");
        assert_eq!(run_ok("print 1 and 2;"), "2\n");
    }

    #[test]
    fn string_concatenation() {
        assert_eq!(run_ok("var a = \"foo\"; var b = \"bar\"; print a + b;"), "foobar\n");
        assert_eq!(run_err("print \"a\" + 1;"), "");
    }

    #[test]
    fn globals_and_locals() {
        assert_eq!(run_ok("var a = 1; a = a + 1; print a;"), "2\n");
        assert_eq!(run_ok("var a = 1; { var a = 2; print a; } print a;"), "2\n1\n");
        assert_eq!(run_err("print missing;"), "");
        assert_eq!(run_err("missing = 1;"), "");
    }

    #[test]
    fn compound_assignment() {
        assert_eq!(run_ok("var x = 1; x += 2; print x;"), "3\n");
        assert_eq!(run_ok("var x = 8; x /= 2; x -= 1; x *= 3; print x;"), "9\n");
        assert_eq!(run_ok("var x = 7; x %= 4; print x;"), "3\n");
        assert_eq!(run_ok("var x = 2; x **= 3; print x;"), "8\n");
        assert_eq!(run_ok("var x = 1; print x++;"), "2\n");
        assert_eq!(run_ok("var x = 1; x++; print x;"), "2\n");
        assert_eq!(run_ok("var x = 1; x--; print x;"), "0\n");
    }

    #[test]
    fn control_flow() {
        assert_eq!(run_ok("if (1 < 2) print \"yes\"; else print \"no\";"), "yes\n");
        assert_eq!(run_ok("if (nil) print \"yes\"; else print \"no\";"), "no\n");
        assert_eq!(
            run_ok("var i = 0; while (i < 3) { print i; i = i + 1; }"),
            "0\n1\n2\n"
        );
        assert_eq!(run_ok("for (var i = 0; i < 3; i++) print i;"), "0\n1\n2\n");
        assert_eq!(run_ok("var sum = 0; for (var i = 1; i <= 10; i++) sum += i; print sum;"), "55\n");
    }

    #[test]
    fn functions_and_recursion() {
        assert_eq!(
            run_ok("fun add(a, b) { return a + b; } print add(1, 2);"),
            "3\n"
        );
        assert_eq!(
            run_ok("fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print fib(10);"),
            "55\n"
        );
        assert_eq!(run_ok("fun f() {} print f();"), "nil\n");
        assert_eq!(run_ok("fun f() {} print f;"), "<fn f>\n");
    }

    #[test]
    fn arity_mismatch_aborts_the_call() {
        assert_eq!(run_err("fun f(a) { return a; } f(1, 2);"), "");
        assert_eq!(run_err("fun f(a) { return a; } f();"), "");
    }

    #[test]
    fn deep_recursion_overflows() {
        assert_eq!(run_err("fun f() { f(); } f();"), "");
    }

    #[test]
    fn closures_count_upward() {
        let source = "fun make() { var x = 0; fun inc() { x = x + 1; return x; } return inc; } \
                      var f = make(); print f(); print f(); print f();";
        assert_eq!(run_ok(source), "1\n2\n3\n");
    }

    #[test]
    fn closures_share_captured_variables() {
        let source = "fun make() { var x = 0; fun inc() { x = x + 1; } fun get() { return x; } \
                      inc(); inc(); return get; } print make()();";
        assert_eq!(run_ok(source), "2\n");
    }

    #[test]
    fn upvalues_close_over_the_right_values() {
        let source = "var fs = nil; { var a = \"outer\"; fun f() { print a; } fs = f; } fs();";
        assert_eq!(run_ok(source), "outer\n");
    }

    #[test]
    fn captures_survive_the_defining_frame() {
        let source = "fun outer() { var x = \"outside\"; fun inner() { print x; } return inner; } \
                      outer()();";
        assert_eq!(run_ok(source), "outside\n");
    }

    #[test]
    fn classes_and_instances() {
        assert_eq!(run_ok("class A {} print A;"), "A\n");
        assert_eq!(run_ok("class A {} print A();"), "A instance\n");
        assert_eq!(
            run_ok("class A {} var a = A(); a.field = 3; print a.field;"),
            "3\n"
        );
        assert_eq!(
            run_ok("class Greeter { init(n) { this.n = n; } hi() { print \"hi \" + this.n; } } \
                    Greeter(\"world\").hi();"),
            "hi world\n"
        );
        assert_eq!(run_err("class A {} A(1);"), "");
        assert_eq!(run_err("class A {} print A().missing;"), "");
        assert_eq!(run_err("var x = 3; x.field = 1;"), "");
    }

    #[test]
    fn methods_bind_their_receiver() {
        let source = "class A { init() { this.n = 7; } get() { return this.n; } } \
                      var m = A().get; print m();";
        assert_eq!(run_ok(source), "7\n");
    }

    #[test]
    fn fields_shadow_methods() {
        let source = "class A { m() { return \"method\"; } } var a = A(); \
                      fun f() { return \"field\"; } a.m = f; print a.m();";
        assert_eq!(run_ok(source), "field\n");
    }

    #[test]
    fn inheritance_and_super() {
        let source = "class A { method() { print \"A method\"; } } \
                      class B < A { method() { print \"B method\"; } test() { super.method(); } } \
                      B().test();";
        assert_eq!(run_ok(source), "A method\n");

        let source = "class A { m() { return 1; } } class B < A {} print B().m();";
        assert_eq!(run_ok(source), "1\n");

        let source = "class A { init(n) { this.n = n; } } \
                      class B < A { init(n) { super.init(n * 2); } } print B(3).n;";
        assert_eq!(run_ok(source), "6\n");

        assert_eq!(run_err("var NotAClass = 3; class B < NotAClass {}"), "");
    }

    #[test]
    fn constants_are_write_protected() {
        assert_eq!(run_err("const K = 10; K = 11;"), "");
        assert_eq!(run_err("const K = 1; const K = 2;"), "");
        assert_eq!(run_err("var K = 1; const K = 2;"), "");
        assert_eq!(run_ok("const K = 10; print K + 1;"), "11\n");
        // the constness bit travels with the value into a local slot
        assert_eq!(run_err("const K = 1; fun f() { var x = K; x = 2; } f();"), "");
    }

    #[test]
    fn to_str_property() {
        assert_eq!(run_ok("print (3).to_str + \"!\";"), "3!\n");
        assert_eq!(run_ok("print (2.5).to_str;"), "2.5\n");
        assert_eq!(run_ok("print true.to_str;"), "true\n");
        assert_eq!(run_ok("print nil.to_str;"), "nil\n");
        assert_eq!(run_ok("print \"already\".to_str;"), "already\n");
        assert_eq!(run_err("print (3).missing;"), "");
    }

    #[test]
    fn exit_halts_cleanly() {
        assert_eq!(run_ok("print 1; exit; print 2;"), "1\n");
    }

    #[test]
    fn natives() {
        assert_eq!(run_ok("print to_int(3.7);"), "3\n");
        assert_eq!(run_ok("print to_int(-3.7);"), "-3\n");
        assert_eq!(run_ok("print pi();"), "3.14159\n");
        assert_eq!(run_ok("print sin(0);"), "0\n");
        assert_eq!(run_ok("print cos(0);"), "1\n");
        assert_eq!(run_ok("print clock() >= 0;"), "true\n");
        assert_eq!(run_ok("print endl;"), "<native fn>\n");
        assert_eq!(run_ok("var r = err(\"boom\"); print r;"), "Error thrown: boom\nnil\n");
        assert_eq!(run_ok("endl();"), "\n");
        assert_eq!(run_err("to_int();"), "");
        assert_eq!(run_err("to_int(\"3\");"), "");
        assert_eq!(run_err("pi(1);"), "");
    }

    #[test]
    fn to_int_is_idempotent_on_integers() {
        assert_eq!(run_ok("print to_int(to_int(41.9)) == to_int(41.9);"), "true\n");
    }

    #[test]
    fn globals_persist_across_interprets() {
        let buffer = SharedBuffer::default();
        let mut vm = Vm::with_out(Box::new(buffer.clone()));
        assert_eq!(
            vm.interpret("var a = 1;", &mut SilentReporter),
            InterpretResult::Ok
        );
        assert_eq!(
            vm.interpret("print a;", &mut SilentReporter),
            InterpretResult::Ok
        );
        assert_eq!(String::from_utf8(buffer.0.borrow().clone()).unwrap(), "1\n");
    }

    #[test]
    fn stack_is_reset_after_runtime_error() {
        let mut vm = Vm::with_out(Box::new(SharedBuffer::default()));
        assert_eq!(
            vm.interpret("var a = 1 + nil;", &mut SilentReporter),
            InterpretResult::RuntimeError
        );
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
        assert!(vm.open_upvalues.is_empty());
        assert_eq!(
            vm.interpret("print 1;", &mut SilentReporter),
            InterpretResult::Ok
        );
    }

    #[test]
    fn open_upvalue_list_is_sorted_and_unique() {
        let mut vm = Vm::new();
        vm.stack.push(Value::from(1.0));
        vm.stack.push(Value::from(2.0));
        vm.stack.push(Value::from(3.0));

        let a = vm.capture_upvalue(1);
        let _b = vm.capture_upvalue(0);
        let c = vm.capture_upvalue(2);
        assert_eq!(vm.capture_upvalue(1), a);

        let locations: Vec<usize> = vm
            .open_upvalues
            .iter()
            .map(|upvalue| vm.heap.upvalue(*upvalue).as_open())
            .collect();
        assert_eq!(locations, vec![2, 1, 0]);

        vm.close_upvalues(1);
        assert!(matches!(vm.heap.upvalue(a), Upvalue::Closed(value) if value.as_number() == 2.0));
        assert!(matches!(vm.heap.upvalue(c), Upvalue::Closed(value) if value.as_number() == 3.0));
        let locations: Vec<usize> = vm
            .open_upvalues
            .iter()
            .map(|upvalue| vm.heap.upvalue(*upvalue).as_open())
            .collect();
        assert_eq!(locations, vec![0]);
    }

    #[test]
    fn gc_reclaims_short_lived_strings() {
        let buffer = SharedBuffer::default();
        let mut vm = Vm::with_out(Box::new(buffer.clone()));
        let source = "var i = 0; while (i < 100000) { var s = (i).to_str + \"-tail\"; i = i + 1; } \
                      print \"done\";";
        assert_eq!(vm.interpret(source, &mut SilentReporter), InterpretResult::Ok);
        assert_eq!(String::from_utf8(buffer.0.borrow().clone()).unwrap(), "done\n");
        // the heap stays bounded: dead strings were collected along the way
        assert!(vm.heap.bytes_allocated() < 1024 * 1024);
    }

    #[test]
    fn interned_strings_survive_collection() {
        let mut vm = Vm::with_out(Box::new(SharedBuffer::default()));
        assert_eq!(
            vm.interpret("var a = \"keep\" + \"er\";", &mut SilentReporter),
            InterpretResult::Ok
        );
        vm.collect_garbage();
        let kept = vm.heap.intern("keeper");
        let global = vm.globals.values().find(|value| {
            value.as_obj() == Some(kept)
        });
        assert!(global.is_some(), "the live global still names the canonical string");
    }
}
