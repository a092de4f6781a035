use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;

use crate::{
    compile, intern, native, Error, Gc, NativeFun, ObjBoundMethod, ObjClass, ObjClosure,
    ObjInstance, ObjTable, ObjUpvalue, OpCode, RuntimeError, StrId, Value, ValueKey, MAX_FRAMES,
    MAX_STACK,
};

/// An activation record on the call stack.
#[derive(Debug)]
struct CallFrame {
    closure: Gc<ObjClosure>,
    ip: usize,
    slots: usize,
}

/// Interned names the dispatch loop looks up on every overloaded operator.
#[derive(Debug)]
struct HookNames {
    init: StrId,
    add: StrId,
    sub: StrId,
    mul: StrId,
    div: StrId,
    modulo: StrId,
    bit_and: StrId,
    bit_or: StrId,
    bit_xor: StrId,
    eq: StrId,
    gt: StrId,
    lt: StrId,
    // Cached alongside the others even though no opcode dispatches to it yet.
    #[allow(dead_code)]
    not: StrId,
}

impl HookNames {
    fn new() -> Self {
        Self {
            init: intern::id("init"),
            add: intern::id("__add"),
            sub: intern::id("__sub"),
            mul: intern::id("__mul"),
            div: intern::id("__div"),
            modulo: intern::id("__mod"),
            bit_and: intern::id("__and"),
            bit_or: intern::id("__or"),
            bit_xor: intern::id("__xor"),
            eq: intern::id("__eq"),
            gt: intern::id("__gt"),
            lt: intern::id("__lt"),
            not: intern::id("__not"),
        }
    }
}

/// A bytecode virtual machine for the Lux programming language
#[derive(Debug)]
pub struct VM {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: HashMap<StrId, Value>,
    open_upvalues: Vec<Gc<RefCell<ObjUpvalue>>>,
    names: HookNames,
}

impl Default for VM {
    fn default() -> Self {
        let mut vm = Self {
            stack: Vec::with_capacity(MAX_STACK),
            frames: Vec::with_capacity(MAX_FRAMES),
            globals: HashMap::default(),
            open_upvalues: Vec::new(),
            names: HookNames::new(),
        };
        for entry in native::GLOBAL_FNS {
            vm.define_native(entry.name, entry.fun);
        }
        vm
    }
}

impl VM {
    /// Register a native callable under the given name in the globals table.
    pub fn define_native(
        &mut self,
        name: &str,
        call: fn(&[Value]) -> Result<Value, RuntimeError>,
    ) {
        let name = intern::id(name);
        self.globals.insert(name, Value::NativeFun(NativeFun { name, call }));
    }

    /// Compile and run a top-level script. Output of `dump` statements goes to
    /// `out`, diagnostics go to stderr. After a runtime error the machine is
    /// reset and can be reused for another script.
    pub fn interpret(&mut self, src: &str, out: &mut impl Write) -> Result<(), Error> {
        let fun = match compile(src) {
            Ok(fun) => fun,
            Err(errors) => {
                for err in &errors {
                    eprintln!("{}", err);
                }
                return Err(Error::Compile(errors));
            }
        };

        let closure = Gc::new(ObjClosure {
            fun,
            upvalues: Vec::new(),
        });
        self.stack.push(Value::Closure(Gc::clone(&closure)));
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots: 0,
        });

        match self.run(out) {
            Ok(()) => Ok(()),
            Err(err) => {
                eprintln!("{}", err);
                self.print_stack_trace();
                self.reset();
                Err(Error::Runtime(err))
            }
        }
    }

    /// Run the virtual machine's dispatch loop until the script returns.
    fn run(&mut self, out: &mut impl Write) -> Result<(), RuntimeError> {
        loop {
            let frame = self.frames.last_mut().expect("Call frame must be present.");
            let fun = Gc::clone(&frame.closure.fun);
            let ip = frame.ip;
            frame.ip += 1;
            let (opcode, _) = fun.chunk.read_instruction(ip);

            match opcode {
                OpCode::Constant(const_id) => {
                    let val = fun.chunk.read_const(*const_id).clone();
                    self.push(val)?;
                }
                OpCode::Nil => self.push(Value::Nil)?,
                OpCode::True => self.push(Value::Bool(true))?,
                OpCode::False => self.push(Value::Bool(false))?,
                OpCode::Pop => {
                    self.pop()?;
                }
                OpCode::Dup => {
                    let val = self.peek(0)?.clone();
                    self.push(val)?;
                }
                OpCode::GetLocal(slot) => {
                    let base = self.frame().slots;
                    let local = self.stack[base + *slot as usize].clone();
                    self.push(local)?;
                }
                OpCode::SetLocal(slot) => {
                    let base = self.frame().slots;
                    let val = self.peek(0)?.clone();
                    self.stack[base + *slot as usize] = val;
                }
                OpCode::GetGlobal(const_id) => {
                    let name = read_name(&fun, *const_id);
                    let val = self
                        .globals
                        .get(&name)
                        .ok_or_else(|| RuntimeError::UndefinedVariable(intern::str(name)))?
                        .clone();
                    self.push(val)?;
                }
                OpCode::DefineGlobal(const_id) => {
                    let name = read_name(&fun, *const_id);
                    let val = self.peek(0)?.clone();
                    self.globals.insert(name, val);
                    self.pop()?;
                }
                OpCode::SetGlobal(const_id) => {
                    let name = read_name(&fun, *const_id);
                    if !self.globals.contains_key(&name) {
                        return Err(RuntimeError::UndefinedVariable(intern::str(name)));
                    }
                    let val = self.peek(0)?.clone();
                    self.globals.insert(name, val);
                }
                OpCode::GetUpvalue(slot) => {
                    let upvalue = Gc::clone(&self.frame().closure.upvalues[*slot as usize]);
                    let val = match &*upvalue.borrow() {
                        ObjUpvalue::Open(slot) => self.stack[*slot].clone(),
                        ObjUpvalue::Closed(val) => val.clone(),
                    };
                    self.push(val)?;
                }
                OpCode::SetUpvalue(slot) => {
                    let val = self.peek(0)?.clone();
                    let upvalue = Gc::clone(&self.frame().closure.upvalues[*slot as usize]);
                    let mut upvalue = upvalue.borrow_mut();
                    match &mut *upvalue {
                        ObjUpvalue::Open(slot) => self.stack[*slot] = val,
                        ObjUpvalue::Closed(closed) => *closed = val,
                    }
                }
                OpCode::GetProperty(const_id) => {
                    let name = read_name(&fun, *const_id);
                    match self.peek(0)?.clone() {
                        Value::Instance(instance) => {
                            let field = instance.borrow().fields.get(&name).cloned();
                            match field {
                                Some(val) => {
                                    *self.peek_mut(0)? = val;
                                }
                                None => {
                                    let class = Gc::clone(&instance.borrow().class);
                                    self.bind_method(&class, name)?;
                                }
                            }
                        }
                        Value::Table(table) => {
                            let entry = table
                                .borrow()
                                .entries
                                .get(&ValueKey::new(Value::Str(name)))
                                .cloned()
                                .ok_or_else(|| {
                                    RuntimeError::UndefinedProperty(intern::str(name))
                                })?;
                            *self.peek_mut(0)? = entry;
                        }
                        _ => return Err(RuntimeError::NoProperties),
                    }
                }
                OpCode::SetProperty(const_id) => {
                    let name = read_name(&fun, *const_id);
                    match self.peek(1)?.clone() {
                        Value::Instance(instance) => {
                            let val = self.peek(0)?.clone();
                            instance.borrow_mut().fields.insert(name, val);
                        }
                        Value::Table(table) => {
                            let val = self.peek(0)?.clone();
                            table
                                .borrow_mut()
                                .entries
                                .insert(ValueKey::new(Value::Str(name)), val);
                        }
                        _ => return Err(RuntimeError::NoFields),
                    }
                    let val = self.pop()?;
                    self.pop()?;
                    self.push(val)?;
                }
                OpCode::GetSuper(const_id) => {
                    let name = read_name(&fun, *const_id);
                    let superclass = match self.pop()? {
                        Value::Class(class) => class,
                        _ => unreachable!("The compiler only emits GetSuper below a class."),
                    };
                    self.bind_method(&superclass, name)?;
                }
                OpCode::Equal => {
                    if self.peek(0)?.is_instance() && self.peek(1)?.is_instance() {
                        self.invoke_dunder(self.names.eq)?;
                    } else {
                        let v2 = self.pop()?;
                        let v1 = self.peek_mut(0)?;
                        let equal = &*v1 == &v2;
                        *v1 = Value::Bool(equal);
                    }
                }
                OpCode::Greater => {
                    if self.peek(0)?.is_instance() && self.peek(1)?.is_instance() {
                        self.invoke_dunder(self.names.gt)?;
                    } else {
                        let v2 = self.pop()?;
                        let v1 = self.peek_mut(0)?;
                        let res = v1.gt(&v2)?;
                        *v1 = res;
                    }
                }
                OpCode::Less => {
                    if self.peek(0)?.is_instance() && self.peek(1)?.is_instance() {
                        self.invoke_dunder(self.names.lt)?;
                    } else {
                        let v2 = self.pop()?;
                        let v1 = self.peek_mut(0)?;
                        let res = v1.lt(&v2)?;
                        *v1 = res;
                    }
                }
                OpCode::Add => self.binary_op(self.names.add, |v1, v2| v1 + v2)?,
                OpCode::Subtract => self.binary_op(self.names.sub, |v1, v2| v1 - v2)?,
                OpCode::Multiply => self.binary_op(self.names.mul, |v1, v2| v1 * v2)?,
                OpCode::Divide => self.binary_op(self.names.div, |v1, v2| v1 / v2)?,
                OpCode::Modulo => self.binary_op(self.names.modulo, |v1, v2| v1 % v2)?,
                OpCode::BitwiseAnd => self.binary_op(self.names.bit_and, |v1, v2| v1 & v2)?,
                OpCode::BitwiseOr => self.binary_op(self.names.bit_or, |v1, v2| v1 | v2)?,
                OpCode::BitwiseXor => self.binary_op(self.names.bit_xor, |v1, v2| v1 ^ v2)?,
                OpCode::ShiftLeft => {
                    let v2 = self.pop()?;
                    let v1 = self.peek_mut(0)?;
                    let res = (&*v1 << &v2)?;
                    *v1 = res;
                }
                OpCode::ShiftRight => {
                    let v2 = self.pop()?;
                    let v1 = self.peek_mut(0)?;
                    let res = (&*v1 >> &v2)?;
                    *v1 = res;
                }
                OpCode::Not => {
                    let val = self.pop()?;
                    self.push(!&val)?;
                }
                OpCode::Negate => {
                    let v = self.peek_mut(0)?;
                    let res = (-&*v)?;
                    *v = res;
                }
                OpCode::Increment => {
                    let v = self.peek_mut(0)?;
                    match v {
                        Value::Number(n) => *n += 1.0,
                        _ => return Err(RuntimeError::OperandMustBeNumber),
                    }
                }
                OpCode::Decrement => {
                    let v = self.peek_mut(0)?;
                    match v {
                        Value::Number(n) => *n -= 1.0,
                        _ => return Err(RuntimeError::OperandMustBeNumber),
                    }
                }
                OpCode::Jump(offset) => {
                    self.frame_mut().ip += *offset as usize;
                }
                OpCode::JumpIfFalse(offset) => {
                    if self.peek(0)?.is_falsey() {
                        self.frame_mut().ip += *offset as usize;
                    }
                }
                OpCode::Loop(offset) => {
                    self.frame_mut().ip -= *offset as usize;
                }
                OpCode::Call(argc) => {
                    let callee = self.peek(*argc as usize)?.clone();
                    self.call_value(callee, *argc)?;
                }
                OpCode::Invoke(const_id, argc) => {
                    let name = read_name(&fun, *const_id);
                    self.invoke(name, *argc)?;
                }
                OpCode::SuperInvoke(const_id, argc) => {
                    let name = read_name(&fun, *const_id);
                    let superclass = match self.pop()? {
                        Value::Class(class) => class,
                        _ => unreachable!("The compiler only emits SuperInvoke below a class."),
                    };
                    self.invoke_from_class(&superclass, name, *argc)?;
                }
                OpCode::Index => {
                    let index = self.pop()?;
                    let value = self.pop()?;
                    self.index_value(value, index)?;
                }
                OpCode::SetIndex => {
                    self.set_index()?;
                }
                OpCode::Closure(const_id, upvalue_refs) => {
                    let function = match fun.chunk.read_const(*const_id) {
                        Value::Fun(function) => Gc::clone(function),
                        _ => unreachable!("Closure constants always hold a function."),
                    };
                    let (slots, enclosing) = {
                        let frame = self.frame();
                        (frame.slots, Gc::clone(&frame.closure))
                    };
                    let mut upvalues = Vec::with_capacity(upvalue_refs.len());
                    for upvalue_ref in upvalue_refs {
                        if upvalue_ref.is_local {
                            upvalues
                                .push(self.capture_upvalue(slots + upvalue_ref.index as usize));
                        } else {
                            upvalues.push(Gc::clone(
                                &enclosing.upvalues[upvalue_ref.index as usize],
                            ));
                        }
                    }
                    self.push(Value::Closure(Gc::new(ObjClosure {
                        fun: function,
                        upvalues,
                    })))?;
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop()?;
                }
                OpCode::SetTable(count) => {
                    let mut table = ObjTable::default();
                    for _ in 0..*count {
                        let val = self.pop()?;
                        let key = self.pop()?;
                        table.entries.insert(ValueKey::new(key), val);
                    }
                    self.push(Value::Table(Gc::new(RefCell::new(table))))?;
                }
                OpCode::SetArray(count) => {
                    let start = self.stack.len() - *count as usize;
                    let values = self.stack.split_off(start);
                    self.push(Value::Array(Gc::new(RefCell::new(crate::ObjArray {
                        values,
                    }))))?;
                }
                OpCode::Return => {
                    let result = self.pop()?;
                    let frame = self.frames.pop().expect("Call frame must be present.");
                    self.close_upvalues(frame.slots);
                    if self.frames.is_empty() {
                        self.stack.truncate(frame.slots);
                        return Ok(());
                    }
                    self.stack.truncate(frame.slots);
                    self.push(result)?;
                }
                OpCode::Dump => {
                    let val = self.pop()?;
                    writeln!(out, "{}", val).expect("Unable to write to output.");
                }
                OpCode::Class(const_id) => {
                    let name = read_name(&fun, *const_id);
                    self.push(Value::Class(Gc::new(RefCell::new(ObjClass::new(name)))))?;
                }
                OpCode::Inherit => {
                    let superclass = match self.peek(1)? {
                        Value::Class(class) => Gc::clone(class),
                        _ => return Err(RuntimeError::InvalidSuperclass),
                    };
                    let subclass = match self.peek(0)? {
                        Value::Class(class) => Gc::clone(class),
                        _ => unreachable!("The compiler only emits Inherit above a class."),
                    };
                    let methods: Vec<(StrId, Value)> = superclass
                        .borrow()
                        .methods
                        .iter()
                        .map(|(name, method)| (*name, method.clone()))
                        .collect();
                    subclass.borrow_mut().methods.extend(methods);
                    self.pop()?;
                }
                OpCode::Method(const_id) => {
                    let name = read_name(&fun, *const_id);
                    let method = self.peek(0)?.clone();
                    match self.peek(1)? {
                        Value::Class(class) => {
                            class.borrow_mut().methods.insert(name, method);
                        }
                        _ => unreachable!("The compiler only emits Method above a class."),
                    }
                    self.pop()?;
                }
                OpCode::Property(const_id) => {
                    let name = read_name(&fun, *const_id);
                    let field = self.peek(0)?.clone();
                    match self.peek(1)? {
                        Value::Class(class) => {
                            class.borrow_mut().fields.insert(name, field);
                        }
                        _ => unreachable!("Property is only emitted above a class."),
                    }
                    self.pop()?;
                }
            }
        }
    }

    /// Apply a binary operator, going through the matching `__op` method when
    /// both operands are instances of the same class.
    fn binary_op(
        &mut self,
        hook: StrId,
        op: fn(&Value, &Value) -> Result<Value, RuntimeError>,
    ) -> Result<(), RuntimeError> {
        if self.peek(0)?.is_instance() && self.peek(1)?.is_instance() {
            return self.invoke_dunder(hook);
        }
        let v2 = self.pop()?;
        let v1 = self.peek_mut(0)?;
        let res = op(v1, &v2)?;
        *v1 = res;
        Ok(())
    }

    /// Dispatch an overloaded operator to the left instance, passing the right
    /// instance as the only argument. Both operands must belong to one class.
    fn invoke_dunder(&mut self, name: StrId) -> Result<(), RuntimeError> {
        let lhs = match self.peek(1)? {
            Value::Instance(instance) => Gc::clone(instance),
            _ => unreachable!("Dunder dispatch requires two instances."),
        };
        let rhs = match self.peek(0)? {
            Value::Instance(instance) => Gc::clone(instance),
            _ => unreachable!("Dunder dispatch requires two instances."),
        };
        if !Gc::ptr_eq(&lhs.borrow().class, &rhs.borrow().class) {
            return Err(RuntimeError::CrossClassOperands);
        }
        self.invoke(name, 1)
    }

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), RuntimeError> {
        match callee {
            Value::BoundMethod(bound) => {
                let slot = self.stack.len() - argc as usize - 1;
                self.stack[slot] = bound.receiver.clone();
                self.call(Gc::clone(&bound.method), argc)
            }
            Value::Class(class) => {
                let slot = self.stack.len() - argc as usize - 1;
                self.stack[slot] = Value::Instance(Gc::new(RefCell::new(ObjInstance::new(
                    Gc::clone(&class),
                ))));

                let initializer = class.borrow().methods.get(&self.names.init).cloned();
                match initializer {
                    Some(Value::Closure(initializer)) => self.call(initializer, argc),
                    Some(_) => unreachable!("Methods are always closures."),
                    None if argc != 0 => Err(RuntimeError::ArityMismatch {
                        expected: 0,
                        got: argc,
                    }),
                    None => Ok(()),
                }
            }
            Value::Closure(closure) => self.call(closure, argc),
            Value::NativeFun(native) => {
                let args_start = self.stack.len() - argc as usize;
                let result = (native.call)(&self.stack[args_start..])?;
                self.stack.truncate(args_start - 1);
                self.push(result)?;
                Ok(())
            }
            _ => Err(RuntimeError::InvalidCall),
        }
    }

    fn call(&mut self, closure: Gc<ObjClosure>, argc: u8) -> Result<(), RuntimeError> {
        if argc != closure.fun.arity {
            return Err(RuntimeError::ArityMismatch {
                expected: closure.fun.arity,
                got: argc,
            });
        }
        if self.frames.len() == MAX_FRAMES {
            return Err(RuntimeError::StackOverflow);
        }
        self.frames.push(CallFrame {
            slots: self.stack.len() - argc as usize - 1,
            ip: 0,
            closure,
        });
        Ok(())
    }

    /// Combined property access and call. Going straight to the class skips
    /// allocating a bound method unless a field shadows the method name.
    fn invoke(&mut self, name: StrId, argc: u8) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc as usize)?.clone();
        let instance = match receiver {
            Value::Instance(instance) => instance,
            _ => return Err(RuntimeError::NoMethods),
        };

        let field = instance.borrow().fields.get(&name).cloned();
        if let Some(val) = field {
            let slot = self.stack.len() - argc as usize - 1;
            self.stack[slot] = val.clone();
            return self.call_value(val, argc);
        }

        let class = Gc::clone(&instance.borrow().class);
        self.invoke_from_class(&class, name, argc)
    }

    fn invoke_from_class(
        &mut self,
        class: &Gc<RefCell<ObjClass>>,
        name: StrId,
        argc: u8,
    ) -> Result<(), RuntimeError> {
        let method = class
            .borrow()
            .methods
            .get(&name)
            .cloned()
            .ok_or_else(|| RuntimeError::UndefinedProperty(intern::str(name)))?;
        match method {
            Value::Closure(closure) => self.call(closure, argc),
            _ => unreachable!("Methods are always closures."),
        }
    }

    fn bind_method(
        &mut self,
        class: &Gc<RefCell<ObjClass>>,
        name: StrId,
    ) -> Result<(), RuntimeError> {
        let method = class
            .borrow()
            .methods
            .get(&name)
            .cloned()
            .ok_or_else(|| RuntimeError::UndefinedProperty(intern::str(name)))?;
        let method = match method {
            Value::Closure(closure) => closure,
            _ => unreachable!("Methods are always closures."),
        };
        let receiver = self.pop()?;
        self.push(Value::BoundMethod(Gc::new(ObjBoundMethod {
            receiver,
            method,
        })))
    }

    fn index_value(&mut self, value: Value, index: Value) -> Result<(), RuntimeError> {
        match value {
            Value::Str(s) => {
                let i = match index {
                    Value::Number(n) => n as i64,
                    _ => return Err(RuntimeError::IndexMustBeNumber),
                };
                let c = if i < 0 {
                    None
                } else {
                    intern::char_at(s, i as usize)
                };
                let c = c.ok_or(RuntimeError::StringIndexOutOfBounds)?;
                self.push(Value::Str(c))
            }
            Value::Table(table) => {
                let entry = table
                    .borrow()
                    .entries
                    .get(&ValueKey::new(index.clone()))
                    .cloned()
                    .ok_or_else(|| RuntimeError::UndefinedTableKey(index.to_string()))?;
                self.push(entry)
            }
            Value::Array(array) => {
                let i = match index {
                    Value::Number(n) => n as i64,
                    _ => return Err(RuntimeError::IndexMustBeNumber),
                };
                let array = array.borrow();
                if i < 0 || i as usize >= array.values.len() {
                    return Err(RuntimeError::ArrayIndexOutOfBounds);
                }
                let entry = array.values[i as usize].clone();
                drop(array);
                self.push(entry)
            }
            _ => Err(RuntimeError::NotIndexable),
        }
    }

    /// Write through a subscript. The mutated container is pushed back as the
    /// result of the assignment expression.
    fn set_index(&mut self) -> Result<(), RuntimeError> {
        match self.peek(2)?.clone() {
            Value::Table(table) => {
                let val = self.pop()?;
                let key = self.pop()?;
                self.pop()?;
                table
                    .borrow_mut()
                    .entries
                    .insert(ValueKey::new(key), val);
                self.push(Value::Table(table))
            }
            Value::Array(array) => {
                let val = self.pop()?;
                let index = self.pop()?;
                self.pop()?;
                let i = match index {
                    Value::Number(n) => n as i64,
                    _ => return Err(RuntimeError::IndexMustBeNumber),
                };
                {
                    let mut array = array.borrow_mut();
                    if i < 0 || i as usize >= array.values.len() {
                        return Err(RuntimeError::IndexOutOfBounds);
                    }
                    array.values[i as usize] = val;
                }
                self.push(Value::Array(array))
            }
            _ => Err(RuntimeError::NotIndexAssignable),
        }
    }

    /// Find or create the open upvalue pointing at the given stack slot. The
    /// open list stays sorted by strictly descending slot so closing can stop
    /// at the first slot below the boundary.
    fn capture_upvalue(&mut self, slot: usize) -> Gc<RefCell<ObjUpvalue>> {
        let mut idx = 0;
        while idx < self.open_upvalues.len() {
            match *self.open_upvalues[idx].borrow() {
                ObjUpvalue::Open(open_slot) if open_slot > slot => idx += 1,
                ObjUpvalue::Open(open_slot) if open_slot == slot => {
                    return Gc::clone(&self.open_upvalues[idx]);
                }
                _ => break,
            }
        }
        let upvalue = Gc::new(RefCell::new(ObjUpvalue::Open(slot)));
        self.open_upvalues.insert(idx, Gc::clone(&upvalue));
        upvalue
    }

    /// Close every open upvalue at or above the given stack slot by moving the
    /// captured value off the stack and into the upvalue itself.
    fn close_upvalues(&mut self, last: usize) {
        while let Some(upvalue) = self.open_upvalues.first() {
            let slot = match *upvalue.borrow() {
                ObjUpvalue::Open(slot) => slot,
                ObjUpvalue::Closed(_) => unreachable!("The open list holds only open upvalues."),
            };
            if slot < last {
                break;
            }
            let upvalue = self.open_upvalues.remove(0);
            let val = self.stack[slot].clone();
            *upvalue.borrow_mut() = ObjUpvalue::Closed(val);
        }
    }

    fn print_stack_trace(&self) {
        for frame in self.frames.iter().rev() {
            let fun = &frame.closure.fun;
            let (_, pos) = fun.chunk.read_instruction(frame.ip.saturating_sub(1));
            let name = intern::str(fun.name);
            if name.is_empty() {
                eprintln!("[line {}] in script", pos.line);
            } else {
                eprintln!("[line {}] in {}()", pos.line, name);
            }
        }
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("Call frame must be present.")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("Call frame must be present.")
    }

    fn peek(&self, steps: usize) -> Result<&Value, RuntimeError> {
        self.stack
            .get(self.stack.len() - 1 - steps)
            .ok_or(RuntimeError::StackUnderflow)
    }

    fn peek_mut(&mut self, steps: usize) -> Result<&mut Value, RuntimeError> {
        let idx = self.stack.len() - 1 - steps;
        self.stack.get_mut(idx).ok_or(RuntimeError::StackUnderflow)
    }

    fn push(&mut self, val: Value) -> Result<(), RuntimeError> {
        if self.stack.len() == MAX_STACK {
            return Err(RuntimeError::StackOverflow);
        }
        self.stack.push(val);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or(RuntimeError::StackUnderflow)
    }
}

fn read_name(fun: &crate::ObjFun, const_id: u8) -> StrId {
    match fun.chunk.read_const(const_id) {
        Value::Str(name) => *name,
        _ => unreachable!("Constant for the name must have been added."),
    }
}
