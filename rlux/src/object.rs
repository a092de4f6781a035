use std::{cell::RefCell, collections::HashMap, fmt};

use crate::{intern, Chunk, Gc, RuntimeError, StrId, Value, ValueKey};

/// A structure for managing closed-over value
#[derive(Debug)]
pub enum ObjUpvalue {
    /// This field stores a slot offset which points to a value that was captured
    Open(usize),
    /// This stores the closed over value
    Closed(Value),
}

/// A function that captures its surrounding environment,
#[derive(Debug)]
pub struct ObjClosure {
    /// The base function of this closure
    pub fun: Gc<ObjFun>,
    /// Upvalues for indirect access to closed-over variables
    pub upvalues: Vec<Gc<RefCell<ObjUpvalue>>>,
}

impl fmt::Display for ObjClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fun)
    }
}

/// A function object that holds the bytecode of the function along with other metadata
#[derive(Debug)]
pub struct ObjFun {
    /// The name of the function
    pub name: StrId,
    /// Number of parameters the function has
    pub arity: u8,
    /// Number of variables captured from enclosing scopes
    pub upvalue_count: usize,
    /// The bytecode chunk of this function
    pub chunk: Chunk,
}

impl fmt::Display for ObjFun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name_str = intern::str(self.name);
        if name_str.is_empty() {
            write!(f, "<script>")
        } else {
            write!(f, "<fn {}>", name_str)
        }
    }
}

/// A class object holding its methods and default field values
#[derive(Debug)]
pub struct ObjClass {
    /// The name of the class
    pub name: StrId,
    /// Methods indexed by their interned name
    pub methods: HashMap<StrId, Value>,
    /// Default field values copied onto new instances
    pub fields: HashMap<StrId, Value>,
}

impl ObjClass {
    /// Create a class with the given name and no methods.
    pub fn new(name: StrId) -> Self {
        Self {
            name,
            methods: HashMap::new(),
            fields: HashMap::new(),
        }
    }
}

impl fmt::Display for ObjClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", intern::str(self.name))
    }
}

/// An instance of a class, holding its own copy of the fields
#[derive(Debug)]
pub struct ObjInstance {
    /// The class this instance was created from
    pub class: Gc<RefCell<ObjClass>>,
    /// Fields indexed by their interned name
    pub fields: HashMap<StrId, Value>,
}

impl ObjInstance {
    /// Create an instance of the class, starting from the class's default fields.
    pub fn new(class: Gc<RefCell<ObjClass>>) -> Self {
        let fields = class.borrow().fields.clone();
        Self { class, fields }
    }
}

impl fmt::Display for ObjInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} instance", intern::str(self.class.borrow().name))
    }
}

/// A method bound to the instance it was accessed through
#[derive(Debug)]
pub struct ObjBoundMethod {
    /// The instance that the method was accessed through
    pub receiver: Value,
    /// The underlying closure
    pub method: Gc<ObjClosure>,
}

impl fmt::Display for ObjBoundMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.method)
    }
}

/// A mutable mapping from value keys to values
#[derive(Debug, Default)]
pub struct ObjTable {
    /// The table's entries
    pub entries: HashMap<ValueKey, Value>,
}

impl fmt::Display for ObjTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ")?;
        for (key, val) in &self.entries {
            write!(f, "{}: {}, ", key.as_value(), val)?;
        }
        write!(f, "}}")
    }
}

/// A mutable ordered sequence of values
#[derive(Debug, Default)]
pub struct ObjArray {
    /// The array's elements
    pub values: Vec<Value>,
}

impl fmt::Display for ObjArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (idx, val) in self.values.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", val)?;
        }
        write!(f, "]")
    }
}

/// A native function
#[derive(Clone)]
pub struct NativeFun {
    /// Function's name
    pub name: StrId,
    /// Native function reference
    pub call: fn(&[Value]) -> Result<Value, RuntimeError>,
}

impl fmt::Display for NativeFun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native fn>")
    }
}

impl fmt::Debug for NativeFun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native fn>")
    }
}
