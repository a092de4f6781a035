//! Native functions and the module registry backing the `module(name)` global.
//!
//! Natives run synchronously on the interpreter thread and may not re-enter
//! the interpreter, so none of them take Lux callables as arguments.

use std::cell::RefCell;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{intern, table_from_entries, Gc, ObjTable, RuntimeError, Value, ValueKey};

/// The signature shared by every native callable.
pub type NativeFnPtr = fn(&[Value]) -> Result<Value, RuntimeError>;

/// One native function of a module or of the global scope.
#[derive(Debug, Clone, Copy)]
pub struct NativeFnEntry {
    /// The name the function is bound to
    pub name: &'static str,
    /// The function itself
    pub fun: NativeFnPtr,
}

/// A module that `module(name)` can materialize into a table.
#[derive(Debug, Clone, Copy)]
pub struct NativeModuleEntry {
    /// The name passed to `module(name)`
    pub name: &'static str,
    /// The functions populated into the module's table
    pub fns: &'static [NativeFnEntry],
    /// Ran after the functions are populated, typically to add constants
    pub post_init: Option<fn(&mut ObjTable)>,
}

/// Natives registered into the globals table on VM startup.
pub static GLOBAL_FNS: &[NativeFnEntry] = &[
    NativeFnEntry { name: "print", fun: print },
    NativeFnEntry { name: "println", fun: println },
    NativeFnEntry { name: "sprint", fun: sprint },
    NativeFnEntry { name: "len", fun: len },
    NativeFnEntry { name: "module", fun: module },
];

static SYSTEM_FNS: &[NativeFnEntry] = &[
    NativeFnEntry { name: "time", fun: time },
    NativeFnEntry { name: "mtime", fun: mtime },
    NativeFnEntry { name: "clock", fun: clock },
    NativeFnEntry { name: "sleep", fun: sleep },
    NativeFnEntry { name: "usleep", fun: usleep },
    NativeFnEntry { name: "exit", fun: exit },
];

static MATH_FNS: &[NativeFnEntry] = &[
    NativeFnEntry { name: "ceil", fun: math_ceil },
    NativeFnEntry { name: "floor", fun: math_floor },
    NativeFnEntry { name: "abs", fun: math_abs },
    NativeFnEntry { name: "exp", fun: math_exp },
    NativeFnEntry { name: "sqrt", fun: math_sqrt },
    NativeFnEntry { name: "sin", fun: math_sin },
    NativeFnEntry { name: "cos", fun: math_cos },
    NativeFnEntry { name: "tan", fun: math_tan },
    NativeFnEntry { name: "atan", fun: math_atan },
    NativeFnEntry { name: "atan2", fun: math_atan2 },
    NativeFnEntry { name: "pow", fun: math_pow },
    NativeFnEntry { name: "deg", fun: math_deg },
    NativeFnEntry { name: "rad", fun: math_rad },
    NativeFnEntry { name: "clamp", fun: math_clamp },
    NativeFnEntry { name: "lerp", fun: math_lerp },
    NativeFnEntry { name: "map", fun: math_map },
    NativeFnEntry { name: "norm", fun: math_norm },
    NativeFnEntry { name: "seed", fun: math_seed },
    NativeFnEntry { name: "rand", fun: math_rand },
];

static ARRAY_FNS: &[NativeFnEntry] = &[
    NativeFnEntry { name: "push", fun: array_push },
    NativeFnEntry { name: "pop", fun: array_pop },
    NativeFnEntry { name: "insert", fun: array_insert },
    NativeFnEntry { name: "remove", fun: array_remove },
    NativeFnEntry { name: "reverse", fun: array_reverse },
    NativeFnEntry { name: "sort", fun: array_sort },
    NativeFnEntry { name: "find", fun: array_find },
    NativeFnEntry { name: "findLast", fun: array_find_last },
    NativeFnEntry { name: "flatten", fun: array_flatten },
];

/// The registry consulted by the `module(name)` native.
pub static NATIVE_MODULES: &[NativeModuleEntry] = &[
    NativeModuleEntry {
        name: "system",
        fns: SYSTEM_FNS,
        post_init: None,
    },
    NativeModuleEntry {
        name: "math",
        fns: MATH_FNS,
        post_init: Some(math_post_init),
    },
    NativeModuleEntry {
        name: "array",
        fns: ARRAY_FNS,
        post_init: None,
    },
];

fn err(message: impl Into<String>) -> RuntimeError {
    RuntimeError::Native(message.into())
}

fn number_arg(args: &[Value], idx: usize, name: &str) -> Result<f64, RuntimeError> {
    match args.get(idx) {
        Some(Value::Number(n)) => Ok(*n),
        _ => Err(err(format!("{}() expects a number argument.", name))),
    }
}

fn print(args: &[Value]) -> Result<Value, RuntimeError> {
    for val in args {
        print!("{}", val);
    }
    Ok(Value::Nil)
}

fn println(args: &[Value]) -> Result<Value, RuntimeError> {
    for val in args {
        print!("{}", val);
    }
    println!();
    Ok(Value::Nil)
}

fn sprint(args: &[Value]) -> Result<Value, RuntimeError> {
    let mut out = String::new();
    for val in args {
        out += &val.to_string();
    }
    Ok(Value::Str(intern::id(out)))
}

fn len(args: &[Value]) -> Result<Value, RuntimeError> {
    match args {
        [Value::Str(s)] => Ok(Value::Number(intern::char_count(*s) as f64)),
        [Value::Array(array)] => Ok(Value::Number(array.borrow().values.len() as f64)),
        [Value::Table(table)] => Ok(Value::Number(table.borrow().entries.len() as f64)),
        _ => Err(err("len() expects a string, table, or array.")),
    }
}

fn module(args: &[Value]) -> Result<Value, RuntimeError> {
    let name = match args {
        [Value::Str(name)] => intern::str(*name),
        _ => return Err(err("module() expects a module name string.")),
    };
    let entry = NATIVE_MODULES
        .iter()
        .find(|module| module.name == name)
        .ok_or_else(|| err(format!("Unknown module '{}'.", name)))?;

    let mut table = table_from_entries(entry.fns.iter().map(|f| {
        let id = intern::id(f.name);
        (
            id,
            Value::NativeFun(crate::NativeFun { name: id, call: f.fun }),
        )
    }));
    if let Some(post_init) = entry.post_init {
        post_init(&mut table);
    }
    Ok(Value::Table(Gc::new(RefCell::new(table))))
}

thread_local! {
    static START: Instant = Instant::now();
    static RNG: RefCell<StdRng> = RefCell::new(StdRng::from_entropy());
}

fn time(_args: &[Value]) -> Result<Value, RuntimeError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| err("time() could not read the system clock."))?;
    Ok(Value::Number(now.as_secs_f64().floor()))
}

fn mtime(_args: &[Value]) -> Result<Value, RuntimeError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| err("mtime() could not read the system clock."))?;
    Ok(Value::Number(now.as_millis() as f64))
}

fn clock(_args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Number(START.with(|start| start.elapsed().as_secs_f64())))
}

fn sleep(args: &[Value]) -> Result<Value, RuntimeError> {
    let secs = number_arg(args, 0, "sleep")?;
    std::thread::sleep(std::time::Duration::from_secs_f64(secs.max(0.0)));
    Ok(Value::Nil)
}

fn usleep(args: &[Value]) -> Result<Value, RuntimeError> {
    let micros = number_arg(args, 0, "usleep")?;
    std::thread::sleep(std::time::Duration::from_micros(micros.max(0.0) as u64));
    Ok(Value::Nil)
}

fn exit(args: &[Value]) -> Result<Value, RuntimeError> {
    let code = args
        .first()
        .and_then(|v| match v {
            Value::Number(n) => Some(*n as i32),
            _ => None,
        })
        .unwrap_or(0);
    std::process::exit(code);
}

fn math_post_init(table: &mut ObjTable) {
    table.entries.insert(
        ValueKey::new(Value::Str(intern::id("pi"))),
        Value::Number(std::f64::consts::PI),
    );
    table.entries.insert(
        ValueKey::new(Value::Str(intern::id("e"))),
        Value::Number(std::f64::consts::E),
    );
}

macro_rules! math_unary {
    ($fn_name:ident, $lux_name:literal, $op:ident) => {
        fn $fn_name(args: &[Value]) -> Result<Value, RuntimeError> {
            Ok(Value::Number(number_arg(args, 0, $lux_name)?.$op()))
        }
    };
}

math_unary!(math_ceil, "ceil", ceil);
math_unary!(math_floor, "floor", floor);
math_unary!(math_abs, "abs", abs);
math_unary!(math_exp, "exp", exp);
math_unary!(math_sqrt, "sqrt", sqrt);
math_unary!(math_sin, "sin", sin);
math_unary!(math_cos, "cos", cos);
math_unary!(math_tan, "tan", tan);
math_unary!(math_atan, "atan", atan);
math_unary!(math_deg, "deg", to_degrees);
math_unary!(math_rad, "rad", to_radians);

fn math_atan2(args: &[Value]) -> Result<Value, RuntimeError> {
    let y = number_arg(args, 0, "atan2")?;
    let x = number_arg(args, 1, "atan2")?;
    Ok(Value::Number(y.atan2(x)))
}

fn math_pow(args: &[Value]) -> Result<Value, RuntimeError> {
    let base = number_arg(args, 0, "pow")?;
    let exponent = number_arg(args, 1, "pow")?;
    Ok(Value::Number(base.powf(exponent)))
}

fn math_clamp(args: &[Value]) -> Result<Value, RuntimeError> {
    let v = number_arg(args, 0, "clamp")?;
    let lo = number_arg(args, 1, "clamp")?;
    let hi = number_arg(args, 2, "clamp")?;
    Ok(Value::Number(v.clamp(lo, hi)))
}

fn math_lerp(args: &[Value]) -> Result<Value, RuntimeError> {
    let a = number_arg(args, 0, "lerp")?;
    let b = number_arg(args, 1, "lerp")?;
    let t = number_arg(args, 2, "lerp")?;
    Ok(Value::Number(a + (b - a) * t))
}

fn math_map(args: &[Value]) -> Result<Value, RuntimeError> {
    let v = number_arg(args, 0, "map")?;
    let in_lo = number_arg(args, 1, "map")?;
    let in_hi = number_arg(args, 2, "map")?;
    let out_lo = number_arg(args, 3, "map")?;
    let out_hi = number_arg(args, 4, "map")?;
    Ok(Value::Number(
        out_lo + (v - in_lo) / (in_hi - in_lo) * (out_hi - out_lo),
    ))
}

fn math_norm(args: &[Value]) -> Result<Value, RuntimeError> {
    let v = number_arg(args, 0, "norm")?;
    let lo = number_arg(args, 1, "norm")?;
    let hi = number_arg(args, 2, "norm")?;
    Ok(Value::Number((v - lo) / (hi - lo)))
}

fn math_seed(args: &[Value]) -> Result<Value, RuntimeError> {
    let seed = number_arg(args, 0, "seed")?;
    RNG.with(|rng| *rng.borrow_mut() = StdRng::seed_from_u64(seed.to_bits()));
    Ok(Value::Nil)
}

fn math_rand(_args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Number(RNG.with(|rng| rng.borrow_mut().gen::<f64>())))
}

fn array_arg<'a>(
    args: &'a [Value],
    name: &str,
) -> Result<&'a Gc<RefCell<crate::ObjArray>>, RuntimeError> {
    match args.first() {
        Some(Value::Array(array)) => Ok(array),
        _ => Err(err(format!("{}() expects an array argument.", name))),
    }
}

fn array_push(args: &[Value]) -> Result<Value, RuntimeError> {
    let array = array_arg(args, "push")?;
    array.borrow_mut().values.extend(args[1..].iter().cloned());
    Ok(Value::Array(Gc::clone(array)))
}

fn array_pop(args: &[Value]) -> Result<Value, RuntimeError> {
    let array = array_arg(args, "pop")?;
    Ok(array.borrow_mut().values.pop().unwrap_or(Value::Nil))
}

fn array_insert(args: &[Value]) -> Result<Value, RuntimeError> {
    let array = array_arg(args, "insert")?;
    let idx = number_arg(args, 1, "insert")? as i64;
    let val = args
        .get(2)
        .cloned()
        .ok_or_else(|| err("insert() expects a value to insert."))?;
    let mut array_ref = array.borrow_mut();
    if idx < 0 || idx as usize > array_ref.values.len() {
        return Err(RuntimeError::IndexOutOfBounds);
    }
    array_ref.values.insert(idx as usize, val);
    drop(array_ref);
    Ok(Value::Array(Gc::clone(array)))
}

fn array_remove(args: &[Value]) -> Result<Value, RuntimeError> {
    let array = array_arg(args, "remove")?;
    let idx = number_arg(args, 1, "remove")? as i64;
    let mut array_ref = array.borrow_mut();
    if idx < 0 || idx as usize >= array_ref.values.len() {
        return Err(RuntimeError::IndexOutOfBounds);
    }
    Ok(array_ref.values.remove(idx as usize))
}

fn array_reverse(args: &[Value]) -> Result<Value, RuntimeError> {
    let array = array_arg(args, "reverse")?;
    array.borrow_mut().values.reverse();
    Ok(Value::Array(Gc::clone(array)))
}

fn array_sort(args: &[Value]) -> Result<Value, RuntimeError> {
    let array = array_arg(args, "sort")?;
    let mut array_ref = array.borrow_mut();
    let all_numbers = array_ref
        .values
        .iter()
        .all(|v| matches!(v, Value::Number(_)));
    let all_strings = array_ref.values.iter().all(|v| matches!(v, Value::Str(_)));
    if all_numbers {
        array_ref.values.sort_by(|a, b| match (a, b) {
            (Value::Number(a), Value::Number(b)) => a.total_cmp(b),
            _ => unreachable!("Every element is a number."),
        });
    } else if all_strings {
        array_ref.values.sort_by_key(|v| match v {
            Value::Str(s) => intern::str(*s),
            _ => unreachable!("Every element is a string."),
        });
    } else {
        return Err(err("sort() expects an array of numbers or strings."));
    }
    drop(array_ref);
    Ok(Value::Array(Gc::clone(array)))
}

fn array_find(args: &[Value]) -> Result<Value, RuntimeError> {
    let array = array_arg(args, "find")?;
    let needle = args
        .get(1)
        .ok_or_else(|| err("find() expects a value to search for."))?;
    let found = array.borrow().values.iter().position(|v| v == needle);
    Ok(found.map_or(Value::Nil, |idx| Value::Number(idx as f64)))
}

fn array_find_last(args: &[Value]) -> Result<Value, RuntimeError> {
    let array = array_arg(args, "findLast")?;
    let needle = args
        .get(1)
        .ok_or_else(|| err("findLast() expects a value to search for."))?;
    let found = array.borrow().values.iter().rposition(|v| v == needle);
    Ok(found.map_or(Value::Nil, |idx| Value::Number(idx as f64)))
}

fn array_flatten(args: &[Value]) -> Result<Value, RuntimeError> {
    let array = array_arg(args, "flatten")?;
    let mut flattened = Vec::new();
    flatten_into(&array.borrow().values, &mut flattened);
    Ok(Value::Array(Gc::new(RefCell::new(crate::ObjArray {
        values: flattened,
    }))))
}

fn flatten_into(values: &[Value], out: &mut Vec<Value>) {
    for val in values {
        match val {
            Value::Array(nested) => flatten_into(&nested.borrow().values, out),
            other => out.push(other.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_returns_a_table_of_natives() {
        let math = module(&[Value::Str(intern::id("math"))]).unwrap();
        match math {
            Value::Table(table) => {
                let table = table.borrow();
                assert!(table
                    .entries
                    .contains_key(&ValueKey::new(Value::Str(intern::id("sqrt")))));
                assert!(table
                    .entries
                    .contains_key(&ValueKey::new(Value::Str(intern::id("pi")))));
            }
            _ => panic!("module() must return a table"),
        }
    }

    #[test]
    fn unknown_module_is_rejected() {
        let result = module(&[Value::Str(intern::id("nope"))]);
        assert!(matches!(result, Err(RuntimeError::Native(_))));
    }

    #[test]
    fn len_counts_characters_and_elements() {
        assert_eq!(
            len(&[Value::Str(intern::id("héllo"))]).unwrap(),
            Value::Number(5.0)
        );
        let array = Value::Array(Gc::new(RefCell::new(crate::ObjArray {
            values: vec![Value::Nil, Value::Nil],
        })));
        assert_eq!(len(&[array]).unwrap(), Value::Number(2.0));
    }

    #[test]
    fn array_natives_mutate_in_place() {
        let array = Gc::new(RefCell::new(crate::ObjArray {
            values: vec![Value::Number(2.0), Value::Number(1.0)],
        }));
        array_push(&[Value::Array(Gc::clone(&array)), Value::Number(3.0)]).unwrap();
        assert_eq!(array.borrow().values.len(), 3);
        array_sort(&[Value::Array(Gc::clone(&array))]).unwrap();
        assert_eq!(
            array.borrow().values.first(),
            Some(&Value::Number(1.0))
        );
        let popped = array_pop(&[Value::Array(Gc::clone(&array))]).unwrap();
        assert_eq!(popped, Value::Number(3.0));
    }

    #[test]
    fn flatten_recurses_into_nested_arrays() {
        let inner = Value::Array(Gc::new(RefCell::new(crate::ObjArray {
            values: vec![Value::Number(2.0), Value::Number(3.0)],
        })));
        let outer = Value::Array(Gc::new(RefCell::new(crate::ObjArray {
            values: vec![Value::Number(1.0), inner],
        })));
        let flat = array_flatten(&[outer]).unwrap();
        assert_eq!(flat.to_string(), "[1, 2, 3]");
    }

    #[test]
    fn seeded_rand_is_deterministic() {
        math_seed(&[Value::Number(42.0)]).unwrap();
        let first = math_rand(&[]).unwrap();
        math_seed(&[Value::Number(42.0)]).unwrap();
        let second = math_rand(&[]).unwrap();
        assert_eq!(first, second);
    }
}
