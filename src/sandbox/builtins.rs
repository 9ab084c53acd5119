//! Allowlisted builtins and pre-imported safe modules
//!
//! Only the names registered by [`default_globals`] exist inside the
//! sandbox. Module functions are ordinary builtins with dotted names
//! ("math.sqrt"); attribute access on a module value resolves to them.
//! Anything not here simply does not exist for node code.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, NaiveDateTime, Timelike};
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;

use super::interp::{raise, EvalResult, Flow, Interp};
use super::value::*;

/// Exception classes available to node code
pub const EXCEPTION_CLASSES: &[&str] = &[
    "ValueError",
    "TypeError",
    "KeyError",
    "IndexError",
    "AttributeError",
    "StopIteration",
    "ZeroDivisionError",
    "Exception",
];

/// Pre-imported safe modules
pub const SAFE_MODULES: &[&str] = &[
    "math",
    "statistics",
    "collections",
    "itertools",
    "functools",
    "json",
    "re",
    "datetime",
    "decimal",
    "fractions",
    "random",
    "operator",
    "string",
];

const PLAIN_BUILTINS: &[&str] = &[
    "abs", "bin", "chr", "divmod", "format", "hex", "oct", "ord", "pow", "round", "repr", "hash",
    "slice", "range", "len", "sorted", "reversed", "enumerate", "zip", "map", "filter", "iter",
    "next", "all", "any", "sum", "max", "min", "isinstance", "issubclass", "type", "hasattr",
    "getattr", "print",
];

/// Build the execution namespace for one node call.
///
/// A fresh map per call: nodes can never pollute each other's globals.
pub fn default_globals() -> FxHashMap<String, Value> {
    let mut globals = FxHashMap::default();

    for name in PLAIN_BUILTINS {
        globals.insert(name.to_string(), Value::Builtin(*name));
    }

    globals.insert("int".to_string(), Value::Type(TypeTag::Int));
    globals.insert("float".to_string(), Value::Type(TypeTag::Float));
    globals.insert("str".to_string(), Value::Type(TypeTag::Str));
    globals.insert("bool".to_string(), Value::Type(TypeTag::Bool));
    globals.insert("list".to_string(), Value::Type(TypeTag::List));
    globals.insert("dict".to_string(), Value::Type(TypeTag::Dict));
    globals.insert("tuple".to_string(), Value::Type(TypeTag::Tuple));
    globals.insert("set".to_string(), Value::Type(TypeTag::Set));
    globals.insert("frozenset".to_string(), Value::Type(TypeTag::FrozenSet));

    for name in EXCEPTION_CLASSES {
        globals.insert(name.to_string(), Value::ExcType(name));
    }

    for name in SAFE_MODULES {
        globals.insert(name.to_string(), Value::Module(name));
    }

    // Commonly used members exposed at top level, so code like
    // `Counter(xs)` or `mean(values)` works without qualification.
    globals.insert("Counter".to_string(), Value::Builtin("collections.Counter"));
    globals.insert(
        "defaultdict".to_string(),
        Value::Builtin("collections.defaultdict"),
    );
    globals.insert(
        "OrderedDict".to_string(),
        Value::Builtin("collections.OrderedDict"),
    );
    globals.insert("timedelta".to_string(), Value::Builtin("datetime.timedelta"));
    globals.insert("date".to_string(), Value::Builtin("datetime.date"));
    globals.insert("mean".to_string(), Value::Builtin("statistics.mean"));
    globals.insert("median".to_string(), Value::Builtin("statistics.median"));
    globals.insert("stdev".to_string(), Value::Builtin("statistics.stdev"));

    globals
}

// ═══════════════════════════════════════════════════════════════
// Attribute access
// ═══════════════════════════════════════════════════════════════

pub fn get_attr(recv: Value, attr: &str, _line: u32) -> EvalResult {
    match &recv {
        Value::Module(module) => module_attr(module, attr),
        Value::DateTime(dt) => match attr {
            "year" => Ok(Value::Int(dt.year() as i64)),
            "month" => Ok(Value::Int(dt.month() as i64)),
            "day" => Ok(Value::Int(dt.day() as i64)),
            "hour" => Ok(Value::Int(dt.hour() as i64)),
            "minute" => Ok(Value::Int(dt.minute() as i64)),
            "second" => Ok(Value::Int(dt.second() as i64)),
            "strftime" | "isoformat" | "weekday" | "date" => Ok(bound(recv.clone(), attr)),
            _ => Err(no_attr("datetime", attr)),
        },
        Value::Date(d) => match attr {
            "year" => Ok(Value::Int(d.year() as i64)),
            "month" => Ok(Value::Int(d.month() as i64)),
            "day" => Ok(Value::Int(d.day() as i64)),
            "strftime" | "isoformat" | "weekday" => Ok(bound(recv.clone(), attr)),
            _ => Err(no_attr("date", attr)),
        },
        Value::TimeDelta(d) => match attr {
            "days" => Ok(Value::Int(d.num_days())),
            "seconds" => Ok(Value::Int(d.num_seconds().rem_euclid(86_400))),
            "total_seconds" => Ok(bound(recv.clone(), attr)),
            _ => Err(no_attr("timedelta", attr)),
        },
        Value::Str(_) => method_or_no_attr(recv.clone(), attr, STR_METHODS, "str"),
        Value::List(_) => method_or_no_attr(recv.clone(), attr, LIST_METHODS, "list"),
        Value::Dict(_) => method_or_no_attr(recv.clone(), attr, DICT_METHODS, "dict"),
        Value::Set(_) => method_or_no_attr(recv.clone(), attr, SET_METHODS, "set"),
        other => Err(no_attr(type_name(other), attr)),
    }
}

const STR_METHODS: &[&str] = &[
    "lower",
    "upper",
    "strip",
    "lstrip",
    "rstrip",
    "split",
    "join",
    "replace",
    "startswith",
    "endswith",
    "find",
    "count",
    "title",
    "capitalize",
    "isdigit",
    "isalpha",
    "zfill",
    "index",
];

const LIST_METHODS: &[&str] = &[
    "append", "extend", "pop", "insert", "remove", "sort", "reverse", "count", "index", "copy",
    "clear",
];

const DICT_METHODS: &[&str] = &[
    "get",
    "keys",
    "values",
    "items",
    "update",
    "pop",
    "setdefault",
    "copy",
    "clear",
    "most_common",
];

const SET_METHODS: &[&str] = &[
    "add",
    "update",
    "discard",
    "remove",
    "union",
    "intersection",
    "difference",
    "copy",
];

fn bound(recv: Value, method: &str) -> Value {
    Value::BoundMethod {
        recv: Box::new(recv),
        method: Rc::from(method),
    }
}

fn method_or_no_attr(recv: Value, attr: &str, methods: &[&str], ty: &str) -> EvalResult {
    if methods.contains(&attr) {
        Ok(bound(recv, attr))
    } else {
        Err(no_attr(ty, attr))
    }
}

fn no_attr(ty: &str, attr: &str) -> Flow {
    raise(
        "AttributeError",
        format!("'{ty}' object has no attribute '{attr}'"),
    )
}

fn module_attr(module: &str, attr: &str) -> EvalResult {
    let qualified: &'static str = match (module, attr) {
        ("math", "pi") => return Ok(Value::Float(std::f64::consts::PI)),
        ("math", "e") => return Ok(Value::Float(std::f64::consts::E)),
        ("math", "inf") => return Ok(Value::Float(f64::INFINITY)),
        ("math", "nan") => return Ok(Value::Float(f64::NAN)),
        ("math", "sqrt") => "math.sqrt",
        ("math", "floor") => "math.floor",
        ("math", "ceil") => "math.ceil",
        ("math", "log") => "math.log",
        ("math", "log2") => "math.log2",
        ("math", "log10") => "math.log10",
        ("math", "exp") => "math.exp",
        ("math", "fabs") => "math.fabs",
        ("math", "pow") => "math.pow",
        ("math", "trunc") => "math.trunc",
        ("math", "isnan") => "math.isnan",
        ("math", "isinf") => "math.isinf",
        ("statistics", "mean") => "statistics.mean",
        ("statistics", "median") => "statistics.median",
        ("statistics", "stdev") => "statistics.stdev",
        ("statistics", "pstdev") => "statistics.pstdev",
        ("statistics", "variance") => "statistics.variance",
        ("statistics", "pvariance") => "statistics.pvariance",
        ("statistics", "mode") => "statistics.mode",
        ("collections", "Counter") => "collections.Counter",
        ("collections", "defaultdict") => "collections.defaultdict",
        ("collections", "OrderedDict") => "collections.OrderedDict",
        ("itertools", "chain") => "itertools.chain",
        ("functools", "reduce") => "functools.reduce",
        ("json", "dumps") => "json.dumps",
        ("json", "loads") => "json.loads",
        ("re", "match") => "re.match",
        ("re", "search") => "re.search",
        ("re", "findall") => "re.findall",
        ("re", "sub") => "re.sub",
        ("re", "split") => "re.split",
        // The datetime module doubles as the datetime class, mirroring how
        // the execution environment aliases it for node authors.
        ("datetime", "strptime") => "datetime.strptime",
        ("datetime", "fromisoformat") => "datetime.fromisoformat",
        ("datetime", "datetime") => return Ok(Value::Module("datetime")),
        ("datetime", "date") => "datetime.date",
        ("datetime", "timedelta") => "datetime.timedelta",
        ("decimal", "Decimal") => "decimal.Decimal",
        ("fractions", "Fraction") => "fractions.Fraction",
        ("random", "seed") => "random.seed",
        ("random", "random") => "random.random",
        ("random", "randint") => "random.randint",
        ("random", "uniform") => "random.uniform",
        ("random", "choice") => "random.choice",
        ("random", "shuffle") => "random.shuffle",
        ("operator", "itemgetter") => "operator.itemgetter",
        ("operator", "add") => "operator.add",
        ("operator", "sub") => "operator.sub",
        ("operator", "mul") => "operator.mul",
        ("operator", "truediv") => "operator.truediv",
        ("string", "ascii_lowercase") => {
            return Ok(new_str("abcdefghijklmnopqrstuvwxyz"))
        }
        ("string", "ascii_uppercase") => {
            return Ok(new_str("ABCDEFGHIJKLMNOPQRSTUVWXYZ"))
        }
        ("string", "ascii_letters") => {
            return Ok(new_str(
                "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ",
            ))
        }
        ("string", "digits") => return Ok(new_str("0123456789")),
        ("string", "punctuation") => {
            return Ok(new_str("!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~"))
        }
        ("string", "whitespace") => return Ok(new_str(" \t\n\r\x0b\x0c")),
        _ => {
            return Err(raise(
                "AttributeError",
                format!("module '{module}' has no attribute '{attr}'"),
            ))
        }
    };
    Ok(Value::Builtin(qualified))
}

// ═══════════════════════════════════════════════════════════════
// Builtin calls
// ═══════════════════════════════════════════════════════════════

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), Flow> {
    if args.len() < min || args.len() > max {
        return Err(raise(
            "TypeError",
            format!(
                "{name}() takes {min}..{max} arguments but {} were given",
                args.len()
            ),
        ));
    }
    Ok(())
}

fn to_f64(name: &str, v: &Value) -> Result<f64, Flow> {
    match v {
        Value::Int(i) => Ok(*i as f64),
        Value::Float(f) => Ok(*f),
        Value::Bool(b) => Ok(*b as i64 as f64),
        other => Err(raise(
            "TypeError",
            format!("{name}() expects a number, got '{}'", type_name(other)),
        )),
    }
}

fn to_i64(name: &str, v: &Value) -> Result<i64, Flow> {
    match v {
        Value::Int(i) => Ok(*i),
        Value::Bool(b) => Ok(*b as i64),
        other => Err(raise(
            "TypeError",
            format!("{name}() expects an integer, got '{}'", type_name(other)),
        )),
    }
}

fn to_str_arg(name: &str, v: &Value) -> Result<String, Flow> {
    match v {
        Value::Str(s) => Ok(s.as_ref().clone()),
        other => Err(raise(
            "TypeError",
            format!("{name}() expects a string, got '{}'", type_name(other)),
        )),
    }
}

fn kwarg<'a>(kwargs: &'a [(String, Value)], name: &str) -> Option<&'a Value> {
    kwargs.iter().find(|(k, _)| k == name).map(|(_, v)| v)
}

fn reject_unknown_kwargs(
    func: &str,
    kwargs: &[(String, Value)],
    allowed: &[&str],
) -> Result<(), Flow> {
    for (name, _) in kwargs {
        if !allowed.contains(&name.as_str()) {
            return Err(raise(
                "TypeError",
                format!("{func}() got an unexpected keyword argument '{name}'"),
            ));
        }
    }
    Ok(())
}

pub fn call_builtin(
    interp: &mut Interp,
    name: &'static str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> EvalResult {
    match name {
        // ── numeric / conversion primitives ───────────────────────
        "abs" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Int(i) => Ok(Value::Int(i.abs())),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                Value::Bool(b) => Ok(Value::Int(*b as i64)),
                Value::TimeDelta(d) => Ok(Value::TimeDelta(if d.num_seconds() < 0 {
                    -*d
                } else {
                    *d
                })),
                other => Err(raise(
                    "TypeError",
                    format!("bad operand type for abs(): '{}'", type_name(other)),
                )),
            }
        }
        "bin" => {
            arity(name, &args, 1, 1)?;
            let v = to_i64(name, &args[0])?;
            Ok(new_str(if v < 0 {
                format!("-0b{:b}", -v)
            } else {
                format!("0b{v:b}")
            }))
        }
        "hex" => {
            arity(name, &args, 1, 1)?;
            let v = to_i64(name, &args[0])?;
            Ok(new_str(if v < 0 {
                format!("-0x{:x}", -v)
            } else {
                format!("0x{v:x}")
            }))
        }
        "oct" => {
            arity(name, &args, 1, 1)?;
            let v = to_i64(name, &args[0])?;
            Ok(new_str(if v < 0 {
                format!("-0o{:o}", -v)
            } else {
                format!("0o{v:o}")
            }))
        }
        "chr" => {
            arity(name, &args, 1, 1)?;
            let v = to_i64(name, &args[0])?;
            let c = u32::try_from(v)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| raise("ValueError", "chr() arg not in range"))?;
            Ok(new_str(c.to_string()))
        }
        "ord" => {
            arity(name, &args, 1, 1)?;
            let s = to_str_arg(name, &args[0])?;
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(Value::Int(c as i64)),
                _ => Err(raise(
                    "TypeError",
                    "ord() expected a character, but a longer string was found",
                )),
            }
        }
        "divmod" => {
            arity(name, &args, 2, 2)?;
            let q = interp.binary_op(
                super::ast::BinOp::FloorDiv,
                args[0].clone(),
                args[1].clone(),
            )?;
            let r = interp.binary_op(super::ast::BinOp::Mod, args[0].clone(), args[1].clone())?;
            Ok(Value::Tuple(Rc::new(vec![q, r])))
        }
        "pow" => {
            arity(name, &args, 2, 3)?;
            let base = interp.binary_op(super::ast::BinOp::Pow, args[0].clone(), args[1].clone())?;
            if args.len() == 3 {
                return interp.binary_op(super::ast::BinOp::Mod, base, args[2].clone());
            }
            Ok(base)
        }
        "round" => {
            arity(name, &args, 1, 2)?;
            let nd = if args.len() == 2 {
                Some(to_i64(name, &args[1])?)
            } else {
                None
            };
            match (&args[0], nd) {
                (Value::Int(i), _) => Ok(Value::Int(*i)),
                (Value::Float(f), None) => {
                    // Banker's rounding, like the reference runtime
                    let rounded = round_half_even(*f, 0);
                    Ok(Value::Int(rounded as i64))
                }
                (Value::Float(f), Some(nd)) => Ok(Value::Float(round_half_even(*f, nd))),
                (other, _) => Err(raise(
                    "TypeError",
                    format!("round() expects a number, got '{}'", type_name(other)),
                )),
            }
        }
        "repr" => {
            arity(name, &args, 1, 1)?;
            Ok(new_str(repr_value(&args[0])))
        }
        "hash" => {
            arity(name, &args, 1, 1)?;
            let key = Key::from_value(&args[0]).map_err(|m| raise("TypeError", m))?;
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            key.to_json_key().hash(&mut hasher);
            Ok(Value::Int(hasher.finish() as i64))
        }
        "format" => {
            arity(name, &args, 1, 2)?;
            let spec = if args.len() == 2 {
                to_str_arg(name, &args[1])?
            } else {
                String::new()
            };
            Ok(new_str(format_with_spec(&args[0], &spec)?))
        }

        // ── collections and iteration ─────────────────────────────
        "len" => {
            arity(name, &args, 1, 1)?;
            let n = match &args[0] {
                Value::Str(s) => s.chars().count(),
                Value::List(l) => l.borrow().len(),
                Value::Tuple(t) => t.len(),
                Value::Dict(d) => d.borrow().len(),
                Value::Set(s) => s.borrow().len(),
                Value::Range { .. } => range_items(&args[0]).len(),
                other => {
                    return Err(raise(
                        "TypeError",
                        format!("object of type '{}' has no len()", type_name(other)),
                    ))
                }
            };
            Ok(Value::Int(n as i64))
        }
        "range" => {
            arity(name, &args, 1, 3)?;
            let (start, stop, step) = match args.len() {
                1 => (0, to_i64(name, &args[0])?, 1),
                2 => (to_i64(name, &args[0])?, to_i64(name, &args[1])?, 1),
                _ => (
                    to_i64(name, &args[0])?,
                    to_i64(name, &args[1])?,
                    to_i64(name, &args[2])?,
                ),
            };
            if step == 0 {
                return Err(raise("ValueError", "range() arg 3 must not be zero"));
            }
            Ok(Value::Range { start, stop, step })
        }
        "slice" => {
            arity(name, &args, 1, 3)?;
            let opt = |v: &Value| -> Result<Option<i64>, Flow> {
                match v {
                    Value::None => Ok(None),
                    other => Ok(Some(to_i64("slice", other)?)),
                }
            };
            Ok(match args.len() {
                1 => Value::Slice {
                    start: None,
                    stop: opt(&args[0])?,
                    step: None,
                },
                2 => Value::Slice {
                    start: opt(&args[0])?,
                    stop: opt(&args[1])?,
                    step: None,
                },
                _ => Value::Slice {
                    start: opt(&args[0])?,
                    stop: opt(&args[1])?,
                    step: opt(&args[2])?,
                },
            })
        }
        "sorted" => {
            arity(name, &args, 1, 1)?;
            reject_unknown_kwargs(name, &kwargs, &["key", "reverse"])?;
            let items = interp.iterate(args[0].clone())?;
            let key_fn = kwarg(&kwargs, "key").cloned();
            let reverse = kwarg(&kwargs, "reverse").map(truthy).unwrap_or(false);
            let sorted = sort_values(interp, items, key_fn, reverse)?;
            Ok(new_list(sorted))
        }
        "reversed" => {
            arity(name, &args, 1, 1)?;
            let mut items = interp.iterate(args[0].clone())?;
            items.reverse();
            Ok(new_list(items))
        }
        "enumerate" => {
            arity(name, &args, 1, 2)?;
            let start = if args.len() == 2 {
                to_i64(name, &args[1])?
            } else {
                kwarg(&kwargs, "start")
                    .map(|v| to_i64(name, v))
                    .transpose()?
                    .unwrap_or(0)
            };
            let items = interp.iterate(args[0].clone())?;
            let pairs = items
                .into_iter()
                .enumerate()
                .map(|(i, v)| Value::Tuple(Rc::new(vec![Value::Int(start + i as i64), v])))
                .collect();
            Ok(new_list(pairs))
        }
        "zip" => {
            let mut columns = Vec::new();
            for arg in &args {
                columns.push(interp.iterate(arg.clone())?);
            }
            let shortest = columns.iter().map(Vec::len).min().unwrap_or(0);
            let mut rows = Vec::with_capacity(shortest);
            for i in 0..shortest {
                rows.push(Value::Tuple(Rc::new(
                    columns.iter().map(|c| c[i].clone()).collect(),
                )));
            }
            Ok(new_list(rows))
        }
        "map" => {
            if args.len() < 2 {
                return Err(raise("TypeError", "map() requires a function and an iterable"));
            }
            let func = args[0].clone();
            let mut columns = Vec::new();
            for arg in &args[1..] {
                columns.push(interp.iterate(arg.clone())?);
            }
            let shortest = columns.iter().map(Vec::len).min().unwrap_or(0);
            let mut out = Vec::with_capacity(shortest);
            for i in 0..shortest {
                let call_args: Vec<Value> = columns.iter().map(|c| c[i].clone()).collect();
                out.push(interp.call_value(func.clone(), call_args, vec![])?);
            }
            Ok(new_list(out))
        }
        "filter" => {
            arity(name, &args, 2, 2)?;
            let func = args[0].clone();
            let items = interp.iterate(args[1].clone())?;
            let mut out = Vec::new();
            for item in items {
                let keep = match &func {
                    Value::None => truthy(&item),
                    f => {
                        let v = interp.call_value(f.clone(), vec![item.clone()], vec![])?;
                        truthy(&v)
                    }
                };
                if keep {
                    out.push(item);
                }
            }
            Ok(new_list(out))
        }
        "iter" => {
            arity(name, &args, 1, 1)?;
            let items = interp.iterate(args[0].clone())?;
            Ok(Value::Iterator(Rc::new(RefCell::new(IterState {
                items,
                pos: 0,
            }))))
        }
        "next" => {
            arity(name, &args, 1, 2)?;
            let Value::Iterator(state) = &args[0] else {
                return Err(raise(
                    "TypeError",
                    format!("'{}' object is not an iterator", type_name(&args[0])),
                ));
            };
            let mut state = state.borrow_mut();
            if state.pos < state.items.len() {
                let v = state.items[state.pos].clone();
                state.pos += 1;
                Ok(v)
            } else if args.len() == 2 {
                Ok(args[1].clone())
            } else {
                Err(raise("StopIteration", ""))
            }
        }
        "all" => {
            arity(name, &args, 1, 1)?;
            let items = interp.iterate(args[0].clone())?;
            Ok(Value::Bool(items.iter().all(truthy)))
        }
        "any" => {
            arity(name, &args, 1, 1)?;
            let items = interp.iterate(args[0].clone())?;
            Ok(Value::Bool(items.iter().any(truthy)))
        }
        "sum" => {
            arity(name, &args, 1, 2)?;
            let items = interp.iterate(args[0].clone())?;
            let mut acc = if args.len() == 2 {
                args[1].clone()
            } else {
                Value::Int(0)
            };
            for item in items {
                acc = interp.binary_op(super::ast::BinOp::Add, acc, item)?;
            }
            Ok(acc)
        }
        "max" | "min" => {
            reject_unknown_kwargs(name, &kwargs, &["key", "default"])?;
            let items = if args.len() == 1 {
                interp.iterate(args[0].clone())?
            } else {
                args.clone()
            };
            if items.is_empty() {
                if let Some(default) = kwarg(&kwargs, "default") {
                    return Ok(default.clone());
                }
                return Err(raise(
                    "ValueError",
                    format!("{name}() arg is an empty sequence"),
                ));
            }
            let key_fn = kwarg(&kwargs, "key").cloned();
            let want_max = name == "max";
            let mut best = items[0].clone();
            let mut best_key = apply_key(interp, &key_fn, &best)?;
            for item in &items[1..] {
                let item_key = apply_key(interp, &key_fn, item)?;
                let ord = value_cmp(&item_key, &best_key).map_err(|m| raise("TypeError", m))?;
                let better = if want_max {
                    ord == Ordering::Greater
                } else {
                    ord == Ordering::Less
                };
                if better {
                    best = item.clone();
                    best_key = item_key;
                }
            }
            Ok(best)
        }

        // ── type predicates ───────────────────────────────────────
        "isinstance" => {
            arity(name, &args, 2, 2)?;
            Ok(Value::Bool(isinstance(&args[0], &args[1])))
        }
        "issubclass" => {
            arity(name, &args, 2, 2)?;
            let result = match (&args[0], &args[1]) {
                (Value::Type(a), Value::Type(b)) => {
                    a == b || (*a == TypeTag::Bool && *b == TypeTag::Int)
                }
                (Value::ExcType(a), Value::ExcType(b)) => a == b || *b == "Exception",
                _ => false,
            };
            Ok(Value::Bool(result))
        }
        "type" => {
            arity(name, &args, 1, 1)?;
            Ok(match &args[0] {
                Value::Int(_) => Value::Type(TypeTag::Int),
                Value::Float(_) => Value::Type(TypeTag::Float),
                Value::Str(_) => Value::Type(TypeTag::Str),
                Value::Bool(_) => Value::Type(TypeTag::Bool),
                Value::List(_) => Value::Type(TypeTag::List),
                Value::Dict(_) => Value::Type(TypeTag::Dict),
                Value::Tuple(_) => Value::Type(TypeTag::Tuple),
                Value::Set(_) => Value::Type(TypeTag::Set),
                Value::Exc(e) => {
                    let kind: &'static str = EXCEPTION_CLASSES
                        .iter()
                        .find(|k| **k == e.kind)
                        .copied()
                        .unwrap_or("Exception");
                    Value::ExcType(kind)
                }
                other => new_str(type_name(other)),
            })
        }
        "hasattr" => {
            arity(name, &args, 2, 2)?;
            let attr = to_str_arg(name, &args[1])?;
            Ok(Value::Bool(get_attr(args[0].clone(), &attr, 0).is_ok()))
        }
        "getattr" => {
            arity(name, &args, 2, 3)?;
            let attr = to_str_arg(name, &args[1])?;
            match get_attr(args[0].clone(), &attr, 0) {
                Ok(v) => Ok(v),
                Err(_) if args.len() == 3 => Ok(args[2].clone()),
                Err(flow) => Err(flow),
            }
        }

        // ── I/O stub ──────────────────────────────────────────────
        "print" => {
            let rendered: Vec<String> = args.iter().map(str_value).collect();
            let mut out = interp.stdout.borrow_mut();
            out.push_str(&rendered.join(" "));
            out.push('\n');
            Ok(Value::None)
        }

        // ── math ──────────────────────────────────────────────────
        "math.sqrt" => {
            arity(name, &args, 1, 1)?;
            let v = to_f64(name, &args[0])?;
            if v < 0.0 {
                return Err(raise("ValueError", "math domain error"));
            }
            Ok(Value::Float(v.sqrt()))
        }
        "math.floor" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Int(to_f64(name, &args[0])?.floor() as i64))
        }
        "math.ceil" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Int(to_f64(name, &args[0])?.ceil() as i64))
        }
        "math.trunc" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Int(to_f64(name, &args[0])?.trunc() as i64))
        }
        "math.log" => {
            arity(name, &args, 1, 2)?;
            let v = to_f64(name, &args[0])?;
            if v <= 0.0 {
                return Err(raise("ValueError", "math domain error"));
            }
            if args.len() == 2 {
                let base = to_f64(name, &args[1])?;
                Ok(Value::Float(v.log(base)))
            } else {
                Ok(Value::Float(v.ln()))
            }
        }
        "math.log2" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Float(to_f64(name, &args[0])?.log2()))
        }
        "math.log10" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Float(to_f64(name, &args[0])?.log10()))
        }
        "math.exp" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Float(to_f64(name, &args[0])?.exp()))
        }
        "math.fabs" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Float(to_f64(name, &args[0])?.abs()))
        }
        "math.pow" => {
            arity(name, &args, 2, 2)?;
            Ok(Value::Float(
                to_f64(name, &args[0])?.powf(to_f64(name, &args[1])?),
            ))
        }
        "math.isnan" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Bool(to_f64(name, &args[0])?.is_nan()))
        }
        "math.isinf" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Bool(to_f64(name, &args[0])?.is_infinite()))
        }

        // ── statistics ────────────────────────────────────────────
        "statistics.mean" | "statistics.median" | "statistics.stdev" | "statistics.pstdev"
        | "statistics.variance" | "statistics.pvariance" | "statistics.mode" => {
            arity(name, &args, 1, 1)?;
            statistics_call(interp, name, args[0].clone())
        }

        // ── collections ───────────────────────────────────────────
        "collections.Counter" => {
            arity(name, &args, 0, 1)?;
            let mut dict = DictValue::with_default(DefaultKind::Int);
            if let Some(arg) = args.first() {
                if let Value::Dict(src) = arg {
                    for (k, v) in &src.borrow().entries {
                        dict.insert(k.clone(), v.clone());
                    }
                } else {
                    for item in interp.iterate(arg.clone())? {
                        let key = Key::from_value(&item).map_err(|m| raise("TypeError", m))?;
                        let current = match dict.get(&key) {
                            Some(Value::Int(i)) => *i,
                            _ => 0,
                        };
                        dict.insert(key, Value::Int(current + 1));
                    }
                }
            }
            Ok(new_dict(dict))
        }
        "collections.defaultdict" => {
            arity(name, &args, 0, 1)?;
            let default = match args.first() {
                None => None,
                Some(Value::Type(TypeTag::Int)) => Some(DefaultKind::Int),
                Some(Value::Type(TypeTag::Float)) => Some(DefaultKind::Float),
                Some(Value::Type(TypeTag::List)) => Some(DefaultKind::List),
                Some(Value::Type(TypeTag::Dict)) => Some(DefaultKind::Dict),
                Some(Value::Type(TypeTag::Set)) => Some(DefaultKind::Set),
                Some(other) => {
                    return Err(raise(
                        "TypeError",
                        format!(
                            "defaultdict factory must be int, float, list, set or dict, got '{}'",
                            type_name(other)
                        ),
                    ))
                }
            };
            let dict = match default {
                Some(kind) => DictValue::with_default(kind),
                None => DictValue::new(),
            };
            Ok(new_dict(dict))
        }
        "collections.OrderedDict" => {
            arity(name, &args, 0, 1)?;
            match args.first() {
                None => Ok(new_dict(DictValue::new())),
                Some(v) => construct(interp, TypeTag::Dict, vec![v.clone()], vec![]),
            }
        }

        // ── itertools / functools ─────────────────────────────────
        "itertools.chain" => {
            let mut out = Vec::new();
            for arg in args {
                out.extend(interp.iterate(arg)?);
            }
            Ok(new_list(out))
        }
        "functools.reduce" => {
            arity(name, &args, 2, 3)?;
            let func = args[0].clone();
            let items = interp.iterate(args[1].clone())?;
            let mut iter = items.into_iter();
            let mut acc = if args.len() == 3 {
                args[2].clone()
            } else {
                iter.next().ok_or_else(|| {
                    raise("TypeError", "reduce() of empty iterable with no initial value")
                })?
            };
            for item in iter {
                acc = interp.call_value(func.clone(), vec![acc, item], vec![])?;
            }
            Ok(acc)
        }

        // ── json ──────────────────────────────────────────────────
        "json.dumps" => {
            arity(name, &args, 1, 1)?;
            reject_unknown_kwargs(name, &kwargs, &["indent"])?;
            let json = to_json(&args[0]).map_err(|m| raise("TypeError", m))?;
            let rendered = if kwarg(&kwargs, "indent").is_some() {
                serde_json::to_string_pretty(&json)
            } else {
                serde_json::to_string(&json)
            }
            .map_err(|e| raise("ValueError", e.to_string()))?;
            Ok(new_str(rendered))
        }
        "json.loads" => {
            arity(name, &args, 1, 1)?;
            let s = to_str_arg(name, &args[0])?;
            let json: serde_json::Value = serde_json::from_str(&s)
                .map_err(|e| raise("ValueError", format!("invalid JSON: {e}")))?;
            Ok(from_json(&json))
        }

        // ── re ────────────────────────────────────────────────────
        "re.match" | "re.search" | "re.findall" | "re.sub" | "re.split" => {
            regex_call(interp, name, args)
        }

        // ── datetime ──────────────────────────────────────────────
        "datetime.strptime" => {
            arity(name, &args, 2, 2)?;
            let s = to_str_arg(name, &args[0])?;
            let fmt = to_str_arg(name, &args[1])?;
            parse_datetime(&s, &fmt)
        }
        "datetime.fromisoformat" => {
            arity(name, &args, 1, 1)?;
            let s = to_str_arg(name, &args[0])?;
            if let Ok(dt) = NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S") {
                return Ok(Value::DateTime(dt));
            }
            if let Ok(dt) = NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S") {
                return Ok(Value::DateTime(dt));
            }
            if let Ok(d) = NaiveDate::parse_from_str(&s, "%Y-%m-%d") {
                return Ok(Value::DateTime(d.and_hms_opt(0, 0, 0).unwrap()));
            }
            Err(raise("ValueError", format!("invalid isoformat string: '{s}'")))
        }
        "datetime.date" => {
            arity(name, &args, 3, 3)?;
            let (y, m, d) = (
                to_i64(name, &args[0])?,
                to_i64(name, &args[1])?,
                to_i64(name, &args[2])?,
            );
            NaiveDate::from_ymd_opt(y as i32, m as u32, d as u32)
                .map(Value::Date)
                .ok_or_else(|| raise("ValueError", "day is out of range for month"))
        }
        "datetime.timedelta" => {
            reject_unknown_kwargs(name, &kwargs, &["days", "seconds", "minutes", "hours", "weeks"])?;
            let mut total = 0.0;
            if let Some(first) = args.first() {
                total += to_f64(name, first)? * 86_400.0;
            }
            for (key, factor) in [
                ("days", 86_400.0),
                ("seconds", 1.0),
                ("minutes", 60.0),
                ("hours", 3_600.0),
                ("weeks", 604_800.0),
            ] {
                if let Some(v) = kwarg(&kwargs, key) {
                    total += to_f64(name, v)? * factor;
                }
            }
            Ok(Value::TimeDelta(ChronoDuration::seconds(total as i64)))
        }

        // ── decimal / fractions shims ─────────────────────────────
        "decimal.Decimal" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Str(s) => s
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| raise("ValueError", format!("invalid Decimal literal '{s}'"))),
                other => Ok(Value::Float(to_f64(name, other)?)),
            }
        }
        "fractions.Fraction" => {
            arity(name, &args, 1, 2)?;
            let numer = to_f64(name, &args[0])?;
            let denom = if args.len() == 2 {
                to_f64(name, &args[1])?
            } else {
                1.0
            };
            if denom == 0.0 {
                return Err(raise("ZeroDivisionError", "Fraction(x, 0)"));
            }
            Ok(Value::Float(numer / denom))
        }

        // ── random ────────────────────────────────────────────────
        "random.seed" => {
            arity(name, &args, 1, 1)?;
            let seed = to_i64(name, &args[0])?;
            *interp.rng.borrow_mut() = Some(rand::rngs::StdRng::seed_from_u64(seed as u64));
            Ok(Value::None)
        }
        "random.random" => {
            arity(name, &args, 0, 0)?;
            Ok(Value::Float(with_rng(interp, |rng| rng.gen::<f64>())))
        }
        "random.randint" => {
            arity(name, &args, 2, 2)?;
            let (a, b) = (to_i64(name, &args[0])?, to_i64(name, &args[1])?);
            if a > b {
                return Err(raise("ValueError", "empty range for randint()"));
            }
            Ok(Value::Int(with_rng(interp, |rng| rng.gen_range(a..=b))))
        }
        "random.uniform" => {
            arity(name, &args, 2, 2)?;
            let (a, b) = (to_f64(name, &args[0])?, to_f64(name, &args[1])?);
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            Ok(Value::Float(with_rng(interp, |rng| {
                rng.gen::<f64>() * (high - low) + low
            })))
        }
        "random.choice" => {
            arity(name, &args, 1, 1)?;
            let items = interp.iterate(args[0].clone())?;
            if items.is_empty() {
                return Err(raise("IndexError", "cannot choose from an empty sequence"));
            }
            let idx = with_rng(interp, |rng| rng.gen_range(0..items.len()));
            Ok(items[idx].clone())
        }
        "random.shuffle" => {
            arity(name, &args, 1, 1)?;
            let Value::List(items) = &args[0] else {
                return Err(raise("TypeError", "shuffle() expects a list"));
            };
            let mut items = items.borrow_mut();
            let n = items.len();
            for i in (1..n).rev() {
                let j = with_rng(interp, |rng| rng.gen_range(0..=i));
                items.swap(i, j);
            }
            Ok(Value::None)
        }

        // ── operator ──────────────────────────────────────────────
        "operator.itemgetter" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::BoundMethod {
                recv: Box::new(args[0].clone()),
                method: Rc::from("__itemgetter__"),
            })
        }
        "operator.add" => {
            arity(name, &args, 2, 2)?;
            interp.binary_op(super::ast::BinOp::Add, args[0].clone(), args[1].clone())
        }
        "operator.sub" => {
            arity(name, &args, 2, 2)?;
            interp.binary_op(super::ast::BinOp::Sub, args[0].clone(), args[1].clone())
        }
        "operator.mul" => {
            arity(name, &args, 2, 2)?;
            interp.binary_op(super::ast::BinOp::Mul, args[0].clone(), args[1].clone())
        }
        "operator.truediv" => {
            arity(name, &args, 2, 2)?;
            interp.binary_op(super::ast::BinOp::Div, args[0].clone(), args[1].clone())
        }

        other => Err(raise(
            "NameError",
            format!("builtin '{other}' is not available in the sandbox"),
        )),
    }
}

fn with_rng<T>(interp: &Interp, f: impl FnOnce(&mut rand::rngs::StdRng) -> T) -> T {
    let mut guard = interp.rng.borrow_mut();
    let rng = guard.get_or_insert_with(rand::rngs::StdRng::from_entropy);
    f(rng)
}

fn apply_key(interp: &mut Interp, key_fn: &Option<Value>, item: &Value) -> EvalResult {
    match key_fn {
        Some(Value::None) | None => Ok(item.clone()),
        Some(f) => interp.call_value(f.clone(), vec![item.clone()], vec![]),
    }
}

fn sort_values(
    interp: &mut Interp,
    items: Vec<Value>,
    key_fn: Option<Value>,
    reverse: bool,
) -> Result<Vec<Value>, Flow> {
    let mut keyed = Vec::with_capacity(items.len());
    for item in items {
        let key = apply_key(interp, &key_fn, &item)?;
        keyed.push((key, item));
    }
    let mut cmp_err: Option<String> = None;
    keyed.sort_by(|a, b| match value_cmp(&a.0, &b.0) {
        Ok(ord) => {
            if reverse {
                ord.reverse()
            } else {
                ord
            }
        }
        Err(m) => {
            cmp_err.get_or_insert(m);
            Ordering::Equal
        }
    });
    if let Some(m) = cmp_err {
        return Err(raise("TypeError", m));
    }
    Ok(keyed.into_iter().map(|(_, v)| v).collect())
}

fn numbers_arg(interp: &mut Interp, name: &str, arg: Value) -> Result<Vec<f64>, Flow> {
    let items = interp.iterate(arg)?;
    items
        .iter()
        .map(|v| to_f64(name, v))
        .collect::<Result<Vec<_>, _>>()
}

fn statistics_call(interp: &mut Interp, name: &'static str, arg: Value) -> EvalResult {
    if name == "statistics.mode" {
        let items = interp.iterate(arg)?;
        if items.is_empty() {
            return Err(raise("ValueError", "no mode for empty data"));
        }
        let mut counts: Vec<(Value, usize)> = Vec::new();
        for item in items {
            if let Some(entry) = counts.iter_mut().find(|(v, _)| value_eq(v, &item)) {
                entry.1 += 1;
            } else {
                counts.push((item, 1));
            }
        }
        let best = counts.into_iter().max_by_key(|(_, n)| *n).unwrap();
        return Ok(best.0);
    }

    let xs = numbers_arg(interp, name, arg)?;
    if xs.is_empty() {
        return Err(raise(
            "ValueError",
            format!("{} requires at least one data point", name.trim_start_matches("statistics.")),
        ));
    }
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    match name {
        "statistics.mean" => Ok(Value::Float(mean)),
        "statistics.median" => {
            let mut sorted = xs;
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
            let mid = sorted.len() / 2;
            if sorted.len() % 2 == 1 {
                Ok(Value::Float(sorted[mid]))
            } else {
                Ok(Value::Float((sorted[mid - 1] + sorted[mid]) / 2.0))
            }
        }
        "statistics.variance" | "statistics.stdev" => {
            if xs.len() < 2 {
                return Err(raise(
                    "ValueError",
                    "variance requires at least two data points",
                ));
            }
            let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
            if name == "statistics.variance" {
                Ok(Value::Float(var))
            } else {
                Ok(Value::Float(var.sqrt()))
            }
        }
        "statistics.pvariance" | "statistics.pstdev" => {
            let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
            if name == "statistics.pvariance" {
                Ok(Value::Float(var))
            } else {
                Ok(Value::Float(var.sqrt()))
            }
        }
        _ => unreachable!("statistics dispatch covers all names"),
    }
}

fn regex_call(interp: &mut Interp, name: &'static str, args: Vec<Value>) -> EvalResult {
    let _ = interp;
    let pattern = to_str_arg(name, args.first().unwrap_or(&Value::None))?;
    let re = regex::Regex::new(&pattern)
        .map_err(|e| raise("ValueError", format!("invalid regular expression: {e}")))?;
    match name {
        // match/search return the matched text (or None); node code that
        // needs groups should use findall.
        "re.match" => {
            arity(name, &args, 2, 2)?;
            let s = to_str_arg(name, &args[1])?;
            Ok(match re.find(&s) {
                Some(m) if m.start() == 0 => new_str(m.as_str()),
                _ => Value::None,
            })
        }
        "re.search" => {
            arity(name, &args, 2, 2)?;
            let s = to_str_arg(name, &args[1])?;
            Ok(match re.find(&s) {
                Some(m) => new_str(m.as_str()),
                None => Value::None,
            })
        }
        "re.findall" => {
            arity(name, &args, 2, 2)?;
            let s = to_str_arg(name, &args[1])?;
            let mut out = Vec::new();
            for caps in re.captures_iter(&s) {
                if caps.len() > 1 {
                    if caps.len() == 2 {
                        out.push(new_str(caps.get(1).map_or("", |m| m.as_str())));
                    } else {
                        out.push(Value::Tuple(Rc::new(
                            (1..caps.len())
                                .map(|i| new_str(caps.get(i).map_or("", |m| m.as_str())))
                                .collect(),
                        )));
                    }
                } else {
                    out.push(new_str(caps.get(0).map_or("", |m| m.as_str())));
                }
            }
            Ok(new_list(out))
        }
        "re.sub" => {
            arity(name, &args, 3, 3)?;
            let repl = to_str_arg(name, &args[1])?;
            let s = to_str_arg(name, &args[2])?;
            Ok(new_str(re.replace_all(&s, repl.as_str()).into_owned()))
        }
        "re.split" => {
            arity(name, &args, 2, 2)?;
            let s = to_str_arg(name, &args[1])?;
            Ok(new_list(re.split(&s).map(new_str).collect()))
        }
        _ => unreachable!("regex dispatch covers all names"),
    }
}

fn parse_datetime(s: &str, fmt: &str) -> EvalResult {
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
        return Ok(Value::DateTime(dt));
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
        return Ok(Value::DateTime(d.and_hms_opt(0, 0, 0).unwrap()));
    }
    Err(raise(
        "ValueError",
        format!("time data '{s}' does not match format '{fmt}'"),
    ))
}

/// Banker's rounding to `nd` decimal places
fn round_half_even(v: f64, nd: i64) -> f64 {
    let factor = 10f64.powi(nd as i32);
    let scaled = v * factor;
    let floor = scaled.floor();
    let diff = scaled - floor;
    let rounded = if (diff - 0.5).abs() < f64::EPSILON {
        if (floor as i64) % 2 == 0 {
            floor
        } else {
            floor + 1.0
        }
    } else {
        scaled.round()
    };
    rounded / factor
}

fn isinstance(value: &Value, ty: &Value) -> bool {
    match ty {
        Value::Tuple(types) => types.iter().any(|t| isinstance(value, t)),
        Value::Type(tag) => match (tag, value) {
            (TypeTag::Int, Value::Int(_)) | (TypeTag::Int, Value::Bool(_)) => true,
            (TypeTag::Float, Value::Float(_)) => true,
            (TypeTag::Str, Value::Str(_)) => true,
            (TypeTag::Bool, Value::Bool(_)) => true,
            (TypeTag::List, Value::List(_)) => true,
            (TypeTag::Dict, Value::Dict(_)) => true,
            (TypeTag::Tuple, Value::Tuple(_)) => true,
            (TypeTag::Set, Value::Set(_)) | (TypeTag::FrozenSet, Value::Set(_)) => true,
            _ => false,
        },
        Value::ExcType(name) => match value {
            Value::Exc(e) => *name == "Exception" || e.kind == *name,
            _ => false,
        },
        _ => false,
    }
}

// ═══════════════════════════════════════════════════════════════
// Type constructors
// ═══════════════════════════════════════════════════════════════

pub fn construct(
    interp: &mut Interp,
    tag: TypeTag,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> EvalResult {
    match tag {
        TypeTag::Int => {
            arity("int", &args, 0, 2)?;
            match args.first() {
                None => Ok(Value::Int(0)),
                Some(Value::Int(i)) => Ok(Value::Int(*i)),
                Some(Value::Bool(b)) => Ok(Value::Int(*b as i64)),
                Some(Value::Float(f)) => Ok(Value::Int(f.trunc() as i64)),
                Some(Value::Str(s)) => {
                    let base = args
                        .get(1)
                        .map(|v| to_i64("int", v))
                        .transpose()?
                        .unwrap_or(10);
                    i64::from_str_radix(s.trim(), base as u32)
                        .map(Value::Int)
                        .map_err(|_| {
                            raise(
                                "ValueError",
                                format!("invalid literal for int() with base {base}: '{s}'"),
                            )
                        })
                }
                Some(other) => Err(raise(
                    "TypeError",
                    format!("int() argument must be a number or string, not '{}'", type_name(other)),
                )),
            }
        }
        TypeTag::Float => {
            arity("float", &args, 0, 1)?;
            match args.first() {
                None => Ok(Value::Float(0.0)),
                Some(Value::Float(f)) => Ok(Value::Float(*f)),
                Some(Value::Int(i)) => Ok(Value::Float(*i as f64)),
                Some(Value::Bool(b)) => Ok(Value::Float(*b as i64 as f64)),
                Some(Value::Str(s)) => match s.trim() {
                    "inf" | "Infinity" => Ok(Value::Float(f64::INFINITY)),
                    "-inf" | "-Infinity" => Ok(Value::Float(f64::NEG_INFINITY)),
                    "nan" => Ok(Value::Float(f64::NAN)),
                    trimmed => trimmed.parse::<f64>().map(Value::Float).map_err(|_| {
                        raise(
                            "ValueError",
                            format!("could not convert string to float: '{s}'"),
                        )
                    }),
                },
                Some(other) => Err(raise(
                    "TypeError",
                    format!(
                        "float() argument must be a number or string, not '{}'",
                        type_name(other)
                    ),
                )),
            }
        }
        TypeTag::Str => {
            arity("str", &args, 0, 1)?;
            Ok(match args.first() {
                None => new_str(""),
                Some(v) => new_str(str_value(v)),
            })
        }
        TypeTag::Bool => {
            arity("bool", &args, 0, 1)?;
            Ok(Value::Bool(args.first().map(truthy).unwrap_or(false)))
        }
        TypeTag::List => {
            arity("list", &args, 0, 1)?;
            match args.into_iter().next() {
                None => Ok(new_list(Vec::new())),
                Some(v) => Ok(new_list(interp.iterate(v)?)),
            }
        }
        TypeTag::Tuple => {
            arity("tuple", &args, 0, 1)?;
            match args.into_iter().next() {
                None => Ok(Value::Tuple(Rc::new(Vec::new()))),
                Some(v) => Ok(Value::Tuple(Rc::new(interp.iterate(v)?))),
            }
        }
        TypeTag::Set | TypeTag::FrozenSet => {
            arity("set", &args, 0, 1)?;
            let mut set = SetValue::new();
            if let Some(v) = args.into_iter().next() {
                for item in interp.iterate(v)? {
                    let key = Key::from_value(&item).map_err(|m| raise("TypeError", m))?;
                    set.insert(key);
                }
            }
            Ok(Value::Set(Rc::new(RefCell::new(set))))
        }
        TypeTag::Dict => {
            arity("dict", &args, 0, 1)?;
            let mut dict = DictValue::new();
            if let Some(v) = args.into_iter().next() {
                match &v {
                    Value::Dict(src) => {
                        for (k, val) in &src.borrow().entries {
                            dict.insert(k.clone(), val.clone());
                        }
                    }
                    _ => {
                        for pair in interp.iterate(v)? {
                            let items = interp.iterate(pair)?;
                            if items.len() != 2 {
                                return Err(raise(
                                    "ValueError",
                                    "dict update sequence elements must be pairs",
                                ));
                            }
                            let key =
                                Key::from_value(&items[0]).map_err(|m| raise("TypeError", m))?;
                            dict.insert(key, items[1].clone());
                        }
                    }
                }
            }
            for (name, value) in kwargs {
                dict.insert(Key::Str(name), value);
            }
            Ok(new_dict(dict))
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Methods
// ═══════════════════════════════════════════════════════════════

pub fn call_method(
    interp: &mut Interp,
    recv: Value,
    method: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> EvalResult {
    // itemgetter(k) is a bound method whose receiver is the key
    if method == "__itemgetter__" {
        arity("itemgetter", &args, 1, 1)?;
        return interp.subscript_get(args[0].clone(), recv, 0);
    }

    match &recv {
        Value::Str(s) => str_method(interp, s.as_ref(), method, args),
        Value::List(items) => list_method(interp, items, method, args, kwargs),
        Value::Dict(d) => dict_method(interp, d, method, args),
        Value::Set(s) => set_method(interp, s, method, args),
        Value::DateTime(dt) => match method {
            "strftime" => {
                arity(method, &args, 1, 1)?;
                let fmt = to_str_arg(method, &args[0])?;
                format_datetime(&fmt, |f| dt.format(f).to_string())
            }
            "isoformat" => Ok(new_str(dt.format("%Y-%m-%dT%H:%M:%S").to_string())),
            "weekday" => Ok(Value::Int(dt.weekday().num_days_from_monday() as i64)),
            "date" => Ok(Value::Date(dt.date())),
            _ => Err(no_attr("datetime", method)),
        },
        Value::Date(d) => match method {
            "strftime" => {
                arity(method, &args, 1, 1)?;
                let fmt = to_str_arg(method, &args[0])?;
                format_datetime(&fmt, |f| d.format(f).to_string())
            }
            "isoformat" => Ok(new_str(d.format("%Y-%m-%d").to_string())),
            "weekday" => Ok(Value::Int(d.weekday().num_days_from_monday() as i64)),
            _ => Err(no_attr("date", method)),
        },
        Value::TimeDelta(d) => match method {
            "total_seconds" => Ok(Value::Float(d.num_milliseconds() as f64 / 1000.0)),
            _ => Err(no_attr("timedelta", method)),
        },
        other => Err(no_attr(type_name(other), method)),
    }
}

/// Validate a strftime pattern before formatting; chrono panics on bad
/// specifiers inside Display otherwise.
fn format_datetime(fmt: &str, run: impl Fn(&str) -> String) -> EvalResult {
    use chrono::format::{Item, StrftimeItems};
    let items: Vec<Item> = StrftimeItems::new(fmt).collect();
    if items.iter().any(|i| matches!(i, Item::Error)) {
        return Err(raise(
            "ValueError",
            format!("invalid strftime format '{fmt}'"),
        ));
    }
    Ok(new_str(run(fmt)))
}

fn str_method(interp: &mut Interp, s: &str, method: &str, args: Vec<Value>) -> EvalResult {
    match method {
        "lower" => Ok(new_str(s.to_lowercase())),
        "upper" => Ok(new_str(s.to_uppercase())),
        "strip" => Ok(new_str(strip_chars(s, &args, Strip::Both)?)),
        "lstrip" => Ok(new_str(strip_chars(s, &args, Strip::Left)?)),
        "rstrip" => Ok(new_str(strip_chars(s, &args, Strip::Right)?)),
        "split" => {
            arity(method, &args, 0, 1)?;
            let parts: Vec<Value> = match args.first() {
                None => s.split_whitespace().map(new_str).collect(),
                Some(sep) => {
                    let sep = to_str_arg(method, sep)?;
                    if sep.is_empty() {
                        return Err(raise("ValueError", "empty separator"));
                    }
                    s.split(sep.as_str()).map(new_str).collect()
                }
            };
            Ok(new_list(parts))
        }
        "join" => {
            arity(method, &args, 1, 1)?;
            let items = interp.iterate(args[0].clone())?;
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Str(part) => parts.push(part.as_ref().clone()),
                    other => {
                        return Err(raise(
                            "TypeError",
                            format!(
                                "sequence item in join(): expected str, got '{}'",
                                type_name(&other)
                            ),
                        ))
                    }
                }
            }
            Ok(new_str(parts.join(s)))
        }
        "replace" => {
            arity(method, &args, 2, 2)?;
            let from = to_str_arg(method, &args[0])?;
            let to = to_str_arg(method, &args[1])?;
            Ok(new_str(s.replace(&from, &to)))
        }
        "startswith" => {
            arity(method, &args, 1, 1)?;
            Ok(Value::Bool(s.starts_with(&to_str_arg(method, &args[0])?)))
        }
        "endswith" => {
            arity(method, &args, 1, 1)?;
            Ok(Value::Bool(s.ends_with(&to_str_arg(method, &args[0])?)))
        }
        "find" => {
            arity(method, &args, 1, 1)?;
            let needle = to_str_arg(method, &args[0])?;
            Ok(Value::Int(match s.find(&needle) {
                Some(byte_idx) => s[..byte_idx].chars().count() as i64,
                None => -1,
            }))
        }
        "index" => {
            arity(method, &args, 1, 1)?;
            let needle = to_str_arg(method, &args[0])?;
            match s.find(&needle) {
                Some(byte_idx) => Ok(Value::Int(s[..byte_idx].chars().count() as i64)),
                None => Err(raise("ValueError", "substring not found")),
            }
        }
        "count" => {
            arity(method, &args, 1, 1)?;
            let needle = to_str_arg(method, &args[0])?;
            if needle.is_empty() {
                return Ok(Value::Int(s.chars().count() as i64 + 1));
            }
            Ok(Value::Int(s.matches(&needle).count() as i64))
        }
        "title" => {
            let mut out = String::new();
            let mut at_word_start = true;
            for c in s.chars() {
                if c.is_alphanumeric() {
                    if at_word_start {
                        out.extend(c.to_uppercase());
                    } else {
                        out.extend(c.to_lowercase());
                    }
                    at_word_start = false;
                } else {
                    out.push(c);
                    at_word_start = true;
                }
            }
            Ok(new_str(out))
        }
        "capitalize" => {
            let mut chars = s.chars();
            Ok(new_str(match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }))
        }
        "isdigit" => Ok(Value::Bool(
            !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()),
        )),
        "isalpha" => Ok(Value::Bool(!s.is_empty() && s.chars().all(char::is_alphabetic))),
        "zfill" => {
            arity(method, &args, 1, 1)?;
            let width = to_i64(method, &args[0])? as usize;
            let len = s.chars().count();
            if len >= width {
                Ok(new_str(s))
            } else if let Some(rest) = s.strip_prefix('-') {
                Ok(new_str(format!("-{}{}", "0".repeat(width - len), rest)))
            } else {
                Ok(new_str(format!("{}{}", "0".repeat(width - len), s)))
            }
        }
        _ => Err(no_attr("str", method)),
    }
}

enum Strip {
    Both,
    Left,
    Right,
}

fn strip_chars(s: &str, args: &[Value], mode: Strip) -> Result<String, Flow> {
    let set: Vec<char> = match args.first() {
        None => vec![' ', '\t', '\n', '\r'],
        Some(v) => to_str_arg("strip", v)?.chars().collect(),
    };
    let pred = |c: &char| set.contains(c);
    Ok(match mode {
        Strip::Both => s.trim_matches(|c| pred(&c)).to_string(),
        Strip::Left => s.trim_start_matches(|c| pred(&c)).to_string(),
        Strip::Right => s.trim_end_matches(|c| pred(&c)).to_string(),
    })
}

fn list_method(
    interp: &mut Interp,
    items: &Rc<RefCell<Vec<Value>>>,
    method: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> EvalResult {
    match method {
        "append" => {
            arity(method, &args, 1, 1)?;
            items.borrow_mut().push(args[0].clone());
            Ok(Value::None)
        }
        "extend" => {
            arity(method, &args, 1, 1)?;
            let extra = interp.iterate(args[0].clone())?;
            items.borrow_mut().extend(extra);
            Ok(Value::None)
        }
        "pop" => {
            arity(method, &args, 0, 1)?;
            let mut items = items.borrow_mut();
            if items.is_empty() {
                return Err(raise("IndexError", "pop from empty list"));
            }
            let idx = match args.first() {
                None => items.len() - 1,
                Some(v) => {
                    let raw = to_i64(method, v)?;
                    let adjusted = if raw < 0 { raw + items.len() as i64 } else { raw };
                    if adjusted < 0 || adjusted >= items.len() as i64 {
                        return Err(raise("IndexError", "pop index out of range"));
                    }
                    adjusted as usize
                }
            };
            Ok(items.remove(idx))
        }
        "insert" => {
            arity(method, &args, 2, 2)?;
            let mut items = items.borrow_mut();
            let raw = to_i64(method, &args[0])?;
            let idx = raw.clamp(0, items.len() as i64) as usize;
            items.insert(idx, args[1].clone());
            Ok(Value::None)
        }
        "remove" => {
            arity(method, &args, 1, 1)?;
            let mut items = items.borrow_mut();
            let Some(idx) = items.iter().position(|v| value_eq(v, &args[0])) else {
                return Err(raise("ValueError", "list.remove(x): x not in list"));
            };
            items.remove(idx);
            Ok(Value::None)
        }
        "sort" => {
            reject_unknown_kwargs(method, &kwargs, &["key", "reverse"])?;
            let current = items.borrow().clone();
            let key_fn = kwarg(&kwargs, "key").cloned();
            let reverse = kwarg(&kwargs, "reverse").map(truthy).unwrap_or(false);
            let sorted = sort_values(interp, current, key_fn, reverse)?;
            *items.borrow_mut() = sorted;
            Ok(Value::None)
        }
        "reverse" => {
            items.borrow_mut().reverse();
            Ok(Value::None)
        }
        "count" => {
            arity(method, &args, 1, 1)?;
            let n = items
                .borrow()
                .iter()
                .filter(|v| value_eq(v, &args[0]))
                .count();
            Ok(Value::Int(n as i64))
        }
        "index" => {
            arity(method, &args, 1, 1)?;
            items
                .borrow()
                .iter()
                .position(|v| value_eq(v, &args[0]))
                .map(|i| Value::Int(i as i64))
                .ok_or_else(|| raise("ValueError", format!("{} is not in list", repr_value(&args[0]))))
        }
        "copy" => Ok(new_list(items.borrow().clone())),
        "clear" => {
            items.borrow_mut().clear();
            Ok(Value::None)
        }
        _ => Err(no_attr("list", method)),
    }
}

fn dict_method(
    interp: &mut Interp,
    d: &Rc<RefCell<DictValue>>,
    method: &str,
    args: Vec<Value>,
) -> EvalResult {
    match method {
        "get" => {
            arity(method, &args, 1, 2)?;
            let key = Key::from_value(&args[0]).map_err(|m| raise("TypeError", m))?;
            Ok(d.borrow()
                .get(&key)
                .cloned()
                .or_else(|| args.get(1).cloned())
                .unwrap_or(Value::None))
        }
        "keys" => Ok(new_list(
            d.borrow().entries.iter().map(|(k, _)| k.to_value()).collect(),
        )),
        "values" => Ok(new_list(
            d.borrow().entries.iter().map(|(_, v)| v.clone()).collect(),
        )),
        "items" => Ok(new_list(
            d.borrow()
                .entries
                .iter()
                .map(|(k, v)| Value::Tuple(Rc::new(vec![k.to_value(), v.clone()])))
                .collect(),
        )),
        "update" => {
            arity(method, &args, 1, 1)?;
            match &args[0] {
                Value::Dict(other) => {
                    let entries: Vec<_> = other.borrow().entries.clone();
                    let mut dict = d.borrow_mut();
                    for (k, v) in entries {
                        dict.insert(k, v);
                    }
                    Ok(Value::None)
                }
                other => Err(raise(
                    "TypeError",
                    format!("update() expects a dict, got '{}'", type_name(other)),
                )),
            }
        }
        "pop" => {
            arity(method, &args, 1, 2)?;
            let key = Key::from_value(&args[0]).map_err(|m| raise("TypeError", m))?;
            match d.borrow_mut().remove(&key) {
                Some(v) => Ok(v),
                None => args
                    .get(1)
                    .cloned()
                    .ok_or_else(|| raise("KeyError", repr_value(&args[0]))),
            }
        }
        "setdefault" => {
            arity(method, &args, 1, 2)?;
            let key = Key::from_value(&args[0]).map_err(|m| raise("TypeError", m))?;
            let default = args.get(1).cloned().unwrap_or(Value::None);
            let mut dict = d.borrow_mut();
            if let Some(v) = dict.get(&key) {
                return Ok(v.clone());
            }
            dict.insert(key, default.clone());
            Ok(default)
        }
        "copy" => {
            let src = d.borrow();
            let mut dict = DictValue::new();
            dict.default = src.default;
            for (k, v) in &src.entries {
                dict.insert(k.clone(), v.clone());
            }
            Ok(new_dict(dict))
        }
        "clear" => {
            d.borrow_mut().entries.clear();
            Ok(Value::None)
        }
        // Counter-style: entries sorted by count descending
        "most_common" => {
            arity(method, &args, 0, 1)?;
            let entries = d.borrow().entries.clone();
            let pairs: Vec<Value> = entries
                .iter()
                .map(|(k, v)| Value::Tuple(Rc::new(vec![k.to_value(), v.clone()])))
                .collect();
            let mut sorted = sort_values(
                interp,
                pairs,
                Some(Value::BoundMethod {
                    recv: Box::new(Value::Int(1)),
                    method: Rc::from("__itemgetter__"),
                }),
                true,
            )?;
            if let Some(n) = args.first() {
                let n = to_i64(method, n)?.max(0) as usize;
                sorted.truncate(n);
            }
            Ok(new_list(sorted))
        }
        _ => Err(no_attr("dict", method)),
    }
}

fn set_method(
    interp: &mut Interp,
    s: &Rc<RefCell<SetValue>>,
    method: &str,
    args: Vec<Value>,
) -> EvalResult {
    let to_key = |v: &Value| Key::from_value(v).map_err(|m| raise("TypeError", m));
    match method {
        "add" => {
            arity(method, &args, 1, 1)?;
            s.borrow_mut().insert(to_key(&args[0])?);
            Ok(Value::None)
        }
        "update" => {
            arity(method, &args, 1, 1)?;
            for item in interp.iterate(args[0].clone())? {
                let key = to_key(&item)?;
                s.borrow_mut().insert(key);
            }
            Ok(Value::None)
        }
        "discard" => {
            arity(method, &args, 1, 1)?;
            let key = to_key(&args[0])?;
            s.borrow_mut().remove(&key);
            Ok(Value::None)
        }
        "remove" => {
            arity(method, &args, 1, 1)?;
            let key = to_key(&args[0])?;
            if !s.borrow_mut().remove(&key) {
                return Err(raise("KeyError", repr_value(&args[0])));
            }
            Ok(Value::None)
        }
        "union" | "intersection" | "difference" => {
            arity(method, &args, 1, 1)?;
            let other_items: Vec<Key> = interp
                .iterate(args[0].clone())?
                .iter()
                .map(to_key)
                .collect::<Result<_, _>>()?;
            let current = s.borrow();
            let mut out = SetValue::new();
            match method {
                "union" => {
                    for k in current.items.iter().chain(other_items.iter()) {
                        out.insert(k.clone());
                    }
                }
                "intersection" => {
                    for k in &current.items {
                        if other_items.contains(k) {
                            out.insert(k.clone());
                        }
                    }
                }
                _ => {
                    for k in &current.items {
                        if !other_items.contains(k) {
                            out.insert(k.clone());
                        }
                    }
                }
            }
            Ok(Value::Set(Rc::new(RefCell::new(out))))
        }
        "copy" => {
            let mut out = SetValue::new();
            for k in &s.borrow().items {
                out.insert(k.clone());
            }
            Ok(Value::Set(Rc::new(RefCell::new(out))))
        }
        _ => Err(no_attr("set", method)),
    }
}

// ═══════════════════════════════════════════════════════════════
// Format specs
// ═══════════════════════════════════════════════════════════════

/// Subset of Python's format mini-language: `[,][.N][f|%|d|e]`
pub fn format_with_spec(value: &Value, spec: &str) -> Result<String, Flow> {
    if spec.is_empty() {
        return Ok(str_value(value));
    }

    let mut rest = spec;
    let grouping = if let Some(stripped) = rest.strip_prefix(',') {
        rest = stripped;
        true
    } else {
        false
    };
    let mut precision: Option<usize> = None;
    if let Some(stripped) = rest.strip_prefix('.') {
        let digits: String = stripped.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return Err(raise("ValueError", format!("invalid format spec '{spec}'")));
        }
        precision = Some(digits.parse().unwrap_or(6));
        rest = &stripped[digits.len()..];
    }

    let num = match value {
        Value::Int(i) => *i as f64,
        Value::Float(f) => *f,
        Value::Bool(b) => *b as i64 as f64,
        other => {
            if rest.is_empty() && precision.is_none() && !grouping {
                return Ok(str_value(other));
            }
            return Err(raise(
                "TypeError",
                format!(
                    "unsupported format spec '{spec}' for '{}'",
                    type_name(other)
                ),
            ));
        }
    };

    let formatted = match rest {
        "f" => format!("{:.*}", precision.unwrap_or(6), num),
        "%" => format!("{:.*}%", precision.unwrap_or(6), num * 100.0),
        "d" => format!("{}", num as i64),
        "e" => format!("{:.*e}", precision.unwrap_or(6), num),
        "" => match precision {
            Some(p) => format!("{:.*}", p, num),
            None => str_value(value),
        },
        _ => return Err(raise("ValueError", format!("invalid format spec '{spec}'"))),
    };

    if grouping {
        Ok(group_thousands(&formatted))
    } else {
        Ok(formatted)
    }
}

/// Insert thousands separators into the integer part of a rendered number
fn group_thousands(s: &str) -> String {
    let (sign, body) = match s.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", s),
    };
    let (int_part, frac_part) = match body.find('.') {
        Some(idx) => (&body[..idx], &body[idx..]),
        None => (body, ""),
    };
    let digits: Vec<char> = int_part.chars().collect();
    let mut grouped = String::new();
    for (i, c) in digits.iter().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(*c);
    }
    format!("{sign}{grouped}{frac_part}")
}
