//! Runtime values for the sandbox interpreter
//!
//! Containers use `Rc<RefCell<..>>` so aliasing behaves the way node authors
//! expect (appending to a list bound under two names mutates both views).
//! Execution is single-threaded per node; results cross into the async world
//! only after conversion to `serde_json::Value`.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use serde_json::Value as Json;

use super::ast::{Expr, Param, Stmt};

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<String>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<Vec<Value>>),
    Dict(Rc<RefCell<DictValue>>),
    Set(Rc<RefCell<SetValue>>),
    Range {
        start: i64,
        stop: i64,
        step: i64,
    },
    Slice {
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    },
    Func(Rc<FuncValue>),
    /// Builtin function, identified by name ("len", "math.sqrt", ...)
    Builtin(&'static str),
    /// Method bound to a receiver, dispatched by receiver type + name
    BoundMethod {
        recv: Box<Value>,
        method: Rc<str>,
    },
    /// Pre-imported safe module ("math", "statistics", ...)
    Module(&'static str),
    /// Type object (int, float, list, ...), callable as a constructor
    Type(TypeTag),
    /// Exception class (ValueError, KeyError, ...)
    ExcType(&'static str),
    /// Exception instance produced by calling an exception class
    Exc(Rc<ExcValue>),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    TimeDelta(ChronoDuration),
    /// Materialized iterator from iter(); advanced by next()
    Iterator(Rc<RefCell<IterState>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    Int,
    Float,
    Str,
    Bool,
    List,
    Dict,
    Tuple,
    Set,
    FrozenSet,
}

impl TypeTag {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Str => "str",
            Self::Bool => "bool",
            Self::List => "list",
            Self::Dict => "dict",
            Self::Tuple => "tuple",
            Self::Set => "set",
            Self::FrozenSet => "frozenset",
        }
    }
}

#[derive(Debug)]
pub struct ExcValue {
    pub kind: String,
    pub msg: String,
}

#[derive(Debug)]
pub struct IterState {
    pub items: Vec<Value>,
    pub pos: usize,
}

/// User-defined function or lambda
#[derive(Debug)]
pub struct FuncValue {
    pub name: String,
    pub params: Vec<Param>,
    pub body: FuncBody,
    /// Shallow snapshot of enclosing locals for lambdas; containers are
    /// shared through Rc so mutation stays visible
    pub captured: Vec<(String, Value)>,
}

#[derive(Debug, Clone)]
pub enum FuncBody {
    Stmts(Rc<Vec<Stmt>>),
    Expr(Rc<Expr>),
}

// ═══════════════════════════════════════════════════════════════
// Dict / set keys
// ═══════════════════════════════════════════════════════════════

/// Hashable key for dicts and sets
#[derive(Debug, Clone, PartialEq)]
pub enum Key {
    None,
    Bool(bool),
    Int(i64),
    /// Bit pattern, so NaN never gets in (rejected at conversion)
    Float(u64),
    Str(String),
    Tuple(Vec<Key>),
}

impl Key {
    pub fn from_value(value: &Value) -> Result<Key, String> {
        match value {
            Value::None => Ok(Key::None),
            Value::Bool(b) => Ok(Key::Bool(*b)),
            Value::Int(i) => Ok(Key::Int(*i)),
            Value::Float(f) => {
                if f.is_nan() {
                    return Err("NaN is not usable as a key in the sandbox".to_string());
                }
                Ok(Key::Float(f.to_bits()))
            }
            Value::Str(s) => Ok(Key::Str(s.as_ref().clone())),
            Value::Tuple(items) => {
                let keys = items
                    .iter()
                    .map(Key::from_value)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Key::Tuple(keys))
            }
            other => Err(format!("unhashable type: '{}'", type_name(other))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::None => Value::None,
            Key::Bool(b) => Value::Bool(*b),
            Key::Int(i) => Value::Int(*i),
            Key::Float(bits) => Value::Float(f64::from_bits(*bits)),
            Key::Str(s) => Value::Str(Rc::new(s.clone())),
            Key::Tuple(keys) => Value::Tuple(Rc::new(keys.iter().map(Key::to_value).collect())),
        }
    }

    /// Stable string form used when a dict becomes a JSON object key
    pub fn to_json_key(&self) -> String {
        match self {
            Key::Str(s) => s.clone(),
            other => str_value(&other.to_value()),
        }
    }
}

/// Value factory for defaultdict / Counter missing-key defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultKind {
    Int,
    Float,
    List,
    Dict,
    Set,
}

impl DefaultKind {
    pub fn produce(&self) -> Value {
        match self {
            Self::Int => Value::Int(0),
            Self::Float => Value::Float(0.0),
            Self::List => Value::List(Rc::new(RefCell::new(Vec::new()))),
            Self::Dict => Value::Dict(Rc::new(RefCell::new(DictValue::new()))),
            Self::Set => Value::Set(Rc::new(RefCell::new(SetValue::new()))),
        }
    }
}

/// Insertion-ordered dictionary with linear key lookup.
///
/// Node-scale data (dozens of categories, hundreds of rows) never needs a
/// hash index here; order preservation matters more.
#[derive(Debug, Default)]
pub struct DictValue {
    pub entries: Vec<(Key, Value)>,
    pub default: Option<DefaultKind>,
}

impl DictValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(default: DefaultKind) -> Self {
        Self {
            entries: Vec::new(),
            default: Some(default),
        }
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn insert(&mut self, key: Key, value: Value) {
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    pub fn remove(&mut self, key: &Key) -> Option<Value> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Insertion-ordered set
#[derive(Debug, Default)]
pub struct SetValue {
    pub items: Vec<Key>,
}

impl SetValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: Key) -> bool {
        if self.items.contains(&key) {
            false
        } else {
            self.items.push(key);
            true
        }
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.items.contains(key)
    }

    pub fn remove(&mut self, key: &Key) -> bool {
        if let Some(idx) = self.items.iter().position(|k| k == key) {
            self.items.remove(idx);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

// ═══════════════════════════════════════════════════════════════
// Introspection and conversion
// ═══════════════════════════════════════════════════════════════

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::None => "NoneType",
        Value::Bool(_) => "bool",
        Value::Int(_) => "int",
        Value::Float(_) => "float",
        Value::Str(_) => "str",
        Value::List(_) => "list",
        Value::Tuple(_) => "tuple",
        Value::Dict(_) => "dict",
        Value::Set(_) => "set",
        Value::Range { .. } => "range",
        Value::Slice { .. } => "slice",
        Value::Func(_) => "function",
        Value::Builtin(_) => "builtin_function_or_method",
        Value::BoundMethod { .. } => "builtin_function_or_method",
        Value::Module(_) => "module",
        Value::Type(_) => "type",
        Value::ExcType(_) => "type",
        Value::Exc(_) => "Exception",
        Value::Date(_) => "date",
        Value::DateTime(_) => "datetime",
        Value::TimeDelta(_) => "timedelta",
        Value::Iterator(_) => "iterator",
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::None => false,
        Value::Bool(b) => *b,
        Value::Int(i) => *i != 0,
        Value::Float(f) => *f != 0.0,
        Value::Str(s) => !s.is_empty(),
        Value::List(l) => !l.borrow().is_empty(),
        Value::Tuple(t) => !t.is_empty(),
        Value::Dict(d) => !d.borrow().is_empty(),
        Value::Set(s) => s.borrow().len() > 0,
        Value::Range { start, stop, step } => {
            if *step > 0 {
                start < stop
            } else {
                start > stop
            }
        }
        _ => true,
    }
}

/// Structural equality with int/float cross-comparison
pub fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => *x as f64 == *y,
        (Value::Bool(x), Value::Int(y)) | (Value::Int(y), Value::Bool(x)) => (*x as i64) == *y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::List(x), Value::List(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| value_eq(a, b))
        }
        (Value::Tuple(x), Value::Tuple(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| value_eq(a, b))
        }
        (Value::Dict(x), Value::Dict(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len()
                && x.entries
                    .iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| value_eq(v, w)))
        }
        (Value::Set(x), Value::Set(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len() && x.items.iter().all(|k| y.items.contains(k))
        }
        (Value::Date(x), Value::Date(y)) => x == y,
        (Value::DateTime(x), Value::DateTime(y)) => x == y,
        (Value::TimeDelta(x), Value::TimeDelta(y)) => x == y,
        (Value::ExcType(x), Value::ExcType(y)) => x == y,
        (Value::Type(x), Value::Type(y)) => x == y,
        _ => false,
    }
}

/// Ordering comparison; errors on unorderable type pairs
pub fn value_cmp(a: &Value, b: &Value) -> Result<Ordering, String> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(x.cmp(y)),
        (Value::Float(x), Value::Float(y)) => x
            .partial_cmp(y)
            .ok_or_else(|| "cannot order NaN".to_string()),
        (Value::Int(x), Value::Float(y)) => (*x as f64)
            .partial_cmp(y)
            .ok_or_else(|| "cannot order NaN".to_string()),
        (Value::Float(x), Value::Int(y)) => x
            .partial_cmp(&(*y as f64))
            .ok_or_else(|| "cannot order NaN".to_string()),
        (Value::Bool(x), Value::Bool(y)) => Ok(x.cmp(y)),
        (Value::Bool(x), _) => value_cmp(&Value::Int(*x as i64), b),
        (_, Value::Bool(y)) => value_cmp(a, &Value::Int(*y as i64)),
        (Value::Str(x), Value::Str(y)) => Ok(x.cmp(y)),
        (Value::List(x), Value::List(y)) => {
            let (x, y) = (x.borrow().clone(), y.borrow().clone());
            seq_cmp(&x, &y)
        }
        (Value::Tuple(x), Value::Tuple(y)) => seq_cmp(x, y),
        (Value::Date(x), Value::Date(y)) => Ok(x.cmp(y)),
        (Value::DateTime(x), Value::DateTime(y)) => Ok(x.cmp(y)),
        (Value::TimeDelta(x), Value::TimeDelta(y)) => Ok(x.cmp(y)),
        _ => Err(format!(
            "'<' not supported between instances of '{}' and '{}'",
            type_name(a),
            type_name(b)
        )),
    }
}

fn seq_cmp(x: &[Value], y: &[Value]) -> Result<Ordering, String> {
    for (a, b) in x.iter().zip(y.iter()) {
        if !value_eq(a, b) {
            return value_cmp(a, b);
        }
    }
    Ok(x.len().cmp(&y.len()))
}

/// Python-style float display: integral floats keep a trailing ".0"
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}

/// str() rendering
pub fn str_value(value: &Value) -> String {
    match value {
        Value::None => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => format_float(*f),
        Value::Str(s) => s.as_ref().clone(),
        Value::Date(d) => d.format("%Y-%m-%d").to_string(),
        Value::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        Value::TimeDelta(d) => {
            let secs = d.num_seconds();
            let days = secs / 86_400;
            let rem = secs.rem_euclid(86_400);
            let (h, m, s) = (rem / 3600, (rem % 3600) / 60, rem % 60);
            if days != 0 {
                format!("{days} day{}, {h}:{m:02}:{s:02}", if days == 1 { "" } else { "s" })
            } else {
                format!("{h}:{m:02}:{s:02}")
            }
        }
        other => repr_value(other),
    }
}

/// repr() rendering
pub fn repr_value(value: &Value) -> String {
    match value {
        Value::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
        Value::List(items) => {
            let inner: Vec<String> = items.borrow().iter().map(repr_value).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Tuple(items) => {
            let inner: Vec<String> = items.iter().map(repr_value).collect();
            if items.len() == 1 {
                format!("({},)", inner[0])
            } else {
                format!("({})", inner.join(", "))
            }
        }
        Value::Dict(d) => {
            let inner: Vec<String> = d
                .borrow()
                .entries
                .iter()
                .map(|(k, v)| format!("{}: {}", repr_value(&k.to_value()), repr_value(v)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
        Value::Set(s) => {
            let set = s.borrow();
            if set.items.is_empty() {
                "set()".to_string()
            } else {
                let inner: Vec<String> = set
                    .items
                    .iter()
                    .map(|k| repr_value(&k.to_value()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
        }
        Value::Range { start, stop, step } => {
            if *step == 1 {
                format!("range({start}, {stop})")
            } else {
                format!("range({start}, {stop}, {step})")
            }
        }
        Value::Func(f) => format!("<function {}>", f.name),
        Value::Builtin(name) => format!("<built-in function {name}>"),
        Value::BoundMethod { method, .. } => format!("<built-in method {method}>"),
        Value::Module(name) => format!("<module '{name}'>"),
        Value::Type(tag) => format!("<class '{}'>", tag.name()),
        Value::ExcType(name) => format!("<class '{name}'>"),
        Value::Exc(e) => format!("{}('{}')", e.kind, e.msg),
        Value::Slice { start, stop, step } => format!(
            "slice({}, {}, {})",
            start.map_or("None".to_string(), |v| v.to_string()),
            stop.map_or("None".to_string(), |v| v.to_string()),
            step.map_or("None".to_string(), |v| v.to_string()),
        ),
        Value::Iterator(_) => "<iterator>".to_string(),
        other => str_value(other),
    }
}

/// JSON → sandbox value
pub fn from_json(json: &Json) -> Value {
    match json {
        Json::Null => Value::None,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Json::String(s) => Value::Str(Rc::new(s.clone())),
        Json::Array(items) => Value::List(Rc::new(RefCell::new(
            items.iter().map(from_json).collect(),
        ))),
        Json::Object(map) => {
            let mut dict = DictValue::new();
            for (k, v) in map {
                dict.insert(Key::Str(k.clone()), from_json(v));
            }
            Value::Dict(Rc::new(RefCell::new(dict)))
        }
    }
}

/// Sandbox value → JSON; errors on non-data values
pub fn to_json(value: &Value) -> Result<Json, String> {
    match value {
        Value::None => Ok(Json::Null),
        Value::Bool(b) => Ok(Json::Bool(*b)),
        Value::Int(i) => Ok(Json::from(*i)),
        Value::Float(f) => {
            if f.is_finite() {
                Ok(serde_json::Number::from_f64(*f)
                    .map(Json::Number)
                    .unwrap_or(Json::Null))
            } else {
                Ok(Json::Null)
            }
        }
        Value::Str(s) => Ok(Json::String(s.as_ref().clone())),
        Value::List(items) => items.borrow().iter().map(to_json).collect(),
        Value::Tuple(items) => items.iter().map(to_json).collect(),
        Value::Set(s) => s.borrow().items.iter().map(|k| to_json(&k.to_value())).collect(),
        Value::Range { .. } => range_items(value).iter().map(to_json).collect(),
        Value::Dict(d) => {
            let mut map = serde_json::Map::new();
            for (k, v) in &d.borrow().entries {
                map.insert(k.to_json_key(), to_json(v)?);
            }
            Ok(Json::Object(map))
        }
        Value::Date(_) | Value::DateTime(_) => Ok(Json::String(str_value(value))),
        Value::TimeDelta(d) => Ok(Json::from(d.num_seconds())),
        other => Err(format!(
            "value of type '{}' is not JSON-serializable",
            type_name(other)
        )),
    }
}

/// Materialize a range into values (used by iteration and JSON conversion)
pub fn range_items(value: &Value) -> Vec<Value> {
    let Value::Range { start, stop, step } = value else {
        return Vec::new();
    };
    let mut items = Vec::new();
    let (mut i, stop, step) = (*start, *stop, *step);
    if step > 0 {
        while i < stop {
            items.push(Value::Int(i));
            i += step;
        }
    } else if step < 0 {
        while i > stop {
            items.push(Value::Int(i));
            i += step;
        }
    }
    items
}

pub fn new_list(items: Vec<Value>) -> Value {
    Value::List(Rc::new(RefCell::new(items)))
}

pub fn new_str(s: impl Into<String>) -> Value {
    Value::Str(Rc::new(s.into()))
}

pub fn new_dict(dict: DictValue) -> Value {
    Value::Dict(Rc::new(RefCell::new(dict)))
}
