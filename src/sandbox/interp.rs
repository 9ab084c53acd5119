//! Tree-walking evaluator for sandboxed node code
//!
//! One `Interp` lives for the duration of a single node call and is dropped
//! with its namespace afterwards. The evaluation loop checks a wall-clock
//! deadline so pathological loops cannot stall the executor; the timeout is
//! deliberately not catchable by sandboxed `try`.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::rc::Rc;
use std::time::Instant;

use rand::rngs::StdRng;
use rustc_hash::FxHashMap;

use super::ast::*;
use super::builtins;
use super::value::*;

/// Maximum user-function call depth
const MAX_CALL_DEPTH: usize = 64;

/// Non-local control flow during evaluation
#[derive(Debug)]
pub enum Flow {
    Raise(RaisedExc),
    Break,
    Continue,
    Return(Value),
    /// Wall-clock deadline exceeded; never catchable in sandboxed code
    Timeout,
}

#[derive(Debug, Clone)]
pub struct RaisedExc {
    pub kind: String,
    pub msg: String,
}

impl RaisedExc {
    pub fn render(&self) -> String {
        if self.msg.is_empty() {
            self.kind.clone()
        } else {
            format!("{}: {}", self.kind, self.msg)
        }
    }
}

/// Shorthand for building a raised exception
pub fn raise(kind: &str, msg: impl Into<String>) -> Flow {
    Flow::Raise(RaisedExc {
        kind: kind.to_string(),
        msg: msg.into(),
    })
}

pub type EvalResult = Result<Value, Flow>;

pub struct Interp {
    /// Builtin names, modules, exception classes
    pub globals: FxHashMap<String, Value>,
    /// Scope stack; frame 0 is the module namespace
    scopes: Vec<FxHashMap<String, Value>>,
    deadline: Option<Instant>,
    ops: Cell<u64>,
    /// State of the sandboxed `random` module
    pub rng: RefCell<Option<StdRng>>,
    /// Sink for print(); discarded after the call
    pub stdout: RefCell<String>,
}

impl Interp {
    pub fn new(deadline: Option<Instant>) -> Self {
        Self {
            globals: builtins::default_globals(),
            scopes: vec![FxHashMap::default()],
            deadline,
            ops: Cell::new(0),
            rng: RefCell::new(None),
            stdout: RefCell::new(String::new()),
        }
    }

    /// Read a name bound at module level (e.g. the node's function def)
    pub fn module_binding(&self, name: &str) -> Option<Value> {
        self.scopes.first().and_then(|f| f.get(name)).cloned()
    }

    /// Wall-clock check, amortized over evaluation steps
    pub fn check_budget(&self) -> Result<(), Flow> {
        let n = self.ops.get().wrapping_add(1);
        self.ops.set(n);
        if n % 512 == 0 {
            if let Some(deadline) = self.deadline {
                if Instant::now() >= deadline {
                    return Err(Flow::Timeout);
                }
            }
        }
        Ok(())
    }

    fn resolve(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.scopes.last().and_then(|f| f.get(name)) {
            return Some(v.clone());
        }
        if self.scopes.len() > 1 {
            if let Some(v) = self.scopes[0].get(name) {
                return Some(v.clone());
            }
        }
        self.globals.get(name).cloned()
    }

    fn bind(&mut self, name: &str, value: Value) {
        self.scopes
            .last_mut()
            .expect("scope stack is never empty")
            .insert(name.to_string(), value);
    }

    /// Flattened snapshot of reachable locals, for lambda/closure capture
    fn capture_env(&self) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        if self.scopes.len() > 1 {
            for (k, v) in &self.scopes[0] {
                out.push((k.clone(), v.clone()));
            }
        }
        if let Some(top) = self.scopes.last() {
            for (k, v) in top {
                out.push((k.clone(), v.clone()));
            }
        }
        out
    }

    // ═══════════════════════════════════════════════════════════════
    // Statements
    // ═══════════════════════════════════════════════════════════════

    pub fn exec_stmts(&mut self, stmts: &[Stmt]) -> Result<(), Flow> {
        for stmt in stmts {
            self.exec_stmt(stmt)?;
        }
        Ok(())
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Result<(), Flow> {
        self.check_budget()?;
        match stmt {
            Stmt::FuncDef {
                name, params, body, ..
            } => {
                let captured = if self.scopes.len() > 1 {
                    self.capture_env()
                } else {
                    Vec::new()
                };
                let func = Value::Func(Rc::new(FuncValue {
                    name: name.clone(),
                    params: params.clone(),
                    body: FuncBody::Stmts(Rc::new(body.clone())),
                    captured,
                }));
                self.bind(name, func);
                Ok(())
            }
            Stmt::Return { value, .. } => {
                let v = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::None,
                };
                Err(Flow::Return(v))
            }
            Stmt::Assign { targets, value, .. } => {
                let v = self.eval(value)?;
                for target in targets {
                    self.assign_target(target, v.clone())?;
                }
                Ok(())
            }
            Stmt::AugAssign {
                target, op, value, ..
            } => {
                let current = self.load_target(target)?;
                let rhs = self.eval(value)?;
                let updated = self.binary_op(*op, current, rhs)?;
                self.assign_target(target, updated)
            }
            Stmt::If {
                branches, orelse, ..
            } => {
                for (cond, body) in branches {
                    let c = self.eval(cond)?;
                    if truthy(&c) {
                        return self.exec_stmts(body);
                    }
                }
                self.exec_stmts(orelse)
            }
            Stmt::For {
                target, iter, body, ..
            } => {
                let iterable = self.eval(iter)?;
                let items = self.iterate(iterable)?;
                for item in items {
                    self.check_budget()?;
                    self.assign_target(target, item)?;
                    match self.exec_stmts(body) {
                        Ok(()) => {}
                        Err(Flow::Break) => break,
                        Err(Flow::Continue) => continue,
                        Err(flow) => return Err(flow),
                    }
                }
                Ok(())
            }
            Stmt::While { cond, body, .. } => {
                loop {
                    self.check_budget()?;
                    let c = self.eval(cond)?;
                    if !truthy(&c) {
                        break;
                    }
                    match self.exec_stmts(body) {
                        Ok(()) => {}
                        Err(Flow::Break) => break,
                        Err(Flow::Continue) => continue,
                        Err(flow) => return Err(flow),
                    }
                }
                Ok(())
            }
            Stmt::Try {
                body,
                handlers,
                finally,
                ..
            } => {
                let result = self.exec_stmts(body);
                let result = match result {
                    Err(Flow::Raise(exc)) => self.run_handlers(&exc, handlers),
                    other => other,
                };
                // finally always runs; its own control flow wins
                let fin = self.exec_stmts(finally);
                match fin {
                    Ok(()) => result,
                    Err(flow) => Err(flow),
                }
            }
            Stmt::Raise { exc, .. } => match exc {
                None => Err(raise("RuntimeError", "No active exception to re-raise")),
                Some(expr) => {
                    let v = self.eval(expr)?;
                    match v {
                        Value::Exc(e) => Err(Flow::Raise(RaisedExc {
                            kind: e.kind.clone(),
                            msg: e.msg.clone(),
                        })),
                        Value::ExcType(name) => Err(raise(name, "")),
                        other => Err(raise(
                            "TypeError",
                            format!(
                                "exceptions must derive from BaseException, not '{}'",
                                type_name(&other)
                            ),
                        )),
                    }
                }
            },
            Stmt::Expr { value, .. } => {
                self.eval(value)?;
                Ok(())
            }
            Stmt::Pass => Ok(()),
            Stmt::Break { .. } => Err(Flow::Break),
            Stmt::Continue { .. } => Err(Flow::Continue),
            // The safety scan rejects these before execution; raising here
            // keeps the invariant even if a caller skips the scan.
            Stmt::Import { names, .. } => Err(raise(
                "ImportError",
                format!("import of '{}' is not allowed in the sandbox", names.join(", ")),
            )),
            Stmt::ImportFrom { module, .. } => Err(raise(
                "ImportError",
                format!("import from '{module}' is not allowed in the sandbox"),
            )),
        }
    }

    fn run_handlers(&mut self, exc: &RaisedExc, handlers: &[ExceptHandler]) -> Result<(), Flow> {
        for handler in handlers {
            if self.handler_matches(exc, handler)? {
                if let Some(name) = &handler.name {
                    let instance = Value::Exc(Rc::new(ExcValue {
                        kind: exc.kind.clone(),
                        msg: exc.msg.clone(),
                    }));
                    self.bind(name, instance);
                }
                return self.exec_stmts(&handler.body);
            }
        }
        Err(Flow::Raise(exc.clone()))
    }

    fn handler_matches(&mut self, exc: &RaisedExc, handler: &ExceptHandler) -> Result<bool, Flow> {
        let Some(type_expr) = &handler.exc_type else {
            return Ok(true); // bare except
        };
        let ty = self.eval(type_expr)?;
        Ok(exc_type_matches(&ty, &exc.kind))
    }

    // ═══════════════════════════════════════════════════════════════
    // Targets
    // ═══════════════════════════════════════════════════════════════

    pub fn assign_target(&mut self, target: &Target, value: Value) -> Result<(), Flow> {
        match target {
            Target::Name(name, _) => {
                self.bind(name, value);
                Ok(())
            }
            Target::Tuple(targets) => {
                let items = self.iterate(value)?;
                if items.len() != targets.len() {
                    return Err(raise(
                        "ValueError",
                        format!(
                            "cannot unpack {} values into {} targets",
                            items.len(),
                            targets.len()
                        ),
                    ));
                }
                for (t, v) in targets.iter().zip(items) {
                    self.assign_target(t, v)?;
                }
                Ok(())
            }
            Target::Subscript { obj, index, .. } => {
                let container = self.eval(obj)?;
                let idx = self.eval(index)?;
                self.subscript_set(container, idx, value)
            }
        }
    }

    /// Read the current value of an augmented-assignment target
    fn load_target(&mut self, target: &Target) -> EvalResult {
        match target {
            Target::Name(name, line) => self
                .resolve(name)
                .ok_or_else(|| name_error(name, *line)),
            Target::Subscript { obj, index, line } => {
                let container = self.eval(obj)?;
                let idx = self.eval(index)?;
                self.subscript_get(container, idx, *line)
            }
            Target::Tuple(_) => Err(raise(
                "TypeError",
                "augmented assignment to a tuple target is not supported",
            )),
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Expressions
    // ═══════════════════════════════════════════════════════════════

    pub fn eval(&mut self, expr: &Expr) -> EvalResult {
        self.check_budget()?;
        match expr {
            Expr::NoneLit => Ok(Value::None),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Int(i) => Ok(Value::Int(*i)),
            Expr::Float(f) => Ok(Value::Float(*f)),
            Expr::Str(s) => Ok(new_str(s.clone())),
            Expr::FString(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        FPart::Lit(s) => out.push_str(s),
                        FPart::Expr { expr, spec } => {
                            let v = self.eval(expr)?;
                            match spec {
                                Some(spec) => out.push_str(&builtins::format_with_spec(&v, spec)?),
                                None => out.push_str(&str_value(&v)),
                            }
                        }
                    }
                }
                Ok(new_str(out))
            }
            Expr::Name(name, line) => self
                .resolve(name)
                .ok_or_else(|| name_error(name, *line)),
            Expr::List(items) => {
                let values = items
                    .iter()
                    .map(|e| self.eval(e))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(new_list(values))
            }
            Expr::Tuple(items) => {
                let values = items
                    .iter()
                    .map(|e| self.eval(e))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Tuple(Rc::new(values)))
            }
            Expr::Set(items) => {
                let mut set = SetValue::new();
                for e in items {
                    let v = self.eval(e)?;
                    let key = Key::from_value(&v).map_err(|m| raise("TypeError", m))?;
                    set.insert(key);
                }
                Ok(Value::Set(Rc::new(RefCell::new(set))))
            }
            Expr::Dict(pairs) => {
                let mut dict = DictValue::new();
                for (k, v) in pairs {
                    let kv = self.eval(k)?;
                    let key = Key::from_value(&kv).map_err(|m| raise("TypeError", m))?;
                    let vv = self.eval(v)?;
                    dict.insert(key, vv);
                }
                Ok(new_dict(dict))
            }
            Expr::Lambda { params, body } => Ok(Value::Func(Rc::new(FuncValue {
                name: "<lambda>".to_string(),
                params: params.clone(),
                body: FuncBody::Expr(Rc::new((**body).clone())),
                captured: self.capture_env(),
            }))),
            Expr::Unary { op, operand } => {
                let v = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!truthy(&v))),
                    UnaryOp::Neg => match v {
                        Value::Int(i) => Ok(Value::Int(-i)),
                        Value::Float(f) => Ok(Value::Float(-f)),
                        Value::Bool(b) => Ok(Value::Int(-(b as i64))),
                        Value::TimeDelta(d) => Ok(Value::TimeDelta(-d)),
                        other => Err(raise(
                            "TypeError",
                            format!("bad operand type for unary -: '{}'", type_name(&other)),
                        )),
                    },
                    UnaryOp::Pos => match v {
                        Value::Int(_) | Value::Float(_) | Value::Bool(_) => Ok(v),
                        other => Err(raise(
                            "TypeError",
                            format!("bad operand type for unary +: '{}'", type_name(&other)),
                        )),
                    },
                }
            }
            Expr::Binary { left, op, right } => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                self.binary_op(*op, l, r)
            }
            Expr::BoolOp { op, values } => {
                // Python semantics: the deciding operand is the result value
                let mut last = Value::None;
                for e in values {
                    last = self.eval(e)?;
                    let t = truthy(&last);
                    let short_circuit = match op {
                        BoolOp::And => !t,
                        BoolOp::Or => t,
                    };
                    if short_circuit {
                        return Ok(last);
                    }
                }
                Ok(last)
            }
            Expr::Compare { left, ops } => {
                let mut lhs = self.eval(left)?;
                for (op, right_expr) in ops {
                    let rhs = self.eval(right_expr)?;
                    if !self.compare(*op, &lhs, &rhs)? {
                        return Ok(Value::Bool(false));
                    }
                    lhs = rhs;
                }
                Ok(Value::Bool(true))
            }
            Expr::Call {
                func, args, kwargs, ..
            } => {
                let callee = self.eval(func)?;
                let mut arg_values = Vec::with_capacity(args.len());
                for a in args {
                    arg_values.push(self.eval(a)?);
                }
                let mut kwarg_values = Vec::with_capacity(kwargs.len());
                for (name, e) in kwargs {
                    kwarg_values.push((name.clone(), self.eval(e)?));
                }
                self.call_value(callee, arg_values, kwarg_values)
            }
            Expr::Attribute { obj, attr, line } => {
                let recv = self.eval(obj)?;
                builtins::get_attr(recv, attr, *line)
            }
            Expr::Subscript { obj, index, line } => {
                let container = self.eval(obj)?;
                match &**index {
                    Index::Single(e) => {
                        let idx = self.eval(e)?;
                        self.subscript_get(container, idx, *line)
                    }
                    Index::Slice { lower, upper, step } => {
                        let lower = self.eval_opt_int(lower)?;
                        let upper = self.eval_opt_int(upper)?;
                        let step = self.eval_opt_int(step)?;
                        self.slice_get(container, lower, upper, step)
                    }
                }
            }
            Expr::IfExp { cond, then, orelse } => {
                let c = self.eval(cond)?;
                if truthy(&c) {
                    self.eval(then)
                } else {
                    self.eval(orelse)
                }
            }
            Expr::ListComp { elt, generators } => {
                let mut out = Vec::new();
                self.comp_rec(generators, &mut |interp| {
                    let v = interp.eval(elt)?;
                    out.push(v);
                    Ok(())
                })?;
                Ok(new_list(out))
            }
            Expr::SetComp { elt, generators } => {
                let mut set = SetValue::new();
                self.comp_rec(generators, &mut |interp| {
                    let v = interp.eval(elt)?;
                    let key = Key::from_value(&v).map_err(|m| raise("TypeError", m))?;
                    set.insert(key);
                    Ok(())
                })?;
                Ok(Value::Set(Rc::new(RefCell::new(set))))
            }
            Expr::DictComp {
                key,
                value,
                generators,
            } => {
                let mut dict = DictValue::new();
                self.comp_rec(generators, &mut |interp| {
                    let kv = interp.eval(key)?;
                    let k = Key::from_value(&kv).map_err(|m| raise("TypeError", m))?;
                    let v = interp.eval(value)?;
                    dict.insert(k, v);
                    Ok(())
                })?;
                Ok(new_dict(dict))
            }
        }
    }

    fn eval_opt_int(&mut self, expr: &Option<Expr>) -> Result<Option<i64>, Flow> {
        let Some(e) = expr else {
            return Ok(None);
        };
        match self.eval(e)? {
            Value::Int(i) => Ok(Some(i)),
            Value::None => Ok(None),
            other => Err(raise(
                "TypeError",
                format!("slice indices must be integers, not '{}'", type_name(&other)),
            )),
        }
    }

    fn comp_rec(
        &mut self,
        gens: &[Comprehension],
        emit: &mut dyn FnMut(&mut Interp) -> Result<(), Flow>,
    ) -> Result<(), Flow> {
        let Some((gen, rest)) = gens.split_first() else {
            return emit(self);
        };
        let iterable = self.eval(&gen.iter)?;
        let items = self.iterate(iterable)?;
        'items: for item in items {
            self.check_budget()?;
            self.assign_target(&gen.target, item)?;
            for cond in &gen.ifs {
                let c = self.eval(cond)?;
                if !truthy(&c) {
                    continue 'items;
                }
            }
            self.comp_rec(rest, emit)?;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════
    // Calls
    // ═══════════════════════════════════════════════════════════════

    pub fn call_value(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> EvalResult {
        match callee {
            Value::Func(f) => {
                let self_ref = Value::Func(Rc::clone(&f));
                self.call_func_inner(&f, Some(self_ref), args, kwargs)
            }
            Value::Builtin(name) => builtins::call_builtin(self, name, args, kwargs),
            Value::BoundMethod { recv, method } => {
                builtins::call_method(self, *recv, &method, args, kwargs)
            }
            Value::Type(tag) => builtins::construct(self, tag, args, kwargs),
            Value::ExcType(name) => {
                let msg = args.first().map(str_value).unwrap_or_default();
                Ok(Value::Exc(Rc::new(ExcValue {
                    kind: name.to_string(),
                    msg,
                })))
            }
            other => Err(raise(
                "TypeError",
                format!("'{}' object is not callable", type_name(&other)),
            )),
        }
    }

    pub fn call_func(
        &mut self,
        f: &FuncValue,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> EvalResult {
        self.call_func_inner(f, None, args, kwargs)
    }

    fn call_func_inner(
        &mut self,
        f: &FuncValue,
        self_ref: Option<Value>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> EvalResult {
        if self.scopes.len() >= MAX_CALL_DEPTH {
            return Err(raise("RecursionError", "maximum recursion depth exceeded"));
        }

        let mut frame: FxHashMap<String, Value> = FxHashMap::default();
        for (k, v) in &f.captured {
            frame.insert(k.clone(), v.clone());
        }
        // The function can always name itself, so nested defs may recurse
        if let Some(self_ref) = self_ref {
            if f.name != "<lambda>" {
                frame.insert(f.name.clone(), self_ref);
            }
        }

        if args.len() > f.params.len() {
            return Err(raise(
                "TypeError",
                format!(
                    "{}() takes {} positional argument(s) but {} were given",
                    f.name,
                    f.params.len(),
                    args.len()
                ),
            ));
        }

        let mut bound: Vec<Option<Value>> = vec![None; f.params.len()];
        for (i, arg) in args.into_iter().enumerate() {
            bound[i] = Some(arg);
        }
        for (name, value) in kwargs {
            let Some(idx) = f.params.iter().position(|p| p.name == name) else {
                return Err(raise(
                    "TypeError",
                    format!("{}() got an unexpected keyword argument '{}'", f.name, name),
                ));
            };
            if bound[idx].is_some() {
                return Err(raise(
                    "TypeError",
                    format!("{}() got multiple values for argument '{}'", f.name, name),
                ));
            }
            bound[idx] = Some(value);
        }

        self.scopes.push(frame);
        let result = self.bind_defaults_and_run(f, bound);
        self.scopes.pop();
        result
    }

    fn bind_defaults_and_run(&mut self, f: &FuncValue, bound: Vec<Option<Value>>) -> EvalResult {
        for (param, slot) in f.params.iter().zip(bound) {
            let value = match slot {
                Some(v) => v,
                None => match &param.default {
                    Some(default_expr) => self.eval(default_expr)?,
                    None => {
                        return Err(raise(
                            "TypeError",
                            format!(
                                "{}() missing required argument: '{}'",
                                f.name, param.name
                            ),
                        ))
                    }
                },
            };
            self.bind(&param.name, value);
        }

        match &f.body {
            FuncBody::Expr(expr) => self.eval(expr),
            FuncBody::Stmts(stmts) => match self.exec_stmts(stmts) {
                Ok(()) => Ok(Value::None),
                Err(Flow::Return(v)) => Ok(v),
                Err(Flow::Break) | Err(Flow::Continue) => {
                    Err(raise("SyntaxError", "'break' or 'continue' outside loop"))
                }
                Err(flow) => Err(flow),
            },
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Operators
    // ═══════════════════════════════════════════════════════════════

    pub fn binary_op(&mut self, op: BinOp, l: Value, r: Value) -> EvalResult {
        use BinOp::*;

        // Numeric fast path (bools coerce to ints)
        if let (Some(a), Some(b)) = (as_number(&l), as_number(&r)) {
            return numeric_op(op, a, b, int_pair(&l, &r));
        }

        match (op, &l, &r) {
            (Add, Value::Str(a), Value::Str(b)) => Ok(new_str(format!("{a}{b}"))),
            (Add, Value::List(a), Value::List(b)) => {
                let mut items = a.borrow().clone();
                items.extend(b.borrow().iter().cloned());
                Ok(new_list(items))
            }
            (Add, Value::Tuple(a), Value::Tuple(b)) => {
                let mut items = (**a).clone();
                items.extend(b.iter().cloned());
                Ok(Value::Tuple(Rc::new(items)))
            }
            (Add, Value::TimeDelta(a), Value::TimeDelta(b)) => Ok(Value::TimeDelta(*a + *b)),
            (Add, Value::Date(d), Value::TimeDelta(t))
            | (Add, Value::TimeDelta(t), Value::Date(d)) => Ok(Value::Date(*d + *t)),
            (Add, Value::DateTime(d), Value::TimeDelta(t))
            | (Add, Value::TimeDelta(t), Value::DateTime(d)) => Ok(Value::DateTime(*d + *t)),
            (Sub, Value::TimeDelta(a), Value::TimeDelta(b)) => Ok(Value::TimeDelta(*a - *b)),
            (Sub, Value::Date(a), Value::Date(b)) => Ok(Value::TimeDelta(*a - *b)),
            (Sub, Value::DateTime(a), Value::DateTime(b)) => Ok(Value::TimeDelta(*a - *b)),
            (Sub, Value::Date(d), Value::TimeDelta(t)) => Ok(Value::Date(*d - *t)),
            (Sub, Value::DateTime(d), Value::TimeDelta(t)) => Ok(Value::DateTime(*d - *t)),
            (Sub, Value::Set(a), Value::Set(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                let mut out = SetValue::new();
                for k in &a.items {
                    if !b.contains(k) {
                        out.insert(k.clone());
                    }
                }
                Ok(Value::Set(Rc::new(RefCell::new(out))))
            }
            (Mul, Value::Str(s), Value::Int(n)) | (Mul, Value::Int(n), Value::Str(s)) => {
                Ok(new_str(s.repeat((*n).max(0) as usize)))
            }
            (Mul, Value::List(items), Value::Int(n))
            | (Mul, Value::Int(n), Value::List(items)) => {
                let src = items.borrow();
                let mut out = Vec::new();
                for _ in 0..(*n).max(0) {
                    out.extend(src.iter().cloned());
                }
                Ok(new_list(out))
            }
            _ => Err(raise(
                "TypeError",
                format!(
                    "unsupported operand type(s) for {}: '{}' and '{}'",
                    op.symbol(),
                    type_name(&l),
                    type_name(&r)
                ),
            )),
        }
    }

    pub fn compare(&mut self, op: CmpOp, l: &Value, r: &Value) -> Result<bool, Flow> {
        match op {
            CmpOp::Eq => Ok(value_eq(l, r)),
            CmpOp::NotEq => Ok(!value_eq(l, r)),
            CmpOp::Lt | CmpOp::LtEq | CmpOp::Gt | CmpOp::GtEq => {
                let ord = value_cmp(l, r).map_err(|m| raise("TypeError", m))?;
                Ok(match op {
                    CmpOp::Lt => ord == Ordering::Less,
                    CmpOp::LtEq => ord != Ordering::Greater,
                    CmpOp::Gt => ord == Ordering::Greater,
                    CmpOp::GtEq => ord != Ordering::Less,
                    _ => unreachable!(),
                })
            }
            CmpOp::In => self.membership(l, r),
            CmpOp::NotIn => Ok(!self.membership(l, r)?),
            CmpOp::Is => Ok(is_identical(l, r)),
            CmpOp::IsNot => Ok(!is_identical(l, r)),
        }
    }

    fn membership(&mut self, needle: &Value, haystack: &Value) -> Result<bool, Flow> {
        match haystack {
            Value::Str(s) => match needle {
                Value::Str(sub) => Ok(s.contains(sub.as_str())),
                other => Err(raise(
                    "TypeError",
                    format!(
                        "'in <string>' requires string as left operand, not '{}'",
                        type_name(other)
                    ),
                )),
            },
            Value::List(items) => Ok(items.borrow().iter().any(|v| value_eq(v, needle))),
            Value::Tuple(items) => Ok(items.iter().any(|v| value_eq(v, needle))),
            Value::Dict(d) => {
                let key = Key::from_value(needle).map_err(|m| raise("TypeError", m))?;
                Ok(d.borrow().contains(&key))
            }
            Value::Set(s) => {
                let key = Key::from_value(needle).map_err(|m| raise("TypeError", m))?;
                Ok(s.borrow().contains(&key))
            }
            Value::Range { .. } => Ok(range_items(haystack)
                .iter()
                .any(|v| value_eq(v, needle))),
            other => Err(raise(
                "TypeError",
                format!("argument of type '{}' is not iterable", type_name(other)),
            )),
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Subscripts and slices
    // ═══════════════════════════════════════════════════════════════

    pub fn subscript_get(&mut self, container: Value, index: Value, _line: u32) -> EvalResult {
        // slice() objects route through slice_get
        if let Value::Slice { start, stop, step } = &index {
            return self.slice_get(container, *start, *stop, *step);
        }
        match &container {
            Value::List(items) => {
                let items = items.borrow();
                let idx = normalize_index(&index, items.len(), "list")?;
                Ok(items[idx].clone())
            }
            Value::Tuple(items) => {
                let idx = normalize_index(&index, items.len(), "tuple")?;
                Ok(items[idx].clone())
            }
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let idx = normalize_index(&index, chars.len(), "string")?;
                Ok(new_str(chars[idx].to_string()))
            }
            Value::Dict(d) => {
                let key = Key::from_value(&index).map_err(|m| raise("TypeError", m))?;
                let mut dict = d.borrow_mut();
                if let Some(v) = dict.get(&key) {
                    return Ok(v.clone());
                }
                if let Some(default) = dict.default {
                    let fresh = default.produce();
                    dict.insert(key, fresh.clone());
                    return Ok(fresh);
                }
                Err(raise("KeyError", repr_value(&index)))
            }
            other => Err(raise(
                "TypeError",
                format!("'{}' object is not subscriptable", type_name(other)),
            )),
        }
    }

    fn subscript_set(&mut self, container: Value, index: Value, value: Value) -> Result<(), Flow> {
        match &container {
            Value::List(items) => {
                let mut items = items.borrow_mut();
                let idx = normalize_index(&index, items.len(), "list")?;
                items[idx] = value;
                Ok(())
            }
            Value::Dict(d) => {
                let key = Key::from_value(&index).map_err(|m| raise("TypeError", m))?;
                d.borrow_mut().insert(key, value);
                Ok(())
            }
            other => Err(raise(
                "TypeError",
                format!(
                    "'{}' object does not support item assignment",
                    type_name(other)
                ),
            )),
        }
    }

    fn slice_get(
        &mut self,
        container: Value,
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    ) -> EvalResult {
        match &container {
            Value::List(items) => {
                let items = items.borrow();
                let picked = slice_indices(items.len(), start, stop, step)?
                    .into_iter()
                    .map(|i| items[i].clone())
                    .collect();
                Ok(new_list(picked))
            }
            Value::Tuple(items) => {
                let picked = slice_indices(items.len(), start, stop, step)?
                    .into_iter()
                    .map(|i| items[i].clone())
                    .collect();
                Ok(Value::Tuple(Rc::new(picked)))
            }
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let picked: String = slice_indices(chars.len(), start, stop, step)?
                    .into_iter()
                    .map(|i| chars[i])
                    .collect();
                Ok(new_str(picked))
            }
            other => Err(raise(
                "TypeError",
                format!("'{}' object is not sliceable", type_name(other)),
            )),
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Iteration
    // ═══════════════════════════════════════════════════════════════

    /// Materialize any iterable into a vector of values
    pub fn iterate(&mut self, value: Value) -> Result<Vec<Value>, Flow> {
        match &value {
            Value::List(items) => Ok(items.borrow().clone()),
            Value::Tuple(items) => Ok((**items).clone()),
            Value::Str(s) => Ok(s.chars().map(|c| new_str(c.to_string())).collect()),
            Value::Dict(d) => Ok(d
                .borrow()
                .entries
                .iter()
                .map(|(k, _)| k.to_value())
                .collect()),
            Value::Set(s) => Ok(s.borrow().items.iter().map(Key::to_value).collect()),
            Value::Range { .. } => Ok(range_items(&value)),
            Value::Iterator(state) => {
                let mut state = state.borrow_mut();
                let rest = state.items[state.pos..].to_vec();
                state.pos = state.items.len();
                Ok(rest)
            }
            other => Err(raise(
                "TypeError",
                format!("'{}' object is not iterable", type_name(other)),
            )),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Free helpers
// ═══════════════════════════════════════════════════════════════

fn name_error(name: &str, _line: u32) -> Flow {
    raise("NameError", format!("name '{name}' is not defined"))
}

fn exc_type_matches(ty: &Value, kind: &str) -> bool {
    match ty {
        Value::ExcType(name) => *name == "Exception" || *name == kind,
        Value::Tuple(items) => items.iter().any(|t| exc_type_matches(t, kind)),
        _ => false,
    }
}

fn is_identical(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::List(x), Value::List(y)) => Rc::ptr_eq(x, y),
        (Value::Dict(x), Value::Dict(y)) => Rc::ptr_eq(x, y),
        (Value::Set(x), Value::Set(y)) => Rc::ptr_eq(x, y),
        (Value::Tuple(x), Value::Tuple(y)) => Rc::ptr_eq(x, y),
        // Scalars fall back to equality, matching small-int interning habits
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => Rc::ptr_eq(x, y) || x == y,
        _ => false,
    }
}

/// Numeric view of a value (bools included)
fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        Value::Bool(b) => Some(*b as i64 as f64),
        _ => None,
    }
}

/// Exact int pair when both operands are integral, for int arithmetic
fn int_pair(l: &Value, r: &Value) -> Option<(i64, i64)> {
    let a = match l {
        Value::Int(i) => *i,
        Value::Bool(b) => *b as i64,
        _ => return None,
    };
    let b = match r {
        Value::Int(i) => *i,
        Value::Bool(b) => *b as i64,
        _ => return None,
    };
    Some((a, b))
}

fn numeric_op(op: BinOp, a: f64, b: f64, ints: Option<(i64, i64)>) -> EvalResult {
    use BinOp::*;
    if let Some((x, y)) = ints {
        match op {
            Add => {
                return x
                    .checked_add(y)
                    .map(Value::Int)
                    .ok_or_else(|| raise("OverflowError", "integer addition overflow"))
            }
            Sub => {
                return x
                    .checked_sub(y)
                    .map(Value::Int)
                    .ok_or_else(|| raise("OverflowError", "integer subtraction overflow"))
            }
            Mul => {
                return x
                    .checked_mul(y)
                    .map(Value::Int)
                    .ok_or_else(|| raise("OverflowError", "integer multiplication overflow"))
            }
            FloorDiv => {
                if y == 0 {
                    return Err(raise("ZeroDivisionError", "integer division or modulo by zero"));
                }
                let mut q = x / y;
                if x % y != 0 && (x < 0) != (y < 0) {
                    q -= 1;
                }
                return Ok(Value::Int(q));
            }
            Mod => {
                if y == 0 {
                    return Err(raise("ZeroDivisionError", "integer division or modulo by zero"));
                }
                let mut r = x % y;
                if r != 0 && (r < 0) != (y < 0) {
                    r += y;
                }
                return Ok(Value::Int(r));
            }
            Pow => {
                if y >= 0 {
                    if let Ok(exp) = u32::try_from(y) {
                        if let Some(v) = x.checked_pow(exp) {
                            return Ok(Value::Int(v));
                        }
                        return Err(raise("OverflowError", "integer power overflow"));
                    }
                }
                return Ok(Value::Float((x as f64).powf(y as f64)));
            }
            Div => {} // falls through to float division
        }
    }

    match op {
        Add => Ok(Value::Float(a + b)),
        Sub => Ok(Value::Float(a - b)),
        Mul => Ok(Value::Float(a * b)),
        Div => {
            if b == 0.0 {
                Err(raise("ZeroDivisionError", "division by zero"))
            } else {
                Ok(Value::Float(a / b))
            }
        }
        FloorDiv => {
            if b == 0.0 {
                Err(raise("ZeroDivisionError", "float floor division by zero"))
            } else {
                Ok(Value::Float((a / b).floor()))
            }
        }
        Mod => {
            if b == 0.0 {
                Err(raise("ZeroDivisionError", "float modulo"))
            } else {
                Ok(Value::Float(a - (a / b).floor() * b))
            }
        }
        Pow => Ok(Value::Float(a.powf(b))),
    }
}

/// Normalize a (possibly negative) index into bounds, or raise
fn normalize_index(index: &Value, len: usize, what: &str) -> Result<usize, Flow> {
    let raw = match index {
        Value::Int(i) => *i,
        Value::Bool(b) => *b as i64,
        other => {
            return Err(raise(
                "TypeError",
                format!(
                    "{what} indices must be integers, not '{}'",
                    type_name(other)
                ),
            ))
        }
    };
    let len_i = len as i64;
    let adjusted = if raw < 0 { raw + len_i } else { raw };
    if adjusted < 0 || adjusted >= len_i {
        return Err(raise("IndexError", format!("{what} index out of range")));
    }
    Ok(adjusted as usize)
}

/// Python slice semantics: clamped bounds, optional negative step
fn slice_indices(
    len: usize,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> Result<Vec<usize>, Flow> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(raise("ValueError", "slice step cannot be zero"));
    }
    let len_i = len as i64;
    let clamp = |v: i64, low: i64, high: i64| v.max(low).min(high);
    let adjust = |v: i64| if v < 0 { v + len_i } else { v };

    let mut out = Vec::new();
    if step > 0 {
        let begin = clamp(start.map(adjust).unwrap_or(0), 0, len_i);
        let end = clamp(stop.map(adjust).unwrap_or(len_i), 0, len_i);
        let mut i = begin;
        while i < end {
            out.push(i as usize);
            i += step;
        }
    } else {
        let begin = clamp(start.map(adjust).unwrap_or(len_i - 1), -1, len_i - 1);
        let end = clamp(stop.map(adjust).unwrap_or(-1), -1, len_i - 1);
        let mut i = begin;
        while i > end {
            out.push(i as usize);
            i += step;
        }
    }
    Ok(out)
}
