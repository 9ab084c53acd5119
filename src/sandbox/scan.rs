//! AST safety scan
//!
//! Walks every node of the parsed code and rejects constructs that could
//! reach outside the sandbox. Each finding names the offending construct
//! and its source line; the critic forwards these verbatim to the builder.

use super::ast::*;
use super::parser::parse_module;

/// Call targets that are never allowed, whatever the arguments
const FORBIDDEN_CALLS: &[&str] = &[
    "exec", "eval", "open", "compile", "globals", "locals", "vars", "dir", "delattr", "setattr",
];

/// Module names node code must never reference, even as bare names
const BLOCKED_MODULES: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "importlib",
    "socket",
    "shutil",
    "pathlib",
    "io",
    "pickle",
    "shelve",
    "ctypes",
    "signal",
    "multiprocessing",
    "threading",
    "builtins",
];

fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

/// Scan source code for sandbox violations.
///
/// Unparseable code yields a single finding; the structural validator
/// reports the syntax error separately.
pub fn scan_code(code: &str) -> Vec<String> {
    match parse_module(code) {
        Ok(module) => scan_module(&module),
        Err(_) => vec!["Code has syntax errors (cannot analyze safety)".to_string()],
    }
}

pub fn scan_module(module: &Module) -> Vec<String> {
    let mut scanner = Scanner { issues: Vec::new() };
    scanner.stmts(&module.body);
    scanner.issues
}

struct Scanner {
    issues: Vec<String>,
}

impl Scanner {
    fn push(&mut self, issue: String) {
        self.issues.push(issue);
    }

    fn stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Import { names, line } => {
                for name in names {
                    let top = name.split('.').next().unwrap_or(name);
                    if BLOCKED_MODULES.contains(&top) {
                        self.push(format!("Forbidden import (line {line}): 'import {name}'"));
                    } else {
                        self.push(format!(
                            "Import statement not allowed in sandbox (line {line}): 'import {name}'"
                        ));
                    }
                }
            }
            Stmt::ImportFrom { module, line, .. } => {
                let top = module.split('.').next().unwrap_or(module);
                if BLOCKED_MODULES.contains(&top) {
                    self.push(format!("Forbidden import (line {line}): 'from {module}'"));
                } else {
                    self.push(format!(
                        "Import statement not allowed in sandbox (line {line}): 'from {module} import ...'"
                    ));
                }
            }
            Stmt::FuncDef { body, .. } => self.stmts(body),
            Stmt::Return { value, .. } => {
                if let Some(e) = value {
                    self.expr(e);
                }
            }
            Stmt::Assign { targets, value, .. } => {
                for target in targets {
                    self.target(target);
                }
                self.expr(value);
            }
            Stmt::AugAssign { target, value, .. } => {
                self.target(target);
                self.expr(value);
            }
            Stmt::If {
                branches, orelse, ..
            } => {
                for (cond, body) in branches {
                    self.expr(cond);
                    self.stmts(body);
                }
                self.stmts(orelse);
            }
            Stmt::For {
                target, iter, body, ..
            } => {
                self.target(target);
                self.expr(iter);
                self.stmts(body);
            }
            Stmt::While { cond, body, .. } => {
                self.expr(cond);
                self.stmts(body);
            }
            Stmt::Try {
                body,
                handlers,
                finally,
                ..
            } => {
                self.stmts(body);
                for handler in handlers {
                    if let Some(ty) = &handler.exc_type {
                        self.expr(ty);
                    }
                    self.stmts(&handler.body);
                }
                self.stmts(finally);
            }
            Stmt::Raise { exc, .. } => {
                if let Some(e) = exc {
                    self.expr(e);
                }
            }
            Stmt::Expr { value, .. } => self.expr(value),
            Stmt::Pass | Stmt::Break { .. } | Stmt::Continue { .. } => {}
        }
    }

    fn target(&mut self, target: &Target) {
        match target {
            Target::Name(name, line) => {
                if is_dunder(name) {
                    self.push(format!(
                        "Assignment to dunder name not allowed (line {line}): '{name}'"
                    ));
                }
            }
            Target::Tuple(targets) => {
                for t in targets {
                    self.target(t);
                }
            }
            Target::Subscript { obj, index, .. } => {
                self.expr(obj);
                self.expr(index);
            }
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Name(name, line) => {
                if name.starts_with("__import__") {
                    self.push(format!(
                        "Forbidden function reference (line {line}): '{name}'"
                    ));
                } else if is_dunder(name) {
                    self.push(format!(
                        "Suspicious dunder name access (line {line}): '{name}'"
                    ));
                } else if BLOCKED_MODULES.contains(&name.as_str()) {
                    self.push(format!(
                        "Forbidden module reference (line {line}): '{name}'"
                    ));
                }
            }
            Expr::Attribute { obj, attr, line } => {
                if is_dunder(attr) {
                    self.push(format!(
                        "Dunder attribute access not allowed (line {line}): '.{attr}' (potential sandbox escape vector)"
                    ));
                }
                self.expr(obj);
            }
            Expr::Call {
                func, args, kwargs, line,
            } => {
                match &**func {
                    Expr::Name(name, _) => {
                        if FORBIDDEN_CALLS.contains(&name.as_str()) {
                            self.push(format!(
                                "Forbidden function call (line {line}): '{name}()'"
                            ));
                        } else if name.starts_with("__import__") {
                            self.push(format!(
                                "Forbidden function call (line {line}): '{name}()'"
                            ));
                        }
                    }
                    Expr::Attribute { attr, .. } => {
                        if FORBIDDEN_CALLS.contains(&attr.as_str()) {
                            self.push(format!(
                                "Forbidden method call (line {line}): '.{attr}()'"
                            ));
                        }
                    }
                    _ => {}
                }
                self.expr(func);
                for a in args {
                    self.expr(a);
                }
                for (_, v) in kwargs {
                    self.expr(v);
                }
            }
            Expr::FString(parts) => {
                for part in parts {
                    if let FPart::Expr { expr, .. } = part {
                        self.expr(expr);
                    }
                }
            }
            Expr::List(items) | Expr::Tuple(items) | Expr::Set(items) => {
                for e in items {
                    self.expr(e);
                }
            }
            Expr::Dict(pairs) => {
                for (k, v) in pairs {
                    self.expr(k);
                    self.expr(v);
                }
            }
            Expr::Lambda { params, body } => {
                for p in params {
                    if let Some(d) = &p.default {
                        self.expr(d);
                    }
                }
                self.expr(body);
            }
            Expr::Unary { operand, .. } => self.expr(operand),
            Expr::Binary { left, right, .. } => {
                self.expr(left);
                self.expr(right);
            }
            Expr::BoolOp { values, .. } => {
                for e in values {
                    self.expr(e);
                }
            }
            Expr::Compare { left, ops } => {
                self.expr(left);
                for (_, right) in ops {
                    self.expr(right);
                }
            }
            Expr::Subscript { obj, index, .. } => {
                self.expr(obj);
                match &**index {
                    Index::Single(e) => self.expr(e),
                    Index::Slice { lower, upper, step } => {
                        for e in [lower, upper, step].into_iter().flatten() {
                            self.expr(e);
                        }
                    }
                }
            }
            Expr::IfExp { cond, then, orelse } => {
                self.expr(cond);
                self.expr(then);
                self.expr(orelse);
            }
            Expr::ListComp { elt, generators } | Expr::SetComp { elt, generators } => {
                self.expr(elt);
                self.generators(generators);
            }
            Expr::DictComp {
                key,
                value,
                generators,
            } => {
                self.expr(key);
                self.expr(value);
                self.generators(generators);
            }
            Expr::NoneLit
            | Expr::Bool(_)
            | Expr::Int(_)
            | Expr::Float(_)
            | Expr::Str(_) => {}
        }
    }

    fn generators(&mut self, generators: &[Comprehension]) {
        for gen in generators {
            self.target(&gen.target);
            self.expr(&gen.iter);
            for cond in &gen.ifs {
                self.expr(cond);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ═══════════════════════════════════════════════════════════════
    // Imports
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn rejects_any_import_with_line() {
        let issues = scan_code("def f(x):\n    import os\n    return 1\n");
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("import"));
        assert!(issues[0].contains("line 2"));
        assert!(issues[0].contains("os"));
    }

    #[test]
    fn rejects_from_import() {
        let issues = scan_code("from json import dumps\n");
        assert_eq!(issues.len(), 1);
        assert!(issues[0].to_lowercase().contains("import"));
    }

    #[test]
    fn blocked_module_import_is_named_forbidden() {
        let issues = scan_code("import subprocess\n");
        assert!(issues[0].contains("Forbidden import"));
    }

    // ═══════════════════════════════════════════════════════════════
    // Forbidden calls and names
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn rejects_forbidden_calls() {
        for code in [
            "eval('1+1')\n",
            "exec('pass')\n",
            "open('/etc/passwd')\n",
            "setattr(x, 'a', 1)\n",
            "obj.delattr('a')\n",
        ] {
            let issues = scan_code(code);
            assert!(!issues.is_empty(), "expected violation for {code}");
            assert!(issues[0].contains("Forbidden"));
        }
    }

    #[test]
    fn getattr_is_allowed() {
        assert!(scan_code("getattr(math, 'sqrt')\n").is_empty());
    }

    #[test]
    fn rejects_import_dunder() {
        let issues = scan_code("__import__('os')\n");
        assert!(!issues.is_empty());
        assert!(issues[0].contains("__import__"));
    }

    #[test]
    fn rejects_dunder_attribute_chain() {
        // The classic escape: ().__class__.__bases__[0].__subclasses__()
        let issues = scan_code("x = ().__class__.__bases__[0].__subclasses__()\n");
        assert!(issues.iter().any(|i| i.contains("__class__")));
        assert!(issues.iter().any(|i| i.contains("escape")));
    }

    #[test]
    fn rejects_dunder_assignment() {
        let issues = scan_code("__builtins__ = {}\n");
        assert!(!issues.is_empty());
    }

    #[test]
    fn rejects_blocked_module_as_bare_name() {
        let issues = scan_code("x = os\n");
        assert!(issues[0].contains("os"));
    }

    // ═══════════════════════════════════════════════════════════════
    // Clean code passes
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn accepts_ordinary_analytics_code() {
        let code = "def fraud_rate(stats):\n    total = sum(v['count'] for v in stats.values())\n    fraud = sum(v['fraud_count'] for v in stats.values())\n    return fraud / total if total else 0.0\n";
        assert!(scan_code(code).is_empty());
    }

    #[test]
    fn accepts_safe_module_usage() {
        assert!(scan_code("def f(xs):\n    return math.sqrt(statistics.mean(xs))\n").is_empty());
    }

    #[test]
    fn unparseable_code_reports_single_issue() {
        let issues = scan_code("def f(:\n");
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("syntax"));
    }

    #[test]
    fn scan_reaches_nested_positions() {
        // violation inside a comprehension filter
        let issues = scan_code("xs = [v for v in data if eval(v)]\n");
        assert!(!issues.is_empty());
        // violation inside an f-string expression
        let issues = scan_code("s = f\"{open('x')}\"\n");
        assert!(!issues.is_empty());
    }
}
