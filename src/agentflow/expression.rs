//! Sandboxed evaluation of user-authored expressions.
//!
//! Expression agents and condition tooling evaluate small, pure
//! expressions over a read-only slice of session state. The sandbox is
//! built on the `evalexpr` operator grammar rather than a general-purpose
//! scripting engine: there is no I/O, no imports, and no reflection to
//! escape from, and everything beyond the operator grammar is gated by an
//! explicit whitelist.
//!
//! Enforcement happens in two phases:
//!
//! 1. **Compile (hydration time).** The source is scanned for forbidden
//!    tokens, parsed into an AST, and every identifier is checked:
//!    assignments are rejected, function names must be whitelisted, and
//!    variable names must be input keys (or dotted paths under them).
//!    A failure here is a configuration error and aborts hydration.
//! 2. **Evaluate (per execution).** The AST runs against a context holding
//!    only the declared input keys and a fixed set of pure helper
//!    functions. Evaluation failures (missing key, type error, division
//!    by zero) are reported to the caller, which turns them into an error
//!    event with an empty state delta.
//!
//! JSON mapping values are exposed through dotted variable names: an
//! input key `parsed` holding `{"base": "USD"}` is visible both as the
//! JSON-encoded string `parsed` and as the leaf `parsed.base`.

use evalexpr::{ContextWithMutableFunctions, ContextWithMutableVariables};
use serde_json::Value as Json;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;

/// Function identifiers an expression may call. Everything here is pure:
/// no clock, no randomness, no I/O.
const FUNCTION_WHITELIST: &[&str] = &[
    // registered helpers (see `install_helpers`)
    "abs", "all", "any", "bool", "float", "int", "round", "sorted", "sum",
    // evalexpr builtins
    "len", "min", "max", "floor", "ceil", "if", "contains", "contains_any", "typeof",
    "str::from", "str::to_lowercase", "str::to_uppercase", "str::trim",
    "math::abs", "math::ln", "math::log", "math::log2", "math::log10", "math::exp",
    "math::pow", "math::sqrt", "math::cos", "math::sin", "math::tan",
];

/// Tokens that must never appear in an expression, checked textually
/// before parsing so the rejection can name the construct.
const FORBIDDEN_TOKENS: &[&str] = &[
    "import", "__import__", "eval", "exec", "compile", "open", "breakpoint",
    "lambda", "getattr", "setattr", "globals", "locals", "random",
];

/// Errors from sandbox compilation or evaluation.
#[derive(Debug, Clone)]
pub enum SandboxError {
    /// The source did not parse under the expression grammar.
    Parse(String),
    /// The source references a forbidden construct, named in the payload.
    Forbidden(String),
    /// A name is neither a declared input key nor a whitelisted function.
    UnknownName(String),
    /// Evaluation failed (missing key, type error, arithmetic error).
    Eval(String),
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxError::Parse(msg) => write!(f, "expression parse error: {}", msg),
            SandboxError::Forbidden(name) => {
                write!(f, "forbidden construct in expression: '{}'", name)
            }
            SandboxError::UnknownName(name) => {
                write!(f, "unknown name in expression: '{}'", name)
            }
            SandboxError::Eval(msg) => write!(f, "expression evaluation error: {}", msg),
        }
    }
}

impl Error for SandboxError {}

/// A compiled, whitelist-checked expression bound to its input keys.
///
/// Compilation is eager so operator mistakes surface at hydration, not at
/// first invocation. The compiled form is immutable and reusable across
/// executions.
#[derive(Debug)]
pub struct Sandbox {
    source: String,
    node: evalexpr::Node,
    input_keys: Vec<String>,
}

impl Sandbox {
    /// Parse, whitelist-check, and bind an expression.
    pub fn compile(source: &str, input_keys: &[String]) -> Result<Sandbox, SandboxError> {
        if let Some(token) = find_forbidden_token(source) {
            return Err(SandboxError::Forbidden(token));
        }

        let node: evalexpr::Node = evalexpr::build_operator_tree(source)
            .map_err(|e| SandboxError::Parse(e.to_string()))?;

        if let Some(ident) = node.iter_write_variable_identifiers().next() {
            return Err(SandboxError::Forbidden(format!("assignment to '{}'", ident)));
        }

        for ident in node.iter_function_identifiers() {
            if !FUNCTION_WHITELIST.contains(&ident) {
                return Err(SandboxError::UnknownName(ident.to_string()));
            }
        }

        for ident in node.iter_variable_identifiers() {
            let allowed = input_keys.iter().any(|key| {
                ident == key.as_str() || ident.starts_with(&format!("{}.", key))
            });
            if !allowed {
                return Err(SandboxError::UnknownName(ident.to_string()));
            }
        }

        Ok(Sandbox {
            source: source.to_string(),
            node,
            input_keys: input_keys.to_vec(),
        })
    }

    /// The original expression text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a state snapshot. Only the declared input keys are
    /// visible; everything else in the snapshot is ignored.
    pub fn eval(&self, state: &HashMap<String, Json>) -> Result<Json, SandboxError> {
        let mut ctx: evalexpr::HashMapContext = evalexpr::HashMapContext::new();
        install_helpers(&mut ctx)?;

        for key in &self.input_keys {
            if let Some(value) = state.get(key) {
                bind_variable(&mut ctx, key, value)?;
            }
        }

        let result = self
            .node
            .eval_with_context(&ctx)
            .map_err(|e| SandboxError::Eval(e.to_string()))?;
        to_json(&result)
    }
}

/// Scan the raw source for deny-listed words and dunder names. Words are
/// identifier-shaped runs outside double-quoted string literals; string
/// contents are data, and the AST identifier checks cover everything that
/// can actually execute.
fn find_forbidden_token(source: &str) -> Option<String> {
    let mut word = String::new();
    let mut words = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in source.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        if c == '"' {
            if !word.is_empty() {
                words.push(std::mem::take(&mut word));
            }
            in_string = true;
        } else if c.is_ascii_alphanumeric() || c == '_' {
            word.push(c);
        } else if !word.is_empty() {
            words.push(std::mem::take(&mut word));
        }
    }
    if !word.is_empty() {
        words.push(word);
    }
    for w in words {
        if w.starts_with("__") || FORBIDDEN_TOKENS.contains(&w.as_str()) {
            return Some(w);
        }
    }
    None
}

/// Bind one state value into the context. Mappings are exposed both as a
/// JSON-encoded string under the key itself and as dotted leaves.
fn bind_variable(
    ctx: &mut evalexpr::HashMapContext,
    key: &str,
    value: &Json,
) -> Result<(), SandboxError> {
    match value {
        Json::Object(_) => {
            set_var(ctx, key, evalexpr::Value::String(value.to_string()))?;
            flatten_object(ctx, key, value)
        }
        other => set_var(ctx, key, from_json(other)),
    }
}

fn flatten_object(
    ctx: &mut evalexpr::HashMapContext,
    prefix: &str,
    value: &Json,
) -> Result<(), SandboxError> {
    if let Json::Object(map) = value {
        for (k, v) in map {
            let dotted = format!("{}.{}", prefix, k);
            match v {
                Json::Object(_) => {
                    set_var(ctx, &dotted, evalexpr::Value::String(v.to_string()))?;
                    flatten_object(ctx, &dotted, v)?;
                }
                other => set_var(ctx, &dotted, from_json(other))?,
            }
        }
    }
    Ok(())
}

fn set_var(
    ctx: &mut evalexpr::HashMapContext,
    name: &str,
    value: evalexpr::Value,
) -> Result<(), SandboxError> {
    ctx.set_value(name.to_string(), value)
        .map_err(|e| SandboxError::Eval(e.to_string()))
}

/// Convert a JSON value into an evalexpr value. Mappings are handled by
/// the caller; nested mappings inside arrays become JSON strings.
fn from_json(value: &Json) -> evalexpr::Value {
    match value {
        Json::Null => evalexpr::Value::Empty,
        Json::Bool(b) => evalexpr::Value::Boolean(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                evalexpr::Value::Int(i)
            } else {
                evalexpr::Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Json::String(s) => evalexpr::Value::String(s.clone()),
        Json::Array(items) => {
            evalexpr::Value::Tuple(items.iter().map(from_json).collect())
        }
        Json::Object(_) => evalexpr::Value::String(value.to_string()),
    }
}

/// Convert an evalexpr result back to JSON. Non-finite floats have no
/// JSON representation and are reported as evaluation errors.
fn to_json(value: &evalexpr::Value) -> Result<Json, SandboxError> {
    match value {
        evalexpr::Value::Empty => Ok(Json::Null),
        evalexpr::Value::Boolean(b) => Ok(Json::Bool(*b)),
        evalexpr::Value::Int(i) => Ok(Json::from(*i)),
        evalexpr::Value::Float(f) => {
            if f.is_finite() {
                Ok(Json::from(*f))
            } else {
                Err(SandboxError::Eval("non-finite numeric result".to_string()))
            }
        }
        evalexpr::Value::String(s) => Ok(Json::String(s.clone())),
        evalexpr::Value::Tuple(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(to_json(item)?);
            }
            Ok(Json::Array(out))
        }
    }
}

/// Register the pure helper functions backing the whitelist entries that
/// evalexpr does not ship natively.
fn install_helpers(ctx: &mut evalexpr::HashMapContext) -> Result<(), SandboxError> {
    use evalexpr::{EvalexprError, Function, Value};

    let set = |ctx: &mut evalexpr::HashMapContext, name: &str, f: Function<evalexpr::DefaultNumericTypes>| {
        ctx.set_function(name.to_string(), f)
            .map_err(|e| SandboxError::Eval(e.to_string()))
    };

    set(
        ctx,
        "abs",
        Function::new(|arg| {
            let n: f64 = arg.as_number()?;
            Ok(Value::Float(n.abs()))
        }),
    )?;

    set(
        ctx,
        "round",
        Function::new(|arg| {
            let n: f64 = arg.as_number()?;
            Ok(Value::Int(n.round() as i64))
        }),
    )?;

    set(
        ctx,
        "int",
        Function::new(|arg: &Value| match arg {
            Value::Int(i) => Ok(Value::Int(*i)),
            Value::Float(f) => Ok(Value::Int(f.trunc() as i64)),
            Value::Boolean(b) => Ok(Value::Int(if *b { 1 } else { 0 })),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| EvalexprError::CustomMessage(format!("cannot convert '{}' to int", s))),
            other => Err(EvalexprError::CustomMessage(format!(
                "cannot convert {:?} to int",
                other
            ))),
        }),
    )?;

    set(
        ctx,
        "float",
        Function::new(|arg| match arg {
            Value::Int(i) => Ok(Value::Float(*i as f64)),
            Value::Float(f) => Ok(Value::Float(*f)),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| {
                    EvalexprError::CustomMessage(format!("cannot convert '{}' to float", s))
                }),
            other => Err(EvalexprError::CustomMessage(format!(
                "cannot convert {:?} to float",
                other
            ))),
        }),
    )?;

    set(
        ctx,
        "bool",
        Function::new(|arg| {
            let truthy = match arg {
                Value::Boolean(b) => *b,
                Value::Int(i) => *i != 0,
                Value::Float(f) => *f != 0.0,
                Value::String(s) => !s.is_empty(),
                Value::Tuple(items) => !items.is_empty(),
                Value::Empty => false,
            };
            Ok(Value::Boolean(truthy))
        }),
    )?;

    set(
        ctx,
        "sum",
        Function::new(|arg| match arg {
            Value::Tuple(items) => {
                let mut total = 0.0;
                for item in items {
                    total += item.as_number()?;
                }
                Ok(Value::Float(total))
            }
            other => Ok(Value::Float(other.as_number()?)),
        }),
    )?;

    set(
        ctx,
        "all",
        Function::new(|arg| match arg {
            Value::Tuple(items) => {
                for item in items {
                    if !item.as_boolean()? {
                        return Ok(Value::Boolean(false));
                    }
                }
                Ok(Value::Boolean(true))
            }
            other => Ok(Value::Boolean(other.as_boolean()?)),
        }),
    )?;

    set(
        ctx,
        "any",
        Function::new(|arg| match arg {
            Value::Tuple(items) => {
                for item in items {
                    if item.as_boolean()? {
                        return Ok(Value::Boolean(true));
                    }
                }
                Ok(Value::Boolean(false))
            }
            other => Ok(Value::Boolean(other.as_boolean()?)),
        }),
    )?;

    set(
        ctx,
        "sorted",
        Function::new(|arg| match arg {
            Value::Tuple(items) => {
                let mut nums: Vec<f64> = Vec::with_capacity(items.len());
                let mut strings: Vec<String> = Vec::new();
                let all_numeric = items.iter().all(|i| i.as_number().is_ok());
                if all_numeric {
                    for item in items {
                        nums.push(item.as_number()?);
                    }
                    nums.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                    Ok(Value::Tuple(nums.into_iter().map(Value::Float).collect()))
                } else {
                    for item in items {
                        strings.push(item.as_string()?);
                    }
                    strings.sort();
                    Ok(Value::Tuple(strings.into_iter().map(Value::String).collect()))
                }
            }
            other => Err(EvalexprError::CustomMessage(format!(
                "sorted expects a tuple, got {:?}",
                other
            ))),
        }),
    )?;

    Ok(())
}
