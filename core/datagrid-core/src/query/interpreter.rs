//! In-process evaluator for the expression AST
//!
//! Values are JSON documents. Operators follow SQLite's semantics rather than
//! the host language's (`//` truncates toward zero, division by zero yields
//! NULL, `and`/`or` are three-valued) so that evaluating an expression here
//! and running its compiled SQL agree. Comprehensions compiled to
//! `py_comprehension` are evaluated by this module inside SQLite, and every
//! registered SQL function dispatches to [`call_function`].

use super::ast::{BinaryOp, CompareOp, Expr, Literal, UnaryOp};
use super::functions::{self, Callee};
use crate::error::{DgError, DgResult};
use crate::types::value::format_float;
use chrono::{DateTime, Datelike, NaiveDate, Timelike};
use rand::Rng;
use rand::seq::SliceRandom;
use serde_json::{Number, Value as Json, json};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Bindings visible to an expression.
#[derive(Debug, Default, Clone)]
pub struct Env {
    columns: HashMap<String, Json>,
    vars: Vec<(String, Json)>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_column(mut self, name: impl Into<String>, value: Json) -> Self {
        self.columns.insert(name.into(), value);
        self
    }

    pub fn with_var(mut self, name: impl Into<String>, value: Json) -> Self {
        self.vars.push((name.into(), value));
        self
    }

    fn lookup(&self, name: &str) -> Option<&Json> {
        self.vars
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
}

pub fn evaluate(expr: &Expr, env: &mut Env) -> DgResult<Json> {
    match expr {
        Expr::Literal(lit) => Ok(literal(lit)),
        Expr::Column(name) => env
            .columns
            .get(name)
            .cloned()
            .ok_or_else(|| {
                DgError::compile(format!("unknown column '{}'", name), expr.to_string())
            }),
        Expr::Name(name) => match env.lookup(name) {
            Some(value) => Ok(value.clone()),
            None => match functions::constant(None, name) {
                Some(value) => Ok(value),
                None => Err(DgError::compile(
                    format!("unknown name '{}'", name),
                    expr.to_string(),
                )),
            },
        },
        Expr::Unary { op, expr } => {
            let value = evaluate(expr, env)?;
            Ok(unary(*op, &value))
        }
        Expr::Binary { op, left, right } => {
            let l = evaluate(left, env)?;
            let r = evaluate(right, env)?;
            Ok(binary(*op, &l, &r))
        }
        Expr::Compare {
            left,
            ops,
            comparators,
        } => {
            let mut result = Some(true);
            let mut current = evaluate(left, env)?;
            for (op, right) in ops.iter().zip(comparators) {
                let value = evaluate(right, env)?;
                let next = match normalize_none(*op, right) {
                    op @ (CompareOp::In | CompareOp::NotIn) => {
                        membership(op, &current, right, &value)
                    }
                    op => compare(op, &current, &value),
                };
                result = and3(result, next);
                current = value;
            }
            Ok(tri_to_json(result))
        }
        Expr::IfElse { test, body, orelse } => {
            if sql_truth(&evaluate(test, env)?) == Some(true) {
                evaluate(body, env)
            } else {
                evaluate(orelse, env)
            }
        }
        Expr::List(items) | Expr::Tuple(items) | Expr::Set(items) => {
            let values = items
                .iter()
                .map(|item| evaluate(item, env))
                .collect::<DgResult<Vec<_>>>()?;
            Ok(Json::Array(values))
        }
        Expr::Subscript { value, index } => {
            let value = evaluate(value, env)?;
            let index = evaluate(index, env)?;
            Ok(get_item(&value, &index))
        }
        Expr::Attribute { value, attr } => {
            if let Expr::Name(namespace) = value.as_ref() {
                if env.lookup(namespace).is_none() {
                    return functions::constant(Some(namespace.as_str()), attr).ok_or_else(|| {
                        DgError::compile(
                            format!("unknown attribute '{}.{}'", namespace, attr),
                            expr.to_string(),
                        )
                    });
                }
            }
            let value = evaluate(value, env)?;
            Ok(attribute(&value, attr))
        }
        Expr::Call { func, args } => evaluate_call(expr, func, args, env),
        Expr::ListComp {
            element,
            target,
            iter,
            conditions,
        } => {
            let items = match evaluate(iter, env)? {
                Json::Array(items) => items,
                Json::String(s) => s.chars().map(|c| Json::String(c.to_string())).collect(),
                _ => return Ok(Json::Null),
            };
            let mut out = Vec::new();
            'items: for item in items {
                env.vars.push((target.clone(), item));
                for cond in conditions {
                    let keep = evaluate(cond, env).map(|v| truthy(&v));
                    if !matches!(keep, Ok(true)) {
                        env.vars.pop();
                        keep?;
                        continue 'items;
                    }
                }
                let value = evaluate(element, env);
                env.vars.pop();
                out.push(value?);
            }
            Ok(Json::Array(out))
        }
    }
}

fn evaluate_call(expr: &Expr, func: &Expr, args: &[Expr], env: &mut Env) -> DgResult<Json> {
    let callee = functions::resolve(func, args.len(), &|name| env.lookup(name).is_some())
        .map_err(|message| DgError::compile(message, expr.to_string()))?;
    match callee {
        Callee::Aggregate(name) => Err(DgError::compile(
            format!("aggregate {} cannot be evaluated per row", name),
            expr.to_string(),
        )),
        Callee::Function(name) => {
            let values = args
                .iter()
                .map(|arg| evaluate(arg, env))
                .collect::<DgResult<Vec<_>>>()?;
            call_function(name, &values)
        }
        Callee::Builtin(name) => {
            let values = args
                .iter()
                .map(|arg| evaluate(arg, env))
                .collect::<DgResult<Vec<_>>>()?;
            builtin(name, &values)
        }
        Callee::Method { receiver, method } => {
            let mut values = vec![evaluate(receiver, env)?];
            for arg in args {
                values.push(evaluate(arg, env)?);
            }
            call_function(functions::method_function(method), &values)
        }
    }
}

/// Builtins, with the same semantics as the SQL the compiler emits.
fn builtin(name: &str, args: &[Json]) -> DgResult<Json> {
    match (name, args) {
        ("int", [x]) => Ok(cast_integer(x)),
        ("float", [x]) => Ok(cast_real(x)),
        ("str", [x]) => Ok(sql_text(x).map_or(Json::Null, Json::String)),
        _ => match functions::builtin_function(name, args.len()) {
            Some(function) => call_function(function, args),
            None => Err(DgError::InvalidArguments(format!(
                "unknown builtin '{}'",
                name
            ))),
        },
    }
}

// ════════════════════════════════════════════
// Value semantics
// ════════════════════════════════════════════

pub fn literal(lit: &Literal) -> Json {
    match lit {
        Literal::Int(i) => json!(i),
        Literal::Float(x) => float(*x),
        Literal::Str(s) => Json::String(s.clone()),
        Literal::Bool(b) => json!(*b as i64),
        Literal::None => Json::Null,
    }
}

fn float(x: f64) -> Json {
    Number::from_f64(x).map_or(Json::Null, Json::Number)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(x) => x,
        }
    }

    fn to_json(self) -> Json {
        match self {
            Num::Int(i) => json!(i),
            Num::Float(x) => float(x),
        }
    }
}

/// Numeric view of a value the way SQLite coerces operands.
fn numeric(value: &Json) -> Option<Num> {
    match value {
        Json::Null => None,
        Json::Bool(b) => Some(Num::Int(*b as i64)),
        Json::Number(n) => Some(match n.as_i64() {
            Some(i) => Num::Int(i),
            None => Num::Float(n.as_f64().unwrap_or(0.0)),
        }),
        Json::String(s) => Some(numeric_prefix(s)),
        _ => Some(Num::Int(0)),
    }
}

fn numeric_prefix(text: &str) -> Num {
    let text = text.trim_start();
    let bytes = text.as_bytes();
    let mut end = 0;
    if end < bytes.len() && (bytes[end] == b'-' || bytes[end] == b'+') {
        end += 1;
    }
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let int_end = end;
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    if end > int_end {
        return text[..end].parse().map(Num::Float).unwrap_or(Num::Int(0));
    }
    text[..int_end].parse().map(Num::Int).unwrap_or(Num::Int(0))
}

/// Text view of a value as SQLite would render it.
pub fn sql_text(value: &Json) -> Option<String> {
    match value {
        Json::Null => None,
        Json::Bool(b) => Some((*b as i64).to_string()),
        Json::Number(n) => Some(match n.as_i64() {
            Some(i) => i.to_string(),
            None => format_float(n.as_f64().unwrap_or(0.0)),
        }),
        Json::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// SQL truth value: NULL is unknown, numbers are true when non-zero.
pub fn sql_truth(value: &Json) -> Option<bool> {
    numeric(value).map(|n| n.as_f64() != 0.0)
}

/// Host-language truthiness (empty collections are false).
pub fn truthy(value: &Json) -> bool {
    match value {
        Json::Null => false,
        Json::Bool(b) => *b,
        Json::Number(n) => n.as_f64().is_some_and(|x| x != 0.0),
        Json::String(s) => !s.is_empty(),
        Json::Array(items) => !items.is_empty(),
        Json::Object(entries) => !entries.is_empty(),
    }
}

fn tri_to_json(value: Option<bool>) -> Json {
    value.map_or(Json::Null, |b| json!(b as i64))
}

fn and3(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(false), _) | (_, Some(false)) => Some(false),
        (Some(true), Some(true)) => Some(true),
        _ => None,
    }
}

fn or3(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(true), _) | (_, Some(true)) => Some(true),
        (Some(false), Some(false)) => Some(false),
        _ => None,
    }
}

fn unary(op: UnaryOp, value: &Json) -> Json {
    match op {
        UnaryOp::Not => tri_to_json(sql_truth(value).map(|b| !b)),
        UnaryOp::Pos => value.clone(),
        UnaryOp::Neg => match numeric(value) {
            None => Json::Null,
            Some(Num::Int(i)) => i
                .checked_neg()
                .map_or_else(|| float(-(i as f64)), |n| json!(n)),
            Some(Num::Float(x)) => float(-x),
        },
    }
}

fn is_text(value: &Json) -> bool {
    matches!(value, Json::String(_))
}

pub(crate) fn binary(op: BinaryOp, left: &Json, right: &Json) -> Json {
    match op {
        BinaryOp::And => return tri_to_json(and3(sql_truth(left), sql_truth(right))),
        BinaryOp::Or => return tri_to_json(or3(sql_truth(left), sql_truth(right))),
        BinaryOp::Add if is_text(left) || is_text(right) => {
            return match (sql_text(left), sql_text(right)) {
                (Some(l), Some(r)) => Json::String(l + &r),
                _ => Json::Null,
            };
        }
        _ => {}
    }

    let (Some(l), Some(r)) = (numeric(left), numeric(right)) else {
        return Json::Null;
    };
    let result = match op {
        BinaryOp::Add => int_or_float(l, r, i64::checked_add, |a, b| a + b),
        BinaryOp::Sub => int_or_float(l, r, i64::checked_sub, |a, b| a - b),
        BinaryOp::Mul => int_or_float(l, r, i64::checked_mul, |a, b| a * b),
        BinaryOp::Div => {
            if r.as_f64() == 0.0 {
                return Json::Null;
            }
            Some(Num::Float(l.as_f64() / r.as_f64()))
        }
        BinaryOp::FloorDiv => match (l, r) {
            (_, Num::Int(0)) => None,
            (Num::Int(a), Num::Int(b)) => a.checked_div(b).map(Num::Int),
            _ if r.as_f64() == 0.0 => None,
            _ => {
                let q = (l.as_f64() / r.as_f64()).trunc();
                (q.abs() < i64::MAX as f64).then_some(Num::Int(q as i64))
            }
        },
        BinaryOp::Mod => {
            let (a, b) = (as_int(l), as_int(r));
            if b == 0 {
                return Json::Null;
            }
            let rem = a.checked_rem(b).unwrap_or(0);
            match (l, r) {
                (Num::Int(_), Num::Int(_)) => Some(Num::Int(rem)),
                _ => Some(Num::Float(rem as f64)),
            }
        }
        BinaryOp::Pow => Some(Num::Float(l.as_f64().powf(r.as_f64()))),
        BinaryOp::And | BinaryOp::Or => None,
    };
    result.map_or(Json::Null, Num::to_json)
}

fn as_int(n: Num) -> i64 {
    match n {
        Num::Int(i) => i,
        Num::Float(x) => x as i64,
    }
}

fn int_or_float(
    l: Num,
    r: Num,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Option<Num> {
    match (l, r) {
        (Num::Int(a), Num::Int(b)) => Some(
            int_op(a, b)
                .map(Num::Int)
                .unwrap_or_else(|| Num::Float(float_op(a as f64, b as f64))),
        ),
        _ => Some(Num::Float(float_op(l.as_f64(), r.as_f64()))),
    }
}

/// Ordering across storage classes: numbers sort before text.
pub fn sql_compare(left: &Json, right: &Json) -> Option<Ordering> {
    let class = |v: &Json| match v {
        Json::Null => 0,
        Json::Bool(_) | Json::Number(_) => 1,
        _ => 2,
    };
    match (class(left), class(right)) {
        (0, _) | (_, 0) => None,
        (1, 1) => match (numeric(left)?, numeric(right)?) {
            (Num::Int(a), Num::Int(b)) => Some(a.cmp(&b)),
            (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
        },
        (2, 2) => Some(sql_text(left)?.cmp(&sql_text(right)?)),
        (a, b) => Some(a.cmp(&b)),
    }
}

fn values_equal(left: &Json, right: &Json) -> bool {
    sql_compare(left, right) == Some(Ordering::Equal)
}

fn compare(op: CompareOp, left: &Json, right: &Json) -> Option<bool> {
    match op {
        CompareOp::Is => {
            return Some(left.is_null() && right.is_null() || values_equal(left, right));
        }
        CompareOp::IsNot => {
            return Some(!(left.is_null() && right.is_null() || values_equal(left, right)));
        }
        _ => {}
    }
    let ordering = sql_compare(left, right)?;
    Some(match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::NotEq => ordering != Ordering::Equal,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::LtEq => ordering != Ordering::Greater,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::GtEq => ordering != Ordering::Less,
        _ => return None,
    })
}

/// `x == None` compiles to `x IS NULL`.
pub(crate) fn normalize_none(op: CompareOp, right: &Expr) -> CompareOp {
    match (op, right) {
        (CompareOp::Eq, Expr::Literal(Literal::None)) => CompareOp::Is,
        (CompareOp::NotEq, Expr::Literal(Literal::None)) => CompareOp::IsNot,
        (op, _) => op,
    }
}

/// `in` / `not in` with the same split as the compiler: literal lists use
/// SQL `IN`, anything else `py_in`.
fn membership(op: CompareOp, needle: &Json, haystack: &Expr, container: &Json) -> Option<bool> {
    let found = match haystack {
        Expr::List(items) | Expr::Tuple(items) | Expr::Set(items)
            if items.iter().all(Expr::is_literal) =>
        {
            if needle.is_null() {
                None
            } else {
                Some(items.iter().any(|item| {
                    let Expr::Literal(lit) = item else {
                        return false;
                    };
                    values_equal(needle, &literal(lit))
                }))
            }
        }
        _ => call_function("py_in", &[needle.clone(), container.clone()])
            .ok()
            .and_then(|found| sql_truth(&found)),
    };
    match op {
        CompareOp::NotIn => found.map(|b| !b),
        _ => found,
    }
}

fn get_item(value: &Json, index: &Json) -> Json {
    match (value, index) {
        (Json::Array(items), Json::Number(n)) => n
            .as_i64()
            .and_then(|i| {
                let i = if i < 0 { items.len() as i64 + i } else { i };
                usize::try_from(i).ok()
            })
            .and_then(|i| items.get(i))
            .cloned()
            .unwrap_or(Json::Null),
        (Json::Object(entries), Json::String(key)) => {
            entries.get(key).cloned().unwrap_or(Json::Null)
        }
        (Json::String(s), Json::Number(n)) => {
            let chars: Vec<char> = s.chars().collect();
            n.as_i64()
                .and_then(|i| {
                    let i = if i < 0 { chars.len() as i64 + i } else { i };
                    usize::try_from(i).ok()
                })
                .and_then(|i| chars.get(i))
                .map_or(Json::Null, |c| Json::String(c.to_string()))
        }
        _ => Json::Null,
    }
}

fn attribute(value: &Json, attr: &str) -> Json {
    match value {
        Json::Object(entries) => entries.get(attr).cloned().unwrap_or(Json::Null),
        Json::Number(n) if functions::DATETIME_ATTRIBUTES.contains(&attr) => n
            .as_f64()
            .and_then(|ts| datetime_part(ts, attr))
            .map_or(Json::Null, |v| json!(v)),
        _ => Json::Null,
    }
}

fn datetime_part(ts: f64, attr: &str) -> Option<i64> {
    let dt = DateTime::from_timestamp(ts.floor() as i64, 0)?.naive_utc();
    Some(match attr {
        "year" => dt.year() as i64,
        "month" => dt.month() as i64,
        "day" => dt.day() as i64,
        "hour" => dt.hour() as i64,
        "minute" => dt.minute() as i64,
        "second" => dt.second() as i64,
        _ => return None,
    })
}

pub(crate) fn cast_integer(value: &Json) -> Json {
    match numeric(value) {
        None => Json::Null,
        Some(Num::Int(i)) => json!(i),
        Some(Num::Float(x)) => json!(x.trunc() as i64),
    }
}

pub(crate) fn cast_real(value: &Json) -> Json {
    numeric(value).map_or(Json::Null, |n| float(n.as_f64()))
}

// ════════════════════════════════════════════
// Function library
// ════════════════════════════════════════════

fn arg(args: &[Json], i: usize) -> &Json {
    args.get(i).unwrap_or(&Json::Null)
}

fn num_arg(args: &[Json], i: usize) -> Option<f64> {
    numeric(arg(args, i)).map(Num::as_f64)
}

fn text_arg(args: &[Json], i: usize) -> Option<String> {
    sql_text(arg(args, i))
}

fn numbers(value: &Json) -> Option<Vec<f64>> {
    match value {
        Json::Array(items) => items.iter().map(|v| numeric(v).map(Num::as_f64)).collect(),
        _ => None,
    }
}

fn math1(args: &[Json], f: fn(f64) -> f64) -> Json {
    num_arg(args, 0).map(f).filter(|x| !x.is_nan()).map_or(Json::Null, float)
}

fn round_half_even(x: f64) -> f64 {
    let r = x.round();
    if (x - x.trunc()).abs() == 0.5 {
        2.0 * (x / 2.0).round()
    } else {
        r
    }
}

fn epoch(year: i64, month: i64, day: i64, h: i64, m: i64, s: i64) -> Json {
    NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
        .and_then(|d| d.and_hms_opt(h as u32, m as u32, s as u32))
        .map_or(Json::Null, |dt| json!(dt.and_utc().timestamp() as f64))
}

fn variance(values: &[f64], sample: bool) -> Option<f64> {
    let n = values.len();
    if n == 0 || (sample && n < 2) {
        return None;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    Some(ss / if sample { (n - 1) as f64 } else { n as f64 })
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}

fn extreme(args: &[Json], pick: Ordering) -> Json {
    let Json::Array(items) = arg(args, 0) else {
        return Json::Null;
    };
    let mut best: Option<&Json> = None;
    for item in items {
        best = match best {
            Some(current) if sql_compare(item, current) != Some(pick) => Some(current),
            _ => Some(item),
        };
    }
    best.cloned().unwrap_or(Json::Null)
}

fn strip_chars(text: &str, chars: Option<String>, left: bool, right: bool) -> String {
    let set: Vec<char> = chars.map_or_else(|| vec![' '], |c| c.chars().collect());
    let mut s = text;
    if left {
        s = s.trim_start_matches(|c| set.contains(&c));
    }
    if right {
        s = s.trim_end_matches(|c| set.contains(&c));
    }
    s.to_string()
}

/// Evaluates a function by the name the compiler emits in SQL.
pub fn call_function(name: &str, args: &[Json]) -> DgResult<Json> {
    let result = match name {
        // math
        "math_sqrt" => math1(args, f64::sqrt),
        "math_exp" => math1(args, f64::exp),
        "math_log" => match (num_arg(args, 0), num_arg(args, 1)) {
            (Some(x), None) if args.len() < 2 => finite(x.ln()),
            (Some(x), Some(base)) => finite(x.ln() / base.ln()),
            _ => Json::Null,
        },
        "math_log10" => math1(args, f64::log10),
        "math_log2" => math1(args, f64::log2),
        "math_sin" => math1(args, f64::sin),
        "math_cos" => math1(args, f64::cos),
        "math_tan" => math1(args, f64::tan),
        "math_asin" => math1(args, f64::asin),
        "math_acos" => math1(args, f64::acos),
        "math_atan" => math1(args, f64::atan),
        "math_fabs" => math1(args, f64::abs),
        "math_degrees" => math1(args, f64::to_degrees),
        "math_radians" => math1(args, f64::to_radians),
        "math_floor" => num_arg(args, 0).map_or(Json::Null, |x| json!(x.floor() as i64)),
        "math_ceil" => num_arg(args, 0).map_or(Json::Null, |x| json!(x.ceil() as i64)),
        "math_trunc" => num_arg(args, 0).map_or(Json::Null, |x| json!(x.trunc() as i64)),
        "math_isnan" => json!(num_arg(args, 0).is_some_and(f64::is_nan) as i64),
        "math_isinf" => json!(num_arg(args, 0).is_some_and(f64::is_infinite) as i64),
        "math_pow" => match (num_arg(args, 0), num_arg(args, 1)) {
            (Some(x), Some(y)) => finite(x.powf(y)),
            _ => Json::Null,
        },
        "math_atan2" => match (num_arg(args, 0), num_arg(args, 1)) {
            (Some(y), Some(x)) => finite(y.atan2(x)),
            _ => Json::Null,
        },
        "math_hypot" => match (num_arg(args, 0), num_arg(args, 1)) {
            (Some(x), Some(y)) => finite(x.hypot(y)),
            _ => Json::Null,
        },

        // random
        "random_random" => float(rand::thread_rng().r#gen::<f64>()),
        "random_randint" => match (num_arg(args, 0), num_arg(args, 1)) {
            (Some(a), Some(b)) if a <= b => {
                json!(rand::thread_rng().gen_range(a as i64..=b as i64))
            }
            _ => Json::Null,
        },
        "random_uniform" => match (num_arg(args, 0), num_arg(args, 1)) {
            (Some(a), Some(b)) => float(a + (b - a) * rand::thread_rng().r#gen::<f64>()),
            _ => Json::Null,
        },
        "random_choice" => match arg(args, 0) {
            Json::Array(items) => items
                .choose(&mut rand::thread_rng())
                .cloned()
                .unwrap_or(Json::Null),
            _ => Json::Null,
        },

        // datetime
        "datetime_date" | "datetime_datetime" => {
            let part = |i: usize, default: i64| num_arg(args, i).map_or(default, |x| x as i64);
            if args.len() < 3 || args.iter().take(3).any(Json::is_null) {
                Json::Null
            } else {
                epoch(part(0, 1970), part(1, 1), part(2, 1), part(3, 0), part(4, 0), part(5, 0))
            }
        }

        // statistics
        "statistics_mean" => numbers(arg(args, 0))
            .filter(|v| !v.is_empty())
            .map_or(Json::Null, |v| float(v.iter().sum::<f64>() / v.len() as f64)),
        "statistics_median" => numbers(arg(args, 0))
            .and_then(|v| median(&v))
            .map_or(Json::Null, float),
        "statistics_variance" => numbers(arg(args, 0))
            .and_then(|v| variance(&v, true))
            .map_or(Json::Null, float),
        "statistics_pvariance" => numbers(arg(args, 0))
            .and_then(|v| variance(&v, false))
            .map_or(Json::Null, float),
        "statistics_stdev" => numbers(arg(args, 0))
            .and_then(|v| variance(&v, true))
            .map_or(Json::Null, |v| float(v.sqrt())),
        "statistics_pstdev" => numbers(arg(args, 0))
            .and_then(|v| variance(&v, false))
            .map_or(Json::Null, |v| float(v.sqrt())),

        // strings
        "upper" => text_arg(args, 0).map_or(Json::Null, |s| json!(s.to_ascii_uppercase())),
        "lower" => text_arg(args, 0).map_or(Json::Null, |s| json!(s.to_ascii_lowercase())),
        "trim" | "ltrim" | "rtrim" => match text_arg(args, 0) {
            Some(s) => {
                let chars = args.get(1).and_then(sql_text);
                Json::String(strip_chars(&s, chars, name != "rtrim", name != "ltrim"))
            }
            None => Json::Null,
        },
        "replace" => match (text_arg(args, 0), text_arg(args, 1), text_arg(args, 2)) {
            (Some(s), Some(from), Some(to)) if !from.is_empty() => json!(s.replace(&from, &to)),
            (Some(s), Some(_), Some(_)) => json!(s),
            _ => Json::Null,
        },
        "length" => text_arg(args, 0).map_or(Json::Null, |s| json!(s.chars().count())),
        "instr" => match (text_arg(args, 0), text_arg(args, 1)) {
            (Some(hay), Some(needle)) => json!(
                hay.find(&needle)
                    .map_or(0, |byte| hay[..byte].chars().count() + 1)
            ),
            _ => Json::Null,
        },
        "str_split" => match (text_arg(args, 0), args.get(1).and_then(sql_text)) {
            (Some(s), Some(sep)) if !sep.is_empty() => {
                json!(s.split(sep.as_str()).collect::<Vec<_>>())
            }
            (Some(s), _) => json!(s.split_whitespace().collect::<Vec<_>>()),
            _ => Json::Null,
        },
        "str_startswith" => match (text_arg(args, 0), text_arg(args, 1)) {
            (Some(s), Some(p)) => json!(s.starts_with(&p) as i64),
            _ => Json::Null,
        },
        "str_endswith" => match (text_arg(args, 0), text_arg(args, 1)) {
            (Some(s), Some(p)) => json!(s.ends_with(&p) as i64),
            _ => Json::Null,
        },

        // scalar SQL builtins
        "abs" => match numeric(arg(args, 0)) {
            None => Json::Null,
            Some(Num::Int(i)) => json!(i.saturating_abs()),
            Some(Num::Float(x)) => float(x.abs()),
        },
        "min" | "max" => {
            if args.iter().any(Json::is_null) {
                Json::Null
            } else {
                let pick = if name == "min" { Ordering::Less } else { Ordering::Greater };
                let mut best = arg(args, 0);
                for candidate in args.iter().skip(1) {
                    if sql_compare(candidate, best) == Some(pick) {
                        best = candidate;
                    }
                }
                best.clone()
            }
        }
        "json_array_length" => match arg(args, 0) {
            Json::Array(items) => json!(items.len()),
            Json::Null => Json::Null,
            _ => json!(0),
        },

        // host-language helpers
        "py_in" => {
            let needle = arg(args, 0);
            match arg(args, 1) {
                Json::Array(items) => json!(items.iter().any(|i| values_equal(needle, i)) as i64),
                Json::Object(entries) => {
                    json!(sql_text(needle).is_some_and(|k| entries.contains_key(&k)) as i64)
                }
                Json::String(hay) => match sql_text(needle) {
                    Some(n) => json!(hay.contains(&n) as i64),
                    None => Json::Null,
                },
                _ => Json::Null,
            }
        }
        "py_len" => match arg(args, 0) {
            Json::String(s) => json!(s.chars().count()),
            Json::Array(items) => json!(items.len()),
            Json::Object(entries) => json!(entries.len()),
            _ => Json::Null,
        },
        "py_round" => match (numeric(arg(args, 0)), num_arg(args, 1)) {
            (None, _) => Json::Null,
            (Some(x), None) => json!(round_half_even(x.as_f64()) as i64),
            (Some(x), Some(digits)) => {
                let scale = 10f64.powi(digits as i32);
                float(round_half_even(x.as_f64() * scale) / scale)
            }
        },
        "py_bool" => json!(truthy(arg(args, 0)) as i64),
        "py_min" => extreme(args, Ordering::Less),
        "py_max" => extreme(args, Ordering::Greater),
        "py_sum" => match arg(args, 0) {
            Json::Array(items) => {
                let mut total = Json::from(0);
                for item in items {
                    total = binary(BinaryOp::Add, &total, item);
                }
                total
            }
            _ => Json::Null,
        },
        "py_any" => match arg(args, 0) {
            Json::Array(items) => json!(items.iter().any(truthy) as i64),
            _ => Json::Null,
        },
        "py_all" => match arg(args, 0) {
            Json::Array(items) => json!(items.iter().all(truthy) as i64),
            _ => Json::Null,
        },
        "py_getitem" => get_item(arg(args, 0), arg(args, 1)),
        "py_comprehension" => {
            let program = text_arg(args, 0).ok_or_else(|| {
                DgError::InvalidArguments("comprehension program is NULL".to_string())
            })?;
            let expr: Expr = serde_json::from_str(&program)?;
            let Expr::ListComp { iter, .. } = &expr else {
                return Err(DgError::InvalidArguments(
                    "comprehension program is not a comprehension".to_string(),
                ));
            };
            let mut env = Env::new();
            for (i, value) in args.iter().skip(2).enumerate() {
                env.vars.push((functions::comprehension_arg(i), value.clone()));
            }
            // the iterable arrives precomputed as the second argument
            if let Expr::Name(name) = iter.as_ref() {
                env.vars.push((name.clone(), arg(args, 1).clone()));
            }
            evaluate(&expr, &mut env)?
        }
        other => {
            return Err(DgError::InvalidArguments(format!(
                "unknown function '{}'",
                other
            )));
        }
    };
    Ok(result)
}

fn finite(x: f64) -> Json {
    if x.is_nan() { Json::Null } else { float(x) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::parse;

    fn eval(source: &str) -> Json {
        evaluate(&parse(source).unwrap(), &mut Env::new()).unwrap()
    }

    fn eval_with(source: &str, env: Env) -> Json {
        let mut env = env;
        evaluate(&parse(source).unwrap(), &mut env).unwrap()
    }

    #[test]
    fn test_arithmetic_follows_sql() {
        assert_eq!(eval("7 // 2"), json!(3));
        assert_eq!(eval("-7 // 2"), json!(-3));
        assert_eq!(eval("7 / 2"), json!(3.5));
        assert_eq!(eval("-7 % 3"), json!(-1));
        assert_eq!(eval("1 / 0"), Json::Null);
        assert_eq!(eval("2 ** 3"), json!(8.0));
        assert_eq!(eval("'a' + 'b'"), json!("ab"));
    }

    #[test]
    fn test_three_valued_logic() {
        assert_eq!(eval("None and 0"), json!(0));
        assert_eq!(eval("None and 1"), Json::Null);
        assert_eq!(eval("None or 1"), json!(1));
        assert_eq!(eval("not None"), Json::Null);
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(eval("1 < 2 < 3"), json!(1));
        assert_eq!(eval("1 < 3 < 2"), json!(0));
        assert_eq!(eval("'b' > 'a'"), json!(1));
        assert_eq!(eval("1 < 'a'"), json!(1));
        assert_eq!(eval("None == None"), json!(1));
        assert_eq!(eval("2 in [1, 2]"), json!(1));
        assert_eq!(eval("'x' not in 'abc'"), json!(1));
    }

    #[test]
    fn test_columns_and_json() {
        let env = Env::new()
            .with_column("meta", json!({"labels": ["cat", "dog"], "n": 2}))
            .with_column("when", json!(86400.0 * 31.0));
        assert_eq!(eval_with("{'meta'}.labels[-1]", env.clone()), json!("dog"));
        assert_eq!(eval_with("{'meta'}['n'] + 1", env.clone()), json!(3));
        assert_eq!(eval_with("{'when'}.month", env.clone()), json!(2));
        assert_eq!(eval_with("len({'meta'}.labels)", env), json!(2));
    }

    #[test]
    fn test_comprehension() {
        let env = Env::new().with_column("v", json!([1, 2, 3, 4]));
        assert_eq!(
            eval_with("[x * 10 for x in {'v'} if x % 2 == 0]", env.clone()),
            json!([20, 40])
        );
        assert_eq!(eval_with("any(x > 3 for x in {'v'})", env.clone()), json!(1));
        assert_eq!(eval_with("sum({'v'})", env), json!(10));
    }

    #[test]
    fn test_library_functions() {
        assert_eq!(eval("math.sqrt(16)"), json!(4.0));
        assert_eq!(eval("math.floor(-1.5)"), json!(-2));
        assert_eq!(eval("math.sqrt(-1)"), Json::Null);
        assert_eq!(eval("round(2.5)"), json!(2));
        assert_eq!(eval("round(3.5)"), json!(4));
        assert_eq!(eval("statistics.median([3, 1, 2])"), json!(2.0));
        assert_eq!(eval("datetime.date(1970, 1, 2)"), json!(86400.0));
        assert_eq!(eval("'a,b'.split(',')"), json!(["a", "b"]));
        assert_eq!(eval("'  hi '.strip().upper()"), json!("HI"));
        assert_eq!(eval("'file.png'.endswith('.png')"), json!(1));
        assert_eq!(eval("min(3, 1, 2)"), json!(1));
        assert_eq!(eval("max([3, 1, 2])"), json!(3));
        assert_eq!(eval("int('12abc')"), json!(12));
        assert_eq!(eval("math.pi > 3.14"), json!(1));
    }

    #[test]
    fn test_errors() {
        let mut env = Env::new();
        assert!(evaluate(&parse("{'missing'}").unwrap(), &mut env).is_err());
        assert!(evaluate(&parse("os.system('x')").unwrap(), &mut env).is_err());
        assert!(evaluate(&parse("AVG({'a'})").unwrap(), &mut env).is_err());
        assert!(call_function("nope", &[]).is_err());
    }

    #[test]
    fn test_py_comprehension_program() {
        let program = Expr::ListComp {
            element: Box::new(Expr::binary(
                BinaryOp::Add,
                Expr::Name("x".into()),
                Expr::Name(functions::comprehension_arg(0)),
            )),
            target: "x".into(),
            iter: Box::new(Expr::Name(functions::COMPREHENSION_ITER.into())),
            conditions: vec![],
        };
        let result = call_function(
            "py_comprehension",
            &[json!(serde_json::to_string(&program).unwrap()), json!([1, 2]), json!(10)],
        )
        .unwrap();
        assert_eq!(result, json!([11, 12]));
    }
}
