//! Function registry shared by the compiler, the interpreter and SQLite
//!
//! Every call in an expression is resolved here once. The compiler turns the
//! result into SQL; the interpreter evaluates it directly. Functions SQLite
//! lacks are registered on each connection and dispatch to
//! [`interpreter::call_function`].

use super::ast::Expr;
use super::interpreter;
use crate::error::{DgError, DgResult};
use rusqlite::Connection;
use rusqlite::functions::{Aggregate, Context, FunctionFlags};
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::{Number, Value as Json};
use tracing::debug;

/// Column aggregates that become joined single-row views.
pub const AGGREGATES: &[&str] = &["AVG", "SUM", "MIN", "MAX", "COUNT", "STDEV"];

/// Attributes of a DATETIME value.
pub const DATETIME_ATTRIBUTES: &[&str] = &["year", "month", "day", "hour", "minute", "second"];

/// Name the iterable of a compiled comprehension is bound to.
pub const COMPREHENSION_ITER: &str = "__iter";

pub fn comprehension_arg(index: usize) -> String {
    format!("__arg{}", index)
}

/// (name, min args, max args)
type Signature = (&'static str, usize, usize);

/// (name, SQL name, min args, max args)
type Library = (&'static str, &'static str, usize, usize);

const BUILTINS: &[Signature] = &[
    ("len", 1, 1),
    ("abs", 1, 1),
    ("round", 1, 2),
    ("int", 1, 1),
    ("float", 1, 1),
    ("str", 1, 1),
    ("bool", 1, 1),
    ("min", 1, usize::MAX),
    ("max", 1, usize::MAX),
    ("sum", 1, 1),
    ("any", 1, 1),
    ("all", 1, 1),
];

const MATH: &[Library] = &[
    ("sqrt", "math_sqrt", 1, 1),
    ("exp", "math_exp", 1, 1),
    ("log", "math_log", 1, 2),
    ("log10", "math_log10", 1, 1),
    ("log2", "math_log2", 1, 1),
    ("sin", "math_sin", 1, 1),
    ("cos", "math_cos", 1, 1),
    ("tan", "math_tan", 1, 1),
    ("asin", "math_asin", 1, 1),
    ("acos", "math_acos", 1, 1),
    ("atan", "math_atan", 1, 1),
    ("atan2", "math_atan2", 2, 2),
    ("hypot", "math_hypot", 2, 2),
    ("fabs", "math_fabs", 1, 1),
    ("floor", "math_floor", 1, 1),
    ("ceil", "math_ceil", 1, 1),
    ("trunc", "math_trunc", 1, 1),
    ("degrees", "math_degrees", 1, 1),
    ("radians", "math_radians", 1, 1),
    ("isnan", "math_isnan", 1, 1),
    ("isinf", "math_isinf", 1, 1),
    ("pow", "math_pow", 2, 2),
];

const RANDOM: &[Library] = &[
    ("random", "random_random", 0, 0),
    ("randint", "random_randint", 2, 2),
    ("uniform", "random_uniform", 2, 2),
    ("choice", "random_choice", 1, 1),
];

const DATETIME: &[Library] = &[
    ("date", "datetime_date", 3, 3),
    ("datetime", "datetime_datetime", 3, 6),
];

const STATISTICS: &[Library] = &[
    ("mean", "statistics_mean", 1, 1),
    ("median", "statistics_median", 1, 1),
    ("stdev", "statistics_stdev", 1, 1),
    ("pstdev", "statistics_pstdev", 1, 1),
    ("variance", "statistics_variance", 1, 1),
    ("pvariance", "statistics_pvariance", 1, 1),
];

const NAMESPACES: &[(&str, &[Library])] = &[
    ("math", MATH),
    ("random", RANDOM),
    ("datetime", DATETIME),
    ("statistics", STATISTICS),
];

/// (method, SQL function, extra min args, extra max args)
const STRING_METHODS: &[(&str, &str, usize, usize)] = &[
    ("upper", "upper", 0, 0),
    ("lower", "lower", 0, 0),
    ("strip", "trim", 0, 1),
    ("lstrip", "ltrim", 0, 1),
    ("rstrip", "rtrim", 0, 1),
    ("replace", "replace", 2, 2),
    ("split", "str_split", 0, 1),
    ("startswith", "str_startswith", 1, 1),
    ("endswith", "str_endswith", 1, 1),
];

/// Helpers implemented in Rust and registered on every connection.
const HELPERS: &[&str] = &[
    "str_split",
    "str_startswith",
    "str_endswith",
    "py_in",
    "py_len",
    "py_round",
    "py_bool",
    "py_min",
    "py_max",
    "py_sum",
    "py_any",
    "py_all",
    "py_getitem",
    "py_comprehension",
];

/// Helpers whose result may be of any type. They return serialized JSON
/// which the compiler reads back with `json_extract(.., '$')`.
const SERIALIZED: &[&str] = &["py_getitem", "random_choice"];

/// What a call expression refers to.
#[derive(Debug, Clone, PartialEq)]
pub enum Callee<'a> {
    /// `AVG({'col'})` and friends
    Aggregate(&'static str),
    /// A namespaced library function, by its SQL name (`math_sqrt`)
    Function(&'static str),
    /// A host-language builtin such as `len`
    Builtin(&'static str),
    /// `receiver.method(args)`
    Method {
        receiver: &'a Expr,
        method: &'static str,
    },
}

fn check_arity(name: &str, argc: usize, min: usize, max: usize) -> Result<(), String> {
    if argc < min || argc > max {
        let expected = if min == max {
            min.to_string()
        } else if max == usize::MAX {
            format!("at least {}", min)
        } else {
            format!("{} to {}", min, max)
        };
        return Err(format!(
            "{}() takes {} argument(s), got {}",
            name, expected, argc
        ));
    }
    Ok(())
}

/// Resolves the callee of a call with `argc` arguments. `is_var` reports
/// names bound by an enclosing comprehension, which shadow namespaces.
pub fn resolve<'a>(
    func: &'a Expr,
    argc: usize,
    is_var: &dyn Fn(&str) -> bool,
) -> Result<Callee<'a>, String> {
    match func {
        Expr::Name(name) => {
            if let Some(agg) = AGGREGATES.iter().find(|a| **a == name.as_str()) {
                check_arity(name, argc, 1, 1)?;
                return Ok(Callee::Aggregate(*agg));
            }
            match BUILTINS.iter().find(|(n, _, _)| *n == name.as_str()) {
                Some((builtin, min, max)) => {
                    check_arity(name, argc, *min, *max)?;
                    Ok(Callee::Builtin(*builtin))
                }
                None => Err(format!("unknown function '{}'", name)),
            }
        }
        Expr::Attribute { value, attr } => {
            if let Expr::Name(namespace) = value.as_ref() {
                if !is_var(namespace) {
                    let Some((_, table)) =
                        NAMESPACES.iter().find(|(ns, _)| *ns == namespace.as_str())
                    else {
                        return Err(format!("unknown module '{}'", namespace));
                    };
                    let Some((_, sql_name, min, max)) =
                        table.iter().find(|(n, _, _, _)| *n == attr.as_str())
                    else {
                        return Err(format!("unknown function '{}.{}'", namespace, attr));
                    };
                    check_arity(&format!("{}.{}", namespace, attr), argc, *min, *max)?;
                    return Ok(Callee::Function(*sql_name));
                }
            }
            match STRING_METHODS.iter().find(|(m, _, _, _)| *m == attr.as_str()) {
                Some((method, _, min, max)) => {
                    check_arity(attr, argc, *min, *max)?;
                    Ok(Callee::Method {
                        receiver: value,
                        method: *method,
                    })
                }
                None => Err(format!("unknown method '{}'", attr)),
            }
        }
        other => Err(format!("'{}' is not callable", other)),
    }
}

/// SQL function implementing a string method; the receiver is its first
/// argument.
pub fn method_function(method: &str) -> &'static str {
    STRING_METHODS
        .iter()
        .find(|(m, _, _, _)| *m == method)
        .map_or("py_getitem", |(_, sql, _, _)| *sql)
}

/// SQL function implementing a builtin. `int`, `float` and `str` are casts
/// and have none.
pub fn builtin_function(name: &str, argc: usize) -> Option<&'static str> {
    Some(match name {
        "len" => "py_len",
        "abs" => "abs",
        "round" => "py_round",
        "bool" => "py_bool",
        "min" if argc == 1 => "py_min",
        "max" if argc == 1 => "py_max",
        "min" => "min",
        "max" => "max",
        "sum" => "py_sum",
        "any" => "py_any",
        "all" => "py_all",
        _ => return None,
    })
}

/// Named constants such as `math.pi`.
pub fn constant(namespace: Option<&str>, name: &str) -> Option<Json> {
    let value = match (namespace?, name) {
        ("math", "pi") => std::f64::consts::PI,
        ("math", "e") => std::f64::consts::E,
        ("math", "tau") => std::f64::consts::TAU,
        _ => return None,
    };
    Number::from_f64(value).map(Json::Number)
}

// ════════════════════════════════════════════
// SQLite bridge
// ════════════════════════════════════════════

/// Converts an SQL argument to the interpreter's value model. TEXT always
/// stays a string; JSON documents arrive as BLOBs of their serialized form
/// (see the compiler's helper arguments).
pub fn sql_to_json(value: ValueRef<'_>) -> Json {
    match value {
        ValueRef::Null => Json::Null,
        ValueRef::Integer(i) => Json::from(i),
        ValueRef::Real(x) => Number::from_f64(x).map_or(Json::Null, Json::Number),
        ValueRef::Text(bytes) => Json::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => serde_json::from_slice(bytes).unwrap_or(Json::Null),
    }
}

pub fn json_to_sql(value: Json) -> SqlValue {
    match value {
        Json::Null => SqlValue::Null,
        Json::Bool(b) => SqlValue::Integer(b as i64),
        Json::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map_or(SqlValue::Null, SqlValue::Real),
        },
        Json::String(s) => SqlValue::Text(s),
        other => SqlValue::Text(other.to_string()),
    }
}

fn to_sql_error(err: DgError) -> rusqlite::Error {
    rusqlite::Error::UserFunctionError(Box::new(err))
}

fn register_scalar(conn: &Connection, name: &'static str, deterministic: bool) -> DgResult<()> {
    let mut flags = FunctionFlags::SQLITE_UTF8;
    if deterministic {
        flags |= FunctionFlags::SQLITE_DETERMINISTIC;
    }
    let serialized = SERIALIZED.contains(&name);
    conn.create_scalar_function(name, -1, flags, move |ctx: &Context<'_>| {
        let args: Vec<Json> = (0..ctx.len()).map(|i| sql_to_json(ctx.get_raw(i))).collect();
        interpreter::call_function(name, &args)
            .map(|value| match value {
                Json::Null => SqlValue::Null,
                value if serialized => SqlValue::Text(value.to_string()),
                value => json_to_sql(value),
            })
            .map_err(to_sql_error)
    })?;
    Ok(())
}

/// Sample standard deviation, NULL below two values.
struct SampleStdev;

impl Aggregate<(u64, f64, f64), Option<f64>> for SampleStdev {
    fn init(&self, _ctx: &mut Context<'_>) -> rusqlite::Result<(u64, f64, f64)> {
        Ok((0, 0.0, 0.0))
    }

    fn step(&self, ctx: &mut Context<'_>, acc: &mut (u64, f64, f64)) -> rusqlite::Result<()> {
        let x = match ctx.get_raw(0) {
            ValueRef::Integer(i) => i as f64,
            ValueRef::Real(x) => x,
            _ => return Ok(()),
        };
        // Welford
        let (n, mean, m2) = acc;
        *n += 1;
        let delta = x - *mean;
        *mean += delta / *n as f64;
        *m2 += delta * (x - *mean);
        Ok(())
    }

    fn finalize(
        &self,
        _ctx: &mut Context<'_>,
        acc: Option<(u64, f64, f64)>,
    ) -> rusqlite::Result<Option<f64>> {
        Ok(acc
            .filter(|(n, _, _)| *n >= 2)
            .map(|(n, _, m2)| (m2 / (n - 1) as f64).sqrt()))
    }
}

/// Registers every helper the compiler may emit.
pub fn register_functions(conn: &Connection) -> DgResult<()> {
    for (namespace, table) in NAMESPACES {
        for (_, sql_name, _, _) in table.iter() {
            register_scalar(conn, sql_name, *namespace != "random")?;
        }
    }
    for name in HELPERS {
        register_scalar(conn, name, true)?;
    }
    conn.create_aggregate_function(
        "STDEV",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        SampleStdev,
    )?;
    debug!("registered expression functions");
    Ok(())
}
