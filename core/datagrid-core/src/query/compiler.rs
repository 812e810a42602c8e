//! Expression-to-SQL translation
//!
//! Compiles parsed expressions against a [`Schema`]: column references become
//! physical field names, attribute and subscript paths on JSON values become
//! `json_extract` calls, aggregate calls are hoisted into single-row views
//! joined into the outer query, and comprehensions are shipped to the
//! interpreter through `py_comprehension`.

use super::ast::{BinaryOp, CompareOp, Expr, Literal, UnaryOp};
use super::functions::{self, COMPREHENSION_ITER, Callee, DATETIME_ATTRIBUTES};
use super::interpreter::normalize_none;
use super::parser::parse;
use crate::error::{DgError, DgResult};
use crate::storage::sqlite::{DATAGRID_TABLE, quote_literal};
use crate::types::{ColumnType, Schema, unify};
use indexmap::IndexMap;
use tracing::debug;

/// Query-scoped column defined by an expression.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputedColumn {
    pub name: String,
    /// Compiled SQL of the defining expression
    pub field_expr: String,
    /// Alias in the SELECT list (`cc0`, `cc1`, ...)
    pub field_name: String,
    /// `None` when the type can only be known from the returned values
    pub column_type: Option<ColumnType>,
}

/// Output of [`compile`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledQuery {
    pub where_sql: Option<String>,
    pub computed: IndexMap<String, ComputedColumn>,
    /// View name -> single-row subquery
    pub aggregates: IndexMap<String, String>,
}

impl CompiledQuery {
    /// `datagrid` joined with every aggregate view.
    pub fn from_clause(&self) -> String {
        let mut from = DATAGRID_TABLE.to_string();
        for subquery in self.aggregates.values() {
            from.push_str(", (");
            from.push_str(subquery);
            from.push(')');
        }
        from
    }

    pub fn where_clause(&self) -> String {
        self.where_sql
            .as_ref()
            .map(|sql| format!(" WHERE {}", sql))
            .unwrap_or_default()
    }

    /// SQL for a column by name, computed columns first.
    pub fn field_sql(&self, name: &str, schema: &Schema) -> DgResult<String> {
        match self.computed.get(name) {
            Some(cc) => Ok(cc.field_expr.clone()),
            None => schema.field_name(name).map(str::to_string),
        }
    }

    pub fn column_type(&self, name: &str, schema: &Schema) -> Option<ColumnType> {
        match self.computed.get(name) {
            Some(cc) => cc.column_type.clone(),
            None => schema.column_type(name).cloned(),
        }
    }
}

/// A single compiled expression, as used by `append_column`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpression {
    pub sql: String,
    pub column_type: Option<ColumnType>,
    pub aggregates: IndexMap<String, String>,
}

/// Compiles a filter plus computed-column definitions (name -> source, in
/// declaration order).
pub fn compile(
    where_expr: Option<&str>,
    computed: &IndexMap<String, String>,
    schema: &Schema,
) -> DgResult<CompiledQuery> {
    let mut aggregates = IndexMap::new();
    let computed = unify_computed_columns(computed, schema, &mut aggregates)?;

    let where_sql = match where_expr.map(str::trim).filter(|s| !s.is_empty()) {
        Some(source) => {
            let expr = parse(source)?;
            let mut compiler = Compiler::new(schema, &computed, &mut aggregates);
            Some(compiler.compile(&expr)?.sql)
        }
        None => None,
    };
    debug!(
        where_sql = where_sql.as_deref().unwrap_or(""),
        computed = computed.len(),
        aggregates = aggregates.len(),
        "compiled query"
    );
    Ok(CompiledQuery {
        where_sql,
        computed,
        aggregates,
    })
}

/// Compiles computed columns in declaration order. A definition may refer to
/// any earlier computed column by name; its compiled SQL is substituted.
pub fn unify_computed_columns(
    definitions: &IndexMap<String, String>,
    schema: &Schema,
    aggregates: &mut IndexMap<String, String>,
) -> DgResult<IndexMap<String, ComputedColumn>> {
    let mut computed: IndexMap<String, ComputedColumn> = IndexMap::new();
    for (index, (name, source)) in definitions.iter().enumerate() {
        if name.trim().is_empty() {
            return Err(DgError::compile("computed column needs a name", source.clone()));
        }
        let expr = parse(source)?;
        let fragment = Compiler::new(schema, &computed, aggregates).compile(&expr)?;
        computed.insert(
            name.clone(),
            ComputedColumn {
                name: name.clone(),
                field_expr: fragment.sql,
                field_name: format!("cc{}", index),
                column_type: fragment.ty,
            },
        );
    }
    Ok(computed)
}

pub fn compile_expression(source: &str, schema: &Schema) -> DgResult<CompiledExpression> {
    let expr = parse(source)?;
    let computed = IndexMap::new();
    let mut aggregates = IndexMap::new();
    let fragment = Compiler::new(schema, &computed, &mut aggregates).compile(&expr)?;
    Ok(CompiledExpression {
        sql: fragment.sql,
        column_type: fragment.ty,
        aggregates,
    })
}

/// Compile-only validation of a filter.
pub fn verify_where(
    where_expr: &str,
    computed: &IndexMap<String, String>,
    schema: &Schema,
) -> DgResult<()> {
    compile(Some(where_expr), computed, schema).map(|_| ())
}

// ════════════════════════════════════════════
// Translation
// ════════════════════════════════════════════

/// A JSON document and a path into it.
#[derive(Debug, Clone)]
struct JsonPath {
    doc: String,
    path: String,
    /// `doc` is a helper's serialized result rather than a stored document
    serialized: bool,
}

impl JsonPath {
    fn root(doc: String) -> Self {
        Self {
            doc,
            path: "$".to_string(),
            serialized: false,
        }
    }

    fn serialized(doc: String) -> Self {
        Self {
            serialized: true,
            ..Self::root(doc)
        }
    }

    fn extend(&self, segment: String) -> Self {
        Self {
            doc: self.doc.clone(),
            path: format!("{}{}", self.path, segment),
            serialized: self.serialized,
        }
    }

    fn key(&self, key: &str) -> Self {
        let plain = !key.is_empty() && key.chars().all(|c| c.is_alphanumeric() || c == '_');
        if plain {
            self.extend(format!(".{}", key))
        } else {
            self.extend(format!(".\"{}\"", key.replace('"', "\\\"")))
        }
    }

    fn index(&self, index: i64) -> Self {
        if index < 0 {
            self.extend(format!("[#{}]", index))
        } else {
            self.extend(format!("[{}]", index))
        }
    }

    /// The value at this path as serialized JSON in a BLOB, the form the
    /// Rust helpers decode. `->` keeps strings quoted.
    fn blob(&self) -> String {
        format!("CAST(({} -> {}) AS BLOB)", self.doc, quote_literal(&self.path))
    }

    fn sql(&self) -> String {
        if self.path == "$" && !self.serialized {
            self.doc.clone()
        } else {
            format!("json_extract({}, {})", self.doc, quote_literal(&self.path))
        }
    }
}

/// Compiled SQL with what is known about its type.
#[derive(Debug, Clone)]
struct Fragment {
    sql: String,
    ty: Option<ColumnType>,
    json: Option<JsonPath>,
}

impl Fragment {
    fn typed(sql: String, ty: ColumnType) -> Self {
        Self {
            sql,
            ty: Some(ty),
            json: None,
        }
    }

    fn untyped(sql: String) -> Self {
        Self {
            sql,
            ty: None,
            json: None,
        }
    }

    fn json(sql: String) -> Self {
        Self {
            json: Some(JsonPath::root(sql.clone())),
            sql,
            ty: Some(ColumnType::Json),
        }
    }

    /// Result of a helper that may return any value, serialized as JSON.
    fn serialized(sql: String) -> Self {
        Self::path(JsonPath::serialized(sql))
    }

    fn path(path: JsonPath) -> Self {
        Self {
            sql: path.sql(),
            ty: None,
            json: Some(path),
        }
    }

    /// Argument passed to a Rust helper. JSON (the metadata document for
    /// asset columns) travels as a BLOB so plain TEXT is never decoded.
    fn helper_arg(&self) -> String {
        self.json.as_ref().map_or_else(|| self.sql.clone(), JsonPath::blob)
    }

    fn is_text(&self) -> bool {
        self.ty == Some(ColumnType::Text)
    }
}

fn arithmetic_type(left: &Fragment, right: &Fragment) -> Option<ColumnType> {
    let integral = |f: &Fragment| {
        matches!(
            f.ty,
            Some(ColumnType::Integer | ColumnType::Boolean | ColumnType::RowId)
        )
    };
    let numeric = |f: &Fragment| f.ty.as_ref().is_some_and(ColumnType::is_numeric);
    if integral(left) && integral(right) {
        Some(ColumnType::Integer)
    } else if numeric(left) && numeric(right) {
        Some(ColumnType::Float)
    } else {
        None
    }
}

fn function_type(sql_name: &str) -> Option<ColumnType> {
    Some(match sql_name {
        "math_floor" | "math_ceil" | "math_trunc" | "random_randint" => ColumnType::Integer,
        "math_isnan" | "math_isinf" => ColumnType::Boolean,
        "datetime_date" | "datetime_datetime" => ColumnType::Datetime,
        "random_choice" => return None,
        _ => ColumnType::Float,
    })
}

fn strftime_code(attr: &str) -> &'static str {
    match attr {
        "year" => "%Y",
        "month" => "%m",
        "day" => "%d",
        "hour" => "%H",
        "minute" => "%M",
        _ => "%S",
    }
}

fn literal_sql(lit: &Literal) -> Fragment {
    match lit {
        Literal::Int(i) => Fragment::typed(i.to_string(), ColumnType::Integer),
        Literal::Float(x) => Fragment::typed(format!("{:?}", x), ColumnType::Float),
        Literal::Str(s) => Fragment::typed(quote_literal(s), ColumnType::Text),
        Literal::Bool(b) => Fragment::typed((*b as i64).to_string(), ColumnType::Boolean),
        Literal::None => Fragment::untyped("NULL".to_string()),
    }
}

struct Compiler<'a> {
    schema: &'a Schema,
    computed: &'a IndexMap<String, ComputedColumn>,
    aggregates: &'a mut IndexMap<String, String>,
}

impl<'a> Compiler<'a> {
    fn new(
        schema: &'a Schema,
        computed: &'a IndexMap<String, ComputedColumn>,
        aggregates: &'a mut IndexMap<String, String>,
    ) -> Self {
        Self {
            schema,
            computed,
            aggregates,
        }
    }

    fn compile(&mut self, expr: &Expr) -> DgResult<Fragment> {
        let fail = |message: String| DgError::compile(message, expr.to_string());
        match expr {
            Expr::Literal(lit) => Ok(literal_sql(lit)),
            Expr::Column(name) => self
                .column(name)
                .ok_or_else(|| fail(format!("unknown column '{}'", name))),
            Expr::Name(name) => Err(fail(format!("unknown name '{}'", name))),
            Expr::Unary { op, expr: inner } => {
                let value = self.compile(inner)?;
                Ok(match op {
                    UnaryOp::Neg => Fragment {
                        sql: format!("(-{})", value.sql),
                        ty: value.ty.filter(ColumnType::is_numeric),
                        json: None,
                    },
                    UnaryOp::Pos => Fragment {
                        sql: format!("(+{})", value.sql),
                        ty: value.ty,
                        json: None,
                    },
                    UnaryOp::Not => {
                        Fragment::typed(format!("(NOT {})", value.sql), ColumnType::Boolean)
                    }
                })
            }
            Expr::Binary { op, left, right } => {
                let l = self.compile(left)?;
                let r = self.compile(right)?;
                Ok(self.binary(*op, l, r))
            }
            Expr::Compare {
                left,
                ops,
                comparators,
            } => {
                let mut current = self.compile(left)?;
                let mut terms = Vec::with_capacity(ops.len());
                for (op, right) in ops.iter().zip(comparators) {
                    let value = self.compile(right)?;
                    let op = normalize_none(*op, right);
                    terms.push(self.comparison(op, &current, right, &value)?);
                    current = value;
                }
                let sql = if terms.len() == 1 {
                    terms.remove(0)
                } else {
                    format!("({})", terms.join(" AND "))
                };
                Ok(Fragment::typed(sql, ColumnType::Boolean))
            }
            Expr::IfElse { test, body, orelse } => {
                let test = self.compile(test)?;
                let body = self.compile(body)?;
                let orelse = self.compile(orelse)?;
                Ok(Fragment {
                    sql: format!(
                        "CASE WHEN {} THEN {} ELSE {} END",
                        test.sql, body.sql, orelse.sql
                    ),
                    ty: unify(body.ty.as_ref(), orelse.ty.as_ref()),
                    json: None,
                })
            }
            Expr::List(items) | Expr::Tuple(items) | Expr::Set(items) => {
                let items = items
                    .iter()
                    .map(|item| self.compile(item).map(|f| f.sql))
                    .collect::<DgResult<Vec<_>>>()?;
                Ok(Fragment::json(format!("json_array({})", items.join(", "))))
            }
            Expr::Subscript { value, index } => self.subscript(expr, value, index),
            Expr::Attribute { value, attr } => self.attribute(expr, value, attr),
            Expr::Call { func, args } => self.call(expr, func, args),
            Expr::ListComp { .. } => self.comprehension(expr),
        }
    }

    fn column(&self, name: &str) -> Option<Fragment> {
        if let Some(cc) = self.computed.get(name) {
            let sql = cc.field_expr.clone();
            return Some(match &cc.column_type {
                Some(ty) if ty.is_json() => Fragment::json(sql),
                ty => Fragment {
                    sql,
                    ty: ty.clone(),
                    json: None,
                },
            });
        }
        let column = self.schema.get(name)?;
        let field = column.field_name.clone();
        Some(match &column.column_type {
            ty if ty.is_json() => Fragment {
                json: Some(JsonPath::root(field.clone())),
                sql: field,
                ty: Some(ty.clone()),
            },
            ty @ ColumnType::Asset(_) => Fragment {
                sql: field,
                ty: Some(ty.clone()),
                json: self
                    .schema
                    .companion_of(name)
                    .map(|c| JsonPath::root(c.field_name.clone())),
            },
            ty => Fragment::typed(field, ty.clone()),
        })
    }

    fn binary(&mut self, op: BinaryOp, l: Fragment, r: Fragment) -> Fragment {
        match op {
            BinaryOp::Add if l.is_text() || r.is_text() => {
                Fragment::typed(format!("({} || {})", l.sql, r.sql), ColumnType::Text)
            }
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Mod => Fragment {
                sql: format!("({} {} {})", l.sql, op.symbol(), r.sql),
                ty: arithmetic_type(&l, &r),
                json: None,
            },
            BinaryOp::Div => {
                Fragment::typed(format!("({} * 1.0 / {})", l.sql, r.sql), ColumnType::Float)
            }
            BinaryOp::FloorDiv => Fragment::typed(
                format!("CAST(({} / {}) AS INTEGER)", l.sql, r.sql),
                ColumnType::Integer,
            ),
            BinaryOp::Pow => {
                Fragment::typed(format!("math_pow({}, {})", l.sql, r.sql), ColumnType::Float)
            }
            BinaryOp::And => {
                Fragment::typed(format!("({} AND {})", l.sql, r.sql), ColumnType::Boolean)
            }
            BinaryOp::Or => {
                Fragment::typed(format!("({} OR {})", l.sql, r.sql), ColumnType::Boolean)
            }
        }
    }

    fn comparison(
        &mut self,
        op: CompareOp,
        left: &Fragment,
        right_expr: &Expr,
        right: &Fragment,
    ) -> DgResult<String> {
        let symbol = match op {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "!=",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
            CompareOp::Is => "IS",
            CompareOp::IsNot => "IS NOT",
            CompareOp::In | CompareOp::NotIn => {
                let negate = if op == CompareOp::NotIn { "NOT " } else { "" };
                return Ok(match right_expr {
                    Expr::List(items) | Expr::Tuple(items) | Expr::Set(items)
                        if items.iter().all(Expr::is_literal) =>
                    {
                        let values = items
                            .iter()
                            .filter_map(|item| match item {
                                Expr::Literal(lit) => Some(literal_sql(lit).sql),
                                _ => None,
                            })
                            .collect::<Vec<_>>();
                        format!("({} {}IN ({}))", left.sql, negate, values.join(", "))
                    }
                    _ => format!(
                        "({}py_in({}, {}))",
                        negate,
                        left.helper_arg(),
                        right.helper_arg()
                    ),
                });
            }
        };
        Ok(format!("({} {} {})", left.sql, symbol, right.sql))
    }

    fn attribute(&mut self, expr: &Expr, value: &Expr, attr: &str) -> DgResult<Fragment> {
        if let Expr::Name(namespace) = value {
            return match functions::constant(Some(namespace.as_str()), attr) {
                Some(constant) => Ok(Fragment::typed(constant.to_string(), ColumnType::Float)),
                None => Err(DgError::compile(
                    format!("unknown attribute '{}.{}'", namespace, attr),
                    expr.to_string(),
                )),
            };
        }
        let base = self.compile(value)?;
        if let Some(path) = &base.json {
            return Ok(Fragment::path(path.key(attr)));
        }
        if base.ty == Some(ColumnType::Datetime) && DATETIME_ATTRIBUTES.contains(&attr) {
            return Ok(Fragment::typed(
                format!(
                    "CAST(strftime('{}', {}, 'unixepoch') AS INTEGER)",
                    strftime_code(attr),
                    base.sql
                ),
                ColumnType::Integer,
            ));
        }
        Err(DgError::compile(
            format!(
                "attribute '{}' needs a JSON, asset or DATETIME value",
                attr
            ),
            expr.to_string(),
        ))
    }

    fn subscript(&mut self, expr: &Expr, value: &Expr, index: &Expr) -> DgResult<Fragment> {
        let base = self.compile(value)?;
        if let Some(path) = &base.json {
            match index {
                Expr::Literal(Literal::Int(i)) => return Ok(Fragment::path(path.index(*i))),
                Expr::Literal(Literal::Str(key)) => return Ok(Fragment::path(path.key(key))),
                _ => {}
            }
        }
        if matches!(index, Expr::Literal(Literal::Float(_) | Literal::None)) {
            return Err(DgError::compile(
                "subscript index must be an integer or a string",
                expr.to_string(),
            ));
        }
        let index = self.compile(index)?;
        Ok(Fragment::serialized(format!(
            "py_getitem({}, {})",
            base.helper_arg(),
            index.helper_arg()
        )))
    }

    fn call(&mut self, expr: &Expr, func: &Expr, args: &[Expr]) -> DgResult<Fragment> {
        let callee = functions::resolve(func, args.len(), &|_| false)
            .map_err(|message| DgError::compile(message, expr.to_string()))?;
        match callee {
            Callee::Aggregate(name) => self.aggregate(expr, name, &args[0]),
            Callee::Function(sql_name) => {
                let args = self.arguments(args)?;
                let sql = format!("{}({})", sql_name, args.join(", "));
                Ok(match function_type(sql_name) {
                    Some(ty) => Fragment::typed(sql, ty),
                    None => Fragment::serialized(sql),
                })
            }
            Callee::Builtin(name) => self.builtin(name, args),
            Callee::Method { receiver, method } => {
                let mut values = vec![self.compile(receiver)?.sql];
                values.extend(self.arguments(args)?);
                let sql = format!(
                    "{}({})",
                    functions::method_function(method),
                    values.join(", ")
                );
                Ok(match method {
                    "split" => Fragment::json(sql),
                    "startswith" | "endswith" => Fragment::typed(sql, ColumnType::Boolean),
                    _ => Fragment::typed(sql, ColumnType::Text),
                })
            }
        }
    }

    fn arguments(&mut self, args: &[Expr]) -> DgResult<Vec<String>> {
        args.iter()
            .map(|arg| self.compile(arg).map(|f| f.helper_arg()))
            .collect()
    }

    fn builtin(&mut self, name: &str, args: &[Expr]) -> DgResult<Fragment> {
        let compiled = args
            .iter()
            .map(|arg| self.compile(arg))
            .collect::<DgResult<Vec<_>>>()?;
        let first = &compiled[0];
        let cast = |target: &str, ty: ColumnType| {
            Fragment::typed(format!("CAST({} AS {})", first.sql, target), ty)
        };
        match name {
            "int" => return Ok(cast("INTEGER", ColumnType::Integer)),
            "float" => return Ok(cast("REAL", ColumnType::Float)),
            "str" => return Ok(cast("TEXT", ColumnType::Text)),
            "len" if first.is_text() && first.json.is_none() => {
                return Ok(Fragment::typed(
                    format!("length({})", first.sql),
                    ColumnType::Integer,
                ));
            }
            _ => {}
        }
        let sql_name = functions::builtin_function(name, compiled.len()).ok_or_else(|| {
            DgError::compile(format!("unknown function '{}'", name), name.to_string())
        })?;
        let args = compiled
            .iter()
            .map(Fragment::helper_arg)
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("{}({})", sql_name, args);
        let ty = match sql_name {
            "py_len" => Some(ColumnType::Integer),
            "py_bool" | "py_any" | "py_all" => Some(ColumnType::Boolean),
            "py_round" if compiled.len() == 1 => Some(ColumnType::Integer),
            "py_round" => Some(ColumnType::Float),
            "abs" => first.ty.clone().filter(ColumnType::is_numeric),
            "min" | "max" => compiled
                .iter()
                .skip(1)
                .fold(first.ty.clone(), |acc, f| unify(acc.as_ref(), f.ty.as_ref())),
            _ => None,
        };
        Ok(Fragment { sql, ty, json: None })
    }

    /// Hoists `AGG({'col'})` into a view named `<agg>_<field>`.
    fn aggregate(&mut self, expr: &Expr, name: &str, arg: &Expr) -> DgResult<Fragment> {
        let Expr::Column(column) = arg else {
            return Err(DgError::compile(
                format!("{} takes exactly one column reference", name),
                expr.to_string(),
            ));
        };
        let (field_sql, alias, column_type) = match self.computed.get(column) {
            Some(cc) => (
                cc.field_expr.clone(),
                cc.field_name.clone(),
                cc.column_type.clone(),
            ),
            None => match self.schema.get(column) {
                Some(c) => (
                    c.field_name.clone(),
                    c.field_name.clone(),
                    Some(c.column_type.clone()),
                ),
                None => {
                    return Err(DgError::compile(
                        format!("unknown column '{}'", column),
                        expr.to_string(),
                    ));
                }
            },
        };
        let view = format!("{}_{}", name.to_lowercase(), alias);
        self.aggregates.entry(view.clone()).or_insert_with(|| {
            format!(
                "SELECT {}({}) AS {} FROM {}",
                name, field_sql, view, DATAGRID_TABLE
            )
        });
        let ty = match name {
            "COUNT" => Some(ColumnType::Integer),
            "AVG" | "STDEV" => Some(ColumnType::Float),
            _ => column_type.filter(ColumnType::is_numeric),
        };
        Ok(Fragment { sql: view, ty, json: None })
    }

    /// `[elem for x in iter if cond]` becomes
    /// `py_comprehension('<program>', <iter>, <column args>...)`.
    fn comprehension(&mut self, expr: &Expr) -> DgResult<Fragment> {
        let Expr::ListComp {
            element,
            target,
            iter,
            conditions,
        } = expr
        else {
            return Err(DgError::compile("expected a comprehension", expr.to_string()));
        };
        let iter_sql = self.compile(iter)?.helper_arg();

        let mut columns: Vec<String> = Vec::new();
        let mut rewrite = |e: &Expr| rewrite_columns(e, &mut columns);
        let program = Expr::ListComp {
            element: Box::new(rewrite(element)),
            target: target.clone(),
            iter: Box::new(Expr::Name(COMPREHENSION_ITER.to_string())),
            conditions: conditions.iter().map(&mut rewrite).collect(),
        };
        validate_program(&program, target, columns.len())?;

        let mut args = vec![quote_literal(&serde_json::to_string(&program)?), iter_sql];
        for column in &columns {
            let fragment = self.column(column).ok_or_else(|| {
                DgError::compile(format!("unknown column '{}'", column), expr.to_string())
            })?;
            args.push(fragment.helper_arg());
        }
        Ok(Fragment::json(format!("py_comprehension({})", args.join(", "))))
    }
}

/// Replaces column references with positional argument names.
fn rewrite_columns(expr: &Expr, columns: &mut Vec<String>) -> Expr {
    let mut recur = |e: &Expr| rewrite_columns(e, columns);
    match expr {
        Expr::Column(name) => {
            let index = match columns.iter().position(|c| c == name) {
                Some(i) => i,
                None => {
                    columns.push(name.clone());
                    columns.len() - 1
                }
            };
            Expr::Name(functions::comprehension_arg(index))
        }
        Expr::Literal(_) | Expr::Name(_) => expr.clone(),
        Expr::Unary { op, expr } => Expr::Unary {
            op: *op,
            expr: Box::new(recur(expr)),
        },
        Expr::Binary { op, left, right } => Expr::Binary {
            op: *op,
            left: Box::new(recur(left)),
            right: Box::new(recur(right)),
        },
        Expr::Compare {
            left,
            ops,
            comparators,
        } => Expr::Compare {
            left: Box::new(recur(left)),
            ops: ops.clone(),
            comparators: comparators.iter().map(&mut recur).collect(),
        },
        Expr::IfElse { test, body, orelse } => Expr::IfElse {
            test: Box::new(recur(test)),
            body: Box::new(recur(body)),
            orelse: Box::new(recur(orelse)),
        },
        Expr::List(items) => Expr::List(items.iter().map(&mut recur).collect()),
        Expr::Tuple(items) => Expr::Tuple(items.iter().map(&mut recur).collect()),
        Expr::Set(items) => Expr::Set(items.iter().map(&mut recur).collect()),
        Expr::Subscript { value, index } => Expr::Subscript {
            value: Box::new(recur(value)),
            index: Box::new(recur(index)),
        },
        Expr::Attribute { value, attr } => Expr::Attribute {
            value: Box::new(recur(value)),
            attr: attr.clone(),
        },
        Expr::Call { func, args } => Expr::Call {
            func: Box::new(recur(func)),
            args: args.iter().map(&mut recur).collect(),
        },
        Expr::ListComp {
            element,
            target,
            iter,
            conditions,
        } => Expr::ListComp {
            element: Box::new(recur(element)),
            target: target.clone(),
            iter: Box::new(recur(iter)),
            conditions: conditions.iter().map(&mut recur).collect(),
        },
    }
}

/// Rejects comprehension bodies the interpreter would fail on at run time.
fn validate_program(program: &Expr, target: &str, args: usize) -> DgResult<()> {
    let bound = |name: &str| {
        name == target
            || name == COMPREHENSION_ITER
            || (0..args).any(|i| functions::comprehension_arg(i) == name)
    };
    let fail = |message: String, e: &Expr| -> DgResult<()> {
        Err(DgError::compile(message, e.to_string()))
    };

    fn visit(
        expr: &Expr,
        top: bool,
        bound: &dyn Fn(&str) -> bool,
        fail: &dyn Fn(String, &Expr) -> DgResult<()>,
    ) -> DgResult<()> {
        match expr {
            Expr::ListComp {
                element,
                conditions,
                ..
            } if top => {
                visit(element, false, bound, fail)?;
                conditions
                    .iter()
                    .try_for_each(|c| visit(c, false, bound, fail))
            }
            Expr::ListComp { .. } => fail("nested comprehensions are not supported".into(), expr),
            Expr::Name(name) if !bound(name) => fail(format!("unknown name '{}'", name), expr),
            Expr::Attribute { value, attr } => match value.as_ref() {
                Expr::Name(ns) if !bound(ns) => match functions::constant(Some(ns.as_str()), attr) {
                    Some(_) => Ok(()),
                    None => fail(format!("unknown attribute '{}.{}'", ns, attr), expr),
                },
                other => visit(other, false, bound, fail),
            },
            Expr::Call { func, args } => {
                match functions::resolve(func, args.len(), bound) {
                    Err(message) => return fail(message, expr),
                    Ok(Callee::Aggregate(name)) => {
                        return fail(
                            format!("{} cannot be used inside a comprehension", name),
                            expr,
                        );
                    }
                    Ok(Callee::Method { receiver, .. }) => visit(receiver, false, bound, fail)?,
                    Ok(_) => {}
                }
                args.iter().try_for_each(|a| visit(a, false, bound, fail))
            }
            Expr::Literal(_) | Expr::Name(_) | Expr::Column(_) => Ok(()),
            Expr::Unary { expr, .. } => visit(expr, false, bound, fail),
            Expr::Binary { left, right, .. } => {
                visit(left, false, bound, fail)?;
                visit(right, false, bound, fail)
            }
            Expr::Compare {
                left, comparators, ..
            } => {
                visit(left, false, bound, fail)?;
                comparators
                    .iter()
                    .try_for_each(|c| visit(c, false, bound, fail))
            }
            Expr::IfElse { test, body, orelse } => {
                visit(test, false, bound, fail)?;
                visit(body, false, bound, fail)?;
                visit(orelse, false, bound, fail)
            }
            Expr::List(items) | Expr::Tuple(items) | Expr::Set(items) => items
                .iter()
                .try_for_each(|i| visit(i, false, bound, fail)),
            Expr::Subscript { value, index } => {
                visit(value, false, bound, fail)?;
                visit(index, false, bound, fail)
            }
        }
    }

    visit(program, true, &bound, &fail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        let mut schema = Schema::new();
        schema.add_column("A", ColumnType::Integer).unwrap();
        schema.add_column("B", ColumnType::Integer).unwrap();
        schema.add_column("name", ColumnType::Text).unwrap();
        schema.add_column("meta", ColumnType::Json).unwrap();
        schema.add_column("when", ColumnType::Datetime).unwrap();
        schema.add_column("image", ColumnType::asset("Image")).unwrap();
        schema
    }

    fn where_sql(source: &str) -> String {
        compile(Some(source), &IndexMap::new(), &schema())
            .unwrap()
            .where_sql
            .unwrap()
    }

    #[test]
    fn test_columns_and_operators() {
        assert_eq!(where_sql("{'A'} + {'B'} > 3"), "((column_1 + column_2) > 3)");
        assert_eq!(where_sql("{'A'} / 2"), "(column_1 * 1.0 / 2)");
        assert_eq!(where_sql("{'A'} // 2"), "CAST((column_1 / 2) AS INTEGER)");
        assert_eq!(where_sql("{'A'} ** 2"), "math_pow(column_1, 2)");
        assert_eq!(where_sql("{'name'} + 'x'"), "(column_3 || 'x')");
        assert_eq!(where_sql("{'A'} == None"), "(column_1 IS NULL)");
        assert_eq!(where_sql("{'A'} != None"), "(column_1 IS NOT NULL)");
        assert_eq!(
            where_sql("1 < {'A'} <= 3"),
            "((1 < column_1) AND (column_1 <= 3))"
        );
        assert_eq!(
            where_sql("'a' if {'A'} else 'b'"),
            "CASE WHEN column_1 THEN 'a' ELSE 'b' END"
        );
        assert_eq!(where_sql("not True or False"), "((NOT 1) OR 0)");
    }

    #[test]
    fn test_membership() {
        assert_eq!(where_sql("{'A'} in [1, 2]"), "(column_1 IN (1, 2))");
        assert_eq!(where_sql("{'A'} not in (1,)"), "(column_1 NOT IN (1))");
        assert_eq!(
            where_sql("'cat' in {'meta'}.labels"),
            "(py_in('cat', CAST((column_4 -> '$.labels') AS BLOB)))"
        );
    }

    #[test]
    fn test_json_paths() {
        assert_eq!(
            where_sql("{'meta'}.box[0] > 1"),
            "(json_extract(column_4, '$.box[0]') > 1)"
        );
        assert_eq!(
            where_sql("{'meta'}['a b'][-1] == 2"),
            "(json_extract(column_4, '$.\"a b\"[#-1]') = 2)"
        );
        assert_eq!(
            where_sql("{'image'}.label == 'dog'"),
            "(json_extract(column_7, '$.label') = 'dog')"
        );
        assert_eq!(
            where_sql("{'when'}.year == 2020"),
            "(CAST(strftime('%Y', column_5, 'unixepoch') AS INTEGER) = 2020)"
        );
    }

    #[test]
    fn test_text_stays_text_for_helpers() {
        assert_eq!(
            where_sql("{'name'}.startswith('[1, ')"),
            "str_startswith(column_3, '[1, ')"
        );
        assert_eq!(where_sql("'[' in {'name'}"), "(py_in('[', column_3))");
        assert_eq!(
            where_sql("{'meta'}.tags[{'A'}] == 'x'"),
            "(json_extract(py_getitem(CAST((column_4 -> '$.tags') AS BLOB), column_1), '$') = 'x')"
        );
    }

    #[test]
    fn test_functions() {
        assert_eq!(where_sql("len({'name'}) > 2"), "(length(column_3) > 2)");
        assert_eq!(
            where_sql("len({'meta'}.labels) > 2"),
            "(py_len(CAST((column_4 -> '$.labels') AS BLOB)) > 2)"
        );
        assert!(where_sql("math.sqrt({'A'}) > math.pi").starts_with("(math_sqrt(column_1) > 3.14"));
        assert_eq!(where_sql("{'name'}.upper() == 'X'"), "(upper(column_3) = 'X')");
        assert_eq!(where_sql("int({'name'}) > 1"), "(CAST(column_3 AS INTEGER) > 1)");
        assert_eq!(where_sql("max({'A'}, {'B'}) > 1"), "(max(column_1, column_2) > 1)");
    }

    #[test]
    fn test_aggregates_become_views() {
        let query = compile(
            Some("{'A'} > AVG({'A'}) and {'B'} < MAX({'B'})"),
            &IndexMap::new(),
            &schema(),
        )
        .unwrap();
        assert_eq!(query.aggregates.len(), 2);
        assert_eq!(
            query.aggregates["avg_column_1"],
            "SELECT AVG(column_1) AS avg_column_1 FROM datagrid"
        );
        assert_eq!(
            query.from_clause(),
            "datagrid, (SELECT AVG(column_1) AS avg_column_1 FROM datagrid), \
             (SELECT MAX(column_2) AS max_column_2 FROM datagrid)"
        );
        let sql = query.where_sql.unwrap();
        assert_eq!(sql.matches("avg_column_1").count(), 1);
        assert_eq!(sql.matches("max_column_2").count(), 1);
    }

    #[test]
    fn test_computed_columns_unify_in_order() {
        let computed = IndexMap::from([
            ("X".to_string(), "{'A'} + {'B'}".to_string()),
            ("Y".to_string(), "{'X'} * 2".to_string()),
        ]);
        let query = compile(Some("{'Y'} > 4"), &computed, &schema()).unwrap();
        assert_eq!(query.computed["X"].field_name, "cc0");
        assert_eq!(query.computed["Y"].field_expr, "((column_1 + column_2) * 2)");
        assert_eq!(query.computed["Y"].column_type, Some(ColumnType::Integer));
        assert_eq!(query.where_sql.unwrap(), "(((column_1 + column_2) * 2) > 4)");

        let forward = IndexMap::from([
            ("Y".to_string(), "{'X'} * 2".to_string()),
            ("X".to_string(), "{'A'}".to_string()),
        ]);
        assert!(compile(None, &forward, &schema()).is_err());
    }

    #[test]
    fn test_comprehension() {
        let sql = where_sql("len([x for x in {'meta'}.labels if x != {'name'}]) > 0");
        assert!(sql.starts_with("(py_len(CAST((py_comprehension('"));
        assert!(sql.ends_with(
            "CAST((column_4 -> '$.labels') AS BLOB), column_3) -> '$') AS BLOB)) > 0)"
        ));
    }

    #[test]
    fn test_compile_errors_name_fragment() {
        let schema = schema();
        let err = compile(Some("{'missing'} > 1"), &IndexMap::new(), &schema).unwrap_err();
        match err {
            DgError::QueryCompile { fragment, .. } => assert_eq!(fragment, "{'missing'}"),
            other => panic!("unexpected error {:?}", other),
        }
        for source in [
            "AVG({'A'} + 1) > 1",
            "os.system('x')",
            "{'A'}.year",
            "[y for x in {'meta'}]",
            "[[y for y in x] for x in {'meta'}]",
            "[AVG({'A'}) for x in {'meta'}]",
            "{'A'} >",
        ] {
            assert!(verify_where(source, &IndexMap::new(), &schema).is_err(), "{}", source);
        }
        assert!(verify_where("{'A'} > 1", &IndexMap::new(), &schema).is_ok());
    }

    #[test]
    fn test_empty_where() {
        let query = compile(Some("  "), &IndexMap::new(), &schema()).unwrap();
        assert_eq!(query.where_sql, None);
        assert_eq!(query.where_clause(), "");
        assert_eq!(query.from_clause(), "datagrid");
    }
}
