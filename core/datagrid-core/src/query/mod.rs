//! Expression language: tokenizer, parser, SQL compiler and interpreter
//!
//! ```text
//! source → tokenize → parse → Expr ─┬→ compile → SQL fragments + aggregate views
//!                                   └→ evaluate (comprehensions, inside SQLite)
//! ```

pub mod ast;
pub mod compiler;
pub mod functions;
pub mod interpreter;
pub mod parser;
pub mod token;

pub use ast::{BinaryOp, CompareOp, Expr, Literal, UnaryOp};
pub use compiler::{
    CompiledExpression, CompiledQuery, ComputedColumn, compile, compile_expression,
    unify_computed_columns, verify_where,
};
pub use functions::register_functions;
pub use interpreter::{Env, evaluate};
pub use parser::parse;
