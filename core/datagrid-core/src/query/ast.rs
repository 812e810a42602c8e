//! Expression AST
//!
//! The AST is also the program format of list comprehensions: the compiler
//! serializes a comprehension node to JSON and the interpreter evaluates it
//! inside SQLite.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    In,
    NotIn,
    Is,
    IsNot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(Literal),
    /// `{'Name'}`
    Column(String),
    /// Bare identifier: a comprehension variable or a namespace
    Name(String),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `a < b <= c`
    Compare {
        left: Box<Expr>,
        ops: Vec<CompareOp>,
        comparators: Vec<Expr>,
    },
    /// `body if test else orelse`
    IfElse {
        test: Box<Expr>,
        body: Box<Expr>,
        orelse: Box<Expr>,
    },
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Set(Vec<Expr>),
    Subscript {
        value: Box<Expr>,
        index: Box<Expr>,
    },
    Attribute {
        value: Box<Expr>,
        attr: String,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
    },
    /// `[element for target in iter if cond ...]`
    ListComp {
        element: Box<Expr>,
        target: String,
        iter: Box<Expr>,
        conditions: Vec<Expr>,
    },
}

impl Expr {
    pub fn int(value: i64) -> Self {
        Expr::Literal(Literal::Int(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Expr::Literal(Literal::Str(value.into()))
    }

    pub fn column(name: impl Into<String>) -> Self {
        Expr::Column(name.into())
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn compare(left: Expr, op: CompareOp, right: Expr) -> Self {
        Expr::Compare {
            left: Box::new(left),
            ops: vec![op],
            comparators: vec![right],
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Expr::Literal(_))
    }

    /// Calls `visit` on this node and every descendant, parents first.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Expr)) {
        visit(self);
        match self {
            Expr::Literal(_) | Expr::Column(_) | Expr::Name(_) => {}
            Expr::Unary { expr, .. } => expr.walk(visit),
            Expr::Binary { left, right, .. } => {
                left.walk(visit);
                right.walk(visit);
            }
            Expr::Compare {
                left, comparators, ..
            } => {
                left.walk(visit);
                comparators.iter().for_each(|c| c.walk(visit));
            }
            Expr::IfElse { test, body, orelse } => {
                test.walk(visit);
                body.walk(visit);
                orelse.walk(visit);
            }
            Expr::List(items) | Expr::Tuple(items) | Expr::Set(items) => {
                items.iter().for_each(|e| e.walk(visit))
            }
            Expr::Subscript { value, index } => {
                value.walk(visit);
                index.walk(visit);
            }
            Expr::Attribute { value, .. } => value.walk(visit),
            Expr::Call { func, args } => {
                func.walk(visit);
                args.iter().for_each(|e| e.walk(visit));
            }
            Expr::ListComp {
                element,
                iter,
                conditions,
                ..
            } => {
                element.walk(visit);
                iter.walk(visit);
                conditions.iter().for_each(|e| e.walk(visit));
            }
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Int(i) => write!(f, "{}", i),
            Literal::Float(x) if x.is_finite() && x.fract() == 0.0 => write!(f, "{:.1}", x),
            Literal::Float(x) => write!(f, "{}", x),
            Literal::Str(s) => write!(f, "'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Literal::Bool(true) => write!(f, "True"),
            Literal::Bool(false) => write!(f, "False"),
            Literal::None => write!(f, "None"),
        }
    }
}

impl UnaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::Pos => "+",
            UnaryOp::Not => "not ",
        }
    }
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "**",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }
}

impl CompareOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::NotEq => "!=",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
            CompareOp::In => "in",
            CompareOp::NotIn => "not in",
            CompareOp::Is => "is",
            CompareOp::IsNot => "is not",
        }
    }
}

fn comma_separated(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

/// Source form; compound expressions are fully parenthesized so the output
/// parses back to the same tree.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(lit) => write!(f, "{}", lit),
            Expr::Column(name) => write!(f, "{{'{}'}}", name.replace('\'', "\\'")),
            Expr::Name(name) => write!(f, "{}", name),
            Expr::Unary { op, expr } => write!(f, "({}{})", op.symbol(), expr),
            Expr::Binary { op, left, right } => {
                write!(f, "({} {} {})", left, op.symbol(), right)
            }
            Expr::Compare {
                left,
                ops,
                comparators,
            } => {
                write!(f, "({}", left)?;
                for (op, right) in ops.iter().zip(comparators) {
                    write!(f, " {} {}", op.symbol(), right)?;
                }
                write!(f, ")")
            }
            Expr::IfElse { test, body, orelse } => {
                write!(f, "({} if {} else {})", body, test, orelse)
            }
            Expr::List(items) => {
                write!(f, "[")?;
                comma_separated(f, items)?;
                write!(f, "]")
            }
            Expr::Tuple(items) => {
                write!(f, "(")?;
                comma_separated(f, items)?;
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Expr::Set(items) => {
                write!(f, "{{")?;
                comma_separated(f, items)?;
                write!(f, "}}")
            }
            Expr::Subscript { value, index } => write!(f, "{}[{}]", value, index),
            Expr::Attribute { value, attr } => write!(f, "{}.{}", value, attr),
            Expr::Call { func, args } => {
                write!(f, "{}(", func)?;
                comma_separated(f, args)?;
                write!(f, ")")
            }
            Expr::ListComp {
                element,
                target,
                iter,
                conditions,
            } => {
                write!(f, "[{} for {} in {}", element, target, iter)?;
                for cond in conditions {
                    write!(f, " if {}", cond)?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let expr = Expr::binary(
            BinaryOp::Add,
            Expr::column("A"),
            Expr::compare(Expr::int(1), CompareOp::NotIn, Expr::List(vec![Expr::int(2)])),
        );
        assert_eq!(expr.to_string(), "({'A'} + (1 not in [2]))");
        assert_eq!(Expr::Tuple(vec![Expr::int(1)]).to_string(), "(1,)");
        assert_eq!(Expr::string("it's").to_string(), "'it\\'s'");
    }

    #[test]
    fn test_walk_visits_all_nodes() {
        let expr = Expr::Call {
            func: Box::new(Expr::Name("len".into())),
            args: vec![Expr::column("a"), Expr::column("b")],
        };
        let mut columns = Vec::new();
        expr.walk(&mut |e| {
            if let Expr::Column(name) = e {
                columns.push(name.clone());
            }
        });
        assert_eq!(columns, vec!["a", "b"]);
    }

    #[test]
    fn test_serde_round_trip() {
        let expr = Expr::ListComp {
            element: Box::new(Expr::Name("x".into())),
            target: "x".into(),
            iter: Box::new(Expr::column("tags")),
            conditions: vec![],
        };
        let json = serde_json::to_string(&expr).unwrap();
        assert_eq!(serde_json::from_str::<Expr>(&json).unwrap(), expr);
    }
}
