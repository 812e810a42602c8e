//! Column types and the unification lattice

use crate::error::{DgError, DgResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Suffix carried by every asset column type (`IMAGE-ASSET`, `CURVE-ASSET`, ...).
pub const ASSET_TYPE_SUFFIX: &str = "-ASSET";

/// Closed set of column types plus the open `<Kind>-ASSET` family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ColumnType {
    Boolean,
    Integer,
    Float,
    Text,
    Datetime,
    Json,
    Vector,
    RowId,
    /// Asset column; holds the canonical kind name (`Image`, `Curve`, ...)
    Asset(String),
}

impl ColumnType {
    /// Builds an asset column type from any spelling of the kind name.
    pub fn asset(kind: &str) -> Self {
        ColumnType::Asset(canonical_kind(kind))
    }

    pub fn is_asset(&self) -> bool {
        matches!(self, ColumnType::Asset(_))
    }

    pub fn asset_kind(&self) -> Option<&str> {
        match self {
            ColumnType::Asset(kind) => Some(kind),
            _ => None,
        }
    }

    /// Types whose stored representation is a number.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ColumnType::Boolean
                | ColumnType::Integer
                | ColumnType::Float
                | ColumnType::Datetime
                | ColumnType::RowId
        )
    }

    /// Types stored as JSON text.
    pub fn is_json(&self) -> bool {
        matches!(self, ColumnType::Json | ColumnType::Vector)
    }

    /// SQLite column affinity used when creating the physical table.
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Boolean | ColumnType::Integer => "INTEGER",
            ColumnType::RowId => "INTEGER PRIMARY KEY",
            ColumnType::Float | ColumnType::Datetime => "FLOAT",
            ColumnType::Json | ColumnType::Vector => "JSON",
            ColumnType::Text | ColumnType::Asset(_) => "TEXT",
        }
    }

    /// Position in the normalisation order used by [`unify`].
    fn rank(&self) -> u8 {
        match self {
            ColumnType::Boolean => 0,
            ColumnType::Integer => 1,
            ColumnType::Float => 2,
            ColumnType::Datetime => 3,
            ColumnType::Text => 4,
            ColumnType::Json => 5,
            ColumnType::Vector => 6,
            ColumnType::RowId => 7,
            ColumnType::Asset(_) => 8,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Boolean => write!(f, "BOOLEAN"),
            ColumnType::Integer => write!(f, "INTEGER"),
            ColumnType::Float => write!(f, "FLOAT"),
            ColumnType::Text => write!(f, "TEXT"),
            ColumnType::Datetime => write!(f, "DATETIME"),
            ColumnType::Json => write!(f, "JSON"),
            ColumnType::Vector => write!(f, "VECTOR"),
            ColumnType::RowId => write!(f, "ROW_ID"),
            ColumnType::Asset(kind) => write!(f, "{}{}", kind.to_uppercase(), ASSET_TYPE_SUFFIX),
        }
    }
}

impl FromStr for ColumnType {
    type Err = DgError;

    fn from_str(s: &str) -> DgResult<Self> {
        let upper = s.trim().to_uppercase();
        match upper.as_str() {
            "BOOLEAN" => Ok(ColumnType::Boolean),
            "INTEGER" => Ok(ColumnType::Integer),
            "FLOAT" => Ok(ColumnType::Float),
            "TEXT" => Ok(ColumnType::Text),
            "DATETIME" => Ok(ColumnType::Datetime),
            "JSON" => Ok(ColumnType::Json),
            "VECTOR" => Ok(ColumnType::Vector),
            "ROW_ID" => Ok(ColumnType::RowId),
            other => match other.strip_suffix(ASSET_TYPE_SUFFIX) {
                Some(kind) if !kind.is_empty() => Ok(ColumnType::asset(kind)),
                _ => Err(DgError::Schema(format!("unknown column type '{}'", s))),
            },
        }
    }
}

impl From<ColumnType> for String {
    fn from(value: ColumnType) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for ColumnType {
    type Error = DgError;

    fn try_from(value: String) -> DgResult<Self> {
        value.parse()
    }
}

/// `image`, `IMAGE` and `Image` all name the same asset kind.
pub fn canonical_kind(kind: &str) -> String {
    let mut chars = kind.trim().chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(|c| c.to_lowercase()))
            .collect(),
        None => String::new(),
    }
}

/// Join of two inferred types; `None` is the NULL type.
///
/// The lattice: NULL is bottom, TEXT is top, and the only non-trivial joins
/// below TEXT are
///
/// | pair | join |
/// |------|------|
/// | FLOAT, INTEGER | FLOAT |
/// | JSON, VECTOR | JSON |
/// | BOOLEAN, INTEGER | BOOLEAN |
/// | DATETIME, INTEGER | DATETIME |
/// | DATETIME, FLOAT | DATETIME |
///
/// Pairs are ordered by rank before matching, so the join is commutative,
/// and equal inputs short-circuit, so it is idempotent.
pub fn unify(a: Option<&ColumnType>, b: Option<&ColumnType>) -> Option<ColumnType> {
    match (a, b) {
        (None, None) => None,
        (Some(t), None) | (None, Some(t)) => Some(t.clone()),
        (Some(a), Some(b)) => Some(join(a, b)),
    }
}

fn join(a: &ColumnType, b: &ColumnType) -> ColumnType {
    if a == b {
        return a.clone();
    }
    let (lo, hi) = if a.rank() <= b.rank() { (a, b) } else { (b, a) };
    match (lo, hi) {
        (ColumnType::Integer, ColumnType::Float) => ColumnType::Float,
        (ColumnType::Json, ColumnType::Vector) => ColumnType::Json,
        (ColumnType::Boolean, ColumnType::Integer) => ColumnType::Boolean,
        (ColumnType::Integer, ColumnType::Datetime) | (ColumnType::Float, ColumnType::Datetime) => {
            ColumnType::Datetime
        }
        _ => ColumnType::Text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_types() -> Vec<ColumnType> {
        vec![
            ColumnType::Boolean,
            ColumnType::Integer,
            ColumnType::Float,
            ColumnType::Text,
            ColumnType::Datetime,
            ColumnType::Json,
            ColumnType::Vector,
            ColumnType::RowId,
            ColumnType::asset("image"),
            ColumnType::asset("curve"),
        ]
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("integer".parse::<ColumnType>().unwrap(), ColumnType::Integer);
        assert_eq!(
            "Image-Asset".parse::<ColumnType>().unwrap(),
            ColumnType::Asset("Image".to_string())
        );
        assert_eq!(ColumnType::asset("IMAGE").to_string(), "IMAGE-ASSET");
        assert_eq!(ColumnType::RowId.to_string(), "ROW_ID");
        assert!("-ASSET".parse::<ColumnType>().is_err());
        assert!("DECIMAL".parse::<ColumnType>().is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&ColumnType::asset("curve")).unwrap();
        assert_eq!(json, "\"CURVE-ASSET\"");
        let back: ColumnType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ColumnType::asset("Curve"));
    }

    #[test]
    fn test_unify_rules() {
        use ColumnType::*;
        assert_eq!(unify(None, Some(&Integer)), Some(Integer));
        assert_eq!(unify(None, None), None);
        assert_eq!(unify(Some(&Float), Some(&Integer)), Some(Float));
        assert_eq!(unify(Some(&Vector), Some(&Json)), Some(Json));
        assert_eq!(unify(Some(&Integer), Some(&Boolean)), Some(Boolean));
        assert_eq!(unify(Some(&Datetime), Some(&Integer)), Some(Datetime));
        assert_eq!(unify(Some(&Float), Some(&Datetime)), Some(Datetime));
        assert_eq!(unify(Some(&Boolean), Some(&Float)), Some(Text));
        assert_eq!(unify(Some(&Json), Some(&Integer)), Some(Text));
        assert_eq!(
            unify(Some(&ColumnType::asset("image")), Some(&ColumnType::asset("audio"))),
            Some(Text)
        );
    }

    #[test]
    fn test_unify_commutative_and_idempotent() {
        let types = all_types();
        for a in &types {
            assert_eq!(unify(Some(a), Some(a)).as_ref(), Some(a));
            for b in &types {
                assert_eq!(unify(Some(a), Some(b)), unify(Some(b), Some(a)));
            }
        }
    }

    #[test]
    fn test_sql_types() {
        assert_eq!(ColumnType::RowId.sql_type(), "INTEGER PRIMARY KEY");
        assert_eq!(ColumnType::Datetime.sql_type(), "FLOAT");
        assert_eq!(ColumnType::asset("image").sql_type(), "TEXT");
    }
}
