//! SQLite adapter: connection opening, DDL and the physical table layout
//!
//! Every engine operation opens its own connection through [`open`] and drops
//! it when done. Opening registers the full function set the expression
//! compiler can emit, so compiled SQL runs on any connection from here.

use crate::error::{DgError, DgResult};
use crate::query::functions;
use crate::types::{Column, Schema};
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

pub const DATAGRID_TABLE: &str = "datagrid";
pub const METADATA_TABLE: &str = "metadata";
pub const ASSETS_TABLE: &str = "assets";
pub const SETTINGS_TABLE: &str = "settings";

/// File extension of grid files.
pub const FILE_EXTENSION: &str = "datagrid";
/// On-disk format version written to `settings`.
pub const FORMAT_VERSION: &str = "1";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const CATALOG_DDL: &str = r#"
    CREATE TABLE IF NOT EXISTS metadata (
        name TEXT PRIMARY KEY,
        field_name TEXT NOT NULL,
        type TEXT NOT NULL,
        minimum FLOAT,
        maximum FLOAT,
        average FLOAT,
        variance FLOAT,
        total FLOAT,
        stddev FLOAT,
        other JSON
    );

    CREATE TABLE IF NOT EXISTS assets (
        asset_id TEXT PRIMARY KEY,
        asset_type TEXT NOT NULL,
        asset_data BLOB,
        asset_metadata JSON,
        asset_thumbnail BLOB
    );

    CREATE TABLE IF NOT EXISTS settings (
        name TEXT PRIMARY KEY,
        value TEXT
    );
"#;

/// Opens an existing grid file.
pub fn open(path: impl AsRef<Path>) -> DgResult<Connection> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(DgError::FileNotFound(path.to_path_buf()));
    }
    let conn = Connection::open(path)?;
    configure(&conn)?;
    Ok(conn)
}

/// Creates a fresh grid file with the catalog tables, replacing any file
/// already at `path`.
pub fn create(path: impl AsRef<Path>, schema: &Schema) -> DgResult<Connection> {
    let path = path.as_ref();
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    configure(&conn)?;
    conn.execute_batch(CATALOG_DDL)?;
    conn.execute_batch(&create_table_sql(schema))?;
    Ok(conn)
}

/// In-memory connection with the function set, used for compile checks and
/// tests.
pub fn open_in_memory() -> DgResult<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> DgResult<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    functions::register_functions(conn)?;
    Ok(())
}

/// `column_3 FLOAT`
pub fn column_definition(column: &Column) -> String {
    format!("{} {}", column.field_name, column.column_type.sql_type())
}

pub fn create_table_sql(schema: &Schema) -> String {
    let fields: Vec<String> = schema.iter().map(column_definition).collect();
    format!("CREATE TABLE {} ({});", DATAGRID_TABLE, fields.join(", "))
}

/// Single-quoted SQL string literal.
pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColumnType;

    #[test]
    fn test_create_and_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("grid.datagrid");
        let mut schema = Schema::new();
        schema.add_column("a", ColumnType::Integer).unwrap();

        {
            let conn = create(&path, &schema).unwrap();
            conn.execute("INSERT INTO datagrid (column_0, column_1) VALUES (1, 5)", [])
                .unwrap();
        }
        let conn = open(&path).unwrap();
        let value: i64 = conn
            .query_row("SELECT column_1 FROM datagrid", [], |r| r.get(0))
            .unwrap();
        assert_eq!(value, 5);
    }

    #[test]
    fn test_open_missing_file() {
        let err = open("/definitely/not/here.datagrid").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_create_table_sql() {
        let mut schema = Schema::new();
        schema.add_column("img", ColumnType::asset("image")).unwrap();
        assert_eq!(
            create_table_sql(&schema),
            "CREATE TABLE datagrid (column_0 INTEGER PRIMARY KEY, column_1 TEXT, column_2 JSON);"
        );
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("it's"), "'it''s'");
    }
}
