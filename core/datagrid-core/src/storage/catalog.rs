//! Schema persistence in the `metadata` table
//!
//! One catalog row per logical column, in column order. The statistics
//! columns of the same table are owned by the statistics engine.

use crate::error::DgResult;
use crate::storage::settings::{self, KEY_NEXT_FIELD};
use crate::types::{Column, ColumnType, Schema};
use rusqlite::{Connection, params};

/// Writes every column of `schema` plus the field counter.
pub fn store_schema(conn: &Connection, schema: &Schema) -> DgResult<()> {
    for column in schema.iter() {
        insert_column(conn, column)?;
    }
    store_next_field(conn, schema)
}

pub fn insert_column(conn: &Connection, column: &Column) -> DgResult<()> {
    conn.execute(
        "INSERT INTO metadata (name, field_name, type) VALUES (?1, ?2, ?3)",
        params![column.name, column.field_name, column.column_type.to_string()],
    )?;
    Ok(())
}

pub fn delete_column(conn: &Connection, name: &str) -> DgResult<()> {
    conn.execute("DELETE FROM metadata WHERE name = ?1", params![name])?;
    Ok(())
}

pub fn store_next_field(conn: &Connection, schema: &Schema) -> DgResult<()> {
    settings::set(conn, KEY_NEXT_FIELD, Some(&schema.next_field().to_string()))
}

pub fn load_schema(conn: &Connection) -> DgResult<Schema> {
    let mut stmt = conn.prepare("SELECT name, field_name, type FROM metadata ORDER BY rowid")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    let mut columns = Vec::new();
    for row in rows {
        let (name, field_name, type_name) = row?;
        columns.push(Column {
            name,
            field_name,
            column_type: type_name.parse::<ColumnType>()?,
        });
    }

    let next_field = settings::get(conn, KEY_NEXT_FIELD)?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    Schema::from_columns(columns, next_field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite;

    #[test]
    fn test_schema_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut schema = Schema::new();
        schema.add_column("score", ColumnType::Float).unwrap();
        schema.add_column("img", ColumnType::asset("image")).unwrap();
        schema.add_column("tmp", ColumnType::Text).unwrap();
        schema.remove_column("tmp").unwrap();

        let conn = sqlite::create(dir.path().join("c.datagrid"), &schema).unwrap();
        store_schema(&conn, &schema).unwrap();

        let loaded = load_schema(&conn).unwrap();
        assert_eq!(loaded, schema);
        assert_eq!(loaded.next_field(), 5);
    }

    #[test]
    fn test_delete_column() {
        let dir = tempfile::tempdir().unwrap();
        let mut schema = Schema::new();
        schema.add_column("a", ColumnType::Integer).unwrap();
        let conn = sqlite::create(dir.path().join("d.datagrid"), &schema).unwrap();
        store_schema(&conn, &schema).unwrap();

        delete_column(&conn, "a").unwrap();
        assert_eq!(load_schema(&conn).unwrap().len(), 1);
    }
}
