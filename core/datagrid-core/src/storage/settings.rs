//! Per-grid settings persisted in the `settings` table

use crate::error::DgResult;
use crate::storage::sqlite::FORMAT_VERSION;
use crate::types::DEFAULT_DATETIME_FORMAT;
use rusqlite::{Connection, OptionalExtension, params};

pub const KEY_HEURISTICS: &str = "heuristics";
pub const KEY_DATETIME_FORMAT: &str = "datetime_format";
pub const KEY_DISPLAY_NAME: &str = "display_name";
pub const KEY_PREGENERATE_THUMBNAILS: &str = "pregenerate_thumbnails";
pub const KEY_ABOUT: &str = "about";
pub const KEY_NEXT_FIELD: &str = "next_field";
pub const KEY_VERSION: &str = "version";

/// Grid-level options
#[derive(Debug, Clone, PartialEq)]
pub struct GridSettings {
    /// Parse text input into booleans, numbers and datetimes
    pub heuristics: bool,
    pub datetime_format: String,
    pub display_name: Option<String>,
    /// Generate raster thumbnails when assets are logged
    pub pregenerate_thumbnails: bool,
    /// Free-text (markdown) description
    pub about: Option<String>,
}

impl Default for GridSettings {
    fn default() -> Self {
        Self {
            heuristics: false,
            datetime_format: DEFAULT_DATETIME_FORMAT.to_string(),
            display_name: None,
            pregenerate_thumbnails: false,
            about: None,
        }
    }
}

impl GridSettings {
    pub fn with_heuristics(mut self, enabled: bool) -> Self {
        self.heuristics = enabled;
        self
    }

    pub fn with_datetime_format(mut self, format: impl Into<String>) -> Self {
        self.datetime_format = format.into();
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_pregenerate_thumbnails(mut self, enabled: bool) -> Self {
        self.pregenerate_thumbnails = enabled;
        self
    }

    pub fn with_about(mut self, about: impl Into<String>) -> Self {
        self.about = Some(about.into());
        self
    }

    pub fn load(conn: &Connection) -> DgResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            heuristics: get(conn, KEY_HEURISTICS)?.map_or(defaults.heuristics, |v| v == "true"),
            datetime_format: get(conn, KEY_DATETIME_FORMAT)?.unwrap_or(defaults.datetime_format),
            display_name: get(conn, KEY_DISPLAY_NAME)?,
            pregenerate_thumbnails: get(conn, KEY_PREGENERATE_THUMBNAILS)?
                .map_or(defaults.pregenerate_thumbnails, |v| v == "true"),
            about: get(conn, KEY_ABOUT)?,
        })
    }

    pub fn store(&self, conn: &Connection) -> DgResult<()> {
        set(conn, KEY_HEURISTICS, Some(&self.heuristics.to_string()))?;
        set(conn, KEY_DATETIME_FORMAT, Some(&self.datetime_format))?;
        set(conn, KEY_DISPLAY_NAME, self.display_name.as_deref())?;
        set(
            conn,
            KEY_PREGENERATE_THUMBNAILS,
            Some(&self.pregenerate_thumbnails.to_string()),
        )?;
        set(conn, KEY_ABOUT, self.about.as_deref())?;
        set(conn, KEY_VERSION, Some(FORMAT_VERSION))?;
        Ok(())
    }
}

pub fn get(conn: &Connection, name: &str) -> DgResult<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM settings WHERE name = ?1",
            params![name],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?;
    Ok(value.flatten())
}

pub fn set(conn: &Connection, name: &str, value: Option<&str>) -> DgResult<()> {
    conn.execute(
        "INSERT INTO settings (name, value) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET value = excluded.value",
        params![name, value],
    )?;
    Ok(())
}
