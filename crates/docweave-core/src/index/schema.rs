//! SQLite layout of an index store
//!
//! One object store table keyed by document id holds the filtered document
//! as JSON. Every index key gets an expression index over
//! `json_extract(doc, '$."<field>"')`. The schema version lives in
//! `store_meta`; the set of sub-indices is read back from `sqlite_master`.

use std::collections::BTreeSet;

use rusqlite::{Connection, OptionalExtension, Result};

/// Table holding the index records
pub const OBJECT_STORE: &str = "index_store";

const INDEX_PREFIX: &str = "idx_";

/// What an index store currently looks like on disk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreLayout {
    /// Stored schema version, `None` for a new database
    pub version: Option<u32>,
    /// Whether the object store table exists
    pub object_store: bool,
    /// Fields that currently have a sub-index
    pub indexes: BTreeSet<String>,
}

/// Create the metadata table if needed
pub fn init_meta(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS store_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )
}

/// Read version, object store presence and sub-indices
pub fn read_layout(conn: &Connection) -> Result<StoreLayout> {
    let version: Option<String> = conn
        .query_row(
            "SELECT value FROM store_meta WHERE key = 'version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    let object_store = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")?
        .exists([OBJECT_STORE])?;

    let indexes = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = ?1")?
        .query_map([OBJECT_STORE], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .filter_map(|name| name.strip_prefix(INDEX_PREFIX).map(str::to_string))
        .collect();

    Ok(StoreLayout {
        version: version.and_then(|v| v.parse().ok()),
        object_store,
        indexes,
    })
}

pub fn set_version(conn: &Connection, version: u32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO store_meta (key, value) VALUES ('version', ?1)",
        [version.to_string()],
    )?;
    Ok(())
}

pub fn create_object_store(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE {} (id TEXT PRIMARY KEY NOT NULL, doc TEXT NOT NULL);",
        OBJECT_STORE
    ))
}

/// Drop the object store together with all of its sub-indices
pub fn delete_object_store(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {};", OBJECT_STORE))
}

pub fn create_index(conn: &Connection, field: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE INDEX {} ON {} ({});",
        index_name(field),
        OBJECT_STORE,
        field_expr(field)
    ))
}

pub fn delete_index(conn: &Connection, field: &str) -> Result<()> {
    conn.execute_batch(&format!("DROP INDEX IF EXISTS {};", index_name(field)))
}

/// Quoted name of the sub-index of `field`
///
/// Index keys never contain `"`.
pub fn index_name(field: &str) -> String {
    format!("\"{}{}\"", INDEX_PREFIX, field)
}

/// Indexed expression for `field`
///
/// Queries must repeat it verbatim for SQLite to pick the sub-index.
pub fn field_expr(field: &str) -> String {
    format!("json_extract(doc, '$.\"{}\"')", field.replace('\'', "''"))
}

/// Ids whose `field` equals `?1` as text or `?2` as a number, in id order
///
/// Booleans, null, arrays and objects are excluded so the result agrees
/// with [`crate::query::field_matches`].
pub fn select_ids_by_field(field: &str) -> String {
    let expr = field_expr(field);
    format!(
        "SELECT id FROM {store} \
         WHERE {expr} IN (?1, ?2) \
         AND json_type(doc, '$.\"{path}\"') IN ('text', 'integer', 'real') \
         ORDER BY id",
        store = OBJECT_STORE,
        expr = expr,
        path = field.replace('\'', "''"),
    )
}
