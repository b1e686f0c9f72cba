//! Stored reference images used by generate-from-reference steps.

use cf_core::{Error, ImageId, Result};
use rusqlite::{params, Connection, OptionalExtension};

use super::now;
use crate::models::ReferenceImageRecord;

const COLS: &str = "id, url, label, created_at";

/// Store a new reference image.
pub fn create_reference_image(
    conn: &Connection,
    url: &str,
    label: Option<&str>,
) -> Result<ReferenceImageRecord> {
    let id = ImageId::new();
    let now = now();

    conn.execute(
        "INSERT INTO reference_images (id, url, label, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![id.to_string(), url, label, &now],
    )
    .map_err(|e| Error::database(e.to_string()))?;

    Ok(ReferenceImageRecord {
        id,
        url: url.to_string(),
        label: label.map(String::from),
        created_at: now,
    })
}

/// Get a reference image by ID.
pub fn get_reference_image(conn: &Connection, id: ImageId) -> Result<Option<ReferenceImageRecord>> {
    let q = format!("SELECT {COLS} FROM reference_images WHERE id = ?1");
    conn.query_row(&q, [id.to_string()], ReferenceImageRecord::from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))
}

/// All reference images, newest first.
pub fn list_reference_images(conn: &Connection) -> Result<Vec<ReferenceImageRecord>> {
    let q = format!("SELECT {COLS} FROM reference_images ORDER BY created_at DESC, rowid DESC");
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([], ReferenceImageRecord::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}
