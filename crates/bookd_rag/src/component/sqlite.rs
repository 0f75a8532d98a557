//! SQL plumbing for the durable chunk/document store.
//!
//! The vector index keys rows by `vec_key` (the sqlite rowid), so upserting
//! an existing chunk id keeps its key stable and the ANN entry replaceable.

use anyhow::{Context, Result};
use rusqlite::Connection;

use super::operation::{Chunk, Document};

refinery::embed_migrations!("migration");

pub(crate) fn run_migrations(conn: &mut Connection) -> Result<()> {
    migrations::runner().run(conn)?;
    Ok(())
}

fn to_binary(v: &[f32]) -> Vec<u8> {
    let mut res = Vec::with_capacity(v.len() * 4);
    for x in v {
        res.extend_from_slice(&x.to_le_bytes());
    }
    res
}

fn to_f32(bytes: &[u8]) -> Vec<f32> {
    let mut res = Vec::with_capacity(bytes.len() / 4);
    for i in 0..bytes.len() / 4 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&bytes[i * 4..(i + 1) * 4]);
        res.push(f32::from_le_bytes(buf));
    }
    res
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, Chunk)> {
    let embedding: Vec<u8> = row.get(8)?;
    Ok((
        row.get(0)?,
        Chunk {
            id: row.get(1)?,
            document_id: row.get(2)?,
            chunk_index: row.get::<_, i64>(3)? as usize,
            start_char: row.get::<_, i64>(4)? as usize,
            end_char: row.get::<_, i64>(5)? as usize,
            page_number: row.get(6)?,
            text: row.get(7)?,
            embedding: Some(to_f32(&embedding)),
        },
    ))
}

const CHUNK_COLUMNS: &str =
    "vec_key, chunk_id, document_id, chunk_index, start_char, end_char, page_number, content, embedding";

pub(crate) fn upsert_document(conn: &mut Connection, doc: &Document) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO document \
         (id, file_path, title, author, page_count, file_size, text_content, processed) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &doc.id,
            &doc.file_path,
            &doc.title,
            &doc.author,
            doc.page_count,
            doc.file_size,
            &doc.text_content,
            doc.processed,
        ),
    )
    .with_context(|| format!("failed to upsert document {}", doc.id))?;
    Ok(())
}

pub(crate) fn query_document_by_id(conn: &mut Connection, id: &str) -> Result<Option<Document>> {
    let mut stmt = conn.prepare(
        "SELECT id, file_path, title, author, page_count, file_size, text_content, processed \
         FROM document WHERE id = ?",
    )?;
    let mut rows = stmt.query_map([id], |row| {
        Ok(Document {
            id: row.get(0)?,
            file_path: row.get(1)?,
            title: row.get(2)?,
            author: row.get(3)?,
            page_count: row.get(4)?,
            file_size: row.get(5)?,
            text_content: row.get(6)?,
            processed: row.get(7)?,
        })
    })?;
    rows.next().transpose().with_context(|| "document lookup failed")
}

/// Insert or replace a chunk row, keeping its `vec_key` stable on replace.
/// Returns the key and whether an existing row was overwritten.
pub(crate) fn upsert_chunk(conn: &mut Connection, chunk: &Chunk, embedding: &[f32]) -> Result<(i64, bool)> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT vec_key FROM chunk WHERE chunk_id = ?",
            [&chunk.id],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|err| match err {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    match existing {
        Some(key) => {
            conn.execute(
                "UPDATE chunk SET document_id = ?, chunk_index = ?, start_char = ?, \
                 end_char = ?, page_number = ?, content = ?, embedding = ? WHERE vec_key = ?",
                (
                    &chunk.document_id,
                    chunk.chunk_index as i64,
                    chunk.start_char as i64,
                    chunk.end_char as i64,
                    chunk.page_number,
                    &chunk.text,
                    to_binary(embedding),
                    key,
                ),
            )
            .with_context(|| format!("failed to update chunk {}", chunk.id))?;
            Ok((key, true))
        }
        None => {
            conn.execute(
                "INSERT INTO chunk \
                 (chunk_id, document_id, chunk_index, start_char, end_char, page_number, content, embedding) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    &chunk.id,
                    &chunk.document_id,
                    chunk.chunk_index as i64,
                    chunk.start_char as i64,
                    chunk.end_char as i64,
                    chunk.page_number,
                    &chunk.text,
                    to_binary(embedding),
                ),
            )
            .with_context(|| format!("failed to insert chunk {}", chunk.id))?;
            Ok((conn.last_insert_rowid(), false))
        }
    }
}

pub(crate) fn query_chunks_by_keys(conn: &mut Connection, keys: &[i64]) -> Result<Vec<(i64, Chunk)>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHUNK_COLUMNS} FROM chunk WHERE vec_key = ?"
    ))?;
    let mut out = Vec::with_capacity(keys.len());
    for key in keys {
        let mut rows = stmt.query_map([key], row_to_chunk)?;
        if let Some(row) = rows.next().transpose()? {
            out.push(row);
        }
    }
    Ok(out)
}

pub(crate) fn query_chunks_by_chunk_ids(
    conn: &mut Connection,
    chunk_ids: &[String],
) -> Result<Vec<Chunk>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHUNK_COLUMNS} FROM chunk WHERE chunk_id = ?"
    ))?;
    let mut out = Vec::with_capacity(chunk_ids.len());
    for chunk_id in chunk_ids {
        let mut rows = stmt.query_map([chunk_id], row_to_chunk)?;
        if let Some((_, chunk)) = rows.next().transpose()? {
            out.push(chunk);
        }
    }
    Ok(out)
}

pub(crate) fn query_all_chunks(conn: &mut Connection) -> Result<Vec<(i64, Chunk)>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHUNK_COLUMNS} FROM chunk ORDER BY vec_key"
    ))?;
    let rows = stmt.query_map([], row_to_chunk)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub(crate) fn query_chunks_by_document(
    conn: &mut Connection,
    document_id: &str,
) -> Result<Vec<(i64, Chunk)>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHUNK_COLUMNS} FROM chunk WHERE document_id = ? ORDER BY vec_key"
    ))?;
    let rows = stmt.query_map([document_id], row_to_chunk)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Delete a document's chunks, returning the vector-index keys they held.
pub(crate) fn delete_chunks_by_document(
    conn: &mut Connection,
    document_id: &str,
) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare("DELETE FROM chunk WHERE document_id = ? RETURNING vec_key")?;
    let rows = stmt.query_map([document_id], |row| row.get::<_, i64>(0))?;
    let mut keys = Vec::new();
    for row in rows {
        keys.push(row?);
    }
    conn.execute("DELETE FROM document WHERE id = ?", [document_id])?;
    Ok(keys)
}

pub(crate) fn clear_all(conn: &mut Connection) -> Result<()> {
    conn.execute("DELETE FROM chunk", [])?;
    conn.execute("DELETE FROM document", [])?;
    Ok(())
}

pub(crate) fn count_chunks(conn: &mut Connection) -> Result<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM chunk", [], |row| row.get(0))?;
    Ok(count as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::operation::Document;

    fn chunk(id: &str, doc: &str, index: usize) -> Chunk {
        Chunk {
            id: id.to_string(),
            document_id: doc.to_string(),
            text: format!("chunk {index}"),
            chunk_index: index,
            start_char: index * 10,
            end_char: index * 10 + 8,
            page_number: None,
            embedding: None,
        }
    }

    #[test]
    fn test_in_mem_migration() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
    }

    #[test]
    fn test_upsert_chunk_keeps_key() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        let c = chunk("d1:0", "d1", 0);
        let (key_a, replaced_a) = upsert_chunk(&mut conn, &c, &[1.0, 0.0]).unwrap();
        let (key_b, replaced_b) = upsert_chunk(&mut conn, &c, &[0.0, 1.0]).unwrap();
        assert_eq!(key_a, key_b);
        assert!(!replaced_a);
        assert!(replaced_b);
        assert_eq!(count_chunks(&mut conn).unwrap(), 1);
        let rows = query_all_chunks(&mut conn).unwrap();
        assert_eq!(rows[0].1.embedding.as_deref(), Some(&[0.0, 1.0][..]));
    }

    #[test]
    fn test_delete_by_document_returns_keys() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        upsert_chunk(&mut conn, &chunk("a:0", "a", 0), &[1.0]).unwrap();
        upsert_chunk(&mut conn, &chunk("a:1", "a", 1), &[1.0]).unwrap();
        upsert_chunk(&mut conn, &chunk("b:0", "b", 0), &[1.0]).unwrap();
        let keys = delete_chunks_by_document(&mut conn, "a").unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(count_chunks(&mut conn).unwrap(), 1);
    }

    #[test]
    fn test_document_roundtrip() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        let doc = Document::new("manual", "some text");
        upsert_document(&mut conn, &doc).unwrap();
        let loaded = query_document_by_id(&mut conn, &doc.id).unwrap().unwrap();
        assert_eq!(loaded.title, "manual");
        assert_eq!(loaded.text_content, "some text");
        assert!(query_document_by_id(&mut conn, "missing").unwrap().is_none());
    }
}
