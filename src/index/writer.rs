use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::checkpoint::{advance_cursor, Cursor};
use super::filename::{ParseFailure, ParsedName};
use super::walker::FileMetadata;
use crate::db::{format_recorded_at, format_timestamp};
use crate::error::Result;
use crate::jobs::{renew_lease, LeasePolicy};

/// A walked file with everything needed to write it
#[derive(Debug, Clone)]
pub struct PreparedFile {
    pub file: FileMetadata,
    pub parsed: std::result::Result<ParsedName, ParseFailure>,
    pub duration_ms: Option<i64>,
    pub playback_url: Option<String>,
}

/// Per-batch write counts
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchCounts {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub quarantined: usize,
}

/// The claim a batch is written under
#[derive(Debug, Clone, Copy)]
pub struct Fence<'a> {
    pub agent: &'a str,
    pub holder: &'a str,
    pub policy: &'a LeasePolicy,
}

/// Stable surrogate key for `(agent, path)`: hex SHA-256 of `agent \0 path`.
pub fn recording_id(agent: &str, path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(agent.as_bytes());
    hasher.update([0u8]);
    hasher.update(path.as_bytes());
    format!("{:x}", hasher.finalize())
}

enum Upsert {
    Inserted,
    Updated,
    Unchanged,
}

fn upsert_recording(
    conn: &Connection,
    agent: &str,
    prepared: &PreparedFile,
    name: &ParsedName,
    now: &str,
) -> Result<Upsert> {
    let file = &prepared.file;
    let existing: Option<(i64, bool)> = conn
        .query_row(
            "SELECT file_mtime_ns, deleted_at IS NOT NULL FROM recordings WHERE agent = ?1 AND path = ?2",
            params![agent, file.relative_path],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let recorded_at = format_recorded_at(&name.recorded_at);

    match existing {
        None => {
            conn.execute(
                r#"
                INSERT INTO recordings (
                    id, agent, service_group, other_party, description, call_id,
                    recorded_at, path, file_mtime_ns, file_size, duration_ms,
                    playback_url, deleted_at, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, NULL, ?13, ?13)
                "#,
                params![
                    recording_id(agent, &file.relative_path),
                    agent,
                    name.service_group,
                    name.other_party,
                    name.description,
                    name.call_id,
                    recorded_at,
                    file.relative_path,
                    file.mtime_ns,
                    file.file_size as i64,
                    prepared.duration_ms,
                    prepared.playback_url,
                    now,
                ],
            )?;
            Ok(Upsert::Inserted)
        }
        Some((stored_mtime, deleted)) if file.mtime_ns > stored_mtime || deleted => {
            if deleted {
                log::debug!("Reviving soft-deleted recording {}/{}", agent, file.relative_path);
            }
            conn.execute(
                r#"
                UPDATE recordings SET
                    service_group = ?3,
                    other_party = ?4,
                    description = ?5,
                    call_id = ?6,
                    recorded_at = ?7,
                    file_mtime_ns = ?8,
                    file_size = ?9,
                    duration_ms = ?10,
                    playback_url = ?11,
                    deleted_at = NULL,
                    updated_at = ?12
                WHERE agent = ?1 AND path = ?2
                "#,
                params![
                    agent,
                    file.relative_path,
                    name.service_group,
                    name.other_party,
                    name.description,
                    name.call_id,
                    recorded_at,
                    file.mtime_ns,
                    file.file_size as i64,
                    prepared.duration_ms,
                    prepared.playback_url,
                    now,
                ],
            )?;
            Ok(Upsert::Updated)
        }
        Some(_) => Ok(Upsert::Unchanged),
    }
}

fn upsert_quarantine(
    conn: &Connection,
    agent: &str,
    file: &FileMetadata,
    failure: &ParseFailure,
    now: &str,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO recording_quarantine (agent, path, file_mtime_ns, reason, detail, first_seen_at, last_seen_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
        ON CONFLICT(agent, path) DO UPDATE SET
            file_mtime_ns = excluded.file_mtime_ns,
            reason = excluded.reason,
            detail = excluded.detail,
            last_seen_at = excluded.last_seen_at
        "#,
        params![
            agent,
            file.relative_path,
            file.mtime_ns,
            failure.reason(),
            failure.to_string(),
            now,
        ],
    )?;
    Ok(())
}

/// Write one batch for the fenced agent in a single transaction.
///
/// Renews the job lease first (a lost claim aborts the batch), upserts every
/// file (parse failures go to quarantine), then advances the checkpoint
/// cursor to the batch's largest `(mtime, path)`. Any error rolls back the
/// whole batch and leaves the cursor where the previous batch put it.
pub fn write_batch(
    conn: &mut Connection,
    fence: Fence<'_>,
    batch: &[PreparedFile],
    now: DateTime<Utc>,
) -> Result<BatchCounts> {
    let mut counts = BatchCounts::default();
    if batch.is_empty() {
        return Ok(counts);
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    renew_lease(&tx, fence.agent, fence.holder, now, fence.policy)?;

    let now_s = format_timestamp(&now);
    let mut max_key: Option<Cursor> = None;

    for prepared in batch {
        match &prepared.parsed {
            Ok(name) => match upsert_recording(&tx, fence.agent, prepared, name, &now_s)? {
                Upsert::Inserted => counts.inserted += 1,
                Upsert::Updated => counts.updated += 1,
                Upsert::Unchanged => counts.unchanged += 1,
            },
            Err(failure) => {
                log::warn!(
                    "Quarantining {}/{}: {}",
                    fence.agent,
                    prepared.file.relative_path,
                    failure
                );
                upsert_quarantine(&tx, fence.agent, &prepared.file, failure, &now_s)?;
                counts.quarantined += 1;
            }
        }

        let key = prepared.file.key();
        if max_key.as_ref().map_or(true, |k| key > *k) {
            max_key = Some(key);
        }
    }

    if let Some(cursor) = &max_key {
        advance_cursor(&tx, fence.agent, cursor)?;
    }

    tx.commit()?;
    Ok(counts)
}
