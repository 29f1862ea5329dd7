//! Read side: filtered, paginated recording lookups. Never touches the filesystem.

pub mod health;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::db::{format_recorded_at, parse_recorded_at, Db};
use crate::error::{CallIndexError, Result};

pub use health::{agent_health, AgentHealth};

pub const DEFAULT_LIMIT: usize = 50;
pub const MAX_LIMIT: usize = 500;

/// Recording search request. Absent or empty filters match everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordingQuery {
    pub agent: String,
    /// First day included (UTC).
    pub from: Option<NaiveDate>,
    /// Last day included (UTC).
    pub to: Option<NaiveDate>,
    /// Other party, exact match ignoring ASCII case.
    pub participant: Option<String>,
    pub service_group: Option<String>,
    pub call_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Opaque keyset cursor from a previous page's `next_cursor`.
    pub cursor: Option<String>,
}

/// Recording projection returned to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recording {
    pub id: String,
    pub agent: String,
    pub service_group: Option<String>,
    pub other_party: Option<String>,
    pub description: Option<String>,
    pub call_id: String,
    pub recorded_at: NaiveDateTime,
    pub path: String,
    pub file_size: i64,
    pub duration_ms: Option<i64>,
    pub playback_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingPage {
    pub records: Vec<Recording>,
    /// Matches across all pages.
    pub total: usize,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

/// Position after the last row of a page: `(recorded_at, id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PageCursor {
    recorded_at: String,
    id: String,
}

impl PageCursor {
    fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}|{}", self.recorded_at, self.id))
    }

    fn decode(token: &str) -> Result<Self> {
        let invalid = || CallIndexError::InvalidInput(format!("invalid cursor: {:?}", token));
        let bytes = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
        let text = String::from_utf8(bytes).map_err(|_| invalid())?;
        let (recorded_at, id) = text.split_once('|').ok_or_else(invalid)?;
        parse_recorded_at(recorded_at).map_err(|_| invalid())?;
        if id.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            recorded_at: recorded_at.to_string(),
            id: id.to_string(),
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Validated form of [`RecordingQuery`] with bounds as stored text
#[derive(Debug)]
struct Filters {
    agent: String,
    from: Option<String>,
    until: Option<String>,
    participant: Option<String>,
    service_group: Option<String>,
    call_id: Option<String>,
    limit: usize,
    offset: i64,
    cursor: Option<PageCursor>,
}

impl Filters {
    fn from_query(query: &RecordingQuery) -> Result<Self> {
        if query.agent.trim().is_empty() {
            return Err(CallIndexError::InvalidInput("agent is required".to_string()));
        }
        if let (Some(from), Some(to)) = (query.from, query.to) {
            if from > to {
                return Err(CallIndexError::InvalidInput(format!(
                    "date range is empty: from {} is after to {}",
                    from, to
                )));
            }
        }
        let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
        if limit == 0 {
            return Err(CallIndexError::InvalidInput("limit must be at least 1".to_string()));
        }
        let cursor = query.cursor.as_deref().map(PageCursor::decode).transpose()?;
        if cursor.is_some() && query.offset.unwrap_or(0) > 0 {
            return Err(CallIndexError::InvalidInput(
                "offset and cursor cannot be combined".to_string(),
            ));
        }

        let offset = i64::try_from(query.offset.unwrap_or(0)).map_err(|_| {
            CallIndexError::InvalidInput(format!("offset out of range: {}", query.offset.unwrap_or(0)))
        })?;

        let day_start = |d: NaiveDate| d.and_hms_opt(0, 0, 0).map(|t| format_recorded_at(&t));

        Ok(Self {
            agent: query.agent.trim().to_string(),
            from: query.from.and_then(day_start),
            // Exclusive upper bound: start of the day after `to`.
            until: query.to.and_then(|d| d.succ_opt()).and_then(day_start),
            participant: non_empty(&query.participant),
            service_group: non_empty(&query.service_group),
            call_id: non_empty(&query.call_id),
            limit: limit.min(MAX_LIMIT),
            offset,
            cursor,
        })
    }
}

const FILTER_SQL: &str = r#"
    agent = ?1
    AND deleted_at IS NULL
    AND (?2 IS NULL OR recorded_at >= ?2)
    AND (?3 IS NULL OR recorded_at < ?3)
    AND (?4 IS NULL OR other_party = ?4 COLLATE NOCASE)
    AND (?5 IS NULL OR service_group = ?5 COLLATE NOCASE)
    AND (?6 IS NULL OR call_id = ?6)
"#;

/// Run a query on an open connection.
pub fn query_recordings(conn: &Connection, query: &RecordingQuery) -> Result<RecordingPage> {
    let f = Filters::from_query(query)?;

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM recordings WHERE {}", FILTER_SQL),
        params![f.agent, f.from, f.until, f.participant, f.service_group, f.call_id],
        |row| row.get(0),
    )?;

    let (cursor_at, cursor_id) = match &f.cursor {
        Some(c) => (Some(c.recorded_at.clone()), Some(c.id.clone())),
        None => (None, None),
    };

    let sql = format!(
        r#"
        SELECT id, agent, service_group, other_party, description, call_id,
               recorded_at, path, file_size, duration_ms, playback_url
        FROM recordings
        WHERE {}
          AND (?7 IS NULL OR recorded_at < ?7 OR (recorded_at = ?7 AND id < ?8))
        ORDER BY recorded_at DESC, id DESC
        LIMIT ?9 OFFSET ?10
        "#,
        FILTER_SQL
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![
            f.agent,
            f.from,
            f.until,
            f.participant,
            f.service_group,
            f.call_id,
            cursor_at,
            cursor_id,
            (f.limit + 1) as i64,
            f.offset,
        ],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, i64>(8)?,
                row.get::<_, Option<i64>>(9)?,
                row.get::<_, Option<String>>(10)?,
            ))
        },
    )?;

    let mut records = Vec::new();
    for row in rows {
        let (id, agent, service_group, other_party, description, call_id, recorded_at, path, file_size, duration_ms, playback_url) =
            row?;
        records.push(Recording {
            id,
            agent,
            service_group,
            other_party,
            description,
            call_id,
            recorded_at: parse_recorded_at(&recorded_at)?,
            path,
            file_size,
            duration_ms,
            playback_url,
        });
    }

    let has_more = records.len() > f.limit;
    records.truncate(f.limit);
    let next_cursor = if has_more {
        records.last().map(|r| {
            PageCursor {
                recorded_at: format_recorded_at(&r.recorded_at),
                id: r.id.clone(),
            }
            .encode()
        })
    } else {
        None
    };

    Ok(RecordingPage {
        records,
        total: total as usize,
        has_more,
        next_cursor,
    })
}

/// Search recordings on a blocking task.
pub async fn search_recordings(db: &Db, query: RecordingQuery) -> Result<RecordingPage> {
    let start = std::time::Instant::now();
    let agent = query.agent.clone();
    let page = db.with_connection(move |conn| query_recordings(conn, &query)).await?;
    log::debug!(
        "Recording query for {} returned {} of {} in {:?}",
        agent,
        page.records.len(),
        page.total,
        start.elapsed()
    );
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{format_timestamp, migrate};
    use crate::index::recording_id;
    use chrono::Utc;
    use std::path::Path;
    use tempfile::TempDir;

    fn setup_conn() -> (Connection, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut conn = Connection::open(temp_dir.path().join("test.db")).unwrap();
        let migrations_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
        migrate::run_migrations(&mut conn, &migrations_dir).unwrap();
        (conn, temp_dir)
    }

    fn seed(conn: &Connection, agent: &str, path: &str, other: &str, group: &str, call_id: &str, at: &str) {
        let now = format_timestamp(&Utc::now());
        conn.execute(
            "INSERT INTO recordings (id, agent, service_group, other_party, call_id, recorded_at, path,
                                     file_mtime_ns, file_size, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0, ?8, ?8)",
            params![recording_id(agent, path), agent, group, other, call_id, at, path, now],
        )
        .unwrap();
    }

    fn query(agent: &str) -> RecordingQuery {
        RecordingQuery {
            agent: agent.to_string(),
            ..Default::default()
        }
    }

    fn date(s: &str) -> Option<NaiveDate> {
        Some(NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap())
    }

    fn seeded() -> (Connection, TempDir) {
        let (conn, dir) = setup_conn();
        seed(&conn, "alice", "a1.wav", "bob", "svcA", "c1", "2024-01-01 09:00:00");
        seed(&conn, "alice", "a2.wav", "Bob", "svcB", "c2", "2024-01-01 23:59:59");
        seed(&conn, "alice", "a3.wav", "carol", "svcA", "c3", "2024-01-02 00:00:00");
        seed(&conn, "alice", "a4.wav", "bob", "svcA", "c4", "2024-01-03 10:00:00");
        seed(&conn, "bob", "b1.wav", "bob", "svcA", "c5", "2024-01-01 10:00:00");
        seed(&conn, "carol", "k1.wav", "bob", "svcA", "c6", "2024-01-02 10:00:00");
        (conn, dir)
    }

    fn calls(page: &RecordingPage) -> Vec<&str> {
        page.records.iter().map(|r| r.call_id.as_str()).collect()
    }

    #[test]
    fn test_date_range_is_inclusive_by_day() {
        let (conn, _dir) = seeded();
        let q = RecordingQuery {
            from: date("2024-01-01"),
            to: date("2024-01-01"),
            ..query("alice")
        };
        let page = query_recordings(&conn, &q).unwrap();
        assert_eq!(calls(&page), vec!["c2", "c1"]);
        assert_eq!(page.total, 2);
        assert!(!page.has_more);
    }

    #[test]
    fn test_filters_are_conjunctive() {
        let (conn, _dir) = seeded();
        let q = RecordingQuery {
            from: date("2024-01-01"),
            to: date("2024-01-02"),
            participant: Some("BOB".to_string()),
            service_group: Some("svca".to_string()),
            ..query("alice")
        };
        let page = query_recordings(&conn, &q).unwrap();
        assert_eq!(calls(&page), vec!["c1"]);

        let q = RecordingQuery {
            call_id: Some("c4".to_string()),
            participant: Some(String::new()),
            ..query("alice")
        };
        assert_eq!(calls(&query_recordings(&conn, &q).unwrap()), vec!["c4"]);
    }

    #[test]
    fn test_deleted_rows_hidden() {
        let (conn, _dir) = seeded();
        conn.execute("UPDATE recordings SET deleted_at = '2024-02-01T00:00:00.000Z' WHERE call_id = 'c4'", [])
            .unwrap();
        let page = query_recordings(&conn, &query("alice")).unwrap();
        assert_eq!(calls(&page), vec!["c3", "c2", "c1"]);
    }

    #[test]
    fn test_cursor_pagination_walks_all_rows() {
        let (conn, _dir) = seeded();
        let mut q = RecordingQuery {
            limit: Some(2),
            ..query("alice")
        };
        let first = query_recordings(&conn, &q).unwrap();
        assert_eq!(calls(&first), vec!["c4", "c3"]);
        assert_eq!(first.total, 4);
        assert!(first.has_more);

        q.cursor = first.next_cursor.clone();
        let second = query_recordings(&conn, &q).unwrap();
        assert_eq!(calls(&second), vec!["c2", "c1"]);
        assert!(!second.has_more);
        assert!(second.next_cursor.is_none());
    }

    #[test]
    fn test_offset_pagination() {
        let (conn, _dir) = seeded();
        let q = RecordingQuery {
            limit: Some(1),
            offset: Some(2),
            ..query("alice")
        };
        let page = query_recordings(&conn, &q).unwrap();
        assert_eq!(calls(&page), vec!["c2"]);
        assert!(page.has_more);
    }

    #[test]
    fn test_offset_beyond_sqlite_range_is_rejected() {
        let (conn, _dir) = seeded();
        let past_end = RecordingQuery {
            offset: Some(i64::MAX as usize),
            ..query("alice")
        };
        let page = query_recordings(&conn, &past_end).unwrap();
        assert!(page.records.is_empty());
        assert_eq!(page.total, 4);

        let overflow = RecordingQuery {
            offset: Some(usize::MAX),
            ..query("alice")
        };
        assert!(matches!(
            query_recordings(&conn, &overflow),
            Err(CallIndexError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_invalid_requests() {
        let (conn, _dir) = seeded();
        let bad = [
            RecordingQuery { cursor: Some("!!".to_string()), ..query("alice") },
            RecordingQuery { limit: Some(0), ..query("alice") },
            RecordingQuery { from: date("2024-02-01"), to: date("2024-01-01"), ..query("alice") },
            query(""),
        ];
        for q in &bad {
            assert!(matches!(query_recordings(&conn, q), Err(CallIndexError::InvalidInput(_))));
        }
    }

    #[test]
    fn test_limit_is_capped() {
        let (conn, _dir) = seeded();
        let q = RecordingQuery {
            limit: Some(10_000),
            ..query("alice")
        };
        assert_eq!(query_recordings(&conn, &q).unwrap().records.len(), 4);
        assert_eq!(Filters::from_query(&q).unwrap().limit, MAX_LIMIT);
    }
}
