//! End-to-end indexing scenarios against a temporary recordings root and store.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration as StdDuration, UNIX_EPOCH};

use callindex::db::Db;
use callindex::index::{
    parse_filename, walk_agent, write_batch, Fence, PipelineSettings, PreparedFile, ReconcilePolicy,
};
use callindex::jobs::{
    claim, run_trigger, AgentOutcome, IndexContext, LeasePolicy, SkipReason, TriggerRequest,
    TriggerStatus,
};
use callindex::query::{search_recordings, RecordingQuery};
use chrono::{Duration, NaiveDate, Utc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Fixture {
    _dir: TempDir,
    root: PathBuf,
    ctx: IndexContext,
}

fn write_at(path: &Path, secs: u64) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, b"RIFF").unwrap();
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(UNIX_EPOCH + StdDuration::from_secs(secs)).unwrap();
}

async fn fixture(batch_size: usize) -> Fixture {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("recordings");
    fs::create_dir_all(&root).unwrap();

    let db = Db::new(dir.path().join("index.db"));
    db.migrate(&Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations"))
        .await
        .unwrap();

    let ctx = IndexContext {
        db,
        recordings_root: root.clone(),
        settings: PipelineSettings {
            batch_size,
            probe_duration: false,
            // Reconcile fully on every run so deletions of old recordings show up immediately.
            reconcile: ReconcilePolicy {
                interval: Duration::zero(),
                full_interval: Duration::zero(),
                window: Duration::days(30),
            },
            ..Default::default()
        },
        lease_policy: LeasePolicy::default(),
        workers: 3,
    };

    Fixture { _dir: dir, root, ctx }
}

async fn index(f: &Fixture, request: TriggerRequest) -> callindex::TriggerReport {
    run_trigger(&f.ctx, request, CancellationToken::new()).await.unwrap()
}

fn day(s: &str) -> Option<NaiveDate> {
    Some(NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap())
}

async fn call_ids(f: &Fixture, query: RecordingQuery) -> Vec<String> {
    search_recordings(&f.ctx.db, query)
        .await
        .unwrap()
        .records
        .into_iter()
        .map(|r| r.call_id)
        .collect()
}

fn alice_on(date: &str) -> RecordingQuery {
    RecordingQuery {
        agent: "alice".to_string(),
        from: day(date),
        to: day(date),
        ..Default::default()
    }
}

/// Every stored recording column except bookkeeping timestamps.
async fn snapshot(db: &Db) -> Vec<String> {
    db.with_connection(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, agent, IFNULL(service_group, ''), IFNULL(other_party, ''), IFNULL(description, ''),
                    call_id, recorded_at, path, file_mtime_ns, file_size, deleted_at IS NULL
             FROM recordings ORDER BY agent, path",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(format!(
                "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, String>(6)?,
                r.get::<_, String>(7)?,
                r.get::<_, i64>(8)?,
                r.get::<_, i64>(9)?,
                r.get::<_, bool>(10)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn alice_example_scenario() {
    let f = fixture(500).await;
    write_at(&f.root.join("alice/svcA_20240101_120000_bob_call123.wav"), 1_000);
    write_at(&f.root.join("alice/svcA_20240101_130500_carol_call124.wav"), 1_001);

    let report = index(&f, TriggerRequest::all()).await;
    assert_eq!(report.status, TriggerStatus::Success);
    assert_eq!(call_ids(&f, alice_on("2024-01-01")).await, vec!["call124", "call123"]);

    fs::remove_file(f.root.join("alice/svcA_20240101_120000_bob_call123.wav")).unwrap();
    let report = index(&f, TriggerRequest::one("alice")).await;
    assert_eq!(report.agents[0].counts.soft_deleted, 1);
    assert_eq!(call_ids(&f, alice_on("2024-01-01")).await, vec!["call124"]);

    let deleted: Option<String> = f
        .ctx
        .db
        .with_connection(|conn| {
            Ok(conn.query_row(
                "SELECT deleted_at FROM recordings WHERE call_id = 'call123'",
                [],
                |r| r.get(0),
            )?)
        })
        .await
        .unwrap();
    assert!(deleted.is_some());
}

#[tokio::test]
async fn second_run_without_changes_is_a_no_op() {
    let f = fixture(2).await;
    for i in 0..5 {
        write_at(
            &f.root.join(format!("alice/svcA_20240102_10000{}_bob_c{}.wav", i, i)),
            2_000 + i,
        );
    }

    index(&f, TriggerRequest::all()).await;
    let before = snapshot(&f.ctx.db).await;

    let report = index(&f, TriggerRequest::all()).await;
    let counts = report.agents[0].counts;
    assert_eq!(counts.inserted + counts.updated + counts.soft_deleted, 0);
    assert_eq!(snapshot(&f.ctx.db).await, before);
}

#[tokio::test]
async fn interrupted_run_resumes_to_same_state() {
    let names: Vec<String> = (0..6)
        .map(|i| format!("svcA_20240103_09000{}_bob_r{}.wav", i, i))
        .collect();

    let clean = fixture(2).await;
    let crashed = fixture(2).await;
    for (i, name) in names.iter().enumerate() {
        write_at(&clean.root.join("alice").join(name), 3_000 + i as u64);
        write_at(&crashed.root.join("alice").join(name), 3_000 + i as u64);
    }

    index(&clean, TriggerRequest::all()).await;

    // First batch committed under a claim whose holder then died.
    let short = LeasePolicy {
        lease: Duration::milliseconds(200),
        ..LeasePolicy::default()
    };
    let agent_dir = crashed.root.join("alice");
    let walk = walk_agent(&agent_dir, None, &crashed.ctx.settings.extensions).unwrap();
    let first: Vec<PreparedFile> = walk.candidates[..2]
        .iter()
        .map(|file| PreparedFile {
            parsed: parse_filename(&file.file_name),
            file: file.clone(),
            duration_ms: None,
            playback_url: None,
        })
        .collect();
    crashed
        .ctx
        .db
        .with_connection(move |conn| {
            claim(conn, "alice", "dead-run", Utc::now(), &short)?;
            let fence = Fence {
                agent: "alice",
                holder: "dead-run",
                policy: &short,
            };
            write_batch(conn, fence, &first, Utc::now())
        })
        .await
        .unwrap();
    tokio::time::sleep(StdDuration::from_millis(300)).await;

    let report = index(&crashed, TriggerRequest::all()).await;
    assert_eq!(report.agents[0].outcome, AgentOutcome::Completed);
    assert_eq!(report.agents[0].counts.inserted, 4);

    assert_eq!(snapshot(&crashed.ctx.db).await, snapshot(&clean.ctx.db).await);
}

#[tokio::test]
async fn deleted_file_that_returns_is_revived() {
    let f = fixture(500).await;
    let path = f.root.join("alice/svcA_20240104_080000_erin_call900.wav");
    write_at(&path, 4_000);
    write_at(&f.root.join("alice/svcA_20240104_090000_erin_call901.wav"), 4_001);

    index(&f, TriggerRequest::all()).await;
    let id_before = snapshot(&f.ctx.db).await[0].split('|').next().unwrap().to_string();

    fs::remove_file(&path).unwrap();
    index(&f, TriggerRequest::all()).await;
    assert_eq!(call_ids(&f, alice_on("2024-01-04")).await, vec!["call901"]);

    // Restored from backup with its original, older mtime.
    write_at(&path, 4_000);
    let report = index(&f, TriggerRequest::all()).await;
    assert_eq!(report.agents[0].counts.updated, 1);
    assert_eq!(call_ids(&f, alice_on("2024-01-04")).await, vec!["call901", "call900"]);

    let id_after = snapshot(&f.ctx.db).await[0].split('|').next().unwrap().to_string();
    assert_eq!(id_before, id_after);
}

#[tokio::test]
async fn held_claim_skips_second_coordinator() {
    let f = fixture(500).await;
    write_at(&f.root.join("alice/svcA_20240105_080000_bob_c1.wav"), 5_000);

    f.ctx
        .db
        .with_connection(|conn| claim(conn, "alice", "other-host", Utc::now(), &LeasePolicy::default()))
        .await
        .unwrap();

    let report = index(&f, TriggerRequest::one("alice")).await;
    assert_eq!(report.status, TriggerStatus::Success);
    assert_eq!(report.exit_code(), 0);
    assert!(matches!(
        &report.agents[0].outcome,
        AgentOutcome::Skipped {
            reason: SkipReason::Conflict { holder: Some(h), .. }
        } if h == "other-host"
    ));
    assert!(snapshot(&f.ctx.db).await.is_empty());
}

#[tokio::test]
async fn filters_select_exact_subset_across_agents() {
    let f = fixture(500).await;
    let files = [
        ("alice", "svcA_20240110_080000_bob_a1.wav"),
        ("alice", "svcB_20240111_090000_Bob_a2.wav"),
        ("alice", "svcA_20240111_100000_carol_a3.wav"),
        ("alice", "svcA_20240113_100000_bob_a4.wav"),
        ("bruno", "svcA_20240111_110000_bob_b1.wav"),
        ("chloe", "svcA_20240110_120000_bob_c1.wav"),
    ];
    for (i, (agent, name)) in files.iter().enumerate() {
        write_at(&f.root.join(agent).join(name), 6_000 + i as u64);
    }

    let report = index(&f, TriggerRequest::all()).await;
    assert_eq!(report.agents.len(), 3);

    let query = RecordingQuery {
        agent: "alice".to_string(),
        from: day("2024-01-10"),
        to: day("2024-01-12"),
        participant: Some("bob".to_string()),
        ..Default::default()
    };
    assert_eq!(call_ids(&f, query.clone()).await, vec!["a2", "a1"]);

    let narrowed = RecordingQuery {
        service_group: Some("svcA".to_string()),
        ..query
    };
    assert_eq!(call_ids(&f, narrowed).await, vec!["a1"]);
}

#[tokio::test]
async fn unparseable_names_are_quarantined_not_served() {
    let f = fixture(500).await;
    write_at(&f.root.join("alice/svcA_20240120_080000_bob_ok1.wav"), 7_000);
    write_at(&f.root.join("alice/svcA_20240120_080000_bob.wav"), 7_001);
    write_at(&f.root.join("alice/svcA_20241320_080000_bob_bad.wav"), 7_002);

    let report = index(&f, TriggerRequest::all()).await;
    assert_eq!(report.agents[0].counts.inserted, 1);
    assert_eq!(report.agents[0].counts.quarantined, 2);

    let all = RecordingQuery {
        agent: "alice".to_string(),
        ..Default::default()
    };
    assert_eq!(call_ids(&f, all).await, vec!["ok1"]);

    let reasons: Vec<String> = f
        .ctx
        .db
        .with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT reason FROM recording_quarantine ORDER BY path")?;
            let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
        .unwrap();
    assert_eq!(reasons, vec!["missing_segment", "malformed_timestamp"]);
}
