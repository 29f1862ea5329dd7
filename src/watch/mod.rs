//! Watch trigger: index an agent shortly after files under its directory change.
//!
//! The notify thread maps changed paths to the agent directory they live in
//! and reports each agent once it has been quiet for the debounce period.
//! Agents are then handed to the regular trigger one at a time. Claims still
//! apply, so a scheduled run for the same agent makes the watch run a skipped
//! no-op rather than a second writer.

mod watcher;

use std::collections::BTreeSet;
use std::path::{Component, Path};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::jobs::{run_trigger, validate_agent_name, IndexContext, TriggerRequest};

/// The agent whose directory contains `path`, if any.
///
/// Works on paths that no longer exist (deletions), so `root` is compared
/// lexically; notify reports paths under the root it was given.
pub fn agent_for_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    match rel.components().next()? {
        Component::Normal(name) => {
            let name = name.to_str()?;
            validate_agent_name(name).ok()?;
            Some(name.to_string())
        }
        _ => None,
    }
}

/// Run until `cancel` fires or the watcher thread stops.
pub async fn run_watcher(ctx: IndexContext, debounce: Duration, cancel: CancellationToken) -> Result<()> {
    // Some backends report resolved paths; watch the resolved root so prefixes match.
    let root = ctx
        .recordings_root
        .canonicalize()
        .unwrap_or_else(|_| ctx.recordings_root.clone());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    let thread_root = root.clone();
    std::thread::spawn(move || {
        if let Err(e) = watcher::run_watcher_thread(&thread_root, debounce, tx) {
            log::error!("watcher thread error: {}", e);
        }
    });

    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => break,
            agent = rx.recv() => match agent {
                Some(agent) => agent,
                None => break,
            },
        };

        let mut agents = BTreeSet::from([first]);
        while let Ok(agent) = rx.try_recv() {
            agents.insert(agent);
        }

        for agent in agents {
            if cancel.is_cancelled() {
                break;
            }
            match run_trigger(&ctx, TriggerRequest::one(agent.clone()), cancel.child_token()).await {
                Ok(report) => {
                    for a in &report.agents {
                        log::info!(
                            "watch: {} {:?} (+{} ~{} -{})",
                            a.agent,
                            a.outcome,
                            a.counts.inserted,
                            a.counts.updated,
                            a.counts.soft_deleted
                        );
                    }
                }
                Err(e) => log::error!("watch: index run for {} failed: {}", agent, e),
            }
        }
    }

    log::info!("watch: stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_for_path() {
        let root = Path::new("/srv/recordings");
        assert_eq!(
            agent_for_path(root, Path::new("/srv/recordings/alice/2024/x.wav")),
            Some("alice".to_string())
        );
        assert_eq!(agent_for_path(root, Path::new("/srv/recordings/bob")), Some("bob".to_string()));
        assert_eq!(agent_for_path(root, Path::new("/srv/recordings")), None);
        assert_eq!(agent_for_path(root, Path::new("/srv/other/alice/x.wav")), None);
        assert_eq!(agent_for_path(root, Path::new("/srv/recordings/.tmp/x.wav")), None);
    }

    #[tokio::test]
    async fn test_run_watcher_stops_on_cancel() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let root = temp_dir.path().join("recordings");
        std::fs::create_dir_all(&root).unwrap();
        let db = crate::db::Db::new(temp_dir.path().join("test.db"));
        let ctx = IndexContext {
            db,
            recordings_root: root,
            settings: Default::default(),
            lease_policy: Default::default(),
            workers: 1,
        };

        let cancel = CancellationToken::new();
        cancel.cancel();
        run_watcher(ctx, Duration::from_millis(50), cancel).await.unwrap();
    }
}
