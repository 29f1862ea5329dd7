//! Notify thread: maps filesystem events to agents and emits each agent once
//! its directory has been quiet for the debounce period.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedSender;

use super::agent_for_path;
use crate::error::{CallIndexError, Result};

/// Last activity per agent directory
#[derive(Debug, Default)]
pub(crate) struct QuietPeriod {
    last_seen: HashMap<String, Instant>,
}

impl QuietPeriod {
    pub(crate) fn touch(&mut self, agent: String, at: Instant) {
        self.last_seen.insert(agent, at);
    }

    /// Agents with no activity for `quiet`, removed from the pending set, in name order.
    pub(crate) fn settled(&mut self, now: Instant, quiet: Duration) -> Vec<String> {
        let mut due: Vec<String> = self
            .last_seen
            .iter()
            .filter(|(_, at)| now.duration_since(**at) >= quiet)
            .map(|(agent, _)| agent.clone())
            .collect();
        due.sort();
        for agent in &due {
            self.last_seen.remove(agent);
        }
        due
    }
}

/// Watch the recordings root until the receiver of `tx` goes away.
///
/// Reads (playback streaming opens files too) are ignored; anything that
/// creates, modifies or removes an entry marks its agent as active.
pub fn run_watcher_thread(root: &Path, quiet: Duration, tx: UnboundedSender<String>) -> Result<()> {
    let (event_tx, event_rx) = mpsc::channel::<Vec<PathBuf>>();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
        Ok(ev) if matches!(ev.kind, EventKind::Access(_)) => {}
        Ok(ev) => {
            let _ = event_tx.send(ev.paths);
        }
        Err(e) => log::warn!("watch event error: {}", e),
    })
    .map_err(|e| CallIndexError::Config(format!("cannot start file watcher: {}", e)))?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|e| CallIndexError::Config(format!("cannot watch {}: {}", root.display(), e)))?;
    log::info!("watch: monitoring {}", root.display());

    let mut pending = QuietPeriod::default();
    loop {
        match event_rx.recv_timeout(quiet) {
            Ok(paths) => {
                let now = Instant::now();
                for agent in paths.iter().filter_map(|p| agent_for_path(root, p)) {
                    pending.touch(agent, now);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if tx.is_closed() {
                    return Ok(());
                }
                for agent in pending.settled(Instant::now(), quiet) {
                    log::debug!("watch: {} settled", agent);
                    if tx.send(agent).is_err() {
                        return Ok(());
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
}
