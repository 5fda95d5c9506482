use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};
use tokio::sync::oneshot;
use tokio::time::Instant;

struct GcEntry {
    scheduled_at: Instant,
    delay: Duration,
    /// Firing the sender deletes the path immediately; dropping it cancels
    /// the scheduled deletion.
    fire: Option<oneshot::Sender<()>>,
}

/// Schedules directories for delayed recursive deletion and prunes them
/// early under disk pressure. Deletions run on the blocking pool; the
/// completion receiver resolves once the path is gone.
#[derive(Default)]
pub struct GarbageCollector {
    entries: HashMap<PathBuf, GcEntry>,
}

impl GarbageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `path` for deletion after `delay`.
    /// Rescheduling an already-scheduled path cancels the earlier entry.
    pub fn schedule(
        &mut self,
        delay: Duration,
        path: &Path,
    ) -> oneshot::Receiver<Result<(), String>> {
        if self.entries.remove(path).is_some() {
            warn!("rescheduling '{}' for garbage collection", path.display());
        }
        let (fire_tx, fire_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel();
        self.entries.insert(
            path.to_path_buf(),
            GcEntry {
                scheduled_at: Instant::now(),
                delay,
                fire: Some(fire_tx),
            },
        );
        let path = path.to_path_buf();
        info!(
            "scheduled '{}' for deletion in {delay:?}",
            path.display()
        );
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                out = fire_rx => {
                    if out.is_err() {
                        // The entry was rescheduled or the collector dropped.
                        return;
                    }
                }
            }
            let target = path.clone();
            let result = tokio::task::spawn_blocking(move || {
                match std::fs::remove_dir_all(&target) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e.to_string()),
                }
            })
            .await
            .unwrap_or_else(|e| Err(e.to_string()));
            match &result {
                Ok(()) => info!("deleted '{}'", path.display()),
                Err(e) => warn!("failed to delete '{}': {e}", path.display()),
            }
            let _ = done_tx.send(result);
        });
        done_rx
    }

    /// Fire every entry whose remaining delay is at most `bound`.
    pub fn prune(&mut self, bound: Duration) {
        for (path, entry) in self.entries.iter_mut() {
            let elapsed = entry.scheduled_at.elapsed();
            if elapsed + bound >= entry.delay {
                if let Some(fire) = entry.fire.take() {
                    info!("pruning '{}'", path.display());
                    let _ = fire.send(());
                }
            }
        }
    }

    /// Forget a path once its deletion completed.
    pub fn finished(&mut self, path: &Path) {
        self.entries.remove(path);
    }

    pub fn scheduled_count(&self) -> usize {
        self.entries.len()
    }
}
