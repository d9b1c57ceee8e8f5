use anyhow::{Result, bail};
use async_trait::async_trait;
use notify::{
    Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher,
    event::{CreateKind, ModifyKind},
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    sync::mpsc::UnboundedReceiver,
    task::JoinHandle,
    time::{Duration, sleep},
};
use tracing::{error, warn};

/// Something that is reloaded from files in a watched directory.
#[async_trait]
pub trait WatchedType: Send + Sync + 'static {
    fn is_relevant(&self, path: &Path) -> bool;
    async fn on_create_or_modify(&self, path: &Path) -> Result<()>;

    async fn on_remove(&self, path: &Path) -> Result<()>;

    async fn reload(&self, path: &Path) -> Result<()> {
        self.on_create_or_modify(path).await
    }
}

/// Polls a directory and forwards create / modify / remove events to a
/// [`WatchedType`]. Dropping it without `shutdown` leaves the dispatch task
/// running until the poller's channel closes.
pub struct DirectoryWatcher {
    dir: PathBuf,
    _poller: PollWatcher,
    dispatch: JoinHandle<()>,
}

impl std::fmt::Debug for DirectoryWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryWatcher").field("dir", &self.dir).finish()
    }
}

impl DirectoryWatcher {
    /// Start watching `dir`. Files match when their extension is in `exts`
    /// or `is_relevant` accepts them. With `initial_scan`, files already in
    /// the directory are loaded first; `enable_retry` retries failed loads.
    pub async fn new(
        dir: PathBuf,
        watched: Arc<dyn WatchedType>,
        exts: &[&str],
        initial_scan: bool,
        enable_retry: bool,
        poll_interval: Duration,
    ) -> Result<DirectoryWatcher> {
        if !dir.exists() {
            let msg = format!("directory {} does not exist", dir.to_string_lossy());
            warn!(%msg);
            bail!(msg);
        }

        if initial_scan {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .collect();
            entries.sort();
            for path in entries {
                if watched.is_relevant(&path) || has_extension(&path, exts) {
                    try_reload(&watched, &path, enable_retry).await;
                }
            }
        }

        let (tx, mut rx): (_, UnboundedReceiver<notify::Result<Event>>) =
            tokio::sync::mpsc::unbounded_channel();
        let mut poller = PollWatcher::new(
            move |res| {
                // receiver gone means nobody is listening any more
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(poll_interval),
        )?;
        poller.watch(&dir, RecursiveMode::Recursive)?;

        let exts: Vec<String> = exts.iter().map(|s| s.to_string()).collect();
        let dispatch = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "watcher error");
                        continue;
                    }
                };
                let Some(change) = Change::of(&event.kind) else {
                    continue;
                };
                for path in &event.paths {
                    if !watched.is_relevant(path) && !has_extension(path, exts.as_slice()) {
                        continue;
                    }
                    let outcome = match change {
                        Change::Upsert => watched.on_create_or_modify(path).await,
                        Change::Remove => watched.on_remove(path).await,
                    };
                    if let Err(e) = outcome {
                        warn!(?path, ?change, error = %e, "failed to handle file change");
                    }
                }
            }
        });

        Ok(DirectoryWatcher {
            dir,
            _poller: poller,
            dispatch,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stop polling and dispatching. No events are delivered afterwards.
    pub fn shutdown(self) {
        self.dispatch.abort();
    }
}

#[derive(Debug, Clone, Copy)]
enum Change {
    Upsert,
    Remove,
}

impl Change {
    fn of(kind: &EventKind) -> Option<Change> {
        match kind {
            EventKind::Create(CreateKind::Any | CreateKind::File)
            | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => Some(Change::Upsert),
            EventKind::Remove(_) => Some(Change::Remove),
            _ => None,
        }
    }
}

fn has_extension<S: AsRef<str>>(path: &Path, extensions: &[S]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|e| e.as_ref() == ext))
}

async fn try_reload(watched: &Arc<dyn WatchedType>, path: &Path, retry: bool) {
    const MAX_RETRIES: usize = 10;

    for attempt in 0..MAX_RETRIES {
        match watched.reload(path).await {
            Ok(_) => return,
            Err(e) => {
                if !retry || attempt == MAX_RETRIES - 1 {
                    error!(?path, error = %e, "failed to load");
                    return;
                }
                warn!(?path, attempt = attempt + 1, error = %e, "retrying load");
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        loaded: AtomicUsize,
        removed: AtomicUsize,
    }

    #[async_trait]
    impl WatchedType for Counter {
        fn is_relevant(&self, path: &Path) -> bool {
            path.extension().and_then(|e| e.to_str()) == Some("txt")
        }

        async fn on_create_or_modify(&self, _path: &Path) -> Result<()> {
            self.loaded.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_remove(&self, _path: &Path) -> Result<()> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_missing_directory_is_an_error() {
        let watched: Arc<dyn WatchedType> = Arc::new(Counter::default());
        let res = DirectoryWatcher::new(
            PathBuf::from("./does/not/exist"),
            watched,
            &["txt"],
            true,
            false,
            Duration::from_millis(50),
        )
        .await;
        assert!(res.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_initial_scan_loads_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        std::fs::write(dir.path().join("b.bin"), "ignored").unwrap();

        let counter = Arc::new(Counter::default());
        let watcher = DirectoryWatcher::new(
            dir.path().to_path_buf(),
            counter.clone(),
            &["txt"],
            true,
            false,
            Duration::from_millis(50),
        )
        .await
        .unwrap();

        assert_eq!(counter.loaded.load(Ordering::SeqCst), 1);
        watcher.shutdown();
    }
}
