// =============================================================================
// Toggle File Watcher — file-based automation control
// =============================================================================
//
// A background worker polls a plain-text file on an interval. When the file's
// modification time advances, its content (trimmed, upper-cased) is parsed as
// ENABLE | DISABLE | QUERY and published as a `ToggleAutomation` event.
// Invalid, empty, and duplicate commands are ignored but recorded in an
// action log, which rotates above 10 MB keeping 5 backups. The worker is
// cancellable: `stop()` returns within one poll interval plus a small grace.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::events::{AutomationAction, Event, EventPayload};

/// Action-log rotation threshold.
const LOG_MAX_BYTES: u64 = 10 * 1024 * 1024;
/// Action-log backups kept after rotation.
const LOG_BACKUPS: usize = 5;
/// Read retries for transient file errors.
const READ_RETRIES: usize = 3;

struct WatcherInner {
    bus: Arc<EventBus>,
    toggle_path: PathBuf,
    log_path: PathBuf,
    poll_interval: Duration,
    cancel: Notify,
    running: AtomicBool,
    last_command: Mutex<Option<String>>,
    last_mtime: Mutex<Option<SystemTime>>,
}

/// Polls the toggle file on a dedicated background worker.
pub struct ToggleFileWatcher {
    inner: Arc<WatcherInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ToggleFileWatcher {
    pub fn new(
        bus: Arc<EventBus>,
        toggle_path: impl Into<PathBuf>,
        log_path: impl Into<PathBuf>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                bus,
                toggle_path: toggle_path.into(),
                log_path: log_path.into(),
                poll_interval,
                cancel: Notify::new(),
                running: AtomicBool::new(false),
                last_command: Mutex::new(None),
                last_mtime: Mutex::new(None),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the polling worker. Idempotent while running.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("toggle file watcher already running");
            return;
        }

        let inner = Arc::clone(&self.inner);
        info!(
            toggle_file = %inner.toggle_path.display(),
            poll_interval_secs = inner.poll_interval.as_secs(),
            "toggle file watcher starting"
        );

        let handle = tokio::spawn(async move {
            // The running flag is the exit condition; the notify only cuts
            // the sleep short. A missed notification still exits within one
            // poll interval.
            while inner.running.load(Ordering::SeqCst) {
                WatcherInner::poll_file(&inner).await;

                tokio::select! {
                    _ = tokio::time::sleep(inner.poll_interval) => {}
                    _ = inner.cancel.notified() => {}
                }
            }
            debug!("toggle file watcher loop ended");
        });
        *self.handle.lock() = Some(handle);
    }

    /// Cancel the worker and wait for it, bounded by poll_interval + grace.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.notify_waiters();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let grace = self.inner.poll_interval + Duration::from_secs(2);
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("toggle file watcher did not stop within grace period");
            }
        }
        info!("toggle file watcher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

impl WatcherInner {
    async fn poll_file(inner: &Arc<WatcherInner>) {
        if !inner.toggle_path.exists() {
            return;
        }

        let mtime = match std::fs::metadata(&inner.toggle_path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "failed to stat toggle file");
                return;
            }
        };

        {
            let mut last = inner.last_mtime.lock();
            if last.map(|t| mtime <= t).unwrap_or(false) {
                return;
            }
            *last = Some(mtime);
        }

        let Some(command) = Self::read_command(inner).await else {
            return;
        };

        // Duplicate content after a touch: ignore but note it.
        {
            let mut last = inner.last_command.lock();
            if last.as_deref() == Some(command.as_str()) {
                debug!(command = %command, "duplicate toggle command ignored");
                Self::log_action(inner, "IGNORED", &format!("duplicate command '{command}'"));
                return;
            }
            *last = Some(command.clone());
        }

        match AutomationAction::parse(&command) {
            Some(action) => {
                inner.bus.publish(Event::new(EventPayload::ToggleAutomation {
                    action,
                    reason: format!("File toggle command: {command}"),
                    requested_by: "file_watcher".to_string(),
                }));
                info!(command = %command, "toggle command published");
                Self::log_action(inner, "SUCCESS", &format!("command '{command}' processed"));
            }
            None => {
                warn!(command = %command, "invalid toggle command");
                Self::log_action(inner, "ERROR", &format!("invalid command '{command}'"));
            }
        }
    }

    async fn read_command(inner: &Arc<WatcherInner>) -> Option<String> {
        for attempt in 1..=READ_RETRIES {
            match std::fs::read_to_string(&inner.toggle_path) {
                Ok(content) => {
                    let command = content.trim().to_uppercase();
                    if command.is_empty() {
                        debug!("toggle file is empty");
                        Self::log_action(inner, "IGNORED", "empty toggle file");
                        return None;
                    }
                    return Some(command);
                }
                Err(e) if attempt < READ_RETRIES => {
                    warn!(attempt, error = %e, "toggle file read failed, retrying");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(e) => {
                    error!(error = %e, "toggle file unreadable");
                    Self::log_action(inner, "ERROR", &format!("read failed: {e}"));
                    return None;
                }
            }
        }
        None
    }

    fn log_action(inner: &Arc<WatcherInner>, status: &str, message: &str) {
        if let Some(parent) = inner.log_path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }

        let line = format!(
            "{} - {} - {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            status,
            message
        );
        let appended = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&inner.log_path)
            .and_then(|mut f| std::io::Write::write_all(&mut f, line.as_bytes()));
        if let Err(e) = appended {
            error!(error = %e, "failed to write action log");
            return;
        }

        Self::rotate_log_if_needed(&inner.log_path);
    }

    fn rotate_log_if_needed(log_path: &Path) {
        let size = match std::fs::metadata(log_path) {
            Ok(m) => m.len(),
            Err(_) => return,
        };
        if size <= LOG_MAX_BYTES {
            return;
        }

        let backup = |i: usize| PathBuf::from(format!("{}.{i}", log_path.display()));
        for i in (1..LOG_BACKUPS).rev() {
            let from = backup(i);
            if from.exists() {
                let to = backup(i + 1);
                let _ = std::fs::remove_file(&to);
                let _ = std::fs::rename(&from, &to);
            }
        }
        let first = backup(1);
        let _ = std::fs::remove_file(&first);
        if std::fs::rename(log_path, &first).is_ok() {
            info!(size_bytes = size, "rotated automation action log");
        }
    }
}
