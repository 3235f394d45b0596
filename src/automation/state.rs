// =============================================================================
// Automation State Manager — runtime on/off switch for automated trading
// =============================================================================
//
// Reacts to `ToggleAutomation` events, keeps the flag in memory under one
// mutex, persists it as JSON with an atomic tmp+rename write and rotating
// backups, and broadcasts `AutomationStateChanged` after every effective
// change. A QUERY publishes the current state without changing it; an
// ENABLE/DISABLE that matches the current state is a silent no-op.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::bus::EventBus;
use crate::events::{AutomationAction, Event, EventKind, EventPayload};

/// Number of rotating `.bak.N` files kept next to the state file.
const BACKUP_COUNT: usize = 5;

/// Snapshot of the automation state.
#[derive(Debug, Clone, PartialEq)]
pub struct AutomationStatus {
    pub enabled: bool,
    pub last_changed: Option<DateTime<Utc>>,
    pub reason: String,
    pub requested_by: String,
}

/// On-disk representation.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    enabled: bool,
    last_changed: Option<String>,
    reason: String,
    requested_by: String,
    saved_at: String,
}

struct Inner {
    state_path: PathBuf,
    default_enabled: bool,
    bus: Arc<EventBus>,
    state: Mutex<AutomationStatus>,
    subscription: Mutex<Option<String>>,
}

/// Mutex-guarded automation flag with atomic JSON persistence.
pub struct AutomationStateManager {
    inner: Arc<Inner>,
}

impl AutomationStateManager {
    pub fn new(
        bus: Arc<EventBus>,
        state_path: impl Into<PathBuf>,
        default_enabled: bool,
    ) -> Self {
        let inner = Arc::new(Inner {
            state_path: state_path.into(),
            default_enabled,
            bus: bus.clone(),
            state: Mutex::new(AutomationStatus {
                enabled: default_enabled,
                last_changed: None,
                reason: "system_initialization".to_string(),
                requested_by: "system".to_string(),
            }),
            subscription: Mutex::new(None),
        });

        Inner::load_state(&inner);

        let handler_inner = Arc::clone(&inner);
        let id = bus.subscribe(
            EventKind::ToggleAutomation,
            Arc::new(move |event| {
                Inner::handle_toggle(&handler_inner, event);
                Ok(())
            }),
        );
        *inner.subscription.lock() = Some(id);

        info!(
            enabled = inner.state.lock().enabled,
            path = %inner.state_path.display(),
            "automation state manager initialised"
        );

        Self { inner }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.state.lock().enabled
    }

    pub fn status(&self) -> AutomationStatus {
        self.inner.state.lock().clone()
    }

    /// Release the bus subscription. Called on engine shutdown.
    pub fn stop(&self) {
        if let Some(id) = self.inner.subscription.lock().take() {
            self.inner.bus.unsubscribe(&id);
        }
    }
}

impl Inner {
    fn handle_toggle(inner: &Arc<Inner>, event: &Event) {
        let EventPayload::ToggleAutomation {
            action,
            reason,
            requested_by,
        } = &event.payload
        else {
            return;
        };

        let mut state = inner.state.lock();

        if *action == AutomationAction::Query {
            info!(enabled = state.enabled, "automation state query");
            let snapshot = state.clone();
            drop(state);
            Self::publish_state_change(inner, &snapshot, Some(snapshot.enabled));
            return;
        }

        let new_enabled = *action == AutomationAction::Enable;
        if new_enabled == state.enabled {
            info!(enabled = state.enabled, "automation unchanged, no-op");
            return;
        }

        let previous = state.enabled;
        state.enabled = new_enabled;
        state.last_changed = Some(Utc::now());
        state.reason = reason.clone();
        state.requested_by = requested_by.clone();

        info!(
            enabled = new_enabled,
            reason = %reason,
            requested_by = %requested_by,
            "automation state changed"
        );

        let snapshot = state.clone();
        // Persist while still holding the lock so readers never observe a
        // state newer than the file mid-rotation.
        if let Err(e) = Self::save_state(inner, &snapshot) {
            error!(error = %e, "failed to persist automation state");
        }
        drop(state);

        Self::publish_state_change(inner, &snapshot, Some(previous));
    }

    fn publish_state_change(
        inner: &Arc<Inner>,
        snapshot: &AutomationStatus,
        previous_state: Option<bool>,
    ) {
        inner.bus.publish(Event::new(EventPayload::AutomationStateChanged {
            enabled: snapshot.enabled,
            previous_state,
            reason: snapshot.reason.clone(),
            changed_at: snapshot.last_changed.unwrap_or_else(Utc::now),
        }));
    }

    fn load_state(inner: &Arc<Inner>) {
        let path = &inner.state_path;
        if !path.exists() {
            info!(
                path = %path.display(),
                default_enabled = inner.default_enabled,
                "automation state file not found, using default"
            );
            return;
        }

        let parsed: Result<PersistedState> = fs::read_to_string(path)
            .context("read state file")
            .and_then(|s| serde_json::from_str(&s).context("parse state file"));

        match parsed {
            Ok(persisted) => {
                let mut state = inner.state.lock();
                state.enabled = persisted.enabled;
                state.reason = persisted.reason;
                state.requested_by = persisted.requested_by;
                state.last_changed = persisted
                    .last_changed
                    .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                    .map(|t| t.with_timezone(&Utc));
                info!(
                    enabled = state.enabled,
                    reason = %state.reason,
                    "automation state loaded from file"
                );
            }
            Err(e) => {
                error!(
                    path = %path.display(),
                    error = %e,
                    default_enabled = inner.default_enabled,
                    "corrupt automation state file, using default"
                );
            }
        }
    }

    /// Atomic write: tmp + fsync + backup rotation + rename.
    fn save_state(inner: &Arc<Inner>, state: &AutomationStatus) -> Result<()> {
        let path = &inner.state_path;
        let persisted = PersistedState {
            enabled: state.enabled,
            last_changed: state.last_changed.map(|t| t.to_rfc3339()),
            reason: state.reason.clone(),
            requested_by: state.requested_by.clone(),
            saved_at: Utc::now().to_rfc3339(),
        };
        let content = serde_json::to_string_pretty(&persisted)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create state dir {}", parent.display()))?;
            }
        }

        let tmp_path = suffixed(path, ".tmp");
        {
            let mut f = fs::File::create(&tmp_path)
                .with_context(|| format!("create tmp state file {}", tmp_path.display()))?;
            f.write_all(content.as_bytes())?;
            f.sync_all()?;
        }

        if path.exists() {
            Self::rotate_backups(path);
            if let Err(e) = fs::copy(path, suffixed(path, ".bak.1")) {
                warn!(error = %e, "failed to create state backup");
            }
        }

        fs::rename(&tmp_path, path)
            .with_context(|| format!("rename tmp state file over {}", path.display()))?;
        Ok(())
    }

    fn rotate_backups(path: &Path) {
        let oldest = suffixed(path, &format!(".bak.{BACKUP_COUNT}"));
        if oldest.exists() {
            let _ = fs::remove_file(&oldest);
        }
        for i in (1..BACKUP_COUNT).rev() {
            let from = suffixed(path, &format!(".bak.{i}"));
            if from.exists() {
                let to = suffixed(path, &format!(".bak.{}", i + 1));
                if let Err(e) = fs::rename(&from, &to) {
                    warn!(error = %e, "backup rotation failed");
                }
            }
        }
    }
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}{}", path.display(), suffix))
}
