pub mod state;
pub mod watcher;

pub use state::{AutomationStateManager, AutomationStatus};
pub use watcher::ToggleFileWatcher;
