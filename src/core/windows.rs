//! Window registry — per-action scheduling windows sourced from activation
//! messages.
//!
//! Every `Run` refreshes the four windows for its action. The registry also
//! carries the process-wide default keep-alive window: it is consulted only
//! when a new proxy is constructed, so updating it never changes the idle
//! timeout of proxies that already exist.

use crate::activation::WindowHints;
use std::collections::HashMap;
use std::sync::RwLock;

/// Process-wide map `action → scheduling windows`
pub struct WindowRegistry {
    windows: RwLock<HashMap<String, WindowHints>>,
    default_keep_alive_minutes: RwLock<u64>,
}

impl WindowRegistry {
    /// Create a registry with the given boot-time keep-alive default (minutes)
    pub fn new(default_keep_alive_minutes: u64) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            default_keep_alive_minutes: RwLock::new(default_keep_alive_minutes),
        }
    }

    /// Record the windows carried by an activation for `action`. Also moves
    /// the process-wide keep-alive default when the message carries one.
    pub fn record(&self, action_fqn: &str, hints: WindowHints) {
        self.windows
            .write()
            .unwrap()
            .insert(action_fqn.to_string(), hints);
        if hints.keep_alive > 0 {
            *self.default_keep_alive_minutes.write().unwrap() = hints.keep_alive;
        }
    }

    /// Windows last recorded for `action`, if any
    pub fn get(&self, action_fqn: &str) -> Option<WindowHints> {
        self.windows.read().unwrap().get(action_fqn).copied()
    }

    /// Pre-load window for `action` (minutes); 0 when unknown
    pub fn pre_load_window(&self, action_fqn: &str) -> u64 {
        self.get(action_fqn).map(|w| w.pre_load).unwrap_or(0)
    }

    /// Off-load delay for `action`: `off_load − keep_alive` minutes, or
    /// `None` when that difference is not positive.
    pub fn off_load_delay(&self, action_fqn: &str) -> Option<u64> {
        let hints = self.get(action_fqn)?;
        if hints.off_load > hints.keep_alive {
            Some(hints.off_load - hints.keep_alive)
        } else {
            None
        }
    }

    /// Current keep-alive default (minutes), used when constructing proxies
    pub fn default_keep_alive_minutes(&self) -> u64 {
        *self.default_keep_alive_minutes.read().unwrap()
    }
}
