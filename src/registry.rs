//! Engine registry for embedders.
//!
//! Callers that cannot hold a [`Memex`] directly (FFI, host runtimes) work
//! through small integer handles: `init` allocates an engine from a JSON
//! config, `destroy` releases it, and every operation revalidates the handle.
//! Handles come from a monotone counter, never from a pointer, and each one
//! carries its own last-error slot so callers without typed errors can ask
//! what just failed. There is no global state; the embedding layer owns the
//! registry instance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::engine::Memex;
use crate::error::{Error, Result};

/// Code and message of the most recent failure on one handle.
#[derive(Debug, Clone)]
pub struct LastError {
    pub code: i32,
    pub message: String,
}

struct Entry {
    engine: Arc<Memex>,
    last_error: Arc<Mutex<Option<LastError>>>,
}

pub struct Registry {
    engines: Mutex<HashMap<u64, Entry>>,
    next_handle: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            engines: Mutex::new(HashMap::new()),
            // 0 is reserved as the invalid handle
            next_handle: AtomicU64::new(1),
        }
    }

    /// Allocate an engine from a JSON config document.
    pub fn init(&self, config_json: &str) -> Result<u64> {
        let engine = Memex::from_json(config_json)?;
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);

        let mut engines = self.engines.lock().expect("registry mutex poisoned");
        engines.insert(
            handle,
            Entry {
                engine: Arc::new(engine),
                last_error: Arc::new(Mutex::new(None)),
            },
        );
        tracing::info!(handle, "engine registered");
        Ok(handle)
    }

    /// Release an engine. Returns false for an unknown handle. In-flight
    /// operations holding the engine finish before it shuts down.
    pub fn destroy(&self, handle: u64) -> bool {
        let removed = self
            .engines
            .lock()
            .expect("registry mutex poisoned")
            .remove(&handle);
        if removed.is_some() {
            tracing::info!(handle, "engine destroyed");
        }
        removed.is_some()
    }

    /// A handle is valid when it is registered and its engine has not been
    /// poisoned by storage corruption.
    pub fn is_valid(&self, handle: u64) -> bool {
        self.engines
            .lock()
            .expect("registry mutex poisoned")
            .get(&handle)
            .map(|entry| entry.engine.is_valid())
            .unwrap_or(false)
    }

    /// Run one operation against a handle, recording the outcome in the
    /// handle's last-error slot.
    pub fn with<T>(&self, handle: u64, f: impl FnOnce(&Memex) -> Result<T>) -> Result<T> {
        let (engine, slot) = {
            let engines = self.engines.lock().expect("registry mutex poisoned");
            let Some(entry) = engines.get(&handle) else {
                return Err(Error::NotFound(format!("handle {handle}")));
            };
            (Arc::clone(&entry.engine), Arc::clone(&entry.last_error))
        };

        let result = f(&engine);
        let mut last_error = slot.lock().expect("last-error mutex poisoned");
        match &result {
            Ok(_) => *last_error = None,
            Err(e) => {
                *last_error = Some(LastError {
                    code: e.code(),
                    message: e.to_string(),
                })
            }
        }
        result
    }

    /// Code of the most recent failure on this handle; 0 when the last
    /// operation succeeded, -1 for an unknown handle.
    pub fn last_error(&self, handle: u64) -> i32 {
        let engines = self.engines.lock().expect("registry mutex poisoned");
        match engines.get(&handle) {
            Some(entry) => entry
                .last_error
                .lock()
                .expect("last-error mutex poisoned")
                .as_ref()
                .map(|e| e.code)
                .unwrap_or(0),
            None => -1,
        }
    }

    /// Message of the most recent failure on this handle, if any.
    pub fn last_error_message(&self, handle: u64) -> Option<String> {
        let engines = self.engines.lock().expect("registry mutex poisoned");
        engines.get(&handle).and_then(|entry| {
            entry
                .last_error
                .lock()
                .expect("last-error mutex poisoned")
                .as_ref()
                .map(|e| e.message.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::MemoryDraft;
    use tempfile::TempDir;

    fn config_json(dir: &TempDir) -> String {
        format!(
            r#"{{"database_path": "{}", "enable_request_limits": false, "auto_decay_enabled": false}}"#,
            dir.path().join("reg.db").display()
        )
    }

    #[test]
    fn init_and_destroy_lifecycle() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::new();

        let handle = registry.init(&config_json(&dir)).unwrap();
        assert_ne!(handle, 0);
        assert!(registry.is_valid(handle));

        assert!(registry.destroy(handle));
        assert!(!registry.is_valid(handle));
        assert!(!registry.destroy(handle));
    }

    #[test]
    fn handles_are_unique_and_monotone() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let registry = Registry::new();

        let a = registry.init(&config_json(&dir_a)).unwrap();
        let b = registry.init(&config_json(&dir_b)).unwrap();
        assert!(b > a);
    }

    #[test]
    fn bad_config_fails_init() {
        let registry = Registry::new();
        let err = registry.init("{broken").unwrap_err();
        assert_eq!(err.kind(), "BadConfig");
    }

    #[test]
    fn with_runs_operations_and_tracks_errors() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::new();
        let handle = registry.init(&config_json(&dir)).unwrap();

        let id = registry
            .with(handle, |engine| {
                engine.save(MemoryDraft::new("alice", "s1", "registry save"))
            })
            .unwrap();
        assert!(!id.is_empty());
        assert_eq!(registry.last_error(handle), 0);

        let mut bad = MemoryDraft::new("alice", "s1", "bad importance");
        bad.importance = 1.5;
        let err = registry
            .with(handle, |engine| engine.save(bad))
            .unwrap_err();
        assert_eq!(err.kind(), "Invalid");
        assert_eq!(registry.last_error(handle), err.code());
        assert!(registry
            .last_error_message(handle)
            .unwrap()
            .contains("importance"));

        // the slot clears on the next success
        registry
            .with(handle, |engine| {
                engine.save(MemoryDraft::new("alice", "s1", "after failure"))
            })
            .unwrap();
        assert_eq!(registry.last_error(handle), 0);
    }

    #[test]
    fn unknown_handle_is_not_found() {
        let registry = Registry::new();
        let err = registry.with(42, |engine| engine.get_memory("x")).unwrap_err();
        assert_eq!(err.kind(), "NotFound");
        assert_eq!(registry.last_error(42), -1);
    }
}
