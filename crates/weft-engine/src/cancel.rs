use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use weft_core::types::ExecutionId;

/// Cooperative cancellation flags, keyed by execution id.
///
/// A worker registers a flag when it claims a job and removes it when the
/// attempt ends. A cancel request for an execution that is not running yet
/// leaves a raised flag behind, which the worker picks up on claim.
pub struct CancelRegistry {
    flags: Mutex<HashMap<String, Entry>>,
}

struct Entry {
    flag: Arc<AtomicBool>,
    running: bool,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self {
            flags: Mutex::new(HashMap::new()),
        }
    }

    /// Flag for an attempt about to run, keeping any earlier request.
    pub fn register(&self, id: &ExecutionId) -> Arc<AtomicBool> {
        let mut flags = self.flags.lock().unwrap();
        let entry = flags.entry(id.to_string()).or_insert_with(|| Entry {
            flag: Arc::new(AtomicBool::new(false)),
            running: false,
        });
        entry.running = true;
        entry.flag.clone()
    }

    /// Raise the flag. Returns true if the execution is currently running.
    pub fn request(&self, id: &ExecutionId) -> bool {
        let mut flags = self.flags.lock().unwrap();
        let entry = flags.entry(id.to_string()).or_insert_with(|| Entry {
            flag: Arc::new(AtomicBool::new(false)),
            running: false,
        });
        entry.flag.store(true, Ordering::SeqCst);
        entry.running
    }

    pub fn is_requested(&self, id: &ExecutionId) -> bool {
        self.flags
            .lock()
            .unwrap()
            .get(id.as_str())
            .is_some_and(|e| e.flag.load(Ordering::SeqCst))
    }

    /// Forget an execution once its attempt ends.
    pub fn remove(&self, id: &ExecutionId) {
        self.flags.lock().unwrap().remove(id.as_str());
    }

    /// Executions currently registered as running.
    pub fn running(&self) -> usize {
        self.flags.lock().unwrap().values().filter(|e| e.running).count()
    }
}

impl Default for CancelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
