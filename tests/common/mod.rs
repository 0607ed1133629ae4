//! Shared test fixtures: a fake assistant executable standing in for the real
//! CLI, and small helpers for wiring up a scheduler + store pair.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use gateway_core::kernel::jobs::store::test_support::InMemoryJobStore;
use gateway_core::kernel::{JobStore, ProcessRunner, Scheduler, WebhookDispatcher};

/// A throwaway shell script standing in for the real assistant CLI. It
/// ignores every argument and prints fixed stream-json lines to stdout,
/// which is all the Process Runner's contract depends on.
pub struct FakeAssistant {
    pub path: PathBuf,
}

impl FakeAssistant {
    /// Emits each line verbatim to stdout, then exits 0.
    pub fn emitting(stdout_lines: &[&str]) -> Self {
        let body = stdout_lines.join("\n");
        Self::from_script(&format!("#!/bin/sh\ncat <<'EOF'\n{body}\nEOF\n"))
    }

    /// Touches `marker_path` before emitting, so tests can assert whether the
    /// assistant was ever actually spawned.
    pub fn emitting_with_marker(stdout_lines: &[&str], marker_path: &std::path::Path) -> Self {
        let body = stdout_lines.join("\n");
        let marker = marker_path.to_string_lossy();
        Self::from_script(&format!(
            "#!/bin/sh\ntouch '{marker}'\ncat <<'EOF'\n{body}\nEOF\n"
        ))
    }

    fn from_script(script: &str) -> Self {
        let path = std::env::temp_dir().join(format!("fake-assistant-{}.sh", uuid::Uuid::new_v4()));
        fs::write(&path, script).expect("write fake assistant script");
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        Self { path }
    }

    pub fn path_string(&self) -> String {
        self.path.to_string_lossy().to_string()
    }
}

impl Drop for FakeAssistant {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Build a scheduler over a fresh in-memory store and the given fake
/// executable, with sensible small-scale test defaults.
pub fn test_scheduler(executable_path: String, worker_count: usize) -> (Arc<dyn JobStore>, Arc<Scheduler>) {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        Arc::new(ProcessRunner::new(executable_path)),
        Arc::new(WebhookDispatcher::new()),
        100,
        worker_count,
        0,
        0,
        60,
        String::new(),
    ));
    (store, scheduler)
}
