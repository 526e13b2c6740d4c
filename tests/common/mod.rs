#![allow(dead_code)]

pub mod fault_injection;

use dureplay::providers::HistoryStore;
use dureplay::providers::fs::FsHistoryStore;
use dureplay::providers::in_memory::InMemoryHistoryStore;
use dureplay::{Event, EventKind, RuntimeOptions};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub fn in_memory_store() -> Arc<dyn HistoryStore> {
    Arc::new(InMemoryHistoryStore::default())
}

pub async fn create_fs_store() -> (Arc<dyn HistoryStore>, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let store = FsHistoryStore::open(td.path(), true).await.unwrap();
    (Arc::new(store) as Arc<dyn HistoryStore>, td)
}

/// Options with short poll intervals so tests do not idle.
pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        dispatcher_idle_sleep: Duration::from_millis(2),
        ..Default::default()
    }
}

pub async fn wait_for_history<F>(store: Arc<dyn HistoryStore>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Ok(Some(loaded)) = store.load(instance).await
            && predicate(&loaded.history)
        {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until the orchestration has issued a wait for `name`.
pub async fn wait_for_subscription(store: Arc<dyn HistoryStore>, instance: &str, name: &str, timeout_ms: u64) -> bool {
    wait_for_history(
        store,
        instance,
        |hist| {
            hist.iter().any(|e| {
                matches!(
                    &e.kind,
                    EventKind::TimerCreated {
                        purpose: dureplay::TimerPurpose::EventTimeout { name: n },
                        ..
                    } if n == name
                )
            })
        },
        timeout_ms,
    )
    .await
}

pub fn type_names(history: &[Event]) -> Vec<&'static str> {
    history.iter().map(|e| e.kind.type_name()).collect()
}
