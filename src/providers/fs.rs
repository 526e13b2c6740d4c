use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{
    HistoryStore, InstanceRecord, LoadedHistory, OrchestrationBatch, ProviderError, QueueKind, WorkItem, queue_name,
};
use crate::Event;

const COMMIT_FILE: &str = "commit.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueEntry {
    id: u64,
    item: WorkItem,
}

/// Journal written before a history append so the append and its outbox land together.
#[derive(Debug, Serialize, Deserialize)]
struct PendingCommit {
    base_version: u64,
    target_version: u64,
    outbox: Vec<(QueueKind, WorkItem)>,
}

struct Lease {
    instance: String,
    expires_at: Instant,
    entry_ids: Vec<u64>,
}

struct Locked {
    kind: QueueKind,
    entry_id: u64,
    expires_at: Instant,
}

/// Leases and peek-locks only live in memory: after a restart every queued item is
/// visible again and gets redelivered.
#[derive(Default)]
struct LockState {
    leases: HashMap<String, Lease>,
    locked: HashMap<String, Locked>,
    next_token: u64,
    next_entry_id: u64,
}

impl LockState {
    fn reclaim_expired(&mut self, now: Instant) {
        self.leases.retain(|_, l| l.expires_at > now);
        self.locked.retain(|_, l| l.expires_at > now);
    }

    fn invisible(&self, kind: QueueKind) -> Vec<u64> {
        match kind {
            QueueKind::Orchestrator => self.leases.values().flat_map(|l| l.entry_ids.iter().copied()).collect(),
            _ => self
                .locked
                .values()
                .filter(|l| l.kind == kind)
                .map(|l| l.entry_id)
                .collect(),
        }
    }

    fn token(&mut self, prefix: &str) -> String {
        self.next_token += 1;
        format!("{prefix}:{:x}-{:x}", std::process::id(), self.next_token)
    }
}

/// Filesystem-backed history store.
///
/// Layout under the root directory:
///
/// ```text
/// instances/<id>/record.json     instance record
/// instances/<id>/history.jsonl   one serialized Event per line, append-only
/// instances/<id>/commit.json     present only while an append is in flight
/// queues/<kind>.jsonl            one queued work item per line
/// ```
///
/// All operations of one store value are serialized by a process-local mutex. Only one
/// process may use a root directory at a time.
pub struct FsHistoryStore {
    root: PathBuf,
    state: Mutex<LockState>,
}

impl FsHistoryStore {
    /// Open (or create) a store rooted at `root` and finish any interrupted append.
    /// If `reset_on_create` is true, delete any existing data under the root first.
    pub async fn open(root: impl AsRef<Path>, reset_on_create: bool) -> Result<Self, ProviderError> {
        let root = root.as_ref().to_path_buf();
        if reset_on_create && fs::try_exists(&root).await? {
            fs::remove_dir_all(&root).await?;
        }
        fs::create_dir_all(root.join("instances")).await?;
        fs::create_dir_all(root.join("queues")).await?;

        let store = Self {
            root,
            state: Mutex::new(LockState::default()),
        };

        let mut max_id = 0;
        for kind in [QueueKind::Orchestrator, QueueKind::Worker, QueueKind::Timer] {
            if let Some(id) = store.read_queue(kind).await?.iter().map(|e| e.id).max() {
                max_id = max_id.max(id);
            }
        }
        store.state.lock().await.next_entry_id = max_id + 1;
        store.recover().await?;
        Ok(store)
    }

    fn queue_path(&self, kind: QueueKind) -> PathBuf {
        self.root.join("queues").join(format!("{}.jsonl", queue_name(kind)))
    }

    fn instance_dir(&self, instance: &str) -> Result<PathBuf, ProviderError> {
        if instance.is_empty()
            || instance.starts_with('.')
            || instance.contains(['/', '\\'])
            || instance.contains("..")
        {
            return Err(ProviderError::permanent(
                "instance_dir",
                format!("instance id not usable as a directory name: {instance:?}"),
            ));
        }
        Ok(self.root.join("instances").join(instance))
    }

    async fn recover(&self) -> Result<(), ProviderError> {
        let mut dirs = fs::read_dir(self.root.join("instances")).await?;
        while let Some(entry) = dirs.next_entry().await? {
            let commit_path = entry.path().join(COMMIT_FILE);
            if !fs::try_exists(&commit_path).await? {
                continue;
            }
            let commit: PendingCommit = serde_json::from_str(&fs::read_to_string(&commit_path).await?)?;
            let history_path = entry.path().join("history.jsonl");
            let (events, _) = read_history_file(&history_path).await?;
            let have = events.len() as u64;

            if have >= commit.target_version {
                let mut st = self.state.lock().await;
                self.push_outbox(&mut st, commit.outbox).await?;
            } else if have != commit.base_version {
                let keep = &events[..commit.base_version.min(have) as usize];
                write_lines(&history_path, keep).await?;
            }
            tracing::info!(
                target: "dureplay::providers::fs",
                instance_dir = %entry.path().display(),
                base_version = commit.base_version,
                target_version = commit.target_version,
                found = have,
                "recovered interrupted append"
            );
            fs::remove_file(&commit_path).await?;
        }
        Ok(())
    }

    async fn read_queue(&self, kind: QueueKind) -> Result<Vec<QueueEntry>, ProviderError> {
        let path = self.queue_path(kind);
        if !fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path).await?;
        Ok(content
            .lines()
            .filter_map(|l| serde_json::from_str::<QueueEntry>(l).ok())
            .collect())
    }

    async fn append_queue(&self, kind: QueueKind, entries: &[QueueEntry]) -> Result<(), ProviderError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buf = String::new();
        for entry in entries {
            buf.push_str(&serde_json::to_string(entry)?);
            buf.push('\n');
        }
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.queue_path(kind))
            .await?;
        f.write_all(buf.as_bytes()).await?;
        f.sync_data().await?;
        Ok(())
    }

    async fn remove_entries(&self, kind: QueueKind, ids: &[u64]) -> Result<(), ProviderError> {
        let remaining: Vec<QueueEntry> = self
            .read_queue(kind)
            .await?
            .into_iter()
            .filter(|e| !ids.contains(&e.id))
            .collect();
        write_lines(&self.queue_path(kind), &remaining).await
    }

    async fn push_outbox(&self, st: &mut LockState, outbox: Vec<(QueueKind, WorkItem)>) -> Result<(), ProviderError> {
        let mut by_kind: HashMap<QueueKind, Vec<QueueEntry>> = HashMap::new();
        for (kind, item) in outbox {
            by_kind.entry(kind).or_default().push(Self::next_entry(st, item));
        }
        for kind in [QueueKind::Orchestrator, QueueKind::Worker, QueueKind::Timer] {
            if let Some(entries) = by_kind.remove(&kind) {
                self.append_queue(kind, &entries).await?;
            }
        }
        Ok(())
    }

    fn next_entry(st: &mut LockState, item: WorkItem) -> QueueEntry {
        let id = st.next_entry_id.max(1);
        st.next_entry_id = id + 1;
        QueueEntry { id, item }
    }
}

/// Parse a history log. A torn trailing line from an interrupted write is dropped and
/// reported through the second tuple field.
async fn read_history_file(path: &Path) -> Result<(Vec<Event>, bool), ProviderError> {
    if !fs::try_exists(path).await? {
        return Ok((Vec::new(), false));
    }
    let data = fs::read_to_string(path).await?;
    let mut out = Vec::new();
    for line in data.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(line) {
            Ok(ev) => out.push(ev),
            Err(_) => return Ok((out, true)),
        }
    }
    Ok((out, false))
}

/// Rewrite a JSON-lines file atomically via a temp file and rename.
async fn write_lines<T: Serialize>(path: &Path, items: &[T]) -> Result<(), ProviderError> {
    let mut buf = String::new();
    for it in items {
        buf.push_str(&serde_json::to_string(it)?);
        buf.push('\n');
    }
    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut tf = fs::File::create(&tmp).await?;
        tf.write_all(buf.as_bytes()).await?;
        tf.sync_data().await?;
    }
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    async fn create_instance(&self, record: InstanceRecord) -> Result<(), ProviderError> {
        let dir = self.instance_dir(&record.instance)?;
        let mut st = self.state.lock().await;
        if fs::try_exists(dir.join("record.json")).await? {
            return Err(ProviderError::permanent(
                "create_instance",
                format!("instance already exists: {}", record.instance),
            ));
        }
        fs::create_dir_all(&dir).await?;
        fs::File::create(dir.join("history.jsonl")).await?;
        let tmp = dir.join("record.json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&record)?).await?;
        fs::rename(&tmp, dir.join("record.json")).await?;

        let start = WorkItem::StartOrchestration {
            instance: record.instance.clone(),
            orchestration: record.orchestration.clone(),
            input: record.input.clone(),
        };
        let entry = Self::next_entry(&mut st, start);
        self.append_queue(QueueKind::Orchestrator, &[entry]).await
    }

    async fn load(&self, instance: &str) -> Result<Option<LoadedHistory>, ProviderError> {
        let dir = self.instance_dir(instance)?;
        let _g = self.state.lock().await;
        let record_path = dir.join("record.json");
        if !fs::try_exists(&record_path).await? {
            return Ok(None);
        }
        let record: InstanceRecord = serde_json::from_str(&fs::read_to_string(&record_path).await?)?;
        let (history, _) = read_history_file(&dir.join("history.jsonl")).await?;
        let version = history.len() as u64;
        Ok(Some(LoadedHistory {
            record,
            history,
            version,
        }))
    }

    async fn append_if_version(
        &self,
        instance: &str,
        expected_version: u64,
        new_events: Vec<Event>,
        outbox: Vec<(QueueKind, WorkItem)>,
    ) -> Result<u64, ProviderError> {
        let dir = self.instance_dir(instance)?;
        let mut st = self.state.lock().await;
        if !fs::try_exists(dir.join("record.json")).await? {
            return Err(ProviderError::permanent(
                "append_if_version",
                format!("instance not found: {instance}"),
            ));
        }
        let history_path = dir.join("history.jsonl");
        let (existing, torn) = read_history_file(&history_path).await?;
        let actual = existing.len() as u64;
        if actual != expected_version {
            return Err(ProviderError::version_conflict(
                "append_if_version",
                instance,
                expected_version,
                actual,
            ));
        }
        if let Some((_, bad)) = new_events
            .iter()
            .enumerate()
            .find(|(i, e)| e.event_id != actual + 1 + *i as u64)
        {
            return Err(ProviderError::permanent(
                "append_if_version",
                format!("event id {} out of sequence at version {actual}", bad.event_id),
            ));
        }
        if torn {
            write_lines(&history_path, &existing).await?;
        }

        let target_version = actual + new_events.len() as u64;
        let commit = PendingCommit {
            base_version: actual,
            target_version,
            outbox,
        };
        let commit_path = dir.join(COMMIT_FILE);
        let tmp = dir.join("commit.json.tmp");
        fs::write(&tmp, serde_json::to_vec(&commit)?).await?;
        fs::rename(&tmp, &commit_path).await?;

        let mut buf = String::new();
        for e in &new_events {
            buf.push_str(&serde_json::to_string(e)?);
            buf.push('\n');
        }
        let mut f = fs::OpenOptions::new().append(true).open(&history_path).await?;
        f.write_all(buf.as_bytes()).await?;
        f.sync_data().await?;

        self.push_outbox(&mut st, commit.outbox).await?;
        fs::remove_file(&commit_path).await?;
        Ok(target_version)
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let _g = self.state.lock().await;
        let mut out = Vec::new();
        let mut dirs = fs::read_dir(self.root.join("instances")).await?;
        while let Some(entry) = dirs.next_entry().await? {
            if fs::try_exists(entry.path().join("record.json")).await? {
                out.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        out.sort();
        Ok(out)
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError> {
        let mut st = self.state.lock().await;
        let entry = Self::next_entry(&mut st, item);
        self.append_queue(kind, &[entry]).await
    }

    async fn list_ready_work_items(&self, kind: QueueKind) -> Result<Vec<WorkItem>, ProviderError> {
        let mut st = self.state.lock().await;
        st.reclaim_expired(Instant::now());
        let hidden = st.invisible(kind);
        let leased: Vec<String> = st.leases.values().map(|l| l.instance.clone()).collect();
        Ok(self
            .read_queue(kind)
            .await?
            .into_iter()
            .filter(|e| !hidden.contains(&e.id))
            .filter(|e| kind != QueueKind::Orchestrator || !leased.iter().any(|i| i == e.item.instance()))
            .map(|e| e.item)
            .collect())
    }

    async fn fetch_orchestration_batch(
        &self,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<OrchestrationBatch>, ProviderError> {
        let mut st = self.state.lock().await;
        let now = Instant::now();
        st.reclaim_expired(now);
        let hidden = st.invisible(QueueKind::Orchestrator);
        let leased: Vec<String> = st.leases.values().map(|l| l.instance.clone()).collect();

        let visible: Vec<QueueEntry> = self
            .read_queue(QueueKind::Orchestrator)
            .await?
            .into_iter()
            .filter(|e| !hidden.contains(&e.id))
            .collect();
        let Some(instance) = visible
            .iter()
            .map(|e| e.item.instance())
            .find(|inst| !leased.iter().any(|l| l == inst))
            .map(str::to_string)
        else {
            return Ok(None);
        };

        let batch: Vec<QueueEntry> = visible.into_iter().filter(|e| e.item.instance() == instance).collect();
        let lock_token = st.token("o");
        tracing::debug!(
            target: "dureplay::providers::fs",
            instance_id = %instance,
            owner = %owner,
            messages = batch.len(),
            "leased orchestration batch"
        );
        st.leases.insert(
            lock_token.clone(),
            Lease {
                instance: instance.clone(),
                expires_at: now + lease,
                entry_ids: batch.iter().map(|e| e.id).collect(),
            },
        );
        Ok(Some(OrchestrationBatch {
            instance,
            lock_token,
            messages: batch.into_iter().map(|e| e.item).collect(),
        }))
    }

    async fn renew_orchestration_lease(&self, lock_token: &str, lease: Duration) -> Result<(), ProviderError> {
        let mut st = self.state.lock().await;
        let l = st
            .leases
            .get_mut(lock_token)
            .ok_or_else(|| ProviderError::permanent("renew_orchestration_lease", "lease not held"))?;
        l.expires_at = Instant::now() + lease;
        Ok(())
    }

    async fn ack_orchestration_batch(&self, lock_token: &str) -> Result<(), ProviderError> {
        let mut st = self.state.lock().await;
        let lease = st
            .leases
            .remove(lock_token)
            .ok_or_else(|| ProviderError::permanent("ack_orchestration_batch", "lease not held"))?;
        self.remove_entries(QueueKind::Orchestrator, &lease.entry_ids).await
    }

    async fn abandon_orchestration_batch(&self, lock_token: &str) -> Result<(), ProviderError> {
        // Entries never left the queue file; dropping the lease makes them visible again
        // at their original position.
        let mut st = self.state.lock().await;
        st.leases
            .remove(lock_token)
            .map(|_| ())
            .ok_or_else(|| ProviderError::permanent("abandon_orchestration_batch", "lease not held"))
    }

    async fn dequeue_work(&self, kind: QueueKind, lock: Duration) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let mut st = self.state.lock().await;
        let now = Instant::now();
        st.reclaim_expired(now);
        let hidden = st.invisible(kind);
        let Some(entry) = self
            .read_queue(kind)
            .await?
            .into_iter()
            .find(|e| !hidden.contains(&e.id))
        else {
            return Ok(None);
        };
        let token = st.token(&queue_name(kind)[..1]);
        st.locked.insert(
            token.clone(),
            Locked {
                kind,
                entry_id: entry.id,
                expires_at: now + lock,
            },
        );
        Ok(Some((entry.item, token)))
    }

    async fn renew_work_lock(&self, kind: QueueKind, lock_token: &str, lock: Duration) -> Result<(), ProviderError> {
        let mut st = self.state.lock().await;
        match st.locked.get_mut(lock_token) {
            Some(l) if l.kind == kind => {
                l.expires_at = Instant::now() + lock;
                Ok(())
            }
            _ => Err(ProviderError::permanent("renew_work_lock", "lock not held")),
        }
    }

    async fn ack_work(
        &self,
        kind: QueueKind,
        lock_token: &str,
        completion: Option<WorkItem>,
    ) -> Result<(), ProviderError> {
        let mut st = self.state.lock().await;
        let entry_id = match st.locked.get(lock_token) {
            Some(l) if l.kind == kind => l.entry_id,
            _ => return Err(ProviderError::permanent("ack_work", "lock not held")),
        };
        // Completion first: a crash in between redelivers the work, never loses the result.
        if let Some(item) = completion {
            let entry = Self::next_entry(&mut st, item);
            self.append_queue(QueueKind::Orchestrator, &[entry]).await?;
        }
        self.remove_entries(kind, &[entry_id]).await?;
        st.locked.remove(lock_token);
        Ok(())
    }

    async fn abandon_work(&self, kind: QueueKind, lock_token: &str) -> Result<(), ProviderError> {
        let mut st = self.state.lock().await;
        match st.locked.get(lock_token) {
            Some(l) if l.kind == kind => {
                st.locked.remove(lock_token);
                Ok(())
            }
            _ => Err(ProviderError::permanent("abandon_work", "lock not held")),
        }
    }
}
