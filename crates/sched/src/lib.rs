//! Vigil scheduler: deduplicated delay-sequence jobs.
//!
//! A series is keyed by a content hash of the action and its parameters;
//! re-installing under the same key replaces the pending series instead of
//! stacking a duplicate.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Deterministic fingerprint of "this action with these parameters". Object
/// keys are serialized in sorted order and tags are sorted, so structurally
/// equal inputs always hash to the same key.
pub fn action_hash(action_name: &str, params: &Value, extra_tags: &[(String, String)]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(action_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical(params).as_bytes());
    let mut tags: Vec<&(String, String)> = extra_tags.iter().collect();
    tags.sort();
    for (k, v) in tags {
        hasher.update([0u8]);
        hasher.update(k.as_bytes());
        hasher.update([b'=']);
        hasher.update(v.as_bytes());
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn canonical(v: &Value) -> String {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical(&map[k])))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

/// Performs the side-effecting work of a scheduled step. The scheduler calls
/// it opaquely and keeps going when a step fails.
#[async_trait::async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn run(&self, action_name: &str, params: &Value) -> anyhow::Result<()>;
}

struct SeriesHandle {
    id: Uuid,
    cancel: tokio::sync::oneshot::Sender<()>,
}

/// One pending timer task per series; installing a replacement cancels the
/// old timer under the table lock before arming the new one.
pub struct Scheduler {
    executor: Arc<dyn ActionExecutor>,
    pending: Arc<Mutex<FxHashMap<String, SeriesHandle>>>,
}

impl Scheduler {
    pub fn new(executor: Arc<dyn ActionExecutor>) -> Self {
        Self {
            executor,
            pending: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    /// Install a series of deferred invocations of `action_name`. Each delay
    /// is waited in turn, then the action runs once; after the last step the
    /// series is gone. With `replace_existing`, a pending series under the
    /// same key is cancelled first (its remaining steps never fire);
    /// otherwise the request is dropped.
    pub fn schedule_series(
        &self,
        dedup_key: &str,
        delays: &[Duration],
        action_name: &str,
        params: Value,
        replace_existing: bool,
    ) {
        if delays.is_empty() {
            debug!(key = %dedup_key, action = %action_name, "empty delay sequence; nothing to schedule");
            return;
        }
        let (cancel_tx, mut cancel_rx) = tokio::sync::oneshot::channel::<()>();
        let id = Uuid::new_v4();
        {
            let mut map = self.pending.lock().unwrap();
            if let Some(existing) = map.remove(dedup_key) {
                if !replace_existing {
                    debug!(key = %dedup_key, "series already pending; request ignored");
                    counter!("sched_dedup_skipped_total", 1u64);
                    map.insert(dedup_key.to_string(), existing);
                    return;
                }
                let _ = existing.cancel.send(());
                counter!("sched_replaced_total", 1u64);
            }
            map.insert(dedup_key.to_string(), SeriesHandle { id, cancel: cancel_tx });
        }
        counter!("sched_installed_total", 1u64);
        info!(key = %dedup_key, action = %action_name, steps = delays.len(), "series scheduled");

        let executor = Arc::clone(&self.executor);
        let pending = Arc::clone(&self.pending);
        let key = dedup_key.to_string();
        let action = action_name.to_string();
        let delays = delays.to_vec();
        tokio::spawn(async move {
            for (step, delay) in delays.iter().enumerate() {
                tokio::select! {
                    _ = &mut cancel_rx => {
                        debug!(key = %key, step, "series cancelled");
                        return;
                    }
                    _ = tokio::time::sleep(*delay) => {
                        if let Err(e) = executor.run(&action, &params).await {
                            // Best-effort steps: log and keep the rest of
                            // the sequence alive.
                            warn!(key = %key, action = %action, step, error = %e, "scheduled action failed");
                            counter!("sched_action_failed_total", 1u64);
                        }
                    }
                }
            }
            let mut map = pending.lock().unwrap();
            // Only remove our own entry; a replacement may own the key now.
            if map.get(&key).map(|h| h.id) == Some(id) {
                map.remove(&key);
            }
        });
    }

    /// Cancel a pending series without firing its remaining steps.
    pub fn cancel(&self, dedup_key: &str) -> bool {
        let mut map = self.pending.lock().unwrap();
        match map.remove(dedup_key) {
            Some(handle) => {
                let _ = handle.cancel.send(());
                counter!("sched_cancelled_total", 1u64);
                true
            }
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_hash_is_stable_across_key_order() {
        let a = serde_json::json!({ "delays": [60, 300], "name": "report" });
        let b = serde_json::json!({ "name": "report", "delays": [60, 300] });
        assert_eq!(
            action_hash("render", &a, &[]),
            action_hash("render", &b, &[])
        );
    }

    #[test]
    fn action_hash_separates_params_and_tags() {
        let p = serde_json::json!({ "name": "report" });
        let base = action_hash("render", &p, &[]);
        assert_ne!(base, action_hash("render", &serde_json::json!({ "name": "other" }), &[]));
        assert_ne!(base, action_hash("export", &p, &[]));
        assert_ne!(
            base,
            action_hash("render", &p, &[("key".into(), "deploy_web_prod".into())])
        );
        // Tag order does not matter.
        assert_eq!(
            action_hash("render", &p, &[("a".into(), "1".into()), ("b".into(), "2".into())]),
            action_hash("render", &p, &[("b".into(), "2".into()), ("a".into(), "1".into())]),
        );
    }

    struct NoopExecutor;

    #[async_trait::async_trait]
    impl ActionExecutor for NoopExecutor {
        async fn run(&self, _action_name: &str, _params: &Value) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn empty_delays_is_a_no_op() {
        let sched = Scheduler::new(Arc::new(NoopExecutor));
        sched.schedule_series("k", &[], "noop", Value::Null, true);
        assert_eq!(sched.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancel_removes_the_pending_series() {
        let sched = Scheduler::new(Arc::new(NoopExecutor));
        sched.schedule_series("k", &[Duration::from_secs(3600)], "noop", Value::Null, true);
        assert_eq!(sched.pending_count(), 1);
        assert!(sched.cancel("k"));
        assert_eq!(sched.pending_count(), 0);
        assert!(!sched.cancel("k"));
    }
}
