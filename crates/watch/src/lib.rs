//! Vigil watch: turns a Kubernetes watch stream into `ChangeEvent`s with
//! before/after snapshots.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use kube::{
    api::Api,
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vigil_core::{ChangeEvent, ResourceSnapshot};

/// Remembers the last snapshot per object so updates and deletes carry a
/// `previous` side. The watch source only delivers the current state.
#[derive(Default)]
pub struct EventTracker {
    last_seen: FxHashMap<String, ResourceSnapshot>,
}

impl EventTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track_applied(&mut self, raw: Value) -> ChangeEvent {
        let key = track_key(&raw);
        let current = ResourceSnapshot::new(raw);
        let previous = self.last_seen.insert(key, current.clone());
        match previous {
            Some(prev) => ChangeEvent::updated(current, prev),
            None => ChangeEvent::created(current),
        }
    }

    pub fn track_deleted(&mut self, raw: Value) -> ChangeEvent {
        let key = track_key(&raw);
        let previous = self.last_seen.remove(&key);
        ChangeEvent::deleted(ResourceSnapshot::new(raw), previous)
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}

fn track_key(raw: &Value) -> String {
    let meta = raw.get("metadata");
    if let Some(uid) = meta.and_then(|m| m.get("uid")).and_then(|v| v.as_str()) {
        return uid.to_string();
    }
    // Objects without a uid (unlikely from a real apiserver) fall back to
    // namespace/name identity.
    format!(
        "{}/{}",
        meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).unwrap_or(""),
        meta.and_then(|m| m.get("name")).and_then(|v| v.as_str()).unwrap_or(""),
    )
}

fn strip_managed_fields(v: &mut Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn snapshot_json(obj: &DynamicObject) -> Result<Value> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}

fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind {
            group: String::new(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        [group, version, kind] => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(kube::core::ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Start list+watch for a GVK key and feed change events into the channel.
/// Runs until the stream ends or errors.
pub async fn start_watcher(
    gvk_key: &str,
    namespace: Option<&str>,
    event_tx: mpsc::Sender<ChangeEvent>,
) -> Result<()> {
    let client = Client::try_default().await?;
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;

    let api: Api<DynamicObject> = if namespaced {
        match namespace {
            Some(ns) => Api::namespaced_with(client.clone(), ns, &ar),
            None => Api::all_with(client.clone(), &ar),
        }
    } else {
        Api::all_with(client.clone(), &ar)
    };

    let cfg = watcher::Config::default();
    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);
    let mut tracker = EventTracker::new();
    info!(gvk = %gvk_key, ns = ?namespace, "watcher started");
    while let Some(ev) = stream.try_next().await? {
        match ev {
            Event::Applied(o) => {
                let change = tracker.track_applied(snapshot_json(&o)?);
                let _ = event_tx.send(change).await;
            }
            Event::Deleted(o) => {
                let change = tracker.track_deleted(snapshot_json(&o)?);
                let _ = event_tx.send(change).await;
            }
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                for o in list.iter() {
                    let change = tracker.track_applied(snapshot_json(o)?);
                    let _ = event_tx.send(change).await;
                }
            }
        }
    }
    warn!("watcher stream ended");
    Ok(())
}
