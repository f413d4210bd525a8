//! Vigil trigger evaluator: structural predicates over resource change
//! events, gated by the shared rate limiter.

#![forbid(unsafe_code)]

use std::sync::Arc;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::debug;
use vigil_core::{ChangeEvent, Error, ResourceSnapshot};
use vigil_limit::RateLimiter;

mod crash_loop;
mod field_diff;

pub use crash_loop::PodCrashLoopTrigger;
pub use field_diff::FieldDiffTrigger;

/// Per-evaluation context: the trigger instance id (one cooldown namespace
/// per configured trigger) and the process-wide limiter.
pub struct TriggerCtx<'a> {
    pub trigger_id: &'a str,
    pub limiter: &'a RateLimiter,
}

/// A fire/no-fire decision over one change event. Implementations must not
/// touch shared limiter state before their cheap structural checks pass.
pub trait Trigger: Send + Sync {
    fn evaluate(&self, event: &ChangeEvent, ctx: &TriggerCtx<'_>) -> Result<bool, Error>;
}

/// Generic matching shared by all trigger kinds: name prefix, namespace
/// prefix, and an equality label selector ("app=web,tier=frontend").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaseMatcher {
    pub name_prefix: Option<String>,
    pub namespace_prefix: Option<String>,
    pub labels_selector: Option<String>,
}

impl BaseMatcher {
    pub fn matches(&self, snap: &ResourceSnapshot) -> bool {
        if let Some(p) = self.name_prefix.as_deref() {
            if !snap.name().starts_with(p) {
                return false;
            }
        }
        if let Some(p) = self.namespace_prefix.as_deref() {
            if !snap.namespace().unwrap_or("").starts_with(p) {
                return false;
            }
        }
        if let Some(sel) = self.labels_selector.as_deref() {
            let labels = snap.labels();
            for pair in sel.split(',').filter(|s| !s.trim().is_empty()) {
                let Some((k, v)) = pair.split_once('=') else { continue };
                if !labels.iter().any(|(lk, lv)| *lk == k.trim() && *lv == v.trim()) {
                    return false;
                }
            }
        }
        true
    }
}

/// State-predicate trigger: base match plus an arbitrary closure over the
/// event. The escape hatch for conditions without a dedicated trigger kind.
pub struct PredicateTrigger {
    base: BaseMatcher,
    predicate: Box<dyn Fn(&ChangeEvent) -> bool + Send + Sync>,
}

impl PredicateTrigger {
    pub fn new<F>(base: BaseMatcher, predicate: F) -> Self
    where
        F: Fn(&ChangeEvent) -> bool + Send + Sync + 'static,
    {
        Self { base, predicate: Box::new(predicate) }
    }
}

impl Trigger for PredicateTrigger {
    fn evaluate(&self, event: &ChangeEvent, _ctx: &TriggerCtx<'_>) -> Result<bool, Error> {
        if !self.base.matches(&event.current) {
            return Ok(false);
        }
        Ok((self.predicate)(event))
    }
}

/// Dispatches one change event across all registered triggers. New trigger
/// kinds plug in as `Trigger` impls without touching this loop.
pub struct Evaluator {
    limiter: Arc<RateLimiter>,
    triggers: Vec<(String, Box<dyn Trigger>)>,
}

impl Evaluator {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter, triggers: Vec::new() }
    }

    pub fn register(&mut self, id: impl Into<String>, trigger: Box<dyn Trigger>) {
        self.triggers.push((id.into(), trigger));
    }

    /// Ids of the triggers that fired for this event. Events a trigger cannot
    /// interpret are expected traffic on a multiplexed stream and count as
    /// no-fire; diff errors (incompatible snapshots) propagate.
    pub fn evaluate(&self, event: &ChangeEvent) -> Result<Vec<String>, Error> {
        let mut fired = Vec::new();
        for (id, trigger) in &self.triggers {
            let ctx = TriggerCtx { trigger_id: id, limiter: &self.limiter };
            match trigger.evaluate(event, &ctx) {
                Ok(true) => {
                    counter!("trigger_fired_total", 1u64);
                    fired.push(id.clone());
                }
                Ok(false) => {}
                Err(Error::UnsupportedEventShape(msg)) => {
                    debug!(trigger = %id, %msg, "event shape not handled by trigger");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(fired)
    }
}
