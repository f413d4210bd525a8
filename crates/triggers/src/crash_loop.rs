//! Crash-loop trigger: fires when a pod's containers keep restarting.

use k8s_openapi::api::core::v1::Pod;
use vigil_core::{ChangeEvent, Error, Op};

use crate::{BaseMatcher, Trigger, TriggerCtx};

/// Fires once per cooldown window when a pod (grouped under its owning
/// controller) has a container waiting with too many restarts.
pub struct PodCrashLoopTrigger {
    pub base: BaseMatcher,
    /// Fire only at or above this restart count.
    pub restart_count: i32,
    /// Restrict to waiting reasons containing this substring (e.g.
    /// "CrashLoopBackOff"). All reasons when unset.
    pub restart_reason: Option<String>,
    /// Cooldown window per rate-limit identity.
    pub rate_limit_secs: i64,
}

impl Default for PodCrashLoopTrigger {
    fn default() -> Self {
        Self {
            base: BaseMatcher::default(),
            restart_count: 2,
            restart_reason: None,
            rate_limit_secs: 3600,
        }
    }
}

impl Trigger for PodCrashLoopTrigger {
    fn evaluate(&self, event: &ChangeEvent, ctx: &TriggerCtx<'_>) -> Result<bool, Error> {
        // Cheap structural checks first so irrelevant high-volume events
        // never reach the shared limiter.
        if !self.base.matches(&event.current) {
            return Ok(false);
        }
        if event.op != Op::Update || event.current.kind() != "Pod" {
            return Ok(false);
        }
        let pod: Pod = serde_json::from_value(event.current.raw().clone())
            .map_err(|e| Error::UnsupportedEventShape(format!("not a pod: {e}")))?;
        let status = pod
            .status
            .ok_or_else(|| Error::UnsupportedEventShape("pod without status".into()))?;

        let mut all = status.container_statuses.unwrap_or_default();
        all.extend(status.init_container_statuses.unwrap_or_default());
        let crashing = all.iter().any(|cs| {
            let Some(waiting) = cs.state.as_ref().and_then(|s| s.waiting.as_ref()) else {
                return false;
            };
            cs.restart_count >= self.restart_count
                && self
                    .restart_reason
                    .as_deref()
                    .map_or(true, |r| waiting.reason.as_deref().unwrap_or("").contains(r))
        });
        if !crashing {
            return Ok(false);
        }

        // Group replacement pods of the same controller under one cooldown.
        let owner = event
            .current
            .owner_name()
            .unwrap_or_else(|| event.current.name());
        let identity = format!("{}:{}", owner, event.current.namespace().unwrap_or(""));
        Ok(ctx
            .limiter
            .mark_and_test(ctx.trigger_id, &identity, self.rate_limit_secs))
    }
}
