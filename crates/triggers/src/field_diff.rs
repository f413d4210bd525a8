//! Field-diff trigger: fires when an update changes one of the monitored
//! fields anywhere in the object.

use vigil_core::{ChangeEvent, Error, Op};
use vigil_diff::{diff, matches_monitored_fields};

use crate::{BaseMatcher, Trigger, TriggerCtx};

pub struct FieldDiffTrigger {
    pub base: BaseMatcher,
    /// Field names matched against path segments of each diff (array indices
    /// stripped), e.g. "image".
    pub monitored_fields: Vec<String>,
}

impl FieldDiffTrigger {
    pub fn new(base: BaseMatcher, monitored_fields: Vec<String>) -> Self {
        Self { base, monitored_fields }
    }
}

impl Trigger for FieldDiffTrigger {
    fn evaluate(&self, event: &ChangeEvent, _ctx: &TriggerCtx<'_>) -> Result<bool, Error> {
        if !self.base.matches(&event.current) {
            return Ok(false);
        }
        match event.op {
            Op::Delete => Ok(false),
            // A brand-new object always qualifies.
            Op::Create => Ok(true),
            Op::Update => {
                let prev = event.previous.as_ref().ok_or_else(|| {
                    Error::UnsupportedEventShape("update without previous snapshot".into())
                })?;
                let diffs = diff(prev, &event.current)?;
                Ok(matches_monitored_fields(&diffs, &self.monitored_fields))
            }
        }
    }
}
