//! Per-run store of step results and outputs.
//!
//! Every step owns exactly one slot, allocated when the run is prepared. The
//! scheduler is the only writer and writes a slot only on behalf of the step
//! that owns it. Outputs live in a write-once cell, so downstream readers get
//! a plain reference without taking a lock.

use crate::error::ContextError;
use crate::types::{StepId, StepResult, StepStatus};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, OnceLock, PoisonError, RwLock};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\s*([^}\s]+)\s*\}").expect("placeholder pattern is valid")
});

struct Slot {
    id: StepId,
    record: RwLock<StepResult>,
    output: OnceLock<Value>,
}

impl Slot {
    fn read(&self) -> StepResult {
        self.record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Results and outputs of one run
pub struct ExecutionContext {
    index: HashMap<StepId, usize>,
    slots: Vec<Slot>,
}

impl ExecutionContext {
    /// Allocate one pending slot per step
    pub fn new(step_ids: impl IntoIterator<Item = StepId>) -> Self {
        let mut index = HashMap::new();
        let mut slots = Vec::new();

        for id in step_ids {
            if index.contains_key(&id) {
                continue;
            }
            index.insert(id.clone(), slots.len());
            slots.push(Slot {
                id,
                record: RwLock::new(StepResult::pending()),
                output: OnceLock::new(),
            });
        }

        Self { index, slots }
    }

    fn slot(&self, step_id: &StepId) -> Result<&Slot, ContextError> {
        self.index
            .get(step_id)
            .map(|&i| &self.slots[i])
            .ok_or_else(|| ContextError::UnknownStep(step_id.clone()))
    }

    /// Move a pending step to running and stamp its start time
    pub fn mark_running(&self, step_id: &StepId) -> Result<DateTime<Utc>, ContextError> {
        let slot = self.slot(step_id)?;
        let mut record = slot.record.write().unwrap_or_else(PoisonError::into_inner);

        if record.status.is_terminal() {
            return Err(ContextError::AlreadyFinalized(step_id.clone()));
        }

        let started_at = Utc::now();
        record.status = StepStatus::Running;
        record.started_at = Some(started_at);
        Ok(started_at)
    }

    /// Record the terminal result of a step.
    ///
    /// A slot is finalized once: a second terminal write is rejected with
    /// [`ContextError::AlreadyFinalized`] and the first result stays in place.
    pub fn set_result(&self, step_id: &StepId, result: StepResult) -> Result<(), ContextError> {
        if !result.status.is_terminal() {
            return Err(ContextError::NotTerminal(step_id.clone()));
        }

        let slot = self.slot(step_id)?;
        let mut record = slot.record.write().unwrap_or_else(PoisonError::into_inner);

        if record.status.is_terminal() {
            return Err(ContextError::AlreadyFinalized(step_id.clone()));
        }

        let output = if result.status == StepStatus::Completed {
            result.output
        } else {
            None
        };
        if let Some(value) = &output {
            let _ = slot.output.set(value.clone());
        }

        let started_at = result.started_at.or(record.started_at);
        *record = StepResult {
            output,
            started_at,
            ..result
        };
        Ok(())
    }

    /// Raw output of a completed step
    pub fn get_output(&self, step_id: &StepId) -> Option<&Value> {
        self.index
            .get(step_id)
            .and_then(|&i| self.slots[i].output.get())
    }

    pub fn result(&self, step_id: &StepId) -> Option<StepResult> {
        self.slot(step_id).ok().map(Slot::read)
    }

    pub fn status(&self, step_id: &StepId) -> Option<StepStatus> {
        self.slot(step_id)
            .ok()
            .map(|slot| slot.record.read().unwrap_or_else(PoisonError::into_inner).status)
    }

    pub fn contains(&self, step_id: &StepId) -> bool {
        self.index.contains_key(step_id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Copy of every step's current result
    pub fn snapshot(&self) -> HashMap<StepId, StepResult> {
        self.slots
            .iter()
            .map(|slot| (slot.id.clone(), slot.read()))
            .collect()
    }

    /// Read-only handle given to step handlers
    pub fn view(self: &Arc<Self>) -> ContextView {
        ContextView {
            inner: Arc::clone(self),
        }
    }
}

/// Read-only access to the outputs of earlier steps
#[derive(Clone)]
pub struct ContextView {
    inner: Arc<ExecutionContext>,
}

impl ContextView {
    pub fn output(&self, step_id: &StepId) -> Option<&Value> {
        self.inner.get_output(step_id)
    }

    pub fn status(&self, step_id: &StepId) -> Option<StepStatus> {
        self.inner.status(step_id)
    }

    /// Resolve `step` or `step.path.to.field` against the recorded outputs.
    /// A reference that names a step id containing dots verbatim wins over a path.
    pub fn lookup(&self, reference: &str) -> Option<&Value> {
        if let Some(value) = self.inner.get_output(&StepId::new(reference)) {
            return Some(value);
        }

        let (step, path) = reference.split_once('.')?;
        let root = self.inner.get_output(&StepId::new(step))?;
        let pointer = format!("/{}", path.replace('.', "/"));
        root.pointer(&pointer)
    }

    /// Substitute `${...}` placeholders in every string of a JSON value.
    ///
    /// A string that is exactly one placeholder becomes the referenced JSON value
    /// (`null` when absent). Placeholders embedded in longer text are rendered as
    /// text, with absent values rendered as the empty string.
    pub fn interpolate_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => self.interpolate_string_value(s),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.interpolate_value(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.interpolate_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn interpolate_string_value(&self, s: &str) -> Value {
        if let Some(caps) = PLACEHOLDER.captures(s) {
            if caps.get(0).map(|m| m.as_str().len()) == Some(s.len()) {
                return self.lookup(&caps[1]).cloned().unwrap_or(Value::Null);
            }
        }
        Value::String(self.interpolate_str(s))
    }

    /// Substitute `${...}` placeholders as text
    pub fn interpolate_str(&self, s: &str) -> String {
        PLACEHOLDER
            .replace_all(s, |caps: &regex::Captures| match self.lookup(&caps[1]) {
                Some(Value::String(text)) => text.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            })
            .into_owned()
    }
}
