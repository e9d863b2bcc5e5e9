// Reshapes JSON records produced by earlier steps

use crate::workflow::{StepHandler, StepInput};
use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TransformConfig {
    #[serde(default)]
    input: Value,
    /// Keep only these fields
    #[serde(default)]
    select: Option<Vec<String>>,
    #[serde(default)]
    drop: Vec<String>,
    #[serde(default)]
    rename: BTreeMap<String, String>,
    /// Multiply numeric fields by a factor
    #[serde(default)]
    scale: BTreeMap<String, Number>,
    #[serde(default)]
    set: Map<String, Value>,
}

impl TransformConfig {
    fn is_identity(&self) -> bool {
        self.select.is_none()
            && self.drop.is_empty()
            && self.rename.is_empty()
            && self.scale.is_empty()
            && self.set.is_empty()
    }

    /// Operations apply in a fixed order: select, drop, rename, scale, set
    fn apply(&self, record: &Map<String, Value>) -> Result<Map<String, Value>> {
        let mut out = match &self.select {
            Some(fields) => fields
                .iter()
                .filter_map(|f| record.get(f).map(|v| (f.clone(), v.clone())))
                .collect(),
            None => record.clone(),
        };

        for field in &self.drop {
            out.remove(field);
        }

        for (from, to) in &self.rename {
            if let Some(value) = out.remove(from) {
                out.insert(to.clone(), value);
            }
        }

        for (field, factor) in &self.scale {
            if let Some(value) = out.get_mut(field) {
                *value = scale_number(value, factor)
                    .with_context(|| format!("cannot scale field '{}'", field))?;
            }
        }

        for (field, value) in &self.set {
            out.insert(field.clone(), value.clone());
        }

        Ok(out)
    }
}

fn scale_number(value: &Value, factor: &Number) -> Result<Value> {
    let Value::Number(n) = value else {
        bail!("value {} is not a number", value);
    };

    if let (Some(a), Some(b)) = (n.as_i64(), factor.as_i64()) {
        if let Some(product) = a.checked_mul(b) {
            return Ok(Value::from(product));
        }
    }

    let product = n.as_f64().unwrap_or(0.0) * factor.as_f64().unwrap_or(0.0);
    Number::from_f64(product)
        .map(Value::Number)
        .ok_or_else(|| anyhow!("result is not a finite number"))
}

/// Handler for `transform` steps.
///
/// Config: `{ "input": .., "select"?: [..], "drop"?: [..], "rename"?: {..},
/// "scale"?: {..}, "set"?: {..} }`. The input is an object or an array of
/// objects; array inputs are transformed element by element.
pub struct TransformHandler;

impl TransformHandler {
    pub fn transform(config: Value) -> Result<Value> {
        let config: TransformConfig =
            serde_json::from_value(config).context("Invalid transform configuration")?;

        if config.input.is_null() {
            bail!("transform input is missing");
        }
        if config.is_identity() {
            return Ok(config.input);
        }

        match &config.input {
            Value::Object(record) => Ok(Value::Object(config.apply(record)?)),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| match item {
                    Value::Object(record) => config.apply(record).map(Value::Object),
                    other => Err(anyhow!("element {} is not an object: {}", i, other)),
                })
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            other => bail!("transform input must be an object or an array of objects, got {}", other),
        }
    }
}

#[async_trait::async_trait]
impl StepHandler for TransformHandler {
    async fn execute(&self, input: StepInput) -> Result<Value> {
        Self::transform(input.config)
    }
}
