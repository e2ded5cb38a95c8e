//! The pluggable data model boundary and the built-in JSON model.
//!
//! The interpreter treats expressions as opaque strings: evaluation,
//! assignment and snapshotting are capabilities supplied per instance
//! at construction time. Every call receives the owning instance's
//! [`EvalContext`] explicitly; there is no ambient state.

use crate::expr::{is_truthy, Expr};
use serde_json::Value;
use statech_event::{Event, SessionId};
use statech_tree::DataDecl;
use std::collections::HashMap;
use thiserror::Error;

/// Errors from a data model handler.
///
/// `Parse` from a guard condition is fatal to the macrostep; everything
/// else surfaces as a recoverable `error.execution` event.
#[derive(Debug, Error)]
pub enum DataModelError {
    #[error("invalid expression '{expr}': {reason}")]
    Parse { expr: String, reason: String },

    #[error("evaluation failed: {reason}")]
    Evaluation { reason: String },

    #[error("assignment to '{location}' failed: {reason}")]
    Assignment { location: String, reason: String },

    #[error("data model snapshot failed: {reason}")]
    Snapshot { reason: String },
}

/// Evaluation context handed to every data model call.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    /// The owning instance.
    pub session_id: &'a SessionId,

    /// The event being processed, if any.
    pub event: Option<&'a Event>,
}

/// Per-instance expression/data capability.
pub trait DataModelHandler: Send {
    /// Seeds the model from the chart's data declarations.
    fn init(&mut self, decls: &[DataDecl], ctx: &EvalContext) -> Result<(), DataModelError>;

    /// Evaluates a guard condition to a boolean.
    fn evaluate_guard(&mut self, expr: &str, ctx: &EvalContext) -> Result<bool, DataModelError>;

    /// Evaluates an expression to a value.
    fn evaluate_value(&mut self, expr: &str, ctx: &EvalContext) -> Result<Value, DataModelError>;

    /// Assigns a value to a location.
    fn assign(&mut self, location: &str, value: Value, ctx: &EvalContext)
        -> Result<(), DataModelError>;

    /// Serializes the model for persistence.
    fn snapshot(&self) -> Result<Vec<u8>, DataModelError>;

    /// Restores the model from a persisted blob.
    fn restore(&mut self, blob: &[u8]) -> Result<(), DataModelError>;
}

/// The built-in JSON data model.
///
/// Context is a JSON object; the expression language lives in
/// [`crate::expr`]. Parsed expressions are cached per instance.
pub struct JsonDataModel {
    ctx: Value,
    cache: HashMap<String, Expr>,
}

impl JsonDataModel {
    pub fn new() -> Self {
        Self {
            ctx: Value::Object(serde_json::Map::new()),
            cache: HashMap::new(),
        }
    }

    /// Starts from an explicit context object.
    pub fn with_context(ctx: Value) -> Self {
        Self {
            ctx,
            cache: HashMap::new(),
        }
    }

    pub fn context(&self) -> &Value {
        &self.ctx
    }

    fn parsed(&mut self, expr: &str) -> Result<Expr, DataModelError> {
        if let Some(cached) = self.cache.get(expr) {
            return Ok(cached.clone());
        }
        let parsed = Expr::parse(expr)?;
        self.cache.insert(expr.to_string(), parsed.clone());
        Ok(parsed)
    }
}

impl Default for JsonDataModel {
    fn default() -> Self {
        Self::new()
    }
}

impl DataModelHandler for JsonDataModel {
    fn init(&mut self, decls: &[DataDecl], ctx: &EvalContext) -> Result<(), DataModelError> {
        for decl in decls {
            self.assign(&decl.id, decl.value.clone(), ctx)?;
        }
        Ok(())
    }

    fn evaluate_guard(&mut self, expr: &str, ctx: &EvalContext) -> Result<bool, DataModelError> {
        let parsed = self.parsed(expr)?;
        let value = parsed.evaluate(&self.ctx, ctx.event)?;
        Ok(is_truthy(&value))
    }

    fn evaluate_value(&mut self, expr: &str, ctx: &EvalContext) -> Result<Value, DataModelError> {
        let parsed = self.parsed(expr)?;
        parsed.evaluate(&self.ctx, ctx.event)
    }

    fn assign(
        &mut self,
        location: &str,
        value: Value,
        _ctx: &EvalContext,
    ) -> Result<(), DataModelError> {
        // Locations are dotted paths relative to the context root; a
        // leading `ctx.` is tolerated.
        let path = location.strip_prefix("ctx.").unwrap_or(location);
        if path.is_empty() {
            return Err(DataModelError::Assignment {
                location: location.to_string(),
                reason: "empty location".to_string(),
            });
        }

        let mut current = &mut self.ctx;
        let mut parts = path.split('.').peekable();
        while let Some(part) = parts.next() {
            let map = match current {
                Value::Object(map) => map,
                _ => {
                    return Err(DataModelError::Assignment {
                        location: location.to_string(),
                        reason: format!("'{part}' is not reachable through an object"),
                    })
                }
            };
            if parts.peek().is_none() {
                map.insert(part.to_string(), value);
                return Ok(());
            }
            current = map
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<u8>, DataModelError> {
        serde_json::to_vec(&self.ctx).map_err(|e| DataModelError::Snapshot {
            reason: e.to_string(),
        })
    }

    fn restore(&mut self, blob: &[u8]) -> Result<(), DataModelError> {
        self.ctx = serde_json::from_slice(blob).map_err(|e| DataModelError::Snapshot {
            reason: e.to_string(),
        })?;
        Ok(())
    }
}
