//! Handler result shapes and their validation.
//!
//! Tool handlers may return a string (wrapped as successful output) or an
//! object `{ success, output, error }`. Skill handlers may return a string
//! (wrapped as the response) or `{ success, response, actions, error }`.
//! Exactly one of success-with-payload or failure-with-error is accepted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PluginError, PluginResult};

/// Outcome of a tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the tool succeeded.
    pub success: bool,
    /// Output text on success.
    pub output: Option<String>,
    /// Error message on failure.
    pub error: Option<String>,
}

impl ToolResult {
    /// Successful result.
    #[must_use]
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
        }
    }

    /// Failed result.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }

    /// Render a host-side error in the same wire shape.
    #[must_use]
    pub fn from_error(err: &PluginError) -> Self {
        Self::failed(err.to_string())
    }
}

/// Something the host should do on behalf of a skill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillAction {
    /// Action discriminator, interpreted by the host.
    pub action_type: String,
    /// Opaque payload.
    #[serde(default)]
    pub data: Value,
}

/// Outcome of a skill call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillResult {
    /// Whether the skill succeeded.
    pub success: bool,
    /// Response text on success.
    pub response: Option<String>,
    /// Requested host actions.
    #[serde(default)]
    pub actions: Vec<SkillAction>,
    /// Error message on failure.
    pub error: Option<String>,
}

impl SkillResult {
    /// Successful response without actions.
    #[must_use]
    pub fn ok(response: impl Into<String>) -> Self {
        Self {
            success: true,
            response: Some(response.into()),
            actions: Vec::new(),
            error: None,
        }
    }

    /// Failed result.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            response: None,
            actions: Vec::new(),
            error: Some(error.into()),
        }
    }
}

fn invalid(handler: &str, reason: impl Into<String>) -> PluginError {
    PluginError::InvalidResult {
        handler: handler.to_string(),
        reason: reason.into(),
    }
}

fn optional_string(handler: &str, obj: &serde_json::Map<String, Value>, field: &str) -> PluginResult<Option<String>> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(invalid(
            handler,
            format!("'{field}' must be a string or null, got {}", type_name(other)),
        )),
    }
}

/// Split `{success, <payload>, error}` into a checked pair.
fn split_outcome(
    handler: &str,
    obj: &serde_json::Map<String, Value>,
    payload_field: &str,
) -> PluginResult<Result<String, String>> {
    let success = obj
        .get("success")
        .and_then(Value::as_bool)
        .ok_or_else(|| invalid(handler, "'success' must be a boolean"))?;
    let payload = optional_string(handler, obj, payload_field)?;
    let error = optional_string(handler, obj, "error")?;

    match (success, payload, error) {
        (true, Some(p), None) => Ok(Ok(p)),
        (true, None, _) => Err(invalid(
            handler,
            format!("success=true requires '{payload_field}'"),
        )),
        (true, Some(_), Some(_)) => Err(invalid(handler, "success=true must not carry 'error'")),
        (false, _, Some(e)) if !e.is_empty() => Ok(Err(e)),
        (false, _, _) => Err(invalid(handler, "success=false requires a non-empty 'error'")),
    }
}

/// Validate a tool handler's return value.
///
/// # Errors
///
/// Returns [`PluginError::InvalidResult`] if the value does not match the
/// tool result shape.
pub fn tool_result_from_value(handler: &str, value: Value) -> PluginResult<ToolResult> {
    match value {
        Value::String(s) => Ok(ToolResult::ok(s)),
        Value::Object(obj) => Ok(match split_outcome(handler, &obj, "output")? {
            Ok(output) => ToolResult::ok(output),
            Err(error) => ToolResult::failed(error),
        }),
        other => Err(invalid(
            handler,
            format!(
                "expected a string or {{success, output, error}}, got {}",
                type_name(&other)
            ),
        )),
    }
}

/// Validate a skill handler's return value.
///
/// # Errors
///
/// Returns [`PluginError::InvalidResult`] if the value does not match the
/// skill result shape.
pub fn skill_result_from_value(handler: &str, value: Value) -> PluginResult<SkillResult> {
    let obj = match value {
        Value::String(s) => return Ok(SkillResult::ok(s)),
        Value::Object(obj) => obj,
        other => {
            return Err(invalid(
                handler,
                format!(
                    "expected a string or {{success, response, actions, error}}, got {}",
                    type_name(&other)
                ),
            ));
        },
    };

    let actions = match obj.get("actions") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                let action = item
                    .as_object()
                    .ok_or_else(|| invalid(handler, "each action must be an object"))?;
                let action_type = action
                    .get("action_type")
                    .and_then(Value::as_str)
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| invalid(handler, "action 'action_type' must be a non-empty string"))?;
                Ok(SkillAction {
                    action_type: action_type.to_string(),
                    data: action.get("data").cloned().unwrap_or(Value::Null),
                })
            })
            .collect::<PluginResult<Vec<_>>>()?,
        Some(other) => {
            return Err(invalid(
                handler,
                format!("'actions' must be an array, got {}", type_name(other)),
            ));
        },
    };

    Ok(match split_outcome(handler, &obj, "response")? {
        Ok(response) => SkillResult {
            success: true,
            response: Some(response),
            actions,
            error: None,
        },
        Err(error) => SkillResult {
            success: false,
            response: None,
            actions,
            error: Some(error),
        },
    })
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
