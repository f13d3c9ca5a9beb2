// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run requests and launch body construction.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::allocator::PoolHint;
use crate::error::RunError;
use crate::template;

/// Who is triggering a run. Drives pool selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// User id.
    pub user_id: Option<String>,
    /// User email.
    pub email: Option<String>,
    /// Groups the user belongs to; the first one picks the pool.
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Actor {
    /// Pool hint: first group, then user id, then email.
    pub fn pool_hint(&self) -> PoolHint {
        PoolHint {
            group: self.groups.first().cloned(),
            user: self
                .user_id
                .clone()
                .filter(|u| !u.is_empty())
                .or_else(|| self.email.clone()),
        }
    }
}

/// Where the launch body comes from, in priority order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum BodySource {
    /// Caller-edited JSON, sent verbatim.
    Override(String),
    /// Stored JSON template with `{{form.field}}` placeholders.
    Template(String),
    /// Legacy YAML variable map, sent as `extra_vars`.
    LegacyVars {
        /// YAML mapping.
        yaml: String,
        /// Inventory to run against.
        inventory: Option<u64>,
    },
    /// No body configured.
    Minimal {
        /// Inventory to run against.
        inventory: Option<u64>,
    },
}

impl Default for BodySource {
    fn default() -> Self {
        Self::Minimal { inventory: None }
    }
}

impl BodySource {
    /// Build the launch body. Pure; safe to call for previews.
    pub fn build(&self, params: &Map<String, Value>) -> Result<Value, RunError> {
        match self {
            Self::Override(raw) => serde_json::from_str(raw)
                .map_err(|e| RunError::Render(format!("invalid body override: {}", e))),
            Self::Template(raw) => {
                let template: Value = serde_json::from_str(raw)
                    .map_err(|e| RunError::Render(format!("invalid body template: {}", e)))?;
                Ok(template::render(&template, params))
            }
            Self::LegacyVars { yaml, inventory } => {
                let vars = parse_vars(yaml)?;
                let rendered: Map<String, Value> = vars
                    .into_iter()
                    .map(|(key, value)| match value {
                        Value::String(s) => (key, Value::String(template::render_str(&s, params))),
                        other => (key, other),
                    })
                    .collect();

                let mut body = Map::new();
                body.insert("extra_vars".to_string(), Value::Object(rendered));
                if let Some(inventory) = inventory {
                    body.insert("inventory".to_string(), Value::from(*inventory));
                }
                Ok(Value::Object(body))
            }
            Self::Minimal { inventory } => {
                let mut body = Map::new();
                if let Some(inventory) = inventory {
                    body.insert("inventory".to_string(), Value::from(*inventory));
                }
                Ok(Value::Object(body))
            }
        }
    }
}

fn parse_vars(yaml: &str) -> Result<Map<String, Value>, RunError> {
    let parsed: Value = serde_yaml::from_str(yaml)
        .map_err(|e| RunError::Render(format!("invalid extra vars: {}", e)))?;

    match parsed {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => Err(RunError::Render(
            "invalid extra vars: expected a mapping".to_string(),
        )),
    }
}

/// Everything needed to create and drive one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    /// Remote template to launch.
    pub template_id: String,
    /// Form input, stored verbatim on the run row.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Who is triggering the run.
    #[serde(default)]
    pub actor: Actor,
    /// Display name stored on the run row.
    pub executed_by: Option<String>,
    /// Identifier reserved ahead of submission.
    pub reserved_unique_id: Option<String>,
    /// Body source.
    #[serde(default)]
    pub body: BodySource,
}

impl RunRequest {
    /// Request for a template with no parameters and a minimal body.
    pub fn new(template_id: impl Into<String>) -> Self {
        Self {
            template_id: template_id.into(),
            ..Default::default()
        }
    }

    /// Set the form parameters.
    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Set the actor.
    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }

    /// Set the body source.
    pub fn with_body(mut self, body: BodySource) -> Self {
        self.body = body;
        self
    }

    /// Use a reserved identifier instead of allocating one.
    pub fn with_reserved_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.reserved_unique_id = Some(unique_id.into());
        self
    }

    /// Set the display name of the triggering user.
    pub fn with_executed_by(mut self, executed_by: impl Into<String>) -> Self {
        self.executed_by = Some(executed_by.into());
        self
    }

    /// Build the launch body for this request.
    pub fn build_body(&self) -> Result<Value, RunError> {
        self.body.build(&self.parameters)
    }

    /// Executed-by value stored on the row: explicit name, else email, else user id.
    pub fn executed_by_label(&self) -> Option<String> {
        self.executed_by
            .clone()
            .or_else(|| self.actor.email.clone())
            .or_else(|| self.actor.user_id.clone())
    }
}
