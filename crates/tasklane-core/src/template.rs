// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `{{form.field}}` placeholder substitution over JSON values.
//!
//! Rendering is pure. Placeholders whose field is absent from the
//! parameters are left verbatim, so a missing optional field never corrupts
//! the rest of the body.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value};

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{form\.(\w+)\}\}").expect("placeholder pattern is valid")
});

/// Render a template value against form parameters.
///
/// Strings get placeholder substitution, arrays and objects are walked
/// recursively preserving order, length and keys, other scalars are
/// returned unchanged.
pub fn render(template: &Value, params: &Map<String, Value>) -> Value {
    match template {
        Value::String(s) => Value::String(render_str(s, params)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render(v, params)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render(v, params)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Substitute placeholders in a single string.
pub fn render_str(input: &str, params: &Map<String, Value>) -> String {
    PLACEHOLDER
        .replace_all(input, |caps: &Captures<'_>| match params.get(&caps[1]) {
            Some(value) => coerce(value),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Field names referenced by placeholders anywhere in the template, in
/// first-seen order without duplicates.
pub fn placeholders(template: &Value) -> Vec<String> {
    let mut fields = Vec::new();
    collect(template, &mut fields);
    fields
}

fn collect(value: &Value, fields: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            for caps in PLACEHOLDER.captures_iter(s) {
                let field = &caps[1];
                if !fields.iter().any(|f| f == field) {
                    fields.push(field.to_string());
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect(v, fields)),
        Value::Object(map) => map.values().for_each(|v| collect(v, fields)),
        _ => {}
    }
}

fn coerce(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
