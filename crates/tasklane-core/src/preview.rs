// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Equivalent-request previews.
//!
//! Renders what a launch would send, as data and as a copy-pasteable curl
//! command, without contacting the remote system.

use serde::Serialize;
use serde_json::Value;

use crate::remote::LaunchEndpoint;

/// Placeholder shown when no usable token is configured.
pub const TOKEN_PLACEHOLDER: &str = "[TOKEN]";

/// Mask a credential for display: first 8 characters, `...`, last 4.
///
/// Tokens too short to mask safely are replaced entirely.
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 12 {
        return TOKEN_PLACEHOLDER.to_string();
    }

    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

/// A launch request as it would be sent.
#[derive(Debug, Clone, Serialize)]
pub struct EquivalentRequest {
    /// HTTP method.
    pub method: String,
    /// Launch URL.
    pub url: String,
    /// Masked credential.
    pub masked_token: String,
    /// Rendered body.
    pub body: Value,
    /// Equivalent curl command.
    pub curl: String,
}

impl EquivalentRequest {
    /// Build a preview from an endpoint and a rendered body.
    pub fn new(endpoint: LaunchEndpoint, body: Value) -> Self {
        let masked_token = endpoint
            .masked_token
            .unwrap_or_else(|| TOKEN_PLACEHOLDER.to_string());
        let curl = curl_command(endpoint.method, &endpoint.url, &masked_token, &body);

        Self {
            method: endpoint.method.to_string(),
            url: endpoint.url,
            masked_token,
            body,
            curl,
        }
    }
}

fn curl_command(method: &str, url: &str, masked_token: &str, body: &Value) -> String {
    let pretty = serde_json::to_string_pretty(body).unwrap_or_else(|_| body.to_string());

    format!(
        "curl -X {} '{}' \\\n  -H 'Authorization: Bearer {}' \\\n  -H 'Content-Type: application/json' \\\n  -d '{}'",
        method,
        shell_quote(url),
        masked_token,
        shell_quote(&pretty)
    )
}

/// Escape for use inside single quotes.
fn shell_quote(s: &str) -> String {
    s.replace('\'', r"'\''")
}
