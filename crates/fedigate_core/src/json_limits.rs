/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Bounded JSON parsing for untrusted inbox bodies.
//!
//! Size and nesting depth are checked on the raw bytes before serde runs.
//! Key and array-length limits are checked on the parsed value. `max_keys`
//! counts every object key in the document (not distinct names).

use crate::config::InboxConfig;
use crate::error::InboxError;
use serde_json::Value;

#[derive(Debug, Clone, Copy)]
pub struct JsonLimits {
    pub max_size: usize,
    pub max_depth: usize,
    pub max_keys: usize,
    pub max_array_length: usize,
}

impl JsonLimits {
    pub fn from_config(cfg: &InboxConfig) -> Self {
        Self {
            max_size: cfg.max_json_size,
            max_depth: cfg.max_json_depth,
            max_keys: cfg.max_json_keys,
            max_array_length: cfg.max_json_array_length,
        }
    }
}

pub fn parse_bounded(body: &[u8], limits: &JsonLimits) -> Result<Value, InboxError> {
    if body.len() > limits.max_size {
        return Err(InboxError::PayloadTooLarge {
            size: body.len(),
            max: limits.max_size,
        });
    }
    let depth = scan_depth(body, limits.max_depth)?;
    tracing::trace!(depth, len = body.len(), "json pre-scan ok");

    let value: Value = serde_json::from_slice(body)
        .map_err(|e| InboxError::MalformedPayload(e.to_string()))?;
    check_shape(&value, limits)?;
    Ok(value)
}

/// Maximum bracket depth, ignoring brackets inside string literals.
/// Stops as soon as `max_depth` is exceeded.
fn scan_depth(body: &[u8], max_depth: usize) -> Result<usize, InboxError> {
    let mut depth = 0usize;
    let mut deepest = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for &b in body {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => {
                depth += 1;
                if depth > max_depth {
                    return Err(InboxError::PayloadTooComplex(format!(
                        "nesting depth exceeds {max_depth}"
                    )));
                }
                deepest = deepest.max(depth);
            }
            // unbalanced closers are left for the parser to reject
            b'}' | b']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    Ok(deepest)
}

fn check_shape(value: &Value, limits: &JsonLimits) -> Result<(), InboxError> {
    let mut keys = 0usize;
    let mut stack: Vec<&Value> = vec![value];
    while let Some(v) = stack.pop() {
        match v {
            Value::Object(map) => {
                keys += map.len();
                if keys > limits.max_keys {
                    return Err(InboxError::PayloadTooComplex(format!(
                        "more than {} object keys",
                        limits.max_keys
                    )));
                }
                stack.extend(map.values());
            }
            Value::Array(items) => {
                if items.len() > limits.max_array_length {
                    return Err(InboxError::PayloadTooComplex(format!(
                        "array of {} items exceeds {}",
                        items.len(),
                        limits.max_array_length
                    )));
                }
                stack.extend(items.iter());
            }
            _ => {}
        }
    }
    Ok(())
}
