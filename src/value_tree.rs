//! Generic walk over `serde_json::Value` trees.
//!
//! Log redaction and payload trimming are both expressed as visitors over
//! the same traversal.

use serde_json::Value;

/// What a visitor sees at each node.
pub enum Node<'a> {
    /// Object member: the key and its value.
    Field(&'a str, &'a mut Value),
    /// Array element.
    Element(&'a mut Value),
}

/// Visit every object member and array element, depth first, parent
/// before children.  `visit` receives the node and its depth (1 for the
/// root's direct children); returning `false` skips the node's subtree.
pub fn walk_mut<F>(value: &mut Value, visit: &mut F)
where
    F: FnMut(Node<'_>, usize) -> bool,
{
    walk_inner(value, 1, visit);
}

fn walk_inner<F>(value: &mut Value, depth: usize, visit: &mut F)
where
    F: FnMut(Node<'_>, usize) -> bool,
{
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if visit(Node::Field(key, &mut *child), depth) {
                    walk_inner(child, depth + 1, visit);
                }
            }
        }
        Value::Array(items) => {
            for child in items.iter_mut() {
                if visit(Node::Element(&mut *child), depth) {
                    walk_inner(child, depth + 1, visit);
                }
            }
        }
        _ => {}
    }
}

pub const REDACTED: &str = "[redacted]";

/// Keys whose values never reach the logs.
pub const SENSITIVE_KEYS: &[&str] = &[
    "authorization",
    "api_key",
    "api-key",
    "access_token",
    "token",
    "client_secret",
    "password",
    "secret",
];

/// Replace values of sensitive keys (case-insensitive) with `"[redacted]"`.
pub fn redact(value: &mut Value, keys: &[&str]) {
    walk_mut(value, &mut |node, _| match node {
        Node::Field(key, child) => {
            if keys.iter().any(|k| k.eq_ignore_ascii_case(key)) {
                *child = Value::String(REDACTED.to_string());
                false
            } else {
                true
            }
        }
        Node::Element(_) => true,
    });
}

/// Bounds applied by [`trim`].
#[derive(Debug, Clone, Copy)]
pub struct TrimLimits {
    pub max_string: usize,
    pub max_array: usize,
    pub max_depth: usize,
}

impl Default for TrimLimits {
    fn default() -> Self {
        Self {
            max_string: 500,
            max_array: 20,
            max_depth: 6,
        }
    }
}

/// Shorten long strings, cut long arrays and collapse deep subtrees.
pub fn trim(value: &mut Value, limits: TrimLimits) {
    trim_scalar(value, limits);
    if let Value::Array(items) = value {
        items.truncate(limits.max_array);
    }
    walk_mut(value, &mut |node, depth| {
        let child = match node {
            Node::Field(_, child) | Node::Element(child) => child,
        };
        if depth >= limits.max_depth && (child.is_object() || child.is_array()) {
            *child = Value::String("…".to_string());
            return false;
        }
        trim_scalar(child, limits);
        if let Value::Array(items) = child {
            items.truncate(limits.max_array);
        }
        true
    });
}

fn trim_scalar(value: &mut Value, limits: TrimLimits) {
    if let Value::String(s) = value {
        if s.len() > limits.max_string {
            *s = crate::utils::truncate_str(s, limits.max_string);
        }
    }
}
