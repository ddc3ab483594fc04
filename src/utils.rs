//! Shared utility helpers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Truncate a string to `max` bytes (on a char boundary), appending `…`
/// if trimmed.
pub fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

/// Truncate to at most `max` characters without an ellipsis.
pub fn cap_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Mask a sender identifier for logs, keeping the last four characters.
pub fn mask_sender(sender: &str) -> String {
    let count = sender.chars().count();
    if count <= 4 {
        return "****".to_string();
    }
    let tail: String = sender.chars().skip(count - 4).collect();
    format!("***{tail}")
}

/// Unique worker id: `w_{pid}_{8 hex chars}`.
pub fn worker_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("w_{}_{}", std::process::id(), &uuid[..8])
}

/// Seconds since the UNIX epoch as a float.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
