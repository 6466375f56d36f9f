//! Tool naming: fallback identifiers, name validation, deterministic shortening.

use regex::Regex;
use sha2::{Digest as _, Sha256};
use std::sync::LazyLock;

static PATH_PARAM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^}]+)\}").expect("valid regex"));
static NON_ALNUM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9]+").expect("valid regex"));
static VALID_TOOL_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.\-]{1,128}$").expect("valid regex"));
static INVALID_TOOL_CHAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_.\-]").expect("valid regex"));

const HTTP_METHOD_SUFFIXES: &[&str] = &["get", "post", "put", "delete", "patch", "head", "options"];
const PATH_INDICATORS: &[&str] = &["api", "v1", "v2", "v3", "admin", "auth", "public", "private"];
const HASH_LEN: usize = 6;

/// Smallest usable shortening limit: one function character, the longest method suffix and the
/// hash, joined by `_`.
pub const MIN_TOOL_NAME_LENGTH: usize = 1 + 1 + "options".len() + 1 + HASH_LEN;

/// Identifier for an operation without an explicit `operationId`.
///
/// `GET /items/{item_id}` becomes `get_items_item_id`.
#[must_use]
pub fn fallback_operation_id(method: &str, path: &str) -> String {
    let name = format!("{}_{}", method.to_lowercase(), path);
    let name = PATH_PARAM_RE.replace_all(&name, "_$1");
    let name = NON_ALNUM_RE.replace_all(&name, "_");
    name.trim_matches('_').to_string()
}

#[must_use]
pub fn is_valid_tool_name(name: &str) -> bool {
    VALID_TOOL_NAME_RE.is_match(name)
}

/// Replace characters that are not allowed in tool names.
#[must_use]
pub fn sanitize_tool_name(name: &str) -> String {
    let cleaned = INVALID_TOOL_CHAR_RE.replace_all(name, "_").to_string();
    if cleaned.is_empty() {
        "_".to_string()
    } else if cleaned.len() > 128 {
        cleaned[..128].to_string()
    } else {
        cleaned
    }
}

/// Shorten an identifier to at most `max_length` characters.
///
/// Identifiers within the limit are returned unchanged. Longer ones keep the leading function
/// name, as many of the rightmost path segments as fit, the trailing HTTP method, and a
/// six-character hash of the full identifier so distinct inputs stay distinct.
///
/// The result never exceeds `max_length`; below [`MIN_TOOL_NAME_LENGTH`] it degrades to a
/// prefix of the hash.
#[must_use]
pub fn shorten_operation_id(operation_id: &str, max_length: usize) -> String {
    if operation_id.len() <= max_length {
        return operation_id.to_string();
    }
    let shortened = shorten_with_hash(operation_id, max_length);
    if shortened.len() <= max_length {
        return shortened;
    }
    let digest = hex::encode(Sha256::digest(operation_id.as_bytes()));
    digest[..max_length.min(digest.len())].to_string()
}

fn shorten_with_hash(operation_id: &str, max_length: usize) -> String {
    let digest = hex::encode(Sha256::digest(operation_id.as_bytes()));
    let hash = &digest[..HASH_LEN];

    let mut parts: Vec<&str> = operation_id.split('_').filter(|p| !p.is_empty()).collect();
    let method = match parts.last() {
        Some(last) if HTTP_METHOD_SUFFIXES.contains(last) => parts.pop().unwrap_or_default(),
        _ => "",
    };

    let (function_parts, path_segments) = match parts
        .iter()
        .position(|p| PATH_INDICATORS.contains(&p.to_lowercase().as_str()))
    {
        Some(idx) => (parts[..idx].to_vec(), parts[idx..].to_vec()),
        None if parts.is_empty() => (Vec::new(), Vec::new()),
        None => (vec![parts[0]], parts[1..].to_vec()),
    };
    let mut function_name = function_parts.join("_");

    let tail = join_nonempty(&[method, hash]);
    // function + "_" + tail
    let fixed = function_name.len() + 1 + tail.len();

    if fixed >= max_length {
        let available = max_length.saturating_sub(tail.len() + 1);
        function_name.truncate(floor_char_boundary(&function_name, available));
        return join_nonempty(&[&function_name, &tail]);
    }

    let available_for_path = max_length - fixed - 1;
    let mut selected: Vec<&str> = Vec::new();
    let mut used = 0usize;
    for segment in path_segments.iter().rev() {
        let cost = segment.len() + usize::from(!selected.is_empty());
        if used + cost > available_for_path {
            break;
        }
        selected.push(segment);
        used += cost;
    }
    selected.reverse();

    join_nonempty(&[&function_name, &selected.join("_"), &tail])
}

fn join_nonempty(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("_")
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_ids_are_derived_from_method_and_path() {
        assert_eq!(fallback_operation_id("GET", "/items/{item_id}"), "get_items_item_id");
        assert_eq!(fallback_operation_id("post", "/"), "post");
        assert_eq!(
            fallback_operation_id("delete", "/api/v1/users/{id}/roles"),
            "delete_api_v1_users_id_roles"
        );
    }

    #[test]
    fn short_ids_are_untouched() {
        assert_eq!(shorten_operation_id("list_items_items_get", 60), "list_items_items_get");
    }

    #[test]
    fn long_ids_are_shortened_deterministically() {
        let id = "get_user_profile_api_v1_users_profiles_user_id_get";
        let a = shorten_operation_id(id, 40);
        let b = shorten_operation_id(id, 40);
        assert_eq!(a, b);
        assert!(a.len() <= 40, "{a} is {} chars", a.len());
        assert!(a.starts_with("get_user_profile_"));
        assert!(a.contains("_user_id_get_"));
        assert!(is_valid_tool_name(&a));
    }

    #[test]
    fn distinct_long_ids_stay_distinct() {
        let a = shorten_operation_id("create_report_api_v1_reports_monthly_summary_post", 30);
        let b = shorten_operation_id("create_report_api_v2_reports_monthly_summary_post", 30);
        assert_ne!(a, b);
    }

    #[test]
    fn very_long_function_names_are_truncated() {
        let id = format!("{}_get", "x".repeat(100));
        let out = shorten_operation_id(&id, 20);
        assert!(out.len() <= 20);
        assert!(out.starts_with("xxxxxxxxx_get_"), "{out}");
    }

    #[test]
    fn tiny_limits_are_never_exceeded() {
        let id = "get_user_profile_api_v1_users_profiles_user_id_get";
        for max in 1..MIN_TOOL_NAME_LENGTH {
            let out = shorten_operation_id(id, max);
            assert!(out.len() <= max, "{out} exceeds {max}");
            assert!(!out.is_empty());
        }
        let out = shorten_operation_id(id, MIN_TOOL_NAME_LENGTH);
        assert!(out.len() <= MIN_TOOL_NAME_LENGTH);
        assert!(out.contains("_get_"), "{out}");
    }

    #[test]
    fn sanitizes_invalid_characters() {
        assert!(!is_valid_tool_name("items/list"));
        assert_eq!(sanitize_tool_name("items/list"), "items_list");
        assert!(is_valid_tool_name("users.get-v2"));
    }
}
