use regex::Regex;
use std::sync::LazyLock;

static ANGLE_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([^<>]+)>").expect("static regex"));

/// Bare address of a header value: the text inside `<...>` when present,
/// otherwise the whole value trimmed.
pub fn extract_address(header_value: &str) -> String {
    match ANGLE_ADDRESS.captures(header_value) {
        Some(caps) => caps[1].trim().to_string(),
        None => header_value.trim().to_string(),
    }
}

pub fn same_address(a: &str, b: &str) -> bool {
    extract_address(a).eq_ignore_ascii_case(&extract_address(b))
}
