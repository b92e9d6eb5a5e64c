//! Process-wide environment overrides, read once.

use std::env;
use std::sync::OnceLock;

static NNOP_RS_BACKEND: OnceLock<Option<String>> = OnceLock::new();
static NNOP_RS_KEEP_INTERMEDIATES: OnceLock<bool> = OnceLock::new();
static NNOP_RS_VLEN: OnceLock<Option<usize>> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn non_empty(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

/// `NNOP_RS_BACKEND`: name of the first backend sessions resolve kernels from.
pub fn backend_override() -> Option<&'static str> {
    NNOP_RS_BACKEND
        .get_or_init(|| non_empty("NNOP_RS_BACKEND"))
        .as_deref()
}

/// `NNOP_RS_KEEP_INTERMEDIATES`: keep every intermediate buffer alive after a run.
pub fn keep_intermediates() -> bool {
    *NNOP_RS_KEEP_INTERMEDIATES.get_or_init(|| {
        non_empty("NNOP_RS_KEEP_INTERMEDIATES").is_some_and(|value| parse_bool(&value))
    })
}

/// `NNOP_RS_VLEN`: vector register width in bits for vector backends.
pub fn vector_length_bits() -> Option<usize> {
    *NNOP_RS_VLEN.get_or_init(|| {
        non_empty("NNOP_RS_VLEN").and_then(|value| value.parse::<usize>().ok().filter(|&bits| bits > 0))
    })
}

#[cfg(test)]
mod tests {
    use super::parse_bool;

    #[test]
    fn bool_spellings() {
        for value in ["1", "true", "YES", " on "] {
            assert!(parse_bool(value), "{value}");
        }
        for value in ["0", "false", "off", "maybe"] {
            assert!(!parse_bool(value), "{value}");
        }
    }
}
