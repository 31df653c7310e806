use std::env;

pub(crate) fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// Returns the trimmed value of `key`, treating blank values as unset.
pub fn var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn var_bool(key: &str) -> Option<bool> {
    var(key).map(|value| parse_bool(&value))
}

pub(crate) fn var_usize(key: &str) -> Option<usize> {
    var(key).and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::parse_bool;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        for value in ["1", "true", " YES ", "on"] {
            assert!(parse_bool(value), "{value}");
        }
        for value in ["0", "false", "off", ""] {
            assert!(!parse_bool(value), "{value}");
        }
    }
}
