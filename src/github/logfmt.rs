//! Restricted logfmt: flat `key="value"` tokens.
//!
//! Only double-quoted values without embedded quotes are recognised. A token
//! missing its closing quote is not captured at all.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

static TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"(\w+)="([^"]*)""#).unwrap());

/// Parse every `key="value"` token in `input`. Later duplicates win.
pub fn parse(input: &str) -> HashMap<String, String> {
    TOKEN
        .captures_iter(input)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect()
}

/// Value of a single key, if present.
pub fn get(input: &str, key: &str) -> Option<String> {
    parse(input).remove(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_and_issue_number() {
        let parsed = parse(r#"name="foo" trigger_issue_number="42""#);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["name"], "foo");
        assert_eq!(parsed["trigger_issue_number"], "42");
    }

    #[test]
    fn unclosed_quote_yields_no_match() {
        let parsed = parse(r#"trigger_issue_number="42"#);
        assert!(parsed.is_empty());
        assert_eq!(get(r#"trigger_issue_number="42"#, "trigger_issue_number"), None);
    }

    #[test]
    fn unquoted_values_and_empty_values() {
        let parsed = parse(r#"plain=value empty="" kept="yes""#);
        assert!(!parsed.contains_key("plain"));
        assert_eq!(parsed["empty"], "");
        assert_eq!(parsed["kept"], "yes");
    }
}
