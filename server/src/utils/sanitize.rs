//! Input sanitization for event payloads
//!
//! Strips control characters, HTML/script content, and dangerous URL schemes
//! from every string a client submits. Stripping runs to a fixpoint so that
//! removals cannot splice a new forbidden token together.

use std::sync::LazyLock;

use regex::Regex;

/// Maximum fixpoint iterations; real payloads converge in one or two
const MAX_STRIP_PASSES: usize = 8;

static SCRIPT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script[^>]*>.*?</script>").expect("valid regex"));

static HTML_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid regex"));

static URL_SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(javascript:|vbscript:|data:text/html)").expect("valid regex"));

/// Remove control characters (0x00-0x1F except tab/newline/carriage-return,
/// plus 0x7F), then strip HTML/script content and dangerous URL schemes.
pub fn sanitize_text(input: &str) -> String {
    let mut current: String = input
        .chars()
        .filter(|&c| !is_forbidden_control(c))
        .collect();

    for _ in 0..MAX_STRIP_PASSES {
        let next = strip_once(&current);
        if next == current {
            break;
        }
        current = next;
    }

    current
}

fn is_forbidden_control(c: char) -> bool {
    (c < '\u{20}' && c != '\t' && c != '\n' && c != '\r') || c == '\u{7f}'
}

fn strip_once(input: &str) -> String {
    let without_scripts = SCRIPT_BLOCK.replace_all(input, "");
    let without_tags = HTML_TAG.replace_all(&without_scripts, "");
    URL_SCHEME.replace_all(&without_tags, "").into_owned()
}

/// Sanitize every string in a JSON value in place, keys included
pub fn sanitize_json_value(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) => {
            let clean = sanitize_text(s);
            if clean != *s {
                *s = clean;
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                sanitize_json_value(item);
            }
        }
        serde_json::Value::Object(map) => {
            let needs_key_rewrite = map.keys().any(|k| sanitize_text(k) != *k);
            if needs_key_rewrite {
                let entries: Vec<(String, serde_json::Value)> = std::mem::take(map)
                    .into_iter()
                    .map(|(k, v)| (sanitize_text(&k), v))
                    .collect();
                for (k, v) in entries {
                    map.insert(k, v);
                }
            }
            for (_, v) in map.iter_mut() {
                sanitize_json_value(v);
            }
        }
        _ => {}
    }
}
