//! `{key}` placeholder rendering and text dedenting

use serde_json::Value;

/// Replace `{key}` placeholders using `lookup`.
///
/// Unknown keys are left untouched. `{{` and `}}` produce literal braces.
pub fn render<F>(template: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if tail.starts_with("{{") {
            out.push('{');
            rest = &tail[2..];
        } else if tail.starts_with("}}") {
            out.push('}');
            rest = &tail[2..];
        } else if tail.starts_with('{') {
            match tail[1..].find('}') {
                Some(end) => {
                    let key = &tail[1..end + 1];
                    match lookup(key.trim()) {
                        Some(value) => out.push_str(&value),
                        None => out.push_str(&tail[..end + 2]),
                    }
                    rest = &tail[end + 2..];
                }
                None => {
                    out.push_str(tail);
                    rest = "";
                }
            }
        } else {
            out.push('}');
            rest = &tail[1..];
        }
    }

    out.push_str(rest);
    out
}

/// Text form of a state value for substitution. Strings are inserted without quotes.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Remove the common leading whitespace of all non-blank lines.
///
/// Only ASCII spaces and tabs count as indentation, and the common prefix must
/// match exactly, so mixed indents such as `"  "` and `"\t"` have no margin.
pub fn dedent(text: &str) -> String {
    let margin = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(leading_indent)
        .reduce(common_prefix)
        .unwrap_or("");

    text.lines()
        .map(|line| {
            if line.trim().is_empty() {
                ""
            } else {
                line.strip_prefix(margin).unwrap_or(line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn leading_indent(line: &str) -> &str {
    let end = line
        .find(|c: char| c != ' ' && c != '\t')
        .unwrap_or(line.len());
    &line[..end]
}

fn common_prefix<'a>(a: &'a str, b: &'a str) -> &'a str {
    let len = a
        .bytes()
        .zip(b.bytes())
        .take_while(|(x, y)| x == y)
        .count();
    &a[..len]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lookup(key: &str) -> Option<String> {
        match key {
            "port" => Some("8545".to_string()),
            "host" => Some("127.0.0.1".to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_render_placeholders() {
        assert_eq!(
            render("upstream:http://{host}:{port}", lookup),
            "upstream:http://127.0.0.1:8545"
        );
        assert_eq!(render("-p { port }", lookup), "-p 8545");
    }

    #[test]
    fn test_render_unknown_and_escapes() {
        assert_eq!(render("{missing} {port}", lookup), "{missing} 8545");
        assert_eq!(render("{{\"a\": {port}}}", lookup), "{\"a\": 8545}");
        assert_eq!(render("open { brace", lookup), "open { brace");
        assert_eq!(render("lone } brace", lookup), "lone } brace");
        assert_eq!(render("", lookup), "");
    }

    #[test]
    fn test_value_to_string() {
        assert_eq!(value_to_string(&json!("abc")), "abc");
        assert_eq!(value_to_string(&json!(4919)), "4919");
        assert_eq!(value_to_string(&json!(true)), "true");
        assert_eq!(value_to_string(&json!(null)), "");
        assert_eq!(value_to_string(&json!([1, 2])), "[1,2]");
    }

    #[test]
    fn test_dedent() {
        let text = "
            Title

              - item
            Footer
        ";
        assert_eq!(dedent(text).trim(), "Title\n\n  - item\nFooter");
        assert_eq!(dedent("no indent"), "no indent");
    }

    #[test]
    fn test_dedent_ignores_unicode_whitespace() {
        assert_eq!(dedent(" Deploy with:\n\u{a0}anvil"), " Deploy with:\n\u{a0}anvil");
        assert_eq!(dedent("  a\n  \u{a0}b"), "a\n\u{a0}b");
        assert_eq!(dedent("\u{3000}wide\n\u{3000}wide"), "\u{3000}wide\n\u{3000}wide");
    }

    #[test]
    fn test_dedent_mixed_tabs_and_spaces() {
        assert_eq!(dedent("\tone\n    two"), "\tone\n    two");
        assert_eq!(dedent("\t  one\n\t two"), " one\ntwo");
    }
}
