//! Scanner for `{{ reference }}` tokens.
//!
//! A token is `{{`, optional whitespace, a reference, optional whitespace and
//! `}}`, where a reference is `identifier ("." identifier)*` and an identifier
//! is `[A-Za-z0-9_-]+`. A token whose body itself contains a token
//! (`{{ {{key}} }}`) is a nested token. Anything else between braces, such as
//! JSON text, is plain text and never produces a reference.

use weftcore::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    Text(&'a str),
    /// `raw` includes the braces, `body` is the text between them.
    Token { raw: &'a str, body: &'a str },
}

impl Segment<'_> {
    pub fn is_token(&self) -> bool {
        matches!(self, Segment::Token { .. })
    }
}

/// Split `text` into literal runs and tokens.
///
/// Tokens inside a brace span that is not itself a token (JSON text, for
/// example) still surface at the top level.
pub fn scan(text: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut cursor = 0;

    for span in balanced_spans(text).into_iter().filter(|span| span.token) {
        if span.open < cursor {
            continue;
        }
        if cursor < span.open {
            segments.push(Segment::Text(&text[cursor..span.open]));
        }
        let raw = &text[span.open..span.close];
        segments.push(Segment::Token { raw, body: &raw[2..raw.len() - 2] });
        cursor = span.close;
    }

    if cursor < text.len() {
        segments.push(Segment::Text(&text[cursor..]));
    }
    segments
}

/// A balanced `{{ .. }}` pair, `close` is the index just past its `}}`.
#[derive(Debug, Clone, Copy)]
struct Span {
    open: usize,
    close: usize,
    token: bool,
}

/// Pair every `{{` with its `}}` in one pass and classify each pair once its
/// inner pairs are known. An odd run of `{` leaves its first brace as text,
/// so `{{{a}}}` pairs around `a`. Result is ordered by opening position.
fn balanced_spans(text: &str) -> Vec<Span> {
    let bytes = text.as_bytes();
    let mut spans: Vec<Span> = Vec::new();
    let mut open: Vec<(usize, Vec<usize>)> = Vec::new();
    let mut i = 0;

    while i + 1 < bytes.len() {
        match (bytes[i], bytes[i + 1]) {
            (b'{', b'{') => {
                let run = bytes[i..].iter().take_while(|&&b| b == b'{').count();
                let mut at = i + run % 2;
                while at + 1 < i + run {
                    open.push((at, Vec::new()));
                    at += 2;
                }
                i += run;
            }
            (b'}', b'}') => {
                if let Some((start, children)) = open.pop() {
                    let close = i + 2;
                    let token = is_token_span(text, start, close, &children, &spans);
                    let index = spans.len();
                    spans.push(Span { open: start, close, token });
                    if let Some((_, siblings)) = open.last_mut() {
                        siblings.push(index);
                    }
                }
                i += 2;
            }
            _ => i += 1,
        }
    }

    spans.sort_by_key(|span| span.open);
    spans
}

/// A span is a token when its trimmed body is a reference, or when the body
/// is made only of tokens and reference characters, so that `{{ {{a}} }}`
/// and `{{ {{kind}}_id }}` qualify while `{{"x": {{a}} }}` does not.
fn is_token_span(text: &str, open: usize, close: usize, children: &[usize], spans: &[Span]) -> bool {
    let body = &text[open + 2..close - 2];
    let trimmed = body.trim();
    if parse_reference(trimmed).is_some() {
        return true;
    }
    if children.is_empty() {
        return false;
    }

    let mut cursor = open + 2 + (body.len() - body.trim_start().len());
    let end = cursor + trimmed.len();
    for span in children.iter().map(|&index| spans[index]) {
        if !span.token || !is_reference_text(&text[cursor..span.open]) {
            return false;
        }
        cursor = span.close;
    }
    is_reference_text(&text[cursor..end])
}

fn is_reference_text(text: &str) -> bool {
    text.chars().all(|c| is_ident_char(c) || c == '.')
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Split a reference into its path segments, or `None` if it is not one.
pub fn parse_reference(expr: &str) -> Option<Vec<&str>> {
    if expr.is_empty() {
        return None;
    }
    let segments: Vec<&str> = expr.split('.').collect();
    segments
        .iter()
        .all(|s| !s.is_empty() && s.chars().all(is_ident_char))
        .then_some(segments)
}

pub fn has_tokens(text: &str) -> bool {
    text.contains("{{") && scan(text).iter().any(Segment::is_token)
}

/// Reference names inside a token body. A nested body yields the references
/// of its inner tokens, since the outer name is only known at run time.
pub fn body_references(body: &str) -> Vec<String> {
    let trimmed = body.trim();
    if parse_reference(trimmed).is_some() {
        return vec![trimmed.to_string()];
    }
    references_in(trimmed)
}

/// Every reference name found in `text`, in order of appearance.
pub fn references_in(text: &str) -> Vec<String> {
    scan(text)
        .into_iter()
        .filter_map(|segment| match segment {
            Segment::Token { body, .. } => Some(body_references(body)),
            Segment::Text(_) => None,
        })
        .flatten()
        .collect()
}

/// Every reference name anywhere inside `value`.
pub fn collect_references(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.extend(references_in(s)),
        Value::Array(items) => items.iter().for_each(|item| collect_references(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_references(item, out)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_simple_tokens() {
        let segments = scan("Hello {{ name }}, see {{fetch.url}}!");
        assert_eq!(
            segments,
            vec![
                Segment::Text("Hello "),
                Segment::Token { raw: "{{ name }}", body: " name " },
                Segment::Text(", see "),
                Segment::Token { raw: "{{fetch.url}}", body: "fetch.url" },
                Segment::Text("!"),
            ]
        );
    }

    #[test]
    fn braces_around_non_references_are_text() {
        assert!(!has_tokens(r#"{{"a": {"b": 1}}}"#));
        assert!(!has_tokens("{{ not a reference }}"));
        assert!(!has_tokens("{{}}"));
        assert!(!has_tokens("{{ a..b }}"));
        assert!(!has_tokens("unterminated {{ name"));
        assert!(references_in("{{ not a ref }} but {{real}}") == vec!["real".to_string()]);
    }

    #[test]
    fn nested_tokens() {
        let segments = scan("{{ {{k}} }}");
        assert_eq!(segments, vec![Segment::Token { raw: "{{ {{k}} }}", body: " {{k}} " }]);
        assert_eq!(references_in("{{ {{k}} }}"), vec!["k".to_string()]);
        assert_eq!(references_in("{{ {{kind}}_id }}"), vec!["kind".to_string()]);
        // the outer braces hold JSON text, only the inner token counts
        assert_eq!(references_in(r#"{{"x": {{a}} }}"#), vec!["a".to_string()]);
    }

    #[test]
    fn odd_brace_runs_pair_innermost() {
        assert_eq!(references_in("{{{a}}}"), vec!["a".to_string()]);
        assert_eq!(references_in(r#"{"a": {"b": {{x}}}}"#), vec!["x".to_string()]);
        assert_eq!(scan("}} {{a}}").len(), 2);
    }

    #[test]
    fn deep_nesting_scans_in_linear_passes() {
        let depth = 40;
        let text = format!("{}x{}", "{{ ".repeat(depth), " }}".repeat(depth));
        let started = std::time::Instant::now();
        assert!(has_tokens(&text));
        assert_eq!(references_in(&text), vec!["x".to_string()]);
        assert!(started.elapsed() < std::time::Duration::from_millis(500));

        // one unbalanced level turns the whole thing into text
        let broken = format!("{}x y{}", "{{ ".repeat(depth), " }}".repeat(depth));
        let started = std::time::Instant::now();
        assert!(!has_tokens(&broken));
        assert!(started.elapsed() < std::time::Duration::from_millis(500));
    }

    #[test]
    fn parse_reference_grammar() {
        assert_eq!(parse_reference("fetch.body.0.id"), Some(vec!["fetch", "body", "0", "id"]));
        assert_eq!(parse_reference("send-email"), Some(vec!["send-email"]));
        assert_eq!(parse_reference("a b"), None);
        assert_eq!(parse_reference(".a"), None);
    }

    #[test]
    fn collects_from_nested_values() {
        let value: Value = serde_json::from_str(
            r#"{"to": "{{lookup.email}}", "cc": ["{{manager}}", 3], "body": {"text": "{{draft.text}}"}}"#,
        )
        .unwrap();
        let mut refs = Vec::new();
        collect_references(&value, &mut refs);
        refs.sort();
        assert_eq!(refs, vec!["draft.text", "lookup.email", "manager"]);
    }
}
