use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub const JSON_MEDIA_TYPE: &str = "application/json";

#[derive(Debug, Error)]
pub enum ResultError {
    #[error("failed to serialize analysis result: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid download filename {0:?}")]
    InvalidFilename(String),

    #[error("failed to write {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ResultError>;

/// Pretty-prints with two-space indentation.
///
/// Text that parses as JSON is re-serialized; other text comes back unchanged.
/// Applying it again to its own output is a no-op.
pub fn pretty_print(value: &Value) -> Result<String> {
    match value {
        Value::String(text) => Ok(pretty_print_text(text)),
        other => Ok(serde_json::to_string_pretty(other)?),
    }
}

pub fn pretty_print_text(text: &str) -> String {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|parsed| serde_json::to_string_pretty(&parsed).ok())
        .unwrap_or_else(|| text.to_owned())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Key,
    String,
    Boolean,
    Null,
    Number,
    Plain,
}

impl TokenKind {
    pub fn css_class(&self) -> Option<&'static str> {
        match self {
            TokenKind::Key => Some("text-info font-semibold"),
            TokenKind::String => Some("text-neutral"),
            TokenKind::Boolean => Some("text-primary font-bold"),
            TokenKind::Null => Some("text-error"),
            TokenKind::Number => Some("text-info"),
            TokenKind::Plain => None,
        }
    }
}

/// A run of HTML-escaped text with its lexical class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub kind: TokenKind,
    pub text: String,
}

impl Span {
    /// The span's text with HTML entities turned back into characters, for
    /// surfaces that do not interpret markup.
    pub fn display_text(&self) -> String {
        unescape_html(&self.text)
    }
}

static TOKEN_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?P<string>"(?:\\u[a-zA-Z0-9]{4}|\\[^u]|[^\\"])*")(?P<colon>\s*:)?|(?P<literal>\b(?:true|false|null)\b)|(?P<number>-?[0-9]+(?:\.[0-9]*)?(?:[eE][+-]?[0-9]+)?)"#,
    )
    .expect("valid token pattern")
});

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            other => escaped.push(other),
        }
    }
    escaped
}

pub fn unescape_html(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Splits pretty-printed text into classified spans.
///
/// Escaping happens before scanning, so span text never carries a raw `<`, `>`
/// or `&` from the input. Classification is lexical only.
pub fn tokenize(pretty: &str) -> Vec<Span> {
    let escaped = escape_html(pretty);
    let mut spans = Vec::new();
    let mut cursor = 0;

    for caps in TOKEN_PATTERN.captures_iter(&escaped) {
        let Some(whole) = caps.get(0) else { continue };
        push_plain(&mut spans, &escaped[cursor..whole.start()]);

        if let Some(string) = caps.name("string") {
            // A key span carries its colon.
            match caps.name("colon") {
                Some(_) => spans.push(Span {
                    kind: TokenKind::Key,
                    text: whole.as_str().to_owned(),
                }),
                None => spans.push(Span {
                    kind: TokenKind::String,
                    text: string.as_str().to_owned(),
                }),
            }
        } else if let Some(literal) = caps.name("literal") {
            let kind = if literal.as_str() == "null" {
                TokenKind::Null
            } else {
                TokenKind::Boolean
            };
            spans.push(Span {
                kind,
                text: literal.as_str().to_owned(),
            });
        } else if let Some(number) = caps.name("number") {
            spans.push(Span {
                kind: TokenKind::Number,
                text: number.as_str().to_owned(),
            });
        }
        cursor = whole.end();
    }

    push_plain(&mut spans, &escaped[cursor..]);
    spans
}

fn push_plain(spans: &mut Vec<Span>, text: &str) {
    if text.is_empty() {
        return;
    }
    match spans.last_mut() {
        Some(last) if last.kind == TokenKind::Plain => last.text.push_str(text),
        _ => spans.push(Span {
            kind: TokenKind::Plain,
            text: text.to_owned(),
        }),
    }
}

pub fn highlight(value: &Value) -> Result<Vec<Span>> {
    Ok(tokenize(&pretty_print(value)?))
}

pub fn to_html(spans: &[Span]) -> String {
    let mut html = String::new();
    for span in spans {
        match span.kind.css_class() {
            Some(class) => {
                html.push_str("<span class=\"");
                html.push_str(class);
                html.push_str("\">");
                html.push_str(&span.text);
                html.push_str("</span>");
            }
            None => html.push_str(&span.text),
        }
    }
    html
}

/// Pretty-printed bytes ready to be saved under `filename`.
#[derive(Debug, Clone)]
pub struct DownloadArtifact {
    pub filename: String,
    pub media_type: &'static str,
    pub bytes: Vec<u8>,
}

impl DownloadArtifact {
    pub fn new(value: &Value, filename: &str) -> Result<Self> {
        validate_filename(filename)?;
        Ok(Self {
            filename: filename.to_owned(),
            media_type: JSON_MEDIA_TYPE,
            bytes: pretty_print(value)?.into_bytes(),
        })
    }

    /// Writes into `dir` through a temporary file that is removed on every path
    /// except a successful rename.
    pub fn save_in(&self, dir: &Path) -> Result<PathBuf> {
        let target = dir.join(&self.filename);
        let io_err = |source| ResultError::Io {
            path: target.clone(),
            source,
        };

        fs::create_dir_all(dir).map_err(io_err)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(&self.bytes).map_err(io_err)?;
        tmp.flush().map_err(io_err)?;
        tmp.persist(&target).map_err(|err| io_err(err.error))?;

        debug!(path = %target.display(), bytes = self.bytes.len(), "analysis result saved");
        Ok(target)
    }
}

pub fn download(value: &Value, dir: &Path, filename: &str) -> Result<PathBuf> {
    DownloadArtifact::new(value, filename)?.save_in(dir)
}

fn validate_filename(filename: &str) -> Result<()> {
    let plain = Path::new(filename)
        .file_name()
        .map(|name| name == filename)
        .unwrap_or(false);
    if filename.trim().is_empty() || !plain {
        return Err(ResultError::InvalidFilename(filename.to_owned()));
    }
    Ok(())
}

/// An entry of the analysis result pointing at a page of an uploaded document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageReference {
    pub document: String,
    pub page: u32,
    pub label: Option<String>,
}

/// Collects every object carrying a `document` name and a positive `page_number`,
/// in document order. Textual input is parsed first.
pub fn page_references(value: &Value) -> Vec<PageReference> {
    let mut found = Vec::new();
    match value {
        Value::String(text) => {
            if let Ok(parsed) = serde_json::from_str::<Value>(text) {
                if !parsed.is_string() {
                    collect_references(&parsed, &mut found);
                }
            }
        }
        other => collect_references(other, &mut found),
    }
    found
}

fn collect_references(value: &Value, out: &mut Vec<PageReference>) {
    match value {
        Value::Object(map) => {
            let document = map.get("document").and_then(Value::as_str);
            let page = map
                .get("page_number")
                .and_then(Value::as_u64)
                .and_then(|p| u32::try_from(p).ok())
                .filter(|p| *p > 0);
            if let (Some(document), Some(page)) = (document, page) {
                let label = ["section_title", "refined_text"]
                    .iter()
                    .find_map(|key| map.get(*key).and_then(Value::as_str))
                    .map(str::to_owned);
                out.push(PageReference {
                    document: document.to_owned(),
                    page,
                    label,
                });
            }
            for child in map.values() {
                collect_references(child, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references(item, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spans_of(kind: TokenKind, spans: &[Span]) -> Vec<String> {
        spans
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| s.text.clone())
            .collect()
    }

    #[test]
    fn structured_values_use_two_space_indent() {
        let text = pretty_print(&json!({"a": [1, 2]})).unwrap();
        assert_eq!(text, "{\n  \"a\": [\n    1,\n    2\n  ]\n}");
    }

    #[test]
    fn json_text_is_reformatted_and_other_text_kept() {
        let text = pretty_print(&json!("{\"a\":true}")).unwrap();
        assert_eq!(text, "{\n  \"a\": true\n}");

        let raw = "not json: {";
        assert_eq!(pretty_print(&json!(raw)).unwrap(), raw);
    }

    #[test]
    fn pretty_print_is_idempotent_on_text() {
        for input in [
            r#"{"summary":"ok","score":0.5}"#,
            r#"[1, 2.25, -3e2, null, "x"]"#,
            r#"{"nested": {"deep": [{"k": false}]}, "b": "</script>"}"#,
            "plain words",
            "42",
        ] {
            let once = pretty_print(&json!(input)).unwrap();
            let twice = pretty_print(&Value::String(once.clone())).unwrap();
            assert_eq!(once, twice, "input: {input}");
        }
    }

    #[test]
    fn structured_values_round_trip() {
        for value in [
            json!({"summary": "ok", "score": 0.5}),
            json!([1, -2, 3.75, true, null, {"x": []}]),
            json!({"unicode": "naïve ✓", "escaped": "quote \" and \\ slash"}),
            json!(12),
            json!(null),
        ] {
            let text = pretty_print(&value).unwrap();
            let parsed: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(parsed, value);
        }
    }

    #[test]
    fn output_is_stable_across_calls() {
        let value = json!({"z": 1, "a": {"m": [true, "s"]}});
        assert_eq!(pretty_print(&value).unwrap(), pretty_print(&value).unwrap());
    }

    #[test]
    fn summary_scenario_classifies_spans() {
        let pretty = pretty_print(&json!({"summary": "ok", "score": 0.5})).unwrap();
        assert!(pretty.contains("\"summary\": \"ok\""));

        let spans = tokenize(&pretty);
        assert_eq!(spans_of(TokenKind::Key, &spans), vec!["\"summary\":", "\"score\":"]);
        assert_eq!(spans_of(TokenKind::String, &spans), vec!["\"ok\""]);
        assert_eq!(spans_of(TokenKind::Number, &spans), vec!["0.5"]);
    }

    #[test]
    fn literals_and_numbers_are_classified() {
        let spans = tokenize("[true, false, null, -12, 3.5e-2, 7E+3]");
        assert_eq!(spans_of(TokenKind::Boolean, &spans), vec!["true", "false"]);
        assert_eq!(spans_of(TokenKind::Null, &spans), vec!["null"]);
        assert_eq!(
            spans_of(TokenKind::Number, &spans),
            vec!["-12", "3.5e-2", "7E+3"]
        );
    }

    #[test]
    fn literal_words_inside_strings_stay_strings() {
        let spans = tokenize(r#"{"flag": "true or null 12"}"#);
        assert_eq!(spans_of(TokenKind::String, &spans), vec!["\"true or null 12\""]);
        assert!(spans_of(TokenKind::Boolean, &spans).is_empty());
        assert!(spans_of(TokenKind::Number, &spans).is_empty());
    }

    #[test]
    fn escaped_quotes_do_not_end_strings() {
        let spans = tokenize(r#""say \"hi\"": "aéb""#);
        assert_eq!(spans_of(TokenKind::Key, &spans), vec![r#""say \"hi\"":"#]);
        assert_eq!(spans_of(TokenKind::String, &spans), vec![r#""aéb""#]);
    }

    #[test]
    fn key_span_includes_its_colon() {
        let spans = tokenize("{\"a\" : 1, \"b\": \"c:\"}");
        assert_eq!(spans_of(TokenKind::Key, &spans), vec!["\"a\" :", "\"b\":"]);
        assert_eq!(spans_of(TokenKind::String, &spans), vec!["\"c:\""]);
        assert!(spans
            .iter()
            .filter(|span| span.kind == TokenKind::Plain)
            .all(|span| !span.text.contains(':')));
    }

    #[test]
    fn spans_reassemble_the_escaped_text() {
        let pretty = pretty_print(&json!({"k": [1, "two", null]})).unwrap();
        let joined: String = tokenize(&pretty).into_iter().map(|s| s.text).collect();
        assert_eq!(joined, escape_html(&pretty));
    }

    #[test]
    fn tokenizer_never_emits_raw_markup() {
        let value = json!({
            "<script>": "alert('x') && 1 < 2 > 0",
            "a&b": ["<b>", "&amp;", 5],
        });
        let spans = highlight(&value).unwrap();
        for span in &spans {
            assert!(!span.text.contains('<'), "raw < in {:?}", span);
            assert!(!span.text.contains('>'), "raw > in {:?}", span);
            let mut rest = span.text.as_str();
            while let Some(idx) = rest.find('&') {
                rest = &rest[idx..];
                assert!(
                    rest.starts_with("&amp;") || rest.starts_with("&lt;") || rest.starts_with("&gt;"),
                    "raw & in {:?}",
                    span
                );
                rest = &rest[1..];
            }
        }
    }

    #[test]
    fn display_text_restores_markup_characters() {
        let spans = tokenize(r#"["a<b", "&lt;"]"#);
        let shown: String = spans.iter().map(Span::display_text).collect();
        assert_eq!(shown, r#"["a<b", "&lt;"]"#);
    }

    #[test]
    fn html_wraps_classified_spans() {
        let html = to_html(&tokenize(r#"{"k": -1.5e3, "n": null, "s": "<i>"}"#));
        insta::assert_snapshot!(html, @r#"{<span class="text-info font-semibold">"k":</span> <span class="text-info">-1.5e3</span>, <span class="text-info font-semibold">"n":</span> <span class="text-error">null</span>, <span class="text-info font-semibold">"s":</span> <span class="text-neutral">"&lt;i&gt;"</span>}"#);
    }

    #[test]
    fn download_writes_pretty_bytes_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let value = json!({"summary": "ok"});

        let path = download(&value, dir.path(), "analysis_result.json").unwrap();
        assert_eq!(path, dir.path().join("analysis_result.json"));
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            pretty_print(&value).unwrap()
        );

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn download_rejects_paths_as_filenames() {
        let dir = tempfile::tempdir().unwrap();
        for bad in ["", "  ", "../escape.json", "nested/file.json", ".."] {
            assert!(
                matches!(
                    download(&json!({}), dir.path(), bad),
                    Err(ResultError::InvalidFilename(_))
                ),
                "accepted {bad:?}"
            );
        }
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn artifact_carries_media_type() {
        let artifact = DownloadArtifact::new(&json!([1]), "out.json").unwrap();
        assert_eq!(artifact.media_type, "application/json");
        assert_eq!(artifact.bytes, b"[\n  1\n]");
    }

    #[test]
    fn page_references_follow_document_order() {
        let summary = json!({
            "metadata": {"input_documents": ["a.pdf", "b.pdf"]},
            "extracted_sections": [
                {"document": "b.pdf", "section_title": "Intro", "importance_rank": 1, "page_number": 3},
                {"document": "a.pdf", "section_title": "Costs", "importance_rank": 2, "page_number": 0}
            ],
            "subsection_analysis": [
                {"document": "a.pdf", "refined_text": "Budget table", "page_number": 9}
            ]
        })
        .to_string();

        let refs = page_references(&Value::String(summary));
        assert_eq!(
            refs,
            vec![
                PageReference {
                    document: "b.pdf".into(),
                    page: 3,
                    label: Some("Intro".into()),
                },
                PageReference {
                    document: "a.pdf".into(),
                    page: 9,
                    label: Some("Budget table".into()),
                },
            ]
        );
    }

    #[test]
    fn page_references_of_plain_text_are_empty() {
        assert!(page_references(&json!("no structure here")).is_empty());
        assert!(page_references(&json!(5)).is_empty());
    }
}
