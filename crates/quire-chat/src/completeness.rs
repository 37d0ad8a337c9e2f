//! Incremental markup completeness detection.
//!
//! While an answer streams in, its tail is often mid-construct: a fenced
//! block without its closing fence, a `**` without its partner, a link whose
//! destination has not arrived. Rendering such text as rich markup makes the
//! output flicker between layouts, so callers show plain text until
//! [`CompletenessDetector::check`] reports the text complete.
//!
//! Every call parses the full text from scratch; nothing is carried between
//! calls.

use std::sync::LazyLock;

use pulldown_cmark::{html, Options, Parser};
use regex::Regex;

use quire_core::config::RenderingConfig;

/// A markup construct left open at the end of the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenConstruct {
    FencedBlock,
    DisplayMath,
    InlineCode,
    Strong,
    Emphasis,
    Strikethrough,
    Link,
    HtmlTag,
    TableRow,
}

/// A rendered markup document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkupDocument {
    html: String,
}

impl MarkupDocument {
    pub fn html(&self) -> &str {
        &self.html
    }

    pub fn into_html(self) -> String {
        self.html
    }
}

/// Result of one completeness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkupCheck {
    /// Present only when the text is complete.
    pub document: Option<MarkupDocument>,
    pub is_complete: bool,
    pub open: Vec<OpenConstruct>,
}

impl MarkupCheck {
    fn incomplete(open: Vec<OpenConstruct>) -> Self {
        Self {
            document: None,
            is_complete: false,
            open,
        }
    }
}

/// Decides whether accumulated text can be shown as rich markup.
#[derive(Debug, Clone)]
pub struct CompletenessDetector {
    inline_threshold: usize,
}

impl Default for CompletenessDetector {
    fn default() -> Self {
        Self::from_config(&RenderingConfig::default())
    }
}

impl CompletenessDetector {
    pub fn new(inline_threshold: usize) -> Self {
        Self { inline_threshold }
    }

    pub fn from_config(config: &RenderingConfig) -> Self {
        Self::new(config.inline_parse_threshold)
    }

    pub fn inline_threshold(&self) -> usize {
        self.inline_threshold
    }

    /// Check `text`, parsing off the async executor when it is long.
    pub async fn check(&self, text: &str) -> MarkupCheck {
        if text.len() <= self.inline_threshold {
            return check_text(text);
        }

        let owned = text.to_owned();
        match tokio::task::spawn_blocking(move || check_text(&owned)).await {
            Ok(check) => check,
            Err(e) => {
                tracing::warn!(error = %e, "Markup check task failed, falling back to plain text");
                MarkupCheck::incomplete(Vec::new())
            }
        }
    }

    /// Check `text` on the current thread regardless of length.
    pub fn check_blocking(&self, text: &str) -> MarkupCheck {
        check_text(text)
    }
}

fn check_text(text: &str) -> MarkupCheck {
    let open = open_constructs(text);
    if !open.is_empty() {
        return MarkupCheck::incomplete(open);
    }
    MarkupCheck {
        document: Some(render(text)),
        is_complete: true,
        open,
    }
}

/// Render complete markup to HTML.
pub fn render(text: &str) -> MarkupDocument {
    let options = Options::ENABLE_TABLES
        | Options::ENABLE_STRIKETHROUGH
        | Options::ENABLE_TASKLISTS
        | Options::ENABLE_FOOTNOTES;
    let parser = Parser::new_ext(text, options);
    let mut out = String::with_capacity(text.len() + text.len() / 2);
    html::push_html(&mut out, parser);
    MarkupDocument { html: out }
}

// =============================================================================
// Tail classification
// =============================================================================

static OPEN_LINK_TEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*$").expect("Invalid link regex"));

static OPEN_LINK_DEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\]\([^)]*$").expect("Invalid link regex"));

static OPEN_HTML_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[A-Za-z/!][^>]*$").expect("Invalid tag regex"));

/// List the constructs left open at the end of `text`.
///
/// Inline constructs cannot span paragraphs, so only the last paragraph is
/// inspected for them; block constructs are tracked over the whole text.
pub fn open_constructs(text: &str) -> Vec<OpenConstruct> {
    let mut open = Vec::new();

    let (prose, fence_open) = strip_fenced_blocks(text);
    if fence_open {
        open.push(OpenConstruct::FencedBlock);
    }
    if display_math_open(&prose) {
        open.push(OpenConstruct::DisplayMath);
    }

    let tail = last_paragraph(&prose);
    if tail.is_empty() {
        return open;
    }

    if last_line_is_open_table_row(&tail) {
        open.push(OpenConstruct::TableRow);
    }

    let (outside_code, unmatched) = strip_code_spans(&tail);
    if unmatched.is_some() {
        open.push(OpenConstruct::InlineCode);
    }

    let plain = strip_escapes(&outside_code);
    let strong_runs = plain.matches("**").count() + plain.matches("__").count();
    if strong_runs % 2 == 1 {
        open.push(OpenConstruct::Strong);
    }
    if has_open_emphasis(&plain.replace("**", "").replace("__", "")) {
        open.push(OpenConstruct::Emphasis);
    }
    if plain.matches("~~").count() % 2 == 1 {
        open.push(OpenConstruct::Strikethrough);
    }
    if OPEN_LINK_TEXT_RE.is_match(&plain) || OPEN_LINK_DEST_RE.is_match(&plain) {
        open.push(OpenConstruct::Link);
    }
    if OPEN_HTML_TAG_RE.is_match(&plain) {
        open.push(OpenConstruct::HtmlTag);
    }

    open
}

/// Replace fenced block bodies with blank lines.
///
/// Returns the remaining prose and whether a fence is still open.
fn strip_fenced_blocks(text: &str) -> (String, bool) {
    let mut prose = String::with_capacity(text.len());
    let mut fence: Option<(char, usize)> = None;

    for line in text.split('\n') {
        let trimmed = line.trim_start();
        let indent = line.len() - trimmed.len();

        match fence {
            Some((ch, len)) => {
                let run = trimmed.chars().take_while(|&c| c == ch).count();
                if indent <= 3 && run >= len && trimmed.trim_end().chars().all(|c| c == ch) {
                    fence = None;
                }
                prose.push('\n');
            }
            None => {
                if indent <= 3 {
                    if let Some(opening) = opening_fence(trimmed) {
                        fence = Some(opening);
                        prose.push('\n');
                        continue;
                    }
                }
                prose.push_str(line);
                prose.push('\n');
            }
        }
    }

    (prose, fence.is_some())
}

fn opening_fence(line: &str) -> Option<(char, usize)> {
    let ch = line.chars().next()?;
    if ch != '`' && ch != '~' {
        return None;
    }
    let len = line.chars().take_while(|&c| c == ch).count();
    if len < 3 {
        return None;
    }
    // A backtick fence's info string may not itself contain backticks.
    if ch == '`' && line[len..].contains('`') {
        return None;
    }
    Some((ch, len))
}

fn last_paragraph(prose: &str) -> String {
    let lines: Vec<&str> = prose.lines().collect();
    let start = lines
        .iter()
        .rposition(|l| l.trim().is_empty())
        .map(|i| i + 1)
        .unwrap_or(0);
    lines[start..].join("\n")
}

fn last_line_is_open_table_row(tail: &str) -> bool {
    tail.lines()
        .last()
        .map(|line| {
            let line = line.trim();
            line.starts_with('|') && !line.ends_with('|')
        })
        .unwrap_or(false)
}

/// Count `$$` delimiters outside code spans.
///
/// Code spans end at a blank line, so each paragraph is stripped on its own.
fn display_math_open(prose: &str) -> bool {
    let mut delimiters = 0;
    let mut paragraph = String::new();
    for line in prose.lines().chain(std::iter::once("")) {
        if line.trim().is_empty() {
            delimiters += without_code_spans(&paragraph).matches("$$").count();
            paragraph.clear();
        } else {
            paragraph.push_str(line);
            paragraph.push('\n');
        }
    }
    delimiters % 2 == 1
}

/// Remove every closed code span, keeping unmatched backtick runs as text.
fn without_code_spans(paragraph: &str) -> String {
    let mut out = String::with_capacity(paragraph.len());
    let mut rest = paragraph;
    loop {
        let (stripped, unmatched) = strip_code_spans(rest);
        out.push_str(&stripped);
        let Some(at) = unmatched else {
            return out;
        };
        let run = run_length(rest.as_bytes(), at, b'`');
        out.push_str(&rest[at..at + run]);
        rest = &rest[at + run..];
    }
}

/// Remove closed code spans.
///
/// Stops at the first backtick run with no closing run and returns its
/// byte offset; everything after it would be code if the span closes later.
fn strip_code_spans(tail: &str) -> (String, Option<usize>) {
    let bytes = tail.as_bytes();
    let mut out = String::with_capacity(tail.len());
    let mut last = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'`' => {
                let run = run_length(bytes, i, b'`');
                out.push_str(&tail[last..i]);
                match closing_run(bytes, i + run, run) {
                    Some(end) => {
                        i = end;
                        last = end;
                    }
                    None => return (out, Some(i)),
                }
            }
            _ => i += 1,
        }
    }

    out.push_str(&tail[last..]);
    (out, None)
}

fn run_length(bytes: &[u8], start: usize, byte: u8) -> usize {
    bytes[start..].iter().take_while(|&&b| b == byte).count()
}

fn closing_run(bytes: &[u8], from: usize, len: usize) -> Option<usize> {
    let mut j = from;
    while j < bytes.len() {
        if bytes[j] == b'`' {
            let run = run_length(bytes, j, b'`');
            if run == len {
                return Some(j + run);
            }
            j += run;
        } else {
            j += 1;
        }
    }
    None
}

fn strip_escapes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            chars.next();
        } else {
            out.push(c);
        }
    }
    out
}

/// Whether an emphasis opener is still waiting for its closer.
///
/// Delimiters are classified by the CommonMark flanking rules and matched
/// against a stack per delimiter character. A leftover delimiter that could
/// also have closed (as in `2*3`) renders literally and is not reported.
fn has_open_emphasis(text: &str) -> bool {
    let chars: Vec<char> = text.chars().collect();
    let mut stars: Vec<bool> = Vec::new();
    let mut underscores: Vec<bool> = Vec::new();

    for (idx, &c) in chars.iter().enumerate() {
        if c != '*' && c != '_' {
            continue;
        }
        let prev = idx.checked_sub(1).map(|p| chars[p]);
        let next = chars.get(idx + 1).copied();

        let left = next.is_some_and(|n| {
            !n.is_whitespace() && (!is_punctuation(n) || prev.map_or(true, is_space_or_punct))
        });
        let right = prev.is_some_and(|p| {
            !p.is_whitespace() && (!is_punctuation(p) || next.map_or(true, is_space_or_punct))
        });

        let (can_open, can_close, stack) = if c == '*' {
            (left, right, &mut stars)
        } else {
            (
                left && (!right || prev.is_some_and(is_punctuation)),
                right && (!left || next.is_some_and(is_punctuation)),
                &mut underscores,
            )
        };

        if can_close && stack.pop().is_some() {
            continue;
        }
        if can_open {
            stack.push(can_close);
        }
    }

    stars.iter().chain(&underscores).any(|&both| !both)
}

fn is_punctuation(c: char) -> bool {
    !c.is_alphanumeric() && !c.is_whitespace()
}

fn is_space_or_punct(c: char) -> bool {
    c.is_whitespace() || is_punctuation(c)
}
