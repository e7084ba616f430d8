//! The small markdown subset used outside tables: headings, lists, paragraphs,
//! and inline bold / italic / code.

use regex::Regex;
use std::sync::OnceLock;

use super::escape;

#[derive(Debug, PartialEq)]
enum Block<'a> {
    Heading(u8, &'a str),
    Unordered(Vec<&'a str>),
    Ordered(Vec<&'a str>),
    Paragraph(Vec<&'a str>),
}

// Block markers may be indented; headings and list items alike.
fn heading(line: &str) -> Option<(u8, &str)> {
    let t = line.trim_start();
    if let Some(rest) = t.strip_prefix("### ") {
        Some((3, rest))
    } else if let Some(rest) = t.strip_prefix("## ") {
        Some((2, rest))
    } else {
        t.strip_prefix("# ").map(|rest| (1, rest))
    }
}

fn bullet(line: &str) -> Option<&str> {
    let t = line.trim_start();
    t.strip_prefix("- ").or_else(|| t.strip_prefix("* "))
}

fn numbered(line: &str) -> Option<&str> {
    let t = line.trim_start();
    let digits = t.len() - t.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return None;
    }
    t[digits..].strip_prefix(". ")
}

fn blocks(text: &str) -> Vec<Block<'_>> {
    let mut out: Vec<Block> = Vec::new();
    // Lists and paragraphs only extend across directly adjacent lines.
    let mut open = false;

    for line in text.split('\n') {
        if line.trim().is_empty() {
            open = false;
            continue;
        }
        if let Some((level, rest)) = heading(line) {
            out.push(Block::Heading(level, rest.trim()));
            open = false;
            continue;
        }
        if let Some(item) = bullet(line) {
            match out.last_mut() {
                Some(Block::Unordered(items)) if open => items.push(item.trim()),
                _ => out.push(Block::Unordered(vec![item.trim()])),
            }
        } else if let Some(item) = numbered(line) {
            match out.last_mut() {
                Some(Block::Ordered(items)) if open => items.push(item.trim()),
                _ => out.push(Block::Ordered(vec![item.trim()])),
            }
        } else {
            match out.last_mut() {
                Some(Block::Paragraph(lines)) if open => lines.push(line),
                _ => out.push(Block::Paragraph(vec![line])),
            }
        }
        open = true;
    }
    out
}

fn code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"`([^`\n]+)`").expect("valid code regex"))
}

fn bold_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\*\*([^*\s](?:[^*]*[^*\s])?)\*\*").expect("valid bold regex")
    })
}

fn italic_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\*([^*\s](?:[^*]*[^*\s])?)\*").expect("valid italic regex"))
}

fn emphasis(escaped: &str) -> String {
    let bold = bold_re().replace_all(escaped, "<strong>$1</strong>");
    italic_re()
        .replace_all(&bold, "<em>$1</em>")
        .into_owned()
}

/// Escape `text` and apply inline rules. Code spans are emitted verbatim (escaped)
/// and never receive emphasis.
pub(crate) fn inline(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in code_re().captures_iter(text) {
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&emphasis(&escape(&text[last..whole.start()])));
        out.push_str("<code>");
        out.push_str(&escape(inner.as_str()));
        out.push_str("</code>");
        last = whole.end();
    }
    out.push_str(&emphasis(&escape(&text[last..])));
    out
}

fn render_list(tag: &str, items: &[&str], out: &mut String) {
    out.push('<');
    out.push_str(tag);
    out.push('>');
    for item in items {
        out.push_str("<li>");
        out.push_str(&inline(item));
        out.push_str("</li>");
    }
    out.push_str("</");
    out.push_str(tag);
    out.push('>');
}

/// Render a non-table text segment. Newlines inside paragraphs are kept as `\n`
/// (replies are shown in a pre-wrap container). Text with no headings or lists
/// comes back as inline output only.
pub(crate) fn render_text(text: &str) -> String {
    let blocks = blocks(text);
    if blocks.iter().all(|b| matches!(b, Block::Paragraph(_))) {
        return inline(text);
    }
    let mut out = String::new();
    for block in &blocks {
        match block {
            Block::Heading(level, body) => {
                out.push_str(&format!("<h{level}>{}</h{level}>", inline(body)));
            }
            Block::Unordered(items) => render_list("ul", items, &mut out),
            Block::Ordered(items) => render_list("ol", items, &mut out),
            Block::Paragraph(lines) => {
                let body: Vec<String> = lines.iter().map(|l| inline(l)).collect();
                out.push_str("<p>");
                out.push_str(&body.join("\n"));
                out.push_str("</p>");
            }
        }
    }
    out
}
