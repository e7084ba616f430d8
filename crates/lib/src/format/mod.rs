//! Reply formatter: turns automation reply text (pipe tables plus a little markdown)
//! into HTML that can be displayed without further escaping.
//!
//! Tables are detected first; the text around them goes through the markdown rules
//! in [`markdown`]. Every piece of input text is escaped before it is wrapped in
//! the tags introduced here.

mod markdown;
mod table;

pub use table::{segment, Segment, Table};

use std::panic::{self, AssertUnwindSafe};

/// Escape text for use as HTML element content.
pub fn escape(text: &str) -> String {
    html_escape::encode_text(text).into_owned()
}

fn render_table(table: &Table, out: &mut String) {
    out.push_str("<table><thead><tr>");
    for cell in &table.header {
        out.push_str("<th>");
        out.push_str(&escape(cell));
        out.push_str("</th>");
    }
    out.push_str("</tr></thead><tbody>");
    for row in &table.rows {
        out.push_str("<tr>");
        for cell in row {
            out.push_str("<td>");
            out.push_str(&escape(cell));
            out.push_str("</td>");
        }
        out.push_str("</tr>");
    }
    out.push_str("</tbody></table>");
}

fn render(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 64);
    for (i, seg) in segment(input).iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        match seg {
            Segment::Text(text) => out.push_str(&markdown::render_text(text)),
            Segment::Table(table) => render_table(table, &mut out),
        }
    }
    out
}

/// Format a reply for display. Never fails: if rendering panics, the input is
/// returned escaped.
pub fn render_html(input: &str) -> String {
    match panic::catch_unwind(AssertUnwindSafe(|| render(input))) {
        Ok(html) => html,
        Err(_) => {
            log::warn!("format: rendering failed, falling back to escaped text");
            escape(input)
        }
    }
}
