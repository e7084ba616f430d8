//! Pipe-table detection: splits reply text into plain-text and table segments.

/// Minimum number of `|` characters for a line to belong to a table region.
const MIN_PIPES: usize = 3;

/// A table recovered from a pipe-delimited region. Every body row has exactly
/// `header.len()` cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// A run of reply text, in original order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Table(Table),
}

fn is_table_line(line: &str) -> bool {
    line.matches('|').count() >= MIN_PIPES
}

/// `|---|:--:|` style lines, including rules with no dashes such as `| | |`.
fn is_separator(line: &str) -> bool {
    line.chars()
        .all(|c| c == '|' || c == '-' || c == ':' || c.is_whitespace())
}

/// Split a row on `|`, trimming cells and dropping the empty cells produced by
/// leading/trailing pipes. Interior empty cells are kept.
fn split_cells(line: &str) -> Vec<String> {
    let trimmed = line.trim();
    let mut cells: Vec<&str> = trimmed.split('|').map(str::trim).collect();
    if cells.first().is_some_and(|c| c.is_empty()) {
        cells.remove(0);
    }
    if cells.last().is_some_and(|c| c.is_empty()) {
        cells.pop();
    }
    cells.into_iter().map(str::to_string).collect()
}

impl Table {
    /// Build a table from a region of consecutive table lines. Separator lines are
    /// dropped; the first remaining line is the header. Returns None when the header
    /// has no usable columns.
    pub fn from_region(lines: &[&str]) -> Option<Table> {
        let mut data = lines.iter().filter(|l| !is_separator(l));
        let header = split_cells(data.next()?);
        if header.iter().all(|c| c.is_empty()) {
            return None;
        }
        let width = header.len();
        let rows = data
            .map(|line| {
                let mut cells = split_cells(line);
                cells.resize(width, String::new());
                cells
            })
            .collect();
        Some(Table { header, rows })
    }
}

/// Split `input` into text and table segments. Regions that do not yield a table
/// stay in the surrounding text.
pub fn segment(input: &str) -> Vec<Segment> {
    let lines: Vec<&str> = input.split('\n').collect();
    let mut out = Vec::new();
    let mut text: Vec<&str> = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        if !is_table_line(lines[i]) {
            text.push(lines[i]);
            i += 1;
            continue;
        }
        let start = i;
        while i < lines.len() && is_table_line(lines[i]) {
            i += 1;
        }
        let region = &lines[start..i];
        match Table::from_region(region) {
            Some(table) => {
                if !text.is_empty() {
                    out.push(Segment::Text(text.join("\n")));
                    text.clear();
                }
                out.push(Segment::Table(table));
            }
            None => text.extend_from_slice(region),
        }
    }
    if !text.is_empty() {
        out.push(Segment::Text(text.join("\n")));
    }
    out
}
