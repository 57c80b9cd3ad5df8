//! The result model: single reported outcomes, the rows that hold them,
//! and the wikitext scanners that recover both from result-table markup.

use std::collections::BTreeMap;
use std::fmt;

use crate::helpers::find_bugs;

/// Reporters whose "results" are sample placeholders left behind by page
/// templates and documentation. Never returned from a scan.
const SAMPLE_USERS: [&str; 5] = ["sampleuser", "exampleuser", "example", "username", "fasname"];

/// A reported outcome status. A cell placeholder ("no result yet") is a
/// `TestResult` whose status is `None`, not a missing status variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pass,
    Fail,
    Warn,
    Inprogress,
}

impl Status {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "pass" => Some(Self::Pass),
            "fail" => Some(Self::Fail),
            "warn" => Some(Self::Warn),
            "inprogress" => Some(Self::Inprogress),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Warn => "warn",
            Self::Inprogress => "inprogress",
        }
    }
}

/// A single test result as embedded in a table cell. Only ever exists as
/// wikitext on a page; instances are transient parse/report artifacts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestResult {
    pub status: Option<Status>,
    pub user: String,
    pub bugs: Vec<String>,
    pub comment: String,
    pub bot: bool,
}

impl TestResult {
    pub fn new(status: Status, user: &str) -> Self {
        Self {
            status: Some(status),
            user: user.to_string(),
            ..Self::default()
        }
    }

    /// The `{{result|...}}` template string representing this result.
    pub fn render(&self) -> String {
        let status = self.status.map(Status::as_str).unwrap_or("none");
        let mut out = format!("{{{{result|{status}");
        if !self.user.is_empty() {
            out.push('|');
            out.push_str(&self.user);
        }
        for bug in &self.bugs {
            out.push('|');
            out.push_str(bug);
        }
        if self.bot {
            out.push_str("|bot=true");
        }
        out.push_str("}}");
        out.push_str(&self.comment);
        out
    }

    /// Results of the "previous ... run" form carry an outcome forward from
    /// an earlier compose rather than reporting fresh testing.
    pub fn is_transferred(&self) -> bool {
        self.user.contains("previous ")
    }

    /// Bug IDs referenced from `{{bz|...}}` calls inside the comment, as
    /// opposed to the bugs filed directly on the result.
    pub fn comment_bugs(&self) -> Vec<String> {
        find_bugs(&self.comment)
    }
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(status) = self.status else {
            return write!(f, "Result placeholder - {{{{result|none}}}}");
        };
        if self.bot {
            write!(f, "BOT ")?;
        }
        write!(f, "Result: {status:?}")?;
        if self.is_transferred() {
            write!(f, " transferred: {}", self.user)?;
        } else if !self.user.is_empty() {
            write!(f, " from {}", self.user)?;
        }
        if !self.bugs.is_empty() {
            write!(f, ", bugs: {}", self.bugs.join(", "))?;
        }
        if !self.comment.is_empty() {
            write!(f, ", comment: {}", strip_ref_tags(&self.comment))?;
        }
        Ok(())
    }
}

/// Status/transferred/bot narrowing applied on top of a cell scan.
#[derive(Debug, Clone)]
pub struct ResultFilter {
    pub statuses: Vec<Status>,
    pub include_transferred: bool,
    pub include_bot: bool,
}

impl Default for ResultFilter {
    fn default() -> Self {
        Self {
            statuses: Vec::new(),
            include_transferred: true,
            include_bot: true,
        }
    }
}

impl ResultFilter {
    pub fn apply(&self, results: Vec<TestResult>) -> Vec<TestResult> {
        results
            .into_iter()
            .filter(|res| {
                if !self.statuses.is_empty() {
                    let matched = res
                        .status
                        .map(|status| self.statuses.contains(&status))
                        .unwrap_or(false);
                    if !matched {
                        return false;
                    }
                }
                if !self.include_transferred && res.is_transferred() {
                    return false;
                }
                if !self.include_bot && res.bot {
                    return false;
                }
                true
            })
            .collect()
    }
}

/// Find all test results in a chunk of wikitext (typically one table
/// cell). Malformed template occurrences are skipped, never fatal.
pub fn find_results(text: &str) -> Vec<TestResult> {
    find_result_templates(text)
        .into_iter()
        .filter_map(from_result_template)
        .filter(|res| {
            res.user.is_empty() || !SAMPLE_USERS.contains(&res.user.to_lowercase().as_str())
        })
        .collect()
}

/// One test instance: a row binding a test case to one result cell per
/// environment column. Rebuilt from page text on every scan, never cached
/// across edits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRow {
    /// Full identifying name, usually the target of the test-case link.
    pub testcase: String,
    /// Display name; the link text where it differs from the target.
    pub name: String,
    /// Heading of the enclosing page section.
    pub section: String,
    /// Section index used to re-locate the section's byte range on edit.
    pub secid: i64,
    /// Environment column names, in cell order.
    pub columns: Vec<String>,
    /// Results already present, keyed by environment name.
    pub results: BTreeMap<String, Vec<TestResult>>,
    /// Exact wikitext of the row, kept for byte-exact replacement.
    pub origtext: String,
}

impl ResultRow {
    /// Identity check across separate scans of the same page text. Field
    /// equality is too strong since result lists are rebuilt per scan.
    pub fn matches(&self, other: &ResultRow) -> bool {
        self.testcase == other.testcase
            && self.name == other.name
            && self.secid == other.secid
            && self.origtext == other.origtext
    }
}

/// Find result rows in one section's wikitext. The header row declares the
/// identity column followed by the environment columns; data rows bind
/// their cells to those environments positionally. Rows that do not line
/// up with the header are skipped rather than raising.
pub fn find_resultrows(text: &str, section: &str, secid: i64) -> Vec<ResultRow> {
    let mut columns: Vec<String> = Vec::new();
    let mut rows = Vec::new();
    for chunk in split_table_rows(text) {
        // A header row may arrive in the same chunk as preceding prose, so
        // scan line by line for column titles before looking at cells.
        for line in chunk.lines() {
            let line = line.trim();
            if let Some(titles) = line.strip_prefix('!')
                && titles.contains("!!")
            {
                let titles: Vec<String> = titles.split("!!").map(sanitize_column).collect();
                if titles.len() > 1 {
                    columns = titles[1..].to_vec();
                }
            }
        }
        if columns.is_empty() {
            continue;
        }
        if let Some(row) = row_from_chunk(chunk, &columns, section, secid) {
            rows.push(row);
        }
    }
    rows
}

fn row_from_chunk(chunk: &str, columns: &[String], section: &str, secid: i64) -> Option<ResultRow> {
    let cells: Vec<&str> = chunk.split("\n|").collect();
    if cells.len() < 2 {
        return None;
    }
    let offset = data_cell_offset(cells[0]);
    let identity = if offset == 2 {
        // the identity cell's own "\n|" was consumed by the split
        cells[1].trim()
    } else {
        // anything that is not a table cell (prose between tables, the
        // table opener, the header row itself) fails this shape check
        cells[0].trim_start().strip_prefix('|')?.trim()
    };
    if identity.is_empty() {
        return None;
    }
    let data = &cells[offset.min(cells.len())..];
    if data.len() != columns.len() {
        return None;
    }
    let (testcase, name) = parse_identity(identity);
    let mut results = BTreeMap::new();
    for (column, cell) in columns.iter().zip(data) {
        results.insert(column.clone(), find_results(cell));
    }
    Some(ResultRow {
        testcase,
        name,
        section: section.to_string(),
        secid,
        columns: columns.to_vec(),
        results,
        origtext: chunk.to_string(),
    })
}

/// Index of the first data cell in a row split on `"\n|"`. Normally the
/// identity cell occupies slot 0; when the row text opens with a blank
/// line (say, where a comment was stripped) the split consumes the
/// identity cell's own delimiter and shifts everything by one.
pub(crate) fn data_cell_offset(first_cell: &str) -> usize {
    if first_cell.trim().is_empty() { 2 } else { 1 }
}

/// The first cell identifies the test: `[[target|label]]` gives the full
/// test-case name and a display name, `[[target]]` or plain text give both.
fn parse_identity(cell: &str) -> (String, String) {
    if let Some(start) = cell.find("[[")
        && let Some(end) = cell[start..].find("]]")
    {
        let inner = &cell[start + 2..start + end];
        let (target, label) = match inner.split_once('|') {
            Some((target, label)) => (target.trim(), label.trim()),
            None => (inner.trim(), inner.trim()),
        };
        if !target.is_empty() {
            let label = if label.is_empty() { target } else { label };
            return (target.to_string(), label.to_string());
        }
    }
    (cell.to_string(), cell.to_string())
}

/// Split a section into table-row chunks at `|-` and `|}` delimiter lines.
/// Chunks are exact subslices so row text can later be replaced in place.
fn split_table_rows(text: &str) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut chunk_start = 0usize;
    let mut pos = 0usize;
    for line in text.split_inclusive('\n') {
        let line_start = pos;
        pos += line.len();
        if line.starts_with("|-") || line.starts_with("|}") {
            chunks.push(&text[chunk_start..line_start]);
            chunk_start = pos;
        }
    }
    chunks.push(&text[chunk_start..]);
    chunks
}

/// Column titles as written carry emphasis quotes, link brackets, and the
/// odd `<ref>` note; reduce them to the bare environment name.
fn sanitize_column(raw: &str) -> String {
    let mut name = raw
        .trim()
        .trim_matches(|ch| matches!(ch, '\'' | '[' | ']'))
        .trim()
        .to_string();
    if let Some(start) = name.find("<ref>")
        && let Some(end) = name.find("</ref>")
        && end >= start
    {
        name = format!("{}{}", &name[..start], &name[end + "</ref>".len()..])
            .trim()
            .to_string();
    }
    if let Some(pos) = name.find('|') {
        name = name[pos + 1..].to_string();
    }
    name.trim().to_string()
}

/// Each returned slice is one `{{result...}}` template call together with
/// the free text trailing it (the result's comment), ending at the next
/// template, the next cell boundary, or the end of the input.
fn find_result_templates(text: &str) -> Vec<&str> {
    let mut starts = Vec::new();
    let mut search = 0usize;
    while let Some(pos) = text[search..].find("{{result") {
        starts.push(search + pos);
        search = search + pos + "{{result".len();
    }
    let mut found = Vec::new();
    for (i, &start) in starts.iter().enumerate() {
        let next = starts.get(i + 1).copied().unwrap_or(text.len());
        let Some(close) = text[start..].find("}}") else {
            continue;
        };
        let body_end = start + close + 2;
        if body_end > next {
            // unterminated template running into the next one
            continue;
        }
        let comment_end = text[body_end..next]
            .find("\n|")
            .map(|pos| body_end + pos)
            .unwrap_or(next);
        found.push(&text[start..comment_end]);
    }
    found
}

/// Build a TestResult from one matched template occurrence. Named
/// parameters may appear anywhere and are not counted among the positional
/// ones; the comment is recorded exactly as written.
fn from_result_template(text: &str) -> Option<TestResult> {
    let (template, comment) = text.trim().split_once("}}")?;
    let comment = comment.trim().to_string();
    let template = template.trim_start_matches('{');

    let mut positional = Vec::new();
    let mut bot = false;
    for param in template.split('|') {
        if let Some((key, value)) = param.split_once('=') {
            // any non-empty value counts, matching how the wiki renders it
            if key.trim() == "bot" && !value.trim().is_empty() {
                bot = true;
            }
            continue;
        }
        positional.push(param.trim());
    }

    // positional[0] is the template name itself
    let status = match positional.get(1).copied().unwrap_or("") {
        "" => None,
        token if token.eq_ignore_ascii_case("none") => None,
        token => Some(Status::parse(token)?),
    };
    let user = positional.get(2).copied().unwrap_or("").to_string();
    let bugs = positional.iter().skip(3).filter_map(|bug| clean_bug(bug)).collect();

    Some(TestResult {
        status,
        user,
        bugs,
        comment,
        bot,
    })
}

/// People sometimes file `123456#c7` to point at a specific comment;
/// reduce that to the bare bug ID.
fn clean_bug(raw: &str) -> Option<String> {
    let bug = raw.trim();
    if bug.is_empty() {
        return None;
    }
    if let Some((id, _)) = bug.split_once('#')
        && !id.is_empty()
        && id.chars().all(|ch| ch.is_ascii_digit())
    {
        return Some(id.to_string());
    }
    Some(bug.to_string())
}

fn strip_ref_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        let open = rest.find("<ref");
        let close = rest.find("</ref");
        let tag_start = match (open, close) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => break,
        };
        out.push_str(&rest[..tag_start]);
        match rest[tag_start..].find('>') {
            Some(end) => rest = &rest[tag_start + end + 1..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}
