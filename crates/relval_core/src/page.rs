//! Validation pages: canonical naming, the section model, row lookup, and
//! the read-modify-write protocol that files results into result tables.

use std::thread::sleep;
use std::time::Duration;

use crate::config::TcmsConfig;
use crate::error::{TcmsError, TcmsResult};
use crate::helpers::{normalize, short_dist};
use crate::result::{ResultRow, TestResult, find_resultrows};
use crate::wiki::{SaveOutcome, WikiApi};

/// One entry of the wiki's structural parse of a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub heading: String,
    pub index: i64,
    pub byte_offset: usize,
}

/// The closed set of page flavors in a validation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Per-testtype result page for a nightly compose.
    Nightly,
    /// Per-testtype result page for a candidate (milestone) compose.
    Compose,
    /// The per-event page transcluding every result page.
    Summary,
    /// The template page holding the event's download table.
    Download,
}

/// A page participating in a validation event, identified entirely by its
/// `(dist, release, milestone, compose[, testtype])` tuple. Construction
/// never touches the network; the canonical name is a pure function of the
/// tuple and must stay stable, since it is the key results are filed under.
#[derive(Debug, Clone)]
pub struct Page {
    pub kind: PageKind,
    pub dist: String,
    pub release: String,
    pub milestone: String,
    pub compose: String,
    /// Test type for result pages; empty for summary/download pages.
    pub testtype: String,
    sections: Option<Vec<Section>>,
}

/// Partial row-identifying criteria for `Page::find_resultrow`.
#[derive(Debug, Clone, Default)]
pub struct RowCriteria {
    pub testcase: String,
    pub section: String,
    pub testname: String,
    pub env: String,
}

impl Page {
    fn new(kind: PageKind, dist: &str, release: &str, milestone: &str, compose: &str, testtype: &str) -> Self {
        Self {
            kind,
            dist: dist.to_string(),
            release: release.to_string(),
            milestone: milestone.to_string(),
            compose: compose.to_string(),
            testtype: testtype.to_string(),
            sections: None,
        }
    }

    pub fn nightly(dist: &str, release: &str, milestone: &str, compose: &str, testtype: &str) -> Self {
        Self::new(PageKind::Nightly, dist, release, milestone, compose, testtype)
    }

    pub fn compose(dist: &str, release: &str, milestone: &str, compose: &str, testtype: &str) -> Self {
        Self::new(PageKind::Compose, dist, release, milestone, compose, testtype)
    }

    pub fn summary(dist: &str, release: &str, milestone: &str, compose: &str) -> Self {
        Self::new(PageKind::Summary, dist, release, milestone, compose, "")
    }

    pub fn download(dist: &str, release: &str, milestone: &str, compose: &str) -> Self {
        Self::new(PageKind::Download, dist, release, milestone, compose, "")
    }

    /// The "release milestone compose" token every page name embeds.
    pub fn version(&self) -> String {
        format!("{} {} {}", self.release, self.milestone, self.compose)
    }

    /// Canonical wiki page name per the naming convention.
    pub fn name(&self) -> String {
        match self.kind {
            PageKind::Nightly | PageKind::Compose => {
                format!("Test Results:{} {} {}", self.dist, self.version(), self.testtype)
            }
            PageKind::Summary => format!("Test Results:{} {} Summary", self.dist, self.version()),
            PageKind::Download => format!("Template:{} {} Download", self.dist, self.version()),
        }
    }

    /// Content a clean copy of the page is created from.
    pub fn seed_text(&self, config: &TcmsConfig) -> String {
        match self.kind {
            PageKind::Nightly | PageKind::Compose => {
                let short = short_dist(&self.dist);
                let tmpl = if short.is_empty() {
                    "Validation results".to_string()
                } else {
                    format!("{short} validation results")
                };
                let compose_key = match self.kind {
                    PageKind::Nightly => "date",
                    _ => "compose",
                };
                format!(
                    "{{{{subst:{tmpl}|testtype={}|release={}|milestone={}|{compose_key}={}}}}}",
                    self.testtype, self.release, self.milestone, self.compose
                )
            }
            PageKind::Summary => {
                let mut seed = format!(
                    "{} {} [[QA:Release validation test plan|release validation]] \
                     summary. This page shows the results from all the individual \
                     result pages for this compose together. To see test \
                     instructions, visit any of the individual pages (the section \
                     titles are links). You can find download links below.\n\n",
                    self.dist,
                    self.version()
                );
                seed.push_str("__TOC__\n\n");
                seed.push_str(&format!(
                    "== Downloads ==\n{{{{{} {} Download}}}}",
                    self.dist,
                    self.version()
                ));
                for testtype in &config.tcms.testtypes {
                    let result_page =
                        Self::compose(&self.dist, &self.release, &self.milestone, &self.compose, testtype);
                    let name = result_page.name();
                    seed.push_str(&format!("\n\n== [[{name}|{testtype}]] ==\n{{{{{name}}}}}"));
                }
                seed
            }
            PageKind::Download => {
                // filled in once the compose's image list is known
                "{| class=\"wikitable sortable mw-collapsible\" width=100%\n|-\n! Image\n|-\n|}".to_string()
            }
        }
    }

    /// Edit summary used when creating the page from its seed text.
    pub fn creation_summary(&self) -> String {
        match self.kind {
            PageKind::Nightly | PageKind::Compose => format!(
                "Relval bot-created {} validation results page for {} {}",
                self.testtype,
                self.dist,
                self.version()
            ),
            PageKind::Summary => format!(
                "Relval bot-created validation results summary for {} {}",
                self.dist,
                self.version()
            ),
            PageKind::Download => format!(
                "Relval bot-created download page for {} {}",
                self.dist,
                self.version()
            ),
        }
    }

    /// The page's section list, fetched once and cached until the next
    /// successful save through this page. Missing pages and remote
    /// failures both read as "no sections".
    pub fn sections<A: WikiApi>(&mut self, api: &mut A) -> Vec<Section> {
        if self.sections.is_none() {
            self.sections = Some(api.fetch_sections(&self.name()));
        }
        self.sections.clone().unwrap_or_default()
    }

    pub fn invalidate_sections(&mut self) {
        self.sections = None;
    }

    #[cfg(test)]
    pub(crate) fn cached_sections(&self) -> Option<&[Section]> {
        self.sections.as_deref()
    }

    /// The suffix of the section list holding test results: everything
    /// from the first section whose heading carries a results marker, or
    /// failing that everything after the first Key/legend section.
    pub fn results_sections<A: WikiApi>(&mut self, api: &mut A, config: &TcmsConfig) -> Vec<Section> {
        let sections = self.sections(api);
        let mut first = None;
        for (i, section) in sections.iter().enumerate() {
            if config
                .tcms
                .results_markers
                .iter()
                .any(|marker| section.heading.contains(marker.as_str()))
            {
                first = Some(i);
                break;
            }
            if first.is_none()
                && config
                    .tcms
                    .key_markers
                    .iter()
                    .any(|marker| section.heading.contains(marker.as_str()))
            {
                first = Some(i + 1);
            }
        }
        match first {
            Some(start) if start <= sections.len() => sections[start..].to_vec(),
            _ => Vec::new(),
        }
    }

    /// All result rows on the page. Rows are rebuilt from the live page
    /// text on every call; "no results sections" reads as no rows.
    pub fn get_resultrows<A: WikiApi>(
        &mut self,
        api: &mut A,
        config: &TcmsConfig,
    ) -> TcmsResult<Vec<ResultRow>> {
        let sections = self.results_sections(api, config);
        if sections.is_empty() {
            return Ok(Vec::new());
        }
        let pagetext = api.fetch_text(&self.name())?;
        let mut rows = Vec::new();
        for (i, section) in sections.iter().enumerate() {
            let start = section.byte_offset.min(pagetext.len());
            let end = sections
                .get(i + 1)
                .map(|next| next.byte_offset)
                .unwrap_or(pagetext.len())
                .clamp(start, pagetext.len());
            let Some(slice) = pagetext.get(start..end) else {
                continue;
            };
            let sectext = strip_comments(slice);
            rows.extend(find_resultrows(&sectext, &section.heading, section.index));
        }
        Ok(rows)
    }

    /// Narrow the page's rows down to exactly one via staged matching.
    /// Short test names legitimately recur across sections and
    /// environments, so each extra criterion is applied only while it
    /// leaves at least one candidate standing; genuine ambiguity is an
    /// error, never an arbitrary pick.
    pub fn find_resultrow<A: WikiApi>(
        &mut self,
        api: &mut A,
        config: &TcmsConfig,
        criteria: &RowCriteria,
    ) -> TcmsResult<ResultRow> {
        let rows = self.get_resultrows(api, config)?;
        if rows.is_empty() {
            return Err(TcmsError::NotFound(format!(
                "page {} does not exist or has no result rows",
                self.name()
            )));
        }

        let testcase = normalize(&criteria.testcase);
        let mut rows: Vec<ResultRow> = rows
            .into_iter()
            .filter(|row| {
                normalize(&row.testcase).contains(&testcase) || normalize(&row.name).contains(&testcase)
            })
            .collect();

        if rows.len() > 1 && !criteria.section.is_empty() {
            let section = normalize(&criteria.section);
            retain_if_any(&mut rows, |row| normalize(&row.section).contains(&section));
        }
        if rows.len() > 1 && !criteria.testname.is_empty() {
            let testname = normalize(&criteria.testname);
            retain_if_any(&mut rows, |row| normalize(&row.name).contains(&testname));
        }
        if rows.len() > 1 && !criteria.env.is_empty() {
            let env = normalize(&criteria.env);
            retain_if_any(&mut rows, |row| {
                row.results.keys().any(|key| normalize(key).contains(&env))
            });
        }
        // a more precise name match - e.g. "upgrade_dnf" vs. "upgrade_dnf_encrypted"
        if rows.len() > 1 {
            let testname = normalize(&criteria.testname);
            adopt_if_single(&mut rows, |row| {
                normalize(&row.testcase) == testcase
                    || normalize(&row.name) == testcase
                    || normalize(&row.name) == testname
            });
        }
        // a more precise section match - e.g. "Release-blocking desktops"
        // vs. "Non release-blocking desktops"
        if rows.len() > 1 {
            let section = normalize(&criteria.section);
            adopt_if_single(&mut rows, |row| normalize(&row.section) == section);
        }
        if rows.len() > 1 {
            adopt_if_single(&mut rows, |row| row.section.contains(&criteria.section));
        }

        if rows.is_empty() {
            return Err(TcmsError::NotFound("specified row cannot be found".to_string()));
        }
        if rows.len() > 1 {
            return Err(TcmsError::TooManyMatches(format!(
                "{} rows match the given criteria",
                rows.len()
            )));
        }
        Ok(rows.remove(0))
    }

    /// File results into the page's tables: one fetched baseline, edits
    /// applied section-by-section from the bottom of the page upward so
    /// byte offsets stay valid, one save at the end. Returns the
    /// `(row, env, result)` submissions rejected as duplicates.
    pub fn add_results<A: WikiApi>(
        &mut self,
        api: &mut A,
        config: &TcmsConfig,
        mut results: Vec<(ResultRow, Vec<(String, TestResult)>)>,
        allow_dupe: bool,
    ) -> TcmsResult<Vec<(ResultRow, String, TestResult)>> {
        results.sort_by(|a, b| b.0.secid.cmp(&a.0.secid));
        let nonetext = TestResult::default().render();
        let mut dupes = Vec::new();
        let mut touched = Vec::new();
        let oldtext = api.fetch_text(&self.name())?;
        let mut newtext = oldtext.clone();
        let sections = self.sections(api);

        for (row, envresults) in results {
            let secoff = sections
                .iter()
                .find(|section| section.index == row.secid)
                .map(|section| section.byte_offset)
                .unwrap_or(0);
            let oldrow = row.origtext.clone();
            let mut cells: Vec<String> = oldrow.split("\n|").map(str::to_string).collect();

            for (env, result) in envresults {
                let Some(env) = resolve_env(&row, &env) else {
                    continue;
                };
                if !allow_dupe {
                    let dupe = row
                        .results
                        .get(&env)
                        .map(|existing| existing.iter().any(|res| res.user == result.user))
                        .unwrap_or(false);
                    if dupe {
                        dupes.push((row.clone(), env, result));
                        continue;
                    }
                }
                let Some(colpos) = row.columns.iter().position(|column| *column == env) else {
                    continue;
                };
                // the identity cell occupies slot 0
                let cellidx = colpos + 1;
                if cellidx >= cells.len() {
                    continue;
                }
                let restext = result.render();
                let rescell = &cells[cellidx];
                cells[cellidx] = if rescell.contains(&nonetext) {
                    rescell.replacen(&nonetext, &restext, 1)
                } else if let Some(pos) = rescell.find('\n') {
                    format!("{}{}{}", &rescell[..pos], restext, &rescell[pos..])
                } else {
                    format!("{rescell}{restext}")
                };
            }

            let newrow = cells.join("\n|");
            if newrow == oldrow {
                // every submission for this row was a dupe or unplaceable
                continue;
            }
            touched.push(row.name.clone());
            // Identical row text can occur in more than one section, so the
            // replacement is scoped to the slice starting at this row's
            // section and only the first occurrence is rewritten.
            let Some(sectext) = newtext.get(secoff.min(newtext.len())..) else {
                continue;
            };
            let replaced = sectext.replacen(&oldrow, &newrow, 1);
            newtext.truncate(secoff.min(newtext.len()));
            newtext.push_str(&replaced);
        }

        let summary = edit_summary(&touched);
        self.save(api, config, &newtext, &summary, Some(&oldtext), false)?;
        Ok(dupes)
    }

    /// Single-result convenience wrapper around `add_results`.
    pub fn add_result<A: WikiApi>(
        &mut self,
        api: &mut A,
        config: &TcmsConfig,
        row: &ResultRow,
        env: &str,
        result: TestResult,
        allow_dupe: bool,
    ) -> TcmsResult<Option<(ResultRow, String, TestResult)>> {
        let submissions = vec![(row.clone(), vec![(env.to_string(), result)])];
        let dupes = self.add_results(api, config, submissions, allow_dupe)?;
        Ok(dupes.into_iter().next())
    }

    /// Save through the shared retry protocol and drop the section cache.
    pub fn save<A: WikiApi>(
        &mut self,
        api: &mut A,
        config: &TcmsConfig,
        text: &str,
        summary: &str,
        oldtext: Option<&str>,
        create_only: bool,
    ) -> TcmsResult<SaveOutcome> {
        let outcome = save_with_retry(api, config, &self.name(), text, summary, oldtext, create_only)?;
        self.invalidate_sections();
        Ok(outcome)
    }

    /// Create the page with its seed content.
    pub fn write<A: WikiApi>(
        &mut self,
        api: &mut A,
        config: &TcmsConfig,
        create_only: bool,
    ) -> TcmsResult<SaveOutcome> {
        let seed = self.seed_text(config);
        let summary = self.creation_summary();
        self.save(api, config, &seed, &summary, None, create_only)
    }

    /// Point the Current convenience redirect for this page's flavor at
    /// this page. Download pages have no redirect.
    pub fn update_current<A: WikiApi>(&self, api: &mut A, config: &TcmsConfig) -> TcmsResult<()> {
        let short = short_dist(&self.dist);
        let spaced = if short.is_empty() {
            String::new()
        } else {
            format!(" {short}")
        };
        let redirect = match self.kind {
            PageKind::Nightly | PageKind::Compose => {
                format!("Test Results:Current{spaced} {} Test", self.testtype)
            }
            PageKind::Summary => format!("Test Results:Current{spaced} Summary"),
            PageKind::Download => return Ok(()),
        };
        save_with_retry(
            api,
            config,
            &redirect,
            &format!("#REDIRECT [[{}]]", self.name()),
            "relval: update to current event",
            None,
            false,
        )?;
        Ok(())
    }
}

/// Save a page, short-circuiting when nothing changed and retrying exactly
/// once after a fixed backoff when the precondition hits an edit conflict.
/// Every mutation in this crate goes through here, the current-event
/// pointer included.
pub(crate) fn save_with_retry<A: WikiApi>(
    api: &mut A,
    config: &TcmsConfig,
    name: &str,
    text: &str,
    summary: &str,
    oldtext: Option<&str>,
    create_only: bool,
) -> TcmsResult<SaveOutcome> {
    if let Some(old) = oldtext
        && text == old
    {
        return Ok(SaveOutcome::NoChange);
    }
    match api.save_text(name, text, summary, oldtext, create_only) {
        Err(err) if err.is_edit_conflict() => {
            sleep(Duration::from_millis(config.edit_retry_delay_ms()));
            api.save_text(name, text, summary, oldtext, create_only)
        }
        other => other,
    }
}

fn retain_if_any<F: Fn(&ResultRow) -> bool>(rows: &mut Vec<ResultRow>, keep: F) {
    let kept: Vec<ResultRow> = rows.iter().filter(|row| keep(row)).cloned().collect();
    if !kept.is_empty() {
        *rows = kept;
    }
}

fn adopt_if_single<F: Fn(&ResultRow) -> bool>(rows: &mut Vec<ResultRow>, keep: F) {
    let kept: Vec<ResultRow> = rows.iter().filter(|row| keep(row)).cloned().collect();
    if kept.len() == 1 {
        *rows = kept;
    }
}

/// Match a caller-supplied environment to one of the row's columns: exact
/// key, then the only key, then unique case-insensitive substring.
fn resolve_env(row: &ResultRow, env: &str) -> Option<String> {
    if row.results.contains_key(env) {
        return Some(env.to_string());
    }
    if row.results.len() == 1 {
        return row.results.keys().next().cloned();
    }
    let lowered = env.to_lowercase();
    let mut candidates = row
        .results
        .keys()
        .filter(|key| key.to_lowercase().contains(&lowered));
    match (candidates.next(), candidates.next()) {
        (Some(key), None) => Some(key.clone()),
        _ => None,
    }
}

fn edit_summary(touched: &[String]) -> String {
    let listed = if touched.len() > 3 {
        format!("{}...", touched[..3].join(", "))
    } else {
        touched.join(", ")
    };
    format!("Result(s) for test(s): {listed} filed via relval")
}

/// Drop wiki comments so commented-out rows and templates never match.
/// An unterminated comment is left in place, as the wiki would render it.
fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<!--") {
        out.push_str(&rest[..start]);
        match rest[start + 4..].find("-->") {
            Some(end) => rest = &rest[start + 4 + end + 3..],
            None => {
                out.push_str(&rest[start..]);
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}
