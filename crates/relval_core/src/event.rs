//! Validation events: the grouping of every page sharing one
//! `(dist, release, milestone, compose)` identity, plus the event-level
//! operations of creating the page set and repointing the current-event
//! pointer.

use crate::config::TcmsConfig;
use crate::error::{TcmsError, TcmsResult};
use crate::helpers::triplet_sort;
use crate::page::{Page, PageKind, save_with_retry};
use crate::wiki::WikiApi;

/// The two event flavors, matching the compose classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Nightly,
    Compose,
}

/// One release validation event. Construction is pure; everything that
/// talks to the wiki takes the API collaborator explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationEvent {
    pub kind: EventKind,
    pub dist: String,
    pub release: String,
    pub milestone: String,
    pub compose: String,
}

/// Knobs for `ValidationEvent::create`.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Restrict creation to these test types; empty means all configured.
    pub testtypes: Vec<String>,
    /// Recreate pages that already exist, destroying their results.
    pub force: bool,
    /// Repoint the current-event pointer and Current redirects.
    pub current: bool,
    /// Bail before writing anything if any result page already exists.
    pub check: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            testtypes: Vec::new(),
            force: false,
            current: true,
            check: false,
        }
    }
}

/// The distinguished page holding the current-event pointer for a dist.
pub(crate) fn current_pointer_name(dist: &str) -> String {
    format!("Template:Current{dist}Compose")
}

impl ValidationEvent {
    pub fn nightly(dist: &str, release: &str, milestone: &str, compose: &str) -> Self {
        Self {
            kind: EventKind::Nightly,
            dist: dist.to_string(),
            release: release.to_string(),
            milestone: milestone.to_string(),
            compose: compose.to_string(),
        }
    }

    pub fn compose(dist: &str, release: &str, milestone: &str, compose: &str) -> Self {
        Self {
            kind: EventKind::Compose,
            dist: dist.to_string(),
            release: release.to_string(),
            milestone: milestone.to_string(),
            compose: compose.to_string(),
        }
    }

    /// The event for the identity a page carries.
    pub fn from_page(page: &Page) -> Self {
        let kind = match page.kind {
            PageKind::Nightly => EventKind::Nightly,
            _ => EventKind::Compose,
        };
        Self {
            kind,
            dist: page.dist.clone(),
            release: page.release.clone(),
            milestone: page.milestone.clone(),
            compose: page.compose.clone(),
        }
    }

    /// The "release milestone compose" token shared by every page name.
    pub fn version(&self) -> String {
        format!("{} {} {}", self.release, self.milestone, self.compose)
    }

    /// Short version string: milestone events are usually referred to by
    /// "milestone compose", nightlies just by their date identifier.
    pub fn shortver(&self) -> String {
        match self.kind {
            EventKind::Nightly => self.compose.clone(),
            EventKind::Compose => format!("{} {}", self.milestone, self.compose),
        }
    }

    /// Deterministic ordering key across events of one dist.
    pub fn sort_tuple(&self) -> (u32, u32, String) {
        triplet_sort(&self.release, &self.milestone, &self.compose)
    }

    /// One result page per configured test type, in configured order.
    pub fn result_pages(&self, config: &TcmsConfig) -> Vec<Page> {
        config
            .tcms
            .testtypes
            .iter()
            .map(|testtype| match self.kind {
                EventKind::Nightly => Page::nightly(
                    &self.dist,
                    &self.release,
                    &self.milestone,
                    &self.compose,
                    testtype,
                ),
                EventKind::Compose => Page::compose(
                    &self.dist,
                    &self.release,
                    &self.milestone,
                    &self.compose,
                    testtype,
                ),
            })
            .collect()
    }

    pub fn summary_page(&self) -> Page {
        Page::summary(&self.dist, &self.release, &self.milestone, &self.compose)
    }

    pub fn download_page(&self) -> Page {
        Page::download(&self.dist, &self.release, &self.milestone, &self.compose)
    }

    /// The switch body stored in the current-event pointer template.
    /// Compose events leave `date` empty, nightly events leave `compose`
    /// empty; the reader takes whichever is set.
    pub fn current_content(&self) -> String {
        match self.kind {
            EventKind::Compose => format!(
                "| full = {}\n| release = {}\n| milestone = {}\n| compose = {}\n| date =\n",
                self.version(),
                self.release,
                self.milestone,
                self.compose
            ),
            EventKind::Nightly => format!(
                "| full = {}\n| release = {}\n| milestone = {}\n| compose =\n| date = {}\n",
                self.version(),
                self.release,
                self.milestone,
                self.compose
            ),
        }
    }

    /// Make the current-event pointer for this dist name this event. Goes
    /// through the ordinary save protocol; the pointer is just a page.
    pub fn update_current<A: WikiApi>(&self, api: &mut A, config: &TcmsConfig) -> TcmsResult<()> {
        let mut content = "{{tempdoc}}\n<onlyinclude>{{#switch: {{{1|full}}}\n".to_string();
        content.push_str(&self.current_content());
        content.push_str("}}</onlyinclude>\n[[Category: Fedora Templates]]");
        save_with_retry(
            api,
            config,
            &current_pointer_name(&self.dist),
            &content,
            "relval: update to current event",
            None,
            false,
        )?;
        Ok(())
    }

    /// Create the event: its result pages, summary page and download page
    /// from their seed texts, then the Current redirects and the pointer.
    /// Pages that already exist are left alone unless `force` is set, so
    /// a partially created event can be finished by running create again.
    pub fn create<A: WikiApi>(
        &self,
        api: &mut A,
        config: &TcmsConfig,
        opts: &CreateOptions,
    ) -> TcmsResult<()> {
        let mut pages = self.result_pages(config);
        if !opts.testtypes.is_empty() {
            pages.retain(|page| opts.testtypes.iter().any(|wanted| *wanted == page.testtype));
        }
        if pages.is_empty() {
            return Err(TcmsError::NotFound(
                "no result pages to create; unknown test type?".to_string(),
            ));
        }
        if opts.check {
            for page in &pages {
                if !api.fetch_text(&page.name())?.is_empty() {
                    return Err(TcmsError::PageExists { page: page.name() });
                }
            }
        }
        pages.push(self.summary_page());
        pages.push(self.download_page());

        for page in &mut pages {
            match page.write(api, config, !opts.force) {
                Ok(_) => {}
                Err(err) if err.is_page_exists() => {}
                Err(err) => return Err(err),
            }
            if opts.current {
                page.update_current(api, config)?;
            }
        }
        if opts.current {
            self.update_current(api, config)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockWiki, page_with_text};
    use crate::wiki::get_current_compose;

    fn config() -> TcmsConfig {
        let mut config = TcmsConfig::default();
        config.tcms.testtypes = vec!["Installation".to_string(), "Base".to_string()];
        config.wiki.edit_retry_delay_ms = Some(0);
        config
    }

    #[test]
    fn versions_and_sort_order() {
        let beta = ValidationEvent::compose("Fedora", "32", "Beta", "RC3");
        assert_eq!(beta.version(), "32 Beta RC3");
        assert_eq!(beta.shortver(), "Beta RC3");

        let nightly = ValidationEvent::nightly("Fedora", "32", "Rawhide", "20200322.n.0");
        assert_eq!(nightly.shortver(), "20200322.n.0");
        assert!(nightly.sort_tuple() < beta.sort_tuple());
    }

    #[test]
    fn from_page_recovers_the_event_identity() {
        let page = Page::nightly("Fedora-IoT", "33", "Branched", "20200612.n.0", "Base");
        let event = ValidationEvent::from_page(&page);
        assert_eq!(event.kind, EventKind::Nightly);
        assert_eq!(
            event,
            ValidationEvent::nightly("Fedora-IoT", "33", "Branched", "20200612.n.0")
        );
    }

    #[test]
    fn result_pages_follow_the_configured_testtypes() {
        let event = ValidationEvent::compose("Fedora", "32", "Beta", "RC3");
        let pages = event.result_pages(&config());
        let names: Vec<String> = pages.iter().map(Page::name).collect();
        assert_eq!(
            names,
            vec![
                "Test Results:Fedora 32 Beta RC3 Installation",
                "Test Results:Fedora 32 Beta RC3 Base"
            ]
        );
        assert_eq!(
            event.summary_page().name(),
            "Test Results:Fedora 32 Beta RC3 Summary"
        );
        assert_eq!(
            event.download_page().name(),
            "Template:Fedora 32 Beta RC3 Download"
        );
    }

    #[test]
    fn pointer_content_round_trips_through_the_reader() {
        let mut api = MockWiki::default();
        let config = config();

        let event = ValidationEvent::compose("Fedora", "24", "Alpha", "1.1");
        event.update_current(&mut api, &config).expect("pointer");
        let curr = get_current_compose(&mut api, &config, "Fedora").expect("read pointer");
        assert_eq!(curr["full"], "24 Alpha 1.1");
        assert_eq!(curr["release"], "24");
        assert_eq!(curr["milestone"], "Alpha");
        assert_eq!(curr["compose"], "1.1");
        assert_eq!(curr["date"], "");

        let nightly = ValidationEvent::nightly("Fedora", "25", "Rawhide", "20160922.n.0");
        nightly.update_current(&mut api, &config).expect("pointer");
        let curr = get_current_compose(&mut api, &config, "Fedora").expect("read pointer");
        assert_eq!(curr["compose"], "");
        assert_eq!(curr["date"], "20160922.n.0");
    }

    #[test]
    fn create_writes_seed_pages_and_repoints_current() {
        let mut api = MockWiki::default();
        let config = config();
        let event = ValidationEvent::compose("Fedora", "32", "Beta", "RC3");

        event
            .create(&mut api, &config, &CreateOptions::default())
            .expect("create");

        let install = &api.pages["Test Results:Fedora 32 Beta RC3 Installation"];
        assert!(install.contains("{{subst:Validation results|testtype=Installation"));
        assert!(api.pages.contains_key("Test Results:Fedora 32 Beta RC3 Summary"));
        assert!(api.pages.contains_key("Template:Fedora 32 Beta RC3 Download"));
        assert_eq!(
            api.pages["Test Results:Current Installation Test"],
            "#REDIRECT [[Test Results:Fedora 32 Beta RC3 Installation]]"
        );
        assert!(
            api.pages["Template:CurrentFedoraCompose"].contains("| full = 32 Beta RC3")
        );
        assert!(
            api.saves
                .iter()
                .filter(|save| save.page.starts_with("Test Results:Fedora"))
                .all(|save| save.create_only)
        );
    }

    #[test]
    fn create_tolerates_existing_pages_without_force() {
        let mut api = MockWiki::default();
        let config = config();
        let event = ValidationEvent::compose("Fedora", "32", "Beta", "RC3");
        page_with_text(
            &mut api,
            "Test Results:Fedora 32 Beta RC3 Installation",
            "results already filed",
        );

        event
            .create(&mut api, &config, &CreateOptions::default())
            .expect("create");
        assert_eq!(
            api.pages["Test Results:Fedora 32 Beta RC3 Installation"],
            "results already filed"
        );
        assert!(api.pages.contains_key("Test Results:Fedora 32 Beta RC3 Base"));
    }

    #[test]
    fn create_with_check_bails_before_writing() {
        let mut api = MockWiki::default();
        let config = config();
        let event = ValidationEvent::compose("Fedora", "32", "Beta", "RC3");
        page_with_text(
            &mut api,
            "Test Results:Fedora 32 Beta RC3 Base",
            "results already filed",
        );

        let err = event
            .create(
                &mut api,
                &config,
                &CreateOptions {
                    check: true,
                    ..CreateOptions::default()
                },
            )
            .expect_err("check bails");
        assert!(err.is_page_exists());
        assert!(api.saves.is_empty());
    }

    #[test]
    fn create_restricted_to_unknown_testtype_fails() {
        let mut api = MockWiki::default();
        let event = ValidationEvent::compose("Fedora", "32", "Beta", "RC3");
        let err = event
            .create(
                &mut api,
                &config(),
                &CreateOptions {
                    testtypes: vec!["Nonexistent".to_string()],
                    ..CreateOptions::default()
                },
            )
            .expect_err("unknown testtype");
        assert!(matches!(err, TcmsError::NotFound(_)));
    }
}
