//! In-memory wiki double shared by the unit tests. Pages live in a map,
//! saves are recorded, and the section list is re-derived from the page
//! text the way the remote structural parse would.

use std::collections::BTreeMap;

use crate::error::{TcmsError, TcmsResult};
use crate::page::Section;
use crate::wiki::{SaveOutcome, WikiApi};

#[derive(Debug, Clone)]
pub(crate) struct SaveRecord {
    pub page: String,
    pub text: String,
    pub summary: String,
    pub precondition: Option<String>,
    pub create_only: bool,
}

#[derive(Debug, Default)]
pub(crate) struct MockWiki {
    pub pages: BTreeMap<String, String>,
    pub sections: BTreeMap<String, Vec<Section>>,
    pub saves: Vec<SaveRecord>,
    /// Number of upcoming saves to fail with an edit conflict.
    pub conflicts_remaining: usize,
    /// Count of fetch calls, for asserting an operation stayed offline.
    pub reads: usize,
}

impl WikiApi for MockWiki {
    fn fetch_text(&mut self, page: &str) -> TcmsResult<String> {
        self.reads += 1;
        Ok(self.pages.get(page).cloned().unwrap_or_default())
    }

    fn fetch_sections(&mut self, page: &str) -> Vec<Section> {
        self.reads += 1;
        self.sections.get(page).cloned().unwrap_or_default()
    }

    fn save_text(
        &mut self,
        page: &str,
        text: &str,
        summary: &str,
        precondition_old_text: Option<&str>,
        create_only: bool,
    ) -> TcmsResult<SaveOutcome> {
        if self.conflicts_remaining > 0 {
            self.conflicts_remaining -= 1;
            return Err(TcmsError::EditConflict {
                page: page.to_string(),
            });
        }
        let existing = self.pages.get(page);
        if create_only && existing.is_some_and(|text| !text.is_empty()) {
            return Err(TcmsError::PageExists {
                page: page.to_string(),
            });
        }
        if let (Some(old), Some(existing)) = (precondition_old_text, existing)
            && old != existing
        {
            return Err(TcmsError::EditConflict {
                page: page.to_string(),
            });
        }
        self.saves.push(SaveRecord {
            page: page.to_string(),
            text: text.to_string(),
            summary: summary.to_string(),
            precondition: precondition_old_text.map(str::to_string),
            create_only,
        });
        self.pages.insert(page.to_string(), text.to_string());
        self.sections
            .insert(page.to_string(), sections_from_text(text));
        Ok(SaveOutcome::Saved)
    }
}

/// Seed a page and its derived section list.
pub(crate) fn page_with_text(api: &mut MockWiki, name: &str, text: &str) {
    api.pages.insert(name.to_string(), text.to_string());
    api.sections
        .insert(name.to_string(), sections_from_text(text));
}

/// Derive the structural section list from wikitext headings, the way the
/// remote parse reports them: heading text, 1-based index, byte offset of
/// the heading line.
pub(crate) fn sections_from_text(text: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut pos = 0usize;
    let mut index = 0i64;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if trimmed.len() > 4 && trimmed.starts_with("==") && trimmed.ends_with("==") {
            index += 1;
            sections.push(Section {
                heading: trimmed.trim_matches('=').trim().to_string(),
                index,
                byte_offset: pos,
            });
        }
        pos += line.len();
    }
    sections
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_are_indexed_in_page_order_with_offsets() {
        let text = "intro\n== Key ==\nlegend\n== Test Matrix ==\nrows\n";
        let sections = sections_from_text(text);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].heading, "Key");
        assert_eq!(sections[0].index, 1);
        assert_eq!(sections[0].byte_offset, 6);
        assert_eq!(sections[1].heading, "Test Matrix");
        assert_eq!(sections[1].index, 2);
        assert_eq!(&text[sections[1].byte_offset..][..5], "== Te");
    }

    #[test]
    fn create_only_save_fails_when_the_page_has_content() {
        let mut api = MockWiki::default();
        page_with_text(&mut api, "Existing", "content");
        let err = api
            .save_text("Existing", "new", "s", None, true)
            .expect_err("create-only");
        assert!(err.is_page_exists());
        assert!(api.save_text("Fresh", "new", "s", None, true).is_ok());
    }

    #[test]
    fn stale_precondition_is_an_edit_conflict() {
        let mut api = MockWiki::default();
        page_with_text(&mut api, "Page", "current");
        let err = api
            .save_text("Page", "new", "s", Some("stale"), false)
            .expect_err("conflict");
        assert!(err.is_edit_conflict());
    }
}
