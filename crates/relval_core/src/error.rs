//! Error types shared across the result-tracking core.

use thiserror::Error;

/// Result type for core operations.
pub type TcmsResult<T> = Result<T, TcmsError>;

/// Errors surfaced by page resolution, row lookup, and page mutation.
#[derive(Debug, Error)]
pub enum TcmsError {
    /// A page, section, row, or the current-event pointer cannot be located.
    #[error("not found: {0}")]
    NotFound(String),

    /// Criteria matched more than one candidate, or supplied identifying
    /// values conflict with the current-event defaults.
    #[error("ambiguous: {0}")]
    TooManyMatches(String),

    /// The compose value is neither a nightly date nor a candidate compose.
    #[error("invalid compose: {0}")]
    InvalidCompose(String),

    /// A candidate compose was given without its milestone.
    #[error("a milestone (Alpha, Beta, Final...) is required for candidate composes")]
    MissingMilestone,

    /// The save precondition failed again after the single internal retry.
    #[error("edit conflict saving {page}")]
    EditConflict { page: String },

    /// A create-only save found the page already present.
    #[error("page already exists: {page}")]
    PageExists { page: String },

    /// Any other failure talking to the wiki. Missing pages are not
    /// transport errors: fetches report them as empty text/sections.
    #[error("wiki transport error: {0}")]
    Transport(String),
}

impl TcmsError {
    pub fn is_edit_conflict(&self) -> bool {
        matches!(self, Self::EditConflict { .. })
    }

    pub fn is_page_exists(&self) -> bool {
        matches!(self, Self::PageExists { .. })
    }
}
