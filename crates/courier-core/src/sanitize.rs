//! Free-text sanitization.
//!
//! All markup is removed; the text between tags is kept. The contents of
//! `script` and `style` elements are dropped entirely. Remaining special
//! characters come back HTML-escaped, and the result is trimmed.

use ammonia::Builder;
use std::collections::HashSet;

/// Strips markup from user-supplied text.
pub struct Sanitizer {
    builder: Builder<'static>,
}

impl Sanitizer {
    /// Create a sanitizer that allows no tags at all.
    #[must_use]
    pub fn strict() -> Self {
        let mut builder = Builder::default();
        builder
            .tags(HashSet::new())
            .clean_content_tags(HashSet::from(["script", "style"]));
        Self { builder }
    }

    /// Sanitize `input`. An empty result means nothing displayable remained.
    #[must_use]
    pub fn clean(&self, input: &str) -> String {
        self.builder.clean(input).to_string().trim().to_string()
    }
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::strict()
    }
}

impl std::fmt::Debug for Sanitizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sanitizer").finish_non_exhaustive()
    }
}
