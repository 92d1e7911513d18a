//! Owner-path capture filters
//!
//! A capture whose owner path matches a filter is dropped before ingestion and
//! counted on that filter. Patterns are globs matched case-insensitively with
//! `\` normalised to `/`; a pattern that fails to compile only matches exactly.

use globset::{GlobBuilder, GlobMatcher};
use tracing::{debug, warn};

use crate::config::OwnerFilter;

fn normalize(path: &str) -> String {
    path.replace('\\', "/")
}

fn compile(pattern: &str) -> Option<GlobMatcher> {
    match GlobBuilder::new(&normalize(pattern))
        .case_insensitive(true)
        .literal_separator(false)
        .build()
    {
        Ok(glob) => Some(glob.compile_matcher()),
        Err(e) => {
            warn!(pattern, error = %e, "ignoring malformed owner filter pattern");
            None
        }
    }
}

pub struct OwnerFilters {
    filters: Vec<OwnerFilter>,
    matchers: Vec<Option<GlobMatcher>>,
}

impl OwnerFilters {
    pub fn new(filters: Vec<OwnerFilter>) -> Self {
        let matchers = filters.iter().map(|f| compile(&f.pattern)).collect();
        Self { filters, matchers }
    }

    pub fn filters(&self) -> &[OwnerFilter] {
        &self.filters
    }

    /// Find the filter rejecting `owner_path` and bump its counter.
    pub fn check(&mut self, owner_path: &str) -> Option<&OwnerFilter> {
        if owner_path.is_empty() {
            return None;
        }
        let path = normalize(owner_path);
        let index = self.filters.iter().zip(&self.matchers).position(|(filter, matcher)| {
            normalize(&filter.pattern).eq_ignore_ascii_case(&path)
                || matcher.as_ref().is_some_and(|m| m.is_match(&path))
        })?;

        let filter = &mut self.filters[index];
        filter.filtered_count += 1;
        debug!(filter = %filter.name, owner = owner_path, "capture filtered");
        Some(filter)
    }
}
