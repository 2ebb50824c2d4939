//! Error-page table: maps error types and status codes to context-relative paths.

use std::collections::HashMap;

/// One error-page declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPage {
    selector: Selector,
    location: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Selector {
    Status(u16),
    Kind(String),
    Default,
}

impl ErrorPage {
    /// Page for responses ending with status `code`.
    pub fn status(code: u16, location: impl Into<String>) -> Self {
        Self {
            selector: Selector::Status(code),
            location: location.into(),
        }
    }

    /// Page for failures raised with [`ServletError::failure`](crate::servlet::ServletError::failure)
    /// wrapping an `E`.
    pub fn for_type<E: 'static>(location: impl Into<String>) -> Self {
        Self::tagged(std::any::type_name::<E>(), location)
    }

    /// Page for failures carrying an explicit type tag.
    pub fn tagged(kind: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            selector: Selector::Kind(kind.into()),
            location: location.into(),
        }
    }

    /// Page used when nothing more specific matches.
    pub fn default_page(location: impl Into<String>) -> Self {
        Self {
            selector: Selector::Default,
            location: location.into(),
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }
}

/// Lookup table built from an application's [`ErrorPage`]s.
#[derive(Debug, Clone, Default)]
pub struct ErrorPages {
    by_status: HashMap<u16, String>,
    by_kind: HashMap<String, String>,
    default: Option<String>,
}

impl ErrorPages {
    /// Adds a declaration; a later declaration for the same selector replaces the earlier one.
    pub fn insert(&mut self, page: ErrorPage) {
        match page.selector {
            Selector::Status(code) => {
                self.by_status.insert(code, page.location);
            }
            Selector::Kind(kind) => {
                self.by_kind.insert(kind, page.location);
            }
            Selector::Default => self.default = Some(page.location),
        }
    }

    /// Finds the page for a failure: error type first, then status code, then the default.
    pub fn find(&self, kind: Option<&str>, status: u16) -> Option<&str> {
        kind.and_then(|k| self.by_kind.get(k))
            .or_else(|| self.by_status.get(&status))
            .or(self.default.as_ref())
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.by_status.is_empty() && self.by_kind.is_empty() && self.default.is_none()
    }
}
