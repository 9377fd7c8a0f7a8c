//! Wire code ↔ label tables for enumerated vendor attributes.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum CodeMapError {
    #[error("code {0} appears more than once")]
    DuplicateCode(u64),
    #[error("label {0:?} appears more than once")]
    DuplicateLabel(String),
}

/// Fixed, ordered, injective mapping from wire codes to labels.
#[derive(Debug, Clone)]
pub struct CodeMap {
    entries: Vec<(u64, String)>,
    by_label: HashMap<String, u64>,
}

impl CodeMap {
    pub fn new<'a>(pairs: impl IntoIterator<Item = (u64, &'a str)>) -> Result<Self, CodeMapError> {
        let mut entries: Vec<(u64, String)> = Vec::new();
        let mut by_label = HashMap::new();

        for (code, label) in pairs {
            if entries.iter().any(|(c, _)| *c == code) {
                return Err(CodeMapError::DuplicateCode(code));
            }
            if by_label.insert(label.to_string(), code).is_some() {
                return Err(CodeMapError::DuplicateLabel(label.to_string()));
            }
            entries.push((code, label.to_string()));
        }

        Ok(Self { entries, by_label })
    }

    pub fn label(&self, code: u64) -> Option<&str> {
        self.entries
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, label)| label.as_str())
    }

    pub fn code(&self, label: &str) -> Option<u64> {
        self.by_label.get(label).copied()
    }

    /// Labels in table order.
    pub fn options(&self) -> Vec<String> {
        self.entries.iter().map(|(_, label)| label.clone()).collect()
    }
}
