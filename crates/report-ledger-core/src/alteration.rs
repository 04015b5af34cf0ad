use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Content, EntityKind};

/// Structured gene/variant key shared by genomic alterations and their dependents.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AlterationKey {
    pub gene: String,
    pub variant: String,
}

impl AlterationKey {
    /// Parse a `"<gene> (<variant>)"` label.
    ///
    /// The gene is everything before the first whitespace run; the variant is the rest with
    /// parentheses removed and inner whitespace collapsed.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        let trimmed = label.trim();
        let split_at = trimmed.find(char::is_whitespace)?;
        let (gene, rest) = trimmed.split_at(split_at);
        let variant = rest
            .replace(['(', ')'], " ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");

        if gene.is_empty() || variant.is_empty() {
            return None;
        }

        Some(Self { gene: gene.to_string(), variant })
    }

    /// Key from explicit `gene`/`variant` content fields only.
    #[must_use]
    pub fn from_fields(content: &Content) -> Option<Self> {
        match (text_field(content, "gene"), text_field(content, "variant")) {
            (Some(gene), Some(variant)) => {
                Some(Self { gene: gene.to_string(), variant: variant.to_string() })
            }
            _ => None,
        }
    }

    /// Derive the key for a stored record.
    ///
    /// Explicit `gene`/`variant` content fields win; the kind's label field is the fallback.
    #[must_use]
    pub fn from_content(kind: EntityKind, content: &Content) -> Option<Self> {
        Self::from_fields(content).or_else(|| {
            kind.label_field()
                .and_then(|field| text_field(content, field))
                .and_then(Self::from_label)
        })
    }

    #[must_use]
    pub fn label(&self) -> String {
        format!("{} ({})", self.gene, self.variant)
    }
}

fn text_field<'a>(content: &'a Content, name: &str) -> Option<&'a str> {
    content.get(name).and_then(Value::as_str).map(str::trim).filter(|v| !v.is_empty())
}

impl Display for AlterationKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.gene, self.variant)
    }
}
