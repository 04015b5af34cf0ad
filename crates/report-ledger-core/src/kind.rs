use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Content, HistoryError};

/// The fixed set of report-scoped record kinds that carry change history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    GenomicAlterationIdentified,
    TherapeuticEvent,
    DetailedAlteration,
    AnalystComment,
    TumourAnalysis,
    KbMatch,
}

impl EntityKind {
    pub const ALL: [Self; 6] = [
        Self::GenomicAlterationIdentified,
        Self::TherapeuticEvent,
        Self::DetailedAlteration,
        Self::AnalystComment,
        Self::TumourAnalysis,
        Self::KbMatch,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GenomicAlterationIdentified => "genomic_alteration_identified",
            Self::TherapeuticEvent => "therapeutic_event",
            Self::DetailedAlteration => "detailed_alteration",
            Self::AnalystComment => "analyst_comment",
            Self::TumourAnalysis => "tumour_analysis",
            Self::KbMatch => "kb_match",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "genomic_alteration_identified" => Some(Self::GenomicAlterationIdentified),
            "therapeutic_event" => Some(Self::TherapeuticEvent),
            "detailed_alteration" => Some(Self::DetailedAlteration),
            "analyst_comment" => Some(Self::AnalystComment),
            "tumour_analysis" => Some(Self::TumourAnalysis),
            "kb_match" => Some(Self::KbMatch),
            _ => None,
        }
    }

    /// Physical table holding every data version of this kind.
    #[must_use]
    pub fn table_name(self) -> &'static str {
        match self {
            Self::GenomicAlterationIdentified => "reports_summary_genomic_alterations_identified",
            Self::TherapeuticEvent => "reports_summary_genomic_events_therapeutic",
            Self::DetailedAlteration => "reports_detailed_alterations",
            Self::AnalystComment => "reports_summary_analyst_comments",
            Self::TumourAnalysis => "reports_summary_tumour_analysis",
            Self::KbMatch => "reports_kb_matches",
        }
    }

    /// Content field holding the free-text label shown to reviewers, if any.
    #[must_use]
    pub fn label_field(self) -> Option<&'static str> {
        match self {
            Self::GenomicAlterationIdentified => Some("geneVariant"),
            Self::TherapeuticEvent => Some("genomicEvent"),
            Self::DetailedAlteration
            | Self::AnalystComment
            | Self::TumourAnalysis
            | Self::KbMatch => None,
        }
    }

    #[must_use]
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            Self::GenomicAlterationIdentified => &["geneVariant"],
            Self::TherapeuticEvent => &["genomicEvent"],
            Self::DetailedAlteration => &["gene", "variant"],
            Self::AnalystComment => &["comments"],
            Self::TumourAnalysis => &["tumourContent"],
            Self::KbMatch => &["category", "variantType", "variantId"],
        }
    }

    /// Check that `content` carries every field this kind requires.
    ///
    /// # Errors
    /// Returns [`HistoryError::Validation`] for missing or blank required fields, and for
    /// KB matches whose variant reference does not resolve to a known variant kind.
    pub fn validate_content(self, content: &Content) -> Result<(), HistoryError> {
        for field in self.required_fields() {
            let present = match content.get(*field) {
                None | Some(Value::Null) => false,
                Some(Value::String(text)) => !text.trim().is_empty(),
                Some(_) => true,
            };
            if !present {
                return Err(HistoryError::validation(format!(
                    "{} content MUST include `{field}`",
                    self.as_str()
                )));
            }
        }

        for reserved in RESERVED_COLUMNS {
            if content.contains_key(*reserved) {
                return Err(HistoryError::validation(format!(
                    "`{reserved}` is managed by storage and cannot be set as content"
                )));
            }
        }

        if self == Self::KbMatch {
            VariantRef::from_content(content)?;
        }

        Ok(())
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row columns owned by storage rather than by entity content.
pub const RESERVED_COLUMNS: &[&str] =
    &["id", "ident", "report_id", "data_version", "created_at", "updated_at", "deleted_at"];

/// Reference from a KB match to the one variant table it annotates.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(tag = "variant_type", content = "variant_id", rename_all = "snake_case")]
pub enum VariantRef {
    CopyVariant(String),
    SmallMutation(String),
    StructuralVariant(String),
    ExpressionVariant(String),
    ProteinVariant(String),
}

impl VariantRef {
    /// Resolve the `variantType`/`variantId` pair stored on a KB match.
    ///
    /// # Errors
    /// Returns [`HistoryError::Validation`] when either field is missing or the type is unknown.
    pub fn from_content(content: &Content) -> Result<Self, HistoryError> {
        let variant_type = content
            .get("variantType")
            .and_then(Value::as_str)
            .ok_or_else(|| HistoryError::validation("variantType MUST be a string"))?;
        let variant_id = content
            .get("variantId")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| HistoryError::validation("variantId MUST be a non-empty string"))?
            .to_string();

        match variant_type {
            "cnv" => Ok(Self::CopyVariant(variant_id)),
            "mut" => Ok(Self::SmallMutation(variant_id)),
            "sv" => Ok(Self::StructuralVariant(variant_id)),
            "exp" => Ok(Self::ExpressionVariant(variant_id)),
            "protein" => Ok(Self::ProteinVariant(variant_id)),
            other => Err(HistoryError::validation(format!("unknown variantType `{other}`"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn content(value: Value) -> Content {
        match value {
            Value::Object(map) => map,
            other => panic!("fixture must be an object, got {other}"),
        }
    }

    #[test]
    fn every_kind_round_trips_through_its_name() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn table_names_are_distinct() {
        let mut tables = EntityKind::ALL.iter().map(|kind| kind.table_name()).collect::<Vec<_>>();
        tables.sort_unstable();
        tables.dedup();
        assert_eq!(tables.len(), EntityKind::ALL.len());
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let err =
            EntityKind::DetailedAlteration.validate_content(&content(json!({"gene": "TP53"})));
        assert!(matches!(err, Err(HistoryError::Validation(_))));
    }

    #[test]
    fn reserved_columns_cannot_be_smuggled_into_content() {
        let err = EntityKind::AnalystComment
            .validate_content(&content(json!({"comments": "ok", "data_version": 9})));
        assert!(matches!(err, Err(HistoryError::Validation(_))));
    }

    #[test]
    fn kb_match_requires_known_variant_type() -> Result<(), HistoryError> {
        let valid = content(json!({
            "category": "therapeutic",
            "variantType": "sv",
            "variantId": "sv-101"
        }));
        EntityKind::KbMatch.validate_content(&valid)?;
        let variant = VariantRef::from_content(&valid)?;
        assert_eq!(variant, VariantRef::StructuralVariant("sv-101".to_string()));

        let invalid = content(json!({
            "category": "therapeutic",
            "variantType": "msi",
            "variantId": "x"
        }));
        assert!(EntityKind::KbMatch.validate_content(&invalid).is_err());
        Ok(())
    }
}
