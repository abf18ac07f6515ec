//! Candidate fact validation.
//!
//! Checks run in a fixed order: relation kind, temporal status, metadata
//! shape, then the duplicate lookup against the owner's active facts.

use anyhow::Result;
use chrono::NaiveDate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PipelineError, PipelineResult};
use crate::graph::{FactDraft, FactStatus, Intensity, RelationKind};
use crate::metadata::RelationMetadata;

/// Raw fact as produced by an extraction collaborator
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CandidateFact {
    /// Subject as it was mentioned in the story
    pub subject: String,
    /// Explicit subject id, when the collaborator already knows it
    #[serde(default, rename = "subjectId")]
    pub subject_id: Option<String>,
    #[serde(rename = "relationKind")]
    pub relation_kind: String,
    #[serde(rename = "objectLabel")]
    pub object_label: String,
    #[serde(default, rename = "objectType")]
    pub object_type: Option<String>,
    #[serde(default)]
    pub intensity: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, rename = "validFrom")]
    pub valid_from: Option<String>,
    #[serde(default, rename = "validTo")]
    pub valid_to: Option<String>,
}

impl CandidateFact {
    pub fn new(
        subject: impl Into<String>,
        relation_kind: impl Into<String>,
        object_label: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            relation_kind: relation_kind.into(),
            object_label: object_label.into(),
            ..Default::default()
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Lookup of active (non-deleted) canonical facts
pub trait FactIndex {
    /// Id of an active fact with exactly this subject, kind and label
    fn find_active_fact(
        &self,
        user_id: &str,
        subject_id: &str,
        kind: RelationKind,
        object_label: &str,
    ) -> Result<Option<String>>;
}

pub fn parse_kind(raw: &str) -> PipelineResult<RelationKind> {
    raw.parse()
        .map_err(|_| PipelineError::InvalidRelationKind(raw.to_string()))
}

pub fn parse_status(raw: Option<&str>) -> PipelineResult<FactStatus> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(FactStatus::default()),
        Some(s) => s
            .parse()
            .map_err(|_| PipelineError::InvalidStatus(s.to_string())),
    }
}

fn lenient_date(raw: Option<&str>) -> Option<NaiveDate> {
    raw.and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
}

fn non_empty(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn normalize_confidence(raw: Option<f64>, default: f64) -> f64 {
    match raw {
        Some(c) if c.is_finite() => c.clamp(0.0, 1.0),
        _ => default.clamp(0.0, 1.0),
    }
}

/// Steps 1-3: shape a raw candidate into a draft bound to `subject_id`.
pub fn validate_candidate(
    candidate: &CandidateFact,
    subject_id: &str,
    story_id: Option<&str>,
    default_confidence: f64,
) -> PipelineResult<FactDraft> {
    let relation_kind = parse_kind(&candidate.relation_kind)?;
    let status = parse_status(candidate.status.as_deref())?;
    let metadata = RelationMetadata::parse(relation_kind, candidate.metadata.as_ref())?;

    let object_label = candidate.object_label.trim();
    if object_label.is_empty() {
        return Err(PipelineError::EmptyObjectLabel);
    }

    Ok(FactDraft {
        subject_id: subject_id.to_string(),
        relation_kind,
        object_label: object_label.to_string(),
        object_type: non_empty(candidate.object_type.as_deref()),
        intensity: candidate
            .intensity
            .as_deref()
            .and_then(|s| s.parse::<Intensity>().ok()),
        confidence: normalize_confidence(candidate.confidence, default_confidence),
        category: non_empty(candidate.category.as_deref()),
        metadata,
        status,
        valid_from: lenient_date(candidate.valid_from.as_deref()),
        valid_to: lenient_date(candidate.valid_to.as_deref()),
        story_id: story_id.map(str::to_string),
    })
}

/// Re-check a staged draft before commit; staged JSON may be stale or hand-edited.
///
/// Metadata shaped for another kind is re-shaped for the draft's kind.
pub fn revalidate(mut draft: FactDraft) -> PipelineResult<FactDraft> {
    let label = draft.object_label.trim();
    if label.is_empty() {
        return Err(PipelineError::EmptyObjectLabel);
    }
    draft.object_label = label.to_string();
    draft.metadata = draft.metadata.reshape(draft.relation_kind)?;
    draft.confidence = normalize_confidence(Some(draft.confidence), 0.5);
    Ok(draft)
}

/// Step 4: exact-match duplicate lookup
pub fn check_duplicate<I: FactIndex + ?Sized>(
    index: &I,
    user_id: &str,
    draft: &FactDraft,
) -> PipelineResult<()> {
    match index.find_active_fact(
        user_id,
        &draft.subject_id,
        draft.relation_kind,
        &draft.object_label,
    )? {
        Some(existing_id) => Err(PipelineError::DuplicateFact { existing_id }),
        None => Ok(()),
    }
}

/// Full validation: shape checks, then duplicate lookup
pub fn validate<I: FactIndex + ?Sized>(
    index: &I,
    user_id: &str,
    candidate: &CandidateFact,
    subject_id: &str,
    story_id: Option<&str>,
    default_confidence: f64,
) -> PipelineResult<FactDraft> {
    let draft = validate_candidate(candidate, subject_id, story_id, default_confidence)?;
    check_duplicate(index, user_id, &draft)?;
    Ok(draft)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Existing(Vec<(&'static str, RelationKind, &'static str)>);

    impl FactIndex for Existing {
        fn find_active_fact(
            &self,
            _user_id: &str,
            subject_id: &str,
            kind: RelationKind,
            object_label: &str,
        ) -> Result<Option<String>> {
            Ok(self
                .0
                .iter()
                .position(|(s, k, l)| *s == subject_id && *k == kind && *l == object_label)
                .map(|i| format!("fact-{}", i)))
        }
    }

    #[test]
    fn unknown_kind_is_rejected_first() {
        let candidate = CandidateFact::new("Sarah", "ADORES", "sushi").with_status("someday");
        let err = validate_candidate(&candidate, "p1", None, 0.5).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRelationKind(k) if k == "ADORES"));
    }

    #[test]
    fn unknown_status_is_rejected() {
        let candidate = CandidateFact::new("Sarah", "LIKES", "sushi").with_status("someday");
        let err = validate_candidate(&candidate, "p1", None, 0.5).unwrap_err();
        assert!(matches!(&err, PipelineError::InvalidStatus(s) if s == "someday"));
        assert!(err.is_actionable());
    }

    #[test]
    fn missing_status_defaults_to_current() {
        let draft =
            validate_candidate(&CandidateFact::new("Sarah", "likes", " sushi "), "p1", None, 0.5)
                .unwrap();
        assert_eq!(draft.status, FactStatus::Current);
        assert_eq!(draft.relation_kind, RelationKind::Likes);
        assert_eq!(draft.object_label, "sushi");
        assert_eq!(draft.confidence, 0.5);
    }

    #[test]
    fn identity_without_category_fails_metadata_step() {
        let candidate = CandidateFact::new("Sarah", "IDENTIFIES_AS", "Buddhist");
        let err = validate_candidate(&candidate, "p1", None, 0.5).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidMetadata(_)));

        let ok = candidate.with_metadata(json!({"category": "religion"}));
        assert!(validate_candidate(&ok, "p1", None, 0.5).is_ok());
    }

    #[test]
    fn soft_fields_are_coerced_not_rejected() {
        let mut candidate = CandidateFact::new("Sarah", "FEARS", "heights").with_confidence(7.0);
        candidate.intensity = Some("enormous".into());
        candidate.valid_from = Some("last summer".into());
        candidate.valid_to = Some("2024-05-01".into());
        let draft = validate_candidate(&candidate, "p1", Some("s1"), 0.5).unwrap();
        assert_eq!(draft.intensity, None);
        assert_eq!(draft.confidence, 1.0);
        assert_eq!(draft.valid_from, None);
        assert_eq!(draft.valid_to, NaiveDate::from_ymd_opt(2024, 5, 1));
        assert_eq!(draft.story_id.as_deref(), Some("s1"));
    }

    #[test]
    fn blank_object_label_is_rejected() {
        let candidate = CandidateFact::new("Sarah", "LIKES", "   ");
        assert!(matches!(
            validate_candidate(&candidate, "p1", None, 0.5),
            Err(PipelineError::EmptyObjectLabel)
        ));
    }

    #[test]
    fn exact_duplicate_is_flagged() {
        let index = Existing(vec![("p1", RelationKind::Likes, "sushi")]);
        let dup = CandidateFact::new("Sarah", "LIKES", "sushi");
        let err = validate(&index, "u1", &dup, "p1", None, 0.5).unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateFact { existing_id } if existing_id == "fact-0"));

        // Exact-match semantics: different label case is a different fact
        let other = CandidateFact::new("Sarah", "LIKES", "Sushi");
        assert!(validate(&index, "u1", &other, "p1", None, 0.5).is_ok());
    }

    #[test]
    fn revalidate_reshapes_mismatched_metadata() {
        let mut draft = validate_candidate(
            &CandidateFact::new("Sarah", "HAS_SKILL", "chess")
                .with_metadata(json!({"level": "expert", "context": "club"})),
            "p1",
            None,
            0.5,
        )
        .unwrap();
        draft.relation_kind = RelationKind::Likes;
        let fixed = revalidate(draft).unwrap();
        assert!(fixed.metadata.fits(RelationKind::Likes));

        let mut blank = fixed.clone();
        blank.object_label = "  ".into();
        assert!(matches!(revalidate(blank), Err(PipelineError::EmptyObjectLabel)));
    }
}
