use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::metadata::RelationMetadata;

/// Declares a closed string enum with its wire names.
///
/// Every value round-trips through `as_str`/`FromStr`, and parsing is
/// case-insensitive so that collaborator output like `likes` is accepted.
macro_rules! closed_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $wire:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
        pub enum $name {
            $(
                #[serde(rename = $wire)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let needle = s.trim();
                $name::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str().eq_ignore_ascii_case(needle))
                    .ok_or_else(|| s.to_string())
            }
        }
    };
}

closed_enum! {
    /// Closed set of canonical relation kinds
    RelationKind {
        Likes => "LIKES",
        Dislikes => "DISLIKES",
        Loves => "LOVES",
        Hates => "HATES",
        Prefers => "PREFERS",
        HasTrait => "HAS_TRAIT",
        HasSkill => "HAS_SKILL",
        Fears => "FEARS",
        Avoids => "AVOIDS",
        Believes => "BELIEVES",
        Values => "VALUES",
        IdentifiesAs => "IDENTIFIES_AS",
        Knows => "KNOWS",
        FriendOf => "FRIEND_OF",
        FamilyOf => "FAMILY_OF",
        PartnerOf => "PARTNER_OF",
        WorksWith => "WORKS_WITH",
        CaresFor => "CARES_FOR",
        Experienced => "EXPERIENCED",
        Plans => "PLANS",
    }
}

/// Metadata shape a relation kind accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindFamily {
    Preference,
    Trait,
    Skill,
    Fear,
    Belief,
    Identity,
    Social,
    Caregiving,
    Event,
}

impl RelationKind {
    pub fn family(&self) -> KindFamily {
        use RelationKind::*;
        match self {
            Likes | Dislikes | Loves | Hates | Prefers => KindFamily::Preference,
            HasTrait => KindFamily::Trait,
            HasSkill => KindFamily::Skill,
            Fears | Avoids => KindFamily::Fear,
            Believes | Values => KindFamily::Belief,
            IdentifiesAs => KindFamily::Identity,
            Knows | FriendOf | FamilyOf | PartnerOf | WorksWith => KindFamily::Social,
            CaresFor => KindFamily::Caregiving,
            Experienced | Plans => KindFamily::Event,
        }
    }
}

closed_enum! {
    /// Temporal status of a fact
    FactStatus {
        Current => "current",
        Past => "past",
        Future => "future",
        Aspiration => "aspiration",
    }
}

impl Default for FactStatus {
    fn default() -> Self {
        FactStatus::Current
    }
}

closed_enum! {
    Intensity {
        Weak => "weak",
        Medium => "medium",
        Strong => "strong",
        VeryStrong => "very_strong",
    }
}

closed_enum! {
    /// Provenance of a canonical fact
    FactSource {
        Manual => "manual",
        AiExtraction => "ai_extraction",
        QuestionMode => "question_mode",
        VoiceNote => "voice_note",
        Import => "import",
    }
}

closed_enum! {
    /// Review state of a staged extraction; everything but `pending` is terminal
    ReviewStatus {
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
        Edited => "edited",
    }
}

impl ReviewStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReviewStatus::Pending)
    }
}

closed_enum! {
    PersonClassification {
        Primary => "primary",
        Mentioned => "mentioned",
        Placeholder => "placeholder",
    }
}

closed_enum! {
    PersonStatus {
        Active => "active",
        Archived => "archived",
        Deceased => "deceased",
        Placeholder => "placeholder",
        Merged => "merged",
    }
}

closed_enum! {
    CompletenessLevel {
        Minimal => "minimal",
        Partial => "partial",
        Complete => "complete",
    }
}

closed_enum! {
    ImportanceLevel {
        Low => "low",
        Medium => "medium",
        High => "high",
    }
}

/// Identity record of someone the owner knows
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Person {
    pub id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    pub classification: PersonClassification,
    pub completeness: CompletenessLevel,
    pub importance: ImportanceLevel,
    pub status: PersonStatus,
    #[serde(rename = "dateOfBirth", skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<NaiveDate>,
    /// Canonical id once this record has been merged away
    #[serde(rename = "mergedInto", skip_serializing_if = "Option::is_none")]
    pub merged_into: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl Person {
    /// Merged records are inert and never offered as lookup targets
    pub fn is_lookup_target(&self) -> bool {
        self.status != PersonStatus::Merged
    }
}

/// Input for creating a person manually
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct NewPerson {
    pub name: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub classification: Option<PersonClassification>,
    #[serde(default)]
    pub importance: Option<ImportanceLevel>,
    #[serde(default, rename = "dateOfBirth")]
    pub date_of_birth: Option<NaiveDate>,
}

impl NewPerson {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }
}

/// Free-text entry written by the owner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Story {
    pub id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "storyDate", skip_serializing_if = "Option::is_none")]
    pub story_date: Option<NaiveDate>,
    pub content: String,
    #[serde(rename = "aiProcessed")]
    pub ai_processed: bool,
    /// Serialized record of the last extraction run
    #[serde(rename = "extraction", skip_serializing_if = "Option::is_none")]
    pub extraction: Option<serde_json::Value>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct NewStory {
    pub content: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, rename = "storyDate")]
    pub story_date: Option<NaiveDate>,
}

/// Relationship-fact payload shared by staged and canonical records
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactDraft {
    #[serde(rename = "subjectId")]
    pub subject_id: String,
    #[serde(rename = "relationKind")]
    pub relation_kind: RelationKind,
    #[serde(rename = "objectLabel")]
    pub object_label: String,
    #[serde(rename = "objectType", skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intensity: Option<Intensity>,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub metadata: RelationMetadata,
    #[serde(default)]
    pub status: FactStatus,
    #[serde(rename = "validFrom", skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<NaiveDate>,
    #[serde(rename = "validTo", skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<NaiveDate>,
    /// Story the draft was extracted from
    #[serde(rename = "storyId", skip_serializing_if = "Option::is_none")]
    pub story_id: Option<String>,
}

/// Canonical graph edge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelationshipFact {
    pub id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(flatten)]
    pub fact: FactDraft,
    pub source: FactSource,
    #[serde(rename = "deletedAt", skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Staged candidate fact awaiting review
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingExtraction {
    pub id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub payload: FactDraft,
    #[serde(rename = "reviewStatus")]
    pub review_status: ReviewStatus,
    #[serde(rename = "reviewReason", skip_serializing_if = "Option::is_none")]
    pub review_reason: Option<String>,
    #[serde(rename = "reviewNote", skip_serializing_if = "Option::is_none")]
    pub review_note: Option<String>,
    #[serde(rename = "reviewedAt", skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl PendingExtraction {
    pub fn confidence(&self) -> f64 {
        self.payload.confidence
    }
}

/// Caller-supplied corrections for edit-then-approve
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct FactOverrides {
    #[serde(default, rename = "relationKind")]
    pub relation_kind: Option<String>,
    #[serde(default, rename = "objectLabel")]
    pub object_label: Option<String>,
    #[serde(default)]
    pub intensity: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relation_kinds_form_a_closed_set_of_twenty() {
        assert_eq!(RelationKind::ALL.len(), 20);
        for kind in RelationKind::ALL {
            assert_eq!(kind.as_str().parse::<RelationKind>(), Ok(*kind));
        }
    }

    #[test]
    fn parsing_is_case_insensitive_but_closed() {
        assert_eq!("likes".parse::<RelationKind>(), Ok(RelationKind::Likes));
        assert_eq!(" Has_Skill ".parse::<RelationKind>(), Ok(RelationKind::HasSkill));
        assert!("ADORES".parse::<RelationKind>().is_err());
        assert!("sometimes".parse::<FactStatus>().is_err());
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!ReviewStatus::Pending.is_terminal());
        assert!(ReviewStatus::Approved.is_terminal());
        assert!(ReviewStatus::Rejected.is_terminal());
        assert!(ReviewStatus::Edited.is_terminal());
    }

    #[test]
    fn kind_families_cover_fear_and_identity() {
        assert_eq!(RelationKind::Fears.family(), KindFamily::Fear);
        assert_eq!(RelationKind::IdentifiesAs.family(), KindFamily::Identity);
        assert_eq!(RelationKind::CaresFor.family(), KindFamily::Caregiving);
    }
}
