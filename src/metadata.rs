//! Kind-dependent metadata attached to relationship facts.
//!
//! Collaborators send metadata as a loose JSON object. It is narrowed here,
//! at the parse boundary, into one closed record per kind family:
//! undeclared keys are dropped, a declared key holding the wrong JSON type
//! is treated as absent, and only the identity family has a mandatory field.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::graph::{KindFamily, RelationKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataError {
    #[error("{kind} metadata requires '{field}'")]
    MissingField { kind: RelationKind, field: &'static str },

    #[error("{kind} metadata field '{field}' has unsupported value '{value}'")]
    UnsupportedValue {
        kind: RelationKind,
        field: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PreferenceMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TraitMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SkillMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub years: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FearMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BeliefMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityCategory {
    Gender,
    Sexuality,
    Religion,
    Ethnicity,
    Nationality,
    Culture,
    Politics,
    Profession,
    Other,
}

impl IdentityCategory {
    const ALL: [IdentityCategory; 9] = [
        IdentityCategory::Gender,
        IdentityCategory::Sexuality,
        IdentityCategory::Religion,
        IdentityCategory::Ethnicity,
        IdentityCategory::Nationality,
        IdentityCategory::Culture,
        IdentityCategory::Politics,
        IdentityCategory::Profession,
        IdentityCategory::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityCategory::Gender => "gender",
            IdentityCategory::Sexuality => "sexuality",
            IdentityCategory::Religion => "religion",
            IdentityCategory::Ethnicity => "ethnicity",
            IdentityCategory::Nationality => "nationality",
            IdentityCategory::Culture => "culture",
            IdentityCategory::Politics => "politics",
            IdentityCategory::Profession => "profession",
            IdentityCategory::Other => "other",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentityMeta {
    pub category: IdentityCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SocialMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CaregivingMeta {
    #[serde(rename = "careType", skip_serializing_if = "Option::is_none")]
    pub care_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Metadata payload, one variant per kind family
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum RelationMetadata {
    Preference(PreferenceMeta),
    Trait(TraitMeta),
    Skill(SkillMeta),
    Fear(FearMeta),
    Belief(BeliefMeta),
    Identity(IdentityMeta),
    Social(SocialMeta),
    Caregiving(CaregivingMeta),
    Event(EventMeta),
}

/// Typed view over a loose JSON object
struct Fields<'a>(Option<&'a Map<String, Value>>);

impl<'a> Fields<'a> {
    fn string(&self, key: &str) -> Option<String> {
        match self.0?.get(key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        }
    }

    /// Like `string`, but a bare number is read as a year
    fn date(&self, key: &str) -> Option<String> {
        match self.0?.get(key)? {
            Value::Number(n) => Some(n.to_string()),
            _ => self.string(key),
        }
    }

    fn strings(&self, key: &str) -> Vec<String> {
        match self.0.and_then(|m| m.get(key)) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
            _ => Vec::new(),
        }
    }

    fn count(&self, key: &str) -> Option<u32> {
        match self.0?.get(key)? {
            Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl RelationMetadata {
    /// Narrow raw metadata into the shape declared for `kind`.
    pub fn parse(kind: RelationKind, raw: Option<&Value>) -> Result<Self, MetadataError> {
        let f = Fields(raw.and_then(Value::as_object));
        let meta = match kind.family() {
            KindFamily::Preference => RelationMetadata::Preference(PreferenceMeta {
                category: f.string("category"),
                frequency: f.string("frequency"),
                context: f.string("context"),
                since: f.date("since"),
            }),
            KindFamily::Trait => RelationMetadata::Trait(TraitMeta {
                context: f.string("context"),
                evidence: f.string("evidence"),
            }),
            KindFamily::Skill => RelationMetadata::Skill(SkillMeta {
                level: f.string("level"),
                years: f.count("years"),
                context: f.string("context"),
            }),
            KindFamily::Fear => RelationMetadata::Fear(FearMeta {
                severity: f.string("severity"),
                triggers: f.strings("triggers"),
                context: f.string("context"),
                since: f.date("since"),
            }),
            KindFamily::Belief => RelationMetadata::Belief(BeliefMeta {
                domain: f.string("domain"),
                since: f.date("since"),
            }),
            KindFamily::Identity => {
                let raw_category = f.string("category").ok_or(MetadataError::MissingField {
                    kind,
                    field: "category",
                })?;
                let category = IdentityCategory::parse(&raw_category).ok_or_else(|| {
                    MetadataError::UnsupportedValue {
                        kind,
                        field: "category",
                        value: raw_category.clone(),
                    }
                })?;
                RelationMetadata::Identity(IdentityMeta {
                    category,
                    since: f.date("since"),
                })
            }
            KindFamily::Social => RelationMetadata::Social(SocialMeta {
                role: f.string("role"),
                since: f.date("since"),
                context: f.string("context"),
            }),
            KindFamily::Caregiving => RelationMetadata::Caregiving(CaregivingMeta {
                care_type: f.string("careType"),
                level: f.string("level"),
                since: f.date("since"),
                condition: f.string("condition"),
            }),
            KindFamily::Event => RelationMetadata::Event(EventMeta {
                date: f.date("date"),
                location: f.string("location"),
                context: f.string("context"),
            }),
        };
        Ok(meta)
    }

    /// Kind family this payload was shaped for
    pub fn family(&self) -> KindFamily {
        match self {
            RelationMetadata::Preference(_) => KindFamily::Preference,
            RelationMetadata::Trait(_) => KindFamily::Trait,
            RelationMetadata::Skill(_) => KindFamily::Skill,
            RelationMetadata::Fear(_) => KindFamily::Fear,
            RelationMetadata::Belief(_) => KindFamily::Belief,
            RelationMetadata::Identity(_) => KindFamily::Identity,
            RelationMetadata::Social(_) => KindFamily::Social,
            RelationMetadata::Caregiving(_) => KindFamily::Caregiving,
            RelationMetadata::Event(_) => KindFamily::Event,
        }
    }

    pub fn fits(&self, kind: RelationKind) -> bool {
        self.family() == kind.family()
    }

    /// Field map without the variant tag, suitable for re-parsing under another kind
    pub fn to_fields(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.remove("shape");
        }
        value
    }

    /// Re-shape this payload for a different kind (used when a reviewer edits the kind)
    pub fn reshape(&self, kind: RelationKind) -> Result<Self, MetadataError> {
        if self.fits(kind) {
            return Ok(self.clone());
        }
        RelationMetadata::parse(kind, Some(&self.to_fields()))
    }
}
