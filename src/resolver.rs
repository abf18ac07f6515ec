//! Name-token to person resolution.
//!
//! Matching is case-insensitive substring matching over display name and
//! nickname. Nothing here touches the store; callers pass the owner's roster.

use serde::Serialize;

use crate::graph::Person;
use crate::mentions::{self, LiveMention, Mention};

/// Cap on candidates returned to suggestion lists
pub const DEFAULT_SUGGESTION_LIMIT: usize = 5;

/// Outcome of resolving one name token
#[derive(Debug, Clone, PartialEq)]
pub enum Classification<'a> {
    /// No candidate; eligible for create-new
    Unknown,
    /// Exactly one candidate and its name equals the token
    Unambiguous(&'a Person),
    /// Several candidates, or a single partial match
    Ambiguous(Vec<&'a Person>),
}

/// Lower is better
fn match_rank(query: &str, person: &Person) -> Option<u8> {
    let name = person.name.to_lowercase();
    let nickname = person.nickname.as_deref().map(str::to_lowercase);
    let nick = nickname.as_deref();

    if name == query {
        Some(0)
    } else if nick == Some(query) {
        Some(1)
    } else if name.starts_with(query) {
        Some(2)
    } else if nick.is_some_and(|n| n.starts_with(query)) {
        Some(3)
    } else if name.contains(query) {
        Some(4)
    } else if nick.is_some_and(|n| n.contains(query)) {
        Some(5)
    } else {
        None
    }
}

fn ranked<'a>(query: &str, persons: &'a [Person]) -> Vec<&'a Person> {
    let query = query.trim().to_lowercase();
    let mut hits: Vec<(u8, &Person)> = persons
        .iter()
        .filter(|p| p.is_lookup_target())
        .filter_map(|p| match_rank(&query, p).map(|rank| (rank, p)))
        .collect();
    hits.sort_by(|(ra, a), (rb, b)| {
        ra.cmp(rb)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.into_iter().map(|(_, p)| p).collect()
}

/// Ranked candidates for `query`, at most `limit` of them
pub fn search_persons<'a>(query: &str, persons: &'a [Person], limit: usize) -> Vec<&'a Person> {
    let mut hits = ranked(query, persons);
    hits.truncate(limit);
    hits
}

/// Classify a name token against the roster
pub fn classify<'a>(name: &str, persons: &'a [Person], limit: usize) -> Classification<'a> {
    let mut hits = ranked(name, persons);
    if hits.is_empty() {
        return Classification::Unknown;
    }
    if hits.len() == 1 && hits[0].name.trim().to_lowercase() == name.trim().to_lowercase() {
        return Classification::Unambiguous(hits[0]);
    }
    hits.truncate(limit);
    Classification::Ambiguous(hits)
}

/// Suggestions for the token being typed. `@+` tokens never trigger a lookup.
pub fn suggest<'a>(live: &LiveMention, persons: &'a [Person], limit: usize) -> Vec<&'a Person> {
    if live.forced_create {
        return Vec::new();
    }
    search_persons(&live.query, persons, limit)
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateSummary {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
}

impl From<&Person> for CandidateSummary {
    fn from(p: &Person) -> Self {
        Self {
            id: p.id.clone(),
            name: p.name.clone(),
            nickname: p.nickname.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BoundName {
    pub name: String,
    #[serde(rename = "personId")]
    pub person_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AmbiguousName {
    pub name: String,
    pub candidates: Vec<CandidateSummary>,
}

/// Result of a full-text resolution pass. Every list is in first-detection order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolutionPass {
    pub mentions: Vec<Mention>,
    pub bound: Vec<BoundName>,
    pub ambiguous: Vec<AmbiguousName>,
    pub unknown: Vec<String>,
    #[serde(rename = "forcedNew")]
    pub forced_new: Vec<String>,
}

impl ResolutionPass {
    pub fn ambiguous_names(&self) -> Vec<String> {
        self.ambiguous.iter().map(|a| a.name.clone()).collect()
    }

    pub fn needs_disambiguation(&self) -> bool {
        !self.ambiguous.is_empty()
    }
}

/// Resolve every distinct mention in `text`.
///
/// A name is forced-new if any of its occurrences uses `@+`.
pub fn resolve_text(text: &str, persons: &[Person], limit: usize) -> ResolutionPass {
    let mut mentions = mentions::extract_mentions(text);
    let mut pass = ResolutionPass::default();

    let distinct: Vec<String> = mentions::distinct_names(&mentions)
        .into_iter()
        .map(|m| m.name.clone())
        .collect();

    for name in distinct {
        let key = name.to_lowercase();
        let forced = mentions
            .iter()
            .any(|m| m.forced_create && m.name.to_lowercase() == key);
        if forced {
            pass.forced_new.push(name);
            continue;
        }

        match classify(&name, persons, limit) {
            Classification::Unknown => pass.unknown.push(name),
            Classification::Unambiguous(person) => {
                for m in mentions.iter_mut().filter(|m| m.name.to_lowercase() == key) {
                    m.person_id = Some(person.id.clone());
                }
                pass.bound.push(BoundName {
                    name,
                    person_id: person.id.clone(),
                });
            }
            Classification::Ambiguous(candidates) => pass.ambiguous.push(AmbiguousName {
                name,
                candidates: candidates.into_iter().map(CandidateSummary::from).collect(),
            }),
        }
    }

    pass.mentions = mentions;
    pass
}
