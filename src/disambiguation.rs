//! Step-by-step disambiguation of ambiguous mention names.
//!
//! The protocol is a plain state object with no rendering or storage
//! concerns. Names are visited strictly in first-detection order; the
//! finished name -> choice map is only ever released as a whole.

use std::collections::HashMap;
use std::fmt;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// Decision for one ambiguous name.
///
/// On the wire: `"NEW"`, `"IGNORE"`, or an existing person id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Choice {
    Existing(String),
    New,
    Ignore,
}

impl From<String> for Choice {
    fn from(s: String) -> Self {
        match s.trim() {
            "NEW" => Choice::New,
            "IGNORE" => Choice::Ignore,
            id => Choice::Existing(id.to_string()),
        }
    }
}

impl From<&str> for Choice {
    fn from(s: &str) -> Self {
        Choice::from(s.to_string())
    }
}

impl From<Choice> for String {
    fn from(c: Choice) -> Self {
        c.to_string()
    }
}

impl fmt::Display for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Choice::Existing(id) => f.write_str(id),
            Choice::New => f.write_str("NEW"),
            Choice::Ignore => f.write_str("IGNORE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("no resolution chosen for '{0}'")]
    NoChoice(String),

    #[error("'{0}' is not one of the names being resolved")]
    UnknownName(String),
}

/// Completed name -> choice map, in first-detection order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolutions {
    entries: Vec<(String, Choice)>,
}

impl Resolutions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the decision for `name` (case-insensitive key)
    pub fn insert(&mut self, name: impl Into<String>, choice: Choice) {
        let name = name.into();
        match self
            .entries
            .iter_mut()
            .find(|(n, _)| n.to_lowercase() == name.to_lowercase())
        {
            Some(entry) => entry.1 = choice,
            None => self.entries.push((name, choice)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Choice> {
        let key = name.to_lowercase();
        self.entries
            .iter()
            .find(|(n, _)| n.to_lowercase() == key)
            .map(|(_, c)| c)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Choice)> {
        self.entries.iter().map(|(n, c)| (n.as_str(), c))
    }
}

impl Serialize for Resolutions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, choice) in &self.entries {
            map.serialize_entry(name, choice)?;
        }
        map.end()
    }
}

impl FromIterator<(String, Choice)> for Resolutions {
    fn from_iter<I: IntoIterator<Item = (String, Choice)>>(iter: I) -> Self {
        let mut out = Resolutions::new();
        for (name, choice) in iter {
            out.insert(name, choice);
        }
        out
    }
}

/// Result of a successful `advance`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Next { index: usize, name: String },
    Complete(Resolutions),
}

#[derive(Debug, Clone)]
pub struct Disambiguation {
    names: Vec<String>,
    index: usize,
    choices: HashMap<String, Choice>,
}

impl Disambiguation {
    /// Start a protocol over `names`; repeated names (ignoring case) are visited once.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ordered: Vec<String> = Vec::new();
        for name in names {
            let name = name.into();
            if !ordered.iter().any(|n| n.to_lowercase() == name.to_lowercase()) {
                ordered.push(name);
            }
        }
        Self {
            names: ordered,
            index: 0,
            choices: HashMap::new(),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Name at the current step
    pub fn current(&self) -> Option<&str> {
        self.names.get(self.index).map(String::as_str)
    }

    pub fn choice_for(&self, name: &str) -> Option<&Choice> {
        self.choices.get(&name.to_lowercase())
    }

    /// Whether the current step has a decision (the UI gates "next" on this)
    pub fn can_advance(&self) -> bool {
        match self.current() {
            Some(name) => self.choice_for(name).is_some(),
            None => self.names.is_empty(),
        }
    }

    /// Record or overwrite the decision for `name`. Never moves the cursor.
    pub fn select(&mut self, name: &str, choice: Choice) -> Result<(), ProtocolError> {
        let key = name.to_lowercase();
        if !self.names.iter().any(|n| n.to_lowercase() == key) {
            return Err(ProtocolError::UnknownName(name.to_string()));
        }
        self.choices.insert(key, choice);
        Ok(())
    }

    /// Move past the current name, or emit the full map after the last one.
    pub fn advance(&mut self) -> Result<Step, ProtocolError> {
        let Some(name) = self.current().map(str::to_string) else {
            return Ok(Step::Complete(self.finish()));
        };
        if self.choice_for(&name).is_none() {
            return Err(ProtocolError::NoChoice(name));
        }

        if self.index + 1 >= self.names.len() {
            return Ok(Step::Complete(self.finish()));
        }

        self.index += 1;
        Ok(Step::Next {
            index: self.index,
            name: self.names[self.index].clone(),
        })
    }

    /// Abandon the protocol; partial decisions are discarded.
    pub fn cancel(&mut self) {
        self.reset();
    }

    fn finish(&mut self) -> Resolutions {
        let resolutions = self
            .names
            .iter()
            .filter_map(|n| {
                self.choices
                    .get(&n.to_lowercase())
                    .map(|c| (n.clone(), c.clone()))
            })
            .collect();
        self.reset();
        resolutions
    }

    fn reset(&mut self) {
        self.index = 0;
        self.choices.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn n_selects_and_advances_complete_with_n_entries() {
        for n in 0..6 {
            let names: Vec<String> = (0..n).map(|i| format!("name{}", i)).collect();
            let mut protocol = Disambiguation::new(names.clone());
            let mut completed = None;

            if n == 0 {
                completed = match protocol.advance().unwrap() {
                    Step::Complete(r) => Some(r),
                    Step::Next { .. } => None,
                };
            }

            for (i, name) in names.iter().enumerate() {
                let choice = match i % 3 {
                    0 => Choice::New,
                    1 => Choice::Ignore,
                    _ => Choice::Existing(format!("p{}", i)),
                };
                protocol.select(name, choice).unwrap();
                match protocol.advance().unwrap() {
                    Step::Next { index, .. } => assert_eq!(index, i + 1),
                    Step::Complete(r) => {
                        assert_eq!(i, n - 1);
                        completed = Some(r);
                    }
                }
            }

            let resolutions = completed.expect("protocol should complete");
            assert_eq!(resolutions.len(), n);
        }
    }

    #[test]
    fn advance_without_choice_is_rejected() {
        let mut protocol = Disambiguation::new(["Sarah", "Tom"]);
        assert!(!protocol.can_advance());
        assert_eq!(
            protocol.advance(),
            Err(ProtocolError::NoChoice("Sarah".to_string()))
        );
        assert_eq!(protocol.index(), 0);
    }

    #[test]
    fn select_overwrites_and_does_not_advance() {
        let mut protocol = Disambiguation::new(["Sarah", "Tom"]);
        protocol.select("sarah", Choice::New).unwrap();
        protocol.select("Sarah", Choice::from("p-7")).unwrap();
        assert_eq!(protocol.index(), 0);
        assert_eq!(protocol.choice_for("Sarah"), Some(&Choice::Existing("p-7".into())));
    }

    #[test]
    fn unknown_names_are_refused() {
        let mut protocol = Disambiguation::new(["Sarah"]);
        assert_eq!(
            protocol.select("Bob", Choice::Ignore),
            Err(ProtocolError::UnknownName("Bob".to_string()))
        );
    }

    #[test]
    fn completion_resets_to_initial_state() {
        let mut protocol = Disambiguation::new(["Sarah"]);
        protocol.select("Sarah", Choice::Ignore).unwrap();
        let step = protocol.advance().unwrap();
        assert!(matches!(step, Step::Complete(ref r) if r.get("SARAH") == Some(&Choice::Ignore)));
        assert_eq!(protocol.index(), 0);
        assert!(protocol.choice_for("Sarah").is_none());
    }

    #[test]
    fn cancel_discards_partial_decisions() {
        let mut protocol = Disambiguation::new(["Sarah", "Tom", "Ana"]);
        protocol.select("Sarah", Choice::New).unwrap();
        protocol.advance().unwrap();
        protocol.select("Tom", Choice::Ignore).unwrap();
        protocol.cancel();
        assert_eq!(protocol.index(), 0);
        assert_eq!(protocol.current(), Some("Sarah"));
        assert!(protocol.choice_for("Sarah").is_none());
        assert!(protocol.choice_for("Tom").is_none());
    }

    #[test]
    fn order_is_first_detection_and_stable() {
        let a = Disambiguation::new(["Tom", "sarah", "TOM", "Sarah", "Ana"]);
        let b = Disambiguation::new(["Tom", "sarah", "TOM", "Sarah", "Ana"]);
        assert_eq!(a.names(), &["Tom", "sarah", "Ana"]);
        assert_eq!(a.names(), b.names());
    }

    #[test]
    fn choice_wire_format() {
        assert_eq!(Choice::from("NEW"), Choice::New);
        assert_eq!(Choice::from("IGNORE"), Choice::Ignore);
        assert_eq!(String::from(Choice::Existing("abc".into())), "abc");
        let json = serde_json::to_string(&Choice::New).unwrap();
        assert_eq!(json, "\"NEW\"");
    }
}
