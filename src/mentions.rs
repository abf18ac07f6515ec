//! `@name` mention parsing.
//!
//! All offsets are character offsets (not bytes) so they line up with caret
//! positions reported by text inputs. Parsing is pure: the same text and
//! caret always produce the same result.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A person reference found in text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Mention {
    /// Name without the `@` / `@+` prefix
    pub name: String,
    /// Character offset of the `@`
    pub start: usize,
    /// Character offset one past the last name character
    pub end: usize,
    /// `@+name`: always create a new person, never look up
    #[serde(rename = "forcedCreate")]
    pub forced_create: bool,
    /// Bound identity, filled in after resolution
    #[serde(rename = "personId", skip_serializing_if = "Option::is_none")]
    pub person_id: Option<String>,
}

/// The token currently being typed under the caret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LiveMention {
    /// Partial name typed so far (may be empty right after `@`)
    pub query: String,
    /// Character offset of the `@`
    pub start: usize,
    #[serde(rename = "forcedCreate")]
    pub forced_create: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ParsedText {
    pub mentions: Vec<Mention>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live: Option<LiveMention>,
}

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// An `@` only opens a token at a word boundary, so `ana@example.com` is not a mention
fn opens_token(chars: &[char], at: usize) -> bool {
    chars[at] == '@' && (at == 0 || !is_word(chars[at - 1]))
}

/// Parse complete mentions and the live token in one pass
pub fn parse(text: &str, caret: usize) -> ParsedText {
    ParsedText {
        mentions: extract_mentions(text),
        live: live_mention(text, caret),
    }
}

/// All complete `@name` / `@+name` tokens in order of appearance
pub fn extract_mentions(text: &str) -> Vec<Mention> {
    let chars: Vec<char> = text.chars().collect();
    let mut mentions = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        if !opens_token(&chars, i) {
            i += 1;
            continue;
        }

        let mut j = i + 1;
        let forced_create = chars.get(j) == Some(&'+');
        if forced_create {
            j += 1;
        }
        let name_start = j;
        while j < chars.len() && is_word(chars[j]) {
            j += 1;
        }

        if j > name_start {
            mentions.push(Mention {
                name: chars[name_start..j].iter().collect(),
                start: i,
                end: j,
                forced_create,
                person_id: None,
            });
            i = j;
        } else {
            i += 1;
        }
    }

    mentions
}

/// The unterminated token ending at `caret`, if any.
///
/// `caret` is clamped to the text length.
pub fn live_mention(text: &str, caret: usize) -> Option<LiveMention> {
    let chars: Vec<char> = text.chars().collect();
    let caret = caret.min(chars.len());

    let mut name_start = caret;
    while name_start > 0 && is_word(chars[name_start - 1]) {
        name_start -= 1;
    }

    let (at, forced_create) = match name_start {
        0 => return None,
        n if chars[n - 1] == '@' => (n - 1, false),
        n if n >= 2 && chars[n - 1] == '+' && chars[n - 2] == '@' => (n - 2, true),
        _ => return None,
    };

    if !opens_token(&chars, at) {
        return None;
    }

    Some(LiveMention {
        query: chars[name_start..caret].iter().collect(),
        start: at,
        forced_create,
    })
}

/// Rebuild `text`, replacing each mention token with `render(mention, raw_token)`.
///
/// Passing a renderer that returns `raw_token` unchanged reproduces the input.
pub fn highlight_mentions<F>(text: &str, mut render: F) -> String
where
    F: FnMut(&Mention, &str) -> String,
{
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;

    for mention in extract_mentions(text) {
        out.extend(&chars[cursor..mention.start]);
        let raw: String = chars[mention.start..mention.end].iter().collect();
        out.push_str(&render(&mention, &raw));
        cursor = mention.end;
    }
    out.extend(&chars[cursor..]);
    out
}

/// Text with mention prefixes removed (`@+Marco` becomes `Marco`)
pub fn strip_mentions(text: &str) -> String {
    highlight_mentions(text, |m, _| m.name.clone())
}

/// Distinct names in first-detection order, compared case-insensitively
pub fn distinct_names(mentions: &[Mention]) -> Vec<&Mention> {
    let mut seen: Vec<String> = Vec::new();
    let mut out = Vec::new();
    for m in mentions {
        let key = m.name.to_lowercase();
        if !seen.contains(&key) {
            seen.push(key);
            out.push(m);
        }
    }
    out
}
