//! Wikilink substitution over free-form text.
//!
//! A single left-to-right scan matches either an existing `[[...]]` link, which
//! is copied through untouched, or one of the detected terms, which is replaced
//! by its mapped link. Longer terms are tried first so that "Irina Tavera" wins
//! over "Irina" at the same position.

pub mod reference;

pub use reference::{EntityReferenceFile, EntityReferenceIndex, EntityType, ReferenceEntry};

use std::collections::HashMap;

use regex::{Captures, Regex};

const EXISTING_LINK: &str = r"\[\[.*?\]\]";

/// A compiled substitution pass.
#[derive(Debug, Clone)]
pub struct Linker {
    pattern: Option<Regex>,
    replacements: HashMap<String, String>,
}

impl Linker {
    /// Compile the scanning pattern for `terms`.
    ///
    /// Terms keep their declaration order among equal lengths. Terms without a
    /// non-empty entry in `replacements` still take part in matching, so they
    /// shadow shorter terms, but are emitted unchanged.
    pub fn new<S: AsRef<str>>(terms: &[S], replacements: &HashMap<String, String>) -> Self {
        let mut unique: Vec<&str> = Vec::new();
        for term in terms.iter().map(AsRef::as_ref) {
            if !term.is_empty() && !unique.contains(&term) {
                unique.push(term);
            }
        }
        // sort_by_key is stable
        unique.sort_by_key(|t| std::cmp::Reverse(t.chars().count()));

        let replacements: HashMap<String, String> = replacements
            .iter()
            .filter(|(term, link)| !link.is_empty() && unique.contains(&term.as_str()))
            .map(|(term, link)| (term.clone(), link.clone()))
            .collect();

        if unique.is_empty() || replacements.is_empty() {
            return Self {
                pattern: None,
                replacements,
            };
        }

        let alternatives: Vec<String> = unique.iter().map(|t| whole_word(t)).collect();
        let source = format!("({EXISTING_LINK})|({})", alternatives.join("|"));
        // Every term is escaped, so the pattern is always valid; a failure here
        // would only come from exceeding the regex size limit.
        let pattern = match Regex::new(&source) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                tracing::warn!(error = %e, terms = unique.len(), "Cannot compile link pattern, leaving text unchanged");
                None
            }
        };

        Self {
            pattern,
            replacements,
        }
    }

    /// `true` when applying this linker can never change any text.
    pub fn is_passthrough(&self) -> bool {
        self.pattern.is_none()
    }

    /// Rewrite `text`, returning the new text and the number of replacements.
    pub fn apply(&self, text: &str) -> (String, usize) {
        let Some(pattern) = &self.pattern else {
            return (text.to_string(), 0);
        };
        let mut count = 0;
        let rewritten = pattern.replace_all(text, |caps: &Captures<'_>| {
            if let Some(existing) = caps.get(1) {
                return existing.as_str().to_string();
            }
            let term = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            match self.replacements.get(term) {
                Some(link) => {
                    count += 1;
                    link.clone()
                }
                None => term.to_string(),
            }
        });
        (rewritten.into_owned(), count)
    }
}

/// One-shot substitution.
pub fn substitute<S: AsRef<str>>(
    text: &str,
    terms: &[S],
    replacements: &HashMap<String, String>,
) -> String {
    Linker::new(terms, replacements).apply(text).0
}

/// Escape a term and anchor it on word boundaries where its ends are word
/// characters. A term like "C++" has no boundary after its last character.
fn whole_word(term: &str) -> String {
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    let leading = term.chars().next().is_some_and(is_word);
    let trailing = term.chars().last().is_some_and(is_word);
    format!(
        "{}{}{}",
        if leading { r"\b" } else { "" },
        regex::escape(term),
        if trailing { r"\b" } else { "" }
    )
}
