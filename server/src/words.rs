//! Word supply for lobbies
//!
//! Dictionaries are embedded at build time, one file per language. A
//! [`WordCache`] loads and lowercases each dictionary once and shares it
//! between all lobbies. Every lobby owns a [`WordPool`] that hands out
//! candidate words: custom words first (up to the per-turn quota), then
//! words from its own shuffled copy of the dictionary, which is refilled and
//! reshuffled whenever it runs dry.

use crate::error::LobbyError;
use log::info;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    English,
    EnglishGb,
    German,
    French,
    Italian,
    Dutch,
    Ukrainian,
    Russian,
    Polish,
}

impl Language {
    pub const ALL: [Language; 9] = [
        Language::English,
        Language::EnglishGb,
        Language::German,
        Language::French,
        Language::Italian,
        Language::Dutch,
        Language::Ukrainian,
        Language::Russian,
        Language::Polish,
    ];

    pub fn identifier(self) -> &'static str {
        match self {
            Language::English => "english",
            Language::EnglishGb => "english_gb",
            Language::German => "german",
            Language::French => "french",
            Language::Italian => "italian",
            Language::Dutch => "dutch",
            Language::Ukrainian => "ukrainian",
            Language::Russian => "russian",
            Language::Polish => "polish",
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Language::English => "en_us",
            Language::EnglishGb => "en_gb",
            Language::German => "de",
            Language::French => "fr",
            Language::Italian => "it",
            Language::Dutch => "nl",
            Language::Ukrainian => "ua",
            Language::Russian => "ru",
            Language::Polish => "pl",
        }
    }

    /// None of the shipped languages need locale specific case mapping, so
    /// the Unicode default mapping applies.
    pub fn lowercase(self, text: &str) -> String {
        text.to_lowercase()
    }

    fn embedded_words(self) -> &'static str {
        match self {
            Language::English => include_str!("../words/en_us"),
            Language::EnglishGb => include_str!("../words/en_gb"),
            Language::German => include_str!("../words/de"),
            Language::French => include_str!("../words/fr"),
            Language::Italian => include_str!("../words/it"),
            Language::Dutch => include_str!("../words/nl"),
            Language::Ukrainian => include_str!("../words/ua"),
            Language::Russian => include_str!("../words/ru"),
            Language::Polish => include_str!("../words/pl"),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

impl FromStr for Language {
    type Err = LobbyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Language::ALL
            .into_iter()
            .find(|language| language.identifier().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| LobbyError::UnknownLanguage(value.to_string()))
    }
}

type WordLoader = Box<dyn Fn(Language) -> Option<String> + Send + Sync>;

/// Read-through cache of dictionaries, keyed by language.
///
/// Guarded by its own lock so that concurrent first loads of the same
/// language from different lobbies can't race. Lobby locks are never held
/// while waiting on it for long; loading is a one-time string split.
pub struct WordCache {
    lists: Mutex<HashMap<Language, Arc<Vec<String>>>>,
    loader: WordLoader,
}

impl WordCache {
    /// Cache backed by the embedded dictionaries.
    pub fn new() -> Self {
        Self::with_loader(|language| Some(language.embedded_words().to_string()))
    }

    /// Cache backed by a custom source. Returning `None` marks the language
    /// as unavailable.
    pub fn with_loader<F>(loader: F) -> Self
    where
        F: Fn(Language) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            lists: Mutex::new(HashMap::new()),
            loader: Box::new(loader),
        }
    }

    pub fn words(&self, language: Language) -> Result<Arc<Vec<String>>, LobbyError> {
        let mut lists = self.lists.lock();
        if let Some(words) = lists.get(&language) {
            return Ok(Arc::clone(words));
        }

        info!("Loading wordlist '{}'", language);
        let raw = (self.loader)(language).ok_or(LobbyError::EmptyWordList(language))?;
        let words: Vec<String> = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|word| language.lowercase(word))
            .collect();

        if words.is_empty() {
            return Err(LobbyError::EmptyWordList(language));
        }

        info!("Wordlist '{}' loaded ({} words)", language, words.len());
        let words = Arc::new(words);
        lists.insert(language, Arc::clone(&words));
        Ok(words)
    }
}

impl Default for WordCache {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordPool {
    language: Language,
    /// Shared dictionary. Not part of snapshots; reattached from the cache
    /// on restore.
    #[serde(skip)]
    dictionary: Arc<Vec<String>>,
    remaining: Vec<String>,
    /// Consumed back to front.
    custom_words: Vec<String>,
}

impl WordPool {
    pub fn new(language: Language, dictionary: Arc<Vec<String>>, custom_words: Vec<String>) -> Self {
        let mut custom_words: Vec<String> = custom_words
            .iter()
            .map(|word| language.lowercase(word.trim()))
            .filter(|word| !word.is_empty())
            .collect();
        custom_words.shuffle(&mut rand::thread_rng());

        Self {
            language,
            dictionary,
            remaining: Vec::new(),
            custom_words,
        }
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn custom_words_left(&self) -> usize {
        self.custom_words.len()
    }

    pub(crate) fn attach_dictionary(&mut self, dictionary: Arc<Vec<String>>) {
        self.dictionary = dictionary;
    }

    /// Draws `count` candidate words, preferring custom words up to
    /// `custom_per_turn`.
    pub fn next_words(&mut self, count: usize, custom_per_turn: usize) -> Vec<String> {
        let mut words = Vec::with_capacity(count);
        let mut custom_left = custom_per_turn;

        while words.len() < count {
            let word = if custom_left > 0 && !self.custom_words.is_empty() {
                custom_left -= 1;
                self.custom_words.pop()
            } else {
                self.pop_dictionary()
            };

            match word {
                Some(word) => words.push(word),
                None => break,
            }
        }

        words
    }

    fn pop_dictionary(&mut self) -> Option<String> {
        if self.remaining.is_empty() {
            self.remaining = self.dictionary.as_ref().clone();
            self.remaining.shuffle(&mut rand::thread_rng());
        }
        self.remaining.pop()
    }
}
