//! Guess normalization and similarity classification
//!
//! Guesses and the secret word are both run through [`normalize`] before
//! comparison, so that casing, diacritics and word separators never decide
//! whether a guess is correct. [`check_guess`] then classifies the pair as
//! exact, close (one edit away) or distant.

/// Characters that are part of a word but irrelevant when guessing it.
pub fn is_separator(character: char) -> bool {
    matches!(character, ' ' | '-' | '_')
}

fn transliterate(character: char) -> Option<&'static str> {
    let replacement = match character {
        'à' | 'á' | 'â' | 'ã' | 'ā' | 'ą' => "a",
        'ä' | 'æ' => "ae",
        'å' => "aa",
        'ç' | 'ć' | 'č' => "c",
        'ð' | 'ď' => "d",
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ę' | 'ě' => "e",
        'ì' | 'í' | 'î' | 'ï' | 'ī' => "i",
        'ł' => "l",
        'ñ' | 'ń' | 'ň' => "n",
        'ò' | 'ó' | 'ô' | 'õ' | 'ō' => "o",
        'ö' | 'ø' | 'œ' => "oe",
        'ř' => "r",
        'ś' | 'š' => "s",
        'ß' => "ss",
        'ť' => "t",
        'ù' | 'ú' | 'û' | 'ū' | 'ů' => "u",
        'ü' => "ue",
        'ý' | 'ÿ' => "y",
        'ź' | 'ż' | 'ž' => "z",
        'þ' => "th",
        _ => return None,
    };
    Some(replacement)
}

/// Lowercases the input, transliterates diacritics to plain ASCII and drops
/// separators. The result contains neither uppercase letters, separators
/// nor transliterable characters, so normalizing twice is a no-op.
pub fn normalize(text: &str) -> String {
    let mut normalized = String::with_capacity(text.len());
    for character in text.chars().flat_map(char::to_lowercase) {
        if is_separator(character) {
            continue;
        }
        match transliterate(character) {
            Some(replacement) => normalized.push_str(replacement),
            None => normalized.push(character),
        }
    }
    normalized
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuessResult {
    Exact,
    /// One insertion, deletion, substitution or adjacent transposition away.
    Close,
    Distant,
}

/// Compares two already normalized strings.
///
/// Works like a Damerau-Levenshtein distance capped at two: the walk stops as
/// soon as a second difference is found.
pub fn check_guess(a: &str, b: &str) -> GuessResult {
    if a == b {
        return GuessResult::Exact;
    }

    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (long, short) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    if long.len() - short.len() > 1 {
        return GuessResult::Distant;
    }

    let mut distance = 0;
    let (mut i, mut j) = (0, 0);
    while i < long.len() {
        let expected = short.get(j).copied();
        if Some(long[i]) == expected {
            i += 1;
            j += 1;
            continue;
        }

        distance += 1;
        if distance > 1 {
            return GuessResult::Distant;
        }

        let next = long.get(i + 1).copied();
        if next.is_some() && next == expected {
            if short.get(j + 1).copied() == Some(long[i]) {
                // Swapped neighbours (abc ~ acb)
                i += 2;
                j += 2;
            } else {
                // Extra character in the longer string (abxc ~ abc)
                i += 1;
            }
        } else if long.len() > short.len() && expected.is_none() {
            i += 1;
        } else {
            i += 1;
            j += 1;
        }
    }

    distance += short.len().saturating_sub(j);
    match distance {
        0 => GuessResult::Exact,
        1 => GuessResult::Close,
        _ => GuessResult::Distant,
    }
}
