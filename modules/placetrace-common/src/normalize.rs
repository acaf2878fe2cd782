//! Term-key normalization.
//!
//! `normalize` is the single source of entity identity: every component
//! (override store, resolver, geocode cache) keys terms by its output.
//! Two different normalizations of the same display string would silently
//! split a term in two, so nothing else in the workspace folds case or
//! strips accents on its own.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Canonicalize a display string into a comparison key.
///
/// NFKD decomposition, combining marks dropped, lowercased, whitespace
/// runs collapsed to a single space, surrounding whitespace trimmed.
/// Idempotent: `normalize(normalize(s)) == normalize(s)`.
pub fn normalize(s: &str) -> String {
    let folded: String = s
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase();

    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_diacritics_and_case() {
        assert_eq!(normalize("Cerignola"), "cerignola");
        assert_eq!(normalize("Forlì"), "forli");
        assert_eq!(normalize("SAN GIOVANNI ROTONDO"), "san giovanni rotondo");
    }

    #[test]
    fn collapses_whitespace() {
        assert_eq!(normalize("  Canosa   di  Puglia \t"), "canosa di puglia");
    }

    #[test]
    fn idempotent() {
        let once = normalize("Médio  Ôriente");
        assert_eq!(normalize(&once), once);
    }

    #[test]
    fn empty_and_whitespace_only() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("   "), "");
    }
}
