//! Language utilities for ISO language code handling
//!
//! Requests carry language codes as users configured them: ISO 639-1
//! ("fr"), ISO 639-2/T or /B ("fra", "fre"), optionally with a region
//! suffix ("pt-BR"). These helpers validate and compare such codes.

use anyhow::{anyhow, Result};
use isolang::Language;

/// ISO 639-2/B codes that differ from their 639-2/T form
const BIBLIOGRAPHIC_CODES: [(&str, &str); 18] = [
    ("fre", "fra"),
    ("ger", "deu"),
    ("dut", "nld"),
    ("gre", "ell"),
    ("chi", "zho"),
    ("cze", "ces"),
    ("ice", "isl"),
    ("alb", "sqi"),
    ("arm", "hye"),
    ("baq", "eus"),
    ("bur", "mya"),
    ("per", "fas"),
    ("geo", "kat"),
    ("may", "msa"),
    ("mac", "mkd"),
    ("rum", "ron"),
    ("slo", "slk"),
    ("wel", "cym"),
];

/// Split "pt-BR" / "pt_BR" into the base language part
fn base_code(code: &str) -> String {
    code.trim()
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .to_lowercase()
}

/// Resolve a code to its isolang language
fn lookup(code: &str) -> Option<Language> {
    let base = base_code(code);
    match base.len() {
        2 => Language::from_639_1(&base),
        3 => {
            let terminological = BIBLIOGRAPHIC_CODES
                .iter()
                .find(|(b, _)| *b == base)
                .map(|(_, t)| *t)
                .unwrap_or(base.as_str());
            Language::from_639_3(terminological)
        }
        _ => None,
    }
}

/// Validate a language code, returning it trimmed and lowercased
pub fn validate_language_code(code: &str) -> Result<String> {
    lookup(code)
        .map(|_| code.trim().to_lowercase())
        .ok_or_else(|| anyhow!("Invalid language code: {}", code))
}

/// Normalize a language code to ISO 639-2/T (3-letter) format
pub fn normalize_to_part2t(code: &str) -> Result<String> {
    lookup(code)
        .map(|lang| lang.to_639_3().to_string())
        .ok_or_else(|| anyhow!("Cannot normalize invalid language code: {}", code))
}

/// Check if two language codes represent the same base language
pub fn language_codes_match(code1: &str, code2: &str) -> bool {
    match (lookup(code1), lookup(code2)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Get the English language name from a code
pub fn get_language_name(code: &str) -> Result<String> {
    lookup(code)
        .map(|lang| lang.to_name().to_string())
        .ok_or_else(|| anyhow!("Failed to get language from code: {}", code))
}
