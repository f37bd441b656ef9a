/*!
 * Tests for language utility functions
 */

use yastq::extraction::{select_track, SubtitleTrack};
use yastq::language_utils::{get_language_name, language_codes_match, normalize_to_part2t, validate_language_code};

fn track(index: usize, language: Option<&str>, title: Option<&str>) -> SubtitleTrack {
    SubtitleTrack {
        index,
        codec_name: "subrip".to_string(),
        language: language.map(str::to_string),
        title: title.map(str::to_string),
    }
}

/// Test validation of language codes
#[test]
fn test_validate_language_code_withValidCodes_shouldReturnNormalizedInput() {
    assert_eq!(validate_language_code("en").unwrap(), "en");
    assert_eq!(validate_language_code("fra").unwrap(), "fra");
    assert_eq!(validate_language_code("ger").unwrap(), "ger");
    assert_eq!(validate_language_code(" EN ").unwrap(), "en");
    assert_eq!(validate_language_code("pt-BR").unwrap(), "pt-br");

    // Invalid codes
    assert!(validate_language_code("xyz").is_err());
    assert!(validate_language_code("123").is_err());
    assert!(validate_language_code("e").is_err());
}

/// Test normalization of language codes to ISO 639-2/T format
#[test]
fn test_normalize_to_part2t_withValidCodes_shouldNormalizeCorrectly() {
    assert_eq!(normalize_to_part2t("en").unwrap(), "eng");
    assert_eq!(normalize_to_part2t("fr").unwrap(), "fra");
    assert_eq!(normalize_to_part2t("fre").unwrap(), "fra");
    assert_eq!(normalize_to_part2t("ger").unwrap(), "deu");

    // Case insensitivity and whitespace
    assert_eq!(normalize_to_part2t("EN").unwrap(), "eng");
    assert_eq!(normalize_to_part2t(" en ").unwrap(), "eng");
}

/// Test matching of different language code formats
#[test]
fn test_language_codes_match_withMatchingCodes_shouldReturnTrue() {
    assert!(language_codes_match("en", "eng"));
    assert!(language_codes_match("fr", "fre"));
    assert!(language_codes_match("fra", "fre"));
    assert!(language_codes_match("EN", "ENG"));

    // Non-matches
    assert!(!language_codes_match("en", "fra"));
    assert!(!language_codes_match("xx", "xx"));
}

/// Test retrieval of language names from codes
#[test]
fn test_get_language_name_withValidCodes_shouldReturnCorrectName() {
    assert_eq!(get_language_name("en").unwrap(), "English");
    assert_eq!(get_language_name("fre").unwrap(), "French");
    assert!(get_language_name("xyz").is_err());
}

/// Test subtitle track selection with different ISO code formats
#[test]
fn test_select_track_withIsoCodes_shouldMatchAcrossForms() {
    let tracks = vec![
        track(0, Some("eng"), None),
        track(1, Some("fre"), None),
        track(2, Some("de"), None),
        track(3, None, Some("Italian")),
    ];

    assert_eq!(select_track(&tracks, "en").map(|t| t.index), Some(0));
    assert_eq!(select_track(&tracks, "fra").map(|t| t.index), Some(1));
    assert_eq!(select_track(&tracks, "deu").map(|t| t.index), Some(2));
    assert_eq!(select_track(&tracks, "it").map(|t| t.index), Some(3));
    // No Spanish track, English wins
    assert_eq!(select_track(&tracks, "es").map(|t| t.index), Some(0));
}

/// Test that image-based tracks are never selected
#[test]
fn test_select_track_withOnlyBitmapTracks_shouldReturnNone() {
    let tracks = vec![SubtitleTrack {
        index: 4,
        codec_name: "hdmv_pgs_subtitle".to_string(),
        language: Some("en".to_string()),
        title: None,
    }];

    assert!(select_track(&tracks, "en").is_none());
}
