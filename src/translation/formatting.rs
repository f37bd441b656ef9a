/*!
 * Subtitle text formatting helpers.
 *
 * Detects lines worth translating, removes markup before translation,
 * strips styling from output and rewraps long lines. Also carries a few
 * repairs for translations that lost the shape of their source line.
 */

use once_cell::sync::Lazy;
use regex::Regex;

/// ASS/SSA override blocks such as `{\an8}` or `{\i1}`
static ASS_BLOCK_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\\[^}]*\}").unwrap());

/// HTML-style tags such as `<i>` or `<font color="red">`
static HTML_TAG_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"</?[a-zA-Z][^>]*>").unwrap());

/// Position tags like `{\an8}`
static POSITION_TAG_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\\an\d\}").unwrap());

/// Styling tags that `strip_formatting` removes
static STYLE_TAG_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</?(i|b|u|s|font)(\s[^>]*)?>").unwrap());

static WHITESPACE_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]+").unwrap());

/// Whether a line carries anything a translator could work with
///
/// Whitespace, markup and punctuation alone do not count.
pub fn has_meaningful_content(text: &str) -> bool {
    let bare = HTML_TAG_REGEX.replace_all(&ASS_BLOCK_REGEX.replace_all(text, ""), "").into_owned();
    bare.chars().any(char::is_alphanumeric)
}

/// Remove every markup construct, keeping only the spoken text
pub fn remove_markup(text: &str) -> String {
    let without_ass = ASS_BLOCK_REGEX.replace_all(text, "");
    let without_html = HTML_TAG_REGEX.replace_all(&without_ass, "");

    without_html
        .lines()
        .map(|line| WHITESPACE_REGEX.replace_all(line.trim(), " ").into_owned())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Remove styling (italics, bold, fonts and ASS overrides) from output text
///
/// Position tags survive; they decide where the line is drawn.
pub fn strip_formatting(text: &str) -> String {
    let position = POSITION_TAG_REGEX.find(text).map(|m| m.as_str().to_string());

    let stripped = STYLE_TAG_REGEX.replace_all(text, "");
    let stripped = ASS_BLOCK_REGEX.replace_all(&stripped, "");
    let stripped = stripped.trim();

    match position {
        Some(tag) => format!("{}{}", tag, stripped),
        None => stripped.to_string(),
    }
}

/// Rewrap text so no line exceeds `max_line_length` characters
///
/// Text whose lines already fit is returned unchanged. A single word longer
/// than the limit gets a line of its own. A limit of 0 disables rewrapping.
pub fn rewrap(text: &str, max_line_length: usize) -> String {
    if max_line_length == 0 || text.lines().all(|line| line.chars().count() <= max_line_length) {
        return text.to_string();
    }

    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        let needed = if current.is_empty() {
            word.chars().count()
        } else {
            current.chars().count() + 1 + word.chars().count()
        };

        if needed > max_line_length && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }

    lines.join("\n")
}

/// Put back a position tag the translation dropped
pub fn preserve_position_tags(original: &str, translated: &str) -> String {
    match POSITION_TAG_REGEX.find(original) {
        Some(tag) if !translated.contains(tag.as_str()) && !translated.starts_with('{') => {
            format!("{}{}", tag.as_str(), translated)
        }
        _ => translated.to_string(),
    }
}

/// Restore the line count of a multi-line source when the translation
/// came back as one line, splitting proportionally to the source lines
pub fn preserve_line_breaks(original: &str, translated: &str) -> String {
    let original_lines: Vec<&str> = original.lines().collect();
    if original_lines.len() <= 1 || translated.lines().count() != 1 {
        return translated.to_string();
    }

    let total_original: usize = original_lines.iter().map(|l| l.chars().count()).sum();
    if total_original == 0 {
        return translated.to_string();
    }

    let words: Vec<&str> = translated.split_whitespace().collect();
    let total_translated: usize = translated.chars().count();
    let mut lines: Vec<String> = Vec::with_capacity(original_lines.len());
    let mut current = String::new();
    let mut boundary_index = 0;
    let mut consumed = 0usize;
    let mut target =
        original_lines[0].chars().count() * total_translated / total_original;

    for word in words {
        if !current.is_empty()
            && consumed >= target
            && boundary_index + 1 < original_lines.len()
        {
            lines.push(std::mem::take(&mut current));
            boundary_index += 1;
            target += original_lines[boundary_index].chars().count() * total_translated / total_original;
        }
        if !current.is_empty() {
            current.push(' ');
            consumed += 1;
        }
        current.push_str(word);
        consumed += word.chars().count();
    }
    if !current.is_empty() {
        lines.push(current);
    }

    lines.join("\n")
}
