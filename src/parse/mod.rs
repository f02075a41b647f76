//! HTML field-extraction helpers.
//!
//! Pure functions invoked by the evasion and fetch layers. They own no
//! state; every function takes raw page content and returns the extracted
//! field or `None`.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};

static SAFEID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"safeid\s*=\s*['"]([^'"]+)['"]"#).expect("invalid safeid regex")
});

/// Size patterns ordered from strongest to weakest fingerprint. Each pattern
/// captures the numeric value and the unit letter (G or M).
static SIZE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // Labelled sizes ("文件大小: 4.2GB", "Size: 800M").
        r"(?i)(?:文件大小|Size|容量|影片大小)[\s：:]*(\d+(?:\.\d+)?)\s*(G|M)B?",
        // Bracket-wrapped sizes ("[4.2G]", "【800MB】").
        r"(?i)[【\[]\s*(\d+(?:\.\d+)?)\s*(G|M)B?\s*[】\]]",
        // Bare sizes with a trailing B, required to avoid matching years.
        r"(?i)(\d+(?:\.\d+)?)\s*(G|M)B",
        // Last resort: digits followed by G/M and no further word character.
        r"(?i)(\d+(?:\.\d+)?)\s*(G|M)(?:[^\w]|$)",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("invalid size regex"))
    .collect()
});

static TITLE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("head > title").expect("invalid title selector"));

static SCRIPT_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("script").expect("invalid script selector"));

/// Extract the `<head><title>` text from a page, empty string when absent.
pub fn page_title(html: &str) -> String {
    let document = Html::parse_document(html);
    document
        .select(&TITLE_SELECTOR)
        .next()
        .map(|node| node.text().collect::<String>().trim().to_string())
        .unwrap_or_default()
}

/// Scan embedded script content for the age-verification token assignment
/// (`safeid = "..."`) and return the token.
pub fn extract_safeid(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    for script in document.select(&SCRIPT_SELECTOR) {
        let text = script.text().collect::<String>();
        if !text.contains("safeid") {
            continue;
        }
        if let Some(captures) = SAFEID_RE.captures(&text) {
            return Some(captures[1].to_string());
        }
    }
    None
}

/// Run the cascade of size patterns over rendered page text and return the
/// first match converted to megabytes.
pub fn extract_video_size(text: &str) -> Option<u64> {
    for (index, pattern) in SIZE_PATTERNS.iter().enumerate() {
        let Some(captures) = pattern.captures(text) else {
            continue;
        };
        let Ok(value) = captures[1].parse::<f64>() else {
            log::debug!("size pattern {} matched but value did not parse", index + 1);
            continue;
        };
        let megabytes = match captures[2].to_ascii_uppercase().as_str() {
            "G" => (value * 1024.0) as u64,
            "M" => value as u64,
            _ => continue,
        };
        log::debug!(
            "size pattern {} matched: {}{} -> {}MB",
            index + 1,
            value,
            &captures[2],
            megabytes
        );
        return Some(megabytes);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_title() {
        let html = "<html><head><title> Discuz! Board </title></head><body></body></html>";
        assert_eq!(page_title(html), "Discuz! Board");
    }

    #[test]
    fn missing_title_is_empty() {
        assert_eq!(page_title("<html><body>no head</body></html>"), "");
    }

    #[test]
    fn extracts_safeid_from_script() {
        let html = r#"
            <html><head><title>18+</title></head><body>
            <script>var tracker = 1;</script>
            <script>var safeid = 'a1b2c3d4'; document.cookie = '_safe=' + safeid;</script>
            </body></html>
        "#;
        assert_eq!(extract_safeid(html).as_deref(), Some("a1b2c3d4"));
    }

    #[test]
    fn safeid_absent_returns_none() {
        let html = "<html><body><script>var other = 'x';</script></body></html>";
        assert!(extract_safeid(html).is_none());
    }

    #[test]
    fn labelled_size_wins_over_weaker_patterns() {
        let text = "发布于 2024 文件大小: 4.5GB 其他 800M";
        assert_eq!(extract_video_size(text), Some(4608));
    }

    #[test]
    fn bracket_size_matches() {
        assert_eq!(extract_video_size("[2.3G] 标题"), Some(2355));
    }

    #[test]
    fn megabyte_size_matches() {
        assert_eq!(extract_video_size("总共 750MB 高清"), Some(750));
    }

    #[test]
    fn year_is_not_a_size() {
        assert!(extract_video_size("published in 2024, no size here").is_none());
    }
}
