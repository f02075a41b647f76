//! Block-page detection.
//!
//! A response is classified by its page title against the healthy-site
//! marker list, in a fixed order: challenge interstitial first, then the
//! age gate, then the marker check. Anything left over is a suspect page
//! that the engine may try to recover with the desktop fallback.

use url::Url;

/// Title fragment identifying the bot-challenge interstitial.
pub const CHALLENGE_TITLE_MARKER: &str = "Just a moment";

/// Body fragment identifying the age-verification gate.
pub const AGE_GATE_BODY_MARKER: &str = "var safeid";

/// Query flag requesting the mobile rendering of a page.
const MOBILE_FLAG: (&str, &str) = ("mobile", "2");

/// Outcome of classifying one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageClass {
    /// Title carries a healthy-site marker.
    Healthy,
    /// Bot-challenge interstitial.
    ChallengeInterstitial,
    /// Age-verification gate embedded in the body.
    AgeGate,
    /// None of the above; candidate for the desktop fallback.
    Suspect { title: String },
}

/// Classify a page. Check order matters and is load-bearing: the challenge
/// interstitial carries no marker, and an age-gated page may still contain
/// marker text in its title.
pub fn classify(title: &str, body: &str, markers: &[String]) -> PageClass {
    if title.contains(CHALLENGE_TITLE_MARKER) {
        return PageClass::ChallengeInterstitial;
    }
    if body.contains(AGE_GATE_BODY_MARKER) {
        return PageClass::AgeGate;
    }
    if title_matches(title, markers) {
        return PageClass::Healthy;
    }
    PageClass::Suspect {
        title: title.to_string(),
    }
}

/// Whether a title carries any healthy-site marker.
pub fn title_matches(title: &str, markers: &[String]) -> bool {
    markers.iter().any(|marker| title.contains(marker))
}

/// A bare listing URL (forum.php with no mode qualifier) that failed the
/// marker check is a known non-recoverable interception; the fallback never
/// rescues it.
pub fn is_bare_listing(url: &Url) -> bool {
    url.path().ends_with("forum.php")
        && !url
            .query_pairs()
            .any(|(name, _)| name == "mod")
}

/// Strip the mobile-mode query flag so the URL requests the desktop
/// rendering.
pub fn to_desktop_url(url: &Url) -> Url {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, value)| !(name == MOBILE_FLAG.0 && value == MOBILE_FLAG.1))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();

    let mut desktop = url.clone();
    if kept.is_empty() {
        desktop.set_query(None);
    } else {
        desktop
            .query_pairs_mut()
            .clear()
            .extend_pairs(kept.iter().map(|(n, v)| (n.as_str(), v.as_str())));
    }
    desktop
}

/// Home page on the same origin, used as the laundering target before a
/// desktop re-issue.
pub fn launder_url(url: &Url) -> Option<Url> {
    url.join("/forum.php").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers() -> Vec<String> {
        vec!["forum".to_string(), "Discuz".to_string()]
    }

    #[test]
    fn challenge_wins_over_age_gate_and_marker() {
        let class = classify(
            "Just a moment...",
            "<script>var safeid = 'x';</script>",
            &markers(),
        );
        assert_eq!(class, PageClass::ChallengeInterstitial);
    }

    #[test]
    fn age_gate_wins_over_marker() {
        let class = classify(
            "Discuz! Board",
            "<script>var safeid = 'x';</script>",
            &markers(),
        );
        assert_eq!(class, PageClass::AgeGate);
    }

    #[test]
    fn marker_title_is_healthy() {
        assert_eq!(
            classify("Some forum - index", "<html/>", &markers()),
            PageClass::Healthy
        );
    }

    #[test]
    fn unmatched_title_is_suspect() {
        let class = classify("每日名言", "<html/>", &markers());
        assert_eq!(
            class,
            PageClass::Suspect {
                title: "每日名言".to_string()
            }
        );
    }

    #[test]
    fn bare_listing_detection() {
        let bare = Url::parse("https://example.com/forum.php").unwrap();
        let with_mode = Url::parse("https://example.com/forum.php?mod=viewthread&tid=1").unwrap();
        let other = Url::parse("https://example.com/thread-1-1-1.html").unwrap();
        assert!(is_bare_listing(&bare));
        assert!(!is_bare_listing(&with_mode));
        assert!(!is_bare_listing(&other));
    }

    #[test]
    fn desktop_url_strips_only_mobile_flag() {
        let url =
            Url::parse("https://example.com/forum.php?mod=viewthread&tid=42&mobile=2").unwrap();
        let desktop = to_desktop_url(&url);
        assert_eq!(
            desktop.as_str(),
            "https://example.com/forum.php?mod=viewthread&tid=42"
        );

        let only_flag = Url::parse("https://example.com/forum.php?mobile=2").unwrap();
        assert_eq!(
            to_desktop_url(&only_flag).as_str(),
            "https://example.com/forum.php"
        );
    }

    #[test]
    fn launder_url_is_same_origin_home() {
        let url = Url::parse("https://example.com/forum.php?mod=forumdisplay&fid=2").unwrap();
        assert_eq!(
            launder_url(&url).unwrap().as_str(),
            "https://example.com/forum.php"
        );
    }
}
