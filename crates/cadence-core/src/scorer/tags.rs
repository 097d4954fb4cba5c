//! In-band tags carried by generated replies
//!
//! - `[<Name> Score: 62.5/100]` proposes a new headline score
//! - `[Relations: Trust=40, Closeness=55]` proposes dimension targets (any subset)
//! - `[Signals: support=0.6, rude=0.1]` reports signal strengths in `[0, 1]` (any subset)
//!
//! Parsing is fail-soft: a missing or malformed tag yields the caller's default.

use super::stage::Signals;
use once_cell::sync::Lazy;
use regex::Regex;

static SCORE_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\[(?:[\w ]+ )?Score:\s*(\d{1,3}(?:\.\d{1,2})?)\s*/\s*100\s*\]")
        .expect("score tag regex is valid")
});

static ANY_SCORE_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\[(?:[\w ]+ )?Score:[^\]]*\]").expect("score tag regex is valid")
});

static RELATIONS_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)\[Relations:([^\]]*)\]").expect("relations tag regex is valid"));

static RELATION_PAIR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(trust|closeness|attraction|safety)\s*=\s*(\d{1,3}(?:\.\d+)?)")
        .expect("relation pair regex is valid")
});

static SIGNALS_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)\[Signals:([^\]]*)\]").expect("signals tag regex is valid"));

static SIGNAL_PAIR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b([a-z_]+)\s*=\s*(\d+(?:\.\d+)?)").expect("signal pair regex is valid")
});

/// Dimension targets found in a `[Relations: ...]` tag
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DimensionTargets {
    pub trust: Option<f64>,
    pub closeness: Option<f64>,
    pub attraction: Option<f64>,
    pub safety: Option<f64>,
}

impl DimensionTargets {
    pub fn is_empty(&self) -> bool {
        self.trust.is_none() && self.closeness.is_none() && self.attraction.is_none() && self.safety.is_none()
    }
}

/// Score proposed by the last well-formed score tag
pub fn find_score(text: &str) -> Option<f64> {
    SCORE_TAG
        .captures_iter(text)
        .last()
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|score| (0.0..=100.0).contains(score))
}

/// [`find_score`], falling back to `default`
pub fn extract_score(text: &str, default: f64) -> f64 {
    find_score(text).unwrap_or(default)
}

/// Dimension targets from the last relations tag; values above 100 are dropped
pub fn extract_dimensions(text: &str) -> DimensionTargets {
    let Some(body) = RELATIONS_TAG
        .captures_iter(text)
        .last()
        .and_then(|caps| caps.get(1))
    else {
        return DimensionTargets::default();
    };

    let mut targets = DimensionTargets::default();
    for caps in RELATION_PAIR.captures_iter(body.as_str()) {
        let Some(value) = caps[2].parse::<f64>().ok().filter(|v| (0.0..=100.0).contains(v)) else {
            continue;
        };
        match caps[1].to_ascii_lowercase().as_str() {
            "trust" => targets.trust = Some(value),
            "closeness" => targets.closeness = Some(value),
            "attraction" => targets.attraction = Some(value),
            "safety" => targets.safety = Some(value),
            _ => {}
        }
    }
    targets
}

/// Signals from the last signals tag; unknown names and values above 1 are dropped
pub fn extract_signals(text: &str) -> Signals {
    let mut sig = Signals::default();
    let Some(body) = SIGNALS_TAG.captures_iter(text).last().and_then(|caps| caps.get(1)) else {
        return sig;
    };

    for caps in SIGNAL_PAIR.captures_iter(body.as_str()) {
        let Some(value) = caps[2].parse::<f64>().ok().filter(|v| (0.0..=1.0).contains(v)) else {
            continue;
        };
        let slot = match caps[1].to_ascii_lowercase().as_str() {
            "support" => &mut sig.support,
            "affection" => &mut sig.affection,
            "flirt" => &mut sig.flirt,
            "respect" => &mut sig.respect,
            "apology" => &mut sig.apology,
            "rude" => &mut sig.rude,
            "boundary_push" => &mut sig.boundary_push,
            "dislike" => &mut sig.dislike,
            "hate" => &mut sig.hate,
            "threat" => &mut sig.threat,
            "rejecting" => &mut sig.rejecting,
            "insult" => &mut sig.insult,
            _ => continue,
        };
        *slot = value;
    }
    sig
}

/// Reply text with every score, relations and signals tag removed
pub fn strip_tags(text: &str) -> String {
    let without_scores = ANY_SCORE_TAG.replace_all(text, "");
    let without_relations = RELATIONS_TAG.replace_all(&without_scores, "");
    let stripped = SIGNALS_TAG.replace_all(&without_relations, "");
    stripped.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_score() {
        assert_eq!(extract_score("nice! [Lollity Score: 62.5/100]", 50.0), 62.5);
        assert_eq!(extract_score("[Score: 71.25/100]", 50.0), 71.25);
        assert_eq!(extract_score("ok [score: 40 / 100]", 50.0), 40.0);
    }

    #[test]
    fn test_extract_score_fail_soft() {
        assert_eq!(extract_score("no tag here", 33.0), 33.0);
        assert_eq!(extract_score("[Lollity Score: abc/100]", 33.0), 33.0);
        assert_eq!(extract_score("[Lollity Score: 150/100]", 33.0), 33.0);
        assert_eq!(extract_score("[Lollity Score: 62.555/100]", 33.0), 33.0);
        assert_eq!(extract_score("", 33.0), 33.0);
    }

    #[test]
    fn test_last_score_tag_wins() {
        assert_eq!(extract_score("[Score: 10/100] then [Score: 20/100]", 0.0), 20.0);
    }

    #[test]
    fn test_extract_dimensions_subset() {
        let targets = extract_dimensions("hi [Relations: Trust=40, closeness = 55.5]");
        assert_eq!(targets.trust, Some(40.0));
        assert_eq!(targets.closeness, Some(55.5));
        assert_eq!(targets.attraction, None);
        assert_eq!(targets.safety, None);
    }

    #[test]
    fn test_extract_dimensions_ignores_out_of_range() {
        let targets = extract_dimensions("[Relations: Trust=400, Safety=80]");
        assert_eq!(targets.trust, None);
        assert_eq!(targets.safety, Some(80.0));
        assert!(extract_dimensions("nothing").is_empty());
    }

    #[test]
    fn test_extract_signals() {
        let sig = extract_signals("aw [Signals: support=0.6, Rude = 0.1, threat=3, mood=0.5]");
        assert_eq!(sig.support, 0.6);
        assert_eq!(sig.rude, 0.1);
        assert_eq!(sig.threat, 0.0);
        assert_eq!(extract_signals("no tag"), Signals::default());
    }

    #[test]
    fn test_strip_tags() {
        let reply = "See you soon! [Relations: Trust=40]\n[Lollity Score: 51/100]";
        assert_eq!(strip_tags(reply), "See you soon!");
        assert_eq!(strip_tags("plain"), "plain");
        // Malformed tags are stripped too
        assert_eq!(strip_tags("hey [Score: lots/100]"), "hey");
        assert_eq!(strip_tags("sure [Signals: support=0.4]"), "sure");
    }
}
