use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::detect::{
    calculate_chinese_ideograph_ratio, calculate_chinese_ratio, chinese_chars_in,
    has_chinese_metadata,
};
use crate::placeholders::ANY_MATHLIKE_TOKEN_RE;

pub const CHINESE_RATIO_THRESHOLD: f64 = 0.005;
pub const MIN_BODY_LENGTH: usize = 500;
const SCORE_DECAY_PER_ISSUE: f64 = 0.2;

// OCR residue of rasterized library watermarks: the brand letters survive as
// stray single-letter tokens ("C N K I"). Whole words like "CNKI" are a valid
// citation and must not match.
static WATERMARK_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        (
            "cnki",
            Regex::new(r"(?i)\bC\s+N\s+K\s+I\b").expect("cnki watermark regex"),
        ),
        (
            "wanfang",
            Regex::new(r"(?i)\bW\s+A\s+N\s+F\s+A\s+N\s+G\b").expect("wanfang watermark regex"),
        ),
    ]
});

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TranslationCandidate {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, rename = "abstract")]
    pub abstract_text: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QaStatus {
    Pass,
    // Single flagged bucket regardless of trigger; the issues list carries the
    // actual reasons. Kept coarse on purpose.
    FlagChinese,
}

#[derive(Clone, Debug, Serialize)]
pub struct QaResult {
    pub status: QaStatus,
    pub score: f64,
    pub chinese_ratio: f64,
    pub chinese_ideograph_ratio: f64,
    pub chinese_chars: Vec<char>,
    pub issues: Vec<String>,
    pub flagged_fields: Vec<String>,
}

impl QaResult {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.status == QaStatus::Pass
    }

    #[must_use]
    pub fn render_block(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "QA: status={:?} score={:.2} zh_ratio={:.4} zh_ideograph_ratio={:.4}\n",
            self.status, self.score, self.chinese_ratio, self.chinese_ideograph_ratio
        ));
        if !self.flagged_fields.is_empty() {
            out.push_str("- fields: ");
            out.push_str(&self.flagged_fields.join(" | "));
            out.push('\n');
        }
        if !self.issues.is_empty() {
            out.push_str("- issues: ");
            out.push_str(&self.issues.join(" | "));
            out.push('\n');
        }
        if !self.chinese_chars.is_empty() {
            out.push_str("- chars: ");
            out.extend(self.chinese_chars.iter().take(40));
            out.push('\n');
        }
        out.trim_end().to_string()
    }
}

/// All checks run; nothing short-circuits. Missing fields count as empty.
#[must_use]
pub fn run_quality_gate(candidate: &TranslationCandidate) -> QaResult {
    let title = candidate.title.as_deref().unwrap_or("");
    let abstract_text = candidate.abstract_text.as_deref().unwrap_or("");
    let body = candidate.body.as_deref().unwrap_or("");

    let fields: [(&str, &str); 3] = [
        ("title", title),
        ("abstract", abstract_text),
        ("body", body),
    ];
    let combined = format!("{title}{abstract_text}{body}");

    let chinese_ratio = calculate_chinese_ratio(&combined);
    let chinese_ideograph_ratio = calculate_chinese_ideograph_ratio(&combined);
    let chinese_chars = chinese_chars_in(&combined);

    let mut issues: Vec<String> = Vec::new();
    let mut flagged_fields: Vec<String> = Vec::new();
    fn flag_field(name: &str, flagged: &mut Vec<String>) {
        if !flagged.iter().any(|f| f == name) {
            flagged.push(name.to_string());
        }
    }

    if chinese_ratio > CHINESE_RATIO_THRESHOLD {
        issues.push(format!(
            "Chinese residue ratio {chinese_ratio:.4} exceeds {CHINESE_RATIO_THRESHOLD}"
        ));
        for (name, text) in fields {
            if calculate_chinese_ratio(text) > CHINESE_RATIO_THRESHOLD {
                flag_field(name, &mut flagged_fields);
            }
        }
    }

    let mut metadata_fields: Vec<&str> = Vec::new();
    for (name, text) in fields {
        if has_chinese_metadata(text) {
            metadata_fields.push(name);
            flag_field(name, &mut flagged_fields);
        }
    }
    if !metadata_fields.is_empty() {
        issues.push(format!(
            "Chinese metadata marker in {}",
            metadata_fields.join(",")
        ));
    }

    if body.chars().count() < MIN_BODY_LENGTH {
        issues.push("Body too short".to_string());
        flag_field("body", &mut flagged_fields);
    }

    for (name, re) in WATERMARK_PATTERNS.iter() {
        if re.is_match(body) {
            issues.push(format!("Watermark artifact detected: {name}"));
            flag_field("body", &mut flagged_fields);
        }
    }

    if ANY_MATHLIKE_TOKEN_RE.is_match(body) {
        issues.push("Unreplaced math placeholder".to_string());
        flag_field("body", &mut flagged_fields);
    }

    let score = (1.0 - SCORE_DECAY_PER_ISSUE * issues.len() as f64).max(0.0);
    let status = if issues.is_empty() {
        QaStatus::Pass
    } else {
        QaStatus::FlagChinese
    };

    QaResult {
        status,
        score,
        chinese_ratio,
        chinese_ideograph_ratio,
        chinese_chars,
        issues,
        flagged_fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placeholders::math_token;

    fn clean_candidate() -> TranslationCandidate {
        TranslationCandidate {
            id: "paper-001".to_string(),
            title: Some("A Method for Robust Channel Estimation".to_string()),
            abstract_text: Some(
                "We propose an estimator that tolerates heavy-tailed noise.".to_string(),
            ),
            body: Some("The estimator converges under mild assumptions. ".repeat(20)),
        }
    }

    #[test]
    fn clean_english_candidate_passes() {
        let result = run_quality_gate(&clean_candidate());
        assert_eq!(result.status, QaStatus::Pass);
        assert_eq!(result.score, 1.0);
        assert_eq!(result.chinese_ratio, 0.0);
        assert!(result.issues.is_empty());
        assert!(result.flagged_fields.is_empty());
        assert!(result.chinese_chars.is_empty());
    }

    #[test]
    fn single_metadata_marker_flags_even_below_ratio_threshold() {
        let mut candidate = clean_candidate();
        let body = candidate.body.take().unwrap_or_default();
        candidate.body = Some(format!("{body}收稿日期"));
        let result = run_quality_gate(&candidate);
        // 4 ideographs in ~900 chars stays under 0.5%, the marker still flags.
        assert!(result.chinese_ratio <= CHINESE_RATIO_THRESHOLD);
        assert!(result.chinese_ratio > 0.0);
        assert_eq!(result.status, QaStatus::FlagChinese);
        assert!(result.flagged_fields.contains(&"body".to_string()));
    }

    #[test]
    fn heavy_residue_flags_the_offending_field_only() {
        let mut candidate = clean_candidate();
        candidate.title = Some("信道估计的鲁棒方法".to_string());
        let result = run_quality_gate(&candidate);
        assert_eq!(result.status, QaStatus::FlagChinese);
        assert!(result.chinese_ratio > CHINESE_RATIO_THRESHOLD);
        assert!(result.flagged_fields.contains(&"title".to_string()));
        assert!(!result.flagged_fields.contains(&"body".to_string()));
        assert!(!result.chinese_chars.is_empty());
    }

    #[test]
    fn short_body_always_raises_the_length_issue() {
        let mut candidate = clean_candidate();
        candidate.body = Some("Too short.".to_string());
        let result = run_quality_gate(&candidate);
        assert!(result.issues.iter().any(|i| i == "Body too short"));
        assert_eq!(result.status, QaStatus::FlagChinese);
    }

    #[test]
    fn missing_fields_are_treated_as_empty() {
        let candidate = TranslationCandidate {
            id: "paper-002".to_string(),
            title: None,
            abstract_text: None,
            body: None,
        };
        let result = run_quality_gate(&candidate);
        // Effectively-empty documents flag via body length, not via a panic.
        assert_eq!(result.status, QaStatus::FlagChinese);
        assert!(result.issues.iter().any(|i| i == "Body too short"));
        assert_eq!(result.chinese_ratio, 0.0);
    }

    #[test]
    fn watermark_letters_are_detected_but_citation_is_not() {
        let mut candidate = clean_candidate();
        let body = candidate.body.take().unwrap_or_default();
        candidate.body = Some(format!("{body} C N K I "));
        let result = run_quality_gate(&candidate);
        assert!(result
            .issues
            .iter()
            .any(|i| i.starts_with("Watermark artifact")));

        let mut cited = clean_candidate();
        let body = cited.body.take().unwrap_or_default();
        cited.body = Some(format!("{body} retrieved from the CNKI database"));
        assert_eq!(run_quality_gate(&cited).status, QaStatus::Pass);
    }

    #[test]
    fn unresolved_math_placeholder_flags() {
        let mut candidate = clean_candidate();
        let body = candidate.body.take().unwrap_or_default();
        candidate.body = Some(format!("{body} where {} holds", math_token(3)));
        let result = run_quality_gate(&candidate);
        assert!(result
            .issues
            .iter()
            .any(|i| i == "Unreplaced math placeholder"));
    }

    #[test]
    fn score_decreases_with_each_distinct_issue_and_floors_at_zero() {
        let one_issue = {
            let mut c = clean_candidate();
            c.body = Some("short".to_string());
            run_quality_gate(&c)
        };
        assert!((one_issue.score - 0.8).abs() < 1e-9);

        let many_issues = run_quality_gate(&TranslationCandidate {
            id: "paper-003".to_string(),
            title: Some("摘要".to_string()),
            abstract_text: None,
            body: Some(format!("中文正文 C N K I {}", math_token(1))),
        });
        assert!(many_issues.score < one_issue.score);
        assert!(many_issues.score >= 0.0);
    }
}
