//! Weighted-category relevance scoring.
//!
//! Each category contributes its weight at most once per record, and only when
//! one of its patterns matches and none of its exclusions do. The summed weight
//! is divided by a per-deployment normalization constant and capped at 1.0, so
//! confidences stay comparable across records and runs.

use crate::config::{ClassifierConfig, ConfigError};
use crate::models::{ClassificationResult, RecordPayload};
use regex::{Regex, RegexBuilder};

#[derive(Debug)]
struct CompiledCategory {
    name: String,
    weight: f64,
    include: Regex,
    exclude: Option<Regex>,
}

impl CompiledCategory {
    fn matches(&self, text: &str) -> bool {
        self.include.is_match(text) && !self.exclude.as_ref().is_some_and(|ex| ex.is_match(text))
    }
}

#[derive(Debug)]
pub struct Classifier {
    categories: Vec<CompiledCategory>,
    normalization_constant: f64,
    min_confidence: f64,
}

/// One case-insensitive alternation per pattern list; substrings are escaped.
fn compile_patterns(
    name: &str,
    patterns: &[String],
    regex: bool,
) -> Result<Regex, ConfigError> {
    let alternation = patterns
        .iter()
        .map(|p| {
            if regex {
                format!("(?:{p})")
            } else {
                regex::escape(p)
            }
        })
        .collect::<Vec<_>>()
        .join("|");

    RegexBuilder::new(&alternation)
        .case_insensitive(true)
        .build()
        .map_err(|source| ConfigError::InvalidPattern {
            name: name.to_string(),
            source,
        })
}

impl Classifier {
    pub fn new(config: &ClassifierConfig) -> Result<Self, ConfigError> {
        if config.categories.is_empty() {
            return Err(ConfigError::NoCategories);
        }
        if !config.normalization_constant.is_finite() || config.normalization_constant <= 0.0 {
            return Err(ConfigError::InvalidNormalization(
                config.normalization_constant,
            ));
        }

        let mut categories = Vec::with_capacity(config.categories.len());
        for cat in &config.categories {
            let weight = cat
                .weight
                .ok_or_else(|| ConfigError::MissingWeight(cat.name.clone()))?;
            if cat.patterns.is_empty() {
                return Err(ConfigError::NoPatterns(cat.name.clone()));
            }
            let include = compile_patterns(&cat.name, &cat.patterns, cat.regex)?;
            let exclude = if cat.exclusions.is_empty() {
                None
            } else {
                Some(compile_patterns(&cat.name, &cat.exclusions, cat.regex)?)
            };
            categories.push(CompiledCategory {
                name: cat.name.clone(),
                weight,
                include,
                exclude,
            });
        }

        Ok(Self {
            categories,
            normalization_constant: config.normalization_constant,
            min_confidence: config.min_confidence,
        })
    }

    /// Scores free text. Pure: identical text always yields an identical result.
    pub fn classify_text(&self, text: &str, entity_name_raw: Option<String>) -> ClassificationResult {
        let mut accumulator = 0.0;
        let mut matched_reasons = Vec::new();

        for cat in &self.categories {
            if cat.matches(text) {
                accumulator += cat.weight;
                matched_reasons.push(cat.name.clone());
            }
        }

        if matched_reasons.is_empty() {
            return ClassificationResult::irrelevant(entity_name_raw);
        }

        let confidence = (accumulator / self.normalization_constant).min(1.0);
        ClassificationResult {
            is_relevant: confidence >= self.min_confidence,
            confidence,
            matched_reasons,
            entity_name_raw,
        }
    }

    pub fn classify(
        &self,
        payload: &RecordPayload,
        text_fields: &[String],
        name_field: Option<&str>,
    ) -> ClassificationResult {
        let text = payload.searchable_text(text_fields);
        let name = name_field
            .and_then(|f| payload.field(f))
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        self.classify_text(&text, name)
    }

    pub fn category_names(&self) -> impl Iterator<Item = &str> {
        self.categories.iter().map(|c| c.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CategoryConfig;
    use serde_json::json;

    fn category(name: &str, weight: f64, patterns: &[&str], exclusions: &[&str]) -> CategoryConfig {
        CategoryConfig {
            name: name.to_string(),
            weight: Some(weight),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            exclusions: exclusions.iter().map(|p| p.to_string()).collect(),
            regex: false,
        }
    }

    fn classifier(categories: Vec<CategoryConfig>, norm: f64) -> Classifier {
        Classifier::new(&ClassifierConfig {
            normalization_constant: norm,
            min_confidence: 0.0,
            categories,
        })
        .unwrap()
    }

    fn shipping() -> Classifier {
        classifier(
            vec![
                category("explicit_mentions", 0.6, &["china shipping development"], &[]),
                category("state_owned", 0.5, &["cosco"], &[]),
            ],
            1.0,
        )
    }

    #[test]
    fn no_match_is_irrelevant_with_zero_confidence() {
        let r = shipping().classify_text("Maersk Line", None);
        assert!(!r.is_relevant);
        assert_eq!(r.confidence, 0.0);
        assert!(r.matched_reasons.is_empty());
    }

    #[test]
    fn weights_sum_and_cap_at_one() {
        let r = shipping().classify_text("COSCO / China Shipping Development Co", None);
        assert!(r.is_relevant);
        assert_eq!(r.confidence, 1.0);
        assert_eq!(r.matched_reasons, vec!["explicit_mentions", "state_owned"]);
    }

    #[test]
    fn category_weight_counts_once_for_multiple_patterns() {
        let c = classifier(
            vec![category("offshore", 0.3, &["cayman", "bermuda", "jersey"], &[])],
            1.0,
        );
        let r = c.classify_text("Cayman holding with Bermuda and Jersey branches", None);
        assert!((r.confidence - 0.3).abs() < 1e-12);
        assert_eq!(r.matched_reasons, vec!["offshore"]);
    }

    #[test]
    fn exclusion_suppresses_category() {
        let c = classifier(
            vec![
                category("country", 0.4, &["chinese"], &["chinese american bank"]),
                category("tech", 0.2, &["semiconductor"], &[]),
            ],
            1.0,
        );
        let r = c.classify_text("Chinese American Bank semiconductor loan", None);
        assert_eq!(r.matched_reasons, vec!["tech"]);
        assert!((r.confidence - 0.2).abs() < 1e-12);
    }

    #[test]
    fn normalization_constant_scales_confidence() {
        let c = classifier(vec![category("a", 0.5, &["alpha"], &[])], 2.0);
        assert!((c.classify_text("ALPHA", None).confidence - 0.25).abs() < 1e-12);
    }

    #[test]
    fn confidence_is_monotone_in_matched_categories() {
        let c = classifier(
            vec![
                category("a", 0.2, &["alpha"], &[]),
                category("b", 0.3, &["beta"], &[]),
                category("c", 0.9, &["gamma"], &[]),
            ],
            1.0,
        );
        let one = c.classify_text("alpha", None).confidence;
        let two = c.classify_text("alpha beta", None).confidence;
        let three = c.classify_text("alpha beta gamma", None).confidence;
        assert!(one <= two && two <= three);
        assert_eq!(three, 1.0);
    }

    #[test]
    fn substring_patterns_are_literal() {
        let c = classifier(vec![category("dots", 0.5, &["a.b"], &[])], 1.0);
        assert!(!c.classify_text("axb", None).is_relevant);
        assert!(c.classify_text("A.B", None).is_relevant);
    }

    #[test]
    fn regex_patterns_are_supported() {
        let mut cat = category("id", 0.5, &[r"\bhs\s*8542\b"], &[]);
        cat.regex = true;
        let c = classifier(vec![cat], 1.0);
        assert!(c.classify_text("Tariff HS 8542 chips", None).is_relevant);
        assert!(!c.classify_text("HS 85420", None).is_relevant);
    }

    #[test]
    fn invalid_regex_is_a_config_error() {
        let mut cat = category("bad", 0.5, &["(unclosed"], &[]);
        cat.regex = true;
        let err = Classifier::new(&ClassifierConfig {
            normalization_constant: 1.0,
            min_confidence: 0.0,
            categories: vec![cat],
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }

    #[test]
    fn min_confidence_gates_relevance() {
        let c = Classifier::new(&ClassifierConfig {
            normalization_constant: 1.0,
            min_confidence: 0.5,
            categories: vec![category("weak", 0.2, &["weak"], &[])],
        })
        .unwrap();
        let r = c.classify_text("weak signal", None);
        assert!(!r.is_relevant);
        assert_eq!(r.matched_reasons, vec!["weak"]);
    }

    #[test]
    fn classify_payload_extracts_entity_name() {
        let payload = RecordPayload::Json(json!({
            "name": "  COSCO Shipping Lines  ",
            "description": "container carrier"
        }));
        let fields = vec!["name".to_string(), "description".to_string()];
        let r = shipping().classify(&payload, &fields, Some("name"));
        assert_eq!(r.entity_name_raw.as_deref(), Some("COSCO Shipping Lines"));
        assert_eq!(r.matched_reasons, vec!["state_owned"]);
    }

    #[test]
    fn classification_is_deterministic() {
        let c = shipping();
        let text = "cosco and china shipping development";
        assert_eq!(c.classify_text(text, None), c.classify_text(text, None));
    }

    #[test]
    fn category_names_follow_config_order() {
        let classifier = shipping();
        let names: Vec<&str> = classifier.category_names().collect();
        assert_eq!(names, vec!["explicit_mentions", "state_owned"]);
    }
}
