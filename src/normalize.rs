use crate::config::NormalizerConfig;
use crate::models::{CanonicalEntity, ClassificationResult};
use rustc_hash::{FxHashMap, FxHashSet};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Maps free-text entity names to deduplication keys.
#[derive(Debug, Clone)]
pub struct Normalizer {
    legal_suffixes: FxHashSet<String>,
}

impl Normalizer {
    pub fn new(config: &NormalizerConfig) -> Self {
        // Suffixes go through the same folding as names so "GmbH" and "Co." work as written
        let legal_suffixes = config
            .legal_suffixes
            .iter()
            .map(|s| fold(s))
            .filter(|s| !s.is_empty() && !s.contains(' '))
            .collect();
        Self { legal_suffixes }
    }

    /// Returns `None` when nothing meaningful survives normalization.
    ///
    /// The key depends only on the name text: NFKD, combining marks dropped,
    /// lowercased, punctuation removed, whitespace collapsed, and legal-suffix
    /// tokens stripped from both ends (the last token is always kept).
    pub fn canonical_key(&self, raw: &str) -> Option<String> {
        let folded = fold(raw);
        let mut tokens: Vec<&str> = folded.split_whitespace().collect();

        while tokens.len() > 1 && self.legal_suffixes.contains(tokens[tokens.len() - 1]) {
            tokens.pop();
        }
        let lead = tokens
            .iter()
            .take(tokens.len().saturating_sub(1))
            .take_while(|t| self.legal_suffixes.contains(**t))
            .count();

        let key = tokens[lead..].join(" ");
        if key.is_empty() {
            None
        } else {
            Some(key)
        }
    }
}

fn fold(raw: &str) -> String {
    raw.nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .filter(|c| !matches!(c, '.' | '\'' | '\u{2019}'))
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Per-unit entity registry. Merging is order-independent, so a unit
/// re-processed after a crash resolves to the same entities.
#[derive(Debug)]
pub struct Deduplicator<'a> {
    normalizer: &'a Normalizer,
    entities: FxHashMap<String, CanonicalEntity>,
}

impl<'a> Deduplicator<'a> {
    pub fn new(normalizer: &'a Normalizer) -> Self {
        Self {
            normalizer,
            entities: FxHashMap::default(),
        }
    }

    /// Records one sighting and returns its canonical key.
    pub fn observe(
        &mut self,
        raw_name: &str,
        result: &ClassificationResult,
        unit_id: &str,
    ) -> Option<String> {
        let key = self.normalizer.canonical_key(raw_name)?;
        let sighting = CanonicalEntity::new(key.clone(), raw_name, result, unit_id);
        self.entities
            .entry(key.clone())
            .and_modify(|existing| existing.merge(&sighting))
            .or_insert(sighting);
        Some(key)
    }

    pub fn get(&self, canonical_key: &str) -> Option<&CanonicalEntity> {
        self.entities.get(canonical_key)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Sorted by canonical key.
    pub fn entities(&self) -> Vec<&CanonicalEntity> {
        let mut out: Vec<_> = self.entities.values().collect();
        out.sort_by(|a, b| a.canonical_key.cmp(&b.canonical_key));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer() -> Normalizer {
        Normalizer::new(&NormalizerConfig::default())
    }

    fn hit(confidence: f64, reasons: &[&str]) -> ClassificationResult {
        ClassificationResult {
            is_relevant: true,
            confidence,
            matched_reasons: reasons.iter().map(|r| r.to_string()).collect(),
            entity_name_raw: None,
        }
    }

    #[test]
    fn huawei_variants_share_a_key() {
        let n = normalizer();
        let a = n.canonical_key("Huawei Technologies Co., Ltd.").unwrap();
        let b = n.canonical_key("HUAWEI TECHNOLOGIES CO LTD").unwrap();
        assert_eq!(a, "huawei technologies");
        assert_eq!(a, b);
    }

    #[test]
    fn diacritics_are_stripped() {
        let n = normalizer();
        assert_eq!(
            n.canonical_key("Société Générale S.A.").as_deref(),
            Some("societe generale")
        );
        assert_eq!(n.canonical_key("Müller GmbH").as_deref(), Some("muller"));
    }

    #[test]
    fn compatibility_forms_fold() {
        assert_eq!(normalizer().canonical_key("Ｚｔｅ Corp").as_deref(), Some("zte"));
    }

    #[test]
    fn leading_suffix_tokens_are_stripped() {
        assert_eq!(
            normalizer().canonical_key("Ltd. Orient Holdings").as_deref(),
            Some("orient holdings")
        );
    }

    #[test]
    fn suffixes_inside_the_name_are_kept() {
        assert_eq!(
            normalizer().canonical_key("Sinotrans & Co Logistics").as_deref(),
            Some("sinotrans co logistics")
        );
    }

    #[test]
    fn last_token_is_never_stripped() {
        assert_eq!(normalizer().canonical_key("Co., Ltd.").as_deref(), Some("co"));
    }

    #[test]
    fn empty_names_have_no_key() {
        assert_eq!(normalizer().canonical_key("  ... "), None);
        assert_eq!(normalizer().canonical_key(""), None);
    }

    #[test]
    fn configured_suffixes_are_folded() {
        let n = Normalizer::new(&NormalizerConfig {
            legal_suffixes: vec!["A.Ş.".to_string()],
        });
        assert_eq!(n.canonical_key("Tüpraş A.Ş.").as_deref(), Some("tupras"));
    }

    #[test]
    fn dedup_merges_in_any_order() {
        let n = normalizer();
        let names = [
            ("Huawei Technologies Co., Ltd.", 0.4, "u1"),
            ("HUAWEI TECHNOLOGIES CO LTD", 0.9, "u2"),
        ];

        let mut forward = Deduplicator::new(&n);
        for (name, conf, unit) in names {
            forward.observe(name, &hit(conf, &["a"]), unit);
        }
        let mut backward = Deduplicator::new(&n);
        for (name, conf, unit) in names.iter().rev() {
            backward.observe(name, &hit(*conf, &["a"]), unit);
        }

        assert_eq!(forward.len(), 1);
        let f = forward.get("huawei technologies").unwrap();
        let b = backward.get("huawei technologies").unwrap();
        assert_eq!(f, b);
        assert_eq!(f.variants.len(), 2);
        assert_eq!(f.aggregate_confidence, 0.9);
        assert_eq!(f.first_seen_unit, "u1");
    }

    #[test]
    fn aggregate_is_max_not_mean() {
        let n = normalizer();
        let mut d = Deduplicator::new(&n);
        d.observe("Acme", &hit(1.0, &["strong"]), "u");
        for _ in 0..10 {
            d.observe("ACME", &hit(0.1, &["weak"]), "u");
        }
        let e = d.get("acme").unwrap();
        assert_eq!(e.aggregate_confidence, 1.0);
        assert_eq!(e.matched_reasons.len(), 2);
    }

    #[test]
    fn entities_are_sorted() {
        let n = normalizer();
        let mut d = Deduplicator::new(&n);
        d.observe("Zeta", &hit(0.5, &["a"]), "u");
        d.observe("Alpha", &hit(0.5, &["a"]), "u");
        let keys: Vec<_> = d.entities().iter().map(|e| e.canonical_key.clone()).collect();
        assert_eq!(keys, vec!["alpha", "zeta"]);
    }
}
