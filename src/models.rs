use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// One independently resumable chunk of ingestion work.
///
/// `unit_id` must be derived from the source configuration alone so that
/// repeated runs enumerate the same units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub unit_id: String,
    pub source_name: String,
    pub discovered_at: DateTime<Utc>,
}

impl WorkUnit {
    pub fn new(source_name: impl Into<String>, unit_id: impl Into<String>) -> Self {
        Self {
            unit_id: unit_id.into(),
            source_name: source_name.into(),
            discovered_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_name: String,
    pub unit_id: String,
    /// `leaf:line`, `leaf[index]` or `leaf#n`
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum RecordPayload {
    Json(Value),
    /// Extracted XML fields by local name; `None` when the element was absent
    Xml(BTreeMap<String, Option<String>>),
}

impl RecordPayload {
    /// Looks up a string field. JSON selectors are pointers (`/a/b`) or bare
    /// top-level keys; numbers and booleans are not names and return `None`.
    pub fn field(&self, selector: &str) -> Option<&str> {
        match self {
            RecordPayload::Json(value) => {
                let found = if selector.starts_with('/') {
                    value.pointer(selector)
                } else {
                    value.get(selector)
                };
                found.and_then(Value::as_str)
            }
            RecordPayload::Xml(fields) => fields.get(selector).and_then(|v| v.as_deref()),
        }
    }

    /// Text the classifier searches: selected fields joined by newlines, or every
    /// string in the payload when no fields are selected.
    pub fn searchable_text(&self, selectors: &[String]) -> String {
        if !selectors.is_empty() {
            return selectors
                .iter()
                .filter_map(|s| self.field(s))
                .collect::<Vec<_>>()
                .join("\n");
        }

        let mut parts = Vec::new();
        match self {
            RecordPayload::Json(value) => collect_strings(value, &mut parts),
            RecordPayload::Xml(fields) => {
                parts.extend(fields.values().filter_map(|v| v.as_deref()));
            }
        }
        parts.join("\n")
    }

    /// Stable content hash; provenance is deliberately excluded so one fact
    /// found in two places maps to one row.
    pub fn fingerprint(&self) -> String {
        // serde_json maps are key-ordered, so the encoding is canonical
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(&encoded))
    }
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

/// A parsed record plus where it came from. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub provenance: Provenance,
    pub payload: RecordPayload,
}

impl RawRecord {
    pub fn fingerprint(&self) -> String {
        self.payload.fingerprint()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub is_relevant: bool,
    /// In `[0, 1]`
    pub confidence: f64,
    /// Category names in declaration order
    pub matched_reasons: Vec<String>,
    pub entity_name_raw: Option<String>,
}

impl ClassificationResult {
    pub fn irrelevant(entity_name_raw: Option<String>) -> Self {
        Self {
            is_relevant: false,
            confidence: 0.0,
            matched_reasons: Vec::new(),
            entity_name_raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    pub canonical_key: String,
    pub display_name: String,
    pub variants: BTreeSet<String>,
    pub matched_reasons: BTreeSet<String>,
    pub first_seen_unit: String,
    pub aggregate_confidence: f64,
}

impl CanonicalEntity {
    pub fn new(
        canonical_key: String,
        raw_name: &str,
        result: &ClassificationResult,
        unit_id: &str,
    ) -> Self {
        Self {
            canonical_key,
            display_name: raw_name.to_string(),
            variants: BTreeSet::from([raw_name.to_string()]),
            matched_reasons: result.matched_reasons.iter().cloned().collect(),
            first_seen_unit: unit_id.to_string(),
            aggregate_confidence: result.confidence,
        }
    }

    /// Folds another sighting of the same key into this one.
    ///
    /// Commutative and associative: unions for sets, max for confidence, the
    /// smallest unit id, and a display name picked from the variants alone.
    pub fn merge(&mut self, other: &CanonicalEntity) {
        debug_assert_eq!(self.canonical_key, other.canonical_key);
        self.variants.extend(other.variants.iter().cloned());
        self.matched_reasons
            .extend(other.matched_reasons.iter().cloned());
        self.aggregate_confidence = self.aggregate_confidence.max(other.aggregate_confidence);
        if other.first_seen_unit < self.first_seen_unit {
            self.first_seen_unit = other.first_seen_unit.clone();
        }
        self.display_name = pick_display_name(&self.variants);
    }
}

/// Prefers a variant that isn't shouting in all caps, then the smallest.
pub fn pick_display_name(variants: &BTreeSet<String>) -> String {
    variants
        .iter()
        .find(|v| v.chars().any(char::is_lowercase))
        .or_else(|| variants.iter().next())
        .cloned()
        .unwrap_or_default()
}

/// Durable row keyed by `(source_name, canonical_key, record_fingerprint)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRow {
    pub source_name: String,
    pub canonical_key: String,
    pub record_fingerprint: String,
    pub display_name: String,
    pub confidence: f64,
    pub matched_reasons: Vec<String>,
    pub variants: BTreeSet<String>,
    pub first_seen_unit: String,
}
