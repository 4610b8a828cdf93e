//! Completeness, composite and provenance scoring
//!
//! # Completeness tiers
//! Sources split into a high-priority pair (prediction, sentiment) and the
//! baseline context sources (weather, foot traffic, traffic, demographic,
//! economic):
//! - both high-priority sources and at least one baseline source: `full`
//! - at least one high-priority source: `high_priority`
//! - at least one baseline source: `baseline`
//! - nothing joined: `floor`
//!
//! Adding a source can only move an entity up a tier, and tier values are
//! validated non-decreasing at config load, so the score is monotonic.
//!
//! # Composite score
//! `prediction_weight * density + sentiment_weight * positive_sentiment
//!  + volume_weight * min(1, ln(1 + visitors) / ln(1 + saturation))`
//!
//! Missing inputs contribute 0.

use ppm_common::config::{AggregationConfig, CompletenessTiers, CompositeWeights, ProvenanceRule};
use ppm_common::db::models::{AggregateRow, EntityKind};
use ppm_common::SourceKind;
use tracing::debug;

pub const HIGH_PRIORITY_SOURCES: [SourceKind; 2] = [SourceKind::Prediction, SourceKind::Sentiment];

pub const BASELINE_SOURCES: [SourceKind; 5] = [
    SourceKind::Weather,
    SourceKind::FootTraffic,
    SourceKind::Traffic,
    SourceKind::Demographic,
    SourceKind::Economic,
];

/// Scores aggregate rows from configured tiers, weights and provenance rules
#[derive(Debug, Clone)]
pub struct ScoringPolicy {
    tiers: CompletenessTiers,
    weights: CompositeWeights,
    provenance: Vec<ProvenanceRule>,
    default_provenance: String,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self::from_config(&AggregationConfig::default())
    }
}

impl ScoringPolicy {
    pub fn from_config(config: &AggregationConfig) -> Self {
        Self {
            tiers: config.completeness,
            weights: config.composite,
            provenance: config.provenance.clone(),
            default_provenance: config.default_provenance.clone(),
        }
    }

    pub fn completeness(&self, row: &AggregateRow) -> f64 {
        let high = HIGH_PRIORITY_SOURCES.iter().filter(|s| row.has_source(**s)).count();
        let baseline = BASELINE_SOURCES.iter().any(|s| row.has_source(*s));

        let score = if high == HIGH_PRIORITY_SOURCES.len() && baseline {
            self.tiers.full
        } else if high > 0 {
            self.tiers.high_priority
        } else if baseline {
            self.tiers.baseline
        } else {
            self.tiers.floor
        };

        debug!(
            entity_id = %row.entity_id,
            high_priority = high,
            baseline,
            score,
            "Completeness scored"
        );
        score
    }

    pub fn composite(&self, row: &AggregateRow) -> f64 {
        let w = &self.weights;
        let prediction = row
            .prediction
            .as_ref()
            .map_or(0.0, |p| p.reading.psychographic_density.max(0.0));
        let sentiment = row
            .sentiment
            .as_ref()
            .map_or(0.0, |s| s.reading.positive_sentiment.max(0.0));
        let volume = row
            .foot_traffic
            .as_ref()
            .map_or(0.0, |f| saturating_volume(f.reading.visitors_count, w.volume_saturation));

        let score = w.prediction_weight * prediction + w.sentiment_weight * sentiment + w.volume_weight * volume;
        if score.is_finite() {
            score.max(0.0)
        } else {
            0.0
        }
    }

    /// `data_source_type` tag for an entity's provider; first matching rule wins
    pub fn provenance(&self, kind: EntityKind, provider: &str) -> String {
        self.provenance
            .iter()
            .find(|rule| rule.matches(kind, provider))
            .map(|rule| rule.tag.clone())
            .unwrap_or_else(|| self.default_provenance.clone())
    }
}

/// Log-scaled visitor volume in [0, 1]
fn saturating_volume(visitors: i64, saturation: f64) -> f64 {
    if visitors <= 0 || saturation <= 0.0 {
        return 0.0;
    }
    ((visitors as f64).ln_1p() / saturation.ln_1p()).min(1.0)
}
