//! Weighted reconciliation of per-peer metrics into industry aggregates.
//!
//! Peer weights come from model output and are not guaranteed to sum to one, so
//! every metric is normalized by the weight that actually contributed to it.
//! Missing or unparseable values are exclusions, never zeros.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::parser::to_number;

/// A peer company with raw (unverified) metric values and a raw weight.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    /// Stripped metric name -> raw value text.
    pub metrics: BTreeMap<String, String>,
    /// Raw weight text; `None` when the model gave no weight for this entity.
    pub weight: Option<String>,
}

impl Entity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_weight(mut self, weight: impl Into<String>) -> Self {
        self.weight = Some(weight.into());
        self
    }

    pub fn with_metric(mut self, name: &str, value: impl Into<String>) -> Self {
        self.metrics.insert(name.trim().to_string(), value.into());
        self
    }

    /// Zip metric names with value tokens. Names without a value are left out;
    /// surplus values are ignored.
    pub fn from_tokens(
        id: impl Into<String>,
        names: &[String],
        values: &[String],
        weight: Option<String>,
    ) -> Self {
        let metrics = names
            .iter()
            .zip(values.iter())
            .map(|(name, value)| (name.trim().to_string(), value.clone()))
            .collect();
        Self {
            id: id.into(),
            metrics,
            weight,
        }
    }

    /// Parsed weight, if it is a finite number greater than zero.
    pub fn effective_weight(&self) -> Option<f64> {
        self.weight
            .as_deref()
            .and_then(to_number)
            .filter(|w| *w > 0.0)
    }

    pub fn metric(&self, name: &str) -> Option<&str> {
        self.metrics.get(name.trim()).map(String::as_str)
    }
}

/// Aggregate for one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricAggregate {
    /// Weighted average; `None` when no entity contributed.
    pub value: Option<f64>,
    pub contributors: usize,
    pub total_weight: f64,
}

/// Stripped metric name -> aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub metrics: BTreeMap<String, MetricAggregate>,
}

impl AggregateResult {
    pub fn get(&self, name: &str) -> Option<&MetricAggregate> {
        self.metrics.get(name.trim())
    }

    /// Weighted average for `name`; `None` for unknown metrics and for metrics
    /// without data.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|m| m.value)
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Name -> value map, the shape handed to the recommendation prompt.
    pub fn values(&self) -> BTreeMap<String, Option<f64>> {
        self.metrics
            .iter()
            .map(|(k, v)| (k.clone(), v.value))
            .collect()
    }
}

/// Compute weighted averages for each metric across `entities`.
pub fn reconcile(entities: &[Entity], metric_names: &[String]) -> AggregateResult {
    let weights: Vec<Option<f64>> = entities.iter().map(Entity::effective_weight).collect();
    let mut result = AggregateResult::default();

    for raw_name in metric_names {
        let name = raw_name.trim();
        if name.is_empty() || result.metrics.contains_key(name) {
            continue;
        }

        let mut contributions: Vec<(f64, f64)> = entities
            .iter()
            .zip(weights.iter())
            .filter_map(|(entity, weight)| {
                let weight = (*weight)?;
                let value = entity.metric(name).and_then(to_number)?;
                Some((value, weight))
            })
            .collect();

        // Canonical summation order keeps the result independent of entity order.
        contributions.sort_by(|a, b| match a.0.total_cmp(&b.0) {
            Ordering::Equal => a.1.total_cmp(&b.1),
            other => other,
        });

        let weighted_sum: f64 = contributions.iter().map(|(v, w)| v * w).sum();
        let total_weight: f64 = contributions.iter().map(|(_, w)| w).sum();

        // A uniform set of values (including a single contributor) reproduces the
        // value itself rather than a rounded v*w/w.
        let value = match (contributions.first(), contributions.last()) {
            _ if total_weight <= 0.0 => None,
            (Some(first), Some(last)) if first.0 == last.0 => Some(first.0),
            _ => Some(weighted_sum / total_weight),
        };
        debug!(
            metric = name,
            contributors = contributions.len(),
            total_weight,
            "reconciled metric"
        );

        result.metrics.insert(
            name.to_string(),
            MetricAggregate {
                value,
                contributors: contributions.len(),
                total_weight,
            },
        );
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn unparseable_value_is_excluded_not_zeroed() {
        let entities = vec![
            Entity::new("A").with_weight("0.6").with_metric("ratio", "10"),
            Entity::new("B")
                .with_weight("0.4")
                .with_metric("ratio", "not-a-number"),
        ];
        let result = reconcile(&entities, &names(&["ratio"]));
        let agg = result.get("ratio").unwrap();
        assert_eq!(agg.value, Some(10.0));
        assert_eq!(agg.contributors, 1);
        assert!((agg.total_weight - 0.6).abs() < 1e-12);
    }

    #[test]
    fn all_zero_or_missing_weights_give_absent_aggregate() {
        let entities = vec![
            Entity::new("A").with_weight("0").with_metric("pe", "12"),
            Entity::new("B").with_metric("pe", "14"),
            Entity::new("C").with_weight("-0.5").with_metric("pe", "20"),
            Entity::new("D").with_weight("heavy").with_metric("pe", "30"),
        ];
        let result = reconcile(&entities, &names(&["pe"]));
        assert_eq!(result.value("pe"), None);
        assert_eq!(result.get("pe").unwrap().contributors, 0);
    }

    #[test]
    fn metric_names_are_stripped_before_lookup() {
        let entities = vec![Entity::new("A")
            .with_weight("1")
            .with_metric(" Current Ratio\n", "1.5")];
        let result = reconcile(&entities, &names(&["Current Ratio ", "  Current Ratio"]));
        assert_eq!(result.len(), 1);
        assert_eq!(result.value("Current Ratio"), Some(1.5));
    }

    #[test]
    fn weights_are_relative_not_probabilities() {
        let entities = vec![
            Entity::new("A").with_weight("3").with_metric("m", "1"),
            Entity::new("B").with_weight("1").with_metric("m", "5"),
        ];
        let result = reconcile(&entities, &names(&["m"]));
        assert_eq!(result.value("m"), Some(2.0));
    }

    #[test]
    fn single_contributor_yields_its_value_exactly() {
        let entities = vec![
            Entity::new("A").with_weight("0.37").with_metric("roe", "0.1234"),
            Entity::new("B").with_weight("0.5").with_metric("roe", ""),
            Entity::new("C").with_metric("roe", "9"),
        ];
        let result = reconcile(&entities, &names(&["roe"]));
        assert_eq!(result.value("roe"), Some(0.1234));
    }

    #[test]
    fn permutation_does_not_change_result() {
        let base = vec![
            Entity::new("A").with_weight("0.1").with_metric("x", "3.3"),
            Entity::new("B").with_weight("0.7").with_metric("x", "1.1"),
            Entity::new("C").with_weight("0.2").with_metric("x", "7.9"),
            Entity::new("D").with_weight("0.3").with_metric("x", "bad"),
        ];
        let expected = reconcile(&base, &names(&["x"]));

        let mut rotated = base.clone();
        for _ in 0..base.len() {
            rotated.rotate_left(1);
            assert_eq!(reconcile(&rotated, &names(&["x"])), expected);
        }
        let mut reversed = base;
        reversed.reverse();
        assert_eq!(reconcile(&reversed, &names(&["x"])), expected);
    }

    #[test]
    fn duplicate_entities_count_independently() {
        let entities = vec![
            Entity::new("MSFT").with_weight("0.5").with_metric("m", "2"),
            Entity::new("msft ").with_weight("0.5").with_metric("m", "4"),
        ];
        let result = reconcile(&entities, &names(&["m"]));
        assert_eq!(result.value("m"), Some(3.0));
        assert_eq!(result.get("m").unwrap().contributors, 2);
    }

    #[test]
    fn from_tokens_tolerates_count_mismatch() {
        let metric_names = names(&["a", "b", "c"]);
        let values = names(&["1", "2"]);
        let entity = Entity::from_tokens("X", &metric_names, &values, Some("1".into()));
        assert_eq!(entity.metric("a"), Some("1"));
        assert_eq!(entity.metric("b"), Some("2"));
        assert_eq!(entity.metric("c"), None);

        let result = reconcile(&[entity], &metric_names);
        assert_eq!(result.value("c"), None);
        assert_eq!(result.value("b"), Some(2.0));
    }
}
