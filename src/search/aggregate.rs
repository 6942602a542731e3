use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::error::{Error, Result};
use crate::core::types::{Document, FieldValue};

/// Aggregation request, one per named aggregation in a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggSpec {
    /// Number of documents with a value for `field`.
    ValueCount { field: String },
    Sum { field: String },
    Min { field: String },
    Max { field: String },
    /// Combined as (sum, count) per shard, divided once at the end.
    Avg { field: String },
    /// Document count per distinct value of `field`.
    Terms { field: String },
    /// Fixed-width numeric buckets of `interval`.
    Histogram { field: String, interval: f64 },
    /// Fixed-width time buckets of `interval_ms` over date fields.
    DateHistogram { field: String, interval_ms: i64 },
}

impl AggSpec {
    pub fn new_state(&self) -> AggState {
        match self {
            AggSpec::ValueCount { .. } => AggState::Count(0),
            AggSpec::Sum { .. } => AggState::Sum(0.0),
            AggSpec::Min { .. } => AggState::Min(None),
            AggSpec::Max { .. } => AggState::Max(None),
            AggSpec::Avg { .. } => AggState::Avg { sum: 0.0, count: 0 },
            AggSpec::Terms { .. } => AggState::TermBuckets(BTreeMap::new()),
            AggSpec::Histogram { .. } | AggSpec::DateHistogram { .. } => {
                AggState::NumericBuckets(BTreeMap::new())
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            AggSpec::Histogram { interval, .. } if *interval <= 0.0 => Err(
                Error::validation("histogram interval must be positive"),
            ),
            AggSpec::DateHistogram { interval_ms, .. } if *interval_ms <= 0 => Err(
                Error::validation("date_histogram interval must be positive"),
            ),
            _ => Ok(()),
        }
    }

    /// Fold one matching document into a shard-local accumulator.
    pub fn accumulate(&self, state: &mut AggState, doc: &Document) {
        match (self, state) {
            (AggSpec::ValueCount { field }, AggState::Count(n)) => {
                if doc.get_field(field).is_some() {
                    *n += 1;
                }
            }
            (AggSpec::Sum { field }, AggState::Sum(sum)) => {
                if let Some(v) = doc.get_field(field).and_then(FieldValue::as_f64) {
                    *sum += v;
                }
            }
            (AggSpec::Min { field }, AggState::Min(min)) => {
                if let Some(v) = doc.get_field(field).and_then(FieldValue::as_f64) {
                    *min = Some(min.map_or(v, |m: f64| m.min(v)));
                }
            }
            (AggSpec::Max { field }, AggState::Max(max)) => {
                if let Some(v) = doc.get_field(field).and_then(FieldValue::as_f64) {
                    *max = Some(max.map_or(v, |m: f64| m.max(v)));
                }
            }
            (AggSpec::Avg { field }, AggState::Avg { sum, count }) => {
                if let Some(v) = doc.get_field(field).and_then(FieldValue::as_f64) {
                    *sum += v;
                    *count += 1;
                }
            }
            (AggSpec::Terms { field }, AggState::TermBuckets(buckets)) => {
                let key = match doc.get_field(field) {
                    Some(FieldValue::Text(text)) => Some(text.clone()),
                    Some(value) => value.as_term(),
                    None => None,
                };
                if let Some(key) = key {
                    *buckets.entry(key).or_insert(0) += 1;
                }
            }
            (AggSpec::Histogram { field, interval }, AggState::NumericBuckets(buckets)) => {
                if let Some(v) = doc.get_field(field).and_then(FieldValue::as_f64) {
                    let bucket = (v / interval).floor() as i64;
                    *buckets.entry(bucket).or_insert(0) += 1;
                }
            }
            (
                AggSpec::DateHistogram { field, interval_ms },
                AggState::NumericBuckets(buckets),
            ) => {
                if let Some(FieldValue::Date(ts)) = doc.get_field(field) {
                    let bucket = ts.timestamp_millis().div_euclid(*interval_ms);
                    *buckets.entry(bucket).or_insert(0) += 1;
                }
            }
            // State shape always comes from new_state on the same spec.
            _ => {}
        }
    }

    /// Reduce a fully merged accumulator to its final result.
    pub fn finalize(&self, state: AggState) -> AggResult {
        match (self, state) {
            (AggSpec::ValueCount { .. }, AggState::Count(n)) => AggResult::Count(n),
            (AggSpec::Sum { .. }, AggState::Sum(sum)) => AggResult::Value(Some(sum)),
            (AggSpec::Min { .. }, AggState::Min(v)) => AggResult::Value(v),
            (AggSpec::Max { .. }, AggState::Max(v)) => AggResult::Value(v),
            (AggSpec::Avg { .. }, AggState::Avg { sum, count }) => {
                AggResult::Value((count > 0).then(|| sum / count as f64))
            }
            (AggSpec::Terms { .. }, AggState::TermBuckets(buckets)) => AggResult::Buckets(
                buckets
                    .into_iter()
                    .map(|(key, count)| Bucket {
                        key: BucketKey::Term(key),
                        count,
                    })
                    .collect(),
            ),
            (AggSpec::Histogram { interval, .. }, AggState::NumericBuckets(buckets)) => {
                AggResult::Buckets(
                    buckets
                        .into_iter()
                        .map(|(idx, count)| Bucket {
                            key: BucketKey::Value(idx as f64 * interval),
                            count,
                        })
                        .collect(),
                )
            }
            (AggSpec::DateHistogram { interval_ms, .. }, AggState::NumericBuckets(buckets)) => {
                AggResult::Buckets(
                    buckets
                        .into_iter()
                        .map(|(idx, count)| Bucket {
                            key: BucketKey::Value((idx * interval_ms) as f64),
                            count,
                        })
                        .collect(),
                )
            }
            _ => AggResult::Value(None),
        }
    }
}

/// Shard-local accumulator, merged associatively across shards before
/// finalization. Avg keeps sum and count apart so the coordinator never
/// averages averages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggState {
    Count(u64),
    Sum(f64),
    Min(Option<f64>),
    Max(Option<f64>),
    Avg { sum: f64, count: u64 },
    TermBuckets(BTreeMap<String, u64>),
    NumericBuckets(BTreeMap<i64, u64>),
}

impl AggState {
    /// Combine another shard's accumulator into this one. Both sides must
    /// come from the same spec.
    pub fn merge(&mut self, other: AggState) {
        match (self, other) {
            (AggState::Count(a), AggState::Count(b)) => *a += b,
            (AggState::Sum(a), AggState::Sum(b)) => *a += b,
            (AggState::Min(a), AggState::Min(b)) => {
                *a = match (*a, b) {
                    (Some(x), Some(y)) => Some(x.min(y)),
                    (x, y) => x.or(y),
                };
            }
            (AggState::Max(a), AggState::Max(b)) => {
                *a = match (*a, b) {
                    (Some(x), Some(y)) => Some(x.max(y)),
                    (x, y) => x.or(y),
                };
            }
            (
                AggState::Avg { sum, count },
                AggState::Avg {
                    sum: other_sum,
                    count: other_count,
                },
            ) => {
                *sum += other_sum;
                *count += other_count;
            }
            (AggState::TermBuckets(a), AggState::TermBuckets(b)) => {
                for (key, count) in b {
                    *a.entry(key).or_insert(0) += count;
                }
            }
            (AggState::NumericBuckets(a), AggState::NumericBuckets(b)) => {
                for (key, count) in b {
                    *a.entry(key).or_insert(0) += count;
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggResult {
    Count(u64),
    /// None when no document carried the field (min/max/avg of nothing).
    Value(Option<f64>),
    Buckets(Vec<Bucket>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub key: BucketKey,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BucketKey {
    Term(String),
    Value(f64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Document;

    fn doc(id: &str, price: f64) -> Document {
        Document::new(id).with_field("price", FieldValue::Float(price))
    }

    fn run_shard(spec: &AggSpec, docs: &[Document]) -> AggState {
        let mut state = spec.new_state();
        for d in docs {
            spec.accumulate(&mut state, d);
        }
        state
    }

    #[test]
    fn avg_merges_sum_and_count_not_averages() {
        let spec = AggSpec::Avg {
            field: "price".into(),
        };
        // Shard A: one doc at 10.0; shard B: three docs at 2.0. The average
        // of per-shard averages would be 5.5; the true average is 4.0.
        let shard_a = run_shard(&spec, &[doc("a", 10.0)]);
        let shard_b = run_shard(&spec, &[doc("b", 2.0), doc("c", 2.0), doc("d", 2.0)]);

        let mut merged = shard_a;
        merged.merge(shard_b);
        assert_eq!(spec.finalize(merged), AggResult::Value(Some(4.0)));
    }

    #[test]
    fn min_max_sum_combine_associatively() {
        let min = AggSpec::Min {
            field: "price".into(),
        };
        let max = AggSpec::Max {
            field: "price".into(),
        };
        let sum = AggSpec::Sum {
            field: "price".into(),
        };

        let left = [doc("a", 3.0), doc("b", 7.0)];
        let right = [doc("c", 1.0)];
        for (spec, expected) in [(&min, 1.0), (&max, 7.0), (&sum, 11.0)] {
            let mut merged = run_shard(spec, &left);
            merged.merge(run_shard(spec, &right));
            assert_eq!(spec.finalize(merged), AggResult::Value(Some(expected)));
        }
    }

    #[test]
    fn empty_shard_does_not_disturb_min() {
        let spec = AggSpec::Min {
            field: "price".into(),
        };
        let mut merged = run_shard(&spec, &[]);
        merged.merge(run_shard(&spec, &[doc("a", 2.5)]));
        assert_eq!(spec.finalize(merged), AggResult::Value(Some(2.5)));

        let empty = run_shard(&spec, &[]);
        assert_eq!(spec.finalize(empty), AggResult::Value(None));
    }

    #[test]
    fn term_buckets_union_by_key() {
        let spec = AggSpec::Terms {
            field: "genre".into(),
        };
        let mk = |id: &str, genre: &str| {
            Document::new(id).with_field("genre", FieldValue::Text(genre.into()))
        };
        let mut merged = run_shard(&spec, &[mk("a", "scifi"), mk("b", "noir")]);
        merged.merge(run_shard(&spec, &[mk("c", "scifi")]));

        match spec.finalize(merged) {
            AggResult::Buckets(buckets) => {
                assert_eq!(buckets.len(), 2);
                assert_eq!(buckets[0].key, BucketKey::Term("noir".into()));
                assert_eq!(buckets[0].count, 1);
                assert_eq!(buckets[1].key, BucketKey::Term("scifi".into()));
                assert_eq!(buckets[1].count, 2);
            }
            other => panic!("expected buckets, got {:?}", other),
        }
    }

    #[test]
    fn histogram_buckets_by_interval() {
        let spec = AggSpec::Histogram {
            field: "price".into(),
            interval: 10.0,
        };
        let mut merged = run_shard(&spec, &[doc("a", 3.0), doc("b", 12.0)]);
        merged.merge(run_shard(&spec, &[doc("c", 17.0), doc("d", -2.0)]));

        match spec.finalize(merged) {
            AggResult::Buckets(buckets) => {
                let keys: Vec<_> = buckets.iter().map(|b| (b.key.clone(), b.count)).collect();
                assert_eq!(
                    keys,
                    vec![
                        (BucketKey::Value(-10.0), 1),
                        (BucketKey::Value(0.0), 1),
                        (BucketKey::Value(10.0), 2),
                    ]
                );
            }
            other => panic!("expected buckets, got {:?}", other),
        }
    }

    #[test]
    fn negative_interval_rejected() {
        let spec = AggSpec::Histogram {
            field: "price".into(),
            interval: 0.0,
        };
        assert!(spec.validate().is_err());
    }
}
