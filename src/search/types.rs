use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::core::types::DocId;
use crate::search::aggregate::{AggResult, AggSpec, AggState};

/// Structured query tree. Query-string parsing is an external concern;
/// callers hand the core this shape directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Query {
    MatchAll,
    /// Matches documents whose `field` contains `value` as an analyzed
    /// token (text fields) or as an exact term (scalar fields). With no
    /// field, every field is searched.
    Term {
        field: Option<String>,
        value: String,
    },
    And(Vec<Query>),
    Or(Vec<Query>),
}

impl Query {
    pub fn term(field: &str, value: &str) -> Self {
        Query::Term {
            field: Some(field.to_string()),
            value: value.to_string(),
        }
    }

    pub fn any_field(value: &str) -> Self {
        Query::Term {
            field: None,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    /// Score descending, document ID ascending on ties.
    Relevance,
    /// Document ID ascending.
    Id,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: Query,
    pub aggregations: BTreeMap<String, AggSpec>,
    pub from: usize,
    pub size: usize,
    pub sort: SortOrder,
}

impl Default for SearchRequest {
    fn default() -> Self {
        SearchRequest {
            query: Query::MatchAll,
            aggregations: BTreeMap::new(),
            from: 0,
            size: 10,
            sort: SortOrder::Relevance,
        }
    }
}

impl SearchRequest {
    pub fn new(query: Query) -> Self {
        SearchRequest {
            query,
            ..Default::default()
        }
    }

    pub fn with_agg(mut self, name: &str, spec: AggSpec) -> Self {
        self.aggregations.insert(name.to_string(), spec);
        self
    }

    pub fn paged(mut self, from: usize, size: usize) -> Self {
        self.from = from;
        self.size = size;
        self
    }
}

/// One locally-ranked match from a single shard.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredHit {
    pub doc_id: DocId,
    pub score: f32,
}

/// Deterministic hit ordering: the comparator every shard sorts by and the
/// coordinator merges by.
pub fn hit_cmp(sort: SortOrder, a: &ScoredHit, b: &ScoredHit) -> Ordering {
    match sort {
        SortOrder::Relevance => b
            .score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.doc_id.cmp(&b.doc_id)),
        SortOrder::Id => a.doc_id.cmp(&b.doc_id),
    }
}

/// Raw per-shard answer: top hits plus unreduced aggregation accumulators.
#[derive(Debug, Clone)]
pub struct ShardResult {
    pub shard_id: u32,
    pub hits: Vec<ScoredHit>,
    pub total_hits: u64,
    pub aggregations: BTreeMap<String, AggState>,
}

#[derive(Debug, Clone)]
pub struct ShardFailure {
    pub shard_id: u32,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct Hit {
    pub doc_id: DocId,
    pub score: f32,
    pub shard_id: u32,
}

#[derive(Debug, Clone)]
pub struct SearchResponse {
    pub hits: Vec<Hit>,
    /// Matches across all responding shards, not just the returned page.
    pub total_hits: u64,
    pub aggregations: BTreeMap<String, AggResult>,
    /// True when at least one shard failed or timed out; `failed_shards`
    /// names them. Never silently incomplete.
    pub partial: bool,
    pub failed_shards: Vec<ShardFailure>,
    pub took_ms: u64,
}
