use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::bounded;

use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind, Result};
use std::collections::BTreeMap;

use crate::search::aggregate::{AggResult, AggState};
use crate::search::types::{
    hit_cmp, Hit, ScoredHit, SearchRequest, SearchResponse, ShardFailure, ShardResult, SortOrder,
};

/// The per-shard search surface the coordinator fans out over. `Shard`
/// implements it; tests substitute slow or failing readers.
pub trait ShardReader: Send + Sync {
    fn shard_id(&self) -> u32;
    fn search(&self, request: &SearchRequest, limit: usize) -> Result<ShardResult>;
}

/// Scatter-gather executor: one dispatch per shard bounded by a deadline,
/// then a deterministic k-way merge on the gathering thread.
pub struct SearchCoordinator {
    max_result_window: usize,
    shard_timeout: Duration,
}

impl SearchCoordinator {
    pub fn new(config: &Config) -> Self {
        SearchCoordinator {
            max_result_window: config.max_result_window,
            shard_timeout: config.search_timeout,
        }
    }

    pub fn execute(
        &self,
        shards: &[Arc<dyn ShardReader>],
        request: &SearchRequest,
    ) -> Result<SearchResponse> {
        let started = Instant::now();
        self.validate(request)?;
        let limit = request.from + request.size;

        // Fan out. Threads are detached; a straggler past the deadline is
        // abandoned, its send fails once the channel is gone.
        let (tx, rx) = bounded::<(u32, Result<ShardResult>)>(shards.len().max(1));
        for shard in shards {
            let shard = shard.clone();
            let request = request.clone();
            let tx = tx.clone();
            thread::spawn(move || {
                let result = shard.search(&request, limit);
                let _ = tx.send((shard.shard_id(), result));
            });
        }
        drop(tx);

        let deadline = started + self.shard_timeout;
        let mut results: Vec<ShardResult> = Vec::with_capacity(shards.len());
        let mut failed_shards: Vec<ShardFailure> = Vec::new();
        let mut responded: Vec<u32> = Vec::new();

        for _ in 0..shards.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((shard_id, Ok(result))) => {
                    responded.push(shard_id);
                    results.push(result);
                }
                Ok((shard_id, Err(e))) => {
                    responded.push(shard_id);
                    failed_shards.push(ShardFailure {
                        shard_id,
                        reason: e.to_string(),
                    });
                }
                Err(_) => break,
            }
        }
        for shard in shards {
            let id = shard.shard_id();
            if !responded.contains(&id) {
                failed_shards.push(ShardFailure {
                    shard_id: id,
                    reason: format!("timed out after {:?}", self.shard_timeout),
                });
            }
        }

        if results.is_empty() && !failed_shards.is_empty() {
            return Err(Error::new(
                ErrorKind::Internal,
                format!("all {} shards failed", failed_shards.len()),
            ));
        }

        let total_hits = results.iter().map(|r| r.total_hits).sum();
        let hits = merge_hits(&results, request.sort, request.from, request.size);
        let aggregations = merge_aggregations(request, results);

        Ok(SearchResponse {
            hits,
            total_hits,
            aggregations,
            partial: !failed_shards.is_empty(),
            failed_shards,
            took_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Reject over-deep pagination before any shard is contacted.
    fn validate(&self, request: &SearchRequest) -> Result<()> {
        let depth = request.from.saturating_add(request.size);
        if depth > self.max_result_window {
            return Err(Error::new(
                ErrorKind::ResultWindowExceeded,
                format!(
                    "from + size = {} exceeds the result window of {}",
                    depth, self.max_result_window
                ),
            ));
        }
        for spec in request.aggregations.values() {
            spec.validate()?;
        }
        Ok(())
    }
}

struct HeapEntry<'a> {
    hit: &'a ScoredHit,
    shard_id: u32,
    source: usize,
    pos: usize,
    sort: SortOrder,
}

impl PartialEq for HeapEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for HeapEntry<'_> {}
impl PartialOrd for HeapEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        // hit_cmp orders best-first; BinaryHeap pops greatest, so flip it.
        hit_cmp(self.sort, self.hit, other.hit).reverse()
    }
}

/// K-way merge of per-shard hit lists (each already sorted by `hit_cmp`),
/// sliced to the requested page.
fn merge_hits(
    results: &[ShardResult],
    sort: SortOrder,
    from: usize,
    size: usize,
) -> Vec<Hit> {
    let mut heap = BinaryHeap::new();
    for (source, result) in results.iter().enumerate() {
        if let Some(hit) = result.hits.first() {
            heap.push(HeapEntry {
                hit,
                shard_id: result.shard_id,
                source,
                pos: 0,
                sort,
            });
        }
    }

    let mut merged = Vec::with_capacity(size.min(1024));
    let mut skipped = 0usize;
    while let Some(entry) = heap.pop() {
        if skipped < from {
            skipped += 1;
        } else {
            if merged.len() == size {
                break;
            }
            merged.push(Hit {
                doc_id: entry.hit.doc_id.clone(),
                score: entry.hit.score,
                shard_id: entry.shard_id,
            });
        }
        let next_pos = entry.pos + 1;
        if let Some(hit) = results[entry.source].hits.get(next_pos) {
            heap.push(HeapEntry {
                hit,
                shard_id: entry.shard_id,
                source: entry.source,
                pos: next_pos,
                sort,
            });
        }
    }
    merged
}

fn merge_aggregations(
    request: &SearchRequest,
    results: Vec<ShardResult>,
) -> BTreeMap<String, AggResult> {
    let mut merged: BTreeMap<String, AggState> = BTreeMap::new();
    for result in results {
        for (name, state) in result.aggregations {
            match merged.get_mut(&name) {
                Some(existing) => existing.merge(state),
                None => {
                    merged.insert(name, state);
                }
            }
        }
    }
    request
        .aggregations
        .iter()
        .map(|(name, spec)| {
            let state = merged.remove(name).unwrap_or_else(|| spec.new_state());
            (name.clone(), spec.finalize(state))
        })
        .collect()
}
