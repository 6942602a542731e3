use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::error::Result;
use crate::core::types::{DocId, Document, FieldValue, SeqNo};
use crate::search::aggregate::AggState;
use crate::search::types::{hit_cmp, ScoredHit, SearchRequest, Query};
use crate::storage::wal::WalOp;

/// Hits, match count and raw aggregation accumulators from one partition.
#[derive(Debug, Clone)]
pub struct PartitionSearch {
    pub hits: Vec<ScoredHit>,
    pub total_hits: u64,
    pub aggregations: BTreeMap<String, AggState>,
}

/// The underlying inverted-index capability owned by one shard. The core
/// treats it as opaque: content becomes durable at `commit`, and
/// `committed_seq` is the shard's replay checkpoint.
pub trait IndexPartition: Send + Sync {
    /// Apply one WAL operation. Must be idempotent: an op with
    /// `seq <= applied_seq()` is a no-op, so replaying a WAL segment twice
    /// leaves the same content as replaying it once.
    fn apply(&mut self, seq: SeqNo, op: &WalOp) -> Result<()>;

    /// Flush applied content to stable storage and advance the checkpoint.
    fn commit(&mut self) -> Result<()>;

    /// Highest seq applied (committed or not).
    fn applied_seq(&self) -> SeqNo;

    /// Highest seq durably reflected on disk; WAL records at or below it
    /// may be truncated.
    fn committed_seq(&self) -> SeqNo;

    fn doc_count(&self) -> usize;

    fn get(&self, id: &DocId) -> Option<Document>;

    fn search(&self, request: &SearchRequest, limit: usize) -> PartitionSearch;
}

#[derive(Serialize, Deserialize)]
struct PartitionSnapshot {
    applied_seq: SeqNo,
    docs: Vec<Document>,
}

/// In-memory partition with a bincode snapshot as its durable form.
/// Text fields index as lowercased alphanumeric tokens, scalar fields as
/// one exact term; scoring is summed term frequency, which keeps ranking
/// deterministic for merge verification.
pub struct MemoryPartition {
    path: PathBuf,
    docs: HashMap<DocId, Document>,
    /// field -> term -> doc -> term frequency
    postings: HashMap<String, HashMap<String, HashMap<DocId, u32>>>,
    applied_seq: SeqNo,
    committed_seq: SeqNo,
}

impl MemoryPartition {
    /// Open the partition directory, loading the last committed snapshot
    /// if one exists.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join("partition.bin");
        let mut partition = MemoryPartition {
            path,
            docs: HashMap::new(),
            postings: HashMap::new(),
            applied_seq: 0,
            committed_seq: 0,
        };

        if partition.path.exists() {
            let raw = fs::read(&partition.path)?;
            let snapshot: PartitionSnapshot = bincode::deserialize(&raw)?;
            partition.applied_seq = snapshot.applied_seq;
            partition.committed_seq = snapshot.applied_seq;
            for doc in snapshot.docs {
                partition.index_doc(doc);
            }
        }
        Ok(partition)
    }

    fn index_doc(&mut self, doc: Document) {
        self.remove_doc(&doc.id);
        for (field, value) in &doc.fields {
            let terms = self.postings.entry(field.clone()).or_default();
            for term in extract_terms(value) {
                *terms
                    .entry(term)
                    .or_default()
                    .entry(doc.id.clone())
                    .or_insert(0) += 1;
            }
        }
        self.docs.insert(doc.id.clone(), doc);
    }

    fn remove_doc(&mut self, id: &DocId) {
        if self.docs.remove(id).is_none() {
            return;
        }
        for terms in self.postings.values_mut() {
            for docs in terms.values_mut() {
                docs.remove(id);
            }
            terms.retain(|_, docs| !docs.is_empty());
        }
        self.postings.retain(|_, terms| !terms.is_empty());
    }

    /// Score every matching document. Term scores are term frequencies;
    /// booleans sum the scores of their matching branches.
    fn eval(&self, query: &Query) -> HashMap<DocId, f32> {
        match query {
            Query::MatchAll => self.docs.keys().map(|id| (id.clone(), 1.0)).collect(),
            Query::Term { field, value } => {
                let term = normalize_term(value);
                let mut scores = HashMap::new();
                match field {
                    Some(field) => {
                        if let Some(docs) = self.postings.get(field).and_then(|t| t.get(&term)) {
                            for (id, tf) in docs {
                                scores.insert(id.clone(), *tf as f32);
                            }
                        }
                    }
                    None => {
                        for terms in self.postings.values() {
                            if let Some(docs) = terms.get(&term) {
                                for (id, tf) in docs {
                                    *scores.entry(id.clone()).or_insert(0.0) += *tf as f32;
                                }
                            }
                        }
                    }
                }
                scores
            }
            Query::And(clauses) => {
                let mut iter = clauses.iter();
                let mut scores = match iter.next() {
                    Some(first) => self.eval(first),
                    None => return HashMap::new(),
                };
                for clause in iter {
                    let branch = self.eval(clause);
                    scores.retain(|id, _| branch.contains_key(id));
                    for (id, score) in branch {
                        if let Some(existing) = scores.get_mut(&id) {
                            *existing += score;
                        }
                    }
                }
                scores
            }
            Query::Or(clauses) => {
                let mut scores = HashMap::new();
                for clause in clauses {
                    for (id, score) in self.eval(clause) {
                        *scores.entry(id).or_insert(0.0) += score;
                    }
                }
                scores
            }
        }
    }
}

impl IndexPartition for MemoryPartition {
    fn apply(&mut self, seq: SeqNo, op: &WalOp) -> Result<()> {
        if seq <= self.applied_seq {
            return Ok(());
        }
        match op {
            WalOp::Put(doc) => self.index_doc(doc.clone()),
            WalOp::Delete(id) => self.remove_doc(id),
        }
        self.applied_seq = seq;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let snapshot = PartitionSnapshot {
            applied_seq: self.applied_seq,
            docs: self.docs.values().cloned().collect(),
        };
        let raw = bincode::serialize(&snapshot)?;
        let tmp = self.path.with_extension("bin.tmp");
        fs::write(&tmp, &raw)?;
        let file = fs::File::open(&tmp)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.path)?;
        self.committed_seq = self.applied_seq;
        Ok(())
    }

    fn applied_seq(&self) -> SeqNo {
        self.applied_seq
    }

    fn committed_seq(&self) -> SeqNo {
        self.committed_seq
    }

    fn doc_count(&self) -> usize {
        self.docs.len()
    }

    fn get(&self, id: &DocId) -> Option<Document> {
        self.docs.get(id).cloned()
    }

    fn search(&self, request: &SearchRequest, limit: usize) -> PartitionSearch {
        let scores = self.eval(&request.query);
        let total_hits = scores.len() as u64;

        let mut aggregations = BTreeMap::new();
        for (name, spec) in &request.aggregations {
            let mut state = spec.new_state();
            for id in scores.keys() {
                if let Some(doc) = self.docs.get(id) {
                    spec.accumulate(&mut state, doc);
                }
            }
            aggregations.insert(name.clone(), state);
        }

        let mut hits: Vec<ScoredHit> = scores
            .into_iter()
            .map(|(doc_id, score)| ScoredHit { doc_id, score })
            .collect();
        hits.sort_by(|a, b| hit_cmp(request.sort, a, b));
        hits.truncate(limit);

        PartitionSearch {
            hits,
            total_hits,
            aggregations,
        }
    }
}

fn normalize_term(raw: &str) -> String {
    raw.to_lowercase()
}

/// Terms a field value indexes under. Text splits into lowercased
/// alphanumeric tokens; scalars index one exact term; nested objects
/// contribute their leaves under the top-level field name.
fn extract_terms(value: &FieldValue) -> Vec<String> {
    match value {
        FieldValue::Text(text) => text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect(),
        FieldValue::Object(fields) => fields.values().flat_map(extract_terms).collect(),
        other => other.as_term().map(|t| normalize_term(&t)).into_iter().collect(),
    }
}
