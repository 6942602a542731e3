pub mod core;
pub mod index;
pub mod meta;
pub mod search;
pub mod shard;
pub mod storage;

pub use crate::core::config::{Config, SyncPolicy};
pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::core::types::{DocId, Document, FieldValue, SeqNo};
pub use crate::index::manager::IndexManager;
pub use crate::index::mapping::{FieldType, Mapping};
pub use crate::search::types::{Query, SearchRequest, SearchResponse};

/*
┌──────────────────────────────────────────────────────────────────────┐
│                        TESSERA ARCHITECTURE                          │
└──────────────────────────────────────────────────────────────────────┘

  IndexManager ──owns──> IndexHandle ──owns──> Shard (one per partition)
       │                                         │
       ├──routes by──> route(doc_id) = crc32 % shard_count
       │                                         │
       ├──reads/writes──> MetaStore              ├──owns──> Wal
       │   (settings, mapping, lifecycle)        │            append → buffer → ack
       │                                         │            sync per SyncPolicy
       └──searches via──> SearchCoordinator      │
                             │                   └──owns──> IndexPartition
                 fan-out one thread per shard                 apply / commit /
                 merge hits (k-way, score desc,               search / aggregate
                 doc id asc) + agg accumulators

  Write path:  put_document → mapping.observe → route → Shard.write
               → WAL append (+ sync) → ack → committer drains buffer
               → partition.commit → checkpoint → WAL truncate
  Read path:   search → coordinator → per-shard search → merge → response
*/
