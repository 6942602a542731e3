use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::sync::Arc;

use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::idgen::IdGenerator;
use crate::core::types::{DocId, Document, SeqNo};
use crate::index::mapping::Mapping;
use crate::meta::store::MetaStore;
use crate::search::coordinator::{SearchCoordinator, ShardReader};
use crate::search::types::{SearchRequest, SearchResponse};
use crate::shard::shard::Shard;
use crate::storage::layout::StorageLayout;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSettings {
    pub name: String,
    /// Fixed at creation; routing depends on it never changing.
    pub shard_count: u32,
    pub created_at: DateTime<Utc>,
}

const STATE_OPEN: &str = "open";
const STATE_DELETING: &str = "deleting";

fn settings_key(name: &str) -> String {
    format!("index/{}/settings", name)
}
fn mapping_key(name: &str) -> String {
    format!("index/{}/mapping", name)
}
fn state_key(name: &str) -> String {
    format!("index/{}/state", name)
}

/// One named index: its settings, live mapping and shard set.
pub struct IndexHandle {
    pub settings: IndexSettings,
    mapping: RwLock<Mapping>,
    shards: Vec<Arc<Shard>>,
}

impl IndexHandle {
    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn mapping(&self) -> Mapping {
        self.mapping.read().clone()
    }

    pub fn shards(&self) -> &[Arc<Shard>] {
        &self.shards
    }

    pub fn readers(&self) -> Vec<Arc<dyn ShardReader>> {
        self.shards
            .iter()
            .map(|s| s.clone() as Arc<dyn ShardReader>)
            .collect()
    }

    fn shard_for(&self, id: &DocId) -> &Arc<Shard> {
        let shard = route(id, self.settings.shard_count);
        &self.shards[shard as usize]
    }
}

impl fmt::Debug for IndexHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexHandle")
            .field("settings", &self.settings)
            .field("mapping", &*self.mapping.read())
            .field("shards", &self.shards.len())
            .finish()
    }
}

/// Stable document routing: uniform over 32 bits, a pure function of the
/// ID and the index's immutable shard count.
pub fn route(id: &DocId, shard_count: u32) -> u32 {
    crc32fast::hash(id.as_str().as_bytes()) % shard_count
}

/// Owns every open index: creation, lazy open with recovery, crash-safe
/// deletion, routing, and the write path with schema inference.
pub struct IndexManager {
    config: Config,
    layout: StorageLayout,
    meta: Arc<dyn MetaStore>,
    idgen: IdGenerator,
    coordinator: SearchCoordinator,
    indexes: RwLock<HashMap<String, Arc<IndexHandle>>>,
}

impl IndexManager {
    /// Open the manager, resuming any index deletion a crash interrupted.
    pub fn open(config: Config, meta: Arc<dyn MetaStore>) -> Result<Self> {
        let layout = StorageLayout::new(config.data_path.clone())?;
        let idgen = IdGenerator::new(config.node_id, config.clock_skew_tolerance);
        let coordinator = SearchCoordinator::new(&config);
        let manager = IndexManager {
            config,
            layout,
            meta,
            idgen,
            coordinator,
            indexes: RwLock::new(HashMap::new()),
        };
        manager.resume_pending_deletes()?;
        Ok(manager)
    }

    pub fn create_index(
        &self,
        name: &str,
        shard_count: Option<u32>,
        mapping: Mapping,
    ) -> Result<Arc<IndexHandle>> {
        validate_index_name(name)?;
        let shard_count = shard_count.unwrap_or(self.config.default_shard_count);
        if shard_count == 0 || shard_count > 1024 {
            return Err(Error::validation(format!(
                "shard count {} out of range 1..=1024",
                shard_count
            )));
        }

        let settings = IndexSettings {
            name: name.to_string(),
            shard_count,
            created_at: Utc::now(),
        };
        // The settings key is the commit point: exactly one concurrent
        // creator wins it.
        let created = self
            .meta
            .create_if_absent(&settings_key(name), serde_json::to_value(&settings)?)?;
        if !created {
            return Err(Error::new(
                ErrorKind::AlreadyExists,
                format!("index {:?} already exists", name),
            ));
        }
        self.meta
            .put(&mapping_key(name), serde_json::to_value(&mapping)?)?;
        self.meta
            .put(&state_key(name), serde_json::json!(STATE_OPEN))?;

        let handle = self.open_shards(settings, mapping)?;
        self.indexes
            .write()
            .insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    /// Cached handle, or load it from the metadata store (recovering every
    /// shard) on first touch.
    pub fn get_index(&self, name: &str) -> Result<Arc<IndexHandle>> {
        if let Some(handle) = self.indexes.read().get(name) {
            return Ok(handle.clone());
        }
        self.open_index(name)
    }

    pub fn open_index(&self, name: &str) -> Result<Arc<IndexHandle>> {
        let settings = match self.meta.get(&settings_key(name))? {
            Some(value) => serde_json::from_value::<IndexSettings>(value.data)?,
            None => return Err(Error::not_found(format!("no such index {:?}", name))),
        };
        if let Some(state) = self.meta.get(&state_key(name))? {
            if state.data == serde_json::json!(STATE_DELETING) {
                return Err(Error::not_found(format!(
                    "index {:?} is being deleted",
                    name
                )));
            }
        }
        // A crash between the settings write and the mapping write leaves
        // a bare index; start it with an empty dynamic mapping.
        let mapping = match self.meta.get(&mapping_key(name))? {
            Some(value) => serde_json::from_value(value.data)?,
            None => Mapping::dynamic(),
        };

        let mut indexes = self.indexes.write();
        if let Some(handle) = indexes.get(name) {
            return Ok(handle.clone());
        }
        let handle = self.open_shards(settings, mapping)?;
        indexes.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    /// Irreversible. The deleting marker is persisted before any state is
    /// destroyed, so a crash mid-delete resumes on the next startup
    /// instead of leaving half an index behind.
    pub fn delete_index(&self, name: &str) -> Result<()> {
        if self.meta.get(&settings_key(name))?.is_none() {
            return Err(Error::not_found(format!("no such index {:?}", name)));
        }
        self.meta
            .put(&state_key(name), serde_json::json!(STATE_DELETING))?;

        if let Some(handle) = self.indexes.write().remove(name) {
            for shard in handle.shards() {
                shard.close()?;
            }
        }
        self.wipe_index(name)
    }

    fn wipe_index(&self, name: &str) -> Result<()> {
        let dir = self.layout.index_dir(name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        self.meta.delete(&mapping_key(name))?;
        self.meta.delete(&state_key(name))?;
        // Settings go last: while they exist the index is discoverable and
        // its deletion resumable.
        self.meta.delete(&settings_key(name))?;
        Ok(())
    }

    fn resume_pending_deletes(&self) -> Result<()> {
        for (key, value) in self.meta.list("index/")? {
            if key.ends_with("/state") && value.data == serde_json::json!(STATE_DELETING) {
                let name = key
                    .trim_start_matches("index/")
                    .trim_end_matches("/state")
                    .to_string();
                self.wipe_index(&name)?;
            }
        }
        Ok(())
    }

    fn open_shards(
        &self,
        settings: IndexSettings,
        mapping: Mapping,
    ) -> Result<Arc<IndexHandle>> {
        let mut shards = Vec::with_capacity(settings.shard_count as usize);
        for shard_id in 0..settings.shard_count {
            shards.push(Shard::open(
                &self.config,
                &self.layout,
                &settings.name,
                shard_id,
            )?);
        }
        Ok(Arc::new(IndexHandle {
            settings,
            mapping: RwLock::new(mapping),
            shards,
        }))
    }

    /// Fresh unique document ID for callers that do not supply one.
    pub fn generate_id(&self) -> Result<DocId> {
        Ok(DocId::from(self.idgen.next()?))
    }

    /// Validate against the mapping (inferring and persisting types for
    /// fields seen for the first time), route, and write. An empty ID is
    /// replaced with a generated one.
    pub fn put_document(&self, index: &str, mut doc: Document) -> Result<(DocId, SeqNo)> {
        if doc.id.as_str().is_empty() {
            doc.id = self.generate_id()?;
        }
        let handle = self.get_index(index)?;

        let changed = handle.mapping.write().observe(&doc)?;
        if changed {
            // Persist before the write so every node agrees on the field
            // types from the first document onward.
            let mapping = handle.mapping.read().clone();
            self.meta
                .put(&mapping_key(index), serde_json::to_value(&mapping)?)?;
        }

        let seq = handle.shard_for(&doc.id).put(doc.clone())?;
        Ok((doc.id, seq))
    }

    pub fn delete_document(&self, index: &str, id: &DocId) -> Result<SeqNo> {
        let handle = self.get_index(index)?;
        handle.shard_for(id).delete(id.clone())
    }

    pub fn get_document(&self, index: &str, id: &DocId) -> Result<Option<Document>> {
        let handle = self.get_index(index)?;
        handle.shard_for(id).get(id)
    }

    pub fn search(&self, index: &str, request: &SearchRequest) -> Result<SearchResponse> {
        let handle = self.get_index(index)?;
        self.coordinator.execute(&handle.readers(), request)
    }

    /// Make all acknowledged writes visible to search on every shard.
    pub fn refresh_index(&self, index: &str) -> Result<()> {
        let handle = self.get_index(index)?;
        for shard in handle.shards() {
            shard.refresh()?;
        }
        Ok(())
    }

    pub fn commit_index(&self, index: &str) -> Result<()> {
        let handle = self.get_index(index)?;
        for shard in handle.shards() {
            shard.commit()?;
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let mut indexes = self.indexes.write();
        for (_, handle) in indexes.drain() {
            for shard in handle.shards() {
                shard.close()?;
            }
        }
        Ok(())
    }
}

fn validate_index_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 255
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if !ok {
        return Err(Error::validation(format!(
            "invalid index name {:?}: lowercase ascii, digits, '-' and '_' only",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FieldValue;
    use crate::index::mapping::FieldType;
    use crate::meta::store::MemoryMetaStore;
    use crate::search::types::Query;
    use std::collections::HashSet;
    use std::time::Duration;
    use tempfile::tempdir;

    fn manager(root: &std::path::Path, meta: Arc<dyn MetaStore>) -> IndexManager {
        let mut config = Config::for_tests(root.to_path_buf());
        config.commit_interval = Duration::from_secs(3600);
        IndexManager::open(config, meta).unwrap()
    }

    fn doc(id: &str, body: &str) -> Document {
        Document::new(id).with_field("body", FieldValue::Text(body.into()))
    }

    #[test]
    fn create_twice_is_already_exists() {
        let tmp = tempdir().unwrap();
        let mgr = manager(tmp.path(), Arc::new(MemoryMetaStore::new()));
        mgr.create_index("books", Some(2), Mapping::dynamic()).unwrap();
        let err = mgr
            .create_index("books", Some(2), Mapping::dynamic())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        mgr.close().unwrap();
    }

    #[test]
    fn invalid_names_rejected() {
        let tmp = tempdir().unwrap();
        let mgr = manager(tmp.path(), Arc::new(MemoryMetaStore::new()));
        for name in ["", "Has-Caps", "slash/y", "dot.dot"] {
            let err = mgr
                .create_index(name, Some(1), Mapping::dynamic())
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
        mgr.close().unwrap();
    }

    #[test]
    fn routing_is_deterministic_and_covers_shards() {
        let shard_count = 8;
        let mut seen = HashSet::new();
        for i in 0..2000 {
            let id = DocId::new(format!("doc-{}", i));
            let first = route(&id, shard_count);
            assert_eq!(first, route(&id, shard_count));
            assert!(first < shard_count);
            seen.insert(first);
        }
        // 2000 uniform draws over 8 shards miss one with ~0 probability.
        assert_eq!(seen.len(), shard_count as usize);
    }

    #[test]
    fn write_refresh_search_round_trip() {
        let tmp = tempdir().unwrap();
        let mgr = manager(tmp.path(), Arc::new(MemoryMetaStore::new()));
        mgr.create_index("books", Some(3), Mapping::dynamic()).unwrap();

        for i in 0..30 {
            mgr.put_document("books", doc(&format!("d{}", i), "findable text"))
                .unwrap();
        }
        mgr.refresh_index("books").unwrap();

        let response = mgr
            .search(
                "books",
                &SearchRequest::new(Query::term("body", "findable")).paged(0, 50),
            )
            .unwrap();
        assert_eq!(response.total_hits, 30);
        assert_eq!(response.hits.len(), 30);
        assert!(!response.partial);

        // Hits come back from more than one shard.
        let shards: HashSet<u32> = response.hits.iter().map(|h| h.shard_id).collect();
        assert!(shards.len() > 1);
        mgr.close().unwrap();
    }

    #[test]
    fn empty_id_gets_generated() {
        let tmp = tempdir().unwrap();
        let mgr = manager(tmp.path(), Arc::new(MemoryMetaStore::new()));
        mgr.create_index("books", Some(2), Mapping::dynamic()).unwrap();

        let (id_a, _) = mgr.put_document("books", doc("", "auto id")).unwrap();
        let (id_b, _) = mgr.put_document("books", doc("", "auto id")).unwrap();
        assert!(!id_a.as_str().is_empty());
        assert_ne!(id_a, id_b);
        mgr.close().unwrap();
    }

    #[test]
    fn inferred_mapping_is_persisted() {
        let tmp = tempdir().unwrap();
        let meta: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
        {
            let mgr = manager(tmp.path(), meta.clone());
            mgr.create_index("books", Some(1), Mapping::dynamic()).unwrap();
            mgr.put_document(
                "books",
                Document::new("1")
                    .with_field("title", FieldValue::Text("dune".into()))
                    .with_field("year", FieldValue::Integer(1965)),
            )
            .unwrap();
            mgr.commit_index("books").unwrap();
            mgr.close().unwrap();
        }

        // A second manager over the same metadata sees the same types.
        let mgr = manager(tmp.path(), meta);
        let handle = mgr.get_index("books").unwrap();
        let mapping = handle.mapping();
        assert_eq!(mapping.fields["title"], FieldType::Text);
        assert_eq!(mapping.fields["year"], FieldType::Integer);
        mgr.close().unwrap();
    }

    #[test]
    fn conflicting_field_type_rejected_at_write() {
        let tmp = tempdir().unwrap();
        let mgr = manager(tmp.path(), Arc::new(MemoryMetaStore::new()));
        mgr.create_index("books", Some(1), Mapping::dynamic()).unwrap();
        mgr.put_document(
            "books",
            Document::new("1").with_field("year", FieldValue::Integer(1965)),
        )
        .unwrap();

        let err = mgr
            .put_document(
                "books",
                Document::new("2").with_field("year", FieldValue::Text("sixty-five".into())),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        mgr.close().unwrap();
    }

    #[test]
    fn delete_index_removes_everything() {
        let tmp = tempdir().unwrap();
        let meta: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
        let mgr = manager(tmp.path(), meta.clone());
        mgr.create_index("books", Some(2), Mapping::dynamic()).unwrap();
        mgr.put_document("books", doc("1", "soon gone")).unwrap();
        mgr.commit_index("books").unwrap();

        mgr.delete_index("books").unwrap();
        assert_eq!(
            mgr.get_index("books").unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert!(meta.list("index/books/").unwrap().is_empty());

        // The name is free again.
        mgr.create_index("books", Some(1), Mapping::dynamic()).unwrap();
        mgr.refresh_index("books").unwrap();
        let response = mgr
            .search("books", &SearchRequest::new(Query::term("body", "soon")))
            .unwrap();
        assert_eq!(response.total_hits, 0);
        mgr.close().unwrap();
    }

    #[test]
    fn interrupted_delete_resumes_on_startup() {
        let tmp = tempdir().unwrap();
        let meta: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
        {
            let mgr = manager(tmp.path(), meta.clone());
            mgr.create_index("books", Some(2), Mapping::dynamic()).unwrap();
            mgr.put_document("books", doc("1", "half deleted")).unwrap();
            mgr.commit_index("books").unwrap();
            mgr.close().unwrap();
        }
        // Crash right after the deleting marker landed.
        meta.put(&state_key("books"), serde_json::json!(STATE_DELETING))
            .unwrap();

        let mgr = manager(tmp.path(), meta.clone());
        assert!(meta.get(&settings_key("books")).unwrap().is_none());
        assert_eq!(
            mgr.get_index("books").unwrap_err().kind(),
            ErrorKind::NotFound
        );
        mgr.close().unwrap();
    }

    #[test]
    fn concurrent_create_has_exactly_one_winner() {
        let tmp = tempdir().unwrap();
        let mgr = Arc::new(manager(tmp.path(), Arc::new(MemoryMetaStore::new())));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let mgr = mgr.clone();
            handles.push(std::thread::spawn(move || {
                mgr.create_index("books", Some(1), Mapping::dynamic()).is_ok()
            }));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
        mgr.close().unwrap();
    }

    #[test]
    fn documents_persist_across_manager_restart() {
        let tmp = tempdir().unwrap();
        let meta: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
        {
            let mgr = manager(tmp.path(), meta.clone());
            mgr.create_index("books", Some(2), Mapping::dynamic()).unwrap();
            mgr.put_document("books", doc("1", "durable words")).unwrap();
            // No commit, no close: the WAL carries it.
        }

        let mgr = manager(tmp.path(), meta);
        mgr.refresh_index("books").unwrap();
        let response = mgr
            .search("books", &SearchRequest::new(Query::term("body", "durable")))
            .unwrap();
        assert_eq!(response.total_hits, 1);
        assert_eq!(
            mgr.get_document("books", &DocId::from("1"))
                .unwrap()
                .unwrap()
                .id,
            DocId::from("1")
        );
        mgr.close().unwrap();
    }
}
