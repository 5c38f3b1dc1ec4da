//! Content-addressed provenance store with trust-inheritance tracking.
//!
//! Ported from `sentinel/security/provenance.py`: every piece of content
//! entering the system is tagged, trust is inherited from the weakest
//! parent, and the chain of derivation can be walked back to its roots.
//! Two backends share one trait — an in-memory map (the default, bounded
//! and FIFO-evicted) and an optional SQLite-backed store behind the
//! `storage-sqlite` feature, mirroring the original's
//! `ProvenanceStore(db: Connection | None)` dual-mode design.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{DataSource, TaggedData, TrustLevel};

/// Cap on the number of entries the in-memory backend retains before
/// evicting the oldest, ported verbatim from
/// `sentinel/security/provenance.py::MAX_PROVENANCE_ENTRIES`.
pub const MAX_PROVENANCE_ENTRIES: usize = 10_000;

/// Cap on the number of file-write records the in-memory backend retains,
/// ported verbatim from `MAX_FILE_PROVENANCE_ENTRIES`.
pub const MAX_FILE_PROVENANCE_ENTRIES: usize = 10_000;

/// Errors raised by a [`ProvenanceStore`] implementation.
#[derive(Debug, Error)]
pub enum ProvenanceError {
    /// No entry exists for the requested id.
    #[error("no provenance entry for id '{0}'")]
    NotFound(String),

    /// One or more parent ids referenced by `create` do not exist.
    #[error("parent id '{0}' not found while creating derived data")]
    ParentNotFound(String),

    /// The SQLite backend hit a storage-layer error.
    #[cfg(feature = "storage-sqlite")]
    #[error("storage backend error: {0}")]
    Backend(#[from] sqlx::Error),
}

/// A single step in a provenance chain walk, from a leaf back toward its
/// roots.
#[derive(Debug, Clone)]
pub struct ProvenanceLink {
    /// The id at this point in the chain.
    pub id: String,
    /// How many hops from the starting id.
    pub depth: u32,
}

/// Default bound on how many hops a [`ProvenanceStore::chain`] walk follows
/// before stopping, ported verbatim from `_get_provenance_chain_sql`'s
/// `max_depth=50` default. Exists as a named constant so both backends and
/// callers share the same default rather than re-typing the literal.
pub const DEFAULT_CHAIN_MAX_DEPTH: u32 = 50;

/// Storage abstraction for tagged data provenance.
///
/// Implementations must enforce the trust-inheritance invariant in
/// [`create`](ProvenanceStore::create): a derived entry's trust level is the
/// weakest of its own declared level and every parent's level.
#[async_trait]
pub trait ProvenanceStore: Send + Sync {
    /// Tag and store new content, inheriting trust from `derived_from`
    /// parents if any are untrusted.
    async fn create(
        &self,
        content: String,
        trust_level: TrustLevel,
        source: DataSource,
        originated_from: String,
        derived_from: Vec<String>,
    ) -> Result<TaggedData, ProvenanceError>;

    /// Fetch a previously tagged entry by id.
    async fn get(&self, id: &str) -> Result<TaggedData, ProvenanceError>;

    /// Walk the derivation chain for `id` back to its roots, following at
    /// most `max_depth` hops. Ported from `get_provenance_chain(data_id,
    /// max_depth=50)`; pass [`DEFAULT_CHAIN_MAX_DEPTH`] to match the
    /// original's default.
    async fn chain(&self, id: &str, max_depth: u32) -> Result<Vec<ProvenanceLink>, ProvenanceError>;

    /// Returns `true` if every entry in `id`'s derivation chain (including
    /// itself) is [`TrustLevel::Trusted`].
    ///
    /// Ported from `provenance.py`: `all(item.trust_level == TRUSTED for
    /// item in chain)` — walks the full chain via [`chain`](Self::chain)
    /// rather than inspecting only `id` itself, since a node one hop removed
    /// from an untrusted ancestor can still (incorrectly) carry a `Trusted`
    /// tag if that ancestor was never registered as a `derived_from` parent
    /// at `create` time; this is the belt-and-suspenders check the
    /// orchestrator relies on before letting untrusted data drive a
    /// command-executing tool.
    async fn is_trust_safe_for_execution(&self, id: &str) -> Result<bool, ProvenanceError> {
        let nodes = self.chain(id, DEFAULT_CHAIN_MAX_DEPTH).await?;
        for link in &nodes {
            if self.get(&link.id).await?.trust_level != TrustLevel::Trusted {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Record that `path` was last written with the content tagged `data_id`.
    async fn record_file_write(&self, path: String, data_id: String);

    /// Look up the data id that last wrote `path`, if tracked.
    async fn get_file_writer(&self, path: &str) -> Option<String>;
}

struct MemoryState {
    entries: HashMap<String, TaggedData>,
    insertion_order: VecDeque<String>,
    file_writers: HashMap<String, String>,
    file_writer_order: VecDeque<String>,
}

impl MemoryState {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            insertion_order: VecDeque::new(),
            file_writers: HashMap::new(),
            file_writer_order: VecDeque::new(),
        }
    }

    fn evict_oldest_if_needed(&mut self) {
        while self.entries.len() >= MAX_PROVENANCE_ENTRIES {
            if let Some(oldest) = self.insertion_order.pop_front() {
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }

    fn evict_oldest_file_writer_if_needed(&mut self) {
        while self.file_writers.len() >= MAX_FILE_PROVENANCE_ENTRIES {
            if let Some(oldest) = self.file_writer_order.pop_front() {
                self.file_writers.remove(&oldest);
            } else {
                break;
            }
        }
    }
}

/// Default, in-process provenance backend.
///
/// Bounded to [`MAX_PROVENANCE_ENTRIES`] with FIFO eviction on insertion
/// order, exactly as `_evict_oldest` behaves in the original.
pub struct InMemoryProvenanceStore {
    state: Mutex<MemoryState>,
}

impl InMemoryProvenanceStore {
    /// Construct an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::new()),
        }
    }

    fn chain_bfs(state: &MemoryState, start: &str, max_depth: u32) -> Vec<ProvenanceLink> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        let mut out = Vec::new();
        queue.push_back((start.to_string(), 0u32));
        visited.insert(start.to_string());

        while let Some((id, depth)) = queue.pop_front() {
            out.push(ProvenanceLink {
                id: id.clone(),
                depth,
            });
            if depth >= max_depth {
                continue;
            }
            if let Some(entry) = state.entries.get(&id) {
                for parent in &entry.derived_from {
                    if visited.insert(parent.clone()) {
                        queue.push_back((parent.clone(), depth + 1));
                    }
                }
            }
        }
        out
    }
}

impl Default for InMemoryProvenanceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProvenanceStore for InMemoryProvenanceStore {
    async fn create(
        &self,
        content: String,
        trust_level: TrustLevel,
        source: DataSource,
        originated_from: String,
        derived_from: Vec<String>,
    ) -> Result<TaggedData, ProvenanceError> {
        let mut dedup_parents: Vec<String> = Vec::new();
        for parent in derived_from {
            if !dedup_parents.contains(&parent) {
                dedup_parents.push(parent);
            }
        }

        let mut state = self.state.lock().expect("provenance mutex poisoned");

        let mut effective_trust = trust_level;
        for parent in &dedup_parents {
            let parent_entry = state
                .entries
                .get(parent)
                .ok_or_else(|| ProvenanceError::ParentNotFound(parent.clone()))?;
            effective_trust = effective_trust.combine(parent_entry.trust_level);
        }

        let mut data = TaggedData::new(content, effective_trust, source)
            .with_originated_from(originated_from);
        data.derived_from = dedup_parents;

        state.evict_oldest_if_needed();
        state.insertion_order.push_back(data.id.clone());
        state.entries.insert(data.id.clone(), data.clone());

        Ok(data)
    }

    async fn get(&self, id: &str) -> Result<TaggedData, ProvenanceError> {
        let state = self.state.lock().expect("provenance mutex poisoned");
        state
            .entries
            .get(id)
            .cloned()
            .ok_or_else(|| ProvenanceError::NotFound(id.to_string()))
    }

    async fn chain(&self, id: &str, max_depth: u32) -> Result<Vec<ProvenanceLink>, ProvenanceError> {
        let state = self.state.lock().expect("provenance mutex poisoned");
        if !state.entries.contains_key(id) {
            return Err(ProvenanceError::NotFound(id.to_string()));
        }
        Ok(Self::chain_bfs(&state, id, max_depth))
    }

    async fn record_file_write(&self, path: String, data_id: String) {
        let mut state = self.state.lock().expect("provenance mutex poisoned");
        state.evict_oldest_file_writer_if_needed();
        if !state.file_writers.contains_key(&path) {
            state.file_writer_order.push_back(path.clone());
        }
        state.file_writers.insert(path, data_id);
    }

    async fn get_file_writer(&self, path: &str) -> Option<String> {
        let state = self.state.lock().expect("provenance mutex poisoned");
        state.file_writers.get(path).cloned()
    }
}

#[cfg(feature = "storage-sqlite")]
pub mod sqlite {
    //! SQLite-backed provenance store, walking derivation chains with a
    //! recursive CTE ported from
    //! `sentinel/security/provenance.py::_get_provenance_chain_sql`.

    use super::{ProvenanceError, ProvenanceLink, ProvenanceStore};
    use crate::model::{DataSource, TaggedData, TrustLevel};
    use async_trait::async_trait;
    use sqlx::SqlitePool;

    /// SQLite-backed provenance store for persistent deployments.
    pub struct SqliteProvenanceStore {
        pool: SqlitePool,
    }

    impl SqliteProvenanceStore {
        /// Wrap an existing pool. Schema migration is the caller's
        /// responsibility (see `migrations/` in a full deployment).
        #[must_use]
        pub fn new(pool: SqlitePool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl ProvenanceStore for SqliteProvenanceStore {
        async fn create(
            &self,
            content: String,
            trust_level: TrustLevel,
            source: DataSource,
            originated_from: String,
            derived_from: Vec<String>,
        ) -> Result<TaggedData, ProvenanceError> {
            let mut dedup_parents: Vec<String> = Vec::new();
            for parent in derived_from {
                if !dedup_parents.contains(&parent) {
                    dedup_parents.push(parent);
                }
            }

            let mut effective_trust = trust_level;
            for parent in &dedup_parents {
                let row: Option<(String,)> =
                    sqlx::query_as("SELECT trust_level FROM provenance WHERE id = ?")
                        .bind(parent)
                        .fetch_optional(&self.pool)
                        .await?;
                let (level,) =
                    row.ok_or_else(|| ProvenanceError::ParentNotFound(parent.clone()))?;
                let parent_trust = if level == "untrusted" {
                    TrustLevel::Untrusted
                } else {
                    TrustLevel::Trusted
                };
                effective_trust = effective_trust.combine(parent_trust);
            }

            let data = TaggedData::new(content, effective_trust, source)
                .with_originated_from(originated_from);
            let mut data = data;
            data.derived_from = dedup_parents;

            let trust_str = match data.trust_level {
                TrustLevel::Trusted => "trusted",
                TrustLevel::Untrusted => "untrusted",
            };
            let parents_json = serde_json::to_string(&data.derived_from)
                .expect("derived_from is always serialisable");

            sqlx::query(
                "INSERT INTO provenance (id, content, trust_level, source, originated_from, derived_from) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&data.id)
            .bind(&data.content)
            .bind(trust_str)
            .bind(format!("{:?}", data.source))
            .bind(&data.originated_from)
            .bind(&parents_json)
            .execute(&self.pool)
            .await?;

            Ok(data)
        }

        async fn get(&self, id: &str) -> Result<TaggedData, ProvenanceError> {
            let row: Option<(String, String, String, String, String, String)> = sqlx::query_as(
                "SELECT id, content, trust_level, source, originated_from, derived_from \
                 FROM provenance WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

            let (id, content, trust_level, source, originated_from, derived_from_json) =
                row.ok_or_else(|| ProvenanceError::NotFound(id.to_string()))?;

            let trust_level = if trust_level == "untrusted" {
                TrustLevel::Untrusted
            } else {
                TrustLevel::Trusted
            };
            let source = match source.as_str() {
                "User" => DataSource::User,
                "Planner" => DataSource::Planner,
                "Web" => DataSource::Web,
                "File" => DataSource::File,
                "Worker" => DataSource::Worker,
                _ => DataSource::Tool,
            };
            let derived_from: Vec<String> =
                serde_json::from_str(&derived_from_json).unwrap_or_default();

            let mut data = TaggedData::new(content, trust_level, source)
                .with_originated_from(originated_from);
            data.id = id;
            data.derived_from = derived_from;
            Ok(data)
        }

        async fn chain(&self, id: &str, max_depth: u32) -> Result<Vec<ProvenanceLink>, ProvenanceError> {
            // Ported from `_get_provenance_chain_sql`'s recursive CTE. The
            // `WHERE chain.depth < ?` guard bounds recursion to `max_depth`
            // hops so a corrupted/cyclic row set (never constructible
            // through the public API, but not storage's job to assume away)
            // cannot recurse unboundedly — `DISTINCT data_id` alone does not
            // stop a cycle from being walked, only from being reported twice.
            let rows: Vec<(String, i64)> = sqlx::query_as(
                r"
                WITH RECURSIVE chain(data_id, depth) AS (
                    SELECT id, 0 FROM provenance WHERE id = ?
                    UNION ALL
                    SELECT p.value, chain.depth + 1
                    FROM chain, provenance prov, json_each(prov.derived_from) p
                    WHERE prov.id = chain.data_id AND chain.depth < ?
                )
                SELECT DISTINCT data_id, depth FROM chain ORDER BY depth
                ",
            )
            .bind(id)
            .bind(i64::from(max_depth))
            .fetch_all(&self.pool)
            .await?;

            if rows.is_empty() {
                return Err(ProvenanceError::NotFound(id.to_string()));
            }

            Ok(rows
                .into_iter()
                .map(|(id, depth)| ProvenanceLink {
                    id,
                    depth: depth as u32,
                })
                .collect())
        }

        async fn record_file_write(&self, path: String, data_id: String) {
            let _ = sqlx::query(
                "INSERT INTO file_provenance (path, data_id) VALUES (?, ?) \
                 ON CONFLICT(path) DO UPDATE SET data_id = excluded.data_id",
            )
            .bind(path)
            .bind(data_id)
            .execute(&self.pool)
            .await;
        }

        async fn get_file_writer(&self, path: &str) -> Option<String> {
            let row: Option<(String,)> =
                sqlx::query_as("SELECT data_id FROM file_provenance WHERE path = ?")
                    .bind(path)
                    .fetch_optional(&self.pool)
                    .await
                    .ok()
                    .flatten();
            row.map(|(data_id,)| data_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_with_no_parents_keeps_declared_trust() {
        let store = InMemoryProvenanceStore::new();
        let data = store
            .create(
                "hello".into(),
                TrustLevel::Trusted,
                DataSource::User,
                String::new(),
                vec![],
            )
            .await
            .unwrap();
        assert_eq!(data.trust_level, TrustLevel::Trusted);
    }

    #[tokio::test]
    async fn create_inherits_untrusted_from_any_parent() {
        let store = InMemoryProvenanceStore::new();
        let parent_a = store
            .create("a".into(), TrustLevel::Trusted, DataSource::User, String::new(), vec![])
            .await
            .unwrap();
        let parent_b = store
            .create("b".into(), TrustLevel::Untrusted, DataSource::Web, String::new(), vec![])
            .await
            .unwrap();

        let derived = store
            .create(
                "a+b".into(),
                TrustLevel::Trusted,
                DataSource::Worker,
                String::new(),
                vec![parent_a.id.clone(), parent_b.id.clone()],
            )
            .await
            .unwrap();

        assert_eq!(derived.trust_level, TrustLevel::Untrusted);
        assert_eq!(derived.derived_from, vec![parent_a.id, parent_b.id]);
    }

    #[tokio::test]
    async fn create_dedups_parent_ids() {
        let store = InMemoryProvenanceStore::new();
        let parent = store
            .create("p".into(), TrustLevel::Trusted, DataSource::User, String::new(), vec![])
            .await
            .unwrap();
        let derived = store
            .create(
                "child".into(),
                TrustLevel::Trusted,
                DataSource::Worker,
                String::new(),
                vec![parent.id.clone(), parent.id.clone()],
            )
            .await
            .unwrap();
        assert_eq!(derived.derived_from, vec![parent.id]);
    }

    #[tokio::test]
    async fn create_with_missing_parent_errors() {
        let store = InMemoryProvenanceStore::new();
        let err = store
            .create(
                "child".into(),
                TrustLevel::Trusted,
                DataSource::Worker,
                String::new(),
                vec!["does-not-exist".into()],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProvenanceError::ParentNotFound(_)));
    }

    #[tokio::test]
    async fn chain_walks_back_through_multiple_generations() {
        let store = InMemoryProvenanceStore::new();
        let root = store
            .create("root".into(), TrustLevel::Trusted, DataSource::User, String::new(), vec![])
            .await
            .unwrap();
        let mid = store
            .create(
                "mid".into(),
                TrustLevel::Trusted,
                DataSource::Worker,
                String::new(),
                vec![root.id.clone()],
            )
            .await
            .unwrap();
        let leaf = store
            .create(
                "leaf".into(),
                TrustLevel::Trusted,
                DataSource::Worker,
                String::new(),
                vec![mid.id.clone()],
            )
            .await
            .unwrap();

        let chain = store.chain(&leaf.id, DEFAULT_CHAIN_MAX_DEPTH).await.unwrap();
        let ids: HashSet<_> = chain.iter().map(|l| l.id.clone()).collect();
        assert!(ids.contains(&root.id));
        assert!(ids.contains(&mid.id));
        assert!(ids.contains(&leaf.id));
    }

    #[tokio::test]
    async fn file_writer_roundtrip() {
        let store = InMemoryProvenanceStore::new();
        store
            .record_file_write("/workspace/out.txt".into(), "data-1".into())
            .await;
        assert_eq!(
            store.get_file_writer("/workspace/out.txt").await,
            Some("data-1".into())
        );
        assert_eq!(store.get_file_writer("/workspace/missing.txt").await, None);
    }

    #[tokio::test]
    async fn is_trust_safe_for_execution_reflects_trust_level() {
        let store = InMemoryProvenanceStore::new();
        let trusted = store
            .create("x".into(), TrustLevel::Trusted, DataSource::User, String::new(), vec![])
            .await
            .unwrap();
        let untrusted = store
            .create("y".into(), TrustLevel::Untrusted, DataSource::Web, String::new(), vec![])
            .await
            .unwrap();
        assert!(store.is_trust_safe_for_execution(&trusted.id).await.unwrap());
        assert!(!store.is_trust_safe_for_execution(&untrusted.id).await.unwrap());
    }

    #[tokio::test]
    async fn is_trust_safe_for_execution_walks_the_full_chain_not_just_the_leaf() {
        let store = InMemoryProvenanceStore::new();
        let root = store
            .create("root".into(), TrustLevel::Trusted, DataSource::User, String::new(), vec![])
            .await
            .unwrap();
        let leaf = store
            .create(
                "leaf".into(),
                TrustLevel::Trusted,
                DataSource::Worker,
                String::new(),
                vec![root.id.clone()],
            )
            .await
            .unwrap();

        // Simulate a storage-level corruption: an ancestor's trust level is
        // flipped after creation without the leaf being re-tagged. `create`
        // itself can never produce this state, but `is_trust_safe_for_execution`
        // must not assume it can't happen — a single-node check on `leaf`
        // alone would still report `Trusted` and miss it entirely.
        {
            let mut state = store.state.lock().unwrap();
            state.entries.get_mut(&root.id).unwrap().trust_level = TrustLevel::Untrusted;
        }

        assert_eq!(store.get(&leaf.id).await.unwrap().trust_level, TrustLevel::Trusted);
        assert!(!store.is_trust_safe_for_execution(&leaf.id).await.unwrap());
    }

    #[tokio::test]
    async fn chain_respects_max_depth() {
        let store = InMemoryProvenanceStore::new();
        let root = store
            .create("root".into(), TrustLevel::Trusted, DataSource::User, String::new(), vec![])
            .await
            .unwrap();
        let mid = store
            .create(
                "mid".into(),
                TrustLevel::Trusted,
                DataSource::Worker,
                String::new(),
                vec![root.id.clone()],
            )
            .await
            .unwrap();
        let leaf = store
            .create(
                "leaf".into(),
                TrustLevel::Trusted,
                DataSource::Worker,
                String::new(),
                vec![mid.id.clone()],
            )
            .await
            .unwrap();

        let shallow = store.chain(&leaf.id, 1).await.unwrap();
        let ids: HashSet<_> = shallow.iter().map(|l| l.id.clone()).collect();
        assert!(ids.contains(&leaf.id));
        assert!(ids.contains(&mid.id));
        assert!(!ids.contains(&root.id));

        let full = store.chain(&leaf.id, DEFAULT_CHAIN_MAX_DEPTH).await.unwrap();
        let full_ids: HashSet<_> = full.iter().map(|l| l.id.clone()).collect();
        assert!(full_ids.contains(&root.id));
    }
}
