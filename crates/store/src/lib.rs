#[cfg(feature = "fault-injection")]
use std::collections::HashSet;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use roster_contracts::{Document, ID_FIELD, RecordId};
use sqlx::Row;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug)]
pub enum StoreError {
    Timeout,
    DuplicateKey {
        collection: String,
        document_id: String,
    },
    InvalidDocument(&'static str),
    Sqlx(sqlx::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Timeout => write!(f, "store operation timed out"),
            StoreError::DuplicateKey {
                collection,
                document_id,
            } => write!(
                f,
                "duplicate _id {} in collection {}",
                document_id, collection
            ),
            StoreError::InvalidDocument(reason) => write!(f, "invalid document: {}", reason),
            StoreError::Sqlx(err) => write!(f, "store sql error: {}", err),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Sqlx(err) => Some(err),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        StoreError::Sqlx(value)
    }
}

/// Which fields `find` returns. `Include` always keeps `_id`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Projection {
    #[default]
    All,
    Include(Vec<String>),
    Exclude(Vec<String>),
}

impl Projection {
    pub fn apply(&self, mut doc: Document) -> Document {
        match self {
            Projection::All => doc,
            Projection::Include(fields) => {
                doc.retain(|key, _| key == ID_FIELD || fields.iter().any(|f| f == key));
                doc
            }
            Projection::Exclude(fields) => {
                for field in fields {
                    doc.remove(field);
                }
                doc
            }
        }
    }
}

/// Top-level equality filter; an empty filter matches every document.
pub type Filter = Document;

fn matches(doc: &Document, filter: &Filter) -> bool {
    filter
        .iter()
        .all(|(key, expected)| doc.get(key) == Some(expected))
}

fn document_id(doc: &Document) -> Result<String, StoreError> {
    match doc.get(ID_FIELD) {
        Some(serde_json::Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        _ => Err(StoreError::InvalidDocument("_id must be a non-empty string")),
    }
}

#[derive(Default)]
struct MemoryState {
    collections: HashMap<String, Vec<Document>>,
    #[cfg(feature = "fault-injection")]
    unresponsive: HashSet<String>,
}

type MemoryCollections = Arc<RwLock<MemoryState>>;

#[derive(Clone)]
enum Backend {
    Postgres(sqlx::PgPool),
    Memory(MemoryCollections),
}

/// Handle to the document store. Cheap to clone; every clone shares the same
/// pool (or in-memory collections).
#[derive(Clone)]
pub struct DocumentStore {
    backend: Backend,
    write_timeout: Duration,
}

impl DocumentStore {
    pub async fn connect(db_url: &str, write_timeout: Duration) -> Result<Self, StoreError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new().max_connections(8).connect(db_url),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(Self {
            backend: Backend::Postgres(pool),
            write_timeout,
        })
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        write_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let store = Self::connect(db_url, write_timeout).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub fn in_memory() -> Self {
        Self::in_memory_with_timeout(Duration::from_secs(2))
    }

    pub fn in_memory_with_timeout(write_timeout: Duration) -> Self {
        Self {
            backend: Backend::Memory(Arc::new(RwLock::new(MemoryState::default()))),
            write_timeout,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match &self.backend {
            Backend::Postgres(_) => "postgres",
            Backend::Memory(_) => "memory",
        }
    }

    /// Applies pending migrations. Safe to call any number of times.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let Backend::Postgres(pool) = &self.backend else {
            return Ok(());
        };

        tokio::time::timeout(Duration::from_secs(10), migrate(pool))
            .await
            .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    pub fn collection(&self, name: &str) -> Collection<'_> {
        Collection {
            store: self,
            name: name.to_string(),
        }
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Postgres(pool) => {
                self.bounded(sqlx::query("SELECT 1").execute(pool)).await?;
                Ok(())
            }
            Backend::Memory(_) => Ok(()),
        }
    }

    /// Empties every collection. Fixture reset only; nothing on the request path calls it.
    pub async fn clear_all(&self) -> Result<u64, StoreError> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let result = self
                    .bounded(sqlx::query("DELETE FROM roster_documents").execute(pool))
                    .await?;
                Ok(result.rows_affected())
            }
            Backend::Memory(state) => {
                let mut state = self.write_memory(state).await?;
                let removed = state
                    .collections
                    .values()
                    .map(|docs| docs.len() as u64)
                    .sum();
                state.collections.clear();
                Ok(removed)
            }
        }
    }

    /// Makes every later insert into `collection` fail with [`StoreError::Timeout`],
    /// as if the store stopped answering. Memory backend only.
    #[cfg(feature = "fault-injection")]
    pub async fn make_unresponsive(&self, collection: &str) {
        if let Backend::Memory(state) = &self.backend {
            state.write().await.unresponsive.insert(collection.to_string());
        }
    }

    pub async fn close(&self) {
        if let Backend::Postgres(pool) = &self.backend {
            pool.close().await;
        }
    }

    async fn read_memory<'a>(
        &self,
        state: &'a RwLock<MemoryState>,
    ) -> Result<RwLockReadGuard<'a, MemoryState>, StoreError> {
        tokio::time::timeout(self.write_timeout, state.read())
            .await
            .map_err(|_| StoreError::Timeout)
    }

    async fn write_memory<'a>(
        &self,
        state: &'a RwLock<MemoryState>,
    ) -> Result<RwLockWriteGuard<'a, MemoryState>, StoreError> {
        tokio::time::timeout(self.write_timeout, state.write())
            .await
            .map_err(|_| StoreError::Timeout)
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, sqlx::Error>>,
    ) -> Result<T, StoreError> {
        let out = tokio::time::timeout(self.write_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout)??;
        Ok(out)
    }
}

pub struct Collection<'a> {
    store: &'a DocumentStore,
    name: String,
}

impl Collection<'_> {
    /// Inserts `doc` and returns it as stored. A document without `_id` gets a
    /// freshly generated one.
    pub async fn insert_one(&self, mut doc: Document) -> Result<Document, StoreError> {
        if !doc.contains_key(ID_FIELD) {
            doc.insert(ID_FIELD.to_string(), RecordId::generate().into());
        }
        let document_id = document_id(&doc)?;

        match &self.store.backend {
            Backend::Postgres(pool) => {
                let body = serde_json::Value::Object(doc.clone());
                let result = self
                    .store
                    .bounded(
                        sqlx::query(
                            "INSERT INTO roster_documents (collection, document_id, body) VALUES ($1, $2, $3)",
                        )
                        .bind(&self.name)
                        .bind(&document_id)
                        .bind(&body)
                        .execute(pool),
                    )
                    .await;

                match result {
                    Err(StoreError::Sqlx(sqlx::Error::Database(db_err)))
                        if db_err.is_unique_violation() =>
                    {
                        Err(StoreError::DuplicateKey {
                            collection: self.name.clone(),
                            document_id,
                        })
                    }
                    Err(err) => Err(err),
                    Ok(_) => Ok(doc),
                }
            }
            Backend::Memory(state) => {
                let mut state = self.store.write_memory(state).await?;
                #[cfg(feature = "fault-injection")]
                if state.unresponsive.contains(&self.name) {
                    return Err(StoreError::Timeout);
                }
                let docs = state.collections.entry(self.name.clone()).or_default();
                let duplicate = docs
                    .iter()
                    .any(|existing| document_id_of(existing).as_deref() == Some(document_id.as_str()));
                if duplicate {
                    return Err(StoreError::DuplicateKey {
                        collection: self.name.clone(),
                        document_id,
                    });
                }
                docs.push(doc.clone());
                Ok(doc)
            }
        }
    }

    /// Documents matching `filter`, in insertion order.
    pub async fn find(
        &self,
        filter: &Filter,
        projection: &Projection,
    ) -> Result<Vec<Document>, StoreError> {
        let docs = match &self.store.backend {
            Backend::Postgres(pool) => {
                // Containment narrows in SQL; `matches` below keeps exact equality semantics.
                let rows = self
                    .store
                    .bounded(
                        sqlx::query(
                            "SELECT body FROM roster_documents WHERE collection = $1 AND body @> $2 ORDER BY seq",
                        )
                        .bind(&self.name)
                        .bind(serde_json::Value::Object(filter.clone()))
                        .fetch_all(pool),
                    )
                    .await?;

                let mut docs = Vec::with_capacity(rows.len());
                for row in rows {
                    let body: serde_json::Value = row.try_get("body")?;
                    let serde_json::Value::Object(doc) = body else {
                        return Err(StoreError::InvalidDocument("stored body is not an object"));
                    };
                    docs.push(doc);
                }
                docs
            }
            Backend::Memory(state) => self
                .store
                .read_memory(state)
                .await?
                .collections
                .get(&self.name)
                .cloned()
                .unwrap_or_default(),
        };

        Ok(docs
            .into_iter()
            .filter(|doc| matches(doc, filter))
            .map(|doc| projection.apply(doc))
            .collect())
    }

    pub async fn delete_many(&self) -> Result<u64, StoreError> {
        match &self.store.backend {
            Backend::Postgres(pool) => {
                let result = self
                    .store
                    .bounded(
                        sqlx::query("DELETE FROM roster_documents WHERE collection = $1")
                            .bind(&self.name)
                            .execute(pool),
                    )
                    .await?;
                Ok(result.rows_affected())
            }
            Backend::Memory(state) => {
                let removed = self
                    .store
                    .write_memory(state)
                    .await?
                    .collections
                    .remove(&self.name)
                    .map(|docs| docs.len() as u64)
                    .unwrap_or(0);
                Ok(removed)
            }
        }
    }
}

fn document_id_of(doc: &Document) -> Option<String> {
    document_id(doc).ok()
}

pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
