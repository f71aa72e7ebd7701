//! Document storage behind the ingest server.
//!
//! Documents are plain JSON objects. Every stored document carries a string
//! `_id`; the in-memory store generates UUIDs, MongoDB generates ObjectIds
//! which are flattened to their hex form on the way out.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Collection holding interaction samples.
pub const INTERACTIONS: &str = "interactions";
/// Collection holding survey answers.
pub const USERS: &str = "users";

/// Which documents a query selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    All,
    /// A single document by `_id`
    Id(String),
    /// Samples recorded for one user
    UserId(String),
}

/// Skip/limit window over a result set. A limit of 0 means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Page {
    pub skip: u64,
    pub limit: u64,
}

impl Page {
    pub const ALL: Page = Page { skip: 0, limit: 0 };

    /// Parse a `skip-limit` path segment. Unparsable parts read as 0.
    pub fn parse(range: &str) -> Self {
        let (skip, limit) = range.split_once('-').unwrap_or((range, ""));
        Self {
            skip: leading_int(skip),
            limit: leading_int(limit),
        }
    }

    fn apply<'a>(&self, docs: impl Iterator<Item = &'a Value>) -> Vec<Value> {
        let docs = docs.skip(self.skip as usize).cloned();
        if self.limit == 0 {
            docs.collect()
        } else {
            docs.take(self.limit as usize).collect()
        }
    }
}

fn leading_int(part: &str) -> u64 {
    let part = part.trim_start();
    let end = part
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(part.len());
    part[..end].parse().unwrap_or(0)
}

/// Storage errors.
#[derive(Debug)]
pub enum StoreError {
    /// Document is not a JSON object
    InvalidDocument(String),
    /// Backend connection failure
    Connection(String),
    /// Backend rejected the operation
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::InvalidDocument(e) => write!(f, "invalid document: {e}"),
            StoreError::Connection(e) => write!(f, "store connection error: {e}"),
            StoreError::Backend(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// A document collection store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert all documents. Order is not guaranteed; one bad document does
    /// not stop the others. Returns the number inserted.
    async fn insert_many(&self, collection: &str, docs: Vec<Value>) -> Result<usize, StoreError>;

    /// Insert one document and return its generated `_id`.
    async fn insert_one(&self, collection: &str, doc: Value) -> Result<String, StoreError>;

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        page: Page,
    ) -> Result<Vec<Value>, StoreError>;

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError>;
}

/// Process-local store, used when no database is configured.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_id(doc: Value) -> Result<(String, Value), StoreError> {
        let mut map = match doc {
            Value::Object(map) => map,
            other => {
                return Err(StoreError::InvalidDocument(format!(
                    "expected an object, got {other}"
                )))
            }
        };
        let id = match map.get("_id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = uuid::Uuid::new_v4().simple().to_string();
                map.insert("_id".to_string(), Value::String(id.clone()));
                id
            }
        };
        Ok((id, Value::Object(map)))
    }
}

fn matches(filter: &Filter, doc: &Value) -> bool {
    match filter {
        Filter::All => true,
        Filter::Id(id) => doc.get("_id").and_then(Value::as_str) == Some(id.as_str()),
        Filter::UserId(user) => doc.get("userId").and_then(Value::as_str) == Some(user.as_str()),
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_many(&self, collection: &str, docs: Vec<Value>) -> Result<usize, StoreError> {
        let mut accepted = Vec::with_capacity(docs.len());
        let mut first_error = None;
        for doc in docs {
            match Self::with_id(doc) {
                Ok((_, doc)) => accepted.push(doc),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        let inserted = accepted.len();
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .extend(accepted);

        match first_error {
            Some(e) if inserted == 0 => Err(e),
            Some(e) => {
                tracing::warn!("{collection}: some documents were rejected: {e}");
                Ok(inserted)
            }
            None => Ok(inserted),
        }
    }

    async fn insert_one(&self, collection: &str, doc: Value) -> Result<String, StoreError> {
        let (id, doc) = Self::with_id(doc)?;
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .push(doc);
        Ok(id)
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        page: Page,
    ) -> Result<Vec<Value>, StoreError> {
        let collections = self.collections.read().await;
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(page.apply(docs.iter().filter(|doc| matches(filter, doc))))
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|docs| docs.iter().filter(|doc| matches(filter, doc)).count() as u64)
            .unwrap_or(0))
    }
}

#[cfg(feature = "mongo")]
pub use mongo::MongoStore;

#[cfg(feature = "mongo")]
mod mongo {
    use super::{DocumentStore, Filter, Page, StoreError};
    use async_trait::async_trait;
    use futures_util::TryStreamExt;
    use mongodb::bson::{self, doc, oid::ObjectId, Bson, Document};
    use mongodb::options::{FindOptions, InsertManyOptions};
    use mongodb::{Client, Database};
    use serde_json::Value;

    /// MongoDB-backed store.
    pub struct MongoStore {
        db: Database,
    }

    impl MongoStore {
        pub async fn connect(uri: &str, db_name: &str) -> Result<Self, StoreError> {
            let client = Client::with_uri_str(uri)
                .await
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            tracing::info!("Connected to MongoDB database '{db_name}'");
            Ok(Self {
                db: client.database(db_name),
            })
        }

        /// Translate a filter. `None` means nothing can match.
        fn filter_doc(filter: &Filter) -> Option<Document> {
            match filter {
                Filter::All => Some(Document::new()),
                Filter::Id(id) => ObjectId::parse_str(id)
                    .ok()
                    .map(|oid| doc! { "_id": oid }),
                Filter::UserId(user) => Some(doc! { "userId": user.as_str() }),
            }
        }
    }

    fn to_document(value: &Value) -> Result<Document, StoreError> {
        bson::to_document(value).map_err(|e| StoreError::InvalidDocument(e.to_string()))
    }

    fn id_string(id: &Bson) -> String {
        match id {
            Bson::ObjectId(oid) => oid.to_hex(),
            Bson::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn to_json(mut doc: Document) -> Value {
        if let Some(id) = doc.get("_id").map(id_string) {
            doc.insert("_id", id);
        }
        Bson::Document(doc).into_relaxed_extjson()
    }

    #[async_trait]
    impl DocumentStore for MongoStore {
        async fn insert_many(
            &self,
            collection: &str,
            docs: Vec<Value>,
        ) -> Result<usize, StoreError> {
            let docs = docs
                .iter()
                .map(to_document)
                .collect::<Result<Vec<_>, _>>()?;
            if docs.is_empty() {
                return Ok(0);
            }

            let mut options = InsertManyOptions::default();
            options.ordered = Some(false);
            let result = self
                .db
                .collection::<Document>(collection)
                .insert_many(docs, options)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(result.inserted_ids.len())
        }

        async fn insert_one(&self, collection: &str, doc: Value) -> Result<String, StoreError> {
            let doc = to_document(&doc)?;
            let result = self
                .db
                .collection::<Document>(collection)
                .insert_one(doc, None)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(id_string(&result.inserted_id))
        }

        async fn find(
            &self,
            collection: &str,
            filter: &Filter,
            page: Page,
        ) -> Result<Vec<Value>, StoreError> {
            let Some(filter) = Self::filter_doc(filter) else {
                return Ok(Vec::new());
            };

            let mut options = FindOptions::default();
            options.skip = Some(page.skip);
            if page.limit > 0 {
                options.limit = Some(page.limit as i64);
            }

            let cursor = self
                .db
                .collection::<Document>(collection)
                .find(filter, options)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            let docs: Vec<Document> = cursor
                .try_collect()
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(docs.into_iter().map(to_json).collect())
        }

        async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
            let Some(filter) = Self::filter_doc(filter) else {
                return Ok(0);
            };
            self.db
                .collection::<Document>(collection)
                .count_documents(filter, None)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_page_parse() {
        assert_eq!(Page::parse("10-20"), Page { skip: 10, limit: 20 });
        assert_eq!(Page::parse("5-"), Page { skip: 5, limit: 0 });
        assert_eq!(Page::parse("-3"), Page { skip: 0, limit: 3 });
        assert_eq!(Page::parse("abc-7x"), Page { skip: 0, limit: 7 });
        assert_eq!(Page::parse("12"), Page { skip: 12, limit: 0 });
    }

    #[tokio::test]
    async fn test_insert_and_page() {
        let store = MemoryStore::new();
        let docs = (0..5).map(|i| json!({ "userId": "u1", "n": i })).collect();
        assert_eq!(store.insert_many(INTERACTIONS, docs).await.unwrap(), 5);

        let page = store
            .find(INTERACTIONS, &Filter::All, Page { skip: 1, limit: 2 })
            .await
            .unwrap();
        let ns: Vec<_> = page.iter().map(|d| d["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![1, 2]);

        // Limit 0 returns everything after the skip.
        let rest = store
            .find(INTERACTIONS, &Filter::All, Page { skip: 3, limit: 0 })
            .await
            .unwrap();
        assert_eq!(rest.len(), 2);
    }

    #[tokio::test]
    async fn test_filters() {
        let store = MemoryStore::new();
        store
            .insert_many(
                INTERACTIONS,
                vec![
                    json!({ "userId": "u1" }),
                    json!({ "userId": "u2" }),
                    json!({ "userId": "u1" }),
                ],
            )
            .await
            .unwrap();

        let filter = Filter::UserId("u1".to_string());
        assert_eq!(store.count(INTERACTIONS, &filter).await.unwrap(), 2);
        assert_eq!(store.count(INTERACTIONS, &Filter::All).await.unwrap(), 3);

        let id = store.insert_one(USERS, json!({ "age": "25" })).await.unwrap();
        let found = store
            .find(USERS, &Filter::Id(id.clone()), Page::ALL)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["_id"], json!(id));

        let missing = store
            .find(USERS, &Filter::Id("nope".to_string()), Page::ALL)
            .await
            .unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn test_non_object_documents_are_skipped() {
        let store = MemoryStore::new();
        let inserted = store
            .insert_many(INTERACTIONS, vec![json!({ "a": 1 }), json!(42)])
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        let err = store.insert_one(USERS, json!("text")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidDocument(_)));
    }

    #[tokio::test]
    async fn test_unknown_collection_is_empty() {
        let store = MemoryStore::new();
        assert!(store
            .find("missing", &Filter::All, Page::ALL)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.count("missing", &Filter::All).await.unwrap(), 0);
    }
}
