//! MongoDB-backed relation store.
//!
//! Relations are immutable documents in the `relations` collection;
//! duplicate inserts of the same relation are tolerated by the read model
//! since delivery upstream is at least once.

use async_trait::async_trait;
use error_stack::{Result, ResultExt};
use futures_util::TryStreamExt;
use mongodb::{
    bson::{doc, oid::ObjectId, spec::BinarySubtype, Binary, DateTime, Document},
    options::{ClientOptions, FindOptions},
    Client, Collection, IndexModel,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::Relation;

const DATABASE_NAME: &str = "graph";
const RELATIONS_COLLECTION: &str = "relations";
const MONGO_PORT: u16 = 27017;
const MAX_IDLE_CONNECTIONS: u32 = 10;

#[derive(Debug)]
pub enum StoreError {
    Connection,
    Insert,
    Query,
}

impl error_stack::Context for StoreError {}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Connection => f.write_str("failed to connect to the store"),
            StoreError::Insert => f.write_str("failed to insert relations"),
            StoreError::Query => f.write_str("failed to query relations"),
        }
    }
}

/// Stored form of a relation. Keys are base58 strings so the indexed
/// fields are directly comparable to API inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationDocument {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub from: String,
    pub to: String,
    pub provider: String,
    pub connected_at: DateTime,
    pub disconnected_at: Option<DateTime>,
    pub extra: Binary,
}

impl From<&Relation> for RelationDocument {
    fn from(relation: &Relation) -> Self {
        Self {
            id: None,
            from: relation.from.to_string(),
            to: relation.to.to_string(),
            provider: relation.provider.to_string(),
            connected_at: DateTime::from_millis(relation.connected_at * 1000),
            disconnected_at: relation
                .disconnected_at
                .map(|seconds| DateTime::from_millis(seconds * 1000)),
            extra: Binary {
                subtype: BinarySubtype::Generic,
                bytes: relation.extra.clone(),
            },
        }
    }
}

/// Filter for [`RelationStore::fetch_relations`]. Ids are returned in
/// descending order; `after` continues a previous page.
#[derive(Debug, Clone, Default)]
pub struct RelationQuery {
    pub from: Option<String>,
    pub to: Option<String>,
    pub providers: Vec<String>,
    /// Hex object id; only documents with a smaller id are returned.
    pub after: Option<String>,
    pub limit: u64,
}

#[async_trait]
pub trait RelationStore: Send + Sync + 'static {
    async fn save_relations(&self, relations: &[Relation]) -> Result<(), StoreError>;
    async fn fetch_relations(&self, query: RelationQuery)
        -> Result<Vec<RelationDocument>, StoreError>;
}

#[derive(Clone)]
pub struct MongoStore {
    collection: Collection<RelationDocument>,
}

impl MongoStore {
    /// Connect to the store and verify the server is reachable. `host` may
    /// carry an explicit port, otherwise the default port is used.
    pub async fn connect(host: &str) -> Result<Self, StoreError> {
        let address = if host.contains(':') {
            host.to_string()
        } else {
            format!("{host}:{MONGO_PORT}")
        };
        let uri = format!("mongodb://{address}/{DATABASE_NAME}");

        let mut options = ClientOptions::parse(&uri)
            .await
            .change_context(StoreError::Connection)
            .attach_printable_lazy(|| format!("uri: {uri}"))?;
        options.max_pool_size = Some(MAX_IDLE_CONNECTIONS);

        let client = Client::with_options(options)
            .change_context(StoreError::Connection)
            .attach_printable("failed to create mongo client")?;

        let database = client.database(DATABASE_NAME);
        database
            .run_command(doc! { "ping": 1 }, None)
            .await
            .change_context(StoreError::Connection)
            .attach_printable("mongo ping failed")?;

        Ok(Self {
            collection: database.collection(RELATIONS_COLLECTION),
        })
    }

    /// Create the secondary indexes used by the read API.
    pub async fn initialize(&self) -> Result<(), StoreError> {
        for field in ["from", "to", "provider"] {
            let mut keys = Document::new();
            keys.insert(field, 1);
            let index = IndexModel::builder().keys(keys).build();
            self.collection
                .create_index(index, None)
                .await
                .change_context(StoreError::Connection)
                .attach_printable_lazy(|| format!("failed to create index on {field}"))?;
        }

        info!("relation store initialized");
        Ok(())
    }
}

#[async_trait]
impl RelationStore for MongoStore {
    async fn save_relations(&self, relations: &[Relation]) -> Result<(), StoreError> {
        if relations.is_empty() {
            return Ok(());
        }

        let documents = relations
            .iter()
            .map(RelationDocument::from)
            .collect::<Vec<_>>();

        self.collection
            .insert_many(documents, None)
            .await
            .change_context(StoreError::Insert)?;

        Ok(())
    }

    async fn fetch_relations(
        &self,
        query: RelationQuery,
    ) -> Result<Vec<RelationDocument>, StoreError> {
        let mut filter = doc! {};

        if let Some(from) = query.from {
            filter.insert("from", from);
        }

        if let Some(to) = query.to {
            filter.insert("to", to);
        }

        if !query.providers.is_empty() {
            filter.insert("provider", doc! { "$in": query.providers });
        }

        if let Some(after) = query.after {
            let oid = ObjectId::parse_str(&after)
                .change_context(StoreError::Query)
                .attach_printable_lazy(|| format!("invalid after cursor: {after}"))?;
            filter.insert("_id", doc! { "$lt": oid });
        }

        let options = FindOptions::builder()
            .sort(doc! { "_id": -1 })
            .limit(query.limit as i64)
            .build();

        self.collection
            .find(filter, options)
            .await
            .change_context(StoreError::Query)?
            .try_collect()
            .await
            .change_context(StoreError::Query)
            .attach_printable("failed to decode find results")
    }
}

#[cfg(test)]
mod tests {
    use solana_sdk::pubkey::Pubkey;

    use super::*;

    #[test]
    fn test_document_from_relation() {
        let relation = Relation {
            from: Pubkey::new_unique(),
            to: Pubkey::new_unique(),
            provider: Pubkey::new_unique(),
            connected_at: 1_700_000_000,
            disconnected_at: None,
            extra: vec![0x01],
        };

        let document = RelationDocument::from(&relation);
        assert_eq!(document.from, relation.from.to_string());
        assert_eq!(document.to, relation.to.to_string());
        assert_eq!(document.provider, relation.provider.to_string());
        assert_eq!(
            document.connected_at,
            DateTime::from_millis(1_700_000_000_000)
        );
        assert!(document.disconnected_at.is_none());
        assert_eq!(document.extra.bytes, vec![0x01]);
        assert!(document.id.is_none());
    }
}
