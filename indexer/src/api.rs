//! Read API handlers.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    server::{RpcErrorObject, RpcServer},
    sink::{RelationDocument, RelationQuery, RelationStore},
};

const DEFAULT_LIMIT: u64 = 100;
const MAX_LIMIT: u64 = 1000;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FindRelationsParams {
    pub from: String,
    pub to: String,
    pub providers: Vec<String>,
    pub after: String,
    pub limit: u64,
}

#[derive(Debug, Serialize)]
pub struct FindRelationsResponse {
    pub relations: Vec<RelationView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationView {
    pub from: String,
    pub to: String,
    pub provider: String,
    /// RFC 3339 timestamp.
    pub connected_at: String,
    pub disconnected_at: Option<String>,
    /// Base64-encoded payload.
    pub extra: String,
}

/// Register the read methods on the server.
pub fn register_api<S>(server: &mut RpcServer, store: Arc<S>)
where
    S: RelationStore,
{
    server.register("sg_findRelations", move |params| {
        let store = store.clone();
        async move {
            let params: FindRelationsParams = serde_json::from_value(params)
                .map_err(|err| RpcErrorObject::handler(format!("unmarshal params: {err}")))?;

            let response = find_relations(store.as_ref(), params).await?;

            serde_json::to_value(response)
                .map_err(|err| RpcErrorObject::handler(format!("marshal response: {err}")))
        }
    });
}

pub async fn find_relations<S>(
    store: &S,
    params: FindRelationsParams,
) -> Result<FindRelationsResponse, RpcErrorObject>
where
    S: RelationStore,
{
    let limit = if params.limit == 0 {
        DEFAULT_LIMIT
    } else {
        params.limit
    };

    if limit > MAX_LIMIT {
        return Err(RpcErrorObject::handler("invalid limit"));
    }

    let query = RelationQuery {
        from: none_if_empty(params.from),
        to: none_if_empty(params.to),
        providers: params.providers,
        after: none_if_empty(params.after),
        limit,
    };

    let documents = store.fetch_relations(query).await.map_err(|err| {
        warn!(err = ?err, "failed to fetch relations");
        RpcErrorObject::handler(format!("fetch relations: {err}"))
    })?;

    let relations = documents
        .into_iter()
        .map(relation_view)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(FindRelationsResponse { relations })
}

fn relation_view(document: RelationDocument) -> Result<RelationView, RpcErrorObject> {
    let connected_at = document
        .connected_at
        .try_to_rfc3339_string()
        .map_err(|err| RpcErrorObject::handler(format!("format connected_at: {err}")))?;

    let disconnected_at = document
        .disconnected_at
        .map(|at| at.try_to_rfc3339_string())
        .transpose()
        .map_err(|err| RpcErrorObject::handler(format!("format disconnected_at: {err}")))?;

    Ok(RelationView {
        from: document.from,
        to: document.to,
        provider: document.provider,
        connected_at,
        disconnected_at,
        extra: BASE64.encode(document.extra.bytes),
    })
}

fn none_if_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use mongodb::bson::{oid::ObjectId, spec::BinarySubtype, Binary, DateTime};

    use crate::core::Relation;
    use crate::sink::StoreError;

    use super::*;

    #[derive(Default)]
    struct CapturingStore {
        queries: Mutex<Vec<RelationQuery>>,
        documents: Vec<RelationDocument>,
    }

    #[async_trait]
    impl RelationStore for CapturingStore {
        async fn save_relations(
            &self,
            _relations: &[Relation],
        ) -> error_stack::Result<(), StoreError> {
            Ok(())
        }

        async fn fetch_relations(
            &self,
            query: RelationQuery,
        ) -> error_stack::Result<Vec<RelationDocument>, StoreError> {
            self.queries.lock().unwrap().push(query);
            Ok(self.documents.clone())
        }
    }

    fn document() -> RelationDocument {
        RelationDocument {
            id: Some(ObjectId::new()),
            from: "A58".to_string(),
            to: "B58".to_string(),
            provider: "P58".to_string(),
            connected_at: DateTime::from_millis(1_700_000_000_000),
            disconnected_at: None,
            extra: Binary {
                subtype: BinarySubtype::Generic,
                bytes: vec![0x01],
            },
        }
    }

    #[tokio::test]
    async fn test_zero_limit_defaults_to_100() {
        let store = CapturingStore::default();
        find_relations(&store, FindRelationsParams::default())
            .await
            .unwrap();

        let queries = store.queries.lock().unwrap();
        assert_eq!(queries[0].limit, 100);
        assert!(queries[0].from.is_none());
        assert!(queries[0].to.is_none());
    }

    #[tokio::test]
    async fn test_limit_above_1000_is_rejected() {
        let store = CapturingStore::default();
        let params = FindRelationsParams {
            limit: 1001,
            ..FindRelationsParams::default()
        };

        let err = find_relations(&store, params).await.unwrap_err();
        assert_eq!(err.code, -32000);
        assert!(store.queries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_filters_are_passed_through() {
        let store = CapturingStore::default();
        let params = FindRelationsParams {
            from: "A58".to_string(),
            providers: vec!["P58".to_string()],
            limit: 2,
            ..FindRelationsParams::default()
        };

        find_relations(&store, params).await.unwrap();

        let queries = store.queries.lock().unwrap();
        assert_eq!(queries[0].from.as_deref(), Some("A58"));
        assert_eq!(queries[0].providers, vec!["P58".to_string()]);
        assert_eq!(queries[0].limit, 2);
    }

    #[tokio::test]
    async fn test_relation_view_shape() {
        let store = CapturingStore {
            documents: vec![document()],
            ..CapturingStore::default()
        };

        let response = find_relations(&store, FindRelationsParams::default())
            .await
            .unwrap();

        let view = &response.relations[0];
        assert_eq!(view.from, "A58");
        assert_eq!(view.provider, "P58");
        assert_eq!(view.connected_at, "2023-11-14T22:13:20Z");
        assert!(view.disconnected_at.is_none());
        assert_eq!(view.extra, "AQ==");
    }
}
