use metabase_core::card::{CardPatch, MetricDefinition, MetricSource, is_metric};
use metabase_core::{Error, Result};
use serde_json::{Value, json};

use crate::dispatch::Dispatcher;

/// Metrics are cards whose `type` is `metric`; this client scopes the card
/// endpoints to them.
pub struct MetricRegistry<'a> {
    dispatcher: &'a Dispatcher,
}

fn card_list(body: Value) -> Vec<Value> {
    match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

impl<'a> MetricRegistry<'a> {
    pub fn new(dispatcher: &'a Dispatcher) -> Self {
        Self { dispatcher }
    }

    pub async fn list(&self) -> Result<Vec<Value>> {
        let cards = self.dispatcher.get("/card").await?;
        Ok(card_list(cards).into_iter().filter(is_metric).collect())
    }

    pub async fn get(&self, metric_id: i64) -> Result<Value> {
        if metric_id <= 0 {
            return Err(Error::invalid_field(
                "metric_id",
                format!("metric_id must be a positive integer, got {metric_id}"),
            ));
        }
        let card = self.dispatcher.get(&format!("/card/{metric_id}")).await?;
        if !is_metric(&card) {
            return Err(Error::invalid_field(
                "metric_id",
                format!("card {metric_id} is not a metric"),
            ));
        }
        Ok(card)
    }

    pub async fn source(&self, metric_id: i64) -> Result<MetricSource> {
        MetricSource::from_card(&self.get(metric_id).await?)
    }

    pub async fn create(&self, definition: &MetricDefinition) -> Result<Value> {
        let payload = definition.to_payload()?;
        let created = self.dispatcher.post("/card", &payload).await?;
        tracing::info!(
            metric_id = ?created.get("id"),
            table_id = definition.source_table_id,
            "metric created"
        );
        Ok(created)
    }

    pub async fn update(&self, metric_id: i64, patch: &CardPatch) -> Result<Value> {
        self.get(metric_id).await?;
        self.dispatcher
            .put(&format!("/card/{metric_id}"), &patch.to_value())
            .await
    }

    /// Archives the metric; Metabase keeps archived cards restorable.
    pub async fn delete(&self, metric_id: i64) -> Result<Value> {
        self.get(metric_id).await?;
        self.dispatcher
            .put(&format!("/card/{metric_id}"), &json!({ "archived": true }))
            .await
    }

    /// Metrics defined on `table_id`, optionally narrowed by a
    /// case-insensitive name substring.
    pub async fn search(&self, table_id: i64, query: Option<&str>) -> Result<Vec<Value>> {
        let needle = query
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_lowercase);
        let metrics = self.list().await?;
        Ok(metrics
            .into_iter()
            .filter(|metric| metric.get("table_id").and_then(Value::as_i64) == Some(table_id))
            .filter(|metric| match &needle {
                None => true,
                Some(needle) => metric
                    .get("name")
                    .and_then(Value::as_str)
                    .is_some_and(|name| name.to_lowercase().contains(needle)),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use httpmock::prelude::*;
    use metabase_core::Credential;
    use url::Url;

    use super::*;
    use crate::dispatch::RetryPolicy;
    use crate::session::SessionAuthenticator;

    fn dispatcher(server: &MockServer) -> Dispatcher {
        let http = reqwest::Client::new();
        let base_url = Url::parse(&server.base_url()).unwrap();
        let auth = Arc::new(SessionAuthenticator::new(
            Credential::ApiKey("mb_key".to_string()),
            base_url.clone(),
            http.clone(),
            Duration::from_secs(5),
        ));
        Dispatcher::new(http, base_url, auth, Duration::from_secs(5), RetryPolicy::default())
    }

    fn cards() -> Value {
        json!([
            { "id": 1, "name": "Total Revenue", "type": "metric", "table_id": 3, "database_id": 1 },
            { "id": 2, "name": "Orders by month", "type": "question", "table_id": 3, "database_id": 1 },
            { "id": 3, "name": "Refund revenue", "type": "metric", "table_id": 3, "database_id": 1 },
            { "id": 4, "name": "Active users", "type": "metric", "table_id": 8, "database_id": 1 }
        ])
    }

    #[tokio::test]
    async fn search_is_table_scoped_and_case_insensitive() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/card");
                then.status(200).json_body(cards());
            })
            .await;
        let dispatcher = dispatcher(&server);
        let registry = MetricRegistry::new(&dispatcher);

        let all = registry.list().await.unwrap();
        assert_eq!(all.len(), 3);

        let hits = registry.search(3, Some("REVENUE")).await.unwrap();
        let ids: Vec<i64> = hits.iter().filter_map(|m| m["id"].as_i64()).collect();
        assert_eq!(ids, vec![1, 3]);

        let users = registry.search(8, None).await.unwrap();
        assert_eq!(users.len(), 1);
    }

    #[tokio::test]
    async fn plain_cards_are_not_returned_as_metrics() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/card/2");
                then.status(200)
                    .json_body(json!({ "id": 2, "name": "Orders", "type": "question" }));
            })
            .await;
        let dispatcher = dispatcher(&server);

        let err = MetricRegistry::new(&dispatcher).get(2).await.unwrap_err();
        assert_eq!(err.field(), Some("metric_id"));
    }

    #[tokio::test]
    async fn delete_archives_the_metric() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/card/1");
                then.status(200).json_body(json!({ "id": 1, "type": "metric" }));
            })
            .await;
        let archive = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/api/card/1")
                    .json_body(json!({ "archived": true }));
                then.status(200)
                    .json_body(json!({ "id": 1, "type": "metric", "archived": true }));
            })
            .await;
        let dispatcher = dispatcher(&server);

        let result = MetricRegistry::new(&dispatcher).delete(1).await.unwrap();
        assert_eq!(result["archived"], true);
        archive.assert_hits_async(1).await;
    }
}
