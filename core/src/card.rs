//! Request bodies for saved questions (cards) and metric cards.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::query::{
    Aggregation, FieldRef, FilterClause, OrderBy, QueryIr, QueryRequest, build_query,
};

pub const DEFAULT_DISPLAY: &str = "table";
pub const METRIC_CARD_TYPE: &str = "metric";

/// Optional presentation/placement fields shared by every card kind.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CardOptions {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub collection_id: Option<i64>,
    #[serde(default)]
    pub display: Option<String>,
    #[serde(default)]
    pub visualization_settings: Option<Map<String, Value>>,
}

impl CardOptions {
    fn apply(self, payload: &mut Value, default_display: &str) {
        payload["display"] = json!(self.display.unwrap_or_else(|| default_display.to_string()));
        payload["visualization_settings"] =
            Value::Object(self.visualization_settings.unwrap_or_default());
        if let Some(description) = self.description.filter(|d| !d.trim().is_empty()) {
            payload["description"] = json!(description);
        }
        if let Some(collection_id) = self.collection_id {
            payload["collection_id"] = json!(collection_id);
        }
    }
}

fn require_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::invalid_field("name", "name must not be empty"));
    }
    Ok(())
}

fn require_positive(field: &str, value: i64) -> Result<()> {
    if value <= 0 {
        return Err(Error::invalid_field(
            field,
            format!("{field} must be a positive integer, got {value}"),
        ));
    }
    Ok(())
}

/// `dataset_query` for an ad-hoc native query.
pub fn native_dataset_query(
    database_id: i64,
    query: &str,
    parameters: Option<Vec<Value>>,
) -> Result<Value> {
    require_positive("database_id", database_id)?;
    if query.trim().is_empty() {
        return Err(Error::invalid_field("query", "query must not be empty"));
    }
    let mut native = json!({ "query": query });
    if let Some(parameters) = parameters.filter(|p| !p.is_empty()) {
        native["parameters"] = Value::Array(parameters);
    }
    Ok(json!({
        "database": database_id,
        "type": "native",
        "native": native
    }))
}

/// Body for `POST /card` backed by native SQL.
pub fn native_card(
    name: &str,
    database_id: i64,
    query: &str,
    options: CardOptions,
) -> Result<Value> {
    require_name(name)?;
    let mut payload = json!({
        "name": name,
        "database_id": database_id,
        "dataset_query": native_dataset_query(database_id, query, None)?,
    });
    options.apply(&mut payload, DEFAULT_DISPLAY);
    Ok(payload)
}

/// Body for `POST /card` backed by a validated structured query.
pub fn structured_card(
    name: &str,
    database_id: i64,
    query: &QueryIr,
    options: CardOptions,
) -> Result<Value> {
    require_name(name)?;
    require_positive("database_id", database_id)?;
    let mut payload = json!({
        "name": name,
        "database_id": database_id,
        "table_id": query.source_table_id(),
        "dataset_query": query.to_dataset_query(database_id),
    });
    options.apply(&mut payload, DEFAULT_DISPLAY);
    Ok(payload)
}

/// A reusable aggregation over one table, stored as a card of type `metric`.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricDefinition {
    pub name: String,
    pub database_id: i64,
    pub source_table_id: i64,
    pub aggregation: Aggregation,
    #[serde(default)]
    pub filters: Vec<FilterClause>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub collection_id: Option<i64>,
}

impl MetricDefinition {
    pub fn to_payload(&self) -> Result<Value> {
        require_name(&self.name)?;
        require_positive("database_id", self.database_id)?;
        let query = build_query(QueryRequest {
            aggregations: vec![self.aggregation.clone()],
            filters: self.filters.clone(),
            ..QueryRequest::new(self.source_table_id)
        })?;
        let mut payload = json!({
            "name": self.name,
            "type": METRIC_CARD_TYPE,
            "database_id": self.database_id,
            "table_id": self.source_table_id,
            "dataset_query": query.to_dataset_query(self.database_id),
        });
        CardOptions {
            description: self.description.clone(),
            collection_id: self.collection_id,
            ..CardOptions::default()
        }
        .apply(&mut payload, "scalar");
        Ok(payload)
    }
}

pub fn is_metric(card: &Value) -> bool {
    card.get("type").and_then(Value::as_str) == Some(METRIC_CARD_TYPE)
}

/// Where a metric lives, read from its card definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricSource {
    pub metric_id: i64,
    pub database_id: i64,
    pub table_id: i64,
}

impl MetricSource {
    pub fn from_card(card: &Value) -> Result<Self> {
        let metric_id = card.get("id").and_then(Value::as_i64).unwrap_or_default();
        if !is_metric(card) {
            return Err(Error::invalid_field(
                "metric_id",
                format!("card {metric_id} is not a metric"),
            ));
        }
        let database_id = card
            .get("database_id")
            .and_then(Value::as_i64)
            .or_else(|| card.pointer("/dataset_query/database").and_then(Value::as_i64));
        let table_id = card
            .get("table_id")
            .and_then(Value::as_i64)
            .or_else(|| {
                card.pointer("/dataset_query/query/source-table")
                    .and_then(Value::as_i64)
            });
        match (database_id, table_id) {
            (Some(database_id), Some(table_id)) => Ok(Self {
                metric_id,
                database_id,
                table_id,
            }),
            _ => Err(Error::validation(format!(
                "metric {metric_id} has no database or source table"
            ))),
        }
    }

    /// A query aggregating this metric, optionally broken out and filtered.
    pub fn compose_query(
        &self,
        breakouts: Vec<FieldRef>,
        filters: Vec<FilterClause>,
        order_by: Vec<OrderBy>,
        limit: Option<i64>,
    ) -> Result<QueryIr> {
        build_query(QueryRequest {
            source_table_id: self.table_id,
            aggregations: vec![Aggregation::Metric {
                metric_id: self.metric_id,
            }],
            breakouts,
            filters,
            order_by,
            limit,
        })
    }
}

/// Prefix the field of a validation error with the argument it came from.
fn scoped(err: Error, prefix: &str) -> Error {
    match err {
        Error::Validation { message, field } => Error::Validation {
            message,
            field: Some(match field {
                Some(field) => format!("{prefix}.{field}"),
                None => prefix.to_string(),
            }),
        },
        other => other,
    }
}

/// Replacement query for an existing card, in the same shapes the create
/// tools accept: SQL text, or a structured query built by `build_query`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum CardQuery {
    Native {
        database_id: i64,
        query: String,
        #[serde(default)]
        parameters: Option<Vec<Value>>,
    },
    Structured {
        database_id: i64,
        query: QueryRequest,
    },
}

impl CardQuery {
    pub fn to_dataset_query(&self) -> Result<Value> {
        match self {
            CardQuery::Native {
                database_id,
                query,
                parameters,
            } => native_dataset_query(*database_id, query, parameters.clone()),
            CardQuery::Structured { database_id, query } => {
                require_positive("database_id", *database_id)?;
                let query = build_query(query.clone()).map_err(|e| scoped(e, "query"))?;
                Ok(query.to_dataset_query(*database_id))
            }
        }
    }

    /// A metric query is structured and has exactly one aggregation.
    fn require_metric_shape(&self) -> Result<()> {
        match self {
            CardQuery::Native { .. } => Err(Error::invalid_field(
                "type",
                "a metric must be defined by a structured query",
            )),
            CardQuery::Structured { query, .. } if query.aggregations.len() != 1 => {
                Err(Error::invalid_field(
                    "query.aggregations",
                    format!(
                        "a metric needs exactly one aggregation, got {}",
                        query.aggregations.len()
                    ),
                ))
            }
            CardQuery::Structured { .. } => Ok(()),
        }
    }
}

/// Caller-supplied card update. Unknown keys are rejected; the query is
/// typed so it goes through the same validation as a new card.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CardPatchArgs {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    collection_id: Option<i64>,
    #[serde(default)]
    display: Option<String>,
    #[serde(default)]
    visualization_settings: Option<Map<String, Value>>,
    #[serde(default)]
    query: Option<CardQuery>,
    #[serde(default)]
    archived: Option<bool>,
}

/// Validated body for `PUT /card/:id`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CardPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visualization_settings: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset_query: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
}

impl CardPatch {
    pub fn parse(value: Value) -> Result<Self> {
        Self::from_args(Self::parse_args(value)?)
    }

    /// Like `parse`, but a replacement query must keep the metric shape.
    pub fn parse_metric(value: Value) -> Result<Self> {
        let args = Self::parse_args(value)?;
        if let Some(query) = &args.query {
            query.require_metric_shape().map_err(|e| scoped(e, "query"))?;
        }
        Self::from_args(args)
    }

    fn parse_args(value: Value) -> Result<CardPatchArgs> {
        serde_json::from_value(value)
            .map_err(|e| Error::validation(format!("invalid card update: {e}")))
    }

    fn from_args(args: CardPatchArgs) -> Result<Self> {
        if let Some(name) = &args.name {
            require_name(name)?;
        }
        let dataset_query = match &args.query {
            Some(query) => Some(query.to_dataset_query().map_err(|e| scoped(e, "query"))?),
            None => None,
        };
        let patch = CardPatch {
            name: args.name,
            description: args.description,
            collection_id: args.collection_id,
            display: args.display,
            visualization_settings: args.visualization_settings,
            dataset_query,
            archived: args.archived,
        };
        if patch.to_value().as_object().is_none_or(Map::is_empty) {
            return Err(Error::validation("update must change at least one field"));
        }
        Ok(patch)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
