//! Structured query (MBQL) intermediate representation and its builder.
//!
//! Tool arguments arrive as tagged JSON objects (`{"type": "sum", "field": {...}}`,
//! `{"op": "between", ...}`); they deserialize into the grammar types below,
//! are validated by [`build_query`], and serialize to the array-encoded MBQL the
//! remote engine understands. Unrecognised tags fail at deserialization.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Number, Value, json};

use crate::error::{Error, Result};

/// Time-bucketing transform applied to a date/time column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemporalUnit {
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl TemporalUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            TemporalUnit::Day => "day",
            TemporalUnit::Week => "week",
            TemporalUnit::Month => "month",
            TemporalUnit::Quarter => "quarter",
            TemporalUnit::Year => "year",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "day" => Some(TemporalUnit::Day),
            "week" => Some(TemporalUnit::Week),
            "month" => Some(TemporalUnit::Month),
            "quarter" => Some(TemporalUnit::Quarter),
            "year" => Some(TemporalUnit::Year),
            _ => None,
        }
    }
}

/// A column reference, optionally bucketed by a temporal unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRef {
    #[serde(rename = "field_id")]
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal_unit: Option<TemporalUnit>,
}

impl FieldRef {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            temporal_unit: None,
        }
    }

    pub fn with_unit(id: i64, unit: TemporalUnit) -> Self {
        Self {
            id,
            temporal_unit: Some(unit),
        }
    }

    /// `["field", id, null]` or `["field", id, {"temporal-unit": unit}]`.
    pub fn to_mbql(&self) -> Value {
        match self.temporal_unit {
            Some(unit) => json!(["field", self.id, { "temporal-unit": unit.as_str() }]),
            None => json!(["field", self.id, null]),
        }
    }

    /// Parse the MBQL form. Returns `None` for anything that is not an
    /// integer-id field clause with an optional known temporal unit.
    pub fn from_mbql(value: &Value) -> Option<Self> {
        let items = value.as_array()?;
        if items.first()?.as_str()? != "field" {
            return None;
        }
        let id = items.get(1)?.as_i64()?;
        let temporal_unit = match items.get(2) {
            None | Some(Value::Null) => None,
            Some(Value::Object(options)) => match options.get("temporal-unit") {
                None | Some(Value::Null) => None,
                Some(unit) => Some(TemporalUnit::parse(unit.as_str()?)?),
            },
            Some(_) => return None,
        };
        Some(Self { id, temporal_unit })
    }

    fn validate(&self, path: &str) -> Result<()> {
        if self.id <= 0 {
            return Err(Error::invalid_field(
                format!("{path}.field_id"),
                format!("field id must be a positive integer, got {}", self.id),
            ));
        }
        Ok(())
    }
}

/// One aggregation in the query's `aggregation` clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Aggregation {
    Count,
    Sum { field: FieldRef },
    Avg { field: FieldRef },
    Min { field: FieldRef },
    Max { field: FieldRef },
    Distinct { field: FieldRef },
    Metric { metric_id: i64 },
}

impl Aggregation {
    fn operator(&self) -> &'static str {
        match self {
            Aggregation::Count => "count",
            Aggregation::Sum { .. } => "sum",
            Aggregation::Avg { .. } => "avg",
            Aggregation::Min { .. } => "min",
            Aggregation::Max { .. } => "max",
            Aggregation::Distinct { .. } => "distinct",
            Aggregation::Metric { .. } => "metric",
        }
    }

    pub fn field(&self) -> Option<&FieldRef> {
        match self {
            Aggregation::Sum { field }
            | Aggregation::Avg { field }
            | Aggregation::Min { field }
            | Aggregation::Max { field }
            | Aggregation::Distinct { field } => Some(field),
            Aggregation::Count | Aggregation::Metric { .. } => None,
        }
    }

    pub fn to_mbql(&self) -> Value {
        match self {
            Aggregation::Count => json!(["count"]),
            Aggregation::Metric { metric_id } => json!(["metric", metric_id]),
            Aggregation::Sum { field }
            | Aggregation::Avg { field }
            | Aggregation::Min { field }
            | Aggregation::Max { field }
            | Aggregation::Distinct { field } => json!([self.operator(), field.to_mbql()]),
        }
    }

    fn validate(&self, path: &str) -> Result<()> {
        match self {
            Aggregation::Count => Ok(()),
            Aggregation::Metric { metric_id } if *metric_id <= 0 => Err(Error::invalid_field(
                format!("{path}.metric_id"),
                format!("metric id must be a positive integer, got {metric_id}"),
            )),
            Aggregation::Metric { .. } => Ok(()),
            Aggregation::Sum { field }
            | Aggregation::Avg { field }
            | Aggregation::Min { field }
            | Aggregation::Max { field }
            | Aggregation::Distinct { field } => field.validate(&format!("{path}.field")),
        }
    }
}

/// A scalar filter operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Bool(bool),
    Number(Number),
    Text(String),
}

impl Literal {
    fn to_value(&self) -> Value {
        match self {
            Literal::Bool(v) => Value::Bool(*v),
            Literal::Number(v) => Value::Number(v.clone()),
            Literal::Text(v) => Value::String(v.clone()),
        }
    }

    /// Ordering between two bounds of the same kind. Strings compare
    /// lexically, which orders ISO-8601 dates correctly.
    fn compare(&self, other: &Literal) -> Option<Ordering> {
        match (self, other) {
            (Literal::Number(a), Literal::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
            (Literal::Text(a), Literal::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// Recursive filter grammar: comparison leaves and boolean combinators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum FilterClause {
    #[serde(rename = "=")]
    Equals { field: FieldRef, value: Literal },
    #[serde(rename = "!=")]
    NotEquals { field: FieldRef, value: Literal },
    #[serde(rename = ">")]
    GreaterThan { field: FieldRef, value: Literal },
    #[serde(rename = "<")]
    LessThan { field: FieldRef, value: Literal },
    #[serde(rename = "between")]
    Between { field: FieldRef, bounds: Vec<Literal> },
    #[serde(rename = "contains")]
    Contains { field: FieldRef, value: Literal },
    #[serde(rename = "is-null")]
    IsNull { field: FieldRef },
    #[serde(rename = "not-null")]
    NotNull { field: FieldRef },
    #[serde(rename = "and")]
    And { clauses: Vec<FilterClause> },
    #[serde(rename = "or")]
    Or { clauses: Vec<FilterClause> },
    #[serde(rename = "not")]
    Not { clauses: Vec<FilterClause> },
}

impl FilterClause {
    fn operator(&self) -> &'static str {
        match self {
            FilterClause::Equals { .. } => "=",
            FilterClause::NotEquals { .. } => "!=",
            FilterClause::GreaterThan { .. } => ">",
            FilterClause::LessThan { .. } => "<",
            FilterClause::Between { .. } => "between",
            FilterClause::Contains { .. } => "contains",
            FilterClause::IsNull { .. } => "is-null",
            FilterClause::NotNull { .. } => "not-null",
            FilterClause::And { .. } => "and",
            FilterClause::Or { .. } => "or",
            FilterClause::Not { .. } => "not",
        }
    }

    pub fn to_mbql(&self) -> Value {
        let op = Value::String(self.operator().to_string());
        let items = match self {
            FilterClause::Equals { field, value }
            | FilterClause::NotEquals { field, value }
            | FilterClause::GreaterThan { field, value }
            | FilterClause::LessThan { field, value }
            | FilterClause::Contains { field, value } => {
                vec![op, field.to_mbql(), value.to_value()]
            }
            FilterClause::Between { field, bounds } => {
                let mut items = vec![op, field.to_mbql()];
                items.extend(bounds.iter().map(Literal::to_value));
                items
            }
            FilterClause::IsNull { field } | FilterClause::NotNull { field } => {
                vec![op, field.to_mbql()]
            }
            FilterClause::And { clauses }
            | FilterClause::Or { clauses }
            | FilterClause::Not { clauses } => {
                let mut items = vec![op];
                items.extend(clauses.iter().map(FilterClause::to_mbql));
                items
            }
        };
        Value::Array(items)
    }

    fn collect_field_ids(&self, out: &mut BTreeSet<i64>) {
        match self {
            FilterClause::Equals { field, .. }
            | FilterClause::NotEquals { field, .. }
            | FilterClause::GreaterThan { field, .. }
            | FilterClause::LessThan { field, .. }
            | FilterClause::Between { field, .. }
            | FilterClause::Contains { field, .. }
            | FilterClause::IsNull { field }
            | FilterClause::NotNull { field } => {
                out.insert(field.id);
            }
            FilterClause::And { clauses }
            | FilterClause::Or { clauses }
            | FilterClause::Not { clauses } => {
                for clause in clauses {
                    clause.collect_field_ids(out);
                }
            }
        }
    }

    fn validate(&self, path: &str) -> Result<()> {
        match self {
            FilterClause::Equals { field, value }
            | FilterClause::NotEquals { field, value }
            | FilterClause::GreaterThan { field, value }
            | FilterClause::LessThan { field, value } => {
                field.validate(&format!("{path}.field"))?;
                if matches!(self, FilterClause::GreaterThan { .. } | FilterClause::LessThan { .. })
                    && matches!(value, Literal::Bool(_))
                {
                    return Err(Error::invalid_field(
                        format!("{path}.value"),
                        format!("'{}' needs a number or string operand", self.operator()),
                    ));
                }
                Ok(())
            }
            FilterClause::Contains { field, value } => {
                field.validate(&format!("{path}.field"))?;
                if !matches!(value, Literal::Text(_)) {
                    return Err(Error::invalid_field(
                        format!("{path}.value"),
                        "'contains' needs a string operand",
                    ));
                }
                Ok(())
            }
            FilterClause::IsNull { field } | FilterClause::NotNull { field } => {
                field.validate(&format!("{path}.field"))
            }
            FilterClause::Between { field, bounds } => {
                field.validate(&format!("{path}.field"))?;
                let [lower, upper] = bounds.as_slice() else {
                    return Err(Error::invalid_field(
                        format!("{path}.bounds"),
                        format!("'between' needs exactly two bounds, got {}", bounds.len()),
                    ));
                };
                match lower.compare(upper) {
                    Some(Ordering::Greater) => Err(Error::invalid_field(
                        format!("{path}.bounds"),
                        "'between' lower bound must not exceed upper bound",
                    )),
                    Some(_) => Ok(()),
                    None => Err(Error::invalid_field(
                        format!("{path}.bounds"),
                        "'between' bounds must both be numbers or both be strings",
                    )),
                }
            }
            FilterClause::And { clauses } | FilterClause::Or { clauses } => {
                if clauses.is_empty() {
                    return Err(Error::invalid_field(
                        format!("{path}.clauses"),
                        format!("'{}' needs at least one clause", self.operator()),
                    ));
                }
                for (index, clause) in clauses.iter().enumerate() {
                    clause.validate(&format!("{path}.clauses[{index}]"))?;
                }
                Ok(())
            }
            FilterClause::Not { clauses } => {
                let [inner] = clauses.as_slice() else {
                    return Err(Error::invalid_field(
                        format!("{path}.clauses"),
                        format!("'not' needs exactly one clause, got {}", clauses.len()),
                    ));
                };
                inner.validate(&format!("{path}.clauses[0]"))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

/// What an order-by entry sorts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderTarget {
    /// Must equal one of the query's breakouts.
    Breakout(FieldRef),
    /// Position in the query's aggregation list.
    Aggregation(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "OrderByArgs")]
pub struct OrderBy {
    pub direction: Direction,
    pub target: OrderTarget,
}

#[derive(Deserialize)]
struct OrderByArgs {
    #[serde(default = "default_direction")]
    direction: Direction,
    field: Option<FieldRef>,
    aggregation_index: Option<i64>,
}

fn default_direction() -> Direction {
    Direction::Asc
}

impl TryFrom<OrderByArgs> for OrderBy {
    type Error = String;

    fn try_from(args: OrderByArgs) -> std::result::Result<Self, Self::Error> {
        let target = match (args.field, args.aggregation_index) {
            (Some(field), None) => OrderTarget::Breakout(field),
            (None, Some(index)) => OrderTarget::Aggregation(
                usize::try_from(index)
                    .map_err(|_| format!("aggregation_index must not be negative, got {index}"))?,
            ),
            _ => {
                return Err(
                    "order_by entries need exactly one of 'field' or 'aggregation_index'"
                        .to_string(),
                );
            }
        };
        Ok(OrderBy {
            direction: args.direction,
            target,
        })
    }
}

impl OrderBy {
    pub fn to_mbql(&self) -> Value {
        let direction = match self.direction {
            Direction::Asc => "asc",
            Direction::Desc => "desc",
        };
        match &self.target {
            OrderTarget::Breakout(field) => json!([direction, field.to_mbql()]),
            OrderTarget::Aggregation(index) => json!([direction, ["aggregation", index]]),
        }
    }
}

/// Unvalidated query arguments as supplied by the caller.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub source_table_id: i64,
    #[serde(default)]
    pub aggregations: Vec<Aggregation>,
    #[serde(default)]
    pub breakouts: Vec<FieldRef>,
    /// Several top-level filters are combined under a single `and`.
    #[serde(default)]
    pub filters: Vec<FilterClause>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default)]
    pub limit: Option<i64>,
}

impl QueryRequest {
    pub fn new(source_table_id: i64) -> Self {
        Self {
            source_table_id,
            aggregations: Vec::new(),
            breakouts: Vec::new(),
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }
}

/// Field ids known to belong to a table, for the optional build-time check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub table_id: i64,
    pub field_ids: BTreeSet<i64>,
}

impl TableSchema {
    /// Read a `/table/:id/query_metadata` payload.
    pub fn from_metadata(table_id: i64, metadata: &Value) -> Self {
        let field_ids = metadata
            .get("fields")
            .and_then(Value::as_array)
            .map(|fields| {
                fields
                    .iter()
                    .filter_map(|field| field.get("id").and_then(Value::as_i64))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            table_id,
            field_ids,
        }
    }
}

/// A validated query, ready to be forwarded to the remote engine.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryIr {
    source_table_id: i64,
    aggregations: Vec<Aggregation>,
    breakouts: Vec<FieldRef>,
    filter: Option<FilterClause>,
    order_by: Vec<OrderBy>,
    limit: Option<u64>,
}

impl QueryIr {
    pub fn source_table_id(&self) -> i64 {
        self.source_table_id
    }

    pub fn aggregations(&self) -> &[Aggregation] {
        &self.aggregations
    }

    pub fn breakouts(&self) -> &[FieldRef] {
        &self.breakouts
    }

    pub fn filter(&self) -> Option<&FilterClause> {
        self.filter.as_ref()
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Every field id referenced anywhere in the query.
    pub fn field_ids(&self) -> BTreeSet<i64> {
        let mut ids = BTreeSet::new();
        ids.extend(self.aggregations.iter().filter_map(|a| a.field().map(|f| f.id)));
        ids.extend(self.breakouts.iter().map(|f| f.id));
        if let Some(filter) = &self.filter {
            filter.collect_field_ids(&mut ids);
        }
        ids
    }

    /// Reject field ids that do not belong to the source table.
    pub fn check_schema(&self, schema: &TableSchema) -> Result<()> {
        if schema.table_id != self.source_table_id {
            return Err(Error::invalid_field(
                "source_table_id",
                format!(
                    "schema is for table {} but the query reads table {}",
                    schema.table_id, self.source_table_id
                ),
            ));
        }
        let unknown: Vec<i64> = self
            .field_ids()
            .into_iter()
            .filter(|id| !schema.field_ids.contains(id))
            .collect();
        if !unknown.is_empty() {
            return Err(Error::invalid_field(
                "fields",
                format!(
                    "field ids {unknown:?} do not belong to table {}",
                    self.source_table_id
                ),
            ));
        }
        Ok(())
    }

    /// The inner MBQL `query` object. Empty clauses are omitted.
    pub fn to_mbql(&self) -> Value {
        let mut query = json!({ "source-table": self.source_table_id });
        if !self.aggregations.is_empty() {
            query["aggregation"] =
                Value::Array(self.aggregations.iter().map(Aggregation::to_mbql).collect());
        }
        if !self.breakouts.is_empty() {
            query["breakout"] =
                Value::Array(self.breakouts.iter().map(FieldRef::to_mbql).collect());
        }
        if let Some(filter) = &self.filter {
            query["filter"] = filter.to_mbql();
        }
        if !self.order_by.is_empty() {
            query["order-by"] = Value::Array(self.order_by.iter().map(OrderBy::to_mbql).collect());
        }
        if let Some(limit) = self.limit {
            query["limit"] = json!(limit);
        }
        query
    }

    /// Full `dataset_query` envelope for `/dataset` and card payloads.
    pub fn to_dataset_query(&self, database_id: i64) -> Value {
        json!({
            "database": database_id,
            "type": "query",
            "query": self.to_mbql()
        })
    }
}

impl Serialize for QueryIr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_mbql().serialize(serializer)
    }
}

/// Validate the request and assemble the query IR. Pure: identical input
/// always produces an identical IR, and nothing is sent anywhere.
pub fn build_query(request: QueryRequest) -> Result<QueryIr> {
    let QueryRequest {
        source_table_id,
        aggregations,
        breakouts,
        filters,
        order_by,
        limit,
    } = request;

    if source_table_id <= 0 {
        return Err(Error::invalid_field(
            "source_table_id",
            format!("source table id must be a positive integer, got {source_table_id}"),
        ));
    }
    for (index, aggregation) in aggregations.iter().enumerate() {
        aggregation.validate(&format!("aggregations[{index}]"))?;
    }
    for (index, breakout) in breakouts.iter().enumerate() {
        breakout.validate(&format!("breakouts[{index}]"))?;
    }
    for (index, filter) in filters.iter().enumerate() {
        filter.validate(&format!("filters[{index}]"))?;
    }
    for (index, entry) in order_by.iter().enumerate() {
        match &entry.target {
            OrderTarget::Breakout(field) => {
                field.validate(&format!("order_by[{index}].field"))?;
                if !breakouts.contains(field) {
                    return Err(Error::invalid_field(
                        format!("order_by[{index}].field"),
                        format!("field {} is not one of the query's breakouts", field.id),
                    ));
                }
            }
            OrderTarget::Aggregation(position) if *position >= aggregations.len() => {
                return Err(Error::invalid_field(
                    format!("order_by[{index}].aggregation_index"),
                    format!(
                        "aggregation index {position} is out of range for {} aggregation(s)",
                        aggregations.len()
                    ),
                ));
            }
            OrderTarget::Aggregation(_) => {}
        }
    }
    let limit = match limit {
        None => None,
        Some(value) if value > 0 => Some(value as u64),
        Some(value) => {
            return Err(Error::invalid_field(
                "limit",
                format!("limit must be a positive integer, got {value}"),
            ));
        }
    };

    let mut filters = filters;
    let filter = match filters.len() {
        0 => None,
        1 => filters.pop(),
        _ => Some(FilterClause::And { clauses: filters }),
    };

    Ok(QueryIr {
        source_table_id,
        aggregations,
        breakouts,
        filter,
        order_by,
        limit,
    })
}

/// Deserialize caller-supplied query arguments, reporting shape errors as
/// validation failures.
pub fn parse_query_request(value: Value) -> Result<QueryRequest> {
    serde_json::from_value(value).map_err(|e| Error::validation(format!("invalid query: {e}")))
}
