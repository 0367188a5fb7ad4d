//! Tool catalogue and handlers.

use metabase_core::Error;
use metabase_core::card::{self, CardOptions, CardPatch, MetricDefinition};
use metabase_core::dashboard::{CardUpdate, ParameterArgs};
use metabase_core::query::{
    FieldRef, FilterClause, OrderBy, QueryIr, TableSchema, build_query, parse_query_request,
};
use serde_json::{Map, Value, json};

use crate::args::{
    arg_bool, arg_optional_array, arg_optional_id, arg_optional_string, arg_optional_u64,
    parse_arg, parse_args, required_collection_id, required_id, required_object, required_string,
};
use crate::composer::{AddCardRequest, CopyTabRequest, DashboardComposer};
use crate::metrics::MetricRegistry;
use crate::{McpServer, ToolError};

const DEFAULT_FIELD_PAGE: u64 = 20;

pub(crate) struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

fn tool(name: &'static str, description: &'static str, input_schema: Value) -> ToolDefinition {
    ToolDefinition {
        name,
        description,
        input_schema,
    }
}

fn id_schema(description: &str) -> Value {
    json!({ "type": "integer", "minimum": 1, "description": description })
}

fn no_args() -> Value {
    json!({ "type": "object", "properties": {} })
}

fn query_ir_schema() -> Value {
    json!({
        "type": "object",
        "description": "Structured query. Fields are referenced as {\"field_id\": n, \"temporal_unit\"?: \"day\"|\"week\"|\"month\"|\"quarter\"|\"year\"|...}.",
        "required": ["source_table_id"],
        "properties": {
            "source_table_id": { "type": "integer", "minimum": 1 },
            "aggregations": {
                "type": "array",
                "description": "Each {\"type\": \"count\"} or {\"type\": \"sum\"|\"avg\"|\"min\"|\"max\"|\"distinct\", \"field\": {...}} or {\"type\": \"metric\", \"metric_id\": n}.",
                "items": { "type": "object" }
            },
            "breakouts": { "type": "array", "items": { "type": "object" } },
            "filters": {
                "type": "array",
                "description": "Each {\"op\": \"=\"|\"!=\"|\">\"|\"<\"|\"contains\", \"field\", \"value\"}, {\"op\": \"between\", \"field\", \"bounds\": [lo, hi]}, {\"op\": \"is-null\"|\"not-null\", \"field\"} or {\"op\": \"and\"|\"or\"|\"not\", \"clauses\": [...]}. Several filters are combined with and.",
                "items": { "type": "object" }
            },
            "order_by": {
                "type": "array",
                "description": "Each {\"direction\": \"asc\"|\"desc\"} plus either \"field\" (a breakout) or \"aggregation_index\".",
                "items": { "type": "object" }
            },
            "limit": { "type": "integer", "minimum": 1 }
        }
    })
}

/// Replacement query accepted by `update_card` and `update_metric`.
fn card_query_schema() -> Value {
    json!({
        "type": "object",
        "description": "New query. {\"type\": \"native\", \"database_id\", \"query\": SQL, \"parameters\"?} or {\"type\": \"structured\", \"database_id\", \"query\": <structured query>}. Validated like create_card / create_structured_card.",
        "required": ["type", "database_id", "query"],
        "properties": {
            "type": { "type": "string", "enum": ["native", "structured"] },
            "database_id": { "type": "integer", "minimum": 1 },
            "query": {},
            "parameters": { "type": "array", "items": { "type": "object" } }
        }
    })
}

fn card_patch_schema(description: &str) -> Value {
    let mut properties = Map::new();
    properties.insert("name".to_string(), json!({ "type": "string" }));
    card_option_properties(&mut properties);
    properties.insert("query".to_string(), card_query_schema());
    properties.insert("archived".to_string(), json!({ "type": "boolean" }));
    json!({
        "type": "object",
        "description": description,
        "additionalProperties": false,
        "properties": properties
    })
}

fn card_option_properties(properties: &mut Map<String, Value>) {
    properties.insert("description".to_string(), json!({ "type": "string" }));
    properties.insert("collection_id".to_string(), id_schema("Collection to save into."));
    properties.insert(
        "display".to_string(),
        json!({
            "type": "string",
            "description": "Visualization type, e.g. table, bar, line, scalar."
        }),
    );
    properties.insert("visualization_settings".to_string(), json!({ "type": "object" }));
}

fn with_card_options(mut schema: Value) -> Value {
    if let Some(properties) = schema.get_mut("properties").and_then(Value::as_object_mut) {
        card_option_properties(properties);
    }
    schema
}

fn parameter_mapping_schema() -> Value {
    json!({
        "type": "array",
        "description": "Each {\"parameter_id\", \"target\"}; target is [\"dimension\", [\"field\", id, null]], [\"variable\"|\"dimension\", [\"template-tag\", name]] or {\"field_id\": n}.",
        "items": {
            "type": "object",
            "required": ["parameter_id", "target"],
            "properties": {
                "parameter_id": { "type": "string" },
                "card_id": { "type": "integer" },
                "target": {}
            }
        }
    })
}

pub(crate) fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        tool(
            "list_databases",
            "List the databases connected to Metabase.",
            no_args(),
        ),
        tool(
            "list_tables",
            "List the tables of a database, sorted by display name.",
            json!({
                "type": "object",
                "required": ["database_id"],
                "properties": { "database_id": id_schema("Database id from list_databases.") }
            }),
        ),
        tool(
            "get_table_fields",
            "Get a table's fields with ids and types. Paged; the response reports _truncated and _total_fields.",
            json!({
                "type": "object",
                "required": ["table_id"],
                "properties": {
                    "table_id": id_schema("Table id from list_tables."),
                    "limit": { "type": "integer", "minimum": 0, "default": DEFAULT_FIELD_PAGE, "description": "0 returns every field." },
                    "offset": { "type": "integer", "minimum": 0, "default": 0 }
                }
            }),
        ),
        tool(
            "get_field_values",
            "Get the distinct values Metabase has cached for a field.",
            json!({
                "type": "object",
                "required": ["field_id"],
                "properties": { "field_id": id_schema("Field id from get_table_fields.") }
            }),
        ),
        tool(
            "execute_query",
            "Run a native SQL query against a database.",
            json!({
                "type": "object",
                "required": ["database_id", "query"],
                "properties": {
                    "database_id": id_schema("Database to run against."),
                    "query": { "type": "string", "description": "SQL text." },
                    "native_parameters": { "type": "array", "items": { "type": "object" }, "description": "Template-tag parameter values." }
                }
            }),
        ),
        tool(
            "execute_structured_query",
            "Validate and run a structured (MBQL) query. Invalid input is rejected before anything is sent.",
            json!({
                "type": "object",
                "required": ["database_id", "query"],
                "properties": {
                    "database_id": id_schema("Database the table belongs to."),
                    "query": query_ir_schema(),
                    "check_schema": { "type": "boolean", "default": true, "description": "Reject field ids that are not on the source table." }
                }
            }),
        ),
        tool(
            "execute_card",
            "Run a saved question and return its result.",
            json!({
                "type": "object",
                "required": ["card_id"],
                "properties": {
                    "card_id": id_schema("Card id."),
                    "parameters": { "type": "array", "items": { "type": "object" } }
                }
            }),
        ),
        tool("list_cards", "List saved questions.", no_args()),
        tool(
            "get_card",
            "Get one saved question.",
            json!({
                "type": "object",
                "required": ["card_id"],
                "properties": { "card_id": id_schema("Card id.") }
            }),
        ),
        tool(
            "create_card",
            "Save a native SQL question.",
            with_card_options(json!({
                "type": "object",
                "required": ["name", "database_id", "query"],
                "properties": {
                    "name": { "type": "string" },
                    "database_id": id_schema("Database the SQL runs against."),
                    "query": { "type": "string" }
                }
            })),
        ),
        tool(
            "create_structured_card",
            "Validate a structured query and save it as a question.",
            with_card_options(json!({
                "type": "object",
                "required": ["name", "database_id", "query"],
                "properties": {
                    "name": { "type": "string" },
                    "database_id": id_schema("Database the table belongs to."),
                    "query": query_ir_schema(),
                    "check_schema": { "type": "boolean", "default": true }
                }
            })),
        ),
        tool(
            "create_metric_card",
            "Save a question that aggregates an existing metric, optionally broken out and filtered.",
            with_card_options(json!({
                "type": "object",
                "required": ["name", "metric_id"],
                "properties": {
                    "name": { "type": "string" },
                    "metric_id": id_schema("Metric id from list_metrics."),
                    "breakouts": { "type": "array", "items": { "type": "object" } },
                    "filters": { "type": "array", "items": { "type": "object" } },
                    "order_by": { "type": "array", "items": { "type": "object" } },
                    "limit": { "type": "integer", "minimum": 1 }
                }
            })),
        ),
        tool(
            "update_card",
            "Update fields of a saved question.",
            json!({
                "type": "object",
                "required": ["card_id", "updates"],
                "properties": {
                    "card_id": id_schema("Card id."),
                    "updates": card_patch_schema(
                        "Any of name, description, collection_id, display, visualization_settings, query, archived."
                    )
                }
            }),
        ),
        tool(
            "delete_card",
            "Delete a saved question.",
            json!({
                "type": "object",
                "required": ["card_id"],
                "properties": { "card_id": id_schema("Card id.") }
            }),
        ),
        tool("list_collections", "List collections.", no_args()),
        tool(
            "get_collection_items",
            "List the items of a collection.",
            json!({
                "type": "object",
                "required": ["collection_id"],
                "properties": {
                    "collection_id": { "description": "Collection id, or \"root\"." },
                    "models": { "type": "array", "items": { "type": "string" }, "description": "Restrict to card, dashboard, collection, ..." }
                }
            }),
        ),
        tool(
            "create_collection",
            "Create a collection.",
            json!({
                "type": "object",
                "required": ["name"],
                "properties": {
                    "name": { "type": "string" },
                    "description": { "type": "string" },
                    "color": { "type": "string", "description": "Hex color, e.g. #509EE3." },
                    "parent_id": id_schema("Parent collection id.")
                }
            }),
        ),
        tool(
            "update_collection",
            "Update a collection's name, description, color, parent or archived flag.",
            json!({
                "type": "object",
                "required": ["collection_id"],
                "properties": {
                    "collection_id": id_schema("Collection id."),
                    "name": { "type": "string" },
                    "description": { "type": "string" },
                    "color": { "type": "string" },
                    "parent_id": id_schema("New parent collection id."),
                    "archived": { "type": "boolean" }
                }
            }),
        ),
        tool(
            "delete_collection",
            "Archive a collection.",
            json!({
                "type": "object",
                "required": ["collection_id"],
                "properties": { "collection_id": id_schema("Collection id.") }
            }),
        ),
        tool("list_dashboards", "List dashboards.", no_args()),
        tool(
            "get_dashboard",
            "Get a dashboard with its tabs, cards and filters.",
            json!({
                "type": "object",
                "required": ["dashboard_id"],
                "properties": { "dashboard_id": id_schema("Dashboard id.") }
            }),
        ),
        tool(
            "create_dashboard",
            "Create an empty dashboard.",
            json!({
                "type": "object",
                "required": ["name"],
                "properties": {
                    "name": { "type": "string" },
                    "description": { "type": "string" },
                    "collection_id": id_schema("Collection to save into.")
                }
            }),
        ),
        tool(
            "update_dashboard",
            "Update a dashboard's name, description, collection or archived flag. Use the card and filter tools for layout.",
            json!({
                "type": "object",
                "required": ["dashboard_id"],
                "properties": {
                    "dashboard_id": id_schema("Dashboard id."),
                    "name": { "type": "string" },
                    "description": { "type": "string" },
                    "collection_id": id_schema("New collection id."),
                    "archived": { "type": "boolean" }
                }
            }),
        ),
        tool(
            "delete_dashboard",
            "Delete a dashboard.",
            json!({
                "type": "object",
                "required": ["dashboard_id"],
                "properties": { "dashboard_id": id_schema("Dashboard id.") }
            }),
        ),
        tool(
            "add_card_to_dashboard",
            "Place a saved question on a dashboard. Overlaps with existing cards are reported, not corrected.",
            json!({
                "type": "object",
                "required": ["dashboard_id", "card_id"],
                "properties": {
                    "dashboard_id": id_schema("Dashboard id."),
                    "card_id": id_schema("Card to place."),
                    "row": { "type": "integer", "minimum": 0, "default": 0 },
                    "col": { "type": "integer", "minimum": 0, "maximum": 23, "default": 0 },
                    "size_x": { "type": "integer", "minimum": 1, "maximum": 24, "default": 4 },
                    "size_y": { "type": "integer", "minimum": 1, "default": 4 },
                    "tab_id": id_schema("Tab to place the card on; defaults to the first tab."),
                    "parameter_mappings": parameter_mapping_schema()
                }
            }),
        ),
        tool(
            "remove_card_from_dashboard",
            "Remove one dashcard from a dashboard.",
            json!({
                "type": "object",
                "required": ["dashboard_id", "dashcard_id"],
                "properties": {
                    "dashboard_id": id_schema("Dashboard id."),
                    "dashcard_id": id_schema("Dashcard id (not the card id).")
                }
            }),
        ),
        tool(
            "add_dashboard_filter",
            "Add or replace dashboard filters. Parameters with an existing id replace it.",
            json!({
                "type": "object",
                "required": ["dashboard_id", "parameters"],
                "properties": {
                    "dashboard_id": id_schema("Dashboard id."),
                    "parameters": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["name", "type"],
                            "properties": {
                                "id": { "type": "string" },
                                "name": { "type": "string" },
                                "slug": { "type": "string" },
                                "type": { "type": "string", "description": "e.g. date/range, string/=, number/between, category." },
                                "sectionId": { "type": "string" },
                                "default": {}
                            }
                        }
                    }
                }
            }),
        ),
        tool(
            "update_dashboard_cards",
            "Move, resize or remap existing dashcards. Reads the dashboard once (one GET) to check the ids; if any id is not already on it, nothing is written.",
            json!({
                "type": "object",
                "required": ["dashboard_id", "cards"],
                "properties": {
                    "dashboard_id": id_schema("Dashboard id."),
                    "cards": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["id"],
                            "properties": {
                                "id": id_schema("Dashcard id."),
                                "row": { "type": "integer" },
                                "col": { "type": "integer" },
                                "size_x": { "type": "integer" },
                                "size_y": { "type": "integer" },
                                "parameter_mappings": parameter_mapping_schema()
                            }
                        }
                    }
                }
            }),
        ),
        tool(
            "copy_dashboard_tab",
            "Copy one tab's cards (and optionally its filters) to a new tab on another dashboard. Returns a step report; completed steps are not rolled back on failure.",
            json!({
                "type": "object",
                "required": ["source_dashboard_id", "target_dashboard_id", "tab_id"],
                "properties": {
                    "source_dashboard_id": id_schema("Dashboard to copy from."),
                    "target_dashboard_id": id_schema("Dashboard to copy into."),
                    "tab_id": id_schema("Tab on the source dashboard."),
                    "new_tab_name": { "type": "string", "description": "Defaults to the source tab's name." },
                    "include_filters": { "type": "boolean", "default": false }
                }
            }),
        ),
        tool("list_metrics", "List metrics.", no_args()),
        tool(
            "get_metric",
            "Get one metric.",
            json!({
                "type": "object",
                "required": ["metric_id"],
                "properties": { "metric_id": id_schema("Metric id.") }
            }),
        ),
        tool(
            "create_metric",
            "Define a reusable aggregation over one table.",
            json!({
                "type": "object",
                "required": ["name", "database_id", "source_table_id", "aggregation"],
                "properties": {
                    "name": { "type": "string" },
                    "database_id": id_schema("Database of the source table."),
                    "source_table_id": id_schema("Table the metric aggregates."),
                    "aggregation": { "type": "object", "description": "{\"type\": \"count\"} or {\"type\": \"sum\"|..., \"field\": {\"field_id\": n}}." },
                    "filters": { "type": "array", "items": { "type": "object" } },
                    "description": { "type": "string" },
                    "collection_id": id_schema("Collection to save into.")
                }
            }),
        ),
        tool(
            "update_metric",
            "Update a metric's definition or metadata.",
            json!({
                "type": "object",
                "required": ["metric_id", "updates"],
                "properties": {
                    "metric_id": id_schema("Metric id."),
                    "updates": card_patch_schema(
                        "Any of name, description, collection_id, display, visualization_settings, query, archived. A new query must be structured with exactly one aggregation."
                    )
                }
            }),
        ),
        tool(
            "delete_metric",
            "Archive a metric.",
            json!({
                "type": "object",
                "required": ["metric_id"],
                "properties": { "metric_id": id_schema("Metric id.") }
            }),
        ),
        tool(
            "search_metrics",
            "Find metrics defined on a table, optionally by name.",
            json!({
                "type": "object",
                "required": ["table_id"],
                "properties": {
                    "table_id": id_schema("Table id."),
                    "query": { "type": "string", "description": "Case-insensitive name substring." }
                }
            }),
        ),
    ]
}

/// Report a validation error against a nested argument, e.g.
/// `filters[0].bounds` becomes `query.filters[0].bounds`.
fn scoped_error(err: Error, prefix: &str) -> ToolError {
    let mut tool_error = ToolError::from(err);
    if tool_error.code == metabase_core::error::codes::VALIDATION_FAILED {
        tool_error.field = Some(match tool_error.field.take() {
            Some(field) => format!("{prefix}.{field}"),
            None => prefix.to_string(),
        });
    }
    tool_error
}

/// Sorted table listing with the fields agents actually use.
fn format_tables(database_id: i64, metadata: &Value) -> Value {
    let mut tables: Vec<Value> = metadata
        .get("tables")
        .and_then(Value::as_array)
        .map(|tables| {
            tables
                .iter()
                .map(|table| {
                    let description = table
                        .get("description")
                        .and_then(Value::as_str)
                        .filter(|d| !d.trim().is_empty())
                        .unwrap_or("No description");
                    json!({
                        "table_id": table.get("id"),
                        "name": table.get("name"),
                        "display_name": table.get("display_name"),
                        "schema": table.get("schema"),
                        "entity_type": table.get("entity_type"),
                        "description": description,
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    tables.sort_by_key(|table| {
        table
            .get("display_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase()
    });
    json!({
        "database_id": database_id,
        "database_name": metadata.get("name"),
        "total": tables.len(),
        "tables": tables,
    })
}

/// Keep one page of `fields` and record what was cut. `limit == 0` keeps
/// everything from `offset` on.
fn page_fields(mut metadata: Value, offset: usize, limit: usize) -> Value {
    let Some(fields) = metadata.get_mut("fields").and_then(Value::as_array_mut) else {
        return metadata;
    };
    let total = fields.len();
    let start = offset.min(total);
    let end = if limit == 0 {
        total
    } else {
        start.saturating_add(limit).min(total)
    };
    let page: Vec<Value> = fields.drain(start..end).collect();
    let returned = page.len();
    *fields = page;

    if let Some(obj) = metadata.as_object_mut() {
        obj.insert("_total_fields".to_string(), json!(total));
        obj.insert("_offset".to_string(), json!(start));
        obj.insert(
            "_limit_applied".to_string(),
            if limit == 0 { Value::Null } else { json!(limit) },
        );
        obj.insert("_truncated".to_string(), json!(returned < total));
    }
    metadata
}

fn non_empty_update(body: Map<String, Value>, field: &str) -> Result<Value, ToolError> {
    if body.is_empty() {
        return Err(
            ToolError::validation("update must change at least one field").with_field(field),
        );
    }
    Ok(Value::Object(body))
}

impl McpServer {
    pub(crate) async fn execute_tool(
        &self,
        name: &str,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        match name {
            "list_databases" => Ok(self.dispatcher.get("/database").await?),
            "list_tables" => self.tool_list_tables(args).await,
            "get_table_fields" => self.tool_get_table_fields(args).await,
            "get_field_values" => {
                let field_id = required_id(args, "field_id")?;
                Ok(self.dispatcher.get(&format!("/field/{field_id}/values")).await?)
            }
            "execute_query" => self.tool_execute_query(args).await,
            "execute_structured_query" => self.tool_execute_structured_query(args).await,
            "execute_card" => self.tool_execute_card(args).await,
            "list_cards" => Ok(self.dispatcher.get("/card").await?),
            "get_card" => {
                let card_id = required_id(args, "card_id")?;
                Ok(self.dispatcher.get(&format!("/card/{card_id}")).await?)
            }
            "create_card" => self.tool_create_card(args).await,
            "create_structured_card" => self.tool_create_structured_card(args).await,
            "create_metric_card" => self.tool_create_metric_card(args).await,
            "update_card" => {
                let card_id = required_id(args, "card_id")?;
                let patch = CardPatch::parse(required_object(args, "updates")?)
                    .map_err(|e| scoped_error(e, "updates"))?;
                Ok(self
                    .dispatcher
                    .put(&format!("/card/{card_id}"), &patch.to_value())
                    .await?)
            }
            "delete_card" => {
                let card_id = required_id(args, "card_id")?;
                self.dispatcher.delete(&format!("/card/{card_id}")).await?;
                Ok(json!({ "card_id": card_id, "deleted": true }))
            }
            "list_collections" => Ok(self.dispatcher.get("/collection").await?),
            "get_collection_items" => self.tool_get_collection_items(args).await,
            "create_collection" => self.tool_create_collection(args).await,
            "update_collection" => self.tool_update_collection(args).await,
            "delete_collection" => {
                let collection_id = required_id(args, "collection_id")?;
                Ok(self
                    .dispatcher
                    .put(
                        &format!("/collection/{collection_id}"),
                        &json!({ "archived": true }),
                    )
                    .await?)
            }
            "list_dashboards" => Ok(self.dispatcher.get("/dashboard").await?),
            "get_dashboard" => {
                let dashboard_id = required_id(args, "dashboard_id")?;
                Ok(self.dispatcher.get(&format!("/dashboard/{dashboard_id}")).await?)
            }
            "create_dashboard" => self.tool_create_dashboard(args).await,
            "update_dashboard" => self.tool_update_dashboard(args).await,
            "delete_dashboard" => {
                let dashboard_id = required_id(args, "dashboard_id")?;
                self.dispatcher
                    .delete(&format!("/dashboard/{dashboard_id}"))
                    .await?;
                Ok(json!({ "dashboard_id": dashboard_id, "deleted": true }))
            }
            "add_card_to_dashboard" => {
                let request: AddCardRequest = parse_args(args)?;
                Ok(DashboardComposer::new(&self.dispatcher).add_card(request).await?)
            }
            "remove_card_from_dashboard" => {
                let dashboard_id = required_id(args, "dashboard_id")?;
                let dashcard_id = required_id(args, "dashcard_id")?;
                Ok(DashboardComposer::new(&self.dispatcher)
                    .remove_card(dashboard_id, dashcard_id)
                    .await?)
            }
            "add_dashboard_filter" => {
                let dashboard_id = required_id(args, "dashboard_id")?;
                let parameters: Vec<ParameterArgs> = parse_arg(args, "parameters")?
                    .ok_or_else(|| {
                        ToolError::validation("Missing required field 'parameters'")
                            .with_field("parameters")
                    })?;
                Ok(DashboardComposer::new(&self.dispatcher)
                    .add_filters(dashboard_id, parameters)
                    .await?)
            }
            "update_dashboard_cards" => {
                let dashboard_id = required_id(args, "dashboard_id")?;
                let cards: Vec<CardUpdate> = parse_arg(args, "cards")?.ok_or_else(|| {
                    ToolError::validation("Missing required field 'cards'").with_field("cards")
                })?;
                Ok(DashboardComposer::new(&self.dispatcher)
                    .update_cards(dashboard_id, cards)
                    .await?)
            }
            "copy_dashboard_tab" => {
                let request: CopyTabRequest = parse_args(args)?;
                let report = DashboardComposer::new(&self.dispatcher)
                    .copy_tab(request)
                    .await?;
                serde_json::to_value(&report).map_err(|e| {
                    ToolError::new("internal_error", format!("failed to encode copy report: {e}"))
                })
            }
            "list_metrics" => {
                let metrics = MetricRegistry::new(&self.dispatcher).list().await?;
                Ok(json!({ "total": metrics.len(), "metrics": metrics }))
            }
            "get_metric" => {
                let metric_id = required_id(args, "metric_id")?;
                Ok(MetricRegistry::new(&self.dispatcher).get(metric_id).await?)
            }
            "create_metric" => {
                let definition: MetricDefinition = parse_args(args)?;
                Ok(MetricRegistry::new(&self.dispatcher).create(&definition).await?)
            }
            "update_metric" => {
                let metric_id = required_id(args, "metric_id")?;
                let patch = CardPatch::parse_metric(required_object(args, "updates")?)
                    .map_err(|e| scoped_error(e, "updates"))?;
                Ok(MetricRegistry::new(&self.dispatcher)
                    .update(metric_id, &patch)
                    .await?)
            }
            "delete_metric" => {
                let metric_id = required_id(args, "metric_id")?;
                Ok(MetricRegistry::new(&self.dispatcher).delete(metric_id).await?)
            }
            "search_metrics" => {
                let table_id = required_id(args, "table_id")?;
                let query = arg_optional_string(args, "query")?;
                let metrics = MetricRegistry::new(&self.dispatcher)
                    .search(table_id, query.as_deref())
                    .await?;
                Ok(json!({ "table_id": table_id, "total": metrics.len(), "metrics": metrics }))
            }
            _ => Err(ToolError::new("unknown_tool", format!("Unknown tool '{name}'"))
                .with_docs_hint("Call tools/list to see the available tools.")),
        }
    }

    async fn tool_list_tables(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let database_id = required_id(args, "database_id")?;
        let metadata = self
            .dispatcher
            .get(&format!("/database/{database_id}/metadata"))
            .await?;
        Ok(format_tables(database_id, &metadata))
    }

    async fn tool_get_table_fields(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let table_id = required_id(args, "table_id")?;
        let limit = arg_optional_u64(args, "limit")?.unwrap_or(DEFAULT_FIELD_PAGE);
        let offset = arg_optional_u64(args, "offset")?.unwrap_or(0);
        let metadata = self
            .dispatcher
            .get(&format!("/table/{table_id}/query_metadata"))
            .await?;
        Ok(page_fields(metadata, offset as usize, limit as usize))
    }

    async fn tool_execute_query(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let database_id = required_id(args, "database_id")?;
        let query = required_string(args, "query")?;
        let parameters = arg_optional_array(args, "native_parameters")?;
        let body = card::native_dataset_query(database_id, &query, parameters)?;
        Ok(self.dispatcher.run_query("/dataset", &body).await?)
    }

    /// Parse and validate the `query` argument, then optionally check its
    /// field ids against the source table.
    async fn structured_query(&self, args: &Map<String, Value>) -> Result<QueryIr, ToolError> {
        let request = parse_query_request(required_object(args, "query")?)
            .map_err(|e| scoped_error(e, "query"))?;
        let query = build_query(request).map_err(|e| scoped_error(e, "query"))?;
        if arg_bool(args, "check_schema", true)? {
            let table_id = query.source_table_id();
            let metadata = self
                .dispatcher
                .get(&format!("/table/{table_id}/query_metadata"))
                .await?;
            query
                .check_schema(&TableSchema::from_metadata(table_id, &metadata))
                .map_err(|e| scoped_error(e, "query"))?;
        }
        Ok(query)
    }

    async fn tool_execute_structured_query(
        &self,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let database_id = required_id(args, "database_id")?;
        let query = self.structured_query(args).await?;
        let mut result = self
            .dispatcher
            .run_query("/dataset", &query.to_dataset_query(database_id))
            .await?;
        if let Some(obj) = result.as_object_mut() {
            obj.insert("executed_query".to_string(), query.to_mbql());
        }
        Ok(result)
    }

    async fn tool_execute_card(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let card_id = required_id(args, "card_id")?;
        let parameters = arg_optional_array(args, "parameters")?.unwrap_or_default();
        Ok(self
            .dispatcher
            .run_query(
                &format!("/card/{card_id}/query"),
                &json!({ "parameters": parameters }),
            )
            .await?)
    }

    async fn tool_create_card(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let name = required_string(args, "name")?;
        let database_id = required_id(args, "database_id")?;
        let query = required_string(args, "query")?;
        let options: CardOptions = parse_args(args)?;
        let payload = card::native_card(&name, database_id, &query, options)?;
        Ok(self.dispatcher.post("/card", &payload).await?)
    }

    async fn tool_create_structured_card(
        &self,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let name = required_string(args, "name")?;
        let database_id = required_id(args, "database_id")?;
        let options: CardOptions = parse_args(args)?;
        let query = self.structured_query(args).await?;
        let payload = card::structured_card(&name, database_id, &query, options)?;
        Ok(self.dispatcher.post("/card", &payload).await?)
    }

    async fn tool_create_metric_card(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let name = required_string(args, "name")?;
        let metric_id = required_id(args, "metric_id")?;
        let breakouts: Vec<FieldRef> = parse_arg(args, "breakouts")?.unwrap_or_default();
        let filters: Vec<FilterClause> = parse_arg(args, "filters")?.unwrap_or_default();
        let order_by: Vec<OrderBy> = parse_arg(args, "order_by")?.unwrap_or_default();
        let limit: Option<i64> = parse_arg(args, "limit")?;
        let mut options: CardOptions = parse_args(args)?;
        if options.display.is_none() && breakouts.is_empty() {
            options.display = Some("scalar".to_string());
        }

        let source = MetricRegistry::new(&self.dispatcher).source(metric_id).await?;
        let query = source.compose_query(breakouts, filters, order_by, limit)?;
        let payload = card::structured_card(&name, source.database_id, &query, options)?;
        Ok(self.dispatcher.post("/card", &payload).await?)
    }

    async fn tool_get_collection_items(
        &self,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let collection_id = required_collection_id(args, "collection_id")?;
        let models: Vec<String> = parse_arg(args, "models")?.unwrap_or_default();
        let query: Vec<(&str, String)> =
            models.into_iter().map(|model| ("models", model)).collect();
        Ok(self
            .dispatcher
            .get_with_query(&format!("/collection/{collection_id}/items"), &query)
            .await?)
    }

    async fn tool_create_collection(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let name = required_string(args, "name")?;
        let mut body = json!({ "name": name });
        if let Some(description) = arg_optional_string(args, "description")? {
            body["description"] = json!(description);
        }
        if let Some(color) = arg_optional_string(args, "color")? {
            body["color"] = json!(color);
        }
        if let Some(parent_id) = arg_optional_id(args, "parent_id")? {
            body["parent_id"] = json!(parent_id);
        }
        Ok(self.dispatcher.post("/collection", &body).await?)
    }

    async fn tool_update_collection(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let collection_id = required_id(args, "collection_id")?;
        let mut body = Map::new();
        for key in ["name", "description", "color"] {
            if let Some(value) = arg_optional_string(args, key)? {
                body.insert(key.to_string(), json!(value));
            }
        }
        if let Some(parent_id) = arg_optional_id(args, "parent_id")? {
            body.insert("parent_id".to_string(), json!(parent_id));
        }
        if args.get("archived").is_some_and(|v| !v.is_null()) {
            body.insert("archived".to_string(), json!(arg_bool(args, "archived", false)?));
        }
        let body = non_empty_update(body, "collection_id")?;
        Ok(self
            .dispatcher
            .put(&format!("/collection/{collection_id}"), &body)
            .await?)
    }

    async fn tool_create_dashboard(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let name = required_string(args, "name")?;
        let mut body = json!({ "name": name });
        if let Some(description) = arg_optional_string(args, "description")? {
            body["description"] = json!(description);
        }
        if let Some(collection_id) = arg_optional_id(args, "collection_id")? {
            body["collection_id"] = json!(collection_id);
        }
        Ok(self.dispatcher.post("/dashboard", &body).await?)
    }

    async fn tool_update_dashboard(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let dashboard_id = required_id(args, "dashboard_id")?;
        let mut body = Map::new();
        for key in ["name", "description"] {
            if let Some(value) = arg_optional_string(args, key)? {
                body.insert(key.to_string(), json!(value));
            }
        }
        if let Some(collection_id) = arg_optional_id(args, "collection_id")? {
            body.insert("collection_id".to_string(), json!(collection_id));
        }
        if args.get("archived").is_some_and(|v| !v.is_null()) {
            body.insert("archived".to_string(), json!(arg_bool(args, "archived", false)?));
        }
        let body = non_empty_update(body, "dashboard_id")?;
        Ok(self
            .dispatcher
            .put(&format!("/dashboard/{dashboard_id}"), &body)
            .await?)
    }
}
