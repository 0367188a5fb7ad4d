//! Remote dashboard workflows: read the dashboard, apply a pure rule from
//! `metabase_core::dashboard`, write the result back.

use std::collections::{BTreeMap, HashSet};

use metabase_core::dashboard::{
    CardUpdate, DashCard, Dashboard, GridPosition, ParameterArgs, ParameterMapping, Tab,
    TabCopyPlan, apply_card_updates, created_ids, layout_with_new_tab, merge_parameters,
    remove_dashcard, validate_mappings,
};
use metabase_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::dispatch::Dispatcher;

fn default_size() -> i64 {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddCardRequest {
    pub dashboard_id: i64,
    pub card_id: i64,
    #[serde(default)]
    pub row: i64,
    #[serde(default)]
    pub col: i64,
    #[serde(default = "default_size")]
    pub size_x: i64,
    #[serde(default = "default_size")]
    pub size_y: i64,
    #[serde(default)]
    pub tab_id: Option<i64>,
    #[serde(default)]
    pub parameter_mappings: Vec<ParameterMapping>,
}

impl AddCardRequest {
    fn position(&self) -> GridPosition {
        GridPosition {
            row: self.row,
            col: self.col,
            size_x: self.size_x,
            size_y: self.size_y,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CopyTabRequest {
    pub source_dashboard_id: i64,
    pub target_dashboard_id: i64,
    pub tab_id: i64,
    #[serde(default)]
    pub new_tab_name: Option<String>,
    #[serde(default)]
    pub include_filters: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum CopyStep {
    ReadSource { dashboard_id: i64 },
    ReadTarget { dashboard_id: i64 },
    CreateTab { tab_id: i64, name: String },
    CopyParameters { count: usize },
    PlaceCard { source_dashcard_id: i64, dashcard_id: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyStatus {
    Complete,
    Partial,
}

/// Outcome of a tab copy. Completed steps stay applied when a later step
/// fails; nothing is rolled back.
#[derive(Debug, Clone, Serialize)]
pub struct TabCopyReport {
    pub status: CopyStatus,
    pub source_dashboard_id: i64,
    pub target_dashboard_id: i64,
    pub source_tab_id: i64,
    pub target_tab_id: Option<i64>,
    pub include_filters: bool,
    pub completed_steps: Vec<CopyStep>,
    /// source dashcard id → created dashcard id
    pub card_id_map: BTreeMap<i64, i64>,
    /// source parameter id → created parameter id
    pub parameter_id_map: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(skip_serializing_if = "is_zero")]
    pub skipped_mappings: usize,
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

impl TabCopyReport {
    fn new(request: &CopyTabRequest) -> Self {
        Self {
            status: CopyStatus::Partial,
            source_dashboard_id: request.source_dashboard_id,
            target_dashboard_id: request.target_dashboard_id,
            source_tab_id: request.tab_id,
            target_tab_id: None,
            include_filters: request.include_filters,
            completed_steps: Vec::new(),
            card_id_map: BTreeMap::new(),
            parameter_id_map: BTreeMap::new(),
            failed_step: None,
            error: None,
            skipped_mappings: 0,
        }
    }

    fn fail(mut self, step: &str, source_dashcard_id: Option<i64>, err: &Error) -> Self {
        tracing::warn!(
            step,
            target_dashboard_id = self.target_dashboard_id,
            error = %err,
            "tab copy stopped"
        );
        let mut failed = json!({ "step": step });
        if let Some(id) = source_dashcard_id {
            failed["source_dashcard_id"] = json!(id);
        }
        self.status = CopyStatus::Partial;
        self.failed_step = Some(failed);
        self.error = Some(err.to_value());
        self
    }

    pub fn is_complete(&self) -> bool {
        self.status == CopyStatus::Complete
    }
}

fn require_id(field: &str, value: i64) -> Result<()> {
    if value <= 0 {
        return Err(Error::invalid_field(
            field,
            format!("{field} must be a positive integer, got {value}"),
        ));
    }
    Ok(())
}

pub struct DashboardComposer<'a> {
    dispatcher: &'a Dispatcher,
}

impl<'a> DashboardComposer<'a> {
    pub fn new(dispatcher: &'a Dispatcher) -> Self {
        Self { dispatcher }
    }

    pub async fn dashboard(&self, dashboard_id: i64) -> Result<Dashboard> {
        require_id("dashboard_id", dashboard_id)?;
        let body = self.dispatcher.get(&format!("/dashboard/{dashboard_id}")).await?;
        Dashboard::from_value(&body)
    }

    /// PUT and return the resulting state, re-reading when the response does
    /// not carry the layout.
    async fn put_dashboard(&self, dashboard_id: i64, body: &Value) -> Result<Dashboard> {
        let response = self
            .dispatcher
            .put(&format!("/dashboard/{dashboard_id}"), body)
            .await?;
        let has_layout =
            response.get("dashcards").is_some() || response.get("ordered_cards").is_some();
        match Dashboard::from_value(&response) {
            Ok(dashboard) if has_layout => Ok(dashboard),
            _ => self.dashboard(dashboard_id).await,
        }
    }

    async fn write_layout(
        &self,
        dashboard: &Dashboard,
        cards: &[DashCard],
        tabs: &[Tab],
    ) -> Result<Dashboard> {
        self.put_dashboard(dashboard.id, &dashboard.layout_payload(cards, tabs))
            .await
    }

    pub async fn add_card(&self, request: AddCardRequest) -> Result<Value> {
        require_id("card_id", request.card_id)?;
        let position = request.position();
        position.validate("position")?;

        let dashboard = self.dashboard(request.dashboard_id).await?;
        let tab_id = match request.tab_id {
            Some(tab_id) if !dashboard.has_tab(tab_id) => {
                return Err(Error::invalid_field(
                    "tab_id",
                    format!("tab {tab_id} does not exist on dashboard {}", dashboard.id),
                ));
            }
            Some(tab_id) => Some(tab_id),
            None => dashboard.tabs.first().map(|tab| tab.id),
        };
        validate_mappings(
            &request.parameter_mappings,
            &dashboard.parameter_ids(),
            "parameter_mappings",
        )?;

        let mut card = DashCard::placed(request.card_id, position, tab_id);
        card.parameter_mappings = request.parameter_mappings;
        card.fill_mapping_card_ids();
        let overlaps = dashboard.overlapping(&position, tab_id);
        if !overlaps.is_empty() {
            tracing::info!(
                dashboard_id = dashboard.id,
                ?overlaps,
                "placing card over existing dashcards"
            );
        }

        let mut cards = dashboard.dashcards.clone();
        cards.push(card);
        let updated = self.write_layout(&dashboard, &cards, &dashboard.tabs).await?;
        let dashcard_id = created_ids(
            dashboard.dashcards.iter().map(|dc| dc.id),
            updated.dashcards.iter().map(|dc| dc.id),
        )
        .last()
        .copied();

        Ok(json!({
            "dashboard_id": dashboard.id,
            "card_id": request.card_id,
            "dashcard_id": dashcard_id,
            "tab_id": tab_id,
            "position": position,
            "overlaps": overlaps,
        }))
    }

    pub async fn remove_card(&self, dashboard_id: i64, dashcard_id: i64) -> Result<Value> {
        let dashboard = self.dashboard(dashboard_id).await?;
        let cards = remove_dashcard(&dashboard, dashcard_id)?;
        let updated = self.write_layout(&dashboard, &cards, &dashboard.tabs).await?;
        Ok(json!({
            "dashboard_id": dashboard_id,
            "removed_dashcard_id": dashcard_id,
            "remaining_dashcards": updated.dashcards.len(),
        }))
    }

    /// Update-only: every id must already be on the dashboard, or nothing is
    /// written.
    pub async fn update_cards(&self, dashboard_id: i64, updates: Vec<CardUpdate>) -> Result<Value> {
        if updates.is_empty() {
            return Err(Error::invalid_field("cards", "at least one update is required"));
        }
        let dashboard = self.dashboard(dashboard_id).await?;
        let cards = apply_card_updates(&dashboard, &updates)?;
        self.write_layout(&dashboard, &cards, &dashboard.tabs).await?;
        Ok(json!({
            "dashboard_id": dashboard_id,
            "updated_dashcard_ids": updates.iter().map(|u| u.id).collect::<Vec<_>>(),
        }))
    }

    pub async fn add_filters(
        &self,
        dashboard_id: i64,
        parameters: Vec<ParameterArgs>,
    ) -> Result<Value> {
        if parameters.is_empty() {
            return Err(Error::invalid_field("parameters", "at least one parameter is required"));
        }
        let dashboard = self.dashboard(dashboard_id).await?;
        let existing = dashboard.parameter_ids();
        let mut taken = existing.clone();
        let mut incoming = Vec::with_capacity(parameters.len());
        for args in parameters {
            let parameter = args.into_parameter(&taken)?;
            taken.insert(parameter.id.clone());
            incoming.push(parameter);
        }
        let (replaced, added): (Vec<&str>, Vec<&str>) = incoming
            .iter()
            .map(|p| p.id.as_str())
            .partition(|id| existing.contains(*id));
        let replaced: Vec<String> = replaced.into_iter().map(str::to_string).collect();
        let added: Vec<String> = added.into_iter().map(str::to_string).collect();

        let merged = merge_parameters(&dashboard.parameters, incoming);
        let updated = self
            .put_dashboard(dashboard_id, &json!({ "parameters": merged }))
            .await?;
        Ok(json!({
            "dashboard_id": dashboard_id,
            "added": added,
            "replaced": replaced,
            "parameters": updated.parameters,
        }))
    }

    /// Copy one tab's dashcards (and optionally the filters they use) onto
    /// another dashboard. Reads and validation failures return `Err`; a
    /// failed write returns a partial report.
    pub async fn copy_tab(&self, request: CopyTabRequest) -> Result<TabCopyReport> {
        let source = self.dashboard(request.source_dashboard_id).await?;
        let plan = TabCopyPlan::new(&source, request.tab_id, request.include_filters)?;
        let mut report = TabCopyReport::new(&request);
        report.skipped_mappings = plan.dangling_mappings;
        report.completed_steps.push(CopyStep::ReadSource {
            dashboard_id: source.id,
        });

        let target = self.dashboard(request.target_dashboard_id).await?;
        report.completed_steps.push(CopyStep::ReadTarget {
            dashboard_id: target.id,
        });

        let tab_name = request
            .new_tab_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| plan.source_tab.name.clone());
        let (tabs, cards) = layout_with_new_tab(&target, &tab_name);
        let mut current = match self.write_layout(&target, &cards, &tabs).await {
            Ok(dashboard) => dashboard,
            Err(err) => return Ok(report.fail("create_tab", None, &err)),
        };
        let Some(tab_id) = created_ids(
            target.tabs.iter().map(|tab| tab.id),
            current.tabs.iter().map(|tab| tab.id),
        )
        .last()
        .copied() else {
            let err = Error::validation("Metabase did not report the created tab");
            return Ok(report.fail("create_tab", None, &err));
        };
        report.target_tab_id = Some(tab_id);
        report.completed_steps.push(CopyStep::CreateTab {
            tab_id,
            name: tab_name,
        });

        let (copies, id_map) = plan.parameter_copies(&current);
        if !copies.is_empty() {
            let count = copies.len();
            let merged = merge_parameters(&current.parameters, copies);
            current = match self
                .put_dashboard(current.id, &json!({ "parameters": merged }))
                .await
            {
                Ok(dashboard) => dashboard,
                Err(err) => return Ok(report.fail("copy_parameters", None, &err)),
            };
            report.parameter_id_map = id_map.clone();
            report.completed_steps.push(CopyStep::CopyParameters { count });
        }

        for source_card in &plan.cards {
            let card = plan.target_card(source_card, tab_id, &id_map);
            let before: HashSet<i64> = current.dashcards.iter().map(|dc| dc.id).collect();
            let mut cards = current.dashcards.clone();
            cards.push(card);
            let updated = match self.write_layout(&current, &cards, &current.tabs).await {
                Ok(dashboard) => dashboard,
                Err(err) => return Ok(report.fail("place_card", Some(source_card.id), &err)),
            };
            let Some(dashcard_id) = created_ids(before, updated.dashcards.iter().map(|dc| dc.id))
                .last()
                .copied()
            else {
                let err = Error::validation("Metabase did not report the created dashcard");
                return Ok(report.fail("place_card", Some(source_card.id), &err));
            };
            report.card_id_map.insert(source_card.id, dashcard_id);
            report.completed_steps.push(CopyStep::PlaceCard {
                source_dashcard_id: source_card.id,
                dashcard_id,
            });
            current = updated;
        }

        report.status = CopyStatus::Complete;
        tracing::info!(
            source_dashboard_id = report.source_dashboard_id,
            target_dashboard_id = report.target_dashboard_id,
            cards = report.card_id_map.len(),
            parameters = report.parameter_id_map.len(),
            "tab copy complete"
        );
        Ok(report)
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
        let retry = RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        Dispatcher::new(http, base_url, auth, Duration::from_secs(5), retry)
    }

    fn dashcard(id: i64, card_id: i64, tab: i64, mappings: Value) -> Value {
        let col = if id % 2 == 0 { 0 } else { 12 };
        json!({
            "id": id, "card_id": card_id, "dashboard_tab_id": tab,
            "row": 0, "col": col, "size_x": 12, "size_y": 6,
            "parameter_mappings": mappings
        })
    }

    fn source_dashboard() -> Value {
        json!({
            "id": 1,
            "name": "Sales",
            "tabs": [{ "id": 10, "name": "Overview", "position": 0 }],
            "parameters": [
                { "id": "date_range", "name": "Date", "slug": "date", "type": "date/all-options" }
            ],
            "dashcards": [
                dashcard(100, 5, 10, json!([{ "parameter_id": "date_range", "card_id": 5, "target": ["dimension", ["field", 40, null]] }])),
                dashcard(101, 6, 10, json!([{ "parameter_id": "date_range", "card_id": 6, "target": ["dimension", ["field", 41, null]] }]))
            ]
        })
    }

    fn target_state(tabs: Value, cards: Vec<Value>) -> Value {
        json!({ "id": 2, "name": "Board", "tabs": tabs, "parameters": [], "dashcards": cards })
    }

    fn two_tabs() -> Value {
        json!([{ "id": 20, "name": "Main", "position": 0 }, { "id": 21, "name": "Copied", "position": 1 }])
    }

    async fn mount_copy_flow(server: &MockServer, fail_second_card: bool) {
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/dashboard/1");
                then.status(200).json_body(source_dashboard());
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/dashboard/2");
                then.status(200).json_body(target_state(
                    json!([{ "id": 20, "name": "Main", "position": 0 }]),
                    vec![dashcard(200, 9, 20, json!([]))],
                ));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/api/dashboard/2")
                    .body_contains(r#"{"id":-1,"name":"Copied""#);
                then.status(200).json_body(target_state(
                    two_tabs(),
                    vec![dashcard(200, 9, 20, json!([]))],
                ));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/api/dashboard/2")
                    .body_contains(r#""parameters":"#);
                then.status(200).json_body(target_state(
                    two_tabs(),
                    vec![dashcard(200, 9, 20, json!([]))],
                ));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/api/dashboard/2")
                    .body_contains(r#"{"id":-1,"card_id":5,"dashboard_tab_id":21"#);
                then.status(200).json_body(target_state(
                    two_tabs(),
                    vec![dashcard(200, 9, 20, json!([])), dashcard(300, 5, 21, json!([]))],
                ));
            })
            .await;
        server
            .mock_async(move |when, then| {
                when.method(PUT)
                    .path("/api/dashboard/2")
                    .body_contains(r#"{"id":-1,"card_id":6,"dashboard_tab_id":21"#);
                if fail_second_card {
                    then.status(400).body("Invalid dashcard");
                } else {
                    then.status(200).json_body(target_state(
                        two_tabs(),
                        vec![
                            dashcard(200, 9, 20, json!([])),
                            dashcard(300, 5, 21, json!([])),
                            dashcard(301, 6, 21, json!([])),
                        ],
                    ));
                }
            })
            .await;
    }

    fn copy_request(include_filters: bool) -> CopyTabRequest {
        CopyTabRequest {
            source_dashboard_id: 1,
            target_dashboard_id: 2,
            tab_id: 10,
            new_tab_name: Some("Copied".to_string()),
            include_filters,
        }
    }

    #[tokio::test]
    async fn copy_with_filters_rewrites_parameter_ids() {
        let server = MockServer::start_async().await;
        let leaked = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/api/dashboard/2")
                    .body_contains(r#""parameter_id":"date_range""#);
                then.status(500);
            })
            .await;
        mount_copy_flow(&server, false).await;
        let dispatcher = dispatcher(&server);

        let report = DashboardComposer::new(&dispatcher)
            .copy_tab(copy_request(true))
            .await
            .unwrap();

        assert!(report.is_complete(), "{report:?}");
        assert_eq!(report.target_tab_id, Some(21));
        assert_eq!(report.card_id_map, BTreeMap::from([(100, 300), (101, 301)]));
        assert_eq!(report.parameter_id_map.len(), 1);
        assert_ne!(report.parameter_id_map["date_range"], "date_range");
        assert_eq!(report.completed_steps.len(), 6);
        leaked.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn copy_without_filters_creates_no_parameters() {
        let server = MockServer::start_async().await;
        let mapped = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/api/dashboard/2")
                    .body_contains(r#""parameter_id""#);
                then.status(500);
            })
            .await;
        mount_copy_flow(&server, false).await;
        let parameters = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/api/dashboard/2")
                    .body_contains(r#""parameters":"#);
                then.status(500);
            })
            .await;
        let dispatcher = dispatcher(&server);

        let report = DashboardComposer::new(&dispatcher)
            .copy_tab(copy_request(false))
            .await
            .unwrap();

        assert!(report.is_complete(), "{report:?}");
        assert!(report.parameter_id_map.is_empty());
        assert_eq!(report.card_id_map.len(), 2);
        assert!(
            !report
                .completed_steps
                .iter()
                .any(|step| matches!(step, CopyStep::CopyParameters { .. }))
        );
        mapped.assert_hits_async(0).await;
        parameters.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn failed_placement_reports_partial_progress() {
        let server = MockServer::start_async().await;
        mount_copy_flow(&server, true).await;
        let dispatcher = dispatcher(&server);

        let report = DashboardComposer::new(&dispatcher)
            .copy_tab(copy_request(true))
            .await
            .unwrap();

        assert_eq!(report.status, CopyStatus::Partial);
        assert_eq!(report.card_id_map, BTreeMap::from([(100, 300)]));
        let failed = report.failed_step.clone().unwrap();
        assert_eq!(failed["step"], "place_card");
        assert_eq!(failed["source_dashcard_id"], 101);
        assert_eq!(report.error.clone().unwrap()["error"], "client_error");
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["status"], "partial");
        assert_eq!(value["card_id_map"]["100"], 300);
    }

    #[tokio::test]
    async fn update_with_unknown_dashcard_never_writes() {
        let server = MockServer::start_async().await;
        let read = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/dashboard/1");
                then.status(200).json_body(source_dashboard());
            })
            .await;
        let write = server
            .mock_async(|when, then| {
                when.method(PUT).path("/api/dashboard/1");
                then.status(200).json_body(source_dashboard());
            })
            .await;
        let dispatcher = dispatcher(&server);
        let updates: Vec<CardUpdate> =
            serde_json::from_value(json!([{ "id": 100, "row": 4 }, { "id": 555, "row": 0 }])).unwrap();

        let err = DashboardComposer::new(&dispatcher)
            .update_cards(1, updates)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Validation { .. }));
        read.assert_hits_async(1).await;
        write.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn add_card_reports_overlaps_and_new_id() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/dashboard/1");
                then.status(200).json_body(source_dashboard());
            })
            .await;
        let write = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/api/dashboard/1")
                    .body_contains(r#"{"id":-1,"card_id":8,"dashboard_tab_id":10"#);
                let mut updated = source_dashboard();
                updated["dashcards"]
                    .as_array_mut()
                    .unwrap()
                    .push(dashcard(102, 8, 10, json!([])));
                then.status(200).json_body(updated);
            })
            .await;
        let dispatcher = dispatcher(&server);
        let request: AddCardRequest = serde_json::from_value(json!({
            "dashboard_id": 1,
            "card_id": 8,
            "row": 2,
            "col": 10,
            "parameter_mappings": [{ "parameter_id": "date_range", "target": ["dimension", ["field", 40, null]] }]
        }))
        .unwrap();

        let result = DashboardComposer::new(&dispatcher).add_card(request).await.unwrap();

        assert_eq!(result["dashcard_id"], 102);
        assert_eq!(result["tab_id"], 10);
        assert_eq!(result["overlaps"], json!([100, 101]));
        write.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn add_card_rejects_mapping_to_unknown_parameter_without_writing() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/dashboard/1");
                then.status(200).json_body(source_dashboard());
            })
            .await;
        let write = server
            .mock_async(|when, then| {
                when.method(PUT).path("/api/dashboard/1");
                then.status(200).json_body(source_dashboard());
            })
            .await;
        let dispatcher = dispatcher(&server);
        let request: AddCardRequest = serde_json::from_value(json!({
            "dashboard_id": 1,
            "card_id": 8,
            "parameter_mappings": [{ "parameter_id": "missing", "target": ["dimension", ["field", 40, null]] }]
        }))
        .unwrap();

        let err = DashboardComposer::new(&dispatcher).add_card(request).await.unwrap_err();
        assert_eq!(err.field(), Some("parameter_mappings[0].parameter_id"));
        write.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn add_filters_merges_by_id() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/dashboard/1");
                then.status(200).json_body(source_dashboard());
            })
            .await;
        let write = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/api/dashboard/1")
                    .body_contains(r#""name":"Date (renamed)""#)
                    .body_contains(r#""slug":"region""#);
                then.status(200).json_body(source_dashboard());
            })
            .await;
        let dispatcher = dispatcher(&server);
        let parameters: Vec<ParameterArgs> = serde_json::from_value(json!([
            { "id": "date_range", "name": "Date (renamed)", "slug": "date", "type": "date/all-options" },
            { "name": "Region", "type": "string/=" }
        ]))
        .unwrap();

        let result = DashboardComposer::new(&dispatcher)
            .add_filters(1, parameters)
            .await
            .unwrap();

        assert_eq!(result["replaced"], json!(["date_range"]));
        assert_eq!(result["added"].as_array().unwrap().len(), 1);
        write.assert_hits_async(1).await;
    }
}
