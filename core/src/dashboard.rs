//! Dashboard model and the pure composition rules behind the dashboard tools.
//!
//! Everything here operates on in-memory snapshots of remote state; the
//! runtime crate reads a dashboard, applies one of these rules, and writes the
//! result back.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::query::FieldRef;

/// Id submitted for a dashcard or tab that does not exist yet; the remote
/// replaces it with a real id.
pub const NEW_ENTITY_ID: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridPosition {
    pub row: i64,
    pub col: i64,
    pub size_x: i64,
    pub size_y: i64,
}

impl GridPosition {
    pub fn validate(&self, path: &str) -> Result<()> {
        if self.row < 0 || self.col < 0 {
            return Err(Error::invalid_field(
                path,
                "row and col must not be negative",
            ));
        }
        if self.size_x < 1 || self.size_y < 1 {
            return Err(Error::invalid_field(
                path,
                "size_x and size_y must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn overlaps(&self, other: &GridPosition) -> bool {
        self.col < other.col + other.size_x
            && other.col < self.col + self.size_x
            && self.row < other.row + other.size_y
            && other.row < self.row + self.size_y
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateTagKind {
    Dimension,
    Variable,
}

/// Where a dashboard parameter lands on a card's query.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterTarget {
    /// `["dimension", ["field", id, opts]]`
    Dimension(FieldRef),
    /// `["dimension" | "variable", ["template-tag", name]]` on native cards.
    TemplateTag { kind: TemplateTagKind, name: String },
    /// Remote shapes this crate does not model, kept verbatim.
    Other(Value),
}

impl ParameterTarget {
    pub fn to_value(&self) -> Value {
        match self {
            ParameterTarget::Dimension(field) => json!(["dimension", field.to_mbql()]),
            ParameterTarget::TemplateTag { kind, name } => {
                let wrapper = match kind {
                    TemplateTagKind::Dimension => "dimension",
                    TemplateTagKind::Variable => "variable",
                };
                json!([wrapper, ["template-tag", name]])
            }
            ParameterTarget::Other(value) => value.clone(),
        }
    }

    /// Accepts the MBQL array form, or a bare `{"field_id": .., "temporal_unit": ..}`
    /// object as shorthand for a dimension target.
    pub fn from_value(value: &Value) -> Self {
        if value.is_object() {
            return match serde_json::from_value::<FieldRef>(value.clone()) {
                Ok(field) => ParameterTarget::Dimension(field),
                Err(_) => ParameterTarget::Other(value.clone()),
            };
        }
        let parsed = value.as_array().and_then(|items| {
            let wrapper = items.first()?.as_str()?;
            let inner = items.get(1)?;
            if let Some(field) = FieldRef::from_mbql(inner) {
                return (wrapper == "dimension").then_some(ParameterTarget::Dimension(field));
            }
            let tag = inner.as_array()?;
            if tag.first()?.as_str()? != "template-tag" {
                return None;
            }
            let name = tag.get(1)?.as_str()?.to_string();
            let kind = match wrapper {
                "dimension" => TemplateTagKind::Dimension,
                "variable" => TemplateTagKind::Variable,
                _ => return None,
            };
            Some(ParameterTarget::TemplateTag { kind, name })
        });
        parsed.unwrap_or_else(|| ParameterTarget::Other(value.clone()))
    }

    pub fn is_recognised(&self) -> bool {
        !matches!(self, ParameterTarget::Other(_))
    }
}

impl Serialize for ParameterTarget {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ParameterTarget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(ParameterTarget::from_value(&value))
    }
}

/// Binds a dashboard parameter to a field on one dashcard's query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterMapping {
    pub parameter_id: String,
    /// Filled from the owning dashcard when omitted by the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_id: Option<i64>,
    pub target: ParameterTarget,
}

/// A dashboard-level filter definition. Unknown remote keys (defaults,
/// value sources, ...) ride along in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub id: String,
    pub name: String,
    pub slug: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "sectionId", default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Caller-supplied parameter; `id` and `slug` are optional.
#[derive(Debug, Clone, Deserialize)]
pub struct ParameterArgs {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, alias = "sectionId")]
    pub section_id: Option<String>,
    #[serde(default)]
    pub default: Option<Value>,
}

impl ParameterArgs {
    /// Resolve into a full parameter, generating an id that collides with
    /// nothing in `taken` when none was supplied.
    pub fn into_parameter(self, taken: &HashSet<String>) -> Result<Parameter> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid_field("parameters.name", "name must not be empty"));
        }
        if self.kind.trim().is_empty() {
            return Err(Error::invalid_field("parameters.type", "type must not be empty"));
        }
        let id = match self.id {
            Some(id) if !id.trim().is_empty() => id,
            _ => fresh_parameter_id(taken),
        };
        let slug = self
            .slug
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| slugify(&self.name));
        let section_id = self
            .section_id
            .or_else(|| self.kind.split('/').next().map(str::to_string));
        let mut extra = Map::new();
        if let Some(default) = self.default {
            extra.insert("default".to_string(), default);
        }
        Ok(Parameter {
            id,
            name: self.name,
            slug,
            kind: self.kind,
            section_id,
            extra,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tab {
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
    /// Remote fields this model does not interpret; written back untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashCard {
    pub id: i64,
    /// `None` for text/heading cards.
    #[serde(default)]
    pub card_id: Option<i64>,
    #[serde(default)]
    pub dashboard_tab_id: Option<i64>,
    pub row: i64,
    pub col: i64,
    pub size_x: i64,
    pub size_y: i64,
    #[serde(default)]
    pub parameter_mappings: Vec<ParameterMapping>,
    #[serde(default)]
    pub visualization_settings: Map<String, Value>,
    #[serde(default)]
    pub series: Vec<Value>,
    /// Everything else the remote sends (`action_id`, `inline_parameters`,
    /// ...). Layout writes re-send every dashcard, so these must survive.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DashCard {
    pub fn position(&self) -> GridPosition {
        GridPosition {
            row: self.row,
            col: self.col,
            size_x: self.size_x,
            size_y: self.size_y,
        }
    }

    pub fn set_position(&mut self, position: GridPosition) {
        self.row = position.row;
        self.col = position.col;
        self.size_x = position.size_x;
        self.size_y = position.size_y;
    }

    /// A new dashcard for `card_id`, with a placeholder id.
    pub fn placed(card_id: i64, position: GridPosition, tab_id: Option<i64>) -> Self {
        Self {
            id: NEW_ENTITY_ID,
            card_id: Some(card_id),
            dashboard_tab_id: tab_id,
            row: position.row,
            col: position.col,
            size_x: position.size_x,
            size_y: position.size_y,
            parameter_mappings: Vec::new(),
            visualization_settings: Map::new(),
            series: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Mappings whose `card_id` was omitted belong to this dashcard's card.
    pub fn fill_mapping_card_ids(&mut self) {
        let card_id = self.card_id;
        for mapping in &mut self.parameter_mappings {
            if mapping.card_id.is_none() {
                mapping.card_id = card_id;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dashboard {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "ordered_cards")]
    pub dashcards: Vec<DashCard>,
    #[serde(default)]
    pub tabs: Vec<Tab>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

impl Dashboard {
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| Error::validation(format!("unexpected dashboard payload: {e}")))
    }

    pub fn dashcard(&self, id: i64) -> Option<&DashCard> {
        self.dashcards.iter().find(|dc| dc.id == id)
    }

    pub fn parameter_ids(&self) -> HashSet<String> {
        self.parameters.iter().map(|p| p.id.clone()).collect()
    }

    pub fn has_tab(&self, tab_id: i64) -> bool {
        self.tabs.iter().any(|tab| tab.id == tab_id)
    }

    /// Ids of dashcards on the same tab whose rectangle intersects `position`.
    pub fn overlapping(&self, position: &GridPosition, tab_id: Option<i64>) -> Vec<i64> {
        self.dashcards
            .iter()
            .filter(|dc| dc.dashboard_tab_id == tab_id && dc.position().overlaps(position))
            .map(|dc| dc.id)
            .collect()
    }

    /// Body for `PUT /dashboard/:id` replacing the card layout.
    pub fn layout_payload(&self, dashcards: &[DashCard], tabs: &[Tab]) -> Value {
        let mut payload = json!({ "dashcards": dashcards });
        if !tabs.is_empty() {
            payload["tabs"] = json!(tabs);
        }
        payload
    }
}

/// Every mapping must name a parameter that exists on the owning dashboard
/// and target a shape the remote understands.
pub fn validate_mappings(
    mappings: &[ParameterMapping],
    parameter_ids: &HashSet<String>,
    path: &str,
) -> Result<()> {
    for (index, mapping) in mappings.iter().enumerate() {
        if !parameter_ids.contains(&mapping.parameter_id) {
            return Err(Error::invalid_field(
                format!("{path}[{index}].parameter_id"),
                format!(
                    "parameter '{}' does not exist on the dashboard",
                    mapping.parameter_id
                ),
            ));
        }
        if !mapping.target.is_recognised() {
            return Err(Error::invalid_field(
                format!("{path}[{index}].target"),
                "target must be [\"dimension\", [\"field\", id, opts]] or a template-tag target",
            ));
        }
        if matches!(&mapping.target, ParameterTarget::Dimension(field) if field.id <= 0) {
            return Err(Error::invalid_field(
                format!("{path}[{index}].target"),
                "target field id must be a positive integer",
            ));
        }
    }
    Ok(())
}

/// Merge parameters by id: an incoming id that already exists replaces the
/// existing entry in place, new ids are appended in input order.
pub fn merge_parameters(existing: &[Parameter], incoming: Vec<Parameter>) -> Vec<Parameter> {
    let mut merged = existing.to_vec();
    for parameter in incoming {
        match merged.iter_mut().find(|p| p.id == parameter.id) {
            Some(slot) => *slot = parameter,
            None => merged.push(parameter),
        }
    }
    merged
}

/// Replacement of position and/or mappings for one existing dashcard.
#[derive(Debug, Clone, Deserialize)]
pub struct CardUpdate {
    pub id: i64,
    #[serde(default)]
    pub row: Option<i64>,
    #[serde(default)]
    pub col: Option<i64>,
    #[serde(default)]
    pub size_x: Option<i64>,
    #[serde(default)]
    pub size_y: Option<i64>,
    #[serde(default)]
    pub parameter_mappings: Option<Vec<ParameterMapping>>,
}

/// Apply updates to the dashboard's dashcards. Update-only: an id that is not
/// on the dashboard fails the whole batch.
pub fn apply_card_updates(dashboard: &Dashboard, updates: &[CardUpdate]) -> Result<Vec<DashCard>> {
    let present: HashSet<i64> = dashboard.dashcards.iter().map(|dc| dc.id).collect();
    let missing: Vec<i64> = updates
        .iter()
        .map(|u| u.id)
        .filter(|id| !present.contains(id))
        .collect();
    if !missing.is_empty() {
        return Err(Error::invalid_field(
            "cards",
            format!(
                "dashcard ids {missing:?} are not on dashboard {}; this operation never creates dashcards",
                dashboard.id
            ),
        ));
    }
    let mut seen = HashSet::new();
    if let Some(dup) = updates.iter().find(|u| !seen.insert(u.id)) {
        return Err(Error::invalid_field(
            "cards",
            format!("dashcard id {} appears more than once", dup.id),
        ));
    }

    let parameter_ids = dashboard.parameter_ids();
    let by_id: HashMap<i64, &CardUpdate> = updates.iter().map(|u| (u.id, u)).collect();
    let mut cards = dashboard.dashcards.clone();
    for (index, card) in cards.iter_mut().enumerate() {
        let Some(update) = by_id.get(&card.id) else {
            continue;
        };
        let position = GridPosition {
            row: update.row.unwrap_or(card.row),
            col: update.col.unwrap_or(card.col),
            size_x: update.size_x.unwrap_or(card.size_x),
            size_y: update.size_y.unwrap_or(card.size_y),
        };
        position.validate(&format!("cards[{index}]"))?;
        card.set_position(position);
        if let Some(mappings) = &update.parameter_mappings {
            validate_mappings(
                mappings,
                &parameter_ids,
                &format!("cards[{index}].parameter_mappings"),
            )?;
            card.parameter_mappings = mappings.clone();
            card.fill_mapping_card_ids();
        }
    }
    Ok(cards)
}

/// Drop one dashcard; unknown ids are a validation error.
pub fn remove_dashcard(dashboard: &Dashboard, dashcard_id: i64) -> Result<Vec<DashCard>> {
    if dashboard.dashcard(dashcard_id).is_none() {
        return Err(Error::invalid_field(
            "dashcard_id",
            format!("dashcard {dashcard_id} is not on dashboard {}", dashboard.id),
        ));
    }
    Ok(dashboard
        .dashcards
        .iter()
        .filter(|dc| dc.id != dashcard_id)
        .cloned()
        .collect())
}

/// Tabs and dashcards for a layout write that adds one tab named `name`.
/// A dashboard without tabs gets a first tab holding its existing cards, so
/// the new tab is always the last placeholder in the returned list.
pub fn layout_with_new_tab(target: &Dashboard, name: &str) -> (Vec<Tab>, Vec<DashCard>) {
    let mut tabs = target.tabs.clone();
    let mut cards = target.dashcards.clone();
    let mut next_id = NEW_ENTITY_ID;
    if tabs.is_empty() && !cards.is_empty() {
        tabs.push(Tab {
            id: next_id,
            name: "Tab 1".to_string(),
            position: Some(0),
            extra: Map::new(),
        });
        for card in &mut cards {
            card.dashboard_tab_id = Some(next_id);
        }
        next_id -= 1;
    }
    let position = tabs
        .iter()
        .filter_map(|tab| tab.position)
        .max()
        .map_or(tabs.len() as i64, |max| max + 1);
    tabs.push(Tab {
        id: next_id,
        name: name.to_string(),
        position: Some(position),
        extra: Map::new(),
    });
    (tabs, cards)
}

/// Ids present in `after` but not in `before`, in `after`'s order.
pub fn created_ids(
    before: impl IntoIterator<Item = i64>,
    after: impl IntoIterator<Item = i64>,
) -> Vec<i64> {
    let before: HashSet<i64> = before.into_iter().collect();
    after.into_iter().filter(|id| !before.contains(id)).collect()
}

/// Fresh, collision-free parameter id.
pub fn fresh_parameter_id(taken: &HashSet<String>) -> String {
    loop {
        let id = Uuid::now_v7().simple().to_string();
        if !taken.contains(&id) {
            return id;
        }
    }
}

pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let slug = slug.trim_matches('_').to_string();
    if slug.is_empty() {
        "filter".to_string()
    } else {
        slug
    }
}

fn unique_slug(base: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{base}_{n}"))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| base.to_string())
}

/// Dashcard fields that identify the source dashboard or its parameters and
/// must not follow a card onto another dashboard.
const SOURCE_BOUND_KEYS: &[&str] = &[
    "dashboard_id",
    "entity_id",
    "created_at",
    "updated_at",
    "inline_parameters",
];

/// What a tab copy will do, derived from the source dashboard alone.
#[derive(Debug, Clone)]
pub struct TabCopyPlan {
    pub source_tab: Tab,
    pub cards: Vec<DashCard>,
    /// Source parameters referenced by the selected cards, in first-use order.
    pub parameters: Vec<Parameter>,
    pub include_filters: bool,
    /// Mappings naming parameters the source dashboard does not define.
    pub dangling_mappings: usize,
}

impl TabCopyPlan {
    pub fn new(source: &Dashboard, tab_id: i64, include_filters: bool) -> Result<Self> {
        let source_tab = source
            .tabs
            .iter()
            .find(|tab| tab.id == tab_id)
            .cloned()
            .ok_or_else(|| {
                Error::invalid_field(
                    "tab_id",
                    format!("tab {tab_id} does not exist on dashboard {}", source.id),
                )
            })?;

        let cards: Vec<DashCard> = source
            .dashcards
            .iter()
            .filter(|dc| dc.dashboard_tab_id == Some(tab_id))
            .cloned()
            .collect();

        let known: HashMap<&str, &Parameter> = source
            .parameters
            .iter()
            .map(|p| (p.id.as_str(), p))
            .collect();
        let mut parameters = Vec::new();
        let mut seen = HashSet::new();
        let mut dangling_mappings = 0;
        for mapping in cards.iter().flat_map(|dc| dc.parameter_mappings.iter()) {
            match known.get(mapping.parameter_id.as_str()) {
                Some(parameter) => {
                    if seen.insert(parameter.id.clone()) {
                        parameters.push((*parameter).clone());
                    }
                }
                None => dangling_mappings += 1,
            }
        }

        Ok(Self {
            source_tab,
            cards,
            parameters,
            include_filters,
            dangling_mappings,
        })
    }

    /// Copies of the referenced parameters for the target dashboard, each with
    /// a fresh id and a slug unique on the target. Empty when filters are not
    /// being copied. Returns the copies and a source-id → target-id map.
    pub fn parameter_copies(
        &self,
        target: &Dashboard) -> (Vec<Parameter>, BTreeMap<String,
        String>,
    ) {
        let mut copies = Vec::new();
        let mut id_map = BTreeMap::new();
        if !self.include_filters {
            return (copies, id_map);
        }
        let mut taken_ids = target.parameter_ids();
        taken_ids.extend(self.parameters.iter().map(|p| p.id.clone()));
        let mut taken_slugs: HashSet<String> =
            target.parameters.iter().map(|p| p.slug.clone()).collect();

        for parameter in &self.parameters {
            let id = fresh_parameter_id(&taken_ids);
            taken_ids.insert(id.clone());
            let slug = unique_slug(&parameter.slug, &taken_slugs);
            taken_slugs.insert(slug.clone());
            id_map.insert(parameter.id.clone(), id.clone());
            copies.push(Parameter {
                id,
                slug,
                ..parameter.clone()
            });
        }
        (copies, id_map)
    }

    /// The target-side version of `source_card`: same geometry and
    /// visualization, placeholder id, new tab, mappings rewritten through
    /// `id_map` (or dropped when filters are not copied).
    pub fn target_card(
        &self,
        source_card: &DashCard,
        target_tab_id: i64,
        id_map: &BTreeMap<String, String>,
    ) -> DashCard {
        let parameter_mappings = if self.include_filters {
            source_card
                .parameter_mappings
                .iter()
                .filter_map(|mapping| {
                    id_map.get(&mapping.parameter_id).map(|new_id| ParameterMapping {
                        parameter_id: new_id.clone(),
                        card_id: mapping.card_id.or(source_card.card_id),
                        target: mapping.target.clone(),
                    })
                })
                .collect()
        } else {
            Vec::new()
        };
        let mut extra = source_card.extra.clone();
        for key in SOURCE_BOUND_KEYS {
            extra.remove(*key);
        }
        DashCard {
            id: NEW_ENTITY_ID,
            dashboard_tab_id: Some(target_tab_id),
            parameter_mappings,
            extra,
            ..source_card.clone()
        }
    }
}
