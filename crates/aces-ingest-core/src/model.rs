use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;

use crate::schema_map::ValueKind;

/// A typed value produced by coercing mapped ACES text.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum Value {
    Integer(i64),
    Text(String),
}

impl Value {
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            Self::Text(_) => None,
        }
    }

    #[must_use]
    pub fn into_text(self) -> String {
        match self {
            Self::Integer(value) => value.to_string(),
            Self::Text(value) => value,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("`{raw}` is not a valid {kind:?} value")]
pub struct CoerceError {
    pub kind: ValueKind,
    pub raw: String,
}

const ISO_DATE: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");

/// Coerce trimmed source text into the declared kind. Dates normalise to `YYYY-MM-DD`.
///
/// # Errors
/// Returns [`CoerceError`] when the text does not parse as the declared kind.
pub fn coerce(kind: ValueKind, raw: &str) -> Result<Value, CoerceError> {
    let trimmed = raw.trim();
    let fail = || CoerceError { kind, raw: raw.to_string() };
    match kind {
        ValueKind::Integer => trimmed.parse::<i64>().map(Value::Integer).map_err(|_| fail()),
        ValueKind::Text => Ok(Value::Text(trimmed.to_string())),
        ValueKind::Date => {
            let date = time::Date::parse(trimmed, ISO_DATE).map_err(|_| fail())?;
            let normalised = date.format(ISO_DATE).map_err(|_| fail())?;
            Ok(Value::Text(normalised))
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum AppAction {
    #[serde(rename = "A")]
    Add,
    #[serde(rename = "D")]
    Delete,
}

impl AppAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "A",
            Self::Delete => "D",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "A" => Some(Self::Add),
            "D" => Some(Self::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ApplicationRow {
    pub source_file: Arc<str>,
    pub app_id: i64,
    pub action: Option<AppAction>,
    pub validate: Option<String>,
    pub part_number: Option<String>,
    pub part_type_id: Option<i64>,
    pub quantity: Option<i64>,
    pub position_id: Option<i64>,
    pub brand_aaiaid: Option<String>,
    pub subbrand_aaiaid: Option<String>,
    pub mfr_label: Option<String>,
    pub display_order: Option<i64>,
    pub asset_name: Option<String>,
    pub asset_item_order: Option<i64>,
    pub asset_item_ref: Option<String>,
}

/// Why a value could not be placed on a typed row.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AssignError {
    AlreadySet,
    UnknownColumn,
    Invalid,
}

fn put<T>(slot: &mut Option<T>, value: T) -> Result<(), AssignError> {
    if slot.is_some() {
        return Err(AssignError::AlreadySet);
    }
    *slot = Some(value);
    Ok(())
}

fn integer(value: Value) -> Result<i64, AssignError> {
    value.as_integer().ok_or(AssignError::Invalid)
}

impl ApplicationRow {
    #[must_use]
    pub fn new(source_file: Arc<str>, app_id: i64) -> Self {
        Self {
            source_file,
            app_id,
            action: None,
            validate: None,
            part_number: None,
            part_type_id: None,
            quantity: None,
            position_id: None,
            brand_aaiaid: None,
            subbrand_aaiaid: None,
            mfr_label: None,
            display_order: None,
            asset_name: None,
            asset_item_order: None,
            asset_item_ref: None,
        }
    }

    /// Set one mapped column. A column may be set once per application.
    ///
    /// # Errors
    /// Returns [`AssignError`] when the column is unknown, already set, or the value
    /// does not fit the column.
    pub fn assign(&mut self, column: &str, value: Value) -> Result<(), AssignError> {
        match column {
            "action" => {
                let action =
                    AppAction::parse(&value.into_text()).ok_or(AssignError::Invalid)?;
                put(&mut self.action, action)
            }
            "validate" => put(&mut self.validate, value.into_text()),
            "part_number" => put(&mut self.part_number, value.into_text()),
            "part_type_id" => put(&mut self.part_type_id, integer(value)?),
            "quantity" => put(&mut self.quantity, integer(value)?),
            "position_id" => put(&mut self.position_id, integer(value)?),
            "brand_aaiaid" => put(&mut self.brand_aaiaid, value.into_text()),
            "subbrand_aaiaid" => put(&mut self.subbrand_aaiaid, value.into_text()),
            "mfr_label" => put(&mut self.mfr_label, value.into_text()),
            "display_order" => put(&mut self.display_order, integer(value)?),
            "asset_name" => put(&mut self.asset_name, value.into_text()),
            "asset_item_order" => put(&mut self.asset_item_order, integer(value)?),
            "asset_item_ref" => put(&mut self.asset_item_ref, value.into_text()),
            _ => Err(AssignError::UnknownColumn),
        }
    }

    #[must_use]
    pub fn has_part_number(&self) -> bool {
        self.part_number.as_deref().is_some_and(|value| !value.trim().is_empty())
    }
}

/// Vehicle side of an application. Values are keyed by `FITMENT_COLUMNS` names.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VehicleFitmentRow {
    pub source_file: Arc<str>,
    pub app_id: i64,
    pub values: BTreeMap<&'static str, i64>,
}

impl VehicleFitmentRow {
    #[must_use]
    pub fn new(source_file: Arc<str>, app_id: i64) -> Self {
        Self { source_file, app_id, values: BTreeMap::new() }
    }

    /// # Errors
    /// Returns [`AssignError::AlreadySet`] for a repeated column and
    /// [`AssignError::Invalid`] for a non-integer value.
    pub fn assign(&mut self, column: &'static str, value: Value) -> Result<(), AssignError> {
        let value = integer(value)?;
        if self.values.contains_key(column) {
            return Err(AssignError::AlreadySet);
        }
        self.values.insert(column, value);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, column: &str) -> Option<i64> {
        self.values.get(column).copied()
    }

    /// False when no vehicle reference was recognised; the row still lands, flagged.
    #[must_use]
    pub fn has_vehicle_reference(&self) -> bool {
        !self.values.is_empty()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct QualifierRow {
    pub source_file: Arc<str>,
    pub app_id: i64,
    pub idx: u32,
    pub qual_id: Option<i64>,
    pub qual_text: Option<String>,
    pub param_1: Option<String>,
    pub param_2: Option<String>,
    pub param_3: Option<String>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VehicleTypeRow {
    pub source_file: Arc<str>,
    pub app_id: i64,
    pub idx: u32,
    pub vehicle_type_id: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RawKind {
    Element,
    Attribute,
}

impl RawKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Element => "element",
            Self::Attribute => "attribute",
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RawAttributeRow {
    pub source_file: Arc<str>,
    pub app_id: i64,
    pub idx: u32,
    pub attr_kind: RawKind,
    pub attr_name: String,
    pub attr_id: Option<String>,
    pub attr_value: Option<String>,
}

/// Document-level metadata from `<ACES version>` and `<Header>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct DocumentHeader {
    pub aces_version: Option<String>,
    /// Recognised header fields keyed by their `HEADER_FIELDS` key.
    pub fields: BTreeMap<String, String>,
    /// Header children the schema map does not recognise, or whose value failed coercion.
    pub unmapped: BTreeMap<String, String>,
}

impl DocumentHeader {
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct DocumentFooter {
    pub record_count: Option<u64>,
}

/// Where in the input a record came from.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordLocator {
    pub app_id: Option<i64>,
    pub byte_offset: Option<u64>,
}

impl Display for RecordLocator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (self.app_id, self.byte_offset) {
            (Some(app_id), Some(offset)) => write!(f, "app_id={app_id} offset={offset}"),
            (Some(app_id), None) => write!(f, "app_id={app_id}"),
            (None, Some(offset)) => write!(f, "offset={offset}"),
            (None, None) => write!(f, "location unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> ApplicationRow {
        ApplicationRow::new(Arc::from("fixture.xml"), 1)
    }

    #[test]
    fn coerce_integer_trims_whitespace() {
        assert_eq!(coerce(ValueKind::Integer, " 42\n"), Ok(Value::Integer(42)));
        assert!(coerce(ValueKind::Integer, "two").is_err());
    }

    #[test]
    fn coerce_date_normalises_and_rejects_garbage() {
        assert_eq!(coerce(ValueKind::Date, "2024-03-07"), Ok(Value::Text("2024-03-07".into())));
        assert!(coerce(ValueKind::Date, "2024-13-07").is_err());
        assert!(coerce(ValueKind::Date, "yesterday").is_err());
    }

    #[test]
    fn assign_rejects_duplicate_scalar() {
        let mut app = row();
        assert_eq!(app.assign("quantity", Value::Integer(1)), Ok(()));
        assert_eq!(app.assign("quantity", Value::Integer(2)), Err(AssignError::AlreadySet));
        assert_eq!(app.quantity, Some(1));
    }

    #[test]
    fn assign_parses_action() {
        let mut app = row();
        assert_eq!(app.assign("action", Value::Text("D".into())), Ok(()));
        assert_eq!(app.action, Some(AppAction::Delete));

        let mut other = row();
        assert_eq!(other.assign("action", Value::Text("X".into())), Err(AssignError::Invalid));
        assert_eq!(other.action, None);
    }

    #[test]
    fn assign_unknown_column_is_reported() {
        let mut app = row();
        assert_eq!(app.assign("colour", Value::Text("red".into())), Err(AssignError::UnknownColumn));
    }

    #[test]
    fn blank_part_number_does_not_count() {
        let mut app = row();
        assert!(!app.has_part_number());
        app.part_number = Some("  ".into());
        assert!(!app.has_part_number());
        app.part_number = Some("ABC-1".into());
        assert!(app.has_part_number());
    }

    #[test]
    fn fitment_flags_missing_vehicle_reference() {
        let mut fitment = VehicleFitmentRow::new(Arc::from("fixture.xml"), 1);
        assert!(!fitment.has_vehicle_reference());
        assert_eq!(fitment.assign("base_vehicle_id", Value::Integer(10)), Ok(()));
        assert!(fitment.has_vehicle_reference());
        assert_eq!(
            fitment.assign("base_vehicle_id", Value::Integer(11)),
            Err(AssignError::AlreadySet)
        );
        assert_eq!(fitment.get("base_vehicle_id"), Some(10));
    }

    #[test]
    fn locator_display() {
        let locator = RecordLocator { app_id: Some(7), byte_offset: Some(120) };
        assert_eq!(locator.to_string(), "app_id=7 offset=120");
        assert_eq!(RecordLocator::default().to_string(), "location unknown");
    }
}
