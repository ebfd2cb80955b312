//! `<App>` subtree to typed rows.
//!
//! Normalisation is pure. Every child node and attribute of an application is either
//! claimed by the schema map or captured as a raw attribute row, so nothing the supplier
//! sent is dropped. Problems that do not prevent building rows are reported as
//! [`RecordIssue`]s and the driver decides what to do with them.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::model::{
    coerce, ApplicationRow, AssignError, QualifierRow, RawAttributeRow, RawKind, Value,
    VehicleFitmentRow, VehicleTypeRow,
};
use crate::parser::AppRecord;
use crate::schema_map::{
    app_attribute, list_element, scalar_mappings, vehicle_group, Entity, FieldMapping,
    ListElement, ValueKind, ValueSource, VehicleGroup, NOTE_ATTR_NAME, QUALIFIER_PARAM_SLOTS,
};
use crate::tree::XmlNode;

/// Which vehicle reference group is kept when an application names the vehicle twice.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum VehicleReferenceRule {
    #[default]
    FirstClaimWins,
    PreferBaseVehicle,
    PreferYearMakeModel,
    KeepAll,
}

impl VehicleReferenceRule {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FirstClaimWins => "first-claim-wins",
            Self::PreferBaseVehicle => "prefer-base-vehicle",
            Self::PreferYearMakeModel => "prefer-year-make-model",
            Self::KeepAll => "keep-all",
        }
    }
}

impl FromStr for VehicleReferenceRule {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "first-claim-wins" => Ok(Self::FirstClaimWins),
            "prefer-base-vehicle" => Ok(Self::PreferBaseVehicle),
            "prefer-year-make-model" => Ok(Self::PreferYearMakeModel),
            "keep-all" => Ok(Self::KeepAll),
            other => Err(format!("unknown vehicle reference rule `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct NormalizeOptions {
    pub vehicle_reference_rule: VehicleReferenceRule,
}

/// Non-fatal findings attached to a normalised application.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum RecordIssue {
    MissingPartNumber,
    MissingPartType,
    NoVehicleReference,
    UncoercibleValue { name: String, value: String },
}

impl RecordIssue {
    /// Issues that make the record invalid under the record policy.
    #[must_use]
    pub fn is_missing_required(&self) -> bool {
        matches!(self, Self::MissingPartNumber | Self::MissingPartType)
    }
}

impl Display for RecordIssue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingPartNumber => write!(f, "missing part_number"),
            Self::MissingPartType => write!(f, "missing part_type_id"),
            Self::NoVehicleReference => write!(f, "no vehicle reference"),
            Self::UncoercibleValue { name, value } => {
                write!(f, "value `{value}` of {name} kept as raw attribute")
            }
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum NormalizeError {
    #[error("app {app_id}: duplicate <{element}> sets {column} twice")]
    DuplicateScalar { app_id: i64, element: String, column: &'static str },
}

/// Everything one application contributes to the store.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RowSet {
    pub application: ApplicationRow,
    pub fitment: VehicleFitmentRow,
    pub qualifiers: Vec<QualifierRow>,
    pub vehicle_types: Vec<VehicleTypeRow>,
    pub raw_attributes: Vec<RawAttributeRow>,
    pub issues: Vec<RecordIssue>,
}

impl RowSet {
    #[must_use]
    pub fn missing_required(&self) -> bool {
        self.issues.iter().any(RecordIssue::is_missing_required)
    }
}

/// Normalise one application.
///
/// # Errors
/// Returns [`NormalizeError::DuplicateScalar`] when two children set the same column.
pub fn normalize_app(
    record: &AppRecord,
    source_file: &Arc<str>,
    options: &NormalizeOptions,
) -> Result<RowSet, NormalizeError> {
    let mut builder = RowBuilder::new(source_file, record.app_id);
    builder.apply_app_attributes(&record.node)?;

    let kept_group = resolve_vehicle_group(&record.node, options.vehicle_reference_rule);
    for child in record.node.children() {
        if let Some(kind) = list_element(&child.name) {
            match kind {
                ListElement::Qualifier => builder.apply_qualifier(child),
                ListElement::VehicleType => builder.apply_vehicle_type(child),
                ListElement::Note => builder.apply_note(child),
            }
            continue;
        }

        let mappings = scalar_mappings(&child.name).collect::<Vec<_>>();
        if mappings.is_empty() {
            builder.capture_element(child, child.name.clone());
            continue;
        }
        if let (Some(group), Some(kept)) = (vehicle_group(&child.name), kept_group) {
            if group != kept {
                tracing::debug!(
                    app_id = record.app_id,
                    element = %child.name,
                    "vehicle reference outside the kept group captured raw"
                );
                builder.capture_element(child, child.name.clone());
                continue;
            }
        }
        builder.apply_scalar(child, &mappings)?;
    }

    Ok(builder.finish())
}

fn resolve_vehicle_group(node: &XmlNode, rule: VehicleReferenceRule) -> Option<VehicleGroup> {
    let mut present = node.children().filter_map(|child| vehicle_group(&child.name));
    match rule {
        VehicleReferenceRule::KeepAll => None,
        VehicleReferenceRule::FirstClaimWins => present.next(),
        VehicleReferenceRule::PreferBaseVehicle => {
            prefer(present.collect(), VehicleGroup::BaseVehicle)
        }
        VehicleReferenceRule::PreferYearMakeModel => {
            prefer(present.collect(), VehicleGroup::YearMakeModel)
        }
    }
}

fn prefer(present: Vec<VehicleGroup>, preferred: VehicleGroup) -> Option<VehicleGroup> {
    if present.contains(&preferred) {
        Some(preferred)
    } else {
        present.first().copied()
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

fn next_index(counter: &mut u32) -> u32 {
    let index = *counter;
    *counter = counter.saturating_add(1);
    index
}

struct RowBuilder<'a> {
    source_file: &'a Arc<str>,
    app_id: i64,
    application: ApplicationRow,
    fitment: VehicleFitmentRow,
    qualifiers: Vec<QualifierRow>,
    vehicle_types: Vec<VehicleTypeRow>,
    raw_attributes: Vec<RawAttributeRow>,
    raw_counters: BTreeMap<String, u32>,
    qualifier_counter: u32,
    vehicle_type_counter: u32,
    issues: Vec<RecordIssue>,
}

impl<'a> RowBuilder<'a> {
    fn new(source_file: &'a Arc<str>, app_id: i64) -> Self {
        Self {
            source_file,
            app_id,
            application: ApplicationRow::new(Arc::clone(source_file), app_id),
            fitment: VehicleFitmentRow::new(Arc::clone(source_file), app_id),
            qualifiers: Vec::new(),
            vehicle_types: Vec::new(),
            raw_attributes: Vec::new(),
            raw_counters: BTreeMap::new(),
            qualifier_counter: 0,
            vehicle_type_counter: 0,
            issues: Vec::new(),
        }
    }

    fn push_raw(
        &mut self,
        attr_kind: RawKind,
        attr_name: String,
        attr_id: Option<String>,
        attr_value: Option<String>,
    ) {
        let idx = next_index(self.raw_counters.entry(attr_name.clone()).or_default());
        self.raw_attributes.push(RawAttributeRow {
            source_file: Arc::clone(self.source_file),
            app_id: self.app_id,
            idx,
            attr_kind,
            attr_name,
            attr_id,
            attr_value,
        });
    }

    fn uncoercible(&mut self, attr_kind: RawKind, name: String, value: String) {
        tracing::warn!(app_id = self.app_id, name = %name, value = %value, "value does not fit its column");
        self.issues.push(RecordIssue::UncoercibleValue { name: name.clone(), value: value.clone() });
        self.push_raw(attr_kind, name, None, Some(value));
    }

    /// Capture an element the schema map does not claim: one row for the element itself,
    /// one per attribute other than `id`, and the same recursively for child elements.
    fn capture_element(&mut self, node: &XmlNode, path: String) {
        let attr_id = node.attribute("id").map(str::to_string);
        self.push_raw(RawKind::Element, path.clone(), attr_id, non_empty(node.text()));
        for (key, value) in &node.attributes {
            if key != "id" {
                self.push_raw(RawKind::Attribute, format!("{path}@{key}"), None, Some(value.clone()));
            }
        }
        for child in node.children() {
            self.capture_element(child, format!("{path}/{}", child.name));
        }
    }

    fn capture_attributes(&mut self, node: &XmlNode, path: &str, claimed: &[&str]) {
        for (key, value) in &node.attributes {
            if !claimed.contains(&key.as_str()) {
                self.push_raw(RawKind::Attribute, format!("{path}@{key}"), None, Some(value.clone()));
            }
        }
    }

    /// Capture what a claimed element carries beyond the claimed attributes and text.
    fn capture_leftovers(&mut self, node: &XmlNode, path: &str, claimed: &[&str], text_claimed: bool) {
        self.capture_attributes(node, path, claimed);
        if !text_claimed {
            if let Some(text) = non_empty(node.text()) {
                self.push_raw(RawKind::Element, path.to_string(), None, Some(text));
            }
        }
        for child in node.children() {
            self.capture_element(child, format!("{path}/{}", child.name));
        }
    }

    fn apply_app_attributes(&mut self, node: &XmlNode) -> Result<(), NormalizeError> {
        for (name, raw) in &node.attributes {
            let Some(mapping) = app_attribute(name) else {
                self.push_raw(RawKind::Attribute, name.clone(), None, Some(raw.clone()));
                continue;
            };
            if mapping.column == "app_id" {
                continue;
            }
            let value = match coerce(mapping.kind, raw) {
                Ok(value) => value,
                Err(_) => {
                    self.uncoercible(RawKind::Attribute, name.clone(), raw.clone());
                    continue;
                }
            };
            match self.application.assign(mapping.column, value) {
                Ok(()) => {}
                Err(AssignError::AlreadySet) => {
                    return Err(NormalizeError::DuplicateScalar {
                        app_id: self.app_id,
                        element: name.clone(),
                        column: mapping.column,
                    })
                }
                Err(AssignError::Invalid | AssignError::UnknownColumn) => {
                    self.uncoercible(RawKind::Attribute, name.clone(), raw.clone());
                }
            }
        }
        Ok(())
    }

    fn apply_scalar(&mut self, node: &XmlNode, mappings: &[&'static FieldMapping]) -> Result<(), NormalizeError> {
        let mut claimed_attributes = Vec::new();
        let mut text_claimed = false;
        let mut found_value = false;

        for mapping in mappings {
            let (raw, raw_kind, raw_name) = match mapping.source {
                ValueSource::Text => {
                    text_claimed = true;
                    (non_empty(node.text()), RawKind::Element, node.name.clone())
                }
                ValueSource::Attribute(attribute) => {
                    claimed_attributes.push(attribute);
                    (
                        node.attribute(attribute).map(str::to_string).and_then(non_empty),
                        RawKind::Attribute,
                        format!("{}@{attribute}", node.name),
                    )
                }
            };
            let Some(raw) = raw else { continue };
            found_value = true;

            let Ok(value) = coerce(mapping.kind, &raw) else {
                self.uncoercible(raw_kind, raw_name, raw);
                continue;
            };
            let assigned = match mapping.entity {
                Entity::Application => self.application.assign(mapping.column, value),
                Entity::VehicleFitment => self.fitment.assign(mapping.column, value),
                Entity::Qualifier | Entity::VehicleType | Entity::RawAttribute => {
                    Err(AssignError::UnknownColumn)
                }
            };
            match assigned {
                Ok(()) => {}
                Err(AssignError::AlreadySet) => {
                    return Err(NormalizeError::DuplicateScalar {
                        app_id: self.app_id,
                        element: node.name.clone(),
                        column: mapping.column,
                    })
                }
                Err(AssignError::Invalid | AssignError::UnknownColumn) => {
                    self.uncoercible(raw_kind, raw_name, raw);
                }
            }
        }

        if found_value {
            self.capture_leftovers(node, &node.name, &claimed_attributes, text_claimed);
        } else {
            self.capture_element(node, node.name.clone());
        }
        Ok(())
    }

    fn apply_note(&mut self, node: &XmlNode) {
        let attr_id = node.attribute("id").map(str::to_string);
        self.push_raw(RawKind::Element, NOTE_ATTR_NAME.to_string(), attr_id, non_empty(node.text()));
        self.capture_leftovers(node, &node.name, &["id"], true);
    }

    fn apply_vehicle_type(&mut self, node: &XmlNode) {
        let Some(raw) = node.attribute("id").map(str::to_string).and_then(non_empty) else {
            self.capture_element(node, node.name.clone());
            return;
        };
        match coerce(ValueKind::Integer, &raw).ok().as_ref().and_then(Value::as_integer) {
            Some(vehicle_type_id) => {
                let idx = next_index(&mut self.vehicle_type_counter);
                self.vehicle_types.push(VehicleTypeRow {
                    source_file: Arc::clone(self.source_file),
                    app_id: self.app_id,
                    idx,
                    vehicle_type_id,
                });
            }
            None => self.uncoercible(RawKind::Attribute, format!("{}@id", node.name), raw),
        }
        self.capture_leftovers(node, &node.name, &["id"], false);
    }

    fn apply_qualifier(&mut self, node: &XmlNode) {
        let path = node.name.as_str();
        let mut qual_id = None;
        let mut qual_text = None;
        let mut params: Vec<Option<String>> = Vec::new();

        if let Some(raw) = node.attribute("id").map(str::to_string).and_then(non_empty) {
            match coerce(ValueKind::Integer, &raw).ok().as_ref().and_then(Value::as_integer) {
                Some(id) => qual_id = Some(id),
                None => self.uncoercible(RawKind::Attribute, format!("{path}@id"), raw),
            }
        }

        for child in node.children() {
            let child_path = format!("{path}/{}", child.name);
            match child.name.as_str() {
                "text" if qual_text.is_none() => {
                    qual_text = Some(child.inner_markup());
                    self.capture_attributes(child, &child_path, &[]);
                }
                "param" if params.len() < QUALIFIER_PARAM_SLOTS => {
                    let (value, claimed): (Option<String>, &[&str]) = match non_empty(child.text()) {
                        Some(text) => (Some(text.trim().to_string()), &[]),
                        None => (child.attribute("value").map(str::to_string), &["value"]),
                    };
                    params.push(value);
                    self.capture_leftovers(child, &child_path, claimed, true);
                }
                _ => self.capture_element(child, child_path),
            }
        }
        self.capture_attributes(node, path, &["id"]);
        if let Some(text) = non_empty(node.text()) {
            self.push_raw(RawKind::Element, path.to_string(), None, Some(text));
        }

        let mut params = params.into_iter();
        let idx = next_index(&mut self.qualifier_counter);
        self.qualifiers.push(QualifierRow {
            source_file: Arc::clone(self.source_file),
            app_id: self.app_id,
            idx,
            qual_id,
            qual_text: qual_text.and_then(non_empty),
            param_1: params.next().flatten(),
            param_2: params.next().flatten(),
            param_3: params.next().flatten(),
        });
    }

    fn finish(mut self) -> RowSet {
        if !self.application.has_part_number() {
            self.issues.push(RecordIssue::MissingPartNumber);
        }
        if self.application.part_type_id.is_none() {
            self.issues.push(RecordIssue::MissingPartType);
        }
        if !self.fitment.has_vehicle_reference() {
            self.issues.push(RecordIssue::NoVehicleReference);
        }
        RowSet {
            application: self.application,
            fitment: self.fitment,
            qualifiers: self.qualifiers,
            vehicle_types: self.vehicle_types,
            raw_attributes: self.raw_attributes,
            issues: self.issues,
        }
    }
}
