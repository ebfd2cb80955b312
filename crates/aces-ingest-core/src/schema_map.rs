//! Declarative mapping from ACES `<App>` content to target tables and columns.
//!
//! This module is the single source of truth for what the ingester knows. Every name
//! that is not listed here is routed to the raw attribute table by the normaliser, and
//! the verifier's unmapped histogram is the signal for promoting names into this map.

use serde::{Deserialize, Serialize};

/// Target entity of a mapped value, also used to express flush order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Application,
    VehicleFitment,
    Qualifier,
    VehicleType,
    RawAttribute,
}

impl Entity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Application => "application",
            Self::VehicleFitment => "vehicle_fitment",
            Self::Qualifier => "qualifier",
            Self::VehicleType => "vehicle_type",
            Self::RawAttribute => "raw_attribute",
        }
    }
}

/// Parents before children: side tables reference applications by `(app_id, source_file)`.
pub const FLUSH_ORDER: [Entity; 5] = [
    Entity::Application,
    Entity::VehicleFitment,
    Entity::Qualifier,
    Entity::VehicleType,
    Entity::RawAttribute,
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Integer,
    Text,
    /// Calendar date, normalised to `YYYY-MM-DD`.
    Date,
}

/// Where a mapped value is read from on its element.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ValueSource {
    Text,
    Attribute(&'static str),
}

/// Mutually exclusive ways of naming the base vehicle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VehicleGroup {
    BaseVehicle,
    YearMakeModel,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FieldMapping {
    pub element: &'static str,
    pub source: ValueSource,
    pub entity: Entity,
    pub column: &'static str,
    pub kind: ValueKind,
    pub group: Option<VehicleGroup>,
}

impl FieldMapping {
    const fn app(element: &'static str, source: ValueSource, column: &'static str, kind: ValueKind) -> Self {
        Self { element, source, entity: Entity::Application, column, kind, group: None }
    }

    const fn fitment(element: &'static str, column: &'static str) -> Self {
        Self {
            element,
            source: ValueSource::Attribute("id"),
            entity: Entity::VehicleFitment,
            column,
            kind: ValueKind::Integer,
            group: None,
        }
    }

    const fn grouped(
        element: &'static str,
        source: ValueSource,
        column: &'static str,
        group: VehicleGroup,
    ) -> Self {
        Self {
            element,
            source,
            entity: Entity::VehicleFitment,
            column,
            kind: ValueKind::Integer,
            group: Some(group),
        }
    }
}

/// Attributes of `<App>` itself that land on the application row.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AppAttributeMapping {
    pub name: &'static str,
    pub column: &'static str,
    pub kind: ValueKind,
}

/// `id` is consumed by the parser as the record key; it is listed so it is never captured raw.
pub static APP_ATTRIBUTES: &[AppAttributeMapping] = &[
    AppAttributeMapping { name: "id", column: "app_id", kind: ValueKind::Integer },
    AppAttributeMapping { name: "action", column: "action", kind: ValueKind::Text },
    AppAttributeMapping { name: "validate", column: "validate", kind: ValueKind::Text },
];

pub static SCALAR_FIELDS: &[FieldMapping] = &[
    FieldMapping::app("Qty", ValueSource::Text, "quantity", ValueKind::Integer),
    FieldMapping::app("PartType", ValueSource::Attribute("id"), "part_type_id", ValueKind::Integer),
    FieldMapping::app("Position", ValueSource::Attribute("id"), "position_id", ValueKind::Integer),
    FieldMapping::app("MfrLabel", ValueSource::Text, "mfr_label", ValueKind::Text),
    FieldMapping::app("Part", ValueSource::Text, "part_number", ValueKind::Text),
    FieldMapping::app("Part", ValueSource::Attribute("BrandAAIAID"), "brand_aaiaid", ValueKind::Text),
    FieldMapping::app(
        "Part",
        ValueSource::Attribute("SubBrandAAIAID"),
        "subbrand_aaiaid",
        ValueKind::Text,
    ),
    FieldMapping::app("DisplayOrder", ValueSource::Text, "display_order", ValueKind::Integer),
    FieldMapping::app("AssetName", ValueSource::Text, "asset_name", ValueKind::Text),
    FieldMapping::app("AssetItemOrder", ValueSource::Text, "asset_item_order", ValueKind::Integer),
    FieldMapping::app("AssetItemRef", ValueSource::Text, "asset_item_ref", ValueKind::Text),
    FieldMapping::grouped(
        "BaseVehicle",
        ValueSource::Attribute("id"),
        "base_vehicle_id",
        VehicleGroup::BaseVehicle,
    ),
    FieldMapping::grouped(
        "Years",
        ValueSource::Attribute("from"),
        "year_from",
        VehicleGroup::YearMakeModel,
    ),
    FieldMapping::grouped("Years", ValueSource::Attribute("to"), "year_to", VehicleGroup::YearMakeModel),
    FieldMapping::grouped("Make", ValueSource::Attribute("id"), "make_id", VehicleGroup::YearMakeModel),
    FieldMapping::grouped("Model", ValueSource::Attribute("id"), "model_id", VehicleGroup::YearMakeModel),
    FieldMapping::fitment("SubModel", "submodel_id"),
    FieldMapping::fitment("EngineBase", "engine_base_id"),
    FieldMapping::fitment("EngineBlock", "engine_block_id"),
    FieldMapping::fitment("EngineConfig", "engine_config_id"),
    FieldMapping::fitment("EngineDesignation", "engine_designation_id"),
    FieldMapping::fitment("EngineVIN", "engine_vin_id"),
    FieldMapping::fitment("EngineVersion", "engine_version_id"),
    FieldMapping::fitment("EngineMfr", "engine_mfr_id"),
    FieldMapping::fitment("FuelType", "fuel_type_id"),
    FieldMapping::fitment("FuelDeliveryType", "fuel_delivery_type_id"),
    FieldMapping::fitment("FuelDeliverySubType", "fuel_delivery_subtype_id"),
    FieldMapping::fitment("FuelSystemControlType", "fuel_system_control_type_id"),
    FieldMapping::fitment("FuelSystemDesign", "fuel_system_design_id"),
    FieldMapping::fitment("Aspiration", "aspiration_id"),
    FieldMapping::fitment("CylinderHeadType", "cylinder_head_type_id"),
    FieldMapping::fitment("IgnitionSystemType", "ignition_system_type_id"),
    FieldMapping::fitment("PowerOutput", "power_output_id"),
    FieldMapping::fitment("BodyType", "body_type_id"),
    FieldMapping::fitment("BodyNumDoors", "body_num_doors_id"),
    FieldMapping::fitment("DriveType", "drive_type_id"),
    FieldMapping::fitment("MfrBodyCode", "mfr_body_code_id"),
    FieldMapping::fitment("WheelBase", "wheel_base_id"),
    FieldMapping::fitment("BedLength", "bed_length_id"),
    FieldMapping::fitment("BedType", "bed_type_id"),
    FieldMapping::fitment("BrakeABS", "brake_abs_id"),
    FieldMapping::fitment("BrakeSystem", "brake_system_id"),
    FieldMapping::fitment("FrontBrakeType", "front_brake_type_id"),
    FieldMapping::fitment("RearBrakeType", "rear_brake_type_id"),
    FieldMapping::fitment("FrontSpringType", "front_spring_type_id"),
    FieldMapping::fitment("RearSpringType", "rear_spring_type_id"),
    FieldMapping::fitment("SteeringSystem", "steering_system_id"),
    FieldMapping::fitment("SteeringType", "steering_type_id"),
    FieldMapping::fitment("Transmission", "transmission_id"),
    FieldMapping::fitment("TransmissionBase", "transmission_base_id"),
    FieldMapping::fitment("TransmissionType", "transmission_type_id"),
    FieldMapping::fitment("TransmissionControlType", "transmission_control_type_id"),
    FieldMapping::fitment("TransmissionNumSpeeds", "transmission_num_speeds_id"),
    FieldMapping::fitment("TransElecControlled", "trans_elec_controlled_id"),
    FieldMapping::fitment("TransmissionMfrCode", "transmission_mfr_code_id"),
    FieldMapping::fitment("TransmissionMfr", "transmission_mfr_id"),
    FieldMapping::fitment("Region", "region_id"),
];

/// Column order of the vehicle fitment table. The store builds its insert from this list.
pub static FITMENT_COLUMNS: &[&str] = &[
    "base_vehicle_id",
    "year_from",
    "year_to",
    "make_id",
    "model_id",
    "submodel_id",
    "engine_base_id",
    "engine_block_id",
    "engine_config_id",
    "engine_designation_id",
    "engine_vin_id",
    "engine_version_id",
    "engine_mfr_id",
    "fuel_type_id",
    "fuel_delivery_type_id",
    "fuel_delivery_subtype_id",
    "fuel_system_control_type_id",
    "fuel_system_design_id",
    "aspiration_id",
    "cylinder_head_type_id",
    "ignition_system_type_id",
    "power_output_id",
    "body_type_id",
    "body_num_doors_id",
    "drive_type_id",
    "mfr_body_code_id",
    "wheel_base_id",
    "bed_length_id",
    "bed_type_id",
    "brake_abs_id",
    "brake_system_id",
    "front_brake_type_id",
    "rear_brake_type_id",
    "front_spring_type_id",
    "rear_spring_type_id",
    "steering_system_id",
    "steering_type_id",
    "transmission_id",
    "transmission_base_id",
    "transmission_type_id",
    "transmission_control_type_id",
    "transmission_num_speeds_id",
    "trans_elec_controlled_id",
    "transmission_mfr_code_id",
    "transmission_mfr_id",
    "region_id",
];

/// Repeatable children of `<App>` with their own row shape.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ListElement {
    Qualifier,
    VehicleType,
    Note,
}

pub static LIST_ELEMENTS: &[(&str, ListElement)] = &[
    ("Qualifier", ListElement::Qualifier),
    ("VehicleType", ListElement::VehicleType),
    ("Note", ListElement::Note),
];

/// `attr_name` under which notes land in the raw attribute table.
pub const NOTE_ATTR_NAME: &str = "note";

/// Positional qualifier parameters kept on the qualifier row; the rest land raw.
pub const QUALIFIER_PARAM_SLOTS: usize = 3;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct HeaderField {
    pub element: &'static str,
    pub key: &'static str,
    pub kind: ValueKind,
}

pub static HEADER_FIELDS: &[HeaderField] = &[
    HeaderField { element: "Company", key: "company", kind: ValueKind::Text },
    HeaderField { element: "SenderName", key: "sender_name", kind: ValueKind::Text },
    HeaderField { element: "SenderPhone", key: "sender_phone", kind: ValueKind::Text },
    HeaderField { element: "TransferDate", key: "transfer_date", kind: ValueKind::Date },
    HeaderField { element: "MfrCode", key: "mfr_code", kind: ValueKind::Text },
    HeaderField { element: "BrandAAIAID", key: "brand_aaiaid", kind: ValueKind::Text },
    HeaderField { element: "DocumentTitle", key: "document_title", kind: ValueKind::Text },
    HeaderField { element: "DocFormNumber", key: "doc_form_number", kind: ValueKind::Text },
    HeaderField { element: "EffectiveDate", key: "effective_date", kind: ValueKind::Date },
    HeaderField { element: "ApprovedFor", key: "approved_for", kind: ValueKind::Text },
    HeaderField { element: "SubmissionType", key: "submission_type", kind: ValueKind::Text },
    HeaderField { element: "MapperCompany", key: "mapper_company", kind: ValueKind::Text },
    HeaderField { element: "VcdbVersionDate", key: "vcdb_version_date", kind: ValueKind::Date },
    HeaderField { element: "QdbVersionDate", key: "qdb_version_date", kind: ValueKind::Date },
    HeaderField { element: "PcdbVersionDate", key: "pcdb_version_date", kind: ValueKind::Date },
];

pub fn scalar_mappings(element: &str) -> impl Iterator<Item = &'static FieldMapping> + '_ {
    SCALAR_FIELDS.iter().filter(move |mapping| mapping.element == element)
}

#[must_use]
pub fn list_element(name: &str) -> Option<ListElement> {
    LIST_ELEMENTS.iter().find(|(element, _)| *element == name).map(|(_, kind)| *kind)
}

#[must_use]
pub fn app_attribute(name: &str) -> Option<&'static AppAttributeMapping> {
    APP_ATTRIBUTES.iter().find(|mapping| mapping.name == name)
}

#[must_use]
pub fn header_field(element: &str) -> Option<&'static HeaderField> {
    HEADER_FIELDS.iter().find(|field| field.element == element)
}

/// Vehicle reference group an element belongs to, if any.
#[must_use]
pub fn vehicle_group(element: &str) -> Option<VehicleGroup> {
    scalar_mappings(element).find_map(|mapping| mapping.group)
}

/// True when the schema map claims `name` as a child of `<App>`.
#[must_use]
pub fn is_recognised(name: &str) -> bool {
    list_element(name).is_some() || scalar_mappings(name).next().is_some()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[test]
    fn fitment_columns_match_mapped_fitment_fields() {
        let mapped = SCALAR_FIELDS
            .iter()
            .filter(|mapping| mapping.entity == Entity::VehicleFitment)
            .map(|mapping| mapping.column)
            .collect::<BTreeSet<_>>();
        let declared = FITMENT_COLUMNS.iter().copied().collect::<BTreeSet<_>>();

        assert_eq!(mapped, declared);
        assert_eq!(declared.len(), FITMENT_COLUMNS.len(), "fitment columns must be unique");
    }

    #[test]
    fn every_column_is_claimed_by_exactly_one_mapping() {
        let mut seen = BTreeSet::new();
        for mapping in SCALAR_FIELDS {
            assert!(
                seen.insert((mapping.entity, mapping.column)),
                "column {} mapped twice",
                mapping.column
            );
        }
    }

    #[test]
    fn list_and_scalar_names_do_not_overlap() {
        for (name, _) in LIST_ELEMENTS {
            assert!(scalar_mappings(name).next().is_none(), "{name} is both list and scalar");
        }
    }

    #[test]
    fn part_element_carries_number_and_brand_mappings() {
        let columns = scalar_mappings("Part").map(|mapping| mapping.column).collect::<Vec<_>>();
        assert_eq!(columns, vec!["part_number", "brand_aaiaid", "subbrand_aaiaid"]);
    }

    #[test]
    fn vehicle_groups_cover_base_vehicle_and_year_make_model() {
        assert_eq!(vehicle_group("BaseVehicle"), Some(VehicleGroup::BaseVehicle));
        for element in ["Years", "Make", "Model"] {
            assert_eq!(vehicle_group(element), Some(VehicleGroup::YearMakeModel));
        }
        assert_eq!(vehicle_group("SubModel"), None);
        assert_eq!(vehicle_group("VendorNote"), None);
    }

    #[test]
    fn recognised_names() {
        assert!(is_recognised("Qualifier"));
        assert!(is_recognised("Note"));
        assert!(is_recognised("EngineBase"));
        assert!(!is_recognised("VendorNote"));
        assert!(!is_recognised("note"));
    }

    #[test]
    fn flush_order_starts_with_parents() {
        assert_eq!(FLUSH_ORDER[0], Entity::Application);
        assert_eq!(FLUSH_ORDER[1], Entity::VehicleFitment);
        assert_eq!(FLUSH_ORDER[4], Entity::RawAttribute);
    }
}
