//! Identifier mapping between FHIR resource ids and OMOP row keys.
//!
//! Every FHIR resource type is bound to one primary OMOP table and, for
//! split types such as Observation, an optional secondary table. External
//! ids are derived from `(table, native key)` alone, so no lookup table is
//! persisted and both directions are pure functions.
//!
//! # Encoding
//!
//! - primary table rows: `external = key` (keys must be non-negative)
//! - secondary table rows: `external = !key` (the one's complement, `-key - 1`)
//!
//! The one's complement maps `0, 1, 2, ..` onto `-1, -2, -3, ..`, so a
//! secondary key can never produce the same external id as a primary key,
//! including native key `0`.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::fhir::ResourceType;
use crate::omop::OmopTable;

/// Externally visible identity of a FHIR resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalId {
    pub resource_type: ResourceType,
    pub id: i64,
}

impl ExternalId {
    pub fn new(resource_type: ResourceType, id: i64) -> Self {
        Self { resource_type, id }
    }

    /// Relative reference string, e.g. `Patient/12`.
    pub fn to_reference(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)
    }
}

/// Storage identity of an OMOP row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InternalId {
    pub table: OmopTable,
    pub key: i64,
}

impl InternalId {
    pub fn new(table: OmopTable, key: i64) -> Self {
        Self { table, key }
    }
}

impl fmt::Display for InternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.table, self.key)
    }
}

/// Which slot of a binding a table occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableSlot {
    Primary,
    Secondary,
}

/// Tables backing one resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableBinding {
    pub primary: OmopTable,
    pub secondary: Option<OmopTable>,
}

impl TableBinding {
    pub const fn single(table: OmopTable) -> Self {
        Self {
            primary: table,
            secondary: None,
        }
    }

    pub const fn split(primary: OmopTable, secondary: OmopTable) -> Self {
        Self {
            primary,
            secondary: Some(secondary),
        }
    }

    /// Tables in search order: primary first.
    pub fn tables(&self) -> impl Iterator<Item = OmopTable> + '_ {
        std::iter::once(self.primary).chain(self.secondary)
    }

    pub fn slot_of(&self, table: OmopTable) -> Option<TableSlot> {
        if table == self.primary {
            Some(TableSlot::Primary)
        } else if self.secondary == Some(table) {
            Some(TableSlot::Secondary)
        } else {
            None
        }
    }
}

/// External id for a primary-table row.
#[inline]
pub const fn encode_primary(key: i64) -> i64 {
    key
}

/// External id for a secondary-table row.
#[inline]
pub const fn encode_secondary(key: i64) -> i64 {
    !key
}

/// Splits an external id into its slot and native key.
#[inline]
pub const fn decode(external: i64) -> (TableSlot, i64) {
    if external >= 0 {
        (TableSlot::Primary, external)
    } else {
        (TableSlot::Secondary, !external)
    }
}

/// Translates ids in both directions using a static binding table.
#[derive(Debug, Clone)]
pub struct IdMapper {
    bindings: HashMap<ResourceType, TableBinding>,
}

impl Default for IdMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl IdMapper {
    /// Mapper with the standard OMOP bindings.
    pub fn new() -> Self {
        let bindings = HashMap::from([
            (ResourceType::Patient, TableBinding::single(OmopTable::Person)),
            (ResourceType::Practitioner, TableBinding::single(OmopTable::Provider)),
            (ResourceType::Encounter, TableBinding::single(OmopTable::VisitOccurrence)),
            (
                ResourceType::Condition,
                TableBinding::single(OmopTable::ConditionOccurrence),
            ),
            (
                ResourceType::Observation,
                TableBinding::split(OmopTable::Measurement, OmopTable::Observation),
            ),
            (
                ResourceType::MedicationRequest,
                TableBinding::single(OmopTable::DrugExposure),
            ),
            (ResourceType::Medication, TableBinding::single(OmopTable::DrugExposure)),
        ]);
        Self { bindings }
    }

    pub fn binding(&self, resource_type: ResourceType) -> Option<TableBinding> {
        self.bindings.get(&resource_type).copied()
    }

    /// Resolves an external id to the row that owns it.
    ///
    /// Returns `None` when the id does not belong to `resource_type` or
    /// cannot be produced by any row of its bound tables.
    pub fn to_internal(
        &self,
        external: &ExternalId,
        resource_type: ResourceType,
    ) -> Option<InternalId> {
        if external.resource_type != resource_type {
            return None;
        }
        let binding = self.binding(resource_type)?;
        match decode(external.id) {
            (TableSlot::Primary, key) => Some(InternalId::new(binding.primary, key)),
            (TableSlot::Secondary, key) => binding
                .secondary
                .map(|table| InternalId::new(table, key)),
        }
    }

    /// Produces the external id of a row.
    ///
    /// Returns `None` if `internal.table` is not bound to `resource_type` or
    /// a primary key is negative.
    pub fn to_external(
        &self,
        internal: &InternalId,
        resource_type: ResourceType,
    ) -> Option<ExternalId> {
        let binding = self.binding(resource_type)?;
        let id = match binding.slot_of(internal.table)? {
            TableSlot::Primary if internal.key < 0 => return None,
            TableSlot::Primary => encode_primary(internal.key),
            TableSlot::Secondary if internal.key < 0 => return None,
            TableSlot::Secondary => encode_secondary(internal.key),
        };
        Some(ExternalId::new(resource_type, id))
    }

    /// Parses the textual id of a resource and resolves it.
    pub fn parse_and_resolve(&self, resource_type: ResourceType, raw: &str) -> Option<InternalId> {
        let external = parse_external(resource_type, raw)?;
        self.to_internal(&external, resource_type)
    }
}

/// Parses a decimal resource id. Anything else is not an id this bridge issued.
pub fn parse_external(resource_type: ResourceType, raw: &str) -> Option<ExternalId> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with('+') {
        return None;
    }
    raw.parse::<i64>()
        .ok()
        .map(|id| ExternalId::new(resource_type, id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_functions() {
        assert_eq!(encode_primary(0), 0);
        assert_eq!(encode_primary(42), 42);
        assert_eq!(encode_secondary(0), -1);
        assert_eq!(encode_secondary(42), -43);
        assert_eq!(decode(42), (TableSlot::Primary, 42));
        assert_eq!(decode(-43), (TableSlot::Secondary, 42));
        assert_eq!(decode(-1), (TableSlot::Secondary, 0));
    }

    #[test]
    fn test_bijection_for_all_bound_tables() {
        let mapper = IdMapper::new();
        let keys = [0_i64, 1, 2, 17, 9_999, i64::MAX];
        for rt in ResourceType::ALL {
            let binding = mapper.binding(rt).unwrap();
            for table in binding.tables() {
                for key in keys {
                    let internal = InternalId::new(table, key);
                    let external = mapper.to_external(&internal, rt).unwrap();
                    let back = mapper.to_internal(&external, rt).unwrap();
                    assert_eq!(back, internal, "{rt} {table} {key}");
                    let again = mapper.to_external(&back, rt).unwrap();
                    assert_eq!(again, external);
                }
            }
        }
    }

    #[test]
    fn test_dual_table_disambiguation() {
        let mapper = IdMapper::new();
        for key in [0_i64, 1, 500] {
            let measurement = mapper
                .to_external(&InternalId::new(OmopTable::Measurement, key), ResourceType::Observation)
                .unwrap();
            let observation = mapper
                .to_external(&InternalId::new(OmopTable::Observation, key), ResourceType::Observation)
                .unwrap();
            assert_ne!(measurement, observation);
            assert!(measurement.id >= 0);
            assert!(observation.id < 0);
        }
    }

    #[test]
    fn test_to_internal_not_found_cases() {
        let mapper = IdMapper::new();

        // negative id on a single-table type
        let ext = ExternalId::new(ResourceType::Condition, -5);
        assert_eq!(mapper.to_internal(&ext, ResourceType::Condition), None);

        // type mismatch
        let ext = ExternalId::new(ResourceType::Patient, 5);
        assert_eq!(mapper.to_internal(&ext, ResourceType::Condition), None);

        // unparsable ids
        assert_eq!(mapper.parse_and_resolve(ResourceType::Patient, "abc"), None);
        assert_eq!(mapper.parse_and_resolve(ResourceType::Patient, ""), None);
        assert_eq!(mapper.parse_and_resolve(ResourceType::Patient, "+4"), None);
        assert_eq!(mapper.parse_and_resolve(ResourceType::Patient, "1.5"), None);
    }

    #[test]
    fn test_to_external_rejects_unbound_table() {
        let mapper = IdMapper::new();
        let internal = InternalId::new(OmopTable::Person, 3);
        assert_eq!(mapper.to_external(&internal, ResourceType::Observation), None);
        let internal = InternalId::new(OmopTable::Person, -3);
        assert_eq!(mapper.to_external(&internal, ResourceType::Patient), None);
    }

    #[test]
    fn test_shared_row_binding() {
        let mapper = IdMapper::new();
        let row = InternalId::new(OmopTable::DrugExposure, 8);
        let request = mapper.to_external(&row, ResourceType::MedicationRequest).unwrap();
        let medication = mapper.to_external(&row, ResourceType::Medication).unwrap();
        assert_eq!(request.id, medication.id);
        assert_eq!(medication.to_reference(), "Medication/8");
    }
}
