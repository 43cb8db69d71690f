use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// FHIR resource types served over the OMOP schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    Patient,
    Practitioner,
    Encounter,
    Condition,
    Observation,
    MedicationRequest,
    Medication,
}

impl ResourceType {
    /// All supported types, in registry order.
    pub const ALL: [ResourceType; 7] = [
        ResourceType::Patient,
        ResourceType::Practitioner,
        ResourceType::Encounter,
        ResourceType::Condition,
        ResourceType::Observation,
        ResourceType::MedicationRequest,
        ResourceType::Medication,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Patient => "Patient",
            ResourceType::Practitioner => "Practitioner",
            ResourceType::Encounter => "Encounter",
            ResourceType::Condition => "Condition",
            ResourceType::Observation => "Observation",
            ResourceType::MedicationRequest => "MedicationRequest",
            ResourceType::Medication => "Medication",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Patient" => Ok(ResourceType::Patient),
            "Practitioner" => Ok(ResourceType::Practitioner),
            "Encounter" => Ok(ResourceType::Encounter),
            "Condition" => Ok(ResourceType::Condition),
            "Observation" => Ok(ResourceType::Observation),
            "MedicationRequest" => Ok(ResourceType::MedicationRequest),
            "Medication" => Ok(ResourceType::Medication),
            _ => Err(CoreError::invalid_resource_type(s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_type_roundtrip() {
        for rt in ResourceType::ALL {
            assert_eq!(rt.to_string().parse::<ResourceType>().unwrap(), rt);
        }
    }

    #[test]
    fn test_unknown_resource_type() {
        let err = "Specimen".parse::<ResourceType>().unwrap_err();
        assert!(matches!(err, CoreError::InvalidResourceType(name) if name == "Specimen"));
    }
}
