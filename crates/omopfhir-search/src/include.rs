//! `_include` and `_revinclude` parameters.
//!
//! - `_include=Condition:subject` adds the resources the matches point to.
//! - `_revinclude=Condition:subject` adds the resources pointing at the matches.
//!
//! Values use `SourceType:param[:TargetType]`. Wildcards and `:iterate` are
//! rejected.

use omopfhir_core::ResourceType;

/// A parsed `_include` or `_revinclude` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeParam {
    /// Type carrying the reference parameter.
    pub source_type: ResourceType,
    /// Reference search parameter on `source_type`.
    pub search_param: String,
    /// Optional restriction on the referenced type.
    pub target_type: Option<ResourceType>,
    pub reverse: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IncludeError {
    #[error("Invalid include parameter: {0}")]
    InvalidInclude(String),

    #[error("Unsupported include form: {0}")]
    Unsupported(String),
}

/// Parses one `_include` (`reverse == false`) or `_revinclude` value.
pub fn parse_include(value: &str, reverse: bool) -> Result<IncludeParam, IncludeError> {
    if value == "*" || value.ends_with(":*") {
        return Err(IncludeError::Unsupported(value.to_string()));
    }

    let parts: Vec<&str> = value.split(':').collect();
    let (source, search_param, target) = match parts.as_slice() {
        [source, param] => (*source, *param, None),
        [source, param, target] => (*source, *param, Some(*target)),
        _ => {
            return Err(IncludeError::InvalidInclude(format!(
                "'{value}' does not match Type:searchParam[:TargetType]"
            )));
        }
    };
    if search_param.is_empty() {
        return Err(IncludeError::InvalidInclude(format!("'{value}' names no parameter")));
    }

    let source_type = source
        .parse::<ResourceType>()
        .map_err(|_| IncludeError::InvalidInclude(format!("unknown source type '{source}'")))?;
    let target_type = target
        .map(|t| {
            t.parse::<ResourceType>()
                .map_err(|_| IncludeError::InvalidInclude(format!("unknown target type '{t}'")))
        })
        .transpose()?;

    Ok(IncludeParam {
        source_type,
        search_param: search_param.to_string(),
        target_type,
        reverse,
    })
}

/// Checks a parameter key for the include family, rejecting `:iterate`.
pub fn include_kind(name: &str, modifier: Option<&str>) -> Result<Option<bool>, IncludeError> {
    let reverse = match name {
        "_include" => false,
        "_revinclude" => true,
        _ => return Ok(None),
    };
    match modifier {
        None => Ok(Some(reverse)),
        Some(m) => Err(IncludeError::Unsupported(format!("{name}:{m}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_include() {
        let inc = parse_include("Condition:subject", false).unwrap();
        assert_eq!(inc.source_type, ResourceType::Condition);
        assert_eq!(inc.search_param, "subject");
        assert_eq!(inc.target_type, None);
        assert!(!inc.reverse);

        let inc = parse_include("MedicationRequest:medication:Medication", false).unwrap();
        assert_eq!(inc.target_type, Some(ResourceType::Medication));
    }

    #[test]
    fn test_parse_revinclude() {
        let inc = parse_include("Observation:subject", true).unwrap();
        assert!(inc.reverse);
        assert_eq!(inc.source_type, ResourceType::Observation);
    }

    #[test]
    fn test_invalid_forms() {
        assert!(matches!(parse_include("*", false), Err(IncludeError::Unsupported(_))));
        assert!(parse_include("Condition", false).is_err());
        assert!(parse_include("Device:subject", false).is_err());
        assert!(parse_include("Condition:", false).is_err());
    }

    #[test]
    fn test_include_kind() {
        assert_eq!(include_kind("_include", None), Ok(Some(false)));
        assert_eq!(include_kind("_revinclude", None), Ok(Some(true)));
        assert_eq!(include_kind("code", None), Ok(None));
        assert!(include_kind("_include", Some("iterate")).is_err());
    }
}
