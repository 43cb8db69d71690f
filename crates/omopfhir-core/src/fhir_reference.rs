//! FHIR Reference parsing.
//!
//! References reach the bridge in several shapes:
//! - Relative: `Patient/123`
//! - Versioned: `Patient/123/_history/1`
//! - Absolute URL: `http://example.org/fhir/Patient/123`
//! - Contained: `#med1`
//! - URN: `urn:uuid:...` (bundle-local, rewritten before mapping)
//!
//! ```
//! use omopfhir_core::fhir_reference::parse_reference;
//!
//! let reference = parse_reference("Patient/123", None).unwrap();
//! assert_eq!(reference.resource_type, "Patient");
//! assert_eq!(reference.id, "123");
//! ```

use std::fmt;

use url::Url;

/// A successfully parsed local reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FhirReference {
    pub resource_type: String,
    pub id: String,
    pub version: Option<String>,
}

impl FhirReference {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            version: None,
        }
    }

    /// `Type/id`, dropping any version.
    pub fn to_relative(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }
}

impl fmt::Display for FhirReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_relative())
    }
}

/// A reference that cannot be resolved against local storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnresolvableReference {
    /// `#id` pointing into the enclosing resource's `contained` list.
    Contained(String),
    /// `urn:uuid:` / `urn:oid:` identifiers.
    Urn(String),
    /// Absolute URL on another server.
    External(String),
    Invalid(String),
}

impl fmt::Display for UnresolvableReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contained(id) => write!(f, "#{id} points into contained resources"),
            Self::Urn(urn) => write!(f, "{urn} is a bundle-local identifier"),
            Self::External(url) => write!(f, "{url} is not served by this bridge"),
            Self::Invalid(reason) => write!(f, "malformed reference ({reason})"),
        }
    }
}

impl std::error::Error for UnresolvableReference {}

/// Parses a reference string into its components.
///
/// Absolute URLs are accepted only when they start with `base_url`.
pub fn parse_reference(
    reference: &str,
    base_url: Option<&str>,
) -> Result<FhirReference, UnresolvableReference> {
    let raw = reference.trim();
    if raw.is_empty() {
        return Err(UnresolvableReference::Invalid("empty".into()));
    }
    if let Some(local) = raw.strip_prefix('#') {
        return Err(UnresolvableReference::Contained(local.into()));
    }
    if raw.starts_with("urn:") {
        return Err(UnresolvableReference::Urn(raw.into()));
    }

    let path = if raw.contains("://") {
        let Some(base) = base_url else {
            return Err(UnresolvableReference::External(raw.into()));
        };
        let (Ok(target), Ok(base)) = (Url::parse(raw), Url::parse(base)) else {
            return Err(UnresolvableReference::Invalid(format!("bad url {raw}")));
        };
        let base_path = base.path().trim_end_matches('/');
        let same_origin = target.origin() == base.origin();
        match target.path().strip_prefix(base_path) {
            Some(suffix) if same_origin => suffix.trim_start_matches('/').to_string(),
            _ => return Err(UnresolvableReference::External(raw.into())),
        }
    } else {
        raw.to_string()
    };

    let segments: Vec<&str> = path.split('/').collect();
    let (type_name, id) = match segments.as_slice() {
        [type_name, id, ..] => (*type_name, *id),
        _ => return Err(UnresolvableReference::Invalid(format!("{raw} lacks Type/id"))),
    };
    if !type_name.starts_with(|c: char| c.is_ascii_uppercase()) {
        return Err(UnresolvableReference::Invalid(format!("{type_name} is not a type name")));
    }
    if id.is_empty() {
        return Err(UnresolvableReference::Invalid(format!("{raw} has no id")));
    }
    let version = match segments.as_slice() {
        [_, _, "_history", version, ..] => Some((*version).to_string()),
        _ => None,
    };

    Ok(FhirReference {
        resource_type: type_name.to_string(),
        id: id.to_string(),
        version,
    })
}

/// `true` for `urn:uuid:<uuid>` references with a well-formed UUID.
pub fn is_urn_uuid(reference: &str) -> bool {
    reference
        .strip_prefix("urn:uuid:")
        .is_some_and(|raw| uuid::Uuid::parse_str(raw).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_and_versioned() {
        let plain = parse_reference("Condition/42", None).unwrap();
        assert_eq!(plain, FhirReference::new("Condition", "42"));

        let versioned = parse_reference("Condition/42/_history/3", None).unwrap();
        assert_eq!(versioned.version.as_deref(), Some("3"));
        assert_eq!(versioned.to_string(), "Condition/42");
    }

    #[test]
    fn test_absolute_reference_needs_own_base() {
        let base = Some("https://omop.example.org/fhir/");
        let local = parse_reference("https://omop.example.org/fhir/Observation/-7", base).unwrap();
        assert_eq!(local.to_relative(), "Observation/-7");

        for (raw, base) in [
            ("https://elsewhere.example.org/fhir/Observation/1", base),
            ("https://omop.example.org/fhir/Observation/1", None),
        ] {
            assert!(matches!(
                parse_reference(raw, base),
                Err(UnresolvableReference::External(_))
            ));
        }
    }

    #[test]
    fn test_contained_and_urn() {
        assert!(matches!(
            parse_reference("#med1", None),
            Err(UnresolvableReference::Contained(id)) if id == "med1"
        ));
        assert!(matches!(
            parse_reference("urn:uuid:8c9a3f2e-4b1d-4f67-9a10-2f3b5c6d7e8f", None),
            Err(UnresolvableReference::Urn(_))
        ));
    }

    #[test]
    fn test_invalid_references() {
        assert!(matches!(parse_reference("", None), Err(UnresolvableReference::Invalid(_))));
        assert!(matches!(parse_reference("Patient", None), Err(UnresolvableReference::Invalid(_))));
        assert!(matches!(parse_reference("patient/1", None), Err(UnresolvableReference::Invalid(_))));
        assert!(matches!(parse_reference("Patient/", None), Err(UnresolvableReference::Invalid(_))));
    }

    #[test]
    fn test_is_urn_uuid() {
        assert!(is_urn_uuid("urn:uuid:8c9a3f2e-4b1d-4f67-9a10-2f3b5c6d7e8f"));
        assert!(!is_urn_uuid("urn:uuid:not-a-uuid"));
        assert!(!is_urn_uuid("urn:oid:1.2.3"));
        assert!(!is_urn_uuid("Patient/1"));
    }
}
