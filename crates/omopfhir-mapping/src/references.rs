//! Reference handling shared by the mappers.

use omopfhir_core::model::Reference;
use omopfhir_core::{ExternalId, InternalId, ResourceType, parse_reference};

use crate::error::MappingError;
use crate::mapper::MapperContext;

/// Resolves an optional reference element to the native key of a row in the
/// primary table of `expected`.
///
/// A blank reference counts as absent. A reference to another type is a
/// validation failure; one that cannot denote a local row is unresolvable.
pub fn reference_key(
    ctx: &MapperContext,
    field: &str,
    reference: Option<&Reference>,
    expected: ResourceType,
) -> Result<Option<i64>, MappingError> {
    let Some(raw) = reference.and_then(Reference::target) else {
        return Ok(None);
    };
    let parsed = parse_reference(raw, ctx.base_url.as_deref())
        .map_err(|_| MappingError::unresolvable_reference(raw))?;
    if parsed.resource_type != expected.as_str() {
        return Err(MappingError::validation(
            field,
            format!("expected a reference to {expected}, got {}", parsed.resource_type),
        ));
    }
    let internal = ctx
        .ids
        .parse_and_resolve(expected, &parsed.id)
        .ok_or_else(|| MappingError::unresolvable_reference(raw))?;
    Ok(Some(internal.key))
}

/// Same as [`reference_key`] for elements the resource cannot omit.
pub fn required_reference_key(
    ctx: &MapperContext,
    field: &str,
    reference: Option<&Reference>,
    expected: ResourceType,
) -> Result<i64, MappingError> {
    reference_key(ctx, field, reference, expected)?.ok_or_else(|| MappingError::missing(field))
}

/// Reference to the row `key` of the primary table of `target`.
pub fn render_reference(
    ctx: &MapperContext,
    target: ResourceType,
    key: Option<i64>,
) -> Option<(Reference, ExternalId)> {
    let binding = ctx.ids.binding(target)?;
    let external = ctx
        .ids
        .to_external(&InternalId::new(binding.primary, key?), target)?;
    Some((Reference::to(external.to_reference()), external))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::context;

    #[test]
    fn test_reference_key_resolves_relative_and_absolute() {
        let ctx = context().with_base_url(Some("http://example.org/fhir".into()));
        let key = reference_key(&ctx, "subject", Some(&Reference::to("Patient/12")), ResourceType::Patient)
            .unwrap();
        assert_eq!(key, Some(12));

        let key = reference_key(
            &ctx,
            "subject",
            Some(&Reference::to("http://example.org/fhir/Patient/5")),
            ResourceType::Patient,
        )
        .unwrap();
        assert_eq!(key, Some(5));
    }

    #[test]
    fn test_reference_key_failures() {
        let ctx = context();
        assert_eq!(
            reference_key(&ctx, "subject", Some(&Reference::to(" ")), ResourceType::Patient).unwrap(),
            None
        );
        assert!(matches!(
            reference_key(&ctx, "subject", Some(&Reference::to("Encounter/1")), ResourceType::Patient),
            Err(MappingError::Validation { .. })
        ));
        assert!(matches!(
            reference_key(&ctx, "subject", Some(&Reference::to("Patient/abc")), ResourceType::Patient),
            Err(MappingError::UnresolvableReference { .. })
        ));
        assert!(matches!(
            reference_key(&ctx, "subject", Some(&Reference::to("urn:uuid:0c3151bd-1cbf-4d64-b04d-cd9187a4c6e0")), ResourceType::Patient),
            Err(MappingError::UnresolvableReference { .. })
        ));
        assert!(matches!(
            required_reference_key(&ctx, "subject", None, ResourceType::Patient),
            Err(MappingError::Validation { field, .. }) if field == "subject"
        ));
    }

    #[test]
    fn test_render_reference() {
        let ctx = context();
        let (reference, external) = render_reference(&ctx, ResourceType::Practitioner, Some(4)).unwrap();
        assert_eq!(reference.reference.as_deref(), Some("Practitioner/4"));
        assert_eq!(external, ExternalId::new(ResourceType::Practitioner, 4));
        assert!(render_reference(&ctx, ResourceType::Practitioner, None).is_none());
    }
}
