//! Search value to predicate translation shared by the mappers.
//!
//! Every function here turns one search value into exactly one
//! [`Predicate`], so the caller can tag alternatives with
//! [`crate::mapper::alternatives`].

use time::{Date, Duration};

use omopfhir_core::time::{DatePrecision, format_date};
use omopfhir_core::{OmopTable, PartialDateTime, ResourceType};
use omopfhir_search::{DateBound, SearchModifier, SearchPrefix, SearchValue};
use omopfhir_storage::{JoinOp, Operator, Predicate, ValueType, escape_like};

use crate::error::MappingError;
use crate::mapper::MapperContext;
use crate::vocabulary::{ConceptLookup, SourceValue};

/// Predicate that no row satisfies; primary keys are never NULL.
pub fn match_nothing(table: OmopTable) -> Result<Predicate, MappingError> {
    Ok(Predicate::null_check(table.key_column(), true)?)
}

/// Predicate every row satisfies.
pub fn match_all(table: OmopTable) -> Result<Predicate, MappingError> {
    Ok(Predicate::null_check(table.key_column(), false)?)
}

fn unsupported_value(name: &str) -> MappingError {
    MappingError::unsupported_parameter(name)
}

/// `_id`, resolved through the identifier mapper. An id owned by the other
/// table of a split type matches nothing on `table`.
pub fn id_predicate(
    ctx: &MapperContext,
    resource_type: ResourceType,
    table: OmopTable,
    value: &SearchValue,
) -> Result<Predicate, MappingError> {
    let raw = match value {
        SearchValue::Token { code: Some(code), .. } => code.as_str(),
        SearchValue::String(s) => s.as_str(),
        _ => return Err(unsupported_value("_id")),
    };
    match ctx.ids.parse_and_resolve(resource_type, raw) {
        Some(internal) if internal.table == table => Ok(Predicate::compare(
            ValueType::Long,
            table.key_column(),
            Operator::Eq,
            internal.key.to_string(),
        )?),
        _ => match_nothing(table),
    }
}

/// Reference parameter stored as a foreign key `column` into the primary
/// table of `target`.
pub fn reference_predicate(
    ctx: &MapperContext,
    table: OmopTable,
    column: &str,
    target: ResourceType,
    value: &SearchValue,
) -> Result<Predicate, MappingError> {
    match value {
        SearchValue::Missing(missing) => Ok(Predicate::null_check(column, *missing)?),
        SearchValue::Reference { resource_type, id } => {
            if resource_type.is_some_and(|rt| rt != target) {
                return match_nothing(table);
            }
            let primary = ctx.ids.binding(target).map(|b| b.primary);
            match ctx.ids.parse_and_resolve(target, id) {
                Some(internal) if Some(internal.table) == primary => Ok(Predicate::compare(
                    ValueType::Long,
                    column,
                    Operator::Eq,
                    internal.key.to_string(),
                )?),
                _ => match_nothing(table),
            }
        }
        _ => Err(unsupported_value(column)),
    }
}

/// Coded element stored as a concept id plus a source value.
///
/// - A code that resolves to a concept compares `concept_column`.
/// - A code under a system with no OMOP vocabulary matches
///   `system^code^%` in `source_column`.
/// - A code unknown within a known vocabulary, or a code without system,
///   matches `%^code^%` in `source_column`, whichever system it was
///   captured under.
///
/// `:not` is only supported for codes that resolve.
pub async fn code_predicate(
    ctx: &MapperContext,
    concept_column: &str,
    source_column: &str,
    modifier: Option<&SearchModifier>,
    value: &SearchValue,
) -> Result<Predicate, MappingError> {
    let (system, code) = match value {
        SearchValue::Missing(missing) => {
            return Ok(Predicate::null_check(source_column, *missing)?);
        }
        SearchValue::Token { system, code } => (system.as_deref(), code.as_deref()),
        _ => return Err(unsupported_value(concept_column)),
    };
    let negate = modifier == Some(&SearchModifier::Not);

    let lookup = match (system, code) {
        (Some(system), Some(code)) => ctx.vocabulary.resolve_system_code(system, code).await?,
        _ => ConceptLookup::UnknownCode,
    };
    if let ConceptLookup::Found(concept) = lookup {
        let operator = if negate { Operator::Ne } else { Operator::Eq };
        return Ok(Predicate::compare(
            ValueType::Long,
            concept_column,
            operator,
            concept.concept_id.to_string(),
        )?);
    }
    if negate {
        return Err(MappingError::unsupported_parameter(format!(
            "{concept_column}:not on an unmapped code"
        )));
    }
    let pattern = match lookup {
        ConceptLookup::UnknownVocabulary => SourceValue::like_pattern(system, code),
        _ => SourceValue::like_pattern(None, code),
    };
    Ok(Predicate::compare(
        ValueType::String,
        source_column,
        Operator::Like,
        pattern,
    )?)
}

/// Date parameter over a `*_date` column.
///
/// Values are widened to whole days: `[lo, hi)` is the set of days the
/// searched value touches.
pub fn date_predicate(column: &str, value: &SearchValue) -> Result<Predicate, MappingError> {
    let (clauses, join) = match value {
        SearchValue::Missing(missing) => return Ok(Predicate::null_check(column, *missing)?),
        SearchValue::Date(bound) => bound_clauses(bound),
        SearchValue::DateRange { lower, upper } => {
            let mut clauses = Vec::new();
            for bound in lower.iter().chain(upper.iter()) {
                clauses.extend(bound_clauses(bound).0);
            }
            (clauses, JoinOp::And)
        }
        _ => return Err(unsupported_value(column)),
    };
    if clauses.is_empty() {
        return Err(MappingError::validation(column, "empty date range"));
    }
    let (operators, values): (Vec<Operator>, Vec<String>) = clauses
        .into_iter()
        .map(|(op, date)| (op, format_date(date)))
        .unzip();
    Ok(Predicate::new(
        ValueType::Date,
        vec![column.to_string(); operators.len()],
        operators,
        values,
        join,
    )?)
}

fn day_bounds(value: &PartialDateTime) -> (Date, Date) {
    let lo = value.start.date();
    let hi = match value.precision {
        DatePrecision::Instant => lo.next_day().unwrap_or(lo),
        _ => value.end.date(),
    };
    (lo, hi)
}

fn bound_clauses(bound: &DateBound) -> (Vec<(Operator, Date)>, JoinOp) {
    let (lo, hi) = day_bounds(&bound.value);
    match bound.prefix {
        SearchPrefix::Eq => (vec![(Operator::Ge, lo), (Operator::Lt, hi)], JoinOp::And),
        SearchPrefix::Ne => (vec![(Operator::Lt, lo), (Operator::Ge, hi)], JoinOp::Or),
        SearchPrefix::Gt | SearchPrefix::Sa => (vec![(Operator::Ge, hi)], JoinOp::And),
        SearchPrefix::Ge => (vec![(Operator::Ge, lo)], JoinOp::And),
        SearchPrefix::Lt | SearchPrefix::Eb => (vec![(Operator::Lt, lo)], JoinOp::And),
        SearchPrefix::Le => (vec![(Operator::Lt, hi)], JoinOp::And),
        SearchPrefix::Ap => (
            vec![
                (Operator::Ge, lo.saturating_sub(Duration::DAY)),
                (Operator::Lt, hi.saturating_add(Duration::DAY)),
            ],
            JoinOp::And,
        ),
    }
}

/// String parameter: prefix match by default, `:exact` and `:contains`.
pub fn string_predicate(
    column: &str,
    modifier: Option<&SearchModifier>,
    value: &SearchValue,
) -> Result<Predicate, MappingError> {
    let text = match value {
        SearchValue::Missing(missing) => return Ok(Predicate::null_check(column, *missing)?),
        SearchValue::String(text) => text,
        _ => return Err(unsupported_value(column)),
    };
    let (operator, literal) = match modifier {
        Some(SearchModifier::Exact) => (Operator::Eq, text.clone()),
        Some(SearchModifier::Contains) => (Operator::ILike, format!("%{}%", escape_like(text))),
        _ => (Operator::ILike, format!("{}%", escape_like(text))),
    };
    Ok(Predicate::compare(ValueType::String, column, operator, literal)?)
}

/// Numeric parameter; `ap` is a ±10% window.
pub fn number_predicate(column: &str, value: &SearchValue) -> Result<Predicate, MappingError> {
    let (prefix, number) = match value {
        SearchValue::Missing(missing) => return Ok(Predicate::null_check(column, *missing)?),
        SearchValue::Number { prefix, value } => (*prefix, *value),
        _ => return Err(unsupported_value(column)),
    };
    let operator = match prefix {
        SearchPrefix::Eq => Operator::Eq,
        SearchPrefix::Ne => Operator::Ne,
        SearchPrefix::Gt | SearchPrefix::Sa => Operator::Gt,
        SearchPrefix::Ge => Operator::Ge,
        SearchPrefix::Lt | SearchPrefix::Eb => Operator::Lt,
        SearchPrefix::Le => Operator::Le,
        SearchPrefix::Ap => {
            let delta = number.abs() * 0.1;
            return Ok(Predicate::new(
                ValueType::Double,
                vec![column.to_string(), column.to_string()],
                vec![Operator::Ge, Operator::Le],
                vec![(number - delta).to_string(), (number + delta).to_string()],
                JoinOp::And,
            )?);
        }
    };
    Ok(Predicate::compare(
        ValueType::Double,
        column,
        operator,
        number.to_string(),
    )?)
}
