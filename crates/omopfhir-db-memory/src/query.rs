//! Predicate evaluation over in-memory rows.
//!
//! Rows are projected to a column map (see `OmopEntity::to_columns`) and
//! every clause is compared with SQL semantics: a comparison against a NULL
//! column is false, only `IsNull` matches it.

use std::cmp::Ordering;

use regex::Regex;
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::{Date, OffsetDateTime};

use omopfhir_core::OmopTable;
use omopfhir_core::time::{parse_date, start_of_day};
use omopfhir_storage::{
    FilterExpr, JoinOp, LIKE_ESCAPE, Operator, Predicate, PredicateError, SortDirection, SortSpec,
    ValueType,
};

type Columns = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, PartialOrd)]
enum Scalar {
    Long(i64),
    Double(f64),
    Text(String),
    Date(Date),
    DateTime(OffsetDateTime),
}

/// Checks every literal and column path up front so malformed predicates
/// fail even when the table is empty.
pub fn validate(table: OmopTable, predicates: &[Predicate]) -> Result<(), PredicateError> {
    for predicate in predicates {
        for (column, operator, literal) in predicate.clauses() {
            resolve_column(table, column)?;
            if operator.is_pattern() {
                like_regex(literal, operator)?;
            } else if !operator.is_unary() {
                parse_literal(literal, predicate.value_type)?;
            }
        }
    }
    Ok(())
}

/// Evaluates the grouped filter against one row.
pub fn matches(
    table: OmopTable,
    columns: &Columns,
    predicates: &[Predicate],
) -> Result<bool, PredicateError> {
    FilterExpr::build(predicates).evaluate(&mut |p| matches_predicate(table, columns, p))
}

fn matches_predicate(
    table: OmopTable,
    columns: &Columns,
    predicate: &Predicate,
) -> Result<bool, PredicateError> {
    let mut results = predicate.clauses().map(|(column, operator, literal)| {
        let column = resolve_column(table, column)?;
        matches_clause(columns.get(column), operator, literal, predicate.value_type)
    });
    match predicate.inner_join {
        JoinOp::And => results.try_fold(true, |acc, r| r.map(|m| acc && m)),
        JoinOp::Or => results.try_fold(false, |acc, r| r.map(|m| acc || m)),
    }
}

/// Strips an optional `table.` qualifier, which must name the searched table.
fn resolve_column(table: OmopTable, path: &str) -> Result<&str, PredicateError> {
    match path.split_once('.') {
        None => Ok(path),
        Some((qualifier, column)) if qualifier == table.name() => Ok(column),
        Some(_) => Err(PredicateError::InvalidColumn(path.to_string())),
    }
}

fn matches_clause(
    cell: Option<&Value>,
    operator: Operator,
    literal: &str,
    value_type: ValueType,
) -> Result<bool, PredicateError> {
    let cell = cell.filter(|v| !v.is_null());
    match operator {
        Operator::IsNull => return Ok(cell.is_none()),
        Operator::IsNotNull => return Ok(cell.is_some()),
        _ => {}
    }
    let Some(cell) = cell else {
        return Ok(false);
    };

    if operator.is_pattern() {
        let text = match cell {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Ok(like_regex(literal, operator)?.is_match(&text));
    }

    let expected = parse_literal(literal, value_type)?;
    let Some(actual) = cell_scalar(cell, value_type) else {
        return Ok(false);
    };
    let Some(ordering) = actual.partial_cmp(&expected) else {
        return Ok(false);
    };
    Ok(match operator {
        Operator::Eq => ordering == Ordering::Equal,
        Operator::Ne => ordering != Ordering::Equal,
        Operator::Gt => ordering == Ordering::Greater,
        Operator::Ge => ordering != Ordering::Less,
        Operator::Lt => ordering == Ordering::Less,
        Operator::Le => ordering != Ordering::Greater,
        Operator::Like | Operator::ILike | Operator::IsNull | Operator::IsNotNull => false,
    })
}

fn parse_literal(literal: &str, value_type: ValueType) -> Result<Scalar, PredicateError> {
    let invalid = || PredicateError::InvalidLiteral {
        value: literal.to_string(),
        value_type,
    };
    match value_type {
        ValueType::Long => literal.parse().map(Scalar::Long).map_err(|_| invalid()),
        ValueType::Double => literal.parse().map(Scalar::Double).map_err(|_| invalid()),
        ValueType::String => Ok(Scalar::Text(literal.to_string())),
        ValueType::Date => parse_date(literal).map(Scalar::Date).map_err(|_| invalid()),
        ValueType::DateTime => parse_instant(literal).map(Scalar::DateTime).ok_or_else(invalid),
    }
}

fn cell_scalar(cell: &Value, value_type: ValueType) -> Option<Scalar> {
    match value_type {
        ValueType::Long => cell.as_i64().map(Scalar::Long),
        ValueType::Double => cell.as_f64().map(Scalar::Double),
        ValueType::String => Some(Scalar::Text(match cell {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })),
        ValueType::Date => cell
            .as_str()
            .and_then(|s| parse_date(s.get(..10).unwrap_or(s)).ok())
            .map(Scalar::Date),
        ValueType::DateTime => cell.as_str().and_then(parse_instant).map(Scalar::DateTime),
    }
}

/// RFC 3339 instant, or a bare date read as midnight UTC.
fn parse_instant(s: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(s, &Rfc3339)
        .ok()
        .or_else(|| parse_date(s).ok().map(start_of_day))
}

/// Translates a SQL LIKE pattern into an anchored regex. Only `ILike`
/// ignores case.
fn like_regex(pattern: &str, operator: Operator) -> Result<Regex, PredicateError> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push_str(if operator == Operator::ILike { "(?is)^" } else { "(?s)^" });
    let mut chars = pattern.chars();
    while let Some(ch) = chars.next() {
        match ch {
            LIKE_ESCAPE => {
                if let Some(quoted) = chars.next() {
                    expr.push_str(&regex::escape(&quoted.to_string()));
                }
            }
            '%' => expr.push_str(".*"),
            '_' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|_| PredicateError::InvalidLiteral {
        value: pattern.to_string(),
        value_type: ValueType::String,
    })
}

/// Orders two rows by the sort keys; NULLs sort last in ascending order.
pub fn compare_rows(a: &Columns, b: &Columns, sort: &[SortSpec]) -> Ordering {
    for spec in sort {
        let column = spec.column.rsplit('.').next().unwrap_or(&spec.column);
        let ordering = compare_cells(a.get(column), b.get(column));
        let ordering = match spec.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn compare_cells(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(x), Some(y)) => x.as_str().cmp(&y.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omopfhir_storage::escape_like;
    use serde_json::json;

    fn row(value: Value) -> Columns {
        match value {
            Value::Object(map) => map,
            _ => panic!("row must be an object"),
        }
    }

    fn long_eq(column: &str, value: &str) -> Predicate {
        Predicate::compare(ValueType::Long, column, Operator::Eq, value).unwrap()
    }

    #[test]
    fn test_or_within_and_across() {
        let columns = row(json!({"condition_concept_id": 2, "person_id": 7}));
        let table = OmopTable::ConditionOccurrence;

        let predicates = vec![
            long_eq("condition_concept_id", "1"),
            long_eq("condition_concept_id", "2").alternative(true),
            long_eq("person_id", "7"),
        ];
        assert!(matches(table, &columns, &predicates).unwrap());

        let predicates = vec![
            long_eq("condition_concept_id", "1"),
            long_eq("condition_concept_id", "2").alternative(true),
            long_eq("person_id", "8"),
        ];
        assert!(!matches(table, &columns, &predicates).unwrap());
    }

    #[test]
    fn test_empty_predicates_match() {
        assert!(matches(OmopTable::Person, &row(json!({})), &[]).unwrap());
    }

    #[test]
    fn test_date_range_and_nulls() {
        let columns = row(json!({"condition_start_date": "2020-05-01", "condition_end_date": null}));
        let table = OmopTable::ConditionOccurrence;
        let range =
            Predicate::range(ValueType::Date, "condition_start_date", "2020-01-01", "2021-01-01")
                .unwrap();
        assert!(matches(table, &columns, &[range]).unwrap());

        let end_before = Predicate::compare(
            ValueType::Date,
            "condition_end_date",
            Operator::Lt,
            "2030-01-01",
        )
        .unwrap();
        assert!(!matches(table, &columns, &[end_before]).unwrap());

        let missing = Predicate::null_check("condition_end_date", true).unwrap();
        assert!(matches(table, &columns, &[missing]).unwrap());
    }

    #[test]
    fn test_datetime_against_date_column() {
        let columns = row(json!({"measurement_datetime": "2021-03-04T10:30:00Z"}));
        let p = Predicate::compare(
            ValueType::DateTime,
            "measurement_datetime",
            Operator::Ge,
            "2021-03-04",
        )
        .unwrap();
        assert!(matches(OmopTable::Measurement, &columns, &[p]).unwrap());
    }

    #[test]
    fn test_like_case_and_regex_metacharacters() {
        let columns = row(json!({"condition_source_value": "http://x.org^A.1^Thing"}));
        let table = OmopTable::ConditionOccurrence;
        let like = |operator, pattern: &str| {
            Predicate::compare(ValueType::String, "condition_source_value", operator, pattern)
                .unwrap()
        };
        assert!(matches(table, &columns, &[like(Operator::ILike, "http://x.org^a.1^%")]).unwrap());
        assert!(!matches(table, &columns, &[like(Operator::Like, "http://x.org^a.1^%")]).unwrap());
        assert!(matches(table, &columns, &[like(Operator::Like, "http://x.org^A.1^%")]).unwrap());

        // '.' in the pattern is literal
        let miss = Predicate::compare(
            ValueType::String,
            "condition_source_value",
            Operator::Like,
            "http://x.org^AX1^%",
        )
        .unwrap();
        assert!(!matches(table, &columns, &[miss]).unwrap());
    }

    #[test]
    fn test_escaped_wildcards_match_literally() {
        let table = OmopTable::ConditionOccurrence;
        let pattern = format!("%^{}^%", escape_like("LC_17"));
        let p = Predicate::compare(ValueType::String, "condition_source_value", Operator::Like, pattern)
            .unwrap();
        let underscore = row(json!({"condition_source_value": "urn:x^LC_17^"}));
        let dash = row(json!({"condition_source_value": "urn:x^LC-17^"}));
        assert!(matches(table, &underscore, &[p.clone()]).unwrap());
        assert!(!matches(table, &dash, &[p]).unwrap());

        let percent = Predicate::compare(
            ValueType::String,
            "condition_source_value",
            Operator::Like,
            format!("%^{}^%", escape_like("%")),
        )
        .unwrap();
        assert!(!matches(table, &dash, &[percent]).unwrap());
    }

    #[test]
    fn test_inner_or() {
        let columns = row(json!({"a": 1, "b": 5}));
        let p = Predicate::new(
            ValueType::Long,
            vec!["a".into(), "b".into()],
            vec![Operator::Eq, Operator::Eq],
            vec!["9".into(), "5".into()],
            JoinOp::Or,
        )
        .unwrap();
        assert!(matches(OmopTable::Measurement, &columns, &[p]).unwrap());
    }

    #[test]
    fn test_validate_rejects_bad_literal_and_foreign_table() {
        let bad = Predicate::compare(ValueType::Long, "person_id", Operator::Eq, "abc").unwrap();
        assert!(matches!(
            validate(OmopTable::Person, &[bad]),
            Err(PredicateError::InvalidLiteral { .. })
        ));

        let foreign =
            Predicate::compare(ValueType::Long, "concept.concept_id", Operator::Eq, "1").unwrap();
        assert!(matches!(
            validate(OmopTable::Person, &[foreign]),
            Err(PredicateError::InvalidColumn(_))
        ));

        let qualified =
            Predicate::compare(ValueType::Long, "person.person_id", Operator::Eq, "1").unwrap();
        assert!(validate(OmopTable::Person, &[qualified]).is_ok());
    }

    #[test]
    fn test_compare_rows_nulls_last() {
        let a = row(json!({"d": "2020-01-01"}));
        let b = row(json!({"d": null}));
        let asc = [SortSpec::asc("d")];
        assert_eq!(compare_rows(&a, &b, &asc), Ordering::Less);
        let desc = [SortSpec::desc("d")];
        assert_eq!(compare_rows(&a, &b, &desc), Ordering::Greater);
    }
}
