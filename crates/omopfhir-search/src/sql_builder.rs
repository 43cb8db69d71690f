//! Parameterized SQL for predicate lists.
//!
//! [`PredicateSqlBuilder`] renders the grouped form of a predicate list
//! ([`FilterExpr`]) against a single OMOP table. Literals are always bound as
//! positional `$n` parameters and every identifier is validated and quoted,
//! so the output can be handed to any PostgreSQL driver.

use omopfhir_core::OmopTable;
use omopfhir_storage::{
    FilterExpr, JoinOp, LIKE_ESCAPE, Operator, Page, Predicate, SortDirection, SortSpec, ValueType,
};
use thiserror::Error;

/// Errors that can occur during SQL building.
#[derive(Debug, Error, PartialEq)]
pub enum SqlBuilderError {
    #[error("Invalid search value: {0}")]
    InvalidSearchValue(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Column {column} does not belong to table {table}")]
    ForeignColumn { column: String, table: String },

    #[error("Query too complex: {0}")]
    QueryTooComplex(String),
}

/// Maximum number of column clauses in one WHERE.
const MAX_CONDITIONS: usize = 100;

// ============================================================================
// Identifiers and values
// ============================================================================

/// Validate an identifier (schema, table or column name).
///
/// Only allows lowercase ASCII letters, digits and underscores.
fn validate_identifier(name: &str) -> Result<(), SqlBuilderError> {
    if name.is_empty() {
        return Err(SqlBuilderError::InvalidIdentifier(
            "Empty identifier".to_string(),
        ));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(SqlBuilderError::InvalidIdentifier(name.to_string()));
    }

    Ok(())
}

/// Escape a PostgreSQL identifier (table name, column name).
pub fn escape_identifier(name: &str) -> Result<String, SqlBuilderError> {
    validate_identifier(name)?;
    Ok(format!("\"{name}\""))
}

/// SQL value types for parameterized queries.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Date(String),
    Timestamp(String),
}

impl SqlValue {
    fn from_literal(value_type: ValueType, raw: &str) -> Result<Self, SqlBuilderError> {
        let invalid = || SqlBuilderError::InvalidSearchValue(format!("'{raw}' as {value_type:?}"));
        Ok(match value_type {
            ValueType::Long => Self::Integer(raw.parse().map_err(|_| invalid())?),
            ValueType::Double => Self::Float(raw.parse().map_err(|_| invalid())?),
            ValueType::String => Self::Text(raw.to_string()),
            ValueType::Date => Self::Date(raw.to_string()),
            ValueType::DateTime => Self::Timestamp(raw.to_string()),
        })
    }

    /// Cast appended to the placeholder so text literals bind correctly.
    fn cast(&self) -> &'static str {
        match self {
            Self::Date(_) => "::date",
            Self::Timestamp(_) => "::timestamptz",
            _ => "",
        }
    }
}

/// Built SQL query with parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

// ============================================================================
// Builder
// ============================================================================

/// Renders `SELECT`/`SELECT COUNT(*)` statements for one OMOP table.
///
/// Both statements come from the same predicate list, so a count and the
/// pages fetched with it always agree.
#[derive(Debug, Clone)]
pub struct PredicateSqlBuilder<'a> {
    table: OmopTable,
    schema: Option<String>,
    predicates: &'a [Predicate],
    sort: Vec<SortSpec>,
    page: Option<Page>,
}

impl<'a> PredicateSqlBuilder<'a> {
    pub fn new(table: OmopTable) -> Self {
        Self {
            table,
            schema: None,
            predicates: &[],
            sort: Vec::new(),
            page: None,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn filter(mut self, predicates: &'a [Predicate]) -> Self {
        self.predicates = predicates;
        self
    }

    pub fn sort_by(mut self, sort: &[SortSpec]) -> Self {
        self.sort = sort.to_vec();
        self
    }

    pub fn paginate(mut self, page: Page) -> Self {
        self.page = Some(page);
        self
    }

    fn validate(&self) -> Result<(), SqlBuilderError> {
        let clauses: usize = self.predicates.iter().map(|p| p.column_paths.len()).sum();
        if clauses > MAX_CONDITIONS {
            return Err(SqlBuilderError::QueryTooComplex(format!(
                "Too many conditions: {clauses} (max {MAX_CONDITIONS})"
            )));
        }
        Ok(())
    }

    fn full_table(&self) -> Result<String, SqlBuilderError> {
        let table = escape_identifier(self.table.name())?;
        match &self.schema {
            Some(schema) => Ok(format!("{}.{table}", escape_identifier(schema)?)),
            None => Ok(table),
        }
    }

    /// Build the page query. Rows are ordered by the requested keys, then by
    /// primary key so that paging is deterministic.
    pub fn build(&self) -> Result<BuiltQuery, SqlBuilderError> {
        self.validate()?;

        let mut params = Vec::new();
        let mut sql = format!("SELECT * FROM {}", self.full_table()?);

        if let Some(where_sql) = self.build_where_clause(&mut params)? {
            sql.push_str(" WHERE ");
            sql.push_str(&where_sql);
        }

        sql.push_str(" ORDER BY ");
        sql.push_str(&self.build_order_clause()?);

        if let Some(page) = self.page {
            if page.limit != u64::MAX {
                sql.push_str(&format!(" LIMIT {}", page.limit));
            }
            if page.offset > 0 {
                sql.push_str(&format!(" OFFSET {}", page.offset));
            }
        }

        tracing::debug!(table = %self.table, params = params.len(), "built predicate query");
        Ok(BuiltQuery { sql, params })
    }

    /// Build the matching COUNT query.
    pub fn build_count(&self) -> Result<BuiltQuery, SqlBuilderError> {
        self.validate()?;

        let mut params = Vec::new();
        let mut sql = format!("SELECT COUNT(*) AS total FROM {}", self.full_table()?);

        if let Some(where_sql) = self.build_where_clause(&mut params)? {
            sql.push_str(" WHERE ");
            sql.push_str(&where_sql);
        }

        Ok(BuiltQuery { sql, params })
    }

    fn build_where_clause(
        &self,
        params: &mut Vec<SqlValue>,
    ) -> Result<Option<String>, SqlBuilderError> {
        let expr = FilterExpr::build(self.predicates);
        match expr {
            FilterExpr::All => Ok(None),
            other => Ok(Some(self.expr_to_sql(&other, params, false)?)),
        }
    }

    fn expr_to_sql(
        &self,
        expr: &FilterExpr<'_>,
        params: &mut Vec<SqlValue>,
        nested: bool,
    ) -> Result<String, SqlBuilderError> {
        let (parts, joiner) = match expr {
            FilterExpr::All => return Ok("TRUE".to_string()),
            FilterExpr::Leaf(predicate) => return self.predicate_to_sql(predicate, params),
            FilterExpr::And(parts) => (parts, " AND "),
            FilterExpr::Or(parts) => (parts, " OR "),
        };
        let rendered = parts
            .iter()
            .map(|part| self.expr_to_sql(part, params, true))
            .collect::<Result<Vec<_>, _>>()?
            .join(joiner);
        if nested || matches!(expr, FilterExpr::Or(_)) {
            Ok(format!("({rendered})"))
        } else {
            Ok(rendered)
        }
    }

    fn predicate_to_sql(
        &self,
        predicate: &Predicate,
        params: &mut Vec<SqlValue>,
    ) -> Result<String, SqlBuilderError> {
        let mut clauses = Vec::with_capacity(predicate.column_paths.len());
        for (column, operator, raw) in predicate.clauses() {
            let column = self.column_sql(column)?;
            let clause = match operator {
                Operator::IsNull | Operator::IsNotNull => format!("{column} {operator}"),
                other => {
                    let value = SqlValue::from_literal(predicate.value_type, raw)?;
                    let placeholder = format!("${}{}", params.len() + 1, value.cast());
                    params.push(value);
                    if other.is_pattern() {
                        format!("{column} {other} {placeholder} ESCAPE '{LIKE_ESCAPE}'")
                    } else {
                        format!("{column} {other} {placeholder}")
                    }
                }
            };
            clauses.push(clause);
        }
        let joiner = match predicate.inner_join {
            JoinOp::And => " AND ",
            JoinOp::Or => " OR ",
        };
        if clauses.len() == 1 {
            Ok(clauses.remove(0))
        } else {
            Ok(format!("({})", clauses.join(joiner)))
        }
    }

    /// Quotes `column` or `table.column`; a qualifier must name this table.
    fn column_sql(&self, path: &str) -> Result<String, SqlBuilderError> {
        match path.split_once('.') {
            Some((table, column)) => {
                if table != self.table.name() {
                    return Err(SqlBuilderError::ForeignColumn {
                        column: path.to_string(),
                        table: self.table.name().to_string(),
                    });
                }
                Ok(format!(
                    "{}.{}",
                    escape_identifier(table)?,
                    escape_identifier(column)?
                ))
            }
            None => escape_identifier(path),
        }
    }

    fn build_order_clause(&self) -> Result<String, SqlBuilderError> {
        let key = self.table.key_column();
        let mut keys = Vec::with_capacity(self.sort.len() + 1);
        for spec in &self.sort {
            let direction = match spec.direction {
                SortDirection::Asc => "ASC NULLS LAST",
                SortDirection::Desc => "DESC NULLS FIRST",
            };
            keys.push(format!("{} {direction}", self.column_sql(&spec.column)?));
        }
        if !self.sort.iter().any(|s| s.column == key) {
            keys.push(format!("{} ASC", escape_identifier(key)?));
        }
        Ok(keys.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omopfhir_storage::escape_like;

    fn eq(column: &str, value: &str) -> Predicate {
        Predicate::compare(ValueType::Long, column, Operator::Eq, value).unwrap()
    }

    #[test]
    fn test_escape_identifier() {
        assert_eq!(escape_identifier("person_id").unwrap(), "\"person_id\"");
        assert!(escape_identifier("person; DROP").is_err());
        assert!(escape_identifier("").is_err());
    }

    #[test]
    fn test_empty_filter() {
        let q = PredicateSqlBuilder::new(OmopTable::Person).build().unwrap();
        assert_eq!(q.sql, "SELECT * FROM \"person\" ORDER BY \"person_id\" ASC");
        assert!(q.params.is_empty());
    }

    #[test]
    fn test_or_within_and_across() {
        let preds = vec![
            eq("condition_concept_id", "201826"),
            eq("condition_concept_id", "320128").with_outer(JoinOp::Or),
            eq("person_id", "7"),
        ];
        let q = PredicateSqlBuilder::new(OmopTable::ConditionOccurrence)
            .with_schema("cdm")
            .filter(&preds)
            .paginate(Page::new(20, 10))
            .build()
            .unwrap();
        assert_eq!(
            q.sql,
            "SELECT * FROM \"cdm\".\"condition_occurrence\" WHERE \
             (\"condition_concept_id\" = $1 OR \"condition_concept_id\" = $2) AND \"person_id\" = $3 \
             ORDER BY \"condition_occurrence_id\" ASC LIMIT 10 OFFSET 20"
        );
        assert_eq!(
            q.params,
            vec![
                SqlValue::Integer(201826),
                SqlValue::Integer(320128),
                SqlValue::Integer(7)
            ]
        );
    }

    #[test]
    fn test_pattern_operators_declare_escape() {
        let preds = vec![
            Predicate::compare(
                ValueType::String,
                "person_source_value",
                Operator::ILike,
                format!("{}%", escape_like("MRN_1")),
            )
            .unwrap(),
        ];
        let query = PredicateSqlBuilder::new(OmopTable::Person)
            .filter(&preds)
            .build_count()
            .unwrap();
        assert!(query.sql.ends_with("\"person_source_value\" ILIKE $1 ESCAPE '\\'"));
        assert_eq!(query.params, vec![SqlValue::Text("MRN\\_1%".to_string())]);
    }

    #[test]
    fn test_count_shares_where_clause() {
        let preds = vec![
            Predicate::range(
                ValueType::Date,
                "condition_start_date",
                "2020-01-01",
                "2021-01-01",
            )
            .unwrap(),
            Predicate::compare(
                ValueType::String,
                "condition_source_value",
                Operator::Like,
                "%^E11.9^%",
            )
            .unwrap(),
        ];
        let builder = PredicateSqlBuilder::new(OmopTable::ConditionOccurrence)
            .filter(&preds)
            .sort_by(&[SortSpec::desc("condition_start_date")])
            .paginate(Page::new(0, 5));
        let count = builder.build_count().unwrap();
        assert_eq!(
            count.sql,
            "SELECT COUNT(*) AS total FROM \"condition_occurrence\" WHERE \
             (\"condition_start_date\" >= $1::date AND \"condition_start_date\" < $2::date) \
             AND \"condition_source_value\" LIKE $3 ESCAPE '\\'"
        );
        let page = builder.build().unwrap();
        assert!(page.sql.ends_with(
            "ORDER BY \"condition_start_date\" DESC NULLS FIRST, \"condition_occurrence_id\" ASC LIMIT 5"
        ));
        assert_eq!(page.params, count.params);
    }

    #[test]
    fn test_null_checks_bind_nothing() {
        let preds = vec![Predicate::null_check("visit_occurrence_id", true).unwrap()];
        let q = PredicateSqlBuilder::new(OmopTable::ConditionOccurrence)
            .filter(&preds)
            .build_count()
            .unwrap();
        assert!(q.sql.ends_with("WHERE \"visit_occurrence_id\" IS NULL"));
        assert!(q.params.is_empty());
    }

    #[test]
    fn test_rejects_foreign_and_bad_values() {
        let preds = vec![eq("person.person_id", "1")];
        let err = PredicateSqlBuilder::new(OmopTable::Measurement)
            .filter(&preds)
            .build()
            .unwrap_err();
        assert!(matches!(err, SqlBuilderError::ForeignColumn { .. }));

        let preds = vec![eq("person_id", "abc")];
        let err = PredicateSqlBuilder::new(OmopTable::Measurement)
            .filter(&preds)
            .build()
            .unwrap_err();
        assert!(matches!(err, SqlBuilderError::InvalidSearchValue(_)));
    }
}
