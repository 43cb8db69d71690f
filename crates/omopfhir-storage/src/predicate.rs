//! Backend-agnostic filter predicates.
//!
//! A [`Predicate`] compares one or more columns against literal values. A
//! request's filter is an ordered list of predicates; each predicate's
//! `outer_join` says how it attaches to the predicate before it:
//!
//! - `And` starts a new group,
//! - `Or` joins the current group.
//!
//! The filter is the AND of all groups, each group being the OR of its
//! members. Mappers emit the alternatives of one search parameter as
//! `[And, Or, Or, ..]`, which yields "OR within a parameter, AND across
//! parameters". The first predicate's `outer_join` is not consulted, and an
//! empty list matches every row.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Type used to interpret both the column value and the literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Long,
    Double,
    String,
    Date,
    DateTime,
}

/// Comparison applied to one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    /// SQL `LIKE` with `%` and `_` wildcards; [`LIKE_ESCAPE`] quotes the
    /// next character.
    Like,
    /// Case-insensitive [`Operator::Like`].
    ILike,
    IsNull,
    IsNotNull,
}

impl Operator {
    /// `true` for operators that ignore their literal.
    pub fn is_unary(&self) -> bool {
        matches!(self, Operator::IsNull | Operator::IsNotNull)
    }

    pub fn is_pattern(&self) -> bool {
        matches!(self, Operator::Like | Operator::ILike)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Like => "LIKE",
            Operator::ILike => "ILIKE",
            Operator::IsNull => "IS NULL",
            Operator::IsNotNull => "IS NOT NULL",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Escape character of `Like` and `ILike` patterns.
pub const LIKE_ESCAPE: char = '\\';

/// Quotes the LIKE wildcards and the escape character so `text` only
/// matches itself inside a pattern.
pub fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '%' | '_' | LIKE_ESCAPE) {
            escaped.push(LIKE_ESCAPE);
        }
        escaped.push(ch);
    }
    escaped
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum JoinOp {
    #[default]
    And,
    Or,
}

/// Errors raised while building a predicate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PredicateError {
    #[error("predicate needs at least one column")]
    NoColumns,

    #[error("predicate is misaligned: {columns} columns, {operators} operators, {values} values")]
    Misaligned {
        columns: usize,
        operators: usize,
        values: usize,
    },

    #[error("invalid column path: {0}")]
    InvalidColumn(String),

    #[error("cannot read '{value}' as {value_type:?}")]
    InvalidLiteral { value: String, value_type: ValueType },
}

/// One filter clause over one or more columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub value_type: ValueType,
    pub column_paths: Vec<String>,
    pub operators: Vec<Operator>,
    pub values: Vec<String>,
    /// Combines this predicate's own column clauses.
    pub inner_join: JoinOp,
    /// Attaches this predicate to the one before it.
    pub outer_join: JoinOp,
}

impl Predicate {
    /// Builds a multi-column predicate. Columns, operators and values must
    /// have equal length and are matched by position.
    pub fn new(
        value_type: ValueType,
        column_paths: Vec<String>,
        operators: Vec<Operator>,
        values: Vec<String>,
        inner_join: JoinOp,
    ) -> Result<Self, PredicateError> {
        if column_paths.is_empty() {
            return Err(PredicateError::NoColumns);
        }
        if column_paths.len() != operators.len() || column_paths.len() != values.len() {
            return Err(PredicateError::Misaligned {
                columns: column_paths.len(),
                operators: operators.len(),
                values: values.len(),
            });
        }
        if let Some(bad) = column_paths.iter().find(|c| !is_valid_column_path(c)) {
            return Err(PredicateError::InvalidColumn(bad.clone()));
        }
        Ok(Self {
            value_type,
            column_paths,
            operators,
            values,
            inner_join,
            outer_join: JoinOp::And,
        })
    }

    /// Single `column op value` clause.
    pub fn compare(
        value_type: ValueType,
        column: &str,
        operator: Operator,
        value: impl Into<String>,
    ) -> Result<Self, PredicateError> {
        Self::new(
            value_type,
            vec![column.to_string()],
            vec![operator],
            vec![value.into()],
            JoinOp::And,
        )
    }

    /// `column IS NULL` / `column IS NOT NULL`.
    pub fn null_check(column: &str, missing: bool) -> Result<Self, PredicateError> {
        let operator = if missing {
            Operator::IsNull
        } else {
            Operator::IsNotNull
        };
        Self::compare(ValueType::String, column, operator, "")
    }

    /// Half-open range `lower <= column < upper`.
    pub fn range(
        value_type: ValueType,
        column: &str,
        lower: impl Into<String>,
        upper: impl Into<String>,
    ) -> Result<Self, PredicateError> {
        Self::new(
            value_type,
            vec![column.to_string(), column.to_string()],
            vec![Operator::Ge, Operator::Lt],
            vec![lower.into(), upper.into()],
            JoinOp::And,
        )
    }

    #[must_use]
    pub fn with_outer(mut self, outer_join: JoinOp) -> Self {
        self.outer_join = outer_join;
        self
    }

    /// Sets `outer_join` to `Or` for every alternative after the first.
    #[must_use]
    pub fn alternative(self, is_or_alternative: bool) -> Self {
        self.with_outer(if is_or_alternative {
            JoinOp::Or
        } else {
            JoinOp::And
        })
    }

    /// `(column, operator, value)` triples in order.
    pub fn clauses(&self) -> impl Iterator<Item = (&str, Operator, &str)> {
        self.column_paths
            .iter()
            .zip(&self.operators)
            .zip(&self.values)
            .map(|((c, o), v)| (c.as_str(), *o, v.as_str()))
    }
}

/// `table.column` or `column`, lowercase identifiers only.
pub fn is_valid_column_path(path: &str) -> bool {
    let parts: Vec<&str> = path.split('.').collect();
    parts.len() <= 2
        && parts.iter().all(|p| {
            !p.is_empty()
                && p.chars().next().is_some_and(|c| c.is_ascii_lowercase() || c == '_')
                && p.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        })
}

/// Grouped view of a predicate list, ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr<'a> {
    /// Empty filter.
    All,
    Leaf(&'a Predicate),
    And(Vec<FilterExpr<'a>>),
    Or(Vec<FilterExpr<'a>>),
}

impl<'a> FilterExpr<'a> {
    pub fn build(predicates: &'a [Predicate]) -> Self {
        let groups = group(predicates);
        let mut conjuncts: Vec<FilterExpr<'a>> = groups
            .into_iter()
            .map(|members| {
                if members.len() == 1 {
                    FilterExpr::Leaf(members[0])
                } else {
                    FilterExpr::Or(members.into_iter().map(FilterExpr::Leaf).collect())
                }
            })
            .collect();

        match conjuncts.len() {
            0 => FilterExpr::All,
            1 => conjuncts.remove(0),
            _ => FilterExpr::And(conjuncts),
        }
    }

    /// Evaluates the tree with a caller-supplied leaf test.
    pub fn evaluate<E>(&self, leaf: &mut impl FnMut(&Predicate) -> Result<bool, E>) -> Result<bool, E> {
        match self {
            FilterExpr::All => Ok(true),
            FilterExpr::Leaf(p) => leaf(p),
            FilterExpr::And(parts) => {
                for part in parts {
                    if !part.evaluate(leaf)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            FilterExpr::Or(parts) => {
                for part in parts {
                    if part.evaluate(leaf)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

/// Splits predicates into OR-groups; the groups are AND-ed together.
pub fn group(predicates: &[Predicate]) -> Vec<Vec<&Predicate>> {
    let mut groups: Vec<Vec<&Predicate>> = Vec::new();
    for predicate in predicates {
        match (predicate.outer_join, groups.last_mut()) {
            (JoinOp::Or, Some(current)) => current.push(predicate),
            _ => groups.push(vec![predicate]),
        }
    }
    groups
}
