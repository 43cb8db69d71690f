//! FHIR search parameters for the OMOP bridge.
//!
//! - [`parser`] turns a query string into typed [`SearchParam`]s, given the
//!   parameter definitions a resource mapper declares.
//! - [`include`] parses `_include` / `_revinclude`.
//! - [`sql_builder`] renders predicate lists as parameterized SQL.

pub mod include;
pub mod parameters;
pub mod parser;
pub mod sql_builder;

pub use include::{IncludeError, IncludeParam, include_kind, parse_include};
pub use parameters::{
    ChainedParam, DateBound, ParamDefinition, SearchModifier, SearchParam, SearchParameterType,
    SearchPrefix, SearchValue, merge_date_ranges,
};
pub use parser::{
    CONTROL_PARAMETERS, ParseError, ParsedParam, ParsedParameters, SearchParameterParser,
    chain_target, to_search_param,
};
pub use sql_builder::{BuiltQuery, PredicateSqlBuilder, SqlBuilderError, SqlValue, escape_identifier};
