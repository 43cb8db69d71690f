use std::borrow::Cow;
use thiserror::Error;
use url::form_urlencoded;

use omopfhir_core::{PartialDateTime, ResourceType};
use omopfhir_storage::SortSpec;

use crate::parameters::{
    ChainedParam, DateBound, ParamDefinition, SearchModifier, SearchParam, SearchParameterType,
    SearchPrefix, SearchValue,
};

/// A query parameter before type-aware interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedParam {
    pub name: String,
    /// Raw text after `:`, e.g. `exact` or `Patient`.
    pub modifier: Option<String>,
    /// Parameter name after `.` in a chained search.
    pub chain: Option<String>,
    /// Comma-separated alternatives, unescaped.
    pub values: Vec<String>,
}

impl ParsedParam {
    /// `true` for result parameters such as `_count` or `_include`.
    pub fn is_control(&self) -> bool {
        CONTROL_PARAMETERS.contains(&self.name.as_str())
    }

    /// The chained part as a parameter of its own, e.g. `gender=female`
    /// for `subject:Patient.gender=female`.
    pub fn chained_inner(&self) -> Option<ParsedParam> {
        let chain = self.chain.as_deref()?;
        let (name, modifier) = split_name_and_modifier(Cow::Borrowed(chain));
        Some(ParsedParam {
            name: name.into_owned(),
            modifier,
            chain: None,
            values: self.values.clone(),
        })
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedParameters {
    pub params: Vec<ParsedParam>,
}

/// Result parameters handled by the search orchestrator itself.
pub const CONTROL_PARAMETERS: &[&str] = &[
    "_count",
    "_offset",
    "_sort",
    "_include",
    "_revinclude",
    "_total",
    "_format",
];

pub struct SearchParameterParser;

impl SearchParameterParser {
    /// Parse an application/x-www-form-urlencoded query string.
    /// Example: "code=http://snomed.info/sct|44054006,38341003&onset-date=ge2020"
    pub fn parse_query(query: &str) -> ParsedParameters {
        let query = query.strip_prefix('?').unwrap_or(query);
        let mut result = ParsedParameters::default();
        for (k, v) in form_urlencoded::parse(query.as_bytes()) {
            let (head, chain) = match k.split_once('.') {
                Some((head, chain)) => (Cow::Owned(head.to_string()), Some(chain.to_string())),
                None => (k, None),
            };
            let (name, modifier) = split_name_and_modifier(head);
            let values = split_values(&v)
                .into_iter()
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
                .collect();
            result.params.push(ParsedParam {
                name: name.into_owned(),
                modifier,
                chain,
                values,
            });
        }
        result
    }
}

fn split_name_and_modifier(key: Cow<'_, str>) -> (Cow<'_, str>, Option<String>) {
    match key.split_once(':') {
        Some((name, modifier)) if !modifier.is_empty() => {
            (Cow::Owned(name.to_string()), Some(modifier.to_string()))
        }
        Some((name, _)) => (Cow::Owned(name.to_string()), None),
        None => (key, None),
    }
}

/// Splits on commas not escaped with `\`, then removes the escapes.
fn split_values(raw: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut current = String::new();
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped @ (',' | '$' | '|' | '\\')) => current.push(escaped),
                Some(other) => {
                    current.push('\\');
                    current.push(other);
                }
                None => current.push('\\'),
            },
            ',' => values.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    values.push(current);
    values
}

/// Separates a two-letter comparison prefix from the value.
fn extract_prefix(value: &str) -> (SearchPrefix, &str) {
    if let Some(p2) = value.get(..2)
        && let Some(prefix) = SearchPrefix::parse(p2)
    {
        return (prefix, &value[2..]);
    }
    (SearchPrefix::Eq, value)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unknown search parameter: {0}")]
    UnknownParameter(String),
    #[error("Invalid value for {param}: {message}")]
    InvalidValue { param: String, message: String },
    #[error("Modifier '{modifier}' is not supported on {param}")]
    InvalidModifier { param: String, modifier: String },
}

impl ParseError {
    fn invalid(param: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            param: param.to_string(),
            message: message.into(),
        }
    }
}

impl ParsedParameters {
    pub fn find(&self, name: &str) -> Option<&ParsedParam> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Search (non-control) parameters in query order.
    pub fn filters(&self) -> impl Iterator<Item = &ParsedParam> {
        self.params.iter().filter(|p| !p.is_control())
    }

    /// All values of every occurrence of `name`.
    pub fn all_values(&self, name: &str) -> Vec<&str> {
        self.params
            .iter()
            .filter(|p| p.name == name)
            .flat_map(|p| p.values.iter().map(String::as_str))
            .collect()
    }

    /// `_count`, falling back to `default_count`. Values above `max_count` are rejected.
    pub fn count(&self, default_count: u64, max_count: u64) -> Result<u64, ParseError> {
        let Some(raw) = self.find("_count").and_then(|p| p.values.first()) else {
            return Ok(default_count);
        };
        let n: u64 = raw
            .parse()
            .map_err(|_| ParseError::invalid("_count", "must be a non-negative integer"))?;
        if n > max_count {
            return Err(ParseError::invalid(
                "_count",
                format!("exceeds maximum of {max_count}"),
            ));
        }
        Ok(n)
    }

    pub fn offset(&self) -> Result<u64, ParseError> {
        match self.find("_offset").and_then(|p| p.values.first()) {
            Some(raw) => raw
                .parse()
                .map_err(|_| ParseError::invalid("_offset", "must be a non-negative integer")),
            None => Ok(0),
        }
    }

    /// `_sort` keys in priority order; `-field` sorts descending.
    pub fn sort(&self) -> Result<Vec<SortSpec>, ParseError> {
        let mut keys = Vec::new();
        for raw in self.all_values("_sort") {
            let spec = match raw.strip_prefix('-') {
                Some(field) => SortSpec::desc(field),
                None => SortSpec::asc(raw),
            };
            if spec.column.is_empty() {
                return Err(ParseError::invalid("_sort", "missing sort field"));
            }
            keys.push(spec);
        }
        Ok(keys)
    }
}

/// Resolves the target type of a chained reference parameter.
///
/// The target comes from a type modifier (`subject:Patient.name`) or, when the
/// parameter has exactly one target, from its definition.
pub fn chain_target(
    raw: &ParsedParam,
    definition: &ParamDefinition,
) -> Result<Option<ChainedParam>, ParseError> {
    let Some(chain) = raw.chain.as_deref() else {
        return Ok(None);
    };
    if definition.kind != SearchParameterType::Reference {
        return Err(ParseError::invalid(
            &raw.name,
            "only reference parameters can be chained",
        ));
    }
    let target = match raw.modifier.as_deref() {
        Some(modifier) => match SearchModifier::parse(modifier) {
            Some(SearchModifier::Type(rt)) => rt,
            _ => {
                return Err(ParseError::InvalidModifier {
                    param: raw.name.clone(),
                    modifier: modifier.to_string(),
                });
            }
        },
        None => match definition.targets {
            [single] => *single,
            _ => {
                return Err(ParseError::invalid(
                    &raw.name,
                    "chained search needs a target type modifier",
                ));
            }
        },
    };
    if !definition.targets.is_empty() && !definition.targets.contains(&target) {
        return Err(ParseError::invalid(
            &raw.name,
            format!("{target} is not a valid target"),
        ));
    }
    let (param, _) = split_name_and_modifier(Cow::Borrowed(chain));
    Ok(Some(ChainedParam {
        target,
        param: param.into_owned(),
    }))
}

/// Interprets a raw (unchained) parameter according to its definition.
pub fn to_search_param(
    raw: &ParsedParam,
    definition: &ParamDefinition,
) -> Result<SearchParam, ParseError> {
    let modifier = match raw.modifier.as_deref() {
        Some(text) => {
            let modifier = SearchModifier::parse(text)
                .filter(|m| m.applicable_to(definition.kind))
                .ok_or_else(|| ParseError::InvalidModifier {
                    param: raw.name.clone(),
                    modifier: text.to_string(),
                })?;
            Some(modifier)
        }
        None => None,
    };
    if raw.values.is_empty() {
        return Err(ParseError::invalid(&raw.name, "missing value"));
    }

    let mut values = Vec::with_capacity(raw.values.len());
    for value in &raw.values {
        let typed = if modifier == Some(SearchModifier::Missing) {
            match value.as_str() {
                "true" => SearchValue::Missing(true),
                "false" => SearchValue::Missing(false),
                _ => return Err(ParseError::invalid(&raw.name, ":missing expects true or false")),
            }
        } else {
            parse_value(&raw.name, definition, modifier.as_ref(), value)?
        };
        values.push(typed);
    }

    Ok(SearchParam {
        name: raw.name.clone(),
        modifier,
        values,
    })
}

fn parse_value(
    name: &str,
    definition: &ParamDefinition,
    modifier: Option<&SearchModifier>,
    value: &str,
) -> Result<SearchValue, ParseError> {
    match definition.kind {
        SearchParameterType::Token => {
            let (system, code) = match value.split_once('|') {
                Some((system, code)) => (non_empty(system), non_empty(code)),
                None => (None, non_empty(value)),
            };
            if system.is_none() && code.is_none() {
                return Err(ParseError::invalid(name, "empty token"));
            }
            Ok(SearchValue::Token { system, code })
        }
        SearchParameterType::Reference => {
            let hinted = match modifier {
                Some(SearchModifier::Type(rt)) => Some(*rt),
                _ => None,
            };
            let (resource_type, id) = parse_reference_value(name, value, hinted)?;
            if let Some(rt) = resource_type
                && !definition.targets.is_empty()
                && !definition.targets.contains(&rt)
            {
                return Err(ParseError::invalid(name, format!("{rt} is not a valid target")));
            }
            Ok(SearchValue::Reference { resource_type, id })
        }
        SearchParameterType::Date => {
            let (prefix, rest) = extract_prefix(value);
            let parsed = PartialDateTime::parse(rest)
                .map_err(|e| ParseError::invalid(name, e.to_string()))?;
            Ok(SearchValue::Date(DateBound {
                prefix,
                value: parsed,
            }))
        }
        SearchParameterType::Number => {
            let (prefix, rest) = extract_prefix(value);
            let number: f64 = rest
                .parse()
                .map_err(|_| ParseError::invalid(name, format!("'{rest}' is not a number")))?;
            Ok(SearchValue::Number {
                prefix,
                value: number,
            })
        }
        SearchParameterType::String => Ok(SearchValue::String(value.to_string())),
    }
}

fn parse_reference_value(
    name: &str,
    value: &str,
    hinted: Option<ResourceType>,
) -> Result<(Option<ResourceType>, String), ParseError> {
    let segments: Vec<&str> = value.trim_end_matches('/').rsplit('/').take(2).collect();
    match segments.as_slice() {
        [id] => Ok((hinted, id.to_string())),
        [id, type_name] => {
            let rt: ResourceType = type_name
                .parse()
                .map_err(|_| ParseError::invalid(name, format!("unknown resource type '{type_name}'")))?;
            if hinted.is_some_and(|h| h != rt) {
                return Err(ParseError::invalid(name, "type modifier and reference disagree"));
            }
            if id.is_empty() {
                return Err(ParseError::invalid(name, "missing reference id"));
            }
            Ok((Some(rt), id.to_string()))
        }
        _ => Err(ParseError::invalid(name, "empty reference")),
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use omopfhir_storage::SortDirection;

    const CODE: ParamDefinition = ParamDefinition::new("code", SearchParameterType::Token);
    const ONSET: ParamDefinition = ParamDefinition::new("onset-date", SearchParameterType::Date);
    const SUBJECT: ParamDefinition =
        ParamDefinition::reference("subject", &[ResourceType::Patient]);
    const NAME: ParamDefinition = ParamDefinition::new("name", SearchParameterType::String);

    #[test]
    fn test_parse_query_basic() {
        let q = "name:exact=John&onset-date=ge2020-01-01&code=a,b";
        let parsed = SearchParameterParser::parse_query(q);
        assert_eq!(parsed.params.len(), 3);
        assert_eq!(parsed.params[0].name, "name");
        assert_eq!(parsed.params[0].modifier.as_deref(), Some("exact"));
        assert_eq!(parsed.params[0].values, vec!["John"]);
        assert_eq!(parsed.params[2].values, vec!["a", "b"]);
    }

    #[test]
    fn test_escaped_comma_stays_in_value() {
        let parsed = SearchParameterParser::parse_query("name=Smith\\,John,Doe");
        assert_eq!(parsed.params[0].values, vec!["Smith,John", "Doe"]);
    }

    #[test]
    fn test_token_forms() {
        let parsed =
            SearchParameterParser::parse_query("code=http://snomed.info/sct|44054006,|E11.9,9999");
        let param = to_search_param(&parsed.params[0], &CODE).unwrap();
        assert_eq!(
            param.values,
            vec![
                SearchValue::Token {
                    system: Some("http://snomed.info/sct".into()),
                    code: Some("44054006".into())
                },
                SearchValue::Token {
                    system: None,
                    code: Some("E11.9".into())
                },
                SearchValue::Token {
                    system: None,
                    code: Some("9999".into())
                },
            ]
        );
    }

    #[test]
    fn test_date_prefix_is_type_aware() {
        let parsed = SearchParameterParser::parse_query("onset-date=le2021-03&name=eve");
        let date = to_search_param(&parsed.params[0], &ONSET).unwrap();
        match &date.values[0] {
            SearchValue::Date(bound) => assert_eq!(bound.prefix, SearchPrefix::Le),
            other => panic!("unexpected {other:?}"),
        }
        let name = to_search_param(&parsed.params[1], &NAME).unwrap();
        assert_eq!(name.values, vec![SearchValue::String("eve".into())]);
    }

    #[test]
    fn test_reference_values() {
        let parsed = SearchParameterParser::parse_query("subject=Patient/12,7");
        let param = to_search_param(&parsed.params[0], &SUBJECT).unwrap();
        assert_eq!(
            param.values,
            vec![
                SearchValue::Reference {
                    resource_type: Some(ResourceType::Patient),
                    id: "12".into()
                },
                SearchValue::Reference {
                    resource_type: None,
                    id: "7".into()
                },
            ]
        );

        let wrong = SearchParameterParser::parse_query("subject=Encounter/3");
        assert!(to_search_param(&wrong.params[0], &SUBJECT).is_err());
    }

    #[test]
    fn test_missing_modifier() {
        let parsed = SearchParameterParser::parse_query("subject:missing=true");
        let param = to_search_param(&parsed.params[0], &SUBJECT).unwrap();
        assert_eq!(param.modifier, Some(SearchModifier::Missing));
        assert_eq!(param.values, vec![SearchValue::Missing(true)]);
    }

    #[test]
    fn test_modifier_not_applicable() {
        let parsed = SearchParameterParser::parse_query("code:exact=1");
        assert!(matches!(
            to_search_param(&parsed.params[0], &CODE),
            Err(ParseError::InvalidModifier { .. })
        ));
    }

    #[test]
    fn test_chain_target_and_inner() {
        let parsed = SearchParameterParser::parse_query("subject:Patient.gender=female");
        let raw = &parsed.params[0];
        assert_eq!(raw.chain.as_deref(), Some("gender"));
        let chain = chain_target(raw, &SUBJECT).unwrap().unwrap();
        assert_eq!(chain.target, ResourceType::Patient);
        assert_eq!(chain.param, "gender");
        let inner = raw.chained_inner().unwrap();
        assert_eq!(inner.name, "gender");
        assert_eq!(inner.values, vec!["female"]);

        // Single-target parameters do not need the type modifier.
        let implicit = SearchParameterParser::parse_query("subject.gender=male");
        assert!(chain_target(&implicit.params[0], &SUBJECT).unwrap().is_some());
    }

    #[test]
    fn test_control_parameters() {
        let parsed = SearchParameterParser::parse_query("_count=5&_offset=10&_sort=-date,code&code=x");
        assert_eq!(parsed.count(10, 100).unwrap(), 5);
        assert_eq!(parsed.offset().unwrap(), 10);
        let sort = parsed.sort().unwrap();
        assert_eq!(sort[0].column, "date");
        assert_eq!(sort[0].direction, SortDirection::Desc);
        assert_eq!(sort[1].direction, SortDirection::Asc);
        assert_eq!(parsed.filters().count(), 1);
    }

    #[test]
    fn test_count_limits() {
        let parsed = SearchParameterParser::parse_query("_count=500");
        assert!(parsed.count(10, 100).is_err());
        let parsed = SearchParameterParser::parse_query("_count=abc");
        assert!(parsed.count(10, 100).is_err());
        let parsed = SearchParameterParser::parse_query("");
        assert_eq!(parsed.count(10, 100).unwrap(), 10);
    }
}
