use serde::{Deserialize, Serialize};
use std::fmt;

use omopfhir_core::{PartialDateTime, ResourceType};

/// FHIR search parameter types handled by the bridge.
/// See: https://hl7.org/fhir/R4/search.html#table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchParameterType {
    Number,
    Date,
    String,
    Token,
    Reference,
}

impl SearchParameterType {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "number" => Some(Self::Number),
            "date" => Some(Self::Date),
            "string" => Some(Self::String),
            "token" => Some(Self::Token),
            "reference" => Some(Self::Reference),
            _ => None,
        }
    }
}

/// Supported search modifiers, applied as `name:modifier`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchModifier {
    Exact,
    Contains,
    Missing,
    Not,
    /// Target type on a reference parameter, e.g. `subject:Patient`.
    Type(ResourceType),
}

impl SearchModifier {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exact" => Some(Self::Exact),
            "contains" => Some(Self::Contains),
            "missing" => Some(Self::Missing),
            "not" => Some(Self::Not),
            other => other.parse::<ResourceType>().ok().map(Self::Type),
        }
    }

    pub fn applicable_to(&self, param_type: SearchParameterType) -> bool {
        match self {
            Self::Missing => true,
            Self::Exact | Self::Contains => matches!(param_type, SearchParameterType::String),
            Self::Not => matches!(param_type, SearchParameterType::Token),
            Self::Type(_) => matches!(param_type, SearchParameterType::Reference),
        }
    }
}

impl fmt::Display for SearchModifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => f.write_str("exact"),
            Self::Contains => f.write_str("contains"),
            Self::Missing => f.write_str("missing"),
            Self::Not => f.write_str("not"),
            Self::Type(rt) => write!(f, "{rt}"),
        }
    }
}

/// Prefixes for number/date search values, e.g. `ge2020-01-01`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchPrefix {
    #[default]
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Sa, // starts after
    Eb, // ends before
    Ap, // approximately
}

impl fmt::Display for SearchPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SearchPrefix::Eq => "eq",
            SearchPrefix::Ne => "ne",
            SearchPrefix::Gt => "gt",
            SearchPrefix::Lt => "lt",
            SearchPrefix::Ge => "ge",
            SearchPrefix::Le => "le",
            SearchPrefix::Sa => "sa",
            SearchPrefix::Eb => "eb",
            SearchPrefix::Ap => "ap",
        };
        f.write_str(s)
    }
}

impl SearchPrefix {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "eq" => Some(Self::Eq),
            "ne" => Some(Self::Ne),
            "gt" => Some(Self::Gt),
            "lt" => Some(Self::Lt),
            "ge" => Some(Self::Ge),
            "le" => Some(Self::Le),
            "sa" => Some(Self::Sa),
            "eb" => Some(Self::Eb),
            "ap" => Some(Self::Ap),
            _ => None,
        }
    }

    /// Lower-bound prefixes that can open a date range.
    pub fn is_lower_bound(&self) -> bool {
        matches!(self, Self::Gt | Self::Ge | Self::Sa)
    }

    /// Upper-bound prefixes that can close a date range.
    pub fn is_upper_bound(&self) -> bool {
        matches!(self, Self::Lt | Self::Le | Self::Eb)
    }
}

/// A date bound together with its own comparison prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateBound {
    pub prefix: SearchPrefix,
    pub value: PartialDateTime,
}

/// One typed search value.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchValue {
    /// `system|code`, `|code` (no system), `system|` or bare `code`.
    Token {
        system: Option<String>,
        code: Option<String>,
    },
    /// `Type/id` or a bare id.
    Reference {
        resource_type: Option<ResourceType>,
        id: String,
    },
    Date(DateBound),
    /// Both ends of a range, each with its own prefix.
    DateRange {
        lower: Option<DateBound>,
        upper: Option<DateBound>,
    },
    Number {
        prefix: SearchPrefix,
        value: f64,
    },
    String(String),
    /// Value of a `:missing` modifier.
    Missing(bool),
}

/// A chained search, e.g. `subject:Patient.gender=female`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainedParam {
    pub target: ResourceType,
    pub param: String,
}

/// One occurrence of a search parameter.
///
/// `values` are OR-ed alternatives; separate occurrences are AND-ed.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchParam {
    pub name: String,
    pub modifier: Option<SearchModifier>,
    pub values: Vec<SearchValue>,
}

impl SearchParam {
    pub fn new(name: impl Into<String>, values: Vec<SearchValue>) -> Self {
        Self {
            name: name.into(),
            modifier: None,
            values,
        }
    }

    #[must_use]
    pub fn with_modifier(mut self, modifier: SearchModifier) -> Self {
        self.modifier = Some(modifier);
        self
    }

    /// Single token alternative with system and code.
    pub fn token(name: impl Into<String>, system: Option<&str>, code: &str) -> Self {
        Self::new(
            name,
            vec![SearchValue::Token {
                system: system.map(str::to_string),
                code: Some(code.to_string()),
            }],
        )
    }

    /// Reference alternatives pointing at `resource_type`.
    pub fn references(
        name: impl Into<String>,
        resource_type: ResourceType,
        ids: impl IntoIterator<Item = i64>,
    ) -> Self {
        Self::new(
            name,
            ids.into_iter()
                .map(|id| SearchValue::Reference {
                    resource_type: Some(resource_type),
                    id: id.to_string(),
                })
                .collect(),
        )
    }
}

/// Folds single-valued lower/upper date bounds of the same parameter into
/// one [`SearchValue::DateRange`]. Other parameters are returned unchanged,
/// in their original order.
pub fn merge_date_ranges(params: Vec<SearchParam>) -> Vec<SearchParam> {
    let mut merged: Vec<SearchParam> = Vec::with_capacity(params.len());
    for param in params {
        let bound = match param.values.as_slice() {
            [SearchValue::Date(bound)] if param.modifier.is_none() => Some(*bound),
            _ => None,
        };
        let Some(bound) = bound else {
            merged.push(param);
            continue;
        };
        let absorbed = merged
            .iter_mut()
            .filter(|p| p.name == param.name && p.modifier.is_none())
            .any(|target| combine(target, bound));
        if !absorbed {
            merged.push(param);
        }
    }
    merged
}

fn combine(target: &mut SearchParam, bound: DateBound) -> bool {
    let (mut lower, mut upper) = match target.values.as_slice() {
        [SearchValue::DateRange { lower, upper }] => (*lower, *upper),
        [SearchValue::Date(existing)] if existing.prefix.is_lower_bound() => (Some(*existing), None),
        [SearchValue::Date(existing)] if existing.prefix.is_upper_bound() => (None, Some(*existing)),
        _ => return false,
    };
    if bound.prefix.is_lower_bound() && lower.is_none() {
        lower = Some(bound);
    } else if bound.prefix.is_upper_bound() && upper.is_none() {
        upper = Some(bound);
    } else {
        return false;
    }
    target.values = vec![SearchValue::DateRange { lower, upper }];
    true
}

/// A search parameter a resource mapper understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamDefinition {
    pub name: &'static str,
    pub kind: SearchParameterType,
    /// Allowed reference targets; empty for non-reference parameters.
    pub targets: &'static [ResourceType],
}

impl ParamDefinition {
    pub const fn new(name: &'static str, kind: SearchParameterType) -> Self {
        Self {
            name,
            kind,
            targets: &[],
        }
    }

    pub const fn reference(name: &'static str, targets: &'static [ResourceType]) -> Self {
        Self {
            name,
            kind: SearchParameterType::Reference,
            targets,
        }
    }
}
