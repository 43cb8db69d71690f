//! Search orchestration.
//!
//! A search runs in fixed stages: parse the query, resolve chained
//! parameters, translate parameters to predicates per backing table, count,
//! fetch one page, map rows to resources, then resolve `_include` and
//! `_revinclude` with targeted follow-up reads. Count and page fetch use the
//! same predicate lists.

use std::collections::HashSet;

use futures_util::future::try_join_all;
use thiserror::Error;
use tracing::{debug, info};

use omopfhir_core::model::{Bundle, BundleEntry, BundleEntrySearch, BundleType, SearchEntryMode};
use omopfhir_core::{ExternalId, OmopTable, ResourceType};
use omopfhir_mapping::{DynMapper, MappedResource, MapperRegistry, MappingError, ParameterTranslation};
use omopfhir_search::{
    IncludeError, IncludeParam, ParseError, SearchParam, SearchParameterParser, SearchParameterType,
    chain_target, include_kind, merge_date_ranges, parse_include, to_search_param,
};
use omopfhir_storage::{Page, Predicate, SortSpec, StorageError};

use crate::config::SearchSettings;
use crate::service::FhirOmopService;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Include(#[from] IncludeError),

    #[error("Unsupported search parameter: {name}")]
    UnsupportedParameter { name: String },

    #[error(transparent)]
    Mapping(#[from] MappingError),
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        Self::Mapping(MappingError::Storage(err))
    }
}

impl EngineError {
    fn unsupported(name: impl Into<String>) -> Self {
        Self::UnsupportedParameter { name: name.into() }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Parse(_) | Self::Include(_) | Self::UnsupportedParameter { .. } => 400,
            Self::Mapping(err) => err.status_code(),
        }
    }
}

/// A chained parameter, e.g. `subject:Patient.gender=female`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainedSearch {
    /// Reference parameter on the searched type.
    pub name: String,
    pub target: ResourceType,
    /// Parameter evaluated against `target`.
    pub inner: SearchParam,
}

/// A parsed search against one resource type.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub resource_type: ResourceType,
    pub params: Vec<SearchParam>,
    pub chains: Vec<ChainedSearch>,
    pub count: u64,
    pub offset: u64,
    /// Sort keys by FHIR field name.
    pub sort: Vec<SortSpec>,
    pub includes: Vec<IncludeParam>,
}

impl SearchRequest {
    pub fn new(resource_type: ResourceType, count: u64) -> Self {
        Self {
            resource_type,
            params: Vec::new(),
            chains: Vec::new(),
            count,
            offset: 0,
            sort: Vec::new(),
            includes: Vec::new(),
        }
    }

    /// Parses `query` against the parameters the mapper for `resource_type`
    /// declares. Unknown parameters fail under `strict_parameters` and are
    /// dropped otherwise.
    pub fn from_query(
        registry: &MapperRegistry,
        settings: &SearchSettings,
        resource_type: ResourceType,
        query: &str,
    ) -> Result<Self, EngineError> {
        let mapper = registry.get(resource_type)?;
        let parsed = SearchParameterParser::parse_query(query);

        let mut request = Self::new(
            resource_type,
            parsed.count(settings.default_count, settings.max_count)?,
        );
        request.offset = parsed.offset()?;
        request.sort = parsed.sort()?;

        for raw in &parsed.params {
            let Some(reverse) = include_kind(&raw.name, raw.modifier.as_deref())? else {
                continue;
            };
            for value in &raw.values {
                let include = parse_include(value, reverse)?;
                check_include(registry, resource_type, &include)?;
                request.includes.push(include);
            }
        }

        let mut params = Vec::new();
        for raw in parsed.filters() {
            let Some(definition) = mapper.parameter(&raw.name) else {
                skip_unknown(settings, resource_type, &raw.name)?;
                continue;
            };
            let Some(chained) = chain_target(raw, definition)? else {
                params.push(to_search_param(raw, definition)?);
                continue;
            };
            let Some(inner) = raw.chained_inner() else {
                continue;
            };
            let target = registry.get(chained.target)?;
            let Some(inner_definition) = target.parameter(&inner.name) else {
                skip_unknown(settings, resource_type, &format!("{}.{}", raw.name, inner.name))?;
                continue;
            };
            request.chains.push(ChainedSearch {
                name: raw.name.clone(),
                target: chained.target,
                inner: to_search_param(&inner, inner_definition)?,
            });
        }
        request.params = merge_date_ranges(params);
        Ok(request)
    }
}

fn skip_unknown(settings: &SearchSettings, resource_type: ResourceType, name: &str) -> Result<(), EngineError> {
    if settings.strict_parameters {
        return Err(EngineError::unsupported(name));
    }
    debug!(resource_type = %resource_type, param = name, "ignoring unknown search parameter");
    Ok(())
}

/// `_include` must name a reference parameter of the searched type;
/// `_revinclude` one that can point at it.
fn check_include(
    registry: &MapperRegistry,
    resource_type: ResourceType,
    include: &IncludeParam,
) -> Result<(), EngineError> {
    if !include.reverse && include.source_type != resource_type {
        return Err(IncludeError::InvalidInclude(format!(
            "{}:{} does not apply to {resource_type}",
            include.source_type, include.search_param
        ))
        .into());
    }
    let source = registry.get(include.source_type)?;
    let valid = source.parameter(&include.search_param).is_some_and(|definition| {
        definition.kind == SearchParameterType::Reference
            && (!include.reverse
                || definition.targets.is_empty()
                || definition.targets.contains(&resource_type))
    });
    if !valid {
        return Err(IncludeError::InvalidInclude(format!(
            "{}:{} is not a reference to {resource_type}",
            include.source_type, include.search_param
        ))
        .into());
    }
    Ok(())
}

/// Matches and included resources of one search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchOutcome {
    /// Matches across every page.
    pub total: u64,
    pub matches: Vec<MappedResource>,
    pub included: Vec<MappedResource>,
}

impl SearchOutcome {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> Vec<ExternalId> {
        self.matches.iter().map(|m| m.id).collect()
    }

    pub fn to_bundle(&self) -> Result<Bundle, MappingError> {
        let mut bundle = Bundle::new(BundleType::Searchset);
        bundle.total = Some(self.total);
        let entries = self
            .matches
            .iter()
            .map(|r| (r, SearchEntryMode::Match))
            .chain(self.included.iter().map(|r| (r, SearchEntryMode::Include)));
        for (mapped, mode) in entries {
            bundle.entry.push(BundleEntry {
                full_url: Some(mapped.id.to_reference()),
                resource: Some(mapped.resource.to_value()?),
                search: Some(BundleEntrySearch { mode }),
                ..Default::default()
            });
        }
        Ok(bundle)
    }
}

/// Predicates and ordering for one backing table.
#[derive(Debug)]
struct TablePlan {
    table: OmopTable,
    predicates: Vec<Predicate>,
    sort: Vec<SortSpec>,
}

#[derive(Debug, Clone)]
pub struct SearchEngine {
    service: FhirOmopService,
    settings: SearchSettings,
}

impl SearchEngine {
    pub fn new(service: FhirOmopService, settings: SearchSettings) -> Self {
        Self { service, settings }
    }

    pub fn service(&self) -> &FhirOmopService {
        &self.service
    }

    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    pub fn request(&self, resource_type: ResourceType, query: &str) -> Result<SearchRequest, EngineError> {
        SearchRequest::from_query(self.service.registry(), &self.settings, resource_type, query)
    }

    pub async fn search_query(
        &self,
        resource_type: ResourceType,
        query: &str,
    ) -> Result<SearchOutcome, EngineError> {
        let request = self.request(resource_type, query)?;
        self.search(&request).await
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchOutcome, EngineError> {
        let mapper = self.service.registry().get(request.resource_type)?;
        let storage = self.service.storage();

        let mut params = request.params.clone();
        for chain in &request.chains {
            let ids = self.matching_ids(chain.target, std::slice::from_ref(&chain.inner)).await?;
            if ids.is_empty() {
                debug!(param = %chain.name, target = %chain.target, "chained search matched nothing");
                return Ok(SearchOutcome::empty());
            }
            params.push(SearchParam::references(&chain.name, chain.target, ids));
        }

        let plans = self
            .plan(mapper, &params, &request.sort, self.settings.strict_parameters)
            .await?;
        let counts = try_join_all(
            plans
                .iter()
                .map(|plan| storage.count(plan.table, &plan.predicates)),
        )
        .await?;
        let total: u64 = counts.iter().sum();

        // The page runs over the tables in binding order.
        let mut skip = request.offset;
        let mut remaining = request.count;
        let mut matches = Vec::new();
        for (plan, count) in plans.iter().zip(counts) {
            if remaining == 0 {
                break;
            }
            if skip >= count {
                skip -= count;
                continue;
            }
            let page = Page::new(skip, remaining.min(count - skip));
            skip = 0;
            let rows = storage
                .search(plan.table, &plan.predicates, page, &plan.sort)
                .await?;
            remaining = remaining.saturating_sub(rows.len() as u64);
            for row in rows {
                matches.push(mapper.to_resource(row.internal_id(), &row).await?);
            }
        }

        let included = self.resolve_includes(request, &matches).await?;
        info!(
            resource_type = %request.resource_type,
            total,
            offset = request.offset,
            matches = matches.len(),
            included = included.len(),
            "search completed"
        );
        Ok(SearchOutcome {
            total,
            matches,
            included,
        })
    }

    async fn plan(
        &self,
        mapper: &DynMapper,
        params: &[SearchParam],
        sort: &[SortSpec],
        strict: bool,
    ) -> Result<Vec<TablePlan>, EngineError> {
        let binding = mapper.binding();
        let mut plans = Vec::new();
        for table in binding.tables() {
            let mut predicates = mapper.default_predicates(table);
            for param in params {
                match mapper.to_predicates(table, param, false).await? {
                    ParameterTranslation::Predicates(translated) => predicates.extend(translated),
                    ParameterTranslation::Unsupported if strict => {
                        return Err(EngineError::unsupported(&param.name));
                    }
                    ParameterTranslation::Unsupported => {
                        debug!(table = %table, param = %param.name, "dropping untranslatable parameter");
                    }
                }
            }
            let mut order = Vec::with_capacity(sort.len());
            for key in sort {
                let column = mapper
                    .sort_column(table, &key.column)
                    .ok_or_else(|| EngineError::unsupported(format!("_sort={}", key.column)))?;
                order.push(SortSpec {
                    column: column.to_string(),
                    direction: key.direction,
                });
            }
            plans.push(TablePlan {
                table,
                predicates,
                sort: order,
            });
        }
        Ok(plans)
    }

    /// External ids of every `resource_type` row matching `params`.
    async fn matching_ids(
        &self,
        resource_type: ResourceType,
        params: &[SearchParam],
    ) -> Result<Vec<i64>, EngineError> {
        let mapper = self.service.registry().get(resource_type)?;
        let mut ids = Vec::new();
        for plan in self.plan(mapper, params, &[], true).await? {
            let rows = self
                .service
                .storage()
                .search(plan.table, &plan.predicates, Page::from_offset(0), &[])
                .await?;
            ids.extend(
                rows.iter()
                    .filter_map(|row| self.service.ids().to_external(&row.internal_id(), resource_type))
                    .map(|id| id.id),
            );
        }
        Ok(ids)
    }

    async fn resolve_includes(
        &self,
        request: &SearchRequest,
        matches: &[MappedResource],
    ) -> Result<Vec<MappedResource>, EngineError> {
        let mut seen: HashSet<ExternalId> = matches.iter().map(|m| m.id).collect();
        let mut included = Vec::new();
        if matches.is_empty() {
            return Ok(included);
        }

        for include in &request.includes {
            if include.reverse {
                let source = self.service.registry().get(include.source_type)?;
                let param = SearchParam::references(
                    &include.search_param,
                    request.resource_type,
                    matches.iter().map(|m| m.id.id),
                );
                for plan in self.plan(source, &[param], &[], true).await? {
                    let rows = self
                        .service
                        .storage()
                        .search(plan.table, &plan.predicates, Page::from_offset(0), &[])
                        .await?;
                    for row in rows {
                        let mapped = source.to_resource(row.internal_id(), &row).await?;
                        if seen.insert(mapped.id) {
                            included.push(mapped);
                        }
                    }
                }
                continue;
            }

            let targets: Vec<ExternalId> = matches
                .iter()
                .flat_map(|m| m.references_for(&include.search_param))
                .filter(|target| include.target_type.is_none_or(|rt| target.resource_type == rt))
                .copied()
                .collect();
            for target in targets {
                if !seen.insert(target) {
                    continue;
                }
                match self.service.read_external(target).await? {
                    Some(mapped) => included.push(mapped),
                    None => debug!(reference = %target, "included resource not found"),
                }
            }
        }
        Ok(included)
    }
}
