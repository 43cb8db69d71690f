//! Batch and transaction bundles.
//!
//! Entries run in dependency order: an entry referencing another entry's
//! `fullUrl` (or `Type/clientId`) runs after it, and the reference is
//! rewritten to the id the earlier write produced. Ties keep submission
//! order. Responses are always returned in submission order.
//!
//! A `batch` gives every entry its own outcome. A `transaction` stops at the
//! first failure and undoes every write it already made.

use std::collections::{BTreeSet, HashMap};

use indexmap::IndexMap;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use omopfhir_core::fhir_reference::is_urn_uuid;
use omopfhir_core::id::parse_external;
use omopfhir_core::model::{
    Bundle, BundleEntry, BundleEntryResponse, BundleType, FhirResource, HttpVerb,
};
use omopfhir_core::{ExternalId, ResourceType, UnresolvableReference, parse_reference};
use omopfhir_mapping::MappingError;

use crate::engine::{EngineError, SearchEngine};
use crate::service::{FhirOmopService, WriteJournal};

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("Bundle type {0:?} cannot be processed; expected batch or transaction")]
    UnsupportedType(BundleType),

    #[error("Duplicate fullUrl in bundle: {0}")]
    DuplicateFullUrl(String),

    #[error("Transaction failed at entry {index}: {source}")]
    TransactionFailed {
        index: usize,
        #[source]
        source: MappingError,
    },
}

impl BundleError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::UnsupportedType(_) | Self::DuplicateFullUrl(_) => 400,
            Self::TransactionFailed { source, .. } => source.status_code(),
        }
    }
}

/// What one entry asks for.
#[derive(Debug, Clone, PartialEq)]
enum Operation {
    Create(ResourceType),
    Update(ResourceType, String),
    Delete(ResourceType, String),
    Read(ResourceType, String),
    Search(ResourceType, String),
}

#[derive(Debug)]
struct PlannedEntry {
    /// `None` when the entry was rejected while planning.
    operation: Option<Operation>,
    resource: Option<Value>,
    /// Entries this one references.
    dependencies: Vec<usize>,
}

#[derive(Debug)]
struct EntryOutcome {
    response: BundleEntry,
    created: Option<ExternalId>,
    journal: Option<WriteJournal>,
}

#[derive(Debug, Clone)]
pub struct BundleProcessor {
    engine: SearchEngine,
    base_url: Option<String>,
}

impl BundleProcessor {
    pub fn new(engine: SearchEngine, base_url: Option<String>) -> Self {
        Self { engine, base_url }
    }

    fn service(&self) -> &FhirOmopService {
        self.engine.service()
    }

    pub async fn process(&self, bundle: &Bundle) -> Result<Bundle, BundleError> {
        let atomic = match bundle.kind {
            BundleType::Batch => false,
            BundleType::Transaction => true,
            other => return Err(BundleError::UnsupportedType(other)),
        };
        let span = info_span!(
            "bundle",
            bundle_id = %Uuid::new_v4(),
            kind = ?bundle.kind,
            entries = bundle.entry.len()
        );
        self.run(bundle, atomic).instrument(span).await
    }

    async fn run(&self, bundle: &Bundle, atomic: bool) -> Result<Bundle, BundleError> {
        let synthetic = synthetic_ids(bundle)?;
        let mut planned = Vec::with_capacity(bundle.entry.len());
        let mut results: Vec<Option<Result<BundleEntry, MappingError>>> =
            Vec::with_capacity(bundle.entry.len());
        for (index, entry) in bundle.entry.iter().enumerate() {
            let (plan, rejected) = self.plan_entry(index, entry, &synthetic);
            planned.push(plan);
            results.push(rejected.map(Err));
        }

        let dependencies: Vec<Vec<usize>> = planned.iter().map(|p| p.dependencies.clone()).collect();
        let (order, cyclic) = dependency_order(&dependencies);
        for index in cyclic {
            if results[index].is_none() {
                results[index] = Some(Err(MappingError::validation(
                    "reference",
                    "entry is part of a circular reference between bundle entries",
                )));
            }
        }
        // Entries that cannot run fail a transaction before any write.
        if atomic
            && let Some(index) = results.iter().position(Option::is_some)
            && let Some(Err(source)) = results[index].take()
        {
            warn!(index, error = %source, "transaction rejected");
            return Err(BundleError::TransactionFailed { index, source });
        }

        let mut resolved: HashMap<usize, ExternalId> = HashMap::new();
        let mut journals: Vec<WriteJournal> = Vec::new();
        for index in order {
            let Some(operation) = planned[index].operation.clone() else {
                continue;
            };
            match self
                .execute(operation, &planned[index], &synthetic, &resolved)
                .await
            {
                Ok(outcome) => {
                    if let Some(id) = outcome.created {
                        resolved.insert(index, id);
                    }
                    journals.extend(outcome.journal);
                    results[index] = Some(Ok(outcome.response));
                }
                Err(source) if atomic => {
                    warn!(index, error = %source, "transaction failed, rolling back");
                    self.roll_back(journals).await;
                    return Err(BundleError::TransactionFailed { index, source });
                }
                Err(err) => {
                    debug!(index, error = %err, "batch entry failed");
                    results[index] = Some(Err(err));
                }
            }
        }

        let kind = if atomic {
            BundleType::TransactionResponse
        } else {
            BundleType::BatchResponse
        };
        let mut response = Bundle::new(kind);
        let mut failed = 0;
        for result in results {
            response.entry.push(match result {
                Some(Ok(entry)) => entry,
                Some(Err(err)) => {
                    failed += 1;
                    error_entry(&err)
                }
                None => error_entry(&MappingError::validation("request", "entry was not processed")),
            });
        }
        info!(entries = response.entry.len(), failed, "bundle processed");
        Ok(response)
    }

    /// Splits an entry into its operation and dependencies, or the reason it
    /// cannot run.
    fn plan_entry(
        &self,
        index: usize,
        entry: &BundleEntry,
        synthetic: &IndexMap<String, usize>,
    ) -> (PlannedEntry, Option<MappingError>) {
        let mut dependencies = Vec::new();
        if let Some(resource) = &entry.resource {
            let mut references = Vec::new();
            collect_references(resource, &mut references);
            dependencies.extend(
                references
                    .iter()
                    .filter_map(|reference| synthetic.get(*reference).copied())
                    .filter(|&target| target != index),
            );
            dependencies.sort_unstable();
            dependencies.dedup();
        }
        let operation = match entry.full_url.as_deref() {
            Some(url) if url.starts_with("urn:uuid:") && !is_urn_uuid(url) => Err(
                MappingError::validation("fullUrl", format!("malformed urn:uuid {url}")),
            ),
            _ => parse_request(entry, self.base_url.as_deref()),
        };
        let (operation, rejected) = match operation {
            Ok(operation) => (Some(operation), None),
            Err(err) => (None, Some(err)),
        };
        let plan = PlannedEntry {
            operation,
            resource: entry.resource.clone(),
            dependencies,
        };
        (plan, rejected)
    }

    async fn execute(
        &self,
        operation: Operation,
        entry: &PlannedEntry,
        synthetic: &IndexMap<String, usize>,
        resolved: &HashMap<usize, ExternalId>,
    ) -> Result<EntryOutcome, MappingError> {
        let service = self.service();
        match operation {
            Operation::Create(resource_type) => {
                let resource = self.prepare(entry, resource_type, synthetic, resolved).await?;
                let outcome = service.create(&resource).await?;
                let location = outcome.resource.id.to_reference();
                Ok(EntryOutcome {
                    response: BundleEntry {
                        full_url: Some(location.clone()),
                        resource: Some(outcome.resource.resource.to_value()?),
                        response: Some(response("201 Created", Some(location))),
                        ..Default::default()
                    },
                    created: Some(outcome.resource.id),
                    journal: Some(outcome.journal),
                })
            }
            Operation::Update(resource_type, id) => {
                let resource = self.prepare(entry, resource_type, synthetic, resolved).await?;
                let outcome = service.update(resource_type, &id, &resource).await?;
                let location = outcome.resource.id.to_reference();
                Ok(EntryOutcome {
                    response: BundleEntry {
                        full_url: Some(location.clone()),
                        resource: Some(outcome.resource.resource.to_value()?),
                        response: Some(response("200 OK", Some(location))),
                        ..Default::default()
                    },
                    created: None,
                    journal: Some(outcome.journal),
                })
            }
            Operation::Delete(resource_type, id) => {
                let journal = service.delete(resource_type, &id).await?;
                Ok(EntryOutcome {
                    response: BundleEntry {
                        response: Some(response("204 No Content", None)),
                        ..Default::default()
                    },
                    created: None,
                    journal: Some(journal),
                })
            }
            Operation::Read(resource_type, id) => {
                let mapped = service.read(resource_type, &id).await?;
                Ok(EntryOutcome {
                    response: BundleEntry {
                        full_url: Some(mapped.id.to_reference()),
                        resource: Some(mapped.resource.to_value()?),
                        response: Some(response("200 OK", None)),
                        ..Default::default()
                    },
                    created: None,
                    journal: None,
                })
            }
            Operation::Search(resource_type, query) => {
                let outcome = self
                    .engine
                    .search_query(resource_type, &query)
                    .await
                    .map_err(search_failure)?;
                let searchset = serde_json::to_value(outcome.to_bundle()?)
                    .map_err(|err| MappingError::validation("resource", err.to_string()))?;
                Ok(EntryOutcome {
                    response: BundleEntry {
                        resource: Some(searchset),
                        response: Some(response("200 OK", None)),
                        ..Default::default()
                    },
                    created: None,
                    journal: None,
                })
            }
        }
    }

    /// The entry's resource with in-bundle references rewritten and every
    /// other local reference checked against storage.
    async fn prepare(
        &self,
        entry: &PlannedEntry,
        resource_type: ResourceType,
        synthetic: &IndexMap<String, usize>,
        resolved: &HashMap<usize, ExternalId>,
    ) -> Result<FhirResource, MappingError> {
        let mut value = entry
            .resource
            .clone()
            .ok_or_else(|| MappingError::missing("resource"))?;

        let mut references = Vec::new();
        collect_references_mut(&mut value, &mut references);
        for reference in references {
            if let Some(target) = synthetic.get(reference.as_str()) {
                let id = resolved
                    .get(target)
                    .ok_or_else(|| MappingError::unresolvable_reference(reference.as_str()))?;
                debug!(from = %reference, to = %id, "rewriting bundle reference");
                *reference = id.to_reference();
                continue;
            }
            self.check_stored(reference).await?;
        }

        let resource = FhirResource::from_value(value)?;
        if resource.resource_type() != resource_type {
            return Err(MappingError::validation(
                "resourceType",
                format!("request url names {resource_type}, body is {}", resource.resource_type()),
            ));
        }
        Ok(resource)
    }

    /// Fails when a local reference names a resource that does not exist.
    async fn check_stored(&self, reference: &str) -> Result<(), MappingError> {
        match parse_reference(reference, self.base_url.as_deref()) {
            Ok(parsed) => {
                let Ok(resource_type) = parsed.resource_type.parse::<ResourceType>() else {
                    return Ok(());
                };
                let exists = match parse_external(resource_type, &parsed.id) {
                    Some(id) => self.service().exists(id).await?,
                    None => false,
                };
                if exists {
                    Ok(())
                } else {
                    Err(MappingError::unresolvable_reference(reference))
                }
            }
            Err(UnresolvableReference::Urn(urn)) => Err(MappingError::unresolvable_reference(urn)),
            // contained and foreign references are left to the mapper
            Err(_) => Ok(()),
        }
    }

    async fn roll_back(&self, journals: Vec<WriteJournal>) {
        let storage = self.service().storage();
        for journal in journals.into_iter().rev() {
            if let Err(err) = journal.undo(storage.as_ref()).await {
                error!(error = %err, "rollback step failed");
            }
        }
    }
}

fn search_failure(err: EngineError) -> MappingError {
    match err {
        EngineError::Mapping(err) => err,
        other => MappingError::validation("request.url", other.to_string()),
    }
}

/// Keys under which later entries may reference a created resource: its
/// `fullUrl` and, when the body carries a non-numeric client id,
/// `Type/clientId`. Numeric ids name existing rows.
fn synthetic_ids(bundle: &Bundle) -> Result<IndexMap<String, usize>, BundleError> {
    let mut synthetic = IndexMap::new();
    for (index, entry) in bundle.entry.iter().enumerate() {
        if let Some(full_url) = &entry.full_url
            && synthetic.insert(full_url.clone(), index).is_some()
        {
            return Err(BundleError::DuplicateFullUrl(full_url.clone()));
        }
        let creates = entry
            .request
            .as_ref()
            .is_some_and(|request| request.method == HttpVerb::Post);
        let client_id = entry.resource.as_ref().and_then(|resource| {
            let id = resource.get("id")?.as_str()?;
            if id.parse::<i64>().is_ok() {
                return None;
            }
            Some(format!("{}/{id}", resource.get("resourceType")?.as_str()?))
        });
        if let (true, Some(key)) = (creates, client_id)
            && synthetic.insert(key.clone(), index).is_some()
        {
            return Err(BundleError::DuplicateFullUrl(key));
        }
    }
    Ok(synthetic)
}

fn parse_request(entry: &BundleEntry, base_url: Option<&str>) -> Result<Operation, MappingError> {
    let request = entry
        .request
        .as_ref()
        .ok_or_else(|| MappingError::missing("request"))?;
    let mut url = request.url.trim();
    if let Some(base) = base_url
        && let Some(relative) = url.strip_prefix(base)
    {
        url = relative;
    }
    let url = url.trim_start_matches('/');
    let (path, query) = match url.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (url, None),
    };
    let invalid = || MappingError::validation("request.url", format!("unsupported request url {url}"));
    let segments: Vec<&str> = path.split('/').collect();
    let resource_type: ResourceType = segments[0].parse().map_err(|_| invalid())?;

    match (request.method, segments.as_slice(), query) {
        (HttpVerb::Post, [_], None) => Ok(Operation::Create(resource_type)),
        (HttpVerb::Put, [_, id], None) => Ok(Operation::Update(resource_type, id.to_string())),
        (HttpVerb::Delete, [_, id], None) => Ok(Operation::Delete(resource_type, id.to_string())),
        (HttpVerb::Get, [_, id], None) => Ok(Operation::Read(resource_type, id.to_string())),
        (HttpVerb::Get, [_], query) => Ok(Operation::Search(
            resource_type,
            query.unwrap_or_default().to_string(),
        )),
        (_, _, Some(_)) => Err(MappingError::validation(
            "request.url",
            "conditional requests are not supported",
        )),
        _ => Err(invalid()),
    }
}

/// Stable topological order over entry dependencies. Returns the order and
/// the entries that never became ready because of a cycle.
fn dependency_order(dependencies: &[Vec<usize>]) -> (Vec<usize>, Vec<usize>) {
    let mut pending: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut dependents = vec![Vec::new(); dependencies.len()];
    for (index, targets) in dependencies.iter().enumerate() {
        for &target in targets {
            dependents[target].push(index);
        }
    }

    let mut ready: BTreeSet<usize> = (0..pending.len()).filter(|&i| pending[i] == 0).collect();
    let mut order = Vec::with_capacity(pending.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }
    let blocked = (0..pending.len()).filter(|&i| pending[i] > 0).collect();
    (order, blocked)
}

fn collect_references<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                match child {
                    Value::String(reference) if key == "reference" => out.push(reference),
                    other => collect_references(other, out),
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_references(item, out)),
        _ => {}
    }
}

fn collect_references_mut<'a>(value: &'a mut Value, out: &mut Vec<&'a mut String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if key == "reference"
                    && let Value::String(reference) = child
                {
                    out.push(reference);
                    continue;
                }
                collect_references_mut(child, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references_mut(item, out);
            }
        }
        _ => {}
    }
}

fn response(status: &str, location: Option<String>) -> BundleEntryResponse {
    BundleEntryResponse {
        status: status.to_string(),
        location,
        outcome: None,
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        404 => "Not Found",
        409 => "Conflict",
        422 => "Unprocessable Entity",
        424 => "Failed Dependency",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}

fn issue_code(status: u16) -> &'static str {
    match status {
        400 => "invalid",
        404 | 424 => "not-found",
        409 => "conflict",
        422 => "code-invalid",
        503 => "transient",
        _ => "exception",
    }
}

fn error_entry(err: &MappingError) -> BundleEntry {
    let status = err.status_code();
    BundleEntry {
        response: Some(BundleEntryResponse {
            status: format!("{status} {}", reason_phrase(status)),
            location: None,
            outcome: Some(json!({
                "resourceType": "OperationOutcome",
                "issue": [{
                    "severity": "error",
                    "code": issue_code(status),
                    "diagnostics": err.to_string()
                }]
            })),
        }),
        ..Default::default()
    }
}
