//! Code system translation between FHIR codings and OMOP concepts.
//!
//! Lookups go through two tiers:
//! 1. an in-process `DashMap` cache keyed by `(vocabulary_id, code)`,
//!    holding misses as well as hits
//! 2. the [`ConceptStore`] backing the vocabulary tables
//!
//! Concept rows are reference data, so concurrent misses on the same key may
//! both reach the store; they write the same value and the cache converges.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use omopfhir_core::model::{CodeableConcept, Coding};
use omopfhir_storage::{Concept, DynConceptStore, NO_MATCHING_CONCEPT, StorageError, escape_like};

/// A FHIR code system URI paired with the OMOP vocabulary id it maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VocabularyEntry {
    pub vocabulary_id: &'static str,
    pub system_uri: &'static str,
}

const fn entry(vocabulary_id: &'static str, system_uri: &'static str) -> VocabularyEntry {
    VocabularyEntry {
        vocabulary_id,
        system_uri,
    }
}

/// Known vocabularies. Table position breaks ties between equally
/// preferred vocabularies.
pub const VOCABULARY_TABLE: &[VocabularyEntry] = &[
    entry("SNOMED", "http://snomed.info/sct"),
    entry("LOINC", "http://loinc.org"),
    entry("RxNorm", "http://www.nlm.nih.gov/research/umls/rxnorm"),
    entry("ICD10CM", "http://hl7.org/fhir/sid/icd-10-cm"),
    entry("ICD9CM", "http://hl7.org/fhir/sid/icd-9-cm"),
    entry("CPT4", "http://www.ama-assn.org/go/cpt"),
    entry("NDC", "http://hl7.org/fhir/sid/ndc"),
    entry("UCUM", "http://unitsofmeasure.org"),
    entry("CVX", "http://hl7.org/fhir/sid/cvx"),
    entry("Gender", "http://hl7.org/fhir/administrative-gender"),
    entry("Visit", "http://terminology.hl7.org/CodeSystem/v3-ActCode"),
    entry("Race", "urn:oid:2.16.840.1.113883.6.238"),
];

/// Outcome of a concept lookup. Both misses are ordinary results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConceptLookup {
    Found(Concept),
    /// The system or vocabulary is not in [`VOCABULARY_TABLE`].
    UnknownVocabulary,
    /// The vocabulary is known but has no such code.
    UnknownCode,
}

impl ConceptLookup {
    pub fn concept(&self) -> Option<&Concept> {
        match self {
            Self::Found(concept) => Some(concept),
            _ => None,
        }
    }
}

/// Raw `(system, code, display)` kept verbatim in a `*_source_value` column.
///
/// Encoded as `system^code^display`; empty segments are allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceValue {
    pub system: String,
    pub code: String,
    pub display: String,
}

impl SourceValue {
    pub const SEPARATOR: char = '^';

    pub fn from_coding(coding: &Coding) -> Self {
        Self {
            system: coding.system.clone().unwrap_or_default(),
            code: coding.code.clone().unwrap_or_default(),
            display: coding.display.clone().unwrap_or_default(),
        }
    }

    /// Text-only concept: system and code are empty.
    pub fn text(display: impl Into<String>) -> Self {
        Self {
            display: display.into(),
            ..Self::default()
        }
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Inverse of [`SourceValue::encode`]. Values written by other tools
    /// (no separator) are read as a bare code.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        let mut parts = raw.splitn(3, Self::SEPARATOR);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(system), Some(code), Some(display)) => Some(Self {
                system: system.to_string(),
                code: code.to_string(),
                display: display.to_string(),
            }),
            _ => Some(Self {
                code: raw.to_string(),
                ..Self::default()
            }),
        }
    }

    /// The coding this value was captured from, or `None` for text-only values.
    pub fn to_coding(&self) -> Option<Coding> {
        if self.code.is_empty() {
            return None;
        }
        Some(Coding {
            system: (!self.system.is_empty()).then(|| self.system.clone()),
            code: Some(self.code.clone()),
            display: (!self.display.is_empty()).then(|| self.display.clone()),
        })
    }

    /// `LIKE` pattern matching stored values with this system and code.
    /// A missing segment matches anything; given segments match literally.
    pub fn like_pattern(system: Option<&str>, code: Option<&str>) -> String {
        let segment = |value: Option<&str>| value.map_or_else(|| "%".to_string(), escape_like);
        format!("{}^{}^%", segment(system), segment(code))
    }
}

impl fmt::Display for SourceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}^{}^{}", self.system, self.code, self.display)
    }
}

/// Result of translating a CodeableConcept for storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeResolution {
    /// A concept was found; `source` records the coding that produced it.
    Resolved { concept: Concept, source: SourceValue },
    /// Nothing resolved; the first coding (or the text) is kept verbatim.
    Unresolved(SourceValue),
}

impl CodeResolution {
    /// Concept id to store, `0` when unresolved.
    pub fn concept_id(&self) -> i64 {
        match self {
            Self::Resolved { concept, .. } => concept.concept_id,
            Self::Unresolved(_) => NO_MATCHING_CONCEPT,
        }
    }

    pub fn source(&self) -> &SourceValue {
        match self {
            Self::Resolved { source, .. } | Self::Unresolved(source) => source,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved { .. })
    }
}

/// Translates FHIR codings to OMOP concepts and back.
pub struct VocabularyTranslator {
    concepts: DynConceptStore,
    preferred: Vec<String>,
    by_code: DashMap<(String, String), Option<Concept>>,
    by_id: DashMap<i64, Option<Concept>>,
}

impl fmt::Debug for VocabularyTranslator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VocabularyTranslator")
            .field("preferred", &self.preferred)
            .field("cached_codes", &self.by_code.len())
            .field("cached_ids", &self.by_id.len())
            .finish()
    }
}

impl VocabularyTranslator {
    pub fn new(concepts: DynConceptStore, preferred_vocabularies: Vec<String>) -> Self {
        Self {
            concepts,
            preferred: preferred_vocabularies,
            by_code: DashMap::new(),
            by_id: DashMap::new(),
        }
    }

    pub fn shared(concepts: DynConceptStore, preferred_vocabularies: Vec<String>) -> Arc<Self> {
        Arc::new(Self::new(concepts, preferred_vocabularies))
    }

    pub fn system_uri_to_vocabulary(&self, uri: &str) -> Option<&'static str> {
        let uri = uri.trim_end_matches('/');
        VOCABULARY_TABLE
            .iter()
            .find(|e| e.system_uri == uri)
            .map(|e| e.vocabulary_id)
    }

    pub fn vocabulary_to_system_uri(&self, vocabulary_id: &str) -> Option<&'static str> {
        VOCABULARY_TABLE
            .iter()
            .find(|e| e.vocabulary_id == vocabulary_id)
            .map(|e| e.system_uri)
    }

    /// Looks up `(vocabulary_id, code)`, consulting the cache first.
    pub async fn resolve_concept(
        &self,
        vocabulary_id: &str,
        code: &str,
    ) -> Result<ConceptLookup, StorageError> {
        if self.vocabulary_to_system_uri(vocabulary_id).is_none() {
            return Ok(ConceptLookup::UnknownVocabulary);
        }
        let key = (vocabulary_id.to_string(), code.to_string());
        if let Some(cached) = self.by_code.get(&key) {
            return Ok(Self::lookup_of(cached.value().clone()));
        }

        let fetched = self.concepts.find_concept(vocabulary_id, code).await?;
        if let Some(concept) = &fetched {
            self.by_id.insert(concept.concept_id, Some(concept.clone()));
        }
        debug!(vocabulary_id, code, found = fetched.is_some(), "concept cache fill");
        self.by_code.insert(key, fetched.clone());
        Ok(Self::lookup_of(fetched))
    }

    fn lookup_of(cached: Option<Concept>) -> ConceptLookup {
        match cached {
            Some(concept) => ConceptLookup::Found(concept),
            None => ConceptLookup::UnknownCode,
        }
    }

    /// Looks up a coding by system URI.
    pub async fn resolve_system_code(
        &self,
        system: &str,
        code: &str,
    ) -> Result<ConceptLookup, StorageError> {
        match self.system_uri_to_vocabulary(system) {
            Some(vocabulary_id) => self.resolve_concept(vocabulary_id, code).await,
            None => Ok(ConceptLookup::UnknownVocabulary),
        }
    }

    /// Concept row for an internal id. `0` never resolves.
    pub async fn concept_by_id(&self, concept_id: i64) -> Result<Option<Concept>, StorageError> {
        if concept_id == NO_MATCHING_CONCEPT {
            return Ok(None);
        }
        if let Some(cached) = self.by_id.get(&concept_id) {
            return Ok(cached.value().clone());
        }
        let fetched = self.concepts.concept_by_id(concept_id).await?;
        self.by_id.insert(concept_id, fetched.clone());
        Ok(fetched)
    }

    /// External coding for a concept row. Vocabularies without a system URI
    /// produce a coding without `system`.
    pub fn resolve_coding(&self, concept: &Concept) -> Coding {
        Coding {
            system: self
                .vocabulary_to_system_uri(&concept.vocabulary_id)
                .map(str::to_string),
            code: Some(concept.concept_code.clone()),
            display: Some(concept.concept_name.clone()),
        }
    }

    /// Renders a stored concept column, falling back to the source value
    /// when the concept is `0` or unknown.
    pub async fn coding_for(
        &self,
        concept_id: i64,
        source_value: Option<&str>,
    ) -> Result<Option<Coding>, StorageError> {
        if let Some(concept) = self.concept_by_id(concept_id).await? {
            return Ok(Some(self.resolve_coding(&concept)));
        }
        Ok(source_value
            .and_then(SourceValue::parse)
            .and_then(|sv| sv.to_coding()))
    }

    /// Same as [`Self::coding_for`], wrapped in a CodeableConcept. Text-only
    /// source values come back as `text`.
    pub async fn codeable_concept_for(
        &self,
        concept_id: i64,
        source_value: Option<&str>,
    ) -> Result<Option<CodeableConcept>, StorageError> {
        if let Some(coding) = self.coding_for(concept_id, source_value).await? {
            return Ok(Some(CodeableConcept::from_coding(coding)));
        }
        Ok(source_value
            .and_then(SourceValue::parse)
            .filter(|sv| !sv.display.is_empty())
            .map(|sv| CodeableConcept {
                coding: Vec::new(),
                text: Some(sv.display),
            }))
    }

    /// Picks one concept for a CodeableConcept.
    ///
    /// Among the codings that resolve, the winner has the lowest
    /// `(preference rank, table position, concept_id)`, where preference rank
    /// is the position in the configured preferred vocabularies. The order of
    /// codings in the input never matters. When nothing resolves, the first
    /// coding is kept as a [`SourceValue`]. Returns `None` for an empty
    /// concept.
    pub async fn resolve_codeable_concept(
        &self,
        concept: &CodeableConcept,
    ) -> Result<Option<CodeResolution>, StorageError> {
        let mut best: Option<((usize, usize, i64), Concept, SourceValue)> = None;

        for coding in &concept.coding {
            let (Some(system), Some(code)) = (coding.system.as_deref(), coding.code.as_deref())
            else {
                continue;
            };
            let found = match self.resolve_system_code(system, code).await? {
                ConceptLookup::Found(found) => found,
                ConceptLookup::UnknownVocabulary => {
                    warn!(system, code, "unknown code system, keeping source value");
                    continue;
                }
                ConceptLookup::UnknownCode => {
                    debug!(system, code, "code not in vocabulary");
                    continue;
                }
            };
            let rank = self.rank(&found);
            if best.as_ref().is_none_or(|(current, ..)| rank < *current) {
                best = Some((rank, found, SourceValue::from_coding(coding)));
            }
        }

        if let Some((_, concept, source)) = best {
            return Ok(Some(CodeResolution::Resolved { concept, source }));
        }
        if let Some(first) = concept.coding.first() {
            return Ok(Some(CodeResolution::Unresolved(SourceValue::from_coding(first))));
        }
        Ok(concept
            .text
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(|t| CodeResolution::Unresolved(SourceValue::text(t))))
    }

    fn rank(&self, concept: &Concept) -> (usize, usize, i64) {
        let preferred = self
            .preferred
            .iter()
            .position(|v| *v == concept.vocabulary_id)
            .unwrap_or(usize::MAX);
        let position = VOCABULARY_TABLE
            .iter()
            .position(|e| e.vocabulary_id == concept.vocabulary_id)
            .unwrap_or(usize::MAX);
        (preferred, position, concept.concept_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omopfhir_db_memory::InMemoryOmopStore;
    use omopfhir_db_memory::fixtures::{ICD10CM_TYPE_2_DIABETES, SNOMED_TYPE_2_DIABETES};

    const SNOMED: &str = "http://snomed.info/sct";
    const ICD10: &str = "http://hl7.org/fhir/sid/icd-10-cm";

    fn translator(preferred: &[&str]) -> VocabularyTranslator {
        let store = Arc::new(InMemoryOmopStore::with_fixture_vocabulary());
        VocabularyTranslator::new(store, preferred.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_system_table_both_directions() {
        let t = translator(&["SNOMED"]);
        assert_eq!(t.system_uri_to_vocabulary("http://loinc.org"), Some("LOINC"));
        assert_eq!(t.system_uri_to_vocabulary("http://loinc.org/"), Some("LOINC"));
        assert_eq!(t.vocabulary_to_system_uri("RxNorm"), Some("http://www.nlm.nih.gov/research/umls/rxnorm"));
        assert_eq!(t.system_uri_to_vocabulary("http://example.org/local"), None);
    }

    #[test]
    fn test_lookup_distinguishes_misses() {
        let t = translator(&["SNOMED"]);
        assert!(matches!(
            tokio_test::block_on(t.resolve_concept("SNOMED", "44054006")).unwrap(),
            ConceptLookup::Found(c) if c.concept_id == SNOMED_TYPE_2_DIABETES
        ));
        assert_eq!(
            tokio_test::block_on(t.resolve_concept("SNOMED", "0000")).unwrap(),
            ConceptLookup::UnknownCode
        );
        assert_eq!(
            tokio_test::block_on(t.resolve_concept("MadeUp", "1")).unwrap(),
            ConceptLookup::UnknownVocabulary
        );
        // Misses are cached too.
        assert_eq!(
            tokio_test::block_on(t.resolve_concept("SNOMED", "0000")).unwrap(),
            ConceptLookup::UnknownCode
        );
    }

    #[tokio::test]
    async fn test_preference_ignores_input_order() {
        let t = translator(&["SNOMED"]);
        let icd = Coding::new(ICD10, "E11.9");
        let snomed = Coding::new(SNOMED, "44054006");
        for codings in [vec![icd.clone(), snomed.clone()], vec![snomed.clone(), icd.clone()]] {
            let cc = CodeableConcept {
                coding: codings,
                text: None,
            };
            let resolution = t.resolve_codeable_concept(&cc).await.unwrap().unwrap();
            assert_eq!(resolution.concept_id(), SNOMED_TYPE_2_DIABETES);
            assert_eq!(resolution.source().code, "44054006");
        }

        let t = translator(&["ICD10CM"]);
        let cc = CodeableConcept {
            coding: vec![snomed, icd],
            text: None,
        };
        let resolution = t.resolve_codeable_concept(&cc).await.unwrap().unwrap();
        assert_eq!(resolution.concept_id(), ICD10CM_TYPE_2_DIABETES);
    }

    #[tokio::test]
    async fn test_unresolved_keeps_first_coding() {
        let t = translator(&["SNOMED"]);
        let cc = CodeableConcept {
            coding: vec![
                Coding::new("http://example.org/local", "X1").with_display("Local thing"),
                Coding::new(SNOMED, "0000"),
            ],
            text: None,
        };
        let resolution = t.resolve_codeable_concept(&cc).await.unwrap().unwrap();
        assert!(!resolution.is_resolved());
        assert_eq!(resolution.concept_id(), NO_MATCHING_CONCEPT);
        assert_eq!(
            resolution.source().encode(),
            "http://example.org/local^X1^Local thing"
        );

        assert!(t
            .resolve_codeable_concept(&CodeableConcept::default())
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_source_value_parse() {
        let sv = SourceValue::parse("http://example.org^X1^Thing ^ with caret").unwrap();
        assert_eq!(sv.system, "http://example.org");
        assert_eq!(sv.code, "X1");
        assert_eq!(sv.display, "Thing ^ with caret");

        let bare = SourceValue::parse("250.00").unwrap();
        assert_eq!(bare.code, "250.00");
        assert!(bare.system.is_empty());
        assert_eq!(bare.to_coding().unwrap().system, None);

        assert_eq!(SourceValue::text("free text").to_coding(), None);
        assert_eq!(SourceValue::like_pattern(None, Some("C")), "%^C^%");
        assert_eq!(SourceValue::like_pattern(Some("S2"), Some("C")), "S2^C^%");
        assert_eq!(SourceValue::like_pattern(None, Some("LC_17")), "%^LC\\_17^%");
        assert_eq!(SourceValue::like_pattern(Some("S"), Some("%")), "S^\\%^%");
    }

    #[tokio::test]
    async fn test_coding_for_falls_back_to_source() {
        let t = translator(&["SNOMED"]);
        let coding = t
            .coding_for(SNOMED_TYPE_2_DIABETES, Some("ignored^x^y"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(coding.system.as_deref(), Some(SNOMED));
        assert_eq!(coding.display.as_deref(), Some("Type 2 diabetes mellitus"));

        let coding = t
            .coding_for(NO_MATCHING_CONCEPT, Some("http://example.org^X1^Thing"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(coding, Coding::new("http://example.org", "X1").with_display("Thing"));

        let cc = t
            .codeable_concept_for(NO_MATCHING_CONCEPT, Some("^^free text"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cc.text.as_deref(), Some("free text"));
        assert!(cc.coding.is_empty());
    }
}
