use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use papaya::HashMap as PapayaHashMap;
use serde_json::{Map, Value};
use tracing::debug;

use omopfhir_core::{InternalId, OmopTable};
use omopfhir_storage::{
    Concept, ConceptStore, OmopEntity, OmopStorage, Page, Predicate, SortSpec, StorageError,
    StorageResult,
};

use crate::query;

/// In-memory OMOP store using papaya lock-free maps.
///
/// Keys are assigned per table from an atomic sequence starting at 1.
/// Predicates are evaluated in process against each row's column map.
#[derive(Debug, Default)]
pub struct InMemoryOmopStore {
    pub(crate) rows: Arc<PapayaHashMap<InternalId, OmopEntity>>,
    sequences: PapayaHashMap<OmopTable, AtomicI64>,
    concepts: PapayaHashMap<i64, Concept>,
    concept_codes: PapayaHashMap<(String, String), i64>,
}

impl InMemoryOmopStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_key(&self, table: OmopTable) -> i64 {
        let guard = self.sequences.pin();
        guard
            .get_or_insert_with(table, || AtomicI64::new(1))
            .fetch_add(1, Ordering::SeqCst)
    }

    /// Keeps the sequence ahead of an explicitly written key.
    fn bump_sequence(&self, table: OmopTable, key: i64) {
        let guard = self.sequences.pin();
        guard
            .get_or_insert_with(table, || AtomicI64::new(1))
            .fetch_max(key.saturating_add(1), Ordering::SeqCst);
    }

    /// Adds or replaces a vocabulary concept.
    pub fn insert_concept(&self, concept: Concept) {
        let key = (concept.vocabulary_id.clone(), concept.concept_code.clone());
        self.concept_codes.pin().insert(key, concept.concept_id);
        self.concepts.pin().insert(concept.concept_id, concept);
    }

    pub fn insert_concepts(&self, concepts: impl IntoIterator<Item = Concept>) {
        for concept in concepts {
            self.insert_concept(concept);
        }
    }

    /// Total rows across all clinical tables.
    pub fn len(&self) -> usize {
        self.rows.pin().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn matching_rows(
        &self,
        table: OmopTable,
        predicates: &[Predicate],
    ) -> StorageResult<Vec<(OmopEntity, Map<String, Value>)>> {
        query::validate(table, predicates)?;
        let guard = self.rows.pin();
        let mut matched = Vec::new();
        for (id, entity) in guard.iter() {
            if id.table != table {
                continue;
            }
            let columns = entity.to_columns()?;
            if query::matches(table, &columns, predicates)? {
                matched.push((entity.clone(), columns));
            }
        }
        Ok(matched)
    }
}

#[async_trait]
impl OmopStorage for InMemoryOmopStore {
    async fn find_by_id(&self, id: InternalId) -> StorageResult<Option<OmopEntity>> {
        Ok(self.rows.pin().get(&id).cloned())
    }

    async fn create(&self, mut entity: OmopEntity) -> StorageResult<OmopEntity> {
        let table = entity.table();
        let key = self.next_key(table);
        entity.set_key(key);
        self.rows.pin().insert(entity.internal_id(), entity.clone());
        debug!(table = %table, key, "row created");
        Ok(entity)
    }

    async fn update(&self, entity: OmopEntity) -> StorageResult<OmopEntity> {
        let id = entity.internal_id();
        let guard = self.rows.pin();
        if guard.get(&id).is_none() {
            return Err(StorageError::not_found(id.table, id.key));
        }
        guard.insert(id, entity.clone());
        Ok(entity)
    }

    async fn delete(&self, id: InternalId) -> StorageResult<Option<OmopEntity>> {
        Ok(self.rows.pin().remove(&id).cloned())
    }

    async fn restore(&self, entity: OmopEntity) -> StorageResult<()> {
        let id = entity.internal_id();
        if id.key <= 0 {
            return Err(StorageError::invalid_entity(format!(
                "cannot restore {} without a key",
                id.table
            )));
        }
        self.bump_sequence(id.table, id.key);
        self.rows.pin().insert(id, entity);
        Ok(())
    }

    async fn search(
        &self,
        table: OmopTable,
        predicates: &[Predicate],
        page: Page,
        sort: &[SortSpec],
    ) -> StorageResult<Vec<OmopEntity>> {
        let mut matched = self.matching_rows(table, predicates)?;
        matched.sort_by(|(a, a_cols), (b, b_cols)| {
            query::compare_rows(a_cols, b_cols, sort).then_with(|| a.key().cmp(&b.key()))
        });

        let offset = usize::try_from(page.offset).unwrap_or(usize::MAX);
        let limit = usize::try_from(page.limit).unwrap_or(usize::MAX);
        Ok(matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(entity, _)| entity)
            .collect())
    }

    async fn count(&self, table: OmopTable, predicates: &[Predicate]) -> StorageResult<u64> {
        Ok(self.matching_rows(table, predicates)?.len() as u64)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl ConceptStore for InMemoryOmopStore {
    async fn find_concept(
        &self,
        vocabulary_id: &str,
        code: &str,
    ) -> StorageResult<Option<Concept>> {
        let key = (vocabulary_id.to_string(), code.to_string());
        let Some(concept_id) = self.concept_codes.pin().get(&key).copied() else {
            return Ok(None);
        };
        Ok(self.concepts.pin().get(&concept_id).cloned())
    }

    async fn concept_by_id(&self, concept_id: i64) -> StorageResult<Option<Concept>> {
        Ok(self.concepts.pin().get(&concept_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omopfhir_storage::{ConditionOccurrence, Operator, Person, ValueType};
    use time::macros::date;

    fn condition(person_id: i64, concept_id: i64) -> OmopEntity {
        OmopEntity::ConditionOccurrence(ConditionOccurrence::new(
            person_id,
            concept_id,
            date!(2020 - 01 - 01),
        ))
    }

    #[tokio::test]
    async fn test_create_assigns_per_table_keys() {
        let store = InMemoryOmopStore::new();
        let p1 = store.create(OmopEntity::Person(Person::new(8507, 1970))).await.unwrap();
        let p2 = store.create(OmopEntity::Person(Person::new(8532, 1980))).await.unwrap();
        let c1 = store.create(condition(p1.key(), 201826)).await.unwrap();
        assert_eq!((p1.key(), p2.key(), c1.key()), (1, 2, 1));
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_update_missing_row_fails() {
        let store = InMemoryOmopStore::new();
        let mut entity = condition(1, 1);
        entity.set_key(99);
        let err = store.update(entity).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_and_restore() {
        let store = InMemoryOmopStore::new();
        let created = store.create(condition(1, 5)).await.unwrap();
        let removed = store.delete(created.internal_id()).await.unwrap();
        assert_eq!(removed.as_ref(), Some(&created));
        assert!(store.find_by_id(created.internal_id()).await.unwrap().is_none());

        store.restore(created.clone()).await.unwrap();
        assert_eq!(
            store.find_by_id(created.internal_id()).await.unwrap(),
            Some(created.clone())
        );
        let next = store.create(condition(1, 6)).await.unwrap();
        assert!(next.key() > created.key());
    }

    #[tokio::test]
    async fn test_count_matches_exhaustive_paging() {
        let store = InMemoryOmopStore::new();
        for i in 0..23 {
            store.create(condition(i % 3, 100 + i % 2)).await.unwrap();
        }
        let predicates = vec![
            Predicate::compare(ValueType::Long, "condition_concept_id", Operator::Eq, "100")
                .unwrap(),
        ];
        let table = OmopTable::ConditionOccurrence;
        let total = store.count(table, &predicates).await.unwrap();

        let mut seen = Vec::new();
        let mut offset = 0;
        loop {
            let page = store
                .search(table, &predicates, Page::new(offset, 5), &[])
                .await
                .unwrap();
            if page.is_empty() {
                break;
            }
            offset += page.len() as u64;
            seen.extend(page.into_iter().map(|e| e.key()));
        }
        assert_eq!(total, 12);
        assert_eq!(seen.len() as u64, total);
        let mut dedup = seen.clone();
        dedup.dedup();
        assert_eq!(dedup, seen);
    }

    #[tokio::test]
    async fn test_search_sort_desc() {
        let store = InMemoryOmopStore::new();
        for concept in [3, 1, 2] {
            store.create(condition(1, concept)).await.unwrap();
        }
        let rows = store
            .search(
                OmopTable::ConditionOccurrence,
                &[],
                Page::new(0, 10),
                &[SortSpec::desc("condition_concept_id")],
            )
            .await
            .unwrap();
        let concepts: Vec<i64> = rows
            .iter()
            .map(|e| match e {
                OmopEntity::ConditionOccurrence(c) => c.condition_concept_id,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(concepts, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_invalid_predicate_is_reported() {
        let store = InMemoryOmopStore::new();
        let bad = Predicate::compare(ValueType::Long, "person_id", Operator::Eq, "x").unwrap();
        let err = store.count(OmopTable::Person, &[bad]).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidPredicate(_)));
    }

    #[test]
    fn test_concept_lookup() {
        let store = InMemoryOmopStore::new();
        store.insert_concept(Concept::new(
            201826,
            "SNOMED",
            "44054006",
            "Type 2 diabetes mellitus",
            "Condition",
        ));
        let found =
            tokio_test::block_on(store.find_concept("SNOMED", "44054006")).unwrap();
        assert_eq!(found.map(|c| c.concept_id), Some(201826));
        assert!(
            tokio_test::block_on(store.find_concept("LOINC", "44054006"))
                .unwrap()
                .is_none()
        );
        assert!(tokio_test::block_on(store.concept_by_id(201826)).unwrap().is_some());
    }
}
