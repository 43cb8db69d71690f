use assert_json_diff::assert_json_include;
use serde_json::{Value, json};

use omopfhir_core::ResourceType;
use omopfhir_core::model::{Bundle, FhirResource, Patient};
use omopfhir_service::{AppConfig, BundleError, OmopFhirApp};

const PATIENT_URN: &str = "urn:uuid:61ebe359-bfdc-4613-8bf2-c5e300945f0a";
const PRACTITIONER_URN: &str = "urn:uuid:0c3151bd-1cbf-4d64-b04d-cd9187a4c6e0";

fn app() -> OmopFhirApp {
    OmopFhirApp::from_config(AppConfig::default())
}

fn bundle(kind: &str, entries: Value) -> Bundle {
    serde_json::from_value(json!({"resourceType": "Bundle", "type": kind, "entry": entries}))
        .expect("valid bundle")
}

fn statuses(response: &Bundle) -> Vec<String> {
    response
        .entry
        .iter()
        .map(|e| e.response.as_ref().map(|r| r.status.clone()).unwrap_or_default())
        .collect()
}

fn patient_entry() -> Value {
    json!({
        "fullUrl": PATIENT_URN,
        "resource": {"resourceType": "Patient", "id": "p1", "gender": "female", "birthDate": "1985-04-12"},
        "request": {"method": "POST", "url": "Patient"}
    })
}

fn condition_entry(subject: &str) -> Value {
    json!({
        "resource": {
            "resourceType": "Condition",
            "code": {"coding": [{"system": "http://snomed.info/sct", "code": "44054006"}]},
            "subject": {"reference": subject},
            "onsetDateTime": "2021-06-01"
        },
        "request": {"method": "POST", "url": "Condition"}
    })
}

#[tokio::test]
async fn forward_references_resolve_to_created_ids() {
    let app = app();
    let request = bundle(
        "transaction",
        json!([
            {
                "resource": {
                    "resourceType": "Observation",
                    "code": {"coding": [{"system": "http://loinc.org", "code": "4548-4"}]},
                    "subject": {"reference": "Patient/p1"},
                    "effectiveDateTime": "2023-01-15",
                    "valueQuantity": {"value": 6.8, "system": "http://unitsofmeasure.org", "code": "%"}
                },
                "request": {"method": "POST", "url": "Observation"}
            },
            patient_entry(),
            condition_entry(PATIENT_URN)
        ]),
    );

    let response = app.bundles.process(&request).await.unwrap();
    assert_eq!(statuses(&response), vec!["201 Created"; 3]);

    let response = serde_json::to_value(&response).unwrap();
    assert_json_include!(
        actual: response,
        expected: json!({
            "type": "transaction-response",
            "entry": [
                {
                    "resource": {"resourceType": "Observation", "subject": {"reference": "Patient/1"}},
                    "response": {"location": "Observation/1"}
                },
                {"response": {"location": "Patient/1"}},
                {
                    "resource": {"resourceType": "Condition", "subject": {"reference": "Patient/1"}},
                    "response": {"location": "Condition/1"}
                }
            ]
        })
    );
    assert_eq!(app.store.len(), 3);
}

#[tokio::test]
async fn batch_entries_fail_independently() {
    let app = app();
    let request = bundle(
        "batch",
        json!([
            patient_entry(),
            {
                "resource": {"resourceType": "Condition", "code": {"text": "headache"}, "onsetDateTime": "2022"},
                "request": {"method": "POST", "url": "Condition"}
            },
            condition_entry("Patient/99"),
            condition_entry(PATIENT_URN),
            {"request": {"method": "GET", "url": "Condition?subject=Patient/1"}}
        ]),
    );

    let response = app.bundles.process(&request).await.unwrap();
    assert_eq!(
        statuses(&response),
        vec![
            "201 Created",
            "400 Bad Request",
            "424 Failed Dependency",
            "201 Created",
            "200 OK"
        ]
    );
    let outcome = response.entry[2]
        .response
        .as_ref()
        .and_then(|r| r.outcome.clone())
        .unwrap();
    assert_json_include!(
        actual: outcome,
        expected: json!({
            "resourceType": "OperationOutcome",
            "issue": [{"severity": "error", "code": "not-found"}]
        })
    );
    assert_json_include!(
        actual: response.entry[4].resource.clone().unwrap(),
        expected: json!({"type": "searchset", "total": 1})
    );
    assert_eq!(app.store.len(), 2);
}

#[tokio::test]
async fn failed_transaction_leaves_the_store_untouched() {
    let app = app();
    let request = bundle(
        "transaction",
        json!([
            patient_entry(),
            condition_entry(PATIENT_URN),
            condition_entry("Patient/99")
        ]),
    );

    let err = app.bundles.process(&request).await.unwrap_err();
    assert!(matches!(err, BundleError::TransactionFailed { index: 2, .. }));
    assert_eq!(err.status_code(), 424);
    assert!(app.store.is_empty());
}

#[tokio::test]
async fn rollback_restores_updated_and_deleted_rows() {
    let app = app();
    let patient = FhirResource::from_value(
        json!({"resourceType": "Patient", "gender": "female", "birthDate": "1985-04-12"}),
    )
    .unwrap();
    let patient_id = app.service.create(&patient).await.unwrap().resource.id.id;
    let setup = bundle("batch", json!([condition_entry(&format!("Patient/{patient_id}"))]));
    app.bundles.process(&setup).await.unwrap();
    assert_eq!(app.store.len(), 2);

    let request = bundle(
        "transaction",
        json!([
            {
                "resource": {"resourceType": "Patient", "id": patient_id.to_string(), "gender": "male", "birthDate": "1985-04-12"},
                "request": {"method": "PUT", "url": format!("Patient/{patient_id}")}
            },
            {"request": {"method": "DELETE", "url": "Condition/1"}},
            {
                "resource": {"resourceType": "Patient", "birthDate": "not-a-date"},
                "request": {"method": "POST", "url": "Patient"}
            }
        ]),
    );
    let err = app.bundles.process(&request).await.unwrap_err();
    assert!(matches!(err, BundleError::TransactionFailed { index: 2, .. }));

    assert_eq!(app.store.len(), 2);
    let read = app
        .service
        .read(ResourceType::Patient, &patient_id.to_string())
        .await
        .unwrap();
    let FhirResource::Patient(Patient { gender, .. }) = read.resource else {
        panic!("expected a Patient");
    };
    assert_eq!(gender.as_deref(), Some("female"));
    assert!(app.service.read(ResourceType::Condition, "1").await.is_ok());
}

#[tokio::test]
async fn duplicate_full_urls_are_rejected() {
    let app = app();
    let request = bundle("batch", json!([patient_entry(), patient_entry()]));
    let err = app.bundles.process(&request).await.unwrap_err();
    assert!(matches!(err, BundleError::DuplicateFullUrl(ref url) if url == PATIENT_URN));
    assert_eq!(err.status_code(), 400);
    assert!(app.store.is_empty());
}

#[tokio::test]
async fn circular_references_fail_the_entries_involved() {
    let app = app();
    let entries = json!([
        {
            "fullUrl": PATIENT_URN,
            "resource": {
                "resourceType": "Patient",
                "birthDate": "1990",
                "generalPractitioner": [{"reference": PRACTITIONER_URN}]
            },
            "request": {"method": "POST", "url": "Patient"}
        },
        {
            "fullUrl": PRACTITIONER_URN,
            "resource": {
                "resourceType": "Practitioner",
                "name": [{"text": "Ada Loop"}],
                "extension": [{"valueReference": {"reference": PATIENT_URN}}]
            },
            "request": {"method": "POST", "url": "Practitioner"}
        },
        {
            "resource": {"resourceType": "Practitioner", "name": [{"text": "Standalone"}]},
            "request": {"method": "POST", "url": "Practitioner"}
        }
    ]);

    let response = app
        .bundles
        .process(&bundle("batch", entries.clone()))
        .await
        .unwrap();
    assert_eq!(
        statuses(&response),
        vec!["400 Bad Request", "400 Bad Request", "201 Created"]
    );

    let err = app
        .bundles
        .process(&bundle("transaction", entries))
        .await
        .unwrap_err();
    assert!(matches!(err, BundleError::TransactionFailed { index: 0, .. }));
    assert_eq!(app.store.len(), 1);
}

#[tokio::test]
async fn only_batch_and_transaction_bundles_are_processed() {
    let app = app();
    let err = app
        .bundles
        .process(&bundle("searchset", json!([])))
        .await
        .unwrap_err();
    assert!(matches!(err, BundleError::UnsupportedType(_)));
}
