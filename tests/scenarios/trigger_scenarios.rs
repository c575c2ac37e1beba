//! Triggering, deduplication and definition identity, end to end

use futures::future::join_all;
use pretty_assertions::assert_eq;
use relay_core::{InstanceStatus, ProcessDefinition, TaskId, TriggerOutcome};
use relay_tests::{log_messages, Harness};
use serde_json::json;

/// Trigger -> Calculate -> Query (find the invoice, set its total) -> End
const INVOICE_DIAGRAM: &str = r#"{
  "name": "invoice-total",
  "elements": [
    {"id": "t", "name": "Trigger", "kind": "trigger"},
    {"id": "calc", "name": "Calculate", "kind": "calculate",
     "config": {"formula": "{Trigger}.amount * 2"}},
    {"id": "update", "name": "UpdateInvoice", "kind": "query",
     "config": {"object": "invoice", "pipeline": [
        {"op": "find", "conditions": [{"field": "_PK", "value": {"ref": "Trigger.invoice"}}]},
        {"op": "row_update", "updates": {"total": {"ref": "Calculate"}}},
        {"op": "row_save", "key": "invoice"}
     ]}},
    {"id": "e", "kind": "end"}
  ],
  "connections": [
    {"from": "t", "to": "calc"},
    {"from": "calc", "to": "update"},
    {"from": "update", "to": "e"}
  ]
}"#;

async fn invoice_harness() -> Harness {
    let harness = Harness::new();
    harness
        .define_object(
            json!({
                "id": "invoice",
                "name": "Invoice",
                "fields": [{"id": "total", "column": "total"}]
            }),
            vec![json!({"id": 7, "total": 0}), json!({"id": 8, "total": 0})],
        )
        .await;
    harness
}

#[tokio::test]
async fn test_trigger_calculates_and_updates_the_row() {
    let harness = invoice_harness().await;

    let instance = harness
        .trigger_new(INVOICE_DIAGRAM, json!({"amount": 100, "invoice": 7}), "evt-42")
        .await;

    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(
        instance.task_state(&TaskId::new("calc")).get("value"),
        Some(&json!(200))
    );
    assert_eq!(
        instance.task_state(&TaskId::new("update")).get("invoice"),
        Some(&json!({"id": 7, "total": 200}))
    );
    assert_eq!(
        harness.services.objects.rows("invoice").await,
        vec![json!({"id": 7, "total": 200}), json!({"id": 8, "total": 0})]
    );
    assert_eq!(instance.context["instanceKey"], json!("evt-42"));

    // The persisted copy matches what the trigger returned
    let stored = harness.manager.find_instance(&instance.id).await.unwrap().unwrap();
    assert_eq!(stored, instance);
}

#[tokio::test]
async fn test_unknown_invoice_completes_without_saving() {
    let harness = invoice_harness().await;

    let instance = harness
        .trigger_new(INVOICE_DIAGRAM, json!({"amount": 100, "invoice": 999}), "evt-404")
        .await;

    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.task_state(&TaskId::new("update")).get("invoice"), None);
    assert!(log_messages(&instance, "update")
        .iter()
        .any(|m| m.contains("nothing to save as invoice")));
    assert_eq!(
        harness.services.objects.rows("invoice").await,
        vec![json!({"id": 7, "total": 0}), json!({"id": 8, "total": 0})]
    );
}

#[tokio::test]
async fn test_refired_trigger_creates_no_duplicate() {
    let harness = invoice_harness().await;
    harness
        .trigger_new(INVOICE_DIAGRAM, json!({"amount": 100, "invoice": 7}), "evt-42")
        .await;

    // A retried delivery of the same event, with a different payload
    let outcome = harness
        .trigger(INVOICE_DIAGRAM, json!({"amount": 999, "invoice": 7}), "evt-42")
        .await
        .unwrap();

    assert!(matches!(outcome, TriggerOutcome::AlreadyTriggered { .. }));
    assert_eq!(harness.instance_count().await, 1);
    assert_eq!(
        harness.services.objects.rows("invoice").await[0],
        json!({"id": 7, "total": 200})
    );
}

#[tokio::test]
async fn test_concurrent_triggers_with_one_key_create_one_instance() {
    let harness = invoice_harness().await;

    let outcomes = join_all((0..8).map(|_| {
        harness.trigger(INVOICE_DIAGRAM, json!({"amount": 100, "invoice": 8}), "evt-race")
    }))
    .await;

    let created = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(TriggerOutcome::Created { .. })))
        .count();
    let duplicates = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(TriggerOutcome::AlreadyTriggered { .. })))
        .count();
    assert_eq!(created, 1);
    assert_eq!(duplicates, 7);
    assert_eq!(harness.instance_count().await, 1);
}

#[tokio::test]
async fn test_distinct_keys_create_distinct_instances() {
    let harness = invoice_harness().await;
    let first = harness
        .trigger_new(INVOICE_DIAGRAM, json!({"amount": 1, "invoice": 7}), "evt-1")
        .await;
    let second = harness
        .trigger_new(INVOICE_DIAGRAM, json!({"amount": 2, "invoice": 8}), "evt-2")
        .await;

    assert_ne!(first.id, second.id);
    assert_eq!(first.definition_id, second.definition_id);
    assert_eq!(harness.instance_count().await, 2);
}

#[test]
fn test_definition_identity_is_the_document_hash() {
    let a = ProcessDefinition::compile(INVOICE_DIAGRAM).unwrap();
    let b = ProcessDefinition::compile(INVOICE_DIAGRAM).unwrap();
    assert_eq!(a, b);
    assert!(a.id.0.starts_with("sha256:"));

    // Byte-level changes produce a new definition, even when the graph is equal
    let reformatted = format!("{}\n", INVOICE_DIAGRAM);
    let c = ProcessDefinition::compile(&reformatted).unwrap();
    assert_ne!(a.id, c.id);
    assert_eq!(a.document, c.document);
}

#[tokio::test]
async fn test_definition_is_stored_once_per_document() {
    let harness = invoice_harness().await;
    let first = harness
        .trigger_new(INVOICE_DIAGRAM, json!({"amount": 1, "invoice": 7}), "evt-a")
        .await;
    harness
        .trigger_new(INVOICE_DIAGRAM, json!({"amount": 1, "invoice": 7}), "evt-b")
        .await;

    let source = harness
        .store
        .definition_repository()
        .source_of(&first.definition_id)
        .await;
    assert_eq!(source.as_deref(), Some(INVOICE_DIAGRAM));
}
