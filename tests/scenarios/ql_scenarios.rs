//! QL pipelines run by query tasks inside complete processes

use pretty_assertions::assert_eq;
use relay_core::{InstanceStatus, TaskId};
use relay_tests::{log_messages, Harness};
use serde_json::json;

async fn sales_harness() -> Harness {
    let harness = Harness::new();
    harness
        .define_object(
            json!({
                "id": "customer",
                "name": "Customer",
                "fields": [
                    {"id": "name", "column": "name"},
                    {"id": "balance", "column": "balance",
                     "kind": {"type": "formula", "expression": "{credit} - {debit}"}}
                ]
            }),
            vec![
                json!({"id": "c1", "name": "Acme", "credit": 100, "debit": 30}),
                json!({"id": "c2", "name": "Globex", "credit": 50, "debit": 0}),
            ],
        )
        .await;
    harness
        .define_object(
            json!({
                "id": "order",
                "name": "Order",
                "fields": [
                    {"id": "state", "column": "state"},
                    {"id": "customer", "column": "customer_id",
                     "kind": {"type": "connection", "object": "customer"}},
                    {"id": "lines", "column": "line_ids",
                     "kind": {"type": "connection", "object": "line", "many": true}}
                ]
            }),
            vec![
                json!({"id": 1, "state": "open", "customer_id": "c1", "line_ids": [10, 11]}),
                json!({"id": 2, "state": "open", "customer_id": "c1", "line_ids": [12]}),
                json!({"id": 3, "state": "open", "customer_id": "c2", "line_ids": []}),
                json!({"id": 4, "state": "closed", "customer_id": "c2", "line_ids": []}),
            ],
        )
        .await;
    harness
        .define_object(
            json!({"id": "line", "name": "Line", "fields": [{"id": "sku", "column": "sku"}]}),
            vec![
                json!({"id": 10, "sku": "A"}),
                json!({"id": 11, "sku": "B"}),
                json!({"id": 12, "sku": "C"}),
            ],
        )
        .await;
    harness
}

fn query_diagram(pipeline: serde_json::Value) -> String {
    json!({
        "name": "lookup",
        "elements": [
            {"id": "t", "name": "Trigger", "kind": "trigger"},
            {"id": "q", "name": "Lookup", "kind": "query",
             "config": {"object": "order", "pipeline": pipeline}}
        ],
        "connections": [{"from": "t", "to": "q"}]
    })
    .to_string()
}

#[tokio::test]
async fn test_to_one_pluck_of_several_rows_keeps_the_first_with_a_diagnostic() {
    let harness = sales_harness().await;
    let diagram = query_diagram(json!([
        {"op": "find", "conditions": [{"field": "state", "value": "open"}]},
        {"op": "row_pluck", "field": "customer"},
        {"op": "row_save", "key": "customer"}
    ]));

    let instance = harness.trigger_new(&diagram, json!({}), "pluck-1").await;

    assert_eq!(instance.status, InstanceStatus::Completed);
    // Orders 1-3 link to two distinct customers; the first one is kept
    assert_eq!(
        instance.task_state(&TaskId::new("q")).get("customer"),
        Some(&json!({"id": "c1", "name": "Acme", "credit": 100, "debit": 30, "balance": 70}))
    );
    assert!(log_messages(&instance, "q")
        .iter()
        .any(|m| m.contains("2 values for single-valued field customer")));
}

#[tokio::test]
async fn test_to_many_pluck_keeps_every_related_row() {
    let harness = sales_harness().await;
    let diagram = query_diagram(json!([
        {"op": "find", "conditions": [{"field": "_PK", "value": {"ref": "Trigger.order"}}]},
        {"op": "row_pluck", "field": "lines"},
        {"op": "set_pluck", "field": "sku"},
        {"op": "set_save", "key": "first_sku"}
    ]));

    let instance = harness.trigger_new(&diagram, json!({"order": 1}), "pluck-2").await;

    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(
        instance.task_state(&TaskId::new("q")).get("first_sku"),
        Some(&json!("A"))
    );
}

#[tokio::test]
async fn test_set_pluck_deduplicates_related_ids() {
    let harness = sales_harness().await;
    let diagram = query_diagram(json!([
        {"op": "find", "conditions": [{"field": "customer", "value": "c1"}]},
        {"op": "set_pluck", "field": "customer"},
        {"op": "set_pluck", "field": "balance"},
        {"op": "value_save", "key": "balance"}
    ]));

    let instance = harness.trigger_new(&diagram, json!({}), "pluck-3").await;

    assert_eq!(instance.status, InstanceStatus::Completed);
    // Two orders share customer c1; the fan-out returns it once
    assert_eq!(
        instance.task_state(&TaskId::new("q")).get("balance"),
        Some(&json!(70))
    );
}

#[tokio::test]
async fn test_missing_upstream_data_degrades_to_no_data() {
    let harness = sales_harness().await;
    let diagram = query_diagram(json!([
        {"op": "load", "from": "Trigger.order_ids", "fetch": true},
        {"op": "set_pluck", "field": "customer"},
        {"op": "row_pluck", "field": "name"},
        {"op": "row_update", "updates": {"state": "archived"}},
        {"op": "value_save", "key": "name"}
    ]));

    let instance = harness.trigger_new(&diagram, json!({}), "null-1").await;

    // The task still completes; every operator recorded why it had nothing to do
    assert_eq!(instance.status, InstanceStatus::Completed);
    let state = instance.task_state(&TaskId::new("q"));
    assert_eq!(state.get("name"), None);
    let diagnostics = log_messages(&instance, "q")
        .into_iter()
        .filter(|m| !m.starts_with("Pipeline"))
        .count();
    assert_eq!(diagnostics, 5);
    assert_eq!(
        harness.services.objects.rows("order").await[0]["state"],
        json!("open")
    );
}
