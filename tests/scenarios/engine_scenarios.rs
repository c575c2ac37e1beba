//! Engine loop behaviour over complete diagrams: waiting and resuming,
//! loops, sub-processes and failing branches.

use pretty_assertions::assert_eq;
use relay_core::{
    domain::ports::channels, EngineConfig, InstanceStatus, TaskId, TaskStatus,
};
use relay_tests::{log_messages, Harness};
use serde_json::{json, Map, Value};

const APPROVAL_DIAGRAM: &str = r#"
name: approval
lanes:
  - id: ops
    name: Operations
    use_role: true
    role: [finance]
elements:
  - { id: t, name: Trigger, kind: trigger }
  - { id: form, name: Review, kind: user_form, lane: ops, config: { form: { fields: [note] } } }
  - id: mail
    kind: email
    config:
      to: "<%= Trigger.requester %>"
      from: "relay@example.com"
      subject: "Request reviewed"
      html: "<p><%= Review.note %></p>"
  - { id: e, kind: end }
connections:
  - { from: t, to: form }
  - { from: form, to: mail }
  - { from: mail, to: e }
"#;

#[tokio::test]
async fn test_form_waits_for_inputs_then_the_branch_continues() {
    let harness = Harness::new();
    harness.add_user("u1", "ada", &["finance"]).await;
    harness.add_user("u2", "grace", &["finance"]).await;
    harness.add_user("u3", "alan", &["sales"]).await;
    harness
        .services
        .dispatch
        .handle(channels::EMAIL_SEND, |_| Ok(json!({"queued": true})))
        .await;

    let instance = harness
        .trigger_new(APPROVAL_DIAGRAM, json!({"requester": "bob@example.com"}), "req-1")
        .await;
    assert_eq!(instance.status, InstanceStatus::Waiting);
    assert_eq!(instance.status_of(&TaskId::new("form")), TaskStatus::Waiting);
    assert_eq!(harness.services.broadcaster.pushed_to("u1").await.len(), 1);
    assert_eq!(harness.services.broadcaster.pushed_to("u2").await.len(), 1);
    assert!(harness.services.broadcaster.pushed_to("u3").await.is_empty());

    // Resuming without inputs changes nothing and pushes nothing new
    let (instance, report) = harness.manager.run(&instance.id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Waiting);
    assert!(report.completed.is_empty());
    assert_eq!(harness.services.broadcaster.pushed_to("u1").await.len(), 1);

    let mut values = Map::new();
    values.insert("note".to_string(), json!("approved"));
    let (instance, report) = harness
        .manager
        .enter_inputs(&instance.id, &TaskId::new("form"), values)
        .await
        .unwrap();

    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(
        report.completed,
        vec![TaskId::new("form"), TaskId::new("mail"), TaskId::new("e")]
    );
    assert_eq!(
        harness.services.dispatch.sent(channels::EMAIL_SEND).await,
        vec![json!({
            "to": "bob@example.com",
            "from": "relay@example.com",
            "subject": "Request reviewed",
            "html": "<p>approved</p>",
        })]
    );
}

#[tokio::test]
async fn test_inputs_for_a_form_not_yet_shown_are_refused() {
    let diagram = r#"{"name":"two-forms","elements":[
        {"id":"t","name":"Trigger","kind":"trigger"},
        {"id":"gate","kind":"user_form","lane":"ops"},
        {"id":"second","kind":"user_form","lane":"ops"},
        {"id":"e","kind":"end"}],
        "connections":[{"from":"t","to":"gate"},{"from":"gate","to":"second"},{"from":"second","to":"e"}],
        "lanes":[{"id":"ops","name":"Ops","use_account":true,"account":["u1"]}]}"#;
    let harness = Harness::new();
    harness.add_user("u1", "ada", &[]).await;

    let instance = harness.trigger_new(diagram, json!({}), "forms-1").await;
    assert_eq!(instance.status_of(&TaskId::new("gate")), TaskStatus::Waiting);

    let err = harness
        .manager
        .enter_inputs(&instance.id, &TaskId::new("second"), Map::new())
        .await
        .unwrap_err();
    assert!(matches!(err, relay_core::CoreError::InvalidState(_)));

    let (instance, _) = harness
        .manager
        .enter_inputs(&instance.id, &TaskId::new("gate"), Map::new())
        .await
        .unwrap();

    // The second form is now shown and waits for its own inputs
    assert_eq!(instance.status, InstanceStatus::Waiting);
    assert_eq!(instance.status_of(&TaskId::new("second")), TaskStatus::Waiting);
    let pushes = harness.services.broadcaster.pushed_to("u1").await;
    assert_eq!(pushes.len(), 2);
    assert_eq!(pushes[1]["taskId"], json!("second"));
}

#[tokio::test]
async fn test_unbounded_loop_stops_at_the_pass_budget() {
    let diagram = r#"{"name":"spin","elements":[
        {"id":"t","name":"Trigger","kind":"trigger"},
        {"id":"a","name":"A","kind":"calculate","config":{"formula":"{Trigger}.n + 1"}},
        {"id":"b","name":"B","kind":"calculate","config":{"formula":"{A} + 1"}}],
        "connections":[{"from":"t","to":"a"},{"from":"a","to":"b"},{"from":"b","to":"a"}]}"#;
    let harness = Harness::with_config(EngineConfig {
        max_passes: 20,
        ..EngineConfig::default()
    });

    let outcome = harness.trigger(diagram, json!({"n": 1}), "spin-1").await.unwrap();
    let relay_core::TriggerOutcome::Created { instance, report } = outcome else {
        panic!("expected a new instance");
    };

    assert!(report.exhausted);
    assert_eq!(report.passes, 20);
    assert_eq!(instance.status, InstanceStatus::Failed);
    // Each pass ran exactly one task of the cycle
    assert_eq!(report.completed.len(), 20);
    assert_eq!(instance.task_state(&TaskId::new("b")).get("value"), Some(&json!(3)));
}

#[tokio::test]
async fn test_sub_process_runs_items_in_order() {
    let diagram = r#"{"name":"lines","elements":[
        {"id":"t","name":"Trigger","kind":"trigger"},
        {"id":"sub","name":"EachLine","kind":"sub_process",
         "config":{"input":"Trigger.lines","output":"Double"}},
        {"id":"s","name":"Line","kind":"start","parent":"sub"},
        {"id":"dbl","name":"Double","kind":"calculate","parent":"sub",
         "config":{"formula":"{Line}.item * 2 + {Line}.index"}},
        {"id":"e","kind":"end"}],
        "connections":[{"from":"t","to":"sub"},{"from":"s","to":"dbl"},{"from":"sub","to":"e"}]}"#;
    let harness = Harness::new();

    let instance = harness
        .trigger_new(diagram, json!({"lines": [10, 20, 30]}), "lines-1")
        .await;

    assert_eq!(instance.status, InstanceStatus::Completed);
    let state = instance.task_state(&TaskId::new("sub"));
    assert_eq!(state.get("count"), Some(&json!(3)));
    assert_eq!(
        state.get("results"),
        Some(&json!([{"value": 20}, {"value": 41}, {"value": 62}]))
    );
}

#[tokio::test]
async fn test_failing_branch_halts_without_stopping_siblings() {
    let diagram = r#"{"name":"split","elements":[
        {"id":"t","name":"Trigger","kind":"trigger"},
        {"id":"bad","name":"Bad","kind":"calculate","config":{"formula":"{Trigger}.missing * 2"}},
        {"id":"after_bad","kind":"end"},
        {"id":"good","name":"Good","kind":"calculate","config":{"formula":"{Trigger}.amount / 4"}}],
        "connections":[{"from":"t","to":"bad"},{"from":"bad","to":"after_bad"},{"from":"t","to":"good"}]}"#;
    let harness = Harness::new();

    let instance = harness.trigger_new(diagram, json!({"amount": 10}), "split-1").await;

    assert_eq!(instance.status, InstanceStatus::Failed);
    assert_eq!(instance.status_of(&TaskId::new("bad")), TaskStatus::Error);
    assert_eq!(instance.status_of(&TaskId::new("after_bad")), TaskStatus::NotStarted);
    assert_eq!(instance.task_state(&TaskId::new("good")).get("value"), Some(&json!(2.5)));

    let notices: Vec<Value> = harness
        .services
        .broadcaster
        .broadcast_on(channels::DEVELOPER)
        .await;
    assert_eq!(notices.len(), 1);
    assert!(log_messages(&instance, "bad")
        .iter()
        .any(|m| m.contains("missing")));
}
