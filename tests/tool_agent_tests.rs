use agentflow::agentflow::hydrator::Hydrator;
use agentflow::agentflow::runner::Driver;
use agentflow::agentflow::tool_protocol::{error_value, FnTool, Tool, ToolMetadata};
use agentflow::agentflow::tool_registry::ToolRegistry;
use agentflow::agentflow::workflow::WorkflowDefinition;
use agentflow::{ModelInvoker, ModelProvider};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

struct NoModels;

impl ModelProvider for NoModels {
    fn native(
        &self,
        model_id: &str,
    ) -> Result<Arc<dyn ModelInvoker>, Box<dyn std::error::Error + Send + Sync>> {
        Err(format!("no model backend for '{}'", model_id).into())
    }
}

fn driver_with_tools(yaml: &str, tools: Vec<Arc<dyn Tool>>) -> Driver {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut registry = ToolRegistry::new();
    registry.discover();
    for tool in tools {
        registry.register(tool).unwrap();
    }
    let def = WorkflowDefinition::from_yaml_str(yaml).unwrap();
    let hydrator = Hydrator::new(Arc::new(registry), Arc::new(NoModels));
    let hydrated = hydrator.hydrate(&def, Path::new(".")).unwrap();
    Driver::new(&hydrated, Path::new(".")).unwrap()
}

const ERROR_SURFACING: &str = r#"
name: error-surfacing
agents:
  - name: exploder
    kind: tool
    tool: boom
    tool_config: {}
    output_key: result
  - name: triage
    kind: expression
    expression: 'result.error'
    input_keys: [result]
    output_key: seen_error
orchestration:
  mode: sequential
  agents: [exploder, triage]
"#;

#[tokio::test]
async fn tool_error_mappings_surface_in_state_not_as_failures() {
    let boom = Arc::new(FnTool::new(
        ToolMetadata::new("boom", "Always reports an application error"),
        |_ctx, _params| Box::pin(async { error_value("boom") }),
    ));
    let driver = driver_with_tools(ERROR_SURFACING, vec![boom]);

    let mut rx = driver.run_streaming("user", "", None).await.unwrap();
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    // The tool agent's event is a *success* carrying the error mapping.
    let tool_event = events.iter().find(|e| e.author == "exploder").unwrap();
    assert!(!tool_event.is_error());
    assert_eq!(
        tool_event.actions.state_delta["result"],
        json!({"error": "boom"})
    );

    // Downstream agents can branch on the mapping's error field.
    let triage = events.iter().find(|e| e.author == "triage").unwrap();
    assert_eq!(triage.actions.state_delta["seen_error"], json!("boom"));
}

const TYPE_PRESERVATION: &str = r#"
name: type-preservation
agents:
  - name: produce
    kind: expression
    expression: '4200'
    output_key: threshold
  - name: probe
    kind: tool
    tool: echo_params
    tool_config:
      exact: "{threshold}"
      embedded: "limit={threshold}"
      absent: "{ghost}"
    output_key: probed
orchestration:
  mode: sequential
  agents: [produce, probe]
"#;

#[tokio::test]
async fn exact_placeholders_preserve_types_and_absent_keys_pass_through() {
    let echo = Arc::new(FnTool::new(
        ToolMetadata::new("echo_params", "Echoes the parameters it received"),
        |_ctx, params| Box::pin(async move { json!({ "received": params }) }),
    ));
    let driver = driver_with_tools(TYPE_PRESERVATION, vec![echo]);

    let result = driver.run("user", "", None).await.unwrap();
    assert_eq!(result.author, "probe");

    let mut rx = driver.run_streaming("user", "", None).await.unwrap();
    let mut received = None;
    while let Some(event) = rx.recv().await {
        if event.author == "probe" {
            received = event.actions.state_delta["probed"]["received"].as_object().cloned();
        }
    }
    let received = received.expect("probe event with received params");

    // Exactly "{threshold}" keeps the original integer.
    assert_eq!(received["exact"], json!(4200));
    // Embedded placeholders stringify.
    assert_eq!(received["embedded"], json!("limit=4200"));
    // Unknown keys pass the literal placeholder through unchanged.
    assert_eq!(received["absent"], json!("{ghost}"));
}

const UNKNOWN_TOOL: &str = r#"
name: unknown-tool
agents:
  - name: broken
    kind: tool
    tool: does_not_exist
    tool_config: {}
    output_key: out
orchestration:
  mode: sequential
  agents: [broken]
"#;

#[test]
fn unknown_tool_fails_at_hydration() {
    let mut registry = ToolRegistry::new();
    registry.discover();
    let def = WorkflowDefinition::from_yaml_str(UNKNOWN_TOOL).unwrap();
    let hydrator = Hydrator::new(Arc::new(registry), Arc::new(NoModels));
    let err = hydrator.hydrate(&def, Path::new(".")).unwrap_err();
    assert!(err.to_string().contains("does_not_exist"));
}
