use agentflow::agentflow::hydrator::Hydrator;
use agentflow::agentflow::model::ToolCallRequest;
use agentflow::agentflow::runner::Driver;
use agentflow::agentflow::tool_registry::ToolRegistry;
use agentflow::agentflow::workflow::WorkflowDefinition;
use agentflow::{ModelInvoker, ModelProvider, ModelRequest, ModelResponse};
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
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

fn driver(yaml: &str, provider: Arc<dyn ModelProvider>) -> Driver {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut registry = ToolRegistry::new();
    registry.discover();
    let def = WorkflowDefinition::from_yaml_str(yaml).unwrap();
    let hydrated = Hydrator::new(Arc::new(registry), provider)
        .hydrate(&def, Path::new("."))
        .unwrap();
    Driver::new(&hydrated, Path::new(".")).unwrap()
}

async fn collect_events(
    d: &Driver,
    message: &str,
) -> Vec<agentflow::Event> {
    let mut rx = d.run_streaming("user", message, None).await.unwrap();
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

const HALTING: &str = r#"
name: halting
agents:
  - name: fails
    kind: expression
    expression: 'absent + 1'
    input_keys: [absent]
    output_key: first
  - name: after
    kind: expression
    expression: '"ran"'
    output_key: second
orchestration:
  mode: sequential
  agents: [fails, after]
"#;

#[tokio::test]
async fn sequential_halts_on_first_error_by_default() {
    let d = driver(HALTING, Arc::new(NoModels));
    let events = collect_events(&d, "").await;

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].author, "fails");
    assert!(events[0].is_error());
    assert!(events[0].actions.state_delta.is_empty());
}

#[tokio::test]
async fn sequential_continue_policy_lets_downstream_run() {
    let yaml = HALTING.replace("mode: sequential", "on_error: continue\n  mode: sequential");
    let d = driver(&yaml, Arc::new(NoModels));
    let events = collect_events(&d, "").await;

    assert_eq!(events.len(), 2);
    assert!(events[0].is_error());
    assert_eq!(events[1].author, "after");
    assert!(!events[1].is_error());
    assert_eq!(events[1].actions.state_delta["second"], json!("ran"));
}

const OVERLAPPING_PARALLEL: &str = r#"
name: overlapping
agents:
  - name: left
    kind: expression
    expression: '"from-left"'
    output_key: shared
  - name: right
    kind: expression
    expression: '"from-right"'
    output_key: shared
orchestration:
  mode: parallel
  agents: [left, right]
"#;

#[tokio::test]
async fn parallel_children_writing_the_same_key_is_last_writer_wins() {
    // Unsupported pattern, but it must not crash: one of the two writes
    // survives in state.
    let d = driver(OVERLAPPING_PARALLEL, Arc::new(NoModels));
    let events = collect_events(&d, "").await;

    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| !e.is_error()));
    let winner = events.last().unwrap().actions.state_delta["shared"].clone();
    assert!(winner == json!("from-left") || winner == json!("from-right"));
}

/// Router that first delegates to its `specialist` agent tool, then
/// answers with the tool result folded in.
struct RoutingInvoker {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl ModelInvoker for RoutingInvoker {
    async fn invoke(
        &self,
        request: ModelRequest,
    ) -> Result<ModelResponse, Box<dyn std::error::Error + Send + Sync>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == 1 {
            // The routed agents must be offered as callable tools.
            assert!(
                request.tools.iter().any(|t| t.name == "specialist"),
                "router request must offer the routed agent as a tool"
            );
            Ok(ModelResponse {
                text: String::new(),
                tool_call: Some(ToolCallRequest {
                    name: "specialist".to_string(),
                    params: json!({"request": "handle this"}),
                }),
                usage: None,
            })
        } else {
            Ok(ModelResponse {
                text: "routed and done".to_string(),
                tool_call: None,
                usage: None,
            })
        }
    }

    fn model_name(&self) -> &str {
        "router-model"
    }
}

struct RouterProvider {
    invoker: Arc<RoutingInvoker>,
}

impl ModelProvider for RouterProvider {
    fn native(
        &self,
        _model_id: &str,
    ) -> Result<Arc<dyn ModelInvoker>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.invoker.clone())
    }
}

const ROUTED: &str = r#"
name: routed
agents:
  - name: specialist
    kind: expression
    expression: '"specialist-answer"'
    output_key: specialist_out
  - name: router
    kind: model
    model_id: router-model
    instruction: "Route the request to the right specialist."
    output_key: routed_out
orchestration:
  mode: llm_routed
  agents: [specialist]
  router: router
"#;

#[tokio::test]
async fn llm_routed_mode_wraps_agents_as_router_tools() {
    let invoker = Arc::new(RoutingInvoker {
        calls: AtomicUsize::new(0),
    });
    let d = driver(
        ROUTED,
        Arc::new(RouterProvider {
            invoker: invoker.clone(),
        }),
    );
    let events = collect_events(&d, "do the thing").await;

    let authors: Vec<&str> = events.iter().map(|e| e.author.as_str()).collect();
    assert!(authors.contains(&"specialist"), "delegated agent must run");
    assert_eq!(*authors.last().unwrap(), "router");
    assert_eq!(
        events.last().unwrap().actions.state_delta["routed_out"],
        json!("routed and done")
    );
    assert_eq!(invoker.calls.load(Ordering::SeqCst), 2);
}

/// Invoker asserting the react planner decorated the instruction, and
/// answering in the tagged-section protocol.
struct ReactInvoker;

#[async_trait::async_trait]
impl ModelInvoker for ReactInvoker {
    async fn invoke(
        &self,
        request: ModelRequest,
    ) -> Result<ModelResponse, Box<dyn std::error::Error + Send + Sync>> {
        assert!(
            request.instruction.contains("/*FINAL_ANSWER*/"),
            "react mode must inject the plan-then-act protocol"
        );
        Ok(ModelResponse {
            text: "/*PLANNING*/ one step /*ACTION*/ did it /*FINAL_ANSWER*/ all done"
                .to_string(),
            tool_call: None,
            usage: None,
        })
    }

    fn model_name(&self) -> &str {
        "react-model"
    }
}

struct ReactProvider;

impl ModelProvider for ReactProvider {
    fn native(
        &self,
        _model_id: &str,
    ) -> Result<Arc<dyn ModelInvoker>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Arc::new(ReactInvoker))
    }
}

const REACT: &str = r#"
name: react-flow
agents:
  - name: solo
    kind: model
    model_id: react-model
    instruction: "Solve the task."
    output_key: answer
orchestration:
  mode: react
  agent: solo
"#;

#[tokio::test]
async fn react_mode_forces_the_plan_react_planner() {
    let d = driver(REACT, Arc::new(ReactProvider));
    let events = collect_events(&d, "solve").await;

    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.author, "solo");
    // Only the final-answer section is recorded.
    assert_eq!(event.actions.state_delta["answer"], json!("all done"));
}
