use agentflow::agentflow::hydrator::{HydrationError, Hydrator};
use agentflow::agentflow::tool_registry::ToolRegistry;
use agentflow::agentflow::workflow::WorkflowDefinition;
use agentflow::{ModelInvoker, ModelProvider};
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

fn hydrate(yaml: &str) -> Result<(), HydrationError> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut registry = ToolRegistry::new();
    registry.discover();
    let def = WorkflowDefinition::from_yaml_str(yaml).unwrap();
    Hydrator::new(Arc::new(registry), Arc::new(NoModels))
        .hydrate(&def, Path::new("."))
        .map(|_| ())
}

fn expression_workflow(expression: &str, input_keys: &str) -> String {
    format!(
        r#"
name: sandboxed
agents:
  - name: evaluator
    kind: expression
    expression: {expression}
    input_keys: {input_keys}
    output_key: out
orchestration:
  mode: sequential
  agents: [evaluator]
"#,
        expression = expression,
        input_keys = input_keys
    )
}

#[test]
fn dunder_import_refuses_to_load_and_names_the_construct() {
    let yaml = expression_workflow(r#""__import__('os').system('x')""#, "[]");
    let err = hydrate(&yaml).unwrap_err();
    match &err {
        HydrationError::Sandbox { agent, .. } => assert_eq!(agent, "evaluator"),
        other => panic!("expected sandbox error, got {}", other),
    }
    assert!(err.to_string().contains("__import__"));
}

#[test]
fn eval_and_open_are_forbidden_by_name() {
    for construct in ["eval(x)", "open(x)", "exec(x)", "breakpoint()"] {
        let yaml = expression_workflow(&format!("'{}'", construct), "[x]");
        let err = hydrate(&yaml).unwrap_err();
        assert!(
            matches!(err, HydrationError::Sandbox { .. }),
            "'{}' must be rejected at hydration",
            construct
        );
    }
}

#[test]
fn unknown_names_are_rejected_at_hydration() {
    let yaml = expression_workflow("'known + unknown'", "[known]");
    let err = hydrate(&yaml).unwrap_err();
    assert!(err.to_string().contains("unknown"));
}

#[test]
fn non_whitelisted_functions_are_rejected() {
    // regex matching is deliberately outside the whitelist
    let yaml = expression_workflow(r#"'str::regex_matches(v, "a+")'"#, "[v]");
    assert!(hydrate(&yaml).is_err());
}

#[test]
fn whitelisted_expressions_hydrate() {
    for (expression, keys) in [
        ("'rate > threshold'", "[rate, threshold]"),
        (r#"'if(len(items) > 0, sum(items), 0)'"#, "[items]"),
        (r#"'"prefix-" + str::from(n)'"#, "[n]"),
        ("'min(a, b) + max(a, b)'", "[a, b]"),
    ] {
        let yaml = expression_workflow(expression, keys);
        assert!(
            hydrate(&yaml).is_ok(),
            "expected {} to hydrate cleanly",
            expression
        );
    }
}
