//! A2A discovery cards.
//!
//! Workflows opt into agent-to-agent discovery by carrying an `a2a` block
//! in their definition. For each opted-in workflow the platform publishes
//! one [`AgentCard`] under `{base_url}/a2a/{workflow_name}`; workflows
//! without the block are simply absent from the card list. Cards are
//! generated once at boot and cached for the platform's lifetime;
//! nothing in them can change after hydration.

use crate::agentflow::workflow::WorkflowDefinition;
use serde::Serialize;

/// Published capability flags.
#[derive(Debug, Clone, Serialize)]
pub struct CardCapabilities {
    pub streaming: bool,
}

/// One skill entry on a card.
#[derive(Debug, Clone, Serialize)]
pub struct CardSkill {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
}

/// The discovery document served per opted-in workflow.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCard {
    pub name: String,
    pub description: String,
    pub url: String,
    pub version: String,
    pub capabilities: CardCapabilities,
    pub default_input_modes: Vec<String>,
    pub default_output_modes: Vec<String>,
    pub skills: Vec<CardSkill>,
}

/// Generate cards for every workflow that opted in via its `a2a` block.
pub fn generate_cards<'a, I>(workflows: I, base_url: &str) -> Vec<AgentCard>
where
    I: IntoIterator<Item = &'a WorkflowDefinition>,
{
    let base = base_url.trim_end_matches('/');
    workflows
        .into_iter()
        .filter_map(|def| {
            let a2a = def.a2a.as_ref()?;
            Some(AgentCard {
                name: def.name.clone(),
                description: def.description.clone(),
                url: format!("{}/a2a/{}", base, def.name),
                version: a2a.version.clone(),
                capabilities: CardCapabilities { streaming: true },
                default_input_modes: vec!["text/plain".to_string()],
                default_output_modes: vec!["text/plain".to_string()],
                skills: a2a
                    .skills
                    .iter()
                    .map(|s| CardSkill {
                        id: s.id.clone(),
                        name: s.name.clone(),
                        description: s.description.clone(),
                        tags: s.tags.clone(),
                    })
                    .collect(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentflow::workflow::WorkflowDefinition;

    fn definition(yaml: &str) -> WorkflowDefinition {
        WorkflowDefinition::from_yaml_str(yaml).unwrap()
    }

    #[test]
    fn only_opted_in_workflows_get_cards() {
        let with_a2a = definition(
            r#"
name: published
description: Visible workflow.
agents:
  - name: a
    kind: expression
    expression: '1'
    output_key: x
orchestration:
  mode: sequential
  agents: [a]
a2a:
  version: "1.2.0"
  skills:
    - id: track
      name: Rate tracking
      description: Track an exchange rate.
      tags: [finance]
"#,
        );
        let without = definition(
            r#"
name: hidden
agents:
  - name: a
    kind: expression
    expression: '1'
    output_key: x
orchestration:
  mode: sequential
  agents: [a]
"#,
        );

        let cards = generate_cards([&with_a2a, &without], "https://host/");
        assert_eq!(cards.len(), 1);
        let card = &cards[0];
        assert_eq!(card.name, "published");
        assert_eq!(card.url, "https://host/a2a/published");
        assert_eq!(card.version, "1.2.0");
        assert_eq!(card.skills.len(), 1);
        assert_eq!(card.skills[0].tags, vec!["finance".to_string()]);
    }

    #[test]
    fn cards_serialize_camel_case() {
        let def = definition(
            r#"
name: wf
agents:
  - name: a
    kind: expression
    expression: '1'
    output_key: x
orchestration:
  mode: sequential
  agents: [a]
a2a:
  version: "0.1.0"
"#,
        );
        let cards = generate_cards([&def], "http://localhost:8000");
        let json = serde_json::to_value(&cards[0]).unwrap();
        assert!(json.get("defaultInputModes").is_some());
        assert!(json.get("capabilities").is_some());
    }
}
