use crate::{NodeId, NodeSpec, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub type WorkflowId = String;

/// Complete workflow definition. Produced by an external loader and treated
/// as read-only by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub description: Option<String>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub variables: Vec<VariableDecl>,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            version: default_version(),
            description: None,
            nodes: Vec::new(),
            edges: Vec::new(),
            variables: Vec::new(),
            servers: Vec::new(),
        }
    }

    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    pub fn connect(&mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) {
        self.edges.push(Edge::new(from, to));
    }

    /// Connect a condition node to the successor taken when it evaluates to
    /// `branch`.
    pub fn connect_branch(&mut self, from: impl Into<NodeId>, to: impl Into<NodeId>, branch: bool) {
        self.edges.push(Edge {
            from: from.into(),
            to: to.into(),
            condition: Some(branch.to_string()),
        });
    }

    pub fn add_variable(&mut self, variable: VariableDecl) {
        self.variables.push(variable);
    }

    pub fn add_server(&mut self, server: ServerConfig) {
        self.servers.push(server);
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Initial variable context: declared defaults overlaid by inputs.
    pub fn initial_context(&self, inputs: &HashMap<String, Value>) -> HashMap<String, Value> {
        let mut context: HashMap<String, Value> = self
            .variables
            .iter()
            .filter_map(|v| v.default.clone().map(|d| (v.name.clone(), d)))
            .collect();
        context.extend(inputs.iter().map(|(k, v)| (k.clone(), v.clone())));
        context
    }
}

/// Directed edge between two nodes. `condition` labels the branch of a
/// condition node (`"true"` or `"false"`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    #[serde(default)]
    pub condition: Option<String>,
}

impl Edge {
    pub fn new(from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
        }
    }

    /// Branch label parsed as a boolean, if any.
    pub fn branch(&self) -> Option<bool> {
        match self.condition.as_deref().map(str::trim) {
            Some(label) if label.eq_ignore_ascii_case("true") => Some(true),
            Some(label) if label.eq_ignore_ascii_case("false") => Some(false),
            _ => None,
        }
    }
}

/// Workflow variable declaration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariableDecl {
    pub name: String,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
    pub description: Option<String>,
}

impl VariableDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            required: false,
            description: None,
        }
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Connection parameters for a tool server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub id: String,
    pub name: Option<String>,
    pub transport: Transport,
}

impl ServerConfig {
    pub fn new(id: impl Into<String>, transport: Transport) -> Self {
        Self {
            id: id.into(),
            name: None,
            transport,
        }
    }

    /// Server served by an in-process tool server registered under `id`.
    pub fn local(id: impl Into<String>) -> Self {
        Self::new(id, Transport::Local)
    }

    pub fn http(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(
            id,
            Transport::Http {
                url: url.into(),
                headers: HashMap::new(),
            },
        )
    }

    pub fn stdio(id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self::new(
            id,
            Transport::Stdio {
                command: command.into(),
                args,
                env: HashMap::new(),
            },
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transport {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    Local,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_context_overlays_inputs_on_defaults() {
        let mut workflow = Workflow::new("vars");
        workflow.add_variable(VariableDecl::new("x").with_default(1));
        workflow.add_variable(VariableDecl::new("y").with_default("keep"));

        let mut inputs = HashMap::new();
        inputs.insert("x".to_string(), Value::from(5));
        let context = workflow.initial_context(&inputs);

        assert_eq!(context.get("x"), Some(&Value::Number(5.0)));
        assert_eq!(context.get("y"), Some(&Value::from("keep")));
    }

    #[test]
    fn test_edge_branch_labels() {
        let mut workflow = Workflow::new("branches");
        workflow.connect_branch("check", "big", true);
        workflow.connect_branch("check", "small", false);
        workflow.connect("big", "end");

        assert_eq!(workflow.edges[0].branch(), Some(true));
        assert_eq!(workflow.edges[1].branch(), Some(false));
        assert_eq!(workflow.edges[2].branch(), None);
    }

    #[test]
    fn test_workflow_deserializes_tagged_nodes() {
        let json = r#"{
            "id": "wf-1",
            "name": "demo",
            "nodes": [
                {"id": "start", "name": null, "type": "start"},
                {"id": "double", "name": null, "type": "transform",
                 "input_variable": "x", "expression": "x * 2", "output_variable": "x"},
                {"id": "end", "name": null, "type": "end", "return_value": "${x}"}
            ],
            "edges": [{"from": "start", "to": "double"}, {"from": "double", "to": "end"}]
        }"#;
        let workflow: Workflow = serde_json::from_str(json).unwrap();
        assert_eq!(workflow.version, "1.0.0");
        assert_eq!(
            workflow.find_node("double").map(|n| n.node_type()),
            Some(crate::NodeType::Transform)
        );
    }
}
