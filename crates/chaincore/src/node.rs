use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub type NodeId = String;

/// Node specification in a workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSpec {
    pub id: NodeId,
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// Type-specific node configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    End {
        /// `${var}` template or expression evaluated against the context
        #[serde(default)]
        return_value: Option<String>,
    },
    McpTool {
        server_id: String,
        tool_name: String,
        #[serde(default)]
        parameters: HashMap<String, Value>,
        output_variable: Option<String>,
    },
    Transform {
        input_variable: String,
        expression: String,
        output_variable: String,
    },
    Condition {
        condition: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    End,
    McpTool,
    Transform,
    Condition,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Start => "start",
            NodeType::End => "end",
            NodeType::McpTool => "mcp_tool",
            NodeType::Transform => "transform",
            NodeType::Condition => "condition",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Start => NodeType::Start,
            NodeKind::End { .. } => NodeType::End,
            NodeKind::McpTool { .. } => NodeType::McpTool,
            NodeKind::Transform { .. } => NodeType::Transform,
            NodeKind::Condition { .. } => NodeType::Condition,
        }
    }
}

impl NodeSpec {
    pub fn new(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind,
        }
    }

    pub fn start(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeKind::Start)
    }

    pub fn end(id: impl Into<NodeId>, return_value: Option<&str>) -> Self {
        Self::new(
            id,
            NodeKind::End {
                return_value: return_value.map(str::to_string),
            },
        )
    }

    pub fn transform(
        id: impl Into<NodeId>,
        input_variable: impl Into<String>,
        expression: impl Into<String>,
        output_variable: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            NodeKind::Transform {
                input_variable: input_variable.into(),
                expression: expression.into(),
                output_variable: output_variable.into(),
            },
        )
    }

    pub fn condition(id: impl Into<NodeId>, condition: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeKind::Condition {
                condition: condition.into(),
            },
        )
    }

    pub fn tool(
        id: impl Into<NodeId>,
        server_id: impl Into<String>,
        tool_name: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            NodeKind::McpTool {
                server_id: server_id.into(),
                tool_name: tool_name.into(),
                parameters: HashMap::new(),
                output_variable: None,
            },
        )
    }

    /// Add a tool parameter. No-op on non-tool nodes.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let NodeKind::McpTool { parameters, .. } = &mut self.kind {
            parameters.insert(key.into(), value.into());
        }
        self
    }

    /// Set the variable a tool result is bound to. No-op on non-tool nodes.
    pub fn with_output(mut self, variable: impl Into<String>) -> Self {
        if let NodeKind::McpTool {
            output_variable, ..
        } = &mut self.kind
        {
            *output_variable = Some(variable.into());
        }
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}
