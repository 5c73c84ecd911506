//! Flow graph authored in the dashboard's node editor.
//!
//! The controller treats node properties as opaque; only the structural
//! rules needed for deployment are checked here. Visual attributes the editor
//! attaches (selection, measured size, edge styling) are kept in `extra` so a
//! save/load round trip is lossless.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::error::{CampaignError, CampaignResult};

pub const CONDITION_TRUE_HANDLE: &str = "true";
pub const CONDITION_FALSE_HANDLE: &str = "false";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FlowData {
    #[serde(default)]
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub data: NodeData,
    #[serde(flatten, default)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeData {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowEdge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
    #[serde(flatten, default)]
    pub extra: Map<String, Value>,
}

/// Node kinds offered by the editor palette. Unknown kinds are preserved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeType {
    Trigger,
    SendEmail,
    Wait,
    Condition,
    GetSegmentData,
    ParseCsv,
    HttpRequest,
    Code,
    Other(String),
}

impl NodeType {
    pub fn as_str(&self) -> &str {
        match self {
            NodeType::Trigger => "trigger",
            NodeType::SendEmail => "sendEmail",
            NodeType::Wait => "wait",
            NodeType::Condition => "condition",
            NodeType::GetSegmentData => "getSegmentData",
            NodeType::ParseCsv => "parseCSV",
            NodeType::HttpRequest => "httpRequest",
            NodeType::Code => "code",
            NodeType::Other(s) => s,
        }
    }

    /// Trigger nodes start a flow and accept no incoming edges.
    pub fn has_input_handle(&self) -> bool {
        !matches!(self, NodeType::Trigger)
    }

    /// Named output handles; `None` means a single unnamed output.
    pub fn output_handles(&self) -> Option<&'static [&'static str]> {
        match self {
            NodeType::Condition => Some(&[CONDITION_TRUE_HANDLE, CONDITION_FALSE_HANDLE]),
            _ => None,
        }
    }
}

impl From<String> for NodeType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "trigger" => NodeType::Trigger,
            "sendEmail" => NodeType::SendEmail,
            "wait" => NodeType::Wait,
            "condition" => NodeType::Condition,
            "getSegmentData" => NodeType::GetSegmentData,
            "parseCSV" => NodeType::ParseCsv,
            "httpRequest" => NodeType::HttpRequest,
            "code" => NodeType::Code,
            _ => NodeType::Other(value),
        }
    }
}

impl From<NodeType> for String {
    fn from(value: NodeType) -> Self {
        value.as_str().to_string()
    }
}

impl FlowNode {
    pub fn new(id: impl Into<String>, node_type: NodeType, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type,
            position: Position::default(),
            data: NodeData {
                label: label.into(),
                ..NodeData::default()
            },
            extra: Map::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.data.properties.get(key).and_then(Value::as_str)
    }

    /// Display name, falling back to the node type like the editor does.
    pub fn display_name(&self) -> &str {
        if self.data.label.is_empty() {
            self.node_type.as_str()
        } else {
            &self.data.label
        }
    }
}

impl FlowEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: None,
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
            extra: Map::new(),
        }
    }

    pub fn from_handle(mut self, handle: &str) -> Self {
        self.source_handle = Some(handle.to_string());
        self
    }
}

impl FlowData {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn trigger(&self) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.node_type == NodeType::Trigger)
    }

    /// Outgoing edges of `node_id`, in edge order.
    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a FlowEdge> + 'a {
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    /// Every structural problem in the graph, in discovery order.
    pub fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        let mut ids = HashSet::new();

        for node in &self.nodes {
            if node.id.is_empty() {
                issues.push("node with empty id".to_string());
            } else if !ids.insert(node.id.as_str()) {
                issues.push(format!("duplicate node id '{}'", node.id));
            }
        }

        let triggers = self
            .nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Trigger)
            .count();
        if triggers > 1 {
            issues.push(format!("flow has {} trigger nodes, at most one is allowed", triggers));
        }

        for edge in &self.edges {
            let source = self.node(&edge.source);
            let target = self.node(&edge.target);
            if source.is_none() {
                issues.push(format!("edge source '{}' does not reference a node", edge.source));
            }
            if target.is_none() {
                issues.push(format!("edge target '{}' does not reference a node", edge.target));
            }
            if let Some(target) = target {
                if !target.node_type.has_input_handle() {
                    issues.push(format!("trigger node '{}' cannot have incoming edges", target.id));
                }
            }
            if let Some(source) = source {
                match (source.node_type.output_handles(), edge.source_handle.as_deref()) {
                    (Some(handles), Some(handle)) if handles.contains(&handle) => {}
                    (Some(_), handle) => issues.push(format!(
                        "edge from condition node '{}' must use the 'true' or 'false' handle, got {:?}",
                        source.id, handle
                    )),
                    (None, _) => {}
                }
            }
        }

        issues
    }

    pub fn validate(&self) -> CampaignResult<()> {
        let issues = self.issues();
        if issues.is_empty() {
            Ok(())
        } else {
            Err(CampaignError::Validation(issues.join("; ")))
        }
    }
}
