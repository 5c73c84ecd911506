//! Translation of a campaign [`FlowData`] graph into an n8n workflow.
//!
//! n8n addresses nodes by name and wires them through a `connections` map:
//! `{ "<source name>": { "main": [[targets of output 0], [targets of output 1]] } }`.
//! Condition nodes map to `n8n-nodes-base.if`, whose output 0 is the `true`
//! branch and output 1 the `false` branch.

use campaign_core::flow::{FlowData, FlowNode, NodeType, CONDITION_FALSE_HANDLE};
use campaign_core::{CampaignError, CampaignResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct N8nWorkflow {
    pub name: String,
    pub nodes: Vec<N8nNode>,
    pub connections: BTreeMap<String, N8nNodeConnections>,
    #[serde(default)]
    pub settings: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct N8nNode {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub type_version: u32,
    pub position: [i64; 2],
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct N8nNodeConnections {
    pub main: Vec<Vec<N8nConnection>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct N8nConnection {
    pub node: String,
    #[serde(rename = "type")]
    pub connection_type: String,
    pub index: u32,
}

impl N8nWorkflow {
    pub fn webhook_node(&self) -> Option<&N8nNode> {
        self.nodes.iter().find(|n| n.node_type == "n8n-nodes-base.webhook")
    }

    /// Webhook path of the trigger node, if the workflow has one.
    pub fn webhook_path(&self) -> Option<&str> {
        self.webhook_node()
            .and_then(|n| n.parameters.get("path"))
            .and_then(Value::as_str)
    }
}

/// Default webhook path assigned to a campaign's trigger node.
pub fn default_webhook_path(campaign_id: Uuid) -> String {
    format!("campaign-{}", campaign_id)
}

/// Build the n8n workflow for a campaign flow.
///
/// Structural problems surface as `Validation`; node types or properties the
/// engine cannot run surface as `DeploymentRejected`.
pub fn translate(campaign_id: Uuid, campaign_name: &str, flow: &FlowData) -> CampaignResult<N8nWorkflow> {
    flow.validate()?;
    if flow.nodes.is_empty() {
        return Err(CampaignError::DeploymentRejected("flow has no nodes".to_string()));
    }
    if let Some(node) = flow
        .nodes
        .iter()
        .find(|n| n.node_type == NodeType::Condition && flow.outgoing(&n.id).next().is_none())
    {
        return Err(rejected(node, "condition has neither a true nor a false branch".to_string()));
    }

    let names = unique_names(flow);
    let mut nodes = Vec::with_capacity(flow.nodes.len());
    for node in &flow.nodes {
        nodes.push(translate_node(campaign_id, node, &names[node.id.as_str()])?);
    }

    let mut connections: BTreeMap<String, N8nNodeConnections> = BTreeMap::new();
    for node in &flow.nodes {
        let outputs = match node.node_type {
            NodeType::Condition => 2,
            _ => 1,
        };
        let mut main: Vec<Vec<N8nConnection>> = vec![Vec::new(); outputs];
        for edge in flow.outgoing(&node.id) {
            let output = match (&node.node_type, edge.source_handle.as_deref()) {
                (NodeType::Condition, Some(CONDITION_FALSE_HANDLE)) => 1,
                _ => 0,
            };
            main[output].push(N8nConnection {
                node: names[edge.target.as_str()].clone(),
                connection_type: "main".to_string(),
                index: 0,
            });
        }
        if main.iter().any(|targets| !targets.is_empty()) {
            connections.insert(names[node.id.as_str()].clone(), N8nNodeConnections { main });
        }
    }

    Ok(N8nWorkflow {
        name: format!("Campaign: {} [{}]", campaign_name, campaign_id),
        nodes,
        connections,
        settings: json!({ "executionOrder": "v1" }),
    })
}

/// n8n requires unique node names. The first node with a label keeps it;
/// later repeats get the lowest numeric suffix no other node uses.
fn unique_names(flow: &FlowData) -> HashMap<&str, String> {
    let mut taken: HashSet<String> = HashSet::with_capacity(flow.nodes.len());
    let mut names = HashMap::with_capacity(flow.nodes.len());
    let mut repeats = Vec::new();
    for node in &flow.nodes {
        let base = node.display_name();
        if taken.insert(base.to_string()) {
            names.insert(node.id.as_str(), base.to_string());
        } else {
            repeats.push(node);
        }
    }
    for node in repeats {
        let base = node.display_name();
        let mut suffix = 2;
        let mut name = format!("{} {}", base, suffix);
        while taken.contains(&name) {
            suffix += 1;
            name = format!("{} {}", base, suffix);
        }
        taken.insert(name.clone());
        names.insert(node.id.as_str(), name);
    }
    names
}

fn translate_node(campaign_id: Uuid, node: &FlowNode, name: &str) -> CampaignResult<N8nNode> {
    let mut webhook_id = None;
    let (node_type, type_version, parameters) = match &node.node_type {
        NodeType::Trigger => {
            let path = node
                .property_str("webhookPath")
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| default_webhook_path(campaign_id));
            let method = node.property_str("httpMethod").unwrap_or("POST");
            if !matches!(method, "POST" | "GET") {
                return Err(rejected(node, format!("unsupported webhook method '{}'", method)));
            }
            webhook_id = Some(Uuid::new_v4().to_string());
            (
                "n8n-nodes-base.webhook",
                2,
                json!({ "path": path, "httpMethod": method, "responseMode": "onReceived" }),
            )
        }
        NodeType::SendEmail => (
            "n8n-nodes-base.emailSend",
            2,
            json!({
                "toEmail": to_expression(node.property_str("to").unwrap_or("{{email}}")),
                "subject": to_expression(node.property_str("subject").unwrap_or_default()),
                "emailFormat": "text",
                "text": to_expression(node.property_str("body").unwrap_or_default()),
            }),
        ),
        NodeType::Wait => {
            let amount = wait_amount(node)?;
            let unit = node.property_str("unit").unwrap_or("minutes");
            if !matches!(unit, "seconds" | "minutes" | "hours" | "days") {
                return Err(rejected(node, format!("unsupported wait unit '{}'", unit)));
            }
            ("n8n-nodes-base.wait", 1, json!({ "resume": "timeInterval", "amount": amount, "unit": unit }))
        }
        NodeType::Condition => ("n8n-nodes-base.if", 1, condition_parameters(node)?),
        NodeType::GetSegmentData => (
            "n8n-nodes-base.awsS3",
            2,
            json!({
                "operation": "download",
                "bucketName": node.property_str("bucket").unwrap_or_default(),
                "fileKey": node.property_str("key").unwrap_or_default(),
            }),
        ),
        NodeType::ParseCsv => {
            let has_header = node
                .data
                .properties
                .get("hasHeader")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            (
                "n8n-nodes-base.spreadsheetFile",
                2,
                json!({
                    "operation": "fromFile",
                    "fileFormat": "csv",
                    "options": {
                        "delimiter": node.property_str("delimiter").filter(|d| !d.is_empty()).unwrap_or(","),
                        "headerRow": has_header,
                    },
                }),
            )
        }
        NodeType::HttpRequest => http_request(node)?,
        NodeType::Code => (
            "n8n-nodes-base.code",
            2,
            json!({ "jsCode": node.property_str("jsCode").unwrap_or("return $input.all();") }),
        ),
        NodeType::Other(kind) => {
            return Err(rejected(node, format!("node type '{}' is not supported by the engine", kind)));
        }
    };

    Ok(N8nNode {
        id: node.id.clone(),
        name: name.to_string(),
        node_type: node_type.to_string(),
        type_version,
        position: [node.position.x.round() as i64, node.position.y.round() as i64],
        parameters,
        webhook_id,
    })
}

fn rejected(node: &FlowNode, reason: String) -> CampaignError {
    CampaignError::DeploymentRejected(format!("node '{}': {}", node.display_name(), reason))
}

fn wait_amount(node: &FlowNode) -> CampaignResult<f64> {
    let amount = match node.data.properties.get("amount") {
        None => 1.0,
        Some(Value::Number(n)) => n.as_f64().unwrap_or(-1.0),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| rejected(node, format!("wait amount '{}' is not a number", s)))?,
        Some(other) => return Err(rejected(node, format!("wait amount {} is not a number", other))),
    };
    if amount < 0.0 || !amount.is_finite() {
        return Err(rejected(node, "wait amount must be a non-negative number".to_string()));
    }
    Ok(amount)
}

fn condition_parameters(node: &FlowNode) -> CampaignResult<Value> {
    let operator = node.property_str("operator").unwrap_or("equals");
    let (kind, operation) = match operator {
        "equals" => ("string", "equal"),
        "notEquals" => ("string", "notEqual"),
        "contains" => ("string", "contains"),
        "greaterThan" => ("number", "larger"),
        "lessThan" => ("number", "smaller"),
        other => return Err(rejected(node, format!("unsupported condition operator '{}'", other))),
    };
    let field = node.property_str("field").unwrap_or_default();
    let value = node.property_str("value").unwrap_or_default();
    let value2 = if kind == "number" {
        let parsed = value
            .trim()
            .parse::<f64>()
            .map_err(|_| rejected(node, format!("'{}' is not a number", value)))?;
        json!(parsed)
    } else {
        json!(to_expression(value))
    };

    let mut conditions = Map::new();
    conditions.insert(
        kind.to_string(),
        json!([{ "value1": field_expression(field), "operation": operation, "value2": value2 }]),
    );
    Ok(json!({ "conditions": conditions }))
}

fn http_request(node: &FlowNode) -> CampaignResult<(&'static str, u32, Value)> {
    let url = node.property_str("url").unwrap_or_default();
    if url.is_empty() {
        return Err(rejected(node, "HTTP request node needs a URL".to_string()));
    }
    let method = node.property_str("method").unwrap_or("GET");
    if !matches!(method, "GET" | "POST" | "PUT" | "DELETE" | "PATCH") {
        return Err(rejected(node, format!("unsupported HTTP method '{}'", method)));
    }
    let mut parameters = json!({ "url": to_expression(url), "method": method });
    if let Some(headers) = node.property_str("headers").filter(|h| !h.trim().is_empty()) {
        serde_json::from_str::<Value>(headers)
            .map_err(|e| rejected(node, format!("headers are not valid JSON: {}", e)))?;
        parameters["sendHeaders"] = json!(true);
        parameters["specifyHeaders"] = json!("json");
        parameters["jsonHeaders"] = json!(headers);
    }
    if let Some(body) = node.property_str("body").filter(|b| !b.trim().is_empty()) {
        parameters["sendBody"] = json!(true);
        parameters["specifyBody"] = json!("json");
        parameters["jsonBody"] = json!(to_expression(body));
    }
    Ok(("n8n-nodes-base.httpRequest", 4, parameters))
}

/// A bare field name or `{{field}}` placeholder as an n8n item expression.
fn field_expression(field: &str) -> String {
    let trimmed = field.trim();
    let inner = trimmed
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
        .unwrap_or(trimmed)
        .trim();
    format!("={{{{ $json.{} }}}}", inner)
}

/// Rewrite editor placeholders (`{{email}}`) into n8n expressions
/// (`={{ $json.email }}`). Text without placeholders is returned unchanged.
pub fn to_expression(text: &str) -> String {
    if !text.contains("{{") {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len() + 16);
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let inner = after[..end].trim();
                if !inner.is_empty() && inner.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.') {
                    out.push_str(&format!("{{{{ $json.{} }}}}", inner));
                } else {
                    out.push_str(&format!("{{{{ {} }}}}", inner));
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    format!("={}", out)
}
