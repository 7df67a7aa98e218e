//! ComfyUI API-format workflow graphs: structure checks and input injection.
//!
//! An API-format workflow is a JSON object keyed by node id. Each value
//! holds a `class_type` and an `inputs` object; inputs that are two-element
//! arrays `[source_node_id, output_slot]` are links to another node.
//!
//! ```json
//! {
//!   "2": { "class_type": "LoadImage", "inputs": { "image": "key.png" } },
//!   "5": { "class_type": "WanImageToVideo", "inputs": { "start_image": ["2", 0] } }
//! }
//! ```

use serde_json::{Map, Value};

use crate::error::CoreError;

/// Class type of ComfyUI's built-in image loader.
pub const LOAD_IMAGE_CLASS: &str = "LoadImage";

/// A link from one node's output slot to another node's input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLink {
    pub from_node: String,
    pub from_slot: u64,
    pub to_node: String,
    pub to_input: String,
}

fn nodes(workflow: &Value) -> Result<&Map<String, Value>, CoreError> {
    let obj = workflow
        .as_object()
        .ok_or_else(|| CoreError::Validation("Workflow JSON must be an object".to_string()))?;
    if obj.is_empty() {
        return Err(CoreError::Validation(
            "Workflow JSON must contain at least one node".to_string(),
        ));
    }
    Ok(obj)
}

/// Class type of every node, keyed by node id.
pub fn class_types(workflow: &Value) -> Result<Vec<(String, String)>, CoreError> {
    nodes(workflow)?
        .iter()
        .map(|(id, node)| {
            node.get("class_type")
                .and_then(Value::as_str)
                .map(|ct| (id.clone(), ct.to_string()))
                .ok_or_else(|| {
                    CoreError::Validation(format!(
                        "Node '{id}' is missing required 'class_type' field"
                    ))
                })
        })
        .collect()
}

/// Every `[node_id, slot]` link in the graph.
pub fn links(workflow: &Value) -> Result<Vec<NodeLink>, CoreError> {
    let mut out = Vec::new();
    for (node_id, node) in nodes(workflow)? {
        let Some(inputs) = node.get("inputs").and_then(Value::as_object) else {
            continue;
        };
        for (input_name, value) in inputs {
            let Some([from, slot]) = value.as_array().map(Vec::as_slice) else {
                continue;
            };
            let from_node = match from {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => continue,
            };
            let Some(from_slot) = slot.as_u64() else {
                continue;
            };
            out.push(NodeLink {
                from_node,
                from_slot,
                to_node: node_id.clone(),
                to_input: input_name.clone(),
            });
        }
    }
    Ok(out)
}

/// Reject graphs with missing `class_type` fields or links to absent nodes.
pub fn validate_graph(workflow: &Value) -> Result<(), CoreError> {
    class_types(workflow)?;
    let graph = nodes(workflow)?;
    let dangling: Vec<String> = links(workflow)?
        .into_iter()
        .filter(|l| !graph.contains_key(&l.from_node))
        .map(|l| format!("{}.{} -> {}", l.to_node, l.to_input, l.from_node))
        .collect();
    if dangling.is_empty() {
        Ok(())
    } else {
        Err(CoreError::Validation(format!(
            "Workflow references missing nodes: {}",
            dangling.join(", ")
        )))
    }
}

/// Set `inputs.<input>` on `node_id`.
pub fn set_input(
    workflow: &mut Value,
    node_id: &str,
    input: &str,
    value: Value,
) -> Result<(), CoreError> {
    let inputs = workflow
        .get_mut(node_id)
        .and_then(Value::as_object_mut)
        .ok_or_else(|| CoreError::Validation(format!("Workflow has no node '{node_id}'")))?
        .entry("inputs")
        .or_insert_with(|| Value::Object(Map::new()));
    let inputs = inputs.as_object_mut().ok_or_else(|| {
        CoreError::Validation(format!("Node '{node_id}' has non-object 'inputs'"))
    })?;
    inputs.insert(input.to_string(), value);
    Ok(())
}

/// Point an image-loader node at an uploaded file.
///
/// With `node_id` unset, the loader with the lowest numeric id is used.
/// Returns the id of the node that was updated.
pub fn inject_image(
    workflow: &mut Value,
    node_id: Option<&str>,
    filename: &str,
) -> Result<String, CoreError> {
    let target = match node_id {
        Some(id) => id.to_string(),
        None => first_image_loader(workflow)?,
    };
    set_input(workflow, &target, "image", Value::String(filename.to_string()))?;
    Ok(target)
}

fn first_image_loader(workflow: &Value) -> Result<String, CoreError> {
    class_types(workflow)?
        .into_iter()
        .filter(|(_, ct)| ct == LOAD_IMAGE_CLASS)
        .map(|(id, _)| id)
        .min_by(|a, b| match (a.parse::<u64>(), b.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => a.cmp(b),
        })
        .ok_or_else(|| {
            CoreError::Validation(format!("Workflow has no '{LOAD_IMAGE_CLASS}' node"))
        })
}
