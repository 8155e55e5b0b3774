//! Definition file loading.
//!
//! A definition file is the serde form of [`ProcessDefinition`] in YAML
//! (`.yaml`/`.yml`) or JSON (`.json`). Loading checks references between
//! activities and flows; deeper structural analysis is left to the author,
//! except that unreachable activities are reported as warnings.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use orchestrion_types::definition::{ActivityKind, ProcessDefinition};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DefinitionFileError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid definition: {0}")]
    Invalid(String),
}

/// Serialization format of a definition file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionFormat {
    Yaml,
    Json,
}

impl DefinitionFormat {
    /// Guess from the file extension; anything but `.json` is read as YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

/// Read, parse and check a definition file.
pub async fn load_definition_file(path: &Path) -> Result<ProcessDefinition, DefinitionFileError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| DefinitionFileError::Io {
            path: path.display().to_string(),
            source,
        })?;
    let definition = parse_definition(&content, DefinitionFormat::from_path(path))?;
    tracing::debug!(
        path = %path.display(),
        key = %definition.key,
        activities = definition.activities.len(),
        "definition file loaded"
    );
    Ok(definition)
}

pub fn parse_definition(content: &str, format: DefinitionFormat) -> Result<ProcessDefinition, DefinitionFileError> {
    let definition: ProcessDefinition = match format {
        DefinitionFormat::Yaml => {
            serde_yaml_ng::from_str(content).map_err(|e| DefinitionFileError::Parse(e.to_string()))?
        }
        DefinitionFormat::Json => {
            serde_json::from_str(content).map_err(|e| DefinitionFileError::Parse(e.to_string()))?
        }
    };
    check_references(&definition)?;
    for id in unreachable_activities(&definition) {
        tracing::warn!(key = %definition.key, activity = %id, "activity is unreachable from any start event");
    }
    Ok(definition)
}

pub fn to_yaml(definition: &ProcessDefinition) -> Result<String, DefinitionFileError> {
    serde_yaml_ng::to_string(definition).map_err(|e| DefinitionFileError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

/// Ids are unique and every id a definition mentions exists.
pub fn check_references(def: &ProcessDefinition) -> Result<(), DefinitionFileError> {
    if def.key.trim().is_empty() {
        return Err(DefinitionFileError::Invalid("key must not be empty".to_string()));
    }

    let mut activity_ids = HashSet::new();
    for activity in &def.activities {
        if !activity_ids.insert(activity.id.as_str()) {
            return Err(DefinitionFileError::Invalid(format!(
                "duplicate activity id '{}'",
                activity.id
            )));
        }
    }
    if def.start_activities(None).is_empty() {
        return Err(DefinitionFileError::Invalid("no top-level start_event".to_string()));
    }

    let mut flow_ids = HashSet::new();
    for flow in &def.flows {
        if !flow_ids.insert(flow.id.as_str()) {
            return Err(DefinitionFileError::Invalid(format!("duplicate flow id '{}'", flow.id)));
        }
        for end in [&flow.source, &flow.target] {
            if !activity_ids.contains(end.as_str()) {
                return Err(DefinitionFileError::Invalid(format!(
                    "flow '{}' references unknown activity '{end}'",
                    flow.id
                )));
            }
        }
    }

    for activity in &def.activities {
        if let Some(parent) = &activity.parent {
            let is_scope = def
                .activity(parent)
                .is_some_and(|p| p.kind == ActivityKind::SubProcess);
            if !is_scope {
                return Err(DefinitionFileError::Invalid(format!(
                    "activity '{}' names '{parent}' as parent, which is not a sub_process",
                    activity.id
                )));
            }
        }
        if let ActivityKind::ExclusiveGateway {
            default_flow: Some(default_flow),
        }
        | ActivityKind::InclusiveGateway {
            default_flow: Some(default_flow),
        } = &activity.kind
        {
            let leaves = def.flow(default_flow).is_some_and(|f| f.source == activity.id);
            if !leaves {
                return Err(DefinitionFileError::Invalid(format!(
                    "default flow '{default_flow}' of gateway '{}' does not leave it",
                    activity.id
                )));
            }
        }
        if let ActivityKind::ErrorBoundaryEvent { attached_to, .. } = &activity.kind {
            check_boundary(def, &activity.id, attached_to, activity.parent.as_deref())?;
        }
        if matches!(activity.kind, ActivityKind::ErrorEndEvent { .. }) && def.outgoing(&activity.id).next().is_some() {
            return Err(DefinitionFileError::Invalid(format!(
                "error_end_event '{}' must not have outgoing flows",
                activity.id
            )));
        }
        if activity.kind == ActivityKind::SubProcess && def.start_activities(Some(&activity.id)).is_empty() {
            return Err(DefinitionFileError::Invalid(format!(
                "sub_process '{}' has no start_event",
                activity.id
            )));
        }
    }
    Ok(())
}

/// A boundary event sits in the scope of the activity it is attached to,
/// which must be able to hold a token, and is only entered by a thrown error.
fn check_boundary(
    def: &ProcessDefinition,
    boundary: &str,
    attached_to: &str,
    parent: Option<&str>,
) -> Result<(), DefinitionFileError> {
    let host = def.activity(attached_to).ok_or_else(|| {
        DefinitionFileError::Invalid(format!("boundary event '{boundary}' is attached to unknown activity '{attached_to}'"))
    })?;
    let can_host = matches!(
        host.kind,
        ActivityKind::ServiceTask { .. }
            | ActivityKind::ExternalTask { .. }
            | ActivityKind::ReceiveTask { .. }
            | ActivityKind::CallActivity { .. }
            | ActivityKind::SubProcess
    );
    if !can_host {
        return Err(DefinitionFileError::Invalid(format!(
            "boundary event '{boundary}' cannot be attached to {} '{attached_to}'",
            host.activity_type()
        )));
    }
    if host.parent.as_deref() != parent {
        return Err(DefinitionFileError::Invalid(format!(
            "boundary event '{boundary}' must share the parent of '{attached_to}'"
        )));
    }
    if def.incoming(boundary).next().is_some() {
        return Err(DefinitionFileError::Invalid(format!(
            "boundary event '{boundary}' must not have incoming flows"
        )));
    }
    Ok(())
}

/// Activities no start event can reach. Sub-process start events count as
/// entry points of their scope, and a sub-process reaches its children.
pub fn unreachable_activities(def: &ProcessDefinition) -> Vec<String> {
    let mut graph = DiGraph::<&str, ()>::new();
    let index: HashMap<&str, NodeIndex> = def
        .activities
        .iter()
        .map(|a| (a.id.as_str(), graph.add_node(a.id.as_str())))
        .collect();

    for flow in &def.flows {
        if let (Some(&from), Some(&to)) = (index.get(flow.source.as_str()), index.get(flow.target.as_str())) {
            graph.add_edge(from, to, ());
        }
    }
    for activity in &def.activities {
        if let Some(parent) = &activity.parent {
            if let (Some(&from), Some(&to)) = (index.get(parent.as_str()), index.get(activity.id.as_str())) {
                graph.add_edge(from, to, ());
            }
        }
        if let ActivityKind::ErrorBoundaryEvent { attached_to, .. } = &activity.kind {
            if let (Some(&from), Some(&to)) = (index.get(attached_to.as_str()), index.get(activity.id.as_str())) {
                graph.add_edge(from, to, ());
            }
        }
    }

    let mut reached = HashSet::new();
    for start in def.start_activities(None) {
        let mut dfs = Dfs::new(&graph, index[start.id.as_str()]);
        while let Some(node) = dfs.next(&graph) {
            reached.insert(graph[node]);
        }
    }

    def.activities
        .iter()
        .filter(|a| !reached.contains(a.id.as_str()))
        .map(|a| a.id.clone())
        .collect()
}
