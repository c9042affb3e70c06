//! Parsing, validation and the single-retry protocol for model tool selections.
//!
//! A model answers with a JSON object naming a server plus a tool (or a
//! resource). The answer is checked against the current [`ProviderSnapshot`];
//! on failure the model gets exactly one corrective prompt before the caller's
//! fallback message is used instead.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{McpError, Result};
use crate::snapshot::ProviderSnapshot;

/// A validated choice made by the model.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolSelection {
    Tool {
        server_name: String,
        tool_name: String,
        arguments: Map<String, Value>,
        rationale: Option<String>,
    },
    Resource {
        server_name: String,
        uri: String,
        rationale: Option<String>,
    },
    /// The model decided none of the tools apply.
    NoToolAvailable { rationale: Option<String> },
}

impl ToolSelection {
    pub fn server_name(&self) -> Option<&str> {
        match self {
            ToolSelection::Tool { server_name, .. } | ToolSelection::Resource { server_name, .. } => {
                Some(server_name.as_str())
            }
            ToolSelection::NoToolAvailable { .. } => None,
        }
    }

    pub fn rationale(&self) -> Option<&str> {
        match self {
            ToolSelection::Tool { rationale, .. }
            | ToolSelection::Resource { rationale, .. }
            | ToolSelection::NoToolAvailable { rationale } => rationale.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("Response does not contain a JSON object")]
    NoJson,

    #[error("Response JSON is malformed: {0}")]
    Malformed(String),

    #[error("Missing field '{0}'")]
    MissingField(&'static str),

    #[error("Specify either 'tool_name' or 'resource_uri', not both")]
    Ambiguous,

    #[error("'arguments' must be a JSON object")]
    InvalidArguments,

    #[error("Unknown server '{server}'. Available servers: {available}")]
    UnknownServer { server: String, available: String },

    #[error("Server '{server}' has no tool '{tool}'. Available tools: {available}")]
    UnknownTool {
        server: String,
        tool: String,
        available: String,
    },

    #[error("Server '{server}' has no resource '{uri}'")]
    UnknownResource { server: String, uri: String },

    #[error("Tool '{tool}' is missing required arguments: {missing}")]
    MissingArguments { tool: String, missing: String },
}

impl From<SelectionError> for McpError {
    fn from(e: SelectionError) -> Self {
        McpError::SelectionValidation(e.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct RawSelection {
    server_name: Option<String>,
    tool_name: Option<String>,
    resource_uri: Option<String>,
    arguments: Option<Value>,
    rationale: Option<String>,
    #[serde(default)]
    no_tool_available: bool,
}

/// Find the first balanced JSON object in `text`.
///
/// Handles prose around the object and fenced json code blocks.
pub fn extract_json(text: &str) -> Option<&str> {
    text.match_indices('{').find_map(|(start, _)| {
        let end = balanced_end(&text[start..])?;
        let candidate = &text[start..start + end];
        serde_json::from_str::<Map<String, Value>>(candidate)
            .is_ok()
            .then_some(candidate)
    })
}

fn balanced_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse model text into a selection without looking at any catalog.
pub fn parse_selection(text: &str) -> std::result::Result<ToolSelection, SelectionError> {
    let json = extract_json(text).ok_or(SelectionError::NoJson)?;
    let raw: RawSelection =
        serde_json::from_str(json).map_err(|e| SelectionError::Malformed(e.to_string()))?;

    if raw.no_tool_available {
        return Ok(ToolSelection::NoToolAvailable {
            rationale: raw.rationale,
        });
    }

    let server_name = raw
        .server_name
        .filter(|name| !name.is_empty())
        .ok_or(SelectionError::MissingField("server_name"))?;

    match (raw.tool_name, raw.resource_uri) {
        (Some(_), Some(_)) => Err(SelectionError::Ambiguous),
        (Some(tool_name), None) => {
            let arguments = match raw.arguments {
                None | Some(Value::Null) => Map::new(),
                Some(Value::Object(map)) => map,
                Some(_) => return Err(SelectionError::InvalidArguments),
            };
            Ok(ToolSelection::Tool {
                server_name,
                tool_name,
                arguments,
                rationale: raw.rationale,
            })
        }
        (None, Some(uri)) => Ok(ToolSelection::Resource {
            server_name,
            uri,
            rationale: raw.rationale,
        }),
        (None, None) => Err(SelectionError::MissingField("tool_name")),
    }
}

/// Checks raw model text against a snapshot.
pub trait SelectionValidator: Send + Sync {
    fn validate(
        &self,
        response: &str,
        snapshot: &ProviderSnapshot,
    ) -> std::result::Result<ToolSelection, SelectionError>;
}

/// Exact, case-sensitive matching against the snapshot's catalogs.
#[derive(Debug, Clone, Copy, Default)]
pub struct CatalogValidator;

impl SelectionValidator for CatalogValidator {
    fn validate(
        &self,
        response: &str,
        snapshot: &ProviderSnapshot,
    ) -> std::result::Result<ToolSelection, SelectionError> {
        let selection = parse_selection(response)?;

        let Some(server_name) = selection.server_name() else {
            return Ok(selection);
        };
        let catalog = snapshot
            .catalog(server_name)
            .ok_or_else(|| SelectionError::UnknownServer {
                server: server_name.to_string(),
                available: list_or_none(snapshot.server_names()),
            })?;

        match &selection {
            ToolSelection::Tool {
                server_name,
                tool_name,
                arguments,
                ..
            } => {
                let tool = catalog
                    .tool(tool_name)
                    .ok_or_else(|| SelectionError::UnknownTool {
                        server: server_name.clone(),
                        tool: tool_name.clone(),
                        available: list_or_none(
                            catalog.tools.iter().map(|tool| tool.name.as_str()).collect(),
                        ),
                    })?;

                let missing: Vec<&str> = tool
                    .required_arguments()
                    .into_iter()
                    .filter(|name| !arguments.contains_key(*name))
                    .collect();
                if !missing.is_empty() {
                    return Err(SelectionError::MissingArguments {
                        tool: tool_name.clone(),
                        missing: missing.join(", "),
                    });
                }
            }
            ToolSelection::Resource {
                server_name, uri, ..
            } => {
                if !catalog.has_resource(uri) {
                    return Err(SelectionError::UnknownResource {
                        server: server_name.clone(),
                        uri: uri.clone(),
                    });
                }
            }
            ToolSelection::NoToolAvailable { .. } => {}
        }

        Ok(selection)
    }
}

fn list_or_none(names: Vec<&str>) -> String {
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}

/// The external generation step that produces selection text.
#[async_trait]
pub trait SelectionModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Initial,
    Retrying,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectionOutcome {
    Selected {
        selection: ToolSelection,
        /// Whether the corrective round trip was needed
        retried: bool,
    },
    Fallback {
        message: String,
        /// Why the last attempt was rejected
        reason: String,
    },
}

/// Validates a model response, allowing one corrective round trip.
pub struct SelectionRetry<'a> {
    model: &'a dyn SelectionModel,
    validator: &'a dyn SelectionValidator,
    fallback_message: String,
}

impl<'a> SelectionRetry<'a> {
    pub fn new(
        model: &'a dyn SelectionModel,
        validator: &'a dyn SelectionValidator,
        fallback_message: impl Into<String>,
    ) -> Self {
        Self {
            model,
            validator,
            fallback_message: fallback_message.into(),
        }
    }

    pub async fn run(&self, response: &str, snapshot: &ProviderSnapshot) -> SelectionOutcome {
        let mut state = RetryState::Initial;
        let mut response = response.to_string();

        loop {
            let error = match self.validator.validate(&response, snapshot) {
                Ok(selection) => {
                    debug!("Tool selection accepted: {:?}", selection);
                    return SelectionOutcome::Selected {
                        selection,
                        retried: state == RetryState::Retrying,
                    };
                }
                Err(error) => error,
            };

            if state == RetryState::Retrying {
                warn!("Tool selection rejected after retry: {}", error);
                return self.fallback(error.to_string());
            }

            info!("Tool selection rejected, asking the model to correct it: {}", error);
            let prompt = build_feedback_prompt(&response, &error, snapshot);
            response = match self.model.complete(&prompt).await {
                Ok(next) => next,
                Err(e) => {
                    warn!("Corrective selection request failed: {}", e);
                    return self.fallback(e.to_string());
                }
            };
            state = RetryState::Retrying;
        }
    }

    fn fallback(&self, reason: String) -> SelectionOutcome {
        SelectionOutcome::Fallback {
            message: self.fallback_message.clone(),
            reason,
        }
    }
}

const RESPONSE_FORMAT: &str = r#"Respond with exactly one JSON object in one of these forms:
{"server_name": "...", "tool_name": "...", "arguments": {...}, "rationale": "..."}
{"server_name": "...", "resource_uri": "...", "rationale": "..."}
{"no_tool_available": true, "rationale": "..."}"#;

/// First prompt asking the model to pick a tool for `request`.
pub fn build_selection_prompt(request: &str, snapshot: &ProviderSnapshot) -> String {
    format!(
        "Choose the MCP tool or resource that best answers the request below.\n\n\
         Request:\n{}\n\n\
         Available MCP servers:\n{}\n\n\
         {}",
        request, snapshot.summary, RESPONSE_FORMAT
    )
}

/// Corrective prompt quoting the rejected response and what was wrong with it.
pub fn build_feedback_prompt(
    response: &str,
    error: &SelectionError,
    snapshot: &ProviderSnapshot,
) -> String {
    format!(
        "Your previous tool selection could not be used.\n\n\
         Previous response:\n{}\n\n\
         Problem: {}\n\n\
         Use names exactly as listed. Available MCP servers:\n{}\n\n\
         {}",
        response, error, snapshot.summary, RESPONSE_FORMAT
    )
}
