use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::Write;
use tracing::{debug, warn};

use crate::error::Result;
use crate::protocol::McpClient;
use crate::types::{McpResource, McpResourceTemplate, McpTool};

/// Include/exclude filter applied to a server's tool list.
///
/// A non-empty include set narrows first; the exclude set always removes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolFilter {
    include: BTreeSet<String>,
    exclude: BTreeSet<String>,
}

impl ToolFilter {
    pub fn new(
        include: impl IntoIterator<Item = String>,
        exclude: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            include: include.into_iter().collect(),
            exclude: exclude.into_iter().collect(),
        }
    }

    pub fn allows(&self, tool_name: &str) -> bool {
        if !self.include.is_empty() && !self.include.contains(tool_name) {
            return false;
        }
        !self.exclude.contains(tool_name)
    }

    pub fn apply(&self, tools: Vec<McpTool>) -> Vec<McpTool> {
        tools
            .into_iter()
            .filter(|tool| self.allows(&tool.name))
            .collect()
    }
}

/// What one server advertises, after filtering.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCatalog {
    pub tools: Vec<McpTool>,
    pub resources: Vec<McpResource>,
    pub resource_templates: Vec<McpResourceTemplate>,
}

impl ServerCatalog {
    pub fn tool(&self, name: &str) -> Option<&McpTool> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    /// Whether `uri` names a listed resource or fits one of the templates.
    pub fn has_resource(&self, uri: &str) -> bool {
        self.resources.iter().any(|resource| resource.uri == uri)
            || self
                .resource_templates
                .iter()
                .any(|template| template_matches(&template.uri_template, uri))
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.resources.is_empty() && self.resource_templates.is_empty()
    }
}

/// Match `uri` against an RFC 6570 style template by its literal parts.
/// Each placeholder must stand for at least one character.
fn template_matches(template: &str, uri: &str) -> bool {
    let mut literals = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        literals.push(&rest[..open]);
        match rest[open..].find('}') {
            Some(close) => rest = &rest[open + close + 1..],
            None => return template == uri,
        }
    }
    literals.push(rest);

    if literals.len() == 1 {
        return template == uri;
    }

    let placeholders = literals.len() - 1;
    let (first, last) = (literals[0], literals[placeholders]);
    if !uri.starts_with(first)
        || !uri.ends_with(last)
        || uri.len() < first.len() + last.len() + placeholders
    {
        return false;
    }

    let mut cursor = first.len();
    let end = uri.len() - last.len();
    for literal in &literals[1..placeholders] {
        let Some(skip) = uri[cursor..end].chars().next().map(char::len_utf8) else {
            return false;
        };
        cursor += skip;
        match uri[cursor..end].find(literal) {
            Some(pos) => cursor += pos + literal.len(),
            None => return false,
        }
    }
    cursor < end
}

/// Fetches and filters a server's catalog.
pub struct CatalogBuilder;

impl CatalogBuilder {
    /// Tools are required; resources and templates are optional and an error
    /// fetching them yields an empty list.
    pub async fn fetch(
        server_name: &str,
        client: &dyn McpClient,
        filter: &ToolFilter,
    ) -> Result<ServerCatalog> {
        let tools = client.list_tools().await?;
        let fetched = tools.len();
        let tools = filter.apply(dedupe_tools(server_name, tools));
        debug!(
            "MCP server '{}' advertised {} tools, {} after filtering",
            server_name,
            fetched,
            tools.len()
        );

        let resources = client.list_resources().await.unwrap_or_else(|e| {
            warn!("MCP server '{}' did not list resources: {}", server_name, e);
            Vec::new()
        });

        let resource_templates = client.list_resource_templates().await.unwrap_or_else(|e| {
            warn!(
                "MCP server '{}' did not list resource templates: {}",
                server_name, e
            );
            Vec::new()
        });

        Ok(ServerCatalog {
            tools,
            resources,
            resource_templates,
        })
    }
}

/// Tool names are unique per server; keep the first of any duplicates.
fn dedupe_tools(server_name: &str, tools: Vec<McpTool>) -> Vec<McpTool> {
    let mut seen = HashSet::new();
    tools
        .into_iter()
        .filter(|tool| {
            let fresh = seen.insert(tool.name.clone());
            if !fresh {
                warn!(
                    "MCP server '{}' listed tool '{}' twice, keeping the first",
                    server_name, tool.name
                );
            }
            fresh
        })
        .collect()
}

/// Render the catalogs as prompt text, one section per server.
pub fn render_summary(catalogs: &BTreeMap<String, ServerCatalog>) -> String {
    let mut out = String::new();

    for (server, catalog) in catalogs {
        let _ = writeln!(out, "## Server: {}", server);

        if catalog.tools.is_empty() {
            let _ = writeln!(out, "Tools: none");
        } else {
            let _ = writeln!(out, "Tools:");
            for tool in &catalog.tools {
                let _ = writeln!(out, "- {}: {}", tool.name, one_line(&tool.description));
                let params = render_parameters(tool);
                if !params.is_empty() {
                    let _ = writeln!(out, "  Parameters: {}", params);
                }
            }
        }

        if !catalog.resources.is_empty() {
            let _ = writeln!(out, "Resources:");
            for resource in &catalog.resources {
                let _ = writeln!(
                    out,
                    "- {} ({}){}",
                    resource.uri,
                    resource.name,
                    describe(resource.description.as_deref())
                );
            }
        }

        if !catalog.resource_templates.is_empty() {
            let _ = writeln!(out, "Resource templates:");
            for template in &catalog.resource_templates {
                let _ = writeln!(
                    out,
                    "- {} ({}){}",
                    template.uri_template,
                    template.name,
                    describe(template.description.as_deref())
                );
            }
        }

        out.push('\n');
    }

    out.trim_end().to_string()
}

fn describe(description: Option<&str>) -> String {
    match description {
        Some(text) if !text.trim().is_empty() => format!(": {}", one_line(text)),
        _ => String::new(),
    }
}

fn one_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn render_parameters(tool: &McpTool) -> String {
    let Some(properties) = tool
        .input_schema
        .get("properties")
        .and_then(|properties| properties.as_object())
    else {
        return String::new();
    };

    let required = tool.required_arguments();
    properties
        .iter()
        .map(|(name, schema)| {
            let kind = schema
                .get("type")
                .and_then(|kind| kind.as_str())
                .unwrap_or("any");
            let marker = if required.contains(&name.as_str()) {
                ", required"
            } else {
                ""
            };
            format!("{} ({}{})", name, kind, marker)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> McpTool {
        McpTool {
            name: name.to_string(),
            description: format!("{} tool", name),
            input_schema: json!({}),
        }
    }

    fn names(tools: &[McpTool]) -> Vec<&str> {
        tools.iter().map(|t| t.name.as_str()).collect()
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn include_narrows_then_exclude_removes() {
        let tools = vec![tool("get_gene"), tool("gget_search"), tool("gget_seq")];
        let filter = ToolFilter::new(
            strings(&["get_gene", "gget_search"]),
            strings(&["gget_search"]),
        );

        assert_eq!(names(&filter.apply(tools)), vec!["get_gene"]);
    }

    #[test]
    fn empty_filter_keeps_everything() {
        let tools = vec![tool("a"), tool("b")];
        assert_eq!(names(&ToolFilter::default().apply(tools)), vec!["a", "b"]);
    }

    #[test]
    fn filter_equals_intersection_minus_exclude() {
        let all = ["a", "b", "c", "d", "e"];
        let include = ["a", "c", "e", "z"];
        let exclude = ["c", "d"];

        let filter = ToolFilter::new(strings(&include), strings(&exclude));
        let result = filter.apply(all.iter().map(|n| tool(n)).collect());

        let expected: Vec<&str> = all
            .iter()
            .copied()
            .filter(|n| include.contains(n) && !exclude.contains(n))
            .collect();
        assert_eq!(names(&result), expected);
    }

    #[test]
    fn exclude_only_removes_named_tools() {
        let filter = ToolFilter::new(Vec::new(), strings(&["b"]));
        let result = filter.apply(vec![tool("a"), tool("b"), tool("c")]);
        assert_eq!(names(&result), vec!["a", "c"]);
    }

    #[test]
    fn duplicate_tool_names_keep_first() {
        let mut second = tool("a");
        second.description = "shadow".to_string();
        let result = dedupe_tools("srv", vec![tool("a"), second, tool("b")]);
        assert_eq!(names(&result), vec!["a", "b"]);
        assert_eq!(result[0].description, "a tool");
    }

    #[test]
    fn template_matching_uses_literal_segments() {
        assert!(template_matches("gene://{symbol}/summary", "gene://TP53/summary"));
        assert!(!template_matches("gene://{symbol}/summary", "gene://TP53/sequence"));
        assert!(template_matches("db://{table}", "db://genes"));
        assert!(template_matches("plain://fixed", "plain://fixed"));
        assert!(template_matches("{scheme}://{path}", "db://genes"));
        assert!(!template_matches("db://{table}", "db://"));
        assert!(!template_matches("gene://{symbol}/summary", "gene:///summary"));
        assert!(!template_matches("{a}{b}", "x"));
        assert!(template_matches("{a}{b}", "xy"));
        assert!(!template_matches("plain://fixed", "plain://other"));
    }

    #[test]
    fn summary_lists_tools_and_resources() {
        let mut catalogs = BTreeMap::new();
        catalogs.insert(
            "gget".to_string(),
            ServerCatalog {
                tools: vec![McpTool {
                    name: "get_gene".to_string(),
                    description: "Look up\n a gene".to_string(),
                    input_schema: json!({
                        "type": "object",
                        "properties": {"symbol": {"type": "string"}},
                        "required": ["symbol"]
                    }),
                }],
                resources: vec![McpResource {
                    uri: "gget://species".to_string(),
                    name: "species".to_string(),
                    description: Some("Supported species".to_string()),
                    mime_type: None,
                }],
                resource_templates: Vec::new(),
            },
        );

        let summary = render_summary(&catalogs);
        assert!(summary.contains("## Server: gget"));
        assert!(summary.contains("- get_gene: Look up a gene"));
        assert!(summary.contains("Parameters: symbol (string, required)"));
        assert!(summary.contains("- gget://species (species): Supported species"));
    }
}
