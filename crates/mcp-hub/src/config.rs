use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::catalog::ToolFilter;
use crate::error::{McpError, Result};

/// Fallback request timeout when a server config has none (or an unusable one).
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Launcher used for every curated server.
pub const CURATED_LAUNCHER: &str = "uvx";

/// A server from the curated namespace.
#[derive(Debug, Clone, Copy)]
pub struct CuratedServer {
    pub id: &'static str,
    pub package: &'static str,
    pub enabled_by_default: bool,
}

pub const CURATED_SERVERS: &[CuratedServer] = &[
    CuratedServer {
        id: "gget",
        package: "gget-mcp",
        enabled_by_default: true,
    },
    CuratedServer {
        id: "biothings",
        package: "biothings-mcp",
        enabled_by_default: true,
    },
    CuratedServer {
        id: "opengenes",
        package: "opengenes-mcp",
        enabled_by_default: false,
    },
    CuratedServer {
        id: "synergy-age",
        package: "synergy-age-mcp",
        enabled_by_default: false,
    },
];

/// Configuration of one remote server.
///
/// Two configs are "the same" when their serialized JSON is identical, see
/// [`ServerConfig::fingerprint`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawServerConfig")]
pub struct ServerConfig {
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Request timeout in seconds; a number or a numeric string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Value>,
    /// Tool names to keep (empty = all)
    #[serde(default)]
    pub include_tools: Vec<String>,
    /// Tool names to drop
    #[serde(default)]
    pub exclude_tools: Vec<String>,
    #[serde(default)]
    pub disabled: bool,
}

/// Transport configuration variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    Stdio(StdioConfig),
    Sse(SseConfig),
}

/// Stdio transport configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StdioConfig {
    /// Command to execute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides for the child process
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// SSE transport configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SseConfig {
    /// SSE endpoint URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Additional headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Flat on-disk shape; the transport kind comes from `type` or is inferred
/// from the presence of `url`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerConfig {
    #[serde(rename = "type")]
    kind: Option<String>,
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    cwd: Option<String>,
    url: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    timeout: Option<Value>,
    #[serde(default)]
    include_tools: Vec<String>,
    #[serde(default)]
    exclude_tools: Vec<String>,
    #[serde(default)]
    disabled: bool,
}

impl TryFrom<RawServerConfig> for ServerConfig {
    type Error = String;

    fn try_from(raw: RawServerConfig) -> std::result::Result<Self, Self::Error> {
        let kind = match raw.kind.as_deref() {
            Some(kind) => kind.to_ascii_lowercase(),
            None if raw.url.is_some() => "sse".to_string(),
            None => "stdio".to_string(),
        };

        let transport = match kind.as_str() {
            "stdio" => TransportConfig::Stdio(StdioConfig {
                command: raw.command,
                args: raw.args,
                env: raw.env,
                cwd: raw.cwd,
            }),
            "sse" => TransportConfig::Sse(SseConfig {
                url: raw.url,
                headers: raw.headers,
            }),
            other => return Err(format!("unknown transport type '{}'", other)),
        };

        Ok(ServerConfig {
            transport,
            timeout: raw.timeout,
            include_tools: raw.include_tools,
            exclude_tools: raw.exclude_tools,
            disabled: raw.disabled,
        })
    }
}

impl ServerConfig {
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self::from_transport(TransportConfig::Stdio(StdioConfig {
            command: Some(command.into()),
            args,
            ..Default::default()
        }))
    }

    pub fn sse(url: impl Into<String>) -> Self {
        Self::from_transport(TransportConfig::Sse(SseConfig {
            url: Some(url.into()),
            headers: BTreeMap::new(),
        }))
    }

    fn from_transport(transport: TransportConfig) -> Self {
        Self {
            transport,
            timeout: None,
            include_tools: Vec::new(),
            exclude_tools: Vec::new(),
            disabled: false,
        }
    }

    /// Serialized form used for change detection.
    pub fn fingerprint(&self) -> String {
        // Every field is a string, sequence or BTreeMap, so this cannot fail
        // and the output is stable across runs.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Per-request timeout, falling back to [`DEFAULT_REQUEST_TIMEOUT_SECS`].
    pub fn request_timeout(&self) -> Duration {
        let secs = match &self.timeout {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        };

        secs.filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
    }

    pub fn tool_filter(&self) -> ToolFilter {
        ToolFilter::new(
            self.include_tools.iter().cloned(),
            self.exclude_tools.iter().cloned(),
        )
    }
}

/// Per-entry overrides for a curated server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CuratedOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_tools: Option<Vec<String>>,
}

/// Settings supplied by the hosting application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpSettings {
    /// Generic namespace: arbitrary named servers
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, ServerConfig>,
    /// Curated namespace: overrides keyed by curated server id
    #[serde(default)]
    pub curated: BTreeMap<String, CuratedOverride>,
}

impl McpSettings {
    /// Load settings from a JSON file. A missing file yields empty settings.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("MCP settings file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            McpError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            McpError::Configuration(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Merge both namespaces into the desired server map.
    pub fn resolve(&self) -> BTreeMap<String, ServerConfig> {
        let mut servers = self.mcp_servers.clone();

        for id in self.curated.keys() {
            if !CURATED_SERVERS.iter().any(|server| server.id == id) {
                warn!("Ignoring override for unknown curated MCP server '{}'", id);
            }
        }

        for curated in CURATED_SERVERS {
            let overrides = self.curated.get(curated.id);
            servers.insert(curated.id.to_string(), expand_curated(curated, overrides));
        }

        servers
    }
}

fn expand_curated(server: &CuratedServer, overrides: Option<&CuratedOverride>) -> ServerConfig {
    let mut config = ServerConfig::stdio(CURATED_LAUNCHER, vec![server.package.to_string()]);
    config.disabled = !server.enabled_by_default;

    let Some(overrides) = overrides else {
        return config;
    };

    if let Some(enabled) = overrides.enabled {
        config.disabled = !enabled;
    }
    if let TransportConfig::Stdio(stdio) = &mut config.transport {
        stdio.env.extend(overrides.env.clone());
    }
    if overrides.timeout.is_some() {
        config.timeout = overrides.timeout.clone();
    }
    if let Some(include) = &overrides.include_tools {
        config.include_tools = include.clone();
    }
    if let Some(exclude) = &overrides.exclude_tools {
        config.exclude_tools = exclude.clone();
    }

    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn infers_transport_from_fields() {
        let stdio: ServerConfig =
            serde_json::from_value(json!({"command": "npx", "args": ["-y", "server"]})).unwrap();
        assert!(matches!(stdio.transport, TransportConfig::Stdio(_)));

        let sse: ServerConfig =
            serde_json::from_value(json!({"url": "http://localhost:9000/sse"})).unwrap();
        assert!(matches!(sse.transport, TransportConfig::Sse(_)));
    }

    #[test]
    fn explicit_type_wins_and_missing_command_still_parses() {
        let config: ServerConfig =
            serde_json::from_value(json!({"type": "stdio", "url": "http://ignored"})).unwrap();
        match config.transport {
            TransportConfig::Stdio(stdio) => assert!(stdio.command.is_none()),
            other => panic!("unexpected transport: {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_transport_type() {
        let result = serde_json::from_value::<ServerConfig>(json!({"type": "websocket"}));
        assert!(result.is_err());
    }

    #[test]
    fn serialization_round_trips_through_raw_shape() {
        let mut config = ServerConfig::stdio("uvx", vec!["gget-mcp".to_string()]);
        config.exclude_tools = vec!["gget_seq".to_string()];
        config.timeout = Some(json!(30));

        let text = serde_json::to_string(&config).unwrap();
        let back: ServerConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, config);
        assert_eq!(back.fingerprint(), config.fingerprint());
    }

    #[test]
    fn fingerprint_ignores_env_insertion_order() {
        let mut a = ServerConfig::stdio("x", vec![]);
        let mut b = ServerConfig::stdio("x", vec![]);
        if let TransportConfig::Stdio(stdio) = &mut a.transport {
            stdio.env.insert("A".into(), "1".into());
            stdio.env.insert("B".into(), "2".into());
        }
        if let TransportConfig::Stdio(stdio) = &mut b.transport {
            stdio.env.insert("B".into(), "2".into());
            stdio.env.insert("A".into(), "1".into());
        }
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn request_timeout_parses_numbers_and_strings() {
        let mut config = ServerConfig::stdio("x", vec![]);
        assert_eq!(config.request_timeout(), Duration::from_secs(60));

        config.timeout = Some(json!(15));
        assert_eq!(config.request_timeout(), Duration::from_secs(15));

        config.timeout = Some(json!("2.5"));
        assert_eq!(config.request_timeout(), Duration::from_millis(2500));

        config.timeout = Some(json!("soon"));
        assert_eq!(config.request_timeout(), Duration::from_secs(60));

        config.timeout = Some(json!(-3));
        assert_eq!(config.request_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn curated_defaults_expand_to_launcher_configs() {
        let servers = McpSettings::default().resolve();

        let gget = &servers["gget"];
        assert!(!gget.disabled);
        match &gget.transport {
            TransportConfig::Stdio(stdio) => {
                assert_eq!(stdio.command.as_deref(), Some(CURATED_LAUNCHER));
                assert_eq!(stdio.args, vec!["gget-mcp".to_string()]);
            }
            other => panic!("unexpected transport: {:?}", other),
        }

        assert!(servers["opengenes"].disabled);
        assert!(servers["synergy-age"].disabled);
    }

    #[test]
    fn curated_overrides_take_precedence() {
        let settings: McpSettings = serde_json::from_value(json!({
            "mcpServers": {
                "local": {"command": "python", "args": ["server.py"]}
            },
            "curated": {
                "opengenes": {
                    "enabled": true,
                    "env": {"OPENGENES_DB": "/data/og.sqlite"},
                    "timeout": "120",
                    "excludeTools": ["raw_sql"]
                },
                "gget": {"enabled": false},
                "unknown": {"enabled": true}
            }
        }))
        .unwrap();

        let servers = settings.resolve();
        assert!(servers.contains_key("local"));
        assert!(!servers.contains_key("unknown"));
        assert!(servers["gget"].disabled);

        let opengenes = &servers["opengenes"];
        assert!(!opengenes.disabled);
        assert_eq!(opengenes.request_timeout(), Duration::from_secs(120));
        assert_eq!(opengenes.exclude_tools, vec!["raw_sql".to_string()]);
        match &opengenes.transport {
            TransportConfig::Stdio(stdio) => {
                assert_eq!(stdio.env["OPENGENES_DB"], "/data/og.sqlite");
            }
            other => panic!("unexpected transport: {:?}", other),
        }
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = McpSettings::load(&dir.path().join("absent.json")).unwrap();
        assert!(settings.mcp_servers.is_empty());
    }

    #[test]
    fn load_reports_malformed_file_as_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = McpSettings::load(&path).unwrap_err();
        assert!(matches!(err, McpError::Configuration(_)));
    }
}
