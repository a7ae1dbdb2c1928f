//! Proxy configuration: the `mcpServers` document.
//!
//! The file is a JSON object with a required `mcpServers` map. Each entry
//! describes one upstream MCP server. The `type` tag is optional: entries
//! with a `command` default to stdio, url-only entries are auto-detected at
//! connect time.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::prefix::PREFIX_SEPARATOR;

/// Configuration error raised at load time.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration defines no upstream servers")]
    NoUpstreams,

    #[error("upstream name '{0}' is invalid (expected [A-Za-z0-9_-]+)")]
    InvalidName(String),

    #[error("upstream name '{0}' contains the reserved separator '{PREFIX_SEPARATOR}'")]
    ReservedSeparator(String),

    #[error("upstream '{name}' has unknown type '{kind}'")]
    UnknownType { name: String, kind: String },

    #[error("upstream '{name}' is missing required field '{field}'")]
    MissingField { name: String, field: &'static str },

    #[error("upstream '{name}' has an invalid url: {reason}")]
    InvalidUrl { name: String, reason: String },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A stdio upstream: a command spawned as a child process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdioUpstream {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// A url-bearing upstream (SSE or streamable HTTP).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpUpstream {
    pub url: Url,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Validated configuration for a single upstream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UpstreamConfig {
    Stdio(StdioUpstream),
    Sse(HttpUpstream),
    StreamableHttp(HttpUpstream),
    /// Url-bearing entry with no `type` tag; the transport is probed at
    /// connect time.
    Auto(HttpUpstream),
}

impl UpstreamConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stdio(_) => "stdio",
            Self::Sse(_) => "sse",
            Self::StreamableHttp(_) => "streamable-http",
            Self::Auto(_) => "auto",
        }
    }
}

/// Raw on-disk shape of one upstream entry, before validation.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawUpstream {
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
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    mcp_servers: HashMap<String, RawUpstream>,
}

/// The validated proxy configuration: upstream name → upstream config.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyConfig {
    pub upstreams: HashMap<String, UpstreamConfig>,
}

impl ProxyConfig {
    /// Parse and validate a configuration document.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(text)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        if raw.mcp_servers.is_empty() {
            return Err(ConfigError::NoUpstreams);
        }

        let mut upstreams = HashMap::new();
        for (name, entry) in raw.mcp_servers {
            validate_name(&name)?;
            let config = validate_upstream(&name, entry)?;
            upstreams.insert(name, config);
        }
        Ok(Self { upstreams })
    }
}

fn validate_name(name: &str) -> Result<(), ConfigError> {
    if name.contains(PREFIX_SEPARATOR) {
        return Err(ConfigError::ReservedSeparator(name.to_string()));
    }
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !ok {
        return Err(ConfigError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn validate_upstream(name: &str, raw: RawUpstream) -> Result<UpstreamConfig, ConfigError> {
    let parse_url = |name: &str, raw_url: Option<String>| -> Result<Url, ConfigError> {
        let text = raw_url.ok_or(ConfigError::MissingField {
            name: name.to_string(),
            field: "url",
        })?;
        Url::parse(&text).map_err(|e| ConfigError::InvalidUrl {
            name: name.to_string(),
            reason: e.to_string(),
        })
    };

    match raw.kind.as_deref() {
        Some("stdio") => {
            let command = raw.command.ok_or(ConfigError::MissingField {
                name: name.to_string(),
                field: "command",
            })?;
            Ok(UpstreamConfig::Stdio(StdioUpstream {
                command,
                args: raw.args,
                env: raw.env,
                cwd: raw.cwd,
            }))
        }
        Some("sse") => Ok(UpstreamConfig::Sse(HttpUpstream {
            url: parse_url(name, raw.url)?,
            headers: raw.headers,
        })),
        Some("streamable-http") => Ok(UpstreamConfig::StreamableHttp(HttpUpstream {
            url: parse_url(name, raw.url)?,
            headers: raw.headers,
        })),
        Some(other) => Err(ConfigError::UnknownType {
            name: name.to_string(),
            kind: other.to_string(),
        }),
        None => {
            // No tag: a command means stdio; a bare url is probed at connect.
            if let Some(command) = raw.command {
                return Ok(UpstreamConfig::Stdio(StdioUpstream {
                    command,
                    args: raw.args,
                    env: raw.env,
                    cwd: raw.cwd,
                }));
            }
            if raw.url.is_some() {
                return Ok(UpstreamConfig::Auto(HttpUpstream {
                    url: parse_url(name, raw.url)?,
                    headers: raw.headers,
                }));
            }
            Err(ConfigError::MissingField {
                name: name.to_string(),
                field: "command",
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stdio_defaulting_type() {
        let cfg = ProxyConfig::parse(
            r#"{"mcpServers":{"calc":{"command":"calc-server","args":["--fast"]}}}"#,
        )
        .expect("parse");
        match cfg.upstreams.get("calc").expect("calc") {
            UpstreamConfig::Stdio(s) => {
                assert_eq!(s.command, "calc-server");
                assert_eq!(s.args, vec!["--fast"]);
            }
            other => panic!("expected stdio, got {other:?}"),
        }
    }

    #[test]
    fn parses_tagged_transports() {
        let cfg = ProxyConfig::parse(
            r#"{"mcpServers":{
                "a":{"type":"sse","url":"http://127.0.0.1:9000/sse"},
                "b":{"type":"streamable-http","url":"http://127.0.0.1:9001/mcp",
                     "headers":{"authorization":"Bearer x"}}
            }}"#,
        )
        .expect("parse");
        assert!(matches!(cfg.upstreams["a"], UpstreamConfig::Sse(_)));
        match &cfg.upstreams["b"] {
            UpstreamConfig::StreamableHttp(h) => {
                assert_eq!(h.headers["authorization"], "Bearer x");
            }
            other => panic!("expected streamable-http, got {other:?}"),
        }
    }

    #[test]
    fn url_only_entry_is_auto() {
        let cfg = ProxyConfig::parse(r#"{"mcpServers":{"x":{"url":"http://localhost:9000"}}}"#)
            .expect("parse");
        assert!(matches!(cfg.upstreams["x"], UpstreamConfig::Auto(_)));
    }

    #[test]
    fn rejects_empty_server_set() {
        let err = ProxyConfig::parse(r#"{"mcpServers":{}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::NoUpstreams));
    }

    #[test]
    fn rejects_reserved_separator_in_name() {
        let err = ProxyConfig::parse(r#"{"mcpServers":{"a___b":{"command":"x"}}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::ReservedSeparator(_)));
    }

    #[test]
    fn rejects_bad_name_characters() {
        let err = ProxyConfig::parse(r#"{"mcpServers":{"a.b":{"command":"x"}}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidName(_)));
    }

    #[test]
    fn rejects_unknown_type() {
        let err = ProxyConfig::parse(
            r#"{"mcpServers":{"a":{"type":"websocket","url":"http://x"}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownType { .. }));
    }

    #[test]
    fn rejects_missing_command_and_url() {
        let err = ProxyConfig::parse(r#"{"mcpServers":{"a":{}}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { .. }));
    }

    #[test]
    fn rejects_unparseable_url() {
        let err =
            ProxyConfig::parse(r#"{"mcpServers":{"a":{"type":"sse","url":"not a url"}}}"#)
                .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { .. }));
    }

    #[test]
    fn configs_compare_for_reconciliation() {
        let a = ProxyConfig::parse(r#"{"mcpServers":{"s":{"command":"x"}}}"#).unwrap();
        let b = ProxyConfig::parse(r#"{"mcpServers":{"s":{"command":"x","args":[]}}}"#).unwrap();
        let c = ProxyConfig::parse(r#"{"mcpServers":{"s":{"command":"y"}}}"#).unwrap();
        assert_eq!(a.upstreams["s"], b.upstreams["s"]);
        assert_ne!(a.upstreams["s"], c.upstreams["s"]);
    }
}
