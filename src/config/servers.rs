//! Server list loading: `{"mcpServers": {...}}` in JSON or TOML.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, TetherError};

/// One configured server. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub launch: Launch,
}

impl ServerConfig {
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            launch: Launch::Stdio {
                command: command.into(),
                args,
                env: BTreeMap::new(),
                cwd: None,
            },
        }
    }

    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            launch: Launch::Http {
                url: url.into(),
                headers: BTreeMap::new(),
            },
        }
    }

    pub fn websocket(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            launch: Launch::WebSocket { url: url.into() },
        }
    }

    pub fn transport_kind(&self) -> TransportKind {
        match self.launch {
            Launch::Stdio { .. } => TransportKind::Stdio,
            Launch::Http { .. } => TransportKind::Http,
            Launch::WebSocket { .. } => TransportKind::WebSocket,
        }
    }
}

/// How to reach a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Launch {
    /// Local subprocess speaking newline-delimited JSON on stdio.
    Stdio {
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        cwd: Option<PathBuf>,
    },
    /// Streamable HTTP endpoint.
    Http {
        url: String,
        headers: BTreeMap<String, String>,
    },
    WebSocket {
        url: String,
    },
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransportKind {
    Stdio,
    Http,
    #[strum(serialize = "websocket", serialize = "ws")]
    WebSocket,
}

/// Parsed server list, in document order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServersFile {
    pub servers: Vec<ServerConfig>,
}

impl ServersFile {
    /// Load a `.json` or `.toml` server list. `${VAR}` placeholders are
    /// expanded from the process environment.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            TetherError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&text),
            _ => Self::from_json_str(&text),
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let raw: RawFile = serde_json::from_str(text)
            .map_err(|e| TetherError::Configuration(format!("invalid server list: {e}")))?;
        raw.resolve(&env_lookup)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let raw: RawFile = toml::from_str(text)
            .map_err(|e| TetherError::Configuration(format!("invalid server list: {e}")))?;
        raw.resolve(&env_lookup)
    }

    /// `<config dir>/tether/servers.json` for the current platform.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "tether", "tether")
            .map(|dirs| dirs.config_dir().join("servers.json"))
    }

    pub fn names(&self) -> Vec<&str> {
        self.servers.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn into_configs(self) -> Vec<ServerConfig> {
        self.servers
    }
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

#[derive(Debug, Deserialize)]
struct RawFile {
    #[serde(rename = "mcpServers", alias = "mcp_servers", default)]
    mcp_servers: OrderedEntries,
}

#[derive(Debug, Default)]
struct OrderedEntries(Vec<(String, RawEntry)>);

impl<'de> Deserialize<'de> for OrderedEntries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = OrderedEntries;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of server name to server entry")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((name, entry)) = map.next_entry::<String, RawEntry>()? {
                    entries.push((name, entry));
                }
                Ok(OrderedEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEntry {
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
    url: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    transport: Option<String>,
    #[serde(default)]
    disabled: bool,
}

impl RawFile {
    fn resolve(self, lookup: &dyn Fn(&str) -> Option<String>) -> Result<ServersFile> {
        let mut servers: Vec<ServerConfig> = Vec::with_capacity(self.mcp_servers.0.len());
        for (name, entry) in self.mcp_servers.0 {
            if name.trim().is_empty() {
                return Err(TetherError::Configuration(
                    "server names must not be empty".into(),
                ));
            }
            if servers.iter().any(|s| s.name == name) {
                return Err(TetherError::Configuration(format!(
                    "duplicate server name '{name}'"
                )));
            }
            if entry.disabled {
                tracing::debug!(server = %name, "skipping disabled server");
                continue;
            }
            let launch = entry.into_launch(&name, lookup)?;
            servers.push(ServerConfig { name, launch });
        }
        Ok(ServersFile { servers })
    }
}

impl RawEntry {
    fn into_launch(self, name: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<Launch> {
        let expand = |value: &str| expand_placeholders(value, lookup);
        let expand_map = |map: BTreeMap<String, String>| -> Result<BTreeMap<String, String>> {
            map.into_iter()
                .map(|(k, v)| Ok((k, expand(&v)?)))
                .collect()
        };

        match (self.command, self.url) {
            (Some(command), None) => Ok(Launch::Stdio {
                command: expand(&command)?,
                args: self
                    .args
                    .iter()
                    .map(|arg| expand(arg))
                    .collect::<Result<_>>()?,
                env: expand_map(self.env)?,
                cwd: self.cwd,
            }),
            (None, Some(url)) => {
                let url = expand(&url)?;
                let kind = match self.transport.as_deref() {
                    Some(kind) => kind.parse::<TransportKind>().map_err(|_| {
                        TetherError::Configuration(format!(
                            "server '{name}': unknown transport '{kind}'"
                        ))
                    })?,
                    None if url.starts_with("ws://") || url.starts_with("wss://") => {
                        TransportKind::WebSocket
                    }
                    None => TransportKind::Http,
                };
                match kind {
                    TransportKind::Http => Ok(Launch::Http {
                        url,
                        headers: expand_map(self.headers)?,
                    }),
                    TransportKind::WebSocket => Ok(Launch::WebSocket { url }),
                    TransportKind::Stdio => Err(TetherError::Configuration(format!(
                        "server '{name}': stdio transport requires 'command', not 'url'"
                    ))),
                }
            }
            (Some(_), Some(_)) => Err(TetherError::Configuration(format!(
                "server '{name}' sets both 'command' and 'url'"
            ))),
            (None, None) => Err(TetherError::Configuration(format!(
                "server '{name}' needs either 'command' or 'url'"
            ))),
        }
    }
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex must compile")
    })
}

/// Replace `${NAME}` with the looked-up value. A missing variable is a
/// configuration error rather than being left in place.
pub fn expand_placeholders(
    input: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<String> {
    let pattern = placeholder_pattern();
    let mut missing = None;
    let expanded = pattern.replace_all(input, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match lookup(name) {
            Some(value) => value,
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(name) => Err(TetherError::Configuration(format!(
            "environment variable '{name}' is not set"
        ))),
        None => Ok(expanded.into_owned()),
    }
}
