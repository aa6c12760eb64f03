//! Plugin and tool metadata kept alongside the handlers.

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// Metadata of one loaded plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Plugin name, as used in allowlists.
    pub name: String,
    /// Module id; handlers reference their owner through it.
    pub module_path: String,
    /// Human-readable name.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Author.
    #[serde(default)]
    pub author: String,
    /// Version string.
    #[serde(default)]
    pub version: String,
    /// Description.
    #[serde(default)]
    pub desc: String,
    /// Built-in plugins bypass allowlists.
    #[serde(default)]
    pub reserved: bool,
    /// Deactivated plugins are skipped by activated-only lookups.
    #[serde(default = "default_true")]
    pub activated: bool,
}

impl PluginMetadata {
    /// Creates metadata for an activated, non-reserved plugin.
    pub fn new(name: impl Into<String>, module_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module_path: module_path.into(),
            display_name: None,
            author: String::new(),
            version: String::new(),
            desc: String::new(),
            reserved: false,
            activated: true,
        }
    }

    /// Marks the plugin as reserved (builder style).
    pub fn reserved(mut self) -> Self {
        self.reserved = true;
        self
    }

    /// Display name, falling back to the plugin name.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

/// Where a function tool is hosted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolOrigin {
    /// Provided by a local plugin.
    Local,
    /// Provided by an external MCP server.
    Mcp {
        /// Server name.
        server: String,
    },
}

/// A function tool exposed to the LLM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name as the LLM sees it.
    pub name: String,
    /// Module id of the owning plugin (or the server name for MCP tools).
    pub owner: String,
    /// Hosting.
    pub origin: ToolOrigin,
    /// Inactive tools are out of scope for analysis.
    pub active: bool,
}

impl ToolDescriptor {
    /// Creates an active local tool.
    pub fn local(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            origin: ToolOrigin::Local,
            active: true,
        }
    }

    /// Creates an active MCP-hosted tool.
    pub fn mcp(name: impl Into<String>, server: impl Into<String>) -> Self {
        let server = server.into();
        Self {
            name: name.into(),
            owner: server.clone(),
            origin: ToolOrigin::Mcp { server },
            active: true,
        }
    }
}
