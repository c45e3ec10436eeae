//! Graph Configuration
//!
//! Parses the INI dialect describing the backend graph:
//!
//! ```text
//! [CacheGraph]
//! ; comment
//! Root=(Type=KeyLength, Length=120, Inner=Hierarchy)
//! Hierarchy=(Type=Hierarchical, Inner=Boot, Inner=Local, Inner=Shared)
//! Boot=(Type=Boot, Filename=Boot.ddc, MaxCacheSize=512)
//! Local=(Type=FileSystem, Path="DDC/Local", UnusedFileAge=34)
//! Shared=(Type=FileSystem, Path=//server/ddc, ReadOnly=true, EnvPathOverride=DDC_SHARED)
//! ```
//!
//! Node names and parameter keys are case-insensitive. `Inner=` may repeat
//! to list several children. Parsing checks structure (types, references,
//! child counts, cycles); parameter values are checked when the graph is
//! built.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Name of the node used as root unless another is chosen
pub const DEFAULT_ROOT: &str = "Root";

// =============================================================================
// Node Types
// =============================================================================

/// Type of a graph node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    FileSystem,
    Memory,
    Boot,
    Hierarchical,
    AsyncPut,
    Verify,
    ReadPak,
    WritePak,
    KeyLength,
}

impl NodeType {
    pub fn name(self) -> &'static str {
        match self {
            NodeType::FileSystem => "FileSystem",
            NodeType::Memory => "Memory",
            NodeType::Boot => "Boot",
            NodeType::Hierarchical => "Hierarchical",
            NodeType::AsyncPut => "AsyncPut",
            NodeType::Verify => "Verify",
            NodeType::ReadPak => "ReadPak",
            NodeType::WritePak => "WritePak",
            NodeType::KeyLength => "KeyLength",
        }
    }

    /// Allowed number of `Inner=` children
    fn inner_count(self) -> (usize, usize) {
        match self {
            NodeType::Hierarchical => (1, usize::MAX),
            NodeType::AsyncPut | NodeType::Verify | NodeType::KeyLength => (1, 1),
            _ => (0, 0),
        }
    }
}

impl FromStr for NodeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let node_type = match s.to_ascii_lowercase().as_str() {
            "filesystem" => NodeType::FileSystem,
            "memory" => NodeType::Memory,
            "boot" => NodeType::Boot,
            "hierarchical" => NodeType::Hierarchical,
            "asyncput" => NodeType::AsyncPut,
            "verify" => NodeType::Verify,
            "readpak" => NodeType::ReadPak,
            "writepak" => NodeType::WritePak,
            "keylength" => NodeType::KeyLength,
            _ => return Err(Error::Config(format!("unknown node type '{}'", s))),
        };
        Ok(node_type)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Nodes
// =============================================================================

/// One parsed node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Name as spelled in the file
    pub name: String,
    pub node_type: NodeType,
    /// Children in declaration order
    pub inner: Vec<String>,
    params: HashMap<String, String>,
}

impl NodeConfig {
    /// Raw parameter value
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    /// Parameter that must be present and non-empty
    pub fn require(&self, key: &str) -> Result<&str> {
        match self.param(key) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(Error::Config(format!(
                "node '{}' of type {} requires {}=",
                self.name, self.node_type, key
            ))),
        }
    }

    pub fn bool_param(&self, key: &str, default: bool) -> Result<bool> {
        let Some(value) = self.param(key) else {
            return Ok(default);
        };
        match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(self.invalid(key, value, "a boolean")),
        }
    }

    pub fn u64_param(&self, key: &str, default: u64) -> Result<u64> {
        match self.param(key) {
            Some(value) => value
                .parse()
                .map_err(|_| self.invalid(key, value, "a non-negative integer")),
            None => Ok(default),
        }
    }

    /// Day count parameter as a duration
    pub fn days_param(&self, key: &str, default: Duration) -> Result<Duration> {
        match self.param(key) {
            Some(value) => {
                let days: f64 = value
                    .parse()
                    .map_err(|_| self.invalid(key, value, "a number of days"))?;
                if !days.is_finite() || days < 0.0 {
                    return Err(self.invalid(key, value, "a number of days"));
                }
                Ok(Duration::from_secs_f64(days * 86_400.0))
            }
            None => Ok(default),
        }
    }

    fn invalid(&self, key: &str, value: &str, expected: &str) -> Error {
        Error::Config(format!(
            "node '{}': {}={} is not {}",
            self.name, key, value, expected
        ))
    }
}

// =============================================================================
// Graph
// =============================================================================

/// Parsed and structurally validated graph
#[derive(Debug, Clone)]
pub struct GraphConfig {
    root: String,
    /// Keyed by lowercased name
    nodes: BTreeMap<String, NodeConfig>,
}

impl GraphConfig {
    /// Parse every node in `text`, ignoring section headers
    pub fn parse(text: &str) -> Result<Self> {
        Self::parse_inner(text, None)
    }

    /// Parse only the nodes of `[section]`
    pub fn parse_section(text: &str, section: &str) -> Result<Self> {
        Self::parse_inner(text, Some(section))
    }

    /// Read and parse a config file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    fn parse_inner(text: &str, section: Option<&str>) -> Result<Self> {
        let mut nodes = BTreeMap::new();
        let mut in_section = section.is_none();

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(header) = line.strip_prefix('[') {
                let name = header
                    .strip_suffix(']')
                    .ok_or_else(|| Error::Config(format!("line {}: unterminated section header", line_no)))?;
                in_section = section.map_or(true, |s| s.eq_ignore_ascii_case(name.trim()));
                continue;
            }
            if !in_section {
                continue;
            }

            let node = parse_node(line).map_err(|e| match e {
                Error::Config(msg) => Error::Config(format!("line {}: {}", line_no, msg)),
                other => other,
            })?;
            let key = node.name.to_ascii_lowercase();
            if nodes.contains_key(&key) {
                return Err(Error::Config(format!(
                    "line {}: node '{}' is defined twice",
                    line_no, node.name
                )));
            }
            nodes.insert(key, node);
        }

        let graph = Self {
            root: DEFAULT_ROOT.to_string(),
            nodes,
        };
        graph.validate()?;
        Ok(graph)
    }

    /// Use `name` as the root node
    pub fn with_root(mut self, name: impl Into<String>) -> Result<Self> {
        self.root = name.into();
        self.validate()?;
        Ok(self)
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.get(&name.to_ascii_lowercase())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeConfig> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check the root, references, child counts and acyclicity
    pub fn validate(&self) -> Result<()> {
        if self.node(&self.root).is_none() {
            return Err(Error::Config(format!("root node '{}' is not defined", self.root)));
        }

        for node in self.nodes.values() {
            let (min, max) = node.node_type.inner_count();
            let count = node.inner.len();
            if count < min || count > max {
                return Err(Error::Config(format!(
                    "node '{}' of type {} has {} Inner= entries",
                    node.name, node.node_type, count
                )));
            }
            for inner in &node.inner {
                if self.node(inner).is_none() {
                    return Err(Error::Config(format!(
                        "node '{}' references unknown node '{}'",
                        node.name, inner
                    )));
                }
            }
        }

        // Depth-first search with three colours
        let mut state: HashMap<String, u8> = HashMap::new();
        for name in self.nodes.keys() {
            self.visit(name, &mut state)?;
        }
        Ok(())
    }

    fn visit(&self, key: &str, state: &mut HashMap<String, u8>) -> Result<()> {
        match state.get(key) {
            Some(2) => return Ok(()),
            Some(1) => {
                return Err(Error::Config(format!(
                    "cycle through node '{}'",
                    self.nodes.get(key).map_or(key, |n| n.name.as_str())
                )))
            }
            _ => {}
        }
        state.insert(key.to_string(), 1);
        if let Some(node) = self.nodes.get(key) {
            for inner in &node.inner {
                self.visit(&inner.to_ascii_lowercase(), state)?;
            }
        }
        state.insert(key.to_string(), 2);
        Ok(())
    }
}

impl FromStr for GraphConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// =============================================================================
// Line Parsing
// =============================================================================

/// Parse `Name=(Key=Value, ...)`
fn parse_node(line: &str) -> Result<NodeConfig> {
    let (name, body) = line
        .split_once('=')
        .ok_or_else(|| Error::Config("expected Name=(...)".to_string()))?;
    let name = name.trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::Config(format!("invalid node name '{}'", name)));
    }
    let body = body.trim();
    let body = body
        .strip_prefix('(')
        .and_then(|b| b.strip_suffix(')'))
        .ok_or_else(|| Error::Config(format!("node '{}': expected a parenthesized list", name)))?;

    let mut node_type = None;
    let mut inner = Vec::new();
    let mut params = HashMap::new();

    for item in split_items(body)? {
        let (key, value) = item
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("node '{}': expected Key=Value, got '{}'", name, item)))?;
        let key = key.trim();
        let value = unquote(value.trim());
        match key.to_ascii_lowercase().as_str() {
            "type" => node_type = Some(value.parse::<NodeType>()?),
            "inner" => inner.push(value.to_string()),
            lower => {
                params.insert(lower.to_string(), value.to_string());
            }
        }
    }

    let node_type =
        node_type.ok_or_else(|| Error::Config(format!("node '{}' has no Type=", name)))?;
    Ok(NodeConfig {
        name: name.to_string(),
        node_type,
        inner,
        params,
    })
}

/// Split on commas outside quotes
fn split_items(body: &str) -> Result<Vec<&str>> {
    let mut items = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    for (i, c) in body.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                items.push(body[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if quoted {
        return Err(Error::Config("unterminated quote".to_string()));
    }
    items.push(body[start..].trim());
    Ok(items.into_iter().filter(|item| !item.is_empty()).collect())
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}
