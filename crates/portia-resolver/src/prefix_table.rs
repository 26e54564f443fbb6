use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PrefixTableError {
    #[error("invalid mapping pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("failed to walk mapping pattern: {0}")]
    Walk(#[from] glob::GlobError),
    #[error("failed to read mapping file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in mapping file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("mapping file {path}: top level must be an object")]
    NotAnObject { path: PathBuf },
    #[error("mapping file {path}: prefix {prefix:?} must be non-empty ASCII digits")]
    InvalidPrefix { path: PathBuf, prefix: String },
    #[error("mapping file {path}: prefix {prefix:?} maps to neither a network name nor an object")]
    InvalidNode { path: PathBuf, prefix: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefixNode {
    Network(String),
    Branch(PrefixMap),
}

/// One level of the tree, kept in match order: longest prefix first, equal
/// lengths lexically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixMap {
    entries: Vec<(String, PrefixNode)>,
}

impl PrefixMap {
    fn from_entries(entries: BTreeMap<String, PrefixNode>) -> Self {
        let mut entries = entries.into_iter().collect::<Vec<_>>();
        entries.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(prefix, _)| prefix.as_str())
    }

    /// First entry whose prefix starts `digits`.
    fn matching(&self, digits: &str) -> Option<&PrefixNode> {
        self.entries
            .iter()
            .find(|(prefix, _)| digits.starts_with(prefix.as_str()))
            .map(|(_, node)| node)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixTable {
    root: PrefixMap,
}

impl PrefixTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Loads every file matched by `patterns`. Later files replace earlier
    /// top-level prefixes wholesale.
    pub fn load<S: AsRef<str>>(patterns: &[S]) -> Result<Self, PrefixTableError> {
        let mut merged = BTreeMap::new();
        let mut files = 0usize;
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let mut paths = glob::glob(pattern)
                .map_err(|source| PrefixTableError::Pattern {
                    pattern: pattern.to_string(),
                    source,
                })?
                .collect::<Result<Vec<_>, _>>()?;
            paths.retain(|path| path.is_file());
            paths.sort();
            if paths.is_empty() {
                warn!(event = "mapping_pattern_empty", pattern);
            }
            for path in paths {
                let top = read_mapping_file(&path)?;
                debug!(event = "mapping_file_loaded", path = %path.display(), prefixes = top.len());
                merged.extend(top);
                files += 1;
            }
        }
        let table = Self {
            root: PrefixMap::from_entries(merged),
        };
        debug!(event = "prefix_table_ready", files, prefixes = table.root.len());
        Ok(table)
    }

    /// Builds a table from an in-memory JSON object, reporting errors
    /// against `source`.
    pub fn from_value(value: &Value, source: &Path) -> Result<Self, PrefixTableError> {
        let object = value.as_object().ok_or_else(|| PrefixTableError::NotAnObject {
            path: source.to_path_buf(),
        })?;
        Ok(Self {
            root: parse_level(object, source)?,
        })
    }

    pub fn root(&self) -> &PrefixMap {
        &self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Descends through the longest matching prefix at each level without
    /// backtracking to shorter siblings. Nested levels hold full prefixes,
    /// not suffixes of their parent.
    pub fn lookup(&self, digits: &str) -> Option<&str> {
        let mut level = &self.root;
        loop {
            match level.matching(digits)? {
                PrefixNode::Network(name) => return Some(name),
                PrefixNode::Branch(inner) => level = inner,
            }
        }
    }
}

fn read_mapping_file(path: &Path) -> Result<BTreeMap<String, PrefixNode>, PrefixTableError> {
    let raw = fs::read_to_string(path).map_err(|source| PrefixTableError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_json::from_str(&raw).map_err(|source| PrefixTableError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let object = value.as_object().ok_or_else(|| PrefixTableError::NotAnObject {
        path: path.to_path_buf(),
    })?;
    parse_entries(object, path)
}

fn parse_level(object: &Map<String, Value>, path: &Path) -> Result<PrefixMap, PrefixTableError> {
    parse_entries(object, path).map(PrefixMap::from_entries)
}

fn parse_entries(
    object: &Map<String, Value>,
    path: &Path,
) -> Result<BTreeMap<String, PrefixNode>, PrefixTableError> {
    let mut entries = BTreeMap::new();
    for (prefix, value) in object {
        if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PrefixTableError::InvalidPrefix {
                path: path.to_path_buf(),
                prefix: prefix.clone(),
            });
        }
        let node = match value {
            Value::String(name) => PrefixNode::Network(name.clone()),
            Value::Object(inner) => PrefixNode::Branch(parse_level(inner, path)?),
            _ => {
                return Err(PrefixTableError::InvalidNode {
                    path: path.to_path_buf(),
                    prefix: prefix.clone(),
                })
            }
        };
        entries.insert(prefix.clone(), node);
    }
    Ok(entries)
}
