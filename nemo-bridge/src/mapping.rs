//! Backend tool id -> display identity.
//!
//! Display names are topic segments on the display broker, so they are
//! normalised (trimmed, lower-cased, blanks to `-`) and must be unique.
//! A reload builds a complete new table and swaps it in one step.

use crate::config::MappingConf;
use crate::error::MappingError;
use crate::models::ToolIdentity;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

type Table = HashMap<String, ToolIdentity>;

#[derive(Debug, Clone)]
pub enum MappingSource {
    File(PathBuf),
    Api { url: String, token: Option<String> },
    Static,
}

impl MappingSource {
    /// The API wins when both are configured.
    pub fn from_config(cfg: &MappingConf) -> Self {
        match (&cfg.url, &cfg.file) {
            (Some(url), _) => MappingSource::Api {
                url: url.clone(),
                token: cfg.token.clone(),
            },
            (None, Some(file)) => MappingSource::File(file.clone()),
            (None, None) => MappingSource::Static,
        }
    }
}

pub struct ToolMappingTable {
    source: MappingSource,
    table: RwLock<Arc<Table>>,
    warned_unknown: Mutex<HashSet<String>>,
}

impl ToolMappingTable {
    pub async fn load(source: MappingSource) -> Result<Self, MappingError> {
        let table = fetch(&source).await?;
        info!(tools = table.len(), source = ?source, "tool mappings loaded");
        Ok(Self {
            source,
            table: RwLock::new(Arc::new(table)),
            warned_unknown: Mutex::new(HashSet::new()),
        })
    }

    /// Fixed table, not reloadable. Used when the mapping is built in code.
    pub fn from_identities<I>(identities: I) -> Result<Self, MappingError>
    where
        I: IntoIterator<Item = ToolIdentity>,
    {
        let table = build_table(identities)?;
        Ok(Self {
            source: MappingSource::Static,
            table: RwLock::new(Arc::new(table)),
            warned_unknown: Mutex::new(HashSet::new()),
        })
    }

    pub fn resolve(&self, backend_id: &str) -> Option<ToolIdentity> {
        self.table.read().get(backend_id).cloned()
    }

    /// Like `resolve`, but an unknown id degrades to a deterministic
    /// `tool_{id}` identity. The warning is logged once per id.
    pub fn identity_for(&self, backend_id: &str) -> ToolIdentity {
        if let Some(identity) = self.resolve(backend_id) {
            return identity;
        }
        let identity = fallback_identity(backend_id);
        if self.warned_unknown.lock().insert(backend_id.to_string()) {
            warn!(
                backend_id,
                fallback = %identity.display_name,
                "no mapping for tool, publishing under fallback name"
            );
        }
        identity
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-reads the source. On failure the current table stays in place.
    pub async fn reload(&self) -> Result<usize, MappingError> {
        if matches!(self.source, MappingSource::Static) {
            return Ok(self.len());
        }
        let table = fetch(&self.source).await?;
        let count = table.len();
        *self.table.write() = Arc::new(table);
        // a newly mapped id should not stay silenced, an unmapped one warns again
        self.warned_unknown.lock().clear();
        info!(tools = count, "tool mappings reloaded");
        Ok(count)
    }
}

pub fn fallback_identity(backend_id: &str) -> ToolIdentity {
    let safe: String = backend_id
        .chars()
        .map(|c| if c.is_whitespace() || matches!(c, '/' | '+' | '#') { '_' } else { c })
        .collect();
    ToolIdentity {
        backend_id: backend_id.to_string(),
        display_name: format!("tool_{safe}"),
        category: String::new(),
    }
}

async fn fetch(source: &MappingSource) -> Result<Table, MappingError> {
    match source {
        MappingSource::File(path) => {
            let txt = tokio::fs::read_to_string(path)
                .await
                .map_err(|source| MappingError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
            parse_yaml(&path.display().to_string(), &txt).and_then(build_table)
        }
        MappingSource::Api { url, token } => {
            let tools = fetch_api(url, token.as_deref())
                .await
                .map_err(|source| MappingError::Http {
                    url: url.clone(),
                    source,
                })?;
            build_table(parse_api(&tools))
        }
        MappingSource::Static => Ok(Table::new()),
    }
}

async fn fetch_api(url: &str, token: Option<&str>) -> Result<Vec<Value>, reqwest::Error> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .user_agent("NEMO-Tool-Display/1.0")
        .build()?;
    let mut request = client.get(url).header("Accept", "application/json");
    if let Some(token) = token {
        request = request.header("Authorization", format!("Token {token}"));
    }
    request.send().await?.error_for_status()?.json().await
}

/// Accepts `id: name` and `id: {name, category}` entries. Anything else,
/// including an empty document, is rejected rather than read as no tools.
fn parse_yaml(path: &str, txt: &str) -> Result<Vec<ToolIdentity>, MappingError> {
    let shape = |reason: String| MappingError::Shape {
        path: path.to_string(),
        reason,
    };
    let doc: serde_yaml::Value = serde_yaml::from_str(txt).map_err(|source| MappingError::Parse {
        path: path.to_string(),
        source,
    })?;
    let map = match doc {
        serde_yaml::Value::Mapping(map) => map,
        serde_yaml::Value::Null => return Err(shape("document is empty".into())),
        _ => return Err(shape("expected a mapping of tool id to name".into())),
    };
    let mut out = Vec::with_capacity(map.len());
    for (key, entry) in &map {
        let backend_id = yaml_scalar(key).ok_or_else(|| shape(format!("tool id {key:?} is not a scalar")))?;
        let (name, category) = match entry {
            serde_yaml::Value::Mapping(m) => (
                m.get("name").and_then(yaml_scalar),
                m.get("category").and_then(yaml_scalar).unwrap_or_default(),
            ),
            other => (yaml_scalar(other), String::new()),
        };
        let name = name.ok_or_else(|| shape(format!("tool {backend_id} has no name")))?;
        out.push(ToolIdentity {
            backend_id,
            display_name: name,
            category,
        });
    }
    Ok(out)
}

fn yaml_scalar(v: &serde_yaml::Value) -> Option<String> {
    match v {
        serde_yaml::Value::String(s) => Some(s.trim().to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// The tool-status API returns a list of tool objects.
fn parse_api(tools: &[Value]) -> Vec<ToolIdentity> {
    tools
        .iter()
        .filter_map(|tool| {
            let backend_id = match tool.get("id")? {
                Value::String(s) => s.trim().to_string(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };
            let name = tool.get("name")?.as_str()?.to_string();
            let category = tool
                .get("category")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Some(ToolIdentity {
                backend_id,
                display_name: name,
                category,
            })
        })
        .collect()
}

fn normalize_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

fn build_table<I>(identities: I) -> Result<Table, MappingError>
where
    I: IntoIterator<Item = ToolIdentity>,
{
    let mut table = Table::new();
    let mut by_name: HashMap<String, String> = HashMap::new();
    for mut identity in identities {
        identity.display_name = normalize_name(&identity.display_name);
        let name = &identity.display_name;
        if name.is_empty() || name.contains(['/', '+', '#']) {
            return Err(MappingError::InvalidName {
                backend_id: identity.backend_id,
                name: identity.display_name,
            });
        }
        if let Some(first) = by_name.get(name) {
            if *first != identity.backend_id {
                return Err(MappingError::DuplicateName {
                    name: name.clone(),
                    first: first.clone(),
                    second: identity.backend_id,
                });
            }
        }
        by_name.insert(name.clone(), identity.backend_id.clone());
        table.insert(identity.backend_id.clone(), identity);
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn identity(id: &str, name: &str) -> ToolIdentity {
        ToolIdentity {
            backend_id: id.into(),
            display_name: name.into(),
            category: String::new(),
        }
    }

    #[test]
    fn test_parse_flat_and_nested_yaml() {
        let txt = r#"
# id -> name
113: aja2-evap
"161": Woollam
200:
  name: Fiji ALD
  category: Deposition
"#;
        let table = build_table(parse_yaml("inline", txt).unwrap()).unwrap();
        assert_eq!(table["113"].display_name, "aja2-evap");
        assert_eq!(table["161"].display_name, "woollam");
        assert_eq!(table["200"].display_name, "fiji-ald");
        assert_eq!(table["200"].category, "Deposition");
    }

    #[test]
    fn test_parse_api_list() {
        let tools: Vec<Value> = serde_json::from_str(
            r#"[{"id": 1, "name": "woollam", "category": "Characterization", "in_use": false},
                {"id": "2", "name": "Heidelberg MLA"},
                {"name": "no id"}]"#,
        )
        .unwrap();
        let table = build_table(parse_api(&tools)).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table["1"].category, "Characterization");
        assert_eq!(table["2"].display_name, "heidelberg-mla");
    }

    #[test]
    fn test_duplicate_display_name_rejected() {
        let err = build_table(vec![identity("1", "woollam"), identity("2", "Woollam ")]).unwrap_err();
        assert!(matches!(err, MappingError::DuplicateName { .. }));
    }

    #[test]
    fn test_wildcard_display_name_rejected() {
        let err = build_table(vec![identity("1", "a/b")]).unwrap_err();
        assert!(matches!(err, MappingError::InvalidName { .. }));
    }

    #[test]
    fn test_unknown_id_falls_back() {
        let table = ToolMappingTable::from_identities(vec![identity("113", "aja2-evap")]).unwrap();
        assert_eq!(table.identity_for("113").display_name, "aja2-evap");
        assert!(table.resolve("999").is_none());
        let fallback = table.identity_for("999");
        assert_eq!(fallback.display_name, "tool_999");
        assert_eq!(fallback.backend_id, "999");
        // second lookup hits the warned set, same answer
        assert_eq!(table.identity_for("999"), fallback);
        assert_eq!(table.warned_unknown.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_file_reload_swaps_table() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "113: aja2-evap").unwrap();
        let table = ToolMappingTable::load(MappingSource::File(file.path().to_path_buf()))
            .await
            .unwrap();
        assert_eq!(table.len(), 1);

        std::fs::write(file.path(), "113: aja2-evap\n999: new-tool\n").unwrap();
        assert_eq!(table.reload().await.unwrap(), 2);
        assert_eq!(table.identity_for("999").display_name, "new-tool");
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_old_table() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "113: aja2-evap").unwrap();
        let table = ToolMappingTable::load(MappingSource::File(file.path().to_path_buf()))
            .await
            .unwrap();

        std::fs::write(file.path(), "1: same\n2: same\n").unwrap();
        assert!(table.reload().await.is_err());
        assert_eq!(table.resolve("113").unwrap().display_name, "aja2-evap");
    }

    #[test]
    fn test_malformed_shapes_rejected() {
        for txt in ["", "~\n", "just a string\n", "[1, 2]\n", "113:\n  category: Deposition\n", "? [1, 2]\n: nested-key\n"] {
            let err = parse_yaml("inline", txt).unwrap_err();
            assert!(matches!(err, MappingError::Shape { .. }), "{txt:?} gave {err}");
        }
        assert!(matches!(parse_yaml("inline", "113: [unclosed"), Err(MappingError::Parse { .. })));
    }

    #[tokio::test]
    async fn test_list_shaped_file_fails_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "- 113: aja2-evap\n- 161: woollam\n").unwrap();
        let res = ToolMappingTable::load(MappingSource::File(file.path().to_path_buf())).await;
        assert!(matches!(res, Err(MappingError::Shape { .. })));
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let res = ToolMappingTable::load(MappingSource::File("/nonexistent/map.yaml".into())).await;
        assert!(matches!(res, Err(MappingError::Read { .. })));
    }

    #[test]
    fn test_example_mapping_parses() {
        let table = build_table(parse_yaml("example", include_str!("../tool_mappings.example.yaml")).unwrap()).unwrap();
        assert_eq!(table["113"].display_name, "aja2-evap");
        assert_eq!(table["200"].category, "Deposition");
    }
}
