use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::warn;

use concierge_orchestrator::TaskConfig;
use concierge_providers::OracleConfig;
use concierge_types::{Preferences, ToolSchema};

const ORACLE_KEY_ENV: &str = "CONCIERGE_ORACLE_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f32,
    #[serde(default = "default_continuity_margin")]
    pub continuity_margin: f32,
    #[serde(default = "default_topic_switch_confidence")]
    pub topic_switch_confidence: f32,
    #[serde(default = "default_no_evidence_penalty")]
    pub no_evidence_penalty: f32,
    #[serde(default = "default_oracle_timeout_ms")]
    pub oracle_timeout_ms: u64,
    #[serde(default = "default_cancel_phrases")]
    pub cancel_phrases: Vec<String>,
    #[serde(default = "default_new_task_phrases")]
    pub new_task_phrases: Vec<String>,
    #[serde(default = "default_retry_phrases")]
    pub retry_phrases: Vec<String>,
}

fn default_confidence_floor() -> f32 {
    0.35
}

fn default_continuity_margin() -> f32 {
    0.25
}

fn default_topic_switch_confidence() -> f32 {
    0.75
}

fn default_no_evidence_penalty() -> f32 {
    0.6
}

fn default_oracle_timeout_ms() -> u64 {
    8_000
}

fn phrases(list: &[&str]) -> Vec<String> {
    list.iter().map(|p| p.to_string()).collect()
}

fn default_cancel_phrases() -> Vec<String> {
    phrases(&[
        "cancel",
        "cancel that",
        "cancel it",
        "never mind",
        "nevermind",
        "forget it",
        "forget that",
        "stop",
        "abort",
    ])
}

fn default_new_task_phrases() -> Vec<String> {
    phrases(&["new task", "something else", "start over", "instead"])
}

fn default_retry_phrases() -> Vec<String> {
    phrases(&[
        "try again",
        "retry",
        "try that again",
        "do it again",
        "one more time",
    ])
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            confidence_floor: default_confidence_floor(),
            continuity_margin: default_continuity_margin(),
            topic_switch_confidence: default_topic_switch_confidence(),
            no_evidence_penalty: default_no_evidence_penalty(),
            oracle_timeout_ms: default_oracle_timeout_ms(),
            cancel_phrases: default_cancel_phrases(),
            new_task_phrases: default_new_task_phrases(),
            retry_phrases: default_retry_phrases(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_recent_turn_limit")]
    pub recent_turn_limit: usize,
    #[serde(default)]
    pub default_preferences: Preferences,
}

fn default_recent_turn_limit() -> usize {
    12
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            recent_turn_limit: default_recent_turn_limit(),
            default_preferences: Preferences::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_execution_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_execution_timeout_ms() -> u64 {
    15_000
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_execution_timeout_ms(),
        }
    }
}

/// Effective engine configuration. Every field has a default, so an empty
/// object is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Clarification templates keyed `"<tool>.<field>"`, merged over the
    /// built-in ones.
    #[serde(default)]
    pub prompts: BTreeMap<String, String>,
    #[serde(default)]
    pub oracle: OracleConfig,
    /// Extra tool schemas; a name matching a built-in tool replaces it.
    #[serde(default)]
    pub tools: Vec<ToolSchema>,
}

impl EngineConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let router = &self.router;
        for (name, value) in [
            ("router.confidence_floor", router.confidence_floor),
            ("router.continuity_margin", router.continuity_margin),
            ("router.topic_switch_confidence", router.topic_switch_confidence),
            ("router.no_evidence_penalty", router.no_evidence_penalty),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{name} must be between 0 and 1, got {value}");
            }
        }
        if self.tasks.max_clarification_rounds == 0 {
            anyhow::bail!("tasks.max_clarification_rounds must be at least 1");
        }
        if router.oracle_timeout_ms == 0 || self.execution.timeout_ms == 0 {
            anyhow::bail!("oracle and execution timeouts must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    cli: Value,
}

/// Layered JSON configuration: global, project, environment and command
/// line, later layers winning key by key.
#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    global_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(
        project_path: impl AsRef<Path>,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let global_path = resolve_global_config_path().await?;
        Self::open(project_path.as_ref(), global_path, env_layer(), cli_overrides).await
    }

    async fn open(
        project_path: &Path,
        global_path: PathBuf,
        env: Value,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let project_path = project_path.to_path_buf();
        let runtime_secret = oracle_key_in_env();

        let mut global = read_json_file(&global_path)
            .await
            .unwrap_or_else(|_| empty_object());
        let mut project = read_json_file(&project_path)
            .await
            .unwrap_or_else(|_| empty_object());
        scrub_persisted_secrets(&mut global, &global_path, runtime_secret).await?;
        scrub_persisted_secrets(&mut project, &project_path, runtime_secret).await?;

        let layers = ConfigLayers {
            global,
            project,
            env,
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        Ok(Self {
            project_path,
            global_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    pub fn global_path(&self) -> &Path {
        &self.global_path
    }

    pub async fn get(&self) -> anyhow::Result<EngineConfig> {
        let merged = self.get_effective_value().await;
        let config: EngineConfig =
            serde_json::from_value(merged).context("invalid engine configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "global": layers.global,
            "project": layers.project,
            "env": layers.env,
            "cli": layers.cli
        })
    }

    /// Merges `patch` into the project layer and persists it.
    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
        }
        let snapshot = self.layers.read().await.project.clone();
        write_json_file(&self.project_path, &snapshot, oracle_key_in_env()).await?;
        Ok(snapshot)
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn oracle_key_in_env() -> bool {
    std::env::var(ORACLE_KEY_ENV)
        .map(|v| !v.trim().is_empty())
        .unwrap_or(false)
}

async fn write_json_file(path: &Path, value: &Value, runtime_secret: bool) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut to_write = value.clone();
    strip_persisted_secrets(&mut to_write, runtime_secret);
    let raw = serde_json::to_string_pretty(&to_write)?;
    fs::write(path, raw)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Drops `oracle.api_key` when the key is supplied through the environment,
/// so it never lingers on disk next to the runtime copy.
fn strip_persisted_secrets(value: &mut Value, runtime_secret: bool) {
    if !runtime_secret {
        return;
    }
    if let Some(oracle) = value.get_mut("oracle").and_then(|v| v.as_object_mut()) {
        oracle.remove("api_key");
        oracle.remove("apiKey");
    }
}

async fn scrub_persisted_secrets(
    value: &mut Value,
    path: &Path,
    runtime_secret: bool,
) -> anyhow::Result<()> {
    let before = value.clone();
    strip_persisted_secrets(value, runtime_secret);
    if *value != before {
        write_json_file(path, value, runtime_secret).await?;
    }
    Ok(())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(value) => Ok(value),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring unreadable config file");
            Ok(empty_object())
        }
    }
}

async fn resolve_global_config_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("CONCIERGE_GLOBAL_CONFIG") {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    if let Some(config_dir) = dirs::config_dir() {
        return Ok(config_dir.join("concierge").join("config.json"));
    }
    Ok(PathBuf::from(".concierge/global_config.json"))
}

fn env_layer() -> Value {
    env_layer_from(|key| std::env::var(key).ok())
}

fn env_layer_from(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    for (key, path) in [
        ("CONCIERGE_CONFIDENCE_FLOOR", ["router", "confidence_floor"]),
        ("CONCIERGE_CONTINUITY_MARGIN", ["router", "continuity_margin"]),
    ] {
        if let Some(raw) = get(key) {
            match raw.trim().parse::<f64>() {
                Ok(v) => deep_merge(&mut root, &json!({ path[0]: { path[1]: v } })),
                Err(_) => warn!(env = key, value = %raw, "ignoring non-numeric override"),
            }
        }
    }
    if let Some(raw) = get("CONCIERGE_MAX_CLARIFICATION_ROUNDS") {
        match raw.trim().parse::<u32>() {
            Ok(v) => deep_merge(&mut root, &json!({ "tasks": { "max_clarification_rounds": v } })),
            Err(_) => warn!(env = "CONCIERGE_MAX_CLARIFICATION_ROUNDS", value = %raw, "ignoring non-numeric override"),
        }
    }
    if let Some(url) = get("CONCIERGE_ORACLE_URL") {
        deep_merge(&mut root, &json!({ "oracle": { "kind": "chat", "url": url.trim() } }));
    }
    if let Some(model) = get("CONCIERGE_ORACLE_MODEL") {
        deep_merge(&mut root, &json!({ "oracle": { "model": model.trim() } }));
    }
    if let Some(api_key) = get(ORACLE_KEY_ENV) {
        deep_merge(&mut root, &json!({ "oracle": { "api_key": api_key.trim() } }));
    }
    if let Some(raw) = get("CONCIERGE_TIMEZONE_OFFSET_MINUTES") {
        match raw.trim().parse::<i32>() {
            Ok(v) => deep_merge(
                &mut root,
                &json!({ "session": { "default_preferences": { "timezone_offset_minutes": v } } }),
            ),
            Err(_) => warn!(env = "CONCIERGE_TIMEZONE_OFFSET_MINUTES", value = %raw, "ignoring non-numeric override"),
        }
    }
    if let Some(location) = get("CONCIERGE_DEFAULT_LOCATION") {
        deep_merge(
            &mut root,
            &json!({ "session": { "default_preferences": { "location": location.trim() } } }),
        );
    }

    root
}

pub fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concierge_providers::OracleKind;
    use std::collections::HashMap;

    #[test]
    fn empty_object_yields_defaults() {
        let config: EngineConfig = serde_json::from_value(json!({})).expect("config");
        assert_eq!(config.router.confidence_floor, 0.35);
        assert_eq!(config.router.continuity_margin, 0.25);
        assert_eq!(config.tasks.max_clarification_rounds, 3);
        assert_eq!(config.execution.timeout_ms, 15_000);
        assert!(config.router.cancel_phrases.iter().any(|p| p == "never mind"));
        config.validate().expect("valid");
    }

    #[test]
    fn deep_merge_overlays_nested_keys_and_skips_null() {
        let mut base = json!({"router": {"confidence_floor": 0.3, "continuity_margin": 0.2}});
        deep_merge(
            &mut base,
            &json!({"router": {"continuity_margin": 0.4, "confidence_floor": null}}),
        );
        assert_eq!(base["router"]["confidence_floor"], 0.3);
        assert_eq!(base["router"]["continuity_margin"], 0.4);
    }

    #[test]
    fn env_layer_maps_known_variables() {
        let vars = HashMap::from([
            ("CONCIERGE_CONFIDENCE_FLOOR", "0.5"),
            ("CONCIERGE_MAX_CLARIFICATION_ROUNDS", "5"),
            ("CONCIERGE_ORACLE_URL", "http://localhost:11434"),
            ("CONCIERGE_DEFAULT_LOCATION", "Lisbon"),
            ("CONCIERGE_CONTINUITY_MARGIN", "lots"),
        ]);
        let layer = env_layer_from(|key| vars.get(key).map(|v| v.to_string()));
        let config: EngineConfig = serde_json::from_value(layer).expect("config");
        assert_eq!(config.router.confidence_floor, 0.5);
        assert_eq!(config.router.continuity_margin, 0.25);
        assert_eq!(config.tasks.max_clarification_rounds, 5);
        assert_eq!(config.oracle.kind, OracleKind::Chat);
        assert_eq!(config.oracle.url.as_deref(), Some("http://localhost:11434"));
        assert_eq!(
            config.session.default_preferences.location.as_deref(),
            Some("Lisbon")
        );
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let config: EngineConfig =
            serde_json::from_value(json!({"router": {"confidence_floor": 1.5}})).expect("config");
        let err = config.validate().expect_err("range");
        assert!(err.to_string().contains("router.confidence_floor"));
    }

    #[test]
    fn strip_persisted_secrets_only_with_runtime_key() {
        let mut value = json!({"oracle": {"url": "http://x", "api_key": "sk-1"}});
        strip_persisted_secrets(&mut value, false);
        assert_eq!(value["oracle"]["api_key"], "sk-1");
        strip_persisted_secrets(&mut value, true);
        assert!(value["oracle"].get("api_key").is_none());
        assert_eq!(value["oracle"]["url"], "http://x");
    }

    #[tokio::test]
    async fn layers_merge_in_order_and_project_patch_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let global_path = dir.path().join("global").join("config.json");
        let project_path = dir.path().join("project").join("config.json");
        write_json_file(
            &global_path,
            &json!({"router": {"confidence_floor": 0.2, "continuity_margin": 0.3}}),
            false,
        )
        .await
        .expect("write global");
        write_json_file(&project_path, &json!({"router": {"confidence_floor": 0.4}}), false)
            .await
            .expect("write project");

        let store = ConfigStore::open(
            &project_path,
            global_path,
            json!({"tasks": {"max_clarification_rounds": 4}}),
            Some(json!({"execution": {"timeout_ms": 250}})),
        )
        .await
        .expect("store");
        let config = store.get().await.expect("config");
        assert_eq!(config.router.confidence_floor, 0.4);
        assert_eq!(config.router.continuity_margin, 0.3);
        assert_eq!(config.tasks.max_clarification_rounds, 4);
        assert_eq!(config.execution.timeout_ms, 250);

        store
            .patch_project(json!({"prompts": {"weather.location": "Where?"}}))
            .await
            .expect("patch");
        let on_disk = read_json_file(&project_path).await.expect("read");
        assert_eq!(on_disk["prompts"]["weather.location"], "Where?");
        assert_eq!(on_disk["router"]["confidence_floor"], 0.4);

        let layers = store.get_layers_value().await;
        assert_eq!(layers["cli"]["execution"]["timeout_ms"], 250);
    }

    #[tokio::test]
    async fn unreadable_file_reads_as_empty_layer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.json");
        tokio::fs::write(&path, "{not json").await.expect("write");
        assert_eq!(read_json_file(&path).await.expect("read"), json!({}));
        assert_eq!(
            read_json_file(&dir.path().join("missing.json"))
                .await
                .expect("read"),
            json!({})
        );
    }
}
