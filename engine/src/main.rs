use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use concierge_core::{ConfigStore, Engine, FileSessionStore, InMemorySessionStore, SessionStore};
use concierge_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use concierge_server::{serve, AppState};
use concierge_tools::DryRunExecutor;
use concierge_types::{FieldType, TurnOutcome};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

const DEFAULT_PROJECT_CONFIG: &str = ".concierge/config.json";

#[derive(Parser, Debug)]
#[command(name = "concierge-engine")]
#[command(about = "Headless Concierge decision engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone, Default)]
struct RuntimeArgs {
    /// Project config layer.
    #[arg(long, env = "CONCIERGE_CONFIG")]
    config: Option<String>,
    /// Root for session files and logs.
    #[arg(long, env = "CONCIERGE_STATE_DIR")]
    state_dir: Option<String>,
    /// Keep sessions in memory only.
    #[arg(long, default_value_t = false)]
    ephemeral: bool,
    #[arg(long)]
    oracle_url: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    api_key: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 3000)]
        port: u16,
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
    /// Handle one utterance and print the reply.
    Run {
        utterance: String,
        #[arg(long, default_value = "cli")]
        session: String,
        /// Print the full outcome as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
    /// Interactive loop over stdin.
    Chat {
        #[arg(long, default_value = "cli")]
        session: String,
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
    /// List the tool catalog.
    Tools {
        #[arg(long, default_value_t = false)]
        json: bool,
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
    Config {
        #[command(subcommand)]
        action: ConfigAction,
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration.
    Show {
        #[arg(long, default_value_t = false)]
        layers: bool,
    },
    /// Persist `key=value` into the project layer; `key` is a dotted path.
    Set { assignment: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            runtime,
        } => {
            let state_dir = resolve_state_dir(runtime.state_dir.as_deref());
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, log_info) = init_process_logging(ProcessKind::Server, &logs_dir, 14)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Server,
                ObservabilityEvent {
                    status: Some("ok"),
                    detail: Some("server jsonl logging initialized"),
                    ..ObservabilityEvent::new("engine.main", "logging.initialized")
                },
            );
            info!("engine logging initialized: {:?}", log_info);

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            let engine = build_engine(&runtime, &state_dir)
                .await?
                .with_process(ProcessKind::Server);
            info!(
                "starting concierge-engine on http://{addr} state_dir={} oracle={}",
                state_dir.display(),
                engine.oracle_id()
            );
            serve(addr, AppState::new(Arc::new(engine))).await?;
        }
        Command::Run {
            utterance,
            session,
            json,
            runtime,
        } => {
            init_console_logging();
            let state_dir = resolve_state_dir(runtime.state_dir.as_deref());
            let engine = build_engine(&runtime, &state_dir).await?;
            let outcome = engine.handle_turn(&session, &utterance).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!("{}", render_outcome(&outcome));
            }
        }
        Command::Chat { session, runtime } => {
            init_console_logging();
            let state_dir = resolve_state_dir(runtime.state_dir.as_deref());
            let engine = build_engine(&runtime, &state_dir).await?;
            run_chat(&engine, &session).await?;
        }
        Command::Tools { json, runtime } => {
            init_console_logging();
            let state_dir = resolve_state_dir(runtime.state_dir.as_deref());
            let engine = build_engine(&runtime, &state_dir).await?;
            let tools = engine.registry().all();
            if json {
                println!("{}", serde_json::to_string_pretty(tools)?);
            } else {
                for tool in tools {
                    println!("{}  {}", tool.name, tool.description);
                    for field in &tool.fields {
                        println!("    {}", describe_field(field));
                    }
                }
            }
        }
        Command::Config { action, runtime } => {
            init_console_logging();
            let store = open_config(&runtime).await?;
            match action {
                ConfigAction::Show { layers } => {
                    let mut value = if layers {
                        store.get_layers_value().await
                    } else {
                        serde_json::to_value(store.get().await?)?
                    };
                    mask_secrets(&mut value);
                    println!("{}", serde_json::to_string_pretty(&value)?);
                }
                ConfigAction::Set { assignment } => {
                    let patch = parse_assignment(&assignment)?;
                    let project = store.patch_project(patch).await?;
                    store
                        .get()
                        .await
                        .context("config rejected after update; fix or revert the value")?;
                    println!("{}", serde_json::to_string_pretty(&project)?);
                }
            }
        }
    }

    Ok(())
}

fn init_console_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}

fn resolve_state_dir(flag: Option<&str>) -> PathBuf {
    if let Some(dir) = flag.filter(|d| !d.trim().is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .map(|d| d.join("concierge"))
        .unwrap_or_else(|| PathBuf::from(".concierge"))
}

async fn open_config(runtime: &RuntimeArgs) -> anyhow::Result<ConfigStore> {
    let project = runtime
        .config
        .clone()
        .unwrap_or_else(|| DEFAULT_PROJECT_CONFIG.to_string());
    let overrides = build_cli_overrides(
        runtime.oracle_url.clone(),
        runtime.model.clone(),
        runtime.api_key.clone(),
    );
    ConfigStore::new(project, overrides).await
}

async fn build_engine(runtime: &RuntimeArgs, state_dir: &Path) -> anyhow::Result<Engine> {
    let config = open_config(runtime).await?.get().await?;
    let store: Arc<dyn SessionStore> = if runtime.ephemeral {
        Arc::new(InMemorySessionStore::new())
    } else {
        Arc::new(FileSessionStore::new(state_dir.join("sessions")).await?)
    };
    Engine::from_config(config, Arc::new(DryRunExecutor), store)
}

fn build_cli_overrides(
    oracle_url: Option<String>,
    model: Option<String>,
    api_key: Option<String>,
) -> Option<Value> {
    if oracle_url.is_none() && model.is_none() && api_key.is_none() {
        return None;
    }
    let mut oracle = Map::new();
    if let Some(url) = oracle_url {
        oracle.insert("kind".to_string(), Value::String("chat".to_string()));
        oracle.insert("url".to_string(), Value::String(url));
    }
    if let Some(model) = model {
        oracle.insert("model".to_string(), Value::String(model));
    }
    if let Some(key) = api_key {
        oracle.insert("api_key".to_string(), Value::String(key));
    }
    let mut root = Map::new();
    root.insert("oracle".to_string(), Value::Object(oracle));
    Some(Value::Object(root))
}

/// `router.confidence_floor=0.5` becomes `{"router":{"confidence_floor":0.5}}`.
/// Values that parse as JSON keep their type, anything else is a string.
fn parse_assignment(input: &str) -> anyhow::Result<Value> {
    let Some((key, raw)) = input.split_once('=') else {
        anyhow::bail!("expected key=value, got `{input}`");
    };
    let path = key
        .trim()
        .split('.')
        .map(str::trim)
        .collect::<Vec<_>>();
    if path.iter().any(|segment| segment.is_empty()) {
        anyhow::bail!("invalid config key `{key}`");
    }
    let raw = raw.trim();
    let mut value =
        serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    for segment in path.iter().rev() {
        let mut map = Map::new();
        map.insert((*segment).to_string(), value);
        value = Value::Object(map);
    }
    Ok(value)
}

fn mask_secrets(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if (key == "api_key" || key == "apiKey") && !child.is_null() {
                    *child = Value::String("********".to_string());
                } else {
                    mask_secrets(child);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(mask_secrets),
        _ => {}
    }
}

fn describe_field(field: &concierge_types::FieldSpec) -> String {
    let kind = match &field.field_type {
        FieldType::Enum { options } => format!("enum[{}]", options.join("|")),
        other => other.as_str().to_string(),
    };
    let mut line = format!(
        "{}{}: {}",
        field.name,
        if field.required { "" } else { "?" },
        kind
    );
    if let Some(pref) = &field.preference_default {
        line.push_str(&format!(" (default from preference `{pref}`)"));
    }
    line
}

fn render_outcome(outcome: &TurnOutcome) -> String {
    match outcome {
        TurnOutcome::Failed(err) => format!("{} [{}]", outcome.reply(), err.code()),
        _ => outcome.reply(),
    }
}

async fn run_chat(engine: &Engine, session: &str) -> anyhow::Result<()> {
    println!(
        "concierge chat (session `{session}`, oracle `{}`). /reset clears the session, /quit exits.",
        engine.oracle_id()
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        match line.trim() {
            "/quit" | "/exit" => break,
            "/reset" => {
                engine.reset_session(session).await?;
                println!("(session cleared)");
            }
            "" => continue,
            utterance => {
                let outcome = engine.handle_turn(session, utterance).await?;
                println!("{}", render_outcome(&outcome));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn build_cli_overrides_switches_to_chat_oracle_when_url_given() {
        let overrides = build_cli_overrides(
            Some("http://localhost:11434/v1".to_string()),
            Some("llama3".to_string()),
            None,
        )
        .expect("some");
        assert_eq!(overrides["oracle"]["kind"], "chat");
        assert_eq!(overrides["oracle"]["url"], "http://localhost:11434/v1");
        assert_eq!(overrides["oracle"]["model"], "llama3");
        assert!(overrides["oracle"].get("api_key").is_none());
    }

    #[test]
    fn build_cli_overrides_is_none_without_flags() {
        assert!(build_cli_overrides(None, None, None).is_none());
    }

    #[test]
    fn parse_assignment_builds_nested_patch() {
        assert_eq!(
            parse_assignment("router.confidence_floor=0.5").expect("patch"),
            json!({"router": {"confidence_floor": 0.5}})
        );
        assert_eq!(
            parse_assignment("session.default_preferences.location = Lisbon").expect("patch"),
            json!({"session": {"default_preferences": {"location": "Lisbon"}}})
        );
    }

    #[test]
    fn parse_assignment_rejects_malformed_input() {
        assert!(parse_assignment("router.confidence_floor").is_err());
        assert!(parse_assignment("router..floor=1").is_err());
    }

    #[test]
    fn mask_secrets_hides_keys_in_every_layer() {
        let mut layers = json!({
            "cli": {"oracle": {"api_key": "sk-live"}},
            "project": {"oracle": {"apiKey": "sk-file", "model": "m"}},
            "env": {"oracle": {"api_key": null}}
        });
        mask_secrets(&mut layers);
        assert_eq!(layers["cli"]["oracle"]["api_key"], "********");
        assert_eq!(layers["project"]["oracle"]["apiKey"], "********");
        assert_eq!(layers["project"]["oracle"]["model"], "m");
        assert!(layers["env"]["oracle"]["api_key"].is_null());
    }

    #[test]
    fn resolve_state_dir_prefers_flag() {
        assert_eq!(resolve_state_dir(Some("/tmp/c")), PathBuf::from("/tmp/c"));
        assert_ne!(resolve_state_dir(Some("  ")), PathBuf::from("  "));
    }
}
