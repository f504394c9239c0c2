//! Command line interface for the gateway. Supports initialization, serving
//! the HTTP gateway with its subscription dispatcher, checking the trust
//! configuration, validating event files offline and listing checkpoints.

mod checkpoint;
mod config;
mod dispatcher;
mod event;
mod filter;
mod passthrough;
mod relay;
mod routes;
mod server;
mod trust;
mod validation;

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use config::Settings;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    checkpoint::{CheckpointStore, FileCheckpointStore},
    dispatcher::{webhook_handlers, Dispatcher},
    passthrough::Forwarder,
    relay::{RelayClient, WsRelayPool},
    server::{build_app, route_registry, serve_http, AppState},
    trust::TrustRegistry,
    validation::{unix_now, Validator},
};

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "relaygate",
    author,
    version,
    about = "Trust-gated HTTP gateway for internal modules and Nostr relays",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Write default configuration and create the checkpoint directory.
    Init,
    /// Run the HTTP gateway and the subscription dispatcher.
    Serve,
    /// Load the trust registry and print the route table.
    Check,
    /// Validate event files as `POST /nostr/publish` would.
    Verify {
        /// Paths to JSON event files.
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// List persisted subscription checkpoints.
    Checkpoints,
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    init_tracing(&cfg.log_level);
    match cli.command {
        Commands::Init => init(&cfg)?,
        Commands::Serve => serve(&cfg).await?,
        Commands::Check => check(&cfg)?,
        Commands::Verify { files } => verify(&cfg, &files)?,
        Commands::Checkpoints => {
            let store = FileCheckpointStore::new(cfg.checkpoint_root.clone());
            for (name, ts) in store.list().await? {
                println!("{name}\t{ts}");
            }
        }
    }
    Ok(())
}

/// Install the global subscriber once, logging to stderr. `RUST_LOG`
/// overrides `LOG_LEVEL`.
fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Load the trust registry, requiring keys for the validation anchors.
fn load_trust(cfg: &Settings) -> anyhow::Result<TrustRegistry> {
    TrustRegistry::load(
        &cfg.modules_file,
        &[cfg.ledger_module.as_str(), cfg.external_payment_module.as_str()],
    )
    .with_context(|| format!("loading {}", cfg.modules_file.display()))
}

fn init(cfg: &Settings) -> anyhow::Result<()> {
    if let Some(parent) = cfg.modules_file.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    if !cfg.modules_file.exists() {
        fs::write(&cfg.modules_file, "{}\n")?;
        info!(path = %cfg.modules_file.display(), "wrote empty modules file");
    }
    fs::create_dir_all(&cfg.checkpoint_root)?;
    Ok(())
}

async fn serve(cfg: &Settings) -> anyhow::Result<()> {
    // Route and trust errors are fatal before anything listens.
    let trust = load_trust(cfg)?;
    let validator = Validator::from_trust(&trust, &cfg.ledger_module, &cfg.external_payment_module)?;
    let forwarder = Arc::new(Forwarder::new(
        cfg.passthrough_connect_timeout,
        cfg.passthrough_timeout,
    )?);
    let relay: Arc<dyn RelayClient> = Arc::new(WsRelayPool::new(
        cfg.relays.clone(),
        cfg.tor_socks.clone(),
        cfg.relay_timeout,
    ));
    let state = AppState {
        relay: Arc::clone(&relay),
        validator: Arc::new(validator),
    };
    let app = build_app(state, &trust, &forwarder)?;
    let addr: SocketAddr = cfg
        .bind_http
        .parse()
        .with_context(|| format!("invalid BIND_HTTP `{}`", cfg.bind_http))?;

    let client = reqwest::Client::builder()
        .connect_timeout(cfg.passthrough_connect_timeout)
        .timeout(cfg.passthrough_timeout)
        .build()?;
    let handlers = webhook_handlers(&trust, &client);
    if cfg.relays.is_empty() && !handlers.is_empty() {
        warn!("RELAYS is empty; subscriptions will not receive events");
    }
    let store: Arc<dyn CheckpointStore> =
        Arc::new(FileCheckpointStore::new(cfg.checkpoint_root.clone()));
    let tasks = Dispatcher::new(relay, store).start(handlers).await?;
    info!(subscriptions = tasks.len(), "dispatcher started");

    let result = serve_http(addr, app, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await;
    for task in tasks {
        task.abort();
    }
    result
}

fn check(cfg: &Settings) -> anyhow::Result<()> {
    let trust = load_trust(cfg)?;
    let forwarder = Arc::new(Forwarder::new(
        cfg.passthrough_connect_timeout,
        cfg.passthrough_timeout,
    )?);
    let registry = route_registry(&trust, &forwarder);
    for (path, methods) in registry.allowed_methods() {
        let methods: Vec<&str> = methods.iter().map(|m| m.as_str()).collect();
        println!("{path}\t{}", methods.join(", "));
    }
    for module in trust.modules() {
        for sub in &module.subscriptions {
            println!("subscription {}\t{}{}", sub.name, module.name, sub.path);
        }
    }
    registry.validate()?;
    Ok(())
}

fn verify(cfg: &Settings, files: &[String]) -> anyhow::Result<()> {
    let trust = load_trust(cfg)?;
    let validator = Validator::from_trust(&trust, &cfg.ledger_module, &cfg.external_payment_module)?;
    let now = unix_now();
    let mut rejected = 0;
    for file in files {
        let data = fs::read_to_string(file).with_context(|| format!("reading {file}"))?;
        let body = serde_json::from_str::<Value>(&data).ok();
        match validator.check(body.as_ref(), now) {
            Ok(event) => println!("{file}\tok\t{}", event.id),
            Err(rejection) => {
                println!("{file}\t{}\t{rejection}", rejection.status().as_u16());
                rejected += 1;
            }
        }
    }
    if rejected > 0 {
        bail!("{rejected} of {} events rejected", files.len());
    }
    Ok(())
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent)?;
            parent.to_path_buf()
        }
        _ => std::env::current_dir()?,
    };
    let data_dir = base_dir.join("relaygate-data");
    let mut content = String::new();
    content.push_str("BIND_HTTP=127.0.0.1:8000\n");
    content.push_str("RELAYS=\n");
    content.push_str(&format!(
        "MODULES_FILE={}\n",
        display_path(&data_dir.join("modules.json"))
    ));
    content.push_str(&format!(
        "CHECKPOINT_ROOT={}\n",
        display_path(&data_dir.join("checkpoints"))
    ));
    content.push_str("LEDGER_MODULE=ledger\n");
    content.push_str("EXTERNAL_PAYMENT_MODULE=urlx\n");
    content.push_str("TOR_SOCKS=\n");
    content.push_str("PASSTHROUGH_CONNECT_TIMEOUT_SECS=5\n");
    content.push_str("PASSTHROUGH_TIMEOUT_SECS=30\n");
    content.push_str("RELAY_TIMEOUT_SECS=10\n");
    content.push_str("LOG_LEVEL=info\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn display_path(path: &PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::tests::{clear_env, ENV_MUTEX},
        event::testing::pubkey_of,
        validation::tests::start_event,
    };
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::{net::TcpListener, task};

    fn write_env(dir: &TempDir, bind: &str) -> String {
        let env_path = dir.path().join(".env");
        let content = format!(
            "BIND_HTTP={bind}\nRELAYS=\nMODULES_FILE={}\nCHECKPOINT_ROOT={}\n",
            dir.path().join("modules.json").display(),
            dir.path().join("checkpoints").display(),
        );
        fs::write(&env_path, content).unwrap();
        env_path.to_str().unwrap().into()
    }

    fn write_modules(dir: &TempDir, extra: Value) {
        let mut doc = json!({
            "ledger": {"pubkey": pubkey_of([8u8; 32])},
            "urlx": {"pubkey": pubkey_of([9u8; 32])},
        });
        if let (Some(map), Value::Object(extra)) = (doc.as_object_mut(), extra) {
            map.extend(extra);
        }
        fs::write(dir.path().join("modules.json"), doc.to_string()).unwrap();
    }

    fn cli(env: &str, command: Commands) -> Cli {
        Cli {
            env: env.into(),
            command,
        }
    }

    #[tokio::test]
    async fn init_creates_default_env_and_layout() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join(".env");
        run(cli(env_path.to_str().unwrap(), Commands::Init))
            .await
            .unwrap();

        let data = fs::read_to_string(&env_path).unwrap();
        let data_dir = dir.path().join("relaygate-data");
        assert!(data.contains("BIND_HTTP=127.0.0.1:8000"));
        assert!(data.contains(&format!(
            "MODULES_FILE={}",
            data_dir.join("modules.json").to_string_lossy()
        )));
        assert!(data.contains("LEDGER_MODULE=ledger"));
        assert_eq!(
            fs::read_to_string(data_dir.join("modules.json")).unwrap(),
            "{}\n"
        );
        assert!(data_dir.join("checkpoints").is_dir());
    }

    #[tokio::test]
    async fn check_requires_anchor_keys_and_unique_routes() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = TempDir::new().unwrap();
        let env = write_env(&dir, "127.0.0.1:0");
        fs::write(dir.path().join("modules.json"), "{}").unwrap();
        assert!(run(cli(&env, Commands::Check)).await.is_err());

        clear_env();
        write_modules(
            &dir,
            json!({"card": {"url": "http://card", "routes": {"/card": ["post"]}}}),
        );
        run(cli(&env, Commands::Check)).await.unwrap();

        clear_env();
        write_modules(
            &dir,
            json!({
                "card": {"url": "http://card", "routes": {"/card": ["post"]}},
                "shop": {"url": "http://shop", "routes": {"/card": ["POST"]}}
            }),
        );
        let err = run(cli(&env, Commands::Check)).await.unwrap_err();
        assert!(err.to_string().contains("POST /card"), "{err}");
    }

    #[tokio::test]
    async fn verify_reports_rejections() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = TempDir::new().unwrap();
        let env = write_env(&dir, "127.0.0.1:0");
        write_modules(&dir, json!({}));

        let good = dir.path().join("good.json");
        let event = start_event(&"c".repeat(64), r#"{"tokens":{"BTC":1}}"#, vec![]);
        fs::write(&good, serde_json::to_string(&event).unwrap()).unwrap();
        let bad = dir.path().join("bad.json");
        fs::write(&bad, "not json").unwrap();

        run(cli(
            &env,
            Commands::Verify {
                files: vec![good.to_str().unwrap().into()],
            },
        ))
        .await
        .unwrap();

        clear_env();
        assert!(run(cli(
            &env,
            Commands::Verify {
                files: vec![good.to_str().unwrap().into(), bad.to_str().unwrap().into()],
            },
        ))
        .await
        .is_err());
    }

    #[tokio::test]
    async fn checkpoints_lists_store() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = TempDir::new().unwrap();
        let env = write_env(&dir, "127.0.0.1:0");
        let store = FileCheckpointStore::new(dir.path().join("checkpoints"));
        store.set("urlx-ok", 42).await.unwrap();
        run(cli(&env, Commands::Checkpoints)).await.unwrap();
    }

    #[tokio::test]
    async fn serve_answers_health() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let env = write_env(&dir, &format!("127.0.0.1:{port}"));
        write_modules(&dir, json!({}));

        let handle = task::spawn(run(cli(&env, Commands::Serve)));
        let url = format!("http://127.0.0.1:{port}/health");
        let mut attempts = 0;
        let resp = loop {
            match reqwest::get(&url).await {
                Ok(resp) => break resp,
                Err(err) => {
                    attempts += 1;
                    assert!(attempts < 50, "gateway never came up: {err:?}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        };
        assert_eq!(resp.status(), 200);
        handle.abort();
    }

    #[tokio::test]
    async fn serve_refuses_duplicate_routes() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = TempDir::new().unwrap();
        let env = write_env(&dir, "127.0.0.1:0");
        write_modules(
            &dir,
            json!({"card": {"url": "http://card", "routes": {"/health": ["get"]}}}),
        );
        let err = run(cli(&env, Commands::Serve)).await.unwrap_err();
        assert!(err.to_string().contains("GET /health"), "{err}");
    }
}
