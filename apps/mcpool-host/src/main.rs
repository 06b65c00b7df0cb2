//! McPool host
//!
//! Runs the instance pool with its lifecycle sweep until Ctrl-C. Positional
//! arguments are provider command lines started at boot, e.g.
//!
//! ```text
//! mcpool-host "npx -y @modelcontextprotocol/server-everything"
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use mcpool_core::{ApiResponse, ClientType, McpConfig, PoolSettings, UuidGenerator};
use mcpool_runtime::{ConnectorFactory, InstanceRegistry, LifecycleManager, PoolManager};
use tracing::{error, info, warn};

const HOST_SESSION: &str = "host";
const HOST_USER: &str = "host";

fn logs_dir() -> PathBuf {
    std::env::var_os("LOG_DIR").map(PathBuf::from).unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mcpool")
            .join("logs")
    })
}

/// Console logging, plus a daily-rolling file when `ENABLE_FILE_LOGGING=true`.
///
/// The returned guard flushes the file writer and must live until exit.
fn init_tracing() -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    // RUST_LOG wins; otherwise LOG_LEVEL with debug for our own crates.
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
            EnvFilter::try_new(level)
                .context("invalid LOG_LEVEL")?
                .add_directive("mcpool_core=debug".parse()?)
                .add_directive("mcpool_mcp=debug".parse()?)
                .add_directive("mcpool_runtime=debug".parse()?)
                .add_directive("mcpool_host=debug".parse()?)
        }
    };

    let console_layer = fmt::layer()
        .with_ansi(true)
        .compact()
        .with_thread_names(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true);

    let file_logging = std::env::var("ENABLE_FILE_LOGGING")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if !file_logging {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        return Ok(None);
    }

    let dir = logs_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("cannot create log directory {}", dir.display()))?;
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("mcpool")
        .filename_suffix("log")
        .build(&dir)
        .context("cannot create log file appender")?;
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_file(true)
        .with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();
    Ok(Some(guard))
}

/// Start each provider given on the command line, log its tools, and release
/// it so it is evicted like any other idle instance.
async fn warm_providers(pool: &PoolManager, command_lines: &[String]) {
    for (index, line) in command_lines.iter().enumerate() {
        let name = format!("provider-{}", index + 1);
        let config = match McpConfig::from_command_line(line) {
            Ok(config) => config,
            Err(e) => {
                warn!(name = %name, error = %e, "[Host] Skipping provider");
                continue;
            }
        };

        let acquired = pool
            .get_or_create_instance(HOST_SESSION, &name, config, ClientType::Stdio, HOST_USER)
            .await;
        match &acquired {
            Ok(acquired) => {
                let tools: Vec<_> = acquired.mcp.tools.iter().map(|t| t.name.as_str()).collect();
                info!(
                    name = %name,
                    instance_id = %acquired.instance_id,
                    tools = ?tools,
                    "[Host] Provider ready"
                );
                pool.release_instance(HOST_SESSION, &acquired.instance_id);
            }
            Err(e) => error!(name = %name, error = %e, "[Host] Provider failed to start"),
        }
        let envelope = ApiResponse::from_result(acquired);
        if let Ok(json) = serde_json::to_string(&envelope) {
            tracing::debug!(name = %name, "[Host] {}", json);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_tracing()?;

    let settings = PoolSettings::from_env();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        max_instances = settings.registry.max_instances,
        max_per_user = settings.registry.max_instances_per_user,
        "[Host] Starting mcpool"
    );

    let registry = Arc::new(InstanceRegistry::new(settings.registry.clone()));
    let pool = Arc::new(PoolManager::new(
        registry.clone(),
        ConnectorFactory::new(&settings.transport),
        Arc::new(UuidGenerator),
        settings.lifecycle.termination_timeout,
    ));
    let lifecycle = Arc::new(
        LifecycleManager::new(registry, pool.clone(), settings.lifecycle.clone())
            .with_health_probe(pool.clone()),
    );
    lifecycle.start();

    let command_lines: Vec<String> = std::env::args().skip(1).collect();
    warm_providers(&pool, &command_lines).await;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("[Host] Shutting down");

    lifecycle.stop();
    let report = pool.shutdown().await;
    info!(
        evicted = report.evicted.len(),
        failed = report.failed.len(),
        timed_out = report.timed_out.len(),
        "[Host] Pool drained"
    );
    Ok(())
}
