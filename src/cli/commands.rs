//! CLI command implementations
//!
//! Commands are thin: they load configuration, build the registry on the
//! hosted feed and print what it delivers. All subscription behavior lives
//! in [`crate::realtime`].

use std::path::Path;

use serde_json::Value;

use crate::config::RealtimeConfig;
use crate::observability::{log_event, Event, Logger};
use crate::realtime::{
    ChangeKinds, PhoenixFeed, RealtimeRegistry, StatsMonitor, SubscriptionKey,
};

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};
use super::io::{write_error, write_event, write_response, write_stats};

const REDACTED: &str = "********";

/// Main entry point for CLI
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    Logger::init_from_env();

    match cmd {
        Command::CheckConfig { config } => check_config(&config),
        Command::Watch {
            config,
            table,
            user,
            events,
        } => watch(&config, &table, &user, events.as_deref()),
    }
}

/// Load, validate and print a configuration file
pub fn check_config(config_path: &Path) -> CliResult<()> {
    let config = load_config(config_path)?;
    write_response(redacted(&config)?)
}

/// Stream coalesced changes of one (table, user) until Ctrl-C
pub fn watch(config_path: &Path, table: &str, user: &str, events: Option<&str>) -> CliResult<()> {
    let config = load_config(config_path)?;
    let key = SubscriptionKey::new(table, user)?;
    let kinds = match events {
        Some(list) => ChangeKinds::parse_list(list)?,
        None => ChangeKinds::all(),
    };

    if !config.provider.is_configured() {
        return Err(CliError::config_error(
            "watch needs provider.endpoint and an API key",
        ));
    }

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::runtime_error(format!("Failed to create tokio runtime: {}", e)))?;

    rt.block_on(watch_feed(config, key, kinds))
}

async fn watch_feed(config: RealtimeConfig, key: SubscriptionKey, kinds: ChangeKinds) -> CliResult<()> {
    let feed = PhoenixFeed::connect(&config.provider).await?;
    let registry = RealtimeRegistry::new(feed, &config)?;

    let subscription = registry.subscribe_with_observer(
        &key,
        kinds,
        |event| {
            write_event(event)?;
            Ok(())
        },
        |err| {
            let _ = write_error(err.as_code(), &err.to_string());
        },
    );

    let monitor = StatsMonitor::spawn(registry.clone(), config.monitor_interval(), |stats| {
        let _ = write_stats(stats);
    });

    let interrupted = tokio::signal::ctrl_c().await;

    monitor.stop();
    subscription.unsubscribe();
    registry.cleanup();

    interrupted.map_err(|e| CliError::io_error(format!("Failed to wait for Ctrl-C: {}", e)))
}

fn load_config(config_path: &Path) -> CliResult<RealtimeConfig> {
    let config = RealtimeConfig::load(config_path)?;

    let path = config_path.display().to_string();
    let window = config.debounce_window_ms.to_string();
    log_event(
        Event::ConfigLoaded,
        &[
            ("debounce_window_ms", window.as_str()),
            ("path", path.as_str()),
        ],
    );
    Ok(config)
}

/// Configuration as JSON with the API key masked
fn redacted(config: &RealtimeConfig) -> CliResult<Value> {
    let mut value = serde_json::to_value(config)?;
    if let Some(key) = value.pointer_mut("/provider/api_key") {
        *key = Value::String(REDACTED.to_string());
    }
    Ok(value)
}
