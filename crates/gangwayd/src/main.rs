//! Gangway daemon shell.
//!
//! Reads the environment exactly once at startup to build the [`Config`]
//! injected into the pipeline, initialises tracing, and runs until ctrl-c.
//! The container runtime adapter and the protocol listener plug in here;
//! everything below this binary takes its configuration by value and never
//! touches ambient process state.

use anyhow::{Context, Result};
use tracing::Level;

use gangway_core::{init_tracing, Config, PolicyMode, METRICS, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    let json_logs = env_bool("GANGWAY_LOG_JSON", false);
    let level = env_level("GANGWAY_LOG_LEVEL", Level::INFO);
    init_tracing(json_logs, level);

    let cfg = config_from_env().context("invalid configuration")?;
    tracing::info!(
        event = "gangwayd.started",
        version = VERSION,
        policy_mode = ?cfg.security.policy_mode,
        allow_root = cfg.security.allow_root,
        max_concurrent = cfg.session.max_concurrent,
        rate_limiting = cfg.rate_limit.enabled,
        audit = cfg.audit.enabled,
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    METRICS.flush();
    tracing::info!(event = "gangwayd.stopped");
    Ok(())
}

/// Build the injected [`Config`] from `GANGWAY_*` environment variables.
/// Unset variables keep their defaults; malformed values are errors, not
/// silent fallbacks.
fn config_from_env() -> Result<Config> {
    let mut cfg = Config::default();

    cfg.security.allow_root = env_bool("GANGWAY_ALLOW_ROOT", cfg.security.allow_root);
    if let Ok(mode) = std::env::var("GANGWAY_POLICY_MODE") {
        cfg.security.policy_mode = parse_policy_mode(&mode)?;
    }
    if let Some(patterns) = env_list("GANGWAY_COMMAND_PATTERNS") {
        cfg.security.command_patterns = patterns;
    }
    if let Some(flags) = env_list("GANGWAY_DENIED_FLAGS") {
        cfg.security.denied_flags = flags;
    }
    if let Some(paths) = env_list("GANGWAY_DENIED_PATHS") {
        cfg.security.denied_paths = paths;
    }

    cfg.rate_limit.enabled = env_bool("GANGWAY_RATE_LIMIT", cfg.rate_limit.enabled);
    cfg.rate_limit.window_ms = env_parse("GANGWAY_RATE_WINDOW_MS", cfg.rate_limit.window_ms)?;
    cfg.rate_limit.exec_limit = env_parse("GANGWAY_RATE_EXEC_LIMIT", cfg.rate_limit.exec_limit)?;
    cfg.rate_limit.logs_limit = env_parse("GANGWAY_RATE_LOGS_LIMIT", cfg.rate_limit.logs_limit)?;
    cfg.rate_limit.inspect_limit =
        env_parse("GANGWAY_RATE_INSPECT_LIMIT", cfg.rate_limit.inspect_limit)?;

    cfg.session.max_concurrent =
        env_parse("GANGWAY_MAX_CONCURRENT", cfg.session.max_concurrent)?;
    cfg.session.stale_after_secs =
        env_parse("GANGWAY_STALE_AFTER_SECS", cfg.session.stale_after_secs)?;
    cfg.session.sweep_interval_secs =
        env_parse("GANGWAY_SWEEP_INTERVAL_SECS", cfg.session.sweep_interval_secs)?;
    cfg.session.max_output_bytes =
        env_parse("GANGWAY_MAX_OUTPUT_BYTES", cfg.session.max_output_bytes)?;
    cfg.session.default_timeout_ms =
        env_parse("GANGWAY_DEFAULT_TIMEOUT_MS", cfg.session.default_timeout_ms)?;

    cfg.breaker.failure_threshold =
        env_parse("GANGWAY_BREAKER_FAILURES", cfg.breaker.failure_threshold)?;
    cfg.breaker.reset_timeout_ms =
        env_parse("GANGWAY_BREAKER_RESET_MS", cfg.breaker.reset_timeout_ms)?;

    cfg.audit.enabled = env_bool("GANGWAY_AUDIT", cfg.audit.enabled);

    Ok(cfg)
}

fn parse_policy_mode(value: &str) -> Result<PolicyMode> {
    match value.to_lowercase().as_str() {
        "allowlist" => Ok(PolicyMode::Allowlist),
        "denylist" => Ok(PolicyMode::Denylist),
        "none" => Ok(PolicyMode::None),
        other => anyhow::bail!("unknown policy mode: {other}"),
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_level(name: &str, default: Level) -> Level {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_list(name: &str) -> Option<Vec<String>> {
    let raw = std::env::var(name).ok()?;
    Some(
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(v) => v
            .parse()
            .with_context(|| format!("{name} has an unparseable value: {v}")),
        Err(_) => Ok(default),
    }
}
