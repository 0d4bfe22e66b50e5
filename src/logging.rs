//! # Structured Logging Module
//!
//! Environment-aware structured logging for the coordinator's async tasks.
//! Console output by default; JSON lines in production or when
//! `TASKER_RPC_LOG_FORMAT=json`.

use std::sync::OnceLock;
use std::time::Duration;

use chrono::Utc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(get_log_level(&environment)));
        let json = use_json_format(
            &environment,
            std::env::var("TASKER_RPC_LOG_FORMAT").ok().as_deref(),
        );

        let layer = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed()
        };

        // Use try_init to avoid panic if a global subscriber is already set
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!(
                "Global tracing subscriber already initialized - continuing with existing subscriber"
            );
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            json = json,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("TASKER_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
        .to_lowercase()
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

fn use_json_format(environment: &str, format: Option<&str>) -> bool {
    match format {
        Some(format) => format.eq_ignore_ascii_case("json"),
        None => environment == "production",
    }
}

/// Log one step in a call's lifecycle (enqueued, published, resolved, timed out)
pub fn log_call_operation(
    operation: &str,
    destination: &str,
    correlation_id: &str,
    status: &str,
    elapsed: Option<Duration>,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        destination = %destination,
        correlation_id = %correlation_id,
        status = %status,
        elapsed_ms = elapsed.map(|d| d.as_millis() as u64),
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📨 CALL_OPERATION"
    );
}

/// Log the outcome of applying a status-update event to a task record
pub fn log_status_transition(
    task_id: &str,
    from: Option<&str>,
    to: &str,
    outcome: &str,
    details: Option<&str>,
) {
    tracing::info!(
        task_id = %task_id,
        from = from,
        to = %to,
        outcome = %outcome,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📋 TASK_TRANSITION"
    );
}
