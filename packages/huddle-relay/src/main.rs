//! Huddle relay server binary.

use std::time::Duration;

use clap::Parser;

use huddle_relay::state::{RelayConfig, RelayState};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "huddle-relay", version, about = "Huddle call signaling relay")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "RELAY_PORT")]
    port: u16,

    /// Call session TTL in seconds
    #[arg(long, default_value_t = 4 * 3600, env = "CALL_TTL_SECS")]
    call_ttl_secs: i64,

    /// Cleanup interval in seconds
    #[arg(long, default_value_t = 300, env = "CLEANUP_INTERVAL_SECS")]
    cleanup_interval_secs: u64,

    /// Collection holding call session documents
    #[arg(long, default_value = "calls", env = "SESSIONS_COLLECTION")]
    sessions_collection: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "huddle_relay=info,tower_http=info".into());
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = RelayConfig {
        port: args.port,
        call_ttl_secs: args.call_ttl_secs,
        cleanup_interval_secs: args.cleanup_interval_secs,
        sessions_collection: args.sessions_collection,
    };
    let state = RelayState::new(config);

    // Spawn periodic cleanup task
    let cleanup_state = state.clone();
    let cleanup_interval = args.cleanup_interval_secs.max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(cleanup_interval));
        loop {
            interval.tick().await;
            cleanup_state.cleanup_expired_calls().await;
        }
    });

    let app = huddle_relay::router(state);

    let addr = format!("0.0.0.0:{}", args.port);
    tracing::info!("Huddle relay server starting on {}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = addr.as_str(), error = %e, "Failed to bind address");
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["huddle-relay"]);
        assert_eq!(args.port, 8080);
        assert_eq!(args.call_ttl_secs, 4 * 3600);
        assert_eq!(args.cleanup_interval_secs, 300);
        assert_eq!(args.sessions_collection, "calls");
    }

    #[test]
    fn test_args_override() {
        let args = Args::parse_from(["huddle-relay", "-p", "9000", "--call-ttl-secs", "60"]);
        assert_eq!(args.port, 9000);
        assert_eq!(args.call_ttl_secs, 60);
    }
}
