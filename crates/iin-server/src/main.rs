//! IIN agent binary.
//!
//! Starts an axum HTTP server with structured logging, database
//! initialization, background sync and sweeping, and graceful shutdown on
//! SIGTERM/SIGINT.

use ed25519_dalek::SigningKey;
use iin_attest::{AttestationSigner, Certificate};
use iin_protocol::{AgentConfig, IinAgent};
use iin_server::{
    app, background, config, ledger::SqliteLedgerGateway, transport::HttpAgentTransport, AppState,
};
use iin_types::Membership;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("IIN_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

/// Reads a hex-encoded 32-byte Ed25519 secret key.
fn load_signing_key(path: &str) -> Result<SigningKey, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| format!("cannot read {path}: {e}"))?;
    let bytes = hex::decode(raw.trim()).map_err(|e| format!("{path} is not hex: {e}"))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| format!("{path} must hold exactly 32 bytes"))?;
    Ok(SigningKey::from_bytes(&bytes))
}

/// Reads the agent's X.509 certificate and checks it was issued for `key`.
/// Returns the parsed certificate and the PEM text attestations carry.
fn load_agent_certificate(path: &str, key: &SigningKey) -> Result<(Certificate, String), String> {
    let pem = std::fs::read_to_string(path).map_err(|e| format!("cannot read {path}: {e}"))?;
    let certificate = Certificate::from_pem(&pem).map_err(|e| format!("{path}: {e}"))?;
    let certificate_key = certificate
        .verifying_key()
        .map_err(|e| format!("{path}: {e}"))?;
    if certificate_key != key.verifying_key() {
        return Err(format!(
            "{path} was issued for a different key than the agent signing key"
        ));
    }
    Ok((certificate, pem))
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration, the agent cannot start without valid config");

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    config.validate().expect("invalid agent configuration");
    let identity = config.identity();

    // Initialize database
    let pool = iin_db::create_pool(
        &config.database.path,
        iin_db::DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
        },
    )
    .expect("failed to create database pool, check database.path in config");

    {
        let conn = pool
            .get()
            .expect("failed to get database connection for migrations");
        let applied = iin_db::run_migrations(&conn).expect("failed to run database migrations");
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }

        if let Some(path) = &config.agent.local_membership_path {
            let raw = std::fs::read_to_string(path).expect("failed to read local membership file");
            let membership: Membership =
                serde_json::from_str(&raw).expect("local membership file is not valid JSON");
            assert_eq!(
                membership.security_domain, identity.security_domain,
                "local membership belongs to a different security domain"
            );
            iin_db::store_local_membership(&conn, &membership)
                .expect("failed to store local membership");
            tracing::info!(
                path = %path,
                members = membership.members.len(),
                "loaded local membership"
            );
        }
    }

    // Key material
    let signing_key = load_signing_key(&config.agent.signing_key_path)
        .expect("failed to load agent signing key");
    let (certificate, certificate_pem) =
        load_agent_certificate(&config.agent.certificate_path, &signing_key)
            .expect("failed to load agent certificate");
    tracing::info!(
        subject = certificate.subject(),
        fingerprint = %certificate.fingerprint(),
        "loaded agent certificate"
    );

    // Build agent
    let dns = config.security_domain_dns();
    let transport = HttpAgentTransport::new(dns.clone(), config.protocol.request_timeout())
        .expect("failed to build agent transport");
    let ledger = SqliteLedgerGateway::new(
        pool.clone(),
        AttestationSigner::new(identity.clone(), signing_key, certificate_pem),
    );
    let agent = IinAgent::new(
        AgentConfig::new(identity.clone(), dns)
            .with_refresh_time(config.protocol.refresh_time())
            .with_run_timeout(config.protocol.run_timeout()),
        Arc::new(ledger),
        Arc::new(transport),
    );

    tokio::spawn(background::start_sweeper_task(agent.clone()));
    if config.protocol.auto_sync {
        tokio::spawn(background::start_auto_sync_task(
            agent.clone(),
            std::time::Duration::from_secs(config.protocol.sync_period),
        ));
    }

    let app = app(AppState { pool, agent });
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, agent = %identity, "starting iin agent");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address, is another process using this port?");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    tracing::info!("iin agent shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
