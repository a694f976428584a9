//! Thin entry point: load configuration, stand up logging, wire the (demo) collaborators,
//! and run the listener until asked to stop.
//!
//! Deliberately does not carry the teacher's Windows-service machinery (`ceviche`
//! registration, service control handler) — this crate ships as a plain foreground/daemon
//! process, not a Windows service.

use jimm_gateway::audit::NullAuditSink;
use jimm_gateway::config::ConfHandle;
use jimm_gateway::dev_services::{DevLoginService, DevTokenGenerator, StaticControllerDirectory};
use jimm_gateway::http::{self, AppState};
use jimm_gateway::listener::{GatewayListener, ListenerTask};
use jimm_gateway::tls;

use anyhow::Context as _;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

fn main() -> anyhow::Result<()> {
    let conf_handle = ConfHandle::init().context("failed to load configuration")?;
    let conf = conf_handle.get_conf();

    let _logger_guard = jimm_log::init::<GatewayLogConfig>(&conf.log_file, &conf.log_filter, None)
        .context("failed to initialize logging")?;

    tls::install_default_crypto_provider();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build async runtime")?;

    runtime.block_on(run(conf))
}

struct GatewayLogConfig;

impl jimm_log::StaticLogConfig for GatewayLogConfig {
    const MAX_BYTES_PER_LOG_FILE: u64 = 3_000_000;
    const MAX_LOG_FILES: usize = 10;
    const LOG_FILE_PREFIX: &'static str = "jimm-gateway";
}

async fn run(conf: Arc<jimm_gateway::config::Conf>) -> anyhow::Result<()> {
    let tls_acceptor = build_tls_acceptor(&conf)?;

    let state = AppState {
        conf: Arc::clone(&conf),
        login_service: Arc::new(DevLoginService),
        token_generator: Arc::new(DevTokenGenerator),
        controller_directory: Arc::new(StaticControllerDirectory::from_conf(&conf)),
        audit_sink: Arc::new(NullAuditSink),
    };

    let router = http::make_router(state);
    let listener = GatewayListener::init_and_bind(&conf, tls_acceptor).await?;

    let (shutdown, shutdown_signal) = jimm_gateway_task::ShutdownHandle::new();
    let listener_task = jimm_gateway_task::spawn_task(ListenerTask::new(listener, router), shutdown_signal.clone());
    let log_deleter_task = jimm_gateway_task::spawn_task(jimm_log::LogDeleterTask::<GatewayLogConfig>::new(conf.log_file.clone()), shutdown_signal);

    wait_for_stop_signal().await;
    shutdown.signal();

    let listener_result = match listener_task.join().await {
        Ok(result) => result,
        Err(error) if error.is_cancelled() => Ok(()),
        Err(error) => Err(error).context("listener task panicked"),
    };

    if let Err(error) = log_deleter_task.join().await {
        if !error.is_cancelled() {
            warn!(%error, "log deleter task panicked");
        }
    }

    listener_result
}

fn build_tls_acceptor(conf: &jimm_gateway::config::Conf) -> anyhow::Result<TlsAcceptor> {
    let cert_path = conf.tls_certificate_file.as_ref().context("tls-certificate-file not configured")?;
    let key_path = conf.tls_private_key_file.as_ref().context("tls-private-key-file not configured")?;

    let cert_pem = std::fs::read_to_string(cert_path).with_context(|| format!("failed to read {cert_path}"))?;
    let key_pem = std::fs::read_to_string(key_path).with_context(|| format!("failed to read {key_path}"))?;

    let certificates = tls::load_certificates(&cert_pem)?;
    let private_key = tls::load_private_key(&key_pem)?;
    let server_config = tls::build_server_config(certificates, private_key)?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

#[cfg(unix)]
async fn wait_for_stop_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_stop_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received ctrl-c");
}
