//! SPNEGO Reverse Proxy CLI
//!
//! An HTTP reverse proxy that authenticates to a Kerberos-protected backend
//! with a keytab identity, so its clients do not have to.

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use spnego_proxy_core::config::{
    parse_spn_mapping_entry, AuthConfig, LoggingConfig, ProxyConfig, TargetConfig,
};
use spnego_proxy_core::context::ContextCache;
use spnego_proxy_core::error::CredentialInitError;
use spnego_proxy_core::forward::ForwardingExecutor;
use spnego_proxy_core::identity::{CredentialRenewer, IdentityStore, RenewalPolicy};
use spnego_proxy_core::kerberos::{Identity, KerberosClient};
use spnego_proxy_core::metrics::ProxyMetrics;
use spnego_proxy_core::network::ProxyListener;

/// Reverse proxy that speaks SPNEGO to the backend on behalf of its clients.
#[derive(Parser)]
#[command(name = "spnego-proxy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML configuration file. Flags override its values.
    #[arg(short, long)]
    config: Option<String>,

    /// Backend base URL every request is forwarded to.
    #[arg(long)]
    target_url: Option<String>,

    /// Keytab holding the proxy's key.
    #[arg(long)]
    keytab_path: Option<String>,

    /// krb5.conf used by the Kerberos library.
    #[arg(long)]
    kerberos_config_path: Option<String>,

    /// Service part of default SPNs.
    #[arg(long = "gssapi-servicename")]
    gssapi_service_name: Option<String>,

    /// Principal the proxy logs in as.
    #[arg(long = "gssapi-username")]
    gssapi_user_name: Option<String>,

    /// Kerberos realm.
    #[arg(long)]
    realm: Option<String>,

    /// Disable FAST armoring in the AS exchange.
    #[arg(long = "disable-pafx-fast")]
    disable_pa_fx_fast: bool,

    /// Explicit SPN overrides: host=SPN,host=SPN.
    #[arg(long, value_delimiter = ',')]
    spn_hosts_mapping: Vec<String>,

    /// Log level: trace, debug, info, warn, error.
    #[arg(long)]
    log_level: Option<String>,

    /// Port to listen on, on all interfaces.
    #[arg(long)]
    port: Option<u16>,

    /// Full listen address; wins over --port.
    #[arg(long)]
    listen: Option<String>,

    /// Serve Prometheus metrics.
    #[arg(long)]
    enable_prometheus: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    // Override log level from verbosity flag
    let log_config = match args.verbose {
        0 => config.logging.clone(),
        1 => LoggingConfig {
            level: "debug".to_string(),
            ..config.logging.clone()
        },
        _ => LoggingConfig {
            level: "trace".to_string(),
            ..config.logging.clone()
        },
    };

    setup_tracing(&log_config);

    let identity = config.auth.identity();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen.address,
        target = %config.target.url,
        principal = %identity.principal_name(),
        keytab = %identity.keytab_path.display(),
        krb5_config = %identity.kerberos_config_path.display(),
        service_name = %config.auth.service_name,
        spn_overrides = config.auth.spn_hosts_mapping.len(),
        metrics_enabled = config.metrics.enabled,
        "starting spnego proxy"
    );

    // The Kerberos library reads its environment, so this happens before any
    // runtime thread exists.
    let kerberos = kerberos_backend(&identity)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move { run_proxy(config, kerberos).await })
}

/// File values first, then flags on top.
fn load_config(args: &Args) -> anyhow::Result<ProxyConfig> {
    let mut config = match &args.config {
        Some(path) => ProxyConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {path}"))?,
        None => {
            let target_url = args
                .target_url
                .clone()
                .context("--target-url is required without --config")?;
            let keytab_path = args
                .keytab_path
                .clone()
                .context("--keytab-path is required without --config")?;
            let realm = args
                .realm
                .clone()
                .context("--realm is required without --config")?;
            ProxyConfig::new(TargetConfig::new(target_url), AuthConfig::new(keytab_path, realm))
        }
    };

    if let Some(url) = &args.target_url {
        config.target.url = url.clone();
    }
    if let Some(path) = &args.keytab_path {
        config.auth.keytab_path = path.clone();
    }
    if let Some(path) = &args.kerberos_config_path {
        config.auth.kerberos_config_path = path.clone();
    }
    if let Some(service) = &args.gssapi_service_name {
        config.auth.service_name = service.clone();
    }
    if let Some(user) = &args.gssapi_user_name {
        config.auth.user_name = user.clone();
    }
    if let Some(realm) = &args.realm {
        config.auth.realm = realm.clone();
    }
    if args.disable_pa_fx_fast {
        config.auth.disable_pa_fx_fast = true;
    }
    for entry in args.spn_hosts_mapping.iter().filter(|e| !e.trim().is_empty()) {
        let (host, spn) = parse_spn_mapping_entry(entry)?;
        config.auth.spn_hosts_mapping.insert(host, spn);
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if let Some(port) = args.port {
        config.listen.address = format!("0.0.0.0:{port}");
    }
    if let Some(listen) = &args.listen {
        config.listen.address = listen.clone();
    }
    if args.enable_prometheus {
        config.metrics.enabled = true;
    }

    Ok(config.finalize()?)
}

fn setup_tracing(config: &LoggingConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }
}

#[cfg(feature = "gssapi")]
fn kerberos_backend(identity: &Identity) -> Result<Arc<dyn KerberosClient>, CredentialInitError> {
    use spnego_proxy_core::kerberos::gssapi::GssapiKerberos;

    Ok(Arc::new(GssapiKerberos::configure_environment(identity)?))
}

#[cfg(not(feature = "gssapi"))]
fn kerberos_backend(_identity: &Identity) -> Result<Arc<dyn KerberosClient>, CredentialInitError> {
    Err(CredentialInitError::NoBackend(
        "rebuild with `--features gssapi`".to_string(),
    ))
}

async fn run_proxy(config: ProxyConfig, kerberos: Arc<dyn KerberosClient>) -> anyhow::Result<()> {
    let metrics = Arc::new(ProxyMetrics::new());

    // Initial login is fatal on failure.
    let identity = Arc::new(
        IdentityStore::initialize(
            config.auth.identity(),
            Arc::clone(&kerberos),
            RenewalPolicy::from_config(&config.auth),
        )
        .await?,
    );

    // Start the renewer before anything can ask for a credential.
    let (renewer_shutdown_tx, renewer_shutdown_rx) = watch::channel(false);
    let mut renewer =
        tokio::spawn(CredentialRenewer::new(Arc::clone(&identity), renewer_shutdown_rx).run());

    if config.metrics.enabled {
        let metrics_clone = Arc::clone(&metrics);
        let metrics_addr = config.metrics.address.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(&metrics_addr, metrics_clone).await {
                error!(error = %e, "metrics server error");
            }
        });
        info!(address = %config.metrics.address, "metrics server started");

        let mut events = identity.subscribe();
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => metrics.record_credential_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "credential events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    let cache = Arc::new(ContextCache::new(config.auth.renewal_margin()));
    let executor = Arc::new(
        ForwardingExecutor::new(&config, kerberos, Arc::clone(&identity), cache)?
            .with_metrics(Arc::clone(&metrics)),
    );

    let listener = ProxyListener::bind(&config.listen, executor)
        .await
        .with_context(|| format!("failed to bind {}", config.listen.address))?
        .with_metrics(Arc::clone(&metrics));
    let shutdown_handle = listener.shutdown_handle();
    let listener_task = tokio::spawn(async move { listener.run().await });

    let outcome = tokio::select! {
        () = shutdown_signal() => {
            info!("shutdown signal received, stopping proxy");
            Ok(())
        }
        renewal = &mut renewer => match renewal {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!(error = %e, "credential lost, stopping proxy");
                Err(anyhow::Error::new(e))
            }
            Err(e) => Err(anyhow::Error::new(e).context("credential renewer panicked")),
        },
    };

    let _ = shutdown_handle.send(());
    let _ = renewer_shutdown_tx.send(true);
    listener_task.await??;

    info!("proxy shutdown complete");
    outcome
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

async fn start_metrics_server(
    addr: &str,
    metrics: Arc<ProxyMetrics>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;

    info!(address = %addr, "metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = Arc::clone(&metrics);

        tokio::spawn(async move {
            let service = service_fn(move |_req: Request<hyper::body::Incoming>| {
                let metrics = Arc::clone(&metrics);
                async move {
                    let body = metrics.encode().unwrap_or_default();
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(body))))
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %e, "metrics connection error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("spnego-proxy").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_flags_only_config() {
        let args = parse(&[
            "--target-url",
            "http://namenode:9870/",
            "--keytab-path",
            "/etc/proxy.keytab",
            "--realm",
            "EXAMPLE.COM",
            "--gssapi-username",
            "svc-proxy",
            "--spn-hosts-mapping",
            "namenode=HTTP/nn.internal@EXAMPLE.COM,edge=HTTP/edge@EXAMPLE.COM",
            "--port",
            "8081",
            "--enable-prometheus",
        ]);

        let config = load_config(&args).unwrap();
        assert_eq!(config.target.url, "http://namenode:9870");
        assert_eq!(config.auth.user_name, "svc-proxy");
        assert_eq!(config.auth.spn_hosts_mapping.len(), 2);
        assert_eq!(config.listen.address, "0.0.0.0:8081");
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_missing_required_flag() {
        let args = parse(&["--target-url", "http://namenode:9870"]);
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn test_invalid_spn_mapping() {
        let args = parse(&[
            "--target-url",
            "http://namenode:9870",
            "--keytab-path",
            "/etc/proxy.keytab",
            "--realm",
            "EXAMPLE.COM",
            "--spn-hosts-mapping",
            "no-separator",
        ]);
        assert!(load_config(&args).is_err());
    }

    #[cfg(not(feature = "gssapi"))]
    #[test]
    fn test_no_backend_without_feature() {
        let auth = AuthConfig::new("/etc/proxy.keytab", "EXAMPLE.COM");
        assert!(matches!(
            kerberos_backend(&auth.identity()),
            Err(CredentialInitError::NoBackend(_))
        ));
    }
}
