use anyhow::Context;
use clap::Parser;
use gatecall::application::TriggerGateway;
use gatecall::config::{Config, CONFIG_EXAMPLE};
use gatecall::domain::session::SessionState;
use gatecall::domain::shared::SipUri;
use gatecall::infrastructure::protocols::sip::{
    discover_local_ip, CallStateMachine, DialogFactory, DigestAuthenticator, Transport,
    UdpTransport,
};
use gatecall::interface::api::{build_router, init_metrics, ApiState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Opens a gate by ringing a phone over SIP")]
struct Cli {
    /// Path to the configuration file
    #[arg(long = "cfg", default_value = "config.yml")]
    cfg: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if !cli.cfg.exists() {
        println!(
            "Config {} doesn't exist, example content:\n\n{}",
            cli.cfg.display(),
            CONFIG_EXAMPLE
        );
        return Ok(());
    }

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting gatecall");

    // Load configuration
    let config = Config::load(&cli.cfg)?;
    info!("Using config file {}", cli.cfg.display());

    let prometheus_handle = init_metrics().context("failed to install metrics recorder")?;

    // Resolve registrar and our outbound address
    let registrar_addr: SocketAddr = tokio::net::lookup_host(config.registrar_addr())
        .await
        .with_context(|| format!("cannot resolve {}", config.registrar_addr()))?
        .next()
        .with_context(|| format!("no address for {}", config.registrar_addr()))?;
    let local_ip = discover_local_ip(registrar_addr).await?;
    info!("Registrar {} reachable from {}", registrar_addr, local_ip);

    // Start SIP transport
    let bind: SocketAddr = if registrar_addr.is_ipv6() {
        SocketAddr::new("::".parse()?, config.sip.local_port)
    } else {
        SocketAddr::new("0.0.0.0".parse()?, config.sip.local_port)
    };
    let mut udp = UdpTransport::new(bind, registrar_addr);
    let channels = udp.start().await?;
    let local_port = udp
        .local_addr()
        .map(|addr| addr.port())
        .context("SIP socket has no local address")?;
    info!("SIP socket on port {}, registrar {}", local_port, udp.remote());
    let transport: Arc<dyn Transport> = Arc::new(udp);

    let registrar = SipUri::server(&config.sip.server).with_port(config.sip.port);
    let factory = DialogFactory::new(
        &config.sip.user,
        registrar,
        SocketAddr::new(local_ip, local_port),
    )
    .with_user_agent(&config.sip.user_agent)
    .with_expires(config.sip.expires);

    let session = Arc::new(SessionState::new());
    let machine = CallStateMachine::new(
        config.machine_settings(),
        transport,
        channels,
        factory,
        DigestAuthenticator::new(&config.sip.user, &config.sip.password),
        session,
    );
    let gateway = TriggerGateway::new(machine.control(config.call_timing()), &config.sip.call_number);
    let user_agent = tokio::spawn(machine.run());

    // Start HTTP trigger
    let app = build_router(ApiState::new(gateway), prometheus_handle);
    let listener = tokio::net::TcpListener::bind(config.http_bind())
        .await
        .with_context(|| format!("cannot listen on {}", config.http_bind()))?;
    info!("HTTP trigger listening on http://{}/open", config.http_bind());

    let api = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    });

    tokio::select! {
        result = user_agent => {
            match result? {
                Ok(()) => info!("User agent stopped"),
                Err(e) => {
                    error!("User agent failed: {}", e);
                    return Err(e.into());
                }
            }
        }
        result = api => {
            result??;
            info!("HTTP server stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}
