use std::{net::SocketAddr, time::Duration};

use api::{
    http::{ApiClient, ApiConfig},
    subscriber::{Subscriber, SubscriberConfig},
};
use clap::Parser;
use error::Error;
use metrics_exporter_prometheus::PrometheusBuilder;
use portforward::{Portforward, iptables::IptablesBackend};
use scheduler::{Context, JitterTicker, Scheduler};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use wg::{Wireguard, cmd::WgCmdBackend};

mod api;
pub(crate) mod error;
mod portforward;
mod scheduler;
mod wg;

/// Upper bound for every configured duration.
const MAX_DURATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Keeps WireGuard peers and port forwarding rules in sync with the control plane.
#[derive(Debug, clap::Parser)]
#[command(version)]
pub struct Args {
    /// How often peers are synchronized with the api
    #[arg(long, env = "WG_INTERVAL", default_value = "1m", value_parser = humantime::parse_duration)]
    interval: Duration,

    /// Max random delay added to every synchronization interval
    #[arg(long, env = "WG_DELAY", default_value = "45s", value_parser = humantime::parse_duration)]
    delay: Duration,

    /// Max duration of api requests
    #[arg(long, env = "WG_API_TIMEOUT", default_value = "30s", value_parser = humantime::parse_duration)]
    api_timeout: Duration,

    /// Api url
    #[arg(long, env = "WG_URL", default_value = "https://example.com")]
    url: String,

    /// Api username
    #[arg(long, env = "WG_USERNAME", default_value = "")]
    username: String,

    /// Api password
    #[arg(long, env = "WG_PASSWORD", default_value = "", hide_env_values = true)]
    password: String,

    /// Hostname reported along with connected peers
    #[arg(long, env = "WG_HOSTNAME", default_value = "")]
    hostname: String,

    /// Comma separated wireguard interfaces to configure, eg `wg0,wg1`
    #[arg(long, env = "WG_INTERFACES", default_value = "wg0", value_delimiter = ',')]
    interfaces: Vec<String>,

    /// Prefix of the nat chains used for port forwarding
    #[arg(long, env = "WG_PORTFORWARDING_CHAIN_PREFIX", default_value = "PORTFORWARDING")]
    portforwarding_chain_prefix: String,

    /// Ipset used for port forwarding of ipv4 addresses
    #[arg(long, env = "WG_PORTFORWARDING_IPSET_IPV4", default_value = "PORTFORWARDING_IPV4")]
    portforwarding_ipset_ipv4: String,

    /// Ipset used for port forwarding of ipv6 addresses
    #[arg(long, env = "WG_PORTFORWARDING_IPSET_IPV6", default_value = "PORTFORWARDING_IPV6")]
    portforwarding_ipset_ipv6: String,

    /// Message-queue url
    #[arg(long, env = "WG_MQ_URL", default_value = "wss://example.com/mq")]
    mq_url: String,

    /// Message-queue username
    #[arg(long, env = "WG_MQ_USERNAME", default_value = "")]
    mq_username: String,

    /// Message-queue password
    #[arg(long, env = "WG_MQ_PASSWORD", default_value = "", hide_env_values = true)]
    mq_password: String,

    /// Message-queue channel
    #[arg(long, env = "WG_MQ_CHANNEL", default_value = "wireguard")]
    mq_channel: String,

    /// Serve prometheus metrics on this address
    #[arg(long, env = "WG_METRICS_ADDRESS")]
    metrics_address: Option<SocketAddr>,
}

impl Args {
    fn interfaces(&self) -> Vec<String> {
        self.interfaces
            .iter()
            .map(|iface| iface.trim())
            .filter(|iface| !iface.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn validate(&self) -> Result<(), Error> {
        if self.interfaces().is_empty() {
            return Err(Error::Config("no wireguard interfaces configured".into()));
        }

        for (name, value) in [
            ("interval", self.interval),
            ("delay", self.delay),
            ("api timeout", self.api_timeout),
        ] {
            if value > MAX_DURATION {
                return Err(Error::Config(format!(
                    "{name} {value:?} exceeds the maximum of {MAX_DURATION:?}"
                )));
            }
        }

        if self.api_timeout >= self.interval {
            return Err(Error::Config(format!(
                "api timeout {:?} must be shorter than the interval {:?}",
                self.api_timeout, self.interval
            )));
        }

        Ok(())
    }

    fn api_config(&self) -> ApiConfig {
        ApiConfig {
            url: self.url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            hostname: self.hostname.clone(),
            timeout: self.api_timeout,
        }
    }

    fn subscriber_config(&self) -> SubscriberConfig {
        SubscriberConfig {
            url: self.mq_url.clone(),
            username: self.mq_username.clone(),
            password: self.mq_password.clone(),
            channel: self.mq_channel.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if let Err(err) = run(args).await {
        log::error!("fatal: {err}");
        return Err(err);
    }

    Ok(())
}

async fn run(args: Args) -> Result<(), Error> {
    log::info!("starting wg-agent {}", env!("CARGO_PKG_VERSION"));
    args.validate()?;

    if let Some(addr) = args.metrics_address {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        log::info!("serving metrics on {addr}");
    }

    let ctx = Context {
        source: ApiClient::new(args.api_config())?,
        wireguard: Wireguard::new(WgCmdBackend::new(), args.interfaces())?,
        portforward: Portforward::new(
            IptablesBackend::new(),
            &args.portforwarding_chain_prefix,
            &args.portforwarding_ipset_ipv4,
            &args.portforwarding_ipset_ipv6,
        )?,
    };

    let shutdown = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => log::info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => log::info!("received SIGTERM, shutting down"),
            }
            shutdown.cancel();
        }
    });

    let mut scheduler = Scheduler::new(
        ctx,
        JitterTicker::new(args.interval, args.delay),
        args.api_timeout,
        shutdown.clone(),
    );

    scheduler.synchronize().await;

    let events = Subscriber::new(args.subscriber_config())
        .subscribe(shutdown.clone())
        .await?;

    scheduler.run(events).await;
    log::info!("shut down");

    Ok(())
}
