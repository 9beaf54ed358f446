use crate::{portforward::Family, wg::ParseError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("wireguard interface {iface} unavailable: {reason}")]
    InterfaceUnavailable { iface: String, reason: String },

    #[error("{family} nat chain {chain} does not exist")]
    MissingChain { family: Family, chain: String },

    #[error("ipset {0} does not exist")]
    MissingIpset(String),

    #[error("firewall check failed: {0}")]
    Firewall(String),

    #[error("{program} failed with {code:?}: {stderr}")]
    CommandFail {
        program: &'static str,
        code: Option<i32>,
        stderr: String,
    },

    #[error("parse error: {0}")]
    ParseError(#[from] ParseError),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("http error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("metrics exporter error: {0}")]
    MetricsError(#[from] metrics_exporter_prometheus::BuildError),
}
