use std::time::Duration;

use metrics::counter;
use serde_json::Value;

use crate::error::Error;

use super::{Peer, PeerSource};

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub hostname: String,
    pub timeout: Duration,
}

/// Control plane client, authenticating with basic auth.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    config: ApiConfig,
}

impl ApiClient {
    pub fn new(config: ApiConfig) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("wg-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.config.url.trim_end_matches('/'))
    }
}

/// Decodes each record on its own so one malformed peer does not discard the
/// whole list.
fn decode_peers(records: Vec<Value>) -> Vec<Peer> {
    records
        .into_iter()
        .filter_map(|record| match serde_json::from_value::<Peer>(record) {
            Ok(peer) => Some(peer),
            Err(err) => {
                log::warn!("skipping malformed peer record: {err}");
                counter!("api.invalid_peers").increment(1);
                None
            }
        })
        .collect()
}

impl PeerSource for ApiClient {
    type Error = Error;

    async fn get_peers(&self) -> Result<Vec<Peer>, Self::Error> {
        let records: Vec<Value> = self
            .client
            .get(self.endpoint("wireguard-peers"))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(decode_peers(records))
    }

    async fn post_connections(&self, keys: &[String]) -> Result<(), Self::Error> {
        self.client
            .post(self.endpoint("wireguard-connections"))
            .query(&[("hostname", &self.config.hostname)])
            .basic_auth(&self.config.username, Some(&self.config.password))
            .json(keys)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }
}
