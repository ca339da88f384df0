//! nsqlookupd discovery.

use crate::queue::QueueError;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::BTreeSet;
use url::Url;

#[derive(Debug, Deserialize)]
struct Producer {
    broadcast_address: String,
    tcp_port: u16,
}

#[derive(Debug, Default, Deserialize)]
struct Producers {
    #[serde(default)]
    producers: Vec<Producer>,
}

/// Newer nsqlookupd returns the producers at the top level, older releases
/// wrap them in `data`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LookupResponse {
    Wrapped { data: Producers },
    Flat(Producers),
}

impl LookupResponse {
    fn into_producers(self) -> Vec<Producer> {
        match self {
            Self::Wrapped { data } | Self::Flat(data) => data.producers,
        }
    }
}

/// Client for one or more nsqlookupd instances.
#[derive(Debug, Clone)]
pub struct Lookup {
    http: reqwest::Client,
    addresses: Vec<String>,
}

impl Lookup {
    pub fn new(http: reqwest::Client, addresses: Vec<String>) -> Self {
        let addresses = addresses
            .into_iter()
            .map(|a| a.trim_end_matches('/').to_string())
            .collect();
        Self { http, addresses }
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Returns the `host:port` of every nsqd producing `topic`.
    ///
    /// A 404 from nsqlookupd means the topic does not exist yet and yields no
    /// producers. Failing instances are skipped as long as one answers.
    ///
    /// # Errors
    ///
    /// Returns the last error when no instance could be queried.
    pub async fn producers(&self, topic: &str) -> Result<BTreeSet<String>, QueueError> {
        let mut found = BTreeSet::new();
        let mut last_error = None;
        let mut answered = false;

        for address in &self.addresses {
            match self.query(address, topic).await {
                Ok(producers) => {
                    answered = true;
                    found.extend(
                        producers
                            .into_iter()
                            .map(|p| format!("{}:{}", p.broadcast_address, p.tcp_port)),
                    );
                },
                Err(e) => {
                    tracing::warn!(lookupd = %address, error = %e, "lookup failed");
                    last_error = Some(e);
                },
            }
        }

        match last_error {
            Some(e) if !answered => Err(e),
            _ => Ok(found),
        }
    }

    async fn query(&self, address: &str, topic: &str) -> Result<Vec<Producer>, QueueError> {
        let url = Url::parse_with_params(&format!("{address}/lookup"), [("topic", topic)])
            .map_err(|e| {
                QueueError::Protocol(format!("invalid lookupd address '{address}': {e}"))
            })?;
        let response = self.http.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let body: LookupResponse = response.error_for_status()?.json().await?;
        Ok(body.into_producers())
    }
}
