use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use crate::config::AppConfig;
use crate::error::Result;
use crate::types::Exchange;

/// A single reachability check against one exchange.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, exchange: Exchange) -> bool;
}

/// General network health, independent of any exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetworkReport {
    pub dns_resolution: bool,
    /// At least one internet host accepted a TCP connection.
    pub internet: bool,
}

/// Issues an HTTP `HEAD` against the exchange's API host. Any answer below 500
/// counts as reachable: the host resolved, accepted a connection and replied.
pub struct HttpProbe {
    client: reqwest::Client,
    timeout: Duration,
    targets: HashMap<Exchange, String>,
    dns_check_host: Option<String>,
    internet_hosts: Vec<String>,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(HttpProbe {
            client,
            timeout,
            targets: HashMap::new(),
            dns_check_host: None,
            internet_hosts: Vec::new(),
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let connectivity = &config.connectivity;
        let probe = HttpProbe::new(connectivity.timeout())?.with_internet_checks(
            connectivity.dns_check_host.clone(),
            connectivity.internet_hosts.clone(),
        );
        Ok(config.active_exchanges()
            .into_iter()
            .fold(probe, |probe, exchange| {
                let url = config.exchange(exchange).base_url(exchange);
                probe.with_target(exchange, url)
            }))
    }

    pub fn with_target(mut self, exchange: Exchange, url: impl Into<String>) -> Self {
        self.targets.insert(exchange, url.into());
        self
    }

    /// `dns_host` is resolved and each of `internet_hosts` (`host:port`) is
    /// dialled until one answers.
    pub fn with_internet_checks(mut self, dns_host: impl Into<String>, internet_hosts: Vec<String>) -> Self {
        self.dns_check_host = Some(dns_host.into());
        self.internet_hosts = internet_hosts;
        self
    }

    /// Tell a machine without network access apart from an exchange that is
    /// down. Without a resolver the internet counts as unreachable.
    pub async fn network_report(&self) -> NetworkReport {
        let dns_resolution = match &self.dns_check_host {
            Some(host) => self.resolves(host).await,
            None => true,
        };

        let mut internet = false;
        if dns_resolution {
            for host in &self.internet_hosts {
                if self.dials(host).await {
                    internet = true;
                    break;
                }
            }
        }

        if !internet {
            tracing::warn!("No internet access (dns resolution: {})", dns_resolution);
        }
        NetworkReport { dns_resolution, internet }
    }

    async fn resolves(&self, host: &str) -> bool {
        match timeout(self.timeout, lookup_host((host, 443))).await {
            Ok(Ok(mut addrs)) => addrs.next().is_some(),
            Ok(Err(e)) => {
                tracing::debug!("Resolving {} failed: {}", host, e);
                false
            }
            Err(_) => false,
        }
    }

    async fn dials(&self, host: &str) -> bool {
        matches!(timeout(self.timeout, TcpStream::connect(host)).await, Ok(Ok(_)))
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, exchange: Exchange) -> bool {
        let url = match self.targets.get(&exchange) {
            Some(url) => url.as_str(),
            None => exchange.default_base_url(),
        };

        match self.client.head(url).send().await {
            Ok(response) => response.status().as_u16() < 500,
            Err(e) => {
                tracing::debug!("Probe of {} ({}) failed: {}", exchange, url, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn probe() -> HttpProbe {
        HttpProbe::new(Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn head_below_500_is_reachable() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let probe = probe().with_target(Exchange::Bybit, server.uri());
        assert!(probe.probe(Exchange::Bybit).await);
        assert!(!probe.probe(Exchange::Bybit).await);

        let closed = self::probe().with_target(Exchange::Binance, "http://127.0.0.1:1");
        assert!(!closed.probe(Exchange::Binance).await);
    }

    #[tokio::test]
    async fn network_report_separates_dns_from_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().to_string();

        let online = probe().with_internet_checks("localhost", vec!["127.0.0.1:1".to_string(), open.clone()]);
        assert_eq!(
            online.network_report().await,
            NetworkReport { dns_resolution: true, internet: true }
        );

        let offline = probe().with_internet_checks("localhost", vec!["127.0.0.1:1".to_string()]);
        assert_eq!(
            offline.network_report().await,
            NetworkReport { dns_resolution: true, internet: false }
        );

        let no_resolver = probe().with_internet_checks("candle-ingest.invalid", vec![open]);
        let report = no_resolver.network_report().await;
        assert!(!report.dns_resolution);
        assert!(!report.internet);
    }
}
