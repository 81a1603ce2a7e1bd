use super::{Probe, ProbeOutcome};
use crate::address::AddressKey;
use crate::input::HttpSettings;
use async_trait::async_trait;
use log::debug;
use reqwest::header::HeaderMap;
use reqwest::redirect::Policy;
use reqwest::{Client, StatusCode, Url};
use std::time::Instant;

/// Status codes accepted when no expected status is configured.
const ACCEPTED_STATUS: [u16; 3] = [200, 301, 302];

/// Header carrying the request id and, after its last `-`, the location tag.
const RAY_HEADER: &str = "cf-ray";

/// Times one `HEAD` request sent to the target and reports which edge location
/// answered it.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    settings: HttpSettings,
}

impl HttpProbe {
    pub const fn new(settings: HttpSettings) -> Self {
        Self { settings }
    }

    /// The configured URL pointed at the target port. IP-literal hosts are
    /// replaced by the target address.
    fn request_url(&self, target: &AddressKey) -> Option<Url> {
        let mut url = self.settings.url.clone();
        if url.domain().is_none() {
            url.set_ip_host(target.ip()).ok()?;
        }
        url.set_port(Some(target.port())).ok()?;
        Some(url)
    }

    /// A client whose resolver maps the URL's domain to the target.
    fn client(&self, target: &AddressKey) -> reqwest::Result<Client> {
        let mut builder = Client::builder()
            .timeout(self.settings.timeout)
            .redirect(Policy::none())
            .danger_accept_invalid_certs(true)
            .no_proxy();

        if let Some(domain) = self.settings.url.domain() {
            builder = builder.resolve(domain, target.socket_addr());
        }
        builder.build()
    }

    fn accepts(&self, status: StatusCode) -> bool {
        self.settings.expected_status.map_or_else(
            || ACCEPTED_STATUS.contains(&status.as_u16()),
            |expected| status.as_u16() == expected,
        )
    }

    fn wanted_location(&self, location: Option<&str>) -> bool {
        if self.settings.locations.is_empty() {
            return true;
        }
        location.is_some_and(|location| {
            self.settings
                .locations
                .iter()
                .any(|wanted| wanted.eq_ignore_ascii_case(location))
        })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, target: &AddressKey) -> ProbeOutcome {
        let Some(url) = self.request_url(target) else {
            debug!("Cannot point {} at {target}", self.settings.url);
            return ProbeOutcome::failed();
        };
        let client = match self.client(target) {
            Ok(client) => client,
            Err(e) => {
                debug!("Could not build HTTP client for {target}: {e}");
                return ProbeOutcome::failed();
            }
        };

        let start = Instant::now();
        let response = match client.head(url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("HTTP probe of {target} failed: {e}");
                return ProbeOutcome::failed();
            }
        };
        let elapsed = start.elapsed();

        if !self.accepts(response.status()) {
            debug!("{target} answered with status {}", response.status());
            return ProbeOutcome::failed();
        }

        let location = location_tag(response.headers());
        if !self.wanted_location(location.as_deref()) {
            debug!("{target} answered from unwanted location {location:?}");
            return ProbeOutcome::failed();
        }

        ProbeOutcome::reached(elapsed).with_location(location)
    }
}

/// Location tag of a response: the uppercased suffix after the last `-` of
/// its `cf-ray` header.
pub fn location_tag(headers: &HeaderMap) -> Option<String> {
    let ray = headers.get(RAY_HEADER)?.to_str().ok()?;
    let (_, tag) = ray.rsplit_once('-')?;
    let tag = tag.trim();
    (!tag.is_empty()).then(|| tag.to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const SJC_OK: &str = "HTTP/1.1 200 OK\r\ncf-ray: 8a1b2c3d4e5f6a7b-SJC\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
    const UNAVAILABLE: &str =
        "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";

    /// Answers a single request with `response`.
    async fn serve_once(response: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = stream.shutdown().await;
        });

        addr
    }

    fn probe(locations: &[&str], expected_status: Option<u16>) -> HttpProbe {
        HttpProbe::new(HttpSettings {
            url: Url::parse("http://edge.example.test/cdn-cgi/trace").unwrap(),
            expected_status,
            locations: locations.iter().map(|&l| l.to_owned()).collect(),
            timeout: Duration::from_millis(1500),
        })
    }

    #[tokio::test]
    async fn head_request_reports_location() {
        let target = AddressKey::from(serve_once(SJC_OK).await);

        let outcome = probe(&[], None).probe(&target).await;

        assert!(outcome.success);
        assert_eq!(outcome.location.as_deref(), Some("SJC"));
    }

    #[tokio::test]
    async fn unexpected_status_fails() {
        let target = AddressKey::from(serve_once(UNAVAILABLE).await);

        let outcome = probe(&[], None).probe(&target).await;

        assert_eq!(outcome, ProbeOutcome::failed());
    }

    #[tokio::test]
    async fn configured_status_is_required() {
        let target = AddressKey::from(serve_once(SJC_OK).await);

        let outcome = probe(&[], Some(204)).probe(&target).await;

        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn unwanted_location_fails() {
        let target = AddressKey::from(serve_once(SJC_OK).await);

        let outcome = probe(&["LAX", "FRA"], None).probe(&target).await;

        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn wanted_location_is_case_insensitive() {
        let target = AddressKey::from(serve_once(SJC_OK).await);

        let outcome = probe(&["sjc"], None).probe(&target).await;

        assert!(outcome.success);
    }

    #[test]
    fn ip_literal_host_is_replaced() {
        let probe = HttpProbe::new(HttpSettings {
            url: Url::parse("https://1.1.1.1/cdn-cgi/trace").unwrap(),
            ..HttpSettings::default()
        });
        let target = AddressKey::from("1.0.0.1:2053".parse::<SocketAddr>().unwrap());

        let url = probe.request_url(&target).unwrap();

        assert_eq!(url.as_str(), "https://1.0.0.1:2053/cdn-cgi/trace");
    }

    #[test]
    fn location_from_ray_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(location_tag(&headers), None);

        headers.insert(RAY_HEADER, HeaderValue::from_static("7bd32409eda7b020-sjc"));
        assert_eq!(location_tag(&headers).as_deref(), Some("SJC"));

        headers.insert(RAY_HEADER, HeaderValue::from_static("7bd32409eda7b020"));
        assert_eq!(location_tag(&headers), None);
    }
}
