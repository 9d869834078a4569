//! Delivery URL resolution for guest documents, plus the request parsing and
//! outer CSP the proxy endpoint applies on the other end.

use async_trait::async_trait;
use url::Url;

use crate::error::{BridgeError, Result};
use crate::types::CspMetadata;

pub const PROXY_PATH: &str = "mcp-app-proxy";

const SECRET_PARAM: &str = "secret";
const CONNECT_DOMAINS_PARAM: &str = "connect_domains";
const RESOURCE_DOMAINS_PARAM: &str = "resource_domains";
const FRAME_DOMAINS_PARAM: &str = "frame_domains";
const BASE_URI_DOMAINS_PARAM: &str = "base_uri_domains";

/// Where the local proxy listens and the secret it expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub endpoint: String,
    pub secret: String,
}

#[async_trait]
pub trait ConnectionInfoProvider: Send + Sync {
    async fn connection_info(&self) -> anyhow::Result<ConnectionInfo>;
}

/// Fixed connection info, for hosts that already know their proxy.
#[derive(Debug, Clone)]
pub struct StaticConnectionInfo(pub ConnectionInfo);

#[async_trait]
impl ConnectionInfoProvider for StaticConnectionInfo {
    async fn connection_info(&self) -> anyhow::Result<ConnectionInfo> {
        Ok(self.0.clone())
    }
}

pub struct ProxyResolver<P> {
    provider: P,
}

impl<P: ConnectionInfoProvider> ProxyResolver<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    /// Returns `None` when the proxy cannot be reached; the resource must then
    /// not be rendered.
    pub async fn resolve(&self, csp: Option<&CspMetadata>) -> Option<Url> {
        let info = match self.provider.connection_info().await {
            Ok(info) => info,
            Err(err) => {
                tracing::warn!(error = %err, "MCP app proxy connection info unavailable");
                return None;
            }
        };
        match build_proxy_url(&info, csp) {
            Ok(url) => Some(url),
            Err(err) => {
                tracing::warn!(error = %err, endpoint = %info.endpoint, "Failed to build MCP app proxy URL");
                None
            }
        }
    }
}

pub fn build_proxy_url(info: &ConnectionInfo, csp: Option<&CspMetadata>) -> Result<Url> {
    if info.endpoint.trim().is_empty() {
        return Err(BridgeError::ProxyUnavailable("empty endpoint".to_string()));
    }
    if info.secret.is_empty() {
        return Err(BridgeError::ProxyUnavailable("empty secret".to_string()));
    }

    let base = info.endpoint.trim().trim_end_matches('/');
    let mut url = Url::parse(&format!("{base}/{PROXY_PATH}"))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair(SECRET_PARAM, &info.secret);
        if let Some(csp) = csp {
            for (key, domains) in [
                (CONNECT_DOMAINS_PARAM, &csp.connect_domains),
                (RESOURCE_DOMAINS_PARAM, &csp.resource_domains),
                (FRAME_DOMAINS_PARAM, &csp.frame_domains),
                (BASE_URI_DOMAINS_PARAM, &csp.base_uri_domains),
            ] {
                if let Some(domains) = domains.as_ref().filter(|domains| !domains.is_empty()) {
                    query.append_pair(key, &domains.join(","));
                }
            }
        }
    }
    Ok(url)
}

/// A request arriving at the proxy endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyRequest {
    pub secret: String,
    pub connect_domains: Vec<String>,
    pub resource_domains: Vec<String>,
    pub frame_domains: Vec<String>,
    pub base_uri_domains: Vec<String>,
}

impl ProxyRequest {
    pub fn from_url(url: &Url) -> Self {
        let mut request = Self::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                SECRET_PARAM => request.secret = value.into_owned(),
                CONNECT_DOMAINS_PARAM => request.connect_domains = parse_domains(&value),
                RESOURCE_DOMAINS_PARAM => request.resource_domains = parse_domains(&value),
                FRAME_DOMAINS_PARAM => request.frame_domains = parse_domains(&value),
                BASE_URI_DOMAINS_PARAM => request.base_uri_domains = parse_domains(&value),
                _ => {}
            }
        }
        request
    }

    pub fn authorize(&self, secret: &str) -> Result<()> {
        if secret.is_empty() || self.secret != secret {
            return Err(BridgeError::Unauthorized);
        }
        Ok(())
    }

    /// Content-Security-Policy for the outer sandbox page. It is the ceiling
    /// for whatever the inner guest document declares.
    pub fn outer_csp(&self) -> String {
        let resources = source_list(&self.resource_domains);
        let connections = source_list(&self.connect_domains);
        let frames = source_list(&self.frame_domains);
        let base_uris = source_list(&self.base_uri_domains);

        format!(
            "default-src 'none'; \
             script-src 'self' 'unsafe-inline'{resources}; \
             script-src-elem 'self' 'unsafe-inline'{resources}; \
             style-src 'self' 'unsafe-inline'{resources}; \
             style-src-elem 'self' 'unsafe-inline'{resources}; \
             connect-src 'self'{connections}; \
             img-src 'self' data: blob:{resources}; \
             font-src 'self'{resources}; \
             media-src 'self' data: blob:{resources}; \
             frame-src blob: data:{frames}; \
             object-src 'none'; \
             base-uri 'self'{base_uris}"
        )
    }
}

fn source_list(domains: &[String]) -> String {
    if domains.is_empty() {
        String::new()
    } else {
        format!(" {}", domains.join(" "))
    }
}

fn parse_domains(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|domain| !domain.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Unavailable;

    #[async_trait]
    impl ConnectionInfoProvider for Unavailable {
        async fn connection_info(&self) -> anyhow::Result<ConnectionInfo> {
            Err(anyhow::anyhow!("server not started"))
        }
    }

    fn info() -> ConnectionInfo {
        ConnectionInfo {
            endpoint: "http://127.0.0.1:3000/".to_string(),
            secret: "s3cret".to_string(),
        }
    }

    fn query_value(url: &Url, key: &str) -> Option<String> {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    #[test]
    fn url_carries_secret_and_only_non_empty_lists() -> anyhow::Result<()> {
        let csp = CspMetadata {
            connect_domains: Some(vec!["https://api.example.com".to_string()]),
            resource_domains: Some(vec![
                "https://cdn.example.com".to_string(),
                "https://fonts.example.com".to_string(),
            ]),
            frame_domains: Some(Vec::new()),
            base_uri_domains: None,
        };
        let url = build_proxy_url(&info(), Some(&csp))?;

        assert_eq!(url.path(), "/mcp-app-proxy");
        assert_eq!(query_value(&url, "secret").as_deref(), Some("s3cret"));
        assert_eq!(
            query_value(&url, "connect_domains").as_deref(),
            Some("https://api.example.com")
        );
        assert_eq!(
            query_value(&url, "resource_domains").as_deref(),
            Some("https://cdn.example.com,https://fonts.example.com")
        );
        assert!(query_value(&url, "frame_domains").is_none());
        assert!(query_value(&url, "base_uri_domains").is_none());
        Ok(())
    }

    #[test]
    fn invalid_endpoint_is_an_error() {
        let result = build_proxy_url(
            &ConnectionInfo {
                endpoint: "not a url".to_string(),
                secret: "s3cret".to_string(),
            },
            None,
        );
        assert!(matches!(result, Err(BridgeError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn resolver_returns_none_when_provider_fails() {
        let resolver = ProxyResolver::new(Unavailable);
        assert!(resolver.resolve(None).await.is_none());
    }

    #[tokio::test]
    async fn resolver_builds_url_from_static_info() {
        let resolver = ProxyResolver::new(StaticConnectionInfo(info()));
        let url = resolver.resolve(None).await;
        assert_eq!(
            url.as_ref().map(Url::as_str),
            Some("http://127.0.0.1:3000/mcp-app-proxy?secret=s3cret")
        );
    }

    #[test]
    fn proxy_request_round_trips_through_delivery_url() -> anyhow::Result<()> {
        let csp = CspMetadata {
            connect_domains: Some(vec!["wss://live.example.com".to_string()]),
            resource_domains: None,
            frame_domains: Some(vec!["https://embed.example.com".to_string()]),
            base_uri_domains: None,
        };
        let url = build_proxy_url(&info(), Some(&csp))?;
        let request = ProxyRequest::from_url(&url);

        assert!(request.authorize("s3cret").is_ok());
        assert!(matches!(
            request.authorize("other"),
            Err(BridgeError::Unauthorized)
        ));
        assert_eq!(request.connect_domains, vec!["wss://live.example.com"]);
        assert_eq!(request.frame_domains, vec!["https://embed.example.com"]);
        assert!(request.resource_domains.is_empty());
        Ok(())
    }

    #[test]
    fn domain_lists_are_trimmed_and_empties_dropped() -> anyhow::Result<()> {
        let url = Url::parse(
            "http://127.0.0.1:3000/mcp-app-proxy?secret=x&resource_domains=%20a.com,,b.com%20,",
        )?;
        let request = ProxyRequest::from_url(&url);
        assert_eq!(request.resource_domains, vec!["a.com", "b.com"]);
        Ok(())
    }

    #[test]
    fn outer_csp_extends_directives_with_domains() {
        let request = ProxyRequest {
            secret: "x".to_string(),
            connect_domains: vec!["https://api.example.com".to_string()],
            resource_domains: vec!["https://cdn.example.com".to_string()],
            frame_domains: Vec::new(),
            base_uri_domains: vec!["https://docs.example.com".to_string()],
        };
        let csp = request.outer_csp();

        assert!(csp.starts_with("default-src 'none';"));
        assert!(csp.contains("connect-src 'self' https://api.example.com;"));
        assert!(csp.contains("img-src 'self' data: blob: https://cdn.example.com;"));
        assert!(csp.contains("frame-src blob: data:;"));
        assert!(csp.ends_with("base-uri 'self' https://docs.example.com"));
    }
}
