use std::{env, path::PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::proxy::{ConnectionInfo, ConnectionInfoProvider};
use crate::types::{HostInfo, PROTOCOL_VERSION};

pub const HOST_NAME_ENV: &str = "MCP_APP_BRIDGE_HOST_NAME";
pub const HOST_VERSION_ENV: &str = "MCP_APP_BRIDGE_HOST_VERSION";
pub const PROTOCOL_VERSION_ENV: &str = "MCP_APP_BRIDGE_PROTOCOL_VERSION";
pub const PROXY_ENDPOINT_ENV: &str = "MCP_APP_BRIDGE_PROXY_ENDPOINT";
pub const PROXY_SECRET_ENV: &str = "MCP_APP_BRIDGE_PROXY_SECRET";
pub const WIRE_LOG_ENV: &str = "MCP_APP_BRIDGE_WIRE_LOG";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeConfig {
    pub host_name: String,
    pub host_version: String,
    pub protocol_version: String,
    pub proxy_endpoint: Option<Url>,
    pub proxy_secret: Option<String>,
    pub wire_log: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host_name: "Host".to_string(),
            host_version: "1.0.0".to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            proxy_endpoint: None,
            proxy_secret: None,
            wire_log: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    EmptyValue(&'static str),
    #[error("invalid MCP_APP_BRIDGE_PROXY_ENDPOINT: {0}")]
    InvalidProxyEndpoint(String),
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host_name = parse_with_lookup(&lookup, HOST_NAME_ENV, defaults.host_name, |raw| {
            non_empty(HOST_NAME_ENV, raw)
        })?;
        let host_version =
            parse_with_lookup(&lookup, HOST_VERSION_ENV, defaults.host_version, |raw| {
                non_empty(HOST_VERSION_ENV, raw)
            })?;
        let protocol_version = parse_with_lookup(
            &lookup,
            PROTOCOL_VERSION_ENV,
            defaults.protocol_version,
            |raw| non_empty(PROTOCOL_VERSION_ENV, raw),
        )?;
        let proxy_endpoint = parse_with_lookup(&lookup, PROXY_ENDPOINT_ENV, None, |raw| {
            let raw = non_empty(PROXY_ENDPOINT_ENV, raw)?;
            Url::parse(&raw)
                .map(Some)
                .map_err(|error| ConfigError::InvalidProxyEndpoint(error.to_string()))
        })?;
        let proxy_secret = parse_with_lookup(&lookup, PROXY_SECRET_ENV, None, |raw| {
            non_empty(PROXY_SECRET_ENV, raw).map(Some)
        })?;
        let wire_log = parse_with_lookup(&lookup, WIRE_LOG_ENV, None, |raw| {
            non_empty(WIRE_LOG_ENV, raw).map(|path| Some(PathBuf::from(path)))
        })?;

        Ok(Self {
            host_name,
            host_version,
            protocol_version,
            proxy_endpoint,
            proxy_secret,
            wire_log,
        })
    }

    pub fn host_info(&self) -> HostInfo {
        HostInfo {
            name: self.host_name.clone(),
            version: self.host_version.clone(),
        }
    }
}

#[async_trait]
impl ConnectionInfoProvider for BridgeConfig {
    async fn connection_info(&self) -> anyhow::Result<ConnectionInfo> {
        let endpoint = self
            .proxy_endpoint
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("{PROXY_ENDPOINT_ENV} is not set"))?;
        let secret = self
            .proxy_secret
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("{PROXY_SECRET_ENV} is not set"))?;
        Ok(ConnectionInfo {
            endpoint: endpoint.to_string(),
            secret: secret.clone(),
        })
    }
}

fn parse_with_lookup<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    parser: impl FnOnce(String) -> Result<T, ConfigError>,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => parser(raw),
        None => Ok(default),
    }
}

fn non_empty(key: &'static str, raw: String) -> Result<String, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::EmptyValue(key));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_values(values: &HashMap<&str, &str>) -> Result<BridgeConfig, ConfigError> {
        BridgeConfig::from_lookup(|key| values.get(key).map(ToString::to_string))
    }

    #[test]
    fn defaults_apply_without_env() -> anyhow::Result<()> {
        let config = from_values(&HashMap::new())?;
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(
            config.host_info(),
            HostInfo {
                name: "Host".to_string(),
                version: "1.0.0".to_string()
            }
        );
        assert_eq!(config.protocol_version, "2025-06-18");
        Ok(())
    }

    #[test]
    fn env_overrides_are_applied() -> anyhow::Result<()> {
        let values = HashMap::from([
            (HOST_NAME_ENV, "Desk"),
            (HOST_VERSION_ENV, " 2.1.0 "),
            (PROXY_ENDPOINT_ENV, "http://127.0.0.1:3000"),
            (PROXY_SECRET_ENV, "s3cret"),
            (WIRE_LOG_ENV, "/tmp/bridge.jsonl"),
        ]);
        let config = from_values(&values)?;
        assert_eq!(config.host_name, "Desk");
        assert_eq!(config.host_version, "2.1.0");
        assert_eq!(
            config.proxy_endpoint.as_ref().map(Url::as_str),
            Some("http://127.0.0.1:3000/")
        );
        assert_eq!(config.proxy_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.wire_log, Some(PathBuf::from("/tmp/bridge.jsonl")));
        Ok(())
    }

    #[test]
    fn blank_values_are_rejected() {
        let values = HashMap::from([(HOST_NAME_ENV, "   ")]);
        assert_eq!(
            from_values(&values),
            Err(ConfigError::EmptyValue(HOST_NAME_ENV))
        );
    }

    #[test]
    fn unparsable_proxy_endpoint_is_rejected() {
        let values = HashMap::from([(PROXY_ENDPOINT_ENV, "localhost without scheme")]);
        assert!(matches!(
            from_values(&values),
            Err(ConfigError::InvalidProxyEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn connection_info_requires_endpoint_and_secret() -> anyhow::Result<()> {
        let mut config = BridgeConfig::default();
        assert!(config.connection_info().await.is_err());

        config.proxy_endpoint = Some(Url::parse("http://127.0.0.1:3000")?);
        assert!(config.connection_info().await.is_err());

        config.proxy_secret = Some("s3cret".to_string());
        let info = config.connection_info().await?;
        assert_eq!(info.endpoint, "http://127.0.0.1:3000/");
        assert_eq!(info.secret, "s3cret");
        Ok(())
    }
}
