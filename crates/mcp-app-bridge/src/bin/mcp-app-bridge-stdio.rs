use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use clap::Parser;
use mcp_app_bridge::{
    AppResource, BridgeConfig, CspMetadata, GuestChannel, HostContext, LineTransport,
    PassthroughDispatcher, ProxyResolver, ResourceSession, SessionOptions, Theme,
    wire_log::WireLog,
};
use serde_json::{Value, json};

/// Runs one MCP App guest session over newline-delimited JSON on stdin/stdout.
#[derive(Parser, Debug)]
struct Args {
    /// HTML document served to the guest.
    #[arg(long)]
    resource: PathBuf,

    #[arg(long, default_value = "ui://stdio/app")]
    uri: String,

    /// Host theme reported at initialization.
    #[arg(long, default_value = "light")]
    theme: Theme,

    /// Domains the guest may connect to (repeatable).
    #[arg(long = "connect-domain")]
    connect_domains: Vec<String>,

    /// Domains the guest may load scripts, styles and media from (repeatable).
    #[arg(long = "resource-domain")]
    resource_domains: Vec<String>,

    /// JSONL wire log path. Overrides MCP_APP_BRIDGE_WIRE_LOG.
    #[arg(long)]
    wire_log: Option<PathBuf>,
}

/// Backend stand-in: answers `ping`, rejects everything else.
struct PingBackend;

#[async_trait]
impl PassthroughDispatcher for PingBackend {
    async fn dispatch(&self, method: &str, _params: Option<Value>) -> Result<Value> {
        match method {
            "ping" => Ok(json!({})),
            other => Err(anyhow!("no backend for {other}")),
        }
    }
}

fn non_empty(domains: Vec<String>) -> Option<Vec<String>> {
    if domains.is_empty() {
        None
    } else {
        Some(domains)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = BridgeConfig::from_env().context("load bridge config")?;

    let html = tokio::fs::read_to_string(&args.resource)
        .await
        .with_context(|| format!("read resource {}", args.resource.display()))?;
    let csp = CspMetadata {
        connect_domains: non_empty(args.connect_domains),
        resource_domains: non_empty(args.resource_domains),
        ..CspMetadata::default()
    };
    let resource = AppResource::new(args.uri, html).with_csp(csp);
    let host_context = HostContext {
        theme: args.theme,
        ..HostContext::default()
    };
    let options = SessionOptions::from(&config);
    let dispatcher: Arc<dyn PassthroughDispatcher> = Arc::new(PingBackend);

    let session = if config.proxy_endpoint.is_some() {
        let resolver = ProxyResolver::new(config.clone());
        ResourceSession::prepare(&resolver, resource, host_context, dispatcher, options)
            .await
            .ok_or_else(|| anyhow!("MCP app proxy unavailable; refusing to render"))?
    } else {
        ResourceSession::new(resource, host_context, dispatcher, options)
    };
    if let Some(url) = session.proxy_url() {
        tracing::info!(%url, "Resolved guest delivery URL");
    }

    let (channel, outbound) = GuestChannel::new("stdio");
    let channel = match args.wire_log.or(config.wire_log) {
        Some(path) => {
            let wire_log = WireLog::new();
            wire_log.set_path(path);
            channel.with_wire_log(wire_log)
        }
        None => channel,
    };

    let (handle, mut task) = session.spawn(channel)?;
    let transport = LineTransport::connect_with_io(
        Box::new(tokio::io::stdin()),
        Box::new(tokio::io::stdout()),
        handle.clone(),
        outbound,
    );

    let session = tokio::select! {
        joined = &mut task => joined?,
        _ = tokio::signal::ctrl_c() => {
            let _ = handle.detach(Some("interrupted".to_string()));
            task.await?
        }
    };
    drop(handle);
    transport.shutdown().await?;

    tracing::info!(
        uri = %session.resource().uri,
        state = session.state().label(),
        "MCP app bridge session finished"
    );
    Ok(())
}
