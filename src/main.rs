//! RenderGate server binary

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use rendergate::config::{parse_origin, GatewayConfig};
use rendergate::render::Renderer;
use rendergate::tracing_middleware::{init_tracing, LogFormat};
use rendergate::{
    build_router, AppState, CircuitBreaker, DecisionGate, HttpOriginProxy, Orchestrator,
    OriginConfig, RenderManager, ShutdownController, SwrCache,
};

/// Bot-aware prerender gateway
#[derive(Parser, Debug)]
#[command(name = "rendergate")]
#[command(version)]
#[command(about = "RenderGate - serves headless-browser snapshots to crawlers")]
#[command(long_about = r#"RenderGate - serves headless-browser snapshots to crawlers

Sits in front of a single-page application. Humans are proxied to the
origin untouched; crawlers receive fully rendered HTML produced by a
pool of headless Chromium pages, cached with stale-while-revalidate and
guarded by a circuit breaker that falls back to the origin.

Every flag can also be set through its RG_* environment variable.

EXAMPLES:
  # Front an app running on port 3000
  rendergate --origin http://127.0.0.1:3000

  # More render slots, one-hour cache, verbose logs
  rendergate --origin http://app:3000 --max-renders 8 --cache-ttl 3600 -v

  # Debug a single page
  curl -A Googlebot 'http://localhost:8080/about?render=debug'
"#)]
struct Args {
    /// Origin application base URL
    #[arg(long, env = "RG_ORIGIN")]
    origin: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "RG_PORT")]
    port: Option<u16>,

    /// Host to bind to
    #[arg(short = 'H', long, env = "RG_HOST")]
    host: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Path to Chrome/Chromium executable
    #[arg(long, env = "RG_CHROME_PATH")]
    chrome_path: Option<PathBuf>,

    /// Concurrent renders (page pool size)
    #[arg(long, env = "RG_MAX_RENDERS")]
    max_renders: Option<usize>,

    /// Cache TTL in seconds
    #[arg(long, env = "RG_CACHE_TTL")]
    cache_ttl: Option<u64>,

    /// Run Chrome with a visible window
    #[arg(long)]
    headful: bool,

    /// Disable the Chrome sandbox
    #[arg(long)]
    no_sandbox: bool,
}

impl Args {
    fn apply(self, mut config: GatewayConfig) -> Result<GatewayConfig> {
        if let Some(origin) = self.origin {
            config = config.with_origin(parse_origin(&origin)?);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(path) = self.chrome_path {
            config.chrome_path = Some(path);
        }
        if let Some(max) = self.max_renders {
            config = config.with_max_renders(max);
        }
        if let Some(ttl) = self.cache_ttl {
            config = config.with_cache_ttl(Duration::from_secs(ttl));
        }
        if self.headful {
            config.headless = false;
        }
        if self.no_sandbox {
            config.no_sandbox = true;
        }
        config.validate()?;
        Ok(config)
    }
}

#[cfg(feature = "chromium")]
async fn launch_renderer(config: &GatewayConfig) -> Result<Arc<dyn Renderer>> {
    use rendergate::render::{ChromiumConfig, ChromiumRenderer};

    let chromium = ChromiumConfig {
        chrome_path: config.chrome_path.clone(),
        headless: config.headless,
        no_sandbox: config.no_sandbox,
        ..ChromiumConfig::default()
    };
    let renderer = ChromiumRenderer::launch(chromium)
        .await
        .context("failed to launch Chromium")?;
    Ok(Arc::new(renderer))
}

#[cfg(not(feature = "chromium"))]
async fn launch_renderer(_config: &GatewayConfig) -> Result<Arc<dyn Renderer>> {
    anyhow::bail!("built without the `chromium` feature; no renderer available")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(LogFormat::from_env(), args.verbose);

    let config = args.apply(GatewayConfig::from_env()?)?;
    info!(
        version = rendergate::VERSION,
        origin = %config.origin,
        listen = %config.listen_addr(),
        max_renders = config.render.max_concurrency,
        cache_ttl_secs = config.cache.default_ttl.as_secs(),
        "RenderGate starting"
    );

    let renderer = launch_renderer(&config).await?;
    let render_manager = Arc::new(RenderManager::new(renderer, config.render.clone()));

    let cache = Arc::new(SwrCache::new(config.cache.clone()));
    let cleanup = Arc::clone(&cache).start_cleanup_task();

    let origin = HttpOriginProxy::new(OriginConfig::new(config.origin.clone()))
        .context("failed to build origin client")?;

    let orchestrator = Orchestrator::new(
        DecisionGate::new(config.gate.clone()),
        cache,
        Arc::clone(&render_manager),
        Arc::new(CircuitBreaker::new("render", config.breaker.clone())),
        Arc::new(origin),
        config.origin.clone(),
    )
    .with_config(config.orchestrator.clone());

    let shutdown = ShutdownController::with_timeout(config.drain_timeout);
    let app = build_router(AppState::new(Arc::new(orchestrator), shutdown.clone()));

    let listener = tokio::net::TcpListener::bind(config.listen_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr()))?;
    info!(addr = %config.listen_addr(), "Listening");

    let signal = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        rendergate::shutdown_signal().await;
        signal.initiate_shutdown().await;
    })
    .await
    .context("server error")?;

    cleanup.abort();
    render_manager.shutdown().await;
    if shutdown.in_flight() > 0 {
        warn!(in_flight = shutdown.in_flight(), "Exited with requests still in flight");
    }
    info!("RenderGate stopped");
    Ok(())
}
