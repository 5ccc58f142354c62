//! Entrypoint: set up tracing, load settings, bind the configured storage
//! realization into the module registry, and serve metrics & health.
//!
//! The registry is built and frozen before the HTTP endpoint comes up; a
//! contract left unbound aborts startup instead of failing at query time.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{Encoder, TextEncoder};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use oap_query::config::Settings;
use oap_query::metrics;
use oap_query::module::{CoreServices, ModuleRegistry};
use oap_query::storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ───────────────────────────────────────────────────────────────
    // 1. Initialise tracing / logging
    // ───────────────────────────────────────────────────────────────
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    info!("Starting OAP query storage layer…");

    // ───────────────────────────────────────────────────────────────
    // 2. Load configuration
    // ───────────────────────────────────────────────────────────────
    let settings = Settings::new().context("loading Config.toml")?;
    info!(?settings, "Loaded configuration");

    // ───────────────────────────────────────────────────────────────
    // 3. Bind storage realizations, then freeze the registry
    // ───────────────────────────────────────────────────────────────
    let registry: Arc<ModuleRegistry> = Arc::new(
        storage::bootstrap(&settings)
            .await
            .context("binding storage services")?,
    );
    let _services = CoreServices::resolve(&registry).context("resolving query contracts")?;
    info!(services = registry.len(), "Module registry frozen");

    // ───────────────────────────────────────────────────────────────
    // 4. HTTP server for metrics & health
    // ───────────────────────────────────────────────────────────────
    let addr: SocketAddr = settings
        .server_bind
        .parse()
        .with_context(|| format!("invalid `server_bind` {}", settings.server_bind))?;

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, hyper::Error>(service_fn(|req: Request<Body>| async move {
            Ok::<_, hyper::Error>(route(&req))
        }))
    });

    let server = Server::try_bind(&addr)
        .with_context(|| format!("binding {addr}"))?
        .serve(make_svc)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        });

    info!(%addr, "Serving metrics & health");
    if let Err(e) = server.await {
        error!(error = %e, "Metrics server failed");
        return Err(e.into());
    }
    Ok(())
}

fn route(req: &Request<Body>) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        // ─── METRICS ENDPOINT ────────────────────────────────
        (&Method::GET, "/metrics") => {
            let mut resp = Response::new(Body::from(metrics::gather_metrics()));
            if let Ok(mime) = TextEncoder::new().format_type().parse() {
                resp.headers_mut().insert(hyper::header::CONTENT_TYPE, mime);
            }
            resp
        }

        // ─── HEALTHCHECK ENDPOINT ───────────────────────────
        (&Method::GET, "/healthz") => Response::new(Body::from("OK")),

        // ─── ANY OTHER ROUTE ────────────────────────────────
        _ => {
            let mut not_found = Response::new(Body::empty());
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            not_found
        }
    }
}
