//! Gateway lifecycle (spec §4.7): builds the middleware chain in the order
//! spec §2 mandates, registers `/health` and the metrics endpoint ahead of
//! the forwarding routes, and owns the two eviction workers' lifetimes.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{routing::get, Router};
use axum_server::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::auth::KeyStore;
use crate::config::Config;
use crate::limiter::spawn_eviction_worker;
use crate::metrics::{MetricsEndpointState, MetricsRecorder};
use crate::proxy::ProxyState;
use crate::token_limiter::TokenLimiterState;
use crate::{health, metrics, proxy, request_limiter, token_limiter, validator};

/// Everything the gateway owns for the lifetime of a `start()`/`stop()` cycle:
/// the bound server handle, the eviction workers' stop channels, and their
/// join handles so `stop()` can wait for a clean drain (spec §4.7 "stop()").
pub struct Gateway {
    config: Config,
    router: Router,
    metrics: MetricsRecorder,
    request_stop: watch::Sender<bool>,
    token_stop: watch::Sender<bool>,
    request_worker: JoinHandle<()>,
    token_worker: JoinHandle<()>,
    handle: Handle,
}

impl Gateway {
    /// Builds the router and spawns the two eviction workers, but does not
    /// yet bind a socket (spec §4.7 "start()" step 1-3 happen here; step 4
    /// "Begin listening" happens in [`Gateway::start`]).
    pub fn build(config: Config) -> anyhow::Result<Self> {
        let keys = KeyStore::new(config.api_keys.clone());
        let metrics_recorder = MetricsRecorder::new(config.metrics.mask_keys);

        let request_bucket = request_limiter::build(
            config.limits.requests_per_second,
            config.limits.burst,
        );
        let token_bucket = token_limiter::build(config.limits.model_tokens_per_minute);

        let (request_stop_tx, request_stop_rx) = watch::channel(false);
        let (token_stop_tx, token_stop_rx) = watch::channel(false);

        let request_worker = spawn_eviction_worker(
            request_bucket.clone(),
            Duration::from_secs(request_limiter::SWEEP_INTERVAL_SECS),
            Duration::from_secs(request_limiter::IDLE_TTL_SECS),
            request_stop_rx,
        );
        let token_worker = spawn_eviction_worker(
            token_bucket.clone(),
            Duration::from_secs(token_limiter::SWEEP_INTERVAL_SECS),
            Duration::from_secs(token_limiter::IDLE_TTL_SECS),
            token_stop_rx,
        );

        let proxy_timeout = None; // spec §4.5: "configurable, default none / transport default"
        let proxy_state = ProxyState::new(&config.target_url, proxy_timeout)?;

        let health_router = Router::new().route("/health", get(health::health));

        let metrics_router = if config.metrics.enabled {
            let metrics_state = MetricsEndpointState {
                recorder: metrics_recorder.clone(),
                keys: keys.clone(),
                auth_required: config.metrics.auth_required,
                expose_prometheus: config.metrics.expose_prometheus,
                expose_json: config.metrics.expose_json,
                expose_csv: config.metrics.expose_csv,
            };
            Router::new()
                .route(&config.metrics.endpoint, get(metrics::metrics_handler))
                .with_state(metrics_state)
        } else {
            Router::new()
        };

        // Layers are added innermost-first: each `.layer()` call wraps every
        // layer added before it, so the *last* call is the *outermost* stage
        // and therefore runs first on the way in (spec §2's ordering).
        let token_limiter_state = TokenLimiterState {
            limiter: token_bucket.clone(),
            max_body_bytes: config.max_body_bytes,
        };

        let proxied_router = Router::new()
            .fallback(proxy::forward)
            .with_state(proxy_state)
            .layer(axum::middleware::from_fn_with_state(
                token_limiter_state,
                token_limiter::enforce,
            ))
            .layer(axum::middleware::from_fn_with_state(
                request_bucket.clone(),
                request_limiter::enforce,
            ))
            .layer(axum::middleware::from_fn_with_state(
                metrics_recorder.clone(),
                metrics::record_metrics,
            ))
            .layer(axum::middleware::from_fn_with_state(
                keys.clone(),
                crate::auth::authenticate,
            ))
            .layer(axum::middleware::from_fn_with_state(
                config.max_body_bytes,
                validator::validate,
            ))
            .layer(axum::middleware::from_fn(
                crate::middleware::logging::log_requests,
            ))
            .layer(TraceLayer::new_for_http());

        let router = health_router.merge(metrics_router).merge(proxied_router);

        Ok(Self {
            config,
            router,
            metrics: metrics_recorder,
            request_stop: request_stop_tx,
            token_stop: token_stop_tx,
            request_worker,
            token_worker,
            handle: Handle::new(),
        })
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    /// Begins listening on `listen_port` (spec §4.7 "start()" step 4), TLS if
    /// configured. Returns once the listener is bound; the serve loop itself
    /// runs in a background task whose handle is returned so the caller can
    /// await it (typically alongside a signal listener) before calling `stop`.
    pub async fn start(&self) -> anyhow::Result<JoinHandle<Result<(), std::io::Error>>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.listen_port));
        let app = self.router.clone().into_make_service();
        let handle = self.handle.clone();

        let tls = match &self.config.tls {
            Some(tls) if tls.enabled => {
                let cert_path = tls
                    .cert_path
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("tls.enabled requires cert_path"))?;
                let key_path = tls
                    .key_path
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("tls.enabled requires key_path"))?;
                Some(
                    axum_server::tls_rustls::RustlsConfig::from_pem_file(cert_path, key_path)
                        .await?,
                )
            }
            _ => None,
        };

        tracing::info!(addr = %addr, tls = tls.is_some(), "gateway listening");

        let join = if let Some(tls_config) = tls {
            tokio::spawn(async move {
                axum_server::bind_rustls(addr, tls_config)
                    .handle(handle)
                    .serve(app)
                    .await
            })
        } else {
            tokio::spawn(async move { axum_server::bind(addr).handle(handle).serve(app).await })
        };

        Ok(join)
    }

    /// Graceful shutdown (spec §4.7 "stop()"): stop accepting new
    /// connections, wait up to `shutdown_grace` for in-flight requests to
    /// drain, close the eviction workers' stop channels, flush the metrics
    /// exporter (a no-op here: nothing is buffered beyond the live maps).
    pub async fn stop(self) -> anyhow::Result<()> {
        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        self.handle.graceful_shutdown(Some(grace));

        let _ = self.request_stop.send(true);
        let _ = self.token_stop.send(true);

        let drained = tokio::time::timeout(
            grace + Duration::from_secs(1),
            futures::future::join(self.request_worker, self.token_worker),
        )
        .await;

        if drained.is_err() {
            anyhow::bail!("eviction workers did not drain within the shutdown grace period");
        }

        tracing::info!("gateway stopped cleanly");
        Ok(())
    }
}
