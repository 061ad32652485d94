use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use bytes::Bytes;
use flexi_logger::LoggerHandle;
use futures::FutureExt;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use std::panic::AssertUnwindSafe;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::access_log::AccessLogger;
use crate::balancer::{Balancer, ClusterBalancer};
use crate::blocklist::Blocklist;
use crate::config::Bootstrap;
use crate::constants;
use crate::consul;
use crate::limiter::RateLimiter;
use crate::metadata::{TitleClient, TitleStore};
use crate::metrics;
use crate::pipeline::{precondition, Pipeline, StageTimers, Verdict};
use crate::rewrite::QualityRewriter;
use crate::runtime::{ConfigParam, ConfigStorage, ConfigValue, PatchKind, RuntimePatch};
use crate::signer::LinkSigner;
use crate::version;

#[derive(Clone)]
struct RemoteAddr(String);

struct AppState {
    runtime: Arc<ConfigStorage>,
    blocklist: Arc<Blocklist>,
    pipeline: Pipeline,
    clusters: Vec<Arc<dyn Balancer>>,
    titles: Arc<TitleStore>,
    access: AccessLogger,
    log_handle: LoggerHandle,
    trusted_proxies: Vec<String>,
}

pub async fn run(cfg: Arc<Bootstrap>, log_handle: LoggerHandle) -> Result<()> {
    let blocklist = Arc::new(Blocklist::new());
    let runtime = Arc::new(ConfigStorage::new(
        Arc::clone(&blocklist),
        cfg.balancer.softer_tick,
        cfg.balancer.softer_step,
    ));

    let titles = Arc::new(TitleStore::new(
        TitleClient::new(&cfg.upstream_api),
        cfg.upstream_api.serie_ttl,
    ));
    let rewriter = QualityRewriter::new(Arc::clone(&titles));

    let cloud: Arc<dyn Balancer> = Arc::new(ClusterBalancer::new("cloud"));
    let nodes: Arc<dyn Balancer> = Arc::new(ClusterBalancer::new("nodes"));
    let clusters = vec![Arc::clone(&cloud), Arc::clone(&nodes)];

    let limiter = Arc::new(RateLimiter::open(&cfg.limiter)?);
    let signer = LinkSigner::new(&cfg.sign.secret, cfg.sign.link_expiration);

    // the cloud cluster is preferred, bare nodes are the tail of the chain
    let pipeline = Pipeline::new(
        Arc::clone(&runtime),
        rewriter,
        vec![Arc::clone(&cloud), Arc::clone(&nodes)],
        signer,
        limiter,
        &cfg.balancer,
    );

    consul::start(
        &cfg.consul,
        Arc::clone(&runtime),
        vec![Arc::clone(&nodes), Arc::clone(&cloud)],
    )
    .await?;

    let state = Arc::new(AppState {
        runtime,
        blocklist,
        pipeline,
        clusters,
        titles,
        access: AccessLogger::new(),
        log_handle,
        trusted_proxies: cfg.server.trusted_proxies.clone(),
    });

    let addr = normalize_addr(&cfg.server.addr);
    let socket_addr: SocketAddr = addr.parse().context("parse server.addr")?;
    let listener = TcpListener::bind(socket_addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    log::info!("listening on {addr}");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);

    run_accept_loop(listener, shutdown_rx, state).await
}

fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn spawn_signal_handler(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = async {
                if let Some(sig) = sigterm.as_mut() {
                    let _ = sig.recv().await;
                } else {
                    std::future::pending::<()>().await;
                }
            } => {}
        }
        log::info!("shutdown signal received");
        let _ = shutdown.send(true);
    });
}

async fn run_accept_loop(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    state: Arc<AppState>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => {
                let (stream, _) = res.context("accept tcp")?;
                let peer = stream.peer_addr().ok().map(|addr| addr.ip().to_string());
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);

                tokio::spawn(async move {
                    let service = service_fn(move |mut req| {
                        if let Some(peer) = &peer {
                            req.extensions_mut().insert(RemoteAddr(peer.clone()));
                        }
                        handle(req, Arc::clone(&state))
                    });
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(err) = builder.serve_connection(io, service).await {
                        log::error!("http connection error: {err}");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    // a panicking handler must not take the connection task down
    let resp = match AssertUnwindSafe(handle_inner(req, state)).catch_unwind().await {
        Ok(resp) => resp,
        Err(_) => {
            log::error!("panic has been caught while handling a request");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    };
    Ok(resp)
}

async fn handle_inner(req: Request<Incoming>, state: Arc<AppState>) -> Response<Full<Bytes>> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    if path.starts_with(constants::MEDIA_PATH_PREFIX) && method == Method::GET {
        return handle_media(req, &state).await;
    }

    match (method.as_str(), path.as_str()) {
        ("GET", constants::CLUSTER_BALANCE_PATH) => handle_cluster_balance(req, &state),
        ("POST", "/api/logger/level") => handle_logger_level(req, &state).await,
        ("POST", "/api/limiter/switch") => {
            handle_runtime_switch(req, &state, PatchKind::Limiter).await
        }
        ("POST", "/api/blocklist/add") => handle_blocklist_add(req, &state).await,
        ("POST", "/api/blocklist/remove") => handle_blocklist_remove(req, &state).await,
        ("POST", "/api/blocklist/switch") => {
            handle_runtime_switch(req, &state, PatchKind::BlockSwitch).await
        }
        ("POST", "/api/blocklist/reset") => {
            state.blocklist.reset();
            text_response(StatusCode::OK, "ok")
        }
        ("GET", "/api/balancer/stats") => handle_balancer_stats(&state),
        ("POST", "/api/balancer/stats/reset") => {
            for cluster in &state.clusters {
                cluster.reset_stats();
            }
            text_response(StatusCode::OK, "ok")
        }
        ("POST", "/api/balancer/reset") => {
            for cluster in &state.clusters {
                cluster.reset_upstream();
            }
            state.titles.reset().await;
            text_response(StatusCode::OK, "ok")
        }
        ("GET", "/healthz/startup-probe") => text_response(StatusCode::OK, "ok"),
        ("GET", "/healthz/liveness-probe") => empty_response(StatusCode::OK),
        ("GET", "/healthz/readiness-probe") => empty_response(StatusCode::OK),
        ("GET", "/version") => json_response(&version::build_info()),
        ("GET", "/metrics") => text_response(StatusCode::OK, &metrics::render()),
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn handle_media(req: Request<Incoming>, state: &AppState) -> Response<Full<Bytes>> {
    let started = Instant::now();
    let mut timers = StageTimers::start();
    timers.lap("precond");

    let client_ip = client_ip(&req, &state.trusted_proxies);
    let method = req.method().to_string();

    let intent = match precondition(req.headers()) {
        Ok(intent) => intent,
        Err(err) => {
            log::warn!("{err}");
            let resp = precondition_failed(&err.to_string());
            timers.emit(resp.status().as_u16());
            return resp;
        }
    };
    let request_uri = intent.uri.clone();

    let verdict = state.pipeline.decide(intent, &client_ip, &mut timers).await;
    let resp = match verdict {
        Verdict::Signed { location } => match location.parse::<http::HeaderValue>() {
            Ok(value) => {
                let mut resp = empty_response(StatusCode::NO_CONTENT);
                resp.headers_mut().insert(constants::HEADER_LOCATION, value);
                resp
            }
            Err(err) => {
                log::error!("signed location is not a valid header value: {err}");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "sign failure")
            }
        },
        Verdict::Blocked => empty_response(StatusCode::FORBIDDEN),
        Verdict::Limited => empty_response(StatusCode::TOO_MANY_REQUESTS),
        Verdict::SignFailed(err) => {
            log::warn!("could not sign request: {err}");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, &err)
        }
    };

    timers.emit(resp.status().as_u16());
    if let Some(ConfigValue::Int(1)) = state.runtime.get_value(ConfigParam::StdoutAccess) {
        state.access.log_request(
            &client_ip,
            &method,
            &request_uri,
            resp.status().as_u16(),
            started.elapsed().as_millis(),
        );
    }
    resp
}

fn handle_cluster_balance(req: Request<Incoming>, state: &AppState) -> Response<Full<Bytes>> {
    let intent = match precondition(req.headers()) {
        Ok(intent) => intent,
        Err(err) => {
            log::warn!("{err}");
            return precondition_failed(&err.to_string());
        }
    };

    let server = state.pipeline.balance_nodes(&intent);
    match server.parse::<http::HeaderValue>() {
        Ok(value) => {
            let mut resp = empty_response(StatusCode::NO_CONTENT);
            resp.headers_mut().insert(constants::HEADER_LOCATION, value);
            resp
        }
        Err(_) => text_response(StatusCode::INTERNAL_SERVER_ERROR, "bad balance target"),
    }
}

async fn handle_logger_level(req: Request<Incoming>, state: &AppState) -> Response<Full<Bytes>> {
    let level = match read_body_string(req).await {
        Some(level) if !level.trim().is_empty() => level,
        _ => return text_response(StatusCode::BAD_REQUEST, "level payload required"),
    };
    match crate::logging::set_level(&state.log_handle, level.trim()) {
        Ok(()) => {
            log::info!("log level switched to {}", level.trim());
            text_response(StatusCode::OK, "ok")
        }
        Err(err) => text_response(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}

async fn handle_runtime_switch(
    req: Request<Incoming>,
    state: &AppState,
    kind: PatchKind,
) -> Response<Full<Bytes>> {
    let payload = match read_body_string(req).await {
        Some(payload) => payload.trim().to_string(),
        None => return text_response(StatusCode::BAD_REQUEST, "payload required"),
    };
    match state.runtime.apply_patch(&RuntimePatch { kind, payload }) {
        Ok(()) => text_response(StatusCode::OK, "ok"),
        Err(err) => text_response(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}

async fn handle_blocklist_add(req: Request<Incoming>, state: &AppState) -> Response<Full<Bytes>> {
    let ip = match read_body_string(req).await {
        Some(ip) if !ip.trim().is_empty() => ip.trim().to_string(),
        _ => return text_response(StatusCode::BAD_REQUEST, "ip payload required"),
    };
    state.blocklist.insert(&ip);
    log::info!("blocklist add {ip}, size {}", state.blocklist.size());
    text_response(StatusCode::OK, "ok")
}

async fn handle_blocklist_remove(
    req: Request<Incoming>,
    state: &AppState,
) -> Response<Full<Bytes>> {
    let ip = match read_body_string(req).await {
        Some(ip) if !ip.trim().is_empty() => ip.trim().to_string(),
        _ => return text_response(StatusCode::BAD_REQUEST, "ip payload required"),
    };
    let existed = state.blocklist.remove(&ip);
    if existed {
        text_response(StatusCode::OK, "ok")
    } else {
        text_response(StatusCode::NOT_FOUND, "unknown ip")
    }
}

fn handle_balancer_stats(state: &AppState) -> Response<Full<Bytes>> {
    let mut stats = serde_json::Map::new();
    for cluster in &state.clusters {
        stats.insert(
            cluster.cluster_name().to_string(),
            serde_json::to_value(cluster.stats()).unwrap_or_default(),
        );
    }
    json_response(&stats)
}

async fn read_body_string(req: Request<Incoming>) -> Option<String> {
    let body = req.into_body().collect().await.ok()?.to_bytes();
    String::from_utf8(body.to_vec()).ok()
}

/// First X-Forwarded-For entry, but only when the peer is a trusted proxy
/// (an empty trust list trusts everyone, matching the dev default).
fn client_ip(req: &Request<Incoming>, trusted_proxies: &[String]) -> String {
    let peer = req
        .extensions()
        .get::<RemoteAddr>()
        .map(|addr| addr.0.clone())
        .unwrap_or_else(|| "-".to_string());

    let forwarded = req
        .headers()
        .get(constants::HEADER_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match forwarded {
        Some(ip) if trusted_proxies.is_empty() => ip.to_string(),
        Some(ip) if trusted_proxies.iter().any(|p| peer.starts_with(p.as_str())) => ip.to_string(),
        _ => peer,
    }
}

fn precondition_failed(message: &str) -> Response<Full<Bytes>> {
    metrics::record(StatusCode::PRECONDITION_FAILED);
    let mut builder = Response::builder().status(StatusCode::PRECONDITION_FAILED);
    if let Ok(value) = message.parse::<http::HeaderValue>() {
        builder = builder.header(constants::HEADER_ERROR, value);
    }
    builder
        .body(Full::new(Bytes::from(message.to_string())))
        .unwrap()
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    metrics::record(status);
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    metrics::record(status);
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

fn json_response<T: serde::Serialize>(payload: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(payload) {
        Ok(bytes) => {
            metrics::record(StatusCode::OK);
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/json; charset=utf-8")
                .body(Full::new(Bytes::from(bytes)))
                .unwrap()
        }
        Err(_) => text_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode"),
    }
}
