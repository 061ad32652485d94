#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use porter::config::Bootstrap;
use tokio::net::TcpListener;
use tokio::sync::OnceCell;

static START: OnceCell<()> = OnceCell::const_new();

/// Boots the router once per test binary: a mock title API first, then the
/// real server wired at it. `mutate` tweaks the bootstrap before launch.
pub async fn ensure_server_with<F>(port: u16, mutate: F)
where
    F: FnOnce(&mut Bootstrap) + Send + 'static,
{
    START
        .get_or_init(|| async move {
            let api = MockServer::start(title_api_handler).await;
            let mut cfg = test_config(port, api.addr());
            mutate(&mut cfg);
            // the mock has to outlive every test in the binary
            std::mem::forget(api);

            std::thread::spawn(move || {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .build()
                    .expect("runtime");
                runtime.block_on(async move {
                    let handle = porter::logging::init(&cfg.logger, false).expect("logger");
                    let _ = porter::server::run(Arc::new(cfg), handle).await;
                });
            });
            tokio::time::sleep(Duration::from_millis(300)).await;
        })
        .await;
}

pub async fn ensure_server(port: u16) {
    ensure_server_with(port, |_| {}).await;
}

fn test_config(port: u16, api_addr: SocketAddr) -> Bootstrap {
    let raw = format!(
        r#"
server:
  addr: "127.0.0.1:{port}"
upstream_api:
  base_url: "http://{api_addr}"
sign:
  secret: "test-secret"
  link_expiration: 10s
limiter:
  max_requests: 3
  window: 60s
"#
    );
    serde_yaml::from_str(&raw).expect("test config")
}

/// Canned title API: title 9277 serie 13 with hashes abc/def/ghi, title
/// 9300 with an unplayable playlist, everything else is a 404.
pub fn title_api_handler(req: Request<Incoming>) -> Response<Full<Bytes>> {
    let query = req.uri().query().unwrap_or("");
    let id = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("id="))
        .unwrap_or("");

    let body = match id {
        "9277" => sample_title_json(9277),
        "9300" => r#"{"id": 9300, "code": "empty", "player": {"host": "", "playlist": {}}}"#
            .to_string(),
        _ => {
            return build_response(StatusCode::NOT_FOUND, Bytes::from_static(b"unknown title"));
        }
    };
    build_response(StatusCode::OK, Bytes::from(body))
}

pub fn sample_title_json(id: u16) -> String {
    format!(
        r#"{{
            "id": {id},
            "code": "sample-title",
            "player": {{
                "host": "cache.example.org",
                "playlist": {{
                    "13": {{
                        "serie": 13,
                        "hls": {{
                            "fhd": "/videos/media/ts/{id}/13/1080/abc_00001.ts",
                            "hd": "/videos/media/ts/{id}/13/720/def_00001.ts",
                            "sd": "/videos/media/ts/{id}/13/480/ghi_00001.ts"
                        }}
                    }}
                }}
            }}
        }}"#
    )
}

fn build_response(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body))
        .unwrap()
}

#[derive(Clone)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Clone)]
pub struct TestClient {
    addr: SocketAddr,
}

impl TestClient {
    pub fn new(port: u16) -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
        }
    }

    pub async fn send(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> TestResponse {
        let stream = tokio::net::TcpStream::connect(self.addr)
            .await
            .expect("connect router");
        let io = TokioIo::new(stream);
        let (mut sender, conn) = http1::handshake(io).await.expect("handshake");
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(http::header::HOST, self.addr.to_string());
        for (k, v) in headers.iter() {
            builder = builder.header(k, v);
        }
        let req = builder.body(Full::new(body)).expect("request");

        let resp = sender.send_request(req).await.expect("send request");
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.expect("body").to_bytes();

        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn get(&self, path: &str, headers: HeaderMap) -> TestResponse {
        self.send(Method::GET, path, headers, Bytes::new()).await
    }

    pub async fn post(&self, path: &str, body: &str) -> TestResponse {
        self.send(
            Method::POST,
            path,
            HeaderMap::new(),
            Bytes::from(body.to_string()),
        )
        .await
    }
}

pub struct MockServer {
    addr: SocketAddr,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, mut rx) = tokio::sync::oneshot::channel();
        let handler = Arc::new(handler);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    res = listener.accept() => {
                        let (stream, _) = match res { Ok(v) => v, Err(_) => break };
                        let io = TokioIo::new(stream);
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let resp = handler(req);
                                async move { Ok::<_, hyper::Error>(resp) }
                            });
                            let builder = ConnBuilder::new(TokioExecutor::new());
                            let _ = builder.serve_connection(io, service).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            shutdown: Some(shutdown),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

pub fn media_headers(uri: &str, client_id: &str, server: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if !uri.is_empty() {
        headers.insert("X-Client-Uri", uri.parse().unwrap());
    }
    if !client_id.is_empty() {
        headers.insert("X-Client-Id", client_id.parse().unwrap());
    }
    if !server.is_empty() {
        headers.insert("X-Cache-Server", server.parse().unwrap());
    }
    headers
}
