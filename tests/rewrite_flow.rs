mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Response, StatusCode};
use http_body_util::Full;
use porter::chunk::{ChunkRequest, TitleQuality};
use porter::config::UpstreamApi;
use porter::metadata::{MetadataError, TitleClient, TitleStore};
use porter::rewrite::QualityRewriter;
use support::*;

fn store_for(addr: std::net::SocketAddr) -> TitleStore {
    let cfg = UpstreamApi {
        base_url: format!("http://{addr}"),
        ..UpstreamApi::default()
    };
    TitleStore::new(TitleClient::new(&cfg), Duration::from_secs(60))
}

#[tokio::test]
async fn downgrade_swaps_folder_and_hash() {
    let api = MockServer::start(title_api_handler).await;
    let rewriter = QualityRewriter::new(Arc::new(store_for(api.addr())));

    let uri = "/videos/media/ts/9277/13/1080/abc_00028.ts";
    let req = ChunkRequest::parse(uri);
    let rewritten = rewriter.rewrite(&req, uri, TitleQuality::Hd).await;
    assert_eq!(rewritten, "/videos/media/ts/9277/13/720/def_00028.ts");

    // playlists rewrite the same way, hash and folder both move
    let uri = "/videos/media/ts/9277/13/1080/abc.m3u8";
    let req = ChunkRequest::parse(uri);
    let rewritten = rewriter.rewrite(&req, uri, TitleQuality::Sd).await;
    assert_eq!(rewritten, "/videos/media/ts/9277/13/480/ghi.m3u8");
}

#[tokio::test]
async fn legacy_chunk_keeps_its_filename() {
    let api = MockServer::start(title_api_handler).await;
    let rewriter = QualityRewriter::new(Arc::new(store_for(api.addr())));

    let uri = "/videos/media/ts/9277/13/1080/fff00042.ts";
    let req = ChunkRequest::parse(uri);
    let rewritten = rewriter.rewrite(&req, uri, TitleQuality::Hd).await;
    assert_eq!(rewritten, "/videos/media/ts/9277/13/720/fff00042.ts");
}

#[tokio::test]
async fn unknown_title_keeps_the_uri() {
    let api = MockServer::start(title_api_handler).await;
    let rewriter = QualityRewriter::new(Arc::new(store_for(api.addr())));

    let uri = "/videos/media/ts/404/1/1080/abc_00028.ts";
    let req = ChunkRequest::parse(uri);
    assert_eq!(rewriter.rewrite(&req, uri, TitleQuality::Hd).await, uri);
}

#[tokio::test]
async fn error_kinds_are_separated() {
    let api = MockServer::start(title_api_handler).await;
    let store = store_for(api.addr());

    // the mock knows nothing about title 404: transport-level failure
    match store.resolve(404, 1).await {
        Err(MetadataError::Transient(_)) => {}
        other => panic!("expected transient error, got {other:?}"),
    }

    // title 9300 exists but its playlist is unplayable: hard not-found
    match store.resolve(9300, 13).await {
        Err(MetadataError::NotFound(_)) => {}
        other => panic!("expected not found, got {other:?}"),
    }

    // known title, unknown serie
    match store.resolve(9277, 99).await {
        Err(MetadataError::NotFound(_)) => {}
        other => panic!("expected not found, got {other:?}"),
    }
}

#[tokio::test]
async fn cache_and_singleflight_collapse_fetches() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&hits);
    let api = MockServer::start(move |req| {
        counted.fetch_add(1, Ordering::SeqCst);
        let resp: Response<Full<Bytes>> = title_api_handler(req);
        resp
    })
    .await;
    let store = Arc::new(store_for(api.addr()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(
            async move { store.resolve(9277, 13).await },
        ));
    }
    for handle in handles {
        let serie = handle.await.unwrap().unwrap();
        assert_eq!(serie.hash_for(TitleQuality::Hd), Some("def"));
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1, "concurrent misses collapsed");

    // and a later lookup is a pure cache hit
    let serie = store.resolve(9277, 13).await.unwrap();
    assert_eq!(serie.hash_for(TitleQuality::Fhd), Some("abc"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    store.reset().await;
    let _ = store.resolve(9277, 13).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn api_status_errors_are_transient() {
    let api = MockServer::start(|_req| {
        Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Full::new(Bytes::new()))
            .unwrap()
    })
    .await;
    let store = store_for(api.addr());
    match store.resolve(9277, 13).await {
        Err(MetadataError::Transient(_)) => {}
        other => panic!("expected transient error, got {other:?}"),
    }
}
