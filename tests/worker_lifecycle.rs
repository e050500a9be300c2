use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{body::Incoming, service::service_fn, Request, Response, StatusCode};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use offlinerelay::{
    cache::{CacheKey, CacheSet},
    transport::{HttpTransport, Transport},
    worker::{CacheController, FetchRequest, LifecycleState},
};
use tokio::{net::TcpListener, sync::oneshot};

const CACHE_NAME: &str = "app-cache-v3";

/// Static origin: serves a few pages until shut down.
async fn spawn_origin() -> (SocketAddr, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let mut connections = Vec::new();
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    connections.push(tokio::spawn(async move {
                        let service = service_fn(|req: Request<Incoming>| async move {
                            let (status, body): (StatusCode, &'static [u8]) =
                                match req.uri().path() {
                                    "/offline.html" => (StatusCode::OK, b"offline page"),
                                    "/index.html" => (StatusCode::OK, b"index page"),
                                    "/app.js" => (StatusCode::OK, b"console.log()"),
                                    _ => (StatusCode::NOT_FOUND, b"missing"),
                                };
                            let mut res = Response::new(Full::new(Bytes::from_static(body)));
                            *res.status_mut() = status;
                            Ok::<_, hyper::Error>(res)
                        });
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        let _ = builder.serve_connection(io, service).await;
                    }));
                }
            }
        }
        // Shut down established keep-alive connections too, so the
        // origin is actually unreachable, not just refusing new ones.
        for connection in connections {
            connection.abort();
        }
    });

    (addr, shutdown_tx)
}

async fn wait_for_port_close(addr: SocketAddr) {
    loop {
        match tokio::net::TcpStream::connect(addr).await {
            Ok(_) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
            Err(_) => break,
        }
    }
}

#[tokio::test]
async fn fresh_install_and_activate_leave_exactly_one_versioned_cache() {
    let (origin_addr, origin_shutdown) = spawn_origin().await;
    let fallback_url = format!("http://{origin_addr}/offline.html");

    let caches = CacheSet::new();
    caches.open("app-cache-v1");
    caches.open("app-cache-v2");

    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new().unwrap());
    let controller =
        CacheController::new(caches.clone(), transport, CACHE_NAME, fallback_url.as_str(), 50);

    controller.install().await.unwrap();
    assert_eq!(controller.state(), LifecycleState::Installed);

    controller.activate().await.unwrap();
    assert_eq!(controller.state(), LifecycleState::Activated);

    assert_eq!(caches.names(), vec![CACHE_NAME.to_owned()]);
    let cached_fallback = caches
        .open(CACHE_NAME)
        .lookup(&CacheKey::get(fallback_url.as_str()))
        .unwrap();
    assert_eq!(&cached_fallback.body[..], b"offline page");

    let _ = origin_shutdown.send(());
}

#[tokio::test]
async fn navigation_and_resources_degrade_to_cache_when_the_origin_dies() {
    let (origin_addr, origin_shutdown) = spawn_origin().await;
    let fallback_url = format!("http://{origin_addr}/offline.html");
    let index_url = format!("http://{origin_addr}/index.html");
    let script_url = format!("http://{origin_addr}/app.js");

    let caches = CacheSet::new();
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new().unwrap());
    let controller =
        CacheController::new(caches.clone(), transport, CACHE_NAME, fallback_url.as_str(), 50);
    controller.install().await.unwrap();
    controller.activate().await.unwrap();

    // Warm the cache while the origin is up.
    let index = controller
        .handle_fetch(&FetchRequest::navigation(index_url.as_str()))
        .await
        .unwrap();
    assert_eq!(&index.body[..], b"index page");
    let script = controller
        .handle_fetch(&FetchRequest::get(script_url.as_str()))
        .await
        .unwrap();
    assert_eq!(&script.body[..], b"console.log()");

    let _ = origin_shutdown.send(());
    wait_for_port_close(origin_addr).await;

    // Exact matches come from cache.
    let index = controller
        .handle_fetch(&FetchRequest::navigation(index_url.as_str()))
        .await
        .unwrap();
    assert_eq!(&index.body[..], b"index page");
    let script = controller
        .handle_fetch(&FetchRequest::get(script_url.as_str()))
        .await
        .unwrap();
    assert_eq!(&script.body[..], b"console.log()");

    // An uncached navigation falls back to the offline page.
    let other = controller
        .handle_fetch(&FetchRequest::navigation(format!(
            "http://{origin_addr}/somewhere"
        )))
        .await
        .unwrap();
    assert_eq!(&other.body[..], b"offline page");

    // An uncached image resolves to a synthetic error response instead
    // of an unhandled failure.
    let image = controller
        .handle_fetch(&FetchRequest::image(format!(
            "http://{origin_addr}/photo.jpg"
        )))
        .await
        .unwrap();
    assert_eq!(image.status, 503);

    // An uncached API read gets the JSON offline body.
    let api = controller
        .handle_fetch(&FetchRequest::get(format!("http://{origin_addr}/api/terms")))
        .await
        .unwrap();
    assert_eq!(api.status, 503);
    assert_eq!(&api.body[..], br#"{"error":"offline"}"#);
}
