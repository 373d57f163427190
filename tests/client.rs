use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use tokio::io::AsyncReadExt;
use warpcore::client::{Client, ClientConfig};
use warpcore::http1::{Body, Request, Response, ServerHandlerFactory};
use warpcore::pool::{self, Route};
use warpcore::reactor::{IOReactor, ListenerEndpoint, ReactorConfig};
use warpcore::{BoxError, CloseMode, Error};

fn handle(request: Request) -> Result<Response, BoxError> {
    tracing::trace!(path = request.target(), "handling request");
    match request.target() {
        "/echo" => Ok(Response::new(StatusCode::OK).with_body(request.body.to_bytes())),
        "/chunked" => Ok(Response::new(StatusCode::OK)
            .with_body(Body::streamed(["hello", ", ", "world"]))
            .with_trailer("X-Checksum", "42")),
        "/close" => Ok(Response::new(StatusCode::OK)
            .with_header("Connection", "close")
            .with_body("bye")),
        "/fail" => Err("handler failed".into()),
        _ => Ok(Response::new(StatusCode::NOT_FOUND)),
    }
}

fn server() -> (IOReactor, ListenerEndpoint) {
    let reactor = IOReactor::new(
        ReactorConfig::default().with_worker_count(2),
        ServerHandlerFactory::new(handle),
    );
    reactor.start().unwrap();
    let endpoint = reactor.listen("127.0.0.1:0".parse().unwrap()).unwrap();
    (reactor, endpoint)
}

fn client(pool: pool::Config) -> Client {
    Client::new(
        ClientConfig::default()
            .with_reactor(
                ReactorConfig::default()
                    .with_worker_count(1)
                    .with_socket_timeout(Some(Duration::from_millis(300)))
                    .with_select_interval(Duration::from_millis(50)),
            )
            .with_pool(pool),
    )
    .unwrap()
}

fn route(address: SocketAddr) -> Route {
    format!("http://{address}").parse().unwrap()
}

/// A peer which accepts connections and never answers.
async fn silent() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    address
}

#[tokio::test]
async fn exchange_over_tcp() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, endpoint) = server();
    let client = client(pool::Config::default());
    let route = route(endpoint.address());

    let response = client
        .execute(route.clone(), Request::post("/echo", "ping"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body().to_bytes(), Bytes::from_static(b"ping"));

    let response = client
        .execute(route.clone(), Request::get("/missing"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    client.shutdown(CloseMode::Graceful);
    server.shutdown(CloseMode::Graceful);
    assert!(client.await_shutdown(Duration::from_secs(5)).await);
    assert!(server.await_shutdown(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn persistent_connections_are_reused() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, endpoint) = server();
    let client = client(pool::Config::default());
    let route = route(endpoint.address());

    for body in ["one", "two", "three"] {
        let response = client
            .execute(route.clone(), Request::post("/echo", body))
            .await
            .unwrap();
        assert_eq!(response.body().to_bytes(), Bytes::from(body));
    }

    let stats = client.pool().stats(&route).unwrap();
    assert_eq!(stats.available, 1);
    assert_eq!(stats.leased, 0);
    assert_eq!(server.session_count(), 1);

    client.shutdown(CloseMode::Immediate);
    server.shutdown(CloseMode::Immediate);
}

#[tokio::test]
async fn chunked_response_with_trailers() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, endpoint) = server();
    let client = client(pool::Config::default());

    let response = client
        .execute(route(endpoint.address()), Request::get("/chunked"))
        .await
        .unwrap();
    assert_eq!(response.headers().value("transfer-encoding"), Some("chunked"));
    assert_eq!(response.body().to_bytes(), Bytes::from_static(b"hello, world"));
    assert_eq!(response.trailers().value("x-checksum"), Some("42"));

    client.shutdown(CloseMode::Immediate);
    server.shutdown(CloseMode::Immediate);
}

#[tokio::test]
async fn chunked_request_body() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, endpoint) = server();
    let client = client(pool::Config::default());

    let request = Request::post("/echo", Body::streamed(["stream", "ed"]));
    let response = client
        .execute(route(endpoint.address()), request)
        .await
        .unwrap();
    assert_eq!(response.body().to_bytes(), Bytes::from_static(b"streamed"));

    client.shutdown(CloseMode::Immediate);
    server.shutdown(CloseMode::Immediate);
}

#[tokio::test]
async fn closed_connections_are_not_reused() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, endpoint) = server();
    let client = client(pool::Config::default());
    let route = route(endpoint.address());

    let response = client.execute(route.clone(), Request::get("/close")).await.unwrap();
    assert_eq!(response.body().to_bytes(), Bytes::from_static(b"bye"));

    let stats = client.pool().stats(&route).unwrap();
    assert_eq!(stats.available, 0);
    assert_eq!(stats.leased, 0);

    let response = client.execute(route.clone(), Request::get("/fail")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    client.shutdown(CloseMode::Immediate);
    server.shutdown(CloseMode::Immediate);
}

#[tokio::test]
async fn concurrent_exchanges_share_the_route_limit() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, endpoint) = server();
    let client = client(pool::Config::default().with_max_per_route(2));
    let route = route(endpoint.address());

    let responses: Vec<_> = (0..6)
        .map(|n| client.execute(route.clone(), Request::post("/echo", format!("request {n}"))))
        .collect();

    for (n, response) in futures_util::future::join_all(responses).await.into_iter().enumerate() {
        let response = response.unwrap();
        assert_eq!(response.body().to_bytes(), Bytes::from(format!("request {n}")));
    }

    let stats = client.pool().stats(&route).unwrap();
    assert!(stats.available <= 2);
    assert_eq!(stats.leased, 0);
    assert_eq!(stats.pending, 0);

    client.shutdown(CloseMode::Immediate);
    server.shutdown(CloseMode::Immediate);
}

#[tokio::test]
async fn idle_timeout_fails_the_exchange() {
    let _ = tracing_subscriber::fmt::try_init();

    let address = silent().await;
    let client = client(pool::Config::default());

    let error = client
        .execute(route(address), Request::get("/"))
        .await
        .unwrap_err();
    assert!(error.is_timeout(), "unexpected error: {error}");

    let stats = client.pool().total_stats();
    assert_eq!(stats.leased, 0);
    assert_eq!(stats.available, 0);

    client.shutdown(CloseMode::Immediate);
}

#[tokio::test]
async fn cancel_in_flight_exchange() {
    let _ = tracing_subscriber::fmt::try_init();

    let address = silent().await;
    let client = client(pool::Config::default());

    let response = client.execute(route(address), Request::get("/"));
    let canceller = response.canceller();
    let task = tokio::spawn(response);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(canceller.cancel());

    let error = task.await.unwrap().unwrap_err();
    assert!(matches!(error, Error::Cancelled));
    assert_eq!(client.pool().total_stats().leased, 0);

    client.shutdown(CloseMode::Immediate);
}

#[tokio::test]
async fn lease_timeout_when_route_is_saturated() {
    let _ = tracing_subscriber::fmt::try_init();

    let address = silent().await;
    let client = client(
        pool::Config::default()
            .with_max_per_route(1)
            .with_lease_timeout(Some(Duration::from_millis(50))),
    );

    let first = tokio::spawn(client.execute(route(address), Request::get("/first")));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let error = client
        .execute(route(address), Request::get("/second"))
        .await
        .unwrap_err();
    assert!(error.is_timeout());

    let _ = first.await;
    client.shutdown(CloseMode::Immediate);
}

#[tokio::test]
async fn shutdown_rejects_new_exchanges() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, endpoint) = server();
    let client = client(pool::Config::default());
    client.shutdown(CloseMode::Graceful);

    let error = client
        .execute(route(endpoint.address()), Request::get("/echo"))
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Pool(pool::Error::ShutDown) | Error::Shutdown));

    server.shutdown(CloseMode::Immediate);
}

#[tokio::test]
async fn server_sessions_close_on_graceful_shutdown() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, endpoint) = server();
    let client = client(pool::Config::default());
    let route = route(endpoint.address());

    client.execute(route.clone(), Request::get("/echo")).await.unwrap();
    assert_eq!(server.session_count(), 1);

    server.shutdown(CloseMode::Graceful);
    assert!(server.await_shutdown(Duration::from_secs(5)).await);
    assert_eq!(server.session_count(), 0);
    assert!(endpoint.is_closed());

    client.shutdown(CloseMode::Immediate);
}

#[tokio::test]
async fn dropped_exchange_closes_its_connection() {
    let _ = tracing_subscriber::fmt::try_init();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = Client::new(
        ClientConfig::default().with_reactor(ReactorConfig::default().with_worker_count(1)),
    )
    .unwrap();
    let route = route(listener.local_addr().unwrap());

    let mut response = client.execute(route.clone(), Request::get("/"));
    let (mut peer, _) = tokio::select! {
        accepted = listener.accept() => accepted.unwrap(),
        _ = &mut response => panic!("exchange finished without a response"),
    };

    let mut buf = [0u8; 256];
    let read = tokio::select! {
        read = peer.read(&mut buf) => read.unwrap(),
        _ = &mut response => panic!("exchange finished without a response"),
    };
    assert!(buf[..read].starts_with(b"GET / HTTP/1.1\r\n"));
    drop(response);

    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match peer.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "connection left open after the exchange was dropped");
    assert_eq!(client.pool().stats(&route).unwrap().leased, 0);

    client.shutdown(CloseMode::Immediate);
}
