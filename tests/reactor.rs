use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use warpcore::reactor::{
    Attachment, EventHandler, IOReactor, IOReactorStatus, ReactorConfig, Session,
};
use warpcore::{CloseMode, Error};

#[derive(Debug, Default)]
struct Counters {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
    timeouts: AtomicUsize,
}

/// Writes every byte it reads straight back.
struct Echo {
    pending: BytesMut,
    counters: Arc<Counters>,
}

impl EventHandler for Echo {
    fn connected(&mut self, session: &mut Session) -> Result<(), Error> {
        self.counters.connected.fetch_add(1, Ordering::SeqCst);
        session.set_attribute("greeting", String::from("hello"));
        Ok(())
    }

    fn input_ready(&mut self, session: &mut Session) -> Result<(), Error> {
        let mut buf = [0u8; 1024];
        loop {
            match session.channel().try_read(&mut buf) {
                Ok(0) => {
                    session.close(CloseMode::Graceful);
                    return Ok(());
                }
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) => return Err(error.into()),
            }
        }

        if !self.pending.is_empty() {
            session.request_output();
        }
        Ok(())
    }

    fn output_ready(&mut self, session: &mut Session) -> Result<(), Error> {
        while !self.pending.is_empty() {
            match session.channel().try_write(&self.pending) {
                Ok(n) => self.pending.advance(n),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(error) => return Err(error.into()),
            }
        }
        assert_eq!(session.attribute::<String>("greeting").map(String::as_str), Some("hello"));
        session.suspend_output();
        Ok(())
    }

    fn timeout(&mut self, session: &mut Session) -> Result<(), Error> {
        self.counters.timeouts.fetch_add(1, Ordering::SeqCst);
        session.close(CloseMode::Graceful);
        Ok(())
    }

    fn disconnected(&mut self, _session: &mut Session) {
        self.counters.disconnected.fetch_add(1, Ordering::SeqCst);
    }
}

fn echo_reactor(config: ReactorConfig) -> (IOReactor, Arc<Counters>) {
    let counters = Arc::new(Counters::default());
    let shared = counters.clone();
    let reactor = IOReactor::new(config, move |_: &mut Session, _: Option<Attachment>| {
        Box::new(Echo {
            pending: BytesMut::new(),
            counters: shared.clone(),
        }) as Box<dyn EventHandler>
    });
    reactor.start().unwrap();
    (reactor, counters)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn echo_over_listener() {
    let _ = tracing_subscriber::fmt::try_init();

    let (reactor, counters) = echo_reactor(ReactorConfig::default().with_worker_count(2));
    let endpoint = reactor.listen("127.0.0.1:0".parse().unwrap()).unwrap();

    let mut streams = Vec::new();
    for n in 0..4 {
        let mut stream = TcpStream::connect(endpoint.address()).await.unwrap();
        let message = format!("message {n}");
        stream.write_all(message.as_bytes()).await.unwrap();

        let mut buf = vec![0u8; message.len()];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, message.as_bytes());
        streams.push(stream);
    }

    assert_eq!(counters.connected.load(Ordering::SeqCst), 4);
    assert_eq!(reactor.session_count(), 4);

    drop(streams);
    eventually(|| counters.disconnected.load(Ordering::SeqCst) == 4).await;
    eventually(|| reactor.session_count() == 0).await;

    endpoint.close();
    endpoint.closed().await;
    assert!(TcpStream::connect(endpoint.address()).await.is_err());

    reactor.shutdown(CloseMode::Graceful);
    assert!(reactor.await_shutdown(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn outgoing_connections() {
    let _ = tracing_subscriber::fmt::try_init();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (reactor, counters) = echo_reactor(ReactorConfig::default().with_worker_count(1));

    let session = reactor.connect(listener.local_addr().unwrap(), None).await.unwrap();
    let (mut peer, _) = listener.accept().await.unwrap();
    assert!(!session.is_closed());

    peer.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    assert_eq!(counters.connected.load(Ordering::SeqCst), 1);

    session.shutdown(CloseMode::Immediate);
    assert!(session.is_closed());
    assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    eventually(|| counters.disconnected.load(Ordering::SeqCst) == 1).await;

    reactor.shutdown(CloseMode::Immediate);
}

#[tokio::test]
async fn registered_streams() {
    let _ = tracing_subscriber::fmt::try_init();

    let (reactor, _counters) = echo_reactor(ReactorConfig::default().with_worker_count(1));
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();

    let client = std::net::TcpStream::connect(address).unwrap();
    let (accepted, _) = listener.accept().unwrap();
    let session = reactor.register(accepted, None).await.unwrap();

    client.set_nonblocking(true).unwrap();
    let mut client = TcpStream::from_std(client).unwrap();
    client.write_all(b"registered").await.unwrap();
    let mut buf = [0u8; 10];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"registered");

    assert!(!session.is_closed());
    reactor.shutdown(CloseMode::Graceful);
    assert!(reactor.await_shutdown(Duration::from_secs(5)).await);
    assert!(session.is_closed());
}

#[tokio::test]
async fn idle_sessions_time_out() {
    let _ = tracing_subscriber::fmt::try_init();

    let (reactor, counters) = echo_reactor(
        ReactorConfig::default()
            .with_worker_count(1)
            .with_socket_timeout(Some(Duration::from_millis(100)))
            .with_select_interval(Duration::from_millis(20)),
    );
    let endpoint = reactor.listen("127.0.0.1:0".parse().unwrap()).unwrap();

    let mut stream = TcpStream::connect(endpoint.address()).await.unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    assert_eq!(counters.timeouts.load(Ordering::SeqCst), 1);

    reactor.shutdown(CloseMode::Immediate);
}

#[tokio::test]
async fn shutdown_closes_sessions_and_fails_commands() {
    let _ = tracing_subscriber::fmt::try_init();

    let (reactor, counters) = echo_reactor(ReactorConfig::default().with_worker_count(2));
    let endpoint = reactor.listen("127.0.0.1:0".parse().unwrap()).unwrap();

    let mut streams = Vec::new();
    for _ in 0..3 {
        streams.push(TcpStream::connect(endpoint.address()).await.unwrap());
    }
    eventually(|| reactor.session_count() == 3).await;

    reactor.shutdown(CloseMode::Graceful);
    assert_ne!(reactor.status(), IOReactorStatus::Active);
    assert!(reactor.await_shutdown(Duration::from_secs(5)).await);
    assert_eq!(reactor.status(), IOReactorStatus::ShutDown);
    assert_eq!(counters.disconnected.load(Ordering::SeqCst), 3);

    for stream in &mut streams {
        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    let error = reactor.connect(endpoint.address(), None).await.unwrap_err();
    assert!(matches!(error, Error::Shutdown));
}
