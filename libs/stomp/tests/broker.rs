//! Connection tests against an in-process fake broker.

use std::time::Duration;

use bytes::BytesMut;
use lbr_stomp::frame::parse_frame;
use lbr_stomp::{Command, ConnectOptions, Connection, Frame, HostAddr, StompError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct BrokerSide {
    stream: TcpStream,
    buf: BytesMut,
}

impl BrokerSide {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    async fn read(&mut self) -> Frame {
        loop {
            if let Some(frame) = parse_frame(&mut self.buf).unwrap() {
                return frame;
            }
            let n = self.stream.read_buf(&mut self.buf).await.unwrap();
            assert!(n > 0, "client closed the socket");
        }
    }

    /// Read and discard until the client closes the socket.
    async fn drain(&mut self) {
        while matches!(self.stream.read_buf(&mut self.buf).await, Ok(n) if n > 0) {
            self.buf.clear();
        }
    }

    async fn write(&mut self, frame: Frame) {
        self.stream.write_all(&frame.to_bytes()).await.unwrap();
    }

    /// Read CONNECT and answer CONNECTED with the given version.
    async fn handshake(&mut self, version: &str) -> Frame {
        let connect = self.read().await;
        assert_eq!(connect.command, Command::Connect);
        self.write(Frame::new(Command::Connected).header("version", version))
            .await;
        connect
    }
}

async fn listener() -> (TcpListener, HostAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, HostAddr::new("127.0.0.1", port))
}

fn options(hosts: Vec<HostAddr>) -> ConnectOptions {
    let mut options =
        ConnectOptions::new(hosts, "testhost-99").credentials("routinginfo", "routinginfopasswd");
    options.connect_timeout = Duration::from_secs(2);
    options.max_reconnect_delay = Duration::from_millis(200);
    options
}

#[tokio::test]
async fn test_handshake_subscribe_deliver_ack() {
    let (listener, addr) = listener().await;

    let broker = tokio::spawn(async move {
        let mut side = BrokerSide::accept(&listener).await;
        let connect = side.handshake("1.1").await;
        assert_eq!(connect.get("accept-version"), Some("1.1"));
        assert_eq!(connect.get("login"), Some("routinginfo"));
        assert_eq!(connect.get("client-id"), Some("testhost-99"));

        let subscribe = side.read().await;
        assert_eq!(subscribe.command, Command::Subscribe);
        assert_eq!(subscribe.get("destination"), Some("/topic/routinginfo"));
        assert_eq!(subscribe.get("ack"), Some("client-individual"));
        let sub_id = subscribe.get("id").unwrap().to_string();

        side.write(
            Frame::new(Command::Message)
                .header("destination", "/topic/routinginfo")
                .header("message-id", "msg-1")
                .header("subscription", sub_id.clone())
                .with_body(":action: :create_application\n"),
        )
        .await;

        let ack = side.read().await;
        assert_eq!(ack.command, Command::Ack);
        assert_eq!(ack.get("message-id"), Some("msg-1"));
        assert_eq!(ack.get("subscription"), Some(sub_id.as_str()));
    });

    let mut conn = Connection::connect(options(vec![addr])).await.unwrap();
    assert_eq!(conn.version(), Some("1.1"));

    let sub = conn.subscribe("/topic/routinginfo").await.unwrap();
    let frame = conn
        .receive(Duration::from_secs(2))
        .await
        .unwrap()
        .expect("message");

    assert_eq!(frame.message_id(), Some("msg-1"));
    assert_eq!(frame.subscription(), Some(sub.as_str()));
    assert_eq!(&frame.body[..], b":action: :create_application\n");

    conn.ack("msg-1", &sub).await.unwrap();
    broker.await.unwrap();
}

#[tokio::test]
async fn test_stomp_1_0_broker_rejected() {
    let (listener, addr) = listener().await;

    tokio::spawn(async move {
        let mut side = BrokerSide::accept(&listener).await;
        side.handshake("1.0").await;
    });

    let err = Connection::connect(options(vec![addr])).await.unwrap_err();
    assert!(matches!(err, StompError::UnsupportedVersion(v) if v == "1.0"));
}

#[tokio::test]
async fn test_error_frame_during_handshake() {
    let (listener, addr) = listener().await;

    tokio::spawn(async move {
        let mut side = BrokerSide::accept(&listener).await;
        let _ = side.read().await;
        side.write(
            Frame::new(Command::Error)
                .header("message", "authentication failed")
                .with_body("bad credentials"),
        )
        .await;
    });

    let err = Connection::connect(options(vec![addr])).await.unwrap_err();
    // Every host failed, so the per-host broker error is folded into Unreachable.
    match err {
        StompError::Unreachable(detail) => {
            assert!(detail.contains("authentication failed"), "{detail}")
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_receive_times_out_quietly() {
    let (listener, addr) = listener().await;

    let broker = tokio::spawn(async move {
        let mut side = BrokerSide::accept(&listener).await;
        side.handshake("1.1").await;
        // Hold the socket open without sending anything.
        let _ = side.read().await;
    });

    let mut conn = Connection::connect(options(vec![addr])).await.unwrap();
    let got = conn.receive(Duration::from_millis(50)).await.unwrap();
    assert!(got.is_none());
    assert!(conn.is_connected());

    conn.disconnect().await;
    assert!(!conn.is_connected());
    broker.await.unwrap();
}

#[tokio::test]
async fn test_reconnect_replays_subscription() {
    let (listener, addr) = listener().await;

    let broker = tokio::spawn(async move {
        let mut first = BrokerSide::accept(&listener).await;
        first.handshake("1.1").await;
        let subscribe = first.read().await;
        let sub_id = subscribe.get("id").unwrap().to_string();
        drop(first);

        let mut second = BrokerSide::accept(&listener).await;
        second.handshake("1.2").await;
        let replayed = second.read().await;
        assert_eq!(replayed.command, Command::Subscribe);
        assert_eq!(replayed.get("id"), Some(sub_id.as_str()));
        assert_eq!(replayed.get("destination"), Some("/topic/routinginfo"));

        second
            .write(
                Frame::new(Command::Message)
                    .header("message-id", "msg-2")
                    .header("subscription", sub_id)
                    .with_body("redelivered"),
            )
            .await;

        // Keep the socket until the client is done.
        let _ = second.read().await;
    });

    let mut conn = Connection::connect(options(vec![addr])).await.unwrap();
    let sub = conn.subscribe("/topic/routinginfo").await.unwrap();

    let err = conn.receive(Duration::from_secs(2)).await.unwrap_err();
    assert!(err.is_connection_lost());
    assert!(!conn.is_connected());

    let frame = conn
        .receive(Duration::from_secs(2))
        .await
        .unwrap()
        .expect("message after reconnect");
    assert_eq!(frame.message_id(), Some("msg-2"));
    assert_eq!(frame.subscription(), Some(sub.as_str()));
    assert_eq!(conn.version(), Some("1.2"));

    conn.disconnect().await;
    broker.await.unwrap();
}

#[tokio::test]
async fn test_failover_to_second_host() {
    // Reserve a port, then free it so nothing is listening there.
    let (dead, dead_addr) = listener().await;
    drop(dead);

    let (listener, live_addr) = listener().await;
    tokio::spawn(async move {
        let mut side = BrokerSide::accept(&listener).await;
        side.handshake("1.1").await;
        side.drain().await;
    });

    let conn = Connection::connect(options(vec![dead_addr, live_addr.clone()]))
        .await
        .unwrap();
    assert_eq!(conn.current_host(), Some(&live_addr));
}

#[tokio::test]
async fn test_error_frame_drops_session() {
    let (listener, addr) = listener().await;

    tokio::spawn(async move {
        let mut side = BrokerSide::accept(&listener).await;
        side.handshake("1.1").await;
        side.write(Frame::new(Command::Error).header("message", "queue deleted"))
            .await;
        side.drain().await;
    });

    let mut conn = Connection::connect(options(vec![addr])).await.unwrap();
    let err = conn.receive(Duration::from_secs(2)).await.unwrap_err();
    assert!(matches!(err, StompError::Broker(ref m) if m == "queue deleted"));
    assert!(!conn.is_connected());
}
