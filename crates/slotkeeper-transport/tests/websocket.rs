//! Integration tests for the WebSocket transport.
//!
//! These spin up a real listener on an OS-assigned port and drive it with a
//! `tokio-tungstenite` client, so header capture and frame handling are
//! checked against the real handshake.

#[cfg(feature = "websocket")]
mod websocket {
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use slotkeeper_transport::{
        Connection, ForwardedHeaders, Incoming, Transport, TransportError, WebSocketConnection,
        WebSocketTransport,
    };
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::Message;

    type ClientWs = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn bind() -> (WebSocketTransport, String) {
        let transport = WebSocketTransport::bind("127.0.0.1:0")
            .await
            .expect("should bind")
            .with_forwarded_headers(ForwardedHeaders::Trust);
        let addr = transport.local_addr().expect("local addr").to_string();
        (transport, addr)
    }

    async fn accept_one(mut transport: WebSocketTransport) -> WebSocketConnection {
        let incoming = transport.accept().await.expect("should accept");
        incoming.upgrade().await.expect("should upgrade")
    }

    async fn connect_with_headers(addr: &str) -> ClientWs {
        let mut request = format!("ws://{addr}")
            .into_client_request()
            .expect("valid request");
        let headers = request.headers_mut();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.1.1.1".parse().unwrap());
        headers.insert("user-agent", "slotkeeper-test/1.0".parse().unwrap());
        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .expect("client should connect");
        ws
    }

    #[tokio::test]
    async fn test_accept_captures_peer_headers() {
        let (transport, addr) = bind().await;
        let server = tokio::spawn(accept_one(transport));

        let _client = connect_with_headers(&addr).await;
        let conn = server.await.expect("task should complete");

        assert!(conn.id().into_inner() > 0);
        assert_eq!(conn.peer().client_ip().to_string(), "203.0.113.7");
        assert_eq!(
            conn.peer().user_agent.as_deref(),
            Some("slotkeeper-test/1.0")
        );
    }

    #[tokio::test]
    async fn test_send_and_receive_text_frames() {
        let (transport, addr) = bind().await;
        let server = tokio::spawn(accept_one(transport));

        let mut client = connect_with_headers(&addr).await;
        let conn = server.await.unwrap();

        conn.send(r#"{"type":"left_queue"}"#).await.expect("send");
        let msg = client.next().await.unwrap().unwrap();
        assert_eq!(msg.into_text().unwrap().as_str(), r#"{"type":"left_queue"}"#);

        client
            .send(Message::Text(r#"{"type":"heartbeat"}"#.into()))
            .await
            .unwrap();
        let received = conn.recv().await.expect("recv").expect("data");
        assert_eq!(received, br#"{"type":"heartbeat"}"#);
    }

    #[tokio::test]
    async fn test_recv_returns_none_on_client_close() {
        let (transport, addr) = bind().await;
        let server = tokio::spawn(accept_one(transport));

        let mut client = connect_with_headers(&addr).await;
        let conn = server.await.unwrap();

        client.send(Message::Close(None)).await.unwrap();

        let result = conn.recv().await.expect("recv should not error");
        assert!(result.is_none(), "should return None on client close");
    }

    #[tokio::test]
    async fn test_close_delivers_code_and_reason() {
        let (transport, addr) = bind().await;
        let server = tokio::spawn(accept_one(transport));

        let mut client = connect_with_headers(&addr).await;
        let conn = server.await.unwrap();

        conn.close(4029, "rate limited").await.expect("close");

        match client.next().await {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), 4029);
                assert_eq!(frame.reason.as_str(), "rate limited");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_accept_ignores_proxy_headers_by_default() {
        let transport = WebSocketTransport::bind("127.0.0.1:0").await.unwrap();
        let addr = transport.local_addr().unwrap().to_string();
        let server = tokio::spawn(accept_one(transport));

        let _client = connect_with_headers(&addr).await;
        let conn = server.await.unwrap();

        assert_eq!(conn.peer().client_ip().to_string(), "127.0.0.1");
        assert!(conn.peer().forwarded_for.is_none());
    }

    #[tokio::test]
    async fn test_silent_peer_does_not_block_next_accept() {
        let (mut transport, addr) = bind().await;
        let _silent = tokio::net::TcpStream::connect(&addr).await.unwrap();
        let stalled = transport.accept().await.expect("should accept silent peer");

        let server = tokio::spawn(accept_one(transport));
        let client = tokio::time::timeout(Duration::from_secs(3), connect_with_headers(&addr)).await;

        assert!(client.is_ok(), "second client should connect");
        let conn = server.await.unwrap();
        assert_eq!(conn.peer().client_ip().to_string(), "203.0.113.7");
        drop(stalled);
    }

    #[tokio::test]
    async fn test_upgrade_times_out_for_silent_peer() {
        let mut transport = WebSocketTransport::bind("127.0.0.1:0")
            .await
            .unwrap()
            .with_handshake_timeout(Duration::from_millis(100));
        let addr = transport.local_addr().unwrap().to_string();
        let _silent = tokio::net::TcpStream::connect(&addr).await.unwrap();

        let incoming = transport.accept().await.unwrap();
        let result = incoming.upgrade().await;

        assert!(matches!(result, Err(TransportError::Handshake { .. })));
    }
}
