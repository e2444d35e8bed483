//! Integration tests for the WebSocket transport.
//!
//! These spin up a real WebSocket listener on a random port and talk to
//! it either through a raw `tokio-tungstenite` client or through our own
//! [`WebSocketDialer`].

#[cfg(feature = "websocket")]
mod websocket {
    use tether_transport::{
        Connection, Dialer, Transport, WebSocketDialer, WebSocketTransport,
    };

    async fn bind() -> (WebSocketTransport, String) {
        let transport = WebSocketTransport::bind("127.0.0.1:0")
            .await
            .expect("should bind");
        let addr = transport.local_addr().expect("local addr").to_string();
        (transport, addr)
    }

    async fn connect_client(
        addr: &str,
    ) -> tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    > {
        let url = format!("ws://{addr}");
        let (ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .expect("client should connect");
        ws
    }

    #[tokio::test]
    async fn test_websocket_accept_and_send_receive() {
        let (mut transport, addr) = bind().await;

        let server_handle = tokio::spawn(async move {
            transport.accept().await.expect("should accept")
        });

        let mut client_ws = connect_client(&addr).await;
        let server_conn = server_handle.await.expect("task should complete");

        assert!(server_conn.id().into_inner() > 0);
        assert!(server_conn.remote_address().is_some());

        server_conn
            .send(b"hello from server")
            .await
            .expect("send should succeed");

        use futures_util::StreamExt;
        let msg = client_ws.next().await.unwrap().unwrap();
        assert_eq!(msg.into_data().as_ref(), b"hello from server");

        use futures_util::SinkExt;
        use tokio_tungstenite::tungstenite::Message;
        client_ws
            .send(Message::Binary(b"hello from client".to_vec().into()))
            .await
            .unwrap();

        let received = server_conn
            .recv()
            .await
            .expect("recv should succeed")
            .expect("should have data");
        assert_eq!(received, b"hello from client");

        server_conn.close().await.expect("close should succeed");
    }

    #[tokio::test]
    async fn test_websocket_recv_returns_none_on_client_close() {
        let (mut transport, addr) = bind().await;

        let server_handle = tokio::spawn(async move {
            transport.accept().await.expect("should accept")
        });

        let mut client_ws = connect_client(&addr).await;
        let server_conn = server_handle.await.unwrap();

        use futures_util::SinkExt;
        use tokio_tungstenite::tungstenite::Message;
        client_ws.send(Message::Close(None)).await.unwrap();

        let result = server_conn.recv().await.expect("recv should not error");
        assert!(result.is_none(), "should return None on client close");
    }

    #[tokio::test]
    async fn test_dialer_round_trip_while_recv_pending() {
        let (mut transport, addr) = bind().await;

        let server_handle = tokio::spawn(async move {
            transport.accept().await.expect("should accept")
        });

        let dialer = WebSocketDialer::new(format!("ws://{addr}"));
        let client = dialer.dial().await.expect("should dial");
        let server_conn = server_handle.await.unwrap();

        // A pending recv on the server must not block its send.
        let server_conn = std::sync::Arc::new(server_conn);
        let reader = std::sync::Arc::clone(&server_conn);
        let pending = tokio::spawn(async move { reader.recv().await });

        server_conn.send(b"ping").await.expect("send while reading");
        assert_eq!(client.recv().await.unwrap().unwrap(), b"ping");

        client.send(b"pong").await.unwrap();
        let got = pending.await.unwrap().unwrap().unwrap();
        assert_eq!(got, b"pong");
    }

    #[tokio::test]
    async fn test_dialer_refused_reports_connect_failed() {
        let (transport, addr) = bind().await;
        drop(transport);

        let dialer = WebSocketDialer::new(format!("ws://{addr}"));
        let result = dialer.dial().await;
        assert!(matches!(
            result,
            Err(tether_transport::TransportError::ConnectFailed(_))
        ));
    }
}
