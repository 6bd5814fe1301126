//! Client and server over real QUIC on localhost.

use std::{sync::Arc, time::Duration};

use leapbrush_client::{
    CancelToken, Connection, Connector, QuicConnector, Scheme, ServerEndpoint, Session,
    StreamFailure, TransportConfig, TransportError,
};
use leapbrush_proto::{
    Payload, codec,
    payloads::{
        call::{Call, Method, StatusCode},
        device::{RegisterDeviceRequest, UpdateDeviceRequest},
        rpc::{QueryUsersRequest, RpcRequest},
        types::UserState,
    },
};
use leapbrush_server::{SERVER_VERSION, Server, ServerRuntimeConfig, WorldConfig};

const LIMIT: Duration = Duration::from_secs(10);

fn start_server() -> (Arc<Server>, ServerEndpoint, tokio::task::JoinHandle<()>) {
    let config = ServerRuntimeConfig {
        bind_address: "127.0.0.1:0".into(),
        world: WorldConfig { ping_interval: Duration::from_millis(100), ..WorldConfig::default() },
        ..ServerRuntimeConfig::default()
    };
    let server = Arc::new(Server::bind(config).expect("bind"));
    let port = server.local_addr().expect("addr").port();
    let endpoint = ServerEndpoint::new(Scheme::Plaintext, "127.0.0.1", port);

    let running = Arc::clone(&server);
    let task = tokio::spawn(async move {
        running.run().await.expect("server run");
    });
    (server, endpoint, task)
}

#[tokio::test]
async fn update_listen_and_rpc_over_quic() {
    let (server, endpoint, task) = start_server();
    let cancel = CancelToken::new();

    let session = tokio::time::timeout(
        LIMIT,
        Session::connect(&QuicConnector::new(), endpoint, TransportConfig::development()),
    )
    .await
    .expect("connect in time")
    .expect("connect");

    let mut updates = session.open_update_stream(&cancel).await.expect("open updates");
    updates
        .write(
            UpdateDeviceRequest {
                user_state: UserState { user_name: "alice".into(), ..Default::default() },
                ..Default::default()
            },
            &cancel,
        )
        .await
        .expect("write");
    let ack = tokio::time::timeout(LIMIT, updates.close(&cancel))
        .await
        .expect("ack in time")
        .expect("close");
    assert!(ack.is_some());

    let request = RegisterDeviceRequest { user_name: "alice".into(), app_version: "1.0".into() };
    let mut view = session.open_state_stream(request, &cancel).await.expect("listen");
    let first = tokio::time::timeout(LIMIT, view.read_next(&cancel))
        .await
        .expect("snapshot in time")
        .expect("snapshot");
    assert_eq!(first.server_info.expect("server info").server_version, SERVER_VERSION);

    let response = session
        .rpc(RpcRequest { user_name: "alice".into(), query_users: Some(QueryUsersRequest {}) }, &cancel)
        .await
        .expect("rpc");
    let names: Vec<_> = response
        .query_users
        .expect("query users")
        .results
        .into_iter()
        .map(|r| r.user_name)
        .collect();
    assert_eq!(names, vec!["alice".to_string()]);

    server.shutdown();
    let err = tokio::time::timeout(LIMIT, async {
        loop {
            if let Err(err) = view.read_next(&cancel).await {
                return err;
            }
        }
    })
    .await
    .expect("listener ends in time");
    assert!(matches!(err, TransportError::Stream { kind: StreamFailure::Aborted, .. }), "{err:?}");

    session.close_and_wait().await;
    tokio::time::timeout(LIMIT, task).await.expect("server stops in time").expect("join");
}

#[tokio::test]
async fn shutdown_does_not_wait_for_a_stalled_client() {
    let (server, endpoint, task) = start_server();
    let connection = tokio::time::timeout(
        LIMIT,
        QuicConnector::new().connect(&endpoint, &TransportConfig::development()),
    )
    .await
    .expect("connect in time")
    .expect("connect");

    // Announce a listener but never send RegisterDevice.
    let (mut send, mut recv) = connection.open_bi().await.expect("open");
    codec::write_payload(&mut send, Payload::Call(Call { method: Method::RegisterAndListen }))
        .await
        .expect("call");
    tokio::time::sleep(Duration::from_millis(100)).await;

    server.shutdown();
    let trailer = tokio::time::timeout(LIMIT, codec::read_payload(&mut recv))
        .await
        .expect("trailer in time")
        .expect("read");
    let Some(Payload::Status(status)) = trailer else {
        panic!("expected status, got {trailer:?}");
    };
    assert_eq!(status.code, StatusCode::Unavailable);

    tokio::time::timeout(LIMIT, task).await.expect("server stops in time").expect("join");
    drop((send, recv));
    connection.close();
}

#[tokio::test]
async fn nothing_listening_is_a_connection_error() {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").expect("reserve port");
    let port = socket.local_addr().expect("addr").port();
    drop(socket);

    let config = TransportConfig {
        connect_timeout: Duration::from_millis(500),
        ..TransportConfig::development()
    };
    let endpoint = ServerEndpoint::new(Scheme::Plaintext, "127.0.0.1", port);
    let err = Session::connect(&QuicConnector::new(), endpoint, config)
        .await
        .expect_err("no server");

    assert!(matches!(err, TransportError::Connection { .. }), "{err:?}");
    assert!(err.triggers_reconnect());
}
