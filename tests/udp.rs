//! End to end over real UDP sockets on localhost.


use std::time::Duration;

use dtls_duplex::{Config, Credentials, Error, Event};
use socket_common::*;
use tokio::net::UdpSocket;

async fn recv(server: &UdpSocket) -> (Vec<u8>, std::net::SocketAddr) {
    let mut buf = [0u8; 2048];
    let (n, from) = tokio::time::timeout(Duration::from_secs(5), server.recv_from(&mut buf))
        .await
        .expect("server recv timeout")
        .expect("server recv");
    (buf[..n].to_vec(), from)
}

fn config_for(server: &UdpSocket) -> Config {
    let addr = server.local_addr().unwrap();
    Config::builder()
        .host(addr.ip().to_string())
        .port(addr.port())
        .bind_addr("127.0.0.1:0".parse().unwrap())
        .key(data_path("client_key_sec1.der"))
        .peer_public_key(data_path("server_pub.der"))
        .build()
        .unwrap()
}

#[tokio::test]
async fn udp_session_end_to_end() {
    let _ = env_logger::try_init();

    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (engine, _log) = ScriptedEngine::new();
    let engine = engine.pending_close_notify();

    let mut socket = dtls_duplex::connect(config_for(&server), |_c: Credentials, _d: bool| {
        Ok::<_, Error>(engine)
    })
    .await
    .expect("connect");

    let (hello, client) = recv(&server).await;
    assert_eq!(hello, CLIENT_HELLO);
    assert_eq!(client, socket.local_addr());

    server.send_to(SERVER_HELLO, client).await.unwrap();
    server.send_to(b"app:welcome", client).await.unwrap();

    assert!(matches!(next_event(&mut socket).await, Event::Connected));
    match next_event(&mut socket).await {
        Event::Data(d) => assert_eq!(d, b"welcome"),
        ev => panic!("expected Data, got {:?}", ev),
    }

    socket.write(b"hi server".to_vec()).await.expect("write");
    let (record, _) = recv(&server).await;
    assert_eq!(record, b"rec0:hi server");

    socket.end();
    let (notify, _) = recv(&server).await;
    assert_eq!(notify, CLOSE_NOTIFY);

    let events = events_until_closed(&mut socket).await;
    assert!(matches!(events[0], Event::End));
    assert!(matches!(events[1], Event::Closed { had_error: false }));
}

#[tokio::test]
async fn udp_ping() {
    let _ = env_logger::try_init();

    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let socket = dtls_duplex::connect(config_for(&server), |_c: Credentials, _d: bool| {
        Ok::<_, Error>(ScriptedEngine::new().0)
    })
    .await
    .expect("connect");

    let (hello, _) = recv(&server).await;
    assert_eq!(hello, CLIENT_HELLO);

    socket.ping();
    let (probe, _) = recv(&server).await;
    assert_eq!(probe, vec![0x70]);
}

#[tokio::test]
async fn unresolvable_host_fails() {
    let _ = env_logger::try_init();

    let config = Config::builder()
        .host("host.invalid")
        .port(5684)
        .key(data_path("client_key.pem"))
        .peer_public_key(data_path("server_pub.pem"))
        .build()
        .unwrap();

    let res = dtls_duplex::connect(config, |_c: Credentials, _d: bool| {
        Ok::<_, Error>(ScriptedEngine::new().0)
    })
    .await;
    assert!(matches!(res, Err(Error::Resolve(_))), "got {:?}", res);
}
