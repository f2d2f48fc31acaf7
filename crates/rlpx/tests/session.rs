//! End-to-end session tests over in-memory pipes and TCP.

use std::{net::Ipv4Addr, time::Duration};

use devp2p::{ProtocolSpec, ProtocolStream, Session as _, SessionHandle, StreamError, Transport};
use devp2p_enode::id_from_secret;
use devp2p_rlpx::{Rlpx, RlpxError, Session, SessionContext};
use secp256k1::SecretKey;
use tokio::io::DuplexStream;

fn ctx(client: &str, protocols: Vec<ProtocolSpec>) -> SessionContext {
    SessionContext {
        secret_key: SecretKey::new(&mut rand::thread_rng()),
        client: client.to_string(),
        listen_port: 30303,
        protocols,
    }
}

async fn session_pair(
    dialer: &SessionContext,
    listener: &SessionContext,
) -> (Result<Session<DuplexStream>, RlpxError>, Result<Session<DuplexStream>, RlpxError>) {
    let (dial_io, listen_io) = tokio::io::duplex(1 << 16);
    let remote_id = id_from_secret(&listener.secret_key);
    let ip = Ipv4Addr::LOCALHOST.into();
    tokio::join!(dialer.connect(dial_io, remote_id, ip), listener.accept(listen_io, ip))
}

#[tokio::test]
async fn negotiates_only_common_capabilities() {
    let local = ctx(
        "local/0.1.0",
        vec![ProtocolSpec::new("eth", 66, 17), ProtocolSpec::new("snap", 1, 8)],
    );
    let remote = ctx(
        "remote/0.1.0",
        vec![ProtocolSpec::new("eth", 66, 17), ProtocolSpec::new("les", 2, 10)],
    );

    let (dialed, accepted) = session_pair(&local, &remote).await;
    let mut dialed = dialed.unwrap();
    let accepted = accepted.unwrap();

    let caps: Vec<_> = dialed.shared_capabilities().iter().cloned().collect();
    assert_eq!(caps.len(), 1);
    assert_eq!(caps[0].name, "eth");
    assert_eq!(caps[0].version, 66);
    assert_eq!(caps[0].offset, 16);
    assert_eq!(caps[0].length, 17);
    assert_eq!(dialed.shared_capabilities(), accepted.shared_capabilities());

    assert_eq!(dialed.info().client, "remote/0.1.0");
    assert_eq!(dialed.remote_id(), id_from_secret(&remote.secret_key));

    let streams = dialed.take_streams();
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].protocol().name, "eth");
    // streams yield once
    assert!(dialed.take_streams().is_empty());
}

#[tokio::test]
async fn streams_deliver_messages_in_order() {
    let local = ctx("local/0.1.0", vec![ProtocolSpec::new("eth", 66, 17)]);
    let remote = ctx("remote/0.1.0", vec![ProtocolSpec::new("eth", 66, 17)]);

    let (dialed, accepted) = session_pair(&local, &remote).await;
    let (mut dialed, mut accepted) = (dialed.unwrap(), accepted.unwrap());

    let dial_stream = dialed.take_streams().remove(0);
    let mut accept_stream = accepted.take_streams().remove(0);

    let writer = dial_stream.stream_writer();
    writer.write_msg(0x03, b"first request").await.unwrap();
    writer.write_msg(0x04, b"second request").await.unwrap();

    let msg = accept_stream.read_msg().await.unwrap();
    assert_eq!(msg.code, 0x03);
    assert_eq!(&msg.data[..], b"first request");
    let msg = accept_stream.read_msg().await.unwrap();
    assert_eq!(msg.code, 0x04);
    assert_eq!(&msg.data[..], b"second request");

    // codes outside the negotiated window are rejected locally
    assert!(matches!(
        writer.write_msg(17, b"nope").await,
        Err(RlpxError::MessageCodeOutOfRange(17))
    ));
}

#[tokio::test]
async fn ping_pong_is_invisible_to_streams() {
    let local = ctx("local/0.1.0", vec![ProtocolSpec::new("eth", 66, 17)]);
    let remote = ctx("remote/0.1.0", vec![ProtocolSpec::new("eth", 66, 17)]);

    let (dialed, accepted) = session_pair(&local, &remote).await;
    let (mut dialed, mut accepted) = (dialed.unwrap(), accepted.unwrap());

    let dial_stream = dial_streams_first(&mut dialed);
    let mut accept_stream = accepted.take_streams().remove(0);

    // the responder answers the ping internally
    dialed.ping().await.unwrap();

    // neither the ping nor the pong surfaces on the capability stream
    assert!(matches!(
        accept_stream.read_msg_timeout(Duration::from_millis(100)).await,
        Err(StreamError::Timeout)
    ));

    // ordinary traffic still flows afterwards
    dial_stream.stream_writer().write_msg(0x01, b"after ping").await.unwrap();
    let msg = accept_stream.read_msg().await.unwrap();
    assert_eq!(msg.code, 0x01);
}

fn dial_streams_first(session: &mut Session<DuplexStream>) -> devp2p_rlpx::RlpxStream<DuplexStream> {
    session.take_streams().remove(0)
}

#[tokio::test]
async fn no_shared_capabilities_is_a_useless_peer() {
    let local = ctx("local/0.1.0", vec![ProtocolSpec::new("eth", 66, 17)]);
    let remote = ctx("remote/0.1.0", vec![ProtocolSpec::new("les", 2, 10)]);

    let (dialed, accepted) = session_pair(&local, &remote).await;
    assert!(matches!(dialed, Err(RlpxError::UselessPeer)));
    assert!(matches!(accepted, Err(RlpxError::UselessPeer)));
}

#[tokio::test]
async fn self_connect_is_rejected() {
    let local = ctx("local/0.1.0", vec![ProtocolSpec::new("eth", 66, 17)]);

    let (dial_io, listen_io) = tokio::io::duplex(1 << 16);
    let ip = Ipv4Addr::LOCALHOST.into();
    let (dialed, accepted) = tokio::join!(
        local.connect(dial_io, id_from_secret(&local.secret_key), ip),
        local.accept(listen_io, ip),
    );
    assert!(matches!(dialed, Err(RlpxError::ConnectedToSelf)));
    assert!(matches!(accepted, Err(RlpxError::ConnectedToSelf)));
}

#[tokio::test]
async fn busy_close_reports_too_many_peers() {
    let local = ctx("local/0.1.0", vec![ProtocolSpec::new("eth", 66, 17)]);
    let remote = ctx("remote/0.1.0", vec![ProtocolSpec::new("eth", 66, 17)]);

    let (dialed, accepted) = session_pair(&local, &remote).await;
    let (mut dialed, accepted) = (dialed.unwrap(), accepted.unwrap());

    let mut dial_stream = dialed.take_streams().remove(0);
    accepted.close_busy();

    // the dialer's stream unblocks with a closed error
    assert!(matches!(dial_stream.read_msg().await, Err(RlpxError::SessionClosed)));
    let reason = dialed.close_reason().unwrap();
    assert!(reason.contains("too many peers"), "unexpected reason: {reason}");
}

#[tokio::test]
async fn tcp_transport_end_to_end() {
    let server_key = SecretKey::new(&mut rand::thread_rng());
    let client_key = SecretKey::new(&mut rand::thread_rng());
    let protocols = vec![ProtocolSpec::new("eth", 66, 17)];

    let server = Rlpx::new();
    let server_record = devp2p::NodeRecord::from_secret_key(
        "127.0.0.1:0".parse().unwrap(),
        &server_key,
    );
    server
        .setup(
            server_key,
            protocols.clone(),
            devp2p::Info {
                client: "server/0.1.0".into(),
                enode: server_record,
                capabilities: protocols.clone(),
                listen_port: 0,
            },
            "127.0.0.1:0".parse().unwrap(),
        )
        .await
        .unwrap();
    let server_addr = server.local_addr().unwrap();

    let client = Rlpx::new();
    let client_record =
        devp2p::NodeRecord::from_secret_key("127.0.0.1:0".parse().unwrap(), &client_key);
    client
        .setup(
            client_key,
            protocols.clone(),
            devp2p::Info {
                client: "client/0.1.0".into(),
                enode: client_record,
                capabilities: protocols,
                listen_port: 0,
            },
            "127.0.0.1:0".parse().unwrap(),
        )
        .await
        .unwrap();

    let target = devp2p::NodeRecord {
        address: server_addr.ip(),
        tcp_port: server_addr.port(),
        udp_port: server_addr.port(),
        id: id_from_secret(&server_key),
    };

    let target_str = target.to_string();
    let (dialed, accepted) = tokio::join!(
        client.dial(&target_str, Duration::from_secs(10)),
        server.accept(),
    );
    let mut dialed = dialed.unwrap();
    let mut accepted = accepted.unwrap();

    assert_eq!(dialed.remote_id(), id_from_secret(&server_key));
    assert_eq!(accepted.remote_id(), id_from_secret(&client_key));

    let stream = dialed.take_streams().remove(0);
    let mut accept_stream = accepted.take_streams().remove(0);
    stream.stream_writer().write_msg(0x00, b"status over tcp").await.unwrap();
    let msg = accept_stream.read_msg().await.unwrap();
    assert_eq!(msg.code, 0x00);
    assert_eq!(&msg.data[..], b"status over tcp");

    client.close().await.unwrap();
    server.close().await.unwrap();
}
