//! Upstream connection flow: auto-join, relay in both directions,
//! echo fan-out, server-time stamping.

mod common;

use common::{FakeUpstream, TestClient, TestServer};
use tetherd::db::Channel;

#[tokio::test]
async fn auto_join_skips_detached_channels() {
    let server = TestServer::start().await;
    let user = server.add_user("ada", "secret", false).await;
    let fake = FakeUpstream::start().await;
    let network = server.add_network(user.id, "net", fake.addr, "ada").await;
    server
        .add_channel(
            network.id,
            Channel {
                name: "#a".into(),
                ..Default::default()
            },
        )
        .await;
    server
        .add_channel(
            network.id,
            Channel {
                name: "#b".into(),
                detached: true,
                ..Default::default()
            },
        )
        .await;

    let mut client = TestClient::connect(server.addr).await;
    client.register("ada", "ada/net", "secret").await;

    let mut conn = fake.accept().await;
    conn.handshake("ada", &["server-time", "message-tags"]).await;

    // Exactly #a is joined.
    let join = conn.expect_cmd("JOIN").await;
    assert_eq!(join.param(0), Some("#a"));
    conn.assert_never_joined("#b");

    // Confirm the join; the client sees it for its own nick.
    conn.send(":ada!ada@fake JOIN #a").await;
    let join = client.expect_cmd("JOIN").await;
    assert_eq!(join.param(0), Some("#a"));
    assert_eq!(join.source_name(), Some("ada"));

    conn.send(":fake.server 353 ada = #a :@ada zoe").await;
    conn.send(":fake.server 366 ada #a :End of /NAMES list.").await;
    let names = client.expect_cmd("353").await;
    assert_eq!(names.param(2), Some("#a"));

    client.assert_never_saw("#b", |m| m.params.iter().any(|p| p.contains("#b")));
}

#[tokio::test]
async fn relay_both_directions_with_echo() {
    let server = TestServer::start().await;
    let user = server.add_user("ada", "secret", false).await;
    let fake = FakeUpstream::start().await;
    let network = server.add_network(user.id, "net", fake.addr, "ada").await;
    server
        .add_channel(
            network.id,
            Channel {
                name: "#a".into(),
                ..Default::default()
            },
        )
        .await;

    let mut client = TestClient::connect(server.addr).await;
    client.register("ada", "ada/net", "secret").await;

    let mut conn = fake.accept().await;
    conn.handshake("ada", &[]).await;
    conn.expect_cmd("JOIN").await;
    conn.send(":ada!ada@fake JOIN #a").await;
    conn.send(":fake.server 353 ada = #a :@ada zoe").await;
    conn.send(":fake.server 366 ada #a :End of /NAMES list.").await;
    client.expect_cmd("JOIN").await;

    // Upstream → client.
    conn.send(":zoe!z@fake PRIVMSG #a :hello ada").await;
    let relayed = client.expect_cmd("PRIVMSG").await;
    assert_eq!(relayed.source_name(), Some("zoe"));
    assert_eq!(relayed.param(1), Some("hello ada"));

    // A second client attaches and is synced into the channel.
    let mut other = TestClient::connect(server.addr).await;
    other.register("ada", "ada/net", "secret").await;
    let join = other.expect_cmd("JOIN").await;
    assert_eq!(join.param(0), Some("#a"));
    other.expect_cmd("366").await;

    // Client → upstream, echoed to the other client but not back to
    // the sender (echo-message was not negotiated).
    client.send("PRIVMSG #a :hi from ada").await;
    let sent = conn.expect_cmd("PRIVMSG").await;
    assert_eq!(sent.param(0), Some("#a"));
    assert_eq!(sent.param(1), Some("hi from ada"));

    let echoed = other.expect_cmd("PRIVMSG").await;
    assert_eq!(echoed.source_name(), Some("ada"));
    assert_eq!(echoed.param(1), Some("hi from ada"));
}

#[tokio::test]
async fn server_time_is_identical_across_downstreams() {
    let server = TestServer::start().await;
    let user = server.add_user("ada", "secret", false).await;
    let fake = FakeUpstream::start().await;
    let network = server.add_network(user.id, "net", fake.addr, "ada").await;
    server
        .add_channel(
            network.id,
            Channel {
                name: "#a".into(),
                ..Default::default()
            },
        )
        .await;

    let mut first = TestClient::connect(server.addr).await;
    first
        .register_with_caps("ada", "ada/net", "secret", &["server-time"])
        .await;

    let mut conn = fake.accept().await;
    conn.handshake("ada", &[]).await;
    conn.expect_cmd("JOIN").await;
    conn.send(":ada!ada@fake JOIN #a").await;
    first.expect_cmd("JOIN").await;

    let mut second = TestClient::connect(server.addr).await;
    second
        .register_with_caps("ada", "ada/net", "secret", &["server-time"])
        .await;
    second.expect_cmd("JOIN").await;

    conn.send(":zoe!z@fake PRIVMSG #a :tick").await;
    let at_first = first.expect_cmd("PRIVMSG").await;
    let at_second = second.expect_cmd("PRIVMSG").await;

    let t1 = at_first.server_time().expect("first copy carries time");
    let t2 = at_second.server_time().expect("second copy carries time");
    assert_eq!(t1, t2, "every fan-out copy shares one timestamp");
}

#[tokio::test]
async fn upstream_ping_answered_locally() {
    let server = TestServer::start().await;
    let user = server.add_user("ada", "secret", false).await;
    let fake = FakeUpstream::start().await;
    server.add_network(user.id, "net", fake.addr, "ada").await;

    let mut client = TestClient::connect(server.addr).await;
    client.register("ada", "ada/net", "secret").await;

    let mut conn = fake.accept().await;
    conn.handshake("ada", &[]).await;

    conn.send("PING :token-1").await;
    let pong = conn.expect_cmd("PONG").await;
    assert_eq!(pong.param(0), Some("token-1"));

    // The PING never reaches the client.
    client
        .expect_silence(std::time::Duration::from_millis(300))
        .await;
}
