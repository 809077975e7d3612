//! Multi-upstream scoping: one unscoped client seeing several networks
//! through transparent channel renaming.

mod common;

use common::{FakeUpstream, TestClient, TestServer};

#[tokio::test]
async fn unscoped_client_sees_prefixed_channels() {
    let server = TestServer::start().await;
    let user = server.add_user("alice", "secret", false).await;

    let fake1 = FakeUpstream::start().await;
    let fake2 = FakeUpstream::start().await;
    server.add_network(user.id, "n1", fake1.addr, "alice").await;
    server.add_network(user.id, "n2", fake2.addr, "alice").await;

    let mut client = TestClient::connect(server.addr).await;
    client.register("alice", "alice", "secret").await;

    let mut conn1 = fake1.accept().await;
    conn1.handshake("alice", &[]).await;
    let mut conn2 = fake2.accept().await;
    conn2.handshake("alice", &[]).await;

    // A JOIN on n1 shows up under the n1/ prefix.
    conn1.send(":alice!a@fake JOIN #x").await;
    let join = client.expect_cmd("JOIN").await;
    assert_eq!(join.param(0), Some("n1/#x"));

    // Traffic in the renamed channel keeps the prefix.
    conn1.send(":zoe!z@fake PRIVMSG #x :hello").await;
    let msg = client.expect_cmd("PRIVMSG").await;
    assert_eq!(msg.param(0), Some("n1/#x"));

    // Messages to n2/#y unwrap to plain #y on the n2 wire.
    client.send("PRIVMSG n2/#y :hi").await;
    let sent = conn2.expect_cmd("PRIVMSG").await;
    assert_eq!(sent.param(0), Some("#y"));
    assert_eq!(sent.param(1), Some("hi"));
}

#[tokio::test]
async fn scoped_client_sees_only_its_network() {
    let server = TestServer::start().await;
    let user = server.add_user("alice", "secret", false).await;

    let fake1 = FakeUpstream::start().await;
    let fake2 = FakeUpstream::start().await;
    server.add_network(user.id, "n1", fake1.addr, "alice").await;
    server.add_network(user.id, "n2", fake2.addr, "alice").await;

    let mut client = TestClient::connect(server.addr).await;
    client.register("alice", "alice/n2", "secret").await;

    let mut conn1 = fake1.accept().await;
    conn1.handshake("alice", &[]).await;
    let mut conn2 = fake2.accept().await;
    conn2.handshake("alice", &[]).await;

    // n1 traffic is invisible to a client scoped to n2.
    conn1.send(":alice!a@fake JOIN #x").await;
    conn2.send(":alice!a@fake JOIN #y").await;
    let join = client.expect_cmd("JOIN").await;
    // Scoped clients see bare channel names.
    assert_eq!(join.param(0), Some("#y"));
    client.assert_never_saw("n1 traffic", |m| {
        m.params.iter().any(|p| p.contains("#x"))
    });
}

#[tokio::test]
async fn suffix_for_unknown_network_is_rejected() {
    let server = TestServer::start().await;
    server.add_user("alice", "secret", false).await;

    let mut client = TestClient::connect(server.addr).await;
    client.send("PASS secret").await;
    client.send("NICK alice").await;
    client.send("USER alice/nowhere 0 * :alice").await;
    client.expect_cmd("464").await;
}
