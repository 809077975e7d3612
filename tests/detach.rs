//! Channel detachment: inactivity detach, reattach on traffic, and
//! relay filtering while detached.

mod common;

use std::time::Duration;

use common::{FakeUpstream, TestClient, TestServer};
use tetherd::db::{Channel, MessageFilter};

#[tokio::test]
async fn detach_after_inactivity_then_reattach() {
    let server = TestServer::start().await;
    let user = server.add_user("ada", "secret", false).await;
    let fake = FakeUpstream::start().await;
    let network = server.add_network(user.id, "net", fake.addr, "ada").await;
    server
        .add_channel(
            network.id,
            Channel {
                name: "#a".into(),
                detach_after: Duration::from_secs(2),
                detach_on: MessageFilter::Message,
                reattach_on: MessageFilter::Message,
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

    // Nobody speaks; the inactivity sweep detaches the channel and the
    // client is parted, while the upstream stays joined.
    let part = client.expect_cmd("PART").await;
    assert_eq!(part.param(0), Some("#a"));
    assert_eq!(part.source_name(), Some("ada"));

    let channels = server.db.list_channels(network.id).await.unwrap();
    assert!(channels[0].detached, "detach flag must be persisted");

    // Matching traffic reattaches: JOIN, state sync, then the message.
    conn.send(":zoe!z@fake PRIVMSG #a :anyone around?").await;
    let join = client.expect_cmd("JOIN").await;
    assert_eq!(join.param(0), Some("#a"));
    client.expect_cmd("366").await;
    let msg = client.expect_cmd("PRIVMSG").await;
    assert_eq!(msg.param(1), Some("anyone around?"));

    let channels = server.db.list_channels(network.id).await.unwrap();
    assert!(!channels[0].detached, "reattach must be persisted");

    // The upstream never saw a PART through any of this.
    conn.send("PING :sync").await;
    conn.expect_cmd("PONG").await;
    assert!(
        !conn.log_lines().iter().any(|l| l.starts_with("PART")),
        "detach must not leak a PART upstream"
    );
}

#[tokio::test]
async fn detached_channel_relays_highlights_only() {
    let server = TestServer::start().await;
    let user = server.add_user("ada", "secret", false).await;
    let fake = FakeUpstream::start().await;
    let network = server.add_network(user.id, "net", fake.addr, "ada").await;
    server
        .add_channel(
            network.id,
            Channel {
                name: "#quiet".into(),
                detached: true,
                // relay-detached default resolves to highlight.
                relay_detached: MessageFilter::Default,
                reattach_on: MessageFilter::None,
                ..Default::default()
            },
        )
        .await;

    let mut client = TestClient::connect(server.addr).await;
    client
        .register_with_caps("ada", "ada/net", "secret", &["message-tags"])
        .await;

    let mut conn = fake.accept().await;
    conn.handshake("ada", &[]).await;
    // Detached channels are not auto-joined.
    conn.assert_never_joined("#quiet");

    // Chatter is suppressed.
    conn.send(":zoe!z@fake PRIVMSG #quiet :just chatting").await;
    client.expect_silence(Duration::from_millis(300)).await;

    // Highlights come through, marked as detached relay.
    conn.send(":zoe!z@fake PRIVMSG #quiet :ada: look at this").await;
    let relayed = client.expect_cmd("PRIVMSG").await;
    assert_eq!(relayed.param(1), Some("ada: look at this"));
    assert_eq!(relayed.tag_value("batch"), Some("soju.im/detached"));
}

#[tokio::test]
async fn zero_detach_after_disables_the_sweep() {
    let server = TestServer::start().await;
    let user = server.add_user("ada", "secret", false).await;
    let fake = FakeUpstream::start().await;
    let network = server.add_network(user.id, "net", fake.addr, "ada").await;
    server
        .add_channel(
            network.id,
            Channel {
                name: "#a".into(),
                detach_after: Duration::ZERO,
                detach_on: MessageFilter::Message,
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
    client.expect_cmd("JOIN").await;

    // Give the sweep plenty of chances; nothing should happen.
    tokio::time::sleep(Duration::from_secs(3)).await;
    client.expect_silence(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn joining_a_detached_channel_reattaches_without_upstream_join() {
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

    // Detach by policy update + sweep.
    client
        .send("PRIVMSG BouncerServ :channel update #a -detach-after 1s")
        .await;
    client.expect_cmd("NOTICE").await;
    let part = client.expect_cmd("PART").await;
    assert_eq!(part.param(0), Some("#a"));

    // Client JOINs again: the flag clears and state is synthesized from
    // the live view, with no new JOIN on the upstream wire.
    client.send("JOIN #a").await;
    let join = client.expect_cmd("JOIN").await;
    assert_eq!(join.param(0), Some("#a"));
    let names = client.expect_cmd("353").await;
    assert!(names.params[3].contains("zoe"));

    conn.send("PING :sync").await;
    conn.expect_cmd("PONG").await;
    // Only the original auto-join ever hit the wire.
    let joins = conn
        .log_lines()
        .iter()
        .filter(|l| l.starts_with("JOIN"))
        .count();
    assert_eq!(joins, 1);
}
