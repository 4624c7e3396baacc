//! Channel fan-out on a single front-end.

mod common;

use std::time::Duration;

use common::{Cluster, TestClient};
use weft::kwargs;

/// Forces the server to have processed everything this client sent so
/// far: per-connection dispatch is sequential, so an answered echo means
/// the earlier messages are done.
async fn settle(client: &mut TestClient) {
    client.send("echo", kwargs!(text = "sync")).await;
    client.recv("echo").await;
}

#[tokio::test]
async fn channel_fan_out_reaches_every_subscriber_exactly_once() {
    let mut cluster = Cluster::start().await;
    cluster.start_frontend(5).await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        let mut client = cluster.client(0).await;
        client
            .send("channels.subscribe", kwargs!(channel = "foo_channel"))
            .await;
        settle(&mut client).await;
        clients.push(client);
    }

    clients[0]
        .send(
            "channels.publish",
            kwargs!(channel = "foo_channel", text = "hello"),
        )
        .await;

    for client in &mut clients {
        let message = client.recv("message_from_channel").await;
        assert_eq!(message.kwargs["text"], "hello");
        assert_eq!(message.kwargs["channel"], "foo_channel");
        client
            .expect_silence("message_from_channel", Duration::from_millis(300))
            .await;
    }
}

#[tokio::test]
async fn unsubscribed_clients_stop_receiving() {
    let mut cluster = Cluster::start().await;
    cluster.start_frontend(5).await;

    let mut publisher = cluster.client(0).await;
    let mut leaver = cluster.client(0).await;
    for client in [&mut publisher, &mut leaver] {
        client
            .send("channels.subscribe", kwargs!(channel = "foo_channel"))
            .await;
        settle(client).await;
    }

    leaver
        .send("channels.unsubscribe", kwargs!(channel = "foo_channel"))
        .await;
    settle(&mut leaver).await;

    publisher
        .send(
            "channels.publish",
            kwargs!(channel = "foo_channel", text = "still here"),
        )
        .await;

    assert_eq!(
        publisher.recv("message_from_channel").await.kwargs["text"],
        "still here"
    );
    leaver
        .expect_silence("message_from_channel", Duration::from_millis(300))
        .await;
}
