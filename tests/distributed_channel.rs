//! Channel fan-out across two front-ends through the broker.

mod common;

use std::time::Duration;

use common::{Cluster, TestClient};
use weft::kwargs;

async fn subscribe_and_settle(client: &mut TestClient, channel: &str) {
    client
        .send("channels.subscribe", kwargs!(channel = channel))
        .await;
    client.send("echo", kwargs!(text = "sync")).await;
    client.recv("echo").await;
}

#[tokio::test]
async fn cross_server_channel_delivers_exactly_once() {
    let mut cluster = Cluster::start().await;
    cluster.start_frontend(5).await;
    cluster.start_frontend(5).await;

    // A on server 1; B and C on server 2.
    let mut a = cluster.client(0).await;
    let mut b = cluster.client(1).await;
    let mut c = cluster.client(1).await;
    for client in [&mut a, &mut b, &mut c] {
        subscribe_and_settle(client, "foo_channel").await;
    }

    b.send(
        "channels.publish",
        kwargs!(channel = "foo_channel", text = "hello"),
    )
    .await;

    for client in [&mut a, &mut b, &mut c] {
        let message = client.recv("message_from_channel").await;
        assert_eq!(message.kwargs["text"], "hello");
        assert_eq!(message.kwargs["channel"], "foo_channel");
        client
            .expect_silence("message_from_channel", Duration::from_millis(300))
            .await;
    }
}
