//! The smallest round trip: a client talks to one front-end.

mod common;

use common::Cluster;
use weft::kwargs;

#[tokio::test]
async fn echo_round_trip() {
    let mut cluster = Cluster::start().await;
    cluster.start_frontend(5).await;

    let mut client = cluster.client(0).await;
    client.send("echo", kwargs!(text = "hi")).await;

    let reply = client.recv("echo").await;
    assert_eq!(reply.path, "echo");
    assert_eq!(reply.kwargs["text"], "Echo: hi");
}

#[tokio::test]
async fn sign_in_replies_with_the_uid() {
    let mut cluster = Cluster::start().await;
    cluster.start_frontend(5).await;

    let mut client = cluster.client(0).await;
    client.send("sign_id", kwargs!(username = "user7")).await;

    let reply = client.recv("sign_id").await;
    assert_eq!(reply.kwargs["uid"], 7);
}
