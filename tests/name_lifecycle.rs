//! Disconnect handling and name reuse under both name-release policies.

mod common;

use chatd::client::{Client, ClientError};
use chatd::config::{NameRelease, ServerConfig};
use chatd::session::codes;
use common::*;

#[tokio::test]
async fn disconnected_client_stops_receiving_and_others_continue() {
    let server = start_test_server().await;
    let mut a = join(&server, "a").await;
    let b = join(&server, "b").await;
    let mut c = join(&server, "c").await;

    b.close().await.unwrap();
    wait_released(server.registry(), "b").await;

    a.send("after b left").await.unwrap();
    assert_eq!(recv_within(&mut c).await.body, "after b left");
    assert_eq!(server.registry().len(), 2);

    server.shutdown().await;
}

#[tokio::test]
async fn released_name_can_be_registered_again() {
    let server = start_test_server().await;
    let mut a = join(&server, "a").await;

    let bob = join(&server, "bob").await;
    bob.close().await.unwrap();
    wait_released(server.registry(), "bob").await;

    let mut bob = join(&server, "bob").await;
    a.send("welcome back").await.unwrap();
    assert_eq!(recv_within(&mut bob).await.body, "welcome back");

    server.shutdown().await;
}

#[tokio::test]
async fn dropped_connection_releases_name() {
    let server = start_test_server().await;
    let bob = join(&server, "bob").await;
    drop(bob);
    wait_released(server.registry(), "bob").await;
    server.shutdown().await;
}

#[tokio::test]
async fn reserved_name_stays_taken_after_disconnect() {
    let server = start_test_server_with(ServerConfig {
        name_release: NameRelease::Reserve,
        ..Default::default()
    })
    .await;
    let mut a = join(&server, "a").await;

    let bob = join(&server, "bob").await;
    bob.close().await.unwrap();

    // The entry stays but its queue closes once the session ends
    for _ in 0..200 {
        if server.registry().outbox("bob").is_some_and(|o| o.is_closed()) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert!(server.registry().contains("bob"));

    let mut again = Client::connect(server.addr)
        .await
        .unwrap()
        .register("bob")
        .await
        .unwrap();
    match again.recv().await {
        Err(ClientError::Rejected { code, .. }) => assert_eq!(code, codes::NAME_TAKEN),
        other => panic!("expected rejection, got {:?}", other),
    }

    // Broadcasts skip the closed entry
    let mut c = join(&server, "c").await;
    a.send("anyone?").await.unwrap();
    assert_eq!(recv_within(&mut c).await.body, "anyone?");
    assert_silent(&mut a).await;

    server.shutdown().await;
}
