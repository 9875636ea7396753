//! End-to-end tests for registration and relay over real TCP connections.

mod common;

use std::collections::HashMap;

use chatd::client::{Client, ClientError};
use chatd::protocol::Envelope;
use chatd::session::codes;
use common::*;

#[tokio::test]
async fn alice_says_hi_to_bob() {
    let server = start_test_server().await;
    let mut alice = join(&server, "alice").await;
    let mut bob = join(&server, "bob").await;

    alice.send("hi").await.unwrap();

    assert_eq!(recv_within(&mut bob).await, Envelope::new("alice", "hi"));
    assert_silent(&mut alice).await;

    server.shutdown().await;
}

#[tokio::test]
async fn second_alice_is_rejected_before_any_exchange() {
    let server = start_test_server().await;
    let mut alice = join(&server, "alice").await;

    let mut impostor = Client::connect(server.addr)
        .await
        .unwrap()
        .register("alice")
        .await
        .unwrap();

    match impostor.recv().await {
        Err(ClientError::Rejected { code, .. }) => assert_eq!(code, codes::NAME_TAKEN),
        other => panic!("expected rejection, got {:?}", other),
    }
    // The server closes the refused connection
    assert!(matches!(impostor.recv().await, Ok(None) | Err(ClientError::Io(_))));

    // The first alice is untouched
    assert_eq!(server.registry().len(), 1);
    let mut bob = join(&server, "bob").await;
    bob.send("still there?").await.unwrap();
    assert_eq!(recv_within(&mut alice).await.body, "still there?");

    server.shutdown().await;
}

#[tokio::test]
async fn handshake_line_ending_is_stripped() {
    let server = start_test_server().await;
    let _carol = Client::connect(server.addr)
        .await
        .unwrap()
        .register("carol\n")
        .await
        .unwrap();
    wait_registered(server.registry(), "carol").await;
    assert_eq!(server.registry().names(), vec!["carol".to_string()]);

    server.shutdown().await;
}

#[tokio::test]
async fn empty_name_is_rejected() {
    let server = start_test_server().await;
    let mut nobody = Client::connect(server.addr)
        .await
        .unwrap()
        .register("\r\n")
        .await
        .unwrap();

    match nobody.recv().await {
        Err(ClientError::Rejected { code, .. }) => assert_eq!(code, codes::INVALID_NAME),
        other => panic!("expected rejection, got {:?}", other),
    }
    assert!(server.registry().is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn three_clients_each_message_reaches_the_other_two_once() {
    let server = start_test_server().await;
    let mut a = join(&server, "a").await;
    let mut b = join(&server, "b").await;
    let mut c = join(&server, "c").await;

    a.send("from a").await.unwrap();

    assert_eq!(recv_within(&mut b).await, Envelope::new("a", "from a"));
    assert_eq!(recv_within(&mut c).await, Envelope::new("a", "from a"));
    assert_silent(&mut a).await;
    assert_silent(&mut b).await;
    assert_silent(&mut c).await;

    server.shutdown().await;
}

#[tokio::test]
async fn empty_body_is_relayed() {
    let server = start_test_server().await;
    let mut a = join(&server, "a").await;
    let mut b = join(&server, "b").await;

    a.send("").await.unwrap();
    assert_eq!(recv_within(&mut b).await, Envelope::new("a", ""));

    server.shutdown().await;
}

#[tokio::test]
async fn messages_from_one_sender_arrive_in_order() {
    let server = start_test_server().await;
    let mut a = join(&server, "a").await;
    let mut b = join(&server, "b").await;

    for i in 0..50 {
        a.send(&format!("line {i}")).await.unwrap();
    }
    for i in 0..50 {
        assert_eq!(recv_within(&mut b).await.body, format!("line {i}"));
    }

    server.shutdown().await;
}

#[tokio::test]
async fn concurrent_senders_deliver_exactly_the_union() {
    const CLIENTS: usize = 4;
    const PER_CLIENT: usize = 20;

    let server = start_test_server().await;
    let mut streams = Vec::new();
    for i in 0..CLIENTS {
        streams.push(join(&server, &format!("user{i}")).await);
    }

    let tasks = streams.into_iter().enumerate().map(|(i, stream)| {
        let name = format!("user{i}");
        let (mut sender, mut receiver) = stream.split();
        tokio::spawn(async move {
            let send = async {
                for n in 0..PER_CLIENT {
                    sender.send(&format!("{name}:{n}")).await.unwrap();
                }
            };
            let receive = async {
                let mut got = Vec::new();
                while got.len() < (CLIENTS - 1) * PER_CLIENT {
                    let next = tokio::time::timeout(std::time::Duration::from_secs(5), receiver.recv())
                        .await
                        .expect("timed out waiting for broadcast")
                        .unwrap()
                        .expect("stream ended early");
                    got.push(next);
                }
                got
            };
            let ((), got) = tokio::join!(send, receive);
            (name, got, receiver)
        })
    });

    let results = futures::future::join_all(tasks).await;

    for result in results {
        let (name, got, _receiver) = result.unwrap();
        let mut per_author: HashMap<String, Vec<String>> = HashMap::new();
        for env in got {
            assert_ne!(env.author, name, "{name} received its own message");
            assert!(env.body.starts_with(&format!("{}:", env.author)));
            per_author.entry(env.author).or_default().push(env.body);
        }
        assert_eq!(per_author.len(), CLIENTS - 1);
        for (author, bodies) in per_author {
            let expected: Vec<String> = (0..PER_CLIENT).map(|n| format!("{author}:{n}")).collect();
            assert_eq!(bodies, expected, "{name} saw a gap, duplicate or reorder from {author}");
        }
    }

    assert_eq!(server.router.stats().dropped(), 0);
    server.shutdown().await;
}
