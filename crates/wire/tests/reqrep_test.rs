//! Integration tests for the DEALER/ROUTER request/reply layer.
//!
//! Tests verify correlation-id matching, concurrent requests answered out of
//! order, timeouts, one-way messages and closing a client.

use std::sync::Arc;
use std::time::Duration;

use schwarm_wire::transport::Transport;
use schwarm_wire::{
    Message, RequestHandler, RequestSender, WireError, ZmqRequestClient, ZmqRequestServer,
};

const SETTLE: Duration = Duration::from_millis(200);
const TIMEOUT: Duration = Duration::from_secs(5);

async fn pair(port: u16) -> (Arc<ZmqRequestServer>, ZmqRequestClient) {
    let transport = Transport::tcp("127.0.0.1", port);
    let server = ZmqRequestServer::bind(&transport).await.unwrap();
    tokio::time::sleep(SETTLE).await;
    let client = ZmqRequestClient::connect(&transport, TIMEOUT).await.unwrap();
    tokio::time::sleep(SETTLE).await;
    (Arc::new(server), client)
}

#[tokio::test]
async fn single_request_reply() {
    let (server, client) = pair(17500).await;

    let request = Message::new("schwarm.worker.ping", &"ping".to_string()).unwrap();
    let cid = request.correlation_id;

    let server_handle = tokio::spawn(async move {
        let (token, msg) = server.recv_request().await.unwrap();
        assert_eq!(msg.topic, "schwarm.worker.ping");
        assert_eq!(msg.decode::<String>().unwrap(), "ping");

        let reply = Message::with_correlation(
            "schwarm.worker.ping.reply",
            &"pong".to_string(),
            msg.correlation_id,
        )
        .unwrap();
        server.send_reply(token, reply).await.unwrap();
    });

    let reply = client.request(request, Some(TIMEOUT)).await.unwrap();
    assert_eq!(reply.correlation_id, cid);
    assert_eq!(reply.decode::<String>().unwrap(), "pong");

    server_handle.await.unwrap();
}

#[tokio::test]
async fn replies_sent_out_of_order_reach_their_callers() {
    let (server, client) = pair(17510).await;
    let num_requests = 5u32;

    // Collect every request first, then answer in reverse order from
    // separate tasks while the server keeps its receive loop running.
    let server_handle = tokio::spawn(async move {
        let mut received = Vec::new();
        for _ in 0..num_requests {
            received.push(server.recv_request().await.unwrap());
        }
        let mut replies = Vec::new();
        for (token, msg) in received.into_iter().rev() {
            let server = Arc::clone(&server);
            replies.push(tokio::spawn(async move {
                let value: u32 = msg.decode().unwrap();
                let reply =
                    Message::with_correlation("schwarm.worker.run.reply", &(value * 10), msg.correlation_id)
                        .unwrap();
                server.send_reply(token, reply).await.unwrap();
            }));
        }
        for r in replies {
            r.await.unwrap();
        }
    });

    let client = Arc::new(client);
    let mut handles = Vec::new();
    for i in 0..num_requests {
        let c = Arc::clone(&client);
        handles.push(tokio::spawn(async move {
            let msg = Message::new("schwarm.worker.run", &i).unwrap();
            let reply = c.request(msg, Some(TIMEOUT)).await.unwrap();
            assert_eq!(reply.decode::<u32>().unwrap(), i * 10);
        }));
    }

    for h in handles {
        h.await.unwrap();
    }
    server_handle.await.unwrap();
}

#[tokio::test]
async fn request_timeout() {
    let (_server, client) = pair(17520).await;

    let msg = Message::new("schwarm.worker.run", &"never answered".to_string()).unwrap();
    let short_timeout = Duration::from_millis(300);

    match client.request(msg, Some(short_timeout)).await {
        Err(WireError::Timeout(d)) => assert_eq!(d, short_timeout),
        other => panic!("expected Timeout error, got: {other:?}"),
    }
}

#[tokio::test]
async fn one_way_message_is_delivered() {
    let (server, client) = pair(17530).await;

    let msg = Message::new("schwarm.worker.shutdown", &()).unwrap();
    client.notify(msg).await.unwrap();

    let (_token, received) = tokio::time::timeout(TIMEOUT, server.recv_request())
        .await
        .expect("request should arrive")
        .unwrap();
    assert_eq!(received.topic, "schwarm.worker.shutdown");
}

#[tokio::test]
async fn closed_client_rejects_requests() {
    let (_server, client) = pair(17540).await;
    client.close();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let msg = Message::new("schwarm.worker.ping", &()).unwrap();
    let result = client.request(msg, Some(TIMEOUT)).await;
    assert!(matches!(result, Err(WireError::Closed)), "got {result:?}");
}
