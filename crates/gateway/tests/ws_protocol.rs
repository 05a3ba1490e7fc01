//! The streaming protocol over a real websocket connection.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

use arbor_client::{ClientPool, MemoryStore};
use arbor_domain::secrets::SecretBox;
use arbor_gateway::api;
use arbor_gateway::cli::GatewayConfig;
use arbor_gateway::state::AppState;
use arbor_lm::dummy::ScriptedLm;
use arbor_lm::LmHandle;

/// Boot a gateway on an ephemeral port with in-memory pools and a scripted
/// model; returns the bound address.
async fn start_gateway(responses: Vec<&str>) -> (std::net::SocketAddr, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = GatewayConfig {
        data_dir: dir.path().to_path_buf(),
        ..GatewayConfig::default()
    };
    let state = AppState::new(config, SecretBox::ephemeral());

    let store = Arc::new(MemoryStore::new());
    let user = state.users.add_user_with_pools(
        "u1",
        None,
        Some(Arc::new(ClientPool::with_store(store.clone(), 3))),
        Some(Arc::new(ClientPool::with_store(store, 3))),
    );
    user.trees.add_tree("c1", false, None).unwrap();

    let lm = Arc::new(ScriptedLm::new(
        responses.into_iter().map(str::to_owned).collect(),
    ));
    state.users.set_lm_override((
        LmHandle::new(lm.clone(), "scripted-base"),
        LmHandle::new(lm, "scripted-complex"),
    ));

    let router = api::router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (addr, dir)
}

fn parse(message: Message) -> Value {
    match message {
        Message::Text(raw) => serde_json::from_str(&raw).unwrap(),
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[tokio::test]
async fn query_round_trip_over_the_wire() {
    let (addr, _dir) = start_gateway(vec!["Hello there!", "Greeting"]).await;

    let (mut ws, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/ws/query"))
            .await
            .unwrap();

    // A malformed frame gets a protocol error envelope, connection stays up.
    ws.send(Message::Text("this is not json".into()))
        .await
        .unwrap();
    let frame = parse(ws.next().await.unwrap().unwrap());
    assert_eq!(frame["type"], "error");
    assert!(frame["payload"]["text"]
        .as_str()
        .unwrap()
        .contains("protocol"));

    // A prompt streams envelopes ending in exactly one completed, with one
    // title just before it.
    ws.send(Message::Text(
        json!({
            "user_id": "u1",
            "conversation_id": "c1",
            "query_id": "q1",
            "query": "hi",
            "collection_names": [],
        })
        .to_string(),
    ))
    .await
    .unwrap();

    let mut kinds = Vec::new();
    loop {
        let frame = parse(ws.next().await.unwrap().unwrap());
        let kind = frame["type"].as_str().unwrap().to_owned();
        kinds.push(kind.clone());
        if kind == "completed" {
            break;
        }
    }
    assert_eq!(kinds.first().map(String::as_str), Some("ner"));
    assert_eq!(kinds.iter().filter(|k| *k == "title").count(), 1);
    assert_eq!(kinds.iter().filter(|k| *k == "completed").count(), 1);
    assert!(kinds.contains(&"response".to_owned()));
    // The title frame arrives before completed.
    let title_at = kinds.iter().position(|k| k == "title").unwrap();
    assert_eq!(title_at, kinds.len() - 2);

    // A disconnect frame closes the connection gracefully.
    ws.send(Message::Text(json!({ "type": "disconnect" }).to_string()))
        .await
        .unwrap();
    loop {
        match ws.next().await {
            None | Some(Ok(Message::Close(_))) | Some(Err(_)) => break,
            Some(Ok(_)) => continue,
        }
    }
}

#[tokio::test]
async fn unknown_user_gets_a_user_timeout_envelope() {
    let (addr, _dir) = start_gateway(vec![]).await;

    let (mut ws, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/ws/query"))
            .await
            .unwrap();

    ws.send(Message::Text(
        json!({
            "user_id": "nobody",
            "conversation_id": "c9",
            "query_id": "q1",
            "query": "hi",
            "collection_names": [],
        })
        .to_string(),
    ))
    .await
    .unwrap();

    let frame = parse(ws.next().await.unwrap().unwrap());
    assert_eq!(frame["type"], "user_timeout_error");
    assert!(frame["payload"]["text"]
        .as_str()
        .unwrap()
        .contains("timed out"));
}
