#![allow(clippy::unwrap_used, clippy::expect_used)]

use conclave_core::ToolRegistry;
use conclave_gateway::GatewayServer;
use conclave_orchestrator::testing::ScriptedBackend;
use conclave_orchestrator::{AgentSpec, Orchestrator, OrchestratorConfig, Stores};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

/// Build a gateway over file-backed stores on a random port.
async fn start_test_server(backend: Arc<ScriptedBackend>) -> (String, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let config = OrchestratorConfig {
        data_dir: tmp.path().to_path_buf(),
        agents: vec![
            AgentSpec::new("alpha", &["security"]),
            AgentSpec::new("beta", &["billing"]),
            AgentSpec::new("gamma", &["ops"]),
        ],
        ..OrchestratorConfig::default()
    };
    let stores = Stores::file(tmp.path()).await.unwrap();
    let orchestrator = Orchestrator::build(config, stores, backend, ToolRegistry::new())
        .await
        .unwrap();
    let app = GatewayServer::build(orchestrator);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("127.0.0.1:{}", addr.port()), tmp)
}

async fn next_json<S>(ws: &mut S) -> Value
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let msg = tokio::time::timeout(Duration::from_secs(10), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    serde_json::from_str(&msg.into_text().unwrap()).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (addr, _tmp) = start_test_server(Arc::new(ScriptedBackend::new())).await;
    let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "conclave");
}

#[tokio::test]
async fn test_job_lifecycle() {
    let (addr, _tmp) = start_test_server(Arc::new(ScriptedBackend::new())).await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}/api/jobs");

    let definition = json!({
        "name": "nightly-audit",
        "schedule": "0 2 * * *",
        "agent": "alpha",
        "payload": {"type": "prompt", "text": "audit the access logs"}
    });
    let resp = client.post(&base).json(&definition).send().await.unwrap();
    assert_eq!(resp.status(), 201);
    let job: Value = resp.json().await.unwrap();
    let id = job["id"].as_str().unwrap().to_string();
    assert_eq!(job["run_count"], 0);

    let resp = client.post(&base).json(&definition).send().await.unwrap();
    assert_eq!(resp.status(), 400);

    let bad = json!({
        "name": "broken",
        "schedule": "whenever",
        "payload": {"type": "prompt", "text": "x"}
    });
    let resp = client.post(&base).json(&bad).send().await.unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].is_string());

    let resp = client
        .post(format!("{base}/{id}/trigger"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let run: Value = resp.json().await.unwrap();
    assert_eq!(run["status"], "success");
    assert_eq!(run["trigger"], "manual");

    let history: Vec<Value> = client
        .get(format!("{base}/{id}/history?limit=10"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history.len(), 1);

    let mut updated = definition.clone();
    updated["schedule"] = json!("@every 2h");
    let job: Value = client
        .put(format!("{base}/{id}"))
        .json(&updated)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(job["run_count"], 1);

    let resp = client.delete(format!("{base}/{id}")).send().await.unwrap();
    assert_eq!(resp.status(), 204);
    let resp = client.get(format!("{base}/{id}")).send().await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_roundtable_sync_and_session_crud() {
    let (addr, _tmp) = start_test_server(Arc::new(ScriptedBackend::new())).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{addr}/api/roundtable"))
        .json(&json!({"topic": "key rotation policy", "agents": ["alpha", "beta"], "rounds": 2}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let result: Value = resp.json().await.unwrap();
    assert_eq!(result["status"], "synthesized");
    assert_eq!(result["turns"].as_array().unwrap().len(), 4);
    let id = result["session_id"].as_str().unwrap().to_string();

    let sessions: Vec<Value> = client
        .get(format!("http://{addr}/api/roundtable"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(sessions.len(), 1);

    let resp = client
        .get(format!("http://{addr}/api/swarm/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .delete(format!("http://{addr}/api/roundtable/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    let resp = client
        .get(format!("http://{addr}/api/roundtable/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_roundtable_rejects_single_participant() {
    let backend = Arc::new(ScriptedBackend::new());
    let (addr, _tmp) = start_test_server(backend.clone()).await;
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/roundtable"))
        .json(&json!({"topic": "solo", "agents": ["alpha"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_async_swarm_converges() {
    let backend = Arc::new(ScriptedBackend::new());
    for id in ["alpha", "beta", "gamma"] {
        backend.reply(id, "VOTE: AGREE\nCONFIDENCE: 0.9\nREASONING: agreed");
    }
    let (addr, _tmp) = start_test_server(backend).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{addr}/api/swarm/async"))
        .json(&json!({"topic": "adopt the plan?", "agents": ["alpha", "beta", "gamma"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let body: Value = resp.json().await.unwrap();
    let id = body["session_id"].as_str().unwrap().to_string();

    let mut record = Value::Null;
    for _ in 0..100 {
        record = client
            .get(format!("http://{addr}/api/swarm/{id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if record["status"] != "running" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(record["status"], "converged");
    assert_eq!(record["consensus"]["converged"], true);
    assert_eq!(record["consensus"]["iterations_used"], 1);
}

#[tokio::test]
async fn test_cancel_unknown_session_is_404() {
    let (addr, _tmp) = start_test_server(Arc::new(ScriptedBackend::new())).await;
    let resp = reqwest::Client::new()
        .post(format!(
            "http://{addr}/api/sessions/{}/cancel",
            uuid::Uuid::new_v4()
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_agents_and_dashboard() {
    let (addr, _tmp) = start_test_server(Arc::new(ScriptedBackend::new())).await;
    let client = reqwest::Client::new();

    let agents: Vec<Value> = client
        .get(format!("http://{addr}/api/agents"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(agents.len(), 3);

    let resp = client
        .post(format!("http://{addr}/api/agents"))
        .json(&json!({"id": "delta", "specialty_domains": ["research"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    let resp = client
        .delete(format!("http://{addr}/api/agents/delta"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    let agent: Value = client
        .get(format!("http://{addr}/api/agents/delta"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(agent["status"], "disabled");

    let dashboard: Value = client
        .get(format!("http://{addr}/api/dashboard"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(dashboard["agents"].as_array().unwrap().len(), 4);
    assert_eq!(dashboard["max_concurrent"], 5);
}

#[tokio::test]
async fn test_roundtable_stream() {
    let (addr, _tmp) = start_test_server(Arc::new(ScriptedBackend::new())).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/roundtable"))
        .await
        .unwrap();

    let request = json!({"topic": "incident review", "agents": ["alpha", "beta"], "rounds": 2});
    ws.send(Message::Text(request.to_string())).await.unwrap();

    let started = next_json(&mut ws).await;
    assert_eq!(started["type"], "started");
    let session_id = started["session_id"].clone();

    let mut turns = 0;
    loop {
        let event = next_json(&mut ws).await;
        assert_eq!(event["session_id"], session_id);
        match event["type"].as_str().unwrap() {
            "turn" => {
                turns += 1;
                assert!(event["round"].as_u64().unwrap() >= 1);
                assert!(event["agent_id"].is_string());
                assert!(event["content"].is_string());
            }
            "synthesis" => break,
            other => panic!("unexpected event {other}"),
        }
    }
    assert_eq!(turns, 4);
}

#[tokio::test]
async fn test_swarm_stream() {
    let backend = Arc::new(ScriptedBackend::new());
    for id in ["alpha", "beta"] {
        backend.reply(id, "VOTE: AGREE\nCONFIDENCE: 0.8");
    }
    let (addr, _tmp) = start_test_server(backend).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/swarm"))
        .await
        .unwrap();

    let request = json!({"topic": "freeze deploys?", "agents": ["alpha", "beta"]});
    ws.send(Message::Text(request.to_string())).await.unwrap();
    assert_eq!(next_json(&mut ws).await["type"], "started");

    let mut votes = 0;
    loop {
        let event = next_json(&mut ws).await;
        match event["type"].as_str().unwrap() {
            "vote" => {
                votes += 1;
                assert_eq!(event["vote"], "agree");
                assert_eq!(event["iteration"], 1);
            }
            "consensus" => {
                assert_eq!(event["result"]["converged"], true);
                break;
            }
            other => panic!("unexpected event {other}"),
        }
    }
    assert_eq!(votes, 2);
}

#[tokio::test]
async fn test_stream_rejects_invalid_request() {
    let (addr, _tmp) = start_test_server(Arc::new(ScriptedBackend::new())).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/swarm"))
        .await
        .unwrap();
    ws.send(Message::Text("not json".to_string())).await.unwrap();
    let event = next_json(&mut ws).await;
    assert_eq!(event["type"], "error");
}
