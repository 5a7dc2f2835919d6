#![allow(clippy::unwrap_used, clippy::expect_used)]

use conclave_session::*;

fn vote(iteration: u32, agent: &str, kind: VoteKind) -> Vote {
    Vote {
        iteration,
        agent_id: agent.into(),
        vote: kind,
        confidence: 0.8,
        reasoning: "seems right".into(),
        duration_ms: 12,
    }
}

#[tokio::test]
async fn file_store_roundtrip_and_delete() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FileSessionStore::new(tmp.path().join("sessions"))
        .await
        .unwrap();

    let mut session = SessionRecord::new(
        SessionKind::Swarm,
        "adopt event sourcing?",
        vec!["alpha".into(), "beta".into()],
    );
    session.append_vote(vote(1, "alpha", VoteKind::Agree)).unwrap();
    session.append_vote(vote(1, "beta", VoteKind::Extend)).unwrap();
    store.create(&session).await.unwrap();

    let loaded = store.get(session.id).await.unwrap().unwrap();
    assert_eq!(loaded.votes.len(), 2);
    assert_eq!(loaded.votes_in_iteration(1).count(), 2);
    assert_eq!(loaded.status, SessionStatus::Running);

    assert_eq!(store.list().await.unwrap(), vec![session.id]);
    assert!(store.delete(session.id).await.unwrap());
    assert!(!store.delete(session.id).await.unwrap());
    assert!(store.get(session.id).await.unwrap().is_none());
}

#[tokio::test]
async fn file_store_ignores_foreign_files() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("sessions");
    let store = FileSessionStore::new(dir.clone()).await.unwrap();
    tokio::fs::write(dir.join("notes.json"), "{}").await.unwrap();
    tokio::fs::write(dir.join("readme.txt"), "hi").await.unwrap();

    assert!(store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn list_records_filters_by_kind_newest_first() {
    let store = MemorySessionStore::new();
    let first = SessionRecord::new(SessionKind::Roundtable, "one", vec![]);
    let swarm = SessionRecord::new(SessionKind::Swarm, "two", vec![]);
    let mut second = SessionRecord::new(SessionKind::Roundtable, "three", vec![]);
    second.created_at = first.created_at + chrono::Duration::seconds(5);

    store.create(&first).await.unwrap();
    store.create(&swarm).await.unwrap();
    store.create(&second).await.unwrap();

    let roundtables = store.list_records(SessionKind::Roundtable).await.unwrap();
    let topics: Vec<_> = roundtables.iter().map(|r| r.topic.as_str()).collect();
    assert_eq!(topics, vec!["three", "one"]);
}
