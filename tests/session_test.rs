//! Session operations: explicit and implicit creation, listing, cascade
//! delete, search, digest, and analytics.

mod helpers;

use helpers::{draft, test_engine};
use memex::QueryFilter;

#[test]
fn explicit_session_creation_and_listing() {
    let (engine, _dir) = test_engine();

    let planning = engine
        .create_session("alice", Some("project planning"))
        .unwrap();
    let journal = engine.create_session("alice", None).unwrap();
    engine.create_session("bob", Some("not alice's")).unwrap();

    let page = engine.get_user_sessions("alice", 10, 0).unwrap();
    assert_eq!(page.total_count, 2);
    let ids: Vec<&str> = page.data.iter().map(|s| s.id.as_str()).collect();
    assert!(ids.contains(&planning.as_str()));
    assert!(ids.contains(&journal.as_str()));

    let named = page.data.iter().find(|s| s.id == planning).unwrap();
    assert_eq!(named.name.as_deref(), Some("project planning"));
}

#[test]
fn saving_bumps_session_activity() {
    let (engine, _dir) = test_engine();

    engine.save(draft("alice", "older", "first", 0.5)).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(10));
    engine.save(draft("alice", "newer", "second", 0.5)).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(10));
    engine.save(draft("alice", "older", "third", 0.5)).unwrap();

    // "older" got the most recent write, so it lists first
    let page = engine.get_user_sessions("alice", 10, 0).unwrap();
    assert_eq!(page.data[0].id, "older");
    assert_eq!(page.data[0].memory_count, 2);
}

#[test]
fn cascade_delete_leaves_no_memories_behind() {
    let (engine, _dir) = test_engine();

    for i in 0..5 {
        engine
            .save(draft("alice", "s", &format!("doomed row {i}"), 0.5))
            .unwrap();
    }
    engine.save(draft("alice", "other", "survivor", 0.5)).unwrap();

    assert!(engine.delete_session("s", true).unwrap());

    let sessions = engine.get_user_sessions("alice", 10, 0).unwrap();
    let ids: Vec<&str> = sessions.data.iter().map(|s| s.id.as_str()).collect();
    assert!(!ids.contains(&"s"));
    assert!(ids.contains(&"other"));

    let page = engine
        .recall(QueryFilter {
            user_id: Some("alice".into()),
            session_id: Some("s".into()),
            ..Default::default()
        })
        .unwrap();
    assert!(page.is_empty());
    assert_eq!(page.total_count, 0);
}

#[test]
fn delete_without_cascade_refuses_populated_session() {
    let (engine, _dir) = test_engine();
    engine.save(draft("alice", "s", "occupant", 0.5)).unwrap();

    let err = engine.delete_session("s", false).unwrap_err();
    assert_eq!(err.kind(), "Invalid");
    assert!(engine.get_user_sessions("alice", 10, 0).unwrap().total_count == 1);
}

#[test]
fn delete_unknown_session_is_false() {
    let (engine, _dir) = test_engine();
    assert!(!engine.delete_session("never-existed", true).unwrap());
}

#[test]
fn summarize_session_digest() {
    let (engine, _dir) = test_engine();

    engine
        .save(draft("alice", "s1", "Deployment failed on the staging cluster", 0.9))
        .unwrap();
    engine
        .save(draft("alice", "s1", "Deployment fixed after the rollback", 0.6))
        .unwrap();
    engine
        .save(draft("alice", "s1", "Lunch order for the retro", 0.1))
        .unwrap();

    let digest = engine.summarize_session("s1").unwrap().unwrap();
    assert_eq!(digest.user_id, "alice");
    assert_eq!(digest.memory_count, 3);
    assert!((digest.total_importance - 1.6).abs() < 1e-9);
    assert!((digest.avg_importance - 1.6 / 3.0).abs() < 1e-9);
    assert!(digest.first_created_at <= digest.last_created_at);

    // most important memory leads the excerpts
    assert!(digest.top_memories[0].excerpt.contains("staging"));
    // repeated token dominates the histogram
    assert_eq!(digest.keyword_histogram[0].keyword, "deployment");
    assert_eq!(digest.keyword_histogram[0].count, 2);
}

#[test]
fn summarize_empty_session_is_none() {
    let (engine, _dir) = test_engine();
    let id = engine.create_session("alice", None).unwrap();
    assert!(engine.summarize_session(&id).unwrap().is_none());
    assert!(engine.summarize_session("ghost-session").unwrap().is_none());
}

#[test]
fn long_content_is_excerpted_to_120_chars() {
    let (engine, _dir) = test_engine();
    engine
        .save(draft("alice", "s1", &"deploy retrospective ".repeat(20), 0.8))
        .unwrap();

    let digest = engine.summarize_session("s1").unwrap().unwrap();
    assert_eq!(digest.top_memories[0].excerpt.chars().count(), 120);
}

#[test]
fn search_sessions_by_memory_content() {
    let (engine, _dir) = test_engine();

    engine
        .save(draft("alice", "work", "Quarterly revenue projections", 0.7))
        .unwrap();
    engine
        .save(draft("alice", "hobby", "Sourdough starter schedule", 0.4))
        .unwrap();
    engine
        .save(draft("bob", "bob-work", "Revenue dashboard redesign", 0.6))
        .unwrap();

    let found = engine
        .search_sessions("alice", &["revenue".to_string()])
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, "work");
    assert_eq!(found[0].memory_count, 1);

    assert!(engine.search_sessions("alice", &[]).unwrap().is_empty());
}

#[test]
fn session_analytics_through_the_engine() {
    let (engine, _dir) = test_engine();

    for i in 0..3 {
        engine
            .save(draft("alice", "busy", &format!("busy row {i}"), 0.5))
            .unwrap();
    }
    engine.save(draft("alice", "quiet", "single row", 0.5)).unwrap();

    let analytics = engine.get_session_analytics("alice").unwrap();
    assert_eq!(analytics.total_sessions, 2);
    assert_eq!(analytics.total_memories, 4);
    assert_eq!(analytics.most_active_session.unwrap().id, "busy");
    assert!((analytics.avg_memories_per_session - 2.0).abs() < 1e-9);
}

#[test]
fn export_returns_every_user_memory() {
    let (engine, _dir) = test_engine();
    for i in 0..12 {
        engine
            .save(draft("alice", &format!("s{}", i % 3), &format!("export row {i}"), 0.5))
            .unwrap();
    }
    engine.save(draft("bob", "s", "not exported", 0.5)).unwrap();

    let exported = engine.export_user_memories("alice").unwrap();
    assert_eq!(exported.len(), 12);
    assert!(exported.iter().all(|m| m.user_id == "alice"));
}
