//! Concurrency tests for persona reservation over the file store.
//!
//! Each task opens its own `FileRegistryStore` on the shared directory, so the
//! only coordination between them is the on-disk revision check and lock file,
//! the same as between separate processes.

use chorus_persona::{FileRegistryStore, PersonaError, PersonaRegistry};
use chorus_types::{PersonaId, PersonaProfile, SessionId};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier};

fn catalog() -> Vec<PersonaProfile> {
    ["alma", "bea", "cai", "dov"]
        .iter()
        .map(|id| PersonaProfile {
            id: PersonaId::new(*id),
            name: id.to_string(),
            speaker_id: format!("spk-{id}"),
            default_style: None,
            styles: Vec::new(),
        })
        .collect()
}

fn open_registry(dir: &Path) -> PersonaRegistry {
    let store = FileRegistryStore::open(dir).expect("should open store");
    PersonaRegistry::new(Arc::new(store), catalog())
}

#[tokio::test]
async fn test_concurrent_reserve_same_persona_has_one_winner() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let sessions = 16;
    let barrier = Arc::new(Barrier::new(sessions));
    let won = Arc::new(AtomicU32::new(0));
    let conflicted = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for n in 0..sessions {
        let registry = open_registry(dir.path());
        let barrier = barrier.clone();
        let won = won.clone();
        let conflicted = conflicted.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            barrier.wait();
            match registry.reserve(&PersonaId::new("alma"), &SessionId::new(format!("s{n}"))) {
                Ok(_) => {
                    won.fetch_add(1, Ordering::SeqCst);
                }
                Err(PersonaError::ReservationConflict { .. }) => {
                    conflicted.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }));
    }
    for handle in handles {
        handle.await.expect("task should not panic");
    }

    assert_eq!(won.load(Ordering::SeqCst), 1, "exactly one session should win");
    assert_eq!(conflicted.load(Ordering::SeqCst), sessions as u32 - 1);

    let held = open_registry(dir.path()).list_held().expect("list_held");
    assert_eq!(held.len(), 1, "registry should hold one entry");
}

#[tokio::test]
async fn test_concurrent_reserve_distinct_personas_all_succeed() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let personas: &'static [&str] = &["alma", "bea", "cai", "dov"];
    let barrier = Arc::new(Barrier::new(personas.len()));

    let mut handles = Vec::new();
    for (n, persona) in personas.iter().enumerate() {
        let registry = open_registry(dir.path());
        let barrier = barrier.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            barrier.wait();
            registry
                .reserve(&PersonaId::new(*persona), &SessionId::new(format!("s{n}")))
                .expect("distinct personas should never conflict");
        }));
    }
    for handle in handles {
        handle.await.expect("task should not panic");
    }

    let registry = open_registry(dir.path());
    assert_eq!(registry.list_held().unwrap().len(), personas.len());
    assert!(registry.list_available().unwrap().is_empty());
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    open_registry(dir.path())
        .reserve(&PersonaId::new("bea"), &SessionId::new("s1"))
        .expect("reserve");

    let reopened = open_registry(dir.path());
    let lease = reopened
        .status(&SessionId::new("s1"))
        .expect("status")
        .expect("lease should persist across handles");
    assert_eq!(lease.persona_id, PersonaId::new("bea"));
    assert!(dir.path().join("registry.json").exists());
    assert!(dir.path().join("leases").join("s1.json").exists());
}
