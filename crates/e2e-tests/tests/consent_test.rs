//! Blocked topic backends and one-time migration.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use e2e_tests::topic;
use topics_engine::store::{FLAG_HAS_MIGRATED, FLAG_LOCAL_HAS_CLEARED};
use topics_engine::{ConsentStore, EngineError, TopicStore};
use topics_storage::column_families::{
    CF_ALTERNATE_BLOCKED_TOPICS, CF_BLOCKED_TOPICS, CF_SERVICE_BLOCKED_TOPICS,
};
use topics_storage::Storage;
use topics_types::{ConsentSourceOfTruth, EngineSettings};

fn settings(mode: ConsentSourceOfTruth) -> EngineSettings {
    EngineSettings {
        consent_source_of_truth: mode,
        ..EngineSettings::default()
    }
}

fn open(path: &std::path::Path) -> TopicStore {
    TopicStore::new(Arc::new(Storage::open(path).unwrap()))
}

fn rows(store: &TopicStore, cf: &str) -> u64 {
    store.storage().get_stats().unwrap().rows(cf)
}

#[test]
fn test_mirrored_writes_reach_both_backends() {
    let temp = tempfile::TempDir::new().unwrap();
    let store = open(temp.path());
    let consent =
        ConsentStore::new(&store, &settings(ConsentSourceOfTruth::LocalAndService)).unwrap();

    consent.block(&topic(4)).unwrap();
    assert_eq!(rows(&store, CF_BLOCKED_TOPICS), 1);
    assert_eq!(rows(&store, CF_SERVICE_BLOCKED_TOPICS), 1);

    consent.unblock(&topic(4)).unwrap();
    assert_eq!(rows(&store, CF_BLOCKED_TOPICS), 0);
    assert_eq!(rows(&store, CF_SERVICE_BLOCKED_TOPICS), 0);
}

#[test]
fn test_local_to_service_migration_runs_once() {
    let temp = tempfile::TempDir::new().unwrap();
    {
        let store = open(temp.path());
        let consent = ConsentStore::new(&store, &settings(ConsentSourceOfTruth::LocalOnly)).unwrap();
        consent.block(&topic(1)).unwrap();
        consent.block(&topic(2)).unwrap();
    }

    let store = open(temp.path());
    let consent = ConsentStore::new(&store, &settings(ConsentSourceOfTruth::ServiceOnly)).unwrap();
    assert_eq!(consent.retrieve_all().unwrap(), vec![topic(1), topic(2)]);
    assert_eq!(rows(&store, CF_BLOCKED_TOPICS), 0);
    assert!(store.flag(FLAG_HAS_MIGRATED).unwrap());
    assert!(store.flag(FLAG_LOCAL_HAS_CLEARED).unwrap());

    consent.unblock(&topic(1)).unwrap();
    drop(consent);

    // Reopening must not migrate again
    let consent = ConsentStore::new(&store, &settings(ConsentSourceOfTruth::ServiceOnly)).unwrap();
    assert_eq!(consent.retrieve_all().unwrap(), vec![topic(2)]);
}

#[test]
fn test_clear_all_by_mode() {
    let temp = tempfile::TempDir::new().unwrap();
    let store = open(temp.path());

    let local = ConsentStore::new(&store, &settings(ConsentSourceOfTruth::LocalOnly)).unwrap();
    local.block(&topic(1)).unwrap();
    local.clear_all().unwrap();
    assert_eq!(local.retrieve_all().unwrap(), vec![topic(1)]);

    let service = ConsentStore::new(&store, &settings(ConsentSourceOfTruth::ServiceOnly)).unwrap();
    service.block(&topic(3)).unwrap();
    service.clear_all().unwrap();
    assert!(service.retrieve_all().unwrap().is_empty());
}

#[test]
fn test_alternate_store_is_gated() {
    let temp = tempfile::TempDir::new().unwrap();
    let store = open(temp.path());

    let enabled =
        ConsentStore::new(&store, &settings(ConsentSourceOfTruth::AlternateStoreOnly)).unwrap();
    enabled.block(&topic(5)).unwrap();
    assert_eq!(rows(&store, CF_ALTERNATE_BLOCKED_TOPICS), 1);
    assert_eq!(enabled.retrieve_all().unwrap(), vec![topic(5)]);

    let disabled = ConsentStore::new(
        &store,
        &EngineSettings {
            enable_alternate_store_consent: false,
            ..settings(ConsentSourceOfTruth::AlternateStoreOnly)
        },
    )
    .unwrap();
    assert!(matches!(disabled.block(&topic(6)), Err(EngineError::Consent(_))));
    assert!(matches!(disabled.retrieve_all(), Err(EngineError::Consent(_))));
}

#[test]
fn test_invalid_topic_rejected() {
    let temp = tempfile::TempDir::new().unwrap();
    let store = open(temp.path());
    let consent = ConsentStore::new(&store, &EngineSettings::default()).unwrap();
    assert!(matches!(
        consent.block(&topic(0)),
        Err(EngineError::InvalidArgument(_))
    ));
    assert!(consent.retrieve_all().unwrap().is_empty());
}
