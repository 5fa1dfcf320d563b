//! End-to-end scenarios against an in-process engine, covering insert/get,
//! update, filtering, crash recovery, vector search, and authorization,
//! plus a couple of universal invariants exercised at this layer rather
//! than as unit tests.

use std::collections::HashMap;
use std::sync::Arc;

use nexadb::auth::credentials::{generate_api_key, generate_salt, hash_password};
use nexadb::auth::store::CredentialStore;
use nexadb::auth::user::{Permission, Role};
use nexadb::config::{IndexConfig, SecurityConfig, StorageConfig};
use nexadb::document::database::Catalog;
use nexadb::document::value::{Document, Value};
use nexadb::storage::{Durability, StorageEngine};
use tempfile::tempdir;

fn open_catalog(dir: &std::path::Path) -> Arc<Catalog> {
    let engine = StorageEngine::open(StorageConfig {
        data_dir: dir.to_path_buf(),
        ..StorageConfig::default()
    })
    .unwrap();
    Arc::new(Catalog::open(engine, IndexConfig::default(), dir.join("hnsw")).unwrap())
}

fn doc_from(pairs: &[(&str, Value)]) -> Document {
    let mut d = Document::new();
    for (k, v) in pairs {
        d.set(*k, v.clone());
    }
    d
}

// S1 - Insert/get round-trip.
#[test]
fn s1_insert_get_round_trip() {
    let dir = tempdir().unwrap();
    let catalog = open_catalog(dir.path());
    let users = catalog.database("default").unwrap().collection("users").unwrap();

    let doc = doc_from(&[("name", Value::String("Alice".into())), ("age", Value::Int(28))]);
    let id = users.insert(doc).unwrap();

    let stored = users.get(&id).unwrap();
    assert_eq!(stored.get("name"), Some(&Value::String("Alice".to_string())));
    assert_eq!(stored.get("age"), Some(&Value::Int(28)));
    assert_eq!(stored.get("_id"), Some(&Value::String(id)));
    let created = stored.get("_created_at").unwrap();
    let updated = stored.get("_updated_at").unwrap();
    assert_eq!(created, updated, "created_at and updated_at match on insert");
}

// S2 - Update preserves immutables.
#[test]
fn s2_update_preserves_immutables() {
    let dir = tempdir().unwrap();
    let catalog = open_catalog(dir.path());
    let users = catalog.database("default").unwrap().collection("users").unwrap();

    let doc = doc_from(&[("name", Value::String("Alice".into())), ("age", Value::Int(28))]);
    let id = users.insert(doc).unwrap();
    let before = users.get(&id).unwrap();

    std::thread::sleep(std::time::Duration::from_millis(5));
    let patch = doc_from(&[("age", Value::Int(29))]);
    users.update(&id, &patch).unwrap();

    let after = users.get(&id).unwrap();
    assert_eq!(after.get("_id"), Some(&Value::String(id)));
    assert_eq!(after.get("_created_at"), before.get("_created_at"));
    assert_ne!(after.get("_updated_at"), before.get("_updated_at"));
    assert_eq!(after.get("age"), Some(&Value::Int(29)));
    assert_eq!(after.get("name"), Some(&Value::String("Alice".to_string())));
}

// S3 - Filter with comparison.
#[test]
fn s3_filter_with_comparison() {
    let dir = tempdir().unwrap();
    let catalog = open_catalog(dir.path());
    let people = catalog.database("default").unwrap().collection("people").unwrap();

    for age in [24, 28, 35] {
        people.insert(doc_from(&[("age", Value::Int(age))])).unwrap();
    }

    let mut gte = Document::new();
    gte.set("$gte", Value::Int(28));
    let filter = doc_from(&[("age", Value::Document(gte))]);

    let results = people.find(&filter, None, None, None).unwrap();
    assert_eq!(results.len(), 2);
    let ages: Vec<i64> = results.iter().map(|d| d.get("age").unwrap().as_i64().unwrap()).collect();
    assert!(ages.contains(&28));
    assert!(ages.contains(&35));
}

// S4 - Crash recovery: reopening the engine after an unclean shutdown
// (dropping the Arc without calling shutdown()) must still see every
// durably acknowledged write.
#[test]
fn s4_crash_recovery_preserves_acknowledged_writes() {
    let dir = tempdir().unwrap();
    let mut ids = Vec::new();
    {
        let catalog = open_catalog(dir.path());
        let coll = catalog.database("default").unwrap().collection("items").unwrap();
        for i in 0..100 {
            let id = coll.insert(doc_from(&[("n", Value::Int(i))])).unwrap();
            ids.push(id);
        }
        // Deliberately no graceful shutdown: simulates a crash after the
        // last acknowledged write's WAL fsync.
    }

    let catalog = open_catalog(dir.path());
    let coll = catalog.database("default").unwrap().collection("items").unwrap();
    assert_eq!(coll.count(&Document::new()).unwrap(), 100);
    for id in ids {
        assert!(coll.get(&id).is_ok());
    }
}

// S5 - Vector search.
#[test]
fn s5_vector_search_orders_by_cosine_similarity() {
    let dir = tempdir().unwrap();
    let catalog = open_catalog(dir.path());
    let movies = catalog.database("default").unwrap().collection("movies").unwrap();
    movies.create_vector_index(4).unwrap();

    let vec_value = |v: &[f64]| Value::Array(v.iter().map(|&x| Value::Float(x)).collect());
    movies
        .insert(doc_from(&[
            ("title", Value::String("A".into())),
            ("_vector", vec_value(&[1.0, 0.0, 0.0, 0.0])),
        ]))
        .unwrap();
    movies
        .insert(doc_from(&[
            ("title", Value::String("B".into())),
            ("_vector", vec_value(&[0.0, 1.0, 0.0, 0.0])),
        ]))
        .unwrap();
    movies
        .insert(doc_from(&[
            ("title", Value::String("C".into())),
            ("_vector", vec_value(&[0.9, 0.1, 0.0, 0.0])),
        ]))
        .unwrap();

    movies.rebuild_vector_index(4).unwrap();
    let results = movies.search_vector(&[1.0, 0.0, 0.0, 0.0], 2).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0.len(), 16); // doc ids are 16 hex chars
    assert!((results[0].1 - 1.0).abs() < 1e-4);
    assert!((results[1].1 - 0.994).abs() < 1e-2);
}

// S6 - Authorization.
#[test]
fn s6_read_role_cannot_write_or_touch_other_databases() {
    let dir = tempdir().unwrap();
    let engine = StorageEngine::open(StorageConfig {
        data_dir: dir.path().to_path_buf(),
        ..StorageConfig::default()
    })
    .unwrap();
    let catalog = Arc::new(Catalog::open(engine.clone(), IndexConfig::default(), dir.path().join("hnsw")).unwrap());
    let credentials = CredentialStore::open(
        engine.clone(),
        &SecurityConfig {
            root_password_initial: Some("root-pw".to_string()),
            pbkdf2_iterations: 1000,
        },
    )
    .unwrap();

    let mut perms = HashMap::new();
    perms.insert("default".to_string(), Permission::Read);
    let alice = credentials
        .create_user("alice", "alice-pw", Role::Read, perms)
        .unwrap();

    // alice has read on `default`: fetching an existing doc succeeds.
    let seed = catalog.database("default").unwrap().collection("users").unwrap();
    let id = seed.insert(doc_from(&[("name", Value::String("seed".into()))])).unwrap();
    assert!(alice.authorized_for("default", Permission::Read));
    assert!(seed.get(&id).is_ok());

    // alice lacks write on `default`.
    assert!(!alice.authorized_for("default", Permission::Write));

    // alice has no grant at all on `other`.
    catalog.create_database("other").unwrap();
    assert!(!alice.authorized_for("other", Permission::Read));
}

// Universal invariant: bloom filter has no false negatives (a run never
// reports a key absent when a get() for that key actually finds it),
// exercised at the engine layer across a flush boundary.
#[test]
fn bloom_filter_has_no_false_negatives_across_a_flush() {
    let dir = tempdir().unwrap();
    let engine = StorageEngine::open(StorageConfig {
        data_dir: dir.path().to_path_buf(),
        memtable_size_bytes: 512,
        ..StorageConfig::default()
    })
    .unwrap();

    let mut keys = Vec::new();
    for i in 0..200 {
        let key = format!("db:default:col:t:doc:{i:05}").into_bytes();
        engine.put(key.clone(), vec![1u8; 32], Durability::Grouped).unwrap();
        keys.push(key);
    }
    std::thread::sleep(std::time::Duration::from_millis(400));

    for key in keys {
        assert!(engine.get(&key).unwrap().is_some(), "key {key:?} must be found");
    }
    engine.shutdown().unwrap();
}

// Universal invariant: password hashing is not bare SHA-256 of the raw
// password — the stored hash must depend on a per-user salt and an
// iteration count, so the same password for two users yields different
// stored hashes.
#[test]
fn password_hashing_is_salted_and_not_reversible_by_bare_digest() {
    let salt_a = generate_salt();
    let salt_b = generate_salt();
    assert_ne!(salt_a, salt_b, "salts must be randomly generated per user");

    let hash_a = hash_password("same-password", &salt_a, 1000);
    let hash_b = hash_password("same-password", &salt_b, 1000);
    assert_ne!(hash_a, hash_b, "identical passwords must hash differently under different salts");

    let api_key = generate_api_key();
    assert_eq!(api_key.len(), 32, "128-bit api key rendered as lowercase hex is 32 chars");
    assert!(api_key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
}
