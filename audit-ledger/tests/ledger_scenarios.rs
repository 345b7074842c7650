//! End-to-end ledger scenarios

use audit_ledger::{
    cached::CachedLedger,
    merkle::{Direction, MerkleTree},
    storage::{export_entries, import_entries},
    AuditLog, CacheConfig, Config, EntryFilter, HashAlgorithm, HexDigest, Ledger, MemoryBackend,
    Payload, ViolationKind,
};
use serde_json::{json, Value};
use std::io::{BufReader, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

fn test_config() -> Config {
    Config {
        auto_verify: false,
        ..Config::default()
    }
}

#[test]
fn test_login_transfer_then_tamper() {
    let ledger = Ledger::in_memory(test_config()).unwrap();
    assert_eq!(ledger.head_hash().unwrap(), ledger.hasher().genesis_hash());

    let a = ledger.append(payload(json!({ "event": "login" }))).unwrap();
    let b = ledger
        .append(payload(json!({ "event": "transfer", "amount": 100 })))
        .unwrap();

    assert!(a.previous_hash.is_none());
    assert!(a.is_genesis());
    assert_eq!(b.previous_hash.as_ref(), Some(&a.hash));
    assert!(ledger.verify_integrity(None, None).is_ok());

    // Export, alter A's data without rehashing, and load the copy
    let mut file = tempfile::tempfile().unwrap();
    assert_eq!(export_entries(ledger.backend().as_ref(), &mut file).unwrap(), 2);
    file.seek(SeekFrom::Start(0)).unwrap();
    let mut entries = import_entries(BufReader::new(file)).unwrap();
    entries[0].data = payload(json!({ "event": "logout" }));

    let tampered = Ledger::new(
        Arc::new(MemoryBackend::from_entries(entries).unwrap()),
        test_config(),
    )
    .unwrap();

    let err = tampered.verify_integrity(None, None).unwrap_err();
    assert!(err.is_integrity());
    let violation = err.integrity_violation().unwrap();
    assert_eq!(violation.kind, ViolationKind::HashMismatch);
    assert_eq!(violation.entry_id, a.id.to_string());
    assert_eq!(violation.actual.as_deref(), Some(a.hash.as_str()));
    assert!(!tampered.get_stats().unwrap().integrity_verified);
}

#[test]
fn test_merkle_odd_leaf_duplicates_itself() {
    let algorithm = HashAlgorithm::Sha256;
    let tree = MerkleTree::build(algorithm, ["x", "y", "z"]).unwrap();

    let leaf = |s: &str| algorithm.hex_digest(s.as_bytes());
    let parent = |l: &HexDigest, r: &HexDigest| {
        algorithm.hex_digest(format!("{}{}", l, r).as_bytes())
    };

    let xy = parent(&leaf("x"), &leaf("y"));
    let zz = parent(&leaf("z"), &leaf("z"));
    assert_eq!(*tree.root(), parent(&xy, &zz));

    let proof = tree.generate_proof("y").unwrap();
    assert_eq!(proof.leaf_index, 1);
    assert_eq!(
        proof.proof_path,
        vec![(leaf("x"), Direction::Left), (zz, Direction::Right)]
    );
    assert!(tree.verify_proof(&proof));
    assert!(tree.generate_proof("w").is_none());
}

#[test]
fn test_cached_ledger_consistent_with_writes() {
    let ledger = Ledger::in_memory(test_config()).unwrap();
    let cached = CachedLedger::new(ledger, &CacheConfig::default()).unwrap();

    for i in 0..5 {
        cached.append(payload(json!({ "kind": "read", "i": i }))).unwrap();
    }

    let criteria = payload(json!({ "kind": "read" }));
    assert_eq!(cached.search(&criteria).unwrap().len(), 5);
    assert_eq!(cached.get_range(3, 10).unwrap().len(), 2);

    cached.append(payload(json!({ "kind": "read", "i": 5 }))).unwrap();

    assert_eq!(cached.search(&criteria).unwrap().len(), 6);
    assert_eq!(cached.get_range(3, 10).unwrap().len(), 3);
    assert_eq!(cached.get_by_sequence(5).unwrap().unwrap().data["i"], json!(5));
    assert!(cached.verify_integrity(None, None).is_ok());
}

#[test]
fn test_cached_reads_never_stale_under_concurrent_writes() {
    const WRITES: usize = 60;
    const READERS: usize = 4;

    let ledger = Ledger::in_memory(test_config()).unwrap();
    let cached = CachedLedger::new(ledger, &CacheConfig::default()).unwrap();
    let criteria = payload(json!({ "kind": "audit" }));
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        for _ in 0..READERS {
            scope.spawn(|| {
                // Keep refilling the range and query caches while writes land
                while !done.load(Ordering::Acquire) {
                    let range = cached.get_range(0, 1_000).unwrap();
                    let found = cached.search(&criteria).unwrap();
                    assert!(range.len() <= WRITES);
                    assert!(found.len() <= WRITES);
                }
            });
        }

        let writer = scope.spawn(|| {
            for i in 0..WRITES {
                cached.append(payload(json!({ "kind": "audit", "i": i }))).unwrap();

                // A read issued after the append returned must include it
                assert_eq!(cached.get_range(0, 1_000).unwrap().len(), i + 1);
                assert_eq!(cached.search(&criteria).unwrap().len(), i + 1);
                assert_eq!(
                    cached.get_by_sequence(i as u64).unwrap().unwrap().data["i"],
                    json!(i)
                );
            }
        });

        // Release the readers even if the writer failed
        let outcome = writer.join();
        done.store(true, Ordering::Release);
        if let Err(panic) = outcome {
            std::panic::resume_unwind(panic);
        }
    });

    assert_eq!(cached.get_range(0, 1_000).unwrap().len(), WRITES);
    assert!(cached.verify_integrity(None, None).is_ok());
}

#[test]
fn test_merkle_over_stored_entries() {
    let config = Config {
        hash_algorithm: HashAlgorithm::Blake3,
        ..test_config()
    };
    let ledger = Ledger::in_memory(config).unwrap();
    let entries: Vec<_> = (0..7)
        .map(|i| ledger.append(payload(json!({ "i": i }))).unwrap())
        .collect();

    let tree = ledger.merkle_tree(&EntryFilter::all()).unwrap();
    let leaves: Vec<HexDigest> = entries.iter().map(|e| e.hash.clone()).collect();
    assert_eq!(tree.leaves(), leaves.as_slice());

    for entry in &entries {
        let proof = tree.generate_proof(entry).unwrap();
        assert!(proof.verify(HashAlgorithm::Blake3));
    }
}

#[test]
fn test_partial_verification_after_reopen() {
    let backend = Arc::new(MemoryBackend::new());
    let ledger = Ledger::new(backend.clone(), test_config()).unwrap();
    let ids: Vec<_> = (0..6)
        .map(|i| ledger.append(payload(json!({ "i": i }))).unwrap().id)
        .collect();

    let mut exported = Vec::new();
    export_entries(backend.as_ref(), &mut exported).unwrap();
    ledger.close().unwrap();
    assert!(ledger.append(payload(json!({ "i": 6 }))).is_err());

    let entries = import_entries(exported.as_slice()).unwrap();
    let reopened = Ledger::new(
        Arc::new(MemoryBackend::from_entries(entries).unwrap()),
        test_config(),
    )
    .unwrap();

    let report = reopened
        .verify_integrity(Some(&ids[2]), Some(&ids[4]))
        .unwrap();
    assert_eq!(report.entries_checked, 3);
    assert_eq!(report.first_entry, Some(ids[2]));
    assert_eq!(report.last_entry, Some(ids[4]));

    let unknown = uuid::Uuid::now_v7();
    assert!(matches!(
        reopened.verify_integrity(Some(&unknown), None),
        Err(audit_ledger::Error::NotFound(_))
    ));
}
