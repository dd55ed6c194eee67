//! End-to-end backup, deduplication, restore and GC behaviour.

mod common;

use std::collections::BTreeMap;

use blockvault::db::Database;
use blockvault::{VaultError, VersionStatus, VersionUid};
use common::{random_bytes, TestVault, BLOCK_SIZE};

/// zero / random / zero source: one stored object, two sparse rows.
fn striped_source() -> Vec<u8> {
    let mut data = vec![0u8; BLOCK_SIZE];
    data.extend(random_bytes(42, BLOCK_SIZE));
    data.extend(vec![0u8; BLOCK_SIZE]);
    data
}

fn backup(vault: &mut TestVault, source: &str) -> VersionUid {
    vault
        .engine
        .backup("vol", "snap", source, None, None, BTreeMap::new())
        .expect("backup")
}

#[test]
fn sparse_blocks_produce_no_objects_and_null_references() {
    let mut vault = TestVault::new();
    let url = vault.write_source("vol.img", &striped_source());
    let uid = backup(&mut vault, &url);

    let version = vault.engine.version(&uid).unwrap();
    assert_eq!(version.status, VersionStatus::Valid);
    assert_eq!(version.size, 3 * BLOCK_SIZE as u64);
    assert_eq!(version.bytes_sparse, 2 * BLOCK_SIZE as u64);
    assert_eq!(version.bytes_read, BLOCK_SIZE as u64);
    assert_eq!(version.bytes_deduplicated, 0);
    assert!(version.bytes_written > 0);

    assert_eq!(vault.stored_block_objects().len(), 1);

    let db = Database::open(vault.db_path().to_str().unwrap()).unwrap();
    let blocks = db.blocks_by_version(&uid).unwrap();
    assert_eq!(blocks.len(), 3);
    assert!(blocks[0].is_sparse());
    assert!(blocks[0].checksum.is_none());
    assert!(!blocks[1].is_sparse());
    assert!(blocks[2].is_sparse());
}

#[test]
fn second_backup_reuses_the_stored_object() {
    let mut vault = TestVault::new();
    let url = vault.write_source("vol.img", &striped_source());
    let first = backup(&mut vault, &url);
    let second = backup(&mut vault, &url);

    // No new objects; the non-sparse row reuses the existing uid.
    assert_eq!(vault.stored_block_objects().len(), 1);
    let version = vault.engine.version(&second).unwrap();
    assert_eq!(version.bytes_deduplicated, BLOCK_SIZE as u64);
    assert_eq!(version.bytes_written, 0);

    let db = Database::open(vault.db_path().to_str().unwrap()).unwrap();
    let first_blocks = db.blocks_by_version(&first).unwrap();
    let second_blocks = db.blocks_by_version(&second).unwrap();
    assert_eq!(first_blocks[1].uid, second_blocks[1].uid);
    assert_eq!(first_blocks[1].checksum, second_blocks[1].checksum);
}

#[test]
fn duplicate_content_within_one_backup_is_stored_once() {
    let mut vault = TestVault::new();
    let chunk = random_bytes(7, BLOCK_SIZE);
    let mut data = chunk.clone();
    data.extend(&chunk);
    data.extend(&chunk);
    let url = vault.write_source("vol.img", &data);
    let uid = backup(&mut vault, &url);

    assert_eq!(vault.stored_block_objects().len(), 1);
    let db = Database::open(vault.db_path().to_str().unwrap()).unwrap();
    let blocks = db.blocks_by_version(&uid).unwrap();
    assert_eq!(blocks.len(), 3);
    assert_eq!(blocks[0].uid, blocks[1].uid);
    assert_eq!(blocks[1].uid, blocks[2].uid);

    // Every read byte is accounted for: one copy written, the repeats
    // counted as deduplicated even though the first write was still in
    // flight when they arrived.
    let version = vault.engine.version(&uid).unwrap();
    assert_eq!(version.bytes_read, 3 * BLOCK_SIZE as u64);
    assert_eq!(version.bytes_deduplicated, 2 * BLOCK_SIZE as u64);
    assert_eq!(version.bytes_sparse, 0);
    assert!(version.bytes_written > 0);
}

#[test]
fn restore_round_trips_including_sparse_and_tail() {
    let mut vault = TestVault::new();
    // Short tail block: 2.5 blocks of data.
    let mut data = striped_source();
    data.truncate(2 * BLOCK_SIZE + BLOCK_SIZE / 2);
    data.extend(random_bytes(9, BLOCK_SIZE / 4));
    let url = vault.write_source("vol.img", &data);
    let uid = backup(&mut vault, &url);

    let (target_url, target_path) = vault.target_url("restore.img");
    vault.engine.restore(&uid, &target_url, false, false).unwrap();
    assert_eq!(std::fs::read(&target_path).unwrap(), data);
}

#[test]
fn sparse_restore_skips_zero_blocks() {
    let mut vault = TestVault::new();
    let data = striped_source();
    let url = vault.write_source("vol.img", &data);
    let uid = backup(&mut vault, &url);

    let (target_url, target_path) = vault.target_url("restore.img");
    vault.engine.restore(&uid, &target_url, true, false).unwrap();
    // resize() zero-fills, so a skipped sparse block still reads as zeros.
    assert_eq!(std::fs::read(&target_path).unwrap(), data);
}

#[test]
fn gc_keeps_shared_blocks_until_the_last_referer_is_gone() {
    let mut vault = TestVault::new();
    let url = vault.write_source("vol.img", &striped_source());
    let first = backup(&mut vault, &url);
    let second = backup(&mut vault, &url);
    assert_eq!(vault.stored_block_objects().len(), 1);

    // First version gone, second still references the object.
    vault.engine.rm(&first, false).unwrap();
    let report = vault.engine.cleanup(0).unwrap();
    assert_eq!(report.removed_blocks, 0);
    assert_eq!(report.requeued_references, 1);
    assert_eq!(vault.stored_block_objects().len(), 1);

    // Last referer gone: the object is removed.
    vault.engine.rm(&second, false).unwrap();
    let report = vault.engine.cleanup(0).unwrap();
    assert_eq!(report.removed_blocks, 1);
    assert_eq!(vault.stored_block_objects().len(), 0);
}

#[test]
fn cleanup_honours_the_safety_delay() {
    let mut vault = TestVault::new();
    let url = vault.write_source("vol.img", &striped_source());
    let uid = backup(&mut vault, &url);
    vault.engine.rm(&uid, false).unwrap();

    // One hour of safety delay: the fresh queue entry must survive.
    let report = vault.engine.cleanup(3600).unwrap();
    assert_eq!(report.removed_blocks, 0);
    assert_eq!(vault.stored_block_objects().len(), 1);

    let report = vault.engine.cleanup(0).unwrap();
    assert_eq!(report.removed_blocks, 1);
    assert_eq!(vault.stored_block_objects().len(), 0);
}

#[test]
fn differential_backup_clones_and_diverges() {
    let mut vault = TestVault::new();
    let mut data = random_bytes(1, 4 * BLOCK_SIZE);
    let url = vault.write_source("vol.img", &data);
    let base = backup(&mut vault, &url);

    // Change exactly one block.
    data[2 * BLOCK_SIZE..3 * BLOCK_SIZE].copy_from_slice(&random_bytes(2, BLOCK_SIZE));
    let url = vault.write_source("vol.img", &data);
    let diff = vault
        .engine
        .backup("vol", "snap2", &url, None, Some(&base), BTreeMap::new())
        .unwrap();

    let version = vault.engine.version(&diff).unwrap();
    assert_eq!(version.status, VersionStatus::Valid);
    // The file adapter reports no changed-block hints, so everything is
    // re-read, but unchanged content deduplicates against the base.
    assert_eq!(version.bytes_deduplicated, 3 * BLOCK_SIZE as u64);

    let (target_url, target_path) = vault.target_url("restore.img");
    vault.engine.restore(&diff, &target_url, false, false).unwrap();
    assert_eq!(std::fs::read(&target_path).unwrap(), data);

    let db = Database::open(vault.db_path().to_str().unwrap()).unwrap();
    let base_blocks = db.blocks_by_version(&base).unwrap();
    let diff_blocks = db.blocks_by_version(&diff).unwrap();
    assert_eq!(base_blocks[0].uid, diff_blocks[0].uid);
    assert_ne!(base_blocks[2].uid, diff_blocks[2].uid);
}

#[test]
fn differential_base_must_be_valid() {
    let mut vault = TestVault::new();
    let url = vault.write_source("vol.img", &striped_source());
    let base = backup(&mut vault, &url);
    vault
        .engine
        .scrub(&base, blockvault::ScrubDepth::Deep, 100)
        .unwrap();

    // Invalidate the base by hand and try to build on it.
    let db = Database::open(vault.db_path().to_str().unwrap()).unwrap();
    db.set_version_status(&base, VersionStatus::Invalid).unwrap();
    drop(db);
    let err = vault
        .engine
        .backup("vol", "snap2", &url, None, Some(&base), BTreeMap::new())
        .unwrap_err();
    assert!(matches!(err, VaultError::Usage(_)));
}

#[test]
fn protected_versions_cannot_be_removed() {
    let mut vault = TestVault::new();
    let url = vault.write_source("vol.img", &striped_source());
    let uid = backup(&mut vault, &url);

    vault.engine.protect(&uid, true).unwrap();
    assert!(matches!(
        vault.engine.rm(&uid, false),
        Err(VaultError::Usage(_))
    ));
    vault.engine.protect(&uid, false).unwrap();
    vault.engine.rm(&uid, false).unwrap();
}

#[test]
fn labels_filter_listings() {
    let mut vault = TestVault::new();
    let url = vault.write_source("vol.img", &striped_source());
    let labels: BTreeMap<String, String> =
        [("tier".to_string(), "gold".to_string())].into_iter().collect();
    let uid = vault
        .engine
        .backup("vol-a", "snap-1", &url, None, None, labels)
        .unwrap();
    vault
        .engine
        .backup("vol-b", "snap-1", &url, None, None, BTreeMap::new())
        .unwrap();

    let all = vault.engine.ls(None, None).unwrap();
    assert_eq!(all.len(), 2);
    let filtered = vault.engine.ls(Some("vol-a"), None).unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].labels.get("tier").map(String::as_str), Some("gold"));

    vault.engine.add_label(&uid, "retain", "1y").unwrap();
    vault.engine.remove_label(&uid, "tier").unwrap();
    let version = vault.engine.version(&uid).unwrap();
    assert_eq!(version.labels.get("retain").map(String::as_str), Some("1y"));
    assert!(!version.labels.contains_key("tier"));
}

#[test]
fn metadata_documents_can_rebuild_a_lost_version() {
    let mut vault = TestVault::new();
    let data = striped_source();
    let url = vault.write_source("vol.img", &data);
    let uid = backup(&mut vault, &url);

    // Drop the version from the database only; the exported document and
    // the stored blocks survive.
    let mut db = Database::open(vault.db_path().to_str().unwrap()).unwrap();
    db.remove_version(&uid).unwrap();
    drop(db);
    assert!(vault.engine.version(&uid).is_err());

    let imported = vault.engine.metadata_import(None, &uid).unwrap();
    assert_eq!(imported.uid, uid);
    assert_eq!(imported.status, VersionStatus::Valid);

    let (target_url, target_path) = vault.target_url("restore.img");
    vault.engine.restore(&uid, &target_url, false, false).unwrap();
    assert_eq!(std::fs::read(&target_path).unwrap(), data);
}

#[test]
fn reencrypted_objects_differ_but_share_uid_and_checksum() {
    let mut vault = TestVault::new();
    let data = random_bytes(5, BLOCK_SIZE);
    let url = vault.write_source("vol.img", &data);

    let first = vault
        .engine
        .backup("vol", "a", &url, None, None, BTreeMap::new())
        .unwrap();
    let db = Database::open(vault.db_path().to_str().unwrap()).unwrap();
    let first_block = db.blocks_by_version(&first).unwrap().remove(0);
    let first_ciphertext = std::fs::read(&vault.stored_block_objects()[0]).unwrap();
    drop(db);

    // Forget the first version entirely, then back the same content up
    // again: a fresh envelope key and nonce yield a different
    // ciphertext, but the content address is unchanged.
    vault.engine.rm(&first, false).unwrap();
    vault.engine.cleanup(0).unwrap();
    assert_eq!(vault.stored_block_objects().len(), 0);

    let second = vault
        .engine
        .backup("vol", "b", &url, None, None, BTreeMap::new())
        .unwrap();
    let db = Database::open(vault.db_path().to_str().unwrap()).unwrap();
    let second_block = db.blocks_by_version(&second).unwrap().remove(0);
    let second_ciphertext = std::fs::read(&vault.stored_block_objects()[0]).unwrap();

    assert_eq!(first_block.uid, second_block.uid);
    assert_eq!(first_block.checksum, second_block.checksum);
    assert_ne!(first_ciphertext, second_ciphertext);
}
