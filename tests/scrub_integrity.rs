//! Scrub depths, tamper detection, and restore verification.

mod common;

use std::collections::BTreeMap;
use std::path::PathBuf;

use blockvault::{ScrubDepth, VaultError, VersionStatus, VersionUid};
use common::{random_bytes, TestVault, BLOCK_SIZE};

fn backup_one_block(vault: &mut TestVault) -> VersionUid {
    let url = vault.write_source("vol.img", &random_bytes(77, BLOCK_SIZE));
    vault
        .engine
        .backup("vol", "snap", &url, None, None, BTreeMap::new())
        .expect("backup")
}

fn sidecar_of(object: &PathBuf) -> PathBuf {
    let mut sidecar = object.clone().into_os_string();
    sidecar.push(".meta");
    PathBuf::from(sidecar)
}

#[test]
fn intact_version_passes_both_depths() {
    let mut vault = TestVault::new();
    let uid = backup_one_block(&mut vault);

    let report = vault.engine.scrub(&uid, ScrubDepth::Metadata, 100).unwrap();
    assert_eq!(report.checked_blocks, 1);
    assert!(report.complete_pass);

    let report = vault.engine.scrub(&uid, ScrubDepth::Deep, 100).unwrap();
    assert_eq!(report.checked_blocks, 1);
    assert_eq!(vault.engine.version(&uid).unwrap().status, VersionStatus::Valid);
}

#[test]
fn deep_scrub_detects_a_flipped_ciphertext_byte() {
    let mut vault = TestVault::new();
    let uid = backup_one_block(&mut vault);

    let object = vault.stored_block_objects().remove(0);
    let mut bytes = std::fs::read(&object).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x01;
    std::fs::write(&object, &bytes).unwrap();

    // The metadata depth only checks lengths and the HMAC: it stays
    // green, because the sidecar is untouched and the length unchanged.
    vault.engine.scrub(&uid, ScrubDepth::Metadata, 100).unwrap();

    let err = vault.engine.scrub(&uid, ScrubDepth::Deep, 100).unwrap_err();
    assert!(matches!(err, VaultError::Scrubbing(_)));
    assert_eq!(
        vault.engine.version(&uid).unwrap().status,
        VersionStatus::Invalid
    );
}

#[test]
fn metadata_scrub_detects_a_truncated_object() {
    let mut vault = TestVault::new();
    let uid = backup_one_block(&mut vault);

    let object = vault.stored_block_objects().remove(0);
    let mut bytes = std::fs::read(&object).unwrap();
    bytes.truncate(bytes.len() - 1);
    std::fs::write(&object, &bytes).unwrap();

    let err = vault
        .engine
        .scrub(&uid, ScrubDepth::Metadata, 100)
        .unwrap_err();
    assert!(matches!(err, VaultError::Scrubbing(_)));
    assert_eq!(
        vault.engine.version(&uid).unwrap().status,
        VersionStatus::Invalid
    );
}

#[test]
fn tampered_sidecar_fails_the_scrub_via_hmac() {
    let mut vault = TestVault::new();
    let uid = backup_one_block(&mut vault);

    let sidecar = sidecar_of(&vault.stored_block_objects()[0]);
    let mut raw = std::fs::read(&sidecar).unwrap();
    // Flip a digit inside the JSON so it still parses.
    let position = raw.iter().position(|&b| b.is_ascii_digit()).unwrap();
    raw[position] = if raw[position] == b'1' { b'2' } else { b'1' };
    std::fs::write(&sidecar, &raw).unwrap();

    let err = vault
        .engine
        .scrub(&uid, ScrubDepth::Metadata, 100)
        .unwrap_err();
    assert!(matches!(err, VaultError::Scrubbing(_)));
}

#[test]
fn restore_aborts_on_a_tampered_sidecar_without_writing_data() {
    let mut vault = TestVault::new();
    let uid = backup_one_block(&mut vault);

    let sidecar = sidecar_of(&vault.stored_block_objects()[0]);
    let mut raw = std::fs::read(&sidecar).unwrap();
    let position = raw.iter().position(|&b| b.is_ascii_digit()).unwrap();
    raw[position] = if raw[position] == b'1' { b'2' } else { b'1' };
    std::fs::write(&sidecar, &raw).unwrap();

    let (target_url, target_path) = vault.target_url("restore.img");
    let err = vault
        .engine
        .restore(&uid, &target_url, false, false)
        .unwrap_err();
    assert!(matches!(err, VaultError::Scrubbing(_)));
    assert_eq!(
        vault.engine.version(&uid).unwrap().status,
        VersionStatus::Invalid
    );

    // Nothing of the plaintext reached the target: the preallocated
    // file reads as all zeros.
    let written = std::fs::read(&target_path).unwrap();
    assert!(written.iter().all(|&b| b == 0));
}

#[test]
fn restore_verifies_the_plaintext_checksum() {
    // Without encryption, a ciphertext flip survives until the checksum
    // comparison, which must still catch it.
    let mut vault = TestVault::with_active_transforms(&["z1"]);
    let uid = backup_one_block(&mut vault);

    let object = vault.stored_block_objects().remove(0);
    let mut bytes = std::fs::read(&object).unwrap();
    let position = bytes.len() / 2;
    bytes[position] ^= 0x01;
    std::fs::write(&object, &bytes).unwrap();

    let (target_url, _) = vault.target_url("restore.img");
    let err = vault
        .engine
        .restore(&uid, &target_url, false, false)
        .unwrap_err();
    assert!(matches!(err, VaultError::Scrubbing(_)));
    assert_eq!(
        vault.engine.version(&uid).unwrap().status,
        VersionStatus::Invalid
    );
}

#[test]
fn partial_scrub_of_an_intact_version_changes_nothing() {
    let mut vault = TestVault::new();
    let url = vault.write_source("vol.img", &random_bytes(3, 8 * BLOCK_SIZE));
    let uid = vault
        .engine
        .backup("vol", "snap", &url, None, None, BTreeMap::new())
        .unwrap();

    let report = vault.engine.scrub(&uid, ScrubDepth::Deep, 40).unwrap();
    assert!(!report.complete_pass);
    assert!(report.checked_blocks <= report.total_blocks);
    assert_eq!(vault.engine.version(&uid).unwrap().status, VersionStatus::Valid);
}
