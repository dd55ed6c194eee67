use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use blockvault::hash::{BlockHash, HashAlgorithm};
use blockvault::transform::aes_gcm::{AesGcmConfig, AesGcmTransform};
use blockvault::transform::zstd::{ZstdConfig, ZstdTransform};
use blockvault::transform::Transform;

fn bench_block_pipeline(c: &mut Criterion) {
    let block = vec![0x5au8; 4 * 1024 * 1024];
    let hash = BlockHash::new(HashAlgorithm::Blake2b { digest_bits: 256 }).unwrap();
    let zstd = ZstdTransform::new("z1", ZstdConfig { level: 3, dict_data_file: None }).unwrap();
    let aes = AesGcmTransform::new(
        "enc1",
        AesGcmConfig {
            master_key: Some(BASE64.encode([7u8; 32])),
            kdf_salt: None,
            kdf_iterations: None,
            password: None,
        },
    )
    .unwrap();

    c.bench_function("blake2b_hash_4mb", |b| b.iter(|| hash.digest(black_box(&block))));
    c.bench_function("zstd_encapsulate_4mb", |b| b.iter(|| zstd.encapsulate(black_box(&block))));
    c.bench_function("aes_gcm_encapsulate_4mb", |b| b.iter(|| aes.encapsulate(black_box(&block))));
}

criterion_group!(benches, bench_block_pipeline);
criterion_main!(benches);
