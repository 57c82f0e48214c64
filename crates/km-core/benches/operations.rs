use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use km_core::{
    Algorithm, AuthorizationSet, AuthorizationView, BlockMode, Buffer, Digest, KeyFactoryRegistry,
    KeyManager, KeyParam, KeymasterConfig, OsRandom, PaddingMode, Purpose, RandomSource,
    SealingBlobMaker,
};

fn manager() -> KeyManager<SealingBlobMaker> {
    let config = KeymasterConfig::default();
    let random: Arc<dyn RandomSource> = Arc::new(OsRandom);
    let registry = KeyFactoryRegistry::from_config(&config, None, None, random.clone()).unwrap();
    let blobs = SealingBlobMaker::ephemeral(random).unwrap();
    KeyManager::new(&config, Arc::new(registry), Arc::new(blobs))
}

fn bench_aes_gcm_encrypt(c: &mut Criterion) {
    let manager = manager();
    let description = AuthorizationSet::new()
        .with(KeyParam::Algorithm(Algorithm::Aes))
        .with(KeyParam::KeySize(256))
        .with(KeyParam::Purpose(Purpose::Encrypt))
        .with(KeyParam::BlockMode(BlockMode::Gcm))
        .with(KeyParam::Padding(PaddingMode::None))
        .with(KeyParam::MinMacLength(128));
    let key = manager.generate_key(&description).unwrap();
    let params = AuthorizationSet::new()
        .with(KeyParam::BlockMode(BlockMode::Gcm))
        .with(KeyParam::Padding(PaddingMode::None))
        .with(KeyParam::MacLength(128));
    let plaintext = b"Hello, World! This is a test message for benchmarking.";

    c.bench_function("aes_gcm_encrypt", |b| {
        b.iter(|| {
            let mut begin_out = AuthorizationSet::new();
            let handle = manager
                .begin(Purpose::Encrypt, &key.key_blob, &params, &mut begin_out)
                .unwrap();
            assert!(begin_out.nonce().is_some());
            let mut output = Buffer::new();
            manager
                .finish(
                    handle,
                    &AuthorizationSet::new(),
                    black_box(plaintext),
                    &[],
                    &mut AuthorizationSet::new(),
                    &mut output,
                )
                .unwrap();
            output
        })
    });
}

fn bench_rsa_sign(c: &mut Criterion) {
    let manager = manager();
    let description = AuthorizationSet::new()
        .with(KeyParam::Algorithm(Algorithm::Rsa))
        .with(KeyParam::KeySize(2048))
        .with(KeyParam::RsaPublicExponent(65537))
        .with(KeyParam::Purpose(Purpose::Sign))
        .with(KeyParam::Padding(PaddingMode::RsaPss))
        .with(KeyParam::Digest(Digest::Sha256));
    let key = manager.generate_key(&description).unwrap();
    let params = AuthorizationSet::new()
        .with(KeyParam::Padding(PaddingMode::RsaPss))
        .with(KeyParam::Digest(Digest::Sha256));
    let payload = b"Hello, World! This is a test message for RSA signing.";

    c.bench_function("rsa_pss_sign", |b| {
        b.iter(|| {
            let handle = manager
                .begin(Purpose::Sign, &key.key_blob, &params, &mut AuthorizationSet::new())
                .unwrap();
            let mut signature = Buffer::new();
            manager
                .finish(
                    handle,
                    &AuthorizationSet::new(),
                    black_box(payload),
                    &[],
                    &mut AuthorizationSet::new(),
                    &mut signature,
                )
                .unwrap();
            signature
        })
    });
}

criterion_group!(benches, bench_aes_gcm_encrypt, bench_rsa_sign);
criterion_main!(benches);
