mod common;

use std::sync::Arc;

use common::{init_tracing, master_secrets, random, small_config};
use km_core::{
    Algorithm, AuthorizationSet, AuthorizationView, BlockMode, Buffer, Digest, ErrorCode,
    KeyFactoryRegistry, KeyFormat, KeyManager, KeyOrigin, KeyParam, KeymasterConfig, PaddingMode,
    Purpose, SealingBlobMaker,
};
use rand::rngs::OsRng;
use rsa::{
    Pkcs1v15Sign, RsaPrivateKey,
    pkcs8::{DecodePrivateKey, EncodePrivateKey},
    traits::PublicKeyParts,
};
use sha2::{Digest as _, Sha256};
use tempfile::TempDir;

fn setup_manager(config: &KeymasterConfig) -> KeyManager<SealingBlobMaker> {
    init_tracing();
    let registry =
        KeyFactoryRegistry::from_config(config, None, None, random()).expect("registry");
    let (master, hmac) = master_secrets();
    let blobs = SealingBlobMaker::new(master, hmac, random());
    KeyManager::new(config, Arc::new(registry), Arc::new(blobs))
}

fn aes_description(key_size: u32) -> AuthorizationSet {
    AuthorizationSet::new()
        .with(KeyParam::Algorithm(Algorithm::Aes))
        .with(KeyParam::KeySize(key_size))
        .with(KeyParam::Purpose(Purpose::Encrypt))
        .with(KeyParam::Purpose(Purpose::Decrypt))
        .with(KeyParam::BlockMode(BlockMode::Gcm))
        .with(KeyParam::BlockMode(BlockMode::Cbc))
        .with(KeyParam::Padding(PaddingMode::None))
        .with(KeyParam::Padding(PaddingMode::Pkcs7))
        .with(KeyParam::MinMacLength(128))
}

fn rsa_description() -> AuthorizationSet {
    AuthorizationSet::new()
        .with(KeyParam::Algorithm(Algorithm::Rsa))
        .with(KeyParam::KeySize(1024))
        .with(KeyParam::RsaPublicExponent(65537))
        .with(KeyParam::Purpose(Purpose::Sign))
        .with(KeyParam::Purpose(Purpose::Verify))
        .with(KeyParam::Padding(PaddingMode::RsaPkcs1_1_5Sign))
        .with(KeyParam::Digest(Digest::Sha256))
}

fn gcm_params(nonce: Option<Vec<u8>>) -> AuthorizationSet {
    let mut params = AuthorizationSet::new()
        .with(KeyParam::BlockMode(BlockMode::Gcm))
        .with(KeyParam::Padding(PaddingMode::None))
        .with(KeyParam::MacLength(128));
    if let Some(nonce) = nonce {
        params.push(KeyParam::Nonce(nonce));
    }
    params
}

#[test]
fn aes_key_sizes_generate_and_load() {
    let manager = setup_manager(&KeymasterConfig::default());
    for key_size in [128, 192, 256] {
        let description = aes_description(key_size);
        let key = manager.generate_key(&description).expect("generate");
        assert!(key.hw_enforced.is_empty());
        assert_eq!(key.sw_enforced.origin(), Some(KeyOrigin::Generated));

        let loaded = manager
            .load_key(&key.key_blob, &AuthorizationSet::new())
            .expect("load");
        assert_eq!(loaded.algorithm(), Algorithm::Aes);
        assert_eq!(loaded.key_material().len(), key_size as usize / 8);
        let authorizations = loaded.authorizations();
        for param in description.iter() {
            assert!(
                authorizations.contains_param(param),
                "{param:?} missing after load"
            );
        }
        assert_eq!(
            authorizations.len(),
            key.hw_enforced.len() + key.sw_enforced.len()
        );
    }
}

#[test]
fn unsupported_aes_sizes_are_refused() {
    let manager = setup_manager(&KeymasterConfig::default());
    for key_size in [0, 64, 127, 512] {
        let err = manager
            .generate_key(&aes_description(key_size))
            .expect_err("odd key size accepted");
        assert_eq!(err.code, ErrorCode::UnsupportedKeySize, "AES-{key_size}");
    }
}

#[test]
fn aes_import_round_trips_raw_material() {
    let manager = setup_manager(&KeymasterConfig::default());
    let material = hex::decode("000102030405060708090a0b0c0d0e0f").expect("hex");
    let description = aes_description(128);
    let key = manager
        .import_key(&description, KeyFormat::Raw, &material)
        .expect("import");
    assert_eq!(key.sw_enforced.origin(), Some(KeyOrigin::Imported));

    let loaded = manager
        .load_key(&key.key_blob, &AuthorizationSet::new())
        .expect("load");
    assert_eq!(
        loaded.formatted_key_material(KeyFormat::Raw).expect("raw"),
        material
    );

    let err = manager
        .import_key(&description, KeyFormat::Pkcs8, &material)
        .expect_err("AES from PKCS#8");
    assert_eq!(err.code, ErrorCode::UnsupportedKeyFormat);
    let err = manager
        .export_key(KeyFormat::Raw, &key.key_blob, &AuthorizationSet::new())
        .expect_err("AES export");
    assert_eq!(err.code, ErrorCode::UnsupportedKeyFormat);
}

#[test]
fn rsa_import_round_trips_pkcs8() {
    let manager = setup_manager(&KeymasterConfig::default());
    let private = RsaPrivateKey::new(&mut OsRng, 1024).expect("rsa key");
    let der = private.to_pkcs8_der().expect("pkcs8");
    let key = manager
        .import_key(&rsa_description(), KeyFormat::Pkcs8, der.as_bytes())
        .expect("import");

    let loaded = manager
        .load_key(&key.key_blob, &AuthorizationSet::new())
        .expect("load");
    let exported = loaded.formatted_key_material(KeyFormat::Pkcs8).expect("pkcs8");
    assert_eq!(
        RsaPrivateKey::from_pkcs8_der(&exported).expect("reparse"),
        private
    );
    let spki = manager
        .export_key(KeyFormat::X509, &key.key_blob, &AuthorizationSet::new())
        .expect("export");
    assert_eq!(
        spki,
        loaded.formatted_key_material(KeyFormat::X509).expect("x509")
    );
}

#[test]
fn rsa_sign_through_manager_verifies_with_public_key() {
    let manager = setup_manager(&KeymasterConfig::default());
    let private = RsaPrivateKey::new(&mut OsRng, 1024).expect("rsa key");
    let der = private.to_pkcs8_der().expect("pkcs8");
    let key = manager
        .import_key(&rsa_description(), KeyFormat::Pkcs8, der.as_bytes())
        .expect("import");
    let params = AuthorizationSet::new()
        .with(KeyParam::Padding(PaddingMode::RsaPkcs1_1_5Sign))
        .with(KeyParam::Digest(Digest::Sha256));

    let handle = manager
        .begin(Purpose::Sign, &key.key_blob, &params, &mut AuthorizationSet::new())
        .expect("begin");
    let mut ignored = Buffer::new();
    manager
        .update(
            handle,
            &AuthorizationSet::new(),
            b"attack at ",
            &mut AuthorizationSet::new(),
            &mut ignored,
        )
        .expect("update");
    let mut signature = Buffer::new();
    manager
        .finish(
            handle,
            &AuthorizationSet::new(),
            b"dawn",
            &[],
            &mut AuthorizationSet::new(),
            &mut signature,
        )
        .expect("finish");
    assert_eq!(signature.len(), private.size());
    private
        .to_public_key()
        .verify(
            Pkcs1v15Sign::new::<Sha256>(),
            &Sha256::digest(b"attack at dawn"),
            signature.as_slice(),
        )
        .expect("signature verifies");

    let handle = manager
        .begin(Purpose::Verify, &key.key_blob, &params, &mut AuthorizationSet::new())
        .expect("begin verify");
    let err = manager
        .finish(
            handle,
            &AuthorizationSet::new(),
            b"attack at dusk",
            signature.as_slice(),
            &mut AuthorizationSet::new(),
            &mut Buffer::new(),
        )
        .expect_err("wrong message verified");
    assert_eq!(err.code, ErrorCode::VerificationFailed);
    assert_eq!(manager.active_operations(), 0);
}

#[test]
fn gcm_encrypt_then_decrypt() {
    let manager = setup_manager(&KeymasterConfig::default());
    let key = manager
        .generate_key(&aes_description(256))
        .expect("generate");

    let mut begin_out = AuthorizationSet::new();
    let handle = manager
        .begin(Purpose::Encrypt, &key.key_blob, &gcm_params(None), &mut begin_out)
        .expect("begin");
    let nonce = begin_out.nonce().expect("generated nonce").to_vec();
    assert_eq!(nonce.len(), 12);

    let mut ciphertext = Buffer::new();
    manager
        .finish(
            handle,
            &AuthorizationSet::new(),
            b"keymaster plaintext",
            &[],
            &mut AuthorizationSet::new(),
            &mut ciphertext,
        )
        .expect("encrypt");
    assert_eq!(ciphertext.len(), b"keymaster plaintext".len() + 16);

    let handle = manager
        .begin(
            Purpose::Decrypt,
            &key.key_blob,
            &gcm_params(Some(nonce)),
            &mut AuthorizationSet::new(),
        )
        .expect("begin decrypt");
    let mut plaintext = Buffer::new();
    manager
        .finish(
            handle,
            &AuthorizationSet::new(),
            ciphertext.as_slice(),
            &[],
            &mut AuthorizationSet::new(),
            &mut plaintext,
        )
        .expect("decrypt");
    assert_eq!(plaintext.as_slice(), b"keymaster plaintext");
}

#[test]
fn application_binding_is_required_to_load() {
    let manager = setup_manager(&KeymasterConfig::default());
    let description = aes_description(128)
        .with(KeyParam::ApplicationId(b"com.example.wallet".to_vec()));
    let key = manager.generate_key(&description).expect("generate");

    let err = manager
        .load_key(&key.key_blob, &AuthorizationSet::new())
        .expect_err("loaded without application id");
    assert_eq!(err.code, ErrorCode::InvalidKeyBlob);

    let binding =
        AuthorizationSet::new().with(KeyParam::ApplicationId(b"com.example.wallet".to_vec()));
    manager.load_key(&key.key_blob, &binding).expect("load");
}

#[test]
fn aborted_operation_handle_is_released() {
    let manager = setup_manager(&KeymasterConfig::default());
    let key = manager
        .generate_key(&aes_description(128))
        .expect("generate");
    let handle = manager
        .begin(
            Purpose::Encrypt,
            &key.key_blob,
            &gcm_params(None),
            &mut AuthorizationSet::new(),
        )
        .expect("begin");

    manager.abort(handle).expect("abort");
    assert_eq!(manager.active_operations(), 0);
    let err = manager.abort(handle).expect_err("second abort");
    assert_eq!(err.code, ErrorCode::InvalidOperationHandle);
    let err = manager
        .update(
            handle,
            &AuthorizationSet::new(),
            b"late",
            &mut AuthorizationSet::new(),
            &mut Buffer::new(),
        )
        .expect_err("update after abort");
    assert_eq!(err.code, ErrorCode::InvalidOperationHandle);
}

#[test]
fn operation_table_capacity_comes_from_config() {
    let manager = setup_manager(&small_config());
    let key = manager
        .generate_key(&aes_description(128))
        .expect("generate");
    let mut handles = Vec::new();
    for _ in 0..4 {
        handles.push(
            manager
                .begin(
                    Purpose::Encrypt,
                    &key.key_blob,
                    &gcm_params(None),
                    &mut AuthorizationSet::new(),
                )
                .expect("begin"),
        );
    }
    let err = manager
        .begin(
            Purpose::Encrypt,
            &key.key_blob,
            &gcm_params(None),
            &mut AuthorizationSet::new(),
        )
        .expect_err("fifth operation");
    assert_eq!(err.code, ErrorCode::TooManyOperations);

    manager.abort(handles[0]).expect("abort");
    manager
        .begin(
            Purpose::Encrypt,
            &key.key_blob,
            &gcm_params(None),
            &mut AuthorizationSet::new(),
        )
        .expect("slot freed");
}

#[test]
fn config_file_drives_the_registry() {
    let temp = TempDir::new().expect("temp dir");
    let path = temp.path().join("keymaster.toml");
    std::fs::write(
        &path,
        "max_operations = 2\n\n[rsa]\nmin_key_size = 2048\nmax_key_size = 4096\n",
    )
    .expect("write config");
    let config = KeymasterConfig::load(&path).expect("load config");
    assert_eq!(config.max_operations, 2);

    let manager = setup_manager(&config);
    let err = manager
        .generate_key(&rsa_description())
        .expect_err("1024-bit RSA below the configured minimum");
    assert_eq!(err.code, ErrorCode::UnsupportedKeySize);
    assert_eq!(
        manager.registry().algorithms(),
        vec![Algorithm::Rsa, Algorithm::Aes]
    );
}
