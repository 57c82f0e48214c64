//! RSA message encodings from RFC 8017: EMSA-PKCS1-v1_5, EMSA-PSS,
//! RSAES-PKCS1-v1_5 and RSAES-OAEP. Everything here works on byte strings;
//! the modular exponentiation lives with the key.

use subtle::{Choice, ConditionallySelectable, ConstantTimeEq, ConstantTimeGreater};
use tracing::error;
use zeroize::Zeroizing;

use crate::{
    digest::hash,
    error::{KmError, KmResult},
    km_err,
    random::RandomSource,
    types::Digest,
};

const SHA224_PREFIX: [u8; 19] = [
    0x30, 0x2d, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x04, 0x05,
    0x00, 0x04, 0x1c,
];
const SHA256_PREFIX: [u8; 19] = [
    0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01, 0x05,
    0x00, 0x04, 0x20,
];
const SHA384_PREFIX: [u8; 19] = [
    0x30, 0x41, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02, 0x05,
    0x00, 0x04, 0x30,
];
const SHA512_PREFIX: [u8; 19] = [
    0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03, 0x05,
    0x00, 0x04, 0x40,
];

/// Minimum PKCS#1 v1.5 overhead: two marker bytes, eight padding bytes and
/// the separator.
pub const PKCS1_OVERHEAD: usize = 11;

/// DER `DigestInfo` wrapping of an already computed hash.
pub fn digest_info(digest: Digest, hashed: &[u8]) -> KmResult<Vec<u8>> {
    let prefix: &[u8] = match digest {
        Digest::Sha224 => &SHA224_PREFIX,
        Digest::Sha256 => &SHA256_PREFIX,
        Digest::Sha384 => &SHA384_PREFIX,
        Digest::Sha512 => &SHA512_PREFIX,
        other => return Err(km_err!(UnsupportedDigest, "no DigestInfo for {other:?}")),
    };
    let mut out = Vec::with_capacity(prefix.len() + hashed.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(hashed);
    Ok(out)
}

/// EMSA-PKCS1-v1_5 block: `00 01 FF.. 00 T`, `k` bytes long.
pub fn pkcs1_sign_pad(t: &[u8], k: usize) -> KmResult<Vec<u8>> {
    if t.len() + PKCS1_OVERHEAD > k {
        return Err(km_err!(
            InvalidInputLength,
            "{} bytes too long for PKCS#1 signature with {k}-byte modulus",
            t.len()
        ));
    }
    let mut em = vec![0xffu8; k];
    em[0] = 0x00;
    em[1] = 0x01;
    em[k - t.len() - 1] = 0x00;
    em[k - t.len()..].copy_from_slice(t);
    Ok(em)
}

/// RSAES-PKCS1-v1_5 block: `00 02 PS 00 M` with non-zero random `PS`.
pub fn pkcs1_encrypt_pad(msg: &[u8], k: usize, rng: &dyn RandomSource) -> KmResult<Vec<u8>> {
    if msg.len() + PKCS1_OVERHEAD > k {
        return Err(km_err!(
            InvalidInputLength,
            "{} bytes too long for PKCS#1 encryption with {k}-byte modulus",
            msg.len()
        ));
    }
    let ps_len = k - msg.len() - 3;
    let mut em = vec![0u8; k];
    em[1] = 0x02;
    let ps = &mut em[2..2 + ps_len];
    rng.fill_bytes(ps)?;
    for byte in ps.iter_mut() {
        while *byte == 0 {
            let mut replacement = [0u8; 1];
            rng.fill_bytes(&mut replacement)?;
            *byte = replacement[0];
        }
    }
    em[k - msg.len()..].copy_from_slice(msg);
    Ok(em)
}

fn decryption_failed() -> KmError {
    KmError::crypto("RSA decryption failed")
}

/// Strips an RSAES-PKCS1-v1_5 block. Every malformed block takes the same
/// path and fails with the same error.
pub fn pkcs1_encrypt_unpad(em: &[u8]) -> KmResult<Vec<u8>> {
    if em.len() < PKCS1_OVERHEAD {
        return Err(decryption_failed());
    }
    let header_ok = em[0].ct_eq(&0x00) & em[1].ct_eq(&0x02);
    let mut found = Choice::from(0);
    let mut separator = 0u32;
    for (i, byte) in em.iter().enumerate().skip(2) {
        let is_zero = byte.ct_eq(&0x00);
        separator.conditional_assign(&(i as u32), is_zero & !found);
        found |= is_zero;
    }
    // at least eight bytes of PS
    let valid = header_ok & found & separator.ct_gt(&9);
    if !bool::from(valid) {
        return Err(decryption_failed());
    }
    Ok(em[separator as usize + 1..].to_vec())
}

fn mgf1(digest: Digest, seed: &[u8], len: usize) -> KmResult<Vec<u8>> {
    let mut mask = Vec::with_capacity(len + digest.output_len());
    let mut counter: u32 = 0;
    while mask.len() < len {
        let mut input = Vec::with_capacity(seed.len() + 4);
        input.extend_from_slice(seed);
        input.extend_from_slice(&counter.to_be_bytes());
        mask.extend_from_slice(&hash(digest, &input)?);
        counter += 1;
    }
    mask.truncate(len);
    Ok(mask)
}

fn xor_in_place(target: &mut [u8], mask: &[u8]) {
    for (t, m) in target.iter_mut().zip(mask) {
        *t ^= *m;
    }
}

fn pss_hash(digest: Digest, m_hash: &[u8], salt: &[u8]) -> KmResult<Vec<u8>> {
    let mut m_prime = vec![0u8; 8];
    m_prime.extend_from_slice(m_hash);
    m_prime.extend_from_slice(salt);
    hash(digest, &m_prime)
}

/// EMSA-PSS encoding with a salt as long as the digest. The result is
/// `ceil(em_bits / 8)` bytes.
pub fn pss_encode(
    digest: Digest,
    m_hash: &[u8],
    em_bits: usize,
    rng: &dyn RandomSource,
) -> KmResult<Vec<u8>> {
    let h_len = digest.output_len();
    let em_len = em_bits.div_ceil(8);
    if em_len < 2 * h_len + 2 {
        error!("{em_bits}-bit PSS encoding cannot hold a {digest:?} hash and salt");
        return Err(km_err!(
            IncompatibleDigest,
            "key too small for PSS with {digest:?}"
        ));
    }
    let mut salt = vec![0u8; h_len];
    rng.fill_bytes(&mut salt)?;
    let h = pss_hash(digest, m_hash, &salt)?;

    let db_len = em_len - h_len - 1;
    let mut db = vec![0u8; db_len];
    db[db_len - h_len - 1] = 0x01;
    db[db_len - h_len..].copy_from_slice(&salt);
    xor_in_place(&mut db, &mgf1(digest, &h, db_len)?);
    db[0] &= 0xffu8 >> (8 * em_len - em_bits);

    let mut em = db;
    em.extend_from_slice(&h);
    em.push(0xbc);
    Ok(em)
}

/// EMSA-PSS verification with a digest-length salt.
pub fn pss_verify(digest: Digest, m_hash: &[u8], em: &[u8], em_bits: usize) -> KmResult<bool> {
    let h_len = digest.output_len();
    let em_len = em_bits.div_ceil(8);
    if em.len() != em_len || em_len < 2 * h_len + 2 || em[em_len - 1] != 0xbc {
        return Ok(false);
    }
    let db_len = em_len - h_len - 1;
    let top_mask = 0xffu8 >> (8 * em_len - em_bits);
    if em[0] & !top_mask != 0 {
        return Ok(false);
    }
    let h = &em[db_len..em_len - 1];
    let mut db = em[..db_len].to_vec();
    xor_in_place(&mut db, &mgf1(digest, h, db_len)?);
    db[0] &= top_mask;

    let ps_len = db_len - h_len - 1;
    if db[..ps_len].iter().any(|b| *b != 0) || db[ps_len] != 0x01 {
        return Ok(false);
    }
    let salt = &db[ps_len + 1..];
    Ok(pss_hash(digest, m_hash, salt)? == h)
}

/// Largest message RSAES-OAEP can carry in a `k`-byte modulus.
pub fn oaep_max_message_len(digest: Digest, k: usize) -> usize {
    k.saturating_sub(2 * digest.output_len() + 2)
}

/// RSAES-OAEP encoding with an empty label; MGF1 uses the same digest.
pub fn oaep_encode(
    digest: Digest,
    msg: &[u8],
    k: usize,
    rng: &dyn RandomSource,
) -> KmResult<Vec<u8>> {
    let h_len = digest.output_len();
    if k < 2 * h_len + 2 {
        return Err(km_err!(IncompatibleDigest, "key too small for OAEP with {digest:?}"));
    }
    if msg.len() > oaep_max_message_len(digest, k) {
        return Err(km_err!(
            InvalidInputLength,
            "{} bytes too long for OAEP with {digest:?}",
            msg.len()
        ));
    }
    let db_len = k - h_len - 1;
    let mut db = hash(digest, &[])?;
    db.resize(db_len - msg.len() - 1, 0);
    db.push(0x01);
    db.extend_from_slice(msg);

    let mut seed = vec![0u8; h_len];
    rng.fill_bytes(&mut seed)?;
    xor_in_place(&mut db, &mgf1(digest, &seed, db_len)?);
    xor_in_place(&mut seed, &mgf1(digest, &db, h_len)?);

    let mut em = Vec::with_capacity(k);
    em.push(0x00);
    em.extend_from_slice(&seed);
    em.extend_from_slice(&db);
    Ok(em)
}

/// RSAES-OAEP decoding. The leading byte, label hash and separator checks
/// are all accumulated before the single failure point.
pub fn oaep_decode(digest: Digest, em: &[u8]) -> KmResult<Vec<u8>> {
    let h_len = digest.output_len();
    let k = em.len();
    if k < 2 * h_len + 2 {
        return Err(decryption_failed());
    }
    let leading_ok = em[0].ct_eq(&0x00);
    let mut seed = Zeroizing::new(em[1..1 + h_len].to_vec());
    let mut db = Zeroizing::new(em[1 + h_len..].to_vec());
    let db_len = db.len();
    xor_in_place(&mut seed, &mgf1(digest, &db, h_len)?);
    xor_in_place(&mut db, &mgf1(digest, &seed, db_len)?);

    let l_hash = hash(digest, &[])?;
    let hash_ok = db[..h_len].ct_eq(&l_hash[..]);

    let mut looking = Choice::from(1);
    let mut stray = Choice::from(0);
    let mut index = 0u32;
    for (i, byte) in db.iter().enumerate().skip(h_len) {
        let is_zero = byte.ct_eq(&0x00);
        let is_one = byte.ct_eq(&0x01);
        index.conditional_assign(&(i as u32), looking & is_one);
        stray |= looking & !is_zero & !is_one;
        looking &= !is_one;
    }
    let valid = leading_ok & hash_ok & !looking & !stray;
    if !bool::from(valid) {
        return Err(decryption_failed());
    }
    Ok(db[index as usize + 1..].to_vec())
}
