use super::*;

#[test]
fn test_sha256_round_trip() {
    let hash = Hash::sha256_from_bytes(b"hello world");
    let base32 = hash.to_typed_base32();
    let base16 = hash.to_typed_base16();

    assert!(base32.starts_with("sha256:"));
    assert_eq!(hash, Hash::from_typed(&base16).unwrap());
}

#[test]
fn test_rejects_unsupported_algorithm() {
    assert!(Hash::from_typed("md5:abcd").is_err());
}

#[test]
fn test_rejects_bad_length() {
    assert!(Hash::from_typed("sha256:abcd").is_err());
}

#[test]
fn test_rejects_missing_colon() {
    assert!(Hash::from_typed("deadbeef").is_err());
}
