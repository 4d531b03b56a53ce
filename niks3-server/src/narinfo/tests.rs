use super::*;

use niks3::signing::NixKeypair;

fn sample_narinfo() -> NarInfo {
    NarInfo {
        store_path: PathBuf::from("/nix/store/xcp9cav49dmsjbwdjlmkjxj10gkpx553-hello-2.10"),
        url: "nar/0nqgf15qfiacfxrgm2wkw0gwwncjqqzzalj8rs14w9srkydkjsk9.nar.zst".into(),
        nar_hash: Hash::from_typed(
            "sha256:16mvl7v0ylzcg2n3xzjn41qhzbmgcn5iyarx16nn5l2r36n2kqci",
        )
        .unwrap(),
        nar_size: 206104,
        file_hash: Some(
            Hash::from_typed("sha256:0nqgf15qfiacfxrgm2wkw0gwwncjqqzzalj8rs14w9srkydkjsk9").unwrap(),
        ),
        file_size: Some(41104),
        references: vec![
            "xcp9cav49dmsjbwdjlmkjxj10gkpx553-hello-2.10".into(),
            "563528481rvhc5kxwipjmg6rqrl95mdx-glibc-2.33-56".into(),
        ],
        deriver: Some("vvb4wxmnjixmrkhmj2xb75z62hrr41i7-hello-2.10.drv".into()),
        signatures: Vec::new(),
        ca: None,
    }
}

#[test]
fn test_render_field_order() {
    let narinfo = sample_narinfo();
    let rendered = narinfo.render();
    let lines: Vec<&str> = rendered.lines().collect();

    assert_eq!(lines[0], "StorePath: /nix/store/xcp9cav49dmsjbwdjlmkjxj10gkpx553-hello-2.10");
    assert_eq!(
        lines[1],
        "URL: nar/0nqgf15qfiacfxrgm2wkw0gwwncjqqzzalj8rs14w9srkydkjsk9.nar.zst"
    );
    assert_eq!(lines[2], "Compression: zstd");
    assert!(lines[3].starts_with("NarHash: sha256:"));
    assert_eq!(lines[4], "NarSize: 206104");
    assert!(lines[5].starts_with("FileHash: sha256:"));
    assert_eq!(lines[6], "FileSize: 41104");
    assert_eq!(
        lines[7],
        "References: 563528481rvhc5kxwipjmg6rqrl95mdx-glibc-2.33-56 xcp9cav49dmsjbwdjlmkjxj10gkpx553-hello-2.10"
    );
    assert_eq!(lines[8], "Deriver: vvb4wxmnjixmrkhmj2xb75z62hrr41i7-hello-2.10.drv");
}

#[test]
fn test_render_omits_absent_optional_fields() {
    let mut narinfo = sample_narinfo();
    narinfo.file_hash = None;
    narinfo.file_size = None;
    narinfo.deriver = None;

    let rendered = narinfo.render();
    assert!(!rendered.contains("FileHash"));
    assert!(!rendered.contains("FileSize"));
    assert!(!rendered.contains("Deriver"));
}

#[test]
fn test_fingerprint_matches_nix_format() {
    let narinfo = sample_narinfo();
    let fingerprint = narinfo.fingerprint();

    let expected = b"1;/nix/store/xcp9cav49dmsjbwdjlmkjxj10gkpx553-hello-2.10;sha256:16mvl7v0ylzcg2n3xzjn41qhzbmgcn5iyarx16nn5l2r36n2kqci;206104;/nix/store/563528481rvhc5kxwipjmg6rqrl95mdx-glibc-2.33-56,/nix/store/xcp9cav49dmsjbwdjlmkjxj10gkpx553-hello-2.10";

    assert_eq!(fingerprint.as_slice(), expected.as_slice());
}

#[test]
fn test_sign_produces_verifiable_signature() {
    let mut narinfo = sample_narinfo();
    let keypair = NixKeypair::generate("niks3-test").unwrap();

    narinfo.sign(std::slice::from_ref(&keypair));

    assert_eq!(narinfo.signatures.len(), 1);
    keypair
        .verify(&narinfo.fingerprint(), &narinfo.signatures[0])
        .expect("signature must verify against the fingerprint");
}

#[test]
fn test_sign_sorts_multiple_signatures() {
    let mut narinfo = sample_narinfo();
    let a = NixKeypair::generate("aaa").unwrap();
    let b = NixKeypair::generate("zzz").unwrap();

    narinfo.sign(&[b, a]);
    let rendered = narinfo.render();

    let sig_lines: Vec<&str> = rendered.lines().filter(|l| l.starts_with("Sig: ")).collect();
    assert_eq!(sig_lines.len(), 2);
    assert!(sig_lines[0] < sig_lines[1]);
}

#[test]
fn test_estimate_part_count_unknown_size_defaults_to_ten() {
    assert_eq!(estimate_part_count(None), 10);
}

#[test]
fn test_estimate_part_count_small_nar_clamps_to_minimum() {
    assert_eq!(estimate_part_count(Some(1024)), 2);
}

#[test]
fn test_estimate_part_count_huge_nar_clamps_to_maximum() {
    assert_eq!(estimate_part_count(Some(100 * 1024 * 1024 * 1024)), 100);
}

#[test]
fn test_estimate_part_count_applies_pad_factor() {
    // 100 MiB / 10 MiB = 10 parts; * 1.2 = 12.
    assert_eq!(estimate_part_count(Some(100 * 1024 * 1024)), 12);
}
