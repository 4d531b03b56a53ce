//! NAR info.
//!
//! ## `.narinfo` format
//!
//! ```text
//! StorePath: /nix/store/p4pclmv1gyja5kzc26npqpia1qqxrf0l-ruby-2.7.3
//! URL: nar/1w1fff338fvdw53sqgamddn1b2xgds473pv6y13gizdbqjv4i5p3.nar.zst
//! Compression: zstd
//! NarHash: sha256:1impfw8zdgisxkghq9a3q7cn7jb9zyzgxdydiamp8z2nlyyl0h5h
//! NarSize: 18735072
//! FileHash: sha256:1w1fff338fvdw53sqgamddn1b2xgds473pv6y13gizdbqjv4i5p3
//! FileSize: 4029176
//! References: 0d71ygfwbmy1xjlbj1v027dfmy9cqavy-libffi-3.3 p4pclmv1gyja5kzc26npqpia1qqxrf0l-ruby-2.7.3
//! Deriver: bidkcs01mww363s4s7akdhbl6ws66b0z-ruby-2.7.3.drv
//! Sig: cache.nixos.org-1:GrGV/Ls10TzoOaCnrcAqmPbKXFLLSBDeGNh5EQGKyuGA4K1wv1LcRVb6/sU+NAPK8lDiam8XcdJzUngmdhfTBQ==
//! ```
//!
//! Unlike the generic serde-based `nix_manifest` machinery this format
//! is usually parsed with, the field order here is fixed by this crate
//! (see the module-level table in the external interfaces section this
//! tracks), so rendering is hand-written rather than derived.
//!
//! ## Fingerprint
//!
//! ```text
//! 1;{storePath};{narHash};{narSize};{commaDelimitedReferences}
//! ```

use std::path::{Path, PathBuf};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use niks3::hash::Hash;
use niks3::mime;
use niks3::signing::NixKeypair;

#[cfg(test)]
mod tests;

/// NAR information, ready to render to the wire format or sign.
#[derive(Debug, Clone)]
pub struct NarInfo {
    /// The full store path being cached, including the store directory.
    /// Part of the fingerprint.
    pub store_path: PathBuf,

    /// The URL to fetch the compressed NAR from, relative to the cache
    /// base URL.
    pub url: String,

    /// The hash of the uncompressed NAR. Part of the fingerprint.
    pub nar_hash: Hash,

    /// The size of the uncompressed NAR, in bytes. Part of the fingerprint.
    pub nar_size: u64,

    /// The hash of the compressed file on S3.
    pub file_hash: Option<Hash>,

    /// The size of the compressed file on S3.
    pub file_size: Option<u64>,

    /// Other store paths this object directly references (base names
    /// only). Part of the fingerprint, sorted for the wire.
    pub references: Vec<String>,

    /// The derivation that produced this object (base name only).
    pub deriver: Option<String>,

    /// Signatures, one per signing key, in `name:base64` form.
    pub signatures: Vec<String>,

    /// The content address of the object, if content-addressed.
    pub ca: Option<String>,
}

impl NarInfo {
    /// Returns the store directory of this object.
    fn store_dir(&self) -> &Path {
        self.store_path
            .parent()
            .expect("store_path must have a parent directory")
    }

    /// Renders the narinfo to its wire format, in deterministic field
    /// order. References are sorted; signatures are rendered one `Sig:`
    /// line per entry, in the order already sorted by the caller.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("StorePath: ");
        out.push_str(&self.store_path.to_string_lossy());
        out.push('\n');

        out.push_str("URL: ");
        out.push_str(&self.url);
        out.push('\n');

        out.push_str("Compression: zstd\n");

        out.push_str("NarHash: ");
        out.push_str(&self.nar_hash.to_typed_base32());
        out.push('\n');

        out.push_str("NarSize: ");
        out.push_str(&self.nar_size.to_string());
        out.push('\n');

        if let Some(file_hash) = &self.file_hash {
            out.push_str("FileHash: ");
            out.push_str(&file_hash.to_typed_base32());
            out.push('\n');
        }

        if let Some(file_size) = self.file_size {
            out.push_str("FileSize: ");
            out.push_str(&file_size.to_string());
            out.push('\n');
        }

        let mut references = self.references.clone();
        references.sort();
        out.push_str("References: ");
        out.push_str(&references.join(" "));
        out.push('\n');

        if let Some(deriver) = &self.deriver {
            out.push_str("Deriver: ");
            out.push_str(deriver);
            out.push('\n');
        }

        let mut signatures = self.signatures.clone();
        signatures.sort();
        for signature in &signatures {
            out.push_str("Sig: ");
            out.push_str(signature);
            out.push('\n');
        }

        if let Some(ca) = &self.ca {
            out.push_str("CA: ");
            out.push_str(ca);
            out.push('\n');
        }

        out
    }

    /// Returns the signing fingerprint: the canonical pre-image that
    /// `Sig:` lines are computed over, not the rendered body.
    pub fn fingerprint(&self) -> Vec<u8> {
        let store_dir = self.store_dir();
        let mut fingerprint = b"1;".to_vec();

        fingerprint.extend(self.store_path.to_string_lossy().as_bytes());
        fingerprint.push(b';');

        fingerprint.extend(self.nar_hash.to_typed_base32().as_bytes());
        fingerprint.push(b';');

        fingerprint.extend(self.nar_size.to_string().as_bytes());
        fingerprint.push(b';');

        let mut references = self.references.clone();
        references.sort();

        let mut iter = references.iter().peekable();
        while let Some(reference) = iter.next() {
            fingerprint.extend(store_dir.to_string_lossy().as_bytes());
            fingerprint.push(b'/');
            fingerprint.extend(reference.as_bytes());

            if iter.peek().is_some() {
                fingerprint.push(b',');
            }
        }

        fingerprint
    }

    /// Signs the fingerprint with every given keypair, appending to
    /// `signatures`. `render` sorts them lexically before writing.
    pub fn sign(&mut self, keypairs: &[NixKeypair]) {
        let fingerprint = self.fingerprint();

        for keypair in keypairs {
            self.signatures.push(keypair.sign(&fingerprint));
        }
    }
}

impl IntoResponse for NarInfo {
    fn into_response(self) -> Response {
        Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", mime::NARINFO)
            .body(self.render())
            .expect("a rendered narinfo is always a valid response body")
            .into_response()
    }
}

/// Computes the multipart part count for a NAR of `nar_size` bytes,
/// per the part-count estimation formula: `ceil(size / 10MiB) * 1.2`,
/// clamped to `[2, 100]`, defaulting to 10 when size is unknown.
pub fn estimate_part_count(nar_size: Option<u64>) -> u32 {
    const PART_SIZE: u64 = 10 * 1024 * 1024;
    const PAD_FACTOR: f64 = 1.2;
    const MIN_PARTS: u32 = 2;
    const MAX_PARTS: u32 = 100;
    const DEFAULT_PARTS: u32 = 10;

    let Some(nar_size) = nar_size else {
        return DEFAULT_PARTS;
    };

    if nar_size == 0 {
        return MIN_PARTS;
    }

    let base_parts = nar_size.div_ceil(PART_SIZE);
    let padded = (base_parts as f64 * PAD_FACTOR).ceil() as u32;

    padded.clamp(MIN_PARTS, MAX_PARTS)
}
