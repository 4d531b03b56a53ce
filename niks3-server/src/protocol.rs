//! The pending-closure upload protocol.
//!
//! Reserves ledger rows for an incoming closure upload, deduplicates
//! against objects already known to the ledger (including a live S3
//! HEAD check to catch ledger/S3 drift), issues presigned upload
//! artifacts, and on commit renders, signs, compresses, and uploads the
//! narinfo before promoting the pending rows into the committed tables.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_compression::tokio::bufread::ZstdEncoder;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;

use niks3::hash::Hash;
use niks3::mime;
use niks3::signing::NixKeypair;
use niks3::ClosureKey;

use crate::database::{ExistingObject, Ledger, NewPendingObject};
use crate::error::{ServerError, ServerResult};
use crate::narinfo::{self, NarInfo};
use crate::storage::ObjectStore;

/// Presigned-URL TTL for every issued upload artifact.
///
/// Garbage-collection grace periods must exceed this (see `crate::gc`)
/// so that a presigned URL can never outlive the ledger row that
/// justifies it.
pub const PRESIGN_TTL: Duration = Duration::from_secs(5 * 60 * 60);

/// How long a tombstone must have been in effect before a concurrent
/// begin treats the key as fully deleted rather than parking it.
///
/// Not derived from any other invariant; kept as a named constant
/// rather than threaded through configuration since no teacher or
/// pack precedent makes it tunable.
pub const PARK_THRESHOLD: Duration = Duration::from_secs(30);

/// Bound on concurrent S3 HEAD calls issued during live-key dedup.
const DEDUP_HEAD_CONCURRENCY: usize = 100;

/// Target part size used by the multipart size estimator.
const MULTIPART_PART_SIZE: u64 = 10 * 1024 * 1024;

/// The kind of artifact an object in a pending closure represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Narinfo,
    Nar,
    Listing,
    BuildLog,
    Realisation,
}

/// One object named in a `POST /api/pending_closures` request.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestedObject {
    pub key: String,

    #[serde(rename = "type")]
    pub kind: ObjectKind,

    #[serde(default)]
    pub refs: Vec<String>,

    pub nar_size: Option<u64>,
}

/// `POST /api/pending_closures` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct BeginRequest {
    pub closure: ClosureKey,
    pub objects: Vec<RequestedObject>,
}

/// Multipart upload artifacts issued for a `nar` object.
#[derive(Debug, Clone, Serialize)]
pub struct MultipartInfo {
    pub upload_id: String,
    pub part_urls: Vec<String>,
}

/// How the client should (or should not) upload one requested object.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IssuedUpload {
    /// A single presigned PUT.
    Put { presigned_url: String },
    /// A multipart upload, with one presigned part URL per estimated part.
    Multipart(MultipartInfo),
    /// Already present in the ledger and on S3; no upload needed.
    Skip,
}

/// One entry in a `BeginResponse`'s `pending_objects` map.
#[derive(Debug, Clone, Serialize)]
pub struct PendingObjectIssued {
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    #[serde(flatten)]
    pub upload: IssuedUpload,
}

/// `POST /api/pending_closures` response body.
#[derive(Debug, Clone, Serialize)]
pub struct BeginResponse {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub pending_objects: HashMap<String, PendingObjectIssued>,
}

/// The narinfo fields a client reports at commit time. `Compression`
/// and `Sig:` lines are filled in server-side.
#[derive(Debug, Clone, Deserialize)]
pub struct NarinfoMetadata {
    pub store_path: PathBuf,
    pub url: String,
    pub nar_hash: String,
    pub nar_size: u64,
    pub file_hash: Option<String>,
    pub file_size: Option<u64>,
    #[serde(default)]
    pub references: Vec<String>,
    pub deriver: Option<String>,
    pub ca: Option<String>,
}

/// `POST /api/pending_closures/{id}/complete` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct CommitRequest {
    pub narinfos: HashMap<String, NarinfoMetadata>,
}

/// Begins a pending closure: reserves the ledger rows, dedups against
/// what the ledger (and S3) already has, and issues presigned upload
/// artifacts for everything that still needs uploading.
#[tracing::instrument(skip_all, fields(closure = %request.closure))]
pub async fn begin_pending_closure(
    ledger: &dyn Ledger,
    storage: &dyn ObjectStore,
    request: BeginRequest,
) -> ServerResult<BeginResponse> {
    // Duplicate keys are rejected implicitly: the map collapses them to
    // the last occurrence.
    let by_key: HashMap<String, RequestedObject> = request
        .objects
        .into_iter()
        .map(|obj| (obj.key.clone(), obj))
        .collect();
    let keys: Vec<String> = by_key.keys().cloned().collect();

    let pending_closure = ledger.begin_pending_closure(request.closure.as_str()).await?;
    let existing = ledger.find_existing_objects(&keys).await?;
    let existing_by_key: HashMap<String, ExistingObject> =
        existing.into_iter().map(|e| (e.key.clone(), e)).collect();

    let mut new_keys = Vec::new();
    let mut live_keys = Vec::new();
    let mut parked = Vec::new();

    for key in &keys {
        match existing_by_key.get(key) {
            None => new_keys.push(key.clone()),
            Some(ExistingObject { tombstone_age: None, .. }) => live_keys.push(key.clone()),
            Some(ExistingObject { tombstone_age: Some(age), .. }) => {
                if *age < PARK_THRESHOLD {
                    parked.push(key.clone());
                }
                // Else: the tombstone is old enough that the commit-time
                // upsert's resurrection will pick it back up; no upload
                // needed from this begin.
            }
        }
    }

    let drifted = detect_drift(storage, &live_keys).await?;
    let resolved_parked = resolve_parked(ledger, parked).await?;

    let mut to_upload = new_keys;
    to_upload.extend(drifted);
    to_upload.extend(resolved_parked);

    let new_pending: Vec<NewPendingObject> = to_upload
        .iter()
        .map(|key| NewPendingObject {
            key: key.clone(),
            refs: by_key[key].refs.clone(),
        })
        .collect();
    ledger
        .insert_pending_objects(pending_closure.id, &new_pending)
        .await?;

    let mut pending_objects = HashMap::with_capacity(keys.len());
    for key in &to_upload {
        let requested = &by_key[key];
        let upload = issue_upload(ledger, storage, pending_closure.id, key, requested).await?;
        pending_objects.insert(
            key.clone(),
            PendingObjectIssued {
                kind: requested.kind,
                upload,
            },
        );
    }
    for key in &keys {
        pending_objects.entry(key.clone()).or_insert_with(|| PendingObjectIssued {
            kind: by_key[key].kind,
            upload: IssuedUpload::Skip,
        });
    }

    Ok(BeginResponse {
        id: pending_closure.id,
        started_at: pending_closure.started_at,
        pending_objects,
    })
}

/// Issues the upload artifact for one object that needs uploading: a
/// single presigned PUT for everything but `nar`, or a multipart upload
/// sized by `estimate_part_count`.
async fn issue_upload(
    ledger: &dyn Ledger,
    storage: &dyn ObjectStore,
    pending_closure_id: i64,
    key: &str,
    requested: &RequestedObject,
) -> ServerResult<IssuedUpload> {
    if requested.kind != ObjectKind::Nar {
        let presigned_url = storage.presign_put(key, PRESIGN_TTL).await?;
        return Ok(IssuedUpload::Put { presigned_url });
    }

    let upload_id = storage.init_multipart(key).await?;
    ledger
        .insert_multipart_upload(pending_closure_id, key, &upload_id)
        .await?;

    let part_count = narinfo::estimate_part_count(requested.nar_size);
    let mut part_urls = Vec::with_capacity(part_count as usize);
    for part_number in 1..=part_count as i32 {
        let url = storage
            .presign_part(key, &upload_id, part_number, PRESIGN_TTL)
            .await?;
        part_urls.push(url);
    }

    Ok(IssuedUpload::Multipart(MultipartInfo {
        upload_id,
        part_urls,
    }))
}

/// Issues additional presigned part URLs for a multipart upload that
/// needs more parts than originally estimated.
pub async fn request_additional_parts(
    storage: &dyn ObjectStore,
    object_key: &str,
    upload_id: &str,
    start_part_number: i32,
    num_parts: i32,
) -> ServerResult<Vec<String>> {
    let mut urls = Vec::with_capacity(num_parts.max(0) as usize);
    for offset in 0..num_parts {
        let url = storage
            .presign_part(object_key, upload_id, start_part_number + offset, PRESIGN_TTL)
            .await?;
        urls.push(url);
    }
    Ok(urls)
}

/// HEADs every live-but-ledger-known key with bounded concurrency,
/// returning the subset that S3 reports missing (ledger/S3 drift).
async fn detect_drift(storage: &dyn ObjectStore, keys: &[String]) -> ServerResult<Vec<String>> {
    if keys.is_empty() {
        return Ok(Vec::new());
    }

    let results: Vec<ServerResult<(String, bool)>> = stream::iter(keys.iter().cloned())
        .map(|key| async move {
            let present = storage.stat_object(&key).await?.is_some();
            Ok((key, present))
        })
        .buffer_unordered(DEDUP_HEAD_CONCURRENCY)
        .collect()
        .await;

    let mut drifted = Vec::new();
    for result in results {
        let (key, present) = result?;
        if !present {
            drifted.push(key);
        }
    }

    Ok(drifted)
}

/// Polls the ledger once a second for every parked (recently-tombstoned)
/// key, returning each once its tombstone has aged past `PARK_THRESHOLD`
/// or it has been resurrected by a concurrent commit.
async fn resolve_parked(ledger: &dyn Ledger, parked: Vec<String>) -> ServerResult<Vec<String>> {
    let mut remaining = parked;
    let mut resolved = Vec::new();

    while !remaining.is_empty() {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let rows = ledger.find_existing_objects(&remaining).await?;
        let by_key: HashMap<String, ExistingObject> =
            rows.into_iter().map(|r| (r.key.clone(), r)).collect();

        let mut still_parked = Vec::new();
        for key in remaining {
            match by_key.get(&key) {
                None => resolved.push(key),
                Some(ExistingObject { tombstone_age: None, .. }) => resolved.push(key),
                Some(ExistingObject { tombstone_age: Some(age), .. }) => {
                    if *age >= PARK_THRESHOLD {
                        resolved.push(key);
                    } else {
                        still_parked.push(key);
                    }
                }
            }
        }
        remaining = still_parked;
    }

    Ok(resolved)
}

/// Completes a pending closure: renders, signs, compresses, and uploads
/// every reported narinfo, then runs the commit stored procedure.
#[tracing::instrument(skip_all, fields(pending_closure_id))]
pub async fn complete_pending_closure(
    ledger: &dyn Ledger,
    storage: &dyn ObjectStore,
    signing_keys: &[NixKeypair],
    pending_closure_id: i64,
    request: CommitRequest,
) -> ServerResult<()> {
    let pending_objects = ledger.list_pending_objects(pending_closure_id).await?;
    let pending_keys: HashSet<String> = pending_objects.into_iter().map(|o| o.key).collect();

    for key in request.narinfos.keys() {
        if !pending_keys.contains(key) {
            return Err(ServerError::ObjectNotInPendingClosure {
                key: key.clone(),
                pending_closure_id,
            });
        }
    }

    for (key, metadata) in request.narinfos {
        let narinfo = build_narinfo(metadata, signing_keys)?;
        let rendered = narinfo.render();
        let compressed = compress_zstd(rendered.into_bytes()).await?;

        storage
            .put_object(&key, compressed.into(), mime::NARINFO, Some("zstd"))
            .await?;
    }

    ledger.commit_pending_closure(pending_closure_id).await
}

/// Builds the server-side `NarInfo` from client-reported metadata,
/// signing it if signing keys are configured.
fn build_narinfo(metadata: NarinfoMetadata, signing_keys: &[NixKeypair]) -> ServerResult<NarInfo> {
    let file_hash = metadata
        .file_hash
        .as_deref()
        .map(Hash::from_typed)
        .transpose()?;

    let mut narinfo = NarInfo {
        store_path: metadata.store_path,
        url: metadata.url,
        nar_hash: Hash::from_typed(&metadata.nar_hash)?,
        nar_size: metadata.nar_size,
        file_hash,
        file_size: metadata.file_size,
        references: metadata.references,
        deriver: metadata.deriver,
        signatures: Vec::new(),
        ca: metadata.ca,
    };

    if !signing_keys.is_empty() {
        narinfo.sign(signing_keys);
    }

    Ok(narinfo)
}

/// zstd-compresses a byte buffer off the async runtime's reactor thread.
async fn compress_zstd(body: Vec<u8>) -> ServerResult<Vec<u8>> {
    let mut encoder = ZstdEncoder::new(&body[..]);
    let mut out = Vec::new();
    encoder
        .read_to_end(&mut out)
        .await
        .map_err(|e: io::Error| ServerError::request_error(e))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> NarinfoMetadata {
        NarinfoMetadata {
            store_path: PathBuf::from("/nix/store/xcp9cav49dmsjbwdjlmkjxj10gkpx553-hello-2.10"),
            url: "nar/0nqgf15qfiacfxrgm2wkw0gwwncjqqzzalj8rs14w9srkydkjsk9.nar.zst".into(),
            nar_hash: "sha256:16mvl7v0ylzcg2n3xzjn41qhzbmgcn5iyarx16nn5l2r36n2kqci".into(),
            nar_size: 206104,
            file_hash: None,
            file_size: None,
            references: Vec::new(),
            deriver: None,
            ca: None,
        }
    }

    #[test]
    fn test_build_narinfo_without_signing_keys_is_unsigned() {
        let narinfo = build_narinfo(sample_metadata(), &[]).unwrap();
        assert!(narinfo.signatures.is_empty());
    }

    #[test]
    fn test_build_narinfo_signs_with_configured_keys() {
        let keypair = NixKeypair::generate("niks3-test").unwrap();
        let narinfo = build_narinfo(sample_metadata(), std::slice::from_ref(&keypair)).unwrap();
        assert_eq!(narinfo.signatures.len(), 1);
    }

    #[tokio::test]
    async fn test_compress_zstd_round_trips_through_decoder() {
        let body = b"StorePath: /nix/store/abc-hello\n".to_vec();
        let compressed = compress_zstd(body.clone()).await.unwrap();

        let mut decoder = async_compression::tokio::bufread::ZstdDecoder::new(&compressed[..]);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).await.unwrap();

        assert_eq!(decompressed, body);
    }
}
