//! Bundler - deterministic archive, artifact hashes and Merkle root
//!
//! Archive entries are written in sorted order with zeroed mtime, owner and
//! fixed mode, so identical artifacts give identical archive bytes. The
//! bundle hash is taken over the archive bytes as they are written.

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::channel::BuildMode;
use crate::config::DEFAULT_MAX_BUNDLE_BYTES;
use crate::generator::{
    GeneratedArtifacts, CREDENTIALS_MAP_FILE, FLOWS_FILE, MANIFEST_FILE, SETTINGS_FILE,
};
use crate::hashing::{hash_canonical, sha256_hex, ArtifactHash, HashingWriter};
use crate::merkle::{verify_proof, MerkleError, MerkleProof, MerkleTree};
use crate::settings::{self, render_settings};
use crate::ENGINE_VERSION;

pub const METADATA_FILE: &str = "bundle.metadata.json";
pub const BUNDLE_FORMAT_VERSION: &str = "1";
const FILE_MODE: u32 = 0o644;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Gzip,
    None,
}

#[derive(Debug, Error)]
pub enum BundlingError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Merkle tree error: {0}")]
    Merkle(#[from] MerkleError),

    #[error("Bundling timed out after {0:?}")]
    Timeout(Duration),

    #[error("Bundle is missing {0}")]
    MissingArtifact(&'static str),

    #[error("Malformed {file}: {message}")]
    Malformed { file: &'static str, message: String },

    #[error("Bundle unpacks to more than {0} bytes")]
    TooLarge(u64),
}

#[derive(Debug, Clone)]
pub struct BundleOptions {
    pub build_id: String,
    pub created_at: DateTime<Utc>,
    pub compression: Compression,
    pub include_metadata: bool,
}

/// Per-artifact hashes, in Merkle leaf order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactHashes {
    pub flows_json: ArtifactHash,
    pub settings: ArtifactHash,
    pub manifest: ArtifactHash,
    pub credentials_map: ArtifactHash,
}

impl ArtifactHashes {
    pub fn leaves(&self) -> [&str; 4] {
        [
            self.flows_json.hash.as_str(),
            self.settings.hash.as_str(),
            self.manifest.hash.as_str(),
            self.credentials_map.hash.as_str(),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BundleHashes {
    pub artifacts: ArtifactHashes,
    pub bundle_hash: String,
    pub merkle_root: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proofs: Vec<MerkleProof>,
}

/// One archive entry and the number of bytes written for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleEntry {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleMetadata {
    pub build_id: String,
    pub channel_id: String,
    pub engine_version: String,
    pub compression: Compression,
    pub files: Vec<BundleEntry>,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Bundle {
    pub bytes: Vec<u8>,
    pub hashes: BundleHashes,
    pub metadata: BundleMetadata,
}

/// Manifest content as hashed: the build id is per-invocation and left out.
pub fn manifest_hash_view(manifest: &Value) -> Value {
    let mut view = manifest.clone();
    if let Value::Object(map) = &mut view {
        map.remove("buildId");
    }
    view
}

pub fn hash_artifacts(artifacts: &GeneratedArtifacts) -> io::Result<ArtifactHashes> {
    Ok(ArtifactHashes {
        flows_json: hash_canonical(&artifacts.flows_json)?,
        settings: hash_canonical(&artifacts.settings)?,
        manifest: hash_canonical(&manifest_hash_view(&artifacts.manifest))?,
        credentials_map: hash_canonical(&artifacts.credentials_map)?,
    })
}

pub fn merkle_tree(hashes: &ArtifactHashes) -> Result<MerkleTree, MerkleError> {
    MerkleTree::from_hex_leaves(&hashes.leaves())
}

fn parse_settings(bytes: &[u8]) -> Result<Value, BundlingError> {
    settings::parse_settings(bytes).map_err(|message| BundlingError::Malformed {
        file: SETTINGS_FILE,
        message,
    })
}

fn entries(files: &BTreeMap<&str, Vec<u8>>) -> Vec<BundleEntry> {
    files
        .iter()
        .map(|(name, data)| BundleEntry {
            name: name.to_string(),
            size: data.len() as u64,
        })
        .collect()
}

fn append_entries<W: Write>(builder: &mut tar::Builder<W>, files: &BTreeMap<&str, Vec<u8>>) -> io::Result<()> {
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(FILE_MODE);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, name, data.as_slice())?;
    }
    Ok(())
}

/// Write the archive, hashing its bytes as they are produced.
fn write_archive(files: &BTreeMap<&str, Vec<u8>>, compression: Compression) -> io::Result<(Vec<u8>, String)> {
    let sink = HashingWriter::new(Vec::new());
    let hashing = match compression {
        Compression::Gzip => {
            let encoder = GzEncoder::new(sink, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder.mode(tar::HeaderMode::Deterministic);
            append_entries(&mut builder, files)?;
            builder.into_inner()?.finish()?
        }
        Compression::None => {
            let mut builder = tar::Builder::new(sink);
            builder.mode(tar::HeaderMode::Deterministic);
            append_entries(&mut builder, files)?;
            builder.into_inner()?
        }
    };
    let (bytes, hash, _) = hashing.finish();
    Ok((bytes, hash))
}

/// Package artifacts into an archive with hashes, Merkle root and proofs.
pub fn bundle(artifacts: &GeneratedArtifacts, options: &BundleOptions) -> Result<Bundle, BundlingError> {
    let hashes = hash_artifacts(artifacts)?;
    let tree = merkle_tree(&hashes)?;
    let merkle_root = tree.root();
    let proofs = (0..tree.leaf_count()).filter_map(|i| tree.proof(i)).collect();

    let mut files: BTreeMap<&str, Vec<u8>> = BTreeMap::new();
    files.insert(FLOWS_FILE, serde_json::to_vec_pretty(&artifacts.flows_json)?);
    files.insert(SETTINGS_FILE, render_settings(&artifacts.settings)?);
    files.insert(MANIFEST_FILE, serde_json::to_vec_pretty(&artifacts.manifest)?);
    files.insert(CREDENTIALS_MAP_FILE, serde_json::to_vec_pretty(&artifacts.credentials_map)?);

    let channel_id = artifacts.manifest["channelId"].as_str().unwrap_or_default().to_string();
    if options.include_metadata {
        let embedded = serde_json::json!({
            "formatVersion": BUNDLE_FORMAT_VERSION,
            "buildId": options.build_id,
            "channelId": channel_id,
            "engineVersion": ENGINE_VERSION,
            "createdAt": options.created_at,
            "files": entries(&files),
            "artifacts": hashes,
            "merkleRoot": merkle_root,
        });
        files.insert(METADATA_FILE, serde_json::to_vec_pretty(&embedded)?);
    }

    let (bytes, bundle_hash) = write_archive(&files, options.compression)?;

    let metadata = BundleMetadata {
        build_id: options.build_id.clone(),
        channel_id,
        engine_version: ENGINE_VERSION.to_string(),
        compression: options.compression,
        files: entries(&files),
        size: bytes.len() as u64,
        created_at: options.created_at,
    };

    Ok(Bundle {
        bytes,
        hashes: BundleHashes {
            artifacts: hashes,
            bundle_hash,
            merkle_root,
            proofs,
        },
        metadata,
    })
}

#[derive(Debug, Clone)]
pub struct BundleContents {
    pub artifacts: GeneratedArtifacts,
    /// Parsed `bundle.metadata.json`, when the archive carries one.
    pub embedded_metadata: Option<Value>,
}

/// Unpack an archive produced by [`bundle`], gzip or plain tar.
pub fn read_bundle(bytes: &[u8]) -> Result<BundleContents, BundlingError> {
    read_bundle_with_limit(bytes, DEFAULT_MAX_BUNDLE_BYTES)
}

/// [`read_bundle`], refusing archives that unpack to more than `limit` bytes.
pub fn read_bundle_with_limit(bytes: &[u8], limit: u64) -> Result<BundleContents, BundlingError> {
    let raw: Box<dyn Read + '_> = if bytes.starts_with(&GZIP_MAGIC) {
        Box::new(GzDecoder::new(bytes))
    } else {
        Box::new(bytes)
    };
    let mut tar_bytes = Vec::new();
    raw.take(limit.saturating_add(1)).read_to_end(&mut tar_bytes)?;
    if tar_bytes.len() as u64 > limit {
        return Err(BundlingError::TooLarge(limit));
    }

    let mut files: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    let mut archive = tar::Archive::new(tar_bytes.as_slice());
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        files.insert(name, data);
    }

    let json = |name: &'static str| -> Result<Value, BundlingError> {
        let data = files.get(name).ok_or(BundlingError::MissingArtifact(name))?;
        serde_json::from_slice(data).map_err(|e| BundlingError::Malformed {
            file: name,
            message: e.to_string(),
        })
    };

    let settings = files
        .get(SETTINGS_FILE)
        .ok_or(BundlingError::MissingArtifact(SETTINGS_FILE))
        .and_then(|b| parse_settings(b))?;

    Ok(BundleContents {
        artifacts: GeneratedArtifacts {
            flows_json: json(FLOWS_FILE)?,
            settings,
            manifest: json(MANIFEST_FILE)?,
            credentials_map: json(CREDENTIALS_MAP_FILE)?,
        },
        embedded_metadata: if files.contains_key(METADATA_FILE) {
            Some(json(METADATA_FILE)?)
        } else {
            None
        },
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub valid: bool,
    pub bundle_hash: String,
    pub merkle_root: String,
    pub artifacts: ArtifactHashes,
    pub mismatches: Vec<String>,
}

/// Recompute hashes and root from archive bytes and compare them with
/// `expected`, or with the archive's embedded metadata when none is given.
pub fn verify_bundle(bytes: &[u8], expected: Option<&BundleHashes>) -> Result<VerifyReport, BundlingError> {
    verify_bundle_with_limit(bytes, expected, DEFAULT_MAX_BUNDLE_BYTES)
}

pub fn verify_bundle_with_limit(
    bytes: &[u8],
    expected: Option<&BundleHashes>,
    limit: u64,
) -> Result<VerifyReport, BundlingError> {
    let contents = read_bundle_with_limit(bytes, limit)?;
    let artifacts = hash_artifacts(&contents.artifacts)?;
    let tree = merkle_tree(&artifacts)?;
    let merkle_root = tree.root();
    let bundle_hash = sha256_hex(bytes);

    let mut mismatches = vec![];
    match expected {
        Some(exp) => {
            if exp.bundle_hash != bundle_hash {
                mismatches.push("bundleHash".to_string());
            }
            if exp.merkle_root != merkle_root {
                mismatches.push("merkleRoot".to_string());
            }
            let names = ["flowsJson", "settings", "manifest", "credentialsMap"];
            for ((name, want), got) in names.iter().zip(exp.artifacts.leaves()).zip(artifacts.leaves()) {
                if want != got {
                    mismatches.push(name.to_string());
                }
            }
            for proof in &exp.proofs {
                if !verify_proof(&proof.leaf, proof, &merkle_root) {
                    mismatches.push(format!("proof[{}]", proof.leaf_index));
                }
            }
        }
        None => match &contents.embedded_metadata {
            Some(meta) => {
                if meta["merkleRoot"].as_str() != Some(merkle_root.as_str()) {
                    mismatches.push("merkleRoot".to_string());
                }
                let embedded: Option<ArtifactHashes> = serde_json::from_value(meta["artifacts"].clone()).ok();
                if embedded.as_ref() != Some(&artifacts) {
                    mismatches.push("artifacts".to_string());
                }
            }
            None => mismatches.push("no expected hashes and no embedded metadata".to_string()),
        },
    }

    Ok(VerifyReport {
        valid: mismatches.is_empty(),
        bundle_hash,
        merkle_root,
        artifacts,
        mismatches,
    })
}

/// What the edge agent needs to start a deployed build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeployHandoff {
    pub channel_id: String,
    pub build_id: String,
    pub mode: BuildMode,
    pub flows_path: PathBuf,
    pub settings_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_map_path: Option<PathBuf>,
}

impl DeployHandoff {
    /// Paths for a bundle extracted under `root`. The credentials map is
    /// only handed off when the build references secrets.
    pub fn for_bundle(root: &Path, artifacts: &GeneratedArtifacts, build_id: &str, mode: BuildMode) -> Self {
        let has_secrets = artifacts.credentials_map["credentials"]
            .as_object()
            .map_or(false, |c| !c.is_empty());
        Self {
            channel_id: artifacts.manifest["channelId"].as_str().unwrap_or_default().to_string(),
            build_id: build_id.to_string(),
            mode,
            flows_path: root.join(FLOWS_FILE),
            settings_path: root.join(SETTINGS_FILE),
            credentials_map_path: has_secrets.then(|| root.join(CREDENTIALS_MAP_FILE)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn artifacts(build_id: &str) -> GeneratedArtifacts {
        GeneratedArtifacts {
            flows_json: json!([{"id": "f1", "type": "tab", "label": "Orders"}, {"id": "n1", "type": "function", "z": "f1", "wires": [[]]}]),
            settings: json!({"disableEditor": true, "env": {"GJ_CHANNEL_ID": "orders"}}),
            manifest: json!({"channelId": "orders", "buildId": build_id, "formatVersion": "1"}),
            credentials_map: json!({"version": "1", "credentials": {"a.k": {"ref": "vault://x", "env": "GJ_SECRET_A_K"}}, "aliases": {}}),
        }
    }

    fn options(compression: Compression, include_metadata: bool) -> BundleOptions {
        BundleOptions {
            build_id: "b1".into(),
            created_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            compression,
            include_metadata,
        }
    }

    #[test]
    fn test_bundle_hash_matches_bytes() {
        let b = bundle(&artifacts("b1"), &options(Compression::Gzip, true)).unwrap();
        assert_eq!(b.hashes.bundle_hash, sha256_hex(&b.bytes));
        assert!(b.bytes.starts_with(&GZIP_MAGIC));
        assert_eq!(b.metadata.size, b.bytes.len() as u64);
        assert_eq!(b.metadata.files[0].name, METADATA_FILE);
        assert_eq!(b.hashes.proofs.len(), 4);
    }

    #[test]
    fn test_build_id_does_not_change_hashes() {
        let a = bundle(&artifacts("b1"), &options(Compression::Gzip, true)).unwrap();
        let b = bundle(&artifacts("b2"), &options(Compression::Gzip, true)).unwrap();
        assert_eq!(a.hashes.artifacts, b.hashes.artifacts);
        assert_eq!(a.hashes.merkle_root, b.hashes.merkle_root);
        // the manifest file itself still carries the build id
        assert_ne!(a.hashes.bundle_hash, b.hashes.bundle_hash);
    }

    #[test]
    fn test_archive_is_reproducible() {
        let a = bundle(&artifacts("b1"), &options(Compression::None, true)).unwrap();
        let b = bundle(&artifacts("b1"), &options(Compression::None, true)).unwrap();
        assert_eq!(a.bytes, b.bytes);
    }

    #[test]
    fn test_archive_entries_are_normalized() {
        let b = bundle(&artifacts("b1"), &options(Compression::None, false)).unwrap();
        let mut archive = tar::Archive::new(b.bytes.as_slice());
        let mut names = vec![];
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let header = entry.header();
            assert_eq!(header.mtime().unwrap(), 0);
            assert_eq!(header.mode().unwrap(), 0o644);
            names.push(entry.path().unwrap().to_string_lossy().into_owned());
        }
        assert_eq!(
            names,
            vec!["credentials.map.json", "flows.json", "manifest.json", "settings.js"]
        );
    }

    #[test]
    fn test_read_bundle_roundtrips_artifacts() {
        for compression in [Compression::Gzip, Compression::None] {
            let original = artifacts("b1");
            let b = bundle(&original, &options(compression, true)).unwrap();
            let contents = read_bundle(&b.bytes).unwrap();
            assert_eq!(contents.artifacts, original);
            assert!(contents.embedded_metadata.is_some());
        }
    }

    #[test]
    fn test_embedded_metadata_records_build_and_entry_sizes() {
        let b = bundle(&artifacts("b1"), &options(Compression::None, true)).unwrap();
        let meta = read_bundle(&b.bytes).unwrap().embedded_metadata.unwrap();
        assert_eq!(meta["buildId"], "b1");
        assert_eq!(meta["createdAt"], json!(b.metadata.created_at));

        let mut archived = BTreeMap::new();
        let mut archive = tar::Archive::new(b.bytes.as_slice());
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            archived.insert(name, data.len() as u64);
        }

        let listed: Vec<BundleEntry> = serde_json::from_value(meta["files"].clone()).unwrap();
        assert_eq!(listed.len(), 4);
        for e in &listed {
            assert_eq!(archived[&e.name], e.size, "{}", e.name);
        }
        for e in &b.metadata.files {
            assert_eq!(archived[&e.name], e.size, "{}", e.name);
        }
        // pretty-printed file, not the canonical form that is hashed
        let flows = listed.iter().find(|e| e.name == FLOWS_FILE).unwrap();
        assert_ne!(flows.size, b.hashes.artifacts.flows_json.size);
    }

    #[test]
    fn test_oversized_archive_rejected() {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::best());
        encoder.write_all(&vec![0u8; 4 * 1024 * 1024]).unwrap();
        let bomb = encoder.finish().unwrap();
        assert!(bomb.len() < 64 * 1024);

        assert!(matches!(
            read_bundle_with_limit(&bomb, 1024 * 1024),
            Err(BundlingError::TooLarge(1_048_576))
        ));
        assert!(matches!(
            verify_bundle_with_limit(&bomb, None, 1024),
            Err(BundlingError::TooLarge(1024))
        ));

        let b = bundle(&artifacts("b1"), &options(Compression::Gzip, true)).unwrap();
        assert!(verify_bundle_with_limit(&b.bytes, Some(&b.hashes), 1024 * 1024).unwrap().valid);
    }

    #[test]
    fn test_verify_bundle() {
        let b = bundle(&artifacts("b1"), &options(Compression::Gzip, true)).unwrap();
        let report = verify_bundle(&b.bytes, Some(&b.hashes)).unwrap();
        assert!(report.valid, "{:?}", report.mismatches);
        let report = verify_bundle(&b.bytes, None).unwrap();
        assert!(report.valid, "{:?}", report.mismatches);

        let mut tampered = b.hashes.clone();
        tampered.artifacts.settings.hash = sha256_hex(b"other");
        let report = verify_bundle(&b.bytes, Some(&tampered)).unwrap();
        assert!(!report.valid);
        assert!(report.mismatches.contains(&"settings".to_string()));

        let plain = bundle(&artifacts("b1"), &options(Compression::None, false)).unwrap();
        assert!(!verify_bundle(&plain.bytes, None).unwrap().valid);
    }

    #[test]
    fn test_missing_artifact_reported() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(2);
        builder.append_data(&mut header, FLOWS_FILE, &b"[]"[..]).unwrap();
        let bytes = builder.into_inner().unwrap();
        assert!(matches!(read_bundle(&bytes), Err(BundlingError::MissingArtifact(SETTINGS_FILE))));
    }

    #[test]
    fn test_deploy_handoff() {
        let h = DeployHandoff::for_bundle(Path::new("/srv/gj"), &artifacts("b1"), "b1", BuildMode::Production);
        assert_eq!(h.channel_id, "orders");
        assert_eq!(h.flows_path, Path::new("/srv/gj/flows.json"));
        assert_eq!(h.credentials_map_path, Some(PathBuf::from("/srv/gj/credentials.map.json")));

        let mut no_secrets = artifacts("b1");
        no_secrets.credentials_map = json!({"version": "1", "credentials": {}, "aliases": {}});
        let h = DeployHandoff::for_bundle(Path::new("/srv/gj"), &no_secrets, "b1", BuildMode::Production);
        assert!(h.credentials_map_path.is_none());
    }
}
