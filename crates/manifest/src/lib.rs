//! Chunk manifest produced at build time and read by the loader at runtime.
//!
//! The manifest maps every lazily loaded chunk to the binary modules it
//! declares, and every binary module to the content hash of its deployed
//! payload. It is read-only once the loader starts.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Name of a group of modules delivered as one script payload.
    ChunkId
);
string_id!(
    /// Name of a compiled binary module, usually its source path in the bundle.
    BinaryId
);

pub const DEFAULT_SCRIPT_SUFFIX: &str = ".bootstrap.js";
pub const DEFAULT_BINARY_SUFFIX: &str = ".module.wasm";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChunkManifest {
    /// Prefix prepended to every script and binary address.
    pub public_path: String,
    pub script_suffix: String,
    pub binary_suffix: String,
    /// Chunks already present when the runtime starts (the entry chunk).
    pub installed: Vec<ChunkId>,
    /// Chunk id -> binary modules that must be instantiated with it.
    pub chunks: BTreeMap<ChunkId, Vec<BinaryId>>,
    /// Binary id -> content hash of the deployed payload.
    pub binaries: BTreeMap<BinaryId, String>,
}

impl Default for ChunkManifest {
    fn default() -> Self {
        Self {
            public_path: String::new(),
            script_suffix: DEFAULT_SCRIPT_SUFFIX.to_string(),
            binary_suffix: DEFAULT_BINARY_SUFFIX.to_string(),
            installed: Vec::new(),
            chunks: BTreeMap::new(),
            binaries: BTreeMap::new(),
        }
    }
}

impl ChunkManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_public_path(mut self, public_path: impl Into<String>) -> Self {
        self.public_path = public_path.into();
        self
    }

    /// Mark a chunk as shipped with the initial page.
    pub fn with_installed(mut self, chunk: impl Into<ChunkId>) -> Self {
        self.installed.push(chunk.into());
        self
    }

    /// Declare a lazy chunk and the binary modules it depends on.
    pub fn add_chunk(&mut self, chunk: impl Into<ChunkId>, binaries: Vec<BinaryId>) {
        self.chunks.insert(chunk.into(), binaries);
    }

    /// Register a binary payload by its precomputed content hash.
    pub fn add_binary(&mut self, binary: impl Into<BinaryId>, hash: impl Into<String>) {
        self.binaries.insert(binary.into(), hash.into());
    }

    /// Register a binary payload, hashing its bytes. Returns the hash.
    pub fn add_binary_payload(&mut self, binary: impl Into<BinaryId>, bytes: &[u8]) -> String {
        let hash = content_hash(bytes);
        self.add_binary(binary, hash.clone());
        hash
    }

    pub fn binaries_for(&self, chunk: &ChunkId) -> &[BinaryId] {
        self.chunks.get(chunk).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn script_src(&self, chunk: &ChunkId) -> String {
        format!("{}{}{}", self.public_path, chunk, self.script_suffix)
    }

    pub fn binary_address(&self, binary: &BinaryId) -> Option<String> {
        self.binaries
            .get(binary)
            .map(|hash| format!("{}{}{}", self.public_path, hash, self.binary_suffix))
    }

    /// Every binary a chunk declares must have a deployed payload.
    pub fn validate(&self) -> Result<()> {
        for (chunk, binaries) in &self.chunks {
            for binary in binaries {
                if !self.binaries.contains_key(binary) {
                    anyhow::bail!("chunk {} declares binary {} with no payload address", chunk, binary);
                }
            }
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(json).context("invalid chunk manifest")?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading chunk manifest {:?}", path))?;
        Self::from_json(&json)
    }
}

/// Length in hex digits of a payload's content hash.
pub const CONTENT_HASH_LEN: usize = 16;

/// Content hash used to name deployed payloads: the leading hex digits of
/// the payload's SHA-256 digest.
pub fn content_hash(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};

    let digest = Sha256::digest(bytes);
    digest
        .iter()
        .take(CONTENT_HASH_LEN / 2)
        .map(|b| format!("{:02x}", b))
        .collect()
}
