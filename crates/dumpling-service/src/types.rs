//! Records tracked by the metadata store.
//!
//! These are plain data: relationships are expressed through keys (`dump_id`, `hash`, `index`)
//! and resolved explicitly through the [`MetadataStore`](crate::store::MetadataStore).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::Sha1Digest;

/// Property name that assigns a dump to a failure bucket.
pub const FAILURE_HASH: &str = "FAILURE_HASH";

/// Failure bucket name for dumps without an assigned failure.
pub const UNTRIAGED: &str = "UNTRIAGED";

/// Maximum length of a dump identifier.
pub const MAX_DUMP_ID_LEN: usize = 40;
/// Maximum length of the uploading user / origin.
pub const MAX_USER_LEN: usize = 128;
/// Maximum length of an index key.
pub const MAX_INDEX_LEN: usize = 450;

/// The container format of an artifact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    Elf,
    Pe,
    Pdb,
    ElfCore,
    Minidump,
    MachCore,
    Unknown,
}

impl ArtifactFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactFormat::Elf => "elf",
            ArtifactFormat::Pe => "pe",
            ArtifactFormat::Pdb => "pdb",
            ArtifactFormat::ElfCore => "elfcore",
            ArtifactFormat::Minidump => "minidump",
            ArtifactFormat::MachCore => "machcore",
            ArtifactFormat::Unknown => "unknown",
        }
    }

    /// The operating system a dump of this format was taken on.
    pub fn dump_os(self) -> DumpOs {
        match self {
            ArtifactFormat::ElfCore => DumpOs::Linux,
            ArtifactFormat::Minidump => DumpOs::Windows,
            ArtifactFormat::MachCore => DumpOs::Darwin,
            _ => DumpOs::Unknown,
        }
    }
}

impl fmt::Display for ArtifactFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DumpOs {
    Windows,
    Linux,
    Darwin,
    #[default]
    Unknown,
}

/// A unique binary payload, identified by the digest of its decompressed content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub hash: Sha1Digest,
    /// The build identifier embedded in the binary, if the format carries one.
    pub uuid: Option<String>,
    pub format: ArtifactFormat,
    /// Lowercased file name the artifact was first uploaded as.
    pub file_name: String,
    pub size: u64,
    pub compressed_size: u64,
    pub upload_time: DateTime<Utc>,
    /// Blob store locator of the compressed payload.
    ///
    /// This is only `None` while the first upload is still writing the payload.
    pub url: Option<String>,
}

/// An alias resolving an index key to an artifact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactIndex {
    pub index: String,
    pub hash: Sha1Digest,
}

/// A crash report session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dump {
    pub dump_id: String,
    pub display_name: String,
    pub user: String,
    pub os: DumpOs,
    pub failure_hash: Option<String>,
    pub dump_time: DateTime<Utc>,
}

/// A bucket of dumps sharing a failure signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub failure_hash: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub dump_id: String,
    pub name: String,
    pub value: String,
}

/// A file that was present on the machine a dump was taken on.
///
/// A row with an `index` but without a `hash` is a placeholder: the module is known, its bytes
/// have not been uploaded yet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpArtifact {
    pub dump_id: String,
    pub local_path: String,
    pub hash: Option<Sha1Digest>,
    pub index: Option<String>,
    pub debug_critical: bool,
    pub executable_image: bool,
}

impl DumpArtifact {
    /// A placeholder for a module whose payload is not known yet.
    pub fn placeholder(dump_id: &str, local_path: &str, index: Option<String>) -> Self {
        DumpArtifact {
            dump_id: dump_id.to_owned(),
            local_path: local_path.to_owned(),
            hash: None,
            index,
            debug_critical: true,
            executable_image: false,
        }
    }

    /// The local path turned into a relative, forward-slash separated path.
    ///
    /// `C:\Windows\System32\ntdll.dll` becomes `C/Windows/System32/ntdll.dll` and
    /// `/usr/lib/libc.so.6` becomes `usr/lib/libc.so.6`.
    pub fn relative_path(&self) -> String {
        relative_path(&self.local_path)
    }
}

pub fn relative_path(local_path: &str) -> String {
    local_path
        .replace(':', "")
        .replace('\\', "/")
        .trim_start_matches(['.', '/'])
        .to_owned()
}
