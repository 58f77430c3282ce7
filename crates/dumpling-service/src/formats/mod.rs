//! Binary format detection.
//!
//! Detection runs an ordered list of probes over the decompressed payload and takes the first
//! match. Probes are total: malformed input is a miss, never an error.

use symbolic::common::ByteView;

use crate::crosslink::{ImageError, LoadedImage, LoadedImages};
use crate::digest::Sha1Digest;
use crate::index::{IndexPrefix, build_index};
use crate::types::ArtifactFormat;

mod elf_core;
mod mach_core;
mod minidump;
mod objects;

pub use self::elf_core::ElfCore;
pub use self::mach_core::is_mach_core;
pub use self::minidump::MinidumpHandle;
pub use self::objects::{elf_build_id, pdb_build_id, pe_build_id};

/// Selects the probes and post-processing applied to an upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UploadKind {
    /// A module, executable or debug file.
    Artifact,
    /// The crash dump of a dump session.
    Dump,
}

/// A parsed dump, retained to enumerate its loaded modules.
#[derive(Debug)]
pub enum DumpHandle {
    ElfCore(ElfCore),
    Minidump(MinidumpHandle),
}

impl LoadedImages for DumpHandle {
    fn loaded_images(&self) -> Result<Vec<LoadedImage>, ImageError> {
        match self {
            DumpHandle::ElfCore(core) => core.loaded_images(),
            DumpHandle::Minidump(minidump) => minidump.loaded_images(),
        }
    }
}

/// The result of format detection.
#[derive(Debug)]
pub struct Detection {
    pub format: ArtifactFormat,
    /// The build identifier, normalized to lowercase hex.
    pub build_id: Option<String>,
    pub prefix: IndexPrefix,
    pub dump: Option<DumpHandle>,
}

impl Detection {
    fn matched(format: ArtifactFormat, build_id: Option<String>, prefix: IndexPrefix) -> Self {
        Detection {
            format,
            build_id,
            prefix,
            dump: None,
        }
    }

    fn dump_format(format: ArtifactFormat, dump: Option<DumpHandle>) -> Self {
        Detection {
            format,
            build_id: None,
            prefix: IndexPrefix::Sha1,
            dump,
        }
    }

    fn unknown() -> Self {
        Self::dump_format(ArtifactFormat::Unknown, None)
    }

    /// The index key of the detected artifact.
    ///
    /// Without a build identifier, the content digest is used instead.
    pub fn index(&self, digest: &Sha1Digest, file_name: &str) -> Option<String> {
        match self.build_id {
            Some(ref build_id) => build_index(Some(build_id), self.prefix, file_name),
            None => build_index(Some(digest.as_str()), IndexPrefix::Sha1, file_name),
        }
    }
}

/// Detects the format of `data`.
pub fn detect(data: ByteView<'static>, kind: UploadKind) -> Detection {
    let detection = match kind {
        UploadKind::Artifact => detect_artifact(&data),
        UploadKind::Dump => detect_dump(data),
    };
    tracing::debug!(
        format = %detection.format,
        build_id = detection.build_id.as_deref(),
        "detected format"
    );
    detection
}

fn detect_artifact(data: &[u8]) -> Detection {
    if let Some(build_id) = elf_build_id(data) {
        return Detection::matched(ArtifactFormat::Elf, Some(build_id), IndexPrefix::Elf);
    }
    if let Some(build_id) = pe_build_id(data) {
        return Detection::matched(ArtifactFormat::Pe, build_id, IndexPrefix::Pe);
    }
    if let Some(build_id) = pdb_build_id(data) {
        return Detection::matched(ArtifactFormat::Pdb, Some(build_id), IndexPrefix::Pdb);
    }
    Detection::unknown()
}

fn detect_dump(data: ByteView<'static>) -> Detection {
    if let Some(core) = ElfCore::parse(data.clone()) {
        return Detection::dump_format(ArtifactFormat::ElfCore, Some(DumpHandle::ElfCore(core)));
    }
    if let Some(minidump) = MinidumpHandle::parse(data.clone()) {
        return Detection::dump_format(ArtifactFormat::Minidump, Some(DumpHandle::Minidump(minidump)));
    }
    if is_mach_core(&data) {
        // the module table of Mach-O cores is not enumerated
        return Detection::dump_format(ArtifactFormat::MachCore, None);
    }
    Detection::unknown()
}
