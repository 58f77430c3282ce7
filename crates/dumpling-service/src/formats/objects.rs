//! Probes for plain (non-dump) binaries.
//!
//! Every probe checks the container magic before parsing and turns any parse failure into `None`.

use symbolic::debuginfo::elf::ElfObject;
use symbolic::debuginfo::pdb::PdbObject;
use symbolic::debuginfo::pe::PeObject;

/// Hex length of a GNU build id produced by the default SHA-1 scheme.
const ELF_BUILD_ID_HEX_LEN: usize = 40;

/// Returns the GNU build id of an ELF object.
///
/// Only full 20 byte build ids are accepted. Objects without one, or with a shorter one, are not
/// matched so that they get indexed by content digest instead.
pub fn elf_build_id(data: &[u8]) -> Option<String> {
    if !ElfObject::test(data) {
        return None;
    }
    let elf = ElfObject::parse(data)
        .inspect_err(|err| tracing::debug!(error = err as &dyn std::error::Error, "malformed ELF"))
        .ok()?;
    let code_id = elf.code_id()?;
    let build_id = code_id.as_str().to_ascii_lowercase();
    (build_id.len() == ELF_BUILD_ID_HEX_LEN).then_some(build_id)
}

/// Returns the identifier of a PE image: its link timestamp followed by its image size, in hex.
pub fn pe_build_id(data: &[u8]) -> Option<Option<String>> {
    if !PeObject::test(data) {
        return None;
    }
    let pe = PeObject::parse(data)
        .inspect_err(|err| tracing::debug!(error = err as &dyn std::error::Error, "malformed PE"))
        .ok()?;
    Some(pe.code_id().map(|id| id.as_str().to_ascii_lowercase()))
}

/// Returns the identifier of a PDB: its signature GUID without dashes followed by its age, in hex.
pub fn pdb_build_id(data: &[u8]) -> Option<String> {
    if !PdbObject::test(data) {
        return None;
    }
    let pdb = PdbObject::parse(data)
        .inspect_err(|err| tracing::debug!(error = err as &dyn std::error::Error, "malformed PDB"))
        .ok()?;
    Some(pdb.debug_id().breakpad().to_string().to_ascii_lowercase())
}
