//! Symbol index keys.
//!
//! An index key is shaped like a symbol server path, `<file>/<prefix><build id>/<file>.gz`, so
//! artifacts can be found by what a debugger knows about a module instead of by content digest.

use std::fmt;

/// Namespaces build identifiers of different kinds within index keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexPrefix {
    Elf,
    Mach,
    /// The content digest stands in for a missing build identifier.
    Sha1,
    Pe,
    Pdb,
}

impl IndexPrefix {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexPrefix::Elf => "elf-buildid-",
            IndexPrefix::Mach => "mach-uuid-",
            IndexPrefix::Sha1 => "sha1-",
            IndexPrefix::Pe | IndexPrefix::Pdb => "",
        }
    }
}

impl fmt::Display for IndexPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the index key for a file with the given build identifier.
///
/// Returns `None` when there is no build identifier to index by.
pub fn build_index(build_id: Option<&str>, prefix: IndexPrefix, file_name: &str) -> Option<String> {
    let build_id = build_id.filter(|id| !id.is_empty())?;
    Some(format!("{file_name}/{prefix}{build_id}/{file_name}.gz"))
}

/// The last component of a path, accepting both `/` and `\` as separators.
///
/// Dumps taken on Windows carry Windows paths regardless of where they are processed.
pub fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Everything but the last component of a path, without trailing separator.
pub fn parent_dir(path: &str) -> &str {
    match path.rfind(['/', '\\']) {
        Some(pos) => &path[..pos],
        None => "",
    }
}
