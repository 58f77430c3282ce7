//! Module placeholders for dumps.
//!
//! A dump references every module that was loaded into the crashed process. For each of them a
//! [`DumpArtifact`] placeholder is created up front, carrying the index key the module will be
//! stored under. Once a module with that index is uploaded, the placeholder is linked to it.

use thiserror::Error;

use crate::index::{IndexPrefix, build_index, parent_dir};
use crate::types::DumpArtifact;

/// Runtime modules whose debugger helpers ship next to them with the same build id.
const RUNTIME_COMPANIONS: &[(&str, &[&str])] =
    &[("libcoreclr.so", &["libmscordaccore.so", "libsos.so"])];

/// A failure to read one loaded image, or the module table as a whole.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image at {0:#x} is not part of the dumped memory")]
    Unmapped(u64),
    #[error("no image header at {0:#x}")]
    NotAnImage(u64),
    #[error("malformed image")]
    Malformed(#[from] object::read::Error),
    #[error("unreadable module list")]
    ModuleList(#[from] minidump::Error),
}

/// An image that was loaded into the dumped process.
#[derive(Debug)]
pub struct LoadedImage {
    /// The path of the image on the dumped machine.
    pub path: String,
    /// The file name the image is indexed under.
    pub file_name: String,
    pub prefix: IndexPrefix,
    /// Whether this is the main executable of the process.
    pub executable: bool,
    pub build_id: Result<Option<String>, ImageError>,
}

/// Access to the loaded image table of a parsed dump.
pub trait LoadedImages {
    fn loaded_images(&self) -> Result<Vec<LoadedImage>, ImageError>;
}

/// Derives the module placeholders of a dump.
///
/// This never fails: an image whose build id cannot be read gets a placeholder without index,
/// and a module table that cannot be read yields no placeholders at all.
pub fn expand_loaded_modules(dump: &dyn LoadedImages, dump_id: &str) -> Vec<DumpArtifact> {
    let images = match dump.loaded_images() {
        Ok(images) => images,
        Err(err) => {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                dump_id,
                "could not enumerate loaded modules"
            );
            return Vec::new();
        }
    };

    let mut placeholders = Vec::with_capacity(images.len());
    for image in images {
        let build_id = image.build_id.unwrap_or_else(|err| {
            tracing::debug!(
                error = &err as &dyn std::error::Error,
                path = %image.path,
                "could not read build id of loaded image"
            );
            None
        });
        let index = build_index(build_id.as_deref(), image.prefix, &image.file_name);

        let mut placeholder = DumpArtifact::placeholder(dump_id, &image.path, index);
        placeholder.executable_image = image.executable;
        placeholders.push(placeholder);

        let companions = RUNTIME_COMPANIONS
            .iter()
            .find(|(runtime, _)| *runtime == image.file_name)
            .map_or(&[][..], |(_, companions)| *companions);
        for companion in companions {
            let path = match parent_dir(&image.path) {
                "" => companion.to_string(),
                dir => format!("{dir}/{companion}").replace('\\', "/"),
            };
            let index = build_index(build_id.as_deref(), image.prefix, companion);
            placeholders.push(DumpArtifact::placeholder(dump_id, &path, index));
        }
    }
    placeholders
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Images(Vec<(&'static str, bool, Result<Option<&'static str>, ()>)>);

    impl LoadedImages for Images {
        fn loaded_images(&self) -> Result<Vec<LoadedImage>, ImageError> {
            Ok(self
                .0
                .iter()
                .map(|(path, executable, build_id)| LoadedImage {
                    path: path.to_string(),
                    file_name: crate::index::file_name(path).to_owned(),
                    prefix: IndexPrefix::Elf,
                    executable: *executable,
                    build_id: (*build_id)
                        .map(|id| id.map(str::to_owned))
                        .map_err(|_| ImageError::Unmapped(0x1000)),
                })
                .collect())
        }
    }

    struct Broken;

    impl LoadedImages for Broken {
        fn loaded_images(&self) -> Result<Vec<LoadedImage>, ImageError> {
            Err(ImageError::NotAnImage(0))
        }
    }

    #[test]
    fn test_placeholders() {
        let images = Images(vec![
            ("/usr/bin/app", true, Ok(Some("aa"))),
            ("/usr/lib/libbroken.so", false, Err(())),
            ("/usr/lib/libnoid.so", false, Ok(None)),
        ]);
        let placeholders = expand_loaded_modules(&images, "dump");
        assert_eq!(placeholders.len(), 3);

        assert_eq!(placeholders[0].local_path, "/usr/bin/app");
        assert_eq!(
            placeholders[0].index.as_deref(),
            Some("app/elf-buildid-aa/app.gz")
        );
        assert!(placeholders[0].executable_image);
        assert!(placeholders[0].debug_critical);
        assert_eq!(placeholders[0].hash, None);

        assert_eq!(placeholders[1].index, None);
        assert!(!placeholders[1].executable_image);
        assert_eq!(placeholders[2].index, None);
    }

    #[test]
    fn test_runtime_companions() {
        let images = Images(vec![(
            "/usr/share/dotnet/shared/Microsoft.NETCore.App/8.0.1/libcoreclr.so",
            false,
            Ok(Some("c0ffee")),
        )]);
        let placeholders = expand_loaded_modules(&images, "dump");
        let entries: Vec<_> = placeholders
            .iter()
            .map(|p| (p.local_path.as_str(), p.index.as_deref().unwrap()))
            .collect();
        assert_eq!(
            entries,
            [
                (
                    "/usr/share/dotnet/shared/Microsoft.NETCore.App/8.0.1/libcoreclr.so",
                    "libcoreclr.so/elf-buildid-c0ffee/libcoreclr.so.gz"
                ),
                (
                    "/usr/share/dotnet/shared/Microsoft.NETCore.App/8.0.1/libmscordaccore.so",
                    "libmscordaccore.so/elf-buildid-c0ffee/libmscordaccore.so.gz"
                ),
                (
                    "/usr/share/dotnet/shared/Microsoft.NETCore.App/8.0.1/libsos.so",
                    "libsos.so/elf-buildid-c0ffee/libsos.so.gz"
                ),
            ]
        );
    }

    #[test]
    fn test_companions_without_build_id() {
        let images = Images(vec![("/opt/libcoreclr.so", false, Ok(None))]);
        let placeholders = expand_loaded_modules(&images, "dump");
        assert_eq!(placeholders.len(), 3);
        assert!(placeholders.iter().all(|p| p.index.is_none()));
        assert_eq!(placeholders[2].local_path, "/opt/libsos.so");
    }

    #[test]
    fn test_broken_module_table() {
        assert!(expand_loaded_modules(&Broken, "dump").is_empty());
    }
}
