use ::minidump::system_info::Os;
use ::minidump::{MinidumpModule, MinidumpModuleList, MinidumpSystemInfo, Module};
use symbolic::common::ByteView;

use crate::crosslink::{ImageError, LoadedImage, LoadedImages};
use crate::index::{IndexPrefix, file_name};

type Minidump = ::minidump::Minidump<'static, ByteView<'static>>;

/// A parsed minidump.
pub struct MinidumpHandle {
    dump: Minidump,
}

impl std::fmt::Debug for MinidumpHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MinidumpHandle").finish_non_exhaustive()
    }
}

impl MinidumpHandle {
    pub fn parse(data: ByteView<'static>) -> Option<Self> {
        match Minidump::read(data) {
            Ok(dump) => Some(Self { dump }),
            Err(err) => {
                tracing::trace!(error = &err as &dyn std::error::Error, "not a minidump");
                None
            }
        }
    }
}

impl LoadedImages for MinidumpHandle {
    fn loaded_images(&self) -> Result<Vec<LoadedImage>, ImageError> {
        let os = self
            .dump
            .get_stream::<MinidumpSystemInfo>()
            .map(|info| info.os)
            .unwrap_or(Os::Windows);
        let modules = self.dump.get_stream::<MinidumpModuleList>()?;
        Ok(module_images(os, modules.iter().map(ModuleInfo::from)))
    }
}

/// The identifying parts of a minidump module.
#[derive(Debug, Clone, Default)]
struct ModuleInfo {
    code_file: String,
    code_id: Option<String>,
    debug_file: Option<String>,
    debug_id: Option<String>,
    debug_uuid: Option<String>,
}

impl From<&MinidumpModule> for ModuleInfo {
    fn from(module: &MinidumpModule) -> Self {
        let debug_id = module.debug_identifier().filter(|id| !id.is_nil());
        ModuleInfo {
            code_file: module.code_file().into_owned(),
            code_id: module
                .code_identifier()
                .filter(|id| !id.is_nil())
                .map(|id| id.to_string().to_lowercase()),
            debug_file: module.debug_file().map(|file| file.into_owned()),
            debug_id: debug_id.map(|id| id.breakpad().to_string().to_lowercase()),
            debug_uuid: debug_id.map(|id| id.uuid().as_simple().to_string()),
        }
    }
}

/// Turns a module list into loaded images, using the identifier scheme of the dumped platform.
///
/// The first module of a minidump is the main executable. Windows modules yield the image
/// itself, indexed by code identifier, and its PDB, indexed by debug identifier.
fn module_images(os: Os, modules: impl Iterator<Item = ModuleInfo>) -> Vec<LoadedImage> {
    let mut images = Vec::new();
    for (position, module) in modules.enumerate() {
        if module.code_file.is_empty() {
            continue;
        }
        let executable = position == 0;
        match os {
            Os::Linux | Os::Android | Os::Solaris => images.push(LoadedImage {
                file_name: file_name(&module.code_file).to_lowercase(),
                path: module.code_file,
                prefix: IndexPrefix::Elf,
                executable,
                build_id: Ok(module.code_id),
            }),
            Os::MacOs | Os::Ios => images.push(LoadedImage {
                file_name: file_name(&module.code_file).to_lowercase(),
                path: module.code_file,
                prefix: IndexPrefix::Mach,
                executable,
                build_id: Ok(module.debug_uuid),
            }),
            _ => {
                if let Some(debug_file) = module
                    .debug_file
                    .filter(|file| file.to_ascii_lowercase().ends_with(".pdb"))
                {
                    images.push(LoadedImage {
                        file_name: file_name(&debug_file).to_lowercase(),
                        path: debug_file,
                        prefix: IndexPrefix::Pdb,
                        executable: false,
                        build_id: Ok(module.debug_id),
                    });
                }
                images.push(LoadedImage {
                    file_name: file_name(&module.code_file).to_lowercase(),
                    path: module.code_file,
                    prefix: IndexPrefix::Pe,
                    executable,
                    build_id: Ok(module.code_id),
                });
            }
        }
    }
    images
}
