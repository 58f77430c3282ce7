//! ELF core files.
//!
//! The kernel records every file mapped into the crashed process in an `NT_FILE` note. For each
//! mapped ELF image, the image's headers and notes are still present in the dumped memory, which
//! is where the build id of a loaded module is read from.

use object::elf::{self, FileHeader32, FileHeader64};
use object::read::elf::{FileHeader, NoteIterator, ProgramHeader};
use object::{Endian as _, Endianness};
use symbolic::common::ByteView;

use crate::crosslink::{ImageError, LoadedImage, LoadedImages};
use crate::index::{IndexPrefix, file_name};

/// Note type listing the files mapped into the process (`"FILE"`).
const NT_FILE: u32 = 0x4649_4c45;

/// Offset of the class byte in `e_ident`.
const EI_CLASS: usize = 4;

/// How much of an image's first page is read to find its headers.
const IMAGE_HEADER_SIZE: u64 = 4096;

/// Upper bound on `NT_FILE` entries, guarding against corrupt counts.
const MAX_MAPPED_FILES: u64 = 1 << 16;

#[derive(Debug, Clone, Copy)]
struct Segment {
    vaddr: u64,
    offset: u64,
    filesz: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MappedFile {
    start: u64,
    end: u64,
    /// Offset into the file, in pages.
    file_offset: u64,
    path: String,
}

/// A parsed ELF core file.
pub struct ElfCore {
    data: ByteView<'static>,
    segments: Vec<Segment>,
    files: Vec<MappedFile>,
}

impl std::fmt::Debug for ElfCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElfCore")
            .field("segments", &self.segments.len())
            .field("files", &self.files)
            .finish()
    }
}

impl ElfCore {
    /// Parses `data` if it is an ELF core file.
    pub fn parse(data: ByteView<'static>) -> Option<Self> {
        let (segments, files) = match *data.get(EI_CLASS)? {
            elf::ELFCLASS64 => parse_core::<FileHeader64<Endianness>>(&data)?,
            elf::ELFCLASS32 => parse_core::<FileHeader32<Endianness>>(&data)?,
            _ => return None,
        };
        Some(ElfCore {
            data,
            segments,
            files,
        })
    }

    /// Reads up to `len` bytes of dumped memory at `addr`.
    ///
    /// The returned slice is shorter than `len` if the segment containing `addr` ends early.
    fn read_memory(&self, addr: u64, len: u64) -> Option<&[u8]> {
        let segment = self.segments.iter().find(|segment| {
            addr >= segment.vaddr && addr - segment.vaddr < segment.filesz
        })?;
        let skip = addr - segment.vaddr;
        let len = len.min(segment.filesz - skip);
        let start = usize::try_from(segment.offset.checked_add(skip)?).ok()?;
        let end = start.checked_add(usize::try_from(len).ok()?)?;
        self.data.get(start..end)
    }

    fn read_image(&self, file: &MappedFile) -> Result<ImageInfo, ImageError> {
        let base = file.start;
        let mapped = file.end.saturating_sub(file.start);
        let header = self
            .read_memory(base, IMAGE_HEADER_SIZE.min(mapped))
            .ok_or(ImageError::Unmapped(base))?;
        match header.get(EI_CLASS).copied() {
            Some(elf::ELFCLASS64) => self.image_info::<FileHeader64<Endianness>>(base, header),
            Some(elf::ELFCLASS32) => self.image_info::<FileHeader32<Endianness>>(base, header),
            _ => Err(ImageError::NotAnImage(base)),
        }
    }

    fn image_info<Elf>(&self, base: u64, header_data: &[u8]) -> Result<ImageInfo, ImageError>
    where
        Elf: FileHeader<Endian = Endianness>,
    {
        let header = Elf::parse(header_data)?;
        let endian = header.endian()?;
        let executable = header.e_type(endian) == elf::ET_EXEC;
        let program_headers = header.program_headers(endian, header_data)?;

        let first_vaddr = program_headers
            .iter()
            .filter(|phdr| phdr.p_type(endian) == elf::PT_LOAD)
            .map(|phdr| -> u64 { phdr.p_vaddr(endian).into() })
            .min()
            .unwrap_or(0);
        let bias = base.wrapping_sub(first_vaddr & !(IMAGE_HEADER_SIZE - 1));

        for phdr in program_headers {
            if phdr.p_type(endian) != elf::PT_NOTE {
                continue;
            }
            let addr = bias.wrapping_add(phdr.p_vaddr(endian).into());
            let Some(data) = self.read_memory(addr, phdr.p_filesz(endian).into()) else {
                continue;
            };
            let mut notes = NoteIterator::<Elf>::new(endian, phdr.p_align(endian), data)?;
            while let Some(note) = notes.next()? {
                if trim_nul(note.name()) == elf::ELF_NOTE_GNU
                    && note.n_type(endian) == elf::NT_GNU_BUILD_ID
                    && !note.desc().is_empty()
                {
                    return Ok(ImageInfo {
                        executable,
                        build_id: Some(hex::encode(note.desc())),
                    });
                }
            }
        }

        Ok(ImageInfo {
            executable,
            build_id: None,
        })
    }
}

struct ImageInfo {
    executable: bool,
    build_id: Option<String>,
}

impl LoadedImages for ElfCore {
    fn loaded_images(&self) -> Result<Vec<LoadedImage>, ImageError> {
        let mut seen = std::collections::HashSet::new();
        let mut images = Vec::new();
        for file in &self.files {
            // only the mapping of the file start contains the ELF header
            if file.file_offset != 0 || !seen.insert(file.path.as_str()) {
                continue;
            }
            let info = self.read_image(file);
            images.push(LoadedImage {
                path: file.path.clone(),
                file_name: file_name(&file.path).to_lowercase(),
                prefix: IndexPrefix::Elf,
                executable: info.as_ref().is_ok_and(|info| info.executable),
                build_id: info.map(|info| info.build_id),
            });
        }
        Ok(images)
    }
}

fn parse_core<Elf>(data: &[u8]) -> Option<(Vec<Segment>, Vec<MappedFile>)>
where
    Elf: FileHeader<Endian = Endianness>,
{
    let header = Elf::parse(data).ok()?;
    let endian = header.endian().ok()?;
    if header.e_type(endian) != elf::ET_CORE {
        return None;
    }
    let program_headers = header.program_headers(endian, data).ok()?;

    let mut segments = Vec::new();
    let mut files = Vec::new();
    for phdr in program_headers {
        match phdr.p_type(endian) {
            elf::PT_LOAD => segments.push(Segment {
                vaddr: phdr.p_vaddr(endian).into(),
                offset: phdr.p_offset(endian).into(),
                filesz: phdr.p_filesz(endian).into(),
            }),
            elf::PT_NOTE => {
                // a damaged note segment only costs us the module list
                let Ok(Some(mut notes)) = phdr.notes(endian, data) else {
                    tracing::debug!("unreadable note segment in core file");
                    continue;
                };
                while let Ok(Some(note)) = notes.next() {
                    if trim_nul(note.name()) == b"CORE" && note.n_type(endian) == NT_FILE {
                        files.extend(parse_mapped_files(
                            note.desc(),
                            endian,
                            header.is_type_64(),
                        ));
                    }
                }
            }
            _ => {}
        }
    }

    Some((segments, files))
}

/// Parses the payload of an `NT_FILE` note.
///
/// The layout is a count and a page size, followed by `count` triples of start address, end
/// address and file offset, followed by `count` NUL terminated paths. All numbers are native words.
fn parse_mapped_files(desc: &[u8], endian: Endianness, is_64: bool) -> Vec<MappedFile> {
    let word = if is_64 { 8 } else { 4 };
    let read_word = |index: usize| -> Option<u64> {
        let bytes = desc.get(index * word..(index + 1) * word)?;
        Some(match (is_64, endian.is_little_endian()) {
            (true, true) => u64::from_le_bytes(bytes.try_into().ok()?),
            (true, false) => u64::from_be_bytes(bytes.try_into().ok()?),
            (false, true) => u32::from_le_bytes(bytes.try_into().ok()?).into(),
            (false, false) => u32::from_be_bytes(bytes.try_into().ok()?).into(),
        })
    };

    let Some(count) = read_word(0).filter(|count| *count <= MAX_MAPPED_FILES) else {
        return Vec::new();
    };
    let count = count as usize;
    let names_start = (2 + 3 * count) * word;
    let Some(names) = desc.get(names_start..) else {
        return Vec::new();
    };

    let mut files = Vec::with_capacity(count);
    let mut names = names.split(|b| *b == 0);
    for i in 0..count {
        let entry = 2 + 3 * i;
        let (Some(start), Some(end), Some(file_offset), Some(name)) = (
            read_word(entry),
            read_word(entry + 1),
            read_word(entry + 2),
            names.next(),
        ) else {
            break;
        };
        files.push(MappedFile {
            start,
            end,
            file_offset,
            path: String::from_utf8_lossy(name).into_owned(),
        });
    }
    files
}

fn trim_nul(name: &[u8]) -> &[u8] {
    let end = name.iter().rposition(|b| *b != 0).map_or(0, |pos| pos + 1);
    &name[..end]
}
