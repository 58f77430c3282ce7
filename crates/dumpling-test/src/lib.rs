//! Helpers for testing the service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Blob stores and stagers recreate their directories lazily, so a
//!    directory dropped too early is silently leaked. Assign it to a variable in the test
//!    function (e.g. `let _dir = dumpling_test::tempdir()`).
//!
//!  - Binaries are built in memory by [`elf_object`], [`elf_core`], [`minidump`] and
//!    [`mach_core`]. They carry just enough structure for format detection and module
//!    enumeration.

use std::io::Write;

use flate2::Compression;
use flate2::write::GzEncoder;
use sha1::{Digest, Sha1};
use test_assembler::{Endian, Label, LabelMaker, Section};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Load address of executables built by [`elf_object`].
pub const EXECUTABLE_BASE: u64 = 0x40_0000;

const PAGE_SIZE: u64 = 0x1000;
const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;
const ET_CORE: u16 = 4;
const EM_X86_64: u16 = 62;
const PT_LOAD: u32 = 1;
const PT_NOTE: u32 = 4;
const NT_GNU_BUILD_ID: u32 = 3;
const NT_FILE: u32 = 0x4649_4c45;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `dumpling_service` crate and mutes
///    all other logs (such as symbolic or aws).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("dumpling_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Gzip compresses `data`, the way clients send uploads.
pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// The lowercase hex SHA-1 of `data`.
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

fn push_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn push_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn push_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn pad_to(buf: &mut Vec<u8>, align: usize) {
    while buf.len() % align != 0 {
        buf.push(0);
    }
}

/// A 64-bit little endian ELF header without section headers.
fn elf_header(e_type: u16, entry: u64, phnum: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(EHDR_SIZE);
    // magic, ELFCLASS64, ELFDATA2LSB, EV_CURRENT, System V ABI
    buf.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    buf.extend_from_slice(&[0; 8]);
    push_u16(&mut buf, e_type);
    push_u16(&mut buf, EM_X86_64);
    push_u32(&mut buf, 1);
    push_u64(&mut buf, entry);
    push_u64(&mut buf, EHDR_SIZE as u64); // e_phoff
    push_u64(&mut buf, 0); // e_shoff
    push_u32(&mut buf, 0); // e_flags
    push_u16(&mut buf, EHDR_SIZE as u16);
    push_u16(&mut buf, PHDR_SIZE as u16);
    push_u16(&mut buf, phnum);
    push_u16(&mut buf, 64); // e_shentsize
    push_u16(&mut buf, 0); // e_shnum
    push_u16(&mut buf, 0); // e_shstrndx
    buf
}

fn program_header(buf: &mut Vec<u8>, p_type: u32, offset: u64, vaddr: u64, size: u64, align: u64) {
    push_u32(buf, p_type);
    push_u32(buf, if p_type == PT_LOAD { 5 } else { 4 }); // R+X or R
    push_u64(buf, offset);
    push_u64(buf, vaddr);
    push_u64(buf, vaddr); // p_paddr
    push_u64(buf, size); // p_filesz
    push_u64(buf, size); // p_memsz
    push_u64(buf, align);
}

/// An ELF note with 4 byte alignment.
fn note(name: &[u8], n_type: u32, desc: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    push_u32(&mut buf, name.len() as u32 + 1);
    push_u32(&mut buf, desc.len() as u32);
    push_u32(&mut buf, n_type);
    buf.extend_from_slice(name);
    buf.push(0);
    pad_to(&mut buf, 4);
    buf.extend_from_slice(desc);
    pad_to(&mut buf, 4);
    buf
}

/// Builds an ELF image loaded at `base`, with a GNU build id note if `build_id` is given.
///
/// Executables are linked at `base`, shared libraries at zero.
pub fn elf_image(build_id: Option<&[u8]>, executable: bool, base: u64) -> Vec<u8> {
    let notes = build_id
        .map(|id| note(b"GNU", NT_GNU_BUILD_ID, id))
        .unwrap_or_default();
    let link_base = if executable { base } else { 0 };
    let notes_offset = EHDR_SIZE + 2 * PHDR_SIZE;
    let size = (notes_offset + notes.len()) as u64;

    let e_type = if executable { ET_EXEC } else { ET_DYN };
    let mut buf = elf_header(e_type, link_base, 2);
    program_header(&mut buf, PT_LOAD, 0, link_base, size, PAGE_SIZE);
    program_header(
        &mut buf,
        PT_NOTE,
        notes_offset as u64,
        link_base + notes_offset as u64,
        notes.len() as u64,
        4,
    );
    buf.extend_from_slice(&notes);
    buf
}

/// Builds an ELF object with a GNU build id note if `build_id` is given.
///
/// Executables are linked at [`EXECUTABLE_BASE`].
pub fn elf_object(build_id: Option<&[u8]>, executable: bool) -> Vec<u8> {
    elf_image(build_id, executable, EXECUTABLE_BASE)
}

/// An image mapped into a process recorded by [`elf_core`].
#[derive(Clone, Debug)]
pub struct CoreImage {
    pub path: String,
    pub base: u64,
    pub build_id: Option<Vec<u8>>,
    pub executable: bool,
    /// Whether the memory of the image is part of the core.
    pub dumped: bool,
}

impl CoreImage {
    pub fn executable(path: &str, base: u64, build_id: Option<&[u8]>) -> Self {
        Self {
            path: path.to_owned(),
            base,
            build_id: build_id.map(<[u8]>::to_vec),
            executable: true,
            dumped: true,
        }
    }

    pub fn library(path: &str, base: u64, build_id: Option<&[u8]>) -> Self {
        Self {
            executable: false,
            ..Self::executable(path, base, build_id)
        }
    }

    fn bytes(&self) -> Vec<u8> {
        elf_image(self.build_id.as_deref(), self.executable, self.base)
    }
}

/// Builds a 64-bit ELF core file of a process that had `images` mapped.
///
/// The core has an `NT_FILE` note listing every image, and a load segment with the image bytes
/// for every image that is `dumped`.
pub fn elf_core(images: &[CoreImage]) -> Vec<u8> {
    let mut desc = Vec::new();
    push_u64(&mut desc, images.len() as u64);
    push_u64(&mut desc, PAGE_SIZE);
    for image in images {
        let size = (image.bytes().len() as u64).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        push_u64(&mut desc, image.base);
        push_u64(&mut desc, image.base + size);
        push_u64(&mut desc, 0);
    }
    for image in images {
        desc.extend_from_slice(image.path.as_bytes());
        desc.push(0);
    }
    let notes = note(b"CORE", NT_FILE, &desc);

    let dumped: Vec<_> = images
        .iter()
        .filter(|image| image.dumped)
        .map(|image| (image.base, image.bytes()))
        .collect();

    let phnum = 1 + dumped.len();
    let mut offset = (EHDR_SIZE + phnum * PHDR_SIZE) as u64;
    let mut buf = elf_header(ET_CORE, 0, phnum as u16);
    program_header(&mut buf, PT_NOTE, offset, 0, notes.len() as u64, 4);
    offset += notes.len() as u64;
    for (base, bytes) in &dumped {
        program_header(&mut buf, PT_LOAD, offset, *base, bytes.len() as u64, PAGE_SIZE);
        offset += bytes.len() as u64;
    }

    buf.extend_from_slice(&notes);
    for (_, bytes) in dumped {
        buf.extend_from_slice(&bytes);
    }
    buf
}

/// Builds the header of a 64-bit Mach-O core file without load commands.
pub fn mach_core() -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    push_u32(&mut buf, 0xfeed_facf); // MH_MAGIC_64
    push_u32(&mut buf, 0x0100_0007); // CPU_TYPE_X86_64
    push_u32(&mut buf, 3); // CPU_SUBTYPE_X86_64_ALL
    push_u32(&mut buf, 4); // MH_CORE
    push_u32(&mut buf, 0); // ncmds
    push_u32(&mut buf, 0); // sizeofcmds
    push_u32(&mut buf, 0); // flags
    push_u32(&mut buf, 0); // reserved
    buf
}

/// The PDB GUID of modules in [`minidump`], as `{3249D99D-0C40-4931-8610-F4E4FB0B6936}`.
const PDB_GUID: (u32, u16, u16, [u8; 8]) = (
    0x3249_d99d,
    0x0c40,
    0x4931,
    [0x86, 0x10, 0xf4, 0xe4, 0xfb, 0x0b, 0x69, 0x36],
);

/// The breakpad debug id of PDBs in [`minidump`], lowercased.
pub const PDB_DEBUG_ID: &str = "3249d99d0c4049318610f4e4fb0b69361";

/// A module of a Windows minidump built by [`minidump`].
#[derive(Clone, Debug)]
pub struct MinidumpModule<'a> {
    pub code_file: &'a str,
    pub time_date_stamp: u32,
    pub size_of_image: u32,
    /// The PDB referenced by the CodeView record, if any.
    pub pdb_file: Option<&'a str>,
}

impl MinidumpModule<'_> {
    /// The code identifier minidump readers derive from the module.
    pub fn code_id(&self) -> String {
        format!("{:08x}{:x}", self.time_date_stamp, self.size_of_image)
    }
}

fn minidump_string(section: Section, label: &Label, value: &str) -> Section {
    let units: Vec<u16> = value.encode_utf16().collect();
    let mut section = section.mark(label).D32(2 * units.len() as u32);
    for unit in units {
        section = section.D16(unit);
    }
    section.D16(0)
}

/// Builds a Windows minidump with a system info and a module list stream.
pub fn minidump(modules: &[MinidumpModule<'_>]) -> Vec<u8> {
    let stream_directory = Label::new();
    let system_info = Label::new();
    let module_list = Label::new();
    let csd_version = Label::new();
    let names: Vec<Label> = modules.iter().map(|_| Label::new()).collect();
    let cv_records: Vec<Label> = modules.iter().map(|_| Label::new()).collect();

    let mut section = Section::with_endian(Endian::Little)
        .set_start_const(0)
        .D32(0x504d_444d) // MDMP
        .D32(0x0000_a793) // MINIDUMP_VERSION
        .D32(2) // streams
        .D32(&stream_directory)
        .D32(0) // checksum
        .D32(0) // timestamp
        .D64(0) // flags
        .mark(&stream_directory)
        .D32(7) // SystemInfoStream
        .D32(56)
        .D32(&system_info)
        .D32(4) // ModuleListStream
        .D32(4 + 108 * modules.len() as u32)
        .D32(&module_list)
        .mark(&system_info)
        .D16(9) // PROCESSOR_ARCHITECTURE_AMD64
        .D16(6) // processor level
        .D16(0x5e03) // processor revision
        .D8(8) // processors
        .D8(1) // VER_NT_WORKSTATION
        .D32(10) // major version
        .D32(0) // minor version
        .D32(19041) // build number
        .D32(2) // VER_PLATFORM_WIN32_NT
        .D32(&csd_version)
        .D16(0) // suite mask
        .D16(0)
        .append_repeated(0, 24) // cpu information
        .mark(&module_list)
        .D32(modules.len() as u32);

    for (position, module) in modules.iter().enumerate() {
        let cv_size = module.pdb_file.map_or(0, |pdb| 24 + pdb.len() as u32 + 1);
        section = section
            .D64(0x1_4000_0000 + 0x100_0000 * position as u64)
            .D32(module.size_of_image)
            .D32(0) // checksum
            .D32(module.time_date_stamp)
            .D32(&names[position])
            .append_repeated(0, 52) // VS_FIXEDFILEINFO
            .D32(cv_size);
        section = match module.pdb_file {
            Some(_) => section.D32(&cv_records[position]),
            None => section.D32(0),
        };
        section = section
            .D32(0) // misc record
            .D32(0)
            .D64(0) // reserved
            .D64(0);
    }

    section = minidump_string(section, &csd_version, "");
    for (position, module) in modules.iter().enumerate() {
        section = minidump_string(section, &names[position], module.code_file);
    }
    for (position, module) in modules.iter().enumerate() {
        let Some(pdb) = module.pdb_file else {
            continue;
        };
        let (data1, data2, data3, data4) = PDB_GUID;
        section = section
            .mark(&cv_records[position])
            .D32(0x5344_5352) // RSDS
            .D32(data1)
            .D16(data2)
            .D16(data3)
            .append_bytes(&data4)
            .D32(1) // age
            .append_bytes(pdb.as_bytes())
            .D8(0);
    }

    section
        .get_contents()
        .expect("all minidump labels are placed")
}
