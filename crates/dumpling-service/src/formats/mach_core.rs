use object::Endianness;
use object::macho::{MH_CORE, MachHeader32, MachHeader64};
use object::read::macho::MachHeader;

/// Whether `data` starts with the header of a Mach-O core file.
pub fn is_mach_core(data: &[u8]) -> bool {
    if let Ok(header) = MachHeader64::<Endianness>::parse(data, 0) {
        return header
            .endian()
            .is_ok_and(|endian| header.filetype(endian) == MH_CORE);
    }
    if let Ok(header) = MachHeader32::<Endianness>::parse(data, 0) {
        return header
            .endian()
            .is_ok_and(|endian| header.filetype(endian) == MH_CORE);
    }
    false
}
