//! ELF32 ARM loader: validate, walk program headers, map LOAD segments
//! (spec §4.8). Narrowed from the teacher's ELF64 x86_64/AArch64/RISC-V
//! loader with dynamic linking support — no dynamic linking, no
//! interpreter, no relocations; only `ET_EXEC` static binaries.

pub mod types;

use types::{
    Elf32Header, Elf32ProgramHeader, ElfError, ELF32_EHDR_SIZE, ELF32_PHDR_SIZE, ELFCLASS32,
    ELFDATA2LSB, ELF_MAGIC, EM_ARM, ET_EXEC, PF_W, PF_X, PT_LOAD,
};

use crate::config::FRAME_SIZE;
use crate::error::{KernelError, KernelResult};
use crate::mm::frame_allocator;
use crate::mm::page_table::MapFlags;
use crate::mm::vas::Context;

/// Result of a successful load: the entry point to jump to.
pub struct LoadedImage {
    pub entry: usize,
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Parse and validate the ELF header at the start of `image` (spec §4.8
/// "validate").
pub fn parse_header(image: &[u8]) -> Result<Elf32Header, ElfError> {
    if image.len() < ELF32_EHDR_SIZE {
        return Err(ElfError::TooShort);
    }
    if image[0..4] != ELF_MAGIC {
        return Err(ElfError::BadMagic);
    }
    if image[4] != ELFCLASS32 {
        return Err(ElfError::WrongClass);
    }
    if image[5] != ELFDATA2LSB {
        return Err(ElfError::WrongEndian);
    }

    let e_type = read_u16(image, 16);
    let e_machine = read_u16(image, 18);
    if e_machine != EM_ARM {
        return Err(ElfError::WrongMachine);
    }
    if e_type != ET_EXEC {
        return Err(ElfError::NotExecutable);
    }

    let mut e_ident = [0u8; 16];
    e_ident.copy_from_slice(&image[0..16]);

    Ok(Elf32Header {
        e_ident,
        e_type,
        e_machine,
        e_version: read_u32(image, 20),
        e_entry: read_u32(image, 24),
        e_phoff: read_u32(image, 28),
        e_shoff: read_u32(image, 32),
        e_flags: read_u32(image, 36),
        e_ehsize: read_u16(image, 40),
        e_phentsize: read_u16(image, 42),
        e_phnum: read_u16(image, 44),
        e_shentsize: read_u16(image, 46),
        e_shnum: read_u16(image, 48),
        e_shstrndx: read_u16(image, 50),
    })
}

fn read_program_header(image: &[u8], offset: usize) -> Result<Elf32ProgramHeader, ElfError> {
    if offset + ELF32_PHDR_SIZE > image.len() {
        return Err(ElfError::BadProgramHeader);
    }
    Ok(Elf32ProgramHeader {
        p_type: read_u32(image, offset),
        p_offset: read_u32(image, offset + 4),
        p_vaddr: read_u32(image, offset + 8),
        p_paddr: read_u32(image, offset + 12),
        p_filesz: read_u32(image, offset + 16),
        p_memsz: read_u32(image, offset + 20),
        p_flags: read_u32(image, offset + 24),
        p_align: read_u32(image, offset + 28),
    })
}

/// Map one `PT_LOAD` segment into `context`, copying its file contents
/// through the kernel's temporary-mapping window (spec §4.2 "Temporary
/// mappings") so the destination frames need not belong to the active
/// context. Bytes beyond `p_filesz` up to `p_memsz` are left zeroed (BSS).
fn load_segment(context: &Context, image: &[u8], ph: &Elf32ProgramHeader) -> KernelResult<()> {
    let vaddr = ph.p_vaddr as usize;
    if vaddr % FRAME_SIZE != 0 {
        return Err(KernelError::InvalidArgument {
            name: "p_vaddr (segment must be page-aligned)",
        });
    }
    let file_off = ph.p_offset as usize;
    let filesz = ph.p_filesz as usize;
    let memsz = ph.p_memsz as usize;
    if file_off + filesz > image.len() {
        return Err(KernelError::InvalidArgument {
            name: "p_offset/p_filesz (out of image bounds)",
        });
    }

    let flags = MapFlags {
        writable: ph.p_flags & PF_W != 0,
        user: true,
        executable: ph.p_flags & PF_X != 0,
        device: false,
    };

    let frame_count = crate::mm::frames_for(memsz.max(1));
    for i in 0..frame_count {
        let page_vaddr = vaddr + i * FRAME_SIZE;
        let frame = frame_allocator::allocate(1, 1).map_err(|_| KernelError::OutOfMemory {
            requested_frames: frame_count - i,
        })?;
        context.map(page_vaddr, frame, flags)?;

        let tmp = Context::kernel().map_temporary(frame, MapFlags::kernel_rw())?;
        // SAFETY: `tmp` is a freshly mapped, exclusively owned kernel page
        // (the temporary window); writing the whole page before unmapping
        // it is in-bounds and leaves no uninitialized memory visible to the
        // loaded process.
        unsafe {
            core::ptr::write_bytes(tmp as *mut u8, 0, FRAME_SIZE);
        }
        let page_file_start = i * FRAME_SIZE;
        if page_file_start < filesz {
            let copy_len = (filesz - page_file_start).min(FRAME_SIZE);
            let src = &image[file_off + page_file_start..file_off + page_file_start + copy_len];
            // SAFETY: `src` and the destination span are both `copy_len`
            // bytes and do not overlap (one is a file buffer, the other is
            // the temporary window).
            unsafe {
                core::ptr::copy_nonoverlapping(src.as_ptr(), tmp as *mut u8, copy_len);
            }
        }
        Context::kernel().unmap_temporary()?;
    }
    Ok(())
}

/// Load every `PT_LOAD` segment of `image` into `context`, returning the
/// entry point (spec §4.8).
pub fn load(context: &Context, image: &[u8]) -> KernelResult<LoadedImage> {
    let header = parse_header(image).map_err(|_| KernelError::InvalidArgument { name: "elf image" })?;

    let ph_off = header.e_phoff as usize;
    let ph_size = header.e_phentsize as usize;
    for i in 0..header.e_phnum as usize {
        let ph = read_program_header(image, ph_off + i * ph_size)
            .map_err(|_| KernelError::InvalidArgument { name: "program header" })?;
        if ph.p_type != PT_LOAD {
            continue;
        }
        load_segment(context, image, &ph)?;
    }

    Ok(LoadedImage {
        entry: header.e_entry as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_minimal_elf(machine: u16, kind: u16, entry: u32) -> alloc::vec::Vec<u8> {
        let mut image = alloc::vec![0u8; ELF32_EHDR_SIZE];
        image[0..4].copy_from_slice(&ELF_MAGIC);
        image[4] = ELFCLASS32;
        image[5] = ELFDATA2LSB;
        image[16..18].copy_from_slice(&kind.to_le_bytes());
        image[18..20].copy_from_slice(&machine.to_le_bytes());
        image[24..28].copy_from_slice(&entry.to_le_bytes());
        image
    }

    extern crate alloc;

    #[test]
    fn parses_valid_arm_executable_header() {
        let image = make_minimal_elf(EM_ARM, ET_EXEC, 0x1000);
        let header = parse_header(&image).unwrap();
        assert_eq!(header.e_entry, 0x1000);
        assert_eq!(header.e_machine, EM_ARM);
    }

    #[test]
    fn rejects_wrong_machine() {
        let image = make_minimal_elf(62, ET_EXEC, 0x1000); // EM_X86_64
        assert_eq!(parse_header(&image), Err(ElfError::WrongMachine));
    }

    #[test]
    fn rejects_non_executable_type() {
        let image = make_minimal_elf(EM_ARM, 1, 0x1000); // ET_REL
        assert_eq!(parse_header(&image), Err(ElfError::NotExecutable));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut image = make_minimal_elf(EM_ARM, ET_EXEC, 0x1000);
        image[0] = 0;
        assert_eq!(parse_header(&image), Err(ElfError::BadMagic));
    }

    #[test]
    fn rejects_truncated_image() {
        let image = alloc::vec![0u8; 4];
        assert_eq!(parse_header(&image), Err(ElfError::TooShort));
    }
}
