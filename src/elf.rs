// Minimal ELF32 reader for the embedded boot-time user images.
// ref. https://pdos.csail.mit.edu/6.828/2018/readings/elf.pdf

use core::mem;
use core::slice;

use crate::pmap::VirtAddr;

const ELF_MAGIC: u32 = 0x464c_457f; // 0x7f,'E','L','F' in little endian

/// ELF header (figure 1-3).
#[repr(C)]
struct Elf {
    e_magic: u32,
    e_elf: [u8; 12],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u32, // virtual address to which the system first transfers control
    e_phoff: u32, // program header table's file offset in bytes
    e_shoff: u32,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16, // number of entries in the program header table
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

/// Program header (figure 2-1).
#[repr(C)]
pub(crate) struct Proghdr {
    pub(crate) p_type: ProghdrType,
    pub(crate) p_offset: u32, // segment's first byte offset in the file
    pub(crate) p_vaddr: u32,  // segment's first byte virtual address
    pub(crate) p_paddr: u32,
    pub(crate) p_filesz: u32,
    pub(crate) p_memsz: u32,
    pub(crate) p_flags: u32,
    pub(crate) p_align: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
#[allow(dead_code)]
pub(crate) enum ProghdrType {
    PtNull = 0,
    PtLoad = 1,
    PtDynamic = 2,
    PtInterp = 3,
    PtNote = 4,
    PtShlib = 5,
    PtPhdr = 6,
}

pub(crate) struct ElfParser {
    elf: &'static Elf,
}

impl ElfParser {
    /// Wrap an in-memory image, verifying the magic. The caller keeps
    /// the image alive and unmodified for the parser's lifetime.
    pub(crate) unsafe fn new(binary: *const u8) -> Option<ElfParser> {
        let elf = &*(binary as *const Elf);
        if elf.e_magic != ELF_MAGIC {
            return None;
        }
        Some(ElfParser { elf })
    }

    pub(crate) fn entry_point(&self) -> VirtAddr {
        VirtAddr(self.elf.e_entry as usize)
    }

    pub(crate) fn program_headers(&self) -> impl Iterator<Item = &Proghdr> {
        assert_eq!(
            self.elf.e_phentsize as usize,
            mem::size_of::<Proghdr>(),
            "unexpected program header entry size"
        );
        let base = self.elf as *const Elf as *const u8;
        let ph = unsafe { base.add(self.elf.e_phoff as usize) } as *const Proghdr;
        unsafe { slice::from_raw_parts(ph, self.elf.e_phnum as usize) }.iter()
    }
}
