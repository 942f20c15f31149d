// elf.rs: ELF64 constants, field access, and input validation
//
// The patcher never holds references into the image across mutations;
// every field access goes through an (offset, length)-checked read or a
// put at a known-validated offset. Layout knowledge is kept here as plain
// constants, one per field, in file order.

use crate::binary::{Binary, Mode};
use crate::error::PatchError;
use crate::reserve::ReservedRanges;
use crate::RELATIVE_ADDRESS_MIN;

pub const EHDR_SIZE: usize = 64;
pub const PHDR_SIZE: usize = 56;

const EI_MAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_VERSION: usize = 6;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;

pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;
pub const EM_X86_64: u16 = 62;

/// e_phnum values above this escape into section header 0; not supported.
pub const PN_XNUM: u16 = 0xffff;

// ELF header field offsets.
pub const E_TYPE: usize = 16;
pub const E_MACHINE: usize = 18;
pub const E_ENTRY: usize = 24;
pub const E_PHOFF: usize = 32;
pub const E_PHNUM: usize = 56;

// Program header field offsets (relative to the entry).
pub const P_TYPE: usize = 0;
pub const P_FLAGS: usize = 4;
pub const P_OFFSET: usize = 8;
pub const P_VADDR: usize = 16;
pub const P_PADDR: usize = 24;
pub const P_FILESZ: usize = 32;
pub const P_MEMSZ: usize = 40;
pub const P_ALIGN: usize = 48;

pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_NOTE: u32 = 4;
pub const PT_GNU_STACK: u32 = 0x6474_e551;
pub const PT_GNU_RELRO: u32 = 0x6474_e552;

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

pub const DT_NULL: i64 = 0;
pub const DT_INIT: i64 = 12;
/// One `Elf64_Dyn` entry: d_tag + d_un.
pub const DYN_SIZE: usize = 16;

pub fn read_u16(data: &[u8], off: usize) -> Option<u16> {
    let b = data.get(off..off + 2)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

pub fn read_u32(data: &[u8], off: usize) -> Option<u32> {
    let b = data.get(off..off + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub fn read_u64(data: &[u8], off: usize) -> Option<u64> {
    let b = data.get(off..off + 8)?;
    let mut v = [0u8; 8];
    v.copy_from_slice(b);
    Some(u64::from_le_bytes(v))
}

pub fn read_i64(data: &[u8], off: usize) -> Option<i64> {
    read_u64(data, off).map(|v| v as i64)
}

// The put_* writers index directly: emission only writes at offsets that
// validation (or its own cursor) has already established to be in range.

pub fn put_u32(data: &mut [u8], off: usize, v: u32) {
    data[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

pub fn put_u64(data: &mut [u8], off: usize, v: u64) {
    data[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

pub fn put_i64(data: &mut [u8], off: usize, v: i64) {
    data[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Program-header table geometry plus the entries the injector needs later.
/// Indices, not offsets: the table never moves, but the buffer grows.
#[derive(Debug, Default, Clone)]
pub struct ElfInfo {
    pub phoff: u64,
    pub phnum: u16,
    pub phdr_note: Option<u16>,
    pub phdr_gnu_relro: Option<u16>,
    pub phdr_gnu_stack: Option<u16>,
    pub phdr_dynamic: Option<u16>,
}

impl ElfInfo {
    /// Byte offset of program header `idx` within the image.
    pub fn phdr(&self, idx: u16) -> usize {
        self.phoff as usize + idx as usize * PHDR_SIZE
    }
}

/// Parse and validate the input ELF, record the program headers the
/// injector needs, and reserve every address range the binary already
/// claims. Returns true iff the binary is position independent.
pub fn parse(b: &mut Binary, rsv: &mut ReservedRanges) -> Result<bool, PatchError> {
    let malformed = |b: &Binary, reason: String| PatchError::MalformedInput {
        file: b.filename.clone(),
        reason,
    };

    let size = b.patched.len();
    if size < EHDR_SIZE {
        return Err(malformed(b, "file is too small".into()));
    }
    if b.patched[0..4] != EI_MAG {
        return Err(malformed(b, "invalid magic number".into()));
    }
    if b.patched[EI_CLASS] != ELFCLASS64 {
        return Err(malformed(b, "file is not 64bit".into()));
    }
    if b.patched[EI_DATA] != ELFDATA2LSB {
        return Err(malformed(b, "file is not little endian".into()));
    }
    if b.patched[EI_VERSION] != EV_CURRENT {
        return Err(malformed(b, "invalid version".into()));
    }
    let machine = read_u16(&b.patched, E_MACHINE).unwrap_or(0);
    if machine != EM_X86_64 {
        return Err(malformed(b, "file is not x86_64".into()));
    }
    let phoff = read_u64(&b.patched, E_PHOFF).unwrap_or(0);
    if phoff < EHDR_SIZE as u64 || phoff >= size as u64 {
        return Err(malformed(b, "invalid program header offset".into()));
    }
    let phnum = read_u16(&b.patched, E_PHNUM).unwrap_or(0);
    if phnum >= PN_XNUM {
        return Err(malformed(b, "too many program headers".into()));
    }
    if phoff + phnum as u64 * PHDR_SIZE as u64 > size as u64 {
        return Err(malformed(b, "invalid program headers".into()));
    }

    let e_type = read_u16(&b.patched, E_TYPE).unwrap_or(0);
    let mut pic = false;
    let mut pie = false;
    match e_type {
        ET_EXEC => {
            if b.mode == Mode::SharedObject {
                return Err(malformed(
                    b,
                    "file is an executable and not a shared object".into(),
                ));
            }
            // Keep allocations away from the unmapped low pages.
            if !rsv.reserve(0x0, 0x10000) {
                return Err(PatchError::ReservationConflict { lo: 0x0, hi: 0x10000 });
            }
        }
        ET_DYN => {
            pic = true;
            pie = b.mode == Mode::Executable;
        }
        _ => return Err(malformed(b, "file is not executable".into())),
    }
    if !pie {
        // Only PIEs can use the negative address range. Other PIC such as
        // shared objects cannot: the dynamic linker tends to place other
        // libraries there.
        if !rsv.reserve(RELATIVE_ADDRESS_MIN, 0x0) {
            return Err(PatchError::ReservationConflict {
                lo: RELATIVE_ADDRESS_MIN,
                hi: 0x0,
            });
        }
    }

    let mut info = ElfInfo {
        phoff,
        phnum,
        ..Default::default()
    };
    for i in 0..phnum {
        let off = phoff as usize + i as usize * PHDR_SIZE;
        let p_type = read_u32(&b.patched, off + P_TYPE).unwrap_or(0);
        match p_type {
            PT_LOAD => {
                let vstart = read_i64(&b.patched, off + P_VADDR).unwrap_or(0);
                let memsz = read_i64(&b.patched, off + P_MEMSZ).unwrap_or(0);
                let vend = vstart + memsz;
                if !rsv.reserve(vstart, vend) {
                    return Err(PatchError::ReservationConflict {
                        lo: vstart,
                        hi: vend,
                    });
                }
            }
            PT_DYNAMIC => info.phdr_dynamic = Some(i),
            PT_NOTE => info.phdr_note = Some(i),
            PT_GNU_RELRO => info.phdr_gnu_relro = Some(i),
            PT_GNU_STACK => info.phdr_gnu_stack = Some(i),
            _ => {}
        }
    }
    if let Some(idx) = info.phdr_dynamic {
        let off = info.phdr(idx);
        let p_offset = read_u64(&b.patched, off + P_OFFSET).unwrap_or(0);
        let p_memsz = read_u64(&b.patched, off + P_MEMSZ).unwrap_or(0);
        if p_offset + p_memsz > size as u64 {
            return Err(malformed(b, "invalid dynamic section".into()));
        }
    }

    b.elf = info;
    b.pic = pic;
    Ok(pic)
}
