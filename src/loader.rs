// loader.rs: Self-loader injection
//
// Appends the loader payload to the patched image and rewires the binary
// so the payload runs first. The payload is one contiguous page-aligned
// region:
//
//   [config record | elf extension | inits[] | maps[0][] | maps[1][] |
//    entry shim | loader blob]
//
// and is mapped read-execute at the loader base address by repurposing a
// non-load program header. The entry shim captures (argc, argv), loads
// the config address into the third argument register, and falls through
// into the loader blob, which installs the mapping arrays and jumps to
// the original entry point.
//
// The buffer may reallocate while the payload grows, so nothing here
// holds a reference into it: every field written after the fact goes
// through its recorded offset.

use std::iter;

use crate::binary::{Binary, Mode};
use crate::elf::{
    put_i64, put_u32, put_u64, read_i64, read_u32, read_u64, DT_INIT, DT_NULL, DYN_SIZE, E_ENTRY,
    PF_R, PF_X, PT_LOAD, P_ALIGN, P_FILESZ, P_FLAGS, P_MEMSZ, P_OFFSET, P_PADDR, P_TYPE, P_VADDR,
};
use crate::error::PatchError;
use crate::maps::{self, Mapping};
use crate::{refactor, PAGE_SIZE};

/// First bytes of the config record.
pub const CONFIG_MAGIC: [u8; 8] = *b"E9PATCH\0";

/// Config flag bit 0: the patched binary is an executable, so the loader
/// transfers to `entry` by jumping rather than returning.
pub const FLAG_EXECUTABLE: u32 = 0x1;

// Config record field offsets.
pub const CFG_MAGIC: usize = 0;
pub const CFG_FLAGS: usize = 8;
pub const CFG_SIZE: usize = 12;
pub const CFG_BASE: usize = 16;
pub const CFG_ENTRY: usize = 24;
pub const CFG_DYNAMIC: usize = 32;
pub const CFG_MMAP: usize = 40;
pub const CFG_NUM_MAPS: usize = 48; // [u32; 2]
pub const CFG_MAPS: usize = 56; // [u32; 2]
pub const CFG_NUM_INITS: usize = 64;
pub const CFG_INITS: usize = 68;
pub const CONFIG_SIZE: usize = 72;

/// ELF-specific extension record following the config record; holds the
/// runtime address of PT_DYNAMIC (or 0).
pub const CONFIG_ELF_SIZE: usize = 8;

pub const DEFAULT_LOADER_BASE: i64 = 0x7000_0000;
pub const DEFAULT_MAPPING_SIZE: u64 = 0x20_0000;

/// Which program header to repurpose into the loader's PT_LOAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PhdrChoice {
    /// First of PT_NOTE, PT_GNU_RELRO, PT_GNU_STACK that exists.
    #[default]
    Auto,
    Note,
    GnuRelro,
    GnuStack,
}

/// Emission options, threaded through instead of process-wide state.
#[derive(Debug, Clone)]
pub struct Options {
    /// Virtual address the loader payload is mapped at.
    pub loader_base: i64,
    /// Skip refactoring: the on-disk code pages stay patched.
    pub static_loader: bool,
    pub phdr: PhdrChoice,
    /// Prepend an int3 to the entry shim (debugger hook).
    pub trap_entry: bool,
    /// Accepted for interface parity; ignored for ELF with a warning.
    pub mem_rebase: bool,
    /// Refactor clustering budget; dirty pages within this distance of a
    /// cluster's end join it.
    pub mapping_size: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            loader_base: DEFAULT_LOADER_BASE,
            static_loader: false,
            phdr: PhdrChoice::Auto,
            trap_entry: false,
            mem_rebase: false,
            mapping_size: DEFAULT_MAPPING_SIZE,
        }
    }
}

/// Per-emission statistics and the non-fatal warning channel.
#[derive(Debug, Default)]
pub struct Stats {
    pub input_size: u64,
    pub output_size: u64,
    /// Bytes of trampoline blobs written to the file.
    pub physical_bytes: u64,
    /// Bytes of virtual address space the emitted records map.
    pub virtual_bytes: u64,
    pub refactors: usize,
    pub warnings: Vec<String>,
}

fn pad_to_page(buf: &mut Vec<u8>) {
    let rem = buf.len() as u64 % PAGE_SIZE;
    if rem != 0 {
        buf.resize(buf.len() + (PAGE_SIZE - rem) as usize, 0);
    }
}

fn round_up_page(n: u64) -> u64 {
    n.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Emit the patched binary: refactor the patched pages, append the
/// trampoline blobs and the loader payload, rewire the entry point, and
/// repurpose a program header to map the payload. Consumes the emission;
/// on success `binary.patched` is the complete output image.
pub fn emit(
    binary: &mut Binary,
    mappings: &mut [Mapping],
    opts: &Options,
    loader_blob: &[u8],
) -> Result<Stats, PatchError> {
    let mut stats = Stats {
        input_size: binary.patched.len() as u64,
        ..Default::default()
    };

    // Step A: round up to the page boundary (zero fill).
    pad_to_page(&mut binary.patched);

    // Step B: refactor the patching (if necessary).
    let mut refactors = refactor::plan(
        &binary.original,
        &binary.patched,
        &binary.instrs,
        opts.mapping_size,
        opts.static_loader,
    )?;
    refactor::apply(&mut binary.patched, &binary.original, &mut refactors);
    stats.refactors = refactors.len();

    // Step C: emit all trampoline blobs.
    binary.config_base = opts.loader_base;
    for mapping in mappings.iter_mut() {
        let at = binary.patched.len();
        mapping.offset = at as u64;
        binary.patched.resize(at + mapping.size as usize, 0);
        maps::flatten(&mut binary.patched[at..], mapping, 0xCC);
    }

    // Step D: start the loader payload on a fresh page.
    pad_to_page(&mut binary.patched);
    let config_offset = binary.patched.len();

    // Step E: config record + ELF extension.
    binary
        .patched
        .resize(config_offset + CONFIG_SIZE + CONFIG_ELF_SIZE, 0);
    binary.patched[config_offset..config_offset + 8].copy_from_slice(&CONFIG_MAGIC);
    put_i64(&mut binary.patched, config_offset + CFG_BASE, opts.loader_base);
    if let Some(hint) = binary.mmap_hint {
        put_i64(&mut binary.patched, config_offset + CFG_MMAP, hint);
    }

    // Step F: init table.
    let inits_rel = (binary.patched.len() - config_offset) as u32;
    put_u32(&mut binary.patched, config_offset + CFG_INITS, inits_rel);
    let mut num_inits = 0u32;
    for i in 0..binary.inits.len() {
        let init = binary.inits[i];
        binary.patched.extend_from_slice(&init.to_le_bytes());
        num_inits += 1;
    }
    put_u32(&mut binary.patched, config_offset + CFG_NUM_INITS, num_inits);

    // Step G: the two mapping arrays, preload then postload. Merged
    // mappings borrow the head's blob offset; sparse mappings emit one
    // record per dense sub-range.
    let mut num_maps = [0u32; 2];
    let mut ub = i64::MIN;
    for (pass, count) in num_maps.iter_mut().enumerate() {
        let preload = pass == 0;
        let rel = (binary.patched.len() - config_offset) as u32;
        put_u32(&mut binary.patched, config_offset + CFG_MAPS + 4 * pass, rel);
        for head in mappings.iter() {
            if preload {
                stats.physical_bytes += head.size;
            }
            let offset_0 = head.offset;
            for node in iter::once(head).chain(head.merged.iter()) {
                if node.preload != preload {
                    continue;
                }
                let r = node.prot & libc::PROT_READ != 0;
                let w = node.prot & libc::PROT_WRITE != 0;
                let x = node.prot & libc::PROT_EXEC != 0;
                for (lb, ub_range) in node.bounds(PAGE_SIZE) {
                    let base = node.base + lb as i64;
                    let len = ub_range - lb;
                    let offset = offset_0 + lb;
                    maps::emit_map(
                        &mut binary.patched,
                        base,
                        len,
                        offset,
                        r,
                        w,
                        x,
                        Some(&mut ub),
                    )?;
                    *count += 1;
                    stats.virtual_bytes += len;
                }
            }
        }
    }

    // Step H: refactor mappings join the postload array. Executable and
    // read-only: the loader maps the relocated patched pages back over
    // the code segment.
    for r in &refactors {
        maps::emit_map(
            &mut binary.patched,
            r.addr,
            r.size,
            r.patched_offset,
            true,
            false,
            true,
            None,
        )?;
        num_maps[1] += 1;
    }
    put_u32(&mut binary.patched, config_offset + CFG_NUM_MAPS, num_maps[0]);
    put_u32(
        &mut binary.patched,
        config_offset + CFG_NUM_MAPS + 4,
        num_maps[1],
    );

    // Step I: every base-relative mapping must sit at or below the
    // loader base, or the record's base-relative encoding breaks.
    if ub > opts.loader_base {
        return Err(PatchError::LoaderBaseTooLow {
            base: opts.loader_base,
            ub,
        });
    }

    // Step J: entry shim. The rewired entry point lands here.
    let entry = opts.loader_base + (binary.patched.len() - config_offset) as i64;
    if opts.trap_entry {
        binary.patched.push(0xCC); // int3
    }
    match binary.mode {
        Mode::Executable => {
            // mov (%rsp),%rdi        ; argc
            // lea 0x8(%rsp),%rsi     ; argv
            binary
                .patched
                .extend_from_slice(&[0x48, 0x8B, 0x3C, 0x24, 0x48, 0x8D, 0x74, 0x24, 0x08]);
        }
        Mode::SharedObject => {
            // xor %edi,%edi
            // xor %esi,%esi
            binary.patched.extend_from_slice(&[0x31, 0xFF, 0x31, 0xF6]);
        }
    }
    // lea config(%rip),%rdx
    binary.patched.extend_from_slice(&[0x48, 0x8D, 0x15]);
    let rel32 = -(((binary.patched.len() + 4) - config_offset) as i64) as i32;
    binary.patched.extend_from_slice(&rel32.to_le_bytes());
    binary.patched.extend_from_slice(loader_blob);

    // Step K: total payload size, rounded up to a page.
    let config_size = (binary.patched.len() - config_offset) as u64;
    put_u32(
        &mut binary.patched,
        config_offset + CFG_SIZE,
        round_up_page(config_size) as u32,
    );

    // Step L: rewire the entry point.
    if let Some(idx) = binary.elf.phdr_dynamic {
        let off = binary.elf.phdr(idx);
        let dynamic = read_i64(&binary.patched, off + P_VADDR)
            .ok_or_else(|| PatchError::Internal("PT_DYNAMIC out of range".into()))?;
        put_i64(&mut binary.patched, config_offset + CFG_DYNAMIC, dynamic);
        put_i64(&mut binary.patched, config_offset + CONFIG_SIZE, dynamic);
    }
    match binary.mode {
        Mode::Executable => {
            let old_entry = read_u64(&binary.patched, E_ENTRY)
                .ok_or_else(|| PatchError::Internal("truncated ELF header".into()))?;
            put_i64(
                &mut binary.patched,
                config_offset + CFG_ENTRY,
                old_entry as i64,
            );
            put_u64(&mut binary.patched, E_ENTRY, entry as u64);
            let flags = read_u32(&binary.patched, config_offset + CFG_FLAGS).unwrap_or(0);
            put_u32(
                &mut binary.patched,
                config_offset + CFG_FLAGS,
                flags | FLAG_EXECUTABLE,
            );
        }
        Mode::SharedObject => {
            let idx = binary.elf.phdr_dynamic.ok_or(PatchError::MissingDynamic)?;
            let off = binary.elf.phdr(idx);
            let p_offset = read_u64(&binary.patched, off + P_OFFSET)
                .ok_or_else(|| PatchError::Internal("PT_DYNAMIC out of range".into()))?;
            let p_memsz = read_u64(&binary.patched, off + P_MEMSZ)
                .ok_or_else(|| PatchError::Internal("PT_DYNAMIC out of range".into()))?;
            let num_dynamic = (p_memsz as usize) / DYN_SIZE;
            let mut found = false;
            for i in 0..num_dynamic {
                let entry_off = p_offset as usize + i * DYN_SIZE;
                let tag = read_i64(&binary.patched, entry_off)
                    .ok_or_else(|| PatchError::Internal("truncated dynamic section".into()))?;
                if tag == DT_NULL {
                    break;
                }
                if tag == DT_INIT {
                    let old_init = read_i64(&binary.patched, entry_off + 8)
                        .ok_or_else(|| PatchError::Internal("truncated dynamic section".into()))?;
                    put_i64(&mut binary.patched, config_offset + CFG_ENTRY, old_init);
                    put_i64(&mut binary.patched, entry_off + 8, entry);
                    found = true;
                    break;
                }
            }
            if !found {
                return Err(PatchError::MissingInit);
            }
        }
    }

    // Step M: repurpose a program header to map the loader payload.
    let (slot, wanted) = match opts.phdr {
        PhdrChoice::Note => (binary.elf.phdr_note, "PT_NOTE"),
        PhdrChoice::GnuRelro => (binary.elf.phdr_gnu_relro, "PT_GNU_RELRO"),
        PhdrChoice::GnuStack => (binary.elf.phdr_gnu_stack, "PT_GNU_STACK"),
        PhdrChoice::Auto => (
            binary
                .elf
                .phdr_note
                .or(binary.elf.phdr_gnu_relro)
                .or(binary.elf.phdr_gnu_stack),
            "PT_NOTE, PT_GNU_RELRO, or PT_GNU_STACK",
        ),
    };
    let idx = slot.ok_or(PatchError::NoInjectionSlot { wanted })?;
    let off = binary.elf.phdr(idx);
    put_u32(&mut binary.patched, off + P_TYPE, PT_LOAD);
    put_u32(&mut binary.patched, off + P_FLAGS, PF_R | PF_X);
    put_u64(&mut binary.patched, off + P_OFFSET, config_offset as u64);
    put_u64(&mut binary.patched, off + P_VADDR, opts.loader_base as u64);
    put_u64(&mut binary.patched, off + P_PADDR, 0);
    put_u64(&mut binary.patched, off + P_FILESZ, config_size);
    put_u64(&mut binary.patched, off + P_MEMSZ, config_size);
    put_u64(&mut binary.patched, off + P_ALIGN, PAGE_SIZE);

    // The repurposed PT_LOAD must never map past end of file.
    pad_to_page(&mut binary.patched);
    stats.output_size = binary.patched.len() as u64;

    if opts.mem_rebase {
        stats
            .warnings
            .push("ignoring `--mem-rebase' option for Linux ELF binary".to_string());
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::{self, E_PHNUM, PHDR_SIZE};
    use crate::reserve::ReservedRanges;
    use crate::testutil::{self, DYN_OFF, EXEC_ENTRY, IMAGE_SIZE};

    const BLOB: &[u8] = b"\x0f\x0b loader blob stand-in";

    fn prepared(data: Vec<u8>, mode: Mode) -> Binary {
        let mut b = Binary::from_bytes("test.elf", data, mode);
        let mut rsv = ReservedRanges::new();
        elf::parse(&mut b, &mut rsv).unwrap();
        b
    }

    fn config_offset(out: &[u8]) -> usize {
        out.windows(8)
            .position(|w| w == CONFIG_MAGIC)
            .expect("config magic not found")
    }

    fn cfg_u32(out: &[u8], field: usize) -> u32 {
        read_u32(out, config_offset(out) + field).unwrap()
    }

    fn cfg_i64(out: &[u8], field: usize) -> i64 {
        read_i64(out, config_offset(out) + field).unwrap()
    }

    fn phdr_field_u64(out: &[u8], idx: usize, field: usize) -> u64 {
        read_u64(out, 64 + idx * PHDR_SIZE + field).unwrap()
    }

    fn phdr_field_u32(out: &[u8], idx: usize, field: usize) -> u32 {
        read_u32(out, 64 + idx * PHDR_SIZE + field).unwrap()
    }

    #[test]
    fn passthru_executable_layout() {
        let input = testutil::exec_with_note();
        let mut b = prepared(input.clone(), Mode::Executable);
        let opts = Options::default();
        let stats = emit(&mut b, &mut [], &opts, BLOB).unwrap();
        let out = &b.patched;

        // One page of loader payload appended, nothing else.
        assert_eq!(stats.input_size, IMAGE_SIZE as u64);
        assert_eq!(out.len(), IMAGE_SIZE + PAGE_SIZE as usize);
        assert_eq!(stats.output_size, out.len() as u64);
        assert_eq!(stats.refactors, 0);

        let cfg = config_offset(out);
        assert_eq!(cfg, IMAGE_SIZE);
        assert_eq!(cfg as u64 % PAGE_SIZE, 0);

        // Original bytes below the payload are preserved (the ELF and
        // program headers are the only rewritten region).
        let headers_end = 64 + 2 * PHDR_SIZE;
        assert_eq!(&out[headers_end..IMAGE_SIZE], &input[headers_end..]);

        // Entry point now lands in the shim; the original entry is saved.
        let e_entry = read_u64(out, E_ENTRY).unwrap();
        assert!(e_entry > opts.loader_base as u64);
        assert_eq!(cfg_i64(out, CFG_ENTRY), EXEC_ENTRY as i64);
        assert_eq!(cfg_i64(out, CFG_BASE), opts.loader_base);
        assert_eq!(cfg_u32(out, CFG_FLAGS) & FLAG_EXECUTABLE, FLAG_EXECUTABLE);
        assert_eq!(cfg_u32(out, CFG_SIZE), PAGE_SIZE as u32);
        assert_eq!(cfg_u32(out, CFG_NUM_MAPS), 0);
        assert_eq!(cfg_u32(out, CFG_NUM_MAPS + 4), 0);
        assert_eq!(cfg_u32(out, CFG_NUM_INITS), 0);
        assert_eq!(cfg_i64(out, CFG_MMAP), 0);
    }

    #[test]
    fn executable_shim_reaches_config() {
        let mut b = prepared(testutil::exec_with_note(), Mode::Executable);
        let opts = Options::default();
        emit(&mut b, &mut [], &opts, BLOB).unwrap();
        let out = &b.patched;
        let cfg = config_offset(out);

        let e_entry = read_u64(out, E_ENTRY).unwrap();
        let shim = cfg + (e_entry - opts.loader_base as u64) as usize;

        // mov (%rsp),%rdi; lea 8(%rsp),%rsi
        assert_eq!(
            &out[shim..shim + 9],
            &[0x48, 0x8B, 0x3C, 0x24, 0x48, 0x8D, 0x74, 0x24, 0x08]
        );
        // lea config(%rip),%rdx targeting the config record
        assert_eq!(&out[shim + 9..shim + 12], &[0x48, 0x8D, 0x15]);
        let rel32 = i32::from_le_bytes(out[shim + 12..shim + 16].try_into().unwrap());
        let target = (shim + 12 + 4) as i64 + rel32 as i64;
        assert_eq!(target, cfg as i64);
        // The loader blob follows verbatim.
        assert_eq!(&out[shim + 16..shim + 16 + BLOB.len()], BLOB);
    }

    #[test]
    fn repurposed_note_maps_loader() {
        let mut b = prepared(testutil::exec_with_note(), Mode::Executable);
        let opts = Options::default();
        emit(&mut b, &mut [], &opts, BLOB).unwrap();
        let out = &b.patched;
        let cfg = config_offset(out);

        // PT_NOTE is phdr index 1 in the fixture.
        assert_eq!(phdr_field_u32(out, 1, P_TYPE), PT_LOAD);
        assert_eq!(phdr_field_u32(out, 1, P_FLAGS), PF_R | PF_X);
        assert_eq!(phdr_field_u64(out, 1, P_OFFSET), cfg as u64);
        assert_eq!(phdr_field_u64(out, 1, P_VADDR), opts.loader_base as u64);
        assert_eq!(phdr_field_u64(out, 1, P_PADDR), 0);
        assert_eq!(phdr_field_u64(out, 1, P_ALIGN), PAGE_SIZE);
        // filesz/memsz hold the unrounded payload size.
        let filesz = phdr_field_u64(out, 1, P_FILESZ);
        assert_eq!(filesz, phdr_field_u64(out, 1, P_MEMSZ));
        assert!(filesz > (CONFIG_SIZE + CONFIG_ELF_SIZE + BLOB.len()) as u64);
        assert!(filesz <= PAGE_SIZE);
        // ... and the file extends to the rounded end.
        assert!(cfg as u64 + round_up_page(filesz) <= out.len() as u64);
    }

    #[test]
    fn dso_rewires_dt_init() {
        let mut b = prepared(testutil::dso_with_relro(0x1200), Mode::SharedObject);
        let opts = Options::default();
        emit(&mut b, &mut [], &opts, BLOB).unwrap();
        let out = &b.patched;
        let cfg = config_offset(out);

        // Original init saved; DT_INIT now points into the shim.
        assert_eq!(cfg_i64(out, CFG_ENTRY), 0x1200);
        let init_entry_off = DYN_OFF as usize + DYN_SIZE; // after DT_HASH
        let new_init = read_i64(out, init_entry_off + 8).unwrap();
        // No inits and no maps: the shim starts right after the records.
        assert_eq!(
            new_init,
            opts.loader_base + (CONFIG_SIZE + CONFIG_ELF_SIZE) as i64
        );
        // Executable flag stays clear; e_entry is untouched.
        assert_eq!(cfg_u32(out, CFG_FLAGS) & FLAG_EXECUTABLE, 0);
        assert_eq!(read_u64(out, E_ENTRY).unwrap(), 0);

        // DSO prologue: xor %edi,%edi; xor %esi,%esi.
        let shim = cfg + (new_init - opts.loader_base) as usize;
        assert_eq!(&out[shim..shim + 4], &[0x31, 0xFF, 0x31, 0xF6]);

        // The dynamic address lands in the record and its extension.
        assert_eq!(cfg_i64(out, CFG_DYNAMIC), DYN_OFF as i64);
        assert_eq!(read_i64(out, cfg + CONFIG_SIZE).unwrap(), DYN_OFF as i64);

        // PT_GNU_RELRO (index 2) was repurposed.
        assert_eq!(phdr_field_u32(out, 2, P_TYPE), PT_LOAD);
        assert_eq!(phdr_field_u64(out, 2, P_VADDR), opts.loader_base as u64);
    }

    #[test]
    fn dso_without_init_fails() {
        let mut b = prepared(testutil::dso_without_init(), Mode::SharedObject);
        let err = emit(&mut b, &mut [], &Options::default(), BLOB).unwrap_err();
        assert!(matches!(err, PatchError::MissingInit));
    }

    #[test]
    fn dso_without_dynamic_fails() {
        let mut data = testutil::dso_with_relro(0x1200);
        // Neuter PT_DYNAMIC (phdr index 1) into PT_NULL.
        put_u32(&mut data, 64 + PHDR_SIZE + P_TYPE, 0);
        let mut b = prepared(data, Mode::SharedObject);
        let err = emit(&mut b, &mut [], &Options::default(), BLOB).unwrap_err();
        assert!(matches!(err, PatchError::MissingDynamic));
    }

    #[test]
    fn no_injection_slot_fails() {
        let mut b = prepared(testutil::exec_without_slot(), Mode::Executable);
        let err = emit(&mut b, &mut [], &Options::default(), BLOB).unwrap_err();
        assert!(matches!(err, PatchError::NoInjectionSlot { .. }));
    }

    #[test]
    fn phdr_choice_is_honored() {
        let mut b = prepared(testutil::exec_with_note(), Mode::Executable);
        let opts = Options {
            phdr: PhdrChoice::GnuStack,
            ..Default::default()
        };
        let err = emit(&mut b, &mut [], &opts, BLOB).unwrap_err();
        match err {
            PatchError::NoInjectionSlot { wanted } => assert_eq!(wanted, "PT_GNU_STACK"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn auto_choice_prefers_relro_when_no_note() {
        let mut b = prepared(testutil::dso_with_relro(0x1200), Mode::SharedObject);
        emit(&mut b, &mut [], &Options::default(), BLOB).unwrap();
        assert_eq!(phdr_field_u32(&b.patched, 2, P_TYPE), PT_LOAD);
        // PT_DYNAMIC is untouched.
        assert_eq!(phdr_field_u32(&b.patched, 1, P_TYPE), elf::PT_DYNAMIC);
    }

    #[test]
    fn loader_base_too_low_fails() {
        let mut b = prepared(testutil::exec_with_note(), Mode::Executable);
        let mut mappings = [Mapping::new(0x8000_0000, 0x1000, libc::PROT_READ, true)
            .with_chunk(0, vec![0x90; 0x1000])];
        let opts = Options {
            loader_base: 0x4000_0000,
            ..Default::default()
        };
        let err = emit(&mut b, &mut mappings, &opts, BLOB).unwrap_err();
        match err {
            PatchError::LoaderBaseTooLow { base, ub } => {
                assert_eq!(base, 0x4000_0000);
                assert_eq!(ub, 0x8000_0000);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn loader_base_equal_to_max_mapping_is_fine() {
        let mut b = prepared(testutil::exec_with_note(), Mode::Executable);
        let mut mappings = [Mapping::new(0x4000_0000, 0x1000, libc::PROT_READ, true)
            .with_chunk(0, vec![0x90; 0x1000])];
        let opts = Options {
            loader_base: 0x4000_0000,
            ..Default::default()
        };
        emit(&mut b, &mut mappings, &opts, BLOB).unwrap();
    }

    #[test]
    fn mapping_arrays_and_stats() {
        let mut b = prepared(testutil::exec_with_note(), Mode::Executable);
        let mut mappings = [
            Mapping::new(0x1000_0000, 0x1000, libc::PROT_READ | libc::PROT_EXEC, true)
                .with_chunk(0, vec![0xAA; 0x20]),
            Mapping::new(0x2000_0000, 0x1000, libc::PROT_READ | libc::PROT_WRITE, false)
                .with_chunk(0, vec![0xBB; 0x20]),
        ];
        let stats = emit(&mut b, &mut mappings, &Options::default(), BLOB).unwrap();
        let out = &b.patched;
        let cfg = config_offset(out);

        // Blobs landed at page-aligned offsets before the payload.
        assert_eq!(mappings[0].offset, IMAGE_SIZE as u64);
        assert_eq!(mappings[1].offset, IMAGE_SIZE as u64 + 0x1000);
        assert_eq!(cfg, IMAGE_SIZE + 0x2000);
        assert_eq!(out[mappings[0].offset as usize], 0xAA);
        assert_eq!(out[mappings[0].offset as usize + 0x20], 0xCC); // int3 fill

        assert_eq!(cfg_u32(out, CFG_NUM_MAPS), 1);
        assert_eq!(cfg_u32(out, CFG_NUM_MAPS + 4), 1);
        assert_eq!(stats.physical_bytes, 0x2000);
        assert_eq!(stats.virtual_bytes, 0x2000);

        // Record count between maps[0] and the shim matches (invariant).
        let maps0 = cfg + cfg_u32(out, CFG_MAPS) as usize;
        let e_entry = read_u64(out, E_ENTRY).unwrap();
        let shim = cfg + (e_entry - DEFAULT_LOADER_BASE as u64) as usize;
        let total = cfg_u32(out, CFG_NUM_MAPS) + cfg_u32(out, CFG_NUM_MAPS + 4);
        assert_eq!(shim - maps0, total as usize * maps::MAP_RECORD_SIZE);

        // Preload record: base, offset, and prot bits round-trip.
        let addr = i32::from_le_bytes(out[maps0..maps0 + 4].try_into().unwrap());
        let foffset = read_u32(out, maps0 + 4).unwrap();
        let word = read_u32(out, maps0 + 8).unwrap();
        assert_eq!(addr as i64 * PAGE_SIZE as i64, 0x1000_0000);
        assert_eq!(foffset as u64 * PAGE_SIZE, mappings[0].offset);
        assert_eq!(word & 0xf_ffff, 1);
        assert_eq!(word >> 28, 0b0101); // r-x

        // Postload record follows in maps[1].
        let maps1 = cfg + cfg_u32(out, CFG_MAPS + 4) as usize;
        let word1 = read_u32(out, maps1 + 8).unwrap();
        assert_eq!(word1 >> 28, 0b0011); // rw-
    }

    #[test]
    fn merged_mappings_share_the_head_blob() {
        let mut head = Mapping::new(0x1000_0000, 0x2000, libc::PROT_READ | libc::PROT_EXEC, true)
            .with_chunk(0, vec![0xAA; 0x10]);
        head.merged.push(
            Mapping::new(0x3000_0000, 0x2000, libc::PROT_READ, false)
                .with_chunk(0x1000, vec![0xBB; 0x10]),
        );
        let mut b = prepared(testutil::exec_with_note(), Mode::Executable);
        let mut mappings = [head];
        emit(&mut b, &mut mappings, &Options::default(), BLOB).unwrap();
        let out = &b.patched;
        let cfg = config_offset(out);

        assert_eq!(cfg_u32(out, CFG_NUM_MAPS), 1);
        assert_eq!(cfg_u32(out, CFG_NUM_MAPS + 4), 1);

        // The merged node's record points into the head's blob.
        let maps1 = cfg + cfg_u32(out, CFG_MAPS + 4) as usize;
        let addr = i32::from_le_bytes(out[maps1..maps1 + 4].try_into().unwrap());
        let foffset = read_u32(out, maps1 + 4).unwrap();
        assert_eq!(addr as i64 * PAGE_SIZE as i64, 0x3000_0000 + 0x1000);
        assert_eq!(foffset as u64 * PAGE_SIZE, mappings[0].offset + 0x1000);
        // Both chunks landed in the one blob.
        let blob = mappings[0].offset as usize;
        assert_eq!(out[blob], 0xAA);
        assert_eq!(out[blob + 0x1000], 0xBB);
    }

    #[test]
    fn init_table_is_emitted() {
        let mut b = prepared(testutil::exec_with_note(), Mode::Executable);
        b.inits = vec![0x111_1000, 0x222_2000];
        emit(&mut b, &mut [], &Options::default(), BLOB).unwrap();
        let out = &b.patched;
        let cfg = config_offset(out);

        assert_eq!(cfg_u32(out, CFG_NUM_INITS), 2);
        let inits = cfg + cfg_u32(out, CFG_INITS) as usize;
        assert_eq!(read_i64(out, inits).unwrap(), 0x111_1000);
        assert_eq!(read_i64(out, inits + 8).unwrap(), 0x222_2000);
        // The preload array starts right after the init table.
        assert_eq!(cfg_u32(out, CFG_MAPS), cfg_u32(out, CFG_INITS) + 16);
    }

    #[test]
    fn refactored_patch_round_trips() {
        let input = testutil::exec_with_note();
        let mut b = prepared(input.clone(), Mode::Executable);
        // Patch one byte in the entry page and index the instruction.
        b.patched[0x1010] = 0xF4; // hlt over the nop sled
        b.add_instr(0x40_1010, 0x1010);
        let stats = emit(&mut b, &mut [], &Options::default(), BLOB).unwrap();
        let out = &b.patched;
        let cfg = config_offset(out);

        assert_eq!(stats.refactors, 1);
        assert_eq!(cfg, IMAGE_SIZE + PAGE_SIZE as usize);

        // The natural offset holds the original page again...
        assert_eq!(&out[0x1000..0x2000], &input[0x1000..0x2000]);
        // ...and the relocated copy holds the patch.
        assert_eq!(out[IMAGE_SIZE + 0x10], 0xF4);

        // The loader re-installs it via a postload record, read-execute.
        assert_eq!(cfg_u32(out, CFG_NUM_MAPS), 0);
        assert_eq!(cfg_u32(out, CFG_NUM_MAPS + 4), 1);
        let maps1 = cfg + cfg_u32(out, CFG_MAPS + 4) as usize;
        let addr = i32::from_le_bytes(out[maps1..maps1 + 4].try_into().unwrap());
        let foffset = read_u32(out, maps1 + 4).unwrap();
        let word = read_u32(out, maps1 + 8).unwrap();
        assert_eq!(addr as i64 * PAGE_SIZE as i64, 0x40_1000);
        assert_eq!(foffset as u64 * PAGE_SIZE, IMAGE_SIZE as u64);
        assert_eq!(word & 0xf_ffff, 1);
        assert_eq!(word >> 28, 0b0101); // r-x, never writable
    }

    #[test]
    fn static_loader_skips_refactoring() {
        let input = testutil::exec_with_note();
        let mut b = prepared(input, Mode::Executable);
        b.patched[0x1010] = 0xF4;
        b.add_instr(0x40_1010, 0x1010);
        let opts = Options {
            static_loader: true,
            ..Default::default()
        };
        let stats = emit(&mut b, &mut [], &opts, BLOB).unwrap();
        assert_eq!(stats.refactors, 0);
        // The patch stays in place on disk.
        assert_eq!(b.patched[0x1010], 0xF4);
    }

    #[test]
    fn trap_entry_prepends_int3() {
        let mut b = prepared(testutil::exec_with_note(), Mode::Executable);
        let opts = Options {
            trap_entry: true,
            ..Default::default()
        };
        emit(&mut b, &mut [], &opts, BLOB).unwrap();
        let out = &b.patched;
        let cfg = config_offset(out);
        let e_entry = read_u64(out, E_ENTRY).unwrap();
        let shim = cfg + (e_entry - opts.loader_base as u64) as usize;
        assert_eq!(out[shim], 0xCC);
        assert_eq!(&out[shim + 1..shim + 5], &[0x48, 0x8B, 0x3C, 0x24]);
    }

    #[test]
    fn mem_rebase_warns_and_is_ignored() {
        let mut b = prepared(testutil::exec_with_note(), Mode::Executable);
        let opts = Options {
            mem_rebase: true,
            ..Default::default()
        };
        let stats = emit(&mut b, &mut [], &opts, BLOB).unwrap();
        assert_eq!(stats.warnings.len(), 1);
        assert!(stats.warnings[0].contains("mem-rebase"));
    }

    #[test]
    fn mmap_hint_lands_in_config() {
        let mut b = prepared(testutil::exec_with_note(), Mode::Executable);
        b.mmap_hint = Some(0x5555_0000);
        emit(&mut b, &mut [], &Options::default(), BLOB).unwrap();
        assert_eq!(cfg_i64(&b.patched, CFG_MMAP), 0x5555_0000);
    }

    #[test]
    fn phnum_is_untouched() {
        let mut b = prepared(testutil::exec_with_note(), Mode::Executable);
        emit(&mut b, &mut [], &Options::default(), BLOB).unwrap();
        assert_eq!(crate::elf::read_u16(&b.patched, E_PHNUM).unwrap(), 2);
    }
}
