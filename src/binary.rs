// binary.rs: The in-progress patch target
//
// A Binary owns two buffers: the immutable snapshot of the input file and
// the growable work area the emission steps append to. Everything else is
// bookkeeping the upstream front-end fills in before emission: the ordered
// instruction index, the init-function table, and the parsed ELF geometry.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::elf::ElfInfo;

/// What kind of output the caller asked for. The input's `e_type` must be
/// compatible: an `ET_EXEC` input cannot be patched as a shared object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Executable,
    SharedObject,
}

/// One patched instruction: where its bytes live in the file and where
/// they sit in the virtual address space. The refactor planner uses the
/// index to attribute dirty pages to virtual addresses.
#[derive(Debug, Clone, Copy)]
pub struct Instr {
    pub addr: i64,
    pub offset: u64,
}

#[derive(Debug)]
pub struct Binary {
    pub filename: PathBuf,
    /// Immutable snapshot of the input file.
    pub original: Vec<u8>,
    /// Work area; grows monotonically during emission.
    pub patched: Vec<u8>,
    pub mode: Mode,
    /// Populated by `elf::parse`.
    pub elf: ElfInfo,
    pub pic: bool,
    /// Ordered by file offset.
    pub instrs: BTreeMap<u64, Instr>,
    /// Virtual addresses of init functions the loader runs before the
    /// original entry point.
    pub inits: Vec<i64>,
    /// Pre-resolved `mmap` address, if the front-end found one.
    pub mmap_hint: Option<i64>,
    /// Virtual address the loader payload is mapped at; set by the
    /// injector from the loader-base option.
    pub config_base: i64,
}

impl Binary {
    pub fn from_bytes(filename: impl Into<PathBuf>, data: Vec<u8>, mode: Mode) -> Self {
        Self {
            filename: filename.into(),
            original: data.clone(),
            patched: data,
            mode,
            elf: ElfInfo::default(),
            pic: false,
            instrs: BTreeMap::new(),
            inits: Vec::new(),
            mmap_hint: None,
            config_base: 0,
        }
    }

    pub fn from_file(path: &Path, mode: Mode) -> Result<Self> {
        let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Self::from_bytes(path, data, mode))
    }

    /// Record a patched instruction in the index.
    pub fn add_instr(&mut self, addr: i64, offset: u64) {
        self.instrs.insert(offset, Instr { addr, offset });
    }

    /// Earliest instruction whose file offset is >= `offset`.
    pub fn lower_bound(&self, offset: u64) -> Option<&Instr> {
        self.instrs.range(offset..).next().map(|(_, i)| i)
    }
}
