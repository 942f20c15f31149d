// plan.rs: The patch-plan document
//
// A JSON description of everything the front-end decided: in-place byte
// patches, the instruction index covering them, trampoline mappings with
// sparse content, init-function addresses, and an optional mmap hint.
// Running without a plan is the passthru action: the binary is rewritten
// into its self-loading form with nothing injected.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::binary::Binary;
use crate::maps::Mapping;
use crate::{absolute, PAGE_SIZE};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    /// In-place byte patches, applied to the work area before emission.
    #[serde(default)]
    pub patches: Vec<Patch>,
    /// Instruction index entries covering every patched location.
    #[serde(default)]
    pub instructions: Vec<Instruction>,
    #[serde(default)]
    pub mappings: Vec<PlanMapping>,
    /// Virtual addresses of init functions the loader runs at start-up.
    #[serde(default)]
    pub inits: Vec<i64>,
    #[serde(default)]
    pub mmap_hint: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Patch {
    pub offset: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Instruction {
    pub addr: i64,
    pub offset: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanMapping {
    pub base: i64,
    pub size: u64,
    /// Protection string, any of "r", "w", "x" (e.g. "rx").
    #[serde(default = "default_prot")]
    pub prot: String,
    /// Installed before the original entry runs.
    #[serde(default = "default_true")]
    pub preload: bool,
    /// The base is a fixed virtual address, independent of the load bias.
    #[serde(default)]
    pub absolute: bool,
    #[serde(default)]
    pub chunks: Vec<PlanChunk>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanChunk {
    pub offset: u64,
    pub bytes: Vec<u8>,
}

fn default_prot() -> String {
    "rx".to_string()
}

fn default_true() -> bool {
    true
}

fn parse_prot(s: &str) -> Result<i32> {
    let mut prot = 0;
    for ch in s.chars() {
        prot |= match ch {
            'r' => libc::PROT_READ,
            'w' => libc::PROT_WRITE,
            'x' => libc::PROT_EXEC,
            _ => bail!("invalid protection string '{s}': expected a subset of \"rwx\""),
        };
    }
    Ok(prot)
}

impl Plan {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read plan {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse plan {}", path.display()))
    }

    /// Apply the plan's patches and bookkeeping to the binary.
    pub fn load_into(&self, binary: &mut Binary) -> Result<()> {
        for patch in &self.patches {
            let lo = patch.offset as usize;
            let hi = lo + patch.bytes.len();
            if hi > binary.patched.len() {
                bail!(
                    "patch at offset {:#x}+{} runs past end of file ({} bytes)",
                    patch.offset,
                    patch.bytes.len(),
                    binary.patched.len()
                );
            }
            binary.patched[lo..hi].copy_from_slice(&patch.bytes);
        }
        for instr in &self.instructions {
            binary.add_instr(instr.addr, instr.offset);
        }
        binary.inits = self.inits.clone();
        binary.mmap_hint = self.mmap_hint;
        Ok(())
    }

    /// Build the mapping set, validating alignment and protections.
    pub fn mappings(&self) -> Result<Vec<Mapping>> {
        let mut out = Vec::with_capacity(self.mappings.len());
        for pm in &self.mappings {
            if pm.base % PAGE_SIZE as i64 != 0 {
                bail!("mapping base {:#x} is not page aligned", pm.base);
            }
            if pm.size == 0 || pm.size % PAGE_SIZE != 0 {
                bail!("mapping size {:#x} is not a page multiple", pm.size);
            }
            let base = if pm.absolute {
                absolute(pm.base)
            } else {
                pm.base
            };
            let mut mapping = Mapping::new(base, pm.size, parse_prot(&pm.prot)?, pm.preload);
            for chunk in &pm.chunks {
                if chunk.offset + chunk.bytes.len() as u64 > pm.size {
                    bail!(
                        "mapping chunk at {:#x}+{} exceeds mapping size {:#x}",
                        chunk.offset,
                        chunk.bytes.len(),
                        pm.size
                    );
                }
                mapping = mapping.with_chunk(chunk.offset, chunk.bytes.clone());
            }
            out.push(mapping);
        }
        Ok(out)
    }
}
