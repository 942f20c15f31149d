pub mod binary;
pub mod elf;
pub mod error;
pub mod loader;
pub mod maps;
pub mod plan;
pub mod refactor;
pub mod reserve;
pub mod shim;

pub use binary::{Binary, Instr, Mode};
pub use error::PatchError;
pub use loader::{emit, Options, PhdrChoice, Stats};
pub use maps::{Chunk, Mapping};

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

pub const PAGE_SIZE: u64 = 0x1000;

/// Lower bound of the base-relative half of the address space. Everything
/// below is the encoding range for absolute addresses; x86-64 user space
/// fits in 47 bits, so the two halves cannot collide.
pub const RELATIVE_ADDRESS_MIN: i64 = -(1 << 47);

/// Encode a fixed virtual address so it survives base-relative handling.
pub fn absolute(addr: i64) -> i64 {
    debug_assert!((0..(1i64 << 47)).contains(&addr));
    i64::MIN + addr
}

/// True iff `addr` carries the absolute encoding.
pub fn is_absolute(addr: i64) -> bool {
    addr < RELATIVE_ADDRESS_MIN
}

/// Strip the absolute encoding, if present.
pub fn base_address(addr: i64) -> i64 {
    if is_absolute(addr) {
        addr - i64::MIN
    } else {
        addr
    }
}

/// Write data to a file atomically via a temporary file and rename.
///
/// Creates a sibling temp file, writes all data, flushes, then renames
/// over the target path. This prevents partial reads on crash.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    let tmp_path = parent.join(format!(
        ".{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    ));
    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create temp file {}", tmp_path.display()))?;
    file.write_all(data)
        .with_context(|| format!("failed to write temp file {}", tmp_path.display()))?;
    file.flush()?;
    fs::rename(&tmp_path, path).with_context(|| {
        let _ = fs::remove_file(&tmp_path);
        format!(
            "failed to rename {} to {}",
            tmp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}
