// refactor.rs: Restore original code pages, relocate the patched copies
//
// Some programs are hard to patch ahead of the dynamic linker: the code
// segment can run before any injected loader gets control. The refactor
// pass sidesteps that by shipping the *original* bytes at their natural
// file offsets and moving the patched pages to the end of the file, where
// the loader maps them back over the originals at start-up.

use std::collections::BTreeMap;

use crate::binary::Instr;
use crate::error::PatchError;
use crate::PAGE_SIZE;

/// One planned restoration: `size` bytes at virtual address `addr`, whose
/// patched copy moves from `original_offset` to `patched_offset`.
#[derive(Debug, Clone)]
pub struct Refactor {
    pub addr: i64,
    pub size: u64,
    pub original_offset: u64,
    pub patched_offset: u64,
}

/// True iff the page at `offset` differs from the original file, treating
/// bytes past the original's end as zero (the page-rounding padding).
fn page_dirty(original: &[u8], patched: &[u8], offset: usize) -> bool {
    let page = &patched[offset..offset + PAGE_SIZE as usize];
    page.iter().enumerate().any(|(i, &byte)| {
        let orig = original.get(offset + i).copied().unwrap_or(0);
        byte != orig
    })
}

/// Walk the patched image a page at a time and cluster the dirty pages.
/// Pages within one `mapping_size` of a cluster's end join it, clean gaps
/// included: the cluster is the region the loader will map, not only the
/// changed bytes. Returns an empty plan in static-loader mode.
pub fn plan(
    original: &[u8],
    patched: &[u8],
    instrs: &BTreeMap<u64, Instr>,
    mapping_size: u64,
    static_loader: bool,
) -> Result<Vec<Refactor>, PatchError> {
    if static_loader {
        return Ok(Vec::new());
    }
    debug_assert_eq!(patched.len() as u64 % PAGE_SIZE, 0);

    let page_mask = !(PAGE_SIZE as i64 - 1);
    let mut refactors = Vec::new();
    let mut curr: Option<Refactor> = None;
    for offset in (0..patched.len()).step_by(PAGE_SIZE as usize) {
        if !page_dirty(original, patched, offset) {
            continue;
        }
        let instr = instrs.range(offset as u64..).next().map(|(_, i)| i).ok_or_else(|| {
            PatchError::Internal(format!(
                "dirty page at offset {offset:#x} has no covering instruction"
            ))
        })?;
        let page_addr = instr.addr & page_mask;
        let page_offset = instr.offset & page_mask as u64;
        debug_assert_eq!(page_offset, offset as u64);

        match curr {
            Some(ref mut c)
                if page_addr >= c.addr
                    && page_addr as i128 <= c.addr as i128 + (c.size + mapping_size) as i128 =>
            {
                c.size = (page_addr + PAGE_SIZE as i64 - c.addr) as u64;
            }
            _ => {
                if let Some(c) = curr.take() {
                    refactors.push(c);
                }
                curr = Some(Refactor {
                    addr: page_addr,
                    size: PAGE_SIZE,
                    original_offset: page_offset,
                    patched_offset: 0,
                });
            }
        }
    }
    if let Some(c) = curr {
        refactors.push(c);
    }
    Ok(refactors)
}

/// Append each refactor's patched pages to the file and restore the
/// original bytes in place. Fills in `patched_offset` and returns the
/// total growth.
pub fn apply(patched: &mut Vec<u8>, original: &[u8], refactors: &mut [Refactor]) -> u64 {
    let size_0 = patched.len();
    for r in refactors {
        r.patched_offset = patched.len() as u64;
        let lo = r.original_offset as usize;
        let hi = lo + r.size as usize;
        patched.extend_from_within(lo..hi);

        let orig_hi = original.len().min(hi);
        if lo < orig_hi {
            patched[lo..orig_hi].copy_from_slice(&original[lo..orig_hi]);
        }
        if orig_hi < hi {
            patched[orig_hi..hi].fill(0);
        }
    }
    (patched.len() - size_0) as u64
}
