use std::path::PathBuf;

/// All fatal emission errors.
///
/// Every variant terminates the current emission; nothing is recovered
/// locally. Non-fatal conditions (ignored options) travel as warnings in
/// [`crate::loader::Stats`] instead.
#[derive(thiserror::Error, Debug)]
pub enum PatchError {
    /// The input file failed ELF validation.
    #[error("failed to parse ELF file \"{file}\": {reason}")]
    MalformedInput { file: PathBuf, reason: String },

    /// A mapping's page-divided address does not fit the on-disk `i32` field.
    #[error("mapping address ({addr:#x}) {}flow detected", if *.underflow { "under" } else { "over" })]
    MapAddressOverflow { addr: i64, underflow: bool },

    /// A mapping's page count does not fit the on-disk 20-bit field.
    #[error("mapping size ({len}) overflow detected")]
    MapSizeOverflow { len: u64 },

    /// A mapping's page-divided file offset does not fit the on-disk `u32` field.
    #[error("mapping offset ({offset:+}) overflow detected")]
    MapOffsetOverflow { offset: u64 },

    /// DSO rewiring found no `DT_INIT` entry before `DT_NULL`.
    #[error("failed to replace DT_INIT entry; entry was not found")]
    MissingInit,

    /// DSO rewiring requires a `PT_DYNAMIC` segment.
    #[error("failed to replace DT_INIT entry; missing PT_DYNAMIC program header")]
    MissingDynamic,

    /// No repurposable program header (`PT_NOTE`/`PT_GNU_RELRO`/`PT_GNU_STACK`).
    #[error("failed to replace PHDR entry; missing {wanted} segment")]
    NoInjectionSlot { wanted: &'static str },

    /// The maximum non-absolute mapping base exceeds the loader base option.
    #[error(
        "loader base address ({base:#x}) (see `--loader-base') must not be \
         below maximum mapping address ({ub:#x})"
    )]
    LoaderBaseTooLow { base: i64, ub: i64 },

    /// A segment overlaps the low-address guard or a prior reservation.
    #[error("failed to reserve address space range {lo:#x}..{hi:#x}")]
    ReservationConflict { lo: i64, hi: i64 },

    /// An upstream invariant was violated (e.g. a dirty page with no
    /// covering instruction). Indicates a bug, not bad input.
    #[error("internal error: {0}")]
    Internal(String),
}
