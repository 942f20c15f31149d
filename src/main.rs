use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use elfject::plan::Plan;
use elfject::reserve::ReservedRanges;
use elfject::{base_address, elf, loader, shim, Binary, Mode, Options, PhdrChoice};

#[derive(Parser)]
#[command(
    name = "elfject",
    about = "Static instrumentation injector for x86-64 ELF binaries"
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default)]
enum PhdrArg {
    /// First of note, relro, stack that exists
    #[default]
    Auto,
    Note,
    Relro,
    Stack,
}

impl From<PhdrArg> for PhdrChoice {
    fn from(arg: PhdrArg) -> Self {
        match arg {
            PhdrArg::Auto => PhdrChoice::Auto,
            PhdrArg::Note => PhdrChoice::Note,
            PhdrArg::Relro => PhdrChoice::GnuRelro,
            PhdrArg::Stack => PhdrChoice::GnuStack,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Rewrite a binary into its self-loading patched form
    Patch {
        /// Input ELF (executable or shared object)
        input: PathBuf,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,

        /// Patch a shared object instead of an executable
        #[arg(long)]
        dso: bool,

        /// Patch plan (JSON); without one the binary is passed through
        #[arg(long)]
        plan: Option<PathBuf>,

        /// Virtual address the loader payload is mapped at
        #[arg(long, value_parser = parse_addr, default_value = "0x70000000")]
        loader_base: i64,

        /// Keep patched pages on disk instead of refactoring them
        #[arg(long)]
        static_loader: bool,

        /// Which program header to repurpose for the loader
        #[arg(long, value_enum, default_value = "auto")]
        loader_phdr: PhdrArg,

        /// Prepend an int3 trap to the entry shim
        #[arg(long)]
        trap_entry: bool,

        /// Rebase trampoline memory (ignored for ELF)
        #[arg(long)]
        mem_rebase: bool,

        /// Refactor clustering budget in bytes
        #[arg(long, value_parser = parse_addr, default_value = "0x200000")]
        mapping_size: i64,
    },

    /// Generate shell completions
    Completions { shell: Shell },
}

/// Parse a decimal or 0x-prefixed hexadecimal address.
fn parse_addr(s: &str) -> Result<i64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| format!("invalid address '{s}'"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "elfject", &mut std::io::stdout());
            Ok(())
        }
        Command::Patch {
            input,
            output,
            dso,
            plan,
            loader_base,
            static_loader,
            loader_phdr,
            trap_entry,
            mem_rebase,
            mapping_size,
        } => {
            if mapping_size <= 0 {
                bail!("--mapping-size must be positive");
            }
            let mode = if dso {
                Mode::SharedObject
            } else {
                Mode::Executable
            };
            let opts = Options {
                loader_base,
                static_loader,
                phdr: loader_phdr.into(),
                trap_entry,
                mem_rebase,
                mapping_size: mapping_size as u64,
            };
            patch(&input, &output, mode, plan.as_deref(), &opts, cli.verbose)
        }
    }
}

fn patch(
    input: &std::path::Path,
    output: &std::path::Path,
    mode: Mode,
    plan_path: Option<&std::path::Path>,
    opts: &Options,
    verbose: bool,
) -> Result<()> {
    let mut binary = Binary::from_file(input, mode)?;

    let mut rsv = ReservedRanges::new();
    let pic = elf::parse(&mut binary, &mut rsv)
        .with_context(|| format!("failed to parse {}", input.display()))?;
    if verbose {
        eprintln!(
            "parsed {}: {}{}",
            input.display(),
            match mode {
                Mode::Executable => "executable",
                Mode::SharedObject => "shared object",
            },
            if pic { " (position independent)" } else { "" }
        );
    }

    let plan = match plan_path {
        Some(path) => Plan::from_file(path)?,
        None => Plan::default(),
    };
    plan.load_into(&mut binary)?;
    let mut mappings = plan.mappings()?;

    // Trampolines must not land on anything the binary already occupies.
    for mapping in &mappings {
        let lo = base_address(mapping.base);
        let hi = lo + mapping.size as i64;
        if !rsv.reserve(lo, hi) {
            bail!(
                "mapping {:#x}..{:#x} overlaps address space the binary occupies",
                lo,
                hi
            );
        }
    }

    let blob = shim::loader_blob();
    let stats = loader::emit(&mut binary, &mut mappings, opts, &blob)
        .with_context(|| format!("failed to emit {}", output.display()))?;

    for warning in &stats.warnings {
        eprintln!("warning: {warning}");
    }

    elfject::atomic_write(output, &binary.patched)?;
    if mode == Mode::Executable {
        let perms = std::fs::Permissions::from_mode(0o755);
        std::fs::set_permissions(output, perms)
            .with_context(|| format!("failed to chmod {}", output.display()))?;
    }

    if verbose {
        eprintln!(
            "wrote {}: {} -> {} bytes ({} refactors, {} trampoline bytes, {} mapped bytes)",
            output.display(),
            stats.input_size,
            stats.output_size,
            stats.refactors,
            stats.physical_bytes,
            stats.virtual_bytes
        );
    }
    Ok(())
}
