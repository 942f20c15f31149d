// shim: generates the freestanding loader blob appended to patched binaries.
//
// The blob is raw position-independent x86-64 machine code with no libc
// dependency; it talks to the kernel through raw syscalls. The entry shim
// emitted by the injector hands it (argc, argv, config*) in the SysV ABI;
// it opens /proc/self/exe, maps both record arrays from the file, runs the
// init functions, and jumps to the original entry point.

mod x86_64;

/// Generate the default loader blob.
///
/// The returned bytes are appended verbatim after the entry shim; they
/// assume the config record lives at the address in the third argument
/// register and that the file backing the process image contains the
/// mapping blobs at the offsets the records name.
pub fn loader_blob() -> Vec<u8> {
    x86_64::generate()
}
