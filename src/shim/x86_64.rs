// x86_64.rs: Machine code emitter for the loader blob (x86-64)
//
// Register plan, fixed for the blob's whole lifetime:
//   r12 = argc     r13 = argv      r14 = config*
//   r15 = slide (config* minus the recorded loader base; zero unless the
//         binary was loaded at a non-default base)
//   rbx = file descriptor of /proc/self/exe, later the init-table cursor
//   rbp = record cursor, later the saved stack pointer
//
// Linux x86-64 syscall ABI:
//   rax = syscall number
//   rdi, rsi, rdx, r10, r8, r9 = arguments
//   syscall clobbers rcx and r11, preserves everything else
//
// The stack is restored exactly before the final jump, so the original
// entry point sees the process stack the kernel built (executables) or
// the caller's frame (DT_INIT in shared objects).

use crate::loader::{CFG_BASE, CFG_ENTRY, CFG_INITS, CFG_MAPS, CFG_NUM_INITS, CFG_NUM_MAPS};

// Syscall numbers
const SYS_WRITE: u8 = 1;
const SYS_OPEN: u8 = 2;
const SYS_CLOSE: u8 = 3;
const SYS_MMAP: u8 = 9;
const SYS_EXIT: u8 = 60;

/// MAP_PRIVATE | MAP_FIXED: records name exact addresses.
const MMAP_FLAGS: u32 = 0x12;

const MSG_FAIL: &[u8] = b"loader: startup failed\n";
const PATH_SELF: &[u8] = b"/proc/self/exe\0";

/// Label index for forward/backward references.
#[derive(Clone, Copy)]
struct Label(usize);

struct Fixup {
    offset: usize,   // byte offset in code[] to patch
    label: usize,    // target label index
    insn_end: usize, // byte offset of instruction end (for rel calculation)
    size: u8,        // 1 = rel8, 4 = rel32
}

struct Asm {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
}

impl Asm {
    fn new() -> Self {
        Self {
            code: Vec::with_capacity(512),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    fn pos(&self) -> usize {
        self.code.len()
    }

    fn emit(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    fn label(&mut self) -> Label {
        let idx = self.labels.len();
        self.labels.push(None);
        Label(idx)
    }

    fn bind(&mut self, label: Label) {
        assert!(self.labels[label.0].is_none(), "label already bound");
        self.labels[label.0] = Some(self.pos());
    }

    /// Emit a 1-byte relative jump with condition.
    /// Opcodes: js=0x78, jz=0x74, jae=0x73
    fn jcc_short(&mut self, opcode: u8, target: Label) {
        self.code.push(opcode);
        let offset = self.pos();
        self.code.push(0);
        self.fixups.push(Fixup {
            offset,
            label: target.0,
            insn_end: self.pos(),
            size: 1,
        });
    }

    /// Emit a 4-byte relative jump with condition (0F 8x rel32); the
    /// opcode is the short form, the near form is derived.
    fn jcc_near(&mut self, short_opcode: u8, target: Label) {
        self.emit(&[0x0F, short_opcode + 0x10]);
        let offset = self.pos();
        self.emit(&[0; 4]);
        self.fixups.push(Fixup {
            offset,
            label: target.0,
            insn_end: self.pos(),
            size: 4,
        });
    }

    /// Emit jmp rel32 (0xE9).
    fn jmp_near(&mut self, target: Label) {
        self.code.push(0xE9);
        let offset = self.pos();
        self.emit(&[0; 4]);
        self.fixups.push(Fixup {
            offset,
            label: target.0,
            insn_end: self.pos(),
            size: 4,
        });
    }

    /// Emit `lea <reg>, [rip + disp32]` referencing a label. The ModRM
    /// byte selects the register: rdi=0x3D, rsi=0x35.
    fn lea_rip(&mut self, modrm: u8, target: Label) {
        self.emit(&[0x48, 0x8D, modrm]);
        let offset = self.pos();
        self.emit(&[0; 4]);
        self.fixups.push(Fixup {
            offset,
            label: target.0,
            insn_end: self.pos(),
            size: 4,
        });
    }

    fn data(&mut self, bytes: &[u8]) {
        self.emit(bytes);
    }

    /// Resolve all fixups and return the final machine code.
    fn finish(mut self) -> Vec<u8> {
        for fixup in &self.fixups {
            let target = self.labels[fixup.label]
                .unwrap_or_else(|| panic!("unresolved label {}", fixup.label));
            let rel = target as isize - fixup.insn_end as isize;
            match fixup.size {
                1 => {
                    assert!(
                        (-128..=127).contains(&rel),
                        "rel8 overflow: offset {} to target {} = {}",
                        fixup.insn_end,
                        target,
                        rel
                    );
                    self.code[fixup.offset] = rel as i8 as u8;
                }
                4 => {
                    let bytes = (rel as i32).to_le_bytes();
                    self.code[fixup.offset..fixup.offset + 4].copy_from_slice(&bytes);
                }
                _ => unreachable!(),
            }
        }
        self.code
    }
}

/// Emit one pass over a mapping array: walk `num_maps[k]` records at
/// `config + maps[k]` and mmap each one from the open file.
fn emit_map_pass(a: &mut Asm, k: usize, fail: Label) {
    let map_loop = a.label();
    let map_abs = a.label();
    let map_done = a.label();

    // mov ebp, [r14 + maps[k]]   ; record cursor (relative)
    a.emit(&[0x41, 0x8B, 0x6E, (CFG_MAPS + 4 * k) as u8]);
    // add rbp, r14               ; cursor = config + maps[k]
    a.emit(&[0x4C, 0x01, 0xF5]);
    // mov eax, [r14 + num_maps[k]]
    a.emit(&[0x41, 0x8B, 0x46, (CFG_NUM_MAPS + 4 * k) as u8]);
    // lea rax, [rax + rax*2]     ; count * 3
    a.emit(&[0x48, 0x8D, 0x04, 0x40]);
    // shl rax, 2                 ; * 4 = count * record size (12)
    a.emit(&[0x48, 0xC1, 0xE0, 0x02]);
    // add rax, rbp               ; end of the array
    a.emit(&[0x48, 0x01, 0xE8]);
    // push rax
    a.emit(&[0x50]);

    a.bind(map_loop);
    // cmp rbp, [rsp]
    a.emit(&[0x48, 0x3B, 0x2C, 0x24]);
    // jae map_done
    a.jcc_near(0x73, map_done);

    // movsxd rdi, dword [rbp]    ; base in pages, sign-extended
    a.emit(&[0x48, 0x63, 0x7D, 0x00]);
    // shl rdi, 12
    a.emit(&[0x48, 0xC1, 0xE7, 0x0C]);
    // mov edx, [rbp+8]           ; size | flags word
    a.emit(&[0x8B, 0x55, 0x08]);
    // test edx, edx              ; bit 31 = absolute
    a.emit(&[0x85, 0xD2]);
    // js map_abs                 ; absolute: no slide
    a.jcc_short(0x78, map_abs);
    // add rdi, r15
    a.emit(&[0x4C, 0x01, 0xFF]);
    a.bind(map_abs);
    // mov esi, edx
    a.emit(&[0x89, 0xD6]);
    // and esi, 0xFFFFF           ; size in pages
    a.emit(&[0x81, 0xE6]);
    a.emit(&0x000F_FFFFu32.to_le_bytes());
    // shl rsi, 12
    a.emit(&[0x48, 0xC1, 0xE6, 0x0C]);
    // shr edx, 28
    a.emit(&[0xC1, 0xEA, 0x1C]);
    // and edx, 7                 ; r/w/x bits line up with PROT_*
    a.emit(&[0x83, 0xE2, 0x07]);
    // mov r9d, [rbp+4]           ; file offset in pages
    a.emit(&[0x44, 0x8B, 0x4D, 0x04]);
    // shl r9, 12
    a.emit(&[0x49, 0xC1, 0xE1, 0x0C]);
    // mov r10d, MAP_PRIVATE|MAP_FIXED
    a.emit(&[0x41, 0xBA]);
    a.emit(&MMAP_FLAGS.to_le_bytes());
    // mov r8d, ebx               ; fd
    a.emit(&[0x41, 0x89, 0xD8]);
    // mov eax, SYS_MMAP
    a.emit(&[0xB8]);
    a.emit(&(SYS_MMAP as u32).to_le_bytes());
    // syscall
    a.emit(&[0x0F, 0x05]);
    // test rax, rax
    a.emit(&[0x48, 0x85, 0xC0]);
    // js fail
    a.jcc_near(0x78, fail);
    // add rbp, 12
    a.emit(&[0x48, 0x83, 0xC5, 0x0C]);
    a.jmp_near(map_loop);

    a.bind(map_done);
    // pop rax
    a.emit(&[0x58]);
}

/// Generate the complete x86-64 loader blob.
pub fn generate() -> Vec<u8> {
    let mut a = Asm::new();

    let fail = a.label();
    let lbl_path = a.label();
    let lbl_msg = a.label();
    let init_loop = a.label();
    let init_done = a.label();
    let have_envp = a.label();

    // ========== prologue ==========
    // push rbx; push rbp; push r12..r15
    a.emit(&[0x53, 0x55, 0x41, 0x54, 0x41, 0x55, 0x41, 0x56, 0x41, 0x57]);
    // mov r12, rdi               ; argc
    a.emit(&[0x49, 0x89, 0xFC]);
    // mov r13, rsi               ; argv
    a.emit(&[0x49, 0x89, 0xF5]);
    // mov r14, rdx               ; config
    a.emit(&[0x49, 0x89, 0xD6]);
    // slide = actual config address - recorded loader base
    // mov r15, r14
    a.emit(&[0x4D, 0x89, 0xF7]);
    // sub r15, [r14 + base]
    a.emit(&[0x4D, 0x2B, 0x7E, CFG_BASE as u8]);

    // ========== open("/proc/self/exe", O_RDONLY) ==========
    a.lea_rip(0x3D, lbl_path); // lea rdi, [rip+path]
    // xor esi, esi
    a.emit(&[0x31, 0xF6]);
    // xor edx, edx
    a.emit(&[0x31, 0xD2]);
    // mov eax, SYS_OPEN
    a.emit(&[0xB8]);
    a.emit(&(SYS_OPEN as u32).to_le_bytes());
    // syscall
    a.emit(&[0x0F, 0x05]);
    // test rax, rax
    a.emit(&[0x48, 0x85, 0xC0]);
    // js fail
    a.jcc_near(0x78, fail);
    // mov rbx, rax               ; fd
    a.emit(&[0x48, 0x89, 0xC3]);

    // ========== install both mapping arrays ==========
    emit_map_pass(&mut a, 0, fail);
    emit_map_pass(&mut a, 1, fail);

    // ========== close(fd) ==========
    // mov rdi, rbx
    a.emit(&[0x48, 0x89, 0xDF]);
    // mov eax, SYS_CLOSE
    a.emit(&[0xB8]);
    a.emit(&(SYS_CLOSE as u32).to_le_bytes());
    // syscall
    a.emit(&[0x0F, 0x05]);

    // ========== run init functions ==========
    // The init calls need a 16-byte aligned stack; the entry alignment
    // differs between process start and DT_INIT, so align dynamically
    // and keep the original rsp in rbp.
    // mov rbp, rsp
    a.emit(&[0x48, 0x89, 0xE5]);
    // and rsp, -16
    a.emit(&[0x48, 0x83, 0xE4, 0xF0]);
    // mov ebx, [r14 + inits]
    a.emit(&[0x41, 0x8B, 0x5E, CFG_INITS as u8]);
    // add rbx, r14               ; init cursor
    a.emit(&[0x4C, 0x01, 0xF3]);
    // mov eax, [r14 + num_inits]
    a.emit(&[0x41, 0x8B, 0x46, CFG_NUM_INITS as u8]);
    // shl rax, 3
    a.emit(&[0x48, 0xC1, 0xE0, 0x03]);
    // add rax, rbx               ; end of the table
    a.emit(&[0x48, 0x01, 0xD8]);
    // push rax; push rax         ; twice: keeps the stack 16-aligned
    a.emit(&[0x50, 0x50]);

    a.bind(init_loop);
    // cmp rbx, [rsp]
    a.emit(&[0x48, 0x3B, 0x1C, 0x24]);
    // jae init_done
    a.jcc_near(0x73, init_done);
    // mov rax, [rbx]             ; init address
    a.emit(&[0x48, 0x8B, 0x03]);
    // add rax, r15               ; + slide
    a.emit(&[0x4C, 0x01, 0xF8]);
    // mov rdi, r12               ; argc
    a.emit(&[0x4C, 0x89, 0xE7]);
    // mov rsi, r13               ; argv
    a.emit(&[0x4C, 0x89, 0xEE]);
    // envp = argv + 8 * (argc + 1), or 0 when argv is 0 (DSO mode)
    // xor edx, edx
    a.emit(&[0x31, 0xD2]);
    // test r13, r13
    a.emit(&[0x4D, 0x85, 0xED]);
    // jz have_envp
    a.jcc_short(0x74, have_envp);
    // lea rdx, [r13 + r12*8 + 8]
    a.emit(&[0x4B, 0x8D, 0x54, 0xE5, 0x08]);
    a.bind(have_envp);
    // call rax
    a.emit(&[0xFF, 0xD0]);
    // add rbx, 8
    a.emit(&[0x48, 0x83, 0xC3, 0x08]);
    a.jmp_near(init_loop);

    a.bind(init_done);
    // mov rsp, rbp               ; discard table end, undo alignment
    a.emit(&[0x48, 0x89, 0xEC]);

    // ========== jump to the original entry ==========
    // mov rax, [r14 + entry]
    a.emit(&[0x49, 0x8B, 0x46, CFG_ENTRY as u8]);
    // add rax, r15
    a.emit(&[0x4C, 0x01, 0xF8]);
    // pop r15..r12; pop rbp; pop rbx
    a.emit(&[0x41, 0x5F, 0x41, 0x5E, 0x41, 0x5D, 0x41, 0x5C, 0x5D, 0x5B]);
    // xor edx, edx               ; no atexit hook from the loader
    a.emit(&[0x31, 0xD2]);
    // jmp rax
    a.emit(&[0xFF, 0xE0]);

    // ========== fail: write(2, msg, len); exit(127) ==========
    a.bind(fail);
    a.lea_rip(0x35, lbl_msg); // lea rsi, [rip+msg]
    // mov edx, len
    a.emit(&[0xBA]);
    a.emit(&(MSG_FAIL.len() as u32).to_le_bytes());
    // mov edi, 2
    a.emit(&[0xBF]);
    a.emit(&2u32.to_le_bytes());
    // mov eax, SYS_WRITE
    a.emit(&[0xB8]);
    a.emit(&(SYS_WRITE as u32).to_le_bytes());
    // syscall
    a.emit(&[0x0F, 0x05]);
    // mov eax, SYS_EXIT
    a.emit(&[0xB8]);
    a.emit(&(SYS_EXIT as u32).to_le_bytes());
    // mov edi, 127
    a.emit(&[0xBF]);
    a.emit(&127u32.to_le_bytes());
    // syscall
    a.emit(&[0x0F, 0x05]);

    // ========== data ==========
    a.bind(lbl_path);
    a.data(PATH_SELF);
    a.bind(lbl_msg);
    a.data(MSG_FAIL);

    a.finish()
}
