use core::arch::global_asm;

use crate::arch::ThreadContext;

// Callee-saved switch: ra at 0, sp at 8, s0..s11 at 16..104, matching
// `ThreadContext`. `_thread_startup` is the universal first frame of a
// spawned thread: the spawner parks the entry point in s0 and up to eight
// arguments in s1..s8; interrupts come back on before the entry runs, and a
// returning entry falls through into thread exit.
global_asm!(
    r#"
.global _thread_swtch
_thread_swtch:
    sd      ra, 0(a0)
    sd      sp, 8(a0)
    sd      s0, 16(a0)
    sd      s1, 24(a0)
    sd      s2, 32(a0)
    sd      s3, 40(a0)
    sd      s4, 48(a0)
    sd      s5, 56(a0)
    sd      s6, 64(a0)
    sd      s7, 72(a0)
    sd      s8, 80(a0)
    sd      s9, 88(a0)
    sd      s10, 96(a0)
    sd      s11, 104(a0)
    ld      ra, 0(a1)
    ld      sp, 8(a1)
    ld      s0, 16(a1)
    ld      s1, 24(a1)
    ld      s2, 32(a1)
    ld      s3, 40(a1)
    ld      s4, 48(a1)
    ld      s5, 56(a1)
    ld      s6, 64(a1)
    ld      s7, 72(a1)
    ld      s8, 80(a1)
    ld      s9, 88(a1)
    ld      s10, 96(a1)
    ld      s11, 104(a1)
    ret

.global _thread_startup
_thread_startup:
    csrsi   sstatus, 2
    mv      a0, s1
    mv      a1, s2
    mv      a2, s3
    mv      a3, s4
    mv      a4, s5
    mv      a5, s6
    mv      a6, s7
    mv      a7, s8
    jalr    s0
    call    thread_entry_returned
"#
);

pub unsafe fn thread_context_switch(old: *mut ThreadContext, new: *mut ThreadContext) {
    extern "C" {
        fn _thread_swtch(old: *mut ThreadContext, new: *mut ThreadContext);
    }
    _thread_swtch(old, new)
}

pub fn thread_startup_pc() -> usize {
    extern "C" {
        fn _thread_startup();
    }
    _thread_startup as usize
}
