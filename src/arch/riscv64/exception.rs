use core::arch::global_asm;

use riscv::register::{scause, stval};

use crate::arch::{ContextFrame, ContextFrameTrait};

// scause interrupt codes
const IRQ_S_TIMER: usize = 5;
const IRQ_S_EXTERNAL: usize = 9;

// scause exception codes
const EXC_ECALL_UMODE: usize = 8;
const EXC_INSTR_PAGE_FAULT: usize = 12;
const EXC_LOAD_PAGE_FAULT: usize = 13;
const EXC_STORE_PAGE_FAULT: usize = 15;

// Trap save/restore. Two vectors: `_strap_entry` is installed while the hart
// runs kernel code and pushes the frame onto the interrupted stack;
// `_utrap_entry` is installed while user code runs and switches to the
// thread's kernel stack through the sscratch anchor first. The frame layout
// is `ContextFrame` (x0 slot kept for regular offsets, sstatus at 256,
// sepc at 264, 272 bytes total).
global_asm!(
    r#"
.align 2
.global _strap_entry
_strap_entry:
    addi    sp, sp, -272
    sd      x1, 8(sp)
    addi    x1, sp, 272
    sd      x1, 16(sp)
    sd      x3, 24(sp)
    sd      x4, 32(sp)
    sd      x5, 40(sp)
    sd      x6, 48(sp)
    sd      x7, 56(sp)
    sd      x8, 64(sp)
    sd      x9, 72(sp)
    sd      x10, 80(sp)
    sd      x11, 88(sp)
    sd      x12, 96(sp)
    sd      x13, 104(sp)
    sd      x14, 112(sp)
    sd      x15, 120(sp)
    sd      x16, 128(sp)
    sd      x17, 136(sp)
    sd      x18, 144(sp)
    sd      x19, 152(sp)
    sd      x20, 160(sp)
    sd      x21, 168(sp)
    sd      x22, 176(sp)
    sd      x23, 184(sp)
    sd      x24, 192(sp)
    sd      x25, 200(sp)
    sd      x26, 208(sp)
    sd      x27, 216(sp)
    sd      x28, 224(sp)
    sd      x29, 232(sp)
    sd      x30, 240(sp)
    sd      x31, 248(sp)
    csrr    t0, sstatus
    sd      t0, 256(sp)
    csrr    t0, sepc
    sd      t0, 264(sp)
    mv      a0, sp
    call    trap_handler
    ld      t0, 256(sp)
    csrw    sstatus, t0
    ld      t0, 264(sp)
    csrw    sepc, t0
    ld      x1, 8(sp)
    ld      x3, 24(sp)
    ld      x4, 32(sp)
    ld      x5, 40(sp)
    ld      x6, 48(sp)
    ld      x7, 56(sp)
    ld      x8, 64(sp)
    ld      x9, 72(sp)
    ld      x10, 80(sp)
    ld      x11, 88(sp)
    ld      x12, 96(sp)
    ld      x13, 104(sp)
    ld      x14, 112(sp)
    ld      x15, 120(sp)
    ld      x16, 128(sp)
    ld      x17, 136(sp)
    ld      x18, 144(sp)
    ld      x19, 152(sp)
    ld      x20, 160(sp)
    ld      x21, 168(sp)
    ld      x22, 176(sp)
    ld      x23, 184(sp)
    ld      x24, 192(sp)
    ld      x25, 200(sp)
    ld      x26, 208(sp)
    ld      x27, 216(sp)
    ld      x28, 224(sp)
    ld      x29, 232(sp)
    ld      x30, 240(sp)
    ld      x31, 248(sp)
    ld      x2, 16(sp)
    sret

.align 2
.global _utrap_entry
_utrap_entry:
    csrrw   sp, sscratch, sp
    addi    sp, sp, -272
    sd      x1, 8(sp)
    sd      x3, 24(sp)
    sd      x4, 32(sp)
    sd      x5, 40(sp)
    sd      x6, 48(sp)
    sd      x7, 56(sp)
    sd      x8, 64(sp)
    sd      x9, 72(sp)
    sd      x10, 80(sp)
    sd      x11, 88(sp)
    sd      x12, 96(sp)
    sd      x13, 104(sp)
    sd      x14, 112(sp)
    sd      x15, 120(sp)
    sd      x16, 128(sp)
    sd      x17, 136(sp)
    sd      x18, 144(sp)
    sd      x19, 152(sp)
    sd      x20, 160(sp)
    sd      x21, 168(sp)
    sd      x22, 176(sp)
    sd      x23, 184(sp)
    sd      x24, 192(sp)
    sd      x25, 200(sp)
    sd      x26, 208(sp)
    sd      x27, 216(sp)
    sd      x28, 224(sp)
    sd      x29, 232(sp)
    sd      x30, 240(sp)
    sd      x31, 248(sp)
    csrr    t0, sscratch
    sd      t0, 16(sp)
    addi    t0, sp, 272
    csrw    sscratch, t0
    csrr    t0, sstatus
    sd      t0, 256(sp)
    csrr    t0, sepc
    sd      t0, 264(sp)
    la      t0, _strap_entry
    csrw    stvec, t0
.option push
.option norelax
    la      gp, __global_pointer$
.option pop
    mv      a0, sp
    call    trap_handler
    mv      a0, sp
    j       _trap_frame_restore

.align 2
.global _trap_frame_restore
_trap_frame_restore:
    mv      sp, a0
    la      t0, _utrap_entry
    csrw    stvec, t0
    addi    t0, sp, 272
    csrw    sscratch, t0
    ld      t0, 256(sp)
    csrw    sstatus, t0
    ld      t0, 264(sp)
    csrw    sepc, t0
    ld      x1, 8(sp)
    ld      x3, 24(sp)
    ld      x4, 32(sp)
    ld      x5, 40(sp)
    ld      x6, 48(sp)
    ld      x7, 56(sp)
    ld      x8, 64(sp)
    ld      x9, 72(sp)
    ld      x10, 80(sp)
    ld      x11, 88(sp)
    ld      x12, 96(sp)
    ld      x13, 104(sp)
    ld      x14, 112(sp)
    ld      x15, 120(sp)
    ld      x16, 128(sp)
    ld      x17, 136(sp)
    ld      x18, 144(sp)
    ld      x19, 152(sp)
    ld      x20, 160(sp)
    ld      x21, 168(sp)
    ld      x22, 176(sp)
    ld      x23, 184(sp)
    ld      x24, 192(sp)
    ld      x25, 200(sp)
    ld      x26, 208(sp)
    ld      x27, 216(sp)
    ld      x28, 224(sp)
    ld      x29, 232(sp)
    ld      x30, 240(sp)
    ld      x31, 248(sp)
    ld      x2, 16(sp)
    sret
"#
);

/// Enter user mode through the trap-exit path. `ctx` must sit at the top of
/// the calling thread's kernel stack, just below the stack anchor.
pub unsafe fn trap_frame_restore(ctx: *mut ContextFrame) -> ! {
    extern "C" {
        fn _trap_frame_restore(ctx: *mut ContextFrame) -> !;
    }
    _trap_frame_restore(ctx)
}

#[no_mangle]
extern "C" fn trap_handler(ctx: *mut ContextFrame) {
    let cause = scause::read();
    let ctx = unsafe { &mut *ctx };
    if cause.is_interrupt() {
        match cause.code() {
            IRQ_S_TIMER => crate::kernel::timer_isr(),
            IRQ_S_EXTERNAL => crate::driver::external_isr(),
            code => panic!("trap_handler: unexpected interrupt {}", code),
        }
    } else {
        match cause.code() {
            EXC_ECALL_UMODE => {
                // step over the ecall before dispatch so a re-entry cannot
                // repeat the call
                ctx.set_exception_pc(ctx.exception_pc() + 4);
                crate::kernel::syscall_handler(ctx);
            }
            EXC_INSTR_PAGE_FAULT | EXC_LOAD_PAGE_FAULT | EXC_STORE_PAGE_FAULT => {
                let vma = stval::read();
                if ctx.from_supervisor() {
                    panic!(
                        "kernel page fault at {:#x}, sepc {:#x}\n{}",
                        vma,
                        ctx.exception_pc(),
                        ctx
                    );
                }
                if crate::mm::handle_umode_page_fault(vma).is_err() {
                    error!(
                        "unhandled user page fault at {:#x}, sepc {:#x}",
                        vma,
                        ctx.exception_pc()
                    );
                    crate::kernel::process_exit();
                }
            }
            code => panic!(
                "trap_handler: unhandled exception {} stval {:#x} sepc {:#x}\n{}",
                code,
                stval::read(),
                ctx.exception_pc(),
                ctx
            ),
        }
    }
}
