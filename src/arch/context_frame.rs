use core::fmt::Formatter;

use super::ContextFrameTrait;

/// Supervisor trap frame. The layout is shared with the trap entry/exit
/// assembly; the x0 slot is kept so the save offsets stay regular.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct ContextFrame {
    gpr: [u64; 32],
    sstatus: u64,
    sepc: u64,
}

const_assert_eq!(core::mem::size_of::<ContextFrame>(), 272);

// Register indices of the RISC-V integer ABI.
const REG_SP: usize = 2;
const REG_A0: usize = 10;
const REG_A7: usize = 17;

// sstatus bits the frame cares about: previous privilege, previous
// interrupt enable, supervisor access to user pages, FPU state.
const SSTATUS_SPP: u64 = 1 << 8;
const SSTATUS_SPIE: u64 = 1 << 5;
const SSTATUS_SUM: u64 = 1 << 18;
const SSTATUS_FS_INITIAL: u64 = 1 << 13;

impl core::fmt::Display for ContextFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), core::fmt::Error> {
        for i in 0..32 {
            write!(f, "x{:02}: {:016x}   ", i, self.gpr[i])?;
            if (i + 1) % 2 == 0 {
                writeln!(f)?;
            }
        }
        writeln!(f, "sstatus: {:016x}", self.sstatus)?;
        writeln!(f, "sepc:    {:016x}", self.sepc)?;
        Ok(())
    }
}

impl ContextFrameTrait for ContextFrame {
    fn new_user(entry: usize, sp: usize) -> Self {
        let mut r = ContextFrame {
            gpr: [0; 32],
            // SPP = user, interrupts on after sret; SUM must survive the
            // round trip or the next syscall cannot reach its arguments
            sstatus: SSTATUS_SPIE | SSTATUS_SUM | SSTATUS_FS_INITIAL,
            sepc: entry as u64,
        };
        r.set_stack_pointer(sp);
        r
    }

    fn exception_pc(&self) -> usize {
        self.sepc as usize
    }

    fn set_exception_pc(&mut self, pc: usize) {
        self.sepc = pc as u64;
    }

    fn stack_pointer(&self) -> usize {
        self.gpr[REG_SP] as usize
    }

    fn set_stack_pointer(&mut self, sp: usize) {
        self.gpr[REG_SP] = sp as u64;
    }

    fn gpr(&self, index: usize) -> usize {
        self.gpr[index] as usize
    }

    fn set_gpr(&mut self, index: usize, val: usize) {
        if index != 0 {
            self.gpr[index] = val as u64;
        }
    }

    fn syscall_number(&self) -> usize {
        self.gpr[REG_A7] as usize
    }

    fn syscall_arg(&self, index: usize) -> usize {
        debug_assert!(index < 7);
        self.gpr[REG_A0 + index] as usize
    }

    fn set_syscall_ret(&mut self, val: usize) {
        self.gpr[REG_A0] = val as u64;
    }
}

impl ContextFrame {
    pub fn from_supervisor(&self) -> bool {
        self.sstatus & SSTATUS_SPP != 0
    }
}

/// Callee-saved context of a suspended kernel thread; swapped by
/// `thread_context_switch`.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct ThreadContext {
    pub ra: usize,
    pub sp: usize,
    pub s: [usize; 12],
}

const_assert_eq!(core::mem::size_of::<ThreadContext>(), 112);

impl ThreadContext {
    pub const fn zero() -> Self {
        ThreadContext {
            ra: 0,
            sp: 0,
            s: [0; 12],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The trap and switch assembly hard-code these offsets.
    #[test]
    fn frame_layout_matches_asm() {
        assert_eq!(offset_of!(ContextFrame, gpr), 0);
        assert_eq!(offset_of!(ContextFrame, sstatus), 256);
        assert_eq!(offset_of!(ContextFrame, sepc), 264);
        assert_eq!(offset_of!(ThreadContext, ra), 0);
        assert_eq!(offset_of!(ThreadContext, sp), 8);
        assert_eq!(offset_of!(ThreadContext, s), 16);
    }

    #[test]
    fn user_frame_starts_unprivileged() {
        let f = ContextFrame::new_user(0xc000_0000, 0xffff_f000);
        assert!(!f.from_supervisor());
        assert_eq!(f.exception_pc(), 0xc000_0000);
        assert_eq!(f.stack_pointer(), 0xffff_f000);
    }
}
