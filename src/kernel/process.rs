//! Processes: a bounded table of records tying a thread to an address space
//! and a file-descriptor table. Exec rebuilds the active space in place,
//! fork clones it into a freshly spawned kernel thread that restores the
//! parent's trap frame with a zero return value.

use alloc::boxed::Box;
use alloc::string::String;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::{self, Arch, ArchTrait, ContextFrame, ContextFrameTrait, PAGE_SIZE};
use crate::io::IoRef;
use crate::kernel::sync::Condition;
use crate::kernel::thread::{
    self, current_proc_idx, current_tid, set_current_proc_idx, thread_trap_frame,
};
use crate::kernel::{elf, KernelError, KernelResult};
use crate::mm::{
    alloc_zeroed_page, clone_active_mspace, discard_active_mspace, free_page, main_mspace,
    map_page, reset_active_mspace, switch_mspace, PteFlags, UMEM_END_VMA,
};
use crate::util::round_up;

pub const NPROC: usize = 16;
pub const PROCESS_IOMAX: usize = 16;

pub struct Process {
    pub idx: usize,
    pub tid: usize,
    pub mtag: usize,
    pub iotab: [Option<IoRef>; PROCESS_IOMAX],
}

static mut PROCTAB: [*mut Process; NPROC] = [ptr::null_mut(); NPROC];

fn proctab() -> &'static mut [*mut Process; NPROC] {
    unsafe { &mut *ptr::addr_of_mut!(PROCTAB) }
}

/// The boot thread becomes process 0 over the main address space.
pub fn process_init() {
    let proc = Box::into_raw(Box::new(Process {
        idx: 0,
        tid: current_tid(),
        mtag: main_mspace(),
        iotab: core::array::from_fn(|_| None),
    }));
    let prev = Arch::interrupt_disable();
    assert!(proctab()[0].is_null(), "process_init: proctab not empty");
    proctab()[0] = proc;
    Arch::interrupt_restore(prev);
    set_current_proc_idx(Some(0));
}

pub fn current_process() -> KernelResult<&'static mut Process> {
    let idx = current_proc_idx().ok_or(KernelError::NotSupported)?;
    let proc = proctab()[idx];
    if proc.is_null() {
        panic!("current_process: stale process index {}", idx);
    }
    Ok(unsafe { &mut *proc })
}

/// Replace the current image with the executable in `exe`. Only returns on
/// failure; caveat: once the old space is torn down a load error leaves the
/// process without an image.
pub fn process_exec(exe: IoRef, argv: &[String]) -> KernelResult<()> {
    elf::elf_precheck(&exe)?;

    // argument page: the argv vector, then the packed strings, image
    // rounded to 16 bytes at the top of the user stack page
    let argc = argv.len();
    let vec_bytes = (argc + 1) * core::mem::size_of::<u64>();
    let str_bytes: usize = argv.iter().map(|arg| arg.len() + 1).sum();
    let stksz = round_up(vec_bytes + str_bytes, 16);
    if stksz > PAGE_SIZE {
        return Err(KernelError::InvalidArg);
    }

    let arg_page = alloc_zeroed_page()?;
    let stack_page_va = UMEM_END_VMA - PAGE_SIZE;
    let sp_va = UMEM_END_VMA - stksz;
    let base_off = PAGE_SIZE - stksz;
    unsafe {
        let page = arg_page as *mut u8;
        let vector = page.add(base_off) as *mut u64;
        let mut str_off = base_off + vec_bytes;
        for (i, arg) in argv.iter().enumerate() {
            vector.add(i).write_unaligned((stack_page_va + str_off) as u64);
            ptr::copy_nonoverlapping(arg.as_ptr(), page.add(str_off), arg.len());
            // terminator already zero
            str_off += arg.len() + 1;
        }
        // vector[argc] stays null
    }

    reset_active_mspace();
    let entry = match elf::elf_load(&exe) {
        Ok(entry) => entry,
        Err(err) => {
            free_page(arg_page);
            return Err(err);
        }
    };
    if let Err(err) = map_page(stack_page_va, arg_page, PteFlags::RW | PteFlags::USER) {
        free_page(arg_page);
        return Err(err);
    }

    let frame = thread_trap_frame(current_tid());
    unsafe {
        *frame = ContextFrame::new_user(entry, sp_va);
        (*frame).set_gpr(10, argc); // a0
        (*frame).set_gpr(11, sp_va); // a1 = argv
        arch::trap_frame_restore(frame)
    }
}

struct ForkSync {
    installed: AtomicBool,
    cond: Condition,
}

/// Fork the current process: clone the space, duplicate the fd table, spawn
/// a kernel thread that installs the clone and resumes from a copy of
/// `tfr` with a 0 return value. The parent blocks until the child's space
/// is installed, then returns the child's thread id.
pub fn process_fork(tfr: &ContextFrame) -> KernelResult<usize> {
    let parent = current_process()?;

    let prev = Arch::interrupt_disable();
    let idx = match (0..NPROC).find(|&idx| proctab()[idx].is_null()) {
        Some(idx) => idx,
        None => {
            Arch::interrupt_restore(prev);
            return Err(KernelError::OutOfThreads);
        }
    };
    // reserve while the spawn completes
    proctab()[idx] = ptr::NonNull::dangling().as_ptr();
    Arch::interrupt_restore(prev);

    let mtag = clone_active_mspace();
    let proc = Box::into_raw(Box::new(Process {
        idx,
        tid: 0,
        mtag,
        iotab: core::array::from_fn(|fd| parent.iotab[fd].clone()),
    }));

    let sync = ForkSync {
        installed: AtomicBool::new(false),
        cond: Condition::new("fork.installed"),
    };
    let tid = match thread::thread_spawn(
        "forked",
        fork_child_entry as usize,
        &[
            proc as usize,
            tfr as *const ContextFrame as usize,
            &sync as *const ForkSync as usize,
        ],
    ) {
        Ok(tid) => tid,
        Err(err) => {
            unsafe { drop(Box::from_raw(proc)) };
            let prev = Arch::interrupt_disable();
            proctab()[idx] = ptr::null_mut();
            Arch::interrupt_restore(prev);
            return Err(err);
        }
    };
    unsafe {
        (*proc).tid = tid;
        let prev = Arch::interrupt_disable();
        proctab()[idx] = proc;
        // the child owns the clone once it has switched onto it
        while !sync.installed.load(Ordering::Acquire) {
            sync.cond.wait_raw();
        }
        Arch::interrupt_restore(prev);
    }
    Ok(tid)
}

extern "C" fn fork_child_entry(proc: usize, parent_frame: usize, sync: usize) {
    let proc = proc as *mut Process;
    unsafe {
        switch_mspace((*proc).mtag);
        set_current_proc_idx(Some((*proc).idx));

        let frame = thread_trap_frame(current_tid());
        *frame = *(parent_frame as *const ContextFrame);
        (*frame).set_syscall_ret(0);

        let sync = &*(sync as *const ForkSync);
        sync.installed.store(true, Ordering::Release);
        sync.cond.broadcast();

        arch::trap_frame_restore(frame)
    }
}

/// Tear the current process down and exit its thread. The first process
/// going away is fatal.
pub fn process_exit() -> ! {
    match current_proc_idx() {
        Some(0) => panic!("process_exit: init process exited"),
        Some(idx) => {
            discard_active_mspace();
            let prev = Arch::interrupt_disable();
            let proc = proctab()[idx];
            proctab()[idx] = ptr::null_mut();
            Arch::interrupt_restore(prev);
            assert!(!proc.is_null(), "process_exit: empty slot {}", idx);
            // dropping the record closes every open descriptor
            unsafe { drop(Box::from_raw(proc)) };
            set_current_proc_idx(None);
        }
        None => {}
    }
    thread::thread_exit()
}
