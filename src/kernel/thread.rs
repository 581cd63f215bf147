//! Kernel threads: a flat table of raw records, a FIFO ready list threaded
//! through `list_next`, and cooperative switching with interrupts-off
//! critical sections. At most one thread is RUNNING; a RUNNING thread is in
//! no list.

use alloc::boxed::Box;
use core::ptr;

use crate::arch::{self, Arch, ArchTrait, ContextFrame, ThreadContext, PAGE_SIZE};
use crate::kernel::sync::Condition;
use crate::kernel::{KernelError, KernelResult};
use crate::mm::{alloc_page, free_page};

pub const NTHR: usize = 16;
pub const MAIN_TID: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ThreadState {
    #[display(fmt = "UNINIT")]
    Uninit,
    #[display(fmt = "WAITING")]
    Waiting,
    #[display(fmt = "RUNNING")]
    Running,
    #[display(fmt = "READY")]
    Ready,
    #[display(fmt = "EXITED")]
    Exited,
}

/// Sentinel at the top of every spawned thread's kernel stack: the thread's
/// own record and the kernel global pointer.
#[repr(C)]
struct StackAnchor {
    thread: *mut Thread,
    gp: usize,
}

const ANCHOR_SIZE: usize = core::mem::size_of::<StackAnchor>();

pub struct Thread {
    pub id: usize,
    pub name: &'static str,
    pub state: ThreadState,
    pub parent: usize,
    list_next: *mut Thread,
    wait_cond: *const Condition,
    /// Broadcast by exiting children of this thread.
    pub child_exit: Condition,
    kstack: usize,
    ctx: ThreadContext,
    pub proc_idx: Option<usize>,
}

/// Singly linked FIFO threaded through `list_next`. A thread sits in at most
/// one list at a time.
#[derive(Debug)]
pub(crate) struct ThreadList {
    head: *mut Thread,
    tail: *mut Thread,
}

impl ThreadList {
    pub(crate) const fn new() -> Self {
        ThreadList {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    unsafe fn push(&mut self, thread: *mut Thread) {
        (*thread).list_next = ptr::null_mut();
        if self.tail.is_null() {
            self.head = thread;
        } else {
            (*self.tail).list_next = thread;
        }
        self.tail = thread;
    }

    unsafe fn pop(&mut self) -> *mut Thread {
        let thread = self.head;
        if !thread.is_null() {
            self.head = (*thread).list_next;
            if self.head.is_null() {
                self.tail = ptr::null_mut();
            }
            (*thread).list_next = ptr::null_mut();
        }
        thread
    }

    /// Splice `other` onto this list's tail, leaving `other` empty.
    unsafe fn append(&mut self, other: &mut ThreadList) {
        if other.head.is_null() {
            return;
        }
        if self.tail.is_null() {
            self.head = other.head;
        } else {
            (*self.tail).list_next = other.head;
        }
        self.tail = other.tail;
        other.head = ptr::null_mut();
        other.tail = ptr::null_mut();
    }
}

static mut THRTAB: [*mut Thread; NTHR] = [ptr::null_mut(); NTHR];
static mut READY: ThreadList = ThreadList::new();
static mut CURRENT: *mut Thread = ptr::null_mut();
static mut IDLE: *mut Thread = ptr::null_mut();

fn thrtab() -> &'static mut [*mut Thread; NTHR] {
    unsafe { &mut *ptr::addr_of_mut!(THRTAB) }
}

fn ready_list() -> &'static mut ThreadList {
    unsafe { &mut *ptr::addr_of_mut!(READY) }
}

pub fn current_tid() -> usize {
    let cur = unsafe { CURRENT };
    if cur.is_null() {
        MAIN_TID
    } else {
        unsafe { (*cur).id }
    }
}

pub(crate) fn current_thread() -> &'static mut Thread {
    let cur = unsafe { CURRENT };
    assert!(!cur.is_null(), "current_thread: thread system not running");
    unsafe { &mut *cur }
}

pub fn current_proc_idx() -> Option<usize> {
    let cur = unsafe { CURRENT };
    if cur.is_null() {
        None
    } else {
        unsafe { (*cur).proc_idx }
    }
}

pub fn set_current_proc_idx(idx: Option<usize>) {
    current_thread().proc_idx = idx;
}

/// Trap-frame slot of a spawned thread: directly below the stack anchor.
pub fn thread_trap_frame(tid: usize) -> *mut ContextFrame {
    let thread = thrtab()[tid];
    assert!(!thread.is_null(), "thread_trap_frame: empty slot {}", tid);
    let kstack = unsafe { (*thread).kstack };
    assert_ne!(kstack, 0, "thread_trap_frame: thread {} has no stack", tid);
    (kstack + PAGE_SIZE - ANCHOR_SIZE - core::mem::size_of::<ContextFrame>()) as *mut ContextFrame
}

/// Bring up the thread system: the caller becomes the main thread and the
/// idle thread is spawned.
pub fn thread_init() {
    // the boot stack's top page doubles as the main thread's anchor and
    // trap-frame slot; _start left room for it
    let kstack = arch::boot_stack_top() - PAGE_SIZE;
    let main = Box::into_raw(Box::new(Thread {
        id: MAIN_TID,
        name: "main",
        state: ThreadState::Running,
        parent: MAIN_TID,
        list_next: ptr::null_mut(),
        wait_cond: ptr::null(),
        child_exit: Condition::new("main.child_exit"),
        kstack,
        ctx: ThreadContext::zero(),
        proc_idx: None,
    }));
    unsafe {
        (((kstack + PAGE_SIZE - ANCHOR_SIZE) as *mut StackAnchor)).write(StackAnchor {
            thread: main,
            gp: arch::global_pointer(),
        });
        THRTAB[MAIN_TID] = main;
        CURRENT = main;
    }
    Arch::set_trap_stack_anchor(0);

    let idle_tid = thread_spawn("idle", idle_thread as usize, &[]).expect("thread_init: idle");
    unsafe {
        // the idle thread is the scheduler's fallback, never queued
        let prev = Arch::interrupt_disable();
        let idle = unlink_from_ready(idle_tid);
        IDLE = idle;
        Arch::interrupt_restore(prev);
    }
    info!("thread_init: main {} idle {}", MAIN_TID, idle_tid);
}

unsafe fn unlink_from_ready(tid: usize) -> *mut Thread {
    let mut scratch = ThreadList::new();
    let mut found = ptr::null_mut();
    loop {
        let t = ready_list().pop();
        if t.is_null() {
            break;
        }
        if (*t).id == tid {
            found = t;
        } else {
            scratch.push(t);
        }
    }
    ready_list().append(&mut scratch);
    assert!(!found.is_null(), "unlink_from_ready: {} not queued", tid);
    found
}

extern "C" fn idle_thread() {
    loop {
        // The emptiness check and the wfi sit inside one interrupts-off
        // window: a wakeup between them would otherwise be lost until the
        // next interrupt.
        let prev = Arch::interrupt_disable();
        if ready_list().is_empty() {
            Arch::wait_for_interrupt();
        }
        Arch::interrupt_restore(prev);
        thread_yield();
    }
}

/// Spawn a kernel thread. `entry` is the code address the universal startup
/// trampoline tail-calls with up to eight arguments.
pub fn thread_spawn(name: &'static str, entry: usize, args: &[usize]) -> KernelResult<usize> {
    assert!(args.len() <= 8, "thread_spawn: too many arguments");

    let prev = Arch::interrupt_disable();
    let tid = match (1..NTHR).find(|&tid| thrtab()[tid].is_null()) {
        Some(tid) => tid,
        None => {
            Arch::interrupt_restore(prev);
            return Err(KernelError::OutOfThreads);
        }
    };

    let kstack = match alloc_page() {
        Ok(page) => page,
        Err(err) => {
            Arch::interrupt_restore(prev);
            return Err(err);
        }
    };
    let anchor = kstack + PAGE_SIZE - ANCHOR_SIZE;

    let mut ctx = ThreadContext::zero();
    ctx.ra = arch::thread_startup_pc();
    // keep the trap-frame slot below the anchor out of the call stack
    ctx.sp = anchor - core::mem::size_of::<ContextFrame>();
    ctx.s[0] = entry;
    ctx.s[1..1 + args.len()].copy_from_slice(args);

    let thread = Box::into_raw(Box::new(Thread {
        id: tid,
        name,
        state: ThreadState::Uninit,
        parent: current_tid(),
        list_next: ptr::null_mut(),
        wait_cond: ptr::null(),
        child_exit: Condition::new("child_exit"),
        kstack,
        ctx,
        proc_idx: None,
    }));

    unsafe {
        (anchor as *mut StackAnchor).write(StackAnchor {
            thread,
            gp: arch::global_pointer(),
        });
        (*thread).state = ThreadState::Ready;
        thrtab()[tid] = thread;
        ready_list().push(thread);
    }
    Arch::interrupt_restore(prev);
    trace!("thread_spawn: {} \"{}\" entry {:#x}", tid, name, entry);
    Ok(tid)
}

/// Pick the next runnable thread and switch to it. Interrupts must be
/// disabled; they stay disabled across the switch and the caller's eventual
/// resumption.
pub(crate) unsafe fn suspend_to_next() {
    let mut next = ready_list().pop();
    if next.is_null() {
        next = IDLE;
    }
    let cur = CURRENT;
    if next == cur {
        (*cur).state = ThreadState::Running;
        return;
    }
    (*next).state = ThreadState::Running;
    CURRENT = next;
    arch::thread_context_switch(ptr::addr_of_mut!((*cur).ctx), ptr::addr_of_mut!((*next).ctx));
}

/// Put the caller at the ready-list tail and run someone else.
pub fn thread_yield() {
    let prev = Arch::interrupt_disable();
    unsafe {
        let cur = CURRENT;
        if cur.is_null() {
            Arch::interrupt_restore(prev);
            return;
        }
        if !ready_list().is_empty() {
            (*cur).state = ThreadState::Ready;
            if cur != IDLE {
                ready_list().push(cur);
            }
            suspend_to_next();
        }
    }
    Arch::interrupt_restore(prev);
}

/// Park the caller on `cond`'s wait list and run someone else. Interrupts
/// must be disabled; `wait_list` belongs to `cond`.
pub(crate) unsafe fn wait_current_on(wait_list: &mut ThreadList, cond: *const Condition) {
    let cur = CURRENT;
    assert!(!cur.is_null(), "wait_current_on: thread system not running");
    assert_eq!((*cur).state, ThreadState::Running);
    (*cur).state = ThreadState::Waiting;
    (*cur).wait_cond = cond;
    wait_list.push(cur);
    suspend_to_next();
}

/// Move every waiter to the ready-list tail in FIFO order, clearing its
/// wait condition. Interrupts must be disabled.
pub(crate) unsafe fn make_ready_all(wait_list: &mut ThreadList) {
    let mut t = wait_list.head;
    while !t.is_null() {
        (*t).wait_cond = ptr::null();
        (*t).state = ThreadState::Ready;
        t = (*t).list_next;
    }
    ready_list().append(wait_list);
}

/// Exit the calling thread. The main thread exiting halts the machine with
/// success.
pub fn thread_exit() -> ! {
    if current_tid() == MAIN_TID {
        info!("main thread exited, halting");
        match crate::fs::ktfs::fs_flush() {
            Ok(()) | Err(KernelError::NotSupported) => {}
            Err(err) => error!("final filesystem flush failed: {}", err),
        }
        arch::halt_success();
    }
    let prev = Arch::interrupt_disable();
    unsafe {
        let cur = CURRENT;
        (*cur).state = ThreadState::Exited;
        let parent = thrtab()[(*cur).parent];
        if !parent.is_null() {
            (*parent).child_exit.broadcast();
        }
        suspend_to_next();
    }
    Arch::interrupt_restore(prev);
    unreachable!("thread_exit: exited thread resumed");
}

#[no_mangle]
extern "C" fn thread_entry_returned() -> ! {
    thread_exit()
}

/// Wait for a child to exit and reclaim it. `tid == 0` waits for any child;
/// otherwise `tid` must name a child of the caller. Returns the reclaimed
/// thread id.
pub fn thread_join(tid: usize) -> KernelResult<usize> {
    let me = current_tid();
    let prev = Arch::interrupt_disable();
    let result = unsafe { join_locked(me, tid) };
    Arch::interrupt_restore(prev);
    result
}

unsafe fn join_locked(me: usize, tid: usize) -> KernelResult<usize> {
    if tid == 0 {
        loop {
            let mut have_child = false;
            let mut exited = None;
            for slot in 1..NTHR {
                let t = thrtab()[slot];
                if t.is_null() || slot == me {
                    continue;
                }
                if (*t).parent == me {
                    have_child = true;
                    if (*t).state == ThreadState::Exited {
                        exited = Some(slot);
                        break;
                    }
                }
            }
            if let Some(slot) = exited {
                thread_reclaim(slot);
                return Ok(slot);
            }
            if !have_child {
                return Err(KernelError::InvalidArg);
            }
            let cur = &mut *CURRENT;
            cur.child_exit.wait_raw();
        }
    } else {
        if tid >= NTHR {
            return Err(KernelError::InvalidArg);
        }
        loop {
            let t = thrtab()[tid];
            if t.is_null() {
                panic!("thread_join: empty slot {}", tid);
            }
            if (*t).parent != me {
                return Err(KernelError::InvalidArg);
            }
            if (*t).state == ThreadState::Exited {
                thread_reclaim(tid);
                return Ok(tid);
            }
            let cur = &mut *CURRENT;
            cur.child_exit.wait_raw();
        }
    }
}

/// Free an EXITED thread's slot, stack and record, re-parenting its children.
/// Interrupts must be disabled.
unsafe fn thread_reclaim(tid: usize) {
    let thread = thrtab()[tid];
    assert!(!thread.is_null(), "thread_reclaim: empty slot {}", tid);
    assert_eq!((*thread).state, ThreadState::Exited);

    // NTHR is small, the table scan is fine
    for slot in 1..NTHR {
        let t = thrtab()[slot];
        if !t.is_null() && (*t).parent == tid {
            (*t).parent = (*thread).parent;
        }
    }

    thrtab()[tid] = ptr::null_mut();
    if (*thread).kstack != 0 {
        free_page((*thread).kstack);
    }
    drop(Box::from_raw(thread));
    trace!("thread_reclaim: {}", tid);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed_thread(id: usize) -> *mut Thread {
        Box::into_raw(Box::new(Thread {
            id,
            name: "test",
            state: ThreadState::Ready,
            parent: 0,
            list_next: ptr::null_mut(),
            wait_cond: ptr::null(),
            child_exit: Condition::new("test"),
            kstack: 0,
            ctx: ThreadContext::zero(),
            proc_idx: None,
        }))
    }

    #[test]
    fn list_is_fifo() {
        let mut list = ThreadList::new();
        let a = boxed_thread(1);
        let b = boxed_thread(2);
        let c = boxed_thread(3);
        unsafe {
            list.push(a);
            list.push(b);
            list.push(c);
            assert_eq!(list.pop(), a);
            assert_eq!(list.pop(), b);
            assert_eq!(list.pop(), c);
            assert!(list.pop().is_null());
            assert!(list.is_empty());
            drop(Box::from_raw(a));
            drop(Box::from_raw(b));
            drop(Box::from_raw(c));
        }
    }

    #[test]
    fn append_preserves_order() {
        let mut first = ThreadList::new();
        let mut second = ThreadList::new();
        let a = boxed_thread(1);
        let b = boxed_thread(2);
        let c = boxed_thread(3);
        unsafe {
            first.push(a);
            second.push(b);
            second.push(c);
            first.append(&mut second);
            assert!(second.is_empty());
            assert_eq!(first.pop(), a);
            assert_eq!(first.pop(), b);
            assert_eq!(first.pop(), c);
            drop(Box::from_raw(a));
            drop(Box::from_raw(b));
            drop(Box::from_raw(c));
        }
    }
}
