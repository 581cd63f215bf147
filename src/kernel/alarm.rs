//! Alarms: a sorted sleep list over the supervisor timer. The compare
//! register always tracks the head's wake time; the ISR promotes due
//! sleepers to READY and never preempts the interrupted thread itself. A
//! dedicated interrupter thread sleeps 10 ms in a loop, which is what turns
//! timer ticks into periodic rescheduling opportunities.

use core::ptr;

use crate::arch::{Arch, ArchTrait};
use crate::board::PLAT_DESC;
use crate::kernel::sync::Condition;
use crate::kernel::thread;

pub struct Alarm {
    twake: u64,
    next: *mut Alarm,
    cond: Condition,
}

static mut SLEEP_LIST: *mut Alarm = ptr::null_mut();

fn sleep_head() -> &'static mut *mut Alarm {
    unsafe { &mut *ptr::addr_of_mut!(SLEEP_LIST) }
}

pub fn timer_init() {
    Arch::timer_irq_enable(false);
    info!(
        "timer_init: timebase {} Hz, tick {} ticks/ms",
        PLAT_DESC.timebase_freq,
        ticks_per_ms()
    );
}

fn ticks_per_ms() -> u64 {
    (PLAT_DESC.timebase_freq / 1000) as u64
}

pub fn ticks_now() -> u64 {
    Arch::timer_counter()
}

impl Alarm {
    pub const fn new(name: &'static str) -> Self {
        Alarm {
            twake: 0,
            next: ptr::null_mut(),
            cond: Condition::new(name),
        }
    }

    /// Sleep until `tcnt` timer ticks from now have elapsed.
    pub fn sleep(&mut self, tcnt: u64) {
        let prev = Arch::interrupt_disable();
        self.twake = ticks_now().saturating_add(tcnt);
        unsafe {
            self.insert_sorted();
        }
        // the head owns the compare register
        let head = *sleep_head();
        Arch::timer_set_compare(unsafe { (*head).twake });
        Arch::timer_irq_enable(true);
        self.cond.wait_raw();
        Arch::interrupt_restore(prev);
    }

    pub fn sleep_ms(&mut self, ms: u64) {
        self.sleep(ms * ticks_per_ms());
    }

    pub fn sleep_us(&mut self, us: u64) {
        self.sleep(us * ticks_per_ms() / 1000);
    }

    /// Ascending by wake time; ties keep insertion order. Interrupts must be
    /// disabled.
    unsafe fn insert_sorted(&mut self) {
        let this = self as *mut Alarm;
        let mut link = sleep_head() as *mut *mut Alarm;
        while !(*link).is_null() && (**link).twake <= self.twake {
            link = ptr::addr_of_mut!((**link).next);
        }
        self.next = *link;
        *link = this;
    }
}

/// Supervisor timer ISR: pop and broadcast every due alarm, then reprogram
/// the compare register for the new head or quiesce the interrupt.
pub fn timer_isr() {
    let now = ticks_now();
    loop {
        let head = *sleep_head();
        if head.is_null() || unsafe { (*head).twake } > now {
            break;
        }
        unsafe {
            *sleep_head() = (*head).next;
            (*head).next = ptr::null_mut();
            (*head).cond.broadcast();
        }
    }
    let head = *sleep_head();
    if head.is_null() {
        Arch::timer_irq_enable(false);
    } else {
        Arch::timer_set_compare(unsafe { (*head).twake });
    }
}

extern "C" fn interrupter_thread() {
    let mut alarm = Alarm::new("interrupter");
    loop {
        alarm.sleep_ms(10);
    }
}

/// Spawn the periodic interrupter.
pub fn interrupter_init() {
    thread::thread_spawn("interrupter", interrupter_thread as usize, &[])
        .expect("interrupter_init: spawn");
}
