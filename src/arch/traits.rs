pub trait ContextFrameTrait {
    fn new_user(entry: usize, sp: usize) -> Self;
    fn exception_pc(&self) -> usize;
    fn set_exception_pc(&mut self, pc: usize);
    fn stack_pointer(&self) -> usize;
    fn set_stack_pointer(&mut self, sp: usize);
    fn gpr(&self, index: usize) -> usize;
    fn set_gpr(&mut self, index: usize, val: usize);
    fn syscall_number(&self) -> usize;
    fn syscall_arg(&self, index: usize) -> usize;
    fn set_syscall_ret(&mut self, val: usize);
}

pub trait ArchTrait {
    fn exception_init();
    fn wait_for_interrupt();
    fn nop();

    /// Install an address-space tag (SATP image) and invalidate the TLB.
    fn install_page_table(tag: usize);
    fn active_page_table() -> usize;
    fn invalidate_tlb_all();
    fn invalidate_tlb_page(va: usize);

    /// Disable supervisor interrupts, returning the previous enable state.
    fn interrupt_disable() -> bool;
    fn interrupt_restore(was_enabled: bool);
    fn interrupt_enable();

    fn timer_counter() -> u64;
    fn timer_set_compare(tval: u64);
    fn timer_irq_enable(en: bool);
    fn external_irq_enable(en: bool);

    /// Let supervisor code reach user-mode mappings (sstatus.SUM).
    fn enable_user_access();

    /// Publish the running thread's kernel-stack anchor to the trap path.
    fn set_trap_stack_anchor(anchor: usize);
}
