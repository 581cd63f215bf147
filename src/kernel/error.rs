/// Kernel error taxonomy. Every fallible kernel path reports one of these;
/// the syscall boundary carries them as small negative integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum KernelError {
    #[display(fmt = "invalid argument")]
    InvalidArg = 1,
    #[display(fmt = "no access")]
    NoAccess = 2,
    #[display(fmt = "bad file descriptor")]
    BadFd = 3,
    #[display(fmt = "busy")]
    Busy = 4,
    #[display(fmt = "too many open files")]
    TooManyFiles = 5,
    #[display(fmt = "not found")]
    NotFound = 6,
    #[display(fmt = "not supported")]
    NotSupported = 7,
    #[display(fmt = "out of memory")]
    OutOfMemory = 8,
    #[display(fmt = "i/o error")]
    Io = 9,
    #[display(fmt = "bad executable format")]
    BadFormat = 10,
    #[display(fmt = "broken pipe")]
    BrokenPipe = 11,
    #[display(fmt = "out of threads")]
    OutOfThreads = 12,
}

pub type KernelResult<T = ()> = Result<T, KernelError>;

impl KernelError {
    pub const fn errno(self) -> isize {
        -(self as isize)
    }
}

/// Fold a `KernelResult<usize>` into the register-sized syscall return.
pub fn sysret(result: KernelResult<usize>) -> usize {
    match result {
        Ok(val) => val,
        Err(err) => err.errno() as usize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_are_stable() {
        assert_eq!(KernelError::InvalidArg.errno(), -1);
        assert_eq!(KernelError::BrokenPipe.errno(), -11);
        assert_eq!(KernelError::OutOfThreads.errno(), -12);
    }

    #[test]
    fn sysret_folds_errors() {
        assert_eq!(sysret(Ok(42)), 42);
        assert_eq!(sysret(Err(KernelError::BadFd)) as isize, -3);
    }
}
