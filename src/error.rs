use core::fmt;

/// Errors produced by the memory, process and scheduling core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// No free physical block run, heap growth failed or a table is full.
    OutOfMemory,
    /// Every slot of the pid table is in use.
    PidExhausted,
    /// The pid does not name a live process.
    NoSuchProcess,
    /// An argument was out of range or malformed.
    InvalidArgument,
    /// Address not covered by any registered region or heap allocation.
    InvalidAddress,
    /// A block or heap chunk was released twice.
    DoubleFree,
    /// The virtual page is already backed.
    AlreadyMapped,
    /// The virtual page is not backed.
    NotMapped,
    /// The descriptor is not open.
    BadDescriptor,
    /// The descriptor table is full.
    TooManyFiles,
    /// The operation is reserved but not provided.
    NotSupported,
    /// The address space does not permit the operation.
    PermissionDenied,
}

impl KernelError {
    /// Negative errno value returned across the syscall boundary.
    pub fn errno(self) -> i64 {
        let code = match self {
            KernelError::OutOfMemory => errno::ENOMEM,
            KernelError::PidExhausted => errno::EAGAIN,
            KernelError::NoSuchProcess => errno::ESRCH,
            KernelError::InvalidArgument => errno::EINVAL,
            KernelError::InvalidAddress => errno::EFAULT,
            KernelError::DoubleFree => errno::EINVAL,
            KernelError::AlreadyMapped => errno::EEXIST,
            KernelError::NotMapped => errno::EFAULT,
            KernelError::BadDescriptor => errno::EBADF,
            KernelError::TooManyFiles => errno::EMFILE,
            KernelError::NotSupported => errno::ENOSYS,
            KernelError::PermissionDenied => errno::EPERM,
        };
        -code
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => write!(f, "Out of memory"),
            KernelError::PidExhausted => write!(f, "Process table full"),
            KernelError::NoSuchProcess => write!(f, "No such process"),
            KernelError::InvalidArgument => write!(f, "Invalid argument"),
            KernelError::InvalidAddress => write!(f, "Bad address"),
            KernelError::DoubleFree => write!(f, "Memory released twice"),
            KernelError::AlreadyMapped => write!(f, "Page already mapped"),
            KernelError::NotMapped => write!(f, "Page not mapped"),
            KernelError::BadDescriptor => write!(f, "Bad file descriptor"),
            KernelError::TooManyFiles => write!(f, "Too many open files"),
            KernelError::NotSupported => write!(f, "Function not implemented"),
            KernelError::PermissionDenied => write!(f, "Operation not permitted"),
        }
    }
}

pub type KernelResult<T> = Result<T, KernelError>;

/// Positive errno numbers (negated by [`KernelError::errno`]).
pub mod errno {
    pub const EPERM: i64 = 1;
    pub const ESRCH: i64 = 3;
    pub const EBADF: i64 = 9;
    pub const EAGAIN: i64 = 11;
    pub const ENOMEM: i64 = 12;
    pub const EFAULT: i64 = 14;
    pub const EEXIST: i64 = 17;
    pub const EINVAL: i64 = 22;
    pub const EMFILE: i64 = 24;
    pub const ENOSYS: i64 = 38;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_are_negative() {
        assert_eq!(KernelError::NoSuchProcess.errno(), -3);
        assert_eq!(KernelError::BadDescriptor.errno(), -9);
        assert_eq!(KernelError::OutOfMemory.errno(), -12);
        assert!(KernelError::NotSupported.errno() < 0);
    }
}
