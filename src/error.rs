use core::fmt;

/// Kernel error conditions surfaced to user environments.
///
/// System calls report failure as the negative of `code()` in the saved
/// return-value register; the numbering is wire-stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub(crate) enum Error {
    /// Environment doesn't exist or caller lacks permission on it
    BadEnv,
    /// Invalid parameter
    Inval,
    /// Request failed due to memory shortage
    NoMem,
    /// Attempt to create a new environment beyond the maximum allowed
    NoFreeEnv,
    /// Attempt to send to env that is not receiving
    IpcNotRecv,
    /// Memory fault inside kernel on behalf of the user
    Fault,
}

impl Error {
    /// Wire value, returned to user mode as `-code()`. Slot 1 is
    /// reserved for an unspecified error and never produced.
    pub(crate) fn code(self) -> i32 {
        match self {
            Error::BadEnv => 2,
            Error::Inval => 3,
            Error::NoMem => 4,
            Error::NoFreeEnv => 5,
            Error::IpcNotRecv => 6,
            Error::Fault => 7,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::BadEnv => "bad environment",
            Error::Inval => "invalid parameter",
            Error::NoMem => "out of memory",
            Error::NoFreeEnv => "out of environments",
            Error::IpcNotRecv => "env is not recving",
            Error::Fault => "segmentation fault",
        };
        write!(f, "{}", msg)
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn wire_codes_are_stable() {
        assert_eq!(Error::BadEnv.code(), 2);
        assert_eq!(Error::Inval.code(), 3);
        assert_eq!(Error::NoMem.code(), 4);
        assert_eq!(Error::NoFreeEnv.code(), 5);
        assert_eq!(Error::IpcNotRecv.code(), 6);
        assert_eq!(Error::Fault.code(), 7);
    }
}
