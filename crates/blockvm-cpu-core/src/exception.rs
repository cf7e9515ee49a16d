//! Guest-visible processor exceptions and sticky CPU exits.

/// A guest fault raised by an execution node.
///
/// Faults are precise: the code block that observes one restores EIP to the
/// start of the faulting instruction before handing it to the mode's
/// exception-delivery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    DivideError,
    InvalidOpcode,
    DoubleFault,
    SegmentNotPresent(u16),
    StackFault(u16),
    GeneralProtection(u16),
    /// The access fell outside guest RAM. There is no architectural vector for
    /// this; delivery turns it into a sticky [`CpuExit::MemoryFault`].
    MemoryFault { addr: u64 },
}

impl Exception {
    #[inline]
    pub const fn gp0() -> Self {
        Exception::GeneralProtection(0)
    }

    /// Architectural vector, or `None` for host-side bus errors.
    pub const fn vector(self) -> Option<u8> {
        Some(match self {
            Exception::DivideError => 0,
            Exception::InvalidOpcode => 6,
            Exception::DoubleFault => 8,
            Exception::SegmentNotPresent(_) => 11,
            Exception::StackFault(_) => 12,
            Exception::GeneralProtection(_) => 13,
            Exception::MemoryFault { .. } => return None,
        })
    }

    /// Error code pushed by protected-mode delivery, if the vector has one.
    pub const fn error_code(self) -> Option<u32> {
        match self {
            Exception::DoubleFault => Some(0),
            Exception::SegmentNotPresent(e)
            | Exception::StackFault(e)
            | Exception::GeneralProtection(e) => Some(e as u32),
            _ => None,
        }
    }

    /// #DE, #TS, #NP, #SS and #GP are "contributory" for double-fault purposes.
    pub const fn is_contributory(self) -> bool {
        matches!(
            self,
            Exception::DivideError
                | Exception::SegmentNotPresent(_)
                | Exception::StackFault(_)
                | Exception::GeneralProtection(_)
        )
    }
}

/// A fault waiting to be delivered at the next instruction boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingFault {
    pub exception: Exception,
    /// EIP of the faulting instruction (not the start or end of its block).
    pub saved_eip: u32,
}

/// Conditions after which the vCPU cannot make further progress on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuExit {
    TripleFault,
    MemoryFault { addr: u64 },
}
