//! Operation outcomes and the restart flags OR'd into the process exit status.

use bitflags::bitflags;

bitflags! {
    /// Follow-up actions a finished operation asks the caller to perform.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RestartFlags: u8 {
        const NEED_REBOOT = 0x10;
        const NEED_LMI_RESTART = 0x20;
    }
}

/// Low bits of the exit status; the restart flags occupy the bits above.
pub const EXIT_FAILURE: u8 = 1;

/// Result of one top-level operation. Lower layers return these; only the
/// dispatcher in `lib.rs` converts them into exit codes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    pub success: bool,
    pub flags: RestartFlags,
    pub failures: Vec<String>,
}

impl Outcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            flags: RestartFlags::empty(),
            failures: vec![message.into()],
        }
    }

    pub fn with_flags(mut self, flags: RestartFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Fold another outcome into this one: any failure wins, flags accumulate.
    pub fn merge(&mut self, other: Outcome) {
        self.success &= other.success;
        self.flags |= other.flags;
        self.failures.extend(other.failures);
    }

    pub fn exit_code(&self) -> u8 {
        let base = if self.success { 0 } else { EXIT_FAILURE };
        base | self.flags.bits()
    }
}
