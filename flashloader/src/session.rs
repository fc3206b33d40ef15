use std::time::Duration;

use crate::config::{Registry, Target};
use crate::core::TargetAccess;
use crate::Error;

/// The time the core may take to halt when attaching.
const ATTACH_HALT_TIMEOUT: Duration = Duration::from_millis(100);

/// The `Session` struct represents an active debug session.
///
/// It owns the access to the target and the [`Target`] description of the chip it is
/// attached to. All flashing operations run on a session.
pub struct Session {
    target: Target,
    access: Box<dyn TargetAccess>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("target", &self.target.name)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Open a new session on `access`, for the chip with the given name.
    ///
    /// The chip is looked up in `registry`.
    pub fn attach(
        access: impl TargetAccess + 'static,
        chip_name: impl AsRef<str>,
        registry: &Registry,
    ) -> Result<Self, Error> {
        let target = registry.get_target_by_name(chip_name)?;
        Self::new(Box::new(access), target)
    }

    /// Open a new session with a given debug target.
    ///
    /// The core is halted and the debug freeze registers of the target are written,
    /// in the order they are listed.
    pub fn new(mut access: Box<dyn TargetAccess>, target: Target) -> Result<Self, Error> {
        tracing::debug!("Attaching to {}", target.name);

        access.halt(ATTACH_HALT_TIMEOUT)?;

        for write in &target.debug_freeze {
            tracing::trace!(
                "Debug freeze: writing {:#010x} to {:#010x}",
                write.value,
                write.address
            );
            access.write_word_32(write.address, write.value)?;
        }

        Ok(Self { target, access })
    }

    /// The description of the attached chip.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Memory and core access to the attached chip.
    pub fn access(&mut self) -> &mut dyn TargetAccess {
        self.access.as_mut()
    }
}
