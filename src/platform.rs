/// How daemonization and signal delivery are carried out.
///
/// Chosen once at startup and passed explicitly to [`crate::Daemon`] and
/// [`crate::signals::SignalHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Double `fork`, native `sigaction` handlers. Unix only.
    Fork,
    /// Re-invoke the program through a shielding worker and deliver signals
    /// through sentinel processes. Works everywhere.
    Spawn,
}

impl Strategy {
    /// `Fork` where the platform has it, `Spawn` otherwise.
    pub const fn detect() -> Self {
        if cfg!(unix) {
            Strategy::Fork
        } else {
            Strategy::Spawn
        }
    }

    pub const fn is_available(self) -> bool {
        match self {
            Strategy::Fork => cfg!(unix),
            Strategy::Spawn => true,
        }
    }
}

impl Default for Strategy {
    fn default() -> Self {
        Self::detect()
    }
}
