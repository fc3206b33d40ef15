//! Errors of the link to the debug probe, and a simulated target for tests.

#[cfg(any(test, feature = "test"))]
pub mod fake_target;

/// This error occurs whenever the debug probe logic encounters an error while operating the
/// relevant debug probe.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum DebugProbeError {
    /// The debug probe did not answer in time.
    Timeout,

    /// The connection to the debug probe was lost.
    Disconnected,

    /// The debug probe rejected the command: {0}
    CommandFailed(String),
}
