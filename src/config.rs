//! Configuration supplied by the hosting environment.

/// Integrity-checking configuration.
///
/// Resolved once by the host (environment, service config) and passed
/// explicitly into open/create calls; the core never reads ambient global
/// state.
#[derive(Debug, Clone, Default)]
pub struct IntegrityConfig {
    /// When set, opens bypass the integrity engine entirely and plain file
    /// access is used instead. Evaluated once at open time, not per
    /// operation.
    pub disabled: bool,

    /// Identifier of the owning target, recorded in validation files.
    pub target: String,
}

impl IntegrityConfig {
    pub fn new(target: impl Into<String>) -> Self {
        IntegrityConfig {
            disabled: false,
            target: target.into(),
        }
    }
}
