//! The injected diagnostics capability.
//!
//! Decoding is tolerant by design: every malformation is reported to a
//! [`Diagnostics`] object which decides whether the decoder keeps going with
//! a partially populated result or gives up. Callers that advance a module
//! past the decoded state check completeness themselves.

use core::fmt::Arguments;

/// Verdict returned by [`Diagnostics::format_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagAction {
    /// Keep decoding; the produced artifact may be partially populated.
    Continue,
    /// Abort the current operation with the reported error.
    Abort,
}

/// Receiver for soft failures and dependency events during loading.
///
/// Implementations must not call back into the loader.
pub trait Diagnostics: Send + Sync {
    /// Report a malformation found while decoding `module`.
    ///
    /// Returning [`DiagAction::Continue`] lets the decoder produce a
    /// partially populated artifact, [`DiagAction::Abort`] turns the
    /// condition into a hard error.
    fn format_error(&self, module: &str, detail: Arguments<'_>) -> DiagAction;

    /// Report that a `DT_NEEDED` entry of `needed_by` could not be opened.
    fn missing_dependency(&self, name: &str, needed_by: &str) {
        let _ = (name, needed_by);
    }
}

/// Default diagnostics: log every report and abort on malformations.
pub struct StrictDiagnostics;

impl Diagnostics for StrictDiagnostics {
    fn format_error(&self, module: &str, detail: Arguments<'_>) -> DiagAction {
        log::error!("[{}] {}", module, detail);
        DiagAction::Abort
    }

    fn missing_dependency(&self, name: &str, needed_by: &str) {
        log::error!("[{}] cannot open dependency: {}", needed_by, name);
    }
}

/// Diagnostics that log and keep going; used by callers that inspect
/// partially decoded modules themselves.
pub struct LenientDiagnostics;

impl Diagnostics for LenientDiagnostics {
    fn format_error(&self, module: &str, detail: Arguments<'_>) -> DiagAction {
        log::warn!("[{}] {}", module, detail);
        DiagAction::Continue
    }

    fn missing_dependency(&self, name: &str, needed_by: &str) {
        log::warn!("[{}] cannot open dependency: {}", needed_by, name);
    }
}
