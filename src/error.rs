//! Error types used throughout the `elf_dynld` crate.
//!
//! The variants form the stable error taxonomy of the public API; the
//! `Display` output of each variant is part of the crate's contract and is
//! matched verbatim by callers that mimic `dlerror`.

use alloc::borrow::Cow;
use alloc::string::String;
use core::fmt::{Display, Formatter};

/// Failure conditions reported by the loader, resolver, relocator and the
/// public `dlopen`/`dlsym`/`dlclose` surface.
#[derive(Debug)]
pub enum Error {
    /// The module provider could not find the requested root module.
    NotFound {
        /// Name passed to `dlopen`.
        name: String,
    },

    /// A transitive `DT_NEEDED` dependency could not be opened.
    MissingDependency {
        /// Name of the missing dependency.
        name: String,
        /// Canonical name of the module that required it.
        needed_by: String,
    },

    /// The ELF header, program headers or dynamic section are invalid.
    MalformedElf {
        /// What was malformed.
        reason: Cow<'static, str>,
    },

    /// The load engine rejected the segment layout.
    BadSegment {
        /// Which constraint was violated.
        reason: Cow<'static, str>,
    },

    /// The relocator encountered a relocation type it does not implement.
    UnsupportedReloc {
        /// Raw relocation type value.
        r_type: usize,
        /// Canonical name of the module being relocated.
        module: String,
    },

    /// A non-weak symbol could not be resolved in any active scope.
    UndefinedSymbol {
        /// The symbol name.
        symbol: String,
        /// Canonical name of the module whose relocation referenced it.
        module: String,
    },

    /// A module with the same canonical name is already live.
    ///
    /// Mostly internal; `dlopen` folds this into returning the existing
    /// handle unless the graph is asked for strict insertion.
    AlreadyLoaded {
        /// The clashing canonical name.
        name: String,
    },

    /// The `mode` argument contained unknown bits or an illegal combination.
    InvalidMode,

    /// `NOLOAD` was requested and the module is not currently loaded.
    NoLoadFailed {
        /// Name passed to `dlopen`.
        name: String,
    },

    /// An injected capability (provider, mapper, allocator) failed.
    SystemError {
        /// Capability-specific error code.
        code: i32,
        /// A descriptive message.
        detail: Cow<'static, str>,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::NotFound { name } => write!(f, "{name} not found"),
            Error::MissingDependency { name, .. } => {
                write!(f, "cannot open dependency: {name}")
            }
            Error::UndefinedSymbol { symbol, module } => {
                write!(f, "{module}: undefined symbol: {symbol}")
            }
            Error::InvalidMode => write!(f, "invalid mode parameter"),
            Error::MalformedElf { reason } => write!(f, "MalformedElf: {reason}"),
            Error::BadSegment { reason } => write!(f, "BadSegment: {reason}"),
            Error::UnsupportedReloc { r_type, module } => {
                write!(f, "UnsupportedReloc: relocation type {r_type} in {module}")
            }
            Error::AlreadyLoaded { name } => write!(f, "AlreadyLoaded: {name}"),
            Error::NoLoadFailed { name } => write!(f, "NoLoadFailed: {name}"),
            Error::SystemError { code, detail } => {
                write!(f, "SystemError: {detail} (code {code})")
            }
        }
    }
}

impl core::error::Error for Error {}

#[cfg(feature = "std")]
impl From<std::io::Error> for Error {
    #[cold]
    fn from(value: std::io::Error) -> Self {
        Error::SystemError {
            code: value.raw_os_error().unwrap_or(0),
            detail: Cow::Owned(alloc::string::ToString::to_string(&value)),
        }
    }
}

#[cold]
#[inline(never)]
pub(crate) fn not_found(name: impl Into<String>) -> Error {
    Error::NotFound { name: name.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn missing_dependency(name: impl Into<String>, needed_by: impl Into<String>) -> Error {
    Error::MissingDependency {
        name: name.into(),
        needed_by: needed_by.into(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn malformed_elf(reason: impl Into<Cow<'static, str>>) -> Error {
    Error::MalformedElf {
        reason: reason.into(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn bad_segment(reason: impl Into<Cow<'static, str>>) -> Error {
    Error::BadSegment {
        reason: reason.into(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn unsupported_reloc(r_type: usize, module: impl Into<String>) -> Error {
    Error::UnsupportedReloc {
        r_type,
        module: module.into(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn undefined_symbol(symbol: impl Into<String>, module: impl Into<String>) -> Error {
    Error::UndefinedSymbol {
        symbol: symbol.into(),
        module: module.into(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn already_loaded(name: impl Into<String>) -> Error {
    Error::AlreadyLoaded { name: name.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn noload_failed(name: impl Into<String>) -> Error {
    Error::NoLoadFailed { name: name.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn system_error(code: i32, detail: impl Into<Cow<'static, str>>) -> Error {
    Error::SystemError {
        code,
        detail: detail.into(),
    }
}
