//! A user-mode ELF dynamic linker runtime.
//!
//! `elf_dynld` loads shared objects through injected capabilities (a
//! [`object::ModuleProvider`] for bytes, an [`mmap::Mmap`] for address
//! space, a [`diagnostics::Diagnostics`] sink for soft failures) and
//! exposes the classic `dlopen`/`dlsym`/`dlclose` contract on top of a
//! module graph, with eager and lazy binding, RTLD_GLOBAL scope
//! promotion, ordered initializers/finalizers and first-class TLS
//! (`__tls_get_addr` and TLSDESC).
//!
//! # Examples
//! ```no_run
//! use elf_dynld::{RuntimeBuilder, OpenFlags};
//! use elf_dynld::object::DirProvider;
//! use elf_dynld::mmap::MmapImpl;
//!
//! let runtime = RuntimeBuilder::new(DirProvider::new(["/usr/lib".into()]))
//!     .build::<MmapImpl>();
//! let handle = runtime
//!     .dlopen(Some("libexample.so"), OpenFlags::RTLD_NOW | OpenFlags::RTLD_LOCAL)
//!     .unwrap();
//! let addr = runtime.dlsym(handle, "example").unwrap();
//! let example: extern "C" fn() -> i32 = unsafe { core::mem::transmute(addr) };
//! assert_eq!(example(), 17);
//! runtime.dlclose(handle).unwrap();
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
extern crate alloc;

#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "riscv64",
)))]
compile_error!("unsupport arch");

pub mod arch;
mod api;
pub mod diagnostics;
mod dynamic;
mod ehdr;
mod error;
mod graph;
mod hash;
mod init;
mod loader;
pub mod mmap;
mod module;
pub mod object;
mod relocation;
mod resolver;
pub mod segment;
mod symbol;
#[cfg(feature = "tls")]
pub mod tls;

pub use api::{
    Handle, ModuleInfo, OpenFlags, Runtime, RuntimeBuilder, SYNCHRONOUS_FINALIZERS,
};
pub use error::Error;
pub use loader::Loader;
pub use module::{Module, ModuleFlags, ModuleState};
pub use symbol::{PreCompute, SymbolInfo, SymbolTable};

pub type Result<T> = core::result::Result<T, Error>;
