//! Installs `package.json` dependencies whose source is a git repository
//! (`owner/repo[#ref]`, `git://…`, `git+https://…`) alongside ordinary
//! registry dependencies.

pub mod archive;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod fetch;
pub mod graph;
pub mod http;
pub mod install;
pub mod layout;
pub mod manifest;
pub mod registry;
pub mod remote;
pub mod resolve;
pub mod runtime;
pub mod specifier;
pub mod store;

pub use config::InstallConfig;
pub use error::InstallError;
pub use install::{Installer, install, layout};
pub use layout::{InstalledLayout, InstalledPackage};
pub use specifier::Specifier;
