//! Turn a running Linux system into a bootable live ISO, or install it onto
//! a fresh disk.
//!
//! The crate is a staged pipeline. Each stage reads and updates a persisted
//! [`config::PipelineConfig`] and routes every host mutation through a
//! [`process::Runner`]:
//!
//! - **Clone** - mirror the live system (or another drive) into a staging tree
//! - **Package** - squashfs or block image from the staging tree, with checksum
//! - **Boot** - kernel selection, initramfs generation, boot menu edits
//! - **ISO** - hybrid BIOS/UEFI image via xorriso
//! - **Media** - raw copy of a finished ISO onto a removable drive
//! - **QEMU** - boot a finished ISO in a virtual machine
//! - **Disk** - partition, format, mount, populate and configure a target disk
//!
//! # Architecture
//!
//! ```text
//! live-builder (binary)
//!     │
//!     └── pipeline::Session ──┬── config (ConfigStore, readiness)
//!                             ├── profile (Arch / Ubuntu / Debian)
//!                             ├── runs (JSON run records)
//!                             │
//!                             ├── clone ─────┐
//!                             ├── artifact ──┤
//!                             ├── boot ──────┼── process (Cmd, Runner)
//!                             ├── media ─────┤
//!                             └── disk ──────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use live_builder::config::FileConfigStore;
//! use live_builder::operator::Operator;
//! use live_builder::pipeline::{CloneSource, Session};
//! use live_builder::process::SystemRunner;
//! use live_builder::profile::DistroProfile;
//!
//! let operator = Operator::resolve()?;
//! let store = FileConfigStore::for_operator(&operator);
//! let mut session = Session::open(&SystemRunner, Box::new(store), DistroProfile::detect()?, operator)?;
//! session.clone(CloneSource::Live)?;
//! session.build_iso()?;
//! ```

pub mod artifact;
pub mod boot;
pub mod clone;
pub mod config;
pub mod disk;
pub mod error;
pub mod logging;
pub mod media;
pub mod operator;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod profile;
pub mod qemu;
pub mod runs;
pub mod ticker;

pub use error::StageError;
pub use pipeline::Session;
