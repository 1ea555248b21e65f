//! Unattended installer and renewal agent for a PKI key-management stack.
//!
//! The system being managed is a certificate-authority application running
//! on an application server, backed by a software crypto token and
//! enrolled for a publicly trusted certificate. This crate is the
//! orchestrator around it:
//!
//! - **Process driving** - prompt-driven external tools (the CA's build
//!   targets, the server CLI, the token utility) are run through a driver
//!   that multiplexes stdout/stderr and answers prompts on stdin
//! - **Pipelines** - `install`, `renew` and `onboot` sequence the
//!   side-effecting stages, each with a declared failure class
//! - **Retry discipline** - bounded automatic retries when unattended,
//!   operator-driven decisions when interactive
//! - **Safety** - a host-wide execution lock, backup-before-overwrite for
//!   every mutated file, and durable record checkpoints mid-pipeline
//!
//! The remote registration service, the public-CA client and the token
//! utility are external collaborators consumed through narrow traits.

pub mod acme;
pub mod appserver;
pub mod error;
pub mod guard;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod prompt;
pub mod record;
pub mod registry;
pub mod retry;
pub mod sysconfig;
pub mod token;

pub use error::StageError;
pub use pipeline::{Collaborators, Report, RunOptions};
pub use record::{InstallRecord, RecordStore};
