//! Named sandboxes with persistent overlays and installed wrappers.

pub mod manager;
pub mod store;

pub use manager::{
    clean_temp_files, CleanReport, LifecycleManager, Listing, Registration, Sandbox,
    SandboxExecutable, UninstallReport, WrapperHandle,
};
pub use store::{validate_name, NameLock, SandboxRecord, StateLayout, LOCK_TIMEOUT};
