//! Shared infrastructure utilities for gx.
//!
//! - **`atomic_write`**: Crash-safe file persistence (temp + rename), used for
//!   the config file and for rendered images.

pub mod atomic_write;

pub use atomic_write::{
    AtomicWriteOptions, FileSyncPolicy, ParentDirSyncPolicy, atomic_write,
    atomic_write_with_options, persist_over, recover_bak_file,
};
