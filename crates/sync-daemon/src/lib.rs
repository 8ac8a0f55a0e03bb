//! sync-daemon library: Exposes the client components for the binary and
//! for integration tests.

pub mod config;
pub mod http_remote;
pub mod native_fs;
pub mod runtime;
pub mod watcher;

// Re-export key types for convenience
pub use config::{Args, ClientConfig};
pub use http_remote::HttpRemoteStore;
pub use native_fs::NativeFs;
pub use runtime::{NativeEngine, RuntimeOptions, SyncRuntime, build_engine};
pub use watcher::FileWatcher;
