//! Storage backends for revsnap media.

pub mod local;
pub mod policy;
pub mod remote;
pub mod retry;

pub use local::LocalBackend;
pub use policy::{RemotePolicy, Security, StoragePolicy};
pub use remote::RemoteBackend;
pub use retry::{RetryConfig, Retryable, retry_with_backoff};
