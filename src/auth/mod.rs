pub mod backend;
pub mod lifecycle;
pub mod session;
pub mod storage;

pub use backend::{AuthBackend, AuthPaths, Credentials, HttpAuthBackend, TokenGrant};
pub use lifecycle::{near_expiry, AuthLifecycle, AuthSettings, SessionStatus, QUICK_CHECK_BUFFER_SECS};
pub use session::SessionAuthState;
pub use storage::{open_default_store, FileStore, KeyValueStore, KeyringStore, MemoryStore, StoreError};
