//! HTTP mapping of the key, usage and admin operations.
include!("http/core.rs");
include!("http/keys.rs");
include!("http/usage.rs");
include!("http/admin.rs");
