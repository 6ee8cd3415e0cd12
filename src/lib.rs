//! Per-user provider API keys: encrypted storage, resolution with admin
//! overrides, and token/cost usage metering.

pub mod auth;
pub mod cipher;
pub mod clock;
pub mod config;
pub mod credentials;
mod error;
#[cfg(feature = "http")]
pub mod http;
pub mod overrides;
pub mod provider;
pub mod resolver;
pub mod service;
pub mod store;
#[doc(hidden)]
pub mod test_support;
pub mod types;
pub mod usage;

pub use auth::{AdminGrant, AuthError, Authorizer, CurrentUser, IdentityProvider, Role, StaticIdentity};
pub use cipher::{CipherError, MasterSecret, SealedSecret, SecretCipher};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, KeyledgerConfig, SecretEnv};
pub use credentials::{CredentialError, CredentialStore, KeyFormatPolicy, ValidationPolicy};
pub use error::{KeyledgerError, Result};
pub use overrides::{OverrideError, OverrideRegistry};
pub use provider::{GeminiKeyValidator, KeyCheck, KeyValidator};
pub use resolver::{CredentialResolver, ResolutionError, UsableKey};
pub use service::{KeyFailure, KeyService, KeyServiceBuilder};
#[cfg(feature = "store-sqlite")]
pub use store::SqliteStore;
pub use store::{DayRange, MemoryStore, ProfileStore, StoreError};
pub use types::{
    AdminOverride, AppendOutcome, CredentialStatus, KeySource, LimitType, OverrideConditions,
    OverrideConfig, TriggerCondition, UsageEvent, UsageLimits, UsageMetrics, UsageReport,
    UserCredential, UserUsageSummary,
};
pub use usage::{PricingTable, UsageAggregator, UsageError};
