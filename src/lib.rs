pub mod adapter;
pub mod auth;
pub mod balancer;
pub mod budget;
pub mod context;
mod error;
pub mod health;
pub mod http;
pub mod kv;
pub mod observability;
pub mod principal;
pub mod proxy;
pub mod ratelimit;
pub mod registry;
pub mod sanitize;
pub mod settings;
pub mod sse;
pub mod store;
pub mod types;
pub mod usage;

pub use error::GatewayError;
pub use settings::Settings;

pub use auth::{generate_api_key, CredentialStore, GeneratedKey};
pub use balancer::{LoadBalancer, Selection};
pub use budget::{BudgetLedger, BudgetReservation};
pub use http::{router, GatewayState};
pub use kv::{MemoryKv, RedisKv, SharedKv};
pub use observability::{Observability, ObservabilitySnapshot};
pub use principal::Principal;
pub use proxy::ProxyEngine;
pub use registry::{EndpointRegistry, EndpointSnapshot};
pub use store::SqliteStore;
pub use types::{
    ApiKeyRecord, AppRecord, EndpointConfig, EndpointKind, HealthStatus, ModelConfig,
    PaymentStatus, RoutingStrategy, TokenUsage, UsageRecord, UsageStatus, UserRecord,
};
pub use usage::UsageRecorder;
