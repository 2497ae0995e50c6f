#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![deny(elided_lifetimes_in_paths, unreachable_pub)]
#![warn(
    missing_docs,
    clippy::doc_link_with_quotes,
    clippy::doc_markdown,
    clippy::missing_errors_doc
)]

mod config;
mod context;
pub mod error;
mod gate;
mod lease;
mod manager;
mod metrics;
mod pool;

pub use self::{
    config::{PoolConfig, PoolConfigBuilder},
    context::{Context, Interrupted},
    error::{ConfigError, PoolError},
    gate::Gate,
    lease::Lease,
    manager::Manager,
    metrics::PoolState,
    pool::{Pool, PoolBuilder, PoolResult, ResourceId},
};
