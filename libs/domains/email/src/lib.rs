//! Transactional email delivery domain.
//!
//! Intake validates and renders requests into durable log records, the queue
//! processor delivers them through prioritized providers with retry and
//! failover, and the status tracker folds provider webhooks back into the
//! log. See the individual modules for the moving parts:
//!
//! - [`service`]: intake and the queue control operations
//! - [`processor`]: the background delivery loop
//! - [`gateway`]: provider construction, caching, and failover
//! - [`tracker`]: webhook-driven status updates and suppression
//! - [`repository`]: storage traits with in-memory and Postgres backends

pub mod error;
pub mod gateway;
pub mod handlers;
pub mod lane;
pub mod models;
pub mod postgres_repository_impl;
pub mod processor;
pub mod providers;
pub mod repository;
pub mod service;
pub mod templates;
pub mod tracker;

pub use error::{EmailError, EmailResult};
pub use gateway::ProviderGateway;
pub use processor::{QueueProcessor, QueueProcessorConfig};
pub use service::{EmailService, EmailServiceConfig};
pub use tracker::StatusTracker;
