//! # caseflow
//!
//! Allocation engine for debt-recovery cases. Overdue invoices become
//! cases; a durable job queue drives allocation runs that assign each
//! pending case to the best-scoring collection agency with spare
//! capacity, and ingestion jobs that fold scoring-oracle output into
//! agency performance history.
//!
//! The engine ([`engine`]) is pure. Persistence ([`store`], [`db`]) and
//! the queue ([`queue`]) sit behind traits with Postgres and in-memory
//! implementations; the [`worker`] runtime ties them together.

pub mod admin;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod oracle;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod worker;
