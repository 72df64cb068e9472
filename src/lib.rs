pub mod agent;
pub mod aggregate;
pub mod batch;
pub mod config;
pub mod consent;
pub mod coordinator;
pub mod delivery;
pub mod error;
pub mod event;
pub mod health;
pub mod hits;
pub mod queue;
