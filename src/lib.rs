//! Unsubscribe engine: finds subscription mail and unsubscribes, once per list.

pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod message;
pub mod pipeline;
pub mod provider;
pub mod store;
pub mod tools;
