//! HTTP route handlers

pub mod auth;
pub mod devices;
pub mod health;
pub mod telemetry;
pub mod tenants;
