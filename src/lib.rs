//! Parseit — email-driven PDF extraction and delivery.

pub mod api;
pub mod auth;
pub mod config;
pub mod deliver;
pub mod error;
pub mod extract;
pub mod mail;
pub mod pipeline;
pub mod postprocess;
pub mod store;
pub mod template;
