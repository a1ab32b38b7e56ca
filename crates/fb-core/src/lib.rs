//! # fb-core
//!
//! Core types shared by the fogbox crates.
//!
//! This crate provides:
//! - The configuration error taxonomy
//! - Application and storage configuration loading

pub mod config;
pub mod error;

pub use config::{AppConfig, PublicSetting, StorageConfig};
pub use error::*;
