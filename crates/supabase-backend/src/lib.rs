//! Supabase implementation of the identity capabilities
//!
//! [`SupabaseClient`] implements both `identity::IdentityProvider` (auth
//! API) and `identity::RecordStore` (table API) for one project, sharing an
//! HTTP client and the current session between them.

mod auth;
mod client;
mod error;
mod rest;

pub use client::SupabaseClient;
pub use error::{Error, Result};
