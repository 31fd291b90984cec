//! IBM Cloud VPC Gen2 backend.
//!
//! Implements [`ComputeApi`](crate::providers::ComputeApi),
//! [`TaggingApi`](crate::providers::TaggingApi) and
//! [`SearchApi`](crate::providers::SearchApi) over the public REST APIs.

mod auth;
mod client;
mod models;

pub use auth::IamAuthenticator;
pub use client::{SearchClient, TaggingClient, VpcClient, VpcClientFactory, API_VERSION};
