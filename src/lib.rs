use std::{future::Future, pin::Pin};

pub mod cluster;
pub mod cluster_identity;
pub mod config;
pub mod forwarding;
pub mod http;
pub mod metrics;
pub mod version;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
