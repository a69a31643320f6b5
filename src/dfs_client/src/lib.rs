mod client;
mod conn_pool;
mod directory;
mod meta_cache;
mod span;

pub use client::*;
pub use conn_pool::*;
pub use span::*;

#[cfg(test)]
mod client_tests;
