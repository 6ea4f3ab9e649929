//! HTTP front-end serving the cache over GET/PUT/DELETE.
//!
//! - [`http_api`]: route handlers, error mapping and shared state

pub mod http_api;
