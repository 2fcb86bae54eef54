pub mod admin;
pub mod app;
pub mod config;
pub mod error;
pub mod handlers;
pub mod line;
pub mod link_meta;
pub mod ratelimit;
pub mod sources;
pub mod stats;
pub mod store;
pub mod upload;
pub mod webdav;
