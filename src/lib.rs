pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod filemap;
pub mod integrity;
pub mod links;
pub mod mirror;
pub mod naming;
pub mod output;
pub mod source;
pub mod store;
pub mod transport;
