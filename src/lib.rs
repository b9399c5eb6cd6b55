pub mod config;
pub mod domain;
pub mod import;
pub mod mail;
pub mod notify;
pub mod store;
