#![feature(error_generic_member_access)]

pub mod proto;
pub mod tls;

#[cfg(feature = "client")]
pub mod client;

#[cfg(feature = "server")]
pub mod server;

pub type Error = eyre::Report;
pub type Result<T> = eyre::Result<T>;
