pub mod client;
pub mod config;
pub mod daemon;
pub mod protocol;
pub mod provisioner;
