pub mod action_index;
pub mod api;
pub mod catalog;
pub mod config;
pub mod directory;
pub mod hub;
pub mod machine;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;
