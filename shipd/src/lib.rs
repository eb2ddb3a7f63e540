//! shipd library
//!
//! Serialized deployment of docker compose projects to remote hosts over ssh.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod remote;
pub mod server;
pub mod storage;
pub mod utils;
