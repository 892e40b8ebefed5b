// Shared by both binaries; each uses a subset.
#![allow(dead_code)]

pub mod config;
pub mod console;
pub mod logger;
pub mod retrieval;
pub mod signals;
pub mod store;
