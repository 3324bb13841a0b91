// src/connection/mod.rs

//! The persistent connection object and its behaviour flags.

mod persist;

pub use persist::{ConnFlags, PersistConn};
