//! Data models for the session core

mod user;

pub use user::*;
