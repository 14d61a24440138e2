mod error;
pub use error::{Error, Result};

pub mod config;
pub mod context;
pub mod credentials;

pub mod cipher;
pub mod credential_store;

pub mod provider;
pub mod validator;

pub mod engine;
pub mod mfa_cache;
pub mod session;

pub mod chain;
pub mod refresh;

pub mod cmd;
