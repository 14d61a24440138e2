pub mod credential_process;
pub mod mfa_devices;
pub mod validate;
