//! Command handlers that sit between the CLI and the library
pub mod init;
