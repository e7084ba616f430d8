//! Ops console core library: reply formatting, message and conversation stores,
//! the automation webhook client, and asynchronous reply delivery.

pub mod commands;
pub mod config;
pub mod console;
pub mod format;
pub mod init;
pub mod model;
pub mod store;
pub mod watch;
pub mod webhook;
