//! Agent-side request handlers.
//!
//! The tunnel client ([`crate::tunnel::client`]) decodes frames and hands
//! RPC requests to these dispatchers on their own tasks, so a slow command
//! never stalls stream or shell traffic on the same channel.

pub mod exec;
pub mod files;
pub mod metrics;

use crate::config::Config;

use exec::ExecSettings;
use files::FileSettings;

/// Read-only settings shared by every dispatcher task.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub exec: ExecSettings,
    pub files: FileSettings,
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            exec: ExecSettings::from_config(&config.shell, &config.exec),
            files: FileSettings::from(&config.files),
        }
    }
}
