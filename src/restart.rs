//! Application restart escalation.
//!
//! When hot swapping cannot move the process forward (aborted apply,
//! incompatible history, swapping disabled) the runtime asks for a full
//! application restart. How that actually happens is deployment-specific,
//! so it hides behind [`RestartAction`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::logger::Logger;

/// Relaunches the application this process hosts.
#[async_trait]
pub trait RestartAction: Send + Sync {
    async fn restart(&self) -> anyhow::Result<()>;
}

pub struct ApplicationRestarter {
    log: Logger,
    enabled: bool,
    restarting: AtomicBool,
    action: Arc<dyn RestartAction>,
}

impl ApplicationRestarter {
    pub fn new(log: &Logger, enabled: bool, action: Arc<dyn RestartAction>) -> Self {
        Self {
            log: log.scoped("restarter"),
            enabled,
            restarting: AtomicBool::new(false),
            action,
        }
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::SeqCst)
    }

    /// Restart the application, or tell the user to when automatic
    /// restarts are off. Repeat requests while one is underway are
    /// dropped.
    pub async fn restart_or_prompt(&self) {
        if !self.enabled {
            self.log.error("Manual restart required.");
            return;
        }
        if self.restarting.swap(true, Ordering::SeqCst) {
            self.log.debug("restart already in flight; ignoring");
            return;
        }
        self.log.info("restarting application");
        if let Err(err) = self.action.restart().await {
            // the flag stays raised; after a failed restart the process
            // state is unknown
            self.log.error(format!("restart failed: {err:#}"));
        }
    }
}
