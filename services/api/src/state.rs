//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the generation
//! client and the pacing settings every session is created with.

use crate::config::Config;
use personaverse_core::{ReplyGenerator, RevealRate, SchedulerSettings};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub generator: Arc<dyn ReplyGenerator>,
    /// Settings for each playground session.
    pub playground: SchedulerSettings,
    /// Reveal pace of the single-persona chat.
    pub chat_rate: RevealRate,
}

impl AppState {
    pub fn new(generator: Arc<dyn ReplyGenerator>, config: &Config) -> Self {
        Self {
            generator,
            playground: SchedulerSettings {
                reveal: RevealRate::new(config.playground_typing, 1),
                history_window: config.history_window,
            },
            chat_rate: RevealRate::new(config.chat_typing, 1),
        }
    }

    /// State with default pacing; used where no environment config exists.
    pub fn with_defaults(generator: Arc<dyn ReplyGenerator>) -> Self {
        Self {
            generator,
            playground: SchedulerSettings::default(),
            chat_rate: RevealRate::CHAT,
        }
    }
}
