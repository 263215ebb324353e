//! Time source for id and date generation

use chrono::{DateTime, Utc};
use sdk::errors::Result;

use crate::config::ResolvedConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Clock {
    #[default]
    System,
    /// Always reports the same instant
    Frozen(DateTime<Utc>),
}

impl Clock {
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::System => Utc::now(),
            Clock::Frozen(instant) => *instant,
        }
    }
}

/// Everything id- and date-generating calls are allowed to depend on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GenerationContext {
    pub clock: Clock,
}

impl GenerationContext {
    pub fn system() -> Self {
        Self::default()
    }

    pub fn frozen(instant: DateTime<Utc>) -> Self {
        Self {
            clock: Clock::Frozen(instant),
        }
    }

    /// Frozen when `system.testing.override_current_date` is set
    pub fn from_config(config: &ResolvedConfig) -> Result<Self> {
        Ok(match config.system.testing.frozen_now()? {
            Some(instant) => Self::frozen(instant),
            None => Self::system(),
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
