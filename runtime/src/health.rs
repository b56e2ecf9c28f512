//! Health reporting for running engines.
//!
//! Each engine maps its [`EngineStatus`] onto a [`HealthStatus`]; a
//! [`HealthReport`] rolls a set of engines up into the worst of them.

use crate::engine::{Engine, EngineStatus};

/// Health level, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    /// Processing events normally
    Healthy,

    /// Not processing events, but nothing needs an operator
    Degraded,

    /// Blocked until an operator intervenes
    Unhealthy,
}

impl HealthStatus {
    /// `Healthy`?
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// `Degraded`?
    #[must_use]
    pub const fn is_degraded(self) -> bool {
        matches!(self, Self::Degraded)
    }

    /// `Unhealthy`?
    #[must_use]
    pub const fn is_unhealthy(self) -> bool {
        matches!(self, Self::Unhealthy)
    }
}

impl From<EngineStatus> for HealthStatus {
    fn from(status: EngineStatus) -> Self {
        match status {
            EngineStatus::Running => Self::Healthy,
            EngineStatus::Closed => Self::Degraded,
            EngineStatus::Stalled => Self::Unhealthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// One engine's health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    /// `engine:<key>`
    pub component: String,

    /// Health derived from `engine`
    pub status: HealthStatus,

    /// Lifecycle state the check was taken from
    pub engine: EngineStatus,

    /// What an operator should know, if anything
    pub message: Option<&'static str>,
}

impl<Ev> Engine<Ev> {
    /// Health of this engine as a single check
    #[must_use]
    pub fn health(&self) -> HealthCheck {
        let engine = self.status();
        HealthCheck {
            component: format!("engine:{}", self.key()),
            status: engine.into(),
            engine,
            message: match engine {
                EngineStatus::Running => None,
                EngineStatus::Stalled => Some("stalled after a failed action, needs force_unlock"),
                EngineStatus::Closed => Some("execution loop has exited"),
            },
        }
    }
}

/// Health of a set of engines.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Worst status among `checks`; healthy when there are none
    pub status: HealthStatus,

    /// One check per engine
    pub checks: Vec<HealthCheck>,

    /// When the report was taken
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl HealthReport {
    /// Roll `checks` up into a report
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|check| check.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            checks,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Overall status is healthy
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    /// Overall status is degraded
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        self.status.is_degraded()
    }

    /// Overall status is unhealthy
    #[must_use]
    pub const fn is_unhealthy(&self) -> bool {
        self.status.is_unhealthy()
    }

    /// Checks that need an operator
    pub fn needs_attention(&self) -> impl Iterator<Item = &HealthCheck> {
        self.checks.iter().filter(|check| check.status.is_unhealthy())
    }
}

impl std::fmt::Display for HealthReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} engines)", self.status, self.checks.len())?;
        for check in self.needs_attention() {
            write!(f, "; {}: {}", check.component, check.engine)?;
        }
        Ok(())
    }
}
