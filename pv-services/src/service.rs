//! Service trait and lifecycle state.
//!
//! Services are shared behind `Arc` between the CLI, the sync timer task and
//! the repository, so lifecycle methods take `&self` and keep their state
//! behind interior mutability.

use std::sync::Mutex;

use pv_core::error::PvResult;

/// Lifecycle state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    Running,
    Stopped,
    /// The service could not start; its dependencies are unavailable.
    Failed,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Standard lifecycle for application services.
///
/// `AppContext` initializes services in registration order and shuts them
/// down in reverse.
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> ServiceState;

    /// Called once during application startup.
    fn init(&self) -> PvResult<()>;

    /// Called during application teardown.
    fn shutdown(&self) -> PvResult<()>;

    /// Health check. Returns true if the service is operational.
    fn is_healthy(&self) -> bool {
        self.state() == ServiceState::Running
    }
}

/// Shared state cell used by service implementations.
#[derive(Debug)]
pub(crate) struct StateCell(Mutex<ServiceState>);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(Mutex::new(ServiceState::Created))
    }

    pub(crate) fn get(&self) -> ServiceState {
        *self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn set(&self, state: ServiceState) {
        *self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestService {
        state: StateCell,
    }

    impl Service for TestService {
        fn name(&self) -> &str {
            "test"
        }
        fn state(&self) -> ServiceState {
            self.state.get()
        }
        fn init(&self) -> PvResult<()> {
            self.state.set(ServiceState::Running);
            Ok(())
        }
        fn shutdown(&self) -> PvResult<()> {
            self.state.set(ServiceState::Stopped);
            Ok(())
        }
    }

    #[test]
    fn test_service_lifecycle() {
        let svc = TestService { state: StateCell::new() };
        assert!(!svc.is_healthy());
        svc.init().unwrap();
        assert!(svc.is_healthy());
        svc.shutdown().unwrap();
        assert!(!svc.is_healthy());
        assert_eq!(svc.state().to_string(), "stopped");
    }
}
