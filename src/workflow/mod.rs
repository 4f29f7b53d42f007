//! Workflow engines
//!
//! `ShipmentWorkflow` drives single shipments, `B2bWorkflow` drives B2B
//! shipments and their volumes. Both read the current status, check the
//! transition table and then write conditioned on the status they read.

mod b2b;
mod evidence;
mod guard;
mod shipment;
mod validation;

use std::future::Future;

use crate::domain::{DriverId, SessionContext};
use crate::infra::{LogisticsError, Result, Retry, RetryConfig};
use crate::metrics::{metric_names, MetricsRegistry};

pub use b2b::*;
pub use evidence::*;
pub use guard::{InFlight, InFlightPermit};
pub use shipment::*;
pub use validation::*;

/// Re-run `op` when it loses an optimistic-concurrency race. `op` must
/// re-read the record on every attempt.
pub async fn retry_on_conflict<F, Fut, T>(context: &str, op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    Retry::new(RetryConfig::conflict())
        .run_with_predicate(context, op, LogisticsError::is_conflict)
        .await
        .into_result()
}

/// Count a transition attempt by outcome
async fn record_outcome<T>(metrics: &MetricsRegistry, result: &Result<T>) {
    let name = match result {
        Ok(_) => metric_names::TRANSITIONS_APPLIED,
        Err(e) if e.is_conflict() => metric_names::TRANSITIONS_CONFLICTS,
        Err(_) => metric_names::TRANSITIONS_REJECTED,
    };
    metrics.inc_counter(name).await;
}

/// Driver that an accept action assigns: the acting driver, or the driver an
/// admin dispatches
fn resolve_driver(session: &SessionContext, assign_to: Option<DriverId>) -> Result<DriverId> {
    if let Some(own) = session.driver_id() {
        return match assign_to {
            Some(other) if other != own => Err(LogisticsError::Forbidden(
                "drivers can only accept for themselves".to_string(),
            )),
            _ => Ok(own),
        };
    }
    if session.is_admin() {
        return assign_to.ok_or_else(|| {
            LogisticsError::DriverRequired("admin acceptance needs a driver to assign".to_string())
        });
    }
    Err(LogisticsError::Forbidden(format!(
        "{} cannot accept shipments",
        session.role
    )))
}

/// The record's assigned driver, checked against the acting session
fn ensure_assigned(
    session: &SessionContext,
    assigned: Option<DriverId>,
    record: impl std::fmt::Display,
) -> Result<DriverId> {
    let assigned = assigned.ok_or_else(|| LogisticsError::DriverRequired(record.to_string()))?;
    if session.is_admin() || session.driver_id() == Some(assigned) {
        Ok(assigned)
    } else {
        Err(LogisticsError::Forbidden(format!(
            "{record} is assigned to another driver"
        )))
    }
}

fn ensure_can_drive(session: &SessionContext) -> Result<()> {
    if session.can_drive() {
        Ok(())
    } else {
        Err(LogisticsError::Forbidden(format!(
            "{} cannot perform driver actions",
            session.role
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    #[test]
    fn test_resolve_driver() {
        let driver = DriverId::new();
        let session = SessionContext::driver(driver);
        assert_eq!(resolve_driver(&session, None).unwrap(), driver);
        assert!(matches!(
            resolve_driver(&session, Some(DriverId::new())),
            Err(LogisticsError::Forbidden(_))
        ));

        let admin = SessionContext::admin(Uuid::new_v4());
        assert_eq!(resolve_driver(&admin, Some(driver)).unwrap(), driver);
        assert!(matches!(
            resolve_driver(&admin, None),
            Err(LogisticsError::DriverRequired(_))
        ));

        let anon = SessionContext::anonymous("s");
        assert!(matches!(
            resolve_driver(&anon, Some(driver)),
            Err(LogisticsError::Forbidden(_))
        ));
    }

    #[test]
    fn test_ensure_assigned() {
        let driver = DriverId::new();
        assert!(ensure_assigned(&SessionContext::driver(driver), Some(driver), "s1").is_ok());
        assert!(matches!(
            ensure_assigned(&SessionContext::driver(DriverId::new()), Some(driver), "s1"),
            Err(LogisticsError::Forbidden(_))
        ));
        assert!(ensure_assigned(&SessionContext::admin(Uuid::new_v4()), Some(driver), "s1").is_ok());
        assert!(matches!(
            ensure_assigned(&SessionContext::admin(Uuid::new_v4()), None, "s1"),
            Err(LogisticsError::DriverRequired(_))
        ));
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let result = retry_on_conflict("test", || async move {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(LogisticsError::stale("shipment", "s1", "A", "B"))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let result: Result<()> = retry_on_conflict("test", || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(LogisticsError::invalid_state("shipment", "s1", "A", "B"))
        })
        .await;
        assert!(matches!(result, Err(LogisticsError::InvalidState { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
