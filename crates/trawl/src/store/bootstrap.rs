//! One-time store setup performed before the gateway starts serving

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::{AdminCommand, Mode, StoreDialer, StoreError};
use crate::classify::CapabilityRegistry;
use crate::config::StoreConfig;

/// Poll interval while waiting for the store port to open
pub const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Wait until `addr` accepts TCP connections, polling every `interval`,
/// giving up after `deadline`.
pub async fn wait_for_store(
    addr: &str,
    interval: Duration,
    deadline: Duration,
) -> Result<(), StoreError> {
    let started = Instant::now();
    loop {
        match TcpStream::connect(addr).await {
            Ok(_) => {
                info!(addr = %addr, waited_ms = started.elapsed().as_millis() as u64, "Entry store is up");
                return Ok(());
            }
            Err(e) if started.elapsed() >= deadline => {
                return Err(StoreError::Connect {
                    addr: addr.to_string(),
                    reason: format!("not reachable after {deadline:?}: {e}"),
                });
            }
            Err(_) => tokio::time::sleep(interval).await,
        }
    }
}

/// Apply the size limit, register every capability's macros and set the
/// insertion filter.
///
/// Limit and macro failures abort startup; a rejected insertion filter is
/// only logged so a bad filter never blocks capture.
pub async fn configure(
    dialer: &dyn StoreDialer,
    registry: &CapabilityRegistry,
    config: &StoreConfig,
) -> Result<(), StoreError> {
    let mut connection = dialer.dial().await?;

    let result = async {
        connection.set_mode(Mode::Query).await?;

        connection
            .admin(AdminCommand::Limit(config.size_limit_bytes))
            .await?;
        info!(bytes = config.size_limit_bytes, "Store size limit applied");

        for (name, expanded) in registry.macros() {
            connection
                .admin(AdminCommand::Macro {
                    name: name.clone(),
                    expanded,
                })
                .await?;
            info!(name = %name, "Registered query macro");
        }

        match connection
            .admin(AdminCommand::InsertionFilter(config.insertion_filter.clone()))
            .await
        {
            Ok(()) if config.insertion_filter.is_empty() => {}
            Ok(()) => info!(filter = %config.insertion_filter, "Insertion filter applied"),
            Err(StoreError::Rejected(reason)) => {
                error!(filter = %config.insertion_filter, error = %reason, "Store rejected insertion filter")
            }
            Err(e) => warn!(error = %e, "Failed to set insertion filter"),
        }

        Ok::<(), StoreError>(())
    }
    .await;

    connection.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_for_store_succeeds_once_listening() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        wait_for_store(&addr, Duration::from_millis(10), Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_store_gives_up_after_deadline() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let started = std::time::Instant::now();
        let err = wait_for_store(&addr, Duration::from_millis(20), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Connect { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_configure_registers_limit_macros_and_filter() {
        let store = Arc::new(MockStore::new());
        let registry = CapabilityRegistry::with_defaults();
        let config = StoreConfig {
            insertion_filter: "http".to_string(),
            ..StoreConfig::default()
        };

        configure(store.as_ref(), &registry, &config).await.unwrap();

        let admin = store.admin_log();
        assert_eq!(admin[0], AdminCommand::Limit(config.size_limit_bytes));
        let macros = admin
            .iter()
            .filter(|c| matches!(c, AdminCommand::Macro { .. }))
            .count();
        assert_eq!(macros, registry.macros().len());
        assert_eq!(
            admin.last(),
            Some(&AdminCommand::InsertionFilter("http".to_string()))
        );
        assert_eq!(store.closed_connections(), 1);
    }

    #[tokio::test]
    async fn test_rejected_insertion_filter_is_not_fatal() {
        let store = Arc::new(MockStore::new());
        store.reject_insertion_filter("unknown field");
        let registry = CapabilityRegistry::with_defaults();

        let result = configure(store.as_ref(), &registry, &StoreConfig::default()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_configure_fails_when_store_is_down() {
        let store = Arc::new(MockStore::new());
        store.set_available(false);
        let registry = CapabilityRegistry::with_defaults();

        let err = configure(store.as_ref(), &registry, &StoreConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_refused_mode_still_closes_connection() {
        let store = Arc::new(MockStore::new());
        store.reject_modes("mode unsupported");
        let registry = CapabilityRegistry::with_defaults();

        let err = configure(store.as_ref(), &registry, &StoreConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Mode { .. }));
        assert!(store.admin_log().is_empty());
        assert_eq!(store.closed_connections(), 1);
    }
}
