mod common;

use async_trait::async_trait;
use common::{coordinator_with, header_config, keyed_request, CountingHandler};
use idempotent_request::error::{AppError, Result};
use idempotent_request::idempotency::{RequestFacade, RequestState, StorageBackend};
use mockall::mock;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

mock! {
    pub Storage {}

    #[async_trait]
    impl StorageBackend for Storage {
        async fn conditional_set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<bool>;
        async fn get(&self, key: &str) -> Result<Option<String>>;
        async fn delete(&self, key: &str) -> Result<()>;
    }
}

const RESULT_KEY: &str = "idempotency_keys:abc";
const LOCK_KEY: &str = "idempotency_keys:lock:abc";

fn unavailable() -> AppError {
    AppError::StorageUnavailable("connection refused".to_string())
}

#[tokio::test]
async fn test_read_failure_propagates_without_running_handler() {
    let mut storage = MockStorage::new();
    storage
        .expect_get()
        .withf(|key| key == RESULT_KEY)
        .times(1)
        .returning(|_| Err(unavailable()));
    storage.expect_conditional_set().never();
    storage.expect_delete().never();

    let coordinator = coordinator_with(Arc::new(storage), header_config());
    let handler = CountingHandler::new();

    let result = coordinator.process(&mut keyed_request("abc"), || handler.ok()).await;

    let error = assert_err!(result);
    assert!(error.is_storage_error());
    assert_eq!(handler.calls(), 0);
}

#[tokio::test]
async fn test_lock_failure_propagates_without_running_handler() {
    let mut storage = MockStorage::new();
    storage.expect_get().returning(|_| Ok(None));
    storage
        .expect_conditional_set()
        .withf(|key, _, ttl| key == LOCK_KEY && *ttl == Some(1_209_600))
        .times(1)
        .returning(|_, _, _| Err(unavailable()));
    storage.expect_delete().never();

    let coordinator = coordinator_with(Arc::new(storage), header_config());
    let handler = CountingHandler::new();

    let result = coordinator.process(&mut keyed_request("abc"), || handler.ok()).await;

    assert!(matches!(result, Err(AppError::StorageUnavailable(_))));
    assert_eq!(handler.calls(), 0);
}

#[tokio::test]
async fn test_result_write_failure_still_releases_lock() {
    let mut storage = MockStorage::new();
    storage.expect_get().returning(|_| Ok(None));
    storage
        .expect_conditional_set()
        .withf(|key, _, _| key == LOCK_KEY)
        .times(1)
        .returning(|_, _, _| Ok(true));
    storage
        .expect_conditional_set()
        .withf(|key, _, _| key == RESULT_KEY)
        .times(1)
        .returning(|_, _, _| Err(unavailable()));
    storage
        .expect_delete()
        .withf(|key| key == LOCK_KEY)
        .times(1)
        .returning(|_| Ok(()));

    let coordinator = coordinator_with(Arc::new(storage), header_config());
    let handler = CountingHandler::new();
    let mut request = keyed_request("abc");

    let result = coordinator.process(&mut request, || handler.ok()).await;

    assert!(matches!(result, Err(AppError::StorageUnavailable(_))));
    assert_eq!(handler.calls(), 1);
    assert_eq!(request.annotations().lock_released, Some(true));
}

#[tokio::test]
async fn test_handler_failure_releases_lock_without_storing() {
    let mut storage = MockStorage::new();
    storage.expect_get().returning(|_| Ok(None));
    storage
        .expect_conditional_set()
        .withf(|key, _, _| key == LOCK_KEY)
        .times(1)
        .returning(|_, _, _| Ok(true));
    storage
        .expect_delete()
        .withf(|key| key == LOCK_KEY)
        .times(1)
        .returning(|_| Ok(()));

    let coordinator = coordinator_with(Arc::new(storage), header_config());
    let handler = CountingHandler::new();

    let result = coordinator.process(&mut keyed_request("abc"), || handler.fail()).await;

    assert!(matches!(result, Err(AppError::Handler(_))));
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn test_unlock_failure_does_not_mask_response() {
    let mut storage = MockStorage::new();
    storage.expect_get().returning(|_| Ok(None));
    storage
        .expect_conditional_set()
        .times(2)
        .returning(|_, _, _| Ok(true));
    storage
        .expect_delete()
        .withf(|key| key == LOCK_KEY)
        .times(1)
        .returning(|_| Err(unavailable()));

    let coordinator = coordinator_with(Arc::new(storage), header_config());
    let handler = CountingHandler::new();
    let mut request = keyed_request("abc");

    let outcome = assert_ok!(coordinator.process(&mut request, || handler.ok()).await);

    assert_eq!(outcome.state, RequestState::LockAcquired);
    assert_eq!(outcome.response.body_str(), Some("ok"));
    assert_eq!(request.annotations().lock_released, Some(false));
}

#[tokio::test]
async fn test_result_entry_conflict_keeps_response() {
    let mut storage = MockStorage::new();
    storage.expect_get().returning(|_| Ok(None));
    storage
        .expect_conditional_set()
        .withf(|key, _, _| key == LOCK_KEY)
        .returning(|_, _, _| Ok(true));
    storage
        .expect_conditional_set()
        .withf(|key, _, _| key == RESULT_KEY)
        .returning(|_, _, _| Ok(false));
    storage.expect_delete().times(1).returning(|_| Ok(()));

    let coordinator = coordinator_with(Arc::new(storage), header_config());
    let handler = CountingHandler::new();

    let outcome = assert_ok!(coordinator.process(&mut keyed_request("abc"), || handler.ok()).await);

    assert_eq!(outcome.state, RequestState::LockAcquired);
    assert_eq!(outcome.response.status, 200);
}
