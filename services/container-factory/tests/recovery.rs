//! Re-deriving local state from the remote service, and authentication.


use std::time::Duration;

use harness::{component_for, create_on, fast_config, Harness, NODEJS, PYTHON, SERVICE};
use yarnpool_factory::client::{ComponentSpec, ResourceManager};
use yarnpool_factory::{
    AuthMode, ContainerFactory, FactoryError, RemoteError, ResourceManagerClient,
    ServiceLifecycle, TransactionId,
};
use yarnpool_testing::{MockAuth, MockConfig, MockOperation, MockResourceManager};

#[tokio::test]
async fn restarted_factory_recovers_containers() {
    let h = Harness::ready().await;
    h.create(NODEJS).await.unwrap();
    h.create(NODEJS).await.unwrap();
    h.create(PYTHON).await.unwrap();

    let restarted = h.restarted_factory();
    restarted.init().await.unwrap();

    let mut recovered = restarted.recover_containers().await.unwrap();
    assert_eq!(recovered.len(), 3);
    let nodejs = recovered
        .iter()
        .filter(|c| c.component().as_str() == component_for(NODEJS))
        .count();
    assert_eq!(nodejs, 2);
    assert!(restarted.recover_containers().await.unwrap().is_empty());

    for handle in &mut recovered {
        handle.destroy(&TransactionId::new()).await.unwrap();
    }
    assert_eq!(h.remote_counts(NODEJS), Some((0, 0)));
    assert_eq!(h.remote_counts(PYTHON), Some((0, 0)));
}

#[tokio::test]
async fn recover_requires_stable_service() {
    let h = Harness::start().await;

    let err = h.factory.recover_containers().await.unwrap_err();

    assert!(matches!(
        err,
        FactoryError::InvalidState {
            state: ServiceLifecycle::Absent,
            ..
        }
    ));
}

#[tokio::test]
async fn resync_picks_up_external_changes() {
    let h = Harness::ready().await;
    h.create(NODEJS).await.unwrap();

    let rm = ResourceManagerClient::new(&fast_config(&h.mock)).unwrap();
    rm.flex_component(SERVICE, &ComponentSpec::flex(component_for(NODEJS), 3))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = h.factory.resync().await.unwrap();
    let entry = snapshot.component(&component_for(NODEJS)).unwrap();
    assert_eq!((entry.desired, entry.running, entry.bound), (3, 3, 1));

    assert_eq!(h.factory.recover_containers().await.unwrap().len(), 2);
}

#[tokio::test]
async fn resync_notices_deleted_service() {
    let h = Harness::ready().await;
    let mut handle = h.create(NODEJS).await.unwrap();

    let rm = ResourceManagerClient::new(&fast_config(&h.mock)).unwrap();
    rm.delete_service(SERVICE).await.unwrap();

    let snapshot = h.factory.resync().await.unwrap();
    assert!(snapshot.is_empty());
    assert_eq!(h.factory.lifecycle(), ServiceLifecycle::Absent);

    assert!(matches!(
        h.create(NODEJS).await.unwrap_err(),
        FactoryError::InvalidState { .. }
    ));
    assert!(matches!(
        handle.destroy(&TransactionId::new()).await.unwrap_err(),
        FactoryError::InvariantViolation(_)
    ));
}

#[tokio::test]
async fn malformed_status_fails_create_without_rollback() {
    let h = Harness::ready().await;
    h.mock.garble_next(MockOperation::GetService);

    let err = h.create(NODEJS).await.unwrap_err();
    assert!(matches!(
        err,
        FactoryError::Unconfirmed {
            source: RemoteError::Malformed { .. },
            ..
        }
    ));
    assert!(err.is_indeterminate());

    // The flex was accepted; the container shows up and can be adopted.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let snapshot = h.factory.resync().await.unwrap();
    assert_eq!(snapshot.component(&component_for(NODEJS)).unwrap().desired, 1);
    assert_eq!(h.factory.recover_containers().await.unwrap().len(), 1);
}

#[tokio::test]
async fn transport_failure_is_indeterminate() {
    let h = Harness::ready().await;
    let mut config = fast_config(&h.mock);
    config.resource_manager_url = "http://127.0.0.1:1/app/v1".to_string();
    let unreachable = ContainerFactory::new(config).unwrap();

    let err = unreachable.init().await.unwrap_err();

    assert!(matches!(
        err,
        FactoryError::Remote(RemoteError::Transport { .. })
    ));
    assert!(err.is_indeterminate());
}

#[tokio::test]
async fn simple_auth_user_on_every_request() {
    let h = Harness::start_with(
        MockConfig {
            auth: MockAuth::Simple {
                user: "whisk".to_string(),
            },
            ..Default::default()
        },
        |_| {},
    )
    .await;
    h.factory.init().await.unwrap();
    let mut handle = h.create(NODEJS).await.unwrap();
    handle.destroy(&TransactionId::new()).await.unwrap();
    h.factory.cleanup().await.unwrap();

    let requests = h.mock.requests();
    assert!(requests.iter().any(|r| r.method == "DELETE"));
    assert!(requests
        .iter()
        .all(|r| r.user.as_deref() == Some("whisk") && r.authorization.is_none()));
}

#[tokio::test]
async fn kerberos_token_on_every_request() {
    let mock = MockResourceManager::spawn(MockConfig {
        auth: MockAuth::Negotiate {
            token: "YIIGdgYJKoZIhvcSAQICAQBuggZl".to_string(),
        },
        ..Default::default()
    })
    .await
    .unwrap();
    let mut config = fast_config(&mock);
    config.auth = AuthMode::Kerberos {
        token: "YIIGdgYJKoZIhvcSAQICAQBuggZl".to_string(),
    };
    let factory = ContainerFactory::new(config).unwrap();

    factory.init().await.unwrap();
    create_on(&factory, NODEJS).await.unwrap();

    let requests = mock.requests();
    assert!(requests.len() >= 3);
    assert!(requests.iter().all(|r| {
        r.authorization.as_deref() == Some("Negotiate YIIGdgYJKoZIhvcSAQICAQBuggZl")
            && r.user.is_none()
    }));
}

#[tokio::test]
async fn wrong_credentials_are_rejected() {
    let mock = MockResourceManager::spawn(MockConfig {
        auth: MockAuth::Negotiate {
            token: "expected".to_string(),
        },
        ..Default::default()
    })
    .await
    .unwrap();
    let mut config = fast_config(&mock);
    config.auth = AuthMode::Kerberos {
        token: "stale".to_string(),
    };
    let factory = ContainerFactory::new(config).unwrap();

    let err = factory.init().await.unwrap_err();

    assert!(matches!(
        err,
        FactoryError::Remote(RemoteError::Rejected { status: 401, .. })
    ));
    assert_eq!(factory.lifecycle(), ServiceLifecycle::Creating);
}

#[tokio::test]
async fn shutdown_stops_orchestrator() {
    let h = Harness::ready().await;
    h.factory.shutdown().await;

    assert!(matches!(
        h.create(NODEJS).await.unwrap_err(),
        FactoryError::OrchestratorStopped
    ));
    assert!(h.mock.service_exists(SERVICE));
}
