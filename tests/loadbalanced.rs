use std::sync::Arc;
use std::time::Duration;

use mongodb_sdam::address::{ClusterId, ServiceId};
use mongodb_sdam::clusterdescription::ClusterType;
use mongodb_sdam::connectionpool::{ConnectionPool, ExclusiveConnectionPoolFactory};
use mongodb_sdam::error::Error;
use mongodb_sdam::operationcontext::OperationContext;
use mongodb_sdam::options::{ConnectionPoolSettings, ServerMonitorSettings, ServerSettings};
use mongodb_sdam::server::Server;
use mongodb_sdam::serverdescription::{ServerState, ServerType};
use mongodb_sdam::serverfactory::{DefaultServerMonitorFactory, ServerFactory};

use crate::common::{
    deadline, end_point, load_balanced_hello, try_until, MockConnectionFactory, OpenScript,
    RecordingSubscriber,
};

mod common;

fn create_server(connections: &MockConnectionFactory, subscriber: &Arc<RecordingSubscriber>) -> Server {
    let pool_factory = ExclusiveConnectionPoolFactory::new(
        ConnectionPoolSettings::new().load_balanced(true),
        Arc::new(connections.clone()),
        Some(subscriber.clone()),
    );
    let monitor_factory =
        DefaultServerMonitorFactory::new(ServerMonitorSettings::new(), Arc::new(connections.clone()));

    let factory = ServerFactory::new(
        ServerSettings::new().load_balanced(true),
        Arc::new(pool_factory),
        Arc::new(monitor_factory),
        Some(subscriber.clone()),
    );
    factory.create_server(
        ClusterType::LoadBalanced,
        &ClusterId::from_value("lb-cluster"),
        &end_point(),
    )
}

#[tokio::test]
async fn starts_connected_without_a_monitor() {
    let _ = env_logger::try_init();

    let service = ServiceId::new("service-a");
    let connections = MockConnectionFactory::new(load_balanced_hello(&service));
    let subscriber = RecordingSubscriber::new();
    let server = create_server(&connections, &subscriber);
    assert!(server.is_load_balanced());
    let mut changes = server.subscribe();

    server.initialize();
    server.initialize();

    let description = server.description();
    assert_eq!(ServerType::LoadBalanced, description.server_type);
    assert_eq!(ServerState::Connected, description.state);
    assert_eq!("Initialized", description.reason_changed);
    assert_eq!(1, subscriber.count("ServerDescriptionChanged"));
    assert_eq!(1, subscriber.count("ConnectionPoolReady"));

    let event = changes.try_recv().unwrap();
    assert_eq!(ServerType::LoadBalanced, event.new_description.server_type);
    assert!(changes.try_recv().is_err());

    // No monitor, so nothing was opened yet.
    assert_eq!(0, connections.created());

    server.invalidate("ignored", None);
    server.request_heartbeat();
    assert_eq!(ServerType::LoadBalanced, server.description().server_type);
    assert_eq!(1, subscriber.count("ServerDescriptionChanged"));

    server.close().await;
}

#[tokio::test]
async fn handshake_failures_only_clear_the_failing_service() {
    let _ = env_logger::try_init();

    let service_a = ServiceId::new("service-a");
    let service_b = ServiceId::new("service-b");
    let connections = MockConnectionFactory::new(load_balanced_hello(&service_a));
    connections.push_open(OpenScript::Succeed(load_balanced_hello(&service_a)));
    connections.push_open(OpenScript::Succeed(load_balanced_hello(&service_b)));
    connections.push_open(OpenScript::Fail {
        hello: Some(load_balanced_hello(&service_a)),
        error: Error::new_authentication_error("bad credentials"),
    });

    let subscriber = RecordingSubscriber::new();
    let server = create_server(&connections, &subscriber);
    server.initialize();

    let ctx = OperationContext::infinite();
    let channel_a = server.get_connection(&ctx).await.unwrap();
    let channel_b = server.get_connection(&ctx).await.unwrap();
    assert_eq!(Some(service_a.clone()), channel_a.connection_info().service_id);
    assert_eq!(Some(service_b.clone()), channel_b.connection_info().service_id);

    let err = server.get_connection(&ctx).await.err().unwrap();
    assert!(err.is_authentication_error());
    assert_eq!(Some(&service_a), err.service_id());

    let pool = server.connection_pool();
    assert_eq!(1, pool.generation_for(Some(&service_a)));
    assert_eq!(0, pool.generation_for(Some(&service_b)));
    assert_eq!(0, pool.generation());
    assert_eq!(ServerType::LoadBalanced, server.description().server_type);

    let connection_a = connections.connections()[0].clone();
    drop(channel_a);
    drop(channel_b);

    // Service B's connection went back to the pool and is handed out again.
    let channel = server.get_connection(&ctx).await.unwrap();
    assert_eq!(Some(service_b), channel.connection_info().service_id);
    assert_eq!(3, connections.created());

    try_until(
        deadline(),
        Duration::from_millis(10),
        "stale service connection was never closed",
        || {
            let connection = connection_a.clone();
            async move {
                if connection.is_closed() {
                    Ok(Some(()))
                } else {
                    Ok(None)
                }
            }
        },
    )
    .await;

    drop(channel);
    server.close().await;
}

#[tokio::test]
async fn network_errors_clear_only_the_connection_service() {
    let _ = env_logger::try_init();

    let service_a = ServiceId::new("service-a");
    let service_b = ServiceId::new("service-b");
    let connections = MockConnectionFactory::new(load_balanced_hello(&service_a));
    connections.push_open(OpenScript::Succeed(load_balanced_hello(&service_a)));
    connections.push_open(OpenScript::Succeed(load_balanced_hello(&service_b)));

    let subscriber = RecordingSubscriber::new();
    let server = create_server(&connections, &subscriber);
    server.initialize();

    let ctx = OperationContext::infinite();
    let channel_a = server.get_connection(&ctx).await.unwrap();
    let channel_b = server.get_connection(&ctx).await.unwrap();

    let timeout = Error::new_connection_error("timed out", true, true);
    server.handle_channel_exception(&channel_b.connection_info(), &timeout);
    assert_eq!(0, server.connection_pool().generation_for(Some(&service_b)));

    let reset = Error::new_connection_error("connection reset", true, false);
    server.handle_channel_exception(&channel_b.connection_info(), &reset);
    assert_eq!(1, server.connection_pool().generation_for(Some(&service_b)));
    assert_eq!(0, server.connection_pool().generation_for(Some(&service_a)));
    assert_eq!(ServerType::LoadBalanced, server.description().server_type);

    // A second report from the same, now stale, connection changes nothing.
    server.handle_channel_exception(&channel_b.connection_info(), &reset);
    assert_eq!(1, server.connection_pool().generation_for(Some(&service_b)));

    drop(channel_a);
    drop(channel_b);
    server.close().await;
}
