mod common;

use std::sync::Arc;
use std::time::Duration;

use sshpool::{CacheConfig, ConnectionCache, EndpointKey, SshClientSession, SshError, SshSession};

fn test_cache(close_timeout: Duration) -> Arc<ConnectionCache> {
    Arc::new(ConnectionCache::new(
        "test cache",
        CacheConfig {
            close_timeout,
            max_channels: 8,
        },
    ))
}

fn endpoint(port: u16) -> EndpointKey {
    EndpointKey {
        host: "127.0.0.1".to_owned(),
        port,
        username: common::USERNAME.to_owned(),
        proxy_command: None,
    }
}

#[tokio::test]
async fn open_then_close_leaves_pending_deferred_close() {
    let (mut server, _controller) = common::start_server().await;
    let cache = test_cache(Duration::from_millis(200));
    let options = common::target(server.port());
    let key = endpoint(server.port());

    let mut session = SshSession::connect(&options, Some(cache.clone()))
        .await
        .expect("session must open");

    let stats = cache.stats();
    assert_eq!(stats.entry_count(&key), 1);
    assert_eq!(stats.session_count(&key), 1);
    assert_eq!(stats.pending_closes, 0);

    session.close().await;

    let stats = cache.stats();
    assert_eq!(stats.entry_count(&key), 1);
    assert_eq!(stats.session_count(&key), 0);
    assert_eq!(stats.pending_closes, 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    let stats = cache.stats();
    assert!(stats.is_empty());
    assert_eq!(stats.pending_closes, 0);

    server.close();
    server.join().await;
}

#[tokio::test]
async fn reuse_cancels_the_deferred_close() {
    let (mut server, _controller) = common::start_server().await;
    let cache = test_cache(Duration::from_secs(5));
    let options = common::target(server.port());
    let key = endpoint(server.port());

    let mut first = SshSession::connect(&options, Some(cache.clone()))
        .await
        .expect("session must open");
    first.close().await;
    assert_eq!(cache.stats().pending_closes, 1);

    // Re-borrowing the idle transport must cancel its close and not dial.
    let mut second = SshSession::connect(&options, Some(cache.clone()))
        .await
        .expect("reuse must succeed");
    let stats = cache.stats();
    assert_eq!(stats.pending_closes, 0);
    assert_eq!(stats.entry_count(&key), 1);
    assert_eq!(stats.session_count(&key), 1);

    second.close().await;
    cache.flush().await;
    server.close();
    server.join().await;
}

#[tokio::test]
async fn transports_fill_up_to_max_channels() {
    let (mut server, _controller) = common::start_server().await;
    let cache = test_cache(Duration::from_millis(200));
    let options = common::target(server.port());
    let key = endpoint(server.port());

    let mut sessions = Vec::new();
    for _ in 0..25 {
        sessions.push(
            SshSession::connect(&options, Some(cache.clone()))
                .await
                .expect("session must open"),
        );
    }

    // ceil(25 / 8) transports, refcounts summing to the live sessions.
    let stats = cache.stats();
    assert_eq!(stats.entry_count(&key), 4);
    assert_eq!(stats.session_count(&key), 25);
    let counts = &stats.entries[&key];
    assert!(counts.iter().all(|&c| c <= 8));

    for mut session in sessions {
        session.close().await;
    }
    let stats = cache.stats();
    assert_eq!(stats.session_count(&key), 0);
    assert_eq!(stats.pending_closes, 4);

    // Past the close timeout every idle transport is gone.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let stats = cache.stats();
    assert!(stats.is_empty());
    assert_eq!(stats.pending_closes, 0);

    server.close();
    server.join().await;
}

#[tokio::test]
async fn smaller_channel_cap_spreads_sessions() {
    let (mut server, _controller) = common::start_server().await;
    let cache = test_cache(Duration::from_secs(5));
    cache.set_max_channels(2);
    let options = common::target(server.port());
    let key = endpoint(server.port());

    let mut sessions = Vec::new();
    for _ in 0..5 {
        sessions.push(
            SshSession::connect(&options, Some(cache.clone()))
                .await
                .expect("session must open"),
        );
    }
    assert_eq!(cache.stats().entry_count(&key), 3);

    for mut session in sessions {
        session.close().await;
    }
    cache.flush().await;
    server.close();
    server.join().await;
}

#[tokio::test]
async fn close_is_idempotent() {
    let (mut server, _controller) = common::start_server().await;
    let cache = test_cache(Duration::from_secs(5));
    let options = common::target(server.port());
    let key = endpoint(server.port());

    let mut session = SshSession::connect(&options, Some(cache.clone()))
        .await
        .expect("session must open");
    session.close().await;
    session.close().await;
    session.close().await;

    // Only the first close released the transport.
    let stats = cache.stats();
    assert_eq!(stats.session_count(&key), 0);
    assert_eq!(stats.pending_closes, 1);
    assert!(!session.is_active());

    cache.flush().await;
    server.close();
    server.join().await;
}

#[tokio::test]
async fn uncached_mode_pools_nothing() {
    let (mut server, _controller) = common::start_server().await;
    let cache = Arc::new(ConnectionCache::uncached("no cache"));
    let options = common::target(server.port());

    let mut session = SshSession::connect(&options, Some(cache.clone()))
        .await
        .expect("session must open");
    assert!(cache.stats().is_empty());
    assert!(session.is_active());

    session.close().await;
    assert!(cache.stats().is_empty());

    server.close();
    server.join().await;
}

#[tokio::test]
async fn flush_empties_the_pool_with_sessions_outstanding() {
    let (mut server, _controller) = common::start_server().await;
    let cache = test_cache(Duration::from_secs(5));
    let options = common::target(server.port());

    let mut session = SshSession::connect(&options, Some(cache.clone()))
        .await
        .expect("session must open");

    cache.flush().await;
    let stats = cache.stats();
    assert!(stats.is_empty());
    assert_eq!(stats.pending_closes, 0);

    // Releasing after the flush must not re-create an entry.
    session.close().await;
    assert!(cache.stats().is_empty());

    server.close();
    server.join().await;
}

#[tokio::test]
async fn wrong_password_surfaces_auth_error() {
    let (mut server, _controller) = common::start_server().await;
    let cache = test_cache(Duration::from_secs(5));
    let mut options = common::target(server.port());
    options.auth = sshpool::SshAuthMethod::Password {
        password: "not-the-password".into(),
    };

    let error = SshSession::connect(&options, Some(cache.clone()))
        .await
        .expect_err("auth must fail");
    assert!(matches!(error, SshError::Auth { .. }), "got {error:?}");
    assert!(cache.stats().is_empty());

    server.close();
    server.join().await;
}

#[tokio::test]
async fn refused_subsystem_releases_the_transport() {
    let (mut server, _controller) = common::start_server().await;
    let cache = test_cache(Duration::from_millis(200));
    let options = common::target(server.port());
    let key = endpoint(server.port());

    let error = SshClientSession::connect(&options, "sftp", Some(cache.clone()))
        .await
        .expect_err("sftp is not allowed by the controller");
    assert!(
        matches!(error, SshError::RequestDenied { .. }),
        "got {error:?}"
    );

    // The transport went back to the pool and is idle.
    let stats = cache.stats();
    assert_eq!(stats.session_count(&key), 0);
    assert_eq!(stats.pending_closes, 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(cache.stats().is_empty());

    server.close();
    server.join().await;
}
