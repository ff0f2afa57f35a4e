//! Helpers shared by unit tests.

use std::net::TcpListener;

use wiremock::MockServer;

/// Whether socket-bound tests must run instead of being skipped.
fn socket_tests_required() -> bool {
    std::env::var("MEDIA_RELAY_REQUIRE_SOCKET_TESTS")
        .ok()
        .is_some_and(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

/// Starts a wiremock server, or returns `None` when localhost sockets are unavailable.
#[track_caller]
pub(crate) fn start_mock_server_or_skip() -> impl std::future::Future<Output = Option<MockServer>> {
    let location = std::panic::Location::caller();
    let can_bind = TcpListener::bind("127.0.0.1:0").is_ok();
    async move {
        if can_bind {
            return Some(MockServer::start().await);
        }
        let message = format!(
            "[socket-bound-test] cannot bind localhost socket at {}:{}",
            location.file(),
            location.line()
        );
        assert!(
            !socket_tests_required(),
            "{message}. Set MEDIA_RELAY_REQUIRE_SOCKET_TESTS=0 to allow skipping."
        );
        eprintln!("{message}. Skipping test.");
        None
    }
}
