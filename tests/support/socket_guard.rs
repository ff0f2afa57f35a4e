//! Mock-server startup that tolerates sandboxes without loopback sockets.
//!
//! Setting `MEDIA_RELAY_REQUIRE_SOCKET_TESTS=1` turns the skip into a failure,
//! so CI cannot silently pass without exercising the network tests.

use std::net::TcpListener;
use std::panic::Location;

use wiremock::MockServer;

const REQUIRE_VAR: &str = "MEDIA_RELAY_REQUIRE_SOCKET_TESTS";

fn sockets_required() -> bool {
    std::env::var(REQUIRE_VAR)
        .map(|value| {
            let value = value.trim().to_ascii_lowercase();
            value == "1" || value == "true" || value == "yes"
        })
        .unwrap_or(false)
}

fn skip(caller: &Location<'_>) {
    let reason = format!("no loopback socket available for test at {caller}");
    assert!(!sockets_required(), "{reason} ({REQUIRE_VAR} is set)");
    eprintln!("skipping: {reason}; set {REQUIRE_VAR}=1 to fail instead");
}

/// Starts a wiremock server, or returns `None` when localhost cannot be bound.
#[track_caller]
pub fn start_mock_server_or_skip() -> impl Future<Output = Option<MockServer>> {
    let caller = Location::caller();
    let loopback = TcpListener::bind("127.0.0.1:0").is_ok();

    async move {
        if loopback {
            return Some(MockServer::start().await);
        }
        skip(caller);
        None
    }
}

/// Binds a raw loopback listener for hand-written origins, with the same
/// skip rules as [`start_mock_server_or_skip`].
#[track_caller]
pub fn bind_loopback_or_skip() -> impl Future<Output = Option<tokio::net::TcpListener>> {
    let caller = Location::caller();

    async move {
        match tokio::net::TcpListener::bind("127.0.0.1:0").await {
            Ok(listener) => Some(listener),
            Err(_) => {
                skip(caller);
                None
            }
        }
    }
}
