//! Shared helpers for unit tests.
use wiremock::{Mock, MockServer, Request};

/// A wiremock server driven from synchronous tests.
///
/// The blocking HTTP client must not run inside an async context, so the server's async API is
/// wrapped in `block_on` calls and tests stay on a plain thread.
pub(crate) struct StubServer {
    runtime: tokio::runtime::Runtime,
    server: MockServer,
}

impl StubServer {
    pub(crate) fn start() -> StubServer {
        init_logger();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let server = runtime.block_on(MockServer::start());
        StubServer { runtime, server }
    }

    pub(crate) fn mount(&self, mock: Mock) {
        self.runtime.block_on(mock.mount(&self.server));
    }

    pub(crate) fn uri(&self) -> String {
        self.server.uri()
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.server.uri(), path)
    }

    pub(crate) fn received_requests(&self) -> Vec<Request> {
        self.runtime
            .block_on(self.server.received_requests())
            .unwrap_or_default()
    }
}

/// Route `log` records to the test harness output. Safe to call from every test.
pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
