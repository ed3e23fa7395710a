//! Scripted collaborators shared by the unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use drivestash_common::config::DEFAULT_CLIENT_ID;
use drivestash_common::DriveConfig;

use crate::client::DriveClient;
use crate::executor::RequestExecutor;
use crate::runtime::{Clock, ResolverSwitch};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, NetworkFailure};

pub const AUTH_HEADER: &str = "authorization";

/// The instant every test clock starts at.
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// A stored record with a bearer token valid well past [`fixed_now`].
pub fn valid_record() -> Value {
    json!({
        "access_token": "valid-token",
        "refresh_token": "refresh-token",
        "client_id": DEFAULT_CLIENT_ID,
        "token_expiry": "2030-01-01T00:00:00Z",
    })
}

enum Scripted {
    Response {
        status: u16,
        headers: HeaderMap,
        body: Bytes,
    },
    Failure(NetworkFailure),
}

/// Transport replaying queued responses in order and recording requests.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<HttpRequest>>,
    latency: Mutex<Option<(Arc<ManualClock>, Duration)>>,
}

impl ScriptedTransport {
    pub fn push_response(&self, status: u16, headers: &[(&str, &str)], body: impl Into<Bytes>) {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        self.script.lock().unwrap().push_back(Scripted::Response {
            status,
            headers: map,
            body: body.into(),
        });
    }

    pub fn push_json(&self, status: u16, body: Value) {
        self.push_response(status, &[], body.to_string());
    }

    pub fn push_status(&self, status: u16) {
        self.push_response(status, &[], Bytes::new());
    }

    pub fn push_failure(&self, failure: NetworkFailure) {
        self.script.lock().unwrap().push_back(Scripted::Failure(failure));
    }

    /// Advance `clock` by `per_request` on every send.
    pub fn set_latency(&self, clock: Arc<ManualClock>, per_request: Duration) {
        *self.latency.lock().unwrap() = Some((clock, per_request));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, NetworkFailure> {
        if let Some((clock, step)) = self.latency.lock().unwrap().as_ref() {
            clock.advance(*step);
        }
        let url = request.url.clone();
        self.requests.lock().unwrap().push(request);

        match self.script.lock().unwrap().pop_front() {
            Some(Scripted::Response {
                status,
                headers,
                body,
            }) => Ok(HttpResponse::from_bytes(status, headers, body)),
            Some(Scripted::Failure(failure)) => Err(failure),
            None => panic!("unscripted request to {}", url),
        }
    }
}

/// Clock that only moves when told to; sleeps are recorded and advance it.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(by).unwrap();
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
        self.advance(duration);
    }
}

#[derive(Default)]
pub struct CountingResolver {
    toggles: AtomicUsize,
}

impl CountingResolver {
    pub fn toggles(&self) -> usize {
        self.toggles.load(Ordering::SeqCst)
    }
}

impl ResolverSwitch for CountingResolver {
    fn toggle(&self) {
        self.toggles.fetch_add(1, Ordering::SeqCst);
    }
}

/// Config, scripted collaborators and a temporary credentials file.
pub struct TestHarness {
    pub dir: TempDir,
    pub config: DriveConfig,
    pub transport: Arc<ScriptedTransport>,
    pub clock: Arc<ManualClock>,
    pub resolver: Arc<CountingResolver>,
    executor: RequestExecutor,
}

impl TestHarness {
    /// Harness holding valid default-client credentials.
    pub fn new() -> Self {
        Self::with_credentials(Some(&valid_record().to_string()))
    }

    /// Harness whose credentials file holds `contents`, or is absent.
    pub fn with_credentials(contents: Option<&str>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        if let Some(contents) = contents {
            std::fs::write(&path, contents).unwrap();
        }

        let mut config = DriveConfig::default()
            .with_drive_url("http://drive.test")
            .with_token_url("http://drive.test/token")
            .with_refresh_url("http://refresh.test/refresh")
            .with_credentials_path(path);
        config.client_identifier = "test-client".to_string();

        let transport = Arc::new(ScriptedTransport::default());
        let clock = Arc::new(ManualClock::new(fixed_now()));
        let resolver = Arc::new(CountingResolver::default());
        let executor = RequestExecutor::new(
            config.clone(),
            transport.clone(),
            clock.clone(),
            resolver.clone(),
        );

        Self {
            dir,
            config,
            transport,
            clock,
            resolver,
            executor,
        }
    }

    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    /// A client over the same collaborators and credentials file.
    pub fn client(&self) -> DriveClient {
        DriveClient::with_parts(
            self.config.clone(),
            self.transport.clone(),
            self.clock.clone(),
            self.resolver.clone(),
        )
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.config.credentials_path.clone()
    }
}
