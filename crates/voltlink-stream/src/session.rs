//! Reconnecting reader of the telemetry stream.
//!
//! A [`StreamSession`] hands out one decoded [`StreamRecord`] per call to
//! [`next_record`](StreamSession::next_record). When there is no live
//! connection it opens one, reusing the cached streaming credentials when
//! it has them and asking the [`Authenticator`] for new ones when the
//! server has rejected the old ones. Connection attempts are bounded; once
//! they run out, or the server answers with a failure that retrying cannot
//! fix, the session reports [`StreamError::GaveUp`], sits in
//! [`StreamSessionState::GivingUp`] and starts over from scratch on the
//! next call.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use voltlink_core::RateLimiter;

use crate::auth::{AuthContext, Authenticator};
use crate::config::Config;
use crate::error::{StreamError, TransportError};
use crate::fields::{FieldSet, StreamRecord};
use crate::transport::{HttpRequest, LineSource, Transport};

/// Observable state of a [`StreamSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSessionState {
    Disconnected,
    Authenticating,
    Connected,
    Reading,
    ReauthRequired,
    GivingUp,
}

impl fmt::Display for StreamSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Reading => "reading",
            Self::ReauthRequired => "reauth required",
            Self::GivingUp => "giving up",
        };
        f.write_str(name)
    }
}

/// Session state together with the data each state owns.
#[derive(Debug)]
enum Phase {
    Disconnected { cached: Option<AuthContext> },
    Authenticating,
    Connected { auth: AuthContext },
    Reading {
        auth: AuthContext,
        lines: Box<dyn LineSource>,
    },
    ReauthRequired,
    GivingUp,
}

impl Phase {
    fn state(&self) -> StreamSessionState {
        match self {
            Self::Disconnected { .. } => StreamSessionState::Disconnected,
            Self::Authenticating => StreamSessionState::Authenticating,
            Self::Connected { .. } => StreamSessionState::Connected,
            Self::Reading { .. } => StreamSessionState::Reading,
            Self::ReauthRequired => StreamSessionState::ReauthRequired,
            Self::GivingUp => StreamSessionState::GivingUp,
        }
    }

    fn into_auth(self) -> Option<AuthContext> {
        match self {
            Self::Disconnected { cached } => cached,
            Self::Connected { auth } | Self::Reading { auth, .. } => Some(auth),
            Self::Authenticating | Self::ReauthRequired | Self::GivingUp => None,
        }
    }
}

/// Connection tuning for a [`StreamSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Connection attempts per establish, reauthentications included.
    pub connect_attempts: usize,
    pub connect_retry_delay: Duration,
    /// A read that produces no line within this long yields no record.
    pub read_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_attempts: 5,
            connect_retry_delay: Duration::from_millis(500),
            read_timeout: Duration::from_secs(25),
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect_attempts: config.connect_attempts.max(1),
            connect_retry_delay: config.connect_retry_delay(),
            read_timeout: config.read_timeout(),
        }
    }
}

/// A reconnecting reader of one vehicle's telemetry stream.
#[derive(Debug)]
pub struct StreamSession {
    vehicle_id: String,
    stream_url: String,
    fields: FieldSet,
    transport: Arc<dyn Transport>,
    authenticator: Arc<dyn Authenticator>,
    limiter: Arc<RateLimiter>,
    settings: SessionSettings,
    shutdown: CancellationToken,
    phase: Phase,
}

impl StreamSession {
    /// Create a disconnected session for the vehicle with REST id
    /// `vehicle_id`, streaming the full field set from `stream_url`.
    pub fn new(
        vehicle_id: impl Into<String>,
        stream_url: impl Into<String>,
        transport: Arc<dyn Transport>,
        authenticator: Arc<dyn Authenticator>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            stream_url: stream_url.into().trim_end_matches('/').to_string(),
            fields: FieldSet::default(),
            transport,
            authenticator,
            limiter,
            settings: SessionSettings::default(),
            shutdown: CancellationToken::new(),
            phase: Phase::Disconnected { cached: None },
        }
    }

    #[must_use]
    pub fn with_fields(mut self, fields: FieldSet) -> Self {
        self.fields = fields;
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = SessionSettings {
            connect_attempts: settings.connect_attempts.max(1),
            ..settings
        };
        self
    }

    /// Stop waiting as soon as `token` is cancelled.
    #[must_use]
    pub fn with_shutdown(mut self, token: &CancellationToken) -> Self {
        self.shutdown = token.child_token();
        self
    }

    pub fn state(&self) -> StreamSessionState {
        self.phase.state()
    }

    /// Returns `true` while a stream is open.
    pub fn is_connected(&self) -> bool {
        matches!(self.phase, Phase::Reading { .. })
    }

    pub fn fields(&self) -> &FieldSet {
        &self.fields
    }

    pub fn vehicle_id(&self) -> &str {
        &self.vehicle_id
    }

    /// Read the next record, connecting first if needed.
    ///
    /// `Ok(None)` means no record this tick: the read timed out, the line
    /// was malformed, or the connection ended. The caller may simply call
    /// again.
    ///
    /// # Errors
    /// [`StreamError::GaveUp`] after every connection attempt failed (the
    /// session is reset), [`StreamError::Auth`] when no streaming token
    /// could be obtained, [`StreamError::Cancelled`] on shutdown.
    pub async fn next_record(&mut self) -> Result<Option<StreamRecord>, StreamError> {
        if !self.is_connected() {
            self.establish().await?;
        }
        self.read_record().await
    }

    /// Open a stream if none is open. Records are not read.
    ///
    /// # Errors
    /// Same as [`next_record`](Self::next_record).
    pub async fn connect(&mut self) -> Result<(), StreamError> {
        if self.is_connected() {
            return Ok(());
        }
        self.establish().await
    }

    /// Drop the live connection, keeping the streaming credentials.
    pub fn close(&mut self) {
        if self.is_connected() {
            log::info!("Closing stream for vehicle {}", self.vehicle_id);
        }
        let cached = std::mem::replace(&mut self.phase, Phase::Disconnected { cached: None })
            .into_auth();
        self.phase = Phase::Disconnected { cached };
    }

    fn stream_url(&self, auth: &AuthContext) -> String {
        format!(
            "{}/stream/{}/?values={}",
            self.stream_url,
            auth.streaming_vehicle_id,
            self.fields.query_values()
        )
    }

    async fn authenticate(&mut self) -> Result<AuthContext, StreamError> {
        self.phase = Phase::Authenticating;
        let outcome = cancellable(
            &self.shutdown,
            self.authenticator.reauthenticate(&self.vehicle_id),
        )
        .await;
        match outcome {
            Ok(Ok(auth)) => Ok(auth),
            Ok(Err(e)) => {
                log::warn!("Could not obtain streaming token: {}", e);
                self.phase = Phase::Disconnected { cached: None };
                Err(e.into())
            }
            Err(cancelled) => {
                self.phase = Phase::Disconnected { cached: None };
                Err(cancelled)
            }
        }
    }

    async fn establish(&mut self) -> Result<(), StreamError> {
        let attempts = self.settings.connect_attempts;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let auth = match std::mem::replace(&mut self.phase, Phase::Authenticating).into_auth()
            {
                Some(auth) => auth,
                None => self.authenticate().await?,
            };
            self.phase = Phase::Connected { auth: auth.clone() };

            let request =
                HttpRequest::get(self.stream_url(&auth)).authorization(auth.basic_authorization());
            cancellable(&self.shutdown, self.limiter.before_call(&request.url)).await?;
            let error = match cancellable(&self.shutdown, self.transport.open_lines(request)).await?
            {
                Ok(lines) => {
                    log::info!(
                        "Streaming vehicle {} (attempt {}/{})",
                        auth.streaming_vehicle_id,
                        attempt,
                        attempts
                    );
                    self.phase = Phase::Reading { auth, lines };
                    return Ok(());
                }
                Err(e) => e,
            };

            if error.is_auth_failure() {
                log::info!("Stream rejected credentials ({}), reauthenticating", error);
                self.phase = Phase::ReauthRequired;
            } else if error.is_transient() {
                log::debug!(
                    "Stream connect attempt {}/{} failed: {}",
                    attempt,
                    attempts,
                    error
                );
                self.phase = Phase::Disconnected { cached: Some(auth) };
            } else {
                return Err(self.give_up(attempt, error));
            }

            if attempt >= attempts {
                return Err(self.give_up(attempt, error));
            }
            cancellable(&self.shutdown, sleep(self.settings.connect_retry_delay)).await?;
        }
    }

    /// Credentials are dropped; the next call starts from scratch.
    fn give_up(&mut self, attempts: usize, last: TransportError) -> StreamError {
        log::warn!(
            "Giving up on stream for vehicle {} after {} attempts: {}",
            self.vehicle_id,
            attempts,
            last
        );
        self.phase = Phase::GivingUp;
        StreamError::GaveUp { attempts, last }
    }

    async fn read_record(&mut self) -> Result<Option<StreamRecord>, StreamError> {
        let Phase::Reading { lines, .. } = &mut self.phase else {
            return Ok(None);
        };

        let read = tokio::select! {
            () = self.shutdown.cancelled() => return Err(StreamError::Cancelled),
            read = timeout(self.settings.read_timeout, lines.next_line()) => read,
        };

        match read {
            Err(_) => {
                log::debug!("No stream data within {:?}", self.settings.read_timeout);
                Ok(None)
            }
            Ok(Ok(Some(line))) => match self.fields.decode(&line) {
                Ok(record) => Ok(Some(record)),
                Err(e) => {
                    log::error!("Malformed stream data {:?}: {}", line, e);
                    Ok(None)
                }
            },
            Ok(Ok(None)) => {
                log::debug!("Stream for vehicle {} ended", self.vehicle_id);
                self.close();
                Ok(None)
            }
            Ok(Err(e)) => {
                log::warn!("Stream read failed: {}", e);
                self.close();
                Ok(None)
            }
        }
    }
}

async fn cancellable<F: Future>(
    shutdown: &CancellationToken,
    future: F,
) -> Result<F::Output, StreamError> {
    tokio::select! {
        () = shutdown.cancelled() => Err(StreamError::Cancelled),
        output = future => Ok(output),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::error::AuthError;
    use crate::fields::StreamField;
    use crate::transport::HttpResponse;

    /// One scripted read from a fake stream.
    #[derive(Debug, Clone)]
    pub(crate) enum Read {
        Line(&'static str),
        Eof,
        Stall,
        Fail,
    }

    #[derive(Debug)]
    struct ScriptedLines(VecDeque<Read>);

    #[async_trait]
    impl LineSource for ScriptedLines {
        async fn next_line(&mut self) -> io::Result<Option<String>> {
            match self.0.pop_front().unwrap_or(Read::Stall) {
                Read::Line(line) => Ok(Some(line.to_string())),
                Read::Eof => Ok(None),
                Read::Fail => Err(io::Error::other("connection reset")),
                Read::Stall => std::future::pending().await,
            }
        }
    }

    /// Transport whose `open_lines` outcomes are scripted in order.
    #[derive(Debug, Default)]
    pub(crate) struct FakeTransport {
        opens: Mutex<VecDeque<Result<Vec<Read>, u16>>>,
        pub(crate) requests: Mutex<Vec<HttpRequest>>,
    }

    impl FakeTransport {
        pub(crate) fn script(opens: Vec<Result<Vec<Read>, u16>>) -> Arc<Self> {
            Arc::new(Self {
                opens: Mutex::new(opens.into()),
                requests: Mutex::default(),
            })
        }

        pub(crate) fn open_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            Err(TransportError::Status {
                status: 404,
                url: request.url,
            })
        }

        async fn open_lines(
            &self,
            request: HttpRequest,
        ) -> Result<Box<dyn LineSource>, TransportError> {
            let url = request.url.clone();
            self.requests.lock().unwrap().push(request);
            match self.opens.lock().unwrap().pop_front() {
                Some(Ok(reads)) => Ok(Box::new(ScriptedLines(reads.into()))),
                Some(Err(status)) => Err(TransportError::Status { status, url }),
                None => Err(TransportError::Timeout(url)),
            }
        }
    }

    /// Authenticator handing out `token-1`, `token-2`, ...
    #[derive(Debug, Default)]
    pub(crate) struct FakeAuthenticator {
        pub(crate) calls: AtomicUsize,
        pub(crate) fail: bool,
    }

    #[async_trait]
    impl Authenticator for FakeAuthenticator {
        async fn reauthenticate(&self, vehicle_id: &str) -> Result<AuthContext, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(AuthError::UnknownVehicle(vehicle_id.to_string()));
            }
            Ok(AuthContext {
                username: "driver@example.com".to_string(),
                streaming_vehicle_id: "42".to_string(),
                streaming_token: format!("token-{n}"),
            })
        }
    }

    fn session(transport: &Arc<FakeTransport>, auth: &Arc<FakeAuthenticator>) -> StreamSession {
        let limiter = Arc::new(RateLimiter::new(RateLimiter::default_rules()).unwrap());
        StreamSession::new(
            "1001",
            "https://stream.test/",
            Arc::clone(transport) as _,
            Arc::clone(auth) as _,
            limiter,
        )
        .with_fields(FieldSet::new([StreamField::Speed]))
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_records_in_order() {
        let transport = FakeTransport::script(vec![Ok(vec![
            Read::Line("1000,55.5"),
            Read::Line("1001,56"),
        ])]);
        let auth = Arc::new(FakeAuthenticator::default());
        let mut session = session(&transport, &auth);
        assert_eq!(session.state(), StreamSessionState::Disconnected);

        let first = session.next_record().await.unwrap().unwrap();
        let second = session.next_record().await.unwrap().unwrap();

        assert_eq!(first.timestamp(), 1000);
        assert!((first.speed() - 55.5).abs() < f64::EPSILON);
        assert_eq!(second.timestamp(), 1001);
        assert_eq!(session.state(), StreamSessionState::Reading);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_carries_fields_and_basic_auth() {
        let transport = FakeTransport::script(vec![Ok(vec![Read::Line("1000,1")])]);
        let auth = Arc::new(FakeAuthenticator::default());
        let mut session = session(&transport, &auth);

        session.next_record().await.unwrap();

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].url, "https://stream.test/stream/42/?values=speed");
        let expected = AuthContext {
            username: "driver@example.com".to_string(),
            streaming_vehicle_id: "42".to_string(),
            streaming_token: "token-1".to_string(),
        }
        .basic_authorization();
        assert_eq!(requests[0].authorization.as_deref(), Some(expected.as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_reauthenticates_and_resumes() {
        let transport =
            FakeTransport::script(vec![Err(401), Ok(vec![Read::Line("2000,30")])]);
        let auth = Arc::new(FakeAuthenticator::default());
        let mut session = session(&transport, &auth);

        let record = session.next_record().await.unwrap().unwrap();

        assert_eq!(record.timestamp(), 2000);
        assert_eq!(auth.calls.load(Ordering::SeqCst), 2);
        let requests = transport.requests.lock().unwrap();
        assert_ne!(requests[0].authorization, requests[1].authorization);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_line_keeps_connection() {
        let transport = FakeTransport::script(vec![Ok(vec![
            Read::Line("1000"),
            Read::Line("1001,12.5"),
        ])]);
        let auth = Arc::new(FakeAuthenticator::default());
        let mut session = session(&transport, &auth);

        assert!(session.next_record().await.unwrap().is_none());
        assert_eq!(session.state(), StreamSessionState::Reading);
        let record = session.next_record().await.unwrap().unwrap();

        assert_eq!(record.timestamp(), 1001);
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eof_reconnects_with_cached_credentials() {
        let transport = FakeTransport::script(vec![
            Ok(vec![Read::Line("1000,1"), Read::Eof]),
            Ok(vec![Read::Line("1002,3")]),
        ]);
        let auth = Arc::new(FakeAuthenticator::default());
        let mut session = session(&transport, &auth);

        assert!(session.next_record().await.unwrap().is_some());
        assert!(session.next_record().await.unwrap().is_none());
        assert_eq!(session.state(), StreamSessionState::Disconnected);
        let record = session.next_record().await.unwrap().unwrap();

        assert_eq!(record.timestamp(), 1002);
        assert_eq!(transport.open_count(), 2);
        assert_eq!(auth.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_disconnects() {
        let transport = FakeTransport::script(vec![Ok(vec![Read::Fail])]);
        let auth = Arc::new(FakeAuthenticator::default());
        let mut session = session(&transport, &auth);

        assert!(session.next_record().await.unwrap().is_none());
        assert_eq!(session.state(), StreamSessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_is_no_record() {
        let transport = FakeTransport::script(vec![Ok(vec![Read::Stall])]);
        let auth = Arc::new(FakeAuthenticator::default());
        let mut session = session(&transport, &auth);

        assert!(session.next_record().await.unwrap().is_none());
        assert_eq!(session.state(), StreamSessionState::Reading);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_then_starts_fresh() {
        let mut opens: Vec<Result<Vec<Read>, u16>> = vec![Err(503); 5];
        opens.push(Ok(vec![Read::Line("3000,0")]));
        let transport = FakeTransport::script(opens);
        let auth = Arc::new(FakeAuthenticator::default());
        let mut session = session(&transport, &auth);

        let err = session.next_record().await.unwrap_err();
        assert!(matches!(err, StreamError::GaveUp { attempts: 5, .. }));
        assert_eq!(transport.open_count(), 5);
        assert_eq!(session.state(), StreamSessionState::GivingUp);
        assert_eq!(auth.calls.load(Ordering::SeqCst), 1);

        assert!(session.next_record().await.unwrap().is_some());
        assert_eq!(session.state(), StreamSessionState::Reading);
        assert_eq!(auth.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let transport = FakeTransport::script(vec![Err(404), Ok(vec![Read::Line("1000,1")])]);
        let auth = Arc::new(FakeAuthenticator::default());
        let mut session = session(&transport, &auth);

        let err = session.next_record().await.unwrap_err();

        match err {
            StreamError::GaveUp { attempts, last } => {
                assert_eq!(attempts, 1);
                assert!(matches!(last, TransportError::Status { status: 404, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(transport.open_count(), 1);
        assert_eq!(session.state(), StreamSessionState::GivingUp);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_after_giving_up_is_disconnected() {
        let transport = FakeTransport::script(vec![Err(404)]);
        let auth = Arc::new(FakeAuthenticator::default());
        let mut session = session(&transport, &auth);

        assert!(session.next_record().await.is_err());
        session.close();

        assert_eq!(session.state(), StreamSessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_rejection_gives_up() {
        let transport = FakeTransport::script(vec![Err(401); 5]);
        let auth = Arc::new(FakeAuthenticator::default());
        let mut session = session(&transport, &auth);

        let err = session.next_record().await.unwrap_err();

        assert!(matches!(err, StreamError::GaveUp { .. }));
        assert_eq!(auth.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_authenticator_failure_is_hard() {
        let transport = FakeTransport::script(vec![]);
        let auth = Arc::new(FakeAuthenticator {
            fail: true,
            ..FakeAuthenticator::default()
        });
        let mut session = session(&transport, &auth);

        let err = session.next_record().await.unwrap_err();

        assert!(matches!(err, StreamError::Auth(_)));
        assert_eq!(transport.open_count(), 0);
        assert_eq!(session.state(), StreamSessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_read() {
        let shutdown = CancellationToken::new();
        let transport = FakeTransport::script(vec![Ok(vec![Read::Stall])]);
        let auth = Arc::new(FakeAuthenticator::default());
        let mut session = session(&transport, &auth).with_shutdown(&shutdown);
        session.connect().await.unwrap();

        shutdown.cancel();
        let err = session.next_record().await.unwrap_err();

        assert!(err.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_keeps_credentials() {
        let transport = FakeTransport::script(vec![
            Ok(vec![Read::Line("1000,1")]),
            Ok(vec![Read::Line("1001,1")]),
        ]);
        let auth = Arc::new(FakeAuthenticator::default());
        let mut session = session(&transport, &auth);

        session.connect().await.unwrap();
        assert!(session.is_connected());
        session.close();
        assert!(!session.is_connected());

        let record = session.next_record().await.unwrap().unwrap();
        assert_eq!(record.timestamp(), 1001);
        assert_eq!(auth.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_consults_rate_limiter() {
        let transport = FakeTransport::script(vec![Ok(vec![])]);
        let auth = Arc::new(FakeAuthenticator::default());
        let mut session = session(&transport, &auth);

        session.connect().await.unwrap();

        let calls = session.limiter.recorded_calls().await;
        assert_eq!(calls.len(), 1);
        assert!(calls[0].endpoint.starts_with("https://stream.test/stream/42/"));
    }
}
