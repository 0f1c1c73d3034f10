//! Client side of the secure channel.
//!
//! ```text
//! ask ──► session key cached and outside renewal window? ──yes──► RequestMessage
//!                    │ no
//!                    ▼
//!          lock handshake (one per address)
//!                    │
//!          certificate cached? ──no──► RequestCertificate / RespondCertificate
//!                    │                      (verify signature, root, claim)
//!                    ▼
//!          RequestKey (sealed) / RespondKey ──► cache SessionKey
//! ```

use crate::certificate::ServiceCertificate;
use crate::messages::{secure_headers, ErrorMessage, KeyRequest, KeyResponse, SecureMessage};
use crate::session::{HandshakeSession, SessionKey};
use crate::timeslot::{Clock, SystemClock, TimeSlot};
use async_trait::async_trait;
use dashmap::DashMap;
use shared_crypto::{fingerprint, Ed25519PublicKey, SymmetricKey};
use shared_types::{
    CorrelationId, Envelope, Headers, MessagingError, ProtocolError, ProtocolErrorCode,
    SecureHeader, SecureMessageType, ServiceAddress, SECURE_HEADER,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default limit for each handshake round trip.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Request/reply transport the secure client rides on.
#[async_trait]
pub trait SecureTransport: Send + Sync {
    /// Send `body` to `address` and wait for the correlated reply, giving up
    /// after `timeout` or when `cancel` fires.
    async fn exchange(
        &self,
        address: &ServiceAddress,
        headers: Headers,
        body: Vec<u8>,
        timeout: Option<Duration>,
        cancel: Option<CancellationToken>,
    ) -> Result<Envelope, MessagingError>;
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct SecureClientConfig {
    /// When set, certificates must be issued by this key.
    pub trusted_root: Option<Ed25519PublicKey>,
    pub handshake_timeout: Duration,
}

impl Default for SecureClientConfig {
    fn default() -> Self {
        Self {
            trusted_root: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

fn protocol(code: ProtocolErrorCode, message: impl Into<String>) -> MessagingError {
    MessagingError::Protocol(ProtocolError::new(code, message))
}

/// Check a reply's secure header and surface `Error` replies as typed
/// errors.
fn expect_reply(reply: &Envelope, expected: SecureMessageType) -> Result<(), MessagingError> {
    let Some(value) = reply.header(SECURE_HEADER) else {
        if let Some(remote) = reply.remote_error() {
            return Err(remote);
        }
        return Err(protocol(
            ProtocolErrorCode::BadHeader,
            "reply is missing the secure header",
        ));
    };
    let header = SecureHeader::parse(value)?;
    match header.message_type {
        SecureMessageType::Error => {
            let message: ErrorMessage = crate::messages::decode(&reply.body)?;
            Err(message.into_error())
        }
        found if found == expected => Ok(()),
        found => Err(protocol(
            ProtocolErrorCode::BadMessageType,
            format!("expected {} but got {}", expected.as_str(), found.as_str()),
        )),
    }
}

/// One caller's time budget and cancel token, shared by every round trip of
/// a secure ask.
struct Budget {
    started: Instant,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl Budget {
    fn new(timeout: Option<Duration>, cancel: Option<CancellationToken>) -> Self {
        Self {
            started: Instant::now(),
            timeout,
            cancel: cancel.unwrap_or_default(),
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| self.started + t)
    }

    fn timed_out(&self) -> MessagingError {
        MessagingError::Timeout {
            correlation_id: CorrelationId::new(),
            timeout_ms: self.timeout.map_or(0, |t| t.as_millis() as u64),
        }
    }

    /// Limit for the next round trip: what is left of the budget, capped by
    /// `cap`.
    fn next_wait(&self, cap: Option<Duration>) -> Result<Option<Duration>, MessagingError> {
        if self.cancel.is_cancelled() {
            return Err(MessagingError::Cancelled {
                correlation_id: CorrelationId::new(),
            });
        }
        let Some(deadline) = self.deadline() else {
            return Ok(cap);
        };
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(self.timed_out());
        }
        Ok(Some(cap.map_or(left, |cap| cap.min(left))))
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Encrypts requests to secure services and decrypts their replies.
pub struct SecureClient {
    transport: Arc<dyn SecureTransport>,
    config: SecureClientConfig,
    clock: Arc<dyn Clock>,
    sessions: DashMap<ServiceAddress, Arc<HandshakeSession>>,
}

impl SecureClient {
    pub fn new(transport: Arc<dyn SecureTransport>, config: SecureClientConfig) -> Self {
        Self::with_clock(transport, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        transport: Arc<dyn SecureTransport>,
        config: SecureClientConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            transport,
            config,
            clock,
            sessions: DashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SecureClientConfig {
        &self.config
    }

    /// Session for `address`, created on first use.
    pub fn session(&self, address: &ServiceAddress) -> Arc<HandshakeSession> {
        self.sessions
            .entry(address.clone())
            .or_insert_with(|| Arc::new(HandshakeSession::new(address.clone())))
            .clone()
    }

    /// Forget all cached certificates and keys.
    pub fn reset(&self) {
        self.sessions.clear();
    }

    /// Encrypted request/reply. The returned envelope carries the decrypted
    /// body and headers.
    ///
    /// `timeout` bounds the whole call, handshake included, and `cancel`
    /// aborts it at any point. A cached key is only replaced once a key
    /// exchange completes, so an abandoned call leaves the session usable.
    ///
    /// A reply reporting an expired slot or a failed decryption invalidates
    /// the session key and the request is retried once with a fresh key.
    ///
    /// # Errors
    ///
    /// `Timeout`, `Cancelled`, transport errors, or
    /// `MessagingError::Protocol` for handshake and encryption failures.
    pub async fn ask(
        &self,
        address: &ServiceAddress,
        body: Vec<u8>,
        headers: Headers,
        timeout: Option<Duration>,
        cancel: Option<CancellationToken>,
    ) -> Result<Envelope, MessagingError> {
        let budget = Budget::new(timeout, cancel);
        budget.next_wait(None)?;
        tokio::select! {
            biased;
            _ = budget.cancel.cancelled() => Err(MessagingError::Cancelled {
                correlation_id: CorrelationId::new(),
            }),
            _ = deadline_elapsed(budget.deadline()) => Err(budget.timed_out()),
            result = self.ask_within(address, &body, &headers, &budget) => result,
        }
    }

    async fn ask_within(
        &self,
        address: &ServiceAddress,
        body: &[u8],
        headers: &Headers,
        budget: &Budget,
    ) -> Result<Envelope, MessagingError> {
        let session = self.session(address);
        let mut retried = false;
        loop {
            let key = self.ensure_key(&session, budget).await?;
            match self.send_sealed(address, &key, body, headers, budget).await {
                Err(MessagingError::Protocol(err))
                    if !retried
                        && matches!(
                            err.code,
                            ProtocolErrorCode::TimeSlotExpired | ProtocolErrorCode::DecryptionFailed
                        ) =>
                {
                    warn!(address = %address, code = %err.code, "Session rejected, renegotiating");
                    session.invalidate_key();
                    retried = true;
                }
                other => return other,
            }
        }
    }

    async fn send_sealed(
        &self,
        address: &ServiceAddress,
        key: &SessionKey,
        body: &[u8],
        headers: &Headers,
        budget: &Budget,
    ) -> Result<Envelope, MessagingError> {
        let sealed = key.seal_frame(headers, body)?.encode()?;
        let wait = budget.next_wait(None)?;

        let mut reply = self
            .transport
            .exchange(
                address,
                secure_headers(SecureMessageType::RequestMessage),
                sealed,
                wait,
                Some(budget.cancel.clone()),
            )
            .await?;
        expect_reply(&reply, SecureMessageType::RespondMessage)?;
        let message = SecureMessage::decode(&reply.body)?;
        let frame = key.open_frame(&message)?;
        reply.replace_body(frame.body);
        reply.headers.remove(SECURE_HEADER);
        reply.headers.extend(frame.headers);
        Ok(reply)
    }

    /// Active key for the session, handshaking if needed.
    async fn ensure_key(
        &self,
        session: &HandshakeSession,
        budget: &Budget,
    ) -> Result<Arc<SessionKey>, MessagingError> {
        if let Some(key) = session.current_key(self.clock.now_secs()) {
            return Ok(key);
        }

        let _guard = session.handshake_lock().lock().await;
        let now = self.clock.now_secs();
        // Another caller may have finished the handshake while we waited.
        if let Some(key) = session.current_key(now) {
            return Ok(key);
        }

        let address = session.address();
        let certificate = match session.certificate() {
            Some(cert) if cert.verify(self.config.trusted_root.as_ref(), now).is_ok() => cert,
            _ => {
                let cert = Arc::new(self.fetch_certificate(address, budget).await?);
                session.set_certificate(cert.clone());
                cert
            }
        };

        let key = Arc::new(self.exchange_key(address, &certificate, budget).await?);
        session.set_key(key.clone());
        info!(
            address = %address,
            slot = %key.time_slot(),
            "Secure session established"
        );
        Ok(key)
    }

    async fn fetch_certificate(
        &self,
        address: &ServiceAddress,
        budget: &Budget,
    ) -> Result<ServiceCertificate, MessagingError> {
        debug!(address = %address, "Requesting certificate");
        let wait = budget.next_wait(Some(self.config.handshake_timeout))?;
        let reply = self
            .transport
            .exchange(
                address,
                secure_headers(SecureMessageType::RequestCertificate),
                Vec::new(),
                wait,
                Some(budget.cancel.clone()),
            )
            .await?;
        expect_reply(&reply, SecureMessageType::RespondCertificate)?;

        let certificate = ServiceCertificate::decode(&reply.body)?;
        certificate.validate_for(
            address,
            self.config.trusted_root.as_ref(),
            self.clock.now_secs(),
        )?;
        debug!(
            address = %address,
            subject = certificate.subject(),
            fingerprint = %fingerprint(&reply.body),
            "Certificate accepted"
        );
        Ok(certificate)
    }

    async fn exchange_key(
        &self,
        address: &ServiceAddress,
        certificate: &ServiceCertificate,
        budget: &Budget,
    ) -> Result<SessionKey, MessagingError> {
        debug!(address = %address, "Requesting session key");
        let request = KeyRequest::generate();
        let sealed = request.seal(&certificate.encryption_key())?;
        let wait = budget.next_wait(Some(self.config.handshake_timeout))?;
        let reply = self
            .transport
            .exchange(
                address,
                secure_headers(SecureMessageType::RequestKey),
                sealed,
                wait,
                Some(budget.cancel.clone()),
            )
            .await?;
        expect_reply(&reply, SecureMessageType::RespondKey)?;

        let response = KeyResponse::decrypt(&reply.body, &request)?;
        let slot = TimeSlot::from_index(response.time_slot);
        if slot.is_expired(self.clock.now_secs()) {
            return Err(protocol(
                ProtocolErrorCode::KeyExchangeFailed,
                format!("server issued a key for expired {}", slot),
            ));
        }
        Ok(SessionKey::new(
            SymmetricKey::from_bytes(response.key),
            response.nonce,
            slot,
        ))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::certificate::{CertificateAuthority, ServerIdentity};
    use crate::server::SecureServiceFilter;
    use crate::timeslot::tests::ManualClock;
    use crate::timeslot::{SLOT_DURATION_SECS, TOLERANCE_SECS};
    use mb_03_service_dispatch::{FilterDecision, ServiceFilter};
    use parking_lot::Mutex;
    use shared_types::{CorrelationId, ReplySink};
    use std::collections::HashMap;

    pub(crate) const T0: u64 = SLOT_DURATION_SECS * 1_000_000;
    const DAY: Duration = Duration::from_secs(86_400);

    /// Captures the single reply a filter or behavior sends.
    #[derive(Default)]
    struct CaptureSink(Mutex<Option<(Headers, Vec<u8>, CorrelationId)>>);

    #[async_trait]
    impl ReplySink for CaptureSink {
        async fn reply(
            &self,
            _reply_to: &str,
            correlation_id: CorrelationId,
            headers: Headers,
            body: Vec<u8>,
        ) -> Result<(), MessagingError> {
            *self.0.lock() = Some((headers, body, correlation_id));
            Ok(())
        }
    }

    /// Runs the server filter and an echo behavior in-process.
    ///
    /// A request carrying `x-fail` is answered with an error reply.
    pub(crate) struct Loopback {
        filter: SecureServiceFilter,
        pub(crate) counts: Mutex<HashMap<String, usize>>,
        /// Headers of every frame that crossed the wire, both directions.
        wire: Mutex<Vec<Headers>>,
    }

    impl Loopback {
        pub(crate) fn new(identity: ServerIdentity, clock: Arc<dyn Clock>) -> Self {
            Self {
                filter: SecureServiceFilter::with_clock(Arc::new(identity), clock),
                counts: Mutex::new(HashMap::new()),
                wire: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn count(&self, message_type: SecureMessageType) -> usize {
            self.counts
                .lock()
                .get(message_type.as_str())
                .copied()
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl SecureTransport for Loopback {
        async fn exchange(
            &self,
            _address: &ServiceAddress,
            headers: Headers,
            body: Vec<u8>,
            _timeout: Option<Duration>,
            _cancel: Option<CancellationToken>,
        ) -> Result<Envelope, MessagingError> {
            self.wire.lock().push(headers.clone());
            if let Some(header) = headers.get(SECURE_HEADER).and_then(|v| SecureHeader::parse(v).ok()) {
                *self
                    .counts
                    .lock()
                    .entry(header.message_type.as_str().to_string())
                    .or_default() += 1;
            }

            let sink = Arc::new(CaptureSink::default());
            let mut envelope = Envelope::new(body)
                .with_correlation_id(CorrelationId::new())
                .with_reply_to("loopback")
                .with_reply_sink(sink.clone());
            envelope.headers = headers;

            if self.filter.handle(&mut envelope).await? == FilterDecision::Continue {
                if let Some(reason) = envelope.header("x-fail") {
                    envelope.reply_error("OperationFailed", reason).await?;
                } else {
                    let mut echoed = b"echo:".to_vec();
                    echoed.extend_from_slice(&envelope.body);
                    envelope.reply(echoed, Headers::new()).await?;
                }
            }

            let (headers, body, correlation_id) = sink
                .0
                .lock()
                .take()
                .ok_or_else(|| MessagingError::Dispatch("no reply".into()))?;
            self.wire.lock().push(headers.clone());
            let mut reply = Envelope::new(body).with_correlation_id(correlation_id);
            reply.headers = headers;
            Ok(reply)
        }
    }

    /// Never answers; records the limit each round trip was given.
    #[derive(Default)]
    struct Unanswered {
        limits: Mutex<Vec<Option<Duration>>>,
    }

    #[async_trait]
    impl SecureTransport for Unanswered {
        async fn exchange(
            &self,
            _address: &ServiceAddress,
            _headers: Headers,
            _body: Vec<u8>,
            timeout: Option<Duration>,
            _cancel: Option<CancellationToken>,
        ) -> Result<Envelope, MessagingError> {
            self.limits.lock().push(timeout);
            std::future::pending().await
        }
    }

    fn setup(claims: &[&str]) -> (CertificateAuthority, Arc<Loopback>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let ca = CertificateAuthority::from_seed([11; 32]);
        let identity = ca
            .issue_identity(
                "billing-service",
                claims.iter().map(|c| c.to_string()).collect(),
                T0 - 60,
                DAY,
            )
            .unwrap();
        let loopback = Arc::new(Loopback::new(identity, clock.clone()));
        (ca, loopback, clock)
    }

    fn address() -> ServiceAddress {
        ServiceAddress::parse("billing:invoice").unwrap()
    }

    #[tokio::test]
    async fn test_encrypted_round_trip() {
        let (ca, loopback, clock) = setup(&["billing:*"]);
        let config = SecureClientConfig {
            trusted_root: Some(ca.public_key()),
            ..SecureClientConfig::default()
        };
        let client = SecureClient::with_clock(loopback.clone(), config, clock);

        let reply = client
            .ask(&address(), vec![1, 2, 3], Headers::new(), None, None)
            .await
            .unwrap();
        assert_eq!(reply.body, b"echo:\x01\x02\x03");
        assert!(reply.header(SECURE_HEADER).is_none());

        let empty = client.ask(&address(), Vec::new(), Headers::new(), None, None).await.unwrap();
        assert_eq!(empty.body, b"echo:");

        assert_eq!(loopback.count(SecureMessageType::RequestCertificate), 1);
        assert_eq!(loopback.count(SecureMessageType::RequestKey), 1);
        assert_eq!(loopback.count(SecureMessageType::RequestMessage), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_handshake() {
        let (_ca, loopback, clock) = setup(&["billing:invoice"]);
        let client = Arc::new(SecureClient::with_clock(
            loopback.clone(),
            SecureClientConfig::default(),
            clock,
        ));

        let mut tasks = Vec::new();
        for i in 0..16u8 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                client.ask(&address(), vec![i], Headers::new(), None, None).await
            }));
        }
        for (i, task) in tasks.into_iter().enumerate() {
            let reply = task.await.unwrap().unwrap();
            assert_eq!(reply.body.last(), Some(&(i as u8)));
        }
        assert_eq!(loopback.count(SecureMessageType::RequestCertificate), 1);
        assert_eq!(loopback.count(SecureMessageType::RequestKey), 1);
    }

    #[tokio::test]
    async fn test_rekeys_inside_renewal_window() {
        let (_ca, loopback, clock) = setup(&["*"]);
        let client = SecureClient::with_clock(loopback.clone(), SecureClientConfig::default(), clock.clone());

        client.ask(&address(), vec![1], Headers::new(), None, None).await.unwrap();
        let first = client.session(&address()).current_key(T0).unwrap();

        clock.set(first.time_slot().end_secs() - TOLERANCE_SECS + 1);
        client.ask(&address(), vec![2], Headers::new(), None, None).await.unwrap();

        let session = client.session(&address());
        assert_eq!(session.key_exchanges(), 2);
        assert_eq!(loopback.count(SecureMessageType::RequestCertificate), 1);
        let renewed = session.current_key(clock.now_secs()).unwrap();
        assert_eq!(renewed.time_slot(), first.time_slot().next());
    }

    #[tokio::test]
    async fn test_unauthorized_certificate_rejected() {
        let (_ca, loopback, clock) = setup(&["audit:*"]);
        let client = SecureClient::with_clock(loopback.clone(), SecureClientConfig::default(), clock);
        let err = client
            .ask(&address(), vec![1], Headers::new(), None, None)
            .await
            .unwrap_err();
        match err {
            MessagingError::Protocol(p) => assert_eq!(p.code, ProtocolErrorCode::Unauthorized),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(loopback.count(SecureMessageType::RequestKey), 0);
    }

    #[tokio::test]
    async fn test_untrusted_root_rejected() {
        let (_ca, loopback, clock) = setup(&["*"]);
        let config = SecureClientConfig {
            trusted_root: Some(CertificateAuthority::from_seed([99; 32]).public_key()),
            ..SecureClientConfig::default()
        };
        let client = SecureClient::with_clock(loopback, config, clock);
        let err = client
            .ask(&address(), vec![1], Headers::new(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MessagingError::Protocol(ProtocolError {
                code: ProtocolErrorCode::CertificateInvalid,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_rejected_key_is_renegotiated_once() {
        let (_ca, loopback, clock) = setup(&["*"]);
        let client = SecureClient::with_clock(loopback.clone(), SecureClientConfig::default(), clock);

        // A key the server never issued, for the current slot.
        let session = client.session(&address());
        session.set_key(Arc::new(
            SessionKey::derive(&[1; 32], [0; 16], TimeSlot::at(T0)).unwrap(),
        ));

        let reply = client.ask(&address(), vec![2], Headers::new(), None, None).await.unwrap();
        assert_eq!(reply.body, b"echo:\x02");
        assert_eq!(loopback.count(SecureMessageType::RequestMessage), 2);
        assert_eq!(loopback.count(SecureMessageType::RequestKey), 1);
    }

    #[tokio::test]
    async fn test_expired_slot_reported_by_server() {
        let (_ca, loopback, clock) = setup(&["*"]);
        let client = SecureClient::with_clock(loopback, SecureClientConfig::default(), clock);
        let stale = SessionKey::derive(&[1; 32], [0; 16], TimeSlot::from_index(5)).unwrap();
        let err = client
            .send_sealed(&address(), &stale, b"x", &Headers::new(), &Budget::new(None, None))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MessagingError::Protocol(ProtocolError {
                code: ProtocolErrorCode::TimeSlotExpired,
                ..
            })
        ));
    }

    // =========================================================================
    // DEADLINE AND CANCELLATION
    // =========================================================================

    #[tokio::test]
    async fn test_whole_call_respects_caller_deadline() {
        let transport = Arc::new(Unanswered::default());
        let client = SecureClient::new(transport.clone(), SecureClientConfig::default());

        let started = std::time::Instant::now();
        let err = client
            .ask(
                &address(),
                vec![1],
                Headers::new(),
                Some(Duration::from_millis(200)),
                None,
            )
            .await
            .unwrap_err();

        assert!(err.is_timeout(), "unexpected error: {err}");
        assert!(matches!(err, MessagingError::Timeout { timeout_ms: 200, .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
        let limits = transport.limits.lock();
        assert_eq!(limits.len(), 1);
        assert!(limits[0].unwrap() <= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let transport = Arc::new(Unanswered::default());
        let client = SecureClient::new(transport.clone(), SecureClientConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client
            .ask(
                &address(),
                vec![1],
                Headers::new(),
                Some(Duration::from_secs(30)),
                Some(cancel),
            )
            .await
            .unwrap_err();
        assert!(err.is_cancelled(), "unexpected error: {err}");
        assert!(transport.limits.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_handshake_leaves_session_clean() {
        let transport = Arc::new(Unanswered::default());
        let client = Arc::new(SecureClient::new(transport, SecureClientConfig::default()));
        let cancel = CancellationToken::new();

        let call = {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                client
                    .ask(
                        &address(),
                        vec![1],
                        Headers::new(),
                        Some(Duration::from_secs(30)),
                        Some(cancel),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let err = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(err.is_cancelled(), "unexpected error: {err}");

        let session = client.session(&address());
        assert!(session.current_key(SystemClock.now_secs()).is_none());
        assert_eq!(session.key_exchanges(), 0);
        // The handshake lock was released with the abandoned call.
        assert!(session.handshake_lock().try_lock().is_ok());
    }

    // =========================================================================
    // SEALED HEADERS
    // =========================================================================

    #[tokio::test]
    async fn test_application_headers_never_cross_in_clear() {
        let (_ca, loopback, clock) = setup(&["*"]);
        let client = SecureClient::with_clock(loopback.clone(), SecureClientConfig::default(), clock);
        let mut headers = Headers::new();
        headers.insert("x-fail".into(), "card 4111-1111 declined".into());

        let reply = client
            .ask(&address(), b"charge".to_vec(), headers, None, None)
            .await
            .unwrap();

        assert_eq!(
            reply.remote_error(),
            Some(MessagingError::remote("OperationFailed", "card 4111-1111 declined"))
        );
        for wire in loopback.wire.lock().iter() {
            assert!(wire.get(shared_types::ERROR_HEADER).is_none(), "leaked: {wire:?}");
            assert!(wire.get("x-fail").is_none(), "leaked: {wire:?}");
            assert!(wire.keys().all(|name| name == SECURE_HEADER));
        }
    }
}
