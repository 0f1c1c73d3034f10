//! # Secure Channel and RPC
//!
//! End-to-end over the in-memory broker:
//!
//! 1. Certificate fetch, key exchange and encrypted round trips between a
//!    client node and a service attached with `attach_secure`.
//! 2. Rejections: plaintext to a secure service, an untrusted issuer, a
//!    certificate that does not cover the address.
//! 3. Table-driven RPC, plain and over the secure channel.

#[cfg(test)]
mod tests {
    use crate::integration::fixtures::*;
    use mb_03_service_dispatch::{FnBehavior, ServiceBehavior};
    use mb_04_secure_channel::{CertificateAuthority, Clock, ServerIdentity, SystemClock};
    use node_runtime::{AskOptions, Node, NodeConfig, NodeEvent, RpcBehavior, RpcClient};
    use shared_bus::InMemoryBroker;
    use shared_types::{
        Envelope, Headers, MessagingError, ProtocolErrorCode, SecureHeader, SecureMessageType,
        ServiceConfiguration, SECURE_HEADER,
    };
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio_util::sync::CancellationToken;

    const DAY: Duration = Duration::from_secs(86_400);

    fn authority() -> CertificateAuthority {
        CertificateAuthority::from_seed([7u8; 32])
    }

    fn identity(ca: &CertificateAuthority, claims: &[&str]) -> Arc<ServerIdentity> {
        let now = SystemClock.now_secs();
        let claims = claims.iter().map(|c| c.to_string()).collect();
        Arc::new(
            ca.issue_identity("billing-service", claims, now.saturating_sub(60), DAY)
                .unwrap(),
        )
    }

    async fn trusting_client(broker: &InMemoryBroker, ca: &CertificateAuthority) -> Arc<Node> {
        let mut config = fast_config();
        config.secure.trusted_root = Some(ca.public_key());
        connect_with(broker, config).await
    }

    fn shouting() -> Arc<dyn ServiceBehavior> {
        Arc::new(FnBehavior::new(|envelope: Envelope| async move {
            let loud = String::from_utf8(envelope.body.clone())?.to_uppercase();
            envelope.reply(loud.into_bytes(), Headers::new()).await?;
            Ok::<_, anyhow::Error>(())
        }))
    }

    fn protocol_code(err: &MessagingError) -> Option<ProtocolErrorCode> {
        match err {
            MessagingError::Protocol(e) => Some(e.code),
            _ => None,
        }
    }

    // =========================================================================
    // SECURE CHANNEL
    // =========================================================================

    #[tokio::test]
    async fn test_secure_round_trip() {
        let broker = InMemoryBroker::new();
        let ca = authority();
        let server = connect(&broker).await;
        server
            .attach_secure(
                addr("billing:invoice"),
                ServiceConfiguration::default(),
                shouting(),
                identity(&ca, &["billing:*"]),
            )
            .await
            .unwrap();
        let client = trusting_client(&broker, &ca).await;

        for word in ["quiet", "whisper"] {
            let reply = client
                .ask_secure(&addr("billing:invoice"), word.as_bytes().to_vec(), AskOptions::new())
                .await
                .unwrap();
            assert_eq!(reply.body, word.to_uppercase().into_bytes());
            assert!(reply.header(SECURE_HEADER).is_none());
        }

        // The session key was negotiated once and is still current.
        let session = client.secure_client().session(&addr("billing:invoice"));
        assert!(session.current_key(SystemClock.now_secs()).is_some());
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_plaintext_request_is_refused() {
        let broker = InMemoryBroker::new();
        let ca = authority();
        let node = connect(&broker).await;
        let service = node
            .attach_secure(
                addr("billing:invoice"),
                ServiceConfiguration::default(),
                shouting(),
                identity(&ca, &["billing:*"]),
            )
            .await
            .unwrap();

        let reply = node
            .ask(&addr("billing:invoice"), b"quiet".to_vec(), AskOptions::new())
            .await
            .unwrap();

        let header = SecureHeader::parse(reply.header(SECURE_HEADER).unwrap()).unwrap();
        assert_eq!(header.message_type, SecureMessageType::Error);
        assert_ne!(reply.body, b"QUIET");
        assert!(eventually(|| service.counters().snapshot().filtered == 1).await);
    }

    #[tokio::test]
    async fn test_untrusted_issuer_rejected() {
        let broker = InMemoryBroker::new();
        let server = connect(&broker).await;
        server
            .attach_secure(
                addr("billing:invoice"),
                ServiceConfiguration::default(),
                shouting(),
                identity(&authority(), &["billing:*"]),
            )
            .await
            .unwrap();
        let client = trusting_client(&broker, &CertificateAuthority::from_seed([9u8; 32])).await;

        let err = client
            .ask_secure(&addr("billing:invoice"), b"quiet".to_vec(), AskOptions::new())
            .await
            .unwrap_err();
        assert_eq!(protocol_code(&err), Some(ProtocolErrorCode::CertificateInvalid));
    }

    #[tokio::test]
    async fn test_certificate_must_cover_address() {
        let broker = InMemoryBroker::new();
        let ca = authority();
        let server = connect(&broker).await;
        server
            .attach_secure(
                addr("payroll:run"),
                ServiceConfiguration::default(),
                shouting(),
                identity(&ca, &["billing:*"]),
            )
            .await
            .unwrap();
        let client = trusting_client(&broker, &ca).await;

        let err = client
            .ask_secure(&addr("payroll:run"), b"quiet".to_vec(), AskOptions::new())
            .await
            .unwrap_err();
        assert_eq!(protocol_code(&err), Some(ProtocolErrorCode::Unauthorized));
    }

    // =========================================================================
    // RPC
    // =========================================================================

    fn calculator(node: &Node, total: Arc<AtomicI64>) -> RpcBehavior {
        RpcBehavior::new(node.serializers())
            .operation("Calculator", "add", |(a, b): (i64, i64), _env| async move {
                Ok::<_, anyhow::Error>(a + b)
            })
            .operation("Calculator", "div", |(a, b): (i64, i64), _env| async move {
                anyhow::ensure!(b != 0, "division by zero");
                Ok::<_, anyhow::Error>(a / b)
            })
            .operation("Calculator", "accumulate", move |value: i64, _env| {
                let total = total.clone();
                async move {
                    total.fetch_add(value, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(())
                }
            })
    }

    #[tokio::test]
    async fn test_rpc_calls_and_errors() {
        let broker = InMemoryBroker::new();
        let server = connect(&broker).await;
        let total = Arc::new(AtomicI64::new(0));
        let service = server
            .attach(
                addr("math:calculator"),
                ServiceConfiguration::default(),
                Arc::new(calculator(&server, total.clone())),
            )
            .await
            .unwrap();
        let mut events = server.events();

        let node = connect(&broker).await;
        let client = RpcClient::new(node.clone(), addr("math:calculator"), "Calculator")
            .with_timeout(Duration::from_secs(1));

        let sum: i64 = client.call("add", &(2, 3)).await.unwrap();
        assert_eq!(sum, 5);

        let err = client.call::<_, i64>("sqrt", &(16,)).await.unwrap_err();
        assert_eq!(
            err,
            MessagingError::remote("OperationNotFound", "Calculator.sqrt")
        );

        let err = client.call::<_, i64>("div", &(1, 0)).await.unwrap_err();
        assert_eq!(err, MessagingError::remote("OperationFailed", "division by zero"));
        next_event(&mut events, |event| match event {
            NodeEvent::UnhandledException { .. } => Some(()),
            _ => None,
        })
        .await;
        assert!(eventually(|| service.counters().snapshot().faulted == 1).await);

        client.notify("accumulate", &40).await.unwrap();
        client.notify("accumulate", &2).await.unwrap();
        assert!(eventually(|| total.load(Ordering::SeqCst) == 42).await);

        assert!(client.clone().with_serializer("msgpack").is_err());
    }

    #[tokio::test]
    async fn test_rpc_over_secure_channel() {
        let broker = InMemoryBroker::new();
        let ca = authority();
        let server = connect(&broker).await;
        let total = Arc::new(AtomicI64::new(0));
        server
            .attach_secure(
                addr("billing:calculator"),
                ServiceConfiguration::default(),
                Arc::new(calculator(&server, total.clone())),
                identity(&ca, &["billing:calculator"]),
            )
            .await
            .unwrap();

        let node = trusting_client(&broker, &ca).await;
        let client = RpcClient::new(node, addr("billing:calculator"), "Calculator").secure();

        let sum: i64 = client.call("add", &(20, 22)).await.unwrap();
        assert_eq!(sum, 42);

        let err = client.call::<_, i64>("div", &(1, 0)).await.unwrap_err();
        assert_eq!(err, MessagingError::remote("OperationFailed", "division by zero"));

        client.notify("accumulate", &7).await.unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn test_secure_requires_reachable_service() {
        let broker = InMemoryBroker::new();
        let mut config: NodeConfig = fast_config();
        config.secure.handshake_timeout = Duration::from_secs(5);
        let client = connect_with(&broker, config).await;

        let err = tokio::time::timeout(
            Duration::from_secs(1),
            client.ask_secure(&addr("billing:invoice"), Vec::new(), AskOptions::new()),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(err.is_not_delivered(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_secure_ask_keeps_caller_deadline() {
        let broker = InMemoryBroker::new();
        let server = connect(&broker).await;
        server
            .attach(addr("billing:invoice"), ServiceConfiguration::default(), silent())
            .await
            .unwrap();
        let client = connect(&broker).await;

        let started = Instant::now();
        let err = client
            .ask_secure(
                &addr("billing:invoice"),
                Vec::new(),
                AskOptions::new().with_timeout(Duration::from_millis(200)),
            )
            .await
            .unwrap_err();

        assert!(err.is_timeout(), "unexpected error: {err}");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(eventually(|| client.pending_requests() == 0).await);
    }

    #[tokio::test]
    async fn test_secure_ask_can_be_cancelled() {
        let broker = InMemoryBroker::new();
        let server = connect(&broker).await;
        server
            .attach(addr("billing:invoice"), ServiceConfiguration::default(), silent())
            .await
            .unwrap();
        let client = connect(&broker).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = Instant::now();
        let err = client
            .ask_secure(
                &addr("billing:invoice"),
                Vec::new(),
                AskOptions::new()
                    .with_timeout(Duration::from_secs(30))
                    .with_cancel(cancel),
            )
            .await
            .unwrap_err();
        assert!(err.is_cancelled(), "unexpected error: {err}");
        assert!(started.elapsed() < Duration::from_secs(2));

        let cancel = CancellationToken::new();
        let pending = {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                client
                    .ask_secure(
                        &addr("billing:invoice"),
                        Vec::new(),
                        AskOptions::new()
                            .with_timeout(Duration::from_secs(30))
                            .with_cancel(cancel),
                    )
                    .await
            })
        };
        assert!(eventually(|| client.pending_requests() == 1).await);
        cancel.cancel();
        let err = tokio::time::timeout(STEP, pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(err.is_cancelled(), "unexpected error: {err}");
        assert!(eventually(|| client.pending_requests() == 0).await);
    }
}
