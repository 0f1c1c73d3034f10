//! # Secure Channel Subsystem
//!
//! **Subsystem ID:** 4
//!
//! ## Purpose
//!
//! End-to-end encrypted request/response on top of plain asks. The server
//! side is a service filter; the client side drives the handshake over any
//! [`SecureTransport`] (the node implements it with ordinary asks).
//!
//! ## Handshake
//!
//! ```text
//!   SecureClient                                SecureServiceFilter
//!        │── RequestCertificate ───────────────────────►│
//!        │◄────────────────────── RespondCertificate ───│  cert (signed, claims)
//!        │   verify root, validity, claim               │
//!        │── RequestKey (handshake key, sealed) ───────►│
//!        │◄──────── RespondKey (nonce, key, slot) ──────│  key = KDF(secret, nonce, slot)
//!        │── RequestMessage (AES-GCM, slot, nonce) ────►│  re-derive, decrypt
//!        │                                              │──► behavior (plaintext)
//!        │◄───────── RespondMessage (AES-GCM) ──────────│◄── reply, encrypted
//! ```
//!
//! ## Guarantees
//!
//! | Property | Enforcement |
//! |----------|-------------|
//! | Server holds no per-client state | session key re-derived from `(secret, nonce, slot)` per message |
//! | Concurrent callers share one handshake | per-address async lock with a re-check under the lock |
//! | Keys rotate before their slot ends | client renews inside the tolerance window |
//! | Late messages still accepted briefly | server accepts a slot until `end + tolerance` |
//! | Application headers stay private | sealed with the body, only `x-rpc-sec` in clear |
//! | Stale or rejected keys recover | one renegotiation and retry on `TimeSlotExpired` / `DecryptionFailed` |
//! | Key material wiped | handshake payloads and secrets are zeroized on drop |

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod certificate;
pub mod client;
pub mod messages;
pub mod server;
pub mod session;
pub mod timeslot;

pub use certificate::{CertificateAuthority, CertificateBody, ServerIdentity, ServiceCertificate};
pub use client::{SecureClient, SecureClientConfig, SecureTransport, DEFAULT_HANDSHAKE_TIMEOUT};
pub use messages::{secure_headers, ErrorMessage, SealedFrame, SecureMessage};
pub use server::SecureServiceFilter;
pub use session::{HandshakeSession, SessionKey};
pub use timeslot::{Clock, SystemClock, TimeSlot, SLOT_DURATION_SECS, TOLERANCE_SECS};
