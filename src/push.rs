//! Push notification boundary: credentials, payload delivery, and the
//! exactly-once completion handshake with the transport.
//!
//! The transport itself (a push service, a local bridge, a test) stays
//! outside; it drives the [`PushGateway`], which fans events out to the
//! registered [`PushEventDelegate`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

/// Opaque device token handed out by the push transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushCredentials {
    token: Bytes,
}

impl PushCredentials {
    pub fn new(token: impl Into<Bytes>) -> Self {
        Self { token: token.into() }
    }

    pub fn token(&self) -> &Bytes {
        &self.token
    }

    /// Lowercase hex rendering, the form registration endpoints take.
    pub fn token_hex(&self) -> String {
        self.token.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

struct CompletionLedger {
    outstanding: AtomicU64,
    abandoned: AtomicU64,
}

/// Handle for acknowledging one delivered push.
///
/// `complete` consumes the handle, so a second acknowledgement cannot be
/// expressed. The handle may be held across an await and completed later;
/// dropping it without completing is detected, logged, and counted.
pub struct PushCompletion {
    ledger: Option<Arc<CompletionLedger>>,
}

impl PushCompletion {
    fn new(ledger: Arc<CompletionLedger>) -> Self {
        ledger.outstanding.fetch_add(1, Ordering::SeqCst);
        Self { ledger: Some(ledger) }
    }

    /// Acknowledge the push back to the transport.
    pub fn complete(mut self) {
        if let Some(ledger) = self.ledger.take() {
            ledger.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for PushCompletion {
    fn drop(&mut self) {
        if let Some(ledger) = self.ledger.take() {
            ledger.outstanding.fetch_sub(1, Ordering::SeqCst);
            ledger.abandoned.fetch_add(1, Ordering::SeqCst);
            log::warn!("Push completion dropped without being called");
        }
    }
}

/// App-side boundary for push events: the three entry points a transport
/// drives. Payload schemas are owned by the push service, so the raw JSON is
/// passed through untyped.
#[async_trait]
pub trait PushEventDelegate: Send + Sync {
    async fn credentials_updated(&self, credentials: PushCredentials);
    async fn credentials_invalidated(&self);
    async fn incoming_push_received(&self, payload: Value, completion: PushCompletion);
}

/// Routes transport events to the registered delegate and tracks the
/// completion handshake.
pub struct PushGateway {
    delegate: Arc<dyn PushEventDelegate>,
    ledger: Arc<CompletionLedger>,
}

impl PushGateway {
    pub fn new(delegate: Arc<dyn PushEventDelegate>) -> Self {
        Self {
            delegate,
            ledger: Arc::new(CompletionLedger {
                outstanding: AtomicU64::new(0),
                abandoned: AtomicU64::new(0),
            }),
        }
    }

    // 推送凭证更新，转交给业务侧重新注册
    pub async fn credentials_updated(&self, credentials: PushCredentials) {
        log::info!(
            "Push credentials updated: {} bytes, token={}",
            credentials.token().len(),
            credentials.token_hex(),
        );
        self.delegate.credentials_updated(credentials).await;
    }

    pub async fn credentials_invalidated(&self) {
        log::info!("Push credentials invalidated");
        self.delegate.credentials_invalidated().await;
    }

    /// Deliver one push. The delegate owns the completion handle from here
    /// on; a handle that is neither completed nor held shows up in
    /// [`PushGateway::abandoned_completions`].
    pub async fn incoming_push(&self, payload: Value) {
        log::info!("Push received: {}", payload);
        let completion = PushCompletion::new(self.ledger.clone());
        self.delegate.incoming_push_received(payload, completion).await;
    }

    /// Handles issued but not yet acknowledged.
    pub fn outstanding_completions(&self) -> u64 {
        self.ledger.outstanding.load(Ordering::SeqCst)
    }

    /// Handles dropped without acknowledgement, ever.
    pub fn abandoned_completions(&self) -> u64 {
        self.ledger.abandoned.load(Ordering::SeqCst)
    }
}
