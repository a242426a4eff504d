//! One client session: a private [`PageState`] driven by a message queue.
//!
//! ```text
//! transport ─► inbound (mpsc<String>) ─► Session::run ─► outbound (mpsc<String>) ─► transport
//!                                          │
//!                                          └─ MessageRouter (PageState, blocks)
//! ```
//!
//! On start the session sends a full render of the page and every block.
//! Messages are then handled strictly one at a time in arrival order, each
//! under its own deadline. The session ends when the inbound channel closes,
//! the outbound channel is dropped, or the token is cancelled; its state is
//! dropped with it.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::context::Context;
use crate::protocol::{MessageEnvelope, MessageRouter, ResponseEnvelope};
use crate::state::PageState;
use crate::types::{SessionConfig, SessionId};

/// Counters reported when a session ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub processed: u64,
    pub failed: u64,
}

/// Channel ends and task of a spawned session.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: SessionId,
    /// Raw client messages in.
    pub inbound: mpsc::Sender<String>,
    /// Encoded responses out.
    pub outbound: mpsc::Receiver<String>,
    pub task: JoinHandle<SessionStats>,
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    router: MessageRouter,
    config: SessionConfig,
}

impl Session {
    pub fn new(state: PageState, config: SessionConfig) -> Self {
        Self {
            id: SessionId::new(),
            router: MessageRouter::new(state),
            config,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Run on a new task with channels sized from the session config.
    pub fn spawn(self, cancel: CancellationToken) -> SessionHandle {
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.inbound_capacity.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let id = self.id.clone();
        let task = tokio::spawn(self.run(inbound_rx, outbound_tx, cancel));
        SessionHandle {
            id,
            inbound: inbound_tx,
            outbound: outbound_rx,
            task,
        }
    }

    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<String>,
        outbound: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> SessionStats {
        let span = tracing::info_span!("session", id = %self.id);
        async move {
            let ctx = Context::new(cancel.child_token());
            let mut stats = SessionStats::default();
            tracing::info!("session started");

            self.router
                .state_mut()
                .init_blocks(&ctx.with_timeout(self.config.action_timeout))
                .await;
            for response in self.router.snapshot() {
                if !send(&outbound, &response).await {
                    return stats;
                }
            }

            loop {
                let raw = tokio::select! {
                    biased;
                    _ = ctx.token().cancelled() => break,
                    raw = inbound.recv() => match raw {
                        Some(raw) => raw,
                        None => break,
                    },
                };

                let response = self.handle(&ctx, &raw).await;
                stats.processed += 1;
                if !response.is_success() {
                    stats.failed += 1;
                }
                if !send(&outbound, &response).await {
                    break;
                }
            }

            tracing::info!(processed = stats.processed, failed = stats.failed, "session ended");
            stats
        }
        .instrument(span)
        .await
    }

    async fn handle(&mut self, ctx: &Context, raw: &str) -> ResponseEnvelope {
        let envelope = match MessageEnvelope::decode(raw, self.config.max_message_bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(error = %err, "rejected inbound message");
                return ResponseEnvelope::failure("", &err);
            }
        };

        let action_ctx = ctx.with_timeout(self.config.action_timeout);
        match self.router.route(&action_ctx, &envelope).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(block = %envelope.block_id, action = %envelope.action, error = %err, "routing failed");
                ResponseEnvelope::failure(envelope.block_id, &err)
            }
        }
    }
}

/// `false` once the transport side has gone away.
async fn send(outbound: &mpsc::Sender<String>, response: &ResponseEnvelope) -> bool {
    let text = match response.encode() {
        Ok(text) => text,
        Err(err) => {
            tracing::error!(block = %response.block_id, error = %err, "failed to encode response");
            return true;
        }
    };
    if outbound.send(text).await.is_err() {
        tracing::debug!("outbound channel closed");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{CounterBlock, PageConfig};
    use serde_json::{json, Value};

    fn session() -> Session {
        let state = PageState::new(PageConfig {
            multi_step: true,
            step_count: 2,
        })
        .with_block("clicks", Box::new(CounterBlock::new("clicks", 0)));
        Session::new(
            state,
            SessionConfig {
                max_message_bytes: 256,
                ..SessionConfig::default()
            },
        )
    }

    async fn next(handle: &mut SessionHandle) -> Value {
        let text = handle.outbound.recv().await.unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn test_snapshot_then_ordered_responses() {
        let mut handle = session().spawn(CancellationToken::new());
        assert_eq!(next(&mut handle).await["blockID"], "_page");
        assert_eq!(next(&mut handle).await["tree"], json!({"full": {"count": 0}}));

        for _ in 0..3 {
            handle
                .inbound
                .send(r#"{"blockID":"clicks","action":"increment"}"#.to_string())
                .await
                .unwrap();
        }
        for expected in 1..=3 {
            let response = next(&mut handle).await;
            assert_eq!(response["meta"]["success"], true);
            assert_eq!(response["tree"]["patch"][0]["value"], expected);
        }

        drop(handle.inbound);
        let stats = handle.task.await.unwrap();
        assert_eq!(stats, SessionStats { processed: 3, failed: 0 });
    }

    #[tokio::test]
    async fn test_bad_messages_do_not_end_session() {
        let mut handle = session().spawn(CancellationToken::new());
        next(&mut handle).await;
        next(&mut handle).await;

        handle.inbound.send("not json".into()).await.unwrap();
        let response = next(&mut handle).await;
        assert_eq!(response["meta"]["success"], false);
        assert_eq!(response["meta"]["code"], "INVALID_ARGUMENT");

        handle.inbound.send("x".repeat(1000)).await.unwrap();
        let response = next(&mut handle).await;
        assert!(response["meta"]["error"].as_str().unwrap().contains("exceeds limit"));

        handle
            .inbound
            .send(r#"{"blockID":"ghost","action":"increment"}"#.into())
            .await
            .unwrap();
        let response = next(&mut handle).await;
        assert_eq!(response["blockID"], "ghost");
        assert_eq!(response["meta"]["error"], "unknown block: ghost");

        handle
            .inbound
            .send(r#"{"blockID":"_page","action":"nextStep"}"#.into())
            .await
            .unwrap();
        assert_eq!(next(&mut handle).await["meta"]["success"], true);

        drop(handle.inbound);
        let stats = handle.task.await.unwrap();
        assert_eq!(stats, SessionStats { processed: 4, failed: 3 });
    }

    #[tokio::test]
    async fn test_cancel_ends_session() {
        let cancel = CancellationToken::new();
        let mut handle = session().spawn(cancel.clone());
        next(&mut handle).await;
        cancel.cancel();
        let stats = handle.task.await.unwrap();
        assert_eq!(stats.processed, 0);
    }
}
