use std::sync::Arc;

use tokio::sync::{broadcast, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use super::reconciler::{ProfileReconciler, ReconcileOutcome};
use super::store::SessionStore;
use crate::backend::{AuthEvent, AuthEventKind};
use crate::models::ComposedUserView;

/// Background task applying auth-state changes to the session store.
///
/// Events are handled one at a time in arrival order. Each session-bearing
/// event republishes the metadata-only view and starts a reconciliation;
/// those run concurrently and are aborted when the listener shuts down.
pub struct ChangeListener {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ChangeListener {
    pub fn spawn(
        events: broadcast::Receiver<AuthEvent>,
        store: SessionStore,
        reconciler: Arc<ProfileReconciler>,
        avatar_base_url: String,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let worker = Worker {
            store,
            reconciler,
            avatar_base_url,
            in_flight: JoinSet::new(),
        };
        let handle = tokio::spawn(worker.run(BroadcastStream::new(events), shutdown_rx));
        Self {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Stops listening and aborts in-flight reconciliations.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::error!("Auth listener task failed: {}", e);
                }
            }
        }
    }
}

impl Drop for ChangeListener {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

struct Worker {
    store: SessionStore,
    reconciler: Arc<ProfileReconciler>,
    avatar_base_url: String,
    in_flight: JoinSet<ReconcileOutcome>,
}

impl Worker {
    async fn run(
        mut self,
        mut events: BroadcastStream<AuthEvent>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        tracing::info!("Auth listener started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                next = events.next() => match next {
                    Some(Ok(event)) => self.handle(event),
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        tracing::warn!("Auth listener lagged, skipped {} event(s)", skipped);
                    }
                    None => {
                        tracing::info!("Auth event stream closed");
                        break;
                    }
                },
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    match joined {
                        Ok(outcome) => tracing::debug!("Reconciliation finished: {:?}", outcome),
                        Err(e) if e.is_cancelled() => {}
                        Err(e) => tracing::error!("Reconciliation task failed: {}", e),
                    }
                }
            }
        }
        self.in_flight.shutdown().await;
        tracing::info!("Auth listener stopped");
    }

    fn handle(&mut self, event: AuthEvent) {
        match (event.kind, event.session) {
            (AuthEventKind::SignedOut, _) | (_, None) => {
                tracing::info!("Auth state changed: {:?}, clearing user", event.kind);
                self.store.sign_out();
            }
            (kind, Some(session)) => {
                let identity = session.user;
                tracing::info!("Auth state changed: {:?} for user {}", kind, identity.id);
                let view = ComposedUserView::from_identity(&identity, &self.avatar_base_url);
                let generation = self.store.adopt(view);
                let reconciler = Arc::clone(&self.reconciler);
                self.in_flight
                    .spawn(async move { reconciler.reconcile(&identity, generation).await });
            }
        }
    }
}
