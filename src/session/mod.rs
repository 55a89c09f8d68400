//! Session lifecycle: startup bootstrap, profile reconciliation and the
//! auth-state listener, all publishing into one [`SessionStore`].

pub mod bootstrap;
pub mod listener;
pub mod reconciler;
pub mod store;

pub use bootstrap::{BootstrapOutcome, SessionBootstrapper};
pub use listener::ChangeListener;
pub use reconciler::{ProfileReconciler, ReconcileOutcome};
pub use store::{AuthPhase, Generation, SessionState, SessionStore};
