//! Trait form of a trigger
//!
//! [`Coordinator::submit`](super::Coordinator::submit) takes three closures.
//! Callers that already model a trigger as a type can implement [`Trigger`]
//! instead and hand it to `submit_trigger`.

use async_trait::async_trait;

/// One trigger for one key: a fold plus the two stages it schedules
#[async_trait]
pub trait Trigger<S>: Send + Sync + 'static
where
    S: Send + 'static,
{
    /// Fold this trigger over the previous state
    ///
    /// `None` means nothing is tracked for the key, so the state has to be
    /// rebuilt from whatever the caller treats as authoritative.
    fn fold(&self, previous: Option<&S>) -> anyhow::Result<S>;

    /// Optimistic action on the folded state
    async fn estimate(&self, state: S) -> anyhow::Result<()>;

    /// Authoritative action, run only if no newer trigger arrived
    async fn reconcile(&self) -> anyhow::Result<()>;
}
