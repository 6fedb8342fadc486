use crate::events::ChatEvent;

/// Best-effort fan-out of committed events. Implementations never fail the
/// caller; undeliverable events are dropped.
pub trait ChatEventPublisher: Send + Sync {
    fn publish(
        &self,
        participants: &[String],
        event: ChatEvent,
    ) -> crate::ports::BoxFuture<'_, ()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopPublisher;

impl ChatEventPublisher for NoopPublisher {
    fn publish(
        &self,
        _participants: &[String],
        _event: ChatEvent,
    ) -> crate::ports::BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}
