//! Per-edge message-shaping policies.

/// How messages queue on the edge between an emitter and a receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// The queue grows without bound; no message is ever dropped.
    Unlimited,
    /// Queue depth one; a newer message evicts an older undelivered one.
    LatestMessage,
    /// Lossless, but the source is back-pressured once the queue reaches
    /// this depth: its scheduled work is deferred until the queue drains.
    Throttled(usize),
    /// Delivery happens inline in `post`, under source back-pressure;
    /// used where a consumer must observe every message before the
    /// source advances (store writers).
    SynchronousOrThrottle,
    /// Bounded queue; the eldest message is dropped on overflow.
    QueueSize(usize),
}

impl DeliveryPolicy {
    /// True if the policy never drops messages.
    pub fn is_lossless(&self) -> bool {
        matches!(
            self,
            DeliveryPolicy::Unlimited
                | DeliveryPolicy::Throttled(_)
                | DeliveryPolicy::SynchronousOrThrottle
        )
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        DeliveryPolicy::Unlimited
    }
}
