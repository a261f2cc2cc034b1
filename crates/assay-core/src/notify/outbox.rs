//! Hand-off point between committed writes and push delivery

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::models::PushEvent;

/// Queue of push-trigger events waiting for the delivery worker.
///
/// Only events from committed rows are sent. Delivery is at-most-once:
/// events still queued at shutdown or crash are lost while their
/// notifications stay committed. A closed receiver drops events with a
/// warning; sync results never depend on delivery.
#[derive(Clone, Debug)]
pub struct PushOutbox {
    tx: UnboundedSender<PushEvent>,
}

impl PushOutbox {
    pub fn channel() -> (Self, UnboundedReceiver<PushEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, events: impl IntoIterator<Item = PushEvent>) {
        for event in events {
            let assay_id = event.assay_id;
            if self.tx.send(event).is_err() {
                tracing::warn!(assay_id, "Push outbox closed; dropping event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageKind;

    #[tokio::test(flavor = "multi_thread")]
    async fn events_arrive_in_order() {
        let (outbox, mut rx) = PushOutbox::channel();
        outbox.send([
            PushEvent::new(1, 10, MessageKind::Ready, None),
            PushEvent::new(1, 10, MessageKind::NotReady, None),
        ]);

        assert_eq!(rx.recv().await.unwrap().message_kind, MessageKind::Ready);
        assert_eq!(rx.recv().await.unwrap().message_kind, MessageKind::NotReady);
    }

    #[test]
    fn closed_receiver_does_not_panic() {
        let (outbox, rx) = PushOutbox::channel();
        drop(rx);
        outbox.send([PushEvent::new(1, 10, MessageKind::Ready, None)]);
    }
}
