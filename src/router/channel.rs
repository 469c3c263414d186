//! Request/response channel between a coordinator and its executor

use crate::core::errors::{Result, RouterError};
use crate::router::types::{Hop, PartitionId, Request, Response};
use tokio::sync::{mpsc, oneshot};

/// Coordinator side of a partition channel
#[derive(Debug, Clone)]
pub struct HopSender {
    partition: PartitionId,
    tx: mpsc::Sender<Request>,
}

/// Executor side of a partition channel
#[derive(Debug)]
pub struct HopReceiver {
    partition: PartitionId,
    rx: mpsc::Receiver<Request>,
}

/// Create the bounded channel for `partition`
pub fn channel(partition: PartitionId, capacity: usize) -> (HopSender, HopReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (HopSender { partition, tx }, HopReceiver { partition, rx })
}

impl HopSender {
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Send `hop` and wait for the executor's answer
    pub async fn dispatch(&self, hop: Hop) -> Result<Response> {
        let (reply, response) = oneshot::channel();
        self.tx.send(Request { hop, reply }).await.map_err(|e| {
            RouterError::channel(format!("partition-{}", self.partition), e.to_string())
        })?;
        response.await.map_err(|_| {
            RouterError::channel(
                format!("partition-{}", self.partition),
                "executor dropped the reply",
            )
        })
    }
}

impl HopReceiver {
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Next request; `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<Request> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::types::ResponseStatus;

    #[tokio::test]
    async fn test_dispatch_round_trip() {
        let (tx, mut rx) = channel(3, 1);
        let executor = tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            assert_eq!(request.hop.transaction_tag, "T1");
            request.reply.send(Response::commit(vec![], vec![])).unwrap();
            assert!(rx.recv().await.is_none());
        });

        let response = tx.dispatch(Hop::new("T1", true)).await.unwrap();
        assert_eq!(response.status, ResponseStatus::Commit);
        drop(tx);
        executor.await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_fails_when_executor_gone() {
        let (tx, rx) = channel(0, 1);
        drop(rx);
        let err = tx.dispatch(Hop::new("T1", true)).await.unwrap_err();
        assert_eq!(err.category(), "channel");
    }

    #[tokio::test]
    async fn test_dropped_reply_is_channel_error() {
        let (tx, mut rx) = channel(0, 1);
        tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            drop(request.reply);
        });
        let err = tx.dispatch(Hop::new("T1", true)).await.unwrap_err();
        assert!(matches!(err, RouterError::Channel { .. }));
    }
}
