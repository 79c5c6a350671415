use crate::Error;
use crate::bundle::BundleSecurity;
use crate::transmission::{BundleExchangeCounts, BundleExchangeTransport, BundleTransmission};
use crate::transport::TransportDevice;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

const QUEUE_DEPTH: usize = 16;

/// Where and how to run one exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeRequest {
    pub device: TransportDevice,
    pub address: String,
    pub port: u16,
    pub is_transport: bool,
}

struct Job {
    request: ExchangeRequest,
    reply: oneshot::Sender<BundleExchangeCounts>,
}

/// Runs exchanges one at a time on a single worker task. Requests made
/// while an exchange is running wait their turn.
pub struct ExchangeQueue {
    sender: mpsc::Sender<Job>,
    worker: JoinHandle<()>,
}

impl ExchangeQueue {
    pub fn spawn<T>(
        transmission: Arc<BundleTransmission>,
        security: Arc<BundleSecurity>,
        transport: Arc<T>,
    ) -> Self
    where
        T: BundleExchangeTransport + 'static,
    {
        let (sender, mut receiver) = mpsc::channel::<Job>(QUEUE_DEPTH);

        let worker = tokio::spawn(async move {
            while let Some(Job { request, reply }) = receiver.recv().await {
                let counts = transmission
                    .do_exchange_with_transport(
                        &security,
                        transport.as_ref(),
                        &request.device,
                        &request.address,
                        request.port,
                        request.is_transport,
                    )
                    .await;
                if reply.send(counts).is_err() {
                    debug!(device = request.device.id(), "Exchange requester went away");
                }
            }
            debug!("Exchange queue closed");
        });

        Self { sender, worker }
    }

    /// Queues an exchange and waits for its result.
    pub async fn exchange(&self, request: ExchangeRequest) -> Result<BundleExchangeCounts, Error> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Job { request, reply })
            .await
            .map_err(|_| Error::Transport("Exchange queue is closed".to_string()))?;
        response
            .await
            .map_err(|_| Error::Transport("Exchange worker stopped".to_string()))
    }

    /// Stops accepting requests and waits for queued exchanges to finish.
    pub async fn shutdown(self) -> Result<(), Error> {
        drop(self.sender);
        self.worker
            .await
            .map_err(|err| Error::Transport(format!("Exchange worker failed: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transmission::ExchangeStatus;
    use crate::transmission::exchange::tests::MockTransport;
    use crate::transmission::tests::parties;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queued_exchanges_run_one_at_a_time() {
        let p = parties();
        p.client_tx.adm().add_adu("x", None, b"queued").unwrap();

        let transmission = Arc::new(p.client_tx);
        let transport = Arc::new(MockTransport::new(None));
        let queue = Arc::new(ExchangeQueue::spawn(
            transmission.clone(),
            Arc::new(p.client),
            transport.clone(),
        ));

        let request = ExchangeRequest {
            device: TransportDevice::TestDevice {
                id: "bench".to_string(),
            },
            address: "127.0.0.1".to_string(),
            port: 7777,
            is_transport: true,
        };
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                let request = request.clone();
                tokio::spawn(async move { queue.exchange(request).await })
            })
            .collect();

        for handle in handles {
            let counts = handle.await.unwrap().unwrap();
            assert_eq!(counts.upload, ExchangeStatus::Complete);
        }

        // Every run offered the same unacknowledged bundle.
        let uploads = transport.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 3);
        assert!(uploads.iter().all(|(id, _)| *id == uploads[0].0));
        drop(uploads);

        let queue = Arc::try_unwrap(queue).ok().unwrap();
        queue.shutdown().await.unwrap();
        assert!(transmission.transports().record("bench").unwrap().is_some());
    }
}
