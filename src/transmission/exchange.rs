use crate::Error;
use crate::bundle::BundleSecurity;
use crate::proto::RecencyBlobResponseProto;
use crate::storage::now_millis;
use crate::transmission::{
    BundleExchangeCounts, BundleTransmission, ExchangeState, ExchangeStatus, ReceiveOutcome,
};
use crate::transport::{TransportDevice, TransportRecord, validate_recency_blob};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// The wire side of a bundle exchange, implemented by the embedding
/// application over whatever channel reaches the counterparty.
pub trait BundleExchangeTransport: Send + Sync {
    /// Succeeds once something is listening at `address:port`.
    fn ping(&self, address: &str, port: u16) -> impl Future<Output = Result<(), Error>> + Send;

    fn recency_blob(
        &self,
        address: &str,
        port: u16,
        sender_id: &str,
    ) -> impl Future<Output = Result<RecencyBlobResponseProto, Error>> + Send;

    /// Fetches the packed bundle stored under `encrypted_id`, `None` when the
    /// counterparty has no such bundle.
    fn download_bundle(
        &self,
        address: &str,
        port: u16,
        encrypted_id: &str,
        sender_id: &str,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, Error>> + Send;

    /// Hands over a packed bundle. Returns whether the counterparty took it.
    fn upload_bundle(
        &self,
        address: &str,
        port: u16,
        encrypted_id: &str,
        archive: Vec<u8>,
        sender_id: &str,
    ) -> impl Future<Output = Result<bool, Error>> + Send;
}

/// A transport currently visible, with the recency response it advertised.
#[derive(Clone, Debug, PartialEq)]
pub struct DiscoveredPeer {
    pub device: TransportDevice,
    pub recency: Option<RecencyBlobResponseProto>,
}

/// Source of the transports currently in range.
pub trait PeerDiscovery: Send + Sync {
    fn discover(&self) -> impl Future<Output = Result<Vec<DiscoveredPeer>, Error>> + Send;
}

async fn bounded<T>(
    limit: Duration,
    what: &str,
    operation: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    timeout(limit, operation)
        .await
        .map_err(|_| Error::Timeout(format!("{what} after {}ms", limit.as_millis())))?
}

impl BundleTransmission {
    /// Runs one upload and download cycle with the counterparty at
    /// `address:port`.
    ///
    /// `is_transport` tells a relaying transport apart from the server
    /// itself: only transports get their freshness recorded. Failures never
    /// escape; they show up as [`ExchangeStatus::Failed`] for the direction
    /// they hit.
    pub async fn do_exchange_with_transport<T: BundleExchangeTransport>(
        &self,
        security: &BundleSecurity,
        transport: &T,
        device: &TransportDevice,
        address: &str,
        port: u16,
        is_transport: bool,
    ) -> BundleExchangeCounts {
        self.set_state(ExchangeState::Connecting);
        let counts = self
            .exchange(security, transport, device, address, port, is_transport)
            .await;

        self.set_state(if counts.is_failed() {
            ExchangeState::Failed
        } else {
            ExchangeState::Complete
        });
        info!(
            device = device.id(),
            upload = %counts.upload,
            download = %counts.download,
            "Exchange finished"
        );
        self.set_state(ExchangeState::Idle);
        counts
    }

    async fn exchange<T: BundleExchangeTransport>(
        &self,
        security: &BundleSecurity,
        transport: &T,
        device: &TransportDevice,
        address: &str,
        port: u16,
        is_transport: bool,
    ) -> BundleExchangeCounts {
        if let Err(err) = self.wait_until_reachable(transport, address, port).await {
            warn!(address, port, %err, "Counterparty unreachable");
            return BundleExchangeCounts::FAILED;
        }
        self.set_state(ExchangeState::Exchanging);

        let sender_id = security.client_id();
        if let Err(err) = self
            .check_recency(security, transport, device, address, port, is_transport)
            .await
        {
            warn!(device = device.id(), %err, "Continuing without a recency signal");
        }

        if is_transport {
            if let Err(err) = self.transports().timestamp_exchange_with_transport(device) {
                warn!(device = device.id(), %err, "Failed to record exchange time");
            }
        }

        let download = self.download(security, transport, address, port, sender_id).await;
        let upload = self.upload(security, transport, address, port, sender_id).await;
        BundleExchangeCounts { upload, download }
    }

    async fn wait_until_reachable<T: BundleExchangeTransport>(
        &self,
        transport: &T,
        address: &str,
        port: u16,
    ) -> Result<(), Error> {
        let config = self.config();
        let attempts = config.server_ping_retries.max(1);
        for attempt in 1..=attempts {
            match bounded(config.connect_timeout, "Ping", transport.ping(address, port)).await {
                Ok(()) => {
                    debug!(address, port, attempt, "Counterparty is listening");
                    return Ok(());
                }
                Err(err) => warn!(address, port, attempt, %err, "Ping failed"),
            }
            if attempt < attempts {
                sleep(config.server_ping_interval).await;
            }
        }
        Err(Error::Timeout(format!(
            "{address}:{port} did not answer {attempts} pings"
        )))
    }

    async fn check_recency<T: BundleExchangeTransport>(
        &self,
        security: &BundleSecurity,
        transport: &T,
        device: &TransportDevice,
        address: &str,
        port: u16,
        is_transport: bool,
    ) -> Result<(), Error> {
        let config = self.config();
        let response = bounded(
            config.connect_timeout,
            "Recency request",
            transport.recency_blob(address, port, security.client_id()),
        )
        .await?;

        let expected = security.peer_identity();
        if is_transport {
            let newer = self
                .transports()
                .process_recency_blob(device, &response, expected)?;
            debug!(device = device.id(), newer, "Processed recency blob");
        } else {
            validate_recency_blob(&response, expected, now_millis(), config.clock_skew_tolerance)?;
        }
        Ok(())
    }

    async fn download<T: BundleExchangeTransport>(
        &self,
        security: &BundleSecurity,
        transport: &T,
        address: &str,
        port: u16,
        sender_id: &str,
    ) -> ExchangeStatus {
        let config = self.config();
        let window = self.ack_record().and_then(|ack| {
            security.download_window(ack.bundle_id(), config.window_length)
        });
        let window = match window {
            Ok(window) => window,
            Err(err) => {
                warn!(%err, "Cannot compute download window");
                return ExchangeStatus::Failed;
            }
        };

        for encrypted_id in &window {
            let download = transport.download_bundle(address, port, encrypted_id, sender_id);
            let archive = match bounded(config.transfer_timeout, "Download", download).await {
                Ok(Some(archive)) if !archive.is_empty() => archive,
                Ok(_) => continue,
                Err(err) => {
                    warn!(%err, "Download failed");
                    return ExchangeStatus::Failed;
                }
            };

            return match self.process_received_bundle(security, &archive) {
                Ok(ReceiveOutcome::Accepted { bundle_id, adus }) => {
                    info!(%bundle_id, adus = adus.len(), "Downloaded bundle");
                    ExchangeStatus::Complete
                }
                Ok(ReceiveOutcome::Stale { bundle_id }) => {
                    debug!(%bundle_id, "Downloaded bundle was already processed");
                    ExchangeStatus::Empty
                }
                Err(err) => {
                    warn!(%err, "Processing downloaded bundle failed");
                    ExchangeStatus::Failed
                }
            };
        }

        debug!(requested = window.len(), "No bundle waiting for download");
        ExchangeStatus::Empty
    }

    async fn upload<T: BundleExchangeTransport>(
        &self,
        security: &BundleSecurity,
        transport: &T,
        address: &str,
        port: u16,
        sender_id: &str,
    ) -> ExchangeStatus {
        let prepared = self
            .generate_bundle_for_transmission(security)
            .and_then(|bundle| Ok((std::fs::read(&bundle.path)?, bundle)));
        let (archive, bundle) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!(%err, "Cannot prepare bundle for upload");
                return ExchangeStatus::Failed;
            }
        };

        let upload =
            transport.upload_bundle(address, port, &bundle.encrypted_id, archive, sender_id);
        match bounded(self.config().transfer_timeout, "Upload", upload).await {
            Ok(true) => {
                info!(bundle_id = %bundle.id, "Uploaded bundle");
                ExchangeStatus::Complete
            }
            Ok(false) => {
                debug!(bundle_id = %bundle.id, "Counterparty declined bundle");
                ExchangeStatus::Empty
            }
            Err(err) => {
                warn!(bundle_id = %bundle.id, %err, "Upload failed");
                ExchangeStatus::Failed
            }
        }
    }

    /// Feeds the currently visible transports into the record manager and
    /// forgets those not seen within `expire_after`. Advertised recency is
    /// trusted only when signed by our counterparty. Returns the transports
    /// advertising data we have not exchanged yet, freshest first.
    pub async fn refresh_peers<D: PeerDiscovery>(
        &self,
        security: &BundleSecurity,
        discovery: &D,
        expire_after: Duration,
    ) -> Result<Vec<TransportRecord>, Error> {
        let peers = bounded(
            self.config().discovery_timeout,
            "Peer discovery",
            discovery.discover(),
        )
        .await?;

        let transports = self.transports();
        for peer in &peers {
            transports.process_discovered_peer(
                &peer.device,
                peer.recency.as_ref(),
                security.peer_identity(),
            )?;
        }
        let expire_after = i64::try_from(expire_after.as_millis()).unwrap_or(i64::MAX);
        transports.expire_not_seen_peers(now_millis().saturating_sub(expire_after))?;

        debug!(visible = peers.len(), "Refreshed peers");
        transports.transports_with_new_data()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::IdentityKey;
    use crate::transmission::tests::parties;
    use crate::transport::sign_recency_blob;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    /// An in-memory counterparty: serves stored archives by encrypted id,
    /// records uploads and signs recency blobs with the server identity.
    pub(crate) struct MockTransport {
        pub(crate) signer: Option<Arc<IdentityKey>>,
        pub(crate) failing_pings: AtomicU32,
        pub(crate) pings: AtomicU32,
        pub(crate) downloads: Mutex<HashMap<String, Vec<u8>>>,
        pub(crate) uploads: Mutex<Vec<(String, Vec<u8>)>>,
        pub(crate) accept_uploads: bool,
    }

    impl MockTransport {
        pub(crate) fn new(signer: Option<Arc<IdentityKey>>) -> Self {
            Self {
                signer,
                failing_pings: AtomicU32::new(0),
                pings: AtomicU32::new(0),
                downloads: Mutex::new(HashMap::new()),
                uploads: Mutex::new(Vec::new()),
                accept_uploads: true,
            }
        }
    }

    impl BundleExchangeTransport for MockTransport {
        async fn ping(&self, _address: &str, _port: u16) -> Result<(), Error> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            let failing = self.failing_pings.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_pings.store(failing - 1, Ordering::SeqCst);
                return Err(Error::Transport("connection refused".to_string()));
            }
            Ok(())
        }

        async fn recency_blob(
            &self,
            _address: &str,
            _port: u16,
            sender_id: &str,
        ) -> Result<RecencyBlobResponseProto, Error> {
            let signer = self
                .signer
                .as_ref()
                .ok_or_else(|| Error::Transport("no recency blob".to_string()))?;
            Ok(sign_recency_blob(signer, sender_id, 1, now_millis()))
        }

        async fn download_bundle(
            &self,
            _address: &str,
            _port: u16,
            encrypted_id: &str,
            _sender_id: &str,
        ) -> Result<Option<Vec<u8>>, Error> {
            Ok(self.downloads.lock().unwrap().get(encrypted_id).cloned())
        }

        async fn upload_bundle(
            &self,
            _address: &str,
            _port: u16,
            encrypted_id: &str,
            archive: Vec<u8>,
            _sender_id: &str,
        ) -> Result<bool, Error> {
            self.uploads
                .lock()
                .unwrap()
                .push((encrypted_id.to_string(), archive));
            Ok(self.accept_uploads)
        }
    }

    struct StaticDiscovery(Vec<DiscoveredPeer>);

    impl PeerDiscovery for StaticDiscovery {
        async fn discover(&self) -> Result<Vec<DiscoveredPeer>, Error> {
            Ok(self.0.clone())
        }
    }

    fn kiosk() -> TransportDevice {
        TransportDevice::WirelessPeer {
            address: "10.0.0.7".to_string(),
            name: "kiosk".to_string(),
        }
    }

    #[tokio::test]
    async fn test_exchange_with_server_uploads_and_downloads() {
        let p = parties();
        p.client_tx.adm().add_adu("x", None, b"up").unwrap();
        let first = p.client_tx.generate_bundle_for_transmission(&p.client).unwrap();
        let first = std::fs::read(&first.path).unwrap();
        p.server_tx.process_received_bundle(&p.server, &first).unwrap();

        // The server has an answer waiting under the first downstream id.
        p.server_tx.adm().add_adu("x", None, b"down").unwrap();
        let reply = p.server_tx.generate_bundle_for_transmission(&p.server).unwrap();
        let transport = MockTransport::new(Some(p.server_identity.clone()));
        transport
            .downloads
            .lock()
            .unwrap()
            .insert(reply.encrypted_id.clone(), std::fs::read(&reply.path).unwrap());

        let counts = p
            .client_tx
            .do_exchange_with_transport(
                &p.client,
                &transport,
                &TransportDevice::ServerEndpoint,
                "server.example",
                7777,
                false,
            )
            .await;

        assert_eq!(counts.download, ExchangeStatus::Complete);
        assert_eq!(counts.upload, ExchangeStatus::Complete);
        assert_eq!(p.client_tx.exchange_state(), ExchangeState::Idle);
        assert_eq!(p.client_tx.adm().received_adus("x").unwrap().len(), 1);
        assert!(p.client_tx.transports().recent_transports().unwrap().is_empty());

        // The upload acknowledges the reply, releasing the server's ADU.
        let upload = transport.uploads.lock().unwrap().remove(0).1;
        let outcome = p.server_tx.process_received_bundle(&p.server, &upload).unwrap();
        assert!(matches!(outcome, ReceiveOutcome::Accepted { .. }));
        let server_pending = p
            .server_tx
            .adm()
            .fetch_adus_to_send(&crate::bundle::AckRecord::Heartbeat, 1000)
            .unwrap();
        assert!(server_pending.is_empty());
    }

    #[tokio::test]
    async fn test_exchange_with_transport_records_freshness() {
        let p = parties();
        let transport = MockTransport::new(Some(p.server_identity.clone()));

        let counts = p
            .client_tx
            .do_exchange_with_transport(&p.client, &transport, &kiosk(), "10.0.0.7", 7777, true)
            .await;

        assert_eq!(counts.download, ExchangeStatus::Empty);
        assert_eq!(counts.upload, ExchangeStatus::Complete);
        let record = p.client_tx.transports().record("10.0.0.7").unwrap().unwrap();
        assert!(record.recency_time > 0);
        assert!(record.last_exchange > 0);
    }

    #[tokio::test]
    async fn test_untrusted_recency_blob_does_not_stop_exchange() {
        let p = parties();
        let impostor = Arc::new(IdentityKey::new().unwrap());
        let transport = MockTransport::new(Some(impostor));

        let counts = p
            .client_tx
            .do_exchange_with_transport(&p.client, &transport, &kiosk(), "10.0.0.7", 7777, true)
            .await;

        assert_eq!(counts.upload, ExchangeStatus::Complete);
        let record = p.client_tx.transports().record("10.0.0.7").unwrap().unwrap();
        assert_eq!(record.recency_time, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_retries_then_gives_up() {
        let p = parties();
        let transport = MockTransport::new(None);
        transport.failing_pings.store(3, Ordering::SeqCst);

        let counts = p
            .client_tx
            .do_exchange_with_transport(&p.client, &transport, &kiosk(), "10.0.0.7", 7777, true)
            .await;
        assert_eq!(counts.upload, ExchangeStatus::Complete);
        assert_eq!(transport.pings.load(Ordering::SeqCst), 4);

        let retries = p.client_tx.config().server_ping_retries;
        transport.failing_pings.store(u32::MAX, Ordering::SeqCst);
        transport.pings.store(0, Ordering::SeqCst);
        let counts = p
            .client_tx
            .do_exchange_with_transport(&p.client, &transport, &kiosk(), "10.0.0.7", 7777, true)
            .await;
        assert_eq!(counts, BundleExchangeCounts::FAILED);
        assert_eq!(transport.pings.load(Ordering::SeqCst), retries);
        assert_eq!(p.client_tx.exchange_state(), ExchangeState::Idle);
    }

    #[tokio::test]
    async fn test_declined_upload_is_empty() {
        let p = parties();
        let mut transport = MockTransport::new(None);
        transport.accept_uploads = false;

        let counts = p
            .client_tx
            .do_exchange_with_transport(&p.client, &transport, &kiosk(), "10.0.0.7", 7777, true)
            .await;
        assert_eq!(counts.upload, ExchangeStatus::Empty);
        assert_eq!(counts.download, ExchangeStatus::Empty);
    }

    #[tokio::test]
    async fn test_refresh_peers_orders_fresh_transports() {
        let p = parties();
        let fresh = sign_recency_blob(&p.server_identity, "t", 1, now_millis() + 1000);
        let discovery = StaticDiscovery(vec![
            DiscoveredPeer {
                device: kiosk(),
                recency: Some(fresh),
            },
            DiscoveredPeer {
                device: TransportDevice::TestDevice {
                    id: "quiet".to_string(),
                },
                recency: None,
            },
        ]);

        let candidates = p
            .client_tx
            .refresh_peers(&p.client, &discovery, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].device, kiosk());
        assert_eq!(p.client_tx.transports().recent_transports().unwrap().len(), 2);
    }
}
