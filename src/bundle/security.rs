use crate::bundle::{BundleId, BundleIdCipher, BundleIdGenerator, Direction, download_window};
use crate::{
    Error, FerryConfig, IdentityKey, IdentityPublicKey, PeerBundle, SessionCipher, X25519Secret,
};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const SESSION_FILE: &str = "session.record";
const COUNTER_FILE: &str = "bundle_counter.json";

/// Which end of the client/server relationship this device plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// Direction of the bundles this side produces.
    pub fn outgoing(self) -> Direction {
        match self {
            Role::Client => Direction::Upstream,
            Role::Server => Direction::Downstream,
        }
    }

    /// Direction of the bundles this side receives.
    pub fn incoming(self) -> Direction {
        match self {
            Role::Client => Direction::Downstream,
            Role::Server => Direction::Upstream,
        }
    }
}

/// Everything needed to secure bundles for one counterparty: our identity,
/// the counterparty's trusted identity, the ratchet session, the bundle id
/// cipher and the id counters.
///
/// A handle is owned by the caller and passed into every transmission call.
pub struct BundleSecurity {
    identity: Arc<IdentityKey>,
    peer_identity: IdentityPublicKey,
    role: Role,
    cipher: SessionCipher,
    id_cipher: BundleIdCipher,
    ids: BundleIdGenerator,
}

impl BundleSecurity {
    /// Opens the client side of the relationship with the server whose
    /// published bundle is `server`. A session is initiated on first use.
    pub fn client(
        root: &Path,
        identity: Arc<IdentityKey>,
        server: &PeerBundle,
        config: &FerryConfig,
    ) -> Result<Self, Error> {
        server.verify()?;
        let session = root.join(SESSION_FILE);
        let cipher = SessionCipher::open(identity.clone(), session, config.clone())?;
        if !cipher.has_session()? {
            cipher.initiate(server)?;
            info!("Initiated session with server");
        }

        let client_id = identity.public().client_id();
        Self::assemble(root, identity, server.identity(), Role::Client, cipher, client_id, config)
    }

    /// Opens the server side of the relationship with one client. The
    /// session is built from the key material in the client's first bundle.
    pub fn server(
        root: &Path,
        identity: Arc<IdentityKey>,
        signed_ratchet_key: X25519Secret,
        client: IdentityPublicKey,
        config: &FerryConfig,
    ) -> Result<Self, Error> {
        let cipher = SessionCipher::open(identity.clone(), root.join(SESSION_FILE), config.clone())?
            .with_signed_ratchet_key(signed_ratchet_key);
        let client_id = client.client_id();
        Self::assemble(root, identity, client, Role::Server, cipher, client_id, config)
    }

    fn assemble(
        root: &Path,
        identity: Arc<IdentityKey>,
        peer_identity: IdentityPublicKey,
        role: Role,
        cipher: SessionCipher,
        client_id: String,
        config: &FerryConfig,
    ) -> Result<Self, Error> {
        std::fs::create_dir_all(root)?;
        let id_cipher = BundleIdCipher::new(&identity, &peer_identity, &config.protocol_info)?;
        let ids = BundleIdGenerator::open(client_id, root.join(COUNTER_FILE))?;

        Ok(Self {
            identity,
            peer_identity,
            role,
            cipher,
            id_cipher,
            ids,
        })
    }

    pub fn identity(&self) -> &IdentityKey {
        &self.identity
    }

    pub fn peer_identity(&self) -> &IdentityPublicKey {
        &self.peer_identity
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn cipher(&self) -> &SessionCipher {
        &self.cipher
    }

    pub fn id_cipher(&self) -> &BundleIdCipher {
        &self.id_cipher
    }

    /// Id of the client this relationship belongs to, whichever side we are.
    pub fn client_id(&self) -> &str {
        self.ids.client_id()
    }

    /// Mints the id of the next bundle this side produces.
    pub fn next_bundle_id(&self) -> Result<BundleId, Error> {
        self.ids.next(self.role.outgoing())
    }

    /// Id of the last bundle this side produced, if any was minted yet.
    pub fn last_bundle_id(&self) -> Result<Option<BundleId>, Error> {
        let direction = self.role.outgoing();
        match self.ids.current(direction)? {
            0 => Ok(None),
            counter => BundleId::new(self.client_id(), counter, direction).map(Some),
        }
    }

    /// Encrypted ids of the bundles to request on the next download.
    pub fn download_window(
        &self,
        largest_received: Option<&BundleId>,
        window_length: u64,
    ) -> Result<Vec<String>, Error> {
        download_window(self.client_id(), largest_received, window_length)?
            .iter()
            .map(|id| self.id_cipher.encrypt(id))
            .collect()
    }
}
