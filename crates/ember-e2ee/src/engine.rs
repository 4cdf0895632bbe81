//! Per-message prekey handshake.
//!
//! Every outbound message claims one of the peer's one-time prekeys, runs a
//! fresh ephemeral X25519 exchange against it and the peer's signed prekey,
//! and seals the body under the derived key. There is no ratchet: the only
//! state carried between messages is the key store, the trust cache and the
//! memoized message keys, all held in one [`DeviceState`] behind a mutex.
//!
//! Directory calls are made without holding the state lock. Storage calls are
//! made under it so a consume-and-persist step cannot interleave with another
//! decrypt.

use ember_crypto::aead::{self, AeadAlgorithm};
use ember_crypto::dh::public_key_from_slice;
use ember_crypto::kdf::derive_message_key;
use ember_crypto::{DhKeyPair, MessageContext, MessageKey};
use parking_lot::Mutex;

use crate::config::{EngineConfig, CURRENT_E2EE_VERSION};
use crate::envelope::{AadHeader, DecryptContext, Envelope, KeyRef};
use crate::error::E2eeError;
use crate::prekeys::{DeviceBundle, DeviceKeys};
use crate::session::{ReceivedMessageKey, SentMessageKey};
use crate::state::{now_millis, DeviceState};
use crate::store::{PrekeyDirectory, StateStore};
use crate::trust::{PeerFingerprint, TrustChange};

/// Result of a successful [`SessionEngine::encrypt_for_peer`].
#[derive(Debug, Clone)]
pub struct EncryptOutcome {
    pub envelope: Envelope,
    pub shared_key: MessageKey,
    /// How the peer's fingerprint compared with the one on record.
    pub trust_change: TrustChange,
}

/// Where the key that opened an envelope came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// Our own outbound message, opened with the recorded sent key.
    SentKey,
    /// A key already derived for this (sender, key reference).
    Memoized,
    /// Derived from prekeys resident in memory.
    Resident,
    /// Derived after reloading device state from storage.
    Recovered,
}

#[derive(Debug, Clone)]
pub struct Decrypted {
    pub plaintext: Vec<u8>,
    pub source: KeySource,
    /// Set when the sender's fingerprint was refreshed during this call.
    pub trust_change: Option<TrustChange>,
}

pub struct SessionEngine {
    user_id: String,
    device_id: String,
    config: EngineConfig,
    directory: Box<dyn PrekeyDirectory>,
    storage: Box<dyn StateStore>,
    state: Mutex<DeviceState>,
}

impl std::fmt::Debug for SessionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEngine")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionEngine {
    /// Create a new device: fresh identity, signed prekey and one-time
    /// prekeys, registered with the directory and persisted.
    ///
    /// Key material reaches storage before anything is published.
    pub fn provision(
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        config: EngineConfig,
        directory: impl PrekeyDirectory + 'static,
        storage: impl StateStore + 'static,
    ) -> Result<Self, E2eeError> {
        config.validate()?;
        let user_id = user_id.into();
        let device_id = device_id.into();

        let mut state = DeviceState::new(
            user_id.clone(),
            DeviceKeys::generate(device_id.clone(), config.initial_prekeys),
        );
        storage.save_device_state(&state)?;

        let bundle = state.keys.bundle()?;
        directory.register_device(&bundle)?;
        let pending = state.keys.pending_upload();
        if !pending.is_empty() {
            directory.upload_prekeys(&pending)?;
            state.keys.mark_uploaded(&pending);
            storage.save_device_state(&state)?;
        }

        tracing::info!(
            user = %user_id,
            device = %device_id,
            identity = %state.keys.identity().public_key_hex(),
            prekeys = pending.len(),
            "device provisioned"
        );

        Ok(Self {
            user_id,
            device_id,
            config,
            directory: Box::new(directory),
            storage: Box::new(storage),
            state: Mutex::new(state),
        })
    }

    /// Reopen a previously provisioned device from storage.
    pub fn restore(
        user_id: impl Into<String>,
        config: EngineConfig,
        directory: impl PrekeyDirectory + 'static,
        storage: impl StateStore + 'static,
    ) -> Result<Self, E2eeError> {
        config.validate()?;
        let user_id = user_id.into();
        let state = storage
            .load_device_state()?
            .ok_or(E2eeError::NotProvisioned)?;
        if state.user_id != user_id {
            return Err(E2eeError::Storage(format!(
                "stored state belongs to {}, not {user_id}",
                state.user_id
            )));
        }
        let device_id = state.keys.device_id().to_string();

        tracing::info!(
            user = %user_id,
            device = %device_id,
            prekeys = state.keys.one_time_prekey_count(),
            peers = state.trust.len(),
            "device state restored"
        );

        Ok(Self {
            user_id,
            device_id,
            config,
            directory: Box::new(directory),
            storage: Box::new(storage),
            state: Mutex::new(state),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// This device's published bundle.
    pub fn bundle(&self) -> Result<DeviceBundle, E2eeError> {
        self.state.lock().keys.bundle()
    }

    /// The fingerprint on record for `peer_id`, if any.
    pub fn fingerprint(&self, peer_id: &str) -> Option<PeerFingerprint> {
        self.state.lock().trust.get(peer_id).cloned()
    }

    /// One-time prekeys whose private halves are held in memory.
    pub fn resident_prekey_count(&self) -> usize {
        self.state.lock().keys.one_time_prekey_count()
    }

    /// Seal `plaintext` for the primary device of `peer_id`.
    ///
    /// Consumes one of the peer's one-time prekeys. Fails rather than sending
    /// if the bundle does not verify or the peer has no prekeys left.
    #[allow(clippy::too_many_lines)]
    pub fn encrypt_for_peer(
        &self,
        peer_id: &str,
        message_id: &str,
        plaintext: &[u8],
    ) -> Result<EncryptOutcome, E2eeError> {
        let listed = self
            .directory
            .list_device_bundles(peer_id)?
            .into_iter()
            .next()
            .ok_or_else(|| E2eeError::NoDeviceBundle(peer_id.to_string()))?;
        listed.verify()?;

        let claimed = self
            .directory
            .claim_prekey(peer_id)?
            .ok_or_else(|| {
                tracing::warn!(peer = %peer_id, "peer has no one-time prekeys left");
                E2eeError::PrekeyExhausted
            })?;
        if !claimed.same_device_keys(&listed) {
            tracing::debug!(
                peer = %peer_id,
                listed = %listed.device_id,
                claimed = %claimed.device_id,
                "claimed bundle differs from listing; verifying again"
            );
            claimed.verify()?;
        }

        let one_time_prekey = claimed
            .one_time_prekey
            .as_deref()
            .ok_or(E2eeError::PrekeyExhausted)?;
        let one_time_prekey = public_key_from_slice(one_time_prekey, "one-time prekey")?;
        let signed_prekey = public_key_from_slice(&claimed.signed_prekey, "signed prekey")?;

        let sender_identity = self.state.lock().keys.identity().public_key_bytes();
        let ephemeral = DhKeyPair::generate();
        let ephemeral_public = ephemeral.public_bytes();
        let dh_signed = ephemeral.diffie_hellman(&signed_prekey)?;
        let dh_one_time = ephemeral.diffie_hellman(&one_time_prekey)?;
        let shared_key = derive_message_key(
            &self.config.kdf_info,
            &[&*dh_signed, &*dh_one_time],
            &MessageContext {
                sender: &self.user_id,
                recipient: peer_id,
                message_id,
                sender_identity: &sender_identity,
                recipient_identity: &claimed.identity_key,
                ephemeral_public: &ephemeral_public,
            },
        )?;

        let key_ref = KeyRef::OneTime(one_time_prekey).to_string();
        let aad = AadHeader {
            v: self.config.e2ee_version,
            sender: self.user_id.clone(),
            recipient: peer_id.to_string(),
            message_id: message_id.to_string(),
            sender_device: self.device_id.clone(),
            sender_identity: hex::encode(sender_identity),
            ephemeral: hex::encode(ephemeral_public),
            signed_prekey: hex::encode(signed_prekey),
            key_ref: key_ref.clone(),
        }
        .encode()?;
        let algorithm = self.config.algorithm;
        let iv = aead::random_nonce(algorithm);
        let ciphertext = aead::seal(algorithm, shared_key.as_bytes(), &iv, &aad, plaintext)?;

        let trust_change = {
            let mut state = self.state.lock();
            let change = state
                .trust
                .upsert(peer_id, PeerFingerprint::from_bundle(&claimed, now_millis()));
            state.sessions.record_sent(
                message_id,
                SentMessageKey {
                    key: shared_key.clone(),
                    nonce: iv.clone(),
                    aad: aad.clone(),
                    created_at: now_millis(),
                },
                self.config.max_sent_keys,
            );
            self.storage.save_device_state(&state)?;
            change
        };
        log_trust_change(peer_id, &claimed, trust_change);

        tracing::debug!(
            peer = %peer_id,
            device = %claimed.device_id,
            message_id = %message_id,
            key_ref = %key_ref,
            payload_len = plaintext.len(),
            "message sealed"
        );

        Ok(EncryptOutcome {
            envelope: Envelope {
                message_id: message_id.to_string(),
                aad,
                iv,
                ciphertext,
                key_ref,
                e2ee_ver: self.config.e2ee_version,
                algo: algorithm.as_str().to_string(),
                sender_device_id: self.device_id.clone(),
            },
            shared_key,
            trust_change,
        })
    }

    /// Open an envelope, returning only the plaintext.
    pub fn decrypt_envelope(
        &self,
        envelope: &Envelope,
        from_self: bool,
        context: Option<&DecryptContext>,
    ) -> Result<Vec<u8>, E2eeError> {
        self.decrypt_envelope_detailed(envelope, from_self, context)
            .map(|decrypted| decrypted.plaintext)
    }

    /// Open an envelope.
    ///
    /// With `from_self` the recorded sent key is the only source; storage and
    /// the directory are never touched. Otherwise the key comes from the
    /// inbound memo, then resident prekeys, then a single reload of device
    /// state from storage.
    pub fn decrypt_envelope_detailed(
        &self,
        envelope: &Envelope,
        from_self: bool,
        context: Option<&DecryptContext>,
    ) -> Result<Decrypted, E2eeError> {
        if envelope.e2ee_ver == 0 || envelope.e2ee_ver > CURRENT_E2EE_VERSION {
            return Err(E2eeError::MalformedEnvelope(format!(
                "unsupported e2ee version {}",
                envelope.e2ee_ver
            )));
        }
        let algorithm: AeadAlgorithm = envelope
            .algo
            .parse()
            .map_err(|_| E2eeError::MalformedEnvelope(format!("unknown algo {}", envelope.algo)))?;

        if from_self {
            return self.open_own_message(envelope, algorithm);
        }

        let header = AadHeader::decode(&envelope.aad)?;
        header.check_against(envelope, &self.user_id)?;
        let context = context.cloned().unwrap_or_default();
        if context.sender_id.as_deref().is_some_and(|id| id != header.sender) {
            tracing::debug!(
                message_id = %envelope.message_id,
                "transport sender disagrees with authenticated header"
            );
            return Err(E2eeError::DecryptionFailed);
        }
        if context.session_id.as_deref().is_some_and(|id| id != envelope.key_ref) {
            tracing::debug!(
                message_id = %envelope.message_id,
                "session hint does not match key reference; ignoring hint"
            );
        }

        let KeyRef::OneTime(one_time_prekey) = envelope.key_ref.parse::<KeyRef>()? else {
            return Err(E2eeError::MalformedEnvelope(format!(
                "handshake requires a one-time prekey reference, got {}",
                envelope.key_ref
            )));
        };
        let handshake = Handshake {
            sender: &header.sender,
            sender_identity: header.sender_identity_key()?,
            one_time_prekey,
            signed_prekey: header.signed_prekey_key()?,
            ephemeral: header.ephemeral_key()?,
        };

        let (plaintext, source) = self.open_peer_message(envelope, algorithm, &handshake)?;

        let sender_device = context
            .sender_device_id
            .as_deref()
            .unwrap_or(&envelope.sender_device_id);
        let trust_change = self.refresh_sender_fingerprint(
            &header.sender,
            sender_device,
            &handshake.sender_identity,
        );

        tracing::debug!(
            sender = %header.sender,
            message_id = %envelope.message_id,
            source = ?source,
            payload_len = plaintext.len(),
            "message opened"
        );
        Ok(Decrypted {
            plaintext,
            source,
            trust_change,
        })
    }

    /// Top up the directory's pool of our one-time prekeys.
    ///
    /// Returns how many new prekeys were generated; zero when the directory
    /// still holds at least `prekey_low_water`. Prekeys left unpublished by an
    /// earlier failed upload are sent along with the new batch.
    pub fn replenish_prekeys(&self) -> Result<usize, E2eeError> {
        let stock = self.directory.prekey_stock()?;
        let (generated, pending) = {
            let mut state = self.state.lock();
            let generated = if stock < self.config.prekey_low_water {
                state
                    .keys
                    .generate_one_time_prekeys(self.config.prekey_batch_size)
                    .len()
            } else {
                0
            };
            let pending = state.keys.pending_upload();
            if generated > 0 {
                self.storage.save_device_state(&state)?;
            }
            (generated, pending)
        };
        if pending.is_empty() {
            tracing::trace!(stock, "prekey stock sufficient");
            return Ok(0);
        }

        self.directory.upload_prekeys(&pending)?;
        {
            let mut state = self.state.lock();
            state.keys.mark_uploaded(&pending);
            self.storage.save_device_state(&state)?;
        }
        tracing::info!(stock, generated, uploaded = pending.len(), "one-time prekeys replenished");
        Ok(generated)
    }

    /// Replace the signed prekey and re-register the device bundle.
    ///
    /// The previous signed prekey stays resident so envelopes already in
    /// flight to it still open.
    pub fn rotate_signed_prekey(&self) -> Result<(), E2eeError> {
        let bundle = {
            let mut state = self.state.lock();
            state.keys.rotate_signed_prekey();
            self.storage.save_device_state(&state)?;
            state.keys.bundle()?
        };
        self.directory.register_device(&bundle)?;
        tracing::info!(
            device = %self.device_id,
            signed_prekey = hex::encode(&bundle.signed_prekey),
            "signed prekey rotated"
        );
        Ok(())
    }

    fn open_own_message(
        &self,
        envelope: &Envelope,
        algorithm: AeadAlgorithm,
    ) -> Result<Decrypted, E2eeError> {
        let sent = self
            .state
            .lock()
            .sessions
            .sent(&envelope.message_id)
            .cloned()
            .ok_or(E2eeError::SessionNotFound)?;
        if sent.nonce != envelope.iv || sent.aad != envelope.aad {
            tracing::debug!(
                message_id = %envelope.message_id,
                "echoed envelope differs from the one we sent"
            );
            return Err(E2eeError::DecryptionFailed);
        }
        let plaintext = open_with(algorithm, &sent.key, envelope)?;
        Ok(Decrypted {
            plaintext,
            source: KeySource::SentKey,
            trust_change: None,
        })
    }

    /// Memo, then resident prekeys, then at most one storage reload.
    fn open_peer_message(
        &self,
        envelope: &Envelope,
        algorithm: AeadAlgorithm,
        handshake: &Handshake<'_>,
    ) -> Result<(Vec<u8>, KeySource), E2eeError> {
        let mut state = self.state.lock();

        if let Some(key) = state.sessions.received(handshake.sender, &envelope.key_ref) {
            return Ok((open_with(algorithm, key, envelope)?, KeySource::Memoized));
        }

        let mut source = KeySource::Resident;
        let resident =
            handshake.has_one_time_prekey(&state.keys) && handshake.has_signed_prekey(&state.keys);
        if !resident {
            tracing::info!(
                sender = %handshake.sender,
                key_ref = %envelope.key_ref,
                "prekey not resident; reloading device state"
            );
            let stored = self
                .storage
                .load_device_state()?
                .ok_or(E2eeError::KeyMaterialUnavailable)?;
            if stored.user_id != self.user_id {
                return Err(E2eeError::Storage(format!(
                    "reloaded state belongs to {}",
                    stored.user_id
                )));
            }
            state.absorb_reloaded(stored);

            if let Some(key) = state.sessions.received(handshake.sender, &envelope.key_ref) {
                return Ok((open_with(algorithm, key, envelope)?, KeySource::Memoized));
            }
            if !handshake.has_one_time_prekey(&state.keys) {
                tracing::warn!(
                    sender = %handshake.sender,
                    key_ref = %envelope.key_ref,
                    "prekey missing after reload"
                );
                return Err(E2eeError::KeyMaterialUnavailable);
            }
            if !handshake.has_signed_prekey(&state.keys) {
                // The one-time prekey is ours, so the header's signed prekey was rewritten.
                tracing::warn!(
                    sender = %handshake.sender,
                    message_id = %envelope.message_id,
                    "envelope names a signed prekey this device never held"
                );
                return Err(E2eeError::DecryptionFailed);
            }
            source = KeySource::Recovered;
        }

        let key = handshake.derive(
            &self.config.kdf_info,
            &self.user_id,
            &envelope.message_id,
            &state.keys,
        )?;
        let plaintext = open_with(algorithm, &key, envelope)?;

        state.keys.consume_one_time_prekey(&handshake.one_time_prekey);
        state.sessions.record_received(
            handshake.sender,
            &envelope.key_ref,
            ReceivedMessageKey {
                key,
                created_at: now_millis(),
            },
            self.config.max_received_keys,
        );
        self.storage.save_device_state(&state)?;
        Ok((plaintext, source))
    }

    /// Best-effort refresh of the sender's fingerprint after a decrypt.
    ///
    /// Only fetches when the sender is unknown, writes from a different device
    /// than the one on record, or authenticated the handshake with a different
    /// identity key. Failures are logged, never returned.
    fn refresh_sender_fingerprint(
        &self,
        sender: &str,
        sender_device: &str,
        sender_identity: &[u8; 32],
    ) -> Option<TrustChange> {
        let known = self.state.lock().trust.get(sender).is_some_and(|fp| {
            fp.device_id == sender_device
                && fp.identity_key.as_slice() == sender_identity.as_slice()
        });
        if known {
            return None;
        }

        let bundles = match self.directory.list_device_bundles(sender) {
            Ok(bundles) => bundles,
            Err(e) => {
                tracing::warn!(sender = %sender, error = %e, "sender bundle lookup failed");
                return None;
            }
        };
        let Some(bundle) = bundles.into_iter().next() else {
            tracing::warn!(sender = %sender, "sender has no published bundle");
            return None;
        };
        if let Err(e) = bundle.verify() {
            tracing::warn!(sender = %sender, error = %e, "sender bundle failed verification");
            return None;
        }
        if bundle.identity_key.as_slice() != sender_identity.as_slice() {
            tracing::debug!(
                sender = %sender,
                device = %bundle.device_id,
                "published identity differs from the one in the handshake"
            );
        }

        let change = {
            let mut state = self.state.lock();
            let change = state
                .trust
                .upsert(sender, PeerFingerprint::from_bundle(&bundle, now_millis()));
            if let Err(e) = self.storage.save_device_state(&state) {
                tracing::warn!(sender = %sender, error = %e, "fingerprint not persisted");
            }
            change
        };
        log_trust_change(sender, &bundle, change);
        Some(change)
    }
}

/// Public inputs to the recipient side of a handshake, read from the header.
struct Handshake<'a> {
    sender: &'a str,
    sender_identity: [u8; 32],
    one_time_prekey: [u8; 32],
    signed_prekey: [u8; 32],
    ephemeral: [u8; 32],
}

impl Handshake<'_> {
    fn has_one_time_prekey(&self, keys: &DeviceKeys) -> bool {
        keys.find_private_key_for_reference(&KeyRef::OneTime(self.one_time_prekey))
            .is_some()
    }

    fn has_signed_prekey(&self, keys: &DeviceKeys) -> bool {
        keys.find_private_key_for_reference(&KeyRef::Signed(self.signed_prekey))
            .is_some()
    }

    fn derive(
        &self,
        kdf_info: &str,
        recipient: &str,
        message_id: &str,
        keys: &DeviceKeys,
    ) -> Result<MessageKey, E2eeError> {
        let one_time = keys
            .find_private_key_for_reference(&KeyRef::OneTime(self.one_time_prekey))
            .ok_or(E2eeError::KeyMaterialUnavailable)?;
        let signed = keys
            .find_private_key_for_reference(&KeyRef::Signed(self.signed_prekey))
            .ok_or(E2eeError::DecryptionFailed)?;

        // A low-order ephemeral can only come from a forged envelope.
        let dh_signed = signed
            .diffie_hellman(&self.ephemeral)
            .map_err(|_| E2eeError::DecryptionFailed)?;
        let dh_one_time = one_time
            .diffie_hellman(&self.ephemeral)
            .map_err(|_| E2eeError::DecryptionFailed)?;

        let identity = keys.identity().public_key_bytes();
        Ok(derive_message_key(
            kdf_info,
            &[&*dh_signed, &*dh_one_time],
            &MessageContext {
                sender: self.sender,
                recipient,
                message_id,
                sender_identity: &self.sender_identity,
                recipient_identity: &identity,
                ephemeral_public: &self.ephemeral,
            },
        )?)
    }
}

fn open_with(
    algorithm: AeadAlgorithm,
    key: &MessageKey,
    envelope: &Envelope,
) -> Result<Vec<u8>, E2eeError> {
    aead::open(
        algorithm,
        key.as_bytes(),
        &envelope.iv,
        &envelope.aad,
        &envelope.ciphertext,
    )
    .map_err(|e| {
        tracing::warn!(message_id = %envelope.message_id, error = %e, "envelope rejected");
        E2eeError::DecryptionFailed
    })
}

fn log_trust_change(peer_id: &str, bundle: &DeviceBundle, change: TrustChange) {
    let identity = hex::encode(&bundle.identity_key);
    match change {
        TrustChange::IdentityChanged => tracing::warn!(
            peer = %peer_id,
            device = %bundle.device_id,
            identity = %identity,
            "peer identity key changed"
        ),
        TrustChange::DeviceChanged => tracing::info!(
            peer = %peer_id,
            device = %bundle.device_id,
            "peer switched devices"
        ),
        TrustChange::NewPeer => tracing::info!(
            peer = %peer_id,
            device = %bundle.device_id,
            identity = %identity,
            "first fingerprint recorded for peer"
        ),
        TrustChange::SignedPrekeyRotated | TrustChange::Unchanged | TrustChange::Stale => {
            tracing::trace!(peer = %peer_id, change = ?change, "peer fingerprint checked");
        }
    }
}
