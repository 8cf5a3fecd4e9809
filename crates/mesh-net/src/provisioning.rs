//! The provisioner-side provisioning state machine (Mesh Profile §5.4.2).
//!
//! The session walks Invite → Capabilities → Start → public-key exchange →
//! confirmation/random exchange → encrypted provisioning data → Complete,
//! accumulating the ConfirmationInputs along the way. Any malformed PDU,
//! out-of-order PDU or failed verification aborts the session; the failure
//! is reported exactly once.

use mesh_core::crypto::{
    aes_cmac, ccm_encrypt, k1, random_bytes, s1, KeyPair, MicSize, PUBLIC_KEY_SIZE,
};
use mesh_core::{Address, DeviceKey, KeyIndex};
use mesh_proto::provisioning::{
    AuthenticationMethod, Capabilities, ProvisioningData, ProvisioningFailureCode,
    ProvisioningPdu, ProvisioningPduError, Start, ALGORITHM_FIPS_P256,
};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Errors aborting a provisioning session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProvisioningError {
    /// The device's confirmation value did not verify against its random.
    #[error("Confirmation value mismatch")]
    ConfirmationFailed,

    /// The device does not support FIPS P-256.
    #[error("Device does not support the required algorithm")]
    UnsupportedAlgorithm,

    /// The chosen OOB method is not offered by the device.
    #[error("Authentication method unavailable on the device")]
    AuthMethodUnavailable,

    /// Key generation or agreement failed (invalid peer public key).
    #[error("Key generation failed")]
    KeyGenerationFailed,

    /// A PDU arrived that is not legal in the current state.
    #[error("Invalid provisioning state for this PDU")]
    InvalidState,

    /// The peer sent a malformed PDU.
    #[error(transparent)]
    InvalidPdu(#[from] ProvisioningPduError),

    /// The device reported failure.
    #[error("Device reported provisioning failure: {0:?}")]
    RemoteFailure(ProvisioningFailureCode),

    /// No PDU from the device within the link timeout.
    #[error("Provisioning step timed out")]
    Timeout,

    /// The provisioning bearer refused a PDU.
    #[error("Provisioning bearer failed")]
    BearerFailed,
}

/// The authentication method chosen for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningAuth {
    /// No OOB; the authentication value is all zeros.
    NoOob,
    /// A static OOB value shared out of band.
    StaticOob([u8; 16]),
    /// The device outputs a value; the host enters it via
    /// [`ProvisioningSession::provide_auth_value`].
    OutputOob {
        /// Output action bit chosen from the capabilities.
        action: u8,
        /// Number of digits or characters.
        size: u8,
    },
    /// This node displays a value the device's user enters; the device
    /// confirms with InputComplete.
    InputOob {
        /// Input action bit chosen from the capabilities.
        action: u8,
        /// Number of digits or characters.
        size: u8,
    },
}

/// Everything needed to provision one device.
#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    /// UUID from the device's unprovisioned beacon.
    pub device_uuid: Uuid,
    /// Network key to hand over.
    pub network_key: [u8; 16],
    /// Index of that key.
    pub key_index: KeyIndex,
    /// Key refresh / IV-Update flags at the time of provisioning.
    pub flags: u8,
    /// Current IV-Index.
    pub iv_index: u32,
    /// Unicast address for the device's primary element.
    pub unicast_address: Address,
    /// Attention timer duration for the Invite.
    pub attention: u8,
    /// Authentication method.
    pub auth: ProvisioningAuth,
}

/// Output of one handshake step.
#[derive(Debug, Default, PartialEq)]
pub struct ProvisioningStep {
    /// PDUs to hand to the bearer, in order.
    pub outgoing: Vec<ProvisioningPdu>,
    /// Set when the handshake finished.
    pub result: Option<ProvisioningResult>,
    /// True when the host must supply the device-displayed value via
    /// [`ProvisioningSession::provide_auth_value`].
    pub awaiting_oob: bool,
}

/// The credentials agreed with the new node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningResult {
    /// The device UUID.
    pub device_uuid: Uuid,
    /// The derived device key.
    pub device_key: DeviceKey,
    /// Assigned primary unicast address.
    pub unicast_address: Address,
    /// Element count from the capabilities.
    pub element_count: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Invited,
    Started,
    Authenticating,
    ConfirmationSent,
    RandomSent,
    DataSent,
    Complete,
    Failed,
}

/// A provisioning session in progress.
pub struct ProvisioningSession {
    config: ProvisioningConfig,
    state: State,
    key_pair: Option<KeyPair>,
    shared_secret: Option<[u8; 32]>,
    inputs: Vec<u8>,
    capabilities: Option<Capabilities>,
    auth_value: Option<[u8; 16]>,
    provisioner_random: [u8; 16],
    device_confirmation: Option<[u8; 16]>,
    confirmation_salt: Option<[u8; 16]>,
    device_key: Option<DeviceKey>,
}

impl ProvisioningSession {
    /// Creates a session; nothing is sent until [`Self::start`].
    pub fn new(config: ProvisioningConfig) -> Self {
        Self {
            config,
            state: State::Idle,
            key_pair: None,
            shared_secret: None,
            // Invite(1) + Capabilities(11) + Start(5) + two public keys.
            inputs: Vec::with_capacity(17 + 2 * PUBLIC_KEY_SIZE),
            capabilities: None,
            auth_value: None,
            provisioner_random: random_bytes(),
            device_confirmation: None,
            confirmation_salt: None,
            device_key: None,
        }
    }

    /// The device being provisioned.
    pub fn device_uuid(&self) -> Uuid {
        self.config.device_uuid
    }

    /// Index of the network key being distributed.
    pub fn network_key_index(&self) -> KeyIndex {
        self.config.key_index
    }

    /// True once the session ended, successfully or not.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::Complete | State::Failed)
    }

    /// The value to display to the user for input OOB.
    pub fn input_oob_value(&self) -> Option<&[u8; 16]> {
        match self.config.auth {
            ProvisioningAuth::InputOob { .. } => self.auth_value.as_ref(),
            _ => None,
        }
    }

    /// Opens the session: returns the Invite to transmit.
    pub fn start(&mut self) -> Result<ProvisioningPdu, ProvisioningError> {
        if self.state != State::Idle {
            return Err(self.fail(ProvisioningError::InvalidState));
        }
        let invite = ProvisioningPdu::Invite {
            attention: self.config.attention,
        };
        self.inputs.extend_from_slice(&invite.parameters());
        self.state = State::Invited;
        debug!(device = %self.config.device_uuid, "Provisioning invite sent");
        Ok(invite)
    }

    /// Feeds a PDU from the device into the state machine.
    pub fn handle_pdu(&mut self, pdu: &ProvisioningPdu) -> Result<ProvisioningStep, ProvisioningError> {
        if let ProvisioningPdu::Failed { reason } = pdu {
            self.state = State::Failed;
            return Err(ProvisioningError::RemoteFailure(*reason));
        }

        match (self.state, pdu) {
            (State::Invited, ProvisioningPdu::Capabilities(capabilities)) => {
                self.handle_capabilities(*capabilities)
            }
            (State::Started, ProvisioningPdu::PublicKey { key }) => self.handle_public_key(key),
            (State::Authenticating, ProvisioningPdu::InputComplete) => {
                if !matches!(self.config.auth, ProvisioningAuth::InputOob { .. }) {
                    return Err(self.fail(ProvisioningError::InvalidState));
                }
                Ok(ProvisioningStep {
                    outgoing: vec![self.build_confirmation()],
                    ..Default::default()
                })
            }
            (State::ConfirmationSent, ProvisioningPdu::Confirmation { value }) => {
                self.device_confirmation = Some(*value);
                self.state = State::RandomSent;
                Ok(ProvisioningStep {
                    outgoing: vec![ProvisioningPdu::Random {
                        value: self.provisioner_random,
                    }],
                    ..Default::default()
                })
            }
            (State::RandomSent, ProvisioningPdu::Random { value }) => self.handle_device_random(value),
            (State::DataSent, ProvisioningPdu::Complete) => {
                self.state = State::Complete;
                info!(device = %self.config.device_uuid, "Provisioning complete");
                Ok(ProvisioningStep {
                    result: Some(self.result()),
                    ..Default::default()
                })
            }
            _ => Err(self.fail(ProvisioningError::InvalidState)),
        }
    }

    /// Supplies the device-displayed output-OOB value.
    ///
    /// `value` holds the raw digits or characters; it is right-aligned
    /// into the 16-byte authentication value.
    pub fn provide_auth_value(
        &mut self,
        value: &[u8],
    ) -> Result<ProvisioningStep, ProvisioningError> {
        if self.state != State::Authenticating
            || !matches!(self.config.auth, ProvisioningAuth::OutputOob { .. })
        {
            return Err(self.fail(ProvisioningError::InvalidState));
        }
        self.auth_value = Some(pad_auth_value(value));
        Ok(ProvisioningStep {
            outgoing: vec![self.build_confirmation()],
            ..Default::default()
        })
    }

    /// The link timer fired; aborts the session unless it already ended.
    pub fn handle_timeout(&mut self) -> Option<ProvisioningError> {
        if self.is_finished() {
            return None;
        }
        self.state = State::Failed;
        Some(ProvisioningError::Timeout)
    }

    fn handle_capabilities(
        &mut self,
        capabilities: Capabilities,
    ) -> Result<ProvisioningStep, ProvisioningError> {
        if !capabilities.supports_fips_p256() {
            return Err(self.fail(ProvisioningError::UnsupportedAlgorithm));
        }
        let (method, action, size) = match &self.config.auth {
            ProvisioningAuth::NoOob => {
                self.auth_value = Some([0u8; 16]);
                (AuthenticationMethod::NoOob, 0, 0)
            }
            ProvisioningAuth::StaticOob(value) => {
                if capabilities.static_oob_type == 0 {
                    return Err(self.fail(ProvisioningError::AuthMethodUnavailable));
                }
                self.auth_value = Some(*value);
                (AuthenticationMethod::StaticOob, 0, 0)
            }
            ProvisioningAuth::OutputOob { action, size } => {
                if capabilities.output_oob_size == 0 || *size > capabilities.output_oob_size {
                    return Err(self.fail(ProvisioningError::AuthMethodUnavailable));
                }
                (AuthenticationMethod::OutputOob, *action, *size)
            }
            ProvisioningAuth::InputOob { action, size } => {
                if capabilities.input_oob_size == 0 || *size > capabilities.input_oob_size {
                    return Err(self.fail(ProvisioningError::AuthMethodUnavailable));
                }
                // The value this node will display; the device enters it.
                self.auth_value = Some(random_digits_auth(*size));
                (AuthenticationMethod::InputOob, *action, *size)
            }
        };

        self.capabilities = Some(capabilities);
        let caps_pdu = ProvisioningPdu::Capabilities(capabilities);
        self.inputs.extend_from_slice(&caps_pdu.parameters());

        let start = ProvisioningPdu::Start(Start {
            algorithm: ALGORITHM_FIPS_P256,
            public_key: 0,
            authentication_method: method,
            authentication_action: action,
            authentication_size: size,
        });
        self.inputs.extend_from_slice(&start.parameters());

        let key_pair = KeyPair::random();
        let public_key = *key_pair.public_key();
        self.inputs.extend_from_slice(&public_key);
        self.key_pair = Some(key_pair);

        self.state = State::Started;
        Ok(ProvisioningStep {
            outgoing: vec![start, ProvisioningPdu::PublicKey { key: public_key }],
            ..Default::default()
        })
    }

    fn handle_public_key(
        &mut self,
        device_key: &[u8; PUBLIC_KEY_SIZE],
    ) -> Result<ProvisioningStep, ProvisioningError> {
        let (echoed, agreement) = {
            let key_pair = self.key_pair.as_ref().expect("set when Start was sent");
            (
                device_key == key_pair.public_key(),
                key_pair.diffie_hellman(device_key),
            )
        };
        if echoed {
            // A device echoing our key is not doing ECDH.
            return Err(self.fail(ProvisioningError::KeyGenerationFailed));
        }
        let secret = match agreement {
            Ok(secret) => secret,
            Err(_) => return Err(self.fail(ProvisioningError::KeyGenerationFailed)),
        };
        self.inputs.extend_from_slice(device_key);
        self.shared_secret = Some(secret);

        match self.config.auth {
            ProvisioningAuth::NoOob | ProvisioningAuth::StaticOob(_) => Ok(ProvisioningStep {
                outgoing: vec![self.build_confirmation()],
                ..Default::default()
            }),
            ProvisioningAuth::OutputOob { .. } => {
                self.state = State::Authenticating;
                Ok(ProvisioningStep {
                    awaiting_oob: true,
                    ..Default::default()
                })
            }
            ProvisioningAuth::InputOob { .. } => {
                self.state = State::Authenticating;
                Ok(ProvisioningStep::default())
            }
        }
    }

    fn build_confirmation(&mut self) -> ProvisioningPdu {
        let salt = s1(&self.inputs);
        self.confirmation_salt = Some(salt);
        let key = self.confirmation_key(&salt);

        let mut message = [0u8; 32];
        message[..16].copy_from_slice(&self.provisioner_random);
        message[16..].copy_from_slice(&self.auth_value.expect("auth value resolved"));
        let value = aes_cmac(&key, &message);

        self.state = State::ConfirmationSent;
        ProvisioningPdu::Confirmation { value }
    }

    fn handle_device_random(
        &mut self,
        device_random: &[u8; 16],
    ) -> Result<ProvisioningStep, ProvisioningError> {
        let salt = self.confirmation_salt.expect("confirmation was sent");
        let key = self.confirmation_key(&salt);

        let mut message = [0u8; 32];
        message[..16].copy_from_slice(device_random);
        message[16..].copy_from_slice(&self.auth_value.expect("auth value resolved"));
        let expected = aes_cmac(&key, &message);
        let received = self.device_confirmation.expect("stored before random");
        if !bool::from(expected.ct_eq(&received)) {
            return Err(self.fail(ProvisioningError::ConfirmationFailed));
        }

        // Session derivation (Mesh Profile §5.4.2.5).
        let secret = self.shared_secret.expect("derived at key exchange");
        let mut salt_input = Vec::with_capacity(48);
        salt_input.extend_from_slice(&salt);
        salt_input.extend_from_slice(&self.provisioner_random);
        salt_input.extend_from_slice(device_random);
        let provisioning_salt = s1(&salt_input);

        let session_key = k1(&secret, &provisioning_salt, b"prsk");
        let session_nonce: [u8; 13] = k1(&secret, &provisioning_salt, b"prsn")[3..16]
            .try_into()
            .expect("13-byte tail");
        let device_key = k1(&secret, &provisioning_salt, b"prdk");

        let data = ProvisioningData {
            network_key: self.config.network_key,
            key_index: self.config.key_index.value(),
            flags: self.config.flags,
            iv_index: self.config.iv_index,
            unicast_address: self.config.unicast_address.0,
        };
        let sealed = ccm_encrypt(&session_key, &session_nonce, &data.to_bytes(), &[], MicSize::Mic64)
            .expect("25-byte plaintext");
        let encrypted: [u8; 33] = sealed.try_into().expect("25 + 8 bytes");

        self.device_key = Some(DeviceKey(device_key));
        self.state = State::DataSent;
        Ok(ProvisioningStep {
            outgoing: vec![ProvisioningPdu::Data { encrypted }],
            ..Default::default()
        })
    }

    fn confirmation_key(&self, salt: &[u8; 16]) -> [u8; 16] {
        let secret = self.shared_secret.expect("derived at key exchange");
        k1(&secret, salt, b"prck")
    }

    fn result(&self) -> ProvisioningResult {
        ProvisioningResult {
            device_uuid: self.config.device_uuid,
            device_key: self.device_key.expect("set when data was sent"),
            unicast_address: self.config.unicast_address,
            element_count: self
                .capabilities
                .map(|c| c.number_of_elements)
                .unwrap_or(1),
        }
    }

    fn fail(&mut self, error: ProvisioningError) -> ProvisioningError {
        self.state = State::Failed;
        error
    }
}

/// Right-aligns an OOB value into the 16-byte authentication value.
fn pad_auth_value(value: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    let len = value.len().min(16);
    out[16 - len..].copy_from_slice(&value[value.len() - len..]);
    out
}

/// Generates a numeric input-OOB value of `size` digits.
fn random_digits_auth(size: u8) -> [u8; 16] {
    let digits = size.clamp(1, 8) as u32;
    let raw: [u8; 4] = random_bytes();
    let number = u32::from_be_bytes(raw) % 10u32.pow(digits);
    let mut out = [0u8; 16];
    out[12..].copy_from_slice(&number.to_be_bytes());
    out
}
