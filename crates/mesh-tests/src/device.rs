//! The device side of the provisioning handshake, for loopback tests.
//!
//! Built from the same `mesh-core` primitives as the provisioner so that
//! the integration tests exercise the full two-party derivation: shared
//! secret, confirmation exchange, session keys and provisioning-data
//! decryption.

use mesh_core::crypto::{
    aes_cmac, ccm_decrypt, k1, random_bytes, s1, KeyPair, MicSize,
};
use mesh_proto::provisioning::{
    Capabilities, ProvisioningData, ProvisioningPdu, ALGORITHMS_BIT_FIPS_P256,
};
use uuid::Uuid;

/// A simulated unprovisioned device.
pub struct DeviceSimulator {
    /// The device UUID it would advertise.
    pub uuid: Uuid,
    capabilities: Capabilities,
    key_pair: KeyPair,
    random: [u8; 16],
    auth_value: [u8; 16],
    inputs: Vec<u8>,
    shared_secret: Option<[u8; 32]>,
    provisioner_confirmation: Option<[u8; 16]>,
    provisioner_random: Option<[u8; 16]>,
    confirmation_salt: Option<[u8; 16]>,
    /// The provisioning data received at the end of the handshake.
    pub received_data: Option<ProvisioningData>,
    /// The device key derived on the device side.
    pub device_key: Option<[u8; 16]>,
    corrupted: bool,
}

impl DeviceSimulator {
    /// Creates a single-element device with no OOB.
    pub fn new(uuid: Uuid) -> Self {
        Self::with_elements(uuid, 1)
    }

    /// Creates a device exposing `elements` elements.
    pub fn with_elements(uuid: Uuid, elements: u8) -> Self {
        Self {
            uuid,
            capabilities: Capabilities {
                number_of_elements: elements,
                algorithms: ALGORITHMS_BIT_FIPS_P256,
                public_key_type: 0,
                static_oob_type: 0,
                output_oob_size: 0,
                output_oob_actions: 0,
                input_oob_size: 0,
                input_oob_actions: 0,
            },
            key_pair: KeyPair::random(),
            random: random_bytes(),
            auth_value: [0u8; 16],
            inputs: Vec::new(),
            shared_secret: None,
            provisioner_confirmation: None,
            provisioner_random: None,
            confirmation_salt: None,
            received_data: None,
            device_key: None,
            corrupted: false,
        }
    }

    /// Advertises static-OOB support and installs the shared value.
    pub fn enable_static_oob(&mut self, value: [u8; 16]) {
        self.capabilities.static_oob_type = 0x01;
        self.auth_value = value;
    }

    /// Makes the device confirm with a wrong auth value, so the
    /// provisioner's verification must fail. The device stops verifying
    /// the provisioner itself.
    pub fn corrupt_auth_value(&mut self) {
        self.auth_value = [0xEE; 16];
        self.corrupted = true;
    }

    /// Reacts to one provisioner PDU with zero or more device PDUs.
    pub fn handle(&mut self, pdu: &ProvisioningPdu) -> Vec<ProvisioningPdu> {
        match pdu {
            ProvisioningPdu::Invite { .. } => {
                self.inputs.extend_from_slice(&pdu.parameters());
                let capabilities = ProvisioningPdu::Capabilities(self.capabilities);
                self.inputs.extend_from_slice(&capabilities.parameters());
                vec![capabilities]
            }
            ProvisioningPdu::Start(_) => {
                self.inputs.extend_from_slice(&pdu.parameters());
                Vec::new()
            }
            ProvisioningPdu::PublicKey { key } => {
                self.inputs.extend_from_slice(key);
                let our_key = *self.key_pair.public_key();
                self.inputs.extend_from_slice(&our_key);
                self.shared_secret = Some(
                    self.key_pair
                        .diffie_hellman(key)
                        .expect("provisioner key is on the curve"),
                );
                vec![ProvisioningPdu::PublicKey { key: our_key }]
            }
            ProvisioningPdu::Confirmation { value } => {
                self.provisioner_confirmation = Some(*value);
                let salt = s1(&self.inputs);
                self.confirmation_salt = Some(salt);
                let key = self.confirmation_key(&salt);
                let mut message = [0u8; 32];
                message[..16].copy_from_slice(&self.random);
                message[16..].copy_from_slice(&self.auth_value);
                vec![ProvisioningPdu::Confirmation {
                    value: aes_cmac(&key, &message),
                }]
            }
            ProvisioningPdu::Random { value } => {
                // Verify the provisioner's confirmation before disclosing
                // our random.
                let salt = self.confirmation_salt.expect("confirmation crossed");
                let key = self.confirmation_key(&salt);
                let mut message = [0u8; 32];
                message[..16].copy_from_slice(value);
                message[16..].copy_from_slice(&self.auth_value);
                let expected = aes_cmac(&key, &message);
                if !self.corrupted {
                    assert_eq!(
                        Some(expected),
                        self.provisioner_confirmation,
                        "provisioner confirmation must verify"
                    );
                }
                self.provisioner_random = Some(*value);
                vec![ProvisioningPdu::Random { value: self.random }]
            }
            ProvisioningPdu::Data { encrypted } => {
                let salt = self.confirmation_salt.expect("confirmation crossed");
                let provisioner_random = self.provisioner_random.expect("random crossed");
                let secret = self.shared_secret.expect("keys crossed");

                let mut salt_input = Vec::with_capacity(48);
                salt_input.extend_from_slice(&salt);
                salt_input.extend_from_slice(&provisioner_random);
                salt_input.extend_from_slice(&self.random);
                let provisioning_salt = s1(&salt_input);

                let session_key = k1(&secret, &provisioning_salt, b"prsk");
                let session_nonce: [u8; 13] = k1(&secret, &provisioning_salt, b"prsn")[3..16]
                    .try_into()
                    .expect("13-byte tail");
                self.device_key = Some(k1(&secret, &provisioning_salt, b"prdk"));

                let plaintext = ccm_decrypt(
                    &session_key,
                    &session_nonce,
                    encrypted,
                    &[],
                    MicSize::Mic64,
                )
                .expect("provisioning data must decrypt");
                let plaintext: [u8; ProvisioningData::LEN] =
                    plaintext.try_into().expect("25-byte plaintext");
                self.received_data = Some(ProvisioningData::from_bytes(&plaintext));
                vec![ProvisioningPdu::Complete]
            }
            other => panic!("device does not expect {other:?}"),
        }
    }

    fn confirmation_key(&self, salt: &[u8; 16]) -> [u8; 16] {
        let secret = self.shared_secret.expect("keys crossed");
        k1(&secret, salt, b"prck")
    }
}
