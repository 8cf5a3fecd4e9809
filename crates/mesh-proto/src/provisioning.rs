//! Provisioning PDUs (Mesh Profile §5.4.1).
//!
//! Each PDU is a type octet followed by fixed-size parameters. The
//! parameters of Invite, Capabilities and Start, plus both public keys,
//! accumulate into the ConfirmationInputs that anchor the authentication
//! handshake.

use thiserror::Error;

/// The only key-agreement algorithm of the 1.0 profile.
pub const ALGORITHM_FIPS_P256: u8 = 0x00;

/// Algorithms bitfield: FIPS P-256 elliptic curve.
pub const ALGORITHMS_BIT_FIPS_P256: u16 = 0x0001;

/// Errors from provisioning PDU decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProvisioningPduError {
    /// Empty PDU
    #[error("Empty provisioning PDU")]
    Empty,

    /// Unknown type octet
    #[error("Unknown provisioning PDU type 0x{0:02X}")]
    UnknownType(u8),

    /// Parameters do not match the type's fixed length
    #[error("Invalid length {length} for provisioning PDU type 0x{pdu_type:02X}")]
    InvalidLength {
        /// The type octet.
        pdu_type: u8,
        /// Length of the received parameters.
        length: usize,
    },
}

/// Reason codes of the Provisioning Failed PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProvisioningFailureCode {
    /// Prohibited value zero, kept for lossless decode.
    Prohibited = 0x00,
    /// A PDU type the device does not recognize.
    InvalidPdu = 0x01,
    /// Parameters outside their allowed ranges.
    InvalidFormat = 0x02,
    /// A valid PDU out of sequence.
    UnexpectedPdu = 0x03,
    /// The confirmation value did not verify.
    ConfirmationFailed = 0x04,
    /// The device cannot allocate session state.
    OutOfResources = 0x05,
    /// Provisioning data failed to decrypt.
    DecryptionFailed = 0x06,
    /// Unspecified failure.
    UnexpectedError = 0x07,
    /// The device cannot accept the assigned addresses.
    CannotAssignAddresses = 0x08,
}

impl ProvisioningFailureCode {
    /// Decodes a failure code, mapping unknown values to `UnexpectedError`.
    pub fn from_octet(octet: u8) -> Self {
        match octet {
            0x00 => Self::Prohibited,
            0x01 => Self::InvalidPdu,
            0x02 => Self::InvalidFormat,
            0x03 => Self::UnexpectedPdu,
            0x04 => Self::ConfirmationFailed,
            0x05 => Self::OutOfResources,
            0x06 => Self::DecryptionFailed,
            0x07 => Self::UnexpectedError,
            0x08 => Self::CannotAssignAddresses,
            _ => Self::UnexpectedError,
        }
    }
}

/// Device capabilities announced in response to an Invite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Number of elements the device exposes.
    pub number_of_elements: u8,
    /// Supported algorithms bitfield.
    pub algorithms: u16,
    /// Public-key-type bitfield (OOB public key available).
    pub public_key_type: u8,
    /// Static-OOB-type bitfield.
    pub static_oob_type: u8,
    /// Maximum size of output OOB, 0 when unsupported.
    pub output_oob_size: u8,
    /// Output OOB actions bitfield.
    pub output_oob_actions: u16,
    /// Maximum size of input OOB, 0 when unsupported.
    pub input_oob_size: u8,
    /// Input OOB actions bitfield.
    pub input_oob_actions: u16,
}

impl Capabilities {
    /// True if the device supports FIPS P-256.
    pub const fn supports_fips_p256(&self) -> bool {
        self.algorithms & ALGORITHMS_BIT_FIPS_P256 != 0
    }

    fn encode(&self) -> [u8; 11] {
        let mut out = [0u8; 11];
        out[0] = self.number_of_elements;
        out[1..3].copy_from_slice(&self.algorithms.to_be_bytes());
        out[3] = self.public_key_type;
        out[4] = self.static_oob_type;
        out[5] = self.output_oob_size;
        out[6..8].copy_from_slice(&self.output_oob_actions.to_be_bytes());
        out[8] = self.input_oob_size;
        out[9..11].copy_from_slice(&self.input_oob_actions.to_be_bytes());
        out
    }

    fn decode(data: &[u8; 11]) -> Self {
        Self {
            number_of_elements: data[0],
            algorithms: u16::from_be_bytes([data[1], data[2]]),
            public_key_type: data[3],
            static_oob_type: data[4],
            output_oob_size: data[5],
            output_oob_actions: u16::from_be_bytes([data[6], data[7]]),
            input_oob_size: data[8],
            input_oob_actions: u16::from_be_bytes([data[9], data[10]]),
        }
    }
}

/// Authentication method selected in the Start PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum AuthenticationMethod {
    /// No OOB authentication; the auth value is all zeros.
    #[default]
    NoOob = 0x00,
    /// Static OOB value.
    StaticOob = 0x01,
    /// The device outputs a value the provisioner enters.
    OutputOob = 0x02,
    /// The provisioner outputs a value the device enters.
    InputOob = 0x03,
}

/// The provisioner's protocol selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Start {
    /// Chosen algorithm; only [`ALGORITHM_FIPS_P256`].
    pub algorithm: u8,
    /// 1 when the device's public key is obtained out of band.
    pub public_key: u8,
    /// Chosen authentication method.
    pub authentication_method: AuthenticationMethod,
    /// Chosen authentication action (method-specific).
    pub authentication_action: u8,
    /// Size of the authentication value (digits or octets).
    pub authentication_size: u8,
}

impl Start {
    fn encode(&self) -> [u8; 5] {
        [
            self.algorithm,
            self.public_key,
            self.authentication_method as u8,
            self.authentication_action,
            self.authentication_size,
        ]
    }

    fn decode(data: &[u8; 5]) -> Result<Self, ProvisioningPduError> {
        let method = match data[2] {
            0x00 => AuthenticationMethod::NoOob,
            0x01 => AuthenticationMethod::StaticOob,
            0x02 => AuthenticationMethod::OutputOob,
            0x03 => AuthenticationMethod::InputOob,
            _ => {
                return Err(ProvisioningPduError::InvalidLength {
                    pdu_type: 0x02,
                    length: 5,
                })
            }
        };
        Ok(Self {
            algorithm: data[0],
            public_key: data[1],
            authentication_method: method,
            authentication_action: data[3],
            authentication_size: data[4],
        })
    }
}

/// The network parameters handed to the device, before encryption.
///
/// ```text
/// NetworkKey(16) ‖ KeyIndex(16) ‖ Flags(8) ‖ IVIndex(32) ‖ UnicastAddress(16)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisioningData {
    /// The network key the device joins with.
    pub network_key: [u8; 16],
    /// Index of that key.
    pub key_index: u16,
    /// Flags: bit 0 key refresh, bit 1 IV-Update active.
    pub flags: u8,
    /// Current IV-Index.
    pub iv_index: u32,
    /// Unicast address of the device's primary element.
    pub unicast_address: u16,
}

impl ProvisioningData {
    /// Plaintext length of the provisioning data.
    pub const LEN: usize = 25;

    /// Encodes to the 25-byte plaintext.
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[..16].copy_from_slice(&self.network_key);
        out[16..18].copy_from_slice(&self.key_index.to_be_bytes());
        out[18] = self.flags;
        out[19..23].copy_from_slice(&self.iv_index.to_be_bytes());
        out[23..25].copy_from_slice(&self.unicast_address.to_be_bytes());
        out
    }

    /// Decodes the 25-byte plaintext.
    pub fn from_bytes(data: &[u8; Self::LEN]) -> Self {
        Self {
            network_key: data[..16].try_into().expect("16 bytes"),
            key_index: u16::from_be_bytes([data[16], data[17]]),
            flags: data[18],
            iv_index: u32::from_be_bytes([data[19], data[20], data[21], data[22]]),
            unicast_address: u16::from_be_bytes([data[23], data[24]]),
        }
    }
}

/// A provisioning PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningPdu {
    /// Opens the link and asks the device to identify itself (type 0x00).
    Invite {
        /// Seconds the device should attract attention.
        attention: u8,
    },
    /// The device's capabilities (type 0x01).
    Capabilities(Capabilities),
    /// The provisioner's protocol selection (type 0x02).
    Start(Start),
    /// A P-256 public key as X ‖ Y (type 0x03).
    PublicKey {
        /// The 64-byte uncompressed point.
        key: [u8; 64],
    },
    /// The device finished input-OOB entry (type 0x04).
    InputComplete,
    /// A confirmation value (type 0x05).
    Confirmation {
        /// CMAC over random ‖ auth value.
        value: [u8; 16],
    },
    /// A random value disclosed after confirmations crossed (type 0x06).
    Random {
        /// The 16-byte random.
        value: [u8; 16],
    },
    /// Encrypted provisioning data with its 64-bit MIC (type 0x07).
    Data {
        /// 25 ciphertext bytes followed by the 8-byte MIC.
        encrypted: [u8; 33],
    },
    /// The device accepted the data (type 0x08).
    Complete,
    /// The device aborted the session (type 0x09).
    Failed {
        /// Why the session failed.
        reason: ProvisioningFailureCode,
    },
}

impl ProvisioningPdu {
    /// The PDU type octet.
    pub const fn pdu_type(&self) -> u8 {
        match self {
            ProvisioningPdu::Invite { .. } => 0x00,
            ProvisioningPdu::Capabilities(_) => 0x01,
            ProvisioningPdu::Start(_) => 0x02,
            ProvisioningPdu::PublicKey { .. } => 0x03,
            ProvisioningPdu::InputComplete => 0x04,
            ProvisioningPdu::Confirmation { .. } => 0x05,
            ProvisioningPdu::Random { .. } => 0x06,
            ProvisioningPdu::Data { .. } => 0x07,
            ProvisioningPdu::Complete => 0x08,
            ProvisioningPdu::Failed { .. } => 0x09,
        }
    }

    /// Encodes the PDU, type octet included.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.pdu_type()];
        match self {
            ProvisioningPdu::Invite { attention } => out.push(*attention),
            ProvisioningPdu::Capabilities(caps) => out.extend_from_slice(&caps.encode()),
            ProvisioningPdu::Start(start) => out.extend_from_slice(&start.encode()),
            ProvisioningPdu::PublicKey { key } => out.extend_from_slice(key),
            ProvisioningPdu::InputComplete | ProvisioningPdu::Complete => {}
            ProvisioningPdu::Confirmation { value } | ProvisioningPdu::Random { value } => {
                out.extend_from_slice(value)
            }
            ProvisioningPdu::Data { encrypted } => out.extend_from_slice(encrypted),
            ProvisioningPdu::Failed { reason } => out.push(*reason as u8),
        }
        out
    }

    /// The parameter bytes, as they enter the ConfirmationInputs.
    pub fn parameters(&self) -> Vec<u8> {
        self.encode()[1..].to_vec()
    }

    /// Decodes a PDU with strict length checks.
    pub fn decode(data: &[u8]) -> Result<Self, ProvisioningPduError> {
        let (&pdu_type, parameters) = data.split_first().ok_or(ProvisioningPduError::Empty)?;
        let invalid = |length| ProvisioningPduError::InvalidLength { pdu_type, length };
        match pdu_type {
            0x00 => match parameters {
                [attention] => Ok(ProvisioningPdu::Invite {
                    attention: *attention,
                }),
                _ => Err(invalid(parameters.len())),
            },
            0x01 => {
                let fixed: &[u8; 11] =
                    parameters.try_into().map_err(|_| invalid(parameters.len()))?;
                Ok(ProvisioningPdu::Capabilities(Capabilities::decode(fixed)))
            }
            0x02 => {
                let fixed: &[u8; 5] =
                    parameters.try_into().map_err(|_| invalid(parameters.len()))?;
                Ok(ProvisioningPdu::Start(Start::decode(fixed)?))
            }
            0x03 => {
                let key: [u8; 64] =
                    parameters.try_into().map_err(|_| invalid(parameters.len()))?;
                Ok(ProvisioningPdu::PublicKey { key })
            }
            0x04 => parameters
                .is_empty()
                .then_some(ProvisioningPdu::InputComplete)
                .ok_or(invalid(parameters.len())),
            0x05 => {
                let value: [u8; 16] =
                    parameters.try_into().map_err(|_| invalid(parameters.len()))?;
                Ok(ProvisioningPdu::Confirmation { value })
            }
            0x06 => {
                let value: [u8; 16] =
                    parameters.try_into().map_err(|_| invalid(parameters.len()))?;
                Ok(ProvisioningPdu::Random { value })
            }
            0x07 => {
                let encrypted: [u8; 33] =
                    parameters.try_into().map_err(|_| invalid(parameters.len()))?;
                Ok(ProvisioningPdu::Data { encrypted })
            }
            0x08 => parameters
                .is_empty()
                .then_some(ProvisioningPdu::Complete)
                .ok_or(invalid(parameters.len())),
            0x09 => match parameters {
                [reason] => Ok(ProvisioningPdu::Failed {
                    reason: ProvisioningFailureCode::from_octet(*reason),
                }),
                _ => Err(invalid(parameters.len())),
            },
            other => Err(ProvisioningPduError::UnknownType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_capabilities() -> Capabilities {
        Capabilities {
            number_of_elements: 1,
            algorithms: ALGORITHMS_BIT_FIPS_P256,
            public_key_type: 0,
            static_oob_type: 0,
            output_oob_size: 4,
            output_oob_actions: 0x0008,
            input_oob_size: 0,
            input_oob_actions: 0,
        }
    }

    #[test]
    fn test_invite_roundtrip() {
        let pdu = ProvisioningPdu::Invite { attention: 5 };
        let encoded = pdu.encode();
        assert_eq!(encoded, vec![0x00, 0x05]);
        assert_eq!(ProvisioningPdu::decode(&encoded).unwrap(), pdu);
        assert_eq!(pdu.parameters(), vec![0x05]);
    }

    #[test]
    fn test_capabilities_roundtrip() {
        let pdu = ProvisioningPdu::Capabilities(sample_capabilities());
        let encoded = pdu.encode();
        assert_eq!(encoded.len(), 12);
        assert_eq!(ProvisioningPdu::decode(&encoded).unwrap(), pdu);
    }

    #[test]
    fn test_start_roundtrip() {
        let pdu = ProvisioningPdu::Start(Start {
            algorithm: ALGORITHM_FIPS_P256,
            public_key: 0,
            authentication_method: AuthenticationMethod::OutputOob,
            authentication_action: 3,
            authentication_size: 4,
        });
        let encoded = pdu.encode();
        assert_eq!(encoded, vec![0x02, 0x00, 0x00, 0x02, 0x03, 0x04]);
        assert_eq!(ProvisioningPdu::decode(&encoded).unwrap(), pdu);
    }

    #[test]
    fn test_fixed_payload_types() {
        for pdu in [
            ProvisioningPdu::PublicKey { key: [0xAB; 64] },
            ProvisioningPdu::Confirmation { value: [0x01; 16] },
            ProvisioningPdu::Random { value: [0x02; 16] },
            ProvisioningPdu::Data { encrypted: [0x03; 33] },
            ProvisioningPdu::InputComplete,
            ProvisioningPdu::Complete,
            ProvisioningPdu::Failed {
                reason: ProvisioningFailureCode::ConfirmationFailed,
            },
        ] {
            let encoded = pdu.encode();
            assert_eq!(ProvisioningPdu::decode(&encoded).unwrap(), pdu);
        }
    }

    #[test]
    fn test_strict_lengths() {
        // Truncated public key.
        let mut bad = vec![0x03];
        bad.extend_from_slice(&[0u8; 63]);
        assert!(matches!(
            ProvisioningPdu::decode(&bad),
            Err(ProvisioningPduError::InvalidLength {
                pdu_type: 0x03,
                length: 63
            })
        ));
        // Complete with trailing bytes.
        assert!(ProvisioningPdu::decode(&[0x08, 0x00]).is_err());
        // Unknown type.
        assert!(matches!(
            ProvisioningPdu::decode(&[0x0A]),
            Err(ProvisioningPduError::UnknownType(0x0A))
        ));
        assert_eq!(
            ProvisioningPdu::decode(&[]),
            Err(ProvisioningPduError::Empty)
        );
    }

    #[test]
    fn test_provisioning_data_layout() {
        let data = ProvisioningData {
            network_key: [0xEF; 16],
            key_index: 0x0567,
            flags: 0x00,
            iv_index: 0x01020304,
            unicast_address: 0x0B0C,
        };
        let bytes = data.to_bytes();
        assert_eq!(bytes.len(), 25);
        assert_eq!(&bytes[16..18], &[0x05, 0x67]);
        assert_eq!(&bytes[19..23], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[23..25], &[0x0B, 0x0C]);
        assert_eq!(ProvisioningData::from_bytes(&bytes), data);
    }
}
