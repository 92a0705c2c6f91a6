//! All protocol and payment-channel related errors.

use bitcoin::secp256k1;

/// Enum for handling contract and settlement related errors.
#[derive(Debug)]
pub enum ProtocolError {
    Secp(secp256k1::Error),
    Sighash(bitcoin::transaction::InputsIndexError),
    General(&'static str),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl From<secp256k1::Error> for ProtocolError {
    fn from(value: secp256k1::Error) -> Self {
        Self::Secp(value)
    }
}

impl From<bitcoin::transaction::InputsIndexError> for ProtocolError {
    fn from(value: bitcoin::transaction::InputsIndexError) -> Self {
        Self::Sighash(value)
    }
}
