//! Unidirectional payment channel primitives.
//!
//! A channel lives in one commitment output of the funding transaction.
//! [Payor] is the buying side: it tracks the paid balance and produces a
//! settlement signature per increment. [Payee] is the selling side: it
//! verifies and registers each signature, keeping the latest one so the
//! host can countersign and broadcast the settlement when closing.

use bitcoin::{
    secp256k1::{
        ecdsa::Signature,
        rand::{rngs::OsRng, RngCore},
        Secp256k1, SecretKey,
    },
    Amount, OutPoint, PubkeyHash, PublicKey,
};

use crate::protocol::{contract, error::ProtocolError};

/// A contract key pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPair {
    pub sk: SecretKey,
    pub pk: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Result<KeyPair, ProtocolError> {
        let mut key_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut key_bytes);
        let sk = SecretKey::from_slice(&key_bytes)?;
        let secp = Secp256k1::new();
        let pk = PublicKey {
            compressed: true,
            inner: bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &sk),
        };
        Ok(KeyPair { sk, pk })
    }
}

/// Buying side of a channel.
#[derive(Debug, Clone)]
pub struct Payor {
    price: u64,
    lock: u16,
    settlement_fee: u64,
    value: Amount,
    anchor: OutPoint,
    contract_keypair: KeyPair,
    final_pk_hash: PubkeyHash,
    payee_contract_pk: PublicKey,
    payee_final_pk_hash: PubkeyHash,
    number_of_payments_made: u64,
}

#[allow(clippy::too_many_arguments)]
impl Payor {
    pub fn new(
        price: u64,
        lock: u16,
        settlement_fee: u64,
        value: Amount,
        anchor: OutPoint,
        contract_keypair: KeyPair,
        final_pk_hash: PubkeyHash,
        payee_contract_pk: PublicKey,
        payee_final_pk_hash: PubkeyHash,
    ) -> Payor {
        Payor {
            price,
            lock,
            settlement_fee,
            value,
            anchor,
            contract_keypair,
            final_pk_hash,
            payee_contract_pk,
            payee_final_pk_hash,
            number_of_payments_made: 0,
        }
    }

    pub fn price(&self) -> u64 {
        self.price
    }

    pub fn number_of_payments_made(&self) -> u64 {
        self.number_of_payments_made
    }

    pub fn amount_paid(&self) -> Amount {
        Amount::from_sat(self.number_of_payments_made * self.price)
    }

    pub fn value(&self) -> Amount {
        self.value
    }

    pub fn anchor(&self) -> OutPoint {
        self.anchor
    }

    pub fn contract_pk(&self) -> PublicKey {
        self.contract_keypair.pk
    }

    pub fn final_pk_hash(&self) -> PubkeyHash {
        self.final_pk_hash
    }

    /// Whether one more increment still fits in the channel.
    pub fn can_make_payment(&self) -> bool {
        (self.number_of_payments_made + 1) * self.price + self.settlement_fee
            <= self.value.to_sat()
    }

    /// Increments the counter and signs the settlement transaction at the
    /// new balance.
    pub fn make_payment(&mut self) -> Result<Signature, ProtocolError> {
        if !self.can_make_payment() {
            return Err(ProtocolError::General("payment channel exhausted"));
        }
        self.number_of_payments_made += 1;
        let settlement_tx = contract::create_settlement_transaction(
            &self.anchor,
            self.value,
            self.amount_paid(),
            Amount::from_sat(self.settlement_fee),
            &self.payee_final_pk_hash,
            &self.final_pk_hash,
        );
        let redeemscript = contract::commitment_redeemscript(
            &self.contract_keypair.pk,
            &self.payee_contract_pk,
            self.lock,
        );
        contract::sign_settlement(
            &settlement_tx,
            &redeemscript,
            self.value,
            &self.contract_keypair.sk,
        )
    }
}

/// Selling side of a channel.
#[derive(Debug, Clone)]
pub struct Payee {
    price: u64,
    lock: u16,
    settlement_fee: u64,
    value: Amount,
    anchor: OutPoint,
    contract_keypair: KeyPair,
    final_pk_hash: PubkeyHash,
    payor_contract_pk: PublicKey,
    payor_final_pk_hash: PubkeyHash,
    number_of_payments_made: u64,
    last_valid_payment_signature: Option<Signature>,
}

#[allow(clippy::too_many_arguments)]
impl Payee {
    pub fn new(
        price: u64,
        lock: u16,
        settlement_fee: u64,
        value: Amount,
        anchor: OutPoint,
        contract_keypair: KeyPair,
        final_pk_hash: PubkeyHash,
        payor_contract_pk: PublicKey,
        payor_final_pk_hash: PubkeyHash,
    ) -> Payee {
        Payee {
            price,
            lock,
            settlement_fee,
            value,
            anchor,
            contract_keypair,
            final_pk_hash,
            payor_contract_pk,
            payor_final_pk_hash,
            number_of_payments_made: 0,
            last_valid_payment_signature: None,
        }
    }

    pub fn price(&self) -> u64 {
        self.price
    }

    pub fn number_of_payments_made(&self) -> u64 {
        self.number_of_payments_made
    }

    pub fn amount_paid(&self) -> Amount {
        Amount::from_sat(self.number_of_payments_made * self.price)
    }

    pub fn value(&self) -> Amount {
        self.value
    }

    pub fn anchor(&self) -> OutPoint {
        self.anchor
    }

    pub fn contract_pk(&self) -> PublicKey {
        self.contract_keypair.pk
    }

    pub fn last_valid_payment_signature(&self) -> Option<Signature> {
        self.last_valid_payment_signature
    }

    /// How many increments the channel can carry in total.
    pub fn max_number_of_payments(&self) -> u64 {
        if self.price == 0 {
            return 0;
        }
        self.value.to_sat().saturating_sub(self.settlement_fee) / self.price
    }

    /// Verifies the settlement signature for one more increment; registers
    /// it when valid.
    pub fn register_payment(&mut self, signature: &Signature) -> Result<bool, ProtocolError> {
        let next_paid = Amount::from_sat((self.number_of_payments_made + 1) * self.price);
        let settlement_tx = contract::create_settlement_transaction(
            &self.anchor,
            self.value,
            next_paid,
            Amount::from_sat(self.settlement_fee),
            &self.final_pk_hash,
            &self.payor_final_pk_hash,
        );
        let redeemscript = contract::commitment_redeemscript(
            &self.payor_contract_pk,
            &self.contract_keypair.pk,
            self.lock,
        );
        match contract::verify_settlement_sig(
            &settlement_tx,
            &redeemscript,
            self.value,
            &self.payor_contract_pk,
            signature,
        ) {
            Ok(()) => {
                self.number_of_payments_made += 1;
                self.last_valid_payment_signature = Some(*signature);
                Ok(true)
            }
            Err(ProtocolError::Secp(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
