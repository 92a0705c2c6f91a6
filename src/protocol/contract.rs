//! Commitment and settlement transaction layout of the payment channel.
//!
//! One funding transaction carries one commitment output per seller; that
//! output anchors the unidirectional channel between the buyer and that
//! seller. Every payment is a buyer signature over the settlement
//! transaction spending the anchor at the incremented balance; the seller
//! countersigns and broadcasts only when it wants to close.

use bitcoin::{
    absolute::LockTime,
    blockdata::{opcodes::all, script::Builder},
    secp256k1::{ecdsa::Signature, Message, Secp256k1, SecretKey},
    sighash::{EcdsaSighashType, SighashCache},
    transaction::Version,
    Amount, OutPoint, PubkeyHash, PublicKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Witness,
};

use super::error::ProtocolError;

/// Smallest output value the settlement transaction will create; smaller
/// payouts are folded into the transaction fee.
pub const DUST_LIMIT: u64 = 546;

/// One output of the multi-commitment funding transaction, committing the
/// channel value to one buyer/seller pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Commitment {
    /// Channel value locked in this output.
    pub value: Amount,
    /// Buyer key in the cooperative branch.
    pub buyer_contract_pk: PublicKey,
    /// Seller key in the cooperative branch.
    pub seller_contract_pk: PublicKey,
    /// Relative lock (in time units) of the buyer refund branch.
    pub lock: u16,
}

impl Commitment {
    pub fn redeemscript(&self) -> ScriptBuf {
        commitment_redeemscript(&self.buyer_contract_pk, &self.seller_contract_pk, self.lock)
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        redeemscript_to_scriptpubkey(&self.redeemscript())
    }

    pub fn tx_out(&self) -> TxOut {
        TxOut {
            value: self.value,
            script_pubkey: self.script_pubkey(),
        }
    }
}

/// The commitment witness script. The cooperative branch settles with both
/// keys; the refund branch returns the whole value to the buyer after the
/// relative lock expires.
#[rustfmt::skip]
pub fn commitment_redeemscript(
    buyer_contract_pk: &PublicKey,
    seller_contract_pk: &PublicKey,
    lock: u16,
) -> ScriptBuf {
    //spent with witnesses:
    //cooperative case:
    //<> <buyer_signature> <seller_signature> <1>
    //refund case, after `lock` expires:
    //<buyer_signature> <>
    Builder::new()
        .push_opcode(all::OP_IF)
            .push_opcode(all::OP_PUSHNUM_2)
            .push_key(buyer_contract_pk)
            .push_key(seller_contract_pk)
            .push_opcode(all::OP_PUSHNUM_2)
            .push_opcode(all::OP_CHECKMULTISIG)
        .push_opcode(all::OP_ELSE)
            .push_int(lock as i64)
            .push_opcode(all::OP_CSV)
            .push_opcode(all::OP_DROP)
            .push_key(buyer_contract_pk)
            .push_opcode(all::OP_CHECKSIG)
        .push_opcode(all::OP_ENDIF)
        .into_script()
}

pub fn redeemscript_to_scriptpubkey(redeemscript: &ScriptBuf) -> ScriptBuf {
    ScriptBuf::new_p2wsh(&redeemscript.wscript_hash())
}

/// Skeleton of the funding transaction carrying the given commitments in
/// order. Inputs and change are the wallet's business.
pub fn create_funding_transaction(commitments: &[Commitment]) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: Vec::new(),
        output: commitments.iter().map(Commitment::tx_out).collect(),
    }
}

/// Index of the commitment's output in a funding transaction.
pub fn find_commitment_output_index(
    funding_tx: &Transaction,
    commitment: &Commitment,
) -> Result<u32, ProtocolError> {
    let script_pubkey = commitment.script_pubkey();
    funding_tx
        .output
        .iter()
        .enumerate()
        .find(|(_i, o)| o.script_pubkey == script_pubkey)
        .map(|(index, _)| index as u32)
        .ok_or(ProtocolError::General(
            "funding transaction has no output paying to the commitment",
        ))
}

/// The settlement transaction for the channel at a given paid balance.
/// Sub-dust payouts are dropped into the fee.
pub fn create_settlement_transaction(
    anchor: &OutPoint,
    value: Amount,
    paid: Amount,
    settlement_fee: Amount,
    payee_final_pk_hash: &PubkeyHash,
    payor_final_pk_hash: &PubkeyHash,
) -> Transaction {
    let mut output = Vec::new();
    if paid.to_sat() >= DUST_LIMIT {
        output.push(TxOut {
            value: paid,
            script_pubkey: ScriptBuf::new_p2pkh(payee_final_pk_hash),
        });
    }
    let refund = value
        .to_sat()
        .saturating_sub(paid.to_sat())
        .saturating_sub(settlement_fee.to_sat());
    if refund >= DUST_LIMIT {
        output.push(TxOut {
            value: Amount::from_sat(refund),
            script_pubkey: ScriptBuf::new_p2pkh(payor_final_pk_hash),
        });
    }
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: *anchor,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ZERO,
            witness: Witness::new(),
        }],
        output,
    }
}

fn settlement_sighash(
    settlement_tx: &Transaction,
    commitment_redeemscript: &ScriptBuf,
    value: Amount,
) -> Result<Message, ProtocolError> {
    let input_index = 0;
    let sighash = SighashCache::new(settlement_tx).p2wsh_signature_hash(
        input_index,
        commitment_redeemscript,
        value,
        EcdsaSighashType::All,
    )?;
    Ok(Message::from_digest_slice(&sighash[..])?)
}

pub fn sign_settlement(
    settlement_tx: &Transaction,
    commitment_redeemscript: &ScriptBuf,
    value: Amount,
    privkey: &SecretKey,
) -> Result<Signature, ProtocolError> {
    let sighash = settlement_sighash(settlement_tx, commitment_redeemscript, value)?;
    let secp = Secp256k1::new();
    Ok(secp.sign_ecdsa(&sighash, privkey))
}

pub fn verify_settlement_sig(
    settlement_tx: &Transaction,
    commitment_redeemscript: &ScriptBuf,
    value: Amount,
    pubkey: &PublicKey,
    sig: &Signature,
) -> Result<(), ProtocolError> {
    let sighash = settlement_sighash(settlement_tx, commitment_redeemscript, value)?;
    let secp = Secp256k1::new();
    Ok(secp.verify_ecdsa(&sighash, sig, &pubkey.inner)?)
}
