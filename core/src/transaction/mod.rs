use crate::crypto::WalletKeypair;
use crate::error::LedgerError;
use crate::utxo::OutPoint;
use bincode::error::EncodeError;
use bincode::{Decode, Encode, config};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub static BINCODE_CONFIG: Lazy<config::Configuration> = Lazy::new(|| config::standard());

/// Hex encoded double sha256 of a transaction body.
pub type TxId = String;

/// Input: previous txid and vout index
#[derive(Encode, Decode, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TransactionInput {
    pub txid: TxId,
    pub vout: u32,
    pub pubkey: String,            // hex of compressed secp256k1 public key
    pub signature: Option<String>, // hex of 64 byte compact signature
}

impl TransactionInput {
    pub fn new(outpoint: OutPoint) -> Self {
        Self {
            txid: outpoint.txid,
            vout: outpoint.vout,
            pubkey: String::new(),
            signature: None,
        }
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid.clone(), self.vout)
    }
}

/// Output: recipient address + amount
#[derive(Encode, Decode, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TransactionOutput {
    pub to: String,
    pub amount: u64,
}

impl TransactionOutput {
    pub fn new(to: impl Into<String>, amount: u64) -> Self {
        Self {
            to: to.into(),
            amount,
        }
    }
}

#[derive(Encode, Decode, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub txid: TxId,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub timestamp: i64,
    /// Distinguishes otherwise identical coinbase transactions.
    pub nonce: u64,
}

impl Transaction {
    /// Unsigned transaction spending `inputs`; call [`Transaction::sign`] before submitting.
    pub fn new(
        inputs: Vec<TransactionInput>,
        outputs: Vec<TransactionOutput>,
    ) -> Result<Self, EncodeError> {
        Transaction {
            txid: String::new(),
            inputs,
            outputs,
            timestamp: chrono::Utc::now().timestamp(),
            nonce: 0,
        }
        .with_txid()
    }

    pub fn coinbase(to: &str, amount: u64) -> Result<Self, EncodeError> {
        Self::coinbase_at(to, amount, chrono::Utc::now().timestamp(), rand::random())
    }

    /// Deterministic coinbase, used for genesis.
    pub fn coinbase_at(
        to: &str,
        amount: u64,
        timestamp: i64,
        nonce: u64,
    ) -> Result<Self, EncodeError> {
        Transaction {
            txid: String::new(),
            inputs: vec![],
            outputs: vec![TransactionOutput::new(to, amount)],
            timestamp,
            nonce,
        }
        .with_txid()
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn outpoints(&self) -> impl Iterator<Item = OutPoint> + '_ {
        self.inputs.iter().map(TransactionInput::outpoint)
    }

    /// Sum of output amounts, `None` on overflow.
    pub fn output_total(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.amount))
    }

    /// Bytes covered by both the txid and the signatures (pubkeys and signatures excluded).
    pub fn serialize_for_hash(&self) -> Result<Vec<u8>, EncodeError> {
        let inputs_for_hash: Vec<_> = self
            .inputs
            .iter()
            .map(|i| (i.txid.clone(), i.vout))
            .collect();

        bincode::encode_to_vec(
            &(&inputs_for_hash, &self.outputs, &self.timestamp, &self.nonce),
            *BINCODE_CONFIG,
        )
    }

    pub fn compute_txid(&self) -> Result<TxId, EncodeError> {
        let bytes = self.serialize_for_hash()?;
        let h1 = Sha256::digest(&bytes);
        let h2 = Sha256::digest(h1);
        Ok(hex::encode(h2))
    }

    pub fn with_txid(mut self) -> Result<Self, EncodeError> {
        self.txid = self.compute_txid()?;
        Ok(self)
    }

    /// Sign every input with `keypair`.
    pub fn sign(&mut self, keypair: &WalletKeypair) -> Result<(), EncodeError> {
        let tx_bytes = self.serialize_for_hash()?;
        let sig_hex = hex::encode(keypair.sign(&tx_bytes));
        let pk_hex = keypair.public_hex();

        for inp in &mut self.inputs {
            inp.signature = Some(sig_hex.clone());
            inp.pubkey = pk_hex.clone();
        }
        Ok(())
    }

    /// Check each input signature against its declared public key.
    /// Ownership of the spent output is checked by the validator.
    pub fn verify_signatures(&self) -> Result<bool, LedgerError> {
        if self.inputs.is_empty() {
            return Ok(true);
        }

        let tx_bytes = self.serialize_for_hash()?;

        for inp in &self.inputs {
            let Some(sig_hex) = inp.signature.as_ref() else {
                return Ok(false);
            };
            let Ok(sig_bytes) = hex::decode(sig_hex) else {
                return Ok(false);
            };
            if !crate::crypto::verify_signature(&inp.pubkey, &tx_bytes, &sig_bytes) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn verify_txid(&self) -> Result<(), LedgerError> {
        let computed = self.compute_txid()?;
        if computed != self.txid {
            return Err(LedgerError::TxIdMismatch {
                computed,
                claimed: self.txid.clone(),
            });
        }
        Ok(())
    }
}
