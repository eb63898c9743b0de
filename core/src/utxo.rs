//! Unspent output set and the per-branch working snapshot.
//!
//! [`UtxoSet`] is the committed ledger of a node. Candidate branches are
//! evaluated on a [`UtxoSnapshot`]: an overlay of spent and created entries
//! over a borrowed committed set, so unmodified entries are shared rather
//! than copied. A finished snapshot is turned into a [`UtxoDelta`] and
//! applied to the committed set in one step.

use crate::block::Block;
use crate::error::LedgerError;
use crate::transaction::{Transaction, TxId};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Reference to a transaction output: (txid, output index).
#[derive(
    Encode, Decode, Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct OutPoint {
    pub txid: TxId,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: impl Into<TxId>, vout: u32) -> Self {
        Self {
            txid: txid.into(),
            vout,
        }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

#[derive(Encode, Decode, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub txid: TxId,
    pub vout: u32,
    pub to: String,
    pub amount: u64,
}

impl Utxo {
    pub fn new(txid: TxId, vout: u32, to: String, amount: u64) -> Self {
        Utxo {
            txid,
            vout,
            to,
            amount,
        }
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid.clone(), self.vout)
    }

    /// Entries created by `tx`, in output order.
    pub fn from_outputs(tx: &Transaction) -> impl Iterator<Item = Utxo> + '_ {
        tx.outputs
            .iter()
            .enumerate()
            .map(|(i, out)| Utxo::new(tx.txid.clone(), i as u32, out.to.clone(), out.amount))
    }
}

/// Read access to an unspent output set.
pub trait UtxoView {
    fn get(&self, outpoint: &OutPoint) -> Option<&Utxo>;

    fn contains(&self, outpoint: &OutPoint) -> bool {
        self.get(outpoint).is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoSet {
    entries: HashMap<OutPoint, Utxo>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full replay of `blocks` from an empty set, in order.
    pub fn replay<'a>(blocks: impl IntoIterator<Item = &'a Block>) -> Result<Self, LedgerError> {
        let mut set = UtxoSet::new();
        for block in blocks {
            for tx in &block.transactions {
                set.apply_transaction(tx)?;
            }
        }
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Utxo> {
        self.entries.values()
    }

    /// Spend the inputs of `tx` and add its outputs. Nothing changes on error.
    pub fn apply_transaction(&mut self, tx: &Transaction) -> Result<(), LedgerError> {
        check_transaction(&*self, tx)?;
        for op in tx.outpoints() {
            self.entries.remove(&op);
        }
        for utxo in Utxo::from_outputs(tx) {
            self.entries.insert(utxo.outpoint(), utxo);
        }
        Ok(())
    }

    pub fn apply_delta(&mut self, delta: UtxoDelta) {
        for op in &delta.spent {
            self.entries.remove(op);
        }
        for (op, utxo) in delta.created {
            self.entries.insert(op, utxo);
        }
    }

    pub fn owned_by<'a>(&'a self, address: &'a str) -> impl Iterator<Item = &'a Utxo> + 'a {
        self.entries.values().filter(move |u| u.to == address)
    }

    pub fn balance_of(&self, address: &str) -> u64 {
        self.owned_by(address)
            .fold(0u64, |acc, u| acc.saturating_add(u.amount))
    }
}

impl UtxoView for UtxoSet {
    fn get(&self, outpoint: &OutPoint) -> Option<&Utxo> {
        self.entries.get(outpoint)
    }
}

/// Every input must exist in `view` and appear only once in `tx`, and no
/// output of `tx` may already exist.
fn check_transaction(view: &dyn UtxoView, tx: &Transaction) -> Result<(), LedgerError> {
    let mut used = HashSet::with_capacity(tx.inputs.len());
    for op in tx.outpoints() {
        if !view.contains(&op) {
            return Err(LedgerError::MissingInput(op));
        }
        if !used.insert(op.clone()) {
            return Err(LedgerError::DuplicateInput {
                txid: tx.txid.clone(),
                outpoint: op,
            });
        }
    }
    for i in 0..tx.outputs.len() {
        let op = OutPoint::new(tx.txid.clone(), i as u32);
        if view.contains(&op) {
            return Err(LedgerError::OutputExists(op));
        }
    }
    Ok(())
}

/// Net changes of a snapshot relative to its base set.
#[derive(Debug, Default)]
pub struct UtxoDelta {
    pub spent: HashSet<OutPoint>,
    pub created: HashMap<OutPoint, Utxo>,
}

/// Copy-on-write view over a committed [`UtxoSet`].
pub struct UtxoSnapshot<'a> {
    base: &'a UtxoSet,
    spent: HashSet<OutPoint>,
    created: HashMap<OutPoint, Utxo>,
}

impl<'a> UtxoSnapshot<'a> {
    pub fn new(base: &'a UtxoSet) -> Self {
        Self {
            base,
            spent: HashSet::new(),
            created: HashMap::new(),
        }
    }

    fn spend(&mut self, op: &OutPoint) {
        self.created.remove(op);
        if self.base.contains(op) {
            self.spent.insert(op.clone());
        }
    }

    fn create(&mut self, utxo: Utxo) {
        let op = utxo.outpoint();
        self.spent.remove(&op);
        self.created.insert(op, utxo);
    }

    /// Apply `tx` and return the entries it consumed, in input order, so the
    /// caller can revert it later. Nothing changes on error.
    pub fn apply_transaction(&mut self, tx: &Transaction) -> Result<Vec<Utxo>, LedgerError> {
        check_transaction(&*self, tx)?;
        let consumed: Vec<Utxo> = tx
            .outpoints()
            .filter_map(|op| self.get(&op).cloned())
            .collect();
        for utxo in &consumed {
            self.spend(&utxo.outpoint());
        }
        for utxo in Utxo::from_outputs(tx) {
            self.create(utxo);
        }
        Ok(consumed)
    }

    /// Undo `tx`: drop its outputs and put back `restored`, the entries its
    /// inputs consumed. Nothing changes on error.
    pub fn unapply_transaction(
        &mut self,
        tx: &Transaction,
        restored: &[Utxo],
    ) -> Result<(), LedgerError> {
        let produced: Vec<OutPoint> = Utxo::from_outputs(tx).map(|u| u.outpoint()).collect();
        if let Some(missing) = produced.iter().find(|op| !self.contains(op)) {
            return Err(LedgerError::MissingOutput(missing.clone()));
        }
        for op in &produced {
            self.spend(op);
        }
        for utxo in restored {
            self.create(utxo.clone());
        }
        Ok(())
    }

    pub fn into_delta(self) -> UtxoDelta {
        UtxoDelta {
            spent: self.spent,
            created: self.created,
        }
    }
}

impl UtxoView for UtxoSnapshot<'_> {
    fn get(&self, outpoint: &OutPoint) -> Option<&Utxo> {
        if let Some(utxo) = self.created.get(outpoint) {
            return Some(utxo);
        }
        if self.spent.contains(outpoint) {
            return None;
        }
        self.base.get(outpoint)
    }
}
