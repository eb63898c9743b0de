use crate::error::MempoolError;
use crate::transaction::{Transaction, TxId};
use crate::utxo::{OutPoint, UtxoView};
use crate::validation::TxValidator;
use std::collections::{HashMap, HashSet};

/// Pending transactions in insertion order.
///
/// Every input of every pending transaction is unspent in the utxo set the
/// pool was last checked against, and no two pending transactions spend the
/// same output.
#[derive(Debug, Clone, Default)]
pub struct Mempool {
    pending: Vec<Transaction>,
    /// outpoint -> txid of the pending transaction spending it
    spent_by: HashMap<OutPoint, TxId>,
    txids: HashSet<TxId>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.pending
    }

    pub fn contains(&self, txid: &str) -> bool {
        self.txids.contains(txid)
    }

    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.spent_by.contains_key(outpoint)
    }

    /// Admission check for a transaction offered to the pool.
    pub fn check(
        &self,
        tx: &Transaction,
        utxo: &dyn UtxoView,
        validator: &dyn TxValidator,
    ) -> Result<(), MempoolError> {
        if tx.is_coinbase() {
            return Err(MempoolError::Coinbase(tx.txid.clone()));
        }
        if self.contains(&tx.txid) {
            return Err(MempoolError::AlreadyKnown(tx.txid.clone()));
        }
        for outpoint in tx.outpoints() {
            if !utxo.contains(&outpoint) {
                return Err(MempoolError::MissingInput {
                    txid: tx.txid.clone(),
                    outpoint,
                });
            }
            if let Some(other) = self.spent_by.get(&outpoint) {
                return Err(MempoolError::Conflict {
                    txid: tx.txid.clone(),
                    other: other.clone(),
                    outpoint,
                });
            }
        }
        if !validator.is_valid(tx, utxo) {
            return Err(MempoolError::Invalid(tx.txid.clone()));
        }
        Ok(())
    }

    pub fn try_insert(
        &mut self,
        tx: Transaction,
        utxo: &dyn UtxoView,
        validator: &dyn TxValidator,
    ) -> Result<(), MempoolError> {
        self.check(&tx, utxo, validator)?;
        self.push(tx);
        Ok(())
    }

    fn push(&mut self, tx: Transaction) {
        for outpoint in tx.outpoints() {
            self.spent_by.insert(outpoint, tx.txid.clone());
        }
        self.txids.insert(tx.txid.clone());
        self.pending.push(tx);
    }

    /// Remove and return up to `n` transactions from the front of the pool.
    pub fn take(&mut self, n: usize) -> Vec<Transaction> {
        let n = n.min(self.pending.len());
        let taken: Vec<Transaction> = self.pending.drain(..n).collect();
        for tx in &taken {
            for outpoint in tx.outpoints() {
                self.spent_by.remove(&outpoint);
            }
            self.txids.remove(&tx.txid);
        }
        taken
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.spent_by.clear();
        self.txids.clear();
    }

    /// Offer transactions rolled back out of an abandoned chain suffix.
    /// Returns how many were admitted.
    pub fn readmit(
        &mut self,
        txs: impl IntoIterator<Item = Transaction>,
        utxo: &dyn UtxoView,
        validator: &dyn TxValidator,
    ) -> usize {
        let mut admitted = 0;
        for tx in txs {
            if tx.is_coinbase() {
                continue;
            }
            match self.try_insert(tx, utxo, validator) {
                Ok(()) => admitted += 1,
                Err(e) => log::debug!("rolled back tx not readmitted: {}", e),
            }
        }
        admitted
    }
}

/// Recompute the pool after a chain replacement: keep, in their original
/// order, the transactions whose inputs are all unspent in `new_utxo`.
/// Dropped ones were either included in the new chain or conflict with it.
pub fn reconcile(old: Mempool, new_utxo: &dyn UtxoView) -> Mempool {
    let before = old.len();
    let mut pool = Mempool::new();
    for tx in old.pending {
        if tx.outpoints().all(|op| new_utxo.contains(&op)) {
            pool.push(tx);
        }
    }
    let dropped = before - pool.len();
    if dropped > 0 {
        log::info!(
            "Mempool reconciled: {} kept, {} dropped (included or conflicting)",
            pool.len(),
            dropped
        );
    }
    pool
}
