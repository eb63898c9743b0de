use crate::crypto::address_from_pubkey_hex;
use crate::error::LedgerError;
use crate::transaction::Transaction;
use crate::utxo::UtxoView;

/// Transaction validity predicate, evaluated against a specific utxo snapshot.
/// Must be pure: the resolver calls it while holding the node lock.
pub trait TxValidator: Send + Sync {
    fn is_valid(&self, tx: &Transaction, utxo: &dyn UtxoView) -> bool;
}

/// Default predicate: signatures, ownership of every spent output and amount
/// conservation. Coinbase issuance is accepted as-is (reward policy is external).
#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureValidator;

impl SignatureValidator {
    pub fn check(&self, tx: &Transaction, utxo: &dyn UtxoView) -> Result<(), LedgerError> {
        if tx.is_coinbase() {
            return Ok(());
        }

        if !tx.verify_signatures()? {
            return Err(LedgerError::BadSignature {
                txid: tx.txid.clone(),
            });
        }

        let overflow = || LedgerError::AmountOverflow {
            txid: tx.txid.clone(),
        };
        let mut input_sum = 0u64;
        for inp in &tx.inputs {
            let op = inp.outpoint();
            let Some(spent) = utxo.get(&op) else {
                return Err(LedgerError::MissingInput(op));
            };

            let owner = address_from_pubkey_hex(&inp.pubkey)?;
            if owner != spent.to {
                return Err(LedgerError::WrongOwner {
                    outpoint: op,
                    expected: spent.to.clone(),
                    got: owner,
                });
            }

            input_sum = input_sum.checked_add(spent.amount).ok_or_else(overflow)?;
        }

        let output_sum = tx.output_total().ok_or_else(overflow)?;
        if output_sum > input_sum {
            return Err(LedgerError::Inflation {
                txid: tx.txid.clone(),
                inputs: input_sum,
                outputs: output_sum,
            });
        }
        Ok(())
    }
}

impl TxValidator for SignatureValidator {
    fn is_valid(&self, tx: &Transaction, utxo: &dyn UtxoView) -> bool {
        match self.check(tx, utxo) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("tx {} invalid: {}", tx.txid, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::WalletKeypair;
    use crate::transaction::{TransactionInput, TransactionOutput};
    use crate::utxo::{OutPoint, UtxoSet};

    fn funded(owner: &WalletKeypair, amount: u64) -> (UtxoSet, Transaction) {
        let cb = Transaction::coinbase_at(&owner.address(), amount, 1, 1).unwrap();
        let mut set = UtxoSet::new();
        set.apply_transaction(&cb).unwrap();
        (set, cb)
    }

    fn pay(from: &Transaction, to: &str, amount: u64, signer: &WalletKeypair) -> Transaction {
        let inp = TransactionInput::new(OutPoint::new(from.txid.clone(), 0));
        let mut tx = Transaction::new(vec![inp], vec![TransactionOutput::new(to, amount)]).unwrap();
        tx.sign(signer).unwrap();
        tx
    }

    #[test]
    fn accepts_owner_signed_spend() {
        let alice = WalletKeypair::new();
        let (set, cb) = funded(&alice, 10);
        let tx = pay(&cb, "bob", 10, &alice);
        assert!(SignatureValidator.is_valid(&tx, &set));
        assert!(SignatureValidator.is_valid(&cb, &UtxoSet::new()));
    }

    #[test]
    fn rejects_foreign_signer() {
        let alice = WalletKeypair::new();
        let mallory = WalletKeypair::new();
        let (set, cb) = funded(&alice, 10);
        let tx = pay(&cb, "mallory", 10, &mallory);
        let err = SignatureValidator.check(&tx, &set).unwrap_err();
        assert!(matches!(err, LedgerError::WrongOwner { ref expected, .. } if *expected == alice.address()));
    }

    #[test]
    fn rejects_inflation_and_unsigned() {
        let alice = WalletKeypair::new();
        let (set, cb) = funded(&alice, 10);
        let tx = pay(&cb, "bob", 11, &alice);
        assert!(matches!(
            SignatureValidator.check(&tx, &set),
            Err(LedgerError::Inflation { inputs: 10, outputs: 11, .. })
        ));

        let inp = TransactionInput::new(OutPoint::new(cb.txid.clone(), 0));
        let unsigned = Transaction::new(vec![inp], vec![TransactionOutput::new("bob", 1)]).unwrap();
        assert!(!SignatureValidator.is_valid(&unsigned, &set));
        assert!(matches!(
            SignatureValidator.check(&unsigned, &set),
            Err(LedgerError::BadSignature { .. })
        ));
    }

    #[test]
    fn rejects_spend_of_unknown_output() {
        let alice = WalletKeypair::new();
        let (_set, cb) = funded(&alice, 10);
        let tx = pay(&cb, "bob", 1, &alice);
        assert!(!SignatureValidator.is_valid(&tx, &UtxoSet::new()));
        assert!(matches!(
            SignatureValidator.check(&tx, &UtxoSet::new()),
            Err(LedgerError::MissingInput(_))
        ));
    }
}
