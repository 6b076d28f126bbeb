// SPDX-License-Identifier: CC0-1.0

//! Per-PSBT memoization.
//!
//! Resolving a spend utxo from a non-witness parent costs a txid computation
//! per lookup, and the taproot sighash midstates span every input of the
//! transaction. Both are computed once per PSBT here and reused until the
//! caller invalidates the cache.

use crate::psbt::{Error, Psbt};
use crate::script::ScriptBuf;
use crate::sighash::SighashCache;
use crate::transaction::{Transaction, TxOut};

/// How much of a [`PsbtCache`] to discard.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Invalidate {
    /// Inputs changed: every memoized value is stale.
    Full,
    /// Only outputs changed: prevout resolutions stay valid, fee and sighash
    /// midstates do not.
    Outputs,
}

/// Memoized values derived from one PSBT.
///
/// Not meant to be shared across PSBTs; after mutating the PSBT call
/// [`PsbtCache::invalidate`] with the matching scope.
#[derive(Debug, Default)]
pub struct PsbtCache {
    spend_utxos: Vec<Option<TxOut>>,
    fee: Option<u64>,
    fee_rate: Option<u64>,
    sighash: Option<SighashCache<Transaction>>,
}

impl PsbtCache {
    /// Constructs an empty cache sized for `psbt`.
    pub fn new(psbt: &Psbt) -> Self {
        PsbtCache {
            spend_utxos: vec![None; psbt.inputs.len()],
            fee: None,
            fee_rate: None,
            sighash: None,
        }
    }

    /// Returns the utxo spent by the input at `input_index`, resolving and
    /// memoizing it on first use.
    pub fn spend_utxo(&mut self, psbt: &Psbt, input_index: usize) -> Result<&TxOut, Error> {
        // The PSBT may have gained inputs since construction or the last
        // full invalidation.
        if self.spend_utxos.len() < psbt.inputs.len() {
            self.spend_utxos.resize(psbt.inputs.len(), None);
        }
        if input_index >= self.spend_utxos.len() {
            return Err(Error::IndexOutOfBounds { index: input_index, length: self.spend_utxos.len() });
        }
        if self.spend_utxos[input_index].is_none() {
            self.spend_utxos[input_index] = Some(psbt.spend_utxo(input_index)?.clone());
        }
        Ok(self.spend_utxos[input_index].as_ref().expect("just inserted"))
    }

    /// Returns the script pubkey and value spent by the input at
    /// `input_index`.
    pub fn script_and_amount(
        &mut self,
        psbt: &Psbt,
        input_index: usize,
    ) -> Result<(ScriptBuf, u64), Error> {
        let utxo = self.spend_utxo(psbt, input_index)?;
        Ok((utxo.script_pubkey.clone(), utxo.value))
    }

    /// Resolves the spent utxo of every input, in input order.
    ///
    /// The taproot sighash commits to all prevouts at once, so script-path
    /// and key-path hashing both start here.
    pub fn all_spend_utxos(&mut self, psbt: &Psbt) -> Result<Vec<TxOut>, Error> {
        for input_index in 0..psbt.inputs.len() {
            self.spend_utxo(psbt, input_index)?;
        }
        Ok(self
            .spend_utxos
            .iter()
            .map(|utxo| utxo.clone().expect("all resolved above"))
            .collect())
    }

    /// Calculates transaction fee: summed spent values minus summed output
    /// values.
    ///
    /// Every input must already be finalized. The result is memoized.
    ///
    /// # Errors
    ///
    /// [`Error::NegativeFee`] if the outputs are worth more than the inputs,
    /// [`Error::FeeOverflow`] on value overflow, [`Error::InputNotFinalized`]
    /// if any input lacks its final scripts.
    pub fn fee(&mut self, psbt: &Psbt) -> Result<u64, Error> {
        if let Some(fee) = self.fee {
            return Ok(fee);
        }
        let (inputs, outputs) = self.summed_values(psbt)?;
        let fee = inputs.checked_sub(outputs).ok_or(Error::NegativeFee)?;
        self.fee = Some(fee);
        Ok(fee)
    }

    /// Like [`PsbtCache::fee`] but tolerates outputs worth more than the
    /// inputs, returning the difference, which may be negative.
    ///
    /// For callers who expect a deficit, for example when inspecting a
    /// transaction someone else is funding. Not memoized.
    pub fn fee_tolerating_deficit(&mut self, psbt: &Psbt) -> Result<i64, Error> {
        let (inputs, outputs) = self.summed_values(psbt)?;
        let inputs = i64::try_from(inputs).map_err(|_| Error::FeeOverflow)?;
        let outputs = i64::try_from(outputs).map_err(|_| Error::FeeOverflow)?;
        inputs.checked_sub(outputs).ok_or(Error::FeeOverflow)
    }

    /// Sums the spent input values and the output values.
    ///
    /// Every input must already be finalized.
    fn summed_values(&mut self, psbt: &Psbt) -> Result<(u64, u64), Error> {
        // Extraction fails unless every input is finalized.
        psbt.extract_tx()?;

        let mut inputs: u64 = 0;
        for input_index in 0..psbt.inputs.len() {
            let value = self.spend_utxo(psbt, input_index)?.value;
            inputs = inputs.checked_add(value).ok_or(Error::FeeOverflow)?;
        }
        let mut outputs: u64 = 0;
        for txout in &psbt.unsigned_tx.output {
            outputs = outputs.checked_add(txout.value).ok_or(Error::FeeOverflow)?;
        }
        Ok((inputs, outputs))
    }

    /// Calculates the fee rate in satoshis per virtual byte, rounded down.
    ///
    /// Like [`PsbtCache::fee`] this requires a fully finalized PSBT and
    /// memoizes its result.
    pub fn fee_rate(&mut self, psbt: &Psbt) -> Result<u64, Error> {
        if let Some(fee_rate) = self.fee_rate {
            return Ok(fee_rate);
        }
        let fee = self.fee(psbt)?;
        let tx = psbt.extract_tx()?;
        let fee_rate = fee / tx.vsize() as u64;
        self.fee_rate = Some(fee_rate);
        Ok(fee_rate)
    }

    /// Rejects the PSBT when its fee rate reaches `maximum_fee_rate`
    /// (satoshis per virtual byte).
    ///
    /// A fee rate at or above the maximum almost always means a fee
    /// calculation bug upstream, so this fails loudly instead of letting the
    /// transaction through.
    pub fn check_fees(&mut self, psbt: &Psbt, maximum_fee_rate: u64) -> Result<(), Error> {
        let fee_rate = self.fee_rate(psbt)?;
        if fee_rate >= maximum_fee_rate {
            return Err(Error::ExcessiveFeeRate { fee_rate, maximum: maximum_fee_rate });
        }
        Ok(())
    }

    /// Returns the sighash midstate cache over the unsigned transaction,
    /// building it on first use.
    pub fn sighash_cache(&mut self, psbt: &Psbt) -> &mut SighashCache<Transaction> {
        self.sighash.get_or_insert_with(|| SighashCache::new(psbt.unsigned_tx.clone()))
    }

    /// Discards memoized values per the given scope.
    pub fn invalidate(&mut self, scope: Invalidate) {
        match scope {
            Invalidate::Full => {
                // Cleared rather than nulled in place: the input set may
                // have grown or shrunk, so the next resolution resizes.
                self.spend_utxos.clear();
                self.fee = None;
                self.fee_rate = None;
                self.sighash = None;
            }
            Invalidate::Outputs => {
                self.fee = None;
                self.fee_rate = None;
                self.sighash = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psbt::Input;
    use crate::script::ScriptBuf;
    use crate::transaction::{OutPoint, TxIn};
    use crate::witness::Witness;

    fn finalized_psbt() -> Psbt {
        let tx = Transaction {
            version: 2,
            lock_time: 0,
            input: vec![TxIn {
                previous_output: OutPoint::default(),
                script_sig: ScriptBuf::new(),
                sequence: 0xFFFFFFFF,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: 45_000,
                script_pubkey: ScriptBuf::from_hex(
                    "001416e1ae70ff0fa102905d4af297f6912bda6cce19",
                )
                .unwrap(),
            }],
        };
        let mut psbt = Psbt::from_unsigned_tx(tx).unwrap();
        psbt.inputs[0] = Input {
            witness_utxo: Some(TxOut {
                value: 50_000,
                script_pubkey: ScriptBuf::from_hex(
                    "001479091972186c449eb1ded22b78e40d009bdf0089",
                )
                .unwrap(),
            }),
            final_script_witness: Some(Witness::from_slice(&[vec![0u8; 72], vec![0u8; 33]])),
            ..Default::default()
        };
        psbt
    }

    #[test]
    fn fee_is_inputs_minus_outputs() {
        let psbt = finalized_psbt();
        let mut cache = PsbtCache::new(&psbt);
        assert_eq!(cache.fee(&psbt).unwrap(), 5_000);
        // Memoized value survives a second call.
        assert_eq!(cache.fee(&psbt).unwrap(), 5_000);
    }

    #[test]
    fn fee_requires_finalized_inputs() {
        let mut psbt = finalized_psbt();
        psbt.inputs[0].final_script_witness = None;
        let mut cache = PsbtCache::new(&psbt);
        assert_eq!(cache.fee(&psbt).unwrap_err(), Error::InputNotFinalized { index: 0 });
    }

    #[test]
    fn negative_fee_rejected() {
        let mut psbt = finalized_psbt();
        psbt.unsigned_tx.output[0].value = 60_000;
        let mut cache = PsbtCache::new(&psbt);
        assert_eq!(cache.fee(&psbt).unwrap_err(), Error::NegativeFee);
        // The tolerant variant reports the deficit instead.
        assert_eq!(cache.fee_tolerating_deficit(&psbt).unwrap(), -10_000);
    }

    #[test]
    fn tolerant_fee_matches_strict_fee_on_surplus() {
        let psbt = finalized_psbt();
        let mut cache = PsbtCache::new(&psbt);
        assert_eq!(cache.fee_tolerating_deficit(&psbt).unwrap(), 5_000);
        assert_eq!(cache.fee(&psbt).unwrap(), 5_000);
    }

    #[test]
    fn excessive_fee_rate_rejected() {
        let psbt = finalized_psbt();
        let mut cache = PsbtCache::new(&psbt);
        let fee_rate = cache.fee_rate(&psbt).unwrap();
        assert!(fee_rate > 0);

        // One above the computed rate passes, the rate itself does not.
        cache.check_fees(&psbt, fee_rate + 1).unwrap();
        assert_eq!(
            cache.check_fees(&psbt, fee_rate).unwrap_err(),
            Error::ExcessiveFeeRate { fee_rate, maximum: fee_rate }
        );
    }

    #[test]
    fn invalidate_scopes() {
        let psbt = finalized_psbt();
        let mut cache = PsbtCache::new(&psbt);
        cache.fee(&psbt).unwrap();
        cache.spend_utxo(&psbt, 0).unwrap();

        cache.invalidate(Invalidate::Outputs);
        assert!(cache.fee.is_none());
        assert!(cache.spend_utxos[0].is_some());

        cache.invalidate(Invalidate::Full);
        assert!(cache.spend_utxos.is_empty());
        // The cleared cache still resolves on demand.
        assert_eq!(cache.spend_utxo(&psbt, 0).unwrap().value, 50_000);
    }

    #[test]
    fn full_invalidate_tracks_a_grown_input_set() {
        let mut psbt = finalized_psbt();
        let mut cache = PsbtCache::new(&psbt);
        cache.spend_utxo(&psbt, 0).unwrap();

        psbt.unsigned_tx.input.push(TxIn {
            previous_output: OutPoint { vout: 1, ..OutPoint::null() },
            script_sig: ScriptBuf::new(),
            sequence: 0xFFFFFFFF,
            witness: Witness::new(),
        });
        psbt.inputs.push(Input {
            witness_utxo: Some(TxOut {
                value: 30_000,
                script_pubkey: ScriptBuf::from_hex(
                    "001479091972186c449eb1ded22b78e40d009bdf0089",
                )
                .unwrap(),
            }),
            ..Default::default()
        });
        cache.invalidate(Invalidate::Full);

        assert_eq!(cache.spend_utxo(&psbt, 1).unwrap().value, 30_000);
        assert_eq!(cache.spend_utxo(&psbt, 0).unwrap().value, 50_000);
        assert_eq!(cache.all_spend_utxos(&psbt).unwrap().len(), 2);
    }
}
