//! Withdrawal transaction builder.
//!
//! Builds the unsigned multi-output L1 spend for a batch of withdraw
//! intents: one payment output per destination, a change output back to the
//! listen address, and a 2-of-N multisig witness script attached to every
//! input. The result ships as a base64 PSBT with the settled L2 tx hashes
//! embedded as an opaque unknown field, so signers and the broadcaster carry
//! the full batch context in one artifact.

use std::str::FromStr;

use bitcoin::absolute::LockTime;
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::psbt::raw;
use bitcoin::script::Builder as ScriptBuilder;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, Network, OutPoint, Psbt, PublicKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Txid, Witness,
};
use thiserror::Error;

use crate::custody::ListenUtxo;

/// PSBT unknown-field key carrying the settled L2 tx hash list.
pub const TX_HASHES_KEY: &[u8] = b"b2TxHashes";

/// Co-signers required to spend.
const MULTISIG_THRESHOLD: i64 = 2;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid public key: {0}")]
    InvalidPubkey(String),

    #[error("invalid txid: {0}")]
    InvalidTxid(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("insufficient funds: need {required} sats, have {available} sats")]
    InsufficientFunds { required: i64, available: i64 },

    #[error("no unspent outputs")]
    NoUtxos,

    #[error("psbt error: {0}")]
    Psbt(String),
}

/// An unsigned batch spend ready for the signing coordinator.
#[derive(Debug, Clone)]
pub struct BuiltWithdrawal {
    /// Pre-signature txid, the coordinator's key for this batch.
    pub btc_tx_id: String,
    /// Base64 PSBT.
    pub psbt: String,
}

pub struct WithdrawalBuilder {
    network: Network,
    listen_address: String,
    /// Flat fee reserved per batch.
    fee: i64,
    multisig_pubkeys: Vec<String>,
}

impl WithdrawalBuilder {
    pub fn new(
        network: Network,
        listen_address: String,
        fee: i64,
        multisig_pubkeys: Vec<String>,
    ) -> Self {
        Self {
            network,
            listen_address,
            fee,
            multisig_pubkeys,
        }
    }

    /// Build the batch spend. Inputs are consumed in the order given until
    /// they cover Σ amounts + fee; the remainder returns to the listen
    /// address as change.
    pub fn build(
        &self,
        destinations: &[(String, i64)],
        utxos: &[ListenUtxo],
        b2_tx_hashes: &[u8],
    ) -> Result<BuiltWithdrawal, BuildError> {
        if utxos.is_empty() {
            return Err(BuildError::NoUtxos);
        }

        let change_address = self.parse_address(&self.listen_address)?;

        let mut outputs = Vec::with_capacity(destinations.len() + 1);
        let mut transfer_total: i64 = 0;
        for (destination, amount) in destinations {
            if *amount <= 0 {
                return Err(BuildError::InvalidAmount(*amount));
            }
            let address = self.parse_address(destination)?;
            outputs.push(TxOut {
                value: Amount::from_sat(*amount as u64),
                script_pubkey: address.script_pubkey(),
            });
            transfer_total += amount;
        }

        let witness_script = self.multisig_script()?;

        let mut inputs = Vec::new();
        let mut psbt_inputs = Vec::new();
        let mut input_total: i64 = 0;
        for utxo in utxos {
            let txid = Txid::from_str(&utxo.txid)
                .map_err(|e| BuildError::InvalidTxid(e.to_string()))?;
            inputs.push(TxIn {
                previous_output: OutPoint {
                    txid,
                    vout: utxo.vout,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            });

            let mut psbt_input = bitcoin::psbt::Input::default();
            psbt_input.witness_utxo = Some(TxOut {
                value: Amount::from_sat(utxo.satoshi as u64),
                script_pubkey: witness_script.clone(),
            });
            psbt_input.witness_script = Some(witness_script.clone());
            psbt_inputs.push(psbt_input);

            input_total += utxo.satoshi;
            if input_total > transfer_total + self.fee {
                break;
            }
        }

        let change = input_total - self.fee - transfer_total;
        if change < 0 {
            return Err(BuildError::InsufficientFunds {
                required: transfer_total + self.fee,
                available: input_total,
            });
        }
        outputs.push(TxOut {
            value: Amount::from_sat(change as u64),
            script_pubkey: change_address.script_pubkey(),
        });

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs,
            output: outputs,
        };
        let btc_tx_id = tx.compute_txid().to_string();

        let mut psbt =
            Psbt::from_unsigned_tx(tx).map_err(|e| BuildError::Psbt(e.to_string()))?;
        psbt.inputs = psbt_inputs;
        psbt.unknown.insert(
            raw::Key {
                type_value: 0xfc,
                key: TX_HASHES_KEY.to_vec(),
            },
            b2_tx_hashes.to_vec(),
        );

        Ok(BuiltWithdrawal {
            btc_tx_id,
            psbt: psbt.to_string(),
        })
    }

    fn parse_address(&self, address: &str) -> Result<bitcoin::Address, BuildError> {
        bitcoin::Address::from_str(address)
            .map_err(|e| BuildError::InvalidAddress(format!("{address}: {e}")))?
            .require_network(self.network)
            .map_err(|e| BuildError::InvalidAddress(format!("{address}: {e}")))
    }

    /// 2-of-N CHECKMULTISIG witness script over the configured co-signer
    /// keys.
    fn multisig_script(&self) -> Result<ScriptBuf, BuildError> {
        let mut builder = ScriptBuilder::new().push_int(MULTISIG_THRESHOLD);
        for pubkey_hex in &self.multisig_pubkeys {
            let pubkey = PublicKey::from_str(pubkey_hex)
                .map_err(|e| BuildError::InvalidPubkey(format!("{pubkey_hex}: {e}")))?;
            builder = builder.push_key(&pubkey);
        }
        Ok(builder
            .push_int(self.multisig_pubkeys.len() as i64)
            .push_opcode(OP_CHECKMULTISIG)
            .into_script())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    // regtest-encoded bech32 addresses and arbitrary valid compressed keys
    const LISTEN: &str = "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080";
    const DEST_1: &str = "bcrt1qrp33g0q5c5txsp9arysrx4k6zdkfs4nce4xj0gdcccefvpysxf3qzf4jry";
    const PUBKEY_1: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";
    const PUBKEY_2: &str = "02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5";

    fn builder(fee: i64) -> WithdrawalBuilder {
        WithdrawalBuilder::new(
            Network::Regtest,
            LISTEN.to_string(),
            fee,
            vec![PUBKEY_1.to_string(), PUBKEY_2.to_string()],
        )
    }

    fn utxo(satoshi: i64) -> ListenUtxo {
        ListenUtxo {
            txid: "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
                .to_string(),
            vout: 0,
            satoshi,
            script_pk: "0014ab".to_string(),
        }
    }

    #[test]
    fn test_batch_outputs_and_change() {
        let b = builder(100);
        let destinations = vec![
            (DEST_1.to_string(), 500),
            (LISTEN.to_string(), 300),
            (DEST_1.to_string(), 200),
        ];

        let built = b
            .build(&destinations, &[utxo(2000)], br#"["0xaa"]"#)
            .unwrap();

        let psbt = Psbt::from_str(&built.psbt).unwrap();
        let tx = &psbt.unsigned_tx;

        // three payments plus change
        assert_eq!(tx.output.len(), 4);
        assert_eq!(tx.output[0].value.to_sat(), 500);
        assert_eq!(tx.output[1].value.to_sat(), 300);
        assert_eq!(tx.output[2].value.to_sat(), 200);
        assert_eq!(tx.output[3].value.to_sat(), 900);

        // fee is exact: inputs - outputs = fee
        let out_total: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
        assert_eq!(2000 - out_total as i64, 100);

        assert_eq!(built.btc_tx_id, tx.compute_txid().to_string());
    }

    #[test]
    fn test_insufficient_funds() {
        let b = builder(100);
        let destinations = vec![(DEST_1.to_string(), 5000)];

        let result = b.build(&destinations, &[utxo(2000)], b"[]");
        assert!(matches!(
            result,
            Err(BuildError::InsufficientFunds {
                required: 5100,
                available: 2000
            })
        ));
    }

    #[test]
    fn test_exact_cover_leaves_zero_change() {
        let b = builder(100);
        let destinations = vec![(DEST_1.to_string(), 1900)];

        let built = b.build(&destinations, &[utxo(2000)], b"[]").unwrap();
        let psbt = Psbt::from_str(&built.psbt).unwrap();
        assert_eq!(psbt.unsigned_tx.output[1].value.to_sat(), 0);
    }

    #[test]
    fn test_inputs_stop_once_covered() {
        let b = builder(100);
        let destinations = vec![(DEST_1.to_string(), 500)];
        let utxos = vec![
            ListenUtxo {
                txid: "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
                    .to_string(),
                vout: 0,
                satoshi: 700,
                script_pk: String::new(),
            },
            ListenUtxo {
                txid: "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
                    .to_string(),
                vout: 1,
                satoshi: 700,
                script_pk: String::new(),
            },
            ListenUtxo {
                txid: "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
                    .to_string(),
                vout: 2,
                satoshi: 700,
                script_pk: String::new(),
            },
        ];

        let built = b.build(&destinations, &utxos, b"[]").unwrap();
        let psbt = Psbt::from_str(&built.psbt).unwrap();

        // 700 + 700 > 500 + 100, so the third output stays unspent
        assert_eq!(psbt.unsigned_tx.input.len(), 2);
        assert_eq!(psbt.unsigned_tx.output[1].value.to_sat(), 800);
    }

    #[test]
    fn test_witness_script_attached_to_every_input() {
        let b = builder(100);
        let built = b
            .build(&[(DEST_1.to_string(), 500)], &[utxo(2000)], b"[]")
            .unwrap();

        let psbt = Psbt::from_str(&built.psbt).unwrap();
        for input in &psbt.inputs {
            let script = input.witness_script.as_ref().unwrap();
            assert!(script.is_multisig());
            assert_eq!(
                input.witness_utxo.as_ref().unwrap().script_pubkey,
                *script
            );
        }
    }

    #[test]
    fn test_tx_hashes_embedded_in_psbt() {
        let b = builder(100);
        let hashes = br#"["0xaa","0xbb"]"#;
        let built = b
            .build(&[(DEST_1.to_string(), 500)], &[utxo(2000)], hashes)
            .unwrap();

        let psbt = Psbt::from_str(&built.psbt).unwrap();
        let embedded = psbt
            .unknown
            .iter()
            .find(|(key, _)| key.key == TX_HASHES_KEY)
            .map(|(_, value)| value.clone())
            .unwrap();
        assert_eq!(embedded, hashes.to_vec());
    }

    #[test]
    fn test_bad_pubkey_rejected() {
        let b = WithdrawalBuilder::new(
            Network::Regtest,
            LISTEN.to_string(),
            100,
            vec!["zz".to_string(), PUBKEY_2.to_string()],
        );
        let result = b.build(&[(DEST_1.to_string(), 500)], &[utxo(2000)], b"[]");
        assert!(matches!(result, Err(BuildError::InvalidPubkey(_))));
    }
}
