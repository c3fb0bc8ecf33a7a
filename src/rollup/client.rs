//! Alloy-backed rollup client.
//!
//! Legacy transactions are built by hand so the nonce and gas price stay
//! under orchestrator control: the dispatcher needs nonce pinning for
//! crash recovery and the reconciler needs monotonic gas bumps for
//! replacements. Gas is always re-estimated and doubled, and every signature
//! is made against the chain id fetched at submission time.

use std::str::FromStr;
use std::time::Duration;

use alloy::consensus::{SignableTransaction, Transaction as _, TxEnvelope, TxLegacy};
use alloy::eips::eip2718::Encodable2718;
use alloy::network::TxSignerSync;
use alloy::primitives::{Address, TxKind, B256, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, TransactionInput, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::{SolCall, SolEvent};
use async_trait::async_trait;
use tokio::time::sleep;

use super::{
    classify_submit_error, IBridge, RollupBridge, RollupError, SubmittedTx, TxLookup, TxTemplate,
    WaitMinedError, WithdrawEvent,
};
use crate::units::WEI_PER_SAT;

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(3);

type HttpProvider = alloy::providers::fillers::FillProvider<
    alloy::providers::fillers::JoinFill<
        alloy::providers::Identity,
        alloy::providers::fillers::JoinFill<
            alloy::providers::fillers::GasFiller,
            alloy::providers::fillers::JoinFill<
                alloy::providers::fillers::BlobGasFiller,
                alloy::providers::fillers::JoinFill<
                    alloy::providers::fillers::NonceFiller,
                    alloy::providers::fillers::ChainIdFiller,
                >,
            >,
        >,
    >,
    alloy::providers::RootProvider,
>;

/// Concrete client against the rollup node.
pub struct RollupClient {
    provider: HttpProvider,
    signer: PrivateKeySigner,
    sender: Address,
    contract: Address,
    /// Gas-price factor for fresh sends and replacements. Zero disables it.
    gas_price_multiple: u128,
}

impl RollupClient {
    pub fn new(
        rpc_url: &str,
        priv_key: &str,
        contract_address: &str,
        gas_price_multiple: u128,
    ) -> Result<Self, RollupError> {
        let url = rpc_url
            .parse()
            .map_err(|e| RollupError::Rpc(format!("invalid rpc url: {e}")))?;
        let provider = ProviderBuilder::new().on_http(url);

        let signer = PrivateKeySigner::from_str(priv_key)
            .map_err(|e| RollupError::Signer(e.to_string()))?;
        let sender = signer.address();

        let contract = Address::from_str(contract_address)
            .map_err(|e| RollupError::InvalidAddress(e.to_string()))?;

        Ok(Self {
            provider,
            signer,
            sender,
            contract,
            gas_price_multiple,
        })
    }

    /// Estimate (doubled), sign against the current chain id, broadcast.
    async fn send_legacy(
        &self,
        to: Address,
        value: U256,
        input: Vec<u8>,
        nonce: Option<u64>,
        gas_price: u128,
    ) -> Result<SubmittedTx, RollupError> {
        let nonce = match nonce {
            Some(n) => n,
            None => self
                .provider
                .get_transaction_count(self.sender)
                .pending()
                .await
                .map_err(|e| RollupError::Rpc(e.to_string()))?,
        };

        let request = TransactionRequest {
            from: Some(self.sender),
            to: Some(TxKind::Call(to)),
            value: Some(value),
            input: TransactionInput::new(input.clone().into()),
            ..Default::default()
        };

        // Estimation doubles as the submit-error probe: the named contract
        // failures surface here as revert messages.
        let gas = self
            .provider
            .estimate_gas(&request)
            .await
            .map_err(|e| classify_submit_error(&e.to_string()))?;
        let gas_limit = gas * 2;

        let chain_id = self
            .provider
            .get_chain_id()
            .await
            .map_err(|e| RollupError::Rpc(e.to_string()))?;

        let mut tx = TxLegacy {
            chain_id: Some(chain_id),
            nonce,
            gas_price,
            gas_limit,
            to: TxKind::Call(to),
            value,
            input: input.into(),
        };

        let signature = self
            .signer
            .sign_transaction_sync(&mut tx)
            .map_err(|e| RollupError::Signer(e.to_string()))?;
        let signed = TxEnvelope::Legacy(tx.into_signed(signature));

        let pending = self
            .provider
            .send_raw_transaction(&signed.encoded_2718())
            .await
            .map_err(|e| RollupError::Rpc(e.to_string()))?;

        Ok(SubmittedTx {
            tx_hash: format!("{:#x}", pending.tx_hash()),
            nonce,
            gas_price,
        })
    }

    async fn suggested_gas_price(&self) -> Result<u128, RollupError> {
        let mut price = self
            .provider
            .get_gas_price()
            .await
            .map_err(|e| RollupError::Rpc(e.to_string()))?;
        if self.gas_price_multiple != 0 {
            price = price.saturating_mul(self.gas_price_multiple);
        }
        Ok(price)
    }
}

#[async_trait]
impl RollupBridge for RollupClient {
    async fn deposit(
        &self,
        l1_tx_hash: &str,
        recipient: &str,
        value_sats: i64,
        nonce: Option<u64>,
    ) -> Result<SubmittedTx, RollupError> {
        let tx_hash = parse_hash(l1_tx_hash)?;
        let to = Address::from_str(recipient)
            .map_err(|e| RollupError::InvalidAddress(e.to_string()))?;

        let call = IBridge::depositV2Call {
            txHash: tx_hash,
            to,
            amount: U256::from(value_sats as u64),
        };

        let gas_price = self.suggested_gas_price().await?;
        self.send_legacy(self.contract, U256::ZERO, call.abi_encode(), nonce, gas_price)
            .await
    }

    async fn replace(&self, template: &TxTemplate) -> Result<SubmittedTx, RollupError> {
        let to = Address::from_str(&template.to)
            .map_err(|e| RollupError::InvalidAddress(e.to_string()))?;

        // Monotonic bump: the replacement is never priced below the attempt
        // it displaces.
        let bumped = if self.gas_price_multiple != 0 {
            template.gas_price.saturating_mul(self.gas_price_multiple)
        } else {
            template.gas_price
        };
        let gas_price = bumped.max(template.gas_price);

        self.send_legacy(
            to,
            U256::from(template.value),
            template.input.clone(),
            Some(template.nonce),
            gas_price,
        )
        .await
    }

    async fn transfer(&self, recipient: &str, value_sats: i64) -> Result<SubmittedTx, RollupError> {
        let to = Address::from_str(recipient)
            .map_err(|e| RollupError::InvalidAddress(e.to_string()))?;
        let value = U256::from(value_sats as u64) * U256::from(WEI_PER_SAT);

        let gas_price = self.suggested_gas_price().await?;
        self.send_legacy(to, value, Vec::new(), None, gas_price).await
    }

    async fn wait_mined(&self, tx_hash: &str, timeout: Duration) -> Result<(), WaitMinedError> {
        let hash = parse_hash(tx_hash).map_err(|e| WaitMinedError::Rpc(e.to_string()))?;

        let poll = async {
            loop {
                match self.provider.get_transaction_receipt(hash).await {
                    Ok(Some(receipt)) => {
                        return if receipt.status() {
                            Ok(())
                        } else {
                            Err(WaitMinedError::StatusFailed)
                        };
                    }
                    Ok(None) => {}
                    Err(e) => return Err(WaitMinedError::Rpc(e.to_string())),
                }
                sleep(RECEIPT_POLL_INTERVAL).await;
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| WaitMinedError::DeadlineExceeded)?
    }

    async fn receipt_status(&self, tx_hash: &str) -> Result<Option<bool>, RollupError> {
        let hash = parse_hash(tx_hash)?;
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| RollupError::Rpc(e.to_string()))?;
        Ok(receipt.map(|r| r.status()))
    }

    async fn lookup_transaction(&self, tx_hash: &str) -> Result<TxLookup, RollupError> {
        let hash = parse_hash(tx_hash)?;
        let tx = match self
            .provider
            .get_transaction_by_hash(hash)
            .await
            .map_err(|e| RollupError::Rpc(e.to_string()))?
        {
            None => return Ok(TxLookup::NotFound),
            Some(tx) => tx,
        };

        if tx.block_number.is_some() {
            return Ok(TxLookup::Mined);
        }

        let to = match tx.to() {
            Some(addr) => format!("{addr:#x}"),
            None => return Err(RollupError::Rpc("pending tx without recipient".to_string())),
        };

        Ok(TxLookup::Pending(TxTemplate {
            nonce: tx.nonce(),
            gas_price: tx.gas_price().unwrap_or_default(),
            to,
            value: u128::try_from(tx.value())
                .map_err(|_| RollupError::Rpc("tx value exceeds u128".to_string()))?,
            input: tx.input().to_vec(),
        }))
    }

    async fn latest_block(&self) -> Result<u64, RollupError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| RollupError::Rpc(e.to_string()))
    }

    async fn withdraw_events(&self, block: u64) -> Result<Vec<WithdrawEvent>, RollupError> {
        let filter = Filter::new()
            .address(self.contract)
            .event_signature(vec![
                IBridge::Deposit::SIGNATURE_HASH,
                IBridge::Withdraw::SIGNATURE_HASH,
            ])
            .from_block(block)
            .to_block(block);

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| RollupError::Rpc(e.to_string()))?;

        let mut events = Vec::new();
        for log in logs {
            if log.topic0() != Some(&IBridge::Withdraw::SIGNATURE_HASH) {
                continue;
            }

            let decoded = IBridge::Withdraw::decode_log(&log.inner, true)
                .map_err(|e| RollupError::Rpc(format!("withdraw event decode: {e}")))?;

            events.push(WithdrawEvent {
                block_number: log.block_number.unwrap_or(block),
                block_hash: log
                    .block_hash
                    .map(|h| format!("{h:#x}"))
                    .unwrap_or_default(),
                tx_hash: log
                    .transaction_hash
                    .map(|h| format!("{h:#x}"))
                    .unwrap_or_default(),
                tx_index: log.transaction_index.unwrap_or(0) as i64,
                log_index: log.log_index.unwrap_or(0) as i64,
                from: format!("{:#x}", decoded.data.from),
                to: decoded.data.to.clone(),
                amount: u64::try_from(decoded.data.amount)
                    .map_err(|_| RollupError::Rpc("withdraw amount exceeds u64".to_string()))?
                    as i64,
            });
        }

        Ok(events)
    }
}

fn parse_hash(hash: &str) -> Result<B256, RollupError> {
    B256::from_str(hash.trim_start_matches("0x"))
        .map_err(|e| RollupError::InvalidHash(format!("{hash}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hash_accepts_both_prefixes() {
        let raw = "a1b2000000000000000000000000000000000000000000000000000000000000";
        assert!(parse_hash(raw).is_ok());
        assert!(parse_hash(&format!("0x{raw}")).is_ok());
        assert!(parse_hash("a1b2").is_err());
    }

    #[test]
    fn test_deposit_calldata_shape() {
        let call = IBridge::depositV2Call {
            txHash: B256::ZERO,
            to: Address::ZERO,
            amount: U256::from(50_000u64),
        };
        let data = call.abi_encode();

        // selector + three 32-byte words
        assert_eq!(data.len(), 4 + 32 * 3);
        assert_eq!(&data[..4], IBridge::depositV2Call::SELECTOR);
    }

    #[test]
    fn test_event_topics_distinct() {
        assert_ne!(
            IBridge::Deposit::SIGNATURE_HASH,
            IBridge::Withdraw::SIGNATURE_HASH
        );
    }
}
