use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use alloy::sol;
use async_trait::async_trait;
use std::str::FromStr;

use crate::indexer::chain::retry_rpc;

sol! {
    #[sol(rpc)]
    interface IRestrict {
        function blacklist(address[] calldata accounts) external;
    }
}

/// An accepted restriction transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub tx_hash: B256,
    /// Chain tip when the transaction was submitted.
    pub block_number: u64,
}

/// Sends restriction transactions for a batch of addresses.
#[async_trait]
pub trait RestrictionSubmitter: Send + Sync {
    async fn submit(&self, accounts: &[Address]) -> eyre::Result<Submission>;
}

/// Calls `blacklist(address[])` on the restrict contract, signed with a local key.
pub struct ContractSubmitter {
    provider: DynProvider,
    contract: Address,
    signer: Address,
}

impl ContractSubmitter {
    /// Load the signing key from `key_env`, bind it to the node's chain id and
    /// build a signing provider. Any failure here is a startup error.
    pub async fn connect(rpc_http: &str, contract: Address, key_env: &str) -> eyre::Result<Self> {
        let key = std::env::var(key_env)
            .map_err(|_| eyre::eyre!("Signing key environment variable {} is not set", key_env))?;
        let signer = PrivateKeySigner::from_str(key.trim())
            .map_err(|e| eyre::eyre!("Invalid signing key in {}: {}", key_env, e))?;

        let probe = ProviderBuilder::new()
            .connect_http(rpc_http.parse().map_err(|e| eyre::eyre!("Invalid RPC URL: {}", e))?);
        let chain_id = retry_rpc(|| probe.get_chain_id()).await?;
        let signer = signer.with_chain_id(Some(chain_id));
        let signer_address = signer.address();

        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(rpc_http.parse().map_err(|e| eyre::eyre!("Invalid RPC URL: {}", e))?)
            .erased();

        tracing::info!(
            signer = %signer_address,
            contract = %contract,
            chain_id,
            "Enforcement signer ready"
        );

        Ok(Self {
            provider,
            contract,
            signer: signer_address,
        })
    }
}

#[async_trait]
impl RestrictionSubmitter for ContractSubmitter {
    async fn submit(&self, accounts: &[Address]) -> eyre::Result<Submission> {
        let block_number = self.provider.get_block_number().await?;
        let contract = IRestrict::new(self.contract, &self.provider);

        let pending = contract
            .blacklist(accounts.to_vec())
            .send()
            .await
            .map_err(|e| eyre::eyre!("blacklist submission from {} failed: {}", self.signer, e))?;

        Ok(Submission {
            tx_hash: *pending.tx_hash(),
            block_number,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::sol_types::SolCall;

    #[test]
    fn test_blacklist_call_encoding() {
        let accounts = vec![Address::repeat_byte(0x11), Address::repeat_byte(0x22)];
        let encoded = IRestrict::blacklistCall { accounts: accounts.clone() }.abi_encode();

        assert_eq!(&encoded[..4], IRestrict::blacklistCall::SELECTOR.as_slice());
        let decoded = IRestrict::blacklistCall::abi_decode(&encoded).unwrap();
        assert_eq!(decoded.accounts, accounts);
    }

    #[tokio::test]
    async fn test_missing_key_is_a_startup_error() {
        let result = ContractSubmitter::connect(
            "http://127.0.0.1:1",
            Address::repeat_byte(0x99),
            "CHAINWATCH_TEST_UNSET_SIGNING_KEY",
        )
        .await;
        assert!(result.is_err());
    }
}
