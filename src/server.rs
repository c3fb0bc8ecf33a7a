//! Worker supervision.
//!
//! Builds the store and every chain client, spawns the seven workers plus
//! the notification gateway, and ties them all to one shutdown broadcast.
//! Construction is the readiness gate: a bad config, unreachable store or
//! malformed key aborts startup before any task runs.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::aa::AaClient;
use crate::api::{self, AppState};
use crate::btc_client::BtcClient;
use crate::config::{Config, ConfigError};
use crate::coordinator::CoordinatorClient;
use crate::custody::CustodyClient;
use crate::deposit::{DepositDispatcher, DepositReconciler};
use crate::indexer::Indexer;
use crate::notify::NotifyHandler;
use crate::rollup::{RollupClient, RollupError};
use crate::shutdown;
use crate::storage::{Store, StoreError};
use crate::withdraw::{WithdrawBroadcaster, WithdrawConstructor, WithdrawScanner, WithdrawalBuilder};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Rollup(#[from] RollupError),

    #[error("gateway error: {0}")]
    Gateway(#[from] std::io::Error),
}

pub struct Server;

impl Server {
    /// Start every worker and block until SIGINT, then drain.
    pub async fn run(config: Config) -> Result<(), ServerError> {
        config.validate()?;

        let store = Arc::new(Store::open(&config.db_path)?);
        store.ping()?;
        info!(db_path = %config.db_path, "store ready");

        let btc = Arc::new(BtcClient::new(
            &config.btc_rpc_url,
            &config.btc_rpc_user,
            &config.btc_rpc_pass,
            &config.listen_address,
        ));
        let rollup = Arc::new(RollupClient::new(
            &config.rollup_rpc_url,
            &config.bridge_priv_key,
            &config.contract_address,
            config.gas_price_multiple,
        )?);
        let translator = Arc::new(AaClient::new(&config.aa_pubkey_api, &config.aa_account_api));
        let custody = Arc::new(CustodyClient::new(&config.custody_api, &config.custody_api_key));
        let coordinator = Arc::new(CoordinatorClient::new(&config.coordinator_api));

        let (handle, observer) = shutdown::channel();
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        // L1 → L2 side
        let indexer = Indexer::new(
            store.clone(),
            btc.clone(),
            config.listen_address.clone(),
            config.indexer_tick(),
            observer.clone(),
        );
        tasks.push((
            "indexer",
            tokio::spawn(async move {
                if let Err(e) = indexer.run().await {
                    error!(error = %e, "indexer stopped with error");
                }
            }),
        ));

        let dispatcher = DepositDispatcher::new(
            store.clone(),
            rollup.clone(),
            btc.clone(),
            translator.clone(),
            &config,
            observer.clone(),
        );
        let reconciler = DepositReconciler::new(
            store.clone(),
            rollup.clone(),
            dispatcher.clone(),
            &config,
            observer.clone(),
        );
        tasks.push(("deposit-dispatcher", tokio::spawn(dispatcher.run())));
        tasks.push(("deposit-reconciler", tokio::spawn(reconciler.run())));

        // L2 → L1 side
        let scanner = WithdrawScanner::new(
            store.clone(),
            rollup.clone(),
            config.listen_address.clone(),
            config.withdraw_tick(),
            observer.clone(),
        );
        tasks.push((
            "withdraw-scanner",
            tokio::spawn(async move {
                if let Err(e) = scanner.run().await {
                    error!(error = %e, "withdraw scanner stopped with error");
                }
            }),
        ));

        let builder = WithdrawalBuilder::new(
            config.network.bitcoin_network(),
            config.listen_address.clone(),
            config.withdraw_fee,
            config.multisig_pubkeys.clone(),
        );
        let constructor = WithdrawConstructor::new(
            store.clone(),
            custody,
            coordinator.clone(),
            builder,
            config.listen_address.clone(),
            config.withdraw_fee,
            config.withdraw_tick(),
            observer.clone(),
        );
        tasks.push(("withdraw-constructor", tokio::spawn(constructor.run())));

        let broadcaster = WithdrawBroadcaster::new(
            store.clone(),
            btc.clone(),
            coordinator,
            config.withdraw_tick(),
            config.confirm_tick(),
            observer.clone(),
        );
        tasks.push((
            "withdraw-broadcaster",
            tokio::spawn(broadcaster.clone().run_broadcast()),
        ));
        tasks.push((
            "withdraw-confirmer",
            tokio::spawn(broadcaster.clone().run_confirm()),
        ));
        tasks.push(("withdraw-finaliser", tokio::spawn(broadcaster.run_finalize())));

        // notification gateway
        let state = AppState {
            notify: Arc::new(NotifyHandler::new(
                store.clone(),
                config.listen_address.clone(),
            )),
            store: store.clone(),
        };
        let gateway_shutdown = observer.clone();
        let port = config.http_port;
        tasks.push((
            "gateway",
            tokio::spawn(async move {
                if let Err(e) = api::serve(state, port, gateway_shutdown).await {
                    error!(error = %e, "gateway stopped with error");
                }
            }),
        ));

        info!(workers = tasks.len(), "all workers started");

        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received, draining workers");
        handle.trigger();

        for (name, task) in tasks {
            if let Err(e) = task.await {
                error!(worker = name, error = %e, "worker join failed");
            }
        }

        info!("server stopped");
        Ok(())
    }
}
