//! Filters shipped with the binary, run as `ctfgate filter <name>`

pub mod jsonrpc;

use crate::filter::{BuiltinFilter, FilterEnv};
use tokio::sync::watch;

/// Run `builtin` with the parameters its supervisor exported, until shutdown
pub async fn run_builtin(builtin: BuiltinFilter, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
    let env = FilterEnv::from_env()?;
    match builtin {
        BuiltinFilter::JsonRpcWhitelist => {
            jsonrpc::JsonRpcFilter::from_env(jsonrpc::FilterMode::Allow, &env)?
                .run(shutdown_rx)
                .await
        }
        BuiltinFilter::JsonRpcBlacklist => {
            jsonrpc::JsonRpcFilter::from_env(jsonrpc::FilterMode::Deny, &env)?
                .run(shutdown_rx)
                .await
        }
    }
}
