use unified_driver::TransactionState;
use unified_format::OperationDescription;

use super::args::Args;
use super::{OperationExecutor, OperationResult};
use crate::entities::EntityMap;
use crate::error::{RunnerError, RunnerResult};
use crate::options;

pub fn start_transaction(
    entities: &EntityMap,
    object: &str,
    args: Args,
) -> RunnerResult<OperationResult> {
    let session = &entities.session(object)?.session;
    session.start_transaction(options::transaction_options(&args.into_rest())?)?;
    Ok(OperationResult::None)
}

pub async fn commit_transaction(entities: &EntityMap, object: &str) -> RunnerResult<OperationResult> {
    entities.session(object)?.session.commit_transaction().await?;
    Ok(OperationResult::None)
}

pub async fn abort_transaction(entities: &EntityMap, object: &str) -> RunnerResult<OperationResult> {
    entities.session(object)?.session.abort_transaction().await?;
    Ok(OperationResult::None)
}

/// Ends the session. The entity stays bound so later assertions can inspect it.
pub async fn end_session(entities: &EntityMap, object: &str) -> RunnerResult<OperationResult> {
    entities.session(object)?.session.end_session().await?;
    Ok(OperationResult::None)
}

fn is_active(state: TransactionState) -> bool {
    matches!(state, TransactionState::Starting | TransactionState::InProgress)
}

impl OperationExecutor<'_> {
    /// Run `callback` inside a transaction on the session `object`.
    ///
    /// The transaction is committed when every callback operation passes
    /// its own expectations and left the transaction open, and aborted when
    /// one of them fails. There is no retry.
    pub(super) async fn with_transaction(
        &mut self,
        object: &str,
        mut args: Args,
    ) -> RunnerResult<OperationResult> {
        let session = self.entities.session(object)?.session.clone();
        let callback: Vec<OperationDescription> = serde_json::from_value(args.required("callback")?)
            .map_err(|e| RunnerError::configuration(format!("withTransaction: invalid callback: {}", e)))?;
        session.start_transaction(options::transaction_options(&args.into_rest())?)?;

        for operation in &callback {
            if let Err(err) = self.execute_nested(operation).await {
                if is_active(session.transaction_state()) {
                    if let Err(abort) = session.abort_transaction().await {
                        tracing::warn!(error = %abort, "abort after failed callback also failed");
                    }
                }
                return Err(err);
            }
        }
        if is_active(session.transaction_state()) {
            session.commit_transaction().await?;
        }
        Ok(OperationResult::None)
    }
}
