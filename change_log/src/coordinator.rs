//! The transactional write and read paths.
//!
//! [`append`] binds the log insert, the idempotency bookkeeping and the
//! materialization of every change into one transaction: either all of it
//! commits or none of it does. [`pull`] serves cursor-paginated reads of a
//! stream's log.

use crate::core::{ChangeStore, StoreError, StoreTransaction};
use crate::cursor;
use data_types::{AppendRequest, AppendResult, PullRequest, PullResponse};
use lww::{merge, MergeOutcome};
use observability_deps::tracing::{debug, warn};

/// How many changes a pull returns when the request does not say.
pub const DEFAULT_PULL_LIMIT: u32 = 500;

/// Append a batch of changes to a stream, materializing them if the store
/// carries a materializer.
///
/// When the request carries an idempotency key that the store has already
/// seen, nothing is written and the result reports `accepted: 0`. Any
/// failure rolls the whole transaction back and surfaces as a
/// [`TransactionAborted`](crate::core::StoreErrorKind::TransactionAborted)
/// error with no partial effects.
pub async fn append<S>(store: &S, request: AppendRequest) -> Result<AppendResult, StoreError>
where
    S: ChangeStore + ?Sized,
{
    for change in &request.changes {
        change.validate().map_err(StoreError::invalid_change)?;
    }

    let mut txn = store.begin().await?;
    let outcome = run_append(txn.as_mut(), &request).await;
    match outcome {
        Ok(Some(result)) => {
            txn.commit().await.map_err(StoreError::transaction_aborted)?;
            debug!(
                stream = request.stream.as_str(),
                accepted = result.accepted,
                "append committed"
            );
            Ok(result)
        }
        Ok(None) => {
            // duplicate idempotency key: a benign replay, leave the store
            // untouched
            txn.abort().await?;
            debug!(
                stream = request.stream.as_str(),
                "append replayed a known idempotency key"
            );
            Ok(AppendResult {
                accepted: 0,
                hlc: None,
            })
        }
        Err(e) => {
            if let Err(abort_error) = txn.abort().await {
                warn!(error = %abort_error, "rollback failed after append error");
            }
            Err(StoreError::transaction_aborted(e))
        }
    }
}

/// The body of [`append`]; `Ok(None)` reports a duplicate idempotency key.
async fn run_append(
    txn: &mut dyn StoreTransaction,
    request: &AppendRequest,
) -> Result<Option<AppendResult>, StoreError> {
    if let Some(key) = &request.idempotency_key {
        if txn
            .idempotency()
            .last_seq(&request.stream, key)
            .await?
            .is_some()
        {
            return Ok(None);
        }
        txn.idempotency().create(&request.stream, key).await?;
    }

    let mut last_seq = None;
    for change in &request.changes {
        let seq = txn.log().append(&request.stream, change).await?;
        last_seq = Some(seq);
    }

    if let (Some(key), Some(seq)) = (&request.idempotency_key, last_seq) {
        txn.idempotency()
            .set_last_seq(&request.stream, key, seq)
            .await?;
    }

    for change in &request.changes {
        let materializer = match txn.materializer() {
            Some(materializer) => materializer,
            None => break,
        };
        let prior = materializer.load(&change.entity, &change.entity_id).await?;
        let (next, outcome) = merge(prior.as_ref(), change);
        match outcome {
            MergeOutcome::Saved => {
                materializer
                    .save(&change.entity, &change.entity_id, &next)
                    .await?
            }
            MergeOutcome::Removed => {
                materializer
                    .remove(&change.entity, &change.entity_id, &next)
                    .await?
            }
            MergeOutcome::Noop => {}
        }
    }

    Ok(Some(AppendResult {
        accepted: request.changes.len() as u32,
        hlc: None,
    }))
}

/// Read one page of a stream's log, resuming after the request cursor.
///
/// The returned cursor encodes the last sequence number of the page, or
/// echoes the request cursor when the page is empty.
pub async fn pull<S>(store: &S, request: PullRequest) -> Result<PullResponse, StoreError>
where
    S: ChangeStore + ?Sized,
{
    let after = cursor::decode(request.cursor.as_deref());
    let limit = request.limit.unwrap_or(DEFAULT_PULL_LIMIT) as usize;

    let mut txn = store.begin().await?;
    let pulled = txn.log().pull(&request.stream, after, limit).await;
    let entries = match pulled {
        Ok(entries) => {
            txn.commit().await?;
            entries
        }
        Err(e) => {
            if let Err(abort_error) = txn.abort().await {
                warn!(error = %abort_error, "rollback failed after pull error");
            }
            return Err(e);
        }
    };

    debug!(
        stream = request.stream.as_str(),
        after = after.get(),
        returned = entries.len(),
        "pull served"
    );

    let next_cursor = entries
        .last()
        .map(|entry| cursor::encode(entry.seq))
        .or(request.cursor);
    let changes = entries.into_iter().map(|entry| entry.change).collect();

    Ok(PullResponse {
        changes,
        next_cursor,
    })
}
