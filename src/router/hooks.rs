//! Validation hooks for executors
//!
//! A validator sees a hop and the staged outcome of each of its operations
//! and decides whether the hop commits. Swapping validators never changes the
//! coordinator protocol: an abort verdict simply becomes an abort response.

use crate::router::types::{Hop, OperationOutcome};
use async_trait::async_trait;
use std::sync::Arc;

/// Decision for one hop
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Commit,
    Abort { reason: String },
}

impl Verdict {
    pub fn abort(reason: impl Into<String>) -> Self {
        Self::Abort {
            reason: reason.into(),
        }
    }
}

/// Hook deciding commit or abort for a staged hop.
///
/// An `Err` is treated as an abort carrying the error text.
#[async_trait]
pub trait HopValidator: Send + Sync {
    async fn validate(&self, hop: &Hop, outcomes: &[OperationOutcome]) -> anyhow::Result<Verdict>;
}

/// Baseline validator: every hop commits
pub struct AlwaysCommit;

#[async_trait]
impl HopValidator for AlwaysCommit {
    async fn validate(&self, _hop: &Hop, _outcomes: &[OperationOutcome]) -> anyhow::Result<Verdict> {
        Ok(Verdict::Commit)
    }
}

/// Escalates record-level misses to aborts
#[derive(Clone, Debug, Default)]
pub struct StrictValidator {
    pub abort_on_duplicate: bool,
    pub abort_on_missing: bool,
}

impl StrictValidator {
    /// Abort on both duplicate writes and missing rows
    pub fn new() -> Self {
        Self {
            abort_on_duplicate: true,
            abort_on_missing: true,
        }
    }
}

#[async_trait]
impl HopValidator for StrictValidator {
    async fn validate(&self, hop: &Hop, outcomes: &[OperationOutcome]) -> anyhow::Result<Verdict> {
        for (op, outcome) in hop.operations.iter().zip(outcomes) {
            match outcome {
                OperationOutcome::DuplicateKey if self.abort_on_duplicate => {
                    return Ok(Verdict::abort(format!(
                        "duplicate key {}/{}",
                        op.table_name,
                        op.key()
                    )));
                }
                OperationOutcome::RecordNotFound if self.abort_on_missing => {
                    return Ok(Verdict::abort(format!(
                        "record not found {}/{}",
                        op.table_name,
                        op.key()
                    )));
                }
                _ => {}
            }
        }
        Ok(Verdict::Commit)
    }
}

type ValidateFn = dyn Fn(&Hop, &[OperationOutcome]) -> anyhow::Result<Verdict> + Send + Sync;

/// Validator backed by a plain closure
pub struct FnValidator {
    f: Arc<ValidateFn>,
}

impl FnValidator {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Hop, &[OperationOutcome]) -> anyhow::Result<Verdict> + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }
}

#[async_trait]
impl HopValidator for FnValidator {
    async fn validate(&self, hop: &Hop, outcomes: &[OperationOutcome]) -> anyhow::Result<Verdict> {
        (self.f)(hop, outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::types::Operation;
    use crate::storage::Record;

    #[tokio::test]
    async fn test_always_commit() {
        let hop = Hop::new("T1", true);
        let verdict = AlwaysCommit
            .validate(&hop, &[OperationOutcome::DuplicateKey])
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Commit);
    }

    #[tokio::test]
    async fn test_strict_validator() {
        let hop = Hop::new("T1", true)
            .with_operation(Operation::write("Users", "user_id", 1, Record::new()))
            .with_operation(Operation::update("Users", "user_id", 2, Record::new()));

        let strict = StrictValidator::new();
        let verdict = strict
            .validate(&hop, &[OperationOutcome::Applied, OperationOutcome::RecordNotFound])
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::abort("record not found Users/2"));

        let lenient = StrictValidator {
            abort_on_duplicate: true,
            abort_on_missing: false,
        };
        let verdict = lenient
            .validate(&hop, &[OperationOutcome::Applied, OperationOutcome::RecordNotFound])
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Commit);
    }

    #[tokio::test]
    async fn test_fn_validator() {
        let validator = FnValidator::new(|hop, _| {
            if hop.transaction_tag == "TX" {
                anyhow::bail!("constraint violated")
            }
            Ok(Verdict::Commit)
        });
        assert!(validator.validate(&Hop::new("TX", false), &[]).await.is_err());
        assert_eq!(
            validator.validate(&Hop::new("T1", false), &[]).await.unwrap(),
            Verdict::Commit
        );
    }
}
