//! Positional correlation of batch inputs and outputs.
//!
//! Transports answer batch calls with one result per input, in input order.
//! [`correlate`] turns such an answer into per-input pairs.

use std::future::Future;

use crate::error::{EngineError, Result};

/// Run `op` once over all inputs and pair each input with the output at the
/// same position.
///
/// Extra outputs are ignored.
///
/// # Errors
///
/// Returns the error of `op`, or [`EngineError::LengthMismatch`] if `op`
/// returned fewer outputs than it was given inputs.
pub async fn correlate<I, O, F, Fut>(inputs: impl IntoIterator<Item = I>, op: F) -> Result<Vec<(I, O)>>
where
    I: Clone,
    F: FnOnce(Vec<I>) -> Fut,
    Fut: Future<Output = Result<Vec<O>>>,
{
    let inputs: Vec<I> = inputs.into_iter().collect();
    let outputs = op(inputs.clone()).await?;

    if outputs.len() < inputs.len() {
        return Err(EngineError::LengthMismatch {
            expected: inputs.len(),
            actual: outputs.len(),
        });
    }

    Ok(inputs.into_iter().zip(outputs).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_correlate_pairs_by_position() {
        let pairs = correlate(0usize..5, |input| async move {
            Ok(input.iter().map(|n: &usize| format!("x={n}")).collect::<Vec<_>>())
        })
        .await
        .unwrap();

        assert_eq!(pairs.len(), 5);
        for (i, (input, output)) in pairs.iter().enumerate() {
            assert_eq!(*input, i);
            assert_eq!(output, &format!("x={i}"));
        }
    }

    #[tokio::test]
    async fn test_correlate_calls_op_once_with_all_inputs() {
        let mut calls = Vec::new();
        let pairs = correlate(vec!["a", "b"], |input| {
            calls.push(input.clone());
            async { Ok(vec![true, false]) }
        })
        .await
        .unwrap();

        assert_eq!(calls, vec![vec!["a", "b"]]);
        assert_eq!(pairs, vec![("a", true), ("b", false)]);
    }

    #[tokio::test]
    async fn test_correlate_short_output() {
        let result = correlate(vec![1, 2, 3], |_| async { Ok(vec![true]) }).await;
        assert!(matches!(
            result,
            Err(EngineError::LengthMismatch {
                expected: 3,
                actual: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_correlate_ignores_extra_output() {
        let pairs = correlate(vec![1], |_| async { Ok(vec!['a', 'b']) })
            .await
            .unwrap();
        assert_eq!(pairs, vec![(1, 'a')]);
    }

    #[tokio::test]
    async fn test_correlate_propagates_op_error() {
        let result: Result<Vec<(u8, bool)>> =
            correlate(vec![1u8], |_| async { Err(EngineError::NoReceivers) }).await;
        assert!(matches!(result, Err(EngineError::NoReceivers)));
    }
}
