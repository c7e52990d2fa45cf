//! Retry budgeter for prompt-too-large rejections.
//!
//! Some delegated-context providers reject a prompt as too large without
//! saying by how much. The budgeter shrinks `max_tokens` (never the
//! prompt content) cumulatively and re-submits, up to a small bound. A
//! provider that never emits this signal bypasses the budgeter entirely.

use edgerun_kernel::error::{ErrorCode, RuntimeError, RuntimeResult};

pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const REDUCTION_FACTOR: f64 = 0.8;
pub const MIN_TOKENS: u32 = 32;

/// Per-request retry state. Dropped on success.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    max_retries: u32,
    attempt: u32,
    original_max_tokens: u32,
    max_tokens: u32,
    last_error: Option<RuntimeError>,
}

impl RetryBudget {
    pub fn new(original_max_tokens: u32) -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            attempt: 0,
            original_max_tokens,
            max_tokens: original_max_tokens,
            last_error: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    pub fn original_max_tokens(&self) -> u32 {
        self.original_max_tokens
    }

    pub fn last_error(&self) -> Option<&RuntimeError> {
        self.last_error.as_ref()
    }

    pub fn can_retry(&self) -> bool {
        self.attempt < self.max_retries
    }

    /// Account one failed attempt and shrink the token budget.
    ///
    /// The effective budget at attempt `k` is
    /// `max(MIN_TOKENS, floor(original × REDUCTION_FACTOR^k))`, computed
    /// from the original each time so repeated flooring cannot drift.
    pub fn prepare_retry(&mut self, error: RuntimeError) -> RuntimeResult<u32> {
        if !self.can_retry() {
            return Err(RuntimeError::new(
                ErrorCode::PromptTooLargeAfterRetries,
                format!(
                    "prompt still too large after {} retries (budget floor {} tokens)",
                    self.max_retries, MIN_TOKENS
                ),
            )
            .with_cause(error.to_string())
            .with_user_action("Shorten the conversation and try again"));
        }

        self.attempt += 1;
        self.last_error = Some(error);
        let reduced = (self.original_max_tokens as f64
            * REDUCTION_FACTOR.powi(self.attempt as i32))
        .floor() as u32;
        self.max_tokens = reduced.max(MIN_TOKENS);
        Ok(self.max_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overflow() -> RuntimeError {
        RuntimeError::new(ErrorCode::PromptBudgetOverflow, "prompt too large")
    }

    #[test]
    fn budget_shrinks_by_factor_per_attempt() {
        let mut budget = RetryBudget::new(1000);
        assert_eq!(budget.max_tokens(), 1000);

        assert_eq!(budget.prepare_retry(overflow()).unwrap(), 800);
        assert_eq!(budget.prepare_retry(overflow()).unwrap(), 640);
        assert_eq!(budget.attempt(), 2);
    }

    #[test]
    fn effective_budget_matches_power_formula() {
        // max(MIN, floor(original × 0.8^k)) for every attempt k.
        let mut budget = RetryBudget::new(500).with_max_retries(10);
        for k in 1..=10u32 {
            let granted = budget.prepare_retry(overflow()).unwrap();
            let expected = ((500.0 * REDUCTION_FACTOR.powi(k as i32)).floor() as u32)
                .max(MIN_TOKENS);
            assert_eq!(granted, expected, "attempt {k}");
        }
    }

    #[test]
    fn floor_at_min_tokens() {
        let mut budget = RetryBudget::new(40).with_max_retries(5);
        budget.prepare_retry(overflow()).unwrap();
        assert_eq!(budget.max_tokens(), MIN_TOKENS);
        budget.prepare_retry(overflow()).unwrap();
        assert_eq!(budget.max_tokens(), MIN_TOKENS);
    }

    #[test]
    fn exhausted_budget_fails_with_dedicated_code() {
        let mut budget = RetryBudget::new(1000);
        budget.prepare_retry(overflow()).unwrap();
        budget.prepare_retry(overflow()).unwrap();
        assert!(!budget.can_retry());

        let err = budget.prepare_retry(overflow()).unwrap_err();
        assert_eq!(err.code, ErrorCode::PromptTooLargeAfterRetries);
        assert!(err.user_action.is_some());
    }

    #[test]
    fn last_error_is_recorded() {
        let mut budget = RetryBudget::new(100);
        assert!(budget.last_error().is_none());
        budget.prepare_retry(overflow()).unwrap();
        assert_eq!(
            budget.last_error().unwrap().code,
            ErrorCode::PromptBudgetOverflow
        );
    }
}
