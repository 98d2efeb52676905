//! Retry and escalation bookkeeping as a pure state machine.

use newsbias_store::{ArticleStatus, Bookkeeping};

use crate::types::RunOutcome;

/// Consecutive failures after which an article stops being retried.
pub const DEFAULT_ESCALATION_THRESHOLD: u32 = 5;

/// Bookkeeping after a run, given the bookkeeping held before it started.
pub fn next_bookkeeping(before: Bookkeeping, outcome: RunOutcome, threshold: u32) -> Bookkeeping {
    match outcome {
        RunOutcome::Success => Bookkeeping {
            status: ArticleStatus::Processed,
            fail_count: 0,
            escalated: false,
        },
        // Not the article's fault; nothing changes.
        RunOutcome::RateLimited => before,
        RunOutcome::Failed => {
            let fail_count = before.fail_count.saturating_add(1);
            let escalated = before.escalated || fail_count >= threshold;
            Bookkeeping {
                status: if escalated {
                    ArticleStatus::Escalated
                } else {
                    ArticleStatus::Failed
                },
                fail_count,
                escalated,
            }
        }
    }
}

/// Whether the retry sweep should pick this article up.
pub fn is_retry_candidate(bookkeeping: &Bookkeeping) -> bool {
    !bookkeeping.escalated
        && (bookkeeping.status == ArticleStatus::Failed || bookkeeping.fail_count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: u32 = DEFAULT_ESCALATION_THRESHOLD;

    fn bk(status: ArticleStatus, fail_count: u32, escalated: bool) -> Bookkeeping {
        Bookkeeping {
            status,
            fail_count,
            escalated,
        }
    }

    #[test]
    fn test_success_resets() {
        let next = next_bookkeeping(bk(ArticleStatus::Escalated, 7, true), RunOutcome::Success, T);
        assert_eq!(next, bk(ArticleStatus::Processed, 0, false));
    }

    #[test]
    fn test_rate_limited_is_identity() {
        let before = bk(ArticleStatus::Failed, 3, false);
        assert_eq!(next_bookkeeping(before, RunOutcome::RateLimited, T), before);
    }

    #[test]
    fn test_failure_escalates_at_threshold() {
        let next = next_bookkeeping(bk(ArticleStatus::Failed, 3, false), RunOutcome::Failed, T);
        assert_eq!(next, bk(ArticleStatus::Failed, 4, false));
        assert!(is_retry_candidate(&next));

        let next = next_bookkeeping(next, RunOutcome::Failed, T);
        assert_eq!(next, bk(ArticleStatus::Escalated, 5, true));
        assert!(!is_retry_candidate(&next));
    }

    #[test]
    fn test_five_failures_from_fresh() {
        let mut state = bk(ArticleStatus::Pending, 0, false);
        for _ in 0..4 {
            state = next_bookkeeping(state, RunOutcome::Failed, T);
            assert!(!state.escalated);
        }
        state = next_bookkeeping(state, RunOutcome::Failed, T);
        assert!(state.escalated);
        assert_eq!(state.fail_count, 5);
    }

    #[test]
    fn test_escalated_stays_escalated_on_failure() {
        let next = next_bookkeeping(bk(ArticleStatus::Escalated, 5, true), RunOutcome::Failed, T);
        assert_eq!(next, bk(ArticleStatus::Escalated, 6, true));
    }

    #[test]
    fn test_retry_candidates() {
        assert!(!is_retry_candidate(&bk(ArticleStatus::Pending, 0, false)));
        assert!(!is_retry_candidate(&bk(ArticleStatus::Processed, 0, false)));
        assert!(is_retry_candidate(&bk(ArticleStatus::Pending, 1, false)));
        assert!(is_retry_candidate(&bk(ArticleStatus::Failed, 0, false)));
    }
}
