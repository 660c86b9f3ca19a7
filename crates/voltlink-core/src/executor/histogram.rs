//! Completion histogram: how many retries preceded each final outcome.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Terminal outcome of a request, keyed by the retries it consumed.
///
/// The signed form used in reports is `+retries` for successes and
/// `-retries` for failures. Failures and successes are kept apart here so
/// a request that failed with no retry budget does not land in the same
/// bucket as a first-try success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Completion {
    Failed { retries: u32 },
    Succeeded { retries: u32 },
}

impl Completion {
    pub fn retries(&self) -> u32 {
        match *self {
            Self::Failed { retries } | Self::Succeeded { retries } => retries,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// The signed retry count: positive for success, negative for failure.
    pub fn signed(&self) -> i64 {
        match *self {
            Self::Succeeded { retries } => i64::from(retries),
            Self::Failed { retries } => -i64::from(retries),
        }
    }
}

/// Ordered by signed retry count, with `-0` just before `+0`.
impl Ord for Completion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.signed(), self.is_success()).cmp(&(other.signed(), other.is_success()))
    }
}

impl PartialOrd for Completion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded { retries } => write!(f, "+{retries}"),
            Self::Failed { retries } => write!(f, "-{retries}"),
        }
    }
}

/// Tally of completions. Grows for the lifetime of an executor and is
/// never reset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionHistogram {
    buckets: BTreeMap<Completion, u64>,
    total: u64,
}

impl CompletionHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, completion: Completion) {
        *self.buckets.entry(completion).or_insert(0) += 1;
        self.total += 1;
    }

    pub fn count(&self, completion: Completion) -> u64 {
        self.buckets.get(&completion).copied().unwrap_or(0)
    }

    /// Number of completions recorded, successes and failures alike.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn successes(&self) -> u64 {
        self.buckets
            .iter()
            .filter(|(c, _)| c.is_success())
            .map(|(_, n)| n)
            .sum()
    }

    pub fn failures(&self) -> u64 {
        self.total - self.successes()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Completion, u64)> + '_ {
        self.buckets.iter().map(|(c, n)| (*c, *n))
    }
}

impl fmt::Display for CompletionHistogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (completion, count)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{completion}: {count}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_count() {
        let mut histogram = CompletionHistogram::new();
        histogram.record(Completion::Succeeded { retries: 0 });
        histogram.record(Completion::Succeeded { retries: 0 });
        histogram.record(Completion::Succeeded { retries: 1 });
        histogram.record(Completion::Failed { retries: 2 });

        assert_eq!(histogram.count(Completion::Succeeded { retries: 0 }), 2);
        assert_eq!(histogram.count(Completion::Succeeded { retries: 1 }), 1);
        assert_eq!(histogram.count(Completion::Failed { retries: 2 }), 1);
        assert_eq!(histogram.count(Completion::Failed { retries: 1 }), 0);
        assert_eq!(histogram.total(), 4);
        assert_eq!(histogram.successes(), 3);
        assert_eq!(histogram.failures(), 1);
    }

    #[test]
    fn test_zero_retry_failure_is_distinct_from_first_try_success() {
        let mut histogram = CompletionHistogram::new();
        histogram.record(Completion::Failed { retries: 0 });
        assert_eq!(histogram.count(Completion::Succeeded { retries: 0 }), 0);
        assert_eq!(histogram.count(Completion::Failed { retries: 0 }), 1);
    }

    #[test]
    fn test_signed_form() {
        assert_eq!(Completion::Succeeded { retries: 3 }.signed(), 3);
        assert_eq!(Completion::Failed { retries: 2 }.signed(), -2);
    }

    #[test]
    fn test_display() {
        let mut histogram = CompletionHistogram::new();
        histogram.record(Completion::Failed { retries: 2 });
        histogram.record(Completion::Succeeded { retries: 0 });
        assert_eq!(histogram.to_string(), "{-2: 1, +0: 1}");
    }

    #[test]
    fn test_display_orders_by_signed_retries() {
        let mut histogram = CompletionHistogram::new();
        for completion in [
            Completion::Succeeded { retries: 1 },
            Completion::Failed { retries: 0 },
            Completion::Succeeded { retries: 0 },
            Completion::Failed { retries: 1 },
            Completion::Failed { retries: 2 },
        ] {
            histogram.record(completion);
        }
        assert_eq!(
            histogram.to_string(),
            "{-2: 1, -1: 1, -0: 1, +0: 1, +1: 1}"
        );
    }
}
