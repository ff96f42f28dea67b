//! Extensions to iterators.

use error_stack::Report;

use super::result::FlipResult;

/// Try each item in turn, returning the first success.
///
/// Used when resolving an action download against several candidate server
/// URLs (the Forge server URL, then the actions server URL): each candidate
/// is tried in order, and if all fail, the combined error stack from every
/// attempt is returned so operators can see every probe that was rejected.
///
/// Panics if the iterator does not yield any items.
pub trait AlternativeIter<T, E> {
    /// Given an iterator over `Result<T, Report<E>>`, return the first `Ok`,
    /// or all combined errors if every attempt failed.
    fn alternative_fold(self) -> Result<T, Report<E>>;
}

impl<I: Iterator<Item = Result<T, Report<E>>>, T, E> AlternativeIter<T, E> for I {
    fn alternative_fold(self) -> Result<T, Report<E>> {
        self.map(|result| result.flip())
            .try_fold(Vec::new(), |mut errs, operation| {
                operation.map(|actually_err| {
                    errs.push(actually_err);
                    errs
                })
            })
            .flip()
            .map_err(collapse_errs_stack)
            .map_err(|stack| {
                stack.expect(
                    "invariant: iterator consumed by `alternative_fold` must yield at least one item",
                )
            })
    }
}

fn collapse_errs_stack<I: IntoIterator<Item = Report<E>>, E>(errs: I) -> Option<Report<E>> {
    errs.into_iter().reduce(|mut stack, err| {
        stack.extend_one(err);
        stack
    })
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::iter;

    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("probe failed")]
    struct ProbeError;

    #[test]
    fn returns_first_success() {
        let attempted = RefCell::new(0);
        let result = iter::once_with(|| {
            attempted.replace_with(|n| *n + 1);
            Err(Report::new(ProbeError))
        })
        .chain(iter::once_with(|| Ok("https://example.com/archive.tar.gz")))
        .alternative_fold();

        assert_eq!(result.expect("one candidate succeeded"), "https://example.com/archive.tar.gz");
        assert_eq!(attempted.into_inner(), 1);
    }

    #[test]
    fn collects_all_errors_when_every_candidate_fails() {
        let result: Result<&str, Report<ProbeError>> =
            iter::once_with(|| Err(Report::new(ProbeError)))
                .chain(iter::once_with(|| Err(Report::new(ProbeError))))
                .alternative_fold();

        let report = result.expect_err("every candidate failed");
        assert_eq!(report.frames().count(), 2);
    }

    #[test]
    #[should_panic = "must yield at least one item"]
    fn panics_on_empty_iterator() {
        let _ = iter::empty::<Result<(), Report<ProbeError>>>().alternative_fold();
    }
}
