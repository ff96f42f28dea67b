//! Extensions to `Result`.

use error_stack::{Context, Report, Result};

/// Flip `Result<T, E>` to `Result<E, T>`.
///
/// Used by [`super::iter::AlternativeIter`] to fold "first success wins" over
/// an iterator using `try_fold`'s early-exit, which only exits early on `Err`.
pub trait FlipResult<T, E> {
    /// Flip `Result<T, E>` to `Result<E, T>`.
    fn flip(self) -> std::result::Result<E, T>;
}

impl<T, E> FlipResult<T, E> for std::result::Result<T, E> {
    fn flip(self) -> std::result::Result<E, T> {
        match self {
            Ok(t) => Err(t),
            Err(e) => Ok(e),
        }
    }
}

/// Wrap a bare value into the `Ok` variant of a `Result`, inferring the error type.
///
/// Mostly useful at the tail of a function to avoid writing `Ok(value)` when
/// `value`'s type is already verbose.
pub trait WrapOk<T> {
    /// Wrap `self` into `Ok(self)`.
    fn wrap_ok<E>(self) -> std::result::Result<T, E>;
}

impl<T> WrapOk<T> for T {
    fn wrap_ok<E>(self) -> std::result::Result<T, E> {
        Ok(self)
    }
}

/// Wrap a bare context value into the `Err` variant of an `error_stack::Result`.
pub trait WrapErr<C> {
    /// Wrap `self` into `Err(Report::new(self))`.
    fn wrap_err<T>(self) -> Result<T, C>;
}

impl<C: Context> WrapErr<C> for C {
    fn wrap_err<T>(self) -> Result<T, C> {
        Err(Report::new(self))
    }
}

/// Discard the `Ok` value of a `Result`, keeping only success/failure.
pub trait DiscardResult<C> {
    /// Discard the success value, returning `Ok(())` on success.
    fn discard_ok(self) -> Result<(), C>;
}

impl<T, C> DiscardResult<C> for Result<T, C> {
    fn discard_ok(self) -> Result<(), C> {
        self.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("some error")]
    struct Error;

    #[test]
    fn wrap_ok_wraps() {
        let wrapped: std::result::Result<i32, Error> = 5.wrap_ok();
        assert_eq!(wrapped.unwrap(), 5);
    }

    #[test]
    fn wrap_err_wraps() {
        let wrapped: Result<i32, Error> = Error.wrap_err();
        assert!(wrapped.is_err());
    }

    #[test]
    fn discard_ok_drops_value() {
        let original: Result<i32, Error> = Ok(5);
        assert_eq!(original.discard_ok(), Ok(()));
    }
}
