//! Extensions to `error_stack`.

use colored::Colorize;
use error_stack::{Context, Report, Result, ResultExt};

/// Used to provide help text to an error.
///
/// This is meant to be readable by operators of the runner; help text should
/// be terse and only attached when we're pretty sure what they can do about
/// the problem.
pub trait ErrorHelper {
    /// Provide help text to the operator with what they can do to fix the problem.
    fn help<S: AsRef<str>>(self, help_text: S) -> Self;

    /// Lazily provide help text to the operator with what they can do to fix the problem.
    fn help_lazy<S: AsRef<str>, F: FnOnce() -> S>(self, helper: F) -> Self;
}

impl<T, C> ErrorHelper for Result<T, C> {
    fn help<S: AsRef<str>>(self, help_text: S) -> Self {
        let help = help_literal();
        let help_text = help_text.as_ref();
        self.attach_printable_lazy(|| format!("{help} {help_text}"))
    }

    fn help_lazy<S: AsRef<str>, F: FnOnce() -> S>(self, helper: F) -> Self {
        let help = help_literal();
        let help_text = helper();
        let help_text = help_text.as_ref();
        self.attach_printable_lazy(|| format!("{help} {help_text}"))
    }
}

fn help_literal() -> String {
    "help:".bold().blue().to_string()
}

/// Used to provide a description of the operation being performed when an error occurred.
pub trait DescribeContext {
    /// Provide a human-readable description of the context in which the error occurred.
    fn describe<S: AsRef<str>>(self, description: S) -> Self;

    /// Lazily provide a human-readable description of the context in which the error occurred.
    fn describe_lazy<S: AsRef<str>, F: FnOnce() -> S>(self, describer: F) -> Self;
}

impl<T, C> DescribeContext for Result<T, C> {
    fn describe<S: AsRef<str>>(self, description: S) -> Self {
        let context = describe_literal();
        let description = description.as_ref();
        self.attach_printable_lazy(|| format!("{context} {description}"))
    }

    fn describe_lazy<S: AsRef<str>, F: FnOnce() -> S>(self, describer: F) -> Self {
        let context = describe_literal();
        let description = describer();
        let description = description.as_ref();
        self.attach_printable_lazy(|| format!("{context} {description}"))
    }
}

fn describe_literal() -> String {
    "context:".bold().green().to_string()
}

/// Attach a link to further documentation.
pub trait ErrorDocReference {
    /// Attach a link to documentation relevant to this error.
    fn documentation<S: AsRef<str>>(self, link: S) -> Self;

    /// Lazily attach a link to documentation relevant to this error.
    fn documentation_lazy<S: AsRef<str>, F: FnOnce() -> S>(self, linker: F) -> Self;
}

impl<T, C> ErrorDocReference for Result<T, C> {
    fn documentation<S: AsRef<str>>(self, link: S) -> Self {
        let label = documentation_literal();
        let link = link.as_ref();
        self.attach_printable_lazy(|| format!("{label} {link}"))
    }

    fn documentation_lazy<S: AsRef<str>, F: FnOnce() -> S>(self, linker: F) -> Self {
        let label = documentation_literal();
        let link = linker();
        let link = link.as_ref();
        self.attach_printable_lazy(|| format!("{label} {link}"))
    }
}

fn documentation_literal() -> String {
    "see also:".bold().cyan().to_string()
}

/// Attach a final "please report this" footer to an error that reaches the top of `main`.
///
/// Distinct from [`ErrorHelper`] because this is not advice for fixing the problem,
/// it's a request for the reader to tell us about it.
pub trait FatalErrorReport {
    /// Attach a request that the reader report this error upstream.
    fn request_support(self) -> Self;
}

impl<T, C> FatalErrorReport for Result<T, C> {
    fn request_support(self) -> Self {
        let label = "note:".bold().yellow().to_string();
        self.attach_printable_lazy(|| {
            format!("{label} if this looks like a bug, please file an issue with the output above")
        })
    }
}

/// Lift a bare [`std::error::Error`] into a [`Report`] under the given context.
///
/// This is a thin wrapper over [`ResultExt::change_context`]/[`ResultExt::context`]
/// that exists so call sites can import one trait instead of reaching for
/// `error_stack::ResultExt` directly; it keeps the fluent `.help()`/`.describe()`
/// chains in this module self-contained.
pub trait IntoContext<T, E> {
    /// Convert the error variant into a [`Report`] with the given context.
    fn context<C: Context>(self, context: C) -> Result<T, C>;

    /// Lazily convert the error variant into a [`Report`] with the given context.
    fn context_lazy<C: Context, F: FnOnce() -> C>(self, context: F) -> Result<T, C>;
}

impl<T, E> IntoContext<T, E> for std::result::Result<T, E>
where
    E: Context,
{
    fn context<C: Context>(self, context: C) -> Result<T, C> {
        self.map_err(Report::new).change_context(context)
    }

    fn context_lazy<C: Context, F: FnOnce() -> C>(self, context: F) -> Result<T, C> {
        self.map_err(Report::new).change_context_lazy(context)
    }
}

/// Merge two independently-failed [`Report`] stacks into one.
///
/// Use when two unrelated validations both may fail and both failures are
/// worth surfacing in the same error (e.g. validating two independent
/// startup arguments); reach for this instead of dropping one error on the
/// floor when only one return value is possible.
macro_rules! merge_error_stacks {
    ($first:expr, $second:expr) => {{
        let mut first = $first;
        first.extend_one($second);
        first
    }};
}

pub(crate) use merge_error_stacks;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("some error")]
    struct Error;

    #[test]
    fn help_attaches_text() {
        let err: Result<(), Error> = Err(Report::new(Error)).help("do the thing");
        let rendered = format!("{:?}", err.unwrap_err());
        assert!(rendered.contains("do the thing"));
    }

    #[test]
    fn describe_attaches_text() {
        let err: Result<(), Error> = Err(Report::new(Error)).describe("while doing the thing");
        let rendered = format!("{:?}", err.unwrap_err());
        assert!(rendered.contains("while doing the thing"));
    }

    #[test]
    fn into_context_wraps_std_error() {
        let io_err: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        let wrapped = io_err.context(Error);
        assert!(wrapped.is_err());
    }
}
