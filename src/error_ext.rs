//! Top-level `error_stack` configuration.
//!
//! `main` calls [`install`] exactly once at startup, before constructing any
//! `Report`. The fluent helpers in [`crate::ext::error_stack`] (`.help(...)`,
//! `.describe(...)`, `.documentation(...)`) attach their text directly via
//! `attach_printable_lazy`, so unlike the debug-hook pattern `error_stack`
//! examples often use, nothing needs to be registered for them to show up in
//! a printed report. What does need registering here is the terminal color
//! mode and the span trace capture condition.
use error_stack::fmt::ColorMode;

/// Configure global `error_stack` behavior: color output and span trace capture.
///
/// Must run before any `Report` is printed.
pub fn install() {
    let mode = if atty::is(atty::Stream::Stderr) {
        ColorMode::Color
    } else {
        ColorMode::None
    };
    error_stack::Report::set_color_mode(mode);
}
