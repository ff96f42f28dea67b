//! Functions and constants for documentation links.

use once_cell::sync::OnceCell;

/// The reference documentation for the persisted runner config file.
pub fn config_file_reference() -> &'static str {
    // This value is set by Cargo and evaluated at compile time.
    static LAZY: OnceCell<String> = OnceCell::new();
    LAZY.get_or_init(|| {
        let sha = super::build_sha();
        let home = super::repo_home();
        format!("{home}/blob/{sha}/docs/reference/config.md")
    })
}

/// The reference documentation for the labels/routines a runner declares on registration.
pub fn labels_reference() -> &'static str {
    static LAZY: OnceCell<String> = OnceCell::new();
    LAZY.get_or_init(|| {
        let sha = super::build_sha();
        let home = super::repo_home();
        format!("{home}/blob/{sha}/docs/reference/labels.md")
    })
}
