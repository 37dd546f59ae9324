//! Version text for the CLI.

/// `muxctl --version`: crate version and the commit stamped by build.rs.
pub const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (commit ",
    env!("MUXCTL_COMMIT"),
    ")"
);
