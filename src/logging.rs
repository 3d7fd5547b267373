//! tracing subscriber setup

use tracing_subscriber::filter::ParseError;
use tracing_subscriber::EnvFilter;

/// Directives added by `--verbose`
pub const VERBOSE_DIRECTIVES: &[&str] = &[
    "fido_seeder=debug",
    "seedkey=debug",
    "seedkey_transport=debug",
];

/// Build the log filter.
///
/// `RUST_LOG` (passed as `env`) wins over the configured filter; `verbose`
/// adds debug output for this workspace on top of either.
pub fn build_filter(
    env: Option<&str>,
    configured: &str,
    verbose: bool,
) -> Result<EnvFilter, ParseError> {
    let mut filter = match env.filter(|s| !s.trim().is_empty()) {
        Some(env) => EnvFilter::try_new(env)?,
        None => EnvFilter::try_new(configured)?,
    };
    if verbose {
        for directive in VERBOSE_DIRECTIVES {
            filter = filter.add_directive(directive.parse()?);
        }
    }
    Ok(filter)
}

/// Install the global subscriber, logging to stderr
pub fn init(configured: &str, verbose: bool) -> anyhow::Result<()> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(env.as_deref(), configured, verbose)?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_filter_used_without_env() {
        let filter = build_filter(None, "warn", false).unwrap();
        assert_eq!(filter.to_string(), "warn");
    }

    #[test]
    fn test_env_takes_precedence() {
        let filter = build_filter(Some("seedkey=trace"), "warn", false).unwrap();
        assert_eq!(filter.to_string(), "seedkey=trace");

        // Blank RUST_LOG counts as unset
        let filter = build_filter(Some("  "), "warn", false).unwrap();
        assert_eq!(filter.to_string(), "warn");
    }

    #[test]
    fn test_verbose_adds_workspace_directives() {
        let rendered = build_filter(None, "info", true).unwrap().to_string();
        for directive in VERBOSE_DIRECTIVES {
            assert!(rendered.contains(directive), "{rendered} lacks {directive}");
        }
    }

    #[test]
    fn test_bad_filter_rejected() {
        assert!(build_filter(None, "seedkey=loud", false).is_err());
    }
}
