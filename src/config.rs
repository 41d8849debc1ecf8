/// Application-level constants
pub const APP_NAME: &str = "contract-lens";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable pointing at a JSON analysis config file.
pub const CONFIG_PATH_ENV: &str = "CONTRACT_LENS_CONFIG";

/// Hard ceiling on accepted document size.
pub const MAX_DOCUMENT_BYTES: usize = 100 * 1024 * 1024; // 100 MB

/// Default log filter when `RUST_LOG` is unset.
/// Debug builds surface this crate's debug events; release stays at info.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "contract_lens=debug,info"
    } else {
        "info"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_name_is_contract_lens() {
        assert_eq!(APP_NAME, "contract-lens");
    }

    #[test]
    fn app_version_matches_cargo() {
        assert_eq!(APP_VERSION, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn default_filter_mentions_info() {
        assert!(default_log_filter().contains("info"));
    }

    #[test]
    fn document_ceiling_is_100mb() {
        assert_eq!(MAX_DOCUMENT_BYTES, 104_857_600);
    }
}
