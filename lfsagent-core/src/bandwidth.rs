//! Per-transfer bandwidth limits for bulk copies

use crate::config::{ConfigResolver, Scope, get_u64, keys};
use crate::error::ConfigError;

/// Assumed link speed when no explicit limit is configured, in kbit/s (1 Gbit)
pub const DEFAULT_LINK_KBITS: u64 = 1_048_576;
/// Share of the assumed link used by default, in percent
pub const DEFAULT_LINK_SHARE_PERCENT: u64 = 40;
/// Concurrency assumed when neither config nor the host provides one
pub const DEFAULT_CONCURRENCY: u64 = 8;

/// Rate cap applied to every bulk copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandwidthLimit {
    Unlimited,
    /// Per-transfer cap in kbit/s
    PerTransfer(u64),
}

impl BandwidthLimit {
    /// Split a total cap across concurrent transfers.
    ///
    /// `total_kbits` of `None` means "not configured" and uses the default
    /// share of the assumed link; `Some(0)` disables limiting.
    pub fn compute(total_kbits: Option<u64>, concurrency: Option<u64>) -> Self {
        let total = match total_kbits {
            Some(0) => return BandwidthLimit::Unlimited,
            Some(kbits) => kbits,
            None => DEFAULT_LINK_KBITS * DEFAULT_LINK_SHARE_PERCENT / 100,
        };
        let concurrency = concurrency.unwrap_or(DEFAULT_CONCURRENCY).max(1);
        BandwidthLimit::PerTransfer((total / concurrency).max(1))
    }

    /// Resolve the limit from configuration.
    ///
    /// `host_concurrency` is what the host announced in its init request and
    /// only applies when `lfs.concurrenttransfers` is unset.
    pub fn from_config(
        config: &dyn ConfigResolver,
        host_concurrency: Option<u64>,
    ) -> Result<Self, ConfigError> {
        let total = get_u64(config, keys::BANDWIDTH, &Scope::Current)?;
        let concurrency =
            get_u64(config, keys::CONCURRENT_TRANSFERS, &Scope::Current)?.or(host_concurrency);
        Ok(Self::compute(total, concurrency))
    }

    /// Per-transfer cap, `None` when unlimited
    pub fn kbits(&self) -> Option<u64> {
        match self {
            BandwidthLimit::Unlimited => None,
            BandwidthLimit::PerTransfer(kbits) => Some(*kbits),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticConfig;

    #[test]
    fn test_zero_disables_limit() {
        assert_eq!(BandwidthLimit::compute(Some(0), Some(8)), BandwidthLimit::Unlimited);
        assert_eq!(BandwidthLimit::compute(Some(0), None).kbits(), None);
    }

    #[test]
    fn test_default_share_split_eight_ways() {
        // 0.4 * 1_048_576 / 8 = 52428.8
        assert_eq!(
            BandwidthLimit::compute(None, Some(8)),
            BandwidthLimit::PerTransfer(52428)
        );
        assert_eq!(BandwidthLimit::compute(None, None).kbits(), Some(52428));
    }

    #[test]
    fn test_explicit_limit() {
        assert_eq!(
            BandwidthLimit::compute(Some(4096), Some(4)),
            BandwidthLimit::PerTransfer(1024)
        );
    }

    #[test]
    fn test_zero_concurrency_and_tiny_limits() {
        assert_eq!(BandwidthLimit::compute(Some(100), Some(0)).kbits(), Some(100));
        assert_eq!(BandwidthLimit::compute(Some(3), Some(8)).kbits(), Some(1));
    }

    #[test]
    fn test_from_config_prefers_configured_concurrency() {
        let config = StaticConfig::new("/work/.git")
            .with(keys::BANDWIDTH, "4096")
            .with(keys::CONCURRENT_TRANSFERS, "4");
        let limit = BandwidthLimit::from_config(&config, Some(16)).unwrap();
        assert_eq!(limit.kbits(), Some(1024));
    }

    #[test]
    fn test_from_config_falls_back_to_host_concurrency() {
        let config = StaticConfig::new("/work/.git").with(keys::BANDWIDTH, "4096");
        let limit = BandwidthLimit::from_config(&config, Some(2)).unwrap();
        assert_eq!(limit.kbits(), Some(2048));
    }

    #[test]
    fn test_from_config_rejects_garbage() {
        let config = StaticConfig::new("/work/.git").with(keys::BANDWIDTH, "fast");
        assert!(BandwidthLimit::from_config(&config, None).is_err());
    }
}
