use serde::{Deserialize, Serialize};

/// Default rate of wallet-built transactions, in satoshis per 1000 vbytes.
pub const DEFAULT_FEE_RATE_PER_KVB: u64 = 300_000;

/// How much fee a wallet-built transaction pays.
///
/// Written in configuration files as `fixed: 500` or
/// `rate: {sat_per_kvb: 2000}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "FeePolicyRepr", into = "FeePolicyRepr")]
pub enum FeePolicy {
    /// Exact fee in satoshis
    Fixed(u64),
    /// Fee proportional to the final virtual size, rounded up
    Rate { sat_per_kvb: u64 },
}

impl FeePolicy {
    pub fn rate(sat_per_kvb: u64) -> Self {
        FeePolicy::Rate { sat_per_kvb }
    }

    pub fn fee_for_vsize(&self, vsize: usize) -> u64 {
        match *self {
            FeePolicy::Fixed(fee) => fee,
            FeePolicy::Rate { sat_per_kvb } => (vsize as u64 * sat_per_kvb).div_ceil(1000),
        }
    }

    pub fn depends_on_size(&self) -> bool {
        matches!(self, FeePolicy::Rate { .. })
    }
}

impl Default for FeePolicy {
    fn default() -> Self {
        FeePolicy::Rate {
            sat_per_kvb: DEFAULT_FEE_RATE_PER_KVB,
        }
    }
}

// Single-key map form shared by every serde format
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum FeePolicyRepr {
    Fixed { fixed: u64 },
    Rate { rate: RateRepr },
}

#[derive(Serialize, Deserialize)]
struct RateRepr {
    sat_per_kvb: u64,
}

impl From<FeePolicyRepr> for FeePolicy {
    fn from(repr: FeePolicyRepr) -> Self {
        match repr {
            FeePolicyRepr::Fixed { fixed } => FeePolicy::Fixed(fixed),
            FeePolicyRepr::Rate { rate } => FeePolicy::rate(rate.sat_per_kvb),
        }
    }
}

impl From<FeePolicy> for FeePolicyRepr {
    fn from(policy: FeePolicy) -> Self {
        match policy {
            FeePolicy::Fixed(fixed) => FeePolicyRepr::Fixed { fixed },
            FeePolicy::Rate { sat_per_kvb } => FeePolicyRepr::Rate {
                rate: RateRepr { sat_per_kvb },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_rounds_up() {
        let policy = FeePolicy::rate(1_000);
        assert_eq!(policy.fee_for_vsize(110), 110);

        let policy = FeePolicy::rate(1_500);
        assert_eq!(policy.fee_for_vsize(101), 152);
        assert_eq!(FeePolicy::default().fee_for_vsize(104), 31_200);
    }

    #[test]
    fn test_fixed_ignores_size() {
        assert_eq!(FeePolicy::Fixed(1234).fee_for_vsize(10_000), 1234);
        assert!(!FeePolicy::Fixed(1).depends_on_size());
    }

    #[test]
    fn test_yaml_forms() {
        let fixed: FeePolicy = serde_yaml::from_str("fixed: 500").unwrap();
        assert_eq!(fixed, FeePolicy::Fixed(500));
        let rate: FeePolicy = serde_yaml::from_str("rate:\n  sat_per_kvb: 2000").unwrap();
        assert_eq!(rate, FeePolicy::rate(2000));
        let flow: FeePolicy = serde_yaml::from_str("{rate: {sat_per_kvb: 10}}").unwrap();
        assert_eq!(flow, FeePolicy::rate(10));

        assert_eq!(serde_yaml::to_string(&FeePolicy::Fixed(7)).unwrap(), "fixed: 7\n");
        assert!(serde_yaml::from_str::<FeePolicy>("fixed: -1").is_err());
        assert!(serde_yaml::from_str::<FeePolicy>("percent: 3").is_err());
    }

    #[test]
    fn test_json_form() {
        let rate: FeePolicy = serde_json::from_str(r#"{"rate":{"sat_per_kvb":1500}}"#).unwrap();
        assert_eq!(rate, FeePolicy::rate(1500));
        assert_eq!(
            serde_json::to_string(&FeePolicy::Fixed(500)).unwrap(),
            r#"{"fixed":500}"#
        );
    }
}
