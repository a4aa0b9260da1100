use crate::config::{ProtocolConfig, BPS_DENOMINATOR};
use crate::model::{Account, Payout, Wei};

/// `floor(amount * bps / 10_000)` without overflowing for any `amount`.
pub fn charity_cut(amount: Wei, bps: u32) -> Wei {
    let denom = Wei::from(BPS_DENOMINATOR);
    let bps = Wei::from(bps.min(BPS_DENOMINATOR));
    (amount / denom) * bps + (amount % denom) * bps / denom
}

/// Split `amount` into the owner leg and the charity leg.
pub fn split_payout(amount: Wei, owner: &Account, config: &ProtocolConfig) -> Payout {
    let charity_amount = charity_cut(amount, config.charity_bps());
    Payout {
        owner: owner.clone(),
        owner_amount: amount - charity_amount,
        charity: config.charity().clone(),
        charity_amount,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cut_floors() {
        assert_eq!(charity_cut(12_345, 500), 617); // 617.25
        assert_eq!(charity_cut(19, 500), 0); // 0.95
        assert_eq!(charity_cut(20, 500), 1);
        assert_eq!(charity_cut(0, 500), 0);
        assert_eq!(charity_cut(1_000, 0), 0);
        assert_eq!(charity_cut(1_000, 10_000), 1_000);
    }

    #[test]
    fn cut_matches_naive_formula() {
        for amount in [1u128, 7, 9_999, 10_000, 10_001, 123_456_789] {
            for bps in [1u32, 250, 333, 5_000, 9_999] {
                assert_eq!(
                    charity_cut(amount, bps),
                    amount * Wei::from(bps) / 10_000,
                    "amount={amount} bps={bps}"
                );
            }
        }
    }

    #[test]
    fn cut_handles_max_amount() {
        let cut = charity_cut(u128::MAX, 10_000);
        assert_eq!(cut, u128::MAX);
        assert!(charity_cut(u128::MAX, 5_000) < u128::MAX);
    }

    #[test]
    fn split_sums_to_amount() {
        let config = ProtocolConfig::new("charity".into(), 500, 0).unwrap();
        let payout = split_payout(12_345, &"alice".into(), &config);
        assert_eq!(payout.owner, Account::from("alice"));
        assert_eq!(payout.charity, Account::from("charity"));
        assert_eq!(payout.charity_amount, 617);
        assert_eq!(payout.owner_amount, 11_728);
        assert_eq!(payout.total(), 12_345);
    }
}
