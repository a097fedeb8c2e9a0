use rust_decimal::Decimal;

use crate::config::SizingConfig;

/// Fractional-Kelly copy size from whale activity quality.
///
/// The data source exposes no settlement outcomes, so a true win
/// probability is unknowable; the engine substitutes a bounded prior lifted
/// by the whale's normalized rank score:
///
/// ```text
/// p      = clamp(kelly_prior + α · rank_norm, 0.50, 0.70)
/// b      = 1/price − 1
/// f*     = max((b·p − (1−p)) / b, 0)
/// f_used = min(cap, quarter_kelly · f*)
/// size   = clamp(bankroll · f_used, min_position, max_position)
/// ```
///
/// Returns `None` for a malformed price (outside the open unit interval)
/// and zero when there is no edge.
pub fn kelly_copy_size(
    bankroll: Decimal,
    price: Decimal,
    rank_score_norm: Decimal,
    config: &SizingConfig,
) -> Option<Decimal> {
    if price <= Decimal::ZERO || price >= Decimal::ONE {
        return None;
    }

    let p = win_probability(rank_score_norm, config);
    let b = Decimal::ONE / price - Decimal::ONE;
    if b <= Decimal::ZERO {
        return Some(Decimal::ZERO);
    }

    let q = Decimal::ONE - p;
    let f_star = ((b * p - q) / b).max(Decimal::ZERO);
    let f_used = (config.quarter_kelly_multiplier * f_star).min(config.kelly_fraction_cap);

    if f_used <= Decimal::ZERO {
        return Some(Decimal::ZERO);
    }

    let min_position = bankroll * config.min_position_frac;
    let max_position = bankroll * config.max_position_frac;
    let size = (bankroll * f_used).clamp(min_position, max_position);

    Some(size)
}

fn win_probability(rank_score_norm: Decimal, config: &SizingConfig) -> Decimal {
    let floor = Decimal::new(50, 2);
    let ceiling = Decimal::new(70, 2);
    (config.kelly_prior + config.alpha * rank_score_norm).clamp(floor, ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn config() -> SizingConfig {
        SizingConfig::default()
    }

    #[test]
    fn top_whale_at_40_cents_caps_at_five_percent() {
        // b = 1/0.4 − 1 = 1.5, p = 0.52 + 0.08·1 = 0.60,
        // f* = (1.5·0.6 − 0.4)/1.5 ≈ 0.333, quarter ≈ 0.083, capped at 0.05.
        let size = kelly_copy_size(dec!(100), dec!(0.40), Decimal::ONE, &config()).unwrap();
        assert_eq!(size, dec!(5.00));
    }

    #[test]
    fn probability_is_clamped_to_the_band() {
        let mut cfg = config();
        cfg.alpha = dec!(0.50);
        assert_eq!(win_probability(Decimal::ONE, &cfg), dec!(0.70));

        cfg.kelly_prior = dec!(0.30);
        cfg.alpha = Decimal::ZERO;
        assert_eq!(win_probability(Decimal::ZERO, &cfg), dec!(0.50));
    }

    #[test]
    fn malformed_price_is_rejected() {
        for price in [dec!(0), dec!(1), dec!(-0.2), dec!(1.5)] {
            assert!(kelly_copy_size(dec!(100), price, Decimal::ONE, &config()).is_none());
        }
    }

    #[test]
    fn no_edge_sizes_to_zero() {
        // At a 0.70 price with p clamped to at most 0.70 the edge is at
        // best zero; quarter-Kelly of zero must skip, not clamp up to the
        // minimum position.
        let size = kelly_copy_size(dec!(100), dec!(0.75), Decimal::ZERO, &config()).unwrap();
        assert_eq!(size, Decimal::ZERO);
    }

    #[test]
    fn small_edge_is_floored_at_min_position() {
        // p = 0.52, price 0.50 → b = 1, f* = 0.04, quarter = 0.01 → exactly
        // the 1% floor on a $100 bankroll.
        let size = kelly_copy_size(dec!(100), dec!(0.50), Decimal::ZERO, &config()).unwrap();
        assert_eq!(size, dec!(1.00));

        // A hair less edge still floors to $1 instead of dropping to zero.
        let size = kelly_copy_size(dec!(100), dec!(0.51), Decimal::ZERO, &config()).unwrap();
        assert_eq!(size, dec!(1.00));
    }

    #[test]
    fn size_scales_with_bankroll() {
        let small = kelly_copy_size(dec!(100), dec!(0.40), Decimal::ONE, &config()).unwrap();
        let large = kelly_copy_size(dec!(1000), dec!(0.40), Decimal::ONE, &config()).unwrap();
        assert_eq!(large, small * dec!(10));
    }

    #[test]
    fn better_ranked_whale_gets_bigger_size_until_the_cap() {
        let mut cfg = config();
        cfg.kelly_fraction_cap = dec!(0.50); // lift the cap to see the slope
        let low = kelly_copy_size(dec!(100), dec!(0.40), dec!(0.0), &cfg).unwrap();
        let high = kelly_copy_size(dec!(100), dec!(0.40), dec!(1.0), &cfg).unwrap();
        assert!(high > low);
    }
}
