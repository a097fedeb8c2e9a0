use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::config::RankingConfig;
use crate::models::Whale;

/// A qualified whale with its composite rank score.
#[derive(Debug, Clone)]
pub struct RankedWhale {
    pub wallet_address: String,
    pub score: Decimal,
    /// Min-max normalized score over the cohort, in [0, 1].
    pub score_norm: Decimal,
    pub risk_score: i16,
}

/// Order the qualified cohort by composite score:
///
/// ```text
/// score = w_vol · norm(volume) + w_rec · norm(recency) + w_freq · norm(freq)
///       − w_risk · risk_score/10
/// ```
///
/// `norm` is min-max over the cohort (a flat cohort normalizes to 1). The
/// sort is stable with ties broken by lower risk score, then earlier
/// first_seen_at.
pub fn rank_whales(cohort: &[Whale], config: &RankingConfig, now: DateTime<Utc>) -> Vec<RankedWhale> {
    if cohort.is_empty() {
        return Vec::new();
    }

    let volumes: Vec<Decimal> = cohort.iter().map(|w| w.total_volume_usd).collect();
    let recencies: Vec<Decimal> = cohort
        .iter()
        .map(|w| recency_bonus(w.last_active_at, now))
        .collect();
    let frequencies: Vec<Decimal> = cohort
        .iter()
        .map(|w| Decimal::from(w.trades_last_3_days))
        .collect();

    let ten = Decimal::from(10);
    let scores: Vec<Decimal> = cohort
        .iter()
        .enumerate()
        .map(|(i, w)| {
            config.w_volume * min_max(&volumes, volumes[i])
                + config.w_recency * min_max(&recencies, recencies[i])
                + config.w_frequency * min_max(&frequencies, frequencies[i])
                - config.w_risk * (Decimal::from(w.risk_score) / ten)
        })
        .collect();

    let mut ranked: Vec<(usize, RankedWhale)> = cohort
        .iter()
        .enumerate()
        .map(|(i, w)| {
            (
                i,
                RankedWhale {
                    wallet_address: w.wallet_address.clone(),
                    score: scores[i],
                    score_norm: min_max(&scores, scores[i]),
                    risk_score: w.risk_score,
                },
            )
        })
        .collect();

    ranked.sort_by(|(ia, a), (ib, b)| {
        b.score
            .cmp(&a.score)
            .then(a.risk_score.cmp(&b.risk_score))
            .then(cohort[*ia].first_seen_at.cmp(&cohort[*ib].first_seen_at))
    });

    ranked.into_iter().map(|(_, r)| r).collect()
}

/// `1 / (1 + days_since_last_active)`; an address never seen active scores 0.
fn recency_bonus(last_active_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Decimal {
    match last_active_at {
        Some(t) => {
            let days = (now - t).num_days().max(0);
            Decimal::ONE / (Decimal::ONE + Decimal::from(days))
        }
        None => Decimal::ZERO,
    }
}

/// Min-max normalization over the cohort; a flat cohort maps to 1 so a lone
/// qualified whale gets full credit.
fn min_max(values: &[Decimal], value: Decimal) -> Decimal {
    let min = values.iter().copied().min().unwrap_or(Decimal::ZERO);
    let max = values.iter().copied().max().unwrap_or(Decimal::ZERO);
    if max == min {
        Decimal::ONE
    } else {
        (value - min) / (max - min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn whale(
        address: &str,
        volume: Decimal,
        recent: i64,
        risk: i16,
        days_since_active: i64,
        first_seen_days_ago: i64,
    ) -> Whale {
        let now = Utc::now();
        Whale {
            wallet_address: address.into(),
            first_seen_at: now - Duration::days(first_seen_days_ago),
            last_active_at: Some(now - Duration::days(days_since_active)),
            total_trades: 100,
            total_volume_usd: volume,
            avg_trade_size_usd: volume / dec!(100),
            trades_last_3_days: recent,
            days_active: 10,
            risk_score: risk,
            status: "qualified".into(),
            is_active: true,
            rank_score: None,
            realized_pnl_usd: None,
            copied_trade_count: None,
            updated_at: now,
        }
    }

    #[test]
    fn higher_volume_wins_with_equal_everything_else() {
        let now = Utc::now();
        let cohort = vec![
            whale("0xsmall", dec!(1000), 5, 3, 0, 10),
            whale("0xbig", dec!(50000), 5, 3, 0, 10),
        ];
        let ranked = rank_whales(&cohort, &RankingConfig::default(), now);
        assert_eq!(ranked[0].wallet_address, "0xbig");
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn single_whale_normalizes_to_one() {
        let now = Utc::now();
        let cohort = vec![whale("0xonly", dec!(2400), 4, 6, 0, 2)];
        let ranked = rank_whales(&cohort, &RankingConfig::default(), now);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].score_norm, Decimal::ONE);
    }

    #[test]
    fn risk_breaks_score_ties() {
        let now = Utc::now();
        let cohort = vec![
            whale("0xrisky", dec!(10000), 5, 6, 0, 10),
            whale("0xsafe", dec!(10000), 5, 2, 0, 10),
        ];
        let ranked = rank_whales(&cohort, &RankingConfig::default(), now);
        // Lower risk both raises the score and wins the tie-break.
        assert_eq!(ranked[0].wallet_address, "0xsafe");
    }

    #[test]
    fn earlier_first_seen_breaks_full_ties() {
        let now = Utc::now();
        let cohort = vec![
            whale("0xnew", dec!(10000), 5, 3, 0, 1),
            whale("0xold", dec!(10000), 5, 3, 0, 30),
        ];
        let ranked = rank_whales(&cohort, &RankingConfig::default(), now);
        assert_eq!(ranked[0].wallet_address, "0xold");
    }

    #[test]
    fn recency_bonus_decays() {
        let now = Utc::now();
        let fresh = recency_bonus(Some(now), now);
        let stale = recency_bonus(Some(now - Duration::days(9)), now);
        assert_eq!(fresh, Decimal::ONE);
        assert_eq!(stale, Decimal::ONE / dec!(10));
        assert_eq!(recency_bonus(None, now), Decimal::ZERO);
    }

    #[test]
    fn empty_cohort_ranks_empty() {
        assert!(rank_whales(&[], &RankingConfig::default(), Utc::now()).is_empty());
    }
}
