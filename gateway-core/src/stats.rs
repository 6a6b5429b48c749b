//! Statistics aggregation for `GET_STATISTICS`: sums the daily rows the
//! REST facade returns and derives win rate / profit factor. Rounding to 2
//! decimal places is presentation policy, not broker-mandated (see the
//! open question this resolves).

use gateway_execution::StatsRow;
use rust_decimal::Decimal;
use serde::Serialize;

#[derive(Debug, Clone, Serialize, Default)]
pub struct AggregatedStats {
    pub account_id: String,
    pub trade_count: u32,
    pub win_count: u32,
    pub win_rate: Decimal,
    pub gross_profit: Decimal,
    pub gross_loss: Decimal,
    pub net_profit: Decimal,
    pub profit_factor: Decimal,
}

/// Sums `rows` (one per day, or a single lifetime row) and derives
/// `winRate` (percentage) and `profitFactor` (gross profit / gross loss).
/// Both are zero when there have been no trades, rather than dividing by
/// zero.
pub fn aggregate(account_id: &str, rows: &[StatsRow]) -> AggregatedStats {
    let mut out = AggregatedStats {
        account_id: account_id.to_string(),
        ..Default::default()
    };
    for row in rows {
        out.trade_count += row.trade_count;
        out.win_count += row.win_count;
        out.gross_profit += row.gross_profit;
        out.gross_loss += row.gross_loss;
        out.net_profit += row.net_profit;
    }

    out.win_rate = if out.trade_count > 0 {
        (Decimal::from(out.win_count) / Decimal::from(out.trade_count) * Decimal::ONE_HUNDRED).round_dp(2)
    } else {
        Decimal::ZERO
    };
    out.profit_factor = if out.gross_loss.abs() > Decimal::ZERO {
        (out.gross_profit / out.gross_loss.abs()).round_dp(2)
    } else {
        Decimal::ZERO
    };
    out.gross_profit = out.gross_profit.round_dp(2);
    out.gross_loss = out.gross_loss.round_dp(2);
    out.net_profit = out.net_profit.round_dp(2);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(trade_count: u32, win_count: u32, gross_profit: Decimal, gross_loss: Decimal, net_profit: Decimal) -> StatsRow {
        StatsRow {
            account_id: "A1".into(),
            trade_count,
            win_count,
            gross_profit,
            gross_loss,
            net_profit,
        }
    }

    #[test]
    fn aggregates_two_days_and_derives_win_rate_and_profit_factor() {
        let rows = vec![
            row(10, 6, Decimal::new(60000, 2), Decimal::new(20000, 2), Decimal::new(40000, 2)),
            row(5, 2, Decimal::new(10000, 2), Decimal::new(15000, 2), Decimal::new(-5000, 2)),
        ];
        let stats = aggregate("A1", &rows);
        assert_eq!(stats.trade_count, 15);
        assert_eq!(stats.win_count, 8);
        assert_eq!(stats.win_rate, Decimal::new(5333, 2));
        assert_eq!(stats.gross_profit, Decimal::new(70000, 2));
        assert_eq!(stats.gross_loss, Decimal::new(35000, 2));
        assert_eq!(stats.net_profit, Decimal::new(35000, 2));
        assert_eq!(stats.profit_factor, Decimal::new(200, 2));
    }

    #[test]
    fn zero_trades_reports_zero_rate_and_factor_instead_of_dividing_by_zero() {
        let stats = aggregate("A1", &[]);
        assert_eq!(stats.win_rate, Decimal::ZERO);
        assert_eq!(stats.profit_factor, Decimal::ZERO);
    }
}
