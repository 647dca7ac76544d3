//! Fixed-point integer math. A "micro" is a 6-decimal fixed-point unit:
//! 1_000_000 micros = 1.0. Basis points: 10_000 bps = 100%.

pub const ONE: i64 = 1_000_000;
pub const MAX_PRICE_MICROS: i64 = 1_000_000;
pub const BPS_DENOM: i64 = 10_000;

/// Clamp a price into [0, 1_000_000].
pub fn clamp_price(price: i64) -> i64 {
    price.clamp(0, MAX_PRICE_MICROS)
}

/// `(collateral * ONE) / shares`, clamped to a valid price. Returns 0 when
/// `shares == 0` rather than dividing by zero.
pub fn price_from_fill(collateral_micros: i64, share_micros: i64) -> i64 {
    if share_micros == 0 {
        return 0;
    }
    clamp_price(mul_div(collateral_micros, ONE, share_micros))
}

/// `a * b / c` computed in i128 to avoid overflow, then narrowed back to i64.
pub fn mul_div(a: i64, b: i64, c: i64) -> i64 {
    if c == 0 {
        return 0;
    }
    (((a as i128) * (b as i128)) / (c as i128)) as i64
}

/// Apply a basis-points fraction to a micros amount: `amount * bps / 10_000`.
pub fn apply_bps(amount_micros: i64, bps: i64) -> i64 {
    mul_div(amount_micros, bps, BPS_DENOM)
}

/// Volume-weighted average price in integer micros: `(sum_notional * ONE) / sum_shares`.
pub fn vwap(sum_notional_micros: i64, sum_share_micros: i64) -> i64 {
    if sum_share_micros == 0 {
        return 0;
    }
    mul_div(sum_notional_micros, ONE, sum_share_micros)
}

/// `shares = notional * ONE / price`, guarding against a zero price.
pub fn shares_from_notional(notional_micros: i64, price_micros: i64) -> i64 {
    if price_micros == 0 {
        return 0;
    }
    mul_div(notional_micros, ONE, price_micros)
}

/// Ratio in bps of `part / whole`, clamped to [0, 10_000].
pub fn ratio_bps(part: i64, whole: i64) -> i64 {
    if whole == 0 {
        return 0;
    }
    mul_div(part, BPS_DENOM, whole).clamp(0, BPS_DENOM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_from_fill_divides_and_clamps() {
        assert_eq!(price_from_fill(100_000_000, 200_000_000), 500_000);
        assert_eq!(price_from_fill(0, 0), 0);
        // over-collateralized fill still clamps to the max valid price
        assert_eq!(price_from_fill(300_000_000, 100_000_000), MAX_PRICE_MICROS);
    }

    #[test]
    fn vwap_is_commutative_over_order() {
        let a = vwap(100_000_000, 200_000_000);
        let b = vwap(100_000_000, 200_000_000);
        assert_eq!(a, b);
    }

    #[test]
    fn ratio_bps_never_exceeds_denom() {
        assert_eq!(ratio_bps(500, 100), BPS_DENOM);
        assert_eq!(ratio_bps(50, 100), 5_000);
        assert_eq!(ratio_bps(1, 0), 0);
    }

    #[test]
    fn shares_from_notional_guards_zero_price() {
        assert_eq!(shares_from_notional(1_000_000, 0), 0);
        assert_eq!(shares_from_notional(1_000_000, 500_000), 2_000_000);
    }
}
