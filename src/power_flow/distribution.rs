use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// How a sum is split between members that can still move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DistributionBias {
    /// Proportional to member weight
    #[default]
    Weighted,
    /// Equal shares regardless of weight
    Equal,
    /// Proportional to state of charge: emptier members charge more and
    /// fuller members discharge more, so SoCs converge over time
    KeepAllNearEqual,
    /// Starts from the last applied setpoints and only moves what the
    /// constraints require; shares of a move are weighted
    MovingTowardsTarget,
}

impl DistributionBias {
    /// Whether a solve starts from the last applied setpoints instead of zero.
    pub fn starts_from_last(self) -> bool {
        self == DistributionBias::MovingTowardsTarget
    }
}

/// Weight assumed for a member whose state of charge is unknown
const UNKNOWN_SOC_WEIGHT: u64 = 50;

/// Closed integer interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub lo: i64,
    pub hi: i64,
}

impl Interval {
    pub const FULL: Interval = Interval {
        lo: i64::MIN,
        hi: i64::MAX,
    };

    pub fn new(lo: i64, hi: i64) -> Self {
        Self { lo, hi }
    }

    pub fn point(value: i64) -> Self {
        Self { lo: value, hi: value }
    }

    pub fn is_empty(&self) -> bool {
        self.lo > self.hi
    }

    pub fn contains(&self, value: i64) -> bool {
        self.lo <= value && value <= self.hi
    }

    pub fn intersect(&self, other: Interval) -> Interval {
        Interval {
            lo: self.lo.max(other.lo),
            hi: self.hi.min(other.hi),
        }
    }

    /// Minkowski sum, saturating at the i64 range.
    pub fn add(&self, other: Interval) -> Interval {
        Interval {
            lo: self.lo.saturating_add(other.lo),
            hi: self.hi.saturating_add(other.hi),
        }
    }

    /// Point of this (non-empty) interval closest to `value`.
    pub fn nearest(&self, value: i64) -> i64 {
        value.clamp(self.lo, self.hi)
    }

    /// Point of this (non-empty) interval closest to `other`.
    pub fn nearest_to(&self, other: Interval) -> i64 {
        if other.hi < self.lo {
            self.lo
        } else if other.lo > self.hi {
            self.hi
        } else {
            self.lo.max(other.lo)
        }
    }

    /// Distance from `value` to this interval; 0 when contained.
    pub fn distance(&self, value: i64) -> i64 {
        if value < self.lo {
            self.lo.saturating_sub(value)
        } else if value > self.hi {
            value.saturating_sub(self.hi)
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    pub weight: u64,
    pub lo: i64,
    pub hi: i64,
    /// State of charge in percent, used by [`DistributionBias::KeepAllNearEqual`]
    pub soc: Option<u8>,
}

impl Member {
    pub fn new(weight: u64, lo: i64, hi: i64) -> Self {
        Self {
            weight,
            lo: lo.min(hi),
            hi,
            soc: None,
        }
    }

    pub fn with_soc(mut self, soc: Option<u8>) -> Self {
        self.soc = soc.map(|s| s.min(100));
        self
    }

    /// Weight of this member when moving power in the direction of `sign`.
    fn weight_for(&self, bias: DistributionBias, sign: i128) -> u64 {
        match bias {
            DistributionBias::Equal => 1,
            DistributionBias::KeepAllNearEqual => match self.soc {
                Some(soc) if sign < 0 => 100 - soc as u64,
                Some(soc) => soc as u64,
                None => UNKNOWN_SOC_WEIGHT,
            },
            DistributionBias::Weighted | DistributionBias::MovingTowardsTarget => self.weight,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Distribution {
    pub values: Vec<i64>,
    /// Part of the requested total no member could absorb
    pub unmet: i64,
    pub iterations: usize,
}

/// Splits `total` over `members` by integer water-filling.
///
/// Members start at `clamp(0, lo, hi)`. Each round the outstanding remainder
/// is shared by the members that can still move in its direction, rounding
/// toward zero; leftover units go one each to the heaviest members (ties in
/// declaration order). Overflow from clamping carries into the next round.
///
/// Whenever `Σlo <= total <= Σhi` the result sums exactly to `total`.
pub fn distribute(total: i64, members: &[Member], bias: DistributionBias, max_iterations: usize) -> Distribution {
    let mut values: Vec<i64> = members.iter().map(|m| 0.clamp(m.lo, m.hi)).collect();
    let mut remainder = total as i128 - values.iter().map(|v| *v as i128).sum::<i128>();
    let mut iterations = 0;

    while remainder != 0 && iterations < max_iterations {
        let eligible: Vec<usize> = (0..members.len())
            .filter(|&i| {
                if remainder > 0 {
                    values[i] < members[i].hi
                } else {
                    values[i] > members[i].lo
                }
            })
            .collect();
        if eligible.is_empty() {
            break;
        }
        iterations += 1;

        let sign = remainder.signum();
        let weight_sum: u128 = eligible.iter().map(|&i| members[i].weight_for(bias, sign) as u128).sum();
        let equal = weight_sum == 0;
        let weight_of = |i: usize| -> i128 {
            if equal {
                1
            } else {
                members[i].weight_for(bias, sign) as i128
            }
        };
        let total_weight: i128 = eligible.iter().map(|&i| weight_of(i)).sum();

        let mut shares: Vec<i128> = eligible
            .iter()
            .map(|&i| remainder * weight_of(i) / total_weight)
            .collect();

        let residual = remainder - shares.iter().sum::<i128>();
        if residual != 0 {
            let mut order: Vec<usize> = (0..eligible.len()).collect();
            order.sort_by(|&a, &b| weight_of(eligible[b]).cmp(&weight_of(eligible[a])).then(a.cmp(&b)));
            let step = residual.signum();
            for k in order.into_iter().take(residual.unsigned_abs() as usize) {
                shares[k] += step;
            }
        }

        let mut overflow: i128 = 0;
        for (k, &i) in eligible.iter().enumerate() {
            let wanted = values[i] as i128 + shares[k];
            let clamped = wanted.clamp(members[i].lo as i128, members[i].hi as i128);
            overflow += wanted - clamped;
            values[i] = clamped as i64;
        }
        remainder = overflow;
    }

    Distribution {
        values,
        unmet: remainder.clamp(i64::MIN as i128, i64::MAX as i128) as i64,
        iterations,
    }
}
