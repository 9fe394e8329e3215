//! Per-element SMO arithmetic
//!
//! Everything a single lane computes: working-set candidates, the
//! two-variable analytic step and the bound classification. Kept free of
//! device state so the passes in the controller stay thin.

use crate::core::{AlphaStatus, CValue, GradValue, TAU};
use crate::reduce::{GmaxCandidate, MinCandidate, NO_INDEX};

/// "up" and "low" violation of element `t`
///
/// `gmax` is `-y_t G_t` when `t` can still move up, `gmax2` is `y_t G_t`
/// when it can still move down; `-∞` otherwise.
pub fn gmax_candidate(t: usize, y: i8, g: GradValue, status: AlphaStatus) -> GmaxCandidate {
    let up = match (y > 0, status) {
        (true, AlphaStatus::UpperBound) | (false, AlphaStatus::LowerBound) => None,
        (true, _) => Some(-g),
        (false, _) => Some(g),
    };
    let low = match (y > 0, status) {
        (true, AlphaStatus::LowerBound) | (false, AlphaStatus::UpperBound) => GradValue::NEG_INFINITY,
        (true, _) => g,
        (false, _) => -g,
    };
    match up {
        Some(gmax) => GmaxCandidate::new(gmax, low, t),
        None => GmaxCandidate::new(GradValue::NEG_INFINITY, low, NO_INDEX),
    }
}

/// The first working-set element as seen by the objective-difference pass
#[derive(Debug, Clone, Copy)]
pub struct FirstIndex {
    pub gmax: GradValue,
    pub y: i8,
    pub qd: GradValue,
}

/// State of a candidate second element `t`
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub t: usize,
    pub y: i8,
    pub g: GradValue,
    pub status: AlphaStatus,
    pub qd: GradValue,
    /// `Q_i[t]` from the cached column of the first element
    pub q_it: CValue,
}

/// Second-order objective decrease of pairing `t` with the first element
///
/// Elements that cannot move down, or whose gradient gap is not positive,
/// yield the empty candidate.
pub fn obj_diff_candidate(first: &FirstIndex, cand: &Candidate) -> MinCandidate {
    let y_i = GradValue::from(first.y);
    let q_it = GradValue::from(cand.q_it);
    let (movable, grad_diff, quad) = if cand.y > 0 {
        (
            cand.status != AlphaStatus::LowerBound,
            first.gmax + cand.g,
            first.qd + cand.qd - 2.0 * y_i * q_it,
        )
    } else {
        (
            cand.status != AlphaStatus::UpperBound,
            first.gmax - cand.g,
            first.qd + cand.qd + 2.0 * y_i * q_it,
        )
    };
    if !movable || grad_diff <= 0.0 {
        return MinCandidate::default();
    }
    let quad = if quad > 0.0 { quad } else { TAU };
    MinCandidate::new((-(grad_diff * grad_diff) / quad) as CValue, cand.t)
}

/// Inputs of the analytic two-variable step
#[derive(Debug, Clone, Copy)]
pub struct PairState {
    pub y: [i8; 2],
    pub g: [GradValue; 2],
    pub qd: [GradValue; 2],
    pub alpha: [GradValue; 2],
    pub c: [GradValue; 2],
    /// `Q_i[j]`
    pub q_ij: GradValue,
}

/// New alphas of the pair and how much each moved
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairUpdate {
    pub alpha: [GradValue; 2],
    pub delta: [GradValue; 2],
}

/// Solve the two-variable subproblem for `(i, j)` and clip to the box
pub fn update_pair(s: &PairState) -> PairUpdate {
    let [c_i, c_j] = s.c;
    let [old_i, old_j] = s.alpha;
    let (mut a_i, mut a_j) = (old_i, old_j);

    if s.y[0] != s.y[1] {
        let quad = positive_or_tau(s.qd[0] + s.qd[1] + 2.0 * s.q_ij);
        let delta = (-s.g[0] - s.g[1]) / quad;
        let diff = a_i - a_j;
        a_i += delta;
        a_j += delta;

        if diff > 0.0 {
            if a_j < 0.0 {
                a_j = 0.0;
                a_i = diff;
            }
        } else if a_i < 0.0 {
            a_i = 0.0;
            a_j = -diff;
        }
        if diff > c_i - c_j {
            if a_i > c_i {
                a_i = c_i;
                a_j = c_i - diff;
            }
        } else if a_j > c_j {
            a_j = c_j;
            a_i = c_j + diff;
        }
    } else {
        let quad = positive_or_tau(s.qd[0] + s.qd[1] - 2.0 * s.q_ij);
        let delta = (s.g[0] - s.g[1]) / quad;
        let sum = a_i + a_j;
        a_i -= delta;
        a_j += delta;

        if sum > c_i {
            if a_i > c_i {
                a_i = c_i;
                a_j = sum - c_i;
            }
        } else if a_j < 0.0 {
            a_j = 0.0;
            a_i = sum;
        }
        if sum > c_j {
            if a_j > c_j {
                a_j = c_j;
                a_i = sum - c_j;
            }
        } else if a_i < 0.0 {
            a_i = 0.0;
            a_j = sum;
        }
    }

    PairUpdate {
        alpha: [a_i, a_j],
        delta: [a_i - old_i, a_j - old_j],
    }
}

fn positive_or_tau(quad: GradValue) -> GradValue {
    if quad > 0.0 {
        quad
    } else {
        TAU
    }
}

/// Offset of the decision function from the final gradient
///
/// Averages `y G` over free variables; with none free, takes the midpoint
/// of the feasible interval (or its finite end).
pub fn calculate_rho(y: &[i8], g: &[GradValue], status: &[AlphaStatus]) -> f64 {
    let mut ub = f64::INFINITY;
    let mut lb = f64::NEG_INFINITY;
    let mut nr_free = 0usize;
    let mut sum_free = 0.0;

    for ((&y_t, &g_t), &status_t) in y.iter().zip(g).zip(status) {
        let yg = f64::from(y_t) * g_t;
        match status_t {
            AlphaStatus::UpperBound => {
                if y_t < 0 {
                    ub = ub.min(yg);
                } else {
                    lb = lb.max(yg);
                }
            }
            AlphaStatus::LowerBound => {
                if y_t > 0 {
                    ub = ub.min(yg);
                } else {
                    lb = lb.max(yg);
                }
            }
            AlphaStatus::Free => {
                nr_free += 1;
                sum_free += yg;
            }
        }
    }

    if nr_free > 0 {
        sum_free / nr_free as f64
    } else {
        match (ub.is_finite(), lb.is_finite()) {
            (true, true) => (ub + lb) / 2.0,
            (true, false) => ub,
            (false, true) => lb,
            (false, false) => 0.0,
        }
    }
}

/// Dual objective `½ Σ α_t (G_t + p_t)`
pub fn objective_value(alpha: &[GradValue], g: &[GradValue], p: &[f64]) -> f64 {
    alpha
        .iter()
        .zip(g)
        .zip(p)
        .map(|((&a, &g_t), &p_t)| a * (g_t + p_t))
        .sum::<f64>()
        / 2.0
}
