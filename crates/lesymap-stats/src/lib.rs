//! Per-column statistical tests for lesion-to-symptom mapping.
//!
//! Every test compares one lesion column against the behavior vector and
//! returns a [`ColumnResult`] with a statistic, a p-value, and a z-score.
//! Two-group tests split subjects into *spared* (column value `0`) and
//! *lesioned* (any non-zero value). Statistics are oriented so that a
//! positive value means the lesioned group scores higher.

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF, Normal, StudentsT};

/// Smallest group below which the Brunner–Munzel asymptotic p-value is
/// replaced by a permutation estimate.
pub const BM_PERMUTATION_MIN_GROUP: usize = 9;

/// Floor for standard errors of constant groups.
pub const STD_ERROR_FLOOR: f64 = 1e-12;

/// Floor for p-values fed to the inverse normal CDF.
const P_FLOOR: f64 = 1e-300;

// ═══════════════════════════════════════════════════════════════════════════════
// Core types
// ═══════════════════════════════════════════════════════════════════════════════

/// Direction of the alternative hypothesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Alternative {
    /// Lesioned subjects score higher (positive statistic).
    #[default]
    Greater,
    /// Lesioned subjects score lower (negative statistic).
    Less,
    TwoSided,
}

impl Alternative {
    /// Map a statistic onto a scale where larger means more extreme in the
    /// tested direction.
    pub fn orient(self, statistic: f64) -> f64 {
        match self {
            Self::Greater => statistic,
            Self::Less => -statistic,
            Self::TwoSided => statistic.abs(),
        }
    }

    /// P-value of `statistic` under a symmetric null distribution.
    pub fn p_value<D: ContinuousCDF<f64, f64>>(self, statistic: f64, dist: &D) -> f64 {
        match self {
            Self::Greater => dist.sf(statistic),
            Self::Less => dist.cdf(statistic),
            Self::TwoSided => (2.0 * dist.sf(statistic.abs())).min(1.0),
        }
    }

    /// Z-score from a p-value. Positive values are evidence in the tested
    /// direction; two-sided scores carry the sign of the statistic.
    pub fn z_score(self, statistic: f64, p: f64) -> f64 {
        match self {
            Self::Greater | Self::Less => upper_z(p),
            Self::TwoSided => {
                if statistic == 0.0 {
                    0.0
                } else {
                    statistic.signum() * upper_z(p / 2.0)
                }
            }
        }
    }
}

impl std::fmt::Display for Alternative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Greater => write!(f, "greater"),
            Self::Less => write!(f, "less"),
            Self::TwoSided => write!(f, "two-sided"),
        }
    }
}

impl std::str::FromStr for Alternative {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "greater" => Ok(Self::Greater),
            "less" => Ok(Self::Less),
            "two-sided" | "two.sided" | "two_sided" => Ok(Self::TwoSided),
            _ => Err(format!(
                "unknown alternative '{s}' (expected greater, less, two-sided)"
            )),
        }
    }
}

/// Result of testing a single column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColumnResult {
    pub statistic: f64,
    pub p_value: f64,
    pub z_score: f64,
}

impl ColumnResult {
    /// A column that carries no evidence either way (empty group, constant
    /// predictor, degenerate table).
    pub fn uninformative() -> Self {
        Self {
            statistic: 0.0,
            p_value: 1.0,
            z_score: 0.0,
        }
    }

    fn new(statistic: f64, p_value: f64, alternative: Alternative) -> Self {
        Self {
            statistic,
            p_value,
            z_score: alternative.z_score(statistic, p_value),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// `-Φ⁻¹(p)`: the upper-tail normal quantile, finite for every `p` in `[0, 1]`.
fn upper_z(p: f64) -> f64 {
    let p = p.clamp(P_FLOOR, 1.0 - f64::EPSILON);
    -Normal::standard().inverse_cdf(p)
}

/// Student t p-value; `NaN` when the degrees of freedom are unusable.
fn student_p(statistic: f64, df: f64, alternative: Alternative) -> f64 {
    match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => alternative.p_value(statistic, &dist),
        Err(_) => f64::NAN,
    }
}

/// Split behavior by column value: `(spared, lesioned)`.
pub fn split_groups(column: &[f64], behavior: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let mut spared = Vec::new();
    let mut lesioned = Vec::new();
    for (&c, &b) in column.iter().zip(behavior) {
        if c != 0.0 {
            lesioned.push(b);
        } else {
            spared.push(b);
        }
    }
    (spared, lesioned)
}

/// Mean and unbiased variance. Variance is `0` for fewer than two values.
pub fn mean_var(values: &[f64]) -> (f64, f64) {
    let n = values.len();
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    if n < 2 {
        return (mean, 0.0);
    }
    let ss: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
    (mean, ss / (n - 1) as f64)
}

/// Ranks starting at 1, ties receive the average of their positions.
pub fn mid_ranks(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    let mut ranks = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = rank;
        }
        i = j + 1;
    }
    ranks
}

/// Pearson correlation; `0` when either input is constant.
pub fn pearson(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len().min(y.len());
    if n < 2 {
        return 0.0;
    }
    let mx = x[..n].iter().sum::<f64>() / n as f64;
    let my = y[..n].iter().sum::<f64>() / n as f64;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for i in 0..n {
        let dx = x[i] - mx;
        let dy = y[i] - my;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx <= 0.0 || syy <= 0.0 {
        return 0.0;
    }
    sxy / (sxx * syy).sqrt()
}

/// P-value of a Pearson correlation `r` over `n` pairs.
pub fn correlation_p(r: f64, n: usize, alternative: Alternative) -> f64 {
    if n < 3 {
        return 1.0;
    }
    let df = (n - 2) as f64;
    let r = r.clamp(-1.0, 1.0);
    let denom = (1.0 - r * r).max(STD_ERROR_FLOOR * STD_ERROR_FLOOR);
    let t = r * (df / denom).sqrt();
    student_p(t, df, alternative)
}

/// Count permuted statistics at least as extreme as the observed one and
/// turn the count into a p-value that is never zero.
fn permutation_p(exceed: usize, n_perm: usize) -> f64 {
    (exceed as f64 + 1.0) / (n_perm as f64 + 1.0)
}

// ═══════════════════════════════════════════════════════════════════════════════
// 1. TWO-GROUP TESTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Two-sample t-test of lesioned vs spared behavior.
///
/// `equal_variance` selects Student's pooled-variance test; otherwise Welch's
/// test with Satterthwaite degrees of freedom.
pub fn t_test(
    column: &[f64],
    behavior: &[f64],
    equal_variance: bool,
    alternative: Alternative,
) -> ColumnResult {
    let (spared, lesioned) = split_groups(column, behavior);
    let n0 = spared.len();
    let n1 = lesioned.len();
    let min_group = if equal_variance { 1 } else { 2 };
    if n0 < min_group || n1 < min_group || n0 + n1 < 3 {
        return ColumnResult::uninformative();
    }
    let (m0, v0) = mean_var(&spared);
    let (m1, v1) = mean_var(&lesioned);
    let (n0f, n1f) = (n0 as f64, n1 as f64);

    let (se, df) = if equal_variance {
        let pooled = ((n0f - 1.0) * v0 + (n1f - 1.0) * v1) / (n0f + n1f - 2.0);
        ((pooled * (1.0 / n0f + 1.0 / n1f)).sqrt(), n0f + n1f - 2.0)
    } else {
        let a = v0 / n0f;
        let b = v1 / n1f;
        let se2 = a + b;
        let df = if se2 > 0.0 {
            se2 * se2 / (a * a / (n0f - 1.0) + b * b / (n1f - 1.0))
        } else {
            n0f + n1f - 2.0
        };
        (se2.sqrt(), df)
    };

    let diff = m1 - m0;
    if diff == 0.0 {
        return ColumnResult::uninformative();
    }
    let t = diff / se.max(STD_ERROR_FLOOR);
    ColumnResult::new(t, student_p(t, df, alternative), alternative)
}

/// Brunner–Munzel statistic and degrees of freedom for one grouping.
///
/// `ranks` are the mid-ranks of `behavior` over all subjects.
fn brunner_munzel_core(behavior: &[f64], ranks: &[f64], lesioned: &[bool]) -> Option<(f64, f64)> {
    let mut values0 = Vec::new();
    let mut values1 = Vec::new();
    let mut ranks0 = Vec::new();
    let mut ranks1 = Vec::new();
    for i in 0..behavior.len() {
        if lesioned[i] {
            values1.push(behavior[i]);
            ranks1.push(ranks[i]);
        } else {
            values0.push(behavior[i]);
            ranks0.push(ranks[i]);
        }
    }
    let n0 = values0.len();
    let n1 = values1.len();
    if n0 < 2 || n1 < 2 {
        return None;
    }
    let (n0f, n1f) = (n0 as f64, n1 as f64);
    let within0 = mid_ranks(&values0);
    let within1 = mid_ranks(&values1);
    let m0 = ranks0.iter().sum::<f64>() / n0f;
    let m1 = ranks1.iter().sum::<f64>() / n1f;

    let spread = |combined: &[f64], within: &[f64], mean: f64, n: f64| -> f64 {
        combined
            .iter()
            .zip(within)
            .map(|(r, w)| {
                let d = r - w - mean + (n + 1.0) / 2.0;
                d * d
            })
            .sum::<f64>()
            / (n - 1.0)
    };
    let v0 = spread(&ranks0, &within0, m0, n0f);
    let v1 = spread(&ranks1, &within1, m1, n1f);

    let a = n0f * v0;
    let b = n1f * v1;
    let total = n0f + n1f;
    if m1 == m0 {
        return Some((0.0, total - 2.0));
    }
    let denom = a + b;
    if denom <= 0.0 {
        let w = n0f * n1f * (m1 - m0) / (total * STD_ERROR_FLOOR);
        return Some((w, total - 2.0));
    }
    let w = n0f * n1f * (m1 - m0) / (total * denom.sqrt());
    let df = denom * denom / (a * a / (n0f - 1.0) + b * b / (n1f - 1.0));
    Some((w, df))
}

/// Brunner–Munzel rank test with the asymptotic t approximation.
pub fn brunner_munzel(column: &[f64], behavior: &[f64], alternative: Alternative) -> ColumnResult {
    let ranks = mid_ranks(behavior);
    let lesioned: Vec<bool> = column.iter().map(|&c| c != 0.0).collect();
    match brunner_munzel_core(behavior, &ranks, &lesioned) {
        Some((w, _)) if w == 0.0 => ColumnResult::uninformative(),
        Some((w, df)) => ColumnResult::new(w, student_p(w, df, alternative), alternative),
        None => ColumnResult::uninformative(),
    }
}

/// Brunner–Munzel test whose p-value comes from `n_perm` relabelings of
/// lesioned/spared subjects.
pub fn brunner_munzel_permuted<R: Rng + ?Sized>(
    column: &[f64],
    behavior: &[f64],
    alternative: Alternative,
    n_perm: usize,
    rng: &mut R,
) -> ColumnResult {
    let ranks = mid_ranks(behavior);
    let mut lesioned: Vec<bool> = column.iter().map(|&c| c != 0.0).collect();
    let observed = match brunner_munzel_core(behavior, &ranks, &lesioned) {
        Some((w, _)) if w != 0.0 => w,
        _ => return ColumnResult::uninformative(),
    };
    let target = alternative.orient(observed);
    let mut exceed = 0;
    for _ in 0..n_perm {
        lesioned.shuffle(rng);
        if let Some((w, _)) = brunner_munzel_core(behavior, &ranks, &lesioned)
            && alternative.orient(w) >= target - 1e-12
        {
            exceed += 1;
        }
    }
    ColumnResult::new(observed, permutation_p(exceed, n_perm), alternative)
}

/// Smaller of the two group sizes for a column.
pub fn smaller_group(column: &[f64]) -> usize {
    let lesioned = column.iter().filter(|&&c| c != 0.0).count();
    lesioned.min(column.len() - lesioned)
}

// ═══════════════════════════════════════════════════════════════════════════════
// 2. REGRESSION
// ═══════════════════════════════════════════════════════════════════════════════

/// Fitted values and residuals of `y ~ 1 + covariates`.
#[derive(Debug, Clone)]
pub struct Residualized {
    pub fitted: Vec<f64>,
    pub residuals: Vec<f64>,
}

/// Regress `y` on an intercept plus the columns of `covariates` (N×k) and
/// split it into fitted values and residuals.
pub fn residualize(y: &[f64], covariates: &DMatrix<f64>) -> Residualized {
    let n = y.len();
    let k = covariates.ncols();
    let design = DMatrix::from_fn(n, k + 1, |r, c| if c == 0 { 1.0 } else { covariates[(r, c - 1)] });
    let target = DVector::from_column_slice(y);
    let svd = design.clone().svd(true, true);
    let fitted: Vec<f64> = match svd.solve(&target, 1e-12) {
        Ok(beta) => (&design * beta).iter().copied().collect(),
        // solve only fails when U or V were not computed
        Err(_) => {
            let mean = y.iter().sum::<f64>() / n.max(1) as f64;
            vec![mean; n]
        }
    };
    let residuals = y.iter().zip(&fitted).map(|(v, f)| v - f).collect();
    Residualized { fitted, residuals }
}

/// Ordinary least squares t value of `column` in `behavior ~ 1 + column (+ covariates)`.
pub fn regression(
    column: &[f64],
    behavior: &[f64],
    covariates: Option<&DMatrix<f64>>,
    alternative: Alternative,
) -> ColumnResult {
    match regression_t(column, behavior, covariates) {
        Some((t, df)) if t != 0.0 => {
            ColumnResult::new(t, student_p(t, df, alternative), alternative)
        }
        _ => ColumnResult::uninformative(),
    }
}

fn regression_t(
    column: &[f64],
    behavior: &[f64],
    covariates: Option<&DMatrix<f64>>,
) -> Option<(f64, f64)> {
    let n = behavior.len();
    let (_, var_x) = mean_var(column);
    if var_x <= 0.0 {
        return None;
    }
    let extra = covariates.map_or(0, |c| c.ncols());
    let k = 2 + extra;
    if n <= k {
        return None;
    }
    let design = DMatrix::from_fn(n, k, |r, c| match c {
        0 => 1.0,
        1 => column[r],
        _ => covariates.map_or(0.0, |cov| cov[(r, c - 2)]),
    });
    let y = DVector::from_column_slice(behavior);
    let xtx_inv = (design.transpose() * &design).try_inverse()?;
    let beta = &xtx_inv * design.transpose() * &y;
    let residuals = &y - &design * &beta;
    let df = (n - k) as f64;
    let sigma2 = residuals.norm_squared() / df;
    let se = (sigma2 * xtx_inv[(1, 1)]).sqrt();
    if !se.is_finite() {
        return None;
    }
    Some((beta[1] / se.max(STD_ERROR_FLOOR), df))
}

/// Regression test whose p-value is estimated by permuting behavior.
///
/// Covariates are regressed out of both the column and the behavior; the
/// residualized behavior is permuted and the residualized model is refit
/// `n_perm` times. The reported statistic is the full-model t value.
pub fn regression_permuted<R: Rng + ?Sized>(
    column: &[f64],
    behavior: &[f64],
    covariates: Option<&DMatrix<f64>>,
    alternative: Alternative,
    n_perm: usize,
    rng: &mut R,
) -> ColumnResult {
    let Some((full_t, _)) = regression_t(column, behavior, covariates) else {
        return ColumnResult::uninformative();
    };
    let (rx, mut ry) = match covariates {
        Some(c) => (residualize(column, c).residuals, residualize(behavior, c).residuals),
        None => (column.to_vec(), behavior.to_vec()),
    };
    let Some((observed, _)) = regression_t(&rx, &ry, None) else {
        return ColumnResult::uninformative();
    };
    let target = alternative.orient(observed);
    let mut exceed = 0;
    for _ in 0..n_perm {
        ry.shuffle(rng);
        if let Some((t, _)) = regression_t(&rx, &ry, None)
            && alternative.orient(t) >= target - 1e-12
        {
            exceed += 1;
        }
    }
    ColumnResult::new(full_t, permutation_p(exceed, n_perm), alternative)
}

// ═══════════════════════════════════════════════════════════════════════════════
// 3. CONTINGENCY TESTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Map a two-valued behavior vector onto classes `0` (smaller value) and
/// `1` (larger value). `None` unless exactly two distinct values occur.
pub fn binary_classes(behavior: &[f64]) -> Option<Vec<u8>> {
    let mut distinct: Vec<f64> = Vec::with_capacity(2);
    for &b in behavior {
        if !b.is_finite() {
            return None;
        }
        if !distinct.contains(&b) {
            if distinct.len() == 2 {
                return None;
            }
            distinct.push(b);
        }
    }
    if distinct.len() != 2 {
        return None;
    }
    let high = distinct[0].max(distinct[1]);
    Some(behavior.iter().map(|&b| u8::from(b == high)).collect())
}

/// Signed Pearson chi-square for the 2×2 table lesioned/spared × class.
fn chi_square_core(lesioned: &[bool], classes: &[u8], yates: bool) -> Option<f64> {
    // [lesioned][class]
    let mut table = [[0.0f64; 2]; 2];
    for (&l, &c) in lesioned.iter().zip(classes) {
        table[usize::from(l)][usize::from(c)] += 1.0;
    }
    let n: f64 = table.iter().flatten().sum();
    let rows = [table[0][0] + table[0][1], table[1][0] + table[1][1]];
    let cols = [table[0][0] + table[1][0], table[0][1] + table[1][1]];
    if rows.iter().chain(cols.iter()).any(|&m| m == 0.0) {
        return None;
    }
    let expected_11 = rows[1] * cols[1] / n;
    let correction = if yates {
        (table[1][1] - expected_11).abs().min(0.5)
    } else {
        0.0
    };
    let mut chi2 = 0.0;
    for (r, row) in table.iter().enumerate() {
        for (c, &observed) in row.iter().enumerate() {
            let expected = rows[r] * cols[c] / n;
            let d = (observed - expected).abs() - correction;
            chi2 += d * d / expected;
        }
    }
    let sign = if table[1][1] >= expected_11 { 1.0 } else { -1.0 };
    Some(sign * chi2)
}

fn chi_square_p(chi2: f64) -> f64 {
    match ChiSquared::new(1.0) {
        Ok(dist) => dist.sf(chi2.abs()),
        Err(_) => f64::NAN,
    }
}

/// Chi-square test of independence between lesion status and a binary
/// behavior class, with optional continuity correction.
///
/// The statistic is positive when lesioned subjects fall in class `1` more
/// often than expected. The p-value is two-sided.
pub fn chi_square(column: &[f64], classes: &[u8], yates: bool) -> ColumnResult {
    let lesioned: Vec<bool> = column.iter().map(|&c| c != 0.0).collect();
    match chi_square_core(&lesioned, classes, yates) {
        Some(chi2) if chi2 != 0.0 => {
            ColumnResult::new(chi2, chi_square_p(chi2), Alternative::TwoSided)
        }
        _ => ColumnResult::uninformative(),
    }
}

/// Chi-square test with a p-value from `n_perm` shuffles of the classes.
pub fn chi_square_permuted<R: Rng + ?Sized>(
    column: &[f64],
    classes: &[u8],
    yates: bool,
    n_perm: usize,
    rng: &mut R,
) -> ColumnResult {
    let lesioned: Vec<bool> = column.iter().map(|&c| c != 0.0).collect();
    let observed = match chi_square_core(&lesioned, classes, yates) {
        Some(chi2) if chi2 != 0.0 => chi2,
        _ => return ColumnResult::uninformative(),
    };
    let mut shuffled = classes.to_vec();
    let mut exceed = 0;
    for _ in 0..n_perm {
        shuffled.shuffle(rng);
        if let Some(chi2) = chi_square_core(&lesioned, &shuffled, yates)
            && chi2.abs() >= observed.abs() - 1e-12
        {
            exceed += 1;
        }
    }
    ColumnResult::new(observed, permutation_p(exceed, n_perm), Alternative::TwoSided)
}
