//! Sparse canonical correlation between the lesion matrix and behavior.
//!
//! All columns are modelled jointly. A sparse weight vector `w` (at most
//! `ceil(sparseness * P)` non-zero entries) is grown by projected gradient
//! ascent on `corr(Xw, y)`. The sparseness is chosen by golden-section search
//! on the cross-validated predictive correlation, which also decides whether
//! the map is reported at all.

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use lesymap_stats::{Alternative, correlation_p, pearson};

use crate::matrix::LesionMatrix;
use crate::method::{MethodInfo, SCCAN_INFO, StatisticalTest, TestContext, TestResult};

const GOLDEN: f64 = 0.618_033_988_749_895;

/// Settings for sparse canonical correlation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SccanOptions {
    /// Fixed sparseness; `None` searches `[lower, upper]`.
    pub sparseness: Option<f64>,
    /// Run the cross-validation gate even with a fixed sparseness.
    pub validate_sparseness: bool,
    pub lower: f64,
    pub upper: f64,
    /// Width of the final search bracket.
    pub tolerance: f64,
    pub folds: usize,
    pub iterations: usize,
    /// Largest CV p-value for which a map is reported.
    pub p_threshold: f64,
    /// Keep negative weights instead of clamping to `[0, 1]`.
    pub signed_weights: bool,
}

impl Default for SccanOptions {
    fn default() -> Self {
        Self {
            sparseness: None,
            validate_sparseness: false,
            lower: 0.005,
            upper: 0.9,
            tolerance: 0.03,
            folds: 4,
            iterations: 20,
            p_threshold: 0.05,
            signed_weights: false,
        }
    }
}

/// Output of [`SccanTest::fit`].
#[derive(Debug, Clone, PartialEq)]
pub struct SccanFit {
    /// Final weights normalized by their largest magnitude.
    pub weights: Vec<f64>,
    pub sparseness: f64,
    pub cv_correlation: Option<f64>,
    pub cv_p_value: Option<f64>,
    /// Passed the CV gate (always true when the gate did not run).
    pub significant: bool,
}

/// Sparse canonical correlation as a mapping method.
pub struct SccanTest {
    options: SccanOptions,
}

impl SccanTest {
    pub fn new(options: SccanOptions) -> Self {
        Self { options }
    }

    /// Choose the sparseness, run the CV gate, and fit the final weights on
    /// all subjects.
    pub fn fit<R: Rng + ?Sized>(&self, lesions: &LesionMatrix, behavior: &[f64], rng: &mut R) -> SccanFit {
        let opts = &self.options;
        let n = lesions.n_subjects();
        let x = lesions.to_dmatrix();

        let n_folds = opts.folds.clamp(2, n.max(2));
        let fold_of = assign_folds(n, n_folds, rng);
        let cv = |s: f64, folds: &[usize]| {
            cv_correlation(&x, behavior, folds, n_folds, top_k(s, x.ncols()), opts.iterations)
        };

        let (sparseness, cv_r) = match opts.sparseness {
            Some(s) if opts.validate_sparseness => (s, Some(cv(s, &fold_of))),
            Some(s) => (s, None),
            None => {
                let (s, search_r) =
                    golden_section_max(|s| cv(s, &fold_of), opts.lower, opts.upper, opts.tolerance);
                // the search maximum is biased upward; gate on fresh folds
                let gate_folds = assign_folds(n, n_folds, rng);
                let r = cv(s, &gate_folds);
                log::info!(
                    "SCCAN sparseness search: {s:.3} (search CV correlation {search_r:.3}, held-out {r:.3})"
                );
                (s, Some(r))
            }
        };

        let cv_p = cv_r.map(|r| correlation_p(r, n, Alternative::Greater));
        let significant = cv_p.is_none_or(|p| p <= opts.p_threshold);
        if !significant {
            log::warn!(
                "SCCAN cross-validated correlation {:.3} is not significant (p = {:.4})",
                cv_r.unwrap_or(0.0),
                cv_p.unwrap_or(1.0)
            );
        }

        let (xs, ys) = standardize(&x, behavior);
        let raw = sparse_weights(&xs, &ys, top_k(sparseness, x.ncols()), opts.iterations);
        SccanFit {
            weights: normalize_weights(raw.as_slice(), opts.signed_weights),
            sparseness,
            cv_correlation: cv_r,
            cv_p_value: cv_p,
            significant,
        }
    }
}

impl StatisticalTest for SccanTest {
    fn info(&self) -> &MethodInfo {
        &SCCAN_INFO
    }

    fn orientation(&self) -> Alternative {
        Alternative::Greater
    }

    fn run(&self, lesions: &LesionMatrix, behavior: &[f64], ctx: &mut TestContext) -> TestResult {
        let fit = self.fit(lesions, behavior, ctx.rng());
        if fit.significant {
            TestResult::statistic_only(fit.weights)
        } else {
            TestResult::statistic_only(vec![0.0; lesions.n_columns()])
        }
    }
}

/// Random assignment of `n` subjects to `n_folds` balanced folds.
fn assign_folds<R: Rng + ?Sized>(n: usize, n_folds: usize, rng: &mut R) -> Vec<usize> {
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(rng);
    let mut fold_of = vec![0usize; n];
    for (pos, &subject) in order.iter().enumerate() {
        fold_of[subject] = pos % n_folds;
    }
    fold_of
}

/// Number of non-zero weights for a sparseness over `p` columns.
fn top_k(sparseness: f64, p: usize) -> usize {
    ((sparseness * p as f64).ceil() as usize).clamp(1, p.max(1))
}

/// Centre and scale the columns of `x` and `y`. Constant columns become zero.
fn standardize(x: &DMatrix<f64>, y: &[f64]) -> (DMatrix<f64>, DVector<f64>) {
    let scaler = Scaler::fit(x);
    let ys = scale_vector(y);
    (scaler.transform(x), ys)
}

fn scale_vector(y: &[f64]) -> DVector<f64> {
    let n = y.len().max(1) as f64;
    let mean = y.iter().sum::<f64>() / n;
    let sd = (y.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    DVector::from_iterator(
        y.len(),
        y.iter().map(|v| if sd > 0.0 { (v - mean) / sd } else { 0.0 }),
    )
}

/// Column means and standard deviations learnt on one set of rows.
struct Scaler {
    means: Vec<f64>,
    sds: Vec<f64>,
}

impl Scaler {
    fn fit(x: &DMatrix<f64>) -> Self {
        let n = x.nrows().max(1) as f64;
        let mut means = Vec::with_capacity(x.ncols());
        let mut sds = Vec::with_capacity(x.ncols());
        for column in x.column_iter() {
            let mean = column.sum() / n;
            let var = column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            means.push(mean);
            sds.push(var.sqrt());
        }
        Self { means, sds }
    }

    fn transform(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        DMatrix::from_fn(x.nrows(), x.ncols(), |r, c| {
            if self.sds[c] > 1e-12 {
                (x[(r, c)] - self.means[c]) / self.sds[c]
            } else {
                0.0
            }
        })
    }
}

/// Zero all but the `k` largest magnitudes. Ties keep the lower index.
fn keep_top_k(mut w: DVector<f64>, k: usize) -> DVector<f64> {
    if k >= w.len() {
        return w;
    }
    let mut order: Vec<usize> = (0..w.len()).collect();
    order.sort_by(|&a, &b| w[b].abs().total_cmp(&w[a].abs()).then(a.cmp(&b)));
    for &i in &order[k..] {
        w[i] = 0.0;
    }
    w
}

fn projection_correlation(x: &DMatrix<f64>, w: &DVector<f64>, y: &DVector<f64>) -> f64 {
    let u = x * w;
    let denom = u.norm() * y.norm();
    if denom > 0.0 { u.dot(y) / denom } else { 0.0 }
}

/// Sparse weights maximizing `corr(Xw, y)` for standardized `x` and `y`.
fn sparse_weights(x: &DMatrix<f64>, y: &DVector<f64>, k: usize, iterations: usize) -> DVector<f64> {
    let mut w = keep_top_k(x.tr_mul(y), k);
    if w.norm() == 0.0 {
        return w;
    }
    let mut best = projection_correlation(x, &w, y);
    let mut step = 1.0;

    for _ in 0..iterations {
        let u = x * &w;
        let a = u.dot(y);
        let b = u.norm_squared();
        if b <= 0.0 {
            break;
        }
        // gradient of corr(Xw, y) up to the constant 1 / |y|
        let gradient = x.tr_mul(&(y - &u * (a / b))) / b.sqrt();
        let g_norm = gradient.norm();
        if g_norm < 1e-12 {
            break;
        }
        let unit = &w / w.norm();
        let mut improved = false;
        while step > 1e-4 {
            let candidate = keep_top_k(&unit + &gradient * (step / g_norm), k);
            let score = projection_correlation(x, &candidate, y);
            if score > best + 1e-12 {
                w = candidate;
                best = score;
                improved = true;
                break;
            }
            step *= 0.5;
        }
        if !improved {
            break;
        }
    }
    w
}

/// Cross-validated correlation between held-out predictions and behavior.
fn cv_correlation(
    x: &DMatrix<f64>,
    y: &[f64],
    fold_of: &[usize],
    n_folds: usize,
    k: usize,
    iterations: usize,
) -> f64 {
    let mut predicted = vec![0.0; y.len()];
    for fold in 0..n_folds {
        let train: Vec<usize> = (0..y.len()).filter(|&i| fold_of[i] != fold).collect();
        let test: Vec<usize> = (0..y.len()).filter(|&i| fold_of[i] == fold).collect();
        if train.len() < 2 || test.is_empty() {
            continue;
        }
        let x_train = x.select_rows(&train);
        let y_train: Vec<f64> = train.iter().map(|&i| y[i]).collect();
        let scaler = Scaler::fit(&x_train);
        let xs_train = scaler.transform(&x_train);
        let w = sparse_weights(&xs_train, &scale_vector(&y_train), k, iterations);

        // y ~ a + b * (Xw) on the training rows
        let u_train = &xs_train * &w;
        let u_mean = u_train.mean();
        let y_mean = y_train.iter().sum::<f64>() / y_train.len() as f64;
        let mut sxy = 0.0;
        let mut sxx = 0.0;
        for (u, yv) in u_train.iter().zip(&y_train) {
            sxy += (u - u_mean) * (yv - y_mean);
            sxx += (u - u_mean).powi(2);
        }
        let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };

        let u_test = scaler.transform(&x.select_rows(&test)) * &w;
        for (&i, u) in test.iter().zip(u_test.iter()) {
            predicted[i] = y_mean + slope * (u - u_mean);
        }
    }
    pearson(&predicted, y)
}

/// Golden-section search for the maximum of `f` on `[lo, hi]`.
fn golden_section_max<F: Fn(f64) -> f64>(f: F, lo: f64, hi: f64, tolerance: f64) -> (f64, f64) {
    let (mut a, mut b) = (lo.min(hi), lo.max(hi));
    let mut c = b - GOLDEN * (b - a);
    let mut d = a + GOLDEN * (b - a);
    let mut fc = f(c);
    let mut fd = f(d);
    while (b - a) > tolerance {
        if fc >= fd {
            b = d;
            d = c;
            fd = fc;
            c = b - GOLDEN * (b - a);
            fc = f(c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + GOLDEN * (b - a);
            fd = f(d);
        }
    }
    if fc >= fd { (c, fc) } else { (d, fd) }
}

/// Scale by the largest magnitude. Unless `signed`, orient so most weight is
/// positive and clamp negatives to zero.
fn normalize_weights(w: &[f64], signed: bool) -> Vec<f64> {
    let max = w.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    if max == 0.0 {
        return vec![0.0; w.len()];
    }
    let mut out: Vec<f64> = w.iter().map(|v| v / max).collect();
    if !signed {
        let positive: f64 = out.iter().filter(|v| **v > 0.0).sum();
        let negative: f64 = -out.iter().filter(|v| **v < 0.0).sum::<f64>();
        if negative > positive {
            out.iter_mut().for_each(|v| *v = -*v);
        }
        out.iter_mut().for_each(|v| *v = v.max(0.0));
    }
    out
}
