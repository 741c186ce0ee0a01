//! Statistical test dispatch.
//!
//! Every mapping method implements the [`StatisticalTest`] trait, which
//! provides metadata via [`MethodInfo`] and maps a lesion matrix plus a
//! behavior vector to one [`TestResult`]. The closed set of methods is the
//! [`Method`] enum; [`Method::build`] turns a configuration into a boxed test.

use nalgebra::DMatrix;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use lesymap_stats::{
    Alternative, BM_PERMUTATION_MIN_GROUP, ColumnResult, binary_classes, brunner_munzel,
    brunner_munzel_permuted, chi_square, chi_square_permuted, regression, regression_permuted,
    smaller_group, t_test,
};

use crate::config::MappingConfig;
use crate::matrix::LesionMatrix;
use crate::sccan::SccanTest;

/// Metadata about a mapping method.
#[derive(Debug, Clone, Serialize)]
pub struct MethodInfo {
    /// Canonical name (e.g. `"BM"`).
    pub name: &'static str,
    /// One-line human-readable description.
    pub description: &'static str,
    /// Whether FWER and cluster permutation corrections apply.
    pub permutation_correction: bool,
    /// Whether behavior must take exactly two values.
    pub binary_behavior: bool,
    /// Whether covariates can be included in the model.
    pub covariates: bool,
    /// Whether per-column p-values and z-scores are produced.
    pub p_values: bool,
}

/// Per-column output of one test invocation, aligned with lesion-matrix
/// columns.
#[derive(Debug, Clone, PartialEq)]
pub struct TestResult {
    pub statistic: Vec<f64>,
    pub p_value: Option<Vec<f64>>,
    pub z_score: Option<Vec<f64>>,
}

impl TestResult {
    pub fn from_columns(columns: Vec<ColumnResult>) -> Self {
        let mut statistic = Vec::with_capacity(columns.len());
        let mut p_value = Vec::with_capacity(columns.len());
        let mut z_score = Vec::with_capacity(columns.len());
        for c in columns {
            statistic.push(c.statistic);
            p_value.push(c.p_value);
            z_score.push(c.z_score);
        }
        Self {
            statistic,
            p_value: Some(p_value),
            z_score: Some(z_score),
        }
    }

    /// A map with statistics only (multivariate methods).
    pub fn statistic_only(statistic: Vec<f64>) -> Self {
        Self {
            statistic,
            p_value: None,
            z_score: None,
        }
    }

    pub fn len(&self) -> usize {
        self.statistic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statistic.is_empty()
    }
}

/// Randomness and mode for one test invocation.
pub struct TestContext {
    rng: StdRng,
    resampling: bool,
}

impl TestContext {
    /// Context for the observed data.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            resampling: false,
        }
    }

    /// Context for a null resample; per-column permutation p-values are
    /// skipped in favor of asymptotic ones.
    pub fn resampling(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            resampling: true,
        }
    }

    pub fn is_resampling(&self) -> bool {
        self.resampling
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

/// Trait that every mapping method implements.
pub trait StatisticalTest: Send + Sync {
    /// Method metadata.
    fn info(&self) -> &MethodInfo;

    /// Direction in which statistics are ranked for peak thresholds.
    fn orientation(&self) -> Alternative;

    /// Test every column of `lesions` against `behavior`.
    fn run(&self, lesions: &LesionMatrix, behavior: &[f64], ctx: &mut TestContext) -> TestResult;

    /// Convenience: name from info.
    fn name(&self) -> &'static str {
        self.info().name
    }
}

// ---------------------------------------------------------------------------
// Method registry
// ---------------------------------------------------------------------------

/// The closed set of mapping methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Method {
    /// Brunner–Munzel rank test.
    #[default]
    RankSum,
    /// Student t-test with pooled variance.
    TTest,
    /// Welch t-test.
    Welch,
    /// Linear regression with asymptotic p-values.
    Regression,
    /// Linear regression with per-column permutation p-values.
    RegressionPermutation,
    /// Chi-square test for binary behavior.
    ChiSquare,
    /// Sparse canonical correlation.
    Sccan,
}

const RANK_SUM_INFO: MethodInfo = MethodInfo {
    name: "BM",
    description: "Brunner-Munzel rank test, permutation p-values for small groups",
    permutation_correction: true,
    binary_behavior: false,
    covariates: false,
    p_values: true,
};

const TTEST_INFO: MethodInfo = MethodInfo {
    name: "ttest",
    description: "two-sample t-test with pooled variance",
    permutation_correction: true,
    binary_behavior: false,
    covariates: false,
    p_values: true,
};

const WELCH_INFO: MethodInfo = MethodInfo {
    name: "welch",
    description: "two-sample t-test with unequal variances (Welch)",
    permutation_correction: true,
    binary_behavior: false,
    covariates: false,
    p_values: true,
};

const REGRESSION_INFO: MethodInfo = MethodInfo {
    name: "regres",
    description: "linear regression of behavior on voxel value (+ covariates)",
    permutation_correction: true,
    binary_behavior: false,
    covariates: true,
    p_values: true,
};

const REGRESSION_PERM_INFO: MethodInfo = MethodInfo {
    name: "regresPerm",
    description: "linear regression with Freedman-Lane permutation p-values per voxel",
    permutation_correction: true,
    binary_behavior: false,
    covariates: true,
    p_values: true,
};

const CHISQ_INFO: MethodInfo = MethodInfo {
    name: "chisq",
    description: "chi-square test of lesion status vs binary behavior",
    permutation_correction: true,
    binary_behavior: true,
    covariates: false,
    p_values: true,
};

pub(crate) const SCCAN_INFO: MethodInfo = MethodInfo {
    name: "sccan",
    description: "sparse canonical correlation over all voxels jointly",
    permutation_correction: false,
    binary_behavior: false,
    covariates: false,
    p_values: false,
};

impl Method {
    pub const ALL: [Method; 7] = [
        Method::RankSum,
        Method::TTest,
        Method::Welch,
        Method::Regression,
        Method::RegressionPermutation,
        Method::ChiSquare,
        Method::Sccan,
    ];

    pub fn info(self) -> &'static MethodInfo {
        match self {
            Self::RankSum => &RANK_SUM_INFO,
            Self::TTest => &TTEST_INFO,
            Self::Welch => &WELCH_INFO,
            Self::Regression => &REGRESSION_INFO,
            Self::RegressionPermutation => &REGRESSION_PERM_INFO,
            Self::ChiSquare => &CHISQ_INFO,
            Self::Sccan => &SCCAN_INFO,
        }
    }

    /// Instantiate the test described by `config`, carrying `covariates`
    /// (N×k) for methods that model them.
    pub fn build(
        self,
        config: &MappingConfig,
        covariates: Option<DMatrix<f64>>,
    ) -> Box<dyn StatisticalTest> {
        match self {
            Self::RankSum => Box::new(RankSumTest {
                alternative: config.alternative,
                permutations: config.bm_permutations,
            }),
            Self::TTest | Self::Welch => Box::new(TwoSampleTTest {
                alternative: config.alternative,
                equal_variance: config
                    .equal_variance
                    .unwrap_or(self == Self::TTest),
                info: if self == Self::TTest { &TTEST_INFO } else { &WELCH_INFO },
            }),
            Self::Regression => Box::new(RegressionTest {
                alternative: config.alternative,
                covariates,
                permutations: None,
            }),
            Self::RegressionPermutation => Box::new(RegressionTest {
                alternative: config.alternative,
                covariates,
                permutations: Some(config.regression_permutations),
            }),
            Self::ChiSquare => Box::new(ChiSquareTest {
                yates: config.chisq_yates,
                permutations: config.chisq_permutations,
            }),
            Self::Sccan => Box::new(SccanTest::new(config.sccan.clone())),
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.info().name)
    }
}

impl std::str::FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BM" | "BMfast" | "brunnermunzel" => Ok(Self::RankSum),
            "ttest" => Ok(Self::TTest),
            "welch" => Ok(Self::Welch),
            "regres" | "regresfast" => Ok(Self::Regression),
            "regresPerm" => Ok(Self::RegressionPermutation),
            "chisq" => Ok(Self::ChiSquare),
            "sccan" => Ok(Self::Sccan),
            _ => Err(format!(
                "unknown method '{s}' (expected one of: BM, ttest, welch, regres, regresPerm, chisq, sccan)"
            )),
        }
    }
}

impl TryFrom<String> for Method {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Method> for String {
    fn from(value: Method) -> Self {
        value.to_string()
    }
}

// ---------------------------------------------------------------------------
// Variants
// ---------------------------------------------------------------------------

/// Brunner–Munzel test; columns whose smaller group has fewer than
/// [`BM_PERMUTATION_MIN_GROUP`] subjects get permutation p-values.
pub struct RankSumTest {
    pub alternative: Alternative,
    pub permutations: usize,
}

impl StatisticalTest for RankSumTest {
    fn info(&self) -> &MethodInfo {
        &RANK_SUM_INFO
    }

    fn orientation(&self) -> Alternative {
        self.alternative
    }

    /// Small-group columns get permutation p-values only on the observed
    /// run; resampled runs (permutation nulls) use the asymptotic p-value.
    fn run(&self, lesions: &LesionMatrix, behavior: &[f64], ctx: &mut TestContext) -> TestResult {
        let mut permuted_columns = 0usize;
        let columns = lesions
            .columns()
            .map(|column| {
                if !ctx.is_resampling() && smaller_group(column) < BM_PERMUTATION_MIN_GROUP {
                    permuted_columns += 1;
                    brunner_munzel_permuted(
                        column,
                        behavior,
                        self.alternative,
                        self.permutations,
                        ctx.rng(),
                    )
                } else {
                    brunner_munzel(column, behavior, self.alternative)
                }
            })
            .collect();
        if permuted_columns > 0 {
            log::debug!(
                "BM: {permuted_columns} column(s) below {BM_PERMUTATION_MIN_GROUP} subjects per group used permutation p-values"
            );
        }
        TestResult::from_columns(columns)
    }
}

/// Student or Welch two-sample t-test.
pub struct TwoSampleTTest {
    pub alternative: Alternative,
    pub equal_variance: bool,
    info: &'static MethodInfo,
}

impl TwoSampleTTest {
    pub fn new(alternative: Alternative, equal_variance: bool) -> Self {
        Self {
            alternative,
            equal_variance,
            info: if equal_variance { &TTEST_INFO } else { &WELCH_INFO },
        }
    }
}

impl StatisticalTest for TwoSampleTTest {
    fn info(&self) -> &MethodInfo {
        self.info
    }

    fn orientation(&self) -> Alternative {
        self.alternative
    }

    fn run(&self, lesions: &LesionMatrix, behavior: &[f64], _ctx: &mut TestContext) -> TestResult {
        TestResult::from_columns(
            lesions
                .columns()
                .map(|c| t_test(c, behavior, self.equal_variance, self.alternative))
                .collect(),
        )
    }
}

/// Linear regression of behavior on each column, optionally with covariates
/// and per-column permutation p-values.
pub struct RegressionTest {
    pub alternative: Alternative,
    pub covariates: Option<DMatrix<f64>>,
    pub permutations: Option<usize>,
}

impl StatisticalTest for RegressionTest {
    fn info(&self) -> &MethodInfo {
        if self.permutations.is_some() {
            &REGRESSION_PERM_INFO
        } else {
            &REGRESSION_INFO
        }
    }

    fn orientation(&self) -> Alternative {
        self.alternative
    }

    fn run(&self, lesions: &LesionMatrix, behavior: &[f64], ctx: &mut TestContext) -> TestResult {
        let covariates = self.covariates.as_ref();
        let columns = lesions
            .columns()
            .map(|column| match self.permutations {
                Some(n_perm) if !ctx.is_resampling() => regression_permuted(
                    column,
                    behavior,
                    covariates,
                    self.alternative,
                    n_perm,
                    ctx.rng(),
                ),
                _ => regression(column, behavior, covariates, self.alternative),
            })
            .collect();
        TestResult::from_columns(columns)
    }
}

/// Chi-square test for a two-valued behavior.
pub struct ChiSquareTest {
    pub yates: bool,
    pub permutations: Option<usize>,
}

impl StatisticalTest for ChiSquareTest {
    fn info(&self) -> &MethodInfo {
        &CHISQ_INFO
    }

    fn orientation(&self) -> Alternative {
        Alternative::TwoSided
    }

    fn run(&self, lesions: &LesionMatrix, behavior: &[f64], ctx: &mut TestContext) -> TestResult {
        // Callers validate binary behavior up front; a shuffled binary vector
        // stays binary.
        let Some(classes) = binary_classes(behavior) else {
            let n = lesions.n_columns();
            return TestResult {
                statistic: vec![f64::NAN; n],
                p_value: Some(vec![f64::NAN; n]),
                z_score: Some(vec![f64::NAN; n]),
            };
        };
        let columns = lesions
            .columns()
            .map(|column| match self.permutations {
                Some(n_perm) if !ctx.is_resampling() => {
                    chi_square_permuted(column, &classes, self.yates, n_perm, ctx.rng())
                }
                _ => chi_square(column, &classes, self.yates),
            })
            .collect();
        TestResult::from_columns(columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_group_matrix() -> (LesionMatrix, Vec<f64>) {
        // 20 subjects, first 10 lesioned in every column
        let column: Vec<f64> = (0..20).map(|i| if i < 10 { 1.0 } else { 0.0 }).collect();
        let lesions = LesionMatrix::from_columns(20, &vec![column; 3]).unwrap();
        let behavior: Vec<f64> = (0..20)
            .map(|i| if i < 10 { 5.0 + (i % 3) as f64 } else { 1.0 + (i % 4) as f64 })
            .collect();
        (lesions, behavior)
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!("BMfast".parse::<Method>(), Ok(Method::RankSum));
        assert_eq!("regresfast".parse::<Method>(), Ok(Method::Regression));
        assert_eq!("regresPerm".parse::<Method>(), Ok(Method::RegressionPermutation));
        assert!("svr".parse::<Method>().is_err());
        for m in Method::ALL {
            assert_eq!(m.to_string().parse::<Method>(), Ok(m));
        }
    }

    #[test]
    fn test_info_flags() {
        assert!(Method::ChiSquare.info().binary_behavior);
        assert!(!Method::Sccan.info().permutation_correction);
        assert!(Method::Regression.info().covariates);
        assert!(!Method::TTest.info().covariates);
    }

    #[test]
    fn test_build_dispatches_by_name() {
        let config = MappingConfig::default();
        for m in Method::ALL {
            let test = m.build(&config, None);
            assert_eq!(test.name(), m.info().name);
        }
    }

    #[test]
    fn test_ttest_variant_runs_every_column() {
        let (lesions, behavior) = two_group_matrix();
        let test = TwoSampleTTest::new(Alternative::Greater, true);
        let result = test.run(&lesions, &behavior, &mut TestContext::new(1));
        assert_eq!(result.len(), 3);
        assert!(result.statistic.iter().all(|&t| t > 5.0));
        assert!(result.p_value.unwrap().iter().all(|&p| p < 1e-4));
    }

    #[test]
    fn test_rank_sum_large_groups_skip_permutation() {
        let (lesions, behavior) = two_group_matrix();
        let test = RankSumTest {
            alternative: Alternative::Greater,
            permutations: 100,
        };
        let a = test.run(&lesions, &behavior, &mut TestContext::new(1));
        let b = test.run(&lesions, &behavior, &mut TestContext::new(2));
        // groups of 10 use the asymptotic p-value, independent of the seed
        assert_eq!(a, b);
    }

    #[test]
    fn test_rank_sum_small_groups_use_permutation() {
        let column: Vec<f64> = (0..12).map(|i| if i < 4 { 1.0 } else { 0.0 }).collect();
        let lesions = LesionMatrix::from_columns(12, &[column]).unwrap();
        let behavior: Vec<f64> = (0..12).map(|i| i as f64).collect();
        let test = RankSumTest {
            alternative: Alternative::Less,
            permutations: 999,
        };
        let observed = test.run(&lesions, &behavior, &mut TestContext::new(4));
        let p = observed.p_value.unwrap()[0];
        // permutation p-values live on the 1/(B+1) grid
        let scaled = p * 1000.0;
        assert!((scaled - scaled.round()).abs() < 1e-9);
        let resampled = test.run(&lesions, &behavior, &mut TestContext::resampling(4));
        assert_ne!(resampled.p_value.as_ref().unwrap()[0], p);
        // permutation nulls see the asymptotic p-value
        let asymptotic = brunner_munzel(lesions.column(0), &behavior, Alternative::Less);
        assert_eq!(resampled.p_value.unwrap()[0], asymptotic.p_value);
        assert_eq!(resampled.statistic[0], observed.statistic[0]);
    }

    #[test]
    fn test_chisq_variant() {
        let (lesions, _) = two_group_matrix();
        let behavior: Vec<f64> = (0..20).map(|i| if i < 9 { 1.0 } else { 0.0 }).collect();
        let test = ChiSquareTest {
            yates: true,
            permutations: None,
        };
        let result = test.run(&lesions, &behavior, &mut TestContext::new(0));
        assert!(result.statistic.iter().all(|&s| s > 10.0));
        assert_eq!(test.orientation(), Alternative::TwoSided);
    }
}
