//! CLI for lesymap: which lesioned voxels explain a behavioral deficit?

mod commands;
mod study;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use lesymap_core::{
    Alternative, Connectivity, CorrectionMethod, LesionSizeCorrection, Method, MinSubjects,
};

#[derive(Parser)]
#[command(name = "lesymap")]
#[command(about = "lesymap: voxelwise lesion-to-symptom mapping")]
#[command(version = lesymap_core::VERSION)]
struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Map a study: test every analyzed voxel and write a JSON report.
    /// Ctrl+C stops permutations early and keeps the partial null.
    Map {
        /// Study file (geometry, subject lesions, behavior, covariates)
        study: PathBuf,

        /// JSON config file; flags below override its fields
        #[arg(long)]
        config: Option<PathBuf>,

        /// Write the report here instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Method: BM, ttest, welch, regres, regresPerm, chisq, sccan
        #[arg(long)]
        method: Option<Method>,

        /// Correction: none, bonferroni, holm, hochberg, BH, BY, FWERperm, clusterPerm
        #[arg(long)]
        correction: Option<CorrectionMethod>,

        /// Significance level
        #[arg(long)]
        p_threshold: Option<f64>,

        /// Permutations for FWERperm and clusterPerm
        #[arg(long)]
        permutations: Option<usize>,

        /// Alternative hypothesis: greater, less, two-sided
        #[arg(long)]
        alternative: Option<Alternative>,

        /// Minimum lesioned subjects per voxel (e.g. "5" or "10%")
        #[arg(long)]
        min_subjects: Option<MinSubjects>,

        /// Lesion size correction: none, voxel, behavior, both
        #[arg(long)]
        lesion_size: Option<LesionSizeCorrection>,

        /// Cluster connectivity: faces (6), edges (18), vertices (26)
        #[arg(long)]
        connectivity: Option<Connectivity>,

        /// Random seed for reproducible permutations
        #[arg(long)]
        seed: Option<u64>,

        /// Permutation worker threads (default: all cores)
        #[arg(long)]
        threads: Option<usize>,

        /// Stop permutations after this long (e.g. "90s", "10m")
        #[arg(long)]
        deadline: Option<String>,

        /// Test every voxel separately instead of merging identical patterns
        #[arg(long)]
        no_patching: bool,
    },

    /// List mapping methods and what each supports
    Methods {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Derive the analysis mask of a study without mapping
    Mask {
        /// Study file
        study: PathBuf,

        /// Minimum lesioned subjects per voxel (e.g. "5" or "10%")
        #[arg(long, default_value = "10%")]
        min_subjects: MinSubjects,

        /// Write the mask report here instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Map {
            study,
            config,
            output,
            method,
            correction,
            p_threshold,
            permutations,
            alternative,
            min_subjects,
            lesion_size,
            connectivity,
            seed,
            threads,
            deadline,
            no_patching,
        } => commands::map::run(&commands::map::MapArgs {
            study,
            config,
            output,
            method,
            correction,
            p_threshold,
            permutations,
            alternative,
            min_subjects,
            lesion_size,
            connectivity,
            seed,
            threads,
            deadline,
            no_patching,
        }),
        Commands::Methods { json } => commands::methods::run(json),
        Commands::Mask {
            study,
            min_subjects,
            output,
        } => commands::mask::run(&study, min_subjects, output.as_deref()),
    }
}
