use std::{env, path::Path};

use log::LevelFilter;
use tsp_ultra_derive::{CliOptions, CliValue, KvDisplay};

use crate::{Error, Result};

const ERR_INVALID_TIME_BUDGET: &str = "time_budget must be a finite value >= 0";
const ERR_INVALID_KNN_K: &str = "knn_k must be > 0";
const ERR_INVALID_MAX_LEAF_SIZE: &str = "max_leaf_size must be >= 2";
const ERR_INVALID_THRESHOLD: &str = "routing thresholds must be finite and > 0";
const ERR_INVALID_STRESS_ORDER: &str = "stress_mid must not exceed stress_high";
const ERR_INVALID_CV_ORDER: &str = "cv_uniform must not exceed cv_clustered";
const ERR_INVALID_STITCH_RATIO_ORDER: &str =
    "stitch_ratio_low must not exceed stitch_ratio_high";

pub(crate) const DEFAULT_MAX_LEAF_SIZE: usize = 1_500;

/// Runtime options for the ultra-scale solver.
#[derive(Clone, Debug, CliOptions, KvDisplay)]
pub struct SolverOptions {
    /// Total wall-clock budget in seconds.
    #[cli(long = "time-budget")]
    pub time_budget: f64,
    /// Base neighbour-list size.
    #[cli(long = "knn-k")]
    pub knn_k: usize,
    /// Maximum number of points per decomposition leaf.
    #[cli(long = "max-leaf-size")]
    pub max_leaf_size: usize,
    /// Leaf worker pool size. 0 picks `min(cpus, 12)`.
    #[cli(long = "workers")]
    pub workers: usize,
    /// Rebuild the neighbour list with a larger k before polishing.
    #[cli(long = "rebuild-knn", flag)]
    pub rebuild_knn: bool,
    /// Decomposition override: `auto`, `off`, `spatial` or `spectral`.
    #[cli(long = "decompose", parse_with = "DecomposeMode::parse")]
    pub decompose: DecomposeMode,
    /// Leaf stitching strategy.
    #[cli(long = "stitch", parse_with = "StitchMode::parse")]
    pub stitch: StitchMode,
    /// Alpha-nearness candidate handling.
    #[cli(long = "alpha", parse_with = "AlphaMode::parse")]
    pub alpha: AlphaMode,
    /// Subgradient iterations for alpha-nearness.
    #[cli(long = "alpha-iters")]
    pub alpha_iters: usize,
    /// Fingerprint accuracy: `fast` estimates modularity, `exact` runs label propagation.
    #[cli(long = "fingerprint", parse_with = "FingerprintMode::parse")]
    pub fingerprint: FingerprintMode,
    /// Base seed for every randomised step.
    #[cli(long = "seed")]
    pub seed: u64,
    /// 1-NN coefficient of variation above which an instance counts as clustered.
    #[cli(long = "cv-clustered")]
    pub cv_clustered: f64,
    /// 1-NN coefficient of variation below which an instance counts as uniform.
    #[cli(long = "cv-uniform")]
    pub cv_uniform: f64,
    /// Eigenvalue ratio above which the decomposer quadrisects.
    #[cli(long = "gap-threshold")]
    pub gap_threshold: f64,
    /// Seam stress above which V-cycle windows widen the most.
    #[cli(long = "stress-high")]
    pub stress_high: f64,
    /// Seam stress above which V-cycle windows widen moderately.
    #[cli(long = "stress-mid")]
    pub stress_mid: f64,
    /// Stitch ratio above which the V-cycle gets more budget.
    #[cli(long = "stitch-ratio-high")]
    pub stitch_ratio_high: f64,
    /// Stitch ratio below which the V-cycle gets less budget.
    #[cli(long = "stitch-ratio-low")]
    pub stitch_ratio_low: f64,
    /// Structured logging level.
    #[cli(long = "log-level", parse_with = "LogLevel::parse")]
    pub log_level: LogLevel,
    /// Logging output format.
    #[cli(long = "log-format", parse_with = "LogFormat::parse")]
    pub log_format: LogFormat,
    /// Include timestamps in log lines.
    #[cli(long = "log-timestamp", flag)]
    pub log_timestamp: bool,
    /// Optional output file path for logs. Empty means stderr.
    #[cli(long = "log-output", value_name = "path")]
    pub log_output: String,
    /// Optional input file path for points. Empty means stdin.
    #[cli(long = "input", value_name = "path")]
    pub input: String,
    /// Optional output file path for the tour. Empty means stdout.
    #[cli(long = "output", value_name = "path")]
    pub output: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, CliValue)]
#[cli_value(option = "log-level")]
pub enum LogLevel {
    Error,
    #[cli(alias = "warning")]
    Warn,
    Info,
    Debug,
    Trace,
    Off,
}

impl LogLevel {
    pub fn to_filter(self) -> LevelFilter {
        match self {
            Self::Error => LevelFilter::Error,
            Self::Warn => LevelFilter::Warn,
            Self::Info => LevelFilter::Info,
            Self::Debug => LevelFilter::Debug,
            Self::Trace => LevelFilter::Trace,
            Self::Off => LevelFilter::Off,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, CliValue)]
#[cli_value(option = "log-format")]
pub enum LogFormat {
    Compact,
    Pretty,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, CliValue)]
#[cli_value(option = "decompose")]
pub enum DecomposeMode {
    Auto,
    #[cli(alias = "none")]
    Off,
    Spatial,
    Spectral,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, CliValue)]
#[cli_value(option = "stitch")]
pub enum StitchMode {
    V1,
    V2,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, CliValue)]
#[cli_value(option = "alpha")]
pub enum AlphaMode {
    Off,
    Rerank,
    Augment,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, CliValue)]
#[cli_value(option = "fingerprint")]
pub enum FingerprintMode {
    Fast,
    Exact,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            time_budget: 60.0,
            knn_k: 10,
            max_leaf_size: DEFAULT_MAX_LEAF_SIZE,
            workers: 0,
            rebuild_knn: true,
            decompose: DecomposeMode::Auto,
            stitch: StitchMode::V2,
            alpha: AlphaMode::Off,
            alpha_iters: 50,
            fingerprint: FingerprintMode::Fast,
            seed: 42,
            cv_clustered: 0.8,
            cv_uniform: 0.4,
            gap_threshold: 1.5,
            stress_high: 3.0,
            stress_mid: 2.0,
            stitch_ratio_high: 0.15,
            stitch_ratio_low: 0.05,
            log_level: LogLevel::Warn,
            log_format: LogFormat::Compact,
            log_timestamp: true,
            log_output: String::new(),
            input: String::new(),
            output: String::new(),
        }
    }
}

impl SolverOptions {
    pub fn from_args() -> Result<Self> {
        let options = Self::parse_from_iter(env::args().skip(1))?;
        options.validate()?;
        Ok(options)
    }

    fn parse_from_iter<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut options = Self::default();
        let mut args = args
            .into_iter()
            .map(|arg| arg.as_ref().to_owned())
            .peekable();

        while let Some(arg) = args.next() {
            if arg == "--help" || arg == "-h" {
                return Err(Error::invalid_input(Self::usage()));
            }

            let Some(raw_name) = arg.strip_prefix("--") else {
                return Err(Error::invalid_input(format!(
                    "Unexpected argument: {arg}\n\n{}",
                    Self::usage()
                )));
            };

            if raw_name.is_empty() {
                return Err(Error::invalid_input(format!(
                    "Invalid option name: {arg}\n\n{}",
                    Self::usage()
                )));
            }

            let (name, value) = Self::split_arg(raw_name, &mut args);

            if !options.apply_cli_option(&name, value)? {
                return Err(Error::invalid_input(format!(
                    "Unknown option: --{name}\n\n{}",
                    Self::usage()
                )));
            }
        }

        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.time_budget.is_finite() || self.time_budget < 0.0 {
            return Err(Error::invalid_input(ERR_INVALID_TIME_BUDGET));
        }
        if self.knn_k == 0 {
            return Err(Error::invalid_input(ERR_INVALID_KNN_K));
        }
        if self.max_leaf_size < 2 {
            return Err(Error::invalid_input(ERR_INVALID_MAX_LEAF_SIZE));
        }
        let thresholds = [
            self.cv_clustered,
            self.cv_uniform,
            self.gap_threshold,
            self.stress_high,
            self.stress_mid,
            self.stitch_ratio_high,
            self.stitch_ratio_low,
        ];
        if thresholds.iter().any(|t| !t.is_finite() || *t <= 0.0) {
            return Err(Error::invalid_input(ERR_INVALID_THRESHOLD));
        }
        if self.cv_uniform > self.cv_clustered {
            return Err(Error::invalid_input(ERR_INVALID_CV_ORDER));
        }
        if self.stress_mid > self.stress_high {
            return Err(Error::invalid_input(ERR_INVALID_STRESS_ORDER));
        }
        if self.stitch_ratio_low > self.stitch_ratio_high {
            return Err(Error::invalid_input(ERR_INVALID_STITCH_RATIO_ORDER));
        }
        Ok(())
    }

    pub fn usage() -> String {
        format!(
            concat!(
                "Usage:\n",
                "  tsp-ultra [options] [--input points.txt]\n",
                "  tsp-ultra [options] < points.txt\n\n",
                "Options:\n",
                "{}",
                "  --help\n\n",
                "Examples:\n",
                "  tsp-ultra --time-budget 120 --log-level info < points.txt\n",
                "  tsp-ultra --input points.txt --output tour.txt\n",
                "  tsp-ultra --decompose=spectral --max-leaf-size=1000 < points.txt\n",
                "  tsp-ultra --alpha=augment --knn-k=12 --log-format=pretty < points.txt\n",
            ),
            Self::cli_option_usage()
        )
    }

    pub fn log_output_path(&self) -> Option<&Path> {
        non_stdio_path(&self.log_output)
    }

    pub fn output_path(&self) -> Option<&Path> {
        non_stdio_path(&self.output)
    }

    pub fn input_path(&self) -> Option<&Path> {
        non_stdio_path(&self.input)
    }
}

fn non_stdio_path(raw: &str) -> Option<&Path> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "-" {
        None
    } else {
        Some(Path::new(raw))
    }
}

#[cfg(test)]
mod tests {
    use log::LevelFilter;

    use super::*;

    #[test]
    fn parse_bool_accepts_common_values() {
        assert!(SolverOptions::parse_cli_bool("x", "true").expect("parse"));
        assert!(SolverOptions::parse_cli_bool("x", "ON").expect("parse"));
        assert!(!SolverOptions::parse_cli_bool("x", "0").expect("parse"));
        assert!(!SolverOptions::parse_cli_bool("x", "no").expect("parse"));
    }

    #[test]
    fn parse_bool_rejects_unknown_values() {
        let err = SolverOptions::parse_cli_bool("rebuild-knn", "maybe")
            .expect_err("invalid bool should fail");
        assert!(
            err.to_string()
                .contains("Invalid boolean for --rebuild-knn: maybe")
        );
    }

    #[test]
    fn log_level_maps_to_expected_filter() {
        assert_eq!(LogLevel::Error.to_filter(), LevelFilter::Error);
        assert_eq!(LogLevel::Warn.to_filter(), LevelFilter::Warn);
        assert_eq!(LogLevel::Trace.to_filter(), LevelFilter::Trace);
        assert_eq!(LogLevel::Off.to_filter(), LevelFilter::Off);
    }

    #[test]
    fn parse_from_iter_applies_known_cli_options() {
        let options = SolverOptions::parse_from_iter([
            "--time-budget=12.5",
            "--knn-k",
            "14",
            "--max-leaf-size=800",
            "--workers=3",
            "--no-rebuild-knn",
            "--decompose=spectral",
            "--stitch=v1",
            "--alpha=augment",
            "--alpha-iters=20",
            "--fingerprint=exact",
            "--seed=7",
            "--cv-clustered=0.9",
            "--gap-threshold=1.7",
            "--stress-high=4.0",
            "--stitch-ratio-low=0.02",
            "--log-level=debug",
            "--log-format=pretty",
            "--log-timestamp=false",
            "--log-output=run.log",
            "--input=points.txt",
            "--output=tour.txt",
        ])
        .expect("parse options");

        assert_eq!(options.time_budget, 12.5);
        assert_eq!(options.knn_k, 14);
        assert_eq!(options.max_leaf_size, 800);
        assert_eq!(options.workers, 3);
        assert!(!options.rebuild_knn);
        assert_eq!(options.decompose, DecomposeMode::Spectral);
        assert_eq!(options.stitch, StitchMode::V1);
        assert_eq!(options.alpha, AlphaMode::Augment);
        assert_eq!(options.alpha_iters, 20);
        assert_eq!(options.fingerprint, FingerprintMode::Exact);
        assert_eq!(options.seed, 7);
        assert_eq!(options.cv_clustered, 0.9);
        assert_eq!(options.gap_threshold, 1.7);
        assert_eq!(options.stress_high, 4.0);
        assert_eq!(options.stitch_ratio_low, 0.02);
        assert_eq!(options.log_level, LogLevel::Debug);
        assert_eq!(options.log_format, LogFormat::Pretty);
        assert!(!options.log_timestamp);
        assert_eq!(options.log_output, "run.log");
        assert_eq!(options.input, "points.txt");
        assert_eq!(options.output, "tour.txt");
    }

    #[test]
    fn decompose_mode_accepts_alias() {
        assert_eq!(
            DecomposeMode::parse("none").expect("alias parses"),
            DecomposeMode::Off
        );
        assert_eq!(DecomposeMode::Spatial.to_string(), "spatial");
    }

    #[test]
    fn parse_from_iter_rejects_flag_with_value() {
        let err = SolverOptions::parse_from_iter(["--no-rebuild-knn=true"])
            .expect_err("expected flag value rejection");
        assert!(err.to_string().contains("does not take a value"));
    }

    #[test]
    fn parse_from_iter_rejects_unknown_option() {
        let err = SolverOptions::parse_from_iter(["--unknown-opt=1"])
            .expect_err("expected unknown option error");
        assert!(err.to_string().contains("Unknown option: --unknown-opt"));
    }

    #[test]
    fn parse_from_iter_rejects_positional_argument() {
        let err =
            SolverOptions::parse_from_iter(["points.txt"]).expect_err("expected positional error");
        assert!(err.to_string().contains("Unexpected argument: points.txt"));
    }

    #[test]
    fn parse_from_iter_requires_value_for_knn_k() {
        let err =
            SolverOptions::parse_from_iter(["--knn-k"]).expect_err("missing value should fail");
        assert!(err.to_string().contains("Missing value for --knn-k"));
    }

    #[test]
    fn usage_lists_flags_and_enum_choices() {
        let usage = SolverOptions::usage();
        assert!(usage.contains("  --time-budget <f64>\n"));
        assert!(usage.contains("  --no-rebuild-knn\n"));
        assert!(usage.contains("  --decompose <auto|off|spatial|spectral>\n"));
        assert!(usage.contains("  --stitch <v1|v2>\n"));
        assert!(usage.contains("  --output <path>\n"));
    }

    #[test]
    fn bare_flag_sets_true() {
        let options = SolverOptions::parse_from_iter(["--log-timestamp", "--seed", "3"])
            .expect("parse flags");
        assert!(options.log_timestamp);
        assert_eq!(options.seed, 3);
    }

    #[test]
    fn enum_values_parse_through_from_str() {
        let mode: StitchMode = "V1".parse().expect("case-insensitive parse");
        assert_eq!(mode, StitchMode::V1);
        let err = "v3".parse::<StitchMode>().expect_err("unknown mode");
        assert!(err.to_string().contains("expected v1|v2"));
    }

    #[test]
    fn parse_from_iter_help_returns_usage_error() {
        let err =
            SolverOptions::parse_from_iter(["--help"]).expect_err("help should short-circuit");
        assert!(err.to_string().contains("Usage:"));
    }

    #[test]
    fn defaults_validate() {
        SolverOptions::default()
            .validate()
            .expect("defaults should be valid");
    }

    #[test]
    fn validate_rejects_bad_values() {
        let options = SolverOptions {
            knn_k: 0,
            ..SolverOptions::default()
        };
        assert!(options.validate().is_err());

        let options = SolverOptions {
            time_budget: f64::NAN,
            ..SolverOptions::default()
        };
        assert!(options.validate().is_err());

        let options = SolverOptions {
            stress_mid: 5.0,
            ..SolverOptions::default()
        };
        let err = options.validate().expect_err("stress order should fail");
        assert!(err.to_string().contains("stress_mid"));

        let options = SolverOptions {
            cv_uniform: 0.9,
            ..SolverOptions::default()
        };
        let err = options.validate().expect_err("cv order should fail");
        assert!(err.to_string().contains("cv_uniform"));

        let options = SolverOptions {
            cv_uniform: 0.6,
            cv_clustered: 0.6,
            ..SolverOptions::default()
        };
        assert!(options.validate().is_ok());
    }

    #[test]
    fn io_paths_treat_empty_and_dash_as_stdio() {
        let options = SolverOptions::default();
        assert!(options.input_path().is_none());
        assert!(options.output_path().is_none());
        assert!(options.log_output_path().is_none());

        let options = SolverOptions {
            input: "-".to_string(),
            output: "out/tour.txt".to_string(),
            ..SolverOptions::default()
        };
        assert!(options.input_path().is_none());
        assert_eq!(
            options.output_path().expect("path should exist"),
            Path::new("out/tour.txt")
        );
    }
}
