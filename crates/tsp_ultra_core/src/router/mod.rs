//! Instance fingerprinting and the routing table that turns a fingerprint into
//! a [`SolverConfig`].

pub(crate) mod fingerprint;

use std::fmt::Write as _;

use crate::{
    algo::kernel::lin_kernighan::{DEFAULT_LK_DEPTH, LkVariant},
    options::{AlphaMode, DecomposeMode, SolverOptions, StitchMode},
    router::fingerprint::InstanceFingerprint,
};

/// Named cut-offs used by the router and the phases it configures.
#[derive(Clone, Debug, PartialEq)]
pub struct RoutingThresholds {
    pub cv_clustered: f64,
    pub cv_uniform: f64,
    pub cv_structured: f64,
    pub modularity_clustered: f64,
    pub modularity_uniform: f64,
    pub aspect_structured: f64,
    pub small_n: usize,
    pub clustered_small_n: usize,
    pub large_n: usize,
    pub seq_lk_min_budget_s: f64,
    pub seq_lk_min_n: usize,
    /// Eigenvalue ratio above which the decomposer quadrisects.
    pub gap_threshold: f64,
    pub stress_high: f64,
    pub stress_mid: f64,
    pub stitch_ratio_high: f64,
    pub stitch_ratio_low: f64,
}

impl Default for RoutingThresholds {
    fn default() -> Self {
        Self {
            cv_clustered: 0.8,
            cv_uniform: 0.4,
            cv_structured: 0.3,
            modularity_clustered: 0.4,
            modularity_uniform: 0.2,
            aspect_structured: 1.5,
            small_n: 2_000,
            clustered_small_n: 5_000,
            large_n: 30_000,
            seq_lk_min_budget_s: 180.0,
            seq_lk_min_n: 5_000,
            gap_threshold: 1.5,
            stress_high: 3.0,
            stress_mid: 2.0,
            stitch_ratio_high: 0.15,
            stitch_ratio_low: 0.05,
        }
    }
}

impl RoutingThresholds {
    /// Defaults with the command-line overridable cut-offs taken from `options`.
    pub fn from_options(options: &SolverOptions) -> Self {
        Self {
            cv_clustered: options.cv_clustered,
            cv_uniform: options.cv_uniform,
            gap_threshold: options.gap_threshold,
            stress_high: options.stress_high,
            stress_mid: options.stress_mid,
            stitch_ratio_high: options.stitch_ratio_high,
            stitch_ratio_low: options.stitch_ratio_low,
            ..Self::default()
        }
    }
}

const LEAF_FRACTION: f64 = 0.50;
const VCYCLE_FRACTION: f64 = 0.65;
const POLISH_FRACTION: f64 = 0.35;
const NO_DECOMPOSE_POLISH_FRACTION: f64 = 0.95;
const LARGE_POLISH_FRACTION: f64 = 0.55;
const SPATIAL_LEAF_SIZE: usize = 1_500;
const SPECTRAL_LEAF_MIN: usize = 1_000;
const SPECTRAL_LEAF_MAX: usize = 1_500;

/// Everything the later phases need to know, fixed once per solve.
#[derive(Clone, Debug)]
pub struct SolverConfig {
    pub decompose: bool,
    pub spectral: bool,
    pub max_leaf_size: usize,
    pub leaf_fraction: f64,
    pub vcycle_fraction: f64,
    pub polish_fraction: f64,
    pub lk_variant: LkVariant,
    pub alpha: AlphaMode,
    pub alpha_iters: usize,
    pub stitch: StitchMode,
    pub strategy: String,
    pub thresholds: RoutingThresholds,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            decompose: true,
            spectral: false,
            max_leaf_size: SPATIAL_LEAF_SIZE,
            leaf_fraction: LEAF_FRACTION,
            vcycle_fraction: VCYCLE_FRACTION,
            polish_fraction: POLISH_FRACTION,
            lk_variant: LkVariant::DontLook,
            alpha: AlphaMode::Off,
            alpha_iters: 50,
            stitch: StitchMode::V2,
            strategy: "default".to_owned(),
            thresholds: RoutingThresholds::default(),
        }
    }
}

impl SolverConfig {
    /// One-line description of the routing decision.
    pub fn explain(&self, fp: &InstanceFingerprint) -> String {
        let mut out = format!(
            "strategy={} | {} | decompose=",
            self.strategy,
            fp.summary(&self.thresholds)
        );
        if self.decompose {
            let method = if self.spectral { "spectral" } else { "spatial" };
            let _ = write!(out, "on({method}, leaf={})", self.max_leaf_size);
        } else {
            out.push_str("off");
        }
        let lk_depth = match self.lk_variant {
            LkVariant::Sequential { depth } => depth,
            LkVariant::DontLook => 0,
        };
        let _ = write!(
            out,
            " | alpha={} | lk={}(depth={lk_depth}) | stitch={} | budget leaf={:.0}% vcycle={:.0}% polish={:.0}%",
            self.alpha,
            self.lk_variant.label(),
            self.stitch,
            self.leaf_fraction * 100.0,
            self.vcycle_fraction * 100.0,
            self.polish_fraction * 100.0
        );
        out
    }
}

pub struct StrategyRouter;

impl StrategyRouter {
    /// Applies the routing table to `fp`, then the user's overrides.
    pub fn route(fp: &InstanceFingerprint, options: &SolverOptions) -> SolverConfig {
        let th = RoutingThresholds::from_options(options);
        let n = fp.n;
        let mut config = SolverConfig {
            alpha: options.alpha,
            alpha_iters: options.alpha_iters,
            stitch: options.stitch,
            ..SolverConfig::default()
        };

        if n < th.small_n {
            config.skip_decomposition("no-decompose-small");
        } else if fp.is_structured(&th) {
            config.skip_decomposition("no-decompose-structured");
        } else if fp.is_clustered(&th) && n < th.clustered_small_n {
            config.skip_decomposition("no-decompose-med-clustered");
        } else if fp.is_clustered(&th) {
            config.spectral = true;
            config.max_leaf_size = (n / 4).clamp(SPECTRAL_LEAF_MIN, SPECTRAL_LEAF_MAX);
            config.strategy = "decompose-clustered-spectral".to_owned();
        } else {
            config.strategy = "default-decompose".to_owned();
        }

        if options.time_budget >= th.seq_lk_min_budget_s && n > th.seq_lk_min_n {
            config.lk_variant = LkVariant::Sequential {
                depth: DEFAULT_LK_DEPTH,
            };
        }
        if n > th.large_n {
            config.polish_fraction = config.polish_fraction.max(LARGE_POLISH_FRACTION);
            config.strategy.push_str("+eax-dominant");
        }

        match options.decompose {
            DecomposeMode::Auto => {}
            DecomposeMode::Off => {
                if config.decompose {
                    config.skip_decomposition("forced-off");
                }
            }
            DecomposeMode::Spatial | DecomposeMode::Spectral => {
                if !config.decompose {
                    config.decompose = true;
                    config.polish_fraction = POLISH_FRACTION;
                    config.leaf_fraction = LEAF_FRACTION;
                    config.vcycle_fraction = VCYCLE_FRACTION;
                }
                config.spectral = options.decompose == DecomposeMode::Spectral;
                config.strategy = format!("forced-{}", options.decompose);
            }
        }
        config.max_leaf_size = config.max_leaf_size.min(options.max_leaf_size).max(2);
        config.thresholds = th;

        log::debug!(
            "router: decided n={n} strategy={} decompose={} spectral={} leaf={} lk={}",
            config.strategy,
            config.decompose,
            config.spectral,
            config.max_leaf_size,
            config.lk_variant.label()
        );
        config
    }
}

impl SolverConfig {
    fn skip_decomposition(&mut self, strategy: &str) {
        self.decompose = false;
        self.spectral = false;
        self.polish_fraction = NO_DECOMPOSE_POLISH_FRACTION;
        self.vcycle_fraction = 0.0;
        self.leaf_fraction = 0.0;
        self.strategy = strategy.to_owned();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint(n: usize, cv: f64, modularity: f64, aspect: f64) -> InstanceFingerprint {
        InstanceFingerprint {
            n,
            cv_nn_dist: cv,
            spectral_gap: 0.5,
            modularity,
            aspect_ratio: aspect,
            density_cv: 0.2,
            mean_nn_dist: 1.0,
            alpha_edge_ratio: 0.0,
        }
    }

    #[test]
    fn small_instances_skip_decomposition() {
        let config = StrategyRouter::route(&fingerprint(500, 0.5, 0.2, 1.0), &SolverOptions::default());
        assert!(!config.decompose);
        assert_eq!(config.strategy, "no-decompose-small");
        assert_eq!(config.polish_fraction, NO_DECOMPOSE_POLISH_FRACTION);
        assert_eq!(config.vcycle_fraction, 0.0);
    }

    #[test]
    fn structured_and_medium_clustered_skip_decomposition() {
        let options = SolverOptions::default();
        let structured = StrategyRouter::route(&fingerprint(10_000, 0.1, 0.0, 8.0), &options);
        assert_eq!(structured.strategy, "no-decompose-structured");

        let clustered = StrategyRouter::route(&fingerprint(3_000, 1.2, 0.9, 1.0), &options);
        assert_eq!(clustered.strategy, "no-decompose-med-clustered");
        assert!(!clustered.decompose);
    }

    #[test]
    fn large_clustered_goes_spectral() {
        let config = StrategyRouter::route(&fingerprint(5_200, 1.2, 0.9, 1.0), &SolverOptions::default());
        assert!(config.decompose);
        assert!(config.spectral);
        assert_eq!(config.max_leaf_size, 1_300);
        assert_eq!(config.strategy, "decompose-clustered-spectral");
    }

    #[test]
    fn uniform_goes_spatial_and_large_n_shifts_to_polish() {
        let options = SolverOptions::default();
        let config = StrategyRouter::route(&fingerprint(10_000, 0.5, 0.2, 1.0), &options);
        assert!(config.decompose && !config.spectral);
        assert_eq!(config.strategy, "default-decompose");
        assert_eq!(config.lk_variant, LkVariant::DontLook);

        let large = StrategyRouter::route(&fingerprint(40_000, 0.5, 0.2, 1.0), &options);
        assert_eq!(large.strategy, "default-decompose+eax-dominant");
        assert_eq!(large.polish_fraction, LARGE_POLISH_FRACTION);
    }

    #[test]
    fn generous_budget_enables_sequential_lk() {
        let options = SolverOptions {
            time_budget: 300.0,
            ..SolverOptions::default()
        };
        let config = StrategyRouter::route(&fingerprint(10_000, 0.5, 0.2, 1.0), &options);
        assert_eq!(config.lk_variant, LkVariant::Sequential { depth: DEFAULT_LK_DEPTH });
    }

    #[test]
    fn overrides_win_over_the_table() {
        let forced_on = SolverOptions {
            decompose: DecomposeMode::Spatial,
            max_leaf_size: 10,
            ..SolverOptions::default()
        };
        let config = StrategyRouter::route(&fingerprint(50, 0.5, 0.2, 1.0), &forced_on);
        assert!(config.decompose && !config.spectral);
        assert_eq!(config.max_leaf_size, 10);
        assert_eq!(config.strategy, "forced-spatial");
        assert!(config.leaf_fraction > 0.0);

        let forced_off = SolverOptions {
            decompose: DecomposeMode::Off,
            ..SolverOptions::default()
        };
        let config = StrategyRouter::route(&fingerprint(10_000, 0.5, 0.2, 1.0), &forced_off);
        assert!(!config.decompose);
        assert_eq!(config.strategy, "forced-off");
    }

    #[test]
    fn thresholds_follow_options() {
        let options = SolverOptions {
            cv_clustered: 0.95,
            stress_high: 5.0,
            ..SolverOptions::default()
        };
        let th = RoutingThresholds::from_options(&options);
        assert_eq!(th.cv_clustered, 0.95);
        assert_eq!(th.stress_high, 5.0);
        assert_eq!(th.small_n, 2_000);
    }

    #[test]
    fn explain_mentions_every_decision() {
        let fp = fingerprint(10_000, 0.5, 0.2, 1.0);
        let config = StrategyRouter::route(&fp, &SolverOptions::default());
        let text = config.explain(&fp);
        assert!(text.starts_with("strategy=default-decompose | n=10000"));
        assert!(text.contains("decompose=on(spatial, leaf=1500)"));
        assert!(text.contains("lk=dlb"));
        assert!(text.contains("polish=35%"));
    }
}
