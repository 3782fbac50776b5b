use std::{process::ExitCode, time::Instant};

use log::{error, info};

use tsp_ultra_core::{Error, Result, SolverOptions, logging, read_points, solve, write_tour};

fn main() -> ExitCode {
    let options = match SolverOptions::from_args() {
        Ok(options) => options,
        Err(err) => {
            // Usage text and option errors go straight to stderr.
            eprintln!("{err}");
            return ExitCode::from(2);
        }
    };
    if let Err(err) = logging::init_logger(&options) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    match run(&options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("solve failed: {err}");
            match err {
                Error::InvalidInput(_) | Error::InvalidData(_) => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

fn run(options: &SolverOptions) -> Result<()> {
    let now = Instant::now();
    info!("options: {options}");

    let points = read_points(options.input_path())?;
    info!("input: n={}", points.len());

    let report = solve(&points, options)?;
    write_tour(options.output_path(), &report.tour)?;

    info!("diagnostics: {}", report.diagnostics);
    info!(
        "output: n={} length={:.3} strategy={} solve_s={:.2} time={:.2}s",
        report.tour.len(),
        report.length,
        report.strategy,
        report.total_secs,
        now.elapsed().as_secs_f32()
    );

    Ok(())
}
