// main.rs — Command-line front end.
//
// Builds the Mandelbulb grid, renders it once and optionally writes the
// results to disk. Exit codes:
//
//   0  pipeline reached Done
//   1  pipeline Failed (stage and error kind are logged)
//   2  no device matched the selector
//   3  bad configuration or an output file could not be written

use std::process::ExitCode;

use voxmarch::backend::Backend;
use voxmarch::config::{self, BackendKind, Command, RunConfig};
use voxmarch::emu::{EmuBackend, EmuPlatform};
use voxmarch::gpu::{DeviceProfile, GpuError, WgpuBackend};
use voxmarch::output;
use voxmarch::pipeline::{PipelineController, PipelineOutput, State};

const EXIT_FAILED: u8 = 1;
const EXIT_NO_DEVICE: u8 = 2;
const EXIT_CONFIG: u8 = 3;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = match config::parse_args(std::env::args().skip(1)) {
        Ok(Command::Run(cfg)) => cfg,
        Ok(Command::Help) => {
            println!("{}", config::USAGE);
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            log::error!("{e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match cfg.backend {
        BackendKind::Emu => match EmuBackend::open(EmuPlatform::default(), cfg.selector(), cfg.emu_options()) {
            Ok(backend) => run(backend, &cfg),
            Err(e) => {
                log::error!("{e}");
                ExitCode::from(EXIT_NO_DEVICE)
            }
        },
        BackendKind::Wgpu => match WgpuBackend::open(cfg.selector(), DeviceProfile::Native) {
            Ok(backend) => run(backend, &cfg),
            Err(e @ GpuError::NoDevice(_)) => {
                log::error!("{e}");
                ExitCode::from(EXIT_NO_DEVICE)
            }
            Err(e) => {
                log::error!("{e}");
                ExitCode::from(EXIT_FAILED)
            }
        },
    }
}

fn run<B: Backend>(backend: B, cfg: &RunConfig) -> ExitCode {
    let spec = match cfg.pipeline_spec() {
        Ok(spec) => spec,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let mut controller = PipelineController::new(backend, spec).with_sync(cfg.drain);
    let out = match controller.run() {
        Ok(out) => out,
        Err(e) => {
            if let Some(logs) = e.diagnostics() {
                for log in logs {
                    eprintln!("--- build log for {} ---\n{}", log.device, log.text);
                }
            }
            return ExitCode::from(EXIT_FAILED);
        }
    };
    debug_assert_eq!(controller.state(), State::Done);

    for (state, t) in &out.report.timings {
        log::info!("{state:<14} {:>9.3} ms", t.as_secs_f64() * 1e3);
    }
    let covered = out.image.data().iter().filter(|b| **b != 0).count();
    log::info!(
        "{} pixels, {covered} hit the bulb; total {:.3} ms",
        out.image.len(),
        out.report.total().as_secs_f64() * 1e3
    );

    match save(&out, cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

fn save(out: &PipelineOutput, cfg: &RunConfig) -> std::io::Result<()> {
    if let (Some(path), Some(voxels)) = (&cfg.save_voxels, &out.voxels) {
        output::save_voxels(path, voxels)?;
        log::info!("wrote {}", path.display());
    }
    if let Some(path) = &cfg.save_image {
        output::save_pgm(path, &out.image)?;
        log::info!("wrote {}", path.display());
    }
    if let Some(path) = &cfg.save_debug {
        output::save_debug(path, &out.debug)?;
        log::info!("wrote {}", path.display());
    }
    Ok(())
}
