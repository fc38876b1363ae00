// tests/test_pipeline.rs — End-to-end runs of the two-stage pipeline.
//
// These run with `cargo test --test test_pipeline`. The reference scene is
// a 128³ grid rendered at 320x240 on the emulated device; build with
// `--release` if it is slow on your machine.

use voxmarch::config::{self, Command};
use voxmarch::device::{DeviceKind, DeviceSelector};
use voxmarch::emu::{EmuBackend, EmuOptions, EmuPlatform};
use voxmarch::error::{AllocationError, StageError, Status};
use voxmarch::pipeline::{PipelineController, PipelineSpec, State};
use voxmarch::sources::Dialect;
use voxmarch::view::RenderConfig;

fn emu() -> EmuBackend {
    EmuBackend::open(EmuPlatform::default(), DeviceSelector::First, EmuOptions::default()).unwrap()
}

// ===== Reference scene =====

#[test]
fn reference_scene_overwrites_every_pixel() {
    let spec = PipelineSpec::new(Dialect::OpenCl, 128, 320, 240);
    assert_eq!(spec.view, RenderConfig::for_grid(128));
    let sentinel = spec.sentinel;

    let mut c = PipelineController::new(emu(), spec);
    let out = c.run().unwrap();
    assert_eq!(c.state(), State::Done);
    assert_eq!(
        c.history(),
        &[
            State::Idle,
            State::Building,
            State::VoxelDispatch,
            State::VoxelSync,
            State::RayDispatch,
            State::RaySync,
            State::MapResults,
            State::Done
        ]
    );

    assert_eq!(out.image.len(), 320 * 240);
    assert!(out.image.data().iter().all(|&b| b != sentinel));

    // The centre ray hits the bulb; the corner ray misses the grid.
    assert!(out.image.get(160, 120, 0).unwrap() > 0);
    assert!(out.debug.get(160, 120, 0).unwrap() > 0.0);
    assert_eq!(out.image.get(0, 0, 0), Some(0));
    assert_eq!(out.debug.get(0, 0, 0), Some(-1.0));

    assert_eq!(out.report.allocations, 4);
    assert_eq!(out.report.dispatches, 2);
    assert!(c.registry().is_empty());
    assert_eq!(c.backend().allocated_bytes(), 0);
}

// ===== Oversized grids =====

#[test]
fn voxel_count_overflow_fails_the_run() {
    let args = ["--voxels", "4194304", "--size", "8x8"];
    let Command::Run(cfg) = config::parse_args(args).unwrap() else {
        panic!("expected a run");
    };
    let mut c = PipelineController::new(emu(), cfg.pipeline_spec().unwrap());
    let err = c.run().unwrap_err();
    assert_eq!(err.stage, State::VoxelDispatch);
    assert!(matches!(err.source, StageError::Allocation(AllocationError::TooLarge { .. })), "{err}");
    assert_eq!(c.state(), State::Failed);
    assert_eq!(c.history(), &[State::Idle, State::Building, State::VoxelDispatch, State::Failed]);
    assert_eq!(c.allocations(), 0);
    assert_eq!(c.dispatches(), 0);
}

#[test]
fn grid_beyond_the_device_limit_fails_the_run() {
    let mut c = PipelineController::new(emu(), PipelineSpec::new(Dialect::OpenCl, 2048, 8, 8));
    let err = c.run().unwrap_err();
    assert_eq!(err.stage, State::VoxelDispatch);
    match err.source {
        StageError::Allocation(AllocationError::Device { status, bytes, .. }) => {
            assert_eq!(status, Status::InvalidBufferSize);
            assert_eq!(bytes, 2048u64.pow(3));
        }
        other => panic!("expected a device refusal, got {other:?}"),
    }
    assert_eq!(c.state(), State::Failed);
    assert!(c.registry().is_empty());
}

// ===== Devices =====

#[test]
fn no_device_is_reported_before_any_work() {
    let err = EmuBackend::open(EmuPlatform::empty(), DeviceSelector::First, EmuOptions::default()).unwrap_err();
    assert!(err.to_string().contains("no compute device"), "{err}");

    let err = EmuBackend::open(EmuPlatform::default(), DeviceSelector::Kind(DeviceKind::Accelerator), EmuOptions::default());
    assert!(err.is_err());
    assert!(EmuBackend::open(EmuPlatform::default(), DeviceSelector::Index(2), EmuOptions::default()).is_err());
}

#[test]
fn cpu_device_renders_the_same_image() {
    let spec = PipelineSpec::new(Dialect::OpenCl, 24, 40, 30);
    let gpu = PipelineController::new(emu(), spec.clone()).run().unwrap();

    let cpu_backend = EmuBackend::open(EmuPlatform::default(), DeviceSelector::Kind(DeviceKind::Cpu), EmuOptions::default()).unwrap();
    let mut c = PipelineController::new(cpu_backend, spec);
    let cpu = c.run().unwrap();
    assert!(cpu.report.device.contains("CPU"));
    assert_eq!(gpu.image, cpu.image);
    assert_eq!(gpu.debug, cpu.debug);
}

// ===== Configuration =====

#[test]
fn command_line_drives_a_run() {
    let args = ["--voxels", "16", "--size", "24x16", "--seed", "7", "--rotate", "0,5,0", "--save-voxels", "/dev/null"];
    let Command::Run(cfg) = config::parse_args(args).unwrap() else {
        panic!("expected a run");
    };
    let spec = cfg.pipeline_spec().unwrap();
    assert_eq!((spec.voxel_size, spec.image_width, spec.image_height), (16, 24, 16));
    assert!(spec.read_voxels);
    assert_ne!(spec.view, RenderConfig::for_grid(16));

    let backend = EmuBackend::open(EmuPlatform::default(), cfg.selector(), cfg.emu_options()).unwrap();
    let mut c = PipelineController::new(backend, spec).with_sync(cfg.drain);
    let out = c.run().unwrap();
    let voxels = out.voxels.expect("voxels were requested");
    assert_eq!(voxels.len(), 16 * 16 * 16);
    // Centre voxel is inside the bulb.
    assert_eq!(voxels.get(8, 8, 8), Some(255));
    assert_eq!(out.report.maps, 3);
}

#[test]
fn report_serialises_to_json() {
    let mut c = PipelineController::new(emu(), PipelineSpec::new(Dialect::OpenCl, 8, 8, 8));
    let out = c.run().unwrap();
    let json = serde_json::to_value(&out.report).unwrap();
    assert_eq!(json["backend"], "emu");
    assert_eq!(json["dispatches"], 2);
    assert_eq!(json["timings"].as_array().map(Vec::len), Some(6));
    assert_eq!(json["timings"][0][0], "Building");
}
