// pipeline.rs — The two-stage pipeline controller.
//
// STATE MACHINE
// ─────────────
//
//   Idle → Building → VoxelDispatch → VoxelSync → RayDispatch → RaySync
//        → MapResults → Done
//
// Any state from Building on may drop to Failed. Both Done and Failed are
// terminal: a second `run` is refused. There is no retry.
//
//   Building       compile generator + marcher units into one program
//   VoxelDispatch  allocate the voxel grid, enqueue the generator
//   VoxelSync      turn the generator's event into the marcher's wait-list
//   RayDispatch    allocate config/image/debug, enqueue the marcher
//   RaySync        host waits on the marcher's event (drain if configured)
//   MapResults     map image, debug (and voxels) with their own wait-lists
//
// The only cross-stage ordering is the voxel event in the marcher's
// wait-list. Buffers are released at teardown whatever the outcome; after a
// failure the queue is drained first so nothing still references them.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::backend::Backend;
use crate::buffer::{AccessMode, AlignedBytes, BufferAllocator, BufferDesc, BufferId, BufferRegistry, BufferRole, ElementType, Shape};
use crate::dispatch::{DependencyPolicy, Extent, KernelDispatcher, KernelInvocation};
use crate::error::{DispatchError, PipelineError, StageError, Status};
use crate::event::{CompletionEvent, EventStatus, WaitList};
use crate::extract::{HostGrid, ResultExtractor};
use crate::program::{BuildLog, CompiledProgram, KernelSource, ProgramBuilder};
use crate::sources::{self, Dialect};
use crate::sync::{DrainPolicy, SyncGraph};
use crate::view::RenderConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum State {
    Idle,
    Building,
    VoxelDispatch,
    VoxelSync,
    RayDispatch,
    RaySync,
    MapResults,
    Done,
    Failed,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Done | State::Failed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// Run description
// ---------------------------------------------------------------------------

/// Source units of one stage and the entry point to launch from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSource {
    pub units: Vec<KernelSource>,
    pub entry: String,
}

impl StageSource {
    pub fn new(unit: KernelSource, entry: impl Into<String>) -> Self {
        StageSource { units: vec![unit], entry: entry.into() }
    }
}

/// Everything one pipeline run needs.
#[derive(Debug, Clone)]
pub struct PipelineSpec {
    pub generator: StageSource,
    pub marcher: StageSource,
    /// Edge length V of the V×V×V voxel grid.
    pub voxel_size: usize,
    pub power: f32,
    pub view: RenderConfig,
    pub image_width: usize,
    pub image_height: usize,
    pub voxel_local: Option<Extent>,
    pub ray_local: Option<Extent>,
    /// Byte the image buffer is filled with before the marcher runs.
    pub sentinel: u8,
    /// Also map the voxel grid back to the host.
    pub read_voxels: bool,
    /// Put the generator's event in the marcher's wait-list. Turning this
    /// off only makes sense together with `DependencyPolicy::Unchecked`.
    pub chain_stages: bool,
    pub dependency: DependencyPolicy,
}

impl PipelineSpec {
    /// The shipped kernels in `dialect`, default view of a V³ grid,
    /// power 8, sentinel 0xFF.
    pub fn new(dialect: Dialect, voxel_size: usize, image_width: usize, image_height: usize) -> Self {
        PipelineSpec {
            generator: StageSource::new(sources::generator(dialect), "mandel"),
            marcher: StageSource::new(sources::marcher(dialect), "ray"),
            voxel_size,
            power: 8.0,
            view: RenderConfig::for_grid(voxel_size),
            image_width,
            image_height,
            voxel_local: None,
            ray_local: None,
            sentinel: 0xFF,
            read_voxels: false,
            chain_stages: true,
            dependency: DependencyPolicy::Enforce,
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Counters and per-stage timings of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub backend: String,
    pub device: String,
    pub timings: Vec<(State, Duration)>,
    #[serde(skip)]
    pub build_logs: Vec<BuildLog>,
    pub allocations: usize,
    pub dispatches: usize,
    pub waits: usize,
    pub barriers: usize,
    pub drains: usize,
    pub maps: usize,
}

impl RunReport {
    pub fn time_in(&self, state: State) -> Option<Duration> {
        self.timings.iter().find(|(s, _)| *s == state).map(|(_, d)| *d)
    }

    pub fn total(&self) -> Duration {
        self.timings.iter().map(|(_, d)| *d).sum()
    }
}

/// Host-owned results of a successful run.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub voxels: Option<HostGrid<u8>>,
    pub image: HostGrid<u8>,
    pub debug: HostGrid<f32>,
    pub report: RunReport,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

struct Stages {
    voxels: BufferId,
    voxel_event: CompletionEvent,
    ray_wait: WaitList,
    image: BufferId,
    debug: BufferId,
    ray_event: CompletionEvent,
}

pub struct PipelineController<B: Backend> {
    backend: B,
    spec: PipelineSpec,
    state: State,
    history: Vec<State>,
    entered: Instant,
    timings: Vec<(State, Duration)>,
    registry: BufferRegistry,
    allocator: BufferAllocator,
    dispatcher: KernelDispatcher,
    sync: SyncGraph,
    extractor: ResultExtractor,
    build_logs: Vec<BuildLog>,
}

impl<B: Backend> PipelineController<B> {
    pub fn new(backend: B, spec: PipelineSpec) -> Self {
        let dispatcher = KernelDispatcher::with_policy(spec.dependency);
        PipelineController {
            backend,
            spec,
            state: State::Idle,
            history: vec![State::Idle],
            entered: Instant::now(),
            timings: Vec::new(),
            registry: BufferRegistry::new(),
            allocator: BufferAllocator::new(),
            dispatcher,
            sync: SyncGraph::new(DrainPolicy::Never),
            extractor: ResultExtractor::new(),
            build_logs: Vec::new(),
        }
    }

    /// Choose whether the queue is drained before results are mapped.
    pub fn with_sync(mut self, policy: DrainPolicy) -> Self {
        self.sync = SyncGraph::new(policy);
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Every state entered so far, in order.
    pub fn history(&self) -> &[State] {
        &self.history
    }

    pub fn allocations(&self) -> usize {
        self.allocator.allocations()
    }

    pub fn dispatches(&self) -> usize {
        self.dispatcher.dispatches()
    }

    pub fn registry(&self) -> &BufferRegistry {
        &self.registry
    }

    pub fn spec(&self) -> &PipelineSpec {
        &self.spec
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Run the whole pipeline once.
    ///
    /// # Errors
    /// `PipelineError` naming the stage that failed and why. A controller
    /// that already reached `Done` or `Failed` refuses with
    /// `StageError::Finished`.
    pub fn run(&mut self) -> Result<PipelineOutput, PipelineError> {
        if self.state.is_terminal() {
            log::error!("run refused: controller is {}", self.state);
            return Err(PipelineError { stage: self.state, source: StageError::Finished(self.state) });
        }
        log::info!(
            "pipeline on {} ({}): {}³ voxels, {}x{} image",
            self.backend.queue_device().name,
            self.backend.name(),
            self.spec.voxel_size,
            self.spec.image_width,
            self.spec.image_height
        );

        let outcome = self.execute();
        if outcome.is_err() {
            if let Err(status) = self.backend.finish() {
                log::warn!("drain after failure gave: {status}");
            }
        }
        let released = self.registry.release_all(&mut self.backend);
        log::debug!("released {released} buffer(s)");

        match outcome {
            Ok((voxels, image, debug)) => {
                self.enter(State::Done);
                let report = self.report();
                log::info!("pipeline done in {:.3} ms", report.total().as_secs_f64() * 1e3);
                Ok(PipelineOutput { voxels, image, debug, report })
            }
            Err(source) => {
                let stage = self.state;
                self.enter(State::Failed);
                let err = PipelineError { stage, source };
                log::error!("{err}");
                Err(err)
            }
        }
    }

    /// Counters and timings so far.
    pub fn report(&self) -> RunReport {
        RunReport {
            backend: self.backend.name().to_string(),
            device: self.backend.queue_device().name.clone(),
            timings: self.timings.clone(),
            build_logs: self.build_logs.clone(),
            allocations: self.allocator.allocations(),
            dispatches: self.dispatcher.dispatches(),
            waits: self.sync.waits(),
            barriers: self.sync.barriers(),
            drains: self.sync.drains(),
            maps: self.extractor.maps(),
        }
    }

    fn enter(&mut self, next: State) {
        let now = Instant::now();
        if self.state != State::Idle && !self.state.is_terminal() {
            self.timings.push((self.state, now - self.entered));
        }
        log::debug!("state {} -> {next}", self.state);
        self.entered = now;
        self.state = next;
        self.history.push(next);
    }

    #[allow(clippy::type_complexity)]
    fn execute(&mut self) -> Result<(Option<HostGrid<u8>>, HostGrid<u8>, HostGrid<f32>), StageError> {
        self.enter(State::Building);
        let program = self.build()?;

        self.enter(State::VoxelDispatch);
        let (voxels, voxel_event) = self.dispatch_voxels(&program)?;

        self.enter(State::VoxelSync);
        let ray_wait = self.voxel_sync(&voxel_event)?;

        self.enter(State::RayDispatch);
        let (image, debug, ray_event) = self.dispatch_ray(&program, voxels, &ray_wait)?;
        let stages = Stages { voxels, voxel_event, ray_wait, image, debug, ray_event };

        self.enter(State::RaySync);
        self.ray_sync(&stages)?;

        self.enter(State::MapResults);
        self.map_results(&stages)
    }

    fn build(&mut self) -> Result<CompiledProgram, StageError> {
        let mut builder = ProgramBuilder::new();
        for unit in self.spec.generator.units.iter().chain(&self.spec.marcher.units) {
            builder = builder.source(unit.clone());
        }
        let program = builder.build(&mut self.backend)?;
        self.build_logs = program.logs().to_vec();
        for entry in [&self.spec.generator.entry, &self.spec.marcher.entry] {
            if program.kernel(entry).is_none() {
                return Err(DispatchError::UnknownKernel(entry.clone()).into());
            }
        }
        Ok(program)
    }

    fn dispatch_voxels(&mut self, program: &CompiledProgram) -> Result<(BufferId, CompletionEvent), StageError> {
        let v = self.spec.voxel_size;
        let desc = BufferDesc::new(BufferRole::Voxels, ElementType::Byte, Shape::d3(v, v, v), AccessMode::ReadWrite);
        let voxels = self.allocator.allocate(&mut self.backend, &mut self.registry, desc, None)?;

        let mut inv = KernelInvocation::new(self.spec.generator.entry.clone(), Extent::d3(v, v, v))
            .buffer(voxels)
            .f32(self.spec.power);
        if let Some(local) = self.spec.voxel_local {
            inv = inv.local(local);
        }
        let ev = self.dispatcher.dispatch(&mut self.backend, program, &mut self.registry, &inv)?;
        Ok((voxels, ev))
    }

    /// The marcher's wait-list. Fails early when the generator has already
    /// resolved with an error.
    fn voxel_sync(&mut self, voxel_event: &CompletionEvent) -> Result<WaitList, StageError> {
        if let EventStatus::Error(status) = voxel_event.status() {
            return Err(DispatchError::Execution { kernel: self.spec.generator.entry.clone(), status }.into());
        }
        if self.spec.chain_stages {
            Ok(WaitList::new().with(voxel_event))
        } else {
            log::warn!("marcher will not wait for {voxel_event}");
            Ok(WaitList::new())
        }
    }

    fn dispatch_ray(
        &mut self,
        program: &CompiledProgram,
        voxels: BufferId,
        wait: &WaitList,
    ) -> Result<(BufferId, BufferId, CompletionEvent), StageError> {
        let (w, h) = (self.spec.image_width, self.spec.image_height);
        let floats = self.spec.view.as_floats();
        let config = self.allocator.allocate_f32(&mut self.backend, &mut self.registry, BufferRole::RenderConfig, AccessMode::ReadOnly, &floats)?;

        let image_desc = BufferDesc::new(BufferRole::Image, ElementType::Byte, Shape::d2(w, h), AccessMode::ReadWrite);
        let sentinel = AlignedBytes::filled(image_desc.byte_len()? as usize, self.spec.sentinel);
        let image = self.allocator.allocate(&mut self.backend, &mut self.registry, image_desc, Some(sentinel.as_bytes()))?;

        let debug_desc = BufferDesc::new(BufferRole::Debug, ElementType::Float32, Shape::d2(w, h), AccessMode::ReadWrite);
        let debug = self.allocator.allocate(&mut self.backend, &mut self.registry, debug_desc, None)?;

        let mut inv = KernelInvocation::new(self.spec.marcher.entry.clone(), Extent::d2(w, h))
            .buffer(image)
            .buffer(voxels)
            .buffer(config)
            .buffer(debug)
            .wait_on(wait.clone());
        if let Some(local) = self.spec.ray_local {
            inv = inv.local(local);
        }
        let ev = self.dispatcher.dispatch(&mut self.backend, program, &mut self.registry, &inv)?;
        Ok((image, debug, ev))
    }

    fn ray_sync(&mut self, stages: &Stages) -> Result<(), StageError> {
        if let Err(e) = self.sync.wait(&mut self.backend, &stages.ray_event) {
            // A failed generator surfaces here as a wait-list error; name
            // the generator as the kernel that failed.
            if let EventStatus::Error(status) = stages.voxel_event.status() {
                if e.status == Status::ExecStatusErrorForEventsInWaitList && stages.ray_wait.contains(stages.voxel_event.id()) {
                    return Err(DispatchError::Execution { kernel: self.spec.generator.entry.clone(), status }.into());
                }
            }
            return Err(DispatchError::from(e).into());
        }
        self.sync.before_map(&mut self.backend, &mut self.registry).map_err(DispatchError::from)?;
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn map_results(&mut self, stages: &Stages) -> Result<(Option<HostGrid<u8>>, HostGrid<u8>, HostGrid<f32>), StageError> {
        let after_ray = WaitList::new().with(&stages.ray_event);
        let image = self.extractor.enqueue_map(&mut self.backend, &mut self.registry, stages.image, &after_ray)?;
        let debug = self.extractor.enqueue_map(&mut self.backend, &mut self.registry, stages.debug, &after_ray)?;
        let voxels = if self.spec.read_voxels {
            let after_voxels = WaitList::new().with(&stages.voxel_event);
            Some(self.extractor.enqueue_map(&mut self.backend, &mut self.registry, stages.voxels, &after_voxels)?)
        } else {
            None
        };

        let image = self.extractor.finish(&mut self.backend, &mut self.registry, image)?;
        let image_grid = image.to_byte_grid();
        self.extractor.unmap(&mut self.registry, image);

        let debug = self.extractor.finish(&mut self.backend, &mut self.registry, debug)?;
        let debug_grid = debug.to_f32_grid();
        self.extractor.unmap(&mut self.registry, debug);

        let voxel_grid = match voxels {
            Some(pending) => {
                let m = self.extractor.finish(&mut self.backend, &mut self.registry, pending)?;
                let grid = m.to_byte_grid();
                self.extractor.unmap(&mut self.registry, m);
                Some(grid?)
            }
            None => None,
        };
        log::debug!("mapped {} result buffer(s)", self.extractor.maps());
        Ok((voxel_grid, image_grid?, debug_grid?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceSelector;
    use crate::emu::{EmuBackend, EmuOptions, EmuPlatform};

    fn backend() -> EmuBackend {
        EmuBackend::open(EmuPlatform::default(), DeviceSelector::First, EmuOptions::default()).unwrap()
    }

    #[test]
    fn small_run_reaches_done() {
        let mut c = PipelineController::new(backend(), PipelineSpec::new(Dialect::OpenCl, 16, 32, 24));
        let out = c.run().unwrap();
        assert_eq!(c.state(), State::Done);
        assert_eq!(out.image.shape(), Shape::d2(32, 24));
        assert_eq!(out.debug.len(), 32 * 24);
        assert!(out.voxels.is_none());
        assert_eq!(c.allocations(), 4);
        assert_eq!(c.dispatches(), 2);
        assert!(c.registry().is_empty());
        assert_eq!(out.report.maps, 2);
    }

    #[test]
    fn history_is_strictly_forward() {
        let mut c = PipelineController::new(backend(), PipelineSpec::new(Dialect::OpenCl, 8, 8, 8));
        c.run().unwrap();
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
    }

    #[test]
    fn terminal_controller_refuses_second_run() {
        let mut c = PipelineController::new(backend(), PipelineSpec::new(Dialect::OpenCl, 8, 8, 8));
        c.run().unwrap();
        let err = c.run().unwrap_err();
        assert_eq!(err.source, StageError::Finished(State::Done));
        assert_eq!(c.state(), State::Done);
    }

    #[test]
    fn read_voxels_returns_grid() {
        let mut spec = PipelineSpec::new(Dialect::OpenCl, 8, 8, 8);
        spec.read_voxels = true;
        let mut c = PipelineController::new(backend(), spec);
        let out = c.run().unwrap();
        let voxels = out.voxels.unwrap();
        assert_eq!(voxels.len(), 512);
        assert_eq!(out.report.maps, 3);
    }

    #[test]
    fn missing_entry_point_fails_in_building() {
        let mut spec = PipelineSpec::new(Dialect::OpenCl, 8, 8, 8);
        spec.marcher.entry = "march".into();
        let mut c = PipelineController::new(backend(), spec);
        let err = c.run().unwrap_err();
        assert_eq!(err.stage, State::Building);
        assert_eq!(c.allocations(), 0);
    }

    #[test]
    fn faulting_generator_fails_the_stage_that_observes_it() {
        let mut b = backend();
        b.register("mandel", |_: &crate::emu::WorkItem, _: &mut crate::emu::KernelArgs| {
            Err(crate::emu::KernelFault::Custom("boom".into()))
        });
        let mut c = PipelineController::new(b, PipelineSpec::new(Dialect::OpenCl, 8, 8, 8));
        let err = c.run().unwrap_err();
        // The emulated queue runs nothing until the host waits on the marcher.
        assert_eq!(err.stage, State::RaySync);
        match &err.source {
            StageError::Dispatch(DispatchError::Execution { kernel, .. }) => assert_eq!(kernel, "mandel"),
            other => panic!("expected the generator's execution error, got {other:?}"),
        }
        assert_eq!(
            c.history(),
            &[
                State::Idle,
                State::Building,
                State::VoxelDispatch,
                State::VoxelSync,
                State::RayDispatch,
                State::RaySync,
                State::Failed
            ]
        );
        assert_eq!(c.history()[c.history().len() - 2], err.stage);
        assert_eq!(c.state(), State::Failed);
        assert!(c.registry().is_empty());
    }

    #[test]
    fn report_has_a_timing_per_stage() {
        let mut c = PipelineController::new(backend(), PipelineSpec::new(Dialect::OpenCl, 8, 8, 8));
        let out = c.run().unwrap();
        for s in [State::Building, State::VoxelDispatch, State::VoxelSync, State::RayDispatch, State::RaySync, State::MapResults] {
            assert!(out.report.time_in(s).is_some(), "{s}");
        }
        assert_eq!(out.report.backend, "emu");
    }
}
