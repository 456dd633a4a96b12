//! The calibration mode state machine.
//!
//! One state step runs per tick. Mode changes arrive asynchronously through
//! the `EngineHandle` and are honored at the top of the next tick; in-flight
//! hardware calls always run to completion. The automatic pipeline walks
//! VDISP -> HOME -> LASER -> PROJECTOR per virtual display, falling back one
//! state whenever a budget runs out, and appends one `CalibrationSample` per
//! converged projector pixel.

use crate::calibration::context::{ServoState, VdispCalibrationContext};
use crate::calibration::sampling;
use crate::camera::{CameraError, DetectKind, Pixel, PtcCamera, TrackingCameras};
use crate::config::{DetectionConfig, LaserConfig, SearchConfig};
use crate::laser::{LaserActuator, LaserError};
use crate::pacing::Pacer;
use crate::projector::{DisplayServer, ProjectorError, ProjectorPixelLighter};
use crate::store::{CalibrationSample, CorrespondenceStore, Observation, StoreError};
use crate::triangulate::Reconstructor;
use nalgebra::Point3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Selects one virtual display, optionally with an explicit target pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct VdispSelector {
    pub display_server: String,
    pub vdisp: String,
    /// Explicit target projector pixel; the mask's center of mass otherwise.
    pub centroid: Option<Pixel>,
}

/// Engine mode. Each variant carries exactly the arguments it needs, so a
/// mode change is always one atomic value.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineMode {
    Sleep,
    ManualTracking,
    ManualProjector { target: VdispSelector },
    ManualClicked,
    DisplayServer,
    DisplayServerStop,
    DisplayServerVdisp { target: Option<VdispSelector> },
    DisplayServerHome,
    DisplayServerLaser,
    DisplayServerProjector,
    Restore { path: PathBuf },
    Finish,
}

impl EngineMode {
    pub fn name(&self) -> &'static str {
        match self {
            EngineMode::Sleep => "sleep",
            EngineMode::ManualTracking => "manual_tracking",
            EngineMode::ManualProjector { .. } => "manual_projector",
            EngineMode::ManualClicked => "manual_clicked",
            EngineMode::DisplayServer => "display_server",
            EngineMode::DisplayServerStop => "display_server_stop",
            EngineMode::DisplayServerVdisp { .. } => "display_server_vdisp",
            EngineMode::DisplayServerHome => "display_server+home",
            EngineMode::DisplayServerLaser => "display_server+laser",
            EngineMode::DisplayServerProjector => "display_server+projector",
            EngineMode::Restore { .. } => "restore",
            EngineMode::Finish => "finish",
        }
    }
}

impl std::fmt::Display for EngineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Engine error. Failures inside a tick are logged, not propagated out of
/// the run loop; this type surfaces them to the logging path.
#[derive(Debug)]
pub enum EngineError {
    Laser(LaserError),
    Camera(CameraError),
    Projector(ProjectorError),
    Store(StoreError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Laser(e) => write!(f, "{}", e),
            EngineError::Camera(e) => write!(f, "{}", e),
            EngineError::Projector(e) => write!(f, "{}", e),
            EngineError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<LaserError> for EngineError {
    fn from(e: LaserError) -> Self {
        EngineError::Laser(e)
    }
}

impl From<CameraError> for EngineError {
    fn from(e: CameraError) -> Self {
        EngineError::Camera(e)
    }
}

impl From<ProjectorError> for EngineError {
    fn from(e: ProjectorError) -> Self {
        EngineError::Projector(e)
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Store(e)
    }
}

/// Fired once per tick with the current mode.
pub type ModeCallback = Box<dyn FnMut(&EngineMode)>;

/// Fired per replayed sample during RESTORE.
pub type ReplayCallback = Box<dyn FnMut(&CalibrationSample)>;

struct EngineShared {
    mode: Mutex<EngineMode>,
    clicks: Mutex<Vec<(String, Pixel)>>,
}

/// Shared handle for asynchronous mode requests and click queuing.
///
/// A mode change replaces the whole `EngineMode` value under one lock, so
/// the engine's per-tick snapshot never mixes two requests.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<EngineShared>,
}

impl EngineHandle {
    fn new() -> Self {
        Self {
            shared: Arc::new(EngineShared {
                mode: Mutex::new(EngineMode::Sleep),
                clicks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn change_mode(&self, mode: EngineMode) {
        let mut guard = self.shared.mode.lock().unwrap_or_else(|e| e.into_inner());
        log::info!("changing mode -> {}", mode);
        *guard = mode;
    }

    pub fn mode(&self) -> EngineMode {
        self.shared
            .mode
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Queue an operator click on a display server window.
    pub fn queue_click(&self, display_server: &str, pixel: Pixel) {
        log::info!("queuing point {} on {}", pixel, display_server);
        self.shared
            .clicks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((display_server.to_string(), pixel));
    }

    pub fn clear_clicks(&self) {
        log::info!("clearing queued points");
        self.shared
            .clicks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn take_clicks(&self) -> Vec<(String, Pixel)> {
        std::mem::take(&mut *self.shared.clicks.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Result of one tracking-rig triangulation attempt.
#[derive(Debug, Clone)]
pub struct Triangulation3d {
    /// The accepted 3D point; `None` below two views or past the
    /// reprojection gate.
    pub point: Option<Point3<f64>>,
    pub observations: Vec<(String, Pixel)>,
    pub visible: usize,
    pub reprojection_error: f64,
}

/// A resolved vdisp target with everything the search needs copied out.
struct ResolvedTarget {
    centroid: Pixel,
    laser_gain: (f64, f64),
    proj_step: (f64, f64),
    width: u32,
    height: u32,
}

/// Signed servo step toward closing `diff`: proportional past the coarse
/// crossover, the fixed gain inside it.
fn servo_step(diff: f64, gain: f64, search: &SearchConfig) -> f64 {
    if diff == 0.0 {
        return 0.0;
    }
    let magnitude = if diff.abs() > search.coarse_px {
        gain * diff.abs() * search.proportional_gain
    } else {
        gain
    };
    diff.signum() * magnitude
}

/// The closed-loop calibration engine.
pub struct CalibrationEngine {
    detection: DetectionConfig,
    search: SearchConfig,
    tick: Duration,
    displays: BTreeMap<String, DisplayServer>,
    lighter: ProjectorPixelLighter,
    laser: LaserActuator,
    tracking: TrackingCameras,
    ptc: PtcCamera,
    recon: Box<dyn Reconstructor>,
    store: CorrespondenceStore,
    handle: EngineHandle,
    pending: Vec<VdispSelector>,
    ctx: Option<VdispCalibrationContext>,
    rng: StdRng,
    pacer: Box<dyn Pacer>,
    on_tick: Option<ModeCallback>,
    replay_viz: Option<ReplayCallback>,
}

impl CalibrationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        detection: DetectionConfig,
        search: SearchConfig,
        tick: Duration,
        displays: BTreeMap<String, DisplayServer>,
        lighter: ProjectorPixelLighter,
        laser: LaserActuator,
        tracking: TrackingCameras,
        ptc: PtcCamera,
        recon: Box<dyn Reconstructor>,
        store: CorrespondenceStore,
        pacer: Box<dyn Pacer>,
    ) -> Self {
        Self {
            detection,
            search,
            tick,
            displays,
            lighter,
            laser,
            tracking,
            ptc,
            recon,
            store,
            handle: EngineHandle::new(),
            pending: Vec::new(),
            ctx: None,
            rng: StdRng::from_os_rng(),
            pacer,
            on_tick: None,
            replay_viz: None,
        }
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn store(&self) -> &CorrespondenceStore {
        &self.store
    }

    /// Per-tick status publication hook.
    pub fn set_mode_callback(&mut self, callback: ModeCallback) {
        self.on_tick = Some(callback);
    }

    /// Visualization hook for RESTORE replay.
    pub fn set_replay_callback(&mut self, callback: ReplayCallback) {
        self.replay_viz = Some(callback);
    }

    /// One-time startup: home the laser, blank every projector, and compute
    /// every camera's background model.
    pub fn startup(&mut self, laser: &LaserConfig) -> Result<(), EngineError> {
        self.laser
            .initialize(laser.home[0], laser.home[1], laser.brightness)?;
        let names: Vec<String> = self.displays.keys().cloned().collect();
        for ds in &names {
            log::info!("calibrating {}", ds);
            self.lighter.blank(ds)?;
        }
        self.tracking
            .collect_backgrounds(self.detection.background_frames)?;
        self.ptc.collect_background(self.detection.background_frames)?;
        Ok(())
    }

    /// Run until FINISH, then shut down.
    pub fn run(&mut self) {
        loop {
            if self.step() {
                break;
            }
            self.pacer.pause(self.tick);
        }
        self.shutdown();
    }

    /// Execute one tick. Returns true when the engine should stop.
    pub fn step(&mut self) -> bool {
        let mode = self.handle.mode();
        if matches!(mode, EngineMode::Finish) {
            return true;
        }
        let name = mode.name();
        if let Err(e) = self.dispatch(mode) {
            log::error!("calibration step failed in {}: {}", name, e);
        }
        let current = self.handle.mode();
        if let Some(cb) = self.on_tick.as_mut() {
            cb(&current);
        }
        false
    }

    /// Orderly shutdown: beam off, calibration log closed. Safe to repeat.
    pub fn shutdown(&mut self) {
        if let Err(e) = self.laser.power_off() {
            log::error!("laser power off failed: {}", e);
        }
        if let Err(e) = self.store.close() {
            log::error!("closing calibration log failed: {}", e);
        }
    }

    fn dispatch(&mut self, mode: EngineMode) -> Result<(), EngineError> {
        match mode {
            EngineMode::Sleep | EngineMode::Finish => Ok(()),
            EngineMode::ManualTracking => self.step_manual_tracking(),
            EngineMode::ManualProjector { target } => self.step_manual_projector(&target),
            EngineMode::ManualClicked => self.step_manual_clicked(),
            EngineMode::DisplayServer => self.step_display_server(),
            EngineMode::DisplayServerStop => {
                self.pending.clear();
                self.handle
                    .change_mode(EngineMode::DisplayServerVdisp { target: None });
                Ok(())
            }
            EngineMode::DisplayServerVdisp { target } => self.step_vdisp(target),
            EngineMode::DisplayServerHome => self.step_home(),
            EngineMode::DisplayServerLaser => self.step_laser(),
            EngineMode::DisplayServerProjector => self.step_projector(),
            EngineMode::Restore { path } => self.step_restore(&path),
        }
    }

    fn step_manual_tracking(&mut self) -> Result<(), EngineError> {
        let _ = self.detect_3d()?;
        let _ = self.ptc.detect(DetectKind::Laser)?;
        Ok(())
    }

    fn step_manual_projector(&mut self, target: &VdispSelector) -> Result<(), EngineError> {
        let Some(resolved) = self.resolve_target(target) else {
            self.handle.change_mode(EngineMode::Sleep);
            return Ok(());
        };
        self.lighter
            .light(&target.display_server, Some(resolved.centroid))?;
        let _ = self.ptc.detect(DetectKind::Visible)?;
        Ok(())
    }

    fn step_manual_clicked(&mut self) -> Result<(), EngineError> {
        let clicks = self.handle.take_clicks();
        for (ds_name, px) in clicks {
            let Some(ds) = self.displays.get(&ds_name) else {
                log::warn!("clicked unknown display server {}", ds_name);
                continue;
            };
            for vd in &ds.vdisps {
                if vd.contains(&px) {
                    log::info!("clicked to select {} in {}", px, vd.id);
                    self.pending.push(VdispSelector {
                        display_server: ds_name.clone(),
                        vdisp: vd.id.clone(),
                        centroid: Some(px),
                    });
                }
            }
        }
        if self.pending.is_empty() {
            self.handle.change_mode(EngineMode::Sleep);
        } else {
            self.handle
                .change_mode(EngineMode::DisplayServerVdisp { target: None });
        }
        Ok(())
    }

    fn step_display_server(&mut self) -> Result<(), EngineError> {
        self.pending.clear();
        for (name, ds) in &self.displays {
            for vd in &ds.vdisps {
                for pt in vd.sample_points(self.search.sample_spacing_px) {
                    self.pending.push(VdispSelector {
                        display_server: name.clone(),
                        vdisp: vd.id.clone(),
                        centroid: Some(pt),
                    });
                }
            }
        }
        log::info!("enumerated {} sample points", self.pending.len());
        self.handle
            .change_mode(EngineMode::DisplayServerVdisp { target: None });
        Ok(())
    }

    fn step_vdisp(&mut self, target: Option<VdispSelector>) -> Result<(), EngineError> {
        self.ctx = None;
        let selector = if let Some(sel) = self.pending.pop() {
            sel
        } else if let Some(sel) = target {
            // consume the external selector so a failed search falls back to
            // sleep instead of retrying the same vdisp forever
            self.pending.clear();
            self.handle
                .change_mode(EngineMode::DisplayServerVdisp { target: None });
            sel
        } else {
            log::info!("nothing to do");
            self.handle.change_mode(EngineMode::Sleep);
            return Ok(());
        };

        let Some(resolved) = self.resolve_target(&selector) else {
            self.handle.change_mode(EngineMode::Sleep);
            return Ok(());
        };
        log::info!(
            "calibrating {}:{} @ {}",
            selector.display_server,
            selector.vdisp,
            resolved.centroid
        );

        // get the laser close enough to the target pixel that the projector
        // pixel can later be moved onto the laser
        self.lighter
            .light(&selector.display_server, Some(resolved.centroid))?;

        match self.search_home(&resolved)? {
            Some((pan, tilt, dist)) => {
                log::info!(
                    "found starting pixel: {} pan:{:.1} tilt:{:.1} (dist:{:.1})",
                    resolved.centroid,
                    pan,
                    tilt,
                    dist
                );
                self.ctx = Some(VdispCalibrationContext {
                    display_server: selector.display_server,
                    vdisp: selector.vdisp,
                    home_pan: pan,
                    home_tilt: tilt,
                    target_pixel: resolved.centroid,
                    width: resolved.width,
                    height: resolved.height,
                    laser_gain: resolved.laser_gain,
                    proj_step: resolved.proj_step,
                    points_needed: self.search.points_per_vdisp,
                    home_attempts_left: self.search.home_attempts as i32,
                    candidates: Vec::new(),
                    servo: None,
                });
                self.handle.change_mode(EngineMode::DisplayServerHome);
            }
            None => {
                log::warn!("could not find starting pixel {}", resolved.centroid);
            }
        }
        Ok(())
    }

    /// Coarse-to-fine laser search for the currently lit target pixel.
    /// Returns the home angles and the final detection distance.
    fn search_home(
        &mut self,
        resolved: &ResolvedTarget,
    ) -> Result<Option<(f64, f64, f64)>, EngineError> {
        let beam = self.search.beam_on_during_search;
        let expected = self.ptc.expected();

        // current position twice for reliability, then the full raster
        let state = self.laser.state();
        let mut path = vec![(state.pan, state.tilt); 2];
        let pan_range = self.laser.pan_range();
        let tilt_range = self.laser.tilt_range();
        path.extend(sampling::vert_snake_linspace(
            (pan_range.min, pan_range.max),
            pan_range.steps,
            (tilt_range.min, tilt_range.max),
            tilt_range.steps,
        ));

        for (pan, tilt) in path {
            let (mut pan, mut tilt) = self.laser.light(pan, tilt, beam)?;
            let Some(mut det) = self.ptc.detect(DetectKind::Visible)? else {
                continue;
            };
            let rough = expected.distance(&det);
            if rough >= self.search.rough_px {
                log::info!("2D pixel too far from start location (dist:{:.1})", rough);
                continue;
            }

            let mut best = rough;
            let mut converged = rough < self.search.fine_px;
            let mut tries = self.search.refine_attempts;
            while !converged && tries > 0 {
                let diffcol = expected.col - det.col;
                let diffrow = expected.row - det.row;
                let (npan, ntilt) = self.laser.light(
                    pan + servo_step(diffcol, resolved.laser_gain.0, &self.search),
                    tilt + servo_step(diffrow, resolved.laser_gain.1, &self.search),
                    beam,
                )?;
                pan = npan;
                tilt = ntilt;
                match self.ptc.detect(DetectKind::Visible)? {
                    // lost the pixel; keep the previous detection
                    None => tries -= 1,
                    Some(d) => {
                        det = d;
                        let dist = expected.distance(&det);
                        best = best.min(dist);
                        if dist < self.search.fine_px {
                            converged = true;
                        } else {
                            tries -= 1;
                        }
                    }
                }
            }
            if !converged && best < self.search.accept_px {
                log::info!("accepting rough convergence (best dist:{:.1})", best);
                converged = true;
            }
            if converged {
                return Ok(Some((pan, tilt, best)));
            }
            // refinement failed at this raster point; keep sweeping
        }
        Ok(None)
    }

    fn step_home(&mut self) -> Result<(), EngineError> {
        let (ds, home_pan, home_tilt, exhausted) = match self.ctx.as_mut() {
            Some(ctx) => {
                ctx.home_attempts_left -= 1;
                (
                    ctx.display_server.clone(),
                    ctx.home_pan,
                    ctx.home_tilt,
                    ctx.home_attempts_left < 0,
                )
            }
            None => {
                log::warn!("no virtual display under calibration");
                self.handle.change_mode(EngineMode::Sleep);
                return Ok(());
            }
        };
        if exhausted {
            log::warn!("giving up, could not get laser home location (maybe reflection)");
            self.ctx = None;
            self.handle
                .change_mode(EngineMode::DisplayServerVdisp { target: None });
            return Ok(());
        }

        self.laser.light(home_pan, home_tilt, true)?;
        self.lighter.blank(&ds)?;

        if self.ptc.detect(DetectKind::Laser)?.is_some() {
            self.laser.power_off()?;
            // candidate angles about home; the list is generous because the
            // sampling loop exits on points collected, not list exhaustion
            let candidates = self.candidate_angles(home_pan, home_tilt);
            if let Some(ctx) = self.ctx.as_mut() {
                ctx.candidates = candidates;
            }
            self.handle.change_mode(EngineMode::DisplayServerLaser);
        }
        // no detection: the laser may be occluded or reflecting, retry
        Ok(())
    }

    fn candidate_angles(&mut self, home_pan: f64, home_tilt: f64) -> Vec<(f64, f64)> {
        let [lo, hi] = self.search.jitter;
        let mut candidates = Vec::with_capacity(self.search.candidate_count + 1);
        candidates.push((home_pan, home_tilt));
        for _ in 0..self.search.candidate_count {
            candidates.push((
                home_pan + self.rng.random_range(lo..=hi) as f64,
                home_tilt + self.rng.random_range(lo..=hi) as f64,
            ));
        }
        candidates
    }

    fn step_laser(&mut self) -> Result<(), EngineError> {
        let (ds, target_pixel, candidate) = match self.ctx.as_mut() {
            Some(ctx) => (
                ctx.display_server.clone(),
                ctx.target_pixel,
                ctx.candidates.pop(),
            ),
            None => {
                log::warn!("no virtual display under calibration");
                self.handle.change_mode(EngineMode::Sleep);
                return Ok(());
            }
        };
        let Some((pan, tilt)) = candidate else {
            log::warn!("giving up, could not get a 3D reconstruction");
            self.ctx = None;
            self.handle
                .change_mode(EngineMode::DisplayServerVdisp { target: None });
            return Ok(());
        };

        let (pan, tilt) = self.laser.light(pan, tilt, true)?;
        self.lighter.blank(&ds)?;

        let tri = self.detect_3d()?;
        // always poll the PTC camera to keep its model warm, even when the
        // 3D result is discarded this tick
        let ptc_px = self.ptc.detect(DetectKind::Laser)?;

        let Some(position) = tri.point else {
            log::info!(
                "no 3d point (visible in {} cams, reproj error: {:.1})",
                tri.visible,
                tri.reprojection_error
            );
            return Ok(());
        };
        let Some(target) = ptc_px else {
            return Ok(());
        };

        self.laser.power_off()?;
        let attempts = self.search.servo_attempts as i32;
        if let Some(ctx) = self.ctx.as_mut() {
            ctx.servo = Some(ServoState {
                position,
                observations: tri.observations,
                pan,
                tilt,
                target,
                // start from the previously found middle of the ptc view
                proj: target_pixel,
                attempts_left: attempts,
            });
        }
        self.handle.change_mode(EngineMode::DisplayServerProjector);
        Ok(())
    }

    fn step_projector(&mut self) -> Result<(), EngineError> {
        self.laser.power_off()?;

        let (ds, proj, exhausted) = {
            let Some(ctx) = self.ctx.as_mut() else {
                log::warn!("no virtual display under calibration");
                self.handle.change_mode(EngineMode::Sleep);
                return Ok(());
            };
            let Some(servo) = ctx.servo.as_mut() else {
                log::warn!("no servo target");
                self.handle.change_mode(EngineMode::DisplayServerLaser);
                return Ok(());
            };
            servo.attempts_left -= 1;
            (
                ctx.display_server.clone(),
                servo.proj,
                servo.attempts_left < 0,
            )
        };
        if exhausted {
            log::warn!("giving up, could not servo the projector pixel");
            if let Some(ctx) = self.ctx.as_mut() {
                ctx.servo = None;
            }
            self.handle.change_mode(EngineMode::DisplayServerLaser);
            return Ok(());
        }

        self.lighter.light(&ds, Some(proj))?;

        // missed the projector pixel: try again, the attempt budget bounds us
        let Some(det) = self.ptc.detect(DetectKind::Visible)? else {
            return Ok(());
        };

        let Some(ctx) = self.ctx.as_mut() else {
            return Ok(());
        };
        let proj_step = ctx.proj_step;
        let (width, height) = (ctx.width, ctx.height);
        let Some(servo) = ctx.servo.as_mut() else {
            return Ok(());
        };

        let mut colfound = false;
        let mut rowfound = false;
        let diffcol = servo.target.col - det.col;
        if diffcol.abs() > 1.0 {
            servo.proj.col += servo_step(diffcol, proj_step.0, &self.search);
        } else {
            colfound = true;
        }
        let diffrow = servo.target.row - det.row;
        if diffrow.abs() > 1.0 {
            servo.proj.row += servo_step(diffrow, proj_step.1, &self.search);
        } else {
            rowfound = true;
        }
        servo.proj.col = servo.proj.col.clamp(0.0, (width - 1) as f64);
        servo.proj.row = servo.proj.row.clamp(0.0, (height - 1) as f64);

        if colfound && rowfound {
            log::info!("FOUND CORRESPONDENCE");
            let Some(servo) = ctx.servo.take() else {
                return Ok(());
            };
            let sample = CalibrationSample {
                display_server: ctx.display_server.clone(),
                vdisp: ctx.vdisp.clone(),
                position: [servo.position.x, servo.position.y, servo.position.z],
                pan: servo.pan,
                tilt: servo.tilt,
                pixel_projector: servo.proj,
                pixel_ptc_laser: servo.target,
                pixel_ptc_projector: det,
                points: servo
                    .observations
                    .iter()
                    .map(|(camera, pixel)| Observation {
                        camera: camera.clone(),
                        pixel: *pixel,
                    })
                    .collect(),
            };
            ctx.points_needed = ctx.points_needed.saturating_sub(1);
            let more = ctx.points_needed > 0;
            self.store.append(&sample)?;
            if more {
                self.handle.change_mode(EngineMode::DisplayServerLaser);
            } else {
                self.ctx = None;
                self.handle
                    .change_mode(EngineMode::DisplayServerVdisp { target: None });
            }
        }
        Ok(())
    }

    fn step_restore(&mut self, path: &std::path::Path) -> Result<(), EngineError> {
        let viz = &mut self.replay_viz;
        match self.store.replay_into(path, |sample| {
            if let Some(cb) = viz.as_mut() {
                cb(sample);
            }
        }) {
            Ok(n) => log::info!("restored {} correspondences", n),
            Err(e) => log::error!("could not load requested calibration: {}", e),
        }
        self.handle.change_mode(EngineMode::Sleep);
        Ok(())
    }

    fn resolve_target(&self, selector: &VdispSelector) -> Option<ResolvedTarget> {
        let Some(ds) = self.displays.get(&selector.display_server) else {
            log::warn!("display server {} not found", selector.display_server);
            return None;
        };
        let Some(vd) = ds.vdisp(&selector.vdisp) else {
            log::warn!(
                "vdisp {} not found in display server {}",
                selector.vdisp,
                selector.display_server
            );
            return None;
        };
        let Some(centroid) = selector.centroid.or_else(|| vd.center_of_mass()) else {
            log::warn!("vdisp {} has an empty mask", selector.vdisp);
            return None;
        };
        Some(ResolvedTarget {
            centroid,
            laser_gain: (vd.laser_gain_col, vd.laser_gain_row),
            proj_step: (vd.proj_step_col, vd.proj_step_row),
            width: ds.width,
            height: ds.height,
        })
    }

    /// Detect the laser in the tracking cameras and triangulate, gating on
    /// mean reprojection error.
    fn detect_3d(&mut self) -> Result<Triangulation3d, EngineError> {
        let observations = self.tracking.detect_all(self.detection.laser_thresh)?;
        let visible = observations.len();
        let mut result = Triangulation3d {
            point: None,
            observations,
            visible,
            reprojection_error: 0.0,
        };
        if visible < 2 {
            return Ok(result);
        }
        let Some(xyz) = self.recon.find3d(&result.observations) else {
            return Ok(result);
        };

        let mut errors = Vec::with_capacity(visible);
        for (camera, pixel) in &result.observations {
            if let Some(reproj) = self.recon.find2d(camera, &xyz) {
                errors.push(pixel.distance(&reproj));
            }
        }
        if !errors.is_empty() {
            result.reprojection_error = errors.iter().sum::<f64>() / errors.len() as f64;
        }
        if result.reprojection_error >= self.detection.reprojection_gate_px {
            return Ok(result);
        }

        log::info!(
            "detect 3D: ({:.3}, {:.3}, {:.3}) (reproj:{:.1})",
            xyz.x,
            xyz.y,
            xyz.z,
            result.reprojection_error
        );
        result.point = Some(xyz);
        Ok(result)
    }
}
