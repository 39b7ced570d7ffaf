//! Per-camera exposure gains from the brightness of shared overlaps.
//!
//! The renderer samples every camera's left and right overlap rectangles,
//! hands them to [`GainSolver`] and keeps drawing; a background worker turns
//! the samples into RGB multipliers that make neighbours agree on the
//! brightness of what they both see.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use image::imageops;
use image::RgbaImage;
use log::{debug, error, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use surround_core::next_index;

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::compensator::Compensator;

/// What the worker does with signals that piled up while it was computing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalPolicy {
    /// One computation per request.
    #[default]
    EveryRequest,
    /// Drain the backlog and compute once on the latest samples.
    LatestOnly,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GainParams {
    pub gamma: f64,
    pub policy: SignalPolicy,
}

impl Default for GainParams {
    fn default() -> Self {
        Self {
            gamma: 2.2,
            policy: SignalPolicy::EveryRequest,
        }
    }
}

/// Left and right overlap samples of one camera.
pub type OverlapPair = [RgbaImage; 2];

#[derive(thiserror::Error, Debug)]
pub enum GainError {
    #[error("cannot start the gain worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("expected overlap samples for {expected} cameras, got {found}")]
    CameraCount { expected: usize, found: usize },
    #[error("gain worker is not running")]
    Stopped,
}

/// Crop every camera's render to its two overlap rectangles: left is
/// `flip_roi(i)`, right is `flip_roi(next(i))`.
pub fn crop_overlaps(renders: &[RgbaImage], compensator: &Compensator) -> Vec<OverlapPair> {
    let count = renders.len();
    renders
        .iter()
        .enumerate()
        .map(|(i, render)| {
            let crop = |index: usize| {
                let r = compensator
                    .flip_roi(index)
                    .clamp_to(render.width(), render.height());
                if r.is_empty() {
                    return RgbaImage::new(0, 0);
                }
                imageops::crop_imm(render, r.x as u32, r.y as u32, r.width as u32, r.height as u32)
                    .to_image()
            };
            [crop(i), crop(next_index(i, count))]
        })
        .collect()
}

/// Gamma-expanded RGB sums of a sample.
fn channel_sums(sample: &RgbaImage, gamma: f64) -> [f64; 3] {
    let mut acc = [0.0; 3];
    for px in sample.pixels() {
        for (c, a) in acc.iter_mut().enumerate() {
            *a += (px[c] as f64).powf(gamma);
        }
    }
    acc
}

fn ratio(num: f64, den: f64) -> f64 {
    if num > 0.0 && den > 0.0 {
        num / den
    } else {
        1.0
    }
}

/// Solve the gains for one set of samples.
///
/// With `a[0] = 1` and `a[i] = right[i-1] / left[i]` per channel, the
/// overall level is `g = sum(a) / sum(a^2)` and camera `i` gets
/// `(g * a[i])^(1 / gamma)`. Gains come out in BGR order, the layout the
/// renderer's shader takes.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "debug", skip_all, fields(cameras = overlaps.len()))
)]
pub fn solve_gains(overlaps: &[OverlapPair], gamma: f64) -> Vec<[f32; 3]> {
    let left: Vec<[f64; 3]> = overlaps
        .iter()
        .map(|o| channel_sums(&o[0], gamma))
        .collect();
    let right: Vec<[f64; 3]> = overlaps
        .iter()
        .map(|o| channel_sums(&o[1], gamma))
        .collect();

    let mut a = vec![[1.0f64; 3]; overlaps.len()];
    for i in 1..overlaps.len() {
        for c in 0..3 {
            a[i][c] = ratio(right[i - 1][c], left[i][c]);
        }
    }

    let mut g = [1.0f64; 3];
    for (c, gc) in g.iter_mut().enumerate() {
        let sum: f64 = a.iter().map(|v| v[c]).sum();
        let sum_sq: f64 = a.iter().map(|v| v[c] * v[c]).sum();
        *gc = ratio(sum, sum_sq);
    }

    a.iter()
        .map(|ai| {
            let mut out = [1.0f32; 3];
            for (color, o) in out.iter_mut().enumerate() {
                let c = 2 - color;
                let gain = (g[c] * ai[c]).powf(1.0 / gamma);
                *o = if gain.is_finite() && gain > 0.0 {
                    gain as f32
                } else {
                    1.0
                };
            }
            out
        })
        .collect()
}

struct GainState {
    overlaps: Vec<OverlapPair>,
    gains: Vec<[f32; 3]>,
}

struct Shared {
    state: Mutex<GainState>,
    exit: AtomicBool,
    computations: AtomicUsize,
}

/// Background gain computation fed by the render loop.
///
/// Every submission posts one token on an unbounded channel; the worker
/// waits for a token, checks the exit flag, then solves under the state
/// lock. Dropping the solver raises the exit flag, posts a last token and
/// joins the worker.
pub struct GainSolver {
    shared: Arc<Shared>,
    signal: Sender<()>,
    worker: Option<JoinHandle<()>>,
    cameras: usize,
}

impl GainSolver {
    pub fn new(cameras: usize, params: GainParams) -> Result<Self, GainError> {
        let shared = Arc::new(Shared {
            state: Mutex::new(GainState {
                overlaps: Vec::new(),
                gains: vec![[1.0; 3]; cameras],
            }),
            exit: AtomicBool::new(false),
            computations: AtomicUsize::new(0),
        });
        let (signal, requests) = crossbeam_channel::unbounded();
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("gain-solver".into())
            .spawn(move || run_worker(worker_shared, requests, params))?;
        info!("gain solver started for {cameras} cameras");
        Ok(Self {
            shared,
            signal,
            worker: Some(worker),
            cameras,
        })
    }

    pub fn cameras(&self) -> usize {
        self.cameras
    }

    fn check_count(&self, found: usize) -> Result<(), GainError> {
        if found != self.cameras {
            return Err(GainError::CameraCount {
                expected: self.cameras,
                found,
            });
        }
        Ok(())
    }

    fn post(&self) -> Result<(), GainError> {
        if self.worker.is_none() {
            return Err(GainError::Stopped);
        }
        self.signal.send(()).map_err(|_| GainError::Stopped)
    }

    /// Store new samples, waiting for the worker if it holds the lock.
    pub fn submit(&self, overlaps: Vec<OverlapPair>) -> Result<(), GainError> {
        self.check_count(overlaps.len())?;
        self.shared.state.lock().overlaps = overlaps;
        self.post()
    }

    /// Store new samples only if the lock is free right now. `sample` runs
    /// under the lock, so nothing is read back while the worker computes.
    /// Returns whether a request was posted.
    pub fn try_submit<F>(&self, sample: F) -> Result<bool, GainError>
    where
        F: FnOnce() -> Vec<OverlapPair>,
    {
        let Some(mut state) = self.shared.state.try_lock() else {
            return Ok(false);
        };
        let overlaps = sample();
        self.check_count(overlaps.len())?;
        state.overlaps = overlaps;
        drop(state);
        self.post()?;
        Ok(true)
    }

    /// Latest gains, one BGR triple per camera.
    pub fn gains(&self) -> Vec<[f32; 3]> {
        self.shared.state.lock().gains.clone()
    }

    /// Number of finished computations.
    pub fn computations(&self) -> usize {
        self.shared.computations.load(Ordering::Acquire)
    }

    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.shared.exit.store(true, Ordering::Release);
        let _ = self.signal.send(());
        if worker.join().is_err() {
            error!("gain worker panicked");
        }
        info!("gain solver stopped");
    }
}

impl Drop for GainSolver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(shared: Arc<Shared>, requests: Receiver<()>, params: GainParams) {
    while !shared.exit.load(Ordering::Acquire) {
        if requests.recv().is_err() {
            break;
        }
        if shared.exit.load(Ordering::Acquire) {
            break;
        }
        if params.policy == SignalPolicy::LatestOnly {
            let skipped = requests.try_iter().count();
            if skipped > 0 {
                debug!("coalesced {skipped} gain requests");
            }
        }

        let mut state = shared.state.lock();
        if !state.overlaps.is_empty() {
            let gains = solve_gains(&state.overlaps, params.gamma);
            state.gains = gains;
        }
        drop(state);
        shared.computations.fetch_add(1, Ordering::AcqRel);
    }
}
