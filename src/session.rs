//! Interactive editing session tying the mask painter, histories, throttler
//! and the persistent blend renderer together.
//!
//! Three threads cooperate. The caller thread owns the session handle, the
//! curve history and the LUT cache. A paint worker thread owns the
//! [`MaskPainter`], the mask history and the [`UpdateThrottler`], so stroke
//! commands never block on the GPU. A dedicated GPU thread owns the
//! [`BlendRenderer`] plus a copy of the filtered base image for curve
//! re-filtering; it is the only thread that touches GPU state after init.
//!
//! Everything flows over `std::sync::mpsc`. Each blend job carries its own
//! copy of the mask, so no raster is ever shared across threads. Composited
//! previews come back to the caller as [`SessionEvent`]s to drain between
//! frames; `export` is the one call that blocks on the GPU.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{bail, Context};
use image::RgbaImage;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::curve::{Lut, LutCache, ToneCurves};
use crate::history::History;
use crate::mask::{Mask, MaskPainter, Stroke, StrokeMode};
use crate::render::BlendRenderer;
use crate::throttle::{ThrottleDecision, UpdateThrottler};

/// Asynchronous output of the session, drained by the caller.
pub enum SessionEvent {
    /// A freshly composited preview and the blend generation it reflects.
    Preview { image: RgbaImage, generation: u64 },
    /// A background failure that did not abort the session.
    Error(String),
}

enum WorkerCmd {
    BeginStroke {
        point: (f32, f32),
        radius_px: f32,
        mode: StrokeMode,
    },
    ExtendStroke {
        point: (f32, f32),
    },
    EndStroke,
    CancelStroke,
    ClearMask,
    UndoMask,
    RedoMask,
    ApplyLut(Lut),
    Export {
        reply: Sender<anyhow::Result<RgbaImage>>,
    },
    /// GPU thread feedback: the job with this generation left the queue.
    BlendDone(u64),
    Shutdown,
}

enum GpuJob {
    Blend {
        mask: Mask,
        generation: u64,
        forced: bool,
    },
    Refilter {
        lut: Lut,
        mask: Mask,
        generation: u64,
    },
    Export {
        mask: Mask,
        generation: u64,
        reply: Sender<anyhow::Result<RgbaImage>>,
    },
    Release,
}

/// Handle to one non-destructive editing session over a filtered/original
/// image pair. All methods are cheap sends except [`EditSession::export`].
pub struct EditSession {
    cmd_tx: Sender<WorkerCmd>,
    events_rx: Receiver<SessionEvent>,
    curves: ToneCurves,
    curve_history: History<ToneCurves>,
    lut_cache: LutCache,
    adapter_summary: String,
    worker: Option<JoinHandle<()>>,
    gpu: Option<JoinHandle<()>>,
    released: bool,
}

impl EditSession {
    /// Spawns the worker and GPU threads and initialises the persistent
    /// blend renderer. Fails if the GPU context cannot be created or the
    /// image pair is invalid; nothing keeps running in that case.
    pub fn new(
        filtered: RgbaImage,
        original: RgbaImage,
        config: &EngineConfig,
    ) -> anyhow::Result<Self> {
        let (width, height) = filtered.dimensions();

        let (cmd_tx, cmd_rx) = mpsc::channel::<WorkerCmd>();
        let (gpu_tx, gpu_rx) = mpsc::channel::<GpuJob>();
        let (event_tx, events_rx) = mpsc::channel::<SessionEvent>();
        let (init_tx, init_rx) = mpsc::channel::<anyhow::Result<String>>();
        let latest_generation = Arc::new(AtomicU64::new(0));

        let gpu = {
            let event_tx = event_tx.clone();
            let done_tx = cmd_tx.clone();
            let latest = Arc::clone(&latest_generation);
            std::thread::Builder::new()
                .name("darkroom-gpu".into())
                .spawn(move || {
                    let renderer = match BlendRenderer::init(&filtered, &original) {
                        Ok(renderer) => {
                            let _ = init_tx.send(Ok(renderer.adapter_summary()));
                            renderer
                        }
                        Err(err) => {
                            let _ = init_tx.send(Err(err));
                            return;
                        }
                    };
                    gpu_loop(renderer, filtered, gpu_rx, event_tx, done_tx, latest);
                })
                .context("failed to spawn GPU thread")?
        };

        let adapter_summary = match init_rx
            .recv()
            .context("GPU thread exited before reporting init")?
        {
            Ok(summary) => summary,
            Err(err) => {
                let _ = gpu.join();
                return Err(err.context("blend renderer init failed"));
            }
        };
        debug!(adapter = %adapter_summary, "edit session renderer ready");

        let worker = {
            let gpu_tx = gpu_tx.clone();
            let event_tx = event_tx.clone();
            let latest = Arc::clone(&latest_generation);
            let worker_cfg = config.clone();
            std::thread::Builder::new()
                .name("darkroom-paint".into())
                .spawn(move || {
                    worker_loop(width, height, &worker_cfg, cmd_rx, gpu_tx, event_tx, latest);
                })
                .context("failed to spawn paint worker thread")?
        };

        let mut curve_history = History::new(config.history_capacity);
        curve_history.push(ToneCurves::default());

        Ok(Self {
            cmd_tx,
            events_rx,
            curves: ToneCurves::default(),
            curve_history,
            lut_cache: LutCache::default(),
            adapter_summary,
            worker: Some(worker),
            gpu: Some(gpu),
            released: false,
        })
    }

    pub fn adapter_summary(&self) -> &str {
        &self.adapter_summary
    }

    /// Non-blocking drain of pending preview/error events.
    pub fn try_next_event(&self) -> Option<SessionEvent> {
        self.events_rx.try_recv().ok()
    }

    pub fn begin_stroke(
        &self,
        point: (f32, f32),
        radius_px: f32,
        mode: StrokeMode,
    ) -> anyhow::Result<()> {
        self.send(WorkerCmd::BeginStroke {
            point,
            radius_px,
            mode,
        })
    }

    pub fn extend_stroke(&self, point: (f32, f32)) -> anyhow::Result<()> {
        self.send(WorkerCmd::ExtendStroke { point })
    }

    pub fn end_stroke(&self) -> anyhow::Result<()> {
        self.send(WorkerCmd::EndStroke)
    }

    /// Discards the in-progress stroke without committing it.
    pub fn cancel_stroke(&self) -> anyhow::Result<()> {
        self.send(WorkerCmd::CancelStroke)
    }

    pub fn clear_mask(&self) -> anyhow::Result<()> {
        self.send(WorkerCmd::ClearMask)
    }

    pub fn undo_mask(&self) -> anyhow::Result<()> {
        self.send(WorkerCmd::UndoMask)
    }

    pub fn redo_mask(&self) -> anyhow::Result<()> {
        self.send(WorkerCmd::RedoMask)
    }

    pub fn curves(&self) -> &ToneCurves {
        &self.curves
    }

    pub fn can_undo_curves(&self) -> bool {
        self.curve_history.can_undo()
    }

    pub fn can_redo_curves(&self) -> bool {
        self.curve_history.can_redo()
    }

    /// Validates and applies a new set of tone curves. The GPU thread
    /// re-derives the filtered layer from the stored base and issues a
    /// forced blend; the result arrives as a [`SessionEvent::Preview`]. On
    /// validation failure the previous curves stay in effect.
    pub fn set_curves(&mut self, curves: ToneCurves) -> anyhow::Result<()> {
        curves.validate()?;
        let lut = self.lut_cache.get(&curves)?;
        self.curve_history.push(curves.clone());
        self.curves = curves;
        self.send(WorkerCmd::ApplyLut(lut))
    }

    /// Steps the curve history back and re-ships the restored snapshot.
    /// Returns false when there is nothing to undo.
    pub fn undo_curves(&mut self) -> anyhow::Result<bool> {
        let Some(curves) = self.curve_history.undo() else {
            return Ok(false);
        };
        let lut = self.lut_cache.get(&curves)?;
        self.curves = curves;
        self.send(WorkerCmd::ApplyLut(lut))?;
        Ok(true)
    }

    pub fn redo_curves(&mut self) -> anyhow::Result<bool> {
        let Some(curves) = self.curve_history.redo() else {
            return Ok(false);
        };
        let lut = self.lut_cache.get(&curves)?;
        self.curves = curves;
        self.send(WorkerCmd::ApplyLut(lut))?;
        Ok(true)
    }

    /// Blocks until the current mask and curves are composited and returns
    /// the full-resolution result. Ordered after every previously issued
    /// command, so the output reflects all edits made so far.
    pub fn export(&self) -> anyhow::Result<RgbaImage> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(WorkerCmd::Export { reply: reply_tx })?;
        reply_rx
            .recv()
            .context("session shut down before export completed")?
    }

    /// Shuts both threads down and destroys all GPU resources. Dropping the
    /// session does the same; calling this makes teardown explicit.
    pub fn release(mut self) {
        self.shutdown();
    }

    fn send(&self, cmd: WorkerCmd) -> anyhow::Result<()> {
        if self.released {
            bail!("session already released");
        }
        self.cmd_tx
            .send(cmd)
            .map_err(|_| anyhow::anyhow!("session worker is gone"))
    }

    fn shutdown(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let _ = self.cmd_tx.send(WorkerCmd::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        if let Some(gpu) = self.gpu.take() {
            let _ = gpu.join();
        }
    }
}

impl Drop for EditSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Paint worker: serialises stroke edits, snapshots the stroke log into the
/// mask history, and decides through the throttler when to ship a blend job.
fn worker_loop(
    width: u32,
    height: u32,
    config: &EngineConfig,
    cmd_rx: Receiver<WorkerCmd>,
    gpu_tx: Sender<GpuJob>,
    event_tx: Sender<SessionEvent>,
    latest: Arc<AtomicU64>,
) {
    let mut painter = MaskPainter::new(
        width,
        height,
        config.preview_downscale,
        config.brush_hardness,
    );
    let mut history: History<Vec<Stroke>> = History::new(config.history_capacity);
    history.push(Vec::new());
    let mut throttler = UpdateThrottler::new(config.throttle_interval());

    let report = |err: anyhow::Error| {
        warn!(error = %err, "paint command rejected");
        let _ = event_tx.send(SessionEvent::Error(err.to_string()));
    };

    let request_blend = |throttler: &mut UpdateThrottler, painter: &MaskPainter, forced: bool| {
        match throttler.request(forced) {
            ThrottleDecision::Run { generation } => {
                latest.store(generation, Ordering::SeqCst);
                let _ = gpu_tx.send(GpuJob::Blend {
                    mask: painter.mask().clone(),
                    generation,
                    forced,
                });
            }
            ThrottleDecision::Dropped => {
                debug!("blend request dropped by throttler");
            }
        }
    };

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            WorkerCmd::BeginStroke {
                point,
                radius_px,
                mode,
            } => match painter.begin(point, radius_px, mode) {
                Ok(()) => request_blend(&mut throttler, &painter, false),
                Err(err) => report(err),
            },
            WorkerCmd::ExtendStroke { point } => match painter.extend(point) {
                Ok(()) => request_blend(&mut throttler, &painter, false),
                Err(err) => report(err),
            },
            WorkerCmd::EndStroke => match painter.end() {
                Ok(()) => {
                    history.push(painter.strokes().to_vec());
                    request_blend(&mut throttler, &painter, true);
                }
                Err(err) => report(err),
            },
            WorkerCmd::CancelStroke => {
                painter.cancel();
                request_blend(&mut throttler, &painter, true);
            }
            WorkerCmd::ClearMask => {
                painter.clear();
                history.push(Vec::new());
                request_blend(&mut throttler, &painter, true);
            }
            WorkerCmd::UndoMask => {
                if let Some(strokes) = history.undo() {
                    painter.rebuild_from(&strokes);
                    request_blend(&mut throttler, &painter, true);
                } else {
                    debug!("mask undo at baseline, ignored");
                }
            }
            WorkerCmd::RedoMask => {
                if let Some(strokes) = history.redo() {
                    painter.rebuild_from(&strokes);
                    request_blend(&mut throttler, &painter, true);
                } else {
                    debug!("mask redo with empty tail, ignored");
                }
            }
            WorkerCmd::ApplyLut(lut) => {
                // Curve edits always re-render: forced, like stroke ends.
                if let ThrottleDecision::Run { generation } = throttler.request(true) {
                    latest.store(generation, Ordering::SeqCst);
                    let _ = gpu_tx.send(GpuJob::Refilter {
                        lut,
                        mask: painter.mask().clone(),
                        generation,
                    });
                }
            }
            WorkerCmd::Export { reply } => {
                if let ThrottleDecision::Run { generation } = throttler.request(true) {
                    latest.store(generation, Ordering::SeqCst);
                    let _ = gpu_tx.send(GpuJob::Export {
                        mask: painter.mask().clone(),
                        generation,
                        reply,
                    });
                }
            }
            WorkerCmd::BlendDone(generation) => {
                throttler.finish(generation);
            }
            WorkerCmd::Shutdown => {
                let _ = gpu_tx.send(GpuJob::Release);
                break;
            }
        }
    }
}

/// GPU loop: executes blend jobs in order, skipping stale non-forced ones,
/// and feeds completions back to the worker so the throttler can reopen.
fn gpu_loop(
    renderer: BlendRenderer,
    // Filtered base before any curve adjustment; curve edits re-derive the
    // blended-in layer from this image, never from a previous LUT output.
    base: RgbaImage,
    gpu_rx: Receiver<GpuJob>,
    event_tx: Sender<SessionEvent>,
    done_tx: Sender<WorkerCmd>,
    latest: Arc<AtomicU64>,
) {
    while let Ok(job) = gpu_rx.recv() {
        match job {
            GpuJob::Blend {
                mask,
                generation,
                forced,
            } => {
                if !forced && generation < latest.load(Ordering::SeqCst) {
                    debug!(generation, "skipping stale blend job");
                } else {
                    match renderer.blend(&mask) {
                        Ok(image) => {
                            let _ = event_tx.send(SessionEvent::Preview { image, generation });
                        }
                        Err(err) => {
                            warn!(error = %err, "blend dispatch failed");
                            let _ = event_tx.send(SessionEvent::Error(err.to_string()));
                        }
                    }
                }
                let _ = done_tx.send(WorkerCmd::BlendDone(generation));
            }
            GpuJob::Refilter {
                lut,
                mask,
                generation,
            } => {
                let result = renderer
                    .apply_lut_to(&base, &lut)
                    .and_then(|filtered| renderer.set_filtered(&filtered))
                    .and_then(|()| renderer.blend(&mask));
                match result {
                    Ok(image) => {
                        let _ = event_tx.send(SessionEvent::Preview { image, generation });
                    }
                    Err(err) => {
                        warn!(error = %err, "curve re-filter failed");
                        let _ = event_tx.send(SessionEvent::Error(err.to_string()));
                    }
                }
                let _ = done_tx.send(WorkerCmd::BlendDone(generation));
            }
            GpuJob::Export {
                mask,
                generation,
                reply,
            } => {
                let _ = reply.send(renderer.blend(&mask));
                let _ = done_tx.send(WorkerCmd::BlendDone(generation));
            }
            GpuJob::Release => break,
        }
    }
    renderer.release();
}

#[cfg(test)]
mod tests {
    use image::{ImageBuffer, Rgba};

    use super::*;
    use crate::curve::ControlPoint;

    fn flat(w: u32, h: u32, rgba: [u8; 4]) -> RgbaImage {
        ImageBuffer::from_pixel(w, h, Rgba(rgba))
    }

    fn session_100() -> Option<EditSession> {
        let filtered = flat(100, 100, [200, 40, 40, 255]);
        let original = flat(100, 100, [10, 120, 230, 255]);
        EditSession::new(filtered, original, &EngineConfig::default()).ok()
    }

    #[test]
    fn export_without_edits_returns_original() {
        let Some(session) = session_100() else {
            return;
        };
        let out = session.export().expect("export succeeds");
        assert!(out.pixels().all(|p| p.0 == [10, 120, 230, 255]));
        session.release();
    }

    #[test]
    fn stroke_then_export_reveals_filtered_on_path() {
        let Some(session) = session_100() else {
            return;
        };
        session
            .begin_stroke((0.2, 0.2), 20.0, StrokeMode::Erase)
            .unwrap();
        session.extend_stroke((0.8, 0.8)).unwrap();
        session.end_stroke().unwrap();

        let out = session.export().expect("export succeeds");
        assert_eq!(out.get_pixel(50, 50).0, [200, 40, 40, 255]);
        assert_eq!(out.get_pixel(90, 10).0, [10, 120, 230, 255]);
        session.release();
    }

    #[test]
    fn undo_mask_restores_pre_stroke_output() {
        let Some(session) = session_100() else {
            return;
        };
        session
            .begin_stroke((0.5, 0.5), 20.0, StrokeMode::Erase)
            .unwrap();
        session.end_stroke().unwrap();
        session.undo_mask().unwrap();

        let out = session.export().expect("export succeeds");
        assert!(out.pixels().all(|p| p.0 == [10, 120, 230, 255]));

        session.redo_mask().unwrap();
        let out = session.export().expect("export succeeds");
        assert_eq!(out.get_pixel(50, 50).0, [200, 40, 40, 255]);
        session.release();
    }

    #[test]
    fn cancelled_stroke_leaves_no_trace() {
        let Some(session) = session_100() else {
            return;
        };
        session
            .begin_stroke((0.5, 0.5), 20.0, StrokeMode::Erase)
            .unwrap();
        session.extend_stroke((0.6, 0.6)).unwrap();
        session.cancel_stroke().unwrap();

        let out = session.export().expect("export succeeds");
        assert!(out.pixels().all(|p| p.0 == [10, 120, 230, 255]));
        session.release();
    }

    #[test]
    fn invalid_curves_are_rejected_and_state_unchanged() {
        let Some(mut session) = session_100() else {
            return;
        };
        let before = session.curves().clone();
        let mut bad = ToneCurves::default();
        bad.master = vec![ControlPoint::new(0.5, 0.0), ControlPoint::new(0.5, 1.0)];
        assert!(session.set_curves(bad).is_err());
        assert_eq!(session.curves(), &before);
        assert!(!session.can_undo_curves());
        session.release();
    }

    #[test]
    fn curve_edit_changes_masked_region_only() {
        let Some(mut session) = session_100() else {
            return;
        };
        // Erase the whole frame so the filtered base is fully visible.
        session
            .begin_stroke((0.5, 0.5), 200.0, StrokeMode::Erase)
            .unwrap();
        session.end_stroke().unwrap();

        // Pull everything to black through the master curve.
        let mut curves = ToneCurves::default();
        curves.master = vec![ControlPoint::new(0.0, 0.0), ControlPoint::new(1.0, 0.0)];
        session.set_curves(curves).unwrap();
        assert!(session.can_undo_curves());

        let out = session.export().expect("export succeeds");
        assert_eq!(out.get_pixel(50, 50).0[0], 0);
        assert_eq!(out.get_pixel(50, 50).0[1], 0);
        assert_eq!(out.get_pixel(50, 50).0[2], 0);

        // Undo restores the identity filtering of the base.
        assert!(session.undo_curves().unwrap());
        let out = session.export().expect("export succeeds");
        assert_eq!(out.get_pixel(50, 50).0, [200, 40, 40, 255]);
        session.release();
    }

    #[test]
    fn drag_burst_produces_fewer_previews_than_inputs() {
        let Some(session) = session_100() else {
            return;
        };
        session
            .begin_stroke((0.1, 0.1), 10.0, StrokeMode::Erase)
            .unwrap();
        for i in 0..50 {
            let t = 0.1 + 0.016 * i as f32;
            session.extend_stroke((t, t)).unwrap();
        }
        session.end_stroke().unwrap();
        // Export is ordered after everything above.
        let _ = session.export().expect("export succeeds");

        let mut previews = 0;
        while let Some(event) = session.try_next_event() {
            if let SessionEvent::Preview { .. } = event {
                previews += 1;
            }
        }
        assert!(previews >= 1, "at least the forced stroke-end blend runs");
        assert!(previews < 52, "throttler must coalesce the drag burst");
        session.release();
    }

    #[test]
    fn mismatched_image_pair_fails_construction() {
        let filtered = flat(64, 64, [0, 0, 0, 255]);
        let original = flat(100, 100, [0, 0, 0, 255]);
        assert!(EditSession::new(filtered, original, &EngineConfig::default()).is_err());
    }
}
