//! The render orchestrator: a pool of chaos game workers plotting onto one
//! histogram.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgba};
use watch::WatchSender;

use crate::{
    Affine, ChaosIter, ChaosRng, Context, Hist, HistError, HistImage, Point, Size, System,
    SystemError, ToneMap,
};

/// Interval at which a synchronous render checks its caps.
const TICK: Duration = Duration::from_millis(15);
/// Steps a worker takes between publishing its counts.
const BATCH: u64 = 1024;
/// Batches a worker runs before starting a fresh trajectory.
const REFUSE_BATCHES: u64 = 32;

/// A 16-bit RGBA image produced by [`Render::plot_onto`].
pub type Frame = ImageBuffer<Rgba<u16>, Vec<u16>>;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error(transparent)]
    System(#[from] SystemError),
    #[error(transparent)]
    Hist(#[from] HistError),
}

#[derive(Debug, Default)]
struct Counters {
    iters: AtomicU64,
    hits: AtomicU64,
}
impl Counters {
    fn add(&self, iters: u64, hits: u64) {
        self.iters.fetch_add(iters, Ordering::Relaxed);
        self.hits.fetch_add(hits, Ordering::Relaxed);
    }
}

/// A handle to a render's iteration and hit counts, readable from any thread
/// while the render runs.
///
/// Workers publish their counts in batches, so a running render can be ahead
/// of the counts by a small number of iterations per worker. The counts are
/// exact once the render returns.
#[derive(Debug, Clone)]
pub struct Progress(Arc<Counters>);
impl Progress {
    #[must_use]
    pub fn iters(&self) -> u64 {
        self.0.iters.load(Ordering::Relaxed)
    }
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.0.hits.load(Ordering::Relaxed)
    }
}

/// Reconfiguration of a [`Render::render_async`] loop.
///
/// `None` fields keep their current value. The default value pauses the
/// render without discarding progress.
#[derive(Debug, Default)]
pub struct ChangeRender {
    /// Replaces the system. Empty and invalid systems are ignored.
    pub system: Option<System>,
    pub camera: Option<Affine>,
    pub palette: Option<Vec<Rgba<u16>>>,
    /// Resets the histogram to this size. Progress is cleared even if the
    /// size is unchanged.
    pub size: Option<Size>,
    /// Workers to run after the change. `0` pauses.
    pub procs: usize,
}
impl ChangeRender {
    /// Combine with a change sent after this one.
    #[must_use]
    pub fn merge(self, later: Self) -> Self {
        Self {
            system: later.system.or(self.system),
            camera: later.camera.or(self.camera),
            palette: later.palette.or(self.palette),
            size: later.size.or(self.size),
            procs: later.procs,
        }
    }
}

/// A request to [`Render::render_async`] for an image of the current
/// histogram.
#[derive(Debug, Clone, Copy)]
pub struct PlotRequest {
    pub width: u32,
    pub height: u32,
    /// Resampling from the oversampled histogram to the output size.
    pub filter: FilterType,
    pub tone_map: ToneMap,
    /// The tone-mapped histogram is composited over this color.
    pub background: Rgba<u16>,
}

/// Scale the color channels by alpha, so that the histogram's count channel
/// weighs them.
#[allow(clippy::cast_possible_truncation)]
fn premultiply(Rgba([r, g, b, a]): Rgba<u16>) -> Rgba<u16> {
    let a32 = u32::from(a);
    let mul = |c: u16| (u32::from(c) * a32 / 0xffff) as u16;
    Rgba([mul(r), mul(g), mul(b), a])
}

/// The state workers share while plotting.
struct Plotter {
    hist: Arc<Hist>,
    camera: Affine,
    palette: Vec<Rgba<u16>>,
    /// Rows over columns.
    ratio: f64,
    counters: Arc<Counters>,
}
impl Plotter {
    #[allow(clippy::cast_precision_loss)]
    fn new(r: &Render) -> Self {
        let palette = if r.palette.is_empty() {
            vec![Rgba([0; 4])]
        } else {
            r.palette.iter().copied().map(premultiply).collect()
        };
        Self {
            hist: Arc::clone(&r.hist),
            camera: r.camera,
            palette,
            ratio: r.hist.rows() as f64 / r.hist.cols() as f64,
            counters: Arc::clone(&r.counters),
        }
    }

    /// Project a point through the camera and accumulate its color.
    /// Returns whether the point landed in the histogram.
    ///
    /// The visible window is `[-1, 1)` along the longer axis of the
    /// histogram, and proportionally shorter along the other.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    #[inline]
    fn plot(&self, p: Point) -> bool {
        let (x, y, _) = self.camera.tx(p.x, p.y, p.z);
        let (cols, rows) = (self.hist.cols(), self.hist.rows());
        let r = self.ratio;
        let (col, row) = if r <= 1. {
            if !(-1.0..1.0).contains(&x) || !(-r..r).contains(&y) {
                return false;
            }
            ((x + 1.) * 0.5 * cols as f64, (y / r + 1.) * 0.5 * rows as f64)
        } else {
            if !(-1. / r..1. / r).contains(&x) || !(-1.0..1.0).contains(&y) {
                return false;
            }
            ((x * r + 1.) * 0.5 * cols as f64, (y + 1.) * 0.5 * rows as f64)
        };
        // rounding at the upper edge of the window
        let col = (col as usize).min(cols - 1);
        let row = (row as usize).min(rows - 1);
        let n = self.palette.len();
        let c = ((p.c * n as f64) as usize).min(n - 1);
        self.hist.add(col, row, self.palette[c]);
        true
    }
}

fn work(system: &System, plotter: &Plotter, stop: &AtomicBool, rng: ChaosRng) {
    // The system was checked before the pool started.
    let Ok(mut it) = ChaosIter::new(system, rng) else {
        return;
    };
    let (mut n, mut q) = (0, 0);
    let mut batches = 0_u64;
    while !stop.load(Ordering::Relaxed) {
        n += 1;
        if it.step().is_some_and(|p| plotter.plot(p)) {
            q += 1;
        }
        if n == BATCH {
            plotter.counters.add(n, q);
            (n, q) = (0, 0);
            batches += 1;
            // leave whichever basin the trajectory settled in
            if batches % REFUSE_BATCHES == 0 {
                it.fuse();
            }
        }
    }
    plotter.counters.add(n, q);
}

/// Running workers. Dropping the pool stops and joins them.
struct Pool {
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}
impl Pool {
    /// Workers only exit early by panicking.
    fn any_exited(&self) -> bool {
        self.workers.iter().any(JoinHandle::is_finished)
    }
    /// Stop and join the workers, resuming any panic from a worker.
    fn join(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for h in self.workers.drain(..) {
            if let Err(panic) = h.join() {
                std::panic::resume_unwind(panic);
            }
        }
    }
}
impl Drop for Pool {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for h in self.workers.drain(..) {
            let _ = h.join();
        }
    }
}

enum Event {
    Done,
    Change(ChangeRender),
    Plot(PlotRequest),
    ChangeClosed,
    PlotClosed,
}

/// Renders a [`System`] onto a [`Hist`].
///
/// Configuration is changed only through `&mut self`, and every render method
/// joins its workers before returning, so workers never observe a change.
#[derive(Debug)]
pub struct Render {
    hist: Arc<Hist>,
    system: Arc<System>,
    pub camera: Affine,
    /// Colors indexed by the color coordinate of plotted points, not
    /// premultiplied. An empty palette plots transparent black.
    pub palette: Vec<Rgba<u16>>,
    /// Workers for [`Self::render`]. `0` uses one per CPU.
    pub procs: usize,
    /// Stop [`Self::render`] after this many iterations. `0` disables the cap.
    pub iter_limit: u64,
    /// Stop [`Self::render`] after this many plotted points. `0` disables the
    /// cap.
    pub hit_limit: u64,
    counters: Arc<Counters>,
}
impl Render {
    /// A render with a white palette, an identity camera and no caps.
    #[must_use]
    pub fn new(hist: Hist, system: System) -> Self {
        Self {
            hist: Arc::new(hist),
            system: Arc::new(system),
            camera: Affine::eye(),
            palette: vec![Rgba([0xffff; 4])],
            procs: 0,
            iter_limit: 0,
            hit_limit: 0,
            counters: Arc::default(),
        }
    }
    /// # Errors
    ///
    /// Returns [`HistError::Overflow`] if the histogram would not fit in
    /// memory.
    pub fn with_size(size: Size, system: System) -> Result<Self, RenderError> {
        Ok(Self::new(Hist::new(size)?, system))
    }

    #[must_use]
    pub fn hist(&self) -> &Hist {
        &self.hist
    }
    /// Exclusive access to the histogram, e.g. for [`Hist::write_to`].
    pub fn hist_mut(&mut self) -> &mut Hist {
        Arc::get_mut(&mut self.hist).expect("histogram is only shared while rendering")
    }
    #[must_use]
    pub fn system(&self) -> &System {
        &self.system
    }
    pub fn set_system(&mut self, system: System) {
        self.system = Arc::new(system);
    }

    /// Reset the histogram to `size` and zero the counts.
    ///
    /// # Errors
    ///
    /// Returns [`HistError::Overflow`], leaving the render unchanged, if the
    /// histogram would not fit in memory.
    pub fn reset(&mut self, size: Size) -> Result<(), HistError> {
        self.hist_mut().reset(size)?;
        self.counters.iters.store(0, Ordering::Relaxed);
        self.counters.hits.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Iterations performed since the histogram was last reset.
    #[must_use]
    pub fn iters(&self) -> u64 {
        self.counters.iters.load(Ordering::Relaxed)
    }
    /// Points plotted since the histogram was last reset.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.counters.hits.load(Ordering::Relaxed)
    }
    #[must_use]
    pub fn progress(&self) -> Progress {
        Progress(Arc::clone(&self.counters))
    }

    /// Area of the plane visible through the camera. `1` if the histogram is
    /// empty or the camera is degenerate.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn area(&self) -> f64 {
        if self.hist.is_empty() {
            return 1.;
        }
        let r = self.hist.rows() as f64 / self.hist.cols() as f64;
        let window = if r <= 1. { 4. * r } else { 4. / r };
        let area = window / self.camera.proj_area();
        if area.is_finite() && area > 0. {
            area
        } else {
            1.
        }
    }

    /// A tone-mapped view of the histogram at the current counts.
    #[must_use]
    pub fn image(&self, tm: &ToneMap) -> HistImage<'_> {
        self.hist.image(tm, self.area(), self.iters())
    }

    /// Tone-map the histogram, resample it to the requested size and
    /// composite it over the background. Workers may be running.
    #[must_use]
    pub fn plot_onto(&self, req: &PlotRequest) -> Frame {
        let mut out = ImageBuffer::from_pixel(req.width, req.height, req.background);
        if self.hist.is_empty() || req.width == 0 || req.height == 0 {
            return out;
        }
        let src = self.image(&req.tone_map).to_buffer();
        if src.dimensions() == (req.width, req.height) {
            imageops::overlay(&mut out, &src, 0, 0);
        } else {
            let scaled = imageops::resize(&src, req.width, req.height, req.filter);
            imageops::overlay(&mut out, &scaled, 0, 0);
        }
        out
    }

    fn capped(&self) -> bool {
        (self.iter_limit > 0 && self.iters() >= self.iter_limit)
            || (self.hit_limit > 0 && self.hits() >= self.hit_limit)
    }

    fn ready(&self) -> bool {
        !self.hist.is_empty() && self.system.check().is_ok()
    }

    fn start(&mut self, procs: usize, rng: &mut ChaosRng) -> Pool {
        Arc::get_mut(&mut self.system)
            .expect("system is only shared while rendering")
            .prep();
        let plotter = Arc::new(Plotter::new(self));
        let stop = Arc::new(AtomicBool::new(false));
        let workers = (0..procs)
            .map(|_| {
                let system = Arc::clone(&self.system);
                let plotter = Arc::clone(&plotter);
                let stop = Arc::clone(&stop);
                let worker_rng = rng.clone();
                rng.jump();
                thread::spawn(move || work(&system, &plotter, &stop, worker_rng))
            })
            .collect();
        log::debug!(
            "started {procs} workers on {}x{} histogram",
            self.hist.cols(),
            self.hist.rows()
        );
        Pool { stop, workers }
    }

    fn stop(&self, pool: Option<Pool>) {
        if let Some(pool) = pool {
            let n = pool.workers.len();
            pool.join();
            log::debug!(
                "stopped {n} workers at {} iterations, {} hits",
                self.iters(),
                self.hits()
            );
        }
    }

    /// Render until the iteration or hit cap is reached or `ctx` is done.
    ///
    /// May be called repeatedly to continue the same histogram, typically
    /// with raised caps.
    ///
    /// # Errors
    ///
    /// Returns the error from [`System::check`] without starting any worker.
    pub fn render(&mut self, ctx: &Context) -> Result<(), RenderError> {
        self.system.check()?;
        if self.hist.is_empty() || ctx.is_done() || self.capped() {
            return Ok(());
        }
        let procs = if self.procs == 0 {
            num_cpus::get()
        } else {
            self.procs
        };
        let mut rng = ChaosRng::from_entropy();
        let pool = self.start(procs, &mut rng);
        let ticker = channel::tick(TICK);
        let deadline = ctx.deadline_rx();
        loop {
            let done = crossbeam::select! {
                recv(ctx.done()) -> _ => true,
                recv(deadline) -> _ => true,
                recv(ticker) -> _ => self.capped() || pool.any_exited(),
            };
            if done {
                break;
            }
        }
        self.stop(Some(pool));
        Ok(())
    }

    /// Render live, accepting reconfiguration on `change` and serving image
    /// requests from `plot` until `ctx` is done or both request channels are
    /// disconnected.
    ///
    /// If the render already has a valid system and a non-empty histogram,
    /// [`Self::procs`] workers start immediately (one per CPU if `0`).
    /// Otherwise the loop waits for a [`ChangeRender`].
    ///
    /// Changes arriving together are merged and applied at once, with all
    /// workers stopped. Plot requests arriving together are served once,
    /// using the last, without stopping workers. Images are published on
    /// `imgs`, and `None` is published before returning.
    ///
    /// # Errors
    ///
    /// Returns the error from [`System::check`] if the initial system is
    /// invalid.
    pub fn render_async(
        &mut self,
        ctx: &Context,
        mut change: Receiver<ChangeRender>,
        mut plot: Receiver<PlotRequest>,
        imgs: &WatchSender<Option<Arc<Frame>>>,
    ) -> Result<(), RenderError> {
        let mut rng = ChaosRng::from_entropy();
        let mut pool = None;
        if !self.system.is_empty() && !self.hist.is_empty() {
            self.system.check()?;
            let procs = if self.procs == 0 {
                num_cpus::get()
            } else {
                self.procs
            };
            pool = Some(self.start(procs, &mut rng));
        }
        let deadline = ctx.deadline_rx();
        let (mut change_open, mut plot_open) = (true, true);
        while change_open || plot_open {
            let event = crossbeam::select! {
                recv(ctx.done()) -> _ => Event::Done,
                recv(deadline) -> _ => Event::Done,
                recv(change) -> c => c.map_or(Event::ChangeClosed, Event::Change),
                recv(plot) -> w => w.map_or(Event::PlotClosed, Event::Plot),
            };
            match event {
                Event::Done => break,
                Event::Change(c) => {
                    let c = change.try_iter().fold(c, ChangeRender::merge);
                    self.stop(pool.take());
                    let procs = c.procs;
                    self.apply(c);
                    if procs > 0 && self.ready() {
                        pool = Some(self.start(procs, &mut rng));
                    }
                }
                Event::Plot(req) => {
                    let req = plot.try_iter().last().unwrap_or(req);
                    log::trace!(
                        "plotting {}x{} at {} iterations",
                        req.width,
                        req.height,
                        self.iters()
                    );
                    imgs.send(Some(Arc::new(self.plot_onto(&req))));
                }
                Event::ChangeClosed => {
                    change = channel::never();
                    change_open = false;
                }
                Event::PlotClosed => {
                    plot = channel::never();
                    plot_open = false;
                }
            }
        }
        self.stop(pool.take());
        imgs.send(None);
        Ok(())
    }

    fn apply(&mut self, c: ChangeRender) {
        if let Some(system) = c.system.filter(|s| !s.is_empty()) {
            match system.check() {
                Ok(()) => self.set_system(system),
                Err(err) => log::warn!("ignoring invalid system: {err}"),
            }
        }
        if let Some(camera) = c.camera {
            self.camera = camera;
        }
        if let Some(palette) = c.palette {
            self.palette = palette;
        }
        if let Some(size) = c.size {
            if let Some(mem) = size.mem() {
                log::debug!("resetting histogram to {size}, {} MiB", mem >> 20);
            }
            if let Err(err) = self.reset(size) {
                log::warn!("keeping current histogram: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::{Func, Node};

    const RED: Rgba<u16> = Rgba([0xffff, 0, 0, 0xffff]);
    const GREEN: Rgba<u16> = Rgba([0, 0xffff, 0, 0xffff]);
    const BRIGHT: ToneMap = ToneMap {
        brightness: 1e6,
        gamma: 1.,
        gamma_min: 0.,
    };

    struct Origin;
    impl Func for Origin {
        fn calc(&self, _: Point, _: &mut ChaosRng) -> Point {
            Point::default()
        }
    }

    fn origin() -> System {
        System::new(vec![Node::new(Origin)])
    }

    fn bins(r: &Render) -> Vec<[u64; 4]> {
        let h = r.hist();
        (0..h.rows())
            .flat_map(|row| (0..h.cols()).map(move |col| h.bin(col, row).unwrap().load()))
            .collect()
    }

    #[test]
    fn projection_follows_aspect() {
        let mut wide = Render::with_size(Size::new(2, 1, 1), origin()).unwrap();
        wide.palette = vec![RED, GREEN];
        let pl = Plotter::new(&wide);
        assert!(pl.plot(Point::new(-0.5, 0., 0., 0.)));
        assert!(pl.plot(Point::new(0.5, 0.49, 0., 0.5)));
        assert!(pl.plot(Point::new(0.99, -0.5, 0., 1.)));
        assert!(!pl.plot(Point::new(1., 0., 0., 0.)));
        assert!(!pl.plot(Point::new(0., 0.5, 0., 0.)));
        assert!(!pl.plot(Point::new(f64::NAN, 0., 0., 0.)));
        drop(pl);
        assert_eq!(
            bins(&wide),
            [[0xffff, 0, 0, 0xffff], [0, 0x1fffe, 0, 0x1fffe]]
        );

        let tall = Render::with_size(Size::new(1, 2, 1), origin()).unwrap();
        let pl = Plotter::new(&tall);
        assert!(pl.plot(Point::new(0.4, 0.9, 0., 0.)));
        assert!(pl.plot(Point::new(-0.5, -1., 0., 0.)));
        assert!(!pl.plot(Point::new(0.5, 0., 0., 0.)));
        assert!(!pl.plot(Point::new(0., 1., 0., 0.)));
        drop(pl);
        assert_eq!(bins(&tall)[0][3], 0xffff);
        assert_eq!(bins(&tall)[1][3], 0xffff);
    }

    #[test]
    fn camera_moves_the_window() {
        let mut r = Render::with_size(Size::new(2, 2, 1), origin()).unwrap();
        r.camera.translate(0.5, 0.5, 0.);
        r.camera.zoom(2.);
        assert_eq!(r.area(), 1.);
        let pl = Plotter::new(&r);
        // (0, 0) lands at (1, 1) in camera space, outside the window
        assert!(!pl.plot(Point::default()));
        assert!(pl.plot(Point::new(-0.5, -0.5, 0., 0.)));
    }

    #[test]
    fn palette_is_premultiplied() {
        let mut r = Render::with_size(Size::new(1, 1, 1), origin()).unwrap();
        r.palette = vec![Rgba([0xffff, 0x4000, 0, 0x8000])];
        let pl = Plotter::new(&r);
        assert!(pl.plot(Point::default()));
        drop(pl);
        assert_eq!(bins(&r), [[0x8000, 0x2000, 0, 0x8000]]);
        // a half-transparent red tone-maps like an opaque one
        let half = r.image(&BRIGHT).at(0, 0);
        let mut opaque = Render::with_size(Size::new(1, 1, 1), origin()).unwrap();
        opaque.palette = vec![RED];
        let pl = Plotter::new(&opaque);
        pl.plot(Point::default());
        drop(pl);
        assert_eq!(half[0], opaque.image(&BRIGHT).at(0, 0)[0]);
    }

    #[test]
    fn empty_palette_is_transparent() {
        let mut r = Render::with_size(Size::new(1, 1, 1), origin()).unwrap();
        r.palette.clear();
        let pl = Plotter::new(&r);
        assert!(pl.plot(Point::new(0., 0., 0., 1.)));
        drop(pl);
        assert_eq!(bins(&r), [[0; 4]]);
    }

    #[test]
    fn area() {
        let mut r = Render::with_size(Size::new(4, 2, 3), origin()).unwrap();
        assert_eq!(r.area(), 2.);
        r.camera.scale(0., 1., 1.);
        assert_eq!(r.area(), 1.);
        let empty = Render::new(Hist::default(), origin());
        assert_eq!(empty.area(), 1.);
    }

    #[test]
    fn render_stops_at_iteration_cap() {
        let mut r = Render::with_size(Size::new(1, 1, 1), origin()).unwrap();
        r.palette = vec![RED];
        r.procs = 2;
        r.iter_limit = 10_000;
        r.render(&Context::background()).unwrap();
        assert!(r.iters() >= 10_000);
        assert_eq!(r.hits(), r.iters());
        assert_eq!(bins(&r), [[r.hits() * 0xffff, 0, 0, r.hits() * 0xffff]]);
        let Rgba([red, g, b, a]) = r.image(&BRIGHT).at(0, 0);
        assert!(red > 0 && a > 0);
        assert_eq!((g, b), (0, 0));

        // continuing with a higher cap keeps the histogram
        let before = r.iters();
        r.iter_limit = before + 10_000;
        r.render(&Context::background()).unwrap();
        assert!(r.iters() >= before + 10_000);
        assert_eq!(bins(&r)[0][3], r.hits() * 0xffff);
    }

    #[test]
    fn render_stops_at_hit_cap() {
        struct Away;
        impl Func for Away {
            fn calc(&self, _: Point, _: &mut ChaosRng) -> Point {
                Point::new(5., 5., 0., 0.)
            }
        }
        let system = System::new(vec![
            Node::new(Origin),
            Node::new(Away).weight(3.),
        ]);
        let mut r = Render::with_size(Size::new(2, 2, 1), system).unwrap();
        r.procs = 3;
        r.hit_limit = 2_000;
        r.render(&Context::background()).unwrap();
        assert!(r.hits() >= 2_000);
        assert!(r.iters() > r.hits());
        let total: u64 = bins(&r).iter().map(|b| b[3]).sum();
        assert_eq!(total, r.hits() * 0xffff);
    }

    #[test]
    fn one_worker_visits_separate_basins() {
        // every trajectory is stuck on the side it starts on
        struct Basins;
        impl Func for Basins {
            fn calc(&self, p: Point, _: &mut ChaosRng) -> Point {
                let x = if p.x < 0. { -0.5 } else { 0.5 };
                Point::new(x, 0., 0., p.c)
            }
        }
        let mut r =
            Render::with_size(Size::new(2, 1, 1), System::new(vec![Node::new(Basins)])).unwrap();
        r.procs = 1;
        r.iter_limit = 64 * REFUSE_BATCHES * BATCH;
        r.render(&Context::background()).unwrap();
        let b = bins(&r);
        assert!(b[0][3] > 0 && b[1][3] > 0, "{b:?}");
    }

    #[test]
    fn render_stops_on_cancel() {
        let mut r = Render::with_size(Size::new(8, 8, 1), origin()).unwrap();
        r.procs = 2;
        let (ctx, _token) = Context::with_timeout(Duration::from_millis(50));
        let start = Instant::now();
        r.render(&ctx).unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(r.iters() > 0);

        let (ctx, token) = Context::new();
        token.cancel();
        let mut fresh = Render::with_size(Size::new(1, 1, 1), origin()).unwrap();
        fresh.render(&ctx).unwrap();
        assert_eq!(fresh.iters(), 0);
    }

    #[test]
    fn render_checks_system() {
        let mut r = Render::with_size(Size::new(1, 1, 1), System::default()).unwrap();
        assert!(matches!(
            r.render(&Context::background()),
            Err(RenderError::System(SystemError::Empty))
        ));
        assert_eq!(r.iters(), 0);
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn worker_panics_propagate() {
        struct Boom;
        impl Func for Boom {
            fn calc(&self, _: Point, _: &mut ChaosRng) -> Point {
                panic!("boom");
            }
        }
        let mut r = Render::with_size(Size::new(1, 1, 1), System::new(vec![Node::new(Boom)]))
            .unwrap();
        r.procs = 1;
        r.iter_limit = 1;
        let _ = r.render(&Context::background());
    }

    #[test]
    fn merge_keeps_latest_fields() {
        let a = ChangeRender {
            size: Some(Size::new(4, 4, 1)),
            palette: Some(vec![RED]),
            procs: 2,
            ..ChangeRender::default()
        };
        let b = ChangeRender {
            palette: Some(vec![GREEN]),
            ..ChangeRender::default()
        };
        let c = a.merge(b);
        assert_eq!(c.size, Some(Size::new(4, 4, 1)));
        assert_eq!(c.palette, Some(vec![GREEN]));
        assert_eq!(c.procs, 0);
        assert!(c.system.is_none() && c.camera.is_none());
    }

    fn request(w: u32, h: u32) -> PlotRequest {
        PlotRequest {
            width: w,
            height: h,
            filter: FilterType::Triangle,
            tone_map: BRIGHT,
            background: Rgba([0; 4]),
        }
    }

    /// Send plot requests until an image satisfying `f` arrives.
    fn plot_until(
        plot: &channel::Sender<PlotRequest>,
        rx: &mut watch::WatchReceiver<Option<Arc<Frame>>>,
        req: PlotRequest,
        f: impl Fn(&Frame) -> bool,
    ) -> Arc<Frame> {
        let start = Instant::now();
        loop {
            assert!(start.elapsed() < Duration::from_secs(10), "no matching plot");
            plot.send(req).unwrap();
            if let Some(Some(img)) = rx.wait_timeout(Duration::from_millis(100)) {
                if f(&img) {
                    return img;
                }
            }
        }
    }

    fn wait_paused(p: &Progress) {
        let start = Instant::now();
        loop {
            assert!(start.elapsed() < Duration::from_secs(10), "did not pause");
            let a = p.iters();
            thread::sleep(Duration::from_millis(30));
            if p.iters() == a {
                return;
            }
        }
    }

    #[test]
    fn render_async_lifecycle() {
        let mut r = Render::new(Hist::default(), System::default());
        let progress = r.progress();
        let (ctx, token) = Context::new();
        let (change_tx, change_rx) = channel::unbounded();
        let (plot_tx, plot_rx) = channel::unbounded();
        let (imgs, mut rx) = watch::channel(None);

        thread::scope(|s| {
            let h = s.spawn(|| r.render_async(&ctx, change_rx, plot_rx, &imgs));

            change_tx
                .send(ChangeRender {
                    system: Some(origin()),
                    palette: Some(vec![RED]),
                    size: Some(Size::new(1, 1, 1)),
                    procs: 4,
                    ..ChangeRender::default()
                })
                .unwrap();
            let img = plot_until(&plot_tx, &mut rx, request(1, 1), |img| {
                img.get_pixel(0, 0)[3] > 0
            });
            let Rgba([red, g, b, _]) = *img.get_pixel(0, 0);
            assert!(red > 0);
            assert_eq!((g, b), (0, 0));
            let a = progress.iters();
            thread::sleep(Duration::from_millis(30));
            assert!(progress.iters() > a, "workers stopped after plotting");

            // pause keeps progress
            change_tx.send(ChangeRender::default()).unwrap();
            wait_paused(&progress);
            let paused = progress.iters();
            assert!(paused > 0);
            thread::sleep(Duration::from_millis(50));
            assert_eq!(progress.iters(), paused);

            // grow, then shrink while running; a stale worker would plot out
            // of bounds and panic
            change_tx
                .send(ChangeRender {
                    size: Some(Size::new(2, 2, 2)),
                    procs: 2,
                    ..ChangeRender::default()
                })
                .unwrap();
            plot_until(&plot_tx, &mut rx, request(2, 2), |img| {
                img.dimensions() == (2, 2) && img.pixels().any(|p| p[3] > 0)
            });
            change_tx
                .send(ChangeRender {
                    size: Some(Size::new(1, 1, 1)),
                    procs: 3,
                    ..ChangeRender::default()
                })
                .unwrap();
            plot_until(&plot_tx, &mut rx, request(4, 4), |img| {
                img.dimensions() == (4, 4) && img.pixels().all(|p| p[0] > 0)
            });

            token.cancel();
            h.join().unwrap().unwrap();
        });
        assert!(rx.get().is_none());
        // joined, so the histogram is exclusively ours again
        assert_eq!(r.hist_mut().len(), 1);
    }

    #[test]
    fn render_async_ends_when_requesters_leave() {
        let mut r = Render::with_size(Size::new(1, 1, 1), origin()).unwrap();
        r.procs = 1;
        let (change_tx, change_rx) = channel::unbounded::<ChangeRender>();
        let (plot_tx, plot_rx) = channel::unbounded::<PlotRequest>();
        let (imgs, mut rx) = watch::channel(Some(Arc::new(Frame::new(1, 1))));
        drop((change_tx, plot_tx));
        r.render_async(&Context::background(), change_rx, plot_rx, &imgs)
            .unwrap();
        assert!(rx.get().is_none());
    }

    #[test]
    fn render_async_ignores_invalid_systems() {
        let mut r = Render::with_size(Size::new(1, 1, 1), origin()).unwrap();
        let (ctx, token) = Context::new();
        let (change_tx, change_rx) = channel::unbounded();
        let (plot_tx, plot_rx) = channel::unbounded();
        let (imgs, mut rx) = watch::channel(None);
        thread::scope(|s| {
            let h = s.spawn(|| r.render_async(&ctx, change_rx, plot_rx, &imgs));
            change_tx
                .send(ChangeRender {
                    system: Some(System::new(vec![Node::new(Origin).weight(-1.)])),
                    procs: 1,
                    ..ChangeRender::default()
                })
                .unwrap();
            plot_until(&plot_tx, &mut rx, request(1, 1), |img| {
                img.get_pixel(0, 0)[3] > 0
            });
            token.cancel();
            h.join().unwrap().unwrap();
        });
        assert_eq!(r.system().nodes[0].weight, 1.);
    }
}
