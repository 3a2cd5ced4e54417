//! Built-in flames and the settings to render them.

use image::imageops::FilterType;
use image::Rgba;

use crate::render::PlotRequest;
use crate::variations::{AffineFunc, Blur, Registry, Rotate, Swirl, Then};
use crate::{Affine, Func, Node, Render, RenderError, Size, System, ToneMap};

/// Evenly interpolate `len` colors through `stops`.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn gradient(stops: &[Rgba<u16>], len: usize) -> Vec<Rgba<u16>> {
    match stops {
        [] => Vec::new(),
        [c] => vec![*c; len],
        _ => (0..len)
            .map(|i| {
                let t = if len == 1 {
                    0.
                } else {
                    i as f64 / (len - 1) as f64 * (stops.len() - 1) as f64
                };
                let lo = (t as usize).min(stops.len() - 2);
                let f = t - lo as f64;
                let (a, b) = (stops[lo].0, stops[lo + 1].0);
                Rgba(std::array::from_fn(|k| {
                    (f64::from(a[k]) + (f64::from(b[k]) - f64::from(a[k])) * f).round() as u16
                }))
            })
            .collect(),
    }
}

/// Everything needed to render one image.
#[derive(Debug)]
pub struct Config {
    pub system: System,
    pub camera: Affine,
    pub palette: Vec<Rgba<u16>>,
    pub size: Size,
    /// Iterations to render. `0` renders until cancelled.
    pub iterations: u64,
    /// Plotted points to render. `0` disables the cap.
    pub hits: u64,
    pub tone_map: ToneMap,
    pub background: Rgba<u16>,
    pub filter: FilterType,
}
impl Config {
    /// Names accepted by [`Self::preset`].
    pub const PRESETS: [&'static str; 2] = ["sierpinski", "spherical-swirl"];

    fn with_system(system: System) -> Self {
        Self {
            system,
            camera: Affine::eye(),
            palette: gradient(
                &[
                    Rgba([0xffff, 0x2000, 0x1000, 0xffff]),
                    Rgba([0xffff, 0xd000, 0x4000, 0xffff]),
                    Rgba([0x3000, 0x8000, 0xffff, 0xffff]),
                ],
                256,
            ),
            size: Size::new(1920, 1080, 1),
            iterations: 50_000_000,
            hits: 0,
            tone_map: ToneMap {
                brightness: 1.,
                gamma: 2.2,
                gamma_min: 0.,
            },
            background: Rgba([0, 0, 0, 0xffff]),
            filter: FilterType::CatmullRom,
        }
    }

    /// A built-in flame by name, constructing functions from `registry`.
    #[must_use]
    pub fn preset(name: &str, registry: &Registry) -> Option<Self> {
        match name {
            "sierpinski" => Some(Self::sierpinski()),
            "spherical-swirl" => Self::spherical_swirl(registry),
            _ => None,
        }
    }

    /// The Sierpiński triangle: three half-size copies of the plane.
    #[must_use]
    pub fn sierpinski() -> Self {
        let corners = [(0., -0.9, 0.), (-0.9, 0.8, 0.5), (0.9, 0.8, 1.)];
        let nodes = corners
            .into_iter()
            .map(|(x, y, color)| {
                let mut t = Affine::eye();
                t.scale(0.5, 0.5, 0.5).translate(x * 0.5, y * 0.5, 0.);
                Node::new(AffineFunc::new(t, color))
            })
            .collect();
        Self::with_system(System::new(nodes))
    }

    /// Spherical and sinusoidal copies with a little swirl. `None` if
    /// `registry` lacks `spherical` or `sinusoidal`.
    #[must_use]
    pub fn spherical_swirl(registry: &Registry) -> Option<Self> {
        let then = |t: Affine, color: f64, f: Box<dyn Func>| -> Node {
            Node::new(Then(vec![Box::new(AffineFunc::new(t, color)) as Box<dyn Func>, f]))
        };

        let mut inner = Affine::eye();
        inner.rot_z(0.5).zoom(0.9).translate(0.4, 0., 0.);
        let mut outer = Affine::eye();
        outer.scale(0.6, 0.6, 1.).translate(-0.3, 0.3, 0.);
        let mut swirl = AffineFunc::new(Affine::eye(), 0.5);
        swirl.blend = 0.2;

        let system = System::new(vec![
            then(inner, 0., registry.make("spherical")?).label("inversion"),
            then(outer, 1., registry.make("sinusoidal")?)
                .weight(0.7)
                .graph(vec![1., 0.5, 1., 1.])
                .label("bounds"),
            Node::new(Then(vec![
                Box::new(swirl) as Box<dyn Func>,
                Box::new(Swirl { strength: 0.5 }),
            ]))
            .weight(0.3)
            .opacity(0.6)
            .label("swirl"),
            Node::new(Blur { amount: 0.05 })
                .weight(0.05)
                .opacity(0.)
                .label("jitter"),
        ])
        .with_final(Rotate::new(0.3));

        let mut config = Self::with_system(system);
        config.camera.zoom(0.8);
        Some(config)
    }

    /// Build a render and the request to turn it into a final image.
    ///
    /// # Errors
    ///
    /// Returns an error if the system is invalid or the histogram would not
    /// fit in memory.
    pub fn into_render(self) -> Result<(Render, PlotRequest), RenderError> {
        self.system.check()?;
        let req = PlotRequest {
            width: u32::try_from(self.size.w).unwrap_or(u32::MAX),
            height: u32::try_from(self.size.h).unwrap_or(u32::MAX),
            filter: self.filter,
            tone_map: self.tone_map,
            background: self.background,
        };
        let mut render = Render::with_size(self.size, self.system)?;
        render.camera = self.camera;
        render.palette = self.palette;
        render.iter_limit = self.iterations;
        render.hit_limit = self.hits;
        Ok((render, req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Context;

    #[test]
    fn gradients() {
        let black = Rgba([0, 0, 0, 0xffff]);
        let white = Rgba([0xffff; 4]);
        assert!(gradient(&[], 4).is_empty());
        assert_eq!(gradient(&[white], 3), [white; 3]);
        assert_eq!(gradient(&[black, white], 1), [black]);
        let g = gradient(&[black, white], 3);
        assert_eq!(g, [black, Rgba([0x8000, 0x8000, 0x8000, 0xffff]), white]);
        let g = gradient(&[black, white, black], 5);
        assert_eq!((g[0], g[2], g[4]), (black, white, black));
    }

    #[test]
    fn presets_are_valid() {
        let registry = Registry::with_defaults();
        for name in Config::PRESETS {
            let config = Config::preset(name, &registry).unwrap();
            assert_eq!(config.system.check(), Ok(()), "{name}");
            assert_eq!(config.palette.len(), 256);
        }
        assert!(Config::preset("mandelbrot", &registry).is_none());
        assert!(Config::spherical_swirl(&Registry::new()).is_none());
    }

    #[test]
    fn presets_render() {
        let registry = Registry::with_defaults();
        for name in Config::PRESETS {
            let mut config = Config::preset(name, &registry).unwrap();
            config.size = Size::new(16, 16, 2);
            config.iterations = 20_000;
            let (mut render, req) = config.into_render().unwrap();
            render.procs = 2;
            render.render(&Context::background()).unwrap();
            assert!(render.hits() > 0, "{name} plotted nothing");
            let img = render.plot_onto(&req);
            assert_eq!(img.dimensions(), (16, 16));
        }
    }

    #[test]
    fn sierpinski_stays_in_view() {
        let mut config = Config::sierpinski();
        config.size = Size::new(8, 8, 1);
        config.iterations = 10_000;
        let (mut render, _) = config.into_render().unwrap();
        render.procs = 1;
        render.render(&Context::background()).unwrap();
        assert_eq!(render.hits(), render.iters());
    }
}
