use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::exit;
use std::str::FromStr;
use std::time::Duration;

use clap::{Arg, ArgAction, ArgGroup, ArgMatches, Command, ValueHint};
use crossbeam::channel;
#[cfg(feature = "png")]
use image::codecs::png;
use image::codecs::{bmp, pnm};
use image::imageops::FilterType;
use image::{DynamicImage, ImageBuffer, Rgba};

use flame_renderer::config::Config;
use flame_renderer::variations::Registry;
use flame_renderer::{Context, Size, ToneMap};

/// validate that a argument passed by the user is valid, according to the parsing of type `T`.
fn parse_validate<T: FromStr>(s: &str) -> Result<T, String>
where
    <T as FromStr>::Err: ToString,
{
    s.parse().map_err(|e: T::Err| e.to_string())
}
fn parse_positive(s: &str) -> Result<f64, String> {
    let v = parse_validate::<f64>(s)?;
    if v > 0. && v.is_finite() {
        Ok(v)
    } else {
        Err("must be positive".to_owned())
    }
}
/// `r,g,b` or `r,g,b,a`, each a 16-bit channel.
fn parse_color(s: &str) -> Result<Rgba<u16>, String> {
    let channels = s
        .split(',')
        .map(|c| parse_validate::<u16>(c.trim()))
        .collect::<Result<Vec<_>, _>>()?;
    match channels[..] {
        [r, g, b] => Ok(Rgba([r, g, b, 0xffff])),
        [r, g, b, a] => Ok(Rgba([r, g, b, a])),
        _ => Err("expected 3 or 4 comma-separated channels".to_owned()),
    }
}
fn filter(name: &str) -> FilterType {
    match name {
        "nearest" => FilterType::Nearest,
        "triangle" => FilterType::Triangle,
        "catmull-rom" => FilterType::CatmullRom,
        "gaussian" => FilterType::Gaussian,
        "lanczos3" => FilterType::Lanczos3,
        _ => unreachable!("clap validation should not allow any other values. Please report bug."),
    }
}

/// Print `err` and exit.
fn fail(err: impl std::fmt::Display) -> ! {
    eprintln!("{err}");
    exit(1);
}

/// helper to write file using a generic encoder (e.g. PNG, BMP)
fn write_image(encoder: impl image::ImageEncoder, image: &DynamicImage) -> image::ImageResult<()> {
    encoder.write_image(
        image.as_bytes(),
        image.width(),
        image.height(),
        image.color().into(),
    )
}
/// Write image in the format the user asked for.
fn write_image_matches(
    image: ImageBuffer<Rgba<u16>, Vec<u16>>,
    matches: &ArgMatches,
    mut name: PathBuf,
) -> image::ImageResult<PathBuf> {
    let image = DynamicImage::ImageRgba16(image);

    log::info!("Converting image format.");
    let image = match (matches.get_flag("transparent"), matches.get_flag("8bit")) {
        (true, false) => image,
        (false, false) => image.to_rgb16().into(),
        (true, true) => image.to_rgba8().into(),
        (false, true) => image.to_rgb8().into(),
    };

    // writing file, depending on extension.
    if matches.get_flag("pam") {
        name.set_extension("pam");
        let mut file = file(&name)?;
        let codec = pnm::PnmEncoder::new(&mut file).with_subtype(pnm::PnmSubtype::ArbitraryMap);
        write_image(codec, &image)?;
        file.flush()?;
        return Ok(name);
    } else if matches.get_flag("bmp") {
        name.set_extension("bmp");
        let mut file = file(&name)?;
        let encoder = bmp::BmpEncoder::new(&mut file);
        write_image(encoder, &image)?;
        file.flush()?;
        return Ok(name);
    }
    #[cfg(feature = "png")]
    {
        name.set_extension("png");
        let mut file = file(&name)?;
        let codec = png::PngEncoder::new_with_quality(
            &mut file,
            png::CompressionType::Default,
            png::FilterType::Adaptive,
        );
        write_image(codec, &image)?;
        file.flush()?;
        Ok(name)
    }
    #[cfg(not(feature = "png"))]
    {
        fail("Please specify an image format.")
    }
}
/// Open a buffered writeable file at `path`.
fn file(path: impl AsRef<Path>) -> io::Result<BufWriter<File>> {
    File::create(path).map(BufWriter::new)
}

fn main() {
    let brightness_help =
        "Multiplier on log density. You generally want to increase this for sparse flames.";
    let threshold_help = "Densities below this, relative to the iterations per pixel, are blended towards linear instead of gamma corrected.";

    let mut command = Command::new("flame-renderer")
        .about("Render fractal flames with the chaos game.")
        .arg(
            Arg::new("preset")
                .long("preset")
                .short('p')
                .help("Which built-in flame to render")
                .value_parser(clap::builder::PossibleValuesParser::new(Config::PRESETS))
                .default_value("sierpinski"),
        )
        .arg(
            Arg::new("8bit")
                .long("8-bit")
                .short('8')
                .action(ArgAction::SetTrue)
                .help("Write image in an 8-bit format"),
        )
        .arg(
            Arg::new("transparent")
                .long("transparent")
                .short('t')
                .action(ArgAction::SetTrue)
                .help("Keep the alpha channel. Without --background, the background is transparent."),
        )
        .arg(
            Arg::new("iterations")
                .long("iterations")
                .short('i')
                .value_hint(ValueHint::Other)
                .help("Number of iterations. 0 renders until --duration or --hits is reached.")
                .value_parser(parse_validate::<u64>)
                .default_value("10000000"),
        )
        .arg(
            Arg::new("hits")
                .long("hits")
                .value_hint(ValueHint::Other)
                .help("Stop after plotting this many points")
                .value_parser(parse_validate::<u64>),
        )
        .arg(
            Arg::new("duration")
                .long("duration")
                .short('d')
                .value_hint(ValueHint::Other)
                .help("Stop after this many seconds")
                .value_parser(parse_positive),
        )
        .arg(
            Arg::new("width")
                .long("width")
                .short('w')
                .value_hint(ValueHint::Other)
                .help("Width of image")
                .value_parser(parse_validate::<usize>)
                .default_value("1920"),
        )
        .arg(
            Arg::new("height")
                .long("height")
                .short('v')
                .value_hint(ValueHint::Other)
                .help("Height of image")
                .value_parser(parse_validate::<usize>)
                .default_value("1080"),
        )
        .arg(
            Arg::new("osa")
                .long("osa")
                .value_hint(ValueHint::Other)
                .help("Oversampling: histogram bins per pixel along each axis. Memory grows with its square.")
                .value_parser(parse_validate::<usize>)
                .default_value("1"),
        )
        .arg(
            Arg::new("procs")
                .long("procs")
                .short('j')
                .value_hint(ValueHint::Other)
                .help("Worker threads. 0 uses one per CPU.")
                .value_parser(parse_validate::<usize>)
                .default_value("0"),
        )
        .arg(
            Arg::new("brightness")
                .long("brightness")
                .short('b')
                .help(brightness_help)
                .value_hint(ValueHint::Other)
                .value_parser(parse_validate::<f64>),
        )
        .arg(
            Arg::new("gamma")
                .long("gamma")
                .short('g')
                .help("Gamma correction")
                .value_hint(ValueHint::Other)
                .value_parser(parse_positive),
        )
        .arg(
            Arg::new("threshold")
                .long("threshold")
                .help(threshold_help)
                .value_hint(ValueHint::Other)
                .value_parser(parse_validate::<f64>),
        )
        .arg(
            Arg::new("background")
                .long("background")
                .help("Background color, as 16-bit r,g,b or r,g,b,a")
                .value_hint(ValueHint::Other)
                .value_parser(parse_color),
        )
        .arg(
            Arg::new("resample")
                .long("resample")
                .help("Filter to downsample the oversampled histogram with")
                .value_parser(clap::builder::PossibleValuesParser::new([
                    "nearest",
                    "triangle",
                    "catmull-rom",
                    "gaussian",
                    "lanczos3",
                ]))
                .default_value("catmull-rom"),
        )
        .group(
            ArgGroup::new("format")
                .arg("pam")
                .arg("bmp")
                .requires("8bit"),
        )
        .arg(
            Arg::new("pam")
                .long("pam")
                .action(ArgAction::SetTrue)
                .help("Use PAM format, a bitmap-like format. 16-bit images are not supported.")
                .alias("pnm")
                .alias("pbm"),
        )
        .arg(
            Arg::new("bmp")
                .long("bmp")
                .action(ArgAction::SetTrue)
                .help("Use BMP format. 16-bit images are not supported.")
                .alias("bitmap"),
        )
        .arg(
            Arg::new("name")
                .long("file-name")
                .short('o')
                .help("Write to file name")
                .value_hint(ValueHint::FilePath)
                .default_value("flame"),
        )
        .arg(
            Arg::new("dump")
                .long("raw-histogram-dump")
                .help("Also write the raw histogram to this file")
                .value_hint(ValueHint::FilePath),
        )
        .arg(
            Arg::new("silent")
                .long("silent")
                .short('q')
                .action(ArgAction::SetTrue)
                .help("Decrease verbosity"),
        );

    // shell completion things
    #[cfg(feature = "complete")]
    {
        command = clap_autocomplete::add_subcommand(command);
    }

    // shell completion things
    #[cfg(feature = "complete")]
    let command_copy = command.clone();

    let matches = command.get_matches();

    // shell completion things
    #[cfg(feature = "complete")]
    match clap_autocomplete::test_subcommand(&matches, command_copy) {
        Some(Ok(())) => {
            exit(1);
        }
        Some(Err(err)) => {
            eprintln!("Insufficient permissions, consider using --print flag: {err}");
            exit(1);
        }
        None => {}
    }

    let silent = matches.get_flag("silent");
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if silent { "warn" } else { "info" }),
    )
    .init();

    let registry = Registry::with_defaults();
    let preset = matches
        .get_one::<String>("preset")
        .expect("we have provided a default value");
    let Some(inherit) = Config::preset(preset, &registry) else {
        unreachable!("clap validation should not allow any other values. Please report bug.")
    };

    run(inherit, &matches);
}

fn run(inherit: Config, matches: &ArgMatches) {
    // construct config
    let tone_map = ToneMap {
        brightness: matches
            .get_one("brightness")
            .copied()
            .unwrap_or(inherit.tone_map.brightness),
        gamma: matches
            .get_one("gamma")
            .copied()
            .unwrap_or(inherit.tone_map.gamma),
        gamma_min: matches
            .get_one("threshold")
            .copied()
            .unwrap_or(inherit.tone_map.gamma_min),
    };
    let background = match matches.get_one::<Rgba<u16>>("background") {
        Some(c) => *c,
        None if matches.get_flag("transparent") => Rgba([0; 4]),
        None => inherit.background,
    };
    let config = Config {
        size: Size::new(
            *matches.get_one("width").expect("we have a default value"),
            *matches.get_one("height").expect("we have a default value"),
            *matches.get_one("osa").expect("we have a default value"),
        ),
        iterations: *matches
            .get_one("iterations")
            .expect("we have a default value"),
        hits: matches.get_one("hits").copied().unwrap_or(0),
        tone_map,
        background,
        filter: filter(
            matches
                .get_one::<String>("resample")
                .expect("we have a default value"),
        ),
        ..inherit
    };
    let size = config.size;
    if size.is_empty() {
        fail("Width, height and oversampling must be positive.");
    }
    if config.iterations == 0 && config.hits == 0 && !matches.contains_id("duration") {
        fail("Specify at least one of --iterations, --hits and --duration.");
    }
    match size.mem() {
        Some(mem) => log::info!("Histogram {size} needs about {} MiB.", mem >> 20),
        None => fail(format!("Histogram {size} does not fit in memory.")),
    }

    // get output file name
    let name = {
        let path = Path::new(
            matches
                .get_one::<String>("name")
                .expect("We provided a default value."),
        );
        let mut name = PathBuf::new();
        name.push(path.parent().unwrap_or_else(|| Path::new("/")));
        if let Some(stem) = path.file_stem() {
            name.push(stem);
        }
        name
    };

    let (mut render, req) = config.into_render().unwrap_or_else(|err| fail(err));
    render.procs = *matches.get_one("procs").expect("we have a default value");

    let (ctx, _token) = match matches.get_one::<f64>("duration") {
        Some(&secs) => Context::with_timeout(Duration::from_secs_f64(secs)),
        None => Context::new(),
    };

    // render, reporting progress every second
    let progress = render.progress();
    let (done_tx, done_rx) = channel::bounded::<()>(0);
    let result = std::thread::scope(|s| {
        s.spawn(|| {
            while let Err(channel::RecvTimeoutError::Timeout) =
                done_rx.recv_timeout(Duration::from_secs(1))
            {
                log::info!("{} iterations, {} hits", progress.iters(), progress.hits());
            }
        });
        let result = render.render(&ctx);
        drop(done_tx);
        result
    });
    if let Err(err) = result {
        fail(err);
    }
    log::info!(
        "Rendering complete: {} iterations, {} hits.",
        render.iters(),
        render.hits()
    );

    if let Some(path) = matches.get_one::<String>("dump") {
        let written = file(path).and_then(|mut f| {
            let n = render.hist_mut().write_to(&mut f)?;
            f.flush()?;
            Ok(n)
        });
        match written {
            Ok(n) => log::info!("Wrote {n} bytes of histogram to '{path}'."),
            Err(err) => fail(format!("Failed to write histogram to '{path}': {err}")),
        }
    }

    log::info!("Tone mapping.");
    let image = render.plot_onto(&req);
    match write_image_matches(image, matches, name) {
        Ok(name) => println!("Wrote image to '{}'.", name.display()),
        Err(err) => fail(format!("Failed to write image: {err}")),
    }
}
