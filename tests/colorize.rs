use std::io::Cursor;
use std::path::PathBuf;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use ndarray::ArrayD;

use colorizer::color::rgb_to_lab;
use colorizer::model::{
    save_checkpoint, ColorizationNet, Init, KeyLayout, ParameterSource, RandomSource,
};
use colorizer::image::finalize;
use colorizer::{Colorizer, Config, Error, LoadPolicy, LoadStatus, Result};

const BASE_CHANNELS: usize = 4;
const IMAGE_SIZE: u32 = 32;

/// Random parameters except for a zeroed output head, so predicted chrominance is exactly 0.
struct NeutralHead(RandomSource);

impl ParameterSource for NeutralHead {
    fn tensor(&mut self, name: &str, shape: &[usize], init: Init) -> Result<ArrayD<f32>> {
        if name.starts_with("out_conv.") {
            self.0.tensor(name, shape, Init::Zeros)
        } else {
            self.0.tensor(name, shape, init)
        }
    }
}

fn untrained() -> LoadStatus {
    LoadStatus::Missing {
        path: PathBuf::from("absent.safetensors"),
    }
}

fn random_colorizer(seed: u64) -> Colorizer {
    let net = ColorizationNet::random(BASE_CHANNELS, Some(seed)).unwrap();
    Colorizer::with_model(net, untrained(), IMAGE_SIZE).unwrap()
}

fn encode(img: RgbImage, format: ImageFormat) -> Vec<u8> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), format)
        .unwrap();
    buf
}

fn decode_rgb(bytes: &[u8]) -> RgbImage {
    assert_eq!(image::guess_format(bytes).unwrap(), ImageFormat::Png);
    image::load_from_memory(bytes).unwrap().to_rgb8()
}

fn pixel_lab(pixel: Rgb<u8>) -> [f32; 3] {
    rgb_to_lab(pixel.0.map(|c| f32::from(c) / 255.0))
}

#[test]
fn mid_gray_round_trips_through_neutral_network() {
    let mut source = NeutralHead(RandomSource::new(Some(1)));
    let net = ColorizationNet::load(&mut source, BASE_CHANNELS).unwrap();
    let colorizer = Colorizer::with_model(net, untrained(), IMAGE_SIZE).unwrap();

    let gray = RgbImage::from_pixel(64, 64, Rgb([128, 128, 128]));
    let expected_l = pixel_lab(Rgb([128, 128, 128]))[0];

    let prepared = colorizer.prepare(&encode(gray, ImageFormat::Png)).unwrap();
    assert_eq!(prepared.original_size, (64, 64));
    let chrominance = colorizer.predict(&prepared.luminance).unwrap();
    assert!(chrominance.iter().all(|&v| v == 0.0));

    let png = finalize(&prepared.luminance, &chrominance, prepared.original_size).unwrap();
    let out = decode_rgb(&png);
    assert_eq!(out.dimensions(), (64, 64));

    for pixel in out.pixels() {
        let [l, a, b] = pixel_lab(*pixel);
        assert!((l - expected_l).abs() < 1.0, "L {l} vs {expected_l}");
        assert!(a.abs() < 1.0 && b.abs() < 1.0, "a {a}, b {b}");
    }
}

#[test]
fn mid_gray_with_random_weights_stays_in_range() {
    let colorizer = random_colorizer(2);
    let gray = RgbImage::from_pixel(64, 64, Rgb([128, 128, 128]));

    let out = decode_rgb(&colorizer.colorize(&encode(gray, ImageFormat::Png)).unwrap());
    assert_eq!(out.dimensions(), (64, 64));

    for pixel in out.pixels() {
        let [l, a, b] = pixel_lab(*pixel);
        assert!((-0.01..=100.01).contains(&l), "L {l}");
        assert!(a.abs() <= 128.0 && b.abs() <= 128.0, "a {a}, b {b}");
    }
}

#[test]
fn output_matches_input_dimensions() {
    let colorizer = random_colorizer(3);

    for (width, height) in [(1, 1), (17, 33), (100, 7), (64, 64), (31, 250)] {
        #[allow(clippy::cast_possible_truncation)]
        let img = RgbImage::from_fn(width, height, |x, y| {
            let v = ((x * 7 + y * 3) % 256) as u8;
            Rgb([v, v, v])
        });
        let out = decode_rgb(&colorizer.colorize(&encode(img, ImageFormat::Png)).unwrap());
        assert_eq!(out.dimensions(), (width, height));
    }
}

#[test]
fn jpeg_input_is_accepted() {
    let colorizer = random_colorizer(4);
    let img = RgbImage::from_fn(40, 30, |x, _| {
        #[allow(clippy::cast_possible_truncation)]
        let v = (x * 6) as u8;
        Rgb([v, v, v])
    });

    let out = decode_rgb(&colorizer.colorize(&encode(img, ImageFormat::Jpeg)).unwrap());
    assert_eq!(out.dimensions(), (40, 30));
}

#[test]
#[allow(clippy::cast_possible_truncation)]
fn inference_is_deterministic() {
    let colorizer = random_colorizer(5);
    let img = RgbImage::from_fn(48, 20, |x, y| {
        Rgb([(x * 5) as u8, (y * 9) as u8, 90])
    });
    let input = encode(img, ImageFormat::Png);

    let prepared = colorizer.prepare(&input).unwrap();
    let first = colorizer.predict(&prepared.luminance).unwrap();
    let second = colorizer.clone().predict(&prepared.luminance).unwrap();
    assert_eq!(first, second);

    assert_eq!(colorizer.colorize(&input).unwrap(), colorizer.colorize(&input).unwrap());
}

#[test]
fn concurrent_calls_share_parameters() {
    let colorizer = random_colorizer(6);
    let input = encode(RgbImage::from_pixel(24, 24, Rgb([60, 60, 60])), ImageFormat::Png);
    let expected = colorizer.colorize(&input).unwrap();

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| colorizer.colorize(&input).unwrap()))
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), expected);
        }
    });
}

#[test]
fn checkpoint_is_loaded_through_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("colorizer.safetensors");
    let net = ColorizationNet::random(BASE_CHANNELS, Some(7)).unwrap();
    save_checkpoint(&net, &path, KeyLayout::ModelStateDict).unwrap();

    let config = Config {
        image_size: IMAGE_SIZE,
        base_channels: BASE_CHANNELS,
        checkpoint: path.clone(),
        load_policy: LoadPolicy::Strict,
        seed: None,
    };
    let colorizer = Colorizer::new(config).unwrap();

    assert!(colorizer.model_loaded());
    assert_eq!(
        colorizer.status(),
        &LoadStatus::Loaded {
            path,
            layout: KeyLayout::ModelStateDict
        }
    );

    let reference = Colorizer::with_model(net, untrained(), IMAGE_SIZE).unwrap();
    let input = encode(RgbImage::from_pixel(20, 20, Rgb([200, 200, 200])), ImageFormat::Png);
    assert_eq!(
        colorizer.colorize(&input).unwrap(),
        reference.colorize(&input).unwrap()
    );
}

#[test]
fn mismatched_checkpoint_degrades_unless_strict() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("narrow.safetensors");
    save_checkpoint(&ColorizationNet::random(2, Some(0)).unwrap(), &path, KeyLayout::Bare).unwrap();

    let config = Config {
        image_size: IMAGE_SIZE,
        base_channels: BASE_CHANNELS,
        checkpoint: path,
        load_policy: LoadPolicy::Permissive,
        seed: Some(0),
    };

    let colorizer = Colorizer::new(config.clone()).unwrap();
    assert!(!colorizer.model_loaded());
    assert!(matches!(colorizer.status(), LoadStatus::Failed { .. }));
    let input = encode(RgbImage::from_pixel(16, 16, Rgb([10, 10, 10])), ImageFormat::Png);
    assert!(colorizer.colorize(&input).is_ok());

    let strict = Config {
        load_policy: LoadPolicy::Strict,
        ..config
    };
    assert!(matches!(
        Colorizer::new(strict),
        Err(Error::Checkpoint { .. })
    ));
}
