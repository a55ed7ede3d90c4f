use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use yolo_head::detection::metrics::HeadMetrics;
use yolo_head::{load_weights_best_effort, Config, DetectionModel, GroundTruth, GroundTruthBox};

/// Trains the detection heads for a few steps on synthetic feature maps.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Safetensors checkpoint loaded before training, skipping incompatible tensors
    #[arg(long, value_name = "PATH")]
    weights: Option<std::path::PathBuf>,
    #[arg(long, default_value_t = 256)]
    image_size: usize,
    #[arg(long, default_value_t = 80)]
    num_classes: usize,
    #[arg(long, default_value_t = 2)]
    batch_size: usize,
    #[arg(long, default_value_t = 5)]
    steps: usize,
    #[arg(long, default_value_t = 1e-3)]
    learning_rate: f64,
    #[arg(long, default_value_t = 0.5)]
    confidence_threshold: f32,
}

fn synthetic_truth(batch_size: usize, num_classes: usize) -> GroundTruth {
    let boxes = (0..batch_size)
        .flat_map(|b| {
            [
                GroundTruthBox {
                    batch_index: b,
                    class_label: 0,
                    cx: 0.3,
                    cy: 0.4,
                    w: 0.2,
                    h: 0.3,
                },
                GroundTruthBox {
                    batch_index: b,
                    class_label: (b + 1) % num_classes,
                    cx: 0.7,
                    cy: 0.6,
                    w: 0.5,
                    h: 0.4,
                },
            ]
        })
        .collect();
    GroundTruth::new(boxes)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config {
        image_size: args.image_size,
        num_classes: args.num_classes,
        confidence_threshold: args.confidence_threshold,
        ..Config::default()
    };
    config.validate()?;

    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let mut model = DetectionModel::new(&config, vb)?;
    info!(
        image_size = config.image_size,
        num_classes = config.num_classes,
        "model built"
    );

    if let Some(path) = &args.weights {
        let report = load_weights_best_effort(&varmap, path, &device)?;
        info!(loaded = report.loaded.len(), "checkpoint applied");
    }

    let feature_map = |scale: usize| {
        let grid = config.image_size / (8 << scale);
        let shape = (args.batch_size, config.feature_channels[scale], grid, grid);
        Tensor::randn(0f32, 1.0, shape, &device)
    };
    let features = [feature_map(0)?, feature_map(1)?, feature_map(2)?];
    let truth = synthetic_truth(args.batch_size, config.num_classes);

    let params = ParamsAdamW {
        lr: args.learning_rate,
        ..Default::default()
    };
    let mut optimizer = AdamW::new(varmap.all_vars(), params)?;

    info!(steps = args.steps, "starting training");
    for step in 0..args.steps {
        let output = model.loss(&features, &truth)?;
        optimizer.backward_step(&output.loss)?;
        let metrics = HeadMetrics::mean(&output.scale_metrics);
        info!(
            step,
            loss = output.loss.to_scalar::<f32>()?,
            recall50 = metrics.recall50,
            conf_noobj = metrics.conf_noobj,
            "training step"
        );
    }

    let detections = model.detect(&features)?;
    for (image, detections) in detections.iter().enumerate() {
        info!(image, count = detections.len(), "detections above threshold");
    }

    Ok(())
}
