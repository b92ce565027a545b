use std::time::SystemTime;

use clap::Parser;
use t2v_turbo_rs::{
    distill::{DistillConfig, DistillerBuilder},
    example_models::{
        BrightnessReward, ChannelMeanAutoencoder, LengthTextEncoder, LinearDenoiser, ScaledDenoiser,
    },
    model_kind::ModelKind,
    pipeline::TurboPipeline,
    reward::RewardRegistry,
    schedulers::lcm::LcmSchedulerConfig,
    utils::get_device,
    Caption,
};
use tch::{nn, nn::OptimizerConfig, Device, Kind, Tensor};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Consistency distillation on synthetic videos",
    long_about = None
)]
struct Args {
    /// TOML configuration, the bundled defaults when omitted.
    #[arg(long)]
    config: Option<String>,

    /// TOML sampler configuration for the final generation.
    #[arg(long)]
    lcm_config: Option<String>,

    #[arg(long, default_value_t = 20)]
    steps: usize,

    #[arg(long)]
    seed: Option<i64>,

    /// Overrides the configured learning rate.
    #[arg(long)]
    lr: Option<f64>,

    /// Run on the CPU even when an accelerator is available.
    #[arg(long)]
    cpu: bool,

    /// Enable an image reward of this scale on the synthetic frames.
    #[arg(long, default_value_t = 0.0)]
    reward_scale: f64,

    /// Write a chrome trace instead of logging to stdout.
    #[arg(long)]
    tracing: bool,

    #[arg(long)]
    verbose: bool,
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => DistillConfig::from_file(path)?,
        None => DistillConfig::for_model(ModelKind::VideoCrafter2),
    };
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(lr) = args.lr {
        config.learning_rate = lr;
    }
    config.n_frames = 8;
    config.reward.reward_scale = args.reward_scale;
    config.reward.reward_fn_name = "brightness".to_string();
    config.reward.reward_batch_size = 2;
    let device = if args.cpu { Device::Cpu } else { get_device() };
    tch::manual_seed(config.seed);

    let start = SystemTime::now();
    let vs = nn::VarStore::new(device);
    let student = LinearDenoiser::new(vs.root() / "student", 4);
    let distiller = DistillerBuilder::new(config.clone())
        .device(device)
        .vae(Box::new(ChannelMeanAutoencoder::new(4)))
        .text_encoder(Box::new(LengthTextEncoder::default()))
        .teacher(Box::new(ScaledDenoiser::default()))
        .student(Box::new(student))
        .rewards(
            RewardRegistry::new().register("brightness", Box::new(BrightnessReward::default())),
        )
        .build()?;
    info!("setup took {:?}", SystemTime::now().duration_since(start)?);

    let mut opt = nn::AdamW::default().build(&vs, config.learning_rate)?;
    let batch = config.train_batch_size as i64;
    let frames = config.n_frames as i64;
    let captions: Vec<Caption> = (0..batch)
        .map(|i| {
            Caption::Multiple(vec![format!("synthetic clip {i}"), "a moving gradient".to_string()])
        })
        .collect();
    for step in 0..args.steps.min(config.max_train_steps) {
        let pixels = Tensor::rand([batch, frames, 3, 16, 16], (Kind::Float, device)) * 2.0 - 1.0;
        let output = distiller.train_step(&pixels, &captions)?;
        opt.backward_step_clip_norm(&output.loss, config.max_grad_norm);
        let scalars = output.scalars()?;
        info!(
            step,
            loss = scalars.loss,
            distill_loss = scalars.distill_loss,
            image_reward_loss = scalars.image_reward_loss,
            video_reward_loss = scalars.video_reward_loss,
            "train step"
        );
    }

    let lcm_config = match &args.lcm_config {
        Some(path) => LcmSchedulerConfig::from_file(path)?,
        None => LcmSchedulerConfig::default(),
    };
    let pipeline = TurboPipeline::from_distiller(&distiller, lcm_config)?;
    let video = pipeline.generate(&["a moving gradient".to_string()], 7.5, (4, frames, 16, 16))?;
    info!(shape = ?video.size(), mean = video.mean(Kind::Float).double_value(&[]), "sampled video");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;

    let args = Args::parse();
    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        let level = if args.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
        tracing_subscriber::fmt().with_max_level(level).init();
        None
    };
    tch::maybe_init_cuda();
    info!(
        cuda = tch::Cuda::is_available(),
        cudnn = tch::Cuda::cudnn_is_available(),
        mps = tch::utils::has_mps(),
        "devices"
    );
    run(args)
}
