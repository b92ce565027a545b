use std::cell::RefCell;
use std::rc::Rc;

use serial_test::serial;
use t2v_turbo_rs::{
    distill::{DistillConfig, DistillerBuilder},
    example_models::{
        BrightnessReward, ChannelMeanAutoencoder, LengthTextEncoder, LinearDenoiser, ScaledDenoiser,
    },
    losses::DistillLoss,
    reward::RewardRegistry,
    unet::{Conditioning, Denoiser},
    Caption, ConsistencyDistiller, DistillError,
};
use tch::{nn, Device, Kind, Tensor};

fn scenario_config() -> DistillConfig {
    DistillConfig {
        num_ddim_timesteps: 50,
        topk: 20,
        w_min: 5.0,
        w_max: 5.0,
        train_batch_size: 2,
        n_frames: 5,
        loss_type: DistillLoss::L2,
        ..Default::default()
    }
}

fn builder(config: DistillConfig, vs: &nn::VarStore) -> DistillerBuilder {
    DistillerBuilder::new(config)
        .device(Device::Cpu)
        .vae(Box::new(ChannelMeanAutoencoder::new(4)))
        .text_encoder(Box::new(LengthTextEncoder::default()))
        .teacher(Box::new(ScaledDenoiser::default()))
        .student(Box::new(LinearDenoiser::new(vs.root() / "student", 4)))
}

fn captions(n: usize) -> Vec<Caption> {
    (0..n).map(|i| Caption::from(format!("a clip of {i} birds"))).collect()
}

/// Records the timesteps of every call and predicts `0.1 * sample`.
struct RecordingDenoiser {
    calls: Rc<RefCell<Vec<Vec<i64>>>>,
}

impl Denoiser for RecordingDenoiser {
    fn forward(
        &self,
        sample: &Tensor,
        timesteps: &Tensor,
        _: &Conditioning,
        _: Option<&Tensor>,
    ) -> Tensor {
        self.calls.borrow_mut().push(Vec::<i64>::try_from(timesteps).unwrap());
        sample * 0.1
    }
}

/// Drops the last frame of its input.
struct TruncatingDenoiser;

impl Denoiser for TruncatingDenoiser {
    fn forward(&self, sample: &Tensor, _: &Tensor, _: &Conditioning, _: Option<&Tensor>) -> Tensor {
        let frames = sample.size()[2];
        sample.narrow(2, 0, frames - 1)
    }
}

#[test]
#[serial]
fn test_end_to_end_step_is_reproducible() {
    let vs = nn::VarStore::new(Device::Cpu);
    let distiller = builder(scenario_config(), &vs).build().unwrap();
    let run = |distiller: &ConsistencyDistiller| {
        tch::manual_seed(42);
        let latents = Tensor::randn([2, 4, 5, 8, 8], (Kind::Float, Device::Cpu));
        distiller.distill_latents(&latents, &captions(2)).unwrap().scalars().unwrap()
    };
    let first = run(&distiller);
    let second = run(&distiller);
    assert!(first.max_abs_diff(&second) <= 1e-6, "{first} vs {second}");
    assert!(first.loss.is_finite());
    assert_eq!(first.image_reward_loss, 0.0);
    assert_eq!(first.video_reward_loss, 0.0);
    assert!((first.loss - first.distill_loss).abs() < 1e-7);
}

#[test]
#[serial]
fn test_train_step_from_pixels() {
    tch::manual_seed(3);
    let vs = nn::VarStore::new(Device::Cpu);
    let distiller = builder(scenario_config(), &vs).build().unwrap();
    let pixels = Tensor::rand([2, 5, 3, 8, 8], (Kind::Float, Device::Cpu)) * 2.0 - 1.0;
    let latents = distiller.encode_latents(&pixels).unwrap();
    assert_eq!(latents.size(), vec![2, 4, 5, 8, 8]);
    let output = distiller.train_step(&pixels, &captions(2)).unwrap();
    assert!(output.loss.requires_grad());
    assert!(output.scalars().unwrap().loss.is_finite());
}

#[test]
#[serial]
fn test_advanced_timesteps_are_clamped() {
    for topk in [20, 500] {
        tch::manual_seed(11);
        let calls = Rc::new(RefCell::new(Vec::new()));
        let vs = nn::VarStore::new(Device::Cpu);
        let distiller = builder(DistillConfig { topk, ..scenario_config() }, &vs)
            .student(Box::new(RecordingDenoiser { calls: calls.clone() }))
            .build()
            .unwrap();
        let latents = Tensor::randn([2, 4, 5, 8, 8], (Kind::Float, Device::Cpu));
        distiller.distill_latents(&latents, &captions(2)).unwrap();

        let calls = calls.borrow();
        assert_eq!(calls.len(), 2);
        let (start, target) = (&calls[0], &calls[1]);
        for (s, t) in start.iter().zip(target) {
            assert!(distiller.solver().ddim_timesteps().contains(s));
            assert_eq!(*t, (s - topk).max(0));
        }
    }
}

#[test]
#[serial]
fn test_gradient_reaches_student() {
    tch::manual_seed(5);
    let vs = nn::VarStore::new(Device::Cpu);
    let distiller = builder(scenario_config(), &vs).build().unwrap();
    let latents = Tensor::randn([2, 4, 5, 8, 8], (Kind::Float, Device::Cpu));
    let output = distiller.distill_latents(&latents, &captions(2)).unwrap();
    output.loss.backward();
    let variables = vs.trainable_variables();
    assert_eq!(variables.len(), 3);
    let total: f64 = variables
        .iter()
        .map(|v| {
            let grad = v.grad();
            assert!(grad.defined());
            grad.abs().sum(Kind::Float).double_value(&[])
        })
        .sum();
    assert!(total > 0.0 && total.is_finite());
}

#[test]
#[serial]
fn test_disabled_rewards_never_decode() {
    tch::manual_seed(9);
    let vae = ChannelMeanAutoencoder::new(4);
    let decode_calls = vae.decode_calls();
    let vs = nn::VarStore::new(Device::Cpu);
    let distiller = builder(scenario_config(), &vs).vae(Box::new(vae)).build().unwrap();
    let pixels = Tensor::rand([2, 5, 3, 8, 8], (Kind::Float, Device::Cpu));
    distiller.train_step(&pixels, &captions(2)).unwrap();
    assert_eq!(decode_calls.get(), 0);
}

#[test]
#[serial]
fn test_enabled_rewards_decode_and_score() {
    tch::manual_seed(13);
    let vae = ChannelMeanAutoencoder::new(4);
    let decode_calls = vae.decode_calls();
    let image_reward = BrightnessReward::default();
    let image_calls = image_reward.calls();
    let video_reward = BrightnessReward::default();
    let video_calls = video_reward.calls();
    let mut config = DistillConfig { train_batch_size: 1, ..scenario_config() };
    config.reward.reward_scale = 1.0;
    config.reward.reward_fn_name = "image".into();
    config.reward.reward_batch_size = 2;
    config.reward.video_reward_scale = 0.5;
    config.reward.video_rm_name = "video".into();
    config.reward.video_rm_batch_size = 2;
    let vs = nn::VarStore::new(Device::Cpu);
    let distiller = builder(config, &vs)
        .vae(Box::new(vae))
        .rewards(
            RewardRegistry::new()
                .register("image", Box::new(image_reward))
                .register("video", Box::new(video_reward)),
        )
        .build()
        .unwrap();
    let latents = Tensor::randn([1, 4, 5, 8, 8], (Kind::Float, Device::Cpu));
    let output = distiller.distill_latents(&latents, &captions(1)).unwrap();
    assert_eq!(decode_calls.get(), 2);
    assert_eq!(image_calls.get(), 1);
    assert_eq!(video_calls.get(), 1);

    let scalars = output.scalars().unwrap();
    // brightness lies in [0, 1], so the reward losses lie in [-scale, 0]
    assert!(scalars.image_reward_loss <= 0.0 && scalars.image_reward_loss >= -1.0);
    assert!(scalars.video_reward_loss <= 0.0 && scalars.video_reward_loss >= -0.5);
    let sum = scalars.distill_loss + scalars.image_reward_loss + scalars.video_reward_loss;
    assert!((scalars.loss - sum).abs() < 1e-5);
}

#[test]
fn test_configuration_errors() {
    let vs = nn::VarStore::new(Device::Cpu);
    let invalid =
        |b: DistillerBuilder| matches!(b.build().err(), Some(DistillError::InvalidConfig(_)));

    assert!(invalid(builder(DistillConfig { w_min: 9.0, w_max: 3.0, ..scenario_config() }, &vs)));

    let mut config = scenario_config();
    config.reward.reward_scale = 1.0;
    assert!(invalid(builder(config, &vs)));

    let mut config = DistillConfig { train_batch_size: 1, ..scenario_config() };
    config.reward.video_reward_scale = 1.0;
    config.reward.video_rm_batch_size = 5;
    assert!(invalid(builder(config, &vs)));

    let mut config = DistillConfig { train_batch_size: 1, ..scenario_config() };
    config.reward.reward_scale = 1.0;
    config.reward.reward_fn_name = "missing".into();
    assert!(invalid(builder(config, &vs)));

    assert!(invalid(DistillerBuilder::new(scenario_config()).device(Device::Cpu)));

    let err = builder(DistillConfig { use_scale: true, ..scenario_config() }, &vs).build().err();
    assert!(matches!(err, Some(DistillError::Unsupported(_))));
}

#[test]
#[serial]
fn test_shape_errors() {
    let vs = nn::VarStore::new(Device::Cpu);
    let distiller = builder(scenario_config(), &vs)
        .teacher(Box::new(TruncatingDenoiser))
        .build()
        .unwrap();
    let latents = Tensor::randn([2, 4, 5, 8, 8], (Kind::Float, Device::Cpu));
    let err = distiller.distill_latents(&latents, &captions(2)).err();
    assert!(matches!(err, Some(DistillError::ShapeMismatch { .. })));
    let err = distiller.distill_latents(&latents, &captions(1)).err();
    assert!(matches!(err, Some(DistillError::ShapeMismatch { .. })));
    let err = distiller.distill_latents(&latents.flatten(3, 4), &captions(2)).err();
    assert!(matches!(err, Some(DistillError::ShapeMismatch { .. })));
}
