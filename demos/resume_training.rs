//! Save/resume demo: fit y = 2x - 1, checkpoint periodically, then resume
//! from the last checkpoint into a fresh model.
//!
//! Pass a device list as the first argument (`0` = CPU, `1` = first GPU,
//! `1,2` = data-parallel over two GPUs). GPU specs need the `cuda` feature.
use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, Optimizer};

use train_xt::device::{place_model, place_tensor};
use train_xt::training::{load_checkpoint, save_checkpoint, AdamW, AdamWConfig, LossMeter};
use train_xt::{DeviceSpec, Model, Placeable, RunConfig};

fn line_model() -> anyhow::Result<Model> {
    let model = Model::new(Device::Cpu);
    let vb = model.var_builder(DType::F32);
    vb.get_with_hints(1, "w", Init::Const(0.0))?;
    vb.get_with_hints(1, "b", Init::Const(0.0))?;
    Ok(model)
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let device: DeviceSpec = std::env::args().nth(1).unwrap_or_default().parse()?;
    let config = RunConfig {
        device,
        checkpoint_dir: std::env::temp_dir().join("train-xt-demo"),
        save_every: 50,
        verbose: true,
    };
    config.validate()?;
    std::fs::create_dir_all(&config.checkpoint_dir)?;
    log::info!("Device spec {} -> {:?}", config.device, config.device.placement());

    // This demo steps the master copy; a wrapper only reports its replicas
    let model = match place_model(line_model()?, &config.device)? {
        Placeable::Parallel(dp) => {
            log::info!("Data-parallel over {} devices", dp.devices().len());
            dp.into_inner()
        }
        placed => placed
            .into_model()
            .ok_or_else(|| anyhow::anyhow!("placement returned a non-model value"))?,
    };

    let x = place_tensor(&Tensor::arange(-4f32, 4f32, &Device::Cpu)?, &config.device)?;
    let y = ((&x * 2.0)? - 1.0)?;

    let mut optimizer = AdamW::from_model(
        &model,
        AdamWConfig {
            lr: 0.05,
            weight_decay: 0.0,
            ..Default::default()
        },
    )?;
    let mut meter = LossMeter::new();

    for step in 1..=200 {
        let vars = model.named_vars()?;
        let (b, w) = (vars[0].1.as_tensor(), vars[1].1.as_tensor());
        let pred = x.broadcast_mul(w)?.broadcast_add(b)?;
        let loss = (pred - &y)?.sqr()?.mean_all()?;

        meter.add(loss.to_scalar::<f32>()? as f64, x.dim(0)?);
        optimizer.backward_step(&loss)?;

        if config.should_save(step) {
            log::info!("step {}: avg loss {:.5}", step, meter.average()?);
            meter.reset();
            save_checkpoint(
                config.checkpoint_path(step),
                &model,
                Some(&optimizer),
                Some(optimizer.learning_rate()),
                Some(step),
                config.verbose,
            )?;
        }
    }

    let mut resumed = line_model()?;
    let mut resumed_optimizer = AdamW::from_model(&resumed, AdamWConfig::default())?;
    let loaded = load_checkpoint(
        config.checkpoint_path(200),
        &mut resumed,
        Some(&mut resumed_optimizer),
        config.verbose,
    )?;

    log::info!("Restored {:?} after {} iterations", loaded.objects(), meter.iteration());
    Ok(())
}
