//! Trainer owning the model, data, optimizer and schedule

use super::loss::{build_criterion, LossFn};
use super::metrics::EpochMetrics;
use super::Batch;
use crate::config::TrainConfig;
use crate::data::{DataLoader, Dataset, Split};
use crate::error::{Error, Result};
use crate::io::Checkpoint;
use crate::logging::LogSink;
use crate::models::build_model;
use crate::nn::ops::as_matrix;
use crate::nn::{join, BaseKind, Forward, Module, MASK_SUFFIX, ORIG_SUFFIX};
use crate::optim::{build_scheduler, LRScheduler, Optimizer, SGD};
use crate::profile::{Profiler, INFERENCE_SPAN};
use crate::quant::fake_quantize::ste_backward;
use crate::tracking::RunHandle;
use crate::Tensor;
use ndarray::{Array2, Axis};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Checkpoint of the best test accuracy seen so far
pub const BEST_CHECKPOINT: &str = "best.pth";
/// Checkpoint of the most recent epoch
pub const LAST_CHECKPOINT: &str = "last.pth";

/// Where the model runs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Device {
    #[default]
    Cpu,
}

/// Transformation applied to a copy of the model before each test epoch
pub type TestHook = Box<dyn Fn(&Module) -> Result<Module> + Send>;

/// Construction options for [`Trainer`]
#[derive(Default)]
pub struct TrainerOptions {
    /// Output directory root
    pub dir_prefix: PathBuf,
    /// Checkpoint subdirectory below `dir_prefix`
    pub checkpt_dir: String,
    pub device: Device,
    pub tracking: Option<RunHandle>,
    pub test_preprocess_hook: Option<TestHook>,
}

impl std::fmt::Debug for TrainerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainerOptions")
            .field("dir_prefix", &self.dir_prefix)
            .field("checkpt_dir", &self.checkpt_dir)
            .field("device", &self.device)
            .field("tracking", &self.tracking)
            .field("test_preprocess_hook", &self.test_preprocess_hook.is_some())
            .finish()
    }
}

/// Training and evaluation loop
///
/// Only the classifier head (the last Linear-family layer) is optimized.
/// Its gradient flows through weight fake quantization as the identity, and
/// pruned weights are updated through their mask. Every other layer changes
/// only through its forward pass: BatchNorm running statistics and observer
/// ranges.
pub struct Trainer {
    config: TrainConfig,
    model: Module,
    train_loader: DataLoader,
    test_loader: DataLoader,
    optimizer: SGD,
    scheduler: Box<dyn LRScheduler>,
    criterion: Box<dyn LossFn>,
    checkpoint_dir: PathBuf,
    device: Device,
    tracking: Option<RunHandle>,
    test_hook: Option<TestHook>,
    sink: Arc<dyn LogSink>,
}

impl Trainer {
    pub fn new(config: TrainConfig, options: TrainerOptions, sink: Arc<dyn LogSink>) -> Result<Self> {
        config.validate()?;
        let model = build_model(&config.model_name, &config.model_params, config.seed)?;
        let train = Dataset::from_config(&config, Split::Train)?;
        let test = Dataset::from_config(&config, Split::Test)?;
        let train_loader = DataLoader::new(train, config.batch_size, true, config.seed);
        let test_loader = DataLoader::new(test, config.batch_size, false, config.seed);
        let optimizer = SGD::new(config.lr as f32, config.momentum as f32)
            .with_weight_decay(config.weight_decay as f32)
            .with_nesterov(config.nesterov);
        let scheduler = build_scheduler(
            &config.lr_scheduler,
            &config.lr_scheduler_params,
            config.lr as f32,
            config.epochs,
        )?;
        let criterion = build_criterion(&config.criterion, &config.criterion_params)?;
        let checkpoint_dir = options.dir_prefix.join(&options.checkpt_dir);
        Ok(Self {
            config,
            model,
            train_loader,
            test_loader,
            optimizer,
            scheduler,
            criterion,
            checkpoint_dir,
            device: options.device,
            tracking: options.tracking,
            test_hook: options.test_preprocess_hook,
            sink,
        })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn model(&self) -> &Module {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut Module {
        &mut self.model
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    pub fn test_loader(&self) -> &DataLoader {
        &self.test_loader
    }

    /// One test batch through the live model in eval mode
    ///
    /// With observers attached this is the calibration pass.
    pub fn warmup_one_iter(&mut self) -> Result<()> {
        self.model.eval();
        warmup(&mut self.model, &self.test_loader)
    }

    /// One test batch through any forward-capable model
    pub fn warmup_one_iter_model(&self, model: &mut dyn Forward) -> Result<()> {
        warmup(model, &self.test_loader)
    }

    /// Train the classifier head for one epoch
    pub fn train_one_epoch(&mut self, epoch: usize) -> Result<EpochMetrics> {
        self.model.train(true);
        self.optimizer.set_lr(self.scheduler.get_lr());
        let head = classifier_head(&self.model)?;
        let mut metrics = EpochMetrics::default();
        for batch in self.train_loader.iter(epoch) {
            let (loss, logits) = train_step(
                &mut self.model,
                &mut self.optimizer,
                self.criterion.as_ref(),
                &head,
                &batch,
            )?;
            metrics.update(&logits, &batch.targets, loss);
        }
        self.scheduler.step();
        Ok(metrics)
    }

    /// Evaluate the test split
    ///
    /// With a test hook the hook's output is evaluated and the live model is
    /// left in eval mode but otherwise untouched.
    pub fn test_one_epoch(&mut self) -> Result<EpochMetrics> {
        self.model.eval();
        match &self.test_hook {
            Some(hook) => {
                let mut prepared = hook(&self.model)?;
                prepared.eval();
                evaluate(&mut prepared, &self.test_loader, self.criterion.as_ref(), None)
            }
            None => evaluate(&mut self.model, &self.test_loader, self.criterion.as_ref(), None),
        }
    }

    /// Evaluate the test split on any forward-capable model
    pub fn test_one_epoch_model(&self, model: &mut dyn Forward) -> Result<EpochMetrics> {
        evaluate(model, &self.test_loader, self.criterion.as_ref(), None)
    }

    /// [`Trainer::test_one_epoch_model`] under a profiler
    ///
    /// The whole pass is recorded as [`INFERENCE_SPAN`], each operator
    /// inside it under its own name.
    pub fn profile_one_epoch_model(
        &self,
        model: &mut dyn Forward,
        profiler: &mut Profiler,
    ) -> Result<EpochMetrics> {
        let criterion = self.criterion.as_ref();
        profiler.time(INFERENCE_SPAN, |p| {
            evaluate_with(model, &self.test_loader, criterion, None, Some(p))
        })
    }

    /// Train for `EPOCHS`, saving `last.pth` every epoch and `best.pth` on
    /// improvement; returns the best test accuracy
    ///
    /// `resume_info_path` names a checkpoint to continue from: its weights
    /// are strict-loaded and training restarts after its recorded epoch.
    pub fn run(&mut self, resume_info_path: Option<&Path>) -> Result<f64> {
        let mut start_epoch = 0;
        let mut best_acc = f64::NEG_INFINITY;
        std::fs::create_dir_all(&self.checkpoint_dir)?;
        if let Some(path) = resume_info_path {
            let ckpt = Checkpoint::load(path)?;
            self.model.load_state_dict(&ckpt.state_dict)?;
            start_epoch = ckpt.epoch.map_or(0, |e| e + 1);
            best_acc = self.seed_best(&ckpt)?;
            self.scheduler.set_epoch(start_epoch);
            self.sink.info(&format!(
                "Resume from {} at epoch {start_epoch}",
                path.display()
            ));
        }

        for epoch in start_epoch..self.config.epochs {
            let lr = self.scheduler.get_lr();
            let train = self.train_one_epoch(epoch)?;
            let test = self.test_one_epoch()?;
            self.sink.info(&format!(
                "Epoch {epoch}: lr {lr:.6} train_loss {:.4} train_acc {:.2} test_loss {:.4} test_acc {:.2}",
                train.loss(),
                train.accuracy(),
                test.loss(),
                test.accuracy()
            ));
            if let Some(run) = &self.tracking {
                let step = epoch as u64;
                run.log_metric("lr", f64::from(lr), step)?;
                run.log_metric("train_loss", train.loss(), step)?;
                run.log_metric("train_acc", train.accuracy(), step)?;
                run.log_metric("test_loss", test.loss(), step)?;
                run.log_metric("test_acc", test.accuracy(), step)?;
            }

            let ckpt = Checkpoint::new(self.model.state_dict(), test.accuracy()).with_epoch(epoch);
            ckpt.save(self.checkpoint_dir.join(LAST_CHECKPOINT))?;
            if test.accuracy() > best_acc {
                best_acc = test.accuracy();
                ckpt.save(self.checkpoint_dir.join(BEST_CHECKPOINT))?;
            }
        }
        Ok(best_acc)
    }

    /// Best accuracy to beat after resuming
    ///
    /// An existing `best.pth` at least as good as the resumed checkpoint is
    /// kept; otherwise the resumed checkpoint becomes `best.pth`, so that
    /// [`Trainer::resume`] finds one even when no later epoch improves.
    fn seed_best(&self, resumed: &Checkpoint) -> Result<f64> {
        let best_path = self.checkpoint_dir.join(BEST_CHECKPOINT);
        if best_path.exists() {
            let best = Checkpoint::load(&best_path)?;
            if best.test_acc >= resumed.test_acc {
                return Ok(best.test_acc);
            }
        }
        resumed.save(&best_path)?;
        Ok(resumed.test_acc)
    }

    /// Strict-load `best.pth` from the checkpoint directory
    pub fn resume(&mut self) -> Result<Checkpoint> {
        let path = self.checkpoint_dir.join(BEST_CHECKPOINT);
        let ckpt = Checkpoint::load(&path)?;
        self.model.load_state_dict(&ckpt.state_dict)?;
        self.sink.info(&format!(
            "Loaded {} (test_acc {:.2})",
            path.display(),
            ckpt.test_acc
        ));
        Ok(ckpt)
    }
}

impl std::fmt::Debug for Trainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("model_name", &self.config.model_name)
            .field("checkpoint_dir", &self.checkpoint_dir)
            .field("device", &self.device)
            .field("has_test_hook", &self.test_hook.is_some())
            .finish_non_exhaustive()
    }
}

/// Path of the last Linear-family module
pub fn classifier_head(model: &Module) -> Result<String> {
    model
        .named_modules()
        .into_iter()
        .filter(|(_, m)| m.layer().base_kind() == Some(BaseKind::Linear))
        .map(|(path, _)| path)
        .last()
        .ok_or_else(|| Error::Unsupported("model has no Linear classifier to train".into()))
}

fn train_step(
    model: &mut Module,
    optimizer: &mut SGD,
    criterion: &dyn LossFn,
    head: &str,
    batch: &Batch,
) -> Result<(f32, Array2<f32>)> {
    let (out, head_input) = model.forward_capture(&batch.inputs, head)?;
    let logits = as_matrix(&out, "logits")?;
    let (loss, mut grad) = criterion.forward(&logits, &batch.targets)?;
    let module = model.submodule_mut(head)?;
    if module.layer().has_relu() {
        grad.zip_mut_with(&logits, |g, &y| {
            if y <= 0.0 {
                *g = 0.0;
            }
        });
    }
    let x = as_matrix(&head_input, "classifier input")?;
    let grad_w = ste_backward(&grad.t().dot(&x).into_dyn());
    let grad_b: Tensor = grad.sum_axis(Axis(0)).into_dyn();

    for (name, grad) in [("weight", grad_w), ("bias", grad_b)] {
        if let Some((name, grad)) = masked_grad(module, head, name, grad)? {
            apply_grad(optimizer, module, head, &name, &grad)?;
        }
    }
    Ok((loss, logits))
}

/// Gradient routed to `<name>_orig` through the mask when the parameter is
/// pruned, to `<name>` otherwise; `None` when the parameter does not exist
fn masked_grad(
    module: &Module,
    path: &str,
    name: &str,
    grad: Tensor,
) -> Result<Option<(String, Tensor)>> {
    let orig = format!("{name}{ORIG_SUFFIX}");
    if module.param(&orig).is_some() {
        let mask_name = format!("{name}{MASK_SUFFIX}");
        let mask = module
            .float_buffer(&mask_name)
            .ok_or_else(|| Error::ModuleNotFound(join(path, &mask_name)))?;
        return Ok(Some((orig, &grad * mask)));
    }
    Ok(module.param(name).map(|_| (name.to_string(), grad)))
}

fn apply_grad(
    optimizer: &mut SGD,
    module: &mut Module,
    path: &str,
    name: &str,
    grad: &Tensor,
) -> Result<()> {
    let key = join(path, name);
    let param = module
        .param_mut(name)
        .ok_or_else(|| Error::ModuleNotFound(key.clone()))?;
    if param.shape() != grad.shape() {
        return Err(Error::shape_mismatch(key, param.shape(), grad.shape()));
    }
    optimizer.step(&key, param, grad);
    Ok(())
}

fn warmup(model: &mut dyn Forward, loader: &DataLoader) -> Result<()> {
    let batch = loader
        .first()
        .ok_or_else(|| Error::Dataset("test split is empty".into()))?;
    model.forward(&batch.inputs)?;
    Ok(())
}

/// Loss and accuracy of `model` over up to `max_batches` batches
pub fn evaluate(
    model: &mut dyn Forward,
    loader: &DataLoader,
    criterion: &dyn LossFn,
    max_batches: Option<usize>,
) -> Result<EpochMetrics> {
    evaluate_with(model, loader, criterion, max_batches, None)
}

fn evaluate_with(
    model: &mut dyn Forward,
    loader: &DataLoader,
    criterion: &dyn LossFn,
    max_batches: Option<usize>,
    mut profiler: Option<&mut Profiler>,
) -> Result<EpochMetrics> {
    let mut metrics = EpochMetrics::default();
    let limit = max_batches.unwrap_or(usize::MAX);
    for batch in loader.iter(0).take(limit) {
        let out = match profiler.as_deref_mut() {
            Some(p) => model.forward_profiled(&batch.inputs, p)?,
            None => model.forward(&batch.inputs)?,
        };
        let logits = as_matrix(&out, "logits")?;
        let (loss, _) = criterion.forward(&logits, &batch.targets)?;
        metrics.update(&logits, &batch.targets, loss);
    }
    Ok(metrics)
}
