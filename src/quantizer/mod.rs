//! Quantization of trained, possibly pruned, models
//!
//! A [`Quantizer`] loads a checkpoint into the trainer's model and then:
//! 1. Baseline: saves the float model as `orig_model.pth`
//! 2. Prepare: fuses, attaches the backend qconfig, inserts observers
//!    (static) or fake-quantizers (QAT) and re-applies the pruning masks
//! 3. Calibrate with one batch, or run quantization-aware training
//! 4. Convert a copy to integer kernels, saved as `quantized_model.pth`
//! 5. Compile that copy into a scripted program, saved as `scripted_model.pth`
//!
//! Pruning masks are taken out of the model whenever it is loaded, fused or
//! converted, and put back whenever it is trained or evaluated.

mod quantize_fn;
mod report;
mod stage;


pub use quantize_fn::QuantizeFn;
pub use report::{ArtifactReport, QuantizationReport, ORIG_MODEL, QUANTIZED_MODEL, SCRIPTED_MODEL};
pub use stage::{Stage, StageTrace};

use crate::config::TrainConfig;
use crate::error::Result;
use crate::io::{file_size_mb, save_state_dict, Checkpoint};
use crate::logging::LogSink;
use crate::nn::{fuse_model, Forward, Module, StateTensor};
use crate::profile::{InferenceProfile, Profiler, TABLE_ROWS};
use crate::prune::{
    dummy_pruning, get_masks, reinstall_masks, remove_pruning_reparameterization, MaskMap,
    ParamRegistry,
};
use crate::quant::{
    attach_qconfig, default_qat_qconfig, disable_observer, freeze_bn_stats, prepare, prepare_qat,
    Backend,
};
use crate::script::ScriptedModel;
use crate::tracking::{RunHandle, RunStatus, TrackingParams};
use crate::train::{Device, TestHook, Trainer, TrainerOptions};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Checkpoint subdirectory used during quantization-aware training
pub const QAT_CHECKPOINT_DIR: &str = "qat";

/// How quantization parameters are obtained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantMode {
    /// Post-training static quantization calibrated on one batch
    Static,
    /// Quantization-aware training
    #[default]
    Qat,
}

/// Construction options for [`Quantizer`]
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizerOptions {
    pub checkpoint_path: PathBuf,
    /// Output directory for artifacts and QAT checkpoints
    pub dir_prefix: PathBuf,
    pub mode: QuantMode,
    /// Evaluate the converted and scripted models on the full test split
    pub check_acc: bool,
    pub backend: Backend,
    pub tracking: Option<TrackingParams>,
}

impl QuantizerOptions {
    pub fn new(checkpoint_path: impl Into<PathBuf>, dir_prefix: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_path: checkpoint_path.into(),
            dir_prefix: dir_prefix.into(),
            mode: QuantMode::default(),
            check_acc: false,
            backend: Backend::default(),
            tracking: None,
        }
    }

    pub fn with_mode(mut self, mode: QuantMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_check_acc(mut self, check_acc: bool) -> Self {
        self.check_acc = check_acc;
        self
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_tracking(mut self, tracking: TrackingParams) -> Self {
        self.tracking = Some(tracking);
        self
    }
}

/// Quantization runner for one checkpoint
pub struct Quantizer {
    trainer: Trainer,
    options: QuantizerOptions,
    quantize_fn: QuantizeFn,
    registry: ParamRegistry,
    orig_acc: f64,
    trace: StageTrace,
    tracking: Option<RunHandle>,
    sink: Arc<dyn LogSink>,
}

impl Quantizer {
    /// Build the trainer and load the checkpoint into its model
    pub fn new(config: TrainConfig, options: QuantizerOptions, sink: Arc<dyn LogSink>) -> Result<Self> {
        let quantize_fn = QuantizeFn::new();
        let hook: TestHook = {
            let quantize_fn = quantize_fn.clone();
            Box::new(move |model: &Module| quantize_fn.quantize(model))
        };
        let tracking = options.tracking.as_ref().map(RunHandle::start).transpose()?;
        if let Some(run) = &tracking {
            run.log_param("mode", mode_name(options.mode))?;
            run.log_param("backend", options.backend.name())?;
            run.log_param("checkpoint", &options.checkpoint_path.display().to_string())?;
        }
        let trainer = Trainer::new(
            config,
            TrainerOptions {
                dir_prefix: options.dir_prefix.clone(),
                checkpt_dir: QAT_CHECKPOINT_DIR.to_string(),
                device: Device::Cpu,
                tracking: tracking.clone(),
                test_preprocess_hook: Some(hook),
            },
            Arc::clone(&sink),
        )?;
        let registry = ParamRegistry::from_model(trainer.model());
        let mut quantizer = Self {
            trainer,
            options,
            quantize_fn,
            registry,
            orig_acc: 0.0,
            trace: StageTrace::new(),
            tracking,
            sink,
        };
        quantizer.init_model()?;
        Ok(quantizer)
    }

    fn init_model(&mut self) -> Result<()> {
        let path = self.options.checkpoint_path.clone();
        self.sink
            .info(&format!("Load weights from the checkpoint {}", path.display()));
        let checkpoint = Checkpoint::load(&path)?;
        self.orig_acc = checkpoint.test_acc;
        let is_pruned = checkpoint.is_pruned();

        let model = self.trainer.model_mut();
        if is_pruned {
            self.sink.info("Dummy pruning to load pruned weights");
            dummy_pruning(model, &self.registry)?;
        }
        model.load_state_dict(&checkpoint.state_dict)?;
        self.sink.info("Initialized weights");
        self.trace.record(Stage::Initialized);

        if is_pruned {
            self.sink
                .info("Get masks and remove pruning reparameterization for prepare_qat");
            let masks = get_masks(model);
            remove_pruning_reparameterization(model, &self.registry)?;
            self.quantize_fn.set_masks(masks)?;
            self.trace.record(Stage::MasksExtracted);
        }
        Ok(())
    }

    pub fn trainer(&self) -> &Trainer {
        &self.trainer
    }

    pub fn model(&self) -> &Module {
        self.trainer.model()
    }

    /// Accuracy recorded in the source checkpoint
    pub fn orig_acc(&self) -> f64 {
        self.orig_acc
    }

    /// Masks of a pruned checkpoint
    pub fn masks(&self) -> Option<&MaskMap> {
        self.quantize_fn.masks()
    }

    pub fn trace(&self) -> &StageTrace {
        &self.trace
    }

    /// Run the pipeline, continuing QAT from `resume_info_path` if given
    ///
    /// Artifacts written before a failure stay on disk.
    pub fn run(&mut self, resume_info_path: Option<&Path>) -> Result<QuantizationReport> {
        let result = self.run_stages(resume_info_path);
        if let Some(run) = &self.tracking {
            let status = if result.is_ok() {
                RunStatus::Completed
            } else {
                RunStatus::Failed
            };
            run.finish(status)?;
        }
        result
    }

    fn run_stages(&mut self, resume_info_path: Option<&Path>) -> Result<QuantizationReport> {
        std::fs::create_dir_all(&self.options.dir_prefix)?;
        self.log_datatypes("original model", self.trainer.model().state_dict().iter());
        self.trainer.warmup_one_iter()?;
        let orig_path = self.options.dir_prefix.join(ORIG_MODEL);
        save_state_dict(&orig_path, &self.trainer.model().state_dict(), &BTreeMap::new())?;
        let original = ArtifactReport {
            size_mb: file_size_mb(&orig_path)?,
            path: orig_path,
            accuracy: Some(self.orig_acc),
            inference: None,
        };
        self.sink.info(&format!(
            "Acc: {:?} %\tSize: {:.6} MB",
            self.orig_acc, original.size_mb
        ));
        self.track_artifact("orig_model", &original)?;
        self.trace.record(Stage::Baseline);

        self.prepare()?;

        match self.options.mode {
            QuantMode::Static => {
                self.sink
                    .info("Post Training Static Quantization: Run calibration");
                self.trainer.warmup_one_iter()?;
                self.trace.record(Stage::Calibrated);
            }
            QuantMode::Qat => {
                self.sink.info("Quantization Aware Training: Run training");
                self.trainer.run(resume_info_path)?;
                self.trace.record(Stage::Trained);
                let model = self.trainer.model_mut();
                disable_observer(model)?;
                freeze_bn_stats(model)?;
                self.trace.record(Stage::ObserversFrozen);
                self.trainer.resume()?;
                self.trace.record(Stage::Resumed);
            }
        }

        let mut quantized_model = self.quantize_fn.quantize(self.trainer.model())?;
        let (accuracy, inference) = self.measure(&mut quantized_model)?;
        let quantized_path = self.options.dir_prefix.join(QUANTIZED_MODEL);
        let quantized_dict = quantized_model.state_dict();
        save_state_dict(&quantized_path, &quantized_dict, &BTreeMap::new())?;
        let quantized = ArtifactReport {
            size_mb: file_size_mb(&quantized_path)?,
            path: quantized_path,
            accuracy,
            inference,
        };
        self.sink.info(&quantized.log_line());
        self.log_datatypes("quantized model", quantized_dict.iter());
        self.track_artifact("quantized_model", &quantized)?;
        self.trace.record(Stage::Quantized);

        let mut scripted_model = ScriptedModel::compile(&quantized_model)?;
        let (accuracy, inference) = self.measure(&mut scripted_model)?;
        let scripted_path = self.options.dir_prefix.join(SCRIPTED_MODEL);
        scripted_model.save(&scripted_path)?;
        let scripted = ArtifactReport {
            size_mb: file_size_mb(&scripted_path)?,
            path: scripted_path,
            accuracy,
            inference,
        };
        self.sink.info(&scripted.log_line());
        self.sink.debug("scripted model's datatypes:");
        scripted_model.describe(self.sink.as_ref());
        self.track_artifact("scripted_model", &scripted)?;
        self.trace.record(Stage::Scripted);

        Ok(QuantizationReport {
            original,
            quantized,
            scripted,
        })
    }

    /// Fuse, attach the qconfig, insert observers and re-apply masks
    fn prepare(&mut self) -> Result<()> {
        let mode = self.options.mode;
        let qconfig = default_qat_qconfig(self.options.backend);
        let model = self.trainer.model_mut();
        match mode {
            QuantMode::Static => model.eval(),
            QuantMode::Qat => model.train(true),
        }
        let report = fuse_model(model)?;
        self.trace.record(Stage::Fused);

        attach_qconfig(model, qconfig)?;
        match mode {
            QuantMode::Static => prepare(model)?,
            QuantMode::Qat => prepare_qat(model)?,
        }
        self.trace.record(Stage::Prepared);

        if let Some(masks) = self.quantize_fn.masks() {
            self.registry = reinstall_masks(model, masks, &report)?;
            self.trace.record(Stage::MasksReinstalled);
        }
        let prepared = self.trainer.model().state_dict();
        self.log_datatypes("fused model", prepared.iter());
        Ok(())
    }

    /// Profiled test accuracy with `check_acc`, otherwise one warmup batch
    ///
    /// The profile table of the slowest operators is logged before the
    /// artifact is saved.
    fn measure(&self, model: &mut dyn Forward) -> Result<(Option<f64>, Option<InferenceProfile>)> {
        if self.options.check_acc {
            let mut profiler = Profiler::new();
            let metrics = self.trainer.profile_one_epoch_model(model, &mut profiler)?;
            let profile = profiler.summary(TABLE_ROWS);
            for line in profile.table() {
                self.sink.info(&line);
            }
            Ok((Some(metrics.accuracy()), Some(profile)))
        } else {
            self.trainer.warmup_one_iter_model(model)?;
            Ok((None, None))
        }
    }

    fn log_datatypes<'a>(
        &self,
        name: &str,
        tensors: impl Iterator<Item = (&'a str, &'a StateTensor)>,
    ) {
        self.sink.debug(&format!("{name}'s datatypes:"));
        for (key, tensor) in tensors {
            self.sink.debug(&format!("{key}: {}", tensor.dtype_name()));
        }
    }

    fn track_artifact(&self, name: &str, artifact: &ArtifactReport) -> Result<()> {
        let Some(run) = &self.tracking else {
            return Ok(());
        };
        run.log_metric(&format!("{name}_size_mb"), artifact.size_mb, 0)?;
        if let Some(acc) = artifact.accuracy {
            run.log_metric(&format!("{name}_acc"), acc, 0)?;
        }
        if let Some(ms) = artifact.inference_ms() {
            run.log_metric(&format!("{name}_inference_ms"), ms, 0)?;
        }
        run.log_artifact(&artifact.path.display().to_string())?;
        Ok(())
    }
}

impl std::fmt::Debug for Quantizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Quantizer")
            .field("options", &self.options)
            .field("orig_acc", &self.orig_acc)
            .field("trace", &self.trace)
            .field("trainer", &self.trainer)
            .finish_non_exhaustive()
    }
}

fn mode_name(mode: QuantMode) -> &'static str {
    match mode {
        QuantMode::Static => "static",
        QuantMode::Qat => "qat",
    }
}
