//! # Stoat
//!
//! A sequence-labeling (POS/NER) training and inference runtime: a
//! tape-based reverse-mode autodiff core with a multi-device training
//! orchestrator on top.
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | `stoat-core` | Tensor, Shape, Layout, Backend trait, WeightTensor, the ComputeGraph tape |
//! | `stoat-cpu` | CPU backend: strided kernels, rayon parallelism, budgeted allocation |
//! | `stoat-nn` | Layers (Linear, Embedding, LayerNorm, attention, LSTM) and the SequenceTagger |
//! | `stoat-optim` | Adam, gradient clipping, warmup + inverse-sqrt LR schedule |
//! | `stoat-data` | Vocabularies, `token/LABEL` corpora, padded batches |
//! | `stoat` | This facade: replication, registry, trainer, checkpoints, validation |
//!
//! ## Training in short
//!
//! ```ignore
//! let devices: Vec<CpuDevice> = options.device_ids.iter().map(|&i| CpuDevice::new(i)).collect();
//! let module = MultiDeviceModule::new(devices, |dev| {
//!     SequenceTagger::new(config.clone(), DType::F32, dev)
//! })?;
//! let mut registry = ModuleRegistry::new();
//! registry.register("tagger", module)?;
//! let mut trainer = Trainer::new(options, registry, "tagger",
//!     Box::new(Adam::new()), Validation::Local(held_out), meta)?;
//! let report = trainer.run(&corpus)?;
//! ```

pub mod checkpoint;
pub mod config;
pub mod registry;
pub mod replica;
pub mod trainer;
pub mod validator;

pub use checkpoint::{CheckpointMeta, TensorRecord};
pub use config::{OptionsWatcher, TrainerOptions};
pub use registry::ModuleRegistry;
pub use replica::{MultiDeviceModule, TaggingModel};
pub use trainer::{CancelToken, EpochLog, TrainReport, Trainer, Validation};
pub use validator::{ExternalValidator, ValidationResult};

/// Re-export the building blocks most callers need.
pub mod prelude {
    pub use crate::{
        CancelToken, CheckpointMeta, ModuleRegistry, MultiDeviceModule, TaggingModel,
        TrainReport, Trainer, TrainerOptions, Validation,
    };
    pub use stoat_core::{Backend, ComputeGraph, DType, Error, Result, Tensor, WeightTensor};
    pub use stoat_cpu::{CpuBackend, CpuDevice, MemoryBudget};
    pub use stoat_data::{Corpus, CorpusBatch, Sentence, Vocab};
    pub use stoat_nn::{EncoderKind, SequenceTagger, TaggerConfig};
    pub use stoat_optim::{Adam, Optimizer, WarmupInvSqrt};
}

use stoat_core::{Backend, DType, Result};
use stoat_nn::SequenceTagger;

/// Rebuild a tagger from a checkpoint: read the meta block, construct the
/// network at the declared sizes on `device`, and pour the saved
/// parameters back in. The returned meta carries the vocabularies and the
/// best score so far.
///
/// Checkpoint keys are `module/param`; this loader expects the network to
/// have been registered under the conventional name `tagger`.
///
/// Multi-device callers restore into the canonical replica and then
/// `sync_weights()` to the rest.
pub fn load_tagger<B: Backend>(
    path: impl AsRef<std::path::Path>,
    device: &B::Device,
) -> Result<(SequenceTagger<B>, CheckpointMeta)> {
    let (meta, records) = checkpoint::load(path)?;
    let dtype: DType = checkpoint::parse_dtype_tag(&meta.dtype)?;
    let tagger = SequenceTagger::<B>::new(meta.config.clone(), dtype, device)?;
    let named: Vec<(String, stoat_core::WeightTensor<B>)> = tagger
        .parameters()
        .into_iter()
        .map(|p| (format!("tagger/{}", p.name()), p))
        .collect();
    checkpoint::restore_params::<B>(&records, &named)?;
    Ok((tagger, meta))
}
