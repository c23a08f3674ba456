use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;

use stoat_core::{Backend, ComputeGraph, Error, Result};
use stoat_data::{Corpus, CorpusBatch, PAD_ID};
use stoat_nn::token_accuracy;
use stoat_optim::{clip_grad_norm, Optimizer, WarmupInvSqrt};

use crate::checkpoint::{self, CheckpointMeta};
use crate::config::{OptionsWatcher, TrainerOptions};
use crate::registry::ModuleRegistry;
use crate::replica::{MultiDeviceModule, TaggingModel};
use crate::validator::ExternalValidator;

// Trainer — the training orchestrator
//
// Epoch state machine: Idle → RunningEpoch(i) → {Validating,
// Checkpointing} → RunningEpoch(i+1) → … → Done | Cancelled.
//
// Per weight-update step:
//
//   1. take device_count × update_frequency batches
//   2. sync_weights() canonical → replicas
//   3. fan out forward+backward per device (rayon), split factor 1
//   4. OutOfMemory from any device → drop graphs, double the split
//      factor, retry the same logical batches in smaller segments;
//      give up (log + skip) once the factor exceeds the batch size
//   5. Numerical (NaN loss) → log + skip the batches
//   6. anything else → propagate, fatal
//   7. sum gradients to canonical, clip, optimizer step
//   8. on cadence: validate, checkpoint when the metric improves, and
//      always refresh the `.latest` snapshot
//
// Cancellation is cooperative: the token is checked between batch groups,
// never mid-batch. Model save failures are logged, never fatal.

/// Cooperative cancellation flag, checked at batch boundaries.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// How the primary metric is measured between checkpoints.
pub enum Validation {
    /// No validation; only `.latest` snapshots are written.
    None,
    /// Token accuracy over a held-out corpus, computed in-process on the
    /// canonical device.
    Local(Corpus),
    /// An external process reached over a local socket.
    External(ExternalValidator),
}

/// Per-epoch summary.
#[derive(Debug, Clone)]
pub struct EpochLog {
    pub epoch: usize,
    /// Average loss per token over the epoch's completed updates.
    pub avg_cost: f64,
    pub updates_run: usize,
    pub batches_skipped: usize,
}

/// Summary of a full training run.
#[derive(Debug, Clone)]
pub struct TrainReport {
    pub epochs: Vec<EpochLog>,
    pub updates: usize,
    pub best_score: Option<f64>,
    pub cancelled: bool,
}

enum StepOutcome {
    /// Gradients are accumulated on the replicas and ready to reduce.
    Completed {
        cost: f64,
        tokens: usize,
        retries: usize,
    },
    Skipped {
        reason: String,
    },
}

/// The training orchestrator. Generic over the backend and the model so
/// the same loop drives the transformer and BiLSTM taggers (and tests'
/// toy models).
pub struct Trainer<B: Backend, M: TaggingModel<B>> {
    options: TrainerOptions,
    registry: ModuleRegistry<B, M>,
    primary: String,
    optimizer: Box<dyn Optimizer<B> + Send>,
    schedule: WarmupInvSqrt,
    validation: Validation,
    watcher: Option<OptionsWatcher>,
    cancel: CancelToken,
    meta: CheckpointMeta,
    update_count: usize,
    best_score: Option<f64>,
    saved_any: bool,
}

impl<B: Backend, M: TaggingModel<B>> Trainer<B, M> {
    /// Build a trainer over an already-populated registry. `primary`
    /// names the registered module to train; `meta` seeds the checkpoint
    /// metadata (its best score / update counter are maintained here).
    pub fn new(
        options: TrainerOptions,
        registry: ModuleRegistry<B, M>,
        primary: impl Into<String>,
        optimizer: Box<dyn Optimizer<B> + Send>,
        validation: Validation,
        meta: CheckpointMeta,
    ) -> Result<Self> {
        let primary = primary.into();
        if registry.get(&primary).is_none() {
            return Err(Error::msg(format!(
                "primary module {primary:?} is not registered"
            )));
        }
        let schedule = WarmupInvSqrt::new(options.base_lr, options.warmup_steps);
        let best_score = if meta.best_score > 0.0 {
            Some(meta.best_score)
        } else {
            None
        };
        Ok(Trainer {
            options,
            registry,
            primary,
            optimizer,
            schedule,
            validation,
            watcher: None,
            cancel: CancelToken::new(),
            meta,
            update_count: 0,
            best_score,
            saved_any: false,
        })
    }

    /// Watch an options file for hot reloads between steps.
    pub fn watch_options(&mut self, watcher: OptionsWatcher) {
        self.watcher = Some(watcher);
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn update_count(&self) -> usize {
        self.update_count
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best_score
    }

    /// Run the full training loop over `corpus`.
    pub fn run(&mut self, corpus: &Corpus) -> Result<TrainReport> {
        let mut epochs = Vec::new();
        let mut cancelled = false;

        'epochs: for epoch in 0..self.options.max_epochs {
            let mut rng = rand::thread_rng();
            let batches = corpus.batches(self.options.batch_size, &mut rng);
            let module = self
                .registry
                .get(&self.primary)
                .ok_or_else(|| Error::msg("primary module vanished"))?;
            let group_size = module.device_count() * self.options.update_frequency.max(1);

            let mut cost_sum = 0.0;
            let mut token_sum = 0usize;
            let mut updates_run = 0usize;
            let mut skipped = 0usize;
            let mut validated_this_epoch = false;

            tracing::info!(epoch, batches = batches.len(), "starting epoch");

            for group in batches.chunks(group_size) {
                if self.cancel.is_cancelled() {
                    cancelled = true;
                    break 'epochs;
                }
                if let Some(watcher) = &mut self.watcher {
                    if let Some(newer) = watcher.poll() {
                        self.options.apply_reload(&newer);
                        tracing::info!(
                            batch_size = self.options.batch_size,
                            max_epochs = self.options.max_epochs,
                            "options hot-reloaded"
                        );
                    }
                }

                let module = self
                    .registry
                    .get(&self.primary)
                    .ok_or_else(|| Error::msg("primary module vanished"))?;

                match run_step(module, group)? {
                    StepOutcome::Completed {
                        cost,
                        tokens,
                        retries,
                    } => {
                        module.sum_gradients_to_default_device()?;
                        let params = module.params_on_default_device();
                        if self.options.max_grad_norm > 0.0 {
                            clip_grad_norm(&params, self.options.max_grad_norm)?;
                        }
                        self.update_count += 1;
                        let lr = self.schedule.lr_at(self.update_count);
                        self.optimizer.step(&params, lr)?;
                        module.release_gradients_on_all_devices();

                        cost_sum += cost;
                        token_sum += tokens;
                        updates_run += 1;
                        if retries > 0 {
                            tracing::info!(retries, "step recovered after batch splitting");
                        }
                        if self.options.report_every_updates > 0
                            && self.update_count % self.options.report_every_updates == 0
                        {
                            let avg = if token_sum > 0 {
                                cost_sum / token_sum as f64
                            } else {
                                f64::NAN
                            };
                            tracing::info!(
                                update = self.update_count,
                                avg_cost = avg,
                                lr,
                                "progress"
                            );
                        }
                    }
                    StepOutcome::Skipped { reason } => {
                        skipped += group.len();
                        module.release_gradients_on_all_devices();
                        tracing::warn!(%reason, "batch group skipped");
                    }
                }

                // Cadence-driven validation + checkpointing.
                let cadence = self.options.valid_run_every_updates;
                if cadence > 0
                    && self.update_count >= self.options.valid_start_after_updates.max(1)
                    && self.update_count % cadence == 0
                {
                    self.validate_and_checkpoint();
                    validated_this_epoch = true;
                }
            }

            let avg_cost = if token_sum > 0 {
                cost_sum / token_sum as f64
            } else {
                f64::NAN
            };
            tracing::info!(epoch, avg_cost, updates_run, skipped, "epoch finished");
            epochs.push(EpochLog {
                epoch,
                avg_cost,
                updates_run,
                batches_skipped: skipped,
            });

            // Epoch-boundary validation when the cadence never fired.
            if !validated_this_epoch {
                self.validate_and_checkpoint();
            }
        }

        if cancelled && !self.saved_any {
            // A clean stop still leaves a usable model behind.
            self.save_snapshot();
        }

        Ok(TrainReport {
            epochs,
            updates: self.update_count,
            best_score: self.best_score,
            cancelled,
        })
    }

    /// Run validation (if configured), save the best model on improvement,
    /// and always refresh the `.latest` snapshot. Never fatal: validation
    /// and save failures are logged and training continues.
    fn validate_and_checkpoint(&mut self) {
        let score = match &self.validation {
            Validation::None => None,
            Validation::Local(held_out) => {
                let module = self.registry.get(&self.primary).expect("primary registered");
                match run_local_validation(module, held_out, self.options.batch_size) {
                    Ok(score) => {
                        tracing::info!(score, "validation (local token accuracy)");
                        Some(score)
                    }
                    Err(e) => {
                        tracing::warn!("validation failed: {e}");
                        None
                    }
                }
            }
            Validation::External(external) => match external.run() {
                Ok(result) => {
                    tracing::info!(score = result.score, "validation (external)");
                    Some(result.score)
                }
                Err(e) => {
                    tracing::warn!("external validation failed: {e}");
                    None
                }
            },
        };

        if let Some(score) = score {
            let improved = self.best_score.map_or(true, |best| score > best);
            if improved {
                self.best_score = Some(score);
                self.meta.best_score = score;
                tracing::info!(score, "better model found");
                self.save_best();
            }
        }
        self.save_snapshot();
    }

    fn save_best(&mut self) {
        self.meta.updates = self.update_count;
        let params = self.registry.named_params_on_default_device();
        match checkpoint::save::<B>(&self.options.model_path, &self.meta, &params) {
            Ok(()) => {
                self.saved_any = true;
                tracing::info!(path = %self.options.model_path.display(), "model saved");
            }
            Err(e) => tracing::warn!("model save failed: {e}"),
        }
    }

    fn save_snapshot(&mut self) {
        self.meta.updates = self.update_count;
        let mut path = self.options.model_path.clone().into_os_string();
        path.push(".latest");
        let params = self.registry.named_params_on_default_device();
        match checkpoint::save::<B>(&path, &self.meta, &params) {
            Ok(()) => self.saved_any = true,
            Err(e) => tracing::warn!("snapshot save failed: {e}"),
        }
    }
}

/// Execute one weight-update step over a group of batches, with adaptive
/// batch splitting on OutOfMemory. On success the gradients sit on the
/// replicas, ready for reduction.
fn run_step<B: Backend, M: TaggingModel<B>>(
    module: &MultiDeviceModule<B, M>,
    group: &[CorpusBatch],
) -> Result<StepOutcome> {
    let device_count = module.device_count();
    let max_batch = group.iter().map(|b| b.batch_size).max().unwrap_or(1);

    module.sync_weights()?;

    let mut split_factor = 1usize;
    let mut retries = 0usize;
    loop {
        module.zero_gradients_on_all_devices()?;

        let segments: Vec<CorpusBatch> =
            group.iter().flat_map(|b| b.split(split_factor)).collect();

        // Fan out: device i takes segments i, i+N, i+2N, … and runs them
        // sequentially; graphs and tapes never cross devices.
        let results: Vec<Result<(f64, usize)>> = (0..device_count)
            .into_par_iter()
            .map(|di| {
                let model = module.replica(di);
                let device = module.devices()[di].clone();
                let mut cost = 0.0;
                let mut tokens = 0usize;
                for segment in segments.iter().skip(di).step_by(device_count) {
                    let graph = ComputeGraph::<B>::new(device.clone(), true);
                    let (loss, n) = model.batch_loss(&graph, segment)?;
                    let value = loss.weight().to_scalar_f64()?;
                    if !value.is_finite() {
                        return Err(Error::Numerical(format!(
                            "loss diverged: {value}"
                        )));
                    }
                    graph.backward_from(&loss)?;
                    cost += value * n as f64;
                    tokens += n;
                }
                Ok((cost, tokens))
            })
            .collect();

        let mut saw_oom = false;
        let mut saw_numerical: Option<String> = None;
        let mut cost = 0.0;
        let mut tokens = 0usize;
        for result in results {
            match result {
                Ok((c, t)) => {
                    cost += c;
                    tokens += t;
                }
                Err(e @ Error::OutOfMemory { .. }) => {
                    tracing::warn!("device ran out of memory: {e}");
                    saw_oom = true;
                }
                Err(Error::Numerical(msg)) => saw_numerical = Some(msg),
                Err(other) => return Err(other),
            }
        }

        if saw_oom {
            // One OOM anywhere retries the whole multi-device group at the
            // doubled factor; partial per-device retries would mix
            // gradients from two different split schedules.
            split_factor *= 2;
            retries += 1;
            if split_factor > max_batch {
                return Ok(StepOutcome::Skipped {
                    reason: format!(
                        "out of memory even at split factor {split_factor} (batch {max_batch})"
                    ),
                });
            }
            tracing::info!(split_factor, "retrying batch group after OOM");
            continue;
        }
        if let Some(msg) = saw_numerical {
            return Ok(StepOutcome::Skipped {
                reason: format!("numerical divergence: {msg}"),
            });
        }
        return Ok(StepOutcome::Completed {
            cost,
            tokens,
            retries,
        });
    }
}

/// Token accuracy of the canonical replica over a held-out corpus.
/// Inference graphs only; runs batches in parallel on the canonical
/// device's worker pool.
fn run_local_validation<B: Backend, M: TaggingModel<B>>(
    module: &MultiDeviceModule<B, M>,
    held_out: &Corpus,
    batch_size: usize,
) -> Result<f64> {
    let model = module.default_module();
    let device = module.devices()[0].clone();
    let mut rng = rand::thread_rng();
    let batches = held_out.batches(batch_size, &mut rng);

    let counts: Vec<Result<(usize, usize)>> = batches
        .par_iter()
        .map(|batch| {
            let graph = ComputeGraph::<B>::new(device.clone(), false);
            let predictions = model.predict(&graph, batch)?;
            Ok(token_accuracy(&predictions, &batch.labels, PAD_ID))
        })
        .collect();

    let mut correct = 0usize;
    let mut total = 0usize;
    for count in counts {
        let (c, t) = count?;
        correct += c;
        total += t;
    }
    if total == 0 {
        return Err(Error::msg("validation corpus has no tokens"));
    }
    Ok(correct as f64 / total as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoat_core::{DType, Tensor, WeightTensor};
    use stoat_cpu::{CpuBackend, CpuDevice};

    // A model that pretends to run out of device memory whenever a
    // segment is larger than `rows_that_fit`, making the adaptive
    // batch-splitting schedule fully deterministic.
    struct FlakyNet {
        weight: WeightTensor<CpuBackend>,
        rows_that_fit: usize,
        nan_loss: bool,
        fatal: bool,
    }

    impl FlakyNet {
        fn new(device: &CpuDevice, rows_that_fit: usize) -> Result<Self> {
            Ok(FlakyNet {
                weight: WeightTensor::parameter(
                    "w",
                    Tensor::from_f64_slice(&[0.5, -0.25], 2, DType::F64, device)?,
                ),
                rows_that_fit,
                nan_loss: false,
                fatal: false,
            })
        }
    }

    impl TaggingModel<CpuBackend> for FlakyNet {
        fn parameters(&self) -> Vec<WeightTensor<CpuBackend>> {
            vec![self.weight.clone()]
        }

        fn batch_loss(
            &self,
            g: &ComputeGraph<CpuBackend>,
            batch: &CorpusBatch,
        ) -> Result<(WeightTensor<CpuBackend>, usize)> {
            if self.fatal {
                return Err(Error::msg("broken model"));
            }
            if batch.batch_size > self.rows_that_fit {
                return Err(Error::OutOfMemory {
                    device: "cpu:0".to_string(),
                    requested: batch.batch_size * 1024,
                    available: self.rows_that_fit * 1024,
                });
            }
            let loss = if self.nan_loss {
                let nan = g.constant(
                    "nan",
                    Tensor::from_f64_slice(&[f64::NAN], 1, DType::F64, g.device())?,
                )?;
                g.sum_all(&g.mul(&nan, &self.weight)?)?
            } else {
                g.mean_all(&g.mul(&self.weight, &self.weight)?)?
            };
            Ok((loss, batch.token_count()))
        }

        fn predict(
            &self,
            _g: &ComputeGraph<CpuBackend>,
            batch: &CorpusBatch,
        ) -> Result<Vec<u32>> {
            Ok(vec![PAD_ID; batch.batch_size * batch.seq_len])
        }
    }

    fn batch_of(rows: usize) -> CorpusBatch {
        CorpusBatch {
            batch_size: rows,
            seq_len: 1,
            tokens: vec![2; rows],
            labels: vec![2; rows],
            lengths: vec![1; rows],
        }
    }

    fn flaky_module(
        rows_that_fit: usize,
    ) -> MultiDeviceModule<CpuBackend, FlakyNet> {
        MultiDeviceModule::new(vec![CpuDevice::new(0)], |dev| {
            FlakyNet::new(dev, rows_that_fit)
        })
        .unwrap()
    }

    #[test]
    fn oom_doubles_the_split_factor_until_segments_fit() {
        // Batch of 8, only single rows fit: factors 1, 2, 4 fail, 8
        // succeeds — exactly ⌈log2 8⌉ = 3 retries.
        let module = flaky_module(1);
        match run_step(&module, &[batch_of(8)]).unwrap() {
            StepOutcome::Completed { retries, tokens, .. } => {
                assert_eq!(retries, 3);
                assert_eq!(tokens, 8);
            }
            StepOutcome::Skipped { reason } => panic!("unexpected skip: {reason}"),
        }
        // Gradients are in place, ready for the optimizer.
        assert!(module.default_module().weight.grad().is_some());
    }

    #[test]
    fn oom_abandons_once_the_factor_exceeds_the_batch() {
        // Nothing ever fits: 1, 2, 4, 8 all fail, 16 > 8 → give up.
        let module = flaky_module(0);
        match run_step(&module, &[batch_of(8)]).unwrap() {
            StepOutcome::Skipped { reason } => {
                assert!(reason.contains("out of memory"), "{reason}");
            }
            StepOutcome::Completed { .. } => panic!("must not complete"),
        }
    }

    #[test]
    fn nan_loss_skips_the_batch_group() {
        let module = MultiDeviceModule::new(vec![CpuDevice::new(0)], |dev| {
            let mut net = FlakyNet::new(dev, usize::MAX)?;
            net.nan_loss = true;
            Ok(net)
        })
        .unwrap();
        match run_step(&module, &[batch_of(4)]).unwrap() {
            StepOutcome::Skipped { reason } => {
                assert!(reason.contains("divergence"), "{reason}");
            }
            StepOutcome::Completed { .. } => panic!("must not complete"),
        }
    }

    #[test]
    fn other_errors_propagate_as_fatal() {
        let module = MultiDeviceModule::new(vec![CpuDevice::new(0)], |dev| {
            let mut net = FlakyNet::new(dev, usize::MAX)?;
            net.fatal = true;
            Ok(net)
        })
        .unwrap();
        assert!(run_step(&module, &[batch_of(2)]).is_err());
    }
}
