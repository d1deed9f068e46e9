//! The hypothesize-and-verify loop controller.
//!
//! Draws minimal samples, turns them into model hypotheses, filters them
//! through the preemptive verifier, scores survivors, guards against
//! degenerate configurations, locally optimizes promising models and stops
//! once the adaptive termination bound is reached. The parallel variant
//! runs the same loop on every core with per-worker component clones; the
//! only shared state is a done flag, a global hypothesis counter and the
//! per-worker best slots that peers read to tighten their pruning bounds.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::debug;
use rayon::prelude::*;

use crate::config::{LocalOptimMethod, RansacParams, SamplingMethod};
use crate::core::{DataMatrix, DegeneracyGuard, Estimator, LocalOptimizer, Residual};
use crate::error::RansacError;
use crate::samplers::Sampler;
use crate::scoring::{Quality, Score};
use crate::termination::StandardTermination;
use crate::verifier::Verifier;

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct RansacOutput<M> {
    pub model: M,
    /// Per-point inlier flags of the final model, full length.
    pub inlier_mask: Vec<bool>,
    /// Indices of the inliers, ascending.
    pub inliers: Vec<usize>,
    pub score: Score,
    pub inlier_number: usize,
    /// Hypotheses evaluated by the main loop.
    pub iterations: usize,
    pub time_micros: u128,
}

// Worker-side view of the sampler: PROSAC keeps one global schedule behind
// a mutex, everything else is an owned per-worker stream.
enum WorkerSampler {
    Owned(Sampler),
    Shared(Arc<Mutex<Sampler>>),
}

impl WorkerSampler {
    fn generate(&mut self, sample: &mut [usize]) {
        match self {
            WorkerSampler::Owned(s) => s.generate(sample),
            WorkerSampler::Shared(s) => s.lock().expect("sampler mutex poisoned").generate(sample),
        }
    }
}

/// Engine instance binding all components of one run.
pub struct Ransac<E, R, D, L, P>
where
    E: Estimator,
    R: Residual<Model = E::Model>,
    D: DegeneracyGuard<Model = E::Model>,
    L: LocalOptimizer<Model = E::Model>,
    P: LocalOptimizer<Model = E::Model>,
{
    params: RansacParams,
    estimator: E,
    quality: Quality<R>,
    sampler: Sampler,
    verifier: Verifier<R>,
    degeneracy: D,
    local_optimizer: Option<L>,
    polisher: Option<P>,
}

impl<E, R, D, L, P> Ransac<E, R, D, L, P>
where
    E: Estimator + Sync,
    E::Model: Send + Sync,
    R: Residual<Model = E::Model> + Send + Sync,
    D: DegeneracyGuard<Model = E::Model> + Sync,
    L: LocalOptimizer<Model = E::Model> + Sync,
    P: LocalOptimizer<Model = E::Model>,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: RansacParams,
        estimator: E,
        quality: Quality<R>,
        sampler: Sampler,
        verifier: Verifier<R>,
        degeneracy: D,
        local_optimizer: Option<L>,
        polisher: Option<P>,
    ) -> Self {
        Self {
            params,
            estimator,
            quality,
            sampler,
            verifier,
            degeneracy,
            local_optimizer,
            polisher,
        }
    }

    /// Run the full pipeline and assemble the output.
    pub fn run(&mut self, data: &DataMatrix) -> Result<RansacOutput<E::Model>, RansacError> {
        let points_size = data.nrows();
        if points_size < self.params.sample_size {
            return Err(RansacError::InsufficientData {
                needed: self.params.sample_size,
                got: points_size,
            });
        }

        let start = Instant::now();
        let (best_model, best_score, iterations) = if self.params.parallel {
            self.search_parallel(data)
        } else {
            self.search_sequential(data)
        };

        let Some(mut model) = best_model else {
            return Err(RansacError::NoModelFound);
        };
        let mut score = best_score;
        if score.inlier_number == 0 {
            return Err(RansacError::NoModelFound);
        }

        if let Some(polisher) = &mut self.polisher {
            if let Some((polished, polished_score)) = polisher.refine(data, &model, &score) {
                if polished_score.is_better(&score) {
                    debug!(
                        "polisher improved support {} -> {}",
                        score.inlier_number, polished_score.inlier_number
                    );
                    model = polished;
                    score = polished_score;
                }
            }
        }

        let (inlier_mask, _errors, inlier_number) = self.quality.inliers(data, &model);
        if inlier_number == 0 {
            return Err(RansacError::NoModelFound);
        }
        let inliers = inlier_mask
            .iter()
            .enumerate()
            .filter_map(|(i, &is_inlier)| is_inlier.then_some(i))
            .collect();

        Ok(RansacOutput {
            model,
            inlier_mask,
            inliers,
            score,
            inlier_number,
            iterations,
            time_micros: start.elapsed().as_micros(),
        })
    }

    fn search_sequential(&mut self, data: &DataMatrix) -> (Option<E::Model>, Score, usize) {
        let points_size = data.nrows();
        let sample_size = self.params.sample_size;
        let is_sigma = self.params.local_optimization == LocalOptimMethod::Sigma;
        let use_lo = self.params.local_optimization != LocalOptimMethod::None;

        let mut termination = StandardTermination::new(
            self.params.confidence,
            points_size,
            sample_size,
            self.params.max_iterations,
        );
        let mut sample = vec![0usize; sample_size];
        let mut best_model: Option<E::Model> = None;
        let mut best_score = Score::worst();
        let mut max_iters = self.params.max_iterations;
        let mut iters = 0usize;

        'outer: while iters < max_iters {
            iters += 1;

            self.sampler.generate(&mut sample);
            if !self.estimator.is_sample_good(data, &sample) {
                continue;
            }

            let models = self.estimator.estimate(data, &sample);
            for model in &models {
                if !self.estimator.is_model_valid(data, model, &sample) {
                    continue;
                }
                if !self.verifier.is_model_good(data, model) {
                    continue;
                }

                let (candidate, current_score) = if is_sigma {
                    // Sigma-style optimization scores through the optimizer.
                    let seed_model = best_model.as_ref().unwrap_or(model);
                    match self
                        .local_optimizer
                        .as_mut()
                        .and_then(|lo| lo.refine(data, seed_model, &best_score))
                    {
                        Some((m, s)) => (m, s),
                        None => continue,
                    }
                } else {
                    let score = match self.verifier.score() {
                        Some(score) => score,
                        None => self.quality.score(data, model),
                    };
                    (model.clone(), score)
                };

                if !current_score.is_better(&best_score) {
                    continue;
                }

                match self
                    .degeneracy
                    .recover_if_degenerate(data, &sample, &candidate)
                {
                    Some((recovered, recovered_score)) => {
                        if recovered_score.is_better(&best_score) {
                            best_score = recovered_score;
                            best_model = Some(recovered);
                        } else {
                            // Degenerate and unrecoverable: drop the hypothesis.
                            continue;
                        }
                    }
                    None => {
                        best_score = current_score;
                        best_model = Some(candidate);
                    }
                }
                debug!(
                    "iteration {iters}: new best with {} inliers",
                    best_score.inlier_number
                );

                self.quality.set_best_score(best_score.value);
                max_iters = termination.update(best_score.inlier_number);
                if iters >= max_iters {
                    break 'outer;
                }

                if use_lo && !is_sigma {
                    let current_best = best_model.as_ref().expect("best model just set");
                    if let Some((lo_model, lo_score)) = self
                        .local_optimizer
                        .as_mut()
                        .and_then(|lo| lo.refine(data, current_best, &best_score))
                    {
                        if lo_score.is_better(&best_score) {
                            best_score = lo_score;
                            best_model = Some(lo_model);
                            self.quality.set_best_score(best_score.value);
                            self.verifier.update(best_score.inlier_number);
                            max_iters = termination.update(best_score.inlier_number);
                            if iters >= max_iters {
                                break 'outer;
                            }
                        }
                    }
                }
            }
        }

        (best_model, best_score, iters)
    }

    fn search_parallel(&mut self, data: &DataMatrix) -> (Option<E::Model>, Score, usize) {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let points_size = data.nrows();
        let sample_size = self.params.sample_size;
        let params = &self.params;
        let is_sigma = params.local_optimization == LocalOptimMethod::Sigma;
        let use_lo = params.local_optimization != LocalOptimMethod::None;

        let done = AtomicBool::new(false);
        let hypotheses_tested = AtomicUsize::new(0);
        let slots: Vec<Mutex<(Score, Option<E::Model>)>> = (0..workers)
            .map(|_| Mutex::new((Score::worst(), None)))
            .collect();

        // PROSAC's progressive schedule is global by construction; all
        // workers share the one sampler behind a mutex.
        let shared_sampler = (params.sampler == SamplingMethod::Prosac)
            .then(|| Arc::new(Mutex::new(self.sampler.clone_for_worker(params.seed))));

        let estimator = &self.estimator;
        let quality = &self.quality;
        let verifier = &self.verifier;
        let degeneracy = &self.degeneracy;
        let local_optimizer = &self.local_optimizer;
        let base_sampler = &self.sampler;

        (0..workers).into_par_iter().for_each(|worker_id| {
            let worker_seed = params.seed.wrapping_add(10 * (worker_id as u64 + 1));
            let estimator = estimator.clone();
            let mut quality = quality.clone_for_worker();
            let mut verifier = verifier.clone_for_worker(worker_seed + 1);
            let mut degeneracy = degeneracy.clone_for_worker(worker_seed + 2);
            let mut local_optimizer = local_optimizer
                .as_ref()
                .map(|lo| lo.clone_for_worker(worker_seed + 3));
            let mut sampler = match &shared_sampler {
                Some(shared) => WorkerSampler::Shared(Arc::clone(shared)),
                None => WorkerSampler::Owned(base_sampler.clone_for_worker(worker_seed)),
            };
            let mut termination = StandardTermination::new(
                params.confidence,
                points_size,
                sample_size,
                params.max_iterations,
            );

            let mut sample = vec![0usize; sample_size];
            let mut best_model: Option<E::Model> = None;
            // Own best (publishable) vs. the tightest bound seen anywhere.
            let mut best_score = Score::worst();
            let mut best_score_all = Score::worst();
            let mut max_iters = params.max_iterations;
            let mut iters = 0usize;

            'worker: while iters < max_iters && !done.load(Ordering::Acquire) {
                iters += 1;
                if hypotheses_tested.fetch_add(1, Ordering::AcqRel) > max_iters {
                    done.store(true, Ordering::Release);
                    break;
                }

                if iters % 10 == 0 {
                    // Adopt peers' published scores as pruning bounds only;
                    // the models stay with their owners.
                    for (peer, slot) in slots.iter().enumerate() {
                        if peer == worker_id {
                            continue;
                        }
                        let published = slot.lock().expect("slot mutex poisoned").0;
                        if published.is_better(&best_score_all) {
                            best_score_all = published;
                        }
                    }
                    if best_score_all.is_better(&best_score) {
                        quality.set_best_score(best_score_all.value);
                        verifier.update(best_score_all.inlier_number);
                    }
                }

                sampler.generate(&mut sample);
                if !estimator.is_sample_good(data, &sample) {
                    continue;
                }

                let models = estimator.estimate(data, &sample);
                for model in &models {
                    if !estimator.is_model_valid(data, model, &sample) {
                        continue;
                    }
                    if !verifier.is_model_good(data, model) {
                        continue;
                    }

                    let (candidate, current_score) = if is_sigma {
                        let seed_model = best_model.as_ref().unwrap_or(model);
                        match local_optimizer
                            .as_mut()
                            .and_then(|lo| lo.refine(data, seed_model, &best_score))
                        {
                            Some((m, s)) => (m, s),
                            None => continue,
                        }
                    } else {
                        let score = match verifier.score() {
                            Some(score) => score,
                            None => quality.score(data, model),
                        };
                        (model.clone(), score)
                    };

                    if !current_score.is_better(&best_score_all) {
                        continue;
                    }

                    let adopted = match degeneracy.recover_if_degenerate(data, &sample, &candidate)
                    {
                        Some((recovered, recovered_score)) => {
                            if recovered_score.is_better(&best_score) {
                                Some((recovered, recovered_score))
                            } else {
                                None
                            }
                        }
                        None => Some((candidate, current_score)),
                    };
                    let Some((new_model, new_score)) = adopted else {
                        continue;
                    };

                    best_score = new_score;
                    best_model = Some(new_model.clone());
                    if new_score.is_better(&best_score_all) {
                        best_score_all = new_score;
                    }
                    *slots[worker_id].lock().expect("slot mutex poisoned") =
                        (new_score, Some(new_model));
                    quality.set_best_score(best_score_all.value);

                    max_iters = termination.update(best_score.inlier_number);
                    if hypotheses_tested.load(Ordering::Acquire) > max_iters {
                        done.store(true, Ordering::Release);
                        break 'worker;
                    }

                    if use_lo && !is_sigma {
                        let current_best = best_model.as_ref().expect("best model just set");
                        if let Some((lo_model, lo_score)) = local_optimizer
                            .as_mut()
                            .and_then(|lo| lo.refine(data, current_best, &best_score))
                        {
                            if lo_score.is_better(&best_score) {
                                best_score = lo_score;
                                if lo_score.is_better(&best_score_all) {
                                    best_score_all = lo_score;
                                }
                                best_model = Some(lo_model.clone());
                                *slots[worker_id].lock().expect("slot mutex poisoned") =
                                    (lo_score, Some(lo_model));
                                quality.set_best_score(best_score_all.value);
                                verifier.update(best_score.inlier_number);
                                max_iters = termination.update(best_score.inlier_number);
                                if hypotheses_tested.load(Ordering::Acquire) > max_iters {
                                    done.store(true, Ordering::Release);
                                    break 'worker;
                                }
                            }
                        }
                    }
                }
            }
        });

        // Reduce the per-worker bests by score order.
        let mut best_score = Score::worst();
        let mut best_model = None;
        for slot in &slots {
            let (score, model) = std::mem::replace(
                &mut *slot.lock().expect("slot mutex poisoned"),
                (Score::worst(), None),
            );
            if model.is_some() && score.is_better(&best_score) {
                best_score = score;
                best_model = model;
            }
        }
        let iterations = hypotheses_tested.load(Ordering::Acquire);
        debug!(
            "parallel search finished after {iterations} hypotheses across {workers} workers"
        );
        (best_model, best_score, iterations)
    }
}
