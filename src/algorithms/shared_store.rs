//! The one piece of mutable state shared by every worker: the parameter
//! tensors, their gradient slots, and the shared Adam state. No mutual
//! exclusion anywhere on the data path; workers never block each other and
//! the price is torn snapshots and racing moment updates, which is the
//! asynchronous-SGD trade being modeled.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use itertools::Itertools;
use serde::Deserialize;
use tch::{nn, Device, TchError, Tensor};
use tracing::trace;

/// What `publish_gradients` does when it finds a slot already holding a
/// pending gradient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishPolicy {
    /// The first occupied slot ends the whole call; slots after it keep their
    /// pending gradients, slots before it were already overwritten. This is
    /// the behavior of the reference synchronization primitive and the
    /// default.
    WholeCallSkip,
    /// Occupied slots are stepped over individually.
    PerSlotSkip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// A pending gradient was found at this slot index and the call stopped
    /// there. Expected steady-state contention, never a fault.
    SkippedAt(usize),
}

pub struct SharedParameterStore {
    vs: nn::VarStore,
    names: Vec<String>,
    params: Vec<Tensor>,
    slots: Vec<Tensor>,
    filled: Vec<AtomicBool>,
    exp_avg: Vec<Tensor>,
    exp_avg_sq: Vec<Tensor>,
    step_count: AtomicI64,
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    clip_norm: f64,
    policy: PublishPolicy,
}

// SAFETY: all tensor storage behind this type is owned by libtorch; concurrent
// reads and writes through aliased handles race on float data but cannot
// produce dangling pointers or reallocation (shapes never change after
// construction). The slot occupancy flags are atomics. Torn values are
// gradient noise, accepted by the training scheme.
unsafe impl Sync for SharedParameterStore {}

impl SharedParameterStore {
    /// Takes ownership of a `VarStore` already populated with the model's
    /// parameters (and optionally restored from a checkpoint).
    pub fn new(vs: nn::VarStore, lr: f64, clip_norm: f64, policy: PublishPolicy) -> Self {
        let vars = vs.variables();
        let names: Vec<String> = vars.keys().cloned().sorted().collect();
        let params: Vec<Tensor> = names.iter().map(|n| vars[n].shallow_clone()).collect();
        let slots: Vec<Tensor> = params.iter().map(|p| p.zeros_like()).collect();
        let exp_avg: Vec<Tensor> = params.iter().map(|p| p.zeros_like()).collect();
        let exp_avg_sq: Vec<Tensor> = params.iter().map(|p| p.zeros_like()).collect();
        let filled = names.iter().map(|_| AtomicBool::new(false)).collect();

        Self {
            vs,
            names,
            params,
            slots,
            filled,
            exp_avg,
            exp_avg_sq,
            step_count: AtomicI64::new(0),
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            clip_norm,
            policy,
        }
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// Copies every shared tensor into the worker's private store. Runs
    /// against concurrent publishers, so a snapshot may be internally
    /// inconsistent across tensors; local training tolerates the staleness.
    pub fn snapshot(&self, local: &mut nn::VarStore) -> Result<(), TchError> {
        local.copy(&self.vs)
    }

    /// Clips the worker's local gradients to `clip_norm` (global 2-norm),
    /// then copies them into the shared slots, checking each slot for a
    /// pending gradient first. Under the default policy the first occupied
    /// slot ends the call for the entire remaining parameter list.
    pub fn publish_gradients(&self, local: &nn::VarStore) -> PublishOutcome {
        let vars = local.variables();
        let mut grads: Vec<Option<Tensor>> = self
            .names
            .iter()
            .map(|n| {
                vars.get(n)
                    .map(|v| v.grad())
                    .filter(|g| g.defined())
            })
            .collect();

        self.clip_to_norm(&mut grads);

        for (ix, grad) in grads.iter().enumerate() {
            if self.filled[ix].load(Ordering::Acquire) {
                match self.policy {
                    PublishPolicy::WholeCallSkip => {
                        trace!(slot = ix, "pending gradient, publish skipped");
                        return PublishOutcome::SkippedAt(ix);
                    }
                    PublishPolicy::PerSlotSkip => continue,
                }
            }
            if let Some(grad) = grad {
                let mut slot = self.slots[ix].shallow_clone();
                slot.copy_(grad);
                self.filled[ix].store(true, Ordering::Release);
            }
        }
        PublishOutcome::Published
    }

    fn clip_to_norm(&self, grads: &mut [Option<Tensor>]) {
        let mut total_sq = 0f64;
        for grad in grads.iter().flatten() {
            let norm = f64::try_from(grad.norm()).unwrap();
            total_sq += norm * norm;
        }
        let total = total_sq.sqrt();
        if total > self.clip_norm {
            let scale = self.clip_norm / (total + 1e-6);
            for grad in grads.iter_mut().flatten() {
                let scaled = &*grad * scale;
                grad.copy_(&scaled);
            }
        }
    }

    /// One shared Adam step over the filled slots, which are cleared and
    /// handed back to the next publisher. Racing steppers interleave
    /// arbitrarily; a zero gradient in a slot is a no-op on the parameters.
    pub fn step(&self) {
        let t = self.step_count.fetch_add(1, Ordering::Relaxed) + 1;
        let bias1 = 1. - self.beta1.powi(t as i32);
        let bias2 = 1. - self.beta2.powi(t as i32);

        tch::no_grad(|| {
            for ix in 0..self.params.len() {
                if !self.filled[ix].load(Ordering::Acquire) {
                    continue;
                }
                let grad = &self.slots[ix];

                let new_m = &self.exp_avg[ix] * self.beta1 + grad * (1. - self.beta1);
                let mut m = self.exp_avg[ix].shallow_clone();
                m.copy_(&new_m);

                let new_v = &self.exp_avg_sq[ix] * self.beta2 + (grad * grad) * (1. - self.beta2);
                let mut v = self.exp_avg_sq[ix].shallow_clone();
                v.copy_(&new_v);

                let m_hat = &self.exp_avg[ix] / bias1;
                let v_hat = &self.exp_avg_sq[ix] / bias2;
                let update = m_hat / (v_hat.sqrt() + self.eps) * self.lr;

                let new_p = &self.params[ix] - &update;
                let mut p = self.params[ix].shallow_clone();
                p.copy_(&new_p);

                self.filled[ix].store(false, Ordering::Release);
            }
        });
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn optimizer_steps(&self) -> i64 {
        self.step_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tch::Kind;

    fn build_vs(fill: f64) -> nn::VarStore {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let _a = root.var("a", &[2], nn::Init::Const(fill));
        let _b = root.var("b", &[3], nn::Init::Const(fill));
        vs
    }

    fn store(policy: PublishPolicy) -> SharedParameterStore {
        SharedParameterStore::new(build_vs(1.0), 1e-3, 40., policy)
    }

    fn backward_with(local: &nn::VarStore, coeff: f64) {
        // gives every local parameter a defined gradient of `coeff`
        let vars = local.variables();
        let mut loss = Tensor::zeros([1], (Kind::Float, Device::Cpu));
        for (_, v) in vars.iter() {
            loss = loss + (v * coeff).sum(Kind::Float);
        }
        loss.backward();
    }

    fn param_values(store: &SharedParameterStore) -> Vec<Vec<f64>> {
        store
            .params
            .iter()
            .map(|p| Vec::<f64>::try_from(p.to_kind(Kind::Double)).unwrap())
            .collect()
    }

    #[test]
    fn test_snapshot_copies_shared_values() {
        let store = store(PublishPolicy::WholeCallSkip);
        let mut local = build_vs(0.0);
        store.snapshot(&mut local).unwrap();
        for (_, v) in local.variables() {
            let vals = Vec::<f64>::try_from(v.to_kind(Kind::Double)).unwrap();
            assert!(vals.iter().all(|x| (*x - 1.0).abs() < 1e-9));
        }
    }

    #[test]
    fn test_zero_gradient_publish_is_a_noop() {
        let store = store(PublishPolicy::WholeCallSkip);
        let before = param_values(&store);
        let mut local = build_vs(0.0);
        store.snapshot(&mut local).unwrap();
        for _ in 0..3 {
            for (_, mut v) in local.variables() {
                v.zero_grad();
            }
            backward_with(&local, 0.0);
            assert_eq!(store.publish_gradients(&local), PublishOutcome::Published);
            store.step();
        }
        assert_eq!(param_values(&store), before);
    }

    #[test]
    fn test_nonzero_gradient_moves_parameters() {
        let store = store(PublishPolicy::WholeCallSkip);
        let before = param_values(&store);
        let mut local = build_vs(0.0);
        store.snapshot(&mut local).unwrap();
        backward_with(&local, 1.0);
        store.publish_gradients(&local);
        store.step();
        let after = param_values(&store);
        for (b, a) in before.iter().flatten().zip(after.iter().flatten()) {
            assert!(a < b, "positive gradient must lower the parameter");
            assert!(a.is_finite());
        }
        // slots were handed back
        assert!(store.filled.iter().all(|f| !f.load(Ordering::Acquire)));
    }

    #[test]
    fn test_whole_call_skip_preserves_pending_slots() {
        let store = store(PublishPolicy::WholeCallSkip);
        // slot 1 ("b") holds another worker's pending gradient
        {
            let mut slot = store.slots[1].shallow_clone();
            slot.copy_(&Tensor::from_slice(&[9f32, 9., 9.]));
            store.filled[1].store(true, Ordering::Release);
        }
        let mut local = build_vs(0.0);
        store.snapshot(&mut local).unwrap();
        backward_with(&local, 1.0);
        let outcome = store.publish_gradients(&local);
        assert_eq!(outcome, PublishOutcome::SkippedAt(1));
        // slot before the occupied one was written, the pending one was not
        let a = Vec::<f64>::try_from(store.slots[0].to_kind(Kind::Double)).unwrap();
        assert!(a.iter().all(|x| (*x - 1.0).abs() < 1e-6));
        let b = Vec::<f64>::try_from(store.slots[1].to_kind(Kind::Double)).unwrap();
        assert!(b.iter().all(|x| (*x - 9.0).abs() < 1e-6));
    }

    #[test]
    fn test_per_slot_skip_fills_remaining_slots() {
        let store = store(PublishPolicy::PerSlotSkip);
        store.filled[0].store(true, Ordering::Release);
        let mut local = build_vs(0.0);
        store.snapshot(&mut local).unwrap();
        backward_with(&local, 1.0);
        assert_eq!(store.publish_gradients(&local), PublishOutcome::Published);
        let b = Vec::<f64>::try_from(store.slots[1].to_kind(Kind::Double)).unwrap();
        assert!(b.iter().all(|x| (*x - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_gradients_clip_to_global_norm() {
        let store = SharedParameterStore::new(build_vs(1.0), 1e-3, 1.0, PublishPolicy::WholeCallSkip);
        let mut local = build_vs(0.0);
        store.snapshot(&mut local).unwrap();
        backward_with(&local, 100.0);
        store.publish_gradients(&local);
        let mut total_sq = 0f64;
        for slot in &store.slots {
            let n = f64::try_from(slot.norm()).unwrap();
            total_sq += n * n;
        }
        assert!(total_sq.sqrt() <= 1.0 + 1e-4);
    }

    #[test]
    fn test_concurrent_publish_and_step_do_not_corrupt() {
        let store = Arc::new(store(PublishPolicy::WholeCallSkip));
        let mut handles = Vec::new();
        for seed in 0..3 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                let mut local = build_vs(0.0);
                for _ in 0..25 {
                    store.snapshot(&mut local).unwrap();
                    for (_, mut v) in local.variables() {
                        v.zero_grad();
                    }
                    backward_with(&local, 0.01 * (seed + 1) as f64);
                    store.publish_gradients(&local);
                    store.step();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for vals in param_values(&store) {
            assert!(vals.iter().all(|x| x.is_finite()));
        }
    }
}
