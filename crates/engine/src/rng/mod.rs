//! Per-thread random number generation for the perturbation backends.
//!
//! Every backend keeps one [`RngState`] per thread (plus a single shadow
//! slot for seed push/pop). The state is seeded lazily on the first draw:
//! from `seed ^ thread_id` when the user fixed a seed, from OS entropy
//! otherwise. Thread ids come from a process-wide monotonic counter so that
//! fixed-seed runs are repeatable regardless of how the OS numbers threads.
//!
//! Reproducibility is guaranteed only for a fixed seed within this
//! implementation; the underlying generator is not part of the contract.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::RngCore;
use rand::SeedableRng;
use rand::distributions::Open01;
use rand::rngs::SmallRng;

/// Process-wide source of per-thread identifiers.
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static THREAD_ID: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Returns this thread's engine-assigned identifier, allocating one on
/// first use. Ids are monotonic and collision-free across the process.
pub fn thread_id() -> u64 {
    THREAD_ID.with(|slot| match slot.get() {
        Some(id) => id,
        None => {
            let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
            slot.set(Some(id));
            id
        }
    })
}

/// Random state owned by a single thread.
///
/// Holds the seeding policy and, once the first draw happens, the live
/// generator. Dropping the generator (via [`RngState::reseed`]) makes the
/// next draw reseed.
#[derive(Clone, Debug)]
pub struct RngState {
    prng: Option<SmallRng>,
    choose_seed: bool,
    seed: u64,
}

impl RngState {
    /// A state that will seed itself from entropy on first use.
    pub const fn new() -> Self {
        Self {
            prng: None,
            choose_seed: false,
            seed: 0,
        }
    }

    /// Installs a new seeding policy and invalidates the live generator.
    pub fn reseed(&mut self, choose_seed: bool, seed: u64) {
        self.prng = None;
        self.choose_seed = choose_seed;
        self.seed = seed;
    }

    /// Propagates the context's seeding policy to this thread, unless a
    /// generator is already live. Called on every perturbation so that
    /// threads spawned after configuration pick the configured seed up.
    pub fn ensure_config(&mut self, choose_seed: bool, seed: u64) {
        if self.prng.is_none() {
            self.choose_seed = choose_seed;
            self.seed = seed;
        }
    }

    fn prng(&mut self) -> &mut SmallRng {
        let choose_seed = self.choose_seed;
        let seed = self.seed;
        self.prng.get_or_insert_with(|| {
            if choose_seed {
                SmallRng::seed_from_u64(seed ^ thread_id())
            } else {
                SmallRng::from_entropy()
            }
        })
    }

    /// Returns a uniform 64-bit value.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        self.prng().next_u64()
    }

    /// Returns a uniform double in the open interval `(0, 1)`.
    #[inline]
    pub fn next_unit_open(&mut self) -> f64 {
        rand::Rng::sample(self.prng(), Open01)
    }

    /// Sparsity gate: returns `true` when the current operation must skip
    /// its perturbation. `sparsity >= 1` never skips and draws nothing.
    #[inline]
    pub fn skip_eval(&mut self, sparsity: f32) -> bool {
        if sparsity >= 1.0 {
            return false;
        }
        self.next_unit_open() > f64::from(sparsity)
    }
}

impl Default for RngState {
    fn default() -> Self {
        Self::new()
    }
}

/// A thread's random state together with its single save slot.
///
/// `push_seed` stashes the live state and restarts from a fixed seed so an
/// external controller can evaluate a perturbed sequence deterministically;
/// `pop_seed` resumes the stashed stream. The slot has depth one: push and
/// pop must be balanced by the caller.
#[derive(Debug, Default)]
pub struct SeedSlot {
    state: RngState,
    shadow: Option<RngState>,
}

impl SeedSlot {
    /// An empty slot with an entropy-seeded state.
    pub const fn new() -> Self {
        Self {
            state: RngState::new(),
            shadow: None,
        }
    }

    /// The live state.
    #[inline]
    pub fn state(&mut self) -> &mut RngState {
        &mut self.state
    }

    /// Saves the live state and restarts from `seed`.
    pub fn push_seed(&mut self, seed: u64) {
        let mut fresh = RngState::new();
        fresh.reseed(true, seed);
        self.shadow = Some(std::mem::replace(&mut self.state, fresh));
    }

    /// Restores the state saved by the last [`SeedSlot::push_seed`].
    pub fn pop_seed(&mut self) {
        if let Some(saved) = self.shadow.take() {
            self.state = saved;
        }
    }
}
