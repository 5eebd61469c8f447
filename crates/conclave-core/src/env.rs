//! Environment abstraction for deterministic testing.
//!
//! Decouples protocol logic from system resources (time, randomness). Tests
//! run against a virtual clock and a seeded RNG; production uses real system
//! time and OS entropy.

use std::time::Duration;

/// Abstract environment providing time, randomness, and async sleeping.
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `random_bytes()` uses cryptographically secure entropy in production
pub trait Environment: Clone + Send + Sync + 'static {
    /// The specific instant type used by this environment.
    ///
    /// Production environments use `std::time::Instant`; the mock uses a
    /// plain offset from its epoch.
    type Instant: Copy
        + Ord
        + Send
        + Sync
        + std::fmt::Debug
        + std::ops::Sub<Output = Duration>
        + std::ops::Add<Duration, Output = Self::Instant>;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    ///
    /// The only async method in the trait. Protocol logic should compare
    /// instants; only driver-level code (retry loops, timeouts) sleeps.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`, for jitter and identifiers.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }
}

/// Production environment using system time and cryptographic RNG.
///
/// # Panics
///
/// Panics if the OS RNG fails. This is intentional: a client without
/// functioning cryptographic randomness cannot operate securely, and RNG
/// failure indicates OS-level breakage.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG failure is unrecoverable for an E2E client");
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    //! Deterministic environment for tests.

    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use rand_chacha::ChaCha20Rng;
    use rand_chacha::rand_core::{RngCore, SeedableRng};

    use super::Environment;

    struct MockState {
        now: Duration,
        rng: ChaCha20Rng,
    }

    /// Deterministic environment with a virtual clock and a seeded RNG.
    ///
    /// Clones share state, so time advanced through one handle is visible to
    /// all. `sleep` advances the virtual clock and returns immediately,
    /// which makes timeout and backoff paths run at full speed in tests.
    #[derive(Clone)]
    pub struct MockEnv {
        state: Arc<Mutex<MockState>>,
    }

    impl MockEnv {
        /// Environment seeded with zeroes, starting at its epoch.
        #[must_use]
        pub fn new() -> Self {
            Self::with_seed(0)
        }

        /// Environment with a specific RNG seed.
        #[must_use]
        pub fn with_seed(seed: u64) -> Self {
            Self {
                state: Arc::new(Mutex::new(MockState {
                    now: Duration::ZERO,
                    rng: ChaCha20Rng::seed_from_u64(seed),
                })),
            }
        }

        /// Advance the virtual clock.
        ///
        /// # Panics
        ///
        /// Panics if the internal mutex is poisoned.
        #[allow(clippy::expect_used)]
        pub fn advance(&self, by: Duration) {
            let mut state = self.state.lock().expect("MockEnv mutex poisoned");
            state.now += by;
        }
    }

    impl Default for MockEnv {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Completes on the second poll, waking itself after the first.
    ///
    /// Gives already-ready futures a chance to win `select!` races against a
    /// mock sleep, mirroring how a real timer always loses to ready work.
    fn yield_once() -> impl std::future::Future<Output = ()> + Send {
        let mut yielded = false;
        std::future::poll_fn(move |cx| {
            if yielded {
                std::task::Poll::Ready(())
            } else {
                yielded = true;
                cx.waker().wake_by_ref();
                std::task::Poll::Pending
            }
        })
    }

    #[allow(clippy::expect_used)]
    impl Environment for MockEnv {
        type Instant = Duration;

        fn now(&self) -> Self::Instant {
            self.state.lock().expect("MockEnv mutex poisoned").now
        }

        fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            let env = self.clone();
            async move {
                env.advance(duration);
                yield_once().await;
            }
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            let mut state = self.state.lock().expect("MockEnv mutex poisoned");
            state.rng.fill_bytes(buffer);
        }
    }
}
