use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use once_cell::sync::OnceCell;

use crate::Micros;

/// Process-global time source. Defaults to the system wall clock; tests
/// install a [`MockClock`] once per process and advance it by hand so
/// interval and timeout logic runs without real sleeps.
pub(crate) enum GlobalClock {
    System,
    Mock(Arc<MockClock>),
}

impl GlobalClock {
    #[inline]
    pub(crate) fn now(&self) -> Micros {
        match self {
            GlobalClock::System => {
                let since_epoch = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or(std::time::Duration::ZERO);
                Micros(since_epoch.as_micros() as u64)
            }
            GlobalClock::Mock(mock) => Micros(mock.micros.load(Ordering::Acquire)),
        }
    }
}

/// Manually advanced clock for tests.
#[derive(Debug, Default)]
pub struct MockClock {
    micros: AtomicU64,
}

impl MockClock {
    pub fn advance(&self, delta: Micros) {
        self.micros.fetch_add(delta.0, Ordering::AcqRel);
    }

    pub fn set(&self, now: Micros) {
        self.micros.store(now.0, Ordering::Release);
    }
}

static GLOBAL_CLOCK: OnceCell<GlobalClock> = OnceCell::new();

/// Install the mock clock. Must run before the first `Micros::now()` of the
/// process; returns the controller used to advance time.
pub fn init_mock_clock() -> Arc<MockClock> {
    let controller = Arc::new(MockClock::default());
    let installed = GLOBAL_CLOCK.get_or_init(|| GlobalClock::Mock(Arc::clone(&controller)));
    assert!(
        matches!(installed, GlobalClock::Mock(m) if Arc::ptr_eq(m, &controller)),
        "global clock already initialized, init_mock_clock must run first"
    );
    controller.advance(Micros(1));
    controller
}

#[inline]
pub(crate) fn global_clock() -> &'static GlobalClock {
    GLOBAL_CLOCK.get_or_init(|| GlobalClock::System)
}
