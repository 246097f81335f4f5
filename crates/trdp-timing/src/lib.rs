mod clock;
mod cycle;
mod micros;

pub use clock::{MockClock, init_mock_clock};
pub use cycle::Cycle;
pub use micros::Micros;
