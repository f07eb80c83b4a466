// Trading strategy module
pub mod budget;
pub mod swing;

pub use budget::order_budget;
pub use swing::{SwingParams, SwingStrategy};
