mod calc;
mod compensator;
mod distribution;
mod equipment;
mod network;
mod opt;
mod order;
mod phasor;
mod regulator;
mod result;
mod sweep;
mod traits;

pub mod debug;
pub mod demo;

#[cfg(test)]
mod tests;

pub use calc::*;
pub use compensator::*;
pub use distribution::*;
pub use equipment::*;
pub use network::*;
pub use opt::*;
pub use order::*;
pub use phasor::*;
pub use regulator::*;
pub use result::*;
pub use sweep::*;
pub use traits::*;
