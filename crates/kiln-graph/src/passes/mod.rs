//! Concrete passes, one per component kind.

mod blit;
mod callback;
mod dispatch;
mod draw;
mod filter;
mod group;

pub use blit::BlitPass;
pub use callback::CallbackPass;
pub use dispatch::DispatchPass;
pub use draw::{DrawPass, DrawSetup};
pub use filter::FilterPass;
pub use group::GroupPass;
