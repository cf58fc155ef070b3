mod index;
mod xorshift;

pub use index::{FromIndex, IntoIndex};
pub use xorshift::Xorshift64;
