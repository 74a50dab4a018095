//! Body handling: content-encoding codec and cached decoded views.

pub mod codec;
mod view;

pub use codec::{decode, encode, CodecError, Encoding};
pub use view::{CapturedBody, DecodeError};
