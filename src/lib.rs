pub mod broker;
pub mod controller;
pub mod hex;
pub mod life;
pub mod net;
pub mod worker;

mod error;

pub use error::Error;
